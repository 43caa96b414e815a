use crate::MailboxResult;
use ainp_storage::{ConsentState, ContactRecord, ContactStore};
use ainp_types::Did;
use std::sync::Arc;

/// Contacts and consent.
///
/// The first successful delivery between a pair creates the edge with
/// `consent = unknown`; later interactions bump the counter. Allow/block
/// flip consent and are what the greylist short-circuits on.
pub struct ContactService {
    storage: Arc<dyn ContactStore>,
}

impl ContactService {
    pub fn new(storage: Arc<dyn ContactStore>) -> Self {
        Self { storage }
    }

    pub async fn get(&self, owner: &Did, peer: &Did) -> MailboxResult<Option<ContactRecord>> {
        Ok(self.storage.get_contact(owner, peer).await?)
    }

    /// Consent for the edge; `Unknown` when no edge exists yet.
    pub async fn consent_of(&self, owner: &Did, peer: &Did) -> MailboxResult<ConsentState> {
        Ok(self
            .storage
            .get_contact(owner, peer)
            .await?
            .map(|c| c.consent)
            .unwrap_or(ConsentState::Unknown))
    }

    /// Record one delivery between the pair.
    pub async fn record_interaction(
        &self,
        owner: &Did,
        peer: &Did,
    ) -> MailboxResult<ContactRecord> {
        Ok(self
            .storage
            .record_interaction(owner, peer, chrono::Utc::now())
            .await?)
    }

    pub async fn allow(&self, owner: &Did, peer: &Did) -> MailboxResult<ContactRecord> {
        Ok(self
            .storage
            .set_consent(owner, peer, ConsentState::Allowed)
            .await?)
    }

    pub async fn block(&self, owner: &Did, peer: &Did) -> MailboxResult<ContactRecord> {
        Ok(self
            .storage
            .set_consent(owner, peer, ConsentState::Blocked)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_storage::memory::InMemoryBrokerStorage;

    fn did(s: &str) -> Did {
        Did::parse(s).unwrap()
    }

    fn service() -> ContactService {
        ContactService::new(Arc::new(InMemoryBrokerStorage::new()))
    }

    #[tokio::test]
    async fn first_interaction_creates_unknown_edge() {
        let contacts = service();
        let owner = did("did:key:aa");
        let peer = did("did:key:bb");

        assert_eq!(
            contacts.consent_of(&owner, &peer).await.unwrap(),
            ConsentState::Unknown
        );

        let edge = contacts.record_interaction(&owner, &peer).await.unwrap();
        assert_eq!(edge.interaction_count, 1);
        assert_eq!(edge.consent, ConsentState::Unknown);

        let edge = contacts.record_interaction(&owner, &peer).await.unwrap();
        assert_eq!(edge.interaction_count, 2);
    }

    #[tokio::test]
    async fn allow_and_block_flip_consent() {
        let contacts = service();
        let owner = did("did:key:aa");
        let peer = did("did:key:bb");

        contacts.allow(&owner, &peer).await.unwrap();
        assert_eq!(
            contacts.consent_of(&owner, &peer).await.unwrap(),
            ConsentState::Allowed
        );

        contacts.block(&owner, &peer).await.unwrap();
        assert_eq!(
            contacts.consent_of(&owner, &peer).await.unwrap(),
            ConsentState::Blocked
        );
    }

    #[tokio::test]
    async fn edges_are_directional() {
        let contacts = service();
        let owner = did("did:key:aa");
        let peer = did("did:key:bb");

        contacts.allow(&owner, &peer).await.unwrap();
        assert_eq!(
            contacts.consent_of(&peer, &owner).await.unwrap(),
            ConsentState::Unknown
        );
    }
}
