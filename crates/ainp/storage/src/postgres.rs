//! PostgreSQL adapter: the transactional source-of-truth backend.
//!
//! Capability embeddings live in a pgvector `vector(1536)` column with an
//! HNSW index; similarity search happens in SQL. Aggregate-coupled writes
//! (message + thread, account + journal entry) run inside one transaction
//! with row locks, which is what upholds the invariants under concurrency.

use crate::model::{
    AccountRecord, AgentRecord, CapabilityRecord, CapabilitySearchHit, ConsentState,
    ContactRecord, InboxQuery, LedgerEntryRecord, LedgerEntryType, MessageRecord,
    NegotiationFilter, NegotiationRecord, PaymentRequestRecord, PaymentState,
    ReputationRecord, StoreOutcome, ThreadRecord, TrustRecord,
};
use crate::traits::{
    AccountStore, AgentStore, ContactStore, MailboxStore, NegotiationStore, PaymentStore,
    Probe, ProofStore, QueryWindow, ReceiptStore,
};
use crate::{StorageError, StorageResult};
use ainp_types::{
    Attestation, Did, IncentiveSplit, NegotiationState, Proposal, ReceiptStatus, Round,
    TaskReceipt, TrustVector, UsefulnessProof,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

/// PostgreSQL-backed broker storage adapter.
#[derive(Clone)]
pub struct PostgresBrokerStorage {
    pool: PgPool,
}

impl PostgresBrokerStorage {
    /// Connect and initialize required schema.
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        Self::connect_with_options(database_url, 10, 5).await
    }

    /// Connect with explicit pool parameters.
    pub async fn connect_with_options(
        database_url: &str,
        max_connections: u32,
        connect_timeout_secs: u64,
    ) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(std::time::Duration::from_secs(connect_timeout_secs))
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Backend(format!("failed to connect postgres: {e}")))?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create adapter from an existing pool.
    pub async fn from_pool(pool: PgPool) -> StorageResult<Self> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Liveness probe for the readiness endpoint.
    pub async fn ping(&self) -> StorageResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn init_schema(&self) -> StorageResult<()> {
        let ddl = [
            "CREATE EXTENSION IF NOT EXISTS vector",
            r#"
            CREATE TABLE IF NOT EXISTS ainp_agents (
                did TEXT PRIMARY KEY,
                endpoint TEXT,
                public_key_hex TEXT,
                ttl_seconds BIGINT NOT NULL,
                usefulness_cached DOUBLE PRECISION NOT NULL DEFAULT 0,
                usefulness_updated_at TIMESTAMPTZ,
                registered_at TIMESTAMPTZ NOT NULL,
                last_seen TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_capabilities (
                id UUID PRIMARY KEY,
                agent_did TEXT NOT NULL REFERENCES ainp_agents(did),
                description TEXT NOT NULL,
                embedding vector(1536) NOT NULL,
                tags TEXT[] NOT NULL DEFAULT '{}',
                version TEXT NOT NULL,
                credential_ref TEXT,
                updated_at TIMESTAMPTZ NOT NULL,
                UNIQUE (agent_did, description)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ainp_capabilities_embedding_idx
                ON ainp_capabilities
             USING hnsw (embedding vector_cosine_ops)
              WITH (m = 16, ef_construction = 64)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_trust_scores (
                agent_did TEXT PRIMARY KEY,
                reliability DOUBLE PRECISION NOT NULL,
                honesty DOUBLE PRECISION NOT NULL,
                competence DOUBLE PRECISION NOT NULL,
                timeliness DOUBLE PRECISION NOT NULL,
                decay_rate DOUBLE PRECISION NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_messages (
                id UUID PRIMARY KEY,
                owner_did TEXT NOT NULL,
                envelope_id TEXT NOT NULL,
                from_did TEXT NOT NULL,
                conversation_id TEXT NOT NULL,
                msg_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                read BOOLEAN NOT NULL DEFAULT FALSE,
                labels TEXT[] NOT NULL DEFAULT '{}',
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (owner_did, envelope_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ainp_messages_owner_created_idx
                ON ainp_messages (owner_did, created_at DESC, id DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_threads (
                conversation_id TEXT NOT NULL,
                owner_did TEXT NOT NULL,
                participants TEXT[] NOT NULL DEFAULT '{}',
                last_message_at TIMESTAMPTZ NOT NULL,
                message_count BIGINT NOT NULL DEFAULT 0,
                unread_count BIGINT NOT NULL DEFAULT 0,
                PRIMARY KEY (conversation_id, owner_did)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_contacts (
                owner_did TEXT NOT NULL,
                peer_did TEXT NOT NULL,
                first_seen_at TIMESTAMPTZ NOT NULL,
                interaction_count BIGINT NOT NULL DEFAULT 0,
                consent TEXT NOT NULL DEFAULT 'unknown',
                PRIMARY KEY (owner_did, peer_did)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_negotiations (
                id TEXT PRIMARY KEY,
                intent_id TEXT NOT NULL,
                initiator_did TEXT NOT NULL,
                responder_did TEXT NOT NULL,
                state TEXT NOT NULL,
                max_rounds INTEGER NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL,
                rounds JSONB NOT NULL DEFAULT '[]',
                current_proposal JSONB,
                final_proposal JSONB,
                convergence_score DOUBLE PRECISION NOT NULL DEFAULT 0,
                incentive_split JSONB NOT NULL,
                reserved_credits BIGINT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_credit_accounts (
                owner_did TEXT PRIMARY KEY,
                balance BIGINT NOT NULL,
                reserved BIGINT NOT NULL DEFAULT 0,
                lifetime_earned BIGINT NOT NULL DEFAULT 0,
                lifetime_spent BIGINT NOT NULL DEFAULT 0,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_ledger_entries (
                id UUID PRIMARY KEY,
                owner_did TEXT NOT NULL,
                entry_type TEXT NOT NULL,
                amount BIGINT NOT NULL,
                intent_id TEXT,
                proof_id TEXT,
                at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_payment_requests (
                id TEXT PRIMARY KEY,
                owner_did TEXT NOT NULL,
                amount_atomic BIGINT NOT NULL,
                currency TEXT NOT NULL,
                method TEXT NOT NULL,
                state TEXT NOT NULL,
                payment_url TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                expires_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_usefulness_proofs (
                id TEXT PRIMARY KEY,
                intent_id TEXT NOT NULL,
                agent_did TEXT NOT NULL,
                work_type TEXT NOT NULL,
                metrics JSONB NOT NULL DEFAULT '{}',
                attestations JSONB NOT NULL DEFAULT '[]',
                trace_id TEXT NOT NULL,
                usefulness_score DOUBLE PRECISION NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS ainp_proofs_agent_created_idx
                ON ainp_usefulness_proofs (agent_did, created_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_task_receipts (
                id TEXT PRIMARY KEY,
                negotiation_id TEXT NOT NULL,
                agent_did TEXT NOT NULL,
                client_did TEXT NOT NULL,
                k INTEGER NOT NULL,
                m INTEGER NOT NULL,
                committee JSONB NOT NULL DEFAULT '[]',
                attestations JSONB NOT NULL DEFAULT '[]',
                status TEXT NOT NULL,
                finalized_at TIMESTAMPTZ,
                created_at TIMESTAMPTZ NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ainp_reputation (
                agent_did TEXT PRIMARY KEY,
                dimensions JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        ];

        for stmt in ddl {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("schema init failed: {e}")))?;
        }
        Ok(())
    }
}

fn parse_did(raw: &str) -> StorageResult<Did> {
    Did::parse(raw).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn vector_literal(embedding: &[f32]) -> String {
    let parts: Vec<String> = embedding.iter().map(|v| v.to_string()).collect();
    format!("[{}]", parts.join(","))
}

fn parse_vector(text: &str) -> Vec<f32> {
    text.trim_matches(['[', ']'])
        .split(',')
        .filter_map(|v| v.trim().parse::<f32>().ok())
        .collect()
}

fn from_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> StorageResult<T> {
    serde_json::from_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> StorageResult<serde_json::Value> {
    serde_json::to_value(value).map_err(|e| StorageError::Serialization(e.to_string()))
}

fn agent_from_row(row: &PgRow) -> StorageResult<AgentRecord> {
    Ok(AgentRecord {
        did: parse_did(&row.try_get::<String, _>("did").map_err(db_err)?)?,
        endpoint: row.try_get("endpoint").map_err(db_err)?,
        public_key_hex: row.try_get("public_key_hex").map_err(db_err)?,
        ttl_seconds: row.try_get::<i64, _>("ttl_seconds").map_err(db_err)? as u64,
        usefulness_cached: row.try_get("usefulness_cached").map_err(db_err)?,
        usefulness_updated_at: row.try_get("usefulness_updated_at").map_err(db_err)?,
        registered_at: row.try_get("registered_at").map_err(db_err)?,
        last_seen: row.try_get("last_seen").map_err(db_err)?,
    })
}

fn message_from_row(row: &PgRow) -> StorageResult<MessageRecord> {
    let msg_type: String = row.try_get("msg_type").map_err(db_err)?;
    Ok(MessageRecord {
        id: row.try_get("id").map_err(db_err)?,
        owner_did: parse_did(&row.try_get::<String, _>("owner_did").map_err(db_err)?)?,
        envelope_id: row.try_get("envelope_id").map_err(db_err)?,
        from_did: parse_did(&row.try_get::<String, _>("from_did").map_err(db_err)?)?,
        conversation_id: row.try_get("conversation_id").map_err(db_err)?,
        msg_type: serde_json::from_value(serde_json::Value::String(msg_type))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        payload: from_json(row.try_get::<serde_json::Value, _>("payload").map_err(db_err)?)?,
        read: row.try_get("read").map_err(db_err)?,
        labels: row.try_get("labels").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn thread_from_row(row: &PgRow) -> StorageResult<ThreadRecord> {
    let participants: Vec<String> = row.try_get("participants").map_err(db_err)?;
    Ok(ThreadRecord {
        conversation_id: row.try_get("conversation_id").map_err(db_err)?,
        owner_did: parse_did(&row.try_get::<String, _>("owner_did").map_err(db_err)?)?,
        participants: participants
            .iter()
            .map(|p| parse_did(p))
            .collect::<StorageResult<Vec<_>>>()?,
        last_message_at: row.try_get("last_message_at").map_err(db_err)?,
        message_count: row.try_get("message_count").map_err(db_err)?,
        unread_count: row.try_get("unread_count").map_err(db_err)?,
    })
}

fn negotiation_from_row(row: &PgRow) -> StorageResult<NegotiationRecord> {
    let state: String = row.try_get("state").map_err(db_err)?;
    let current_proposal: Option<serde_json::Value> =
        row.try_get("current_proposal").map_err(db_err)?;
    let final_proposal: Option<serde_json::Value> =
        row.try_get("final_proposal").map_err(db_err)?;
    Ok(NegotiationRecord {
        id: row.try_get("id").map_err(db_err)?,
        intent_id: row.try_get("intent_id").map_err(db_err)?,
        initiator_did: parse_did(&row.try_get::<String, _>("initiator_did").map_err(db_err)?)?,
        responder_did: parse_did(&row.try_get::<String, _>("responder_did").map_err(db_err)?)?,
        state: serde_json::from_value::<NegotiationState>(serde_json::Value::String(state))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        max_rounds: row.try_get::<i32, _>("max_rounds").map_err(db_err)? as u32,
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
        rounds: from_json::<Vec<Round>>(row.try_get("rounds").map_err(db_err)?)?,
        current_proposal: current_proposal.map(from_json::<Proposal>).transpose()?,
        final_proposal: final_proposal.map(from_json::<Proposal>).transpose()?,
        convergence_score: row.try_get("convergence_score").map_err(db_err)?,
        incentive_split: from_json::<IncentiveSplit>(
            row.try_get("incentive_split").map_err(db_err)?,
        )?,
        reserved_credits: row.try_get("reserved_credits").map_err(db_err)?,
    })
}

fn account_from_row(row: &PgRow) -> StorageResult<AccountRecord> {
    Ok(AccountRecord {
        owner_did: parse_did(&row.try_get::<String, _>("owner_did").map_err(db_err)?)?,
        balance: row.try_get("balance").map_err(db_err)?,
        reserved: row.try_get("reserved").map_err(db_err)?,
        lifetime_earned: row.try_get("lifetime_earned").map_err(db_err)?,
        lifetime_spent: row.try_get("lifetime_spent").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
    })
}

fn payment_from_row(row: &PgRow) -> StorageResult<PaymentRequestRecord> {
    let state: String = row.try_get("state").map_err(db_err)?;
    Ok(PaymentRequestRecord {
        id: row.try_get("id").map_err(db_err)?,
        owner_did: parse_did(&row.try_get::<String, _>("owner_did").map_err(db_err)?)?,
        amount_atomic: row.try_get("amount_atomic").map_err(db_err)?,
        currency: row.try_get("currency").map_err(db_err)?,
        method: row.try_get("method").map_err(db_err)?,
        state: serde_json::from_value(serde_json::Value::String(state))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        payment_url: row.try_get("payment_url").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        expires_at: row.try_get("expires_at").map_err(db_err)?,
    })
}

fn proof_from_row(row: &PgRow) -> StorageResult<UsefulnessProof> {
    let work_type: String = row.try_get("work_type").map_err(db_err)?;
    Ok(UsefulnessProof {
        id: row.try_get("id").map_err(db_err)?,
        intent_id: row.try_get("intent_id").map_err(db_err)?,
        agent_did: parse_did(&row.try_get::<String, _>("agent_did").map_err(db_err)?)?,
        work_type: serde_json::from_value(serde_json::Value::String(work_type))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        metrics: from_json(row.try_get("metrics").map_err(db_err)?)?,
        attestations: from_json(row.try_get("attestations").map_err(db_err)?)?,
        trace_id: row.try_get("trace_id").map_err(db_err)?,
        usefulness_score: row.try_get("usefulness_score").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn receipt_from_row(row: &PgRow) -> StorageResult<TaskReceipt> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(TaskReceipt {
        id: row.try_get("id").map_err(db_err)?,
        negotiation_id: row.try_get("negotiation_id").map_err(db_err)?,
        agent_did: parse_did(&row.try_get::<String, _>("agent_did").map_err(db_err)?)?,
        client_did: parse_did(&row.try_get::<String, _>("client_did").map_err(db_err)?)?,
        k: row.try_get::<i32, _>("k").map_err(db_err)? as u32,
        m: row.try_get::<i32, _>("m").map_err(db_err)? as u32,
        committee: from_json(row.try_get("committee").map_err(db_err)?)?,
        attestations: from_json(row.try_get("attestations").map_err(db_err)?)?,
        status: serde_json::from_value(serde_json::Value::String(status))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
        finalized_at: row.try_get("finalized_at").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn db_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn window_clause(window: QueryWindow) -> (i64, i64) {
    let limit = if window.limit == 0 {
        i64::MAX
    } else {
        window.limit as i64
    };
    (limit, window.offset as i64)
}

#[async_trait]
impl AgentStore for PostgresBrokerStorage {
    async fn upsert_agent(&self, agent: AgentRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ainp_agents
                (did, endpoint, public_key_hex, ttl_seconds, usefulness_cached,
                 usefulness_updated_at, registered_at, last_seen)
            VALUES ($1, $2, $3, $4, 0, NULL, $5, $6)
            ON CONFLICT (did) DO UPDATE
               SET endpoint = EXCLUDED.endpoint,
                   public_key_hex = EXCLUDED.public_key_hex,
                   ttl_seconds = EXCLUDED.ttl_seconds,
                   last_seen = EXCLUDED.last_seen
            "#,
        )
        .bind(agent.did.as_str())
        .bind(&agent.endpoint)
        .bind(&agent.public_key_hex)
        .bind(agent.ttl_seconds as i64)
        .bind(agent.registered_at)
        .bind(agent.last_seen)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_agent(&self, did: &Did) -> StorageResult<Option<AgentRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_agents WHERE did = $1")
            .bind(did.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(agent_from_row).transpose()
    }

    async fn replace_capabilities(
        &self,
        did: &Did,
        capabilities: Vec<CapabilityRecord>,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let exists = sqlx::query("SELECT 1 FROM ainp_agents WHERE did = $1")
            .bind(did.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(StorageError::NotFound(format!("agent {did}")));
        }

        sqlx::query("DELETE FROM ainp_capabilities WHERE agent_did = $1")
            .bind(did.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        for capability in capabilities {
            sqlx::query(
                r#"
                INSERT INTO ainp_capabilities
                    (id, agent_did, description, embedding, tags, version, credential_ref, updated_at)
                VALUES ($1, $2, $3, $4::vector, $5, $6, $7, $8)
                "#,
            )
            .bind(capability.id)
            .bind(capability.agent_did.as_str())
            .bind(&capability.description)
            .bind(vector_literal(&capability.embedding))
            .bind(&capability.tags)
            .bind(&capability.version)
            .bind(&capability.credential_ref)
            .bind(capability.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        tx.commit().await.map_err(db_err)
    }

    async fn list_capabilities(&self, did: &Did) -> StorageResult<Vec<CapabilityRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, agent_did, description, embedding::text AS embedding_text,
                   tags, version, credential_ref, updated_at
              FROM ainp_capabilities
             WHERE agent_did = $1
             ORDER BY description
            "#,
        )
        .bind(did.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                Ok(CapabilityRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    agent_did: parse_did(
                        &row.try_get::<String, _>("agent_did").map_err(db_err)?,
                    )?,
                    description: row.try_get("description").map_err(db_err)?,
                    embedding: parse_vector(
                        &row.try_get::<String, _>("embedding_text").map_err(db_err)?,
                    ),
                    tags: row.try_get("tags").map_err(db_err)?,
                    version: row.try_get("version").map_err(db_err)?,
                    credential_ref: row.try_get("credential_ref").map_err(db_err)?,
                    updated_at: row.try_get("updated_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn search_capabilities(
        &self,
        embedding: &[f32],
        limit: usize,
        min_similarity: f64,
    ) -> StorageResult<Vec<CapabilitySearchHit>> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.agent_did, c.description, c.embedding::text AS embedding_text,
                   c.tags, c.version, c.credential_ref, c.updated_at,
                   1 - (c.embedding <=> $1::vector) AS similarity,
                   t.reliability, t.honesty, t.competence, t.timeliness,
                   t.decay_rate, t.updated_at AS trust_updated_at,
                   COALESCE(a.usefulness_cached, 0) AS usefulness_cached
              FROM ainp_capabilities c
              LEFT JOIN ainp_trust_scores t ON t.agent_did = c.agent_did
              LEFT JOIN ainp_agents a ON a.did = c.agent_did
             WHERE 1 - (c.embedding <=> $1::vector) >= $2
             ORDER BY c.embedding <=> $1::vector ASC
             LIMIT $3
            "#,
        )
        .bind(vector_literal(embedding))
        .bind(min_similarity)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let agent_did =
                    parse_did(&row.try_get::<String, _>("agent_did").map_err(db_err)?)?;
                let reliability: Option<f64> = row.try_get("reliability").map_err(db_err)?;
                let trust = match reliability {
                    Some(reliability) => Some(TrustRecord {
                        agent_did: agent_did.clone(),
                        vector: TrustVector {
                            reliability,
                            honesty: row.try_get("honesty").map_err(db_err)?,
                            competence: row.try_get("competence").map_err(db_err)?,
                            timeliness: row.try_get("timeliness").map_err(db_err)?,
                        },
                        decay_rate: row.try_get("decay_rate").map_err(db_err)?,
                        updated_at: row.try_get("trust_updated_at").map_err(db_err)?,
                    }),
                    None => None,
                };

                Ok(CapabilitySearchHit {
                    capability: CapabilityRecord {
                        id: row.try_get("id").map_err(db_err)?,
                        agent_did,
                        description: row.try_get("description").map_err(db_err)?,
                        embedding: parse_vector(
                            &row.try_get::<String, _>("embedding_text").map_err(db_err)?,
                        ),
                        tags: row.try_get("tags").map_err(db_err)?,
                        version: row.try_get("version").map_err(db_err)?,
                        credential_ref: row.try_get("credential_ref").map_err(db_err)?,
                        updated_at: row.try_get("updated_at").map_err(db_err)?,
                    },
                    similarity: row.try_get("similarity").map_err(db_err)?,
                    trust,
                    usefulness_cached: row.try_get("usefulness_cached").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn get_trust(&self, did: &Did) -> StorageResult<Option<TrustRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_trust_scores WHERE agent_did = $1")
            .bind(did.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| {
            Ok(TrustRecord {
                agent_did: did.clone(),
                vector: TrustVector {
                    reliability: row.try_get("reliability").map_err(db_err)?,
                    honesty: row.try_get("honesty").map_err(db_err)?,
                    competence: row.try_get("competence").map_err(db_err)?,
                    timeliness: row.try_get("timeliness").map_err(db_err)?,
                },
                decay_rate: row.try_get("decay_rate").map_err(db_err)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn upsert_trust(&self, trust: TrustRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ainp_trust_scores
                (agent_did, reliability, honesty, competence, timeliness, decay_rate, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (agent_did) DO UPDATE
               SET reliability = EXCLUDED.reliability,
                   honesty = EXCLUDED.honesty,
                   competence = EXCLUDED.competence,
                   timeliness = EXCLUDED.timeliness,
                   decay_rate = EXCLUDED.decay_rate,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(trust.agent_did.as_str())
        .bind(trust.vector.reliability)
        .bind(trust.vector.honesty)
        .bind(trust.vector.competence)
        .bind(trust.vector.timeliness)
        .bind(trust.decay_rate)
        .bind(trust.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn set_cached_usefulness(
        &self,
        did: &Did,
        score: f64,
        at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ainp_agents
               SET usefulness_cached = $1, usefulness_updated_at = $2
             WHERE did = $3
            "#,
        )
        .bind(score)
        .bind(at)
        .bind(did.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("agent {did}")));
        }
        Ok(())
    }

    async fn list_agents_by_usefulness(&self, limit: usize) -> StorageResult<Vec<AgentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_agents
             ORDER BY usefulness_cached DESC, did ASC
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(agent_from_row).collect()
    }
}

#[async_trait]
impl MailboxStore for PostgresBrokerStorage {
    async fn store_message(&self, message: MessageRecord) -> StorageResult<StoreOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let result = sqlx::query(
            r#"
            INSERT INTO ainp_messages
                (id, owner_did, envelope_id, from_did, conversation_id, msg_type,
                 payload, read, labels, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (owner_did, envelope_id) DO NOTHING
            "#,
        )
        .bind(message.id)
        .bind(message.owner_did.as_str())
        .bind(&message.envelope_id)
        .bind(message.from_did.as_str())
        .bind(&message.conversation_id)
        .bind(message.msg_type.as_str())
        .bind(to_json(&message.payload)?)
        .bind(message.read)
        .bind(&message.labels)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(db_err)?;
            return Ok(StoreOutcome { inserted: false });
        }

        let unread_delta: i64 = if message.read { 0 } else { 1 };
        sqlx::query(
            r#"
            INSERT INTO ainp_threads
                (conversation_id, owner_did, participants, last_message_at,
                 message_count, unread_count)
            VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT (conversation_id, owner_did) DO UPDATE
               SET message_count = ainp_threads.message_count + 1,
                   unread_count = ainp_threads.unread_count + $5,
                   last_message_at = GREATEST(ainp_threads.last_message_at, EXCLUDED.last_message_at),
                   participants = (
                       SELECT ARRAY(SELECT DISTINCT p
                                      FROM unnest(ainp_threads.participants || EXCLUDED.participants) AS p)
                   )
            "#,
        )
        .bind(&message.conversation_id)
        .bind(message.owner_did.as_str())
        .bind(vec![
            message.from_did.to_string(),
            message.owner_did.to_string(),
        ])
        .bind(message.created_at)
        .bind(unread_delta)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(StoreOutcome { inserted: true })
    }

    async fn list_inbox(
        &self,
        owner: &Did,
        query: InboxQuery,
    ) -> StorageResult<Vec<MessageRecord>> {
        let limit = if query.limit == 0 { 50 } else { query.limit as i64 };
        let (cursor_at, cursor_id) = match query.cursor {
            Some(cursor) => (Some(cursor.created_at), Some(cursor.id)),
            None => (None, None),
        };

        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_messages
             WHERE owner_did = $1
               AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
               AND ($4::text IS NULL OR $4 = ANY(labels))
               AND (NOT $5 OR NOT read)
             ORDER BY created_at DESC, id DESC
             LIMIT $6
            "#,
        )
        .bind(owner.as_str())
        .bind(cursor_at)
        .bind(cursor_id)
        .bind(&query.label)
        .bind(query.unread_only)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(message_from_row).collect()
    }

    async fn get_message(
        &self,
        owner: &Did,
        message_id: &Uuid,
    ) -> StorageResult<Option<MessageRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_messages WHERE owner_did = $1 AND id = $2")
            .bind(owner.as_str())
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(message_from_row).transpose()
    }

    async fn get_thread(
        &self,
        owner: &Did,
        conversation_id: &str,
    ) -> StorageResult<Option<ThreadRecord>> {
        let row = sqlx::query(
            "SELECT * FROM ainp_threads WHERE conversation_id = $1 AND owner_did = $2",
        )
        .bind(conversation_id)
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        row.as_ref().map(thread_from_row).transpose()
    }

    async fn list_thread_messages(
        &self,
        owner: &Did,
        conversation_id: &str,
        window: QueryWindow,
    ) -> StorageResult<Vec<MessageRecord>> {
        let (limit, offset) = window_clause(window);
        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_messages
             WHERE owner_did = $1 AND conversation_id = $2
             ORDER BY created_at ASC, id ASC
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(owner.as_str())
        .bind(conversation_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(message_from_row).collect()
    }

    async fn set_read(
        &self,
        owner: &Did,
        message_id: &Uuid,
        read: bool,
    ) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let changed = sqlx::query(
            r#"
            UPDATE ainp_messages
               SET read = $1
             WHERE owner_did = $2 AND id = $3 AND read <> $1
            RETURNING conversation_id
            "#,
        )
        .bind(read)
        .bind(owner.as_str())
        .bind(message_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;

        if let Some(row) = changed {
            let conversation_id: String = row.try_get("conversation_id").map_err(db_err)?;
            let delta: i64 = if read { -1 } else { 1 };
            sqlx::query(
                r#"
                UPDATE ainp_threads
                   SET unread_count = GREATEST(unread_count + $1, 0)
                 WHERE conversation_id = $2 AND owner_did = $3
                "#,
            )
            .bind(delta)
            .bind(&conversation_id)
            .bind(owner.as_str())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }

        let row = sqlx::query("SELECT * FROM ainp_messages WHERE owner_did = $1 AND id = $2")
            .bind(owner.as_str())
            .bind(message_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("message {message_id}")))?;

        let record = message_from_row(&row)?;
        tx.commit().await.map_err(db_err)?;
        Ok(record)
    }

    async fn update_labels(
        &self,
        owner: &Did,
        message_id: &Uuid,
        add: &[String],
        remove: &[String],
    ) -> StorageResult<MessageRecord> {
        let row = sqlx::query(
            r#"
            UPDATE ainp_messages
               SET labels = (
                   SELECT ARRAY(
                       SELECT DISTINCT l
                         FROM unnest(labels || $1::text[]) AS l
                        WHERE NOT (l = ANY($2::text[]))
                   )
               )
             WHERE owner_did = $3 AND id = $4
            RETURNING *
            "#,
        )
        .bind(add)
        .bind(remove)
        .bind(owner.as_str())
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?
        .ok_or_else(|| StorageError::NotFound(format!("message {message_id}")))?;

        message_from_row(&row)
    }
}

#[async_trait]
impl ContactStore for PostgresBrokerStorage {
    async fn get_contact(&self, owner: &Did, peer: &Did) -> StorageResult<Option<ContactRecord>> {
        let row = sqlx::query(
            "SELECT * FROM ainp_contacts WHERE owner_did = $1 AND peer_did = $2",
        )
        .bind(owner.as_str())
        .bind(peer.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| contact_from_row(&row)).transpose()
    }

    async fn record_interaction(
        &self,
        owner: &Did,
        peer: &Did,
        at: DateTime<Utc>,
    ) -> StorageResult<ContactRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO ainp_contacts
                (owner_did, peer_did, first_seen_at, interaction_count, consent)
            VALUES ($1, $2, $3, 1, 'unknown')
            ON CONFLICT (owner_did, peer_did) DO UPDATE
               SET interaction_count = ainp_contacts.interaction_count + 1
            RETURNING *
            "#,
        )
        .bind(owner.as_str())
        .bind(peer.as_str())
        .bind(at)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        contact_from_row(&row)
    }

    async fn set_consent(
        &self,
        owner: &Did,
        peer: &Did,
        consent: ConsentState,
    ) -> StorageResult<ContactRecord> {
        let row = sqlx::query(
            r#"
            INSERT INTO ainp_contacts
                (owner_did, peer_did, first_seen_at, interaction_count, consent)
            VALUES ($1, $2, NOW(), 0, $3)
            ON CONFLICT (owner_did, peer_did) DO UPDATE
               SET consent = EXCLUDED.consent
            RETURNING *
            "#,
        )
        .bind(owner.as_str())
        .bind(peer.as_str())
        .bind(consent.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        contact_from_row(&row)
    }
}

fn contact_from_row(row: &PgRow) -> StorageResult<ContactRecord> {
    let consent: String = row.try_get("consent").map_err(db_err)?;
    Ok(ContactRecord {
        owner_did: parse_did(&row.try_get::<String, _>("owner_did").map_err(db_err)?)?,
        peer_did: parse_did(&row.try_get::<String, _>("peer_did").map_err(db_err)?)?,
        first_seen_at: row.try_get("first_seen_at").map_err(db_err)?,
        interaction_count: row.try_get("interaction_count").map_err(db_err)?,
        consent: serde_json::from_value(serde_json::Value::String(consent))
            .map_err(|e| StorageError::Serialization(e.to_string()))?,
    })
}

#[async_trait]
impl NegotiationStore for PostgresBrokerStorage {
    async fn insert_negotiation(&self, negotiation: NegotiationRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ainp_negotiations
                (id, intent_id, initiator_did, responder_did, state, max_rounds,
                 created_at, expires_at, rounds, current_proposal, final_proposal,
                 convergence_score, incentive_split, reserved_credits)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&negotiation.id)
        .bind(&negotiation.intent_id)
        .bind(negotiation.initiator_did.as_str())
        .bind(negotiation.responder_did.as_str())
        .bind(negotiation.state.as_str())
        .bind(negotiation.max_rounds as i32)
        .bind(negotiation.created_at)
        .bind(negotiation.expires_at)
        .bind(to_json(&negotiation.rounds)?)
        .bind(negotiation.current_proposal.as_ref().map(to_json).transpose()?)
        .bind(negotiation.final_proposal.as_ref().map(to_json).transpose()?)
        .bind(negotiation.convergence_score)
        .bind(to_json(&negotiation.incentive_split)?)
        .bind(negotiation.reserved_credits)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "negotiation {} already exists",
                negotiation.id
            )));
        }
        Ok(())
    }

    async fn get_negotiation(&self, id: &str) -> StorageResult<Option<NegotiationRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_negotiations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(negotiation_from_row).transpose()
    }

    async fn update_negotiation(
        &self,
        negotiation: NegotiationRecord,
        expected_state: NegotiationState,
    ) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE ainp_negotiations
               SET state = $1, rounds = $2, current_proposal = $3, final_proposal = $4,
                   convergence_score = $5, incentive_split = $6, reserved_credits = $7,
                   expires_at = $8
             WHERE id = $9 AND state = $10
            "#,
        )
        .bind(negotiation.state.as_str())
        .bind(to_json(&negotiation.rounds)?)
        .bind(negotiation.current_proposal.as_ref().map(to_json).transpose()?)
        .bind(negotiation.final_proposal.as_ref().map(to_json).transpose()?)
        .bind(negotiation.convergence_score)
        .bind(to_json(&negotiation.incentive_split)?)
        .bind(negotiation.reserved_credits)
        .bind(negotiation.expires_at)
        .bind(&negotiation.id)
        .bind(expected_state.as_str())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            let exists = self.get_negotiation(&negotiation.id).await?.is_some();
            if exists {
                return Err(StorageError::InvariantViolation(format!(
                    "negotiation {} state changed concurrently",
                    negotiation.id
                )));
            }
            return Err(StorageError::NotFound(format!(
                "negotiation {}",
                negotiation.id
            )));
        }
        Ok(())
    }

    async fn list_negotiations(
        &self,
        filter: NegotiationFilter,
        window: QueryWindow,
    ) -> StorageResult<Vec<NegotiationRecord>> {
        let (limit, offset) = window_clause(window);
        let agent = filter.agent_did.as_ref().map(|d| d.to_string());
        let state = filter.state.map(|s| s.as_str().to_string());

        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_negotiations
             WHERE ($1::text IS NULL OR initiator_did = $1 OR responder_did = $1)
               AND ($2::text IS NULL OR state = $2)
             ORDER BY created_at DESC
             LIMIT $3 OFFSET $4
            "#,
        )
        .bind(agent)
        .bind(state)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(negotiation_from_row).collect()
    }

    async fn list_expired(&self, now: DateTime<Utc>) -> StorageResult<Vec<NegotiationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_negotiations
             WHERE state IN ('initiated', 'proposed', 'counter_proposed')
               AND expires_at <= $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(negotiation_from_row).collect()
    }
}

impl PostgresBrokerStorage {
    /// Lock one account row for update inside `tx`.
    async fn locked_account(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        did: &Did,
    ) -> StorageResult<AccountRecord> {
        let row = sqlx::query("SELECT * FROM ainp_credit_accounts WHERE owner_did = $1 FOR UPDATE")
            .bind(did.as_str())
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("account {did}")))?;
        account_from_row(&row)
    }

    async fn write_account(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        account: &AccountRecord,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE ainp_credit_accounts
               SET balance = $1, reserved = $2, lifetime_earned = $3,
                   lifetime_spent = $4, updated_at = $5
             WHERE owner_did = $6
            "#,
        )
        .bind(account.balance)
        .bind(account.reserved)
        .bind(account.lifetime_earned)
        .bind(account.lifetime_spent)
        .bind(account.updated_at)
        .bind(account.owner_did.as_str())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn write_entry(
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        owner: &Did,
        entry_type: LedgerEntryType,
        amount: i64,
        intent_id: Option<&str>,
        proof_id: Option<&str>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ainp_ledger_entries
                (id, owner_did, entry_type, amount, intent_id, proof_id, at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(owner.as_str())
        .bind(entry_type.as_str())
        .bind(amount)
        .bind(intent_id)
        .bind(proof_id)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl AccountStore for PostgresBrokerStorage {
    async fn create_account(&self, did: &Did, initial_balance: i64) -> StorageResult<AccountRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let now = Utc::now();

        let inserted = sqlx::query(
            r#"
            INSERT INTO ainp_credit_accounts
                (owner_did, balance, reserved, lifetime_earned, lifetime_spent,
                 created_at, updated_at)
            VALUES ($1, $2, 0, 0, 0, $3, $3)
            ON CONFLICT (owner_did) DO NOTHING
            "#,
        )
        .bind(did.as_str())
        .bind(initial_balance)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;

        if inserted.rows_affected() > 0 && initial_balance > 0 {
            Self::write_entry(&mut tx, did, LedgerEntryType::Deposit, initial_balance, None, None)
                .await?;
        }

        let account = Self::locked_account(&mut tx, did).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(account)
    }

    async fn get_account(&self, did: &Did) -> StorageResult<Option<AccountRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_credit_accounts WHERE owner_did = $1")
            .bind(did.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn deposit(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut account = Self::locked_account(&mut tx, did).await?;
        account.balance += amount;
        account.updated_at = Utc::now();
        Self::write_account(&mut tx, &account).await?;
        Self::write_entry(&mut tx, did, LedgerEntryType::Deposit, amount, intent_id, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(account)
    }

    async fn reserve(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut account = Self::locked_account(&mut tx, did).await?;
        if account.balance < amount {
            return Err(StorageError::InsufficientBalance {
                requested: amount,
                available: account.balance,
            });
        }
        account.balance -= amount;
        account.reserved += amount;
        account.updated_at = Utc::now();
        Self::write_account(&mut tx, &account).await?;
        Self::write_entry(&mut tx, did, LedgerEntryType::Reserve, amount, intent_id, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(account)
    }

    async fn release(
        &self,
        did: &Did,
        reserved_amount: i64,
        spend_amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut account = Self::locked_account(&mut tx, did).await?;
        if account.reserved < reserved_amount {
            return Err(StorageError::InsufficientReserved {
                requested: reserved_amount,
                reserved: account.reserved,
            });
        }
        if spend_amount > reserved_amount {
            return Err(StorageError::InvalidInput(format!(
                "spend {spend_amount} exceeds released reservation {reserved_amount}"
            )));
        }

        let refund = reserved_amount - spend_amount;
        account.reserved -= reserved_amount;
        account.balance += refund;
        account.lifetime_spent += spend_amount;
        account.updated_at = Utc::now();
        Self::write_account(&mut tx, &account).await?;
        if refund > 0 || spend_amount == 0 {
            Self::write_entry(&mut tx, did, LedgerEntryType::Release, refund, intent_id, None)
                .await?;
        }
        if spend_amount > 0 {
            Self::write_entry(&mut tx, did, LedgerEntryType::Spend, spend_amount, intent_id, None)
                .await?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(account)
    }

    async fn earn(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
        proof_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut account = Self::locked_account(&mut tx, did).await?;
        account.balance += amount;
        account.lifetime_earned += amount;
        account.updated_at = Utc::now();
        Self::write_account(&mut tx, &account).await?;
        Self::write_entry(&mut tx, did, LedgerEntryType::Earn, amount, intent_id, proof_id)
            .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(account)
    }

    async fn charge(
        &self,
        did: &Did,
        amount: i64,
        intent_id: Option<&str>,
    ) -> StorageResult<AccountRecord> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut account = Self::locked_account(&mut tx, did).await?;
        if account.balance < amount {
            return Err(StorageError::InsufficientBalance {
                requested: amount,
                available: account.balance,
            });
        }
        account.balance -= amount;
        account.lifetime_spent += amount;
        account.updated_at = Utc::now();
        Self::write_account(&mut tx, &account).await?;
        Self::write_entry(&mut tx, did, LedgerEntryType::Spend, amount, intent_id, None).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(account)
    }

    async fn list_entries(
        &self,
        did: &Did,
        window: QueryWindow,
    ) -> StorageResult<Vec<LedgerEntryRecord>> {
        let (limit, offset) = window_clause(window);
        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_ledger_entries
             WHERE owner_did = $1
             ORDER BY at DESC
             LIMIT $2 OFFSET $3
            "#,
        )
        .bind(did.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| {
                let entry_type: String = row.try_get("entry_type").map_err(db_err)?;
                Ok(LedgerEntryRecord {
                    id: row.try_get("id").map_err(db_err)?,
                    owner_did: parse_did(
                        &row.try_get::<String, _>("owner_did").map_err(db_err)?,
                    )?,
                    entry_type: serde_json::from_value(serde_json::Value::String(entry_type))
                        .map_err(|e| StorageError::Serialization(e.to_string()))?,
                    amount: row.try_get("amount").map_err(db_err)?,
                    intent_id: row.try_get("intent_id").map_err(db_err)?,
                    proof_id: row.try_get("proof_id").map_err(db_err)?,
                    at: row.try_get("at").map_err(db_err)?,
                })
            })
            .collect()
    }
}

#[async_trait]
impl PaymentStore for PostgresBrokerStorage {
    async fn insert_payment_request(&self, request: PaymentRequestRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ainp_payment_requests
                (id, owner_did, amount_atomic, currency, method, state,
                 payment_url, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&request.id)
        .bind(request.owner_did.as_str())
        .bind(request.amount_atomic)
        .bind(&request.currency)
        .bind(&request.method)
        .bind(state_str(request.state))
        .bind(&request.payment_url)
        .bind(request.created_at)
        .bind(request.expires_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "payment request {} already exists",
                request.id
            )));
        }
        Ok(())
    }

    async fn get_payment_request(
        &self,
        id: &str,
    ) -> StorageResult<Option<PaymentRequestRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_payment_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn transition_payment(
        &self,
        id: &str,
        expected: PaymentState,
        to: PaymentState,
    ) -> StorageResult<PaymentRequestRecord> {
        let row = sqlx::query(
            r#"
            UPDATE ainp_payment_requests
               SET state = $1
             WHERE id = $2 AND state = $3
            RETURNING *
            "#,
        )
        .bind(state_str(to))
        .bind(id)
        .bind(state_str(expected))
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => payment_from_row(&row),
            None => {
                let exists = self.get_payment_request(id).await?.is_some();
                if exists {
                    Err(StorageError::InvariantViolation(format!(
                        "payment {id} is not in state {expected:?}"
                    )))
                } else {
                    Err(StorageError::NotFound(format!("payment request {id}")))
                }
            }
        }
    }

    async fn list_expired_payments(
        &self,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<PaymentRequestRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM ainp_payment_requests WHERE state = 'pending' AND expires_at <= $1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(payment_from_row).collect()
    }
}

fn state_str(state: PaymentState) -> &'static str {
    match state {
        PaymentState::Pending => "pending",
        PaymentState::Paid => "paid",
        PaymentState::Expired => "expired",
        PaymentState::Failed => "failed",
    }
}

#[async_trait]
impl ProofStore for PostgresBrokerStorage {
    async fn insert_proof(&self, proof: UsefulnessProof) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ainp_usefulness_proofs
                (id, intent_id, agent_did, work_type, metrics, attestations,
                 trace_id, usefulness_score, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&proof.id)
        .bind(&proof.intent_id)
        .bind(proof.agent_did.as_str())
        .bind(proof.work_type.as_str())
        .bind(to_json(&proof.metrics)?)
        .bind(to_json(&proof.attestations)?)
        .bind(&proof.trace_id)
        .bind(proof.usefulness_score)
        .bind(proof.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "proof {} already exists",
                proof.id
            )));
        }
        Ok(())
    }

    async fn list_proofs_since(
        &self,
        did: &Did,
        since: DateTime<Utc>,
    ) -> StorageResult<Vec<UsefulnessProof>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_usefulness_proofs
             WHERE agent_did = $1 AND created_at >= $2
             ORDER BY created_at DESC
            "#,
        )
        .bind(did.as_str())
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(proof_from_row).collect()
    }

    async fn list_agents_with_proofs(&self) -> StorageResult<Vec<Did>> {
        let rows = sqlx::query("SELECT DISTINCT agent_did FROM ainp_usefulness_proofs ORDER BY agent_did")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| parse_did(&row.try_get::<String, _>("agent_did").map_err(db_err)?))
            .collect()
    }
}

#[async_trait]
impl ReceiptStore for PostgresBrokerStorage {
    async fn insert_receipt(&self, receipt: TaskReceipt) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO ainp_task_receipts
                (id, negotiation_id, agent_did, client_did, k, m, committee,
                 attestations, status, finalized_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(&receipt.id)
        .bind(&receipt.negotiation_id)
        .bind(receipt.agent_did.as_str())
        .bind(receipt.client_did.as_str())
        .bind(receipt.k as i32)
        .bind(receipt.m as i32)
        .bind(to_json(&receipt.committee)?)
        .bind(to_json(&receipt.attestations)?)
        .bind(receipt_status_str(receipt.status))
        .bind(receipt.finalized_at)
        .bind(receipt.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Conflict(format!(
                "receipt {} already exists",
                receipt.id
            )));
        }
        Ok(())
    }

    async fn get_receipt(&self, id: &str) -> StorageResult<Option<TaskReceipt>> {
        let row = sqlx::query("SELECT * FROM ainp_task_receipts WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(receipt_from_row).transpose()
    }

    async fn add_attestation(
        &self,
        receipt_id: &str,
        attestation: Attestation,
    ) -> StorageResult<TaskReceipt> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let row = sqlx::query("SELECT * FROM ainp_task_receipts WHERE id = $1 FOR UPDATE")
            .bind(receipt_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?
            .ok_or_else(|| StorageError::NotFound(format!("receipt {receipt_id}")))?;
        let mut receipt = receipt_from_row(&row)?;

        if receipt.status == ReceiptStatus::Finalized {
            return Err(StorageError::Conflict(format!(
                "receipt {receipt_id} is already finalized"
            )));
        }
        if receipt
            .attestations
            .iter()
            .any(|a| a.by_did == attestation.by_did)
        {
            return Err(StorageError::Conflict(format!(
                "{} already attested receipt {receipt_id}",
                attestation.by_did
            )));
        }

        receipt.attestations.push(attestation);
        sqlx::query("UPDATE ainp_task_receipts SET attestations = $1 WHERE id = $2")
            .bind(to_json(&receipt.attestations)?)
            .bind(receipt_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

        tx.commit().await.map_err(db_err)?;
        Ok(receipt)
    }

    async fn finalize_receipt(&self, id: &str, at: DateTime<Utc>) -> StorageResult<TaskReceipt> {
        let row = sqlx::query(
            r#"
            UPDATE ainp_task_receipts
               SET status = 'finalized', finalized_at = $1
             WHERE id = $2 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(at)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        match row {
            Some(row) => receipt_from_row(&row),
            None => {
                let receipt = self
                    .get_receipt(id)
                    .await?
                    .ok_or_else(|| StorageError::NotFound(format!("receipt {id}")))?;
                match receipt.status {
                    ReceiptStatus::Finalized => Ok(receipt),
                    _ => Err(StorageError::InvariantViolation(format!(
                        "receipt {id} cannot finalize from {:?}",
                        receipt.status
                    ))),
                }
            }
        }
    }

    async fn list_pending_receipts(
        &self,
        window: QueryWindow,
    ) -> StorageResult<Vec<TaskReceipt>> {
        let (limit, offset) = window_clause(window);
        let rows = sqlx::query(
            r#"
            SELECT * FROM ainp_task_receipts
             WHERE status = 'pending'
             ORDER BY created_at ASC
             LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(receipt_from_row).collect()
    }

    async fn get_reputation(&self, did: &Did) -> StorageResult<Option<ReputationRecord>> {
        let row = sqlx::query("SELECT * FROM ainp_reputation WHERE agent_did = $1")
            .bind(did.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| {
            Ok(ReputationRecord {
                agent_did: did.clone(),
                dimensions: from_json(row.try_get("dimensions").map_err(db_err)?)?,
                updated_at: row.try_get("updated_at").map_err(db_err)?,
            })
        })
        .transpose()
    }

    async fn upsert_reputation(&self, reputation: ReputationRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ainp_reputation (agent_did, dimensions, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (agent_did) DO UPDATE
               SET dimensions = EXCLUDED.dimensions,
                   updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(reputation.agent_did.as_str())
        .bind(to_json(&reputation.dimensions)?)
        .bind(reputation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Probe for PostgresBrokerStorage {
    async fn ping(&self) -> StorageResult<()> {
        PostgresBrokerStorage::ping(self).await
    }
}

fn receipt_status_str(status: ReceiptStatus) -> &'static str {
    match status {
        ReceiptStatus::Pending => "pending",
        ReceiptStatus::Finalized => "finalized",
        ReceiptStatus::Disputed => "disputed",
    }
}
