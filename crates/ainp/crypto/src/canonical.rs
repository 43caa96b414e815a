use crate::validator::ValidationError;
use ainp_types::Envelope;

/// Canonical byte form of an envelope for signing and verification.
///
/// The envelope is serialized to JSON with the `signature` field removed.
/// `serde_json` maps are BTree-backed, so object keys come out sorted;
/// compact separators mean no whitespace. Signing and verifying both go
/// through this function, which is what makes signatures portable across
/// processes.
pub fn canonical_envelope_bytes(envelope: &Envelope) -> Result<Vec<u8>, ValidationError> {
    let mut value = serde_json::to_value(envelope)
        .map_err(|e| ValidationError::Malformed(e.to_string()))?;

    let obj = value
        .as_object_mut()
        .ok_or_else(|| ValidationError::Malformed("envelope is not an object".to_string()))?;
    obj.remove("signature");

    serde_json::to_vec(&value).map_err(|e| ValidationError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ainp_types::{Did, EnvelopeId, MsgType, TaggedValue};

    fn sample() -> Envelope {
        Envelope {
            id: EnvelopeId("e-1".to_string()),
            trace_id: "t-1".to_string(),
            from_did: Did::parse("did:key:aa").unwrap(),
            to_did: Some(Did::parse("did:key:bb").unwrap()),
            msg_type: MsgType::Intent,
            ttl_seconds: 60,
            timestamp_ms: 12345,
            signature: "sig-to-strip".to_string(),
            payload: TaggedValue::from(serde_json::json!({"z": 1, "a": 2})),
        }
    }

    #[test]
    fn signature_field_is_removed() {
        let bytes = canonical_envelope_bytes(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("sig-to-strip"));
        assert!(!text.contains("signature"));
    }

    #[test]
    fn canonical_bytes_ignore_signature_value() {
        let mut a = sample();
        let mut b = sample();
        a.signature = "one".to_string();
        b.signature = "two".to_string();
        assert_eq!(
            canonical_envelope_bytes(&a).unwrap(),
            canonical_envelope_bytes(&b).unwrap()
        );
    }

    #[test]
    fn object_keys_are_sorted() {
        let bytes = canonical_envelope_bytes(&sample()).unwrap();
        let text = String::from_utf8(bytes).unwrap();
        let from = text.find("\"from_did\"").unwrap();
        let id = text.find("\"id\"").unwrap();
        let ttl = text.find("\"ttl_seconds\"").unwrap();
        assert!(from < id && id < ttl);
        // Payload map keys sort too.
        assert!(text.find("\"a\"").unwrap() < text.find("\"z\"").unwrap());
    }

    #[test]
    fn no_whitespace_in_canonical_form() {
        let bytes = canonical_envelope_bytes(&sample()).unwrap();
        assert!(!bytes.contains(&b' '));
        assert!(!bytes.contains(&b'\n'));
    }
}
