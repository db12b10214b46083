//! HMAC-SHA256 message signatures for UADP.
//!
//! The signature covers the JSON encoding of the message with the
//! `signature` field absent.

use crate::message::{encode_message, UadpMessage};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Generate a hex HMAC-SHA256 signature.
fn hmac_sign(secret: &str, data: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex HMAC-SHA256 signature using constant-time comparison.
fn hmac_verify(secret: &str, data: &[u8], signature: &str) -> bool {
    let expected = hmac_sign(secret, data);
    subtle::ConstantTimeEq::ct_eq(expected.as_bytes(), signature.as_bytes()).into()
}

fn canonical_bytes(msg: &UadpMessage) -> Result<Vec<u8>, serde_json::Error> {
    if msg.signature.is_none() {
        return encode_message(msg);
    }
    let mut unsigned = msg.clone();
    unsigned.signature = None;
    encode_message(&unsigned)
}

/// Attach a signature to the message.
pub fn sign(msg: &mut UadpMessage, secret: &str) -> Result<(), serde_json::Error> {
    msg.signature = None;
    let bytes = canonical_bytes(msg)?;
    msg.signature = Some(hmac_sign(secret, &bytes));
    Ok(())
}

/// Returns true if the message carries a valid signature for `secret`.
pub fn verify(msg: &UadpMessage, secret: &str) -> bool {
    let Some(signature) = msg.signature.as_deref() else {
        return false;
    };
    match canonical_bytes(msg) {
        Ok(bytes) => hmac_verify(secret, &bytes, signature),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{GoodbyePayload, UadpBody};

    fn goodbye() -> UadpMessage {
        UadpMessage::new(
            "agent-1",
            UadpBody::Goodbye(GoodbyePayload {
                reason: Some("shutdown".into()),
            }),
        )
    }

    #[test]
    fn test_sign_and_verify() {
        let mut msg = goodbye();
        sign(&mut msg, "lan-secret").unwrap();
        assert!(msg.signature.is_some());
        assert!(verify(&msg, "lan-secret"));
        assert!(!verify(&msg, "other-secret"));
    }

    #[test]
    fn test_tampered_message_fails() {
        let mut msg = goodbye();
        sign(&mut msg, "lan-secret").unwrap();
        msg.agent_id = "agent-2".into();
        assert!(!verify(&msg, "lan-secret"));
    }

    #[test]
    fn test_unsigned_message_fails() {
        assert!(!verify(&goodbye(), "lan-secret"));
    }
}
