use std::fmt;

use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";

const SIGNATURE_PREFIX: &str = "sha256=";
const SECRET_PREFIX: &str = "whsec_";

/// Opaque signing secret of a webhook.
///
/// `Debug` is redacted so configs can be logged safely.
#[derive(Clone, PartialEq, Eq)]
pub struct WebhookSecret(String);

impl WebhookSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Generate a fresh secret from 32 bytes of OS randomness.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(format!("{SECRET_PREFIX}{}", hex::encode(bytes)))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for WebhookSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WebhookSecret([REDACTED])")
    }
}

fn mac_for(secret: &[u8]) -> HmacSha256 {
    // HMAC-SHA256 is defined for keys of any length, including empty ones.
    match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac accepts keys of any size"),
    }
}

/// Compute the hex HMAC-SHA256 of the exact payload bytes.
pub fn sign(payload: &[u8], secret: &[u8]) -> String {
    let mut mac = mac_for(secret);
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex signature in constant time.
///
/// Malformed, short or non-hex signatures yield `false`.
pub fn verify(payload: &[u8], signature_hex: &str, secret: &[u8]) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let mut mac = mac_for(secret);
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Value for the `X-Webhook-Signature` header.
pub fn signature_header_value(payload: &[u8], secret: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", sign(payload, secret))
}

/// Strip the `sha256=` scheme from a signature header value.
pub fn parse_signature_header(value: &str) -> Option<&str> {
    value.trim().strip_prefix(SIGNATURE_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    UnsupportedScheme,
    InvalidSignature,
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationError::MissingSignature => write!(f, "missing {SIGNATURE_HEADER} header"),
            VerificationError::UnsupportedScheme => write!(f, "signature scheme is not sha256"),
            VerificationError::InvalidSignature => write!(f, "signature mismatch"),
        }
    }
}

impl std::error::Error for VerificationError {}

/// Verify an incoming webhook request in one call. Receiver-side helper.
///
/// Header names are matched case-insensitively.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
) -> Result<(), VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let header = headers
        .into_iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(SIGNATURE_HEADER))
        .map(|(_, value)| value)
        .ok_or(VerificationError::MissingSignature)?;

    let signature = parse_signature_header(header).ok_or(VerificationError::UnsupportedScheme)?;

    if verify(body, signature, secret) {
        Ok(())
    } else {
        Err(VerificationError::InvalidSignature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify() {
        let payload = br#"{"event":"door.offline","data":{"doorId":5}}"#;
        let signature = sign(payload, b"whsec_test");
        assert_eq!(signature.len(), 64);
        assert!(verify(payload, &signature, b"whsec_test"));
    }

    #[test]
    fn wrong_secret_or_mutated_payload_fails() {
        let payload = br#"{"id":1}"#;
        let signature = sign(payload, b"secret-a");
        assert!(!verify(payload, &signature, b"secret-b"));
        assert!(!verify(br#"{"id": 1}"#, &signature, b"secret-a"));
    }

    #[test]
    fn malformed_signatures_are_rejected() {
        let payload = b"body";
        assert!(!verify(payload, "", b"k"));
        assert!(!verify(payload, "zz", b"k"));
        assert!(!verify(payload, "abc", b"k"));
        assert!(!verify(payload, &sign(payload, b"k")[..10], b"k"));
    }

    #[test]
    fn known_vector() {
        // RFC 4231 test case 2.
        let signature = sign(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn request_verification_reads_prefixed_header() {
        let body = br#"{"ok":true}"#;
        let header = signature_header_value(body, b"s3cret");
        let headers = vec![("x-webhook-signature", header.as_str())];
        assert_eq!(verify_webhook_request(headers, body, b"s3cret"), Ok(()));

        let bare = sign(body, b"s3cret");
        let headers = vec![(SIGNATURE_HEADER, bare.as_str())];
        assert_eq!(
            verify_webhook_request(headers, body, b"s3cret"),
            Err(VerificationError::UnsupportedScheme)
        );

        let headers: Vec<(&str, &str)> = Vec::new();
        assert_eq!(
            verify_webhook_request(headers, body, b"s3cret"),
            Err(VerificationError::MissingSignature)
        );
    }

    #[test]
    fn generated_secrets_are_unique_and_redacted() {
        let a = WebhookSecret::generate();
        let b = WebhookSecret::generate();
        assert_ne!(a, b);
        assert!(a.expose().starts_with("whsec_"));
        assert_eq!(a.expose().len(), 6 + 64);
        assert_eq!(format!("{a:?}"), "WebhookSecret([REDACTED])");
    }
}
