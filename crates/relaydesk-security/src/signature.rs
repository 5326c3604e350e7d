use relaydesk_common::{Error, Result};
use ring::hmac;
use subtle::ConstantTimeEq;
use tracing::debug;

/// Compute the `sha256=<hex>` value Meta sends in `X-Hub-Signature-256`.
pub fn hub_signature(secret: &str, body: &[u8]) -> String {
    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    let tag = hmac::sign(&key, body);
    format!("sha256={}", hex::encode(tag.as_ref()))
}

/// Check an `X-Hub-Signature-256` header against the raw request body.
pub fn verify_hub_signature(secret: &str, body: &[u8], header: Option<&str>) -> Result<()> {
    let header = header
        .ok_or_else(|| Error::VerificationFailed("missing X-Hub-Signature-256 header".into()))?;
    let digest_hex = header.trim().strip_prefix("sha256=").ok_or_else(|| {
        Error::VerificationFailed("signature must use sha256=<hex> format".into())
    })?;
    if digest_hex.is_empty() {
        return Err(Error::VerificationFailed("empty signature digest".into()));
    }
    let expected = hex::decode(digest_hex)
        .map_err(|e| Error::VerificationFailed(format!("signature is not valid hex: {e}")))?;

    let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
    hmac::verify(&key, body, &expected).map_err(|_| {
        debug!("hub signature mismatch over {} body bytes", body.len());
        Error::VerificationFailed("signature mismatch".into())
    })
}

/// Constant-time comparison for shared-secret headers.
pub fn secrets_match(expected: &str, provided: Option<&str>) -> bool {
    match provided {
        Some(provided) => bool::from(expected.as_bytes().ct_eq(provided.as_bytes())),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signature_is_accepted() {
        let body = br#"{"object":"whatsapp_business_account"}"#;
        let header = hub_signature("app-secret", body);
        assert!(header.starts_with("sha256="));
        assert!(verify_hub_signature("app-secret", body, Some(&header)).is_ok());
    }

    #[test]
    fn tampered_body_or_wrong_secret_is_rejected() {
        let header = hub_signature("app-secret", b"original");
        assert!(verify_hub_signature("app-secret", b"tampered", Some(&header)).is_err());
        assert!(verify_hub_signature("other", b"original", Some(&header)).is_err());
    }

    #[test]
    fn malformed_headers_are_rejected() {
        let headers = [
            None,
            Some("md5=abcd"),
            Some("sha256="),
            Some("sha256=zz"),
            Some("sha256=abc"),
        ];
        for header in headers {
            let err = verify_hub_signature("s", b"x", header).expect_err("should reject");
            assert!(matches!(err, Error::VerificationFailed(_)));
        }
    }

    #[test]
    fn digest_is_hex_of_the_mac() {
        let header = hub_signature("app-secret", b"payload");
        let digest = header.strip_prefix("sha256=").unwrap();
        assert_eq!(digest.len(), 64);
        assert_eq!(hex::decode(digest).unwrap().len(), 32);

        let upper = format!("sha256={}", digest.to_uppercase());
        assert!(verify_hub_signature("app-secret", b"payload", Some(&upper)).is_ok());
    }

    #[test]
    fn secrets_match_requires_exact_value() {
        assert!(secrets_match("token-1", Some("token-1")));
        assert!(!secrets_match("token-1", Some("token-2")));
        assert!(!secrets_match("token-1", Some("token-10")));
        assert!(!secrets_match("token-1", None));
    }
}
