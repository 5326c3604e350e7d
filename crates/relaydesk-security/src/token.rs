use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::Rng;
use relaydesk_common::{Error, Result, TenantId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Payload of a dashboard/API access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    #[serde(with = "subject")]
    pub sub: TenantId,
    /// `user` or `admin`.
    pub role: String,
    /// Expiry as unix seconds.
    pub exp: i64,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == "admin"
    }
}

/// `sub` travels as a string, as registered JWT claims expect.
mod subject {
    use relaydesk_common::TenantId;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(id: &TenantId, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(id)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<TenantId, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse::<i64>().map(TenantId).map_err(de::Error::custom)
    }
}

/// Issues and checks HS256 JWTs. The REST API and the WebSocket hub share
/// one instance.
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: i64,
}

impl TokenVerifier {
    pub fn new(secret: &str, ttl_secs: u64) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            ttl_secs: i64::try_from(ttl_secs).unwrap_or(i64::MAX),
        }
    }

    pub fn issue(&self, tenant_id: TenantId, role: &str) -> Result<String> {
        let claims = Claims {
            sub: tenant_id,
            role: role.to_string(),
            exp: Utc::now().timestamp().saturating_add(self.ttl_secs),
        };
        self.sign(&claims)
    }

    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Authentication(format!("failed to sign token: {e}")))
    }

    /// Returns the claims of a well-signed, unexpired token.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        decode::<Claims>(token.trim(), &self.decoding, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => Error::Authentication("token expired".into()),
                ErrorKind::InvalidSignature => {
                    Error::Authentication("invalid token signature".into())
                }
                _ => {
                    debug!("token rejected: {e}");
                    Error::Authentication("malformed token".into())
                }
            })
    }
}

/// Random 32-byte secret, base64url encoded, for `token_secret` and webhook tokens.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    B64.encode(bytes)
}
