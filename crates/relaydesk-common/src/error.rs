use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    #[error("provisioning error: {0}")]
    Provisioning(String),

    #[error("verification failed: {0}")]
    VerificationFailed(String),

    #[error("delivery error on {channel}: {detail}")]
    Delivery {
        channel: String,
        detail: String,
        /// Network failures, rate limits and provider 5xx responses.
        transient: bool,
    },

    #[error("generation error: {0}")]
    Generation(String),

    #[error("authentication error: {0}")]
    Authentication(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("gateway error: {0}")]
    Gateway(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn tenant_not_found(tenant: impl std::fmt::Display) -> Self {
        Self::TenantNotFound(tenant.to_string())
    }

    pub fn delivery(
        channel: impl Into<String>,
        detail: impl Into<String>,
        transient: bool,
    ) -> Self {
        Self::Delivery {
            channel: channel.into(),
            detail: detail.into(),
            transient,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Delivery { transient: true, .. })
    }
}
