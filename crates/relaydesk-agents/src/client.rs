use relaydesk_common::{Error, Result};
use reqwest::RequestBuilder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

/// Provider error bodies can be large HTML pages; keep the log readable.
const MAX_ERROR_BODY: usize = 512;

/// Connection details shared by the HTTP providers.
pub(crate) struct ApiEndpoint {
    pub(crate) http: reqwest::Client,
    pub(crate) api_key: String,
    pub(crate) model: String,
    base_url: String,
}

impl ApiEndpoint {
    pub(crate) fn new(
        api_key: impl Into<String>,
        model: Option<String>,
        base_url: Option<String>,
        default_model: &str,
        default_base_url: &str,
    ) -> Self {
        let base_url = base_url.unwrap_or_else(|| default_base_url.to_string());
        Self {
            http: reqwest::Client::new(),
            api_key: api_key.into(),
            model: model.unwrap_or_else(|| default_model.to_string()),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a JSON body and decode the JSON answer. Every failure becomes a
    /// `Generation` error naming the provider.
    pub(crate) async fn call<B, R>(
        &self,
        provider: &str,
        request: RequestBuilder,
        body: &B,
    ) -> Result<R>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| Error::Generation(format!("{provider} request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let mut detail = response.text().await.unwrap_or_default();
            if detail.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|i| detail.is_char_boundary(*i))
                    .unwrap_or(0);
                detail.truncate(cut);
            }
            warn!("{provider} answered {status}");
            return Err(Error::Generation(format!(
                "{provider} API error: status={status}, body={detail}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| Error::Generation(format!("failed to parse {provider} response: {e}")))
    }
}
