use std::time::Duration;

use tracing::debug;

use crate::{check_size, FetchError, Fetcher, HttpOptions, Locator};

/// Plain HTTP(S) downloads, e.g. chart repository `.tgz` links.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(opts: &HttpOptions) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(opts.timeout.max(1)))
            .danger_accept_invalid_certs(opts.insecure_skip_verify)
            .build()
            .map_err(|e| FetchError::Transport { scheme: "http", reason: e.to_string() })?;
        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &'static str { "http" }

    fn provides(&self, scheme: &str) -> bool { scheme == "http" || scheme == "https" }

    async fn get(&self, locator: &Locator) -> Result<Vec<u8>, FetchError> {
        let url = locator.url().ok_or_else(|| FetchError::invalid(locator.as_str(), "not a URL"))?;
        debug!(url = %url, "http get");
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::unavailable(locator.as_str(), e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::unavailable(locator.as_str(), format!("HTTP {}", status)));
        }
        if let Some(len) = resp.content_length() {
            check_size(locator.as_str(), len)?;
        }
        let body = resp.bytes().await.map_err(|e| FetchError::unavailable(locator.as_str(), e))?;
        check_size(locator.as_str(), body.len() as u64)?;
        Ok(body.to_vec())
    }
}
