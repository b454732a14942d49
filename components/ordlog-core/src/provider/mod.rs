use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::{Client as HttpClient, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::try_warn;
use crate::utils::Context;

const RETRY_DELAY_SECS: u64 = 2;

#[derive(Debug, Error)]
pub enum ProviderError {
    /// 500/502 responses that survived the bounded retry budget. The caller
    /// surfaces these as a backfill failure instead of crashing the cycle.
    #[error("provider returned retryable status {status} for {url}")]
    Retryable { status: u16, url: String },
    #[error("provider request failed: {0}")]
    Transport(String),
    #[error("provider response malformed: {0}")]
    Malformed(String),
}

/// `GET {provider}/block/{height}`
#[derive(Debug, Clone, Deserialize)]
pub struct BlockListing {
    pub hash: String,
    pub inscriptions: Vec<String>,
}

/// `GET {provider}/api/inscription/{id}`
#[derive(Debug, Clone, Deserialize)]
pub struct InscriptionDetail {
    pub inscription_number: i64,
    pub genesis_height: u64,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub satpoint: Option<String>,
    #[serde(default)]
    pub sat: Option<u64>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub output_value: Option<u64>,
    #[serde(default)]
    pub charms: Vec<String>,
    #[serde(default)]
    pub metadata: Option<BTreeMap<String, JsonValue>>,
    #[serde(default)]
    pub metaprotocol: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// `GET {provider}/content/{id}`: raw bytes plus the content-type header.
#[derive(Debug, Clone)]
pub struct ContentResponse {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Clone)]
pub struct ProviderClient {
    base_url: String,
    client: HttpClient,
    max_attempts: usize,
}

impl ProviderClient {
    pub fn new(config: &ProviderConfig) -> Result<ProviderClient, String> {
        let client = HttpClient::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| format!("unable to build provider http client: {e}"))?;
        Ok(ProviderClient {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
            max_attempts: config.max_attempts.max(1),
        })
    }

    pub async fn get_block(
        &self,
        block_height: u64,
        ctx: &Context,
    ) -> Result<BlockListing, ProviderError> {
        let url = format!("{}/block/{}", self.base_url, block_height);
        let response = self.send_with_retry(&url, ctx).await?;
        response
            .json::<BlockListing>()
            .await
            .map_err(|e| ProviderError::Malformed(format!("block listing for {url}: {e}")))
    }

    pub async fn get_inscription(
        &self,
        inscription_id: &str,
        ctx: &Context,
    ) -> Result<InscriptionDetail, ProviderError> {
        let url = format!("{}/api/inscription/{}", self.base_url, inscription_id);
        let response = self.send_with_retry(&url, ctx).await?;
        response
            .json::<InscriptionDetail>()
            .await
            .map_err(|e| ProviderError::Malformed(format!("inscription detail for {url}: {e}")))
    }

    pub async fn get_content(
        &self,
        inscription_id: &str,
        ctx: &Context,
    ) -> Result<ContentResponse, ProviderError> {
        let url = format!("{}/content/{}", self.base_url, inscription_id);
        let response = self.send_with_retry(&url, ctx).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ProviderError::Transport(format!("unable to read content body: {e}")))?;
        Ok(ContentResponse {
            bytes: bytes.to_vec(),
            content_type,
        })
    }

    /// 500/502 are retried with a delay up to the configured attempt
    /// budget; every other failure propagates on the first occurrence.
    async fn send_with_retry(
        &self,
        url: &str,
        ctx: &Context,
    ) -> Result<reqwest::Response, ProviderError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = self
                .client
                .get(url)
                .header("Accept", "application/json")
                .send()
                .await
                .map_err(|e| ProviderError::Transport(format!("{url}: {e}")))?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if matches!(
                status,
                StatusCode::INTERNAL_SERVER_ERROR | StatusCode::BAD_GATEWAY
            ) {
                if attempt < self.max_attempts {
                    try_warn!(
                        ctx,
                        "Provider returned {} for {}, retrying ({}/{})",
                        status.as_u16(),
                        url,
                        attempt,
                        self.max_attempts
                    );
                    std::thread::sleep(Duration::from_secs(RETRY_DELAY_SECS));
                    continue;
                }
                return Err(ProviderError::Retryable {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            return Err(ProviderError::Transport(format!(
                "status {} for {}",
                status.as_u16(),
                url
            )));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_listing_deserializes() {
        let listing: BlockListing = serde_json::from_str(
            r#"{"hash":"000000abc","inscriptions":["a1i0","b2i0"]}"#,
        )
        .unwrap();
        assert_eq!(listing.hash, "000000abc");
        assert_eq!(listing.inscriptions.len(), 2);
    }

    #[test]
    fn inscription_detail_tolerates_missing_optional_fields() {
        let detail: InscriptionDetail = serde_json::from_str(
            r#"{"inscription_number":42,"genesis_height":840000}"#,
        )
        .unwrap();
        assert_eq!(detail.inscription_number, 42);
        assert_eq!(detail.genesis_height, 840000);
        assert_eq!(detail.sat, None);
        assert!(detail.charms.is_empty());
    }

    #[test]
    fn inscription_detail_reads_the_full_shape() {
        let detail: InscriptionDetail = serde_json::from_str(
            r#"{
                "inscription_number": 42,
                "genesis_height": 840000,
                "address": "bc1qexample",
                "satpoint": "abc:0:0",
                "sat": 5000000000,
                "timestamp": 1700000000,
                "output_value": 546,
                "charms": ["cursed", "vindicated"],
                "metaprotocol": "cbrc-20:deploy",
                "content_type": "text/plain"
            }"#,
        )
        .unwrap();
        assert_eq!(detail.satpoint.as_deref(), Some("abc:0:0"));
        assert_eq!(detail.charms, vec!["cursed", "vindicated"]);
        assert_eq!(detail.metaprotocol.as_deref(), Some("cbrc-20:deploy"));
    }
}
