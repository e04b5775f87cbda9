// =============================================================================
// Store Client — signed REST client for the durable append-only store
// =============================================================================
//
// The concrete backend and its auth handshake are out of scope; this client
// only has to expose the five narrow operations the rest of the engine
// depends on. Requests are HMAC-SHA256 signed the same way as every other
// outbound integration in this codebase.
// =============================================================================

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument, warn};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW: u64 = 10_000;

/// Response envelope for `append_rows`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendResult {
    pub updated_rows: usize,
}

/// A signed REST client for the durable store.
///
/// SECURITY: the secret is never logged or serialized, matching the
/// convention used by every other signed client in this codebase.
#[derive(Clone)]
pub struct StoreClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl StoreClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-STORE-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key,
            secret,
            base_url: base_url.into(),
            client,
        }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_headers(&self, body: &str) -> HeaderMap {
        let ts = Self::timestamp_ms();
        let to_sign = format!("{ts}:{}:{body}", RECV_WINDOW);
        let sig = self.sign(&to_sign);

        let mut headers = HeaderMap::new();
        headers.insert("X-STORE-TIMESTAMP", HeaderValue::from_str(&ts.to_string()).unwrap());
        headers.insert("X-STORE-SIGNATURE", HeaderValue::from_str(&sig).unwrap());
        headers
    }

    /// Append `rows` to `table`. Returns the store's count of rows it
    /// considers written — callers compare this against the submitted
    /// count to detect a partial write.
    #[instrument(skip(self, rows), name = "store::append_rows")]
    pub async fn append_rows(&self, table: &str, rows: &[Value]) -> Result<AppendResult> {
        let body = serde_json::to_string(rows).context("failed to serialise rows")?;
        let url = format!("{}/tables/{}/rows", self.base_url, table);
        let headers = self.signed_headers(&body);

        let resp = self
            .client
            .post(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("append_rows request failed for table {table}"))?;

        let status = resp.status();
        let result: AppendResult = resp
            .json()
            .await
            .with_context(|| format!("failed to parse append_rows response for table {table}"))?;

        if !status.is_success() {
            anyhow::bail!("store append_rows({table}) returned {status}");
        }

        debug!(table, updated_rows = result.updated_rows, "rows appended");
        Ok(result)
    }

    /// Fetch every row currently stored in `table`.
    #[instrument(skip(self), name = "store::get_all_values")]
    pub async fn get_all_values(&self, table: &str) -> Result<Vec<Value>> {
        let url = format!("{}/tables/{}/rows", self.base_url, table);
        let headers = self.signed_headers("");

        let resp = self
            .client
            .get(&url)
            .headers(headers)
            .send()
            .await
            .with_context(|| format!("get_all_values request failed for table {table}"))?;

        let status = resp.status();
        let rows: Vec<Value> = resp
            .json()
            .await
            .with_context(|| format!("failed to parse get_all_values response for table {table}"))?;

        if !status.is_success() {
            anyhow::bail!("store get_all_values({table}) returned {status}");
        }
        Ok(rows)
    }

    /// Overwrite `table` entirely with `rows` (header row plus data). Used
    /// for the "latest view" overwrite-per-cycle tables.
    #[instrument(skip(self, rows), name = "store::resize")]
    pub async fn resize(&self, table: &str, rows: &[Value]) -> Result<()> {
        let body = serde_json::to_string(rows).context("failed to serialise rows")?;
        let url = format!("{}/tables/{}/resize", self.base_url, table);
        let headers = self.signed_headers(&body);

        let resp = self
            .client
            .put(&url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .with_context(|| format!("resize request failed for table {table}"))?;

        if !resp.status().is_success() {
            anyhow::bail!("store resize({table}) returned {}", resp.status());
        }
        Ok(())
    }

    /// Idempotently ensure a top-level container (spreadsheet-equivalent)
    /// exists.
    #[instrument(skip(self), name = "store::open_or_create_container")]
    pub async fn open_or_create_container(&self, name: &str) -> Result<()> {
        self.open_or_create_path("containers", name).await
    }

    /// Idempotently ensure a table (worksheet-equivalent) exists within the
    /// current container.
    #[instrument(skip(self), name = "store::open_or_create_table")]
    pub async fn open_or_create_table(&self, name: &str) -> Result<()> {
        self.open_or_create_path("tables", name).await
    }

    async fn open_or_create_path(&self, kind: &str, name: &str) -> Result<()> {
        let url = format!("{}/{}/{}", self.base_url, kind, name);
        let headers = self.signed_headers("");

        let resp = self
            .client
            .put(&url)
            .headers(headers)
            .send()
            .await
            .with_context(|| format!("open_or_create failed for {kind}/{name}"))?;

        if !resp.status().is_success() {
            warn!(kind, name, status = %resp.status(), "open_or_create returned non-success");
            anyhow::bail!("open_or_create({kind}/{name}) returned {}", resp.status());
        }
        Ok(())
    }
}

/// `system_log` row shape — kept here since it travels exclusively through
/// the store client's append path.
#[derive(Debug, Clone, Serialize)]
pub struct SystemLogRow {
    pub timestamp: String,
    pub level: String,
    pub event: String,
    pub window: Option<String>,
    pub details: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signing_is_deterministic_for_the_same_timestamp_and_body() {
        let client = StoreClient::new("https://store.example", "key", "secret");
        let sig1 = client.sign("1700000000000:10000:body");
        let sig2 = client.sign("1700000000000:10000:body");
        assert_eq!(sig1, sig2);
    }

    #[test]
    fn signing_differs_for_different_payloads() {
        let client = StoreClient::new("https://store.example", "key", "secret");
        let sig1 = client.sign("payload-a");
        let sig2 = client.sign("payload-b");
        assert_ne!(sig1, sig2);
    }

    #[test]
    fn api_key_never_appears_in_signature_payload() {
        let client = StoreClient::new("https://store.example", "my-secret-key", "secret");
        assert!(!client.api_key.is_empty());
        let sig = client.sign("1700000000000:10000:{}");
        assert!(!sig.contains(&client.api_key));
    }
}
