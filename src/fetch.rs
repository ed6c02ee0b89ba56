//! Retrieval of remote federation artifacts.
//!
//! Fetches are time-bounded and retried with exponential backoff + jitter
//! on network errors and 5xx. Nothing here is trusted: bodies are opaque
//! compact JWS strings until the JOSE and entity layers verify them.

use std::time::Duration;

use rand::Rng;
use reqwest::header::ACCEPT;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::errors::{Error, Result};

pub const WELL_KNOWN_PATH: &str = "/.well-known/openid-federation";
pub const ENTITY_STATEMENT_CONTENT_TYPE: &str = "application/entity-statement+jwt";

const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF_MS: u64 = 200;
const MAX_BACKOFF_MS: u64 = 2_000;
const JITTER_MS: u64 = 100;

#[derive(Clone)]
pub struct EntityFetcher {
    client: reqwest::Client,
}

impl EntityFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Internal(anyhow::anyhow!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// GET `{subject}/.well-known/openid-federation` → compact JWS.
    pub async fn entity_configuration(&self, subject: &str) -> Result<String> {
        let url = format!("{}{}", subject.trim_end_matches('/'), WELL_KNOWN_PATH);
        self.get_jws(&url).await
    }

    /// GET `{fetch_endpoint}?sub={subject}` → compact JWS.
    pub async fn entity_statement(&self, fetch_endpoint: &str, subject: &str) -> Result<String> {
        let mut url = url::Url::parse(fetch_endpoint)
            .map_err(|e| Error::FetchFailed(format!("bad fetch endpoint '{fetch_endpoint}': {e}")))?;
        url.query_pairs_mut().append_pair("sub", subject);
        self.get_jws(url.as_str()).await
    }

    async fn get_jws(&self, url: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self
                .client
                .get(url)
                .header(ACCEPT, ENTITY_STATEMENT_CONTENT_TYPE)
                .send()
                .await;

            match outcome {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, "fetched entity statement");
                    let body = resp
                        .text()
                        .await
                        .map_err(|e| Error::FetchFailed(format!("{url}: {e}")))?;
                    return Ok(body.trim().to_string());
                }
                Ok(resp) if resp.status().is_server_error() && attempt <= MAX_RETRIES => {
                    let wait = backoff(attempt);
                    warn!(url = %url, status = %resp.status(), attempt, "retrying in {wait:?}");
                    sleep(wait).await;
                }
                Ok(resp) => {
                    return Err(Error::FetchFailed(format!("{url}: HTTP {}", resp.status())));
                }
                Err(e) if attempt <= MAX_RETRIES => {
                    let wait = backoff(attempt);
                    warn!(url = %url, error = %e, attempt, "retrying in {wait:?}");
                    sleep(wait).await;
                }
                Err(e) => return Err(Error::FetchFailed(format!("{url}: {e}"))),
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let raw = BASE_BACKOFF_MS.saturating_mul(2u64.saturating_pow(attempt - 1));
    let capped = raw.min(MAX_BACKOFF_MS);
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);
    Duration::from_millis(capped + jitter)
}
