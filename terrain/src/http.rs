//! HTTP transport for remote tiles.

use crate::TerrainError;
use reqwest::StatusCode;
use std::time::Duration;

/// Blocking HTTP GET.
///
/// Implemented by [`ReqwestClient`] and by test doubles.
pub trait HttpClient: Send + Sync {
    /// Returns the response body for `url`.
    fn get(&self, url: &str) -> Result<Vec<u8>, TerrainError>;
}

/// [`HttpClient`] over a blocking reqwest client.
pub struct ReqwestClient {
    client: reqwest::blocking::Client,
}

impl ReqwestClient {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

    pub fn new() -> Result<Self, TerrainError> {
        Self::with_timeout(Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TerrainError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TerrainError::Http(format!("failed to build client, {e}")))?;
        Ok(Self { client })
    }
}

impl HttpClient for ReqwestClient {
    fn get(&self, url: &str) -> Result<Vec<u8>, TerrainError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| TerrainError::Http(format!("GET {url}, {e}")))?;
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(TerrainError::QuotaExceeded(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(TerrainError::Http(format!("HTTP {status} from {url}")));
        }
        let body = response
            .bytes()
            .map_err(|e| TerrainError::Http(format!("reading body of {url}, {e}")))?;
        Ok(body.to_vec())
    }
}
