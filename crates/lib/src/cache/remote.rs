//! Remote cache protocol and transports.
//!
//! A remote is anything that can `get`/`put` raw bytes by fingerprint. The
//! HTTP transport talks to a plain key/value endpoint:
//!
//! - `GET {base}/cas/{fingerprint}` returns the artifact bytes, 404 on miss
//! - `PUT {base}/cas/{fingerprint}` stores them

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::debug;

use super::{CacheError, CacheTier};
use crate::artifact::Artifact;
use crate::rulekey::Fingerprint;

/// Byte-level remote cache.
#[async_trait]
pub trait RemoteCache: Send + Sync + fmt::Debug {
  fn name(&self) -> &str;

  async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError>;

  async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<(), CacheError>;
}

/// Remote cache over HTTP.
#[derive(Debug, Clone)]
pub struct HttpRemoteCache {
  base_url: String,
  client: reqwest::Client,
}

impl HttpRemoteCache {
  pub fn new(base_url: &str) -> Result<Self, CacheError> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("keel/", env!("CARGO_PKG_VERSION")))
      .timeout(Duration::from_secs(60))
      .build()
      .map_err(|e| CacheError::Remote(e.to_string()))?;

    Ok(Self {
      base_url: base_url.trim_end_matches('/').to_string(),
      client,
    })
  }

  fn url(&self, fingerprint: &Fingerprint) -> String {
    format!("{}/cas/{}", self.base_url, fingerprint)
  }
}

#[async_trait]
impl RemoteCache for HttpRemoteCache {
  fn name(&self) -> &str {
    &self.base_url
  }

  async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
    let url = self.url(fingerprint);
    debug!(url = %url, "remote cache get");

    let response = self
      .client
      .get(&url)
      .send()
      .await
      .map_err(|e| CacheError::Remote(format!("GET {}: {}", url, e)))?;

    match response.status() {
      StatusCode::NOT_FOUND => Ok(None),
      status if status.is_success() => {
        let bytes = response
          .bytes()
          .await
          .map_err(|e| CacheError::Remote(format!("GET {}: {}", url, e)))?;
        Ok(Some(bytes.to_vec()))
      }
      status => Err(CacheError::Remote(format!("GET {}: HTTP {}", url, status))),
    }
  }

  async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<(), CacheError> {
    let url = self.url(fingerprint);
    debug!(url = %url, size = bytes.len(), "remote cache put");

    let response = self
      .client
      .put(&url)
      .body(bytes.to_vec())
      .send()
      .await
      .map_err(|e| CacheError::Remote(format!("PUT {}: {}", url, e)))?;

    if !response.status().is_success() {
      return Err(CacheError::Remote(format!("PUT {}: HTTP {}", url, response.status())));
    }
    Ok(())
  }
}

/// Exposes a [`CacheTier`] as a remote, e.g. a shared disk cache on a
/// network filesystem.
#[derive(Debug, Clone)]
pub struct TierRemote {
  tier: Arc<dyn CacheTier>,
}

impl TierRemote {
  pub fn new(tier: Arc<dyn CacheTier>) -> Self {
    Self { tier }
  }
}

#[async_trait]
impl RemoteCache for TierRemote {
  fn name(&self) -> &str {
    self.tier.name()
  }

  async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Vec<u8>>, CacheError> {
    Ok(
      self
        .tier
        .get(fingerprint)
        .await?
        .map(|entry| entry.artifact.into_content()),
    )
  }

  async fn put(&self, fingerprint: &Fingerprint, bytes: &[u8]) -> Result<(), CacheError> {
    self.tier.put(fingerprint, &Artifact::new(bytes.to_vec())).await?;
    Ok(())
  }
}
