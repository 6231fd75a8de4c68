use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::cache::Cache;
use crate::config::ViewerConfig;
use crate::error::{Error, ErrorCode, Result, StructuredError, TransportError};
use crate::json;
use crate::model::{Resource, ResourceKind};
use crate::retry::{with_retry, RetryPolicy};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub status: u16,
    pub body: String,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Issues a single GET. Implementations should stop work and return
/// [`TransportError::Aborted`] once `cancel` fires.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<TransportResponse, TransportError>;
}

pub struct ResourceFetcher {
    transport: Arc<dyn Transport>,
    cache: Arc<dyn Cache<Resource>>,
    timeout: Duration,
    ttl: Duration,
    retry: RetryPolicy,
}

impl ResourceFetcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        cache: Arc<dyn Cache<Resource>>,
        config: &ViewerConfig,
    ) -> Self {
        Self {
            transport,
            cache,
            timeout: config.fetch_timeout,
            ttl: config.cache_ttl,
            retry: config.retry_policy(),
        }
    }

    pub async fn fetch_resource(&self, url: &str, cancel: &CancellationToken) -> Result<Resource> {
        self.fetch_resource_with_timeout(url, cancel, self.timeout)
            .await
    }

    /// Cache-aware fetch. Fresh cache entries are returned without touching
    /// the network; misses go through the retry executor, bounded by
    /// `timeout` per attempt and by `cancel` overall.
    #[instrument(skip(self, cancel))]
    pub async fn fetch_resource_with_timeout(
        &self,
        url: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Resource> {
        if let Some(resource) = self.cache.get(url) {
            debug!(url, "resource cache hit");
            return Ok(resource);
        }

        let resource = with_retry(&self.retry, Error::is_recoverable, |_| {
            self.fetch_once(url, cancel, timeout)
        })
        .await?;

        self.cache.put(url, resource.clone(), self.ttl);
        Ok(resource)
    }

    async fn fetch_once(
        &self,
        url: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<Resource> {
        if cancel.is_cancelled() {
            return Err(Error::Aborted);
        }
        let request = cancel.child_token();

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Aborted),
            outcome = tokio::time::timeout(timeout, self.transport.get(url, &request)) => outcome,
        };

        let response = match outcome {
            Err(_) => {
                request.cancel();
                return Err(StructuredError::timed_out(
                    ErrorCode::NetworkManifestFetch,
                    url,
                    timeout.as_millis(),
                )
                .into());
            }
            Ok(Err(TransportError::Aborted)) => return Err(Error::Aborted),
            Ok(Err(err)) => {
                return Err(StructuredError::new(
                    ErrorCode::NetworkManifestFetch,
                    format!("{err} ({url})"),
                    true,
                )
                .into())
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            return Err(
                StructuredError::http_status(ErrorCode::NetworkManifestFetch, url, response.status)
                    .into(),
            );
        }

        classify(url, &response.body)
    }
}

fn classify(url: &str, body: &str) -> Result<Resource> {
    let payload: Value = serde_json::from_str(body)
        .map_err(|err| Error::parse(format!("invalid JSON at {url}: {err}")))?;
    let declared = json::type_of(&payload).unwrap_or_default();
    let kind = ResourceKind::from_declared(declared).ok_or_else(|| {
        Error::parse(format!("Unknown IIIF resource type {declared:?} at {url}"))
    })?;
    Ok(Resource {
        url: url.to_owned(),
        kind,
        payload: Arc::new(payload),
    })
}
