use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::config::ViewerConfig;
use crate::error::TransportError;
use crate::fetch::{ResourceFetcher, Transport, TransportResponse};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Json(Value),
    Status(u16),
    /// Never answers; resolves to `Aborted` once the request is cancelled.
    Hang,
}

/// Scripted transport. The n-th call to a URL receives the n-th reply of
/// its script, repeating the last one; unknown URLs answer 404.
#[derive(Default)]
pub(crate) struct FakeTransport {
    routes: Mutex<HashMap<String, Vec<Reply>>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn route_json(&self, url: &str, body: Value) {
        self.script(url, vec![Reply::Json(body)]);
    }

    pub(crate) fn script(&self, url: &str, replies: Vec<Reply>) {
        self.routes.lock().insert(url.to_owned(), replies);
    }

    pub(crate) fn calls(&self, url: &str) -> usize {
        self.calls.lock().get(url).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn get(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let call = {
            let mut calls = self.calls.lock();
            let count = calls.entry(url.to_owned()).or_insert(0);
            *count += 1;
            *count - 1
        };
        let reply = self
            .routes
            .lock()
            .get(url)
            .and_then(|replies| replies.get(call).or_else(|| replies.last()).cloned());

        match reply {
            Some(Reply::Json(body)) => Ok(TransportResponse {
                status: 200,
                body: body.to_string(),
            }),
            Some(Reply::Status(status)) => Ok(TransportResponse {
                status,
                body: String::new(),
            }),
            Some(Reply::Hang) => {
                cancel.cancelled().await;
                Err(TransportError::Aborted)
            }
            None => Ok(TransportResponse {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

pub(crate) fn fetcher_over(transport: &Arc<FakeTransport>) -> Arc<ResourceFetcher> {
    let transport: Arc<dyn Transport> = Arc::clone(transport) as Arc<dyn Transport>;
    Arc::new(ResourceFetcher::new(
        transport,
        Arc::new(TtlCache::new()),
        &ViewerConfig::default(),
    ))
}
