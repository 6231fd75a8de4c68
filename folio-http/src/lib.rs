use async_trait::async_trait;
use folio_core::{Transport, TransportError, TransportResponse};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

const ACCEPT_IIIF: &str = "application/ld+json, application/json;q=0.9, */*;q=0.1";

/// [`Transport`] over a shared `reqwest` client. Timeouts are left to the
/// caller, which bounds every attempt itself.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_IIIF));
        let client = Client::builder()
            .user_agent(concat!("folio/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    #[instrument(skip(self, cancel))]
    async fn get(
        &self,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<TransportResponse, TransportError> {
        let exchange = async {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| TransportError::Connect(err.to_string()))?;
            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|err| TransportError::Body(err.to_string()))?;
            Ok(TransportResponse { status, body })
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(url, "request cancelled");
                Err(TransportError::Aborted)
            }
            outcome = exchange => {
                if let Ok(response) = &outcome {
                    debug!(url, status = response.status, bytes = response.body.len(), "response received");
                }
                outcome
            }
        }
    }
}
