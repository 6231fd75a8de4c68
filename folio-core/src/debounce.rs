use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::SearchSnippet;
use crate::search::SearchAggregator;

#[derive(Debug)]
pub struct SearchOutcome {
    pub query: String,
    pub result: Result<Vec<SearchSnippet>>,
}

struct ScheduledSearch {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Runs at most one search at a time. Each submission replaces the
/// previous one, whether it is still waiting out the debounce delay or
/// already talking to the network.
pub struct SearchDebouncer {
    aggregator: Arc<SearchAggregator>,
    delay: Duration,
    outcomes: UnboundedSender<SearchOutcome>,
    current: Option<ScheduledSearch>,
}

impl SearchDebouncer {
    pub fn new(
        aggregator: Arc<SearchAggregator>,
        delay: Duration,
    ) -> (Self, UnboundedReceiver<SearchOutcome>) {
        let (outcomes, receiver) = mpsc::unbounded_channel();
        let debouncer = Self {
            aggregator,
            delay,
            outcomes,
            current: None,
        };
        (debouncer, receiver)
    }

    /// Must be called from within a tokio runtime.
    pub fn submit(&mut self, query: impl Into<String>, endpoint: impl Into<String>) {
        self.cancel();

        let query = query.into();
        let endpoint = endpoint.into();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let aggregator = Arc::clone(&self.aggregator);
        let outcomes = self.outcomes.clone();
        let delay = self.delay;

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let result = aggregator.search(&endpoint, &token).await;
            if matches!(result, Err(Error::Aborted)) || token.is_cancelled() {
                debug!(%query, "search superseded");
                return;
            }
            let _ = outcomes.send(SearchOutcome { query, result });
        });

        self.current = Some(ScheduledSearch { cancel, task });
    }

    /// Cancels the pending or in-flight search, if any.
    pub fn cancel(&mut self) {
        if let Some(previous) = self.current.take() {
            previous.cancel.cancel();
            previous.task.abort();
        }
    }
}

impl Drop for SearchDebouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fetcher_over, FakeTransport, Reply};
    use serde_json::json;

    fn result_page() -> serde_json::Value {
        json!({
            "type": "AnnotationPage",
            "items": [{"id": "b1", "target": "c1#xywh=0,0,1,1"}],
            "annotations": [{"items": [{
                "id": "h1",
                "motivation": "highlighting",
                "target": {"source": "b1", "selector": {"type": "TextQuoteSelector", "exact": "word"}}
            }]}]
        })
    }

    #[tokio::test(start_paused = true)]
    async fn later_submission_supersedes_earlier_one() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_json("https://x/s?q=wo", result_page());
        transport.route_json("https://x/s?q=word", result_page());
        let aggregator = Arc::new(SearchAggregator::new(fetcher_over(&transport), 10));
        let (mut debouncer, mut outcomes) =
            SearchDebouncer::new(aggregator, Duration::from_millis(300));

        debouncer.submit("wo", "https://x/s?q=wo");
        tokio::time::sleep(Duration::from_millis(100)).await;
        debouncer.submit("word", "https://x/s?q=word");

        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.query, "word");
        assert_eq!(outcome.result.unwrap().len(), 1);
        assert_eq!(transport.calls("https://x/s?q=wo"), 0);
        assert!(outcomes.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_search_is_aborted_silently() {
        let transport = Arc::new(FakeTransport::new());
        transport.script("https://x/s?q=slow", vec![Reply::Hang]);
        transport.route_json("https://x/s?q=fast", result_page());
        let aggregator = Arc::new(SearchAggregator::new(fetcher_over(&transport), 10));
        let (mut debouncer, mut outcomes) =
            SearchDebouncer::new(aggregator, Duration::from_millis(300));

        debouncer.submit("slow", "https://x/s?q=slow");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(transport.calls("https://x/s?q=slow"), 1);

        debouncer.submit("fast", "https://x/s?q=fast");
        let outcome = outcomes.recv().await.unwrap();
        assert_eq!(outcome.query, "fast");
        assert!(outcomes.try_recv().is_err());
    }
}
