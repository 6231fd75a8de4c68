use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::error::{Error, ErrorCode, Result, StructuredError};
use crate::fetch::ResourceFetcher;
use crate::json::{id_of, one_or_many, ref_id, strip_fragment, type_of};
use crate::model::{ResourceKind, SearchSnippet};

pub const HIT_MOTIVATIONS: [&str; 2] = ["highlighting", "contextualizing"];

/// Exact match against [`HIT_MOTIVATIONS`]; for arrays any element may match.
pub fn is_hit_motivation(motivation: Option<&Value>) -> bool {
    one_or_many(motivation)
        .into_iter()
        .filter_map(Value::as_str)
        .any(|m| HIT_MOTIVATIONS.contains(&m))
}

/// Accumulates base annotations and hits across result pages.
#[derive(Debug, Default)]
pub struct SearchCollector {
    base: HashMap<String, Value>,
    hits: Vec<Value>,
}

impl SearchCollector {
    pub fn absorb_page(&mut self, page: &Value) {
        for item in one_or_many(page.get("items")) {
            if let Some(id) = id_of(item) {
                self.base.insert(id.to_owned(), item.clone());
            }
        }
        for hit_page in one_or_many(page.get("annotations")) {
            for hit in one_or_many(hit_page.get("items")) {
                if is_hit_motivation(hit.get("motivation")) {
                    self.hits.push(hit.clone());
                }
            }
        }
    }

    pub fn hit_count(&self) -> usize {
        self.hits.len()
    }

    pub fn into_snippets(self) -> Vec<SearchSnippet> {
        let mut snippets = Vec::new();
        for hit in &self.hits {
            self.expand_hit(hit, &mut snippets);
        }
        snippets
    }

    fn expand_hit(&self, hit: &Value, out: &mut Vec<SearchSnippet>) {
        let Some(hit_id) = id_of(hit) else {
            warn!("search hit without id");
            return;
        };
        let motivation = one_or_many(hit.get("motivation"))
            .into_iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(", ");
        let hit_language = body_language(hit);

        for (index, target) in one_or_many(hit.get("target")).into_iter().enumerate() {
            let source = match target {
                Value::String(s) => Some(s.as_str()),
                _ => target.get("source").and_then(ref_id),
            };
            let Some(source) = source else {
                warn!(hit_id, index, "search hit target has no source");
                continue;
            };
            let Some(base) = self.base.get(source) else {
                warn!(hit_id, source, "search hit references unknown annotation");
                continue;
            };
            let base_target = one_or_many(base.get("target")).into_iter().next();
            let Some(canvas_target) = base_target.and_then(canvas_of) else {
                warn!(hit_id, source, "base annotation has no canvas target");
                continue;
            };

            let quote = target
                .get("selector")
                .or_else(|| hit.get("selector"))
                .and_then(text_quote);
            let Some((prefix, exact, suffix)) = quote else {
                debug!(hit_id, index, "search hit has no quoted text");
                continue;
            };
            let Some(exact) = exact else {
                debug!(hit_id, index, "search hit has no exact text");
                continue;
            };

            out.push(SearchSnippet {
                id: if index == 0 {
                    hit_id.to_owned()
                } else {
                    format!("{hit_id}-{index}")
                },
                annotation_id: source.to_owned(),
                motivation: motivation.clone(),
                prefix,
                exact,
                suffix,
                canvas_target: strip_fragment(canvas_target).to_owned(),
                part_of: base_target.and_then(owning_manifest),
                language: hit_language.clone().or_else(|| body_language(base)),
            });
        }
    }
}

fn canvas_of(target: &Value) -> Option<&str> {
    match target {
        Value::String(s) => Some(s.as_str()),
        Value::Object(_) => id_of(target).or_else(|| target.get("source").and_then(ref_id)),
        _ => None,
    }
}

fn owning_manifest(target: &Value) -> Option<String> {
    let direct = one_or_many(target.get("partOf"))
        .into_iter()
        .find_map(ref_id)
        .map(str::to_owned);
    direct.or_else(|| {
        target
            .get("source")
            .filter(|source| source.is_object())
            .and_then(owning_manifest)
    })
}

fn body_language(annotation: &Value) -> Option<String> {
    one_or_many(annotation.get("body"))
        .into_iter()
        .find_map(|body| body.get("language").and_then(Value::as_str))
        .map(str::to_owned)
}

type Quote = (Option<String>, Option<String>, Option<String>);

/// Picks the selector declared as `TextQuoteSelector`, whatever other fields it carries.
fn text_quote(selector: &Value) -> Option<Quote> {
    match selector {
        Value::Array(selectors) => selectors.iter().find_map(text_quote),
        Value::Object(_) if type_of(selector) == Some("TextQuoteSelector") => {
            let field = |key: &str| selector.get(key).and_then(Value::as_str).map(str::to_owned);
            Some((field("prefix"), field("exact"), field("suffix")))
        }
        _ => None,
    }
}

pub struct SearchAggregator {
    fetcher: Arc<ResourceFetcher>,
    max_pages: usize,
}

impl SearchAggregator {
    pub fn new(fetcher: Arc<ResourceFetcher>, max_pages: usize) -> Self {
        Self {
            fetcher,
            max_pages: max_pages.max(1),
        }
    }

    /// Walks result pages from `endpoint` (at most `max_pages`) and turns
    /// every hit into snippets.
    #[instrument(skip(self, cancel))]
    pub async fn search(&self, endpoint: &str, cancel: &CancellationToken) -> Result<Vec<SearchSnippet>> {
        let mut collector = SearchCollector::default();
        let mut next = Some(endpoint.to_owned());
        let mut pages = 0;

        while let Some(url) = next.take() {
            if pages >= self.max_pages {
                debug!(pages, "search page limit reached");
                break;
            }
            if cancel.is_cancelled() {
                return Err(Error::Aborted);
            }
            let resource = self
                .fetcher
                .fetch_resource(&url, cancel)
                .await
                .map_err(|err| search_failure(err, &url))?;
            if resource.kind != ResourceKind::AnnotationPage {
                return Err(StructuredError::new(
                    ErrorCode::NetworkSearchFetch,
                    format!("search response at {url} is not an AnnotationPage"),
                    true,
                )
                .into());
            }
            collector.absorb_page(&resource.payload);
            next = resource
                .payload
                .get("next")
                .and_then(ref_id)
                .map(str::to_owned);
            pages += 1;
        }

        debug!(pages, hits = collector.hit_count(), "search pages collected");
        Ok(collector.into_snippets())
    }
}

fn search_failure(err: Error, url: &str) -> Error {
    match err {
        Error::Aborted => Error::Aborted,
        Error::Structured(err) if err.code == ErrorCode::ParsingManifest => {
            StructuredError::new(
                ErrorCode::NetworkSearchFetch,
                format!("invalid search response at {url}: {}", err.message),
                true,
            )
            .into()
        }
        other => other.retag_network(ErrorCode::NetworkSearchFetch),
    }
}
