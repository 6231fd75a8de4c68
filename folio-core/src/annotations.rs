use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::cache::Cache;
use crate::document::canvas_nodes;
use crate::error::{Error, ErrorCode, Result, StructuredError};
use crate::fetch::ResourceFetcher;
use crate::json::{id_of, one_or_many, ref_id, strip_fragment};
use crate::model::{Annotation, AnnotationBody, ResourceKind};
use crate::target::normalize_target;

/// Parsed manifest documents stay cached for the life of the process.
const DOCUMENT_TTL: Duration = Duration::MAX;

/// Annotations gathered across a page chain, keyed by id in first-seen order.
#[derive(Default)]
struct AnnotationSet {
    order: Vec<String>,
    by_id: HashMap<String, Annotation>,
}

impl AnnotationSet {
    fn absorb_page(&mut self, page: &Value, canvas_url: &str) {
        let entries = page.get("items").or_else(|| page.get("resources"));
        for entry in one_or_many(entries) {
            let Some(id) = id_of(entry) else {
                debug!("skipping annotation without id");
                continue;
            };
            let target = entry.get("target").or_else(|| entry.get("on"));
            let matching: Vec<String> = target
                .map(normalize_target)
                .unwrap_or_default()
                .into_iter()
                .filter(|t| strip_fragment(t) == canvas_url)
                .collect();
            if matching.is_empty() {
                continue;
            }

            if let Some(existing) = self.by_id.get_mut(id) {
                existing.target.extend(matching);
                continue;
            }
            self.order.push(id.to_owned());
            self.by_id.insert(
                id.to_owned(),
                Annotation {
                    id: id.to_owned(),
                    motivation: first_motivation(entry.get("motivation")),
                    target: matching,
                    body: bodies(entry.get("body").or_else(|| entry.get("resource"))),
                },
            );
        }
    }

    fn into_vec(mut self) -> Vec<Annotation> {
        self.order
            .iter()
            .filter_map(|id| self.by_id.remove(id))
            .collect()
    }
}

fn first_motivation(motivation: Option<&Value>) -> Option<String> {
    one_or_many(motivation)
        .into_iter()
        .find_map(Value::as_str)
        .map(str::to_owned)
}

fn bodies(body: Option<&Value>) -> Vec<AnnotationBody> {
    one_or_many(body)
        .into_iter()
        .filter_map(|body| {
            let value = body
                .get("value")
                .or_else(|| body.get("chars"))
                .and_then(Value::as_str)?;
            let language = one_or_many(body.get("language"))
                .into_iter()
                .find_map(Value::as_str)
                .map(str::to_owned);
            Some(AnnotationBody {
                value: value.to_owned(),
                language,
            })
        })
        .collect()
}

fn next_link(page: &Value) -> Option<String> {
    page.get("next").and_then(ref_id).map(str::to_owned)
}

fn has_entries(page: &Value) -> bool {
    page.get("items").or_else(|| page.get("resources")).is_some()
}

pub struct AnnotationResolver {
    fetcher: Arc<ResourceFetcher>,
    documents: Arc<dyn Cache<Arc<Value>>>,
}

impl AnnotationResolver {
    pub fn new(fetcher: Arc<ResourceFetcher>, documents: Arc<dyn Cache<Arc<Value>>>) -> Self {
        Self { fetcher, documents }
    }

    /// All annotations on `canvas_url`'s annotation pages that target it.
    /// An unknown canvas yields an empty list.
    #[instrument(skip(self, cancel))]
    pub async fn annotations_for_canvas(
        &self,
        manifest_url: &str,
        canvas_url: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Annotation>> {
        let document = self.document(manifest_url, cancel).await?;
        let Some(canvas) = canvas_nodes(&document)
            .into_iter()
            .find(|canvas| id_of(canvas) == Some(canvas_url))
        else {
            warn!(manifest_url, canvas_url, "canvas not found in manifest");
            return Ok(Vec::new());
        };

        let mut set = AnnotationSet::default();
        let mut seen_pages = HashSet::new();
        let mut pages = one_or_many(canvas.get("annotations"));
        pages.extend(one_or_many(canvas.get("otherContent")));

        for page in pages {
            let mut next = if has_entries(page) {
                set.absorb_page(page, canvas_url);
                next_link(page)
            } else {
                ref_id(page).map(str::to_owned)
            };

            while let Some(url) = next.take() {
                if !seen_pages.insert(url.clone()) {
                    debug!(%url, "annotation page already read");
                    break;
                }
                if cancel.is_cancelled() {
                    return Err(Error::Aborted);
                }
                let resource = self
                    .fetcher
                    .fetch_resource(&url, cancel)
                    .await
                    .map_err(|err| err.retag_network(ErrorCode::NetworkAnnotationFetch))?;
                if resource.kind != ResourceKind::AnnotationPage {
                    return Err(StructuredError::new(
                        ErrorCode::NetworkAnnotationFetch,
                        format!("expected an AnnotationPage at {url}"),
                        true,
                    )
                    .into());
                }
                set.absorb_page(&resource.payload, canvas_url);
                next = next_link(&resource.payload);
            }
        }

        let annotations = set.into_vec();
        debug!(count = annotations.len(), "annotations resolved");
        Ok(annotations)
    }

    async fn document(&self, manifest_url: &str, cancel: &CancellationToken) -> Result<Arc<Value>> {
        if let Some(document) = self.documents.get(manifest_url) {
            return Ok(document);
        }
        let resource = self.fetcher.fetch_resource(manifest_url, cancel).await?;
        if resource.kind != ResourceKind::Manifest {
            return Err(Error::parse(format!("expected a Manifest at {manifest_url}")));
        }
        self.documents
            .put(manifest_url, Arc::clone(&resource.payload), DOCUMENT_TTL);
        Ok(resource.payload)
    }
}
