use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::{Error, Result};
use crate::fetch::ResourceFetcher;
use crate::json::{dimension, id_of, label_text, one_or_many, ref_id, strip_fragment, type_of};
use crate::model::{
    Canvas, Collection, Image, ImageType, Manifest, Resource, ResourceKind, DEFAULT_CANVAS_SIZE,
};
use crate::target::normalize_target;

pub const MAX_COLLECTION_DEPTH: usize = 32;

/// Hosts whose image service base URL redirects incorrectly unless
/// `info.json` is requested explicitly.
const INFO_JSON_HOSTS: &[&str] = &["iiif.io"];

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDocument {
    pub first_manifest: Option<Manifest>,
    pub manifest_urls: Vec<String>,
    pub total: usize,
    pub collection: Option<Collection>,
}

impl ResolvedDocument {
    pub fn is_collection(&self) -> bool {
        self.collection.is_some()
    }
}

#[derive(Default)]
struct CollectionWalk {
    visited: HashSet<String>,
    manifest_urls: Vec<String>,
    first_manifest: Option<Manifest>,
}

pub struct DocumentResolver {
    fetcher: Arc<ResourceFetcher>,
}

impl DocumentResolver {
    pub fn new(fetcher: Arc<ResourceFetcher>) -> Self {
        Self { fetcher }
    }

    #[instrument(skip(self, cancel))]
    pub async fn resolve(&self, url: &str, cancel: &CancellationToken) -> Result<ResolvedDocument> {
        let resource = self.fetcher.fetch_resource(url, cancel).await?;
        match resource.kind {
            ResourceKind::Manifest => {
                let manifest = parse_manifest(&resource)?;
                Ok(ResolvedDocument {
                    first_manifest: Some(manifest),
                    manifest_urls: Vec::new(),
                    total: 1,
                    collection: None,
                })
            }
            ResourceKind::Collection => {
                let mut walk = CollectionWalk::default();
                self.visit_collection(&resource.payload, 0, &mut walk, cancel)
                    .await?;
                let payload = &resource.payload;
                let (search_service, autocomplete_service) = discover_services(payload);
                let collection = Collection {
                    id: id_of(payload).unwrap_or(url).to_owned(),
                    name: label_text(payload.get("label"))
                        .unwrap_or_else(|| id_of(payload).unwrap_or(url).to_owned()),
                    search_service,
                    autocomplete_service,
                    manifest_urls: walk.manifest_urls.clone(),
                };
                debug!(url, total = walk.manifest_urls.len(), "resolved collection");
                Ok(ResolvedDocument {
                    first_manifest: walk.first_manifest,
                    total: walk.manifest_urls.len(),
                    manifest_urls: walk.manifest_urls,
                    collection: Some(collection),
                })
            }
            ResourceKind::AnnotationPage => Err(Error::parse("Unknown IIIF resource type")),
        }
    }

    /// Fetches (cache-aware) and parses the manifest at `url`.
    pub async fn load_manifest(&self, url: &str, cancel: &CancellationToken) -> Result<Manifest> {
        let resource = self.fetcher.fetch_resource(url, cancel).await?;
        if resource.kind != ResourceKind::Manifest {
            return Err(Error::parse(format!("expected a Manifest at {url}")));
        }
        parse_manifest(&resource)
    }

    fn visit_collection<'a>(
        &'a self,
        node: &'a Value,
        depth: usize,
        walk: &'a mut CollectionWalk,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if depth > MAX_COLLECTION_DEPTH {
                warn!(depth, "collection nesting too deep; not descending further");
                return Ok(());
            }
            if let Some(id) = id_of(node) {
                if !walk.visited.insert(id.to_owned()) {
                    debug!(id, "collection already visited");
                    return Ok(());
                }
            }

            let members = collection_members(node);
            let manifests: Vec<&Value> = members
                .iter()
                .copied()
                .filter(|member| member_kind(member) == Some(ResourceKind::Manifest))
                .collect();

            for manifest in &manifests {
                let Some(url) = ref_id(manifest) else {
                    continue;
                };
                walk.manifest_urls.push(url.to_owned());
                if walk.first_manifest.is_none() {
                    walk.first_manifest = Some(self.load_manifest(url, cancel).await?);
                }
            }

            if !manifests.is_empty() {
                return Ok(());
            }

            for sub in members
                .into_iter()
                .filter(|member| member_kind(member) == Some(ResourceKind::Collection))
            {
                if !collection_members(sub).is_empty() {
                    self.visit_collection(sub, depth + 1, walk, cancel).await?;
                    continue;
                }
                let Some(url) = ref_id(sub) else {
                    continue;
                };
                let resource = self.fetcher.fetch_resource(url, cancel).await?;
                if resource.kind != ResourceKind::Collection {
                    warn!(url, kind = ?resource.kind, "collection member is not a collection");
                    continue;
                }
                self.visit_collection(&resource.payload, depth + 1, walk, cancel)
                    .await?;
            }
            Ok(())
        })
    }
}

fn member_kind(member: &Value) -> Option<ResourceKind> {
    type_of(member).and_then(ResourceKind::from_declared)
}

fn collection_members(node: &Value) -> Vec<&Value> {
    for key in ["items", "members"] {
        if let Some(items) = node.get(key).and_then(Value::as_array) {
            return items.iter().collect();
        }
    }
    let mut members = one_or_many(node.get("manifests"));
    members.extend(one_or_many(node.get("collections")));
    members
}

pub fn parse_manifest(resource: &Resource) -> Result<Manifest> {
    parse_manifest_value(&resource.url, &resource.payload)
}

pub fn parse_manifest_value(url: &str, payload: &Value) -> Result<Manifest> {
    let id = id_of(payload).unwrap_or(url).to_owned();
    let name = label_text(payload.get("label")).unwrap_or_else(|| id.clone());

    let mut canvases = Vec::new();
    let mut images = Vec::new();
    for node in canvas_nodes(payload) {
        let canvas_id = id_of(node)
            .ok_or_else(|| Error::parse(format!("canvas without id in {url}")))?
            .to_owned();
        canvases.push(Canvas {
            id: canvas_id,
            width: dimension(node, "width").unwrap_or(DEFAULT_CANVAS_SIZE),
            height: dimension(node, "height").unwrap_or(DEFAULT_CANVAS_SIZE),
            label: label_text(node.get("label")),
        });

        for annotation in painting_annotations(node) {
            let target = annotation.get("target").or_else(|| annotation.get("on"));
            let targets = target.map(normalize_target).unwrap_or_default();
            let [canvas_target] = targets.as_slice() else {
                return Err(Error::parse(format!(
                    "painting annotation must target exactly one canvas, found {}",
                    targets.len()
                )));
            };
            images.push(extract_image(annotation, strip_fragment(canvas_target))?);
        }
    }

    let (search_service, autocomplete_service) = discover_services(payload);
    Ok(Manifest {
        id,
        name,
        canvases,
        images,
        search_service,
        autocomplete_service,
    })
}

pub(crate) fn canvas_nodes(payload: &Value) -> Vec<&Value> {
    if let Some(items) = payload.get("items").and_then(Value::as_array) {
        return items.iter().collect();
    }
    payload
        .get("sequences")
        .and_then(Value::as_array)
        .and_then(|sequences| sequences.first())
        .map(|sequence| one_or_many(sequence.get("canvases")))
        .unwrap_or_default()
}

fn painting_annotations(canvas: &Value) -> Vec<&Value> {
    if let Some(pages) = canvas.get("items").and_then(Value::as_array) {
        return pages
            .iter()
            .flat_map(|page| one_or_many(page.get("items")))
            .filter(|annotation| {
                annotation
                    .get("motivation")
                    .map_or(true, |m| one_or_many(Some(m)).iter().any(|m| m.as_str() == Some("painting")))
            })
            .collect();
    }
    one_or_many(canvas.get("images"))
}

fn extract_image(annotation: &Value, canvas_target: &str) -> Result<Image> {
    let body = annotation.get("body").or_else(|| annotation.get("resource"));
    let mut resource = one_or_many(body).into_iter().next();
    if let Some(choice) = resource.filter(|r| type_of(r) == Some("Choice")) {
        resource = one_or_many(choice.get("items")).into_iter().next();
    }
    let resource = resource.ok_or_else(|| Error::parse("Unable to get image resource id."))?;

    let service = one_or_many(resource.get("service"))
        .into_iter()
        .find(|service| is_image_service(service) && id_of(service).is_some());
    if let Some(service) = service {
        let base = id_of(service).unwrap_or_default();
        return Ok(Image {
            image_url: normalize_service_url(base),
            image_type: ImageType::ServiceBacked,
            width: dimension(service, "width").or_else(|| dimension(resource, "width")),
            height: dimension(service, "height").or_else(|| dimension(resource, "height")),
            canvas_target: canvas_target.to_owned(),
        });
    }

    let image_url = id_of(resource)
        .or_else(|| resource.get("source").and_then(ref_id))
        .or_else(|| annotation.get("body").and_then(id_of))
        .ok_or_else(|| Error::parse("Unable to get image resource id."))?;
    Ok(Image {
        image_url: image_url.to_owned(),
        image_type: ImageType::Standard,
        width: dimension(resource, "width"),
        height: dimension(resource, "height"),
        canvas_target: canvas_target.to_owned(),
    })
}

fn is_image_service(service: &Value) -> bool {
    if type_of(service).is_some_and(|t| t.starts_with("ImageService")) {
        return true;
    }
    let profile_matches = one_or_many(service.get("profile"))
        .into_iter()
        .filter_map(Value::as_str)
        .any(|p| p.contains("iiif.io/api/image") || p.starts_with("level"));
    let context_matches = service
        .get("@context")
        .and_then(Value::as_str)
        .is_some_and(|c| c.contains("iiif.io/api/image"));
    profile_matches || context_matches
}

/// Base URL for an image service: no trailing slash, https, then either
/// `/info.json` (for hosts in [`INFO_JSON_HOSTS`]) or a single trailing `/`.
pub fn normalize_service_url(base: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    let (secure, host) = match Url::parse(trimmed) {
        Ok(mut parsed) => {
            if parsed.scheme() == "http" {
                let _ = parsed.set_scheme("https");
            }
            let host = parsed.host_str().map(str::to_owned);
            (parsed.as_str().trim_end_matches('/').to_owned(), host)
        }
        Err(_) => (
            trimmed
                .strip_prefix("http://")
                .map(|rest| format!("https://{rest}"))
                .unwrap_or_else(|| trimmed.to_owned()),
            None,
        ),
    };
    match host {
        Some(host) if INFO_JSON_HOSTS.iter().any(|known| host == *known) => {
            format!("{secure}/info.json")
        }
        _ => format!("{secure}/"),
    }
}

fn discover_services(payload: &Value) -> (Option<String>, Option<String>) {
    let search = one_or_many(payload.get("service"))
        .into_iter()
        .find(|service| is_search_service(service));
    let Some(search) = search else {
        return (None, None);
    };
    let autocomplete = one_or_many(search.get("service"))
        .into_iter()
        .find(|service| is_autocomplete_service(service))
        .and_then(id_of)
        .map(str::to_owned);
    (id_of(search).map(str::to_owned), autocomplete)
}

fn profile_contains(service: &Value, needle: &str) -> bool {
    one_or_many(service.get("profile"))
        .into_iter()
        .filter_map(Value::as_str)
        .any(|p| p.contains(needle))
}

fn is_search_service(service: &Value) -> bool {
    matches!(type_of(service), Some("SearchService1" | "SearchService2"))
        || (profile_contains(service, "search") && !profile_contains(service, "autocomplete"))
}

fn is_autocomplete_service(service: &Value) -> bool {
    matches!(type_of(service), Some("AutoCompleteService1" | "AutoCompleteService2"))
        || profile_contains(service, "autocomplete")
}

/// `<service>?q=<query>`, appending to an existing query string if present.
pub fn search_url(service: &str, query: &str) -> String {
    let separator = if service.contains('?') { '&' } else { '?' };
    format!("{service}{separator}q={}", urlencoding::encode(query.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fetcher_over, FakeTransport};
    use serde_json::json;

    fn v3_manifest(id: &str, canvases: usize) -> Value {
        let items: Vec<Value> = (0..canvases)
            .map(|i| {
                let canvas = format!("{id}/canvas/{i}");
                json!({
                    "id": canvas,
                    "type": "Canvas",
                    "width": 2000,
                    "height": 3000,
                    "items": [{
                        "type": "AnnotationPage",
                        "items": [{
                            "id": format!("{canvas}/painting"),
                            "type": "Annotation",
                            "motivation": "painting",
                            "target": canvas,
                            "body": {
                                "id": format!("https://img.example.org/{i}/full/max/0/default.jpg"),
                                "type": "Image",
                                "width": 2000,
                                "height": 3000,
                                "service": [{
                                    "id": format!("http://img.example.org/{i}/"),
                                    "type": "ImageService3",
                                    "profile": "level1",
                                    "width": 4000,
                                    "height": 6000
                                }]
                            }
                        }]
                    }]
                })
            })
            .collect();
        json!({
            "id": id,
            "type": "Manifest",
            "label": {"en": [format!("Manifest {id}")]},
            "items": items,
            "service": [{
                "id": format!("{id}/search"),
                "type": "SearchService2",
                "service": [{"id": format!("{id}/autocomplete"), "type": "AutoCompleteService2"}]
            }]
        })
    }

    #[test]
    fn parses_v3_manifest_with_service_backed_images() {
        let manifest = parse_manifest_value("https://x/m", &v3_manifest("https://x/m", 2)).unwrap();
        assert_eq!(manifest.name, "Manifest https://x/m");
        assert_eq!(manifest.canvases.len(), 2);
        assert_eq!(manifest.images.len(), 2);
        let image = &manifest.images[1];
        assert_eq!(image.image_type, ImageType::ServiceBacked);
        assert_eq!(image.image_url, "https://img.example.org/1/");
        assert_eq!(image.width, Some(4000));
        assert_eq!(image.canvas_target, "https://x/m/canvas/1");
        assert_eq!(manifest.search_service.as_deref(), Some("https://x/m/search"));
        assert_eq!(
            manifest.autocomplete_service.as_deref(),
            Some("https://x/m/autocomplete")
        );
    }

    #[test]
    fn parses_v2_manifest_with_standard_image() {
        let payload = json!({
            "@id": "https://x/v2",
            "@type": "sc:Manifest",
            "label": "Old style",
            "sequences": [{
                "canvases": [{
                    "@id": "https://x/v2/c1",
                    "@type": "sc:Canvas",
                    "images": [{
                        "@type": "oa:Annotation",
                        "motivation": "sc:painting",
                        "on": "https://x/v2/c1",
                        "resource": {"@id": "https://x/v2/page.jpg", "width": 640, "height": 480}
                    }]
                }]
            }]
        });
        let manifest = parse_manifest_value("https://x/v2", &payload).unwrap();
        assert_eq!(manifest.name, "Old style");
        assert_eq!(manifest.canvases[0].width, DEFAULT_CANVAS_SIZE);
        let image = &manifest.images[0];
        assert_eq!(image.image_type, ImageType::Standard);
        assert_eq!(image.image_url, "https://x/v2/page.jpg");
        assert_eq!((image.width, image.height), (Some(640), Some(480)));
        assert!(manifest.search_service.is_none());
    }

    #[test]
    fn v2_profile_marks_image_service() {
        let payload = json!({
            "@id": "https://x/v2",
            "@type": "sc:Manifest",
            "sequences": [{"canvases": [{
                "@id": "c1",
                "images": [{"on": "c1", "resource": {
                    "@id": "https://x/full.jpg",
                    "service": {"@id": "http://images.example.org/iiif/abc", "profile": "http://iiif.io/api/image/2/level2.json"}
                }}]
            }]}]
        });
        let manifest = parse_manifest_value("https://x/v2", &payload).unwrap();
        assert_eq!(manifest.images[0].image_type, ImageType::ServiceBacked);
        assert_eq!(manifest.images[0].image_url, "https://images.example.org/iiif/abc/");
    }

    #[test]
    fn painting_annotation_without_single_target_fails() {
        let payload = json!({
            "id": "m",
            "type": "Manifest",
            "items": [{"id": "c1", "items": [{"items": [{
                "motivation": "painting",
                "target": ["c1", "c2"],
                "body": {"id": "https://x/a.jpg"}
            }]}]}]
        });
        let err = parse_manifest_value("m", &payload).unwrap_err();
        assert_eq!(err.code(), Some(crate::error::ErrorCode::ParsingManifest));
    }

    #[test]
    fn missing_image_id_is_a_parse_failure() {
        let payload = json!({
            "id": "m",
            "type": "Manifest",
            "items": [{"id": "c1", "items": [{"items": [{
                "motivation": "painting",
                "target": "c1",
                "body": {"type": "Image"}
            }]}]}]
        });
        let err = parse_manifest_value("m", &payload).unwrap_err();
        assert!(err.to_string().contains("Unable to get image resource id."));
    }

    #[test]
    fn service_urls_are_normalized() {
        assert_eq!(
            normalize_service_url("http://example.org/iiif/img1///"),
            "https://example.org/iiif/img1/"
        );
        assert_eq!(
            normalize_service_url("https://iiif.io/api/image/3.0/example/reference/abc"),
            "https://iiif.io/api/image/3.0/example/reference/abc/info.json"
        );
    }

    #[test]
    fn search_url_encodes_query() {
        assert_eq!(search_url("https://x/search", " old map "), "https://x/search?q=old%20map");
        assert_eq!(search_url("https://x/s?motivation=painting", "a"), "https://x/s?motivation=painting&q=a");
    }

    #[tokio::test]
    async fn manifest_resolves_to_single_entry() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_json("https://x/m", v3_manifest("https://x/m", 1));
        let resolver = DocumentResolver::new(fetcher_over(&transport));

        let resolved = resolver.resolve("https://x/m", &CancellationToken::new()).await.unwrap();
        assert_eq!(resolved.total, 1);
        assert!(resolved.manifest_urls.is_empty());
        assert!(!resolved.is_collection());
        assert_eq!(resolved.first_manifest.unwrap().id, "https://x/m");
    }

    #[tokio::test]
    async fn nested_collections_flatten_depth_first() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_json(
            "https://x/top",
            json!({
                "id": "https://x/top",
                "type": "Collection",
                "label": {"none": ["Top"]},
                "items": [
                    {"id": "https://x/sub1", "type": "Collection"},
                    {"id": "https://x/sub2", "type": "Collection"}
                ]
            }),
        );
        transport.route_json(
            "https://x/sub1",
            json!({"id": "https://x/sub1", "type": "Collection",
                   "items": [{"id": "https://x/m1", "type": "Manifest"}]}),
        );
        transport.route_json(
            "https://x/sub2",
            json!({"id": "https://x/sub2", "type": "Collection",
                   "items": [{"id": "https://x/m2", "type": "Manifest"}]}),
        );
        transport.route_json("https://x/m1", v3_manifest("https://x/m1", 1));
        transport.route_json("https://x/m2", v3_manifest("https://x/m2", 1));

        let resolver = DocumentResolver::new(fetcher_over(&transport));
        let resolved = resolver.resolve("https://x/top", &CancellationToken::new()).await.unwrap();

        assert_eq!(resolved.manifest_urls, vec!["https://x/m1", "https://x/m2"]);
        assert_eq!(resolved.total, 2);
        let expected = parse_manifest_value("https://x/m1", &v3_manifest("https://x/m1", 1)).unwrap();
        assert_eq!(resolved.first_manifest, Some(expected));
        assert_eq!(resolved.collection.unwrap().name, "Top");
        assert_eq!(transport.calls("https://x/m1"), 1);
        assert_eq!(transport.calls("https://x/m2"), 0);
    }

    #[tokio::test]
    async fn inline_sub_collections_are_walked_without_fetching() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_json(
            "https://x/top",
            json!({
                "@id": "https://x/top",
                "@type": "sc:Collection",
                "collections": [{
                    "@id": "https://x/inline",
                    "@type": "sc:Collection",
                    "manifests": [{"@id": "https://x/m1", "@type": "sc:Manifest"}]
                }]
            }),
        );
        transport.route_json("https://x/m1", v3_manifest("https://x/m1", 1));

        let resolver = DocumentResolver::new(fetcher_over(&transport));
        let resolved = resolver.resolve("https://x/top", &CancellationToken::new()).await.unwrap();
        assert_eq!(resolved.manifest_urls, vec!["https://x/m1"]);
        assert_eq!(transport.calls("https://x/inline"), 0);
    }

    #[tokio::test]
    async fn cyclic_collections_terminate() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_json(
            "https://x/a",
            json!({"id": "https://x/a", "type": "Collection",
                   "items": [{"id": "https://x/b", "type": "Collection"}]}),
        );
        transport.route_json(
            "https://x/b",
            json!({"id": "https://x/b", "type": "Collection",
                   "items": [{"id": "https://x/a", "type": "Collection"}]}),
        );

        let resolver = DocumentResolver::new(fetcher_over(&transport));
        let resolved = resolver.resolve("https://x/a", &CancellationToken::new()).await.unwrap();
        assert_eq!(resolved.total, 0);
        assert!(resolved.first_manifest.is_none());
    }

    /// Collections `https://x/c/0..levels`, none carrying an id, each
    /// referencing the next by URL; the last lists one manifest.
    fn id_less_chain(transport: &FakeTransport, levels: usize) -> String {
        for level in 0..levels {
            transport.route_json(
                &format!("https://x/c/{level}"),
                json!({"type": "Collection",
                       "items": [{"id": format!("https://x/c/{}", level + 1), "type": "Collection"}]}),
            );
        }
        let manifest = "https://x/deep/m".to_owned();
        transport.route_json(
            &format!("https://x/c/{levels}"),
            json!({"type": "Collection", "items": [{"id": manifest, "type": "Manifest"}]}),
        );
        transport.route_json(&manifest, v3_manifest(&manifest, 1));
        manifest
    }

    #[tokio::test]
    async fn shallow_id_less_chain_reaches_its_manifest() {
        let transport = Arc::new(FakeTransport::new());
        let manifest = id_less_chain(&transport, 3);

        let resolver = DocumentResolver::new(fetcher_over(&transport));
        let resolved = resolver.resolve("https://x/c/0", &CancellationToken::new()).await.unwrap();
        assert_eq!(resolved.manifest_urls, vec![manifest.clone()]);
        assert_eq!(resolved.first_manifest.unwrap().id, manifest);
    }

    #[tokio::test]
    async fn id_less_chain_stops_at_depth_cap() {
        let transport = Arc::new(FakeTransport::new());
        let manifest = id_less_chain(&transport, 40);

        let resolver = DocumentResolver::new(fetcher_over(&transport));
        let resolved = resolver.resolve("https://x/c/0", &CancellationToken::new()).await.unwrap();
        assert_eq!(resolved.total, 0);
        assert!(resolved.first_manifest.is_none());
        assert_eq!(transport.calls(&format!("https://x/c/{}", MAX_COLLECTION_DEPTH + 1)), 1);
        assert_eq!(transport.calls(&format!("https://x/c/{}", MAX_COLLECTION_DEPTH + 2)), 0);
        assert_eq!(transport.calls(&manifest), 0);
    }

    #[tokio::test]
    async fn annotation_page_is_not_a_resolvable_document() {
        let transport = Arc::new(FakeTransport::new());
        transport.route_json("https://x/p", json!({"id": "https://x/p", "type": "AnnotationPage"}));
        let resolver = DocumentResolver::new(fetcher_over(&transport));
        let err = resolver.resolve("https://x/p", &CancellationToken::new()).await.unwrap_err();
        assert!(err.to_string().contains("Unknown IIIF resource type"));
    }
}
