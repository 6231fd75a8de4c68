use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_CANVAS_SIZE: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Manifest,
    Collection,
    AnnotationPage,
}

impl ResourceKind {
    /// Maps a declared `type`/`@type` onto a kind, accepting the
    /// Presentation 2 names alongside the Presentation 3 ones.
    pub fn from_declared(declared: &str) -> Option<Self> {
        match declared {
            "Manifest" | "sc:Manifest" => Some(ResourceKind::Manifest),
            "Collection" | "sc:Collection" => Some(ResourceKind::Collection),
            "AnnotationPage" | "sc:AnnotationList" | "AnnotationList" => {
                Some(ResourceKind::AnnotationPage)
            }
            _ => None,
        }
    }
}

/// A fetched document whose declared type has been checked.
#[derive(Debug, Clone)]
pub struct Resource {
    pub url: String,
    pub kind: ResourceKind,
    pub payload: Arc<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Canvas {
    pub id: String,
    pub width: u32,
    pub height: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageType {
    Standard,
    ServiceBacked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub image_url: String,
    pub image_type: ImageType,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub canvas_target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub id: String,
    pub name: String,
    pub canvases: Vec<Canvas>,
    pub images: Vec<Image>,
    pub search_service: Option<String>,
    pub autocomplete_service: Option<String>,
}

impl Manifest {
    pub fn canvas(&self, id: &str) -> Option<&Canvas> {
        self.canvases.iter().find(|canvas| canvas.id == id)
    }

    pub fn canvas_index(&self, id: &str) -> Option<usize> {
        self.canvases.iter().position(|canvas| canvas.id == id)
    }

    /// The image painted on canvas `index`, if that canvas carries one.
    pub fn image_for_canvas(&self, index: usize) -> Option<&Image> {
        let canvas = self.canvases.get(index)?;
        self.images
            .iter()
            .find(|image| image.canvas_target == canvas.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub id: String,
    pub name: String,
    pub search_service: Option<String>,
    pub autocomplete_service: Option<String>,
    pub manifest_urls: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationBody {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub id: String,
    pub motivation: Option<String>,
    /// Canonical `<canvas>#<fragment>` or bare canvas strings.
    pub target: Vec<String>,
    pub body: Vec<AnnotationBody>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSnippet {
    pub id: String,
    /// Id of the geometry-bearing base annotation.
    pub annotation_id: String,
    pub motivation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub exact: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suffix: Option<String>,
    pub canvas_target: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub part_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// What the deep-zoom viewer needs to mount the current image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSource {
    pub image_url: String,
    pub image_type: ImageType,
    pub width: u32,
    pub height: u32,
}
