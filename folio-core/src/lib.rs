pub mod annotations;
pub mod cache;
pub mod config;
pub mod debounce;
pub mod document;
pub mod error;
pub mod fetch;
mod json;
pub mod model;
pub mod retry;
pub mod search;
pub mod selection;
pub mod session;
pub mod target;

#[cfg(test)]
mod testing;

pub use annotations::AnnotationResolver;
pub use cache::{Cache, TtlCache};
pub use config::{ConfigError, ViewerConfig};
pub use debounce::{SearchDebouncer, SearchOutcome};
pub use document::{search_url, DocumentResolver, ResolvedDocument};
pub use error::{
    DomainError, Error, ErrorCode, ErrorDomain, Result, StructuredError, TransportError,
};
pub use fetch::{ResourceFetcher, Transport, TransportResponse};
pub use model::{
    Annotation, AnnotationBody, Canvas, Collection, Image, ImageType, Manifest, Resource,
    ResourceKind, SearchSnippet, ViewerSource,
};
pub use retry::{with_retry, RetryPolicy};
pub use search::SearchAggregator;
pub use selection::{SelectionPhase, SelectionState};
pub use session::{Command, JumpRequest, Session, SessionEvent, ViewerState};
pub use target::{extract_selector, normalize_target};
