use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::annotations::AnnotationResolver;
use crate::cache::{Cache, TtlCache};
use crate::config::ViewerConfig;
use crate::debounce::{SearchDebouncer, SearchOutcome};
use crate::document::{search_url, DocumentResolver};
use crate::error::{DomainError, Error, ErrorCode, ErrorDomain, Result, StructuredError};
use crate::fetch::{ResourceFetcher, Transport};
use crate::json::strip_fragment;
use crate::model::{Annotation, Collection, Manifest, Resource, SearchSnippet, ViewerSource};
use crate::search::SearchAggregator;
use crate::selection::{self, SelectionInputs, SelectionOutcome, SelectionPhase, SelectionState};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    NextImage,
    PrevImage,
    GotoImage { index: usize },
    NextManifest,
    PrevManifest,
    GotoManifest { index: usize },
    DismissError { domain: ErrorDomain },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    ManifestChanged { index: usize },
    CanvasChanged { index: usize },
    AnnotationsChanged,
    SearchResultsChanged,
    SelectionChanged(SelectionPhase),
    ErrorChanged(ErrorDomain),
}

/// A click on a search result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JumpRequest {
    pub manifest_id: Option<String>,
    pub canvas_target: String,
    pub annotation_id: Option<String>,
}

impl From<&SearchSnippet> for JumpRequest {
    fn from(snippet: &SearchSnippet) -> Self {
        Self {
            manifest_id: snippet.part_of.clone(),
            canvas_target: snippet.canvas_target.clone(),
            annotation_id: Some(snippet.annotation_id.clone()),
        }
    }
}

/// Everything a UI renders from.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerState {
    pub source_url: Option<String>,
    pub current_collection: Option<Collection>,
    pub manifest_urls: Vec<String>,
    pub manifest_index: usize,
    pub manifest_url: Option<String>,
    pub current_manifest: Option<Manifest>,
    pub canvas_index: usize,
    pub canvas_id: Option<String>,
    pub annotations: Vec<Annotation>,
    pub annotations_for_canvas_id: Option<String>,
    pub annotations_loading: bool,
    pub viewer_ready: bool,
    pub viewer_error: Option<String>,
    pub search_query: Option<String>,
    pub search_results: Vec<SearchSnippet>,
    pub manifest_error: Option<DomainError>,
    pub annotations_error: Option<DomainError>,
    pub search_error: Option<DomainError>,
}

impl ViewerState {
    fn error_slot(&mut self, domain: ErrorDomain) -> &mut Option<DomainError> {
        match domain {
            ErrorDomain::Manifest => &mut self.manifest_error,
            ErrorDomain::Annotations => &mut self.annotations_error,
            ErrorDomain::Search => &mut self.search_error,
        }
    }
}

pub struct Session {
    documents: DocumentResolver,
    annotation_resolver: AnnotationResolver,
    aggregator: Arc<SearchAggregator>,
    debouncer: SearchDebouncer,
    search_outcomes: UnboundedReceiver<SearchOutcome>,
    state: ViewerState,
    selection: SelectionState,
    /// Set while a jump moves to the canvas holding its own pending id.
    preserve_pending: bool,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

impl Session {
    pub fn new(transport: Arc<dyn Transport>, config: &ViewerConfig) -> Self {
        Self::with_caches(
            transport,
            Arc::new(TtlCache::new()),
            Arc::new(TtlCache::new()),
            config,
        )
    }

    pub fn with_caches(
        transport: Arc<dyn Transport>,
        resources: Arc<dyn Cache<Resource>>,
        documents: Arc<dyn Cache<Arc<Value>>>,
        config: &ViewerConfig,
    ) -> Self {
        let fetcher = Arc::new(ResourceFetcher::new(transport, resources, config));
        let aggregator = Arc::new(SearchAggregator::new(
            Arc::clone(&fetcher),
            config.max_search_pages,
        ));
        let (debouncer, search_outcomes) =
            SearchDebouncer::new(Arc::clone(&aggregator), config.search_debounce);
        Self {
            documents: DocumentResolver::new(Arc::clone(&fetcher)),
            annotation_resolver: AnnotationResolver::new(fetcher, documents),
            aggregator,
            debouncer,
            search_outcomes,
            state: ViewerState::default(),
            selection: SelectionState::default(),
            preserve_pending: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Arc<Mutex<Vec<SessionEvent>>> {
        Arc::clone(&self.events)
    }

    pub fn state(&self) -> &ViewerState {
        &self.state
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn selected_annotation(&self) -> Option<&Annotation> {
        self.selection.selected()
    }

    pub fn selection_phase(&self) -> SelectionPhase {
        self.selection.phase()
    }

    /// Loads a manifest or collection and shows its first canvas.
    #[instrument(skip(self))]
    pub async fn load_url(&mut self, url: &str) -> Result<()> {
        let resolved = match self.documents.resolve(url, &CancellationToken::new()).await {
            Ok(resolved) => resolved,
            Err(err) => {
                self.record_error(ErrorDomain::Manifest, &err);
                return Err(err);
            }
        };
        self.clear_error(ErrorDomain::Manifest);
        info!(url, total = resolved.total, "document loaded");

        let manifest_urls = if resolved.is_collection() {
            resolved.manifest_urls
        } else {
            vec![url.to_owned()]
        };
        self.state.source_url = Some(url.to_owned());
        self.state.current_collection = resolved.collection;
        self.state.manifest_urls = manifest_urls;
        self.state.search_query = None;
        if !self.state.search_results.is_empty() {
            self.state.search_results.clear();
            self.push(SessionEvent::SearchResultsChanged);
        }

        let manifest_url = self.state.manifest_urls.first().cloned();
        self.enter_manifest(0, manifest_url, resolved.first_manifest, 0)
            .await;
        Ok(())
    }

    pub async fn apply(&mut self, command: Command) -> Result<()> {
        match command {
            Command::NextImage => {
                let next = (self.state.canvas_index + 1).min(self.last_canvas());
                self.goto_canvas(next).await;
            }
            Command::PrevImage => {
                let prev = self.state.canvas_index.saturating_sub(1);
                self.goto_canvas(prev).await;
            }
            Command::GotoImage { index } => {
                self.goto_canvas(index.min(self.last_canvas())).await;
            }
            Command::NextManifest => {
                self.goto_manifest(self.state.manifest_index + 1).await?;
            }
            Command::PrevManifest => {
                if let Some(prev) = self.state.manifest_index.checked_sub(1) {
                    self.goto_manifest(prev).await?;
                }
            }
            Command::GotoManifest { index } => {
                self.goto_manifest(index).await?;
            }
            Command::DismissError { domain } => {
                self.clear_error(domain);
            }
        }
        Ok(())
    }

    /// Image source for the current canvas, falling back to canvas
    /// dimensions where the image declares none.
    pub fn viewer_source(&self) -> Option<ViewerSource> {
        let manifest = self.state.current_manifest.as_ref()?;
        let canvas = manifest.canvases.get(self.state.canvas_index)?;
        let image = manifest.image_for_canvas(self.state.canvas_index)?;
        Some(ViewerSource {
            image_url: image.image_url.clone(),
            image_type: image.image_type,
            width: image.width.unwrap_or(canvas.width),
            height: image.height.unwrap_or(canvas.height),
        })
    }

    pub fn viewer_ready(&mut self) {
        if self.state.viewer_ready {
            return;
        }
        self.state.viewer_ready = true;
        self.state.viewer_error = None;
        self.evaluate_selection();
    }

    pub fn viewer_open_failed(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(%message, "viewer failed to open image");
        self.state.viewer_ready = false;
        self.state.viewer_error = Some(message);
        self.evaluate_selection();
    }

    /// Fetches annotations for the active canvas.
    pub async fn load_annotations(&mut self) -> Result<()> {
        let (Some(manifest_url), Some(canvas_id)) = (
            self.state.manifest_url.clone(),
            self.state.canvas_id.clone(),
        ) else {
            return Ok(());
        };
        self.state.annotations_loading = true;
        let result = self
            .annotation_resolver
            .annotations_for_canvas(&manifest_url, &canvas_id, &CancellationToken::new())
            .await;
        self.finish_annotation_load(&canvas_id, result)
    }

    /// Stores the annotations fetched for `canvas_id`. Results for a canvas
    /// that is no longer active are dropped.
    pub fn finish_annotation_load(
        &mut self,
        canvas_id: &str,
        result: Result<Vec<Annotation>>,
    ) -> Result<()> {
        if self.state.canvas_id.as_deref() != Some(canvas_id) {
            debug!(canvas_id, "dropping annotations for inactive canvas");
            return Ok(());
        }
        self.state.annotations_loading = false;
        match result {
            Ok(annotations) => {
                debug!(canvas_id, count = annotations.len(), "annotations loaded");
                self.state.annotations = annotations;
                self.state.annotations_for_canvas_id = Some(canvas_id.to_owned());
                self.clear_error(ErrorDomain::Annotations);
                self.push(SessionEvent::AnnotationsChanged);
                self.evaluate_selection();
                Ok(())
            }
            Err(err) => {
                self.record_error(ErrorDomain::Annotations, &err);
                self.evaluate_selection();
                Err(err)
            }
        }
    }

    /// Search URL for `query` on the collection's service, else the
    /// current manifest's.
    pub fn search_endpoint(&self, query: &str) -> Result<String> {
        let service = self
            .state
            .current_collection
            .as_ref()
            .and_then(|collection| collection.search_service.as_deref())
            .or_else(|| {
                self.state
                    .current_manifest
                    .as_ref()
                    .and_then(|manifest| manifest.search_service.as_deref())
            })
            .ok_or_else(|| {
                StructuredError::new(
                    ErrorCode::SearchUnsupported,
                    "This resource does not provide a search service",
                    false,
                )
            })?;
        Ok(search_url(service, query))
    }

    /// Runs a search right away, superseding any debounced one.
    #[instrument(skip(self))]
    pub async fn search(&mut self, query: &str) -> Result<()> {
        self.debouncer.cancel();
        let Some((query, endpoint)) = self.begin_search(query)? else {
            return Ok(());
        };
        let result = self
            .aggregator
            .search(&endpoint, &CancellationToken::new())
            .await;
        self.apply_search_outcome(SearchOutcome { query, result })
    }

    /// Schedules a debounced search. Outcomes arrive through
    /// [`Session::next_search_outcome`] or [`Session::drain_search_outcomes`].
    pub fn submit_search(&mut self, query: &str) -> Result<()> {
        let Some((query, endpoint)) = self.begin_search(query)? else {
            self.debouncer.cancel();
            return Ok(());
        };
        self.debouncer.submit(query, endpoint);
        Ok(())
    }

    /// Waits for the next debounced search to finish and applies it.
    pub async fn next_search_outcome(&mut self) -> Option<Result<()>> {
        let outcome = self.search_outcomes.recv().await?;
        Some(self.apply_search_outcome(outcome))
    }

    /// Applies every finished debounced search without waiting.
    pub fn drain_search_outcomes(&mut self) -> usize {
        let mut applied = 0;
        while let Ok(outcome) = self.search_outcomes.try_recv() {
            let _ = self.apply_search_outcome(outcome);
            applied += 1;
        }
        applied
    }

    /// Stores a finished search unless a newer query has replaced it.
    pub fn apply_search_outcome(&mut self, outcome: SearchOutcome) -> Result<()> {
        if self.state.search_query.as_deref() != Some(outcome.query.as_str()) {
            debug!(query = %outcome.query, "dropping outcome of replaced search");
            return Ok(());
        }
        match outcome.result {
            Ok(results) => {
                info!(query = %outcome.query, hits = results.len(), "search finished");
                self.state.search_results = results;
                self.clear_error(ErrorDomain::Search);
                self.push(SessionEvent::SearchResultsChanged);
                Ok(())
            }
            Err(err) => {
                self.record_error(ErrorDomain::Search, &err);
                Err(err)
            }
        }
    }

    /// Moves to the manifest and canvas of a search result and selects its
    /// annotation once the viewer and annotations are ready.
    #[instrument(skip(self))]
    pub async fn jump_to_result(&mut self, request: JumpRequest) -> Result<()> {
        match request.annotation_id.as_deref() {
            Some(id) => self.selection.request(id),
            None => {
                self.selection.reset();
            }
        }
        self.push(SessionEvent::SelectionChanged(self.selection.phase()));

        self.preserve_pending = true;
        let moved = self.move_to_result(&request).await;
        self.preserve_pending = false;

        if let Err(err) = moved {
            if let Some(annotation_id) = self.selection.pending_annotation_id().map(str::to_owned) {
                warn!(%annotation_id, error = %err, "jump target unreachable");
                self.fail_selection(&annotation_id, err.to_string());
            }
            return Err(err);
        }
        self.evaluate_selection();
        Ok(())
    }

    async fn move_to_result(&mut self, request: &JumpRequest) -> Result<()> {
        let canvas_id = strip_fragment(&request.canvas_target).to_owned();

        let target_manifest = request
            .manifest_id
            .as_deref()
            .filter(|id| !self.is_current_manifest(id))
            .and_then(|id| match self.state.manifest_urls.iter().position(|url| url == id) {
                Some(index) => Some((index, id.to_owned())),
                None => {
                    warn!(manifest_id = id, "result manifest is not part of this collection");
                    None
                }
            });

        if let Some((index, url)) = target_manifest {
            let manifest = self.fetch_manifest(&url).await?;
            let canvas_index = manifest
                .canvas_index(&canvas_id)
                .ok_or_else(|| missing_canvas(&canvas_id))?;
            self.enter_manifest(index, Some(url), Some(manifest), canvas_index)
                .await;
            return Ok(());
        }

        let canvas_index = self
            .state
            .current_manifest
            .as_ref()
            .and_then(|manifest| manifest.canvas_index(&canvas_id))
            .ok_or_else(|| missing_canvas(&canvas_id))?;
        if self.state.canvas_id.as_deref() != Some(canvas_id.as_str()) {
            self.enter_canvas(canvas_index).await;
        }
        Ok(())
    }

    fn is_current_manifest(&self, id: &str) -> bool {
        self.state.manifest_url.as_deref() == Some(id)
            || self
                .state
                .current_manifest
                .as_ref()
                .is_some_and(|manifest| manifest.id == id)
    }

    /// Records `query` as the active one and returns it trimmed, with its
    /// endpoint. A blank query clears the results instead.
    fn begin_search(&mut self, query: &str) -> Result<Option<(String, String)>> {
        let query = query.trim();
        if query.is_empty() {
            self.state.search_query = None;
            if !self.state.search_results.is_empty() {
                self.state.search_results.clear();
                self.push(SessionEvent::SearchResultsChanged);
            }
            return Ok(None);
        }
        self.state.search_query = Some(query.to_owned());
        match self.search_endpoint(query) {
            Ok(endpoint) => Ok(Some((query.to_owned(), endpoint))),
            Err(err) => {
                self.state.search_results.clear();
                self.push(SessionEvent::SearchResultsChanged);
                self.record_error(ErrorDomain::Search, &err);
                Err(err)
            }
        }
    }

    async fn goto_manifest(&mut self, index: usize) -> Result<()> {
        if self.state.current_collection.is_none() || index == self.state.manifest_index {
            return Ok(());
        }
        let Some(url) = self.state.manifest_urls.get(index).cloned() else {
            return Ok(());
        };
        let manifest = self.fetch_manifest(&url).await?;
        self.enter_manifest(index, Some(url), Some(manifest), 0)
            .await;
        Ok(())
    }

    async fn fetch_manifest(&mut self, url: &str) -> Result<Manifest> {
        match self
            .documents
            .load_manifest(url, &CancellationToken::new())
            .await
        {
            Ok(manifest) => {
                self.clear_error(ErrorDomain::Manifest);
                Ok(manifest)
            }
            Err(err) => {
                self.record_error(ErrorDomain::Manifest, &err);
                Err(err)
            }
        }
    }

    async fn enter_manifest(
        &mut self,
        index: usize,
        url: Option<String>,
        manifest: Option<Manifest>,
        canvas_index: usize,
    ) {
        self.state.manifest_index = index;
        self.state.manifest_url = url;
        self.state.current_manifest = manifest;
        self.push(SessionEvent::ManifestChanged { index });
        self.enter_canvas(canvas_index).await;
    }

    async fn goto_canvas(&mut self, index: usize) {
        if self.state.current_manifest.is_none() || index == self.state.canvas_index {
            return;
        }
        self.enter_canvas(index).await;
    }

    async fn enter_canvas(&mut self, index: usize) {
        let canvas_id = self
            .state
            .current_manifest
            .as_ref()
            .and_then(|manifest| manifest.canvases.get(index))
            .map(|canvas| canvas.id.clone());

        self.supersede_selection();
        self.state.canvas_index = index;
        self.state.canvas_id = canvas_id;
        self.state.viewer_ready = false;
        self.state.viewer_error = None;
        self.state.annotations.clear();
        self.state.annotations_for_canvas_id = None;
        self.state.annotations_loading = self.state.canvas_id.is_some();
        self.push(SessionEvent::CanvasChanged { index });
        self.push(SessionEvent::AnnotationsChanged);
        self.evaluate_selection();

        if let Err(err) = self.load_annotations().await {
            debug!(error = %err, "annotation load failed");
        }
    }

    fn supersede_selection(&mut self) {
        if self.preserve_pending {
            self.selection.clear_selection();
            return;
        }
        if self.selection.pending_annotation_id().is_some() {
            debug!("navigation discards pending selection");
        }
        if self.selection.reset() {
            self.push(SessionEvent::SelectionChanged(SelectionPhase::Idle));
        }
    }

    fn evaluate_selection(&mut self) {
        let inputs = SelectionInputs {
            viewer_ready: self.state.viewer_ready,
            canvas_id: self.state.canvas_id.as_deref(),
            annotations_for_canvas_id: self.state.annotations_for_canvas_id.as_deref(),
            annotations: &self.state.annotations,
            annotations_loading: self.state.annotations_loading,
        };
        let outcome = selection::evaluate(&self.selection, &inputs);

        if let SelectionOutcome::Failed { annotation_id } = &outcome {
            let canvas = self.state.canvas_id.clone().unwrap_or_default();
            warn!(%annotation_id, %canvas, "annotation not found on canvas");
            self.set_error(
                ErrorDomain::Annotations,
                DomainError::new(
                    ErrorCode::SelectionFailed,
                    format!("Annotation {annotation_id} was not found on canvas {canvas}"),
                    Some(false),
                ),
            );
        }
        if self.selection.apply(outcome) {
            self.push(SessionEvent::SelectionChanged(self.selection.phase()));
        }
    }

    fn fail_selection(&mut self, annotation_id: &str, message: String) {
        self.selection.apply(SelectionOutcome::Failed {
            annotation_id: annotation_id.to_owned(),
        });
        self.set_error(
            ErrorDomain::Annotations,
            DomainError::new(ErrorCode::SelectionFailed, message, Some(false)),
        );
        self.push(SessionEvent::SelectionChanged(SelectionPhase::Failed));
    }

    fn last_canvas(&self) -> usize {
        self.state
            .current_manifest
            .as_ref()
            .map_or(0, |manifest| manifest.canvases.len().saturating_sub(1))
    }

    fn record_error(&mut self, domain: ErrorDomain, err: &Error) {
        if let Some(error) = DomainError::from_error(err) {
            warn!(?domain, code = %error.code, message = %error.message, "operation failed");
            self.set_error(domain, error);
        }
    }

    fn set_error(&mut self, domain: ErrorDomain, error: DomainError) {
        *self.state.error_slot(domain) = Some(error);
        self.push(SessionEvent::ErrorChanged(domain));
    }

    fn clear_error(&mut self, domain: ErrorDomain) {
        if self.state.error_slot(domain).take().is_some() {
            self.push(SessionEvent::ErrorChanged(domain));
        }
    }

    fn push(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }
}

fn missing_canvas(canvas_id: &str) -> Error {
    StructuredError::new(
        ErrorCode::SelectionFailed,
        format!("Canvas {canvas_id} is not part of the manifest"),
        false,
    )
    .into()
}
