use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use folio_core::{
    Annotation, Collection, Command, DomainError, JumpRequest, Manifest, SearchSnippet, SelectionPhase,
    Session, Transport, ViewerConfig,
};
use folio_http::ReqwestTransport;
use serde::Serialize;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(
    name = "folio",
    version,
    about = "Resolve IIIF manifests and collections, list their annotations and search their text"
)]
struct Args {
    /// TOML config file (defaults to config.toml in the platform config dir)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Per-attempt fetch timeout in milliseconds
    #[arg(long = "timeout-ms")]
    timeout_ms: Option<u64>,

    /// Total fetch attempts
    #[arg(long)]
    retries: Option<u32>,

    /// Upper bound on search result pages followed
    #[arg(long = "max-search-pages")]
    max_search_pages: Option<usize>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    action: Action,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Manifest or collection summary with canvases and images
    Info { url: String },
    /// Annotations targeting one canvas
    Annotations {
        url: String,
        /// Canvas index (0-based)
        #[arg(long, default_value_t = 0)]
        canvas: usize,
    },
    /// Full-text search through the document's search service
    Search { url: String, query: String },
    /// Search, then jump to one hit and select its annotation
    Jump {
        url: String,
        query: String,
        /// Hit index (0-based)
        #[arg(long, default_value_t = 0)]
        hit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let project_dirs = ProjectDirs::from("org", "folio", "folio")
        .ok_or_else(|| anyhow!("unable to resolve platform data directories"))?;
    let _log_guard = init_logging(&project_dirs)?;
    let config = load_config(&args, &project_dirs)?;

    let transport: Arc<dyn Transport> =
        Arc::new(ReqwestTransport::new().context("failed to build HTTP client")?);
    let mut session = Session::new(transport, &config);

    match args.action {
        Action::Info { url } => {
            open(&mut session, &url).await?;
            print_info(&session, args.json)
        }
        Action::Annotations { url, canvas } => {
            open(&mut session, &url).await?;
            session
                .apply(Command::GotoImage { index: canvas })
                .await?;
            if let Some(error) = &session.state().annotations_error {
                bail!("failed to load annotations: {}", error.message);
            }
            print_annotations(&session, args.json)
        }
        Action::Search { url, query } => {
            open(&mut session, &url).await?;
            session
                .search(&query)
                .await
                .with_context(|| format!("search for {query:?} failed"))?;
            print_snippets(&session.state().search_results, args.json)
        }
        Action::Jump { url, query, hit } => {
            open(&mut session, &url).await?;
            session
                .search(&query)
                .await
                .with_context(|| format!("search for {query:?} failed"))?;
            let results = &session.state().search_results;
            let snippet = results
                .get(hit)
                .ok_or_else(|| anyhow!("hit {hit} out of range ({} results)", results.len()))?;
            let request = JumpRequest::from(snippet);
            info!(annotation = ?request.annotation_id, canvas = %request.canvas_target, "jumping to result");

            if let Err(err) = session.jump_to_result(request).await {
                warn!(error = %err, "jump failed");
            }
            session.viewer_ready();
            print_selection(&session, args.json)
        }
    }
}

async fn open(session: &mut Session, url: &str) -> Result<()> {
    session
        .load_url(url)
        .await
        .with_context(|| format!("failed to load {url}"))?;
    session.viewer_ready();
    Ok(())
}

fn load_config(args: &Args, project_dirs: &ProjectDirs) -> Result<ViewerConfig> {
    let path = args
        .config
        .clone()
        .unwrap_or_else(|| project_dirs.config_dir().join("config.toml"));
    let mut config = ViewerConfig::load(&path)
        .with_context(|| format!("failed to load config from {:?}", path))?;

    if let Some(ms) = args.timeout_ms {
        config.fetch_timeout = Duration::from_millis(ms);
    }
    if let Some(retries) = args.retries {
        config.fetch_retries = retries;
    }
    if let Some(pages) = args.max_search_pages {
        config.max_search_pages = pages;
    }
    Ok(config)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct InfoReport<'a> {
    collection: Option<&'a Collection>,
    manifest_urls: &'a [String],
    manifest: Option<&'a Manifest>,
    manifest_error: Option<&'a DomainError>,
}

fn print_info(session: &Session, json: bool) -> Result<()> {
    let state = session.state();
    if json {
        let report = InfoReport {
            collection: state.current_collection.as_ref(),
            manifest_urls: &state.manifest_urls,
            manifest: state.current_manifest.as_ref(),
            manifest_error: state.manifest_error.as_ref(),
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    if let Some(collection) = &state.current_collection {
        println!("Collection: {} ({})", collection.name, collection.id);
        println!("  manifests: {}", collection.manifest_urls.len());
        for (index, url) in collection.manifest_urls.iter().enumerate() {
            println!("  [{index}] {url}");
        }
        if let Some(service) = &collection.search_service {
            println!("  search: {service}");
        }
    }

    let Some(manifest) = &state.current_manifest else {
        println!("No manifest loaded");
        return Ok(());
    };
    println!("Manifest: {} ({})", manifest.name, manifest.id);
    if let Some(service) = &manifest.search_service {
        println!("  search: {service}");
    }
    if let Some(service) = &manifest.autocomplete_service {
        println!("  autocomplete: {service}");
    }
    println!("  canvases: {}", manifest.canvases.len());
    for (index, canvas) in manifest.canvases.iter().enumerate() {
        let label = canvas.label.as_deref().unwrap_or("-");
        println!(
            "  [{index}] {label}  {}x{}  {}",
            canvas.width, canvas.height, canvas.id
        );
        if let Some(image) = manifest.image_for_canvas(index) {
            println!("        image ({:?}): {}", image.image_type, image.image_url);
        }
    }
    Ok(())
}

fn print_annotations(session: &Session, json: bool) -> Result<()> {
    let state = session.state();
    if json {
        println!("{}", serde_json::to_string_pretty(&state.annotations)?);
        return Ok(());
    }
    let canvas = state.canvas_id.as_deref().unwrap_or("-");
    println!("Canvas [{}] {canvas}: {} annotations", state.canvas_index, state.annotations.len());
    for annotation in &state.annotations {
        print_annotation(annotation);
    }
    Ok(())
}

fn print_annotation(annotation: &Annotation) {
    let motivation = annotation.motivation.as_deref().unwrap_or("-");
    println!("- {} ({motivation})", annotation.id);
    for target in &annotation.target {
        println!("    on {target}");
    }
    for body in &annotation.body {
        match &body.language {
            Some(language) => println!("    [{language}] {}", body.value),
            None => println!("    {}", body.value),
        }
    }
}

fn print_snippets(snippets: &[SearchSnippet], json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(snippets)?);
        return Ok(());
    }
    println!("{} hits", snippets.len());
    for (index, snippet) in snippets.iter().enumerate() {
        println!(
            "[{index}] {}[{}]{}",
            snippet.prefix.as_deref().unwrap_or(""),
            snippet.exact,
            snippet.suffix.as_deref().unwrap_or("")
        );
        println!("      {}", snippet.canvas_target);
        if let Some(manifest) = &snippet.part_of {
            println!("      in {manifest}");
        }
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SelectionReport<'a> {
    phase: SelectionPhase,
    manifest_url: Option<&'a str>,
    canvas_id: Option<&'a str>,
    selected: Option<&'a Annotation>,
    annotations_error: Option<&'a DomainError>,
}

fn print_selection(session: &Session, json: bool) -> Result<()> {
    let state = session.state();
    let report = SelectionReport {
        phase: session.selection_phase(),
        manifest_url: state.manifest_url.as_deref(),
        canvas_id: state.canvas_id.as_deref(),
        selected: session.selected_annotation(),
        annotations_error: state.annotations_error.as_ref(),
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Selection: {:?}", report.phase);
    println!("  manifest: {}", report.manifest_url.unwrap_or("-"));
    println!("  canvas: {}", report.canvas_id.unwrap_or("-"));
    if let Some(annotation) = report.selected {
        print_annotation(annotation);
    }
    if let Some(error) = report.annotations_error {
        println!("  error: {}: {}", error.code, error.message);
    }
    Ok(())
}

fn init_logging(project_dirs: &ProjectDirs) -> Result<WorkerGuard> {
    let log_dir = project_dirs.data_local_dir().join("logs");
    fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::never(log_dir, "folio.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer);
    let console_layer = tracing_subscriber::fmt::layer().with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|err| anyhow!(err))?;

    Ok(guard)
}
