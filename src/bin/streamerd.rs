//! streamerd - camera streaming daemon
//!
//! This daemon:
//! 1. Opens the configured frame source (MJPEG stream or single-shot capture)
//! 2. Classifies every N-th frame on a background worker
//! 3. Draws the latest detections onto the outgoing frames
//! 4. Serves the annotated stream over HTTP
//! 5. Optionally uploads frames matching the upload policy

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use camera_streamer::config::StreamerConfig;
use camera_streamer::detect::open_engine;
use camera_streamer::pipeline::{DisabledUploader, IngestionUploader, Uploader};
use camera_streamer::server::StreamServer;
use camera_streamer::{Annotator, FrameSource, Pipeline, StreamHub};

#[derive(Parser, Debug)]
#[command(author, version, about = "Stream camera frames with detection overlays")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "STREAMER_CONFIG")]
    config: Option<PathBuf>,

    /// Model identity: path to an .eim model, or stub:// for a synthetic engine.
    #[arg(long)]
    model: Option<String>,

    /// HTTP bind address.
    #[arg(long, value_name = "ADDR")]
    bind: Option<String>,

    /// Enable training-sample uploads (requires an api key).
    #[arg(long)]
    upload: bool,

    /// Verbose logging.
    #[arg(long)]
    debug: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let mut cfg = StreamerConfig::load_from(args.config.as_deref())?;
    if let Some(model) = args.model {
        cfg.model.identity = model;
    }
    if let Some(bind) = args.bind {
        cfg.server.addr = bind;
    }
    if args.upload {
        cfg.pipeline.upload.enabled = true;
    }
    cfg.validate()?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .context("install ctrl-c handler")?;

    let source = FrameSource::open(&cfg.source)?;
    let engine = open_engine(&cfg.model.identity, cfg.model.input)?;
    log::info!(
        "streamerd: model {} ({})",
        cfg.model.identity,
        engine.name()
    );
    let uploader = build_uploader(&cfg)?;
    let annotator = build_annotator(&cfg)?;

    let mut pipeline = Pipeline::new(cfg.pipeline.clone(), source, engine, uploader, annotator)?;
    let hub = Arc::new(StreamHub::new());
    let server = StreamServer::new(cfg.server.clone(), hub.clone(), pipeline.stats()).spawn()?;
    log::info!("streamerd: serving http://{}/stream", server.addr);

    let outcome = pipeline.run(&hub, &shutdown);
    if let Err(err) = server.stop() {
        log::error!("streamerd: stop server: {:#}", err);
    }
    let snap = pipeline.stats().snapshot();
    log::info!(
        "streamerd: exiting after {} frames ({} classified, {} uploaded)",
        snap.frames_produced,
        snap.results_published,
        snap.uploads_sent
    );
    outcome
}

fn build_uploader(cfg: &StreamerConfig) -> Result<Box<dyn Uploader>> {
    if !cfg.pipeline.upload.enabled {
        log::info!("streamerd: uploads disabled");
        return Ok(Box::new(DisabledUploader));
    }
    let api_key = cfg
        .upload
        .api_key
        .clone()
        .context("uploads are enabled but no api key is configured")?;
    let version = cfg
        .upload
        .model_version
        .clone()
        .unwrap_or_else(|| model_version_from_identity(&cfg.model.identity));
    log::info!(
        "streamerd: uploading to {} when confidence is {:?} {}",
        cfg.upload.url,
        cfg.pipeline.upload.trigger,
        cfg.pipeline.upload.threshold
    );
    Ok(Box::new(IngestionUploader::new(
        cfg.upload.url.clone(),
        api_key,
        version,
    )))
}

fn build_annotator(cfg: &StreamerConfig) -> Result<Annotator> {
    let annotator = Annotator::new(cfg.overlay.display_threshold);
    match &cfg.overlay.font_path {
        Some(path) => Ok(annotator.with_font(Annotator::load_font(path)?)),
        None => {
            log::info!("streamerd: no label font configured; drawing markers only");
            Ok(annotator)
        }
    }
}

fn model_version_from_identity(identity: &str) -> String {
    Path::new(identity)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .unwrap_or("unversioned")
        .to_string()
}
