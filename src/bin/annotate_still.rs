//! annotate_still - run one image through an engine and save the overlay.
//!
//! Useful for checking a model and the coordinate remapping without a
//! camera attached.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use camera_streamer::detect::open_engine;
use camera_streamer::stream::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use camera_streamer::{Annotator, DetectionResult, ModelInput};

#[derive(Parser, Debug)]
#[command(author, version, about = "Annotate a still image with detections")]
struct Args {
    /// Input image (any format the image crate decodes).
    input: PathBuf,

    /// Output JPEG.
    #[arg(long, default_value = "annotated.jpg")]
    output: PathBuf,

    /// Model identity: path to an .eim model, or stub://.
    #[arg(long, env = "STREAMER_MODEL", default_value = "stub://")]
    model: String,

    /// Model input width for engines that do not report one.
    #[arg(long, default_value_t = 320)]
    input_width: u32,

    #[arg(long, default_value_t = 320)]
    input_height: u32,

    /// Minimum confidence to draw.
    #[arg(long, default_value_t = 0.0)]
    threshold: f32,

    /// Font for labels. Without one only markers are drawn.
    #[arg(long)]
    font: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut image = image::open(&args.input)
        .with_context(|| format!("open {}", args.input.display()))?
        .into_rgb8();

    let mut engine = open_engine(
        &args.model,
        ModelInput::rgb(args.input_width, args.input_height),
    )?;
    let info = engine.init()?;
    log::info!(
        "annotate_still: {} model {} input {}x{} labels {:?}",
        engine.name(),
        info.version,
        info.input.width,
        info.input.height,
        info.labels
    );

    let features = engine.extract_features(&image)?;
    let boxes = engine.classify(&features)?;
    let result = DetectionResult::new(0, info.input, boxes);

    let mut annotator = Annotator::new(args.threshold);
    if let Some(path) = &args.font {
        annotator = annotator.with_font(Annotator::load_font(path)?);
    }
    let drawn = annotator.annotate(&mut image, &result);

    let jpeg = encode_jpeg(&image, DEFAULT_JPEG_QUALITY)?;
    std::fs::write(&args.output, jpeg)
        .with_context(|| format!("write {}", args.output.display()))?;

    println!("{}", serde_json::to_string_pretty(&result.boxes)?);
    log::info!(
        "annotate_still: {} of {} boxes drawn, saved {}",
        drawn,
        result.boxes.len(),
        args.output.display()
    );
    Ok(())
}
