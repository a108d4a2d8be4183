//! upload_sample - send one image to the ingestion service.
//!
//! Exercises the same uploader the daemon uses, with a single hand-written
//! box as metadata.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use camera_streamer::pipeline::{IngestionUploader, UploadSample, Uploader, DEFAULT_INGESTION_URL};
use camera_streamer::stream::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use camera_streamer::BoundingBox;

#[derive(Parser, Debug)]
#[command(author, version, about = "Upload one image as a training sample")]
struct Args {
    /// Image to upload.
    image: PathBuf,

    #[arg(long, env = "STREAMER_UPLOAD_URL", default_value = DEFAULT_INGESTION_URL)]
    url: String,

    #[arg(long, env = "STREAMER_UPLOAD_API_KEY", hide_env_values = true)]
    api_key: String,

    #[arg(long, default_value = "unversioned")]
    model_version: String,

    #[arg(long, default_value = "test")]
    label: String,

    #[arg(long, default_value_t = 0.5)]
    confidence: f32,

    /// Box as x,y,width,height in model input coordinates.
    #[arg(long, value_delimiter = ',', num_args = 4, default_values_t = [0, 0, 10, 10])]
    bbox: Vec<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let image = image::open(&args.image)
        .with_context(|| format!("open {}", args.image.display()))?
        .into_rgb8();
    let jpeg = encode_jpeg(&image, DEFAULT_JPEG_QUALITY)?;

    let [x, y, width, height] = <[u32; 4]>::try_from(args.bbox.as_slice())
        .context("--bbox takes exactly four values")?;
    let boxes = vec![BoundingBox::new(
        args.label,
        args.confidence,
        x,
        y,
        width,
        height,
    )];

    let sample = UploadSample::new(jpeg, boxes);
    let mut uploader = IngestionUploader::new(args.url, args.api_key, args.model_version);
    let message = uploader.upload(&sample)?;
    log::info!("upload_sample: {}", message);
    Ok(())
}
