//! Network output: JPEG re-encoding and multipart stream fan-out.

mod encode;
mod hub;

pub use encode::{encode_jpeg, StreamChunk, StreamEncoder, BOUNDARY, DEFAULT_JPEG_QUALITY};
pub use hub::{HubEvent, StreamHub};
