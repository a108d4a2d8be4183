//! Detection overlay: result stickiness and frame annotation.

mod annotate;
mod cache;

pub use annotate::{remap, Annotator, MappedBox, Scale, LABEL_FONT_PX, MARKER_RADIUS};
pub use cache::ResultCache;
