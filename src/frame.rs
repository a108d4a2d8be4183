//! Frame types shared between the producer loop and the classification worker.
//!
//! - `FrameShape`: fixed geometry every frame in a pipeline conforms to.
//! - `Frame`: a decoded RGB image stamped with its production index.
//! - `SharedFrameBuffer`: single-slot mailbox holding the most recently
//!   dispatched frame.
//!
//! The shared buffer is a mailbox, not a log. A reader always gets the
//! latest complete write; older frames are overwritten in place.

use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::{Mutex, MutexGuard};

/// Number of interleaved channels in every frame (RGB).
pub const RGB_CHANNELS: u32 = 3;

/// Frame geometry. Channel count is fixed to `RGB_CHANNELS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameShape {
    pub width: u32,
    pub height: u32,
}

impl FrameShape {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Size in bytes of one interleaved RGB frame of this shape.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * RGB_CHANNELS as usize
    }

    pub fn matches(&self, image: &RgbImage) -> bool {
        image.width() == self.width && image.height() == self.height
    }
}

/// Decoded frame.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Monotonic production index (0-based).
    pub index: u64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(index: u64, image: RgbImage) -> Self {
        Self { index, image }
    }

    pub fn shape(&self) -> FrameShape {
        FrameShape::new(self.image.width(), self.image.height())
    }
}

struct Slot {
    index: u64,
    generation: u64,
    image: RgbImage,
}

/// Mutex-guarded single frame slot.
///
/// `write` copies into the preallocated slot, so steady-state writes do not
/// allocate. `read_copy` duplicates the slot while holding the lock; the lock
/// is never held for anything but the copy.
pub struct SharedFrameBuffer {
    shape: FrameShape,
    slot: Mutex<Slot>,
}

impl SharedFrameBuffer {
    pub fn new(shape: FrameShape) -> Self {
        Self {
            shape,
            slot: Mutex::new(Slot {
                index: 0,
                generation: 0,
                image: RgbImage::new(shape.width, shape.height),
            }),
        }
    }

    pub fn shape(&self) -> FrameShape {
        self.shape
    }

    /// Replace the slot contents with `frame`.
    ///
    /// Frames that do not match the buffer shape are rejected untouched.
    pub fn write(&self, frame: &Frame) -> Result<()> {
        if !self.shape.matches(&frame.image) {
            return Err(anyhow!(
                "frame {} is {}x{}, shared buffer expects {}x{}",
                frame.index,
                frame.image.width(),
                frame.image.height(),
                self.shape.width,
                self.shape.height
            ));
        }
        let mut slot = self.lock()?;
        slot.image.copy_from_slice(frame.image.as_raw());
        slot.index = frame.index;
        slot.generation += 1;
        Ok(())
    }

    /// Copy the latest written frame out of the slot.
    pub fn read_copy(&self) -> Result<Frame> {
        let slot = self.lock()?;
        Ok(Frame::new(slot.index, slot.image.clone()))
    }

    /// Number of completed writes so far.
    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| anyhow!("shared frame buffer lock poisoned"))
    }
}
