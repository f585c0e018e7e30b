use super::FrameSize;
use crate::error::{Error, Result};

/// Frame layout config for a [`Umem`](crate::umem::Umem) registration.
///
/// The headroom is the number of bytes reserved at the start of each frame
/// before packet data; received payloads are written after it.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    frame_size: FrameSize,
    frame_headroom: u32,
}

impl Config {
    /// Create a new UMEM config. Fails with
    /// [`InvalidGeometry`](Error::InvalidGeometry) if the headroom does not
    /// leave room for any packet data.
    pub fn new(frame_size: FrameSize, frame_headroom: u32) -> Result<Self> {
        if frame_headroom >= frame_size.get() {
            return Err(Error::InvalidGeometry);
        }

        Ok(Self {
            frame_size,
            frame_headroom,
        })
    }

    #[inline]
    pub fn frame_size(&self) -> FrameSize {
        self.frame_size
    }

    #[inline]
    pub fn frame_headroom(&self) -> u32 {
        self.frame_headroom
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            frame_size: FrameSize::new(2048).unwrap(),
            frame_headroom: 0,
        }
    }
}
