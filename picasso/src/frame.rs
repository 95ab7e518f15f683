//! Frames and the frame source interface.
//!
//! Decoding raw camera files is the job of an external format layer; the
//! engine only sees [`FrameSource`]. [`VecFrameSource`] keeps frames in memory.

use std::ops::Index;

use crate::error::{FrameSourceError, InputError};

/// Immutable 2D intensity image, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    index: usize,
    width: usize,
    height: usize,
    pixels: Vec<f32>,
}

impl Frame {
    /// Create a frame from row-major samples.
    ///
    /// # Panics
    ///
    /// Panics if `pixels.len() != width * height`.
    pub fn new(index: usize, width: usize, height: usize, pixels: Vec<f32>) -> Self {
        assert_eq!(
            pixels.len(),
            width * height,
            "pixels length must equal width * height"
        );
        Self {
            index,
            width,
            height,
            pixels,
        }
    }

    /// Create a frame from raw 16-bit camera counts.
    pub fn from_u16(index: usize, width: usize, height: usize, pixels: &[u16]) -> Self {
        Self::new(
            index,
            width,
            height,
            pixels.iter().map(|&v| v as f32).collect(),
        )
    }

    /// Frame with every pixel set to `value`.
    pub fn filled(index: usize, width: usize, height: usize, value: f32) -> Self {
        Self::new(index, width, height, vec![value; width * height])
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    #[inline]
    pub fn height(&self) -> usize {
        self.height
    }

    #[inline]
    pub fn pixels(&self) -> &[f32] {
        &self.pixels
    }

    #[inline]
    pub fn get(&self, x: usize, y: usize) -> f32 {
        debug_assert!(x < self.width && y < self.height);
        self.pixels[y * self.width + x]
    }

    /// Row `y` as a slice.
    #[inline]
    pub fn row(&self, y: usize) -> &[f32] {
        &self.pixels[y * self.width..(y + 1) * self.width]
    }

    /// Check the frame is usable: non-empty, finite, non-negative samples.
    pub fn check_well_formed(&self) -> Result<(), InputError> {
        if self.width == 0 || self.height == 0 {
            return Err(InputError::MalformedFrame {
                index: self.index,
                reason: format!("empty frame ({}x{})", self.width, self.height),
            });
        }
        if let Some(pos) = self
            .pixels
            .iter()
            .position(|v| !v.is_finite() || *v < 0.0)
        {
            return Err(InputError::MalformedFrame {
                index: self.index,
                reason: format!(
                    "invalid sample {} at ({}, {})",
                    self.pixels[pos],
                    pos % self.width,
                    pos / self.width
                ),
            });
        }
        Ok(())
    }
}

impl Index<(usize, usize)> for Frame {
    type Output = f32;

    #[inline]
    fn index(&self, (x, y): (usize, usize)) -> &Self::Output {
        &self.pixels[y * self.width + x]
    }
}

/// Ordered sequence of frames, typically backed by a file on disk.
///
/// Access is dominated by sequential reads in increasing index order, so
/// implementations may prefetch. `get_frame` may block on storage.
pub trait FrameSource {
    fn frame_count(&self) -> usize;

    /// Load frame `index`.
    ///
    /// Fails with [`FrameSourceError::OutOfRange`] for an invalid index and
    /// [`FrameSourceError::Decode`] for corrupt storage.
    fn get_frame(&self, index: usize) -> Result<Frame, FrameSourceError>;
}

impl<S: FrameSource + ?Sized> FrameSource for &S {
    fn frame_count(&self) -> usize {
        (**self).frame_count()
    }

    fn get_frame(&self, index: usize) -> Result<Frame, FrameSourceError> {
        (**self).get_frame(index)
    }
}

/// Frame source holding all frames in memory.
#[derive(Debug, Clone, Default)]
pub struct VecFrameSource {
    frames: Vec<Frame>,
}

impl VecFrameSource {
    /// Frames are re-indexed by their position in `frames`.
    pub fn new(frames: Vec<Frame>) -> Self {
        let frames = frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| Frame { index, ..frame })
            .collect();
        Self { frames }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

impl FrameSource for VecFrameSource {
    fn frame_count(&self) -> usize {
        self.frames.len()
    }

    fn get_frame(&self, index: usize) -> Result<Frame, FrameSourceError> {
        self.frames
            .get(index)
            .cloned()
            .ok_or(FrameSourceError::OutOfRange {
                index,
                count: self.frames.len(),
            })
    }
}
