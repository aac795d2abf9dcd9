//! Depth-frame preprocessing.
//!
//! Converts a raw depth sample array into a scaled, range-gated, optionally
//! downsampled image in meters:
//!
//! ```text
//! preprocess(frame) = range_limit(scale(downsample(frame)))
//! ```
//!
//! Samples outside the configured range become `NaN`.  NaN samples flow
//! through every later stage and are dropped by the deprojector; they are
//! never mistaken for a zero-range hit.
//!
//! # Example
//!
//! ```rust
//! use voxmap_perception::preprocess::{DepthImage, range_limit};
//!
//! let image = DepthImage::new(3, 1, vec![4.0, 7.0, 11.0]).unwrap();
//! let gated = range_limit(image, 5.0, 10.0);
//! assert!(gated.data()[0].is_nan());
//! assert_eq!(gated.data()[1], 7.0);
//! assert!(gated.data()[2].is_nan());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use voxmap_types::{DepthFrame, Intrinsics, MapError};

// ────────────────────────────────────────────────────────────────────────────
// DepthImage
// ────────────────────────────────────────────────────────────────────────────

/// A row-major `f32` depth image.  Units are native until [`scale`] has run,
/// meters afterwards.
///
/// `data.len() == width * height` holds for every image; the only way in is
/// [`DepthImage::new`] (or [`DepthImage::from_frame`]).
#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    width: usize,
    height: usize,
    data: Vec<f32>,
}

impl DepthImage {
    /// Wrap `data` as a `width × height` image.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::FrameShape`] when `data.len() != width * height`.
    pub fn new(width: usize, height: usize, data: Vec<f32>) -> Result<Self, MapError> {
        if data.len() != width * height {
            return Err(MapError::FrameShape(format!(
                "{width}x{height} image needs {} samples, got {}",
                width * height,
                data.len()
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    /// Copy the samples of a sensor frame into an image.
    pub fn from_frame(frame: &DepthFrame) -> Result<Self, MapError> {
        Self::new(frame.width, frame.height, frame.samples.to_f32())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Row-major samples.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn get(&self, row: usize, col: usize) -> f32 {
        self.data[row * self.width + col]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Downsampling parameters
// ────────────────────────────────────────────────────────────────────────────

/// Tile size used by [`downsample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub width: usize,
    pub height: usize,
}

impl Block {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    /// A `1 × 1` block: downsampling is a no-op.
    pub fn identity() -> Self {
        Self::new(1, 1)
    }

    pub fn is_identity(&self) -> bool {
        self.width == 1 && self.height == 1
    }

    /// Check that the block is non-empty and tiles a `width × height` frame
    /// exactly.
    pub fn check_divides(&self, width: usize, height: usize) -> Result<(), MapError> {
        if self.width == 0 || self.height == 0 {
            return Err(MapError::Config(format!(
                "downsample block must be non-empty, got {}x{}",
                self.width, self.height
            )));
        }
        if width % self.width != 0 || height % self.height != 0 {
            return Err(MapError::Config(format!(
                "downsample block {}x{} does not divide frame {width}x{height}",
                self.width, self.height
            )));
        }
        Ok(())
    }
}

impl Default for Block {
    fn default() -> Self {
        Self::identity()
    }
}

/// How the samples of one tile are reduced to a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Nearest return in the tile; the conservative choice for obstacles.
    ///
    /// Tiles are reduced on native samples, before scaling and range
    /// gating, so a single zero (invalid) return makes the tile minimum zero
    /// and the gate then turns the whole tile into `NaN`.
    #[default]
    Min,
    Max,
    Mean,
}

impl FromStr for Reduction {
    type Err = MapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "min" => Ok(Reduction::Min),
            "max" => Ok(Reduction::Max),
            "mean" => Ok(Reduction::Mean),
            other => Err(MapError::Config(format!(
                "unknown downsample reduction method {other:?} (expected min, max or mean)"
            ))),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reduction::Min => write!(f, "min"),
            Reduction::Max => write!(f, "max"),
            Reduction::Mean => write!(f, "mean"),
        }
    }
}

impl Reduction {
    fn reduce(self, tile: impl Iterator<Item = f32>) -> f32 {
        match self {
            // Folding from NaN keeps an all-NaN tile NaN; `f32::min`/`max`
            // ignore a NaN operand otherwise.
            Reduction::Min => tile.fold(f32::NAN, f32::min),
            Reduction::Max => tile.fold(f32::NAN, f32::max),
            Reduction::Mean => {
                let (sum, n) = tile.fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
                if n == 0 { f32::NAN } else { sum / n as f32 }
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Stage functions
// ────────────────────────────────────────────────────────────────────────────

/// Multiply every sample by `factor`.
pub fn scale(mut image: DepthImage, factor: f64) -> DepthImage {
    let factor = factor as f32;
    for v in image.data.iter_mut() {
        *v *= factor;
    }
    image
}

/// Replace samples below `min` or above `max` with `NaN`.  Samples equal to
/// either bound are kept.
pub fn range_limit(mut image: DepthImage, min: f64, max: f64) -> DepthImage {
    let (min, max) = (min as f32, max as f32);
    for v in image.data.iter_mut() {
        if *v < min || *v > max {
            *v = f32::NAN;
        }
    }
    image
}

/// Reduce every `block` tile of `image` to one sample.
///
/// The returned intrinsics have the principal point divided by the block
/// dimensions; focal lengths are carried over unchanged.
///
/// # Errors
///
/// Returns [`MapError::Config`] if `block` is empty or does not tile the image.
pub fn downsample(
    image: DepthImage,
    intrinsics: Intrinsics,
    block: Block,
    reduction: Reduction,
) -> Result<(DepthImage, Intrinsics), MapError> {
    block.check_divides(image.width, image.height)?;
    if block.is_identity() {
        return Ok((image, intrinsics));
    }

    let out_w = image.width / block.width;
    let out_h = image.height / block.height;
    let mut data = Vec::with_capacity(out_w * out_h);
    for tr in 0..out_h {
        for tc in 0..out_w {
            let rows = tr * block.height..(tr + 1) * block.height;
            let tile = rows.flat_map(|r| {
                let start = r * image.width + tc * block.width;
                image.data[start..start + block.width].iter().copied()
            });
            data.push(reduction.reduce(tile));
        }
    }

    let adjusted = Intrinsics {
        ppx: intrinsics.ppx / block.width as f64,
        ppy: intrinsics.ppy / block.height as f64,
        ..intrinsics
    };
    Ok((
        DepthImage {
            width: out_w,
            height: out_h,
            data,
        },
        adjusted,
    ))
}

// ────────────────────────────────────────────────────────────────────────────
// DepthPreprocessor
// ────────────────────────────────────────────────────────────────────────────

/// Values consumed by [`DepthPreprocessor`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PreprocessConfig {
    /// Nearest accepted range (meters).
    pub min_range: f64,
    /// Farthest accepted range (meters).
    pub max_range: f64,
    pub block: Block,
    pub reduction: Reduction,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            min_range: 0.1,
            max_range: 10.0,
            block: Block::identity(),
            reduction: Reduction::Min,
        }
    }
}

/// Preprocessing stage bound to one sensor resolution.
///
/// All configuration checks run in [`DepthPreprocessor::new`]; per-frame
/// calls only reject frames that disagree with the configured resolution.
#[derive(Debug, Clone)]
pub struct DepthPreprocessor {
    config: PreprocessConfig,
    width: usize,
    height: usize,
}

impl DepthPreprocessor {
    /// Build a preprocessor for `width × height` frames.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Config`] when the block does not divide the frame,
    /// or the range bounds are not finite with `0 <= min <= max`.
    pub fn new(config: PreprocessConfig, width: usize, height: usize) -> Result<Self, MapError> {
        if width == 0 || height == 0 {
            return Err(MapError::Config(format!(
                "sensor resolution must be non-empty, got {width}x{height}"
            )));
        }
        config.block.check_divides(width, height)?;
        let (min, max) = (config.min_range, config.max_range);
        if !min.is_finite() || !max.is_finite() || min < 0.0 || min > max {
            return Err(MapError::Config(format!(
                "depth range must satisfy 0 <= min <= max, got [{min}, {max}]"
            )));
        }
        Ok(Self {
            config,
            width,
            height,
        })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Resolution of the images this stage produces.
    pub fn output_shape(&self) -> (usize, usize) {
        (
            self.width / self.config.block.width,
            self.height / self.config.block.height,
        )
    }

    /// Run downsample, scale and range gate on one frame.
    ///
    /// The scale factor is the frame's own `intrinsics.scale`.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::FrameShape`] when the frame resolution or sample
    /// count differs from the configured resolution.
    pub fn preprocess(&self, frame: &DepthFrame) -> Result<(DepthImage, Intrinsics), MapError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(MapError::FrameShape(format!(
                "expected {}x{} frame, got {}x{}",
                self.width, self.height, frame.width, frame.height
            )));
        }
        let image = DepthImage::from_frame(frame)?;
        let (image, intrinsics) = downsample(
            image,
            frame.intrinsics,
            self.config.block,
            self.config.reduction,
        )?;
        let image = scale(image, frame.intrinsics.scale);
        let image = range_limit(image, self.config.min_range, self.config.max_range);
        Ok((image, intrinsics))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
