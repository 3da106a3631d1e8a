use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Natural pixel size of an image, as reported by a header probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageDimensions {
    pub width: u32,
    pub height: u32,
}

impl ImageDimensions {
    pub fn new(width: u32, height: u32) -> Result<Self, CoreError> {
        let dims = Self { width, height };
        dims.validate()?;
        Ok(dims)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "image dimensions must be positive (got {}x{})",
                self.width, self.height
            )));
        }
        Ok(())
    }

    pub fn fits_within(&self, target: &TargetBounds) -> bool {
        self.width <= target.target_width && self.height <= target.target_height
    }

    pub fn pixels(&self) -> u64 {
        (self.width as u64).saturating_mul(self.height as u64)
    }
}

impl Display for ImageDimensions {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Desired maximum output size of a decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetBounds {
    pub target_width: u32,
    pub target_height: u32,
}

impl TargetBounds {
    pub fn new(target_width: u32, target_height: u32) -> Result<Self, CoreError> {
        let target = Self {
            target_width,
            target_height,
        };
        target.validate()?;
        Ok(target)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.target_width == 0 || self.target_height == 0 {
            return Err(CoreError::InvalidArgument(format!(
                "target bounds must be positive (got {}x{})",
                self.target_width, self.target_height
            )));
        }
        Ok(())
    }
}

/// Power-of-two divisor applied to both axes before decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct SampleFactor(u32);

impl SampleFactor {
    pub const ONE: SampleFactor = SampleFactor(1);

    pub fn new(value: u32) -> Result<Self, CoreError> {
        if !value.is_power_of_two() {
            return Err(CoreError::InvalidArgument(format!(
                "sample factor must be a power of two (got {})",
                value
            )));
        }
        Ok(Self(value))
    }

    pub fn get(self) -> u32 {
        self.0
    }

    /// Dimensions after dividing each axis by the factor, never below one pixel.
    pub fn apply(self, dims: ImageDimensions) -> ImageDimensions {
        ImageDimensions {
            width: (dims.width / self.0).max(1),
            height: (dims.height / self.0).max(1),
        }
    }
}

impl Default for SampleFactor {
    fn default() -> Self {
        Self::ONE
    }
}

impl TryFrom<u32> for SampleFactor {
    type Error = CoreError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SampleFactor> for u32 {
    fn from(factor: SampleFactor) -> Self {
        factor.0
    }
}

impl Display for SampleFactor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which target axis the halved width is compared against.
///
/// `HeightOnly` compares both halves against the target height.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleMode {
    #[default]
    PerAxis,
    HeightOnly,
}

impl SampleMode {
    pub fn label(self) -> &'static str {
        match self {
            Self::PerAxis => "per-axis",
            Self::HeightOnly => "height-only",
        }
    }
}

pub fn parse_sample_mode(value: &str) -> Result<SampleMode, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "per-axis" | "axis" => Ok(SampleMode::PerAxis),
        "height-only" | "height" | "legacy" => Ok(SampleMode::HeightOnly),
        other => Err(CoreError::InvalidArgument(format!(
            "unknown sample mode '{}'; expected one of: per-axis, height-only",
            other
        ))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
}

impl ImageSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }
}

/// Decoded RGBA8 pixels, row-major.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RasterImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

impl RasterImage {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self, CoreError> {
        let expected = (width as u64).saturating_mul(height as u64).saturating_mul(4);
        if rgba.len() as u64 != expected {
            return Err(CoreError::InvalidArgument(format!(
                "rgba buffer holds {} bytes, expected {} for {}x{}",
                rgba.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self { width, height, rgba })
    }

    pub fn dimensions(&self) -> ImageDimensions {
        ImageDimensions {
            width: self.width,
            height: self.height,
        }
    }
}

/// Codec seam: a header-only probe plus a decimated full decode.
pub trait ImageDecoder: Send + Sync {
    fn probe(&self, source: &ImageSource) -> Result<ImageDimensions, CoreError>;
    fn decode(&self, source: &ImageSource, factor: SampleFactor) -> Result<RasterImage, CoreError>;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    DecodeError,
    InvalidArgument,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub message: String,
}

impl CoreError {
    pub fn as_error_info(&self) -> ErrorInfo {
        match self {
            Self::Decode(message) => ErrorInfo {
                code: ErrorCode::DecodeError,
                message: message.clone(),
            },
            Self::InvalidArgument(message) => ErrorInfo {
                code: ErrorCode::InvalidArgument,
                message: message.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TelemetryEventType {
    ProbeStart,
    ProbeSuccess,
    ProbeError,
    DecodeStart,
    DecodeSuccess,
    DecodeError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub mode: Option<SampleMode>,
    pub factor: Option<u32>,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SamplingConfig {
    pub target_width: u32,
    pub target_height: u32,
    pub mode: String,
    pub filter: String,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            target_width: 1024,
            target_height: 1024,
            mode: "per-axis".to_string(),
            filter: "triangle".to_string(),
        }
    }
}

impl SamplingConfig {
    pub fn target(&self) -> Result<TargetBounds, CoreError> {
        TargetBounds::new(self.target_width, self.target_height)
    }

    pub fn sample_mode(&self) -> Result<SampleMode, CoreError> {
        parse_sample_mode(&self.mode)
    }
}

/// Layers `overrides` on the defaults; zero sizes and blank labels keep the default.
pub fn resolve_sampling_config(overrides: SamplingConfig) -> SamplingConfig {
    let mut cfg = SamplingConfig::default();
    if overrides.target_width > 0 {
        cfg.target_width = overrides.target_width;
    }
    if overrides.target_height > 0 {
        cfg.target_height = overrides.target_height;
    }
    if !overrides.mode.trim().is_empty() {
        cfg.mode = overrides.mode;
    }
    if !overrides.filter.trim().is_empty() {
        cfg.filter = overrides.filter;
    }
    cfg
}

pub mod v1 {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PlanResponse {
        pub width: u32,
        pub height: u32,
        pub target_width: u32,
        pub target_height: u32,
        pub mode: String,
        pub sample_factor: u32,
        pub output_width: u32,
        pub output_height: u32,
    }

    impl From<&DecodePlan> for PlanResponse {
        fn from(plan: &DecodePlan) -> Self {
            Self {
                width: plan.source.width,
                height: plan.source.height,
                target_width: plan.target.target_width,
                target_height: plan.target.target_height,
                mode: plan.mode.label().to_string(),
                sample_factor: plan.factor.get(),
                output_width: plan.output.width,
                output_height: plan.output.height,
            }
        }
    }
}

/// Outcome of probing a source and choosing its sample factor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodePlan {
    pub source: ImageDimensions,
    pub target: TargetBounds,
    pub mode: SampleMode,
    pub factor: SampleFactor,
    pub output: ImageDimensions,
}

pub fn compute_sample_factor(dims: ImageDimensions, target: TargetBounds) -> Result<SampleFactor, CoreError> {
    compute_sample_factor_with_mode(dims, target, SampleMode::default())
}

/// Picks the factor by doubling from one while both halved axes, divided by the
/// factor, still reach the target. Returns the first factor where they do not.
pub fn compute_sample_factor_with_mode(
    dims: ImageDimensions,
    target: TargetBounds,
    mode: SampleMode,
) -> Result<SampleFactor, CoreError> {
    dims.validate()?;
    target.validate()?;
    if dims.fits_within(&target) {
        return Ok(SampleFactor::ONE);
    }

    let width_limit = match mode {
        SampleMode::PerAxis => target.target_width,
        SampleMode::HeightOnly => target.target_height,
    };
    let half_width = dims.width / 2;
    let half_height = dims.height / 2;

    // Halves are below 2^31, so the quotient hits zero before factor can overflow.
    let mut factor = 1u32;
    while half_width / factor >= width_limit && half_height / factor >= target.target_height {
        factor *= 2;
    }
    SampleFactor::new(factor)
}

pub fn probe_dimensions(decoder: &dyn ImageDecoder, source: &ImageSource) -> Result<ImageDimensions, CoreError> {
    let dims = decoder.probe(source)?;
    dims.validate()?;
    Ok(dims)
}

pub fn decode_scaled(
    decoder: &dyn ImageDecoder,
    source: &ImageSource,
    factor: SampleFactor,
) -> Result<RasterImage, CoreError> {
    decoder.decode(source, factor)
}

pub fn plan_decode(
    decoder: &dyn ImageDecoder,
    source: &ImageSource,
    target: TargetBounds,
    mode: SampleMode,
) -> Result<DecodePlan, CoreError> {
    let source_dims = probe_dimensions(decoder, source)?;
    let factor = compute_sample_factor_with_mode(source_dims, target, mode)?;
    Ok(DecodePlan {
        source: source_dims,
        target,
        mode,
        factor,
        output: factor.apply(source_dims),
    })
}

pub fn load_scaled(
    decoder: &dyn ImageDecoder,
    source: &ImageSource,
    target: TargetBounds,
    mode: SampleMode,
) -> Result<(DecodePlan, RasterImage), CoreError> {
    load_scaled_with_telemetry(decoder, source, target, mode, None)
}

pub fn load_scaled_with_telemetry(
    decoder: &dyn ImageDecoder,
    source: &ImageSource,
    target: TargetBounds,
    mode: SampleMode,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<(DecodePlan, RasterImage), CoreError> {
    let start = Instant::now();
    emit(telemetry, mode, TelemetryEventType::ProbeStart, None, None, Some(source.describe()));
    let plan = match plan_decode(decoder, source, target, mode) {
        Ok(plan) => {
            emit(
                telemetry,
                mode,
                TelemetryEventType::ProbeSuccess,
                Some(plan.factor.get()),
                Some(start.elapsed().as_millis() as u64),
                Some(format!("source={},output={}", plan.source, plan.output)),
            );
            plan
        }
        Err(err) => {
            emit(
                telemetry,
                mode,
                TelemetryEventType::ProbeError,
                None,
                Some(start.elapsed().as_millis() as u64),
                Some(err.to_string()),
            );
            return Err(err);
        }
    };

    let decode_start = Instant::now();
    emit(telemetry, mode, TelemetryEventType::DecodeStart, Some(plan.factor.get()), None, None);
    match decode_scaled(decoder, source, plan.factor) {
        Ok(raster) => {
            emit(
                telemetry,
                mode,
                TelemetryEventType::DecodeSuccess,
                Some(plan.factor.get()),
                Some(decode_start.elapsed().as_millis() as u64),
                Some(format!("decoded={}", raster.dimensions())),
            );
            Ok((plan, raster))
        }
        Err(err) => {
            emit(
                telemetry,
                mode,
                TelemetryEventType::DecodeError,
                Some(plan.factor.get()),
                Some(decode_start.elapsed().as_millis() as u64),
                Some(err.to_string()),
            );
            Err(err)
        }
    }
}

fn emit(
    telemetry: Option<&dyn TelemetrySink>,
    mode: SampleMode,
    event_type: TelemetryEventType,
    factor: Option<u32>,
    duration_ms: Option<u64>,
    detail: Option<String>,
) {
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type,
            mode: Some(mode),
            factor,
            duration_ms,
            detail,
        });
    }
}
