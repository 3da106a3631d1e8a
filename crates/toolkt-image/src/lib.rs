use std::io::{BufRead, Cursor, Seek};

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, RgbaImage};
use toolkt_core::{CoreError, ImageDecoder, ImageDimensions, ImageSource, RasterImage, SampleFactor};

/// [`ImageDecoder`] backed by the `image` crate.
///
/// The codecs have no decimated decode, so `decode` reads the full image and
/// resizes it down to the sampled size with `filter`.
#[derive(Debug, Clone, Copy)]
pub struct ImageCrateDecoder {
    filter: FilterType,
}

impl Default for ImageCrateDecoder {
    fn default() -> Self {
        Self {
            filter: FilterType::Triangle,
        }
    }
}

impl ImageCrateDecoder {
    pub fn with_filter(filter: FilterType) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> FilterType {
        self.filter
    }

    fn decode_full(&self, source: &ImageSource) -> Result<DynamicImage, CoreError> {
        match source {
            ImageSource::Path(path) => {
                let reader = ImageReader::open(path).map_err(|e| decode_error(source, e))?;
                decode_reader(source, reader)
            }
            ImageSource::Bytes(bytes) => decode_reader(source, ImageReader::new(Cursor::new(bytes.as_slice()))),
        }
    }
}

impl ImageDecoder for ImageCrateDecoder {
    fn probe(&self, source: &ImageSource) -> Result<ImageDimensions, CoreError> {
        let (width, height) = match source {
            ImageSource::Path(path) => {
                let reader = ImageReader::open(path).map_err(|e| decode_error(source, e))?;
                probe_reader(source, reader)?
            }
            ImageSource::Bytes(bytes) => probe_reader(source, ImageReader::new(Cursor::new(bytes.as_slice())))?,
        };
        ImageDimensions::new(width, height)
    }

    fn decode(&self, source: &ImageSource, factor: SampleFactor) -> Result<RasterImage, CoreError> {
        let image = self.decode_full(source)?;
        let sampled = downsample(image, factor, self.filter);
        to_raster(sampled)
    }
}

fn probe_reader<R: BufRead + Seek>(source: &ImageSource, reader: ImageReader<R>) -> Result<(u32, u32), CoreError> {
    reader
        .with_guessed_format()
        .map_err(|e| decode_error(source, e))?
        .into_dimensions()
        .map_err(|e| decode_error(source, e))
}

fn decode_reader<R: BufRead + Seek>(source: &ImageSource, reader: ImageReader<R>) -> Result<DynamicImage, CoreError> {
    reader
        .with_guessed_format()
        .map_err(|e| decode_error(source, e))?
        .decode()
        .map_err(|e| decode_error(source, e))
}

fn decode_error(source: &ImageSource, err: impl std::fmt::Display) -> CoreError {
    CoreError::Decode(format!("{}: {}", source.describe(), err))
}

/// Divides both axes by `factor` (at least one pixel each); factor one is a no-op.
pub fn downsample(image: DynamicImage, factor: SampleFactor, filter: FilterType) -> DynamicImage {
    if factor == SampleFactor::ONE {
        return image;
    }
    let out = factor.apply(ImageDimensions {
        width: image.width(),
        height: image.height(),
    });
    image.resize_exact(out.width, out.height, filter)
}

/// Crops the centered `target_width`x`target_height` region. Images smaller
/// than the target on either axis come back unchanged.
pub fn crop_in_center(image: &DynamicImage, target_width: u32, target_height: u32) -> DynamicImage {
    if target_width == 0 || target_height == 0 || image.width() < target_width || image.height() < target_height {
        return image.clone();
    }
    let x = (image.width() - target_width) / 2;
    let y = (image.height() - target_height) / 2;
    image.crop_imm(x, y, target_width, target_height)
}

pub fn to_raster(image: DynamicImage) -> Result<RasterImage, CoreError> {
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    RasterImage::new(width, height, rgba.into_raw())
}

pub fn from_raster(raster: RasterImage) -> Result<DynamicImage, CoreError> {
    let (width, height) = (raster.width, raster.height);
    RgbaImage::from_raw(width, height, raster.rgba)
        .map(DynamicImage::ImageRgba8)
        .ok_or_else(|| CoreError::InvalidArgument(format!("rgba buffer does not fit {}x{}", width, height)))
}

pub fn encode_png(image: &DynamicImage) -> Result<Vec<u8>, CoreError> {
    let mut encoded = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut encoded), ImageFormat::Png)
        .map_err(|e| CoreError::Decode(format!("png encode failed: {}", e)))?;
    Ok(encoded)
}

pub fn estimate_rgba_bytes(dims: ImageDimensions) -> u64 {
    dims.pixels().saturating_mul(4)
}

pub fn parse_filter(value: &str) -> Result<FilterType, CoreError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "nearest" => Ok(FilterType::Nearest),
        "triangle" | "bilinear" => Ok(FilterType::Triangle),
        "catmull-rom" | "catmullrom" | "bicubic" => Ok(FilterType::CatmullRom),
        "gaussian" => Ok(FilterType::Gaussian),
        "lanczos3" | "lanczos" => Ok(FilterType::Lanczos3),
        other => Err(CoreError::InvalidArgument(format!(
            "unknown filter '{}'; expected one of: nearest, triangle, catmull-rom, gaussian, lanczos3",
            other
        ))),
    }
}
