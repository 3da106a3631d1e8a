use anyhow::Result;
use image::{DynamicImage, ImageBuffer, ImageFormat, Rgb};
use toolkt_core::{
    compute_sample_factor, load_scaled, load_scaled_with_telemetry, plan_decode, probe_dimensions, CoreError, ImageDimensions,
    ImageSource, SampleMode, TargetBounds,
};
use toolkt_image::{crop_in_center, encode_png, from_raster, ImageCrateDecoder};
use toolkt_telemetry::{sink_from_vars, FILE_VAR, SINK_VAR};

fn build_sample(width: u32, height: u32, format: ImageFormat) -> Result<Vec<u8>> {
    let img = ImageBuffer::from_fn(width, height, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            Rgb([255, 255, 255])
        } else {
            Rgb([10, 10, 10])
        }
    });
    let mut out = Vec::new();
    DynamicImage::ImageRgb8(img).write_to(&mut std::io::Cursor::new(&mut out), format)?;
    Ok(out)
}

#[test]
fn jpeg_on_disk_is_planned_and_decoded_at_half_size() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("landscape.jpg");
    std::fs::write(&path, build_sample(1024, 768, ImageFormat::Jpeg)?)?;
    let source = ImageSource::Path(path);
    let decoder = ImageCrateDecoder::default();
    let target = TargetBounds::new(300, 300)?;

    let dims = probe_dimensions(&decoder, &source)?;
    assert_eq!(dims, ImageDimensions::new(1024, 768)?);
    assert_eq!(compute_sample_factor(dims, target)?.get(), 2);

    let (plan, raster) = load_scaled(&decoder, &source, target, SampleMode::PerAxis)?;
    assert_eq!(plan.factor.get(), 2);
    assert_eq!(raster.dimensions(), plan.output);
    assert_eq!((raster.width, raster.height), (512, 384));
    Ok(())
}

#[test]
fn small_png_is_decoded_untouched() -> Result<()> {
    let source = ImageSource::Bytes(build_sample(200, 120, ImageFormat::Png)?);
    let decoder = ImageCrateDecoder::default();
    let (plan, raster) = load_scaled(&decoder, &source, TargetBounds::new(200, 120)?, SampleMode::PerAxis)?;
    assert_eq!(plan.factor.get(), 1);
    assert_eq!((raster.width, raster.height), (200, 120));
    Ok(())
}

#[test]
fn modes_disagree_only_for_non_square_targets() -> Result<()> {
    let source = ImageSource::Bytes(build_sample(4000, 1000, ImageFormat::Png)?);
    let decoder = ImageCrateDecoder::default();
    let target = TargetBounds::new(1000, 100)?;
    let per_axis = plan_decode(&decoder, &source, target, SampleMode::PerAxis)?;
    let height_only = plan_decode(&decoder, &source, target, SampleMode::HeightOnly)?;
    assert_eq!(per_axis.factor.get(), 4);
    assert_eq!(height_only.factor.get(), 8);
    assert_eq!(height_only.output, ImageDimensions::new(500, 125)?);
    Ok(())
}

#[test]
fn corrupt_input_surfaces_decode_error() -> Result<()> {
    let decoder = ImageCrateDecoder::default();
    let mut truncated = build_sample(64, 64, ImageFormat::Png)?;
    truncated.truncate(12);
    let err = load_scaled(
        &decoder,
        &ImageSource::Bytes(truncated),
        TargetBounds::new(16, 16)?,
        SampleMode::PerAxis,
    )
    .expect_err("truncated png should fail");
    assert!(matches!(err, CoreError::Decode(_)));
    Ok(())
}

#[test]
fn zero_target_fails_before_touching_the_decoder() {
    let err = TargetBounds::new(0, 100).expect_err("zero target");
    assert!(matches!(err, CoreError::InvalidArgument(_)));
}

#[test]
fn sampled_and_cropped_output_encodes_to_png() -> Result<()> {
    let source = ImageSource::Bytes(build_sample(1200, 900, ImageFormat::Png)?);
    let decoder = ImageCrateDecoder::default();
    let target = TargetBounds::new(256, 256)?;
    let (plan, raster) = load_scaled(&decoder, &source, target, SampleMode::PerAxis)?;
    assert_eq!(plan.factor.get(), 2);
    let image = crop_in_center(&from_raster(raster)?, target.target_width, target.target_height);
    let png = encode_png(&image)?;
    let dims = probe_dimensions(&decoder, &ImageSource::Bytes(png))?;
    assert_eq!(dims, ImageDimensions::new(256, 256)?);
    Ok(())
}

#[test]
fn file_telemetry_records_the_full_pipeline() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let log = dir.path().join("telemetry.jsonl");
    let log_value = log.display().to_string();
    let sink = sink_from_vars(|name| match name {
        SINK_VAR => Some("file".to_string()),
        FILE_VAR => Some(log_value.clone()),
        _ => None,
    })
    .expect("file sink should be selected");

    let source = ImageSource::Bytes(build_sample(800, 800, ImageFormat::Png)?);
    load_scaled_with_telemetry(
        &ImageCrateDecoder::default(),
        &source,
        TargetBounds::new(100, 100)?,
        SampleMode::PerAxis,
        Some(sink.as_ref()),
    )?;

    let contents = std::fs::read_to_string(&log)?;
    let events: Vec<serde_json::Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line))
        .collect::<std::result::Result<_, _>>()?;
    let kinds: Vec<&str> = events.iter().filter_map(|e| e["eventType"].as_str()).collect();
    assert_eq!(kinds, vec!["ProbeStart", "ProbeSuccess", "DecodeStart", "DecodeSuccess"]);
    assert_eq!(events[3]["factor"], 8);
    Ok(())
}
