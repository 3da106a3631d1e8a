use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use regex::Regex;
use toolkt_core::{
    load_scaled_with_telemetry, plan_decode, probe_dimensions, resolve_sampling_config, v1, CoreError, ImageSource,
    SamplingConfig,
};
use toolkt_image::{crop_in_center, encode_png, estimate_rgba_bytes, from_raster, parse_filter, ImageCrateDecoder};
use toolkt_telemetry::sink_from_env;
use walkdir::WalkDir;

const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Parser, Debug)]
#[command(name = "toolkt", version, about = "Plan and perform memory-bounded image decodes")]
struct Cli {
    /// JSON sampling config (defaults to <config dir>/toolkt/config.json when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// Read image dimensions from the header only.
    Probe(ProbeArgs),
    /// Choose the sample factor for a target box.
    Plan(PlanArgs),
    /// Decode at the planned sample factor and write PNGs.
    Decode(DecodeArgs),
}

#[derive(Args, Debug)]
struct InputArgs {
    #[arg(long, short = 'i')]
    input: String,
    /// Root directory for regex input matching (defaults to current directory).
    #[arg(long, short = 'r')]
    input_root: Option<PathBuf>,
    /// Recurse when scanning directories / regex matches.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    recursive: bool,
    /// If set, abort the whole run on the first input error.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    strict: bool,
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    profile: bool,
}

#[derive(Args, Debug)]
struct SamplingArgs {
    #[arg(long = "width", short = 'W')]
    target_width: Option<u32>,
    #[arg(long = "height", short = 'H')]
    target_height: Option<u32>,
    /// per-axis or height-only.
    #[arg(long)]
    mode: Option<String>,
}

#[derive(Args, Debug)]
struct ProbeArgs {
    #[command(flatten)]
    input: InputArgs,
}

#[derive(Args, Debug)]
struct PlanArgs {
    #[command(flatten)]
    input: InputArgs,
    #[command(flatten)]
    sampling: SamplingArgs,
}

#[derive(Args, Debug)]
struct DecodeArgs {
    #[command(flatten)]
    input: InputArgs,
    #[command(flatten)]
    sampling: SamplingArgs,
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Output directory used when processing multiple inputs.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, short = 'f')]
    filter: Option<String>,
    /// Crop the sampled image to the target box around its center.
    #[arg(long, default_value_t = false, action = clap::ArgAction::SetTrue)]
    crop: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let total_start = Instant::now();
    let file_cfg = load_sampling_config(cli.config.as_deref())?;

    let (results, profile) = match cli.command {
        TopLevelCommand::Probe(args) => {
            let decoder = ImageCrateDecoder::default();
            let inputs = resolve_inputs(&args.input)?;
            let results = run_batch(inputs, &args.input, |input_path| {
                let dims = probe_dimensions(&decoder, &ImageSource::Path(input_path.to_path_buf()))?;
                Ok(serde_json::json!({
                    "input": input_path,
                    "width": dims.width,
                    "height": dims.height,
                    "estimatedBytes": estimate_rgba_bytes(dims),
                }))
            })?;
            (results, args.input.profile)
        }
        TopLevelCommand::Plan(args) => {
            let cfg = apply_sampling_flags(file_cfg, &args.sampling, None);
            let target = cfg.target()?;
            let mode = cfg.sample_mode()?;
            let decoder = ImageCrateDecoder::default();
            let inputs = resolve_inputs(&args.input)?;
            let results = run_batch(inputs, &args.input, |input_path| {
                let plan = plan_decode(&decoder, &ImageSource::Path(input_path.to_path_buf()), target, mode)?;
                let mut entry = serde_json::to_value(v1::PlanResponse::from(&plan))?;
                if let Some(map) = entry.as_object_mut() {
                    map.insert("input".to_string(), serde_json::json!(input_path));
                    map.insert("estimatedBytes".to_string(), serde_json::json!(estimate_rgba_bytes(plan.source)));
                    map.insert(
                        "estimatedSampledBytes".to_string(),
                        serde_json::json!(estimate_rgba_bytes(plan.output)),
                    );
                }
                Ok(entry)
            })?;
            (results, args.input.profile)
        }
        TopLevelCommand::Decode(args) => {
            let cfg = apply_sampling_flags(file_cfg, &args.sampling, args.filter.as_deref());
            let target = cfg.target()?;
            let mode = cfg.sample_mode()?;
            let decoder = ImageCrateDecoder::with_filter(parse_filter(&cfg.filter)?);
            let telemetry = sink_from_env();
            let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());
            let inputs = resolve_inputs(&args.input)?;
            let bulk = inputs.bulk;
            let results = run_batch(inputs, &args.input, |input_path| {
                let (plan, raster) = load_scaled_with_telemetry(
                    &decoder,
                    &ImageSource::Path(input_path.to_path_buf()),
                    target,
                    mode,
                    telemetry_ref,
                )?;
                let mut image = from_raster(raster)?;
                if args.crop {
                    image = crop_in_center(&image, target.target_width, target.target_height);
                }
                let output = resolve_output_for_input(&args, bulk, input_path)?;
                if let Some(parent) = output.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&output, encode_png(&image)?)
                    .with_context(|| format!("failed to write {}", output.display()))?;
                Ok(serde_json::json!({
                    "input": input_path,
                    "output": output,
                    "sampleFactor": plan.factor.get(),
                    "width": image.width(),
                    "height": image.height(),
                }))
            })?;
            (results, args.input.profile)
        }
    };

    let timings = if profile {
        Some(serde_json::json!({
            "files": results.len(),
            "total": total_start.elapsed().as_millis(),
        }))
    } else {
        None
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "results": results,
            "timingsMs": timings,
        }))?
    );
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("toolkt").join(CONFIG_FILE_NAME))
}

fn load_sampling_config(explicit: Option<&Path>) -> Result<SamplingConfig> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match default_config_path().filter(|path| path.is_file()) {
            Some(path) => path,
            None => return Ok(SamplingConfig::default()),
        },
    };
    let data = std::fs::read(&path).with_context(|| format!("failed to read config {}", path.display()))?;
    let overrides: SamplingConfig =
        serde_json::from_slice(&data).with_context(|| format!("invalid config {}", path.display()))?;
    Ok(resolve_sampling_config(overrides))
}

/// Command-line flags win over the config file; an explicit zero still fails validation.
fn apply_sampling_flags(base: SamplingConfig, args: &SamplingArgs, filter: Option<&str>) -> SamplingConfig {
    SamplingConfig {
        target_width: args.target_width.unwrap_or(base.target_width),
        target_height: args.target_height.unwrap_or(base.target_height),
        mode: args.mode.clone().unwrap_or(base.mode),
        filter: filter.map(str::to_string).unwrap_or(base.filter),
    }
}

/// Images selected by `-i`. Directory and regex inputs are bulk runs even
/// when they match a single file.
#[derive(Debug)]
struct ResolvedInputs {
    paths: Vec<PathBuf>,
    bulk: bool,
}

fn run_batch<F>(inputs: ResolvedInputs, args: &InputArgs, mut run: F) -> Result<Vec<serde_json::Value>>
where
    F: FnMut(&Path) -> Result<serde_json::Value>,
{
    if inputs.paths.is_empty() {
        return Err(anyhow!("no input images matched"));
    }
    let mut results = Vec::with_capacity(inputs.paths.len());
    for input_path in inputs.paths {
        let start = Instant::now();
        match run(&input_path) {
            Ok(mut entry) => {
                if args.profile {
                    if let Some(map) = entry.as_object_mut() {
                        map.insert(
                            "timingsMs".to_string(),
                            serde_json::json!({ "total": start.elapsed().as_millis() }),
                        );
                    }
                }
                results.push(entry);
            }
            Err(err) => {
                if inputs.bulk && !args.strict {
                    eprintln!("skipping {}: {}", input_path.display(), err);
                    results.push(serde_json::json!({
                        "input": input_path,
                        "error": error_json(&err),
                    }));
                    continue;
                }
                return Err(err.context(format!("failed on input {}", input_path.display())));
            }
        }
    }
    Ok(results)
}

fn error_json(err: &anyhow::Error) -> serde_json::Value {
    match err.downcast_ref::<CoreError>() {
        Some(core) => serde_json::to_value(core.as_error_info()).unwrap_or(serde_json::Value::Null),
        None => serde_json::json!({ "message": err.to_string() }),
    }
}

fn resolve_inputs(args: &InputArgs) -> Result<ResolvedInputs> {
    let candidate = PathBuf::from(&args.input);
    if candidate.exists() {
        if candidate.is_dir() {
            return Ok(ResolvedInputs {
                paths: collect_images_in_dir(&candidate, args.recursive)?,
                bulk: true,
            });
        }
        return Ok(ResolvedInputs {
            paths: vec![candidate],
            bulk: false,
        });
    }
    // Treat as regex matching file name under input_root.
    let root = match args.input_root.clone() {
        Some(root) => root,
        None => std::env::current_dir().context("reading current directory")?,
    };
    let re = Regex::new(&args.input).map_err(|e| anyhow!("invalid regex: {}", e))?;
    Ok(ResolvedInputs {
        paths: collect_images_by_regex(&root, args.recursive, &re)?,
        bulk: true,
    })
}

fn collect_images_in_dir(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    collect_images(dir, recursive, |_| true)
}

fn collect_images_by_regex(root: &Path, recursive: bool, re: &Regex) -> Result<Vec<PathBuf>> {
    collect_images(root, recursive, |path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        re.is_match(name)
    })
}

fn collect_images(root: &Path, recursive: bool, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let walker = if recursive {
        WalkDir::new(root)
    } else {
        WalkDir::new(root).max_depth(1)
    };
    let mut out = Vec::new();
    for entry in walker.into_iter().filter_map(std::result::Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let p = entry.into_path();
        if is_supported_image(&p) && keep(&p) {
            out.push(p);
        }
    }
    out.sort();
    Ok(out)
}

fn is_supported_image(path: &Path) -> bool {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    matches!(ext.as_str(), "png" | "jpg" | "jpeg")
}

fn resolve_output_for_input(args: &DecodeArgs, bulk: bool, input_path: &Path) -> Result<PathBuf> {
    let filename = default_output_filename(input_path)?;
    if bulk {
        // In bulk mode -o names a directory unless --output-dir is given.
        return Ok(match args.output_dir.clone().or_else(|| args.output.clone()) {
            Some(dir) => dir.join(filename),
            None => sibling_path(input_path, filename),
        });
    }
    match args.output.clone() {
        Some(path) => {
            validate_png_extension(&path)?;
            Ok(path)
        }
        None => Ok(match args.output_dir.clone() {
            Some(dir) => dir.join(filename),
            None => sibling_path(input_path, filename),
        }),
    }
}

fn default_output_filename(input: &Path) -> Result<String> {
    let stem = input
        .file_stem()
        .ok_or_else(|| anyhow!("input file must include a valid file name"))?
        .to_string_lossy();
    Ok(format!("{}_sampled.png", stem))
}

fn sibling_path(input: &Path, filename: String) -> PathBuf {
    match input.parent() {
        Some(parent) => parent.join(filename),
        None => PathBuf::from(filename),
    }
}

fn validate_png_extension(path: &Path) -> Result<()> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if ext != "png" {
        return Err(anyhow!("output must be a .png file (received: '{}')", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolkt_core::{parse_sample_mode, SampleMode};

    fn sampling(width: Option<u32>, mode: Option<&str>) -> SamplingArgs {
        SamplingArgs {
            target_width: width,
            target_height: None,
            mode: mode.map(str::to_string),
        }
    }

    #[test]
    fn flags_override_config_file_values() {
        let base = SamplingConfig {
            target_width: 800,
            target_height: 600,
            mode: "height-only".to_string(),
            filter: "nearest".to_string(),
        };
        let cfg = apply_sampling_flags(base, &sampling(Some(320), None), Some("lanczos3"));
        assert_eq!(cfg.target_width, 320);
        assert_eq!(cfg.target_height, 600);
        assert_eq!(cfg.mode, "height-only");
        assert_eq!(cfg.filter, "lanczos3");
    }

    #[test]
    fn explicit_zero_width_fails_validation() {
        let cfg = apply_sampling_flags(SamplingConfig::default(), &sampling(Some(0), None), None);
        assert!(cfg.target().is_err());
    }

    #[test]
    fn partial_config_file_keeps_defaults() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, br#"{"targetWidth": 300, "mode": "legacy"}"#)?;
        let cfg = load_sampling_config(Some(&path))?;
        assert_eq!(cfg.target_width, 300);
        assert_eq!(cfg.target_height, 1024);
        assert_eq!(parse_sample_mode(&cfg.mode)?, SampleMode::HeightOnly);
        assert_eq!(cfg.filter, "triangle");
        Ok(())
    }

    #[test]
    fn directory_scan_keeps_only_supported_images() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::create_dir_all(dir.path().join("nested"))?;
        for name in ["a.png", "b.JPG", "notes.txt", "nested/c.jpeg"] {
            std::fs::write(dir.path().join(name), b"x")?;
        }
        let flat = collect_images_in_dir(dir.path(), false)?;
        assert_eq!(flat.len(), 2);
        let deep = collect_images_in_dir(dir.path(), true)?;
        assert_eq!(deep.len(), 3);
        let matched = collect_images_by_regex(dir.path(), true, &Regex::new("^c\\.")?)?;
        assert_eq!(matched, vec![dir.path().join("nested").join("c.jpeg")]);
        Ok(())
    }

    fn input_args(input: &Path, strict: bool) -> InputArgs {
        InputArgs {
            input: input.display().to_string(),
            input_root: None,
            recursive: true,
            strict,
            profile: false,
        }
    }

    fn scan_headers(inputs: ResolvedInputs, args: &InputArgs) -> Result<Vec<serde_json::Value>> {
        let decoder = ImageCrateDecoder::default();
        run_batch(inputs, args, |input_path| {
            let dims = probe_dimensions(&decoder, &ImageSource::Path(input_path.to_path_buf()))?;
            Ok(serde_json::json!({ "input": input_path, "width": dims.width }))
        })
    }

    #[test]
    fn directory_with_one_broken_image_records_the_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("bad.png"), b"not an image")?;
        let args = input_args(dir.path(), false);
        let inputs = resolve_inputs(&args)?;
        assert!(inputs.bulk);
        assert_eq!(inputs.paths.len(), 1);

        let results = scan_headers(inputs, &args)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0]["error"]["code"], "decode-error");
        Ok(())
    }

    #[test]
    fn strict_directory_run_aborts_on_the_broken_image() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("bad.png"), b"not an image")?;
        let args = input_args(dir.path(), true);
        let inputs = resolve_inputs(&args)?;
        assert!(scan_headers(inputs, &args).is_err());
        Ok(())
    }

    #[test]
    fn regex_input_is_bulk_even_for_one_match() -> Result<()> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join("only.png"), b"not an image")?;
        let args = InputArgs {
            input: "^only\\.png$".to_string(),
            input_root: Some(dir.path().to_path_buf()),
            recursive: false,
            strict: false,
            profile: false,
        };
        let inputs = resolve_inputs(&args)?;
        assert!(inputs.bulk);
        assert_eq!(inputs.paths, vec![dir.path().join("only.png")]);
        Ok(())
    }

    #[test]
    fn single_broken_file_fails_the_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"not an image")?;
        let args = input_args(&path, false);
        let inputs = resolve_inputs(&args)?;
        assert!(!inputs.bulk);
        let err = scan_headers(inputs, &args).expect_err("single input errors propagate");
        assert!(err.downcast_ref::<CoreError>().is_some());
        Ok(())
    }

    #[test]
    fn single_output_must_be_png() {
        let args = DecodeArgs {
            input: InputArgs {
                input: "photo.jpg".to_string(),
                input_root: None,
                recursive: true,
                strict: false,
                profile: false,
            },
            sampling: sampling(None, None),
            output: Some(PathBuf::from("out.jpg")),
            output_dir: None,
            filter: None,
            crop: false,
        };
        assert!(resolve_output_for_input(&args, false, Path::new("photo.jpg")).is_err());
        let bulk = resolve_output_for_input(&args, true, Path::new("in/photo.jpg")).expect("bulk output");
        assert_eq!(bulk, PathBuf::from("out.jpg").join("photo_sampled.png"));
    }

    #[test]
    fn core_errors_keep_their_code_in_batch_output() {
        let err = anyhow::Error::new(CoreError::Decode("bad header".to_string()));
        let value = error_json(&err);
        assert_eq!(value["code"], "decode-error");
        assert_eq!(value["message"], "bad header");
    }
}
