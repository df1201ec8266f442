use emotion_compiler::anim::{decode_animation, encode_animation};
use emotion_compiler::cli::{Cli, Command, CompileArgs, InspectArgs, OutputFormat, RegionsArgs, SourceArgs};
use emotion_compiler::compiler::{compile_timeline, CompiledAnimation};
use emotion_compiler::config::CompilerConfig;
use emotion_compiler::mjpeg::{package_mjpeg, MjpegPackage};
use emotion_compiler::regions::{extract_regions, Region};
#[cfg(not(feature = "ffmpeg-lib"))]
use emotion_compiler::source::FfmpegCliSource;
use emotion_compiler::source::{FrameSource, ImageSequenceSource, RetryingSource};
use emotion_compiler::timeline::Timeline;
use emotion_compiler::utils::format_duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

/// Everything one compile run produces before it touches the filesystem
struct Artifacts {
    compiled: CompiledAnimation,
    anim: Option<Vec<u8>>,
    mjpeg: Option<MjpegPackage>,
}

/// Pick the frame source for a path: PNG directory, or a clip behind the frame tool
fn open_source(args: &SourceArgs, config: &CompilerConfig) -> Result<Box<dyn FrameSource>> {
    if args.is_sequence() {
        let source = ImageSequenceSource::open(&args.source, args.sequence_fps)
            .with_context(|| format!("Failed to open frame directory '{}'", args.source.display()))?;
        info!("Using {} PNG frames from '{}'", source.len(), args.source.display());
        return Ok(Box::new(source));
    }

    #[cfg(feature = "ffmpeg-lib")]
    let source = emotion_compiler::decoder::LibavSource::new(&args.source);

    #[cfg(not(feature = "ffmpeg-lib"))]
    let source = FfmpegCliSource::new(&args.source).with_binaries(&config.ffmpeg_bin, &config.ffprobe_bin);

    Ok(Box::new(RetryingSource::new(source, config.extract_retries)))
}

fn load_config(cli: &Cli) -> Result<CompilerConfig> {
    match &cli.config {
        Some(path) => CompilerConfig::load(path).with_context(|| format!("Failed to load config '{}'", path.display())),
        None => Ok(CompilerConfig::default()),
    }
}

fn build_artifacts(
    timeline: &Timeline,
    source: &dyn FrameSource,
    config: &CompilerConfig,
    format: OutputFormat,
) -> emotion_compiler::Result<Artifacts> {
    let compiled = compile_timeline(timeline, source, config)?;
    let rasters = compiled.rasters();

    let anim = if format.writes_anim() {
        Some(encode_animation(&rasters, compiled.canvas)?)
    } else {
        None
    };
    let mjpeg = if format.writes_mjpeg() {
        Some(package_mjpeg(&rasters, config.jpeg_quality)?)
    } else {
        None
    };

    Ok(Artifacts { compiled, anim, mjpeg })
}

async fn run_compile(args: CompileArgs, mut config: CompilerConfig) -> Result<()> {
    args.apply_overrides(&mut config);
    config.validate().context("Invalid configuration")?;

    let json = fs::read_to_string(&args.timeline)
        .with_context(|| format!("Failed to read timeline '{}'", args.timeline.display()))?;
    let timeline = Timeline::from_json(&json)
        .with_context(|| format!("Failed to parse timeline '{}'", args.timeline.display()))?;

    let id = args.artifact_id();
    let format = args.format;
    let source = open_source(&args.source, &config)?;

    info!("Compiling '{}' from '{}'", id, args.source.source.display());
    let started = Instant::now();
    let task = tokio::task::spawn_blocking(move || build_artifacts(&timeline, source.as_ref(), &config, format));

    let artifacts = match args.timeout {
        Some(secs) => tokio::time::timeout(Duration::from_secs(secs), task)
            .await
            .map_err(|_| anyhow!("Compilation timed out after {}s", secs))??,
        None => task.await?,
    }
    .context("Compilation failed")?;

    debug!("Compilation took {:.2?}", started.elapsed());

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create output directory '{}'", args.out_dir.display()))?;

    let mut anim_bytes = None;
    if let Some(bytes) = &artifacts.anim {
        let path = args.out_dir.join(format!("{}.anim", id));
        fs::write(&path, bytes).with_context(|| format!("Failed to write '{}'", path.display()))?;
        info!("Wrote {} ({} bytes)", path.display(), bytes.len());
        anim_bytes = Some(bytes.len());
    }

    let mut mjpeg_bytes = None;
    if let Some(package) = &artifacts.mjpeg {
        let path = args.out_dir.join(format!("{}.mjpeg", id));
        fs::write(&path, &package.bytes).with_context(|| format!("Failed to write '{}'", path.display()))?;
        info!("Wrote {} ({} frames, {} bytes)", path.display(), package.frame_count(), package.bytes.len());
        mjpeg_bytes = Some(package.bytes.len());
    }

    let compiled = &artifacts.compiled;
    let manifest = compiled.manifest(anim_bytes, mjpeg_bytes);
    let manifest_path = args.out_dir.join(format!("{}.manifest.json", id));
    fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?)
        .with_context(|| format!("Failed to write '{}'", manifest_path.display()))?;

    if let Some(warning) = compiled.budget_warning() {
        warn!("{}", warning);
    }

    println!("Compiled {}:", id);
    println!("  Canvas: {}x{}", compiled.canvas.width, compiled.canvas.height);
    println!("  Frames: {}", compiled.summary.total_frames);
    println!("  Duration: {} at {:.2} FPS", format_duration(compiled.summary.duration_seconds), compiled.fps);
    println!("  Output: {}", args.out_dir.display());
    Ok(())
}

fn run_regions(args: RegionsArgs, mut config: CompilerConfig) -> Result<()> {
    if let Some(canvas) = args.canvas {
        config.canvas_width = canvas.width;
        config.canvas_height = canvas.height;
    }

    let json = fs::read_to_string(&args.regions)
        .with_context(|| format!("Failed to read regions '{}'", args.regions.display()))?;
    let regions: Vec<Region> = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse regions '{}'", args.regions.display()))?;

    let source = open_source(&args.source, &config)?;
    let artifacts = extract_regions(source.as_ref(), &regions, &config).context("Region extraction failed")?;

    fs::create_dir_all(&args.out_dir)
        .with_context(|| format!("Failed to create output directory '{}'", args.out_dir.display()))?;

    for artifact in &artifacts {
        let path = args.out_dir.join(format!("{}_{}.png", artifact.key, artifact.frame_index));
        fs::write(&path, artifact.to_png()?).with_context(|| format!("Failed to write '{}'", path.display()))?;
        println!(
            "{} (frame {}): x={:.4} y={:.4} w={:.4} h={:.4} -> {}",
            artifact.key,
            artifact.frame_index,
            artifact.canvas_rect.x,
            artifact.canvas_rect.y,
            artifact.canvas_rect.w,
            artifact.canvas_rect.h,
            path.display()
        );
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let bytes = fs::read(&args.file).with_context(|| format!("Failed to read '{}'", args.file.display()))?;
    let decoded = decode_animation(&bytes).with_context(|| format!("Malformed animation '{}'", args.file.display()))?;
    let header = &decoded.header;

    println!("Animation Information:");
    println!("  File: {}", args.file.display());
    println!("  Version: {}", header.version);
    println!("  Frames: {}", header.frame_count);
    println!("  Dimensions: {}x{}", header.width, header.height);
    println!("  Palette: {} colors", header.palette_size);
    println!("  Size: {} bytes", bytes.len());

    if let Some(dir) = &args.dump_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create '{}'", dir.display()))?;
        for (i, frame) in decoded.frames.iter().enumerate() {
            let path = dir.join(format!("frame_{:04}.png", i));
            frame.save(&path).with_context(|| format!("Failed to write '{}'", path.display()))?;
        }
        info!("Dumped {} frames to {}", decoded.frames.len(), dir.display());
    }
    Ok(())
}

fn run_probe(args: SourceArgs, config: CompilerConfig) -> Result<()> {
    let source = open_source(&args, &config)?;
    let meta = source.probe_metadata().context("Probe failed")?;

    println!("Clip Information:");
    println!("  File: {}", args.source.display());
    println!("  Dimensions: {}x{}", meta.width, meta.height);
    println!("  Frame Rate: {:.2} FPS", meta.fps);
    println!("  Duration: {}", format_duration(meta.duration_seconds));
    match meta.frame_count() {
        Some(count) => println!("  Frames: {}", count),
        None => println!("  Frames: unknown"),
    }
    Ok(())
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|name| name.to_str()).unwrap_or("unknown")
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    // Validate CLI arguments
    if let Err(e) = cli.validate() {
        error!("Invalid arguments: {}", e);
        std::process::exit(1);
    }

    info!("Starting Emotion Compiler v{}", emotion_compiler::VERSION);
    let config = load_config(&cli)?;

    match cli.command {
        Command::Compile(args) => {
            info!("Timeline: {}", file_name(&args.timeline));
            run_compile(args, config).await
        }
        Command::Regions(args) => run_regions(args, config),
        Command::Inspect(args) => run_inspect(args),
        Command::Probe(args) => run_probe(args, config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_fallback() {
        assert_eq!(file_name(Path::new("dir/happy.json")), "happy.json");
        assert_eq!(file_name(Path::new("/")), "unknown");
    }
}
