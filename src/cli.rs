use crate::config::CompilerConfig;
use crate::geometry::Canvas;
use crate::utils::parse_canvas;
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about = "Compile emotion clips into nightlight animations", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// JSON configuration file; command-line flags override its fields
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Compile a clip and timeline into `.anim` and motion-JPEG artifacts
    Compile(CompileArgs),
    /// Extract transparent region overlays (eyes, mouth, artifacts) as PNGs
    Regions(RegionsArgs),
    /// Decode an `.anim` file and print its header
    Inspect(InspectArgs),
    /// Print clip metadata reported by the frame tool
    Probe(SourceArgs),
}

/// Where frames come from
#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Source clip, or a directory of numbered PNG frames
    pub source: PathBuf,

    /// Sample rate of a PNG frame directory
    #[arg(long, value_name = "FPS", default_value_t = 10.0)]
    pub sequence_fps: f64,
}

impl SourceArgs {
    pub fn is_sequence(&self) -> bool {
        self.source.is_dir()
    }
}

#[derive(Args, Debug)]
pub struct CompileArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// Timeline JSON with introTimeline, loopTimeline and exitTimeline
    #[arg(short, long, value_name = "FILE")]
    pub timeline: PathBuf,

    /// Directory the artifacts are written to
    #[arg(short, long, value_name = "DIR")]
    pub out_dir: PathBuf,

    /// Artifact base name (defaults to the timeline file stem)
    #[arg(long)]
    pub id: Option<String>,

    /// Device canvas as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_canvas)]
    pub canvas: Option<Canvas>,

    /// Playback frame rate (defaults to the clip's rate)
    #[arg(short, long)]
    pub fps: Option<f64>,

    /// Which artifacts to write
    #[arg(long, value_enum, default_value = "both")]
    pub format: OutputFormat,

    /// Motion-JPEG quality (1-100)
    #[arg(short, long)]
    pub quality: Option<u8>,

    /// Abort compilation after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

impl CompileArgs {
    /// Artifact base name
    pub fn artifact_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            self.timeline
                .file_stem()
                .and_then(|s| s.to_str())
                .map(|s| s.trim_end_matches(".timeline").to_string())
                .unwrap_or_else(|| "animation".to_string())
        })
    }

    /// Layer flag values over a loaded configuration
    pub fn apply_overrides(&self, config: &mut CompilerConfig) {
        if let Some(canvas) = self.canvas {
            config.canvas_width = canvas.width;
            config.canvas_height = canvas.height;
        }
        if let Some(fps) = self.fps {
            config.playback_fps = Some(fps);
        }
        if let Some(quality) = self.quality {
            config.jpeg_quality = quality;
        }
    }
}

#[derive(Args, Debug)]
pub struct RegionsArgs {
    #[command(flatten)]
    pub source: SourceArgs,

    /// JSON array of regions in source-normalized coordinates
    #[arg(short, long, value_name = "FILE")]
    pub regions: PathBuf,

    /// Directory the PNG overlays are written to
    #[arg(short, long, value_name = "DIR")]
    pub out_dir: PathBuf,

    /// Device canvas as WIDTHxHEIGHT
    #[arg(long, value_parser = parse_canvas)]
    pub canvas: Option<Canvas>,
}

#[derive(Args, Debug)]
pub struct InspectArgs {
    /// `.anim` file to decode
    pub file: PathBuf,

    /// Write every decoded frame to this directory as PNG
    #[arg(long, value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    /// Palette-indexed RLE animation only
    Anim,
    /// Concatenated JPEG frames only
    Mjpeg,
    /// Both artifacts
    Both,
}

impl OutputFormat {
    pub fn writes_anim(self) -> bool {
        matches!(self, Self::Anim | Self::Both)
    }

    pub fn writes_mjpeg(self) -> bool {
        matches!(self, Self::Mjpeg | Self::Both)
    }
}

fn require_file(path: &Path, what: &str) -> Result<(), String> {
    if !path.exists() {
        return Err(format!("{} does not exist: {}", what, path.display()));
    }
    Ok(())
}

fn validate_source(source: &SourceArgs) -> Result<(), String> {
    require_file(&source.source, "Source")?;
    if !source.sequence_fps.is_finite() || source.sequence_fps <= 0.0 {
        return Err("Sequence FPS must be greater than 0".to_string());
    }
    Ok(())
}

impl Cli {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<(), String> {
        if let Some(config) = &self.config {
            require_file(config, "Config file")?;
        }

        match &self.command {
            Command::Compile(args) => {
                validate_source(&args.source)?;
                require_file(&args.timeline, "Timeline file")?;

                if let Some(fps) = args.fps {
                    if !fps.is_finite() || fps <= 0.0 {
                        return Err("FPS must be greater than 0".to_string());
                    }
                }
                if let Some(quality) = args.quality {
                    if !(1..=100).contains(&quality) {
                        return Err("Quality must be between 1 and 100".to_string());
                    }
                }
                if args.timeout == Some(0) {
                    return Err("Timeout must be greater than 0".to_string());
                }
                if args.id.as_deref().is_some_and(|id| id.is_empty() || id.contains(['/', '\\'])) {
                    return Err("Artifact id must be a plain file name".to_string());
                }
            }
            Command::Regions(args) => {
                validate_source(&args.source)?;
                require_file(&args.regions, "Regions file")?;
            }
            Command::Inspect(args) => require_file(&args.file, "Animation file")?,
            Command::Probe(source) => validate_source(source)?,
        }

        Ok(())
    }
}
