mod config;
mod driver;
mod engine;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use mira_core::{ArcfaceEncoder, FrameSettings, GalleryStore, RecognitionPipeline, ScrfdDetector};
use mira_hw::Camera;
use std::io::Write;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mira", version, about = "Face gallery management and recognition")]
struct Cli {
    /// Gallery file (overrides config and MIRA_DB_PATH)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Configuration file
    #[arg(long, global = true, env = "MIRA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll every image under <dir>/<name>/ as identity <name>
    Import { dir: PathBuf },
    /// Enroll the single face in an image under a name
    Add { image: PathBuf, name: String },
    /// List identities and their encoding counts
    List,
    /// Remove every encoding stored for a name
    Remove { name: String },
    /// Remove all entries from the gallery
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },
    /// Recognize faces in an image file
    Image {
        path: PathBuf,
        /// Write a copy of the image with the faces boxed
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        recognition: RecognitionArgs,
    },
    /// Recognize faces from a live camera until Ctrl-C
    Camera {
        /// V4L2 device path (default from config)
        #[arg(short, long)]
        device: Option<String>,
        #[command(flatten)]
        recognition: RecognitionArgs,
    },
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args)]
struct RecognitionArgs {
    /// Minimum detection confidence
    #[arg(short, long)]
    confidence: Option<f32>,
    /// Maximum match distance
    #[arg(short, long)]
    threshold: Option<f32>,
    /// Emit one JSON document per frame
    #[arg(long)]
    json: bool,
}

impl RecognitionArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(c) = self.confidence {
            config.detection_confidence = c;
        }
        if let Some(t) = self.threshold {
            config.match_threshold = t;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("mira=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    match cli.command {
        Commands::Import { dir } => {
            config.validate()?;
            let mut store = open_store(&config)?;
            let (mut detector, mut encoder) = load_models(&config)?;
            let summary = store.import_directory(&dir, &mut detector, &mut encoder)?;
            for (path, reason) in &summary.skipped {
                println!("skipped {}: {reason}", path.display());
            }
            store.save()?;
            println!(
                "Imported {} encoding(s), skipped {} image(s); gallery now holds {}",
                summary.added,
                summary.skipped.len(),
                store.len()
            );
        }
        Commands::Add { image, name } => {
            config.validate()?;
            let mut store = open_store(&config)?;
            let (mut detector, mut encoder) = load_models(&config)?;
            store
                .add_from_path(&image, &name, &mut detector, &mut encoder)
                .with_context(|| format!("enrolling {}", image.display()))?;
            store.save()?;
            println!("Added '{name}' from {}", image.display());
        }
        Commands::List => {
            let store = open_store(&config)?;
            let identities = store.list_entries();
            if identities.is_empty() {
                println!("Gallery is empty ({})", store.path().display());
            }
            for identity in identities {
                println!("{}\t{}", identity.name, identity.count);
            }
        }
        Commands::Remove { name } => {
            let mut store = open_store(&config)?;
            let removed = store.remove_identity(&name);
            if removed == 0 {
                println!("No entries named '{name}'");
            } else {
                store.save()?;
                println!("Removed {removed} encoding(s) for '{name}'");
            }
        }
        Commands::Clear { yes } => {
            let mut store = open_store(&config)?;
            if !yes && !confirm(&format!("Remove all {} entries?", store.len()))? {
                println!("Aborted");
                return Ok(());
            }
            store.clear();
            store.save()?;
            println!("Gallery cleared");
        }
        Commands::Image {
            path,
            output,
            recognition,
        } => {
            recognition.apply(&mut config);
            config.validate()?;
            let engine = start_engine(&config)?;
            driver::run_image(&engine, &path, recognition.json, output.as_deref()).await?;
        }
        Commands::Camera {
            device,
            recognition,
        } => {
            recognition.apply(&mut config);
            config.validate()?;
            let engine = start_engine(&config)?;
            let options = driver::CameraOptions {
                device: device.unwrap_or_else(|| config.camera_device.clone()),
                width: config.camera_width,
                height: config.camera_height,
                warmup_frames: config.warmup_frames,
            };
            driver::run_camera(&engine, options, recognition.json).await?;
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for dev in devices {
                println!("{}\t{} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
        }
    }

    Ok(())
}

fn open_store(config: &Config) -> Result<GalleryStore> {
    let store = GalleryStore::open(&config.db_path, config.encoding_dim)
        .with_context(|| format!("opening gallery {}", config.db_path.display()))?
        .with_enroll_confidence(config.detection_confidence);
    tracing::debug!(path = %config.db_path.display(), entries = store.len(), "gallery opened");
    Ok(store)
}

fn load_models(config: &Config) -> Result<(ScrfdDetector, ArcfaceEncoder)> {
    let detector_path = config.detector_model_path();
    let detector = ScrfdDetector::load(&detector_path)
        .with_context(|| format!("loading detector {}", detector_path.display()))?;
    tracing::info!(path = %detector_path.display(), "SCRFD detector loaded");

    let encoder_path = config.encoder_model_path();
    let encoder = ArcfaceEncoder::load(&encoder_path, config.encoding_dim)
        .with_context(|| format!("loading encoder {}", encoder_path.display()))?;
    tracing::info!(path = %encoder_path.display(), "ArcFace encoder loaded");

    Ok((detector, encoder))
}

fn start_engine(config: &Config) -> Result<engine::EngineHandle> {
    let store = open_store(config)?;
    let (detector, encoder) = load_models(config)?;
    let pipeline = RecognitionPipeline::new(
        Box::new(detector),
        Box::new(encoder),
        FrameSettings {
            detection_confidence_min: config.detection_confidence,
            match_threshold: config.match_threshold,
        },
    );
    let gallery = store.entries().to_vec();
    Ok(engine::spawn_engine(pipeline, gallery, config.frame_timeout())?)
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer)?;
    Ok(is_yes(&answer))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_global_db_after_subcommand() {
        let cli = Cli::try_parse_from(["mira", "list", "--db", "/tmp/g.json"]).unwrap();
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/g.json")));
        assert!(matches!(cli.command, Commands::List));
    }

    #[test]
    fn test_image_flags() {
        let cli = Cli::try_parse_from([
            "mira", "image", "a.png", "-t", "0.4", "--json", "-o", "boxed.png",
        ])
        .unwrap();
        let Commands::Image {
            path,
            output,
            recognition,
        } = cli.command
        else {
            panic!("expected image command");
        };
        assert_eq!(path, PathBuf::from("a.png"));
        assert_eq!(output, Some(PathBuf::from("boxed.png")));
        assert_eq!(recognition.threshold, Some(0.4));
        assert!(recognition.json);

        let mut config = Config::default();
        recognition.apply(&mut config);
        assert_eq!(config.match_threshold, 0.4);
        assert_eq!(config.detection_confidence, 0.5);
    }

    #[test]
    fn test_is_yes() {
        assert!(is_yes("y\n"));
        assert!(is_yes(" YES "));
        assert!(!is_yes("\n"));
        assert!(!is_yes("nope"));
    }
}
