use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// CLI configuration: defaults, then an optional TOML file, then `MIRA_*` variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Gallery file.
    pub db_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// SCRFD detector file name inside `model_dir`.
    pub detector_model: String,
    /// ArcFace encoder file name inside `model_dir`.
    pub encoder_model: String,
    /// Length of encodings produced by the encoder model.
    pub encoding_dim: usize,
    /// Minimum detector confidence for a face to be considered.
    pub detection_confidence: f32,
    /// Maximum Euclidean distance for a positive identification.
    pub match_threshold: f32,
    /// Per-frame processing timeout in seconds; 0 disables it.
    pub frame_timeout_secs: u64,
    /// V4L2 device path for camera mode.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Frames to discard after opening the camera (exposure settling).
    pub warmup_frames: usize,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            db_path: data_dir.join("gallery.json"),
            model_dir: data_dir.join("models"),
            detector_model: "det_10g.onnx".to_string(),
            encoder_model: "w600k_r50.onnx".to_string(),
            encoding_dim: 512,
            detection_confidence: mira_core::DEFAULT_DETECTION_CONFIDENCE,
            match_threshold: mira_core::DEFAULT_MATCH_THRESHOLD,
            frame_timeout_secs: 10,
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            warmup_frames: 4,
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// `explicit` must exist when given. Otherwise the default location
    /// (`$XDG_CONFIG_HOME/mira/config.toml`) is read if present.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = config_dir().join("config.toml");
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = toml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply `MIRA_*` overrides. Unparseable values keep the current setting.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MIRA_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("MIRA_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("MIRA_DETECTOR_MODEL") {
            self.detector_model = v;
        }
        if let Some(v) = lookup("MIRA_ENCODER_MODEL") {
            self.encoder_model = v;
        }
        if let Some(v) = lookup("MIRA_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        self.encoding_dim = parsed(&lookup, "MIRA_ENCODING_DIM", self.encoding_dim);
        self.detection_confidence =
            parsed(&lookup, "MIRA_DETECTION_CONFIDENCE", self.detection_confidence);
        self.match_threshold = parsed(&lookup, "MIRA_MATCH_THRESHOLD", self.match_threshold);
        self.frame_timeout_secs = parsed(&lookup, "MIRA_FRAME_TIMEOUT_SECS", self.frame_timeout_secs);
        self.warmup_frames = parsed(&lookup, "MIRA_WARMUP_FRAMES", self.warmup_frames);
    }

    /// Reject settings no run can work with.
    pub fn validate(&self) -> Result<()> {
        if self.encoding_dim == 0 {
            bail!("encoding_dim must be positive");
        }
        if !(0.0..=1.0).contains(&self.detection_confidence) {
            bail!(
                "detection confidence must be within [0, 1], got {}",
                self.detection_confidence
            );
        }
        if !self.match_threshold.is_finite() || self.match_threshold < 0.0 {
            bail!("match threshold must be a non-negative number, got {}", self.match_threshold);
        }
        Ok(())
    }

    pub fn detector_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_model)
    }

    pub fn encoder_model_path(&self) -> PathBuf {
        self.model_dir.join(&self.encoder_model)
    }

    pub fn frame_timeout(&self) -> Option<Duration> {
        (self.frame_timeout_secs > 0).then(|| Duration::from_secs(self.frame_timeout_secs))
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, current: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
                current
            }
        },
        None => current,
    }
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string()))
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".local/share"))
        .join("mira")
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home().join(".config"))
        .join("mira")
}
