//! Persisted gallery of named face encodings.
//!
//! The gallery lives in memory between an explicit [`GalleryStore::open`] and
//! [`GalleryStore::save`]; mutations are never flushed implicitly. On disk it
//! is one JSON document, replaced atomically on every save.

use crate::pipeline::{crop_face, DetectError, Detector, EncodeError, Encoder};
use crate::types::Encoding;
use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const GALLERY_FORMAT: &str = "mira-gallery";
const GALLERY_VERSION: u32 = 1;
const DEFAULT_ENROLL_CONFIDENCE: f32 = 0.5;

/// File extensions considered during directory import (compared case-insensitively).
pub const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery file {path} is corrupt: {reason}")]
    StoreCorrupt { path: PathBuf, reason: String },
    #[error("failed to write gallery to {path}: {source}")]
    StoreWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid encoding: expected {expected} values, got {actual}")]
    InvalidEncoding { expected: usize, actual: usize },
    #[error("encoding contains non-finite values")]
    NonFiniteEncoding,
    #[error("identity name must not be empty")]
    EmptyName,
    #[error("no face found")]
    NoFaceFound,
    #[error("{0} faces found; enrollment images must contain exactly one")]
    MultipleFaces(usize),
    #[error("cannot read image {path}: {reason}")]
    UnreadableImage { path: PathBuf, reason: String },
    #[error("detector rejected the image: {0}")]
    InvalidImage(String),
    #[error("face could not be encoded: {0}")]
    NoEncoding(String),
    #[error("gallery holds {stored}-dimensional encodings but the encoder produces {expected}")]
    DimensionMismatch { stored: usize, expected: usize },
    #[error("directory not found: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("face model failed: {0}")]
    Collaborator(String),
}

impl GalleryError {
    /// Per-image failures that a batch import records instead of aborting on.
    fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            GalleryError::NoFaceFound => Some(SkipReason::NoFaceFound),
            GalleryError::MultipleFaces(n) => Some(SkipReason::MultipleFaces(*n)),
            GalleryError::UnreadableImage { reason, .. } | GalleryError::InvalidImage(reason) => {
                Some(SkipReason::Unreadable(reason.clone()))
            }
            GalleryError::NoEncoding(reason) => Some(SkipReason::NoEncoding(reason.clone())),
            GalleryError::NonFiniteEncoding => {
                Some(SkipReason::NoEncoding("non-finite values".to_string()))
            }
            GalleryError::EmptyName => Some(SkipReason::EmptyName),
            _ => None,
        }
    }
}

impl From<DetectError> for GalleryError {
    fn from(e: DetectError) -> Self {
        match e {
            DetectError::InvalidImage(reason) => GalleryError::InvalidImage(reason),
            failed @ DetectError::Failed(_) => GalleryError::Collaborator(failed.to_string()),
        }
    }
}

/// One enrolled encoding under an identity name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GalleryEntry {
    pub name: String,
    pub encoding: Encoding,
    /// Image the encoding was enrolled from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enrolled_at: Option<DateTime<Utc>>,
}

impl GalleryEntry {
    pub fn new(name: impl Into<String>, encoding: Encoding) -> Self {
        Self {
            name: name.into(),
            encoding,
            source: None,
            enrolled_at: None,
        }
    }
}

/// Entry count for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentitySummary {
    pub name: String,
    pub count: usize,
}

/// Why a single image was left out of a directory import.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    NoFaceFound,
    MultipleFaces(usize),
    Unreadable(String),
    NoEncoding(String),
    /// The identity directory name is blank.
    EmptyName,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::NoFaceFound => write!(f, "no face found"),
            SkipReason::MultipleFaces(n) => write!(f, "{n} faces found"),
            SkipReason::Unreadable(reason) => write!(f, "unreadable: {reason}"),
            SkipReason::NoEncoding(reason) => write!(f, "no encoding: {reason}"),
            SkipReason::EmptyName => write!(f, "blank identity name"),
        }
    }
}

/// Outcome of [`GalleryStore::import_directory`].
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ImportSummary {
    pub added: usize,
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

/// On-disk layout.
#[derive(Serialize, Deserialize)]
struct GalleryFile {
    format: String,
    version: u32,
    dimension: usize,
    entries: Vec<GalleryEntry>,
}

/// A gallery bound to its backing file.
///
/// Single owner: callers sharing a store across threads must lock around it.
#[derive(Debug)]
pub struct GalleryStore {
    path: PathBuf,
    dimension: usize,
    entries: Vec<GalleryEntry>,
    enroll_confidence: f32,
}

impl GalleryStore {
    /// Load the gallery at `path`, or start empty when no file exists yet.
    ///
    /// `dimension` is the encoding length of the configured encoder; a stored
    /// gallery built with another model is rejected.
    pub fn open(path: impl Into<PathBuf>, dimension: usize) -> Result<Self, GalleryError> {
        let path = path.into();

        let entries = match read_gallery_file(&path)? {
            None => {
                tracing::info!(path = %path.display(), "no gallery file; starting empty");
                Vec::new()
            }
            Some(file) => {
                if !file.entries.is_empty() && file.dimension != dimension {
                    return Err(GalleryError::DimensionMismatch {
                        stored: file.dimension,
                        expected: dimension,
                    });
                }
                tracing::info!(
                    path = %path.display(),
                    entries = file.entries.len(),
                    "loaded gallery"
                );
                file.entries
            }
        };

        Ok(Self {
            path,
            dimension,
            entries,
            enroll_confidence: DEFAULT_ENROLL_CONFIDENCE,
        })
    }

    /// Minimum detector confidence used when enrolling from images.
    pub fn with_enroll_confidence(mut self, confidence: f32) -> Self {
        self.enroll_confidence = confidence;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Persist the full gallery to its backing file.
    pub fn save(&self) -> Result<(), GalleryError> {
        self.save_to(&self.path)
    }

    /// Persist the full gallery to `path`.
    ///
    /// Writes a sibling temp file and renames it over the target, so a crash
    /// leaves either the old file or the new one.
    pub fn save_to(&self, path: &Path) -> Result<(), GalleryError> {
        let file = GalleryFile {
            format: GALLERY_FORMAT.to_string(),
            version: GALLERY_VERSION,
            dimension: self.dimension,
            entries: self.entries.clone(),
        };
        write_gallery_file(path, &file)?;
        tracing::info!(path = %path.display(), entries = self.entries.len(), "saved gallery");
        Ok(())
    }

    /// Append one entry.
    pub fn add_entry(&mut self, name: &str, encoding: Encoding) -> Result<(), GalleryError> {
        self.push_entry(name, encoding, None)
    }

    fn push_entry(
        &mut self,
        name: &str,
        encoding: Encoding,
        source: Option<PathBuf>,
    ) -> Result<(), GalleryError> {
        if name.trim().is_empty() {
            return Err(GalleryError::EmptyName);
        }
        if encoding.len() != self.dimension {
            return Err(GalleryError::InvalidEncoding {
                expected: self.dimension,
                actual: encoding.len(),
            });
        }
        if !encoding.is_finite() {
            return Err(GalleryError::NonFiniteEncoding);
        }

        self.entries.push(GalleryEntry {
            name: name.to_string(),
            encoding,
            source,
            enrolled_at: Some(Utc::now()),
        });
        Ok(())
    }

    /// Enroll the single face in `image` under `name`.
    pub fn add_from_image(
        &mut self,
        image: &RgbImage,
        name: &str,
        detector: &mut dyn Detector,
        encoder: &mut dyn Encoder,
    ) -> Result<(), GalleryError> {
        self.enroll(image, name, None, detector, encoder)
    }

    /// Decode the image file at `path` and enroll its single face under `name`.
    pub fn add_from_path(
        &mut self,
        path: &Path,
        name: &str,
        detector: &mut dyn Detector,
        encoder: &mut dyn Encoder,
    ) -> Result<(), GalleryError> {
        let image = image::open(path)
            .map_err(|e| GalleryError::UnreadableImage {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?
            .to_rgb8();
        self.enroll(&image, name, Some(path.to_path_buf()), detector, encoder)
    }

    fn enroll(
        &mut self,
        image: &RgbImage,
        name: &str,
        source: Option<PathBuf>,
        detector: &mut dyn Detector,
        encoder: &mut dyn Encoder,
    ) -> Result<(), GalleryError> {
        if name.trim().is_empty() {
            return Err(GalleryError::EmptyName);
        }

        let detections = detector.detect(image, self.enroll_confidence)?;
        let mut faces: Vec<_> = detections
            .iter()
            .filter_map(|d| crop_face(image, &d.bbox))
            .collect();

        let (crop, _) = match faces.len() {
            0 => return Err(GalleryError::NoFaceFound),
            1 => faces.remove(0),
            n => return Err(GalleryError::MultipleFaces(n)),
        };

        let encoding = encoder.encode(&crop).map_err(|e| match e {
            EncodeError::Rejected(reason) => GalleryError::NoEncoding(reason),
            EncodeError::Failed(reason) => GalleryError::Collaborator(reason),
        })?;
        // A wrong length means the model itself is misconfigured.
        if encoding.len() != self.dimension {
            return Err(GalleryError::DimensionMismatch {
                stored: self.dimension,
                expected: encoding.len(),
            });
        }

        self.push_entry(name, encoding, source)?;
        tracing::debug!(name, entries = self.entries.len(), "enrolled face");
        Ok(())
    }

    /// Enroll every image under `root/<name>/`, using each subdirectory name as the identity.
    ///
    /// Per-image failures and blank-named directories are collected in the
    /// summary. Model failures (a `Failed` collaborator or an encoding of the
    /// wrong length) and a missing `root` abort the import; entries added
    /// before that stay in memory.
    pub fn import_directory(
        &mut self,
        root: &Path,
        detector: &mut dyn Detector,
        encoder: &mut dyn Encoder,
    ) -> Result<ImportSummary, GalleryError> {
        if !root.is_dir() {
            return Err(GalleryError::DirectoryNotFound(root.to_path_buf()));
        }

        let mut summary = ImportSummary::default();

        for person_dir in sorted_children(root)?.into_iter().filter(|p| p.is_dir()) {
            let Some(name) = person_dir.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            if name.trim().is_empty() {
                tracing::warn!(path = %person_dir.display(), "skipping directory with a blank name");
                summary.skipped.push((person_dir, SkipReason::EmptyName));
                continue;
            }
            tracing::info!(name = %name, "importing identity");

            let images = match sorted_children(&person_dir) {
                Ok(children) => children.into_iter().filter(|p| is_image_file(p)),
                Err(e) => {
                    tracing::warn!(path = %person_dir.display(), error = %e, "skipping unreadable directory");
                    summary.skipped.push((person_dir, SkipReason::Unreadable(e.to_string())));
                    continue;
                }
            };

            for image_path in images {
                match self.add_from_path(&image_path, &name, detector, encoder) {
                    Ok(()) => summary.added += 1,
                    Err(e) => match e.skip_reason() {
                        Some(reason) => {
                            tracing::warn!(path = %image_path.display(), %reason, "skipping image");
                            summary.skipped.push((image_path, reason));
                        }
                        None => return Err(e),
                    },
                }
            }
        }

        tracing::info!(
            added = summary.added,
            skipped = summary.skipped.len(),
            "import complete"
        );
        Ok(summary)
    }

    /// Identities with their entry counts, in lexical name order.
    pub fn list_entries(&self) -> Vec<IdentitySummary> {
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.name.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .map(|(name, count)| IdentitySummary { name: name.to_string(), count })
            .collect()
    }

    /// Drop every entry enrolled under `name`; returns how many were removed.
    pub fn remove_identity(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        before - self.entries.len()
    }

    /// Empty the in-memory gallery. The file is untouched until [`save`](Self::save).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

fn is_image_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| IMAGE_EXTENSIONS.iter().any(|ext| e.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
}

fn sorted_children(dir: &Path) -> Result<Vec<PathBuf>, GalleryError> {
    let io_err = |source: std::io::Error| GalleryError::Io { path: dir.to_path_buf(), source };
    let mut children = std::fs::read_dir(dir)
        .map_err(io_err)?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_err)?;
    children.sort();
    Ok(children)
}

fn read_gallery_file(path: &Path) -> Result<Option<GalleryFile>, GalleryError> {
    let corrupt = |reason: String| GalleryError::StoreCorrupt { path: path.to_path_buf(), reason };

    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(GalleryError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let file: GalleryFile = serde_json::from_slice(&bytes).map_err(|e| corrupt(e.to_string()))?;

    if file.format != GALLERY_FORMAT {
        return Err(corrupt(format!("unexpected format tag {:?}", file.format)));
    }
    if file.version != GALLERY_VERSION {
        return Err(corrupt(format!("unsupported version {}", file.version)));
    }
    for (i, entry) in file.entries.iter().enumerate() {
        if entry.name.trim().is_empty() {
            return Err(corrupt(format!("entry {i} has an empty name")));
        }
        if entry.encoding.len() != file.dimension {
            return Err(corrupt(format!(
                "entry {i} has {} values, header says {}",
                entry.encoding.len(),
                file.dimension
            )));
        }
        if !entry.encoding.is_finite() {
            return Err(corrupt(format!("entry {i} holds non-finite values")));
        }
    }

    Ok(Some(file))
}

fn write_gallery_file(path: &Path, file: &GalleryFile) -> Result<(), GalleryError> {
    let write_err = |source: std::io::Error| GalleryError::StoreWrite { path: path.to_path_buf(), source };

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        serde_json::to_writer(&mut writer, file).map_err(|e| write_err(e.into()))?;
        writer.flush().map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}
