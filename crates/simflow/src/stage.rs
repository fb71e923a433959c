//! Directory stage machine.
//!
//! ```text
//! incoming/<day>/results_R1.csv ──clean──▶ processed/<day>/results_R1.csv ──load──▶ ingested/<day>/
//!                │
//!                └──────────move──────────▶ archive/<day>/results_R1.csv
//!
//! incoming/<day>/metadata_R1.json ─────────────────────────────────insert──▶ ingested/<day>/
//! ```
//!
//! Every transition is a rename. A file is never copied between stages, so it
//! sits in exactly one stage directory at any time.

use crate::clean::clean_csv;
use crate::contract::ColumnMapping;
use crate::error::{IngestError, Result};
use crate::run_id::{FileKind, RunId};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Position of a file in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Incoming,
    Processed,
    Archive,
    Ingested,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Incoming,
        Stage::Processed,
        Stage::Archive,
        Stage::Ingested,
    ];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Incoming => "incoming",
            Stage::Processed => "processed",
            Stage::Archive => "archive",
            Stage::Ingested => "ingested",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A pipeline file on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StagedFile {
    pub path: PathBuf,
    /// Name of the day directory the file sits in.
    pub day: String,
    pub run_id: RunId,
    pub kind: FileKind,
    pub stage: Stage,
}

impl StagedFile {
    /// Describe a file already sitting in `stage`.
    pub fn from_path(path: &Path, stage: Stage) -> Result<Self> {
        let (kind, run_id) = RunId::from_path(path)?;
        let day = path
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| IngestError::Cleaning {
                path: path.to_path_buf(),
                reason: "file is not inside a day directory".to_string(),
            })?;
        Ok(Self {
            path: path.to_path_buf(),
            day,
            run_id,
            kind,
            stage,
        })
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Raw files found in one `incoming/<day>` directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawGroup {
    pub day: String,
    pub files: Vec<PathBuf>,
}

/// A file that did not make it through a step, kept for the batch report.
#[derive(Debug, Clone, Serialize)]
pub struct FileFailure {
    pub path: PathBuf,
    pub run_id: Option<RunId>,
    pub kind: &'static str,
    pub error: String,
}

impl FileFailure {
    pub fn new(path: &Path, run_id: Option<RunId>, err: &IngestError) -> Self {
        Self {
            path: path.to_path_buf(),
            run_id,
            kind: err.kind(),
            error: err.to_string(),
        }
    }
}

/// Outcome of [`StageManager::clean_incoming`].
#[derive(Debug, Default)]
pub struct CleanSummary {
    pub cleaned: Vec<StagedFile>,
    pub failed: Vec<FileFailure>,
}

/// Owns the stage directories under one run root.
#[derive(Debug, Clone)]
pub struct StageManager {
    root: PathBuf,
    mapping: ColumnMapping,
}

impl StageManager {
    pub fn new(root: impl Into<PathBuf>, mapping: ColumnMapping) -> Self {
        Self {
            root: root.into(),
            mapping,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    pub fn day_dir(&self, stage: Stage, day: &str) -> PathBuf {
        self.stage_dir(stage).join(day)
    }

    /// One group per `incoming/<day>` directory, files sorted by name.
    pub fn discover_incoming(&self) -> Result<Vec<RawGroup>> {
        let incoming = self.stage_dir(Stage::Incoming);
        ensure_dir(&incoming)?;

        let mut groups = Vec::new();
        for day_dir in sorted_subdirs(&incoming)? {
            let day = day_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let files = sorted_files(&day_dir, |path| FileKind::from_path(path).is_some())?;
            debug!(day = %day, files = files.len(), "Discovered incoming day");
            groups.push(RawGroup { day, files });
        }
        Ok(groups)
    }

    /// Clean one raw CSV into `processed/<day>/`, then archive the original.
    ///
    /// The original is moved only after the cleaned file is fully written. On
    /// any error it is left in `incoming`.
    pub fn clean_and_archive(&self, raw: &Path) -> Result<StagedFile> {
        let source = StagedFile::from_path(raw, Stage::Incoming)?;
        if source.kind != FileKind::FactCsv {
            return Err(IngestError::Cleaning {
                path: raw.to_path_buf(),
                reason: "only fact CSVs are cleaned".to_string(),
            });
        }

        let processed_dir = self.day_dir(Stage::Processed, &source.day);
        let archive_dir = self.day_dir(Stage::Archive, &source.day);
        ensure_dir(&processed_dir)?;
        ensure_dir(&archive_dir)?;

        let file_name = source.file_name();
        let archive_path = archive_dir.join(&file_name);
        if archive_path.exists() {
            return Err(IngestError::io(
                &archive_path,
                std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "archived original already exists",
                ),
            ));
        }

        let cleaned = clean_csv(raw, &processed_dir.join(&file_name), &self.mapping)?;
        info!(
            file = %file_name,
            run_id = %source.run_id,
            rows = cleaned.rows,
            "Cleaned and written to {}",
            processed_dir.display()
        );

        // A cleaned file without its archived original must not be loaded.
        if let Err(err) = move_file(raw, &archive_path) {
            if let Err(e) = fs::remove_file(&cleaned.path) {
                warn!(
                    file = %file_name,
                    "Failed to remove {} after archive failure: {}",
                    cleaned.path.display(),
                    e
                );
            }
            return Err(err);
        }
        info!(file = %file_name, "Moved original to {}", archive_dir.display());

        Ok(StagedFile {
            path: cleaned.path,
            stage: Stage::Processed,
            ..source
        })
    }

    /// Clean every incoming CSV. Failures are logged and collected, never fatal.
    pub fn clean_incoming(&self) -> Result<CleanSummary> {
        info!("Starting CSV processing");
        let mut summary = CleanSummary::default();

        for group in self.discover_incoming()? {
            for raw in group
                .files
                .iter()
                .filter(|p| FileKind::from_path(p) == Some(FileKind::FactCsv))
            {
                match self.clean_and_archive(raw) {
                    Ok(staged) => summary.cleaned.push(staged),
                    Err(err) => {
                        let run_id = RunId::from_path(raw).ok().map(|(_, id)| id);
                        error!(
                            file = %raw.display(),
                            run_id = ?run_id.as_ref().map(RunId::as_str),
                            "Cleaning failed: {}",
                            err
                        );
                        summary.failed.push(FileFailure::new(raw, run_id, &err));
                    }
                }
            }
        }

        info!(
            cleaned = summary.cleaned.len(),
            failed = summary.failed.len(),
            "Finished CSV processing"
        );
        Ok(summary)
    }

    /// Cleaned fact files waiting to be loaded.
    pub fn list_processed_uningested(&self) -> Result<Vec<StagedFile>> {
        self.list_stage(Stage::Processed, FileKind::FactCsv)
    }

    /// Metadata files waiting in incoming. They skip the processed stage.
    pub fn list_incoming_metadata(&self) -> Result<Vec<StagedFile>> {
        self.list_stage(Stage::Incoming, FileKind::MetadataJson)
    }

    fn list_stage(&self, stage: Stage, kind: FileKind) -> Result<Vec<StagedFile>> {
        let stage_dir = self.stage_dir(stage);
        ensure_dir(&stage_dir)?;

        let mut out = Vec::new();
        for day_dir in sorted_subdirs(&stage_dir)? {
            for path in sorted_files(&day_dir, |p| FileKind::from_path(p) == Some(kind))? {
                match StagedFile::from_path(&path, stage) {
                    Ok(file) => out.push(file),
                    Err(err) => warn!(file = %path.display(), "Skipping file: {}", err),
                }
            }
        }
        Ok(out)
    }

    /// Move a loaded file into `ingested/<day>/`, the terminal stage.
    ///
    /// Promoting a file that is no longer where `file` says it is, or whose
    /// destination already exists, is an error.
    pub fn promote_to_ingested(&self, file: &StagedFile) -> Result<StagedFile> {
        let allowed = match file.kind {
            FileKind::FactCsv => file.stage == Stage::Processed,
            FileKind::MetadataJson => file.stage == Stage::Incoming,
        };
        if !allowed {
            return Err(IngestError::Promotion {
                path: file.path.clone(),
                reason: format!("{} files cannot be promoted from {}", file.kind, file.stage),
            });
        }

        let target_dir = self.day_dir(Stage::Ingested, &file.day);
        ensure_dir(&target_dir)?;
        let target = target_dir.join(file.file_name());

        move_file(&file.path, &target).map_err(|err| IngestError::Promotion {
            path: file.path.clone(),
            reason: err.to_string(),
        })?;
        info!(file = %file.file_name(), run_id = %file.run_id, "Moved to {}", target_dir.display());

        Ok(StagedFile {
            path: target,
            stage: Stage::Ingested,
            ..file.clone()
        })
    }
}

/// Rename `src` to `dest`, refusing to overwrite and never falling back to a copy.
fn move_file(src: &Path, dest: &Path) -> Result<()> {
    if !src.exists() {
        return Err(IngestError::io(
            src,
            std::io::Error::new(std::io::ErrorKind::NotFound, "source no longer exists"),
        ));
    }
    if dest.exists() {
        return Err(IngestError::io(
            dest,
            std::io::Error::new(std::io::ErrorKind::AlreadyExists, "destination already exists"),
        ));
    }
    fs::rename(src, dest).map_err(|e| IngestError::io(src, e))
}

/// Create `dir` if needed and widen its permissions so other accounts can
/// drop files in. Widening is best effort.
fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.is_dir() {
        return Ok(());
    }
    fs::create_dir_all(dir).map_err(|e| IngestError::io(dir, e))?;
    widen_permissions(dir);
    Ok(())
}

#[cfg(unix)]
fn widen_permissions(dir: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = fs::set_permissions(dir, fs::Permissions::from_mode(0o777)) {
        warn!("Could not chmod {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn widen_permissions(_dir: &Path) {}

fn sorted_subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))? {
        let entry = entry.map_err(|e| IngestError::io(dir, e))?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

fn sorted_files(dir: &Path, keep: impl Fn(&Path) -> bool) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| IngestError::io(dir, e))? {
        let entry = entry.map_err(|e| IngestError::io(dir, e))?;
        let path = entry.path();
        let hidden = path
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(true);
        if path.is_file() && !hidden && keep(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
