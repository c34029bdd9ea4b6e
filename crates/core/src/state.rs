//! Per-repository state directory and crash-safe record persistence.
//!
//! Every repository gets a private directory under the state base
//! (`<data_local_dir>/gitward/repos/<key>/`), where `<key>` is derived from
//! the canonical repository root so that two repositories never share a
//! session record or snapshot index.
//!
//! Records are written as a checksummed JSON envelope via
//! write-temp-then-rename: a reader sees either the previous record or the
//! new one, never a torn write.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::errors::{ConfigError, StateError};

/// Envelope format version written by this build.
const RECORD_VERSION: u32 = 1;

const SESSION_FILE: &str = "session.json";
const SNAPSHOT_INDEX_FILE: &str = "snapshots.json";

// ---------------------------------------------------------------------------
// StatePaths
// ---------------------------------------------------------------------------

/// Resolved locations of one repository's persisted state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePaths {
    dir: PathBuf,
}

impl StatePaths {
    /// State paths for `repo_root`, under `base` or the platform default.
    pub fn for_repo(base: Option<&Path>, repo_root: &Path) -> Result<Self, ConfigError> {
        let base = match base {
            Some(b) => b.to_path_buf(),
            None => default_state_base()?,
        };
        let dir = base.join("repos").join(repo_key(repo_root));
        Ok(Self { dir })
    }

    /// Use an explicit directory as-is. Mainly for tests.
    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn session_file(&self) -> PathBuf {
        self.dir.join(SESSION_FILE)
    }

    pub fn snapshot_index(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_INDEX_FILE)
    }

    pub fn ensure_dir(&self) -> Result<(), StateError> {
        fs::create_dir_all(&self.dir)?;
        Ok(())
    }
}

/// `<data_local_dir>/gitward`.
pub fn default_state_base() -> Result<PathBuf, ConfigError> {
    dirs::data_local_dir()
        .map(|d| d.join("gitward"))
        .ok_or(ConfigError::NoPlatformDir("data"))
}

/// Stable directory key for a repository root.
///
/// The root is canonicalized when possible so `./repo` and `/abs/repo`
/// map to the same key.
pub fn repo_key(repo_root: &Path) -> String {
    let canonical = repo_root
        .canonicalize()
        .unwrap_or_else(|_| repo_root.to_path_buf());
    let digest = Sha256::digest(canonical.to_string_lossy().as_bytes());
    hex::encode(digest)[..16].to_string()
}

// ---------------------------------------------------------------------------
// Atomic writes
// ---------------------------------------------------------------------------

/// Write `data` to `path` atomically.
///
/// The temp file is created next to the target so the final rename never
/// crosses a filesystem boundary, and is fsynced before it is renamed.
pub fn atomic_write(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Checksummed records
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    version: u32,
    checksum: String,
    payload: serde_json::Value,
}

fn checksum(payload: &serde_json::Value) -> Result<String, serde_json::Error> {
    // `Value` objects serialize with sorted keys, so the bytes are canonical.
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Serialize `record` into a checksummed envelope and write it atomically.
pub fn write_record<T: Serialize>(path: &Path, record: &T) -> Result<(), StateError> {
    let corrupted = |detail: String| StateError::Corrupted {
        path: path.to_path_buf(),
        detail,
    };
    let payload = serde_json::to_value(record).map_err(|e| corrupted(e.to_string()))?;
    let envelope = Envelope {
        version: RECORD_VERSION,
        checksum: checksum(&payload).map_err(|e| corrupted(e.to_string()))?,
        payload,
    };
    let bytes = serde_json::to_vec_pretty(&envelope).map_err(|e| corrupted(e.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    atomic_write(path, &bytes)?;
    debug!(path = %path.display(), bytes = bytes.len(), "state record written");
    Ok(())
}

/// Read a record written by [`write_record`].
///
/// Returns `Ok(None)` when the file does not exist. Any parse failure,
/// version mismatch or checksum mismatch is reported as
/// [`StateError::Corrupted`] carrying the exact file path.
pub fn read_record<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StateError> {
    let bytes = match fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let corrupted = |detail: String| {
        warn!(path = %path.display(), %detail, "corrupted state record");
        StateError::Corrupted {
            path: path.to_path_buf(),
            detail,
        }
    };

    let envelope: Envelope = serde_json::from_slice(&bytes).map_err(|e| corrupted(e.to_string()))?;
    if envelope.version != RECORD_VERSION {
        return Err(corrupted(format!(
            "unsupported record version {} (expected {})",
            envelope.version, RECORD_VERSION
        )));
    }
    let actual = checksum(&envelope.payload).map_err(|e| corrupted(e.to_string()))?;
    if actual != envelope.checksum {
        return Err(corrupted(format!(
            "checksum mismatch (stored {}, computed {})",
            envelope.checksum, actual
        )));
    }
    let record = serde_json::from_value(envelope.payload).map_err(|e| corrupted(e.to_string()))?;
    Ok(Some(record))
}

/// Delete a record. Missing files are fine.
pub fn remove_record(path: &Path) -> Result<(), StateError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
