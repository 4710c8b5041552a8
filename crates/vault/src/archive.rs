//! Central session archive.
//!
//! Files pulled from nodes land in a staging area first and only move into
//! place once their checksum matches what the node declared. A staging file
//! survives a failed pull, so a later attempt resumes from where the last
//! one stopped.
//!
//! Layout:
//! ```text
//! {root}/
//! └── {session_id}/
//!     ├── manifest.json
//!     ├── .staging/
//!     │   └── {node_id}/gsr.log    # in-progress pulls
//!     └── {node_id}/
//!         └── gsr.log              # verified
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tandemproto::{BundleFile, NodeId, SessionId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::checksum::Checksum;

const STAGING_DIR: &str = ".staging";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("archive io on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("invalid archive path component {0:?}")]
    InvalidPath(String),

    #[error("chunk for {path} at offset {got}, expected {expected}")]
    OutOfOrder {
        path: String,
        expected: u64,
        got: u64,
    },

    #[error("{path}: {got} bytes exceeds declared size {declared}")]
    Oversize { path: String, declared: u64, got: u64 },

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("manifest encoding: {0}")]
    Json(#[from] serde_json::Error),
}

impl ArchiveError {
    fn io(path: &Path, source: io::Error) -> Self {
        ArchiveError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

fn component(s: &str) -> Result<&str, ArchiveError> {
    let ok = !s.is_empty()
        && s != "."
        && s != ".."
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(s)
    } else {
        Err(ArchiveError::InvalidPath(s.to_string()))
    }
}

/// Root of the central archive.
#[derive(Debug, Clone)]
pub struct Archive {
    root: PathBuf,
}

impl Archive {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| ArchiveError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session: &SessionId) -> Result<PathBuf, ArchiveError> {
        Ok(self.root.join(component(session.as_str())?))
    }

    pub fn final_path(
        &self,
        session: &SessionId,
        node: &NodeId,
        file: &str,
    ) -> Result<PathBuf, ArchiveError> {
        Ok(self
            .session_dir(session)?
            .join(component(node.as_str())?)
            .join(component(file)?))
    }

    fn staging_path(
        &self,
        session: &SessionId,
        node: &NodeId,
        file: &str,
    ) -> Result<PathBuf, ArchiveError> {
        Ok(self
            .session_dir(session)?
            .join(STAGING_DIR)
            .join(component(node.as_str())?)
            .join(component(file)?))
    }

    /// Open (or resume) a staging file for one bundle file.
    ///
    /// An existing staging file longer than the declared size cannot be a
    /// prefix of the real file and is started over.
    pub fn stage(
        &self,
        session: &SessionId,
        node: &NodeId,
        expected: &BundleFile,
    ) -> Result<StagedFile, ArchiveError> {
        let path = self.staging_path(session, node, &expected.path)?;
        let final_path = self.final_path(session, node, &expected.path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }

        let existing = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(ArchiveError::io(&path, e)),
        };

        let file = if existing > expected.size {
            warn!(path = %path.display(), existing, declared = expected.size, "discarding oversized staging file");
            File::create(&path).map_err(|e| ArchiveError::io(&path, e))?
        } else {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| ArchiveError::io(&path, e))?
        };
        let bytes_written = if existing > expected.size { 0 } else { existing };

        if bytes_written > 0 {
            debug!(path = %path.display(), bytes_written, "resuming staged file");
        }

        Ok(StagedFile {
            path,
            final_path,
            expected: expected.clone(),
            file: Some(file),
            bytes_written,
        })
    }

    /// Whether a file is already verified in the archive.
    pub fn is_sealed(
        &self,
        session: &SessionId,
        node: &NodeId,
        expected: &BundleFile,
    ) -> Result<bool, ArchiveError> {
        let path = self.final_path(session, node, &expected.path)?;
        if !path.exists() {
            return Ok(false);
        }
        let (sum, size) = Checksum::of_file(&path).map_err(|e| ArchiveError::io(&path, e))?;
        Ok(size == expected.size && sum.as_str() == expected.checksum)
    }

    /// Write the manifest atomically (temp file, then rename).
    pub fn write_manifest<T: Serialize>(
        &self,
        session: &SessionId,
        manifest: &T,
    ) -> Result<PathBuf, ArchiveError> {
        let dir = self.session_dir(session)?;
        fs::create_dir_all(&dir).map_err(|e| ArchiveError::io(&dir, e))?;

        let path = dir.join(MANIFEST_FILE);
        let tmp = dir.join(format!(".{}.{}", MANIFEST_FILE, uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec_pretty(manifest)?;
        {
            let mut file = File::create(&tmp).map_err(|e| ArchiveError::io(&tmp, e))?;
            file.write_all(&body).map_err(|e| ArchiveError::io(&tmp, e))?;
            file.sync_all().map_err(|e| ArchiveError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| ArchiveError::io(&path, e))?;
        info!(%session, path = %path.display(), "manifest written");
        Ok(path)
    }

    pub fn read_manifest<T: DeserializeOwned>(&self, session: &SessionId) -> Result<T, ArchiveError> {
        let path = self.session_dir(session)?.join(MANIFEST_FILE);
        let body = fs::read(&path).map_err(|e| ArchiveError::io(&path, e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Remove the session's staging area once nothing is in flight.
    pub fn clear_staging(&self, session: &SessionId) -> Result<(), ArchiveError> {
        let dir = self.session_dir(session)?.join(STAGING_DIR);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArchiveError::io(&dir, e)),
        }
    }
}

/// A bundle file being pulled into the archive.
#[derive(Debug)]
pub struct StagedFile {
    path: PathBuf,
    final_path: PathBuf,
    expected: BundleFile,
    file: Option<File>,
    bytes_written: u64,
}

/// A verified archive file.
#[derive(Debug, Clone)]
pub struct SealedFile {
    pub path: PathBuf,
    pub checksum: Checksum,
    pub size: u64,
}

impl StagedFile {
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn expected(&self) -> &BundleFile {
        &self.expected
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_written >= self.expected.size
    }

    /// Append a chunk. `offset` must equal the bytes already staged.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), ArchiveError> {
        if offset != self.bytes_written {
            return Err(ArchiveError::OutOfOrder {
                path: self.expected.path.clone(),
                expected: self.bytes_written,
                got: offset,
            });
        }
        let end = self.bytes_written + data.len() as u64;
        if end > self.expected.size {
            return Err(ArchiveError::Oversize {
                path: self.expected.path.clone(),
                declared: self.expected.size,
                got: end,
            });
        }
        let Some(file) = self.file.as_mut() else {
            return Err(ArchiveError::io(
                &self.path,
                io::Error::other("staging file already closed"),
            ));
        };
        file.write_all(data)
            .map_err(|e| ArchiveError::io(&self.path, e))?;
        self.bytes_written = end;
        Ok(())
    }

    /// Verify the staged bytes and move them into place.
    ///
    /// On mismatch the staging file is deleted so the next attempt starts
    /// from zero.
    pub fn seal(mut self) -> Result<SealedFile, ArchiveError> {
        if let Some(mut file) = self.file.take() {
            file.flush().map_err(|e| ArchiveError::io(&self.path, e))?;
            file.sync_all().map_err(|e| ArchiveError::io(&self.path, e))?;
        }

        let (checksum, size) =
            Checksum::of_file(&self.path).map_err(|e| ArchiveError::io(&self.path, e))?;
        if checksum.as_str() != self.expected.checksum || size != self.expected.size {
            let _ = fs::remove_file(&self.path);
            return Err(ArchiveError::ChecksumMismatch {
                path: self.expected.path.clone(),
                expected: self.expected.checksum.clone(),
                actual: checksum.into_inner(),
            });
        }

        if let Some(parent) = self.final_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        fs::rename(&self.path, &self.final_path)
            .map_err(|e| ArchiveError::io(&self.final_path, e))?;

        debug!(path = %self.final_path.display(), size, "staged file sealed");
        Ok(SealedFile {
            path: self.final_path.clone(),
            checksum,
            size,
        })
    }

    /// Drop the staged bytes.
    pub fn discard(mut self) -> Result<(), ArchiveError> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ArchiveError::io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde::Deserialize;

    fn declared(name: &str, data: &[u8]) -> BundleFile {
        BundleFile {
            path: name.to_string(),
            size: data.len() as u64,
            checksum: Checksum::of_bytes(data).into_inner(),
        }
    }

    #[test]
    fn stage_write_seal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path()).unwrap();
        let session = SessionId::new("s1");
        let node = NodeId::new("n1");
        let data = b"0123456789abcdef";
        let expected = declared("gsr.log", data);

        let mut staged = archive.stage(&session, &node, &expected).unwrap();
        staged.write_at(0, &data[..10]).unwrap();
        staged.write_at(10, &data[10..]).unwrap();
        assert!(staged.is_complete());

        let sealed = staged.seal().unwrap();
        assert_eq!(std::fs::read(&sealed.path).unwrap(), data);
        assert!(archive.is_sealed(&session, &node, &expected).unwrap());
    }

    #[test]
    fn resume_after_interrupted_pull() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path()).unwrap();
        let session = SessionId::new("s1");
        let node = NodeId::new("n1");
        let data = vec![42u8; 1000];
        let expected = declared("cam.log", &data);

        {
            let mut staged = archive.stage(&session, &node, &expected).unwrap();
            staged.write_at(0, &data[..400]).unwrap();
        }

        let mut resumed = archive.stage(&session, &node, &expected).unwrap();
        assert_eq!(resumed.bytes_written(), 400);
        resumed.write_at(400, &data[400..]).unwrap();
        resumed.seal().unwrap();
    }

    #[test]
    fn mismatch_clears_staging() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path()).unwrap();
        let session = SessionId::new("s1");
        let node = NodeId::new("n1");
        let expected = declared("ppg.log", b"good data");

        let mut staged = archive.stage(&session, &node, &expected).unwrap();
        staged.write_at(0, b"bad! data").unwrap();
        let err = staged.seal().unwrap_err();
        assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));

        let fresh = archive.stage(&session, &node, &expected).unwrap();
        assert_eq!(fresh.bytes_written(), 0);
        assert!(!archive.is_sealed(&session, &node, &expected).unwrap());
    }

    #[test]
    fn out_of_order_and_oversize_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path()).unwrap();
        let expected = declared("x.log", b"1234");
        let mut staged = archive
            .stage(&SessionId::new("s"), &NodeId::new("n"), &expected)
            .unwrap();

        assert!(matches!(
            staged.write_at(2, b"34"),
            Err(ArchiveError::OutOfOrder { expected: 0, got: 2, .. })
        ));
        assert!(matches!(
            staged.write_at(0, b"12345"),
            Err(ArchiveError::Oversize { .. })
        ));
    }

    #[test]
    fn node_id_cannot_escape_session() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path()).unwrap();
        let expected = declared("x.log", b"1");
        assert!(archive
            .stage(&SessionId::new("s"), &NodeId::new(".."), &expected)
            .is_err());
    }

    #[test]
    fn manifest_roundtrip() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct M {
            state: String,
            nodes: Vec<String>,
        }

        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::new(dir.path()).unwrap();
        let session = SessionId::new("s9");
        let m = M {
            state: "archived".into(),
            nodes: vec!["a".into(), "b".into()],
        };
        let path = archive.write_manifest(&session, &m).unwrap();
        assert!(path.ends_with("s9/manifest.json"));
        let back: M = archive.read_manifest(&session).unwrap();
        assert_eq!(back, m);
    }
}
