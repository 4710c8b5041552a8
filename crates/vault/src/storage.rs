//! Node-local session storage.
//!
//! Each session gets a directory under the storage root and each sensor
//! stream one append-only log inside it:
//!
//! ```text
//! {root}/
//! └── session-20260101T000000.000Z-ab12cd34/
//!     ├── camera.log
//!     └── gsr.log
//! ```
//!
//! A log is a sequence of records, each `t_local (i64 BE) | len (u32 BE) | payload`.
//! Timestamps are the node's monotonic clock; mapping to master time happens
//! centrally using the offset trace in the session manifest.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tandemproto::{BundleDescriptor, BundleFile, NodeId, SessionId};
use thiserror::Error;
use tracing::{debug, info};

use crate::checksum::Checksum;

const LOG_EXT: &str = "log";
const RECORD_HEADER: usize = 12;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("session id {0:?} is not usable as a directory name")]
    InvalidSession(String),

    #[error("invalid bundle path {0:?}")]
    InvalidPath(String),

    #[error("no open session {0}")]
    NotOpen(SessionId),

    #[error("session {0} not found")]
    UnknownSession(SessionId),

    #[error("storage lock poisoned")]
    Poisoned,
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        StorageError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Durable per-session capture storage.
///
/// `append` is called from the capture writer thread, the rest from the
/// node's protocol task, so implementations must be internally synchronized.
pub trait SessionStorage: Send + Sync + fmt::Debug {
    /// Create (or reopen) the session directory for appending.
    fn open_session(&self, session: &SessionId) -> Result<(), StorageError>;

    /// Append one record to a stream's log.
    fn append(
        &self,
        session: &SessionId,
        stream: &str,
        t_local: i64,
        payload: &[u8],
    ) -> Result<(), StorageError>;

    /// Push buffered records for every stream of the session to disk.
    fn flush(&self, session: &SessionId) -> Result<(), StorageError>;

    /// Flush and close every stream, then describe the files with checksums.
    fn bundle(&self, session: &SessionId, node: &NodeId) -> Result<BundleDescriptor, StorageError>;

    /// Read up to `max_len` bytes of a bundle file. Returns the bytes and the
    /// file's total size.
    fn read_chunk(
        &self,
        session: &SessionId,
        path: &str,
        offset: u64,
        max_len: u64,
    ) -> Result<(Vec<u8>, u64), StorageError>;

    /// Delete a finished session's files.
    fn release(&self, session: &SessionId) -> Result<(), StorageError>;
}

#[derive(Debug)]
struct OpenSession {
    dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
}

/// Filesystem-backed [`SessionStorage`].
#[derive(Debug)]
pub struct FileSessionStorage {
    root: PathBuf,
    open: Mutex<HashMap<SessionId, OpenSession>>,
}

impl FileSessionStorage {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StorageError::io(&root, e))?;
        Ok(Self {
            root,
            open: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session: &SessionId) -> Result<PathBuf, StorageError> {
        if !session.is_path_safe() {
            return Err(StorageError::InvalidSession(session.to_string()));
        }
        Ok(self.root.join(session.as_str()))
    }

    fn file_path(&self, session: &SessionId, path: &str) -> Result<PathBuf, StorageError> {
        if !is_plain_file_name(path) {
            return Err(StorageError::InvalidPath(path.to_string()));
        }
        Ok(self.session_dir(session)?.join(path))
    }
}

fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

impl SessionStorage for FileSessionStorage {
    fn open_session(&self, session: &SessionId) -> Result<(), StorageError> {
        let dir = self.session_dir(session)?;
        fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;

        let mut open = self.open.lock().map_err(|_| StorageError::Poisoned)?;
        open.entry(session.clone()).or_insert_with(|| OpenSession {
            dir,
            writers: HashMap::new(),
        });
        debug!(%session, "session storage opened");
        Ok(())
    }

    fn append(
        &self,
        session: &SessionId,
        stream: &str,
        t_local: i64,
        payload: &[u8],
    ) -> Result<(), StorageError> {
        let mut open = self.open.lock().map_err(|_| StorageError::Poisoned)?;
        let entry = open
            .get_mut(session)
            .ok_or_else(|| StorageError::NotOpen(session.clone()))?;

        if !entry.writers.contains_key(stream) {
            if !is_plain_file_name(stream) {
                return Err(StorageError::InvalidPath(stream.to_string()));
            }
            let path = entry.dir.join(format!("{}.{}", stream, LOG_EXT));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StorageError::io(&path, e))?;
            entry.writers.insert(stream.to_string(), BufWriter::new(file));
        }

        let dir = entry.dir.clone();
        let Some(writer) = entry.writers.get_mut(stream) else {
            return Err(StorageError::NotOpen(session.clone()));
        };
        write_record(writer, t_local, payload).map_err(|e| StorageError::io(&dir, e))
    }

    fn flush(&self, session: &SessionId) -> Result<(), StorageError> {
        let mut open = self.open.lock().map_err(|_| StorageError::Poisoned)?;
        let Some(entry) = open.get_mut(session) else {
            return Ok(());
        };
        let dir = entry.dir.clone();
        for (stream, writer) in entry.writers.iter_mut() {
            writer
                .flush()
                .map_err(|e| StorageError::io(&dir.join(stream), e))?;
        }
        Ok(())
    }

    fn bundle(&self, session: &SessionId, node: &NodeId) -> Result<BundleDescriptor, StorageError> {
        let dir = self.session_dir(session)?;

        let closed = {
            let mut open = self.open.lock().map_err(|_| StorageError::Poisoned)?;
            open.remove(session)
        };
        if let Some(mut closed) = closed {
            for (stream, writer) in closed.writers.iter_mut() {
                writer.flush().map_err(|e| StorageError::io(&dir.join(stream), e))?;
                writer
                    .get_ref()
                    .sync_all()
                    .map_err(|e| StorageError::io(&dir.join(stream), e))?;
            }
        }

        if !dir.is_dir() {
            return Err(StorageError::UnknownSession(session.clone()));
        }

        let mut files = BTreeMap::new();
        let entries = fs::read_dir(&dir).map_err(|e| StorageError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io(&dir, e))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            let (checksum, size) = Checksum::of_file(&path).map_err(|e| StorageError::io(&path, e))?;
            files.insert(
                name.clone(),
                BundleFile {
                    path: name,
                    size,
                    checksum: checksum.into_inner(),
                },
            );
        }

        let descriptor = BundleDescriptor {
            session_id: session.clone(),
            node_id: node.clone(),
            files: files.into_values().collect(),
            storage_error: None,
        };
        info!(
            %session,
            files = descriptor.files.len(),
            bytes = descriptor.total_bytes(),
            "session bundle sealed"
        );
        Ok(descriptor)
    }

    fn read_chunk(
        &self,
        session: &SessionId,
        path: &str,
        offset: u64,
        max_len: u64,
    ) -> Result<(Vec<u8>, u64), StorageError> {
        let full = self.file_path(session, path)?;
        let mut file = File::open(&full).map_err(|e| StorageError::io(&full, e))?;
        let total = file
            .metadata()
            .map_err(|e| StorageError::io(&full, e))?
            .len();

        if offset >= total {
            return Ok((Vec::new(), total));
        }
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StorageError::io(&full, e))?;

        let want = max_len.min(total - offset) as usize;
        let mut buf = vec![0u8; want];
        file.read_exact(&mut buf)
            .map_err(|e| StorageError::io(&full, e))?;
        Ok((buf, total))
    }

    fn release(&self, session: &SessionId) -> Result<(), StorageError> {
        let dir = self.session_dir(session)?;
        {
            let mut open = self.open.lock().map_err(|_| StorageError::Poisoned)?;
            open.remove(session);
        }
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                info!(%session, "session bundle released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&dir, e)),
        }
    }
}

fn write_record<W: Write>(w: &mut W, t_local: i64, payload: &[u8]) -> io::Result<()> {
    w.write_all(&t_local.to_be_bytes())?;
    w.write_all(&(payload.len() as u32).to_be_bytes())?;
    w.write_all(payload)
}

/// One record from a stream log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub t_local: i64,
    pub payload: Vec<u8>,
}

/// Parse every record in a stream log. A truncated tail is an error.
pub fn read_records(bytes: &[u8]) -> io::Result<Vec<Record>> {
    let mut records = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        if rest.len() < RECORD_HEADER {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record header",
            ));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&rest[..8]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&rest[8..RECORD_HEADER]);
        let len = u32::from_be_bytes(len) as usize;
        if rest.len() < RECORD_HEADER + len {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "truncated record payload",
            ));
        }
        records.push(Record {
            t_local: i64::from_be_bytes(ts),
            payload: rest[RECORD_HEADER..RECORD_HEADER + len].to_vec(),
        });
        rest = &rest[RECORD_HEADER + len..];
    }
    Ok(records)
}
