//! Session storage for Tandem.
//!
//! Two halves:
//! - [`storage`]: append-only per-session logs on a sensor node, plus the
//!   bundle descriptor (sizes and checksums) handed to the conductor
//! - [`archive`]: the conductor's verified archive, with resumable staging
//!
//! Both use BLAKE3 via [`checksum`].

pub mod archive;
pub mod checksum;
pub mod storage;

pub use archive::{Archive, ArchiveError, SealedFile, StagedFile};
pub use checksum::{Checksum, ChecksumError, StreamingChecksum};
pub use storage::{read_records, FileSessionStorage, Record, SessionStorage, StorageError};
