//! Aggregation: pull each node's verified bundle into the central archive.

use chrono::Utc;
use tandemconf::TransferConfig;
use tandemproto::{BundleDescriptor, BundleFile, PullChunk, PullRequest, RetryPolicy, SessionParams, Verb};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vault::{Archive, ArchiveError, StagedFile};

use crate::link::{CommandError, NodeHandle};
use crate::session::{FileTransfer, FileTransferStatus, Manifest, TransferRecord};

/// Pulls bundles and writes manifests.
#[derive(Debug, Clone)]
pub struct Aggregator {
    archive: Archive,
    transfer: TransferConfig,
    chunk_policy: RetryPolicy,
}

enum FileError {
    /// Worth another whole-file attempt.
    Integrity(String),
    /// The node is gone or refuses; stop pulling from it.
    Node(String),
    Archive(String),
}

impl Aggregator {
    pub fn new(archive: Archive, transfer: TransferConfig, chunk_policy: RetryPolicy) -> Self {
        Self {
            archive,
            transfer,
            chunk_policy,
        }
    }

    pub fn archive(&self) -> &Archive {
        &self.archive
    }

    /// Pull every file in `descriptor`, verifying each against its checksum.
    ///
    /// A checksum mismatch discards the staged bytes and retries the file up
    /// to `transfer.max_attempts` times. A transient chunk failure resumes
    /// from what is already staged.
    pub async fn pull(
        &self,
        node: &NodeHandle,
        descriptor: &BundleDescriptor,
        cancel: &CancellationToken,
    ) -> TransferRecord {
        let mut files = Vec::with_capacity(descriptor.files.len());
        let mut node_lost: Option<String> = None;

        for file in &descriptor.files {
            if let Some(reason) = &node_lost {
                files.push(failed(file, 0, reason.clone()));
                continue;
            }

            match self.already_sealed(descriptor, node, file).await {
                Ok(true) => {
                    debug!(node = %node.id(), path = %file.path, "already archived");
                    files.push(verified(file, 0));
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    files.push(failed(file, 0, e));
                    continue;
                }
            }

            let mut attempts = 0;
            let mut last_error = String::new();
            let mut result = None;
            while attempts < self.transfer.max_attempts {
                attempts += 1;
                match self.pull_file(node, descriptor, file, cancel).await {
                    Ok(()) => {
                        result = Some(verified(file, attempts));
                        break;
                    }
                    Err(FileError::Integrity(reason)) => {
                        warn!(node = %node.id(), path = %file.path, attempt = attempts, %reason, "transfer integrity failure");
                        last_error = reason;
                    }
                    Err(FileError::Node(reason)) => {
                        node_lost = Some(reason.clone());
                        result = Some(failed(file, attempts, reason));
                        break;
                    }
                    Err(FileError::Archive(reason)) => {
                        result = Some(failed(file, attempts, reason));
                        break;
                    }
                }
            }
            files.push(result.unwrap_or_else(|| failed(file, attempts, last_error)));
        }

        let mut record = TransferRecord {
            files,
            released: false,
            completed_at: Utc::now(),
        };

        if record.all_verified() && self.transfer.release_after_verify && node_lost.is_none() {
            let params = SessionParams::new(descriptor.session_id.clone());
            match node
                .command(Verb::ReleaseBundle, &params, None, &self.chunk_policy, cancel)
                .await
            {
                Ok(_) => record.released = true,
                Err(e) => warn!(node = %node.id(), "release_bundle failed: {}", e),
            }
        }

        info!(
            node = %node.id(),
            session = %descriptor.session_id,
            files = record.files.len(),
            verified = record.all_verified(),
            released = record.released,
            "bundle aggregation finished"
        );
        record
    }

    async fn pull_file(
        &self,
        node: &NodeHandle,
        descriptor: &BundleDescriptor,
        file: &BundleFile,
        cancel: &CancellationToken,
    ) -> Result<(), FileError> {
        let mut staged = self.stage(descriptor, node, file).await?;

        while !staged.is_complete() {
            let request = PullRequest {
                session_id: descriptor.session_id.clone(),
                path: file.path.clone(),
                offset: staged.bytes_written(),
                max_len: self.transfer.chunk_size as u64,
            };
            let ack = node
                .command(Verb::PullBundle, &request, None, &self.chunk_policy, cancel)
                .await
                .map_err(|e| match e {
                    CommandError::Rejected { reason, .. } => FileError::Node(format!("pull rejected: {}", reason)),
                    other => FileError::Node(other.to_string()),
                })?;

            let chunk: PullChunk = ack
                .params_as()
                .map_err(|e| FileError::Integrity(format!("malformed chunk: {}", e)))?;
            let bytes = chunk
                .bytes()
                .map_err(|e| FileError::Integrity(format!("bad chunk encoding: {}", e)))?;

            if chunk.total_size != file.size {
                discard(staged);
                return Err(FileError::Integrity(format!(
                    "node reports {} bytes, descriptor said {}",
                    chunk.total_size, file.size
                )));
            }
            if bytes.is_empty() {
                discard(staged);
                return Err(FileError::Integrity("empty chunk before end of file".into()));
            }

            staged = write_chunk(staged, chunk.offset, bytes).await?;
        }

        seal(staged).await
    }

    async fn already_sealed(
        &self,
        descriptor: &BundleDescriptor,
        node: &NodeHandle,
        file: &BundleFile,
    ) -> Result<bool, String> {
        let archive = self.archive.clone();
        let (session, node, file) = (descriptor.session_id.clone(), node.id().clone(), file.clone());
        tokio::task::spawn_blocking(move || archive.is_sealed(&session, &node, &file))
            .await
            .map_err(|e| format!("archive check failed: {}", e))?
            .map_err(|e| e.to_string())
    }

    async fn stage(
        &self,
        descriptor: &BundleDescriptor,
        node: &NodeHandle,
        file: &BundleFile,
    ) -> Result<StagedFile, FileError> {
        let archive = self.archive.clone();
        let (session, node, file) = (descriptor.session_id.clone(), node.id().clone(), file.clone());
        tokio::task::spawn_blocking(move || archive.stage(&session, &node, &file))
            .await
            .map_err(|e| FileError::Archive(format!("staging task failed: {}", e)))?
            .map_err(|e| FileError::Archive(e.to_string()))
    }

    /// Write the manifest for a finished session.
    pub fn finalize(&self, manifest: &Manifest) -> Result<std::path::PathBuf, ArchiveError> {
        let path = self.archive.write_manifest(&manifest.session_id, manifest)?;
        if let Err(e) = self.archive.clear_staging(&manifest.session_id) {
            debug!(session = %manifest.session_id, "leaving staging area in place: {}", e);
        }
        Ok(path)
    }
}

async fn write_chunk(mut staged: StagedFile, offset: u64, bytes: Vec<u8>) -> Result<StagedFile, FileError> {
    let joined = tokio::task::spawn_blocking(move || {
        let result = staged.write_at(offset, &bytes);
        (staged, result)
    })
    .await
    .map_err(|e| FileError::Archive(format!("staging task failed: {}", e)))?;

    match joined {
        (staged, Ok(())) => Ok(staged),
        (staged, Err(e @ ArchiveError::OutOfOrder { .. })) | (staged, Err(e @ ArchiveError::Oversize { .. })) => {
            discard(staged);
            Err(FileError::Integrity(e.to_string()))
        }
        (_, Err(e)) => Err(FileError::Archive(e.to_string())),
    }
}

async fn seal(staged: StagedFile) -> Result<(), FileError> {
    let sealed = tokio::task::spawn_blocking(move || staged.seal())
        .await
        .map_err(|e| FileError::Archive(format!("seal task failed: {}", e)))?;
    match sealed {
        Ok(_) => Ok(()),
        Err(e @ ArchiveError::ChecksumMismatch { .. }) => Err(FileError::Integrity(e.to_string())),
        Err(e) => Err(FileError::Archive(e.to_string())),
    }
}

fn discard(staged: StagedFile) {
    if let Err(e) = staged.discard() {
        debug!("failed to discard staged file: {}", e);
    }
}

fn verified(file: &BundleFile, attempts: u32) -> FileTransfer {
    FileTransfer {
        path: file.path.clone(),
        size: file.size,
        checksum: file.checksum.clone(),
        attempts,
        status: FileTransferStatus::Verified,
    }
}

fn failed(file: &BundleFile, attempts: u32, reason: String) -> FileTransfer {
    FileTransfer {
        path: file.path.clone(),
        size: file.size,
        checksum: file.checksum.clone(),
        attempts,
        status: FileTransferStatus::Failed { reason },
    }
}
