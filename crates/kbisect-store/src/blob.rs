use std::io::{Read, Write};
use std::sync::{Arc, Mutex};

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use kbisect_core::BlobId;

use crate::sqlite::Store;
use crate::{StoreError, StoreResult};

/// Streaming writer for one log blob. Each appended chunk is compressed as
/// an independent gzip member and concatenated in the database, so a 50 MB
/// build log is never held in memory in full. Dropping the writer without
/// `finalize` leaves the blob unfinalized; the store discards it on next
/// open.
pub struct LogBlobWriter {
    store: Arc<Store>,
    blob_id: BlobId,
    state: Mutex<WriterState>,
}

struct WriterState {
    hasher: Sha256,
    size: u64,
}

impl LogBlobWriter {
    /// Allocate a fresh blob for (iteration, host, kind) and return its
    /// streaming writer.
    pub fn open(
        store: Arc<Store>,
        iteration_id: kbisect_core::IterationId,
        host: &kbisect_core::HostId,
        kind: crate::records::LogKind,
    ) -> StoreResult<Self> {
        let blob_id = store.create_log_blob(iteration_id, host, kind)?;
        Ok(Self::new(store, blob_id))
    }

    fn new(store: Arc<Store>, blob_id: BlobId) -> Self {
        Self {
            store,
            blob_id,
            state: Mutex::new(WriterState {
                hasher: Sha256::new(),
                size: 0,
            }),
        }
    }

    pub fn blob_id(&self) -> BlobId {
        self.blob_id
    }

    pub fn append(&self, chunk: &[u8]) -> StoreResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }

        let compressed = compress_member(chunk)?;
        self.store
            .append_log_chunk(self.blob_id, &compressed, chunk.len() as u64)?;

        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::Io("log writer state mutex poisoned".to_owned()))?;
        state.hasher.update(chunk);
        state.size += chunk.len() as u64;
        Ok(())
    }

    pub fn append_str(&self, chunk: &str) -> StoreResult<()> {
        self.append(chunk.as_bytes())
    }

    /// Seal the blob, recording its exit code and content checksum. Only
    /// finalized blobs are visible to readers.
    pub fn finalize(self, exit_code: Option<i64>) -> StoreResult<BlobId> {
        let state = self
            .state
            .into_inner()
            .map_err(|_| StoreError::Io("log writer state mutex poisoned".to_owned()))?;
        let digest = state.hasher.finalize();
        let mut rendered = String::with_capacity(digest.len() * 2);
        for byte in digest {
            use std::fmt::Write as _;
            let _ = write!(rendered, "{byte:02x}");
        }
        self.store
            .finalize_log_blob(self.blob_id, exit_code, &rendered)?;
        Ok(self.blob_id)
    }
}

fn compress_member(chunk: &[u8]) -> StoreResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(chunk)
        .map_err(|err| StoreError::Io(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| StoreError::Io(err.to_string()))
}

pub(crate) fn decompress(compressed: &[u8]) -> StoreResult<Vec<u8>> {
    if compressed.is_empty() {
        return Ok(Vec::new());
    }
    let mut decoder = MultiGzDecoder::new(compressed);
    let mut output = Vec::new();
    decoder
        .read_to_end(&mut output)
        .map_err(|err| StoreError::Corrupt(format!("log blob decompression failed: {err}")))?;
    Ok(output)
}
