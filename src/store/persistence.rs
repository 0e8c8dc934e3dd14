//! Optional append-only persistence log.
//!
//! Record format: `{len: u32 LE, sha256: [u8; 32], entry_cbor: [u8; len]}`.
//! Recovery replays sequentially and stops at the first checksum mismatch
//! — corruption is treated as truncation of a torn write, not a hard
//! error, per §4.1/§6.

use crate::entry::Entry;
use crate::error::{MerkleError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    key: String,
    entry: Entry,
}

/// Append-only log of serialized entries, one writer at a time.
pub struct PersistenceLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl PersistenceLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| MerkleError::Internal(format!("open persistence log: {e}")))?;
        Ok(Self { path, writer: Mutex::new(BufWriter::new(file)) })
    }

    /// Appends one `(key, entry)` record, flushing immediately so a crash
    /// right after `append` returns never loses the write.
    pub fn append(&self, key: &str, entry: &Entry) -> Result<()> {
        let record = StoredRecord { key: key.to_string(), entry: entry.clone() };
        let body = serde_cbor::to_vec(&record)
            .map_err(|e| MerkleError::Internal(format!("encode persistence record: {e}")))?;
        let checksum: [u8; 32] = Sha256::digest(&body).into();

        let mut writer = self.writer.lock().expect("persistence writer lock poisoned");
        writer
            .write_all(&(body.len() as u32).to_le_bytes())
            .and_then(|_| writer.write_all(&checksum))
            .and_then(|_| writer.write_all(&body))
            .and_then(|_| writer.flush())
            .map_err(|e| MerkleError::Internal(format!("append persistence record: {e}")))
    }

    /// Replays the log from the start, returning every record up to (but
    /// not including) the first corrupted one.
    pub fn replay(&self) -> Result<Vec<(String, Entry)>> {
        let file = File::open(&self.path)
            .map_err(|e| MerkleError::Internal(format!("open persistence log for replay: {e}")))?;
        let mut reader = BufReader::new(file);
        let mut out = Vec::new();

        loop {
            let mut len_buf = [0u8; 4];
            if reader.read_exact(&mut len_buf).is_err() {
                break; // clean EOF between records
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut checksum = [0u8; 32];
            if reader.read_exact(&mut checksum).is_err() {
                break; // torn write mid-header
            }

            let mut body = vec![0u8; len];
            if reader.read_exact(&mut body).is_err() {
                break; // torn write mid-body
            }

            let actual: [u8; 32] = Sha256::digest(&body).into();
            if actual != checksum {
                break; // corruption: truncate replay at last valid prefix
            }

            match serde_cbor::from_slice::<StoredRecord>(&body) {
                Ok(record) => out.push((record.key, record.entry)),
                Err(_) => break,
            }
        }
        Ok(out)
    }
}
