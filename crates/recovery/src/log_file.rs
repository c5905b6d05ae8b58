use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{DbError, DbResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::LogRecord;

/// Bincode configuration for log frames: little-endian, fixed-width
/// integers, stable across platforms.
fn bincode_config() -> impl Config {
    config::legacy()
}

/// Append-only log file.
///
/// Frame layout: `u32 len ∥ u32 crc32 ∥ len bytes of bincode`. The length
/// prefix makes forward iteration safe; the checksum turns a torn tail
/// write into a clean end-of-log.
pub struct LogFile {
    path: PathBuf,
    file: File,
}

impl LogFile {
    /// Open or create the log at `path`, preserving existing frames.
    pub fn open(path: impl AsRef<Path>) -> DbResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)
            .map_err(|e| DbError::Failed(format!("failed to open log file: {e}")))?;
        Ok(Self { path, file })
    }

    /// Append one record. Buffered by the OS; call [`LogFile::sync`] for
    /// durability.
    pub fn append<K: Serialize, V: Serialize>(&mut self, record: &LogRecord<K, V>) -> DbResult<()> {
        let bytes = encode_to_vec(record, bincode_config())
            .map_err(|e| DbError::Failed(format!("failed to serialize log record: {e}")))?;
        let crc = crc32fast::hash(&bytes);
        self.file.write_all(&(bytes.len() as u32).to_le_bytes())?;
        self.file.write_all(&crc.to_le_bytes())?;
        self.file.write_all(&bytes)?;
        Ok(())
    }

    /// Fsync the log so every appended frame survives a crash.
    pub fn sync(&mut self) -> DbResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Read back every intact frame in order. A missing file is an empty
    /// log; a truncated or corrupt tail frame ends the replay.
    pub fn replay<K, V>(path: impl AsRef<Path>) -> DbResult<Vec<LogRecord<K, V>>>
    where
        K: DeserializeOwned,
        V: DeserializeOwned,
    {
        let mut file = match File::open(path.as_ref()) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DbError::Failed(format!("failed to open log for replay: {e}"))),
        };

        let mut records = Vec::new();
        loop {
            let mut header = [0u8; 8];
            match read_exact_or_eof(&mut file, &mut header) {
                ReadOutcome::Full => {}
                ReadOutcome::Eof => break,
                ReadOutcome::Partial => {
                    warn!("log ends in a torn frame header; truncating replay");
                    break;
                }
            }
            let len = u32::from_le_bytes(header[0..4].try_into().expect("frame header"));
            let crc = u32::from_le_bytes(header[4..8].try_into().expect("frame header"));

            let mut payload = vec![0u8; len as usize];
            if !matches!(read_exact_or_eof(&mut file, &mut payload), ReadOutcome::Full) {
                warn!("log ends in a torn frame payload; truncating replay");
                break;
            }
            if crc32fast::hash(&payload) != crc {
                warn!("log frame checksum mismatch; truncating replay");
                break;
            }
            let (record, _) = decode_from_slice(&payload, bincode_config())
                .map_err(|e| DbError::Failed(format!("failed to decode log record: {e}")))?;
            records.push(record);
        }
        Ok(records)
    }

    /// Drop every frame, e.g. after a checkpoint made them redundant.
    pub fn truncate(&mut self) -> DbResult<()> {
        self.file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| DbError::Failed(format!("failed to truncate log: {e}")))?;
        self.file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| DbError::Failed(format!("failed to reopen log: {e}")))?;
        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Partial,
    Eof,
}

fn read_exact_or_eof(file: &mut File, buf: &mut [u8]) -> ReadOutcome {
    let mut read = 0;
    while read < buf.len() {
        match file.read(&mut buf[read..]) {
            Ok(0) => {
                return if read == 0 {
                    ReadOutcome::Eof
                } else {
                    ReadOutcome::Partial
                }
            }
            Ok(n) => read += n,
            Err(_) => return ReadOutcome::Partial,
        }
    }
    ReadOutcome::Full
}
