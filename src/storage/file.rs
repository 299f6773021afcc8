// =============================================================================
// Append-only candle file
// =============================================================================
//
// One file per (symbol, interval). Records are written in open-time order;
// the only in-place overwrite is of the last record, which happens when a
// previously open tail is re-asserted as closed with the same open time.
// Reading tolerates a torn or garbage tail by truncating at the first record
// that fails validation.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use super::record::{CandleRecord, RECORD_SIZE};

pub struct CandleFile {
    path: PathBuf,
}

impl CandleFile {
    /// Open the file at `path`, creating parent directories and an empty file
    /// if needed. Errors here abort the repository bind.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        if !path.exists() {
            File::create(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record from the start of the file. Stops at the first
    /// invalid record or short tail; whatever was read before that point is
    /// returned.
    pub fn read_all(&self) -> std::io::Result<Vec<CandleRecord>> {
        let bytes = std::fs::read(&self.path)?;
        let mut records = Vec::with_capacity(bytes.len() / RECORD_SIZE);

        let mut chunks = bytes.chunks_exact(RECORD_SIZE);
        for chunk in &mut chunks {
            let buf: &[u8; RECORD_SIZE] = chunk.try_into().expect("chunks_exact sizes");
            let record = CandleRecord::decode(buf);
            if !record.is_valid() {
                warn!(
                    path = %self.path.display(),
                    records_read = records.len(),
                    "invalid candle record, truncating read"
                );
                return Ok(records);
            }
            records.push(record);
        }

        if !chunks.remainder().is_empty() {
            warn!(
                path = %self.path.display(),
                trailing_bytes = chunks.remainder().len(),
                "short trailing record ignored"
            );
        }

        Ok(records)
    }

    /// Write a batch of records. For each record, relative to the last
    /// persisted one:
    ///   - same open time: overwrite the last record in place (tail rewrite)
    ///   - later open time: append
    ///   - earlier open time: skip (closed history is never rewritten)
    pub fn write_batch(&self, records: &[CandleRecord]) -> std::io::Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;

        let mut len = file.seek(SeekFrom::End(0))?;
        // Ignore any short tail left by a torn write; appends go after the
        // last complete record.
        len -= len % RECORD_SIZE as u64;

        let mut last = if len >= RECORD_SIZE as u64 {
            let mut buf = [0u8; RECORD_SIZE];
            file.seek(SeekFrom::Start(len - RECORD_SIZE as u64))?;
            file.read_exact(&mut buf)?;
            let record = CandleRecord::decode(&buf);
            record.is_valid().then_some(record)
        } else {
            None
        };

        file.seek(SeekFrom::Start(len))?;

        for record in records {
            if !record.is_valid() {
                continue;
            }

            match &last {
                Some(prev) if record.open_time == prev.open_time => {
                    file.seek(SeekFrom::Start(len - RECORD_SIZE as u64))?;
                    file.write_all(&record.encode())?;
                    file.seek(SeekFrom::Start(len))?;
                    last = Some(record.clone());
                }
                Some(prev) if record.open_time < prev.open_time => {
                    warn!(
                        path = %self.path.display(),
                        open_time = record.open_time,
                        last_open = prev.open_time,
                        "out-of-order record skipped"
                    );
                }
                _ => {
                    file.write_all(&record.encode())?;
                    len += RECORD_SIZE as u64;
                    last = Some(record.clone());
                }
            }
        }

        file.flush()?;
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sample_candle;

    fn record(open_time: i64, close: f64) -> CandleRecord {
        CandleRecord::from_candle(&sample_candle(open_time, close, true), "BTCUSDT", "1m", 60_000)
    }

    #[test]
    fn append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let file = CandleFile::open(dir.path().join("BTCUSDT_1m.bin")).unwrap();

        file.write_batch(&[record(60_000, 1.0), record(120_000, 2.0)])
            .unwrap();
        file.write_batch(&[record(180_000, 3.0)]).unwrap();

        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].open_time, 60_000);
        assert_eq!(records[2].open_time, 180_000);
    }

    #[test]
    fn tail_rewrite_overwrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let file = CandleFile::open(dir.path().join("BTCUSDT_1m.bin")).unwrap();

        file.write_batch(&[record(60_000, 1.0), record(120_000, 2.0)])
            .unwrap();
        // Same open time as the last record: rewritten, not appended.
        file.write_batch(&[record(120_000, 9.0)]).unwrap();

        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert!((records[1].close - 9.0).abs() < f64::EPSILON);
    }

    #[test]
    fn older_records_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let file = CandleFile::open(dir.path().join("BTCUSDT_1m.bin")).unwrap();

        file.write_batch(&[record(120_000, 2.0)]).unwrap();
        file.write_batch(&[record(60_000, 1.0)]).unwrap();

        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].open_time, 120_000);
    }

    #[test]
    fn read_truncates_at_corrupt_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTCUSDT_1m.bin");
        let file = CandleFile::open(&path).unwrap();

        file.write_batch(&[record(60_000, 1.0), record(120_000, 2.0)])
            .unwrap();

        // Corrupt the second record's open_time (zeroed = invalid).
        let mut bytes = std::fs::read(&path).unwrap();
        for b in &mut bytes[RECORD_SIZE..RECORD_SIZE + 8] {
            *b = 0;
        }
        std::fs::write(&path, &bytes).unwrap();

        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].open_time, 60_000);
    }

    #[test]
    fn short_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("BTCUSDT_1m.bin");
        let file = CandleFile::open(&path).unwrap();

        file.write_batch(&[record(60_000, 1.0)]).unwrap();

        // Simulate a torn write: half a record at the end.
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(&record(120_000, 2.0).encode()[..40]);
        std::fs::write(&path, &bytes).unwrap();

        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 1);

        // A subsequent append lands after the last complete record.
        file.write_batch(&[record(120_000, 2.0)]).unwrap();
        let records = file.read_all().unwrap();
        assert_eq!(records.len(), 2);
    }
}
