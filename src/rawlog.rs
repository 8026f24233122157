//! Raw byte logging.
//!
//! One line per receive iteration: `<unix seconds> CPCH: <hex>`. The file
//! is opened in append mode for every entry so a crash loses at most the
//! entry being written.

use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info};

const TAG: &str = "CPCH:";

pub trait RawByteLog: Send {
    fn append(&mut self, bytes: &[u8], timestamp: SystemTime) -> io::Result<()>;
}

/// Text log of raw receive buffers.
#[derive(Debug, Clone)]
pub struct TextRawLog {
    path: PathBuf,
    entries: u64,
}

impl TextRawLog {
    /// Create (or truncate) the log file.
    pub fn create(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        File::create(&path)?;
        info!("logging raw CPCH bytes to {}", path.display());
        Ok(Self { path, entries: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }
}

impl RawByteLog for TextRawLog {
    fn append(&mut self, bytes: &[u8], timestamp: SystemTime) -> io::Result<()> {
        let secs = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        writeln!(file, "{:.6} {} {}", secs, TAG, hex::encode(bytes))?;
        self.entries += 1;
        Ok(())
    }
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct RawLogEntry {
    pub timestamp: SystemTime,
    pub bytes: Vec<u8>,
}

/// Read a log written by [`TextRawLog`]. Malformed lines are skipped.
pub fn read_raw_log(path: impl AsRef<Path>) -> io::Result<Vec<RawLogEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        match parse_line(&line) {
            Some(entry) => entries.push(entry),
            None => debug!("skipping malformed raw log line {}", lineno + 1),
        }
    }
    Ok(entries)
}

fn parse_line(line: &str) -> Option<RawLogEntry> {
    let mut parts = line.split_whitespace();
    let secs: f64 = parts.next()?.parse().ok()?;
    if parts.next()? != TAG {
        return None;
    }
    let bytes = match parts.next() {
        Some(hex) => hex::decode(hex).ok()?,
        None => Vec::new(),
    };
    let since_epoch = Duration::try_from_secs_f64(secs).ok()?;
    Some(RawLogEntry {
        timestamp: UNIX_EPOCH.checked_add(since_epoch)?,
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpch_raw.log");
        let mut log = TextRawLog::create(&path).unwrap();

        let t0 = UNIX_EPOCH + Duration::from_millis(1_700_000_000_123);
        log.append(&[0x80, 0x00, 0x01], t0).unwrap();
        log.append(&[], t0 + Duration::from_millis(20)).unwrap();
        assert_eq!(log.entries(), 2);

        let entries = read_raw_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].bytes, vec![0x80, 0x00, 0x01]);
        assert!(entries[1].bytes.is_empty());
        let dt = entries[1]
            .timestamp
            .duration_since(entries[0].timestamp)
            .unwrap();
        assert!((dt.as_secs_f64() - 0.020).abs() < 1e-3);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.log");
        std::fs::write(
            &path,
            "12.5 CPCH: 8001\nnot a log line\n13.0 EMG: 00\n14.0 CPCH: zz\n15.0 CPCH: ff\n",
        )
        .unwrap();
        let entries = read_raw_log(&path).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].bytes, vec![0xFF]);
    }

    #[test]
    fn append_fails_when_file_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.log");
        let mut log = TextRawLog::create(&path).unwrap();
        drop(dir);
        assert!(log.append(&[1], SystemTime::now()).is_err());
    }
}
