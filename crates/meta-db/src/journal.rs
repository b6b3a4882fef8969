//! Per-session write-ahead journal.
//!
//! One JSONL record per mutation, flushed on every batch commit. A journal
//! that still holds records at open time belongs to a session that never
//! closed cleanly; its backup set is doomed (left incomplete) and the
//! journal is truncated. A torn trailing line from a mid-write crash is
//! dropped during recovery.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

/// Session journal handle.
pub struct Journal {
    path: PathBuf,
    file: File,
    buffered: Vec<u8>,
}

impl Journal {
    /// Open the journal; returns `(journal, doomed)` where `doomed` means a
    /// prior session left records behind.
    pub fn open(path: &Path) -> std::io::Result<(Self, bool)> {
        let mut doomed = false;
        if path.is_file() {
            let valid_len = Self::valid_prefix_len(path)?;
            if valid_len > 0 {
                doomed = true;
                warn!(journal = %path.display(), "incomplete journal found; prior session is doomed");
            }
        }
        let mut file = OpenOptions::new().create(true).write(true).open(path)?;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        Ok((Self { path: path.to_path_buf(), file, buffered: Vec::new() }, doomed))
    }

    // Length of the journal up to (and including) its last parseable line.
    fn valid_prefix_len(path: &Path) -> std::io::Result<u64> {
        let reader = BufReader::new(File::open(path)?);
        let mut good = 0u64;
        for line in reader.lines() {
            let line = match line {
                Ok(l) => l,
                Err(_) => break,
            };
            if serde_json::from_str::<Value>(&line).is_err() {
                break;
            }
            good += line.len() as u64 + 1;
        }
        Ok(good)
    }

    /// Queue one mutation record; durable after the next [`Journal::sync`].
    pub fn record(&mut self, entry: &Value) {
        self.buffered
            .extend_from_slice(entry.to_string().as_bytes());
        self.buffered.push(b'\n');
    }

    /// Flush queued records to disk (called on transaction commit).
    pub fn sync(&mut self) -> std::io::Result<()> {
        if !self.buffered.is_empty() {
            self.file.write_all(&self.buffered)?;
            self.buffered.clear();
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Clean close: the session committed everything, drop the records.
    pub fn close(mut self) -> std::io::Result<()> {
        self.buffered.clear();
        self.file.set_len(0)?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn clean_close_leaves_empty_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let (mut j, doomed) = Journal::open(&path).unwrap();
        assert!(!doomed);
        j.record(&json!({"op": "insert", "ck": "abcd"}));
        j.sync().unwrap();
        j.close().unwrap();

        let (_j2, doomed2) = Journal::open(&path).unwrap();
        assert!(!doomed2);
    }

    #[test]
    fn leftover_records_doom_prior_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        {
            let (mut j, _) = Journal::open(&path).unwrap();
            j.record(&json!({"op": "insert"}));
            j.sync().unwrap();
            // dropped without close(): simulated crash
        }
        let (_j, doomed) = Journal::open(&path).unwrap();
        assert!(doomed);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn torn_trailing_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        std::fs::write(&path, b"{\"op\":\"a\"}\n{\"op\":").unwrap();
        let (_j, doomed) = Journal::open(&path).unwrap();
        assert!(doomed);
    }

    #[test]
    fn garbage_only_journal_is_not_doomed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        std::fs::write(&path, b"{\"op").unwrap();
        let (_j, doomed) = Journal::open(&path).unwrap();
        assert!(!doomed);
    }
}
