//! Append-only JSONL log used to persist bid audit records.

#![deny(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub mod audit;

pub use audit::{AuditOutcome, BidAuditRecord};

/// Identifier assigned to a record on append.
pub type EventId = u64;

/// Errors emitted by the event log.
#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One line of the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord<T> {
    /// Monotonic event id assigned on append.
    pub id: EventId,
    /// Millis since epoch, supplied by the caller.
    pub ts_ms: u64,
    pub payload: T,
}

/// A JSONL-backed append-only event log.
///
/// ```
/// use event_log::{JsonlEventLog, EventId};
/// use serde::{Serialize, Deserialize};
///
/// #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// struct P { v: u32 }
///
/// let path = tempfile::NamedTempFile::new().unwrap();
/// let log = JsonlEventLog::open(path.path()).unwrap();
///
/// let _ = log.append(1 as EventId, 10, &P { v: 10 }).unwrap();
/// let _ = log.append(2 as EventId, 11, &P { v: 20 }).unwrap();
///
/// let recs: Vec<event_log::EventRecord<P>> = log.read_range(1, 3).unwrap();
/// assert_eq!(recs.len(), 2);
/// assert_eq!(recs[1].payload, P { v: 20 });
/// ```
#[derive(Debug, Clone)]
pub struct JsonlEventLog {
    path: PathBuf,
}

impl JsonlEventLog {
    /// Create or open a log at `path`. Existing content is kept.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, EventLogError> {
        let p = path.as_ref();
        OpenOptions::new().create(true).append(true).open(p)?;
        Ok(Self { path: p.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a payload; returns the id it was written with.
    pub fn append<T: Serialize>(
        &self,
        id: EventId,
        ts_ms: u64,
        payload: &T,
    ) -> Result<EventId, EventLogError> {
        let mut file = OpenOptions::new().append(true).open(&self.path)?;
        let rec = EventRecord { id, ts_ms, payload };
        let mut line = serde_json::to_vec(&rec)?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.flush()?;
        Ok(id)
    }

    /// Append several records with one open/flush. Returns how many were written.
    pub fn append_batch<'a, T, I>(&self, records: I) -> Result<usize, EventLogError>
    where
        T: Serialize + 'a,
        I: IntoIterator<Item = (EventId, u64, &'a T)>,
    {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let mut w = BufWriter::new(file);
        let mut n = 0;
        for (id, ts_ms, payload) in records {
            serde_json::to_writer(&mut w, &EventRecord { id, ts_ms, payload })?;
            w.write_all(b"\n")?;
            n += 1;
        }
        w.flush()?;
        Ok(n)
    }

    /// Read events with id in [start, end) (half-open range).
    pub fn read_range<T: for<'de> Deserialize<'de>>(
        &self,
        start: EventId,
        end: EventId,
    ) -> Result<Vec<EventRecord<T>>, EventLogError> {
        let mut out = self.read_all()?;
        out.retain(|rec: &EventRecord<T>| rec.id >= start && rec.id < end);
        Ok(out)
    }

    /// Highest id already in the log, `None` when it is empty. Writers that reopen a log
    /// continue numbering after this.
    pub fn last_id(&self) -> Result<Option<EventId>, EventLogError> {
        #[derive(Deserialize)]
        struct IdOnly {
            id: EventId,
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut last: Option<EventId> = None;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let rec: IdOnly = serde_json::from_str(&line)?;
            last = Some(last.map_or(rec.id, |l| l.max(rec.id)));
        }
        Ok(last)
    }

    /// Read every record in file order. Blank lines are skipped.
    pub fn read_all<T: for<'de> Deserialize<'de>>(
        &self,
    ) -> Result<Vec<EventRecord<T>>, EventLogError> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut out = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            out.push(serde_json::from_str(&line)?);
        }
        Ok(out)
    }
}
