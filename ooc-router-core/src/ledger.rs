//! # ledger: durable JSONL move history
//!
//! [`JsonlLedger`] is the production [`MoveLedger`]. Every completed move is
//! one `moved` line; every revert is one `reverted` line referencing the
//! original move. Lines are never rewritten, so the file is a faithful
//! history and the current status of a move is derived by replaying it.
//!
//! Each write is flushed with `sync_data` before the call returns. On open the
//! file is replayed into an in-memory index; a torn final line (a crash in the
//! middle of a write) is truncated away, any other malformed line is reported
//! as [`LedgerError::Corrupt`].

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::contract::{MoveId, MoveLedger, MoveRecord, MoveStatus, NewMove};
use crate::error::LedgerError;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum LedgerLine {
    Moved(MoveRecord),
    Reverted { move_id: MoveId, at: DateTime<Utc> },
}

#[derive(Debug, Default)]
struct Index {
    records: Vec<MoveRecord>,
    by_id: HashMap<MoveId, usize>,
    by_job: HashMap<String, Vec<usize>>,
}

impl Index {
    fn insert(&mut self, record: MoveRecord) {
        let position = self.records.len();
        self.by_id.insert(record.move_id, position);
        if let Some(job) = &record.job_id {
            self.by_job.entry(job.clone()).or_default().push(position);
        }
        self.records.push(record);
    }

    fn get(&self, move_id: MoveId) -> Option<&MoveRecord> {
        self.by_id.get(&move_id).map(|&i| &self.records[i])
    }

    fn mark_reverted(&mut self, move_id: MoveId, at: DateTime<Utc>) -> Option<&MoveRecord> {
        let &i = self.by_id.get(&move_id)?;
        let record = &mut self.records[i];
        record.status = MoveStatus::Reverted;
        record.reverted_at = Some(at);
        Some(record)
    }
}

#[derive(Debug)]
struct Inner {
    path: PathBuf,
    writer: Mutex<File>,
    index: RwLock<Index>,
}

/// Append-only JSON Lines ledger. Cheap to clone; clones share one writer.
#[derive(Debug, Clone)]
pub struct JsonlLedger {
    inner: Arc<Inner>,
}

impl JsonlLedger {
    /// Open (or create) the ledger at `path` and replay it.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        tokio::task::spawn_blocking(move || Self::open_blocking(path))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    /// Blocking variant of [`JsonlLedger::open`].
    pub fn open_blocking(path: PathBuf) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| LedgerError::Write {
                path: path.clone(),
                source,
            })?;
        }

        let index = replay(&path)?;
        let writer = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LedgerError::Write {
                path: path.clone(),
                source,
            })?;

        info!(
            path = %path.display(),
            records = index.records.len(),
            "move ledger opened"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                path,
                writer: Mutex::new(writer),
                index: RwLock::new(index),
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        T: Send + 'static,
        F: FnOnce(&Inner) -> Result<T, LedgerError> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        tokio::task::spawn_blocking(move || f(&inner))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    fn read_index<T>(&self, f: impl FnOnce(&Index) -> T) -> T {
        let index = self.inner.index.read().unwrap_or_else(PoisonError::into_inner);
        f(&index)
    }
}

impl Inner {
    /// Write one line durably. A failed write is rolled back to the previous
    /// length so a later append does not land after a torn line.
    fn write_line(&self, file: &mut File, line: &LedgerLine) -> Result<(), LedgerError> {
        let mut bytes = serde_json::to_vec(line).map_err(LedgerError::Encode)?;
        bytes.push(b'\n');

        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };
        let before = file.metadata().map_err(write_err)?.len();
        let result = file.write_all(&bytes).and_then(|()| file.sync_data());
        if let Err(source) = result {
            if let Err(rollback) = file.set_len(before) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "could not roll back partial ledger write"
                );
            }
            return Err(write_err(source));
        }
        Ok(())
    }
}

fn replay(path: &Path) -> Result<Index, LedgerError> {
    let mut index = Index::default();
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(source) => {
            return Err(LedgerError::Read {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let read_err = |source| LedgerError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = BufReader::new(file);
    let mut offset: u64 = 0;
    let mut line_no = 0;
    let mut unterminated = false;
    let mut buf = String::new();
    loop {
        buf.clear();
        let read = reader.read_line(&mut buf).map_err(read_err)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let complete = buf.ends_with('\n');
        let text = buf.trim();
        if text.is_empty() {
            offset += read as u64;
            continue;
        }

        match serde_json::from_str::<LedgerLine>(text) {
            Ok(LedgerLine::Moved(record)) => {
                index.insert(record);
                unterminated = !complete;
            }
            Ok(LedgerLine::Reverted { move_id, at }) => {
                if index.mark_reverted(move_id, at).is_none() {
                    warn!(%move_id, line = line_no, "revert entry for unknown move ignored");
                }
                unterminated = !complete;
            }
            Err(_) if !complete => {
                warn!(
                    path = %path.display(),
                    line = line_no,
                    "truncating torn final ledger line"
                );
                let file = OpenOptions::new()
                    .write(true)
                    .open(path)
                    .map_err(|source| LedgerError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
                file.set_len(offset).map_err(|source| LedgerError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
                break;
            }
            Err(source) => {
                return Err(LedgerError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    source,
                })
            }
        }
        offset += read as u64;
    }

    if unterminated {
        terminate_last_line(path)?;
    }

    debug!(path = %path.display(), lines = line_no, "ledger replayed");
    Ok(index)
}

/// The final entry parsed but its newline never reached the disk; restore it
/// so the next append starts on a fresh line.
fn terminate_last_line(path: &Path) -> Result<(), LedgerError> {
    warn!(path = %path.display(), "terminating unterminated final ledger line");
    let write_err = |source| LedgerError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut file = OpenOptions::new().append(true).open(path).map_err(write_err)?;
    file.write_all(b"\n").and_then(|()| file.sync_data()).map_err(write_err)
}

#[async_trait]
impl MoveLedger for JsonlLedger {
    async fn append(&self, entry: NewMove) -> Result<MoveRecord, LedgerError> {
        self.blocking(move |inner| {
            let record = MoveRecord {
                move_id: MoveId::new(),
                pipeline: entry.pipeline,
                source_path: entry.source_path,
                destination_path: entry.destination_path,
                item_kind: entry.item_kind,
                timestamp: Utc::now(),
                status: MoveStatus::Completed,
                job_id: entry.job_id,
                reverted_at: None,
            };

            let mut file = inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
            inner.write_line(&mut file, &LedgerLine::Moved(record.clone()))?;

            inner
                .index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(record.clone());
            debug!(move_id = %record.move_id, "ledger entry appended");
            Ok(record)
        })
        .await
    }

    async fn find_by_job(&self, job_id: &str) -> Result<Vec<MoveRecord>, LedgerError> {
        Ok(self.read_index(|index| {
            index
                .by_job
                .get(job_id)
                .map(|positions| positions.iter().map(|&i| index.records[i].clone()).collect())
                .unwrap_or_default()
        }))
    }

    async fn get(&self, move_id: MoveId) -> Result<MoveRecord, LedgerError> {
        self.read_index(|index| index.get(move_id).cloned())
            .ok_or(LedgerError::NotFound(move_id))
    }

    async fn records(&self) -> Result<Vec<MoveRecord>, LedgerError> {
        Ok(self.read_index(|index| index.records.clone()))
    }

    async fn mark_reverted(&self, move_id: MoveId) -> Result<MoveRecord, LedgerError> {
        self.blocking(move |inner| {
            // Holding the writer lock serialises the status check with the write.
            let mut file = inner.writer.lock().unwrap_or_else(PoisonError::into_inner);
            {
                let index = inner.index.read().unwrap_or_else(PoisonError::into_inner);
                match index.get(move_id) {
                    None => return Err(LedgerError::NotFound(move_id)),
                    Some(r) if r.status == MoveStatus::Reverted => {
                        return Err(LedgerError::AlreadyReverted(move_id))
                    }
                    Some(_) => {}
                }
            }

            let at = Utc::now();
            inner.write_line(&mut file, &LedgerLine::Reverted { move_id, at })?;
            let mut index = inner.index.write().unwrap_or_else(PoisonError::into_inner);
            index
                .mark_reverted(move_id, at)
                .cloned()
                .ok_or(LedgerError::NotFound(move_id))
        })
        .await
    }
}
