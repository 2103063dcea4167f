//! Append-only training corpus (JSON lines).

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CorpusError;
use crate::live::types::MatchId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingExample {
    pub match_id: MatchId,
    pub features: Vec<f64>,
    pub radiant_win: bool,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug)]
enum Backend {
    File(PathBuf),
    Memory(Vec<TrainingExample>),
}

#[derive(Debug)]
struct Inner {
    backend: Backend,
    /// One example per concluded match.
    seen: HashSet<MatchId>,
    rows: usize,
}

/// Shared handle; clones point at the same corpus.
#[derive(Debug, Clone)]
pub struct TrainingCorpus {
    inner: Arc<Mutex<Inner>>,
}

impl TrainingCorpus {
    /// Open (or create) a JSONL corpus at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CorpusError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| CorpusError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        let existing = if path.exists() { read_lines(&path)? } else { Vec::new() };
        let seen = existing.iter().map(|e| e.match_id.clone()).collect();
        Ok(Self {
            inner: Arc::new(Mutex::new(Inner {
                backend: Backend::File(path),
                seen,
                rows: existing.len(),
            })),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                backend: Backend::Memory(Vec::new()),
                seen: HashSet::new(),
                rows: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append one example. Returns `false` when the match already has one,
    /// whatever its collection time.
    pub fn append(&self, example: &TrainingExample) -> Result<bool, CorpusError> {
        let mut inner = self.lock();
        if inner.seen.contains(&example.match_id) {
            return Ok(false);
        }
        match &mut inner.backend {
            Backend::Memory(rows) => rows.push(example.clone()),
            Backend::File(path) => {
                let mut line = serde_json::to_string(example)?;
                line.push('\n');
                let io_err = |source| CorpusError::Io { path: path.display().to_string(), source };
                let mut f = OpenOptions::new().create(true).append(true).open(&*path).map_err(io_err)?;
                f.write_all(line.as_bytes()).map_err(io_err)?;
            }
        }
        inner.seen.insert(example.match_id.clone());
        inner.rows += 1;
        Ok(true)
    }

    pub fn load_all(&self) -> Result<Vec<TrainingExample>, CorpusError> {
        let inner = self.lock();
        match &inner.backend {
            Backend::Memory(rows) => Ok(rows.clone()),
            Backend::File(path) if path.exists() => read_lines(path),
            Backend::File(_) => Ok(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().rows
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn read_lines(path: &Path) -> Result<Vec<TrainingExample>, CorpusError> {
    let io_err = |source| CorpusError::Io { path: path.display().to_string(), source };
    let reader = BufReader::new(File::open(path).map_err(io_err)?);
    let mut out = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line.map_err(io_err)?;
        if line.trim().is_empty() {
            continue;
        }
        let ex = serde_json::from_str(&line).map_err(|source| CorpusError::Corrupt { line: i + 1, source })?;
        out.push(ex);
    }
    Ok(out)
}
