//! Per-host clock offset table.
//!
//! Hosts trace with their own monotonic clocks. A synchronization run
//! measures each host's offset against a reference and stores it as a plain
//! text table, one `hostname offset_ns` pair per line. Lines starting with
//! `#` and blank lines are ignored.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClkoffError {
    #[error("cannot read clock offset table {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("clock offset table line {line_no} is malformed: {line:?}")]
    Parse { line_no: usize, line: String },
    #[error("clock offset table line {line_no} repeats host {host:?}")]
    DuplicateHost { line_no: usize, host: String },
}

/// Parsed offset table, host name to signed nanosecond correction.
#[derive(Debug, Clone, Default)]
pub struct ClockTable {
    offsets: BTreeMap<String, i64>,
}

impl ClockTable {
    pub fn load(path: &Path) -> Result<Self, ClkoffError> {
        let text = std::fs::read_to_string(path).map_err(|source| ClkoffError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ClkoffError> {
        let mut offsets = BTreeMap::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(host), Some(off)) = (fields.next(), fields.next()) else {
                return Err(ClkoffError::Parse {
                    line_no,
                    line: raw.to_string(),
                });
            };
            if fields.next().is_some() {
                return Err(ClkoffError::Parse {
                    line_no,
                    line: raw.to_string(),
                });
            }
            let offset_ns: i64 = off.parse().map_err(|_| ClkoffError::Parse {
                line_no,
                line: raw.to_string(),
            })?;
            if offsets.insert(host.to_string(), offset_ns).is_some() {
                return Err(ClkoffError::DuplicateHost {
                    line_no,
                    host: host.to_string(),
                });
            }
        }
        Ok(ClockTable { offsets })
    }

    pub fn offset(&self, host: &str) -> Option<i64> {
        self.offsets.get(host).copied()
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
