//! On-disk trace layout and loading.
//!
//! A trace is a directory tree with one subdirectory per host:
//!
//! ```text
//! trace/
//!   alpha/
//!     host.json            topology metadata, required
//!     thread.301.spool     event stream of thread 301
//!     thread.301.json      stream metadata sidecar, required
//!   beta/
//!     ...
//! ```
//!
//! Stream files start with an 8-byte header (magic `SPUL`, then a u32
//! little-endian format version); everything after it is the event region
//! handed to [`Stream`]. Hosts and threads are loaded in sorted order so a
//! trace always produces the same stream numbering.

use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::clkoff::ClockTable;
use crate::stream::{Stream, StreamIdent};

pub const STREAM_MAGIC: [u8; 4] = *b"SPUL";
pub const STREAM_VERSION: u32 = 1;
pub const STREAM_FILE_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("cannot read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("trace root {path} is not a directory")]
    NotADirectory { path: PathBuf },
    #[error("{path} is not a stream file (bad magic)")]
    BadMagic { path: PathBuf },
    #[error("{path} has unsupported stream version {version}")]
    BadVersion { path: PathBuf, version: u32 },
    #[error("{path} is shorter than a stream header ({len} bytes)")]
    TruncatedFile { path: PathBuf, len: usize },
    #[error("stream file name {path} does not match thread.<tid>.spool")]
    BadStreamName { path: PathBuf },
    #[error("{path} is malformed")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("missing metadata sidecar {path}")]
    MissingSidecar { path: PathBuf },
    #[error("missing host metadata {path}")]
    MissingHostMeta { path: PathBuf },
    #[error("{path}: sidecar tid {meta_tid} does not match file name tid {file_tid}")]
    TidMismatch {
        path: PathBuf,
        file_tid: u32,
        meta_tid: u32,
    },
    #[error("{path}: model tag {tag:?} is not a single ascii character")]
    BadModelTag { path: PathBuf, tag: String },
    #[error("trace {path} contains no streams")]
    NoStreams { path: PathBuf },
    #[error("no clock offset for host {host:?}")]
    MissingOffset { host: String },
    #[error(transparent)]
    Stream(#[from] crate::stream::StreamError),
}

/// Sidecar contents for one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMeta {
    pub tid: u32,
    /// Model tags present in this stream, e.g. `["S", "T"]`.
    #[serde(default)]
    pub models: Vec<String>,
}

/// Per-host topology metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostMeta {
    pub cpus: u32,
}

#[derive(Debug)]
pub struct TraceHost {
    pub name: String,
    pub ncpus: u32,
    /// Indices into [`Trace::threads`].
    pub threads: Vec<usize>,
}

#[derive(Debug)]
pub struct TraceThread {
    /// Index into [`Trace::hosts`].
    pub host: usize,
    pub tid: u32,
    /// Model bytes announced by the sidecar.
    pub models: Vec<u8>,
    /// Index of this thread's stream, identical to its own index.
    pub stream: usize,
}

#[derive(Debug)]
pub struct Trace {
    pub root: PathBuf,
    pub hosts: Vec<TraceHost>,
    pub threads: Vec<TraceThread>,
    streams: Vec<Stream>,
}

impl Trace {
    pub fn load(root: &Path) -> Result<Self, TraceError> {
        if !root.is_dir() {
            return Err(TraceError::NotADirectory {
                path: root.to_path_buf(),
            });
        }
        let mut trace = Trace {
            root: root.to_path_buf(),
            hosts: Vec::new(),
            threads: Vec::new(),
            streams: Vec::new(),
        };
        for host_dir in sorted_subdirs(root)? {
            trace.load_host(&host_dir)?;
        }
        if trace.streams.is_empty() {
            return Err(TraceError::NoStreams {
                path: root.to_path_buf(),
            });
        }
        debug!(
            hosts = trace.hosts.len(),
            streams = trace.streams.len(),
            "trace loaded"
        );
        Ok(trace)
    }

    fn load_host(&mut self, dir: &Path) -> Result<(), TraceError> {
        let name = match dir.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_string(),
            None => return Ok(()),
        };
        let meta_path = dir.join("host.json");
        if !meta_path.is_file() {
            return Err(TraceError::MissingHostMeta { path: meta_path });
        }
        let meta: HostMeta = read_json(&meta_path)?;
        let host_idx = self.hosts.len();
        self.hosts.push(TraceHost {
            name: name.clone(),
            ncpus: meta.cpus,
            threads: Vec::new(),
        });

        let mut spools: Vec<(u32, PathBuf)> = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|source| TraceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| TraceError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("spool") {
                continue;
            }
            let tid = parse_spool_tid(&path)?;
            spools.push((tid, path));
        }
        spools.sort_unstable_by_key(|(tid, _)| *tid);

        for (tid, path) in spools {
            let sidecar = dir.join(format!("thread.{tid}.json"));
            if !sidecar.is_file() {
                return Err(TraceError::MissingSidecar { path: sidecar });
            }
            let meta: ThreadMeta = read_json(&sidecar)?;
            if meta.tid != tid {
                return Err(TraceError::TidMismatch {
                    path: sidecar,
                    file_tid: tid,
                    meta_tid: meta.tid,
                });
            }
            let models = parse_model_tags(&sidecar, &meta.models)?;
            let buf = std::fs::read(&path).map_err(|source| TraceError::Io {
                path: path.clone(),
                source,
            })?;
            check_stream_header(&path, &buf)?;
            let idx = self.streams.len();
            self.streams.push(Stream::from_file_buf(
                StreamIdent::new(name.clone(), tid),
                buf,
                STREAM_FILE_HEADER_LEN,
            ));
            self.threads.push(TraceThread {
                host: host_idx,
                tid,
                models,
                stream: idx,
            });
            self.hosts[host_idx].threads.push(idx);
        }
        Ok(())
    }

    /// Applies a synchronization table. Every host in the trace must have an
    /// entry; a partial table silently misordering the merge would be worse
    /// than failing.
    pub fn apply_clock_offsets(&mut self, table: &ClockTable) -> Result<(), TraceError> {
        for host in &self.hosts {
            let offset = table
                .offset(&host.name)
                .ok_or_else(|| TraceError::MissingOffset {
                    host: host.name.clone(),
                })?;
            for &t in &host.threads {
                self.streams[self.threads[t].stream].set_clock_offset(offset)?;
            }
        }
        Ok(())
    }

    /// Marks every stream as tolerating unsorted clocks.
    pub fn mark_unsorted(&mut self) {
        for stream in &mut self.streams {
            stream.set_unsorted(true);
        }
    }

    pub fn nstreams(&self) -> usize {
        self.streams.len()
    }

    pub fn stream(&self, i: usize) -> &Stream {
        &self.streams[i]
    }

    /// Hands the streams over to the player. The topology stays behind.
    pub fn take_streams(&mut self) -> Vec<Stream> {
        std::mem::take(&mut self.streams)
    }
}

fn sorted_subdirs(root: &Path) -> Result<Vec<PathBuf>, TraceError> {
    let entries = std::fs::read_dir(root).map_err(|source| TraceError::Io {
        path: root.to_path_buf(),
        source,
    })?;
    let mut dirs = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| TraceError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort_unstable();
    Ok(dirs)
}

fn parse_spool_tid(path: &Path) -> Result<u32, TraceError> {
    let bad = || TraceError::BadStreamName {
        path: path.to_path_buf(),
    };
    let stem = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(bad)?;
    let tid = stem
        .strip_prefix("thread.")
        .and_then(|s| s.strip_suffix(".spool"))
        .ok_or_else(bad)?;
    tid.parse().map_err(|_| bad())
}

fn parse_model_tags(path: &Path, tags: &[String]) -> Result<Vec<u8>, TraceError> {
    let mut models = Vec::with_capacity(tags.len());
    for tag in tags {
        let bytes = tag.as_bytes();
        if bytes.len() != 1 || !bytes[0].is_ascii_graphic() {
            return Err(TraceError::BadModelTag {
                path: path.to_path_buf(),
                tag: tag.clone(),
            });
        }
        models.push(bytes[0]);
    }
    Ok(models)
}

fn check_stream_header(path: &Path, buf: &[u8]) -> Result<(), TraceError> {
    if buf.len() < STREAM_FILE_HEADER_LEN {
        return Err(TraceError::TruncatedFile {
            path: path.to_path_buf(),
            len: buf.len(),
        });
    }
    if buf[..4] != STREAM_MAGIC {
        return Err(TraceError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&buf[4..8]);
    let version = u32::from_le_bytes(version_bytes);
    if version != STREAM_VERSION {
        return Err(TraceError::BadVersion {
            path: path.to_path_buf(),
            version,
        });
    }
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, TraceError> {
    let text = std::fs::read_to_string(path).map_err(|source| TraceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| TraceError::Metadata {
        path: path.to_path_buf(),
        source,
    })
}
