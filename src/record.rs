//! Trace writer.
//!
//! Emits the same layout [`crate::trace`] loads: host directories with
//! `host.json`, stream files with the `SPUL` header, and per-thread
//! metadata sidecars. The sidecar model list is derived from the events
//! actually recorded, so it cannot drift from the stream contents.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::event::{self, EventError, Mcv};
use crate::trace::{HostMeta, ThreadMeta, STREAM_FILE_HEADER_LEN, STREAM_MAGIC, STREAM_VERSION};

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("cannot write {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Event(#[from] EventError),
    #[error("unknown host {host:?}; declare it before adding threads")]
    UnknownHost { host: String },
}

/// In-memory event emitter for one thread.
#[derive(Debug, Default)]
pub struct StreamRecorder {
    events: Vec<u8>,
    models: BTreeSet<u8>,
}

impl StreamRecorder {
    pub fn new() -> Self {
        StreamRecorder::default()
    }

    /// Appends one event. Jumbo framing kicks in automatically for payloads
    /// beyond the inline limit.
    pub fn event(&mut self, clock: u64, mcv: &str, payload: &[u8]) -> Result<(), RecordError> {
        let mcv: Mcv = mcv.parse()?;
        event::encode_into(&mut self.events, clock, mcv, payload)?;
        self.models.insert(mcv.model());
        Ok(())
    }

    /// Raw event region without the stream file header, for in-memory
    /// replay through [`crate::stream::Stream::from_events`].
    pub fn into_events(self) -> Vec<u8> {
        self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn file_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(STREAM_FILE_HEADER_LEN + self.events.len());
        out.extend_from_slice(&STREAM_MAGIC);
        out.extend_from_slice(&STREAM_VERSION.to_le_bytes());
        out.extend_from_slice(&self.events);
        out
    }

    fn model_tags(&self) -> Vec<String> {
        self.models
            .iter()
            .map(|&b| (b as char).to_string())
            .collect()
    }
}

/// Writes a whole trace directory.
#[derive(Debug)]
pub struct TraceRecorder {
    root: PathBuf,
    hosts: BTreeSet<String>,
}

impl TraceRecorder {
    pub fn create(root: impl Into<PathBuf>) -> Result<Self, RecordError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| RecordError::Io {
            path: root.clone(),
            source,
        })?;
        Ok(TraceRecorder {
            root,
            hosts: BTreeSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Declares a host and writes its topology metadata.
    pub fn host(&mut self, name: &str, cpus: u32) -> Result<(), RecordError> {
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir).map_err(|source| RecordError::Io {
            path: dir.clone(),
            source,
        })?;
        write_json(&dir.join("host.json"), &HostMeta { cpus })?;
        self.hosts.insert(name.to_string());
        Ok(())
    }

    /// Writes one thread's stream file and sidecar under a declared host.
    pub fn thread(
        &mut self,
        host: &str,
        tid: u32,
        recorder: StreamRecorder,
    ) -> Result<(), RecordError> {
        if !self.hosts.contains(host) {
            return Err(RecordError::UnknownHost {
                host: host.to_string(),
            });
        }
        let dir = self.root.join(host);
        let spool = dir.join(format!("thread.{tid}.spool"));
        std::fs::write(&spool, recorder.file_bytes()).map_err(|source| RecordError::Io {
            path: spool.clone(),
            source,
        })?;
        write_json(
            &dir.join(format!("thread.{tid}.json")),
            &ThreadMeta {
                tid,
                models: recorder.model_tags(),
            },
        )
    }

    /// Writes a clock offset table next to the trace, returning its path.
    pub fn clock_offsets(&self, entries: &[(&str, i64)]) -> Result<PathBuf, RecordError> {
        let path = self.root.join("clock-offsets.txt");
        let mut text = String::new();
        for (host, offset_ns) in entries {
            text.push_str(&format!("{host} {offset_ns}\n"));
        }
        std::fs::write(&path, text).map_err(|source| RecordError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<(), RecordError> {
    let text = serde_json::to_string_pretty(value).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidData, source),
    })?;
    std::fs::write(path, text).map_err(|source| RecordError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Step, Stream, StreamIdent};
    use crate::trace::Trace;
    use tempfile::TempDir;

    #[test]
    fn recorded_events_replay_in_memory() {
        let mut rec = StreamRecorder::new();
        rec.event(10, "SHx", &7u32.to_le_bytes()).unwrap();
        rec.event(20, "SHe", &[]).unwrap();
        let mut stream = Stream::from_events(StreamIdent::new("mem", 0), rec.into_events());
        assert_eq!(stream.step().unwrap(), Step::Advanced);
        let ev = stream.current().unwrap();
        assert_eq!(ev.clock, 10);
        assert_eq!(ev.mcv.to_string(), "SHx");
        assert_eq!(ev.payload, &7u32.to_le_bytes());
        assert_eq!(stream.step().unwrap(), Step::Advanced);
        assert_eq!(stream.step().unwrap(), Step::Done);
    }

    #[test]
    fn written_trace_loads_back() {
        let dir = TempDir::new().unwrap();
        let mut rec = TraceRecorder::create(dir.path()).unwrap();
        rec.host("alpha", 4).unwrap();
        let mut s = StreamRecorder::new();
        s.event(1, "SHc", &[]).unwrap();
        s.event(2, "TTc", &[]).unwrap();
        rec.thread("alpha", 55, s).unwrap();
        let trace = Trace::load(dir.path()).unwrap();
        assert_eq!(trace.hosts[0].ncpus, 4);
        assert_eq!(trace.threads[0].tid, 55);
        assert_eq!(trace.threads[0].models, vec![b'S', b'T']);
    }

    #[test]
    fn threads_require_a_declared_host() {
        let dir = TempDir::new().unwrap();
        let mut rec = TraceRecorder::create(dir.path()).unwrap();
        let err = rec.thread("ghost", 1, StreamRecorder::new()).unwrap_err();
        assert!(matches!(err, RecordError::UnknownHost { .. }));
    }

    #[test]
    fn offset_table_parses_back() {
        let dir = TempDir::new().unwrap();
        let rec = TraceRecorder::create(dir.path()).unwrap();
        let path = rec.clock_offsets(&[("alpha", 25), ("beta", -3)]).unwrap();
        let table = crate::clkoff::ClockTable::load(&path).unwrap();
        assert_eq!(table.offset("alpha"), Some(25));
        assert_eq!(table.offset("beta"), Some(-3));
    }
}
