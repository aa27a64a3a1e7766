//! Replay-time topology: hosts, cpus and threads.
//!
//! Built once from the loaded trace metadata, then mutated by models as
//! events arrive. Each host gets one extra virtual cpu at the end of its
//! cpu range; threads whose affinity is unknown or unbound are accounted
//! there instead of on a real cpu.

use thiserror::Error;

use crate::bay::ChanId;
use crate::stream::StreamIdent;
use crate::trace::Trace;

/// Thread lifecycle states, with the integers used on timelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Unknown,
    Running,
    Cooling,
    Warming,
    Paused,
    Dead,
}

impl ThreadState {
    pub fn as_int(self) -> i64 {
        match self {
            ThreadState::Unknown => 0,
            ThreadState::Running => 1,
            ThreadState::Cooling => 2,
            ThreadState::Warming => 3,
            ThreadState::Paused => 4,
            ThreadState::Dead => 5,
        }
    }

    pub fn is_running(self) -> bool {
        self == ThreadState::Running
    }

    /// Out of Unknown and not yet Dead.
    pub fn is_alive(self) -> bool {
        matches!(
            self,
            ThreadState::Running | ThreadState::Cooling | ThreadState::Warming | ThreadState::Paused
        )
    }
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error("host {host}: cpu index {index} outside its {ncpus} cpus")]
    UnknownCpu {
        host: String,
        index: i32,
        ncpus: u32,
    },
    #[error("no thread for stream {stream}")]
    UnknownThread { stream: usize },
}

/// Channels the thread lifecycle model publishes per thread.
#[derive(Debug, Clone, Copy)]
pub struct ThreadChans {
    pub state: ChanId,
    pub cpu: ChanId,
}

/// Channels the thread lifecycle model publishes per cpu.
#[derive(Debug, Clone, Copy)]
pub struct CpuChans {
    pub nrunning: ChanId,
    pub running_tid: ChanId,
}

#[derive(Debug)]
pub struct SysHost {
    pub name: String,
    /// Global indices of this host's real cpus, in host cpu order.
    pub cpus: Vec<usize>,
    /// Global index of this host's virtual cpu.
    pub vcpu: usize,
    /// Global indices of this host's threads.
    pub threads: Vec<usize>,
}

#[derive(Debug)]
pub struct SysCpu {
    pub gindex: usize,
    pub host: usize,
    /// Index within the host, or none for the virtual cpu.
    pub host_index: Option<u32>,
    /// Threads currently in Running state on this cpu.
    pub running: Vec<usize>,
    pub chans: Option<CpuChans>,
}

impl SysCpu {
    pub fn is_virtual(&self) -> bool {
        self.host_index.is_none()
    }
}

#[derive(Debug)]
pub struct SysThread {
    pub gindex: usize,
    pub ident: StreamIdent,
    pub host: usize,
    pub tid: u32,
    pub stream: usize,
    /// Model bytes announced by the stream sidecar.
    pub models: Vec<u8>,
    pub state: ThreadState,
    /// Global index of the cpu this thread is bound to.
    pub cpu: Option<usize>,
    pub chans: Option<ThreadChans>,
}

#[derive(Debug)]
pub struct System {
    hosts: Vec<SysHost>,
    cpus: Vec<SysCpu>,
    threads: Vec<SysThread>,
    stream_thread: Vec<usize>,
}

impl System {
    pub fn new(trace: &Trace) -> Self {
        let mut hosts = Vec::with_capacity(trace.hosts.len());
        let mut cpus = Vec::new();
        for (hi, host) in trace.hosts.iter().enumerate() {
            let mut real = Vec::with_capacity(host.ncpus as usize);
            for ci in 0..host.ncpus {
                real.push(cpus.len());
                cpus.push(SysCpu {
                    gindex: cpus.len(),
                    host: hi,
                    host_index: Some(ci),
                    running: Vec::new(),
                    chans: None,
                });
            }
            let vcpu = cpus.len();
            cpus.push(SysCpu {
                gindex: vcpu,
                host: hi,
                host_index: None,
                running: Vec::new(),
                chans: None,
            });
            hosts.push(SysHost {
                name: host.name.clone(),
                cpus: real,
                vcpu,
                threads: Vec::new(),
            });
        }

        let mut threads = Vec::with_capacity(trace.threads.len());
        let mut stream_thread = vec![usize::MAX; trace.nstreams()];
        for (ti, thread) in trace.threads.iter().enumerate() {
            stream_thread[thread.stream] = ti;
            hosts[thread.host].threads.push(ti);
            threads.push(SysThread {
                gindex: ti,
                ident: StreamIdent::new(hosts[thread.host].name.clone(), thread.tid),
                host: thread.host,
                tid: thread.tid,
                stream: thread.stream,
                models: thread.models.clone(),
                state: ThreadState::Unknown,
                cpu: None,
                chans: None,
            });
        }
        System {
            hosts,
            cpus,
            threads,
            stream_thread,
        }
    }

    pub fn hosts(&self) -> &[SysHost] {
        &self.hosts
    }

    pub fn cpus(&self) -> &[SysCpu] {
        &self.cpus
    }

    pub fn threads(&self) -> &[SysThread] {
        &self.threads
    }

    pub fn ncpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn nthreads(&self) -> usize {
        self.threads.len()
    }

    pub fn thread(&self, gindex: usize) -> &SysThread {
        &self.threads[gindex]
    }

    pub fn thread_mut(&mut self, gindex: usize) -> &mut SysThread {
        &mut self.threads[gindex]
    }

    pub fn cpu(&self, gindex: usize) -> &SysCpu {
        &self.cpus[gindex]
    }

    pub fn cpu_mut(&mut self, gindex: usize) -> &mut SysCpu {
        &mut self.cpus[gindex]
    }

    /// Thread that owns a given stream.
    pub fn thread_of_stream(&self, stream: usize) -> Result<usize, SystemError> {
        match self.stream_thread.get(stream) {
            Some(&ti) if ti != usize::MAX => Ok(ti),
            _ => Err(SystemError::UnknownThread { stream }),
        }
    }

    /// Resolves a host-local cpu index from an event payload. `-1` means
    /// unbound and maps to the host's virtual cpu.
    pub fn resolve_cpu(&self, host: usize, index: i32) -> Result<usize, SystemError> {
        let h = &self.hosts[host];
        if index == -1 {
            return Ok(h.vcpu);
        }
        usize::try_from(index)
            .ok()
            .and_then(|i| h.cpus.get(i).copied())
            .ok_or_else(|| SystemError::UnknownCpu {
                host: h.name.clone(),
                index,
                ncpus: h.cpus.len() as u32,
            })
    }
}
