//! Event models.
//!
//! A model owns the interpretation of one leading MCV byte: it announces
//! itself (`probe`), allocates channels and state (`create`), wires
//! combinators and timeline exports (`connect`), and then consumes decoded
//! events one at a time (`event`). Models communicate with the rest of the
//! engine only through channels and the [`System`] topology, so everything
//! downstream of an event is an ordinary propagation round.
//!
//! Events whose model is missing from the registry, or whose model probed
//! itself out, fail the run. Cumulative state means a skipped event would
//! silently desynchronize every later row.

use std::collections::HashMap;

use thiserror::Error;
use tracing::debug;

use crate::bay::{Bay, BayError, ChanId};
use crate::config::Options;
use crate::event::{Mcv, PayloadError};
use crate::mux::MuxError;
use crate::player::PlayerEv;
use crate::sort::SortError;
use crate::system::{System, SystemError, ThreadState};
use crate::task::TaskError;
use crate::timeline::EmitPolicy;

pub mod spool;
pub mod tasks;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("no model for event {mcv}")]
    UnknownModel { mcv: Mcv },
    #[error("model {model} is present but this trace never announces it (event {mcv})")]
    DisabledModel { model: &'static str, mcv: Mcv },
    #[error("model byte {byte:?} registered twice")]
    DuplicateModel { byte: char },
    #[error("model {model} does not understand event {mcv}")]
    UnknownEvent { model: &'static str, mcv: Mcv },
    #[error("bad payload for event {mcv}")]
    Payload {
        mcv: Mcv,
        #[source]
        source: PayloadError,
    },
    #[error("thread {thread}: cannot {op} from state {state:?}")]
    ThreadTransition {
        thread: String,
        op: &'static str,
        state: ThreadState,
    },
    #[error("thread {thread}: {op} needs the thread running, found {state:?}")]
    ThreadNotRunning {
        thread: String,
        op: &'static str,
        state: ThreadState,
    },
    #[error("model {model} needs model {needs} in the same trace")]
    MissingDependency {
        model: &'static str,
        needs: &'static str,
    },
    #[error("{what} has no channels wired")]
    Unwired { what: String },
    #[error("thread {thread} is not bound to a cpu")]
    Unbound { thread: String },
    #[error("thread {thread}: {source}")]
    Task {
        thread: String,
        #[source]
        source: TaskError,
    },
    #[error(transparent)]
    Bay(#[from] BayError),
    #[error(transparent)]
    Mux(#[from] MuxError),
    #[error(transparent)]
    Sort(#[from] SortError),
    #[error(transparent)]
    System(#[from] SystemError),
}

impl ModelError {
    pub(crate) fn payload(mcv: Mcv) -> impl FnOnce(PayloadError) -> ModelError {
        move |source| ModelError::Payload { mcv, source }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Leading MCV byte this model claims.
    pub byte: u8,
    pub name: &'static str,
}

/// Which timeline file an export lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportTarget {
    Cpu,
    Thread,
}

/// One timeline registration requested during `connect`. The driver binds
/// these to the sinks once every model is wired.
#[derive(Debug, Clone, Copy)]
pub struct Export {
    pub target: ExportTarget,
    pub row: u32,
    pub ty: u32,
    pub chan: ChanId,
    pub policy: EmitPolicy,
}

/// Context for the setup hooks.
pub struct SetupCtx<'a> {
    pub system: &'a mut System,
    pub bay: &'a mut Bay,
    pub options: &'a Options,
    pub exports: &'a mut Vec<Export>,
}

/// Context for the event hook.
pub struct EvCtx<'a> {
    pub system: &'a mut System,
    pub bay: &'a mut Bay,
    pub options: &'a Options,
    /// Global index of the thread owning the firing stream.
    pub thread: usize,
}

pub trait Model {
    fn info(&self) -> ModelInfo;

    /// Whether the loaded trace announces this model on any stream.
    fn probe(&mut self, ctx: &mut SetupCtx) -> Result<bool, ModelError>;

    fn create(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError>;

    fn connect(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError>;

    fn event(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError>;

    /// End-of-trace diagnostics, after the last event has settled.
    fn finish(&mut self, system: &System) -> Result<(), ModelError> {
        let _ = system;
        Ok(())
    }
}

struct Entry {
    model: Box<dyn Model>,
    enabled: bool,
}

/// Model dispatch table keyed by the MCV model byte.
#[derive(Default)]
pub struct Registry {
    entries: Vec<Entry>,
    by_byte: HashMap<u8, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Registry with the in-crate models.
    pub fn builtin() -> Result<Self, ModelError> {
        let mut reg = Registry::new();
        reg.add(Box::new(spool::SpoolModel::new()))?;
        reg.add(Box::new(tasks::TasksModel::new()))?;
        Ok(reg)
    }

    pub fn add(&mut self, model: Box<dyn Model>) -> Result<(), ModelError> {
        let byte = model.info().byte;
        if self.by_byte.contains_key(&byte) {
            return Err(ModelError::DuplicateModel { byte: byte as char });
        }
        self.by_byte.insert(byte, self.entries.len());
        self.entries.push(Entry {
            model,
            enabled: false,
        });
        Ok(())
    }

    pub fn is_enabled(&self, byte: u8) -> bool {
        self.by_byte
            .get(&byte)
            .is_some_and(|&i| self.entries[i].enabled)
    }

    /// Asks every model whether the trace concerns it. Only enabled models
    /// take part in the later stages.
    pub fn probe(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError> {
        for entry in &mut self.entries {
            entry.enabled = entry.model.probe(ctx)?;
            debug!(
                model = entry.model.info().name,
                enabled = entry.enabled,
                "probed"
            );
        }
        Ok(())
    }

    pub fn create(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError> {
        for entry in self.entries.iter_mut().filter(|e| e.enabled) {
            entry.model.create(ctx)?;
        }
        Ok(())
    }

    pub fn connect(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError> {
        for entry in self.entries.iter_mut().filter(|e| e.enabled) {
            entry.model.connect(ctx)?;
        }
        Ok(())
    }

    /// Routes one decoded event to its model.
    pub fn event(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let byte = ev.mcv.model();
        let Some(&i) = self.by_byte.get(&byte) else {
            return Err(ModelError::UnknownModel { mcv: ev.mcv });
        };
        let entry = &mut self.entries[i];
        if !entry.enabled {
            return Err(ModelError::DisabledModel {
                model: entry.model.info().name,
                mcv: ev.mcv,
            });
        }
        entry.model.event(ctx, ev)
    }

    pub fn finish(&mut self, system: &System) -> Result<(), ModelError> {
        for entry in self.entries.iter_mut().filter(|e| e.enabled) {
            entry.model.finish(system)?;
        }
        Ok(())
    }
}
