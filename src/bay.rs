//! Channel registry and two-phase propagation.
//!
//! The bay owns every channel plus the callbacks bound to them. Writes made
//! while the bay is idle (or during the dirty phase) queue the channel on a
//! dirty list; [`Bay::propagate`] then drains that list in three steps:
//!
//!   1. dirty phase: dirty callbacks run and may write further channels,
//!      growing the list until it reaches a fixpoint,
//!   2. emit phase: emit callbacks observe the settled values and may not
//!      write anything,
//!   3. flush: every dirtied channel publishes its value and goes clean.
//!
//! Hook state is segregated from channel state: callbacks receive the
//! [`BayCore`] only, so a running callback can toggle bindings and write
//! channels but can never register new hooks mid-round.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::chan::{Chan, ChanError, WriteOutcome};
use crate::value::Value;

/// Handle to a registered channel. Stays stable for the life of the bay;
/// handles to removed channels turn into errors rather than panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChanId(usize);

impl fmt::Display for ChanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chan#{}", self.0)
    }
}

/// Handle to a hook object added with [`Bay::add_hook`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(usize);

/// Handle to one binding of a hook to a channel and phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CbId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Dirty,
    Emit,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Dirty => write!(f, "dirty"),
            Phase::Emit => write!(f, "emit"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BayState {
    #[default]
    Idle,
    DirtyPhase,
    EmitPhase,
    FlushPhase,
}

impl fmt::Display for BayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BayState::Idle => write!(f, "idle"),
            BayState::DirtyPhase => write!(f, "dirty phase"),
            BayState::EmitPhase => write!(f, "emit phase"),
            BayState::FlushPhase => write!(f, "flush phase"),
        }
    }
}

#[derive(Debug, Error)]
pub enum BayError {
    #[error("channel name {name:?} is already registered")]
    DuplicateName { name: String },
    #[error("unknown channel {id}")]
    Unknown { id: ChanId },
    #[error("unknown callback binding")]
    UnknownCallback { cb: CbId },
    #[error("unknown hook")]
    UnknownHook { hook: HookId },
    #[error("hook fired before being installed")]
    UninstalledHook { hook: HookId },
    #[error("hook installed twice")]
    HookInstalled { hook: HookId },
    #[error("cannot remove dirty channel {name}")]
    RemoveWhileDirty { name: String },
    #[error("write to {chan} during {state}")]
    PhaseWrite { chan: String, state: BayState },
    #[error("propagate while {state}")]
    Busy { state: BayState },
    #[error(transparent)]
    Chan(#[from] ChanError),
    #[error("{phase} callback on {chan} failed")]
    Hook {
        phase: Phase,
        chan: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A callback target. One hook object may be bound to any number of
/// channels, in either phase; `chan` tells it which binding fired.
pub trait BayHook {
    fn fire(&mut self, core: &mut BayCore, chan: ChanId) -> HookResult;

    /// Called once when replay ends, after the last propagation.
    fn finish(&mut self, core: &mut BayCore) -> HookResult {
        let _ = core;
        Ok(())
    }
}

impl<F> BayHook for F
where
    F: FnMut(&mut BayCore, ChanId) -> HookResult,
{
    fn fire(&mut self, core: &mut BayCore, chan: ChanId) -> HookResult {
        self(core, chan)
    }
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    cb: CbId,
    hook: HookId,
}

#[derive(Debug, Default)]
struct ChanBindings {
    dirty: Vec<Binding>,
    emit: Vec<Binding>,
}

impl ChanBindings {
    fn list(&self, phase: Phase) -> &[Binding] {
        match phase {
            Phase::Dirty => &self.dirty,
            Phase::Emit => &self.emit,
        }
    }

    fn list_mut(&mut self, phase: Phase) -> &mut Vec<Binding> {
        match phase {
            Phase::Dirty => &mut self.dirty,
            Phase::Emit => &mut self.emit,
        }
    }
}

/// Channel state reachable from inside a running callback.
#[derive(Debug, Default)]
pub struct BayCore {
    chans: Vec<Option<Chan>>,
    names: HashMap<String, ChanId>,
    dirty: Vec<ChanId>,
    state: BayState,
    cb_enabled: Vec<bool>,
    now: i64,
}

impl BayCore {
    fn slot(&self, id: ChanId) -> Result<&Chan, BayError> {
        self.chans
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(BayError::Unknown { id })
    }

    fn slot_mut(&mut self, id: ChanId) -> Result<&mut Chan, BayError> {
        self.chans
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(BayError::Unknown { id })
    }

    /// Read-only view of a channel, for inspecting kind and policy.
    pub fn chan(&self, id: ChanId) -> Result<&Chan, BayError> {
        self.slot(id)
    }

    pub fn state(&self) -> BayState {
        self.state
    }

    /// Timeline clock of the propagation round in flight.
    pub fn now(&self) -> i64 {
        self.now
    }

    pub fn value(&self, id: ChanId) -> Result<Value, BayError> {
        Ok(self.slot(id)?.value())
    }

    pub fn is_dirty(&self, id: ChanId) -> Result<bool, BayError> {
        Ok(self.slot(id)?.is_dirty())
    }

    pub fn name_of(&self, id: ChanId) -> Result<&str, BayError> {
        Ok(self.slot(id)?.name())
    }

    fn debug_name(&self, id: ChanId) -> String {
        match self.name_of(id) {
            Ok(name) => name.to_string(),
            Err(_) => id.to_string(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ChanId> {
        self.names.get(name).copied()
    }

    fn check_writable(&self, id: ChanId) -> Result<(), BayError> {
        match self.state {
            BayState::Idle | BayState::DirtyPhase => Ok(()),
            state => Err(BayError::PhaseWrite {
                chan: self.debug_name(id),
                state,
            }),
        }
    }

    fn apply(&mut self, id: ChanId, outcome: WriteOutcome) {
        if outcome == WriteOutcome::Dirtied {
            self.dirty.push(id);
        }
    }

    pub fn set(&mut self, id: ChanId, value: Value) -> Result<(), BayError> {
        self.check_writable(id)?;
        let outcome = self.slot_mut(id)?.set(value)?;
        self.apply(id, outcome);
        Ok(())
    }

    pub fn push(&mut self, id: ChanId, value: Value) -> Result<(), BayError> {
        self.check_writable(id)?;
        let outcome = self.slot_mut(id)?.push(value)?;
        self.apply(id, outcome);
        Ok(())
    }

    pub fn pop(&mut self, id: ChanId, expected: Value) -> Result<(), BayError> {
        self.check_writable(id)?;
        let outcome = self.slot_mut(id)?.pop(expected)?;
        self.apply(id, outcome);
        Ok(())
    }

    /// Enables or disables one binding. Takes effect immediately, including
    /// for bindings later in the current dirty phase.
    pub fn set_cb_enabled(&mut self, cb: CbId, enabled: bool) -> Result<(), BayError> {
        let slot = self
            .cb_enabled
            .get_mut(cb.0)
            .ok_or(BayError::UnknownCallback { cb })?;
        *slot = enabled;
        Ok(())
    }

    pub fn cb_enabled(&self, cb: CbId) -> Result<bool, BayError> {
        self.cb_enabled
            .get(cb.0)
            .copied()
            .ok_or(BayError::UnknownCallback { cb })
    }
}

#[derive(Default)]
pub struct Bay {
    core: BayCore,
    hooks: Vec<Option<Box<dyn BayHook>>>,
    bindings: Vec<ChanBindings>,
}

impl Bay {
    pub fn new() -> Self {
        Bay::default()
    }

    pub fn core(&self) -> &BayCore {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut BayCore {
        &mut self.core
    }

    pub fn nchans(&self) -> usize {
        self.core.names.len()
    }

    pub fn register(&mut self, chan: Chan) -> Result<ChanId, BayError> {
        if self.core.names.contains_key(chan.name()) {
            return Err(BayError::DuplicateName {
                name: chan.name().to_string(),
            });
        }
        let id = ChanId(self.core.chans.len());
        self.core.names.insert(chan.name().to_string(), id);
        self.core.chans.push(Some(chan));
        self.bindings.push(ChanBindings::default());
        Ok(id)
    }

    /// Removes a channel. Refused while the channel is dirty, since its
    /// pending value has not been emitted yet. Bindings to it are dropped.
    pub fn remove(&mut self, id: ChanId) -> Result<Chan, BayError> {
        let chan = self.core.slot(id)?;
        if chan.is_dirty() {
            return Err(BayError::RemoveWhileDirty {
                name: chan.name().to_string(),
            });
        }
        let name = chan.name().to_string();
        self.core.names.remove(&name);
        self.bindings[id.0] = ChanBindings::default();
        self.core.chans[id.0].take().ok_or(BayError::Unknown { id })
    }

    pub fn lookup(&self, name: &str) -> Option<ChanId> {
        self.core.lookup(name)
    }

    pub fn add_hook(&mut self, hook: Box<dyn BayHook>) -> HookId {
        let id = HookId(self.hooks.len());
        self.hooks.push(Some(hook));
        id
    }

    /// Allocates a hook slot so its id can be bound before the hook object
    /// exists. Combinators need this: the hook must carry the binding ids
    /// that [`Bay::bind`] hands out.
    pub fn reserve_hook(&mut self) -> HookId {
        let id = HookId(self.hooks.len());
        self.hooks.push(None);
        id
    }

    pub fn install_hook(&mut self, id: HookId, hook: Box<dyn BayHook>) -> Result<(), BayError> {
        let slot = self
            .hooks
            .get_mut(id.0)
            .ok_or(BayError::UnknownHook { hook: id })?;
        if slot.is_some() {
            return Err(BayError::HookInstalled { hook: id });
        }
        *slot = Some(hook);
        Ok(())
    }

    /// Binds `hook` to fire for `chan` in `phase`. Disabled bindings stay
    /// registered but are skipped during propagation.
    pub fn bind(
        &mut self,
        phase: Phase,
        chan: ChanId,
        hook: HookId,
        enabled: bool,
    ) -> Result<CbId, BayError> {
        self.core.slot(chan)?;
        if hook.0 >= self.hooks.len() {
            return Err(BayError::UnknownHook { hook });
        }
        let cb = CbId(self.core.cb_enabled.len());
        self.core.cb_enabled.push(enabled);
        self.bindings[chan.0].list_mut(phase).push(Binding { cb, hook });
        Ok(cb)
    }

    /// One-step hook-and-bind for plain closures.
    pub fn add_callback<F>(
        &mut self,
        phase: Phase,
        chan: ChanId,
        enabled: bool,
        f: F,
    ) -> Result<CbId, BayError>
    where
        F: FnMut(&mut BayCore, ChanId) -> HookResult + 'static,
    {
        let hook = self.add_hook(Box::new(f));
        self.bind(phase, chan, hook, enabled)
    }

    pub fn set(&mut self, id: ChanId, value: Value) -> Result<(), BayError> {
        self.core.set(id, value)
    }

    pub fn push(&mut self, id: ChanId, value: Value) -> Result<(), BayError> {
        self.core.push(id, value)
    }

    pub fn pop(&mut self, id: ChanId, expected: Value) -> Result<(), BayError> {
        self.core.pop(id, expected)
    }

    pub fn value(&self, id: ChanId) -> Result<Value, BayError> {
        self.core.value(id)
    }

    /// Sets the timeline clock emit callbacks will see for the next round.
    pub fn set_now(&mut self, now: i64) {
        self.core.now = now;
    }

    /// Runs dirty callbacks to fixpoint, then emit callbacks, then flushes
    /// every dirtied channel. On error the bay is left mid-phase and must be
    /// discarded; partial rounds are not resumable.
    pub fn propagate(&mut self) -> Result<(), BayError> {
        if self.core.state != BayState::Idle {
            return Err(BayError::Busy {
                state: self.core.state,
            });
        }
        let Bay {
            core,
            hooks,
            bindings,
        } = self;

        core.state = BayState::DirtyPhase;
        let mut i = 0;
        while i < core.dirty.len() {
            let chan = core.dirty[i];
            fire(core, hooks, bindings, Phase::Dirty, chan)?;
            i += 1;
        }

        core.state = BayState::EmitPhase;
        for i in 0..core.dirty.len() {
            let chan = core.dirty[i];
            fire(core, hooks, bindings, Phase::Emit, chan)?;
        }

        core.state = BayState::FlushPhase;
        for i in 0..core.dirty.len() {
            let id = core.dirty[i];
            if let Ok(chan) = core.slot_mut(id) {
                chan.flush();
            }
        }
        core.dirty.clear();
        core.state = BayState::Idle;
        Ok(())
    }

    /// Gives every hook its end-of-replay callback, in registration order.
    pub fn finish(&mut self) -> Result<(), BayError> {
        let Bay { core, hooks, .. } = self;
        for hook in hooks.iter_mut().flatten() {
            hook.finish(core).map_err(|source| BayError::Hook {
                phase: Phase::Emit,
                chan: String::from("<finish>"),
                source,
            })?;
        }
        Ok(())
    }
}

fn fire(
    core: &mut BayCore,
    hooks: &mut [Option<Box<dyn BayHook>>],
    bindings: &[ChanBindings],
    phase: Phase,
    chan: ChanId,
) -> Result<(), BayError> {
    let list = bindings[chan.0].list(phase);
    for &Binding { cb, hook } in list {
        if !core.cb_enabled[cb.0] {
            continue;
        }
        let Some(target) = hooks[hook.0].as_mut() else {
            return Err(BayError::UninstalledHook { hook });
        };
        target.fire(core, chan).map_err(|source| BayError::Hook {
            phase,
            chan: core.debug_name(chan),
            source,
        })?;
    }
    Ok(())
}
