//! Reactive value channel.
//!
//! A channel holds either a single value or a small stack of values whose
//! top is the externally visible value. Writes mark the channel dirty;
//! [`Chan::flush`] publishes the current value as the new baseline for
//! duplicate detection. What a write is allowed to do is governed by a
//! per-channel [`ChanPolicy`], so misbehaving state machines surface as
//! errors at the offending write instead of corrupting downstream views.

use thiserror::Error;

use crate::value::Value;

/// Hard cap on stack channel depth. Deeper nesting than this in a trace
/// means a runaway push loop, not a real program.
pub const STACK_MAX: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChanKind {
    Single,
    Stack,
}

/// What writes may do between two flushes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChanPolicy {
    /// Permit writing the value that was last flushed.
    pub allow_dup: bool,
    /// Silently drop a duplicate write instead of failing. Only consulted
    /// when `allow_dup` is false.
    pub ignore_dup: bool,
    /// Permit writing a channel that is already dirty.
    pub allow_dirty: bool,
}

impl ChanPolicy {
    /// Policy for combinator outputs, which are rewritten freely within a
    /// propagation round.
    pub fn relaxed() -> Self {
        ChanPolicy {
            allow_dup: true,
            ignore_dup: false,
            allow_dirty: true,
        }
    }
}

/// How a write landed. `Dirtied` is the clean-to-dirty transition the owner
/// must schedule for propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Dirtied,
    Rewrote,
    Ignored,
}

#[derive(Debug, Error)]
pub enum ChanError {
    #[error("channel {chan}: cannot {op} a {kind:?} channel")]
    KindMismatch {
        chan: String,
        op: &'static str,
        kind: ChanKind,
    },
    #[error("channel {chan}: write while dirty")]
    DirtyWrite { chan: String },
    #[error("channel {chan}: duplicate write of {value}")]
    DuplicateWrite { chan: String, value: Value },
    #[error("channel {chan}: stack overflow at depth {depth}")]
    StackOverflow { chan: String, depth: usize },
    #[error("channel {chan}: pop on empty stack")]
    StackEmpty { chan: String },
    #[error("channel {chan}: pop expected {expected}, top is {top}")]
    PopMismatch {
        chan: String,
        expected: Value,
        top: Value,
    },
}

#[derive(Debug, Clone)]
enum ChanData {
    Single(Value),
    Stack(Vec<Value>),
}

#[derive(Debug, Clone)]
pub struct Chan {
    name: String,
    policy: ChanPolicy,
    data: ChanData,
    last_flushed: Value,
    dirty: bool,
}

impl Chan {
    pub fn single(name: impl Into<String>, initial: Value, policy: ChanPolicy) -> Self {
        Chan {
            name: name.into(),
            policy,
            data: ChanData::Single(initial),
            last_flushed: initial,
            dirty: false,
        }
    }

    /// A stack channel starts empty; its visible value is null until the
    /// first push.
    pub fn stack(name: impl Into<String>, policy: ChanPolicy) -> Self {
        Chan {
            name: name.into(),
            policy,
            data: ChanData::Stack(Vec::new()),
            last_flushed: Value::Null,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ChanKind {
        match self.data {
            ChanData::Single(_) => ChanKind::Single,
            ChanData::Stack(_) => ChanKind::Stack,
        }
    }

    pub fn policy(&self) -> ChanPolicy {
        self.policy
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Externally visible value: the single value, or the stack top, or
    /// null for an empty stack.
    pub fn value(&self) -> Value {
        match &self.data {
            ChanData::Single(v) => *v,
            ChanData::Stack(s) => s.last().copied().unwrap_or(Value::Null),
        }
    }

    /// Value most recently published by a flush.
    pub fn last_flushed(&self) -> Value {
        self.last_flushed
    }

    pub fn depth(&self) -> usize {
        match &self.data {
            ChanData::Single(_) => 1,
            ChanData::Stack(s) => s.len(),
        }
    }

    fn check_kind(&self, want: ChanKind, op: &'static str) -> Result<(), ChanError> {
        if self.kind() != want {
            return Err(ChanError::KindMismatch {
                chan: self.name.clone(),
                op,
                kind: self.kind(),
            });
        }
        Ok(())
    }

    fn check_dirty(&self) -> Result<(), ChanError> {
        if self.dirty && !self.policy.allow_dirty {
            return Err(ChanError::DirtyWrite {
                chan: self.name.clone(),
            });
        }
        Ok(())
    }

    /// Duplicate screen against the last flushed value. `Ok(true)` means the
    /// write should be silently dropped.
    fn check_dup(&self, value: Value) -> Result<bool, ChanError> {
        if value != self.last_flushed || self.policy.allow_dup {
            return Ok(false);
        }
        if self.policy.ignore_dup {
            return Ok(true);
        }
        Err(ChanError::DuplicateWrite {
            chan: self.name.clone(),
            value,
        })
    }

    fn mark_dirty(&mut self) -> WriteOutcome {
        if self.dirty {
            WriteOutcome::Rewrote
        } else {
            self.dirty = true;
            WriteOutcome::Dirtied
        }
    }

    pub fn set(&mut self, value: Value) -> Result<WriteOutcome, ChanError> {
        self.check_kind(ChanKind::Single, "set")?;
        self.check_dirty()?;
        if self.check_dup(value)? {
            return Ok(WriteOutcome::Ignored);
        }
        self.data = ChanData::Single(value);
        Ok(self.mark_dirty())
    }

    pub fn push(&mut self, value: Value) -> Result<WriteOutcome, ChanError> {
        self.check_kind(ChanKind::Stack, "push")?;
        self.check_dirty()?;
        if self.check_dup(value)? {
            return Ok(WriteOutcome::Ignored);
        }
        let depth = self.depth();
        if depth >= STACK_MAX {
            return Err(ChanError::StackOverflow {
                chan: self.name.clone(),
                depth,
            });
        }
        if let ChanData::Stack(stack) = &mut self.data {
            stack.push(value);
        }
        Ok(self.mark_dirty())
    }

    /// Pops the stack top, which must equal `expected`. The revealed value
    /// underneath becomes visible without a duplicate screen: it was
    /// already accepted when it was pushed.
    pub fn pop(&mut self, expected: Value) -> Result<WriteOutcome, ChanError> {
        self.check_kind(ChanKind::Stack, "pop")?;
        self.check_dirty()?;
        let top = match &self.data {
            ChanData::Stack(s) => s.last().copied(),
            ChanData::Single(_) => None,
        };
        let Some(top) = top else {
            return Err(ChanError::StackEmpty {
                chan: self.name.clone(),
            });
        };
        if top != expected {
            return Err(ChanError::PopMismatch {
                chan: self.name.clone(),
                expected,
                top,
            });
        }
        if let ChanData::Stack(stack) = &mut self.data {
            stack.pop();
        }
        Ok(self.mark_dirty())
    }

    /// Publishes the current value as the duplicate baseline and clears the
    /// dirty flag.
    pub fn flush(&mut self) {
        self.last_flushed = self.value();
        self.dirty = false;
    }
}
