//! Task and body state machines.
//!
//! Tasks are created from registered types and run as bodies: a plain task
//! has exactly one implicit body 0, a parallel task runs bodies numbered
//! from 1, possibly on several threads at once. Bodies move through
//! Created -> Running <-> Paused -> Dead, and may return to Created when
//! the task was registered as resurrectable.
//!
//! Execution nests per thread through a [`TaskStack`]; pause, resume and
//! end only ever apply to the top of the stack they happened on.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BodyId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskTypeId(pub u32);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BodyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Creation-time task capabilities, decoded from the wire flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFlags {
    /// Bodies may run concurrently and are numbered from 1.
    pub parallel: bool,
    /// Dead bodies may run again.
    pub resurrect: bool,
}

impl TaskFlags {
    pub fn from_bits(bits: u32) -> Self {
        TaskFlags {
            parallel: bits & 0x1 != 0,
            resurrect: bits & 0x2 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyState {
    Created,
    Running,
    Paused,
    Dead,
}

impl fmt::Display for BodyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BodyState::Created => write!(f, "created"),
            BodyState::Running => write!(f, "running"),
            BodyState::Paused => write!(f, "paused"),
            BodyState::Dead => write!(f, "dead"),
        }
    }
}

/// One (task, body) pair on an execution stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub task: TaskId,
    pub body: BodyId,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} body {}", self.task, self.body)
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task type {ty} already exists")]
    DuplicateType { ty: TaskTypeId },
    #[error("unknown task type {ty}")]
    UnknownType { ty: TaskTypeId },
    #[error("task {task} already exists")]
    DuplicateTask { task: TaskId },
    #[error("unknown task {task}")]
    UnknownTask { task: TaskId },
    #[error("parallel task {task} needs a body id of at least 1")]
    ParallelNeedsBody { task: TaskId },
    #[error("task {task} is not parallel but got body {body}")]
    UnexpectedBody { task: TaskId, body: BodyId },
    #[error("task {task} body {body} is already running")]
    DoubleExecute { task: TaskId, body: BodyId },
    #[error("task {task} body {body} is dead and was not created resurrectable")]
    ResurrectDisabled { task: TaskId, body: BodyId },
    #[error("task {task} body {body} is paused; it must be resumed, not executed")]
    ExecutePaused { task: TaskId, body: BodyId },
    #[error("cannot nest task {task} body {body} over {top} in state {top_state}")]
    NestedOverInactive {
        task: TaskId,
        body: BodyId,
        top: Frame,
        top_state: BodyState,
    },
    #[error("{op} of task {task} body {body} on an empty stack")]
    EmptyStack {
        op: &'static str,
        task: TaskId,
        body: BodyId,
    },
    #[error("{op} of task {task} body {body} but the stack top is {top}")]
    NotAtTop {
        op: &'static str,
        task: TaskId,
        body: BodyId,
        top: Frame,
    },
    #[error("cannot {op} task {task} body {body} from state {from}")]
    BadTransition {
        op: &'static str,
        task: TaskId,
        body: BodyId,
        from: BodyState,
    },
    #[error("stack frame {frame} references a body that was never created")]
    MissingBody { frame: Frame },
}

#[derive(Debug, Clone)]
pub struct TaskType {
    pub id: TaskTypeId,
    pub label: String,
    /// Stable label hash used as the timeline value for this type.
    pub gid: i64,
}

#[derive(Debug)]
pub struct Body {
    pub id: BodyId,
    state: BodyState,
    /// How many times this body has entered Running.
    pub iteration: u32,
    can_resurrect: bool,
}

impl Body {
    fn new(id: BodyId, can_resurrect: bool) -> Self {
        Body {
            id,
            state: BodyState::Created,
            iteration: 0,
            can_resurrect,
        }
    }

    pub fn state(&self) -> BodyState {
        self.state
    }
}

#[derive(Debug)]
pub struct Task {
    pub id: TaskId,
    pub ty: TaskTypeId,
    pub flags: TaskFlags,
    bodies: BTreeMap<BodyId, Body>,
    nrunning: u32,
    npaused: u32,
    ndead: u32,
}

impl Task {
    pub fn body(&self, id: BodyId) -> Option<&Body> {
        self.bodies.get(&id)
    }

    pub fn nbodies(&self) -> usize {
        self.bodies.len()
    }

    /// Task-level state derived from its body counters. A parallel task is
    /// running while any body runs.
    pub fn state(&self) -> BodyState {
        if self.nrunning > 0 {
            BodyState::Running
        } else if self.npaused > 0 {
            BodyState::Paused
        } else if !self.bodies.is_empty() && self.ndead as usize == self.bodies.len() {
            BodyState::Dead
        } else {
            BodyState::Created
        }
    }
}

/// Per-thread execution stack of (task, body) frames.
#[derive(Debug, Default)]
pub struct TaskStack {
    frames: Vec<Frame>,
}

impl TaskStack {
    pub fn new() -> Self {
        TaskStack::default()
    }

    pub fn top(&self) -> Option<Frame> {
        self.frames.last().copied()
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }
}

/// Registry of task types and live tasks for one host.
#[derive(Debug, Default)]
pub struct TaskTable {
    types: BTreeMap<TaskTypeId, TaskType>,
    tasks: BTreeMap<TaskId, Task>,
}

/// FNV-1a over the label, folded into a positive 31-bit value so every
/// type gets a stable nonzero timeline color.
fn label_gid(label: &str) -> i64 {
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for &b in label.as_bytes() {
        h ^= u64::from(b);
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (h & 0x7fff_ffff) as i64 + 1
}

impl TaskTable {
    pub fn new() -> Self {
        TaskTable::default()
    }

    pub fn create_type(&mut self, id: TaskTypeId, label: &str) -> Result<(), TaskError> {
        if self.types.contains_key(&id) {
            return Err(TaskError::DuplicateType { ty: id });
        }
        self.types.insert(
            id,
            TaskType {
                id,
                label: label.to_string(),
                gid: label_gid(label),
            },
        );
        Ok(())
    }

    pub fn task_type(&self, id: TaskTypeId) -> Option<&TaskType> {
        self.types.get(&id)
    }

    pub fn create_task(
        &mut self,
        id: TaskId,
        ty: TaskTypeId,
        flags: TaskFlags,
    ) -> Result<(), TaskError> {
        if !self.types.contains_key(&ty) {
            return Err(TaskError::UnknownType { ty });
        }
        if self.tasks.contains_key(&id) {
            return Err(TaskError::DuplicateTask { task: id });
        }
        self.tasks.insert(
            id,
            Task {
                id,
                ty,
                flags,
                bodies: BTreeMap::new(),
                nrunning: 0,
                npaused: 0,
                ndead: 0,
            },
        );
        Ok(())
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(&id)
    }

    pub fn ntasks(&self) -> usize {
        self.tasks.len()
    }

    pub fn body_state(&self, frame: Frame) -> Option<BodyState> {
        self.tasks
            .get(&frame.task)?
            .bodies
            .get(&frame.body)
            .map(|b| b.state)
    }

    /// Top of the stack, but only while that frame's body is Running. This
    /// is the frame whose identity belongs on timelines.
    pub fn effective_top(&self, stack: &TaskStack) -> Option<Frame> {
        let top = stack.top()?;
        (self.body_state(top) == Some(BodyState::Running)).then_some(top)
    }

    /// Starts (or resurrects) a body and pushes it on `stack`. Unless
    /// `relaxed`, nesting over a non-Running top frame is refused.
    pub fn execute(
        &mut self,
        stack: &mut TaskStack,
        task_id: TaskId,
        body_id: BodyId,
        relaxed: bool,
    ) -> Result<(), TaskError> {
        let task = self
            .tasks
            .get(&task_id)
            .ok_or(TaskError::UnknownTask { task: task_id })?;
        if task.flags.parallel && body_id == BodyId(0) {
            return Err(TaskError::ParallelNeedsBody { task: task_id });
        }
        if !task.flags.parallel && body_id != BodyId(0) {
            return Err(TaskError::UnexpectedBody {
                task: task_id,
                body: body_id,
            });
        }
        if let Some(top) = stack.top()
            && !relaxed
        {
            let top_state = self
                .body_state(top)
                .ok_or(TaskError::MissingBody { frame: top })?;
            if top_state != BodyState::Running {
                return Err(TaskError::NestedOverInactive {
                    task: task_id,
                    body: body_id,
                    top,
                    top_state,
                });
            }
        }

        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::UnknownTask { task: task_id })?;
        let can_resurrect = task.flags.resurrect;
        let body = task
            .bodies
            .entry(body_id)
            .or_insert_with(|| Body::new(body_id, can_resurrect));
        let mut resurrected = false;
        match body.state {
            BodyState::Created => {}
            BodyState::Dead if body.can_resurrect => resurrected = true,
            BodyState::Dead => {
                return Err(TaskError::ResurrectDisabled {
                    task: task_id,
                    body: body_id,
                });
            }
            BodyState::Running => {
                return Err(TaskError::DoubleExecute {
                    task: task_id,
                    body: body_id,
                });
            }
            BodyState::Paused => {
                return Err(TaskError::ExecutePaused {
                    task: task_id,
                    body: body_id,
                });
            }
        }
        body.state = BodyState::Running;
        body.iteration += 1;
        if resurrected {
            task.ndead -= 1;
        }
        task.nrunning += 1;
        stack.frames.push(Frame {
            task: task_id,
            body: body_id,
        });
        Ok(())
    }

    pub fn pause(
        &mut self,
        stack: &mut TaskStack,
        task_id: TaskId,
        body_id: BodyId,
    ) -> Result<(), TaskError> {
        self.expect_top(stack, "pause", task_id, body_id)?;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::UnknownTask { task: task_id })?;
        let body = task.bodies.get_mut(&body_id).ok_or(TaskError::MissingBody {
            frame: Frame {
                task: task_id,
                body: body_id,
            },
        })?;
        if body.state != BodyState::Running {
            return Err(TaskError::BadTransition {
                op: "pause",
                task: task_id,
                body: body_id,
                from: body.state,
            });
        }
        body.state = BodyState::Paused;
        task.nrunning -= 1;
        task.npaused += 1;
        Ok(())
    }

    pub fn resume(
        &mut self,
        stack: &mut TaskStack,
        task_id: TaskId,
        body_id: BodyId,
    ) -> Result<(), TaskError> {
        self.expect_top(stack, "resume", task_id, body_id)?;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::UnknownTask { task: task_id })?;
        let body = task.bodies.get_mut(&body_id).ok_or(TaskError::MissingBody {
            frame: Frame {
                task: task_id,
                body: body_id,
            },
        })?;
        if body.state != BodyState::Paused {
            return Err(TaskError::BadTransition {
                op: "resume",
                task: task_id,
                body: body_id,
                from: body.state,
            });
        }
        body.state = BodyState::Running;
        task.npaused -= 1;
        task.nrunning += 1;
        Ok(())
    }

    /// Ends the running body at the top of `stack` and pops its frame.
    pub fn end(
        &mut self,
        stack: &mut TaskStack,
        task_id: TaskId,
        body_id: BodyId,
    ) -> Result<(), TaskError> {
        self.expect_top(stack, "end", task_id, body_id)?;
        let task = self
            .tasks
            .get_mut(&task_id)
            .ok_or(TaskError::UnknownTask { task: task_id })?;
        let body = task.bodies.get_mut(&body_id).ok_or(TaskError::MissingBody {
            frame: Frame {
                task: task_id,
                body: body_id,
            },
        })?;
        if body.state != BodyState::Running {
            return Err(TaskError::BadTransition {
                op: "end",
                task: task_id,
                body: body_id,
                from: body.state,
            });
        }
        body.state = BodyState::Dead;
        task.nrunning -= 1;
        task.ndead += 1;
        stack.frames.pop();
        Ok(())
    }

    fn expect_top(
        &self,
        stack: &TaskStack,
        op: &'static str,
        task: TaskId,
        body: BodyId,
    ) -> Result<(), TaskError> {
        let Some(top) = stack.top() else {
            return Err(TaskError::EmptyStack { op, task, body });
        };
        if top.task != task || top.body != body {
            return Err(TaskError::NotAtTop {
                op,
                task,
                body,
                top,
            });
        }
        Ok(())
    }
}
