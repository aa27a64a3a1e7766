//! Task model, MCV byte `T`.
//!
//! Replays the task/body machine of the traced runtime. Task and type ids
//! are runtime-local, so each host gets its own [`TaskTable`]; execution
//! stacks are per thread. Every task event settles into per-thread `id`,
//! `type` and `subsystem` channels, which are then gated by thread state
//! (tracks) and projected onto cpus (muxes keyed by `running_tid`).
//!
//! Event vocabulary (`T` + category + value):
//!
//!   TYc type_id label    task type created (jumbo payload)
//!   TTc task type flags  task created (bit0 parallel, bit1 resurrectable)
//!   TTx task body        body starts running
//!   TTp task body        body pauses
//!   TTr task body        body resumes
//!   TTe task body        body ends
//!   TS[ code             subsystem entered
//!   TS] code             subsystem left

use std::collections::HashMap;

use tracing::warn;

use crate::bay::ChanId;
use crate::chan::{Chan, ChanPolicy};
use crate::event::PayloadCursor;
use crate::model::{
    EvCtx, Export, ExportTarget, Model, ModelError, ModelInfo, SetupCtx,
};
use crate::mux::{self, MuxError, MuxSpec, SelectMap};
use crate::player::PlayerEv;
use crate::system::System;
use crate::task::{BodyId, TaskFlags, TaskId, TaskStack, TaskTable, TaskTypeId};
use crate::timeline::EmitPolicy;
use crate::track::{self, TrackMode};
use crate::value::Value;

pub const MODEL_BYTE: u8 = b'T';

pub const TY_TASK_ID: u32 = 30;
pub const TY_TASK_TYPE: u32 = 31;
pub const TY_SUBSYSTEM: u32 = 32;

/// Raw per-thread channels written by the event hook.
#[derive(Debug, Clone, Copy)]
struct TaskChans {
    id: ChanId,
    ty: ChanId,
    subsystem: ChanId,
}

/// Gated views feeding timelines and cpu muxes.
#[derive(Debug, Clone, Copy)]
struct TrackedChans {
    id: ChanId,
    ty: ChanId,
    subsystem: ChanId,
}

#[derive(Default)]
pub struct TasksModel {
    /// One table per host.
    tables: Vec<TaskTable>,
    /// One execution stack per thread.
    stacks: Vec<TaskStack>,
    threads: Vec<Option<TaskChans>>,
}

impl TasksModel {
    pub fn new() -> Self {
        TasksModel::default()
    }

    fn chans(&self, thread: usize) -> Result<TaskChans, ModelError> {
        self.threads
            .get(thread)
            .copied()
            .flatten()
            .ok_or_else(|| ModelError::Unwired {
                what: format!("task thread {thread}"),
            })
    }

    /// Settles the per-thread identity channels from the stack top. Ending
    /// a nested body and revealing its parent is therefore one channel
    /// update, not a stop plus a start.
    fn publish(&self, ctx: &mut EvCtx, ti: usize) -> Result<(), ModelError> {
        let chans = self.chans(ti)?;
        let host = ctx.system.thread(ti).host;
        let table = &self.tables[host];
        let stack = &self.stacks[ti];
        let (id, gid) = match table.effective_top(stack) {
            Some(frame) => {
                let thread = ctx.system.thread(ti).ident.to_string();
                let task = table.task(frame.task).ok_or_else(|| ModelError::Unwired {
                    what: format!("thread {thread} stack"),
                })?;
                let ty = table.task_type(task.ty).ok_or_else(|| ModelError::Unwired {
                    what: format!("thread {thread} task type"),
                })?;
                (
                    Value::Int(i64::from(frame.task.0)),
                    Value::Int(ty.gid),
                )
            }
            None => (Value::Null, Value::Null),
        };
        ctx.bay.set(chans.id, id)?;
        ctx.bay.set(chans.ty, gid)?;
        Ok(())
    }

    fn require_running(&self, ctx: &EvCtx, op: &'static str) -> Result<(), ModelError> {
        let t = ctx.system.thread(ctx.thread);
        if t.state.is_running() {
            Ok(())
        } else {
            Err(ModelError::ThreadNotRunning {
                thread: t.ident.to_string(),
                op,
                state: t.state,
            })
        }
    }

    fn on_type_create(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let mut cur = PayloadCursor::new(ev.payload);
        let id = cur.u32("type id").map_err(ModelError::payload(ev.mcv))?;
        let label = cur.str_rest().map_err(ModelError::payload(ev.mcv))?;
        let host = ctx.system.thread(ctx.thread).host;
        let thread = ctx.system.thread(ctx.thread).ident.to_string();
        self.tables[host]
            .create_type(TaskTypeId(id), label)
            .map_err(|source| ModelError::Task { thread, source })
    }

    fn on_task_create(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let mut cur = PayloadCursor::new(ev.payload);
        let task = cur.u32("task id").map_err(ModelError::payload(ev.mcv))?;
        let ty = cur.u32("type id").map_err(ModelError::payload(ev.mcv))?;
        let flags = cur.u32("flags").map_err(ModelError::payload(ev.mcv))?;
        cur.expect_end().map_err(ModelError::payload(ev.mcv))?;
        let host = ctx.system.thread(ctx.thread).host;
        let thread = ctx.system.thread(ctx.thread).ident.to_string();
        self.tables[host]
            .create_task(TaskId(task), TaskTypeId(ty), TaskFlags::from_bits(flags))
            .map_err(|source| ModelError::Task { thread, source })
    }

    fn task_body(ev: &PlayerEv) -> Result<(TaskId, BodyId), ModelError> {
        let mut cur = PayloadCursor::new(ev.payload);
        let task = cur.u32("task id").map_err(ModelError::payload(ev.mcv))?;
        let body = cur.u32("body id").map_err(ModelError::payload(ev.mcv))?;
        cur.expect_end().map_err(ModelError::payload(ev.mcv))?;
        Ok((TaskId(task), BodyId(body)))
    }

    fn on_execute(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        self.require_running(ctx, "execute task")?;
        let (task, body) = Self::task_body(ev)?;
        let ti = ctx.thread;
        let host = ctx.system.thread(ti).host;
        let thread = ctx.system.thread(ti).ident.to_string();
        self.tables[host]
            .execute(&mut self.stacks[ti], task, body, ctx.options.relax_nesting)
            .map_err(|source| ModelError::Task { thread, source })?;
        self.publish(ctx, ti)
    }

    fn on_pause(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let (task, body) = Self::task_body(ev)?;
        let ti = ctx.thread;
        let host = ctx.system.thread(ti).host;
        let thread = ctx.system.thread(ti).ident.to_string();
        self.tables[host]
            .pause(&mut self.stacks[ti], task, body)
            .map_err(|source| ModelError::Task { thread, source })?;
        self.publish(ctx, ti)
    }

    fn on_resume(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        self.require_running(ctx, "resume task")?;
        let (task, body) = Self::task_body(ev)?;
        let ti = ctx.thread;
        let host = ctx.system.thread(ti).host;
        let thread = ctx.system.thread(ti).ident.to_string();
        self.tables[host]
            .resume(&mut self.stacks[ti], task, body)
            .map_err(|source| ModelError::Task { thread, source })?;
        self.publish(ctx, ti)
    }

    fn on_end(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let (task, body) = Self::task_body(ev)?;
        let ti = ctx.thread;
        let host = ctx.system.thread(ti).host;
        let thread = ctx.system.thread(ti).ident.to_string();
        self.tables[host]
            .end(&mut self.stacks[ti], task, body)
            .map_err(|source| ModelError::Task { thread, source })?;
        self.publish(ctx, ti)
    }

    fn on_subsystem(&mut self, ctx: &mut EvCtx, ev: &PlayerEv, enter: bool) -> Result<(), ModelError> {
        let mut cur = PayloadCursor::new(ev.payload);
        let code = cur.u32("subsystem code").map_err(ModelError::payload(ev.mcv))?;
        cur.expect_end().map_err(ModelError::payload(ev.mcv))?;
        let chans = self.chans(ctx.thread)?;
        if enter {
            ctx.bay.push(chans.subsystem, Value::Int(i64::from(code)))?;
        } else {
            ctx.bay.pop(chans.subsystem, Value::Int(i64::from(code)))?;
        }
        Ok(())
    }
}

impl Model for TasksModel {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            byte: MODEL_BYTE,
            name: "tasks",
        }
    }

    fn probe(&mut self, ctx: &mut SetupCtx) -> Result<bool, ModelError> {
        Ok(ctx
            .system
            .threads()
            .iter()
            .any(|t| t.models.contains(&MODEL_BYTE)))
    }

    fn create(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError> {
        self.tables = (0..ctx.system.hosts().len())
            .map(|_| TaskTable::new())
            .collect();
        self.stacks = (0..ctx.system.nthreads())
            .map(|_| TaskStack::new())
            .collect();
        self.threads = Vec::with_capacity(ctx.system.nthreads());
        for ti in 0..ctx.system.nthreads() {
            let ident = ctx.system.thread(ti).ident.clone();
            let base = format!("task.thread.{}.{}", ident.host, ident.tid);
            let dedup = ChanPolicy {
                ignore_dup: true,
                ..ChanPolicy::default()
            };
            let id = ctx
                .bay
                .register(Chan::single(format!("{base}.id"), Value::Null, dedup))?;
            let ty = ctx
                .bay
                .register(Chan::single(format!("{base}.type"), Value::Null, dedup))?;
            let subsystem = ctx.bay.register(Chan::stack(
                format!("{base}.subsystem"),
                ChanPolicy {
                    allow_dup: true,
                    ..ChanPolicy::default()
                },
            ))?;
            self.threads.push(Some(TaskChans { id, ty, subsystem }));
        }
        Ok(())
    }

    fn connect(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError> {
        let nthreads = ctx.system.nthreads();
        let mut tracked: Vec<Option<TrackedChans>> = vec![None; nthreads];
        for ti in 0..nthreads {
            let chans = self.chans(ti)?;
            let t = ctx.system.thread(ti);
            let Some(spool) = t.chans else {
                return Err(ModelError::MissingDependency {
                    model: "tasks",
                    needs: "spool",
                });
            };
            let base = format!("task.thread.{}.{}", t.ident.host, t.ident.tid);
            let row = ti as u32;

            let id = track::create(
                ctx.bay,
                &format!("{base}.id.run"),
                TrackMode::Running,
                spool.state,
                chans.id,
                Value::Null,
            )?;
            let ty = track::create(
                ctx.bay,
                &format!("{base}.type.run"),
                TrackMode::Running,
                spool.state,
                chans.ty,
                Value::Null,
            )?;
            // Subsystem context survives pauses, so gate on liveness.
            let subsystem = track::create(
                ctx.bay,
                &format!("{base}.subsystem.act"),
                TrackMode::Active,
                spool.state,
                chans.subsystem,
                Value::Null,
            )?;

            for (ty_id, chan) in [
                (TY_TASK_ID, id.output),
                (TY_TASK_TYPE, ty.output),
                (TY_SUBSYSTEM, subsystem.output),
            ] {
                ctx.exports.push(Export {
                    target: ExportTarget::Thread,
                    row,
                    ty: ty_id,
                    chan,
                    policy: EmitPolicy::SkipDup,
                });
            }
            tracked[ti] = Some(TrackedChans {
                id: id.output,
                ty: ty.output,
                subsystem: subsystem.output,
            });
        }

        for g in 0..ctx.system.ncpus() {
            let cpu = ctx.system.cpu(g);
            let host = cpu.host;
            let Some(cpu_chans) = cpu.chans else {
                return Err(ModelError::MissingDependency {
                    model: "tasks",
                    needs: "spool",
                });
            };
            let threads = ctx.system.hosts()[host].threads.clone();
            let mut tid_index: HashMap<i64, usize> = HashMap::with_capacity(threads.len());
            for (i, &ti) in threads.iter().enumerate() {
                tid_index.insert(i64::from(ctx.system.thread(ti).tid), i);
            }
            let select_name = ctx
                .bay
                .core()
                .name_of(cpu_chans.running_tid)?
                .to_string();

            let views: [(&str, u32, fn(TrackedChans) -> ChanId); 3] = [
                ("id", TY_TASK_ID, |t| t.id),
                ("type", TY_TASK_TYPE, |t| t.ty),
                ("subsystem", TY_SUBSYSTEM, |t| t.subsystem),
            ];
            for (suffix, ty_id, pick) in views {
                let inputs = threads
                    .iter()
                    .map(|&ti| {
                        tracked[ti].map(pick).ok_or_else(|| ModelError::Unwired {
                            what: format!("task thread {ti}"),
                        })
                    })
                    .collect::<Result<Vec<ChanId>, ModelError>>()?;
                let output = ctx.bay.register(Chan::single(
                    format!("task.cpu.{g}.{suffix}"),
                    Value::Null,
                    ChanPolicy::relaxed(),
                ))?;
                let map = tid_map(select_name.clone(), tid_index.clone());
                mux::create(
                    ctx.bay,
                    MuxSpec {
                        select: cpu_chans.running_tid,
                        inputs,
                        output,
                        default: Value::Null,
                        select_map: Some(map),
                    },
                )?;
                ctx.exports.push(Export {
                    target: ExportTarget::Cpu,
                    row: g as u32,
                    ty: ty_id,
                    chan: output,
                    policy: EmitPolicy::SkipDup,
                });
            }
        }
        Ok(())
    }

    fn event(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        match (ev.mcv.category(), ev.mcv.value()) {
            (b'Y', b'c') => self.on_type_create(ctx, ev),
            (b'T', b'c') => self.on_task_create(ctx, ev),
            (b'T', b'x') => self.on_execute(ctx, ev),
            (b'T', b'p') => self.on_pause(ctx, ev),
            (b'T', b'r') => self.on_resume(ctx, ev),
            (b'T', b'e') => self.on_end(ctx, ev),
            (b'S', b'[') => self.on_subsystem(ctx, ev, true),
            (b'S', b']') => self.on_subsystem(ctx, ev, false),
            _ => Err(ModelError::UnknownEvent {
                model: "tasks",
                mcv: ev.mcv,
            }),
        }
    }

    fn finish(&mut self, system: &System) -> Result<(), ModelError> {
        for (ti, stack) in self.stacks.iter().enumerate() {
            if !stack.is_empty() {
                warn!(
                    thread = %system.thread(ti).ident,
                    depth = stack.depth(),
                    "task stack not empty at end of trace"
                );
            }
        }
        Ok(())
    }
}

/// Select map for the cpu muxes: `running_tid` values pick the host-local
/// thread, anything unknown is a wiring fault.
fn tid_map(select_name: String, tid_index: HashMap<i64, usize>) -> SelectMap {
    Box::new(move |v| match v {
        Value::Null => Ok(None),
        Value::Int(tid) => tid_index
            .get(&tid)
            .copied()
            .map(Some)
            .ok_or_else(|| MuxError::SelectorValue {
                chan: select_name.clone(),
                value: v,
            }),
    })
}
