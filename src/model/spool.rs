//! Thread lifecycle model, MCV byte `S`.
//!
//! Follows the instrumentation runtime's own view of its threads: creation,
//! execution, cooldown, warmup, pause, end, and affinity moves. Publishes
//! per-thread `state`/`cpu` channels and per-cpu `nrunning`/`running_tid`
//! channels, plus a rank-sorted view of cpu occupancy.
//!
//! Event vocabulary (`S` + category + value):
//!
//!   SHc cpu   thread created, bound to cpu (-1 = unbound)
//!   SHx cpu   thread starts running on cpu
//!   SHo       thread cools (still on cpu, no longer running)
//!   SHw       thread warms from pause
//!   SHp       thread pauses
//!   SHe       thread ends
//!   SAs cpu   affinity moved

use tracing::{debug, warn};

use crate::chan::{Chan, ChanPolicy};
use crate::event::PayloadCursor;
use crate::model::{
    EvCtx, Export, ExportTarget, Model, ModelError, ModelInfo, SetupCtx,
};
use crate::player::PlayerEv;
use crate::sort::{self, SortSpec};
use crate::system::{CpuChans, System, ThreadChans, ThreadState};
use crate::timeline::EmitPolicy;
use crate::value::Value;

pub const MODEL_BYTE: u8 = b'S';

pub const TY_THREAD_STATE: u32 = 10;
pub const TY_THREAD_CPU: u32 = 11;
pub const TY_CPU_NRUNNING: u32 = 20;
pub const TY_CPU_RUNNING_TID: u32 = 21;
pub const TY_CPU_NRUNNING_RANK: u32 = 22;

const ALIVE: &[ThreadState] = &[
    ThreadState::Running,
    ThreadState::Cooling,
    ThreadState::Warming,
    ThreadState::Paused,
];

#[derive(Debug, Default)]
pub struct SpoolModel {}

impl SpoolModel {
    pub fn new() -> Self {
        SpoolModel::default()
    }
}

fn thread_chans(system: &System, ti: usize) -> Result<ThreadChans, ModelError> {
    let t = system.thread(ti);
    t.chans.ok_or_else(|| ModelError::Unwired {
        what: format!("thread {}", t.ident),
    })
}

fn cpu_chans(system: &System, g: usize) -> Result<CpuChans, ModelError> {
    system.cpu(g).chans.ok_or_else(|| ModelError::Unwired {
        what: format!("cpu {g}"),
    })
}

/// Current state gate: the event is only legal from one of `allowed`.
fn check_state(
    ctx: &EvCtx,
    op: &'static str,
    allowed: &[ThreadState],
) -> Result<ThreadState, ModelError> {
    let t = ctx.system.thread(ctx.thread);
    if allowed.contains(&t.state) {
        Ok(t.state)
    } else {
        Err(ModelError::ThreadTransition {
            thread: t.ident.to_string(),
            op,
            state: t.state,
        })
    }
}

fn set_state(ctx: &mut EvCtx, to: ThreadState) -> Result<(), ModelError> {
    let chans = thread_chans(ctx.system, ctx.thread)?;
    ctx.system.thread_mut(ctx.thread).state = to;
    ctx.bay.set(chans.state, Value::Int(to.as_int()))?;
    Ok(())
}

fn bind_cpu(ctx: &mut EvCtx, g: usize) -> Result<(), ModelError> {
    let chans = thread_chans(ctx.system, ctx.thread)?;
    ctx.system.thread_mut(ctx.thread).cpu = Some(g);
    ctx.bay.set(chans.cpu, Value::Int(g as i64))?;
    Ok(())
}

fn bound_cpu(ctx: &EvCtx) -> Result<usize, ModelError> {
    let t = ctx.system.thread(ctx.thread);
    t.cpu.ok_or_else(|| ModelError::Unbound {
        thread: t.ident.to_string(),
    })
}

/// Refreshes a cpu's occupancy channels after its running set changed.
/// More than one running thread is tolerated with a warning; the tid view
/// goes null because no single owner exists.
fn publish_cpu(ctx: &mut EvCtx, g: usize) -> Result<(), ModelError> {
    let chans = cpu_chans(ctx.system, g)?;
    let cpu = ctx.system.cpu(g);
    let n = cpu.running.len();
    let tid = match cpu.running.as_slice() {
        [] => Value::Null,
        [ti] => Value::Int(i64::from(ctx.system.thread(*ti).tid)),
        many => {
            warn!(cpu = g, running = many.len(), "cpu oversubscribed");
            Value::Null
        }
    };
    ctx.bay.set(chans.nrunning, Value::Int(n as i64))?;
    ctx.bay.set(chans.running_tid, tid)?;
    Ok(())
}

fn enter_cpu(ctx: &mut EvCtx, g: usize) -> Result<(), ModelError> {
    let ti = ctx.thread;
    ctx.system.cpu_mut(g).running.push(ti);
    publish_cpu(ctx, g)
}

fn leave_cpu(ctx: &mut EvCtx, g: usize) -> Result<(), ModelError> {
    let ti = ctx.thread;
    ctx.system.cpu_mut(g).running.retain(|&t| t != ti);
    publish_cpu(ctx, g)
}

fn cpu_arg(ctx: &EvCtx, ev: &PlayerEv) -> Result<usize, ModelError> {
    let mut cur = PayloadCursor::new(ev.payload);
    let index = cur.i32("cpu").map_err(ModelError::payload(ev.mcv))?;
    cur.expect_end().map_err(ModelError::payload(ev.mcv))?;
    let host = ctx.system.thread(ctx.thread).host;
    Ok(ctx.system.resolve_cpu(host, index)?)
}

fn no_arg(ev: &PlayerEv) -> Result<(), ModelError> {
    PayloadCursor::new(ev.payload)
        .expect_end()
        .map_err(ModelError::payload(ev.mcv))
}

impl SpoolModel {
    fn on_create(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let g = cpu_arg(ctx, ev)?;
        check_state(ctx, "create", &[ThreadState::Unknown])?;
        bind_cpu(ctx, g)?;
        set_state(ctx, ThreadState::Paused)
    }

    fn on_execute(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let g = cpu_arg(ctx, ev)?;
        check_state(ctx, "execute", &[ThreadState::Paused, ThreadState::Warming])?;
        bind_cpu(ctx, g)?;
        set_state(ctx, ThreadState::Running)?;
        enter_cpu(ctx, g)
    }

    fn on_cool(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        no_arg(ev)?;
        check_state(ctx, "cool", &[ThreadState::Running])?;
        let g = bound_cpu(ctx)?;
        set_state(ctx, ThreadState::Cooling)?;
        leave_cpu(ctx, g)
    }

    fn on_warm(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        no_arg(ev)?;
        check_state(ctx, "warm", &[ThreadState::Paused])?;
        set_state(ctx, ThreadState::Warming)
    }

    fn on_pause(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        no_arg(ev)?;
        let was = check_state(ctx, "pause", &[ThreadState::Running, ThreadState::Cooling])?;
        set_state(ctx, ThreadState::Paused)?;
        if was == ThreadState::Running {
            let g = bound_cpu(ctx)?;
            leave_cpu(ctx, g)?;
        }
        Ok(())
    }

    fn on_end(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        no_arg(ev)?;
        let was = check_state(ctx, "end", ALIVE)?;
        set_state(ctx, ThreadState::Dead)?;
        if was == ThreadState::Running {
            let g = bound_cpu(ctx)?;
            leave_cpu(ctx, g)?;
        }
        Ok(())
    }

    fn on_affinity(&self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        let to = cpu_arg(ctx, ev)?;
        let was = check_state(ctx, "set affinity", ALIVE)?;
        let from = bound_cpu(ctx)?;
        if from == to {
            debug!(thread = ctx.thread, cpu = to, "affinity unchanged");
            return Ok(());
        }
        if was == ThreadState::Running {
            leave_cpu(ctx, from)?;
        }
        bind_cpu(ctx, to)?;
        if was == ThreadState::Running {
            enter_cpu(ctx, to)?;
        }
        Ok(())
    }
}

impl Model for SpoolModel {
    fn info(&self) -> ModelInfo {
        ModelInfo {
            byte: MODEL_BYTE,
            name: "spool",
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
        for ti in 0..ctx.system.nthreads() {
            let ident = ctx.system.thread(ti).ident.clone();
            let state = ctx.bay.register(Chan::single(
                format!("spool.thread.{}.{}.state", ident.host, ident.tid),
                Value::Int(ThreadState::Unknown.as_int()),
                ChanPolicy::default(),
            ))?;
            let cpu = ctx.bay.register(Chan::single(
                format!("spool.thread.{}.{}.cpu", ident.host, ident.tid),
                Value::Null,
                ChanPolicy {
                    ignore_dup: true,
                    ..ChanPolicy::default()
                },
            ))?;
            ctx.system.thread_mut(ti).chans = Some(ThreadChans { state, cpu });
        }
        for g in 0..ctx.system.ncpus() {
            let nrunning = ctx.bay.register(Chan::single(
                format!("spool.cpu.{g}.nrunning"),
                Value::Int(0),
                ChanPolicy::default(),
            ))?;
            let running_tid = ctx.bay.register(Chan::single(
                format!("spool.cpu.{g}.running_tid"),
                Value::Null,
                ChanPolicy {
                    ignore_dup: true,
                    ..ChanPolicy::default()
                },
            ))?;
            ctx.system.cpu_mut(g).chans = Some(CpuChans {
                nrunning,
                running_tid,
            });
        }
        debug!(
            threads = ctx.system.nthreads(),
            cpus = ctx.system.ncpus(),
            "spool channels created"
        );
        Ok(())
    }

    fn connect(&mut self, ctx: &mut SetupCtx) -> Result<(), ModelError> {
        for t in ctx.system.threads() {
            let chans = thread_chans(ctx.system, t.gindex)?;
            let row = t.gindex as u32;
            ctx.exports.push(Export {
                target: ExportTarget::Thread,
                row,
                ty: TY_THREAD_STATE,
                chan: chans.state,
                policy: EmitPolicy::SkipDup,
            });
            ctx.exports.push(Export {
                target: ExportTarget::Thread,
                row,
                ty: TY_THREAD_CPU,
                chan: chans.cpu,
                policy: EmitPolicy::SkipDup,
            });
        }
        let mut nrunning = Vec::with_capacity(ctx.system.ncpus());
        for g in 0..ctx.system.ncpus() {
            let chans = cpu_chans(ctx.system, g)?;
            let row = g as u32;
            ctx.exports.push(Export {
                target: ExportTarget::Cpu,
                row,
                ty: TY_CPU_NRUNNING,
                chan: chans.nrunning,
                policy: EmitPolicy::SkipDup,
            });
            ctx.exports.push(Export {
                target: ExportTarget::Cpu,
                row,
                ty: TY_CPU_RUNNING_TID,
                chan: chans.running_tid,
                policy: EmitPolicy::SkipDup,
            });
            nrunning.push(chans.nrunning);
        }

        // Rank view: row r shows the r-th busiest cpu's running count.
        let mut outputs = Vec::with_capacity(nrunning.len());
        for rank in 0..nrunning.len() {
            outputs.push(ctx.bay.register(Chan::single(
                format!("spool.sort.nrunning.{rank}"),
                Value::Null,
                ChanPolicy::relaxed(),
            ))?);
        }
        let sorted = sort::create(
            ctx.bay,
            SortSpec {
                inputs: nrunning,
                outputs,
            },
        )?;
        for (rank, &chan) in sorted.outputs.iter().enumerate() {
            ctx.exports.push(Export {
                target: ExportTarget::Cpu,
                row: rank as u32,
                ty: TY_CPU_NRUNNING_RANK,
                chan,
                policy: EmitPolicy::SkipDup,
            });
        }
        Ok(())
    }

    fn event(&mut self, ctx: &mut EvCtx, ev: &PlayerEv) -> Result<(), ModelError> {
        match (ev.mcv.category(), ev.mcv.value()) {
            (b'H', b'c') => self.on_create(ctx, ev),
            (b'H', b'x') => self.on_execute(ctx, ev),
            (b'H', b'o') => self.on_cool(ctx, ev),
            (b'H', b'w') => self.on_warm(ctx, ev),
            (b'H', b'p') => self.on_pause(ctx, ev),
            (b'H', b'e') => self.on_end(ctx, ev),
            (b'A', b's') => self.on_affinity(ctx, ev),
            _ => Err(ModelError::UnknownEvent {
                model: "spool",
                mcv: ev.mcv,
            }),
        }
    }

    fn finish(&mut self, system: &System) -> Result<(), ModelError> {
        for t in system.threads() {
            if t.state != ThreadState::Dead && t.state != ThreadState::Unknown {
                warn!(thread = %t.ident, state = ?t.state, "thread still alive at end of trace");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bay::Bay;
    use crate::config::Options;
    use crate::record::{StreamRecorder, TraceRecorder};
    use crate::system::System;
    use crate::trace::Trace;
    use tempfile::TempDir;

    struct Rig {
        _dir: TempDir,
        system: System,
        bay: Bay,
        model: SpoolModel,
        exports: Vec<Export>,
        options: Options,
    }

    /// One host `node0` with `cpus` real cpus and the given tids. Every
    /// stream carries a dummy spool event so the sidecar announces `S`.
    fn rig(cpus: u32, tids: &[u32]) -> Rig {
        let dir = TempDir::new().unwrap();
        let mut rec = TraceRecorder::create(dir.path().join("trace")).unwrap();
        rec.host("node0", cpus).unwrap();
        for &tid in tids {
            let mut sr = StreamRecorder::new();
            sr.event(0, "SHc", &(-1i32).to_le_bytes()).unwrap();
            rec.thread("node0", tid, sr).unwrap();
        }
        let trace = Trace::load(rec.root()).unwrap();
        let system = System::new(&trace);
        let mut r = Rig {
            _dir: dir,
            system,
            bay: Bay::new(),
            model: SpoolModel::new(),
            exports: Vec::new(),
            options: Options::default(),
        };
        let mut ctx = SetupCtx {
            system: &mut r.system,
            bay: &mut r.bay,
            options: &r.options,
            exports: &mut r.exports,
        };
        assert!(r.model.probe(&mut ctx).unwrap());
        r.model.create(&mut ctx).unwrap();
        r.model.connect(&mut ctx).unwrap();
        r.bay.propagate().unwrap();
        r
    }

    impl Rig {
        fn feed(&mut self, thread: usize, mcv: &str, payload: &[u8]) -> Result<(), ModelError> {
            let ev = PlayerEv {
                mcv: mcv.parse().unwrap(),
                raw_clock: 0,
                clock: 0,
                delta: 0,
                payload,
                stream: self.system.thread(thread).stream,
            };
            let mut ctx = EvCtx {
                system: &mut self.system,
                bay: &mut self.bay,
                options: &self.options,
                thread,
            };
            self.model.event(&mut ctx, &ev)
        }

        fn step(&mut self, thread: usize, mcv: &str, payload: &[u8]) {
            self.feed(thread, mcv, payload).unwrap();
            self.bay.propagate().unwrap();
        }

        fn chan(&self, name: &str) -> Value {
            self.bay.value(self.bay.lookup(name).unwrap()).unwrap()
        }
    }

    fn cpu_payload(i: i32) -> [u8; 4] {
        i.to_le_bytes()
    }

    #[test]
    fn probe_follows_the_sidecar_model_list() {
        let dir = TempDir::new().unwrap();
        let mut rec = TraceRecorder::create(dir.path().join("trace")).unwrap();
        rec.host("node0", 1).unwrap();
        let mut sr = StreamRecorder::new();
        sr.event(0, "XYz", &[]).unwrap();
        rec.thread("node0", 1, sr).unwrap();
        let trace = Trace::load(rec.root()).unwrap();
        let mut system = System::new(&trace);
        let mut bay = Bay::new();
        let mut exports = Vec::new();
        let options = Options::default();
        let mut ctx = SetupCtx {
            system: &mut system,
            bay: &mut bay,
            options: &options,
            exports: &mut exports,
        };
        assert!(!SpoolModel::new().probe(&mut ctx).unwrap());
    }

    #[test]
    fn create_wires_threads_cpus_and_exports() {
        let r = rig(2, &[10, 11]);
        // 2 real cpus + 1 virtual.
        assert_eq!(r.system.ncpus(), 3);
        assert_eq!(r.chan("spool.thread.node0.10.state"), Value::Int(0));
        assert_eq!(r.chan("spool.cpu.0.nrunning"), Value::Int(0));
        assert_eq!(r.chan("spool.cpu.2.running_tid"), Value::Null);
        assert!(r.system.thread(0).chans.is_some());
        assert!(r.system.cpu(2).chans.is_some());
        // 2 per thread + 2 per cpu + 1 rank row per cpu.
        assert_eq!(r.exports.len(), 2 * 2 + 2 * 3 + 3);
        // Rank outputs settled to all-zero occupancy.
        assert_eq!(r.chan("spool.sort.nrunning.0"), Value::Int(0));
    }

    #[test]
    fn lifecycle_updates_state_and_occupancy() {
        let mut r = rig(2, &[10]);
        r.step(0, "SHc", &cpu_payload(-1));
        assert_eq!(r.chan("spool.thread.node0.10.state"), Value::Int(4));
        // Bound to the virtual cpu (global index 2).
        assert_eq!(r.chan("spool.thread.node0.10.cpu"), Value::Int(2));

        r.step(0, "SHx", &cpu_payload(0));
        assert_eq!(r.chan("spool.thread.node0.10.state"), Value::Int(1));
        assert_eq!(r.chan("spool.thread.node0.10.cpu"), Value::Int(0));
        assert_eq!(r.chan("spool.cpu.0.nrunning"), Value::Int(1));
        assert_eq!(r.chan("spool.cpu.0.running_tid"), Value::Int(10));

        r.step(0, "SHo", &[]);
        assert_eq!(r.chan("spool.thread.node0.10.state"), Value::Int(2));
        assert_eq!(r.chan("spool.cpu.0.nrunning"), Value::Int(0));
        assert_eq!(r.chan("spool.cpu.0.running_tid"), Value::Null);

        r.step(0, "SHp", &[]);
        r.step(0, "SHw", &[]);
        assert_eq!(r.chan("spool.thread.node0.10.state"), Value::Int(3));
        r.step(0, "SHx", &cpu_payload(1));
        assert_eq!(r.chan("spool.cpu.1.nrunning"), Value::Int(1));

        r.step(0, "SHe", &[]);
        assert_eq!(r.chan("spool.thread.node0.10.state"), Value::Int(5));
        assert_eq!(r.chan("spool.cpu.1.nrunning"), Value::Int(0));
    }

    #[test]
    fn oversubscription_blanks_the_tid_view() {
        let mut r = rig(1, &[10, 11]);
        for t in [0, 1] {
            r.step(t, "SHc", &cpu_payload(0));
            r.step(t, "SHx", &cpu_payload(0));
        }
        assert_eq!(r.chan("spool.cpu.0.nrunning"), Value::Int(2));
        assert_eq!(r.chan("spool.cpu.0.running_tid"), Value::Null);
        // One leaves: the survivor owns the cpu again.
        r.step(0, "SHp", &[]);
        assert_eq!(r.chan("spool.cpu.0.nrunning"), Value::Int(1));
        assert_eq!(r.chan("spool.cpu.0.running_tid"), Value::Int(11));
    }

    #[test]
    fn affinity_moves_occupancy_between_cpus() {
        let mut r = rig(2, &[10]);
        r.step(0, "SHc", &cpu_payload(0));
        r.step(0, "SHx", &cpu_payload(0));
        r.step(0, "SAs", &cpu_payload(1));
        assert_eq!(r.chan("spool.cpu.0.nrunning"), Value::Int(0));
        assert_eq!(r.chan("spool.cpu.1.nrunning"), Value::Int(1));
        assert_eq!(r.chan("spool.cpu.1.running_tid"), Value::Int(10));
        assert_eq!(r.chan("spool.thread.node0.10.cpu"), Value::Int(1));
        // Same-cpu move is a no-op round.
        r.step(0, "SAs", &cpu_payload(1));
        assert_eq!(r.chan("spool.cpu.1.nrunning"), Value::Int(1));
    }

    #[test]
    fn rank_view_tracks_the_busiest_cpu() {
        let mut r = rig(2, &[10, 11]);
        for (t, c) in [(0, 0), (1, 1)] {
            r.step(t, "SHc", &cpu_payload(c));
            r.step(t, "SHx", &cpu_payload(c));
        }
        assert_eq!(r.chan("spool.sort.nrunning.0"), Value::Int(1));
        assert_eq!(r.chan("spool.sort.nrunning.1"), Value::Int(1));
        assert_eq!(r.chan("spool.sort.nrunning.2"), Value::Int(0));
        r.step(1, "SAs", &cpu_payload(0));
        assert_eq!(r.chan("spool.sort.nrunning.0"), Value::Int(2));
        assert_eq!(r.chan("spool.sort.nrunning.1"), Value::Int(0));
    }

    #[test]
    fn illegal_transitions_are_fatal() {
        let mut r = rig(1, &[10]);
        let err = r.feed(0, "SHx", &cpu_payload(0)).unwrap_err();
        assert!(matches!(
            err,
            ModelError::ThreadTransition {
                op: "execute",
                state: ThreadState::Unknown,
                ..
            }
        ));
        r.bay.propagate().unwrap();

        r.step(0, "SHc", &cpu_payload(0));
        r.step(0, "SHx", &cpu_payload(0));
        r.step(0, "SHp", &[]);
        r.step(0, "SHe", &[]);
        let err = r.feed(0, "SHw", &[]).unwrap_err();
        assert!(matches!(
            err,
            ModelError::ThreadTransition {
                state: ThreadState::Dead,
                ..
            }
        ));
    }

    #[test]
    fn payload_shape_is_checked() {
        let mut r = rig(1, &[10]);
        let err = r.feed(0, "SHc", &[1, 2]).unwrap_err();
        assert!(matches!(err, ModelError::Payload { .. }));
        let err = r.feed(0, "SHc", &[0, 0, 0, 0, 9]).unwrap_err();
        assert!(matches!(err, ModelError::Payload { .. }));
    }

    #[test]
    fn unknown_spool_event_is_fatal() {
        let mut r = rig(1, &[10]);
        let err = r.feed(0, "SQz", &[]).unwrap_err();
        assert!(matches!(err, ModelError::UnknownEvent { model: "spool", .. }));
    }
}
