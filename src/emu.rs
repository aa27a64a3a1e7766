//! Replay driver.
//!
//! Ties the stages together: load the trace, build the system mirror, wire
//! the models into the bay, then stream merged events through them while
//! the timeline sinks write `cpu.tsv` and `thread.tsv`.
//!
//! Setup order matters. Model wiring and the settling round run before the
//! sinks are installed, so combinator bootstrap writes never reach a file;
//! priming then records the settled t=0 value of every tracked channel and
//! only after that do the sinks start listening.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::bay::Bay;
use crate::clkoff::ClockTable;
use crate::config::Options;
use crate::Result;
use crate::model::{EvCtx, ExportTarget, Registry, SetupCtx};
use crate::player::{Player, PlayerOptions, Progress};
use crate::stream::Step;
use crate::system::System;
use crate::timeline::{TimelineSink, TsvWriter};
use crate::trace::Trace;

pub const CPU_TIMELINE: &str = "cpu.tsv";
pub const THREAD_TIMELINE: &str = "thread.tsv";

type FileSink = TimelineSink<TsvWriter<BufWriter<File>>>;

pub struct Emu {
    options: Options,
    out_dir: PathBuf,
    system: System,
    bay: Bay,
    player: Player,
    registry: Registry,
    events: u64,
}

impl std::fmt::Debug for Emu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emu")
            .field("options", &self.options)
            .field("out_dir", &self.out_dir)
            .field("system", &self.system)
            .field("player", &self.player)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Emu {
    /// Loads the trace at `root` and brings the whole pipeline up, ready to
    /// [`step`](Emu::step). Timeline files are created (and truncated) here.
    pub fn new(root: &Path, options: Options) -> Result<Emu> {
        let mut trace = Trace::load(root)?;
        let mut check_skew = true;
        if let Some(path) = &options.clock_offsets {
            let table = ClockTable::load(path)?;
            trace.apply_clock_offsets(&table)?;
            check_skew = false;
        }
        if options.tolerate_unsorted {
            trace.mark_unsorted();
        }

        let mut system = System::new(&trace);
        let player = Player::new(
            trace.take_streams(),
            &PlayerOptions {
                tolerate_unsorted: options.tolerate_unsorted,
                check_skew,
                skew_window_ns: options.skew_window_ns,
            },
        )?;

        let mut bay = Bay::new();
        let mut registry = Registry::builtin()?;
        let mut exports = Vec::new();
        {
            let mut ctx = SetupCtx {
                system: &mut system,
                bay: &mut bay,
                options: &options,
                exports: &mut exports,
            };
            registry.probe(&mut ctx)?;
            registry.create(&mut ctx)?;
            registry.connect(&mut ctx)?;
        }
        // Settle the wiring round while nothing is listening.
        bay.propagate()?;

        let out_dir = match &options.output_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                dir.clone()
            }
            None => root.to_path_buf(),
        };
        let mut cpu_sink = Self::sink(&mut bay, &out_dir, CPU_TIMELINE)?;
        let mut thread_sink = Self::sink(&mut bay, &out_dir, THREAD_TIMELINE)?;
        for export in &exports {
            let sink = match export.target {
                ExportTarget::Cpu => &mut cpu_sink,
                ExportTarget::Thread => &mut thread_sink,
            };
            sink.track(&mut bay, export.chan, export.row, export.ty, export.policy)?;
        }
        cpu_sink.prime(&bay, 0)?;
        thread_sink.prime(&bay, 0)?;
        let (ncpu, nthread) = (cpu_sink.nregs(), thread_sink.nregs());
        cpu_sink.install(&mut bay)?;
        thread_sink.install(&mut bay)?;

        info!(
            hosts = system.hosts().len(),
            threads = system.nthreads(),
            cpus = system.ncpus(),
            cpu_rows = ncpu,
            thread_rows = nthread,
            "replay ready"
        );
        Ok(Emu {
            options,
            out_dir,
            system,
            bay,
            player,
            registry,
            events: 0,
        })
    }

    fn sink(bay: &mut Bay, dir: &Path, name: &str) -> Result<FileSink> {
        let file = File::create(dir.join(name))?;
        Ok(TimelineSink::new(bay, TsvWriter::new(BufWriter::new(file))))
    }

    /// Replays one event: advance the merge, route the event to its model,
    /// then run a propagation round at the event's timeline clock.
    pub fn step(&mut self) -> Result<Step> {
        if self.player.step()? == Step::Done {
            return Ok(Step::Done);
        }
        let Some(ev) = self.player.current() else {
            return Ok(Step::Done);
        };
        let thread = self.system.thread_of_stream(ev.stream)?;
        self.bay.set_now(ev.delta);
        let mut ctx = EvCtx {
            system: &mut self.system,
            bay: &mut self.bay,
            options: &self.options,
            thread,
        };
        self.registry.event(&mut ctx, &ev)?;
        self.bay.propagate()?;
        self.events += 1;
        Ok(Step::Advanced)
    }

    /// Replays until the trace is exhausted or the event cap is hit.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if let Some(cap) = self.options.max_events
                && self.events >= cap
            {
                info!(events = self.events, "event cap reached, stopping replay");
                return Ok(());
            }
            if self.step()? == Step::Done {
                debug!(events = self.events, "trace exhausted");
                return Ok(());
            }
            if self.options.progress_every > 0 && self.events % self.options.progress_every == 0 {
                let p = self.progress();
                info!(
                    events = p.events,
                    regressions = p.regressions,
                    consumed_bytes = p.consumed_bytes,
                    total_bytes = p.total_bytes,
                    "replay progress"
                );
            }
        }
    }

    /// End-of-replay diagnostics and sink flush. Consumes the emulator; the
    /// timeline files are complete once this returns.
    pub fn finish(mut self) -> Result<Progress> {
        self.registry.finish(&self.system)?;
        self.bay.finish()?;
        Ok(self.player.progress())
    }

    pub fn progress(&self) -> Progress {
        self.player.progress()
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    pub fn system(&self) -> &System {
        &self.system
    }

    pub fn bay(&self) -> &Bay {
        &self.bay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{StreamRecorder, TraceRecorder};
    use crate::task::{TaskTable, TaskTypeId};
    use tempfile::TempDir;

    fn u32s(values: &[u32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn gid_of(label: &str) -> i64 {
        let mut table = TaskTable::new();
        table.create_type(TaskTypeId(1), label).unwrap();
        table.task_type(TaskTypeId(1)).unwrap().gid
    }

    /// One thread on one cpu running a single task to completion.
    fn small_trace(dir: &TempDir) -> std::path::PathBuf {
        let mut rec = TraceRecorder::create(dir.path().join("trace")).unwrap();
        rec.host("node0", 1).unwrap();
        let mut sr = StreamRecorder::new();
        sr.event(100, "SHc", &0i32.to_le_bytes()).unwrap();
        sr.event(200, "SHx", &0i32.to_le_bytes()).unwrap();
        let mut tyc = u32s(&[1]);
        tyc.extend_from_slice(b"work");
        sr.event(300, "TYc", &tyc).unwrap();
        sr.event(400, "TTc", &u32s(&[5, 1, 0])).unwrap();
        sr.event(500, "TTx", &u32s(&[5, 0])).unwrap();
        sr.event(600, "TTe", &u32s(&[5, 0])).unwrap();
        sr.event(700, "SHe", &[]).unwrap();
        rec.thread("node0", 10, sr).unwrap();
        rec.root().to_path_buf()
    }

    fn read_lines(path: &Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn replays_a_small_trace_end_to_end() {
        let dir = TempDir::new().unwrap();
        let root = small_trace(&dir);
        let mut emu = Emu::new(&root, Options::default()).unwrap();
        emu.run().unwrap();
        assert_eq!(emu.events(), 7);
        let progress = emu.finish().unwrap();
        assert_eq!(progress.events, 7);
        assert_eq!(progress.regressions, 0);

        let g = gid_of("work");
        let thread = read_lines(&root.join(THREAD_TIMELINE));
        assert_eq!(
            thread,
            vec![
                // Primed rows at t=0: state, cpu, task id, task type, subsystem.
                "0\t0\t10\t0".to_string(),
                "0\t0\t11\t".to_string(),
                "0\t0\t30\t".to_string(),
                "0\t0\t31\t".to_string(),
                "0\t0\t32\t".to_string(),
                // Thread creation lands at delta 0 as well.
                "0\t0\t11\t0".to_string(),
                "0\t0\t10\t4".to_string(),
                "100\t0\t10\t1".to_string(),
                "400\t0\t30\t5".to_string(),
                format!("400\t0\t31\t{g}"),
                "500\t0\t30\t".to_string(),
                "500\t0\t31\t".to_string(),
                "600\t0\t10\t5".to_string(),
            ]
        );

        let cpu = read_lines(&root.join(CPU_TIMELINE));
        // Row 0 is the real cpu, row 1 the host's virtual cpu.
        assert_eq!(
            cpu,
            vec![
                "0\t0\t20\t0".to_string(),
                "0\t0\t21\t".to_string(),
                "0\t1\t20\t0".to_string(),
                "0\t1\t21\t".to_string(),
                "0\t0\t22\t0".to_string(),
                "0\t1\t22\t0".to_string(),
                "0\t0\t30\t".to_string(),
                "0\t0\t31\t".to_string(),
                "0\t0\t32\t".to_string(),
                "0\t1\t30\t".to_string(),
                "0\t1\t31\t".to_string(),
                "0\t1\t32\t".to_string(),
                "100\t0\t20\t1".to_string(),
                "100\t0\t21\t10".to_string(),
                "100\t0\t22\t1".to_string(),
                "400\t0\t30\t5".to_string(),
                format!("400\t0\t31\t{g}"),
                "500\t0\t30\t".to_string(),
                "500\t0\t31\t".to_string(),
                "600\t0\t20\t0".to_string(),
                "600\t0\t21\t".to_string(),
                "600\t0\t22\t0".to_string(),
            ]
        );
    }

    #[test]
    fn output_dir_redirects_the_timelines() {
        let dir = TempDir::new().unwrap();
        let root = small_trace(&dir);
        let out = dir.path().join("out");
        let options = Options {
            output_dir: Some(out.clone()),
            ..Options::default()
        };
        let mut emu = Emu::new(&root, options).unwrap();
        emu.run().unwrap();
        emu.finish().unwrap();
        assert!(out.join(CPU_TIMELINE).is_file());
        assert!(out.join(THREAD_TIMELINE).is_file());
        assert!(!root.join(CPU_TIMELINE).exists());
    }

    #[test]
    fn max_events_caps_the_replay() {
        let dir = TempDir::new().unwrap();
        let root = small_trace(&dir);
        let options = Options {
            max_events: Some(3),
            ..Options::default()
        };
        let mut emu = Emu::new(&root, options).unwrap();
        emu.run().unwrap();
        assert_eq!(emu.events(), 3);
        emu.finish().unwrap();
    }

    #[test]
    fn model_errors_surface_from_step() {
        let dir = TempDir::new().unwrap();
        let mut rec = TraceRecorder::create(dir.path().join("trace")).unwrap();
        rec.host("node0", 1).unwrap();
        let mut sr = StreamRecorder::new();
        // Execute without create is an illegal thread transition.
        sr.event(100, "SHx", &0i32.to_le_bytes()).unwrap();
        rec.thread("node0", 10, sr).unwrap();
        let mut emu = Emu::new(rec.root(), Options::default()).unwrap();
        let err = emu.run().unwrap_err();
        assert!(matches!(err, crate::Error::Model(_)));
    }
}
