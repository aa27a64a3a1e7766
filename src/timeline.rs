//! Timeline output.
//!
//! Models publish state through channels; a [`TimelineSink`] bound to the
//! bay's emit phase turns settled channel values into timeline rows. The
//! sink is the only writer entry point: nothing else observes channel
//! values mid-round, so every written line corresponds to a fully settled
//! propagation.

use std::collections::HashMap;
use std::io::{self, Write};

use thiserror::Error;

use crate::bay::{Bay, BayCore, BayError, BayHook, ChanId, HookId, HookResult, Phase};
use crate::value::Value;

#[derive(Debug, Error)]
pub enum TimelineError {
    #[error("timeline write failed")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Bay(#[from] BayError),
}

/// Sink for one timeline file. `row` is the horizontal lane, `ty` the
/// quantity plotted on it, `value` the new segment value (none for null).
pub trait TimelineWriter {
    fn write(&mut self, row: u32, ty: u32, time: i64, value: Option<i64>) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

/// Tab-separated timeline lines: `time<TAB>row<TAB>type<TAB>value`, with an
/// empty last column for null.
pub struct TsvWriter<W: Write> {
    out: W,
    lines: u64,
}

impl<W: Write> TsvWriter<W> {
    pub fn new(out: W) -> Self {
        TsvWriter { out, lines: 0 }
    }

    pub fn lines(&self) -> u64 {
        self.lines
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> TimelineWriter for TsvWriter<W> {
    fn write(&mut self, row: u32, ty: u32, time: i64, value: Option<i64>) -> io::Result<()> {
        match value {
            Some(v) => writeln!(self.out, "{time}\t{row}\t{ty}\t{v}")?,
            None => writeln!(self.out, "{time}\t{row}\t{ty}\t")?,
        }
        self.lines += 1;
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}

/// Duplicate handling for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitPolicy {
    /// Suppress a write when the value matches the last one written for
    /// this (row, type).
    SkipDup,
    /// Write every settled round, repeats included.
    EmitDup,
}

#[derive(Debug)]
struct Reg {
    chan: ChanId,
    row: u32,
    ty: u32,
    policy: EmitPolicy,
    last: Option<Value>,
}

/// Emit-phase hook that renders channel values into a [`TimelineWriter`].
///
/// Creation is two-step: [`TimelineSink::track`] binds registrations while
/// the sink is still outside the bay, [`TimelineSink::prime`] writes the
/// starting segment of every row, and [`TimelineSink::install`] finally
/// moves the sink in. Rounds propagated before the install are invisible
/// to it, which is exactly what the setup phase wants.
pub struct TimelineSink<W: TimelineWriter> {
    writer: W,
    hook: HookId,
    regs: Vec<Reg>,
    by_chan: HashMap<ChanId, Vec<usize>>,
}

impl<W: TimelineWriter + 'static> TimelineSink<W> {
    pub fn new(bay: &mut Bay, writer: W) -> Self {
        TimelineSink {
            writer,
            hook: bay.reserve_hook(),
            regs: Vec::new(),
            by_chan: HashMap::new(),
        }
    }

    /// Feeds `(row, ty)` from `chan`, with the given duplicate policy.
    pub fn track(
        &mut self,
        bay: &mut Bay,
        chan: ChanId,
        row: u32,
        ty: u32,
        policy: EmitPolicy,
    ) -> Result<(), TimelineError> {
        bay.bind(Phase::Emit, chan, self.hook, true)?;
        self.by_chan.entry(chan).or_default().push(self.regs.len());
        self.regs.push(Reg {
            chan,
            row,
            ty,
            policy,
            last: None,
        });
        Ok(())
    }

    /// Writes the current value of every registration, stamped at `time`,
    /// so each row starts with a defined segment. Runs in registration
    /// order, keeping the file head stable across runs.
    pub fn prime(&mut self, bay: &Bay, time: i64) -> Result<(), TimelineError> {
        for reg in &mut self.regs {
            let value = bay.value(reg.chan)?;
            self.writer.write(reg.row, reg.ty, time, value.as_int())?;
            reg.last = Some(value);
        }
        Ok(())
    }

    pub fn nregs(&self) -> usize {
        self.regs.len()
    }

    pub fn install(self, bay: &mut Bay) -> Result<(), BayError> {
        let hook = self.hook;
        bay.install_hook(hook, Box::new(self))
    }
}

impl<W: TimelineWriter> BayHook for TimelineSink<W> {
    fn fire(&mut self, core: &mut BayCore, chan: ChanId) -> HookResult {
        let value = core.value(chan)?;
        let time = core.now();
        let Some(indices) = self.by_chan.get(&chan) else {
            return Ok(());
        };
        for &i in indices {
            let reg = &mut self.regs[i];
            if reg.policy == EmitPolicy::SkipDup && reg.last == Some(value) {
                continue;
            }
            self.writer.write(reg.row, reg.ty, time, value.as_int())?;
            reg.last = Some(value);
        }
        Ok(())
    }

    fn finish(&mut self, _core: &mut BayCore) -> HookResult {
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::{Chan, ChanPolicy};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Collects writes in memory so assertions can see ordering.
    #[derive(Clone, Default)]
    struct MemWriter {
        lines: Rc<RefCell<Vec<(i64, u32, u32, Option<i64>)>>>,
        flushed: Rc<RefCell<bool>>,
    }

    impl TimelineWriter for MemWriter {
        fn write(&mut self, row: u32, ty: u32, time: i64, value: Option<i64>) -> io::Result<()> {
            self.lines.borrow_mut().push((time, row, ty, value));
            Ok(())
        }

        fn flush(&mut self) -> io::Result<()> {
            *self.flushed.borrow_mut() = true;
            Ok(())
        }
    }

    fn relaxed(name: &str, initial: Value) -> Chan {
        Chan::single(name, initial, ChanPolicy::relaxed())
    }

    #[test]
    fn tsv_lines_have_an_empty_value_column_for_null() {
        let mut w = TsvWriter::new(Vec::new());
        w.write(3, 10, 100, Some(7)).unwrap();
        w.write(4, 10, 200, None).unwrap();
        assert_eq!(w.lines(), 2);
        let text = String::from_utf8(w.into_inner()).unwrap();
        assert_eq!(text, "100\t3\t10\t7\n200\t4\t10\t\n");
    }

    #[test]
    fn prime_then_emit_on_settled_rounds() {
        let mut bay = Bay::new();
        let w = MemWriter::default();
        let a = bay.register(relaxed("a", Value::Int(5))).unwrap();

        let mut sink = TimelineSink::new(&mut bay, w.clone());
        sink.track(&mut bay, a, 0, 10, EmitPolicy::SkipDup).unwrap();
        sink.prime(&bay, 0).unwrap();
        sink.install(&mut bay).unwrap();

        bay.set_now(100);
        bay.set(a, Value::Int(6)).unwrap();
        bay.propagate().unwrap();

        assert_eq!(
            *w.lines.borrow(),
            vec![(0, 0, 10, Some(5)), (100, 0, 10, Some(6))]
        );
    }

    #[test]
    fn skip_dup_suppresses_repeats_and_emit_dup_keeps_them() {
        let mut bay = Bay::new();
        let w = MemWriter::default();
        let a = bay.register(relaxed("a", Value::Null)).unwrap();

        let mut sink = TimelineSink::new(&mut bay, w.clone());
        sink.track(&mut bay, a, 0, 10, EmitPolicy::SkipDup).unwrap();
        sink.track(&mut bay, a, 1, 11, EmitPolicy::EmitDup).unwrap();
        sink.prime(&bay, 0).unwrap();
        sink.install(&mut bay).unwrap();

        // Same value twice: the relaxed policy lets the chan dirty itself
        // both rounds, but only the EmitDup row writes twice.
        for now in [10, 20] {
            bay.set_now(now);
            bay.set(a, Value::Int(1)).unwrap();
            bay.propagate().unwrap();
        }

        let lines = w.lines.borrow();
        let row0: Vec<_> = lines.iter().filter(|l| l.1 == 0).collect();
        let row1: Vec<_> = lines.iter().filter(|l| l.1 == 1).collect();
        assert_eq!(row0.len(), 2); // prime + first write
        assert_eq!(row1.len(), 3); // prime + both writes
        assert_eq!(*row1[2], (20, 1, 11, Some(1)));
    }

    #[test]
    fn untracked_channels_do_not_reach_the_writer() {
        let mut bay = Bay::new();
        let w = MemWriter::default();
        let a = bay.register(relaxed("a", Value::Null)).unwrap();
        let b = bay.register(relaxed("b", Value::Null)).unwrap();

        let mut sink = TimelineSink::new(&mut bay, w.clone());
        sink.track(&mut bay, a, 0, 10, EmitPolicy::SkipDup).unwrap();
        sink.prime(&bay, 0).unwrap();
        sink.install(&mut bay).unwrap();

        bay.set(b, Value::Int(9)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(w.lines.borrow().len(), 1); // prime only
    }

    #[test]
    fn finish_flushes_through_the_bay() {
        let mut bay = Bay::new();
        let w = MemWriter::default();
        bay.register(relaxed("a", Value::Null)).unwrap();
        let sink = TimelineSink::new(&mut bay, w.clone());
        sink.install(&mut bay).unwrap();
        bay.finish().unwrap();
        assert!(*w.flushed.borrow());
    }
}
