//! Thread-state gated channel views.
//!
//! A track is a one-input mux whose select channel is a thread's state
//! channel: the output mirrors the input only while the thread state
//! qualifies for the chosen mode, and shows the default otherwise.
//! Timelines use this to blank out per-thread values whenever the thread
//! is off-cpu.

use crate::bay::{Bay, ChanId};
use crate::chan::{Chan, ChanPolicy};
use crate::mux::{self, MuxError, MuxSpec, SelectMap};
use crate::system::ThreadState;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackMode {
    /// Pass the input through only while the thread is Running.
    Running,
    /// Pass it through while the thread is alive, including Paused.
    Active,
}

impl TrackMode {
    fn qualifies(self, state: i64) -> bool {
        match self {
            TrackMode::Running => state == ThreadState::Running.as_int(),
            TrackMode::Active => [
                ThreadState::Running,
                ThreadState::Cooling,
                ThreadState::Warming,
                ThreadState::Paused,
            ]
            .iter()
            .any(|s| s.as_int() == state),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Track {
    pub output: ChanId,
}

/// Registers the output channel and wires the gating mux. The output is
/// named by the caller, conventionally `<input>.run` or `<input>.act`.
pub fn create(
    bay: &mut Bay,
    output_name: &str,
    mode: TrackMode,
    state: ChanId,
    input: ChanId,
    default: Value,
) -> Result<Track, MuxError> {
    let output = bay.register(Chan::single(output_name, Value::Null, ChanPolicy::relaxed()))?;
    let map: SelectMap = Box::new(move |v| {
        Ok(match v.as_int() {
            Some(s) if mode.qualifies(s) => Some(0),
            _ => None,
        })
    });
    let mux = mux::create(
        bay,
        MuxSpec {
            select: state,
            inputs: vec![input],
            output,
            default,
            select_map: Some(map),
        },
    )?;
    Ok(Track { output: mux.output })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Rig {
        bay: Bay,
        state: ChanId,
        input: ChanId,
    }

    fn rig() -> Rig {
        let mut bay = Bay::new();
        let state = bay
            .register(Chan::single(
                "thread.state",
                Value::Int(ThreadState::Unknown.as_int()),
                ChanPolicy::default(),
            ))
            .unwrap();
        let input = bay
            .register(Chan::single(
                "thread.task",
                Value::Null,
                ChanPolicy {
                    allow_dup: true,
                    ignore_dup: false,
                    allow_dirty: true,
                },
            ))
            .unwrap();
        Rig { bay, state, input }
    }

    fn set_state(rig: &mut Rig, state: ThreadState) {
        rig.bay.set(rig.state, Value::Int(state.as_int())).unwrap();
        rig.bay.propagate().unwrap();
    }

    #[test]
    fn running_mode_blanks_when_not_running() {
        let mut r = rig();
        let track = create(
            &mut r.bay,
            "thread.task.run",
            TrackMode::Running,
            r.state,
            r.input,
            Value::Null,
        )
        .unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Null);

        r.bay.set(r.input, Value::Int(42)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Null);

        set_state(&mut r, ThreadState::Running);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Int(42));

        set_state(&mut r, ThreadState::Paused);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Null);

        set_state(&mut r, ThreadState::Running);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Int(42));
    }

    #[test]
    fn active_mode_keeps_showing_while_paused() {
        let mut r = rig();
        let track = create(
            &mut r.bay,
            "thread.task.act",
            TrackMode::Active,
            r.state,
            r.input,
            Value::Null,
        )
        .unwrap();
        r.bay.set(r.input, Value::Int(7)).unwrap();
        r.bay.propagate().unwrap();

        set_state(&mut r, ThreadState::Running);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Int(7));

        set_state(&mut r, ThreadState::Paused);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Int(7));

        set_state(&mut r, ThreadState::Dead);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Null);
    }

    #[test]
    fn input_changes_flow_only_while_qualified() {
        let mut r = rig();
        let track = create(
            &mut r.bay,
            "thread.task.run",
            TrackMode::Running,
            r.state,
            r.input,
            Value::Null,
        )
        .unwrap();
        set_state(&mut r, ThreadState::Running);
        r.bay.set(r.input, Value::Int(1)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Int(1));

        set_state(&mut r, ThreadState::Cooling);
        r.bay.set(r.input, Value::Int(2)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Null);

        // Coming back picks up the value that changed while blanked.
        set_state(&mut r, ThreadState::Running);
        assert_eq!(r.bay.value(track.output).unwrap(), Value::Int(2));
    }
}
