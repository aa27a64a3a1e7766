//! Select-driven channel multiplexer.
//!
//! A mux watches one select channel and N input channels, all via dirty
//! callbacks on a single hook object. The select value picks at most one
//! input; the output channel mirrors the picked input and falls back to a
//! default when nothing is selected. Rewiring happens by toggling the
//! callback enable flags of the input bindings, so deselected inputs cost
//! nothing while they change.

use thiserror::Error;

use crate::bay::{Bay, BayCore, BayError, BayHook, CbId, ChanId, HookResult, Phase};
use crate::chan::ChanKind;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum MuxError {
    #[error(transparent)]
    Bay(#[from] BayError),
    #[error("mux output {chan} must be a single-value channel")]
    OutputKind { chan: String },
    #[error("mux output {chan} must allow duplicate and dirty writes")]
    OutputPolicy { chan: String },
    #[error("select channel {chan}: cannot map {value}")]
    SelectorValue { chan: String, value: Value },
    #[error("select channel {chan}: index {index} outside {ninputs} inputs")]
    SelectorRange {
        chan: String,
        index: i64,
        ninputs: usize,
    },
}

/// Maps a select value to an input index, or to nothing.
pub type SelectMap = Box<dyn Fn(Value) -> Result<Option<usize>, MuxError>>;

/// Mux wiring. When `select_map` is absent the select value is taken as the
/// input index directly, with null selecting nothing.
pub struct MuxSpec {
    pub select: ChanId,
    pub inputs: Vec<ChanId>,
    pub output: ChanId,
    pub default: Value,
    pub select_map: Option<SelectMap>,
}

/// Handle to a created mux.
#[derive(Debug, Clone, Copy)]
pub struct Mux {
    pub output: ChanId,
}

struct MuxInput {
    chan: ChanId,
    cb: CbId,
}

struct MuxHook {
    select: ChanId,
    select_name: String,
    inputs: Vec<MuxInput>,
    output: ChanId,
    default: Value,
    selected: Option<usize>,
    map: SelectMap,
}

impl MuxHook {
    fn pick(&self, value: Value) -> Result<Option<usize>, MuxError> {
        let picked = (self.map)(value)?;
        if let Some(i) = picked
            && i >= self.inputs.len()
        {
            return Err(MuxError::SelectorRange {
                chan: self.select_name.clone(),
                index: i as i64,
                ninputs: self.inputs.len(),
            });
        }
        Ok(picked)
    }

    fn on_select(&mut self, core: &mut BayCore) -> HookResult {
        let picked = self.pick(core.value(self.select)?)?;
        if picked == self.selected {
            return Ok(());
        }
        if let Some(old) = self.selected {
            core.set_cb_enabled(self.inputs[old].cb, false)?;
        }
        self.selected = picked;
        let out = match picked {
            Some(i) => {
                core.set_cb_enabled(self.inputs[i].cb, true)?;
                core.value(self.inputs[i].chan)?
            }
            None => self.default,
        };
        core.set(self.output, out)?;
        Ok(())
    }

    fn on_input(&mut self, core: &mut BayCore, chan: ChanId) -> HookResult {
        // Bindings of deselected inputs are disabled, so a firing input is
        // the selected one unless wiring went wrong.
        let forwarding = self
            .selected
            .map(|i| self.inputs[i].chan == chan)
            .unwrap_or(false);
        debug_assert!(forwarding);
        if forwarding {
            core.set(self.output, core.value(chan)?)?;
        }
        Ok(())
    }
}

impl BayHook for MuxHook {
    fn fire(&mut self, core: &mut BayCore, chan: ChanId) -> HookResult {
        if chan == self.select {
            self.on_select(core)
        } else {
            self.on_input(core, chan)
        }
    }
}

fn default_map(select_name: String, ninputs: usize) -> SelectMap {
    Box::new(move |value| match value {
        Value::Null => Ok(None),
        Value::Int(i) if (0..ninputs as i64).contains(&i) => Ok(Some(i as usize)),
        Value::Int(i) => Err(MuxError::SelectorRange {
            chan: select_name.clone(),
            index: i,
            ninputs,
        }),
    })
}

/// Wires a mux into the bay and synchronizes the output with the current
/// select value. The output write lands on the dirty list, so the next
/// propagation publishes the initial state.
pub fn create(bay: &mut Bay, spec: MuxSpec) -> Result<Mux, MuxError> {
    let MuxSpec {
        select,
        inputs,
        output,
        default,
        select_map,
    } = spec;

    let out_chan = bay.core().chan(output)?;
    if out_chan.kind() != ChanKind::Single {
        return Err(MuxError::OutputKind {
            chan: out_chan.name().to_string(),
        });
    }
    let policy = out_chan.policy();
    if !policy.allow_dup || !policy.allow_dirty {
        return Err(MuxError::OutputPolicy {
            chan: out_chan.name().to_string(),
        });
    }
    let select_name = bay.core().chan(select)?.name().to_string();
    for &input in &inputs {
        bay.core().chan(input)?;
    }

    let hook = bay.reserve_hook();
    bay.bind(Phase::Dirty, select, hook, true)?;
    let inputs: Vec<MuxInput> = inputs
        .into_iter()
        .map(|chan| {
            let cb = bay.bind(Phase::Dirty, chan, hook, false)?;
            Ok(MuxInput { chan, cb })
        })
        .collect::<Result<_, BayError>>()?;

    let map = match select_map {
        Some(map) => map,
        None => default_map(select_name.clone(), inputs.len()),
    };
    let mut mux = MuxHook {
        select,
        select_name,
        inputs,
        output,
        default,
        selected: None,
        map,
    };
    // Initial synchronization against whatever the select holds right now.
    let picked = mux.pick(bay.value(select)?)?;
    mux.selected = picked;
    let initial = match picked {
        Some(i) => {
            bay.core_mut().set_cb_enabled(mux.inputs[i].cb, true)?;
            bay.value(mux.inputs[i].chan)?
        }
        None => mux.default,
    };
    bay.set(output, initial)?;
    bay.install_hook(hook, Box::new(mux))?;
    Ok(Mux { output })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::{Chan, ChanPolicy};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Rig {
        bay: Bay,
        select: ChanId,
        inputs: [ChanId; 3],
        output: ChanId,
    }

    fn rig() -> Rig {
        let mut bay = Bay::new();
        let select = bay
            .register(Chan::single("select", Value::Null, ChanPolicy::default()))
            .unwrap();
        let inputs = ["in0", "in1", "in2"].map(|name| {
            bay.register(Chan::single(
                name,
                Value::Null,
                ChanPolicy {
                    allow_dup: true,
                    ignore_dup: false,
                    allow_dirty: true,
                },
            ))
            .unwrap()
        });
        let output = bay
            .register(Chan::single("out", Value::Null, ChanPolicy::relaxed()))
            .unwrap();
        Rig {
            bay,
            select,
            inputs,
            output,
        }
    }

    fn wire(rig: &mut Rig) -> Mux {
        create(
            &mut rig.bay,
            MuxSpec {
                select: rig.select,
                inputs: rig.inputs.to_vec(),
                output: rig.output,
                default: Value::Null,
                select_map: None,
            },
        )
        .unwrap()
    }

    #[test]
    fn output_follows_the_selected_input() {
        let mut r = rig();
        wire(&mut r);
        r.bay.propagate().unwrap();

        for (i, &input) in r.inputs.iter().enumerate() {
            r.bay.set(input, Value::Int(100 + i as i64)).unwrap();
        }
        r.bay.propagate().unwrap();
        // Nothing selected: input changes do not reach the output.
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Null);

        r.bay.set(r.select, Value::Int(1)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(101));

        r.bay.set(r.inputs[1], Value::Int(111)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(111));

        // A deselected input changing is invisible.
        r.bay.set(r.inputs[0], Value::Int(200)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(111));

        // Selecting it picks up the value it changed to meanwhile.
        r.bay.set(r.select, Value::Int(0)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(200));

        // Deselecting falls back to the default.
        r.bay.set(r.select, Value::Null).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Null);
    }

    #[test]
    fn output_emits_once_when_select_and_input_change_together() {
        let mut r = rig();
        wire(&mut r);
        r.bay.propagate().unwrap();
        r.bay.set(r.select, Value::Int(2)).unwrap();
        r.bay.propagate().unwrap();

        let emits = Rc::new(RefCell::new(0u32));
        let emits2 = Rc::clone(&emits);
        r.bay
            .add_callback(Phase::Emit, r.output, true, move |_core: &mut BayCore, _| {
                *emits2.borrow_mut() += 1;
                Ok(())
            })
            .unwrap();

        r.bay.set(r.select, Value::Int(0)).unwrap();
        r.bay.set(r.inputs[0], Value::Int(42)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(*emits.borrow(), 1);
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(42));
    }

    #[test]
    fn out_of_range_select_index_fails_the_round() {
        let mut r = rig();
        wire(&mut r);
        r.bay.propagate().unwrap();
        r.bay.set(r.select, Value::Int(3)).unwrap();
        let err = r.bay.propagate().unwrap_err();
        assert!(err.to_string().contains("select"));
    }

    #[test]
    fn custom_select_map_gates_the_forwarding() {
        let mut r = rig();
        // Odd select values pick input 0, everything else nothing.
        let map: SelectMap = Box::new(|v| {
            Ok(match v.as_int() {
                Some(i) if i % 2 == 1 => Some(0),
                _ => None,
            })
        });
        create(
            &mut r.bay,
            MuxSpec {
                select: r.select,
                inputs: vec![r.inputs[0]],
                output: r.output,
                default: Value::Int(-1),
                select_map: Some(map),
            },
        )
        .unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(-1));

        r.bay.set(r.inputs[0], Value::Int(5)).unwrap();
        r.bay.set(r.select, Value::Int(1)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(5));

        r.bay.set(r.select, Value::Int(2)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(-1));
    }

    #[test]
    fn initial_selection_reads_the_current_select_value() {
        let mut r = rig();
        r.bay.set(r.inputs[2], Value::Int(7)).unwrap();
        r.bay.set(r.select, Value::Int(2)).unwrap();
        r.bay.propagate().unwrap();
        // Created after the select already points at input 2.
        wire(&mut r);
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(7));
        r.bay.set(r.inputs[2], Value::Int(8)).unwrap();
        r.bay.propagate().unwrap();
        assert_eq!(r.bay.value(r.output).unwrap(), Value::Int(8));
    }

    #[test]
    fn strict_output_policy_is_rejected() {
        let mut r = rig();
        let strict = r
            .bay
            .register(Chan::single("strict", Value::Null, ChanPolicy::default()))
            .unwrap();
        let err = create(
            &mut r.bay,
            MuxSpec {
                select: r.select,
                inputs: r.inputs.to_vec(),
                output: strict,
                default: Value::Null,
                select_map: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MuxError::OutputPolicy { .. }));
    }

    #[test]
    fn stack_output_is_rejected() {
        let mut r = rig();
        let stack = r
            .bay
            .register(Chan::stack("stack", ChanPolicy::relaxed()))
            .unwrap();
        let err = create(
            &mut r.bay,
            MuxSpec {
                select: r.select,
                inputs: r.inputs.to_vec(),
                output: stack,
                default: Value::Null,
                select_map: None,
            },
        )
        .unwrap_err();
        assert!(matches!(err, MuxError::OutputKind { .. }));
    }
}
