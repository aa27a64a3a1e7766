//! Order-statistics view over integer channels.
//!
//! Watches N integer input channels and keeps N output channels holding
//! their values in descending order: output 0 is always the maximum.
//! Updates use a bounded shift instead of a full re-sort, and an output is
//! only rewritten when the value at its rank actually changed.

use std::collections::HashMap;

use thiserror::Error;

use crate::bay::{Bay, BayCore, BayError, BayHook, ChanId, HookResult, Phase};
use crate::chan::ChanKind;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum SortError {
    #[error(transparent)]
    Bay(#[from] BayError),
    #[error("sort needs matching input/output counts, got {ninputs} and {noutputs}")]
    Shape { ninputs: usize, noutputs: usize },
    #[error("sort output {chan} must be a single-value channel")]
    OutputKind { chan: String },
    #[error("sort output {chan} must allow duplicate and dirty writes")]
    OutputPolicy { chan: String },
    #[error("sort input {chan} holds {value}, expected an integer")]
    InputValue { chan: String, value: Value },
    #[error("sort fired for unbound channel {chan}")]
    UnknownInput { chan: ChanId },
}

pub struct SortSpec {
    pub inputs: Vec<ChanId>,
    pub outputs: Vec<ChanId>,
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub outputs: Vec<ChanId>,
}

struct SortHook {
    outputs: Vec<ChanId>,
    /// Current value per input, indexed like [`SortSpec::inputs`].
    values: Vec<i64>,
    /// The same values kept sorted in descending order.
    sorted: Vec<i64>,
    index_of: HashMap<ChanId, usize>,
}

/// Replaces one occurrence of `old` with `new`, restoring descending order
/// with a single shift pass bounded by the distance between the two ranks.
fn sort_replace(sorted: &mut [i64], old: i64, new: i64) {
    let mut i = sorted.partition_point(|&x| x > old);
    debug_assert!(i < sorted.len() && sorted[i] == old);
    while i + 1 < sorted.len() && sorted[i + 1] > new {
        sorted[i] = sorted[i + 1];
        i += 1;
    }
    while i > 0 && sorted[i - 1] < new {
        sorted[i] = sorted[i - 1];
        i -= 1;
    }
    sorted[i] = new;
}

impl SortHook {
    fn republish(&self, core: &mut BayCore) -> HookResult {
        for (rank, &out) in self.outputs.iter().enumerate() {
            let want = Value::Int(self.sorted[rank]);
            if core.value(out)? != want {
                core.set(out, want)?;
            }
        }
        Ok(())
    }
}

impl BayHook for SortHook {
    fn fire(&mut self, core: &mut BayCore, chan: ChanId) -> HookResult {
        let &idx = self
            .index_of
            .get(&chan)
            .ok_or(SortError::UnknownInput { chan })?;
        let value = core.value(chan)?;
        let Some(new) = value.as_int() else {
            return Err(SortError::InputValue {
                chan: core.name_of(chan)?.to_string(),
                value,
            }
            .into());
        };
        let old = self.values[idx];
        if new == old {
            return Ok(());
        }
        self.values[idx] = new;
        sort_replace(&mut self.sorted, old, new);
        self.republish(core)
    }
}

/// Wires the sort into the bay. Inputs must already hold integers; the
/// initial ranking is written to the outputs as part of creation.
pub fn create(bay: &mut Bay, spec: SortSpec) -> Result<Sort, SortError> {
    let SortSpec { inputs, outputs } = spec;
    if inputs.is_empty() || inputs.len() != outputs.len() {
        return Err(SortError::Shape {
            ninputs: inputs.len(),
            noutputs: outputs.len(),
        });
    }
    for &out in &outputs {
        let chan = bay.core().chan(out)?;
        if chan.kind() != ChanKind::Single {
            return Err(SortError::OutputKind {
                chan: chan.name().to_string(),
            });
        }
        let policy = chan.policy();
        if !policy.allow_dup || !policy.allow_dirty {
            return Err(SortError::OutputPolicy {
                chan: chan.name().to_string(),
            });
        }
    }

    let mut values = Vec::with_capacity(inputs.len());
    for &input in &inputs {
        let value = bay.value(input)?;
        let Some(v) = value.as_int() else {
            return Err(SortError::InputValue {
                chan: bay.core().chan(input)?.name().to_string(),
                value,
            });
        };
        values.push(v);
    }
    let mut sorted = values.clone();
    sorted.sort_unstable_by(|a, b| b.cmp(a));

    let hook = bay.reserve_hook();
    let mut index_of = HashMap::with_capacity(inputs.len());
    for (i, &input) in inputs.iter().enumerate() {
        bay.bind(Phase::Dirty, input, hook, true)?;
        index_of.insert(input, i);
    }
    for (rank, &out) in outputs.iter().enumerate() {
        bay.set(out, Value::Int(sorted[rank]))?;
    }
    let sort = Sort {
        outputs: outputs.clone(),
    };
    bay.install_hook(
        hook,
        Box::new(SortHook {
            outputs,
            values,
            sorted,
            index_of,
        }),
    )?;
    Ok(sort)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chan::{Chan, ChanPolicy};
    use proptest::prelude::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn build(n: usize, initial: &[i64]) -> (Bay, Vec<ChanId>, Sort) {
        let mut bay = Bay::new();
        let inputs: Vec<ChanId> = (0..n)
            .map(|i| {
                bay.register(Chan::single(
                    format!("in.{i}"),
                    Value::Int(initial[i]),
                    ChanPolicy {
                        allow_dup: true,
                        ignore_dup: false,
                        allow_dirty: true,
                    },
                ))
                .unwrap()
            })
            .collect();
        let outputs: Vec<ChanId> = (0..n)
            .map(|i| {
                bay.register(Chan::single(
                    format!("rank.{i}"),
                    Value::Null,
                    ChanPolicy::relaxed(),
                ))
                .unwrap()
            })
            .collect();
        let sort = create(&mut bay, SortSpec { inputs: inputs.clone(), outputs }).unwrap();
        (bay, inputs, sort)
    }

    fn ranks(bay: &Bay, sort: &Sort) -> Vec<i64> {
        sort.outputs
            .iter()
            .map(|&o| bay.value(o).unwrap().as_int().unwrap())
            .collect()
    }

    #[test]
    fn initial_ranking_is_descending() {
        let (mut bay, _inputs, sort) = build(4, &[3, 9, 1, 9]);
        bay.propagate().unwrap();
        assert_eq!(ranks(&bay, &sort), vec![9, 9, 3, 1]);
    }

    #[test]
    fn rank_zero_tracks_the_maximum() {
        let (mut bay, inputs, sort) = build(3, &[0, 0, 0]);
        bay.propagate().unwrap();
        bay.set(inputs[1], Value::Int(5)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(ranks(&bay, &sort), vec![5, 0, 0]);
        bay.set(inputs[2], Value::Int(9)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(ranks(&bay, &sort), vec![9, 5, 0]);
        bay.set(inputs[2], Value::Int(1)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(ranks(&bay, &sort), vec![5, 1, 0]);
    }

    #[test]
    fn unchanged_ranks_are_not_republished() {
        let (mut bay, inputs, sort) = build(3, &[10, 5, 1]);
        bay.propagate().unwrap();
        let emits = Rc::new(RefCell::new([0u32; 3]));
        for (rank, &out) in sort.outputs.iter().enumerate() {
            let emits = Rc::clone(&emits);
            bay.add_callback(Phase::Emit, out, true, move |_c: &mut BayCore, _| {
                emits.borrow_mut()[rank] += 1;
                Ok(())
            })
            .unwrap();
        }
        // 5 -> 7 keeps every rank position except the middle one.
        bay.set(inputs[1], Value::Int(7)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(*emits.borrow(), [0, 1, 0]);
        assert_eq!(ranks(&bay, &sort), vec![10, 7, 1]);
    }

    #[test]
    fn duplicate_values_move_correctly() {
        let (mut bay, inputs, sort) = build(4, &[4, 4, 4, 4]);
        bay.propagate().unwrap();
        bay.set(inputs[0], Value::Int(2)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(ranks(&bay, &sort), vec![4, 4, 4, 2]);
        bay.set(inputs[3], Value::Int(6)).unwrap();
        bay.propagate().unwrap();
        assert_eq!(ranks(&bay, &sort), vec![6, 4, 4, 2]);
    }

    #[test]
    fn mismatched_shape_is_rejected() {
        let mut bay = Bay::new();
        let a = bay
            .register(Chan::single("a", Value::Int(0), ChanPolicy::relaxed()))
            .unwrap();
        let err = create(
            &mut bay,
            SortSpec {
                inputs: vec![a],
                outputs: vec![],
            },
        )
        .unwrap_err();
        assert!(matches!(err, SortError::Shape { ninputs: 1, noutputs: 0 }));
    }

    #[test]
    fn null_input_is_rejected_at_creation() {
        let mut bay = Bay::new();
        let input = bay
            .register(Chan::single("in", Value::Null, ChanPolicy::relaxed()))
            .unwrap();
        let out = bay
            .register(Chan::single("out", Value::Null, ChanPolicy::relaxed()))
            .unwrap();
        let err = create(
            &mut bay,
            SortSpec {
                inputs: vec![input],
                outputs: vec![out],
            },
        )
        .unwrap_err();
        assert!(matches!(err, SortError::InputValue { .. }));
    }

    #[test]
    fn sort_replace_matches_a_full_sort() {
        let mut sorted = vec![9, 7, 7, 3, 0];
        sort_replace(&mut sorted, 7, 10);
        assert_eq!(sorted, vec![10, 9, 7, 3, 0]);
        sort_replace(&mut sorted, 0, 8);
        assert_eq!(sorted, vec![10, 9, 8, 7, 3]);
        sort_replace(&mut sorted, 10, -1);
        assert_eq!(sorted, vec![9, 8, 7, 3, -1]);
        sort_replace(&mut sorted, 7, 7);
        assert_eq!(sorted, vec![9, 8, 7, 3, -1]);
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

        #[test]
        fn stays_sorted_under_random_updates(
            n in 2usize..300,
            seed_updates in proptest::collection::vec((any::<prop::sample::Index>(), -1000i64..1000), 1..25),
        ) {
            let initial = vec![0i64; n];
            let (mut bay, inputs, sort) = build(n, &initial);
            bay.propagate().unwrap();
            let mut shadow = initial;
            for (pick, value) in seed_updates {
                let idx = pick.index(n);
                shadow[idx] = value;
                // Duplicate writes of the current value are legal here, the
                // input policy allows them.
                bay.set(inputs[idx], Value::Int(value)).unwrap();
                bay.propagate().unwrap();
            }
            let mut expect = shadow.clone();
            expect.sort_unstable_by(|a, b| b.cmp(a));
            prop_assert_eq!(ranks(&bay, &sort), expect);
        }
    }
}
