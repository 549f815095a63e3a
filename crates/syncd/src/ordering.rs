//! Deterministic total ordering and dedup over a set of operations drawn
//! from one or more peers. Pure, allocation-light, no I/O —
//! any two implementations fed the same input set must produce the same
//! output order.

use sync_proto::clock::{ClockOrdering, VectorClock};
use sync_proto::id::Id128;
use sync_proto::types::Operation;
use std::cmp::Ordering;

/// Produce the total order: topological by causal dependency, with
/// concurrent operations broken by `(created_at, device_id, op_id)`.
///
/// This is a stable insertion sort over the causal partial order rather
/// than a generic topo-sort, because the tie-break must be total and
/// consistent regardless of input order — a comparator-based sort gives
/// that directly as long as the comparator is itself a valid total order
/// extension of the partial one, which it is: causally-ordered pairs
/// always differ on the tie-break fields too (a strictly dominates b
/// implies a's device counter, and hence a.created_at, is >= b's for the
/// same device, and differing devices fall back to device_id/op_id).
pub fn total_order(mut ops: Vec<Operation>) -> Vec<Operation> {
    ops.sort_by(|a, b| compare_ops(a, b));
    ops
}

fn compare_ops(a: &Operation, b: &Operation) -> Ordering {
    match a.vector_clock.compare(&b.vector_clock) {
        ClockOrdering::Less => Ordering::Less,
        ClockOrdering::Greater => Ordering::Greater,
        ClockOrdering::Equal | ClockOrdering::Concurrent => tie_break(a, b),
    }
}

fn tie_break(a: &Operation, b: &Operation) -> Ordering {
    a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.device_id.cmp(&b.device_id))
        .then_with(|| a.op_id.cmp(&b.op_id))
}

/// Discard operations already present locally: either by op_id, or
/// dominated by the local clock for their originating device (i.e. the
/// local clock's counter for that device already covers this op).
pub fn dedup(ops: Vec<Operation>, local_clock: &VectorClock, already_logged: impl Fn(&Id128) -> bool) -> Vec<Operation> {
    ops.into_iter()
        .filter(|op| {
            if already_logged(&op.op_id) {
                return false;
            }
            op.vector_clock.get(&op.device_id) > local_clock.get(&op.device_id)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_proto::types::OpType;

    fn op(device: Id128, device_counter: u64, created_at: u64, op_id_seed: u8) -> Operation {
        let mut vc = VectorClock::new();
        for _ in 0..device_counter {
            vc.increment(device);
        }
        let mut op_id_bytes = [0u8; 16];
        op_id_bytes[15] = op_id_seed;
        Operation {
            op_id: Id128(op_id_bytes),
            device_id: device,
            parent_op_id: None,
            vector_clock: vc,
            table_name: "t".into(),
            op_type: OpType::Insert,
            row_pk: vec![op_id_seed],
            old_values: None,
            new_values: None,
            schema_version: 0,
            created_at,
            is_local: false,
            applied_at: None,
        }
    }

    fn device(n: u8) -> Id128 {
        let mut b = [0u8; 16];
        b[14] = n;
        Id128(b)
    }

    #[test]
    fn causally_ordered_ops_stay_in_causal_order() {
        let d = device(1);
        let a = op(d, 1, 100, 1);
        let b = op(d, 2, 200, 2);
        let ordered = total_order(vec![b.clone(), a.clone()]);
        assert_eq!(ordered[0].op_id, a.op_id);
        assert_eq!(ordered[1].op_id, b.op_id);
    }

    #[test]
    fn concurrent_ops_break_tie_by_timestamp_then_device_then_op_id() {
        let a = op(device(1), 1, 100, 1);
        let b = op(device(2), 1, 50, 2);
        let ordered = total_order(vec![a.clone(), b.clone()]);
        assert_eq!(ordered[0].op_id, b.op_id);
        assert_eq!(ordered[1].op_id, a.op_id);
    }

    #[test]
    fn ordering_is_independent_of_input_order() {
        let d1 = device(1);
        let d2 = device(2);
        let a = op(d1, 1, 10, 1);
        let b = op(d2, 1, 10, 2);
        let c = op(d1, 2, 30, 3);

        let order1 = total_order(vec![a.clone(), b.clone(), c.clone()]);
        let order2 = total_order(vec![c.clone(), a.clone(), b.clone()]);
        let ids1: Vec<_> = order1.iter().map(|o| o.op_id).collect();
        let ids2: Vec<_> = order2.iter().map(|o| o.op_id).collect();
        assert_eq!(ids1, ids2);
    }

    #[test]
    fn dedup_drops_ops_already_logged() {
        let a = op(device(1), 1, 10, 1);
        let result = dedup(vec![a.clone()], &VectorClock::new(), |id| *id == a.op_id);
        assert!(result.is_empty());
    }

    #[test]
    fn dedup_drops_ops_dominated_by_local_clock() {
        let d = device(1);
        let a = op(d, 1, 10, 1);
        let mut local = VectorClock::new();
        local.increment(d);
        local.increment(d);
        let result = dedup(vec![a], &local, |_| false);
        assert!(result.is_empty());
    }

    #[test]
    fn dedup_keeps_genuinely_new_ops() {
        let d = device(1);
        let a = op(d, 1, 10, 1);
        let result = dedup(vec![a.clone()], &VectorClock::new(), |_| false);
        assert_eq!(result.len(), 1);
    }
}
