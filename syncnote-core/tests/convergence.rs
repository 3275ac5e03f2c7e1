//! Randomized convergence checks across replicas.

use proptest::prelude::*;
use syncnote_core::{Doc, DocError, ReplicaId};

#[derive(Debug, Clone)]
enum Op {
    Insert { replica: usize, pos: usize, text: String },
    Delete { replica: usize, pos: usize, len: usize },
    Sync { from: usize, to: usize },
}

const REPLICAS: usize = 3;

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..REPLICAS, any::<usize>(), "[a-zé]{1,4}")
            .prop_map(|(replica, pos, text)| Op::Insert { replica, pos, text }),
        2 => (0..REPLICAS, any::<usize>(), 1..4usize)
            .prop_map(|(replica, pos, len)| Op::Delete { replica, pos, len }),
        1 => (0..REPLICAS, 0..REPLICAS).prop_map(|(from, to)| Op::Sync { from, to }),
    ]
}

fn replicas() -> Vec<Doc> {
    (0..REPLICAS)
        .map(|i| Doc::with_replica(ReplicaId(i as u64 + 1)))
        .collect()
}

fn sync_pair(docs: &mut [Doc], from: usize, to: usize) {
    if from == to {
        return;
    }
    let diff = docs[from]
        .encode_diff(&docs[to].encode_state_vector())
        .unwrap();
    docs[to].apply_update(&diff).unwrap();
}

/// Run the ops, returning every update produced in creation order.
fn run(docs: &mut [Doc], ops: &[Op]) -> Vec<Vec<u8>> {
    let mut produced = Vec::new();
    for op in ops {
        match op {
            Op::Insert { replica, pos, text } => {
                let doc = &mut docs[*replica];
                let pos = pos % (doc.len() + 1);
                produced.push(doc.insert(pos, text).unwrap());
            }
            Op::Delete { replica, pos, len } => {
                let doc = &mut docs[*replica];
                if doc.is_empty() {
                    continue;
                }
                let pos = pos % doc.len();
                let len = (*len).min(doc.len() - pos);
                produced.push(doc.delete(pos, len).unwrap());
            }
            Op::Sync { from, to } => sync_pair(docs, *from, *to),
        }
    }
    produced
}

proptest! {
    #[test]
    fn replicas_converge_after_full_exchange(ops in prop::collection::vec(op_strategy(), 1..60)) {
        let mut docs = replicas();
        run(&mut docs, &ops);

        for from in 0..REPLICAS {
            for to in 0..REPLICAS {
                sync_pair(&mut docs, from, to);
            }
        }
        let text = docs[0].text();
        for doc in &docs {
            prop_assert_eq!(doc.text(), text.clone());
            prop_assert_eq!(doc.encode_state_vector(), docs[0].encode_state_vector());
            prop_assert_eq!(doc.pending_len(), 0);
        }
    }

    #[test]
    fn any_delivery_order_converges(ops in prop::collection::vec(op_strategy(), 1..40), seed in any::<u64>()) {
        let mut docs = replicas();
        let produced = run(&mut docs, &ops);
        for from in 0..REPLICAS {
            for to in 0..REPLICAS {
                sync_pair(&mut docs, from, to);
            }
        }

        // Deterministic shuffle driven by the seed.
        let mut order: Vec<usize> = (0..produced.len()).collect();
        let mut state = seed | 1;
        for i in (1..order.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            order.swap(i, (state % (i as u64 + 1)) as usize);
        }

        let mut late = Doc::with_replica(ReplicaId(99));
        for &i in &order {
            match late.apply_update(&produced[i]) {
                Ok(()) | Err(DocError::CausalGap { .. }) => {}
                Err(e) => prop_assert!(false, "unexpected error: {e}"),
            }
        }
        prop_assert_eq!(late.pending_len(), 0);
        prop_assert_eq!(late.text(), docs[0].text());
    }

    #[test]
    fn reapplying_updates_is_a_noop(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut docs = replicas();
        let produced = run(&mut docs, &ops);

        let mut target = Doc::with_replica(ReplicaId(50));
        for update in &produced {
            let _ = target.apply_update(update);
        }
        let text = target.text();
        let sv = target.encode_state_vector();
        for update in &produced {
            let _ = target.apply_update(update);
        }
        prop_assert_eq!(target.text(), text);
        prop_assert_eq!(target.encode_state_vector(), sv);
    }

    #[test]
    fn snapshot_restores_identical_replica(ops in prop::collection::vec(op_strategy(), 1..40)) {
        let mut docs = replicas();
        run(&mut docs, &ops);
        let snapshot = docs[1].encode_state_as_update().unwrap();
        let restored = Doc::from_snapshot(ReplicaId(77), &snapshot).unwrap();
        prop_assert_eq!(restored.text(), docs[1].text());
        prop_assert_eq!(restored.encode_state_vector(), docs[1].encode_state_vector());
    }
}

#[test]
fn concurrent_start_inserts_order_by_replica() {
    let mut a = Doc::with_replica(ReplicaId(1));
    let mut b = Doc::with_replica(ReplicaId(2));
    let ua = a.insert(0, "hello").unwrap();
    let ub = b.insert(0, "world").unwrap();

    b.apply_update(&ua).unwrap();
    a.apply_update(&ub).unwrap();

    assert_eq!(a.text(), b.text());
    assert_eq!(a.len(), 10);
    assert!(a.text().starts_with("hello"));
}
