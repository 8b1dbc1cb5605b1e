//! Parallel evaluation against one shared context.

mod common;

use common::*;

use aml_vm::prelude::*;

use rayon::prelude::*;

use std::sync::{Arc, Mutex};

#[test]
fn parallel_evaluations_are_independent() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &method(
            "DBL_",
            1,
            &ret(&add(&arg(0), &arg(0), NULL_TARGET)),
        ),
    );
    let rt = Arc::new(rt);
    (0u64..64).into_par_iter().for_each(|n| {
        let result = rt
            .evaluate_integer("\\DBL_", vec![Object::Integer(n)])
            .unwrap();
        assert_eq!(result, n * 2);
    });
}

#[test]
fn serialized_methods_exclude_each_other() {
    // A non-atomic read/sleep/write increment: only serialization keeps
    // every update.
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&name("CNT_"), &local(0)),
        sleep(&int(1)),
        store(&add(&local(0), &int(1), NULL_TARGET), &name("CNT_")),
    ]);
    load_aml(
        &rt,
        &seq(&[
            name_decl("CNT_", &int(0)),
            method("INCR", serialized_flags(0, 0), &body),
        ]),
    );
    let rt = Arc::new(rt);
    (0..16).into_par_iter().for_each(|_| {
        rt.evaluate("\\INCR", Vec::new()).unwrap();
    });
    assert_eq!(eval_int(&rt, "\\CNT_"), 16);
}

#[test]
fn aml_mutex_guards_cross_thread_sections() {
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&acquire("MTX_", 0xffff), &local(1)),
        store(&name("CNT_"), &local(0)),
        sleep(&int(1)),
        store(&add(&local(0), &int(1), NULL_TARGET), &name("CNT_")),
        release("MTX_"),
        ret(&local(1)),
    ]);
    load_aml(
        &rt,
        &seq(&[
            mutex_decl("MTX_", 0),
            name_decl("CNT_", &int(0)),
            method("INCR", 0, &body),
        ]),
    );
    let rt = Arc::new(rt);
    (0..12).into_par_iter().for_each(|_| {
        // Acquire reports success with zero.
        let timed_out = rt.evaluate_integer("\\INCR", Vec::new()).unwrap();
        assert_eq!(timed_out, 0);
    });
    assert_eq!(eval_int(&rt, "\\CNT_"), 12);
}

struct OrderRecorder {
    seen: Mutex<Vec<u64>>,
}

impl NotifyHandler for OrderRecorder {
    fn notify(&self, _node: &NodeRef, value: u64) {
        self.seen.lock().unwrap().push(value);
    }
}

#[test]
fn notify_keeps_per_sender_order_under_contention() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            device("\\_SB_.DEV0", &[]),
            method("SEND", 1, &notify(&name("\\_SB_.DEV0"), &arg(0))),
        ]),
    );
    let recorder = Arc::new(OrderRecorder {
        seen: Mutex::new(Vec::new()),
    });
    rt.install_notify_handler(Some("\\_SB_.DEV0"), recorder.clone())
        .unwrap();

    let rt = Arc::new(rt);
    (0u64..8).into_par_iter().for_each(|sender| {
        for i in 0..10u64 {
            let value = sender * 100 + i;
            rt.evaluate("\\SEND", vec![Object::Integer(value)]).unwrap();
        }
    });

    // Every sender's own sequence arrives in order.
    let seen = recorder.seen.lock().unwrap().clone();
    for sender in 0u64..8 {
        let sequence: Vec<u64> = seen
            .iter()
            .copied()
            .filter(|v| v / 100 == sender)
            .collect();
        let mut sorted = sequence.clone();
        sorted.sort_unstable();
        assert_eq!(sequence, sorted, "sender {sender} out of order");
    }
}

#[test]
fn concurrent_installs_and_walks_coexist() {
    let (rt, _host) = runtime();
    load_aml(&rt, &device("\\_SB_.ROOT", &[]));
    let rt = Arc::new(rt);
    rayon::join(
        || {
            for i in 0..50u32 {
                let aml = device(&format!("\\_SB_.ROOT.D{i:03}"), &[]);
                load_aml(&rt, &aml);
            }
        },
        || {
            for _ in 0..200 {
                let mut count = 0usize;
                rt.for_each_child("\\_SB_.ROOT", |_| count += 1).unwrap();
                assert!(count <= 50);
            }
        },
    );
    let mut count = 0usize;
    rt.for_each_child("\\_SB_.ROOT", |_| count += 1).unwrap();
    assert_eq!(count, 50);
}
