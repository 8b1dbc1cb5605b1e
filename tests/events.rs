//! GPE, fixed-event, and Notify behavior.

mod common;

use common::*;

use aml_vm::event::EventSubsystem;
use aml_vm::prelude::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct Recorder {
    seen: Mutex<Vec<(String, u64)>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }

    fn seen(&self) -> Vec<(String, u64)> {
        self.seen.lock().unwrap().clone()
    }
}

impl NotifyHandler for Recorder {
    fn notify(&self, node: &NodeRef, value: u64) {
        self.seen
            .lock()
            .unwrap()
            .push((node.absolute_path(), value));
    }
}

#[test]
fn notify_reaches_registered_handler_in_order() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            device("\\_SB_.DEV0", &[]),
            method(
                "MAIN",
                0,
                &seq(&[
                    notify(&name("\\_SB_.DEV0"), &int(0x80)),
                    notify(&name("\\_SB_.DEV0"), &int(0x81)),
                    notify(&name("\\_SB_.DEV0"), &int(0x82)),
                ]),
            ),
        ]),
    );
    let recorder = Recorder::new();
    rt.install_notify_handler(Some("\\_SB_.DEV0"), recorder.clone())
        .unwrap();
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    let seen = recorder.seen();
    assert_eq!(
        seen,
        vec![
            ("\\_SB_.DEV0".to_string(), 0x80),
            ("\\_SB_.DEV0".to_string(), 0x81),
            ("\\_SB_.DEV0".to_string(), 0x82),
        ]
    );
}

#[test]
fn root_wide_notify_handler_sees_everything() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            device("\\_SB_.DEVA", &[]),
            device("\\_SB_.DEVB", &[]),
            method(
                "MAIN",
                0,
                &seq(&[
                    notify(&name("\\_SB_.DEVA"), &int(1)),
                    notify(&name("\\_SB_.DEVB"), &int(2)),
                ]),
            ),
        ]),
    );
    let recorder = Recorder::new();
    rt.install_notify_handler(None, recorder.clone()).unwrap();
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    assert_eq!(recorder.seen().len(), 2);
}

#[test]
fn notify_handler_registry_is_a_multiset() {
    let (rt, _host) = runtime();
    load_aml(&rt, &device("\\_SB_.DEV0", &[]));
    let recorder = Recorder::new();
    rt.install_notify_handler(Some("\\_SB_.DEV0"), recorder.clone())
        .unwrap();
    assert!(rt
        .install_notify_handler(Some("\\_SB_.DEV0"), recorder.clone())
        .is_err());
    rt.uninstall_notify_handler(Some("\\_SB_.DEV0")).unwrap();
    assert!(rt.uninstall_notify_handler(Some("\\_SB_.DEV0")).is_err());
}

/// GPE registers live in fake system I/O at these addresses.
const GPE_STATUS: u64 = 0x180;
const GPE_ENABLE: u64 = 0x184;

fn install_gpe_block(rt: &Runtime) {
    rt.context()
        .events()
        .install_gpe_block(0, GPE_STATUS, GPE_ENABLE, AddressSpace::SystemIo, 4)
        .unwrap();
}

#[test]
fn gpe_method_binding_and_dispatch() {
    let (rt, host) = runtime();
    install_gpe_block(&rt);
    // _L03 under \_GPE: level-triggered method for GPE 3.
    load_aml(
        &rt,
        &seq(&[
            name_decl("CNT_", &int(0)),
            scope(
                "\\_GPE",
                &method("_L03", 0, &increment(&name("\\CNT_"))),
            ),
        ]),
    );
    let events = rt.context().events();
    events.enable_gpe(rt.context(), 3).unwrap();
    assert_eq!(host.io_at(GPE_ENABLE, 1), 1 << 3);

    EventSubsystem::dispatch_gpe(rt.context(), 3).unwrap();
    assert_eq!(eval_int(&rt, "\\CNT_"), 1);
    assert_eq!(events.gpe_fired_count(3), 1);
    // Status cleared by write-one, and the method succeeded, so the level
    // GPE is re-enabled.
    assert_eq!(host.io_at(GPE_ENABLE, 1), 1 << 3);
}

struct CountingGpeHandler {
    count: AtomicUsize,
    disposition: GpeDisposition,
}

impl GpeHandler for CountingGpeHandler {
    fn handle(&self, _gpe: u16) -> GpeDisposition {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.disposition
    }
}

#[test]
fn level_gpe_stays_disabled_on_request() {
    let (rt, host) = runtime();
    install_gpe_block(&rt);
    let handler = Arc::new(CountingGpeHandler {
        count: AtomicUsize::new(0),
        disposition: GpeDisposition::StayDisabled,
    });
    rt.install_gpe_handler(5, GpeTrigger::Level, handler.clone())
        .unwrap();
    rt.context().events().enable_gpe(rt.context(), 5).unwrap();

    EventSubsystem::dispatch_gpe(rt.context(), 5).unwrap();
    assert_eq!(handler.count.load(Ordering::Relaxed), 1);
    // Still disabled until the client re-enables.
    assert_eq!(host.io_at(GPE_ENABLE, 1), 0);
}

#[test]
fn edge_gpe_is_always_reenabled() {
    let (rt, host) = runtime();
    install_gpe_block(&rt);
    let handler = Arc::new(CountingGpeHandler {
        count: AtomicUsize::new(0),
        disposition: GpeDisposition::StayDisabled,
    });
    rt.install_gpe_handler(6, GpeTrigger::Edge, handler).unwrap();
    rt.context().events().enable_gpe(rt.context(), 6).unwrap();

    EventSubsystem::dispatch_gpe(rt.context(), 6).unwrap();
    assert_eq!(host.io_at(GPE_ENABLE, 1), 1 << 6);
}

#[test]
fn gpe_runtime_references_count() {
    let (rt, host) = runtime();
    install_gpe_block(&rt);
    let events = rt.context().events();
    events.enable_gpe(rt.context(), 1).unwrap();
    events.enable_gpe(rt.context(), 1).unwrap();
    events.disable_gpe(rt.context(), 1).unwrap();
    // One reference left: still enabled.
    assert_eq!(host.io_at(GPE_ENABLE, 1), 1 << 1);
    events.disable_gpe(rt.context(), 1).unwrap();
    assert_eq!(host.io_at(GPE_ENABLE, 1), 0);
    assert!(events.disable_gpe(rt.context(), 1).is_err());
}

#[test]
fn masked_gpe_ignores_references() {
    let (rt, host) = runtime();
    install_gpe_block(&rt);
    let events = rt.context().events();
    events.enable_gpe(rt.context(), 2).unwrap();
    events.mask_gpe(rt.context(), 2, true).unwrap();
    assert_eq!(host.io_at(GPE_ENABLE, 1), 0);
    events.mask_gpe(rt.context(), 2, false).unwrap();
    assert_eq!(host.io_at(GPE_ENABLE, 1), 1 << 2);
}

#[test]
fn wake_preparation_flips_enables() {
    let (rt, host) = runtime();
    install_gpe_block(&rt);
    let events = rt.context().events();
    events.enable_gpe(rt.context(), 1).unwrap();
    events.enable_gpe_for_wake(9).unwrap();
    events.prepare_for_wake(rt.context());
    // Runtime GPE 1 off, wake GPE 9 on.
    assert_eq!(host.io_at(GPE_ENABLE, 1), 0);
    assert_eq!(host.io_at(GPE_ENABLE + 1, 1), 1 << 1);
}

#[test]
fn implicit_notify_targets_devices() {
    let (rt, _host) = runtime();
    install_gpe_block(&rt);
    load_aml(&rt, &device("\\_SB_.DEV0", &[]));
    let dev = rt.find_node("\\_SB_.DEV0").unwrap();
    rt.context()
        .events()
        .setup_implicit_notify(4, vec![dev], 0x02)
        .unwrap();
    let recorder = Recorder::new();
    rt.install_notify_handler(None, recorder.clone()).unwrap();

    EventSubsystem::dispatch_gpe(rt.context(), 4).unwrap();
    assert_eq!(recorder.seen(), vec![("\\_SB_.DEV0".to_string(), 0x02)]);
}

struct FixedRecorder {
    count: AtomicUsize,
}

impl FixedEventHandler for FixedRecorder {
    fn handle(&self, _event: FixedEvent) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }
}

#[test]
fn fixed_events_dispatch_and_count() {
    let (rt, _host) = runtime();
    let handler = Arc::new(FixedRecorder {
        count: AtomicUsize::new(0),
    });
    rt.install_fixed_event_handler(FixedEvent::PowerButton, handler.clone())
        .unwrap();
    assert!(rt
        .install_fixed_event_handler(FixedEvent::PowerButton, handler.clone())
        .is_err());

    EventSubsystem::dispatch_fixed_event(rt.context(), FixedEvent::PowerButton).unwrap();
    EventSubsystem::dispatch_fixed_event(rt.context(), FixedEvent::PowerButton).unwrap();
    assert_eq!(handler.count.load(Ordering::Relaxed), 2);
    assert_eq!(
        rt.context().events().fixed_event_count(FixedEvent::PowerButton),
        2
    );

    rt.uninstall_fixed_event_handler(FixedEvent::PowerButton)
        .unwrap();
    EventSubsystem::dispatch_fixed_event(rt.context(), FixedEvent::PowerButton).unwrap();
    assert_eq!(handler.count.load(Ordering::Relaxed), 2);
}

#[test]
fn global_lock_fixed_event_signals_waiters() {
    let (rt, _host) = runtime();
    // No handler installed: the dispatch still feeds the global lock.
    EventSubsystem::dispatch_fixed_event(rt.context(), FixedEvent::GlobalLock).unwrap();
    assert_eq!(
        rt.context().events().fixed_event_count(FixedEvent::GlobalLock),
        1
    );
}
