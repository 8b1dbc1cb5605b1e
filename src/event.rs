//! General purpose events, fixed events, and Notify delivery
//!
//! GPEs live in blocks backed by status/enable register pairs. A trigger
//! clears the status bit, disables the event against re-entry, and defers
//! the bound action (native handler, `_Lxx`/`_Exx` method, or implicit
//! notify) to the host work queue. Notify delivery is a single FIFO drained
//! in order, which preserves per-target ordering under concurrent enqueues.

use crate::context::Context;
use crate::error::AmlError;
use crate::interpreter::Interpreter;
use crate::name::NameSeg;
use crate::namespace::{NodeRef, WalkControl};
use crate::object::{Object, ObjectType};
use crate::opregion::AddressSpace;

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, trace, warn};

/// Client callback for Notify events.
pub trait NotifyHandler: Send + Sync {
    /// One notification against `node`.
    fn notify(&self, node: &NodeRef, value: u64);
}

/// Client callback for a native GPE handler.
pub trait GpeHandler: Send + Sync {
    /// Service the GPE; the disposition controls re-enabling for
    /// level-triggered events.
    fn handle(&self, gpe: u16) -> GpeDisposition;
}

/// Client callback for fixed events.
pub trait FixedEventHandler: Send + Sync {
    /// Service the fixed event.
    fn handle(&self, event: FixedEvent);
}

/// Outcome of servicing a GPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpeDisposition {
    /// Serviced; re-enable now.
    Reenable,
    /// Serviced; leave disabled until the client re-enables explicitly.
    StayDisabled,
}

/// Hardware trigger mode of a GPE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpeTrigger {
    /// Edge: always re-enabled after service.
    Edge,
    /// Level: re-enabled only when the disposition asks.
    Level,
}

/// ACPI fixed events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FixedEvent {
    /// PM timer rollover.
    Timer,
    /// Power button press.
    PowerButton,
    /// Sleep button press.
    SleepButton,
    /// RTC alarm.
    RealTimeClock,
    /// Firmware released the global lock.
    GlobalLock,
}

/// What a GPE does when it fires.
#[derive(Clone, Default)]
enum GpeAction {
    /// Nothing bound; the event is logged and left disabled.
    #[default]
    None,
    /// Native client handler.
    Native(Arc<dyn GpeHandler>),
    /// AML method (`_Lxx`/`_Exx`).
    Method(NodeRef),
    /// Devices to notify when no method exists (implicit notify).
    ImplicitNotify { targets: Vec<Weak<crate::namespace::Node>>, value: u64 },
}

#[derive(Default)]
struct GpeState {
    action: GpeAction,
    trigger: GpeTrigger,
    runtime_refs: u32,
    wake_refs: u32,
    masked: bool,
    fired: u64,
}

impl Default for GpeTrigger {
    fn default() -> Self {
        Self::Level
    }
}

/// One GPE register block.
pub struct GpeBlock {
    /// First event number served by this block.
    pub base: u16,
    /// Status register base address.
    pub status_addr: u64,
    /// Enable register base address.
    pub enable_addr: u64,
    /// Space the registers live in.
    pub space: AddressSpace,
    /// Register count; each register covers eight events.
    pub registers: u16,
    states: Vec<Mutex<GpeState>>,
}

impl GpeBlock {
    fn contains(&self, gpe: u16) -> bool {
        gpe >= self.base && gpe < self.base + self.registers * 8
    }

    fn state(&self, gpe: u16) -> Option<&Mutex<GpeState>> {
        self.states.get((gpe - self.base) as usize)
    }

    fn read_register(&self, ctx: &Context, addr: u64) -> u64 {
        let host = ctx.host();
        let result = match self.space {
            AddressSpace::SystemIo => host.io_read(addr, 1),
            _ => host.mem_read(addr, 1),
        };
        result.unwrap_or(0)
    }

    fn write_register(&self, ctx: &Context, addr: u64, value: u64) {
        let host = ctx.host();
        let result = match self.space {
            AddressSpace::SystemIo => host.io_write(addr, 1, value),
            _ => host.mem_write(addr, 1, value),
        };
        if result.is_err() {
            warn!(target: "aml_vm::event", addr, "GPE register write failed");
        }
    }

    fn set_enable_bit(&self, ctx: &Context, gpe: u16, enabled: bool) {
        let index = (gpe - self.base) as u64;
        let addr = self.enable_addr + index / 8;
        let bit = 1u64 << (index % 8);
        let current = self.read_register(ctx, addr);
        let value = if enabled { current | bit } else { current & !bit };
        self.write_register(ctx, addr, value);
    }

    fn clear_status_bit(&self, ctx: &Context, gpe: u16) {
        let index = (gpe - self.base) as u64;
        // Status registers are write-one-to-clear.
        self.write_register(ctx, self.status_addr + index / 8, 1u64 << (index % 8));
    }
}

struct NotifyEntry {
    node: Option<Weak<crate::namespace::Node>>,
    handler: Arc<dyn NotifyHandler>,
}

/// Event machinery: GPE blocks, fixed events, and the Notify queue.
pub struct EventSubsystem {
    gpe_blocks: Mutex<Vec<Arc<GpeBlock>>>,
    fixed: Mutex<Vec<(FixedEvent, Arc<dyn FixedEventHandler>)>>,
    fixed_counts: Mutex<Vec<(FixedEvent, u64)>>,
    notify_handlers: Mutex<Vec<NotifyEntry>>,
    notify_queue: Mutex<VecDeque<(NodeRef, u64)>>,
    notify_draining: Mutex<bool>,
}

impl EventSubsystem {
    /// Empty subsystem; blocks and handlers install later.
    pub fn new() -> Self {
        Self {
            gpe_blocks: Mutex::new(Vec::new()),
            fixed: Mutex::new(Vec::new()),
            fixed_counts: Mutex::new(Vec::new()),
            notify_handlers: Mutex::new(Vec::new()),
            notify_queue: Mutex::new(VecDeque::new()),
            notify_draining: Mutex::new(false),
        }
    }

    /* GPE BLOCKS */

    /// Register a GPE block (from the FADT's GPE0/GPE1 definitions or a
    /// GPIO-backed controller).
    pub fn install_gpe_block(
        &self,
        base: u16,
        status_addr: u64,
        enable_addr: u64,
        space: AddressSpace,
        registers: u16,
    ) -> Result<(), AmlError> {
        let mut blocks = lock(&self.gpe_blocks);
        let end = base as u32 + registers as u32 * 8;
        if end > u16::MAX as u32 {
            return Err(AmlError::InvalidArgument("GPE block range"));
        }
        if blocks
            .iter()
            .any(|b| (b.base as u32) < end && (base as u32) < b.base as u32 + b.registers as u32 * 8)
        {
            return Err(AmlError::AlreadyExists(format!("GPE block at {base}")));
        }
        let states = (0..registers * 8).map(|_| Mutex::new(GpeState::default())).collect();
        blocks.push(Arc::new(GpeBlock {
            base,
            status_addr,
            enable_addr,
            space,
            registers,
            states,
        }));
        debug!(target: "aml_vm::event", base, registers, "GPE block installed");
        Ok(())
    }

    fn block_for(&self, gpe: u16) -> Option<Arc<GpeBlock>> {
        lock(&self.gpe_blocks)
            .iter()
            .find(|b| b.contains(gpe))
            .cloned()
    }

    /// Bind `_Lxx`/`_Exx` methods under `\_GPE` to their event numbers.
    ///
    /// Runs after namespace load and again after a dynamic table load picks
    /// up new handlers.
    pub fn scan_gpe_methods(&self, ctx: &Context) {
        let gpe_scope = match ctx
            .namespace()
            .find(ctx.namespace().root(), &"\\_GPE".parse().expect("scope path"))
        {
            Ok(node) => node,
            Err(_) => return,
        };
        for child in gpe_scope.children_snapshot() {
            let name = child.name();
            let text = name.as_str().as_bytes();
            let trigger = match text[0] {
                b'_' if text[1] == b'L' => GpeTrigger::Level,
                b'_' if text[1] == b'E' => GpeTrigger::Edge,
                _ => continue,
            };
            let number = match u16::from_str_radix(
                core::str::from_utf8(&text[2..4]).unwrap_or(""),
                16,
            ) {
                Ok(n) => n,
                Err(_) => continue,
            };
            if child.object().type_of() != ObjectType::Method {
                continue;
            }
            let Some(block) = self.block_for(number) else {
                continue;
            };
            let Some(state) = block.state(number) else {
                continue;
            };
            let mut state = lock_state(state);
            if matches!(state.action, GpeAction::None) {
                state.action = GpeAction::Method(child.clone());
                state.trigger = trigger;
                trace!(target: "aml_vm::event", gpe = number, method = %child.absolute_path(), "GPE method bound");
            }
        }
    }

    /// Install a native handler, displacing a method binding.
    pub fn install_gpe_handler(
        &self,
        gpe: u16,
        trigger: GpeTrigger,
        handler: Arc<dyn GpeHandler>,
    ) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        if matches!(state.action, GpeAction::Native(_)) {
            return Err(AmlError::AlreadyExists(format!("GPE {gpe:#x} handler")));
        }
        state.action = GpeAction::Native(handler);
        state.trigger = trigger;
        Ok(())
    }

    /// Remove a native handler; the event reverts to unbound.
    pub fn uninstall_gpe_handler(&self, gpe: u16) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        match state.action {
            GpeAction::Native(_) => {
                state.action = GpeAction::None;
                Ok(())
            }
            _ => Err(AmlError::NotFound(format!("GPE {gpe:#x} handler"))),
        }
    }

    /// Bind devices for implicit notify on a GPE with no method.
    pub fn setup_implicit_notify(
        &self,
        gpe: u16,
        targets: Vec<NodeRef>,
        value: u64,
    ) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        state.action = GpeAction::ImplicitNotify {
            targets: targets.iter().map(Arc::downgrade).collect(),
            value,
        };
        Ok(())
    }

    /// Take a runtime reference on a GPE, enabling it on the first.
    pub fn enable_gpe(&self, ctx: &Context, gpe: u16) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        state.runtime_refs += 1;
        if state.runtime_refs == 1 && !state.masked {
            block.set_enable_bit(ctx, gpe, true);
        }
        Ok(())
    }

    /// Drop a runtime reference, disabling on the last.
    pub fn disable_gpe(&self, ctx: &Context, gpe: u16) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        if state.runtime_refs == 0 {
            return Err(AmlError::InvalidArgument("GPE not enabled"));
        }
        state.runtime_refs -= 1;
        if state.runtime_refs == 0 {
            block.set_enable_bit(ctx, gpe, false);
        }
        Ok(())
    }

    /// Mask a misbehaving GPE regardless of references.
    pub fn mask_gpe(&self, ctx: &Context, gpe: u16, masked: bool) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        state.masked = masked;
        block.set_enable_bit(ctx, gpe, !masked && state.runtime_refs > 0);
        Ok(())
    }

    /// Flag a GPE as a wake source.
    pub fn enable_gpe_for_wake(&self, gpe: u16) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        lock_state(state).wake_refs += 1;
        Ok(())
    }

    /// Drop a wake reference.
    pub fn disable_gpe_for_wake(&self, gpe: u16) -> Result<(), AmlError> {
        let block = self
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let mut state = lock_state(state);
        if state.wake_refs == 0 {
            return Err(AmlError::InvalidArgument("GPE not wake-enabled"));
        }
        state.wake_refs -= 1;
        Ok(())
    }

    /// Arm wake-enabled GPEs and quiesce the rest before suspend.
    pub fn prepare_for_wake(&self, ctx: &Context) {
        let blocks = lock(&self.gpe_blocks).clone();
        for block in blocks {
            for gpe in block.base..block.base + block.registers * 8 {
                if let Some(state) = block.state(gpe) {
                    let state = lock_state(state);
                    block.set_enable_bit(ctx, gpe, state.wake_refs > 0);
                }
            }
        }
    }

    /// Interrupt-side entry: service `gpe` now.
    ///
    /// Clears status, disables against re-entry, and defers the bound
    /// action to the host work queue. Called from host interrupt glue.
    pub fn dispatch_gpe(ctx: &Arc<Context>, gpe: u16) -> Result<(), AmlError> {
        let events = ctx.events();
        let block = events
            .block_for(gpe)
            .ok_or_else(|| AmlError::NotFound(format!("GPE {gpe:#x}")))?;
        let state_slot = block.state(gpe).ok_or(AmlError::InvalidArgument("GPE number"))?;
        let (action, trigger) = {
            let mut state = lock_state(state_slot);
            state.fired += 1;
            (state.action.clone(), state.trigger)
        };

        block.clear_status_bit(ctx, gpe);
        block.set_enable_bit(ctx, gpe, false);

        let host = ctx.host();
        let ctx = ctx.clone();
        let work_block = block.clone();
        host.queue_work(Box::new(move || {
            let disposition = run_gpe_action(&ctx, gpe, &action);
            let reenable = match trigger {
                GpeTrigger::Edge => true,
                GpeTrigger::Level => disposition == GpeDisposition::Reenable,
            };
            if reenable {
                if let Some(state) = work_block.state(gpe) {
                    let state = lock_state(state);
                    if state.runtime_refs > 0 && !state.masked {
                        work_block.set_enable_bit(&ctx, gpe, true);
                    }
                }
            }
        }))
    }

    /// Times a GPE has fired, for diagnostics.
    pub fn gpe_fired_count(&self, gpe: u16) -> u64 {
        self.block_for(gpe)
            .and_then(|b| b.state(gpe).map(|s| lock_state(s).fired))
            .unwrap_or(0)
    }

    /* FIXED EVENTS */

    /// Install a fixed-event handler.
    pub fn install_fixed_event_handler(
        &self,
        event: FixedEvent,
        handler: Arc<dyn FixedEventHandler>,
    ) -> Result<(), AmlError> {
        let mut fixed = lock(&self.fixed);
        if fixed.iter().any(|(e, _)| *e == event) {
            return Err(AmlError::AlreadyExists(format!("{event:?} handler")));
        }
        fixed.push((event, handler));
        Ok(())
    }

    /// Remove a fixed-event handler.
    pub fn uninstall_fixed_event_handler(&self, event: FixedEvent) -> Result<(), AmlError> {
        let mut fixed = lock(&self.fixed);
        let at = fixed
            .iter()
            .position(|(e, _)| *e == event)
            .ok_or_else(|| AmlError::NotFound(format!("{event:?} handler")))?;
        fixed.remove(at);
        Ok(())
    }

    /// Interrupt-side entry for a fixed event.
    pub fn dispatch_fixed_event(ctx: &Arc<Context>, event: FixedEvent) -> Result<(), AmlError> {
        let events = ctx.events();
        {
            let mut counts = lock(&events.fixed_counts);
            match counts.iter_mut().find(|(e, _)| *e == event) {
                Some((_, n)) => *n += 1,
                None => counts.push((event, 1)),
            }
        }
        if event == FixedEvent::GlobalLock {
            ctx.global_lock().firmware_released();
        }
        let handler = lock(&events.fixed)
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, h)| h.clone());
        let Some(handler) = handler else {
            trace!(target: "aml_vm::event", ?event, "fixed event with no handler");
            return Ok(());
        };
        ctx.host().queue_work(Box::new(move || handler.handle(event)))
    }

    /// Times a fixed event has fired.
    pub fn fixed_event_count(&self, event: FixedEvent) -> u64 {
        lock(&self.fixed_counts)
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }

    /* NOTIFY */

    /// Install a notify handler for `node`, or root-wide with `None`.
    pub fn install_notify_handler(
        &self,
        node: Option<&NodeRef>,
        handler: Arc<dyn NotifyHandler>,
    ) -> Result<(), AmlError> {
        let mut handlers = lock(&self.notify_handlers);
        let duplicate = handlers.iter().any(|entry| match (&entry.node, node) {
            (None, None) => true,
            (Some(registered), Some(node)) => registered
                .upgrade()
                .is_some_and(|registered| Arc::ptr_eq(&registered, node)),
            _ => false,
        });
        if duplicate {
            return Err(AmlError::AlreadyExists(String::from("notify handler")));
        }
        handlers.push(NotifyEntry {
            node: node.map(Arc::downgrade),
            handler,
        });
        Ok(())
    }

    /// Remove a notify handler registration.
    pub fn uninstall_notify_handler(&self, node: Option<&NodeRef>) -> Result<(), AmlError> {
        let mut handlers = lock(&self.notify_handlers);
        let at = handlers
            .iter()
            .position(|entry| match (&entry.node, node) {
                (None, None) => true,
                (Some(registered), Some(node)) => registered
                    .upgrade()
                    .is_some_and(|registered| Arc::ptr_eq(&registered, node)),
                _ => false,
            })
            .ok_or(AmlError::NotFound(String::from("notify handler")))?;
        handlers.remove(at);
        Ok(())
    }

    /// Enqueue a Notify and schedule the drain.
    ///
    /// Called by the interpreter for AML `Notify` and by GPE implicit
    /// notify. One drain runs at a time; the single queue preserves
    /// per-target FIFO order.
    pub fn queue_notify(ctx: &Arc<Context>, node: NodeRef, value: u64) -> Result<(), AmlError> {
        let events = ctx.events();
        lock(&events.notify_queue).push_back((node, value));
        {
            let mut draining = lock(&events.notify_draining);
            if *draining {
                return Ok(());
            }
            *draining = true;
        }
        let for_drain = ctx.clone();
        let queued = ctx.host().queue_work(Box::new(move || {
            Self::drain_notify(&for_drain);
        }));
        if queued.is_err() {
            *lock(&ctx.events().notify_draining) = false;
        }
        queued
    }

    fn drain_notify(ctx: &Arc<Context>) {
        let events = ctx.events();
        loop {
            let next = lock(&events.notify_queue).pop_front();
            let Some((node, value)) = next else {
                *lock(&events.notify_draining) = false;
                return;
            };
            let handlers: Vec<Arc<dyn NotifyHandler>> = lock(&events.notify_handlers)
                .iter()
                .filter(|entry| match &entry.node {
                    None => true,
                    Some(registered) => registered
                        .upgrade()
                        .is_some_and(|registered| Arc::ptr_eq(&registered, &node)),
                })
                .map(|entry| entry.handler.clone())
                .collect();
            if handlers.is_empty() {
                debug!(
                    target: "aml_vm::event",
                    node = %node.absolute_path(),
                    value,
                    "notify dropped: no handler"
                );
            }
            for handler in handlers {
                handler.notify(&node, value);
            }
        }
    }
}

impl Default for EventSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

fn run_gpe_action(ctx: &Arc<Context>, gpe: u16, action: &GpeAction) -> GpeDisposition {
    match action {
        GpeAction::None => {
            warn!(target: "aml_vm::event", gpe, "GPE fired with no binding; leaving disabled");
            GpeDisposition::StayDisabled
        }
        GpeAction::Native(handler) => handler.handle(gpe),
        GpeAction::Method(node) => {
            let mut interp = Interpreter::new(ctx.clone());
            match interp.evaluate_node(node, Vec::new()) {
                Ok(_) => GpeDisposition::Reenable,
                Err(error) => {
                    warn!(target: "aml_vm::event", gpe, %error, "GPE method failed; masking");
                    GpeDisposition::StayDisabled
                }
            }
        }
        GpeAction::ImplicitNotify { targets, value } => {
            for target in targets {
                if let Some(node) = target.upgrade() {
                    let _ = EventSubsystem::queue_notify(ctx, node, *value);
                }
            }
            GpeDisposition::Reenable
        }
    }
}

/// Find devices under `\_SB_` advertising a wake GPE via `_PRW` packages,
/// used when binding implicit notify. Best effort: only literal packages
/// with integer first elements are considered.
pub fn wake_devices_for_gpe(ctx: &Context, gpe: u16) -> Vec<NodeRef> {
    let mut out = Vec::new();
    let Ok(sb) = ctx
        .namespace()
        .find(ctx.namespace().root(), &"\\_SB_".parse().expect("scope path"))
    else {
        return out;
    };
    let prw = match NameSeg::from_str("_PRW") {
        Ok(seg) => seg,
        Err(_) => return out,
    };
    ctx.namespace().walk(&sb, |node, _| {
        if let Some(prw_node) = node.child(prw) {
            let object = prw_node.object();
            let first = match &*object.read() {
                Object::Package(elements) => elements.first().cloned(),
                _ => None,
            };
            if let Some(first) = first {
                if matches!(*first.read(), Object::Integer(n) if n == gpe as u64) {
                    out.push(node.clone());
                }
            }
        }
        WalkControl::Continue
    });
    out
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock_state(mutex: &Mutex<GpeState>) -> std::sync::MutexGuard<'_, GpeState> {
    lock(mutex)
}
