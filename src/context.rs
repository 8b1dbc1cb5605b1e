//! Process-wide runtime context
//!
//! All global mutable state lives here: configuration, the namespace, the
//! interface list answered by `_OSI`, loaded tables, event machinery, and
//! the address-space handler registry. Subsystems receive the context by
//! argument; nothing reads a global.

use crate::error::AmlError;
use crate::event::EventSubsystem;
use crate::host::Host;
use crate::name::AmlName;
use crate::namespace::{Namespace, NodeRef};
use crate::object::Object;
use crate::opregion::{
    AddressSpace, PciConfigHandler, RegionHandler, SystemIoHandler, SystemMemoryHandler,
};
use crate::sync::GlobalLock;
use crate::table::TableStore;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tracing::{debug, info};

/// Subsystem lifecycle stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum InitLevel {
    /// Context constructed, nothing loaded.
    Early,
    /// Builtin handlers and predefined namespace installed.
    SubsystemInitialized,
    /// Static tables loaded into the namespace.
    NamespaceLoaded,
    /// Device initialization pass complete.
    NamespaceInitialized,
}

#[derive(Debug)]
struct Config {
    loop_timeout: Duration,
    max_call_depth: usize,
    log_level: tracing::Level,
}

struct RegionHandlerEntry {
    node: Weak<crate::namespace::Node>,
    at_root: bool,
    space: AddressSpace,
    handler: Arc<dyn RegionHandler>,
}

/// The process-wide context shared by every subsystem.
pub struct Context {
    host: Arc<dyn Host>,
    namespace: Namespace,
    global_lock: GlobalLock,
    config: RwLock<Config>,
    interfaces: Mutex<Vec<String>>,
    region_handlers: RwLock<Vec<RegionHandlerEntry>>,
    events: EventSubsystem,
    tables: TableStore,
    init_level: RwLock<InitLevel>,
    next_owner: AtomicU32,
}

/// Host interfaces advertised through `_OSI` by default.
///
/// The Windows strings make firmware take its best-tested paths; the
/// feature strings advertise standard interpreter capabilities.
const DEFAULT_INTERFACES: &[&str] = &[
    "Windows 2000",
    "Windows 2001",
    "Windows 2001 SP1",
    "Windows 2001.1",
    "Windows 2001 SP2",
    "Windows 2001.1 SP1",
    "Windows 2006",
    "Windows 2006.1",
    "Windows 2006 SP1",
    "Windows 2006 SP2",
    "Windows 2009",
    "Windows 2012",
    "Windows 2013",
    "Windows 2015",
    "Windows 2016",
    "Windows 2017",
    "Windows 2017.2",
    "Windows 2018",
    "Windows 2018.2",
    "Windows 2019",
    "Windows 2020",
    "Windows 2021",
    "Windows 2022",
    "Module Device",
    "Processor Device",
    "3.0 Thermal Model",
    "3.0 _SCP Extensions",
    "Processor Aggregator Device",
];

impl Context {
    /// Fresh context over `host` with builtin handlers registered.
    pub fn new(host: Arc<dyn Host>, facs_global_lock_addr: Option<u64>) -> Arc<Self> {
        let ctx = Arc::new(Self {
            host,
            namespace: Namespace::new(),
            global_lock: GlobalLock::new(facs_global_lock_addr),
            config: RwLock::new(Config {
                loop_timeout: crate::consts::DEFAULT_LOOP_TIMEOUT,
                max_call_depth: crate::consts::MAX_FRAME_DEPTH,
                log_level: tracing::Level::INFO,
            }),
            interfaces: Mutex::new(
                DEFAULT_INTERFACES.iter().map(|s| (*s).to_string()).collect(),
            ),
            region_handlers: RwLock::new(Vec::new()),
            events: EventSubsystem::new(),
            tables: TableStore::new(),
            init_level: RwLock::new(InitLevel::Early),
            next_owner: AtomicU32::new(1),
        });
        ctx.install_builtin_handlers();
        ctx.set_init_level(InitLevel::SubsystemInitialized);
        info!(target: "aml_vm::context", "subsystem initialized");
        ctx
    }

    fn install_builtin_handlers(&self) {
        let builtins: [(AddressSpace, Arc<dyn RegionHandler>); 3] = [
            (AddressSpace::SystemMemory, Arc::new(SystemMemoryHandler)),
            (AddressSpace::SystemIo, Arc::new(SystemIoHandler)),
            (AddressSpace::PciConfig, Arc::new(PciConfigHandler)),
        ];
        let mut handlers = write(&self.region_handlers);
        for (space, handler) in builtins {
            handlers.push(RegionHandlerEntry {
                node: Weak::new(),
                at_root: true,
                space,
                handler,
            });
        }
    }

    /// Host services.
    pub fn host(&self) -> Arc<dyn Host> {
        self.host.clone()
    }

    /// The namespace tree.
    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The firmware-shared global lock.
    pub fn global_lock(&self) -> &GlobalLock {
        &self.global_lock
    }

    /// Event machinery.
    pub fn events(&self) -> &EventSubsystem {
        &self.events
    }

    /// Loaded-table store.
    pub fn tables(&self) -> &TableStore {
        &self.tables
    }

    /// Current lifecycle stage.
    pub fn init_level(&self) -> InitLevel {
        *read(&self.init_level)
    }

    /// Advance (or rewind, on teardown) the lifecycle stage.
    pub fn set_init_level(&self, level: InitLevel) {
        *write(&self.init_level) = level;
    }

    /// Fail unless the lifecycle reached `level`.
    pub fn require_init(&self, level: InitLevel) -> Result<(), AmlError> {
        if self.init_level() < level {
            return Err(AmlError::NotReady("initialization order"));
        }
        Ok(())
    }

    /// Allocate an owner id for a table load or client installation.
    pub fn allocate_owner(&self) -> u32 {
        self.next_owner.fetch_add(1, Ordering::Relaxed)
    }

    /// Whether `mutex` is the predefined `\_GL_` object, whose acquisition
    /// runs the firmware global-lock protocol.
    pub fn is_global_lock_mutex(&self, mutex: &Arc<crate::sync::AmlMutex>) -> bool {
        let Ok(node) = self.namespace.find(
            self.namespace.root(),
            &AmlName::single(match "_GL_".parse() {
                Ok(seg) => seg,
                Err(_) => return false,
            }),
        ) else {
            return false;
        };
        let object = node.object();
        let is_gl = match &*object.read() {
            Object::Mutex(gl) => Arc::ptr_eq(gl, mutex),
            _ => false,
        };
        is_gl
    }

    /* CONFIG */

    /// Current `While` budget.
    pub fn loop_timeout(&self) -> Duration {
        read(&self.config).loop_timeout
    }

    /// Replace the `While` budget.
    pub fn set_loop_timeout(&self, timeout: Duration) {
        write(&self.config).loop_timeout = timeout;
        debug!(target: "aml_vm::context", ?timeout, "loop timeout changed");
    }

    /// Frame-chain depth bound.
    pub fn max_call_depth(&self) -> usize {
        read(&self.config).max_call_depth
    }

    /// Requested log verbosity. The core always emits through `tracing`;
    /// the embedder reads this when configuring its subscriber filter.
    pub fn log_level(&self) -> tracing::Level {
        read(&self.config).log_level
    }

    /// Record the requested log verbosity.
    pub fn set_log_level(&self, level: tracing::Level) {
        write(&self.config).log_level = level;
    }

    /* INTERFACES (_OSI) */

    /// Whether `name` is an advertised interface.
    pub fn has_interface(&self, name: &str) -> bool {
        lock(&self.interfaces).iter().any(|i| i == name)
    }

    /// Advertise an interface.
    pub fn install_interface(&self, name: &str) -> Result<(), AmlError> {
        let mut interfaces = lock(&self.interfaces);
        if interfaces.iter().any(|i| i == name) {
            return Err(AmlError::AlreadyExists(name.to_string()));
        }
        interfaces.push(name.to_string());
        Ok(())
    }

    /// Stop advertising an interface.
    pub fn uninstall_interface(&self, name: &str) -> Result<(), AmlError> {
        let mut interfaces = lock(&self.interfaces);
        let at = interfaces
            .iter()
            .position(|i| i == name)
            .ok_or_else(|| AmlError::NotFound(name.to_string()))?;
        interfaces.remove(at);
        Ok(())
    }

    /* REGION HANDLERS */

    /// Register `handler` for `space` at `node` (`None` registers at the
    /// root, covering every region without a closer registration).
    pub fn install_region_handler(
        &self,
        node: Option<&NodeRef>,
        space: AddressSpace,
        handler: Arc<dyn RegionHandler>,
    ) -> Result<(), AmlError> {
        let mut handlers = write(&self.region_handlers);
        let duplicate = handlers
            .iter()
            .any(|entry| entry.space == space && entry_matches(entry, node));
        if duplicate {
            return Err(AmlError::AlreadyExists(format!("{space:?} handler")));
        }
        handlers.push(RegionHandlerEntry {
            node: node.map(Arc::downgrade).unwrap_or_default(),
            at_root: node.is_none(),
            space,
            handler,
        });
        Ok(())
    }

    /// Remove a registration, detaching any region bound through it.
    pub fn uninstall_region_handler(
        &self,
        node: Option<&NodeRef>,
        space: AddressSpace,
    ) -> Result<(), AmlError> {
        {
            let mut handlers = write(&self.region_handlers);
            let at = handlers
                .iter()
                .position(|entry| entry.space == space && entry_matches(entry, node))
                .ok_or_else(|| AmlError::NotFound(format!("{space:?} handler")))?;
            handlers.remove(at);
        }
        // Regions that cached the removed handler rebind on next use.
        self.namespace.walk(self.namespace.root(), |node, _| {
            let object = node.object();
            let region = match &*object.read() {
                Object::OpRegion(region) if region.space == space => Some(region.clone()),
                _ => None,
            };
            if let Some(region) = region {
                region.unbind_handler(self);
            }
            crate::namespace::WalkControl::Continue
        });
        Ok(())
    }

    /// Resolve the handler covering a region at `node` for `space` by
    /// walking the ancestor chain, falling back to root registrations.
    pub fn find_region_handler(
        &self,
        node: Option<&NodeRef>,
        space: AddressSpace,
    ) -> Option<Arc<dyn RegionHandler>> {
        let handlers = read(&self.region_handlers);
        let mut cursor = node.cloned();
        while let Some(at) = cursor {
            for entry in handlers.iter() {
                if entry.space == space
                    && entry
                        .node
                        .upgrade()
                        .is_some_and(|registered| Arc::ptr_eq(&registered, &at))
                {
                    return Some(entry.handler.clone());
                }
            }
            cursor = at.parent();
        }
        handlers
            .iter()
            .find(|entry| entry.space == space && entry.at_root)
            .map(|entry| entry.handler.clone())
    }

    /// Detach every attached region under `from` (used on shutdown).
    pub fn detach_regions(&self, from: &NodeRef) {
        self.namespace.walk(from, |node, _| {
            let object = node.object();
            if let Object::OpRegion(region) = &*object.read() {
                region.unbind_handler(self);
            }
            crate::namespace::WalkControl::Continue
        });
    }
}

fn entry_matches(entry: &RegionHandlerEntry, node: Option<&NodeRef>) -> bool {
    match (node, entry.at_root) {
        (None, at_root) => at_root,
        (Some(node), false) => entry
            .node
            .upgrade()
            .is_some_and(|registered| Arc::ptr_eq(&registered, node)),
        (Some(_), true) => false,
    }
}

impl core::fmt::Debug for Context {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("init_level", &self.init_level())
            .finish_non_exhaustive()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::MemoryHost;

    fn ctx() -> Arc<Context> {
        Context::new(Arc::new(MemoryHost::new()), None)
    }

    #[test]
    fn default_interfaces_include_windows_strings() {
        let ctx = ctx();
        assert!(ctx.has_interface("Windows 2015"));
        assert!(ctx.has_interface("Module Device"));
        assert!(!ctx.has_interface("Linux"));
    }

    #[test]
    fn interface_install_uninstall_round_trip() {
        let ctx = ctx();
        ctx.install_interface("MyKernel").unwrap();
        assert!(ctx.has_interface("MyKernel"));
        assert!(matches!(
            ctx.install_interface("MyKernel"),
            Err(AmlError::AlreadyExists(_))
        ));
        ctx.uninstall_interface("MyKernel").unwrap();
        assert!(!ctx.has_interface("MyKernel"));
        assert!(ctx.uninstall_interface("MyKernel").is_err());
    }

    #[test]
    fn builtin_spaces_have_root_handlers() {
        let ctx = ctx();
        for space in [
            AddressSpace::SystemMemory,
            AddressSpace::SystemIo,
            AddressSpace::PciConfig,
        ] {
            assert!(ctx.find_region_handler(None, space).is_some(), "{space:?}");
        }
        assert!(ctx
            .find_region_handler(None, AddressSpace::EmbeddedController)
            .is_none());
    }

    #[test]
    fn duplicate_root_handler_is_rejected() {
        let ctx = ctx();
        let err = ctx.install_region_handler(
            None,
            AddressSpace::SystemMemory,
            Arc::new(SystemMemoryHandler),
        );
        assert!(matches!(err, Err(AmlError::AlreadyExists(_))));
    }

    #[test]
    fn node_handler_shadows_root() {
        let ctx = ctx();
        let node = ctx
            .namespace()
            .install(
                ctx.namespace().root(),
                &"\\_SB_.EC0_".parse().unwrap(),
                crate::object::ObjectRef::new(Object::Device),
                crate::namespace::NodeFlags::empty(),
                1,
            )
            .unwrap();
        ctx.install_region_handler(
            Some(&node),
            AddressSpace::EmbeddedController,
            Arc::new(SystemIoHandler),
        )
        .unwrap();
        assert!(ctx
            .find_region_handler(Some(&node), AddressSpace::EmbeddedController)
            .is_some());
        ctx.uninstall_region_handler(Some(&node), AddressSpace::EmbeddedController)
            .unwrap();
        assert!(ctx
            .find_region_handler(Some(&node), AddressSpace::EmbeddedController)
            .is_none());
    }

    #[test]
    fn init_order_is_enforced() {
        let ctx = ctx();
        assert!(ctx.require_init(InitLevel::SubsystemInitialized).is_ok());
        assert!(ctx.require_init(InitLevel::NamespaceLoaded).is_err());
        ctx.set_init_level(InitLevel::NamespaceLoaded);
        assert!(ctx.require_init(InitLevel::NamespaceLoaded).is_ok());
    }
}
