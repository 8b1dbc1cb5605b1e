//! Client-facing runtime façade
//!
//! [`Runtime`] wraps the shared context with the API an embedding kernel
//! actually calls: lifecycle, table management, evaluation, handler
//! installation, and namespace queries. Evaluation calls are independent:
//! each one drives its own interpreter against the shared state.

use crate::context::{Context, InitLevel};
use crate::error::AmlError;
use crate::event::{
    FixedEvent, FixedEventHandler, GpeHandler, GpeTrigger, NotifyHandler,
};
use crate::host::Host;
use crate::interpreter::Interpreter;
use crate::name::AmlName;
use crate::namespace::{NodeRef, WalkControl};
use crate::object::{to_integer, IntegerWidth, Object, ObjectRef, ObjectType};
use crate::opregion::{AddressSpace, RegionHandler};
use crate::table::{InstallHook, Table, TableHeader};

use std::sync::Arc;

use tracing::{info, warn};

/// Startup parameters supplied by the host kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeParams {
    /// Physical address of the FACS global-lock dword, when the platform
    /// has one.
    pub facs_global_lock_addr: Option<u64>,
}

/// `_STA` bit: device is present.
const STA_PRESENT: u64 = 1 << 0;
/// `_STA` bit: device is functioning.
const STA_FUNCTIONING: u64 = 1 << 3;

/// The assembled subsystem handle.
pub struct Runtime {
    ctx: Arc<Context>,
}

impl Runtime {
    /// Bring up the subsystem over the host services.
    pub fn initialize(host: Arc<dyn Host>, params: RuntimeParams) -> Self {
        let ctx = Context::new(host, params.facs_global_lock_addr);
        Self { ctx }
    }

    /// The shared context, for advanced integrations.
    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    /// Tear down: detach region handlers and rewind the lifecycle. A
    /// loaded namespace is never partially torn down; the host decides
    /// what to do with it.
    pub fn shutdown(&self) {
        let root = self.ctx.namespace().root().clone();
        self.ctx.detach_regions(&root);
        self.ctx.set_init_level(InitLevel::Early);
        info!(target: "aml_vm::runtime", "subsystem shut down");
    }

    /// Replace the `While` loop budget.
    pub fn set_loop_timeout(&self, timeout: std::time::Duration) {
        self.ctx.set_loop_timeout(timeout);
    }

    /// Record the requested log verbosity for the embedder's subscriber.
    pub fn set_log_level(&self, level: tracing::Level) {
        self.ctx.set_log_level(level);
    }

    /* TABLES */

    /// Install a table image from memory without running it.
    pub fn install_table(&self, image: &[u8]) -> Result<Arc<Table>, AmlError> {
        self.ctx.tables().install(image, self.ctx.allocate_owner())
    }

    /// Install a table located at a physical address.
    pub fn install_table_at(&self, phys: u64) -> Result<Arc<Table>, AmlError> {
        let host = self.ctx.host();
        let mut header = [0u8; crate::consts::TABLE_HEADER_LEN];
        host.read_physical(phys, &mut header)?;
        let parsed = TableHeader::parse(&header)?;
        let mut image = vec![0u8; parsed.length as usize];
        host.read_physical(phys, &mut image)?;
        self.install_table(&image)
    }

    /// Run a table's AML, populating the namespace.
    pub fn load_table(&self, table: &Arc<Table>) -> Result<(), AmlError> {
        let mut interp = Interpreter::new(self.ctx.clone());
        interp.load_table(table)?;
        if self.ctx.init_level() < InitLevel::NamespaceLoaded {
            self.ctx.set_init_level(InitLevel::NamespaceLoaded);
        }
        Ok(())
    }

    /// Install and immediately load a table image.
    pub fn load_table_image(&self, image: &[u8]) -> Result<Arc<Table>, AmlError> {
        let table = self.install_table(image)?;
        self.load_table(&table)?;
        Ok(table)
    }

    /// Unload a table: remove its namespace nodes and drop the image.
    /// Refused while the table is pinned.
    pub fn unload_table(&self, table: &Arc<Table>) -> Result<(), AmlError> {
        self.ctx.tables().remove(table.id)?;
        self.ctx.namespace().remove_owner(table.id);
        Ok(())
    }

    /// Find an installed table by signature and optional OEM filters.
    pub fn find_table(
        &self,
        signature: &str,
        oem_id: Option<&str>,
        oem_table_id: Option<&str>,
    ) -> Option<Arc<Table>> {
        self.ctx.tables().find(signature, oem_id, oem_table_id, 0)
    }

    /// Gate future table installations through `hook`.
    pub fn set_table_install_hook(&self, hook: Option<InstallHook>) {
        self.ctx.tables().set_install_hook(hook);
    }

    /* EVALUATION */

    /// Evaluate the object at `path` with the given arguments.
    pub fn evaluate(
        &self,
        path: &str,
        args: Vec<Object>,
    ) -> Result<Option<ObjectRef>, AmlError> {
        self.ctx.require_init(InitLevel::SubsystemInitialized)?;
        let mut interp = Interpreter::new(self.ctx.clone());
        interp.evaluate_path(path, args)
    }

    /// Evaluate and require a result of `expected` type.
    pub fn evaluate_typed(
        &self,
        path: &str,
        args: Vec<Object>,
        expected: ObjectType,
    ) -> Result<ObjectRef, AmlError> {
        let result = self
            .evaluate(path, args)?
            .ok_or_else(|| AmlError::NotFound(format!("{path} returned nothing")))?;
        let result = result.chase().map_err(|e| e.into_client())?;
        let found = result.type_of();
        if found != expected {
            return Err(AmlError::TypeMismatch { expected, found });
        }
        Ok(result)
    }

    /// Evaluate to an integer with implicit conversion.
    pub fn evaluate_integer(&self, path: &str, args: Vec<Object>) -> Result<u64, AmlError> {
        let result = self
            .evaluate(path, args)?
            .ok_or_else(|| AmlError::NotFound(format!("{path} returned nothing")))?;
        let cell = result.chase().map_err(|e| e.into_client())?;
        let value = to_integer(&cell.read(), IntegerWidth::Full).map_err(|e| e.into_client())?;
        Ok(value)
    }

    /// Run the device initialization pass: `_INI` for devices whose `_STA`
    /// reports present or functioning, skipping absent subtrees.
    pub fn initialize_namespace(&self) -> Result<(), AmlError> {
        self.ctx.require_init(InitLevel::NamespaceLoaded)?;
        let root = self.ctx.namespace().root().clone();
        let mut initialized = 0usize;
        self.ctx.namespace().walk(&root, |node, _| {
            let is_device = matches!(
                node.object().type_of(),
                ObjectType::Device | ObjectType::Processor | ObjectType::ThermalZone
            );
            if !is_device {
                return WalkControl::Continue;
            }
            let sta = self
                .evaluate_child_integer(node, "_STA")
                .unwrap_or(STA_PRESENT | STA_FUNCTIONING);
            if sta & STA_PRESENT == 0 {
                return if sta & STA_FUNCTIONING == 0 {
                    WalkControl::SkipSubtree
                } else {
                    WalkControl::Continue
                };
            }
            if let Some(ini) = self.child(node, "_INI") {
                let mut interp = Interpreter::new(self.ctx.clone());
                match interp.evaluate_node(&ini, Vec::new()) {
                    Ok(_) => initialized += 1,
                    Err(error) => warn!(
                        target: "aml_vm::runtime",
                        node = %node.absolute_path(),
                        %error,
                        "_INI failed"
                    ),
                }
            }
            WalkControl::Continue
        });
        info!(target: "aml_vm::runtime", initialized, "device initialization pass done");
        self.ctx.set_init_level(InitLevel::NamespaceInitialized);
        Ok(())
    }

    /* HANDLERS */

    /// Install a notify handler; `path` of `None` receives every target.
    pub fn install_notify_handler(
        &self,
        path: Option<&str>,
        handler: Arc<dyn NotifyHandler>,
    ) -> Result<(), AmlError> {
        let node = self.optional_node(path)?;
        self.ctx.events().install_notify_handler(node.as_ref(), handler)
    }

    /// Remove a notify handler registration.
    pub fn uninstall_notify_handler(&self, path: Option<&str>) -> Result<(), AmlError> {
        let node = self.optional_node(path)?;
        self.ctx.events().uninstall_notify_handler(node.as_ref())
    }

    /// Install an address-space handler at `path` (or the root).
    pub fn install_address_space_handler(
        &self,
        path: Option<&str>,
        space: AddressSpace,
        handler: Arc<dyn RegionHandler>,
    ) -> Result<(), AmlError> {
        let node = self.optional_node(path)?;
        self.ctx.install_region_handler(node.as_ref(), space, handler)
    }

    /// Remove an address-space handler.
    pub fn uninstall_address_space_handler(
        &self,
        path: Option<&str>,
        space: AddressSpace,
    ) -> Result<(), AmlError> {
        let node = self.optional_node(path)?;
        self.ctx.uninstall_region_handler(node.as_ref(), space)
    }

    /// Install a native GPE handler.
    pub fn install_gpe_handler(
        &self,
        gpe: u16,
        trigger: GpeTrigger,
        handler: Arc<dyn GpeHandler>,
    ) -> Result<(), AmlError> {
        self.ctx.events().install_gpe_handler(gpe, trigger, handler)
    }

    /// Remove a native GPE handler.
    pub fn uninstall_gpe_handler(&self, gpe: u16) -> Result<(), AmlError> {
        self.ctx.events().uninstall_gpe_handler(gpe)
    }

    /// Install a fixed-event handler.
    pub fn install_fixed_event_handler(
        &self,
        event: FixedEvent,
        handler: Arc<dyn FixedEventHandler>,
    ) -> Result<(), AmlError> {
        self.ctx.events().install_fixed_event_handler(event, handler)
    }

    /// Remove a fixed-event handler.
    pub fn uninstall_fixed_event_handler(&self, event: FixedEvent) -> Result<(), AmlError> {
        self.ctx.events().uninstall_fixed_event_handler(event)
    }

    /// Advertise a host interface through `_OSI`.
    pub fn install_interface(&self, name: &str) -> Result<(), AmlError> {
        self.ctx.install_interface(name)
    }

    /// Withdraw a host interface.
    pub fn uninstall_interface(&self, name: &str) -> Result<(), AmlError> {
        self.ctx.uninstall_interface(name)
    }

    /* NAMESPACE */

    /// Resolve a path to its node.
    pub fn find_node(&self, path: &str) -> Result<NodeRef, AmlError> {
        let name: AmlName = path.parse()?;
        self.ctx
            .namespace()
            .find(self.ctx.namespace().root(), &name)
    }

    /// Visit the children of `path` in installation order.
    pub fn for_each_child(
        &self,
        path: &str,
        mut visit: impl FnMut(&NodeRef),
    ) -> Result<(), AmlError> {
        let node = self.find_node(path)?;
        for child in node.children_snapshot() {
            visit(&child);
        }
        Ok(())
    }

    /// Device identification summary for `node`.
    pub fn node_info(&self, node: &NodeRef) -> NodeInfo {
        let mut info = NodeInfo {
            path: node.absolute_path(),
            object_type: node.object().type_of(),
            ..NodeInfo::default()
        };
        info.hid = self.evaluate_child_id(node, "_HID");
        info.uid = self.evaluate_child_id(node, "_UID");
        info.adr = self.evaluate_child_integer(node, "_ADR");
        info.cids = self.evaluate_child_cids(node);
        info.cls = self.evaluate_child_cls(node);
        for state in 1..=4u8 {
            info.sxd[state as usize - 1] = self
                .evaluate_child_integer(node, &format!("_S{state}D"))
                .map(|v| v as u8);
        }
        for state in 0..=4u8 {
            info.sxw[state as usize] = self
                .evaluate_child_integer(node, &format!("_S{state}W"))
                .map(|v| v as u8);
        }
        info
    }

    fn child(&self, node: &NodeRef, name: &str) -> Option<NodeRef> {
        let seg = name.parse().ok()?;
        node.child(seg)
    }

    fn evaluate_child(&self, node: &NodeRef, name: &str) -> Option<ObjectRef> {
        let child = self.child(node, name)?;
        let mut interp = Interpreter::new(self.ctx.clone());
        interp
            .evaluate_node(&child, Vec::new())
            .ok()
            .flatten()
            .and_then(|cell| cell.chase().ok())
    }

    fn evaluate_child_integer(&self, node: &NodeRef, name: &str) -> Option<u64> {
        let cell = self.evaluate_child(node, name)?;
        let value = to_integer(&cell.read(), IntegerWidth::Full).ok()?;
        Some(value)
    }

    /// `_HID`/`_UID` style values: strings verbatim, integers rendered
    /// (EISA-packed for `_HID`, decimal for `_UID`).
    fn evaluate_child_id(&self, node: &NodeRef, name: &str) -> Option<String> {
        let cell = self.evaluate_child(node, name)?;
        let guard = cell.read();
        match &*guard {
            Object::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            Object::Integer(v) if name == "_HID" => Some(eisa_id_to_string(*v as u32)),
            Object::Integer(v) => Some(v.to_string()),
            _ => None,
        }
    }

    fn evaluate_child_cids(&self, node: &NodeRef) -> Vec<String> {
        let Some(cell) = self.evaluate_child(node, "_CID") else {
            return Vec::new();
        };
        let render = |cell: &ObjectRef| -> Option<String> {
            let guard = cell.read();
            match &*guard {
                Object::String(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
                Object::Integer(v) => Some(eisa_id_to_string(*v as u32)),
                _ => None,
            }
        };
        let guard = cell.read();
        match &*guard {
            Object::Package(elements) => elements
                .iter()
                .filter_map(|element| element.chase().ok().as_ref().and_then(render))
                .collect(),
            _ => {
                drop(guard);
                render(&cell).into_iter().collect()
            }
        }
    }

    /// `_CLS`: three-byte class code rendered as six hex digits.
    fn evaluate_child_cls(&self, node: &NodeRef) -> Option<String> {
        let cell = self.evaluate_child(node, "_CLS")?;
        let guard = cell.read();
        let Object::Package(elements) = &*guard else {
            return None;
        };
        let mut out = String::new();
        for element in elements.iter().take(3) {
            let element = element.chase().ok()?;
            let byte = to_integer(&element.read(), IntegerWidth::Full).ok()?;
            out.push_str(&format!("{:02X}", byte as u8));
        }
        Some(out)
    }

    fn optional_node(&self, path: Option<&str>) -> Result<Option<NodeRef>, AmlError> {
        path.map(|p| self.find_node(p)).transpose()
    }
}

/// Identification summary returned by [`Runtime::node_info`].
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NodeInfo {
    /// Absolute path of the node.
    pub path: String,
    /// Type of the node's object.
    pub object_type: ObjectType,
    /// Decoded `_HID`, when present.
    pub hid: Option<String>,
    /// Decoded `_CID` list, possibly empty.
    pub cids: Vec<String>,
    /// Decoded `_UID`.
    pub uid: Option<String>,
    /// `_CLS` class code as six hex digits.
    pub cls: Option<String>,
    /// Raw `_ADR`.
    pub adr: Option<u64>,
    /// `_S1D`..`_S4D` device sleep states.
    pub sxd: [Option<u8>; 4],
    /// `_S0W`..`_S4W` wake capabilities.
    pub sxw: [Option<u8>; 5],
}

/// Unpack a compressed EISA id into its `AAA####` text form.
fn eisa_id_to_string(id: u32) -> String {
    let swapped = id.swap_bytes();
    let letter = |shift: u32| (((swapped >> shift) & 0x1f) as u8 + 0x40) as char;
    format!(
        "{}{}{}{:04X}",
        letter(26),
        letter(21),
        letter(16),
        swapped & 0xffff
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eisa_ids_unpack() {
        // "PNP0A03" compressed per the EISA scheme.
        let packed: u32 = 0x030ad041;
        assert_eq!(eisa_id_to_string(packed), "PNP0A03");
    }
}
