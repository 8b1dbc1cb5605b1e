//! Portable AML interpreter and ACPI namespace runtime for embedding in a
//! kernel.
//!
//! The crate is the firmware-facing core: the bytecode interpreter, the
//! object and namespace model, operation regions, and the event plumbing
//! for GPEs, fixed events, and Notify. Everything the kernel must provide
//! goes through the [`host::Host`] trait; everything the kernel calls goes
//! through [`runtime::Runtime`].

pub mod consts;
pub mod context;
pub mod error;
pub mod event;
pub mod host;
pub mod interpreter;
pub mod name;
pub mod namespace;
pub mod object;
pub mod opcode;
pub mod opregion;
pub mod runtime;
pub mod sync;
pub mod table;

pub mod prelude {
    //! One-stop imports for embedders.

    pub use crate::context::{Context, InitLevel};
    pub use crate::error::AmlError;
    pub use crate::event::{
        FixedEvent, FixedEventHandler, GpeDisposition, GpeHandler, GpeTrigger, NotifyHandler,
    };
    pub use crate::host::{Host, MemoryHost, PciAddress};
    pub use crate::interpreter::Interpreter;
    pub use crate::name::{AmlName, NameSeg};
    pub use crate::namespace::{Node, NodeRef, WalkControl};
    pub use crate::object::{IntegerWidth, Object, ObjectRef, ObjectType};
    pub use crate::opregion::{AddressSpace, RegionAccess, RegionHandler};
    pub use crate::runtime::{NodeInfo, Runtime, RuntimeParams};
    pub use crate::table::{Table, TableHeader};
}
