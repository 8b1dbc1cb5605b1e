//! Firmware object representation
//!
//! Every value AML can touch is an [`Object`] held in a shared, lockable
//! cell ([`ObjectRef`]). Cells are what give the language its aliasing
//! semantics: package elements, method locals, and named nodes all hold
//! cells, and references capture cells rather than values. The cell's
//! `Arc` strong count is the object's reference count.

use crate::error::{AbortResult, MethodAbort};
use crate::namespace::NodeRef;
use crate::opregion::{FieldUnit, OpRegion};
use crate::sync::{AmlEvent, AmlMutex, RecursiveMutex};

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use core::fmt;

mod cast;

pub use cast::{
    integer_to_decimal_string, integer_to_hex_string, parse_string_integer, to_buffer,
    to_integer, to_string_value,
};

/// Type tags exposed by the `ObjectType` operator, plus the internal
/// reference and debug tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum ObjectType {
    /// Slot exists but was never written.
    #[default]
    Uninitialized = 0,
    /// 64-bit (or revision-masked 32-bit) integer.
    Integer = 1,
    /// Byte string, nul-terminated for external consumers.
    String = 2,
    /// Raw byte sequence.
    Buffer = 3,
    /// Ordered sequence of objects.
    Package = 4,
    /// Bit range bound into an operation region.
    FieldUnit = 5,
    /// Device scope marker.
    Device = 6,
    /// Counting event.
    Event = 7,
    /// Control method.
    Method = 8,
    /// Recursive mutex with a sync level.
    Mutex = 9,
    /// Window into an address space.
    OperationRegion = 10,
    /// Power resource scope marker.
    PowerResource = 11,
    /// Processor scope marker.
    Processor = 12,
    /// Thermal zone scope marker.
    ThermalZone = 13,
    /// Bit range inside a buffer.
    BufferField = 14,
    /// The debug output object.
    Debug = 16,
    /// Internal reference object; never surfaced by `ObjectType`.
    Reference = 20,
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Integer width selected by the declaring table's revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerWidth {
    /// Tables below revision 2: 32-bit arithmetic.
    Legacy,
    /// Revision 2 and above: full 64-bit arithmetic.
    Full,
}

impl IntegerWidth {
    /// Width for a table revision byte.
    pub fn for_revision(revision: u8) -> Self {
        if revision >= crate::consts::INTEGER_WIDTH_REVISION {
            Self::Full
        } else {
            Self::Legacy
        }
    }

    /// All-ones mask at this width.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Legacy => u32::MAX as u64,
            Self::Full => u64::MAX,
        }
    }

    /// Integer size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            Self::Legacy => 4,
            Self::Full => 8,
        }
    }
}

/// Window into a loaded table's AML byte image.
#[derive(Clone)]
pub struct CodeSlice {
    data: Arc<Vec<u8>>,
    start: usize,
    end: usize,
}

impl CodeSlice {
    /// Window `data[start..end]`; clamped to the image.
    pub fn new(data: Arc<Vec<u8>>, start: usize, end: usize) -> Self {
        let end = end.min(data.len());
        let start = start.min(end);
        Self { data, start, end }
    }

    /// Backing table image.
    pub fn data(&self) -> &Arc<Vec<u8>> {
        &self.data
    }

    /// Absolute start offset.
    pub const fn start(&self) -> usize {
        self.start
    }

    /// Absolute end offset.
    pub const fn end(&self) -> usize {
        self.end
    }

    /// The windowed bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }
}

impl fmt::Debug for CodeSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeSlice({}..{})", self.start, self.end)
    }
}

/// Natively implemented methods installed at namespace creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeMethod {
    /// `_OSI`: answers host-interface queries against the interface list.
    OsiQuery,
}

/// Method body: AML bytecode or a native builtin.
#[derive(Debug, Clone)]
pub enum MethodBody {
    /// Bytecode window executed by the interpreter.
    Aml(CodeSlice),
    /// Builtin handled without entering the bytecode engine.
    Native(NativeMethod),
}

/// A control method: body, calling convention, and serialization guard.
#[derive(Debug)]
pub struct Method {
    /// Bytecode or native body.
    pub body: MethodBody,
    /// Declared argument count, `0..=7`.
    pub arg_count: u8,
    /// Whether invocations serialize on `guard`.
    pub serialized: bool,
    /// Sync level taken while serialized.
    pub sync_level: u8,
    /// Integer width of the declaring table.
    pub width: IntegerWidth,
    /// Per-method recursive lock for `Serialized` methods.
    pub guard: RecursiveMutex,
}

impl Method {
    /// AML method from a bytecode window and the encoded flags byte.
    pub fn from_flags(body: CodeSlice, flags: u8, width: IntegerWidth) -> Self {
        Self {
            body: MethodBody::Aml(body),
            arg_count: flags & 0x07,
            serialized: flags & 0x08 != 0,
            sync_level: flags >> 4,
            width,
            guard: RecursiveMutex::new(),
        }
    }

    /// Native builtin method.
    pub fn native(which: NativeMethod, arg_count: u8) -> Self {
        Self {
            body: MethodBody::Native(which),
            arg_count,
            serialized: false,
            sync_level: 0,
            width: IntegerWidth::Full,
            guard: RecursiveMutex::new(),
        }
    }
}

/// Bit range laid over a buffer object by one of the `CreateField` family.
#[derive(Debug, Clone)]
pub struct BufferField {
    /// Cell holding the source buffer.
    pub source: ObjectRef,
    /// First bit, zero-based from the buffer start.
    pub bit_offset: u64,
    /// Number of bits.
    pub bit_count: u32,
}

/// Reference object kinds.
///
/// References capture cells (or node identity), so they chain: a cell may
/// itself hold another `Reference`. Chains are collapsed iteratively with a
/// depth cap.
#[derive(Debug, Clone)]
pub enum Reference {
    /// Reference to a named node; keeps the object alive even after the
    /// node is unlinked from the tree.
    Node(NodeRef),
    /// Captured cell: a local/argument slot's object or another reference's
    /// target.
    Value(ObjectRef),
    /// Element slot of a package.
    PackageIndex {
        /// Cell holding the package.
        package: ObjectRef,
        /// Element position.
        index: usize,
    },
    /// Byte of a buffer or string.
    ByteIndex {
        /// Cell holding the buffer or string.
        data: ObjectRef,
        /// Byte position.
        index: usize,
    },
}

/// A discriminated firmware value.
#[derive(Debug, Clone, Default)]
pub enum Object {
    /// Empty slot.
    #[default]
    Uninitialized,
    /// Integer, stored at full width; masking happens at operation time.
    Integer(u64),
    /// Byte string without the terminating nul.
    String(Vec<u8>),
    /// Raw bytes.
    Buffer(Vec<u8>),
    /// Ordered elements, each its own shared cell.
    Package(Vec<ObjectRef>),
    /// Bit range in an operation region.
    FieldUnit(FieldUnit),
    /// Bit range in a buffer.
    BufferField(BufferField),
    /// Address-space window.
    OpRegion(Arc<OpRegion>),
    /// Device scope marker; children live in the namespace.
    Device,
    /// Processor declaration.
    Processor {
        /// Processor id from the declaration.
        id: u8,
        /// P_BLK address.
        pblk_addr: u32,
        /// P_BLK length.
        pblk_len: u8,
    },
    /// Power resource declaration.
    PowerResource {
        /// Lowest system sleep level keeping the resource on.
        system_level: u8,
        /// Relative ordering for on/off sequencing.
        resource_order: u16,
    },
    /// Thermal zone scope marker.
    ThermalZone,
    /// AML mutex.
    Mutex(Arc<AmlMutex>),
    /// AML event.
    Event(Arc<AmlEvent>),
    /// Control method.
    Method(Arc<Method>),
    /// Reference object.
    Reference(Reference),
    /// Debug output sink.
    Debug,
}

impl Object {
    /// Type tag of this value.
    pub fn type_of(&self) -> ObjectType {
        match self {
            Self::Uninitialized => ObjectType::Uninitialized,
            Self::Integer(_) => ObjectType::Integer,
            Self::String(_) => ObjectType::String,
            Self::Buffer(_) => ObjectType::Buffer,
            Self::Package(_) => ObjectType::Package,
            Self::FieldUnit(_) => ObjectType::FieldUnit,
            Self::BufferField(_) => ObjectType::BufferField,
            Self::OpRegion(_) => ObjectType::OperationRegion,
            Self::Device => ObjectType::Device,
            Self::Processor { .. } => ObjectType::Processor,
            Self::PowerResource { .. } => ObjectType::PowerResource,
            Self::ThermalZone => ObjectType::ThermalZone,
            Self::Mutex(_) => ObjectType::Mutex,
            Self::Event(_) => ObjectType::Event,
            Self::Method(_) => ObjectType::Method,
            Self::Reference(_) => ObjectType::Reference,
            Self::Debug => ObjectType::Debug,
        }
    }

    /// Whether this is one of the data types implicit conversion covers.
    pub fn is_data(&self) -> bool {
        matches!(
            self,
            Self::Integer(_) | Self::String(_) | Self::Buffer(_) | Self::Package(_)
        )
    }

    /// String from text, for construction sites and tests.
    pub fn string(text: &str) -> Self {
        Self::String(text.as_bytes().to_vec())
    }

    /// Package from a list of values, each getting its own cell.
    pub fn package(values: impl IntoIterator<Item = Object>) -> Self {
        Self::Package(values.into_iter().map(ObjectRef::new).collect())
    }
}

/// Shared, lockable cell holding one [`Object`].
///
/// The `Arc` strong count is the live reference count required by the
/// object-lifetime invariants; there is no separate counter to drift out of
/// sync.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<RwLock<Object>>);

impl ObjectRef {
    /// New cell holding `value`.
    pub fn new(value: Object) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Shared read access; tolerates poisoning since objects stay
    /// structurally valid across panics.
    pub fn read(&self) -> RwLockReadGuard<'_, Object> {
        match self.0.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Exclusive write access.
    pub fn write(&self) -> RwLockWriteGuard<'_, Object> {
        match self.0.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Type tag of the held value.
    pub fn type_of(&self) -> ObjectType {
        self.read().type_of()
    }

    /// Whether two refs share the same cell.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of live holders of this cell.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    /// Deep copy per `CopyObject` rules: value types copied by value,
    /// packages element by element into fresh cells, references (and other
    /// identity-carrying variants) by target identity.
    ///
    /// Iterative so adversarially nested packages cannot exhaust the host
    /// stack.
    pub fn deep_clone(&self) -> ObjectRef {
        let root = ObjectRef::new(self.read().clone());
        let mut work = vec![root.clone()];
        while let Some(cell) = work.pop() {
            let elements = match &*cell.read() {
                Object::Package(elements) => elements.clone(),
                _ => continue,
            };
            let copies: Vec<ObjectRef> = elements
                .iter()
                .map(|element| ObjectRef::new(element.read().clone()))
                .collect();
            work.extend(copies.iter().cloned());
            *cell.write() = Object::Package(copies);
        }
        root
    }

    /// Structural equality on data values.
    ///
    /// Packages compare element-wise; reference and identity variants
    /// compare by target identity. Depth-capped to survive reference
    /// cycles threaded through packages.
    pub fn value_eq(&self, other: &ObjectRef) -> bool {
        fn eq(a: &ObjectRef, b: &ObjectRef, depth: usize) -> bool {
            if depth == 0 {
                return a.ptr_eq(b);
            }
            if a.ptr_eq(b) {
                return true;
            }
            let (a, b) = (a.read(), b.read());
            match (&*a, &*b) {
                (Object::Uninitialized, Object::Uninitialized) => true,
                (Object::Integer(x), Object::Integer(y)) => x == y,
                (Object::String(x), Object::String(y)) => x == y,
                (Object::Buffer(x), Object::Buffer(y)) => x == y,
                (Object::Package(x), Object::Package(y)) => {
                    x.len() == y.len()
                        && x.iter().zip(y.iter()).all(|(x, y)| eq(x, y, depth - 1))
                }
                (Object::Mutex(x), Object::Mutex(y)) => Arc::ptr_eq(x, y),
                (Object::Event(x), Object::Event(y)) => Arc::ptr_eq(x, y),
                (Object::Method(x), Object::Method(y)) => Arc::ptr_eq(x, y),
                (Object::OpRegion(x), Object::OpRegion(y)) => Arc::ptr_eq(x, y),
                _ => false,
            }
        }
        eq(self, other, crate::consts::MAX_REFERENCE_DEPTH)
    }

    /// Collapse a reference chain to the final non-reference cell.
    ///
    /// Node references resolve to the node's current object; index
    /// references materialize the indexed element. Caps at
    /// [`crate::consts::MAX_REFERENCE_DEPTH`] hops.
    pub fn chase(&self) -> AbortResult<ObjectRef> {
        let mut current = self.clone();
        for _ in 0..crate::consts::MAX_REFERENCE_DEPTH {
            let next = {
                let guard = current.read();
                match &*guard {
                    Object::Reference(reference) => Some(reference.load()?),
                    _ => None,
                }
            };
            match next {
                Some(next) => current = next,
                None => return Ok(current),
            }
        }
        Err(MethodAbort::ReferenceDepth(
            crate::consts::MAX_REFERENCE_DEPTH,
        ))
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(guard) => write!(f, "ObjectRef({:?})", &*guard),
            Err(_) => write!(f, "ObjectRef(<locked>)"),
        }
    }
}

impl From<Object> for ObjectRef {
    fn from(value: Object) -> Self {
        Self::new(value)
    }
}

impl Reference {
    /// Load the referent one hop down the chain.
    ///
    /// Package and byte indexes materialize the element; for bytes that
    /// means a fresh integer cell snapshotting the byte.
    pub fn load(&self) -> AbortResult<ObjectRef> {
        match self {
            Self::Node(node) => Ok(node.object()),
            Self::Value(cell) => Ok(cell.clone()),
            Self::PackageIndex { package, index } => match &*package.read() {
                Object::Package(elements) => elements
                    .get(*index)
                    .cloned()
                    .ok_or(MethodAbort::Error(crate::error::AmlError::BadOperand(
                        "package index out of range",
                    ))),
                _ => Err(MethodAbort::Error(crate::error::AmlError::BadOperand(
                    "index target is not a package",
                ))),
            },
            Self::ByteIndex { data, index } => {
                let byte = match &*data.read() {
                    Object::Buffer(bytes) | Object::String(bytes) => bytes.get(*index).copied(),
                    _ => None,
                };
                byte.map(|b| ObjectRef::new(Object::Integer(b as u64)))
                    .ok_or(MethodAbort::Error(crate::error::AmlError::BadOperand(
                        "byte index out of range",
                    )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cells_share_values() {
        let cell = ObjectRef::new(Object::Integer(5));
        let alias = cell.clone();
        *cell.write() = Object::Integer(6);
        assert!(matches!(*alias.read(), Object::Integer(6)));
        assert_eq!(cell.holders(), 2);
    }

    #[test]
    fn deep_clone_detaches_packages() {
        let inner = ObjectRef::new(Object::Integer(1));
        let pkg = ObjectRef::new(Object::Package(vec![inner.clone()]));
        let copy = pkg.deep_clone();
        *inner.write() = Object::Integer(2);

        let copied_inner = match &*copy.read() {
            Object::Package(elements) => elements[0].clone(),
            other => panic!("expected package, got {other:?}"),
        };
        assert!(matches!(*copied_inner.read(), Object::Integer(1)));
    }

    #[test]
    fn deep_clone_survives_pathological_nesting() {
        let mut pkg = Object::package([Object::Integer(0)]);
        for _ in 0..10_000 {
            pkg = Object::Package(vec![ObjectRef::new(pkg)]);
        }
        let cell = ObjectRef::new(pkg);
        let copy = cell.deep_clone();
        assert!(copy.value_eq(&cell));
    }

    #[test]
    fn chase_collapses_chains() {
        let target = ObjectRef::new(Object::Integer(42));
        let mut reference = target.clone();
        for _ in 0..5 {
            reference = ObjectRef::new(Object::Reference(Reference::Value(reference)));
        }
        let found = reference.chase().unwrap();
        assert!(found.ptr_eq(&target));
    }

    #[test]
    fn chase_rejects_cycles() {
        let cell = ObjectRef::new(Object::Uninitialized);
        *cell.write() = Object::Reference(Reference::Value(cell.clone()));
        assert!(cell.chase().is_err());
    }

    #[test]
    fn package_index_materializes_elements() {
        let pkg = ObjectRef::new(Object::package([Object::Integer(7), Object::Integer(9)]));
        let reference = Reference::PackageIndex {
            package: pkg,
            index: 1,
        };
        let element = reference.load().unwrap();
        assert!(matches!(*element.read(), Object::Integer(9)));
    }

    #[test]
    fn value_eq_compares_structure() {
        let a = ObjectRef::new(Object::package([
            Object::Integer(1),
            Object::string("two"),
        ]));
        let b = ObjectRef::new(Object::package([
            Object::Integer(1),
            Object::string("two"),
        ]));
        let c = ObjectRef::new(Object::package([Object::Integer(1)]));
        assert!(a.value_eq(&b));
        assert!(!a.value_eq(&c));
    }
}
