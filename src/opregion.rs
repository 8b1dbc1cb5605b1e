//! Operation regions and field units
//!
//! A region is a window into an address space; field units are bit ranges
//! laid over it. Field access decomposes into access-width-sized handler
//! operations with masking and, for `Preserve`, read-modify-write. Handlers
//! resolve per (node, space): registration points attach to namespace nodes
//! and the lookup walks the region's ancestors.

use crate::context::Context;
use crate::error::{AbortResult, AmlError, MethodAbort};
use crate::host::PciAddress;
use crate::object::{to_buffer, to_integer, IntegerWidth, Object, ObjectRef};
use crate::namespace::NodeRef;

use std::sync::{Arc, RwLock, Weak};

use tracing::{trace, warn};

/// ACPI-defined address spaces, plus OEM-defined ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AddressSpace {
    /// Physical memory.
    SystemMemory,
    /// Port I/O.
    SystemIo,
    /// PCI configuration space of the enclosing device.
    PciConfig,
    /// Embedded controller.
    EmbeddedController,
    /// SMBus; BufferAcc protocol.
    SmBus,
    /// CMOS/RTC bank.
    Cmos,
    /// PCI BAR target.
    PciBarTarget,
    /// IPMI; BufferAcc protocol.
    Ipmi,
    /// GPIO pin block.
    GeneralPurposeIo,
    /// Generic serial bus; BufferAcc protocol.
    GenericSerialBus,
    /// Platform communication channel.
    Pcc,
    /// Platform runtime mechanism.
    Prm,
    /// Functional fixed hardware.
    FFixedHw,
    /// OEM-defined space (`0x80..=0xff`).
    Oem(u8),
}

impl AddressSpace {
    /// Decode the region-space byte.
    pub fn from_byte(byte: u8) -> Self {
        match byte {
            0x00 => Self::SystemMemory,
            0x01 => Self::SystemIo,
            0x02 => Self::PciConfig,
            0x03 => Self::EmbeddedController,
            0x04 => Self::SmBus,
            0x05 => Self::Cmos,
            0x06 => Self::PciBarTarget,
            0x07 => Self::Ipmi,
            0x08 => Self::GeneralPurposeIo,
            0x09 => Self::GenericSerialBus,
            0x0a => Self::Pcc,
            0x0b => Self::Prm,
            0x7f => Self::FFixedHw,
            other => Self::Oem(other),
        }
    }

    /// Wire encoding of this space.
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::SystemMemory => 0x00,
            Self::SystemIo => 0x01,
            Self::PciConfig => 0x02,
            Self::EmbeddedController => 0x03,
            Self::SmBus => 0x04,
            Self::Cmos => 0x05,
            Self::PciBarTarget => 0x06,
            Self::Ipmi => 0x07,
            Self::GeneralPurposeIo => 0x08,
            Self::GenericSerialBus => 0x09,
            Self::Pcc => 0x0a,
            Self::Prm => 0x0b,
            Self::FFixedHw => 0x7f,
            Self::Oem(id) => id,
        }
    }

    /// Whether field access marshals structured buffers instead of scalars.
    pub const fn is_buffer_acc(self) -> bool {
        matches!(self, Self::SmBus | Self::Ipmi | Self::GenericSerialBus)
    }
}

/// Field access granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    /// Interpreter picks; resolved to byte access.
    Any,
    /// One byte.
    Byte,
    /// Two bytes.
    Word,
    /// Four bytes.
    DWord,
    /// Eight bytes.
    QWord,
    /// Structured buffer transfer.
    Buffer,
}

/// What happens to unwritten bits within an access chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRule {
    /// Read-modify-write.
    Preserve,
    /// Fill with ones.
    WriteAsOnes,
    /// Fill with zeros.
    WriteAsZeros,
}

/// Decoded field flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldFlags {
    raw: u8,
}

impl FieldFlags {
    /// Wrap the encoded flags byte.
    pub const fn new(raw: u8) -> Self {
        Self { raw }
    }

    /// The encoded byte.
    pub const fn raw(self) -> u8 {
        self.raw
    }

    /// Same flags with the access type replaced (an `AccessField` entry in
    /// a field list).
    pub const fn with_access_type(self, access: u8) -> Self {
        Self {
            raw: (self.raw & 0xf0) | (access & 0x0f),
        }
    }

    /// Declared access granularity.
    pub fn access_type(self) -> AccessType {
        match self.raw & 0x0f {
            0 => AccessType::Any,
            1 => AccessType::Byte,
            2 => AccessType::Word,
            3 => AccessType::DWord,
            4 => AccessType::QWord,
            5 => AccessType::Buffer,
            other => {
                warn!(target: "aml_vm::opregion", access = other, "reserved access type");
                AccessType::Any
            }
        }
    }

    /// Whether accesses take the global lock.
    pub const fn needs_lock(self) -> bool {
        self.raw & 0x10 != 0
    }

    /// Update rule for partial chunks.
    pub fn update_rule(self) -> UpdateRule {
        match (self.raw >> 5) & 0x03 {
            0 => UpdateRule::Preserve,
            1 => UpdateRule::WriteAsOnes,
            _ => UpdateRule::WriteAsZeros,
        }
    }

    /// Access width in bits.
    pub fn access_bits(self) -> u64 {
        match self.access_type() {
            AccessType::Any | AccessType::Byte | AccessType::Buffer => 8,
            AccessType::Word => 16,
            AccessType::DWord => 32,
            AccessType::QWord => 64,
        }
    }
}

/// Handler context handed to address-space handlers on every operation.
#[derive(Debug)]
pub struct RegionAccess<'a> {
    /// The region being accessed.
    pub region: &'a OpRegion,
    /// Runtime context for host services.
    pub ctx: &'a Context,
}

/// External address-space handler.
///
/// `offset` arguments are absolute within the space (region base plus field
/// offset). `attach` runs once before the first access and may fail, which
/// surfaces to the running method.
pub trait RegionHandler: Send + Sync {
    /// First-touch setup.
    fn attach(&self, _access: &RegionAccess<'_>) -> Result<(), AmlError> {
        Ok(())
    }

    /// Teardown when the region node goes away.
    fn detach(&self, _access: &RegionAccess<'_>) {}

    /// Scalar read of `width` bytes.
    fn read(&self, access: &RegionAccess<'_>, offset: u64, width: usize)
        -> Result<u64, AmlError>;

    /// Scalar write of `width` bytes.
    fn write(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError>;

    /// Structured transfer for BufferAcc spaces. `data` is the protocol
    /// buffer, in-out.
    fn transfer(
        &self,
        _access: &RegionAccess<'_>,
        _offset: u64,
        _attrib: u8,
        _data: &mut Vec<u8>,
        _write: bool,
    ) -> Result<(), AmlError> {
        Err(AmlError::InvalidArgument("space does not support BufferAcc"))
    }
}

#[derive(Default)]
struct RegionState {
    handler: Option<Arc<dyn RegionHandler>>,
    attached: bool,
}

/// An AML-declared window into an address space.
pub struct OpRegion {
    /// Address space this region windows.
    pub space: AddressSpace,
    /// Base offset within the space.
    pub offset: u64,
    /// Window length in bytes.
    pub length: u64,
    node: RwLock<Weak<crate::namespace::Node>>,
    state: RwLock<RegionState>,
    pci: RwLock<Option<PciAddress>>,
    backing: Option<Arc<Vec<u8>>>,
}

impl core::fmt::Debug for OpRegion {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "OpRegion({:?} @ {:#x}+{:#x})",
            self.space, self.offset, self.length
        )
    }
}

impl OpRegion {
    /// New, unattached region.
    pub fn new(space: AddressSpace, offset: u64, length: u64) -> Self {
        Self {
            space,
            offset,
            length,
            node: RwLock::new(Weak::new()),
            state: RwLock::new(RegionState::default()),
            pci: RwLock::new(None),
            backing: None,
        }
    }

    /// Region windowing an in-memory table image (`DataTableRegion`).
    /// Reads come from the image; writes are dropped.
    pub fn backed_by(image: Arc<Vec<u8>>) -> Self {
        let length = image.len() as u64;
        Self {
            space: AddressSpace::SystemMemory,
            offset: 0,
            length,
            node: RwLock::new(Weak::new()),
            state: RwLock::new(RegionState::default()),
            pci: RwLock::new(None),
            backing: Some(image),
        }
    }

    /// Bind the region to its namespace node after installation.
    pub fn bind_node(&self, node: &NodeRef) {
        *write_lock(&self.node) = Arc::downgrade(node);
    }

    /// The region's namespace node, while linked.
    pub fn node(&self) -> Option<NodeRef> {
        read_lock(&self.node).upgrade()
    }

    /// Resolved PCI function for `PciConfig` regions.
    pub fn pci_address(&self) -> Option<PciAddress> {
        *read_lock(&self.pci)
    }

    fn handler(&self, ctx: &Context) -> Result<Arc<dyn RegionHandler>, AmlError> {
        if let Some(handler) = read_lock(&self.state).handler.clone() {
            return Ok(handler);
        }
        let handler = ctx
            .find_region_handler(self.node().as_ref(), self.space)
            .ok_or(AmlError::NotReady("no handler for address space"))?;
        write_lock(&self.state).handler = Some(handler.clone());
        Ok(handler)
    }

    fn ensure_attached(&self, ctx: &Context) -> Result<Arc<dyn RegionHandler>, AmlError> {
        let handler = self.handler(ctx)?;
        let needs_attach = {
            let state = read_lock(&self.state);
            !state.attached
        };
        if needs_attach {
            if self.space == AddressSpace::PciConfig {
                *write_lock(&self.pci) = Some(self.resolve_pci_address());
            }
            handler.attach(&RegionAccess { region: self, ctx })?;
            write_lock(&self.state).attached = true;
            trace!(target: "aml_vm::opregion", region = ?self, "region attached");
        }
        Ok(handler)
    }

    /// Drop the cached handler binding, detaching if attached.
    pub fn unbind_handler(&self, ctx: &Context) {
        let (handler, attached) = {
            let mut state = write_lock(&self.state);
            (state.handler.take(), core::mem::take(&mut state.attached))
        };
        if let (Some(handler), true) = (handler, attached) {
            handler.detach(&RegionAccess { region: self, ctx });
        }
    }

    /// Locate the enclosing PCI function by reading `_ADR`/`_BBN`/`_SEG`
    /// value objects on the ancestor chain.
    ///
    /// Methods for these names would need evaluation mid-access; those
    /// resolve as zero, which matches firmware that relies on defaults.
    fn resolve_pci_address(&self) -> PciAddress {
        let mut address = PciAddress::default();
        let mut cursor = self.node().and_then(|n| n.parent());
        while let Some(node) = cursor {
            if let Some(adr) = read_integer_child(&node, "_ADR") {
                address.device = ((adr >> 16) & 0xffff) as u8;
                address.function = (adr & 0xffff) as u8;
                address.bus = read_integer_child(&node, "_BBN").unwrap_or(0) as u8;
                address.segment = read_integer_child(&node, "_SEG").unwrap_or(0) as u16;
                return address;
            }
            cursor = node.parent();
        }
        address
    }

    /// Scalar read of `width` bytes at `byte_offset` within the region.
    pub fn read(&self, ctx: &Context, byte_offset: u64, width: usize) -> Result<u64, AmlError> {
        self.check_bounds(byte_offset, width)?;
        if let Some(image) = &self.backing {
            let mut value = 0u64;
            for i in 0..width {
                let byte = image
                    .get(byte_offset as usize + i)
                    .copied()
                    .unwrap_or(0);
                value |= (byte as u64) << (8 * i);
            }
            return Ok(value);
        }
        let handler = self.ensure_attached(ctx)?;
        handler.read(
            &RegionAccess { region: self, ctx },
            self.offset + byte_offset,
            width,
        )
    }

    /// Scalar write of `width` bytes at `byte_offset` within the region.
    pub fn write(
        &self,
        ctx: &Context,
        byte_offset: u64,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        self.check_bounds(byte_offset, width)?;
        if self.backing.is_some() {
            warn!(target: "aml_vm::opregion", "write to table-backed region dropped");
            return Ok(());
        }
        let handler = self.ensure_attached(ctx)?;
        handler.write(
            &RegionAccess { region: self, ctx },
            self.offset + byte_offset,
            width,
            value,
        )
    }

    fn check_bounds(&self, byte_offset: u64, width: usize) -> Result<(), AmlError> {
        let end = byte_offset
            .checked_add(width as u64)
            .ok_or(AmlError::BadOperand("region offset overflow"))?;
        if end > self.length {
            return Err(AmlError::BadOperand("access beyond region bounds"));
        }
        Ok(())
    }
}

fn read_integer_child(node: &NodeRef, name: &str) -> Option<u64> {
    let seg = name.parse().ok()?;
    let child = node.child(seg)?;
    let object = child.object();
    let value = match &*object.read() {
        Object::Integer(v) => Some(*v),
        _ => None,
    };
    value
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Where a field unit's bits live.
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Directly over a region.
    Region(Arc<OpRegion>),
    /// Indirect: write the chunk offset to `index`, then move data through
    /// `data`. Both cells hold field units.
    Index {
        /// Index register field.
        index: ObjectRef,
        /// Data register field.
        data: ObjectRef,
    },
    /// Banked: write `bank_value` to `bank` before touching the region.
    Bank {
        /// Backing region.
        region: Arc<OpRegion>,
        /// Bank selection field.
        bank: ObjectRef,
        /// Value selecting this bank.
        bank_value: u64,
    },
}

/// A bit range bound into an operation region.
#[derive(Debug, Clone)]
pub struct FieldUnit {
    /// Backing storage flavor.
    pub kind: FieldKind,
    /// First bit within the region.
    pub bit_offset: u64,
    /// Number of bits.
    pub bit_count: u32,
    /// Decoded flags byte.
    pub flags: FieldFlags,
    /// Access attribute byte for BufferAcc protocols.
    pub attrib: u8,
}

/// Nesting bound for index/bank field indirection.
const MAX_FIELD_DEPTH: usize = 8;

/// Read a field unit into an object: integer when it fits the declared
/// width, buffer otherwise.
pub fn field_read(ctx: &Context, unit: &FieldUnit, width: IntegerWidth) -> AbortResult<Object> {
    field_read_at(ctx, unit, width, 0)
}

/// Write a data object into a field unit with truncation or zero extension.
pub fn field_write(ctx: &Context, unit: &FieldUnit, value: &Object) -> AbortResult<()> {
    field_write_at(ctx, unit, value, 0)
}

fn field_read_at(
    ctx: &Context,
    unit: &FieldUnit,
    width: IntegerWidth,
    depth: usize,
) -> AbortResult<Object> {
    if depth > MAX_FIELD_DEPTH {
        return Err(MethodAbort::Error(AmlError::BadBytecode(
            "field indirection too deep",
        )));
    }
    let _lock = FieldLock::take(ctx, unit);
    let bytes = match &unit.kind {
        FieldKind::Region(region) if region.space.is_buffer_acc() => {
            return buffer_acc(ctx, region, unit, None).map(Object::Buffer);
        }
        FieldKind::Region(region) => region_bits_read(ctx, region, unit)?,
        FieldKind::Bank {
            region,
            bank,
            bank_value,
        } => {
            select_bank(ctx, bank, *bank_value, depth)?;
            region_bits_read(ctx, region, unit)?
        }
        FieldKind::Index { index, data } => indexed_bits(ctx, unit, index, data, None, depth)?,
    };
    Ok(bits_to_object(bytes, unit.bit_count, width))
}

fn field_write_at(
    ctx: &Context,
    unit: &FieldUnit,
    value: &Object,
    depth: usize,
) -> AbortResult<()> {
    if depth > MAX_FIELD_DEPTH {
        return Err(MethodAbort::Error(AmlError::BadBytecode(
            "field indirection too deep",
        )));
    }
    let _lock = FieldLock::take(ctx, unit);
    // Truncate or zero-extend the source image to the field size.
    let mut image = to_buffer(value, IntegerWidth::Full)?;
    image.resize((unit.bit_count as usize + 7) / 8, 0);
    match &unit.kind {
        FieldKind::Region(region) if region.space.is_buffer_acc() => {
            buffer_acc(ctx, region, unit, Some(image))?;
            Ok(())
        }
        FieldKind::Region(region) => region_bits_write(ctx, region, unit, &image),
        FieldKind::Bank {
            region,
            bank,
            bank_value,
        } => {
            select_bank(ctx, bank, *bank_value, depth)?;
            region_bits_write(ctx, region, unit, &image)
        }
        FieldKind::Index { index, data } => {
            indexed_bits(ctx, unit, index, data, Some(&image), depth).map(|_| ())
        }
    }
}

/// RAII global-lock hold for `Lock`-rule fields.
struct FieldLock<'a> {
    ctx: Option<&'a Context>,
    thread: u64,
}

impl<'a> FieldLock<'a> {
    fn take(ctx: &'a Context, unit: &FieldUnit) -> Self {
        if unit.flags.needs_lock() {
            let thread = ctx.host().thread_id();
            ctx.global_lock().acquire(&*ctx.host(), thread, None);
            Self {
                ctx: Some(ctx),
                thread,
            }
        } else {
            Self {
                ctx: None,
                thread: 0,
            }
        }
    }
}

impl Drop for FieldLock<'_> {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx {
            let _ = ctx.global_lock().release(&*ctx.host(), self.thread);
        }
    }
}

fn select_bank(ctx: &Context, bank: &ObjectRef, value: u64, depth: usize) -> AbortResult<()> {
    let bank = bank.clone();
    let guard = bank.read();
    match &*guard {
        Object::FieldUnit(unit) => field_write_at(ctx, unit, &Object::Integer(value), depth + 1),
        _ => Err(MethodAbort::Error(AmlError::BadOperand(
            "bank selector is not a field",
        ))),
    }
}

/// Move bits through an index/data register pair, one data-field chunk at a
/// time. `image` is `Some` for writes.
fn indexed_bits(
    ctx: &Context,
    unit: &FieldUnit,
    index: &ObjectRef,
    data: &ObjectRef,
    image: Option<&[u8]>,
    depth: usize,
) -> AbortResult<Vec<u8>> {
    let (index_unit, data_unit) = {
        let index_guard = index.read();
        let data_guard = data.read();
        match (&*index_guard, &*data_guard) {
            (Object::FieldUnit(i), Object::FieldUnit(d)) => (i.clone(), d.clone()),
            _ => {
                return Err(MethodAbort::Error(AmlError::BadOperand(
                    "index field registers must be fields",
                )))
            }
        }
    };
    let chunk_bits = data_unit.bit_count.max(8) as u64;
    let chunk_bytes = (chunk_bits as usize + 7) / 8;
    let first = unit.bit_offset / chunk_bits;
    let last = (unit.bit_offset + unit.bit_count as u64 - 1) / chunk_bits;
    let mut out = vec![0u8; (unit.bit_count as usize + 7) / 8];
    let mut cursor = 0usize;
    for chunk in first..=last {
        let chunk_base = chunk * chunk_bits;
        let lo = unit.bit_offset.max(chunk_base);
        let hi = (unit.bit_offset + unit.bit_count as u64).min(chunk_base + chunk_bits);
        let nbits = (hi - lo) as usize;
        let shift = (lo - chunk_base) as usize;

        let select = Object::Integer(chunk * chunk_bytes as u64);
        field_write_at(ctx, &index_unit, &select, depth + 1)?;

        match image {
            None => {
                let chunk_obj = field_read_at(ctx, &data_unit, IntegerWidth::Full, depth + 1)?;
                let raw = to_integer(&chunk_obj, IntegerWidth::Full)?;
                let bits = (raw >> shift) & mask(nbits);
                put_bits(&mut out, cursor, nbits, bits);
            }
            Some(image) => {
                let bits = get_bits(image, cursor, nbits);
                let merged = match unit.flags.update_rule() {
                    UpdateRule::Preserve if nbits as u64 != chunk_bits => {
                        let prior =
                            field_read_at(ctx, &data_unit, IntegerWidth::Full, depth + 1)?;
                        let prior = to_integer(&prior, IntegerWidth::Full)?;
                        (prior & !(mask(nbits) << shift)) | (bits << shift)
                    }
                    UpdateRule::WriteAsOnes => {
                        (mask(chunk_bits as usize) & !(mask(nbits) << shift)) | (bits << shift)
                    }
                    _ => bits << shift,
                };
                field_write_at(ctx, &data_unit, &Object::Integer(merged), depth + 1)?;
            }
        }
        cursor += nbits;
    }
    Ok(out)
}

fn buffer_acc(
    ctx: &Context,
    region: &Arc<OpRegion>,
    unit: &FieldUnit,
    image: Option<Vec<u8>>,
) -> AbortResult<Vec<u8>> {
    let handler = region.ensure_attached(ctx).map_err(MethodAbort::Error)?;
    let write = image.is_some();
    // The protocol buffer: payload for writes, scratch sized by the larger
    // of the field and the classic 34-byte SMBus frame for reads.
    let mut data = image.unwrap_or_else(|| vec![0u8; ((unit.bit_count as usize + 7) / 8).max(34)]);
    handler
        .transfer(
            &RegionAccess { region, ctx },
            region.offset + unit.bit_offset / 8,
            unit.attrib,
            &mut data,
            write,
        )
        .map_err(MethodAbort::Error)?;
    Ok(data)
}

fn region_bits_read(ctx: &Context, region: &Arc<OpRegion>, unit: &FieldUnit) -> AbortResult<Vec<u8>> {
    let aw = unit.flags.access_bits();
    let first = unit.bit_offset / aw;
    let last = (unit.bit_offset + unit.bit_count as u64 - 1) / aw;
    let mut out = vec![0u8; (unit.bit_count as usize + 7) / 8];
    let mut cursor = 0usize;
    for chunk in first..=last {
        let chunk_base = chunk * aw;
        let lo = unit.bit_offset.max(chunk_base);
        let hi = (unit.bit_offset + unit.bit_count as u64).min(chunk_base + aw);
        let nbits = (hi - lo) as usize;
        let raw = region
            .read(ctx, chunk_base / 8, (aw / 8) as usize)
            .map_err(MethodAbort::Error)?;
        let bits = (raw >> (lo - chunk_base)) & mask(nbits);
        put_bits(&mut out, cursor, nbits, bits);
        cursor += nbits;
    }
    Ok(out)
}

fn region_bits_write(
    ctx: &Context,
    region: &Arc<OpRegion>,
    unit: &FieldUnit,
    image: &[u8],
) -> AbortResult<()> {
    let aw = unit.flags.access_bits();
    let first = unit.bit_offset / aw;
    let last = (unit.bit_offset + unit.bit_count as u64 - 1) / aw;
    let mut cursor = 0usize;
    for chunk in first..=last {
        let chunk_base = chunk * aw;
        let lo = unit.bit_offset.max(chunk_base);
        let hi = (unit.bit_offset + unit.bit_count as u64).min(chunk_base + aw);
        let nbits = (hi - lo) as usize;
        let shift = (lo - chunk_base) as usize;
        let bits = get_bits(image, cursor, nbits);

        let value = if nbits as u64 == aw {
            bits
        } else {
            match unit.flags.update_rule() {
                UpdateRule::Preserve => {
                    let prior = region
                        .read(ctx, chunk_base / 8, (aw / 8) as usize)
                        .map_err(MethodAbort::Error)?;
                    (prior & !(mask(nbits) << shift)) | (bits << shift)
                }
                UpdateRule::WriteAsOnes => {
                    (mask(aw as usize) & !(mask(nbits) << shift)) | (bits << shift)
                }
                UpdateRule::WriteAsZeros => bits << shift,
            }
        };
        region
            .write(ctx, chunk_base / 8, (aw / 8) as usize, value)
            .map_err(MethodAbort::Error)?;
        cursor += nbits;
    }
    Ok(())
}

fn bits_to_object(bytes: Vec<u8>, bit_count: u32, width: IntegerWidth) -> Object {
    if bit_count as usize <= width.bytes() * 8 {
        let mut value = 0u64;
        for (i, byte) in bytes.iter().take(8).enumerate() {
            value |= (*byte as u64) << (8 * i);
        }
        Object::Integer(value & width.mask())
    } else {
        Object::Buffer(bytes)
    }
}

const fn mask(bits: usize) -> u64 {
    if bits >= 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn get_bits(image: &[u8], start: usize, count: usize) -> u64 {
    let mut out = 0u64;
    for i in 0..count {
        let bit = start + i;
        let byte = image.get(bit / 8).copied().unwrap_or(0);
        out |= (((byte >> (bit % 8)) & 1) as u64) << i;
    }
    out
}

fn put_bits(image: &mut [u8], start: usize, count: usize, bits: u64) {
    for i in 0..count {
        let bit = start + i;
        if let Some(byte) = image.get_mut(bit / 8) {
            let flag = 1u8 << (bit % 8);
            if (bits >> i) & 1 == 1 {
                *byte |= flag;
            } else {
                *byte &= !flag;
            }
        }
    }
}

/* BUILTIN HANDLERS */

/// `SystemMemory` through the host's physical accessors.
pub struct SystemMemoryHandler;

impl RegionHandler for SystemMemoryHandler {
    fn read(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
    ) -> Result<u64, AmlError> {
        access.ctx.host().mem_read(offset, width)
    }

    fn write(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        access.ctx.host().mem_write(offset, width, value)
    }
}

/// `SystemIO` through the host's port accessors.
pub struct SystemIoHandler;

impl RegionHandler for SystemIoHandler {
    fn read(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
    ) -> Result<u64, AmlError> {
        access.ctx.host().io_read(offset, width)
    }

    fn write(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        access.ctx.host().io_write(offset, width, value)
    }
}

/// `PCI_Config` resolved against the enclosing device's address.
pub struct PciConfigHandler;

impl RegionHandler for PciConfigHandler {
    fn read(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
    ) -> Result<u64, AmlError> {
        let address = access.region.pci_address().unwrap_or_default();
        access.ctx.host().pci_read(address, offset as u16, width)
    }

    fn write(
        &self,
        access: &RegionAccess<'_>,
        offset: u64,
        width: usize,
        value: u64,
    ) -> Result<(), AmlError> {
        let address = access.region.pci_address().unwrap_or_default();
        access
            .ctx
            .host()
            .pci_write(address, offset as u16, width, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_round_trip() {
        for byte in [0x00u8, 0x01, 0x02, 0x07, 0x0b, 0x7f, 0x80, 0xff] {
            assert_eq!(AddressSpace::from_byte(byte).as_byte(), byte);
        }
    }

    #[test]
    fn field_flags_decode() {
        // WordAcc, Lock, WriteAsOnes.
        let flags = FieldFlags::new(0x02 | 0x10 | 0x20);
        assert_eq!(flags.access_type(), AccessType::Word);
        assert!(flags.needs_lock());
        assert_eq!(flags.update_rule(), UpdateRule::WriteAsOnes);
        assert_eq!(flags.access_bits(), 16);
    }

    #[test]
    fn bit_helpers_round_trip() {
        let mut image = vec![0u8; 4];
        put_bits(&mut image, 3, 11, 0x5a5);
        assert_eq!(get_bits(&image, 3, 11), 0x5a5);
        assert_eq!(get_bits(&image, 0, 3), 0);
    }

    #[test]
    fn narrow_fields_read_as_integers() {
        let obj = bits_to_object(vec![0x34, 0x12], 16, IntegerWidth::Full);
        assert!(matches!(obj, Object::Integer(0x1234)));
    }

    #[test]
    fn wide_fields_read_as_buffers() {
        let obj = bits_to_object(vec![0xff; 9], 72, IntegerWidth::Full);
        assert!(matches!(obj, Object::Buffer(ref b) if b.len() == 9));
    }
}
