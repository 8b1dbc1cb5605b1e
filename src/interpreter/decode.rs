//! Term and operand decoding
//!
//! One decode step consumes exactly one item at the cursor: a literal, a
//! name, a storable location, or an opcode. Opcodes that need operands are
//! pushed as in-flight continuations; declaration opcodes with bespoke
//! encodings are handled here directly.

use crate::error::{AbortResult, AmlError, MethodAbort};
use crate::interpreter::{Block, InFlight, Interpreter, Operand, Pending, SuperTarget};
use crate::name::{is_name_lead, AmlName, NameSeg};
use crate::namespace::{NodeFlags, NodeRef};
use crate::object::{CodeSlice, Method, Object, ObjectRef, Reference};
use crate::opcode::{ArgType, OpClass, Opcode, Stream};
use crate::opregion::{field_read, FieldFlags, FieldKind, FieldUnit, OpRegion};

use std::sync::Arc;
use std::time::Instant;

use tracing::{trace, warn};

/// Which storage a field list binds its units to.
#[derive(Clone)]
enum FieldBacking {
    Region(Arc<OpRegion>),
    Index { index: ObjectRef, data: ObjectRef },
    Bank {
        region: Arc<OpRegion>,
        bank: ObjectRef,
        bank_value: u64,
    },
}

impl FieldBacking {
    fn kind(&self) -> FieldKind {
        match self {
            Self::Region(region) => FieldKind::Region(region.clone()),
            Self::Index { index, data } => FieldKind::Index {
                index: index.clone(),
                data: data.clone(),
            },
            Self::Bank {
                region,
                bank,
                bank_value,
            } => FieldKind::Bank {
                region: region.clone(),
                bank: bank.clone(),
                bank_value: *bank_value,
            },
        }
    }
}

impl Interpreter {
    /// Decode one item at the cursor, steered by what the innermost
    /// in-flight opcode expects.
    pub(crate) fn decode_next(&mut self) -> AbortResult<()> {
        match self.top_mut()?.expected_arg() {
            Some(ArgType::ByteData) => {
                let value = self.with_stream(|s| s.read_u8().map(u64::from))?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Some(ArgType::WordData) => {
                let value = self.with_stream(|s| s.read_u16().map(u64::from))?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Some(ArgType::DWordData) => {
                let value = self.with_stream(|s| s.read_u32().map(u64::from))?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Some(ArgType::NameString) => {
                let name = self.read_name()?;
                self.top_mut()?.deliver(Operand::Name(name));
                Ok(())
            }
            Some(ArgType::Target) | Some(ArgType::SuperName) => self.decode_super(),
            Some(ArgType::TermArg) | None => self.decode_term(),
        }
    }

    pub(crate) fn with_stream<T>(
        &mut self,
        read: impl FnOnce(&mut Stream<'_>) -> Result<T, AmlError>,
    ) -> AbortResult<T> {
        let frame = self.top_mut()?;
        let (data, pc, end) = (frame.data.clone(), frame.pc, frame.end);
        let mut stream = Stream::new(&data, pc, end);
        let out = read(&mut stream).map_err(MethodAbort::Error)?;
        let pos = stream.pos();
        self.top_mut()?.pc = pos;
        Ok(out)
    }

    fn read_name(&mut self) -> AbortResult<AmlName> {
        self.with_stream(|s| AmlName::parse(s))
    }

    fn peek_byte(&mut self) -> AbortResult<u8> {
        let frame = self.top_mut()?;
        frame
            .data
            .get(frame.pc)
            .copied()
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("truncated stream")))
    }

    /* TERMS */

    fn decode_term(&mut self) -> AbortResult<()> {
        let lead = self.peek_byte()?;
        if is_name_lead(lead) {
            return self.decode_term_name();
        }
        match lead {
            0x60..=0x67 => {
                self.top_mut()?.pc += 1;
                let cell = self.local_cell((lead - 0x60) as usize)?;
                if matches!(*cell.read(), Object::Uninitialized) {
                    return Err(MethodAbort::Uninitialized("local"));
                }
                self.deliver_value(cell)
            }
            0x68..=0x6e => {
                self.top_mut()?.pc += 1;
                let cell = self.arg_cell((lead - 0x68) as usize)?;
                if matches!(*cell.read(), Object::Uninitialized) {
                    return Err(MethodAbort::Uninitialized("argument"));
                }
                self.deliver_value(cell)
            }
            _ => self.decode_opcode(),
        }
    }

    fn decode_opcode(&mut self) -> AbortResult<()> {
        let width = self.top_mut()?.width;
        let key = self.with_stream(|s| s.read_opcode_key())?;
        let op = Opcode::from_key(key)
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("unknown opcode")))?;
        match op {
            Opcode::Zero => self.deliver_value(ObjectRef::new(Object::Integer(0))),
            Opcode::One => self.deliver_value(ObjectRef::new(Object::Integer(1))),
            Opcode::Ones => {
                self.deliver_value(ObjectRef::new(Object::Integer(width.mask())))
            }
            Opcode::BytePrefix => {
                let value = self.with_stream(|s| s.read_u8().map(u64::from))?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Opcode::WordPrefix => {
                let value = self.with_stream(|s| s.read_u16().map(u64::from))?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Opcode::DWordPrefix => {
                let value = self.with_stream(|s| s.read_u32().map(u64::from))?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Opcode::QWordPrefix => {
                let value = self.with_stream(|s| s.read_u64())?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Opcode::StringPrefix => {
                let bytes = self.with_stream(|s| {
                    let mut bytes = Vec::new();
                    loop {
                        let b = s.read_u8()?;
                        if b == 0 {
                            break;
                        }
                        bytes.push(b);
                    }
                    Ok(bytes)
                })?;
                self.deliver_value(ObjectRef::new(Object::String(bytes)))
            }
            Opcode::Revision => self.deliver_value(ObjectRef::new(Object::Integer(
                crate::consts::INTERPRETER_REVISION,
            ))),
            Opcode::Timer => {
                let now = self.context().host().now_100ns();
                self.deliver_value(ObjectRef::new(Object::Integer(now)))
            }
            Opcode::Debug => self.deliver_value(ObjectRef::new(Object::Debug)),
            Opcode::Buffer => {
                let end = self.with_stream(|s| s.pkg_length())?;
                self.top_mut()?
                    .ops
                    .push(InFlight::new(Pending::Buffer { end }));
                Ok(())
            }
            Opcode::Package => {
                let (end, count) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let count = s.read_u8()? as usize;
                    Ok((end, count))
                })?;
                self.top_mut()?
                    .ops
                    .push(InFlight::new(Pending::Package { end, count }));
                Ok(())
            }
            Opcode::VarPackage => {
                let end = self.with_stream(|s| s.pkg_length())?;
                self.top_mut()?
                    .ops
                    .push(InFlight::new(Pending::VarPackage { end }));
                Ok(())
            }
            _ if op.op_info().class == OpClass::Structured => self.decode_structured(op),
            _ => {
                self.top_mut()?.ops.push(InFlight::new(Pending::Op(op)));
                Ok(())
            }
        }
    }

    fn decode_term_name(&mut self) -> AbortResult<()> {
        let name = self.read_name()?;
        let frame = self.top_mut()?;
        let in_package = frame.in_package();
        let width = frame.width;
        let scope = frame.scope.clone();
        let ctx = self.context().clone();

        match ctx.namespace().find(&scope, &name) {
            Ok(node) => {
                if in_package {
                    return self.deliver_value(ObjectRef::new(Object::Reference(
                        Reference::Node(node),
                    )));
                }
                let object = node.object();
                let action = {
                    let guard = object.read();
                    match &*guard {
                        Object::Method(method) => NameAction::Call(method.clone()),
                        Object::FieldUnit(unit) => NameAction::Field(unit.clone()),
                        Object::BufferField(field) => NameAction::BufferField(field.clone()),
                        _ => NameAction::Value,
                    }
                };
                match action {
                    NameAction::Call(method) => {
                        self.top_mut()?
                            .ops
                            .push(InFlight::new(Pending::Call { node, method }));
                        Ok(())
                    }
                    NameAction::Field(unit) => {
                        let value = field_read(&ctx, &unit, width)?;
                        self.deliver_value(ObjectRef::new(value))
                    }
                    NameAction::BufferField(field) => {
                        let value = super::store::buffer_field_read(&field, width)?;
                        self.deliver_value(ObjectRef::new(value))
                    }
                    NameAction::Value => self.deliver_value(object),
                }
            }
            Err(_) if in_package => {
                warn!(target: "aml_vm::interpreter", name = %name, "unresolved package element");
                self.deliver_value(ObjectRef::new(Object::Uninitialized))
            }
            Err(_) => Err(MethodAbort::Error(AmlError::UndefinedReference(
                name.to_string(),
            ))),
        }
    }

    /* SUPERNAMES */

    fn decode_super(&mut self) -> AbortResult<()> {
        let lead = self.peek_byte()?;
        if lead == 0x00 {
            self.top_mut()?.pc += 1;
            self.top_mut()?.deliver(Operand::Super(SuperTarget::Null));
            return Ok(());
        }
        if is_name_lead(lead) {
            let name = self.read_name()?;
            let scope = self.top_mut()?.scope.clone();
            return match self.context().namespace().find(&scope, &name) {
                Ok(node) => {
                    self.top_mut()?.deliver(Operand::Super(SuperTarget::Node(node)));
                    Ok(())
                }
                Err(_) if self.condrefof_probe() => {
                    self.top_mut()?.deliver(Operand::Missing);
                    Ok(())
                }
                Err(_) => Err(MethodAbort::Error(AmlError::UndefinedReference(
                    name.to_string(),
                ))),
            };
        }
        match lead {
            0x60..=0x67 => {
                self.top_mut()?.pc += 1;
                let slot = (lead - 0x60) as usize;
                self.top_mut()?.deliver(Operand::Super(SuperTarget::Local(slot)));
                Ok(())
            }
            0x68..=0x6e => {
                self.top_mut()?.pc += 1;
                let slot = (lead - 0x68) as usize;
                self.top_mut()?.deliver(Operand::Super(SuperTarget::Arg(slot)));
                Ok(())
            }
            _ => {
                let key = self.with_stream(|s| s.read_opcode_key())?;
                match Opcode::from_key(key) {
                    Some(Opcode::Debug) => {
                        self.top_mut()?.deliver(Operand::Super(SuperTarget::Debug));
                        Ok(())
                    }
                    Some(op @ (Opcode::RefOf | Opcode::DerefOf | Opcode::Index)) => {
                        // Reference-type expression in target position; its
                        // result value is converted by the consumer.
                        self.top_mut()?.ops.push(InFlight::new(Pending::Op(op)));
                        Ok(())
                    }
                    _ => Err(MethodAbort::Error(AmlError::BadBytecode(
                        "expected a storable location",
                    ))),
                }
            }
        }
    }

    fn condrefof_probe(&self) -> bool {
        self.frames
            .last()
            .and_then(|frame| frame.ops.last())
            .map(|op| matches!(op.kind, Pending::Op(Opcode::CondRefOf)) && op.operands.is_empty())
            .unwrap_or(false)
    }

    /// Consume an `Else` package directly after a taken `If` body.
    pub(crate) fn skip_trailing_else(&mut self) -> AbortResult<()> {
        let frame = self.top_mut()?;
        if frame.pc >= frame.current_end() {
            return Ok(());
        }
        if frame.data.get(frame.pc) == Some(&(Opcode::Else.key() as u8)) {
            let end = self.with_stream(|s| {
                s.read_u8()?;
                s.pkg_length()
            })?;
            self.top_mut()?.pc = end;
        }
        Ok(())
    }

    /// Enter an `Else` body when the `If` predicate was false.
    pub(crate) fn enter_trailing_else(&mut self) -> AbortResult<()> {
        let frame = self.top_mut()?;
        if frame.pc >= frame.current_end() {
            return Ok(());
        }
        if frame.data.get(frame.pc) == Some(&(Opcode::Else.key() as u8)) {
            let end = self.with_stream(|s| {
                s.read_u8()?;
                s.pkg_length()
            })?;
            self.top_mut()?.blocks.push(Block::Else { end });
        }
        Ok(())
    }

    /* DECLARATIONS */

    fn decode_structured(&mut self, op: Opcode) -> AbortResult<()> {
        match op {
            Opcode::Name => {
                let name = self.read_name()?;
                self.top_mut()?
                    .ops
                    .push(InFlight::new(Pending::NameDecl { name }));
                Ok(())
            }
            Opcode::Alias => {
                let source = self.read_name()?;
                let alias = self.read_name()?;
                let scope = self.top_mut()?.scope.clone();
                let node = self
                    .context()
                    .namespace()
                    .find(&scope, &source)
                    .map_err(|_| {
                        MethodAbort::Error(AmlError::UndefinedReference(source.to_string()))
                    })?;
                // The alias node shares the source's object cell.
                self.install_cell(&alias, node.object())?;
                Ok(())
            }
            Opcode::Scope => {
                let (end, name) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let name = AmlName::parse(s)?;
                    Ok((end, name))
                })?;
                let scope = self.top_mut()?.scope.clone();
                match self.context().namespace().find(&scope, &name) {
                    Ok(node) => self.enter_scope(node, end),
                    Err(_) => {
                        warn!(target: "aml_vm::interpreter", name = %name, "Scope target missing; skipping");
                        self.top_mut()?.pc = end;
                        Ok(())
                    }
                }
            }
            Opcode::Device => self.decode_scope_object(op, Object::Device),
            Opcode::ThermalZone => self.decode_scope_object(op, Object::ThermalZone),
            Opcode::Processor => {
                let (end, name, id, pblk_addr, pblk_len) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let name = AmlName::parse(s)?;
                    let id = s.read_u8()?;
                    let pblk_addr = s.read_u32()?;
                    let pblk_len = s.read_u8()?;
                    Ok((end, name, id, pblk_addr, pblk_len))
                })?;
                let node = self.install_node(
                    &name,
                    Object::Processor {
                        id,
                        pblk_addr,
                        pblk_len,
                    },
                )?;
                self.enter_scope(node, end)
            }
            Opcode::PowerResource => {
                let (end, name, system_level, resource_order) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let name = AmlName::parse(s)?;
                    let system_level = s.read_u8()?;
                    let resource_order = s.read_u16()?;
                    Ok((end, name, system_level, resource_order))
                })?;
                let node = self.install_node(
                    &name,
                    Object::PowerResource {
                        system_level,
                        resource_order,
                    },
                )?;
                self.enter_scope(node, end)
            }
            Opcode::Method => {
                let (end, name, flags, body_start) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let name = AmlName::parse(s)?;
                    let flags = s.read_u8()?;
                    Ok((end, name, flags, s.pos()))
                })?;
                let frame = self.top_mut()?;
                let code = CodeSlice::new(frame.data.clone(), body_start, end);
                let width = frame.width;
                let method = Method::from_flags(code, flags, width);
                self.install_node(&name, Object::Method(Arc::new(method)))?;
                self.top_mut()?.pc = end;
                Ok(())
            }
            Opcode::Mutex => {
                let (name, sync) = self.with_stream(|s| {
                    let name = AmlName::parse(s)?;
                    let sync = s.read_u8()?;
                    Ok((name, sync))
                })?;
                let mutex = crate::sync::AmlMutex::new(sync & crate::consts::MAX_SYNC_LEVEL);
                self.install_node(&name, Object::Mutex(Arc::new(mutex)))?;
                Ok(())
            }
            Opcode::Event => {
                let name = self.read_name()?;
                self.install_node(&name, Object::Event(Arc::new(crate::sync::AmlEvent::new())))?;
                Ok(())
            }
            Opcode::External => {
                // Declaration for disassemblers; nothing to install.
                self.with_stream(|s| {
                    AmlName::parse(s)?;
                    s.read_u8()?;
                    s.read_u8()?;
                    Ok(())
                })
            }
            Opcode::OpRegion => {
                let (name, space) = self.with_stream(|s| {
                    let name = AmlName::parse(s)?;
                    let space = s.read_u8()?;
                    Ok((name, space))
                })?;
                self.top_mut()?
                    .ops
                    .push(InFlight::new(Pending::OpRegionDecl { name, space }));
                Ok(())
            }
            Opcode::Field => {
                let (end, region, flags) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let region = AmlName::parse(s)?;
                    let flags = s.read_u8()?;
                    Ok((end, region, flags))
                })?;
                let region = self.resolve_region(&region)?;
                self.parse_field_list(end, FieldFlags::new(flags), FieldBacking::Region(region))
            }
            Opcode::IndexField => {
                let (end, index, data, flags) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let index = AmlName::parse(s)?;
                    let data = AmlName::parse(s)?;
                    let flags = s.read_u8()?;
                    Ok((end, index, data, flags))
                })?;
                let index = self.resolve_field_cell(&index)?;
                let data = self.resolve_field_cell(&data)?;
                self.parse_field_list(
                    end,
                    FieldFlags::new(flags),
                    FieldBacking::Index { index, data },
                )
            }
            Opcode::BankField => {
                let (end, region, bank) = self.with_stream(|s| {
                    let end = s.pkg_length()?;
                    let region = AmlName::parse(s)?;
                    let bank = AmlName::parse(s)?;
                    Ok((end, region, bank))
                })?;
                self.top_mut()?.ops.push(InFlight::new(Pending::BankFieldDecl {
                    region,
                    bank,
                    end,
                }));
                Ok(())
            }
            Opcode::DataRegion => {
                let name = self.read_name()?;
                self.top_mut()?
                    .ops
                    .push(InFlight::new(Pending::DataRegionDecl { name }));
                Ok(())
            }
            Opcode::If => {
                let end = self.with_stream(|s| s.pkg_length())?;
                self.top_mut()?.ops.push(InFlight::new(Pending::If { end }));
                Ok(())
            }
            Opcode::Else => {
                // An Else after a taken If is consumed by the block close;
                // reaching one here means the matching If was never taken.
                let end = self.with_stream(|s| {
                    s.pkg_length()
                })?;
                self.top_mut()?.pc = end;
                Ok(())
            }
            Opcode::While => {
                let end = self.with_stream(|s| s.pkg_length())?;
                let frame = self.top_mut()?;
                let start = frame.pc;
                frame.blocks.push(Block::While {
                    start,
                    end,
                    entered: Instant::now(),
                });
                frame.ops.push(InFlight::new(Pending::While { end }));
                Ok(())
            }
            _ => Err(MethodAbort::Error(AmlError::BadBytecode(
                "opcode is not a declaration",
            ))),
        }
    }

    fn decode_scope_object(&mut self, _op: Opcode, object: Object) -> AbortResult<()> {
        let (end, name) = self.with_stream(|s| {
            let end = s.pkg_length()?;
            let name = AmlName::parse(s)?;
            Ok((end, name))
        })?;
        let node = self.install_node(&name, object)?;
        self.enter_scope(node, end)
    }

    fn enter_scope(&mut self, node: NodeRef, end: usize) -> AbortResult<()> {
        let frame = self.top_mut()?;
        let prev_scope = std::mem::replace(&mut frame.scope, node);
        frame.blocks.push(Block::Scope { end, prev_scope });
        Ok(())
    }

    /* FIELD LISTS */

    pub(crate) fn decode_bank_field_list(
        &mut self,
        region: &AmlName,
        bank: &AmlName,
        bank_value: u64,
        end: usize,
    ) -> AbortResult<()> {
        let flags = self.with_stream(|s| s.read_u8())?;
        let region = self.resolve_region(region)?;
        let bank = self.resolve_field_cell(bank)?;
        self.parse_field_list(
            end,
            FieldFlags::new(flags),
            FieldBacking::Bank {
                region,
                bank,
                bank_value,
            },
        )
    }

    fn resolve_region(&mut self, name: &AmlName) -> AbortResult<Arc<OpRegion>> {
        let scope = self.top_mut()?.scope.clone();
        let node = self
            .context()
            .namespace()
            .find(&scope, name)
            .map_err(|_| MethodAbort::Error(AmlError::UndefinedReference(name.to_string())))?;
        let object = node.object();
        let region = match &*object.read() {
            Object::OpRegion(region) => region.clone(),
            other => {
                return Err(MethodAbort::Error(AmlError::TypeMismatch {
                    expected: crate::object::ObjectType::OperationRegion,
                    found: other.type_of(),
                }))
            }
        };
        Ok(region)
    }

    fn resolve_field_cell(&mut self, name: &AmlName) -> AbortResult<ObjectRef> {
        let scope = self.top_mut()?.scope.clone();
        let node = self
            .context()
            .namespace()
            .find(&scope, name)
            .map_err(|_| MethodAbort::Error(AmlError::UndefinedReference(name.to_string())))?;
        Ok(node.object())
    }

    fn parse_field_list(
        &mut self,
        end: usize,
        mut flags: FieldFlags,
        backing: FieldBacking,
    ) -> AbortResult<()> {
        let mut bit_offset: u64 = 0;
        let mut attrib: u8 = 0;
        while self.top_mut()?.pc < end {
            let lead = self.peek_byte()?;
            match lead {
                0x00 => {
                    let bits = self.with_stream(|s| {
                        s.read_u8()?;
                        s.pkg_length_raw()
                    })?;
                    bit_offset += bits as u64;
                }
                0x01 => {
                    let (access, new_attrib) = self.with_stream(|s| {
                        s.read_u8()?;
                        let access = s.read_u8()?;
                        let attrib = s.read_u8()?;
                        Ok((access, attrib))
                    })?;
                    flags = flags.with_access_type(access);
                    attrib = new_attrib;
                }
                0x02 => {
                    // GPIO/serial-bus connection descriptor; recorded
                    // handlers are out of the core's scope.
                    self.with_stream(|s| {
                        s.read_u8()?;
                        match s.peek_u8() {
                            Some(b) if is_name_lead(b) => {
                                AmlName::parse(s)?;
                            }
                            Some(0x11) => {
                                s.read_u8()?;
                                let buffer_end = s.pkg_length()?;
                                s.seek(buffer_end);
                            }
                            _ => return Err(AmlError::BadBytecode("connect field")),
                        }
                        Ok(())
                    })?;
                    trace!(target: "aml_vm::interpreter", "connection field skipped");
                }
                0x03 => {
                    let (access, new_attrib) = self.with_stream(|s| {
                        s.read_u8()?;
                        let access = s.read_u8()?;
                        let attrib = s.read_u8()?;
                        s.read_u8()?; // access length
                        Ok((access, attrib))
                    })?;
                    flags = flags.with_access_type(access);
                    attrib = new_attrib;
                }
                b if crate::name::is_lead_char(b) => {
                    let (seg, bits) = self.with_stream(|s| {
                        let seg = NameSeg::parse(s)?;
                        let bits = s.pkg_length_raw()?;
                        Ok((seg, bits))
                    })?;
                    let unit = FieldUnit {
                        kind: backing.kind(),
                        bit_offset,
                        bit_count: bits as u32,
                        flags,
                        attrib,
                    };
                    self.install_node(&AmlName::single(seg), Object::FieldUnit(unit))?;
                    bit_offset += bits as u64;
                }
                _ => {
                    return Err(MethodAbort::Error(AmlError::BadBytecode(
                        "malformed field list",
                    )))
                }
            }
        }
        Ok(())
    }

    /* NODE INSTALLATION */

    pub(crate) fn install_node(&mut self, name: &AmlName, object: Object) -> AbortResult<NodeRef> {
        self.install_cell(name, ObjectRef::new(object))
    }

    pub(crate) fn install_cell(
        &mut self,
        name: &AmlName,
        cell: ObjectRef,
    ) -> AbortResult<NodeRef> {
        let frame = self.top_mut()?;
        let scope = frame.scope.clone();
        let owner = frame.owner;
        let method_local = matches!(frame.kind, super::FrameKind::Method { .. });
        let flags = if method_local {
            NodeFlags::METHOD_LOCAL
        } else {
            NodeFlags::empty()
        };
        let node = self
            .context()
            .namespace()
            .install(&scope, name, cell, flags, owner)
            .map_err(MethodAbort::Error)?;
        if method_local {
            self.top_mut()?.created.push(node.clone());
        }
        Ok(node)
    }

    pub(crate) fn local_cell(&mut self, index: usize) -> AbortResult<ObjectRef> {
        let frame = self.top_mut()?;
        frame
            .locals
            .get(index)
            .cloned()
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("local index")))
    }

    pub(crate) fn arg_cell(&mut self, index: usize) -> AbortResult<ObjectRef> {
        let frame = self.top_mut()?;
        frame
            .args
            .get(index)
            .cloned()
            .ok_or(MethodAbort::Error(AmlError::BadBytecode("argument index")))
    }
}

enum NameAction {
    Call(Arc<Method>),
    Field(FieldUnit),
    BufferField(crate::object::BufferField),
    Value,
}
