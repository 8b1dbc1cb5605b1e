//! Opcode execution
//!
//! Each completed in-flight opcode lands here with its operands. Expression
//! results are delivered to the enclosing in-flight opcode (or discarded at
//! statement level); control opcodes manipulate the block stack and frame
//! chain instead.

use crate::error::{AbortResult, AmlError, MethodAbort};
use crate::event::EventSubsystem;
use crate::interpreter::{
    Block, HeldMutex, InFlight, Interpreter, Operand, Pending, SuperTarget,
};
use crate::name::AmlName;
use crate::namespace::NodeRef;
use crate::object::{
    integer_to_decimal_string, integer_to_hex_string, parse_string_integer, to_buffer,
    to_integer, to_string_value, BufferField, IntegerWidth, Method, MethodBody, Object,
    ObjectRef, ObjectType, Reference,
};
use crate::opcode::Opcode;
use crate::opregion::{field_read, AddressSpace, OpRegion};
use crate::sync::timeout_from_ms;

use std::sync::Arc;

use itertools::Itertools;
use tracing::{trace, warn};

/// Sanity bound on runtime-sized buffer allocations.
const MAX_BUFFER_BYTES: u64 = 1 << 26;

/// Sanity bound on a table image pulled out of a region or buffer.
const MAX_TABLE_BYTES: u64 = 1 << 24;

impl Interpreter {
    pub(crate) fn execute(&mut self, inflight: InFlight) -> AbortResult<()> {
        let InFlight { kind, operands } = inflight;
        match kind {
            Pending::Op(op) => self.exec_op(op, operands),
            Pending::Call { node, method } => self.exec_call(node, method, operands),
            Pending::Package { count, .. } => self.exec_package(count, operands),
            Pending::VarPackage { .. } => self.exec_var_package(operands),
            Pending::Buffer { end } => self.exec_buffer(end, operands),
            Pending::NameDecl { name } => {
                let value = operand_value(&operands, 0)?;
                self.install_cell(&name, value.deep_clone())?;
                Ok(())
            }
            Pending::OpRegionDecl { name, space } => {
                let offset = self.operand_integer(&operands, 0)?;
                let length = self.operand_integer(&operands, 1)?;
                let region = Arc::new(OpRegion::new(
                    AddressSpace::from_byte(space),
                    offset,
                    length,
                ));
                let node = self.install_node(&name, Object::OpRegion(region.clone()))?;
                region.bind_node(&node);
                Ok(())
            }
            Pending::BankFieldDecl { region, bank, end } => {
                let bank_value = self.operand_integer(&operands, 0)?;
                self.decode_bank_field_list(&region, &bank, bank_value, end)
            }
            Pending::DataRegionDecl { name } => {
                let signature = self.operand_string(&operands, 0)?;
                let oem_id = self.operand_string(&operands, 1)?;
                let oem_table_id = self.operand_string(&operands, 2)?;
                self.exec_data_region(&name, &signature, &oem_id, &oem_table_id)
            }
            Pending::If { end } => {
                let cond = self.operand_integer(&operands, 0)? != 0;
                if cond {
                    self.top_mut()?.blocks.push(Block::If { end });
                } else {
                    self.top_mut()?.pc = end;
                    self.enter_trailing_else()?;
                }
                Ok(())
            }
            Pending::While { end } => {
                let cond = self.operand_integer(&operands, 0)? != 0;
                if !cond {
                    let frame = self.top_mut()?;
                    match frame.blocks.pop() {
                        Some(Block::While { .. }) => {
                            frame.pc = end;
                            Ok(())
                        }
                        _ => Err(MethodAbort::Error(AmlError::BadBytecode(
                            "While predicate outside its block",
                        ))),
                    }
                } else {
                    Ok(())
                }
            }
        }
    }

    /* CONSTRUCTION */

    fn exec_package(&mut self, count: usize, operands: Vec<Operand>) -> AbortResult<()> {
        let mut elements: Vec<ObjectRef> = operands
            .into_iter()
            .map(|operand| match operand {
                Operand::Value(cell) => cell,
                _ => ObjectRef::new(Object::Uninitialized),
            })
            .collect();
        if elements.len() > count {
            warn!(
                target: "aml_vm::interpreter",
                declared = count,
                encoded = elements.len(),
                "package has more elements than declared"
            );
        }
        while elements.len() < count {
            elements.push(ObjectRef::new(Object::Uninitialized));
        }
        self.deliver_value(ObjectRef::new(Object::Package(elements)))
    }

    fn exec_var_package(&mut self, mut operands: Vec<Operand>) -> AbortResult<()> {
        if operands.is_empty() {
            return Err(MethodAbort::Error(AmlError::BadBytecode(
                "VarPackage without a count",
            )));
        }
        let rest = operands.split_off(1);
        let count = self.operand_integer(&operands, 0)? as usize;
        self.exec_package(count, rest)
    }

    fn exec_buffer(&mut self, end: usize, operands: Vec<Operand>) -> AbortResult<()> {
        let size = self.operand_integer(&operands, 0)?;
        if size > MAX_BUFFER_BYTES {
            return Err(MethodAbort::Error(AmlError::BadOperand(
                "buffer size out of bounds",
            )));
        }
        let frame = self.top_mut()?;
        let start = frame.pc.min(end);
        let mut bytes = frame.data[start..end.min(frame.data.len())].to_vec();
        frame.pc = end;
        if (size as usize) > bytes.len() {
            bytes.resize(size as usize, 0);
        }
        self.deliver_value(ObjectRef::new(Object::Buffer(bytes)))
    }

    /* CALLS */

    fn exec_call(
        &mut self,
        node: NodeRef,
        method: Arc<Method>,
        operands: Vec<Operand>,
    ) -> AbortResult<()> {
        let args: Vec<ObjectRef> = operands
            .iter()
            .map(|operand| operand_value_ref(operand).cloned())
            .collect::<Result<_, _>>()?;
        match &method.body {
            MethodBody::Native(native) => {
                let result = self
                    .run_native(*native, &args)
                    .map_err(MethodAbort::Error)?;
                self.deliver_value(result)
            }
            MethodBody::Aml(_) => self.push_method_frame(node, method, args),
        }
    }

    /* EXPRESSIONS AND STATEMENTS */

    fn exec_op(&mut self, op: Opcode, operands: Vec<Operand>) -> AbortResult<()> {
        use Opcode::*;
        let width = self.top_mut()?.width;
        match op {
            Add | Subtract | Multiply | ShiftLeft | ShiftRight | And | Nand | Or | Nor
            | Xor | Mod => {
                let a = self.operand_integer(&operands, 0)?;
                let b = self.operand_integer(&operands, 1)?;
                let value = arith(op, a, b, width)?;
                let result = ObjectRef::new(Object::Integer(value));
                self.store_optional(&operands, 2, &result)?;
                self.deliver_value(result)
            }
            Divide => {
                let dividend = self.operand_integer(&operands, 0)?;
                let divisor = self.operand_integer(&operands, 1)?;
                if divisor == 0 {
                    return Err(MethodAbort::Error(AmlError::BadOperand("division by zero")));
                }
                let remainder = ObjectRef::new(Object::Integer(dividend % divisor));
                let quotient =
                    ObjectRef::new(Object::Integer((dividend / divisor) & width.mask()));
                self.store_optional(&operands, 2, &remainder)?;
                self.store_optional(&operands, 3, &quotient)?;
                self.deliver_value(quotient)
            }
            Not => {
                let a = self.operand_integer(&operands, 0)?;
                let result = ObjectRef::new(Object::Integer(!a & width.mask()));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            FindSetLeftBit => {
                let a = self.operand_integer(&operands, 0)?;
                let value = if a == 0 { 0 } else { 64 - a.leading_zeros() as u64 };
                let result = ObjectRef::new(Object::Integer(value));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            FindSetRightBit => {
                let a = self.operand_integer(&operands, 0)?;
                let value = if a == 0 {
                    0
                } else {
                    a.trailing_zeros() as u64 + 1
                };
                let result = ObjectRef::new(Object::Integer(value));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            LAnd | LOr => {
                let a = self.operand_integer(&operands, 0)?;
                let b = self.operand_integer(&operands, 1)?;
                let truth = match op {
                    LAnd => a != 0 && b != 0,
                    _ => a != 0 || b != 0,
                };
                self.deliver_truth(truth, width)
            }
            LNot => {
                let a = self.operand_integer(&operands, 0)?;
                self.deliver_truth(a == 0, width)
            }
            LEqual | LGreater | LLess => {
                let ordering = self.compare_operands(&operands, width)?;
                let truth = match op {
                    LEqual => ordering == core::cmp::Ordering::Equal,
                    LGreater => ordering == core::cmp::Ordering::Greater,
                    _ => ordering == core::cmp::Ordering::Less,
                };
                self.deliver_truth(truth, width)
            }
            Store => {
                let value = operand_value(&operands, 0)?;
                let target = self.operand_target(&operands, 1)?;
                self.store_to_target(&value, &target)?;
                self.deliver_value(value)
            }
            CopyObject => {
                let value = operand_value(&operands, 0)?;
                let target = self.operand_target(&operands, 1)?;
                let clone = value.deep_clone();
                self.copy_to_target(&clone, &target)?;
                self.deliver_value(clone)
            }
            RefOf => {
                let target = self.operand_target(&operands, 0)?;
                let reference = self.make_reference(&target)?;
                self.deliver_value(ObjectRef::new(Object::Reference(reference)))
            }
            CondRefOf => {
                if matches!(operands.first(), Some(Operand::Missing)) {
                    return self.deliver_truth(false, width);
                }
                let target = self.operand_target(&operands, 0)?;
                let reference = self.make_reference(&target)?;
                let cell = ObjectRef::new(Object::Reference(reference));
                self.store_optional(&operands, 1, &cell)?;
                self.deliver_truth(true, width)
            }
            DerefOf => {
                let cell = operand_value(&operands, 0)?;
                if !matches!(&*cell.read(), Object::Reference(_)) {
                    return Err(MethodAbort::Error(AmlError::BadOperand(
                        "DerefOf needs a reference",
                    )));
                }
                let target = cell.chase()?;
                self.deliver_value(target)
            }
            Index => {
                let source = operand_value(&operands, 0)?.chase()?;
                let index = self.operand_integer(&operands, 1)? as usize;
                let reference = {
                    let guard = source.read();
                    match &*guard {
                        Object::Package(elements) => {
                            if index >= elements.len() {
                                return Err(MethodAbort::Error(AmlError::BadOperand(
                                    "package index out of range",
                                )));
                            }
                            Reference::PackageIndex {
                                package: source.clone(),
                                index,
                            }
                        }
                        Object::Buffer(bytes) | Object::String(bytes) => {
                            if index >= bytes.len() {
                                return Err(MethodAbort::Error(AmlError::BadOperand(
                                    "buffer index out of range",
                                )));
                            }
                            Reference::ByteIndex {
                                data: source.clone(),
                                index,
                            }
                        }
                        other => {
                            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                                expected: crate::object::ObjectType::Package,
                                found: other.type_of(),
                            }))
                        }
                    }
                };
                let cell = ObjectRef::new(Object::Reference(reference));
                self.store_optional(&operands, 2, &cell)?;
                self.deliver_value(cell)
            }
            SizeOf => {
                let target = self.operand_target(&operands, 0)?;
                let object = self.super_object(&target)?.chase()?;
                let size = {
                    let guard = object.read();
                    match &*guard {
                        Object::String(bytes) | Object::Buffer(bytes) => bytes.len() as u64,
                        Object::Package(elements) => elements.len() as u64,
                        other => {
                            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                                expected: crate::object::ObjectType::Buffer,
                                found: other.type_of(),
                            }))
                        }
                    }
                };
                self.deliver_value(ObjectRef::new(Object::Integer(size)))
            }
            ObjectType => {
                let target = self.operand_target(&operands, 0)?;
                let tag = match &target {
                    SuperTarget::Debug => crate::object::ObjectType::Debug as u8,
                    _ => {
                        let object = self.super_object(&target)?.chase()?;
                        let tag = object.type_of();
                        tag as u8
                    }
                };
                self.deliver_value(ObjectRef::new(Object::Integer(tag as u64)))
            }
            Increment | Decrement => {
                let target = self.operand_target(&operands, 0)?;
                let delta: i64 = if op == Increment { 1 } else { -1 };
                let value = self.increment_place(&target, delta, width)?;
                self.deliver_value(ObjectRef::new(Object::Integer(value)))
            }
            Concat => {
                let result = self.exec_concat(&operands, width)?;
                self.store_optional(&operands, 2, &result)?;
                self.deliver_value(result)
            }
            ConcatRes => {
                let a = self.operand_buffer(&operands, 0)?;
                let b = self.operand_buffer(&operands, 1)?;
                let mut bytes = strip_end_tag(a);
                bytes.extend_from_slice(&strip_end_tag(b));
                bytes.extend_from_slice(&[0x79, 0x00]);
                let result = ObjectRef::new(Object::Buffer(bytes));
                self.store_optional(&operands, 2, &result)?;
                self.deliver_value(result)
            }
            ToInteger => {
                let source = operand_value(&operands, 0)?.chase()?;
                let value = {
                    let guard = source.read();
                    match &*guard {
                        Object::Integer(v) => *v & width.mask(),
                        Object::String(bytes) => {
                            parse_string_integer(bytes, true) & width.mask()
                        }
                        other => to_integer(other, width)?,
                    }
                };
                let result = ObjectRef::new(Object::Integer(value));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            ToBuffer => {
                let source = operand_value(&operands, 0)?.chase()?;
                let bytes = to_buffer(&source.read(), width)?;
                let result = ObjectRef::new(Object::Buffer(bytes));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            ToDecimalString => {
                let source = operand_value(&operands, 0)?.chase()?;
                let bytes = {
                    let guard = source.read();
                    match &*guard {
                        Object::Integer(v) => integer_to_decimal_string(*v),
                        Object::String(bytes) => bytes.clone(),
                        Object::Buffer(bytes) => {
                            bytes.iter().map(|b| b.to_string()).join(",").into_bytes()
                        }
                        other => {
                            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                                expected: crate::object::ObjectType::String,
                                found: other.type_of(),
                            }))
                        }
                    }
                };
                let result = ObjectRef::new(Object::String(bytes));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            ToHexString => {
                let source = operand_value(&operands, 0)?.chase()?;
                let bytes = {
                    let guard = source.read();
                    match &*guard {
                        Object::Integer(v) => integer_to_hex_string(*v, width),
                        Object::String(bytes) => bytes.clone(),
                        other @ Object::Buffer(_) => to_string_value(other, width)?,
                        other => {
                            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                                expected: crate::object::ObjectType::String,
                                found: other.type_of(),
                            }))
                        }
                    }
                };
                let result = ObjectRef::new(Object::String(bytes));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            ToString => {
                let bytes = self.operand_buffer(&operands, 0)?;
                let limit = self.operand_integer(&operands, 1)?;
                let take = if limit == width.mask() {
                    bytes.len()
                } else {
                    (limit as usize).min(bytes.len())
                };
                let text: Vec<u8> = bytes
                    .into_iter()
                    .take(take)
                    .take_while(|b| *b != 0)
                    .collect();
                let result = ObjectRef::new(Object::String(text));
                self.store_optional(&operands, 2, &result)?;
                self.deliver_value(result)
            }
            FromBcd => {
                let bcd = self.operand_integer(&operands, 0)?;
                let mut value: u64 = 0;
                let mut scale: u64 = 1;
                for shift in (0..16).map(|i| i * 4) {
                    let digit = (bcd >> shift) & 0xf;
                    if digit > 9 {
                        return Err(MethodAbort::Error(AmlError::BadOperand(
                            "invalid BCD digit",
                        )));
                    }
                    value += digit * scale;
                    scale = scale.saturating_mul(10);
                }
                let result = ObjectRef::new(Object::Integer(value & width.mask()));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            ToBcd => {
                let mut value = self.operand_integer(&operands, 0)?;
                let mut bcd: u64 = 0;
                for shift in (0..16).map(|i| i * 4) {
                    bcd |= (value % 10) << shift;
                    value /= 10;
                }
                if value != 0 {
                    return Err(MethodAbort::Error(AmlError::BadOperand(
                        "integer too wide for BCD",
                    )));
                }
                let result = ObjectRef::new(Object::Integer(bcd & width.mask()));
                self.store_optional(&operands, 1, &result)?;
                self.deliver_value(result)
            }
            Mid => {
                let source = operand_value(&operands, 0)?.chase()?;
                let index = self.operand_integer(&operands, 1)? as usize;
                let length = self.operand_integer(&operands, 2)? as usize;
                let result = {
                    let guard = source.read();
                    match &*guard {
                        Object::String(bytes) => Object::String(slice_mid(bytes, index, length)),
                        Object::Buffer(bytes) => Object::Buffer(slice_mid(bytes, index, length)),
                        other => {
                            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                                expected: crate::object::ObjectType::Buffer,
                                found: other.type_of(),
                            }))
                        }
                    }
                };
                let result = ObjectRef::new(result);
                self.store_optional(&operands, 3, &result)?;
                self.deliver_value(result)
            }
            Match => self.exec_match(&operands, width),
            Opcode::CreateBitField => self.exec_create_buffer_field(&operands, width, 1, false),
            Opcode::CreateByteField => self.exec_create_buffer_field(&operands, width, 8, false),
            Opcode::CreateWordField => self.exec_create_buffer_field(&operands, width, 16, false),
            Opcode::CreateDWordField => {
                self.exec_create_buffer_field(&operands, width, 32, false)
            }
            Opcode::CreateQWordField => {
                self.exec_create_buffer_field(&operands, width, 64, false)
            }
            Opcode::CreateField => self.exec_create_buffer_field(&operands, width, 0, true),
            Acquire => self.exec_acquire(&operands, width),
            Release => self.exec_release(&operands),
            Wait => {
                let event = self.super_event(&operands)?;
                let ms = self.operand_integer(&operands, 1)?;
                let timeout = timeout_from_ms(ms.min(u16::MAX as u64) as u16);
                let acquired = event.wait(timeout);
                self.deliver_truth(!acquired, width)
            }
            Signal => {
                let event = self.super_event(&operands)?;
                event.signal();
                Ok(())
            }
            Reset => {
                let event = self.super_event(&operands)?;
                event.reset();
                Ok(())
            }
            Notify => {
                let target = self.operand_target(&operands, 0)?;
                let value = self.operand_integer(&operands, 1)?;
                let node = match target {
                    SuperTarget::Node(node) => node,
                    _ => {
                        return Err(MethodAbort::Error(AmlError::BadOperand(
                            "Notify target must be a named node",
                        )))
                    }
                };
                trace!(
                    target: "aml_vm::interpreter",
                    node = %node.absolute_path(),
                    value,
                    "notify queued"
                );
                EventSubsystem::queue_notify(self.context(), node, value)
                    .map_err(MethodAbort::Error)
            }
            Sleep => {
                let ms = self.operand_integer(&operands, 0)?;
                self.context().host().sleep_ms(ms);
                Ok(())
            }
            Stall => {
                let us = self.operand_integer(&operands, 0)?;
                self.context().host().stall_us(us);
                Ok(())
            }
            Fatal => {
                let typ = self.operand_integer(&operands, 0)? as u8;
                let code = self.operand_integer(&operands, 1)? as u32;
                let arg = self.operand_integer(&operands, 2)?;
                self.context().host().handle_fatal(typ, code, arg);
                Err(MethodAbort::Error(AmlError::Fatal { typ, code, arg }))
            }
            Load => self.exec_load(&operands),
            LoadTable => self.exec_load_table(&operands),
            Unload => {
                let handle = self.operand_integer(&operands, 0)? as u32;
                warn!(target: "aml_vm::interpreter", handle, "Unload is deprecated");
                self.context()
                    .tables()
                    .remove(handle)
                    .map_err(MethodAbort::Error)?;
                self.context().namespace().remove_owner(handle);
                Ok(())
            }
            Return => {
                let value = operand_value(&operands, 0)?;
                self.pop_frame(Some(value))
            }
            Break => self.exec_break(),
            Continue => self.exec_continue(),
            Noop | BreakPoint => Ok(()),
            _ => Err(MethodAbort::Error(AmlError::BadBytecode(
                "opcode cannot execute here",
            ))),
        }
    }

    /* OPERAND ACCESS */

    pub(crate) fn operand_integer(&mut self, operands: &[Operand], i: usize) -> AbortResult<u64> {
        let width = self.top_mut()?.width;
        let cell = operand_value(operands, i)?.chase()?;
        let value = to_integer(&cell.read(), width)?;
        Ok(value)
    }

    fn operand_buffer(&mut self, operands: &[Operand], i: usize) -> AbortResult<Vec<u8>> {
        let width = self.top_mut()?.width;
        let cell = operand_value(operands, i)?.chase()?;
        let bytes = to_buffer(&cell.read(), width)?;
        Ok(bytes)
    }

    fn operand_string(&mut self, operands: &[Operand], i: usize) -> AbortResult<String> {
        let cell = operand_value(operands, i)?.chase()?;
        let guard = cell.read();
        match &*guard {
            Object::String(bytes) => Ok(String::from_utf8_lossy(bytes).into_owned()),
            other => Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::String,
                found: other.type_of(),
            })),
        }
    }

    pub(crate) fn operand_target(
        &mut self,
        operands: &[Operand],
        i: usize,
    ) -> AbortResult<SuperTarget> {
        match operands.get(i) {
            Some(Operand::Super(target)) => Ok(target.clone()),
            Some(Operand::Value(cell)) => {
                if matches!(&*cell.read(), Object::Reference(_)) {
                    Ok(SuperTarget::Ref(cell.clone()))
                } else {
                    Err(MethodAbort::Error(AmlError::BadOperand(
                        "expression target must be a reference",
                    )))
                }
            }
            Some(Operand::Missing) => Err(MethodAbort::Error(AmlError::BadOperand(
                "unresolved name",
            ))),
            _ => Err(MethodAbort::Error(AmlError::BadBytecode("missing operand"))),
        }
    }

    fn deliver_truth(&mut self, truth: bool, width: IntegerWidth) -> AbortResult<()> {
        let value = if truth { width.mask() } else { 0 };
        self.deliver_value(ObjectRef::new(Object::Integer(value)))
    }

    /// Store into an optional trailing target operand, skipping null.
    pub(crate) fn store_optional(
        &mut self,
        operands: &[Operand],
        i: usize,
        value: &ObjectRef,
    ) -> AbortResult<()> {
        match operands.get(i) {
            None | Some(Operand::Super(SuperTarget::Null)) => Ok(()),
            Some(_) => {
                let target = self.operand_target(operands, i)?;
                self.store_to_target(value, &target)
            }
        }
    }

    /* COMPARISONS */

    fn compare_operands(
        &mut self,
        operands: &[Operand],
        width: IntegerWidth,
    ) -> AbortResult<core::cmp::Ordering> {
        let a = operand_value(operands, 0)?.chase()?;
        let ordering = {
            let guard = a.read();
            match &*guard {
                Object::Integer(x) => {
                    let y = self.operand_integer(operands, 1)?;
                    x.cmp(&y)
                }
                Object::String(x) => {
                    let b = operand_value(operands, 1)?.chase()?;
                    let y = to_string_value(&b.read(), width)?;
                    x.as_slice().cmp(y.as_slice())
                }
                Object::Buffer(x) => {
                    let b = operand_value(operands, 1)?.chase()?;
                    let y = to_buffer(&b.read(), width)?;
                    x.as_slice().cmp(y.as_slice())
                }
                other => {
                    return Err(MethodAbort::Error(AmlError::TypeMismatch {
                        expected: ObjectType::Integer,
                        found: other.type_of(),
                    }))
                }
            }
        };
        Ok(ordering)
    }

    fn exec_concat(
        &mut self,
        operands: &[Operand],
        width: IntegerWidth,
    ) -> AbortResult<ObjectRef> {
        let a = operand_value(operands, 0)?.chase()?;
        let b = operand_value(operands, 1)?.chase()?;
        let guard = a.read();
        let result = match &*guard {
            Object::Integer(x) => {
                let y = to_integer(&b.read(), width)?;
                let mut bytes = x.to_le_bytes()[..width.bytes()].to_vec();
                bytes.extend_from_slice(&y.to_le_bytes()[..width.bytes()]);
                Object::Buffer(bytes)
            }
            Object::String(x) => {
                let mut bytes = x.clone();
                bytes.extend_from_slice(&to_string_value(&b.read(), width)?);
                Object::String(bytes)
            }
            Object::Buffer(x) => {
                let mut bytes = x.clone();
                bytes.extend_from_slice(&to_buffer(&b.read(), width)?);
                Object::Buffer(bytes)
            }
            other => {
                return Err(MethodAbort::Error(AmlError::TypeMismatch {
                    expected: ObjectType::Buffer,
                    found: other.type_of(),
                }))
            }
        };
        Ok(ObjectRef::new(result))
    }

    fn exec_match(&mut self, operands: &[Operand], width: IntegerWidth) -> AbortResult<()> {
        let package = operand_value(operands, 0)?.chase()?;
        let op1 = self.operand_integer(operands, 1)?;
        let v1 = self.operand_integer(operands, 2)?;
        let op2 = self.operand_integer(operands, 3)?;
        let v2 = self.operand_integer(operands, 4)?;
        let start = self.operand_integer(operands, 5)? as usize;

        let elements = {
            let guard = package.read();
            match &*guard {
                Object::Package(elements) => elements.clone(),
                other => {
                    return Err(MethodAbort::Error(AmlError::TypeMismatch {
                        expected: ObjectType::Package,
                        found: other.type_of(),
                    }))
                }
            }
        };
        for (index, element) in elements.iter().enumerate().skip(start) {
            let Ok(cell) = element.chase() else { continue };
            let value = match to_integer(&cell.read(), width) {
                Ok(value) => value,
                Err(_) => continue,
            };
            if match_compare(value, op1, v1) && match_compare(value, op2, v2) {
                return self.deliver_value(ObjectRef::new(Object::Integer(index as u64)));
            }
        }
        self.deliver_value(ObjectRef::new(Object::Integer(width.mask())))
    }

    /* BUFFER FIELDS */

    fn exec_create_buffer_field(
        &mut self,
        operands: &[Operand],
        _width: IntegerWidth,
        bits: u32,
        sized: bool,
    ) -> AbortResult<()> {
        let source = operand_value(operands, 0)?.chase()?;
        if !matches!(&*source.read(), Object::Buffer(_)) {
            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Buffer,
                found: source.type_of(),
            }));
        }
        let index = self.operand_integer(operands, 1)?;
        let (bit_offset, bit_count, name_at) = if sized {
            let count = self.operand_integer(operands, 2)? as u32;
            (index, count, 3)
        } else if bits == 1 {
            (index, 1, 2)
        } else {
            (index * 8, bits, 2)
        };
        let name = match operands.get(name_at) {
            Some(Operand::Name(name)) => name.clone(),
            _ => return Err(MethodAbort::Error(AmlError::BadBytecode("field name"))),
        };
        let buffer_len_bits = match &*source.read() {
            Object::Buffer(bytes) => bytes.len() as u64 * 8,
            _ => 0,
        };
        if bit_count == 0 || bit_offset + bit_count as u64 > buffer_len_bits {
            return Err(MethodAbort::Error(AmlError::BadOperand(
                "buffer field out of range",
            )));
        }
        self.install_node(
            &name,
            Object::BufferField(BufferField {
                source,
                bit_offset,
                bit_count,
            }),
        )?;
        Ok(())
    }

    /* SYNCHRONIZATION */

    fn super_mutex(&mut self, operands: &[Operand]) -> AbortResult<Arc<crate::sync::AmlMutex>> {
        let target = self.operand_target(operands, 0)?;
        let object = self.super_object(&target)?.chase()?;
        let guard = object.read();
        match &*guard {
            Object::Mutex(mutex) => Ok(mutex.clone()),
            other => Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Mutex,
                found: other.type_of(),
            })),
        }
    }

    fn super_event(&mut self, operands: &[Operand]) -> AbortResult<Arc<crate::sync::AmlEvent>> {
        let target = self.operand_target(operands, 0)?;
        let object = self.super_object(&target)?.chase()?;
        let guard = object.read();
        match &*guard {
            Object::Event(event) => Ok(event.clone()),
            other => Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Event,
                found: other.type_of(),
            })),
        }
    }

    fn exec_acquire(&mut self, operands: &[Operand], width: IntegerWidth) -> AbortResult<()> {
        let mutex = self.super_mutex(operands)?;
        let ms = self.operand_integer(operands, 1)? as u16;
        let timeout = timeout_from_ms(ms);
        let level = mutex.sync_level();
        if let Some(held) = self.current_sync_level() {
            if level < held {
                return Err(MethodAbort::SyncLevel {
                    acquired: level,
                    held,
                });
            }
        }
        let ctx = self.context().clone();
        let thread = ctx.host().thread_id();
        let is_global = ctx.is_global_lock_mutex(&mutex);
        let acquired = if is_global {
            let host = ctx.host();
            ctx.global_lock().acquire(&*host, thread, timeout)
        } else {
            mutex.guard().acquire(thread, timeout)
        };
        if acquired {
            let held = if is_global {
                HeldMutex::Global
            } else {
                HeldMutex::Aml(mutex)
            };
            self.top_mut()?.held.push(held);
        }
        // Acquire evaluates to true exactly when it timed out.
        self.deliver_truth(!acquired, width)
    }

    fn exec_release(&mut self, operands: &[Operand]) -> AbortResult<()> {
        let mutex = self.super_mutex(operands)?;
        let ctx = self.context().clone();
        let thread = ctx.host().thread_id();
        if ctx.is_global_lock_mutex(&mutex) {
            let host = ctx.host();
            ctx.global_lock().release(&*host, thread)?;
            self.forget_held(|held| matches!(held, HeldMutex::Global));
        } else {
            mutex.guard().release(thread)?;
            self.forget_held(|held| match held {
                HeldMutex::Aml(held) => Arc::ptr_eq(held, &mutex),
                HeldMutex::Global => false,
            });
        }
        Ok(())
    }

    fn forget_held(&mut self, matches: impl Fn(&HeldMutex) -> bool) {
        for frame in self.frames.iter_mut().rev() {
            if let Some(at) = frame.held.iter().rposition(&matches) {
                frame.held.remove(at);
                return;
            }
        }
    }

    /* CONTROL */

    fn exec_break(&mut self) -> AbortResult<()> {
        let frame = self.top_mut()?;
        frame.ops.clear();
        while let Some(block) = frame.blocks.pop() {
            match block {
                Block::While { end, .. } => {
                    frame.pc = end;
                    return Ok(());
                }
                Block::Scope { prev_scope, .. } => frame.scope = prev_scope,
                Block::If { .. } | Block::Else { .. } => {}
            }
        }
        Err(MethodAbort::Error(AmlError::BadBytecode(
            "Break outside a loop",
        )))
    }

    fn exec_continue(&mut self) -> AbortResult<()> {
        let frame = self.top_mut()?;
        frame.ops.clear();
        loop {
            match frame.blocks.last() {
                Some(Block::While { end, .. }) => {
                    frame.pc = *end;
                    return Ok(());
                }
                Some(_) => {
                    if let Some(Block::Scope { prev_scope, .. }) = frame.blocks.pop() {
                        frame.scope = prev_scope;
                    }
                }
                None => {
                    return Err(MethodAbort::Error(AmlError::BadBytecode(
                        "Continue outside a loop",
                    )))
                }
            }
        }
    }

    /* TABLE OPERATIONS */

    fn exec_load(&mut self, operands: &[Operand]) -> AbortResult<()> {
        let source_name = self.operand_target(operands, 0)?;
        let source = self.super_object(&source_name)?.chase()?;
        let image = self.table_image_from(&source)?;
        let handle_target = match operands.get(1) {
            Some(Operand::Super(SuperTarget::Null)) | None => None,
            Some(_) => Some(self.operand_target(operands, 1)?),
        };
        let ctx = self.context().clone();
        let table = ctx
            .tables()
            .install(&image, ctx.allocate_owner())
            .map_err(MethodAbort::Error)?;
        if table.is_loaded() {
            // Re-load of an identical image: hand back the handle.
            let handle = ObjectRef::new(Object::Integer(table.id as u64));
            if let Some(target) = handle_target {
                self.store_to_target(&handle, &target)?;
            }
            return self.deliver_value(handle);
        }
        self.push_table_frame(table, None, handle_target, None)
    }

    fn exec_load_table(&mut self, operands: &[Operand]) -> AbortResult<()> {
        let signature = self.operand_string(operands, 0)?;
        let oem_id = self.operand_string(operands, 1)?;
        let oem_table_id = self.operand_string(operands, 2)?;
        let root_path = self.operand_string(operands, 3)?;
        let param_path = self.operand_string(operands, 4)?;
        let param_value = operand_value(operands, 5)?;

        let ctx = self.context().clone();
        let table = ctx.tables().find(
            &signature,
            (!oem_id.is_empty()).then_some(oem_id.as_str()),
            (!oem_table_id.is_empty()).then_some(oem_table_id.as_str()),
            0,
        );
        let Some(table) = table else {
            return self.deliver_value(ObjectRef::new(Object::Integer(0)));
        };
        if table.is_loaded() {
            return self.deliver_value(ObjectRef::new(Object::Integer(table.id as u64)));
        }
        let scope = if root_path.is_empty() {
            None
        } else {
            let name: AmlName = root_path.parse().map_err(MethodAbort::Error)?;
            let root = ctx.namespace().root().clone();
            Some(
                ctx.namespace()
                    .find(&root, &name)
                    .map_err(MethodAbort::Error)?,
            )
        };
        let param = if param_path.is_empty() {
            None
        } else {
            let name: AmlName = param_path.parse().map_err(MethodAbort::Error)?;
            Some((name, param_value))
        };
        self.push_table_frame(table, scope, None, param)
    }

    fn table_image_from(&mut self, source: &ObjectRef) -> AbortResult<Vec<u8>> {
        let ctx = self.context().clone();
        let guard = source.read();
        match &*guard {
            Object::Buffer(bytes) => Ok(bytes.clone()),
            Object::OpRegion(region) => {
                if region.length > MAX_TABLE_BYTES {
                    return Err(MethodAbort::Error(AmlError::BadOperand(
                        "table region too large",
                    )));
                }
                let mut image = Vec::with_capacity(region.length as usize);
                for offset in 0..region.length {
                    let byte = region.read(&ctx, offset, 1).map_err(MethodAbort::Error)?;
                    image.push(byte as u8);
                }
                Ok(image)
            }
            Object::FieldUnit(unit) => {
                let unit = unit.clone();
                drop(guard);
                let value = field_read(&ctx, &unit, IntegerWidth::Full)?;
                match value {
                    Object::Buffer(bytes) => Ok(bytes),
                    Object::Integer(v) => Ok(v.to_le_bytes().to_vec()),
                    _ => Err(MethodAbort::Error(AmlError::BadOperand(
                        "field does not hold a table",
                    ))),
                }
            }
            other => Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Buffer,
                found: other.type_of(),
            })),
        }
    }

    fn exec_data_region(
        &mut self,
        name: &AmlName,
        signature: &str,
        oem_id: &str,
        oem_table_id: &str,
    ) -> AbortResult<()> {
        let ctx = self.context().clone();
        let table = ctx
            .tables()
            .find(
                signature,
                (!oem_id.is_empty()).then_some(oem_id),
                (!oem_table_id.is_empty()).then_some(oem_table_id),
                0,
            )
            .ok_or_else(|| MethodAbort::Error(AmlError::NotFound(signature.to_string())))?;
        let region = Arc::new(OpRegion::backed_by(table.data.clone()));
        let node = self.install_node(name, Object::OpRegion(region.clone()))?;
        region.bind_node(&node);
        Ok(())
    }
}

/* PURE HELPERS */

pub(crate) fn operand_value(operands: &[Operand], i: usize) -> AbortResult<ObjectRef> {
    operand_value_ref(operands.get(i).ok_or(MethodAbort::Error(
        AmlError::BadBytecode("missing operand"),
    ))?)
    .cloned()
}

fn operand_value_ref(operand: &Operand) -> AbortResult<&ObjectRef> {
    match operand {
        Operand::Value(cell) => Ok(cell),
        _ => Err(MethodAbort::Error(AmlError::BadOperand(
            "expected a value operand",
        ))),
    }
}

fn arith(op: Opcode, a: u64, b: u64, width: IntegerWidth) -> AbortResult<u64> {
    let mask = width.mask();
    let value = match op {
        Opcode::Add => a.wrapping_add(b),
        Opcode::Subtract => a.wrapping_sub(b),
        Opcode::Multiply => a.wrapping_mul(b),
        Opcode::ShiftLeft => {
            if b >= 64 {
                0
            } else {
                a.wrapping_shl(b as u32)
            }
        }
        Opcode::ShiftRight => {
            if b >= 64 {
                0
            } else {
                a.wrapping_shr(b as u32)
            }
        }
        Opcode::And => a & b,
        Opcode::Nand => !(a & b),
        Opcode::Or => a | b,
        Opcode::Nor => !(a | b),
        Opcode::Xor => a ^ b,
        Opcode::Mod => {
            if b == 0 {
                return Err(MethodAbort::Error(AmlError::BadOperand("modulus by zero")));
            }
            a % b
        }
        _ => {
            return Err(MethodAbort::Error(AmlError::BadBytecode(
                "not an arithmetic opcode",
            )))
        }
    };
    Ok(value & mask)
}

fn match_compare(value: u64, op: u64, against: u64) -> bool {
    match op {
        0 => true,
        1 => value == against,
        2 => value <= against,
        3 => value < against,
        4 => value >= against,
        5 => value > against,
        _ => false,
    }
}

fn slice_mid(bytes: &[u8], index: usize, length: usize) -> Vec<u8> {
    if index >= bytes.len() {
        return Vec::new();
    }
    let end = index.saturating_add(length).min(bytes.len());
    bytes[index..end].to_vec()
}

/// Drop a resource template's trailing end tag (small descriptor `0x79`
/// plus its checksum byte) if present.
fn strip_end_tag(mut bytes: Vec<u8>) -> Vec<u8> {
    if bytes.len() >= 2 && bytes[bytes.len() - 2] == 0x79 {
        bytes.truncate(bytes.len() - 2);
    }
    bytes
}
