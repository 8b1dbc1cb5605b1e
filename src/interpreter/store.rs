//! Store semantics: implicit conversion at targets and reference
//! write-through
//!
//! Stores to local and argument slots rebind the slot. Stores to named
//! data objects convert the source to the destination's current type and
//! never change a string's or buffer's length. Writing through a reference
//! reaches the referent; `Increment`/`Decrement` are the one implicit
//! write-through.

use crate::error::{AbortResult, AmlError, MethodAbort};
use crate::interpreter::{Interpreter, SuperTarget};
use crate::namespace::NodeRef;
use crate::object::{
    to_buffer, to_integer, BufferField, IntegerWidth, Object, ObjectRef, ObjectType, Reference,
};
use crate::opregion::{field_read, field_write, FieldUnit};

use tracing::info;

impl Interpreter {
    /// The object a SuperName designates, without dereferencing.
    pub(crate) fn super_object(&mut self, target: &SuperTarget) -> AbortResult<ObjectRef> {
        match target {
            SuperTarget::Local(index) => self.local_cell(*index),
            SuperTarget::Arg(index) => self.arg_cell(*index),
            SuperTarget::Node(node) => Ok(node.object()),
            SuperTarget::Ref(cell) => Ok(cell.clone()),
            SuperTarget::Debug => Ok(ObjectRef::new(Object::Debug)),
            SuperTarget::Null => Err(MethodAbort::Error(AmlError::BadOperand(
                "null name has no object",
            ))),
        }
    }

    /// Build the reference object `RefOf` produces for a SuperName.
    pub(crate) fn make_reference(&mut self, target: &SuperTarget) -> AbortResult<Reference> {
        match target {
            SuperTarget::Local(index) => Ok(Reference::Value(self.local_cell(*index)?)),
            SuperTarget::Arg(index) => Ok(Reference::Value(self.arg_cell(*index)?)),
            SuperTarget::Node(node) => Ok(Reference::Node(node.clone())),
            SuperTarget::Ref(cell) => Ok(Reference::Value(cell.clone())),
            SuperTarget::Debug | SuperTarget::Null => Err(MethodAbort::Error(
                AmlError::BadOperand("cannot take a reference here"),
            )),
        }
    }

    /// `Store` semantics into a decoded target.
    pub(crate) fn store_to_target(
        &mut self,
        value: &ObjectRef,
        target: &SuperTarget,
    ) -> AbortResult<()> {
        let width = self.top_mut()?.width;
        match target {
            SuperTarget::Null => Ok(()),
            SuperTarget::Debug => {
                debug_output(value);
                Ok(())
            }
            // Slots rebind: the previous object is released, the source is
            // attached by reference. Writing through an old RefOf to the
            // slot's former object still reaches that object.
            SuperTarget::Local(index) => {
                let frame = self.top_mut()?;
                let slot = frame
                    .locals
                    .get_mut(*index)
                    .ok_or(MethodAbort::Error(AmlError::BadBytecode("local index")))?;
                *slot = value.clone();
                Ok(())
            }
            SuperTarget::Arg(index) => {
                let frame = self.top_mut()?;
                let slot = frame
                    .args
                    .get_mut(*index)
                    .ok_or(MethodAbort::Error(AmlError::BadBytecode("argument index")))?;
                *slot = value.clone();
                Ok(())
            }
            SuperTarget::Node(node) => self.store_to_node(node, value, width),
            SuperTarget::Ref(cell) => {
                let reference = match &*cell.read() {
                    Object::Reference(reference) => Some(reference.clone()),
                    _ => None,
                };
                match reference {
                    Some(reference) => self.store_through_reference(reference, value, width),
                    None => {
                        let source = value.chase()?;
                        store_into_cell(self, cell, &source, width)
                    }
                }
            }
        }
    }

    /// `CopyObject` semantics: no conversion, the destination is replaced.
    pub(crate) fn copy_to_target(
        &mut self,
        clone: &ObjectRef,
        target: &SuperTarget,
    ) -> AbortResult<()> {
        match target {
            SuperTarget::Null => Ok(()),
            SuperTarget::Debug => {
                debug_output(clone);
                Ok(())
            }
            SuperTarget::Local(index) => {
                let frame = self.top_mut()?;
                let slot = frame
                    .locals
                    .get_mut(*index)
                    .ok_or(MethodAbort::Error(AmlError::BadBytecode("local index")))?;
                *slot = clone.clone();
                Ok(())
            }
            SuperTarget::Arg(index) => {
                let frame = self.top_mut()?;
                let slot = frame
                    .args
                    .get_mut(*index)
                    .ok_or(MethodAbort::Error(AmlError::BadBytecode("argument index")))?;
                *slot = clone.clone();
                Ok(())
            }
            // The node's object slot swaps atomically; an execution that
            // already resolved the old object keeps running it.
            SuperTarget::Node(node) => {
                node.set_object(clone.clone());
                Ok(())
            }
            SuperTarget::Ref(cell) => {
                let reference = match &*cell.read() {
                    Object::Reference(reference) => Some(reference.clone()),
                    _ => None,
                };
                match reference {
                    Some(Reference::Node(node)) => {
                        node.set_object(clone.clone());
                        Ok(())
                    }
                    Some(Reference::Value(target_cell)) => {
                        *target_cell.write() = clone.read().clone();
                        Ok(())
                    }
                    Some(Reference::PackageIndex { package, index }) => {
                        replace_package_element(&package, index, clone.clone())
                    }
                    Some(Reference::ByteIndex { data, index }) => {
                        let width = self.top_mut()?.width;
                        let byte = to_integer(&clone.read(), width)? as u8;
                        write_byte_at(&data, index, byte)
                    }
                    None => {
                        *cell.write() = clone.read().clone();
                        Ok(())
                    }
                }
            }
        }
    }

    /// Store into a named node with implicit conversion to the node's
    /// current type.
    pub(crate) fn store_to_node(
        &mut self,
        node: &NodeRef,
        value: &ObjectRef,
        width: IntegerWidth,
    ) -> AbortResult<()> {
        let cell = node.object();
        let source = value.chase()?;
        store_into_cell(self, &cell, &source, width)
    }

    fn store_through_reference(
        &mut self,
        reference: Reference,
        value: &ObjectRef,
        width: IntegerWidth,
    ) -> AbortResult<()> {
        let mut reference = reference;
        for _ in 0..crate::consts::MAX_REFERENCE_DEPTH {
            match reference {
                Reference::Node(node) => return self.store_to_node(&node, value, width),
                Reference::PackageIndex { package, index } => {
                    let source = value.chase()?;
                    let element = ObjectRef::new(source.read().clone());
                    return replace_package_element(&package, index, element);
                }
                Reference::ByteIndex { data, index } => {
                    let source = value.chase()?;
                    let byte = to_integer(&source.read(), width)? as u8;
                    return write_byte_at(&data, index, byte);
                }
                Reference::Value(cell) => {
                    let inner = match &*cell.read() {
                        Object::Reference(inner) => Some(inner.clone()),
                        _ => None,
                    };
                    match inner {
                        Some(inner) => reference = inner,
                        None => {
                            let source = value.chase()?;
                            return store_into_cell(self, &cell, &source, width);
                        }
                    }
                }
            }
        }
        Err(MethodAbort::ReferenceDepth(
            crate::consts::MAX_REFERENCE_DEPTH,
        ))
    }

    /// `Increment`/`Decrement`: writes through references held in the
    /// target slot, otherwise rebinds the slot like a store.
    pub(crate) fn increment_place(
        &mut self,
        target: &SuperTarget,
        delta: i64,
        width: IntegerWidth,
    ) -> AbortResult<u64> {
        match target {
            SuperTarget::Local(_) | SuperTarget::Arg(_) | SuperTarget::Ref(_) => {
                let cell = self.super_object(target)?;
                let reference = match &*cell.read() {
                    Object::Reference(reference) => Some(reference.clone()),
                    _ => None,
                };
                match reference {
                    Some(reference) => {
                        let current = cell.chase()?;
                        let value = to_integer(&current.read(), width)?;
                        let next = apply_delta(value, delta, width);
                        let boxed = ObjectRef::new(Object::Integer(next));
                        self.store_through_reference(reference, &boxed, width)?;
                        Ok(next)
                    }
                    None => {
                        let value = to_integer(&cell.read(), width)?;
                        let next = apply_delta(value, delta, width);
                        let boxed = ObjectRef::new(Object::Integer(next));
                        self.store_to_target(&boxed, target)?;
                        Ok(next)
                    }
                }
            }
            SuperTarget::Node(node) => {
                let value = self.read_node_integer(node, width)?;
                let next = apply_delta(value, delta, width);
                let boxed = ObjectRef::new(Object::Integer(next));
                self.store_to_node(node, &boxed, width)?;
                Ok(next)
            }
            SuperTarget::Debug | SuperTarget::Null => Err(MethodAbort::Error(
                AmlError::BadOperand("cannot increment here"),
            )),
        }
    }

    fn read_node_integer(&mut self, node: &NodeRef, width: IntegerWidth) -> AbortResult<u64> {
        let object = node.object();
        let special = {
            let guard = object.read();
            match &*guard {
                Object::FieldUnit(unit) => Some(Ok(unit.clone())),
                Object::BufferField(field) => Some(Err(field.clone())),
                _ => None,
            }
        };
        match special {
            Some(Ok(unit)) => {
                let ctx = self.context().clone();
                let value = field_read(&ctx, &unit, width)?;
                to_integer(&value, width)
            }
            Some(Err(field)) => {
                let value = buffer_field_read(&field, width)?;
                to_integer(&value, width)
            }
            None => {
                let cell = object.chase()?;
                let value = to_integer(&cell.read(), width)?;
                Ok(value)
            }
        }
    }
}

/// Write a data source into a cell, converting to the cell's current type.
///
/// Strings and buffers keep their length: the write truncates or
/// zero-extends. Non-data destinations are replaced by the source value.
fn store_into_cell(
    interp: &mut Interpreter,
    cell: &ObjectRef,
    source: &ObjectRef,
    width: IntegerWidth,
) -> AbortResult<()> {
    if cell.ptr_eq(source) {
        return Ok(());
    }
    enum Kind {
        Integer,
        Bytes,
        Field(FieldUnit),
        BufField(BufferField),
        Replace,
    }
    let kind = {
        let guard = cell.read();
        match &*guard {
            Object::Integer(_) => Kind::Integer,
            Object::String(_) | Object::Buffer(_) => Kind::Bytes,
            Object::FieldUnit(unit) => Kind::Field(unit.clone()),
            Object::BufferField(field) => Kind::BufField(field.clone()),
            _ => Kind::Replace,
        }
    };
    match kind {
        Kind::Integer => {
            let value = to_integer(&source.read(), width)?;
            *cell.write() = Object::Integer(value);
            Ok(())
        }
        Kind::Bytes => {
            let image = to_buffer(&source.read(), width)?;
            let mut guard = cell.write();
            match &mut *guard {
                Object::String(dst) | Object::Buffer(dst) => {
                    for (i, slot) in dst.iter_mut().enumerate() {
                        *slot = image.get(i).copied().unwrap_or(0);
                    }
                }
                // Replaced concurrently; fall back to a plain overwrite.
                other => *other = source.read().clone(),
            }
            Ok(())
        }
        Kind::Field(unit) => {
            let ctx = interp.context().clone();
            let value = source.read().clone();
            field_write(&ctx, &unit, &value)
        }
        Kind::BufField(field) => {
            let value = source.read().clone();
            buffer_field_write(&field, &value)
        }
        Kind::Replace => {
            *cell.write() = source.read().clone();
            Ok(())
        }
    }
}

fn apply_delta(value: u64, delta: i64, width: IntegerWidth) -> u64 {
    if delta >= 0 {
        value.wrapping_add(delta as u64) & width.mask()
    } else {
        value.wrapping_sub(delta.unsigned_abs()) & width.mask()
    }
}

fn replace_package_element(
    package: &ObjectRef,
    index: usize,
    element: ObjectRef,
) -> AbortResult<()> {
    let mut guard = package.write();
    match &mut *guard {
        Object::Package(elements) => {
            let slot = elements
                .get_mut(index)
                .ok_or(MethodAbort::Error(AmlError::BadOperand(
                    "package index out of range",
                )))?;
            *slot = element;
            Ok(())
        }
        other => Err(MethodAbort::Error(AmlError::TypeMismatch {
            expected: ObjectType::Package,
            found: other.type_of(),
        })),
    }
}

fn write_byte_at(data: &ObjectRef, index: usize, byte: u8) -> AbortResult<()> {
    let mut guard = data.write();
    match &mut *guard {
        Object::Buffer(bytes) | Object::String(bytes) => {
            let slot = bytes
                .get_mut(index)
                .ok_or(MethodAbort::Error(AmlError::BadOperand(
                    "byte index out of range",
                )))?;
            *slot = byte;
            Ok(())
        }
        other => Err(MethodAbort::Error(AmlError::TypeMismatch {
            expected: ObjectType::Buffer,
            found: other.type_of(),
        })),
    }
}

/* BUFFER FIELDS */

/// Read a buffer field into an integer (or buffer, when wider than the
/// integer width).
pub(crate) fn buffer_field_read(field: &BufferField, width: IntegerWidth) -> AbortResult<Object> {
    let guard = field.source.read();
    let bytes = match &*guard {
        Object::Buffer(bytes) => bytes,
        other => {
            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Buffer,
                found: other.type_of(),
            }))
        }
    };
    let mut out = vec![0u8; (field.bit_count as usize + 7) / 8];
    copy_bits(
        bytes,
        field.bit_offset as usize,
        &mut out,
        0,
        field.bit_count as usize,
    );
    if field.bit_count as usize <= width.bytes() * 8 {
        let mut value = 0u64;
        for (i, byte) in out.iter().take(8).enumerate() {
            value |= (*byte as u64) << (8 * i);
        }
        Ok(Object::Integer(value & width.mask()))
    } else {
        Ok(Object::Buffer(out))
    }
}

/// Write a data value into a buffer field, truncating or zero-extending to
/// the field width.
pub(crate) fn buffer_field_write(field: &BufferField, value: &Object) -> AbortResult<()> {
    let mut image = to_buffer(value, IntegerWidth::Full)?;
    image.resize((field.bit_count as usize + 7) / 8, 0);
    let mut guard = field.source.write();
    let bytes = match &mut *guard {
        Object::Buffer(bytes) => bytes,
        other => {
            return Err(MethodAbort::Error(AmlError::TypeMismatch {
                expected: ObjectType::Buffer,
                found: other.type_of(),
            }))
        }
    };
    copy_bits(
        &image,
        0,
        bytes,
        field.bit_offset as usize,
        field.bit_count as usize,
    );
    Ok(())
}

/// Copy `count` bits from `src` starting at `src_start` into `dst` at
/// `dst_start`, LSB-first within each byte. Out-of-range destination bits
/// are dropped.
fn copy_bits(src: &[u8], src_start: usize, dst: &mut [u8], dst_start: usize, count: usize) {
    for i in 0..count {
        let src_bit = src_start + i;
        let bit = src
            .get(src_bit / 8)
            .map(|byte| (byte >> (src_bit % 8)) & 1)
            .unwrap_or(0);
        let dst_bit = dst_start + i;
        if let Some(byte) = dst.get_mut(dst_bit / 8) {
            let flag = 1u8 << (dst_bit % 8);
            if bit == 1 {
                *byte |= flag;
            } else {
                *byte &= !flag;
            }
        }
    }
}

/// AML `Debug` object sink.
fn debug_output(value: &ObjectRef) {
    let rendered = {
        let guard = value.read();
        match &*guard {
            Object::Integer(v) => format!("{v:#x}"),
            Object::String(bytes) => format!("{:?}", String::from_utf8_lossy(bytes)),
            Object::Buffer(bytes) => format!("buffer[{}]", bytes.len()),
            Object::Package(elements) => format!("package[{}]", elements.len()),
            other => format!("<{}>", other.type_of()),
        }
    };
    info!(target: "aml_vm::debug", "AML Debug: {rendered}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_field_round_trip() {
        let source = ObjectRef::new(Object::Buffer(vec![0u8; 4]));
        let field = BufferField {
            source: source.clone(),
            bit_offset: 4,
            bit_count: 12,
        };
        buffer_field_write(&field, &Object::Integer(0xabc)).unwrap();
        let read = buffer_field_read(&field, IntegerWidth::Full).unwrap();
        assert!(matches!(read, Object::Integer(0xabc)));
        // Bits outside the field stay clear.
        assert!(matches!(&*source.read(), Object::Buffer(b) if b[0] & 0x0f == 0));
    }

    #[test]
    fn buffer_field_writes_truncate() {
        let source = ObjectRef::new(Object::Buffer(vec![0u8; 2]));
        let field = BufferField {
            source: source.clone(),
            bit_offset: 0,
            bit_count: 8,
        };
        buffer_field_write(&field, &Object::Integer(0x1ff)).unwrap();
        let read = buffer_field_read(&field, IntegerWidth::Full).unwrap();
        assert!(matches!(read, Object::Integer(0xff)));
    }

    #[test]
    fn copy_bits_handles_offsets() {
        let src = [0b1011_0100u8];
        let mut dst = [0u8; 2];
        copy_bits(&src, 2, &mut dst, 7, 5);
        // Bits 2..7 of src are 0b01101; placed at bit 7.
        assert_eq!(get(&dst, 7, 5), 0b01101);
    }

    fn get(bytes: &[u8], start: usize, count: usize) -> u8 {
        let mut out = 0u8;
        for i in 0..count {
            let bit = start + i;
            out |= ((bytes[bit / 8] >> (bit % 8)) & 1) << i;
        }
        out
    }
}
