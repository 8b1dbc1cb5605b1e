//! Field access against operation regions through the in-memory host.

mod common;

use common::*;

use aml_vm::prelude::*;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const FLAGS_BYTE_PRESERVE: u8 = 0x01;
const FLAGS_WORD_PRESERVE: u8 = 0x02;
const FLAGS_BYTE_WRITE_ONES: u8 = 0x01 | 0x20;

#[test]
fn system_memory_field_write_and_read() {
    let (rt, host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x1000), &int(0x10)),
            field(
                "REG0",
                FLAGS_BYTE_PRESERVE,
                &[("FLD1", 8), ("FLD2", 16)],
            ),
            method(
                "WRIT",
                0,
                &seq(&[
                    store(&int(0xab), &name("FLD1")),
                    store(&int(0x1234), &name("FLD2")),
                ]),
            ),
            method("RD2_", 0, &ret(&name("FLD2"))),
        ]),
    );
    rt.evaluate("\\WRIT", Vec::new()).unwrap();
    assert_eq!(host.memory_at(0x1000, 1), 0xab);
    assert_eq!(host.memory_at(0x1001, 2), 0x1234);
    assert_eq!(eval_int(&rt, "\\RD2_"), 0x1234);
}

#[test]
fn preserve_keeps_sibling_bits() {
    let (rt, host) = runtime();
    host.load_memory(0x2000, &[0xff]);
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x2000), &int(0x01)),
            // Two nibble-wide fields in one byte.
            field("REG0", FLAGS_BYTE_PRESERVE, &[("LOW_", 4), ("HIGH", 4)]),
            method("MAIN", 0, &store(&int(0x3), &name("LOW_"))),
        ]),
    );
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    // The high nibble survives the read-modify-write.
    assert_eq!(host.memory_at(0x2000, 1), 0xf3);
}

#[test]
fn write_as_ones_fills_sibling_bits() {
    let (rt, host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x3000), &int(0x01)),
            field("REG0", FLAGS_BYTE_WRITE_ONES, &[("LOW_", 4)]),
            method("MAIN", 0, &store(&int(0x0), &name("LOW_"))),
        ]),
    );
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    assert_eq!(host.memory_at(0x3000, 1), 0xf0);
}

#[test]
fn unaligned_field_spans_access_chunks() {
    let (rt, host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x4000), &int(0x04)),
            // 12 bits starting at bit 4: crosses a byte boundary.
            field("REG0", FLAGS_BYTE_PRESERVE, &[("", 4), ("MID_", 12)]),
            method("MAIN", 0, &store(&int(0xabc), &name("MID_"))),
            method("READ", 0, &ret(&name("MID_"))),
        ]),
    );
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    assert_eq!(host.memory_at(0x4000, 2), 0xabc0);
    assert_eq!(eval_int(&rt, "\\READ"), 0xabc);
}

#[test]
fn system_io_fields_use_port_space() {
    let (rt, host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            op_region("PRT0", 0x01, &int(0x60), &int(0x04)),
            field("PRT0", FLAGS_WORD_PRESERVE, &[("DATA", 16)]),
            method("MAIN", 0, &store(&int(0xbeef), &name("DATA"))),
        ]),
    );
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    assert_eq!(host.io_at(0x60, 2), 0xbeef);
}

#[test]
fn index_field_moves_through_register_pair() {
    let (rt, host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x5000), &int(0x02)),
            field("REG0", FLAGS_BYTE_PRESERVE, &[("IDX_", 8), ("DAT_", 8)]),
            index_field("IDX_", "DAT_", FLAGS_BYTE_PRESERVE, &[("IRG0", 8), ("IRG1", 8)]),
            method("MAIN", 0, &store(&int(0x5a), &name("IRG1"))),
        ]),
    );
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    // The write selected chunk 1 through the index register then moved the
    // data byte.
    assert_eq!(host.memory_at(0x5000, 1), 0x01);
    assert_eq!(host.memory_at(0x5001, 1), 0x5a);
}

#[test]
fn wide_fields_become_buffers() {
    let (rt, host) = runtime();
    host.load_memory(0x6000, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x6000), &int(0x0c)),
            field("REG0", FLAGS_BYTE_PRESERVE, &[("WIDE", 96)]),
            method("MAIN", 0, &ret(&name("WIDE"))),
        ]),
    );
    assert_eq!(
        eval_buffer(&rt, "\\MAIN"),
        vec![1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
    );
}

#[test]
fn out_of_bounds_access_aborts() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            op_region("REG0", 0x00, &int(0x7000), &int(0x01)),
            // Field extends past the one-byte region.
            field("REG0", FLAGS_BYTE_PRESERVE, &[("OVER", 32)]),
            method("MAIN", 0, &ret(&name("OVER"))),
        ]),
    );
    assert!(rt.evaluate("\\MAIN", Vec::new()).is_err());
}

struct CountingHandler {
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl RegionHandler for CountingHandler {
    fn read(
        &self,
        _access: &RegionAccess<'_>,
        offset: u64,
        _width: usize,
    ) -> Result<u64, AmlError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(offset)
    }

    fn write(
        &self,
        _access: &RegionAccess<'_>,
        _offset: u64,
        _width: usize,
        _value: u64,
    ) -> Result<(), AmlError> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[test]
fn client_handlers_cover_custom_spaces() {
    let (rt, _host) = runtime();
    let handler = Arc::new(CountingHandler {
        reads: AtomicUsize::new(0),
        writes: AtomicUsize::new(0),
    });
    rt.install_address_space_handler(None, AddressSpace::EmbeddedController, handler.clone())
        .unwrap();
    load_aml(
        &rt,
        &seq(&[
            op_region("ECRG", 0x03, &int(0x00), &int(0x10)),
            field("ECRG", FLAGS_BYTE_PRESERVE, &[("ECF0", 8)]),
            method("MAIN", 0, &store(&int(1), &name("ECF0"))),
        ]),
    );
    rt.evaluate("\\MAIN", Vec::new()).unwrap();
    assert_eq!(handler.writes.load(Ordering::Relaxed), 1);

    // Handler install/uninstall round-trips with no leftovers.
    rt.uninstall_address_space_handler(None, AddressSpace::EmbeddedController)
        .unwrap();
    assert!(rt
        .uninstall_address_space_handler(None, AddressSpace::EmbeddedController)
        .is_err());
    assert!(rt.evaluate("\\MAIN", Vec::new()).is_err());
}

#[test]
fn missing_handler_surfaces_not_ready() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            // SMBus has no builtin handler.
            op_region("SMB0", 0x04, &int(0x00), &int(0x10)),
            field("SMB0", 0x05, &[("PRT0", 8)]),
            method("MAIN", 0, &ret(&name("PRT0"))),
        ]),
    );
    let error = rt.evaluate("\\MAIN", Vec::new()).unwrap_err();
    assert!(matches!(error, AmlError::NotReady(_)), "{error}");
}
