//! Table installation, dynamic Load/LoadTable, and unload.

mod common;

use common::*;

use aml_vm::prelude::*;
use aml_vm::table::build_table;

#[test]
fn nested_loads_stay_on_a_small_host_stack() {
    // Each table declares its marker name and a buffer holding the next
    // table's image, then Loads it. 200 deep, on a quarter-megabyte stack:
    // frame growth must be heap-side only.
    const DEPTH: usize = 200;

    let mut aml = name_decl(&format!("N{:03}", DEPTH - 1), &int((DEPTH - 1) as u64));
    for level in (0..DEPTH - 1).rev() {
        let inner_image = build_table("SSDT", 2, &format!("LVL{level}"), &aml);
        aml = seq(&[
            name_decl(&format!("N{level:03}"), &int(level as u64)),
            name_decl(&format!("B{level:03}"), &buffer(&inner_image)),
            load(&format!("B{level:03}"), NULL_TARGET),
        ]);
    }

    let outer = aml;
    let worker = std::thread::Builder::new()
        .stack_size(256 * 1024)
        .spawn(move || {
            let (rt, _host) = runtime();
            load_aml(&rt, &outer);
            for level in 0..DEPTH {
                let path = format!("\\N{level:03}");
                assert_eq!(eval_int(&rt, &path), level as u64, "{path}");
            }
        })
        .expect("spawn worker");
    worker.join().expect("nested load worker panicked");
}

#[test]
fn load_table_finds_installed_tables() {
    let (rt, _host) = runtime();
    // Install (but do not run) a secondary table.
    rt.install_table(&build_table(
        "SSDT",
        2,
        "EXTRA",
        &name_decl("EXTV", &int(0x77)),
    ))
    .unwrap();

    let body = ret(&load_table_expr("SSDT", "", "EXTRA"));
    load_aml(&rt, &method("MAIN", 0, &body));
    // The handle is truthy, and the table's names are now visible.
    assert_ne!(eval_int(&rt, "\\MAIN"), 0);
    assert_eq!(eval_int(&rt, "\\EXTV"), 0x77);
}

#[test]
fn load_table_missing_yields_zero() {
    let (rt, _host) = runtime();
    let body = ret(&load_table_expr("SSDT", "", "NOPE"));
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 0);
}

fn load_table_expr(signature: &str, oem_id: &str, oem_table_id: &str) -> Vec<u8> {
    let mut out = vec![0x5b, 0x1f];
    out.extend(string(signature));
    out.extend(string(oem_id));
    out.extend(string(oem_table_id));
    out.extend(string("")); // root path
    out.extend(string("")); // parameter path
    out.extend(int(0)); // parameter data
    out
}

#[test]
fn install_hook_denies_tables() {
    let (rt, _host) = runtime();
    rt.set_table_install_hook(Some(Box::new(|header| {
        header.signature_str() != "SSDT"
    })));
    let denied = rt.install_table(&build_table("SSDT", 2, "DENY", &[]));
    assert!(matches!(denied, Err(AmlError::Denied)));
    rt.set_table_install_hook(None);
    rt.install_table(&build_table("SSDT", 2, "DENY", &[]))
        .unwrap();
}

#[test]
fn unload_removes_owned_nodes() {
    let (rt, _host) = runtime();
    let table = rt
        .load_table_image(&build_table(
            "SSDT",
            2,
            "GONE",
            &name_decl("TMPX", &int(5)),
        ))
        .unwrap();
    assert_eq!(eval_int(&rt, "\\TMPX"), 5);

    table.pin();
    assert!(matches!(
        rt.unload_table(&table),
        Err(AmlError::StillInUse(_))
    ));
    table.unpin();
    rt.unload_table(&table).unwrap();
    assert!(rt.evaluate("\\TMPX", Vec::new()).is_err());
}

#[test]
fn find_table_by_signature() {
    let (rt, _host) = runtime();
    rt.install_table(&build_table("SSDT", 2, "ONE", &[]))
        .unwrap();
    rt.install_table(&build_table("SSDT", 2, "TWO", &[0xa3]))
        .unwrap();
    assert!(rt.find_table("SSDT", None, Some("TWO")).is_some());
    assert!(rt.find_table("SSDT", None, Some("ZZZ")).is_none());
    assert!(rt.find_table("DSDT", None, None).is_none());
}

#[test]
fn table_at_physical_address() {
    let (rt, host) = runtime();
    let image = build_table("SSDT", 2, "PHYS", &name_decl("PHYV", &int(9)));
    host.load_memory(0x8_0000, &image);
    let table = rt.install_table_at(0x8_0000).unwrap();
    rt.load_table(&table).unwrap();
    assert_eq!(eval_int(&rt, "\\PHYV"), 9);
}
