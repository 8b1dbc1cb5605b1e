//! Property tests over encodings and object semantics.

mod common;

use common::*;

use aml_vm::name::AmlName;
use aml_vm::object::{Object, ObjectRef, Reference};
use aml_vm::opcode::Stream;
use aml_vm::prelude::*;

use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

#[quickcheck]
fn pkg_length_round_trips(len: usize) -> TestResult {
    let len = len % (1 << 16);
    let content = vec![0u8; len];
    let encoded = with_pkg_length(&content);
    let mut stream = Stream::new(&encoded, 0, encoded.len());
    let end = stream.pkg_length().unwrap();
    if end != encoded.len() {
        return TestResult::failed();
    }
    // The cursor sits at the first content byte.
    TestResult::from_bool(stream.pos() == encoded.len() - len)
}

#[quickcheck]
fn name_paths_round_trip(raw: Vec<u8>) -> TestResult {
    // Build a plausible path out of the fuzz bytes.
    if raw.is_empty() {
        return TestResult::discard();
    }
    let seg = |byte: u8| -> String {
        let letters = [b'A' + byte % 26, b'_', b'0' + byte % 10, b'Z'];
        String::from_utf8_lossy(&letters).into_owned()
    };
    let depth = (raw.len() % 4) + 1;
    let path = format!(
        "\\{}",
        raw.iter()
            .take(depth)
            .map(|b| seg(*b))
            .collect::<Vec<_>>()
            .join(".")
    );
    let parsed: AmlName = match path.parse() {
        Ok(name) => name,
        Err(_) => return TestResult::discard(),
    };
    let encoded = name(&path);
    let mut stream = Stream::new(&encoded, 0, encoded.len());
    let decoded = AmlName::parse(&mut stream).unwrap();
    TestResult::from_bool(decoded == parsed && decoded.to_string() == path)
}

#[quickcheck]
fn stored_integers_read_back_masked(value: u64, legacy: bool) {
    let (rt, _host) = runtime();
    let body = seq(&[store(&arg(0), &name("VAL_")), ret(&name("VAL_"))]);
    let table = seq(&[name_decl("VAL_", &int(0)), method("MAIN", 1, &body)]);
    if legacy {
        load_aml_rev1(&rt, &table);
    } else {
        load_aml(&rt, &table);
    }
    let mask = if legacy { u32::MAX as u64 } else { u64::MAX };
    let result = rt
        .evaluate_integer("\\MAIN", vec![Object::Integer(value)])
        .unwrap();
    assert_eq!(result, value & mask);
}

#[quickcheck]
fn deref_of_ref_chains_reach_the_value(value: u64, depth: u8) {
    let depth = (depth % 16) as usize;
    let target = ObjectRef::new(Object::Integer(value));
    let mut reference = target.clone();
    for _ in 0..depth {
        reference = ObjectRef::new(Object::Reference(Reference::Value(reference)));
    }
    let found = reference.chase().expect("within depth bound");
    assert!(found.value_eq(&target));
}

#[quickcheck]
fn deep_copies_match_by_value(values: Vec<u64>) {
    let pkg = ObjectRef::new(Object::package(
        values.iter().map(|v| Object::Integer(*v)),
    ));
    let copy = pkg.deep_clone();
    assert!(copy.value_eq(&pkg));
}

#[quickcheck]
fn buffer_store_preserves_target_length(source: Vec<u8>, target_len: u8) {
    let target_len = target_len as usize % 32;
    let (rt, _host) = runtime();
    let table = seq(&[
        name_decl("BUF_", &buffer(&vec![0u8; target_len])),
        method(
            "MAIN",
            1,
            &seq(&[store(&arg(0), &name("BUF_")), ret(&name("BUF_"))]),
        ),
    ]);
    load_aml(&rt, &table);
    let result = rt
        .evaluate("\\MAIN", vec![Object::Buffer(source.clone())])
        .unwrap()
        .expect("buffer result");
    let result = result.chase().unwrap();
    let bytes = match &*result.read() {
        Object::Buffer(bytes) => bytes.clone(),
        other => panic!("expected buffer, got {other:?}"),
    };
    assert_eq!(bytes.len(), target_len);
    for (i, byte) in bytes.iter().enumerate() {
        assert_eq!(*byte, source.get(i).copied().unwrap_or(0));
    }
}
