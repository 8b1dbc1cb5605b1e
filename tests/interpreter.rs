//! End-to-end interpreter scenarios driven through assembled AML.

mod common;

use common::*;

use aml_vm::prelude::*;

use std::time::Duration;

#[test]
fn package_element_expression_and_deref() {
    // Method MAIN { Local0=10; Local1=Package{Local0*5};
    //               Return(DerefOf(Local1[0])) }
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(10), &local(0)),
        store(
            &package(&[multiply(&local(0), &int(5), NULL_TARGET)]),
            &local(1),
        ),
        ret(&deref_of(&index(&local(1), &int(0), NULL_TARGET))),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 50);
}

#[test]
fn store_integer_into_string_preserves_length() {
    // Name TEST "BAR"; TEST=0x4F4F46; Return(TEST) -> "FOO"
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(0x004f_4f46), &name("TEST")),
        ret(&name("TEST")),
    ]);
    load_aml(
        &rt,
        &seq(&[name_decl("TEST", &string("BAR")), method("MAIN", 0, &body)]),
    );
    assert_eq!(eval_string(&rt, "\\MAIN"), b"FOO".to_vec());
}

#[test]
fn store_into_empty_string_stays_empty() {
    // Name VAL ""; VAL="FOO"; Return(VAL) -> ""
    let (rt, _host) = runtime();
    let body = seq(&[store(&string("FOO"), &name("VAL_")), ret(&name("VAL_"))]);
    load_aml(
        &rt,
        &seq(&[name_decl("VAL_", &string("")), method("MAIN", 0, &body)]),
    );
    assert_eq!(eval_string(&rt, "\\MAIN"), Vec::<u8>::new());
}

#[test]
fn store_long_string_truncates() {
    // Name TEST "XXXX"; TEST="LONGSTRING"; Return(TEST) -> "LONG"
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&string("LONGSTRING"), &name("TEST")),
        ret(&name("TEST")),
    ]);
    load_aml(
        &rt,
        &seq(&[name_decl("TEST", &string("XXXX")), method("MAIN", 0, &body)]),
    );
    assert_eq!(eval_string(&rt, "\\MAIN"), b"LONG".to_vec());
}

#[test]
fn store_to_reference_holder_rebinds() {
    // Local0=123; Local1=RefOf(Local0); Local1=321; Return(Local0) -> 123
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(123), &local(0)),
        store(&ref_of(&local(0)), &local(1)),
        store(&int(321), &local(1)),
        ret(&local(0)),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 123);
}

#[test]
fn increment_through_reference_hits_referent() {
    // Local0=123; Local1=RefOf(Local0); Local1++; Return(Local0) -> 124
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(123), &local(0)),
        store(&ref_of(&local(0)), &local(1)),
        increment(&local(1)),
        ret(&local(0)),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 124);
}

#[test]
fn returned_local_reference_survives_frame_pop() {
    let (rt, _host) = runtime();
    let helper = seq(&[store(&int(42), &local(0)), ret(&ref_of(&local(0)))]);
    let main = seq(&[
        store(&call("HELP", &[]), &local(0)),
        ret(&deref_of(&local(0))),
    ]);
    load_aml(
        &rt,
        &seq(&[method("HELP", 0, &helper), method("MAIN", 0, &main)]),
    );
    assert_eq!(eval_int(&rt, "\\MAIN"), 42);
}

#[test]
fn copy_object_over_running_method() {
    // CopyObject(123, TEST) from inside method TEST: the running body
    // finishes and returns 1; later lookups see the integer.
    let (rt, _host) = runtime();
    let body = seq(&[copy_object(&int(123), &name("TEST")), ret(&int(1))]);
    load_aml(&rt, &method("TEST", 0, &body));
    assert_eq!(eval_int(&rt, "\\TEST"), 1);
    assert_eq!(eval_int(&rt, "\\TEST"), 123);
}

#[test]
fn endless_while_times_out() {
    let (rt, _host) = runtime();
    rt.set_loop_timeout(Duration::from_millis(50));
    load_aml(&rt, &method("SPIN", 0, &while_block(&[0x01], &[])));
    let error = rt.evaluate("\\SPIN", Vec::new()).unwrap_err();
    assert!(matches!(error, AmlError::Timeout(_)), "{error}");
}

#[test]
fn while_loop_computes() {
    // Sum 1..=10 with a While loop.
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(0), &local(0)),
        store(&int(1), &local(1)),
        while_block(
            &lless(&local(1), &int(11)),
            &seq(&[
                store(&add(&local(0), &local(1), NULL_TARGET), &local(0)),
                increment(&local(1)),
            ]),
        ),
        ret(&local(0)),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 55);
}

#[test]
fn break_and_continue() {
    // Count odd numbers below 10, stopping at 7.
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(0), &local(0)),
        store(&int(0), &local(1)),
        while_block(
            &[0x01],
            &seq(&[
                increment(&local(1)),
                if_block(&lequal(&local(1), &int(7)), BREAK),
                // Skip even numbers.
                if_block(
                    &lequal(
                        &aml_mod(&local(1), &int(2)),
                        &int(0),
                    ),
                    CONTINUE,
                ),
                increment(&local(0)),
            ]),
        ),
        ret(&local(0)),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    // Odds seen before 7: 1, 3, 5.
    assert_eq!(eval_int(&rt, "\\MAIN"), 3);
}

fn aml_mod(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut out = vec![0x85];
    out.extend_from_slice(a);
    out.extend_from_slice(b);
    out.extend_from_slice(NULL_TARGET);
    out
}

#[test]
fn if_else_branches() {
    let (rt, _host) = runtime();
    let body = |pred: &[u8]| {
        seq(&[
            if_block(pred, &ret(&int(1))),
            else_block(&ret(&int(2))),
            ret(&int(3)),
        ])
    };
    load_aml(
        &rt,
        &seq(&[
            method("TAKE", 0, &body(&[0x01])),
            method("SKIP", 0, &body(&[0x00])),
        ]),
    );
    assert_eq!(eval_int(&rt, "\\TAKE"), 1);
    assert_eq!(eval_int(&rt, "\\SKIP"), 2);
}

#[test]
fn method_arguments_pass_through() {
    let (rt, _host) = runtime();
    let callee = ret(&add(&arg(0), &arg(1), NULL_TARGET));
    let main = ret(&call("ADD2", &[int(40), int(2)]));
    load_aml(
        &rt,
        &seq(&[method("ADD2", 2, &callee), method("MAIN", 0, &main)]),
    );
    assert_eq!(eval_int(&rt, "\\MAIN"), 42);
}

#[test]
fn evaluate_accepts_client_arguments() {
    let (rt, _host) = runtime();
    load_aml(&rt, &method("DBL_", 1, &ret(&add(&arg(0), &arg(0), NULL_TARGET))));
    let result = rt
        .evaluate_integer("\\DBL_", vec![Object::Integer(21)])
        .unwrap();
    assert_eq!(result, 42);
}

#[test]
fn cond_ref_of_missing_name_is_false() {
    let (rt, _host) = runtime();
    let body = seq(&[
        if_block(
            &cond_ref_of(&name("MISS"), &local(0)),
            &ret(&int(1)),
        ),
        ret(&int(0)),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 0);
}

#[test]
fn cond_ref_of_present_name_dereferences() {
    let (rt, _host) = runtime();
    let body = seq(&[
        if_block(
            &cond_ref_of(&name("HERE"), &local(0)),
            &ret(&deref_of(&local(0))),
        ),
        ret(&int(0)),
    ]);
    load_aml(
        &rt,
        &seq(&[name_decl("HERE", &int(77)), method("MAIN", 0, &body)]),
    );
    assert_eq!(eval_int(&rt, "\\MAIN"), 77);
}

#[test]
fn integer_width_is_masked_by_table_revision() {
    // Revision 1 tables run 32-bit arithmetic.
    let (rt, _host) = runtime();
    let body = ret(&add(&int(0xffff_ffff), &int(2), NULL_TARGET));
    load_aml_rev1(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 1);

    let (rt64, _host) = runtime();
    load_aml(&rt64, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt64, "\\MAIN"), 0x1_0000_0001);
}

#[test]
fn string_to_integer_parses_hex() {
    let (rt, _host) = runtime();
    let body = ret(&add(&string("1A"), &int(1), NULL_TARGET));
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 0x1b);
}

#[test]
fn concat_follows_first_operand_type() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            method(
                "STRC",
                0,
                &ret(&concat(&string("AB"), &string("CD"), NULL_TARGET)),
            ),
            method(
                "BUFC",
                0,
                &ret(&concat(&buffer(&[1, 2]), &buffer(&[3]), NULL_TARGET)),
            ),
        ]),
    );
    assert_eq!(eval_string(&rt, "\\STRC"), b"ABCD".to_vec());
    assert_eq!(eval_buffer(&rt, "\\BUFC"), vec![1, 2, 3]);
}

#[test]
fn size_of_and_object_type() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            name_decl("STR_", &string("hello")),
            name_decl("PKG_", &package(&[int(1), int(2), int(3)])),
            method("SSTR", 0, &ret(&size_of(&name("STR_")))),
            method("SPKG", 0, &ret(&size_of(&name("PKG_")))),
            method("TSTR", 0, &ret(&object_type(&name("STR_")))),
        ]),
    );
    assert_eq!(eval_int(&rt, "\\SSTR"), 5);
    assert_eq!(eval_int(&rt, "\\SPKG"), 3);
    assert_eq!(eval_int(&rt, "\\TSTR"), ObjectType::String as u64);
}

#[test]
fn buffer_fields_read_and_write() {
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&buffer(&[0, 0, 0, 0, 0, 0, 0, 0]), &local(0)),
        create_dword_field(&local(0), &int(2), "FLD_"),
        store(&int(0xdead_beef), &name("FLD_")),
        ret(&name("FLD_")),
    ]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 0xdead_beef);
}

#[test]
fn method_local_names_vanish_after_return() {
    let (rt, _host) = runtime();
    let body = seq(&[name_decl("TMP_", &int(9)), ret(&name("TMP_"))]);
    load_aml(&rt, &method("MAIN", 0, &body));
    assert_eq!(eval_int(&rt, "\\MAIN"), 9);
    // The node is unlinked once the method returns.
    assert!(rt.evaluate("\\MAIN.TMP_", Vec::new()).is_err());
    // And the method can run again without an already-exists error.
    assert_eq!(eval_int(&rt, "\\MAIN"), 9);
}

#[test]
fn osi_answers_for_known_interfaces() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            method("WIN_", 0, &ret(&call("\\_OSI", &[string("Windows 2015")]))),
            method("NOPE", 0, &ret(&call("\\_OSI", &[string("Not An OS")]))),
        ]),
    );
    assert_ne!(eval_int(&rt, "\\WIN_"), 0);
    assert_eq!(eval_int(&rt, "\\NOPE"), 0);
    rt.install_interface("Not An OS").unwrap();
    assert_ne!(eval_int(&rt, "\\NOPE"), 0);
}

#[test]
fn scoped_declarations_and_search_rules() {
    let (rt, _host) = runtime();
    load_aml(
        &rt,
        &seq(&[
            name_decl("GLOB", &int(7)),
            device(
                "\\_SB_.DEV0",
                &seq(&[
                    name_decl("OWNV", &int(1)),
                    // A bare segment search walks up to the root.
                    method("RDGL", 0, &ret(&name("GLOB"))),
                    method("RDOW", 0, &ret(&name("OWNV"))),
                ]),
            ),
        ]),
    );
    assert_eq!(eval_int(&rt, "\\_SB_.DEV0.RDGL"), 7);
    assert_eq!(eval_int(&rt, "\\_SB_.DEV0.RDOW"), 1);
}

#[test]
fn mutex_acquire_release_in_method() {
    let (rt, _host) = runtime();
    let body = seq(&[
        // Acquire returns zero on success.
        store(&acquire("MTX_", 0xffff), &local(0)),
        release("MTX_"),
        ret(&local(0)),
    ]);
    load_aml(
        &rt,
        &seq(&[mutex_decl("MTX_", 0), method("MAIN", 0, &body)]),
    );
    assert_eq!(eval_int(&rt, "\\MAIN"), 0);
    // Abandoned acquisitions release at method exit: run twice.
    assert_eq!(eval_int(&rt, "\\MAIN"), 0);
}

#[test]
fn recursive_serialized_method() {
    // A serialized method calling itself must not self-deadlock.
    let (rt, _host) = runtime();
    let body = seq(&[
        if_block(&lequal(&arg(0), &int(0)), &ret(&int(0))),
        ret(&add(
            &arg(0),
            &call("SUM_", &[add(&arg(0), &ref_neg_one(), NULL_TARGET)]),
            NULL_TARGET,
        )),
    ]);
    load_aml(&rt, &method("SUM_", serialized_flags(1, 0), &body));
    assert_eq!(
        rt.evaluate_integer("\\SUM_", vec![Object::Integer(4)]).unwrap(),
        10
    );
}

fn ref_neg_one() -> Vec<u8> {
    // Subtract 1 via Ones is width dependent; encode literal -1 as
    // 0xffff_ffff_ffff_ffff and rely on wrapping.
    int(u64::MAX)
}

#[test]
fn bad_bytecode_aborts_cleanly() {
    let (rt, _host) = runtime();
    // 0x02 is not an opcode.
    load_aml(&rt, &method("BAD_", 0, &[0x02, 0x00]));
    let error = rt.evaluate("\\BAD_", Vec::new()).unwrap_err();
    assert!(matches!(error, AmlError::BadBytecode(_)), "{error}");
    // Independent evaluations are unaffected afterwards.
    load_aml(&rt, &method("GOOD", 0, &ret(&int(5))));
    assert_eq!(eval_int(&rt, "\\GOOD"), 5);
}

#[test]
fn failure_does_not_roll_back_side_effects() {
    let (rt, _host) = runtime();
    let body = seq(&[
        store(&int(1), &name("FLAG")),
        // Dereferencing a plain integer is an error.
        deref_of(&local(0)),
        store(&int(2), &name("FLAG")),
    ]);
    load_aml(
        &rt,
        &seq(&[name_decl("FLAG", &int(0)), method("MAIN", 0, &body)]),
    );
    assert!(rt.evaluate("\\MAIN", Vec::new()).is_err());
    assert_eq!(eval_int(&rt, "\\FLAG"), 1);
}
