mod common;

use std::collections::BTreeMap;

use luabridge::diagnostics::{
    LB_PULL_KEY_UNSUPPORTED, LB_PULL_TOO_DEEP, LB_PULL_UNREADABLE_STRING, LB_PULL_UNSUPPORTED,
};
use luabridge::{Bridge, BridgeConfig, BridgeError, Handle, HostValue, LuaType};

fn roundtrip(bridge: &mut Bridge, h: Handle, v: &HostValue) -> HostValue {
    bridge.set_global(h, "v", v).expect("set_global");
    let (out, _) = bridge.get_global(h, "v").expect("get_global");
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
    out
}

fn mapping(entries: &[(&str, HostValue)]) -> HostValue {
    HostValue::mapping(entries.iter().map(|(k, v)| (k.to_string(), v.clone())))
}

#[test]
fn primitives_roundtrip_exactly() {
    let (mut bridge, _probe, h) = common::instance();
    let values = [
        HostValue::Nil,
        HostValue::Boolean(true),
        HostValue::Boolean(false),
        HostValue::Integer(0),
        HostValue::Integer(i64::MIN),
        HostValue::Integer(i64::MAX),
        HostValue::from("héllo wörld"),
        HostValue::from(""),
    ];
    for v in &values {
        assert_eq!(&roundtrip(&mut bridge, h, v), v);
    }
}

#[test]
fn floats_roundtrip_bit_for_bit() {
    let (mut bridge, _probe, h) = common::instance();
    for f in [0.1, -0.0, 3.0, f64::MAX, f64::MIN_POSITIVE, 5e-324, 1e300, -7.25] {
        match roundtrip(&mut bridge, h, &HostValue::Float(f)) {
            HostValue::Float(back) => assert_eq!(back.to_bits(), f.to_bits(), "{f}"),
            other => panic!("expected float for {f}, got {other:?}"),
        }
    }
}

#[test]
fn sequences_keep_order_and_element_types() {
    let (mut bridge, _probe, h) = common::instance();
    let seq = HostValue::Sequence(vec![
        HostValue::Integer(2),
        HostValue::from("x"),
        HostValue::Boolean(false),
        HostValue::Float(7.5),
    ]);
    assert_eq!(roundtrip(&mut bridge, h, &seq), seq);
}

#[test]
fn mapping_keys_that_look_numeric_come_back_as_the_same_text() {
    let (mut bridge, _probe, h) = common::instance();
    let map = mapping(&[
        ("a", HostValue::Integer(1)),
        ("3.5", HostValue::Boolean(true)),
        ("10", HostValue::from("z")),
    ]);
    assert_eq!(roundtrip(&mut bridge, h, &map), map);

    // Non-canonical numeric text stays a string key.
    let map = mapping(&[("010", HostValue::Integer(1)), ("2.0", HostValue::Integer(2))]);
    assert_eq!(roundtrip(&mut bridge, h, &map), map);
}

#[test]
fn contiguity_boundary() {
    let (mut bridge, _probe, h) = common::instance();

    let dense = mapping(&[
        ("1", HostValue::from("a")),
        ("2", HostValue::from("b")),
        ("3", HostValue::from("c")),
    ]);
    assert_eq!(
        roundtrip(&mut bridge, h, &dense),
        HostValue::Sequence(vec!["a".into(), "b".into(), "c".into()])
    );

    let gap = mapping(&[("1", HostValue::from("a")), ("3", HostValue::from("c"))]);
    assert_eq!(roundtrip(&mut bridge, h, &gap), gap);

    // An empty table has keys exactly 1..0, so it reads back as an empty sequence.
    let empty = HostValue::Mapping(BTreeMap::new());
    assert_eq!(
        roundtrip(&mut bridge, h, &empty),
        HostValue::Sequence(Vec::new())
    );
}

#[test]
fn sets_push_like_sequences() {
    let (mut bridge, _probe, h) = common::instance();
    let set = HostValue::Set(vec!["x".into(), "y".into()]);
    assert_eq!(
        roundtrip(&mut bridge, h, &set),
        HostValue::Sequence(vec!["x".into(), "y".into()])
    );
}

#[test]
fn nested_values_roundtrip() {
    let (mut bridge, _probe, h) = common::instance();
    let v = mapping(&[
        (
            "list",
            HostValue::Sequence(vec![
                HostValue::Integer(1),
                HostValue::Sequence(vec![HostValue::Integer(2), HostValue::Integer(3)]),
            ]),
        ),
        ("inner", mapping(&[("k", HostValue::from("v"))])),
    ]);
    assert_eq!(roundtrip(&mut bridge, h, &v), v);
}

#[test]
fn unsupported_pushes_fail_and_restore_the_stack() {
    let (mut bridge, _probe, h) = common::instance();

    let err = bridge
        .set_global(h, "b", &HostValue::Bytes(vec![1, 2, 3]))
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { kind: "bytes", .. }));

    let nested = mapping(&[
        ("ok", HostValue::Integer(1)),
        ("sym", HostValue::Symbol("s".to_string())),
    ]);
    let err = bridge.set_global(h, "n", &nested).unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { kind: "symbol", .. }));

    let err = bridge
        .set_global(h, "s", &HostValue::from("a\0b"))
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { kind: "string", .. }));

    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
    assert_eq!(
        bridge.get_global(h, "n").expect("get"),
        (HostValue::Nil, LuaType::Nil)
    );
}

#[test]
fn push_depth_is_bounded() {
    let (mut bridge, _probe, h) = common::instance();
    let mut v = HostValue::Integer(1);
    for _ in 0..100 {
        v = HostValue::Sequence(vec![v]);
    }
    let err = bridge.set_global(h, "deep", &v).unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { .. }));
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
}

#[test]
fn guest_tables_pull_by_contiguity() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(&mut bridge, h, "t = {10, 20, x = 'y'}\nf = {[1.5] = 'a'}");

    let (t, ty) = bridge.get_global(h, "t").expect("get t");
    assert_eq!(ty, LuaType::Table);
    assert_eq!(
        t,
        mapping(&[
            ("1", HostValue::Integer(10)),
            ("2", HostValue::Integer(20)),
            ("x", HostValue::from("y")),
        ])
    );

    let (f, _) = bridge.get_global(h, "f").expect("get f");
    assert_eq!(f, mapping(&[("1.5", HostValue::from("a"))]));
}

#[test]
fn best_effort_pulls_warn_and_substitute_nil() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(
        &mut bridge,
        h,
        "u = newuserdata()\nt = {a = newthread(), b = 2}\nt[true] = 'skipped'",
    );

    assert_eq!(
        bridge.get_global(h, "u").expect("get u"),
        (HostValue::Nil, LuaType::Userdata)
    );
    let (t, _) = bridge.get_global(h, "t").expect("get t");
    assert_eq!(
        t,
        mapping(&[("a", HostValue::Nil), ("b", HostValue::Integer(2))])
    );

    let codes: Vec<String> = bridge
        .take_diagnostics()
        .into_iter()
        .map(|d| d.code)
        .collect();
    assert_eq!(codes.iter().filter(|c| *c == LB_PULL_UNSUPPORTED).count(), 2);
    assert!(codes.iter().any(|c| c == LB_PULL_KEY_UNSUPPORTED), "{codes:?}");
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
}

#[test]
fn strict_pulls_fail_with_the_stack_restored() {
    let (mut bridge, _probe) = common::bridge_with(common::quiet().strict());
    let h = bridge.create_instance().expect("create");
    common::run(&mut bridge, h, "u = newuserdata()\nt = {1, {2, newthread()}}");

    let err = bridge.get_global(h, "u").unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { kind: "userdata", .. }));
    let err = bridge.get_global(h, "t").unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { kind: "thread", .. }));
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
    assert!(bridge.diagnostics().is_empty());
}

#[test]
fn cyclic_guest_tables_stop_at_max_depth() {
    let config = BridgeConfig {
        max_depth: 3,
        ..common::quiet()
    };
    let (mut bridge, _probe) = common::bridge_with(config);
    let h = bridge.create_instance().expect("create");
    common::run(&mut bridge, h, "t = {}\nt.me = t");

    let (t, _) = bridge.get_global(h, "t").expect("get t");
    let expected = mapping(&[(
        "me",
        mapping(&[("me", mapping(&[("me", HostValue::Nil)]))]),
    )]);
    assert_eq!(t, expected);
    assert!(bridge
        .diagnostics()
        .iter()
        .any(|d| d.code == LB_PULL_TOO_DEEP));
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
}

#[test]
fn unreadable_guest_strings_are_reported_not_emptied() {
    let (mut bridge, probe, h) = common::instance();
    bridge
        .set_global(h, "x", &HostValue::from("0123456789"))
        .expect("set x");
    bridge.set_global(h, "s", &HostValue::Nil).expect("intern s");
    common::run(&mut bridge, h, "s = x .. x .. x .. x .. x .. x");

    // The guest can no longer back a copy of the 60-byte string.
    probe.set_heap_limit(0);
    let (s, ty) = bridge.get_global(h, "s").expect("best-effort get");
    assert_eq!(ty, LuaType::String);
    assert_eq!(s, HostValue::Nil);
    let codes: Vec<String> = bridge
        .take_diagnostics()
        .into_iter()
        .map(|d| d.code)
        .collect();
    assert_eq!(codes, vec![LB_PULL_UNREADABLE_STRING.to_string()]);
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
}
