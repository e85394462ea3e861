mod common;

use luabridge::{BridgeError, HostValue, LuaType, StatusCode};

const DEFS: &str = "\
function add(a, b) return a + b end
function pair(x) return x, x .. '!' end
function fail(msg) error(msg) end
function nothing() end
answer = 42
";

#[test]
fn call_global_passes_args_and_collects_results() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(&mut bridge, h, DEFS);

    let out = bridge
        .call_global(h, "add", &[HostValue::Integer(2), HostValue::Float(0.5)])
        .expect("add");
    assert_eq!(out, vec![HostValue::Float(2.5)]);

    let out = bridge
        .call_global(h, "pair", &[HostValue::from("hi")])
        .expect("pair");
    assert_eq!(out, vec![HostValue::from("hi"), HostValue::from("hi!")]);

    let out = bridge.call_global(h, "nothing", &[]).expect("nothing");
    assert!(out.is_empty());
}

#[test]
fn stack_stays_balanced_across_repeated_calls() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(&mut bridge, h, DEFS);

    for i in 0..200 {
        let ok = bridge.call_global(h, "add", &[HostValue::Integer(i), HostValue::Integer(1)]);
        assert_eq!(ok.expect("add"), vec![HostValue::Integer(i + 1)]);
        assert!(bridge
            .call_global(h, "fail", &[HostValue::from("no")])
            .is_err());
        assert!(bridge.call_global(h, "answer", &[]).is_err());
        assert!(bridge
            .call_global(h, "add", &[HostValue::Bytes(vec![0])])
            .is_err());
        assert_eq!(bridge.stack_depth(h).expect("depth"), 0, "iteration {i}");
    }
}

#[test]
fn non_functions_are_not_callable() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(&mut bridge, h, DEFS);

    assert_eq!(
        bridge.call_global(h, "answer", &[]).unwrap_err(),
        BridgeError::NotCallable {
            name: "answer".to_string(),
            found: LuaType::Number,
        }
    );
    assert_eq!(
        bridge.call_global(h, "undefined", &[]).unwrap_err(),
        BridgeError::NotCallable {
            name: "undefined".to_string(),
            found: LuaType::Nil,
        }
    );
}

#[test]
fn guest_errors_become_execution_errors() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(&mut bridge, h, DEFS);

    let err = bridge
        .call_global(h, "fail", &[HostValue::from("kaboom")])
        .unwrap_err();
    let exec = err.as_execution().expect("execution error");
    assert_eq!(exec.status, StatusCode::ErrRun);
    assert_eq!(exec.message, "kaboom");

    let err = bridge.call_global(h, "add", &[HostValue::Integer(1)]).unwrap_err();
    let exec = err.as_execution().expect("execution error");
    assert_eq!(exec.status, StatusCode::ErrRun);
    assert!(exec.message.contains("arithmetic"), "{}", exec.message);

    // Numeric error objects are reported through their string form.
    let err = bridge
        .call_global(h, "fail", &[HostValue::Integer(7)])
        .unwrap_err();
    assert_eq!(err.as_execution().map(|e| e.message.as_str()), Some("7"));
}

#[test]
fn bad_arguments_fail_before_the_call() {
    let (mut bridge, _probe, h) = common::instance();
    common::run(&mut bridge, h, "calls = 0\nfunction count() calls = calls + 1 end");

    let err = bridge
        .call_global(h, "count", &[HostValue::Integer(1), HostValue::Symbol("s".into())])
        .unwrap_err();
    assert!(matches!(err, BridgeError::UnsupportedValueKind { .. }));
    assert_eq!(
        bridge.get_global(h, "calls").expect("get").0,
        HostValue::Integer(0)
    );
    assert_eq!(bridge.stack_depth(h).expect("depth"), 0);
}

#[test]
fn instances_are_independent() {
    let (mut bridge, _probe) = common::bridge();
    let a = bridge.create_instance().expect("a");
    let b = bridge.create_instance().expect("b");
    bridge.set_global(a, "x", &HostValue::Integer(1)).expect("set a");
    bridge.set_global(b, "x", &HostValue::Integer(2)).expect("set b");
    assert_eq!(bridge.get_global(a, "x").expect("get a").0, HostValue::Integer(1));
    assert_eq!(bridge.get_global(b, "x").expect("get b").0, HostValue::Integer(2));
}
