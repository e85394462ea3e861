use std::rc::Rc;

use luabridge_contracts::{LuaType, StatusCode, MULTRET, NATIVE_ERROR, REGISTRY_INDEX};
use luabridge_guest_core::{alloc_c_string, fetch_c_string, GuestApi, GuestCallback, StatePtr};
use luabridge_sim::SimGuest;

fn open(sim: &mut SimGuest) -> StatePtr {
    let l = sim.new_state();
    assert!(!l.is_null(), "new_state failed");
    sim.open_libs(l);
    l
}

fn run(sim: &mut SimGuest, l: StatePtr, src: &str) -> i32 {
    let p = alloc_c_string(sim, src).expect("alloc source");
    let status = sim.load_string(l, p);
    sim.free(p);
    if status != 0 {
        return status;
    }
    sim.pcall(l, 0, MULTRET, 0)
}

fn top_string(sim: &mut SimGuest, l: StatePtr) -> String {
    let p = sim.to_string(l, -1);
    fetch_c_string(sim.heap(), p).expect("string on top")
}

#[test]
fn print_goes_to_the_probe() {
    let mut sim = SimGuest::new();
    let probe = sim.probe();
    let l = open(&mut sim);
    assert_eq!(run(&mut sim, l, "x = 3\nprint(x, 'a', 1.5, nil)"), 0);
    assert_eq!(probe.take_output(), vec!["3\ta\t1.5\tnil".to_string()]);
    assert_eq!(sim.get_top(l), 0);
}

#[test]
fn chunk_results_are_left_on_the_stack() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    let src = "local function add(a, b) return a + b end\nreturn add(2, 3), 'x' .. 1";
    assert_eq!(run(&mut sim, l, src), 0);
    assert_eq!(sim.get_top(l), 2);
    assert_eq!(sim.to_integerx(l, 1), Some(5));
    assert!(sim.is_integer(l, 1));
    assert_eq!(top_string(&mut sim, l), "x1");
}

#[test]
fn syntax_errors_report_chunk_and_line() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    let status = run(&mut sim, l, "f(");
    assert_eq!(StatusCode::from_raw(status), StatusCode::ErrSyntax);
    assert_eq!(
        top_string(&mut sim, l),
        "[string \"f(\"]:1: unexpected symbol near <eof>"
    );
}

#[test]
fn runtime_errors_are_caught_by_pcall() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    let status = run(&mut sim, l, "missing()");
    assert_eq!(StatusCode::from_raw(status), StatusCode::ErrRun);
    assert_eq!(
        top_string(&mut sim, l),
        "attempt to call a nil value (global 'missing')"
    );
    sim.pop(l, 1);

    let status = run(&mut sim, l, "error('boom')");
    assert_eq!(status, StatusCode::ErrRun.raw());
    assert_eq!(top_string(&mut sim, l), "boom");
}

#[test]
fn tables_iterate_in_insertion_order() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    assert_eq!(run(&mut sim, l, "return {10, 20, k = 'v'}"), 0);
    let t = sim.abs_index(l, -1);

    let mut keys = Vec::new();
    sim.push_nil(l);
    while sim.next(l, t) != 0 {
        keys.push(LuaType::from_raw(sim.type_of(l, -2)));
        sim.pop(l, 1);
    }
    assert_eq!(
        keys,
        vec![LuaType::Number, LuaType::Number, LuaType::String]
    );
    assert_eq!(sim.get_top(l), 1);
}

#[test]
fn native_callbacks_see_their_own_frame() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    let cb: GuestCallback = Rc::new(|g: &mut dyn GuestApi, l: StatePtr| {
        let n = g.get_top(l);
        let sum = (1..=n).filter_map(|i| g.to_integerx(l, i)).sum::<i64>();
        g.push_integer(l, sum);
        1
    });
    let ptr = sim.register_native_callback(cb);
    let name = alloc_c_string(&mut sim, "sum").expect("alloc name");
    sim.push_cfunction(l, ptr);
    sim.set_global(l, name);
    sim.free(name);

    sim.push_boolean(l, true);
    assert_eq!(run(&mut sim, l, "return sum(1, 2, 3)"), 0);
    assert_eq!(sim.get_top(l), 2);
    assert_eq!(sim.to_integerx(l, -1), Some(6));
    assert!(sim.to_boolean(l, 1));
}

#[test]
fn native_error_return_raises_the_top_value() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    let cb: GuestCallback = Rc::new(|g: &mut dyn GuestApi, l: StatePtr| {
        let msg = alloc_c_string(g, "host failed").expect("alloc");
        g.push_string(l, msg);
        g.free(msg);
        NATIVE_ERROR
    });
    let ptr = sim.register_native_callback(cb);
    sim.push_cfunction(l, ptr);
    assert_eq!(sim.pcall(l, 0, MULTRET, 0), StatusCode::ErrRun.raw());
    assert_eq!(top_string(&mut sim, l), "host failed");
}

#[test]
fn registry_references_are_reused_after_release() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    sim.push_integer(l, 7);
    let r = sim.reference(l, REGISTRY_INDEX);
    assert!(r > 0);
    assert_eq!(sim.get_top(l), 0);
    assert_eq!(sim.raw_geti(l, REGISTRY_INDEX, i64::from(r)), LuaType::Number.raw());
    sim.pop(l, 1);

    sim.unreference(l, REGISTRY_INDEX, r);
    assert_eq!(sim.raw_geti(l, REGISTRY_INDEX, i64::from(r)), LuaType::Nil.raw());
    sim.pop(l, 1);

    sim.push_boolean(l, false);
    assert_eq!(sim.reference(l, REGISTRY_INDEX), r);
}

#[test]
fn probe_counts_host_allocations_and_double_frees() {
    let mut sim = SimGuest::new();
    let probe = sim.probe();
    let a = sim.malloc(8);
    let b = sim.malloc(8);
    assert_eq!(probe.live_host_allocations(), 2);
    sim.free(a);
    sim.free(a);
    sim.free(b);
    assert_eq!(probe.live_host_allocations(), 0);
    assert_eq!(probe.double_frees(), 1);
    assert_eq!(probe.malloc_calls(), 2);
    assert_eq!(probe.free_calls(), 3);
}

#[test]
fn heap_limit_makes_malloc_fail() {
    let mut sim = SimGuest::with_heap_limit(64);
    assert!(!sim.malloc(16).is_null());
    assert!(sim.malloc(4096).is_null());
}

#[test]
fn opaque_values_have_their_own_type_tags() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    assert_eq!(run(&mut sim, l, "return newuserdata(), newthread()"), 0);
    assert_eq!(sim.type_of(l, 1), LuaType::Userdata.raw());
    assert_eq!(sim.type_of(l, 2), LuaType::Thread.raw());
    assert_eq!(sim.type_of(l, 3), LuaType::None.raw());
}

#[test]
fn deep_recursion_is_a_runtime_error() {
    let mut sim = SimGuest::new();
    let l = open(&mut sim);
    let status = run(&mut sim, l, "function f() return f() end\nf()");
    assert_eq!(status, StatusCode::ErrRun.raw());
    assert_eq!(top_string(&mut sim, l), "stack overflow");
}
