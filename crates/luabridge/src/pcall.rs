//! Protected calls. Every path here returns the stack to the depth it found it at.

use luabridge_contracts::{LuaType, StatusCode, MULTRET};
use luabridge_guest_core::Ptr;

use crate::error::ExecutionError;
use crate::marshal::Marshaller;
use crate::value::HostValue;
use crate::{BridgeError, Result};

/// Message carried by the error object on top of the stack.
pub(crate) fn error_message(m: &mut Marshaller<'_>) -> String {
    match m.type_at(-1) {
        LuaType::String | LuaType::Number => m
            .read_string(-1)
            .unwrap_or_else(|| "(error message could not be read)".to_string()),
        ty => format!("(error object is a {ty} value)"),
    }
}

fn failure(m: &mut Marshaller<'_>, base: i32, status: StatusCode) -> BridgeError {
    let message = error_message(m);
    m.restore(base);
    ExecutionError { status, message }.into()
}

/// Calls the function at `base + 1` with the `nargs` values above it and
/// collects every result.
pub(crate) fn protected_call(
    m: &mut Marshaller<'_>,
    base: i32,
    nargs: i32,
) -> Result<Vec<HostValue>> {
    let status = StatusCode::from_raw(m.guest.pcall(m.l, nargs, MULTRET, 0));
    if !status.is_ok() {
        return Err(failure(m, base, status));
    }
    let top = m.depth();
    let results = (base + 1..=top).map(|i| m.pull(i)).collect();
    m.restore(base);
    results
}

pub(crate) fn call_global(
    m: &mut Marshaller<'_>,
    name: &str,
    args: &[HostValue],
) -> Result<Vec<HostValue>> {
    let base = m.depth();
    let name_ptr = m.intern(name)?;
    let found = LuaType::from_raw(m.guest.get_global(m.l, name_ptr));
    if found != LuaType::Function {
        m.restore(base);
        return Err(BridgeError::NotCallable {
            name: name.to_string(),
            found,
        });
    }
    let nargs = match m.push_all(args) {
        Ok(n) => n,
        Err(e) => {
            m.restore(base);
            return Err(e);
        }
    };
    protected_call(m, base, nargs)
}

/// Compiles the source at `src` and runs it with no arguments.
pub(crate) fn run_chunk(m: &mut Marshaller<'_>, src: Ptr) -> Result<Vec<HostValue>> {
    let base = m.depth();
    let status = StatusCode::from_raw(m.guest.load_string(m.l, src));
    if !status.is_ok() {
        return Err(failure(m, base, status));
    }
    protected_call(m, base, 0)
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use luabridge_guest_core::GuestApi;
    use luabridge_sim::SimGuest;

    use super::*;
    use crate::config::BridgeConfig;
    use crate::diagnostics::Diagnostics;
    use crate::ledger::scratch_string;
    use crate::marshal::Shared;
    use crate::registry::{Instance, StateRegistry};

    fn instance(sim: &mut SimGuest) -> (crate::Handle, Rc<RefCell<Instance>>, StateRegistry) {
        let mut reg = StateRegistry::default();
        let h = reg.create(sim).expect("create");
        let inst = reg.get(h).expect("get");
        (h, inst, reg)
    }

    fn shared() -> Shared {
        Shared {
            diagnostics: Diagnostics::new(false, 64),
            config: BridgeConfig::default().quiet(),
        }
    }

    fn run(sim: &mut SimGuest, inst: &Rc<RefCell<Instance>>, h: crate::Handle, src: &str) -> Result<Vec<HostValue>> {
        let ptr = scratch_string(sim, src).expect("scratch");
        let out = {
            let mut m = Marshaller::new(sim, h, inst.clone(), shared());
            run_chunk(&mut m, ptr)
        };
        sim.free(ptr);
        out
    }

    #[test]
    fn results_come_back_in_order() {
        let mut sim = SimGuest::new();
        let (h, inst, _reg) = instance(&mut sim);
        let out = run(&mut sim, &inst, h, "return 1, 'two', 3.5").expect("run");
        assert_eq!(
            out,
            vec![HostValue::Integer(1), HostValue::from("two"), HostValue::Float(3.5)]
        );
        assert_eq!(sim.get_top(inst.borrow().state), 0);
    }

    #[test]
    fn syntax_and_runtime_errors_keep_the_stack_balanced() {
        let mut sim = SimGuest::new();
        let (h, inst, _reg) = instance(&mut sim);

        let err = run(&mut sim, &inst, h, "f(").unwrap_err();
        let exec = err.as_execution().expect("execution error");
        assert_eq!(exec.status, StatusCode::ErrSyntax);

        let err = run(&mut sim, &inst, h, "error('boom')").unwrap_err();
        let exec = err.as_execution().expect("execution error");
        assert_eq!(exec.status, StatusCode::ErrRun);
        assert!(exec.message.contains("boom"), "{}", exec.message);

        assert_eq!(sim.get_top(inst.borrow().state), 0);
    }

    #[test]
    fn non_string_error_objects_are_described() {
        let mut sim = SimGuest::new();
        let (h, inst, _reg) = instance(&mut sim);
        let err = run(&mut sim, &inst, h, "error({})").unwrap_err();
        assert_eq!(
            err.as_execution().map(|e| e.message.as_str()),
            Some("(error object is a table value)")
        );
    }

    #[test]
    fn calling_a_non_function_global_is_not_callable() {
        let mut sim = SimGuest::new();
        let (h, inst, _reg) = instance(&mut sim);
        run(&mut sim, &inst, h, "answer = 42").expect("define");
        let mut m = Marshaller::new(&mut sim, h, inst.clone(), shared());
        let err = call_global(&mut m, "answer", &[]).unwrap_err();
        assert_eq!(
            err,
            BridgeError::NotCallable {
                name: "answer".to_string(),
                found: LuaType::Number,
            }
        );
        let err = call_global(&mut m, "nope", &[]).unwrap_err();
        assert!(matches!(err, BridgeError::NotCallable { found: LuaType::Nil, .. }));
        assert_eq!(m.depth(), 0);
    }
}
