//! Tree-walking evaluator for parsed chunks.
//!
//! Functions see globals, their parameters and their own locals; there is no
//! upvalue capture.

use std::rc::Rc;

use luabridge_contracts::NATIVE_ERROR;
use luabridge_guest_core::{Ptr, StatePtr};

use crate::parser::{BinOp, Block, Expr, Field, Stmt, UnOp};
use crate::stdlib;
use crate::value::{fmt_number, parse_number, Table, Value};
use crate::SimGuest;

const MAX_CALL_DEPTH: usize = 100;

/// A raised guest error; the payload is the error object.
#[derive(Debug)]
pub(crate) struct LuaError(pub(crate) Value);

impl LuaError {
    pub(crate) fn msg(m: impl AsRef<str>) -> Self {
        LuaError(Value::str(m.as_ref()))
    }
}

pub(crate) fn tostring(v: &Value) -> String {
    match v {
        Value::Nil => "nil".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Num(n) => fmt_number(*n),
        Value::Str(s) => s.to_string(),
        Value::Table(t) => format!("table: 0x{t:08x}"),
        Value::LuaFn(f) => format!("function: {:p}", Rc::as_ptr(f)),
        Value::Builtin(b) => format!("function: builtin: {}", b.ptr()),
        Value::Native(p) => format!("function: native: {p}"),
        Value::Userdata(u) => format!("userdata: 0x{u:08x}"),
        Value::Thread(t) => format!("thread: 0x{t:08x}"),
    }
}

enum Flow {
    Normal,
    Return(Vec<Value>),
}

#[derive(Default)]
struct Env {
    locals: Vec<(Rc<str>, Value)>,
}

impl Env {
    fn lookup(&self, name: &str) -> Option<&Value> {
        self.locals
            .iter()
            .rev()
            .find(|(n, _)| &**n == name)
            .map(|(_, v)| v)
    }

    fn assign(&mut self, name: &str, value: Value) -> Result<(), Value> {
        match self.locals.iter_mut().rev().find(|(n, _)| &**n == name) {
            Some(slot) => {
                slot.1 = value;
                Ok(())
            }
            None => Err(value),
        }
    }
}

fn adjust(mut vals: Vec<Value>, n: usize) -> Vec<Value> {
    vals.resize(n, Value::Nil);
    vals
}

fn first(vals: Vec<Value>) -> Value {
    vals.into_iter().next().unwrap_or(Value::Nil)
}

fn type_name(v: &Value) -> &'static str {
    v.type_tag().as_str()
}

fn describe(expr: &Expr, env: &Env) -> String {
    match expr {
        Expr::Name(n) if env.lookup(n).is_some() => format!(" (local '{n}')"),
        Expr::Name(n) => format!(" (global '{n}')"),
        Expr::Index(_, key) => match &**key {
            Expr::Const(Value::Str(s)) => format!(" (field '{s}')"),
            _ => String::new(),
        },
        _ => String::new(),
    }
}

fn arith_operand(v: &Value) -> Option<Value> {
    match v {
        Value::Int(_) | Value::Num(_) => Some(v.clone()),
        Value::Str(s) => parse_number(s),
        _ => None,
    }
}

fn arith(op: BinOp, a: &Value, b: &Value) -> Result<Value, LuaError> {
    let (x, y) = match (arith_operand(a), arith_operand(b)) {
        (Some(x), Some(y)) => (x, y),
        (None, _) => {
            return Err(LuaError::msg(format!(
                "attempt to perform arithmetic on a {} value",
                type_name(a)
            )))
        }
        (_, None) => {
            return Err(LuaError::msg(format!(
                "attempt to perform arithmetic on a {} value",
                type_name(b)
            )))
        }
    };
    if let (Value::Int(i), Value::Int(j), false) = (&x, &y, op == BinOp::Div) {
        return Ok(Value::Int(match op {
            BinOp::Add => i.wrapping_add(*j),
            BinOp::Sub => i.wrapping_sub(*j),
            _ => i.wrapping_mul(*j),
        }));
    }
    let (p, q) = (
        x.to_number().unwrap_or(f64::NAN),
        y.to_number().unwrap_or(f64::NAN),
    );
    Ok(Value::Num(match op {
        BinOp::Add => p + q,
        BinOp::Sub => p - q,
        BinOp::Mul => p * q,
        _ => p / q,
    }))
}

fn concat(a: &Value, b: &Value) -> Result<Value, LuaError> {
    let piece = |v: &Value| match v {
        Value::Str(_) | Value::Int(_) | Value::Num(_) => Ok(tostring(v)),
        other => Err(LuaError::msg(format!(
            "attempt to concatenate a {} value",
            type_name(other)
        ))),
    };
    let mut s = piece(a)?;
    s.push_str(&piece(b)?);
    Ok(Value::str(&s))
}

fn less(op: BinOp, a: &Value, b: &Value) -> Result<bool, LuaError> {
    let ord = match (a, b) {
        (Value::Int(i), Value::Int(j)) => i.partial_cmp(j),
        (Value::Int(_) | Value::Num(_), Value::Int(_) | Value::Num(_)) => {
            a.to_number().partial_cmp(&b.to_number())
        }
        (Value::Str(s), Value::Str(t)) => s.partial_cmp(t),
        _ if type_name(a) == type_name(b) => {
            return Err(LuaError::msg(format!(
                "attempt to compare two {} values",
                type_name(a)
            )))
        }
        _ => {
            return Err(LuaError::msg(format!(
                "attempt to compare {} with {}",
                type_name(a),
                type_name(b)
            )))
        }
    };
    let Some(ord) = ord else {
        return Ok(false);
    };
    Ok(match op {
        BinOp::Lt => ord.is_lt(),
        BinOp::Le => ord.is_le(),
        BinOp::Gt => ord.is_gt(),
        _ => ord.is_ge(),
    })
}

impl SimGuest {
    fn table_mut(&mut self, l: StatePtr, t: usize) -> Result<&mut Table, LuaError> {
        self.state_mut(l)
            .and_then(|st| st.tables.get_mut(t))
            .ok_or_else(|| LuaError::msg("table belongs to a closed state"))
    }

    pub(crate) fn new_table(&mut self, l: StatePtr, capacity: usize) -> Result<Value, LuaError> {
        let st = self
            .state_mut(l)
            .ok_or_else(|| LuaError::msg("state is closed"))?;
        st.tables.push(Table::with_capacity(capacity));
        Ok(Value::Table(st.tables.len() - 1))
    }

    fn index(&mut self, l: StatePtr, obj: &Value, key: &Value) -> Result<Value, LuaError> {
        match obj {
            Value::Table(t) => Ok(self.table_mut(l, *t)?.get(key)),
            other => Err(LuaError::msg(format!(
                "attempt to index a {} value",
                type_name(other)
            ))),
        }
    }

    fn set_index(
        &mut self,
        l: StatePtr,
        obj: &Value,
        key: Value,
        value: Value,
    ) -> Result<(), LuaError> {
        let Value::Table(t) = obj else {
            return Err(LuaError::msg(format!(
                "attempt to index a {} value",
                type_name(obj)
            )));
        };
        let key_is_nil = matches!(key, Value::Nil);
        if self.table_mut(l, *t)?.set(key, value) {
            Ok(())
        } else if key_is_nil {
            Err(LuaError::msg("table index is nil"))
        } else {
            Err(LuaError::msg("table index is NaN"))
        }
    }

    fn global(&self, l: StatePtr, name: &str) -> Value {
        self.state(l)
            .and_then(|st| st.globals.get(name).cloned())
            .unwrap_or(Value::Nil)
    }

    fn set_global_value(&mut self, l: StatePtr, name: Rc<str>, value: Value) {
        if let Some(st) = self.state_mut(l) {
            match value {
                Value::Nil => {
                    st.globals.remove(&name);
                }
                value => {
                    st.globals.insert(name, value);
                }
            }
        }
    }

    /// Calls `f` with `args`, returning every result.
    pub(crate) fn call_value(
        &mut self,
        l: StatePtr,
        f: Value,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, LuaError> {
        self.call_depth += 1;
        let out = if self.call_depth > MAX_CALL_DEPTH {
            Err(LuaError::msg("stack overflow"))
        } else {
            self.dispatch(l, f, args)
        };
        self.call_depth -= 1;
        out
    }

    fn dispatch(&mut self, l: StatePtr, f: Value, args: Vec<Value>) -> Result<Vec<Value>, LuaError> {
        match f {
            Value::LuaFn(func) => {
                let mut env = Env::default();
                let mut args = args.into_iter();
                for p in &func.params {
                    env.locals
                        .push((p.clone(), args.next().unwrap_or(Value::Nil)));
                }
                match self.exec_block(l, &func.body, &mut env)? {
                    Flow::Return(vals) => Ok(vals),
                    Flow::Normal => Ok(Vec::new()),
                }
            }
            Value::Builtin(b) => stdlib::call(self, b, args),
            Value::Native(ptr) => self.call_native(l, ptr, args),
            other => Err(LuaError::msg(format!(
                "attempt to call a {} value",
                type_name(&other)
            ))),
        }
    }

    /// Runs a host trampoline in a fresh frame whose index 1 is the first argument.
    fn call_native(
        &mut self,
        l: StatePtr,
        ptr: Ptr,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, LuaError> {
        let Some(cb) = self.callbacks.get(&ptr.0).cloned() else {
            return Err(LuaError::msg(format!(
                "attempt to call a released native function ({ptr})"
            )));
        };
        let st = self
            .state_mut(l)
            .ok_or_else(|| LuaError::msg("state is closed"))?;
        let base = st.stack.len();
        st.frames.push(base);
        st.stack.extend(args);

        let n = cb(self, l);

        let st = self
            .state_mut(l)
            .ok_or_else(|| LuaError::msg("state closed during a native call"))?;
        let len = st.stack.len().max(base);
        let out = if n == NATIVE_ERROR {
            Err(LuaError(st.stack.last().cloned().unwrap_or(Value::Nil)))
        } else {
            let n = usize::try_from(n).unwrap_or(0).min(len - base);
            Ok(st.stack[len - n..].to_vec())
        };
        st.stack.truncate(base);
        st.frames.pop();
        out
    }

    fn exec_block(&mut self, l: StatePtr, block: &Block, env: &mut Env) -> Result<Flow, LuaError> {
        let mark = env.locals.len();
        let mut flow = Flow::Normal;
        for stmt in block {
            if let Flow::Return(vals) = self.exec_stmt(l, stmt, env)? {
                flow = Flow::Return(vals);
                break;
            }
        }
        env.locals.truncate(mark);
        Ok(flow)
    }

    fn exec_stmt(&mut self, l: StatePtr, stmt: &Stmt, env: &mut Env) -> Result<Flow, LuaError> {
        match stmt {
            Stmt::Local(names, exprs) => {
                let vals = adjust(self.eval_multi(l, exprs, env)?, names.len());
                for (name, v) in names.iter().zip(vals) {
                    env.locals.push((name.clone(), v));
                }
            }
            Stmt::Assign(targets, exprs) => {
                let vals = adjust(self.eval_multi(l, exprs, env)?, targets.len());
                for (target, v) in targets.iter().zip(vals) {
                    match target {
                        Expr::Name(name) => {
                            if let Err(v) = env.assign(name, v) {
                                self.set_global_value(l, name.clone(), v);
                            }
                        }
                        Expr::Index(obj, key) => {
                            let obj = self.eval(l, obj, env)?;
                            let key = self.eval(l, key, env)?;
                            self.set_index(l, &obj, key, v)?;
                        }
                        _ => return Err(LuaError::msg("cannot assign to this expression")),
                    }
                }
            }
            Stmt::Call(call) => {
                self.eval_call(l, call, env)?;
            }
            Stmt::Return(exprs) => return Ok(Flow::Return(self.eval_multi(l, exprs, env)?)),
            Stmt::If(arms, otherwise) => {
                for (cond, body) in arms {
                    if self.eval(l, cond, env)?.truthy() {
                        return self.exec_block(l, body, env);
                    }
                }
                if let Some(body) = otherwise {
                    return self.exec_block(l, body, env);
                }
            }
            Stmt::While(cond, body) => {
                while self.eval(l, cond, env)?.truthy() {
                    if let Flow::Return(vals) = self.exec_block(l, body, env)? {
                        return Ok(Flow::Return(vals));
                    }
                }
            }
            Stmt::Do(body) => return self.exec_block(l, body, env),
        }
        Ok(Flow::Normal)
    }

    fn eval_multi(
        &mut self,
        l: StatePtr,
        exprs: &[Expr],
        env: &mut Env,
    ) -> Result<Vec<Value>, LuaError> {
        let mut out = Vec::with_capacity(exprs.len());
        for (i, expr) in exprs.iter().enumerate() {
            if i + 1 == exprs.len() && matches!(expr, Expr::Call(..)) {
                out.extend(self.eval_call(l, expr, env)?);
            } else {
                out.push(self.eval(l, expr, env)?);
            }
        }
        Ok(out)
    }

    fn eval_call(&mut self, l: StatePtr, expr: &Expr, env: &mut Env) -> Result<Vec<Value>, LuaError> {
        let Expr::Call(callee, args) = expr else {
            return Ok(vec![self.eval(l, expr, env)?]);
        };
        let f = self.eval(l, callee, env)?;
        if !matches!(f, Value::LuaFn(_) | Value::Builtin(_) | Value::Native(_)) {
            return Err(LuaError::msg(format!(
                "attempt to call a {} value{}",
                type_name(&f),
                describe(callee, env)
            )));
        }
        let args = self.eval_multi(l, args, env)?;
        self.call_value(l, f, args)
    }

    fn eval(&mut self, l: StatePtr, expr: &Expr, env: &mut Env) -> Result<Value, LuaError> {
        match expr {
            Expr::Const(v) => Ok(v.clone()),
            Expr::Name(name) => Ok(match env.lookup(name) {
                Some(v) => v.clone(),
                None => self.global(l, name),
            }),
            Expr::Index(obj, key) => {
                let o = self.eval(l, obj, env)?;
                let k = self.eval(l, key, env)?;
                if !matches!(o, Value::Table(_)) {
                    return Err(LuaError::msg(format!(
                        "attempt to index a {} value{}",
                        type_name(&o),
                        describe(obj, env)
                    )));
                }
                self.index(l, &o, &k)
            }
            Expr::Call(..) => Ok(first(self.eval_call(l, expr, env)?)),
            Expr::Function(f) => Ok(Value::LuaFn(f.clone())),
            Expr::Table(fields) => {
                let t = self.new_table(l, fields.len())?;
                let mut n = 1i64;
                for (i, field) in fields.iter().enumerate() {
                    match field {
                        Field::Positional(e) if i + 1 == fields.len() => {
                            for v in self.eval_multi(l, std::slice::from_ref(e), env)? {
                                self.set_index(l, &t, Value::Int(n), v)?;
                                n += 1;
                            }
                        }
                        Field::Positional(e) => {
                            let v = self.eval(l, e, env)?;
                            self.set_index(l, &t, Value::Int(n), v)?;
                            n += 1;
                        }
                        Field::Keyed(k, v) => {
                            let k = self.eval(l, k, env)?;
                            let v = self.eval(l, v, env)?;
                            self.set_index(l, &t, k, v)?;
                        }
                    }
                }
                Ok(t)
            }
            Expr::Binary(op, a, b) => {
                let a = self.eval(l, a, env)?;
                let b = self.eval(l, b, env)?;
                match op {
                    BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div => arith(*op, &a, &b),
                    BinOp::Concat => concat(&a, &b),
                    BinOp::Eq => Ok(Value::Bool(a.raw_equals(&b))),
                    BinOp::Ne => Ok(Value::Bool(!a.raw_equals(&b))),
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
                        Ok(Value::Bool(less(*op, &a, &b)?))
                    }
                }
            }
            Expr::Unary(op, operand) => {
                let v = self.eval(l, operand, env)?;
                match op {
                    UnOp::Not => Ok(Value::Bool(!v.truthy())),
                    UnOp::Neg => match arith_operand(&v) {
                        Some(Value::Int(i)) => Ok(Value::Int(i.wrapping_neg())),
                        Some(n) => Ok(Value::Num(-n.to_number().unwrap_or(f64::NAN))),
                        None => Err(LuaError::msg(format!(
                            "attempt to perform arithmetic on a {} value",
                            type_name(&v)
                        ))),
                    },
                    UnOp::Len => match &v {
                        Value::Str(s) => Ok(Value::Int(s.len() as i64)),
                        Value::Table(t) => Ok(Value::Int(self.table_mut(l, *t)?.border())),
                        other => Err(LuaError::msg(format!(
                            "attempt to get length of a {} value",
                            type_name(other)
                        ))),
                    },
                }
            }
            Expr::And(a, b) => {
                let a = self.eval(l, a, env)?;
                if a.truthy() {
                    self.eval(l, b, env)
                } else {
                    Ok(a)
                }
            }
            Expr::Or(a, b) => {
                let a = self.eval(l, a, env)?;
                if a.truthy() {
                    Ok(a)
                } else {
                    self.eval(l, b, env)
                }
            }
        }
    }
}
