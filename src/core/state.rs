//! Stateful cells and the var/namespace surface: atoms,
//! volatiles, delays, promises, dynamic binding frames, taps,
//! and `ex-info` errors. Single-threaded throughout: `swap!` is
//! read-apply-write with no retry loop because nothing can
//! intervene.

use crate::{
    common::error::{Error, ErrorKind},
    core::{expect_at_least, expect_exact, expect_range, type_error},
    runtime::{
        env::VarRef,
        heap::ObjRef,
        rt::Rt,
        value::{AtomCell, BuiltinFn, DelayCell, HeapObj, Value},
    },
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("atom", atom),
    ("deref", deref),
    ("reset!", reset_bang),
    ("swap!", swap_bang),
    ("compare-and-set!", compare_and_set),
    ("add-watch", add_watch),
    ("remove-watch", remove_watch),
    ("set-validator!", set_validator),
    ("volatile!", volatile),
    ("vreset!", vreset),
    ("vswap!", vswap),
    ("delay*", delay_star),
    ("force", force),
    ("promise", promise),
    ("deliver", deliver),
    ("var-get", var_get),
    ("var-set", var_set),
    ("alter-var-root", alter_var_root),
    ("intern", intern),
    ("resolve", resolve),
    ("find-var", find_var),
    ("push-thread-bindings", push_thread_bindings),
    ("pop-thread-bindings", pop_thread_bindings),
    ("in-ns", in_ns),
    ("create-ns", create_ns),
    ("find-ns", find_ns),
    ("ns-name", ns_name),
    ("all-ns", all_ns),
    ("tap>", tap),
    ("add-tap", add_tap),
    ("remove-tap", remove_tap),
    ("ex-info", ex_info),
    ("ex-message", ex_message),
    ("ex-data", ex_data),
    ("assert*", assert_star),
];

fn atom_ref(rt: &Rt, name: &str, v: Value) -> Result<ObjRef, Error> {
    match v {
        Value::Obj(r) if matches!(rt.heap.get(r), HeapObj::Atom(_)) => Ok(r),
        bad => Err(type_error(rt, name, "an atom", bad)),
    }
}

fn atom(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("atom", args, 1)?;
    Ok(rt.alloc(HeapObj::Atom(AtomCell {
        value: args[0],
        watches: vec![],
        validator: None,
    })))
}

fn deref(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("deref", args, 1)?;
    match args[0] {
        Value::Var(var) => {
            if !rt.env.var(var).bound {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!("var {} is unbound", rt.env.var(var).name),
                ));
            }
            Ok(rt.env.deref_var(var))
        }
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Atom(cell) => Ok(cell.value),
            HeapObj::Volatile(v) => Ok(*v),
            HeapObj::Delay(_) => force(rt, args),
            HeapObj::Promise(p) => match p {
                Some(v) => Ok(*v),
                None => Err(Error::eval(
                    ErrorKind::TypeError,
                    "deref on an undelivered promise would block forever",
                )),
            },
            HeapObj::Reduced(v) => Ok(*v),
            _ => Err(type_error(rt, "deref", "a reference", args[0])),
        },
        bad => Err(type_error(rt, "deref", "a reference", bad)),
    }
}

/// Runs the validator, then writes, then notifies watches in
/// registration order.
fn write_atom(rt: &mut Rt, r: ObjRef, next: Value) -> Result<Value, Error> {
    let (old, validator, watches) = match rt.heap.get(r) {
        HeapObj::Atom(cell) => (cell.value, cell.validator, cell.watches.clone()),
        _ => unreachable!(),
    };

    if let Some(validator) = validator {
        let mark = rt.protect(&[Value::Obj(r), next]);
        let verdict = rt.call(validator, &[next]);
        let next_now = rt.recall(mark, 1);
        rt.unprotect(mark);
        if !verdict?.is_truthy() {
            let shown = rt.pr_str(next_now)?;
            return Err(Error::eval(
                ErrorKind::AssertionError,
                &format!("validator rejected {}", shown),
            ));
        }
    }

    match rt.heap.get_mut(r) {
        HeapObj::Atom(cell) => cell.value = next,
        _ => unreachable!(),
    }

    // watches see the atom, the old value, and the new value
    let mark = rt.protect(&[Value::Obj(r), old, next]);
    for (key, watch) in watches {
        let wm = rt.protect(&[key, watch]);
        let atom_v = rt.recall(mark, 0);
        let old_v = rt.recall(mark, 1);
        let new_v = rt.recall(mark, 2);
        let key = rt.recall(wm, 0);
        let watch = rt.recall(wm, 1);
        rt.unprotect(wm);
        let outcome = rt.call(watch, &[key, atom_v, old_v, new_v]);
        if let Err(e) = outcome {
            rt.unprotect(mark);
            return Err(e);
        }
    }
    let next = rt.recall(mark, 2);
    rt.unprotect(mark);
    Ok(next)
}

fn reset_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("reset!", args, 2)?;
    let r = atom_ref(rt, "reset!", args[0])?;
    write_atom(rt, r, args[1])
}

/// Read, apply, write. No retry: the runtime is single-threaded,
/// so nothing can have intervened.
fn swap_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("swap!", args, 2)?;
    let r = atom_ref(rt, "swap!", args[0])?;
    let current = match rt.heap.get(r) {
        HeapObj::Atom(cell) => cell.value,
        _ => unreachable!(),
    };

    let mark = rt.protect(args);
    let f = rt.recall(mark, 1);
    let mut call_args = vec![current];
    for i in 2..args.len() {
        call_args.push(rt.recall(mark, i));
    }
    let next = rt.call(f, &call_args);
    let atom_v = rt.recall(mark, 0);
    rt.unprotect(mark);
    let next = next?;

    let r = atom_ref(rt, "swap!", atom_v)?;
    write_atom(rt, r, next)
}

fn compare_and_set(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("compare-and-set!", args, 3)?;
    let r = atom_ref(rt, "compare-and-set!", args[0])?;
    let current = match rt.heap.get(r) {
        HeapObj::Atom(cell) => cell.value,
        _ => unreachable!(),
    };
    let mark = rt.protect(args);
    let same = rt.equal(current, args[1]);
    let atom_v = rt.recall(mark, 0);
    let next = rt.recall(mark, 2);
    rt.unprotect(mark);
    if same? {
        let r = atom_ref(rt, "compare-and-set!", atom_v)?;
        write_atom(rt, r, next)?;
        Ok(Value::Bool(true))
    } else {
        Ok(Value::Bool(false))
    }
}

fn add_watch(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("add-watch", args, 3)?;
    let r = atom_ref(rt, "add-watch", args[0])?;
    let (key, watch) = (args[1], args[2]);
    match rt.heap.get_mut(r) {
        HeapObj::Atom(cell) => {
            cell.watches.retain(|(k, _)| *k != key);
            cell.watches.push((key, watch));
        }
        _ => unreachable!(),
    }
    Ok(args[0])
}

fn remove_watch(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("remove-watch", args, 2)?;
    let r = atom_ref(rt, "remove-watch", args[0])?;
    let key = args[1];
    let stale: Vec<(Value, Value)> = match rt.heap.get(r) {
        HeapObj::Atom(cell) => cell
            .watches
            .iter()
            .filter(|(k, _)| rt.heap.equal(*k, key))
            .cloned()
            .collect(),
        _ => unreachable!(),
    };
    match rt.heap.get_mut(r) {
        HeapObj::Atom(cell) => {
            cell.watches.retain(|entry| !stale.contains(entry));
        }
        _ => unreachable!(),
    }
    Ok(args[0])
}

fn set_validator(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("set-validator!", args, 2)?;
    let r = atom_ref(rt, "set-validator!", args[0])?;
    let validator = match args[1] {
        Value::Nil => None,
        f => Some(f),
    };
    match rt.heap.get_mut(r) {
        HeapObj::Atom(cell) => cell.validator = validator,
        _ => unreachable!(),
    }
    Ok(Value::Nil)
}

fn volatile(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("volatile!", args, 1)?;
    Ok(rt.alloc(HeapObj::Volatile(args[0])))
}

fn vreset(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("vreset!", args, 2)?;
    match args[0] {
        Value::Obj(r) if matches!(rt.heap.get(r), HeapObj::Volatile(_)) => {
            *rt.heap.get_mut(r) = HeapObj::Volatile(args[1]);
            Ok(args[1])
        }
        bad => Err(type_error(rt, "vreset!", "a volatile", bad)),
    }
}

fn vswap(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("vswap!", args, 2)?;
    let current = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Volatile(v) => *v,
            _ => return Err(type_error(rt, "vswap!", "a volatile", args[0])),
        },
        bad => return Err(type_error(rt, "vswap!", "a volatile", bad)),
    };

    let mark = rt.protect(args);
    let f = rt.recall(mark, 1);
    let mut call_args = vec![current];
    for i in 2..args.len() {
        call_args.push(rt.recall(mark, i));
    }
    let next = rt.call(f, &call_args);
    let cell = rt.recall(mark, 0);
    rt.unprotect(mark);
    let next = next?;

    match cell {
        Value::Obj(r) => {
            *rt.heap.get_mut(r) = HeapObj::Volatile(next);
            Ok(next)
        }
        _ => unreachable!(),
    }
}

/// The primitive under the `delay` macro.
fn delay_star(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("delay*", args, 1)?;
    Ok(rt.alloc(HeapObj::Delay(DelayCell {
        thunk: args[0],
        value: None,
    })))
}

/// Forces a delay, caching the result; anything else passes
/// through.
fn force(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("force", args, 1)?;
    let r = match args[0] {
        Value::Obj(r) if matches!(rt.heap.get(r), HeapObj::Delay(_)) => r,
        other => return Ok(other),
    };
    let (thunk, cached) = match rt.heap.get(r) {
        HeapObj::Delay(d) => (d.thunk, d.value),
        _ => unreachable!(),
    };
    if let Some(v) = cached {
        return Ok(v);
    }

    let mark = rt.protect(&[Value::Obj(r)]);
    let value = rt.call(thunk, &[]);
    let cell = rt.recall(mark, 0);
    rt.unprotect(mark);
    let value = value?;

    match cell {
        Value::Obj(r) => match rt.heap.get_mut(r) {
            HeapObj::Delay(d) => d.value = Some(value),
            _ => unreachable!(),
        },
        _ => unreachable!(),
    }
    Ok(value)
}

fn promise(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("promise", args, 0)?;
    Ok(rt.alloc(HeapObj::Promise(None)))
}

/// First delivery wins; later ones are ignored.
fn deliver(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("deliver", args, 2)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get_mut(r) {
            HeapObj::Promise(p) => {
                if p.is_none() {
                    *p = Some(args[1]);
                }
                Ok(args[0])
            }
            _ => Err(type_error(rt, "deliver", "a promise", args[0])),
        },
        bad => Err(type_error(rt, "deliver", "a promise", bad)),
    }
}

// -- vars ------------------------------------------------------

fn expect_var(rt: &Rt, name: &str, v: Value) -> Result<VarRef, Error> {
    match v {
        Value::Var(var) => Ok(var),
        bad => Err(type_error(rt, name, "a var", bad)),
    }
}

fn var_get(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("var-get", args, 1)?;
    let var = expect_var(rt, "var-get", args[0])?;
    Ok(rt.env.deref_var(var))
}

/// Writes the newest dynamic binding; the var must be bound by a
/// `binding` form.
fn var_set(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("var-set", args, 2)?;
    let var = expect_var(rt, "var-set", args[0])?;
    if !rt.env.set_dynamic(var, args[1]) {
        return Err(Error::eval(
            ErrorKind::TypeError,
            &format!(
                "can't var-set {} - it has no active dynamic binding",
                rt.env.var(var).name
            ),
        ));
    }
    Ok(args[1])
}

fn alter_var_root(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("alter-var-root", args, 2)?;
    let var = expect_var(rt, "alter-var-root", args[0])?;
    let current = rt.env.var(var).root;

    let mark = rt.protect(args);
    let f = rt.recall(mark, 1);
    let mut call_args = vec![current];
    for i in 2..args.len() {
        call_args.push(rt.recall(mark, i));
    }
    let next = rt.call(f, &call_args);
    rt.unprotect(mark);
    let next = next?;

    rt.env.bind_root(var, next);
    Ok(next)
}

fn sym_parts(rt: &Rt, name: &str, v: Value) -> Result<(Option<String>, String), Error> {
    match v {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Sym { ns, name, .. } => Ok((ns.clone(), name.clone())),
            _ => Err(type_error(rt, name, "a symbol", v)),
        },
        bad => Err(type_error(rt, name, "a symbol", bad)),
    }
}

fn intern(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("intern", args, 2, 3)?;
    let (_, ns_name) = sym_parts(rt, "intern", args[0])?;
    let ns = rt.env.find_ns(&ns_name).ok_or_else(|| {
        Error::eval(
            ErrorKind::UndefinedSymbol,
            &format!("namespace {} does not exist", ns_name),
        )
    })?;
    let (_, var_name) = sym_parts(rt, "intern", args[1])?;
    let var = rt.env.intern(ns, &var_name);
    if let Some(value) = args.get(2) {
        rt.env.bind_root(var, *value);
    }
    Ok(Value::Var(var))
}

fn resolve(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("resolve", args, 1)?;
    let (ns, name) = sym_parts(rt, "resolve", args[0])?;
    match rt.env.resolve(rt.env.current, ns.as_deref(), &name) {
        Some(var) => Ok(Value::Var(var)),
        None => Ok(Value::Nil),
    }
}

fn find_var(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("find-var", args, 1)?;
    let (ns, name) = sym_parts(rt, "find-var", args[0])?;
    let ns_name = match ns {
        Some(ns) => ns,
        None => {
            return Err(Error::eval(
                ErrorKind::TypeError,
                "find-var expects a namespace-qualified symbol",
            ))
        }
    };
    let target = match rt.env.find_ns(&ns_name) {
        Some(target) => target,
        None => return Ok(Value::Nil),
    };
    match rt.env.ns(target).mappings.get(&name) {
        Some(var) => Ok(Value::Var(*var)),
        None => Ok(Value::Nil),
    }
}

// -- dynamic binding frames ------------------------------------

/// `(push-thread-bindings {var value ...})`: one frame per call,
/// popped by `pop-thread-bindings`. The `binding` macro pairs
/// them through try/finally so every exit path balances.
fn push_thread_bindings(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("push-thread-bindings", args, 1)?;
    let entries = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Map { entries, .. } => entries.clone(),
            _ => return Err(type_error(rt, "push-thread-bindings", "a map of vars", args[0])),
        },
        bad => return Err(type_error(rt, "push-thread-bindings", "a map of vars", bad)),
    };

    let mut frame = vec![];
    for (k, v) in entries {
        let var = expect_var(rt, "push-thread-bindings", k)?;
        if !rt.env.var(var).dynamic {
            return Err(Error::eval(
                ErrorKind::TypeError,
                &format!("can't dynamically bind non-dynamic var {}", rt.env.var(var).name),
            ));
        }
        frame.push((var, v));
    }
    rt.env.push_frame(frame);
    Ok(Value::Nil)
}

fn pop_thread_bindings(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("pop-thread-bindings", args, 0)?;
    if !rt.env.pop_frame() {
        return Err(Error::eval(
            ErrorKind::InternalError,
            "pop-thread-bindings with no frame pushed",
        ));
    }
    Ok(Value::Nil)
}

// -- namespaces ------------------------------------------------

fn in_ns(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("in-ns", args, 1)?;
    let (_, name) = sym_parts(rt, "in-ns", args[0])?;
    let ns = rt.env.create_ns(&name);
    rt.env.current = ns;
    Ok(Value::Nil)
}

fn create_ns(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("create-ns", args, 1)?;
    let (_, name) = sym_parts(rt, "create-ns", args[0])?;
    rt.env.create_ns(&name);
    Ok(Value::Nil)
}

fn find_ns(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("find-ns", args, 1)?;
    let (_, name) = sym_parts(rt, "find-ns", args[0])?;
    match rt.env.find_ns(&name) {
        Some(_) => rt_sym(rt, &name),
        None => Ok(Value::Nil),
    }
}

fn rt_sym(rt: &mut Rt, name: &str) -> Result<Value, Error> {
    Ok(rt.sym_value(None, name))
}

fn ns_name(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("ns-name", args, 0, 1)?;
    match args.first() {
        None => {
            let name = rt.env.ns(rt.env.current).name.clone();
            rt_sym(rt, &name)
        }
        Some(v) => {
            let (_, name) = sym_parts(rt, "ns-name", *v)?;
            match rt.env.find_ns(&name) {
                Some(_) => rt_sym(rt, &name),
                None => Err(Error::eval(
                    ErrorKind::UndefinedSymbol,
                    &format!("namespace {} does not exist", name),
                )),
            }
        }
    }
}

fn all_ns(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("all-ns", args, 0)?;
    let names: Vec<String> = rt
        .env
        .all_ns()
        .map(|r| rt.env.ns(r).name.clone())
        .collect();
    let mut symbols = vec![];
    for name in names {
        symbols.push(rt.sym_value(None, &name));
    }
    Ok(rt.list_value(symbols))
}

// -- taps ------------------------------------------------------

fn tap(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("tap>", args, 1)?;
    let taps = rt.env.taps.clone();
    let mark = rt.protect(&[args[0]]);
    for t in taps {
        let tm = rt.protect(&[t]);
        let value = rt.recall(mark, 0);
        let t = rt.recall(tm, 0);
        rt.unprotect(tm);
        let outcome = rt.call(t, &[value]);
        if let Err(e) = outcome {
            rt.unprotect(mark);
            return Err(e);
        }
    }
    rt.unprotect(mark);
    Ok(Value::Bool(true))
}

fn add_tap(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("add-tap", args, 1)?;
    rt.env.taps.push(args[0]);
    Ok(Value::Nil)
}

fn remove_tap(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("remove-tap", args, 1)?;
    let target = args[0];
    rt.env.taps.retain(|t| *t != target);
    Ok(Value::Nil)
}

// -- ex-info ---------------------------------------------------

/// `(ex-info msg data)`: a map payload with `:message` and
/// `:data`, thrown with `throw`, picked apart with `ex-message`
/// and `ex-data`.
fn ex_info(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("ex-info", args, 2)?;
    let message_key = rt.kw("message");
    let data_key = rt.kw("data");
    Ok(rt.map_value(vec![(message_key, args[0]), (data_key, args[1])]))
}

/// The primitive under the `assert` macro.
fn assert_star(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("assert*", args, 2)?;
    if args[0].is_truthy() {
        return Ok(Value::Nil);
    }
    let message = rt.display_str(args[1])?;
    Err(Error::eval(ErrorKind::AssertionError, &message))
}

fn ex_message(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("ex-message", args, 1)?;
    let key = rt.kw("message");
    crate::core::collections::get_value(rt, args[0], key)
}

fn ex_data(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("ex-data", args, 1)?;
    let key = rt.kw("data");
    crate::core::collections::get_value(rt, args[0], key)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn atom_reset_and_read() {
        let mut rt = rt();
        let a = atom(&mut rt, &[Value::Int(1)]).unwrap();
        assert_eq!(deref(&mut rt, &[a]).unwrap(), Value::Int(1));
        reset_bang(&mut rt, &[a, Value::Int(2)]).unwrap();
        assert_eq!(deref(&mut rt, &[a]).unwrap(), Value::Int(2));
    }

    #[test]
    fn promise_delivery_is_once() {
        let mut rt = rt();
        let p = promise(&mut rt, &[]).unwrap();
        assert!(deref(&mut rt, &[p]).is_err());
        deliver(&mut rt, &[p, Value::Int(1)]).unwrap();
        deliver(&mut rt, &[p, Value::Int(2)]).unwrap();
        assert_eq!(deref(&mut rt, &[p]).unwrap(), Value::Int(1));
    }

    #[test]
    fn binding_frames_balance() {
        let mut rt = rt();
        let user = rt.env.current;
        let var = rt.env.intern(user, "*level*");
        rt.env.var_mut(var).dynamic = true;
        rt.env.bind_root(var, Value::Int(0));

        let frame = rt.map_value(vec![(Value::Var(var), Value::Int(5))]);
        push_thread_bindings(&mut rt, &[frame]).unwrap();
        assert_eq!(rt.env.deref_var(var), Value::Int(5));
        pop_thread_bindings(&mut rt, &[]).unwrap();
        assert_eq!(rt.env.deref_var(var), Value::Int(0));
    }

    #[test]
    fn non_dynamic_binding_rejected() {
        let mut rt = rt();
        let user = rt.env.current;
        let var = rt.env.intern(user, "plain");
        rt.env.bind_root(var, Value::Int(0));
        let frame = rt.map_value(vec![(Value::Var(var), Value::Int(5))]);
        assert!(push_thread_bindings(&mut rt, &[frame]).is_err());
    }
}
