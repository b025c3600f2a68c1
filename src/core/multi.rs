//! Multimethods, protocols, and the global type hierarchy.
//!
//! The hierarchy is one map value - child to set of parents -
//! held as a GC root on the environment. `derive` grows it;
//! `isa?` walks it transitively; multimethod dispatch consults it
//! when matching dispatch values.

use crate::{
    common::error::{Error, ErrorKind},
    core::{expect_exact, expect_range, type_error},
    runtime::{
        heap::ObjRef,
        rt::Rt,
        value::{BuiltinFn, HeapObj, MultiFn, Protocol, ProtocolFn, TypeTag, Value},
    },
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("make-multi", make_multi),
    ("add-method", add_method),
    ("remove-method", remove_method),
    ("make-hierarchy", make_hierarchy),
    ("derive", derive),
    ("underive", underive),
    ("isa?", isa),
    ("parents", parents),
    ("ancestors", ancestors),
    ("descendants", descendants),
    ("make-protocol", make_protocol),
    ("make-protocol-fn", make_protocol_fn),
    ("extend-fn", extend_fn),
    ("satisfies?", satisfies),
    ("extends?", extends),
];

// -- multimethods ----------------------------------------------

fn str_of(rt: &Rt, name: &str, v: Value) -> Result<String, Error> {
    match v {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Str(s) => Ok(s.clone()),
            HeapObj::Sym { name, .. } => Ok(name.clone()),
            _ => Err(type_error(rt, name, "a name", v)),
        },
        bad => Err(type_error(rt, name, "a name", bad)),
    }
}

/// `(make-multi name dispatch-fn default-key)`.
fn make_multi(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("make-multi", args, 3)?;
    let name = str_of(rt, "make-multi", args[0])?;
    Ok(rt.alloc(HeapObj::MultiFn(MultiFn {
        name,
        dispatch: args[1],
        methods: vec![],
        default_key: args[2],
    })))
}

fn multi_ref(rt: &Rt, name: &str, v: Value) -> Result<ObjRef, Error> {
    match v {
        Value::Obj(r) if matches!(rt.heap.get(r), HeapObj::MultiFn(_)) => Ok(r),
        bad => Err(type_error(rt, name, "a multimethod", bad)),
    }
}

fn add_method(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("add-method", args, 3)?;
    let r = multi_ref(rt, "add-method", args[0])?;
    let (key, method) = (args[1], args[2]);
    let existing = match rt.heap.get(r) {
        HeapObj::MultiFn(m) => m.methods.iter().position(|(k, _)| rt.heap.equal(*k, key)),
        _ => unreachable!(),
    };
    match rt.heap.get_mut(r) {
        HeapObj::MultiFn(m) => match existing {
            Some(i) => m.methods[i].1 = method,
            None => m.methods.push((key, method)),
        },
        _ => unreachable!(),
    }
    Ok(args[0])
}

fn remove_method(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("remove-method", args, 2)?;
    let r = multi_ref(rt, "remove-method", args[0])?;
    let key = args[1];
    let found = match rt.heap.get(r) {
        HeapObj::MultiFn(m) => m.methods.iter().position(|(k, _)| rt.heap.equal(*k, key)),
        _ => unreachable!(),
    };
    if let Some(i) = found {
        match rt.heap.get_mut(r) {
            HeapObj::MultiFn(m) => {
                m.methods.remove(i);
            }
            _ => unreachable!(),
        }
    }
    Ok(args[0])
}

/// The dispatch path used by `Rt::call` for multimethod values.
pub fn call_multi(rt: &mut Rt, f: Value, args: &[Value]) -> Result<Value, Error> {
    let r = multi_ref(rt, "multimethod", f)?;
    let (name, dispatch, default_key) = match rt.heap.get(r) {
        HeapObj::MultiFn(m) => (m.name.clone(), m.dispatch, m.default_key),
        _ => unreachable!(),
    };

    let mark = rt.protect(&[f]);
    let args_mark = rt.protect(args);
    let dispatch_value = rt.call(dispatch, args);
    let f = rt.recall(mark, 0);
    let args_now: Vec<Value> = rt.temps[args_mark..args_mark + args.len()].to_vec();
    rt.unprotect(mark);
    let dispatch_value = dispatch_value?;

    let r = multi_ref(rt, "multimethod", f)?;
    let methods = match rt.heap.get(r) {
        HeapObj::MultiFn(m) => m.methods.clone(),
        _ => unreachable!(),
    };

    // exact match first, then isa?-aware, then the default
    let mut chosen = None;
    for (key, method) in methods.iter() {
        if rt.heap.equal(*key, dispatch_value) {
            chosen = Some(*method);
            break;
        }
    }
    if chosen.is_none() {
        let hierarchy = rt.env.hierarchy;
        for (key, method) in methods.iter() {
            if isa_value(rt, hierarchy, dispatch_value, *key)? {
                chosen = Some(*method);
                break;
            }
        }
    }
    if chosen.is_none() {
        for (key, method) in methods.iter() {
            if rt.heap.equal(*key, default_key) {
                chosen = Some(*method);
                break;
            }
        }
    }

    match chosen {
        Some(method) => rt.call(method, &args_now),
        None => {
            let shown = rt.pr_str(dispatch_value)?;
            Err(Error::eval(
                ErrorKind::TypeError,
                &format!("no method in {} for dispatch value {}", name, shown),
            ))
        }
    }
}

// -- the hierarchy ---------------------------------------------

fn make_hierarchy(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("make-hierarchy", args, 0)?;
    Ok(rt.map_value(vec![]))
}

/// The direct parents recorded for a value in a hierarchy map.
fn parents_of(rt: &Rt, hierarchy: Value, child: Value) -> Vec<Value> {
    if let Value::Obj(r) = hierarchy {
        if let HeapObj::Map { entries, .. } = rt.heap.get(r) {
            for (k, v) in entries {
                if rt.heap.equal(*k, child) {
                    if let Value::Obj(set_ref) = v {
                        if let HeapObj::Set { items, .. } = rt.heap.get(*set_ref) {
                            return items.clone();
                        }
                    }
                }
            }
        }
    }
    vec![]
}

/// `(derive child parent)` on the global hierarchy, or
/// `(derive h child parent)` pure.
fn derive(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("derive", args, 2, 3)?;
    match args.len() {
        2 => {
            let hierarchy = ensure_hierarchy(rt);
            let updated = derive_into(rt, hierarchy, args[0], args[1])?;
            rt.env.hierarchy = updated;
            Ok(Value::Nil)
        }
        _ => derive_into(rt, args[0], args[1], args[2]),
    }
}

fn ensure_hierarchy(rt: &mut Rt) -> Value {
    if rt.env.hierarchy == Value::Nil {
        rt.env.hierarchy = rt.map_value(vec![]);
    }
    rt.env.hierarchy
}

fn derive_into(rt: &mut Rt, hierarchy: Value, child: Value, parent: Value) -> Result<Value, Error> {
    // a cycle would make isa? loop
    if isa_value(rt, hierarchy, parent, child)? {
        return Err(Error::eval(
            ErrorKind::TypeError,
            "derive would create a cyclic hierarchy",
        ));
    }
    let mut direct = parents_of(rt, hierarchy, child);
    if !direct.iter().any(|p| rt.heap.equal(*p, parent)) {
        direct.push(parent);
    }
    let set = rt.set_value(direct);
    crate::core::collections::assoc_value(rt, hierarchy, child, set)
}

fn underive(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("underive", args, 2, 3)?;
    let (hierarchy, child, parent, global) = match args.len() {
        2 => (ensure_hierarchy(rt), args[0], args[1], true),
        _ => (args[0], args[1], args[2], false),
    };
    let mut direct = parents_of(rt, hierarchy, child);
    direct.retain(|p| !rt.heap.equal(*p, parent));
    let set = rt.set_value(direct);
    let updated = crate::core::collections::assoc_value(rt, hierarchy, child, set)?;
    if global {
        rt.env.hierarchy = updated;
        Ok(Value::Nil)
    } else {
        Ok(updated)
    }
}

/// Transitive `isa?`: equality, a recorded ancestor path, or
/// element-wise over two vectors of equal length.
pub fn isa_value(rt: &Rt, hierarchy: Value, child: Value, parent: Value) -> Result<bool, Error> {
    if rt.heap.equal(child, parent) {
        return Ok(true);
    }

    // vectors compare element-wise
    if let (Value::Obj(rc), Value::Obj(rp)) = (child, parent) {
        if let (HeapObj::Vector { items: cs, .. }, HeapObj::Vector { items: ps, .. }) =
            (rt.heap.get(rc), rt.heap.get(rp))
        {
            if cs.len() != ps.len() {
                return Ok(false);
            }
            let cs = cs.clone();
            let ps = ps.clone();
            for (c, p) in cs.iter().zip(ps.iter()) {
                if !isa_value(rt, hierarchy, *c, *p)? {
                    return Ok(false);
                }
            }
            return Ok(true);
        }
    }

    // breadth-first over recorded parents
    let mut queue = parents_of(rt, hierarchy, child);
    let mut guard = 0;
    while let Some(candidate) = queue.pop() {
        guard += 1;
        if guard > 10_000 {
            return Err(Error::eval(
                ErrorKind::InternalError,
                "isa? found an unreasonably deep hierarchy",
            ));
        }
        if rt.heap.equal(candidate, parent) {
            return Ok(true);
        }
        queue.extend(parents_of(rt, hierarchy, candidate));
    }
    Ok(false)
}

fn isa(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("isa?", args, 2, 3)?;
    let (hierarchy, child, parent) = match args.len() {
        2 => (rt.env.hierarchy, args[0], args[1]),
        _ => (args[0], args[1], args[2]),
    };
    Ok(Value::Bool(isa_value(rt, hierarchy, child, parent)?))
}

fn parents(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("parents", args, 1, 2)?;
    let (hierarchy, child) = match args.len() {
        1 => (rt.env.hierarchy, args[0]),
        _ => (args[0], args[1]),
    };
    let direct = parents_of(rt, hierarchy, child);
    Ok(if direct.is_empty() {
        Value::Nil
    } else {
        rt.set_value(direct)
    })
}

fn ancestors(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("ancestors", args, 1, 2)?;
    let (hierarchy, child) = match args.len() {
        1 => (rt.env.hierarchy, args[0]),
        _ => (args[0], args[1]),
    };
    let mut all = vec![];
    let mut queue = parents_of(rt, hierarchy, child);
    while let Some(candidate) = queue.pop() {
        if !all.iter().any(|seen| rt.heap.equal(*seen, candidate)) {
            queue.extend(parents_of(rt, hierarchy, candidate));
            all.push(candidate);
        }
    }
    Ok(if all.is_empty() {
        Value::Nil
    } else {
        rt.set_value(all)
    })
}

fn descendants(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("descendants", args, 1, 2)?;
    let (hierarchy, parent) = match args.len() {
        1 => (rt.env.hierarchy, args[0]),
        _ => (args[0], args[1]),
    };
    let children: Vec<Value> = match hierarchy {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Map { entries, .. } => entries.iter().map(|(k, _)| *k).collect(),
            _ => vec![],
        },
        _ => vec![],
    };
    let mut all = vec![];
    for child in children {
        if isa_value(rt, hierarchy, child, parent)? && !rt.heap.equal(child, parent) {
            all.push(child);
        }
    }
    Ok(if all.is_empty() {
        Value::Nil
    } else {
        rt.set_value(all)
    })
}

// -- protocols -------------------------------------------------

/// `(make-protocol name)`.
fn make_protocol(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("make-protocol", args, 1)?;
    let name = str_of(rt, "make-protocol", args[0])?;
    Ok(rt.alloc(HeapObj::Protocol(Protocol {
        name,
        method_names: vec![],
        extended: vec![],
    })))
}

/// `(make-protocol-fn protocol name)`: registers the method name
/// on the protocol and returns the dispatching function.
fn make_protocol_fn(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("make-protocol-fn", args, 2)?;
    let name = str_of(rt, "make-protocol-fn", args[1])?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get_mut(r) {
            HeapObj::Protocol(p) => {
                if !p.method_names.contains(&name) {
                    p.method_names.push(name.clone());
                }
            }
            _ => return Err(type_error(rt, "make-protocol-fn", "a protocol", args[0])),
        },
        bad => return Err(type_error(rt, "make-protocol-fn", "a protocol", bad)),
    }
    Ok(rt.alloc(HeapObj::ProtocolFn(ProtocolFn {
        name,
        protocol: args[0],
        impls: vec![],
    })))
}

fn type_tag_of_sym(rt: &Rt, name: &str, v: Value) -> Result<TypeTag, Error> {
    let text = str_of(rt, name, v)?;
    TypeTag::from_name(&text).ok_or_else(|| {
        Error::eval(
            ErrorKind::TypeError,
            &format!("`{}` does not name a type", text),
        )
    })
}

/// `(extend-fn protocol-fn type-sym impl)`.
fn extend_fn(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("extend-fn", args, 3)?;
    let tag = type_tag_of_sym(rt, "extend-fn", args[1])?;
    let protocol = match args[0] {
        Value::Obj(r) => match rt.heap.get_mut(r) {
            HeapObj::ProtocolFn(p) => {
                match p.impls.iter_mut().find(|(t, _)| *t == tag) {
                    Some((_, f)) => *f = args[2],
                    None => p.impls.push((tag, args[2])),
                }
                p.protocol
            }
            _ => return Err(type_error(rt, "extend-fn", "a protocol function", args[0])),
        },
        bad => return Err(type_error(rt, "extend-fn", "a protocol function", bad)),
    };
    if let Value::Obj(r) = protocol {
        if let HeapObj::Protocol(p) = rt.heap.get_mut(r) {
            if !p.extended.contains(&tag) {
                p.extended.push(tag);
            }
        }
    }
    Ok(args[0])
}

/// Dispatch on the first argument's type tag; used by `Rt::call`.
pub fn call_protocol_fn(rt: &mut Rt, f: Value, args: &[Value]) -> Result<Value, Error> {
    let (name, impls) = match f {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::ProtocolFn(p) => (p.name.clone(), p.impls.clone()),
            _ => unreachable!("protocol dispatch on a non-protocol-fn"),
        },
        _ => unreachable!(),
    };
    let receiver = args.first().copied().ok_or_else(|| {
        Error::eval(
            ErrorKind::ArityError,
            &format!("{} needs at least a receiver argument", name),
        )
    })?;
    let tag = rt.heap.tag_of(receiver);
    match impls.iter().find(|(t, _)| *t == tag) {
        Some((_, method)) => rt.call(*method, args),
        None => Err(Error::eval(
            ErrorKind::TypeError,
            &format!("no implementation of {} for a {}", name, tag.name()),
        )),
    }
}

/// Does the value's type implement the protocol? True when any
/// of the protocol's registered method functions cover its tag -
/// `extend-type` installs all of them together.
fn satisfies(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("satisfies?", args, 2)?;
    let tag = rt.heap.tag_of(args[1]);
    Ok(Value::Bool(protocol_covers(rt, args[0], tag)?))
}

fn extends(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("extends?", args, 2)?;
    let tag = type_tag_of_sym(rt, "extends?", args[1])?;
    Ok(Value::Bool(protocol_covers(rt, args[0], tag)?))
}

fn protocol_covers(rt: &Rt, protocol: Value, tag: TypeTag) -> Result<bool, Error> {
    match protocol {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Protocol(p) => Ok(p.extended.contains(&tag)),
            _ => Err(type_error(rt, "satisfies?", "a protocol", protocol)),
        },
        bad => Err(type_error(rt, "satisfies?", "a protocol", bad)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn derive_and_isa() {
        let mut rt = rt();
        let child = rt.kw("square");
        let parent = rt.kw("shape");
        derive(&mut rt, &[child, parent]).unwrap();

        assert_eq!(isa(&mut rt, &[child, parent]).unwrap(), Value::Bool(true));
        assert_eq!(isa(&mut rt, &[parent, child]).unwrap(), Value::Bool(false));
        // everything isa? itself
        assert_eq!(isa(&mut rt, &[child, child]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn transitive_ancestry() {
        let mut rt = rt();
        let a = rt.kw("a");
        let b = rt.kw("b");
        let c = rt.kw("c");
        derive(&mut rt, &[a, b]).unwrap();
        derive(&mut rt, &[b, c]).unwrap();
        assert_eq!(isa(&mut rt, &[a, c]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn cyclic_derive_rejected() {
        let mut rt = rt();
        let a = rt.kw("a");
        let b = rt.kw("b");
        derive(&mut rt, &[a, b]).unwrap();
        assert!(derive(&mut rt, &[b, a]).is_err());
    }
}
