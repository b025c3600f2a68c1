//! Collection builtins, plus the shared accessor functions the
//! VM's collection opcodes call directly.

use crate::{
    common::error::{Error, ErrorKind},
    core::{expect_at_least, expect_exact, expect_range, type_error},
    runtime::{
        lazy,
        rt::Rt,
        value::{BuiltinFn, HeapObj, LazySeq, Transient, Value},
    },
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("list", list),
    ("vector", vector),
    ("vec", vec_coerce),
    ("hash-map", hash_map),
    ("hash-set", hash_set),
    ("set", set_coerce),
    ("map-from-seq", map_from_seq),
    ("set-from-seq", set_from_seq),
    ("conj", conj),
    ("cons", cons),
    ("first", first),
    ("rest", rest),
    ("next", next),
    ("nth", nth),
    ("get", get),
    ("assoc", assoc),
    ("dissoc", dissoc),
    ("count", count),
    ("keys", keys),
    ("vals", vals),
    ("peek", peek),
    ("pop", pop),
    ("subvec", subvec),
    ("update", update),
    ("reverse", reverse),
    ("into", into),
    ("seq", seq),
    ("empty", empty),
    ("not-empty", not_empty),
    ("meta", meta),
    ("with-meta", with_meta),
    ("vary-meta", vary_meta),
    ("transient", transient),
    ("persistent!", persistent_bang),
    ("conj!", conj_bang),
    ("assoc!", assoc_bang),
    ("dissoc!", dissoc_bang),
    ("pop!", pop_bang),
];

// -- shared accessors (also used by the VM opcodes) ------------

pub fn first_value(rt: &mut Rt, coll: Value) -> Result<Value, Error> {
    Ok(lazy::seq_next(rt, coll)?.map(|(head, _)| head).unwrap_or(Value::Nil))
}

/// `rest` never returns nil: an exhausted sequence rests to `()`.
pub fn rest_value(rt: &mut Rt, coll: Value) -> Result<Value, Error> {
    match lazy::seq_next(rt, coll)? {
        Some((_, tail)) => Ok(tail),
        None => Ok(rt.list_value(vec![])),
    }
}

/// `next` is `rest` that returns nil when there is nothing left.
pub fn next_value(rt: &mut Rt, coll: Value) -> Result<Value, Error> {
    match lazy::seq_next(rt, coll)? {
        Some((_, tail)) => {
            let mark = rt.protect(&[tail]);
            let more = lazy::seq_next(rt, tail)?;
            let tail = rt.recall(mark, 0);
            rt.unprotect(mark);
            Ok(if more.is_some() { tail } else { Value::Nil })
        }
        None => Ok(Value::Nil),
    }
}

pub fn conj_value(rt: &mut Rt, coll: Value, item: Value) -> Result<Value, Error> {
    match coll {
        Value::Nil => Ok(rt.list_value(vec![item])),
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::List { mut items, meta } => {
                items.insert(0, item);
                Ok(rt.alloc(HeapObj::List { items, meta }))
            }
            HeapObj::Vector { mut items, meta } => {
                items.push(item);
                Ok(rt.alloc(HeapObj::Vector { items, meta }))
            }
            HeapObj::Set { mut items, meta } => {
                if !items.iter().any(|member| rt.heap.equal(*member, item)) {
                    items.push(item);
                }
                Ok(rt.alloc(HeapObj::Set { items, meta }))
            }
            HeapObj::Map { mut entries, meta } => {
                // conj onto a map takes [k v] pairs or another map
                match item {
                    Value::Obj(pair_ref) => match rt.heap.get(pair_ref).clone() {
                        HeapObj::Vector { items: pair, .. } if pair.len() == 2 => {
                            upsert(rt, &mut entries, pair[0], pair[1]);
                            Ok(rt.alloc(HeapObj::Map { entries, meta }))
                        }
                        HeapObj::Map {
                            entries: incoming, ..
                        } => {
                            for (k, v) in incoming {
                                upsert(rt, &mut entries, k, v);
                            }
                            Ok(rt.alloc(HeapObj::Map { entries, meta }))
                        }
                        _ => Err(type_error(rt, "conj", "a [key value] pair", item)),
                    },
                    _ => Err(type_error(rt, "conj", "a [key value] pair", item)),
                }
            }
            HeapObj::Lazy(_) => {
                // conj onto a seq prepends, like a list
                Ok(rt.alloc(HeapObj::Lazy(LazySeq::Cons {
                    head: item,
                    tail: coll,
                })))
            }
            _ => Err(type_error(rt, "conj", "a collection", coll)),
        },
        _ => Err(type_error(rt, "conj", "a collection", coll)),
    }
}

fn upsert(rt: &Rt, entries: &mut Vec<(Value, Value)>, key: Value, value: Value) {
    for (k, v) in entries.iter_mut() {
        if rt.heap.equal(*k, key) {
            *v = value;
            return;
        }
    }
    entries.push((key, value));
}

pub fn nth_value(
    rt: &mut Rt,
    coll: Value,
    index: Value,
    default: Option<Value>,
) -> Result<Value, Error> {
    let i = match index {
        Value::Int(i) if i >= 0 => i as usize,
        Value::Int(_) => {
            return default.ok_or_else(|| {
                Error::eval(ErrorKind::IndexOutOfBounds, "nth with a negative index")
            })
        }
        bad => return Err(type_error(rt, "nth", "an integer index", bad)),
    };

    let out_of_bounds = |len: usize| {
        Error::eval(
            ErrorKind::IndexOutOfBounds,
            &format!("index {} out of bounds for a collection of {}", i, len),
        )
    };

    match coll {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Vector { items, .. } | HeapObj::List { items, .. } => {
                match items.get(i) {
                    Some(v) => Ok(*v),
                    None => default.ok_or_else(|| out_of_bounds(items.len())),
                }
            }
            HeapObj::Str(s) => match s.chars().nth(i) {
                Some(c) => Ok(Value::Char(c)),
                None => default.ok_or_else(|| out_of_bounds(s.chars().count())),
            },
            HeapObj::Lazy(_) => {
                let realized = lazy::to_vec(rt, coll, Some(i + 1))?;
                match realized.get(i) {
                    Some(v) => Ok(*v),
                    None => default.ok_or_else(|| out_of_bounds(realized.len())),
                }
            }
            _ => Err(type_error(rt, "nth", "an indexed collection", coll)),
        },
        Value::Nil => default.ok_or_else(|| out_of_bounds(0)),
        _ => Err(type_error(rt, "nth", "an indexed collection", coll)),
    }
}

/// `get`'s lookup: `None` means the key is absent (as opposed to
/// present with a nil value).
pub fn lookup(rt: &Rt, coll: Value, key: Value) -> Option<Value> {
    match coll {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Map { entries, .. } => entries
                .iter()
                .find(|(k, _)| rt.heap.equal(*k, key))
                .map(|(_, v)| *v),
            HeapObj::Set { items, .. } => {
                items.iter().find(|member| rt.heap.equal(**member, key)).copied()
            }
            HeapObj::Vector { items, .. } => match key {
                Value::Int(i) if i >= 0 => items.get(i as usize).copied(),
                _ => None,
            },
            HeapObj::Str(s) => match key {
                Value::Int(i) if i >= 0 => s.chars().nth(i as usize).map(Value::Char),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

pub fn get_value(rt: &mut Rt, coll: Value, key: Value) -> Result<Value, Error> {
    Ok(lookup(rt, coll, key).unwrap_or(Value::Nil))
}

pub fn assoc_value(rt: &mut Rt, coll: Value, key: Value, value: Value) -> Result<Value, Error> {
    match coll {
        Value::Nil => Ok(rt.map_value(vec![(key, value)])),
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::Map { mut entries, meta } => {
                upsert(rt, &mut entries, key, value);
                Ok(rt.alloc(HeapObj::Map { entries, meta }))
            }
            HeapObj::Vector { mut items, meta } => match key {
                Value::Int(i) if i >= 0 && (i as usize) <= items.len() => {
                    let i = i as usize;
                    if i == items.len() {
                        items.push(value);
                    } else {
                        items[i] = value;
                    }
                    Ok(rt.alloc(HeapObj::Vector { items, meta }))
                }
                Value::Int(i) => Err(Error::eval(
                    ErrorKind::IndexOutOfBounds,
                    &format!("index {} out of bounds for a vector of {}", i, items.len()),
                )),
                bad => Err(type_error(rt, "assoc", "an integer index", bad)),
            },
            _ => Err(type_error(rt, "assoc", "a map or vector", coll)),
        },
        _ => Err(type_error(rt, "assoc", "a map or vector", coll)),
    }
}

pub fn count_value(rt: &mut Rt, coll: Value) -> Result<Value, Error> {
    let n = match coll {
        Value::Nil => 0,
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::List { items, .. }
            | HeapObj::Vector { items, .. }
            | HeapObj::Set { items, .. } => items.len(),
            HeapObj::Map { entries, .. } => entries.len(),
            HeapObj::Str(s) => s.chars().count(),
            HeapObj::Lazy(_) => lazy::to_vec(rt, coll, None)?.len(),
            _ => return Err(type_error(rt, "count", "a countable collection", coll)),
        },
        _ => return Err(type_error(rt, "count", "a countable collection", coll)),
    };
    Ok(Value::Int(n as i64))
}

pub fn meta_value(rt: &mut Rt, v: Value) -> Value {
    match v {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::List { meta, .. }
            | HeapObj::Vector { meta, .. }
            | HeapObj::Map { meta, .. }
            | HeapObj::Set { meta, .. }
            | HeapObj::Sym { meta, .. } => *meta,
            HeapObj::Fn(crate::runtime::value::FnObj::Closure(c)) => c.meta,
            _ => Value::Nil,
        },
        Value::Var(var) => rt.env.var(var).meta,
        _ => Value::Nil,
    }
}

pub fn with_meta_value(rt: &mut Rt, v: Value, meta: Value) -> Result<Value, Error> {
    match v {
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::List { items, .. } => Ok(rt.alloc(HeapObj::List { items, meta })),
            HeapObj::Vector { items, .. } => Ok(rt.alloc(HeapObj::Vector { items, meta })),
            HeapObj::Map { entries, .. } => Ok(rt.alloc(HeapObj::Map { entries, meta })),
            HeapObj::Set { items, .. } => Ok(rt.alloc(HeapObj::Set { items, meta })),
            HeapObj::Sym { ns, name, .. } => Ok(rt.alloc(HeapObj::Sym { ns, name, meta })),
            HeapObj::Fn(crate::runtime::value::FnObj::Closure(mut c)) => {
                c.meta = meta;
                Ok(rt.alloc(HeapObj::Fn(crate::runtime::value::FnObj::Closure(c))))
            }
            _ => Err(type_error(rt, "with-meta", "a value that takes metadata", v)),
        },
        _ => Err(type_error(rt, "with-meta", "a value that takes metadata", v)),
    }
}

// -- constructors ----------------------------------------------

fn list(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    Ok(rt.list_value(args.to_vec()))
}

fn vector(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    Ok(rt.vector_value(args.to_vec()))
}

fn vec_coerce(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("vec", args, 1)?;
    match args[0] {
        Value::Obj(r) if matches!(rt.heap.get(r), HeapObj::Vector { .. }) => Ok(args[0]),
        Value::Nil => Ok(rt.vector_value(vec![])),
        coll => {
            let items = lazy::to_vec(rt, coll, None)?;
            Ok(rt.vector_value(items))
        }
    }
}

fn hash_map(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    if args.len() % 2 != 0 {
        return Err(Error::eval(
            ErrorKind::ArityError,
            "hash-map expects an even number of arguments",
        ));
    }
    let mut entries: Vec<(Value, Value)> = vec![];
    for pair in args.chunks(2) {
        upsert(rt, &mut entries, pair[0], pair[1]);
    }
    Ok(rt.map_value(entries))
}

fn hash_set(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let mut items: Vec<Value> = vec![];
    for arg in args {
        if !items.iter().any(|member| rt.heap.equal(*member, *arg)) {
            items.push(*arg);
        }
    }
    Ok(rt.set_value(items))
}

fn set_coerce(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("set", args, 1)?;
    let items = match args[0] {
        Value::Nil => vec![],
        coll => lazy::to_vec(rt, coll, None)?,
    };
    hash_set(rt, &items)
}

/// Builds a map from a flat seq of alternating keys and values;
/// syntax quote generates calls to this.
fn map_from_seq(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("map-from-seq", args, 1)?;
    let flat = lazy::to_vec(rt, args[0], None)?;
    hash_map(rt, &flat)
}

fn set_from_seq(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("set-from-seq", args, 1)?;
    let flat = lazy::to_vec(rt, args[0], None)?;
    hash_set(rt, &flat)
}

// -- the builtin faces of the shared accessors ------------------

fn conj(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("conj", args, 1)?;
    let mark = rt.protect(args);
    let mut coll = args[0];
    for i in 1..args.len() {
        let item = rt.recall(mark, i);
        coll = match conj_value(rt, coll, item) {
            Ok(coll) => coll,
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        };
    }
    rt.unprotect(mark);
    Ok(coll)
}

fn cons(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("cons", args, 2)?;
    // a lazy-friendly cons cell: does not realize the tail
    Ok(rt.alloc(HeapObj::Lazy(LazySeq::Cons {
        head: args[0],
        tail: args[1],
    })))
}

fn first(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("first", args, 1)?;
    first_value(rt, args[0])
}

fn rest(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("rest", args, 1)?;
    rest_value(rt, args[0])
}

fn next(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("next", args, 1)?;
    next_value(rt, args[0])
}

fn nth(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("nth", args, 2, 3)?;
    nth_value(rt, args[0], args[1], args.get(2).copied())
}

fn get(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("get", args, 2, 3)?;
    let found = lookup(rt, args[0], args[1]);
    Ok(found.unwrap_or_else(|| args.get(2).copied().unwrap_or(Value::Nil)))
}

fn assoc(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("assoc", args, 3)?;
    if args.len() % 2 != 1 {
        return Err(Error::eval(
            ErrorKind::ArityError,
            "assoc expects a collection and key/value pairs",
        ));
    }
    let mark = rt.protect(args);
    let mut coll = args[0];
    for i in (1..args.len()).step_by(2) {
        let key = rt.recall(mark, i);
        let value = rt.recall(mark, i + 1);
        coll = match assoc_value(rt, coll, key, value) {
            Ok(coll) => coll,
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        };
    }
    rt.unprotect(mark);
    Ok(coll)
}

fn dissoc(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("dissoc", args, 1)?;
    let coll = args[0];
    match coll {
        Value::Nil => Ok(Value::Nil),
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::Map { mut entries, meta } => {
                for key in args[1..].iter() {
                    entries.retain(|(k, _)| !rt.heap.equal(*k, *key));
                }
                Ok(rt.alloc(HeapObj::Map { entries, meta }))
            }
            _ => Err(type_error(rt, "dissoc", "a map", coll)),
        },
        _ => Err(type_error(rt, "dissoc", "a map", coll)),
    }
}

fn count(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("count", args, 1)?;
    count_value(rt, args[0])
}

fn keys(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("keys", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Map { entries, .. } => {
                let ks: Vec<Value> = entries.iter().map(|(k, _)| *k).collect();
                Ok(if ks.is_empty() {
                    Value::Nil
                } else {
                    rt.list_value(ks)
                })
            }
            _ => Err(type_error(rt, "keys", "a map", args[0])),
        },
        Value::Nil => Ok(Value::Nil),
        bad => Err(type_error(rt, "keys", "a map", bad)),
    }
}

fn vals(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("vals", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Map { entries, .. } => {
                let vs: Vec<Value> = entries.iter().map(|(_, v)| *v).collect();
                Ok(if vs.is_empty() {
                    Value::Nil
                } else {
                    rt.list_value(vs)
                })
            }
            _ => Err(type_error(rt, "vals", "a map", args[0])),
        },
        Value::Nil => Ok(Value::Nil),
        bad => Err(type_error(rt, "vals", "a map", bad)),
    }
}

fn peek(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("peek", args, 1)?;
    match args[0] {
        Value::Nil => Ok(Value::Nil),
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Vector { items, .. } => Ok(items.last().copied().unwrap_or(Value::Nil)),
            HeapObj::List { items, .. } => Ok(items.first().copied().unwrap_or(Value::Nil)),
            _ => Err(type_error(rt, "peek", "a vector or list", args[0])),
        },
        bad => Err(type_error(rt, "peek", "a vector or list", bad)),
    }
}

fn pop(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("pop", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::Vector { mut items, meta } => {
                if items.pop().is_none() {
                    return Err(Error::eval(
                        ErrorKind::IndexOutOfBounds,
                        "can't pop an empty vector",
                    ));
                }
                Ok(rt.alloc(HeapObj::Vector { items, meta }))
            }
            HeapObj::List { items, meta } => {
                if items.is_empty() {
                    return Err(Error::eval(
                        ErrorKind::IndexOutOfBounds,
                        "can't pop an empty list",
                    ));
                }
                Ok(rt.alloc(HeapObj::List {
                    items: items[1..].to_vec(),
                    meta,
                }))
            }
            _ => Err(type_error(rt, "pop", "a vector or list", args[0])),
        },
        bad => Err(type_error(rt, "pop", "a vector or list", bad)),
    }
}

fn subvec(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("subvec", args, 2, 3)?;
    let items = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Vector { items, .. } => items.clone(),
            _ => return Err(type_error(rt, "subvec", "a vector", args[0])),
        },
        bad => return Err(type_error(rt, "subvec", "a vector", bad)),
    };
    let start = match args[1] {
        Value::Int(i) if i >= 0 => i as usize,
        bad => return Err(type_error(rt, "subvec", "a non-negative index", bad)),
    };
    let end = match args.get(2) {
        None => items.len(),
        Some(Value::Int(i)) if *i >= 0 => *i as usize,
        Some(bad) => return Err(type_error(rt, "subvec", "a non-negative index", *bad)),
    };
    if start > end || end > items.len() {
        return Err(Error::eval(
            ErrorKind::IndexOutOfBounds,
            &format!(
                "subvec range {}..{} out of bounds for a vector of {}",
                start,
                end,
                items.len()
            ),
        ));
    }
    Ok(rt.vector_value(items[start..end].to_vec()))
}

fn update(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("update", args, 3)?;
    let mark = rt.protect(args);
    let current = get_value(rt, args[0], args[1])?;

    let f = rt.recall(mark, 2);
    let mut call_args = vec![current];
    for i in 3..args.len() {
        call_args.push(rt.recall(mark, i));
    }
    let updated = rt.call(f, &call_args);

    let coll = rt.recall(mark, 0);
    let key = rt.recall(mark, 1);
    rt.unprotect(mark);
    let updated = updated?;
    assoc_value(rt, coll, key, updated)
}

fn reverse(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("reverse", args, 1)?;
    let mut items = match args[0] {
        Value::Nil => vec![],
        coll => lazy::to_vec(rt, coll, None)?,
    };
    items.reverse();
    Ok(rt.list_value(items))
}

fn into(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("into", args, 2)?;
    let mark = rt.protect(&[args[0]]);
    let items = lazy::to_vec(rt, args[1], None)?;
    let mut coll = rt.recall(mark, 0);
    rt.unprotect(mark);

    let mark = rt.protect(&items);
    for i in 0..items.len() {
        let item = rt.recall(mark, i);
        coll = match conj_value(rt, coll, item) {
            Ok(coll) => coll,
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        };
    }
    rt.unprotect(mark);
    Ok(coll)
}

/// `(seq coll)`: nil for anything empty, otherwise a sequence
/// over the collection.
fn seq(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("seq", args, 1)?;
    seq_value(rt, args[0])
}

pub fn seq_value(rt: &mut Rt, coll: Value) -> Result<Value, Error> {
    match lazy::seq_next(rt, coll)? {
        None => Ok(Value::Nil),
        Some((head, tail)) => {
            // lists and realized lazy cells are already seqs
            if let Value::Obj(r) = coll {
                if matches!(
                    rt.heap.get(r),
                    HeapObj::List { .. } | HeapObj::Lazy(_)
                ) {
                    return Ok(coll);
                }
            }
            Ok(rt.alloc(HeapObj::Lazy(LazySeq::Cons { head, tail })))
        }
    }
}

fn empty(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("empty", args, 1)?;
    match args[0] {
        Value::Nil => Ok(Value::Nil),
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::List { .. } | HeapObj::Lazy(_) => Ok(rt.list_value(vec![])),
            HeapObj::Vector { .. } => Ok(rt.vector_value(vec![])),
            HeapObj::Map { .. } => Ok(rt.map_value(vec![])),
            HeapObj::Set { .. } => Ok(rt.set_value(vec![])),
            _ => Ok(Value::Nil),
        },
        _ => Ok(Value::Nil),
    }
}

fn not_empty(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("not-empty", args, 1)?;
    match lazy::seq_next(rt, args[0])? {
        None => Ok(Value::Nil),
        Some(_) => Ok(args[0]),
    }
}

fn meta(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("meta", args, 1)?;
    Ok(meta_value(rt, args[0]))
}

fn with_meta(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("with-meta", args, 2)?;
    with_meta_value(rt, args[0], args[1])
}

fn vary_meta(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("vary-meta", args, 2)?;
    let mark = rt.protect(args);
    let current = meta_value(rt, args[0]);
    let f = rt.recall(mark, 1);
    let mut call_args = vec![current];
    for i in 2..args.len() {
        call_args.push(rt.recall(mark, i));
    }
    let updated = rt.call(f, &call_args);
    let target = rt.recall(mark, 0);
    rt.unprotect(mark);
    with_meta_value(rt, target, updated?)
}

// -- transients ------------------------------------------------

fn transient(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("transient", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::Vector { items, .. } => Ok(rt.alloc(HeapObj::Transient(
                Transient::Vector {
                    items,
                    persisted: false,
                },
            ))),
            HeapObj::Map { entries, .. } => Ok(rt.alloc(HeapObj::Transient(Transient::Map {
                entries,
                persisted: false,
            }))),
            HeapObj::Set { items, .. } => Ok(rt.alloc(HeapObj::Transient(Transient::Set {
                items,
                persisted: false,
            }))),
            _ => Err(type_error(rt, "transient", "a vector, map, or set", args[0])),
        },
        bad => Err(type_error(rt, "transient", "a vector, map, or set", bad)),
    }
}

/// Fails when the transient was already made persistent - linear
/// use is enforced, not assumed.
fn transient_cell<'a>(rt: &'a mut Rt, name: &str, v: Value) -> Result<&'a mut Transient, Error> {
    let r = match v {
        Value::Obj(r) if matches!(rt.heap.get(r), HeapObj::Transient(_)) => r,
        bad => return Err(type_error(rt, name, "a transient", bad)),
    };
    match rt.heap.get_mut(r) {
        HeapObj::Transient(t) => {
            if t.persisted() {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!("{} on a transient that was already persisted", name),
                ));
            }
            Ok(t)
        }
        _ => unreachable!(),
    }
}

fn persistent_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("persistent!", args, 1)?;
    let snapshot = transient_cell(rt, "persistent!", args[0])?.clone();
    match transient_cell(rt, "persistent!", args[0])? {
        Transient::Vector { persisted, .. }
        | Transient::Map { persisted, .. }
        | Transient::Set { persisted, .. } => *persisted = true,
    }
    match snapshot {
        Transient::Vector { items, .. } => Ok(rt.vector_value(items)),
        Transient::Map { entries, .. } => Ok(rt.map_value(entries)),
        Transient::Set { items, .. } => Ok(rt.set_value(items)),
    }
}

fn conj_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("conj!", args, 2)?;
    let item = args[1];
    // membership check needs the heap immutably first
    let dup = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Transient(Transient::Set { items, .. }) => {
                items.iter().any(|member| rt.heap.equal(*member, item))
            }
            _ => false,
        },
        _ => false,
    };
    match transient_cell(rt, "conj!", args[0])? {
        Transient::Vector { items, .. } => items.push(item),
        Transient::Set { items, .. } => {
            if !dup {
                items.push(item);
            }
        }
        Transient::Map { .. } => {
            return Err(Error::eval(
                ErrorKind::TypeError,
                "conj! on a transient map needs assoc!",
            ))
        }
    }
    Ok(args[0])
}

fn assoc_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("assoc!", args, 3)?;
    let (key, value) = (args[1], args[2]);
    // find the entry index with the heap immutable
    let found = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Transient(Transient::Map { entries, .. }) => {
                entries.iter().position(|(k, _)| rt.heap.equal(*k, key))
            }
            _ => None,
        },
        _ => None,
    };
    match transient_cell(rt, "assoc!", args[0])? {
        Transient::Map { entries, .. } => match found {
            Some(i) => entries[i].1 = value,
            None => entries.push((key, value)),
        },
        Transient::Vector { items, .. } => match key {
            Value::Int(i) if i >= 0 && (i as usize) <= items.len() => {
                let i = i as usize;
                if i == items.len() {
                    items.push(value);
                } else {
                    items[i] = value;
                }
            }
            _ => {
                return Err(Error::eval(
                    ErrorKind::IndexOutOfBounds,
                    "assoc! index out of bounds",
                ))
            }
        },
        Transient::Set { .. } => {
            return Err(Error::eval(
                ErrorKind::TypeError,
                "assoc! is not supported on a transient set",
            ))
        }
    }
    Ok(args[0])
}

fn dissoc_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("dissoc!", args, 2)?;
    let key = args[1];
    let found = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Transient(Transient::Map { entries, .. }) => {
                entries.iter().position(|(k, _)| rt.heap.equal(*k, key))
            }
            _ => None,
        },
        _ => None,
    };
    match transient_cell(rt, "dissoc!", args[0])? {
        Transient::Map { entries, .. } => {
            if let Some(i) = found {
                entries.remove(i);
            }
        }
        _ => {
            return Err(Error::eval(
                ErrorKind::TypeError,
                "dissoc! expects a transient map",
            ))
        }
    }
    Ok(args[0])
}

fn pop_bang(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("pop!", args, 1)?;
    match transient_cell(rt, "pop!", args[0])? {
        Transient::Vector { items, .. } => {
            if items.pop().is_none() {
                return Err(Error::eval(
                    ErrorKind::IndexOutOfBounds,
                    "can't pop! an empty transient vector",
                ));
            }
        }
        _ => {
            return Err(Error::eval(
                ErrorKind::TypeError,
                "pop! expects a transient vector",
            ))
        }
    }
    Ok(args[0])
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn conj_direction() {
        let mut rt = rt();
        let l = rt.list_value(vec![Value::Int(2), Value::Int(3)]);
        let v = rt.vector_value(vec![Value::Int(2), Value::Int(3)]);

        let l2 = conj_value(&mut rt, l, Value::Int(1)).unwrap();
        let v2 = conj_value(&mut rt, v, Value::Int(1)).unwrap();

        let shown_l = rt.pr_str(l2).unwrap();
        let shown_v = rt.pr_str(v2).unwrap();
        assert_eq!(shown_l, "(1 2 3)");
        assert_eq!(shown_v, "[2 3 1]");
    }

    #[test]
    fn assoc_get_dissoc() {
        let mut rt = rt();
        let k = rt.kw("a");
        let m = rt.map_value(vec![]);
        let m = assoc_value(&mut rt, m, k, Value::Int(1)).unwrap();
        assert_eq!(get_value(&mut rt, m, k).unwrap(), Value::Int(1));

        let m2 = dissoc(&mut rt, &[m, k]).unwrap();
        assert_eq!(get_value(&mut rt, m2, k).unwrap(), Value::Nil);
        // the original is untouched
        assert_eq!(get_value(&mut rt, m, k).unwrap(), Value::Int(1));
    }

    #[test]
    fn nth_defaults_and_errors() {
        let mut rt = rt();
        let v = rt.vector_value(vec![Value::Int(10)]);
        assert_eq!(
            nth_value(&mut rt, v, Value::Int(0), None).unwrap(),
            Value::Int(10)
        );
        assert_eq!(
            nth_value(&mut rt, v, Value::Int(5), Some(Value::Nil)).unwrap(),
            Value::Nil
        );
        assert!(matches!(
            nth_value(&mut rt, v, Value::Int(5), None),
            Err(Error {
                kind: ErrorKind::IndexOutOfBounds,
                ..
            })
        ));
    }

    #[test]
    fn double_persistent_is_an_error() {
        let mut rt = rt();
        let v = rt.vector_value(vec![Value::Int(1)]);
        let t = transient(&mut rt, &[v]).unwrap();
        persistent_bang(&mut rt, &[t]).unwrap();
        assert!(persistent_bang(&mut rt, &[t]).is_err());
    }

    #[test]
    fn transient_mutates_in_place() {
        let mut rt = rt();
        let v = rt.vector_value(vec![]);
        let t = transient(&mut rt, &[v]).unwrap();
        conj_bang(&mut rt, &[t, Value::Int(1)]).unwrap();
        conj_bang(&mut rt, &[t, Value::Int(2)]).unwrap();
        let back = persistent_bang(&mut rt, &[t]).unwrap();
        assert_eq!(rt.pr_str(back).unwrap(), "[1 2]");
    }
}
