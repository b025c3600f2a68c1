//! Equality, comparison, and the predicate zoo.

use crate::{
    common::error::{Error, ErrorKind},
    core::{expect_at_least, expect_exact, type_error},
    runtime::{
        lazy,
        rt::Rt,
        value::{BuiltinFn, HeapObj, TypeTag, Value},
    },
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("=", equal),
    ("==", num_equal),
    ("not=", not_equal),
    ("not", not),
    ("<", lt),
    ("<=", le),
    (">", gt),
    (">=", ge),
    ("compare", compare),
    ("identical?", identical),
    ("zero?", zero_p),
    ("pos?", pos_p),
    ("neg?", neg_p),
    ("odd?", odd_p),
    ("even?", even_p),
    ("nil?", nil_p),
    ("some?", some_p),
    ("true?", true_p),
    ("false?", false_p),
    ("boolean", boolean),
    ("number?", number_p),
    ("int?", int_p),
    ("integer?", integer_p),
    ("float?", float_p),
    ("double?", double_p),
    ("string?", string_p),
    ("char?", char_p),
    ("keyword?", keyword_p),
    ("symbol?", symbol_p),
    ("fn?", fn_p),
    ("ifn?", ifn_p),
    ("var?", var_p),
    ("coll?", coll_p),
    ("list?", list_p),
    ("vector?", vector_p),
    ("map?", map_p),
    ("set?", set_p),
    ("seq?", seq_p),
    ("empty?", empty_p),
    ("contains?", contains_p),
    ("bound?", bound_p),
    ("realized?", realized_p),
    ("reduced?", reduced_p),
];

fn equal(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("=", args, 1)?;
    let mark = rt.protect(args);
    for i in 0..args.len().saturating_sub(1) {
        let a = rt.recall(mark, i);
        let b = rt.recall(mark, i + 1);
        let eq = rt.equal(a, b);
        match eq {
            Ok(true) => {}
            Ok(false) => {
                rt.unprotect(mark);
                return Ok(Value::Bool(false));
            }
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        }
    }
    rt.unprotect(mark);
    Ok(Value::Bool(true))
}

/// Numeric equality: `(== 1 1.0)` is true where `(= 1 1.0)` is
/// not.
fn num_equal(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("==", args, 1)?;
    let as_float = |v: Value| -> Result<f64, Error> {
        match v {
            Value::Int(n) => Ok(n as f64),
            Value::Float(n) => Ok(n),
            bad => Err(type_error(rt, "==", "numbers", bad)),
        }
    };
    let first = as_float(args[0])?;
    for arg in args[1..].iter() {
        if as_float(*arg)? != first {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn not_equal(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let eq = equal(rt, args)?;
    Ok(Value::Bool(!eq.is_truthy()))
}

fn not(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("not", args, 1)?;
    Ok(Value::Bool(!args[0].is_truthy()))
}

/// Total order over numbers, strings, characters, keywords, and
/// symbols; mixed kinds refuse.
fn compare_values(rt: &Rt, name: &str, a: Value, b: Value) -> Result<std::cmp::Ordering, Error> {
    use std::cmp::Ordering;
    let ordering = match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(&y),
        (Value::Int(x), Value::Float(y)) => {
            (x as f64).partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::Float(x), Value::Int(y)) => {
            x.partial_cmp(&(y as f64)).unwrap_or(Ordering::Equal)
        }
        (Value::Float(x), Value::Float(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        (Value::Char(x), Value::Char(y)) => x.cmp(&y),
        (Value::Nil, Value::Nil) => Ordering::Equal,
        (Value::Nil, _) => Ordering::Less,
        (_, Value::Nil) => Ordering::Greater,
        (Value::Obj(x), Value::Obj(y)) => match (rt.heap.get(x), rt.heap.get(y)) {
            (HeapObj::Str(x), HeapObj::Str(y)) => x.cmp(y),
            (
                HeapObj::Keyword { ns: nx, name: x },
                HeapObj::Keyword { ns: ny, name: y },
            ) => nx.cmp(ny).then_with(|| x.cmp(y)),
            (
                HeapObj::Sym { ns: nx, name: x, .. },
                HeapObj::Sym { ns: ny, name: y, .. },
            ) => nx.cmp(ny).then_with(|| x.cmp(y)),
            _ => {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!(
                        "{} can't compare a {} with a {}",
                        name,
                        rt.heap.type_name(a),
                        rt.heap.type_name(b)
                    ),
                ))
            }
        },
        _ => {
            return Err(Error::eval(
                ErrorKind::TypeError,
                &format!(
                    "{} can't compare a {} with a {}",
                    name,
                    rt.heap.type_name(a),
                    rt.heap.type_name(b)
                ),
            ))
        }
    };
    Ok(ordering)
}

pub(crate) fn compare_pub(rt: &Rt, a: Value, b: Value) -> Result<std::cmp::Ordering, Error> {
    compare_values(rt, "compare", a, b)
}

fn compare(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("compare", args, 2)?;
    let ordering = compare_values(rt, "compare", args[0], args[1])?;
    Ok(Value::Int(ordering as i64))
}

fn chain(
    rt: &mut Rt,
    name: &str,
    args: &[Value],
    keep: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, Error> {
    expect_at_least(name, args, 1)?;
    for window in args.windows(2) {
        let ordering = compare_values(rt, name, window[0], window[1])?;
        if !keep(ordering) {
            return Ok(Value::Bool(false));
        }
    }
    Ok(Value::Bool(true))
}

fn lt(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    chain(rt, "<", args, |o| o.is_lt())
}

fn le(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    chain(rt, "<=", args, |o| o.is_le())
}

fn gt(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    chain(rt, ">", args, |o| o.is_gt())
}

fn ge(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    chain(rt, ">=", args, |o| o.is_ge())
}

/// Handle identity. Interned symbols and keywords with equal
/// names are guaranteed identical; other equal-but-separate
/// values are not.
fn identical(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("identical?", args, 2)?;
    Ok(Value::Bool(args[0] == args[1]))
}

fn zero_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("zero?", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Bool(n == 0)),
        Value::Float(n) => Ok(Value::Bool(n == 0.0)),
        bad => Err(type_error(rt, "zero?", "a number", bad)),
    }
}

fn pos_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("pos?", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Bool(n > 0)),
        Value::Float(n) => Ok(Value::Bool(n > 0.0)),
        bad => Err(type_error(rt, "pos?", "a number", bad)),
    }
}

fn neg_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("neg?", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Bool(n < 0)),
        Value::Float(n) => Ok(Value::Bool(n < 0.0)),
        bad => Err(type_error(rt, "neg?", "a number", bad)),
    }
}

fn odd_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("odd?", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Bool(n % 2 != 0)),
        bad => Err(type_error(rt, "odd?", "an integer", bad)),
    }
}

fn even_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("even?", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Bool(n % 2 == 0)),
        bad => Err(type_error(rt, "even?", "an integer", bad)),
    }
}

fn tag_is(rt: &Rt, v: Value, tag: TypeTag) -> Value {
    Value::Bool(rt.heap.tag_of(v) == tag)
}

fn nil_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("nil?", args, 1)?;
    Ok(Value::Bool(args[0] == Value::Nil))
}

fn some_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("some?", args, 1)?;
    Ok(Value::Bool(args[0] != Value::Nil))
}

fn true_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("true?", args, 1)?;
    Ok(Value::Bool(args[0] == Value::Bool(true)))
}

fn false_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("false?", args, 1)?;
    Ok(Value::Bool(args[0] == Value::Bool(false)))
}

fn boolean(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("boolean", args, 1)?;
    Ok(Value::Bool(args[0].is_truthy()))
}

fn number_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("number?", args, 1)?;
    Ok(Value::Bool(matches!(
        args[0],
        Value::Int(_) | Value::Float(_)
    )))
}

fn int_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("int?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Int(_))))
}

fn integer_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("integer?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Int(_))))
}

fn float_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("float?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Float(_))))
}

fn double_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("double?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Float(_))))
}

fn string_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("string?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Str))
}

fn char_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("char?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Char(_))))
}

fn keyword_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("keyword?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Keyword))
}

fn symbol_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("symbol?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Sym))
}

fn fn_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("fn?", args, 1)?;
    let is_fn = matches!(
        rt.heap.tag_of(args[0]),
        TypeTag::Fn | TypeTag::MultiFn
    );
    Ok(Value::Bool(is_fn))
}

/// Invokable at all: functions, keywords, maps, sets, vectors.
fn ifn_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("ifn?", args, 1)?;
    let callable = matches!(
        rt.heap.tag_of(args[0]),
        TypeTag::Fn | TypeTag::MultiFn | TypeTag::Keyword | TypeTag::Map | TypeTag::Set | TypeTag::Vector
    );
    Ok(Value::Bool(callable))
}

fn var_p(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("var?", args, 1)?;
    Ok(Value::Bool(matches!(args[0], Value::Var(_))))
}

fn coll_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("coll?", args, 1)?;
    let is_coll = matches!(
        rt.heap.tag_of(args[0]),
        TypeTag::List | TypeTag::Vector | TypeTag::Map | TypeTag::Set | TypeTag::Lazy
    );
    Ok(Value::Bool(is_coll))
}

fn list_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("list?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::List))
}

fn vector_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("vector?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Vector))
}

fn map_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("map?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Map))
}

fn set_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("set?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Set))
}

fn seq_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("seq?", args, 1)?;
    let is_seq = matches!(rt.heap.tag_of(args[0]), TypeTag::List | TypeTag::Lazy);
    Ok(Value::Bool(is_seq))
}

fn empty_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("empty?", args, 1)?;
    if args[0] == Value::Nil {
        return Ok(Value::Bool(true));
    }
    let step = lazy::seq_next(rt, args[0])?;
    Ok(Value::Bool(step.is_none()))
}

fn contains_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("contains?", args, 2)?;
    let (coll, key) = (args[0], args[1]);
    match coll {
        Value::Nil => Ok(Value::Bool(false)),
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Map { entries, .. } => {
                let found = entries.iter().any(|(k, _)| rt.heap.equal(*k, key));
                Ok(Value::Bool(found))
            }
            HeapObj::Set { items, .. } => {
                let found = items.iter().any(|item| rt.heap.equal(*item, key));
                Ok(Value::Bool(found))
            }
            HeapObj::Vector { items, .. } => match key {
                Value::Int(i) => Ok(Value::Bool(i >= 0 && (i as usize) < items.len())),
                _ => Ok(Value::Bool(false)),
            },
            HeapObj::Str(s) => match key {
                Value::Int(i) => Ok(Value::Bool(i >= 0 && (i as usize) < s.chars().count())),
                _ => Ok(Value::Bool(false)),
            },
            _ => Err(type_error(rt, "contains?", "an associative collection", coll)),
        },
        _ => Err(type_error(rt, "contains?", "an associative collection", coll)),
    }
}

fn bound_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("bound?", args, 1)?;
    match args[0] {
        Value::Var(var) => Ok(Value::Bool(rt.env.var(var).bound)),
        bad => Err(type_error(rt, "bound?", "a var", bad)),
    }
}

fn realized_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("realized?", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Lazy(l) => Ok(Value::Bool(matches!(
                l,
                crate::runtime::value::LazySeq::Cons { .. }
                    | crate::runtime::value::LazySeq::Empty
            ))),
            HeapObj::Delay(d) => Ok(Value::Bool(d.value.is_some())),
            HeapObj::Promise(p) => Ok(Value::Bool(p.is_some())),
            _ => Err(type_error(
                rt,
                "realized?",
                "a lazy seq, delay, or promise",
                args[0],
            )),
        },
        bad => Err(type_error(rt, "realized?", "a lazy seq, delay, or promise", bad)),
    }
}

fn reduced_p(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("reduced?", args, 1)?;
    Ok(tag_is(rt, args[0], TypeTag::Reduced))
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn generic_vs_numeric_equality() {
        let mut rt = rt();
        let generic = equal(&mut rt, &[Value::Int(1), Value::Float(1.0)]).unwrap();
        let numeric = num_equal(&mut rt, &[Value::Int(1), Value::Float(1.0)]).unwrap();
        assert_eq!(generic, Value::Bool(false));
        assert_eq!(numeric, Value::Bool(true));
    }

    #[test]
    fn interned_keywords_are_identical() {
        let mut rt = rt();
        let a = rt.kw("x");
        let b = rt.kw("x");
        assert_eq!(identical(&mut rt, &[a, b]).unwrap(), Value::Bool(true));
    }

    #[test]
    fn comparison_chain() {
        let mut rt = rt();
        assert_eq!(
            lt(&mut rt, &[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            lt(&mut rt, &[Value::Int(1), Value::Int(3), Value::Int(2)]).unwrap(),
            Value::Bool(false)
        );
    }

    #[test]
    fn separate_strings_equal_not_identical() {
        let mut rt = rt();
        let a = rt.str_value("hey");
        let b = rt.str_value("hey");
        assert_eq!(equal(&mut rt, &[a, b]).unwrap(), Value::Bool(true));
        assert_eq!(identical(&mut rt, &[a, b]).unwrap(), Value::Bool(false));
    }
}
