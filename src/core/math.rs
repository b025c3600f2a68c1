//! Arithmetic builtins. Integers and floats mix with the usual
//! contagion rule: any float in the arguments makes the result a
//! float; two integers stay integral, including `/`.

use crate::{
    common::error::{Error, ErrorKind},
    core::{expect_at_least, expect_exact, type_error},
    runtime::{rt::Rt, value::{BuiltinFn, Value}},
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("+", add),
    ("-", sub),
    ("*", mul),
    ("/", div),
    ("rem", rem),
    ("quot", quot),
    ("inc", inc),
    ("dec", dec),
    ("min", min),
    ("max", max),
    ("abs", abs),
];

/// Either both ints, or both lifted to floats.
enum Pair {
    Ints(i64, i64),
    Floats(f64, f64),
}

fn pair(rt: &Rt, name: &str, a: Value, b: Value) -> Result<Pair, Error> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Pair::Ints(x, y)),
        (Value::Int(x), Value::Float(y)) => Ok(Pair::Floats(x as f64, y)),
        (Value::Float(x), Value::Int(y)) => Ok(Pair::Floats(x, y as f64)),
        (Value::Float(x), Value::Float(y)) => Ok(Pair::Floats(x, y)),
        (Value::Int(_), bad) | (Value::Float(_), bad) => {
            Err(type_error(rt, name, "numbers", bad))
        }
        (bad, _) => Err(type_error(rt, name, "numbers", bad)),
    }
}

fn fold(
    rt: &Rt,
    name: &str,
    args: &[Value],
    unit: Value,
    ints: fn(i64, i64) -> Option<i64>,
    floats: fn(f64, f64) -> f64,
) -> Result<Value, Error> {
    let mut acc = unit;
    for (i, arg) in args.iter().enumerate() {
        if i == 0 && args.len() > 1 {
            acc = *arg;
            match acc {
                Value::Int(_) | Value::Float(_) => continue,
                bad => return Err(type_error(rt, name, "numbers", bad)),
            }
        }
        acc = match pair(rt, name, acc, *arg)? {
            Pair::Ints(x, y) => match ints(x, y) {
                Some(z) => Value::Int(z),
                None => {
                    return Err(Error::eval(
                        ErrorKind::InternalError,
                        &format!("integer overflow in {}", name),
                    ))
                }
            },
            Pair::Floats(x, y) => Value::Float(floats(x, y)),
        };
    }
    Ok(acc)
}

fn add(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    match args {
        [] => Ok(Value::Int(0)),
        [only] => fold(rt, "+", &[Value::Int(0), *only], Value::Int(0), i64::checked_add, |x, y| x + y),
        _ => fold(rt, "+", args, Value::Int(0), i64::checked_add, |x, y| x + y),
    }
}

fn mul(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    match args {
        [] => Ok(Value::Int(1)),
        [only] => fold(rt, "*", &[Value::Int(1), *only], Value::Int(1), i64::checked_mul, |x, y| x * y),
        _ => fold(rt, "*", args, Value::Int(1), i64::checked_mul, |x, y| x * y),
    }
}

fn sub(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("-", args, 1)?;
    if args.len() == 1 {
        return fold(
            rt,
            "-",
            &[Value::Int(0), args[0]],
            Value::Int(0),
            i64::checked_sub,
            |x, y| x - y,
        );
    }
    fold(rt, "-", args, Value::Int(0), i64::checked_sub, |x, y| x - y)
}

fn div(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("/", args, 1)?;
    let args = if args.len() == 1 {
        vec![Value::Int(1), args[0]]
    } else {
        args.to_vec()
    };

    let mut acc = args[0];
    for arg in args[1..].iter() {
        acc = match pair(rt, "/", acc, *arg)? {
            Pair::Ints(_, 0) => {
                return Err(Error::eval(ErrorKind::DivisionByZero, "division by zero"))
            }
            Pair::Ints(x, y) => Value::Int(x / y),
            Pair::Floats(_, y) if y == 0.0 => {
                return Err(Error::eval(ErrorKind::DivisionByZero, "division by zero"))
            }
            Pair::Floats(x, y) => Value::Float(x / y),
        };
    }
    Ok(acc)
}

fn rem(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("rem", args, 2)?;
    match pair(rt, "rem", args[0], args[1])? {
        Pair::Ints(_, 0) => Err(Error::eval(ErrorKind::DivisionByZero, "division by zero")),
        Pair::Ints(x, y) => Ok(Value::Int(x % y)),
        Pair::Floats(_, y) if y == 0.0 => {
            Err(Error::eval(ErrorKind::DivisionByZero, "division by zero"))
        }
        Pair::Floats(x, y) => Ok(Value::Float(x % y)),
    }
}

fn quot(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("quot", args, 2)?;
    match pair(rt, "quot", args[0], args[1])? {
        Pair::Ints(_, 0) => Err(Error::eval(ErrorKind::DivisionByZero, "division by zero")),
        Pair::Ints(x, y) => Ok(Value::Int(x / y)),
        Pair::Floats(_, y) if y == 0.0 => {
            Err(Error::eval(ErrorKind::DivisionByZero, "division by zero"))
        }
        Pair::Floats(x, y) => Ok(Value::Float((x / y).trunc())),
    }
}

fn inc(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("inc", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Int(n + 1)),
        Value::Float(n) => Ok(Value::Float(n + 1.0)),
        bad => Err(type_error(rt, "inc", "a number", bad)),
    }
}

fn dec(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("dec", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Int(n - 1)),
        Value::Float(n) => Ok(Value::Float(n - 1.0)),
        bad => Err(type_error(rt, "dec", "a number", bad)),
    }
}

fn min(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("min", args, 1)?;
    let mut best = args[0];
    for arg in args[1..].iter() {
        let smaller = match pair(rt, "min", *arg, best)? {
            Pair::Ints(x, y) => x < y,
            Pair::Floats(x, y) => x < y,
        };
        if smaller {
            best = *arg;
        }
    }
    Ok(best)
}

fn max(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("max", args, 1)?;
    let mut best = args[0];
    for arg in args[1..].iter() {
        let bigger = match pair(rt, "max", *arg, best)? {
            Pair::Ints(x, y) => x > y,
            Pair::Floats(x, y) => x > y,
        };
        if bigger {
            best = *arg;
        }
    }
    Ok(best)
}

fn abs(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("abs", args, 1)?;
    match args[0] {
        Value::Int(n) => Ok(Value::Int(n.abs())),
        Value::Float(n) => Ok(Value::Float(n.abs())),
        bad => Err(type_error(rt, "abs", "a number", bad)),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn addition() {
        let mut rt = rt();
        assert_eq!(add(&mut rt, &[]).unwrap(), Value::Int(0));
        assert_eq!(
            add(&mut rt, &[Value::Int(1), Value::Int(2), Value::Int(3)]).unwrap(),
            Value::Int(6)
        );
        assert_eq!(
            add(&mut rt, &[Value::Int(1), Value::Float(0.5)]).unwrap(),
            Value::Float(1.5)
        );
    }

    #[test]
    fn integer_division() {
        let mut rt = rt();
        assert_eq!(
            div(&mut rt, &[Value::Int(10), Value::Int(2)]).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            div(&mut rt, &[Value::Int(7), Value::Int(2)]).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            div(&mut rt, &[Value::Int(7), Value::Float(2.0)]).unwrap(),
            Value::Float(3.5)
        );
    }

    #[test]
    fn zero_division() {
        let mut rt = rt();
        let result = div(&mut rt, &[Value::Int(1), Value::Int(0)]);
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::DivisionByZero,
                ..
            })
        ));
    }

    #[test]
    fn unary_minus() {
        let mut rt = rt();
        assert_eq!(sub(&mut rt, &[Value::Int(5)]).unwrap(), Value::Int(-5));
    }
}
