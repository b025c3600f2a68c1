//! Printing, names, and the function combinators that live in
//! the value model (`partial`, `comp`).

use crate::{
    common::error::Error,
    core::{expect_at_least, expect_exact, expect_range, type_error},
    runtime::{
        rt::Rt,
        value::{BuiltinFn, FnObj, HeapObj, Value},
    },
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("print", print),
    ("println", println_),
    ("pr", pr),
    ("prn", prn),
    ("pr-str", pr_str),
    ("print-str", print_str),
    ("newline", newline),
    ("str", str_),
    ("subs", subs),
    ("name", name),
    ("namespace", namespace),
    ("symbol", symbol),
    ("keyword", keyword),
    ("gensym", gensym),
    ("partial", partial),
    ("comp", comp),
];

fn join(rt: &mut Rt, args: &[Value], readable: bool) -> Result<String, Error> {
    let mark = rt.protect(args);
    let mut out = String::new();
    for i in 0..args.len() {
        if i > 0 {
            out.push(' ');
        }
        let v = rt.recall(mark, i);
        let piece = if readable {
            rt.pr_str(v)
        } else {
            rt.display_str(v)
        };
        match piece {
            Ok(piece) => out.push_str(&piece),
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        }
    }
    rt.unprotect(mark);
    Ok(out)
}

fn print(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let text = join(rt, args, false)?;
    rt.write_out(&text);
    Ok(Value::Nil)
}

fn println_(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let mut text = join(rt, args, false)?;
    text.push('\n');
    rt.write_out(&text);
    Ok(Value::Nil)
}

fn pr(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let text = join(rt, args, true)?;
    rt.write_out(&text);
    Ok(Value::Nil)
}

fn prn(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let mut text = join(rt, args, true)?;
    text.push('\n');
    rt.write_out(&text);
    Ok(Value::Nil)
}

fn pr_str(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let text = join(rt, args, true)?;
    Ok(rt.str_value(&text))
}

fn print_str(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let text = join(rt, args, false)?;
    Ok(rt.str_value(&text))
}

fn newline(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("newline", args, 0)?;
    rt.write_out("\n");
    Ok(Value::Nil)
}

/// Concatenates display strings; nil contributes nothing.
fn str_(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let mark = rt.protect(args);
    let mut out = String::new();
    for i in 0..args.len() {
        let v = rt.recall(mark, i);
        if v == Value::Nil {
            continue;
        }
        match rt.display_str(v) {
            Ok(piece) => out.push_str(&piece),
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        }
    }
    rt.unprotect(mark);
    Ok(rt.str_value(&out))
}

/// `(subs s start)` / `(subs s start end)`, by characters.
fn subs(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("subs", args, 2, 3)?;
    let s = match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Str(s) => s.clone(),
            _ => return Err(type_error(rt, "subs", "a string", args[0])),
        },
        bad => return Err(type_error(rt, "subs", "a string", bad)),
    };
    let chars: Vec<char> = s.chars().collect();
    let index = |v: Value| -> Result<usize, Error> {
        match v {
            Value::Int(i) if i >= 0 && (i as usize) <= chars.len() => Ok(i as usize),
            Value::Int(i) => Err(Error::eval(
                crate::common::error::ErrorKind::IndexOutOfBounds,
                &format!("subs index {} out of bounds for a string of {}", i, chars.len()),
            )),
            bad => Err(type_error(rt, "subs", "an integer index", bad)),
        }
    };
    let start = index(args[1])?;
    let end = match args.get(2) {
        Some(v) => index(*v)?,
        None => chars.len(),
    };
    if start > end {
        return Err(Error::eval(
            crate::common::error::ErrorKind::IndexOutOfBounds,
            "subs start is past its end",
        ));
    }
    let sliced: String = chars[start..end].iter().collect();
    Ok(rt.str_value(&sliced))
}

fn name(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("name", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Sym { name, .. } | HeapObj::Keyword { name, .. } => {
                let name = name.clone();
                Ok(rt.str_value(&name))
            }
            HeapObj::Str(_) => Ok(args[0]),
            _ => Err(type_error(rt, "name", "a symbol, keyword, or string", args[0])),
        },
        bad => Err(type_error(rt, "name", "a symbol, keyword, or string", bad)),
    }
}

fn namespace(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("namespace", args, 1)?;
    match args[0] {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Sym { ns, .. } | HeapObj::Keyword { ns, .. } => match ns.clone() {
                Some(ns) => Ok(rt.str_value(&ns)),
                None => Ok(Value::Nil),
            },
            _ => Err(type_error(rt, "namespace", "a symbol or keyword", args[0])),
        },
        bad => Err(type_error(rt, "namespace", "a symbol or keyword", bad)),
    }
}

fn string_arg(rt: &Rt, who: &str, v: Value) -> Result<String, Error> {
    match v {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Str(s) => Ok(s.clone()),
            HeapObj::Sym { name, .. } | HeapObj::Keyword { name, .. } => Ok(name.clone()),
            _ => Err(type_error(rt, who, "a string or named value", v)),
        },
        bad => Err(type_error(rt, who, "a string or named value", bad)),
    }
}

/// `(symbol name)` / `(symbol ns name)`.
fn symbol(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("symbol", args, 1, 2)?;
    match args.len() {
        1 => {
            let name = string_arg(rt, "symbol", args[0])?;
            Ok(rt.sym_value(None, &name))
        }
        _ => {
            let ns = string_arg(rt, "symbol", args[0])?;
            let name = string_arg(rt, "symbol", args[1])?;
            Ok(rt.sym_value(Some(&ns), &name))
        }
    }
}

/// `(keyword name)` / `(keyword ns name)`.
fn keyword(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("keyword", args, 1, 2)?;
    match args.len() {
        1 => {
            let name = string_arg(rt, "keyword", args[0])?;
            Ok(rt.keyword_value(None, &name))
        }
        _ => {
            let ns = string_arg(rt, "keyword", args[0])?;
            let name = string_arg(rt, "keyword", args[1])?;
            Ok(rt.keyword_value(Some(&ns), &name))
        }
    }
}

fn gensym(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("gensym", args, 0, 1)?;
    let prefix = match args.first() {
        None => "G_".to_string(),
        Some(v) => string_arg(rt, "gensym", *v)?,
    };
    rt.gensym_counter += 1;
    let generated = format!("{}{}", prefix, rt.gensym_counter);
    Ok(rt.sym_value(None, &generated))
}

fn partial(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("partial", args, 1)?;
    Ok(rt.alloc(HeapObj::Fn(FnObj::Partial {
        f: args[0],
        args: args[1..].to_vec(),
    })))
}

fn comp(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    Ok(rt.alloc(HeapObj::Fn(FnObj::Comp {
        fns: args.to_vec(),
    })))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::rt::Output;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn str_drops_nil() {
        let mut rt = rt();
        let a = rt.str_value("a");
        let result = str_(&mut rt, &[a, Value::Nil, Value::Int(3)]).unwrap();
        assert_eq!(rt.display_str(result).unwrap(), "a3");
    }

    #[test]
    fn println_reaches_the_buffer() {
        let mut rt = rt();
        rt.out = Output::Capture(String::new());
        let s = rt.str_value("hey");
        println_(&mut rt, &[s, Value::Int(1)]).unwrap();
        match &rt.out {
            Output::Capture(buffer) => assert_eq!(buffer, "hey 1\n"),
            _ => unreachable!(),
        }
    }

    #[test]
    fn pr_quotes_strings() {
        let mut rt = rt();
        let s = rt.str_value("hey");
        let shown = pr_str(&mut rt, &[s]).unwrap();
        assert_eq!(rt.display_str(shown).unwrap(), "\"hey\"");
    }
}
