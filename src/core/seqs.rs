//! Sequence builtins: the lazy constructors backed by the
//! realization engine, and the eager folds. The derived
//! functions (`take`, `drop`, `every?`, ...) live in `core.clj`
//! on top of these.

use crate::{
    common::error::{Error, ErrorKind},
    core::{expect_at_least, expect_exact, expect_range, type_error},
    runtime::{
        lazy,
        rt::Rt,
        value::{BuiltinFn, Generator, HeapObj, LazySeq, TransformKind, Value},
    },
};

pub const TABLE: &[(&str, BuiltinFn)] = &[
    ("lazy-seq*", lazy_seq_star),
    ("map", map),
    ("filter", filter),
    ("mapcat", mapcat),
    ("concat", concat),
    ("iterate", iterate),
    ("repeat", repeat),
    ("cycle", cycle),
    ("range", range),
    ("reduce", reduce),
    ("apply", apply),
    ("doall", doall),
    ("dorun", dorun),
    ("sort", sort),
    ("sort-by", sort_by),
    ("reduced", reduced),
];

/// The primitive under the `lazy-seq` macro: wraps a
/// zero-argument function as an unforced cell.
fn lazy_seq_star(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("lazy-seq*", args, 1)?;
    Ok(lazy::make(rt, LazySeq::Thunk(args[0])))
}

fn transform(
    rt: &mut Rt,
    name: &str,
    kind: TransformKind,
    args: &[Value],
) -> Result<Value, Error> {
    expect_exact(name, args, 2)?;
    Ok(lazy::make(
        rt,
        LazySeq::Transform {
            source: args[1],
            f: args[0],
            kind,
            pending: vec![],
        },
    ))
}

/// Unary `map` is lazy; the n-collection arity walks eagerly in
/// lockstep over finite collections. The cursors live in the
/// protected region (reusing the argument slots) so stepping one
/// sequence can't strand the others.
fn map(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("map", args, 2)?;
    if args.len() == 2 {
        return transform(rt, "map", TransformKind::Map, args);
    }

    let n_colls = args.len() - 1;
    let mark = rt.protect(args); // f at +0, cursors at +1..
    let out_mark = rt.temps.len(); // results accumulate here
    loop {
        // step every collection; stop at the shortest
        let mut heads: Vec<Value> = vec![];
        let mut done = false;
        for i in 0..n_colls {
            let head_mark = rt.protect(&heads);
            let cursor = rt.recall(mark, 1 + i);
            let step = lazy::seq_next(rt, cursor);
            for (j, head) in heads.iter_mut().enumerate() {
                *head = rt.recall(head_mark, j);
            }
            rt.unprotect(head_mark);
            match step {
                Ok(Some((head, tail))) => {
                    heads.push(head);
                    rt.temps[mark + 1 + i] = tail;
                }
                Ok(None) => {
                    done = true;
                    break;
                }
                Err(e) => {
                    rt.unprotect(mark);
                    return Err(e);
                }
            }
        }
        if done {
            break;
        }
        let f = rt.recall(mark, 0);
        match rt.call(f, &heads) {
            Ok(v) => rt.temps.push(v),
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        }
    }
    let out = rt.temps[out_mark..].to_vec();
    rt.unprotect(mark);
    Ok(rt.list_value(out))
}

fn filter(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    transform(rt, "filter", TransformKind::Filter, args)
}

fn mapcat(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    transform(rt, "mapcat", TransformKind::MapCat, args)
}

fn concat(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    Ok(lazy::make(
        rt,
        LazySeq::Concat {
            sources: args.to_vec(),
        },
    ))
}

fn iterate(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("iterate", args, 2)?;
    Ok(lazy::make(
        rt,
        LazySeq::Gen(Generator::Iterate {
            f: args[0],
            next: args[1],
        }),
    ))
}

/// `(repeat x)` forever, `(repeat n x)` bounded.
fn repeat(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("repeat", args, 1, 2)?;
    let (item, remaining) = match args {
        [item] => (*item, None),
        [n, item] => match n {
            Value::Int(n) => (*item, Some(*n)),
            bad => return Err(type_error(rt, "repeat", "an integer count", *bad)),
        },
        _ => unreachable!(),
    };
    Ok(lazy::make(
        rt,
        LazySeq::Gen(Generator::Repeat { item, remaining }),
    ))
}

fn cycle(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("cycle", args, 1)?;
    let items = lazy::to_vec(rt, args[0], None)?;
    Ok(lazy::make(
        rt,
        LazySeq::Gen(Generator::Cycle { items, at: 0 }),
    ))
}

/// `(range)`, `(range end)`, `(range start end)`,
/// `(range start end step)`.
fn range(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    let int = |name: &str, v: Value| -> Result<i64, Error> {
        match v {
            Value::Int(n) => Ok(n),
            bad => Err(type_error(rt, name, "an integer", bad)),
        }
    };
    let (next, end, step) = match args {
        [] => (0, None, 1),
        [end] => (0, Some(int("range", *end)?), 1),
        [start, end] => (int("range", *start)?, Some(int("range", *end)?), 1),
        [start, end, step] => (
            int("range", *start)?,
            Some(int("range", *end)?),
            int("range", *step)?,
        ),
        _ => {
            return Err(crate::core::arity_error("range", "0 to 3", args.len()));
        }
    };
    if step == 0 {
        return Err(Error::eval(
            ErrorKind::TypeError,
            "range with a zero step never advances",
        ));
    }
    Ok(lazy::make(
        rt,
        LazySeq::Gen(Generator::Range { next, end, step }),
    ))
}

/// `(reduce f coll)` / `(reduce f init coll)`, stopping early on
/// a `reduced` wrapper. Walks element by element so a lazy
/// source realizes in bounded memory.
fn reduce(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("reduce", args, 2, 3)?;
    let f = args[0];

    // slots: f, acc, cursor
    let mark = match args.len() {
        2 => {
            let coll = args[1];
            let first_mark = rt.protect(&[f]);
            let step = lazy::seq_next(rt, coll)?;
            let f = rt.recall(first_mark, 0);
            rt.unprotect(first_mark);
            match step {
                None => {
                    // (reduce f ()) calls f with no arguments
                    return rt.call(f, &[]);
                }
                Some((head, tail)) => rt.protect(&[f, head, tail]),
            }
        }
        _ => rt.protect(&[f, args[1], args[2]]),
    };

    loop {
        let acc = rt.recall(mark, 1);
        if let Value::Obj(r) = acc {
            if let HeapObj::Reduced(inner) = rt.heap.get(r) {
                let inner = *inner;
                rt.unprotect(mark);
                return Ok(inner);
            }
        }

        let cursor = rt.recall(mark, 2);
        let step = match lazy::seq_next(rt, cursor) {
            Ok(step) => step,
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        };
        let (head, tail) = match step {
            None => {
                let acc = rt.recall(mark, 1);
                rt.unprotect(mark);
                return Ok(acc);
            }
            Some(pair) => pair,
        };
        rt.temps[mark + 2] = tail;

        let f = rt.recall(mark, 0);
        let acc = rt.recall(mark, 1);
        match rt.call(f, &[acc, head]) {
            Ok(next_acc) => rt.temps[mark + 1] = next_acc,
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        }
    }
}

fn reduced(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("reduced", args, 1)?;
    Ok(rt.alloc(HeapObj::Reduced(args[0])))
}

/// `(apply f a b [c d])` => `(f a b c d)`.
fn apply(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_at_least("apply", args, 2)?;
    let mark = rt.protect(args);
    let trailing = rt.recall(mark, args.len() - 1);
    let spread = lazy::to_vec(rt, trailing, None);
    let f = rt.recall(mark, 0);
    let mut call_args: Vec<Value> =
        (1..args.len() - 1).map(|i| rt.recall(mark, i)).collect();
    rt.unprotect(mark);
    call_args.extend(spread?);
    rt.call(f, &call_args)
}

fn doall(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("doall", args, 1)?;
    lazy::force_all(rt, args[0])
}

fn dorun(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_exact("dorun", args, 1)?;
    lazy::force_all(rt, args[0])?;
    Ok(Value::Nil)
}

/// `(sort coll)` / `(sort cmp coll)` over the realized elements;
/// the comparator defaults to `compare`.
fn sort(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("sort", args, 1, 2)?;
    let (cmp, coll) = match args {
        [coll] => (None, *coll),
        [cmp, coll] => (Some(*cmp), *coll),
        _ => unreachable!(),
    };
    let mark = rt.protect(&[cmp.unwrap_or(Value::Nil)]);
    let items = lazy::to_vec(rt, coll, None);
    let cmp = cmp.map(|_| rt.recall(mark, 0));
    rt.unprotect(mark);
    sorted(rt, items?, cmp, None)
}

/// `(sort-by keyfn coll)` / `(sort-by keyfn cmp coll)`.
fn sort_by(rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
    expect_range("sort-by", args, 2, 3)?;
    let (keyfn, cmp, coll) = match args {
        [keyfn, coll] => (*keyfn, None, *coll),
        [keyfn, cmp, coll] => (*keyfn, Some(*cmp), *coll),
        _ => unreachable!(),
    };
    let mark = rt.protect(&[keyfn, cmp.unwrap_or(Value::Nil)]);
    let items = lazy::to_vec(rt, coll, None);
    let keyfn = rt.recall(mark, 0);
    let cmp = cmp.map(|_| rt.recall(mark, 1));
    rt.unprotect(mark);
    sorted(rt, items?, cmp, Some(keyfn))
}

/// Stable insertion sort: quadratic, but the comparator calls
/// back into user code, which rules out the std sort.
fn sorted(
    rt: &mut Rt,
    items: Vec<Value>,
    cmp: Option<Value>,
    keyfn: Option<Value>,
) -> Result<Value, Error> {
    let mark = rt.protect(&items);
    let cmp_slot = cmp.map(|c| rt.protect(&[c]));
    let key_slot = keyfn.map(|k| rt.protect(&[k]));
    let n = items.len();
    let mut order: Vec<usize> = (0..n).collect();

    let outcome = (|| -> Result<(), Error> {
        for i in 1..n {
            let mut j = i;
            while j > 0 {
                let a = rt.recall(mark, order[j - 1]);
                let b = rt.recall(mark, order[j]);
                let (ka, kb) = apply_key(rt, key_slot, a, b)?;
                if comes_after(rt, cmp_slot, ka, kb)? {
                    order.swap(j - 1, j);
                    j -= 1;
                } else {
                    break;
                }
            }
        }
        Ok(())
    })();

    let sorted_items: Vec<Value> = order.iter().map(|i| rt.recall(mark, *i)).collect();
    rt.unprotect(mark);
    outcome?;
    Ok(rt.list_value(sorted_items))
}

/// Applies the sort key function to both operands, or passes
/// them through.
fn apply_key(
    rt: &mut Rt,
    key_slot: Option<usize>,
    a: Value,
    b: Value,
) -> Result<(Value, Value), Error> {
    let km = match key_slot {
        None => return Ok((a, b)),
        Some(km) => km,
    };
    let k = rt.recall(km, 0);
    let pm = rt.protect(&[b]);
    let ka = rt.call(k, &[a])?;
    let b = rt.recall(pm, 0);
    let k = rt.recall(km, 0);
    rt.temps[pm] = ka;
    let kb = rt.call(k, &[b])?;
    let ka = rt.recall(pm, 0);
    rt.unprotect(pm);
    Ok((ka, kb))
}

/// Should `a` sort after `b`? Integer comparators use their
/// sign; boolean comparators are "does the first come first".
fn comes_after(
    rt: &mut Rt,
    cmp_slot: Option<usize>,
    a: Value,
    b: Value,
) -> Result<bool, Error> {
    let cm = match cmp_slot {
        None => return Ok(crate::core::logic::compare_pub(rt, a, b)?.is_gt()),
        Some(cm) => cm,
    };
    let f = rt.recall(cm, 0);
    let pm = rt.protect(&[a, b]);
    let forward = rt.call(f, &[a, b]);
    let a = rt.recall(pm, 0);
    let b = rt.recall(pm, 1);
    rt.unprotect(pm);
    match forward? {
        Value::Int(ordering) => Ok(ordering > 0),
        v if v.is_truthy() => Ok(false),
        _ => {
            let f = rt.recall(cm, 0);
            let back = rt.call(f, &[b, a])?;
            Ok(back.is_truthy())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn range_realizes() {
        let mut rt = rt();
        let r = range(&mut rt, &[Value::Int(4)]).unwrap();
        assert_eq!(rt.pr_str(r).unwrap(), "(0 1 2 3)");
    }

    #[test]
    fn concat_is_lazy_over_sources() {
        let mut rt = rt();
        let a = rt.list_value(vec![Value::Int(1)]);
        let infinite = range(&mut rt, &[]).unwrap();
        let joined = concat(&mut rt, &[a, infinite]).unwrap();
        // only the first element is forced
        let first = lazy::seq_next(&mut rt, joined).unwrap().unwrap().0;
        assert_eq!(first, Value::Int(1));
    }

    #[test]
    fn sort_numbers() {
        let mut rt = rt();
        let l = rt.list_value(vec![Value::Int(3), Value::Int(1), Value::Int(2)]);
        let s = sort(&mut rt, &[l]).unwrap();
        assert_eq!(rt.pr_str(s).unwrap(), "(1 2 3)");
    }

    #[test]
    fn repeat_bounded_realizes() {
        let mut rt = rt();
        let r = repeat(&mut rt, &[Value::Int(3), Value::Char('x')]).unwrap();
        assert_eq!(rt.pr_str(r).unwrap(), "(\\x \\x \\x)");
    }
}
