//! Realization of lazy sequences, shared by both back ends and
//! by every sequence builtin.
//!
//! The contract: forcing the first element of a lazy cell
//! rewrites the cell in place into a realized cons (or empty),
//! so a producer runs at most once per element no matter how many
//! times the sequence is walked. Tails are fresh unforced cells
//! carrying the advanced state.
//!
//! Everything here may call back into user code (thunks,
//! transform functions), which means a collection can run under
//! our feet at a `recur` safe point; handles held across those
//! calls go through the temp-root stack.

use crate::{
    common::error::{Error, ErrorKind},
    runtime::{
        heap::ObjRef,
        rt::Rt,
        value::{Generator, HeapObj, LazySeq, TransformKind, Value},
    },
};

/// Allocates a fresh lazy cell.
pub fn make(rt: &mut Rt, seq: LazySeq) -> Value {
    rt.alloc(HeapObj::Lazy(seq))
}

/// Steps a seqable value: `None` for an exhausted sequence,
/// otherwise the head and a value representing the rest.
/// Lists, vectors, maps, sets, and strings are seqable; a lazy
/// cell is forced (and caches its result).
pub fn seq_next(rt: &mut Rt, v: Value) -> Result<Option<(Value, Value)>, Error> {
    match v {
        Value::Nil => Ok(None),
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::List { items, .. } | HeapObj::Vector { items, .. } => {
                if items.is_empty() {
                    return Ok(None);
                }
                let head = items[0];
                let rest = items[1..].to_vec();
                let tail = rt.list_value(rest);
                Ok(Some((head, tail)))
            }
            HeapObj::Set { items, .. } => {
                if items.is_empty() {
                    return Ok(None);
                }
                let head = items[0];
                let rest = items[1..].to_vec();
                let tail = rt.list_value(rest);
                Ok(Some((head, tail)))
            }
            HeapObj::Map { entries, .. } => {
                if entries.is_empty() {
                    return Ok(None);
                }
                let (k, val) = entries[0];
                let rest: Vec<(Value, Value)> = entries[1..].to_vec();
                // allocation never collects; only safe points do
                let head = rt.vector_value(vec![k, val]);
                let rest_vals: Vec<Value> = rest
                    .into_iter()
                    .map(|(k, v)| rt.vector_value(vec![k, v]))
                    .collect();
                let tail = rt.list_value(rest_vals);
                Ok(Some((head, tail)))
            }
            HeapObj::Str(s) => {
                let mut chars = s.chars();
                match chars.next() {
                    None => Ok(None),
                    Some(c) => {
                        let rest: Vec<Value> = chars.map(Value::Char).collect();
                        let tail = rt.list_value(rest);
                        Ok(Some((Value::Char(c), tail)))
                    }
                }
            }
            HeapObj::Lazy(_) => force(rt, r),
            other => Err(Error::eval(
                ErrorKind::TypeError,
                &format!("a {} is not seqable", other.tag().name()),
            )),
        },
        other => Err(Error::eval(
            ErrorKind::TypeError,
            &format!("a {} is not seqable", rt.heap.type_name(other)),
        )),
    }
}

/// Forces one lazy cell, caching the outcome in place.
fn force(rt: &mut Rt, r: ObjRef) -> Result<Option<(Value, Value)>, Error> {
    let state = match rt.heap.get(r) {
        HeapObj::Lazy(l) => l.clone(),
        _ => unreachable!("force on a non-lazy object"),
    };

    match state {
        LazySeq::Cons { head, tail } => Ok(Some((head, tail))),
        LazySeq::Empty => Ok(None),

        LazySeq::Thunk(f) => {
            let mark = rt.protect(&[Value::Obj(r)]);
            let produced = rt.call(f, &[]);
            let cell = rt.recall(mark, 0);
            rt.unprotect(mark);
            let produced = produced?;

            let mark = rt.protect(&[cell]);
            let step = seq_next(rt, produced);
            let cell = rt.recall(mark, 0);
            rt.unprotect(mark);

            cache(rt, cell, step?)
        }

        LazySeq::Transform {
            source,
            f,
            kind,
            pending,
        } => {
            if !pending.is_empty() {
                let head = pending[0];
                let rest = pending[1..].to_vec();
                let tail = make(
                    rt,
                    LazySeq::Transform {
                        source,
                        f,
                        kind,
                        pending: rest,
                    },
                );
                return cache(rt, Value::Obj(r), Some((head, tail)));
            }

            // all three handles are re-read after every call that
            // could have collected; holding any of them across an
            // iteration would leave it pointing at the old arena
            let mut cell = Value::Obj(r);
            let mut f = f;
            let mut source = source;
            loop {
                let mark = rt.protect(&[cell, f]);
                let step = seq_next(rt, source);
                cell = rt.recall(mark, 0);
                f = rt.recall(mark, 1);
                rt.unprotect(mark);

                let (x, src_rest) = match step? {
                    None => return cache(rt, cell, None),
                    Some(pair) => pair,
                };

                match kind {
                    TransformKind::Map => {
                        let mark = rt.protect(&[cell, f, src_rest]);
                        let y = rt.call(f, &[x]);
                        let cell = rt.recall(mark, 0);
                        let f = rt.recall(mark, 1);
                        let src_rest = rt.recall(mark, 2);
                        rt.unprotect(mark);
                        let y = y?;

                        let tail = make(
                            rt,
                            LazySeq::Transform {
                                source: src_rest,
                                f,
                                kind,
                                pending: vec![],
                            },
                        );
                        return cache(rt, cell, Some((y, tail)));
                    }
                    TransformKind::Filter => {
                        let mark = rt.protect(&[cell, f, x, src_rest]);
                        let keep = rt.call(f, &[x]);
                        cell = rt.recall(mark, 0);
                        f = rt.recall(mark, 1);
                        let x = rt.recall(mark, 2);
                        let src_rest = rt.recall(mark, 3);
                        rt.unprotect(mark);

                        if keep?.is_truthy() {
                            let tail = make(
                                rt,
                                LazySeq::Transform {
                                    source: src_rest,
                                    f,
                                    kind,
                                    pending: vec![],
                                },
                            );
                            return cache(rt, cell, Some((x, tail)));
                        }
                        source = src_rest;
                        continue;
                    }
                    TransformKind::MapCat => {
                        let mark = rt.protect(&[cell, f, src_rest]);
                        let y = rt.call(f, &[x]);
                        cell = rt.recall(mark, 0);
                        f = rt.recall(mark, 1);
                        let mut src_rest = rt.recall(mark, 2);
                        rt.unprotect(mark);
                        let y = y?;

                        let mark = rt.protect(&[cell, f, src_rest]);
                        let produced = to_vec(rt, y, None);
                        cell = rt.recall(mark, 0);
                        f = rt.recall(mark, 1);
                        src_rest = rt.recall(mark, 2);
                        rt.unprotect(mark);
                        let produced = produced?;

                        if produced.is_empty() {
                            source = src_rest;
                            continue;
                        }

                        let head = produced[0];
                        let rest = produced[1..].to_vec();
                        let tail = make(
                            rt,
                            LazySeq::Transform {
                                source: src_rest,
                                f,
                                kind,
                                pending: rest,
                            },
                        );
                        return cache(rt, cell, Some((head, tail)));
                    }
                }
            }
        }

        LazySeq::Concat { sources } => {
            let mut cell = Value::Obj(r);
            let mut sources = sources;
            loop {
                if sources.is_empty() {
                    return cache(rt, cell, None);
                }
                let first = sources[0];

                let mark = rt.protect(&[cell]);
                let rest_mark = rt.protect(&sources[1..]);
                let step = seq_next(rt, first);
                cell = rt.recall(mark, 0);
                let rest_sources: Vec<Value> = rt.temps[rest_mark..].to_vec();
                rt.unprotect(mark);

                match step? {
                    Some((head, tail)) => {
                        let mut next_sources = vec![tail];
                        next_sources.extend(rest_sources);
                        let new_tail = make(
                            rt,
                            LazySeq::Concat {
                                sources: next_sources,
                            },
                        );
                        return cache(rt, cell, Some((head, new_tail)));
                    }
                    None => {
                        sources = rest_sources;
                    }
                }
            }
        }

        LazySeq::Gen(gen) => match gen {
            Generator::Iterate { f, next } => {
                let mark = rt.protect(&[Value::Obj(r), f, next]);
                let advanced = rt.call(f, &[next]);
                let cell = rt.recall(mark, 0);
                let f = rt.recall(mark, 1);
                let head = rt.recall(mark, 2);
                rt.unprotect(mark);
                let advanced = advanced?;

                let mark = rt.protect(&[cell, head]);
                let tail = make(rt, LazySeq::Gen(Generator::Iterate { f, next: advanced }));
                let cell = rt.recall(mark, 0);
                let head = rt.recall(mark, 1);
                rt.unprotect(mark);
                cache(rt, cell, Some((head, tail)))
            }
            Generator::Repeat { item, remaining } => match remaining {
                Some(n) if n <= 0 => cache(rt, Value::Obj(r), None),
                _ => {
                    let tail = make(
                        rt,
                        LazySeq::Gen(Generator::Repeat {
                            item,
                            remaining: remaining.map(|n| n - 1),
                        }),
                    );
                    cache(rt, Value::Obj(r), Some((item, tail)))
                }
            },
            Generator::Cycle { items, at } => {
                if items.is_empty() {
                    return cache(rt, Value::Obj(r), None);
                }
                let head = items[at];
                let next_at = (at + 1) % items.len();
                let tail = make(rt, LazySeq::Gen(Generator::Cycle { items, at: next_at }));
                cache(rt, Value::Obj(r), Some((head, tail)))
            }
            Generator::Range { next, end, step } => {
                let done = match end {
                    None => false,
                    Some(end) => {
                        if step >= 0 {
                            next >= end
                        } else {
                            next <= end
                        }
                    }
                };
                if done {
                    return cache(rt, Value::Obj(r), None);
                }
                let tail = make(
                    rt,
                    LazySeq::Gen(Generator::Range {
                        next: next + step,
                        end,
                        step,
                    }),
                );
                cache(rt, Value::Obj(r), Some((Value::Int(next), tail)))
            }
        },
    }
}

/// Rewrites a forced cell into its realized form and passes the
/// step through.
fn cache(
    rt: &mut Rt,
    cell: Value,
    step: Option<(Value, Value)>,
) -> Result<Option<(Value, Value)>, Error> {
    let r = match cell {
        Value::Obj(r) => r,
        _ => unreachable!("lazy cell handle lost"),
    };
    *rt.heap.get_mut(r) = match step {
        Some((head, tail)) => HeapObj::Lazy(LazySeq::Cons { head, tail }),
        None => HeapObj::Lazy(LazySeq::Empty),
    };
    Ok(step)
}

/// Realizes a sequence into a Rust vector, up to `limit` elements
/// if one is given. The accumulated heads ride the temp-root
/// stack so they survive any collection a producer triggers.
pub fn to_vec(rt: &mut Rt, v: Value, limit: Option<usize>) -> Result<Vec<Value>, Error> {
    let mark = rt.protect(&[v]);
    loop {
        if let Some(limit) = limit {
            if rt.temps.len() - mark - 1 >= limit {
                break;
            }
        }
        let cursor = rt.recall(mark, 0);
        match seq_next(rt, cursor)? {
            Some((head, tail)) => {
                rt.temps[mark] = tail;
                rt.temps.push(head);
            }
            None => break,
        }
    }
    let items = rt.temps[mark + 1..].to_vec();
    rt.unprotect(mark);
    Ok(items)
}

/// Walks the whole spine of a lazy sequence, realizing every
/// cell, and returns the same value (`doall`).
pub fn force_all(rt: &mut Rt, v: Value) -> Result<Value, Error> {
    let mark = rt.protect(&[v, v]);
    loop {
        let cursor = rt.recall(mark, 1);
        match seq_next(rt, cursor)? {
            Some((_, tail)) => rt.temps[mark + 1] = tail,
            None => break,
        }
    }
    let original = rt.recall(mark, 0);
    rt.unprotect(mark);
    Ok(original)
}

#[cfg(test)]
mod test {
    use super::*;

    fn rt() -> Rt {
        Rt::new(usize::MAX, 256, 1024)
    }

    #[test]
    fn range_steps() {
        let mut rt = rt();
        let r = make(
            &mut rt,
            LazySeq::Gen(Generator::Range {
                next: 0,
                end: Some(3),
                step: 1,
            }),
        );
        let items = to_vec(&mut rt, r, None).unwrap();
        assert_eq!(items, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
    }

    #[test]
    fn forcing_caches() {
        let mut rt = rt();
        let r = make(
            &mut rt,
            LazySeq::Gen(Generator::Range {
                next: 5,
                end: None,
                step: 2,
            }),
        );
        let first = seq_next(&mut rt, r).unwrap().unwrap();
        let again = seq_next(&mut rt, r).unwrap().unwrap();
        assert_eq!(first.0, Value::Int(5));
        // the cell realized in place: same head, same tail handle
        assert_eq!(first, again);
    }

    #[test]
    fn repeat_bounded() {
        let mut rt = rt();
        let r = make(
            &mut rt,
            LazySeq::Gen(Generator::Repeat {
                item: Value::Int(7),
                remaining: Some(2),
            }),
        );
        let items = to_vec(&mut rt, r, None).unwrap();
        assert_eq!(items, vec![Value::Int(7), Value::Int(7)]);
    }

    #[test]
    fn to_vec_respects_limit() {
        let mut rt = rt();
        let r = make(
            &mut rt,
            LazySeq::Gen(Generator::Range {
                next: 0,
                end: None,
                step: 1,
            }),
        );
        let items = to_vec(&mut rt, r, Some(4)).unwrap();
        assert_eq!(items.len(), 4);
    }
}
