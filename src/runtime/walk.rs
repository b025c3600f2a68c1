//! The tree-walking evaluator: interprets [`Node`]s directly.
//! It is the reference back end - the VM must agree with it on
//! every observable value - and the one macros run on during
//! analysis.
//!
//! Frame layout matches the VM's: a function activation owns a
//! contiguous run of the shared locals stack, laid out as
//! captures, the optional self slot, parameters, then `let`
//! locals. A nested `fn*` captures the first `capture_count`
//! slots of the frame verbatim, which keeps slot indices stable
//! across nesting.

use crate::{
    common::{
        error::{Error, ErrorKind},
        node::{Catch, ConstPool, FnArity, FnDef, Node, NodeKind},
    },
    runtime::{
        rt::Rt,
        value::{Closure, FnCode, FnObj, HeapObj, Value},
    },
};

/// What a tail-position evaluation produced: a value, or a
/// `recur` carrying the already-evaluated arguments up to the
/// nearest enclosing loop head.
enum Flow {
    Value(Value),
    Recur(usize, Vec<Value>),
}

/// Evaluates one analyzed top-level form.
pub fn run(rt: &mut Rt, node: &Node, pool: &ConstPool) -> Result<Value, Error> {
    rt.active_pools.push(pool.clone());
    let base = rt.wstack.len();
    let result = eval(rt, node, base, pool);
    rt.wstack.truncate(base);
    rt.active_pools.pop();
    result
}

/// Calls a tree-compiled closure. The shared entry point used by
/// `Rt::call`.
pub fn call_closure(rt: &mut Rt, fval: Value, args: &[Value]) -> Result<Value, Error> {
    let (def, env) = match fval {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Fn(FnObj::Closure(Closure {
                code: FnCode::Tree(def),
                env,
                ..
            })) => (def.clone(), env.clone()),
            _ => unreachable!("tree call on a non-tree closure"),
        },
        _ => unreachable!("tree call on a non-closure"),
    };

    let arity = match def.select_arity(args.len()) {
        Some(a) => a.clone(),
        None => {
            return Err(Error::eval(
                ErrorKind::ArityError,
                &format!(
                    "wrong number of arguments ({}) passed to {}",
                    args.len(),
                    def.name.as_deref().unwrap_or("fn")
                ),
            ))
        }
    };

    let base = rt.wstack.len();
    rt.wcallees.push(fval);

    // frame layout: captures, self, params, rest
    debug_assert_eq!(env.len(), def.capture_count);
    rt.wstack.extend_from_slice(&env);
    if def.self_slot.is_some() {
        rt.wstack.push(fval);
    }
    rt.wstack.extend_from_slice(&args[..arity.params]);
    if arity.variadic {
        let rest = if args.len() > arity.params {
            let items = args[arity.params..].to_vec();
            rt.list_value(items)
        } else {
            Value::Nil
        };
        rt.wstack.push(rest);
    }

    let bindings = def.frame_bindings(&arity);
    let result = run_frame(rt, &def, &arity, base, bindings);

    rt.wstack.truncate(base);
    rt.wcallees.pop();
    result.map_err(|e| e.in_call(&def.span))
}

/// The body-with-recur loop shared by function calls.
fn run_frame(
    rt: &mut Rt,
    def: &FnDef,
    arity: &FnArity,
    base: usize,
    bindings: usize,
) -> Result<Value, Error> {
    loop {
        match eval_body_tail(rt, &arity.body, base, &def.consts)? {
            Flow::Value(v) => return Ok(v),
            Flow::Recur(slot_start, args) => {
                rt.wstack.truncate(base + bindings);
                for (i, v) in args.into_iter().enumerate() {
                    rt.wstack[base + slot_start + i] = v;
                }
                // loops must not starve the collector
                rt.safepoint();
            }
        }
    }
}

/// Evaluates a node for its value; `recur` cannot appear here
/// (the analyzer rejected non-tail `recur`).
fn eval(rt: &mut Rt, node: &Node, base: usize, pool: &ConstPool) -> Result<Value, Error> {
    match eval_tail(rt, node, base, pool)? {
        Flow::Value(v) => Ok(v),
        Flow::Recur(..) => Err(Error::eval(
            ErrorKind::InternalError,
            "recur escaped its tail position",
        )
        .at(&node.span)),
    }
}

/// Evaluates a sequence, keeping only the last value.
fn eval_seq(rt: &mut Rt, body: &[Node], base: usize, pool: &ConstPool) -> Result<Value, Error> {
    match body.split_last() {
        None => Ok(Value::Nil),
        Some((last, init)) => {
            for node in init {
                eval(rt, node, base, pool)?;
            }
            eval(rt, last, base, pool)
        }
    }
}

/// Evaluates a body whose final expression is in tail position.
fn eval_body_tail(
    rt: &mut Rt,
    body: &[Node],
    base: usize,
    pool: &ConstPool,
) -> Result<Flow, Error> {
    match body.split_last() {
        None => Ok(Flow::Value(Value::Nil)),
        Some((last, init)) => {
            for node in init {
                eval(rt, node, base, pool)?;
            }
            eval_tail(rt, last, base, pool)
        }
    }
}

fn eval_tail(rt: &mut Rt, node: &Node, base: usize, pool: &ConstPool) -> Result<Flow, Error> {
    let result = match &node.kind {
        NodeKind::Const(id) => Ok(Flow::Value(pool.borrow()[id.0 as usize])),

        NodeKind::Var(v) => {
            let var = rt.env.var(*v);
            if !var.bound {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!("var {} is unbound", var.name),
                )
                .at(&node.span));
            }
            Ok(Flow::Value(rt.env.deref_var(*v)))
        }

        NodeKind::VarQuote(v) => Ok(Flow::Value(Value::Var(*v))),

        NodeKind::Local(slot) => Ok(Flow::Value(rt.wstack[base + slot])),

        NodeKind::If { cond, then, els } => {
            let test = eval(rt, cond, base, pool)?;
            if test.is_truthy() {
                eval_tail(rt, then, base, pool)
            } else {
                eval_tail(rt, els, base, pool)
            }
        }

        NodeKind::Do(body) => eval_body_tail(rt, body, base, pool),

        NodeKind::Let { bindings, body } => {
            let scope_start = rt.wstack.len();
            for (slot, init) in bindings {
                let v = eval(rt, init, base, pool)?;
                debug_assert_eq!(rt.wstack.len(), base + slot);
                rt.wstack.push(v);
            }
            let flow = eval_body_tail(rt, body, base, pool)?;
            rt.wstack.truncate(scope_start);
            Ok(flow)
        }

        NodeKind::Loop { bindings, body } => {
            let scope_start = rt.wstack.len();
            let slot_start = bindings.first().map(|(s, _)| *s).unwrap_or(0);
            let n = bindings.len();
            for (slot, init) in bindings {
                let v = eval(rt, init, base, pool)?;
                debug_assert_eq!(rt.wstack.len(), base + slot);
                rt.wstack.push(v);
            }
            let value = loop {
                match eval_body_tail(rt, body, base, pool)? {
                    Flow::Value(v) => break v,
                    Flow::Recur(target, args) => {
                        debug_assert_eq!(target, slot_start);
                        debug_assert_eq!(args.len(), n);
                        rt.wstack.truncate(base + slot_start + n);
                        for (i, v) in args.into_iter().enumerate() {
                            rt.wstack[base + slot_start + i] = v;
                        }
                        rt.safepoint();
                    }
                }
            };
            rt.wstack.truncate(scope_start);
            Ok(Flow::Value(value))
        }

        NodeKind::Recur { args, slot_start } => {
            let mark = rt.protect(&[]);
            for a in args {
                let v = eval(rt, a, base, pool)?;
                rt.temps.push(v);
            }
            let values = rt.temps[mark..].to_vec();
            rt.unprotect(mark);
            Ok(Flow::Recur(*slot_start, values))
        }

        NodeKind::Fn(def) => {
            let env = rt.wstack[base..base + def.capture_count].to_vec();
            let value = rt.alloc(HeapObj::Fn(FnObj::Closure(Closure {
                code: FnCode::Tree(def.clone()),
                env,
                meta: Value::Nil,
            })));
            Ok(Flow::Value(value))
        }

        NodeKind::LetFn {
            slot_start,
            bindings,
            body,
        } => {
            let scope_start = rt.wstack.len();
            // placeholders first, so every sibling is in scope
            for (slot, _) in bindings {
                debug_assert_eq!(rt.wstack.len(), base + slot);
                rt.wstack.push(Value::Nil);
            }
            for (slot, def) in bindings {
                let env = rt.wstack[base..base + def.capture_count].to_vec();
                let value = rt.alloc(HeapObj::Fn(FnObj::Closure(Closure {
                    code: FnCode::Tree(def.clone()),
                    env,
                    meta: Value::Nil,
                })));
                rt.wstack[base + slot] = value;
            }
            // re-point the captured placeholders at the finished
            // functions: this is what lets them call each other
            let finals: Vec<Value> =
                rt.wstack[base + slot_start..base + slot_start + bindings.len()].to_vec();
            for value in finals.iter() {
                if let Value::Obj(r) = value {
                    if let HeapObj::Fn(FnObj::Closure(c)) = rt.heap.get_mut(*r) {
                        for (i, v) in finals.iter().enumerate() {
                            let at = slot_start + i;
                            if at < c.env.len() {
                                c.env[at] = *v;
                            }
                        }
                    }
                }
            }
            let flow = eval_body_tail(rt, body, base, pool)?;
            rt.wstack.truncate(scope_start);
            Ok(flow)
        }

        NodeKind::Call { f, args } => {
            let fv = eval(rt, f, base, pool)?;
            let mark = rt.protect(&[fv]);
            for a in args {
                match eval(rt, a, base, pool) {
                    Ok(v) => rt.temps.push(v),
                    Err(e) => {
                        rt.unprotect(mark);
                        return Err(e);
                    }
                }
            }
            let fv = rt.recall(mark, 0);
            let argv: Vec<Value> = rt.temps[mark + 1..].to_vec();
            rt.unprotect(mark);
            rt.call(fv, &argv).map(Flow::Value)
        }

        NodeKind::Def { var, init, once } => {
            if *once && rt.env.var(*var).bound {
                return Ok(Flow::Value(Value::Var(*var)));
            }
            if let Some(init) = init {
                let v = eval(rt, init, base, pool)?;
                rt.env.bind_root(*var, v);
            }
            Ok(Flow::Value(Value::Var(*var)))
        }

        NodeKind::Set { var, expr } => {
            let v = eval(rt, expr, base, pool)?;
            if !rt.env.set_dynamic(*var, v) {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!(
                        "can't set! var {} - it has no active dynamic binding",
                        rt.env.var(*var).name
                    ),
                )
                .at(&node.span));
            }
            Ok(Flow::Value(v))
        }

        NodeKind::Throw(expr) => {
            let v = eval(rt, expr, base, pool)?;
            // printing may force lazy values and collect
            let mark = rt.protect(&[v]);
            let shown = rt.pr_str(v);
            let v = rt.recall(mark, 0);
            rt.unprotect(mark);
            Err(Error::thrown(v, &shown?).at(&node.span))
        }

        NodeKind::Try {
            body,
            catch,
            finally,
        } => {
            let saved = rt.wstack.len();
            let saved_temps = rt.temps.len();
            let mut outcome = eval_seq(rt, body, base, pool);

            if let Err(error) = &outcome {
                if error.kind != ErrorKind::InternalError {
                    if let Some(clause) = catch {
                        if catch_matches(rt, error, clause) {
                            // unwind this frame's scopes before
                            // entering the handler
                            rt.wstack.truncate(saved);
                            rt.temps.truncate(saved_temps);
                            let payload = payload_value(rt, error);
                            debug_assert_eq!(rt.wstack.len(), base + clause.slot);
                            rt.wstack.push(payload);
                            outcome = eval_seq(rt, &clause.body, base, pool);
                            rt.wstack.truncate(saved);
                        }
                    }
                }
            }

            if let Some(finally) = finally {
                rt.wstack.truncate(saved);
                rt.temps.truncate(saved_temps);
                // the in-flight result (or thrown payload) must
                // survive any collection the cleanup triggers
                let mark = match &outcome {
                    Ok(v) => Some(rt.protect(&[*v])),
                    Err(e) => e.payload.map(|p| rt.protect(&[p])),
                };
                let cleanup = eval_seq(rt, finally, base, pool);
                if let Some(mark) = mark {
                    let moved = rt.recall(mark, 0);
                    rt.unprotect(mark);
                    match &mut outcome {
                        Ok(v) => *v = moved,
                        Err(e) => e.payload = Some(moved),
                    }
                }
                // an error in finally wins, as in the original
                if let Err(e) = cleanup {
                    outcome = Err(e);
                }
            }

            outcome.map(Flow::Value)
        }

        NodeKind::Vector(items) => {
            let mark = rt.protect(&[]);
            for item in items {
                match eval(rt, item, base, pool) {
                    Ok(v) => rt.temps.push(v),
                    Err(e) => {
                        rt.unprotect(mark);
                        return Err(e);
                    }
                }
            }
            let values = rt.temps[mark..].to_vec();
            rt.unprotect(mark);
            Ok(Flow::Value(rt.vector_value(values)))
        }

        NodeKind::MapLit(pairs) => {
            let mark = rt.protect(&[]);
            for (k, v) in pairs {
                match eval(rt, k, base, pool).and_then(|kv| {
                    rt.temps.push(kv);
                    eval(rt, v, base, pool)
                }) {
                    Ok(vv) => rt.temps.push(vv),
                    Err(e) => {
                        rt.unprotect(mark);
                        return Err(e);
                    }
                }
            }
            let flat = rt.temps[mark..].to_vec();
            rt.unprotect(mark);

            let mut entries: Vec<(Value, Value)> = vec![];
            for chunk in flat.chunks(2) {
                let (k, v) = (chunk[0], chunk[1]);
                if entries.iter().any(|(seen, _)| rt.heap.equal(*seen, k)) {
                    let shown = rt.pr_str(k)?;
                    return Err(Error::eval(
                        ErrorKind::DuplicateKey,
                        &format!("duplicate key {} in map", shown),
                    )
                    .at(&node.span));
                }
                entries.push((k, v));
            }
            Ok(Flow::Value(rt.map_value(entries)))
        }

        NodeKind::SetLit(items) => {
            let mark = rt.protect(&[]);
            for item in items {
                match eval(rt, item, base, pool) {
                    Ok(v) => rt.temps.push(v),
                    Err(e) => {
                        rt.unprotect(mark);
                        return Err(e);
                    }
                }
            }
            let values = rt.temps[mark..].to_vec();
            rt.unprotect(mark);

            let mut members: Vec<Value> = vec![];
            for v in values {
                if members.iter().any(|seen| rt.heap.equal(*seen, v)) {
                    let shown = rt.pr_str(v)?;
                    return Err(Error::eval(
                        ErrorKind::DuplicateKey,
                        &format!("duplicate element {} in set", shown),
                    )
                    .at(&node.span));
                }
                members.push(v);
            }
            Ok(Flow::Value(rt.set_value(members)))
        }
    };

    result.map_err(|e| e.at(&node.span))
}

/// Does a catch clause apply to this error? A clause without a
/// class catches everything; `Exception`, `Throwable`, and
/// `Error` are catch-alls by name; otherwise the payload's type
/// name decides.
fn catch_matches(rt: &Rt, error: &Error, clause: &Catch) -> bool {
    match &clause.class {
        None => true,
        Some(class) => match class.as_str() {
            "Exception" | "Throwable" | "Error" => true,
            class => match error.payload {
                Some(v) => rt.heap.type_name(v) == class
                    || crate::runtime::value::TypeTag::from_name(class)
                        == Some(rt.heap.tag_of(v)),
                None => false,
            },
        },
    }
}

/// The value a catch clause binds: the thrown payload, or for
/// errors the runtime raised itself, a map of `:kind` and
/// `:message`.
fn payload_value(rt: &mut Rt, error: &Error) -> Value {
    if let Some(v) = error.payload {
        return v;
    }
    let kind_key = rt.kw("kind");
    let kind = {
        let name = format!("{}", error.kind);
        let slug = name.replace(' ', "-");
        rt.kw(&slug)
    };
    let message_key = rt.kw("message");
    let message = rt.str_value(&error.message);
    rt.map_value(vec![(kind_key, kind), (message_key, message)])
}
