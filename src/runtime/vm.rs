//! The bytecode VM: a stack machine over the shared value
//! representation. Frames index into the one value stack owned
//! by [`Rt`], so every live operand is a GC root at the `recur`
//! safe point. The VM trusts the compiler: slot indices,
//! capture counts, and stack depths are taken verbatim from the
//! prototype, and a disagreement is silent corruption - which is
//! exactly why comparison mode exists.

use crate::{
    common::{
        error::{Error, ErrorKind},
        opcode::Opcode,
        proto::ProtoRef,
    },
    core::collections,
    runtime::{
        rt::Rt,
        value::{Closure, FnCode, FnObj, HeapObj, TypeTag, Value},
    },
};

/// One active call.
struct Frame {
    base: usize,
    ip: usize,
    proto: ProtoRef,
    arity: usize,
    handlers: Vec<Handler>,
}

/// An exception handler installed by `TryPush`. Targets are
/// `u16::MAX` when absent.
struct Handler {
    catch_ip: u16,
    finally_ip: u16,
    class_const: u16,
    stack_len: usize,
}

const NONE: u16 = u16::MAX;

/// Calls a compiled closure. The shared entry point used by
/// `Rt::call`.
pub fn call_closure(rt: &mut Rt, fval: Value, args: &[Value]) -> Result<Value, Error> {
    let (proto_ref, env) = match fval {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Fn(FnObj::Closure(Closure {
                code: FnCode::Compiled(p),
                env,
                ..
            })) => (*p, env.clone()),
            _ => unreachable!("vm call on a non-compiled closure"),
        },
        _ => unreachable!("vm call on a non-closure"),
    };

    let mut frames = vec![];
    push_frame(rt, &mut frames, fval, proto_ref, env, args)?;

    let result = execute(rt, &mut frames);

    if result.is_err() {
        // unwinding already truncated handled frames; drop the rest
        while let Some(frame) = frames.pop() {
            rt.vstack.truncate(frame.base);
            rt.vcallees.pop();
        }
    }
    result
}

/// Builds a frame for a call: captures, the optional self slot,
/// fixed parameters, and the packed rest argument.
fn push_frame(
    rt: &mut Rt,
    frames: &mut Vec<Frame>,
    fval: Value,
    proto_ref: ProtoRef,
    env: Vec<Value>,
    args: &[Value],
) -> Result<(), Error> {
    let proto = &rt.protos[proto_ref.0 as usize];
    let arity = match proto.select_arity(args.len()) {
        Some(i) => i,
        None => {
            return Err(Error::eval(
                ErrorKind::ArityError,
                &format!(
                    "wrong number of arguments ({}) passed to {}",
                    args.len(),
                    proto.name.as_deref().unwrap_or("fn")
                ),
            ))
        }
    };
    let params = proto.arities[arity].params;
    let variadic = proto.arities[arity].variadic;
    let self_named = proto.self_named;
    debug_assert_eq!(env.len(), proto.capture_count);

    let base = rt.vstack.len();
    rt.vstack.extend_from_slice(&env);
    if self_named {
        rt.vstack.push(fval);
    }
    rt.vstack.extend_from_slice(&args[..params]);
    if variadic {
        let rest = if args.len() > params {
            let items = args[params..].to_vec();
            rt.list_value(items)
        } else {
            Value::Nil
        };
        rt.vstack.push(rest);
    }

    rt.vcallees.push(fval);
    frames.push(Frame {
        base,
        ip: 0,
        proto: proto_ref,
        arity,
        handlers: vec![],
    });
    Ok(())
}

/// The interpreter loop. Runs until the outermost frame returns.
fn execute(rt: &mut Rt, frames: &mut Vec<Frame>) -> Result<Value, Error> {
    // errors waiting while their `finally` blocks run; payloads
    // are parked on the temp-root stack so a collection inside
    // the cleanup can't strand them
    let mut pending: Vec<(Error, Option<usize>)> = vec![];

    loop {
        let (op, op_ip) = {
            let frame = frames.last().expect("vm ran out of frames");
            let arity = &rt.protos[frame.proto.0 as usize].arities[frame.arity];
            (Opcode::from_byte(arity.code[frame.ip]), frame.ip)
        };

        match step_op(rt, frames, &mut pending, op, op_ip) {
            Ok(None) => {}
            Ok(Some(value)) => return Ok(value),
            Err(error) => {
                let error = {
                    let frame = frames.last().expect("vm ran out of frames");
                    let arity = &rt.protos[frame.proto.0 as usize].arities[frame.arity];
                    error.at(&arity.span_at(op_ip))
                };
                match unwind(rt, frames, &mut pending, error) {
                    Ok(()) => {}
                    Err(error) => {
                        for (_, mark) in pending.drain(..).rev() {
                            if let Some(mark) = mark {
                                rt.unprotect(mark);
                            }
                        }
                        return Err(error);
                    }
                }
            }
        }
    }
}

/// Executes one opcode. `Ok(Some(v))` means the outermost frame
/// returned `v`.
fn step_op(
    rt: &mut Rt,
    frames: &mut Vec<Frame>,
    pending: &mut Vec<(Error, Option<usize>)>,
    op: Opcode,
    op_ip: usize,
) -> Result<Option<Value>, Error> {
    // decoded operands, without holding a borrow on the proto
    let read = |rt: &Rt, frames: &[Frame], at: usize| -> u16 {
        let frame = frames.last().unwrap();
        rt.protos[frame.proto.0 as usize].arities[frame.arity].read_u16(at)
    };
    let base = frames.last().unwrap().base;

    macro_rules! next {
        ($operands:expr) => {
            frames.last_mut().unwrap().ip = op_ip + 1 + 2 * $operands
        };
    }

    match op {
        Opcode::Con => {
            let index = read(rt, frames, op_ip + 1);
            let frame = frames.last().unwrap();
            let value = rt.protos[frame.proto.0 as usize].consts[index as usize];
            rt.vstack.push(value);
            next!(1);
        }
        Opcode::Nil => {
            rt.vstack.push(Value::Nil);
            next!(0);
        }
        Opcode::True => {
            rt.vstack.push(Value::Bool(true));
            next!(0);
        }
        Opcode::False => {
            rt.vstack.push(Value::Bool(false));
            next!(0);
        }
        Opcode::Pop => {
            rt.vstack.pop();
            next!(0);
        }
        Opcode::Dup => {
            let top = *rt.vstack.last().expect("dup on empty stack");
            rt.vstack.push(top);
            next!(0);
        }
        Opcode::Load => {
            let slot = read(rt, frames, op_ip + 1) as usize;
            rt.vstack.push(rt.vstack[base + slot]);
            next!(1);
        }
        Opcode::Store => {
            let slot = read(rt, frames, op_ip + 1) as usize;
            let value = rt.vstack.pop().expect("store on empty stack");
            rt.vstack[base + slot] = value;
            next!(1);
        }
        Opcode::LoadVar => {
            let var = crate::runtime::env::VarRef(read(rt, frames, op_ip + 1) as u32);
            if !rt.env.var(var).bound {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!("var {} is unbound", rt.env.var(var).name),
                ));
            }
            let value = rt.env.deref_var(var);
            rt.vstack.push(value);
            next!(1);
        }
        Opcode::DefVar => {
            let var = crate::runtime::env::VarRef(read(rt, frames, op_ip + 1) as u32);
            let value = rt.vstack.pop().expect("def on empty stack");
            rt.env.bind_root(var, value);
            rt.vstack.push(Value::Var(var));
            next!(1);
        }
        Opcode::DefOnce => {
            let var = crate::runtime::env::VarRef(read(rt, frames, op_ip + 1) as u32);
            rt.vstack.push(Value::Bool(rt.env.var(var).bound));
            next!(1);
        }
        Opcode::SetVar => {
            let var = crate::runtime::env::VarRef(read(rt, frames, op_ip + 1) as u32);
            let value = *rt.vstack.last().expect("set! on empty stack");
            if !rt.env.set_dynamic(var, value) {
                return Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!(
                        "can't set! var {} - it has no active dynamic binding",
                        rt.env.var(var).name
                    ),
                ));
            }
            next!(1);
        }
        Opcode::Jump => {
            let target = read(rt, frames, op_ip + 1);
            frames.last_mut().unwrap().ip = target as usize;
        }
        Opcode::JumpIfNot => {
            let target = read(rt, frames, op_ip + 1);
            let cond = rt.vstack.pop().expect("jump-if-not on empty stack");
            if cond.is_truthy() {
                next!(1);
            } else {
                frames.last_mut().unwrap().ip = target as usize;
            }
        }
        Opcode::Call => {
            let n = read(rt, frames, op_ip + 1) as usize;
            next!(1);
            let split = rt.vstack.len() - n;
            let args: Vec<Value> = rt.vstack.split_off(split);
            let fval = rt.vstack.pop().expect("call on empty stack");

            // compiled closures get an in-place frame; everything
            // else goes through the generic dispatch
            let compiled = match fval {
                Value::Obj(r) => match rt.heap.get(r) {
                    HeapObj::Fn(FnObj::Closure(Closure {
                        code: FnCode::Compiled(p),
                        env,
                        ..
                    })) => Some((*p, env.clone())),
                    _ => None,
                },
                _ => None,
            };

            match compiled {
                Some((proto_ref, env)) => {
                    push_frame(rt, frames, fval, proto_ref, env, &args)?;
                }
                None => {
                    let value = rt.call(fval, &args)?;
                    rt.vstack.push(value);
                }
            }
        }
        Opcode::Return => {
            let value = rt.vstack.pop().expect("return on empty stack");
            let frame = frames.pop().expect("return without a frame");
            rt.vstack.truncate(frame.base);
            rt.vcallees.pop();
            if frames.is_empty() {
                return Ok(Some(value));
            }
            rt.vstack.push(value);
        }
        Opcode::Closure => {
            let proto_ref = ProtoRef(read(rt, frames, op_ip + 1) as u32);
            // the capture count comes from the prototype, verbatim
            let cc = rt.protos[proto_ref.0 as usize].capture_count;
            let env = rt.vstack[base..base + cc].to_vec();
            let value = rt.alloc(HeapObj::Fn(FnObj::Closure(Closure {
                code: FnCode::Compiled(proto_ref),
                env,
                meta: Value::Nil,
            })));
            rt.vstack.push(value);
            next!(1);
        }
        Opcode::Recur => {
            let slot_start = read(rt, frames, op_ip + 1) as usize;
            let n = read(rt, frames, op_ip + 3) as usize;
            let target = read(rt, frames, op_ip + 5) as usize;
            let top = rt.vstack.len();
            for i in 0..n {
                rt.vstack[base + slot_start + i] = rt.vstack[top - n + i];
            }
            rt.vstack.truncate(base + slot_start + n);
            frames.last_mut().unwrap().ip = target;
            // the loop safe point
            rt.safepoint();
        }
        Opcode::ScopeExit => {
            let _scope_start = read(rt, frames, op_ip + 1) as usize;
            let n = read(rt, frames, op_ip + 3) as usize;
            let top = rt.vstack.pop().expect("scope-exit on empty stack");
            let len = rt.vstack.len();
            rt.vstack.truncate(len - n);
            rt.vstack.push(top);
            next!(2);
        }
        Opcode::MakeVec => {
            let n = read(rt, frames, op_ip + 1) as usize;
            let split = rt.vstack.len() - n;
            let items = rt.vstack.split_off(split);
            let value = rt.vector_value(items);
            rt.vstack.push(value);
            next!(1);
        }
        Opcode::MakeMap => {
            let pairs = read(rt, frames, op_ip + 1) as usize;
            let split = rt.vstack.len() - pairs * 2;
            let flat = rt.vstack.split_off(split);
            let mut entries: Vec<(Value, Value)> = vec![];
            for chunk in flat.chunks(2) {
                let (k, v) = (chunk[0], chunk[1]);
                if entries.iter().any(|(seen, _)| rt.heap.equal(*seen, k)) {
                    let shown = rt.pr_str(k)?;
                    return Err(Error::eval(
                        ErrorKind::DuplicateKey,
                        &format!("duplicate key {} in map", shown),
                    ));
                }
                entries.push((k, v));
            }
            let value = rt.map_value(entries);
            rt.vstack.push(value);
            next!(1);
        }
        Opcode::MakeSet => {
            let n = read(rt, frames, op_ip + 1) as usize;
            let split = rt.vstack.len() - n;
            let items = rt.vstack.split_off(split);
            let mut members: Vec<Value> = vec![];
            for v in items {
                if members.iter().any(|seen| rt.heap.equal(*seen, v)) {
                    let shown = rt.pr_str(v)?;
                    return Err(Error::eval(
                        ErrorKind::DuplicateKey,
                        &format!("duplicate element {} in set", shown),
                    ));
                }
                members.push(v);
            }
            let value = rt.set_value(members);
            rt.vstack.push(value);
            next!(1);
        }
        Opcode::First => {
            let v = rt.vstack.pop().expect("first on empty stack");
            let value = collections::first_value(rt, v)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::Rest => {
            let v = rt.vstack.pop().expect("rest on empty stack");
            let value = collections::rest_value(rt, v)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::Conj => {
            let item = rt.vstack.pop().expect("conj on empty stack");
            let coll = rt.vstack.pop().expect("conj on empty stack");
            let value = collections::conj_value(rt, coll, item)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::Nth => {
            let index = rt.vstack.pop().expect("nth on empty stack");
            let coll = rt.vstack.pop().expect("nth on empty stack");
            let value = collections::nth_value(rt, coll, index, None)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::Get => {
            let key = rt.vstack.pop().expect("get on empty stack");
            let coll = rt.vstack.pop().expect("get on empty stack");
            let value = collections::get_value(rt, coll, key)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::Assoc => {
            let value = rt.vstack.pop().expect("assoc on empty stack");
            let key = rt.vstack.pop().expect("assoc on empty stack");
            let coll = rt.vstack.pop().expect("assoc on empty stack");
            let result = collections::assoc_value(rt, coll, key, value)?;
            rt.vstack.push(result);
            next!(0);
        }
        Opcode::Count => {
            let coll = rt.vstack.pop().expect("count on empty stack");
            let value = collections::count_value(rt, coll)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::Meta => {
            let v = rt.vstack.pop().expect("meta on empty stack");
            let value = collections::meta_value(rt, v);
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::WithMeta => {
            let meta = rt.vstack.pop().expect("with-meta on empty stack");
            let v = rt.vstack.pop().expect("with-meta on empty stack");
            let value = collections::with_meta_value(rt, v, meta)?;
            rt.vstack.push(value);
            next!(0);
        }
        Opcode::TryPush => {
            let catch_ip = read(rt, frames, op_ip + 1);
            let finally_ip = read(rt, frames, op_ip + 3);
            let class_const = read(rt, frames, op_ip + 5);
            let stack_len = rt.vstack.len();
            frames.last_mut().unwrap().handlers.push(Handler {
                catch_ip,
                finally_ip,
                class_const,
                stack_len,
            });
            next!(3);
        }
        Opcode::TryPop => {
            frames.last_mut().unwrap().handlers.pop();
            next!(0);
        }
        Opcode::Throw => {
            let v = rt.vstack.pop().expect("throw on empty stack");
            let mark = rt.protect(&[v]);
            let shown = rt.pr_str(v);
            let v = rt.recall(mark, 0);
            rt.unprotect(mark);
            return Err(Error::thrown(v, &shown?));
        }
        Opcode::Rethrow => {
            let (mut error, mark) = pending.pop().expect("rethrow without a pending error");
            if let Some(mark) = mark {
                error.payload = Some(rt.recall(mark, 0));
                rt.unprotect(mark);
            }
            return Err(error);
        }
        Opcode::LetFnFix => {
            let start = read(rt, frames, op_ip + 1) as usize;
            let n = read(rt, frames, op_ip + 3) as usize;
            let finals: Vec<Value> = rt.vstack[base + start..base + start + n].to_vec();
            for value in finals.iter() {
                if let Value::Obj(r) = value {
                    if let HeapObj::Fn(FnObj::Closure(c)) = rt.heap.get_mut(*r) {
                        for (i, v) in finals.iter().enumerate() {
                            let at = start + i;
                            if at < c.env.len() {
                                c.env[at] = *v;
                            }
                        }
                    }
                }
            }
            next!(2);
        }
        Opcode::Noop => {
            next!(0);
        }
    }

    Ok(None)
}

/// Walks handlers newest-first, then frames, looking for a home
/// for the error. `Ok(())` means control was transferred to a
/// catch or finally block; `Err` means the error left the VM.
fn unwind(
    rt: &mut Rt,
    frames: &mut Vec<Frame>,
    pending: &mut Vec<(Error, Option<usize>)>,
    mut error: Error,
) -> Result<(), Error> {
    loop {
        let frame = match frames.last_mut() {
            Some(frame) => frame,
            None => return Err(error),
        };

        while let Some(handler) = frame.handlers.pop() {
            let catchable = error.kind != ErrorKind::InternalError;
            let matches = catchable
                && handler.catch_ip != NONE
                && class_matches(rt, &rt_class(rt, frame, &handler), &error);

            if matches {
                rt.vstack.truncate(handler.stack_len);
                let payload = payload_value(rt, &error);
                rt.vstack.push(payload);
                frame.ip = handler.catch_ip as usize;
                return Ok(());
            }

            if handler.finally_ip != NONE {
                rt.vstack.truncate(handler.stack_len);
                frame.ip = handler.finally_ip as usize;
                let mark = error.payload.map(|p| rt.protect(&[p]));
                pending.push((error, mark));
                return Ok(());
            }
        }

        let frame = frames.pop().expect("unwind without a frame");
        rt.vstack.truncate(frame.base);
        rt.vcallees.pop();
        let span = rt.protos[frame.proto.0 as usize].span.clone();
        error = error.in_call(&span);
    }
}

/// The declared class of a handler, decoded from its constant.
fn rt_class(rt: &Rt, frame: &Frame, handler: &Handler) -> Option<String> {
    if handler.class_const == NONE {
        return None;
    }
    let value = rt.protos[frame.proto.0 as usize].consts[handler.class_const as usize];
    match value {
        Value::Obj(r) => match rt.heap.get(r) {
            HeapObj::Sym { name, .. } => Some(name.clone()),
            _ => None,
        },
        _ => None,
    }
}

fn class_matches(rt: &Rt, class: &Option<String>, error: &Error) -> bool {
    match class {
        None => true,
        Some(class) => match class.as_str() {
            "Exception" | "Throwable" | "Error" => true,
            class => match error.payload {
                Some(v) => {
                    rt.heap.type_name(v) == class
                        || TypeTag::from_name(class) == Some(rt.heap.tag_of(v))
                }
                None => false,
            },
        },
    }
}

/// The value a catch block sees; mirrors the tree walker.
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
