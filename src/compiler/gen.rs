//! The bytecode generator: lowers analyzed [`Node`]s onto flat
//! instruction streams. One [`FnProto`] per function, one chunk
//! per arity.
//!
//! The generator tracks `sp`, the compile-time stack depth of the
//! current frame. Named binding slots are simply stack positions:
//! a `let` init runs with `sp` equal to its slot, so the value
//! *is* the local, and `ScopeExit` peels bindings off while
//! keeping the block's value. The capture contract is inherited
//! from the analyzer: `FnProto::capture_count` is copied from the
//! `FnDef` untouched, and the VM reads it untouched - this file
//! is the middle of that chain, so resist the urge to be clever
//! here.

use log::debug;

use crate::{
    common::{
        error::{Error, ErrorKind},
        node::{ConstPool, FnDef, Node, NodeKind},
        opcode::Opcode,
        proto::{FnProto, ProtoArity, ProtoRef},
        span::Span,
    },
    compiler::analyze::Analysis,
    runtime::{env::CORE_NS, rt::Rt, value::Value},
};

const NONE: u16 = u16::MAX;

/// Compiles one analyzed top-level form into a zero-argument
/// prototype, registered in the runtime's prototype table.
pub fn compile(rt: &mut Rt, analysis: &Analysis) -> Result<ProtoRef, Error> {
    let mut proto = FnProto::empty(None, &analysis.node.span);
    let mut emitter = Emitter::new(0);

    expr(rt, &mut proto, &analysis.pool, &mut emitter, &analysis.node)?;
    emitter.code.emit(Opcode::Return);
    emitter.adjust(-1);

    proto.arities.push(emitter.code);
    let proto_ref = rt.add_proto(proto);
    debug!("compiled top-level form into proto {:?}", proto_ref);
    Ok(proto_ref)
}

/// Compiles a function definition into a prototype.
fn compile_fn(rt: &mut Rt, pool: &ConstPool, def: &FnDef) -> Result<ProtoRef, Error> {
    let mut proto = FnProto::empty(def.name.clone(), &def.span);
    proto.capture_count = def.capture_count;
    proto.self_named = def.self_slot.is_some();

    for arity in def.arities.iter() {
        let bindings = def.frame_bindings(arity);
        let mut emitter = Emitter::new(bindings);
        emitter.code.params = arity.params;
        emitter.code.variadic = arity.variadic;

        // the whole body is the function-level recur target
        emitter.loops.push(LoopCtx {
            slot_start: def.capture_count + def.self_slot.is_some() as usize,
            head: 0,
        });
        body(rt, &mut proto, pool, &mut emitter, &arity.body)?;
        emitter.code.emit(Opcode::Return);
        emitter.adjust(-1);
        emitter.loops.pop();

        proto.arities.push(emitter.code);
    }

    Ok(rt.add_proto(proto))
}

/// An active loop: where `recur` jumps back to.
struct LoopCtx {
    slot_start: usize,
    head: usize,
}

/// Per-arity emission state.
struct Emitter {
    code: ProtoArity,
    /// Compile-time stack depth, frame-relative. Binding slots
    /// and expression temporaries alike.
    sp: usize,
    loops: Vec<LoopCtx>,
}

impl Emitter {
    fn new(bindings: usize) -> Emitter {
        Emitter {
            code: ProtoArity::empty(0, false),
            sp: bindings,
            loops: vec![],
        }
    }

    fn adjust(&mut self, delta: isize) {
        self.sp = (self.sp as isize + delta) as usize;
    }

    fn operand(&mut self, value: usize, span: &Span) -> Result<u16, Error> {
        u16::try_from(value).map_err(|_| {
            Error::analysis(
                ErrorKind::InternalError,
                "a compiled function exceeded a 16-bit operand",
                span,
            )
        })
    }

    fn here(&self, span: &Span) -> Result<u16, Error> {
        u16::try_from(self.code.code.len()).map_err(|_| {
            Error::analysis(
                ErrorKind::InternalError,
                "a compiled function exceeded 64k of bytecode",
                span,
            )
        })
    }
}

/// Compiles a body, popping every value but the last.
fn body(
    rt: &mut Rt,
    proto: &mut FnProto,
    pool: &ConstPool,
    e: &mut Emitter,
    nodes: &[Node],
) -> Result<(), Error> {
    match nodes.split_last() {
        None => {
            e.code.emit(Opcode::Nil);
            e.adjust(1);
        }
        Some((last, init)) => {
            for node in init {
                expr(rt, proto, pool, e, node)?;
                e.code.emit(Opcode::Pop);
                e.adjust(-1);
            }
            expr(rt, proto, pool, e, last)?;
        }
    }
    Ok(())
}

/// Compiles one expression; net stack effect is exactly +1.
fn expr(
    rt: &mut Rt,
    proto: &mut FnProto,
    pool: &ConstPool,
    e: &mut Emitter,
    node: &Node,
) -> Result<(), Error> {
    e.code.note_span(&node.span);
    let sp_in = e.sp;

    match &node.kind {
        NodeKind::Const(id) => {
            let value = pool.borrow()[id.0 as usize];
            let index = proto.index_const(value);
            let index = e.operand(index, &node.span)?;
            e.code.emit(Opcode::Con);
            e.code.emit_u16(index);
            e.adjust(1);
        }

        NodeKind::Var(var) => {
            let operand = e.operand(var.0 as usize, &node.span)?;
            e.code.emit(Opcode::LoadVar);
            e.code.emit_u16(operand);
            e.adjust(1);
        }

        NodeKind::VarQuote(var) => {
            let index = proto.index_const(Value::Var(*var));
            let index = e.operand(index, &node.span)?;
            e.code.emit(Opcode::Con);
            e.code.emit_u16(index);
            e.adjust(1);
        }

        NodeKind::Local(slot) => {
            let operand = e.operand(*slot, &node.span)?;
            e.code.emit(Opcode::Load);
            e.code.emit_u16(operand);
            e.adjust(1);
        }

        NodeKind::If { cond, then, els } => {
            expr(rt, proto, pool, e, cond)?;
            e.code.emit(Opcode::JumpIfNot);
            let to_else = e.code.emit_patch();
            e.adjust(-1);

            expr(rt, proto, pool, e, then)?;
            e.code.emit(Opcode::Jump);
            let to_end = e.code.emit_patch();
            // the else branch starts from the same depth
            e.adjust(-1);

            let else_ip = e.here(&node.span)?;
            e.code.patch_u16(to_else, else_ip);
            expr(rt, proto, pool, e, els)?;

            let end_ip = e.here(&node.span)?;
            e.code.patch_u16(to_end, end_ip);
        }

        NodeKind::Do(nodes) => body(rt, proto, pool, e, nodes)?,

        NodeKind::Let { bindings, body: b } => {
            let scope_start = e.sp;
            for (slot, init) in bindings {
                debug_assert_eq!(e.sp, *slot, "let slot drifted from stack depth");
                expr(rt, proto, pool, e, init)?;
            }
            body(rt, proto, pool, e, b)?;
            scope_exit(e, scope_start, bindings.len(), &node.span)?;
        }

        NodeKind::Loop { bindings, body: b } => {
            let scope_start = e.sp;
            for (slot, init) in bindings {
                debug_assert_eq!(e.sp, *slot, "loop slot drifted from stack depth");
                expr(rt, proto, pool, e, init)?;
            }
            let head = e.code.code.len();
            e.loops.push(LoopCtx {
                slot_start: scope_start,
                head,
            });
            body(rt, proto, pool, e, b)?;
            e.loops.pop();
            scope_exit(e, scope_start, bindings.len(), &node.span)?;
        }

        NodeKind::Recur { args, slot_start } => {
            for arg in args {
                expr(rt, proto, pool, e, arg)?;
            }
            let ctx = e
                .loops
                .iter()
                .rev()
                .find(|ctx| ctx.slot_start == *slot_start)
                .ok_or_else(|| {
                    Error::analysis(
                        ErrorKind::InternalError,
                        "recur target vanished during compilation",
                        &node.span,
                    )
                })?;
            let head = ctx.head;
            let start = e.operand(*slot_start, &node.span)?;
            let n = e.operand(args.len(), &node.span)?;
            let target = e.operand(head, &node.span)?;
            e.code.emit(Opcode::Recur);
            e.code.emit_u16(start);
            e.code.emit_u16(n);
            e.code.emit_u16(target);
            // recur never falls through; pretend it yielded a value
            // so branch depths merge
            e.sp = sp_in + 1;
        }

        NodeKind::Fn(def) => {
            let proto_ref = compile_fn(rt, pool, def)?;
            let operand = e.operand(proto_ref.0 as usize, &node.span)?;
            e.code.emit(Opcode::Closure);
            e.code.emit_u16(operand);
            e.adjust(1);
        }

        NodeKind::LetFn {
            slot_start,
            bindings,
            body: b,
        } => {
            // placeholders, then closures stored over them
            for (slot, _) in bindings {
                debug_assert_eq!(e.sp, *slot);
                e.code.emit(Opcode::Nil);
                e.adjust(1);
            }
            for (slot, def) in bindings {
                let proto_ref = compile_fn(rt, pool, def)?;
                let operand = e.operand(proto_ref.0 as usize, &node.span)?;
                e.code.emit(Opcode::Closure);
                e.code.emit_u16(operand);
                e.adjust(1);
                let slot_operand = e.operand(*slot, &node.span)?;
                e.code.emit(Opcode::Store);
                e.code.emit_u16(slot_operand);
                e.adjust(-1);
            }
            let start = e.operand(*slot_start, &node.span)?;
            let n = e.operand(bindings.len(), &node.span)?;
            e.code.emit(Opcode::LetFnFix);
            e.code.emit_u16(start);
            e.code.emit_u16(n);

            body(rt, proto, pool, e, b)?;
            scope_exit(e, *slot_start, bindings.len(), &node.span)?;
        }

        NodeKind::Call { f, args } => {
            if let Some(op) = accessor_op(rt, f, args.len()) {
                for arg in args {
                    expr(rt, proto, pool, e, arg)?;
                }
                e.code.emit(op);
                e.adjust(1 - args.len() as isize);
            } else {
                expr(rt, proto, pool, e, f)?;
                for arg in args {
                    expr(rt, proto, pool, e, arg)?;
                }
                let n = e.operand(args.len(), &node.span)?;
                e.code.emit(Opcode::Call);
                e.code.emit_u16(n);
                e.adjust(-(args.len() as isize));
            }
        }

        NodeKind::Def { var, init, once } => {
            let operand = e.operand(var.0 as usize, &node.span)?;
            match (init, once) {
                (None, _) => {
                    // interning happened at analysis; just yield
                    // the var handle
                    let index = proto.index_const(Value::Var(*var));
                    let index = e.operand(index, &node.span)?;
                    e.code.emit(Opcode::Con);
                    e.code.emit_u16(index);
                    e.adjust(1);
                }
                (Some(init), false) => {
                    expr(rt, proto, pool, e, init)?;
                    e.code.emit(Opcode::DefVar);
                    e.code.emit_u16(operand);
                }
                (Some(init), true) => {
                    // already bound? yield the handle, skip the init
                    e.code.emit(Opcode::DefOnce);
                    e.code.emit_u16(operand);
                    e.adjust(1);
                    e.code.emit(Opcode::JumpIfNot);
                    let to_init = e.code.emit_patch();
                    e.adjust(-1);

                    let index = proto.index_const(Value::Var(*var));
                    let index = e.operand(index, &node.span)?;
                    e.code.emit(Opcode::Con);
                    e.code.emit_u16(index);
                    e.code.emit(Opcode::Jump);
                    let to_end = e.code.emit_patch();

                    let init_ip = e.here(&node.span)?;
                    e.code.patch_u16(to_init, init_ip);
                    expr(rt, proto, pool, e, init)?;
                    e.code.emit(Opcode::DefVar);
                    e.code.emit_u16(operand);
                    e.adjust(-1); // merge the two branches

                    let end_ip = e.here(&node.span)?;
                    e.code.patch_u16(to_end, end_ip);
                    e.adjust(1);
                }
            }
        }

        NodeKind::Set { var, expr: value } => {
            expr(rt, proto, pool, e, value)?;
            let operand = e.operand(var.0 as usize, &node.span)?;
            e.code.emit(Opcode::SetVar);
            e.code.emit_u16(operand);
        }

        NodeKind::Throw(value) => {
            expr(rt, proto, pool, e, value)?;
            e.code.emit(Opcode::Throw);
            // throw never falls through
        }

        NodeKind::Try {
            body: b,
            catch,
            finally,
        } => {
            // the analyzer guarantees a try runs at a clean frame
            // position (it wraps try in a thunk), so the catch
            // slot is exactly the depth here. The finally body is
            // compiled once per path that runs it: normal, after
            // catch, and exceptional (ending in Rethrow).
            let entry_sp = e.sp;

            if catch.is_none() && finally.is_none() {
                body(rt, proto, pool, e, b)?;
            } else {
                e.code.emit(Opcode::TryPush);
                let catch_patch = e.code.emit_patch();
                let finally_patch = e.code.emit_patch();
                let class_operand = match catch {
                    Some(clause) => match &clause.class {
                        Some(class) => {
                            let sym = rt.sym_value(None, class);
                            let index = proto.index_const(sym);
                            e.operand(index, &node.span)?
                        }
                        None => NONE,
                    },
                    None => NONE,
                };
                e.code.emit_u16(class_operand);

                // normal path
                body(rt, proto, pool, e, b)?;
                e.code.emit(Opcode::TryPop);
                if let Some(f) = finally {
                    body(rt, proto, pool, e, f)?;
                    e.code.emit(Opcode::Pop);
                    e.adjust(-1);
                }
                e.code.emit(Opcode::Jump);
                let mut to_end = vec![e.code.emit_patch()];

                // catch path: the unwinder leaves the payload at
                // the handler's recorded depth - the catch slot
                if let Some(clause) = catch {
                    debug_assert_eq!(clause.slot, entry_sp);
                    let catch_ip = e.here(&node.span)?;
                    e.code.patch_u16(catch_patch, catch_ip);
                    e.sp = entry_sp + 1;
                    body(rt, proto, pool, e, &clause.body)?;
                    scope_exit(e, clause.slot, 1, &node.span)?;
                    if let Some(f) = finally {
                        body(rt, proto, pool, e, f)?;
                        e.code.emit(Opcode::Pop);
                        e.adjust(-1);
                    }
                    e.code.emit(Opcode::Jump);
                    to_end.push(e.code.emit_patch());
                } else {
                    e.code.patch_u16(catch_patch, NONE);
                }

                // exceptional path: truncated to entry depth,
                // cleanup, resume unwinding
                if let Some(f) = finally {
                    let finally_ip = e.here(&node.span)?;
                    e.code.patch_u16(finally_patch, finally_ip);
                    e.sp = entry_sp;
                    body(rt, proto, pool, e, f)?;
                    e.code.emit(Opcode::Pop);
                    e.adjust(-1);
                    e.code.emit(Opcode::Rethrow);
                } else {
                    e.code.patch_u16(finally_patch, NONE);
                }

                let end_ip = e.here(&node.span)?;
                for patch in to_end {
                    e.code.patch_u16(patch, end_ip);
                }
                e.sp = entry_sp + 1;
            }
        }

        NodeKind::Vector(items) => {
            for item in items {
                expr(rt, proto, pool, e, item)?;
            }
            let n = e.operand(items.len(), &node.span)?;
            e.code.emit(Opcode::MakeVec);
            e.code.emit_u16(n);
            e.adjust(1 - items.len() as isize);
        }

        NodeKind::MapLit(pairs) => {
            for (k, v) in pairs {
                expr(rt, proto, pool, e, k)?;
                expr(rt, proto, pool, e, v)?;
            }
            let n = e.operand(pairs.len(), &node.span)?;
            e.code.emit(Opcode::MakeMap);
            e.code.emit_u16(n);
            e.adjust(1 - 2 * pairs.len() as isize);
        }

        NodeKind::SetLit(items) => {
            for item in items {
                expr(rt, proto, pool, e, item)?;
            }
            let n = e.operand(items.len(), &node.span)?;
            e.code.emit(Opcode::MakeSet);
            e.code.emit_u16(n);
            e.adjust(1 - items.len() as isize);
        }
    }

    debug_assert_eq!(
        e.sp,
        sp_in + 1,
        "an expression must net exactly one stack value"
    );
    Ok(())
}

fn scope_exit(e: &mut Emitter, scope_start: usize, n: usize, span: &Span) -> Result<(), Error> {
    if n == 0 {
        return Ok(());
    }
    let start = e.operand(scope_start, span)?;
    let count = e.operand(n, span)?;
    e.code.emit(Opcode::ScopeExit);
    e.code.emit_u16(start);
    e.code.emit_u16(count);
    e.adjust(-(n as isize));
    Ok(())
}

/// When a call's head is one of the core accessor vars, emit the
/// dedicated opcode instead of a full call.
fn accessor_op(rt: &Rt, f: &Node, argc: usize) -> Option<Opcode> {
    let var = match &f.kind {
        NodeKind::Var(var) => *var,
        _ => return None,
    };
    let var = rt.env.var(var);
    if rt.env.ns(var.ns).name != CORE_NS {
        return None;
    }
    match (var.name.as_str(), argc) {
        ("first", 1) => Some(Opcode::First),
        ("rest", 1) => Some(Opcode::Rest),
        ("conj", 2) => Some(Opcode::Conj),
        ("nth", 2) => Some(Opcode::Nth),
        ("get", 2) => Some(Opcode::Get),
        ("assoc", 3) => Some(Opcode::Assoc),
        ("count", 1) => Some(Opcode::Count),
        ("meta", 1) => Some(Opcode::Meta),
        ("with-meta", 2) => Some(Opcode::WithMeta),
        _ => None,
    }
}
