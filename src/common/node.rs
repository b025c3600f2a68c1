use std::{cell::RefCell, rc::Rc};

use crate::{
    common::span::Span,
    runtime::{env::VarRef, value::Value},
};

/// Index of a constant in an analysis constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstId(pub u32);

/// The pool of constant values referenced by `Node::Const`.
/// One pool is shared by a top-level form and every function
/// defined inside it; functions keep it alive (via `Rc`) for as
/// long as any closure over them lives. The garbage collector
/// rewrites pool entries in place, which is why it sits behind a
/// `RefCell`.
pub type ConstPool = Rc<RefCell<Vec<Value>>>;

/// A semantic tree produced by the analyzer; evaluable.
/// Macro expansion, symbol resolution, and destructuring have
/// already happened: symbols are gone, replaced by local slot
/// indices and var handles.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub kind: NodeKind,
    pub span: Span,
}

impl Node {
    pub fn new(kind: NodeKind, span: &Span) -> Node {
        Node {
            kind,
            span: span.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A literal value, by index into the constant pool.
    Const(ConstId),
    /// A var dereference; dynamic bindings are consulted at
    /// evaluation time.
    Var(VarRef),
    /// A `(var x)` special form: the var handle itself.
    VarQuote(VarRef),
    /// A lexical slot in the current function frame.
    /// Slots below the frame's capture count are closure
    /// bindings; the rest are parameters and `let` locals.
    Local(usize),
    If {
        cond: Box<Node>,
        then: Box<Node>,
        els: Box<Node>,
    },
    Do(Vec<Node>),
    Let {
        bindings: Vec<(usize, Node)>,
        body: Vec<Node>,
    },
    Loop {
        bindings: Vec<(usize, Node)>,
        body: Vec<Node>,
    },
    /// Rebinds the `args.len()` slots starting at `slot_start`
    /// and jumps back to the enclosing loop head (or function
    /// entry). Only ever in tail position; the analyzer checks.
    Recur {
        args: Vec<Node>,
        slot_start: usize,
    },
    Fn(Rc<FnDef>),
    /// `letfn*`: all names are in scope in all bodies.
    /// Placeholders are bound first, closures built, then
    /// already-captured environments are re-pointed at the
    /// finished functions.
    LetFn {
        slot_start: usize,
        bindings: Vec<(usize, Rc<FnDef>)>,
        body: Vec<Node>,
    },
    Call {
        f: Box<Node>,
        args: Vec<Node>,
    },
    Def {
        var: VarRef,
        init: Option<Box<Node>>,
        /// `defonce`: skip the init if the var is already bound.
        once: bool,
    },
    /// `set!` on a dynamically bound var.
    Set {
        var: VarRef,
        expr: Box<Node>,
    },
    Throw(Box<Node>),
    Try {
        body: Vec<Node>,
        catch: Option<Catch>,
        finally: Option<Vec<Node>>,
    },
    Vector(Vec<Node>),
    MapLit(Vec<(Node, Node)>),
    SetLit(Vec<Node>),
}

/// A `catch` clause. `class` is `None` for a catch-all; otherwise
/// the thrown value's type name must match.
#[derive(Debug, Clone, PartialEq)]
pub struct Catch {
    pub class: Option<String>,
    pub slot: usize,
    pub body: Vec<Node>,
}

/// One analyzed function: a list of arities sharing a name, a
/// capture count, and the constant pool of the form that defined
/// it.
///
/// The capture contract: `capture_count` equals the number of
/// occupied local slots in the enclosing function at the point
/// the `fn*` form appears - the enclosing function's own captures
/// plus every parameter and `let` local bound so far. A closure
/// is built by copying exactly that prefix of the enclosing
/// frame, so slot indices stay stable across nesting and an inner
/// function addresses an outer local by the same index the outer
/// function does. Both back ends read this field verbatim.
#[derive(Debug, PartialEq)]
pub struct FnDef {
    pub name: Option<String>,
    /// `Some(capture_count)` when the function binds its own
    /// name; the callee value is stored there at call time.
    /// `None` for anonymous functions and for functions named by
    /// an enclosing `letfn*` binding.
    pub self_slot: Option<usize>,
    pub capture_count: usize,
    pub arities: Vec<FnArity>,
    pub consts: ConstPool,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FnArity {
    /// Fixed parameter count. A variadic arity has one more
    /// binding slot for the rest parameter.
    pub params: usize,
    pub variadic: bool,
    pub body: Vec<Node>,
}

impl FnDef {
    /// Number of binding slots a call to the given arity fills:
    /// captures, the self slot if any, fixed parameters, and the
    /// rest parameter for a variadic arity.
    pub fn frame_bindings(&self, arity: &FnArity) -> usize {
        self.capture_count
            + self.self_slot.is_some() as usize
            + arity.params
            + arity.variadic as usize
    }

    /// Picks the arity for a call with `n` arguments: an exact
    /// fixed match wins over a variadic one.
    pub fn select_arity(&self, n: usize) -> Option<&FnArity> {
        self.arities
            .iter()
            .find(|a| !a.variadic && a.params == n)
            .or_else(|| {
                self.arities
                    .iter()
                    .find(|a| a.variadic && n >= a.params)
            })
    }
}
