//! # Waxwing
//! This crate contains the core of the Waxwing programming language,
//! a small Lisp in the Clojure family: dynamically typed,
//! expression-oriented, with immutable collections, first-class
//! functions, macros, lazy sequences, and dynamic vars.
//!
//! ## Embedding Waxwing in Rust
//! Add waxwing to your `Cargo.toml`, then:
//! ```
//! use waxwing::Interp;
//!
//! let mut interp = Interp::default();
//! let value = interp.eval("(+ 1 2 3)").unwrap();
//! assert_eq!(interp.show(value), "6");
//! ```
//!
//! ## Overview of the evaluation pipeline
//! Source code is represented as a [`Source`], a string with an
//! associated path. Regions of source are marked with [`Span`]s,
//! which are like `&str`s but carry a reference-counted handle to
//! the original `Source`; they are used throughout for error
//! reporting. Datastructures can be [`Spanned`] to indicate where
//! they originated.
//!
//! The first stage is the reader. The [`Lexer`] greedily scans the
//! source into a stream of `Spanned<Token>`s; the [`Reader`] then
//! builds one [`Form`] at a time - a plain syntax tree of literals,
//! symbols, and collections - applying the quoting transforms
//! (`'`, `` ` ``, `~`, `~@`, `@`, `^`, `#(...)`, `#_`) as it goes.
//! Forms are drained lazily, one top-level form per step.
//!
//! The second stage is the [`Analyzer`]. It expands macros to a
//! fixed point, recognizes special forms, resolves symbols against
//! the lexical scope stack and the namespace registry, rewrites
//! destructuring binding vectors into nested `let*`s, and computes
//! closure-capture counts. The result is a [`Node`]: a semantic
//! tree ready for evaluation.
//!
//! A `Node` can be run by either of two interchangeable back ends
//! sharing one value representation: the tree-walking evaluator in
//! [`runtime::walk`], which interprets nodes directly, or the
//! bytecode pipeline, where [`compiler::gen`] lowers nodes to a flat
//! instruction stream (a [`FnProto`]) executed by the stack machine
//! in [`runtime::vm`]. The tree walker is the reference; comparison
//! mode runs both per form and insists the results agree.
//!
//! Runtime values live on a relocating heap collected between
//! top-level forms (and at `recur` safe points); see
//! [`runtime::heap`] for the mark / relocate / fixup cycle.

pub mod common;
pub mod compiler;
pub mod core;
pub mod interp;
pub mod runtime;

pub use common::{
    error::{Error, ErrorKind, Phase},
    form::Form,
    node::Node,
    proto::FnProto,
    span::{Source, Span, Spanned},
};
pub use compiler::{analyze::Analyzer, lex::Lexer, read::Reader};
pub use interp::{Backend, Config, Interp};
pub use runtime::value::Value;
