//! The embedding API: build an interpreter, feed it source, get
//! values back. One [`Interp`] owns one runtime; everything is
//! synchronous and single-threaded.
//!
//! The per-form cycle is: read one form (lazily, so `ns` forms
//! affect the rest of the file) -> analyze -> run on the selected
//! back end (or both, in comparison mode) -> collect if the heap
//! crossed its threshold -> drop the scratch trees.

use std::{path::Path, rc::Rc};

use log::debug;

use crate::{
    common::{
        error::{Error, ErrorKind},
        form::Form,
        span::{Source, Spanned},
    },
    compiler::{analyze::Analyzer, gen, lex::Lexer, read::Reader},
    core::{self, CORE_SOURCE},
    runtime::{
        rt::{Output, Rt},
        value::{
            AritySpec, Builtin, BuiltinFn, Closure, FnCode, FnObj, HeapObj, TypeTag, Value,
        },
        vm, walk,
    },
};

/// Which machine runs analyzed code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// The tree walker: the reference implementation.
    Walk,
    /// The bytecode compiler and VM.
    Vm,
    /// Run both per form and insist they agree. The regression
    /// net for compiler/VM contract drift.
    Compare,
}

/// Interpreter construction knobs.
#[derive(Debug, Clone)]
pub struct Config {
    pub backend: Backend,
    /// Collect when the live-byte estimate exceeds this.
    pub gc_threshold: usize,
    /// Macro-expansion depth limit per top-level form.
    pub expand_limit: usize,
    /// Nested call limit, so runaway recursion errors out
    /// instead of taking the host stack with it.
    pub max_call_depth: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            backend: Backend::Vm,
            gc_threshold: 4 << 20,
            expand_limit: 256,
            max_call_depth: 1024,
        }
    }
}

/// A Waxwing interpreter: allocators, environment, core library,
/// and a chosen back end.
pub struct Interp {
    rt: Rt,
    backend: Backend,
}

impl Default for Interp {
    fn default() -> Interp {
        Interp::new(Config::default()).expect("the bundled core library must load")
    }
}

impl Interp {
    /// Builds an interpreter: registers the builtin tables, loads
    /// the core bootstrap source, and positions the session in
    /// the `user` namespace.
    pub fn new(config: Config) -> Result<Interp, Error> {
        let mut rt = Rt::new(
            config.gc_threshold,
            config.expand_limit,
            config.max_call_depth,
        );
        let core_ns = rt.env.core_ns();
        core::register(&mut rt, core_ns, &core::core_table())?;

        let mut interp = Interp {
            rt,
            backend: config.backend,
        };

        // the bootstrap runs inside the core namespace
        let user = interp.rt.env.current;
        interp.rt.env.current = core_ns;
        let source = Source::new("waxwing/core.clj", CORE_SOURCE);
        interp.eval_source(source)?;
        interp.rt.env.current = user;

        debug!("interpreter ready");
        Ok(interp)
    }

    /// Evaluates a source string in the current namespace,
    /// returning the value of the last form.
    pub fn eval(&mut self, src: &str) -> Result<Value, Error> {
        self.eval_source(Source::eval(src))
    }

    /// Evaluates in a named namespace (created if missing); the
    /// current namespace is restored afterwards.
    pub fn eval_in(&mut self, ns: &str, src: &str) -> Result<Value, Error> {
        let saved = self.rt.env.current;
        let target = self.rt.env.create_ns(ns);
        self.rt.env.current = target;
        let result = self.eval_source(Source::eval(src));
        self.rt.env.current = saved;
        result
    }

    /// Evaluates with standard output captured into a buffer.
    pub fn eval_captured(&mut self, src: &str) -> Result<(Value, String), Error> {
        self.rt.out = Output::Capture(String::new());
        let result = self.eval_source(Source::eval(src));
        let captured = match std::mem::replace(&mut self.rt.out, Output::Stdout) {
            Output::Capture(buffer) => buffer,
            Output::Stdout => String::new(),
        };
        result.map(|value| (value, captured))
    }

    /// Registers an external builtin into a namespace. The arity
    /// spec is enforced on every call.
    pub fn register(
        &mut self,
        ns: &str,
        name: &'static str,
        arity: AritySpec,
        f: BuiltinFn,
    ) -> Result<(), Error> {
        let target = self.rt.env.create_ns(ns);
        let value = self.rt.alloc(HeapObj::Fn(FnObj::Builtin(Builtin {
            name,
            f,
            arity: Some(arity),
        })));
        let var = self.rt.env.intern(target, name);
        if self.rt.env.var(var).bound {
            return Err(Error::eval(
                ErrorKind::InternalError,
                &format!("{}/{} is already defined", ns, name),
            ));
        }
        self.rt.env.bind_root(var, value);
        Ok(())
    }

    /// Moves the session into a namespace, creating it if needed.
    pub fn set_ns(&mut self, name: &str) {
        let ns = self.rt.env.create_ns(name);
        self.rt.env.current = ns;
    }

    /// The source-file loader: reads a file and evaluates every
    /// top-level form. A leading `(ns ...)` form creates and
    /// enters its namespace; the session's namespace is restored
    /// after the load.
    pub fn load_path(&mut self, path: &Path) -> Result<Value, Error> {
        let source = Source::from_path(path).map_err(|io| {
            Error::eval(
                ErrorKind::InternalError,
                &format!("could not read {}: {}", path.display(), io),
            )
        })?;
        let saved = self.rt.env.current;
        let result = self.eval_source(source);
        self.rt.env.current = saved;
        result
    }

    /// Renders a value readably. Convenience over the value
    /// protocol for embedders and tests.
    pub fn show(&mut self, value: Value) -> String {
        self.rt
            .pr_str(value)
            .unwrap_or_else(|_| "#render-error".to_string())
    }

    /// Direct access to the runtime, for embedders that walk
    /// values themselves.
    pub fn rt(&mut self) -> &mut Rt {
        &mut self.rt
    }

    // -- the driver -----------------------------------------------

    fn eval_source(&mut self, source: Rc<Source>) -> Result<Value, Error> {
        let tokens = Lexer::lex(source)?;
        let mut position = 0;
        let mut last = Value::Nil;

        loop {
            // the reader borrows the environment, so it lives only
            // long enough to produce one form
            let form = {
                let Rt {
                    env,
                    gensym_counter,
                    ..
                } = &mut self.rt;
                let mut reader = Reader::resume(&tokens, position, env, gensym_counter);
                let form = reader.next_form()?;
                position = reader.position();
                form
            };

            match form {
                None => break,
                Some(form) => {
                    last = self.eval_form(form)?;
                }
            }
        }

        Ok(last)
    }

    /// One top-level form through the whole pipeline, with the
    /// expression-boundary collection check at the end.
    fn eval_form(&mut self, form: Spanned<Form>) -> Result<Value, Error> {
        let analysis = Analyzer::analyze(&mut self.rt, form)?;
        self.rt.active_pools.push(analysis.pool.clone());

        let result = match self.backend {
            Backend::Walk => walk::run(&mut self.rt, &analysis.node, &analysis.pool),
            Backend::Vm => {
                gen::compile(&mut self.rt, &analysis).and_then(|proto| self.run_proto(proto))
            }
            Backend::Compare => self.run_both(&analysis),
        };

        self.rt.active_pools.pop();
        self.rt.last_value = result?;

        // the expression boundary is a safe point; the value
        // itself survives through the last-value register
        self.rt.temps.clear();
        self.rt.safepoint();
        Ok(self.rt.last_value)
    }

    fn run_proto(&mut self, proto: crate::common::proto::ProtoRef) -> Result<Value, Error> {
        let closure = self.rt.alloc(HeapObj::Fn(FnObj::Closure(Closure {
            code: FnCode::Compiled(proto),
            env: vec![],
            meta: Value::Nil,
        })));
        vm::call_closure(&mut self.rt, closure, &[])
    }

    /// Comparison mode: the walker's result is the oracle; the
    /// VM must match it structurally. Divergence is an internal
    /// error carrying both renderings.
    fn run_both(&mut self, analysis: &crate::compiler::analyze::Analysis) -> Result<Value, Error> {
        let from_walk = walk::run(&mut self.rt, &analysis.node, &analysis.pool)?;

        let mark = self.rt.protect(&[from_walk]);
        let from_vm = gen::compile(&mut self.rt, analysis).and_then(|proto| self.run_proto(proto));
        let from_walk = self.rt.recall(mark, 0);
        self.rt.unprotect(mark);
        let from_vm = from_vm?;

        let mark = self.rt.protect(&[from_walk, from_vm]);
        let agree = self.agree(from_walk, from_vm);
        let from_walk = self.rt.recall(mark, 0);
        let from_vm = self.rt.recall(mark, 1);
        self.rt.unprotect(mark);

        if !agree? {
            let left = self.show(from_walk);
            let right = self.show(from_vm);
            return Err(Error::eval(
                ErrorKind::InternalError,
                &format!(
                    "back ends disagree: tree walker produced {} but the VM produced {}",
                    left, right
                ),
            ));
        }
        Ok(from_walk)
    }

    /// Structural agreement between back ends: reference-typed
    /// wrappers (atoms, promises, functions, ...) may differ by
    /// identity, so they agree when their tags agree; everything
    /// else must be structurally equal.
    fn agree(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        let ta = self.rt.heap.tag_of(a);
        let tb = self.rt.heap.tag_of(b);
        let reference = |t: TypeTag| {
            matches!(
                t,
                TypeTag::Fn
                    | TypeTag::MultiFn
                    | TypeTag::Protocol
                    | TypeTag::Atom
                    | TypeTag::Volatile
                    | TypeTag::Delay
                    | TypeTag::Promise
                    | TypeTag::Transient
                    | TypeTag::Var
            )
        };
        if reference(ta) || reference(tb) {
            return Ok(ta == tb);
        }

        match (ta, tb) {
            (TypeTag::Vector, TypeTag::Vector)
            | (TypeTag::Map, TypeTag::Map)
            | (TypeTag::Set, TypeTag::Set)
            | (TypeTag::List, TypeTag::List)
            | (TypeTag::Lazy, TypeTag::Lazy)
            | (TypeTag::List, TypeTag::Lazy)
            | (TypeTag::Lazy, TypeTag::List) => {
                // recurse so nested reference values still agree
                let items_a = crate::runtime::lazy::to_vec(&mut self.rt, a, None)?;
                let mark = self.rt.protect(&items_a);
                let items_b = crate::runtime::lazy::to_vec(&mut self.rt, b, None);
                let items_a: Vec<Value> =
                    (0..items_a.len()).map(|i| self.rt.recall(mark, i)).collect();
                self.rt.unprotect(mark);
                let items_b = items_b?;
                if items_a.len() != items_b.len() {
                    return Ok(false);
                }
                if ta == TypeTag::Map {
                    // order-insensitive, but maps realize to
                    // entry pairs; fall back to full equality
                    return self.rt.equal(a, b);
                }
                for (x, y) in items_a.iter().zip(items_b.iter()) {
                    if !self.agree(*x, *y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => self.rt.equal(a, b),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn arithmetic_end_to_end() {
        let mut interp = Interp::default();
        let v = interp.eval("(+ 1 2 3)").unwrap();
        assert_eq!(v, Value::Int(6));
    }

    #[test]
    fn captured_output() {
        let mut interp = Interp::default();
        let (value, out) = interp.eval_captured("(println \"hey\") 7").unwrap();
        assert_eq!(value, Value::Int(7));
        assert_eq!(out, "hey\n");
    }

    #[test]
    fn external_builtin_registration() {
        fn double(_rt: &mut Rt, args: &[Value]) -> Result<Value, Error> {
            match args[0] {
                Value::Int(n) => Ok(Value::Int(n * 2)),
                _ => Err(Error::eval(ErrorKind::TypeError, "double expects an int")),
            }
        }

        let mut interp = Interp::default();
        interp
            .register(
                "host",
                "double",
                AritySpec {
                    min: 1,
                    max: Some(1),
                },
                double,
            )
            .unwrap();
        let v = interp.eval("(host/double 21)").unwrap();
        assert_eq!(v, Value::Int(42));

        // the arity spec is enforced
        assert!(interp.eval("(host/double 1 2)").is_err());
    }

    #[test]
    fn namespace_scoping() {
        let mut interp = Interp::default();
        interp.eval_in("alpha", "(def x 1)").unwrap();
        interp.eval_in("beta", "(def x 2)").unwrap();
        assert_eq!(interp.eval("alpha/x").unwrap(), Value::Int(1));
        assert_eq!(interp.eval("beta/x").unwrap(), Value::Int(2));
    }
}
