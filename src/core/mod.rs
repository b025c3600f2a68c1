//! The core library: the fixed tables of built-in functions, and
//! the bootstrap source loaded on top of them.
//!
//! Builtins are plain function pointers registered into the core
//! namespace from the compile-time tables below; duplicate names
//! within the tables are rejected by a test over the table
//! itself. Everything that can be expressed in the language
//! rather than in Rust lives in `core.clj`.

pub mod collections;
pub mod io;
pub mod logic;
pub mod math;
pub mod multi;
pub mod seqs;
pub mod state;

use crate::{
    common::error::{Error, ErrorKind},
    runtime::{
        env::NsRef,
        rt::Rt,
        value::{Builtin, BuiltinFn, FnObj, HeapObj, Value},
    },
};

/// The bootstrap source: surface macros and the derived
/// functions, loaded into the core namespace at startup.
pub const CORE_SOURCE: &str = include_str!("core.clj");

/// The compile-time registration table for the core namespace.
pub fn core_table() -> Vec<(&'static str, BuiltinFn)> {
    let mut table: Vec<(&'static str, BuiltinFn)> = vec![];
    table.extend(math::TABLE);
    table.extend(logic::TABLE);
    table.extend(collections::TABLE);
    table.extend(seqs::TABLE);
    table.extend(state::TABLE);
    table.extend(multi::TABLE);
    table.extend(io::TABLE);
    table
}

/// Registers a table of builtins into a namespace. Returns an
/// error on duplicate names - tables are static, so this only
/// fires when two tables collide.
pub fn register(rt: &mut Rt, ns: NsRef, table: &[(&'static str, BuiltinFn)]) -> Result<(), Error> {
    for (name, f) in table {
        let existing = rt.env.ns(ns).mappings.get(*name).copied();
        if let Some(var) = existing {
            if rt.env.var(var).bound {
                return Err(Error::eval(
                    ErrorKind::InternalError,
                    &format!("the builtin {} has already been defined", name),
                ));
            }
        }
        let value = rt.alloc(HeapObj::Fn(FnObj::Builtin(Builtin {
            name,
            f: *f,
            arity: None,
        })));
        let var = rt.env.intern(ns, name);
        rt.env.bind_root(var, value);
    }
    Ok(())
}

// -- shared argument helpers -----------------------------------

/// An arity error in a builtin's voice.
pub(crate) fn arity_error(name: &str, expected: &str, got: usize) -> Error {
    Error::eval(
        ErrorKind::ArityError,
        &format!("{} expects {} argument(s), got {}", name, expected, got),
    )
}

/// A type error in a builtin's voice.
pub(crate) fn type_error(rt: &Rt, name: &str, expected: &str, got: Value) -> Error {
    Error::eval(
        ErrorKind::TypeError,
        &format!(
            "{} expects {}, got a {}",
            name,
            expected,
            rt.heap.type_name(got)
        ),
    )
}

pub(crate) fn expect_exact(name: &str, args: &[Value], n: usize) -> Result<(), Error> {
    if args.len() != n {
        return Err(arity_error(name, &n.to_string(), args.len()));
    }
    Ok(())
}

pub(crate) fn expect_range(
    name: &str,
    args: &[Value],
    low: usize,
    high: usize,
) -> Result<(), Error> {
    if args.len() < low || args.len() > high {
        return Err(arity_error(
            name,
            &format!("{} to {}", low, high),
            args.len(),
        ));
    }
    Ok(())
}

pub(crate) fn expect_at_least(name: &str, args: &[Value], n: usize) -> Result<(), Error> {
    if args.len() < n {
        return Err(arity_error(
            name,
            &format!("at least {}", n),
            args.len(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashSet;

    /// Duplicate names within the combined table are a
    /// compile-time mistake; this is the tripwire.
    #[test]
    fn no_duplicate_builtins() {
        let table = core_table();
        let mut seen = HashSet::new();
        for (name, _) in table {
            assert!(seen.insert(name), "duplicate builtin name: {}", name);
        }
    }

    #[test]
    fn registration_binds_everything() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let core = rt.env.core_ns();
        let table = core_table();
        register(&mut rt, core, &table).unwrap();
        for (name, _) in core_table() {
            let var = rt.env.ns(core).mappings.get(name).copied().unwrap();
            assert!(rt.env.var(var).bound, "{} did not bind", name);
        }
    }
}
