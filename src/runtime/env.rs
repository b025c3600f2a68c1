use std::collections::HashMap;

use log::warn;

use crate::runtime::value::Value;

/// A handle to a namespace in the infrastructure arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NsRef(pub u32);

/// A handle to a var in the infrastructure arena. Vars live for
/// the life of the process and are never relocated, so the handle
/// itself is a perfectly good identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef(pub u32);

/// A named mutable cell owned by a namespace: a root value, a
/// dynamic flag, and the bookkeeping that hangs off it. The root
/// is the value seen when no dynamic binding frame shadows it.
#[derive(Debug)]
pub struct Var {
    pub name: String,
    pub ns: NsRef,
    pub root: Value,
    /// Interning creates unbound vars; `def` binds them.
    pub bound: bool,
    pub dynamic: bool,
    /// Macros are functions whose var carries this flag; the
    /// analyzer calls them at expansion time.
    pub macro_flag: bool,
    pub meta: Value,
    pub watches: Vec<(Value, Value)>,
    pub validator: Option<Value>,
}

/// A namespace: local symbol to owning var, aliases to other
/// namespaces, and referred vars owned elsewhere.
#[derive(Debug)]
pub struct Namespace {
    pub name: String,
    pub mappings: HashMap<String, VarRef>,
    pub aliases: HashMap<String, NsRef>,
    pub refers: HashMap<String, VarRef>,
}

/// The process-global environment: every namespace and var, the
/// chain of dynamic binding frames, the type hierarchy, and the
/// tap list. Namespaces and vars are infrastructure - only the
/// values they hold are GC-managed.
pub struct Env {
    namespaces: Vec<Namespace>,
    by_name: HashMap<String, NsRef>,
    vars: Vec<Var>,
    pub current: NsRef,
    /// Newest frame last; each frame is the set of vars one
    /// `binding` form shadows.
    pub dyn_frames: Vec<Vec<(VarRef, Value)>>,
    /// The global `derive`/`isa?` hierarchy, a map value.
    pub hierarchy: Value,
    pub taps: Vec<Value>,
}

/// The name of the namespace the core library loads into, and
/// that every new namespace implicitly refers.
pub const CORE_NS: &str = "waxwing.core";

impl Env {
    /// An environment with just the core and `user` namespaces,
    /// positioned in `user`.
    pub fn new() -> Env {
        let mut env = Env {
            namespaces: vec![],
            by_name: HashMap::new(),
            vars: vec![],
            current: NsRef(0),
            dyn_frames: vec![],
            hierarchy: Value::Nil,
            taps: vec![],
        };
        env.create_ns(CORE_NS);
        let user = env.create_ns("user");
        env.current = user;
        env
    }

    /// Finds or creates a namespace. A fresh namespace refers
    /// everything the core namespace has mapped so far.
    pub fn create_ns(&mut self, name: &str) -> NsRef {
        if let Some(r) = self.by_name.get(name) {
            return *r;
        }

        let r = NsRef(self.namespaces.len() as u32);
        let mut ns = Namespace {
            name: name.to_string(),
            mappings: HashMap::new(),
            aliases: HashMap::new(),
            refers: HashMap::new(),
        };

        if name != CORE_NS {
            if let Some(core) = self.by_name.get(CORE_NS) {
                for (sym, var) in self.namespaces[core.0 as usize].mappings.iter() {
                    ns.refers.insert(sym.clone(), *var);
                }
            }
        }

        self.namespaces.push(ns);
        self.by_name.insert(name.to_string(), r);
        r
    }

    pub fn find_ns(&self, name: &str) -> Option<NsRef> {
        self.by_name.get(name).copied()
    }

    pub fn ns(&self, r: NsRef) -> &Namespace {
        &self.namespaces[r.0 as usize]
    }

    pub fn ns_mut(&mut self, r: NsRef) -> &mut Namespace {
        &mut self.namespaces[r.0 as usize]
    }

    pub fn all_ns(&self) -> impl Iterator<Item = NsRef> {
        (0..self.namespaces.len() as u32).map(NsRef)
    }

    pub fn core_ns(&self) -> NsRef {
        self.by_name[CORE_NS]
    }

    pub fn var(&self, r: VarRef) -> &Var {
        &self.vars[r.0 as usize]
    }

    pub fn var_mut(&mut self, r: VarRef) -> &mut Var {
        &mut self.vars[r.0 as usize]
    }

    /// Finds or creates the var `name` in a namespace. A fresh
    /// var is unbound with a `nil` root.
    pub fn intern(&mut self, ns: NsRef, name: &str) -> VarRef {
        if let Some(r) = self.ns(ns).mappings.get(name) {
            return *r;
        }

        let r = VarRef(self.vars.len() as u32);
        self.vars.push(Var {
            name: name.to_string(),
            ns,
            root: Value::Nil,
            bound: false,
            dynamic: false,
            macro_flag: false,
            meta: Value::Nil,
            watches: vec![],
            validator: None,
        });
        self.ns_mut(ns).mappings.insert(name.to_string(), r);
        r
    }

    /// Binds a var's root. Warns when a core var is clobbered
    /// from outside the core namespace.
    pub fn bind_root(&mut self, r: VarRef, value: Value) {
        let core = self.core_ns();
        let var = self.var_mut(r);
        if var.bound && var.ns == core {
            warn!("redefining core var {}", var.name);
        }
        var.root = value;
        var.bound = true;
    }

    /// Resolves a possibly qualified symbol to a var, from the
    /// viewpoint of namespace `from`: a qualified name goes
    /// through the alias table or the registry; a plain name
    /// searches the namespace's own mappings, then its refers,
    /// then the core namespace.
    pub fn resolve(&self, from: NsRef, ns: Option<&str>, name: &str) -> Option<VarRef> {
        match ns {
            Some(qualifier) => {
                let target = self
                    .ns(from)
                    .aliases
                    .get(qualifier)
                    .copied()
                    .or_else(|| self.find_ns(qualifier))?;
                self.ns(target).mappings.get(name).copied()
            }
            None => {
                let here = self.ns(from);
                here.mappings
                    .get(name)
                    .or_else(|| here.refers.get(name))
                    .or_else(|| self.ns(self.core_ns()).mappings.get(name))
                    .copied()
            }
        }
    }

    /// Dereferences a var: the newest dynamic binding wins, the
    /// root otherwise.
    pub fn deref_var(&self, r: VarRef) -> Value {
        if self.var(r).dynamic {
            for frame in self.dyn_frames.iter().rev() {
                for (v, value) in frame.iter().rev() {
                    if *v == r {
                        return *value;
                    }
                }
            }
        }
        self.var(r).root
    }

    /// Writes through to the newest dynamic binding of a var.
    /// Fails (returns false) when the var has no active binding.
    pub fn set_dynamic(&mut self, r: VarRef, value: Value) -> bool {
        for frame in self.dyn_frames.iter_mut().rev() {
            for (v, slot) in frame.iter_mut().rev() {
                if *v == r {
                    *slot = value;
                    return true;
                }
            }
        }
        false
    }

    pub fn push_frame(&mut self, frame: Vec<(VarRef, Value)>) {
        self.dyn_frames.push(frame);
    }

    pub fn pop_frame(&mut self) -> bool {
        self.dyn_frames.pop().is_some()
    }

    /// Visits every GC root the environment owns: all var roots,
    /// var metadata and watches, dynamic frames, the hierarchy,
    /// and the taps. The collector calls this twice - once
    /// reading (mark), once writing (fixup).
    pub fn each_root(&mut self, mut f: impl FnMut(&mut Value)) {
        for var in self.vars.iter_mut() {
            f(&mut var.root);
            f(&mut var.meta);
            for (k, w) in var.watches.iter_mut() {
                f(k);
                f(w);
            }
            if let Some(v) = var.validator.as_mut() {
                f(v);
            }
        }
        for frame in self.dyn_frames.iter_mut() {
            for (_, v) in frame.iter_mut() {
                f(v);
            }
        }
        f(&mut self.hierarchy);
        for v in self.taps.iter_mut() {
            f(v);
        }
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn intern_and_resolve() {
        let mut env = Env::new();
        let user = env.current;
        let var = env.intern(user, "x");
        assert_eq!(env.resolve(user, None, "x"), Some(var));
        assert_eq!(env.resolve(user, None, "y"), None);
    }

    #[test]
    fn core_is_referred() {
        let mut env = Env::new();
        let core = env.core_ns();
        let plus = env.intern(core, "+");
        // namespaces created after the core mapping see it
        let fresh = env.create_ns("scratch");
        assert_eq!(env.resolve(fresh, None, "+"), Some(plus));
    }

    #[test]
    fn dynamic_shadowing() {
        let mut env = Env::new();
        let user = env.current;
        let var = env.intern(user, "*depth*");
        env.var_mut(var).dynamic = true;
        env.bind_root(var, Value::Int(10));

        assert_eq!(env.deref_var(var), Value::Int(10));
        env.push_frame(vec![(var, Value::Int(20))]);
        assert_eq!(env.deref_var(var), Value::Int(20));
        env.pop_frame();
        assert_eq!(env.deref_var(var), Value::Int(10));
    }

    #[test]
    fn alias_resolution() {
        let mut env = Env::new();
        let other = env.create_ns("other.ns");
        let var = env.intern(other, "thing");
        let user = env.current;
        env.ns_mut(user)
            .aliases
            .insert("o".to_string(), other);

        assert_eq!(env.resolve(user, Some("o"), "thing"), Some(var));
        assert_eq!(env.resolve(user, Some("other.ns"), "thing"), Some(var));
    }
}
