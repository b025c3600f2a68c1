use std::collections::{HashMap, HashSet};

use log::trace;

use crate::{
    common::{node::ConstPool, proto::FnProto},
    runtime::{
        env::Env,
        rt::InternKey,
        value::{
            FnCode, FnObj, Generator, HeapObj, LazySeq, Transient, TypeTag, Value,
        },
    },
};

/// A handle into the garbage-collected heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub u32);

/// The value heap: a single arena of [`HeapObj`]s addressed by
/// [`ObjRef`]. Collection relocates every live object into a
/// fresh arena and rewrites every handle through a forwarding
/// table - in the roots, and in the interior of every relocated
/// object. A handle that escapes the root set is not an unsafety
/// hazard here (it is an index, not a pointer), but it is exactly
/// as wrong: after a collection it reads some other object.
pub struct Heap {
    objs: Vec<HeapObj>,
    /// Estimated live bytes, fed into the collection trigger.
    pub bytes: usize,
}

/// Everything the collector must treat as live, beyond what the
/// environment itself owns. The back ends pass their own stacks
/// in when they reach a safe point.
pub struct Roots<'a> {
    pub env: &'a mut Env,
    /// Prototype pools live in the infrastructure arena for the
    /// life of the process; their constants are pinned.
    pub protos: &'a mut [FnProto],
    /// Analysis pools of forms currently being evaluated.
    pub pools: &'a [ConstPool],
    pub stacks: Vec<&'a mut Vec<Value>>,
    pub values: Vec<&'a mut Value>,
    pub interned: &'a mut HashMap<InternKey, ObjRef>,
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            objs: vec![],
            bytes: 0,
        }
    }

    /// Moves an object onto the heap, returning its handle.
    pub fn alloc(&mut self, obj: HeapObj) -> ObjRef {
        self.bytes += obj.size_estimate();
        self.objs.push(obj);
        ObjRef(self.objs.len() as u32 - 1)
    }

    pub fn get(&self, r: ObjRef) -> &HeapObj {
        &self.objs[r.0 as usize]
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObj {
        &mut self.objs[r.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.objs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    /// The coarse type of a value.
    pub fn tag_of(&self, v: Value) -> TypeTag {
        match v {
            Value::Nil => TypeTag::Nil,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::Char(_) => TypeTag::Char,
            Value::Obj(r) => self.get(r).tag(),
            Value::Var(_) => TypeTag::Var,
        }
    }

    pub fn type_name(&self, v: Value) -> &'static str {
        self.tag_of(v).name()
    }

    /// Structural equality. Two values are equal iff they carry
    /// the same tag and their contents are pairwise equal; `Int`
    /// and `Float` never compare equal here (numeric promotion is
    /// `==`'s business, not `=`'s). Reference-typed cells (atoms,
    /// functions, promises, unforced lazy seqs, ...) compare by
    /// identity.
    pub fn equal(&self, a: Value, b: Value) -> bool {
        match (a, b) {
            (Value::Obj(ra), Value::Obj(rb)) => {
                if ra == rb {
                    return true;
                }
                self.obj_equal(ra, rb)
            }
            _ => a == b,
        }
    }

    fn obj_equal(&self, ra: ObjRef, rb: ObjRef) -> bool {
        match (self.get(ra), self.get(rb)) {
            (HeapObj::Str(a), HeapObj::Str(b)) => a == b,
            (HeapObj::Regex(a), HeapObj::Regex(b)) => a == b,
            (
                HeapObj::Sym { ns: na, name: a, .. },
                HeapObj::Sym { ns: nb, name: b, .. },
            ) => na == nb && a == b,
            (
                HeapObj::Keyword { ns: na, name: a },
                HeapObj::Keyword { ns: nb, name: b },
            ) => na == nb && a == b,
            (HeapObj::List { items: a, .. }, HeapObj::List { items: b, .. })
            | (HeapObj::Vector { items: a, .. }, HeapObj::Vector { items: b, .. }) => {
                a.len() == b.len()
                    && a.iter().zip(b.iter()).all(|(x, y)| self.equal(*x, *y))
            }
            (HeapObj::Map { entries: a, .. }, HeapObj::Map { entries: b, .. }) => {
                a.len() == b.len()
                    && a.iter().all(|(k, v)| {
                        b.iter()
                            .any(|(k2, v2)| self.equal(*k, *k2) && self.equal(*v, *v2))
                    })
            }
            (HeapObj::Set { items: a, .. }, HeapObj::Set { items: b, .. }) => {
                a.len() == b.len()
                    && a.iter().all(|x| b.iter().any(|y| self.equal(*x, *y)))
            }
            // realized lazy spines compare structurally without forcing
            (HeapObj::Lazy(LazySeq::Empty), HeapObj::Lazy(LazySeq::Empty)) => true,
            (
                HeapObj::Lazy(LazySeq::Cons { head: ha, tail: ta }),
                HeapObj::Lazy(LazySeq::Cons { head: hb, tail: tb }),
            ) => self.equal(*ha, *hb) && self.equal(*ta, *tb),
            // everything else is a reference type: identity only,
            // and `ra == rb` was already ruled out
            _ => false,
        }
    }

    /// Runs a full collection. See the module docs: mark from the
    /// roots with an explicit work queue, relocate the marked
    /// objects into a fresh arena, rewrite every handle through
    /// the forwarding table, release the old arena.
    pub fn collect(&mut self, mut roots: Roots) {
        let before = self.objs.len();

        // -- mark ------------------------------------------------
        let mut marked = vec![false; self.objs.len()];
        let mut queue: Vec<ObjRef> = vec![];
        // analysis pools reachable from live closures, each once
        let mut pools: Vec<ConstPool> = vec![];
        let mut pool_seen: HashSet<*const ()> = HashSet::new();

        let mut note_pool =
            |pool: &ConstPool,
             pools: &mut Vec<ConstPool>,
             pool_seen: &mut HashSet<*const ()>| {
                if pool_seen.insert(std::rc::Rc::as_ptr(pool) as *const ()) {
                    pools.push(pool.clone());
                }
            };

        {
            let mut push = |v: Value, marked: &mut Vec<bool>, queue: &mut Vec<ObjRef>| {
                if let Value::Obj(r) = v {
                    let i = r.0 as usize;
                    if !marked[i] {
                        marked[i] = true;
                        queue.push(r);
                    }
                }
            };

            roots
                .env
                .each_root(|v| push(*v, &mut marked, &mut queue));
            for proto in roots.protos.iter() {
                for v in proto.consts.iter() {
                    push(*v, &mut marked, &mut queue);
                }
            }
            for pool in roots.pools.iter() {
                note_pool(pool, &mut pools, &mut pool_seen);
            }
            for stack in roots.stacks.iter() {
                for v in stack.iter() {
                    push(*v, &mut marked, &mut queue);
                }
            }
            for v in roots.values.iter() {
                push(**v, &mut marked, &mut queue);
            }
            for r in roots.interned.values() {
                push(Value::Obj(*r), &mut marked, &mut queue);
            }
            // mark the root pools' constants
            for pool in pools.clone().iter() {
                for v in pool.borrow().iter() {
                    push(*v, &mut marked, &mut queue);
                }
            }

            while let Some(r) = queue.pop() {
                // the borrow checker insists we look before we push
                let children = self.children_of(r, &mut |pool| {
                    note_pool(pool, &mut pools, &mut pool_seen)
                });
                for child in children {
                    push(child, &mut marked, &mut queue);
                }
            }

            // pools discovered during the walk also pin constants
            let mut at = 0;
            while at < pools.len() {
                let pool = pools[at].clone();
                for v in pool.borrow().iter() {
                    push(*v, &mut marked, &mut queue);
                }
                while let Some(r) = queue.pop() {
                    let children = self.children_of(r, &mut |pool| {
                        note_pool(pool, &mut pools, &mut pool_seen)
                    });
                    for child in children {
                        push(child, &mut marked, &mut queue);
                    }
                }
                at += 1;
            }
        }

        // -- relocate + forward ---------------------------------
        let mut forward = vec![u32::MAX; self.objs.len()];
        let mut next = Vec::with_capacity(marked.iter().filter(|m| **m).count());
        for (i, obj) in self.objs.iter().enumerate() {
            if marked[i] {
                forward[i] = next.len() as u32;
                next.push(obj.clone());
            }
        }

        // -- fixup ----------------------------------------------
        let fw = |v: &mut Value| {
            if let Value::Obj(r) = v {
                let to = forward[r.0 as usize];
                debug_assert!(to != u32::MAX, "fixup reached an unmarked object");
                *v = Value::Obj(ObjRef(to));
            }
        };

        for obj in next.iter_mut() {
            Heap::fixup_obj(obj, &fw);
        }
        roots.env.each_root(|v| fw(v));
        for proto in roots.protos.iter_mut() {
            for v in proto.consts.iter_mut() {
                fw(v);
            }
        }
        for pool in pools.iter() {
            for v in pool.borrow_mut().iter_mut() {
                fw(v);
            }
        }
        for stack in roots.stacks.iter_mut() {
            for v in stack.iter_mut() {
                fw(v);
            }
        }
        for v in roots.values.iter_mut() {
            fw(v);
        }
        for r in roots.interned.values_mut() {
            let to = forward[r.0 as usize];
            debug_assert!(to != u32::MAX);
            *r = ObjRef(to);
        }

        // -- release --------------------------------------------
        self.objs = next;
        self.bytes = self.objs.iter().map(|o| o.size_estimate()).sum();

        trace!(
            "gc: {} objects -> {}, ~{} bytes live",
            before,
            self.objs.len(),
            self.bytes
        );
    }

    /// Every value reachable from one object, one level deep.
    /// Exhaustive over `HeapObj` and `LazySeq` on purpose: a new
    /// variant must show up here or nothing compiles.
    fn children_of(
        &self,
        r: ObjRef,
        note_pool: &mut dyn FnMut(&ConstPool),
    ) -> Vec<Value> {
        let mut out = vec![];
        match self.get(r) {
            HeapObj::Str(_) => {}
            HeapObj::Sym { meta, .. } => out.push(*meta),
            HeapObj::Keyword { .. } => {}
            HeapObj::List { items, meta }
            | HeapObj::Vector { items, meta }
            | HeapObj::Set { items, meta } => {
                out.extend(items.iter().copied());
                out.push(*meta);
            }
            HeapObj::Map { entries, meta } => {
                for (k, v) in entries.iter() {
                    out.push(*k);
                    out.push(*v);
                }
                out.push(*meta);
            }
            HeapObj::Regex(_) => {}
            HeapObj::Fn(f) => match f {
                FnObj::Builtin(_) => {}
                FnObj::Closure(c) => {
                    out.extend(c.env.iter().copied());
                    out.push(c.meta);
                    if let FnCode::Tree(def) = &c.code {
                        note_pool(&def.consts);
                    }
                }
                FnObj::Partial { f, args } => {
                    out.push(*f);
                    out.extend(args.iter().copied());
                }
                FnObj::Comp { fns } => out.extend(fns.iter().copied()),
            },
            HeapObj::MultiFn(m) => {
                out.push(m.dispatch);
                out.push(m.default_key);
                for (k, v) in m.methods.iter() {
                    out.push(*k);
                    out.push(*v);
                }
            }
            HeapObj::Protocol(_) => {}
            HeapObj::ProtocolFn(p) => {
                out.push(p.protocol);
                for (_, v) in p.impls.iter() {
                    out.push(*v);
                }
            }
            HeapObj::Atom(a) => {
                out.push(a.value);
                for (k, f) in a.watches.iter() {
                    out.push(*k);
                    out.push(*f);
                }
                if let Some(v) = a.validator {
                    out.push(v);
                }
            }
            HeapObj::Volatile(v) => out.push(*v),
            HeapObj::Delay(d) => {
                out.push(d.thunk);
                if let Some(v) = d.value {
                    out.push(v);
                }
            }
            HeapObj::Promise(p) => {
                if let Some(v) = p {
                    out.push(*v);
                }
            }
            HeapObj::Reduced(v) => out.push(*v),
            HeapObj::Transient(t) => match t {
                Transient::Vector { items, .. } | Transient::Set { items, .. } => {
                    out.extend(items.iter().copied())
                }
                Transient::Map { entries, .. } => {
                    for (k, v) in entries.iter() {
                        out.push(*k);
                        out.push(*v);
                    }
                }
            },
            HeapObj::Lazy(l) => match l {
                LazySeq::Thunk(f) => out.push(*f),
                LazySeq::Cons { head, tail } => {
                    out.push(*head);
                    out.push(*tail);
                }
                LazySeq::Empty => {}
                LazySeq::Transform {
                    source, f, pending, ..
                } => {
                    out.push(*source);
                    out.push(*f);
                    out.extend(pending.iter().copied());
                }
                LazySeq::Concat { sources } => out.extend(sources.iter().copied()),
                LazySeq::Gen(g) => match g {
                    Generator::Iterate { f, next } => {
                        out.push(*f);
                        out.push(*next);
                    }
                    Generator::Repeat { item, .. } => out.push(*item),
                    Generator::Cycle { items, .. } => out.extend(items.iter().copied()),
                    Generator::Range { .. } => {}
                },
            },
        }
        out
    }

    /// Rewrites every interior handle of one relocated object.
    /// The same exhaustive shape as `children_of`, but by
    /// mutation.
    fn fixup_obj(obj: &mut HeapObj, fw: &dyn Fn(&mut Value)) {
        match obj {
            HeapObj::Str(_) => {}
            HeapObj::Sym { meta, .. } => fw(meta),
            HeapObj::Keyword { .. } => {}
            HeapObj::List { items, meta }
            | HeapObj::Vector { items, meta }
            | HeapObj::Set { items, meta } => {
                for v in items.iter_mut() {
                    fw(v);
                }
                fw(meta);
            }
            HeapObj::Map { entries, meta } => {
                for (k, v) in entries.iter_mut() {
                    fw(k);
                    fw(v);
                }
                fw(meta);
            }
            HeapObj::Regex(_) => {}
            HeapObj::Fn(f) => match f {
                FnObj::Builtin(_) => {}
                FnObj::Closure(c) => {
                    for v in c.env.iter_mut() {
                        fw(v);
                    }
                    fw(&mut c.meta);
                    // the pool behind FnCode::Tree is rewritten
                    // once, from the collected pool list
                }
                FnObj::Partial { f, args } => {
                    fw(f);
                    for v in args.iter_mut() {
                        fw(v);
                    }
                }
                FnObj::Comp { fns } => {
                    for v in fns.iter_mut() {
                        fw(v);
                    }
                }
            },
            HeapObj::MultiFn(m) => {
                fw(&mut m.dispatch);
                fw(&mut m.default_key);
                for (k, v) in m.methods.iter_mut() {
                    fw(k);
                    fw(v);
                }
            }
            HeapObj::Protocol(_) => {}
            HeapObj::ProtocolFn(p) => {
                fw(&mut p.protocol);
                for (_, v) in p.impls.iter_mut() {
                    fw(v);
                }
            }
            HeapObj::Atom(a) => {
                fw(&mut a.value);
                for (k, f) in a.watches.iter_mut() {
                    fw(k);
                    fw(f);
                }
                if let Some(v) = a.validator.as_mut() {
                    fw(v);
                }
            }
            HeapObj::Volatile(v) => fw(v),
            HeapObj::Delay(d) => {
                fw(&mut d.thunk);
                if let Some(v) = d.value.as_mut() {
                    fw(v);
                }
            }
            HeapObj::Promise(p) => {
                if let Some(v) = p.as_mut() {
                    fw(v);
                }
            }
            HeapObj::Reduced(v) => fw(v),
            HeapObj::Transient(t) => match t {
                Transient::Vector { items, .. } | Transient::Set { items, .. } => {
                    for v in items.iter_mut() {
                        fw(v);
                    }
                }
                Transient::Map { entries, .. } => {
                    for (k, v) in entries.iter_mut() {
                        fw(k);
                        fw(v);
                    }
                }
            },
            HeapObj::Lazy(l) => match l {
                LazySeq::Thunk(f) => fw(f),
                LazySeq::Cons { head, tail } => {
                    fw(head);
                    fw(tail);
                }
                LazySeq::Empty => {}
                LazySeq::Transform {
                    source, f, pending, ..
                } => {
                    fw(source);
                    fw(f);
                    for v in pending.iter_mut() {
                        fw(v);
                    }
                }
                LazySeq::Concat { sources } => {
                    for v in sources.iter_mut() {
                        fw(v);
                    }
                }
                LazySeq::Gen(g) => match g {
                    Generator::Iterate { f, next } => {
                        fw(f);
                        fw(next);
                    }
                    Generator::Repeat { item, .. } => fw(item),
                    Generator::Cycle { items, .. } => {
                        for v in items.iter_mut() {
                            fw(v);
                        }
                    }
                    Generator::Range { .. } => {}
                },
            },
        }
    }
}
