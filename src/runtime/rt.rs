use std::collections::HashMap;

use crate::{
    common::{
        error::{Error, ErrorKind},
        node::ConstPool,
        proto::{FnProto, ProtoRef},
    },
    runtime::{
        env::Env,
        heap::{Heap, ObjRef, Roots},
        lazy,
        value::{FnCode, FnObj, HeapObj, TypeTag, Value},
        vm, walk,
    },
};

/// Interning key for symbols and keywords: the keyword flag, the
/// namespace part, and the name.
pub type InternKey = (bool, Option<String>, String);

/// Where `print` and friends write.
pub enum Output {
    Stdout,
    Capture(String),
}

/// The whole of the mutable runtime: the value heap, the
/// environment, the prototype table, and the bookkeeping both
/// back ends share. Exactly one `Rt` exists per interpreter;
/// everything on it is single-threaded.
pub struct Rt {
    pub heap: Heap,
    pub env: Env,
    pub protos: Vec<FnProto>,
    /// Values a builtin or the tree walker holds across a call
    /// back into user code. A collection at a safe point treats
    /// these as roots and rewrites them, so "push, call, read
    /// back" keeps a value alive and current.
    pub temps: Vec<Value>,
    /// Constant pools of the forms currently being evaluated.
    pub active_pools: Vec<ConstPool>,
    /// The tree walker's locals stack. All walker activations -
    /// including reentrant ones started by builtins - share it,
    /// so every live local is a root at every safe point.
    pub wstack: Vec<Value>,
    /// The function values of the walker's active calls.
    pub wcallees: Vec<Value>,
    /// The VM's value stack; frames index into it.
    pub vstack: Vec<Value>,
    /// The function values of the VM's active frames.
    pub vcallees: Vec<Value>,
    pub interned: HashMap<InternKey, ObjRef>,
    pub out: Output,
    pub last_value: Value,
    pub gc_threshold: usize,
    pub expand_limit: usize,
    pub max_call_depth: usize,
    pub call_depth: usize,
    pub gensym_counter: u64,
}

impl Rt {
    pub fn new(gc_threshold: usize, expand_limit: usize, max_call_depth: usize) -> Rt {
        Rt {
            heap: Heap::new(),
            env: Env::new(),
            protos: vec![],
            temps: vec![],
            active_pools: vec![],
            wstack: vec![],
            wcallees: vec![],
            vstack: vec![],
            vcallees: vec![],
            interned: HashMap::new(),
            out: Output::Stdout,
            last_value: Value::Nil,
            gc_threshold,
            expand_limit,
            max_call_depth,
            call_depth: 0,
            gensym_counter: 0,
        }
    }

    // -- allocation and interning ---------------------------------

    pub fn alloc(&mut self, obj: HeapObj) -> Value {
        Value::Obj(self.heap.alloc(obj))
    }

    pub fn str_value(&mut self, s: &str) -> Value {
        self.alloc(HeapObj::Str(s.to_string()))
    }

    /// Symbols are interned: equal names share a handle, so
    /// `identical?` on equal symbols is guaranteed.
    pub fn sym_value(&mut self, ns: Option<&str>, name: &str) -> Value {
        let key = (false, ns.map(str::to_string), name.to_string());
        if let Some(r) = self.interned.get(&key) {
            return Value::Obj(*r);
        }
        let r = self.heap.alloc(HeapObj::Sym {
            ns: ns.map(str::to_string),
            name: name.to_string(),
            meta: Value::Nil,
        });
        self.interned.insert(key, r);
        Value::Obj(r)
    }

    /// Keywords are interned like symbols.
    pub fn keyword_value(&mut self, ns: Option<&str>, name: &str) -> Value {
        let key = (true, ns.map(str::to_string), name.to_string());
        if let Some(r) = self.interned.get(&key) {
            return Value::Obj(*r);
        }
        let r = self.heap.alloc(HeapObj::Keyword {
            ns: ns.map(str::to_string),
            name: name.to_string(),
        });
        self.interned.insert(key, r);
        Value::Obj(r)
    }

    pub fn kw(&mut self, name: &str) -> Value {
        self.keyword_value(None, name)
    }

    pub fn list_value(&mut self, items: Vec<Value>) -> Value {
        self.alloc(HeapObj::List {
            items,
            meta: Value::Nil,
        })
    }

    pub fn vector_value(&mut self, items: Vec<Value>) -> Value {
        self.alloc(HeapObj::Vector {
            items,
            meta: Value::Nil,
        })
    }

    pub fn map_value(&mut self, entries: Vec<(Value, Value)>) -> Value {
        self.alloc(HeapObj::Map {
            entries,
            meta: Value::Nil,
        })
    }

    pub fn set_value(&mut self, items: Vec<Value>) -> Value {
        self.alloc(HeapObj::Set {
            items,
            meta: Value::Nil,
        })
    }

    pub fn add_proto(&mut self, proto: FnProto) -> ProtoRef {
        self.protos.push(proto);
        ProtoRef(self.protos.len() as u32 - 1)
    }

    pub fn gensym(&mut self, prefix: &str) -> String {
        self.gensym_counter += 1;
        format!("{}__{}__auto__", prefix, self.gensym_counter)
    }

    // -- temp rooting ---------------------------------------------
    //
    // A collection at a safe point rewrites every handle it can
    // see; a `Value` sitting in a Rust local across a call into
    // user code is invisible to it. The discipline is: protect
    // the values, make the call, recall them (possibly moved),
    // unprotect. Values that never cross a call into user code
    // don't need this.

    /// Pushes values onto the temp-root stack, returning the mark
    /// to recall and unprotect with.
    pub fn protect(&mut self, values: &[Value]) -> usize {
        let mark = self.temps.len();
        self.temps.extend_from_slice(values);
        mark
    }

    /// Reads back a protected value, as rewritten by any
    /// collection that ran since `protect`.
    pub fn recall(&self, mark: usize, i: usize) -> Value {
        self.temps[mark + i]
    }

    /// Pops everything protected at or after `mark`.
    pub fn unprotect(&mut self, mark: usize) {
        self.temps.truncate(mark);
    }

    // -- garbage collection ---------------------------------------

    /// A safe point: collect if the threshold was crossed.
    /// Everything live is rooted through `Rt` itself.
    pub fn safepoint(&mut self) {
        if self.heap.bytes >= self.gc_threshold {
            self.gc(vec![], vec![]);
        }
    }

    /// Unconditional collection.
    pub fn gc<'a>(&'a mut self, mut stacks: Vec<&'a mut Vec<Value>>, mut values: Vec<&'a mut Value>) {
        let Rt {
            heap,
            env,
            protos,
            temps,
            active_pools,
            wstack,
            wcallees,
            vstack,
            vcallees,
            interned,
            last_value,
            ..
        } = self;
        stacks.push(temps);
        stacks.push(wstack);
        stacks.push(wcallees);
        stacks.push(vstack);
        stacks.push(vcallees);
        values.push(last_value);
        heap.collect(Roots {
            env,
            protos,
            pools: &*active_pools,
            stacks,
            values,
            interned,
        });
    }

    // -- calling ---------------------------------------------------

    fn enter_call(&mut self, span_hint: &str) -> Result<(), Error> {
        self.call_depth += 1;
        if self.call_depth > self.max_call_depth {
            self.call_depth -= 1;
            return Err(Error::eval(
                ErrorKind::InternalError,
                &format!("call depth limit exceeded calling {}", span_hint),
            ));
        }
        Ok(())
    }

    fn exit_call(&mut self) {
        self.call_depth -= 1;
    }

    /// Calls any callable value with the given arguments. This is
    /// the one dispatch both back ends, the lazy-seq engine, and
    /// every higher-order builtin go through; which machine runs
    /// a user function depends on which one compiled it.
    pub fn call(&mut self, f: Value, args: &[Value]) -> Result<Value, Error> {
        match f {
            Value::Obj(r) => match self.heap.get(r) {
                HeapObj::Fn(FnObj::Builtin(b)) => {
                    let b = *b;
                    if let Some(spec) = b.arity {
                        let high = spec.max.unwrap_or(usize::MAX);
                        if args.len() < spec.min || args.len() > high {
                            return Err(Error::eval(
                                ErrorKind::ArityError,
                                &format!(
                                    "wrong number of arguments ({}) passed to {}",
                                    args.len(),
                                    b.name
                                ),
                            ));
                        }
                    }
                    self.enter_call(b.name)?;
                    let result = (b.f)(self, args);
                    self.exit_call();
                    result
                }
                HeapObj::Fn(FnObj::Closure(c)) => {
                    let code = c.code.clone();
                    self.enter_call("fn")?;
                    let result = match code {
                        FnCode::Tree(_) => walk::call_closure(self, f, args),
                        FnCode::Compiled(_) => vm::call_closure(self, f, args),
                    };
                    self.exit_call();
                    result
                }
                HeapObj::Fn(FnObj::Partial {
                    f: inner,
                    args: stored,
                }) => {
                    let inner = *inner;
                    let mut all = stored.clone();
                    all.extend_from_slice(args);
                    // keep the argument list alive across the call
                    let mark = self.temps.len();
                    self.temps.extend_from_slice(&all);
                    let result = self.call(inner, &all);
                    self.temps.truncate(mark);
                    result
                }
                HeapObj::Fn(FnObj::Comp { fns }) => {
                    let fns = fns.clone();
                    match fns.split_last() {
                        None => Ok(args.first().copied().unwrap_or(Value::Nil)),
                        Some((innermost, outer)) => {
                            let mut acc = self.call(*innermost, args)?;
                            for f in outer.iter().rev() {
                                let mark = self.temps.len();
                                self.temps.push(acc);
                                let result = self.call(*f, &[acc]);
                                self.temps.truncate(mark);
                                acc = result?;
                            }
                            Ok(acc)
                        }
                    }
                }
                HeapObj::MultiFn(_) => crate::core::multi::call_multi(self, f, args),
                HeapObj::ProtocolFn(_) => crate::core::multi::call_protocol_fn(self, f, args),
                HeapObj::Keyword { .. } => {
                    // (:k m) and (:k m default)
                    self.callable_lookup(f, args, "keyword")
                }
                HeapObj::Map { .. } => {
                    // (m k) and (m k default)
                    let (key, default) = Self::lookup_args(args, "map")?;
                    let found = crate::core::collections::get_value(self, f, key)?;
                    Ok(if found == Value::Nil && !self.map_has_key(f, key) {
                        default
                    } else {
                        found
                    })
                }
                HeapObj::Set { items, .. } => {
                    let items = items.clone();
                    let (key, default) = Self::lookup_args(args, "set")?;
                    for item in items {
                        if self.equal(item, key)? {
                            return Ok(item);
                        }
                    }
                    Ok(default)
                }
                HeapObj::Vector { items, .. } => {
                    let items = items.clone();
                    match args {
                        [Value::Int(i)] if *i >= 0 && (*i as usize) < items.len() => {
                            Ok(items[*i as usize])
                        }
                        [Value::Int(i)] => Err(Error::eval(
                            ErrorKind::IndexOutOfBounds,
                            &format!("index {} out of bounds for vector of {}", i, items.len()),
                        )),
                        _ => Err(Error::eval(
                            ErrorKind::TypeError,
                            "vector lookup takes one integer index",
                        )),
                    }
                }
                other => Err(Error::eval(
                    ErrorKind::TypeError,
                    &format!("a {} is not callable", other.tag().name()),
                )),
            },
            Value::Var(v) => {
                let value = self.env.deref_var(v);
                self.call(value, args)
            }
            other => Err(Error::eval(
                ErrorKind::TypeError,
                &format!("a {} is not callable", self.heap.type_name(other)),
            )),
        }
    }

    fn lookup_args(args: &[Value], what: &str) -> Result<(Value, Value), Error> {
        match args {
            [k] => Ok((*k, Value::Nil)),
            [k, d] => Ok((*k, *d)),
            _ => Err(Error::eval(
                ErrorKind::ArityError,
                &format!("{} lookup takes 1 or 2 arguments, got {}", what, args.len()),
            )),
        }
    }

    fn callable_lookup(&mut self, key: Value, args: &[Value], what: &str) -> Result<Value, Error> {
        let (coll, default) = Self::lookup_args(args, what)?;
        let found = crate::core::collections::get_value(self, coll, key)?;
        Ok(if found == Value::Nil && !self.map_has_key(coll, key) {
            default
        } else {
            found
        })
    }

    fn map_has_key(&self, coll: Value, key: Value) -> bool {
        if let Value::Obj(r) = coll {
            if let HeapObj::Map { entries, .. } = self.heap.get(r) {
                return entries.iter().any(|(k, _)| self.heap.equal(*k, key));
            }
        }
        false
    }

    // -- equality and printing ------------------------------------

    /// Structural equality as `=` sees it: like
    /// [`Heap::equal`](crate::runtime::heap::Heap::equal), except
    /// lists and (fully realized) lazy sequences compare as one
    /// sequential family, forcing as needed.
    pub fn equal(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        let ta = self.heap.tag_of(a);
        let tb = self.heap.tag_of(b);

        let seqish = |t: TypeTag| matches!(t, TypeTag::List | TypeTag::Lazy);
        if seqish(ta) && seqish(tb) {
            let mut xa = a;
            let mut xb = b;
            loop {
                let mark = self.protect(&[xb]);
                let na = lazy::seq_next(self, xa);
                let xb_now = self.recall(mark, 0);
                self.unprotect(mark);

                match na? {
                    None => return Ok(lazy::seq_next(self, xb_now)?.is_none()),
                    Some((ha, rest_a)) => {
                        let mark = self.protect(&[ha, rest_a]);
                        let nb = lazy::seq_next(self, xb_now);
                        let ha = self.recall(mark, 0);
                        let rest_a = self.recall(mark, 1);
                        self.unprotect(mark);

                        match nb? {
                            None => return Ok(false),
                            Some((hb, rest_b)) => {
                                let mark = self.protect(&[rest_a, rest_b]);
                                let eq = self.equal(ha, hb);
                                xa = self.recall(mark, 0);
                                xb = self.recall(mark, 1);
                                self.unprotect(mark);
                                if !eq? {
                                    return Ok(false);
                                }
                            }
                        }
                    }
                }
            }
        }

        if ta != tb {
            return Ok(false);
        }

        match ta {
            TypeTag::Vector => {
                let (xs, ys) = match (a, b) {
                    (Value::Obj(ra), Value::Obj(rb)) => {
                        match (self.heap.get(ra), self.heap.get(rb)) {
                            (
                                HeapObj::Vector { items: xs, .. },
                                HeapObj::Vector { items: ys, .. },
                            ) => (xs.clone(), ys.clone()),
                            _ => unreachable!(),
                        }
                    }
                    _ => unreachable!(),
                };
                if xs.len() != ys.len() {
                    return Ok(false);
                }
                for (x, y) in xs.iter().zip(ys.iter()) {
                    if !self.equal(*x, *y)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            _ => Ok(self.heap.equal(a, b)),
        }
    }

    /// Prints a value readably, the way the reader would accept
    /// it back. Forces lazy sequences.
    pub fn pr_str(&mut self, v: Value) -> Result<String, Error> {
        let mut out = String::new();
        self.write_value(v, true, 0, &mut out)?;
        Ok(out)
    }

    /// Prints a value for humans: strings bare, characters bare.
    pub fn display_str(&mut self, v: Value) -> Result<String, Error> {
        let mut out = String::new();
        self.write_value(v, false, 0, &mut out)?;
        Ok(out)
    }

    fn write_value(
        &mut self,
        v: Value,
        readable: bool,
        depth: usize,
        out: &mut String,
    ) -> Result<(), Error> {
        use std::fmt::Write;

        if depth > 64 {
            out.push_str("...");
            return Ok(());
        }

        match v {
            Value::Nil => out.push_str("nil"),
            Value::Bool(b) => {
                let _ = write!(out, "{}", b);
            }
            Value::Int(n) => {
                let _ = write!(out, "{}", n);
            }
            Value::Float(n) => {
                if n.is_finite() && n.fract() == 0.0 {
                    let _ = write!(out, "{:.1}", n);
                } else {
                    let _ = write!(out, "{}", n);
                }
            }
            Value::Char(c) => {
                if readable {
                    match c {
                        '\n' => out.push_str("\\newline"),
                        '\t' => out.push_str("\\tab"),
                        '\r' => out.push_str("\\return"),
                        ' ' => out.push_str("\\space"),
                        c => {
                            let _ = write!(out, "\\{}", c);
                        }
                    }
                } else {
                    out.push(c);
                }
            }
            Value::Var(r) => {
                let var = self.env.var(r);
                let ns = self.env.ns(var.ns).name.clone();
                let _ = write!(out, "#'{}/{}", ns, var.name);
            }
            Value::Obj(r) => {
                return self.write_obj(r, readable, depth, out);
            }
        }
        Ok(())
    }

    fn write_obj(
        &mut self,
        r: ObjRef,
        readable: bool,
        depth: usize,
        out: &mut String,
    ) -> Result<(), Error> {
        use std::fmt::Write;

        match self.heap.get(r).clone() {
            HeapObj::Str(s) => {
                if readable {
                    let _ = write!(out, "{:?}", s);
                } else {
                    out.push_str(&s);
                }
            }
            HeapObj::Sym { ns, name, .. } => {
                if let Some(ns) = ns {
                    let _ = write!(out, "{}/", ns);
                }
                out.push_str(&name);
            }
            HeapObj::Keyword { ns, name } => {
                out.push(':');
                if let Some(ns) = ns {
                    let _ = write!(out, "{}/", ns);
                }
                out.push_str(&name);
            }
            HeapObj::List { items, .. } => {
                self.write_seq(&items, "(", ")", readable, depth, out)?;
            }
            HeapObj::Vector { items, .. } => {
                self.write_seq(&items, "[", "]", readable, depth, out)?;
            }
            HeapObj::Map { entries, .. } => {
                out.push('{');
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_value(*k, readable, depth + 1, out)?;
                    out.push(' ');
                    self.write_value(*v, readable, depth + 1, out)?;
                }
                out.push('}');
            }
            HeapObj::Set { items, .. } => {
                self.write_seq(&items, "#{", "}", readable, depth, out)?;
            }
            HeapObj::Regex(s) => {
                let _ = write!(out, "#\"{}\"", s);
            }
            HeapObj::Fn(f) => match f {
                FnObj::Builtin(b) => {
                    let _ = write!(out, "#function[{}]", b.name);
                }
                FnObj::Closure(c) => {
                    let name = match &c.code {
                        FnCode::Tree(def) => def.name.clone(),
                        FnCode::Compiled(p) => self.protos[p.0 as usize].name.clone(),
                    };
                    let _ = write!(out, "#function[{}]", name.as_deref().unwrap_or("fn"));
                }
                FnObj::Partial { .. } => out.push_str("#function[partial]"),
                FnObj::Comp { .. } => out.push_str("#function[comp]"),
            },
            HeapObj::MultiFn(m) => {
                let _ = write!(out, "#multifn[{}]", m.name);
            }
            HeapObj::Protocol(p) => {
                let _ = write!(out, "#protocol[{}]", p.name);
            }
            HeapObj::ProtocolFn(p) => {
                let _ = write!(out, "#function[{}]", p.name);
            }
            HeapObj::Atom(cell) => {
                out.push_str("#atom[");
                self.write_value(cell.value, readable, depth + 1, out)?;
                out.push(']');
            }
            HeapObj::Volatile(v) => {
                out.push_str("#volatile[");
                self.write_value(v, readable, depth + 1, out)?;
                out.push(']');
            }
            HeapObj::Delay(d) => match d.value {
                Some(v) => {
                    out.push_str("#delay[");
                    self.write_value(v, readable, depth + 1, out)?;
                    out.push(']');
                }
                None => out.push_str("#delay[pending]"),
            },
            HeapObj::Promise(p) => match p {
                Some(v) => {
                    out.push_str("#promise[");
                    self.write_value(v, readable, depth + 1, out)?;
                    out.push(']');
                }
                None => out.push_str("#promise[pending]"),
            },
            HeapObj::Reduced(v) => {
                out.push_str("#reduced[");
                self.write_value(v, readable, depth + 1, out)?;
                out.push(']');
            }
            HeapObj::Transient(_) => out.push_str("#transient[]"),
            HeapObj::Lazy(_) => {
                // force the whole spine, accumulating heads on the
                // temp-root stack so they survive any collection a
                // user thunk triggers
                let mark = self.protect(&[Value::Obj(r)]);
                loop {
                    let cursor = self.recall(mark, 0);
                    match lazy::seq_next(self, cursor)? {
                        Some((head, tail)) => {
                            self.temps[mark] = tail;
                            self.temps.push(head);
                        }
                        None => break,
                    }
                }
                let items: Vec<Value> = self.temps[mark + 1..].to_vec();
                self.unprotect(mark);
                self.write_seq(&items, "(", ")", readable, depth, out)?;
            }
        }
        Ok(())
    }

    fn write_seq(
        &mut self,
        items: &[Value],
        open: &str,
        close: &str,
        readable: bool,
        depth: usize,
        out: &mut String,
    ) -> Result<(), Error> {
        out.push_str(open);
        for (i, item) in items.iter().enumerate() {
            if i > 0 {
                out.push(' ');
            }
            self.write_value(*item, readable, depth + 1, out)?;
        }
        out.push_str(close);
        Ok(())
    }

    /// Writes to the configured output sink.
    pub fn write_out(&mut self, text: &str) {
        match &mut self.out {
            Output::Stdout => print!("{}", text),
            Output::Capture(buffer) => buffer.push_str(text),
        }
    }
}
