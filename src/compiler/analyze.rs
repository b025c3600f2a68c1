//! The analyzer: lowers [`Form`]s to [`Node`]s. This is where
//! macro expansion runs (to a fixed point, with a depth limit),
//! special forms are recognized, symbols resolve against the
//! lexical scope stack and then the namespaces, destructuring is
//! rewritten away, and closure captures are counted.
//!
//! Scope model: one `FnScope` per enclosing function. A nested
//! `fn*` starts its scope as a copy of every local visible at
//! that point - that prefix *is* the closure environment, and its
//! length is the `capture_count` both back ends consume. Slot
//! indices therefore agree between a function and every function
//! nested inside it.

use std::{cell::RefCell, rc::Rc};

use log::debug;

use crate::{
    common::{
        error::{Error, ErrorKind},
        form::{Form, Name},
        node::{Catch, ConstId, ConstPool, FnArity, FnDef, Node, NodeKind},
        span::{Span, Spanned},
    },
    compiler::destructure,
    runtime::{
        env::VarRef,
        rt::Rt,
        value::{HeapObj, Value},
    },
};

/// A function's lexical scope: every visible local, by slot.
struct FnScope {
    locals: Vec<String>,
    capture_count: usize,
    /// `(slot_start, count)` of the innermost recur target.
    recur: Option<(usize, usize)>,
}

/// The result of analyzing one top-level form: the node tree and
/// the constant pool it references. Functions defined inside the
/// form share the pool and keep it alive.
#[derive(Debug)]
pub struct Analysis {
    pub node: Node,
    pub pool: ConstPool,
}

pub struct Analyzer {
    scopes: Vec<FnScope>,
    pool: ConstPool,
    expand_depth: usize,
    /// Whether the current position's stack depth equals the
    /// local count. Binding forms rely on "the value I just
    /// evaluated *is* the local slot", which only holds when no
    /// expression temporaries sit underneath - a call argument,
    /// a collection element. In an unclean position, `let*`,
    /// `loop*`, `letfn*`, and `try` are wrapped in an
    /// immediately-invoked thunk, whose fresh frame is clean by
    /// construction.
    stack_clean: bool,
}

impl Analyzer {
    /// Analyzes one top-level form.
    pub fn analyze(rt: &mut Rt, form: Spanned<Form>) -> Result<Analysis, Error> {
        let mut analyzer = Analyzer {
            scopes: vec![FnScope {
                locals: vec![],
                capture_count: 0,
                recur: None,
            }],
            pool: Rc::new(RefCell::new(vec![])),
            expand_depth: 0,
            stack_clean: true,
        };
        // the pool must be visible to the collector while macros
        // run during analysis
        rt.active_pools.push(analyzer.pool.clone());
        let node = analyzer.form(rt, form, false);
        rt.active_pools.pop();
        let node = node?;
        debug!("analyzed into {:?} node", std::mem::discriminant(&node.kind));
        Ok(Analysis {
            node,
            pool: analyzer.pool,
        })
    }

    fn scope(&mut self) -> &mut FnScope {
        self.scopes.last_mut().unwrap()
    }

    fn locals_len(&self) -> usize {
        self.scopes.last().unwrap().locals.len()
    }

    /// Adds a value to the pool, returning its constant node.
    fn constant(&mut self, value: Value, span: &Span) -> Node {
        let mut pool = self.pool.borrow_mut();
        let id = ConstId(pool.len() as u32);
        pool.push(value);
        drop(pool);
        Node::new(NodeKind::Const(id), span)
    }

    // -- macro expansion ------------------------------------------

    /// Expands macro calls at the head of `form` until a fixed
    /// point. Locals shadow macros. `expand_depth` accumulates
    /// over the whole top-level form, so a macro that regrows
    /// itself through nested forms still hits the limit.
    fn macroexpand(&mut self, rt: &mut Rt, mut form: Spanned<Form>) -> Result<Spanned<Form>, Error> {
        let limit = rt.expand_limit;

        loop {
            let head = match form.item.head_sym() {
                Some(name) => name.clone(),
                None => return Ok(form),
            };

            // a lexical binding shadows any macro of the same name
            if head.ns.is_none() && self.resolve_local(&head.name).is_some() {
                return Ok(form);
            }

            let var = match rt.env.resolve(rt.env.current, head.ns.as_deref(), &head.name) {
                Some(var) if rt.env.var(var).macro_flag && rt.env.var(var).bound => var,
                _ => return Ok(form),
            };

            self.expand_depth += 1;
            if self.expand_depth > limit {
                return Err(Error::macroexpand(
                    ErrorKind::MacroError,
                    &format!("macro expansion of {} exceeded depth limit", head),
                    &form.span,
                ));
            }

            let span = form.span.clone();
            let items = match form.item {
                Form::List(items) => items,
                _ => unreachable!("macro call on a non-list"),
            };

            // arguments cross into the macro as values
            let mark = rt.protect(&[]);
            for arg in items[1..].iter() {
                match form_to_value(rt, arg) {
                    Ok(v) => rt.temps.push(v),
                    Err(e) => {
                        rt.unprotect(mark);
                        return Err(e);
                    }
                }
            }
            let args: Vec<Value> = rt.temps[mark..].to_vec();
            rt.unprotect(mark);

            let macro_fn = rt.env.deref_var(var);
            let expanded = rt.call(macro_fn, &args).map_err(|e| {
                Error::macroexpand(
                    ErrorKind::MacroError,
                    &format!("macro {} failed during expansion", head),
                    &span,
                )
                .with_cause(e)
            })?;

            form = value_to_form(rt, expanded, &span)?;
        }
    }

    // -- the main dispatch ----------------------------------------

    fn form(&mut self, rt: &mut Rt, form: Spanned<Form>, tail: bool) -> Result<Node, Error> {
        let form = self.macroexpand(rt, form)?;
        let span = form.span.clone();

        match form.item {
            Form::Nil => Ok(self.constant(Value::Nil, &span)),
            Form::Bool(b) => Ok(self.constant(Value::Bool(b), &span)),
            Form::Int(n) => Ok(self.constant(Value::Int(n), &span)),
            Form::Float(n) => Ok(self.constant(Value::Float(n), &span)),
            Form::Char(c) => Ok(self.constant(Value::Char(c), &span)),
            Form::Str(s) => {
                let v = rt.str_value(&s);
                Ok(self.constant(v, &span))
            }
            Form::Regex(s) => {
                let v = rt.alloc(HeapObj::Regex(s));
                Ok(self.constant(v, &span))
            }
            Form::Keyword(name) => {
                let v = rt.keyword_value(name.ns.as_deref(), &name.name);
                Ok(self.constant(v, &span))
            }
            Form::Sym(name) => self.symbol(rt, &name, &span),
            Form::Tagged(tag, _) => Err(Error::analysis(
                ErrorKind::InvalidToken,
                &format!("no handler installed for tagged literal #{}", tag),
                &span,
            )),

            Form::Vector(items) => {
                let saved = std::mem::replace(&mut self.stack_clean, false);
                let nodes = items
                    .into_iter()
                    .map(|item| self.form(rt, item, false))
                    .collect::<Result<Vec<_>, _>>();
                self.stack_clean = saved;
                Ok(Node::new(NodeKind::Vector(nodes?), &span))
            }

            Form::Map(items) => {
                self.check_literal_duplicates(rt, &items, &span, "key", "map")?;
                let saved = std::mem::replace(&mut self.stack_clean, false);
                let mut pairs = vec![];
                for pair in items.chunks(2) {
                    let outcome = self.form(rt, pair[0].clone(), false).and_then(|k| {
                        let v = self.form(rt, pair[1].clone(), false)?;
                        Ok((k, v))
                    });
                    match outcome {
                        Ok(pair) => pairs.push(pair),
                        Err(e) => {
                            self.stack_clean = saved;
                            return Err(e);
                        }
                    }
                }
                self.stack_clean = saved;
                Ok(Node::new(NodeKind::MapLit(pairs), &span))
            }

            Form::Set(items) => {
                self.check_literal_duplicates(rt, &items, &span, "element", "set")?;
                let saved = std::mem::replace(&mut self.stack_clean, false);
                let nodes = items
                    .into_iter()
                    .map(|item| self.form(rt, item, false))
                    .collect::<Result<Vec<_>, _>>();
                self.stack_clean = saved;
                Ok(Node::new(NodeKind::SetLit(nodes?), &span))
            }

            Form::List(items) => {
                if items.is_empty() {
                    let v = rt.list_value(vec![]);
                    return Ok(self.constant(v, &span));
                }
                self.list(rt, items, span, tail)
            }
        }
    }

    /// Literal duplicate detection for map and set literals,
    /// over the constant-comparable elements.
    fn check_literal_duplicates(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        what: &str,
        of: &str,
    ) -> Result<(), Error> {
        let keys: Vec<&Spanned<Form>> = if of == "map" {
            items.iter().step_by(2).collect()
        } else {
            items.iter().collect()
        };
        for (i, a) in keys.iter().enumerate() {
            if !literal_comparable(&a.item) {
                continue;
            }
            for b in keys[i + 1..].iter() {
                if a.item == b.item {
                    return Err(Error::analysis(
                        ErrorKind::DuplicateKey,
                        &format!("duplicate {} {} in {} literal", what, a.item, of),
                        span,
                    ));
                }
            }
        }
        let _ = rt;
        Ok(())
    }

    // -- symbols --------------------------------------------------

    /// Innermost-scope lookup; the innermost scope already holds
    /// every visible ancestor local, so one scope suffices.
    fn resolve_local(&self, name: &str) -> Option<usize> {
        let scope = self.scopes.last().unwrap();
        scope.locals.iter().rposition(|local| local == name)
    }

    fn symbol(&mut self, rt: &mut Rt, name: &Name, span: &Span) -> Result<Node, Error> {
        if name.ns.is_none() {
            if let Some(slot) = self.resolve_local(&name.name) {
                return Ok(Node::new(NodeKind::Local(slot), span));
            }
        }

        match rt.env.resolve(rt.env.current, name.ns.as_deref(), &name.name) {
            Some(var) => Ok(Node::new(NodeKind::Var(var), span)),
            None => {
                let mut message = format!("undefined symbol `{}`", name);
                if let Some(suggestion) = self.suggest(rt, &name.name) {
                    message.push_str(&format!(" - did you mean `{}`?", suggestion));
                }
                Err(Error::analysis(ErrorKind::UndefinedSymbol, &message, span))
            }
        }
    }

    /// The closest in-scope name within edit distance 2.
    fn suggest(&self, rt: &Rt, name: &str) -> Option<String> {
        let mut best: Option<(usize, String)> = None;
        let mut consider = |candidate: &str| {
            let distance = edit_distance(name, candidate);
            if distance > 0 && distance <= 2 {
                match &best {
                    Some((d, _)) if *d <= distance => {}
                    _ => best = Some((distance, candidate.to_string())),
                }
            }
        };

        for local in self.scopes.last().unwrap().locals.iter() {
            consider(local);
        }
        let here = rt.env.ns(rt.env.current);
        for candidate in here.mappings.keys().chain(here.refers.keys()) {
            consider(candidate);
        }
        for candidate in rt.env.ns(rt.env.core_ns()).mappings.keys() {
            consider(candidate);
        }

        best.map(|(_, name)| name)
    }

    // -- lists: special forms and calls ---------------------------

    fn list(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: Span,
        tail: bool,
    ) -> Result<Node, Error> {
        let head = items[0].item.clone();
        if let Form::Sym(name) = &head {
            // special forms go by name, unqualified or core-qualified,
            // unless a local shadows them
            let special = name.ns.is_none()
                || name.ns.as_deref() == Some(crate::runtime::env::CORE_NS);
            let shadowed = name.ns.is_none() && self.resolve_local(&name.name).is_some();
            if special && !shadowed {
                match name.name.as_str() {
                    "quote" => return self.quote(rt, &items, &span),
                    "if" => return self.if_form(rt, &items, &span, tail),
                    "do" => return self.do_form(rt, items, &span, tail),
                    "let*" if !self.stack_clean => return self.thunk_wrap(rt, items, &span),
                    "loop*" if !self.stack_clean => return self.thunk_wrap(rt, items, &span),
                    "letfn*" if !self.stack_clean => return self.thunk_wrap(rt, items, &span),
                    "let*" => return self.let_star(rt, &items, &span, tail, false),
                    "loop*" => return self.let_star(rt, &items, &span, tail, true),
                    "recur" => return self.recur(rt, &items, &span, tail),
                    "fn*" => return self.fn_star(rt, &items, &span, false),
                    "def" => return self.def(rt, &items, &span, false),
                    "defonce" => return self.def(rt, &items, &span, true),
                    "var" => return self.var_quote(rt, &items, &span),
                    "throw" => return self.throw(rt, &items, &span),
                    // `try` runs in its own zero-argument function
                    // so both back ends see it at a clean frame
                    // position - the catch slot lands exactly where
                    // the analyzer said it would
                    "try" => {
                        let mut inner = vec![Form::sym("try*").spanned(&span)];
                        inner.extend(items[1..].iter().cloned());
                        let thunk = Form::List(vec![
                            Form::sym("fn*").spanned(&span),
                            Form::Vector(vec![]).spanned(&span),
                            Form::List(inner).spanned(&span),
                        ]);
                        let call = Form::List(vec![thunk.spanned(&span)]);
                        return self.form(rt, call.spanned(&span), false);
                    }
                    "try*" => return self.try_form(rt, &items, &span),
                    "set!" => return self.set_bang(rt, &items, &span),
                    "letfn*" => return self.letfn_star(rt, &items, &span, tail),
                    "let" => return self.sugar_let(rt, items, &span, tail, "let*"),
                    "loop" => return self.sugar_loop(rt, items, &span, tail),
                    "fn" => return self.sugar_fn(rt, items, &span),
                    "letfn" => return self.sugar_letfn(rt, items, &span, tail),
                    "defn" => return self.sugar_defn(rt, items, &span, false),
                    "defmacro" => return self.sugar_defn(rt, items, &span, true),
                    "declare" => return self.declare(rt, &items, &span),
                    "comment" => return Ok(self.constant(Value::Nil, &span)),
                    "ns" => return self.ns_form(rt, &items, &span),
                    "unquote" | "unquote-splicing" => {
                        return Err(Error::analysis(
                            ErrorKind::InvalidToken,
                            &format!("{} is only valid inside a syntax quote", name.name),
                            &span,
                        ))
                    }
                    "." => {
                        return Err(Error::analysis(
                            ErrorKind::InvalidToken,
                            "host interop is not available in this runtime",
                            &span,
                        ))
                    }
                    _ => {}
                }
            }
        }

        // a general call: the callee runs at the local baseline,
        // but arguments sit on top of it
        let mut items = items.into_iter();
        let f = self.form(rt, items.next().unwrap(), false)?;
        let saved = std::mem::replace(&mut self.stack_clean, false);
        let args = items
            .map(|item| self.form(rt, item, false))
            .collect::<Result<Vec<_>, _>>();
        self.stack_clean = saved;
        Ok(Node::new(
            NodeKind::Call {
                f: Box::new(f),
                args: args?,
            },
            &span,
        ))
    }

    /// Rewrites a binding form in an unclean stack position into
    /// `((fn* [] form))`.
    fn thunk_wrap(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: &Span,
    ) -> Result<Node, Error> {
        let thunk = Form::List(vec![
            Form::sym("fn*").spanned(span),
            Form::Vector(vec![]).spanned(span),
            Form::List(items).spanned(span),
        ]);
        let call = Form::List(vec![thunk.spanned(span)]);
        self.form(rt, call.spanned(span), false)
    }

    fn quote(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        if items.len() != 2 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "quote takes exactly one form",
                span,
            ));
        }
        // (quote ()) canonicalizes to nil
        if let Form::List(inner) = &items[1].item {
            if inner.is_empty() {
                return Ok(self.constant(Value::Nil, span));
            }
        }
        let value = form_to_value(rt, &items[1])?;
        Ok(self.constant(value, span))
    }

    fn if_form(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        tail: bool,
    ) -> Result<Node, Error> {
        if items.len() < 3 || items.len() > 4 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "if takes a condition, a then-branch, and an optional else-branch",
                span,
            ));
        }
        let cond = self.form(rt, items[1].clone(), false)?;
        let then = self.form(rt, items[2].clone(), tail)?;
        let els = match items.get(3) {
            Some(form) => self.form(rt, form.clone(), tail)?,
            None => self.constant(Value::Nil, span),
        };
        Ok(Node::new(
            NodeKind::If {
                cond: Box::new(cond),
                then: Box::new(then),
                els: Box::new(els),
            },
            span,
        ))
    }

    fn do_form(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: &Span,
        tail: bool,
    ) -> Result<Node, Error> {
        let body = self.body(rt, &items[1..], tail)?;
        Ok(Node::new(NodeKind::Do(body), span))
    }

    /// A body: every expression but the last in non-tail position.
    fn body(&mut self, rt: &mut Rt, forms: &[Spanned<Form>], tail: bool) -> Result<Vec<Node>, Error> {
        let mut nodes = vec![];
        for (i, form) in forms.iter().enumerate() {
            let last = i + 1 == forms.len();
            nodes.push(self.form(rt, form.clone(), tail && last)?);
        }
        Ok(nodes)
    }

    /// `let*` and `loop*`: simple-symbol bindings only (surface
    /// `let`/`loop` rewrote destructuring away already).
    fn let_star(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        tail: bool,
        looping: bool,
    ) -> Result<Node, Error> {
        let pairs = match items.get(1) {
            Some(Spanned {
                item: Form::Vector(pairs),
                ..
            }) if pairs.len() % 2 == 0 => pairs.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    "expected a binding vector with an even number of forms",
                    span,
                ))
            }
        };

        let scope_len = self.locals_len();
        let mut bindings = vec![];
        for pair in pairs.chunks(2) {
            let name = match &pair[0].item {
                Form::Sym(n) if n.ns.is_none() => n.name.clone(),
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidBinding,
                        &format!("`{}` is not a valid binding symbol", other),
                        &pair[0].span,
                    ))
                }
            };
            let init = self.form(rt, pair[1].clone(), false)?;
            let slot = self.locals_len();
            self.scope().locals.push(name);
            bindings.push((slot, init));
        }

        let node = if looping {
            let slot_start = scope_len;
            let count = bindings.len();
            let saved = self.scope().recur.replace((slot_start, count));
            let body = self.body(rt, &items[2..], true);
            self.scope().recur = saved;
            Node::new(
                NodeKind::Loop {
                    bindings,
                    body: body?,
                },
                span,
            )
        } else {
            let body = self.body(rt, &items[2..], tail)?;
            Node::new(NodeKind::Let { bindings, body }, span)
        };

        self.scope().locals.truncate(scope_len);
        Ok(node)
    }

    fn recur(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        tail: bool,
    ) -> Result<Node, Error> {
        if !tail {
            return Err(Error::analysis(
                ErrorKind::InvalidRecur,
                "recur is only allowed in tail position",
                span,
            ));
        }
        let (slot_start, count) = match self.scopes.last().unwrap().recur {
            Some(target) => target,
            None => {
                return Err(Error::analysis(
                    ErrorKind::InvalidRecur,
                    "recur needs an enclosing loop or fn",
                    span,
                ))
            }
        };
        if items.len() - 1 != count {
            return Err(Error::analysis(
                ErrorKind::InvalidRecur,
                &format!(
                    "recur expects {} argument{}, got {}",
                    count,
                    if count == 1 { "" } else { "s" },
                    items.len() - 1
                ),
                span,
            ));
        }
        let saved = std::mem::replace(&mut self.stack_clean, false);
        let args = items[1..]
            .iter()
            .map(|item| self.form(rt, item.clone(), false))
            .collect::<Result<Vec<_>, _>>();
        self.stack_clean = saved;
        Ok(Node::new(
            NodeKind::Recur {
                args: args?,
                slot_start,
            },
            span,
        ))
    }

    /// `fn*`: `(fn* name? [params] body...)` or
    /// `(fn* name? ([params] body...)+)`.
    fn fn_star(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        in_letfn: bool,
    ) -> Result<Node, Error> {
        let mut at = 1;
        let name = match items.get(at) {
            Some(Spanned {
                item: Form::Sym(n), ..
            }) if n.ns.is_none() => {
                at += 1;
                Some(n.name.clone())
            }
            _ => None,
        };

        // normalize to a list of ([params] body...) clauses
        let clauses: Vec<&[Spanned<Form>]> = match items.get(at) {
            Some(Spanned {
                item: Form::Vector(_),
                ..
            }) => vec![&items[at..]],
            Some(Spanned {
                item: Form::List(_),
                ..
            }) => {
                let mut clauses = vec![];
                for clause in items[at..].iter() {
                    match &clause.item {
                        Form::List(inner) => clauses.push(&inner[..]),
                        _ => {
                            return Err(Error::analysis(
                                ErrorKind::InvalidArity,
                                "fn* arity clauses must be lists",
                                &clause.span,
                            ))
                        }
                    }
                }
                clauses
            }
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidArity,
                    "fn* needs a parameter vector",
                    span,
                ))
            }
        };

        // the new scope captures everything visible right now
        let outer_locals = self.scopes.last().unwrap().locals.clone();
        let capture_count = outer_locals.len();
        let self_slot = match (&name, in_letfn) {
            (Some(_), false) => Some(capture_count),
            _ => None,
        };

        self.scopes.push(FnScope {
            locals: outer_locals,
            capture_count,
            recur: None,
        });
        if let (Some(name), Some(_)) = (&name, self_slot) {
            self.scope().locals.push(name.clone());
        }
        let prefix_len = self.locals_len();
        // a fresh frame starts with no expression temporaries
        let clean_saved = std::mem::replace(&mut self.stack_clean, true);

        let mut arities: Vec<FnArity> = vec![];
        let result = (|| {
            for clause in clauses {
                let params_form = match clause.first() {
                    Some(Spanned {
                        item: Form::Vector(params),
                        ..
                    }) => params.clone(),
                    _ => {
                        return Err(Error::analysis(
                            ErrorKind::InvalidArity,
                            "fn* needs a parameter vector",
                            span,
                        ))
                    }
                };

                self.scope().locals.truncate(prefix_len);
                let mut params = 0usize;
                let mut variadic = false;
                let mut i = 0;
                while i < params_form.len() {
                    match &params_form[i].item {
                        Form::Sym(n) if n.ns.is_none() && n.name == "&" => {
                            let rest = params_form.get(i + 1).and_then(|p| match &p.item {
                                Form::Sym(n) if n.ns.is_none() => Some(n.name.clone()),
                                _ => None,
                            });
                            match rest {
                                Some(rest) => {
                                    variadic = true;
                                    self.scope().locals.push(rest);
                                    i += 2;
                                }
                                None => {
                                    return Err(Error::analysis(
                                        ErrorKind::InvalidBinding,
                                        "`&` needs a rest parameter symbol",
                                        &params_form[i].span,
                                    ))
                                }
                            }
                        }
                        Form::Sym(n) if n.ns.is_none() => {
                            if variadic {
                                return Err(Error::analysis(
                                    ErrorKind::InvalidBinding,
                                    "no parameters may follow the rest parameter",
                                    &params_form[i].span,
                                ));
                            }
                            params += 1;
                            self.scope().locals.push(n.name.clone());
                            i += 1;
                        }
                        other => {
                            return Err(Error::analysis(
                                ErrorKind::InvalidBinding,
                                &format!("`{}` is not a valid fn* parameter", other),
                                &params_form[i].span,
                            ))
                        }
                    }
                }

                if arities
                    .iter()
                    .any(|a| a.params == params && a.variadic == variadic)
                {
                    return Err(Error::analysis(
                        ErrorKind::InvalidArity,
                        "two arities with the same parameter count",
                        span,
                    ));
                }

                let recur_count = params + variadic as usize;
                self.scope().recur = Some((prefix_len, recur_count));
                let body = self.body(rt, &clause[1..], true)?;
                arities.push(FnArity {
                    params,
                    variadic,
                    body,
                });
            }
            Ok(())
        })();

        self.stack_clean = clean_saved;
        self.scopes.pop();
        result?;

        let def = Rc::new(FnDef {
            name,
            self_slot,
            capture_count,
            arities,
            consts: self.pool.clone(),
            span: span.clone(),
        });
        Ok(Node::new(NodeKind::Fn(def), span))
    }

    /// `letfn*`: `(letfn* [name (fn* ...) ...] body...)`.
    fn letfn_star(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        tail: bool,
    ) -> Result<Node, Error> {
        let pairs = match items.get(1) {
            Some(Spanned {
                item: Form::Vector(pairs),
                ..
            }) if pairs.len() % 2 == 0 => pairs.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    "letfn* expects a vector of name/fn pairs",
                    span,
                ))
            }
        };

        let scope_len = self.locals_len();
        let slot_start = scope_len;

        // all names visible in all bodies
        let mut names = vec![];
        for pair in pairs.chunks(2) {
            match &pair[0].item {
                Form::Sym(n) if n.ns.is_none() => names.push(n.name.clone()),
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidBinding,
                        &format!("`{}` is not a valid letfn* name", other),
                        &pair[0].span,
                    ))
                }
            }
        }
        for name in names.iter() {
            self.scope().locals.push(name.clone());
        }

        let mut bindings = vec![];
        let result = (|| {
            for (i, pair) in pairs.chunks(2).enumerate() {
                let fn_items = match &pair[1].item {
                    Form::List(fn_items)
                        if fn_items.first().map_or(false, |h| h.item.is_sym("fn*")) =>
                    {
                        fn_items.clone()
                    }
                    other => {
                        return Err(Error::analysis(
                            ErrorKind::InvalidBinding,
                            &format!("`{}` is not a fn* form", other),
                            &pair[1].span,
                        ))
                    }
                };
                // a letfn-bound fn does not re-add its own name
                let node = self.fn_star(rt, &fn_items, &pair[1].span, true)?;
                let def = match node.kind {
                    NodeKind::Fn(def) => def,
                    _ => unreachable!(),
                };
                bindings.push((slot_start + i, def));
            }
            self.body(rt, &items[2..], tail)
        })();

        self.scope().locals.truncate(scope_len);
        let body = result?;

        Ok(Node::new(
            NodeKind::LetFn {
                slot_start,
                bindings,
                body,
            },
            span,
        ))
    }

    fn def(
        &mut self,
        rt: &mut Rt,
        items: &[Spanned<Form>],
        span: &Span,
        once: bool,
    ) -> Result<Node, Error> {
        if items.len() < 2 || items.len() > 4 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "def takes a name, an optional doc string, and an optional init",
                span,
            ));
        }

        let (name, meta) = def_name(&items[1])?;
        let ns = rt.env.current;
        let var = rt.env.intern(ns, &name.name);
        self.apply_var_meta(rt, var, &meta)?;

        let init_form = match items.len() {
            2 => None,
            3 => Some(items[2].clone()),
            _ => {
                // (def name "doc" init)
                if !matches!(items[2].item, Form::Str(_)) {
                    return Err(Error::analysis(
                        ErrorKind::InvalidArity,
                        "a three-argument def expects a doc string",
                        &items[2].span,
                    ));
                }
                Some(items[3].clone())
            }
        };

        let init = match init_form {
            Some(form) => Some(Box::new(self.form(rt, form, false)?)),
            None => None,
        };

        Ok(Node::new(NodeKind::Def { var, init, once }, span))
    }

    /// Reads `^:dynamic` / `^:macro` metadata into var flags.
    fn apply_var_meta(
        &mut self,
        rt: &mut Rt,
        var: VarRef,
        meta: &Option<Spanned<Form>>,
    ) -> Result<(), Error> {
        if let Some(meta) = meta {
            if let Form::Map(entries) = &meta.item {
                for pair in entries.chunks(2) {
                    if let (Form::Keyword(key), Form::Bool(true)) = (&pair[0].item, &pair[1].item) {
                        match key.name.as_str() {
                            "dynamic" => rt.env.var_mut(var).dynamic = true,
                            "macro" => rt.env.var_mut(var).macro_flag = true,
                            _ => {}
                        }
                    }
                }
                let value = form_to_value(rt, meta)?;
                rt.env.var_mut(var).meta = value;
            }
        }
        Ok(())
    }

    fn var_quote(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        if items.len() != 2 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "var takes exactly one symbol",
                span,
            ));
        }
        let name = match &items[1].item {
            Form::Sym(name) => name.clone(),
            other => {
                return Err(Error::analysis(
                    ErrorKind::InvalidArity,
                    &format!("var expects a symbol, got `{}`", other),
                    &items[1].span,
                ))
            }
        };
        match rt.env.resolve(rt.env.current, name.ns.as_deref(), &name.name) {
            Some(var) => Ok(Node::new(NodeKind::VarQuote(var), span)),
            None => Err(Error::analysis(
                ErrorKind::UndefinedSymbol,
                &format!("undefined symbol `{}`", name),
                span,
            )),
        }
    }

    fn throw(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        if items.len() != 2 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "throw takes exactly one value",
                span,
            ));
        }
        let value = self.form(rt, items[1].clone(), false)?;
        Ok(Node::new(NodeKind::Throw(Box::new(value)), span))
    }

    /// `(try body... (catch Class name body...)? (finally body...)?)`
    fn try_form(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        let mut body_forms = vec![];
        let mut catch = None;
        let mut finally = None;

        for item in items[1..].iter() {
            let head = item.item.head_sym().map(|n| n.name.clone());
            match head.as_deref() {
                Some("catch") => {
                    if catch.is_some() {
                        return Err(Error::analysis(
                            ErrorKind::InvalidArity,
                            "only one catch clause is supported",
                            &item.span,
                        ));
                    }
                    if finally.is_some() {
                        return Err(Error::analysis(
                            ErrorKind::InvalidArity,
                            "catch must come before finally",
                            &item.span,
                        ));
                    }
                    catch = Some(self.catch_clause(rt, item)?);
                }
                Some("finally") => {
                    if finally.is_some() {
                        return Err(Error::analysis(
                            ErrorKind::InvalidArity,
                            "only one finally clause is supported",
                            &item.span,
                        ));
                    }
                    let inner = match &item.item {
                        Form::List(inner) => inner,
                        _ => unreachable!(),
                    };
                    // finally code runs on top of the in-flight
                    // result, so binding forms inside it must not
                    // assume a clean stack
                    let saved = std::mem::replace(&mut self.stack_clean, false);
                    let analyzed = self.body(rt, &inner[1..], false);
                    self.stack_clean = saved;
                    finally = Some(analyzed?);
                }
                _ => {
                    if catch.is_some() || finally.is_some() {
                        return Err(Error::analysis(
                            ErrorKind::InvalidArity,
                            "try body forms must come before catch and finally",
                            &item.span,
                        ));
                    }
                    body_forms.push(item.clone());
                }
            }
        }

        let body = self.body(rt, &body_forms, false)?;
        Ok(Node::new(
            NodeKind::Try {
                body,
                catch,
                finally,
            },
            span,
        ))
    }

    fn catch_clause(&mut self, rt: &mut Rt, form: &Spanned<Form>) -> Result<Catch, Error> {
        let items = match &form.item {
            Form::List(items) => items,
            _ => unreachable!(),
        };
        if items.len() < 3 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "catch takes a class, a binding symbol, and a body",
                &form.span,
            ));
        }
        let class = match &items[1].item {
            Form::Sym(name) if name.name == "_" => None,
            Form::Sym(name) => Some(name.name.clone()),
            Form::Keyword(name) if name.name == "default" => None,
            other => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    &format!("`{}` is not a catch class", other),
                    &items[1].span,
                ))
            }
        };
        let binding = match &items[2].item {
            Form::Sym(name) if name.ns.is_none() => name.name.clone(),
            other => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    &format!("`{}` is not a valid catch binding", other),
                    &items[2].span,
                ))
            }
        };

        let slot = self.locals_len();
        self.scope().locals.push(binding);
        let body = self.body(rt, &items[3..], false);
        self.scope().locals.truncate(slot);

        Ok(Catch {
            class,
            slot,
            body: body?,
        })
    }

    fn set_bang(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        if items.len() != 3 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "set! takes a var symbol and a value",
                span,
            ));
        }
        let name = match &items[1].item {
            Form::Sym(name) => name.clone(),
            other => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    &format!("set! expects a symbol, got `{}`", other),
                    &items[1].span,
                ))
            }
        };
        let var = rt
            .env
            .resolve(rt.env.current, name.ns.as_deref(), &name.name)
            .ok_or_else(|| {
                Error::analysis(
                    ErrorKind::UndefinedSymbol,
                    &format!("undefined symbol `{}`", name),
                    span,
                )
            })?;
        let expr = self.form(rt, items[2].clone(), false)?;
        Ok(Node::new(
            NodeKind::Set {
                var,
                expr: Box::new(expr),
            },
            span,
        ))
    }

    fn declare(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        let mut defs = vec![];
        for item in items[1..].iter() {
            let name = match &item.item {
                Form::Sym(name) if name.ns.is_none() => &name.name,
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidBinding,
                        &format!("declare expects symbols, got `{}`", other),
                        &item.span,
                    ))
                }
            };
            let ns = rt.env.current;
            let var = rt.env.intern(ns, name);
            defs.push(Node::new(
                NodeKind::Def {
                    var,
                    init: None,
                    once: false,
                },
                &item.span,
            ));
        }
        Ok(Node::new(NodeKind::Do(defs), span))
    }

    /// `(ns name (:require [other :as o :refer [x]])...)`:
    /// creates and enters the namespace at analysis time, so the
    /// rest of the file reads in it.
    fn ns_form(&mut self, rt: &mut Rt, items: &[Spanned<Form>], span: &Span) -> Result<Node, Error> {
        let name = match items.get(1) {
            Some(Spanned {
                item: Form::Sym(name),
                ..
            }) if name.ns.is_none() => name.name.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidArity,
                    "ns expects a symbol name",
                    span,
                ))
            }
        };

        let ns = rt.env.create_ns(&name);
        rt.env.current = ns;

        for clause in items[2..].iter() {
            let inner = match &clause.item {
                Form::List(inner) if !inner.is_empty() => inner,
                _ => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidArity,
                        "ns clauses are lists like (:require ...)",
                        &clause.span,
                    ))
                }
            };
            match &inner[0].item {
                Form::Keyword(key) if key.name == "require" => {
                    for spec in inner[1..].iter() {
                        self.require_spec(rt, spec)?;
                    }
                }
                Form::Keyword(key) if key.name == "refer-clojure" => {
                    // the core namespace is always referred
                }
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidArity,
                        &format!("unsupported ns clause `{}`", other),
                        &inner[0].span,
                    ))
                }
            }
        }

        Ok(self.constant(Value::Nil, span))
    }

    /// One `:require` spec: `other.ns`, or
    /// `[other.ns :as o :refer [x y]]`.
    fn require_spec(&mut self, rt: &mut Rt, spec: &Spanned<Form>) -> Result<(), Error> {
        let (target_name, rest) = match &spec.item {
            Form::Sym(name) if name.ns.is_none() => (name.name.clone(), vec![]),
            Form::Vector(items) if !items.is_empty() => match &items[0].item {
                Form::Sym(name) if name.ns.is_none() => (name.name.clone(), items[1..].to_vec()),
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidArity,
                        &format!("`{}` is not a namespace name", other),
                        &items[0].span,
                    ))
                }
            },
            other => {
                return Err(Error::analysis(
                    ErrorKind::InvalidArity,
                    &format!("`{}` is not a require spec", other),
                    &spec.span,
                ))
            }
        };

        let target = rt.env.find_ns(&target_name).ok_or_else(|| {
            Error::analysis(
                ErrorKind::UndefinedSymbol,
                &format!("namespace {} has not been loaded", target_name),
                &spec.span,
            )
        })?;

        let mut at = 0;
        while at < rest.len() {
            match &rest[at].item {
                Form::Keyword(key) if key.name == "as" => {
                    let alias = match rest.get(at + 1).map(|f| &f.item) {
                        Some(Form::Sym(name)) if name.ns.is_none() => name.name.clone(),
                        _ => {
                            return Err(Error::analysis(
                                ErrorKind::InvalidArity,
                                "`:as` expects a symbol",
                                &rest[at].span,
                            ))
                        }
                    };
                    let current = rt.env.current;
                    rt.env.ns_mut(current).aliases.insert(alias, target);
                    at += 2;
                }
                Form::Keyword(key) if key.name == "refer" => {
                    let symbols = match rest.get(at + 1).map(|f| &f.item) {
                        Some(Form::Vector(symbols)) => symbols.clone(),
                        _ => {
                            return Err(Error::analysis(
                                ErrorKind::InvalidArity,
                                "`:refer` expects a vector of symbols",
                                &rest[at].span,
                            ))
                        }
                    };
                    for symbol in symbols {
                        let sym_name = match &symbol.item {
                            Form::Sym(name) if name.ns.is_none() => name.name.clone(),
                            other => {
                                return Err(Error::analysis(
                                    ErrorKind::InvalidArity,
                                    &format!("`{}` is not a symbol", other),
                                    &symbol.span,
                                ))
                            }
                        };
                        let var =
                            rt.env.ns(target).mappings.get(&sym_name).copied().ok_or_else(|| {
                                Error::analysis(
                                    ErrorKind::UndefinedSymbol,
                                    &format!("{}/{} is not defined", target_name, sym_name),
                                    &symbol.span,
                                )
                            })?;
                        let current = rt.env.current;
                        rt.env.ns_mut(current).refers.insert(sym_name, var);
                    }
                    at += 2;
                }
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidArity,
                        &format!("unsupported require option `{}`", other),
                        &rest[at].span,
                    ))
                }
            }
        }
        Ok(())
    }

    // -- surface sugar --------------------------------------------

    /// `let`/`loop` with destructuring rewrite onto the starred
    /// forms.
    fn sugar_let(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: &Span,
        tail: bool,
        starred: &str,
    ) -> Result<Node, Error> {
        let pairs = match items.get(1) {
            Some(Spanned {
                item: Form::Vector(pairs),
                ..
            }) => pairs.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    "expected a binding vector",
                    span,
                ))
            }
        };
        let flat = destructure::flatten_bindings(rt, &pairs, span)?;
        let mut rebuilt = vec![];
        for (pattern, init) in flat {
            rebuilt.push(pattern);
            rebuilt.push(init);
        }

        let mut starred_items = vec![Form::sym(starred).spanned(span)];
        starred_items.push(Form::Vector(rebuilt).spanned(span));
        starred_items.extend(items[2..].iter().cloned());
        self.form(rt, Form::List(starred_items).spanned(span), tail)
    }

    /// `loop` with destructuring: bind temps as the actual loop
    /// slots (so `recur` targets them), destructure inside.
    fn sugar_loop(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: &Span,
        tail: bool,
    ) -> Result<Node, Error> {
        let pairs = match items.get(1) {
            Some(Spanned {
                item: Form::Vector(pairs),
                ..
            }) if pairs.len() % 2 == 0 => pairs.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    "expected a binding vector with an even number of forms",
                    span,
                ))
            }
        };

        let all_simple = pairs
            .chunks(2)
            .all(|pair| destructure::is_simple(&pair[0].item));
        if all_simple {
            let mut starred = vec![Form::sym("loop*").spanned(span)];
            starred.push(Form::Vector(pairs).spanned(span));
            starred.extend(items[2..].iter().cloned());
            return self.form(rt, Form::List(starred).spanned(span), tail);
        }

        // (loop [pat init] body) =>
        // (loop* [tmp init] (let [pat tmp] body))
        let mut loop_pairs = vec![];
        let mut inner_pairs = vec![];
        for pair in pairs.chunks(2) {
            if destructure::is_simple(&pair[0].item) {
                loop_pairs.push(pair[0].clone());
                loop_pairs.push(pair[1].clone());
            } else {
                let tmp = Form::sym(&rt.gensym("loop")).spanned(&pair[0].span);
                loop_pairs.push(tmp.clone());
                loop_pairs.push(pair[1].clone());
                inner_pairs.push(pair[0].clone());
                inner_pairs.push(tmp);
            }
        }

        let mut inner = vec![Form::sym("let").spanned(span)];
        inner.push(Form::Vector(inner_pairs).spanned(span));
        inner.extend(items[2..].iter().cloned());

        let mut starred = vec![Form::sym("loop*").spanned(span)];
        starred.push(Form::Vector(loop_pairs).spanned(span));
        starred.push(Form::List(inner).spanned(span));
        self.form(rt, Form::List(starred).spanned(span), tail)
    }

    /// `fn` with destructuring: params that aren't simple symbols
    /// become temps destructured in a wrapping `let`.
    fn sugar_fn(&mut self, rt: &mut Rt, items: Vec<Spanned<Form>>, span: &Span) -> Result<Node, Error> {
        let mut at = 1;
        let mut rewritten = vec![Form::sym("fn*").spanned(span)];
        if let Some(Spanned {
            item: Form::Sym(n), ..
        }) = items.get(at)
        {
            if n.ns.is_none() {
                rewritten.push(items[at].clone());
                at += 1;
            }
        }

        match items.get(at).map(|f| &f.item) {
            Some(Form::Vector(_)) => {
                let clause = self.fn_clause(rt, &items[at..], span)?;
                rewritten.extend(clause);
            }
            Some(Form::List(_)) => {
                for clause_form in items[at..].iter() {
                    let inner = match &clause_form.item {
                        Form::List(inner) => inner.clone(),
                        _ => {
                            return Err(Error::analysis(
                                ErrorKind::InvalidArity,
                                "fn arity clauses must be lists",
                                &clause_form.span,
                            ))
                        }
                    };
                    let clause = self.fn_clause(rt, &inner, span)?;
                    rewritten.push(Form::List(clause).spanned(&clause_form.span));
                }
            }
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidArity,
                    "fn needs a parameter vector",
                    span,
                ))
            }
        }

        self.form(rt, Form::List(rewritten).spanned(span), false)
    }

    /// One fn clause `[params] body...`, destructuring rewritten.
    fn fn_clause(
        &mut self,
        rt: &mut Rt,
        clause: &[Spanned<Form>],
        span: &Span,
    ) -> Result<Vec<Spanned<Form>>, Error> {
        let params = match clause.first() {
            Some(Spanned {
                item: Form::Vector(params),
                ..
            }) => params.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidArity,
                    "fn needs a parameter vector",
                    span,
                ))
            }
        };

        let mut simple_params = vec![];
        let mut let_pairs = vec![];
        for param in params {
            match &param.item {
                Form::Sym(n) if n.ns.is_none() => simple_params.push(param),
                _ => {
                    let tmp = Form::sym(&rt.gensym("p")).spanned(&param.span);
                    simple_params.push(tmp.clone());
                    let_pairs.push(param);
                    let_pairs.push(tmp);
                }
            }
        }

        let mut out = vec![Form::Vector(simple_params).spanned(span)];
        if let_pairs.is_empty() {
            out.extend(clause[1..].iter().cloned());
        } else {
            let mut wrapper = vec![Form::sym("let").spanned(span)];
            wrapper.push(Form::Vector(let_pairs).spanned(span));
            wrapper.extend(clause[1..].iter().cloned());
            out.push(Form::List(wrapper).spanned(span));
        }
        Ok(out)
    }

    /// `letfn` surface: `(letfn [(f [x] ...) ...] body)` onto
    /// `letfn*`.
    fn sugar_letfn(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: &Span,
        tail: bool,
    ) -> Result<Node, Error> {
        let specs = match items.get(1) {
            Some(Spanned {
                item: Form::Vector(specs),
                ..
            }) => specs.clone(),
            _ => {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    "letfn expects a vector of (name [params] body...) specs",
                    span,
                ))
            }
        };

        let mut pairs = vec![];
        for spec in specs {
            let inner = match &spec.item {
                Form::List(inner) if inner.len() >= 2 => inner.clone(),
                _ => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidBinding,
                        "each letfn spec is (name [params] body...)",
                        &spec.span,
                    ))
                }
            };
            let name = inner[0].clone();
            if !matches!(&name.item, Form::Sym(n) if n.ns.is_none()) {
                return Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    "each letfn spec starts with a simple symbol",
                    &name.span,
                ));
            }
            let mut fn_form = vec![Form::sym("fn*").spanned(&spec.span), name.clone()];
            fn_form.extend(inner[1..].iter().cloned());
            pairs.push(name);
            pairs.push(Form::List(fn_form).spanned(&spec.span));
        }

        let mut starred = vec![Form::sym("letfn*").spanned(span)];
        starred.push(Form::Vector(pairs).spanned(span));
        starred.extend(items[2..].iter().cloned());
        self.form(rt, Form::List(starred).spanned(span), tail)
    }

    /// `defn` and `defmacro`: `(def name (fn name ...))`, plus
    /// the macro flag for `defmacro`.
    fn sugar_defn(
        &mut self,
        rt: &mut Rt,
        items: Vec<Spanned<Form>>,
        span: &Span,
        is_macro: bool,
    ) -> Result<Node, Error> {
        if items.len() < 3 {
            return Err(Error::analysis(
                ErrorKind::InvalidArity,
                "expected a name and at least one body form",
                span,
            ));
        }

        let name_form = items[1].clone();
        let (name, _) = def_name(&name_form)?;

        // an optional doc string before the params
        let mut at = 2;
        if matches!(items[at].item, Form::Str(_)) && items.len() > at + 1 {
            at += 1;
        }

        let mut fn_form = vec![
            Form::sym("fn").spanned(span),
            Form::sym(&name.name).spanned(&name_form.span),
        ];
        fn_form.extend(items[at..].iter().cloned());

        let def_form = vec![
            Form::sym("def").spanned(span),
            name_form,
            Form::List(fn_form).spanned(span),
        ];
        let node = self.form(rt, Form::List(def_form).spanned(span), false)?;

        if is_macro {
            if let NodeKind::Def { var, .. } = &node.kind {
                rt.env.var_mut(*var).macro_flag = true;
            }
        }
        Ok(node)
    }
}

/// Pulls the symbol (and its metadata map, if the reader wrapped
/// one on) out of a def-name position.
fn def_name(form: &Spanned<Form>) -> Result<(Name, Option<Spanned<Form>>), Error> {
    match &form.item {
        Form::Sym(name) if name.ns.is_none() => Ok((name.clone(), None)),
        Form::List(items)
            if items.len() == 3 && items[0].item.is_sym("with-meta") =>
        {
            match &items[1].item {
                Form::Sym(name) if name.ns.is_none() => {
                    Ok((name.clone(), Some(items[2].clone())))
                }
                other => Err(Error::analysis(
                    ErrorKind::InvalidBinding,
                    &format!("`{}` is not a definable name", other),
                    &items[1].span,
                )),
            }
        }
        other => Err(Error::analysis(
            ErrorKind::InvalidBinding,
            &format!("`{}` is not a definable name", other),
            &form.span,
        )),
    }
}

/// Levenshtein distance, bounded use: suggestions only consider
/// candidates within distance 2, so the quadratic cost stays
/// tiny.
fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, ca) in a.iter().enumerate() {
        let mut previous = row[0];
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous + (ca != cb) as usize;
            previous = row[j + 1];
            row[j + 1] = substitution.min(previous + 1).min(row[j] + 1);
        }
    }
    row[b.len()]
}

/// Can this literal be compared for duplicate detection at
/// analysis time?
fn literal_comparable(form: &Form) -> bool {
    matches!(
        form,
        Form::Nil
            | Form::Bool(_)
            | Form::Int(_)
            | Form::Char(_)
            | Form::Str(_)
            | Form::Keyword(_)
    )
}

/// Copies a form into the value heap: the point where scratch
/// data escapes into GC-managed space (quoted forms, macro
/// arguments).
pub fn form_to_value(rt: &mut Rt, form: &Spanned<Form>) -> Result<Value, Error> {
    let value = match &form.item {
        Form::Nil => Value::Nil,
        Form::Bool(b) => Value::Bool(*b),
        Form::Int(n) => Value::Int(*n),
        Form::Float(n) => Value::Float(*n),
        Form::Char(c) => Value::Char(*c),
        Form::Str(s) => rt.str_value(s),
        Form::Regex(s) => rt.alloc(HeapObj::Regex(s.clone())),
        Form::Sym(name) => rt.sym_value(name.ns.as_deref(), &name.name),
        Form::Keyword(name) => rt.keyword_value(name.ns.as_deref(), &name.name),
        Form::List(items) => {
            let values = items
                .iter()
                .map(|item| form_to_value(rt, item))
                .collect::<Result<Vec<_>, _>>()?;
            rt.list_value(values)
        }
        Form::Vector(items) => {
            let values = items
                .iter()
                .map(|item| form_to_value(rt, item))
                .collect::<Result<Vec<_>, _>>()?;
            rt.vector_value(values)
        }
        Form::Map(items) => {
            let values = items
                .iter()
                .map(|item| form_to_value(rt, item))
                .collect::<Result<Vec<_>, _>>()?;
            let entries = values
                .chunks(2)
                .map(|pair| (pair[0], pair[1]))
                .collect();
            rt.map_value(entries)
        }
        Form::Set(items) => {
            let values = items
                .iter()
                .map(|item| form_to_value(rt, item))
                .collect::<Result<Vec<_>, _>>()?;
            rt.set_value(values)
        }
        Form::Tagged(tag, _) => {
            return Err(Error::analysis(
                ErrorKind::InvalidToken,
                &format!("no handler installed for tagged literal #{}", tag),
                &form.span,
            ))
        }
    };
    Ok(value)
}

/// Converts a run of sibling values, keeping the not-yet-visited
/// ones on the temp-root stack: converting one sibling can force
/// a lazy cell, which can run user code, which can collect.
fn values_to_forms(
    rt: &mut Rt,
    items: &[Value],
    span: &Span,
) -> Result<Vec<Spanned<Form>>, Error> {
    let mark = rt.protect(items);
    let mut forms = vec![];
    for i in 0..items.len() {
        let item = rt.recall(mark, i);
        match value_to_form(rt, item, span) {
            Ok(form) => forms.push(form),
            Err(e) => {
                rt.unprotect(mark);
                return Err(e);
            }
        }
    }
    rt.unprotect(mark);
    Ok(forms)
}

/// Reads a value back as a form, so a macro's return value can
/// be analyzed. Everything gets the macro call-site's span.
pub fn value_to_form(rt: &mut Rt, value: Value, span: &Span) -> Result<Spanned<Form>, Error> {
    let form = match value {
        Value::Nil => Form::Nil,
        Value::Bool(b) => Form::Bool(b),
        Value::Int(n) => Form::Int(n),
        Value::Float(n) => Form::Float(n),
        Value::Char(c) => Form::Char(c),
        Value::Var(var) => {
            let name = rt.env.var(var).name.clone();
            let ns = rt.env.ns(rt.env.var(var).ns).name.clone();
            Form::List(vec![
                Form::sym("var").spanned(span),
                Form::sym_ns(&ns, &name).spanned(span),
            ])
        }
        Value::Obj(r) => match rt.heap.get(r).clone() {
            HeapObj::Str(s) => Form::Str(s),
            HeapObj::Regex(s) => Form::Regex(s),
            HeapObj::Sym { ns, name, .. } => Form::Sym(Name {
                ns,
                name,
            }),
            HeapObj::Keyword { ns, name } => Form::Keyword(Name { ns, name }),
            HeapObj::List { items, .. } => Form::List(values_to_forms(rt, &items, span)?),
            HeapObj::Vector { items, .. } => Form::Vector(values_to_forms(rt, &items, span)?),
            HeapObj::Map { entries, .. } => {
                let mut flat = vec![];
                for (k, v) in entries {
                    flat.push(k);
                    flat.push(v);
                }
                Form::Map(values_to_forms(rt, &flat, span)?)
            }
            HeapObj::Set { items, .. } => Form::Set(values_to_forms(rt, &items, span)?),
            HeapObj::Lazy(_) => {
                // macros often return `(concat ...)` results
                let items = crate::runtime::lazy::to_vec(rt, value, None)?;
                Form::List(values_to_forms(rt, &items, span)?)
            }
            other => {
                return Err(Error::macroexpand(
                    ErrorKind::MacroError,
                    &format!(
                        "a macro returned a {}, which is not syntax",
                        other.tag().name()
                    ),
                    span,
                ))
            }
        },
    };
    Ok(form.spanned(span))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        common::span::Source,
        compiler::{lex::Lexer, read::Reader},
    };

    fn analyze_one(src: &str) -> Result<Analysis, Error> {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let tokens = Lexer::lex(Source::eval(src))?;
        let mut counter = 0;
        let form = {
            let mut reader = Reader::new(&tokens, &rt.env, &mut counter);
            reader.next_form()?.expect("no form to analyze")
        };
        Analyzer::analyze(&mut rt, form)
    }

    fn fn_def(node: &Node) -> Rc<FnDef> {
        match &node.kind {
            NodeKind::Fn(def) => def.clone(),
            other => panic!("expected a fn node, got {:?}", other),
        }
    }

    #[test]
    fn capture_counts_accumulate() {
        // each nesting level captures everything visible so far
        let analysis = analyze_one("(fn* [x] (fn* [y] (fn* [z] [x y z])))").unwrap();
        let outer = fn_def(&analysis.node);
        assert_eq!(outer.capture_count, 0);

        let middle = fn_def(&outer.arities[0].body[0]);
        assert_eq!(middle.capture_count, 1);

        let inner = fn_def(&middle.arities[0].body[0]);
        assert_eq!(inner.capture_count, 2);

        // the innermost body addresses x, y, z by stable slots
        match &inner.arities[0].body[0].kind {
            NodeKind::Vector(items) => {
                let slots: Vec<_> = items
                    .iter()
                    .map(|n| match n.kind {
                        NodeKind::Local(slot) => slot,
                        _ => panic!("expected locals"),
                    })
                    .collect();
                assert_eq!(slots, vec![0, 1, 2]);
            }
            other => panic!("expected a vector body, got {:?}", other),
        }
    }

    #[test]
    fn let_locals_count_toward_captures() {
        let analysis = analyze_one("(fn* [x] (let* [a 1 b 2] (fn* [] [x a b])))").unwrap();
        let outer = fn_def(&analysis.node);
        let inner = match &outer.arities[0].body[0].kind {
            NodeKind::Let { body, .. } => fn_def(&body[0]),
            other => panic!("expected let, got {:?}", other),
        };
        // x + a + b at the point of construction
        assert_eq!(inner.capture_count, 3);
    }

    #[test]
    fn named_fn_gets_a_self_slot() {
        let analysis = analyze_one("(fn* go [n] (go n))").unwrap();
        let def = fn_def(&analysis.node);
        assert_eq!(def.self_slot, Some(0));
    }

    #[test]
    fn letfn_fns_skip_the_self_slot() {
        let analysis = analyze_one("(letfn* [f (fn* f [] (f))] (f))").unwrap();
        match &analysis.node.kind {
            NodeKind::LetFn { bindings, .. } => {
                assert_eq!(bindings[0].1.self_slot, None);
                // the letfn slot itself is captured
                assert_eq!(bindings[0].1.capture_count, 1);
            }
            other => panic!("expected letfn, got {:?}", other),
        }
    }

    #[test]
    fn recur_outside_tail_position() {
        let result = analyze_one("(loop* [i 0] (+ 1 (recur i)))");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::InvalidRecur,
                ..
            })
        ));
    }

    #[test]
    fn recur_arity_mismatch() {
        let result = analyze_one("(loop* [i 0 j 0] (recur i))");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::InvalidRecur,
                ..
            })
        ));
    }

    #[test]
    fn undefined_symbol_suggests() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let user = rt.env.current;
        rt.env.intern(user, "counter");
        let tokens = Lexer::lex(Source::eval("countre")).unwrap();
        let mut counter = 0;
        let form = {
            let mut reader = Reader::new(&tokens, &rt.env, &mut counter);
            reader.next_form().unwrap().unwrap()
        };
        let error = Analyzer::analyze(&mut rt, form).unwrap_err();
        assert_eq!(error.kind, ErrorKind::UndefinedSymbol);
        assert!(error.message.contains("counter"), "{}", error.message);
    }

    #[test]
    fn quote_of_empty_list_is_nil() {
        let analysis = analyze_one("(quote ())").unwrap();
        match analysis.node.kind {
            NodeKind::Const(id) => {
                assert_eq!(analysis.pool.borrow()[id.0 as usize], Value::Nil);
            }
            other => panic!("expected a constant, got {:?}", other),
        }
    }

    #[test]
    fn duplicate_literal_keys() {
        let result = analyze_one("{:a 1 :a 2}");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::DuplicateKey,
                ..
            })
        ));
    }

    #[test]
    fn distances() {
        assert_eq!(edit_distance("conj", "conj"), 0);
        assert_eq!(edit_distance("conj", "cons"), 1);
        assert_eq!(edit_distance("map", "pmap"), 1);
        assert_eq!(edit_distance("reduce", "x"), 6);
    }
}
