use std::collections::HashMap;

use crate::{
    common::{
        error::{Error, ErrorKind},
        form::{Form, Name},
        span::{Span, Spanned},
    },
    compiler::token::{Delim, Token, Tokens},
    runtime::env::{Env, CORE_NS},
};

/// Names the analyzer owns: special forms and the built-in
/// surface macros it rewrites itself. Syntax quote leaves them
/// unqualified; the analyzer recognizes them in any namespace.
pub const SPECIAL_FORMS: &[&str] = &[
    "quote", "if", "do", "let*", "loop*", "recur", "fn*", "def", "var", "throw", "try", "catch",
    "finally", "letfn*", "set!", "let", "loop", "fn", "letfn", "defn", "defmacro", "defonce",
    "declare", "comment", ".",
];

/// The reader: builds one [`Form`] at a time from the token
/// stream, applying the quoting transforms as it goes. Forms are
/// drained lazily so that an `(ns ...)` form can change how the
/// rest of the file reads (syntax quote resolves symbols against
/// the namespace that is current *now*).
pub struct Reader<'a> {
    tokens: &'a [Spanned<Token>],
    at: usize,
    env: &'a Env,
    gensym_counter: &'a mut u64,
    /// `#()` may not nest.
    in_fn_shorthand: bool,
}

impl<'a> Reader<'a> {
    pub fn new(
        tokens: &'a Spanned<Tokens>,
        env: &'a Env,
        gensym_counter: &'a mut u64,
    ) -> Reader<'a> {
        Reader::resume(tokens, 0, env, gensym_counter)
    }

    /// Picks up reading at a saved position. The driver reads one
    /// top-level form at a time, evaluating in between - which
    /// can change the current namespace the next form resolves
    /// against - so the reader is rebuilt per form around the
    /// moving position.
    pub fn resume(
        tokens: &'a Spanned<Tokens>,
        at: usize,
        env: &'a Env,
        gensym_counter: &'a mut u64,
    ) -> Reader<'a> {
        Reader {
            tokens: &tokens.item,
            at,
            env,
            gensym_counter,
            in_fn_shorthand: false,
        }
    }

    /// The position to resume from after the last `next_form`.
    pub fn position(&self) -> usize {
        self.at
    }

    /// Reads the next top-level form, or `None` at end of input.
    pub fn next_form(&mut self) -> Result<Option<Spanned<Form>>, Error> {
        loop {
            if self.at >= self.tokens.len() {
                return Ok(None);
            }
            if let Some(form) = self.read_form_opt()? {
                return Ok(Some(form));
            }
        }
    }

    fn peek(&self) -> Option<&Spanned<Token>> {
        self.tokens.get(self.at)
    }

    fn advance(&mut self) -> Result<Spanned<Token>, Error> {
        let token = self.tokens.get(self.at).cloned().ok_or_else(|| {
            Error::parse(
                ErrorKind::UnexpectedEof,
                "unexpected end of input while reading a form",
                &self.last_span(),
            )
        })?;
        self.at += 1;
        Ok(token)
    }

    fn last_span(&self) -> Span {
        self.tokens
            .last()
            .map(|t| t.span.clone())
            .unwrap_or(Span::Unknown)
    }

    fn fresh_gensym(&mut self, stem: &str) -> String {
        *self.gensym_counter += 1;
        format!("{}__{}__auto__", stem, self.gensym_counter)
    }

    /// Reads one form; loops past discards.
    fn read_form(&mut self) -> Result<Spanned<Form>, Error> {
        loop {
            if let Some(form) = self.read_form_opt()? {
                return Ok(form);
            }
        }
    }

    /// Reads one form, applying reader macros. `None` means the
    /// form was consumed without producing anything (`#_`, or a
    /// reader conditional with no applicable branch).
    fn read_form_opt(&mut self) -> Result<Option<Spanned<Form>>, Error> {
        let token = self.advance()?;
        let span = token.span.clone();

        let form = match token.item {
            Token::Nil => Form::Nil.spanned(&span),
            Token::Bool(b) => Form::Bool(b).spanned(&span),
            Token::Int(n) => Form::Int(n).spanned(&span),
            Token::Float(n) => Form::Float(n).spanned(&span),
            Token::Char(c) => Form::Char(c).spanned(&span),
            Token::Str(s) => Form::Str(s).spanned(&span),
            Token::Regex(s) => Form::Regex(s).spanned(&span),
            Token::Sym(name) => Form::Sym(name).spanned(&span),
            Token::Keyword(name) => Form::Keyword(name).spanned(&span),
            Token::AutoKeyword(name) => {
                let ns = self.env.ns(self.env.current).name.clone();
                Form::Keyword(Name::qualified(&ns, &name)).spanned(&span)
            }

            Token::Open(Delim::Paren) => {
                let (items, span) = self.read_until(Delim::Paren, span)?;
                Form::List(items).spanned(&span)
            }
            Token::Open(Delim::Square) => {
                let (items, span) = self.read_until(Delim::Square, span)?;
                Form::Vector(items).spanned(&span)
            }
            Token::Open(Delim::Curly) => {
                let (items, span) = self.read_until(Delim::Curly, span)?;
                if items.len() % 2 != 0 {
                    return Err(Error::parse(
                        ErrorKind::OddMapLiteral,
                        "a map literal needs an even number of forms",
                        &span,
                    ));
                }
                Form::Map(items).spanned(&span)
            }
            Token::OpenSet => {
                let (items, span) = self.read_until(Delim::Curly, span)?;
                Form::Set(items).spanned(&span)
            }

            Token::Quote => {
                let inner = self.read_form()?;
                Form::call(Form::sym("quote"), vec![inner], &span)
            }
            Token::VarQuote => {
                let inner = self.read_form()?;
                Form::call(Form::sym("var"), vec![inner], &span)
            }
            Token::Deref => {
                let inner = self.read_form()?;
                Form::call(Form::sym("deref"), vec![inner], &span)
            }
            Token::Unquote => {
                let inner = self.read_form()?;
                Form::call(Form::sym("unquote"), vec![inner], &span)
            }
            Token::UnquoteSplice => {
                let inner = self.read_form()?;
                Form::call(Form::sym("unquote-splicing"), vec![inner], &span)
            }

            Token::Meta => {
                let meta = self.read_form()?;
                let target = self.read_form()?;
                let meta = match meta.item {
                    Form::Keyword(_) => {
                        // ^:kw => {:kw true}
                        let kw_span = meta.span.clone();
                        Form::Map(vec![meta, Form::Bool(true).spanned(&kw_span)])
                            .spanned(&kw_span)
                    }
                    Form::Sym(_) => {
                        // ^sym => {:tag sym}
                        let sym_span = meta.span.clone();
                        Form::Map(vec![
                            Form::keyword("tag").spanned(&sym_span),
                            meta,
                        ])
                        .spanned(&sym_span)
                    }
                    Form::Map(_) => meta,
                    _ => {
                        return Err(Error::parse(
                            ErrorKind::InvalidToken,
                            "metadata must be a keyword, a symbol, or a map",
                            &meta.span,
                        ))
                    }
                };
                Form::call(Form::sym("with-meta"), vec![target, meta], &span)
            }

            Token::Discard => {
                // drop the next form (which may itself discard)
                self.read_form()?;
                return Ok(None);
            }

            Token::SyntaxQuote => {
                let inner = self.read_form()?;
                let mut gensyms = HashMap::new();
                self.syntax_quote(inner, &mut gensyms)?
            }

            Token::OpenFn => {
                if self.in_fn_shorthand {
                    return Err(Error::parse(
                        ErrorKind::InvalidToken,
                        "#() may not be nested",
                        &span,
                    ));
                }
                self.in_fn_shorthand = true;
                let result = self.read_until(Delim::Paren, span.clone());
                self.in_fn_shorthand = false;
                let (items, span) = result?;
                self.fn_shorthand(items, span)?
            }

            Token::OpenCond => {
                let (items, span) = self.read_until(Delim::Paren, span)?;
                match self.reader_conditional(items, &span)? {
                    Some(form) => form,
                    // no branch applied: the conditional vanishes
                    None => return Ok(None),
                }
            }

            Token::Tag(tag) => {
                let inner = self.read_form()?;
                Form::Tagged(tag, Box::new(inner)).spanned(&span)
            }

            Token::Close(delim) => {
                return Err(Error::parse(
                    ErrorKind::UnmatchedDelimiter,
                    &format!("unmatched `{}`", delim.close_char()),
                    &span,
                ))
            }
        };

        Ok(Some(form))
    }

    /// Reads forms until the matching close delimiter.
    fn read_until(
        &mut self,
        delim: Delim,
        open_span: Span,
    ) -> Result<(Vec<Spanned<Form>>, Span), Error> {
        let mut items = vec![];
        loop {
            match self.peek() {
                None => {
                    return Err(Error::parse(
                        ErrorKind::UnexpectedEof,
                        &format!(
                            "unexpected end of input, expected `{}`",
                            delim.close_char()
                        ),
                        &open_span,
                    ))
                }
                Some(token) if token.item == Token::Close(delim) => {
                    let close_span = token.span.clone();
                    self.at += 1;
                    return Ok((items, open_span.to(&close_span)));
                }
                Some(token) if matches!(token.item, Token::Close(_)) => {
                    return Err(Error::parse(
                        ErrorKind::UnmatchedDelimiter,
                        &format!(
                            "expected `{}` but found a different closing delimiter",
                            delim.close_char()
                        ),
                        &token.span,
                    ))
                }
                Some(_) => {
                    if let Some(form) = self.read_form_opt()? {
                        items.push(form);
                    }
                }
            }
        }
    }

    /// `#?(:feature form ...)`: picks the `:default` branch.
    fn reader_conditional(
        &mut self,
        items: Vec<Spanned<Form>>,
        span: &Span,
    ) -> Result<Option<Spanned<Form>>, Error> {
        if items.len() % 2 != 0 {
            return Err(Error::parse(
                ErrorKind::InvalidToken,
                "a reader conditional needs feature/form pairs",
                span,
            ));
        }
        for pair in items.chunks(2) {
            if let Form::Keyword(name) = &pair[0].item {
                if name.ns.is_none() && name.name == "default" {
                    return Ok(Some(pair[1].clone()));
                }
            }
        }
        Ok(None)
    }

    /// `#(...)`: scans the body for `%`, `%n`, and `%&`, renames
    /// them to fresh parameters, and wraps everything in `fn*`.
    fn fn_shorthand(
        &mut self,
        items: Vec<Spanned<Form>>,
        span: Span,
    ) -> Result<Spanned<Form>, Error> {
        let mut highest = 0usize;
        let mut variadic = false;

        fn scan(form: &Form, highest: &mut usize, variadic: &mut bool) {
            match form {
                Form::Sym(name) if name.ns.is_none() => match name.name.as_str() {
                    "%" => *highest = (*highest).max(1),
                    "%&" => *variadic = true,
                    text if text.starts_with('%') => {
                        if let Ok(n) = text[1..].parse::<usize>() {
                            *highest = (*highest).max(n);
                        }
                    }
                    _ => {}
                },
                Form::List(items)
                | Form::Vector(items)
                | Form::Map(items)
                | Form::Set(items) => {
                    for item in items {
                        scan(&item.item, highest, variadic);
                    }
                }
                Form::Tagged(_, inner) => scan(&inner.item, highest, variadic),
                _ => {}
            }
        }
        for item in items.iter() {
            scan(&item.item, &mut highest, &mut variadic);
        }

        let params: Vec<String> = (1..=highest).map(|n| self.fresh_gensym(&format!("p{}", n))).collect();
        let rest = if variadic {
            Some(self.fresh_gensym("rest"))
        } else {
            None
        };

        fn rename(
            form: Form,
            params: &[String],
            rest: &Option<String>,
        ) -> Form {
            match form {
                Form::Sym(name) if name.ns.is_none() => match name.name.as_str() {
                    "%" => Form::sym(&params[0]),
                    "%&" => Form::sym(rest.as_ref().unwrap()),
                    text if text.starts_with('%') && text[1..].parse::<usize>().is_ok() => {
                        let n: usize = text[1..].parse().unwrap();
                        Form::sym(&params[n - 1])
                    }
                    _ => Form::Sym(name),
                },
                Form::List(items) => Form::List(rename_all(items, params, rest)),
                Form::Vector(items) => Form::Vector(rename_all(items, params, rest)),
                Form::Map(items) => Form::Map(rename_all(items, params, rest)),
                Form::Set(items) => Form::Set(rename_all(items, params, rest)),
                Form::Tagged(tag, inner) => {
                    let span = inner.span.clone();
                    Form::Tagged(tag, Box::new(Spanned::new(
                        rename(inner.item, params, rest),
                        span,
                    )))
                }
                other => other,
            }
        }
        fn rename_all(
            items: Vec<Spanned<Form>>,
            params: &[String],
            rest: &Option<String>,
        ) -> Vec<Spanned<Form>> {
            items
                .into_iter()
                .map(|i| {
                    let span = i.span.clone();
                    Spanned::new(rename(i.item, params, rest), span)
                })
                .collect()
        }

        let body = rename(Form::List(items), &params, &rest);

        let mut param_forms: Vec<Spanned<Form>> = params
            .iter()
            .map(|p| Form::sym(p).spanned(&span))
            .collect();
        if let Some(rest) = &rest {
            param_forms.push(Form::sym("&").spanned(&span));
            param_forms.push(Form::sym(rest).spanned(&span));
        }

        Ok(Form::call(
            Form::sym("fn*"),
            vec![
                Form::Vector(param_forms).spanned(&span),
                body.spanned(&span),
            ],
            &span,
        ))
    }

    // -- syntax quote ---------------------------------------------

    /// Expands `` `form `` into code that builds the form.
    /// Symbols are namespace-qualified; `name#` symbols expand to
    /// one stable gensym per name per syntax-quote form.
    fn syntax_quote(
        &mut self,
        form: Spanned<Form>,
        gensyms: &mut HashMap<String, String>,
    ) -> Result<Spanned<Form>, Error> {
        let span = form.span.clone();

        // `~x` inserts x verbatim
        if let Some(inner) = unquoted(&form) {
            return Ok(inner);
        }

        match form.item {
            Form::Sym(name) => {
                let quoted = self.qualify(name, gensyms, &span);
                Ok(Form::call(
                    Form::sym("quote"),
                    vec![quoted.spanned(&span)],
                    &span,
                ))
            }

            Form::List(items) => {
                let built = self.quote_items(items, gensyms, &span)?;
                Ok(built)
            }

            Form::Vector(items) => {
                let list = self.quote_items(items, gensyms, &span)?;
                Ok(Form::call(Form::sym_ns(CORE_NS, "vec"), vec![list], &span))
            }

            Form::Map(items) => {
                let list = self.quote_items(items, gensyms, &span)?;
                Ok(Form::call(
                    Form::sym_ns(CORE_NS, "map-from-seq"),
                    vec![list],
                    &span,
                ))
            }

            Form::Set(items) => {
                let list = self.quote_items(items, gensyms, &span)?;
                Ok(Form::call(
                    Form::sym_ns(CORE_NS, "set-from-seq"),
                    vec![list],
                    &span,
                ))
            }

            // literals build themselves
            literal => Ok(literal.spanned(&span)),
        }
    }

    /// Builds `(list ...)` - or `(concat ...)` when any element
    /// splices - for the elements of a quoted collection.
    fn quote_items(
        &mut self,
        items: Vec<Spanned<Form>>,
        gensyms: &mut HashMap<String, String>,
        span: &Span,
    ) -> Result<Spanned<Form>, Error> {
        let any_splice = items.iter().any(|i| splice_of(i).is_some());

        if !any_splice {
            let mut built = vec![];
            for item in items {
                built.push(self.syntax_quote(item, gensyms)?);
            }
            return Ok(Form::call(Form::sym_ns(CORE_NS, "list"), built, span));
        }

        let mut segments = vec![];
        for item in items {
            match splice_of(&item) {
                Some(spliced) => segments.push(spliced),
                None => {
                    let item_span = item.span.clone();
                    let single = self.syntax_quote(item, gensyms)?;
                    segments.push(Form::call(
                        Form::sym_ns(CORE_NS, "list"),
                        vec![single],
                        &item_span,
                    ));
                }
            }
        }
        Ok(Form::call(Form::sym_ns(CORE_NS, "concat"), segments, span))
    }

    /// Qualifies a symbol inside syntax quote.
    fn qualify(
        &mut self,
        name: Name,
        gensyms: &mut HashMap<String, String>,
        _span: &Span,
    ) -> Form {
        // a generated symbol: stable within this syntax quote
        if name.ns.is_none() && name.name.ends_with('#') {
            let stem = name.name[..name.name.len() - 1].to_string();
            let generated = match gensyms.get(&stem) {
                Some(generated) => generated.clone(),
                None => {
                    let generated = self.fresh_gensym(&stem);
                    gensyms.insert(stem, generated.clone());
                    generated
                }
            };
            return Form::sym(&generated);
        }

        // already qualified: leave alone
        if name.ns.is_some() {
            return Form::Sym(name);
        }

        // the analyzer's own names qualify into core
        if SPECIAL_FORMS.contains(&name.name.as_str()) || name.name == "&" {
            return Form::Sym(name);
        }

        // a var in scope qualifies to its home namespace
        if let Some(var) = self.env.resolve(self.env.current, None, &name.name) {
            let home = self.env.var(var).ns;
            return Form::sym_ns(&self.env.ns(home).name, &name.name);
        }

        // everything else qualifies to the current namespace
        let current = self.env.ns(self.env.current).name.clone();
        Form::sym_ns(&current, &name.name)
    }
}

/// `(unquote x)` => `x`.
fn unquoted(form: &Spanned<Form>) -> Option<Spanned<Form>> {
    if let Form::List(items) = &form.item {
        if items.len() == 2 && items[0].item.is_sym("unquote") {
            return Some(items[1].clone());
        }
    }
    None
}

/// `(unquote-splicing x)` => `x`.
fn splice_of(form: &Spanned<Form>) -> Option<Spanned<Form>> {
    if let Form::List(items) = &form.item {
        if items.len() == 2 && items[0].item.is_sym("unquote-splicing") {
            return Some(items[1].clone());
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{common::span::Source, compiler::lex::Lexer};

    fn read_all(text: &str) -> Result<Vec<Spanned<Form>>, Error> {
        let env = Env::new();
        let mut counter = 0;
        let tokens = Lexer::lex(Source::eval(text))?;
        let mut reader = Reader::new(&tokens, &env, &mut counter);
        let mut forms = vec![];
        while let Some(form) = reader.next_form()? {
            forms.push(form);
        }
        Ok(forms)
    }

    fn read_one(text: &str) -> Spanned<Form> {
        let mut forms = read_all(text).unwrap();
        assert_eq!(forms.len(), 1, "expected exactly one form");
        forms.pop().unwrap()
    }

    #[test]
    fn collections() {
        assert_eq!(format!("{}", read_one("(+ 1 2)").item), "(+ 1 2)");
        assert_eq!(format!("{}", read_one("[1 [2] 3]").item), "[1 [2] 3]");
        assert_eq!(format!("{}", read_one("{:a 1}").item), "{:a 1}");
        assert_eq!(format!("{}", read_one("#{1 2}").item), "#{1 2}");
    }

    #[test]
    fn quoting() {
        assert_eq!(format!("{}", read_one("'x").item), "(quote x)");
        assert_eq!(format!("{}", read_one("@a").item), "(deref a)");
        assert_eq!(format!("{}", read_one("#'a").item), "(var a)");
        assert_eq!(
            format!("{}", read_one("^:dynamic x").item),
            "(with-meta x {:dynamic true})"
        );
    }

    #[test]
    fn discard() {
        let forms = read_all("#_1 2").unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(format!("{}", forms[0].item), "2");
    }

    #[test]
    fn discard_nested() {
        let forms = read_all("#_#_1 2 3").unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(format!("{}", forms[0].item), "3");
    }

    #[test]
    fn odd_map() {
        let result = read_all("{:a}");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::OddMapLiteral,
                ..
            })
        ));
    }

    #[test]
    fn unmatched() {
        assert!(matches!(
            read_all(")"),
            Err(Error {
                kind: ErrorKind::UnmatchedDelimiter,
                ..
            })
        ));
        assert!(matches!(
            read_all("(]"),
            Err(Error {
                kind: ErrorKind::UnmatchedDelimiter,
                ..
            })
        ));
        assert!(matches!(
            read_all("(1 2"),
            Err(Error {
                kind: ErrorKind::UnexpectedEof,
                ..
            })
        ));
    }

    #[test]
    fn fn_shorthand() {
        let form = read_one("#(+ % %2)");
        let shown = format!("{}", form.item);
        assert!(shown.starts_with("(fn* ["));
        assert!(shown.contains("p1__"));
        assert!(shown.contains("p2__"));
    }

    #[test]
    fn fn_shorthand_variadic() {
        let form = read_one("#(apply + %&)");
        let shown = format!("{}", form.item);
        assert!(shown.contains("& rest__"));
    }

    #[test]
    fn fn_shorthand_must_not_nest() {
        assert!(read_all("#(map #(inc %) %)").is_err());
    }

    #[test]
    fn reader_conditional_default() {
        let form = read_one("#?(:clj 1 :default 2)");
        assert_eq!(format!("{}", form.item), "2");
    }

    #[test]
    fn reader_conditional_skips() {
        let forms = read_all("#?(:clj 1) 9").unwrap();
        assert_eq!(forms.len(), 1);
        assert_eq!(format!("{}", forms[0].item), "9");
    }

    #[test]
    fn syntax_quote_symbol_qualifies() {
        let form = read_one("`foo");
        assert_eq!(format!("{}", form.item), "(quote user/foo)");
    }

    #[test]
    fn syntax_quote_unquote() {
        let form = read_one("`(a ~b)");
        let shown = format!("{}", form.item);
        assert_eq!(
            shown,
            "(waxwing.core/list (quote user/a) b)"
        );
    }

    #[test]
    fn syntax_quote_splice() {
        let form = read_one("`(a ~@bs)");
        let shown = format!("{}", form.item);
        assert!(shown.starts_with("(waxwing.core/concat"));
        assert!(shown.contains("bs"));
    }

    #[test]
    fn syntax_quote_gensym_stable() {
        let form = read_one("`(let* [v# 1] [v# v#])");
        let shown = format!("{}", form.item);
        // all three occurrences share one generated name
        let generated: Vec<&str> = shown
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|s| s.starts_with("v__"))
            .collect();
        assert_eq!(generated.len(), 3);
        assert!(generated.iter().all(|g| g == &generated[0]));
    }

    #[test]
    fn syntax_quote_distinct_gensyms_per_quote() {
        let a = format!("{}", read_one("`x#").item);
        let b = format!("{}", read_one("`x#").item);
        assert_ne!(a, b);
    }

    #[test]
    fn tagged_literal() {
        let form = read_one("#inst \"2020\"");
        assert!(matches!(form.item, Form::Tagged(ref tag, _) if tag == "inst"));
    }
}
