//! Destructuring: rewriting binding patterns into flat chains of
//! simple-symbol bindings before scope analysis ever sees them.
//! Sequential patterns lower onto `nth`/`drop`, associative
//! patterns onto `get`; the generated accessor symbols are fully
//! qualified so user shadowing can't hijack them.

use crate::{
    common::{
        error::{Error, ErrorKind},
        form::{Form, Name},
        span::{Span, Spanned},
    },
    runtime::{env::CORE_NS, rt::Rt},
};

/// One flattened binding: a simple symbol and its init form.
pub type FlatBinding = (Spanned<Form>, Spanned<Form>);

/// Is this pattern already a plain, unqualified symbol (not `&`)?
pub fn is_simple(pattern: &Form) -> bool {
    matches!(pattern, Form::Sym(name) if name.ns.is_none() && name.name != "&")
}

/// Flattens a `[pattern init ...]` binding vector into
/// simple-symbol bindings, in evaluation order.
pub fn flatten_bindings(
    rt: &mut Rt,
    pairs: &[Spanned<Form>],
    span: &Span,
) -> Result<Vec<FlatBinding>, Error> {
    if pairs.len() % 2 != 0 {
        return Err(Error::analysis(
            ErrorKind::InvalidBinding,
            "a binding vector needs an even number of forms",
            span,
        ));
    }

    let mut flat = vec![];
    for pair in pairs.chunks(2) {
        bind_pattern(rt, &pair[0], pair[1].clone(), &mut flat)?;
    }
    Ok(flat)
}

/// Binds one pattern to one init form, appending to `out`.
pub fn bind_pattern(
    rt: &mut Rt,
    pattern: &Spanned<Form>,
    init: Spanned<Form>,
    out: &mut Vec<FlatBinding>,
) -> Result<(), Error> {
    match &pattern.item {
        Form::Sym(name) if name.ns.is_none() && name.name != "&" => {
            out.push((pattern.clone(), init));
            Ok(())
        }
        Form::Vector(elements) => sequential(rt, elements, &pattern.span, init, out),
        Form::Map(entries) => associative(rt, entries, &pattern.span, init, out),
        _ => Err(Error::analysis(
            ErrorKind::InvalidBinding,
            &format!("`{}` is not a valid binding pattern", pattern.item),
            &pattern.span,
        )),
    }
}

fn core_sym(name: &str, span: &Span) -> Spanned<Form> {
    Form::Sym(Name::qualified(CORE_NS, name)).spanned(span)
}

fn temp(rt: &mut Rt, stem: &str, span: &Span) -> Spanned<Form> {
    Form::sym(&rt.gensym(stem)).spanned(span)
}

/// `[a b & more :as all]` over a temp bound to the init.
fn sequential(
    rt: &mut Rt,
    elements: &[Spanned<Form>],
    span: &Span,
    init: Spanned<Form>,
    out: &mut Vec<FlatBinding>,
) -> Result<(), Error> {
    let tmp = temp(rt, "vec", span);
    out.push((tmp.clone(), init));

    let mut at = 0usize;
    let mut index = 0usize;
    while at < elements.len() {
        let element = &elements[at];
        match &element.item {
            Form::Sym(name) if name.ns.is_none() && name.name == "&" => {
                let rest = elements.get(at + 1).ok_or_else(|| {
                    Error::analysis(
                        ErrorKind::InvalidBinding,
                        "`&` needs a pattern after it",
                        &element.span,
                    )
                })?;
                // (seq (drop index tmp)) - nil when empty
                let dropped = Form::call(
                    Form::Sym(Name::qualified(CORE_NS, "drop")),
                    vec![Form::Int(index as i64).spanned(span), tmp.clone()],
                    span,
                );
                let seqed = Form::call(
                    Form::Sym(Name::qualified(CORE_NS, "seq")),
                    vec![dropped],
                    span,
                );
                bind_pattern(rt, rest, seqed, out)?;
                at += 2;
                continue;
            }
            Form::Keyword(name) if name.ns.is_none() && name.name == "as" => {
                let alias = elements.get(at + 1).ok_or_else(|| {
                    Error::analysis(
                        ErrorKind::InvalidBinding,
                        "`:as` needs a symbol after it",
                        &element.span,
                    )
                })?;
                out.push((alias.clone(), tmp.clone()));
                at += 2;
                continue;
            }
            _ => {
                // (nth tmp index nil)
                let accessor = Form::call(
                    Form::Sym(Name::qualified(CORE_NS, "nth")),
                    vec![
                        tmp.clone(),
                        Form::Int(index as i64).spanned(span),
                        Form::Nil.spanned(span),
                    ],
                    span,
                );
                bind_pattern(rt, element, accessor, out)?;
                index += 1;
                at += 1;
            }
        }
    }
    Ok(())
}

/// `{a :x :keys [...] :or {...} :as all}` over a temp.
fn associative(
    rt: &mut Rt,
    entries: &[Spanned<Form>],
    span: &Span,
    init: Spanned<Form>,
    out: &mut Vec<FlatBinding>,
) -> Result<(), Error> {
    let tmp = temp(rt, "map", span);
    out.push((tmp.clone(), init));

    // collect :or defaults up front; they apply to every entry
    let mut defaults: Vec<(String, Spanned<Form>)> = vec![];
    for pair in entries.chunks(2) {
        if let Form::Keyword(name) = &pair[0].item {
            if name.ns.is_none() && name.name == "or" {
                match &pair[1].item {
                    Form::Map(or_entries) => {
                        for or_pair in or_entries.chunks(2) {
                            if let Form::Sym(sym) = &or_pair[0].item {
                                defaults.push((sym.name.clone(), or_pair[1].clone()));
                            }
                        }
                    }
                    _ => {
                        return Err(Error::analysis(
                            ErrorKind::InvalidBinding,
                            "`:or` expects a map of symbol to default",
                            &pair[1].span,
                        ))
                    }
                }
            }
        }
    }
    let default_for = |name: &str, span: &Span| -> Spanned<Form> {
        defaults
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, form)| form.clone())
            .unwrap_or_else(|| Form::Nil.spanned(span))
    };

    let mut getter = |rt: &mut Rt,
                      out: &mut Vec<FlatBinding>,
                      target: &Spanned<Form>,
                      key: Spanned<Form>|
     -> Result<(), Error> {
        let fallback = match &target.item {
            Form::Sym(name) => default_for(&name.name, &target.span),
            _ => Form::Nil.spanned(&target.span),
        };
        let accessor = Form::call(
            Form::Sym(Name::qualified(CORE_NS, "get")),
            vec![tmp.clone(), key, fallback],
            span,
        );
        bind_pattern(rt, target, accessor, out)
    };

    for pair in entries.chunks(2) {
        match &pair[0].item {
            Form::Keyword(name) if name.ns.is_none() => match name.name.as_str() {
                "as" => {
                    out.push((pair[1].clone(), tmp.clone()));
                }
                "or" => {}
                "keys" | "strs" | "syms" => {
                    let list = match &pair[1].item {
                        Form::Vector(items) => items.clone(),
                        _ => {
                            return Err(Error::analysis(
                                ErrorKind::InvalidBinding,
                                &format!("`:{}` expects a vector of symbols", name.name),
                                &pair[1].span,
                            ))
                        }
                    };
                    for item in list {
                        let sym_name = match &item.item {
                            Form::Sym(s) if s.ns.is_none() => s.name.clone(),
                            _ => {
                                return Err(Error::analysis(
                                    ErrorKind::InvalidBinding,
                                    &format!("`:{}` expects simple symbols", name.name),
                                    &item.span,
                                ))
                            }
                        };
                        let key = match name.name.as_str() {
                            "keys" => Form::keyword(&sym_name).spanned(&item.span),
                            "strs" => Form::Str(sym_name.clone()).spanned(&item.span),
                            _ => Form::call(
                                Form::sym("quote"),
                                vec![Form::sym(&sym_name).spanned(&item.span)],
                                &item.span,
                            ),
                        };
                        getter(rt, out, &item, key)?;
                    }
                }
                other => {
                    return Err(Error::analysis(
                        ErrorKind::InvalidBinding,
                        &format!("unknown destructuring directive `:{}`", other),
                        &pair[0].span,
                    ))
                }
            },
            // `pattern key-form` entry
            _ => {
                getter(rt, out, &pair[0], pair[1].clone())?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{common::span::Source, compiler::lex::Lexer, compiler::read::Reader, runtime::env::Env};

    fn parse_bindings(text: &str) -> Vec<Spanned<Form>> {
        let env = Env::new();
        let mut counter = 0;
        let tokens = Lexer::lex(Source::eval(text)).unwrap();
        let mut reader = Reader::new(&tokens, &env, &mut counter);
        match reader.next_form().unwrap().unwrap().item {
            Form::Vector(items) => items,
            _ => panic!("expected a vector"),
        }
    }

    fn shown(flat: &[FlatBinding]) -> Vec<(String, String)> {
        flat.iter()
            .map(|(pat, init)| (format!("{}", pat.item), format!("{}", init.item)))
            .collect()
    }

    #[test]
    fn simple_passthrough() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let pairs = parse_bindings("[x 1 y 2]");
        let flat = flatten_bindings(&mut rt, &pairs, &Span::Unknown).unwrap();
        assert_eq!(
            shown(&flat),
            vec![
                ("x".to_string(), "1".to_string()),
                ("y".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn sequential_with_rest_and_as() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let pairs = parse_bindings("[[a & more :as all] coll]");
        let flat = flatten_bindings(&mut rt, &pairs, &Span::Unknown).unwrap();
        let flat = shown(&flat);

        assert!(flat[0].0.starts_with("vec__"));
        assert_eq!(flat[0].1, "coll");
        assert_eq!(flat[1].0, "a");
        assert!(flat[1].1.contains("nth"));
        assert_eq!(flat[2].0, "more");
        assert!(flat[2].1.contains("drop"));
        assert_eq!(flat[3].0, "all");
    }

    #[test]
    fn map_keys_with_or() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let pairs = parse_bindings("[{:keys [a b] :or {b 9}} m]");
        let flat = flatten_bindings(&mut rt, &pairs, &Span::Unknown).unwrap();
        let flat = shown(&flat);

        assert_eq!(flat[1].0, "a");
        assert!(flat[1].1.contains(":a"));
        assert!(flat[1].1.ends_with("nil)"));
        assert_eq!(flat[2].0, "b");
        assert!(flat[2].1.ends_with("9)"));
    }

    #[test]
    fn nested_patterns() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let pairs = parse_bindings("[[[a b] c] coll]");
        let flat = flatten_bindings(&mut rt, &pairs, &Span::Unknown).unwrap();
        let names: Vec<String> = shown(&flat).into_iter().map(|(p, _)| p).collect();
        assert!(names.contains(&"a".to_string()));
        assert!(names.contains(&"b".to_string()));
        assert!(names.contains(&"c".to_string()));
    }

    #[test]
    fn odd_bindings_rejected() {
        let mut rt = Rt::new(usize::MAX, 256, 1024);
        let pairs = parse_bindings("[x]");
        assert!(flatten_bindings(&mut rt, &pairs, &Span::Unknown).is_err());
    }
}
