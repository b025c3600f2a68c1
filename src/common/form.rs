use std::fmt;

use crate::common::span::{Span, Spanned};

/// A syntactic tree produced by the reader.
/// A `Form` is plain data: literals, symbols, and collections of
/// further forms. The quoting transforms are already applied, so
/// `'x` arrives as the list `(quote x)`, and so on. Collections
/// carry their source position through the surrounding [`Spanned`].
///
/// Forms live for exactly one top-level expression: the reader
/// builds one, the analyzer consumes it, and it is dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum Form {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Char(char),
    Str(String),
    /// A `#"…"` literal, validated at read time; the runtime
    /// keeps the pattern source.
    Regex(String),
    Sym(Name),
    Keyword(Name),
    List(Vec<Spanned<Form>>),
    Vector(Vec<Spanned<Form>>),
    /// Alternating keys and values; the reader guarantees an even
    /// count, duplicate keys are caught at analysis.
    Map(Vec<Spanned<Form>>),
    Set(Vec<Spanned<Form>>),
    /// A `#tag form` literal. The core rejects these unless an
    /// embedder installed a handler for the tag.
    Tagged(String, Box<Spanned<Form>>),
}

/// An optionally namespace-qualified name,
/// shared by symbols and keywords.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Name {
    pub ns: Option<String>,
    pub name: String,
}

impl Name {
    pub fn plain(name: &str) -> Name {
        Name {
            ns: None,
            name: name.to_string(),
        }
    }

    pub fn qualified(ns: &str, name: &str) -> Name {
        Name {
            ns: Some(ns.to_string()),
            name: name.to_string(),
        }
    }

    /// Splits `ns/name` on the first slash. A lone `/` is the
    /// division symbol, not a separator.
    pub fn parse(text: &str) -> Name {
        match text.find('/') {
            Some(at) if at > 0 && at + 1 < text.len() => Name {
                ns: Some(text[..at].to_string()),
                name: text[at + 1..].to_string(),
            },
            _ => Name::plain(text),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ns {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

impl Form {
    /// Wraps a form in a span.
    pub fn spanned(self, span: &Span) -> Spanned<Form> {
        Spanned::new(self, span.clone())
    }

    /// Shortcut for a plain symbol form.
    pub fn sym(name: &str) -> Form {
        Form::Sym(Name::plain(name))
    }

    /// Shortcut for a namespace-qualified symbol form.
    pub fn sym_ns(ns: &str, name: &str) -> Form {
        Form::Sym(Name::qualified(ns, name))
    }

    /// Shortcut for a keyword form.
    pub fn keyword(name: &str) -> Form {
        Form::Keyword(Name::plain(name))
    }

    /// Is this form the symbol `name` (unqualified)?
    pub fn is_sym(&self, name: &str) -> bool {
        matches!(self, Form::Sym(n) if n.ns.is_none() && n.name == name)
    }

    /// The head symbol of a list form, if there is one.
    pub fn head_sym(&self) -> Option<&Name> {
        match self {
            Form::List(items) => match items.first() {
                Some(Spanned {
                    item: Form::Sym(name),
                    ..
                }) => Some(name),
                _ => None,
            },
            _ => None,
        }
    }

    /// Builds a `(head args...)` call form, used by the reader's
    /// quoting transforms and by destructuring.
    pub fn call(head: Form, args: Vec<Spanned<Form>>, span: &Span) -> Spanned<Form> {
        let mut items = vec![head.spanned(span)];
        items.extend(args);
        Form::List(items).spanned(span)
    }
}

impl fmt::Display for Form {
    /// Prints a form back as readable source, used by error
    /// messages and by macroexpansion diagnostics.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn items(f: &mut fmt::Formatter<'_>, forms: &[Spanned<Form>]) -> fmt::Result {
            for (i, form) in forms.iter().enumerate() {
                if i > 0 {
                    write!(f, " ")?;
                }
                write!(f, "{}", form.item)?;
            }
            Ok(())
        }

        match self {
            Form::Nil => write!(f, "nil"),
            Form::Bool(b) => write!(f, "{}", b),
            Form::Int(n) => write!(f, "{}", n),
            Form::Float(n) => {
                if n.fract() == 0.0 && n.is_finite() {
                    write!(f, "{:.1}", n)
                } else {
                    write!(f, "{}", n)
                }
            }
            Form::Char(c) => match c {
                '\n' => write!(f, "\\newline"),
                ' ' => write!(f, "\\space"),
                '\t' => write!(f, "\\tab"),
                '\r' => write!(f, "\\return"),
                c => write!(f, "\\{}", c),
            },
            Form::Str(s) => write!(f, "{:?}", s),
            Form::Regex(s) => write!(f, "#\"{}\"", s),
            Form::Sym(name) => write!(f, "{}", name),
            Form::Keyword(name) => write!(f, ":{}", name),
            Form::List(forms) => {
                write!(f, "(")?;
                items(f, forms)?;
                write!(f, ")")
            }
            Form::Vector(forms) => {
                write!(f, "[")?;
                items(f, forms)?;
                write!(f, "]")
            }
            Form::Map(forms) => {
                write!(f, "{{")?;
                items(f, forms)?;
                write!(f, "}}")
            }
            Form::Set(forms) => {
                write!(f, "#{{")?;
                items(f, forms)?;
                write!(f, "}}")
            }
            Form::Tagged(tag, form) => write!(f, "#{} {}", tag, form.item),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn name_parse() {
        assert_eq!(Name::parse("foo"), Name::plain("foo"));
        assert_eq!(Name::parse("ns/foo"), Name::qualified("ns", "foo"));
        assert_eq!(Name::parse("/"), Name::plain("/"));
        // only the first slash separates
        assert_eq!(Name::parse("a/b/c"), Name::qualified("a", "b/c"));
    }

    #[test]
    fn display_round() {
        let span = Span::Unknown;
        let form = Form::call(
            Form::sym("+"),
            vec![Form::Int(1).spanned(&span), Form::Int(2).spanned(&span)],
            &span,
        );
        assert_eq!(format!("{}", form.item), "(+ 1 2)");
    }
}
