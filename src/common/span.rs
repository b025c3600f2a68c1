//! Source text and the positions that point back into it.
//!
//! Every form the reader produces carries a `(file, line,
//! column)` position; rather than rescanning the text each time
//! an error needs one, a [`Source`] indexes its line starts once
//! and resolves byte offsets by binary search. A [`Span`] is a
//! half-open byte range into one source - or `Unknown`, for
//! synthesized forms and for runtime errors that have not been
//! attributed to a node yet.

use std::{
    fmt::{Display, Formatter, Result},
    path::Path,
    rc::Rc,
};

/// One unit of source text: a logical name (the loader's path,
/// or `<eval>` for strings fed straight to the embedding API)
/// plus the text and its line index.
#[derive(Debug, PartialEq, Eq)]
pub struct Source {
    pub name: String,
    pub text: String,
    /// Byte offset of the first character of each line.
    line_starts: Vec<u32>,
}

impl Source {
    pub fn new(name: &str, text: &str) -> Rc<Source> {
        let mut line_starts = vec![0];
        for (at, byte) in text.bytes().enumerate() {
            if byte == b'\n' {
                line_starts.push(at as u32 + 1);
            }
        }
        Rc::new(Source {
            name: name.to_string(),
            text: text.to_string(),
            line_starts,
        })
    }

    /// Reads a source file; its logical name is the path it was
    /// loaded from.
    pub fn from_path(path: &Path) -> std::io::Result<Rc<Source>> {
        let text = std::fs::read_to_string(path)?;
        Ok(Source::new(&path.display().to_string(), &text))
    }

    /// A source for text with no file behind it.
    pub fn eval(text: &str) -> Rc<Source> {
        Source::new("<eval>", text)
    }

    /// One-indexed `(line, column)` of a byte offset. Columns
    /// count characters, not bytes.
    pub fn position(&self, offset: usize) -> (usize, usize) {
        let offset = offset.min(self.text.len());
        let line = match self.line_starts.binary_search(&(offset as u32)) {
            Ok(exact) => exact,
            Err(next) => next - 1,
        };
        let start = self.line_starts[line] as usize;
        let column = self.text[start..offset].chars().count() + 1;
        (line + 1, column)
    }

    /// The text of a one-indexed line, without its newline.
    pub fn line_text(&self, line: usize) -> &str {
        let start = match self.line_starts.get(line - 1) {
            Some(start) => *start as usize,
            None => return "",
        };
        let end = self
            .line_starts
            .get(line)
            .map(|next| *next as usize - 1)
            .unwrap_or(self.text.len());
        &self.text[start..end]
    }
}

/// A region of a [`Source`], carried on forms, nodes, and
/// bytecode so errors can point at what produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Span {
    /// Nowhere in particular: synthesized forms, errors not yet
    /// attributed. Renders as nothing.
    Unknown,
    /// The half-open byte range `start..end` of one source.
    At {
        source: Rc<Source>,
        start: u32,
        end: u32,
    },
}

impl Span {
    /// A span over `start..end`.
    pub fn of(source: &Rc<Source>, start: usize, end: usize) -> Span {
        Span::At {
            source: Rc::clone(source),
            start: start as u32,
            end: end as u32,
        }
    }

    /// A span pointing at the single character at `offset`.
    pub fn point(source: &Rc<Source>, offset: usize) -> Span {
        Span::of(source, offset, offset + 1)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Span::Unknown)
    }

    /// The span stretching from this one through `other`. An
    /// unknown side yields the other; spans into different
    /// sources don't stretch (the first wins).
    pub fn to(&self, other: &Span) -> Span {
        match (self, other) {
            (Span::Unknown, _) => other.clone(),
            (_, Span::Unknown) => self.clone(),
            (
                Span::At { source, start, end },
                Span::At {
                    source: other_source,
                    start: other_start,
                    end: other_end,
                },
            ) => {
                if !Rc::ptr_eq(source, other_source) {
                    return self.clone();
                }
                Span::At {
                    source: Rc::clone(source),
                    start: (*start).min(*other_start),
                    end: (*end).max(*other_end),
                }
            }
        }
    }

    /// One-indexed `(line, column)` of the span's start; `(1, 1)`
    /// for an unknown span.
    pub fn line_col(&self) -> (usize, usize) {
        match self {
            Span::Unknown => (1, 1),
            Span::At { source, start, .. } => source.position(*start as usize),
        }
    }

    /// The logical name of the underlying source.
    pub fn path(&self) -> &str {
        match self {
            Span::Unknown => "<unknown>",
            Span::At { source, .. } => &source.name,
        }
    }

    /// The spanned text.
    pub fn text(&self) -> &str {
        match self {
            Span::Unknown => "",
            Span::At { source, start, end } => {
                let end = (*end as usize).min(source.text.len());
                &source.text[*start as usize..end]
            }
        }
    }
}

impl Display for Span {
    /// Points at the span in its source:
    /// ```plain
    /// In <eval>:1:5
    ///   |
    /// 1 | (def x (+ 1 "two"))
    ///   |     ^^^^^^^^^^^^^^^
    /// ```
    /// An unknown span prints nothing.
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let (source, start, end) = match self {
            Span::Unknown => return Ok(()),
            Span::At { source, start, end } => (source, *start as usize, *end as usize),
        };

        let (line, col) = source.position(start);
        let text = source.line_text(line);
        let gutter = line.to_string();
        let pad = " ".repeat(gutter.len());

        // the caret run stays on the first line even for
        // multi-line spans
        let width = end.saturating_sub(start).max(1);
        let carets = width.min(text.chars().count().saturating_sub(col - 1).max(1));

        writeln!(f, "In {}:{}:{}", source.name, line, col)?;
        writeln!(f, "{} |", pad)?;
        writeln!(f, "{} | {}", gutter, text)?;
        writeln!(f, "{} | {}{}", pad, " ".repeat(col - 1), "^".repeat(carets))
    }
}

/// An item plus where it came from. Tokens, forms, and nodes
/// all travel through the pipeline as `Spanned<T>`, so by the
/// time an error surfaces there is always a position to report.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Spanned<T> {
    pub item: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(item: T, span: Span) -> Spanned<T> {
        Spanned { item, span }
    }

    /// A destructive alias for `self.item`.
    pub fn into(self) -> T {
        self.item
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn positions() {
        let source = Source::new("demo.clj", "(def x 1)\n(def y\n  2)");
        assert_eq!(source.position(0), (1, 1));
        assert_eq!(source.position(10), (2, 1));
        assert_eq!(source.position(19), (3, 3));
        // past the end clamps to just past the last line
        assert_eq!(source.position(999), (3, 5));
    }

    #[test]
    fn line_texts() {
        let source = Source::new("demo.clj", "one\ntwo\nthree");
        assert_eq!(source.line_text(1), "one");
        assert_eq!(source.line_text(2), "two");
        assert_eq!(source.line_text(3), "three");
        assert_eq!(source.line_text(9), "");
    }

    #[test]
    fn stretching() {
        let source = Source::eval("heck, that's awesome");
        let a = Span::of(&source, 0, 5);
        let b = Span::of(&source, 11, 13);

        assert_eq!(a.to(&b), Span::of(&source, 0, 13));
        assert_eq!(Span::Unknown.to(&b), b);
        assert_eq!(a.to(&Span::Unknown), a);
    }

    #[test]
    fn spanned_text() {
        let source = Source::eval("hello, this is some text!");
        assert_eq!(Span::of(&source, 7, 11).text(), "this");
        assert_eq!(Span::Unknown.text(), "");
    }

    #[test]
    fn different_sources_do_not_stretch() {
        let a = Span::of(&Source::eval("aaa"), 0, 1);
        let b = Span::of(&Source::eval("bbb"), 0, 3);
        assert_eq!(a.to(&b), a);
    }
}
