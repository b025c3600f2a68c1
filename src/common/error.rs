use std::fmt;

use crate::{common::span::Span, runtime::value::Value};

/// The pipeline stage an [`Error`] was raised in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Parse,
    Analysis,
    Macroexpand,
    Eval,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Parse => "parse",
            Phase::Analysis => "analysis",
            Phase::Macroexpand => "macroexpand",
            Phase::Eval => "eval",
        };
        write!(f, "{}", name)
    }
}

/// Every way an evaluation can go wrong, from an unterminated
/// string literal up to a user-thrown value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    // parse
    UnexpectedEof,
    InvalidToken,
    UnmatchedDelimiter,
    InvalidNumber,
    InvalidCharacter,
    InvalidString,
    InvalidRegex,
    OddMapLiteral,
    // analysis
    UndefinedSymbol,
    InvalidArity,
    InvalidBinding,
    InvalidRecur,
    DuplicateKey,
    // macroexpand
    MacroError,
    // eval
    DivisionByZero,
    IndexOutOfBounds,
    TypeError,
    AssertionError,
    ArityError,
    Thrown,
    // anywhere
    InternalError,
    OutOfMemory,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::UnexpectedEof => "unexpected end of input",
            ErrorKind::InvalidToken => "invalid token",
            ErrorKind::UnmatchedDelimiter => "unmatched delimiter",
            ErrorKind::InvalidNumber => "invalid number",
            ErrorKind::InvalidCharacter => "invalid character",
            ErrorKind::InvalidString => "invalid string",
            ErrorKind::InvalidRegex => "invalid regex",
            ErrorKind::OddMapLiteral => "odd map literal",
            ErrorKind::UndefinedSymbol => "undefined symbol",
            ErrorKind::InvalidArity => "invalid arity",
            ErrorKind::InvalidBinding => "invalid binding",
            ErrorKind::InvalidRecur => "invalid recur",
            ErrorKind::DuplicateKey => "duplicate key",
            ErrorKind::MacroError => "macro error",
            ErrorKind::DivisionByZero => "division by zero",
            ErrorKind::IndexOutOfBounds => "index out of bounds",
            ErrorKind::TypeError => "type error",
            ErrorKind::AssertionError => "assertion error",
            ErrorKind::ArityError => "arity error",
            ErrorKind::Thrown => "thrown",
            ErrorKind::InternalError => "internal error",
            ErrorKind::OutOfMemory => "out of memory",
        };
        write!(f, "{}", name)
    }
}

/// Represents an error raised anywhere in the pipeline:
/// a reason, the phase it occurred in, the place it points at,
/// and - for runtime errors - a traceback of the call spans
/// that led there, most recent call last.
///
/// User-level `throw` carries its payload [`Value`] so that
/// `catch` can rebind it; the payload is `None` for errors the
/// runtime raised itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub phase: Phase,
    pub message: String,
    pub span: Span,
    pub trace: Vec<Span>,
    pub payload: Option<Value>,
    pub cause: Option<Box<Error>>,
}

impl Error {
    /// Creates a new error in a given phase, pointing at a span.
    pub fn new(kind: ErrorKind, phase: Phase, message: &str, span: &Span) -> Error {
        Error {
            kind,
            phase,
            message: message.to_string(),
            span: span.clone(),
            trace: vec![],
            payload: None,
            cause: None,
        }
    }

    /// A reader error.
    pub fn parse(kind: ErrorKind, message: &str, span: &Span) -> Error {
        Error::new(kind, Phase::Parse, message, span)
    }

    /// An analysis error.
    pub fn analysis(kind: ErrorKind, message: &str, span: &Span) -> Error {
        Error::new(kind, Phase::Analysis, message, span)
    }

    /// A macro-expansion error.
    pub fn macroexpand(kind: ErrorKind, message: &str, span: &Span) -> Error {
        Error::new(kind, Phase::Macroexpand, message, span)
    }

    /// A runtime error. The span is filled in by the back end
    /// when the error crosses the node that raised it.
    pub fn eval(kind: ErrorKind, message: &str) -> Error {
        Error::new(kind, Phase::Eval, message, &Span::Unknown)
    }

    /// A user `throw`: an eval error that carries its payload.
    pub fn thrown(payload: Value, message: &str) -> Error {
        let mut error = Error::eval(ErrorKind::Thrown, message);
        error.payload = Some(payload);
        error
    }

    /// Chains another error as this error's cause.
    pub fn with_cause(mut self, cause: Error) -> Error {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Fills in the span if the error doesn't have one yet.
    /// Back ends call this as an error propagates past the node
    /// whose evaluation raised it, so the innermost span wins.
    pub fn at(mut self, span: &Span) -> Error {
        if self.span.is_unknown() {
            self.span = span.clone();
        }
        self
    }

    /// Pushes a call span onto the traceback.
    pub fn in_call(mut self, span: &Span) -> Error {
        self.trace.push(span.clone());
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.trace.is_empty() {
            writeln!(f, "Traceback, most recent call last:")?;
            for span in self.trace.iter().rev() {
                fmt::Display::fmt(span, f)?;
            }
        }

        if !self.span.is_unknown() {
            fmt::Display::fmt(&self.span, f)?;
        }

        write!(f, "{} error ({}): {}", self.phase, self.kind, self.message)?;

        if let Some(cause) = &self.cause {
            write!(f, "\ncaused by: {}", cause)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::span::Source;

    #[test]
    fn display() {
        // This is just a demo to check formatting;
        // might not coincide with an actual waxwing error
        let source = Source::eval("(def x (+ 1 \"two\"))");
        let error = Error::parse(
            ErrorKind::InvalidToken,
            "unexpected token `\"two\"`",
            &Span::of(&source, 12, 17),
        );

        let target = "\
In <eval>:1:13
  |
1 | (def x (+ 1 \"two\"))
  |             ^^^^^
parse error (invalid token): unexpected token `\"two\"`";

        assert_eq!(format!("{}", error), target);
    }

    #[test]
    fn cause_chain() {
        let inner = Error::eval(ErrorKind::TypeError, "not a number");
        let outer = Error::eval(ErrorKind::MacroError, "expansion failed").with_cause(inner);
        let shown = format!("{}", outer);
        assert!(shown.contains("caused by"));
        assert!(shown.contains("not a number"));
    }
}
