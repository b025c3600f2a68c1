use std::{rc::Rc, str::FromStr};

use log::debug;

use crate::{
    common::{
        error::{Error, ErrorKind},
        form::Name,
        span::{Source, Span, Spanned},
    },
    compiler::token::{Delim, Token, Tokens},
};

/// Characters that may appear in a symbol beyond the first.
const SYM_CHARS: &str = "*+!-_'?<>=.&$%/";

#[derive(Debug)]
pub struct Lexer {
    source: Rc<Source>,
    index: usize,
    tokens: Tokens,
}

impl Lexer {
    /// Lexes a source file into a stream of tokens.
    pub fn lex(source: Rc<Source>) -> Result<Spanned<Tokens>, Error> {
        let span = Span::of(&source, 0, source.text.len());

        let mut lexer = Lexer {
            source,
            index: 0,
            tokens: vec![],
        };

        lexer.strip();
        while lexer.index < lexer.source.text.len() {
            let token = lexer.next_token()?;
            lexer.tokens.push(token);
            lexer.strip();
        }

        debug!("lexed {} tokens", lexer.tokens.len());
        Ok(Spanned::new(lexer.tokens, span))
    }

    fn remaining(&self) -> &str {
        &self.source.text[self.index..]
    }

    fn peek(&self) -> Option<char> {
        self.remaining().chars().next()
    }

    fn peek_at(&self, n: usize) -> Option<char> {
        self.remaining().chars().nth(n)
    }

    /// Strips whitespace (commas included) and line comments.
    fn strip(&mut self) {
        loop {
            let old_index = self.index;

            while let Some(c) = self.peek() {
                if !c.is_whitespace() && c != ',' {
                    break;
                }
                self.index += c.len_utf8();
            }

            if self.peek() == Some(';') {
                while let Some(c) = self.peek() {
                    self.index += c.len_utf8();
                    if c == '\n' {
                        break;
                    }
                }
            }

            if self.index == old_index {
                break;
            }
        }
    }

    /// Consumes characters while a predicate holds, returning the
    /// consumed slice.
    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> &str {
        let start = self.index;
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            self.index += c.len_utf8();
        }
        &self.source.text[start..self.index]
    }

    fn span_from(&self, start: usize) -> Span {
        Span::of(&self.source, start, self.index)
    }

    fn point(&self) -> Span {
        let last = self.source.text.len().saturating_sub(1);
        Span::point(&self.source, self.index.min(last))
    }

    /// Parses the next token.
    /// Expects all whitespace and comments to be stripped.
    fn next_token(&mut self) -> Result<Spanned<Token>, Error> {
        let start = self.index;
        let c = self.peek().unwrap();

        let token = match c {
            '(' => {
                self.index += 1;
                Token::Open(Delim::Paren)
            }
            '[' => {
                self.index += 1;
                Token::Open(Delim::Square)
            }
            '{' => {
                self.index += 1;
                Token::Open(Delim::Curly)
            }
            ')' => {
                self.index += 1;
                Token::Close(Delim::Paren)
            }
            ']' => {
                self.index += 1;
                Token::Close(Delim::Square)
            }
            '}' => {
                self.index += 1;
                Token::Close(Delim::Curly)
            }
            '\'' => {
                self.index += 1;
                Token::Quote
            }
            '`' => {
                self.index += 1;
                Token::SyntaxQuote
            }
            '~' => {
                self.index += 1;
                if self.peek() == Some('@') {
                    self.index += 1;
                    Token::UnquoteSplice
                } else {
                    Token::Unquote
                }
            }
            '@' => {
                self.index += 1;
                Token::Deref
            }
            '^' => {
                self.index += 1;
                Token::Meta
            }
            '"' => {
                self.index += 1;
                self.string(start)?
            }
            '\\' => {
                self.index += 1;
                self.character(start)?
            }
            ':' => {
                self.index += 1;
                self.keyword(start)?
            }
            '#' => {
                self.index += 1;
                self.dispatch(start)?
            }
            c if c.is_ascii_digit() => self.number(start)?,
            '+' | '-' if self.peek_at(1).map_or(false, |n| n.is_ascii_digit()) => {
                self.number(start)?
            }
            c if c.is_alphabetic() || SYM_CHARS.contains(c) => self.symbol(start)?,
            unknown => {
                return Err(Error::parse(
                    ErrorKind::InvalidToken,
                    &format!("the character `{}` is not recognized here", unknown),
                    &self.point(),
                ))
            }
        };

        Ok(Spanned::new(token, self.span_from(start)))
    }

    /// Everything behind the `#` dispatch character.
    fn dispatch(&mut self, start: usize) -> Result<Token, Error> {
        match self.peek() {
            Some('{') => {
                self.index += 1;
                Ok(Token::OpenSet)
            }
            Some('(') => {
                self.index += 1;
                Ok(Token::OpenFn)
            }
            Some('_') => {
                self.index += 1;
                Ok(Token::Discard)
            }
            Some('\'') => {
                self.index += 1;
                Ok(Token::VarQuote)
            }
            Some('"') => {
                self.index += 1;
                self.regex(start)
            }
            Some('?') => {
                self.index += 1;
                if self.peek() != Some('(') {
                    return Err(Error::parse(
                        ErrorKind::InvalidToken,
                        "expected `(` after `#?` to open a reader conditional",
                        &self.point(),
                    ));
                }
                self.index += 1;
                Ok(Token::OpenCond)
            }
            Some(c) if c.is_alphabetic() => {
                let tag = self
                    .take_while(|c| c.is_alphanumeric() || SYM_CHARS.contains(c))
                    .to_string();
                Ok(Token::Tag(tag))
            }
            _ => Err(Error::parse(
                ErrorKind::InvalidToken,
                "unsupported dispatch after `#`",
                &self.span_from(start),
            )),
        }
    }

    /// A string literal; the opening quote is already consumed.
    fn string(&mut self, start: usize) -> Result<Token, Error> {
        let mut string = String::new();

        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => {
                    return Err(Error::parse(
                        ErrorKind::UnexpectedEof,
                        "unexpected end of source while reading a string literal",
                        &self.span_from(start),
                    ))
                }
            };
            self.index += c.len_utf8();

            match c {
                '"' => return Ok(Token::Str(string)),
                '\\' => {
                    let escape = match self.peek() {
                        Some(e) => e,
                        None => {
                            return Err(Error::parse(
                                ErrorKind::UnexpectedEof,
                                "unexpected end of source inside a string escape",
                                &self.span_from(start),
                            ))
                        }
                    };
                    self.index += escape.len_utf8();
                    string.push(match escape {
                        '"' => '"',
                        '\\' => '\\',
                        'n' => '\n',
                        'r' => '\r',
                        't' => '\t',
                        'b' => '\u{8}',
                        'f' => '\u{c}',
                        '0' => '\0',
                        'u' => self.unicode_escape(start)?,
                        other => {
                            return Err(Error::parse(
                                ErrorKind::InvalidString,
                                &format!("unknown escape `\\{}` in string literal", other),
                                &self.span_from(start),
                            ))
                        }
                    });
                }
                c => string.push(c),
            }
        }
    }

    /// Four hex digits after a `\u`.
    fn unicode_escape(&mut self, start: usize) -> Result<char, Error> {
        let mut code = 0u32;
        for _ in 0..4 {
            let digit = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| {
                    Error::parse(
                        ErrorKind::InvalidString,
                        "`\\u` escape expects four hex digits",
                        &self.span_from(start),
                    )
                })?;
            self.index += 1;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| {
            Error::parse(
                ErrorKind::InvalidString,
                &format!("`\\u{:04x}` is not a valid character", code),
                &self.span_from(start),
            )
        })
    }

    /// A character literal; the backslash is already consumed.
    fn character(&mut self, start: usize) -> Result<Token, Error> {
        let rest = self
            .take_while(|c| c.is_alphanumeric() || c == '-')
            .to_string();

        let c = match rest.as_str() {
            "newline" => '\n',
            "space" => ' ',
            "tab" => '\t',
            "return" => '\r',
            "backspace" => '\u{8}',
            "formfeed" => '\u{c}',
            name if name.len() == 1 => name.chars().next().unwrap(),
            name if name.starts_with('u') && name.len() == 5 => {
                let code = u32::from_str_radix(&name[1..], 16).map_err(|_| {
                    Error::parse(
                        ErrorKind::InvalidCharacter,
                        &format!("`\\{}` is not a valid unicode character literal", name),
                        &self.span_from(start),
                    )
                })?;
                char::from_u32(code).ok_or_else(|| {
                    Error::parse(
                        ErrorKind::InvalidCharacter,
                        &format!("`\\{}` is not a valid character", name),
                        &self.span_from(start),
                    )
                })?
            }
            "" => {
                // a single punctuation character, like `\(`
                match self.peek() {
                    Some(c) => {
                        self.index += c.len_utf8();
                        c
                    }
                    None => {
                        return Err(Error::parse(
                            ErrorKind::UnexpectedEof,
                            "unexpected end of source after `\\`",
                            &self.span_from(start),
                        ))
                    }
                }
            }
            name => {
                return Err(Error::parse(
                    ErrorKind::InvalidCharacter,
                    &format!("`\\{}` is not a character name", name),
                    &self.span_from(start),
                ))
            }
        };

        Ok(Token::Char(c))
    }

    /// A keyword; the leading `:` is already consumed.
    fn keyword(&mut self, start: usize) -> Result<Token, Error> {
        let auto = self.peek() == Some(':');
        if auto {
            self.index += 1;
        }

        let text = self
            .take_while(|c| c.is_alphanumeric() || SYM_CHARS.contains(c) || c == '#')
            .to_string();
        if text.is_empty() {
            return Err(Error::parse(
                ErrorKind::InvalidToken,
                "a keyword needs a name after the `:`",
                &self.span_from(start),
            ));
        }

        if auto {
            Ok(Token::AutoKeyword(text))
        } else {
            Ok(Token::Keyword(Name::parse(&text)))
        }
    }

    /// A number: `42`, `-3`, `1.5`, `2e10`, `-2.5E-4`.
    fn number(&mut self, start: usize) -> Result<Token, Error> {
        let text = self
            .take_while(|c| {
                c.is_ascii_digit()
                    || c == '.'
                    || c == 'e'
                    || c == 'E'
                    || c == '+'
                    || c == '-'
            })
            .to_string();

        // a sign is only valid leading, or right after an exponent
        let float = text.contains('.') || text.contains('e') || text.contains('E');
        if float {
            match f64::from_str(&text) {
                Ok(f) => Ok(Token::Float(f)),
                Err(_) => Err(Error::parse(
                    ErrorKind::InvalidNumber,
                    &format!("`{}` is not a valid number", text),
                    &self.span_from(start),
                )),
            }
        } else {
            match i64::from_str(&text) {
                Ok(i) => Ok(Token::Int(i)),
                Err(_) => Err(Error::parse(
                    ErrorKind::InvalidNumber,
                    &format!(
                        "`{}` does not fit in a signed 64-bit integer",
                        text
                    ),
                    &self.span_from(start),
                )),
            }
        }
    }

    /// A symbol, or one of the symbol-shaped literals.
    fn symbol(&mut self, start: usize) -> Result<Token, Error> {
        let text = self
            .take_while(|c| c.is_alphanumeric() || SYM_CHARS.contains(c) || c == '#')
            .to_string();

        Ok(match text.as_str() {
            "nil" => Token::Nil,
            "true" => Token::Bool(true),
            "false" => Token::Bool(false),
            _ => Token::Sym(Name::parse(&text)),
        })
    }

    /// A regex literal; `#"` is already consumed. The pattern
    /// text is kept raw except for `\"`.
    fn regex(&mut self, start: usize) -> Result<Token, Error> {
        let mut pattern = String::new();

        loop {
            let c = match self.peek() {
                Some(c) => c,
                None => {
                    return Err(Error::parse(
                        ErrorKind::UnexpectedEof,
                        "unexpected end of source while reading a regex literal",
                        &self.span_from(start),
                    ))
                }
            };
            self.index += c.len_utf8();

            match c {
                '"' => break,
                '\\' => match self.peek() {
                    Some('"') => {
                        pattern.push('"');
                        self.index += 1;
                    }
                    Some(next) => {
                        pattern.push('\\');
                        pattern.push(next);
                        self.index += next.len_utf8();
                    }
                    None => {
                        return Err(Error::parse(
                            ErrorKind::UnexpectedEof,
                            "unexpected end of source inside a regex escape",
                            &self.span_from(start),
                        ))
                    }
                },
                c => pattern.push(c),
            }
        }

        if let Err(e) = regex::Regex::new(&pattern) {
            return Err(Error::parse(
                ErrorKind::InvalidRegex,
                &format!("invalid regex literal: {}", e),
                &self.span_from(start),
            ));
        }

        Ok(Token::Regex(pattern))
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn lex(text: &str) -> Result<Vec<Token>, Error> {
        Lexer::lex(Source::eval(text))
            .map(|tokens| tokens.item.into_iter().map(|t| t.item).collect())
    }

    #[test]
    fn empty() {
        assert_eq!(lex("").unwrap(), vec![]);
    }

    #[test]
    fn literals() {
        assert_eq!(
            lex("nil true false 42 -7 2.5 \\a \\newline \"hey\\n\"").unwrap(),
            vec![
                Token::Nil,
                Token::Bool(true),
                Token::Bool(false),
                Token::Int(42),
                Token::Int(-7),
                Token::Float(2.5),
                Token::Char('a'),
                Token::Char('\n'),
                Token::Str("hey\n".to_string()),
            ]
        );
    }

    #[test]
    fn symbols_and_keywords() {
        assert_eq!(
            lex("foo foo/bar :baz :ns/k ::auto +").unwrap(),
            vec![
                Token::Sym(Name::plain("foo")),
                Token::Sym(Name::qualified("foo", "bar")),
                Token::Keyword(Name::plain("baz")),
                Token::Keyword(Name::qualified("ns", "k")),
                Token::AutoKeyword("auto".to_string()),
                Token::Sym(Name::plain("+")),
            ]
        );
    }

    #[test]
    fn dispatch_tokens() {
        assert_eq!(
            lex("#{ #( #_ #' #\"a+\" #inst").unwrap(),
            vec![
                Token::OpenSet,
                Token::OpenFn,
                Token::Discard,
                Token::VarQuote,
                Token::Regex("a+".to_string()),
                Token::Tag("inst".to_string()),
            ]
        );
    }

    #[test]
    fn comments_and_commas() {
        assert_eq!(
            lex("[1, 2] ; trailing\n3").unwrap(),
            vec![
                Token::Open(Delim::Square),
                Token::Int(1),
                Token::Int(2),
                Token::Close(Delim::Square),
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn quoting_characters() {
        assert_eq!(
            lex("'x `x ~x ~@x @x ^x").unwrap(),
            vec![
                Token::Quote,
                Token::Sym(Name::plain("x")),
                Token::SyntaxQuote,
                Token::Sym(Name::plain("x")),
                Token::Unquote,
                Token::Sym(Name::plain("x")),
                Token::UnquoteSplice,
                Token::Sym(Name::plain("x")),
                Token::Deref,
                Token::Sym(Name::plain("x")),
                Token::Meta,
                Token::Sym(Name::plain("x")),
            ]
        );
    }

    #[test]
    fn exponents() {
        assert_eq!(lex("1e3").unwrap(), vec![Token::Float(1000.0)]);
        assert_eq!(lex("-2.5E-4").unwrap(), vec![Token::Float(-0.00025)]);
    }

    #[test]
    fn unclosed_string() {
        let result = lex("\"oops");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::UnexpectedEof,
                ..
            })
        ));
    }

    #[test]
    fn bad_regex() {
        let result = lex("#\"(\"");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::InvalidRegex,
                ..
            })
        ));
    }

    #[test]
    fn huge_integer() {
        let result = lex("99999999999999999999999");
        assert!(matches!(
            result,
            Err(Error {
                kind: ErrorKind::InvalidNumber,
                ..
            })
        ));
    }

    proptest! {
        #[test]
        fn doesnt_crash(s in "\\PC*") {
            let _ = Lexer::lex(Source::eval(&s));
        }

        #[test]
        fn integers_round_trip(n in proptest::num::i64::ANY) {
            let shown = format!("{}", n);
            prop_assert_eq!(lex(&shown).unwrap(), vec![Token::Int(n)]);
        }
    }
}
