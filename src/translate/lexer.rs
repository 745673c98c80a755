//! Single-pass lexer.
//!
//! The lexer walks the source once, left to right, and yields tokens lazily.
//! Whitespace and comments are skipped but still advance the position.
//! Multi-character operators win over their one-character prefixes
//! (maximal munch). The stream is fused: after the end-of-input token or the
//! first error it yields nothing.

use super::token::{twi_phrase, Keyword, Literal, Operator, Position, Punct, Token, TokenKind};
use std::iter::Peekable;
use std::str::CharIndices;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LexErrorKind {
    #[error("unexpected character {0:?}")]
    UnexpectedCharacter(char),
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated block comment")]
    UnterminatedComment,
    #[error("invalid escape sequence `\\{0}`")]
    InvalidEscape(String),
    #[error("integer literal `{0}` does not fit in 64 bits")]
    IntegerOutOfRange(String),
    #[error("float literal `{0}` is not finite")]
    FloatOutOfRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: {kind}")]
pub struct LexError {
    pub position: Position,
    pub kind: LexErrorKind,
}

impl LexError {
    fn new(position: Position, kind: LexErrorKind) -> Self {
        Self { position, kind }
    }
}

pub struct Lexer<'src> {
    source: &'src str,
    chars: Peekable<CharIndices<'src>>,
    line: u32,
    column: u32,
    finished: bool,
}

/// Tokenizes the whole source. The last token is always end-of-input.
pub fn tokenize(source: &str) -> Result<Vec<Token<'_>>, LexError> {
    Lexer::new(source).collect()
}

impl<'src> Lexer<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
            finished: false,
        }
    }

    fn position(&mut self) -> Position {
        let offset = self
            .chars
            .peek()
            .map(|(idx, _)| *idx)
            .unwrap_or(self.source.len());
        Position {
            line: self.line,
            column: self.column,
            offset,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().map(|(_, ch)| *ch)
    }

    /// Looks `n` characters past the next one without consuming anything.
    fn peek_nth(&mut self, n: usize) -> Option<char> {
        let (idx, _) = *self.chars.peek()?;
        self.source[idx..].chars().nth(n)
    }

    fn peek_second(&mut self) -> Option<char> {
        self.peek_nth(1)
    }

    fn bump(&mut self) -> Option<char> {
        let (_, ch) = self.chars.next()?;
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn skip_trivia(&mut self) -> Result<(), LexError> {
        loop {
            match self.peek() {
                Some(ch) if ch.is_whitespace() => {
                    self.bump();
                }
                Some('#') => {
                    while let Some(ch) = self.peek() {
                        if ch == '\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                Some('/') if self.peek_second() == Some('*') => {
                    let start = self.position();
                    self.bump();
                    self.bump();
                    loop {
                        match self.bump() {
                            Some('*') if self.peek() == Some('/') => {
                                self.bump();
                                break;
                            }
                            Some(_) => {}
                            None => {
                                return Err(LexError::new(
                                    start,
                                    LexErrorKind::UnterminatedComment,
                                ))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> Result<Token<'src>, LexError> {
        self.skip_trivia()?;
        let start = self.position();
        let Some(ch) = self.bump() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                lexeme: "",
                position: start,
            });
        };

        let kind = match ch {
            c if c.is_alphabetic() || c == '_' => {
                while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
                    self.bump();
                }
                let word = self.slice_from(start);
                if let Some(kind) = self.phrase(word) {
                    kind
                } else {
                    match Keyword::lookup(word) {
                        Some(keyword) => TokenKind::Keyword(keyword),
                        None => TokenKind::Ident,
                    }
                }
            }
            c if c.is_ascii_digit() => self.number(start)?,
            '"' => self.string(start)?,
            '(' => TokenKind::Punct(Punct::LParen),
            ')' => TokenKind::Punct(Punct::RParen),
            '{' => TokenKind::Punct(Punct::LBrace),
            '}' => TokenKind::Punct(Punct::RBrace),
            '[' => TokenKind::Punct(Punct::LBracket),
            ']' => TokenKind::Punct(Punct::RBracket),
            ',' => TokenKind::Punct(Punct::Comma),
            ';' => TokenKind::Punct(Punct::Semicolon),
            '+' => self.with_assign(Operator::Plus, Operator::PlusAssign),
            '-' => self.with_assign(Operator::Minus, Operator::MinusAssign),
            '*' => self.with_assign(Operator::Star, Operator::StarAssign),
            '/' => self.with_assign(Operator::Slash, Operator::SlashAssign),
            '%' => self.with_assign(Operator::Percent, Operator::PercentAssign),
            '=' => self.with_assign(Operator::Assign, Operator::EqEq),
            '!' => self.with_assign(Operator::Bang, Operator::NotEq),
            '<' => self.with_assign(Operator::Less, Operator::LessEq),
            '>' => self.with_assign(Operator::Greater, Operator::GreaterEq),
            '&' if self.eat('&') => TokenKind::Operator(Operator::AndAnd),
            '|' if self.eat('|') => TokenKind::Operator(Operator::OrOr),
            '.' if self.eat('.') => TokenKind::Operator(Operator::DotDot),
            other => {
                return Err(LexError::new(
                    start,
                    LexErrorKind::UnexpectedCharacter(other),
                ))
            }
        };

        Ok(Token {
            kind,
            lexeme: self.slice_from(start),
            position: start,
        })
    }

    /// Extends `first` into a Twi phrase when one space and the phrase's
    /// second word follow. Consumes nothing otherwise.
    fn phrase(&mut self, first: &str) -> Option<TokenKind> {
        let (idx, ch) = *self.chars.peek()?;
        if ch != ' ' {
            return None;
        }
        let rest = &self.source[idx + 1..];
        let len = rest
            .find(|c: char| !(c.is_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        let second = &rest[..len];
        let kind = twi_phrase(first, second)?;
        for _ in 0..=second.chars().count() {
            self.bump();
        }
        Some(kind)
    }

    fn slice_from(&mut self, start: Position) -> &'src str {
        let end = self.position().offset;
        &self.source[start.offset..end]
    }

    fn with_assign(&mut self, plain: Operator, with_eq: Operator) -> TokenKind {
        if self.eat('=') {
            TokenKind::Operator(with_eq)
        } else {
            TokenKind::Operator(plain)
        }
    }

    fn digits(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
    }

    fn number(&mut self, start: Position) -> Result<TokenKind, LexError> {
        self.digits();

        let fractional = self.peek() == Some('.')
            && matches!(self.peek_second(), Some(c) if c.is_ascii_digit());
        if !fractional {
            let text = self.slice_from(start);
            return text
                .parse::<i64>()
                .map(|value| TokenKind::Literal(Literal::Int(value)))
                .map_err(|_| {
                    LexError::new(start, LexErrorKind::IntegerOutOfRange(text.to_string()))
                });
        }

        self.bump();
        self.digits();
        if matches!(self.peek(), Some('e' | 'E')) {
            let exponent_follows = match self.peek_nth(1) {
                Some(c) if c.is_ascii_digit() => true,
                Some('+' | '-') => matches!(self.peek_nth(2), Some(c) if c.is_ascii_digit()),
                _ => false,
            };
            if exponent_follows {
                self.bump();
                if matches!(self.peek(), Some('+' | '-')) {
                    self.bump();
                }
                self.digits();
            }
        }

        let text = self.slice_from(start);
        match text.parse::<f64>() {
            Ok(value) if value.is_finite() => Ok(TokenKind::Literal(Literal::Float(value))),
            _ => Err(LexError::new(
                start,
                LexErrorKind::FloatOutOfRange(text.to_string()),
            )),
        }
    }

    fn string(&mut self, start: Position) -> Result<TokenKind, LexError> {
        let mut value = String::new();
        loop {
            let escape_at = self.position();
            match self.bump() {
                None | Some('\n') => {
                    return Err(LexError::new(start, LexErrorKind::UnterminatedString))
                }
                Some('"') => return Ok(TokenKind::Literal(Literal::Str(value))),
                Some('\\') => value.push(self.escape(escape_at, start)?),
                Some(ch) => value.push(ch),
            }
        }
    }

    fn escape(&mut self, at: Position, literal_start: Position) -> Result<char, LexError> {
        let invalid = |text: String| LexError::new(at, LexErrorKind::InvalidEscape(text));
        match self.bump() {
            Some('n') => Ok('\n'),
            Some('t') => Ok('\t'),
            Some('r') => Ok('\r'),
            Some('0') => Ok('\0'),
            Some('\\') => Ok('\\'),
            Some('"') => Ok('"'),
            Some('\'') => Ok('\''),
            Some('u') => {
                if !self.eat('{') {
                    return Err(invalid("u".to_string()));
                }
                let mut hex = String::new();
                while let Some(c) = self.peek() {
                    if c == '}' || hex.len() > 6 || c == '"' || c == '\n' {
                        break;
                    }
                    hex.push(c);
                    self.bump();
                }
                if !self.eat('}') || hex.is_empty() || hex.len() > 6 {
                    return Err(invalid(format!("u{{{hex}")));
                }
                u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or_else(|| invalid(format!("u{{{hex}}}")))
            }
            // A backslash right before the end of the line or input leaves
            // the literal open.
            None | Some('\n') => Err(LexError::new(
                literal_start,
                LexErrorKind::UnterminatedString,
            )),
            Some(other) => Err(invalid(other.to_string())),
        }
    }
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Result<Token<'src>, LexError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        let result = self.next_token();
        match &result {
            Ok(token) if token.is_eof() => self.finished = true,
            Err(_) => self.finished = true,
            Ok(_) => {}
        }
        Some(result)
    }
}

impl std::iter::FusedIterator for Lexer<'_> {}
