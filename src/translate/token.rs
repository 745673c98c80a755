//! Token types produced by the lexer.

use serde::Serialize;
use std::fmt;

/// A location in DSL source text.
///
/// `line` and `column` are 1-based, `column` counts Unicode scalar values.
/// `offset` is the 0-based byte offset into the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
    pub offset: usize,
}

impl Position {
    pub const START: Position = Position {
        line: 1,
        column: 1,
        offset: 0,
    };
}

impl Default for Position {
    fn default() -> Self {
        Self::START
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, column {}", self.line, self.column)
    }
}

/// Half-open source range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct Span {
    pub start: Position,
    pub end: Position,
}

impl Span {
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn to(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Let,
    If,
    Else,
    While,
    For,
    In,
    Fn,
    Return,
    Break,
    Continue,
    And,
    Or,
    Not,
    True,
    False,
    Nil,
    /// Twi-only `kyekyere`, names the loop variable after the range.
    Bind,
}

impl Keyword {
    /// Resolves an identifier-shaped word, including the Twi aliases.
    pub fn lookup(word: &str) -> Option<Keyword> {
        let keyword = match word {
            "let" | "siesie" => Keyword::Let,
            "if" | "sɛ" => Keyword::If,
            "else" | "nanso" => Keyword::Else,
            "while" => Keyword::While,
            "for" => Keyword::For,
            "in" | "wɔ" => Keyword::In,
            "fn" => Keyword::Fn,
            "return" => Keyword::Return,
            "break" => Keyword::Break,
            "continue" => Keyword::Continue,
            "and" => Keyword::And,
            "or" => Keyword::Or,
            "not" => Keyword::Not,
            "true" | "nokware" => Keyword::True,
            "false" | "atɔkyɛ" => Keyword::False,
            "nil" => Keyword::Nil,
            "kyekyere" => Keyword::Bind,
            _ => return None,
        };
        Some(keyword)
    }

    /// Canonical English spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Keyword::Let => "let",
            Keyword::If => "if",
            Keyword::Else => "else",
            Keyword::While => "while",
            Keyword::For => "for",
            Keyword::In => "in",
            Keyword::Fn => "fn",
            Keyword::Return => "return",
            Keyword::Break => "break",
            Keyword::Continue => "continue",
            Keyword::And => "and",
            Keyword::Or => "or",
            Keyword::Not => "not",
            Keyword::True => "true",
            Keyword::False => "false",
            Keyword::Nil => "nil",
            Keyword::Bind => "kyekyere",
        }
    }
}

/// Two-word Twi phrases, written with a single space between the words.
/// The lexer prefers a phrase over its first word on its own.
pub fn twi_phrase(first: &str, second: &str) -> Option<TokenKind> {
    let kind = match (first, second) {
        ("yɛ", "adwuma") => TokenKind::Keyword(Keyword::Fn),
        ("bɔ", "mmirika") => TokenKind::Keyword(Keyword::For),
        ("ka", "ho") => TokenKind::Operator(Operator::Plus),
        // `sɔ hwɛ` is the print builtin, resolved by name like `ka`.
        ("sɔ", "hwɛ") => TokenKind::Ident,
        _ => return None,
    };
    Some(kind)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    PercentAssign,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    AndAnd,
    OrOr,
    Bang,
    DotDot,
}

impl Operator {
    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Plus => "+",
            Operator::Minus => "-",
            Operator::Star => "*",
            Operator::Slash => "/",
            Operator::Percent => "%",
            Operator::Assign => "=",
            Operator::PlusAssign => "+=",
            Operator::MinusAssign => "-=",
            Operator::StarAssign => "*=",
            Operator::SlashAssign => "/=",
            Operator::PercentAssign => "%=",
            Operator::EqEq => "==",
            Operator::NotEq => "!=",
            Operator::Less => "<",
            Operator::LessEq => "<=",
            Operator::Greater => ">",
            Operator::GreaterEq => ">=",
            Operator::AndAnd => "&&",
            Operator::OrOr => "||",
            Operator::Bang => "!",
            Operator::DotDot => "..",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punct {
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semicolon,
}

impl Punct {
    pub fn as_str(self) -> &'static str {
        match self {
            Punct::LParen => "(",
            Punct::RParen => ")",
            Punct::LBrace => "{",
            Punct::RBrace => "}",
            Punct::LBracket => "[",
            Punct::RBracket => "]",
            Punct::Comma => ",",
            Punct::Semicolon => ";",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    Ident,
    Keyword(Keyword),
    Literal(Literal),
    Operator(Operator),
    Punct(Punct),
    Eof,
}

impl TokenKind {
    /// Short human description used in "expected X, found Y" messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident => "identifier".to_string(),
            TokenKind::Keyword(kw) => format!("keyword `{}`", kw.as_str()),
            TokenKind::Literal(Literal::Int(_)) => "integer literal".to_string(),
            TokenKind::Literal(Literal::Float(_)) => "float literal".to_string(),
            TokenKind::Literal(Literal::Str(_)) => "string literal".to_string(),
            TokenKind::Operator(op) => format!("`{}`", op.as_str()),
            TokenKind::Punct(p) => format!("`{}`", p.as_str()),
            TokenKind::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub position: Position,
}

impl<'src> Token<'src> {
    /// Position just past the last character of the lexeme.
    pub fn end(&self) -> Position {
        let mut end = self.position;
        for ch in self.lexeme.chars() {
            if ch == '\n' {
                end.line += 1;
                end.column = 1;
            } else {
                end.column += 1;
            }
            end.offset += ch.len_utf8();
        }
        end
    }

    pub fn span(&self) -> Span {
        Span::new(self.position, self.end())
    }

    pub fn is_eof(&self) -> bool {
        matches!(self.kind, TokenKind::Eof)
    }

    pub fn describe(&self) -> String {
        match &self.kind {
            TokenKind::Ident => format!("identifier `{}`", self.lexeme),
            TokenKind::Literal(_) => format!("{} `{}`", self.kind.describe(), self.lexeme),
            other => other.describe(),
        }
    }
}
