//! DSL to Python translation pipeline.
//!
//! `source → lexer → tokens → parser → AST → codegen → Translation`.
//! Every stage is a pure function of its input; nothing is cached between
//! calls, so translations may run concurrently without coordination.

pub mod ast;
pub mod codegen;
pub mod lexer;
pub mod parser;
pub mod token;

pub use codegen::{demangle, generate, mangle, CodeGenError, LineMapping, Translation};
pub use lexer::{tokenize, LexError, LexErrorKind, Lexer};
pub use parser::{parse, ParseError, ParseErrorKind};
pub use token::{Position, Span, Token, TokenKind};

use crate::observability::metrics;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TranslateError {
    #[error("syntax error at {0}")]
    Lex(#[from] LexError),
    #[error("syntax error at {0}")]
    Parse(#[from] ParseError),
    #[error("internal translator error at {0}")]
    CodeGen(#[from] CodeGenError),
}

/// Serializable form of a [`TranslateError`] for the request boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: &'static str,
    pub message: String,
    pub line: u32,
    pub column: u32,
    pub offset: usize,
}

impl TranslateError {
    pub fn position(&self) -> Position {
        match self {
            TranslateError::Lex(e) => e.position,
            TranslateError::Parse(e) => e.position,
            TranslateError::CodeGen(e) => e.span.start,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TranslateError::Lex(_) => "lex",
            TranslateError::Parse(_) => "parse",
            TranslateError::CodeGen(_) => "internal",
        }
    }

    pub fn report(&self) -> ErrorReport {
        let position = self.position();
        let message = match self {
            TranslateError::Lex(e) => e.kind.to_string(),
            TranslateError::Parse(e) => e.kind.to_string(),
            // Generator failures are invariant violations, not user errors.
            TranslateError::CodeGen(_) => "the translator could not handle this program".to_string(),
        };
        ErrorReport {
            kind: self.kind(),
            message,
            line: position.line,
            column: position.column,
            offset: position.offset,
        }
    }
}

/// Translates DSL source into a Python program.
pub fn translate(source: &str) -> Result<Translation, TranslateError> {
    let result = run_pipeline(source);
    match &result {
        Ok(translation) => {
            metrics::record_translation(true);
            log::debug!(
                "Translated {} bytes of source into {} lines",
                source.len(),
                translation.code.lines().count()
            );
        }
        Err(TranslateError::CodeGen(e)) => {
            metrics::record_translation(false);
            log::error!("Code generator rejected a parsed program: {}", e);
        }
        Err(e) => {
            metrics::record_translation(false);
            log::debug!("Translation rejected: {}", e);
        }
    }
    result
}

fn run_pipeline(source: &str) -> Result<Translation, TranslateError> {
    let tokens = tokenize(source)?;
    let program = parse(&tokens)?;
    Ok(generate(&program)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_carry_positions() {
        let err = translate("x = \"open").unwrap_err();
        assert_eq!(err.kind(), "lex");
        let report = err.report();
        assert_eq!((report.line, report.column), (1, 5));
        assert_eq!(report.message, "unterminated string literal");

        let err = translate("x = (1 +").unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert_eq!(err.to_string(), "syntax error at line 1, column 9: expected expression, found end of input");
    }

    #[test]
    fn translation_is_idempotent() {
        let source = "fn sq(n) { return n * n }\nfor i in 0..4 { print(sq(i)) }";
        assert_eq!(translate(source).unwrap(), translate(source).unwrap());
    }
}
