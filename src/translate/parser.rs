//! Recursive-descent parser.
//!
//! Precedence, lowest to highest: assignment (statement level, right
//! associative) < `or` < `and` < comparison (non-associative) < `+ -` <
//! `* / %` < prefix `- ! not` < call and index < primary. The first error
//! aborts parsing.

use super::ast::{
    AssignOp, BinaryOp, Block, Builtin, CompareOp, Expr, Ident, LogicalOp, Program, Stmt, UnaryOp,
};
use super::token::{Keyword, Literal, Operator, Position, Punct, Span, Token, TokenKind};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("expected {expected}, found {found}")]
    Unexpected { expected: String, found: String },
    #[error("comparison operators cannot be chained; combine them with `and`")]
    ChainedComparison,
    #[error("only variables and index expressions can be assigned to")]
    InvalidAssignmentTarget,
    #[error("chained assignment only supports plain `=` between variables")]
    InvalidChainedAssignment,
    #[error("`{0}` used outside of a loop")]
    OutsideLoop(&'static str),
    #[error("functions can only be declared at top level")]
    NestedFunction,
    #[error("duplicate parameter `{0}`")]
    DuplicateParameter(String),
    #[error("`{0}` is a builtin and cannot be redefined")]
    BuiltinRedefinition(String),
    #[error("builtin `{0}` can only be called")]
    BuiltinNotCalled(String),
    #[error("nesting is too deep")]
    TooDeeplyNested,
    #[error("builtin `{name}` expects {expected} argument(s), found {found}")]
    BuiltinArity {
        name: String,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{position}: {kind}")]
pub struct ParseError {
    pub position: Position,
    pub kind: ParseErrorKind,
}

impl ParseError {
    fn new(position: Position, kind: ParseErrorKind) -> Self {
        Self { position, kind }
    }
}

type PResult<T> = Result<T, ParseError>;

/// Upper bound on expression nesting, counting every operator in a
/// left-associative chain as one level.
const MAX_EXPR_DEPTH: usize = 64;
const MAX_BLOCK_DEPTH: usize = 20;

/// Parses a token sequence into a program.
///
/// A missing trailing end-of-input token is tolerated.
pub fn parse(tokens: &[Token<'_>]) -> PResult<Program> {
    Parser::new(tokens).program()
}

struct Parser<'a, 'src> {
    tokens: &'a [Token<'src>],
    pos: usize,
    eof: Token<'src>,
    loop_depth: usize,
    in_function: bool,
    expr_depth: usize,
    block_depth: usize,
}

impl<'a, 'src> Parser<'a, 'src> {
    fn new(tokens: &'a [Token<'src>]) -> Self {
        let eof_position = tokens
            .last()
            .map(|t| if t.is_eof() { t.position } else { t.end() })
            .unwrap_or(Position::START);
        Self {
            tokens,
            pos: 0,
            eof: Token {
                kind: TokenKind::Eof,
                lexeme: "",
                position: eof_position,
            },
            loop_depth: 0,
            in_function: false,
            expr_depth: 0,
            block_depth: 0,
        }
    }

    // ------------------------------------------------------------------
    // Token cursor
    // ------------------------------------------------------------------

    fn peek(&self) -> &Token<'src> {
        self.tokens.get(self.pos).unwrap_or(&self.eof)
    }

    fn previous(&self) -> Option<&Token<'src>> {
        self.pos.checked_sub(1).and_then(|i| self.tokens.get(i))
    }

    fn advance(&mut self) -> Token<'src> {
        let token = self.peek().clone();
        if !token.is_eof() {
            self.pos += 1;
        }
        token
    }

    fn check_punct(&self, punct: Punct) -> bool {
        self.peek().kind == TokenKind::Punct(punct)
    }

    fn check_keyword(&self, keyword: Keyword) -> bool {
        self.peek().kind == TokenKind::Keyword(keyword)
    }

    fn check_operator(&self, op: Operator) -> bool {
        self.peek().kind == TokenKind::Operator(op)
    }

    fn unexpected<T>(&self, expected: &str) -> PResult<T> {
        let found = self.peek();
        Err(ParseError::new(
            found.position,
            ParseErrorKind::Unexpected {
                expected: expected.to_string(),
                found: found.describe(),
            },
        ))
    }

    fn expect_punct(&mut self, punct: Punct) -> PResult<Token<'src>> {
        if self.check_punct(punct) {
            Ok(self.advance())
        } else {
            self.unexpected(&format!("`{}`", punct.as_str()))
        }
    }

    fn expect_keyword(&mut self, keyword: Keyword) -> PResult<Token<'src>> {
        if self.check_keyword(keyword) {
            Ok(self.advance())
        } else {
            self.unexpected(&format!("`{}`", keyword.as_str()))
        }
    }

    fn expect_ident(&mut self, what: &str) -> PResult<Ident> {
        if self.peek().kind == TokenKind::Ident {
            let token = self.advance();
            Ok(Ident {
                name: token.lexeme.to_string(),
                span: token.span(),
            })
        } else {
            self.unexpected(what)
        }
    }

    /// Declared names (functions, parameters, loop variables) may not shadow builtins.
    fn declared_ident(&mut self, what: &str) -> PResult<Ident> {
        let ident = self.expect_ident(what)?;
        if Builtin::lookup(&ident.name).is_some() {
            return Err(ParseError::new(
                ident.span.start,
                ParseErrorKind::BuiltinRedefinition(ident.name),
            ));
        }
        Ok(ident)
    }

    /// Statement terminator: `;`, or the next token closes a block, ends the
    /// input, or starts on a later line.
    fn end_statement(&mut self) -> PResult<()> {
        if self.check_punct(Punct::Semicolon) {
            self.advance();
            return Ok(());
        }
        let next = self.peek();
        if next.is_eof() || next.kind == TokenKind::Punct(Punct::RBrace) {
            return Ok(());
        }
        let prev_line = self.previous().map(|t| t.end().line).unwrap_or(0);
        if next.position.line > prev_line {
            return Ok(());
        }
        self.unexpected("`;` or a new line")
    }

    fn descend(&mut self) -> PResult<()> {
        self.expr_depth += 1;
        if self.expr_depth > MAX_EXPR_DEPTH {
            return Err(ParseError::new(
                self.peek().position,
                ParseErrorKind::TooDeeplyNested,
            ));
        }
        Ok(())
    }

    fn span_from(&self, start: Position) -> Span {
        let end = self.previous().map(|t| t.end()).unwrap_or(start);
        Span::new(start, end)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    fn program(mut self) -> PResult<Program> {
        let mut body = Vec::new();
        while !self.peek().is_eof() {
            if let Some(stmt) = self.statement()? {
                body.push(stmt);
            }
        }
        Ok(Program { body })
    }

    fn statement(&mut self) -> PResult<Option<Stmt>> {
        let token = self.peek().clone();
        let stmt = match token.kind {
            TokenKind::Punct(Punct::Semicolon) => {
                self.advance();
                return Ok(None);
            }
            TokenKind::Punct(Punct::LBrace) => Stmt::Block(self.block()?),
            TokenKind::Keyword(Keyword::Let) => self.let_statement()?,
            TokenKind::Keyword(Keyword::If) => self.if_statement()?,
            TokenKind::Keyword(Keyword::While) => self.while_statement()?,
            TokenKind::Keyword(Keyword::For) => self.for_statement()?,
            TokenKind::Keyword(Keyword::Fn) => self.fn_declaration()?,
            TokenKind::Keyword(Keyword::Return) => self.return_statement()?,
            TokenKind::Keyword(Keyword::Break) | TokenKind::Keyword(Keyword::Continue) => {
                let keyword = if token.kind == TokenKind::Keyword(Keyword::Break) {
                    "break"
                } else {
                    "continue"
                };
                if self.loop_depth == 0 {
                    return Err(ParseError::new(
                        token.position,
                        ParseErrorKind::OutsideLoop(keyword),
                    ));
                }
                self.advance();
                self.end_statement()?;
                if keyword == "break" {
                    Stmt::Break(token.span())
                } else {
                    Stmt::Continue(token.span())
                }
            }
            _ => self.simple_statement()?,
        };
        Ok(Some(stmt))
    }

    fn block(&mut self) -> PResult<Block> {
        let open = self.expect_punct(Punct::LBrace)?;
        self.block_depth += 1;
        if self.block_depth > MAX_BLOCK_DEPTH {
            return Err(ParseError::new(
                open.position,
                ParseErrorKind::TooDeeplyNested,
            ));
        }
        let mut stmts = Vec::new();
        while !self.check_punct(Punct::RBrace) {
            if self.peek().is_eof() {
                return self.unexpected("`}`");
            }
            if let Some(stmt) = self.statement()? {
                stmts.push(stmt);
            }
        }
        self.advance();
        self.block_depth -= 1;
        Ok(Block {
            stmts,
            span: self.span_from(open.position),
        })
    }

    fn let_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().position;
        let target = self.expect_ident("variable name after `let`")?;
        if Builtin::lookup(&target.name).is_some() {
            return Err(ParseError::new(
                target.span.start,
                ParseErrorKind::BuiltinRedefinition(target.name),
            ));
        }
        if !self.check_operator(Operator::Assign) {
            return self.unexpected("`=`");
        }
        self.advance();
        let value = self.expression()?;
        self.end_statement()?;
        Ok(Stmt::Assign {
            targets: vec![Expr::Ident(target)],
            op: AssignOp::Set,
            value,
            span: self.span_from(start),
        })
    }

    fn if_statement(&mut self) -> PResult<Stmt> {
        let start = self.expect_keyword(Keyword::If)?.position;
        let cond = self.expression()?;
        let then_block = self.block()?;
        let else_branch = if self.check_keyword(Keyword::Else) {
            self.advance();
            if self.check_keyword(Keyword::If) {
                Some(Box::new(self.if_statement()?))
            } else {
                Some(Box::new(Stmt::Block(self.block()?)))
            }
        } else {
            None
        };
        Ok(Stmt::If {
            cond,
            then_block,
            else_branch,
            span: self.span_from(start),
        })
    }

    fn loop_body(&mut self) -> PResult<Block> {
        self.loop_depth += 1;
        let body = self.block();
        self.loop_depth -= 1;
        body
    }

    fn while_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().position;
        let cond = self.expression()?;
        let body = self.loop_body()?;
        Ok(Stmt::While {
            cond,
            body,
            span: self.span_from(start),
        })
    }

    fn for_statement(&mut self) -> PResult<Stmt> {
        let start = self.advance().position;
        // `bɔ mmirika wɔ a..b kyekyere i` names the variable after the range.
        let leading = if self.check_keyword(Keyword::In) {
            None
        } else {
            Some(self.declared_ident("loop variable")?)
        };
        self.expect_keyword(Keyword::In)?;
        let range_start = self.expression()?;
        if !self.check_operator(Operator::DotDot) {
            return self.unexpected("`..`");
        }
        self.advance();
        let range_end = self.expression()?;
        let var = match leading {
            Some(var) => var,
            None => {
                self.expect_keyword(Keyword::Bind)?;
                self.declared_ident("loop variable")?
            }
        };
        let body = self.loop_body()?;
        Ok(Stmt::For {
            var,
            start: range_start,
            end: range_end,
            body,
            span: self.span_from(start),
        })
    }

    fn fn_declaration(&mut self) -> PResult<Stmt> {
        let fn_token = self.advance();
        if self.in_function {
            return Err(ParseError::new(
                fn_token.position,
                ParseErrorKind::NestedFunction,
            ));
        }
        let name = self.declared_ident("function name")?;
        self.expect_punct(Punct::LParen)?;
        let mut params: Vec<Ident> = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                let param = self.declared_ident("parameter name")?;
                if params.iter().any(|p| p.name == param.name) {
                    return Err(ParseError::new(
                        param.span.start,
                        ParseErrorKind::DuplicateParameter(param.name),
                    ));
                }
                params.push(param);
                if self.check_punct(Punct::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;

        let outer_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.in_function = true;
        let body = self.block();
        self.in_function = false;
        self.loop_depth = outer_loops;

        Ok(Stmt::FnDecl {
            name,
            params,
            body: body?,
            span: self.span_from(fn_token.position),
        })
    }

    fn return_statement(&mut self) -> PResult<Stmt> {
        let token = self.advance();
        let next = self.peek();
        let bare = next.is_eof()
            || matches!(
                next.kind,
                TokenKind::Punct(Punct::Semicolon) | TokenKind::Punct(Punct::RBrace)
            )
            || next.position.line > token.position.line;
        let value = if bare { None } else { Some(self.expression()?) };
        self.end_statement()?;
        Ok(Stmt::Return {
            value,
            span: self.span_from(token.position),
        })
    }

    fn assign_op(&self) -> Option<AssignOp> {
        let TokenKind::Operator(op) = self.peek().kind else {
            return None;
        };
        let op = match op {
            Operator::Assign => AssignOp::Set,
            Operator::PlusAssign => AssignOp::Update(BinaryOp::Add),
            Operator::MinusAssign => AssignOp::Update(BinaryOp::Sub),
            Operator::StarAssign => AssignOp::Update(BinaryOp::Mul),
            Operator::SlashAssign => AssignOp::Update(BinaryOp::Div),
            Operator::PercentAssign => AssignOp::Update(BinaryOp::Rem),
            _ => return None,
        };
        Some(op)
    }

    fn simple_statement(&mut self) -> PResult<Stmt> {
        let head = self.peek();
        if head.kind == TokenKind::Ident && Builtin::lookup(head.lexeme).is_some() {
            let assigns = self.tokens.get(self.pos + 1).is_some_and(|next| {
                matches!(
                    next.kind,
                    TokenKind::Operator(
                        Operator::Assign
                            | Operator::PlusAssign
                            | Operator::MinusAssign
                            | Operator::StarAssign
                            | Operator::SlashAssign
                            | Operator::PercentAssign
                    )
                )
            });
            if assigns {
                return Err(ParseError::new(
                    head.position,
                    ParseErrorKind::BuiltinRedefinition(head.lexeme.to_string()),
                ));
            }
        }
        let expr = self.expression()?;
        let Some(op) = self.assign_op() else {
            self.end_statement()?;
            return Ok(Stmt::Expr(expr));
        };
        if !matches!(expr, Expr::Ident(_) | Expr::Index { .. }) {
            return Err(ParseError::new(
                expr.span().start,
                ParseErrorKind::InvalidAssignmentTarget,
            ));
        }
        self.advance();

        let start = expr.span().start;
        let mut targets = vec![expr];
        let mut value = self.expression()?;
        while let Some(next_op) = self.assign_op() {
            let chain_ok = op == AssignOp::Set
                && next_op == AssignOp::Set
                && matches!(value, Expr::Ident(_))
                && targets.iter().all(|t| matches!(t, Expr::Ident(_)));
            if !chain_ok {
                return Err(ParseError::new(
                    self.peek().position,
                    ParseErrorKind::InvalidChainedAssignment,
                ));
            }
            self.advance();
            targets.push(value);
            value = self.expression()?;
        }
        self.end_statement()?;
        Ok(Stmt::Assign {
            targets,
            op,
            value,
            span: self.span_from(start),
        })
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expression(&mut self) -> PResult<Expr> {
        let depth = self.expr_depth;
        self.descend()?;
        let expr = self.or_expr()?;
        self.expr_depth = depth;
        Ok(expr)
    }

    fn or_expr(&mut self) -> PResult<Expr> {
        let depth = self.expr_depth;
        let mut lhs = self.and_expr()?;
        while self.check_keyword(Keyword::Or) || self.check_operator(Operator::OrOr) {
            self.descend()?;
            self.advance();
            let rhs = self.and_expr()?;
            lhs = logical(LogicalOp::Or, lhs, rhs);
        }
        self.expr_depth = depth;
        Ok(lhs)
    }

    fn and_expr(&mut self) -> PResult<Expr> {
        let depth = self.expr_depth;
        let mut lhs = self.comparison()?;
        while self.check_keyword(Keyword::And) || self.check_operator(Operator::AndAnd) {
            self.descend()?;
            self.advance();
            let rhs = self.comparison()?;
            lhs = logical(LogicalOp::And, lhs, rhs);
        }
        self.expr_depth = depth;
        Ok(lhs)
    }

    fn compare_op(&self) -> Option<CompareOp> {
        let TokenKind::Operator(op) = self.peek().kind else {
            return None;
        };
        match op {
            Operator::EqEq => Some(CompareOp::Eq),
            Operator::NotEq => Some(CompareOp::NotEq),
            Operator::Less => Some(CompareOp::Less),
            Operator::LessEq => Some(CompareOp::LessEq),
            Operator::Greater => Some(CompareOp::Greater),
            Operator::GreaterEq => Some(CompareOp::GreaterEq),
            _ => None,
        }
    }

    fn comparison(&mut self) -> PResult<Expr> {
        let lhs = self.additive()?;
        let Some(op) = self.compare_op() else {
            return Ok(lhs);
        };
        self.advance();
        let rhs = self.additive()?;
        if self.compare_op().is_some() {
            return Err(ParseError::new(
                self.peek().position,
                ParseErrorKind::ChainedComparison,
            ));
        }
        let span = lhs.span().to(rhs.span());
        Ok(Expr::Compare {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            span,
        })
    }

    fn additive(&mut self) -> PResult<Expr> {
        let depth = self.expr_depth;
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.check_operator(Operator::Plus) {
                BinaryOp::Add
            } else if self.check_operator(Operator::Minus) {
                BinaryOp::Sub
            } else {
                self.expr_depth = depth;
                return Ok(lhs);
            };
            self.descend()?;
            self.advance();
            let rhs = self.multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn multiplicative(&mut self) -> PResult<Expr> {
        let depth = self.expr_depth;
        let mut lhs = self.unary()?;
        loop {
            let op = if self.check_operator(Operator::Star) {
                BinaryOp::Mul
            } else if self.check_operator(Operator::Slash) {
                BinaryOp::Div
            } else if self.check_operator(Operator::Percent) {
                BinaryOp::Rem
            } else {
                self.expr_depth = depth;
                return Ok(lhs);
            };
            self.descend()?;
            self.advance();
            let rhs = self.unary()?;
            lhs = binary(op, lhs, rhs);
        }
    }

    fn unary(&mut self) -> PResult<Expr> {
        let op = if self.check_operator(Operator::Minus) {
            UnaryOp::Neg
        } else if self.check_operator(Operator::Bang) || self.check_keyword(Keyword::Not) {
            UnaryOp::Not
        } else {
            return self.postfix();
        };
        self.descend()?;
        let start = self.advance().position;
        let operand = self.unary()?;
        self.expr_depth -= 1;
        let span = Span::new(start, operand.span().end);
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
            span,
        })
    }

    fn postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.primary()?;

        if let Expr::Ident(ident) = &expr {
            if let Some(builtin) = Builtin::lookup(&ident.name) {
                if !self.check_punct(Punct::LParen) {
                    return Err(ParseError::new(
                        ident.span.start,
                        ParseErrorKind::BuiltinNotCalled(ident.name.clone()),
                    ));
                }
                let position = ident.span.start;
                expr = self.call(expr)?;
                if let (Some(expected), Expr::Call { args, .. }) = (builtin.arity(), &expr) {
                    if args.len() != expected {
                        return Err(ParseError::new(
                            position,
                            ParseErrorKind::BuiltinArity {
                                name: builtin.name().to_string(),
                                expected,
                                found: args.len(),
                            },
                        ));
                    }
                }
            }
        }

        let depth = self.expr_depth;
        loop {
            if self.check_punct(Punct::LParen) {
                self.descend()?;
                expr = self.call(expr)?;
            } else if self.check_punct(Punct::LBracket) {
                self.descend()?;
                self.advance();
                let index = self.expression()?;
                self.expect_punct(Punct::RBracket)?;
                let span = self.span_from(expr.span().start);
                expr = Expr::Index {
                    target: Box::new(expr),
                    index: Box::new(index),
                    span,
                };
            } else {
                self.expr_depth = depth;
                return Ok(expr);
            }
        }
    }

    fn call(&mut self, callee: Expr) -> PResult<Expr> {
        self.expect_punct(Punct::LParen)?;
        let mut args = Vec::new();
        if !self.check_punct(Punct::RParen) {
            loop {
                args.push(self.expression()?);
                if self.check_punct(Punct::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect_punct(Punct::RParen)?;
        let span = self.span_from(callee.span().start);
        Ok(Expr::Call {
            callee: Box::new(callee),
            args,
            span,
        })
    }

    fn primary(&mut self) -> PResult<Expr> {
        let token = self.peek().clone();
        let span = token.span();
        let expr = match token.kind {
            TokenKind::Literal(Literal::Int(value)) => Expr::Int(value, span),
            TokenKind::Literal(Literal::Float(value)) => Expr::Float(value, span),
            TokenKind::Literal(Literal::Str(value)) => Expr::Str(value, span),
            TokenKind::Keyword(Keyword::True) => Expr::Bool(true, span),
            TokenKind::Keyword(Keyword::False) => Expr::Bool(false, span),
            TokenKind::Keyword(Keyword::Nil) => Expr::Nil(span),
            TokenKind::Ident => Expr::Ident(Ident {
                name: token.lexeme.to_string(),
                span,
            }),
            TokenKind::Punct(Punct::LParen) => {
                self.advance();
                let inner = self.expression()?;
                self.expect_punct(Punct::RParen)?;
                return Ok(inner);
            }
            TokenKind::Punct(Punct::LBracket) => return self.list(),
            _ => return self.unexpected("expression"),
        };
        self.advance();
        Ok(expr)
    }

    fn list(&mut self) -> PResult<Expr> {
        let open = self.advance();
        let mut items = Vec::new();
        while !self.check_punct(Punct::RBracket) {
            items.push(self.expression()?);
            if self.check_punct(Punct::Comma) {
                self.advance();
            } else if !self.check_punct(Punct::RBracket) {
                return self.unexpected("`,` or `]`");
            }
        }
        self.advance();
        Ok(Expr::List(items, self.span_from(open.position)))
    }
}

fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = lhs.span().to(rhs.span());
    Expr::Binary {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        span,
    }
}

fn logical(op: LogicalOp, lhs: Expr, rhs: Expr) -> Expr {
    let span = lhs.span().to(rhs.span());
    Expr::Logical {
        op,
        lhs: Box::new(lhs),
        rhs: Box::new(rhs),
        span,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::lexer::tokenize;

    fn parse_ok(source: &str) -> Program {
        let tokens = tokenize(source).unwrap();
        parse(&tokens).unwrap_or_else(|e| panic!("{source:?} failed: {e}"))
    }

    fn parse_err(source: &str) -> ParseError {
        let tokens = tokenize(source).unwrap();
        parse(&tokens).unwrap_err()
    }

    fn only_expr(source: &str) -> Expr {
        match parse_ok(source).body.remove(0) {
            Stmt::Expr(expr) => expr,
            other => panic!("expected expression statement, got {other:?}"),
        }
    }

    #[test]
    fn empty_program() {
        assert!(parse_ok("").body.is_empty());
        assert!(parse_ok(";;").body.is_empty());
    }

    #[test]
    fn multiplication_binds_tighter_than_addition() {
        let Expr::Binary { op, rhs, .. } = only_expr("1 + 2 * 3") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Add);
        assert!(matches!(*rhs, Expr::Binary { op: BinaryOp::Mul, .. }));
    }

    #[test]
    fn subtraction_is_left_associative() {
        let Expr::Binary { op, lhs, rhs, .. } = only_expr("10 - 4 - 3") else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Sub);
        assert!(matches!(*lhs, Expr::Binary { op: BinaryOp::Sub, .. }));
        assert!(matches!(*rhs, Expr::Int(3, _)));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let Expr::Logical { op, rhs, .. } = only_expr("a or b and c") else {
            panic!("expected logical");
        };
        assert_eq!(op, LogicalOp::Or);
        assert!(matches!(*rhs, Expr::Logical { op: LogicalOp::And, .. }));
    }

    #[test]
    fn prefix_not_binds_tighter_than_comparison() {
        let Expr::Compare { lhs, .. } = only_expr("not a == b") else {
            panic!("expected comparison");
        };
        assert!(matches!(*lhs, Expr::Unary { op: UnaryOp::Not, .. }));
    }

    #[test]
    fn comparison_is_non_associative() {
        let err = parse_err("a < b < c");
        assert_eq!(err.kind, ParseErrorKind::ChainedComparison);
        assert_eq!(err.position.column, 7);
    }

    #[test]
    fn assignment_is_right_associative_chain() {
        let program = parse_ok("a = b = 1 + 1");
        let Stmt::Assign { targets, value, .. } = &program.body[0] else {
            panic!("expected assignment");
        };
        assert_eq!(targets.len(), 2);
        assert!(matches!(value, Expr::Binary { .. }));
    }

    #[test]
    fn compound_assignment_cannot_chain() {
        let err = parse_err("a += b = 1");
        assert_eq!(err.kind, ParseErrorKind::InvalidChainedAssignment);
    }

    #[test]
    fn index_assignment_and_invalid_targets() {
        let program = parse_ok("xs[0] += 1");
        assert!(matches!(
            &program.body[0],
            Stmt::Assign { op: AssignOp::Update(BinaryOp::Add), .. }
        ));
        assert_eq!(
            parse_err("1 = 2").kind,
            ParseErrorKind::InvalidAssignmentTarget
        );
        assert_eq!(
            parse_err("f() = 2").kind,
            ParseErrorKind::InvalidAssignmentTarget
        );
    }

    #[test]
    fn statements_need_separator_on_same_line() {
        parse_ok("x = 1; print(x)");
        parse_ok("x = 1\nprint(x)");
        let err = parse_err("x = 1 print(x)");
        assert_eq!(
            err.kind,
            ParseErrorKind::Unexpected {
                expected: "`;` or a new line".to_string(),
                found: "identifier `print`".to_string(),
            }
        );
        assert_eq!(err.position.column, 7);
    }

    #[test]
    fn else_if_chain_binds_to_nearest_if() {
        let program = parse_ok("if a { x = 1 } else if b { x = 2 } else { x = 3 }");
        let Stmt::If { else_branch, .. } = &program.body[0] else {
            panic!("expected if");
        };
        let Some(inner) = else_branch.as_deref() else {
            panic!("missing else");
        };
        assert!(matches!(inner, Stmt::If { else_branch: Some(_), .. }));
    }

    #[test]
    fn braces_are_mandatory() {
        let err = parse_err("if x print(x)");
        assert!(matches!(err.kind, ParseErrorKind::Unexpected { .. }));
        assert_eq!(err.position.column, 6);
    }

    #[test]
    fn twi_keywords_parse() {
        let program = parse_ok("siesie x = nokware\nsɛ x { ka(\"yoo\") } nanso { ka(atɔkyɛ) }");
        assert_eq!(program.body.len(), 2);
        assert!(matches!(program.body[1], Stmt::If { .. }));
    }

    #[test]
    fn loops_and_functions() {
        let program = parse_ok(
            "fn fib(n) {\n  if n < 2 { return n }\n  return fib(n - 1) + fib(n - 2)\n}\nfor i in 0..10 { print(fib(i)) }",
        );
        assert!(matches!(&program.body[0], Stmt::FnDecl { params, .. } if params.len() == 1));
        assert!(matches!(&program.body[1], Stmt::For { .. }));
    }

    #[test]
    fn break_outside_loop_is_rejected() {
        assert_eq!(parse_err("break").kind, ParseErrorKind::OutsideLoop("break"));
        assert_eq!(
            parse_err("while true { fn f() { continue } }").kind,
            ParseErrorKind::OutsideLoop("continue")
        );
        assert_eq!(
            parse_err("fn f() { continue }").kind,
            ParseErrorKind::OutsideLoop("continue")
        );
        parse_ok("while true { if x { break } }");
    }

    #[test]
    fn functions_only_at_top_level() {
        assert_eq!(
            parse_err("fn f() { fn g() {} }").kind,
            ParseErrorKind::NestedFunction
        );
        assert_eq!(
            parse_err("fn f(a, a) {}").kind,
            ParseErrorKind::DuplicateParameter("a".to_string())
        );
    }

    #[test]
    fn builtins_must_be_called_with_right_arity() {
        assert_eq!(
            parse_err("x = print").kind,
            ParseErrorKind::BuiltinNotCalled("print".to_string())
        );
        assert_eq!(
            parse_err("fn len(x) {}").kind,
            ParseErrorKind::BuiltinRedefinition("len".to_string())
        );
        assert_eq!(
            parse_err("len = 1").kind,
            ParseErrorKind::BuiltinRedefinition("len".to_string())
        );
        assert_eq!(
            parse_err("let len = 1").kind,
            ParseErrorKind::BuiltinRedefinition("len".to_string())
        );
        let err = parse_err("x = 1\n  ka += 2");
        assert_eq!(err.kind, ParseErrorKind::BuiltinRedefinition("ka".to_string()));
        assert_eq!((err.position.line, err.position.column), (2, 3));
        assert_eq!(
            parse_err("push([1])").kind,
            ParseErrorKind::BuiltinArity {
                name: "push".to_string(),
                expected: 2,
                found: 1,
            }
        );
        parse_ok("print()");
        parse_ok("print(1, 2, 3)");
    }

    #[test]
    fn earliest_error_is_reported() {
        let err = parse_err("x = (1 + 2\ny = )");
        assert_eq!(err.position.line, 2);
        assert_eq!(err.position.column, 1);
    }

    #[test]
    fn unexpected_end_of_input() {
        let err = parse_err("while x {");
        assert_eq!(
            err.kind,
            ParseErrorKind::Unexpected {
                expected: "`}`".to_string(),
                found: "end of input".to_string(),
            }
        );
    }

    #[test]
    fn spans_cover_source() {
        let source = "total = price * 2";
        let program = parse_ok(source);
        let span = program.body[0].span();
        assert_eq!(&source[span.start.offset..span.end.offset], source);
    }

    #[test]
    fn deep_nesting_is_rejected_before_it_reaches_the_stack() {
        let nested = format!("x = {}1{}", "(".repeat(500), ")".repeat(500));
        assert_eq!(parse_err(&nested).kind, ParseErrorKind::TooDeeplyNested);

        let chain = format!("x = 1{}", " + 1".repeat(200));
        assert_eq!(parse_err(&chain).kind, ParseErrorKind::TooDeeplyNested);

        let blocks = format!("{}{}", "if x { ".repeat(30), "}".repeat(30));
        assert_eq!(parse_err(&blocks).kind, ParseErrorKind::TooDeeplyNested);

        parse_ok(&format!("x = 1{}", " + 1".repeat(40)));
    }

    #[test]
    fn list_literals_and_indexing() {
        let expr = only_expr("[1, \"two\", [3],][2][0]");
        let Expr::Index { target, .. } = expr else {
            panic!("expected index");
        };
        assert!(matches!(*target, Expr::Index { .. }));
    }
}
