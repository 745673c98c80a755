//! Python code generation.
//!
//! Every DSL operator becomes a call into the `_rt_` runtime helpers that the
//! sandbox harness provides, so the generated program never leans on Python's
//! own arithmetic, comparison or truthiness rules. DSL identifiers are
//! renamed with [`mangle`] which keeps them clear of Python keywords,
//! builtins and the helpers.

use super::ast::{
    AssignOp, BinaryOp, Block, Builtin, CompareOp, Expr, Ident, LogicalOp, Program, Stmt, UnaryOp,
};
use super::token::Span;
use serde::Serialize;
use std::fmt::Write as _;
use thiserror::Error;

const INDENT: &str = "    ";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}: cannot generate code: {reason}", span.start)]
pub struct CodeGenError {
    pub span: Span,
    pub reason: String,
}

impl CodeGenError {
    fn new(span: Span, reason: impl Into<String>) -> Self {
        Self {
            span,
            reason: reason.into(),
        }
    }
}

/// Generated line that starts a DSL statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineMapping {
    pub generated_line: u32,
    pub source_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Translation {
    pub code: String,
    pub line_map: Vec<LineMapping>,
}

impl Translation {
    /// DSL line of the statement that produced `generated_line`.
    pub fn source_line_for(&self, generated_line: u32) -> Option<u32> {
        self.line_map
            .iter()
            .take_while(|m| m.generated_line <= generated_line)
            .last()
            .map(|m| m.source_line)
    }
}

pub fn generate(program: &Program) -> Result<Translation, CodeGenError> {
    let mut generator = Generator::default();
    for stmt in &program.body {
        generator.stmt(stmt)?;
    }
    Ok(Translation {
        code: generator.out,
        line_map: generator.line_map,
    })
}

/// Deterministic, injective renaming of DSL identifiers.
///
/// ASCII names get a `v_` prefix. Names containing anything else get a `w_`
/// prefix with `_` doubled and every other non-alphanumeric character
/// written as `_x<hex>_`.
pub fn mangle(name: &str) -> String {
    if name.is_ascii() {
        return format!("v_{name}");
    }
    let mut out = String::with_capacity(name.len() * 2);
    out.push_str("w_");
    for ch in name.chars() {
        match ch {
            '_' => out.push_str("__"),
            c if c.is_ascii_alphanumeric() => out.push(c),
            c => {
                let _ = write!(out, "_x{:x}_", c as u32);
            }
        }
    }
    out
}

/// Inverse of [`mangle`]; returns `None` for names it did not produce.
pub fn demangle(mangled: &str) -> Option<String> {
    if let Some(name) = mangled.strip_prefix("v_") {
        return Some(name.to_string());
    }
    let rest = mangled.strip_prefix("w_")?;
    let mut out = String::new();
    let mut chars = rest.chars();
    while let Some(ch) = chars.next() {
        if ch != '_' {
            out.push(ch);
            continue;
        }
        match chars.next()? {
            '_' => out.push('_'),
            'x' => {
                let hex: String = chars.by_ref().take_while(|c| *c != '_').collect();
                out.push(char::from_u32(u32::from_str_radix(&hex, 16).ok()?)?);
            }
            _ => return None,
        }
    }
    Some(out)
}

/// Python string literal that decodes to exactly `value`, ASCII only.
pub fn python_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            ' '..='~' => out.push(ch),
            c if (c as u32) <= 0xff => {
                let _ = write!(out, "\\x{:02x}", c as u32);
            }
            c if (c as u32) <= 0xffff => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => {
                let _ = write!(out, "\\U{:08x}", c as u32);
            }
        }
    }
    out.push('"');
    out
}

fn binary_helper(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "_rt_add",
        BinaryOp::Sub => "_rt_sub",
        BinaryOp::Mul => "_rt_mul",
        BinaryOp::Div => "_rt_div",
        BinaryOp::Rem => "_rt_mod",
    }
}

fn compare_helper(op: CompareOp) -> &'static str {
    match op {
        CompareOp::Eq => "_rt_eq",
        CompareOp::NotEq => "_rt_ne",
        CompareOp::Less => "_rt_lt",
        CompareOp::LessEq => "_rt_le",
        CompareOp::Greater => "_rt_gt",
        CompareOp::GreaterEq => "_rt_ge",
    }
}

#[derive(Default)]
struct Generator {
    out: String,
    lines: u32,
    indent: usize,
    line_map: Vec<LineMapping>,
    loop_depth: usize,
    in_function: bool,
}

impl Generator {
    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str(INDENT);
        }
        self.out.push_str(text);
        self.out.push('\n');
        self.lines += 1;
    }

    fn mark(&mut self, span: Span) {
        self.line_map.push(LineMapping {
            generated_line: self.lines + 1,
            source_line: span.start.line,
        });
    }

    fn suite(&mut self, stmts: &[Stmt]) -> Result<(), CodeGenError> {
        self.indent += 1;
        let before = self.lines;
        for stmt in stmts {
            self.stmt(stmt)?;
        }
        if self.lines == before {
            self.line("pass");
        }
        self.indent -= 1;
        Ok(())
    }

    fn loop_suite(&mut self, body: &Block) -> Result<(), CodeGenError> {
        self.loop_depth += 1;
        let result = self.suite(&body.stmts);
        self.loop_depth -= 1;
        result
    }

    fn stmt(&mut self, stmt: &Stmt) -> Result<(), CodeGenError> {
        match stmt {
            Stmt::Block(block) => {
                for inner in &block.stmts {
                    self.stmt(inner)?;
                }
            }
            Stmt::Expr(expr) => {
                self.mark(stmt.span());
                let code = self.expr(expr)?;
                self.line(&code);
            }
            Stmt::Assign {
                targets,
                op,
                value,
                span,
            } => {
                self.mark(*span);
                let code = self.assign(targets, *op, value, *span)?;
                self.line(&code);
            }
            Stmt::If {
                cond,
                then_block,
                else_branch,
                span,
            } => {
                self.mark(*span);
                self.if_chain("if", cond, then_block, else_branch.as_deref())?;
            }
            Stmt::While { cond, body, span } => {
                self.mark(*span);
                let cond = self.expr(cond)?;
                self.line(&format!("while _rt_truthy({cond}):"));
                self.loop_suite(body)?;
            }
            Stmt::For {
                var,
                start,
                end,
                body,
                span,
            } => {
                self.mark(*span);
                let var = self.binding(var)?;
                let start = self.expr(start)?;
                let end = self.expr(end)?;
                self.line(&format!("for {var} in _rt_range({start}, {end}):"));
                self.loop_suite(body)?;
            }
            Stmt::FnDecl {
                name,
                params,
                body,
                span,
            } => self.function(name, params, body, *span)?,
            Stmt::Return { value, span } => {
                self.mark(*span);
                let value = match value {
                    Some(expr) => self.expr(expr)?,
                    None => "None".to_string(),
                };
                if self.in_function {
                    self.line(&format!("return {value}"));
                } else {
                    self.line(&format!("_rt_return({value})"));
                }
            }
            Stmt::Break(span) | Stmt::Continue(span) => {
                let keyword = if matches!(stmt, Stmt::Break(_)) {
                    "break"
                } else {
                    "continue"
                };
                if self.loop_depth == 0 {
                    return Err(CodeGenError::new(
                        *span,
                        format!("`{keyword}` outside of a loop"),
                    ));
                }
                self.mark(*span);
                self.line(keyword);
            }
        }
        Ok(())
    }

    fn if_chain(
        &mut self,
        keyword: &str,
        cond: &Expr,
        then_block: &Block,
        else_branch: Option<&Stmt>,
    ) -> Result<(), CodeGenError> {
        let cond = self.expr(cond)?;
        self.line(&format!("{keyword} _rt_truthy({cond}):"));
        self.suite(&then_block.stmts)?;
        match else_branch {
            None => {}
            Some(Stmt::If {
                cond,
                then_block,
                else_branch,
                span,
            }) => {
                self.mark(*span);
                self.if_chain("elif", cond, then_block, else_branch.as_deref())?
            }
            Some(Stmt::Block(block)) => {
                self.line("else:");
                self.suite(&block.stmts)?;
            }
            Some(other) => {
                self.line("else:");
                self.suite(std::slice::from_ref(other))?;
            }
        }
        Ok(())
    }

    fn function(
        &mut self,
        name: &Ident,
        params: &[Ident],
        body: &Block,
        span: Span,
    ) -> Result<(), CodeGenError> {
        if self.in_function {
            return Err(CodeGenError::new(
                span,
                "functions can only be declared at top level",
            ));
        }
        self.mark(span);
        let fn_name = self.binding(name)?;
        let mut param_names = Vec::with_capacity(params.len());
        for param in params {
            let mangled = self.binding(param)?;
            if param_names.contains(&mangled) {
                return Err(CodeGenError::new(
                    param.span,
                    format!("duplicate parameter `{}`", param.name),
                ));
            }
            param_names.push(mangled);
        }
        self.line(&format!("def {fn_name}({}):", param_names.join(", ")));

        let outer_loops = std::mem::replace(&mut self.loop_depth, 0);
        self.in_function = true;
        let result = self.suite(&body.stmts);
        self.in_function = false;
        self.loop_depth = outer_loops;
        result?;

        self.line(&format!(
            "_rt_declare({fn_name}, {}, {})",
            python_string(&name.name),
            params.len()
        ));
        Ok(())
    }

    /// Name that a statement binds; builtins cannot be rebound.
    fn binding(&self, ident: &Ident) -> Result<String, CodeGenError> {
        if Builtin::lookup(&ident.name).is_some() {
            return Err(CodeGenError::new(
                ident.span,
                format!("builtin `{}` cannot be redefined", ident.name),
            ));
        }
        Ok(mangle(&ident.name))
    }

    fn assign(
        &mut self,
        targets: &[Expr],
        op: AssignOp,
        value: &Expr,
        span: Span,
    ) -> Result<String, CodeGenError> {
        let value = self.expr(value)?;
        match (targets, op) {
            ([], _) => Err(CodeGenError::new(span, "assignment without a target")),
            ([Expr::Ident(ident)], AssignOp::Set) => {
                Ok(format!("{} = {value}", self.binding(ident)?))
            }
            ([Expr::Index { target, index, .. }], AssignOp::Set) => {
                let target = self.expr(target)?;
                let index = self.expr(index)?;
                Ok(format!("_rt_setindex({target}, {index}, {value})"))
            }
            ([Expr::Ident(ident)], AssignOp::Update(bin)) => {
                let name = self.binding(ident)?;
                Ok(format!("{name} = {}({name}, {value})", binary_helper(bin)))
            }
            ([Expr::Index { target, index, .. }], AssignOp::Update(bin)) => {
                let target = self.expr(target)?;
                let index = self.expr(index)?;
                Ok(format!(
                    "_rt_setindex((_rt_t0 := {target}), (_rt_t1 := {index}), {}(_rt_index(_rt_t0, _rt_t1), {value}))",
                    binary_helper(bin)
                ))
            }
            ([single], _) => Err(CodeGenError::new(
                single.span(),
                "only variables and index expressions can be assigned to",
            )),
            (chain, AssignOp::Set) => {
                let mut names = Vec::with_capacity(chain.len());
                for target in chain {
                    match target {
                        Expr::Ident(ident) => names.push(self.binding(ident)?),
                        other => {
                            return Err(CodeGenError::new(
                                other.span(),
                                "chained assignment only supports variables",
                            ))
                        }
                    }
                }
                Ok(format!("{} = {value}", names.join(" = ")))
            }
            (_, AssignOp::Update(_)) => Err(CodeGenError::new(
                span,
                "compound assignment cannot be chained",
            )),
        }
    }

    fn expr(&mut self, expr: &Expr) -> Result<String, CodeGenError> {
        let code = match expr {
            Expr::Int(value, _) if *value < 0 => format!("({value})"),
            Expr::Int(value, _) => value.to_string(),
            Expr::Float(value, _) if value.is_nan() => "float(\"nan\")".to_string(),
            Expr::Float(value, _) if value.is_infinite() => {
                let sign = if *value < 0.0 { "-" } else { "" };
                format!("float(\"{sign}inf\")")
            }
            Expr::Float(value, _) if value.is_sign_negative() => format!("({value:?})"),
            Expr::Float(value, _) => format!("{value:?}"),
            Expr::Str(value, _) => python_string(value),
            Expr::Bool(true, _) => "True".to_string(),
            Expr::Bool(false, _) => "False".to_string(),
            Expr::Nil(_) => "None".to_string(),
            Expr::Ident(ident) => {
                if Builtin::lookup(&ident.name).is_some() {
                    return Err(CodeGenError::new(
                        ident.span,
                        format!("builtin `{}` can only be called", ident.name),
                    ));
                }
                mangle(&ident.name)
            }
            Expr::List(items, _) => format!("[{}]", self.expr_list(items)?),
            Expr::Binary { op, lhs, rhs, .. } => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                format!("{}({lhs}, {rhs})", binary_helper(*op))
            }
            Expr::Compare { op, lhs, rhs, .. } => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                format!("{}({lhs}, {rhs})", compare_helper(*op))
            }
            Expr::Logical { op, lhs, rhs, .. } => {
                let lhs = self.expr(lhs)?;
                let rhs = self.expr(rhs)?;
                let keyword = match op {
                    LogicalOp::And => "and",
                    LogicalOp::Or => "or",
                };
                format!("(_rt_truthy({lhs}) {keyword} _rt_truthy({rhs}))")
            }
            Expr::Unary { op, operand, .. } => {
                let operand = self.expr(operand)?;
                match op {
                    UnaryOp::Neg => format!("_rt_neg({operand})"),
                    UnaryOp::Not => format!("(not _rt_truthy({operand}))"),
                }
            }
            Expr::Call { callee, args, span } => self.call(callee, args, *span)?,
            Expr::Index { target, index, .. } => {
                let target = self.expr(target)?;
                let index = self.expr(index)?;
                format!("_rt_index({target}, {index})")
            }
        };
        Ok(code)
    }

    fn expr_list(&mut self, items: &[Expr]) -> Result<String, CodeGenError> {
        let mut parts = Vec::with_capacity(items.len());
        for item in items {
            parts.push(self.expr(item)?);
        }
        Ok(parts.join(", "))
    }

    fn call(&mut self, callee: &Expr, args: &[Expr], span: Span) -> Result<String, CodeGenError> {
        if let Expr::Ident(ident) = callee {
            if let Some(builtin) = Builtin::lookup(&ident.name) {
                if let Some(expected) = builtin.arity() {
                    if args.len() != expected {
                        return Err(CodeGenError::new(
                            span,
                            format!(
                                "builtin `{}` expects {expected} argument(s), found {}",
                                builtin.name(),
                                args.len()
                            ),
                        ));
                    }
                }
                return Ok(format!("_rt_{}({})", builtin.name(), self.expr_list(args)?));
            }
        }
        let callee = self.expr(callee)?;
        if args.is_empty() {
            Ok(format!("_rt_call({callee})"))
        } else {
            Ok(format!("_rt_call({callee}, {})", self.expr_list(args)?))
        }
    }
}
