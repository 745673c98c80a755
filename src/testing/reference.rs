//! Tree-walking interpreter for the DSL.
//!
//! Runs a parsed [`Program`] in-process with the same semantics and error
//! messages as the `_rt_` runtime the generated Python runs against. It is
//! the oracle for equivalence tests: a program translated and executed in
//! the sandbox must print the same output and end the same way as it does
//! here. Call depth and step count are bounded so the oracle itself always
//! terminates.

use crate::translate::ast::{
    AssignOp, BinaryOp, Block, Builtin, CompareOp, Expr, LogicalOp, Program, Stmt, UnaryOp,
};
use crate::translate::{parse, tokenize, TranslateError};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;
use std::thread;

/// Deepest nesting printed or compared before `value nested too deeply`.
const MAX_VALUE_DEPTH: usize = 100;
pub const MAX_CALL_DEPTH: usize = 256;
pub const DEFAULT_STEP_LIMIT: u64 = 5_000_000;

pub type List = Rc<RefCell<Vec<Value>>>;

#[derive(Debug)]
pub struct Function {
    pub name: String,
    params: Vec<String>,
    body: Vec<Stmt>,
    /// Parameters plus every name the body assigns.
    locals: HashSet<String>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    List(List),
    Func(Rc<Function>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Func(_) => "function",
        }
    }

    fn truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    fn number(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

/// A DSL runtime error, with the line of the innermost statement running
/// when it was raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeError {
    pub message: String,
    pub line: Option<u32>,
}

impl RuntimeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            line: None,
        }
    }

    fn at(mut self, line: u32) -> Self {
        self.line.get_or_insert(line);
        self
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "line {}: {}", line, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// How a program ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub stdout: String,
    /// Rendered top-level return value, or the error that stopped the run.
    pub result: Result<Option<String>, RuntimeError>,
}

type Eval<T> = Result<T, RuntimeError>;

enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    function: Rc<Function>,
    locals: HashMap<String, Value>,
}

pub struct Interpreter {
    globals: HashMap<String, Value>,
    frames: Vec<Frame>,
    stdout: String,
    steps: u64,
    step_limit: u64,
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new()
    }
}

/// Recursion depth is bounded by [`MAX_CALL_DEPTH`], not by the caller's
/// stack, so programs run on a thread of their own.
const INTERPRETER_STACK: usize = 64 * 1024 * 1024;

/// Parse and run `source`.
pub fn run(source: &str) -> Result<Outcome, TranslateError> {
    thread::scope(|scope| {
        let spawned = thread::Builder::new()
            .name("twibox-reference".to_string())
            .stack_size(INTERPRETER_STACK)
            .spawn_scoped(scope, || run_here(source));
        match spawned {
            Ok(handle) => handle
                .join()
                .unwrap_or_else(|payload| std::panic::resume_unwind(payload)),
            Err(e) => {
                log::warn!("Running reference interpreter inline: {}", e);
                run_here(source)
            }
        }
    })
}

fn run_here(source: &str) -> Result<Outcome, TranslateError> {
    let tokens = tokenize(source)?;
    let program = parse(&tokens)?;
    Ok(Interpreter::new().run(&program))
}

impl Interpreter {
    pub fn new() -> Self {
        Self {
            globals: HashMap::new(),
            frames: Vec::new(),
            stdout: String::new(),
            steps: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        }
    }

    pub fn with_step_limit(mut self, steps: u64) -> Self {
        self.step_limit = steps;
        self
    }

    pub fn run(mut self, program: &Program) -> Outcome {
        let result = match self.exec_all(&program.body) {
            Ok(Flow::Return(value)) => show(&value, 0, false).map(Some),
            Ok(_) => Ok(None),
            Err(e) => Err(e),
        };
        Outcome {
            stdout: self.stdout,
            result,
        }
    }

    fn exec_all(&mut self, stmts: &[Stmt]) -> Eval<Flow> {
        for stmt in stmts {
            match self.exec(stmt)? {
                Flow::Normal => {}
                flow => return Ok(flow),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_block(&mut self, block: &Block) -> Eval<Flow> {
        self.exec_all(&block.stmts)
    }

    fn exec(&mut self, stmt: &Stmt) -> Eval<Flow> {
        if let Stmt::Block(block) = stmt {
            return self.exec_block(block);
        }
        self.tick()?;
        let line = stmt.span().start.line;
        self.exec_inner(stmt).map_err(|e| e.at(line))
    }

    /// One unit of work: a statement or a loop iteration.
    fn tick(&mut self) -> Eval<()> {
        self.steps += 1;
        if self.steps > self.step_limit {
            return Err(RuntimeError::new("step limit exceeded"));
        }
        Ok(())
    }

    fn exec_inner(&mut self, stmt: &Stmt) -> Eval<Flow> {
        match stmt {
            Stmt::Block(block) => self.exec_block(block),
            Stmt::Expr(expr) => {
                self.eval(expr)?;
                Ok(Flow::Normal)
            }
            Stmt::Assign {
                targets, op, value, ..
            } => {
                self.assign(targets, *op, value)?;
                Ok(Flow::Normal)
            }
            Stmt::If {
                cond,
                then_block,
                else_branch,
                ..
            } => {
                if self.eval(cond)?.truthy() {
                    self.exec_block(then_block)
                } else {
                    match else_branch {
                        Some(stmt) => self.exec(stmt),
                        None => Ok(Flow::Normal),
                    }
                }
            }
            Stmt::While { cond, body, .. } => {
                while self.eval(cond)?.truthy() {
                    self.tick()?;
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For {
                var,
                start,
                end,
                body,
                ..
            } => {
                let start = self.eval(start)?;
                let end = self.eval(end)?;
                let (start, end) = match (&start, &end) {
                    (Value::Int(a), Value::Int(b)) => (*a, *b),
                    _ => {
                        return Err(RuntimeError::new(format!(
                            "range bounds must be ints, found {} and {}",
                            start.type_name(),
                            end.type_name()
                        )))
                    }
                };
                for i in start..end {
                    self.tick()?;
                    self.set_var(&var.name, Value::Int(i));
                    match self.exec_block(body)? {
                        Flow::Break => break,
                        Flow::Return(value) => return Ok(Flow::Return(value)),
                        Flow::Normal | Flow::Continue => {}
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::FnDecl {
                name, params, body, ..
            } => {
                let params: Vec<String> = params.iter().map(|p| p.name.clone()).collect();
                let mut locals: HashSet<String> = params.iter().cloned().collect();
                collect_assigned(&body.stmts, &mut locals);
                let function = Function {
                    name: name.name.clone(),
                    params,
                    body: body.stmts.clone(),
                    locals,
                };
                self.set_var(&name.name, Value::Func(Rc::new(function)));
                Ok(Flow::Normal)
            }
            Stmt::Return { value, .. } => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::Nil,
                };
                Ok(Flow::Return(value))
            }
            Stmt::Break(_) => Ok(Flow::Break),
            Stmt::Continue(_) => Ok(Flow::Continue),
        }
    }

    fn assign(&mut self, targets: &[Expr], op: AssignOp, value: &Expr) -> Eval<()> {
        match (targets, op) {
            ([Expr::Index { target, index, .. }], AssignOp::Set) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                let value = self.eval(value)?;
                set_index(&target, &index, value)
            }
            ([Expr::Index { target, index, .. }], AssignOp::Update(bin)) => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                let current = get_index(&target, &index)?;
                let rhs = self.eval(value)?;
                set_index(&target, &index, binary(bin, &current, &rhs)?)
            }
            ([Expr::Ident(ident)], AssignOp::Update(bin)) => {
                let current = self.get_var(&ident.name)?;
                let rhs = self.eval(value)?;
                let updated = binary(bin, &current, &rhs)?;
                self.set_var(&ident.name, updated);
                Ok(())
            }
            (targets, _) => {
                let value = self.eval(value)?;
                for target in targets {
                    if let Expr::Ident(ident) = target {
                        self.set_var(&ident.name, value.clone());
                    }
                }
                Ok(())
            }
        }
    }

    fn get_var(&self, name: &str) -> Eval<Value> {
        let value = match self.frames.last() {
            Some(frame) if frame.function.locals.contains(name) => frame.locals.get(name),
            _ => self.globals.get(name),
        };
        value
            .cloned()
            .ok_or_else(|| RuntimeError::new(format!("undefined variable '{}'", name)))
    }

    fn set_var(&mut self, name: &str, value: Value) {
        match self.frames.last_mut() {
            Some(frame) => {
                frame.locals.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
    }

    fn eval(&mut self, expr: &Expr) -> Eval<Value> {
        match expr {
            Expr::Int(n, _) => Ok(Value::Int(*n)),
            Expr::Float(f, _) => Ok(Value::Float(*f)),
            Expr::Str(s, _) => Ok(Value::Str(Rc::from(s.as_str()))),
            Expr::Bool(b, _) => Ok(Value::Bool(*b)),
            Expr::Nil(_) => Ok(Value::Nil),
            Expr::Ident(ident) => self.get_var(&ident.name),
            Expr::List(items, _) => {
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(self.eval(item)?);
                }
                Ok(Value::List(Rc::new(RefCell::new(values))))
            }
            Expr::Binary { op, lhs, rhs, .. } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                binary(*op, &lhs, &rhs)
            }
            Expr::Compare { op, lhs, rhs, .. } => {
                let lhs = self.eval(lhs)?;
                let rhs = self.eval(rhs)?;
                compare(*op, &lhs, &rhs).map(Value::Bool)
            }
            Expr::Logical { op, lhs, rhs, .. } => {
                let lhs = self.eval(lhs)?.truthy();
                let result = match op {
                    LogicalOp::And => lhs && self.eval(rhs)?.truthy(),
                    LogicalOp::Or => lhs || self.eval(rhs)?.truthy(),
                };
                Ok(Value::Bool(result))
            }
            Expr::Unary { op, operand, .. } => {
                let operand = self.eval(operand)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!operand.truthy())),
                    UnaryOp::Neg => match operand {
                        Value::Int(n) => n.checked_neg().map(Value::Int).ok_or_else(overflow),
                        Value::Float(f) => Ok(Value::Float(-f)),
                        other => Err(RuntimeError::new(format!("cannot negate {}", other.type_name()))),
                    },
                }
            }
            Expr::Call { callee, args, .. } => self.call(callee, args),
            Expr::Index { target, index, .. } => {
                let target = self.eval(target)?;
                let index = self.eval(index)?;
                get_index(&target, &index)
            }
        }
    }

    fn call(&mut self, callee: &Expr, args: &[Expr]) -> Eval<Value> {
        if let Expr::Ident(ident) = callee {
            if let Some(builtin) = Builtin::lookup(&ident.name) {
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval(arg)?);
                }
                return self.builtin(builtin, &values);
            }
        }

        let callee = self.eval(callee)?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }
        let function = match callee {
            Value::Func(function) => function,
            other => return Err(RuntimeError::new(format!("{} is not a function", other.type_name()))),
        };
        if values.len() != function.params.len() {
            return Err(RuntimeError::new(format!(
                "{}() takes {} argument(s) but {} were given",
                function.name,
                function.params.len(),
                values.len()
            )));
        }
        if self.frames.len() >= MAX_CALL_DEPTH {
            return Err(RuntimeError::new("maximum recursion depth exceeded"));
        }

        let locals = function.params.iter().cloned().zip(values).collect();
        self.frames.push(Frame {
            function: Rc::clone(&function),
            locals,
        });
        let flow = self.exec_all(&function.body);
        self.frames.pop();
        match flow? {
            Flow::Return(value) => Ok(value),
            _ => Ok(Value::Nil),
        }
    }

    fn builtin(&mut self, builtin: Builtin, args: &[Value]) -> Eval<Value> {
        let arg = || args.first().cloned().unwrap_or(Value::Nil);
        match builtin {
            Builtin::Print => {
                let mut parts = Vec::with_capacity(args.len());
                for value in args {
                    parts.push(show(value, 0, false)?);
                }
                self.stdout.push_str(&parts.join(" "));
                self.stdout.push('\n');
                Ok(Value::Nil)
            }
            Builtin::Len => match arg() {
                Value::Str(s) => Ok(Value::Int(s.chars().count() as i64)),
                Value::List(l) => Ok(Value::Int(l.borrow().len() as i64)),
                other => Err(RuntimeError::new(format!(
                    "len() expects a string or list, found {}",
                    other.type_name()
                ))),
            },
            Builtin::Str => Ok(Value::Str(Rc::from(show(&arg(), 0, false)?))),
            Builtin::Int => to_int(&arg()).map(Value::Int),
            Builtin::Float => to_float(&arg()).map(Value::Float),
            Builtin::Abs => match arg() {
                Value::Int(n) => n.checked_abs().map(Value::Int).ok_or_else(overflow),
                Value::Float(f) => Ok(Value::Float(f.abs())),
                other => Err(RuntimeError::new(format!(
                    "abs() expects a number, found {}",
                    other.type_name()
                ))),
            },
            Builtin::Push => match args {
                [Value::List(list), value] => {
                    list.borrow_mut().push(value.clone());
                    Ok(Value::Nil)
                }
                [other, _] => Err(RuntimeError::new(format!(
                    "push() expects a list, found {}",
                    other.type_name()
                ))),
                _ => Err(RuntimeError::new("push() takes 2 arguments")),
            },
            Builtin::Pop => match arg() {
                Value::List(list) => list
                    .borrow_mut()
                    .pop()
                    .ok_or_else(|| RuntimeError::new("pop() from an empty list")),
                other => Err(RuntimeError::new(format!(
                    "pop() expects a list, found {}",
                    other.type_name()
                ))),
            },
            Builtin::Type => Ok(Value::Str(Rc::from(arg().type_name()))),
        }
    }
}

/// Names a function body binds, which makes them local to each call.
fn collect_assigned(stmts: &[Stmt], names: &mut HashSet<String>) {
    for stmt in stmts {
        match stmt {
            Stmt::Assign { targets, .. } => {
                for target in targets {
                    if let Expr::Ident(ident) = target {
                        names.insert(ident.name.clone());
                    }
                }
            }
            Stmt::If {
                then_block,
                else_branch,
                ..
            } => {
                collect_assigned(&then_block.stmts, names);
                if let Some(else_branch) = else_branch {
                    collect_assigned(std::slice::from_ref(else_branch.as_ref()), names);
                }
            }
            Stmt::While { body, .. } => collect_assigned(&body.stmts, names),
            Stmt::For { var, body, .. } => {
                names.insert(var.name.clone());
                collect_assigned(&body.stmts, names);
            }
            Stmt::Block(block) => collect_assigned(&block.stmts, names),
            Stmt::FnDecl { name, .. } => {
                names.insert(name.name.clone());
            }
            Stmt::Expr(_) | Stmt::Return { .. } | Stmt::Break(_) | Stmt::Continue(_) => {}
        }
    }
}

fn overflow() -> RuntimeError {
    RuntimeError::new("integer overflow")
}

fn checked(n: i128) -> Eval<i64> {
    i64::try_from(n).map_err(|_| overflow())
}

fn unsupported(op: BinaryOp, a: &Value, b: &Value) -> RuntimeError {
    RuntimeError::new(format!(
        "unsupported operand types for {}: {} and {}",
        op.symbol(),
        a.type_name(),
        b.type_name()
    ))
}

fn binary(op: BinaryOp, a: &Value, b: &Value) -> Eval<Value> {
    if op == BinaryOp::Add {
        match (a, b) {
            (Value::Str(x), Value::Str(y)) => return Ok(Value::Str(Rc::from(format!("{x}{y}")))),
            (Value::List(x), Value::List(y)) => {
                let mut joined = x.borrow().clone();
                joined.extend(y.borrow().iter().cloned());
                return Ok(Value::List(Rc::new(RefCell::new(joined))));
            }
            _ => {}
        }
    }

    match (a, b) {
        (Value::Int(x), Value::Int(y)) => {
            let (x, y) = (*x as i128, *y as i128);
            let n = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div | BinaryOp::Rem if y == 0 => {
                    return Err(RuntimeError::new("division by zero"))
                }
                // i128 truncates toward zero and keeps the dividend's sign.
                BinaryOp::Div => x / y,
                BinaryOp::Rem => x % y,
            };
            checked(n).map(Value::Int)
        }
        _ => {
            let (x, y) = match (a.number(), b.number()) {
                (Some(x), Some(y)) => (x, y),
                _ => return Err(unsupported(op, a, b)),
            };
            let f = match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div | BinaryOp::Rem if y == 0.0 => {
                    return Err(RuntimeError::new("division by zero"))
                }
                BinaryOp::Div => x / y,
                BinaryOp::Rem => x % y,
            };
            Ok(Value::Float(f))
        }
    }
}

fn equal(a: &Value, b: &Value, depth: usize) -> Eval<bool> {
    if depth > MAX_VALUE_DEPTH {
        return Err(RuntimeError::new("value nested too deeply"));
    }
    let equal = match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => a.number() == b.number(),
        (Value::Nil, Value::Nil) => true,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::List(x), Value::List(y)) => {
            let (x, y) = (x.borrow(), y.borrow());
            if x.len() != y.len() {
                return Ok(false);
            }
            for (p, q) in x.iter().zip(y.iter()) {
                if !equal(p, q, depth + 1)? {
                    return Ok(false);
                }
            }
            true
        }
        (Value::Func(x), Value::Func(y)) => Rc::ptr_eq(x, y),
        _ => false,
    };
    Ok(equal)
}

fn compare(op: CompareOp, a: &Value, b: &Value) -> Eval<bool> {
    use std::cmp::Ordering;

    let ordering = match op {
        CompareOp::Eq => return equal(a, b, 0),
        CompareOp::NotEq => return equal(a, b, 0).map(|eq| !eq),
        _ => match (a, b) {
            (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
            (Value::Int(x), Value::Int(y)) => Some(x.cmp(y)),
            _ => match (a.number(), b.number()) {
                (Some(x), Some(y)) => x.partial_cmp(&y),
                _ => {
                    return Err(RuntimeError::new(format!(
                        "cannot compare {} and {} with {}",
                        a.type_name(),
                        b.type_name(),
                        op.symbol()
                    )))
                }
            },
        },
    };
    // NaN orders as unequal to everything.
    let Some(ordering) = ordering else {
        return Ok(false);
    };
    Ok(match op {
        CompareOp::Less => ordering == Ordering::Less,
        CompareOp::LessEq => ordering != Ordering::Greater,
        CompareOp::Greater => ordering == Ordering::Greater,
        CompareOp::GreaterEq => ordering != Ordering::Less,
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::NotEq => ordering != Ordering::Equal,
    })
}

fn index_of(index: &Value, len: usize) -> Eval<usize> {
    let i = match index {
        Value::Int(i) => *i,
        other => {
            return Err(RuntimeError::new(format!(
                "index must be an int, found {}",
                other.type_name()
            )))
        }
    };
    usize::try_from(i)
        .ok()
        .filter(|i| *i < len)
        .ok_or_else(|| RuntimeError::new("index out of range"))
}

fn get_index(target: &Value, index: &Value) -> Eval<Value> {
    match target {
        Value::List(list) => {
            let list = list.borrow();
            let i = index_of(index, list.len())?;
            Ok(list[i].clone())
        }
        Value::Str(s) => {
            let i = index_of(index, s.chars().count())?;
            let ch = s.chars().nth(i).map(String::from).unwrap_or_default();
            Ok(Value::Str(Rc::from(ch)))
        }
        other => Err(RuntimeError::new(format!("cannot index {}", other.type_name()))),
    }
}

fn set_index(target: &Value, index: &Value, value: Value) -> Eval<()> {
    match target {
        Value::List(list) => {
            let len = list.borrow().len();
            let i = index_of(index, len)?;
            list.borrow_mut()[i] = value;
            Ok(())
        }
        Value::Str(_) => Err(RuntimeError::new("strings are immutable")),
        other => Err(RuntimeError::new(format!("cannot index {}", other.type_name()))),
    }
}

fn trim(s: &str) -> &str {
    s.trim_matches(&[' ', '\t', '\n', '\r'][..])
}

fn unsigned_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn strip_sign(s: &str) -> &str {
    s.strip_prefix(&['+', '-'][..]).unwrap_or(s)
}

fn to_int(value: &Value) -> Eval<i64> {
    match value {
        Value::Int(n) => Ok(*n),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(RuntimeError::new(format!("cannot convert {} to int", format_float(*f))));
            }
            let t = f.trunc();
            // 2^63 is exactly representable; anything at or past it overflows.
            if !(-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&t) {
                return Err(overflow());
            }
            Ok(t as i64)
        }
        Value::Str(s) => {
            let text = trim(s);
            let body = strip_sign(text);
            if !unsigned_digits(body) {
                return Err(RuntimeError::new(format!("invalid integer: {}", quote(s))));
            }
            if body.trim_start_matches('0').len() > 19 {
                return Err(overflow());
            }
            let n: i128 = text.parse().map_err(|_| overflow())?;
            checked(n)
        }
        other => Err(RuntimeError::new(format!(
            "int() expects a number or string, found {}",
            other.type_name()
        ))),
    }
}

fn float_text(s: &str) -> bool {
    let body = strip_sign(s);
    let (mantissa, exponent) = match body.find(&['e', 'E'][..]) {
        Some(at) => (&body[..at], Some(&body[at + 1..])),
        None => (body, None),
    };
    if let Some(exponent) = exponent {
        if !unsigned_digits(strip_sign(exponent)) {
            return false;
        }
    }
    let (whole, frac) = mantissa.split_once('.').unwrap_or((mantissa, ""));
    if whole.is_empty() && frac.is_empty() {
        return false;
    }
    (whole.is_empty() || unsigned_digits(whole)) && (frac.is_empty() || unsigned_digits(frac))
}

fn to_float(value: &Value) -> Eval<f64> {
    match value {
        Value::Float(f) => Ok(*f),
        Value::Int(n) => Ok(*n as f64),
        Value::Str(s) => {
            let text = trim(s);
            if !float_text(text) {
                return Err(RuntimeError::new(format!("invalid float: {}", quote(s))));
            }
            text.parse()
                .map_err(|_| RuntimeError::new(format!("invalid float: {}", quote(s))))
        }
        other => Err(RuntimeError::new(format!(
            "float() expects a number or string, found {}",
            other.type_name()
        ))),
    }
}

/// String literal form used inside printed lists.
fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c if c < ' ' || c == '\x7f' => out.push_str(&format!("\\u{{{:x}}}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Shortest round-trip form, fixed notation for exponents in `-4..16`,
/// scientific with a signed two-digit exponent otherwise.
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }

    let sci = format!("{:e}", f);
    let (mantissa, exponent) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();

    if (-4..16).contains(&exponent) {
        let point = exponent + 1;
        let body = if point <= 0 {
            format!("0.{}{}", "0".repeat((-point) as usize), digits)
        } else if digits.len() <= point as usize {
            format!("{}{}.0", digits, "0".repeat(point as usize - digits.len()))
        } else {
            let (whole, frac) = digits.split_at(point as usize);
            format!("{}.{}", whole, frac)
        };
        return format!("{}{}", sign, body);
    }

    let (first, rest) = digits.split_at(1);
    let mantissa = if rest.is_empty() {
        first.to_string()
    } else {
        format!("{}.{}", first, rest)
    };
    let exp_sign = if exponent < 0 { '-' } else { '+' };
    format!("{}{}e{}{:02}", sign, mantissa, exp_sign, exponent.abs())
}

/// Printed form of a value; strings are quoted when nested in a list.
pub fn show(value: &Value, depth: usize, quoted: bool) -> Eval<String> {
    if depth > MAX_VALUE_DEPTH {
        return Err(RuntimeError::new("value nested too deeply"));
    }
    let text = match value {
        Value::Nil => "nil".to_string(),
        Value::Bool(true) => "true".to_string(),
        Value::Bool(false) => "false".to_string(),
        Value::Int(n) => n.to_string(),
        Value::Float(f) => format_float(*f),
        Value::Str(s) if quoted => quote(s),
        Value::Str(s) => s.to_string(),
        Value::List(list) => {
            let list = list.borrow();
            let mut parts = Vec::with_capacity(list.len());
            for item in list.iter() {
                parts.push(show(item, depth + 1, true)?);
            }
            format!("[{}]", parts.join(", "))
        }
        Value::Func(function) => format!("<fn {}>", function.name),
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(source: &str) -> String {
        let outcome = run(source).unwrap();
        assert!(outcome.result.is_ok(), "unexpected failure: {:?}", outcome.result);
        outcome.stdout
    }

    fn failure(source: &str) -> RuntimeError {
        run(source).unwrap().result.unwrap_err()
    }

    #[test]
    fn prints_like_the_runtime() {
        assert_eq!(output("x = 1 + 2; print(x)"), "3\n");
        assert_eq!(output("print(nil, true, [1, \"a\", nil], 1.0)"), "nil true [1, \"a\", nil] 1.0\n");
        assert_eq!(output("fn f() {}\nprint(f)"), "<fn f>\n");
        assert_eq!(output("ka(\"ɛte sɛn\")"), "ɛte sɛn\n");
    }

    #[test]
    fn floats_use_shortest_round_trip_form() {
        assert_eq!(format_float(1.0), "1.0");
        assert_eq!(format_float(0.1), "0.1");
        assert_eq!(format_float(1e16), "1e+16");
        assert_eq!(format_float(1e15), "1000000000000000.0");
        assert_eq!(format_float(0.0001), "0.0001");
        assert_eq!(format_float(0.00001), "1e-05");
        assert_eq!(format_float(-2.5), "-2.5");
        assert_eq!(format_float(-0.0), "-0.0");
        assert_eq!(format_float(123456789012345678.0), "1.2345678901234568e+17");
        assert_eq!(format_float(1.5e300), "1.5e+300");
        assert_eq!(format_float(f64::INFINITY), "inf");
    }

    #[test]
    fn integer_arithmetic_truncates_and_checks() {
        assert_eq!(output("print(7 / 2, -7 / 2, 7 % -3, -7 % 3)"), "3 -3 1 -1\n");
        assert_eq!(output("print(7 / 2.0, 1 + 0.5)"), "3.5 1.5\n");
        assert_eq!(failure("x = 1 / 0").message, "division by zero");
        assert_eq!(failure("x = 1.5 % 0.0").message, "division by zero");
        assert_eq!(failure("x = 9223372036854775807 + 1").message, "integer overflow");
        assert_eq!(
            failure("x = 1 + \"a\"").message,
            "unsupported operand types for +: int and string"
        );
        assert_eq!(
            failure("x = true + 1").message,
            "unsupported operand types for +: bool and int"
        );
    }

    #[test]
    fn equality_and_truthiness() {
        assert_eq!(output("print(1 == 1.0, [1, [2]] == [1, [2]], 1 == \"1\", nil == false)"), "true true false false\n");
        assert_eq!(output("if 0 { print(\"t\") } if \"\" { print(\"s\") } if nil { print(\"n\") }"), "t\ns\n");
        assert_eq!(
            failure("x = 1 < \"a\"").message,
            "cannot compare int and string with <"
        );
    }

    #[test]
    fn functions_scope_their_assignments() {
        let source = "x = 10\nfn f(n) { y = n + x; return y }\nprint(f(1))\nprint(x)";
        assert_eq!(output(source), "11\n10\n");

        let err = failure("fn f() { print(y); y = 1 }\nf()");
        assert_eq!(err.message, "undefined variable 'y'");
        assert_eq!(err.line, Some(1));

        assert_eq!(failure("print(z)").message, "undefined variable 'z'");
    }

    #[test]
    fn lists_are_shared_by_reference() {
        let source = "a = [1]\nb = a\npush(b, 2)\nprint(a, len(a), pop(a), a)";
        assert_eq!(output(source), "[1] 2 2 [1]\n");
        assert_eq!(failure("pop([])").message, "pop() from an empty list");
        assert_eq!(failure("x = [1][1]").message, "index out of range");
        assert_eq!(failure("s = \"ab\"\ns[0] = \"c\"").message, "strings are immutable");
    }

    #[test]
    fn self_containing_lists_hit_the_depth_limit() {
        assert_eq!(
            failure("a = []\npush(a, a)\nprint(a)").message,
            "value nested too deeply"
        );
    }

    #[test]
    fn conversions() {
        assert_eq!(output("print(int(\" -42 \"), int(3.9), float(\"1e3\"), str([\"x\"]))"), "-42 3 1000.0 [\"x\"]\n");
        assert_eq!(failure("int(\"4a\")").message, "invalid integer: \"4a\"");
        assert_eq!(failure("int(1.0e19)").message, "integer overflow");
        assert_eq!(failure("float(\".\")").message, "invalid float: \".\"");
        assert_eq!(output("print(type(1), type(\"\"), type([]), type(nil), type(1 == nil))"), "int string list nil bool\n");
    }

    #[test]
    fn top_level_return_ends_the_program() {
        let outcome = run("print(1)\nreturn [1, \"a\"]\nprint(2)").unwrap();
        assert_eq!(outcome.stdout, "1\n");
        assert_eq!(outcome.result, Ok(Some("[1, \"a\"]".to_string())));
        assert_eq!(run("x = 1").unwrap().result, Ok(None));
    }

    #[test]
    fn loops_and_ranges() {
        assert_eq!(
            output("for i in 0..5 { if i == 1 { continue } if i == 3 { break } print(i) }"),
            "0\n2\n"
        );
        assert_eq!(output("n = 0\nwhile n < 3 { n += 1 }\nprint(n)"), "3\n");
        assert_eq!(
            failure("for i in 0..2.5 { }").message,
            "range bounds must be ints, found int and float"
        );
    }

    #[test]
    fn unbounded_recursion_fails() {
        assert_eq!(
            failure("fn f(n) { return f(n + 1) }\nf(0)").message,
            "maximum recursion depth exceeded"
        );
    }

    fn run_with_step_limit(source: &'static str, steps: u64) -> RuntimeError {
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread::spawn(move || {
            let tokens = tokenize(source).unwrap();
            let program = parse(&tokens).unwrap();
            let outcome = Interpreter::new().with_step_limit(steps).run(&program);
            let _ = tx.send(outcome.result);
        });
        rx.recv_timeout(std::time::Duration::from_secs(5))
            .expect("interpreter ignored its step limit")
            .unwrap_err()
    }

    #[test]
    fn empty_loop_bodies_count_steps() {
        let err = run_with_step_limit("while true { }", 1_000);
        assert_eq!(err.message, "step limit exceeded");
        assert_eq!(err.line, Some(1));

        let err = run_with_step_limit("for i in 0..9223372036854775807 { }", 1_000);
        assert_eq!(err.message, "step limit exceeded");
    }

    #[test]
    fn call_depth_is_bounded_at_the_runtime_limit() {
        let deep = format!(
            "fn f(n) {{ if n == 0 {{ return 0 }} return 1 + f(n - 1) }}\nprint(f({}))",
            MAX_CALL_DEPTH - 1
        );
        assert_eq!(output(&deep), format!("{}\n", MAX_CALL_DEPTH - 1));

        let err = failure("fn f(n) { if n == 0 { return 0 } return 1 + f(n - 1) }\nprint(f(300))");
        assert_eq!(err.message, "maximum recursion depth exceeded");
        assert_eq!(err.line, Some(1));
    }

    #[test]
    fn errors_report_the_innermost_statement_line() {
        let err = failure("fn f(d) {\n  return 10 / d\n}\nx = 1\nprint(f(0))");
        assert_eq!(err.message, "division by zero");
        assert_eq!(err.line, Some(2));
    }
}
