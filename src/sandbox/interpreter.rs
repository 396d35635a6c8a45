//! 解释执行：AST + 持久作用域 -> 最后表达式的值
//!
//! 控制流（break / continue / return）走 Signal 返回值；异常、不可捕获的致命错误与
//! final_answer 短路统一走 Err(Unwind)。所有变量写入都落在调用方提供的作用域或函数栈帧中。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::sandbox::ast::{
    Arg, BinOp, BoolOp, Comprehension, Expr, FPart, FunctionBody, FunctionDef, Stmt, StmtKind,
    Target, UnaryOp,
};
use crate::sandbox::builtins;
use crate::sandbox::error::InterpreterError;
use crate::sandbox::ops;
use crate::sandbox::value::{Closure, Dict, Value};
use crate::tools::CapabilityRegistry;

/// 用户函数最大调用深度
const MAX_CALL_DEPTH: usize = 64;

/// 表达式求值的最大嵌套深度（跨函数调用累计）
const MAX_EVAL_DEPTH: usize = 1_000;

/// 每计费这么多次操作检查一次墙钟
const CLOCK_CHECK_INTERVAL: usize = 1_024;

/// 沙箱内可被 try/except 捕获的异常
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Exception {
    pub kind: String,
    pub message: String,
    pub line: Option<usize>,
}

impl Exception {
    pub fn new(kind: &str, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            message: message.into(),
            line: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new("TypeError", message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new("ValueError", message)
    }

    pub fn zero_division(message: impl Into<String>) -> Self {
        Self::new("ZeroDivisionError", message)
    }

    pub fn render(&self) -> String {
        if self.message.is_empty() {
            self.kind.clone()
        } else {
            format!("{}: {}", self.kind, self.message)
        }
    }
}

/// 非正常退出
#[derive(Debug)]
pub(crate) enum Unwind {
    Raise(Exception),
    /// 不可捕获：未授权导入、资源上限、覆盖能力名
    Fatal(InterpreterError),
    /// final_answer(...) 被调用
    Final(Value),
}

impl From<Exception> for Unwind {
    fn from(e: Exception) -> Self {
        Unwind::Raise(e)
    }
}

impl Unwind {
    /// 为尚未定位的异常补上行号（最内层语句优先）
    fn at(self, line: usize) -> Self {
        match self {
            Unwind::Raise(mut e) => {
                if e.line.is_none() {
                    e.line = Some(line);
                }
                Unwind::Raise(e)
            }
            other => other,
        }
    }
}

pub(crate) type Flow<T> = Result<T, Unwind>;

enum Signal {
    Normal,
    Break,
    Continue,
    Return(Value),
}

struct Frame {
    vars: HashMap<String, Value>,
    /// 函数帧阻断向外查找；推导式帧透明
    function: bool,
}

enum PlaceRoot {
    Var(String),
    Temp(Value),
}

/// 可写位置：变量名 + 下标路径（`a[0]['k']`）
struct Place {
    root: PlaceRoot,
    path: Vec<Value>,
}

/// print 输出缓冲；超过上限后丢弃后续输出
pub(crate) struct PrintBuffer {
    text: String,
    limit: usize,
    truncated: bool,
}

impl PrintBuffer {
    pub fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: false,
        }
    }

    pub fn push(&mut self, s: &str) {
        if self.truncated {
            return;
        }
        let room = self.limit.saturating_sub(self.text.len());
        if s.len() <= room {
            self.text.push_str(s);
            return;
        }
        let mut cut = room;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        self.text.push_str(&s[..cut]);
        self.truncated = true;
    }

    pub fn into_logs(self) -> String {
        if self.truncated {
            format!(
                "{}\n_Print outputs were over {} characters, so they have been truncated._\n",
                self.text, self.limit
            )
        } else {
            self.text
        }
    }
}

pub(crate) struct Interpreter<'a> {
    globals: &'a mut HashMap<String, Value>,
    frames: Vec<Frame>,
    capabilities: &'a CapabilityRegistry,
    authorized_imports: &'a [String],
    pub(crate) print: PrintBuffer,
    operations: usize,
    max_operations: usize,
    /// 截止时刻与对应的时限
    deadline: Option<(Instant, Duration)>,
    next_clock_check: usize,
    depth: usize,
    eval_depth: usize,
    line: usize,
    /// 正在处理的异常（供裸 `raise` 重新抛出）
    handling: Vec<Exception>,
}

impl<'a> Interpreter<'a> {
    pub fn new(
        globals: &'a mut HashMap<String, Value>,
        capabilities: &'a CapabilityRegistry,
        authorized_imports: &'a [String],
        max_print_len: usize,
        max_operations: usize,
    ) -> Self {
        Self {
            globals,
            frames: Vec::new(),
            capabilities,
            authorized_imports,
            print: PrintBuffer::new(max_print_len),
            operations: 0,
            max_operations,
            deadline: None,
            next_clock_check: CLOCK_CHECK_INTERVAL,
            depth: 0,
            eval_depth: 0,
            line: 1,
            handling: Vec::new(),
        }
    }

    /// 限制墙钟执行时间；计费时按间隔检查
    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.deadline = Some((Instant::now() + limit, limit));
        self
    }

    /// 顶层执行；返回最后一条语句的值（仅当它是表达式语句时，否则为 None）
    pub fn run_module(&mut self, body: &[Stmt]) -> Flow<Value> {
        let mut last = Value::None;
        for stmt in body {
            last = Value::None;
            if let StmtKind::Expr(expr) = &stmt.kind {
                self.line = stmt.line;
                self.tick()?;
                last = self.eval(expr).map_err(|u| u.at(stmt.line))?;
                continue;
            }
            match self.exec_stmt(stmt)? {
                Signal::Normal => {}
                Signal::Break | Signal::Continue => {
                    return Err(Unwind::Fatal(InterpreterError::syntax(
                        stmt.line,
                        "'break' or 'continue' outside loop",
                    )))
                }
                Signal::Return(_) => {
                    return Err(Unwind::Fatal(InterpreterError::syntax(
                        stmt.line,
                        "'return' outside function",
                    )))
                }
            }
        }
        Ok(last)
    }

    pub fn current_line(&self) -> usize {
        self.line
    }

    fn tick(&mut self) -> Flow<()> {
        self.charge(1)
    }

    /// 按工作量计费：产出 n 个元素的操作计 n 次
    pub(crate) fn charge(&mut self, units: usize) -> Flow<()> {
        self.operations = self.operations.saturating_add(units);
        if self.operations > self.max_operations {
            return Err(Unwind::Fatal(InterpreterError::Limit(format!(
                "Reached the max number of operations of {}. Maybe there is an infinite loop somewhere in the code, or you're just asking too many calculations.",
                self.max_operations
            ))));
        }
        if let Some((deadline, limit)) = self.deadline {
            if self.operations >= self.next_clock_check {
                self.next_clock_check = self.operations.saturating_add(CLOCK_CHECK_INTERVAL);
                if Instant::now() >= deadline {
                    return Err(Unwind::Fatal(InterpreterError::Limit(format!(
                        "Code execution exceeded the time limit of {:.1} seconds.",
                        limit.as_secs_f64()
                    ))));
                }
            }
        }
        Ok(())
    }

    fn binop(&mut self, op: BinOp, l: Value, r: Value) -> Flow<Value> {
        self.charge(ops::result_len(op, &l, &r))?;
        Ok(ops::binop(op, l, r)?)
    }

    // ---------------------------------------------------------------- 作用域

    fn lookup(&self, name: &str) -> Flow<Value> {
        for frame in self.frames.iter().rev() {
            if let Some(v) = frame.vars.get(name) {
                return Ok(v.clone());
            }
            if frame.function {
                break;
            }
        }
        if let Some(v) = self.globals.get(name) {
            return Ok(v.clone());
        }
        if self.capabilities.contains(name) {
            return Ok(Value::Capability(name.to_string()));
        }
        if builtins::is_builtin(name) {
            return Ok(Value::Builtin(name.to_string()));
        }
        Err(Exception::new("NameError", format!("The variable `{}` is not defined.", name)).into())
    }

    fn var_mut(&mut self, name: &str) -> Option<&mut Value> {
        let mut found = None;
        for (idx, frame) in self.frames.iter().enumerate().rev() {
            if frame.vars.contains_key(name) {
                found = Some(idx);
                break;
            }
            if frame.function {
                break;
            }
        }
        match found {
            Some(idx) => self.frames[idx].vars.get_mut(name),
            None => self.globals.get_mut(name),
        }
    }

    fn store(&mut self, name: &str, value: Value) -> Flow<()> {
        if name == "final_answer" || self.capabilities.contains(name) {
            return Err(Unwind::Fatal(InterpreterError::Runtime {
                line: self.line,
                message: format!(
                    "Cannot assign to name '{}': doing this would erase the existing tool!",
                    name
                ),
            }));
        }
        match self.frames.last_mut() {
            Some(frame) => {
                frame.vars.insert(name.to_string(), value);
            }
            None => {
                self.globals.insert(name.to_string(), value);
            }
        }
        Ok(())
    }

    /// 外层可见的局部变量快照（闭包捕获）
    fn visible_locals(&self) -> HashMap<String, Value> {
        let mut start = 0;
        for (idx, frame) in self.frames.iter().enumerate().rev() {
            if frame.function {
                start = idx;
                break;
            }
        }
        let mut vars = HashMap::new();
        for frame in &self.frames[start..] {
            for (k, v) in &frame.vars {
                vars.insert(k.clone(), v.clone());
            }
        }
        vars
    }

    // ---------------------------------------------------------------- 语句

    fn exec_block(&mut self, body: &[Stmt]) -> Flow<Signal> {
        for stmt in body {
            match self.exec_stmt(stmt)? {
                Signal::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Signal::Normal)
    }

    fn exec_stmt(&mut self, stmt: &Stmt) -> Flow<Signal> {
        self.line = stmt.line;
        self.tick()?;
        self.exec_kind(&stmt.kind).map_err(|u| u.at(stmt.line))
    }

    fn exec_kind(&mut self, kind: &StmtKind) -> Flow<Signal> {
        match kind {
            StmtKind::Expr(expr) => {
                self.eval(expr)?;
            }
            StmtKind::Assign { targets, value } => {
                let value = self.eval(value)?;
                for target in targets {
                    self.assign(target, value.clone())?;
                }
            }
            StmtKind::AugAssign { target, op, value } => match target {
                Target::Name(name) => {
                    let current = self.lookup(name)?;
                    let rhs = self.eval(value)?;
                    let updated = self.binop(*op, current, rhs)?;
                    self.store(name, updated)?;
                }
                Target::Subscript { value: container, index } => {
                    let mut place = self.place_of(container)?;
                    let key = self.eval(index)?;
                    let rhs = self.eval(value)?;
                    let current = self.with_place(&mut place, |slot| ops::get_item(slot, &key))?;
                    let updated = self.binop(*op, current, rhs)?;
                    self.with_place(&mut place, move |slot| ops::set_item(slot, key, updated))?;
                }
                Target::Tuple(_) => {
                    return Err(Exception::new(
                        "SyntaxError",
                        "illegal expression for augmented assignment",
                    )
                    .into())
                }
            },
            StmtKind::If { test, body, orelse } => {
                let branch = if self.eval(test)?.truthy() { body } else { orelse };
                return self.exec_block(branch);
            }
            StmtKind::For { target, iter, body } => {
                let iterable = self.eval(iter)?;
                for item in ops::iterate(iterable)? {
                    self.assign(target, item)?;
                    match self.exec_block(body)? {
                        Signal::Break => break,
                        Signal::Normal | Signal::Continue => {}
                        ret @ Signal::Return(_) => return Ok(ret),
                    }
                }
            }
            StmtKind::While { test, body } => loop {
                self.tick()?;
                if !self.eval(test)?.truthy() {
                    break;
                }
                match self.exec_block(body)? {
                    Signal::Break => break,
                    Signal::Normal | Signal::Continue => {}
                    ret @ Signal::Return(_) => return Ok(ret),
                }
            },
            StmtKind::Break => return Ok(Signal::Break),
            StmtKind::Continue => return Ok(Signal::Continue),
            StmtKind::Pass => {}
            StmtKind::FunctionDef(def) => {
                let function = self.make_function(def)?;
                self.store(&def.name, function)?;
            }
            StmtKind::Return(value) => {
                let value = match value {
                    Some(expr) => self.eval(expr)?,
                    None => Value::None,
                };
                return Ok(Signal::Return(value));
            }
            StmtKind::Import(aliases) => {
                for alias in aliases {
                    self.import(&alias.name)?;
                    let binding = match &alias.asname {
                        Some(asname) => asname.clone(),
                        None => alias.name.split('.').next().unwrap_or(&alias.name).to_string(),
                    };
                    self.store(&binding, Value::Module(alias.name.clone()))?;
                }
            }
            StmtKind::ImportFrom { module, names } => {
                self.import(module)?;
                for alias in names {
                    let value = builtins::module_attr(module, &alias.name).map_err(|_| {
                        Exception::new(
                            "ImportError",
                            format!("cannot import name '{}' from '{}'", alias.name, module),
                        )
                    })?;
                    let binding = alias.asname.as_ref().unwrap_or(&alias.name);
                    self.store(binding, value)?;
                }
            }
            StmtKind::Try { body, handlers, finalbody } => {
                let outcome = match self.exec_block(body) {
                    Err(Unwind::Raise(exc)) => {
                        match handlers.iter().find(|h| handler_matches(&h.types, &exc)) {
                            Some(handler) => {
                                if let Some(name) = &handler.name {
                                    self.store(name, Value::Str(exc.message.clone()))?;
                                }
                                self.handling.push(exc);
                                let result = self.exec_block(&handler.body);
                                self.handling.pop();
                                result
                            }
                            None => Err(Unwind::Raise(exc)),
                        }
                    }
                    other => other,
                };
                if !finalbody.is_empty() {
                    match self.exec_block(finalbody)? {
                        Signal::Normal => {}
                        other => return Ok(other),
                    }
                }
                return outcome;
            }
            StmtKind::Raise(expr) => {
                let exc = match expr {
                    Some(expr) => self.build_exception(expr)?,
                    None => self.handling.last().cloned().ok_or_else(|| {
                        Exception::new("RuntimeError", "No active exception to reraise")
                    })?,
                };
                return Err(Unwind::Raise(exc));
            }
            StmtKind::Assert { test, msg } => {
                if !self.eval(test)?.truthy() {
                    let message = match msg {
                        Some(m) => self.eval(m)?.to_string(),
                        None => String::new(),
                    };
                    return Err(Exception::new("AssertionError", message).into());
                }
            }
        }
        Ok(Signal::Normal)
    }

    fn build_exception(&mut self, expr: &Expr) -> Flow<Exception> {
        match expr {
            Expr::Call { func, args } => {
                if let Expr::Name(name) = func.as_ref() {
                    if builtins::is_exception_class(name) {
                        let (positional, _) = self.eval_args(args)?;
                        let message = positional.first().map(|v| v.to_string()).unwrap_or_default();
                        return Ok(Exception::new(name, message));
                    }
                }
                let value = self.eval(expr)?;
                Ok(Exception::new("Exception", value.to_string()))
            }
            Expr::Name(name) if builtins::is_exception_class(name) => Ok(Exception::new(name, "")),
            other => {
                let value = self.eval(other)?;
                Ok(Exception::new("Exception", value.to_string()))
            }
        }
    }

    fn import(&mut self, module: &str) -> Flow<()> {
        if !is_import_authorized(module, self.authorized_imports) {
            return Err(Unwind::Fatal(InterpreterError::ImportDenied {
                module: module.to_string(),
                authorized: self.authorized_imports.to_vec(),
            }));
        }
        if !builtins::MODULES.contains(&module) {
            return Err(Exception::new(
                "ModuleNotFoundError",
                format!("No module named '{}' is available in this sandbox", module),
            )
            .into());
        }
        Ok(())
    }

    fn assign(&mut self, target: &Target, value: Value) -> Flow<()> {
        match target {
            Target::Name(name) => self.store(name, value),
            Target::Tuple(targets) => {
                let values = ops::iterate(value)?;
                if values.len() != targets.len() {
                    let message = if values.len() > targets.len() {
                        format!("too many values to unpack (expected {})", targets.len())
                    } else {
                        format!(
                            "not enough values to unpack (expected {}, got {})",
                            targets.len(),
                            values.len()
                        )
                    };
                    return Err(Exception::value_error(message).into());
                }
                for (t, v) in targets.iter().zip(values) {
                    self.assign(t, v)?;
                }
                Ok(())
            }
            Target::Subscript { value: container, index } => {
                if let Expr::Slice { .. } = index {
                    return Err(Exception::type_error("slice assignment is not supported").into());
                }
                let mut place = self.place_of(container)?;
                let key = self.eval(index)?;
                self.with_place(&mut place, move |slot| ops::set_item(slot, key, value))
            }
        }
    }

    fn place_of(&mut self, expr: &Expr) -> Flow<Place> {
        match expr {
            Expr::Name(name) => {
                if self.var_mut(name).is_some() {
                    Ok(Place {
                        root: PlaceRoot::Var(name.clone()),
                        path: Vec::new(),
                    })
                } else {
                    Ok(Place {
                        root: PlaceRoot::Temp(self.lookup(name)?),
                        path: Vec::new(),
                    })
                }
            }
            Expr::Subscript { value, index } if !matches!(index.as_ref(), Expr::Slice { .. }) => {
                let mut place = self.place_of(value)?;
                place.path.push(self.eval(index)?);
                Ok(place)
            }
            other => Ok(Place {
                root: PlaceRoot::Temp(self.eval(other)?),
                path: Vec::new(),
            }),
        }
    }

    fn with_place<R>(
        &mut self,
        place: &mut Place,
        f: impl FnOnce(&mut Value) -> Result<R, Exception>,
    ) -> Flow<R> {
        let root = match &mut place.root {
            PlaceRoot::Var(name) => match self.var_mut(name) {
                Some(v) => v,
                None => {
                    return Err(Exception::new(
                        "NameError",
                        format!("The variable `{}` is not defined.", name),
                    )
                    .into())
                }
            },
            PlaceRoot::Temp(v) => v,
        };
        let mut slot = root;
        for key in &place.path {
            slot = ops::item_mut(slot, key)?;
        }
        Ok(f(slot)?)
    }

    // ---------------------------------------------------------------- 表达式

    pub(crate) fn eval(&mut self, expr: &Expr) -> Flow<Value> {
        self.tick()?;
        if self.eval_depth >= MAX_EVAL_DEPTH {
            return Err(Exception::new("RecursionError", "maximum recursion depth exceeded").into());
        }
        self.eval_depth += 1;
        let result = self.eval_expr(expr);
        self.eval_depth -= 1;
        result
    }

    fn eval_expr(&mut self, expr: &Expr) -> Flow<Value> {
        match expr {
            Expr::None => Ok(Value::None),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Int(i) => Ok(Value::Int(*i)),
            Expr::Float(f) => Ok(Value::Float(*f)),
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::FString(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part {
                        FPart::Lit(s) => out.push_str(s),
                        FPart::Expr { expr, repr, spec } => {
                            let value = self.eval(expr)?;
                            let text = if *repr {
                                value.repr()
                            } else if let Some(spec) = spec {
                                builtins::format_value(&value, spec)?
                            } else {
                                value.to_string()
                            };
                            out.push_str(&text);
                        }
                    }
                }
                Ok(Value::Str(out))
            }
            Expr::Name(name) => self.lookup(name),
            Expr::List(items) => Ok(Value::List(self.eval_all(items)?)),
            Expr::Tuple(items) => Ok(Value::Tuple(self.eval_all(items)?)),
            Expr::Set(items) => {
                let values = self.eval_all(items)?;
                Ok(Value::List(ops::dedup(values)?))
            }
            Expr::Dict(entries) => {
                let mut dict = Dict::new();
                for (k, v) in entries {
                    let key = self.eval(k)?;
                    ops::check_hashable(&key)?;
                    let value = self.eval(v)?;
                    dict.insert(key, value);
                }
                Ok(Value::Dict(dict))
            }
            Expr::ListComp { elt, generators } => {
                let mut out = Vec::new();
                self.comprehension(generators, &mut |interp: &mut Self| {
                    out.push(interp.eval(elt)?);
                    Ok(())
                })?;
                Ok(Value::List(out))
            }
            Expr::SetComp { elt, generators } => {
                let mut out = Vec::new();
                self.comprehension(generators, &mut |interp: &mut Self| {
                    out.push(interp.eval(elt)?);
                    Ok(())
                })?;
                Ok(Value::List(ops::dedup(out)?))
            }
            Expr::DictComp { key, value, generators } => {
                let mut dict = Dict::new();
                self.comprehension(generators, &mut |interp: &mut Self| {
                    let k = interp.eval(key)?;
                    ops::check_hashable(&k)?;
                    let v = interp.eval(value)?;
                    dict.insert(k, v);
                    Ok(())
                })?;
                Ok(Value::Dict(dict))
            }
            Expr::BinOp { .. } => self.eval_binop_chain(expr),
            Expr::Unary { op, operand } => {
                let v = self.eval(operand)?;
                unary(*op, v)
            }
            Expr::BoolOp { .. } => self.eval_boolop_chain(expr),
            Expr::Compare { left, ops: comparisons } => {
                let mut lhs = self.eval(left)?;
                for (op, rexpr) in comparisons {
                    let rhs = self.eval(rexpr)?;
                    if !ops::compare_op(*op, &lhs, &rhs)? {
                        return Ok(Value::Bool(false));
                    }
                    lhs = rhs;
                }
                Ok(Value::Bool(true))
            }
            Expr::IfExp { test, body, orelse } => {
                if self.eval(test)?.truthy() {
                    self.eval(body)
                } else {
                    self.eval(orelse)
                }
            }
            Expr::Lambda(def) => self.make_function(def),
            Expr::Call { func, args } => self.eval_call(func, args),
            Expr::Attribute { value, attr } => {
                check_attribute(attr)?;
                match self.eval(value)? {
                    Value::Module(module) => Ok(builtins::module_attr(&module, attr)?),
                    other => Err(Exception::new(
                        "AttributeError",
                        format!(
                            "'{}' object has no attribute '{}' (methods must be called directly)",
                            other.type_name(),
                            attr
                        ),
                    )
                    .into()),
                }
            }
            Expr::Subscript { value, index } => {
                let container = self.eval(value)?;
                if let Expr::Slice { lower, upper, step } = index.as_ref() {
                    let lower = self.slice_bound(lower.as_deref())?;
                    let upper = self.slice_bound(upper.as_deref())?;
                    let step = self.slice_bound(step.as_deref())?;
                    return Ok(ops::slice(&container, lower, upper, step)?);
                }
                let key = self.eval(index)?;
                Ok(ops::get_item(&container, &key)?)
            }
            Expr::Slice { .. } => Err(Exception::type_error("slice used outside of a subscript").into()),
        }
    }

    /// 左结合链 `a + b - c ...` 沿左脊迭代求值，长链不占用栈深度
    fn eval_binop_chain(&mut self, expr: &Expr) -> Flow<Value> {
        let mut links = Vec::new();
        let mut leaf = expr;
        while let Expr::BinOp { op, left, right } = leaf {
            links.push((*op, right.as_ref()));
            leaf = left.as_ref();
        }
        self.charge(links.len().saturating_sub(1))?;
        let mut acc = self.eval(leaf)?;
        for (op, right) in links.into_iter().rev() {
            let r = self.eval(right)?;
            acc = self.binop(op, acc, r)?;
        }
        Ok(acc)
    }

    /// `a and b or c ...` 同样沿左脊展开，逐层短路
    fn eval_boolop_chain(&mut self, expr: &Expr) -> Flow<Value> {
        let mut links = Vec::new();
        let mut leaf = expr;
        while let Expr::BoolOp { op, left, right } = leaf {
            links.push((*op, right.as_ref()));
            leaf = left.as_ref();
        }
        self.charge(links.len().saturating_sub(1))?;
        let mut acc = self.eval(leaf)?;
        for (op, right) in links.into_iter().rev() {
            acc = match op {
                BoolOp::And if !acc.truthy() => acc,
                BoolOp::Or if acc.truthy() => acc,
                _ => self.eval(right)?,
            };
        }
        Ok(acc)
    }

    fn eval_all(&mut self, items: &[Expr]) -> Flow<Vec<Value>> {
        items.iter().map(|e| self.eval(e)).collect()
    }

    fn slice_bound(&mut self, expr: Option<&Expr>) -> Flow<Option<i64>> {
        let Some(expr) = expr else {
            return Ok(None);
        };
        match self.eval(expr)? {
            Value::None => Ok(None),
            v => v.as_i64().map(Some).ok_or_else(|| {
                Exception::type_error("slice indices must be integers or None").into()
            }),
        }
    }

    fn comprehension(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> Flow<()>,
    ) -> Flow<()> {
        self.frames.push(Frame {
            vars: HashMap::new(),
            function: false,
        });
        let result = self.comprehension_level(generators, emit);
        self.frames.pop();
        result
    }

    fn comprehension_level(
        &mut self,
        generators: &[Comprehension],
        emit: &mut dyn FnMut(&mut Self) -> Flow<()>,
    ) -> Flow<()> {
        let Some((first, rest)) = generators.split_first() else {
            return emit(self);
        };
        let iterable = self.eval(&first.iter)?;
        'items: for item in ops::iterate(iterable)? {
            self.tick()?;
            self.assign(&first.target, item)?;
            for cond in &first.ifs {
                if !self.eval(cond)?.truthy() {
                    continue 'items;
                }
            }
            self.comprehension_level(rest, emit)?;
        }
        Ok(())
    }

    fn eval_args(&mut self, args: &[Arg]) -> Flow<(Vec<Value>, Vec<(String, Value)>)> {
        let mut positional = Vec::new();
        let mut keywords: Vec<(String, Value)> = Vec::new();
        for arg in args {
            match arg {
                Arg::Positional(expr) => positional.push(self.eval(expr)?),
                Arg::Keyword(name, expr) => {
                    if keywords.iter().any(|(k, _)| k == name) {
                        return Err(Exception::new(
                            "SyntaxError",
                            format!("keyword argument repeated: {}", name),
                        )
                        .into());
                    }
                    let value = self.eval(expr)?;
                    keywords.push((name.clone(), value));
                }
            }
        }
        Ok((positional, keywords))
    }

    fn eval_call(&mut self, func: &Expr, args: &[Arg]) -> Flow<Value> {
        if let Expr::Attribute { value, attr } = func {
            return self.call_attribute(value, attr, args);
        }
        let callee = self.eval(func)?;
        let (positional, keywords) = self.eval_args(args)?;
        self.call_value(callee, positional, keywords)
    }

    /// `recv.method(...)`：模块函数、原地修改方法（写回变量）或普通方法
    fn call_attribute(&mut self, receiver: &Expr, attr: &str, args: &[Arg]) -> Flow<Value> {
        check_attribute(attr)?;
        if builtins::is_mutating_method(attr) {
            let mut place = self.place_of(receiver)?;
            if let PlaceRoot::Temp(Value::Module(module)) = &place.root {
                let module = module.clone();
                let (positional, keywords) = self.eval_args(args)?;
                return builtins::call_module(self, &module, attr, positional, keywords);
            }
            let (positional, keywords) = self.eval_args(args)?;
            if matches!(attr, "sort" | "reverse") {
                let len = self.with_place(&mut place, |slot| Ok(ops::element_count(slot)))?;
                self.charge(len)?;
            }
            let mut recv = self.with_place(&mut place, |slot| Ok(std::mem::take(slot)))?;
            let result = builtins::call_method(self, &mut recv, attr, positional, keywords);
            self.with_place(&mut place, move |slot| {
                *slot = recv;
                Ok(())
            })?;
            return result;
        }
        let mut recv = self.eval(receiver)?;
        let (positional, keywords) = self.eval_args(args)?;
        if let Value::Module(module) = &recv {
            let module = module.clone();
            return builtins::call_module(self, &module, attr, positional, keywords);
        }
        let out = builtins::call_method(self, &mut recv, attr, positional, keywords)?;
        self.charge(ops::element_count(&out))?;
        Ok(out)
    }

    pub(crate) fn call_value(
        &mut self,
        callee: Value,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Flow<Value> {
        match callee {
            Value::Function(function) => self.call_function(&function, positional, keywords),
            Value::Builtin(name) => {
                let out = builtins::call_builtin(self, &name, positional, keywords)?;
                // range 已在分配前计费
                if name != "range" {
                    self.charge(ops::element_count(&out))?;
                }
                Ok(out)
            }
            Value::Capability(name) => self.call_capability(&name, positional, keywords),
            other => Err(Exception::type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))
            .into()),
        }
    }

    fn call_capability(
        &mut self,
        name: &str,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Flow<Value> {
        let capability = self.capabilities.get(name).ok_or_else(|| {
            Exception::new("NameError", format!("The variable `{}` is not defined.", name))
        })?;
        let positional = positional.iter().map(Value::to_json).collect();
        let keywords = keywords
            .into_iter()
            .map(|(k, v)| (k, v.to_json()))
            .collect();
        let args = capability.bind(positional, keywords).map_err(Exception::type_error)?;
        let result = capability
            .invoke(args)
            .map_err(|e| Exception::new("RuntimeError", e))?;
        Ok(Value::from_json(&result))
    }

    fn make_function(&mut self, def: &Arc<FunctionDef>) -> Flow<Value> {
        let mut defaults = HashMap::new();
        for param in &def.params {
            if let Some(expr) = &param.default {
                let value = self.eval(expr)?;
                defaults.insert(param.name.clone(), value);
            }
        }
        let captured = if self.frames.is_empty() {
            HashMap::new()
        } else {
            self.visible_locals()
        };
        Ok(Value::Function(Arc::new(Closure {
            def: def.clone(),
            captured,
            defaults,
        })))
    }

    fn call_function(
        &mut self,
        function: &Arc<Closure>,
        positional: Vec<Value>,
        keywords: Vec<(String, Value)>,
    ) -> Flow<Value> {
        let def = &function.def;
        if self.depth >= MAX_CALL_DEPTH {
            return Err(Exception::new("RecursionError", "maximum recursion depth exceeded").into());
        }
        if positional.len() > def.params.len() {
            return Err(Exception::type_error(format!(
                "{}() takes {} positional arguments but {} were given",
                def.name,
                def.params.len(),
                positional.len()
            ))
            .into());
        }
        let mut vars = function.captured.clone();
        let mut bound: Vec<&str> = Vec::with_capacity(def.params.len());
        for (param, value) in def.params.iter().zip(positional) {
            vars.insert(param.name.clone(), value);
            bound.push(&param.name);
        }
        for (key, value) in keywords {
            let Some(param) = def.params.iter().find(|p| p.name == key) else {
                return Err(Exception::type_error(format!(
                    "{}() got an unexpected keyword argument '{}'",
                    def.name, key
                ))
                .into());
            };
            if bound.contains(&param.name.as_str()) {
                return Err(Exception::type_error(format!(
                    "{}() got multiple values for argument '{}'",
                    def.name, key
                ))
                .into());
            }
            vars.insert(key, value);
            bound.push(&param.name);
        }
        for param in &def.params {
            if bound.contains(&param.name.as_str()) {
                continue;
            }
            match function.defaults.get(&param.name) {
                Some(default) => {
                    vars.insert(param.name.clone(), default.clone());
                }
                None => {
                    return Err(Exception::type_error(format!(
                        "{}() missing 1 required positional argument: '{}'",
                        def.name, param.name
                    ))
                    .into())
                }
            }
        }

        self.frames.push(Frame { vars, function: true });
        self.depth += 1;
        let result = match &def.body {
            FunctionBody::Block(body) => self.exec_block(body).map(|signal| match signal {
                Signal::Return(value) => value,
                _ => Value::None,
            }),
            FunctionBody::Expr(expr) => self.eval(expr),
        };
        self.depth -= 1;
        self.frames.pop();
        result
    }
}

fn unary(op: UnaryOp, value: Value) -> Flow<Value> {
    let symbol = match op {
        UnaryOp::Not => return Ok(Value::Bool(!value.truthy())),
        UnaryOp::Neg => "-",
        UnaryOp::Pos => "+",
    };
    match (op, &value) {
        (UnaryOp::Neg, Value::Float(f)) => Ok(Value::Float(-f)),
        (UnaryOp::Pos, Value::Float(f)) => Ok(Value::Float(*f)),
        (UnaryOp::Neg, v) if v.as_i64().is_some() => v
            .as_i64()
            .and_then(i64::checked_neg)
            .map(Value::Int)
            .ok_or_else(|| Exception::new("OverflowError", "integer result too large").into()),
        (UnaryOp::Pos, v) if v.as_i64().is_some() => Ok(Value::Int(v.as_i64().unwrap_or(0))),
        _ => Err(Exception::type_error(format!(
            "bad operand type for unary {}: '{}'",
            symbol,
            value.type_name()
        ))
        .into()),
    }
}

fn check_attribute(attr: &str) -> Flow<()> {
    if attr.starts_with("__") && attr.ends_with("__") {
        return Err(Unwind::Fatal(InterpreterError::Runtime {
            line: 0,
            message: format!("Forbidden access to dunder attribute: {}", attr),
        }));
    }
    Ok(())
}

fn handler_matches(types: &[String], exc: &Exception) -> bool {
    if types.is_empty() {
        return true;
    }
    types.iter().any(|t| {
        let name = t.rsplit('.').next().unwrap_or(t);
        match name {
            "Exception" | "BaseException" => true,
            "LookupError" => matches!(exc.kind.as_str(), "KeyError" | "IndexError"),
            "ArithmeticError" => {
                matches!(exc.kind.as_str(), "ZeroDivisionError" | "OverflowError")
            }
            other => other == exc.kind,
        }
    })
}

/// 授权规则：精确匹配、`*` 全部放行、`pkg.*` 放行其子模块
pub(crate) fn is_import_authorized(module: &str, authorized: &[String]) -> bool {
    authorized.iter().any(|entry| {
        entry == "*"
            || entry == module
            || entry
                .strip_suffix(".*")
                .map(|prefix| module == prefix || module.starts_with(&format!("{}.", prefix)))
                .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::parser::parse;

    fn run(src: &str) -> (Flow<Value>, HashMap<String, Value>, String) {
        let mut globals = HashMap::new();
        let registry = CapabilityRegistry::new();
        let authorized = vec!["math".to_string(), "statistics".to_string()];
        let body = parse(src).unwrap();
        let (result, logs) = {
            let mut interp = Interpreter::new(&mut globals, &registry, &authorized, 1000, 100_000);
            let result = interp.run_module(&body);
            (result, interp.print.into_logs())
        };
        (result, globals, logs)
    }

    fn value_of(src: &str) -> Value {
        match run(src).0 {
            Ok(v) => v,
            Err(e) => panic!("unexpected unwind: {:?}", e),
        }
    }

    #[test]
    fn test_last_expression_is_output() {
        assert_eq!(value_of("x = 2\nx * 21"), Value::Int(42));
        assert_eq!(value_of("x = 2"), Value::None);
    }

    #[test]
    fn test_nested_subscript_assignment_and_mutating_methods() {
        let src = "d = {'units': [[1], [2]]}\nd['units'][1].append(3)\nd['units'][0][0] = 9\nd['count'] = len(d['units'])\nd";
        let v = value_of(src);
        assert_eq!(
            v.to_json(),
            serde_json::json!({"units": [[9], [2, 3]], "count": 2})
        );
    }

    #[test]
    fn test_functions_closures_and_defaults() {
        let src = "def scale(xs, k=2):\n    offset = 1\n    return [x * k + offset for x in xs]\nscale([1, 2]) + scale([1], k=10)";
        assert_eq!(value_of(src).to_json(), serde_json::json!([3, 5, 11]));
        let src = "def make(n):\n    return lambda x: x + n\nadd3 = make(3)\nadd3(4)";
        assert_eq!(value_of(src), Value::Int(7));
    }

    #[test]
    fn test_loops_break_continue() {
        let src = "total = 0\nfor i in range(10):\n    if i % 2:\n        continue\n    if i > 6:\n        break\n    total += i\nn = 0\nwhile n < 3:\n    n += 1\n(total, n)";
        assert_eq!(value_of(src).to_json(), serde_json::json!([12, 3]));
    }

    #[test]
    fn test_try_except_catches_runtime_errors() {
        let src = "try:\n    x = {}['missing']\nexcept KeyError as e:\n    x = 'caught ' + e\nfinally:\n    y = 1\nx";
        assert_eq!(value_of(src), Value::from("caught 'missing'"));
    }

    #[test]
    fn test_uncaught_error_carries_line_and_kind() {
        let (result, _, _) = run("a = 1\nb = a / 0\n");
        match result {
            Err(Unwind::Raise(e)) => {
                assert_eq!(e.kind, "ZeroDivisionError");
                assert_eq!(e.line, Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        let (result, _, _) = run("print(undefined_name)");
        assert!(matches!(result, Err(Unwind::Raise(e)) if e.kind == "NameError"));
    }

    #[test]
    fn test_import_denied_is_fatal_even_inside_try() {
        let (result, _, _) = run("try:\n    import os\nexcept Exception:\n    pass\n");
        match result {
            Err(Unwind::Fatal(InterpreterError::ImportDenied { module, .. })) => assert_eq!(module, "os"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(value_of("import math\nmath.floor(math.sqrt(17))"), Value::Int(4));
        assert_eq!(value_of("from statistics import mean\nmean([1, 2, 3, 4])"), Value::Float(2.5));
    }

    #[test]
    fn test_final_answer_short_circuits() {
        let (result, globals, logs) = run("print('before')\nfinal_answer(41 + 1)\nprint('after')\nz = 1");
        assert!(matches!(result, Err(Unwind::Final(Value::Int(42)))));
        assert!(!globals.contains_key("z"));
        assert_eq!(logs, "before\n");
    }

    #[test]
    fn test_operation_budget() {
        let (result, _, _) = run("while True:\n    pass\n");
        assert!(matches!(result, Err(Unwind::Fatal(InterpreterError::Limit(_)))));
    }

    #[test]
    fn test_long_operator_chains_evaluate_iteratively() {
        let src = format!(
            "r = 1{}\nz = 0 or [] or 'last'\n(r, z, 0 and undefined_name, 2 - 3 - 4)",
            " + 1".repeat(900)
        );
        assert_eq!(value_of(&src).to_json(), serde_json::json!([901, "last", 0, -5]));
    }

    #[test]
    fn test_augmented_subscript_assignment_is_charged() {
        let (result, _, _) = run("a = [[0] * 60000]\na[0] += a[0]");
        assert!(matches!(result, Err(Unwind::Fatal(InterpreterError::Limit(_)))));
        assert_eq!(value_of("a = {'k': [1]}\na['k'] += [2]\na['k']").to_json(), serde_json::json!([1, 2]));
    }

    #[test]
    fn test_print_buffer_truncates() {
        let mut buffer = PrintBuffer::new(5);
        buffer.push("abc");
        buffer.push("defgh");
        buffer.push("ignored");
        let logs = buffer.into_logs();
        assert!(logs.starts_with("abcde\n"));
        assert!(logs.contains("truncated"));
    }

    #[test]
    fn test_dunder_access_denied() {
        let (result, _, _) = run("x = [1]\nx.__class__");
        assert!(matches!(result, Err(Unwind::Fatal(InterpreterError::Runtime { .. }))));
    }

    #[test]
    fn test_import_authorization_rules() {
        let authorized = vec!["math".to_string(), "numpy.*".to_string()];
        assert!(is_import_authorized("math", &authorized));
        assert!(is_import_authorized("numpy.linalg", &authorized));
        assert!(!is_import_authorized("os", &authorized));
        assert!(is_import_authorized("os", &["*".to_string()]));
    }
}
