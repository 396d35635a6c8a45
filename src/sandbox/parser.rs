//! 递归下降语法分析：Token 流 -> AST
//!
//! 运算符优先级与 Python 一致（lambda < 三元 < or < and < not < 比较 < 加减 < 乘除 < 一元 < 幂 < 后缀）。
//! 不支持的语法（class / with / yield / 星号参数等）直接报 Syntax 错误，让模型看到并改写。

use std::sync::Arc;

use crate::sandbox::ast::{
    Alias, Arg, BinOp, BoolOp, CmpOp, Comprehension, ExceptHandler, Expr, FPart, FunctionBody,
    FunctionDef, Param, Stmt, StmtKind, Target, UnaryOp,
};
use crate::sandbox::error::InterpreterError;
use crate::sandbox::lexer::{tokenize, Tok, Token};

const KEYWORDS: &[&str] = &[
    "and", "or", "not", "in", "is", "if", "elif", "else", "for", "while", "break", "continue",
    "pass", "def", "return", "lambda", "import", "from", "as", "True", "False", "None", "try",
    "except", "finally", "raise", "assert", "del", "global", "nonlocal", "class", "with", "yield",
    "async", "await",
];

/// 括号、一元运算、后缀链与代码块的最大嵌套层数
const MAX_NESTING: usize = 100;
/// 同一层二元运算链（`a + b + ...`、`x and y and ...`）的最大长度
const MAX_CHAIN: usize = 1000;

type PResult<T> = Result<T, InterpreterError>;

/// 解析完整代码片段
pub fn parse(src: &str) -> PResult<Vec<Stmt>> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { tokens, pos: 0, depth: 0 };
    parser.parse_module()
}

/// 解析单个表达式（f-string 内嵌表达式）
fn parse_expression(src: &str, line: usize, depth: usize) -> PResult<Expr> {
    let tokens = tokenize(src).map_err(|e| relocate(e, line))?;
    let mut parser = Parser { tokens, pos: 0, depth };
    let expr = parser.parse_testlist().map_err(|e| relocate(e, line))?;
    parser.eat_newlines();
    if !matches!(parser.peek(), Tok::Eof) {
        return Err(InterpreterError::syntax(line, "invalid expression in f-string"));
    }
    Ok(expr)
}

fn relocate(err: InterpreterError, line: usize) -> InterpreterError {
    match err {
        InterpreterError::Syntax { message, .. } => InterpreterError::Syntax { line, message },
        other => other,
    }
}

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, n: usize) -> &Tok {
        self.tokens
            .get(self.pos + n)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn error(&self, message: impl Into<String>) -> InterpreterError {
        InterpreterError::syntax(self.line(), message)
    }

    fn too_deep(&self) -> InterpreterError {
        self.error(format!("code is nested too deeply (more than {} levels)", MAX_NESTING))
    }

    /// 进入一层嵌套；超过上限时报 Syntax 错误而不是继续递归
    fn nested<T>(&mut self, f: impl FnOnce(&mut Self) -> PResult<T>) -> PResult<T> {
        if self.depth >= MAX_NESTING {
            return Err(self.too_deep());
        }
        self.depth += 1;
        let result = f(self);
        self.depth -= 1;
        result
    }

    fn check_chain(&self, links: usize) -> PResult<()> {
        if links > MAX_CHAIN {
            return Err(self.error(format!(
                "expression is too long (more than {} chained operators)",
                MAX_CHAIN
            )));
        }
        Ok(())
    }

    fn unexpected(&self) -> InterpreterError {
        let found = match self.peek() {
            Tok::Name(n) => format!("'{}'", n),
            Tok::Int(i) => i.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(_) | Tok::FStr(_) => "string literal".to_string(),
            Tok::Op(op) => format!("'{}'", op),
            Tok::Newline => "end of line".to_string(),
            Tok::Indent => "unexpected indent".to_string(),
            Tok::Dedent => "unexpected dedent".to_string(),
            Tok::Eof => "end of input".to_string(),
        };
        self.error(format!("invalid syntax near {}", found))
    }

    fn is_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn is_kw(&self, kw: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == kw)
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.is_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_kw(&mut self, kw: &str) -> bool {
        if self.is_kw(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> PResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", op)))
        }
    }

    fn expect_kw(&mut self, kw: &str) -> PResult<()> {
        if self.eat_kw(kw) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{}'", kw)))
        }
    }

    fn expect_name(&mut self) -> PResult<String> {
        match self.peek().clone() {
            Tok::Name(n) if !is_keyword(&n) => {
                self.pos += 1;
                Ok(n)
            }
            _ => Err(self.unexpected()),
        }
    }

    fn eat_newlines(&mut self) {
        while matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
        }
    }

    fn at_line_end(&self) -> bool {
        matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent)
    }

    fn can_start_expr(&self) -> bool {
        match self.peek() {
            Tok::Name(n) => {
                !is_keyword(n) || matches!(n.as_str(), "not" | "lambda" | "True" | "False" | "None")
            }
            Tok::Int(_) | Tok::Float(_) | Tok::Str(_) | Tok::FStr(_) => true,
            Tok::Op(op) => matches!(*op, "(" | "[" | "{" | "-" | "+"),
            _ => false,
        }
    }

    // ---------------------------------------------------------------- 语句

    fn parse_module(&mut self) -> PResult<Vec<Stmt>> {
        let mut body = Vec::new();
        loop {
            self.eat_newlines();
            match self.peek() {
                Tok::Eof => break,
                Tok::Indent => return Err(self.error("unexpected indent")),
                Tok::Dedent => {
                    self.pos += 1;
                }
                _ => self.parse_statement(&mut body)?,
            }
        }
        Ok(body)
    }

    fn parse_statement(&mut self, out: &mut Vec<Stmt>) -> PResult<()> {
        let keyword = match self.peek() {
            Tok::Name(n) => n.clone(),
            _ => String::new(),
        };
        match keyword.as_str() {
            "if" => {
                let stmt = self.parse_if()?;
                out.push(stmt);
            }
            "for" => {
                let stmt = self.parse_for()?;
                out.push(stmt);
            }
            "while" => {
                let stmt = self.parse_while()?;
                out.push(stmt);
            }
            "def" => {
                let stmt = self.parse_def()?;
                out.push(stmt);
            }
            "try" => {
                let stmt = self.parse_try()?;
                out.push(stmt);
            }
            "class" | "with" | "async" | "yield" | "global" | "nonlocal" | "del" | "await" => {
                return Err(self.error(format!("'{}' statements are not supported", keyword)));
            }
            _ => self.parse_simple_line(out)?,
        }
        Ok(())
    }

    fn parse_simple_line(&mut self, out: &mut Vec<Stmt>) -> PResult<()> {
        loop {
            let stmt = self.parse_small_stmt()?;
            out.push(stmt);
            if self.eat_op(";") {
                if self.at_line_end() {
                    break;
                }
                continue;
            }
            break;
        }
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.unexpected()),
        }
    }

    fn parse_small_stmt(&mut self) -> PResult<Stmt> {
        let line = self.line();
        let kind = if self.eat_kw("pass") {
            StmtKind::Pass
        } else if self.eat_kw("break") {
            StmtKind::Break
        } else if self.eat_kw("continue") {
            StmtKind::Continue
        } else if self.eat_kw("return") {
            if self.at_line_end() || self.is_op(";") {
                StmtKind::Return(None)
            } else {
                StmtKind::Return(Some(self.parse_testlist()?))
            }
        } else if self.eat_kw("raise") {
            if self.at_line_end() || self.is_op(";") {
                StmtKind::Raise(None)
            } else {
                StmtKind::Raise(Some(self.parse_expr()?))
            }
        } else if self.eat_kw("assert") {
            let test = self.parse_expr()?;
            let msg = if self.eat_op(",") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            StmtKind::Assert { test, msg }
        } else if self.eat_kw("import") {
            let mut names = Vec::new();
            loop {
                let name = self.parse_dotted_name()?;
                let asname = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                names.push(Alias { name, asname });
                if !self.eat_op(",") {
                    break;
                }
            }
            StmtKind::Import(names)
        } else if self.eat_kw("from") {
            let module = self.parse_dotted_name()?;
            self.expect_kw("import")?;
            let parenthesized = self.eat_op("(");
            let mut names = Vec::new();
            if self.eat_op("*") {
                return Err(self.error("wildcard imports are not supported"));
            }
            loop {
                let name = self.expect_name()?;
                let asname = if self.eat_kw("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                names.push(Alias { name, asname });
                if !self.eat_op(",") || (parenthesized && self.is_op(")")) {
                    break;
                }
            }
            if parenthesized {
                self.expect_op(")")?;
            }
            StmtKind::ImportFrom { module, names }
        } else {
            self.parse_expr_statement()?
        };
        Ok(Stmt { kind, line })
    }

    fn parse_dotted_name(&mut self) -> PResult<String> {
        let mut name = self.expect_name()?;
        while self.eat_op(".") {
            name.push('.');
            name.push_str(&self.expect_name()?);
        }
        Ok(name)
    }

    fn parse_expr_statement(&mut self) -> PResult<StmtKind> {
        let first = self.parse_testlist()?;

        // 带类型注解的赋值：`x: int = 1`
        if self.is_op(":") {
            if let Expr::Name(_) = first {
                self.pos += 1;
                self.parse_expr()?;
                if self.eat_op("=") {
                    let value = self.parse_testlist()?;
                    return Ok(StmtKind::Assign {
                        targets: vec![self.to_target(first)?],
                        value,
                    });
                }
                return Ok(StmtKind::Pass);
            }
        }

        if self.is_op("=") {
            let mut targets = vec![self.to_target(first)?];
            loop {
                self.expect_op("=")?;
                let next = self.parse_testlist()?;
                if self.is_op("=") {
                    targets.push(self.to_target(next)?);
                } else {
                    return Ok(StmtKind::Assign {
                        targets,
                        value: next,
                    });
                }
            }
        }

        let aug = match self.peek() {
            Tok::Op("+=") => Some(BinOp::Add),
            Tok::Op("-=") => Some(BinOp::Sub),
            Tok::Op("*=") => Some(BinOp::Mul),
            Tok::Op("/=") => Some(BinOp::Div),
            Tok::Op("//=") => Some(BinOp::FloorDiv),
            Tok::Op("%=") => Some(BinOp::Mod),
            Tok::Op("**=") => Some(BinOp::Pow),
            _ => None,
        };
        if let Some(op) = aug {
            self.pos += 1;
            let target = self.to_target(first)?;
            if let Target::Tuple(_) = target {
                return Err(self.error("illegal expression for augmented assignment"));
            }
            let value = self.parse_testlist()?;
            return Ok(StmtKind::AugAssign { target, op, value });
        }

        Ok(StmtKind::Expr(first))
    }

    fn to_target(&self, expr: Expr) -> PResult<Target> {
        match expr {
            Expr::Name(n) => Ok(Target::Name(n)),
            Expr::Tuple(items) | Expr::List(items) => Ok(Target::Tuple(
                items
                    .into_iter()
                    .map(|e| self.to_target(e))
                    .collect::<PResult<Vec<_>>>()?,
            )),
            Expr::Subscript { value, index } => Ok(Target::Subscript {
                value: *value,
                index: *index,
            }),
            Expr::Attribute { .. } => Err(self.error("attribute assignment is not supported")),
            _ => Err(self.error("cannot assign to expression")),
        }
    }

    fn parse_block(&mut self) -> PResult<Vec<Stmt>> {
        self.nested(Self::parse_block_body)
    }

    fn parse_block_body(&mut self) -> PResult<Vec<Stmt>> {
        self.expect_op(":")?;
        let mut body = Vec::new();
        if matches!(self.peek(), Tok::Newline) {
            self.eat_newlines();
            if !matches!(self.peek(), Tok::Indent) {
                return Err(self.error("expected an indented block"));
            }
            self.pos += 1;
            loop {
                self.eat_newlines();
                match self.peek() {
                    Tok::Dedent => {
                        self.pos += 1;
                        break;
                    }
                    Tok::Eof => break,
                    _ => self.parse_statement(&mut body)?,
                }
            }
        } else {
            self.parse_simple_line(&mut body)?;
        }
        Ok(body)
    }

    fn parse_if(&mut self) -> PResult<Stmt> {
        let line = self.line();
        // "if" 或 "elif"
        self.advance();
        let test = self.parse_expr()?;
        let body = self.parse_block()?;
        let orelse = if self.is_kw("elif") {
            vec![self.nested(Self::parse_if)?]
        } else if self.eat_kw("else") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        Ok(Stmt {
            kind: StmtKind::If { test, body, orelse },
            line,
        })
    }

    fn parse_for(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.expect_kw("for")?;
        let target = self.parse_target_list()?;
        self.expect_kw("in")?;
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        if self.is_kw("else") {
            return Err(self.error("for-else is not supported"));
        }
        Ok(Stmt {
            kind: StmtKind::For { target, iter, body },
            line,
        })
    }

    fn parse_while(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.expect_kw("while")?;
        let test = self.parse_expr()?;
        let body = self.parse_block()?;
        if self.is_kw("else") {
            return Err(self.error("while-else is not supported"));
        }
        Ok(Stmt {
            kind: StmtKind::While { test, body },
            line,
        })
    }

    fn parse_def(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.expect_kw("def")?;
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(")")?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_expr()?;
        }
        let body = self.parse_block()?;
        Ok(Stmt {
            kind: StmtKind::FunctionDef(Arc::new(FunctionDef {
                name,
                params,
                body: FunctionBody::Block(body),
            })),
            line,
        })
    }

    /// 形参列表，直到 `close`（def 为 ")"，lambda 为 ":"）
    fn parse_params(&mut self, close: &str) -> PResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        while !self.is_op(close) {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.error("star parameters are not supported"));
            }
            let name = self.expect_name()?;
            if close == ")" && self.eat_op(":") {
                self.parse_expr()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_expr()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error("non-default argument follows default argument"));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn parse_try(&mut self) -> PResult<Stmt> {
        let line = self.line();
        self.expect_kw("try")?;
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.eat_kw("except") {
            let mut types = Vec::new();
            let mut name = None;
            if !self.is_op(":") {
                if self.eat_op("(") {
                    while !self.is_op(")") {
                        types.push(self.parse_dotted_name()?);
                        if !self.eat_op(",") {
                            break;
                        }
                    }
                    self.expect_op(")")?;
                } else {
                    types.push(self.parse_dotted_name()?);
                }
                if self.eat_kw("as") {
                    name = Some(self.expect_name()?);
                }
            }
            let body = self.parse_block()?;
            handlers.push(ExceptHandler { types, name, body });
        }
        if self.is_kw("else") {
            return Err(self.error("try-else is not supported"));
        }
        let finalbody = if self.eat_kw("finally") {
            self.parse_block()?
        } else {
            Vec::new()
        };
        if handlers.is_empty() && finalbody.is_empty() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(Stmt {
            kind: StmtKind::Try {
                body,
                handlers,
                finalbody,
            },
            line,
        })
    }

    // ---------------------------------------------------------------- 赋值目标

    fn parse_target_list(&mut self) -> PResult<Target> {
        let first = self.parse_target_atom()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.is_kw("in") || self.is_op("=") {
                break;
            }
            items.push(self.parse_target_atom()?);
        }
        Ok(Target::Tuple(items))
    }

    fn parse_target_atom(&mut self) -> PResult<Target> {
        if self.is_op("(") || self.is_op("[") {
            let close = if self.is_op("(") { ")" } else { "]" };
            self.pos += 1;
            let mut items = Vec::new();
            while !self.is_op(close) {
                items.push(self.nested(Self::parse_target_atom)?);
                if !self.eat_op(",") {
                    break;
                }
            }
            self.expect_op(close)?;
            return Ok(Target::Tuple(items));
        }
        let expr = self.parse_postfix()?;
        self.to_target(expr)
    }

    // ---------------------------------------------------------------- 表达式

    /// 逗号分隔的表达式列表；多于一个时为 tuple
    fn parse_testlist(&mut self) -> PResult<Expr> {
        let first = self.parse_expr()?;
        if !self.is_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if !self.can_start_expr() {
                break;
            }
            items.push(self.parse_expr()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_expr(&mut self) -> PResult<Expr> {
        self.nested(Self::parse_conditional)
    }

    fn parse_conditional(&mut self) -> PResult<Expr> {
        if self.is_kw("lambda") {
            return self.parse_lambda();
        }
        let body = self.parse_or()?;
        if self.eat_kw("if") {
            let test = self.parse_or()?;
            self.expect_kw("else")?;
            let orelse = self.parse_expr()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    fn parse_lambda(&mut self) -> PResult<Expr> {
        self.expect_kw("lambda")?;
        let params = self.parse_params(":")?;
        self.expect_op(":")?;
        let body = self.parse_expr()?;
        Ok(Expr::Lambda(Arc::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: FunctionBody::Expr(body),
        })))
    }

    fn parse_or(&mut self) -> PResult<Expr> {
        let mut left = self.parse_and()?;
        let mut links = 0;
        while self.eat_kw("or") {
            links += 1;
            self.check_chain(links)?;
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> PResult<Expr> {
        let mut left = self.parse_not()?;
        let mut links = 0;
        while self.eat_kw("and") {
            links += 1;
            self.check_chain(links)?;
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> PResult<Expr> {
        if self.eat_kw("not") {
            let operand = self.nested(Self::parse_not)?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> PResult<Expr> {
        let left = self.parse_arith()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.peek() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Name(n) if n == "in" => CmpOp::In,
                Tok::Name(n) if n == "not" && matches!(self.peek_at(1), Tok::Name(m) if m == "in") => {
                    self.pos += 1;
                    CmpOp::NotIn
                }
                Tok::Name(n) if n == "is" => {
                    if matches!(self.peek_at(1), Tok::Name(m) if m == "not") {
                        self.pos += 1;
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.pos += 1;
            self.check_chain(ops.len() + 1)?;
            let right = self.parse_arith()?;
            ops.push((op, right));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn parse_arith(&mut self) -> PResult<Expr> {
        let mut left = self.parse_term()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Tok::Op("+") => BinOp::Add,
                Tok::Op("-") => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            links += 1;
            self.check_chain(links)?;
            let right = self.parse_term()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> PResult<Expr> {
        let mut left = self.parse_factor()?;
        let mut links = 0;
        loop {
            let op = match self.peek() {
                Tok::Op("*") => BinOp::Mul,
                Tok::Op("/") => BinOp::Div,
                Tok::Op("//") => BinOp::FloorDiv,
                Tok::Op("%") => BinOp::Mod,
                _ => break,
            };
            self.pos += 1;
            links += 1;
            self.check_chain(links)?;
            let right = self.parse_factor()?;
            left = Expr::BinOp {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> PResult<Expr> {
        let op = match self.peek() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            _ => None,
        };
        if let Some(op) = op {
            self.pos += 1;
            let operand = self.nested(Self::parse_factor)?;
            return Ok(Expr::Unary {
                op,
                operand: Box::new(operand),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> PResult<Expr> {
        let base = self.parse_postfix()?;
        if self.eat_op("**") {
            let exponent = self.nested(Self::parse_factor)?;
            return Ok(Expr::BinOp {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> PResult<Expr> {
        let mut expr = self.parse_atom()?;
        let mut links = 0;
        loop {
            if self.is_op("(") || self.is_op("[") || self.is_op(".") {
                // 每一环在求值时都多一层递归
                links += 1;
                if self.depth + links > MAX_NESTING {
                    return Err(self.too_deep());
                }
            }
            if self.eat_op("(") {
                let args = self.parse_call_args()?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let attr = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    attr,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_call_args(&mut self) -> PResult<Vec<Arg>> {
        let mut args = Vec::new();
        while !self.is_op(")") {
            if self.is_op("*") || self.is_op("**") {
                return Err(self.error("star arguments are not supported"));
            }
            let is_keyword_arg = matches!(self.peek(), Tok::Name(n) if !is_keyword(n))
                && matches!(self.peek_at(1), Tok::Op("="));
            if is_keyword_arg {
                let name = self.expect_name()?;
                self.expect_op("=")?;
                args.push(Arg::Keyword(name, self.parse_expr()?));
            } else {
                let value = self.parse_expr()?;
                if self.is_kw("for") {
                    // 生成器表达式作为唯一参数：sum(x for x in xs)
                    let generators = self.parse_comp_for()?;
                    args.push(Arg::Positional(Expr::ListComp {
                        elt: Box::new(value),
                        generators,
                    }));
                } else {
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        self.expect_op(")")?;
        Ok(args)
    }

    fn parse_subscript(&mut self) -> PResult<Expr> {
        let lower = if self.is_op(":") {
            None
        } else {
            Some(self.parse_expr()?)
        };
        if self.eat_op(":") {
            let upper = if self.is_op(":") || self.is_op("]") {
                None
            } else {
                Some(Box::new(self.parse_expr()?))
            };
            let step = if self.eat_op(":") && !self.is_op("]") {
                Some(Box::new(self.parse_expr()?))
            } else {
                None
            };
            return Ok(Expr::Slice {
                lower: lower.map(Box::new),
                upper,
                step,
            });
        }
        let first = lower.ok_or_else(|| self.unexpected())?;
        if self.is_op(",") {
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.is_op("]") {
                    break;
                }
                items.push(self.parse_expr()?);
            }
            return Ok(Expr::Tuple(items));
        }
        Ok(first)
    }

    fn parse_comp_for(&mut self) -> PResult<Vec<Comprehension>> {
        let mut generators = Vec::new();
        while self.eat_kw("for") {
            let target = self.parse_target_list()?;
            self.expect_kw("in")?;
            let iter = self.parse_or()?;
            let mut ifs = Vec::new();
            while self.eat_kw("if") {
                ifs.push(self.parse_or()?);
            }
            generators.push(Comprehension { target, iter, ifs });
        }
        Ok(generators)
    }

    fn parse_atom(&mut self) -> PResult<Expr> {
        let line = self.line();
        match self.peek().clone() {
            Tok::Name(n) => {
                self.pos += 1;
                match n.as_str() {
                    "True" => Ok(Expr::Bool(true)),
                    "False" => Ok(Expr::Bool(false)),
                    "None" => Ok(Expr::None),
                    _ if is_keyword(&n) => {
                        self.pos -= 1;
                        Err(self.unexpected())
                    }
                    _ => Ok(Expr::Name(n)),
                }
            }
            Tok::Int(i) => {
                self.pos += 1;
                Ok(Expr::Int(i))
            }
            Tok::Float(f) => {
                self.pos += 1;
                Ok(Expr::Float(f))
            }
            Tok::Str(_) | Tok::FStr(_) => self.parse_strings(line),
            Tok::Op("(") => {
                self.pos += 1;
                if self.eat_op(")") {
                    return Ok(Expr::Tuple(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.is_kw("for") {
                    let generators = self.parse_comp_for()?;
                    self.expect_op(")")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        generators,
                    });
                }
                if self.eat_op(")") {
                    return Ok(first);
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op(")") {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect_op(")")?;
                Ok(Expr::Tuple(items))
            }
            Tok::Op("[") => {
                self.pos += 1;
                if self.eat_op("]") {
                    return Ok(Expr::List(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.is_kw("for") {
                    let generators = self.parse_comp_for()?;
                    self.expect_op("]")?;
                    return Ok(Expr::ListComp {
                        elt: Box::new(first),
                        generators,
                    });
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op("]") {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect_op("]")?;
                Ok(Expr::List(items))
            }
            Tok::Op("{") => {
                self.pos += 1;
                if self.eat_op("}") {
                    return Ok(Expr::Dict(Vec::new()));
                }
                let first = self.parse_expr()?;
                if self.eat_op(":") {
                    let value = self.parse_expr()?;
                    if self.is_kw("for") {
                        let generators = self.parse_comp_for()?;
                        self.expect_op("}")?;
                        return Ok(Expr::DictComp {
                            key: Box::new(first),
                            value: Box::new(value),
                            generators,
                        });
                    }
                    let mut entries = vec![(first, value)];
                    while self.eat_op(",") {
                        if self.is_op("}") {
                            break;
                        }
                        let k = self.parse_expr()?;
                        self.expect_op(":")?;
                        let v = self.parse_expr()?;
                        entries.push((k, v));
                    }
                    self.expect_op("}")?;
                    return Ok(Expr::Dict(entries));
                }
                if self.is_kw("for") {
                    let generators = self.parse_comp_for()?;
                    self.expect_op("}")?;
                    return Ok(Expr::SetComp {
                        elt: Box::new(first),
                        generators,
                    });
                }
                let mut items = vec![first];
                while self.eat_op(",") {
                    if self.is_op("}") {
                        break;
                    }
                    items.push(self.parse_expr()?);
                }
                self.expect_op("}")?;
                Ok(Expr::Set(items))
            }
            _ => Err(self.unexpected()),
        }
    }

    /// 相邻字符串字面量拼接；任一为 f-string 时整体为 FString
    fn parse_strings(&mut self, line: usize) -> PResult<Expr> {
        let mut parts: Vec<FPart> = Vec::new();
        let mut has_fstring = false;
        loop {
            match self.peek().clone() {
                Tok::Str(s) => {
                    self.pos += 1;
                    parts.push(FPart::Lit(s));
                }
                Tok::FStr(raw) => {
                    self.pos += 1;
                    has_fstring = true;
                    parts.extend(parse_fstring(&raw, line, self.depth)?);
                }
                _ => break,
            }
        }
        if has_fstring {
            return Ok(Expr::FString(parts));
        }
        let joined: String = parts
            .into_iter()
            .map(|p| match p {
                FPart::Lit(s) => s,
                FPart::Expr { .. } => String::new(),
            })
            .collect();
        Ok(Expr::Str(joined))
    }
}

/// 拆分 f-string：`{{` / `}}` 为字面花括号，`{expr!r:spec}` 为嵌入表达式
fn parse_fstring(raw: &str, line: usize, depth: usize) -> PResult<Vec<FPart>> {
    let chars: Vec<char> = raw.chars().collect();
    let mut parts = Vec::new();
    let mut lit = String::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '{' {
            if chars.get(i + 1) == Some(&'{') {
                lit.push('{');
                i += 2;
                continue;
            }
            // 找到匹配的 '}'，跳过嵌套括号与字符串
            let start = i + 1;
            let mut depth = 0usize;
            let mut quote: Option<char> = None;
            let mut j = start;
            let mut split: Option<usize> = None;
            let mut conversion: Option<usize> = None;
            while j < chars.len() {
                let ch = chars[j];
                if let Some(q) = quote {
                    if ch == q {
                        quote = None;
                    }
                } else {
                    match ch {
                        '\'' | '"' => quote = Some(ch),
                        '(' | '[' | '{' => depth += 1,
                        ')' | ']' => depth = depth.saturating_sub(1),
                        '}' if depth > 0 => depth -= 1,
                        '}' => break,
                        '!' if depth == 0
                            && split.is_none()
                            && chars.get(j + 1) != Some(&'=') =>
                        {
                            conversion = Some(j)
                        }
                        ':' if depth == 0 && split.is_none() => split = Some(j),
                        _ => {}
                    }
                }
                j += 1;
            }
            if j >= chars.len() {
                return Err(InterpreterError::syntax(line, "f-string: expecting '}'"));
            }
            let expr_end = conversion.or(split).unwrap_or(j);
            let expr_src: String = chars[start..expr_end].iter().collect();
            if expr_src.trim().is_empty() {
                return Err(InterpreterError::syntax(line, "f-string: empty expression not allowed"));
            }
            let repr = match conversion {
                Some(k) => chars.get(k + 1) == Some(&'r'),
                None => false,
            };
            let spec = split.map(|s| chars[s + 1..j].iter().collect::<String>());
            if !lit.is_empty() {
                parts.push(FPart::Lit(std::mem::take(&mut lit)));
            }
            parts.push(FPart::Expr {
                expr: Box::new(parse_expression(expr_src.trim(), line, depth)?),
                repr,
                spec,
            });
            i = j + 1;
        } else if c == '}' {
            if chars.get(i + 1) == Some(&'}') {
                lit.push('}');
                i += 2;
                continue;
            }
            return Err(InterpreterError::syntax(line, "f-string: single '}' is not allowed"));
        } else {
            lit.push(c);
            i += 1;
        }
    }
    if !lit.is_empty() {
        parts.push(FPart::Lit(lit));
    }
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_assignment_and_call() {
        let stmts = parse("x = x + 1\nfinal_answer(x)\n").unwrap();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0].kind, StmtKind::Assign { .. }));
        assert!(matches!(stmts[1].kind, StmtKind::Expr(Expr::Call { .. })));
        assert_eq!(stmts[1].line, 2);
    }

    #[test]
    fn test_parse_compound_blocks() {
        let src = "for u in units:\n    if u['ally']:\n        ids.append(u['object_id'])\n    elif x:\n        pass\n    else:\n        continue\nprint(ids)\n";
        let stmts = parse(src).unwrap();
        assert_eq!(stmts.len(), 2);
        match &stmts[0].kind {
            StmtKind::For { body, .. } => match &body[0].kind {
                StmtKind::If { orelse, .. } => {
                    assert!(matches!(orelse[0].kind, StmtKind::If { .. }))
                }
                other => panic!("expected if, got {:?}", other),
            },
            other => panic!("expected for, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_comprehension_with_condition() {
        let stmts = parse("ids = [u['object_id'] for u in battle_state if u['ally'] and u['object_type'] == 'unit']").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign { value: Expr::ListComp { generators, .. }, .. } => {
                assert_eq!(generators.len(), 1);
                assert_eq!(generators[0].ifs.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_keyword_args_and_lambda() {
        let stmts = parse("nearest = min(enemies, key=lambda e: abs(e['position'][0] - x))").unwrap();
        match &stmts[0].kind {
            StmtKind::Assign { value: Expr::Call { args, .. }, .. } => {
                assert!(matches!(args[1], Arg::Keyword(ref k, Expr::Lambda(_)) if k == "key"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_fstring_parts() {
        let stmts = parse("print(f\"unit {u['name']!r} at {pos:.1f}\")").unwrap();
        match &stmts[0].kind {
            StmtKind::Expr(Expr::Call { args, .. }) => match &args[0] {
                Arg::Positional(Expr::FString(parts)) => {
                    assert_eq!(parts.len(), 4);
                    assert!(matches!(parts[1], FPart::Expr { repr: true, .. }));
                    assert!(matches!(&parts[3], FPart::Expr { spec: Some(s), .. } if s == ".1f"));
                }
                other => panic!("unexpected {:?}", other),
            },
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_tuple_unpacking_and_slices() {
        let stmts = parse("a, b = pos[0], pos[1:]\nfor i, (x, y) in enumerate(pts): pass\n").unwrap();
        assert!(matches!(&stmts[0].kind, StmtKind::Assign { targets, .. } if matches!(targets[0], Target::Tuple(_))));
        assert!(matches!(&stmts[1].kind, StmtKind::For { target: Target::Tuple(items), .. } if items.len() == 2));
    }

    #[test]
    fn test_parse_errors_report_line() {
        let err = parse("x = 1\nclass Foo:\n    pass\n").unwrap_err();
        assert!(matches!(err, InterpreterError::Syntax { line: 2, .. }));
        assert!(parse("x = (1, 2").is_err());
        assert!(parse("1 = x").is_err());
    }

    #[test]
    fn test_parse_try_except() {
        let src = "try:\n    x = d['k']\nexcept (KeyError, IndexError) as e:\n    x = None\nfinally:\n    done = True\n";
        match &parse(src).unwrap()[0].kind {
            StmtKind::Try { handlers, finalbody, .. } => {
                assert_eq!(handlers[0].types, vec!["KeyError", "IndexError"]);
                assert_eq!(handlers[0].name.as_deref(), Some("e"));
                assert_eq!(finalbody.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        for (open, close) in [("[", "]"), ("(", ")"), ("{'k': ", "}")] {
            let src = format!("x = {}1{}", open.repeat(200), close.repeat(200));
            let err = parse(&src).unwrap_err();
            assert!(err.to_string().contains("nested too deeply"), "{}", err);
        }
        assert!(parse(&format!("x = {}1", "-".repeat(500))).is_err());
        assert!(parse(&format!("x = 2{}", " ** 2".repeat(500))).is_err());
        assert!(parse(&format!("x = a{}", ".b".repeat(500))).is_err());

        let mut src = String::new();
        for level in 0..150 {
            src.push_str(&"    ".repeat(level));
            src.push_str("if True:\n");
        }
        src.push_str(&"    ".repeat(150));
        src.push_str("pass\n");
        assert!(parse(&src).is_err());
    }

    #[test]
    fn test_moderate_nesting_and_long_chains_parse() {
        assert!(parse(&format!("x = {}1{}", "[".repeat(50), "]".repeat(50))).is_ok());
        let sum = format!("x = 1{}", " + 1".repeat(500));
        assert!(parse(&sum).is_ok());
        let too_long = format!("x = 1{}", " + 1".repeat(2000));
        assert!(parse(&too_long).unwrap_err().to_string().contains("too long"));
    }
}
