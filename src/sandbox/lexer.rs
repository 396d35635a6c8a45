//! 词法分析：源码 -> Token 流（含 INDENT / DEDENT / NEWLINE）
//!
//! 括号内换行不产生 NEWLINE（隐式续行）；支持反斜杠续行、三引号字符串、r / f 前缀。

use crate::sandbox::error::InterpreterError;

const OPERATORS: &[&str] = &[
    "**=", "//=", "...", "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=", "%=", "->",
    "+", "-", "*", "/", "%", "<", ">", "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";",
    "@", "|", "&", "~", "^",
];

/// 制表符按 8 列对齐
const TAB_WIDTH: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    /// f-string 原始内容（转义已处理，花括号留给 parser）
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub tok: Tok,
    pub line: usize,
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
    indents: Vec<usize>,
    tokens: Vec<Token>,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, InterpreterError> {
    let mut lexer = Lexer {
        chars: src.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        indents: vec![0],
        tokens: Vec::new(),
    };
    lexer.run()?;
    Ok(lexer.tokens)
}

impl Lexer {
    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn push_newline(&mut self) {
        let needs = matches!(
            self.tokens.last().map(|t| &t.tok),
            Some(t) if *t != Tok::Newline && *t != Tok::Indent && *t != Tok::Dedent
        );
        if needs {
            self.push(Tok::Newline);
        }
    }

    fn run(&mut self) -> Result<(), InterpreterError> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                let mut col = 0;
                while let Some(c) = self.peek(0) {
                    match c {
                        ' ' => col += 1,
                        '\t' => col += TAB_WIDTH - col % TAB_WIDTH,
                        '\x0c' => col = 0,
                        _ => break,
                    }
                    self.pos += 1;
                }
                match self.peek(0) {
                    None => break,
                    Some('\n') => {
                        self.pos += 1;
                        self.line += 1;
                        continue;
                    }
                    Some('\r') => {
                        self.pos += 1;
                        continue;
                    }
                    Some('#') => {
                        self.skip_comment();
                        continue;
                    }
                    _ => {}
                }
                at_line_start = false;
                self.handle_indent(col)?;
            }

            let c = match self.peek(0) {
                Some(c) => c,
                None => break,
            };
            match c {
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.push_newline();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                '#' => self.skip_comment(),
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                c if c.is_ascii_digit() => self.number()?,
                '.' if self.peek(1).map(|d| d.is_ascii_digit()).unwrap_or(false) => {
                    self.number()?
                }
                c if c.is_alphabetic() || c == '_' => self.name_or_prefixed_string()?,
                '"' | '\'' => self.string(false, false)?,
                _ => self.operator()?,
            }
        }

        self.push_newline();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(())
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn handle_indent(&mut self, col: usize) -> Result<(), InterpreterError> {
        let top = *self.indents.last().unwrap_or(&0);
        if col > top {
            self.indents.push(col);
            self.push(Tok::Indent);
        } else if col < top {
            while col < *self.indents.last().unwrap_or(&0) {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if col != *self.indents.last().unwrap_or(&0) {
                return Err(InterpreterError::syntax(
                    self.line,
                    "unindent does not match any outer indentation level",
                ));
            }
        }
        Ok(())
    }

    fn number(&mut self) -> Result<(), InterpreterError> {
        let start = self.pos;
        if self.peek(0) == Some('0') {
            let radix = match self.peek(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits_start = self.pos;
                while let Some(c) = self.peek(0) {
                    if c.is_digit(radix) || c == '_' {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                let digits: String = self.chars[digits_start..self.pos]
                    .iter()
                    .filter(|c| **c != '_')
                    .collect();
                let value = i64::from_str_radix(&digits, radix).map_err(|_| {
                    InterpreterError::syntax(self.line, "invalid integer literal")
                })?;
                self.push(Tok::Int(value));
                return Ok(());
            }
        }

        let mut is_float = false;
        while let Some(c) = self.peek(0) {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !is_float {
                is_float = true;
                self.pos += 1;
            } else if (c == 'e' || c == 'E')
                && (self.peek(1).map(|d| d.is_ascii_digit()).unwrap_or(false)
                    || (matches!(self.peek(1), Some('+') | Some('-'))
                        && self.peek(2).map(|d| d.is_ascii_digit()).unwrap_or(false)))
            {
                is_float = true;
                self.pos += 2;
            } else {
                break;
            }
        }
        let mut text: String = self.chars[start..self.pos]
            .iter()
            .filter(|c| **c != '_')
            .collect();
        if text.starts_with('.') {
            text.insert(0, '0');
        }
        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| InterpreterError::syntax(self.line, format!("invalid float literal {text}")))?;
            self.push(Tok::Float(value));
        } else {
            let value: i64 = text.parse().map_err(|_| {
                InterpreterError::syntax(self.line, format!("integer literal too large: {text}"))
            })?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn name_or_prefixed_string(&mut self) -> Result<(), InterpreterError> {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if matches!(self.peek(0), Some('"') | Some('\'')) {
            let prefix = name.to_ascii_lowercase();
            if matches!(prefix.as_str(), "f" | "r" | "b" | "u" | "rf" | "fr" | "rb" | "br") {
                let raw = prefix.contains('r');
                let fstring = prefix.contains('f');
                return self.string(raw, fstring);
            }
        }
        self.push(Tok::Name(name));
        Ok(())
    }

    fn string(&mut self, raw: bool, fstring: bool) -> Result<(), InterpreterError> {
        let quote = self.peek(0).unwrap_or('"');
        let start_line = self.line;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let c = match self.peek(0) {
                Some(c) => c,
                None => {
                    return Err(InterpreterError::syntax(
                        start_line,
                        "unterminated string literal",
                    ))
                }
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    break;
                }
                if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                    self.pos += 3;
                    break;
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(InterpreterError::syntax(
                        start_line,
                        "unterminated string literal",
                    ));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = self.peek(1);
                if raw {
                    out.push('\\');
                    if let Some(n) = next {
                        out.push(n);
                        if n == '\n' {
                            self.line += 1;
                        }
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                    continue;
                }
                self.pos += 2;
                match next {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some('\\') => out.push('\\'),
                    Some('\'') => out.push('\''),
                    Some('"') => out.push('"'),
                    Some('\n') => self.line += 1,
                    Some('x') => out.push(self.hex_escape(2)?),
                    Some('u') => out.push(self.hex_escape(4)?),
                    Some(other) => {
                        out.push('\\');
                        out.push(other);
                    }
                    None => {
                        return Err(InterpreterError::syntax(
                            start_line,
                            "unterminated string literal",
                        ))
                    }
                }
                continue;
            }
            out.push(c);
            self.pos += 1;
        }

        if fstring {
            self.push(Tok::FStr(out));
        } else {
            self.push(Tok::Str(out));
        }
        Ok(())
    }

    fn hex_escape(&mut self, len: usize) -> Result<char, InterpreterError> {
        let digits: String = self.chars.iter().skip(self.pos).take(len).collect();
        self.pos += len;
        u32::from_str_radix(&digits, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| InterpreterError::syntax(self.line, "invalid escape sequence"))
    }

    fn operator(&mut self) -> Result<(), InterpreterError> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, oc)| self.peek(i) == Some(oc));
            if matches {
                match *op {
                    "(" | "[" | "{" => self.depth += 1,
                    ")" | "]" | "}" => self.depth = self.depth.saturating_sub(1),
                    _ => {}
                }
                self.pos += len;
                self.push(Tok::Op(op));
                return Ok(());
            }
        }
        let c = self.peek(0).unwrap_or(' ');
        Err(InterpreterError::syntax(
            self.line,
            format!("invalid character '{}'", c),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn test_indent_dedent() {
        let t = toks("if x:\n    y = 1\nz = 2\n");
        assert_eq!(
            t,
            vec![
                Tok::Name("if".into()),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Op("="),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn test_brackets_join_lines() {
        let t = toks("x = [1,\n  2]\n");
        assert!(!t[..t.len() - 2].contains(&Tok::Newline));
    }

    #[test]
    fn test_strings_and_prefixes() {
        let t = toks("a = 'it\\'s'\nb = f\"{a}!\"\nc = r'\\n'\n");
        assert!(t.contains(&Tok::Str("it's".into())));
        assert!(t.contains(&Tok::FStr("{a}!".into())));
        assert!(t.contains(&Tok::Str("\\n".into())));
    }

    #[test]
    fn test_numbers() {
        let t = toks("1_000 2.5 .5 1e3 0x1f\n");
        assert_eq!(
            &t[..5],
            &[Tok::Int(1000), Tok::Float(2.5), Tok::Float(0.5), Tok::Float(1000.0), Tok::Int(31)]
        );
    }

    #[test]
    fn test_bad_dedent_is_syntax_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(matches!(err, InterpreterError::Syntax { line: 3, .. }));
    }

    #[test]
    fn test_unterminated_string() {
        assert!(tokenize("x = 'abc\n").is_err());
    }
}
