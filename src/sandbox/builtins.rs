//! 内置函数、值方法、math / statistics 模块与格式化

use std::cmp::Ordering;

use crate::sandbox::ast::BinOp;
use crate::sandbox::interpreter::{Exception, Flow, Interpreter, Unwind};
use crate::sandbox::ops::{self, compare_values, iterate};
use crate::sandbox::value::{format_float, Dict, Value};

const FUNCTIONS: &[&str] = &[
    "print", "len", "range", "str", "int", "float", "bool", "list", "dict", "tuple", "set", "abs",
    "min", "max", "sum", "sorted", "reversed", "enumerate", "zip", "round", "any", "all", "map",
    "filter", "repr", "final_answer",
];

const EXCEPTION_CLASSES: &[&str] = &[
    "Exception", "ValueError", "TypeError", "KeyError", "IndexError", "NameError",
    "ZeroDivisionError", "AttributeError", "RuntimeError", "AssertionError", "LookupError",
    "ArithmeticError", "NotImplementedError", "StopIteration",
];

/// 可导入的模块
pub(crate) const MODULES: &[&str] = &["math", "statistics"];

const MATH_FUNCTIONS: &[&str] = &[
    "sqrt", "floor", "ceil", "trunc", "fabs", "pow", "exp", "log", "log10", "log2", "sin", "cos",
    "tan", "asin", "acos", "atan", "atan2", "hypot", "dist", "degrees", "radians", "isclose",
    "copysign",
];

const STATISTICS_FUNCTIONS: &[&str] = &["mean", "median", "mode", "stdev", "pstdev", "variance"];

const MUTATING_METHODS: &[&str] = &[
    "append", "extend", "pop", "insert", "remove", "sort", "clear", "reverse", "update",
    "setdefault",
];

/// 超过该长度的 range 视为失控
const MAX_RANGE_LEN: i64 = 10_000_000;

/// round 的 ndigits 超过此值时结果已与输入相同
const MAX_ROUND_DIGITS: i64 = 400;

/// 格式化宽度与精度上限
const MAX_FORMAT_WIDTH: usize = 100_000;

pub(crate) fn is_builtin(name: &str) -> bool {
    FUNCTIONS.contains(&name) || EXCEPTION_CLASSES.contains(&name)
}

pub(crate) fn is_exception_class(name: &str) -> bool {
    EXCEPTION_CLASSES.contains(&name)
}

pub(crate) fn is_mutating_method(name: &str) -> bool {
    MUTATING_METHODS.contains(&name)
}

// ---------------------------------------------------------------- 参数辅助

fn take_kw(keywords: &mut Vec<(String, Value)>, name: &str) -> Option<Value> {
    let idx = keywords.iter().position(|(k, _)| k == name)?;
    Some(keywords.remove(idx).1)
}

fn no_more_kw(func: &str, keywords: &[(String, Value)]) -> Result<(), Exception> {
    match keywords.first() {
        Some((k, _)) => Err(Exception::type_error(format!(
            "{}() got an unexpected keyword argument '{}'",
            func, k
        ))),
        None => Ok(()),
    }
}

fn arity(func: &str, args: &[Value], min: usize, max: usize) -> Result<(), Exception> {
    if args.len() < min || args.len() > max {
        let expected = if min == max {
            format!("{}", min)
        } else {
            format!("{} to {}", min, max)
        };
        return Err(Exception::type_error(format!(
            "{}() takes {} arguments ({} given)",
            func,
            expected,
            args.len()
        )));
    }
    Ok(())
}

fn expect_int(func: &str, v: &Value) -> Result<i64, Exception> {
    v.as_i64().ok_or_else(|| {
        Exception::type_error(format!(
            "{}() argument must be an integer, not '{}'",
            func,
            v.type_name()
        ))
    })
}

fn expect_number(func: &str, v: &Value) -> Result<f64, Exception> {
    v.as_f64().ok_or_else(|| {
        Exception::type_error(format!(
            "{}() argument must be a number, not '{}'",
            func,
            v.type_name()
        ))
    })
}

fn expect_str<'v>(func: &str, v: &'v Value) -> Result<&'v str, Exception> {
    match v {
        Value::Str(s) => Ok(s),
        other => Err(Exception::type_error(format!(
            "{}() argument must be str, not {}",
            func,
            other.type_name()
        ))),
    }
}

/// 单个可迭代参数或多个位置参数（min / max）
fn items_of(func: &str, mut args: Vec<Value>) -> Result<Vec<Value>, Exception> {
    match args.len() {
        0 => Err(Exception::type_error(format!(
            "{} expected at least 1 argument, got 0",
            func
        ))),
        1 => iterate(args.remove(0)),
        _ => Ok(args),
    }
}

fn call_key(interp: &mut Interpreter, key: &Option<Value>, item: &Value) -> Flow<Value> {
    match key {
        Some(Value::None) | None => Ok(item.clone()),
        Some(f) => interp.call_value(f.clone(), vec![item.clone()], Vec::new()),
    }
}

/// 稳定排序；reverse 时保持相等元素的原始顺序
fn sort_values(
    interp: &mut Interpreter,
    items: Vec<Value>,
    key: Option<Value>,
    reverse: bool,
) -> Flow<Vec<Value>> {
    let mut keyed = Vec::with_capacity(items.len());
    for item in items {
        let k = call_key(interp, &key, &item)?;
        keyed.push((k, item));
    }
    let mut failure: Option<Exception> = None;
    keyed.sort_by(|a, b| {
        let ordering = match compare_values(&a.0, &b.0, "<") {
            Ok(o) => o,
            Err(e) => {
                failure.get_or_insert(e);
                Ordering::Equal
            }
        };
        if reverse {
            ordering.reverse()
        } else {
            ordering
        }
    });
    if let Some(e) = failure {
        return Err(e.into());
    }
    Ok(keyed.into_iter().map(|(_, v)| v).collect())
}

fn extremum(
    interp: &mut Interpreter,
    func: &str,
    args: Vec<Value>,
    mut keywords: Vec<(String, Value)>,
    wanted: Ordering,
) -> Flow<Value> {
    let key = take_kw(&mut keywords, "key");
    let default = take_kw(&mut keywords, "default");
    no_more_kw(func, &keywords)?;
    let items = items_of(func, args)?;
    let mut best: Option<(Value, Value)> = None;
    for item in items {
        let k = call_key(interp, &key, &item)?;
        let replace = match &best {
            None => true,
            Some((best_key, _)) => compare_values(&k, best_key, "<")? == wanted,
        };
        if replace {
            best = Some((k, item));
        }
    }
    match (best, default) {
        (Some((_, v)), _) => Ok(v),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(Exception::value_error(format!("{}() arg is an empty sequence", func)).into()),
    }
}

// ---------------------------------------------------------------- 内置函数

pub(crate) fn call_builtin(
    interp: &mut Interpreter,
    name: &str,
    mut args: Vec<Value>,
    mut keywords: Vec<(String, Value)>,
) -> Flow<Value> {
    if let Some(func) = name.strip_prefix("math.") {
        no_more_kw(name, &keywords)?;
        return Ok(call_math(func, &args)?);
    }
    if let Some(func) = name.strip_prefix("statistics.") {
        no_more_kw(name, &keywords)?;
        return Ok(call_statistics(func, args)?);
    }
    if is_exception_class(name) {
        return Ok(Value::Str(args.first().map(|v| v.to_string()).unwrap_or_default()));
    }

    let result = match name {
        "print" => {
            let sep = match take_kw(&mut keywords, "sep") {
                Some(Value::None) | None => " ".to_string(),
                Some(v) => v.to_string(),
            };
            let end = match take_kw(&mut keywords, "end") {
                Some(Value::None) | None => "\n".to_string(),
                Some(v) => v.to_string(),
            };
            no_more_kw(name, &keywords)?;
            let line = args.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(&sep);
            interp.print.push(&line);
            interp.print.push(&end);
            Value::None
        }
        "final_answer" => {
            let answer = match take_kw(&mut keywords, "answer") {
                Some(v) if args.is_empty() => v,
                Some(_) => {
                    return Err(Exception::type_error(
                        "final_answer() got multiple values for argument 'answer'",
                    )
                    .into())
                }
                None => {
                    arity(name, &args, 1, 1)?;
                    args.remove(0)
                }
            };
            no_more_kw(name, &keywords)?;
            return Err(Unwind::Final(answer));
        }
        "len" => {
            arity(name, &args, 1, 1)?;
            let n = match &args[0] {
                Value::Str(s) => s.chars().count(),
                Value::List(v) | Value::Tuple(v) => v.len(),
                Value::Dict(d) => d.len(),
                other => {
                    return Err(Exception::type_error(format!(
                        "object of type '{}' has no len()",
                        other.type_name()
                    ))
                    .into())
                }
            };
            Value::Int(n as i64)
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let nums = args
                .iter()
                .map(|v| {
                    v.as_i64().ok_or_else(|| {
                        Exception::type_error(format!(
                            "'{}' object cannot be interpreted as an integer",
                            v.type_name()
                        ))
                    })
                })
                .collect::<Result<Vec<i64>, Exception>>()?;
            let (start, stop, step) = match nums.as_slice() {
                [stop] => (0, *stop, 1),
                [start, stop] => (*start, *stop, 1),
                [start, stop, step] => (*start, *stop, *step),
                _ => (0, 0, 1),
            };
            if step == 0 {
                return Err(Exception::value_error("range() arg 3 must not be zero").into());
            }
            // i128 容纳任意 i64 端点之差
            let (start, stop, step) = (i128::from(start), i128::from(stop), i128::from(step));
            let count = if step > 0 {
                (stop - start + step - 1).max(0) / step
            } else {
                (start - stop - step - 1).max(0) / -step
            };
            if count > i128::from(i64::MAX) {
                return Err(Exception::new("OverflowError", "range has too many items").into());
            }
            if count > i128::from(MAX_RANGE_LEN) {
                return Err(Exception::new("MemoryError", "range is too large").into());
            }
            interp.charge(count as usize)?;
            let mut items = Vec::with_capacity(count as usize);
            for i in 0..count {
                // 元素都落在 [start, stop) 内，必然能放进 i64
                items.push(Value::Int((start + i * step) as i64));
            }
            Value::List(items)
        }
        "str" => {
            arity(name, &args, 0, 1)?;
            Value::Str(args.first().map(|v| v.to_string()).unwrap_or_default())
        }
        "repr" => {
            arity(name, &args, 1, 1)?;
            Value::Str(args[0].repr())
        }
        "int" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Value::Int(0),
                Some(Value::Float(f)) => {
                    if !f.is_finite() {
                        return Err(Exception::value_error(format!(
                            "cannot convert float {} to integer",
                            format_float(*f)
                        ))
                        .into());
                    }
                    Value::Int(f.trunc() as i64)
                }
                Some(Value::Str(s)) => s
                    .trim()
                    .replace('_', "")
                    .parse::<i64>()
                    .map(Value::Int)
                    .map_err(|_| {
                        Exception::value_error(format!(
                            "invalid literal for int() with base 10: {}",
                            Value::Str(s.clone()).repr()
                        ))
                    })?,
                Some(v) => Value::Int(expect_int(name, v)?),
            }
        }
        "float" => {
            arity(name, &args, 0, 1)?;
            match args.first() {
                None => Value::Float(0.0),
                Some(Value::Str(s)) => {
                    let t = s.trim().to_ascii_lowercase();
                    let parsed = match t.as_str() {
                        "inf" | "+inf" | "infinity" => Some(f64::INFINITY),
                        "-inf" | "-infinity" => Some(f64::NEG_INFINITY),
                        "nan" => Some(f64::NAN),
                        other => other.parse::<f64>().ok(),
                    };
                    Value::Float(parsed.ok_or_else(|| {
                        Exception::value_error(format!(
                            "could not convert string to float: {}",
                            Value::Str(s.clone()).repr()
                        ))
                    })?)
                }
                Some(v) => Value::Float(expect_number(name, v)?),
            }
        }
        "bool" => {
            arity(name, &args, 0, 1)?;
            Value::Bool(args.first().map(Value::truthy).unwrap_or(false))
        }
        "list" => {
            arity(name, &args, 0, 1)?;
            Value::List(match args.pop() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            })
        }
        "tuple" => {
            arity(name, &args, 0, 1)?;
            Value::Tuple(match args.pop() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            })
        }
        "set" => {
            arity(name, &args, 0, 1)?;
            let items = match args.pop() {
                Some(v) => iterate(v)?,
                None => Vec::new(),
            };
            Value::List(ops::dedup(items)?)
        }
        "dict" => {
            arity(name, &args, 0, 1)?;
            let mut dict = match args.pop() {
                Some(Value::Dict(d)) => d,
                Some(other) => dict_from_pairs(other)?,
                None => Dict::new(),
            };
            for (k, v) in keywords.drain(..) {
                dict.insert(Value::Str(k), v);
            }
            Value::Dict(dict)
        }
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Float(f) => Value::Float(f.abs()),
                v => Value::Int(
                    expect_int(name, v)?
                        .checked_abs()
                        .ok_or_else(|| Exception::new("OverflowError", "integer result too large"))?,
                ),
            }
        }
        "min" => return extremum(interp, name, args, keywords, Ordering::Less),
        "max" => return extremum(interp, name, args, keywords, Ordering::Greater),
        "sum" => {
            let start = take_kw(&mut keywords, "start");
            no_more_kw(name, &keywords)?;
            arity(name, &args, 1, 2)?;
            let start = if args.len() == 2 { args.pop() } else { start };
            let mut total = start.unwrap_or(Value::Int(0));
            if matches!(total, Value::Str(_)) {
                return Err(Exception::type_error(
                    "sum() can't sum strings [use ''.join(seq) instead]",
                )
                .into());
            }
            for item in iterate(args.remove(0))? {
                interp.charge(ops::result_len(BinOp::Add, &total, &item))?;
                total = ops::binop(BinOp::Add, total, item)?;
            }
            total
        }
        "sorted" => {
            let key = take_kw(&mut keywords, "key");
            let reverse = take_kw(&mut keywords, "reverse").map(|v| v.truthy()).unwrap_or(false);
            no_more_kw(name, &keywords)?;
            arity(name, &args, 1, 1)?;
            let items = iterate(args.remove(0))?;
            Value::List(sort_values(interp, items, key, reverse)?)
        }
        "reversed" => {
            arity(name, &args, 1, 1)?;
            let mut items = iterate(args.remove(0))?;
            items.reverse();
            Value::List(items)
        }
        "enumerate" => {
            let start_kw = take_kw(&mut keywords, "start");
            no_more_kw(name, &keywords)?;
            arity(name, &args, 1, 2)?;
            let start = match args.get(1).or(start_kw.as_ref()) {
                Some(v) => expect_int(name, v)?,
                None => 0,
            };
            let items = iterate(args.remove(0))?;
            Value::List(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, v)| Value::Tuple(vec![Value::Int(start + i as i64), v]))
                    .collect(),
            )
        }
        "zip" => {
            no_more_kw(name, &keywords)?;
            let columns = args
                .into_iter()
                .map(iterate)
                .collect::<Result<Vec<_>, Exception>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            Value::List(
                (0..len)
                    .map(|i| Value::Tuple(columns.iter().map(|c| c[i].clone()).collect()))
                    .collect(),
            )
        }
        "round" => {
            let ndigits_kw = take_kw(&mut keywords, "ndigits");
            no_more_kw(name, &keywords)?;
            arity(name, &args, 1, 2)?;
            let ndigits = match args.get(1).or(ndigits_kw.as_ref()) {
                Some(Value::None) | None => None,
                Some(v) => Some(expect_int(name, v)?),
            };
            round_value(&args[0], ndigits)?
        }
        "any" => {
            arity(name, &args, 1, 1)?;
            Value::Bool(iterate(args.remove(0))?.iter().any(Value::truthy))
        }
        "all" => {
            arity(name, &args, 1, 1)?;
            Value::Bool(iterate(args.remove(0))?.iter().all(Value::truthy))
        }
        "map" => {
            no_more_kw(name, &keywords)?;
            if args.len() < 2 {
                return Err(Exception::type_error("map() must have at least two arguments.").into());
            }
            let func = args.remove(0);
            let columns = args
                .into_iter()
                .map(iterate)
                .collect::<Result<Vec<_>, Exception>>()?;
            let len = columns.iter().map(Vec::len).min().unwrap_or(0);
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                let call_args = columns.iter().map(|c| c[i].clone()).collect();
                out.push(interp.call_value(func.clone(), call_args, Vec::new())?);
            }
            Value::List(out)
        }
        "filter" => {
            no_more_kw(name, &keywords)?;
            arity(name, &args, 2, 2)?;
            let items = iterate(args.pop().unwrap_or_default())?;
            let func = args.remove(0);
            let mut out = Vec::new();
            for item in items {
                let keep = match &func {
                    Value::None => item.truthy(),
                    f => interp.call_value(f.clone(), vec![item.clone()], Vec::new())?.truthy(),
                };
                if keep {
                    out.push(item);
                }
            }
            Value::List(out)
        }
        other => {
            return Err(Exception::new("NameError", format!("The variable `{}` is not defined.", other)).into())
        }
    };
    Ok(result)
}

fn dict_from_pairs(value: Value) -> Result<Dict, Exception> {
    let mut dict = Dict::new();
    for pair in iterate(value)? {
        let mut kv = iterate(pair)?;
        if kv.len() != 2 {
            return Err(Exception::value_error(format!(
                "dictionary update sequence element has length {}; 2 is required",
                kv.len()
            )));
        }
        let v = kv.pop().unwrap_or_default();
        let k = kv.pop().unwrap_or_default();
        ops::check_hashable(&k)?;
        dict.insert(k, v);
    }
    Ok(dict)
}

fn round_value(value: &Value, ndigits: Option<i64>) -> Result<Value, Exception> {
    match value {
        Value::Float(f) => match ndigits {
            None => {
                if !f.is_finite() {
                    return Err(Exception::value_error("cannot round a non-finite float to an integer"));
                }
                Ok(Value::Int(f.round_ties_even() as i64))
            }
            Some(_) if !f.is_finite() => Ok(Value::Float(*f)),
            Some(n) if n >= 0 => {
                let factor = 10f64.powi(n.min(MAX_ROUND_DIGITS) as i32);
                let scaled = f * factor;
                // 精度超出 f64 可表示范围时原样返回
                if !factor.is_finite() || !scaled.is_finite() {
                    return Ok(Value::Float(*f));
                }
                Ok(Value::Float(scaled.round_ties_even() / factor))
            }
            Some(n) => {
                let factor = 10f64.powi(n.saturating_neg().min(MAX_ROUND_DIGITS) as i32);
                if !factor.is_finite() {
                    return Ok(Value::Float(0.0_f64.copysign(*f)));
                }
                Ok(Value::Float((f / factor).round_ties_even() * factor))
            }
        },
        v => {
            let i = expect_int("round", v)?;
            match ndigits {
                Some(n) if n < 0 => {
                    let factor = 10f64.powi(n.saturating_neg().min(MAX_ROUND_DIGITS) as i32);
                    if !factor.is_finite() {
                        return Ok(Value::Int(0));
                    }
                    Ok(Value::Int(((i as f64 / factor).round_ties_even() * factor) as i64))
                }
                _ => Ok(Value::Int(i)),
            }
        }
    }
}

// ---------------------------------------------------------------- 模块

pub(crate) fn module_attr(module: &str, attr: &str) -> Result<Value, Exception> {
    let value = match (module, attr) {
        ("math", "pi") => Some(Value::Float(std::f64::consts::PI)),
        ("math", "e") => Some(Value::Float(std::f64::consts::E)),
        ("math", "tau") => Some(Value::Float(std::f64::consts::TAU)),
        ("math", "inf") => Some(Value::Float(f64::INFINITY)),
        ("math", "nan") => Some(Value::Float(f64::NAN)),
        ("math", f) if MATH_FUNCTIONS.contains(&f) => Some(Value::Builtin(format!("math.{}", f))),
        ("statistics", f) if STATISTICS_FUNCTIONS.contains(&f) => {
            Some(Value::Builtin(format!("statistics.{}", f)))
        }
        _ => None,
    };
    value.ok_or_else(|| {
        Exception::new(
            "AttributeError",
            format!("module '{}' has no attribute '{}'", module, attr),
        )
    })
}

pub(crate) fn call_module(
    interp: &mut Interpreter,
    module: &str,
    attr: &str,
    args: Vec<Value>,
    keywords: Vec<(String, Value)>,
) -> Flow<Value> {
    match module_attr(module, attr)? {
        Value::Builtin(name) => call_builtin(interp, &name, args, keywords),
        other => Err(Exception::type_error(format!(
            "'{}' object is not callable",
            other.type_name()
        ))
        .into()),
    }
}

fn domain_error() -> Exception {
    Exception::value_error("math domain error")
}

fn call_math(func: &str, args: &[Value]) -> Result<Value, Exception> {
    let name = format!("math.{}", func);
    let num = |i: usize| -> Result<f64, Exception> {
        args.get(i)
            .ok_or_else(|| Exception::type_error(format!("{}() missing argument", name)))
            .and_then(|v| expect_number(&name, v))
    };
    let value = match func {
        "sqrt" => {
            arity(&name, args, 1, 1)?;
            let x = num(0)?;
            if x < 0.0 {
                return Err(domain_error());
            }
            Value::Float(x.sqrt())
        }
        "floor" | "ceil" | "trunc" => {
            arity(&name, args, 1, 1)?;
            if let Value::Int(i) = args[0] {
                return Ok(Value::Int(i));
            }
            let x = num(0)?;
            if !x.is_finite() {
                return Err(Exception::new("OverflowError", "cannot convert float infinity to integer"));
            }
            let r = match func {
                "floor" => x.floor(),
                "ceil" => x.ceil(),
                _ => x.trunc(),
            };
            Value::Int(r as i64)
        }
        "fabs" => {
            arity(&name, args, 1, 1)?;
            Value::Float(num(0)?.abs())
        }
        "pow" => {
            arity(&name, args, 2, 2)?;
            Value::Float(num(0)?.powf(num(1)?))
        }
        "exp" => {
            arity(&name, args, 1, 1)?;
            Value::Float(num(0)?.exp())
        }
        "log" => {
            arity(&name, args, 1, 2)?;
            let x = num(0)?;
            if x <= 0.0 {
                return Err(domain_error());
            }
            match args.len() {
                2 => Value::Float(x.ln() / num(1)?.ln()),
                _ => Value::Float(x.ln()),
            }
        }
        "log10" | "log2" => {
            arity(&name, args, 1, 1)?;
            let x = num(0)?;
            if x <= 0.0 {
                return Err(domain_error());
            }
            Value::Float(if func == "log10" { x.log10() } else { x.log2() })
        }
        "sin" | "cos" | "tan" | "atan" | "degrees" | "radians" => {
            arity(&name, args, 1, 1)?;
            let x = num(0)?;
            Value::Float(match func {
                "sin" => x.sin(),
                "cos" => x.cos(),
                "tan" => x.tan(),
                "atan" => x.atan(),
                "degrees" => x.to_degrees(),
                _ => x.to_radians(),
            })
        }
        "asin" | "acos" => {
            arity(&name, args, 1, 1)?;
            let x = num(0)?;
            if !(-1.0..=1.0).contains(&x) {
                return Err(domain_error());
            }
            Value::Float(if func == "asin" { x.asin() } else { x.acos() })
        }
        "atan2" => {
            arity(&name, args, 2, 2)?;
            Value::Float(num(0)?.atan2(num(1)?))
        }
        "copysign" => {
            arity(&name, args, 2, 2)?;
            Value::Float(num(0)?.copysign(num(1)?))
        }
        "hypot" => {
            let mut acc = 0.0f64;
            for i in 0..args.len() {
                acc = acc.hypot(num(i)?);
            }
            Value::Float(acc)
        }
        "dist" => {
            arity(&name, args, 2, 2)?;
            let p = iterate(args[0].clone())?;
            let q = iterate(args[1].clone())?;
            if p.len() != q.len() {
                return Err(Exception::value_error("both points must have the same number of dimensions"));
            }
            let mut acc = 0.0f64;
            for (a, b) in p.iter().zip(q.iter()) {
                acc = acc.hypot(expect_number(&name, a)? - expect_number(&name, b)?);
            }
            Value::Float(acc)
        }
        "isclose" => {
            arity(&name, args, 2, 2)?;
            let (a, b) = (num(0)?, num(1)?);
            let tol = 1e-9 * a.abs().max(b.abs());
            Value::Bool(a == b || (a - b).abs() <= tol)
        }
        other => {
            return Err(Exception::new(
                "AttributeError",
                format!("module 'math' has no attribute '{}'", other),
            ))
        }
    };
    Ok(value)
}

fn call_statistics(func: &str, mut args: Vec<Value>) -> Result<Value, Exception> {
    let name = format!("statistics.{}", func);
    arity(&name, &args, 1, 1)?;
    let data = iterate(args.remove(0))?;
    if data.is_empty() {
        return Err(Exception::new(
            "StatisticsError",
            format!("{} requires at least one data point", func),
        ));
    }
    if func == "mode" {
        let mut best: Option<(&Value, usize)> = None;
        for item in &data {
            let count = data.iter().filter(|v| v.py_eq(item)).count();
            if best.map(|(_, c)| count > c).unwrap_or(true) {
                best = Some((item, count));
            }
        }
        return Ok(best.map(|(v, _)| v.clone()).unwrap_or_default());
    }
    let nums = data
        .iter()
        .map(|v| expect_number(&name, v))
        .collect::<Result<Vec<f64>, Exception>>()?;
    let n = nums.len() as f64;
    let mean = nums.iter().sum::<f64>() / n;
    let squares = nums.iter().map(|x| (x - mean).powi(2)).sum::<f64>();
    let value = match func {
        "mean" => mean,
        "median" => {
            let mut sorted = nums.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
            let mid = sorted.len() / 2;
            if sorted.len() % 2 == 1 {
                // 奇数长度返回原值，保持 int
                let mut original: Vec<&Value> = data.iter().collect();
                original.sort_by(|a, b| compare_values(a, b, "<").unwrap_or(Ordering::Equal));
                return Ok(original[mid].clone());
            }
            (sorted[mid - 1] + sorted[mid]) / 2.0
        }
        "pstdev" => (squares / n).sqrt(),
        "stdev" | "variance" => {
            if nums.len() < 2 {
                return Err(Exception::new(
                    "StatisticsError",
                    format!("{} requires at least two data points", func),
                ));
            }
            let var = squares / (n - 1.0);
            if func == "stdev" {
                var.sqrt()
            } else {
                var
            }
        }
        other => {
            return Err(Exception::new(
                "AttributeError",
                format!("module 'statistics' has no attribute '{}'", other),
            ))
        }
    };
    Ok(Value::Float(value))
}

// ---------------------------------------------------------------- 方法

pub(crate) fn call_method(
    interp: &mut Interpreter,
    receiver: &mut Value,
    name: &str,
    args: Vec<Value>,
    keywords: Vec<(String, Value)>,
) -> Flow<Value> {
    match receiver {
        Value::Str(s) => Ok(str_method(s, name, args, keywords)?),
        Value::List(items) => list_method(interp, items, name, args, keywords),
        Value::Dict(dict) => Ok(dict_method(dict, name, args, keywords)?),
        Value::Tuple(items) if matches!(name, "index" | "count") => {
            no_more_kw(name, &keywords)?;
            Ok(sequence_search(items, name, &args, "tuple")?)
        }
        other => Err(no_attribute(other, name).into()),
    }
}

fn no_attribute(v: &Value, name: &str) -> Exception {
    Exception::new(
        "AttributeError",
        format!("'{}' object has no attribute '{}'", v.type_name(), name),
    )
}

fn sequence_search(items: &[Value], name: &str, args: &[Value], kind: &str) -> Result<Value, Exception> {
    arity(name, args, 1, 1)?;
    let needle = &args[0];
    if name == "count" {
        return Ok(Value::Int(items.iter().filter(|v| v.py_eq(needle)).count() as i64));
    }
    items
        .iter()
        .position(|v| v.py_eq(needle))
        .map(|i| Value::Int(i as i64))
        .ok_or_else(|| Exception::value_error(format!("{}.index(x): x not in {}", kind, kind)))
}

fn list_method(
    interp: &mut Interpreter,
    items: &mut Vec<Value>,
    name: &str,
    mut args: Vec<Value>,
    mut keywords: Vec<(String, Value)>,
) -> Flow<Value> {
    if name == "sort" {
        let key = take_kw(&mut keywords, "key");
        let reverse = take_kw(&mut keywords, "reverse").map(|v| v.truthy()).unwrap_or(false);
        no_more_kw(name, &keywords)?;
        arity(name, &args, 0, 0)?;
        let sorted = sort_values(interp, std::mem::take(items), key, reverse)?;
        *items = sorted;
        return Ok(Value::None);
    }
    no_more_kw(name, &keywords)?;
    let result = match name {
        "append" => {
            arity(name, &args, 1, 1)?;
            items.push(args.remove(0));
            Value::None
        }
        "extend" => {
            arity(name, &args, 1, 1)?;
            items.extend(iterate(args.remove(0))?);
            Value::None
        }
        "insert" => {
            arity(name, &args, 2, 2)?;
            let len = items.len() as i64;
            let idx = expect_int(name, &args[0])?;
            let idx = if idx < 0 { (idx + len).max(0) } else { idx.min(len) };
            items.insert(idx as usize, args.remove(1));
            Value::None
        }
        "pop" => {
            arity(name, &args, 0, 1)?;
            if items.is_empty() {
                return Err(Exception::new("IndexError", "pop from empty list").into());
            }
            let len = items.len() as i64;
            let idx = match args.first() {
                Some(v) => expect_int(name, v)?,
                None => -1,
            };
            let idx = if idx < 0 { idx + len } else { idx };
            if idx < 0 || idx >= len {
                return Err(Exception::new("IndexError", "pop index out of range").into());
            }
            items.remove(idx as usize)
        }
        "remove" => {
            arity(name, &args, 1, 1)?;
            match items.iter().position(|v| v.py_eq(&args[0])) {
                Some(i) => {
                    items.remove(i);
                }
                None => {
                    return Err(Exception::value_error("list.remove(x): x not in list").into())
                }
            }
            Value::None
        }
        "index" | "count" => sequence_search(items, name, &args, "list")?,
        "copy" => {
            arity(name, &args, 0, 0)?;
            Value::List(items.clone())
        }
        "clear" => {
            arity(name, &args, 0, 0)?;
            items.clear();
            Value::None
        }
        "reverse" => {
            arity(name, &args, 0, 0)?;
            items.reverse();
            Value::None
        }
        other => return Err(no_attribute(&Value::List(Vec::new()), other).into()),
    };
    Ok(result)
}

fn dict_method(
    dict: &mut Dict,
    name: &str,
    mut args: Vec<Value>,
    mut keywords: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    if name == "update" {
        arity(name, &args, 0, 1)?;
        if let Some(other) = args.pop() {
            let other = match other {
                Value::Dict(d) => d,
                pairs => dict_from_pairs(pairs)?,
            };
            for (k, v) in other.iter() {
                dict.insert(k.clone(), v.clone());
            }
        }
        for (k, v) in keywords.drain(..) {
            dict.insert(Value::Str(k), v);
        }
        return Ok(Value::None);
    }
    no_more_kw(name, &keywords)?;
    let result = match name {
        "get" => {
            arity(name, &args, 1, 2)?;
            let default = if args.len() == 2 { args.pop().unwrap_or_default() } else { Value::None };
            dict.get(&args[0]).cloned().unwrap_or(default)
        }
        "keys" => {
            arity(name, &args, 0, 0)?;
            Value::List(dict.keys().cloned().collect())
        }
        "values" => {
            arity(name, &args, 0, 0)?;
            Value::List(dict.values().cloned().collect())
        }
        "items" => {
            arity(name, &args, 0, 0)?;
            Value::List(
                dict.iter()
                    .map(|(k, v)| Value::Tuple(vec![k.clone(), v.clone()]))
                    .collect(),
            )
        }
        "pop" => {
            arity(name, &args, 1, 2)?;
            let default = if args.len() == 2 { args.pop() } else { None };
            match (dict.remove(&args[0]), default) {
                (Some(v), _) => v,
                (None, Some(d)) => d,
                (None, None) => return Err(Exception::new("KeyError", args[0].repr())),
            }
        }
        "setdefault" => {
            arity(name, &args, 1, 2)?;
            let default = if args.len() == 2 { args.pop().unwrap_or_default() } else { Value::None };
            let key = args.remove(0);
            ops::check_hashable(&key)?;
            match dict.get(&key) {
                Some(v) => v.clone(),
                None => {
                    dict.insert(key, default.clone());
                    default
                }
            }
        }
        "copy" => {
            arity(name, &args, 0, 0)?;
            Value::Dict(dict.clone())
        }
        "clear" => {
            arity(name, &args, 0, 0)?;
            dict.clear();
            Value::None
        }
        other => return Err(no_attribute(&Value::Dict(Dict::new()), other)),
    };
    Ok(result)
}

fn str_method(
    s: &str,
    name: &str,
    mut args: Vec<Value>,
    mut keywords: Vec<(String, Value)>,
) -> Result<Value, Exception> {
    if name == "format" {
        return Ok(Value::Str(format_template(s, &args, &keywords)?));
    }
    if name == "split" {
        let sep_kw = take_kw(&mut keywords, "sep");
        let max_kw = take_kw(&mut keywords, "maxsplit");
        no_more_kw(name, &keywords)?;
        arity(name, &args, 0, 2)?;
        let maxsplit = match args.get(1).or(max_kw.as_ref()) {
            Some(v) => expect_int(name, v)?,
            None => -1,
        };
        let sep = match args.first().or(sep_kw.as_ref()) {
            Some(Value::None) | None => None,
            Some(v) => Some(expect_str(name, v)?.to_string()),
        };
        return split(s, sep.as_deref(), maxsplit);
    }
    no_more_kw(name, &keywords)?;
    let strip_chars = |args: &[Value]| -> Result<Option<Vec<char>>, Exception> {
        match args.first() {
            Some(Value::None) | None => Ok(None),
            Some(v) => Ok(Some(expect_str(name, v)?.chars().collect())),
        }
    };
    let result = match name {
        "lower" => Value::Str(s.to_lowercase()),
        "upper" => Value::Str(s.to_uppercase()),
        "strip" | "lstrip" | "rstrip" => {
            arity(name, &args, 0, 1)?;
            let chars = strip_chars(&args)?;
            let matcher = |c: char| match &chars {
                Some(set) => set.contains(&c),
                None => c.is_whitespace(),
            };
            Value::str(match name {
                "strip" => s.trim_matches(matcher),
                "lstrip" => s.trim_start_matches(matcher),
                _ => s.trim_end_matches(matcher),
            })
        }
        "join" => {
            arity(name, &args, 1, 1)?;
            let parts = iterate(args.remove(0))?;
            let mut strings = Vec::with_capacity(parts.len());
            for (i, part) in parts.iter().enumerate() {
                match part {
                    Value::Str(p) => strings.push(p.as_str()),
                    other => {
                        return Err(Exception::type_error(format!(
                            "sequence item {}: expected str instance, {} found",
                            i,
                            other.type_name()
                        )))
                    }
                }
            }
            Value::Str(strings.join(s))
        }
        "replace" => {
            arity(name, &args, 2, 3)?;
            let old = expect_str(name, &args[0])?;
            let new = expect_str(name, &args[1])?;
            if new.len() > old.len() {
                let hits = if old.is_empty() { s.chars().count() + 1 } else { s.matches(old).count() };
                let grown = hits.saturating_mul(new.len() - old.len()).saturating_add(s.len());
                if grown > ops::MAX_REPEAT_LEN {
                    return Err(Exception::new("MemoryError", "replaced string is too large"));
                }
            }
            match args.get(2) {
                Some(count) => {
                    let n = expect_int(name, count)?;
                    if n < 0 {
                        Value::Str(s.replace(old, new))
                    } else {
                        Value::Str(s.replacen(old, new, n as usize))
                    }
                }
                None => Value::Str(s.replace(old, new)),
            }
        }
        "startswith" | "endswith" => {
            arity(name, &args, 1, 1)?;
            let candidates = match &args[0] {
                Value::Tuple(items) => items.clone(),
                other => vec![other.clone()],
            };
            let mut hit = false;
            for c in &candidates {
                let c = expect_str(name, c)?;
                if (name == "startswith" && s.starts_with(c)) || (name == "endswith" && s.ends_with(c)) {
                    hit = true;
                    break;
                }
            }
            Value::Bool(hit)
        }
        "find" | "index" => {
            arity(name, &args, 1, 1)?;
            let sub = expect_str(name, &args[0])?;
            match s.find(sub) {
                Some(byte) => Value::Int(s[..byte].chars().count() as i64),
                None if name == "find" => Value::Int(-1),
                None => return Err(Exception::value_error("substring not found")),
            }
        }
        "count" => {
            arity(name, &args, 1, 1)?;
            let sub = expect_str(name, &args[0])?;
            if sub.is_empty() {
                Value::Int(s.chars().count() as i64 + 1)
            } else {
                Value::Int(s.matches(sub).count() as i64)
            }
        }
        "title" => {
            let mut out = String::with_capacity(s.len());
            let mut prev_alpha = false;
            for c in s.chars() {
                if c.is_alphabetic() {
                    if prev_alpha {
                        out.extend(c.to_lowercase());
                    } else {
                        out.extend(c.to_uppercase());
                    }
                    prev_alpha = true;
                } else {
                    out.push(c);
                    prev_alpha = false;
                }
            }
            Value::Str(out)
        }
        "capitalize" => {
            let mut chars = s.chars();
            Value::Str(match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            })
        }
        "isdigit" => Value::Bool(!s.is_empty() && s.chars().all(|c| c.is_ascii_digit())),
        "isalpha" => Value::Bool(!s.is_empty() && s.chars().all(char::is_alphabetic)),
        "splitlines" => Value::List(s.lines().map(Value::str).collect()),
        other => return Err(no_attribute(&Value::Str(String::new()), other)),
    };
    Ok(result)
}

fn split(s: &str, sep: Option<&str>, maxsplit: i64) -> Result<Value, Exception> {
    let parts: Vec<Value> = match sep {
        None => {
            if maxsplit < 0 {
                s.split_whitespace().map(Value::str).collect()
            } else {
                let mut out = Vec::new();
                let mut rest = s.trim_start();
                while !rest.is_empty() && (out.len() as i64) < maxsplit {
                    match rest.find(char::is_whitespace) {
                        Some(i) => {
                            out.push(Value::str(&rest[..i]));
                            rest = rest[i..].trim_start();
                        }
                        None => {
                            out.push(Value::str(rest));
                            rest = "";
                        }
                    }
                }
                if !rest.is_empty() {
                    out.push(Value::str(rest));
                }
                out
            }
        }
        Some("") => return Err(Exception::value_error("empty separator")),
        Some(sep) => {
            if maxsplit < 0 {
                s.split(sep).map(Value::str).collect()
            } else {
                s.splitn(maxsplit as usize + 1, sep).map(Value::str).collect()
            }
        }
    };
    Ok(Value::List(parts))
}

// ---------------------------------------------------------------- 格式化

/// `str.format` 模板：`{}`、`{0}`、`{name}`，可带 `!r` 与 `:spec`
fn format_template(template: &str, args: &[Value], keywords: &[(String, Value)]) -> Result<String, Exception> {
    let chars: Vec<char> = template.chars().collect();
    let mut out = String::new();
    let mut auto_index = 0usize;
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '{' if chars.get(i + 1) == Some(&'{') => {
                out.push('{');
                i += 2;
            }
            '}' if chars.get(i + 1) == Some(&'}') => {
                out.push('}');
                i += 2;
            }
            '{' => {
                let end = chars[i..]
                    .iter()
                    .position(|c| *c == '}')
                    .map(|p| p + i)
                    .ok_or_else(|| Exception::value_error("expected '}' before end of string"))?;
                let field: String = chars[i + 1..end].iter().collect();
                let (field, spec) = match field.split_once(':') {
                    Some((f, s)) => (f.to_string(), Some(s.to_string())),
                    None => (field, None),
                };
                let (field, repr) = match field.strip_suffix("!r") {
                    Some(f) => (f.to_string(), true),
                    None => (field.strip_suffix("!s").unwrap_or(&field).to_string(), false),
                };
                let value = if field.is_empty() {
                    let v = args.get(auto_index);
                    auto_index += 1;
                    v
                } else if let Ok(idx) = field.parse::<usize>() {
                    args.get(idx)
                } else {
                    keywords.iter().find(|(k, _)| *k == field).map(|(_, v)| v)
                };
                let value = value.ok_or_else(|| {
                    if field.is_empty() || field.parse::<usize>().is_ok() {
                        Exception::new("IndexError", "Replacement index out of range for positional args tuple")
                    } else {
                        Exception::new("KeyError", Value::Str(field.clone()).repr())
                    }
                })?;
                let text = if repr {
                    value.repr()
                } else {
                    match &spec {
                        Some(spec) => format_value(value, spec)?,
                        None => value.to_string(),
                    }
                };
                out.push_str(&text);
                i = end + 1;
            }
            '}' => return Err(Exception::value_error("Single '}' encountered in format string")),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// 格式说明：`[[fill]align][sign][0][width][,][.precision][type]`
pub(crate) fn format_value(value: &Value, spec: &str) -> Result<String, Exception> {
    let chars: Vec<char> = spec.chars().collect();
    let mut i = 0;
    let mut fill = ' ';
    let mut align: Option<char> = None;
    if chars.len() >= 2 && matches!(chars[1], '<' | '>' | '^' | '=') {
        fill = chars[0];
        align = Some(chars[1]);
        i = 2;
    } else if !chars.is_empty() && matches!(chars[0], '<' | '>' | '^' | '=') {
        align = Some(chars[0]);
        i = 1;
    }
    let mut sign_plus = false;
    if i < chars.len() && matches!(chars[i], '+' | '-' | ' ') {
        sign_plus = chars[i] == '+';
        i += 1;
    }
    if i < chars.len() && chars[i] == '0' && align.is_none() {
        fill = '0';
        align = Some('=');
        i += 1;
    }
    let mut width = 0usize;
    while i < chars.len() && chars[i].is_ascii_digit() {
        width = push_digit(width, chars[i])?;
        i += 1;
    }
    let mut grouping = false;
    if i < chars.len() && matches!(chars[i], ',' | '_') {
        grouping = true;
        i += 1;
    }
    let mut precision: Option<usize> = None;
    if i < chars.len() && chars[i] == '.' {
        i += 1;
        let mut p = 0usize;
        while i < chars.len() && chars[i].is_ascii_digit() {
            p = push_digit(p, chars[i])?;
            i += 1;
        }
        precision = Some(p);
    }
    let kind = chars.get(i).copied();
    if i + 1 < chars.len() {
        return Err(Exception::value_error(format!("Invalid format specifier '{}'", spec)));
    }

    let bad_code = |code: char| {
        Exception::value_error(format!(
            "Unknown format code '{}' for object of type '{}'",
            code,
            value.type_name()
        ))
    };
    let is_numeric = value.is_number();
    let mut body = match kind {
        Some('f') | Some('F') => {
            let x = value.as_f64().ok_or_else(|| bad_code('f'))?;
            format!("{:.*}", precision.unwrap_or(6), x)
        }
        Some('%') => {
            let x = value.as_f64().ok_or_else(|| bad_code('%'))?;
            format!("{:.*}%", precision.unwrap_or(6), x * 100.0)
        }
        Some('e') | Some('E') => {
            let x = value.as_f64().ok_or_else(|| bad_code('e'))?;
            python_exponent(&format!("{:.*e}", precision.unwrap_or(6), x))
        }
        Some('d') => match value {
            Value::Int(_) | Value::Bool(_) => value.as_i64().unwrap_or(0).to_string(),
            _ => return Err(bad_code('d')),
        },
        Some('g') | Some('G') => {
            let x = value.as_f64().ok_or_else(|| bad_code('g'))?;
            format_general(x, precision.unwrap_or(6))
        }
        Some('s') | None => match (value, precision) {
            (Value::Float(x), Some(p)) => format_general(*x, p),
            (Value::Str(s), Some(p)) => s.chars().take(p).collect(),
            (v, _) => v.to_string(),
        },
        Some(other) => return Err(bad_code(other)),
    };

    if grouping && is_numeric {
        body = group_thousands(&body);
    }
    if sign_plus && is_numeric && !body.starts_with('-') {
        body.insert(0, '+');
    }

    let len = body.chars().count();
    if len >= width {
        return Ok(body);
    }
    let pad = width - len;
    let align = align.unwrap_or(if is_numeric { '>' } else { '<' });
    let fill_str = |n: usize| std::iter::repeat(fill).take(n).collect::<String>();
    Ok(match align {
        '<' => format!("{}{}", body, fill_str(pad)),
        '^' => format!("{}{}{}", fill_str(pad / 2), body, fill_str(pad - pad / 2)),
        '=' => {
            let (sign, digits) = match body.chars().next() {
                Some(c @ ('-' | '+')) => (c.to_string(), body[1..].to_string()),
                _ => (String::new(), body.clone()),
            };
            format!("{}{}{}", sign, fill_str(pad), digits)
        }
        _ => format!("{}{}", fill_str(pad), body),
    })
}

/// 累加宽度或精度的一位数字
fn push_digit(acc: usize, digit: char) -> Result<usize, Exception> {
    let next = acc * 10 + digit.to_digit(10).unwrap_or(0) as usize;
    if next > MAX_FORMAT_WIDTH {
        return Err(Exception::value_error("Too many decimal digits in format string"));
    }
    Ok(next)
}

fn pad_to(body: String, width: usize, left: bool, zero: bool) -> String {
    let len = body.chars().count();
    if len >= width {
        return body;
    }
    let pad = width - len;
    if left {
        return format!("{}{}", body, " ".repeat(pad));
    }
    if zero {
        let split = if body.starts_with(['-', '+', ' ']) { 1 } else { 0 };
        return format!("{}{}{}", &body[..split], "0".repeat(pad), &body[split..]);
    }
    format!("{}{}", " ".repeat(pad), body)
}

/// printf 风格的 `template % args`：`%s %r %d %i %f %e %g %x %o %c %%`，
/// 支持 `%(name)s`、`-+ 0#` 标志、宽度（含 `*`）与精度
pub(crate) fn percent_format(template: &str, args: Value) -> Result<String, Exception> {
    let mapping = match &args {
        Value::Dict(d) => Some(d.clone()),
        _ => None,
    };
    let positional = match args {
        Value::Tuple(items) => items,
        other => vec![other],
    };
    let mut next_arg = positional.into_iter();
    let mut take_arg = || {
        next_arg
            .next()
            .ok_or_else(|| Exception::type_error("not enough arguments for format string"))
    };

    let chars: Vec<char> = template.chars().collect();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    while i < chars.len() {
        if chars[i] != '%' {
            out.push(chars[i]);
            i += 1;
            continue;
        }
        i += 1;
        let mut keyed: Option<Value> = None;
        if chars.get(i) == Some(&'(') {
            let end = chars[i..]
                .iter()
                .position(|c| *c == ')')
                .map(|p| p + i)
                .ok_or_else(|| Exception::value_error("incomplete format key"))?;
            let key: String = chars[i + 1..end].iter().collect();
            let dict = mapping
                .as_ref()
                .ok_or_else(|| Exception::type_error("format requires a mapping"))?;
            keyed = Some(
                dict.get(&Value::Str(key.clone()))
                    .cloned()
                    .ok_or_else(|| Exception::new("KeyError", Value::Str(key).repr()))?,
            );
            i = end + 1;
        }
        let (mut left, mut zero, mut plus, mut space, mut alt) = (false, false, false, false, false);
        while let Some(flag) = chars.get(i) {
            match flag {
                '-' => left = true,
                '0' => zero = true,
                '+' => plus = true,
                ' ' => space = true,
                '#' => alt = true,
                _ => break,
            }
            i += 1;
        }
        let mut width = 0usize;
        if chars.get(i) == Some(&'*') {
            let w = take_arg()?;
            let w = w.as_i64().ok_or_else(|| Exception::type_error("* wants int"))?;
            if w < 0 {
                left = true;
            }
            width = usize::try_from(w.unsigned_abs()).unwrap_or(usize::MAX).min(MAX_FORMAT_WIDTH);
            i += 1;
        }
        while let Some(d) = chars.get(i).filter(|c| c.is_ascii_digit()) {
            width = push_digit(width, *d)?;
            i += 1;
        }
        let mut precision: Option<usize> = None;
        if chars.get(i) == Some(&'.') {
            i += 1;
            let mut p = 0usize;
            while let Some(d) = chars.get(i).filter(|c| c.is_ascii_digit()) {
                p = push_digit(p, *d)?;
                i += 1;
            }
            precision = Some(p);
        }
        let Some(&conv) = chars.get(i) else {
            return Err(Exception::value_error("incomplete format"));
        };
        i += 1;
        if conv == '%' {
            out.push('%');
            continue;
        }
        let value = match keyed.take() {
            Some(v) => v,
            None => take_arg()?,
        };
        let truncate = |text: String| match precision {
            Some(p) => text.chars().take(p).collect(),
            None => text,
        };
        let int_arg = |v: &Value, allow_float: bool| -> Result<i64, Exception> {
            match v {
                Value::Float(f) if allow_float && f.is_finite() => Ok(f.trunc() as i64),
                Value::Float(f) if allow_float => Err(Exception::new(
                    "OverflowError",
                    format!("cannot convert float {} to integer", format_float(*f)),
                )),
                other => other.as_i64().ok_or_else(|| {
                    Exception::type_error(format!(
                        "%{} format: a real number is required, not {}",
                        conv,
                        other.type_name()
                    ))
                }),
            }
        };
        let (mut body, numeric) = match conv {
            's' => (truncate(value.to_string()), false),
            'r' | 'a' => (truncate(value.repr()), false),
            'd' | 'i' | 'u' => (int_arg(&value, true)?.to_string(), true),
            'x' | 'X' | 'o' => {
                let n = int_arg(&value, false)?;
                let digits = match conv {
                    'x' => format!("{:x}", n.unsigned_abs()),
                    'X' => format!("{:X}", n.unsigned_abs()),
                    _ => format!("{:o}", n.unsigned_abs()),
                };
                let prefix = match (alt, conv) {
                    (true, 'x') => "0x",
                    (true, 'X') => "0X",
                    (true, _) => "0o",
                    _ => "",
                };
                let sign = if n < 0 { "-" } else { "" };
                (format!("{}{}{}", sign, prefix, digits), true)
            }
            'f' | 'F' | 'e' | 'E' | 'g' | 'G' => {
                let x = value.as_f64().ok_or_else(|| {
                    Exception::type_error(format!("must be real number, not {}", value.type_name()))
                })?;
                let spec = format!(".{}{}", precision.unwrap_or(6), conv);
                (format_value(&Value::Float(x), &spec)?, true)
            }
            'c' => {
                let c = match &value {
                    Value::Str(s) if s.chars().count() == 1 => s.clone(),
                    v => {
                        let code = int_arg(v, false)?;
                        u32::try_from(code)
                            .ok()
                            .and_then(char::from_u32)
                            .map(String::from)
                            .ok_or_else(|| Exception::new("OverflowError", "%c arg not in range(0x110000)"))?
                    }
                };
                (c, false)
            }
            other => {
                return Err(Exception::value_error(format!(
                    "unsupported format character '{}' (0x{:x})",
                    other, other as u32
                )))
            }
        };
        if numeric && !body.starts_with('-') {
            if plus {
                body.insert(0, '+');
            } else if space {
                body.insert(0, ' ');
            }
        }
        out.push_str(&pad_to(body, width, left, zero && numeric));
    }
    if mapping.is_none() && next_arg.next().is_some() {
        return Err(Exception::type_error("not all arguments converted during string formatting"));
    }
    Ok(out)
}

/// Rust 的 `1.5e2` 改写为 Python 的 `1.5e+02`
fn python_exponent(s: &str) -> String {
    match s.split_once('e') {
        Some((mantissa, exp)) => {
            let (sign, digits) = match exp.strip_prefix('-') {
                Some(d) => ('-', d),
                None => ('+', exp),
            };
            format!("{}e{}{:0>2}", mantissa, sign, digits)
        }
        None => s.to_string(),
    }
}

fn format_general(x: f64, precision: usize) -> String {
    if x == 0.0 || !x.is_finite() {
        return format_float(x).trim_end_matches(".0").to_string();
    }
    let p = precision.max(1);
    let exp = x.abs().log10().floor() as i32;
    if exp < -4 || exp >= p as i32 {
        let s = format!("{:.*e}", p - 1, x);
        let (mantissa, e) = s.split_once('e').unwrap_or((&s, "0"));
        let mantissa = strip_zeros(mantissa);
        python_exponent(&format!("{}e{}", mantissa, e))
    } else {
        let decimals = (p as i32 - 1 - exp).max(0) as usize;
        strip_zeros(&format!("{:.*}", decimals, x))
    }
}

fn strip_zeros(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

fn group_thousands(body: &str) -> String {
    let (sign, rest) = match body.strip_prefix('-') {
        Some(r) => ("-", r),
        None => ("", body),
    };
    let (int_part, frac) = match rest.find(|c: char| !c.is_ascii_digit()) {
        Some(i) => (&rest[..i], &rest[i..]),
        None => (rest, ""),
    };
    let mut grouped = String::new();
    for (i, c) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(c);
    }
    format!("{}{}{}", sign, grouped, frac)
}
