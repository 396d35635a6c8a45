//! 纯值运算：算术、比较、成员测试、下标与切片
//!
//! 不依赖解释器状态；错误以 Exception 返回，由解释器决定能否被 try/except 捕获。

use std::cmp::Ordering;

use crate::sandbox::ast::{BinOp, CmpOp};
use crate::sandbox::builtins;
use crate::sandbox::interpreter::Exception;
use crate::sandbox::value::Value;

/// 单个序列（重复、拼接、替换产生的字符串或列表）长度上限
pub(crate) const MAX_REPEAT_LEN: usize = 10_000_000;

/// 容器的元素数（字符串按字节）；标量为 0
pub(crate) fn element_count(v: &Value) -> usize {
    match v {
        Value::Str(s) => s.len(),
        Value::List(items) | Value::Tuple(items) => items.len(),
        Value::Dict(d) => d.len(),
        _ => 0,
    }
}

/// binop 将产出的元素数，供解释器在分配前按工作量计费
pub(crate) fn result_len(op: BinOp, l: &Value, r: &Value) -> usize {
    match (op, l, r) {
        (BinOp::Add, a, b) if !a.is_number() => element_count(a).saturating_add(element_count(b)),
        (BinOp::Mul, seq, n) | (BinOp::Mul, n, seq) if !seq.is_number() && n.as_i64().is_some() => {
            let times = usize::try_from(n.as_i64().unwrap_or(0)).unwrap_or(0);
            element_count(seq).saturating_mul(times)
        }
        (BinOp::Mod, Value::Str(s), _) => s.len(),
        _ => 0,
    }
}

fn unsupported(op: &str, l: &Value, r: &Value) -> Exception {
    Exception::type_error(format!(
        "unsupported operand type(s) for {}: '{}' and '{}'",
        op,
        l.type_name(),
        r.type_name()
    ))
}

fn overflow() -> Exception {
    Exception::new("OverflowError", "integer result too large")
}

pub(crate) fn binop(op: BinOp, l: Value, r: Value) -> Result<Value, Exception> {
    // int (含 bool) 路径
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        return int_binop(op, a, b);
    }
    if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
        return float_binop(op, a, b);
    }
    match (op, l, r) {
        (BinOp::Add, Value::Str(a), Value::Str(b)) => Ok(Value::Str(a + &b)),
        (BinOp::Add, Value::List(mut a), Value::List(b)) => {
            a.extend(b);
            Ok(Value::List(a))
        }
        (BinOp::Add, Value::Tuple(mut a), Value::Tuple(b)) => {
            a.extend(b);
            Ok(Value::Tuple(a))
        }
        (BinOp::Mod, Value::Str(template), args) => Ok(Value::Str(builtins::percent_format(&template, args)?)),
        (BinOp::Mul, Value::Str(s), n) | (BinOp::Mul, n, Value::Str(s)) if n.as_i64().is_some() => {
            let times = repeat_count(n.as_i64().unwrap_or(0), s.len())?;
            Ok(Value::Str(s.repeat(times)))
        }
        (BinOp::Mul, Value::List(items), n) | (BinOp::Mul, n, Value::List(items))
            if n.as_i64().is_some() =>
        {
            let times = repeat_count(n.as_i64().unwrap_or(0), items.len())?;
            Ok(Value::List(repeat_items(&items, times)))
        }
        (BinOp::Mul, Value::Tuple(items), n) | (BinOp::Mul, n, Value::Tuple(items))
            if n.as_i64().is_some() =>
        {
            let times = repeat_count(n.as_i64().unwrap_or(0), items.len())?;
            Ok(Value::Tuple(repeat_items(&items, times)))
        }
        (op, l, r) => Err(unsupported(op.symbol(), &l, &r)),
    }
}

fn repeat_count(n: i64, unit: usize) -> Result<usize, Exception> {
    if n <= 0 {
        return Ok(0);
    }
    let times = n as usize;
    if unit.saturating_mul(times) > MAX_REPEAT_LEN {
        return Err(Exception::new("MemoryError", "repeated sequence is too large"));
    }
    Ok(times)
}

fn repeat_items(items: &[Value], times: usize) -> Vec<Value> {
    let mut out = Vec::with_capacity(items.len() * times);
    for _ in 0..times {
        out.extend(items.iter().cloned());
    }
    out
}

fn int_binop(op: BinOp, a: i64, b: i64) -> Result<Value, Exception> {
    let v = match op {
        BinOp::Add => a.checked_add(b).ok_or_else(overflow)?,
        BinOp::Sub => a.checked_sub(b).ok_or_else(overflow)?,
        BinOp::Mul => a.checked_mul(b).ok_or_else(overflow)?,
        BinOp::Div => {
            if b == 0 {
                return Err(Exception::zero_division("division by zero"));
            }
            return Ok(Value::Float(a as f64 / b as f64));
        }
        BinOp::FloorDiv => {
            if b == 0 {
                return Err(Exception::zero_division("integer division or modulo by zero"));
            }
            let q = a.checked_div(b).ok_or_else(overflow)?;
            if a % b != 0 && ((a < 0) != (b < 0)) {
                q - 1
            } else {
                q
            }
        }
        BinOp::Mod => {
            if b == 0 {
                return Err(Exception::zero_division("integer modulo by zero"));
            }
            let r = a.checked_rem(b).ok_or_else(overflow)?;
            if r != 0 && ((r < 0) != (b < 0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if b < 0 {
                if a == 0 {
                    return Err(Exception::zero_division(
                        "0.0 cannot be raised to a negative power",
                    ));
                }
                return Ok(Value::Float((a as f64).powf(b as f64)));
            }
            let exp = u32::try_from(b).map_err(|_| overflow())?;
            a.checked_pow(exp).ok_or_else(overflow)?
        }
    };
    Ok(Value::Int(v))
}

fn float_binop(op: BinOp, a: f64, b: f64) -> Result<Value, Exception> {
    let v = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(Exception::zero_division("float division by zero"));
            }
            a / b
        }
        BinOp::FloorDiv => {
            if b == 0.0 {
                return Err(Exception::zero_division("float floor division by zero"));
            }
            (a / b).floor()
        }
        BinOp::Mod => {
            if b == 0.0 {
                return Err(Exception::zero_division("float modulo"));
            }
            let r = a % b;
            if r != 0.0 && ((r < 0.0) != (b < 0.0)) {
                r + b
            } else {
                r
            }
        }
        BinOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(Exception::zero_division(
                    "0.0 cannot be raised to a negative power",
                ));
            }
            a.powf(b)
        }
    };
    Ok(Value::Float(v))
}

/// 全序比较（`<` 等与 sorted / min / max 共用）
pub(crate) fn compare_values(a: &Value, b: &Value, symbol: &str) -> Result<Ordering, Exception> {
    match (a, b) {
        (x, y) if x.is_number() && y.is_number() => {
            if let (Some(i), Some(j)) = (x.as_i64(), y.as_i64()) {
                return Ok(i.cmp(&j));
            }
            let (f, g) = (x.as_f64().unwrap_or(f64::NAN), y.as_f64().unwrap_or(f64::NAN));
            Ok(f.partial_cmp(&g).unwrap_or(Ordering::Equal))
        }
        (Value::Str(x), Value::Str(y)) => Ok(x.cmp(y)),
        (Value::List(x), Value::List(y)) | (Value::Tuple(x), Value::Tuple(y)) => {
            for (p, q) in x.iter().zip(y.iter()) {
                if !p.py_eq(q) {
                    return compare_values(p, q, symbol);
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(Exception::type_error(format!(
            "'{}' not supported between instances of '{}' and '{}'",
            symbol,
            a.type_name(),
            b.type_name()
        ))),
    }
}

pub(crate) fn compare_op(op: CmpOp, a: &Value, b: &Value) -> Result<bool, Exception> {
    Ok(match op {
        CmpOp::Eq => a.py_eq(b),
        CmpOp::NotEq => !a.py_eq(b),
        CmpOp::Lt => compare_values(a, b, "<")? == Ordering::Less,
        CmpOp::LtE => compare_values(a, b, "<=")? != Ordering::Greater,
        CmpOp::Gt => compare_values(a, b, ">")? == Ordering::Greater,
        CmpOp::GtE => compare_values(a, b, ">=")? != Ordering::Less,
        CmpOp::In => contains(b, a)?,
        CmpOp::NotIn => !contains(b, a)?,
        CmpOp::Is => is_same(a, b),
        CmpOp::IsNot => !is_same(a, b),
    })
}

/// `is`：值语义下只对单例与不可变标量有意义
fn is_same(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::None, Value::None) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        (Value::Function(_), Value::Function(_))
        | (Value::Builtin(_), Value::Builtin(_))
        | (Value::Capability(_), Value::Capability(_))
        | (Value::Module(_), Value::Module(_)) => a.py_eq(b),
        _ => false,
    }
}

pub(crate) fn contains(container: &Value, item: &Value) -> Result<bool, Exception> {
    match container {
        Value::Str(s) => match item {
            Value::Str(sub) => Ok(s.contains(sub.as_str())),
            other => Err(Exception::type_error(format!(
                "'in <string>' requires string as left operand, not {}",
                other.type_name()
            ))),
        },
        Value::List(items) | Value::Tuple(items) => Ok(items.iter().any(|v| v.py_eq(item))),
        Value::Dict(d) => Ok(d.contains_key(item)),
        other => Err(Exception::type_error(format!(
            "argument of type '{}' is not iterable",
            other.type_name()
        ))),
    }
}

/// 迭代展开为 Vec（字符串按字符，字典按键）
pub(crate) fn iterate(value: Value) -> Result<Vec<Value>, Exception> {
    match value {
        Value::List(items) | Value::Tuple(items) => Ok(items),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        Value::Dict(d) => Ok(d.keys().cloned().collect()),
        other => Err(Exception::type_error(format!(
            "'{}' object is not iterable",
            other.type_name()
        ))),
    }
}

pub(crate) fn check_hashable(key: &Value) -> Result<(), Exception> {
    match key {
        Value::List(_) | Value::Dict(_) => Err(Exception::type_error(format!(
            "unhashable type: '{}'",
            key.type_name()
        ))),
        Value::Tuple(items) => items.iter().try_for_each(check_hashable),
        _ => Ok(()),
    }
}

/// 去重并保持首次出现顺序（集合按 list 表示）
pub(crate) fn dedup(items: Vec<Value>) -> Result<Vec<Value>, Exception> {
    let mut out: Vec<Value> = Vec::with_capacity(items.len());
    for item in items {
        check_hashable(&item)?;
        if !out.iter().any(|v| v.py_eq(&item)) {
            out.push(item);
        }
    }
    Ok(out)
}

fn normalize_index(index: &Value, len: usize, kind: &str) -> Result<usize, Exception> {
    let i = index.as_i64().ok_or_else(|| {
        Exception::type_error(format!(
            "{} indices must be integers or slices, not {}",
            kind,
            index.type_name()
        ))
    })?;
    let len = len as i64;
    let idx = if i < 0 { i + len } else { i };
    if idx < 0 || idx >= len {
        return Err(Exception::new(
            "IndexError",
            format!("{} index out of range", kind),
        ));
    }
    Ok(idx as usize)
}

fn key_error(key: &Value) -> Exception {
    Exception::new("KeyError", key.repr())
}

pub(crate) fn get_item(container: &Value, key: &Value) -> Result<Value, Exception> {
    match container {
        Value::List(items) => Ok(items[normalize_index(key, items.len(), "list")?].clone()),
        Value::Tuple(items) => Ok(items[normalize_index(key, items.len(), "tuple")?].clone()),
        Value::Str(s) => {
            let len = s.chars().count();
            let idx = normalize_index(key, len, "string")?;
            Ok(Value::Str(s.chars().nth(idx).map(String::from).unwrap_or_default()))
        }
        Value::Dict(d) => d.get(key).cloned().ok_or_else(|| key_error(key)),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn item_mut<'v>(container: &'v mut Value, key: &Value) -> Result<&'v mut Value, Exception> {
    match container {
        Value::List(items) => {
            let idx = normalize_index(key, items.len(), "list")?;
            Ok(&mut items[idx])
        }
        Value::Tuple(items) => {
            let idx = normalize_index(key, items.len(), "tuple")?;
            Ok(&mut items[idx])
        }
        Value::Dict(d) => d.get_mut(key).ok_or_else(|| key_error(key)),
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

pub(crate) fn set_item(container: &mut Value, key: Value, value: Value) -> Result<(), Exception> {
    match container {
        Value::List(items) => {
            let idx = normalize_index(&key, items.len(), "list")?;
            items[idx] = value;
            Ok(())
        }
        Value::Dict(d) => {
            check_hashable(&key)?;
            d.insert(key, value);
            Ok(())
        }
        other => Err(Exception::type_error(format!(
            "'{}' object does not support item assignment",
            other.type_name()
        ))),
    }
}

/// Python 切片下标序列
fn slice_indices(len: usize, lower: Option<i64>, upper: Option<i64>, step: i64) -> Vec<usize> {
    let len = len as i64;
    let mut out = Vec::new();
    if step > 0 {
        let clamp = |x: i64| {
            let x = if x < 0 { x + len } else { x };
            x.clamp(0, len)
        };
        let start = lower.map(clamp).unwrap_or(0);
        let stop = upper.map(clamp).unwrap_or(len);
        let mut i = start;
        while i < stop {
            out.push(i as usize);
            i += step;
        }
    } else {
        let clamp = |x: i64| {
            let x = if x < 0 { x + len } else { x };
            x.clamp(-1, len - 1)
        };
        let start = lower.map(clamp).unwrap_or(len - 1);
        let stop = upper.map(clamp).unwrap_or(-1);
        let mut i = start;
        while i > stop {
            out.push(i as usize);
            i += step;
        }
    }
    out
}

pub(crate) fn slice(
    container: &Value,
    lower: Option<i64>,
    upper: Option<i64>,
    step: Option<i64>,
) -> Result<Value, Exception> {
    let step = step.unwrap_or(1);
    if step == 0 {
        return Err(Exception::value_error("slice step cannot be zero"));
    }
    match container {
        Value::List(items) => Ok(Value::List(
            slice_indices(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        Value::Tuple(items) => Ok(Value::Tuple(
            slice_indices(items.len(), lower, upper, step)
                .into_iter()
                .map(|i| items[i].clone())
                .collect(),
        )),
        Value::Str(s) => {
            let chars: Vec<char> = s.chars().collect();
            Ok(Value::Str(
                slice_indices(chars.len(), lower, upper, step)
                    .into_iter()
                    .map(|i| chars[i])
                    .collect(),
            ))
        }
        other => Err(Exception::type_error(format!(
            "'{}' object is not subscriptable",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(xs: &[i64]) -> Value {
        Value::List(xs.iter().map(|x| Value::Int(*x)).collect())
    }

    #[test]
    fn test_python_division_semantics() {
        assert_eq!(binop(BinOp::Div, Value::Int(7), Value::Int(2)).unwrap(), Value::Float(3.5));
        assert_eq!(binop(BinOp::FloorDiv, Value::Int(-7), Value::Int(2)).unwrap(), Value::Int(-4));
        assert_eq!(binop(BinOp::Mod, Value::Int(-7), Value::Int(3)).unwrap(), Value::Int(2));
        assert_eq!(binop(BinOp::Pow, Value::Int(2), Value::Int(-1)).unwrap(), Value::Float(0.5));
        let err = binop(BinOp::Div, Value::Int(1), Value::Int(0)).unwrap_err();
        assert_eq!(err.kind, "ZeroDivisionError");
    }

    #[test]
    fn test_sequence_operators() {
        assert_eq!(binop(BinOp::Add, list(&[1]), list(&[2])).unwrap(), list(&[1, 2]));
        assert_eq!(binop(BinOp::Mul, Value::from("ab"), Value::Int(2)).unwrap(), Value::from("abab"));
        let err = binop(BinOp::Add, Value::from("a"), Value::Int(1)).unwrap_err();
        assert!(err.message.contains("'str' and 'int'"));
    }

    #[test]
    fn test_result_len_counts_produced_elements() {
        assert_eq!(result_len(BinOp::Mul, &list(&[0]), &Value::Int(10_000_000)), 10_000_000);
        assert_eq!(result_len(BinOp::Mul, &Value::Int(3), &Value::from("ab")), 6);
        assert_eq!(result_len(BinOp::Mul, &list(&[0]), &Value::Int(-4)), 0);
        assert_eq!(result_len(BinOp::Add, &list(&[1, 2]), &list(&[3])), 3);
        assert_eq!(result_len(BinOp::Mul, &Value::Int(6), &Value::Int(7)), 0);
    }

    #[test]
    fn test_percent_formatting_on_strings() {
        assert_eq!(
            binop(BinOp::Mod, Value::from("%d units"), Value::Int(3)).unwrap(),
            Value::from("3 units")
        );
        assert_eq!(binop(BinOp::Mod, Value::Int(7), Value::Int(4)).unwrap(), Value::Int(3));
    }

    #[test]
    fn test_slices_follow_python() {
        let xs = list(&[0, 1, 2, 3, 4]);
        assert_eq!(slice(&xs, Some(1), Some(-1), None).unwrap(), list(&[1, 2, 3]));
        assert_eq!(slice(&xs, None, None, Some(-2)).unwrap(), list(&[4, 2, 0]));
        assert_eq!(slice(&xs, Some(10), None, None).unwrap(), list(&[]));
        assert_eq!(slice(&Value::from("castle"), None, Some(3), None).unwrap(), Value::from("cas"));
    }

    #[test]
    fn test_comparisons_and_membership() {
        assert!(compare_op(CmpOp::Lt, &Value::Int(1), &Value::Float(1.5)).unwrap());
        assert!(compare_op(CmpOp::In, &Value::Int(2), &list(&[1, 2])).unwrap());
        assert!(compare_op(CmpOp::Is, &Value::None, &Value::None).unwrap());
        assert!(compare_op(CmpOp::Lt, &Value::from("a"), &Value::Int(1)).is_err());
    }

    #[test]
    fn test_index_errors() {
        let xs = list(&[1, 2]);
        assert_eq!(get_item(&xs, &Value::Int(-1)).unwrap(), Value::Int(2));
        assert_eq!(get_item(&xs, &Value::Int(5)).unwrap_err().kind, "IndexError");
        assert!(check_hashable(&list(&[1])).is_err());
    }
}
