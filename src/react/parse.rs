//! 代码提取：从模型原始输出中取出围栏代码块，并规范化 final_answer 用法
//!
//! 多个围栏时按出现顺序全部提取，以空行（"\n\n"）拼接为一段代码。

use std::sync::OnceLock;

use regex::Regex;

use crate::core::AgentError;

static FENCE_RE: OnceLock<Regex> = OnceLock::new();
static FINAL_ANSWER_RE: OnceLock<Regex> = OnceLock::new();

fn fence_regex() -> &'static Regex {
    FENCE_RE.get_or_init(|| Regex::new(r"(?s)```(?:py|python)?\n(.*?)\n```").unwrap())
}

fn final_answer_regex() -> &'static Regex {
    FINAL_ANSWER_RE.get_or_init(|| Regex::new(r"\bfinal_answer\b").unwrap())
}

/// 提取所有 ```py / ```python / ``` 围栏内的代码；没有围栏时返回 Parsing 错误
pub fn extract_code(text: &str) -> Result<String, AgentError> {
    let blocks: Vec<&str> = fence_regex()
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str())
        .collect();
    if blocks.is_empty() {
        return Err(AgentError::Parsing(format!(
            "Your code snippet is invalid, because the regex pattern ```(?:py|python)?\\n(.*?)\\n``` was not found in it.\n\
             Here is your code snippet:\n{}\n\
             Make sure to include code with the correct pattern, for instance:\n\
             Thoughts: Your thoughts\n\
             Code:\n\
             ```py\n\
             # Your python code here\n\
             ```<end_code>",
            text
        )));
    }
    Ok(blocks.join("\n\n"))
}

/// 代码里把 final_answer 当变量赋值时，改名为 final_answer_variable，避免遮蔽 final_answer()
pub fn fix_final_answer_code(code: &str) -> String {
    let occurrences: Vec<(usize, usize)> = final_answer_regex()
        .find_iter(code)
        .filter(|m| !preceded_by_dot(code, m.start()))
        .map(|m| (m.start(), m.end()))
        .collect();
    let assigned = occurrences.iter().any(|&(_, end)| is_assignment(&code[end..]));
    if !assigned {
        return code.to_string();
    }

    let mut out = String::with_capacity(code.len() + 16);
    let mut last = 0;
    for (start, end) in occurrences {
        if is_call(&code[end..]) {
            continue;
        }
        out.push_str(&code[last..start]);
        out.push_str("final_answer_variable");
        last = end;
    }
    out.push_str(&code[last..]);
    out
}

fn preceded_by_dot(code: &str, start: usize) -> bool {
    code[..start].ends_with('.')
}

fn is_assignment(rest: &str) -> bool {
    let rest = rest.trim_start_matches([' ', '\t']);
    rest.starts_with('=') && !rest.starts_with("==")
}

fn is_call(rest: &str) -> bool {
    rest.trim_start_matches([' ', '\t']).starts_with('(')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_single_fence() {
        let raw = "Thought: add\nCode:\n```py\nx = 1 + 1\nfinal_answer(x)\n```";
        assert_eq!(extract_code(raw).unwrap(), "x = 1 + 1\nfinal_answer(x)");
    }

    #[test]
    fn test_extract_accepts_python_and_bare_fences() {
        assert_eq!(extract_code("```python\na = 1\n```").unwrap(), "a = 1");
        assert_eq!(extract_code("```\nb = 2\n```").unwrap(), "b = 2");
    }

    #[test]
    fn test_extract_concatenates_multiple_fences_in_order() {
        let raw = "First:\n```py\na = 1\n```\nthen\n```py\nb = a + 1\n```";
        assert_eq!(extract_code(raw).unwrap(), "a = 1\n\nb = a + 1");
    }

    #[test]
    fn test_extract_without_fence_is_parsing_error() {
        let err = extract_code("I think the answer is 4").unwrap_err();
        assert_eq!(err.kind(), "parsing");
        let text = err.to_string();
        assert!(text.starts_with("Error in code parsing:\n"));
        assert!(text.contains("I think the answer is 4"));
        assert!(text.ends_with("Make sure to provide correct code blobs."));
    }

    #[test]
    fn test_fix_final_answer_renames_variable() {
        let code = "final_answer = 3\nprint(final_answer)\nfinal_answer(final_answer)";
        assert_eq!(
            fix_final_answer_code(code),
            "final_answer_variable = 3\nprint(final_answer_variable)\nfinal_answer(final_answer_variable)"
        );
    }

    #[test]
    fn test_fix_final_answer_leaves_plain_calls() {
        let code = "x = 2\nfinal_answer(x)\nif final_answer == 1:\n    pass";
        assert_eq!(fix_final_answer_code(code), code);
        let code = "obj.final_answer = 1\nfinal_answer(obj)";
        assert_eq!(fix_final_answer_code(code), code);
    }
}
