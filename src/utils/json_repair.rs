//! Recovery of JSON documents from chat-model replies.
//!
//! Replies arrive wrapped in markdown fences, surrounded by prose, or with
//! unescaped quotes inside string values. Each helper here handles one of
//! those failure shapes; callers chain them from cheapest to most invasive.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;

/// Removes every ``` fence marker together with its language tag.
pub fn strip_code_fences(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(idx) = rest.find("```") {
        out.push_str(&rest[..idx]);
        rest = &rest[idx + 3..];
        let tag_len = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_alphanumeric())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        rest = &rest[tag_len..];
    }
    out.push_str(rest);
    out.trim().to_string()
}

/// Returns the first balanced `open ... close` span. Brackets inside quoted
/// strings are ignored and backslash escapes are honoured.
pub fn find_balanced(s: &str, open: char, close: char) -> Option<&str> {
    let start = s.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in s[start..].char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        if c == '"' {
            in_string = true;
        } else if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                let end = start + offset + c.len_utf8();
                return Some(&s[start..end]);
            }
        }
    }
    None
}

/// First top-level object. Falls back to the widest `{ .. }` span when quote
/// damage keeps the scanner from finding the matching brace.
pub fn find_first_object(s: &str) -> Option<&str> {
    if let Some(obj) = find_balanced(s, '{', '}') {
        return Some(obj);
    }
    let start = s.find('{')?;
    let end = s.rfind('}')?;
    (end > start).then(|| &s[start..=end])
}

/// Locates the array value of `"key"` and returns it bracket-balanced.
pub fn find_array_for_key<'a>(s: &'a str, key: &str) -> Option<&'a str> {
    let needle = format!("\"{}\"", key);
    let key_pos = s.find(&needle)?;
    let after_key = &s[key_pos + needle.len()..];
    let colon = after_key.find(':')?;
    let value = &after_key[colon + 1..];
    if !value.trim_start().starts_with('[') {
        return None;
    }
    find_balanced(value, '[', ']').or_else(|| {
        let start = value.find('[')?;
        let end = value.rfind(']')?;
        (end > start).then(|| &value[start..=end])
    })
}

/// Escapes quotes that sit inside string values without terminating them.
///
/// Whether a quote closes its string depends on where the string sits: a key
/// closes before `:`, an object value closes before `}` or before `,` plus
/// the next key, an array element closes before `,` or `]`. Already escaped
/// quotes pass through untouched. Raw newlines inside strings are escaped too.
pub fn repair_unescaped_quotes(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 16);
    let mut containers: Vec<char> = Vec::new();
    let mut expect_key = false;
    let mut role: Option<StringRole> = None;
    let mut escaped = false;

    for (i, &c) in chars.iter().enumerate() {
        let Some(current) = role else {
            match c {
                '"' => {
                    role = Some(match containers.last() {
                        Some('{') if expect_key => StringRole::Key,
                        Some('{') => StringRole::ObjectValue,
                        _ => StringRole::Element,
                    });
                }
                '{' | '[' => {
                    containers.push(c);
                    expect_key = c == '{';
                }
                '}' | ']' => {
                    containers.pop();
                    expect_key = false;
                }
                ',' => expect_key = containers.last() == Some(&'{'),
                ':' => expect_key = false,
                _ => {}
            }
            out.push(c);
            continue;
        };
        if escaped {
            escaped = false;
            out.push(c);
            continue;
        }
        match c {
            '\\' => {
                escaped = true;
                out.push(c);
            }
            '"' => {
                if closes_string(&chars, i + 1, current) {
                    role = None;
                    out.push('"');
                } else {
                    out.push_str("\\\"");
                }
            }
            '\n' => out.push_str("\\n"),
            '\r' => {}
            '\t' => out.push_str("\\t"),
            _ => out.push(c),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringRole {
    Key,
    ObjectValue,
    Element,
}

fn next_significant(chars: &[char], from: usize) -> Option<(usize, char)> {
    chars
        .iter()
        .enumerate()
        .skip(from)
        .find(|(_, c)| !c.is_whitespace())
        .map(|(i, c)| (i, *c))
}

fn closes_string(chars: &[char], from: usize, role: StringRole) -> bool {
    let next = next_significant(chars, from);
    match role {
        StringRole::Key => matches!(next, None | Some((_, ':'))),
        StringRole::ObjectValue => match next {
            None | Some((_, '}')) => true,
            Some((i, ',')) => match next_significant(chars, i + 1) {
                None | Some((_, '}')) => true,
                Some((j, '"')) => is_key_at(chars, j),
                _ => false,
            },
            _ => false,
        },
        StringRole::Element => match next {
            None | Some((_, ']' | '}')) => true,
            Some((i, ',')) => match next_significant(chars, i + 1) {
                None => true,
                Some((j, c)) => match c {
                    '"' | '{' | '[' | '}' | ']' | '-' => true,
                    c if c.is_ascii_digit() => true,
                    _ => starts_with_literal(chars, j),
                },
            },
            _ => false,
        },
    }
}

/// True when the string opening at `at` is followed by `:`.
fn is_key_at(chars: &[char], at: usize) -> bool {
    let mut escaped = false;
    for (i, &c) in chars.iter().enumerate().skip(at + 1) {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '"' => return matches!(next_significant(chars, i + 1), Some((_, ':'))),
            _ => {}
        }
    }
    false
}

fn starts_with_literal(chars: &[char], at: usize) -> bool {
    ["true", "false", "null"].iter().any(|lit| {
        let len = lit.len();
        if at + len > chars.len() {
            return false;
        }
        let word: String = chars[at..at + len].iter().collect();
        let boundary = chars
            .get(at + len)
            .map(|c| !c.is_alphanumeric())
            .unwrap_or(true);
        word == *lit && boundary
    })
}

/// Fence strip, object isolation, direct parse, then quote repair.
pub fn parse_object<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let stripped = strip_code_fences(raw);
    let candidate = find_first_object(&stripped)
        .ok_or_else(|| anyhow!("no JSON object in response"))?;

    match serde_json::from_str::<T>(candidate) {
        Ok(v) => Ok(v),
        Err(direct_err) => {
            let repaired = repair_unescaped_quotes(candidate);
            serde_json::from_str::<T>(&repaired).map_err(|repair_err| {
                anyhow!(
                    "direct parse failed ({}); repaired parse failed ({})",
                    direct_err,
                    repair_err
                )
            })
        }
    }
}
