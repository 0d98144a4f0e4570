// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Declared-grammar judge-response parser (§9 design note): first a fenced
//! ```` ```json ```` block; else a fenced block containing a balanced
//! object/array; else the first balanced object/array anywhere in the text.
//! Mis-parses are structured [`EvalError::ParseError`]s, never `None`.

use crate::error::EvalError;

pub fn parse_json_response(text: &str) -> Result<serde_json::Value, EvalError> {
    let candidate = extract_json_fragment(text)?;
    serde_json::from_str(candidate)
        .map_err(|e| EvalError::ParseError(format!("invalid JSON in judge response: {e}")))
}

fn extract_json_fragment(text: &str) -> Result<&str, EvalError> {
    if let Some(fenced) = fenced_block(text, Some("json")) {
        if let Some(balanced) = first_balanced(fenced) {
            return Ok(balanced);
        }
        return Ok(fenced.trim());
    }
    if let Some(fenced) = fenced_block(text, None) {
        if let Some(balanced) = first_balanced(fenced) {
            return Ok(balanced);
        }
    }
    first_balanced(text).ok_or_else(|| {
        EvalError::ParseError("no JSON object or array found in response".to_string())
    })
}

/// Finds the first fenced code block. When `lang` is `Some`, only matches
/// a block whose opening fence names that language (e.g. ` ```json `).
fn fenced_block(text: &str, lang: Option<&str>) -> Option<&str> {
    let fence = "```";
    let mut search_from = 0;
    while let Some(start_rel) = text[search_from..].find(fence) {
        let start = search_from + start_rel;
        let after_fence = start + fence.len();
        let line_end = text[after_fence..].find('\n').map(|i| after_fence + i)?;
        let lang_tag = text[after_fence..line_end].trim();
        let body_start = line_end + 1;
        if let Some(end_rel) = text[body_start..].find(fence) {
            let body_end = body_start + end_rel;
            let matches_lang = match lang {
                Some(expected) => lang_tag.eq_ignore_ascii_case(expected),
                None => true,
            };
            if matches_lang {
                return Some(&text[body_start..body_end]);
            }
            search_from = body_end + fence.len();
        } else {
            return None;
        }
    }
    None
}

/// Scans for the first balanced `{...}` or `[...]`, respecting string
/// literals and escapes so braces inside quoted text don't confuse the
/// depth counter.
fn first_balanced(text: &str) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        if c == b'{' || c == b'[' {
            if let Some(end) = find_matching_close(text, i) {
                return Some(&text[i..=end]);
            }
        }
        i += 1;
    }
    None
}

fn find_matching_close(text: &str, open_idx: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let open = bytes[open_idx];
    let close = if open == b'{' { b'}' } else { b']' };
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = open_idx;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if c == b'\\' {
                escaped = true;
            } else if c == b'"' {
                in_string = false;
            }
        } else {
            match c {
                b'"' => in_string = true,
                b'{' | b'[' => depth += 1,
                b'}' | b']' => {
                    depth -= 1;
                    if depth == 0 && c == close {
                        return Some(i);
                    }
                    if depth == 0 {
                        return None;
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_object() {
        let v = parse_json_response(r#"{"winner": "A", "reason": "better"}"#).unwrap();
        assert_eq!(v["winner"], "A");
    }

    #[test]
    fn parses_fenced_json_block() {
        let text = "Here is my answer:\n```json\n{\"winner\": \"B\"}\n```\nThanks.";
        let v = parse_json_response(text).unwrap();
        assert_eq!(v["winner"], "B");
    }

    #[test]
    fn parses_fenced_block_without_lang_tag() {
        let text = "```\n{\"evaluations\": []}\n```";
        let v = parse_json_response(text).unwrap();
        assert!(v["evaluations"].is_array());
    }

    #[test]
    fn ignores_braces_inside_strings() {
        let text = r#"{"reason": "uses { and } in prose", "winner": "A"}"#;
        let v = parse_json_response(text).unwrap();
        assert_eq!(v["winner"], "A");
    }

    #[test]
    fn finds_first_balanced_object_in_prose() {
        let text = "The judge says: {\"winner\": \"A\", \"reason\": \"ok\"} -- end.";
        let v = parse_json_response(text).unwrap();
        assert_eq!(v["winner"], "A");
    }

    #[test]
    fn errors_structured_when_nothing_found() {
        let err = parse_json_response("no json here at all").unwrap_err();
        assert!(matches!(err, EvalError::ParseError(_)));
    }
}
