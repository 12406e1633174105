//! Best-effort reconstruction of truncated streaming JSON.
//!
//! Tool arguments arrive token by token, so the accumulated fragment is
//! almost always incomplete, and a cut can land inside a string or number
//! literal. `repair` degrades in stages so consumers can render as much of
//! a partially-arrived object as possible:
//!
//! 1. direct parse
//! 2. close any open string, then append the missing closers
//! 3. retry on the longest structurally sound prefix
//! 4. truncate at the last top-level comma, dropping the incomplete field
//!
//! It never fails: total defeat is `None`.

use serde_json::Value;

pub fn repair(input: &str) -> Option<Value> {
    if input.trim().is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str(input) {
        return Some(value);
    }

    let scan = Scan::run(input);
    if let Ok(value) = serde_json::from_str(&scan.completed(input)) {
        return Some(value);
    }

    // Retry on the longest structurally sound prefix; a failure here still
    // falls through to the comma-truncation stage.
    if let Some(end) = scan.prefix_end() {
        if end > 0 {
            let prefix = input[..end].trim_end();
            if !prefix.is_empty() {
                let prefix_scan = Scan::run(prefix);
                if let Ok(value) = serde_json::from_str(&prefix_scan.completed(prefix)) {
                    return Some(value);
                }
                if let Ok(value) = serde_json::from_str(prefix) {
                    return Some(value);
                }
            }
        }
    }

    truncate_at_last_comma(input)
}

/// Single-pass structural scan: tracks the stack of expected closers,
/// in-string state (respecting escapes), the last offset at which brackets
/// were balanced outside a string, and the first structural error.
struct Scan {
    stack: Vec<char>,
    in_string: bool,
    last_balanced: Option<usize>,
    first_garbage: Option<usize>,
}

impl Scan {
    fn run(input: &str) -> Self {
        let mut scan = Self {
            stack: Vec::new(),
            in_string: false,
            last_balanced: None,
            first_garbage: None,
        };
        let mut escape_next = false;

        for (i, ch) in input.char_indices() {
            // Once a complete top-level value has been seen, anything but
            // whitespace is trailing garbage.
            if !scan.in_string && scan.stack.is_empty() && scan.last_balanced.is_some() {
                if ch.is_ascii_whitespace() {
                    scan.last_balanced = Some(i + ch.len_utf8());
                    continue;
                }
                scan.first_garbage = Some(i);
                break;
            }

            if escape_next {
                escape_next = false;
                continue;
            }
            if ch == '\\' {
                escape_next = true;
                continue;
            }

            if ch == '"' {
                scan.in_string = !scan.in_string;
                if !scan.in_string && scan.stack.is_empty() {
                    scan.last_balanced = Some(i + 1);
                }
                continue;
            }

            if scan.in_string {
                continue;
            }

            match ch {
                '{' => scan.stack.push('}'),
                '[' => scan.stack.push(']'),
                '}' | ']' => {
                    if scan.stack.last() != Some(&ch) {
                        scan.first_garbage = Some(i);
                        break;
                    }
                    scan.stack.pop();
                    if scan.stack.is_empty() {
                        scan.last_balanced = Some(i + 1);
                    }
                }
                _ => {}
            }
        }

        scan
    }

    /// Candidate built by closing the open string and appending the
    /// stack's closers innermost-first.
    fn completed(&self, input: &str) -> String {
        let mut out = input.to_string();
        if self.in_string {
            out.push('"');
        }
        for closer in self.stack.iter().rev() {
            out.push(*closer);
        }
        out
    }

    /// End of the longest structurally sound prefix: the earlier of the
    /// last balanced offset and the first error offset.
    fn prefix_end(&self) -> Option<usize> {
        match (self.last_balanced, self.first_garbage) {
            (Some(balanced), Some(garbage)) => Some(balanced.min(garbage)),
            (balanced, garbage) => balanced.or(garbage),
        }
    }
}

/// Final fallback: cut at the last comma, drop the trailing incomplete
/// field, and re-balance whatever is left.
fn truncate_at_last_comma(input: &str) -> Option<Value> {
    let cut = input.rfind(',')?;
    let mut truncated = input[..cut].to_string();

    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape_next = false;
    for ch in truncated.chars() {
        if escape_next {
            escape_next = false;
            continue;
        }
        match ch {
            '\\' => escape_next = true,
            '"' => in_string = !in_string,
            _ if in_string => {}
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if in_string {
        truncated.push('"');
    }
    while let Some(closer) = stack.pop() {
        truncated.push(closer);
    }

    serde_json::from_str(&truncated).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn complete_json_passes_through() {
        let cases = [
            json!({"a": 1, "b": [1, 2, 3]}),
            json!([{"x": "y"}, null, true]),
            json!("just a string"),
            json!(42),
            json!({}),
        ];
        for value in cases {
            let text = serde_json::to_string(&value).unwrap();
            assert_eq!(repair(&text), Some(value));
        }
    }

    #[test]
    fn unclosed_object() {
        assert_eq!(repair(r#"{"a":1,"b":2"#), Some(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn unclosed_string() {
        assert_eq!(repair(r#"{"a":"hello"#), Some(json!({"a": "hello"})));
    }

    #[test]
    fn trailing_incomplete_field_dropped() {
        // `{"a":1,"b":}` is invalid, so the comma-truncation fallback wins.
        assert_eq!(repair(r#"{"a":1,"b":"#), Some(json!({"a": 1})));
    }

    #[test]
    fn total_garbage_is_none() {
        assert_eq!(repair("not json at all"), None);
    }

    #[test]
    fn empty_and_whitespace_are_none() {
        assert_eq!(repair(""), None);
        assert_eq!(repair("   \n\t"), None);
    }

    #[test]
    fn unclosed_nested_structures() {
        assert_eq!(repair(r#"{"a":[1,2"#), Some(json!({"a": [1, 2]})));
        assert_eq!(
            repair(r#"{"a":{"b":{"c":"deep"#),
            Some(json!({"a": {"b": {"c": "deep"}}}))
        );
    }

    #[test]
    fn string_with_escaped_quote() {
        assert_eq!(
            repair(r#"{"a":"say \"hi\"", "b":1"#),
            Some(json!({"a": "say \"hi\"", "b": 1}))
        );
    }

    #[test]
    fn escape_at_cut_point() {
        // Fragment ends mid-escape; closing the string directly would leave
        // a dangling backslash, so the incomplete field is dropped.
        assert_eq!(repair(r#"{"a":1,"b":"x\"#), Some(json!({"a": 1})));
    }

    #[test]
    fn trailing_garbage_after_value() {
        assert_eq!(repair(r#"{"a":1} trailing junk"#), Some(json!({"a": 1})));
    }

    #[test]
    fn mismatched_closer_recovers_prefix() {
        assert_eq!(repair(r#"{"a":[1,2]}]"#), Some(json!({"a": [1, 2]})));
    }

    #[test]
    fn mismatched_closer_after_comma_keeps_earlier_fields() {
        // The sound prefix ends at the bad closer; completing it preserves
        // the open array instead of dropping the whole second field.
        assert_eq!(
            repair(r#"{"a":1,"b":[2}"#),
            Some(json!({"a": 1, "b": [2]}))
        );
    }

    #[test]
    fn truncated_array_of_objects() {
        assert_eq!(
            repair(r#"[{"id":1},{"id":2},{"id"#),
            Some(json!([{"id": 1}, {"id": 2}]))
        );
    }

    #[test]
    fn incomplete_number_literal_dropped() {
        // A cut inside a number would crash a naive truncate-and-parse.
        assert_eq!(repair(r#"{"a":1,"b":1."#), Some(json!({"a": 1})));
    }

    #[test]
    fn streaming_accumulation_grows_monotonically() {
        // Simulate token-by-token arrival of a tool argument object.
        let full = r#"{"path":"/tmp/file.txt","content":"hello world"}"#;
        let mut seen_keys = 0;
        for end in 1..=full.len() {
            if !full.is_char_boundary(end) {
                continue;
            }
            if let Some(Value::Object(map)) = repair(&full[..end]) {
                assert!(map.len() >= seen_keys, "lost keys at prefix length {end}");
                seen_keys = map.len();
            }
        }
        assert_eq!(seen_keys, 2);
    }

    #[test]
    fn never_panics_on_arbitrary_prefixes() {
        let samples = [
            r#"{"a":[{"b":"c","d":[1,2,{"e":null}]},"f"],"g":true}"#,
            r#"{"msg":"line1\nline2\t\"quoted\""}"#,
            r#"[[[[1],2],3],4]"#,
        ];
        for sample in samples {
            for end in 0..=sample.len() {
                if sample.is_char_boundary(end) {
                    let _ = repair(&sample[..end]);
                }
            }
        }
    }
}
