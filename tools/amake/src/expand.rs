//! Variable expansion (spec §4.1.3): `${NAME}`, `$ENV{NAME}`, and the
//! quoted-vs-unquoted argument splitting rule.

use crate::ast::RawArg;
use crate::scope::{ScopeId, Scopes};

pub fn expand_string(scopes: &Scopes, scope: ScopeId, input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = String::new();
    let mut i = 0;
    while i < bytes.len() {
        if input[i..].starts_with("${") {
            let (inner, next) = extract_braced(input, i + 2);
            let name = expand_string(scopes, scope, inner);
            out.push_str(scopes.get(scope, &name).unwrap_or(""));
            i = next;
        } else if input[i..].starts_with("$ENV{") {
            let (inner, next) = extract_braced(input, i + 5);
            let name = expand_string(scopes, scope, inner);
            out.push_str(&std::env::var(&name).unwrap_or_default());
            i = next;
        } else {
            // Advance by one UTF-8 scalar.
            let ch_len = input[i..].chars().next().map(|c| c.len_utf8()).unwrap_or(1);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
        }
    }
    out
}

/// Given `s[start..]` positioned right after an opening `{`, finds the
/// matching `}` — counting nested `${` occurrences so `${${INNER}}` finds
/// the outer close, not the inner one — and returns `(inner_slice,
/// index_after_close)`. If unterminated, treats the rest of the string as
/// the inner slice.
fn extract_braced(s: &str, start: usize) -> (&str, usize) {
    let bytes = s.as_bytes();
    let mut depth = 1i32;
    let mut i = start;
    while i < bytes.len() {
        if s[i..].starts_with("${") {
            depth += 1;
            i += 2;
            continue;
        }
        if bytes[i] == b'}' {
            depth -= 1;
            if depth == 0 {
                return (&s[start..i], i + 1);
            }
            i += 1;
            continue;
        }
        i += 1;
    }
    (&s[start..], s.len())
}

/// Expands one raw argument into zero or more final arguments, applying the
/// quoted/unquoted list-splitting rule (spec §4.1.3, testable property 2).
pub fn expand_arg(scopes: &Scopes, scope: ScopeId, raw: &RawArg) -> Vec<String> {
    let expanded = expand_string(scopes, scope, &raw.text);
    if raw.was_quoted {
        vec![expanded]
    } else if expanded.is_empty() {
        vec![]
    } else {
        expanded.split(';').map(str::to_string).collect()
    }
}

pub fn expand_args(scopes: &Scopes, scope: ScopeId, raws: &[RawArg]) -> Vec<String> {
    raws.iter()
        .flat_map(|a| expand_arg(scopes, scope, a))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoted_vs_unquoted_splitting() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        scopes.set(root, "A", "x;y".into());
        let quoted = RawArg { text: "${A}".into(), was_quoted: true };
        let unquoted = RawArg { text: "${A}".into(), was_quoted: false };
        assert_eq!(expand_arg(&scopes, root, &quoted), vec!["x;y".to_string()]);
        assert_eq!(expand_arg(&scopes, root, &unquoted), vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn nested_variable_reference() {
        let mut scopes = Scopes::new();
        let root = scopes.root();
        scopes.set(root, "INNER", "NAME".into());
        scopes.set(root, "NAME", "resolved".into());
        assert_eq!(expand_string(&scopes, root, "${${INNER}}"), "resolved");
    }

    #[test]
    fn unknown_name_expands_empty() {
        let scopes = Scopes::new();
        assert_eq!(expand_string(&scopes, scopes.root(), "[${NOPE}]"), "[]");
    }

    #[test]
    fn env_lookup() {
        std::env::set_var("AMAKE_TEST_VAR", "hi");
        let scopes = Scopes::new();
        assert_eq!(
            expand_string(&scopes, scopes.root(), "$ENV{AMAKE_TEST_VAR}"),
            "hi"
        );
    }
}
