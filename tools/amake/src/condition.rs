//! Condition evaluator (spec §4.1.4): `NOT`/`AND`/`OR` precedence by
//! recursive split, then unary (`EXISTS`, `IS_DIRECTORY`, `DEFINED`) and
//! binary (`STREQUAL`, ... `MATCHES`) operators, falling back to
//! single-token truthiness.

use std::path::Path;

use crate::scope::{ScopeId, Scopes};

pub struct CondCtx<'a> {
    pub scopes: &'a Scopes,
    pub scope: ScopeId,
}

const FALSY: &[&str] = &["", "0", "OFF", "NO", "FALSE", "NOTFOUND", "IGNORE", "N"];

fn truthy_token(ctx: &CondCtx<'_>, token: &str) -> bool {
    if FALSY.iter().any(|f| token.eq_ignore_ascii_case(f)) {
        return false;
    }
    if let Some(value) = ctx.scopes.get(ctx.scope, token) {
        return truthy_token(ctx, value);
    }
    true
}

/// Splits `tokens` on every top-level occurrence of the case-insensitive
/// keyword `kw`, returning the segments between separators.
fn split_on<'a>(tokens: &'a [String], kw: &str) -> Vec<&'a [String]> {
    let mut segs = Vec::new();
    let mut start = 0;
    for (i, t) in tokens.iter().enumerate() {
        if t.eq_ignore_ascii_case(kw) {
            segs.push(&tokens[start..i]);
            start = i + 1;
        }
    }
    segs.push(&tokens[start..]);
    segs
}

pub fn eval_condition(ctx: &CondCtx<'_>, tokens: &[String]) -> bool {
    let or_segs = split_on(tokens, "OR");
    if or_segs.len() > 1 {
        return or_segs.iter().any(|seg| eval_and(ctx, seg));
    }
    eval_and(ctx, tokens)
}

fn eval_and(ctx: &CondCtx<'_>, tokens: &[String]) -> bool {
    let and_segs = split_on(tokens, "AND");
    if and_segs.len() > 1 {
        return and_segs.iter().all(|seg| eval_not(ctx, seg));
    }
    eval_not(ctx, tokens)
}

fn eval_not(ctx: &CondCtx<'_>, tokens: &[String]) -> bool {
    if let Some(first) = tokens.first() {
        if first.eq_ignore_ascii_case("NOT") {
            return !eval_not(ctx, &tokens[1..]);
        }
    }
    eval_base(ctx, tokens)
}

fn eval_base(ctx: &CondCtx<'_>, tokens: &[String]) -> bool {
    match tokens {
        [] => true,
        [single] => truthy_token(ctx, single),
        [op, arg] => match op.to_ascii_uppercase().as_str() {
            "EXISTS" => Path::new(arg).exists(),
            "IS_DIRECTORY" => Path::new(arg).is_dir(),
            "DEFINED" => ctx.scopes.is_defined(ctx.scope, arg),
            _ => truthy_token(ctx, &tokens.join(" ")),
        },
        [lhs, op, rhs] => match op.to_ascii_uppercase().as_str() {
            "STREQUAL" => lhs == rhs,
            "STRLESS" => lhs < rhs,
            "STRGREATER" => lhs > rhs,
            "MATCHES" => rhs.is_empty() || lhs.contains(rhs.as_str()),
            "EQUAL" => num(lhs) == num(rhs),
            "LESS" => num(lhs) < num(rhs),
            "GREATER" => num(lhs) > num(rhs),
            _ => truthy_token(ctx, lhs),
        },
        _ => truthy_token(ctx, &tokens[0]),
    }
}

fn num(s: &str) -> i64 {
    s.parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(scopes: &Scopes) -> CondCtx<'_> {
        CondCtx {
            scopes,
            scope: scopes.root(),
        }
    }

    #[test]
    fn falsy_literals() {
        let scopes = Scopes::new();
        for f in ["", "0", "OFF", "no", "False", "NOTFOUND", "IGNORE", "N"] {
            assert!(!eval_condition(&ctx(&scopes), &[f.to_string()]), "{f} should be falsy");
        }
        assert!(eval_condition(&ctx(&scopes), &["yes".to_string()]));
    }

    #[test]
    fn not_and_or_precedence() {
        let scopes = Scopes::new();
        let c = ctx(&scopes);
        let toks = |s: &str| s.split(' ').map(String::from).collect::<Vec<_>>();
        assert!(eval_condition(&c, &toks("0 OR 1 AND 1")));
        assert!(!eval_condition(&c, &toks("NOT 1")));
        assert!(eval_condition(&c, &toks("NOT 0 AND 1")));
    }

    #[test]
    fn strequal_and_equal() {
        let scopes = Scopes::new();
        let c = ctx(&scopes);
        let toks = |s: &str| s.split(' ').map(String::from).collect::<Vec<_>>();
        assert!(eval_condition(&c, &toks("abc STREQUAL abc")));
        assert!(eval_condition(&c, &toks("4 EQUAL 4")));
        assert!(eval_condition(&c, &toks("2 LESS 4")));
    }

    #[test]
    fn defined_tests_scope() {
        let mut scopes = Scopes::new();
        scopes.set(scopes.root(), "X", "1".into());
        let c = ctx(&scopes);
        assert!(eval_condition(&c, &["DEFINED".into(), "X".into()]));
        assert!(!eval_condition(&c, &["DEFINED".into(), "Y".into()]));
    }
}
