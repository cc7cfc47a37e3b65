//! Query anonymization and fingerprinting
//!
//! A deterministic textual rewrite that strips every literal out of a SQL
//! statement. Strings are replaced first so later passes never rewrite
//! inside them. The fingerprint is the lower-cased, comment-stripped,
//! prefix-stripped form used as the identity key for plan-dictionary
//! lookups and correlation.

use once_cell::sync::Lazy;
use regex::Regex;

static STRING_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"'(?:[^'\\]|\\.|'')*'").expect("string literal regex"));
static HEX_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b0[xX][0-9a-fA-F]+\b").expect("hex literal regex"));
static UUID_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}\b")
        .expect("uuid regex")
});
static EMAIL_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex"));
static IPV4_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b").expect("ipv4 regex"));
static ISO_DATE_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{4}-\d{2}-\d{2}(?:T\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?)?\b")
        .expect("iso date regex")
});
// No lookbehind in the regex crate: capture the non-identifier character in
// front of the number and keep it in the replacement
static NUMBER_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(^|[^A-Za-z0-9_?])[-+]?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?\b").expect("number regex")
});
static BOOL_LITERAL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:true|false)\b").expect("bool regex"));
static IN_LIST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bIN\s*\(\s*\?(?:\s*,\s*\?)*\s*\)").expect("in list regex"));
static BETWEEN_EXPR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bBETWEEN\s+[^\s,()]+\s+AND\s+[^\s,()]+").expect("between regex")
});
static CASE_EXPR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)\bCASE\b.*?\bEND\b").expect("case regex"));
static WHEN_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bWHEN\b").expect("when regex"));
static ELSE_KEYWORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bELSE\b").expect("else regex"));

static LINE_COMMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"--[^\n]*").expect("line comment regex"));
static BLOCK_COMMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("block comment regex"));
static PARAM_TUPLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\(\s*\?(?:\s*,\s*\?)+\s*\)").expect("param tuple regex"));
static SCHEMA_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[a-z_][a-z0-9_]*\.([a-z_][a-z0-9_]*)").expect("schema prefix regex")
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace regex"));

/// Replace every literal in a SQL statement with `?` placeholders.
///
/// Deterministic and idempotent: anonymize(anonymize(q)) == anonymize(q).
pub fn anonymize(sql: &str) -> String {
    // Strings first so nothing below rewrites inside them
    let s = STRING_LITERAL.replace_all(sql, "?");
    let s = HEX_LITERAL.replace_all(&s, "?");
    let s = UUID_LITERAL.replace_all(&s, "?");
    let s = EMAIL_LITERAL.replace_all(&s, "?");
    let s = IPV4_LITERAL.replace_all(&s, "?");
    let s = ISO_DATE_LITERAL.replace_all(&s, "?");
    let s = NUMBER_LITERAL.replace_all(&s, "${1}?");
    let s = BOOL_LITERAL.replace_all(&s, "?");

    let s = CASE_EXPR.replace_all(&s, |caps: &regex::Captures<'_>| rewrite_case(&caps[0]));
    let s = BETWEEN_EXPR.replace_all(&s, "BETWEEN ? AND ?");
    let s = IN_LIST.replace_all(&s, "IN (?)");

    let s = WHITESPACE.replace_all(&s, " ");
    s.trim().trim_end_matches(';').trim().to_string()
}

/// Collapse a CASE expression to its structure: one `WHEN ? THEN ?` per
/// branch, plus `ELSE ?` when present.
fn rewrite_case(case_expr: &str) -> String {
    let when_count = WHEN_KEYWORD.find_iter(case_expr).count().max(1);
    let has_else = ELSE_KEYWORD.is_match(case_expr);

    let mut out = String::from("CASE");
    for _ in 0..when_count {
        out.push_str(" WHEN ? THEN ?");
    }
    if has_else {
        out.push_str(" ELSE ?");
    }
    out.push_str(" END");
    out
}

/// Identity key for a query: anonymized, lower-cased, comments stripped,
/// parameter tuples collapsed, schema prefixes dropped.
///
/// Comments go first, while line boundaries still exist; anonymization
/// collapses whitespace and would otherwise let `--` swallow the rest of
/// the statement.
pub fn fingerprint(sql: &str) -> String {
    let s = LINE_COMMENT.replace_all(sql, " ");
    let s = BLOCK_COMMENT.replace_all(&s, " ");
    let anonymized = anonymize(&s).to_lowercase();
    let s = PARAM_TUPLE.replace_all(&anonymized, "(?)");
    let s = SCHEMA_PREFIX.replace_all(&s, "$1");
    let s = WHITESPACE.replace_all(&s, " ");
    s.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_replacement_end_to_end() {
        let input = "SELECT * FROM users WHERE email = 'a@b.co' AND id IN (1, 2, 3) \
                     AND created_at BETWEEN '2024-01-01' AND '2024-12-31';";
        assert_eq!(
            anonymize(input),
            "SELECT * FROM users WHERE email = ? AND id IN (?) AND created_at BETWEEN ? AND ?"
        );
        assert_eq!(
            fingerprint(input),
            "select * from users where email = ? and id in (?) and created_at between ? and ?"
        );
    }

    #[test]
    fn test_anonymize_is_idempotent() {
        let inputs = [
            "SELECT * FROM t WHERE a = 1 AND b = 'x'",
            "SELECT * FROM t WHERE id IN (1, 2, 3)",
            "SELECT CASE WHEN a > 1 THEN 'hi' WHEN b < 2 THEN 'lo' ELSE 'mid' END FROM t",
            "UPDATE t SET v = -1.5e-3 WHERE ts BETWEEN '2024-01-01' AND '2024-02-01'",
        ];
        for input in inputs {
            let once = anonymize(input);
            assert_eq!(anonymize(&once), once, "not idempotent for {input}");
        }
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(anonymize(r"SELECT * FROM t WHERE name = 'O''Brien'"), "SELECT * FROM t WHERE name = ?");
        assert_eq!(anonymize(r"SELECT * FROM t WHERE name = 'O\'Brien'"), "SELECT * FROM t WHERE name = ?");
    }

    #[test]
    fn test_numeric_variants() {
        assert_eq!(anonymize("SELECT * FROM t WHERE a = -4"), "SELECT * FROM t WHERE a = ?");
        assert_eq!(anonymize("SELECT * FROM t WHERE a = 1.5e10"), "SELECT * FROM t WHERE a = ?");
        assert_eq!(anonymize("SELECT * FROM t WHERE a = 0xDEADbeef"), "SELECT * FROM t WHERE a = ?");
        // Digits inside identifiers stay put
        assert_eq!(anonymize("SELECT col2 FROM t1"), "SELECT col2 FROM t1");
    }

    #[test]
    fn test_special_value_patterns() {
        assert_eq!(
            anonymize("SELECT * FROM t WHERE u = 'x' OR id = 550e8400-e29b-41d4-a716-446655440000"),
            "SELECT * FROM t WHERE u = ? OR id = ?"
        );
        assert_eq!(anonymize("SELECT * FROM t WHERE ip = 10.0.0.1"), "SELECT * FROM t WHERE ip = ?");
        assert_eq!(
            anonymize("SELECT * FROM t WHERE ts = 2024-01-02T03:04:05Z"),
            "SELECT * FROM t WHERE ts = ?"
        );
        assert_eq!(anonymize("SELECT * FROM t WHERE ok = TRUE"), "SELECT * FROM t WHERE ok = ?");
    }

    #[test]
    fn test_case_structure_preserved() {
        let input = "SELECT CASE WHEN a = 1 THEN 'one' WHEN a = 2 THEN 'two' ELSE 'many' END FROM t";
        assert_eq!(anonymize(input), "SELECT CASE WHEN ? THEN ? WHEN ? THEN ? ELSE ? END FROM t");

        let no_else = "SELECT CASE WHEN a = 1 THEN 'one' END FROM t";
        assert_eq!(anonymize(no_else), "SELECT CASE WHEN ? THEN ? END FROM t");
    }

    #[test]
    fn test_fingerprint_identifies_literal_variants() {
        let a = "SELECT * FROM db.users WHERE id = 1";
        let b = "select * from users  where id = 42 -- trailing note";
        let c = "SELECT * FROM users /* hint */ WHERE id = 99";
        assert_eq!(fingerprint(a), fingerprint(b));
        assert_eq!(fingerprint(b), fingerprint(c));
    }

    #[test]
    fn test_mid_query_line_comment_does_not_swallow_statement() {
        let q = "SELECT a -- pick column\nFROM t WHERE id = 5";
        assert_eq!(fingerprint(q), "select a from t where id = ?");
    }

    #[test]
    fn test_fingerprint_differs_on_structure() {
        assert_ne!(
            fingerprint("SELECT * FROM users WHERE id = 1"),
            fingerprint("SELECT * FROM users WHERE name = 'x'")
        );
    }

    #[test]
    fn test_param_tuple_collapse_in_fingerprint() {
        assert_eq!(
            fingerprint("INSERT INTO t (a, b, c) VALUES (1, 2, 3)"),
            fingerprint("INSERT INTO t (a, b, c) VALUES (4, 5, 6)")
        );
    }

    #[test]
    fn test_whitespace_and_semicolons_normalized() {
        assert_eq!(anonymize("SELECT\n  1\n;  "), "SELECT ?");
    }
}
