/// Statement rewriting from dialect-agnostic SQL to the taossql wire form.
///
/// Three text passes run in a fixed order, each one reading the output of
/// the previous:
///
/// ```text
/// SELECT * FROM t WHERE a = ? AND b::jsonb = ? LIMIT 10, 5
///       ↓ renumber placeholders
/// SELECT * FROM t WHERE a = $1 AND b::jsonb = $2 LIMIT 10, 5
///       ↓ restore cast placeholders
/// SELECT * FROM t WHERE a = $1 AND b::jsonb = ? LIMIT 10, 5
///       ↓ pagination
/// SELECT * FROM t WHERE a = $1 AND b::jsonb = ? LIMIT 5 OFFSET 10
/// ```
///
/// The passes operate on raw text and do not tokenize SQL, so a `?` inside a
/// quoted string literal is renumbered like any other placeholder.
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::borrow::Cow;

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\?").expect("valid regex"));

/// `::jsonb` followed by a numbered placeholder.
static CAST_THEN_PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"::jsonb([^0-9A-Za-z_]*)\$\d+").expect("valid regex"));

/// A numbered placeholder directly followed by `::jsonb`, whitespace only
/// in between.
static PLACEHOLDER_THEN_CAST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\d+(\s*)::jsonb").expect("valid regex"));

/// `LIMIT` at the start of the statement or after any whitespace.
static LIMIT_OFFSET_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(^|\s)LIMIT (\d+),\s*(\d+)").expect("valid regex"));

/// Rewrite `sql` for the backend. `args` are handed back untouched.
pub fn rewrite<T>(sql: &str, args: Vec<T>) -> (String, Vec<T>) {
    (rewrite_sql(sql), args)
}

/// Apply all rewrite passes to a statement.
pub fn rewrite_sql(sql: &str) -> String {
    let renumbered = renumber_placeholders(sql);
    let restored = restore_cast_placeholders(&renumbered);
    let rewritten = rewrite_pagination(&restored).into_owned();
    tracing::trace!(original = sql, rewritten = %rewritten, "rewrote statement");
    rewritten
}

/// Replace every `?` with `$1`, `$2`, ... in left-to-right order.
pub fn renumber_placeholders(sql: &str) -> Cow<'_, str> {
    let mut index = 0usize;
    PLACEHOLDER.replace_all(sql, |_: &Captures| {
        index += 1;
        format!("${index}")
    })
}

/// Turn numbered placeholders adjacent to a `::jsonb` cast back into `?`.
///
/// Separator characters between the cast and the placeholder are kept as-is.
pub fn restore_cast_placeholders(sql: &str) -> String {
    let after = CAST_THEN_PLACEHOLDER.replace_all(sql, "::jsonb${1}?");
    PLACEHOLDER_THEN_CAST
        .replace_all(&after, "?${1}::jsonb")
        .into_owned()
}

/// `LIMIT <offset>, <count>` becomes `LIMIT <count> OFFSET <offset>`.
pub fn rewrite_pagination(sql: &str) -> Cow<'_, str> {
    LIMIT_OFFSET_COUNT.replace_all(sql, "${1}LIMIT ${3} OFFSET ${2}")
}
