use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::query::{record_string, Record};
use crate::config::CacheConfig;
use crate::error::{DialectError, Result};

static WHITESPACE_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\n\r\s]+").expect("valid regex"));

/// One column of a table, as reported by `desc <table>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableField {
    /// Position of the column in the describe result, starting at 0.
    pub index: usize,
    pub name: String,
    pub field_type: String,
    pub length: Option<i64>,
    pub note: String,
}

/// Column name to descriptor.
pub type TableFields = HashMap<String, TableField>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub table: String,
    pub schema: String,
    pub group: String,
}

impl CacheKey {
    pub fn new(
        table: impl Into<String>,
        schema: impl Into<String>,
        group: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            schema: schema.into(),
            group: group.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "taossql_table_fields_{}_{}@group:{}",
            self.table, self.schema, self.group
        )
    }
}

#[derive(Debug, Clone)]
enum CacheSlot {
    Fields(Arc<TableFields>),
    Failed(String),
}

impl CacheSlot {
    fn resolve(&self, key: &CacheKey) -> Result<Arc<TableFields>> {
        match self {
            CacheSlot::Fields(fields) => Ok(Arc::clone(fields)),
            CacheSlot::Failed(message) => Err(DialectError::CachedFailure {
                key: key.to_string(),
                message: message.clone(),
            }),
        }
    }
}

/// Process-lifetime cache of table metadata with single-flight fills.
///
/// Each key owns a [`OnceCell`]: the first caller on a miss runs the fetch,
/// concurrent callers for the same key wait on it, and callers for other
/// keys proceed independently. A cell is only ever observed empty or fully
/// populated.
///
/// A failed fetch leaves the cell empty so the next caller fetches again,
/// unless [`CacheConfig::cache_failures`] is set, in which case the failure
/// is remembered until the key is invalidated.
#[derive(Debug, Default)]
pub struct TableFieldsCache {
    cells: DashMap<CacheKey, Arc<OnceCell<CacheSlot>>>,
    cache_failures: bool,
}

impl TableFieldsCache {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            cells: DashMap::new(),
            cache_failures: config.cache_failures,
        }
    }

    /// Return the cached fields for `key`, running `fetch` on a miss.
    pub async fn get_or_fetch<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Arc<TableFields>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TableFields>>,
    {
        let cell = self.cells.entry(key.clone()).or_default().clone();
        if let Some(slot) = cell.get() {
            debug!(%key, "table fields cache hit");
            return slot.resolve(key);
        }

        let cache_failures = self.cache_failures;
        let mut fetch_error = None;
        let error_slot = &mut fetch_error;
        let slot = cell
            .get_or_try_init(|| async move {
                debug!(%key, "table fields cache miss, fetching");
                match fetch().await {
                    Ok(fields) => Ok(CacheSlot::Fields(Arc::new(fields))),
                    Err(err) if cache_failures => {
                        let message = err.to_string();
                        *error_slot = Some(err);
                        Ok(CacheSlot::Failed(message))
                    }
                    Err(err) => Err(err),
                }
            })
            .await;

        if let Some(err) = fetch_error {
            return Err(err);
        }
        slot?.resolve(key)
    }

    /// Forget `key`. An in-flight fetch for it completes into a detached cell.
    pub fn invalidate(&self, key: &CacheKey) {
        self.cells.remove(key);
    }

    pub fn clear(&self) {
        self.cells.clear();
    }

    /// Number of populated entries.
    pub fn len(&self) -> usize {
        self.cells
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strip identifier quoting from `table` and reject multi-table expressions.
pub fn normalize_table_name(table: &str, chars: (&str, &str)) -> Result<String> {
    let (left, right) = chars;
    let is_quote = |c: char| left.contains(c) || right.contains(c);
    let trimmed = table.trim_matches(|c: char| c.is_whitespace() || is_quote(c));
    if trimmed.chars().any(char::is_whitespace) {
        return Err(DialectError::InvalidArgument(format!(
            "table_fields supports only single table operations, got {:?}",
            table
        )));
    }
    let name: String = trimmed.chars().filter(|c| !is_quote(*c)).collect();
    if name.is_empty() {
        return Err(DialectError::InvalidArgument(format!(
            "table_fields requires a table name, got {:?}",
            table
        )));
    }
    Ok(name)
}

/// Collapse whitespace runs of a statement into single spaces.
pub fn normalize_whitespace(sql: &str) -> String {
    WHITESPACE_RUN.replace_all(sql.trim(), " ").into_owned()
}

pub fn describe_sql(table: &str) -> String {
    normalize_whitespace(&format!("desc {}", table))
}

pub fn show_tables_sql(schema: Option<&str>) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("SHOW {}.TABLES", schema),
        _ => String::from("SHOW TABLES"),
    }
}

/// Build the column map from describe rows, in result order.
pub fn parse_table_fields(rows: &[Record]) -> TableFields {
    let mut fields = TableFields::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let name = record_string(row, "field");
        if name.is_empty() {
            warn!(index, "describe row without a field name, skipped");
            continue;
        }
        fields.insert(
            name.clone(),
            TableField {
                index,
                name,
                field_type: record_string(row, "type"),
                length: record_string(row, "length").parse().ok(),
                note: record_string(row, "note"),
            },
        );
    }
    fields
}

/// Table names out of `SHOW TABLES` rows.
pub fn parse_table_names(rows: &[Record]) -> Vec<String> {
    let mut tables = Vec::with_capacity(rows.len());
    for row in rows {
        match row.get("table_name") {
            Some(name) => tables.push(name.as_string()),
            None => tables.extend(row.values().map(|v| v.as_string())),
        }
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::query::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const QUOTES: (&str, &str) = ("\"", "\"");

    fn row(pairs: &[(&str, &str)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Value::from(*v)))
            .collect()
    }

    fn users_fields() -> TableFields {
        parse_table_fields(&[
            row(&[("field", "id"), ("type", "int")]),
            row(&[("field", "name"), ("type", "varchar")]),
        ])
    }

    // --- table name handling ---

    #[test]
    fn test_normalize_strips_quotes() {
        assert_eq!(normalize_table_name("\"users\"", QUOTES).unwrap(), "users");
        assert_eq!(normalize_table_name("users", QUOTES).unwrap(), "users");
        assert_eq!(normalize_table_name("us\"ers", QUOTES).unwrap(), "users");
    }

    #[test]
    fn test_normalize_rejects_multi_table() {
        let err = normalize_table_name("orders bad", QUOTES).unwrap_err();
        assert!(err.is_invalid_argument());
        assert!(normalize_table_name("a\tb", QUOTES).is_err());
    }

    #[test]
    fn test_normalize_rejects_empty_name() {
        for table in ["", "\"\"", "  ", " \" \" "] {
            let err = normalize_table_name(table, QUOTES).unwrap_err();
            assert!(err.is_invalid_argument(), "{table:?}");
        }
    }

    #[test]
    fn test_normalize_trims_surrounding_whitespace() {
        assert_eq!(normalize_table_name(" \"users\" ", QUOTES).unwrap(), "users");
    }

    #[test]
    fn test_describe_sql_collapses_whitespace() {
        assert_eq!(describe_sql("users"), "desc users");
        assert_eq!(normalize_whitespace("  desc\n\r  users  "), "desc users");
    }

    #[test]
    fn test_show_tables_sql() {
        assert_eq!(show_tables_sql(None), "SHOW TABLES");
        assert_eq!(show_tables_sql(Some("")), "SHOW TABLES");
        assert_eq!(show_tables_sql(Some("metrics")), "SHOW metrics.TABLES");
    }

    // --- row parsing ---

    #[test]
    fn test_parse_table_fields_keeps_result_order() {
        let fields = users_fields();
        assert_eq!(fields.len(), 2);
        assert_eq!(fields["id"].index, 0);
        assert_eq!(fields["id"].field_type, "int");
        assert_eq!(fields["name"].index, 1);
        assert_eq!(fields["name"].field_type, "varchar");
    }

    #[test]
    fn test_parse_table_fields_length_and_note() {
        let fields = parse_table_fields(&[row(&[
            ("field", "location"),
            ("type", "BINARY"),
            ("length", "64"),
            ("note", "TAG"),
        ])]);
        assert_eq!(fields["location"].length, Some(64));
        assert_eq!(fields["location"].note, "TAG");
    }

    #[test]
    fn test_parse_table_fields_skips_nameless_rows() {
        let fields = parse_table_fields(&[
            row(&[("type", "int")]),
            row(&[("field", "ts"), ("type", "TIMESTAMP")]),
        ]);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields["ts"].index, 1);
    }

    #[test]
    fn test_parse_table_names() {
        let rows = vec![
            row(&[("table_name", "d1001"), ("columns", "4")]),
            row(&[("table_name", "d1002"), ("columns", "4")]),
        ];
        assert_eq!(parse_table_names(&rows), vec!["d1001", "d1002"]);
        assert_eq!(parse_table_names(&[row(&[("name", "meters")])]), vec!["meters"]);
    }

    // --- cache ---

    #[test]
    fn test_cache_key_display() {
        let key = CacheKey::new("users", "metrics", "default");
        assert_eq!(
            key.to_string(),
            "taossql_table_fields_users_metrics@group:default"
        );
    }

    #[tokio::test]
    async fn test_cache_hit_skips_fetch() {
        let cache = TableFieldsCache::default();
        let key = CacheKey::new("users", "metrics", "default");
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            let fields = cache
                .get_or_fetch(&key, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(users_fields())
                })
                .await
                .unwrap();
            assert_eq!(fields.len(), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_fetch_is_single_flight() {
        let cache = TableFieldsCache::default();
        let key = CacheKey::new("orders", "metrics", "default");
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(users_fields())
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch(&key, fetch),
            cache.get_or_fetch(&key, fetch)
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fetch_across_tasks() {
        let cache = Arc::new(TableFieldsCache::default());
        let calls = Arc::new(AtomicUsize::new(0));
        let key = CacheKey::new("orders", "metrics", "default");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let calls = Arc::clone(&calls);
                let key = key.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch(&key, || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(users_fields())
                        })
                        .await
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.iter().all(|r| Arc::ptr_eq(r, &results[0])));
    }

    #[tokio::test]
    async fn test_distinct_groups_cached_separately() {
        let cache = TableFieldsCache::default();
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(users_fields())
        };

        let a = CacheKey::new("users", "metrics", "default");
        let b = CacheKey::new("users", "metrics", "staging");
        cache.get_or_fetch(&a, fetch).await.unwrap();
        cache.get_or_fetch(&b, fetch).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_is_retried() {
        let cache = TableFieldsCache::default();
        let key = CacheKey::new("users", "metrics", "default");

        let err = cache
            .get_or_fetch(&key, || async {
                Err(DialectError::backend("desc users", "connection reset"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DialectError::BackendOperation { .. }));
        assert!(cache.is_empty());

        let fields = cache
            .get_or_fetch(&key, || async { Ok(users_fields()) })
            .await
            .unwrap();
        assert_eq!(fields.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_fetch_cached_when_configured() {
        let cache = TableFieldsCache::new(&CacheConfig {
            cache_failures: true,
        });
        let key = CacheKey::new("users", "metrics", "default");

        let first = cache
            .get_or_fetch(&key, || async {
                Err(DialectError::backend("desc users", "syntax error"))
            })
            .await
            .unwrap_err();
        assert!(matches!(first, DialectError::BackendOperation { .. }));

        let second = cache
            .get_or_fetch(&key, || async { Ok(users_fields()) })
            .await
            .unwrap_err();
        match second {
            DialectError::CachedFailure { key: k, message } => {
                assert_eq!(k, key.to_string());
                assert!(message.contains("syntax error"));
            }
            other => panic!("unexpected {other:?}"),
        }

        cache.invalidate(&key);
        assert!(cache
            .get_or_fetch(&key, || async { Ok(users_fields()) })
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_clear_forces_refetch() {
        let cache = TableFieldsCache::default();
        let key = CacheKey::new("users", "metrics", "default");
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(users_fields())
        };

        cache.get_or_fetch(&key, fetch).await.unwrap();
        cache.clear();
        assert!(cache.is_empty());
        cache.get_or_fetch(&key, fetch).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
