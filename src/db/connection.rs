use async_trait::async_trait;
use dashmap::DashMap;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use postgres_native_tls::MakeTlsConnector;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_postgres::types::ToSql;
use tokio_postgres::{NoTls, SimpleQueryMessage};
use tracing::debug;

use super::host::Host;
use super::query::{record_from_row, InsertOption, Record, Value};
use crate::config::{Config, ConfigNode, Role};
use crate::error::{DialectError, Result};

static NULL_VALUE: Value = Value::Null;

/// A pooled connection checked out for one schema.
pub struct PgLink {
    client: Object,
}

/// [`Host`] over pooled PostgreSQL-protocol connections.
///
/// One pool is opened lazily per (role, node, schema). Read links rotate
/// over the slave nodes and fall back to the masters when the group has no
/// slaves.
pub struct PgHost {
    group: String,
    default_schema: String,
    masters: Vec<ConfigNode>,
    slaves: Vec<ConfigNode>,
    pools: DashMap<(Role, usize, String), Pool>,
    next_node: AtomicUsize,
}

impl PgHost {
    pub fn new(group: &str, nodes: &[ConfigNode]) -> Result<Self> {
        let (masters, slaves): (Vec<ConfigNode>, Vec<ConfigNode>) = nodes
            .iter()
            .cloned()
            .partition(|node| node.role == Role::Master);
        let default_schema = match masters.first() {
            Some(node) => node.name.clone(),
            None => {
                return Err(DialectError::Config(format!(
                    "group {:?} has no master node",
                    group
                )))
            }
        };
        Ok(Self {
            group: group.to_string(),
            default_schema,
            masters,
            slaves,
            pools: DashMap::new(),
            next_node: AtomicUsize::new(0),
        })
    }

    pub fn from_config(config: &Config, group: &str) -> Result<Self> {
        Self::new(group, config.group(group)?)
    }

    async fn acquire(&self, role: Role, schema: &str) -> Result<PgLink> {
        let (role, nodes) = match role {
            Role::Slave if !self.slaves.is_empty() => (Role::Slave, &self.slaves),
            _ => (Role::Master, &self.masters),
        };
        let index = self.next_node.fetch_add(1, Ordering::Relaxed) % nodes.len();
        let node = &nodes[index];

        let key = (role, index, schema.to_string());
        let pool = match self.pools.get(&key) {
            Some(pool) => pool.clone(),
            None => {
                let pool = build_pool(node, schema)?;
                self.pools.entry(key).or_insert(pool).clone()
            }
        };

        debug!(group = %self.group, %role, schema, "acquiring link");
        let client = pool.get().await.map_err(|e| {
            DialectError::backend(
                format!(
                    "taossql {} connection to schema \"{}\" failed by source \"{}\"",
                    role,
                    schema,
                    node.filtered_source()
                ),
                e,
            )
        })?;
        Ok(PgLink { client })
    }
}

#[async_trait]
impl Host for PgHost {
    type Link = PgLink;

    fn default_schema(&self) -> &str {
        &self.default_schema
    }

    fn group(&self) -> &str {
        &self.group
    }

    fn link(&self) -> Option<&str> {
        self.masters
            .first()
            .map(|node| node.link.as_str())
            .filter(|link| !link.is_empty())
    }

    async fn slave_link(&self, schema: &str) -> Result<PgLink> {
        self.acquire(Role::Slave, schema).await
    }

    async fn master_link(&self, schema: &str) -> Result<PgLink> {
        self.acquire(Role::Master, schema).await
    }

    async fn do_select(&self, link: &PgLink, sql: &str) -> Result<Vec<Record>> {
        let messages = link.client.simple_query(sql).await.map_err(|e| {
            DialectError::backend(format!("taossql query \"{}\" failed", sql), e)
        })?;
        Ok(messages
            .iter()
            .filter_map(|message| match message {
                SimpleQueryMessage::Row(row) => Some(record_from_row(row)),
                _ => None,
            })
            .collect())
    }

    async fn do_insert(
        &self,
        link: &PgLink,
        table: &str,
        list: &[Record],
        option: InsertOption,
    ) -> Result<u64> {
        let Some(first) = list.first() else {
            return Ok(0);
        };
        let mut columns: Vec<&str> = first.keys().map(String::as_str).collect();
        columns.sort_unstable();

        let (sql, params) = build_insert(table, &columns, list, option);
        link.client
            .execute(sql.as_str(), &params)
            .await
            .map_err(|e| DialectError::backend(format!("taossql {} \"{}\" failed", option, sql), e))
    }
}

/// Multi-row `INSERT` with numbered placeholders, binding `list` column by
/// column. Columns missing from a record bind as NULL.
fn build_insert<'a>(
    table: &str,
    columns: &[&str],
    list: &'a [Record],
    option: InsertOption,
) -> (String, Vec<&'a (dyn ToSql + Sync)>) {
    let mut params: Vec<&'a (dyn ToSql + Sync)> = Vec::with_capacity(columns.len() * list.len());
    let mut rows = Vec::with_capacity(list.len());
    for record in list {
        let mut marks = Vec::with_capacity(columns.len());
        for column in columns {
            params.push(record.get(*column).unwrap_or(&NULL_VALUE));
            marks.push(format!("${}", params.len()));
        }
        rows.push(format!("({})", marks.join(",")));
    }

    let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let mut sql = format!(
        "INSERT INTO {}({}) VALUES {}",
        table,
        quoted.join(","),
        rows.join(",")
    );
    if option == InsertOption::Ignore {
        sql.push_str(" ON CONFLICT DO NOTHING");
    }
    (sql, params)
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn open_error(
    node: &ConfigNode,
    schema: &str,
    e: Box<dyn std::error::Error + Send + Sync>,
) -> DialectError {
    DialectError::BackendOperation {
        operation: format!(
            "taossql open of schema \"{}\" failed by source \"{}\"",
            schema,
            node.filtered_source()
        ),
        source: e,
    }
}

/// Parse the node's source and point it at `schema`. The schema wins over
/// any `dbname` carried by a raw `link`.
fn pg_config(node: &ConfigNode, schema: &str) -> Result<tokio_postgres::Config> {
    let mut pg_config: tokio_postgres::Config = node
        .source()
        .parse()
        .map_err(|e: tokio_postgres::Error| open_error(node, schema, e.into()))?;
    if !schema.is_empty() {
        pg_config.dbname(schema);
    }
    Ok(pg_config)
}

fn build_pool(node: &ConfigNode, schema: &str) -> Result<Pool> {
    let pg_config = pg_config(node, schema)?;
    let manager_config = ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    };
    let manager = if node.ssl {
        Manager::from_config(pg_config, build_tls_connector(node)?, manager_config)
    } else {
        Manager::from_config(pg_config, NoTls, manager_config)
    };

    Pool::builder(manager)
        .max_size(node.max_pool_size)
        .build()
        .map_err(|e| open_error(node, schema, e.into()))
}

/// Build a TLS connector; verification is skipped only when the node asks
/// for it.
fn build_tls_connector(node: &ConfigNode) -> Result<MakeTlsConnector> {
    let mut builder = native_tls::TlsConnector::builder();
    if node.accept_invalid_certs {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    let connector = builder
        .build()
        .map_err(|e| DialectError::backend("build TLS connector", e))?;
    Ok(MakeTlsConnector::new(connector))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(pairs: &[(&str, Value)]) -> Record {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn nodes() -> Vec<ConfigNode> {
        vec![
            ConfigNode {
                host: "primary".into(),
                name: "metrics".into(),
                ..ConfigNode::default()
            },
            ConfigNode {
                host: "replica".into(),
                name: "metrics".into(),
                role: Role::Slave,
                ..ConfigNode::default()
            },
        ]
    }

    #[test]
    fn test_host_defaults_from_master() {
        let host = PgHost::new("default", &nodes()).unwrap();
        assert_eq!(host.default_schema(), "metrics");
        assert_eq!(host.group(), "default");
        assert_eq!(host.masters.len(), 1);
        assert_eq!(host.slaves.len(), 1);
        assert!(host.link().is_none());
    }

    #[test]
    fn test_host_requires_master() {
        let slaves: Vec<ConfigNode> = nodes().into_iter().skip(1).collect();
        assert!(matches!(
            PgHost::new("default", &slaves),
            Err(DialectError::Config(_))
        ));
    }

    #[test]
    fn test_build_insert_numbers_placeholders_row_major() {
        let list = vec![
            record(&[("ts", Value::Int(1)), ("val", Value::Float(0.5))]),
            record(&[("ts", Value::Int(2))]),
        ];
        let (sql, params) = build_insert("meters", &["ts", "val"], &list, InsertOption::Default);
        assert_eq!(
            sql,
            "INSERT INTO meters(\"ts\",\"val\") VALUES ($1,$2),($3,$4)"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_build_insert_ignore() {
        let list = vec![record(&[("ts", Value::Int(1))])];
        let (sql, _) = build_insert("meters", &["ts"], &list, InsertOption::Ignore);
        assert!(sql.ends_with(" ON CONFLICT DO NOTHING"));
    }

    #[test]
    fn test_quote_identifier_escapes() {
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_build_pool_is_lazy() {
        // Pools connect on first checkout, so building one needs no server.
        let pool = build_pool(&nodes()[0], "metrics").unwrap();
        assert_eq!(pool.status().size, 0);
    }

    #[test]
    fn test_pg_config_uses_requested_schema() {
        let config = pg_config(&nodes()[0], "archive").unwrap();
        assert_eq!(config.get_dbname(), Some("archive"));
        assert_eq!(config.get_ports(), &[5432]);
    }

    #[test]
    fn test_pg_config_schema_overrides_link_dbname() {
        let node = ConfigNode {
            link: "host=h user=root dbname=metrics".into(),
            ..ConfigNode::default()
        };
        let config = pg_config(&node, "archive").unwrap();
        assert_eq!(config.get_dbname(), Some("archive"));
        assert_eq!(config.get_user(), Some("root"));
    }

    #[test]
    fn test_pg_config_empty_schema_keeps_link_dbname() {
        let node = ConfigNode {
            link: "host=h dbname=metrics".into(),
            ..ConfigNode::default()
        };
        let config = pg_config(&node, "").unwrap();
        assert_eq!(config.get_dbname(), Some("metrics"));
    }

    #[test]
    fn test_pg_config_bad_link_names_schema() {
        let node = ConfigNode {
            link: "host='unterminated".into(),
            ..ConfigNode::default()
        };
        let err = pg_config(&node, "archive").unwrap_err();
        assert!(err.to_string().contains("\"archive\""));
    }
}
