/// Contract between the taossql driver and the database access layer that
/// hosts it.
///
/// The host owns pooling, routing and statement execution. The driver only
/// asks for links, runs statements through them, and hands back rewritten
/// SQL before the host applies its own filtering.
use async_trait::async_trait;

use super::query::{InsertOption, Record, Value};
use crate::error::Result;

#[async_trait]
pub trait Host: Send + Sync {
    /// Logical connection handle returned by the host.
    type Link: Send + Sync;

    /// Schema used when a caller does not name one.
    fn default_schema(&self) -> &str;

    /// Name of the connection group this host serves.
    fn group(&self) -> &str;

    /// Raw configured link, if the host was configured with one.
    fn link(&self) -> Option<&str> {
        None
    }

    /// Read-preferring link for `schema`.
    async fn slave_link(&self, schema: &str) -> Result<Self::Link>;

    /// Writable link for `schema`.
    async fn master_link(&self, schema: &str) -> Result<Self::Link>;

    /// Run a statement and collect its rows in result order.
    async fn do_select(&self, link: &Self::Link, sql: &str) -> Result<Vec<Record>>;

    /// Insert `list` into `table`, returning the affected row count.
    async fn do_insert(
        &self,
        link: &Self::Link,
        table: &str,
        list: &[Record],
        option: InsertOption,
    ) -> Result<u64>;

    /// Host-level filtering applied after the driver's own rewrite.
    fn do_filter(&self, sql: String, args: Vec<Value>) -> Result<(String, Vec<Value>)> {
        Ok((sql, args))
    }

    /// Default conversion for record values without their own driver value.
    fn convert_value(&self, value: Value) -> Value {
        value
    }
}
