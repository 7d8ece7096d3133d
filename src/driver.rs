/// The taossql driver: statement rewriting and table metadata on top of a
/// [`Host`].
///
/// ```text
/// host statement ──► Driver::do_filter ──► rewrite ──► Host::do_filter
/// host metadata  ──► Driver::table_fields ──► TableFieldsCache ──► desc <table>
/// ```
use std::sync::Arc;

use crate::config::filter_link;
use crate::db::{
    describe_sql, normalize_table_name, parse_table_fields, parse_table_names, show_tables_sql,
    CacheKey, Host, InsertOption, Record, RecordValue, TableFields, TableFieldsCache, Value,
};
use crate::error::{DialectError, Result};
use crate::rewrite::rewrite;

pub const DRIVER_NAME: &str = "taossql";

const QUOTE_LEFT: &str = "\"";
const QUOTE_RIGHT: &str = "\"";

pub struct Driver<H: Host> {
    host: H,
    cache: Arc<TableFieldsCache>,
}

impl<H: Host> Driver<H> {
    /// `cache` may be shared between drivers of different groups; keys carry
    /// the group name.
    pub fn new(host: H, cache: Arc<TableFieldsCache>) -> Self {
        Self { host, cache }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn cache(&self) -> &TableFieldsCache {
        &self.cache
    }

    pub fn name(&self) -> &'static str {
        DRIVER_NAME
    }

    /// Identifier quote characters, left and right.
    pub fn chars(&self) -> (&'static str, &'static str) {
        (QUOTE_LEFT, QUOTE_RIGHT)
    }

    /// Configured link with the password masked; empty without a link.
    pub fn filtered_link(&self) -> String {
        self.host.link().map(filter_link).unwrap_or_default()
    }

    /// Rewrite an outgoing statement, then let the host filter the result.
    pub fn do_filter(&self, sql: &str, args: Vec<Value>) -> Result<(String, Vec<Value>)> {
        let (sql, args) = rewrite(sql, args);
        self.host.do_filter(sql, args)
    }

    /// Tables of `schema`, or of the current database.
    pub async fn tables(&self, schema: Option<&str>) -> Result<Vec<String>> {
        let link = self.host.slave_link(self.effective_schema(schema)).await?;
        let rows = self.host.do_select(&link, &show_tables_sql(schema)).await?;
        Ok(parse_table_names(&rows))
    }

    /// Column metadata of a single table, served from the cache after the
    /// first lookup.
    pub async fn table_fields(
        &self,
        table: &str,
        schema: Option<&str>,
    ) -> Result<Arc<TableFields>> {
        let table = normalize_table_name(table, self.chars())?;
        let schema = self.effective_schema(schema);
        let key = CacheKey::new(table.as_str(), schema, self.host.group());

        let host = &self.host;
        let table = table.as_str();
        self.cache
            .get_or_fetch(&key, move || async move {
                let link = host.slave_link(schema).await?;
                let rows = host.do_select(&link, &describe_sql(table)).await?;
                Ok(parse_table_fields(&rows))
            })
            .await
    }

    /// Insert through the host. Save and replace are rejected up front.
    pub async fn do_insert(
        &self,
        link: &H::Link,
        table: &str,
        list: &[Record],
        option: InsertOption,
    ) -> Result<u64> {
        match option {
            InsertOption::Save => Err(DialectError::NotSupported(format!(
                "Save operation is not supported by {} driver",
                DRIVER_NAME
            ))),
            InsertOption::Replace => Err(DialectError::NotSupported(format!(
                "Replace operation is not supported by {} driver",
                DRIVER_NAME
            ))),
            _ => self.host.do_insert(link, table, list, option).await,
        }
    }

    /// Convert record fields to driver values.
    pub fn convert_data_for_record<I>(&self, data: I) -> Result<Record>
    where
        I: IntoIterator<Item = (String, RecordValue)>,
    {
        data.into_iter()
            .map(|(column, value)| {
                let value = match value {
                    RecordValue::Valuer(valuer) => valuer.value()?,
                    RecordValue::Plain(value) => self.host.convert_value(value),
                };
                Ok((column, value))
            })
            .collect()
    }

    fn effective_schema<'a>(&'a self, schema: Option<&'a str>) -> &'a str {
        match schema {
            Some(schema) if !schema.is_empty() => schema,
            _ => self.host.default_schema(),
        }
    }
}
