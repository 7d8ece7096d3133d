use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use taossql::config::{Config, DEFAULT_GROUP};
use taossql::db::{PgHost, TableFieldsCache};
use taossql::rewrite::rewrite_sql;
use taossql::Driver;

/// Query rewriting and table metadata for TDengine
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Connection group to use
    #[arg(long, default_value = DEFAULT_GROUP)]
    group: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the backend form of a statement
    Rewrite { sql: String },
    /// Print the connection sources of the group, passwords masked
    Link,
    /// List tables
    Tables {
        #[arg(long)]
        schema: Option<String>,
    },
    /// Describe the columns of a table
    Fields {
        table: String,
        #[arg(long)]
        schema: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Setup logging
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    if let Command::Rewrite { sql } = &cli.command {
        println!("{}", rewrite_sql(sql));
        return Ok(());
    }

    let path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if let Command::Link = cli.command {
        for node in config.group(&cli.group)? {
            println!("{} {}", node.role, node.filtered_source());
        }
        return Ok(());
    }

    resolve_passwords(&mut config, &cli.group)?;

    let host = PgHost::from_config(&config, &cli.group)?;
    let driver = Driver::new(host, Arc::new(TableFieldsCache::new(&config.cache)));

    match cli.command {
        Command::Tables { schema } => {
            for table in driver.tables(schema.as_deref()).await? {
                println!("{}", table);
            }
        }
        Command::Fields { table, schema } => {
            let fields = driver.table_fields(&table, schema.as_deref()).await?;
            let mut fields: Vec<_> = fields.values().collect();
            fields.sort_by_key(|f| f.index);
            for field in fields {
                println!("{:>3}  {:<32} {}", field.index, field.name, field.field_type);
            }
        }
        Command::Rewrite { .. } | Command::Link => {}
    }

    Ok(())
}

/// Fill empty passwords: TAOS_PASSWORD env var, then interactive prompt.
fn resolve_passwords(config: &mut Config, group: &str) -> Result<()> {
    let Some(nodes) = config.groups.get_mut(group) else {
        return Ok(());
    };
    for node in nodes.iter_mut().filter(|n| n.link.is_empty() && n.pass.is_empty()) {
        if let Ok(pw) = std::env::var("TAOS_PASSWORD") {
            node.pass = pw;
        } else {
            let prompt = format!("Password for {}@{}:{}: ", node.user, node.host, node.port);
            node.pass = rpassword::read_password_from_tty(Some(&prompt))?;
        }
    }
    Ok(())
}
