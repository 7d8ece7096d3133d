mod connection;
mod host;
mod query;
mod schema;

pub use connection::*;
pub use host::*;
pub use query::*;
pub use schema::*;
