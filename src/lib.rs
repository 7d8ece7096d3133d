pub mod config;
pub mod db;
pub mod driver;
pub mod error;
pub mod rewrite;

pub use driver::{Driver, DRIVER_NAME};
pub use error::{DialectError, Result};
