mod connection;
mod introspection;
mod postgres;
mod query;
mod sqlite;

pub use connection::*;
pub use introspection::*;
pub use postgres::*;
pub use query::*;
pub use sqlite::*;
