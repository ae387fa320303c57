pub mod config;
pub mod connector;
pub mod error;
pub mod protocol;
pub mod sim;
pub mod table;

pub use config::ConnectorConfig;
pub use connector::{CancelToken, Connector, ConnectorBuilder, Credentials, RetryPolicy};
pub use error::ClientError;
pub use table::{Row, Table, TableDef, TableListener, Value};
