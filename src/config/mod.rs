pub mod schema;

pub use schema::{ClientConfig, Config, RecordsConfig, ScanConfig, SessionConfig};
