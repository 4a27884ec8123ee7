pub mod catalog;
pub mod pool;

pub use catalog::MaterializedCatalog;
pub use pool::{build_pool, DuckDBConnectionManager};
