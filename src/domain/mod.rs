//! Domain layer: error types, the partition-family registry and the data
//! model shared by the store, discovery and the engines.

pub mod errors;
pub mod models;
pub mod table_types;
