pub mod sqlite;

pub use sqlite::{BatchRepository, ScanRepository};
