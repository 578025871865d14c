//! Storage module
//!
//! - `json`: one JSON document per file under a base directory

mod json;

pub use json::JsonStore;
