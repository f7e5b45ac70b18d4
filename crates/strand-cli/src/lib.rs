//! Command line inspection tool for Strand stores
//!
//! A store directory holds the message log (`log/`) and one redb database
//! (`indexes.redb`) shared by the author and type multilogs.

pub mod config;
pub mod store;

pub use store::{Message, Store, render};
