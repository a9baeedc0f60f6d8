//! Scheduled MySQL/PostgreSQL dumps delivered to local disk, Azure Blob
//! Storage and FTP, with an encrypted credential store, a persistent run
//! ledger and an HTTP status API.

pub mod backup;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod ledger;
pub mod log;
pub mod probe;
pub mod upload;
pub mod web;

#[cfg(test)]
pub(crate) mod testing;
