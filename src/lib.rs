pub mod access_api;
pub mod addresses;
pub mod client_trait;

pub mod config;
pub mod database;
pub mod error;
pub mod fetcher;
pub mod indexer;
pub mod models;
pub mod rest;
pub mod scanner;
pub mod sweeper;
pub mod writer;

pub use client_trait::ChainClient;
pub use config::{Config, SyncMode};
pub use database::Store;
pub use error::{IndexerError, IndexerResult};
pub use indexer::App;
