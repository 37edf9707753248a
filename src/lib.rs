//! Discovery, classification and ingestion of NSE securities-listing CSVs.

pub mod classifier;
pub mod config;
pub mod error;
pub mod loader;
pub mod models;
pub mod pipeline;
pub mod resolver;
pub mod scraper;
pub mod service;
pub mod storage;
pub mod utils;
