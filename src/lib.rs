//! Bogotto virtual try-on: catalog harvesting, catalog API and AI try-on proxy

pub mod catalog;
pub mod config;
pub mod error;
pub mod harvester;
pub mod models;
pub mod ratelimit;
pub mod scraper;
pub mod server;
pub mod traits;
pub mod tryon;
