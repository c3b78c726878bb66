// ===============================
// src/lib.rs
// ===============================
pub mod app;
pub mod config;
pub mod controller;
pub mod domain;
pub mod feed;
pub mod gateway;
pub mod indicators;
pub mod metrics;
pub mod performance;
pub mod posttrade;
pub mod recorder;
pub mod signals;
pub mod store;
pub mod strategy_config;
