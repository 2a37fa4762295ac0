pub mod cli;
pub mod config;
pub mod dedup;
pub mod dispatch;
pub mod domain;
pub mod errors;
pub mod metrics;
pub mod parser;
pub mod scheduler;
pub mod services;
pub mod sources;
pub mod storage;
