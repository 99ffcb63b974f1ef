pub mod builder;
pub mod catalog;
pub mod config;
pub mod error;
pub mod logger;
pub mod orchestrator;
pub mod partition;
pub mod progress;
pub mod storage;
pub mod strategy;
pub mod target;
pub mod ticket;
pub mod zip;
