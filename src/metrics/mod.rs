//! Metrics Module
//! 
//! Prometheus counters for relay activity.

pub mod collector;

pub use collector::Metrics;
