//! Background services

pub mod metrics;

pub use metrics::{MetricsDisplay, MetricsDisplayConfig};
