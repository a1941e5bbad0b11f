pub mod metrics;
pub mod signature;
pub mod tracing;
