pub mod exponential_backoff;
pub mod shutdown;
