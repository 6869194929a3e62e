//! # Resilience primitives
//!
//! The four traffic-shaping building blocks the pipeline composes. Each is an
//! explicit object constructed once and injected; none of them is a global.
//!
//! - [`batcher`]: coalesces single requests into batches
//! - [`circuit_breaker`]: per-dependency failure gate
//! - [`buffer_pool`]: reusable payload buffers for the worker
//! - [`degradation`]: per-service health and fallback decision

pub mod batcher;
pub mod buffer_pool;
pub mod circuit_breaker;
pub mod degradation;

pub use batcher::{BatchError, BatchMeta, BatcherSnapshot, DynamicBatcher};
pub use buffer_pool::{BufferPool, BufferPoolSnapshot, BufferPools, PooledBuffer};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerSnapshot,
    CircuitStatus,
};
pub use degradation::{
    DegradationController, ServiceHealth, ServiceHealthSnapshot, ServiceStatus, KNOWN_SERVICES,
};
