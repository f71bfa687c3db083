// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod api;
pub mod broadcast;
pub mod cache;
pub mod clock;
pub mod config;
pub mod diff;
pub mod error;
pub mod health;
pub mod metrics;
pub mod model;
pub mod providers;
pub mod refresh;
pub mod resilience;
pub mod scheduler;
pub mod service;
pub mod snapshot;

// ---- Re-exports for stable public API ----
pub use crate::api::{router, serve_with_shutdown};
pub use crate::error::{ConfigurationError, DeliveryError, ProviderError};
pub use crate::model::{
    ClientMessage, EmissionFactor, ImpactScope, OutboundEvent, Sample, Subscription, Update,
};
pub use crate::service::{FactorService, ServiceDeps};
