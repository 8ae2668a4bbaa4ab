mod chain;
pub mod config;
pub mod engine;
pub mod outcome;
pub mod strategy;

pub use config::EngineConfig;
pub use engine::{DeliveryEngine, DURABLE_FALLBACK};
pub use outcome::{AttemptFailure, DeliveryOutcome, SendReport};
pub use strategy::{DeliveryStrategy, LocalSubmission, RelayStrategy};
