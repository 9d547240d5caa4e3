//! Middleware module for billing-service.

pub mod actor;

pub use actor::ActorContext;
