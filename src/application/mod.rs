//! Application layer: the services that move payments through their lifecycle.
//!
//! `PaymentProcessor` is the entry point. It owns the transaction state
//! machine and composes gateway selection, circuit breaking, retries,
//! approvals and webhook handling around it.

pub mod approval;
pub mod circuit_breaker;
pub mod processor;
pub mod registry;
pub mod retry;
pub mod state_machine;
pub mod webhook;
