//! Domain model: entities, value objects and the ports the application layer
//! talks to. Nothing in here performs I/O.

pub mod approval;
pub mod circuit;
pub mod dead_letter;
pub mod gateway;
pub mod money;
pub mod ports;
pub mod transaction;
pub mod webhook;
