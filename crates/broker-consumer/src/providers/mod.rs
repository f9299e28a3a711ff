//! Connection provider implementations.
//!
//! Wire-protocol providers live outside this crate; the in-memory broker here
//! backs tests, local development and demos.

pub mod memory;

pub use memory::{InMemoryBroker, InMemoryConnection, InMemoryConnectionProvider, InMemorySubscription};
