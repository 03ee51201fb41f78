//! Testing utilities and mock implementations
//!
//! Lets the messaging facade be exercised without a running MQTT broker.

pub mod mocks;

pub use mocks::*;
