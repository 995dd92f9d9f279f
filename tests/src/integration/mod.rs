//! # Integration Tests
//!
//! Broker behaviour observed only through the public `relay_bus` API:
//! members register, exchange commands and correlate responses exactly as an
//! application would.

pub mod fixtures;

#[cfg(test)]
mod lifecycle;
#[cfg(test)]
mod requests;
