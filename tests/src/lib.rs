//! # Relay Test Suite
//!
//! ## Structure
//!
//! ```text
//! tests/
//! ├── benches/
//! │   └── dispatch_benchmarks.rs  # criterion: send, fan-out, request round trip
//! └── src/
//!     └── integration/            # broker behaviour through the public API
//!         ├── fixtures.rs         # shared command type and member helpers
//!         ├── addressing.rs       # exact, broadcast and type-group delivery
//!         ├── requests.rs         # correlation, timeout, conflict, streaming
//!         ├── lifecycle.rs        # member and broker close, stats, metrics
//!         └── properties.rs       # proptest over handle encoding
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p relay-tests
//! cargo test -p relay-tests integration::requests::
//! cargo bench -p relay-tests
//! ```

#![allow(dead_code)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod integration;
