//! Rotation and liveness for a pool of Gemini API keys
//!
//! `KeyPool` is the only component that mutates the key store. It hands out
//! keys round-robin (or least-recently-used), quarantines keys the upstream
//! reports as permanently invalid, and registers caller-supplied keys once
//! they prove valid.
//!
//! Key lifecycle:
//! 1. Seeded at startup, added through the admin API, or registered after a
//!    successful passthrough request → alive
//! 2. `acquire()` stamps `last_used` and advances the shared cursor
//! 3. Upstream reports suspension/expiry → `quarantine()` sets `alive=false`
//! 4. Re-registering or re-importing a quarantined key reactivates it
//!
//! Coordination between concurrent callers (and between gateway replicas over
//! a shared store) goes through the store's conditional writes only.

pub mod error;
pub mod pool;

pub use error::{Error, Result};
pub use pool::{ImportOutcome, KeyPool, PoolSettings, PoolSummary, Rotation};
