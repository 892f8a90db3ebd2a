//! Types shared across the gateway crates

mod error;
mod fingerprint;
mod secret;

pub use error::{Error, Result};
pub use fingerprint::fingerprint;
pub use secret::Secret;
