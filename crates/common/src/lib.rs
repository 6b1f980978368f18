//! Types shared by the token-refresh client and the session gateway

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
