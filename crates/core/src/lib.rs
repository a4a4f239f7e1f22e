//! Core types, errors, and result helpers shared by every stagewise crate.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod result;
pub mod types;

pub use error::{Error, ErrorKind};
pub use result::{Result, ResultExt};
pub use types::{CorrelationId, WorkerId};
