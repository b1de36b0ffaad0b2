//! `snipstash-core` — shared primitives for the snipstash backend.
//!
//! This crate contains no IO: identifiers, the clock seam, field validation and
//! the domain error model.

pub mod clock;
pub mod error;
pub mod id;
pub mod validation;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{DomainError, DomainResult};
pub use id::{SessionId, TokenId};
pub use validation::{FieldViolation, Violations};
