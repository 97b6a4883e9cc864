//! # flotilla-events
//!
//! Fleet lifecycle event kinds and queue message parsing.
//!
//! ## Design Principles
//!
//! - Recognized event kinds are a closed enum; routing on them is a
//!   compile-time-exhaustive `match`, and an unrecognized wire discriminant
//!   is a parse error, never a silent fallthrough.
//! - Queue bodies arrive either as a bare notification or wrapped in a
//!   pub/sub delivery envelope whose `Message` field holds the notification
//!   as a JSON string; parsing unwraps one level of nesting.
//! - Parsing never panics on malformed input.

mod envelope;
mod error;
mod types;

pub use envelope::LifecycleNotification;
pub use error::EventError;
pub use types::{event_types, LifecycleEventKind};
