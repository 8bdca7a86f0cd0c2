//! Thin adapters at the crate boundary.
//!
//! The HTTP surface itself lives outside this crate; these helpers keep the
//! handlers trivial.

mod sse;

pub use sse::{event_to_sse, keep_alive_frame};
