//! Transport plumbing shared by the executors.

pub mod body;
pub mod sse;

pub use body::inflate;
pub use sse::{SseEvent, SseStream};
