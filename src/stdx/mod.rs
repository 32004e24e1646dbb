//! Small, self-contained data structures backing the matcher's caches.
//!
//! Fixed or upfront capacity, deterministic reset behavior, no growth on the
//! hot path.

pub mod lru;

pub use lru::Lru;
