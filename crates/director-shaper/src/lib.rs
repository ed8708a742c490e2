//! Hierarchical token shaper.
//!
//! A [`TokenShaper`] is a rooted tree of buckets over integer tokens. Each
//! bucket guarantees its `rate` share of the parent's budget and may borrow
//! from the parent up to its `ceil`. A token represents one unit of
//! concurrent in-flight work; it is acquired when a request is dispatched
//! and returned when the request completes, so the shaper is not
//! time-sliced.
//!
//! Buckets also carry a FIFO queue of waiters. [`TokenShaper::dequeue`]
//! walks the tree with a rotating sibling cursor, so no non-empty bucket is
//! starved indefinitely while a sibling keeps filling.
//!
//! # Example
//!
//! ```rust
//! use director_shaper::TokenShaper;
//!
//! let mut shaper: TokenShaper<&'static str> = TokenShaper::new(4);
//! let upload = shaper.create_node("upload", 0.5, 1.0).unwrap();
//!
//! // Guaranteed share is 2, borrowing allowed up to the full root budget.
//! assert!(shaper.get(upload, 2));
//! assert!(shaper.get(upload, 2));
//! assert!(!shaper.get(upload, 1));
//! shaper.put(upload, 4);
//! ```

mod shaper;

pub use shaper::{NodeId, TokenShaper, TokenShaperError};
