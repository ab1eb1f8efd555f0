//! # ripple-core
//!
//! Message log and broadcast broker for the ripple live-chat relay.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Message** - The immutable chat message value
//! - **MessageStore** - Bounded, insertion-ordered log with FIFO eviction
//! - **Broker** - Single-writer broadcast fan-out to live subscribers
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌──────────────┐     ┌──────────────┐
//! │  Publisher  │────▶│ MessageStore │     │ Subscriber 1 │
//! └─────────────┘     └──────────────┘  ┌─▶└──────────────┘
//!        │            ┌──────────────┐  │  ┌──────────────┐
//!        └───────────▶│    Broker    │──┴─▶│ Subscriber N │
//!                     └──────────────┘     └──────────────┘
//! ```
//!
//! A publish request appends to the store and hands the same message to the
//! broker, which fans it out to every currently subscribed queue in publish
//! order. The store answers "what has happened so far"; the broker makes
//! delivery live.

pub mod broker;
pub mod message;
pub mod store;

pub use broker::{Broker, SubscriberId, Subscription};
pub use message::{Message, StreamEvent};
pub use store::{MessageStore, DEFAULT_CAPACITY, MESSAGE_ID_SPACE};
