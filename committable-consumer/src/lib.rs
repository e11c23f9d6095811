//! Committable Kafka consumer.
//!
//! A consumer stage turns a poll-driven [`ConsumerClient`](kafka::ConsumerClient) into a
//! backpressured stream of messages, each carrying an offset that can be committed on
//! its own or merged into a batch spanning several stages. A [`Control`](kafka::Control)
//! handle stops the stream and shuts the stage down once in-flight commits resolve.
//!
//! ## Error logging
//!
//! Log errors as a structured field with `error = ?e` so the cause chain stays visible.
//! The binary wraps setup failures with `.context()` rather than formatting them into
//! new messages.

pub mod config;
pub mod error;
pub mod kafka;

pub use error::{ClientError, CommitError, ConsumerError};
