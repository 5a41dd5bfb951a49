//! `Taskman` development server library.
//!
//! An in-memory implementation of the task API and its realtime channel,
//! used by the client's integration tests and for local development.

pub mod config;
pub mod server;
pub mod store;
