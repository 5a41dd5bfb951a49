//! Shared wire definitions for the Taskman REST API and realtime channel.

pub mod auth;
pub mod realtime;
pub mod task;
