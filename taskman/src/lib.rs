//! `Taskman`: task board client with optimistic sync, transparent token
//! refresh and realtime updates.

pub mod api;
pub mod config;
pub mod credentials;
pub mod gateway;
pub mod realtime;
pub mod session;
pub mod sync;
pub mod tasks;
pub mod transport;
