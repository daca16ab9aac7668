//! RCS probe core library: send simulated inbound messages to the scheduler backend and observe
//! the per-user delivery log for replies.

pub mod config;
pub mod identity;
pub mod init;
pub mod message;
pub mod observer;
pub mod sender;
pub mod sequence;
pub mod store;
pub mod webhook;
