//! Master ↔ worker messaging
//!
//! One connected `SOCK_SEQPACKET` pair per worker. The master keeps one end;
//! the other is inherited by the worker process across `exec`, its number
//! passed in the worker environment.

pub mod channel;
mod fd;
pub mod message;

pub use channel::{set_cloexec, Channel, MAX_MESSAGE_LEN};
pub use message::ClusterMessage;
