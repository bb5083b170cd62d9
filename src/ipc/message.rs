//! Tagged cluster messages
//!
//! Every message is a JSON envelope whose `tag` is `<prefix>:<kind>`. Anything
//! that does not carry our prefix, or does not parse, decodes to
//! [`ClusterMessage::Unrelated`] and is ignored by the receiver.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::os::fd::OwnedFd;
use tracing::warn;

use crate::types::WorkerSlot;

pub const KIND_CONNECTION: &str = "connection";
pub const KIND_CLOSED: &str = "closed";
pub const KIND_READY: &str = "ready";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    tag: String,
    slot: WorkerSlot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    addr: Option<SocketAddr>,
}

/// A decoded message from the other side of a worker channel
#[derive(Debug)]
pub enum ClusterMessage {
    /// Master → worker: take ownership of this client connection
    Connection {
        slot: WorkerSlot,
        peer: SocketAddr,
        handle: OwnedFd,
    },
    /// Worker → master: a forwarded connection has finished
    Closed { slot: WorkerSlot, peer: SocketAddr },
    /// Worker → master: worker is serving, loopback listener bound at `local_addr`
    Ready {
        slot: WorkerSlot,
        local_addr: SocketAddr,
    },
    /// Not ours
    Unrelated,
}

impl ClusterMessage {
    /// Encode the envelope for a connection hand-off (the descriptor travels separately).
    pub fn encode_connection(prefix: &str, slot: WorkerSlot, peer: SocketAddr) -> Vec<u8> {
        encode(prefix, KIND_CONNECTION, slot, peer)
    }

    pub fn encode_closed(prefix: &str, slot: WorkerSlot, peer: SocketAddr) -> Vec<u8> {
        encode(prefix, KIND_CLOSED, slot, peer)
    }

    pub fn encode_ready(prefix: &str, slot: WorkerSlot, local_addr: SocketAddr) -> Vec<u8> {
        encode(prefix, KIND_READY, slot, local_addr)
    }

    /// Decode a message. Descriptors not claimed by the message are closed.
    pub fn decode(prefix: &str, payload: &[u8], mut fds: Vec<OwnedFd>) -> ClusterMessage {
        let Ok(envelope) = serde_json::from_slice::<Envelope>(payload) else {
            return ClusterMessage::Unrelated;
        };

        let Some(kind) = envelope
            .tag
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_prefix(':'))
        else {
            return ClusterMessage::Unrelated;
        };

        match (kind, envelope.addr) {
            (KIND_CONNECTION, Some(peer)) => {
                if fds.is_empty() {
                    warn!(slot = envelope.slot, %peer, "Connection message arrived without a handle");
                    return ClusterMessage::Unrelated;
                }
                ClusterMessage::Connection {
                    slot: envelope.slot,
                    peer,
                    handle: fds.remove(0),
                }
            }
            (KIND_CLOSED, Some(peer)) => ClusterMessage::Closed {
                slot: envelope.slot,
                peer,
            },
            (KIND_READY, Some(local_addr)) => ClusterMessage::Ready {
                slot: envelope.slot,
                local_addr,
            },
            _ => ClusterMessage::Unrelated,
        }
    }
}

fn encode(prefix: &str, kind: &str, slot: WorkerSlot, addr: SocketAddr) -> Vec<u8> {
    let envelope = Envelope {
        tag: format!("{}:{}", prefix, kind),
        slot,
        addr: Some(addr),
    };
    // An envelope of a string, an integer and an address always serializes.
    serde_json::to_vec(&envelope).unwrap_or_default()
}
