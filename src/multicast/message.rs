/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The per-message wire header, the pooled message buffers, and the in-flight message records.
//!
//! Buffers move through a fixed pool: free, in flight, locally stable, delivered, then back to
//! free. Allocation is O(1) from the free list and nothing in the hot path touches the heap.

use crate::types::basic::{MessageId, NodeId};

/// The exact size of the packed header: `u32 + i32 + u64 + u8`, no padding.
pub const HEADER_SIZE: usize = 17;

/// The header at the front of every multicast message, little-endian, packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    /// Size of the header itself. A message whose total size equals its `header_size` is a null
    /// message: it carries no payload, skips the stability callback, and is never versioned.
    pub header_size: u32,
    /// The sender's per-subgroup message index.
    pub index: MessageId,
    /// Send timestamp, nanoseconds since the epoch.
    pub timestamp: u64,
    /// Whether the payload is a serialized RPC invocation.
    pub cooked_send: bool,
}

impl Header {
    pub fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.header_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16] = self.cooked_send as u8;
    }

    pub fn decode(buf: &[u8]) -> Header {
        Header {
            header_size: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            index: MessageId::from_le_bytes(buf[4..8].try_into().unwrap()),
            timestamp: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            cooked_send: buf[16] != 0,
        }
    }
}

/// A block of memory used to store one message. Move-only; returns to its subgroup's free list
/// when the message is delivered or aborted.
#[derive(Debug)]
pub struct MessageBuffer {
    pub buffer: Box<[u8]>,
}

impl MessageBuffer {
    pub fn new(size: usize) -> MessageBuffer {
        MessageBuffer {
            buffer: vec![0u8; size].into_boxed_slice(),
        }
    }
}

/// A bulk-transport message and its locally held metadata. The metadata is not sent over the
/// network; receivers reconstruct it from the header and the group the message arrived on.
#[derive(Debug)]
pub struct BulkMessage {
    pub sender_id: NodeId,
    pub index: MessageId,
    pub size: usize,
    pub message_buffer: MessageBuffer,
}

impl BulkMessage {
    pub fn header(&self) -> Header {
        Header::decode(&self.message_buffer.buffer)
    }

    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        &self.message_buffer.buffer[header.header_size as usize..self.size]
    }

    pub fn is_null(&self) -> bool {
        self.size == self.header().header_size as usize
    }
}

/// A message received through the small-message ring, copied out of its slot.
#[derive(Clone, Debug)]
pub struct RingMessage {
    pub sender_id: NodeId,
    pub index: MessageId,
    pub size: usize,
    pub data: Vec<u8>,
}

impl RingMessage {
    pub fn header(&self) -> Header {
        Header::decode(&self.data)
    }

    pub fn payload(&self) -> &[u8] {
        let header = self.header();
        &self.data[header.header_size as usize..self.size]
    }

    pub fn is_null(&self) -> bool {
        self.size == self.header().header_size as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrips_through_exact_layout() {
        let header = Header {
            header_size: HEADER_SIZE as u32,
            index: 42,
            timestamp: 1_234_567_890_123,
            cooked_send: true,
        };
        let mut buf = [0u8; HEADER_SIZE];
        header.encode_into(&mut buf);
        assert_eq!(Header::decode(&buf), header);
        // Field offsets are part of the wire format.
        assert_eq!(&buf[0..4], &(HEADER_SIZE as u32).to_le_bytes());
        assert_eq!(&buf[4..8], &42i32.to_le_bytes());
        assert_eq!(buf[16], 1);
    }

    #[test]
    fn null_message_is_header_only() {
        let mut message = BulkMessage {
            sender_id: NodeId::new(1),
            index: 0,
            size: HEADER_SIZE,
            message_buffer: MessageBuffer::new(64),
        };
        Header {
            header_size: HEADER_SIZE as u32,
            index: 0,
            timestamp: 0,
            cooked_send: false,
        }
        .encode_into(&mut message.message_buffer.buffer);
        assert!(message.is_null());
        assert!(message.payload().is_empty());
        message.size = HEADER_SIZE + 8;
        assert!(!message.is_null());
    }
}
