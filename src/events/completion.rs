//! Event completion records

use bitflags::bitflags;

use crate::buffers::BufferDescriptor;

/// Identity used to demultiplex events to a consumer (socket)
///
/// Received packets carry it as the hardware steering tag.
pub type ConsumerId = u32;

bitflags! {
    /// Event-type bitmap; readiness bits share epoll's values
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u64 {
        const IN = 0x001;
        const OUT = 0x004;
        const ERR = 0x008;
        const HUP = 0x010;
        const RDHUP = 0x2000;
        /// Record carries received buffers
        const PACKET = 1 << 32;
        /// A listening consumer accepted a new connection
        const NEW_CONNECTION_ACCEPTED = 1 << 33;
    }
}

/// Buffers of a delivered packet
#[derive(Debug, Default)]
pub struct PacketRef {
    pub buffers: Vec<BufferDescriptor>,
    /// Sum of the buffer lengths
    pub total_len: usize,
    /// Hardware timestamp of the first buffer
    pub hw_timestamp: u64,
}

impl PacketRef {
    pub fn new(buffer: BufferDescriptor) -> Self {
        Self {
            total_len: buffer.len(),
            hw_timestamp: buffer.hw_timestamp(),
            buffers: vec![buffer],
        }
    }

    pub fn num_bufs(&self) -> usize {
        self.buffers.len()
    }

    /// Append buffers that arrived later, keeping arrival order
    pub fn append(&mut self, other: PacketRef) {
        if self.buffers.is_empty() {
            self.hw_timestamp = other.hw_timestamp;
        }
        self.total_len += other.total_len;
        self.buffers.extend(other.buffers);
    }

    /// Copy the payload of all buffers into one vector
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.total_len);
        for buffer in &self.buffers {
            data.extend_from_slice(buffer.as_slice());
        }
        data
    }
}

/// One completion surfaced to the application
#[derive(Debug)]
pub struct EventCompletion {
    pub events: EventFlags,
    pub consumer: ConsumerId,
    /// Value registered with `set_user_data`, the consumer id by default
    pub user_data: u64,
    pub packet: Option<PacketRef>,
}

impl EventCompletion {
    pub fn new(consumer: ConsumerId, events: EventFlags, user_data: u64) -> Self {
        Self {
            events,
            consumer,
            user_data,
            packet: None,
        }
    }

    /// Fold a later event for the same consumer into this record
    pub(crate) fn merge(&mut self, events: EventFlags, packet: Option<PacketRef>) {
        self.events |= events;
        if let Some(packet) = packet {
            match &mut self.packet {
                Some(existing) => existing.append(packet),
                None => self.packet = Some(packet),
            }
        }
    }
}
