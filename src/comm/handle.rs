use super::Tag;
use crate::Rank;

/// A received message, handed to the callback registered for its tag. The
/// payload can be taken out to avoid copying large buffers.
#[derive(Debug)]
pub struct MessageHandle {
    pub source: Rank,
    pub tag: Tag,
    payload: Vec<u8>,
}

impl MessageHandle {
    pub fn new(source: Rank, tag: Tag, payload: Vec<u8>) -> Self {
        Self { source, tag, payload }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Moves the payload out of the handle, leaving it empty.
    pub fn take_payload(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.payload)
    }
}
