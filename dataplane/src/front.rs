use crate::packet::{Packet, PacketList};

/// Worker-local four-list structure for a packet batch in flight.
///
/// Modules pop from `input` and push each packet to exactly one of
/// `output`, `drop` or `pending`; after a module has drained the input
/// the worker rotates `output` back into `input` for the next module.
#[derive(Default)]
pub struct PacketFront {
    pub input: PacketList,
    pub output: PacketList,
    pub drop: PacketList,
    pub pending: PacketList,
}

impl PacketFront {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn pop_input(&mut self) -> Option<Packet> {
        self.input.pop()
    }

    #[inline]
    pub fn output(&mut self, packet: Packet) {
        self.output.push(packet);
    }

    #[inline]
    pub fn drop(&mut self, packet: Packet) {
        self.drop.push(packet);
    }

    #[inline]
    pub fn pending(&mut self, packet: Packet) {
        self.pending.push(packet);
    }

    /// Move this module's output into the next module's input.
    pub fn rotate(&mut self) {
        debug_assert!(self.input.is_empty());
        self.input.concat(&mut self.output);
    }
}
