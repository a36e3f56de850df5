use bitflags::bitflags;

bitflags! {
    /// Per-event flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u16 {
        /// First buffer of a packet.
        const SOP = 1 << 0;
        /// More buffers of the same packet follow.
        const CONT = 1 << 1;
        /// Completion of a CTPIO send.
        const CTPIO = 1 << 2;
    }
}

/// A packet (or one buffer of a packet) has arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxEvent {
    pub queue: u16,
    /// Request id given to `receive_init`, or the raw packet id on EFCT.
    pub rq_id: u32,
    /// Bytes written into the buffer.
    pub len: u32,
    /// Offset of the frame within the buffer.
    pub offset: u32,
    pub flags: EventFlags,
}

/// Transmit descriptors up to (not including) `desc_id` have completed.
///
/// Pass the event to `Vi::transmit_unbundle` to recover the request ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxEvent {
    pub queue: u16,
    /// Free-running count of completed transmit descriptors.
    pub desc_id: u32,
    pub flags: EventFlags,
}

/// One entry produced by polling a virtual interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Rx(RxEvent),
    Tx(TxEvent),
}

impl Event {
    pub fn as_rx(&self) -> Option<&RxEvent> {
        match self {
            Event::Rx(rx) => Some(rx),
            Event::Tx(_) => None,
        }
    }

    pub fn as_tx(&self) -> Option<&TxEvent> {
        match self {
            Event::Tx(tx) => Some(tx),
            Event::Rx(_) => None,
        }
    }
}
