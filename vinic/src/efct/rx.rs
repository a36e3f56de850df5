//! EFCT receive: walking superbuf headers.
//!
//! The NIC writes each packet's metadata into the header at the start of
//! the *following* packet slot, so the header at `next` describes the frame
//! at `prev`. A header is valid once its sentinel matches the phase the
//! kernel gave the superbuf.

use log::error;

use super::superbuf::{EfctRxq, SuperbufRefresh};
use crate::bits::Field;
use crate::config::EFCT_FRAME_OFFSET;
use crate::error::Error;
use crate::event::{Event, EventFlags, RxEvent};
use crate::metrics;

pub(crate) const RX_HEADER_PACKET_LENGTH: Field = Field::new(0, 14);
pub(crate) const RX_HEADER_NEXT_FRAME_LOC: Field = Field::new(14, 2);
pub(crate) const RX_HEADER_SENTINEL: Field = Field::new(43, 1);

/// `NEXT_FRAME_LOC` value placing the frame at [`EFCT_FRAME_OFFSET`].
const NEXT_FRAME_LOC_1: u64 = 1;

/// Superbuf geometry shared by every receive queue of a VI.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Geometry {
    pub(crate) superbuf_bytes: usize,
    pub(crate) pkt_stride: usize,
}

impl EfctRxq {
    /// The header describing `prev`, if the NIC has written it.
    pub(crate) fn next_header(&self, geo: Geometry) -> Option<u64> {
        let off = self.slot_offset(self.next, geo.superbuf_bytes, geo.pkt_stride);
        let header = self.superbufs().observe_u64(off);
        (RX_HEADER_SENTINEL.is_set(header) == self.next.sentinel()).then_some(header)
    }

    /// True when a packet could be delivered by the next poll without
    /// consuming anything.
    pub(crate) fn has_packet(&self, geo: Geometry) -> bool {
        if self.needs_rollover() {
            return self.ready_pending();
        }
        self.next_header(geo).is_some()
    }
}

/// Deliver up to `max` packets from one receive queue.
///
/// Never fails: running out of superbufs or failing to remap them ends the
/// poll early with whatever was delivered so far.
pub(crate) fn poll_rxq(
    qid: usize,
    rxq: &mut EfctRxq,
    refresh: &mut dyn SuperbufRefresh,
    geo: Geometry,
    max: usize,
    events: &mut Vec<Event>,
) -> usize {
    let mut n = 0;
    while n < max {
        if rxq.needs_rollover() && rxq.rollover().is_err() {
            metrics::RX_POLLS_TRUNCATED.increment();
            break;
        }
        // Another process sharing the queue may have rolled over onto a
        // superbuf we have not mapped yet.
        if rxq.take_config_change() {
            metrics::SUPERBUF_REFRESHES.increment();
            if let Err(e) = refresh.refresh(qid, rxq.superbufs()).map_err(Error::Refresh) {
                error!("EFCT rxq {qid}: {e}");
                metrics::SUPERBUF_REFRESH_FAILURES.increment();
                metrics::RX_POLLS_TRUNCATED.increment();
                break;
            }
        }

        let Some(header) = rxq.next_header(geo) else {
            break;
        };
        assert_eq!(
            RX_HEADER_NEXT_FRAME_LOC.get(header),
            NEXT_FRAME_LOC_1,
            "EFCT receive queue {qid} not configured for a fixed frame offset"
        );

        events.push(Event::Rx(RxEvent {
            queue: qid as u16,
            rq_id: rxq.prev.without_sentinel().raw(),
            len: RX_HEADER_PACKET_LENGTH.get(header) as u32,
            offset: EFCT_FRAME_OFFSET as u32,
            flags: EventFlags::SOP,
        }));
        n += 1;

        rxq.prev = rxq.next;
        rxq.next = rxq.next.next();
    }
    metrics::RX_DELIVERED.add(n as u64);
    n
}
