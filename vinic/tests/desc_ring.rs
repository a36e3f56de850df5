//! Integration tests: a descriptor-ring virtual interface against a
//! simulated NIC writing phase-bit events.

use std::cell::RefCell;
use std::rc::Rc;

use vinic::desc::TX_DESC_CONT;
use vinic::{
    Arch, Config, ConfigBuilder, DescRings, DoorbellQueue, Error, Event, EventFlags, IoVec,
    Resources, SharedRegion, Vi,
};

// ── Simulated NIC ───────────────────────────────────────────────────

const EV_PHASE_SHIFT: u32 = 59;
const EV_TYPE_SHIFT: u32 = 60;
const EV_TX: u64 = 0;
const EV_RX: u64 = 1;
const EV_CONTROL: u64 = 3;

struct Nic {
    vi: Vi,
    tx: SharedRegion,
    evq: SharedRegion,
    evq_bytes: usize,
    ev_ptr: usize,
    rung: Rc<RefCell<Vec<(DoorbellQueue, u32)>>>,
}

impl Nic {
    fn new(config: Config) -> Self {
        let evq_bytes = config.evq_size as usize * 8;
        let rings = DescRings::anonymous(&config).unwrap();
        let (tx, evq) = (rings.tx.clone(), rings.evq.clone());
        let rung = Rc::new(RefCell::new(Vec::new()));
        let log = rung.clone();
        let doorbell = Box::new(move |q: DoorbellQueue, p: u32| log.borrow_mut().push((q, p)));
        Nic {
            vi: Vi::new(config, Resources::Desc { rings, doorbell }).unwrap(),
            tx,
            evq,
            evq_bytes,
            ev_ptr: 0,
            rung,
        }
    }

    /// Write the next event with the phase of the current lap.
    fn event(&mut self, kind: u64, payload: u64) {
        let phase = ((self.ev_ptr / self.evq_bytes) & 1) as u64;
        let ev = payload | (phase << EV_PHASE_SHIFT) | (kind << EV_TYPE_SHIFT);
        self.evq.write_u64(self.ev_ptr % self.evq_bytes, ev);
        self.ev_ptr += 8;
    }

    fn rx_done(&mut self, ptr: u16, bytes: u64, cont: bool) {
        self.event(EV_RX, ptr as u64 | (bytes << 16) | ((cont as u64) << 38));
    }

    fn tx_done(&mut self, ptr: u16) {
        self.event(EV_TX, ptr as u64);
    }

    fn poll(&mut self, max: usize) -> Vec<Event> {
        let mut events = Vec::new();
        let n = self.vi.poll(max, &mut events);
        assert_eq!(n, events.len());
        events
    }
}

fn test_config() -> Config {
    ConfigBuilder::new()
        .arch(Arch::DescRing)
        .rxq_size(8)
        .txq_size(8)
        .evq_size(16)
        .rx_buffer(2048, 16)
        .build()
        .unwrap()
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn transmit_and_unbundle() {
    let mut nic = Nic::new(test_config());
    nic.vi.transmit(0x1000, 60, 1).unwrap();
    nic.vi
        .transmitv(&[IoVec::new(0x2000, 14), IoVec::new(0x3000, 200)], 2)
        .unwrap();
    nic.vi.transmit_init(0x4000, 80, 3).unwrap();
    nic.vi.transmit_push();
    assert_eq!(
        *nic.rung.borrow(),
        vec![
            (DoorbellQueue::Tx, 1),
            (DoorbellQueue::Tx, 3),
            (DoorbellQueue::Tx, 4)
        ]
    );
    assert_eq!(nic.vi.transmit_fill_level(), 4);

    // Second descriptor is the first fragment of packet 2.
    assert_eq!(nic.tx.read_u64(16), 0x2000);
    assert_eq!(nic.tx.read_u32(28), TX_DESC_CONT);
    assert_eq!(nic.tx.read_u32(44), 0);

    // The NIC reports the last descriptor it finished, inclusive.
    nic.tx_done(1);
    nic.tx_done(3);
    let events = nic.poll(8);
    assert_eq!(events.len(), 2);

    let mut ids = Vec::new();
    let tx = events[0].as_tx().unwrap();
    assert_eq!(tx.desc_id, 2);
    // Packet 2's first fragment completes without handing back an id.
    assert_eq!(nic.vi.transmit_unbundle(tx, &mut ids), 2);
    assert_eq!(ids, vec![1]);

    let tx = events[1].as_tx().unwrap();
    assert_eq!(nic.vi.transmit_unbundle(tx, &mut ids), 2);
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(nic.vi.transmit_space(), 8);
}

#[test]
fn receive_single_and_jumbo() {
    let mut nic = Nic::new(test_config());
    for id in 0..4 {
        nic.vi.receive_init(0x10000 + id as u64 * 2048, id).unwrap();
    }
    nic.vi.receive_push();
    assert_eq!(*nic.rung.borrow(), vec![(DoorbellQueue::Rx, 4)]);
    assert!(!nic.vi.has_event());

    nic.rx_done(0, 60, false);
    nic.rx_done(1, 2048, true);
    nic.rx_done(2, 2048, true);
    nic.rx_done(3, 500, false);
    assert!(nic.vi.has_event());

    let events = nic.poll(8);
    let rx: Vec<_> = events.iter().filter_map(Event::as_rx).collect();
    assert_eq!(rx.len(), 4);
    assert_eq!((rx[0].rq_id, rx[0].len, rx[0].offset), (0, 60, 16));
    assert_eq!(rx[0].flags, EventFlags::SOP);
    assert_eq!(rx[1].flags, EventFlags::SOP | EventFlags::CONT);
    assert_eq!(rx[1].offset, 16);
    assert_eq!(rx[2].flags, EventFlags::CONT);
    assert_eq!(rx[2].offset, 0);
    assert_eq!(rx[3].flags, EventFlags::empty());
    assert_eq!((rx[3].rq_id, rx[3].len), (3, 500));
    assert_eq!(nic.vi.receive_fill_level(), 0);
}

#[test]
fn stale_events_invisible_across_laps() {
    let mut nic = Nic::new(test_config());
    let mut next = 0u32;
    // Three laps of a 16-entry event ring, four events at a time.
    for _ in 0..12 {
        for _ in 0..4 {
            nic.vi.receive_init(0, next).unwrap();
            nic.rx_done(next as u16, 64, false);
            next += 1;
        }
        let ids: Vec<u32> = nic
            .poll(16)
            .iter()
            .filter_map(Event::as_rx)
            .map(|rx| rx.rq_id)
            .collect();
        assert_eq!(ids, (next - 4..next).collect::<Vec<_>>());
        // Entries left over from the previous lap are not events.
        assert!(!nic.vi.has_event());
        assert!(nic.poll(16).is_empty());
    }
}

#[test]
fn control_events_consumed_silently() {
    let mut nic = Nic::new(test_config());
    nic.vi.transmit(0, 64, 7).unwrap();
    nic.event(EV_CONTROL, 0x1234);
    nic.tx_done(0);
    let events = nic.poll(8);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].as_tx().map(|tx| tx.desc_id), Some(1));
}

#[test]
fn poll_respects_max() {
    let mut nic = Nic::new(test_config());
    for id in 0..5 {
        nic.vi.receive_init(0, id).unwrap();
        nic.rx_done(id as u16, 64, false);
    }
    assert_eq!(nic.poll(3).len(), 3);
    assert_eq!(nic.poll(3).len(), 2);
}

#[test]
fn transmit_ring_full() {
    let mut nic = Nic::new(test_config());
    for id in 0..8 {
        nic.vi.transmit_init(0, 64, id).unwrap();
    }
    assert!(matches!(nic.vi.transmit(0, 64, 8), Err(Error::RingFull)));
    assert_eq!(nic.vi.transmit_space(), 0);

    nic.tx_done(3);
    let events = nic.poll(8);
    let mut ids = Vec::new();
    nic.vi.transmit_unbundle(events[0].as_tx().unwrap(), &mut ids);
    assert_eq!(ids, vec![0, 1, 2, 3]);
    nic.vi.transmit(0, 64, 8).unwrap();
}

#[test]
fn evq_reinit_forgets_pending_events() {
    let mut nic = Nic::new(test_config());
    nic.vi.receive_init(0, 1).unwrap();
    nic.rx_done(0, 64, false);
    assert!(nic.vi.has_event());
    nic.vi.evq_reinit();
    assert!(!nic.vi.has_event());
    assert!(nic.poll(8).is_empty());
}
