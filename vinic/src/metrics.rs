//! vinic ring metrics.
//!
//! Process-wide counters for ring activity, superbuf turnover and CTPIO
//! traffic. Exposed through metriken to whatever exporter the application
//! runs.

use crate::counter::{Counter, CounterGroup};
use metriken::metric;

static TX: CounterGroup = CounterGroup::new();
static RX: CounterGroup = CounterGroup::new();
static SUPERBUF: CounterGroup = CounterGroup::new();

/// Counter slot indices for transmit metrics.
pub mod tx {
    pub const POSTED: usize = 0;
    pub const RING_FULL: usize = 1;
    pub const COMPLETED: usize = 2;
    pub const CTPIO_BYTES: usize = 3;
    pub const KICKS: usize = 4;
    pub const KICK_FAILURES: usize = 5;
}

/// Counter slot indices for receive metrics.
pub mod rx {
    pub const POSTED: usize = 0;
    pub const RING_FULL: usize = 1;
    pub const DELIVERED: usize = 2;
    pub const POLLS_TRUNCATED: usize = 3;
}

/// Counter slot indices for superbuf metrics.
pub mod superbuf {
    pub const ACQUIRED: usize = 0;
    pub const FREED: usize = 1;
    pub const NOT_READY: usize = 2;
    pub const REFRESHES: usize = 3;
    pub const REFRESH_FAILURES: usize = 4;
}

// ── Transmit ─────────────────────────────────────────────────────

#[metric(name = "vinic/tx/posted", description = "Transmit requests posted")]
pub static TX_POSTED: Counter = Counter::new(&TX, tx::POSTED);

#[metric(
    name = "vinic/tx/ring_full",
    description = "Transmit requests rejected for lack of ring or FIFO space"
)]
pub static TX_RING_FULL: Counter = Counter::new(&TX, tx::RING_FULL);

#[metric(
    name = "vinic/tx/completed",
    description = "Transmit requests returned by unbundling completions"
)]
pub static TX_COMPLETED: Counter = Counter::new(&TX, tx::COMPLETED);

#[metric(
    name = "vinic/tx/ctpio_bytes",
    description = "Bytes written to the CTPIO aperture, including headers and padding"
)]
pub static CTPIO_BYTES: Counter = Counter::new(&TX, tx::CTPIO_BYTES);

#[metric(name = "vinic/tx/kicks", description = "AF_XDP transmit kicks issued")]
pub static TX_KICKS: Counter = Counter::new(&TX, tx::KICKS);

#[metric(
    name = "vinic/tx/kick_failures",
    description = "AF_XDP transmit kicks that failed and will be retried"
)]
pub static TX_KICK_FAILURES: Counter = Counter::new(&TX, tx::KICK_FAILURES);

// ── Receive ──────────────────────────────────────────────────────

#[metric(name = "vinic/rx/posted", description = "Receive buffers posted")]
pub static RX_POSTED: Counter = Counter::new(&RX, rx::POSTED);

#[metric(
    name = "vinic/rx/ring_full",
    description = "Receive buffers rejected because the ring was full"
)]
pub static RX_RING_FULL: Counter = Counter::new(&RX, rx::RING_FULL);

#[metric(name = "vinic/rx/delivered", description = "Receive events delivered")]
pub static RX_DELIVERED: Counter = Counter::new(&RX, rx::DELIVERED);

#[metric(
    name = "vinic/rx/polls_truncated",
    description = "Polls cut short by superbuf exhaustion or refresh failure"
)]
pub static RX_POLLS_TRUNCATED: Counter = Counter::new(&RX, rx::POLLS_TRUNCATED);

// ── Superbufs ────────────────────────────────────────────────────

#[metric(
    name = "vinic/superbuf/acquired",
    description = "Superbufs taken from the kernel ready queue"
)]
pub static SUPERBUFS_ACQUIRED: Counter = Counter::new(&SUPERBUF, superbuf::ACQUIRED);

#[metric(
    name = "vinic/superbuf/freed",
    description = "Superbufs returned to the kernel free queue"
)]
pub static SUPERBUFS_FREED: Counter = Counter::new(&SUPERBUF, superbuf::FREED);

#[metric(
    name = "vinic/superbuf/not_ready",
    description = "Rollovers that found the ready queue empty"
)]
pub static SUPERBUFS_NOT_READY: Counter = Counter::new(&SUPERBUF, superbuf::NOT_READY);

#[metric(
    name = "vinic/superbuf/refreshes",
    description = "Superbuf remaps after a configuration generation change"
)]
pub static SUPERBUF_REFRESHES: Counter = Counter::new(&SUPERBUF, superbuf::REFRESHES);

#[metric(
    name = "vinic/superbuf/refresh_failures",
    description = "Superbuf remaps that failed"
)]
pub static SUPERBUF_REFRESH_FAILURES: Counter =
    Counter::new(&SUPERBUF, superbuf::REFRESH_FAILURES);
