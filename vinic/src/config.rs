use crate::arch::{Arch, ViFlags};
use crate::error::Error;
use crate::pkt_id::PacketId;

/// Bytes of header and alignment granularity in the CTPIO aperture.
pub(crate) const CTPIO_HEADER_BYTES: usize = 8;
pub(crate) const CTPIO_ALIGNMENT: usize = 64;
/// Offset of the frame within an EFCT packet slot.
pub(crate) const EFCT_FRAME_OFFSET: usize = 64;

/// Configuration for a virtual interface.
#[derive(Debug, Clone)]
pub struct Config {
    /// Ring format driven by this interface.
    pub arch: Arch,
    pub flags: ViFlags,
    /// Receive ring entries (power of two). 0 = no receive queue.
    pub rxq_size: u32,
    /// Transmit ring entries (power of two). 0 = no transmit queue.
    pub txq_size: u32,
    /// Event queue entries (power of two). Used by descriptor rings and by
    /// EFCT transmit completions.
    pub evq_size: u32,
    /// Size of each receive buffer in bytes. AF_XDP derives the frame offset
    /// from buffer addresses, so it must be a power of two there.
    pub rx_buffer_len: u32,
    /// Bytes of metadata the NIC writes ahead of each received frame.
    pub rx_prefix_len: u32,
    /// Maximum transmit completions reported by a single AF_XDP TX event.
    pub tx_batch: u32,
    /// Received frames carry a cpacket timestamp trailer.
    pub cpacket_timestamps: bool,
    /// EFCT superbuf and CTPIO geometry.
    pub efct: EfctConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            arch: Arch::AfXdp,
            flags: ViFlags::empty(),
            rxq_size: 512,
            txq_size: 512,
            evq_size: 1024,
            rx_buffer_len: 2048,
            rx_prefix_len: 0,
            tx_batch: 16,
            cpacket_timestamps: false,
            efct: EfctConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        for (name, size) in [("rxq_size", self.rxq_size), ("txq_size", self.txq_size)] {
            if size != 0 && !size.is_power_of_two() {
                return Err(Error::RingSetup(format!(
                    "{name} must be 0 or a power of two"
                )));
            }
        }
        if self.rxq_size == 0 && self.txq_size == 0 {
            return Err(Error::RingSetup(
                "at least one of rxq_size and txq_size must be > 0".into(),
            ));
        }
        let needs_evq = match self.arch {
            Arch::AfXdp => false,
            Arch::Efct => self.txq_size != 0,
            Arch::DescRing => true,
        };
        if needs_evq && (self.evq_size == 0 || !self.evq_size.is_power_of_two()) {
            return Err(Error::RingSetup(
                "evq_size must be > 0 and a power of two".into(),
            ));
        }
        if self.rx_buffer_len == 0 || self.rx_prefix_len >= self.rx_buffer_len {
            return Err(Error::RingSetup(
                "rx_buffer_len must be > 0 and larger than rx_prefix_len".into(),
            ));
        }
        if self.arch == Arch::AfXdp && !self.rx_buffer_len.is_power_of_two() {
            return Err(Error::RingSetup(
                "rx_buffer_len must be a power of two for AF_XDP".into(),
            ));
        }
        if self.tx_batch == 0 {
            return Err(Error::RingSetup("tx_batch must be > 0".into()));
        }
        if self.arch == Arch::Efct {
            self.efct.validate(self.txq_size)?;
        }
        Ok(())
    }
}

/// EFCT superbuf and CTPIO geometry.
#[derive(Debug, Clone)]
pub struct EfctConfig {
    /// Receive queues that may be attached (at most 8).
    pub max_rxqs: usize,
    /// Superbufs per receive queue (power of two, at most 512).
    pub max_superbufs: usize,
    /// Bytes per superbuf.
    pub superbuf_bytes: usize,
    /// Bytes per packet slot within a superbuf.
    pub pkt_stride: usize,
    /// Size of one mapping of the CTPIO aperture. The aperture must be
    /// mapped twice back to back so packets can be written contiguously.
    pub ctpio_aperture_bytes: usize,
    /// Bytes the CTPIO FIFO can hold before completions must drain it.
    pub ctpio_fifo_bytes: usize,
}

impl Default for EfctConfig {
    fn default() -> Self {
        Self {
            max_rxqs: PacketId::MAX_RXQS,
            max_superbufs: PacketId::MAX_SUPERBUFS,
            superbuf_bytes: 1 << 20,
            pkt_stride: 2048,
            ctpio_aperture_bytes: 4096,
            ctpio_fifo_bytes: 32768,
        }
    }
}

impl EfctConfig {
    /// Packets per superbuf.
    pub fn superbuf_pkts(&self) -> u32 {
        (self.superbuf_bytes / self.pkt_stride) as u32
    }

    fn validate(&self, txq_size: u32) -> Result<(), Error> {
        if self.max_rxqs == 0 || self.max_rxqs > PacketId::MAX_RXQS {
            return Err(Error::RingSetup(format!(
                "efct.max_rxqs must be 1..={}",
                PacketId::MAX_RXQS
            )));
        }
        if !self.max_superbufs.is_power_of_two() || self.max_superbufs > PacketId::MAX_SUPERBUFS {
            return Err(Error::RingSetup(format!(
                "efct.max_superbufs must be a power of two <= {}",
                PacketId::MAX_SUPERBUFS
            )));
        }
        if self.pkt_stride <= EFCT_FRAME_OFFSET
            || self.pkt_stride % 8 != 0
            || self.superbuf_bytes == 0
            || self.superbuf_bytes % self.pkt_stride != 0
        {
            return Err(Error::RingSetup(
                "efct.pkt_stride must be a multiple of 8 above the frame offset and divide efct.superbuf_bytes"
                    .into(),
            ));
        }
        // Startup primes the cursor one past the budget, which must still
        // fit the packet index field.
        if self.superbuf_pkts() as usize >= PacketId::MAX_PACKETS - 1 {
            return Err(Error::RingSetup(
                "efct.superbuf_bytes / efct.pkt_stride exceeds the packet id range".into(),
            ));
        }
        if txq_size != 0 {
            if !self.ctpio_aperture_bytes.is_power_of_two()
                || self.ctpio_aperture_bytes < CTPIO_ALIGNMENT
            {
                return Err(Error::RingSetup(
                    "efct.ctpio_aperture_bytes must be a power of two >= 64".into(),
                ));
            }
            if self.ctpio_fifo_bytes < CTPIO_ALIGNMENT {
                return Err(Error::RingSetup(
                    "efct.ctpio_fifo_bytes must be >= 64".into(),
                ));
            }
            // Every packet takes at least one 64-byte block of the FIFO, so
            // the ring must cover a full FIFO of minimum-size packets.
            let min_entries = (self.ctpio_fifo_bytes + CTPIO_HEADER_BYTES) / CTPIO_ALIGNMENT;
            if (txq_size as usize) < min_entries {
                return Err(Error::RingSetup(format!(
                    "txq_size must be >= {min_entries} to cover the CTPIO FIFO"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use vinic::{Arch, ConfigBuilder};
///
/// let config = ConfigBuilder::new()
///     .arch(Arch::DescRing)
///     .rxq_size(1024)
///     .txq_size(1024)
///     .evq_size(2048)
///     .build()
///     .expect("invalid config");
/// assert_eq!(config.rxq_size, 1024);
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder with default config values.
    pub fn new() -> Self {
        Self::default()
    }

    // ── Architecture ─────────────────────────────────────────────────

    pub fn arch(mut self, arch: Arch) -> Self {
        self.config.arch = arch;
        self
    }

    /// Replace the flag set.
    pub fn flags(mut self, flags: ViFlags) -> Self {
        self.config.flags = flags;
        self
    }

    /// Restrict EFCT receive to queue 0 for the single-queue poll paths.
    pub fn efct_uniqueue(mut self, enable: bool) -> Self {
        self.config.flags.set(ViFlags::EFCT_UNIQUEUE, enable);
        self
    }

    /// Request hardware transmit timestamps.
    pub fn tx_timestamps(mut self, enable: bool) -> Self {
        self.config.flags.set(ViFlags::TX_TIMESTAMPS, enable);
        self
    }

    // ── Ring sizes ───────────────────────────────────────────────────

    /// Set the receive ring size. 0 disables receive.
    pub fn rxq_size(mut self, n: u32) -> Self {
        self.config.rxq_size = n;
        self
    }

    /// Set the transmit ring size. 0 disables transmit.
    pub fn txq_size(mut self, n: u32) -> Self {
        self.config.txq_size = n;
        self
    }

    pub fn evq_size(mut self, n: u32) -> Self {
        self.config.evq_size = n;
        self
    }

    /// Set the maximum completions per AF_XDP TX event.
    pub fn tx_batch(mut self, n: u32) -> Self {
        self.config.tx_batch = n;
        self
    }

    // ── Receive buffers ──────────────────────────────────────────────

    /// Set the receive buffer size and the prefix written ahead of each frame.
    pub fn rx_buffer(mut self, len: u32, prefix_len: u32) -> Self {
        self.config.rx_buffer_len = len;
        self.config.rx_prefix_len = prefix_len;
        self
    }

    /// Decode cpacket timestamp trailers on received frames.
    pub fn cpacket_timestamps(mut self, enable: bool) -> Self {
        self.config.cpacket_timestamps = enable;
        self
    }

    // ── EFCT ─────────────────────────────────────────────────────────

    /// Set the number of attachable receive queues and superbufs per queue.
    pub fn efct_rxqs(mut self, max_rxqs: usize, max_superbufs: usize) -> Self {
        self.config.efct.max_rxqs = max_rxqs;
        self.config.efct.max_superbufs = max_superbufs;
        self
    }

    /// Set the superbuf size and the packet stride within it.
    pub fn efct_superbuf(mut self, superbuf_bytes: usize, pkt_stride: usize) -> Self {
        self.config.efct.superbuf_bytes = superbuf_bytes;
        self.config.efct.pkt_stride = pkt_stride;
        self
    }

    /// Set the CTPIO aperture and FIFO sizes.
    pub fn ctpio(mut self, aperture_bytes: usize, fifo_bytes: usize) -> Self {
        self.config.efct.ctpio_aperture_bytes = aperture_bytes;
        self.config.efct.ctpio_fifo_bytes = fifo_bytes;
        self
    }

    // ── Escape hatch ─────────────────────────────────────────────────

    /// Get mutable access to the underlying config for fields not covered
    /// by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
        let efct = Config {
            arch: Arch::Efct,
            ..Config::default()
        };
        efct.validate().unwrap();
        let desc = Config {
            arch: Arch::DescRing,
            ..Config::default()
        };
        desc.validate().unwrap();
    }

    #[test]
    fn builder_sets_fields() {
        let config = ConfigBuilder::new()
            .arch(Arch::Efct)
            .efct_uniqueue(true)
            .rxq_size(0)
            .txq_size(1024)
            .evq_size(256)
            .efct_superbuf(1 << 16, 1024)
            .ctpio(4096, 16384)
            .cpacket_timestamps(true)
            .build()
            .unwrap();
        assert!(config.flags.contains(ViFlags::EFCT_UNIQUEUE));
        assert_eq!(config.efct.superbuf_pkts(), 64);
        assert!(config.cpacket_timestamps);
    }

    #[test]
    fn rejects_non_power_of_two_rings() {
        assert!(ConfigBuilder::new().rxq_size(100).build().is_err());
        assert!(ConfigBuilder::new().txq_size(3).build().is_err());
        assert!(
            ConfigBuilder::new()
                .arch(Arch::DescRing)
                .evq_size(1000)
                .build()
                .is_err()
        );
    }

    #[test]
    fn rejects_empty_interface() {
        assert!(ConfigBuilder::new().rxq_size(0).txq_size(0).build().is_err());
    }

    #[test]
    fn af_xdp_needs_power_of_two_buffers() {
        assert!(ConfigBuilder::new().rx_buffer(3000, 0).build().is_err());
        assert!(
            ConfigBuilder::new()
                .arch(Arch::DescRing)
                .rx_buffer(3000, 0)
                .build()
                .is_ok()
        );
    }

    #[test]
    fn rejects_bad_efct_geometry() {
        let efct = || ConfigBuilder::new().arch(Arch::Efct);
        assert!(efct().efct_superbuf(1 << 20, 3000).build().is_err());
        assert!(efct().efct_superbuf(1 << 20, 64).build().is_err());
        assert!(efct().efct_rxqs(9, 512).build().is_err());
        assert!(efct().efct_rxqs(1, 1024).build().is_err());
        assert!(efct().efct_rxqs(1, 100).build().is_err());
    }

    #[test]
    fn txq_must_cover_ctpio_fifo() {
        let efct = || ConfigBuilder::new().arch(Arch::Efct);
        assert!(efct().txq_size(256).ctpio(4096, 32768).build().is_err());
        assert!(efct().txq_size(512).ctpio(4096, 32768).build().is_ok());
        // Receive-only interfaces don't need a CTPIO FIFO.
        assert!(efct().txq_size(0).ctpio(0, 0).build().is_ok());
    }
}
