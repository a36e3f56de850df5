use bitflags::bitflags;

/// Hardware ring format a virtual interface drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// Linux AF_XDP sockets: four rings shared with the kernel.
    AfXdp,
    /// EFCT: receive through kernel-managed superbufs, transmit through the
    /// CTPIO aperture.
    Efct,
    /// Classic descriptor rings with a phase-bit event queue.
    DescRing,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Arch::AfXdp => "af_xdp",
            Arch::Efct => "efct",
            Arch::DescRing => "desc_ring",
        }
    }
}

bitflags! {
    /// Capability and behaviour flags for a virtual interface.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ViFlags: u32 {
        /// EFCT: only receive queue 0 is ever attached, enabling the
        /// single-queue poll paths.
        const EFCT_UNIQUEUE = 1 << 0;
        /// Request a hardware timestamp for every transmitted packet.
        const TX_TIMESTAMPS = 1 << 1;
    }
}
