use core::fmt;

/// A general-purpose 64-bit register.
///
/// The id is the hardware encoding: 0 is `rax`, 15 is `r15`. Ids 8 and
/// above need a REX extension bit, which the encoder derives from the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegId(u8);

impl RegId {
    /// Accumulator, `rax`.
    pub const RAX: RegId = RegId(0);
    /// Counter, `rcx`.
    pub const RCX: RegId = RegId(1);
    /// Data, `rdx`.
    pub const RDX: RegId = RegId(2);
    /// Base, `rbx`.
    pub const RBX: RegId = RegId(3);
    /// Stack pointer, `rsp`.
    pub const RSP: RegId = RegId(4);
    /// Frame base, `rbp`.
    pub const RBP: RegId = RegId(5);
    /// Source index, `rsi`.
    pub const RSI: RegId = RegId(6);
    /// Destination index, `rdi`.
    pub const RDI: RegId = RegId(7);
    /// Extended register `r8`.
    pub const R8: RegId = RegId(8);
    /// Extended register `r9`.
    pub const R9: RegId = RegId(9);
    /// Extended register `r10`.
    pub const R10: RegId = RegId(10);
    /// Extended register `r11`.
    pub const R11: RegId = RegId(11);
    /// Extended register `r12`.
    pub const R12: RegId = RegId(12);
    /// Extended register `r13`.
    pub const R13: RegId = RegId(13);
    /// Extended register `r14`.
    pub const R14: RegId = RegId(14);
    /// Extended register `r15`.
    pub const R15: RegId = RegId(15);

    /// Construct from a hardware encoding in `0..16`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub const fn new(id: u8) -> Self {
        assert!(id < 16, "general-purpose register id out of range");
        Self(id)
    }

    /// The hardware encoding.
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    /// The low three encoding bits, placed in ModRM/SIB fields.
    pub(crate) const fn low3(self) -> u8 {
        self.0 & 0b111
    }

    /// Whether the REX extension bit is required.
    pub(crate) const fn ext(self) -> bool {
        self.0 >= 8
    }
}

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10",
            "r11", "r12", "r13", "r14", "r15",
        ];
        f.write_str(NAMES[self.0 as usize])
    }
}

/// An SSE register holding four packed single-precision lanes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct XmmId(u8);

impl XmmId {
    /// `xmm0`.
    pub const XMM0: XmmId = XmmId(0);
    /// `xmm1`.
    pub const XMM1: XmmId = XmmId(1);
    /// `xmm2`.
    pub const XMM2: XmmId = XmmId(2);
    /// `xmm3`.
    pub const XMM3: XmmId = XmmId(3);
    /// `xmm4`.
    pub const XMM4: XmmId = XmmId(4);
    /// `xmm5`.
    pub const XMM5: XmmId = XmmId(5);
    /// `xmm6`.
    pub const XMM6: XmmId = XmmId(6);
    /// `xmm7`.
    pub const XMM7: XmmId = XmmId(7);
    /// `xmm8`.
    pub const XMM8: XmmId = XmmId(8);
    /// `xmm9`.
    pub const XMM9: XmmId = XmmId(9);
    /// `xmm10`.
    pub const XMM10: XmmId = XmmId(10);
    /// `xmm11`.
    pub const XMM11: XmmId = XmmId(11);
    /// `xmm12`.
    pub const XMM12: XmmId = XmmId(12);
    /// `xmm13`.
    pub const XMM13: XmmId = XmmId(13);
    /// `xmm14`.
    pub const XMM14: XmmId = XmmId(14);
    /// `xmm15`.
    pub const XMM15: XmmId = XmmId(15);

    /// Construct from a hardware encoding in `0..16`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is out of range.
    pub const fn new(id: u8) -> Self {
        assert!(id < 16, "sse register id out of range");
        Self(id)
    }

    /// The hardware encoding.
    pub const fn to_u8(self) -> u8 {
        self.0
    }

    pub(crate) const fn low3(self) -> u8 {
        self.0 & 0b111
    }

    pub(crate) const fn ext(self) -> bool {
        self.0 >= 8
    }
}

impl fmt::Display for XmmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}
