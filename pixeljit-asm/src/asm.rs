use std::collections::HashMap;

use crate::error::AsmError;
use crate::mem::Mem;
use crate::reg::{RegId, XmmId};

/// Predicate field of the packed-single compare instruction `cmpps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::EnumIter, strum::IntoStaticStr)]
#[repr(u8)]
pub enum CmpOp {
    /// Lanes compare equal.
    Eq = 0,
    /// Lanes compare less-than.
    Lt = 1,
    /// Lanes compare less-or-equal.
    Le = 2,
    /// Lanes are unordered (either side NaN).
    Unord = 3,
    /// Lanes compare not-equal.
    Neq = 4,
    /// Lanes compare not-less-than.
    Nlt = 5,
    /// Lanes compare not-less-or-equal.
    Nle = 6,
    /// Lanes are ordered (neither side NaN).
    Ord = 7,
}

/// An x86-64 code buffer.
///
/// Each method appends the encoding of one instruction. Branch targets
/// are string labels; forward references leave a placeholder displacement
/// that [`Assembler::finalize`] patches once every label is bound.
#[derive(Debug, Default)]
pub struct Assembler {
    buf: Vec<u8>,
    labels: HashMap<String, usize>,
    fixups: Vec<(usize, String)>,
}

const REX_W: u8 = 0x48;

impl Assembler {
    /// An empty code buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bytes emitted so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// The finished code.
    ///
    /// Fails if forward branches are still unpatched.
    pub fn code(&self) -> Result<&[u8], AsmError> {
        if !self.fixups.is_empty() {
            return Err(AsmError::PendingFixups);
        }
        Ok(&self.buf)
    }

    /// Bind `name` to the current position.
    pub fn label(&mut self, name: &str) -> Result<(), AsmError> {
        if self
            .labels
            .insert(name.to_string(), self.buf.len())
            .is_some()
        {
            return Err(AsmError::DuplicateLabel(name.to_string()));
        }
        Ok(())
    }

    /// Patch every recorded forward branch.
    pub fn finalize(&mut self) -> Result<(), AsmError> {
        for (pos, name) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&name)
                .ok_or_else(|| AsmError::UnboundLabel(name.clone()))?;
            let rel = (target as i64) - (pos as i64 + 4);
            let rel = i32::try_from(rel).map_err(|_| AsmError::BranchOutOfRange(name))?;
            self.buf[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(())
    }

    fn byte(&mut self, b: u8) {
        self.buf.push(b);
    }

    fn bytes(&mut self, bs: &[u8]) {
        self.buf.extend_from_slice(bs);
    }

    // REX prefix from the extension bits of the reg, index and base/rm
    // fields. Emitted only when some bit is set, unless `w` forces it.
    fn rex(&mut self, w: bool, r: bool, x: bool, b: bool) {
        let mut rex = 0x40;
        if w {
            rex |= 0x08;
        }
        if r {
            rex |= 0x04;
        }
        if x {
            rex |= 0x02;
        }
        if b {
            rex |= 0x01;
        }
        if rex != 0x40 || w {
            self.byte(rex);
        }
    }

    fn modrm_rr(&mut self, reg: u8, rm: u8) {
        self.byte(0b1100_0000 | (reg << 3) | rm);
    }

    // ModRM + optional SIB + displacement for a memory operand.
    fn modrm_mem(&mut self, reg: u8, mem: Mem) {
        let base_low = mem.base.low3();
        let need_sib = mem.index.is_some() || base_low == 0b100;
        let rm = if need_sib { 0b100 } else { base_low };

        // rbp/r13 as base cannot take the no-displacement form
        let mut disp = [0u8; 4];
        let (modbits, disp_len) = if mem.disp == 0 && base_low != 0b101 {
            (0b00, 0)
        } else if let Ok(d8) = i8::try_from(mem.disp) {
            disp[0] = d8 as u8;
            (0b01, 1)
        } else {
            disp = mem.disp.to_le_bytes();
            (0b10, 4)
        };

        self.byte((modbits << 6) | (reg << 3) | rm);
        if need_sib {
            let index_low = mem.index.map(RegId::low3).unwrap_or(0b100);
            self.byte((index_low << 3) | base_low);
        }
        self.bytes(&disp[..disp_len]);
    }

    fn mem_rex(&mut self, w: bool, reg_ext: bool, mem: Mem) {
        let x = mem.index.map(RegId::ext).unwrap_or(false);
        self.rex(w, reg_ext, x, mem.base.ext());
    }

    // -- general-purpose instructions ------------------------------------

    /// `mov dst, imm` (64-bit destination).
    pub fn mov_ri(&mut self, dst: RegId, imm: i64) {
        if let Ok(imm32) = i32::try_from(imm) {
            self.rex(true, false, false, dst.ext());
            self.byte(0xC7);
            self.modrm_rr(0, dst.low3());
            self.bytes(&imm32.to_le_bytes());
        } else {
            self.rex(true, false, false, dst.ext());
            self.byte(0xB8 + dst.low3());
            self.bytes(&imm.to_le_bytes());
        }
    }

    /// `mov dst32, imm32` - zero-extends into the full register.
    pub fn mov_ri32(&mut self, dst: RegId, imm: u32) {
        self.rex(false, false, false, dst.ext());
        self.byte(0xB8 + dst.low3());
        self.bytes(&imm.to_le_bytes());
    }

    /// `mov dst, src` (64-bit).
    pub fn mov_rr(&mut self, dst: RegId, src: RegId) {
        self.rex(true, dst.ext(), false, src.ext());
        self.byte(0x8B);
        self.modrm_rr(dst.low3(), src.low3());
    }

    /// `add dst, src` (64-bit).
    pub fn add_rr(&mut self, dst: RegId, src: RegId) {
        self.rex(true, dst.ext(), false, src.ext());
        self.byte(0x03);
        self.modrm_rr(dst.low3(), src.low3());
    }

    /// `add dst, imm` (64-bit, sign-extended immediate).
    pub fn add_ri(&mut self, dst: RegId, imm: i32) {
        self.group1_ri(0, dst, imm);
    }

    /// `sub dst, src` (64-bit).
    pub fn sub_rr(&mut self, dst: RegId, src: RegId) {
        self.rex(true, dst.ext(), false, src.ext());
        self.byte(0x2B);
        self.modrm_rr(dst.low3(), src.low3());
    }

    /// `sub dst, imm` (64-bit, sign-extended immediate).
    pub fn sub_ri(&mut self, dst: RegId, imm: i32) {
        self.group1_ri(5, dst, imm);
    }

    /// `cmp a, b` (64-bit).
    pub fn cmp_rr(&mut self, a: RegId, b: RegId) {
        self.rex(true, a.ext(), false, b.ext());
        self.byte(0x3B);
        self.modrm_rr(a.low3(), b.low3());
    }

    /// `cmp a, imm` (64-bit, sign-extended immediate).
    pub fn cmp_ri(&mut self, a: RegId, imm: i32) {
        self.group1_ri(7, a, imm);
    }

    // add/sub/cmp share the group-1 immediate encodings
    fn group1_ri(&mut self, op_ext: u8, dst: RegId, imm: i32) {
        self.rex(true, false, false, dst.ext());
        if let Ok(imm8) = i8::try_from(imm) {
            self.byte(0x83);
            self.modrm_rr(op_ext, dst.low3());
            self.bytes(&imm8.to_le_bytes());
        } else {
            self.byte(0x81);
            self.modrm_rr(op_ext, dst.low3());
            self.bytes(&imm.to_le_bytes());
        }
    }

    /// `imul dst, src` (64-bit).
    pub fn imul_rr(&mut self, dst: RegId, src: RegId) {
        self.rex(true, dst.ext(), false, src.ext());
        self.bytes(&[0x0F, 0xAF]);
        self.modrm_rr(dst.low3(), src.low3());
    }

    /// `imul dst, src, imm` (64-bit three-operand form).
    pub fn imul_rri(&mut self, dst: RegId, src: RegId, imm: i32) {
        self.rex(true, dst.ext(), false, src.ext());
        if let Ok(imm8) = i8::try_from(imm) {
            self.byte(0x6B);
            self.modrm_rr(dst.low3(), src.low3());
            self.bytes(&imm8.to_le_bytes());
        } else {
            self.byte(0x69);
            self.modrm_rr(dst.low3(), src.low3());
            self.bytes(&imm.to_le_bytes());
        }
    }

    /// `push reg`.
    pub fn push(&mut self, reg: RegId) {
        self.rex(false, false, false, reg.ext());
        self.byte(0x50 + reg.low3());
    }

    /// `pop reg`.
    pub fn pop(&mut self, reg: RegId) {
        self.rex(false, false, false, reg.ext());
        self.byte(0x58 + reg.low3());
    }

    /// `ret`.
    pub fn ret(&mut self) {
        self.byte(0xC3);
    }

    /// `jl label` (signed less-than, 32-bit displacement).
    pub fn jl(&mut self, label: &str) {
        self.bytes(&[0x0F, 0x8C]);
        self.branch_disp(label);
    }

    /// `jmp label` (32-bit displacement).
    pub fn jmp(&mut self, label: &str) {
        self.byte(0xE9);
        self.branch_disp(label);
    }

    fn branch_disp(&mut self, label: &str) {
        let pos = self.buf.len();
        if let Some(&target) = self.labels.get(label) {
            let rel = (target as i64) - (pos as i64 + 4);
            // loop bodies are tiny; a backward branch always fits
            self.bytes(&(rel as i32).to_le_bytes());
        } else {
            self.bytes(&[0; 4]);
            self.fixups.push((pos, label.to_string()));
        }
    }

    // -- SSE instructions ------------------------------------------------

    fn sse_rr(&mut self, prefix: Option<u8>, opcode: &[u8], dst: XmmId, src: XmmId) {
        if let Some(p) = prefix {
            self.byte(p);
        }
        self.rex(false, dst.ext(), false, src.ext());
        self.bytes(opcode);
        self.modrm_rr(dst.low3(), src.low3());
    }

    /// `movss dst, [mem]` - scalar single load into the low lane.
    pub fn movss_load(&mut self, dst: XmmId, mem: Mem) {
        self.byte(0xF3);
        self.mem_rex(false, dst.ext(), mem);
        self.bytes(&[0x0F, 0x10]);
        self.modrm_mem(dst.low3(), mem);
    }

    /// `movd dst, src32` - move 32 bits from a GPR into the low lane.
    pub fn movd(&mut self, dst: XmmId, src: RegId) {
        self.byte(0x66);
        self.rex(false, dst.ext(), false, src.ext());
        self.bytes(&[0x0F, 0x6E]);
        self.modrm_rr(dst.low3(), src.low3());
    }

    /// `movaps dst, src`.
    pub fn movaps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x28], dst, src);
    }

    /// `movntps [mem], src` - non-temporal aligned store.
    pub fn movntps(&mut self, mem: Mem, src: XmmId) {
        self.mem_rex(false, src.ext(), mem);
        self.bytes(&[0x0F, 0x2B]);
        self.modrm_mem(src.low3(), mem);
    }

    /// `addps dst, src`.
    pub fn addps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x58], dst, src);
    }

    /// `subps dst, src`.
    pub fn subps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x5C], dst, src);
    }

    /// `mulps dst, src`.
    pub fn mulps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x59], dst, src);
    }

    /// `divps dst, src`.
    pub fn divps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x5E], dst, src);
    }

    /// `andps dst, src` - bitwise AND of the packed lanes.
    pub fn andps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x54], dst, src);
    }

    /// `andnps dst, src` - `!dst & src` per lane.
    pub fn andnps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x55], dst, src);
    }

    /// `orps dst, src`.
    pub fn orps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x56], dst, src);
    }

    /// `xorps dst, src`.
    pub fn xorps(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(None, &[0x0F, 0x57], dst, src);
    }

    /// `cmpps dst, src, pred` - packed compare yielding lane masks.
    pub fn cmpps(&mut self, dst: XmmId, src: XmmId, pred: CmpOp) {
        self.sse_rr(None, &[0x0F, 0xC2], dst, src);
        self.byte(pred as u8);
    }

    /// `shufps dst, src, sel` where the result lanes are
    /// `dst[a], dst[b], src[c], src[d]`.
    pub fn shufps(&mut self, dst: XmmId, src: XmmId, a: u8, b: u8, c: u8, d: u8) {
        debug_assert!(a < 4 && b < 4 && c < 4 && d < 4);
        self.sse_rr(None, &[0x0F, 0xC6], dst, src);
        self.byte(a | (b << 2) | (c << 4) | (d << 6));
    }

    /// `punpckldq dst, src` - interleave the low doublewords.
    pub fn punpckldq(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(Some(0x66), &[0x0F, 0x62], dst, src);
    }

    /// `punpcklqdq dst, src` - interleave the low quadwords.
    pub fn punpcklqdq(&mut self, dst: XmmId, src: XmmId) {
        self.sse_rr(Some(0x66), &[0x0F, 0x6C], dst, src);
    }

    /// `cvtsi2ss dst, src` - signed 64-bit integer to scalar single.
    pub fn cvtsi2ss(&mut self, dst: XmmId, src: RegId) {
        self.byte(0xF3);
        self.rex(true, dst.ext(), false, src.ext());
        self.bytes(&[0x0F, 0x2A]);
        self.modrm_rr(dst.low3(), src.low3());
    }
}
