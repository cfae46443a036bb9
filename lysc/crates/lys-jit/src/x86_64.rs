//! x86-64 instruction encoding.
//!
//! The one per-architecture module: raw machine bytes for the handful of
//! instructions the emitter needs, written left to right into a writable
//! code buffer. Only 64-bit integer operations, `rel32` control flow, and
//! `[base + disp]` addressing are encoded; that is the entire surface the
//! compiler uses.
//!
//! Register numbers follow the hardware encoding; `r8`–`r15` set the
//! relevant REX extension bits. Memory operands handle the two ModRM
//! irregularities (SIB for `rsp`-based addressing, mandatory displacement
//! for `rbp`).

use memmap2::MmapMut;

/// A hardware register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reg(pub u8);

pub const RAX: Reg = Reg(0);
pub const RCX: Reg = Reg(1);
pub const RDX: Reg = Reg(2);
pub const RSP: Reg = Reg(4);
pub const RBP: Reg = Reg(5);
pub const RDI: Reg = Reg(7);
pub const R8: Reg = Reg(8);
pub const R11: Reg = Reg(11);

impl Reg {
    #[inline]
    fn low(self) -> u8 {
        self.0 & 7
    }

    #[inline]
    fn ext(self) -> bool {
        self.0 >= 8
    }
}

/// Condition codes used by `jcc`/`setcc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    E,
    Ne,
    L,
    Ge,
}

impl Cond {
    #[inline]
    fn code(self) -> u8 {
        match self {
            Cond::E => 0x4,
            Cond::Ne => 0x5,
            Cond::L => 0xc,
            Cond::Ge => 0xd,
        }
    }

    /// The condition that jumps when `self` does not hold.
    pub fn negate(self) -> Cond {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
        }
    }
}

/// A writable code buffer over an anonymous mapping, filled left to right.
pub struct CodeBuf {
    map: MmapMut,
    len: usize,
}

impl CodeBuf {
    pub fn new(map: MmapMut) -> CodeBuf {
        CodeBuf { map, len: 0 }
    }

    #[inline]
    pub fn pos(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn emit8(&mut self, b: u8) {
        assert!(self.len < self.map.len(), "code buffer overflow");
        self.map[self.len] = b;
        self.len += 1;
    }

    pub fn emit(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.emit8(b);
        }
    }

    pub fn emit32(&mut self, v: i32) {
        self.emit(&v.to_le_bytes());
    }

    pub fn emit64(&mut self, v: u64) {
        self.emit(&v.to_le_bytes());
    }

    /// Overwrite a previously emitted 32-bit field.
    pub fn patch32(&mut self, at: usize, v: i32) {
        self.map[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Read back a 32-bit field.
    pub fn read32(&self, at: usize) -> i32 {
        i32::from_le_bytes(self.map[at..at + 4].try_into().unwrap())
    }

    /// Slide everything after `start + gap` left by `gap` bytes, shrinking
    /// the buffer. Used to drop the unused stack-reservation instruction.
    pub fn close_gap(&mut self, start: usize, gap: usize) {
        self.map.copy_within(start + gap..self.len, start);
        self.len -= gap;
    }

    /// Emitted bytes so far.
    pub fn bytes(&self) -> &[u8] {
        &self.map[..self.len]
    }

    /// Hand the filled mapping back for the protection flip.
    pub fn into_parts(self) -> (MmapMut, usize) {
        (self.map, self.len)
    }
}

#[inline]
fn rex(reg: Reg, rm: Reg) -> u8 {
    0x48 | ((reg.ext() as u8) << 2) | (rm.ext() as u8)
}

#[inline]
fn modrm(mode: u8, reg: Reg, rm: Reg) -> u8 {
    (mode << 6) | (reg.low() << 3) | rm.low()
}

/// ModRM + optional SIB + displacement for `[base + disp]`.
fn mem_operand(buf: &mut CodeBuf, reg: Reg, base: Reg, disp: i32) {
    // rbp (and r13) cannot be encoded with mod 00, and rsp (and r12) need
    // a SIB byte; always emitting a displacement sidesteps the first.
    let (mode, small) = if (-128..=127).contains(&disp) {
        (0b01, true)
    } else {
        (0b10, false)
    };
    buf.emit8(modrm(mode, reg, base));
    if base.low() == RSP.low() {
        buf.emit8(0x24); // SIB: scale 1, no index, base = rsp/r12
    }
    if small {
        buf.emit8(disp as i8 as u8);
    } else {
        buf.emit32(disp);
    }
}

// === Moves ===

/// `mov dst, src`
pub fn mov_rr(buf: &mut CodeBuf, dst: Reg, src: Reg) {
    buf.emit8(rex(src, dst));
    buf.emit8(0x89);
    buf.emit8(modrm(0b11, src, dst));
}

/// `mov dst, imm` — 7 bytes via sign-extended imm32 when it fits, else a
/// 10-byte movabs.
pub fn mov_ri(buf: &mut CodeBuf, dst: Reg, imm: i64) {
    if i32::try_from(imm).is_ok() {
        buf.emit8(rex(Reg(0), dst));
        buf.emit8(0xc7);
        buf.emit8(modrm(0b11, Reg(0), dst));
        buf.emit32(imm as i32);
    } else {
        buf.emit8(rex(Reg(0), dst));
        buf.emit8(0xb8 + dst.low());
        buf.emit64(imm as u64);
    }
}

/// `mov dst, [base + disp]`
pub fn mov_rm(buf: &mut CodeBuf, dst: Reg, base: Reg, disp: i32) {
    buf.emit8(rex(dst, base));
    buf.emit8(0x8b);
    mem_operand(buf, dst, base, disp);
}

/// `mov [base + disp], src`
pub fn mov_mr(buf: &mut CodeBuf, base: Reg, disp: i32, src: Reg) {
    buf.emit8(rex(src, base));
    buf.emit8(0x89);
    mem_operand(buf, src, base, disp);
}

/// `lea dst, [base + disp]`
pub fn lea(buf: &mut CodeBuf, dst: Reg, base: Reg, disp: i32) {
    buf.emit8(rex(dst, base));
    buf.emit8(0x8d);
    mem_operand(buf, dst, base, disp);
}

// === Arithmetic ===

fn arith_rr(buf: &mut CodeBuf, opcode: u8, dst: Reg, src: Reg) {
    buf.emit8(rex(src, dst));
    buf.emit8(opcode);
    buf.emit8(modrm(0b11, src, dst));
}

fn arith_rm(buf: &mut CodeBuf, opcode: u8, dst: Reg, base: Reg, disp: i32) {
    buf.emit8(rex(dst, base));
    buf.emit8(opcode);
    mem_operand(buf, dst, base, disp);
}

fn arith_ri(buf: &mut CodeBuf, group: u8, dst: Reg, imm: i32) {
    buf.emit8(rex(Reg(0), dst));
    if (-128..=127).contains(&imm) {
        buf.emit8(0x83);
        buf.emit8(modrm(0b11, Reg(group), dst));
        buf.emit8(imm as i8 as u8);
    } else {
        buf.emit8(0x81);
        buf.emit8(modrm(0b11, Reg(group), dst));
        buf.emit32(imm);
    }
}

pub fn add_rr(buf: &mut CodeBuf, dst: Reg, src: Reg) {
    arith_rr(buf, 0x01, dst, src);
}

pub fn add_rm(buf: &mut CodeBuf, dst: Reg, base: Reg, disp: i32) {
    arith_rm(buf, 0x03, dst, base, disp);
}

pub fn add_ri(buf: &mut CodeBuf, dst: Reg, imm: i32) {
    arith_ri(buf, 0, dst, imm);
}

pub fn sub_rr(buf: &mut CodeBuf, dst: Reg, src: Reg) {
    arith_rr(buf, 0x29, dst, src);
}

pub fn sub_rm(buf: &mut CodeBuf, dst: Reg, base: Reg, disp: i32) {
    arith_rm(buf, 0x2b, dst, base, disp);
}

pub fn sub_ri(buf: &mut CodeBuf, dst: Reg, imm: i32) {
    arith_ri(buf, 5, dst, imm);
}

pub fn cmp_rr(buf: &mut CodeBuf, dst: Reg, src: Reg) {
    arith_rr(buf, 0x39, dst, src);
}

pub fn cmp_rm(buf: &mut CodeBuf, dst: Reg, base: Reg, disp: i32) {
    arith_rm(buf, 0x3b, dst, base, disp);
}

pub fn cmp_ri(buf: &mut CodeBuf, dst: Reg, imm: i32) {
    arith_ri(buf, 7, dst, imm);
}

/// `neg dst`
pub fn neg(buf: &mut CodeBuf, dst: Reg) {
    buf.emit8(rex(Reg(0), dst));
    buf.emit8(0xf7);
    buf.emit8(modrm(0b11, Reg(3), dst));
}

/// `shl dst, imm8`
pub fn shl_ri(buf: &mut CodeBuf, dst: Reg, imm: u8) {
    buf.emit8(rex(Reg(0), dst));
    buf.emit8(0xc1);
    buf.emit8(modrm(0b11, Reg(4), dst));
    buf.emit8(imm);
}

/// `or dst, imm8` (sign-extended)
pub fn or_ri8(buf: &mut CodeBuf, dst: Reg, imm: i8) {
    buf.emit8(rex(Reg(0), dst));
    buf.emit8(0x83);
    buf.emit8(modrm(0b11, Reg(1), dst));
    buf.emit8(imm as u8);
}

/// `setcc dst8` — writes the low byte of `dst`.
pub fn setcc(buf: &mut CodeBuf, cond: Cond, dst: Reg) {
    if dst.ext() {
        buf.emit8(0x41);
    }
    buf.emit8(0x0f);
    buf.emit8(0x90 | cond.code());
    buf.emit8(modrm(0b11, Reg(0), dst));
}

/// `movzx dst, dst8` — zero-extend the low byte over the full register.
pub fn movzx_r8(buf: &mut CodeBuf, dst: Reg, src: Reg) {
    buf.emit8(rex(dst, src));
    buf.emit8(0x0f);
    buf.emit8(0xb6);
    buf.emit8(modrm(0b11, dst, src));
}

// === Stack ===

pub fn push(buf: &mut CodeBuf, r: Reg) {
    if r.ext() {
        buf.emit8(0x41);
    }
    buf.emit8(0x50 + r.low());
}

pub fn pop(buf: &mut CodeBuf, r: Reg) {
    if r.ext() {
        buf.emit8(0x41);
    }
    buf.emit8(0x58 + r.low());
}

/// The patchable 7-byte `sub rsp, imm32` used by the prologue.
pub const SUB_RSP_IMM32_LEN: usize = 7;

/// `sub rsp, imm32` in the fixed long form; returns the offset of the
/// imm32 field so it can be patched once the frame size is known.
pub fn sub_rsp_imm32(buf: &mut CodeBuf, imm: i32) -> usize {
    buf.emit(&[0x48, 0x81, 0xec]);
    let at = buf.pos();
    buf.emit32(imm);
    at
}

/// `sub rsp, 8` — alignment pad around calls.
pub fn sub_rsp_8(buf: &mut CodeBuf) {
    buf.emit(&[0x48, 0x83, 0xec, 0x08]);
}

/// `add rsp, 8`
pub fn add_rsp_8(buf: &mut CodeBuf) {
    buf.emit(&[0x48, 0x83, 0xc4, 0x08]);
}

// === Control flow ===

/// `jmp rel32` with a placeholder; returns the offset of the rel32 field.
pub fn jmp_rel32(buf: &mut CodeBuf) -> usize {
    buf.emit8(0xe9);
    let at = buf.pos();
    buf.emit32(0);
    at
}

/// `jcc rel32` with a placeholder; returns the offset of the rel32 field.
pub fn jcc_rel32(buf: &mut CodeBuf, cond: Cond) -> usize {
    buf.emit8(0x0f);
    buf.emit8(0x80 | cond.code());
    let at = buf.pos();
    buf.emit32(0);
    at
}

/// `call rel32` with a placeholder; returns the offset of the rel32 field.
pub fn call_rel32(buf: &mut CodeBuf) -> usize {
    buf.emit8(0xe8);
    let at = buf.pos();
    buf.emit32(0);
    at
}

/// Point a previously emitted rel32 field at `target` (a buffer offset).
pub fn patch_rel32(buf: &mut CodeBuf, field: usize, target: usize) {
    let rel = target as i64 - (field as i64 + 4);
    buf.patch32(field, i32::try_from(rel).expect("rel32 out of range"));
}

/// `call r` (indirect through a register).
pub fn call_r(buf: &mut CodeBuf, r: Reg) {
    if r.ext() {
        buf.emit8(0x41);
    }
    buf.emit8(0xff);
    buf.emit8(modrm(0b11, Reg(2), r));
}

/// `ret`
pub fn ret(buf: &mut CodeBuf) {
    buf.emit8(0xc3);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf() -> CodeBuf {
        CodeBuf::new(MmapMut::map_anon(4096).unwrap())
    }

    #[test]
    fn test_mov_rr() {
        let mut b = buf();
        mov_rr(&mut b, RBP, RSP);
        assert_eq!(b.bytes(), &[0x48, 0x89, 0xe5]);
    }

    #[test]
    fn test_mov_ri_small_and_large() {
        let mut b = buf();
        mov_ri(&mut b, RAX, 42);
        assert_eq!(b.bytes(), &[0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00]);

        let mut b = buf();
        mov_ri(&mut b, RAX, 0x1122334455667788);
        assert_eq!(
            b.bytes(),
            &[0x48, 0xb8, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]
        );
    }

    #[test]
    fn test_mov_ri_negative_uses_sign_extension() {
        let mut b = buf();
        mov_ri(&mut b, RCX, -4);
        assert_eq!(b.bytes(), &[0x48, 0xc7, 0xc1, 0xfc, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_mov_rm_args_slot() {
        // mov rax, [rdi + 8]
        let mut b = buf();
        mov_rm(&mut b, RAX, RDI, 8);
        assert_eq!(b.bytes(), &[0x48, 0x8b, 0x47, 0x08]);
    }

    #[test]
    fn test_mov_mr_rbp_slot() {
        // mov [rbp - 8], rax
        let mut b = buf();
        mov_mr(&mut b, RBP, -8, RAX);
        assert_eq!(b.bytes(), &[0x48, 0x89, 0x45, 0xf8]);
    }

    #[test]
    fn test_extended_register_rex() {
        // mov r8, rax
        let mut b = buf();
        mov_rr(&mut b, R8, RAX);
        assert_eq!(b.bytes(), &[0x49, 0x89, 0xc0]);

        // add rax, r8
        let mut b = buf();
        add_rr(&mut b, RAX, R8);
        assert_eq!(b.bytes(), &[0x4c, 0x01, 0xc0]);
    }

    #[test]
    fn test_add_variants() {
        let mut b = buf();
        add_rr(&mut b, RAX, RCX);
        assert_eq!(b.bytes(), &[0x48, 0x01, 0xc8]);

        let mut b = buf();
        add_ri(&mut b, RAX, 4);
        assert_eq!(b.bytes(), &[0x48, 0x83, 0xc0, 0x04]);

        let mut b = buf();
        add_ri(&mut b, RAX, 0x1000);
        assert_eq!(b.bytes(), &[0x48, 0x81, 0xc0, 0x00, 0x10, 0x00, 0x00]);

        let mut b = buf();
        add_rm(&mut b, RDX, RDI, 16);
        assert_eq!(b.bytes(), &[0x48, 0x03, 0x57, 0x10]);
    }

    #[test]
    fn test_sub_and_neg() {
        let mut b = buf();
        sub_rr(&mut b, RAX, RDX);
        assert_eq!(b.bytes(), &[0x48, 0x29, 0xd0]);

        let mut b = buf();
        neg(&mut b, RAX);
        assert_eq!(b.bytes(), &[0x48, 0xf7, 0xd8]);
    }

    #[test]
    fn test_cmp_variants() {
        let mut b = buf();
        cmp_rr(&mut b, RAX, RCX);
        assert_eq!(b.bytes(), &[0x48, 0x39, 0xc8]);

        let mut b = buf();
        cmp_ri(&mut b, RAX, 7);
        assert_eq!(b.bytes(), &[0x48, 0x83, 0xf8, 0x07]);
    }

    #[test]
    fn test_boolean_materialization_sequence() {
        // setl al; movzx rax, al; shl rax, 3; or rax, 7
        let mut b = buf();
        setcc(&mut b, Cond::L, RAX);
        movzx_r8(&mut b, RAX, RAX);
        shl_ri(&mut b, RAX, 3);
        or_ri8(&mut b, RAX, 7);
        assert_eq!(
            b.bytes(),
            &[
                0x0f, 0x9c, 0xc0, // setl al
                0x48, 0x0f, 0xb6, 0xc0, // movzx rax, al
                0x48, 0xc1, 0xe0, 0x03, // shl rax, 3
                0x48, 0x83, 0xc8, 0x07, // or rax, 7
            ]
        );
    }

    #[test]
    fn test_push_pop() {
        let mut b = buf();
        push(&mut b, RBP);
        push(&mut b, R8);
        pop(&mut b, R8);
        pop(&mut b, RBP);
        assert_eq!(b.bytes(), &[0x55, 0x41, 0x50, 0x41, 0x58, 0x5d]);
    }

    #[test]
    fn test_sub_rsp_imm32_is_patchable() {
        let mut b = buf();
        let start = b.pos();
        let field = sub_rsp_imm32(&mut b, 0);
        assert_eq!(b.pos() - start, SUB_RSP_IMM32_LEN);
        b.patch32(field, 16);
        assert_eq!(b.bytes(), &[0x48, 0x81, 0xec, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_rel32_patching() {
        let mut b = buf();
        let field = jmp_rel32(&mut b);
        ret(&mut b);
        let target = b.pos();
        patch_rel32(&mut b, field, target);
        // rel = target - (field + 4) = 6 - 5 = 1
        assert_eq!(b.bytes(), &[0xe9, 0x01, 0x00, 0x00, 0x00, 0xc3]);
    }

    #[test]
    fn test_backward_call_rel32() {
        let mut b = buf();
        ret(&mut b); // offset 0
        let field = call_rel32(&mut b);
        patch_rel32(&mut b, field, 0);
        // rel = 0 - (1 + 4) = -5
        assert_eq!(b.bytes(), &[0xc3, 0xe8, 0xfb, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_call_indirect() {
        let mut b = buf();
        call_r(&mut b, R11);
        assert_eq!(b.bytes(), &[0x41, 0xff, 0xd3]);
    }

    #[test]
    fn test_lea_frame_slot() {
        // lea rdi, [rbp - 16]
        let mut b = buf();
        lea(&mut b, RDI, RBP, -16);
        assert_eq!(b.bytes(), &[0x48, 0x8d, 0x7d, 0xf0]);
    }

    #[test]
    fn test_close_gap_drops_prefix_instruction() {
        let mut b = buf();
        push(&mut b, RBP); // 1 byte, keep
        sub_rsp_imm32(&mut b, 0); // 7 bytes, drop
        ret(&mut b); // keep
        b.close_gap(1, SUB_RSP_IMM32_LEN);
        assert_eq!(b.bytes(), &[0x55, 0xc3]);
    }

    #[test]
    fn test_mem_operand_large_disp() {
        // mov rax, [rdi + 0x1000] needs a 32-bit displacement
        let mut b = buf();
        mov_rm(&mut b, RAX, RDI, 0x1000);
        assert_eq!(b.bytes(), &[0x48, 0x8b, 0x87, 0x00, 0x10, 0x00, 0x00]);
    }
}
