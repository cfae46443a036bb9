//! Code emission.
//!
//! Walks a bite tree left to right, filling a writable code buffer. Four
//! temp registers form the free list, with R0 (`rax`) doubling as the
//! return register; binary nodes compile the child with the higher
//! register count first, and when neither child fits in the free set the
//! right child's result spills into a frame slot below `rbp`.
//!
//! Frame shape and conventions:
//!
//! - The single incoming argument register (`rdi`) points at the evaluated
//!   argument vector; formal *i* is a load at offset `i * 8`.
//! - The prologue emits a placeholder `sub rsp, imm32` that is patched to
//!   the spill high-water mark after emission (rounded to keep 16-byte
//!   alignment); when no slot was ever needed the instruction is removed
//!   by sliding the body left, and the `rel32` fields of calls back to the
//!   function start are re-aimed.
//! - `if` over an `eq`/`less` condition consumes the comparison flags with
//!   a conditional jump and never materializes `t`/`nil`.
//! - Tail self-calls overwrite the argument vector in place and jump back
//!   to the prologue end; non-tail self-calls lay the callee's arguments
//!   out in frame slots, point `rdi` at them, and `call` the function
//!   start. Cross-function calls go through a materialized entry address.
//!   Around any call, live scratch registers and `rdi` are saved with
//!   push/pop, with an 8-byte pad when the push count is odd so the stack
//!   stays 16-byte aligned at the call instruction.

use memmap2::MmapMut;

use lys_heap::value::NIL;

use crate::bite::{const_fits_imm32, Bite, BiteOp};
use crate::error::Result;
use crate::x86_64::{self as asm, CodeBuf, Cond, Reg, R11, R8, RAX, RBP, RCX, RDI, RDX, RSP};

/// The scratch register pool; R0 (`rax`) carries the return value.
pub const TEMP_REGS: [Reg; 4] = [RAX, RCX, RDX, R8];

/// The argument-vector register of the calling convention.
pub const ARGS_REG: Reg = RDI;

/// Upper bound on the emitted size of a tree, used to size the buffer.
pub fn size_bound(bite: &Bite) -> usize {
    bite.node_count() * 96 + 128
}

/// Emit `bite` as a complete function into `map`. Returns the filled map
/// and the emitted length, ready for the protection flip.
pub fn emit_function(map: MmapMut, bite: &Bite, write_char_fn: usize) -> Result<(MmapMut, usize)> {
    let mut e = Emitter {
        buf: CodeBuf::new(map),
        free: vec![R8, RDX, RCX, RAX],
        spill_depth: 0,
        max_spill: 0,
        prologue_end: 0,
        sub_field: 0,
        start_call_fields: Vec::new(),
        write_char_fn,
    };

    asm::push(&mut e.buf, RBP);
    asm::mov_rr(&mut e.buf, RBP, RSP);
    let sub_start = e.buf.pos();
    e.sub_field = asm::sub_rsp_imm32(&mut e.buf, 0);
    e.prologue_end = e.buf.pos();

    let result = e.emit_bite(bite)?;
    if result != RAX {
        asm::mov_rr(&mut e.buf, RAX, result);
    }
    asm::mov_rr(&mut e.buf, RSP, RBP);
    asm::pop(&mut e.buf, RBP);
    asm::ret(&mut e.buf);

    if e.max_spill == 0 {
        // No frame slots: drop the reservation and re-aim the rel32 fields
        // of calls that target the function start. Jumps to the prologue
        // end shift together with their sites and need no fix.
        e.buf.close_gap(sub_start, asm::SUB_RSP_IMM32_LEN);
        for field in &e.start_call_fields {
            let field = field - asm::SUB_RSP_IMM32_LEN;
            let rel = e.buf.read32(field);
            e.buf.patch32(field, rel + asm::SUB_RSP_IMM32_LEN as i32);
        }
    } else {
        // Keep rsp 16-byte aligned: round the slot count up to even.
        let slots = (e.max_spill + 1) & !1;
        e.buf.patch32(e.sub_field, (slots * 8) as i32);
    }

    Ok(e.buf.into_parts())
}

/// Where a right-hand operand ended up.
enum Rhs {
    Imm(i32),
    Param(i32),
    Reg(Reg),
    Spill(usize),
}

struct Emitter {
    buf: CodeBuf,
    /// Free scratch registers; the next allocation pops from the end.
    free: Vec<Reg>,
    spill_depth: usize,
    max_spill: usize,
    prologue_end: usize,
    sub_field: usize,
    /// rel32 fields of `call` instructions aimed at offset 0.
    start_call_fields: Vec<usize>,
    write_char_fn: usize,
}

impl Emitter {
    fn alloc_reg(&mut self) -> Reg {
        self.free.pop().expect("scratch register pool exhausted")
    }

    fn release(&mut self, r: Reg) {
        debug_assert!(!self.free.contains(&r));
        self.free.push(r);
    }

    fn in_use(&self) -> Vec<Reg> {
        TEMP_REGS
            .iter()
            .copied()
            .filter(|r| !self.free.contains(r))
            .collect()
    }

    fn alloc_slots(&mut self, n: usize) -> usize {
        self.spill_depth += n;
        self.max_spill = self.max_spill.max(self.spill_depth);
        self.spill_depth
    }

    fn release_slots(&mut self, n: usize) {
        debug_assert!(self.spill_depth >= n);
        self.spill_depth -= n;
    }

    fn slot_disp(slot: usize) -> i32 {
        -((slot * 8) as i32)
    }

    fn leaf_rhs(&self, b: &Bite) -> Option<Rhs> {
        match b.op {
            BiteOp::Const(c) if const_fits_imm32(c) => Some(Rhs::Imm((c as i64) as i32)),
            BiteOp::Param(i) => Some(Rhs::Param(i as i32 * 8)),
            _ => None,
        }
    }

    fn release_rhs(&mut self, rhs: Rhs) {
        match rhs {
            Rhs::Reg(r) => self.release(r),
            Rhs::Spill(_) => self.release_slots(1),
            Rhs::Imm(_) | Rhs::Param(_) => {}
        }
    }

    /// Emit both operands of a binary node: the left into a held register,
    /// the right wherever it is cheapest (immediate, ARGS slot, register,
    /// or a spill slot when the free set is exhausted).
    fn emit_operands(&mut self, lhs: &Bite, rhs: &Bite) -> Result<(Reg, Rhs)> {
        if let Some(r) = self.leaf_rhs(rhs) {
            let l = self.emit_bite(lhs)?;
            return Ok((l, r));
        }

        let avail = self.free.len() as u32;
        if lhs.regs.min(rhs.regs) < avail {
            // Both children fit; the needier one goes first.
            if lhs.regs >= rhs.regs {
                let l = self.emit_bite(lhs)?;
                let r = self.emit_bite(rhs)?;
                Ok((l, Rhs::Reg(r)))
            } else {
                let r = self.emit_bite(rhs)?;
                let l = self.emit_bite(lhs)?;
                Ok((l, Rhs::Reg(r)))
            }
        } else {
            // Spill the right child's result and compute the left in place.
            let r = self.emit_bite(rhs)?;
            let slot = self.alloc_slots(1);
            asm::mov_mr(&mut self.buf, RBP, Self::slot_disp(slot), r);
            self.release(r);
            let l = self.emit_bite(lhs)?;
            Ok((l, Rhs::Spill(slot)))
        }
    }

    fn emit_bite(&mut self, b: &Bite) -> Result<Reg> {
        match &b.op {
            BiteOp::Const(c) => {
                let r = self.alloc_reg();
                asm::mov_ri(&mut self.buf, r, *c as i64);
                Ok(r)
            }
            BiteOp::Param(i) => {
                let r = self.alloc_reg();
                asm::mov_rm(&mut self.buf, r, ARGS_REG, *i as i32 * 8);
                Ok(r)
            }
            BiteOp::Add => self.emit_arith(false, b),
            BiteOp::Sub => self.emit_arith(true, b),
            BiteOp::Neg => {
                let r = self.emit_bite(b.lhs.as_ref().unwrap())?;
                asm::neg(&mut self.buf, r);
                Ok(r)
            }
            BiteOp::Less => self.emit_comparison(Cond::L, b),
            BiteOp::Eq => self.emit_comparison(Cond::E, b),
            BiteOp::Load(disp) => {
                let r = self.emit_bite(b.lhs.as_ref().unwrap())?;
                asm::mov_rm(&mut self.buf, r, r, *disp);
                Ok(r)
            }
            BiteOp::If => self.emit_if(b),
            BiteOp::Progn => {
                let r = self.emit_bite(b.lhs.as_ref().unwrap())?;
                self.release(r);
                self.emit_bite(b.rhs.as_ref().unwrap())
            }
            BiteOp::WriteChar => self.emit_write_char(b),
            BiteOp::Recurse { argc, tail } => self.emit_recurse(b, *argc, *tail),
            BiteOp::Call { entry, argc } => self.emit_cross_call(b, *entry, *argc),
            BiteOp::Branch | BiteOp::Arg => {
                unreachable!("structural bite emitted outside its parent")
            }
        }
    }

    fn emit_arith(&mut self, subtract: bool, b: &Bite) -> Result<Reg> {
        let (l, rhs) = self.emit_operands(b.lhs.as_ref().unwrap(), b.rhs.as_ref().unwrap())?;
        match &rhs {
            Rhs::Imm(imm) => {
                if subtract {
                    asm::sub_ri(&mut self.buf, l, *imm);
                } else {
                    asm::add_ri(&mut self.buf, l, *imm);
                }
            }
            Rhs::Param(disp) => {
                if subtract {
                    asm::sub_rm(&mut self.buf, l, ARGS_REG, *disp);
                } else {
                    asm::add_rm(&mut self.buf, l, ARGS_REG, *disp);
                }
            }
            Rhs::Reg(r) => {
                if subtract {
                    asm::sub_rr(&mut self.buf, l, *r);
                } else {
                    asm::add_rr(&mut self.buf, l, *r);
                }
            }
            Rhs::Spill(slot) => {
                let disp = Self::slot_disp(*slot);
                if subtract {
                    asm::sub_rm(&mut self.buf, l, RBP, disp);
                } else {
                    asm::add_rm(&mut self.buf, l, RBP, disp);
                }
            }
        }
        self.release_rhs(rhs);
        Ok(l)
    }

    /// Emit a compare and leave the flags set; the left register stays
    /// held and is returned.
    fn emit_compare(&mut self, lhs: &Bite, rhs: &Bite) -> Result<Reg> {
        let (l, rhs) = self.emit_operands(lhs, rhs)?;
        match &rhs {
            Rhs::Imm(imm) => asm::cmp_ri(&mut self.buf, l, *imm),
            Rhs::Param(disp) => asm::cmp_rm(&mut self.buf, l, ARGS_REG, *disp),
            Rhs::Reg(r) => asm::cmp_rr(&mut self.buf, l, *r),
            Rhs::Spill(slot) => asm::cmp_rm(&mut self.buf, l, RBP, Self::slot_disp(*slot)),
        }
        self.release_rhs(rhs);
        Ok(l)
    }

    /// Materialize an `eq`/`<` result as `t` (15) or `nil` (7):
    /// `setcc; movzx; shl 3; or 7` in the operand register.
    fn emit_comparison(&mut self, cond: Cond, b: &Bite) -> Result<Reg> {
        let l = self.emit_compare(b.lhs.as_ref().unwrap(), b.rhs.as_ref().unwrap())?;
        asm::setcc(&mut self.buf, cond, l);
        asm::movzx_r8(&mut self.buf, l, l);
        asm::shl_ri(&mut self.buf, l, 3);
        asm::or_ri8(&mut self.buf, l, NIL.raw() as i8);
        Ok(l)
    }

    fn emit_if(&mut self, b: &Bite) -> Result<Reg> {
        let cond = b.lhs.as_ref().unwrap();
        let branch = b.rhs.as_ref().unwrap();
        let then_b = branch.lhs.as_ref().unwrap();
        let else_b = branch.rhs.as_ref().unwrap();

        // When the condition is itself a comparison, consume the flags
        // directly instead of materializing a boolean word.
        let jcc_field = match cond.op {
            BiteOp::Eq | BiteOp::Less => {
                let taken = if cond.op == BiteOp::Eq { Cond::E } else { Cond::L };
                let l = self.emit_compare(cond.lhs.as_ref().unwrap(), cond.rhs.as_ref().unwrap())?;
                self.release(l);
                asm::jcc_rel32(&mut self.buf, taken.negate())
            }
            _ => {
                let r = self.emit_bite(cond)?;
                asm::cmp_ri(&mut self.buf, r, NIL.raw() as i32);
                self.release(r);
                asm::jcc_rel32(&mut self.buf, Cond::E)
            }
        };

        // Both branches start from the same allocation state, so they
        // normally land their result in the same register; the mov covers
        // the uneven case.
        let free_snapshot = self.free.clone();
        let depth_snapshot = self.spill_depth;

        let rt = self.emit_bite(then_b)?;
        let jmp_field = asm::jmp_rel32(&mut self.buf);

        let else_pos = self.buf.pos();
        asm::patch_rel32(&mut self.buf, jcc_field, else_pos);
        self.free = free_snapshot.clone();
        self.spill_depth = depth_snapshot;

        let re = self.emit_bite(else_b)?;
        if re != rt {
            asm::mov_rr(&mut self.buf, rt, re);
        }

        let end = self.buf.pos();
        asm::patch_rel32(&mut self.buf, jmp_field, end);

        self.free = free_snapshot;
        self.free.retain(|r| *r != rt);
        self.spill_depth = depth_snapshot;
        Ok(rt)
    }

    /// Evaluate a call's arguments into `argc` reserved frame slots laid
    /// out ascending in memory. Returns the base slot index; the vector
    /// starts at `rbp - base * 8`.
    fn emit_args(&mut self, chain: Option<&Bite>, argc: usize) -> Result<usize> {
        let base = self.alloc_slots(argc);
        let mut link = chain;
        let mut j = 0usize;
        while let Some(arg) = link {
            debug_assert!(matches!(arg.op, BiteOp::Arg));
            let r = self.emit_bite(arg.lhs.as_ref().unwrap())?;
            asm::mov_mr(&mut self.buf, RBP, Self::slot_disp(base - j), r);
            self.release(r);
            j += 1;
            link = arg.rhs.as_deref();
        }
        debug_assert_eq!(j, argc);
        Ok(base)
    }

    /// Save live scratch registers plus `rdi`, keeping the stack 16-byte
    /// aligned at the upcoming call. Returns `(saved, padded)`.
    fn emit_caller_saves(&mut self, exclude: Option<Reg>) -> (Vec<Reg>, bool) {
        let live: Vec<Reg> = self
            .in_use()
            .into_iter()
            .filter(|r| Some(*r) != exclude)
            .collect();
        for r in &live {
            asm::push(&mut self.buf, *r);
        }
        asm::push(&mut self.buf, ARGS_REG);
        let padded = (live.len() + 1) % 2 == 1;
        if padded {
            asm::sub_rsp_8(&mut self.buf);
        }
        (live, padded)
    }

    fn emit_caller_restores(&mut self, saved: &[Reg], padded: bool) {
        if padded {
            asm::add_rsp_8(&mut self.buf);
        }
        asm::pop(&mut self.buf, ARGS_REG);
        for r in saved.iter().rev() {
            asm::pop(&mut self.buf, *r);
        }
    }

    fn emit_cross_call(&mut self, b: &Bite, entry: usize, argc: usize) -> Result<Reg> {
        let base = self.emit_args(b.lhs.as_deref(), argc)?;
        let (saved, padded) = self.emit_caller_saves(None);

        asm::lea(&mut self.buf, RDI, RBP, Self::slot_disp(base));
        asm::mov_ri(&mut self.buf, R11, entry as i64);
        asm::call_r(&mut self.buf, R11);

        let dest = self.alloc_reg();
        if dest != RAX {
            // Capture the result before the pops below restore rax.
            asm::mov_rr(&mut self.buf, dest, RAX);
        }
        self.emit_caller_restores(&saved, padded);
        self.release_slots(argc);
        Ok(dest)
    }

    fn emit_recurse(&mut self, b: &Bite, argc: usize, tail: bool) -> Result<Reg> {
        let base = self.emit_args(b.lhs.as_deref(), argc)?;

        if tail {
            // Overwrite the argument vector in place and re-enter at the
            // prologue end; the current frame is reused.
            for j in 0..argc {
                asm::mov_rm(&mut self.buf, R11, RBP, Self::slot_disp(base - j));
                asm::mov_mr(&mut self.buf, ARGS_REG, (j * 8) as i32, R11);
            }
            let field = asm::jmp_rel32(&mut self.buf);
            asm::patch_rel32(&mut self.buf, field, self.prologue_end);
            self.release_slots(argc);
            // Unreachable continuation; keep the register accounting
            // consistent for an enclosing if.
            return Ok(self.alloc_reg());
        }

        let (saved, padded) = self.emit_caller_saves(None);
        asm::lea(&mut self.buf, RDI, RBP, Self::slot_disp(base));
        let field = asm::call_rel32(&mut self.buf);
        asm::patch_rel32(&mut self.buf, field, 0);
        self.start_call_fields.push(field);

        let dest = self.alloc_reg();
        if dest != RAX {
            asm::mov_rr(&mut self.buf, dest, RAX);
        }
        self.emit_caller_restores(&saved, padded);
        self.release_slots(argc);
        Ok(dest)
    }

    fn emit_write_char(&mut self, b: &Bite) -> Result<Reg> {
        let r = self.emit_bite(b.lhs.as_ref().unwrap())?;
        let (saved, padded) = self.emit_caller_saves(Some(r));

        asm::mov_rr(&mut self.buf, RDI, r);
        asm::mov_ri(&mut self.buf, R11, self.write_char_fn as i64);
        asm::call_r(&mut self.buf, R11);

        if r != RAX {
            asm::mov_rr(&mut self.buf, r, RAX);
        }
        self.emit_caller_restores(&saved, padded);
        Ok(r)
    }
}
