//! The bite IR: a small expression tree between the resolved body and the
//! emitter.
//!
//! Each bite carries an opcode, up to two child bites, and a cached
//! "registers required" estimate (Sethi–Ullman). Calls chain their
//! arguments through `Arg` bites so the lowered tree keeps a uniform
//! binary shape. Lowering also decides, per self-call, whether the call is
//! in tail position: tail self-calls become an argument overwrite plus a
//! jump, everything else a real call.

use lys_eval::Machine;
use lys_heap::value::{Value, NIL, TRUE};
use lys_heap::{CompileState, NATIVE_CAR_DISP, NATIVE_CDR_DISP};

use crate::check::{classify_builtin, PrimKind};
use crate::error::{CompileError, Result};
use crate::resolve::formal_index;

/// One IR node.
#[derive(Debug, Clone, PartialEq)]
pub enum BiteOp {
    /// A literal tagged value word.
    Const(u64),
    /// Formal parameter by index (a load from the ARGS vector).
    Param(u16),
    Add,
    Sub,
    Neg,
    Less,
    Eq,
    /// Load a word at a fixed displacement from the child value (car/cdr).
    Load(i32),
    /// `lhs` is the condition, `rhs` a `Branch`.
    If,
    /// `lhs` then-branch, `rhs` else-branch.
    Branch,
    /// Argument chain link: `lhs` the value, `rhs` the next link.
    Arg,
    /// Self-call with `argc` arguments hanging off the `lhs` chain.
    Recurse { argc: usize, tail: bool },
    /// Call to another compiled function's fixed entry address.
    Call { entry: usize, argc: usize },
    /// Evaluate `lhs` for effect, continue with `rhs`.
    Progn,
    /// Write the child's payload byte through the runtime helper.
    WriteChar,
}

/// A node in the lowered expression tree.
#[derive(Debug, Clone)]
pub struct Bite {
    pub op: BiteOp,
    pub lhs: Option<Box<Bite>>,
    pub rhs: Option<Box<Bite>>,
    /// Registers needed to evaluate this subtree (filled by
    /// [`count_regs`]).
    pub regs: u32,
}

impl Bite {
    fn leaf(op: BiteOp) -> Bite {
        Bite {
            op,
            lhs: None,
            rhs: None,
            regs: 0,
        }
    }

    fn unary(op: BiteOp, child: Bite) -> Bite {
        Bite {
            op,
            lhs: Some(Box::new(child)),
            rhs: None,
            regs: 0,
        }
    }

    fn binary(op: BiteOp, lhs: Bite, rhs: Bite) -> Bite {
        Bite {
            op,
            lhs: Some(Box::new(lhs)),
            rhs: Some(Box::new(rhs)),
            regs: 0,
        }
    }

    /// Number of nodes, used to bound the emission buffer.
    pub fn node_count(&self) -> usize {
        1 + self.lhs.as_deref().map_or(0, Bite::node_count)
            + self.rhs.as_deref().map_or(0, Bite::node_count)
    }
}

/// Lower the resolved, checked body of `func` into a bite tree. The body
/// is in tail position.
pub fn lower(m: &Machine, func: Value) -> Result<Bite> {
    lower_expr(m, func, m.heap.func_body(func), true)
}

fn lower_expr(m: &Machine, func: Value, expr: Value, tail: bool) -> Result<Bite> {
    if expr.is_number() || expr == NIL || expr == TRUE {
        return Ok(Bite::leaf(BiteOp::Const(expr.raw())));
    }
    if expr.is_symbol() {
        let index = formal_index(m, func, expr).ok_or_else(|| CompileError::Unsupported {
            what: format!("free symbol '{}'", m.heap.symbol_name(expr)),
        })?;
        return Ok(Bite::leaf(BiteOp::Param(index as u16)));
    }
    if expr.is_cons() {
        return lower_call(m, func, expr, tail);
    }
    Err(CompileError::Unsupported {
        what: "value kind outside the compilable set".to_string(),
    })
}

fn lower_call(m: &Machine, func: Value, expr: Value, tail: bool) -> Result<Bite> {
    let head = m.heap.car(expr);
    let args = m.heap.cdr(expr);

    if head == func {
        let argc = m.heap.list_len(args).unwrap_or(0);
        let chain = lower_args(m, func, args)?;
        return Ok(Bite {
            op: BiteOp::Recurse { argc, tail },
            lhs: chain.map(Box::new),
            rhs: None,
            regs: 0,
        });
    }

    if head.is_lambda() && m.heap.func_state(head) == CompileState::Compiled {
        let argc = m.heap.list_len(args).unwrap_or(0);
        let entry = m.heap.func_body_raw(head);
        let chain = lower_args(m, func, args)?;
        return Ok(Bite {
            op: BiteOp::Call { entry, argc },
            lhs: chain.map(Box::new),
            rhs: None,
            regs: 0,
        });
    }

    let kind = if head.is_builtin() {
        classify_builtin(m.heap.builtin_fn(head))
    } else {
        None
    }
    .ok_or_else(|| CompileError::Unsupported {
        what: "callee outside the compilable set".to_string(),
    })?;

    match kind {
        PrimKind::Add => lower_fold(m, func, args, BiteOp::Add),
        PrimKind::Sub => {
            if m.heap.list_len(args) == Some(1) {
                let child = lower_expr(m, func, m.heap.car(args), false)?;
                Ok(Bite::unary(BiteOp::Neg, child))
            } else {
                lower_fold(m, func, args, BiteOp::Sub)
            }
        }
        PrimKind::Less => lower_binary(m, func, args, BiteOp::Less),
        PrimKind::Eq => lower_binary(m, func, args, BiteOp::Eq),
        PrimKind::Car => {
            let child = lower_expr(m, func, m.heap.car(args), false)?;
            Ok(Bite::unary(BiteOp::Load(NATIVE_CAR_DISP), child))
        }
        PrimKind::Cdr => {
            let child = lower_expr(m, func, m.heap.car(args), false)?;
            Ok(Bite::unary(BiteOp::Load(NATIVE_CDR_DISP), child))
        }
        PrimKind::If => {
            let cond = lower_expr(m, func, m.heap.car(args), false)?;
            let then_b = lower_expr(m, func, m.heap.car(m.heap.cdr(args)), tail)?;
            let else_b = lower_expr(m, func, m.heap.car(m.heap.cdr(m.heap.cdr(args))), tail)?;
            Ok(Bite::binary(
                BiteOp::If,
                cond,
                Bite::binary(BiteOp::Branch, then_b, else_b),
            ))
        }
        PrimKind::Progn => lower_progn(m, func, args, tail),
        PrimKind::WriteChar => {
            let child = lower_expr(m, func, m.heap.car(args), false)?;
            Ok(Bite::unary(BiteOp::WriteChar, child))
        }
    }
}

/// `(+ a b c)` lowers as `Add(Add(a, b), c)`; a single operand passes
/// through unchanged.
fn lower_fold(m: &Machine, func: Value, args: Value, op: BiteOp) -> Result<Bite> {
    let mut rest = args;
    let mut acc = lower_expr(m, func, m.heap.car(rest), false)?;
    rest = m.heap.cdr(rest);
    while rest.is_cons() {
        let next = lower_expr(m, func, m.heap.car(rest), false)?;
        acc = Bite::binary(op.clone(), acc, next);
        rest = m.heap.cdr(rest);
    }
    Ok(acc)
}

fn lower_binary(m: &Machine, func: Value, args: Value, op: BiteOp) -> Result<Bite> {
    let lhs = lower_expr(m, func, m.heap.car(args), false)?;
    let rhs = lower_expr(m, func, m.heap.car(m.heap.cdr(args)), false)?;
    Ok(Bite::binary(op, lhs, rhs))
}

/// `(progn a b c)` lowers right-associated so evaluation order is kept and
/// only the final form inherits tail position.
fn lower_progn(m: &Machine, func: Value, args: Value, tail: bool) -> Result<Bite> {
    if !args.is_cons() {
        return Ok(Bite::leaf(BiteOp::Const(NIL.raw())));
    }
    if !m.heap.cdr(args).is_cons() {
        return lower_expr(m, func, m.heap.car(args), tail);
    }
    let first = lower_expr(m, func, m.heap.car(args), false)?;
    let rest = lower_progn(m, func, m.heap.cdr(args), tail)?;
    Ok(Bite::binary(BiteOp::Progn, first, rest))
}

fn lower_args(m: &Machine, func: Value, args: Value) -> Result<Option<Bite>> {
    if !args.is_cons() {
        return Ok(None);
    }
    let value = lower_expr(m, func, m.heap.car(args), false)?;
    let next = lower_args(m, func, m.heap.cdr(args))?;
    Ok(Some(Bite {
        op: BiteOp::Arg,
        lhs: Some(Box::new(value)),
        rhs: next.map(Box::new),
        regs: 0,
    }))
}

// === Constant folding ===

/// Fold `+`/`-` chains whose operands are both literal numbers, bottom up
/// so folds cascade. Only number bites participate; constants like `nil`
/// never fold.
pub fn fold(bite: &mut Bite) {
    if let Some(lhs) = bite.lhs.as_mut() {
        fold(lhs);
    }
    if let Some(rhs) = bite.rhs.as_mut() {
        fold(rhs);
    }

    let folded = match (&bite.op, bite.lhs.as_deref(), bite.rhs.as_deref()) {
        (BiteOp::Add, Some(l), Some(r)) => fold_pair(l, r, u64::wrapping_add),
        (BiteOp::Sub, Some(l), Some(r)) => fold_pair(l, r, u64::wrapping_sub),
        (BiteOp::Neg, Some(l), None) => match l.op {
            BiteOp::Const(c) if Value::from_raw(c).is_number() => Some(0u64.wrapping_sub(c)),
            _ => None,
        },
        _ => None,
    };

    if let Some(word) = folded {
        bite.op = BiteOp::Const(word);
        bite.lhs = None;
        bite.rhs = None;
    }
}

fn fold_pair(l: &Bite, r: &Bite, op: fn(u64, u64) -> u64) -> Option<u64> {
    match (&l.op, &r.op) {
        (BiteOp::Const(a), BiteOp::Const(b))
            if Value::from_raw(*a).is_number() && Value::from_raw(*b).is_number() =>
        {
            // Tagged arithmetic: the shifted payloads add and subtract
            // directly, wrapping at 62 bits.
            Some(op(*a, *b))
        }
        _ => None,
    }
}

// === Register counting ===

/// Whether a constant can live as a sign-extended 32-bit immediate.
pub fn const_fits_imm32(word: u64) -> bool {
    i32::try_from(word as i64).is_ok()
}

/// Sethi–Ullman register need. Left children must materialize into a
/// register; right children may stay as immediates or ARGS-relative loads,
/// so leaves cost 0 on the right and 1 on the left (wide constants always
/// cost 1).
pub fn count_regs(bite: &mut Bite, is_left: bool) -> u32 {
    let regs = match &bite.op {
        BiteOp::Const(c) => {
            if !const_fits_imm32(*c) {
                1
            } else if is_left {
                1
            } else {
                0
            }
        }
        BiteOp::Param(_) => {
            if is_left {
                1
            } else {
                0
            }
        }
        BiteOp::Add | BiteOp::Sub | BiteOp::Less | BiteOp::Eq => {
            let l = count_regs(bite.lhs.as_mut().unwrap(), true);
            let r = count_regs(bite.rhs.as_mut().unwrap(), false);
            if l == r {
                l + 1
            } else {
                l.max(r)
            }
        }
        BiteOp::Neg | BiteOp::Load(_) | BiteOp::WriteChar => {
            count_regs(bite.lhs.as_mut().unwrap(), true).max(1)
        }
        BiteOp::If => {
            let c = count_regs(bite.lhs.as_mut().unwrap(), true);
            let branch = bite.rhs.as_mut().unwrap();
            let t = count_regs(branch.lhs.as_mut().unwrap(), true);
            let e = count_regs(branch.rhs.as_mut().unwrap(), true);
            branch.regs = t.max(e);
            c.max(t).max(e).max(1)
        }
        BiteOp::Branch => unreachable!("Branch is counted by its If"),
        BiteOp::Progn => {
            let l = count_regs(bite.lhs.as_mut().unwrap(), true);
            let r = count_regs(bite.rhs.as_mut().unwrap(), is_left);
            l.max(r).max(1)
        }
        BiteOp::Arg => unreachable!("Arg chains are counted by their call"),
        BiteOp::Recurse { .. } | BiteOp::Call { .. } => {
            let mut worst = 1;
            let mut link = bite.lhs.as_mut();
            while let Some(arg) = link {
                worst = worst.max(count_regs(arg.lhs.as_mut().unwrap(), true));
                arg.regs = worst;
                link = arg.rhs.as_mut();
            }
            worst
        }
    };
    bite.regs = regs;
    regs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: i64) -> Bite {
        Bite::leaf(BiteOp::Const(Value::number(n).raw()))
    }

    fn param(i: u16) -> Bite {
        Bite::leaf(BiteOp::Param(i))
    }

    #[test]
    fn test_fold_add_chain() {
        // Add(Add(1, 2), 3) folds to 6.
        let mut b = Bite::binary(BiteOp::Add, Bite::binary(BiteOp::Add, num(1), num(2)), num(3));
        fold(&mut b);
        assert_eq!(b.op, BiteOp::Const(Value::number(6).raw()));
    }

    #[test]
    fn test_fold_sub_and_neg() {
        let mut b = Bite::binary(BiteOp::Sub, num(10), num(4));
        fold(&mut b);
        assert_eq!(b.op, BiteOp::Const(Value::number(6).raw()));

        let mut b = Bite::unary(BiteOp::Neg, num(5));
        fold(&mut b);
        assert_eq!(b.op, BiteOp::Const(Value::number(-5).raw()));
    }

    #[test]
    fn test_fold_stops_at_params() {
        // Add(Param(0), 2) must not fold.
        let mut b = Bite::binary(BiteOp::Add, param(0), num(2));
        fold(&mut b);
        assert_eq!(b.op, BiteOp::Add);
    }

    #[test]
    fn test_fold_skips_non_number_constants() {
        let mut b = Bite::binary(
            BiteOp::Add,
            Bite::leaf(BiteOp::Const(NIL.raw())),
            num(2),
        );
        fold(&mut b);
        assert_eq!(b.op, BiteOp::Add, "nil is not a number and must not fold");
    }

    #[test]
    fn test_regs_leaf_costs() {
        let mut b = param(0);
        assert_eq!(count_regs(&mut b, true), 1);
        let mut b = param(0);
        assert_eq!(count_regs(&mut b, false), 0);

        // A constant beyond the imm32 range needs a register either way.
        let mut b = Bite::leaf(BiteOp::Const(Value::number(1 << 40).raw()));
        assert_eq!(count_regs(&mut b, false), 1);
    }

    #[test]
    fn test_regs_balanced_tree_grows() {
        // (p0 + p1) + (p2 + p3): both halves need 1, the root needs 2.
        let mut b = Bite::binary(
            BiteOp::Add,
            Bite::binary(BiteOp::Add, param(0), param(1)),
            Bite::binary(BiteOp::Add, param(2), param(3)),
        );
        assert_eq!(count_regs(&mut b, true), 2);
    }

    #[test]
    fn test_regs_right_leaning_chain_stays_flat() {
        // ((p0 + 1) + 2) + 3: immediates on the right keep it at 1.
        let mut b = Bite::binary(
            BiteOp::Add,
            Bite::binary(BiteOp::Add, Bite::binary(BiteOp::Add, param(0), num(1)), num(2)),
            num(3),
        );
        assert_eq!(count_regs(&mut b, true), 1);
    }
}
