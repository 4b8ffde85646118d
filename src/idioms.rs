//! Recognition of compiler-generated instruction idioms.
//!
//! The catalog is a list of [`Template`]s, each a fixed-length window of shape predicates over
//! raw instructions. Templates are grouped in families which run in order, each to a fixed point:
//! every pass scans the body left to right, and at each position the first template of the family
//! whose shape and semantic checks all pass replaces the window with a single pseudo-op node. A
//! pass always builds a fresh body.

use crate::analysis_config::CONFIG;
use crate::call_effects::Routine;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::isa::{Condition, Instruction, Mnemonic, Operand, Register, Width, ADDRESS_SPACE};
use crate::log::*;
use crate::provider::{InstructionProvider, MemoryUnavailable};
use crate::pseudo_ops::{BlobDirection, Node, PseudoOp, Resolution};

use std::collections::VecDeque;

/// Trap code raised by the runtime when the heap is exhausted; any other code on a checked
/// branch is a plain limit check.
pub const HEAP_EXHAUSTED_TRAP: i64 = 7;

type Matcher = fn(&[&Instruction], &dyn InstructionProvider) -> Option<PseudoOp>;

/// A fixed-length instruction shape
pub struct Template {
    pub name: &'static str,
    len: usize,
    matcher: Matcher,
}

impl Template {
    /// Try to match at the front of `pending`. On success, returns the number of nodes consumed
    /// along with the replacement.
    fn try_match(
        &self,
        pending: &VecDeque<Node>,
        provider: &dyn InstructionProvider,
    ) -> Option<(usize, PseudoOp)> {
        if pending.len() < self.len {
            return None;
        }
        let window = pending
            .iter()
            .take(self.len)
            .map(Node::as_raw)
            .collect::<Option<Vec<&Instruction>>>()?;
        (self.matcher)(&window, provider).map(|op| (self.len, op))
    }
}

macro_rules! template {
    ($name:expr, $len:expr, $matcher:expr) => {
        Template {
            name: $name,
            len: $len,
            matcher: $matcher,
        }
    };
}

/// Families in the order they run. Within a family longer or more specific shapes come first.
pub const FAMILIES: &[&[Template]] = &[
    &[
        template!("epilogue", 3, epilogue),
        template!("bailout", 2, bailout),
    ],
    &[
        template!("stack-check", 4, stack_check),
        template!("checked-branch", 3, checked_branch),
        template!("checked-step", 2, checked_step),
    ],
    &[
        template!("string-literal", 5, string_literal),
        template!("blob-push-literal", 4, blob_push_literal),
        template!("blob-push-register", 3, blob_push_register),
        template!("blob-pop", 3, blob_pop),
        template!("block-move", 3, block_move),
    ],
    &[
        template!("frame-ref-computed", 2, frame_ref_computed),
        template!("stack-ref-computed", 2, stack_ref_computed),
        template!("frame-ref", 1, frame_ref),
        template!("stack-ref", 1, stack_ref),
        template!("const-push", 1, const_push),
        template!("stack-adjust", 1, stack_adjust),
        template!("call", 1, call),
    ],
];

const PROLOGUES: &[Template] = &[
    template!("prologue-with-locals", 7, prologue_with_locals),
    template!("prologue", 6, prologue),
];

// Shape predicates

fn is_word(i: &Instruction) -> bool {
    i.width == Width::Word
}

/// `mov fp,-(sp)` followed by `mov sp,fp`: the start of every procedure
pub fn is_frame_setup(save: &Instruction, set: &Instruction) -> bool {
    is_word(save)
        && is_word(set)
        && save.mnemonic == Mnemonic::Mov
        && save.operands == [Operand::Reg(Register::FP), Operand::AutoDec(Register::SP)]
        && set.mnemonic == Mnemonic::Mov
        && set.operands == [Operand::Reg(Register::SP), Operand::Reg(Register::FP)]
}

/// A general register operand
fn general(op: &Operand) -> Option<Register> {
    match op {
        Operand::Reg(r) if r.is_general() => Some(*r),
        _ => None,
    }
}

fn immediate(op: &Operand) -> Option<i64> {
    match op {
        Operand::Immediate(v) => Some(*v),
        _ => None,
    }
}

fn target(op: &Operand) -> Option<u64> {
    match op {
        Operand::Target(t) => Some(*t),
        _ => None,
    }
}

/// `mov #v,rN` into a general register
fn load_immediate(i: &Instruction) -> Option<(i64, Register)> {
    match (&i.mnemonic, &i.operands[..]) {
        (Mnemonic::Mov, [src, dst]) if is_word(i) => Some((immediate(src)?, general(dst)?)),
        _ => None,
    }
}

/// `sob rC,L` returning its count register and loop target
fn sob(i: &Instruction) -> Option<(Register, u64)> {
    match (&i.mnemonic, &i.operands[..]) {
        (Mnemonic::Sob, [r, t]) => Some((general(r)?, target(t)?)),
        _ => None,
    }
}

/// `movX src,dst`, returning the width and both operands
fn mov(i: &Instruction) -> Option<(Width, &Operand, &Operand)> {
    match (&i.mnemonic, &i.operands[..]) {
        (Mnemonic::Mov, [src, dst]) => Some((i.width, src, dst)),
        _ => None,
    }
}

fn count(n: i64) -> Option<u64> {
    u64::try_from(n).ok().filter(|&n| n > 0)
}

/// Bytes moved by a loop running `n` times plus `extra` unrolled iterations, if that fits in the
/// address space
fn loop_bytes(n: i64, extra: u64, unit: Width) -> Option<u64> {
    count(n)?
        .checked_add(extra)?
        .checked_mul(unit.bytes())
        .filter(|&b| b <= ADDRESS_SPACE)
}

/// Does the instruction move the stack pointer, through auto-increment/decrement or by writing it
fn moves_sp(i: &Instruction) -> bool {
    let sp = Register::SP;
    i.destination() == Some(&Operand::Reg(sp))
        || i.operands
            .iter()
            .any(|op| matches!(op, Operand::AutoInc(r) | Operand::AutoDec(r) if *r == sp))
}

/// `cmp sp,X; bhi T; sev; trap` with `T` just past the trap
fn stack_check_shape(w: &[&Instruction]) -> Option<()> {
    let [cmp, bhi, sev, trap] = w else { return None };
    let ok = cmp.mnemonic == Mnemonic::Cmp
        && cmp.operands.first() == Some(&Operand::Reg(Register::SP))
        && bhi.mnemonic == Mnemonic::Bcc(Condition::Hi)
        && bhi.operands.first().and_then(target) == Some(trap.hi)
        && sev.mnemonic == Mnemonic::Sev
        && trap.mnemonic == Mnemonic::Trap;
    ok.then_some(())
}

// Templates

fn prologue_with_locals(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [save, set, alloc, check @ ..] = w else { return None };
    if !is_frame_setup(save, set) {
        return None;
    }
    let frame_size = match (&alloc.mnemonic, &alloc.operands[..]) {
        (Mnemonic::Sub, [Operand::Immediate(n), Operand::Reg(r)]) if *r == Register::SP => {
            u64::try_from(*n).ok()?
        }
        _ => return None,
    };
    stack_check_shape(check)?;
    Some(PseudoOp::Prologue { frame_size })
}

fn prologue(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [save, set, check @ ..] = w else { return None };
    if !is_frame_setup(save, set) {
        return None;
    }
    stack_check_shape(check)?;
    Some(PseudoOp::Prologue { frame_size: 0 })
}

/// `mov fp,sp; mov (sp)+,fp; rts pc`
fn epilogue(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [reset, restore, ret] = w else { return None };
    let ok = reset.mnemonic == Mnemonic::Mov
        && reset.operands == [Operand::Reg(Register::FP), Operand::Reg(Register::SP)]
        && restore.mnemonic == Mnemonic::Mov
        && restore.operands == [Operand::AutoInc(Register::SP), Operand::Reg(Register::FP)]
        && ret.mnemonic == Mnemonic::Rts
        && ret.operands == [Operand::Reg(Register::PC)];
    ok.then_some(PseudoOp::Epilogue)
}

/// `mov d(fp),sp; jmp X`
fn bailout(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [reload, jmp] = w else { return None };
    if jmp.mnemonic != Mnemonic::Jmp {
        return None;
    }
    match mov(reload)? {
        (Width::Word, Operand::Indexed(d, Register::FP), Operand::Reg(r)) if *r == Register::SP => {
            Some(PseudoOp::Bailout { slot: *d })
        }
        _ => None,
    }
}

fn stack_check(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    stack_check_shape(w)?;
    Some(PseudoOp::StackCheck)
}

/// `cmp X,Y; bcond T; trap #k` or `sub X,Y; bcond T; trap #k`, with `T` just past the trap and
/// the stack pointer left alone
fn checked_branch(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [test, branch, trap] = w else { return None };
    if !matches!(test.mnemonic, Mnemonic::Cmp | Mnemonic::Sub) || moves_sp(test) {
        return None;
    }
    if !matches!(branch.mnemonic, Mnemonic::Bcc(_))
        || branch.operands.first().and_then(target) != Some(trap.hi)
        || trap.mnemonic != Mnemonic::Trap
    {
        return None;
    }
    if trap.operands.first().and_then(immediate) == Some(HEAP_EXHAUSTED_TRAP) {
        Some(PseudoOp::MallocCheck)
    } else {
        Some(PseudoOp::LimitCheck)
    }
}

/// `inc X; chk X,B` or `dec X; chk X,B`
fn checked_step(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [step, chk] = w else { return None };
    if moves_sp(chk) {
        return None;
    }
    let x = match (&step.mnemonic, &step.operands[..]) {
        (Mnemonic::Inc | Mnemonic::Dec, [x]) if x.register() != Some(Register::SP) => x,
        _ => return None,
    };
    match (&chk.mnemonic, &chk.operands[..]) {
        (Mnemonic::Chk, [y, _]) if y == x => Some(PseudoOp::LimitCheck),
        _ => None,
    }
}

/// The loop `movX S,D; sob rC,L` with `L` at the move and `rC` loaded with `n` beforehand.
/// Returns `n`, the count register, the unit width and both move operands.
fn counted_loop<'a>(
    load: &Instruction,
    body: &'a Instruction,
    step: &Instruction,
) -> Option<(i64, Register, Width, &'a Operand, &'a Operand)> {
    let (n, rc) = load_immediate(load)?;
    let (unit, src, dst) = mov(body)?;
    let (rc2, l) = sob(step)?;
    if rc != rc2 || l != body.lo || body.mentions(rc) {
        return None;
    }
    Some((n, rc, unit, src, dst))
}

/// `mov #end,rA; mov #n,rC; movX -(rA),-(sp); sob rC,L; movX -(rA),-(sp)`
fn string_literal(w: &[&Instruction], provider: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [base, load, body, step, last] = w else { return None };
    let (end, ra) = load_immediate(base)?;
    let (n, rc, unit, src, dst) = counted_loop(load, body, step)?;
    if ra == rc
        || *src != Operand::AutoDec(ra)
        || *dst != Operand::AutoDec(Register::SP)
        || last.mnemonic != Mnemonic::Mov
        || last.width != unit
        || last.operands != body.operands
    {
        return None;
    }
    let width = loop_bytes(n, 1, unit)?;
    let source = u64::try_from(end).ok()?.checked_sub(width)?;
    let text = usize::try_from(width)
        .ok()
        .and_then(|len| provider.read_bytes(source, len).ok())
        .map(|b| b.iter().map(|&c| c as char).collect::<String>());
    Some(PseudoOp::StringLiteral {
        source,
        width,
        text: text.into(),
    })
}

/// `mov #src,rA; mov #n,rC; movX (rA)+,-(sp); sob rC,L`
fn blob_push_literal(w: &[&Instruction], provider: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [base, load, body, step] = w else { return None };
    let (addr, ra) = load_immediate(base)?;
    let (n, rc, unit, src, dst) = counted_loop(load, body, step)?;
    if *src != Operand::AutoInc(ra) || *dst != Operand::AutoDec(Register::SP) || rc == ra {
        return None;
    }
    let width = loop_bytes(n, 0, unit)?;
    let source = u64::try_from(addr).ok()?;
    let content: Resolution<Vec<u8>> = usize::try_from(width)
        .ok()
        .and_then(|len| provider.read_bytes(source, len).ok())
        .into();
    Some(PseudoOp::Blob {
        width,
        source: Some(source),
        direction: BlobDirection::Push,
        content,
    })
}

/// `mov #n,rC; movX (rA)+,-(sp); sob rC,L`
fn blob_push_register(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [load, body, step] = w else { return None };
    let (n, _, unit, src, dst) = counted_loop(load, body, step)?;
    match (src, dst) {
        (Operand::AutoInc(ra), Operand::AutoDec(s)) if ra.is_general() && *s == Register::SP => {
            Some(PseudoOp::Blob {
                width: loop_bytes(n, 0, unit)?,
                source: None,
                direction: BlobDirection::Push,
                content: Resolution::Unrecoverable,
            })
        }
        _ => None,
    }
}

/// `mov #n,rC; movX (sp)+,(rA)+; sob rC,L`
fn blob_pop(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [load, body, step] = w else { return None };
    let (n, _, unit, src, dst) = counted_loop(load, body, step)?;
    match (src, dst) {
        (Operand::AutoInc(s), Operand::AutoInc(ra)) if *s == Register::SP && ra.is_general() => {
            Some(PseudoOp::Blob {
                width: loop_bytes(n, 0, unit)?,
                source: None,
                direction: BlobDirection::Pop,
                content: Resolution::NotComputed,
            })
        }
        _ => None,
    }
}

/// `mov #n,rC; movX (rA)+,(rB)+; sob rC,L`
fn block_move(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [load, body, step] = w else { return None };
    let (n, _, unit, src, dst) = counted_loop(load, body, step)?;
    match (src, dst) {
        (Operand::AutoInc(ra), Operand::AutoInc(rb))
            if ra.is_general() && rb.is_general() && ra != rb =>
        {
            Some(PseudoOp::BlockMove {
                src: *ra,
                dst: *rb,
                count: loop_bytes(n, 0, unit)?,
            })
        }
        _ => None,
    }
}

/// `mov R,-(sp); add #d,(sp)`, the computed form of an address push
fn computed_ref(w: &[&Instruction], base: Register) -> Option<i64> {
    let [push, add] = w else { return None };
    if !is_word(push) || !is_word(add) {
        return None;
    }
    let d = match (&add.mnemonic, &add.operands[..]) {
        (Mnemonic::Add, [Operand::Immediate(d), Operand::Deferred(s)]) if *s == Register::SP => *d,
        _ => return None,
    };
    match mov(push)? {
        (_, Operand::Reg(r), Operand::AutoDec(s)) if *r == base && *s == Register::SP => Some(d),
        _ => None,
    }
}

/// `lea d(R),-(sp)`
fn lea_ref(w: &[&Instruction], base: Register) -> Option<i64> {
    let [lea] = w else { return None };
    match (&lea.mnemonic, &lea.operands[..]) {
        (Mnemonic::Lea, [Operand::Indexed(d, r), Operand::AutoDec(s)])
            if *r == base && *s == Register::SP =>
        {
            Some(*d)
        }
        _ => None,
    }
}

fn frame_ref_computed(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    computed_ref(w, Register::FP).map(|offset| PseudoOp::FramePointerRef { offset })
}

fn stack_ref_computed(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    computed_ref(w, Register::SP).map(|offset| PseudoOp::StackPointerRef { offset })
}

fn frame_ref(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    lea_ref(w, Register::FP).map(|offset| PseudoOp::FramePointerRef { offset })
}

fn stack_ref(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    lea_ref(w, Register::SP).map(|offset| PseudoOp::StackPointerRef { offset })
}

/// `movX #v,-(sp)` or `clrX -(sp)`
fn const_push(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [ins] = w else { return None };
    let value = match (&ins.mnemonic, &ins.operands[..]) {
        (Mnemonic::Mov, [Operand::Immediate(v), Operand::AutoDec(s)]) if *s == Register::SP => *v,
        (Mnemonic::Clr, [Operand::AutoDec(s)]) if *s == Register::SP => 0,
        _ => return None,
    };
    Some(PseudoOp::ConstPush {
        width: ins.width,
        value,
    })
}

/// `add #n,sp`, `sub #n,sp`, `tst (sp)+` or `cmp (sp)+,(sp)+`
fn stack_adjust(w: &[&Instruction], _: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [ins] = w else { return None };
    let sp = Register::SP;
    let unit = ins.width.bytes() as i64;
    let delta = match (&ins.mnemonic, &ins.operands[..]) {
        (Mnemonic::Add, [Operand::Immediate(n), Operand::Reg(s)]) if *s == sp => *n,
        (Mnemonic::Sub, [Operand::Immediate(n), Operand::Reg(s)]) if *s == sp => n.checked_neg()?,
        (Mnemonic::Tst, [Operand::AutoInc(s)]) if *s == sp => unit,
        (Mnemonic::Cmp, [Operand::AutoInc(a), Operand::AutoInc(b)]) if *a == sp && *b == sp => {
            2 * unit
        }
        _ => return None,
    };
    (delta.unsigned_abs() < ADDRESS_SPACE).then_some(PseudoOp::StackAdjust { delta })
}

/// `jsr pc,X`
fn call(w: &[&Instruction], provider: &dyn InstructionProvider) -> Option<PseudoOp> {
    let [ins] = w else { return None };
    match (&ins.mnemonic, &ins.operands[..]) {
        (Mnemonic::Jsr, [Operand::Reg(Register::PC), dest]) => {
            let destination: Resolution<u64> = dest.static_address().into();
            let routine = destination
                .known()
                .and_then(|&d| provider.runtime_routine(d))
                .and_then(Routine::from_name);
            let label = destination.known().and_then(|&d| {
                provider
                    .label_at(d)
                    .or_else(|| provider.runtime_routine(d))
                    .map(str::to_owned)
            });
            Some(PseudoOp::Call {
                destination,
                label,
                routine,
            })
        }
        _ => None,
    }
}

// Driving the catalog

/// One left-to-right pass of `family` over `body`. Returns the new body and whether anything was
/// rewritten.
fn rewrite_pass(
    body: Vec<Node>,
    family: &[Template],
    provider: &dyn InstructionProvider,
) -> (Vec<Node>, bool) {
    let mut pending: VecDeque<Node> = body.into();
    let mut out = Vec::with_capacity(pending.len());
    let mut changed = false;
    loop {
        match family.iter().find_map(|t| {
            t.try_match(&pending, provider)
                .map(|(len, op)| (t.name, len, op))
        }) {
            Some((name, len, op)) => {
                let insns: Vec<Instruction> = pending.drain(..len).flat_map(|n| n.insns).collect();
                trace!("Matched idiom"; "name" => name, "addr" => Addr(insns[0].lo));
                out.push(Node::wrap(op, insns));
                changed = true;
            }
            None => match pending.pop_front() {
                Some(n) => out.push(n),
                None => break,
            },
        }
    }
    (out, changed)
}

/// Run every family in order, each to a fixed point.
pub fn rewrite_all(mut body: Vec<Node>, provider: &dyn InstructionProvider) -> Vec<Node> {
    for family in FAMILIES {
        loop {
            let (next, changed) = rewrite_pass(body, family, provider);
            body = next;
            if !changed {
                break;
            }
        }
    }
    body
}

/// Replace the prologue at the start of `body`, if there is one.
pub fn match_prologue(
    mut body: Vec<Node>,
    provider: &dyn InstructionProvider,
) -> Result<Vec<Node>, Vec<Node>> {
    let mut pending: VecDeque<Node> = body.drain(..).collect();
    match PROLOGUES.iter().find_map(|t| t.try_match(&pending, provider)) {
        Some((len, op)) => {
            let insns: Vec<Instruction> = pending.drain(..len).flat_map(|n| n.insns).collect();
            let mut out = vec![Node::wrap(op, insns)];
            out.extend(pending);
            Ok(out)
        }
        None => Err(pending.into()),
    }
}

/// Collapse the register cache loads right after the prologue at `body[0]`, and, if enabled,
/// rewrite every later use of a cached register into the cached value.
///
/// A register qualifies if it is loaded with `mov #v,rN` or `lea @#a,rN` in the run directly
/// following the prologue, and that load is the only write to it in the whole body.
pub fn register_cache(body: Vec<Node>) -> Vec<Node> {
    let writes = |r: Register| -> usize {
        body.iter()
            .flat_map(|n| n.insns.iter())
            .map(|i| i.register_writes(r))
            .sum()
    };
    let mut cached: Vec<(Register, i64)> = vec![];
    for node in body.iter().skip(1) {
        let load = node.as_raw().and_then(|ins| match (&ins.mnemonic, &ins.operands[..]) {
            (Mnemonic::Mov, [Operand::Immediate(v), dst]) if is_word(ins) => {
                Some((general(dst)?, *v))
            }
            (Mnemonic::Lea, [Operand::Absolute(a), dst]) => {
                Some((general(dst)?, i64::try_from(*a).ok()?))
            }
            _ => None,
        });
        match load {
            Some((r, v)) if writes(r) == 1 && cached.iter().all(|(c, _)| *c != r) => {
                cached.push((r, v))
            }
            _ => break,
        }
    }
    if cached.is_empty() {
        return body;
    }

    let mut body = body.into_iter();
    let mut out: Vec<Node> = body.by_ref().take(1).collect();
    let loads: Vec<Instruction> = body
        .by_ref()
        .take(cached.len())
        .flat_map(|n| n.insns)
        .collect();
    debug!("Register cache"; "addr" => Addr(loads[0].lo), "registers" => cached.len());
    out.push(Node::wrap(
        PseudoOp::RegCacheLoad {
            cached: cached.clone(),
        },
        loads,
    ));
    for node in body {
        match node.as_raw() {
            Some(ins) if CONFIG.enable_register_cache_rewrite => {
                out.push(Node::raw(substitute_cached(ins, &cached)))
            }
            _ => out.push(node),
        }
    }
    out
}

fn substitute_cached(ins: &Instruction, cached: &[(Register, i64)]) -> Instruction {
    let value = |r: &Register| cached.iter().find(|(c, _)| c == r).map(|(_, v)| *v);
    let dest = ins.destination_index();
    let mut changed = false;
    let operands = ins
        .operands
        .iter()
        .enumerate()
        .map(|(i, op)| {
            let new = match op {
                Operand::Reg(r) if dest != Some(i) => value(r).map(Operand::Immediate),
                Operand::Deferred(r) => value(r)
                    .and_then(|v| u64::try_from(v).ok())
                    .map(Operand::Absolute),
                Operand::Indexed(d, r) => value(r)
                    .and_then(|v| v.checked_add(*d))
                    .and_then(|a| u64::try_from(a).ok())
                    .map(Operand::Absolute),
                _ => None,
            };
            changed |= new.is_some();
            new.unwrap_or_else(|| op.clone())
        })
        .collect();
    if changed {
        ins.with_operands(operands)
    } else {
        ins.clone()
    }
}

/// Report raw loop, trap and check instructions that no idiom accounted for.
pub fn report_leftovers(body: &[Node], function: u64, diags: &mut Diagnostics) {
    if !CONFIG.report_unrecognized_idioms {
        return;
    }
    for ins in body.iter().filter_map(Node::as_raw) {
        if matches!(
            ins.mnemonic,
            Mnemonic::Sob | Mnemonic::Trap | Mnemonic::Sev | Mnemonic::Chk
        ) {
            diags.report(
                function,
                Diagnostic::UnrecognizedIdiom {
                    addr: ins.lo,
                    text: ins.to_string(),
                },
            );
        }
    }
}

/// Report the literal-address blobs and string literals whose bytes are not in the image.
pub fn report_unreadable(body: &[Node], function: u64, diags: &mut Diagnostics) {
    for node in body {
        let (addr, width) = match &node.op {
            PseudoOp::Blob {
                source: Some(source),
                width,
                content: Resolution::Unrecoverable,
                ..
            } => (*source, *width),
            PseudoOp::StringLiteral {
                source,
                width,
                text: Resolution::Unrecoverable,
            } => (*source, *width),
            _ => continue,
        };
        diags.report(
            function,
            Diagnostic::MemoryUnavailable {
                addr: node.lo,
                source: MemoryUnavailable {
                    addr,
                    len: width as usize,
                },
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing_lifter::lift_from;
    use crate::provider::Listing;

    fn body_of(listing: &Listing, lo: u64, hi: u64) -> Vec<Node> {
        let mut a = lo;
        let mut body = vec![];
        while a < hi {
            let ins = listing.instruction_at(a).unwrap().clone();
            a = ins.hi;
            body.push(Node::raw(ins));
        }
        body
    }

    fn lift(code: &str) -> Listing {
        lift_from(&format!(
            "LISTING t\n\nMEMORY\n2000: 48 49 21 00\n\nENTRY 1000\n\nCODE\n{}",
            code
        ))
        .unwrap()
    }

    #[test]
    fn string_literal_width_and_text() {
        let l = lift(
            "1000 mov #0x2003,r1\n\
             1004 mov #2,r2\n\
             1008 movb -(r1),-(sp)\n\
             100a sob r2,0x1008\n\
             100c movb -(r1),-(sp)\n\
             100e rts pc\n",
        );
        let body = rewrite_all(body_of(&l, 0x1000, 0x100e), &l);
        assert_eq!(body.len(), 1);
        assert_eq!(
            body[0].op,
            PseudoOp::StringLiteral {
                source: 0x2000,
                width: 3,
                text: Resolution::Known("HI!".into()),
            }
        );
        assert_eq!((body[0].lo, body[0].hi), (0x1000, 0x100e));
    }

    #[test]
    fn loop_target_must_be_loop_body() {
        let l = lift(
            "1000 mov #3,r2\n\
             1004 mov (r1)+,(r3)+\n\
             1006 sob r2,0x1000\n\
             1008 rts pc\n",
        );
        let body = rewrite_all(body_of(&l, 0x1000, 0x1008), &l);
        assert_eq!(body.len(), 3);
        assert!(body.iter().all(|n| n.op == PseudoOp::Instruction));
    }

    #[test]
    fn block_move_and_checks() {
        let l = lift(
            "1000 mov #3,r2\n\
             1004 mov (r1)+,(r3)+\n\
             1006 sob r2,0x1004\n\
             1008 sub #4,r0\n\
             100c bhis 0x1012\n\
             100e trap #7\n\
             1012 inc -2(fp)\n\
             1016 chk -2(fp),@#0x2000\n\
             101c cmp r0,r1\n\
             101e blos 0x1024\n\
             1020 trap #2\n\
             1024 rts pc\n",
        );
        let body = rewrite_all(body_of(&l, 0x1000, 0x1024), &l);
        let ops: Vec<_> = body.iter().map(|n| n.op.clone()).collect();
        assert_eq!(
            ops,
            vec![
                PseudoOp::BlockMove {
                    src: Register(1),
                    dst: Register(3),
                    count: 6
                },
                PseudoOp::MallocCheck,
                PseudoOp::LimitCheck,
                PseudoOp::LimitCheck,
            ]
        );
    }

    #[test]
    fn checks_never_move_sp() {
        let l = lift(
            "1000 cmp (sp)+,r0\n\
             1002 blos 0x1008\n\
             1004 trap #2\n\
             1008 inc r1\n\
             100a chk r1,(sp)+\n\
             100c sub #2,sp\n\
             1010 bhis 0x1016\n\
             1012 trap #7\n\
             1016 rts pc\n",
        );
        let body = rewrite_all(body_of(&l, 0x1000, 0x1016), &l);
        assert!(body
            .iter()
            .all(|n| !matches!(n.op, PseudoOp::LimitCheck | PseudoOp::MallocCheck)));
        assert_eq!(body[0].to_string(), "cmp (sp)+,r0");
    }

    #[test]
    fn register_cache_resolves_calls() {
        let l = lift(
            "1000 mov fp,-(sp)\n\
             1002 mov sp,fp\n\
             1004 cmp sp,@#0x2000\n\
             1008 bhi 0x100e\n\
             100a sev\n\
             100c trap\n\
             100e mov #0x3000,r3\n\
             1012 lea @#0x4000,r4\n\
             1016 jsr pc,(r3)\n\
             1018 mov r4,-(sp)\n\
             101a mov 2(r4),r0\n\
             101e rts pc\n",
        );
        let body = match_prologue(body_of(&l, 0x1000, 0x101e), &l).unwrap();
        assert_eq!(body[0].op, PseudoOp::Prologue { frame_size: 0 });
        let body = rewrite_all(register_cache(body), &l);
        assert_eq!(
            body[1].op,
            PseudoOp::RegCacheLoad {
                cached: vec![(Register(3), 0x3000), (Register(4), 0x4000)]
            }
        );
        match &body[2].op {
            PseudoOp::Call { destination, .. } => {
                assert_eq!(destination, &Resolution::Known(0x3000))
            }
            op => panic!("expected a call, got {:?}", op),
        }
        assert_eq!(
            body[3].op,
            PseudoOp::ConstPush {
                width: Width::Word,
                value: 0x4000
            }
        );
        assert_eq!(body[4].to_string(), "mov @#0x4002,r0");
    }
}
