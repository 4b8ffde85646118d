//! Net effect of each node on the stack pointer.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::isa::{Instruction, Mnemonic, Operand, Register, ADDRESS_SPACE};
use crate::pseudo_ops::{BlobDirection, Node, PseudoOp};

/// How a node moves the stack pointer. Positive deltas pop, negative ones push.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StackEffect {
    Delta(i64),
    /// Touches the stack pointer in a way we do not understand
    Unrecognized,
}

/// The stack effect of a single raw instruction.
pub fn instruction_effect(ins: &Instruction) -> StackEffect {
    let sp = Register::SP;
    let adjust = |n: i64| {
        if n.unsigned_abs() < ADDRESS_SPACE {
            StackEffect::Delta(n)
        } else {
            StackEffect::Unrecognized
        }
    };
    match (&ins.mnemonic, &ins.operands[..]) {
        (Mnemonic::Add, [Operand::Immediate(n), Operand::Reg(r)]) if *r == sp => return adjust(*n),
        (Mnemonic::Sub, [Operand::Immediate(n), Operand::Reg(r)]) if *r == sp => {
            return n.checked_neg().map_or(StackEffect::Unrecognized, adjust)
        }
        // The callee consumes the return address it was handed
        (Mnemonic::Jsr, _) | (Mnemonic::Rts, _) => return StackEffect::Delta(0),
        (Mnemonic::Other(_), ops) if ops.iter().any(|op| op.register() == Some(sp)) => {
            return StackEffect::Unrecognized
        }
        _ => {}
    }
    if ins.destination() == Some(&Operand::Reg(sp)) {
        return StackEffect::Unrecognized;
    }
    let unit = ins.width.bytes() as i64;
    StackEffect::Delta(
        ins.operands
            .iter()
            .map(|op| match op {
                Operand::AutoDec(r) if *r == sp => -unit,
                Operand::AutoInc(r) if *r == sp => unit,
                _ => 0,
            })
            .sum(),
    )
}

/// The stack effect of a node. `frame_size` is the size of the locals the prologue allocated.
pub fn node_effect(node: &Node, frame_size: u64) -> StackEffect {
    StackEffect::Delta(match &node.op {
        PseudoOp::Prologue { frame_size } => -(2 + *frame_size as i64),
        PseudoOp::Epilogue => 2 + frame_size as i64,
        PseudoOp::Blob {
            width, direction, ..
        } => match direction {
            BlobDirection::Push => -(*width as i64),
            BlobDirection::Pop => *width as i64,
        },
        PseudoOp::StringLiteral { width, .. } => -(*width as i64),
        PseudoOp::ConstPush { width, .. } => -(width.bytes() as i64),
        PseudoOp::StackAdjust { delta } => *delta,
        PseudoOp::StackPointerRef { .. } | PseudoOp::FramePointerRef { .. } => -2,
        PseudoOp::Call { routine, .. } => routine.map_or(0, |r| r.stack_delta()),
        PseudoOp::RegCacheLoad { .. }
        | PseudoOp::StackCheck
        | PseudoOp::LimitCheck
        | PseudoOp::MallocCheck
        | PseudoOp::BlockMove { .. }
        | PseudoOp::Bailout { .. } => 0,
        PseudoOp::Instruction => match node.as_raw() {
            Some(ins) => return instruction_effect(ins),
            None => 0,
        },
    })
}

/// Assign `stack_delta` to every node of `body`, reporting those with an unrecognized effect.
pub fn assign(body: &mut [Node], frame_size: u64, function: u64, diags: &mut Diagnostics) {
    for node in body.iter_mut() {
        node.stack_delta = match node_effect(node, frame_size) {
            StackEffect::Delta(d) => d,
            StackEffect::Unrecognized => {
                diags.report(
                    function,
                    Diagnostic::UnrecognizedStackEffect {
                        addr: node.lo,
                        text: node.to_string(),
                    },
                );
                0
            }
        };
    }
}
