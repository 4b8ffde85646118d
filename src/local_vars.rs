//! Frame-local variable usage.
//!
//! Reporting only: nothing downstream depends on these, they are collected to show which frame
//! slots a procedure uses and how.

use std::collections::BTreeMap;

use crate::isa::{Mnemonic, Operand, Register, Width};
use crate::pseudo_ops::{Node, PseudoOp};

/// A frame slot, keyed by its offset from the frame pointer
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalVar {
    pub offset: i64,
    /// Addresses of instructions that take the address of the slot
    pub address_taken: Vec<u64>,
    pub reads: BTreeMap<Width, Vec<u64>>,
    pub writes: BTreeMap<Width, Vec<u64>>,
    /// Text stored into the slot by a recovered string-literal construction
    pub text: Option<String>,
}

impl LocalVar {
    pub fn new(offset: i64) -> Self {
        LocalVar {
            offset,
            ..Default::default()
        }
    }
}

/// Collect frame-relative accesses of every instruction in `body`.
pub fn collect(body: &[Node]) -> BTreeMap<i64, LocalVar> {
    let mut locals: BTreeMap<i64, LocalVar> = BTreeMap::new();
    for node in body {
        if let PseudoOp::FramePointerRef { offset } = node.op {
            entry(&mut locals, offset).address_taken.push(node.lo);
            continue;
        }
        for ins in &node.insns {
            for (i, op) in ins.operands.iter().enumerate() {
                let (offset, deferred) = match op {
                    Operand::Indexed(d, Register::FP) => (*d, false),
                    Operand::IndexedDeferred(d, Register::FP) => (*d, true),
                    _ => continue,
                };
                let var = entry(&mut locals, offset);
                if ins.mnemonic == Mnemonic::Lea && i == 0 && !deferred {
                    var.address_taken.push(ins.lo);
                    continue;
                }
                // A deferred operand only reads the pointer held in the slot
                let is_dest = !deferred && ins.destination_index() == Some(i);
                let reads_dest = matches!(
                    ins.mnemonic,
                    Mnemonic::Add | Mnemonic::Sub | Mnemonic::Inc | Mnemonic::Dec
                );
                if is_dest {
                    var.writes.entry(ins.width).or_default().push(ins.lo);
                    if reads_dest {
                        var.reads.entry(ins.width).or_default().push(ins.lo);
                    }
                } else {
                    let width = if deferred { Width::Word } else { ins.width };
                    var.reads.entry(width).or_default().push(ins.lo);
                }
            }
        }
    }
    locals
}

fn entry(locals: &mut BTreeMap<i64, LocalVar>, offset: i64) -> &mut LocalVar {
    locals
        .entry(offset)
        .or_insert_with(|| LocalVar::new(offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Instruction;

    fn ins(lo: u64, m: Mnemonic, w: Width, ops: Vec<Operand>) -> Node {
        Node::raw(Instruction::new(lo, m, w, ops))
    }

    #[test]
    fn reads_writes_and_address_taken() {
        let body = vec![
            ins(
                0x10,
                Mnemonic::Mov,
                Width::Word,
                vec![Operand::Immediate(1), Operand::Indexed(-2, Register::FP)],
            ),
            ins(
                0x16,
                Mnemonic::Add,
                Width::Byte,
                vec![Operand::Indexed(-2, Register::FP), Operand::Indexed(-4, Register::FP)],
            ),
            ins(
                0x1c,
                Mnemonic::Lea,
                Width::Word,
                vec![Operand::Indexed(-8, Register::FP), Operand::AutoDec(Register::SP)],
            ),
            ins(
                0x20,
                Mnemonic::Mov,
                Width::Word,
                vec![Operand::IndexedDeferred(4, Register::FP), Operand::Reg(Register(0))],
            ),
        ];
        let locals = collect(&body);
        assert_eq!(locals.keys().copied().collect::<Vec<_>>(), vec![-8, -4, -2, 4]);
        assert_eq!(locals[&-2].writes[&Width::Word], vec![0x10]);
        assert_eq!(locals[&-2].reads[&Width::Byte], vec![0x16]);
        assert_eq!(locals[&-4].writes[&Width::Byte], vec![0x16]);
        assert_eq!(locals[&-4].reads[&Width::Byte], vec![0x16]);
        assert_eq!(locals[&-8].address_taken, vec![0x1c]);
        assert!(locals[&-8].reads.is_empty());
        assert_eq!(locals[&4].reads[&Width::Word], vec![0x20]);
    }
}
