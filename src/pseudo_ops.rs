//! The nodes a function body is made of once idioms have been recognized.
//!
//! A [`Node`] is either a single raw instruction or a [`PseudoOp`] standing in for the run of
//! instructions it replaced. Either way it owns its instructions, so the body always covers the
//! exact same bytes it did before rewriting.

use crate::call_effects::Routine;
use crate::isa::{Flow, FlowKind, Instruction, Register, Width};

/// A value that may not have been computed yet, or that has been found to be unrecoverable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution<T> {
    NotComputed,
    Known(T),
    Unrecoverable,
}

impl<T> Resolution<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Resolution::Known(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Resolution::Known(_))
    }
}

impl<T> Default for Resolution<T> {
    fn default() -> Self {
        Resolution::NotComputed
    }
}

impl<T> From<Option<T>> for Resolution<T> {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => Resolution::Known(v),
            None => Resolution::Unrecoverable,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlobDirection {
    Push,
    Pop,
}

/// Higher-level operation recovered from a compiler idiom
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PseudoOp {
    /// Frame setup with `frame_size` bytes of locals, including the stack overrun self-check
    Prologue { frame_size: u64 },
    /// Frame teardown and return
    Epilogue,
    /// Registers loaded once with a literal or address right after the prologue
    RegCacheLoad { cached: Vec<(Register, i64)> },
    /// A loop moving `width` bytes between the stack and memory
    Blob {
        width: u64,
        source: Option<u64>,
        direction: BlobDirection,
        content: Resolution<Vec<u8>>,
    },
    ConstPush { width: Width, value: i64 },
    StackAdjust { delta: i64 },
    StackCheck,
    LimitCheck,
    MallocCheck,
    /// A loop copying `count` bytes from `(src)+` to `(dst)+`
    BlockMove {
        src: Register,
        dst: Register,
        count: u64,
    },
    /// Reload the stack pointer from a frame slot and jump away
    Bailout { slot: i64 },
    Call {
        destination: Resolution<u64>,
        label: Option<String>,
        routine: Option<Routine>,
    },
    /// Push of the stack address `offset` bytes above the top
    StackPointerRef { offset: i64 },
    /// Push of the address of the frame slot at `offset`; the slot is keyed by `offset` in the
    /// function's locals.
    FramePointerRef { offset: i64 },
    /// Push of an inline string constant of `width` bytes copied from `source`
    StringLiteral {
        source: u64,
        width: u64,
        text: Resolution<String>,
    },
    /// A single raw instruction, kept as is
    Instruction,
}

impl std::fmt::Display for PseudoOp {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            PseudoOp::Prologue { frame_size } => write!(f, "prologue frame={}", frame_size),
            PseudoOp::Epilogue => write!(f, "epilogue"),
            PseudoOp::RegCacheLoad { cached } => {
                write!(f, "regcache")?;
                for (r, v) in cached {
                    write!(f, " {}={:#x}", r, v)?;
                }
                Ok(())
            }
            PseudoOp::Blob {
                width,
                source,
                direction,
                content,
            } => {
                let dir = match direction {
                    BlobDirection::Push => "push",
                    BlobDirection::Pop => "pop",
                };
                write!(f, "blob {} {}", dir, width)?;
                if let Some(s) = source {
                    write!(f, " @{:#06x}", s)?;
                }
                match content {
                    Resolution::Known(bytes) => {
                        write!(f, " [")?;
                        for (i, b) in bytes.iter().enumerate() {
                            write!(f, "{}{:02x}", if i == 0 { "" } else { " " }, b)?;
                        }
                        write!(f, "]")
                    }
                    Resolution::Unrecoverable => write!(f, " [?]"),
                    Resolution::NotComputed => Ok(()),
                }
            }
            PseudoOp::ConstPush { width, value } => {
                write!(f, "push{} #{}", if *width == Width::Long { "l" } else { "" }, value)
            }
            PseudoOp::StackAdjust { delta } => write!(f, "sp {:+}", delta),
            PseudoOp::StackCheck => write!(f, "stackcheck"),
            PseudoOp::LimitCheck => write!(f, "limitcheck"),
            PseudoOp::MallocCheck => write!(f, "malloccheck"),
            PseudoOp::BlockMove { src, dst, count } => {
                write!(f, "blockmove ({})+ -> ({})+ {}", src, dst, count)
            }
            PseudoOp::Bailout { slot } => write!(f, "bailout sp={}(fp)", slot),
            PseudoOp::Call {
                destination,
                label,
                ..
            } => {
                match destination {
                    Resolution::Known(d) => write!(f, "call {:#06x}", d)?,
                    _ => write!(f, "call ?")?,
                }
                if let Some(l) = label {
                    write!(f, " <{}>", l)?;
                }
                Ok(())
            }
            PseudoOp::StackPointerRef { offset } => write!(f, "pushaddr {}(sp)", offset),
            PseudoOp::FramePointerRef { offset } => write!(f, "pushaddr {}(fp)", offset),
            PseudoOp::StringLiteral {
                source,
                width,
                text,
            } => match text {
                Resolution::Known(t) => write!(f, "pushstr {:?}", t),
                _ => write!(f, "pushstr {} @{:#06x}", width, source),
            },
            PseudoOp::Instruction => write!(f, "insn"),
        }
    }
}

/// An element of a function body.
#[derive(Clone, Debug)]
pub struct Node {
    pub op: PseudoOp,
    /// The instructions this node replaced, in address order
    pub insns: Vec<Instruction>,
    pub lo: u64,
    pub hi: u64,
    pub stack_delta: i64,
    /// Stack level on entry to the node, relative to the level at function entry
    pub stack_level: Resolution<i64>,
    pub flow_out: Vec<Flow>,
    /// Rendered symbolic stack after the node, once replayed
    pub stack_after: Option<String>,
}

impl Node {
    pub fn raw(ins: Instruction) -> Self {
        Node {
            op: PseudoOp::Instruction,
            lo: ins.lo,
            hi: ins.hi,
            stack_delta: 0,
            stack_level: Resolution::NotComputed,
            flow_out: ins.flow_out.clone(),
            stack_after: None,
            insns: vec![ins],
        }
    }

    /// Wrap the contiguous run `insns` into a pseudo-op node.
    pub fn wrap(op: PseudoOp, insns: Vec<Instruction>) -> Self {
        assert!(!insns.is_empty());
        debug_assert!(
            insns.windows(2).all(|w| w[0].hi == w[1].lo),
            "pseudo-op instructions must be contiguous: {:?}",
            insns
        );
        let lo = insns[0].lo;
        let hi = insns[insns.len() - 1].hi;
        let flow_out = match &op {
            PseudoOp::Instruction => insns[0].flow_out.clone(),
            PseudoOp::Epilogue | PseudoOp::Bailout { .. } => vec![],
            PseudoOp::Call { destination, .. } => vec![
                Flow {
                    kind: FlowKind::Call,
                    to: destination.known().copied(),
                },
                Flow::normal(hi),
            ],
            _ => vec![Flow::normal(hi)],
        };
        Node {
            op,
            insns,
            lo,
            hi,
            stack_delta: 0,
            stack_level: Resolution::NotComputed,
            flow_out,
            stack_after: None,
        }
    }

    /// The instruction, if this node is a single raw one
    pub fn as_raw(&self) -> Option<&Instruction> {
        match self.op {
            PseudoOp::Instruction => self.insns.first(),
            _ => None,
        }
    }

    /// Does control only ever leave this node by falling through into the next one
    pub fn falls_through_only(&self) -> bool {
        self.flow_out
            .iter()
            .filter(|f| f.kind != FlowKind::Call)
            .all(|f| f.kind == FlowKind::Normal && f.to == Some(self.hi))
            && self.flow_out.iter().any(|f| f.kind == FlowKind::Normal)
    }
}

impl std::fmt::Display for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self.as_raw() {
            Some(ins) => write!(f, "{}", ins),
            None => write!(f, "{}", self.op),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::{Mnemonic, Operand};

    #[test]
    fn wrapped_range_and_flow() {
        let a = Instruction::new(
            0x10,
            Mnemonic::Mov,
            Width::Word,
            vec![Operand::Reg(Register::FP), Operand::AutoDec(Register::SP)],
        );
        let b = Instruction::new(
            a.hi,
            Mnemonic::Add,
            Width::Word,
            vec![Operand::Immediate(-4), Operand::Deferred(Register::SP)],
        );
        let n = Node::wrap(PseudoOp::FramePointerRef { offset: -4 }, vec![a, b]);
        assert_eq!((n.lo, n.hi), (0x10, 0x16));
        assert_eq!(n.flow_out, vec![Flow::normal(0x16)]);
        assert!(n.falls_through_only());
        assert_eq!(n.to_string(), "pushaddr -4(fp)");

        let pc = Operand::Reg(Register::PC);
        let rts = Instruction::new(0x16, Mnemonic::Rts, Width::Word, vec![pc]);
        assert!(!Node::raw(rts).falls_through_only());
    }
}
