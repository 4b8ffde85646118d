//! Symbolic replay of a block's nodes, including the effect of calls to well-known runtime
//! routines.

use std::collections::BTreeMap;

use crate::analysis_config::CONFIG;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::isa::{Mnemonic, Operand, Register, Width};
use crate::local_vars::LocalVar;
use crate::log::*;
use crate::provider::InstructionProvider;
use crate::pseudo_ops::{BlobDirection, Node, PseudoOp, Resolution};
use crate::symbolic_stack::{Content, StackItem, SymbolicStack};

/// Runtime routines with a known effect on the operand stack
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Routine {
    /// Copies `len` bytes from `addr` into the string at `dst`. Arguments stay on the stack.
    StringLiteral,
    LongAdd,
    LongSub,
    LongMul,
    LongDiv,
    LongFromInt,
    StringConcat,
    WriteString,
}

impl Routine {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "string_literal" => Routine::StringLiteral,
            "long_add" => Routine::LongAdd,
            "long_sub" => Routine::LongSub,
            "long_mul" => Routine::LongMul,
            "long_div" => Routine::LongDiv,
            "long_from_int" => Routine::LongFromInt,
            "string_concat" => Routine::StringConcat,
            "write_string" => Routine::WriteString,
            _ => return None,
        })
    }

    /// Argument widths, top of stack first
    pub fn arg_widths(self) -> &'static [u64] {
        match self {
            Routine::StringLiteral => &[2, 2, 2],
            Routine::LongAdd | Routine::LongSub | Routine::LongMul | Routine::LongDiv => &[4, 4],
            Routine::LongFromInt | Routine::WriteString => &[2],
            Routine::StringConcat => &[2, 2],
        }
    }

    pub fn pops_args(self) -> bool {
        self != Routine::StringLiteral
    }

    pub fn result_width(self) -> u64 {
        match self {
            Routine::LongAdd
            | Routine::LongSub
            | Routine::LongMul
            | Routine::LongDiv
            | Routine::LongFromInt => 4,
            Routine::StringConcat => 2,
            Routine::StringLiteral | Routine::WriteString => 0,
        }
    }

    /// Net change of the stack pointer over the call
    pub fn stack_delta(self) -> i64 {
        if self.pops_args() {
            self.arg_widths().iter().sum::<u64>() as i64 - self.result_width() as i64
        } else {
            0
        }
    }

    /// Result of applying the routine to its popped arguments (top first)
    fn result(self, args: &[StackItem]) -> Option<StackItem> {
        let long = |i: usize| match args.get(i).map(|a| &a.content) {
            Some(Content::LongInt(v)) => Some(*v),
            _ => None,
        };
        // Operands are pushed left to right, so the right operand is on top
        let fold = |f: fn(i32, i32) -> Option<i32>| {
            let (rhs, lhs) = (long(0)?, long(1)?);
            f(lhs as i32, rhs as i32).map(i64::from)
        };
        let content = match self {
            Routine::StringLiteral | Routine::WriteString => return None,
            Routine::LongAdd => fold(|a, b| Some(a.wrapping_add(b))).map(Content::LongInt),
            Routine::LongSub => fold(|a, b| Some(a.wrapping_sub(b))).map(Content::LongInt),
            Routine::LongMul => fold(|a, b| Some(a.wrapping_mul(b))).map(Content::LongInt),
            Routine::LongDiv => fold(i32::checked_div).map(Content::LongInt),
            Routine::LongFromInt => match args.first().map(|a| &a.content) {
                Some(Content::SmallInt(v)) => Some(Content::LongInt(i64::from(*v as i16))),
                _ => None,
            },
            Routine::StringConcat => match (
                args.get(1).map(|a| &a.content),
                args.first().map(|a| &a.content),
            ) {
                (Some(Content::StringRef(Some(a))), Some(Content::StringRef(Some(b)))) => {
                    Some(Content::StringRef(Some(format!("{}{}", a, b))))
                }
                _ => Some(Content::StringRef(None)),
            },
        };
        Some(StackItem {
            width: self.result_width(),
            content: content.unwrap_or(Content::Unknown),
        })
    }
}

impl std::fmt::Display for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let name = match self {
            Routine::StringLiteral => "string_literal",
            Routine::LongAdd => "long_add",
            Routine::LongSub => "long_sub",
            Routine::LongMul => "long_mul",
            Routine::LongDiv => "long_div",
            Routine::LongFromInt => "long_from_int",
            Routine::StringConcat => "string_concat",
            Routine::WriteString => "write_string",
        };
        write!(f, "{}", name)
    }
}

/// Everything a replay may record into, besides the stack itself
pub struct ReplayContext<'a> {
    pub function: u64,
    pub provider: &'a mut dyn InstructionProvider,
    pub locals: &'a mut BTreeMap<i64, LocalVar>,
    pub diagnostics: &'a mut Diagnostics,
}

/// Replay `nodes` on `stack`, annotating each node with the stack after it. Returns the address
/// of the node at which tracking was lost, if it was lost during this replay.
pub fn replay(
    nodes: &mut [Node],
    stack: &mut SymbolicStack,
    ctx: &mut ReplayContext,
) -> Option<u64> {
    let mut lost_at = None;
    for node in nodes.iter_mut() {
        if stack.is_mangled() {
            break;
        }
        let before = stack.total_width() as i64;
        apply(node, stack, ctx);
        if stack.is_mangled() {
            lost_at = Some(node.lo);
        } else {
            debug_assert_eq!(
                stack.total_width() as i64 - before,
                -node.stack_delta,
                "replay of {} must follow its stack delta",
                node
            );
        }
        node.stack_after = Some(stack.to_string());
    }
    lost_at
}

/// Apply the stack delta of a node with no more specific effect
fn apply_delta(stack: &mut SymbolicStack, delta: i64) {
    if delta < 0 {
        stack.push(StackItem::unknown(delta.unsigned_abs()));
    } else if delta > 0 {
        stack.pop(delta as u64);
    }
}

fn apply(node: &Node, stack: &mut SymbolicStack, ctx: &mut ReplayContext) {
    match &node.op {
        PseudoOp::ConstPush { width, value } => stack.push(StackItem {
            width: width.bytes(),
            content: if *width == Width::Long {
                Content::LongInt(*value)
            } else {
                Content::SmallInt(*value)
            },
        }),
        PseudoOp::Blob {
            width,
            direction: BlobDirection::Push,
            content,
            ..
        } => stack.push(StackItem {
            width: *width,
            content: Content::Blob(content.known().cloned()),
        }),
        PseudoOp::StringLiteral { width, text, .. } => stack.push(StackItem {
            width: *width,
            content: Content::StringRef(text.known().cloned()),
        }),
        PseudoOp::FramePointerRef { offset } => stack.push(StackItem {
            width: 2,
            content: Content::FrameReference(*offset),
        }),
        PseudoOp::StackPointerRef { offset } => stack.push(StackItem {
            width: 2,
            content: Content::BackReference(*offset),
        }),
        PseudoOp::Call {
            routine: Some(routine),
            ..
        } => apply_routine(node.lo, *routine, stack, ctx),
        PseudoOp::Instruction => {
            apply_delta(stack, node.stack_delta);
            if let Some(ins) = node.as_raw() {
                // Stores of literals into argument slots already on the stack
                if let (Mnemonic::Mov, [Operand::Immediate(v), Operand::Indexed(d, Register::SP)]) =
                    (&ins.mnemonic, &ins.operands[..])
                {
                    if let Ok(offset) = u64::try_from(*d) {
                        stack.put(
                            offset,
                            StackItem {
                                width: ins.width.bytes(),
                                content: Content::SmallInt(*v),
                            },
                        );
                    }
                }
            }
        }
        _ => apply_delta(stack, node.stack_delta),
    }
}

fn apply_routine(site: u64, routine: Routine, stack: &mut SymbolicStack, ctx: &mut ReplayContext) {
    if routine == Routine::StringLiteral {
        materialize_string(site, stack, ctx);
        return;
    }
    let mut args = vec![];
    for w in routine.arg_widths() {
        let mut popped = stack.pop(*w);
        if popped.len() == 1 && popped[0].width == *w {
            args.append(&mut popped);
        } else {
            args.push(StackItem::unknown(*w));
        }
    }
    if let Some(result) = routine.result(&args) {
        trace!("Call result";
               "site" => Addr(site),
               "routine" => routine.to_string(),
               "result" => result.to_string());
        stack.push(result);
    }
}

/// `string_literal(dst, addr, len)`: read the text and attach it to its destination
fn materialize_string(site: u64, stack: &mut SymbolicStack, ctx: &mut ReplayContext) {
    let small = |stack: &mut SymbolicStack, offset| match stack.get(offset, 2).map(|i| &i.content) {
        Some(Content::SmallInt(v)) => Some(*v),
        _ => None,
    };
    let (len, addr) = match (small(stack, 0), small(stack, 2)) {
        (Some(len), Some(addr)) if len > 0 && addr >= 0 => (len as u64, addr as u64),
        _ => {
            debug!("String literal arguments not recovered"; "site" => Addr(site));
            return;
        }
    };
    let bytes = match ctx.provider.read_bytes(addr, len as usize) {
        Ok(b) => b,
        Err(source) => {
            ctx.diagnostics.report(
                ctx.function,
                Diagnostic::MemoryUnavailable { addr: site, source },
            );
            return;
        }
    };
    let text: String = bytes.iter().map(|&b| b as char).collect();
    if CONFIG.materialize_string_literals {
        if ctx.provider.label_at(addr).is_none() {
            ctx.provider.set_label(addr, format!("str_{:04x}", addr));
        }
        ctx.provider.set_comment(site, format!("{:?}", text));
    }
    let dst = stack.get(4, 2).map(|i| i.content.clone());
    match dst {
        Some(Content::FrameReference(offset)) => {
            ctx.locals
                .entry(offset)
                .or_insert_with(|| LocalVar::new(offset))
                .text = Some(text);
        }
        Some(Content::BackReference(_)) => {
            if let Some(target) = stack.resolve(4) {
                stack.put(
                    target,
                    StackItem {
                        width: len,
                        content: Content::StringRef(Some(text)),
                    },
                );
            }
        }
        _ => debug!("String literal destination not recovered"; "site" => Addr(site)),
    }
}

/// Initial stack of a block entered at `level`. Blocks entered with the stack above its level at
/// function entry have nothing we could say anything about.
pub fn block_entry_stack(level: &Resolution<i64>) -> Option<SymbolicStack> {
    match level {
        Resolution::Known(l) if *l <= 0 => Some(SymbolicStack::with_unknown(l.unsigned_abs())),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deltas_match_table() {
        assert_eq!(Routine::StringLiteral.stack_delta(), 0);
        assert_eq!(Routine::LongAdd.stack_delta(), 4);
        assert_eq!(Routine::LongFromInt.stack_delta(), -2);
        assert_eq!(Routine::StringConcat.stack_delta(), 2);
        assert_eq!(Routine::WriteString.stack_delta(), 2);
    }

    #[test]
    fn long_arithmetic_folds() {
        let long = |v| StackItem {
            width: 4,
            content: Content::LongInt(v),
        };
        // 10 - 3, with 3 on top
        assert_eq!(
            Routine::LongSub.result(&[long(3), long(10)]),
            Some(long(7))
        );
        assert_eq!(
            Routine::LongDiv.result(&[long(0), long(10)]),
            Some(StackItem::unknown(4))
        );
        assert_eq!(
            Routine::LongFromInt.result(&[StackItem {
                width: 2,
                content: Content::SmallInt(0xffff),
            }]),
            Some(long(-1))
        );
    }
}
