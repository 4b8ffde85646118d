//! A recovered procedure and the per-function analysis pipeline.

use std::collections::{BTreeMap, BTreeSet};

use crate::analysis_config::CONFIG;
use crate::basic_blocks::ControlFlowGraph;
use crate::call_effects::{self, ReplayContext};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::idioms;
use crate::isa::{Instruction, Mnemonic};
use crate::local_vars::{self, LocalVar};
use crate::log::*;
use crate::provider::InstructionProvider;
use crate::pseudo_ops::{Node, PseudoOp, Resolution};
use crate::stack_delta;

/// A call found in a function body
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CallSite {
    /// Address of the call instruction
    pub addr: u64,
    /// Entry of the calling function
    pub caller: u64,
    pub destination: Resolution<u64>,
    pub label: Option<String>,
}

#[derive(Debug)]
pub struct Function {
    pub lo: u64,
    pub hi: u64,
    pub body: Vec<Node>,
    /// Addresses of trap instructions in the body
    pub traps: BTreeSet<u64>,
    pub locals: BTreeMap<i64, LocalVar>,
    pub frame_size: Option<u64>,
    pub cfg: ControlFlowGraph,
    pub calls: Vec<CallSite>,
    /// Set once analysis has completed; analysis is never re-run on the same function
    pub discovered: bool,
    /// Analysis was attempted and gave up, e.g. for lack of a prologue
    pub failed: bool,
    /// Address at which symbolic stack tracking was abandoned, if it was
    pub tracking_lost_at: Option<u64>,
}

impl Function {
    /// A function spanning the contiguous run `insns`, not yet analyzed
    pub fn new(insns: Vec<Instruction>) -> Self {
        let lo = insns.first().map_or(0, |i| i.lo);
        let hi = insns.last().map_or(lo, |i| i.hi);
        let traps = insns
            .iter()
            .filter(|i| i.mnemonic == Mnemonic::Trap)
            .map(|i| i.lo)
            .collect();
        Function {
            lo,
            hi,
            body: insns.into_iter().map(Node::raw).collect(),
            traps,
            locals: BTreeMap::new(),
            frame_size: None,
            cfg: ControlFlowGraph::default(),
            calls: vec![],
            discovered: false,
            failed: false,
            tracking_lost_at: None,
        }
    }

    /// Is `addr` inside the function's range
    pub fn contains(&self, addr: u64) -> bool {
        self.lo <= addr && addr < self.hi
    }

    pub fn name<'a>(&self, provider: &'a dyn InstructionProvider) -> Option<&'a str> {
        provider.label_at(self.lo)
    }

    /// Run the whole pipeline: idiom matching, stack deltas, basic blocks and levels, local
    /// variables, and symbolic replay.
    pub fn analyze(&mut self, provider: &mut dyn InstructionProvider, diags: &mut Diagnostics) {
        if self.discovered || self.failed {
            return;
        }
        let f = self.lo;
        debug!("Analyzing function"; "entry" => Addr(f), "nodes" => self.body.len());

        let body = std::mem::take(&mut self.body);
        let body = match idioms::match_prologue(body, &*provider) {
            Ok(body) => body,
            Err(body) => {
                self.body = body;
                self.failed = true;
                diags.report(f, Diagnostic::NoPrologue { addr: f });
                return;
            }
        };
        let frame_size = match body.first().map(|n| &n.op) {
            Some(PseudoOp::Prologue { frame_size }) => *frame_size,
            _ => 0,
        };
        self.frame_size = Some(frame_size);

        let body = idioms::register_cache(body);
        let mut body = idioms::rewrite_all(body, &*provider);
        idioms::report_leftovers(&body, f, diags);
        idioms::report_unreadable(&body, f, diags);

        stack_delta::assign(&mut body, frame_size, f, diags);

        let mut cfg = ControlFlowGraph::partition(&body, f, diags);
        cfg.propagate_levels(f, diags);
        cfg.annotate_levels(&mut body);

        self.locals = local_vars::collect(&body);

        if CONFIG.enable_symbolic_replay {
            let mut ctx = ReplayContext {
                function: f,
                provider: &mut *provider,
                locals: &mut self.locals,
                diagnostics: diags,
            };
            for block in cfg.blocks.values() {
                if self.tracking_lost_at.is_some() {
                    break;
                }
                let mut stack = match call_effects::block_entry_stack(&block.level) {
                    Some(s) => s,
                    None => continue,
                };
                if let Some(addr) =
                    call_effects::replay(&mut body[block.nodes.clone()], &mut stack, &mut ctx)
                {
                    self.tracking_lost_at = Some(addr);
                    ctx.diagnostics
                        .report(f, Diagnostic::StackTrackingLost { addr });
                }
            }
        }

        self.calls = body
            .iter()
            .filter_map(|n| match &n.op {
                PseudoOp::Call {
                    destination, label, ..
                } => Some(CallSite {
                    addr: n.lo,
                    caller: f,
                    destination: destination.clone(),
                    label: label.clone(),
                }),
                _ => None,
            })
            .collect();

        if CONFIG.materialize_string_literals {
            for node in &body {
                if let PseudoOp::StringLiteral {
                    source,
                    text: Resolution::Known(text),
                    ..
                } = &node.op
                {
                    if provider.label_at(*source).is_none() {
                        provider.set_label(*source, format!("str_{:04x}", source));
                    }
                    provider.set_comment(node.lo, format!("{:?}", text));
                }
            }
        }

        debug_assert!(
            body.windows(2).all(|w| w[0].hi == w[1].lo)
                && body.first().map(|n| n.lo) == Some(self.lo)
                && body.last().map(|n| n.hi) == Some(self.hi),
            "nodes must tile the function"
        );
        self.body = body;
        self.cfg = cfg;
        self.discovered = true;
        info!("Analyzed function";
              "entry" => Addr(f),
              "nodes" => self.body.len(),
              "blocks" => self.cfg.blocks.len(),
              "locals" => self.locals.len(),
              "calls" => self.calls.len());
    }
}
