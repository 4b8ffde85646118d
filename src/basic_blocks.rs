//! Basic blocks of a rewritten function body, and propagation of the stack level along them.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;

use crate::containers::Worklist;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::isa::FlowKind;
use crate::log::*;
use crate::pseudo_ops::{Node, PseudoOp, Resolution};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub lo: u64,
    pub hi: u64,
    /// Indexes into the function body
    pub nodes: Range<usize>,
    pub succs: Vec<u64>,
    pub preds: Vec<u64>,
    /// Sum of the stack deltas of the block's nodes
    pub delta: i64,
    /// Stack level on entry
    pub level: Resolution<i64>,
}

impl BasicBlock {
    pub fn new(lo: u64, hi: u64, nodes: Range<usize>, delta: i64) -> Self {
        BasicBlock {
            lo,
            hi,
            nodes,
            succs: vec![],
            preds: vec![],
            delta,
            level: Resolution::NotComputed,
        }
    }
}

/// Control-flow graph of a function, blocks keyed by start address.
#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    pub entry: u64,
    pub blocks: BTreeMap<u64, BasicBlock>,
    /// Edges `(from, to)` along which a disagreeing stack level was seen
    pub skewed_edges: BTreeSet<(u64, u64)>,
}

impl ControlFlowGraph {
    /// Add the edge `from -> to` between two existing blocks
    pub fn add_edge(&mut self, from: u64, to: u64) {
        if let Some(b) = self.blocks.get_mut(&from) {
            if !b.succs.contains(&to) {
                b.succs.push(to);
            }
        }
        if let Some(b) = self.blocks.get_mut(&to) {
            if !b.preds.contains(&from) {
                b.preds.push(from);
            }
        }
    }

    /// Partition `body` into basic blocks.
    ///
    /// Blocks start at the function entry, at every destination of a branch or jump, at every
    /// epilogue, and right after any node that does not simply fall through. Successors come from
    /// the control-flow edges of each block's last node, except calls. Edges to addresses that do
    /// not start a node are reported and dropped.
    pub fn partition(body: &[Node], function: u64, diags: &mut Diagnostics) -> Self {
        let mut cfg = ControlFlowGraph {
            entry: body.first().map_or(function, |n| n.lo),
            ..Default::default()
        };
        if body.is_empty() {
            return cfg;
        }
        let starts: BTreeMap<u64, usize> =
            body.iter().enumerate().map(|(i, n)| (n.lo, i)).collect();
        let end = body[body.len() - 1].hi;

        let mut leaders: BTreeSet<usize> = BTreeSet::new();
        leaders.insert(0);
        for (i, node) in body.iter().enumerate() {
            if node.op == PseudoOp::Epilogue {
                leaders.insert(i);
            }
            if !node.falls_through_only() && i + 1 < body.len() {
                leaders.insert(i + 1);
            }
            for f in &node.flow_out {
                if matches!(f.kind, FlowKind::Conditional | FlowKind::Unconditional) {
                    if let Some(&j) = f.to.and_then(|t| starts.get(&t)) {
                        leaders.insert(j);
                    }
                }
            }
        }

        let leaders: Vec<usize> = leaders.into_iter().collect();
        for (k, &first) in leaders.iter().enumerate() {
            let last = leaders.get(k + 1).copied().unwrap_or(body.len());
            let delta = body[first..last].iter().map(|n| n.stack_delta).sum();
            cfg.blocks.insert(
                body[first].lo,
                BasicBlock::new(body[first].lo, body[last - 1].hi, first..last, delta),
            );
        }

        let mut edges = vec![];
        for block in cfg.blocks.values() {
            let tail = &body[block.nodes.end - 1];
            for f in tail.flow_out.iter().filter(|f| f.kind != FlowKind::Call) {
                match f.to {
                    Some(t) if starts.contains_key(&t) => edges.push((block.lo, t)),
                    // Falling off the end of the body
                    Some(t) if f.kind == FlowKind::Normal && t == end => {}
                    target => diags.report(
                        function,
                        Diagnostic::MissingFlowTarget {
                            addr: tail.lo,
                            target,
                        },
                    ),
                }
            }
        }
        for (from, to) in edges {
            cfg.add_edge(from, to);
        }

        debug_assert!(cfg.tiles(body), "blocks must tile the body");
        cfg
    }

    /// Do the blocks cover `body` exactly, without overlap
    pub fn tiles(&self, body: &[Node]) -> bool {
        let mut next = 0;
        for b in self.blocks.values() {
            if b.nodes.start != next || b.nodes.is_empty() {
                return false;
            }
            if body[b.nodes.start].lo != b.lo || body[b.nodes.end - 1].hi != b.hi {
                return false;
            }
            next = b.nodes.end;
        }
        next == body.len()
    }

    /// Propagate stack levels from the entry block (level 0) in first-in-first-out order. A block
    /// keeps the first level it is reached with; any later disagreement is reported once per edge.
    /// Blocks never reached end up unrecoverable.
    pub fn propagate_levels(&mut self, function: u64, diags: &mut Diagnostics) {
        let entry = match self.blocks.get_mut(&self.entry) {
            Some(b) => b,
            None => return,
        };
        entry.level = Resolution::Known(0);
        let mut worklist: Worklist<u64> = std::iter::once(self.entry).collect();

        while let Some(from) = worklist.pop() {
            let (out, succs) = match self.blocks.get(&from) {
                Some(BasicBlock {
                    level: Resolution::Known(l),
                    delta,
                    succs,
                    ..
                }) => (l + delta, succs.clone()),
                _ => continue,
            };
            for to in succs {
                let block = match self.blocks.get_mut(&to) {
                    Some(b) => b,
                    None => continue,
                };
                match block.level {
                    Resolution::Known(kept) if kept != out => {
                        if self.skewed_edges.insert((from, to)) {
                            diags.report(
                                function,
                                Diagnostic::StackLevelSkew {
                                    addr: to,
                                    from,
                                    kept,
                                    seen: out,
                                },
                            );
                        }
                    }
                    Resolution::Known(_) => {}
                    Resolution::NotComputed | Resolution::Unrecoverable => {
                        trace!("Stack level"; "block" => Addr(to), "level" => out);
                        block.level = Resolution::Known(out);
                        worklist.push(to);
                    }
                }
            }
        }

        for b in self.blocks.values_mut() {
            if !b.level.is_known() {
                b.level = Resolution::Unrecoverable;
            }
        }
    }

    /// Give every node of `body` its running stack level.
    pub fn annotate_levels(&self, body: &mut [Node]) {
        for b in self.blocks.values() {
            let mut level = b.level.clone();
            for node in &mut body[b.nodes.clone()] {
                node.stack_level = level.clone();
                if let Resolution::Known(l) = level {
                    level = Resolution::Known(l + node.stack_delta);
                }
            }
        }
    }
}
