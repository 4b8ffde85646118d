//! Human-readable output: per-function listings, the call graph, and Graphviz block graphs.

use std::fmt::Write as _;

use crate::analysis_config::CONFIG;
use crate::basic_blocks::ControlFlowGraph;
use crate::discovery::Session;
use crate::function::Function;
use crate::isa::Width;
use crate::provider::{InstructionProvider, Listing};
use crate::pseudo_ops::{Node, Resolution};

fn level(l: &Resolution<i64>) -> String {
    match l {
        Resolution::Known(l) => l.to_string(),
        Resolution::NotComputed => "?".to_owned(),
        Resolution::Unrecoverable => "!".to_owned(),
    }
}

fn width_suffix(w: Width) -> &'static str {
    match w {
        Width::Byte => "b",
        Width::Word => "w",
        Width::Long => "l",
    }
}

/// Name of the function with entry `lo`, falling back to its address
pub fn function_name(provider: &dyn InstructionProvider, lo: u64) -> String {
    provider
        .label_at(lo)
        .map_or_else(|| format!("fn_{:04x}", lo), str::to_owned)
}

fn render_node(s: &mut String, node: &Node, provider: &dyn InstructionProvider) {
    if let Some(label) = provider.label_at(node.lo) {
        writeln!(s, "{}:", label).unwrap();
    }
    let mut line = format!(
        "  {:04x}  [{:>4}] {:>+4}  {}",
        node.lo,
        level(&node.stack_level),
        node.stack_delta,
        node
    );
    if CONFIG.annotate_stack_in_listing {
        if let Some(stack) = &node.stack_after {
            write!(line, "  {}", stack).unwrap();
        }
    }
    let comments: Vec<&str> = node
        .insns
        .iter()
        .filter_map(|i| provider.comment_at(i.lo))
        .collect();
    if !comments.is_empty() {
        write!(line, "  ; {}", comments.join("; ")).unwrap();
    }
    writeln!(s, "{}", line).unwrap();
}

/// Render one function: a header, its locals, one line per node, and whatever went wrong.
pub fn render_function<P: InstructionProvider>(session: &Session<P>, f: &Function) -> String {
    let provider: &dyn InstructionProvider = &session.provider;
    let mut s = String::new();
    writeln!(
        s,
        "function {} [{:04x}, {:04x}) frame {}{}",
        function_name(provider, f.lo),
        f.lo,
        f.hi,
        f.frame_size.map_or("?".to_owned(), |n| n.to_string()),
        if f.failed { " (not analyzed)" } else { "" },
    )
    .unwrap();

    for var in f.locals.values() {
        let mut line = format!("  local fp{:+}", var.offset);
        for (w, at) in &var.reads {
            write!(line, " r{}x{}", width_suffix(*w), at.len()).unwrap();
        }
        for (w, at) in &var.writes {
            write!(line, " w{}x{}", width_suffix(*w), at.len()).unwrap();
        }
        if !var.address_taken.is_empty() {
            write!(line, " &x{}", var.address_taken.len()).unwrap();
        }
        if let Some(text) = &var.text {
            write!(line, " = {:?}", text).unwrap();
        }
        writeln!(s, "{}", line).unwrap();
    }

    for node in &f.body {
        render_node(&mut s, node, provider);
    }

    for d in session.diagnostics.for_function(f.lo) {
        writeln!(s, "  ! {}: {}", d.kind(), d).unwrap();
    }
    s
}

/// Every call destination with its callers, then the calls that could not be resolved.
pub fn render_call_graph<P: InstructionProvider>(session: &Session<P>) -> String {
    let provider: &dyn InstructionProvider = &session.provider;
    let mut s = String::new();
    writeln!(s, "call graph").unwrap();
    for called in session.called.values() {
        let name = called
            .label
            .clone()
            .or_else(|| provider.runtime_routine(called.destination).map(str::to_owned))
            .unwrap_or_else(|| function_name(provider, called.destination));
        let mut callers: Vec<String> = called
            .sites
            .iter()
            .map(|site| format!("{}@{:04x}", function_name(provider, site.caller), site.addr))
            .collect();
        callers.dedup();
        writeln!(
            s,
            "  {:04x} {} <- {}",
            called.destination,
            name,
            callers.join(", ")
        )
        .unwrap();
    }
    for site in &session.unresolved_calls {
        writeln!(
            s,
            "  ???? <- {}@{:04x}",
            function_name(provider, site.caller),
            site.addr
        )
        .unwrap();
    }
    s
}

/// The full textual report of a session.
pub fn render_session<P: InstructionProvider>(session: &Session<P>) -> String {
    let mut s = String::new();
    for f in session.functions.values() {
        s += &render_function(session, f);
        s += "\n";
    }
    s += &render_call_graph(session);
    writeln!(s, "\n{} diagnostics", session.diagnostics.len()).unwrap();
    for (function, d) in session.diagnostics.iter() {
        writeln!(s, "  {:04x}: {}: {}", function, d.kind(), d).unwrap();
    }
    s
}

/// Labels and comments of the image, including those recovered by the analysis
pub fn render_annotations(listing: &Listing) -> String {
    let mut s = String::new();
    writeln!(s, "annotations of {}", listing.name).unwrap();
    for (addr, label, comment) in listing.annotations() {
        writeln!(
            s,
            "  {:04x} {}{}",
            addr,
            label.unwrap_or(""),
            comment.map_or(String::new(), |c| format!(" ; {}", c))
        )
        .unwrap();
    }
    s
}

type Edge = (u64, u64);

struct BlockGraph<'a> {
    function: &'a Function,
    cfg: &'a ControlFlowGraph,
    name: String,
}

impl<'a> dot::Labeller<'a, u64, Edge> for BlockGraph<'a> {
    fn graph_id(&'a self) -> dot::Id<'a> {
        dot::Id::new(format!("f{:04x}", self.function.lo)).unwrap()
    }
    fn node_id(&'a self, n: &u64) -> dot::Id<'a> {
        dot::Id::new(format!("b{:04x}", n)).unwrap()
    }
    fn node_label<'b>(&'b self, n: &u64) -> dot::LabelText<'b> {
        let block = &self.cfg.blocks[n];
        let mut text = format!(
            "{}{:04x}  level {}  delta {:+}\\l",
            if *n == self.cfg.entry {
                format!("{}\\l", self.name)
            } else {
                String::new()
            },
            n,
            level(&block.level),
            block.delta
        );
        for node in &self.function.body[block.nodes.clone()] {
            text += &format!("{:04x}  {}\\l", node.lo, node);
        }
        dot::LabelText::escaped(text)
    }
    fn node_shape(&'a self, _n: &u64) -> Option<dot::LabelText<'a>> {
        Some(dot::LabelText::label("box"))
    }
    fn edge_label<'b>(&'b self, e: &Edge) -> dot::LabelText<'b> {
        if self.cfg.skewed_edges.contains(e) {
            dot::LabelText::label("skew")
        } else {
            dot::LabelText::label("")
        }
    }
    fn edge_style(&'a self, e: &Edge) -> dot::Style {
        if self.cfg.skewed_edges.contains(e) {
            dot::Style::Dashed
        } else {
            dot::Style::None
        }
    }
}

impl<'a> dot::GraphWalk<'a, u64, Edge> for BlockGraph<'a> {
    fn nodes(&self) -> dot::Nodes<'a, u64> {
        self.cfg.blocks.keys().copied().collect::<Vec<_>>().into()
    }
    fn edges(&'a self) -> dot::Edges<'a, Edge> {
        self.cfg
            .blocks
            .values()
            .flat_map(|b| b.succs.iter().map(move |s| (b.lo, *s)))
            .collect::<Vec<_>>()
            .into()
    }
    fn source(&self, e: &Edge) -> u64 {
        e.0
    }
    fn target(&self, e: &Edge) -> u64 {
        e.1
    }
}

/// Write the basic-block graph of `f` as a Graphviz `digraph`
pub fn write_dot<W: std::io::Write>(
    f: &Function,
    provider: &dyn InstructionProvider,
    w: &mut W,
) -> std::io::Result<()> {
    let g = BlockGraph {
        function: f,
        cfg: &f.cfg,
        name: function_name(provider, f.lo),
    };
    dot::render(&g, w)
}

/// Generate a `.dot` description of the basic-block graph of `f`
pub fn generate_dot(f: &Function, provider: &dyn InstructionProvider) -> String {
    let mut s: Vec<u8> = vec![];
    write_dot(f, provider, &mut s).unwrap();
    String::from_utf8(s).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing_lifter::lift_from;

    #[test]
    fn skewed_edges_are_flagged() {
        let listing = lift_from(
            "LISTING skew

LABELS
1000 main

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2000
1008 bhi 0x100e
100a sev
100c trap
100e tst r0
1010 beq 0x1016
1012 mov r1,-(sp)
1014 br 0x1016
1016 mov r2,-(sp)
1018 mov fp,sp
101a mov (sp)+,fp
101c rts pc
",
        )
        .unwrap();
        let mut session = Session::new(listing);
        session.run();
        let f = &session.functions[&0x1000];
        assert!(f.cfg.skewed_edges.contains(&(0x1012, 0x1016)));

        let dot = generate_dot(f, &session.provider);
        assert!(dot.starts_with("digraph f1000"));
        assert!(dot.contains("b1012 -> b1016"));
        assert!(dot.contains("skew"));
        assert!(dot.contains("main"));

        let text = render_session(&session);
        assert!(text.contains("function main [1000, 101e)"));
        assert!(text.contains("StackLevelSkew"));
    }
}
