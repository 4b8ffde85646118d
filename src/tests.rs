use crate::listing_lifter::lift_from;
use crate::provider::Listing;

#[cfg(test)]
use crate::{
    discovery::Session,
    isa::Width,
    provider::InstructionProvider,
    pseudo_ops::{BlobDirection, PseudoOp, Resolution},
};

/// A procedure pushing two bytes copied from a literal address, then dropping them
pub fn blob_push_program() -> Listing {
    lift_from(
        "LISTING blob_push

MEMORY
2000: 48 49

LABELS
1000 push_two

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e mov #0x2000,r1
1012 mov #2,r2
1016 movb (r1)+,-(sp)
1018 sob r2,0x1016
101a add #2,sp
101e mov fp,sp
1020 mov (sp)+,fp
1022 rts pc
",
    )
    .unwrap()
}

/// Same as [`blob_push_program`], but the source bytes are not in the image
pub fn unmapped_blob_program() -> Listing {
    lift_from(
        "LISTING unmapped_blob

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e mov #0x5000,r1
1012 mov #2,r2
1016 movb (r1)+,-(sp)
1018 sob r2,0x1016
101a add #2,sp
101e mov fp,sp
1020 mov (sp)+,fp
1022 rts pc
",
    )
    .unwrap()
}

/// A procedure with one local, into which a string literal is materialized through the runtime
pub fn string_literal_program() -> Listing {
    lift_from(
        "LISTING string_literal

MEMORY
2000: 48 49 21 00

RUNTIME
3000 string_literal

LABELS
1000 greet

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 sub #4,sp
1008 cmp sp,@#0x2100
100c bhi 0x1012
100e sev
1010 trap
1012 lea -4(fp),-(sp)
1016 mov #0x2000,-(sp)
101a mov #3,-(sp)
101e jsr pc,@#0x3000
1022 add #6,sp
1026 mov fp,sp
1028 mov (sp)+,fp
102a rts pc
",
    )
    .unwrap()
}

/// Three procedures, only the first of which is decoded up front. The other two only come into
/// view through calls, one pass at a time.
pub fn call_chain_program() -> Listing {
    lift_from(
        "LISTING call_chain

LABELS
1000 main
1100 helper

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e jsr pc,@#0x1100
1012 mov fp,sp
1014 mov (sp)+,fp
1016 rts pc
1100 mov fp,-(sp)
1102 mov sp,fp
1104 cmp sp,@#0x2100
1108 bhi 0x110e
110a sev
110c trap
110e jsr pc,@#0x1200
1112 jsr pc,@#0x1000
1116 mov fp,sp
1118 mov (sp)+,fp
111a rts pc
1200 mov fp,-(sp)
1202 mov sp,fp
1204 cmp sp,@#0x2100
1208 bhi 0x120e
120a sev
120c trap
120e cmp sp,@#0x2100
1212 bhi 0x1218
1214 sev
1216 trap
1218 mov fp,sp
121a mov (sp)+,fp
121c rts pc
",
    )
    .unwrap()
}

/// A frame setup without the stack check that completes a prologue
pub fn no_prologue_program() -> Listing {
    lift_from(
        "LISTING no_prologue

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 tst r0
1006 mov fp,sp
1008 mov (sp)+,fp
100a rts pc
",
    )
    .unwrap()
}

/// A limit check whose comparison pops the value it checks
pub fn popped_check_program() -> Listing {
    lift_from(
        "LISTING popped_check

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e mov #1,-(sp)
1012 cmp (sp)+,r0
1014 blos 0x101a
1016 trap #2
101a mov fp,sp
101c mov (sp)+,fp
101e rts pc
",
    )
    .unwrap()
}

/// A block copy whose count does not fit in the address space
pub fn huge_loop_program() -> Listing {
    lift_from(
        "LISTING huge_loop

MEMORY
2000: 48 49

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e mov #0x2000,r1
1012 mov #0x7fffffffffffffff,r2
1016 movl (r1)+,-(sp)
1018 sob r2,0x1016
101a mov fp,sp
101c mov (sp)+,fp
101e rts pc
",
    )
    .unwrap()
}

/// A non-local exit through a saved stack pointer, skipped over by a branch
pub fn bailout_program() -> Listing {
    lift_from(
        "LISTING bailout

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e tst r0
1010 beq 0x101a
1012 mov -2(fp),sp
1016 jmp @#0x3000
101a mov fp,sp
101c mov (sp)+,fp
101e rts pc
",
    )
    .unwrap()
}

/// A `case` dispatch table in the middle of a body, one arm of which calls another procedure
pub fn case_dispatch_program() -> Listing {
    lift_from(
        "LISTING case_dispatch

LABELS
1000 dispatch
1100 arm

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e case r0,0x1014,0x1018
1014 jsr pc,@#0x1100
1018 mov fp,sp
101a mov (sp)+,fp
101c rts pc
1100 mov fp,-(sp)
1102 mov sp,fp
1104 cmp sp,@#0x2100
1108 bhi 0x110e
110a sev
110c trap
110e mov fp,sp
1110 mov (sp)+,fp
1112 rts pc
",
    )
    .unwrap()
}

/// Every encoding of a bare stack adjustment
pub fn stack_adjust_program() -> Listing {
    lift_from(
        "LISTING stack_adjust

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e sub #6,sp
1012 tst (sp)+
1014 cmp (sp)+,(sp)+
1016 mov fp,sp
1018 mov (sp)+,fp
101a rts pc
",
    )
    .unwrap()
}

/// A procedure doing several things the analysis cannot follow
pub fn untrackable_program() -> Listing {
    lift_from(
        "LISTING untrackable

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e mov #1,8(sp)
1014 jsr pc,(r3)
1016 mov r0,sp
1018 jmp (r0)
101a mov fp,sp
101c mov (sp)+,fp
101e rts pc
",
    )
    .unwrap()
}

/// A string literal materialized into a stack temporary, addressed relative to `sp`
pub fn string_temporary_program() -> Listing {
    lift_from(
        "LISTING string_temporary

MEMORY
2000: 48 49 21 00

RUNTIME
3000 string_literal

ENTRY 1000

CODE
1000 mov fp,-(sp)
1002 mov sp,fp
1004 cmp sp,@#0x2100
1008 bhi 0x100e
100a sev
100c trap
100e sub #4,sp
1012 lea 0(sp),-(sp)
1016 mov #0x2000,-(sp)
101a mov #3,-(sp)
101e jsr pc,@#0x3000
1022 add #6,sp
1026 add #4,sp
102a mov fp,sp
102c mov (sp)+,fp
102e rts pc
",
    )
    .unwrap()
}

pub fn test_program_with_name(name: &str) -> Listing {
    let mut programs: std::collections::BTreeMap<&str, fn() -> Listing> = Default::default();

    macro_rules! ins {
        () => {};
        ($f:ident) => {
            programs.insert(stringify!($f), $f);
        };
        ([$n:expr]$f:ident) => {
            programs.insert($n, $f);
        };
        ($x:tt,$($xs:tt)*) => {
            ins!($x);
            ins!($($xs)*);
        };
        ([$n:tt]$x:tt,$($xs:tt)*) => {
            ins!([$n]$x);
            ins!($($xs)*);
        };
    }
    ins!(
        blob_push_program,
        ["unmapped_blob"]unmapped_blob_program,
        string_literal_program,
        ["call_chain"]call_chain_program,
        ["no_prologue"]no_prologue_program,
        ["popped_check"]popped_check_program,
        ["huge_loop"]huge_loop_program,
        ["bailout"]bailout_program,
        ["case_dispatch"]case_dispatch_program,
        ["stack_adjust"]stack_adjust_program,
        ["untrackable"]untrackable_program,
        ["string_temporary"]string_temporary_program,
    );

    let names = programs.keys().collect::<Vec<_>>();
    let mut counts = names
        .iter()
        .map(|k| {
            k.chars()
                .zip(name.chars())
                .take_while(|(a, b)| a == b)
                .count()
        })
        .collect::<Vec<_>>();
    counts.sort_unstable();
    if counts[counts.len() - 1] != name.len() {
        panic!("Invalid prefix. Expected one of {:#?}", names)
    } else if counts[counts.len() - 1] == counts[counts.len() - 2] {
        panic!("Non-unique prefix. Expected one of {:#?}", names)
    }

    let name = names
        .into_iter()
        .max_by_key(|k| {
            k.chars()
                .zip(name.chars())
                .take_while(|(a, b)| a == b)
                .count()
        })
        .unwrap();

    programs.get(name).unwrap()()
}

#[cfg(test)]
fn analyzed(name: &str) -> Session<Listing> {
    let mut session = Session::new(test_program_with_name(name));
    session.run();
    session
}

#[cfg(test)]
fn assert_tiled<P: InstructionProvider>(session: &Session<P>) {
    for f in session.functions.values().filter(|f| f.discovered) {
        assert_eq!(f.body.first().map(|n| n.lo), Some(f.lo));
        assert_eq!(f.body.last().map(|n| n.hi), Some(f.hi));
        for w in f.body.windows(2) {
            assert_eq!(w[0].hi, w[1].lo, "gap or overlap after {}", w[0]);
        }
        assert!(f.cfg.tiles(&f.body));
    }
}

#[test]
fn blob_from_literal_address() {
    let session = analyzed("blob");
    let f = &session.functions[&0x1000];
    assert!(f.discovered);
    assert_tiled(&session);

    let blobs: Vec<_> = f
        .body
        .iter()
        .filter(|n| matches!(n.op, PseudoOp::Blob { .. }))
        .collect();
    assert_eq!(blobs.len(), 1);
    assert_eq!(
        blobs[0].op,
        PseudoOp::Blob {
            width: 2,
            source: Some(0x2000),
            direction: BlobDirection::Push,
            content: Resolution::Known(vec![0x48, 0x49]),
        }
    );
    assert_eq!((blobs[0].lo, blobs[0].hi), (0x100e, 0x101a));
    assert_eq!(blobs[0].stack_delta, -2);
    assert_eq!(blobs[0].stack_after.as_deref(), Some("{blob2:4849|?2}"));
}

#[test]
fn blob_from_unmapped_address() {
    let session = analyzed("unmapped");
    let f = &session.functions[&0x1000];
    let blob = f
        .body
        .iter()
        .find(|n| matches!(n.op, PseudoOp::Blob { .. }))
        .unwrap();
    match &blob.op {
        PseudoOp::Blob { width, content, .. } => {
            assert_eq!(*width, 2);
            assert_eq!(*content, Resolution::Unrecoverable);
        }
        _ => unreachable!(),
    }
    assert_eq!(blob.stack_delta, -2);

    let diags: Vec<_> = session.diagnostics.for_function(0x1000).collect();
    assert_eq!(diags.len(), 1);
    assert_eq!(diags[0].kind(), "MemoryUnavailable");
    assert_eq!(diags[0].addr(), 0x100e);
    assert!(diags[0].to_string().contains("0x5000"));
}

#[test]
fn string_literal_into_local() {
    let session = analyzed("string_literal");
    let f = &session.functions[&0x1000];
    assert!(f.discovered);
    assert_tiled(&session);
    assert_eq!(f.frame_size, Some(4));
    assert_eq!(f.tracking_lost_at, None);

    let local = &f.locals[&-4];
    assert_eq!(local.text.as_deref(), Some("HI!"));
    assert_eq!(local.address_taken, vec![0x1012]);

    assert_eq!(session.provider.label_at(0x2000), Some("str_2000"));
    assert_eq!(session.provider.comment_at(0x101e), Some("\"HI!\""));
    let annotations = crate::render::render_annotations(&session.provider);
    assert!(annotations.contains("2000 str_2000"));
    assert!(annotations.contains("101e  ; \"HI!\""));

    // Runtime routines are never decoded as functions
    assert_eq!(session.functions.len(), 1);
    assert!(session.called.contains_key(&0x3000));
    assert!(session.diagnostics.is_empty());
}

#[test]
fn absorbed_deltas_add_up() {
    let session = analyzed("string_literal");
    let f = &session.functions[&0x1000];
    for node in &f.body {
        if matches!(node.op, PseudoOp::Epilogue | PseudoOp::Call { .. }) {
            continue;
        }
        let sum: i64 = node
            .insns
            .iter()
            .map(|i| match crate::stack_delta::instruction_effect(i) {
                crate::stack_delta::StackEffect::Delta(d) => d,
                crate::stack_delta::StackEffect::Unrecognized => panic!("unrecognized {}", i),
            })
            .sum();
        assert_eq!(sum, node.stack_delta, "delta of {}", node);
    }
}

#[test]
fn levels_follow_deltas() {
    let session = analyzed("string_literal");
    let f = &session.functions[&0x1000];
    assert_eq!(f.cfg.blocks[&f.cfg.entry].level, Resolution::Known(0));
    let levels: Vec<_> = f.body.iter().map(|n| n.stack_level.clone()).collect();
    assert_eq!(
        levels,
        [0, -6, -8, -10, -12, -12, -6]
            .iter()
            .map(|&l| Resolution::Known(l))
            .collect::<Vec<_>>()
    );
    assert_eq!(f.body.iter().map(|n| n.stack_delta).sum::<i64>(), 0);
}

#[test]
fn discovery_over_several_passes() {
    let session = analyzed("call_chain");
    assert_eq!(
        session.functions.keys().copied().collect::<Vec<_>>(),
        vec![0x1000, 0x1100, 0x1200]
    );
    assert!(session.functions.values().all(|f| f.discovered));
    assert_eq!(session.passes, 4);
    assert_tiled(&session);

    let ranges: Vec<_> = session.functions.values().map(|f| (f.lo, f.hi)).collect();
    for w in ranges.windows(2) {
        assert!(w[0].1 <= w[1].0, "functions {:x?} overlap", w);
    }

    assert_eq!(
        session.called.keys().copied().collect::<Vec<_>>(),
        vec![0x1000, 0x1100, 0x1200]
    );
    assert_eq!(session.called[&0x1100].label.as_deref(), Some("helper"));
    assert_eq!(session.called[&0x1000].sites[0].caller, 0x1100);
    assert!(session.unresolved_calls.is_empty());
}

#[test]
fn stack_check_in_body() {
    let session = analyzed("call_chain");
    let leaf = &session.functions[&0x1200];
    let ops: Vec<_> = leaf.body.iter().map(|n| n.op.clone()).collect();
    assert_eq!(
        ops,
        vec![
            PseudoOp::Prologue { frame_size: 0 },
            PseudoOp::StackCheck,
            PseudoOp::Epilogue
        ]
    );
    assert_eq!(leaf.body[1].stack_delta, 0);
    assert_eq!((leaf.body[1].lo, leaf.body[1].hi), (0x120e, 0x1218));
}

#[test]
fn missing_prologue_is_reported() {
    let session = analyzed("no_prologue");
    let f = &session.functions[&0x1000];
    assert!(f.failed);
    assert!(!f.discovered);
    assert_eq!(
        session
            .diagnostics
            .for_function(0x1000)
            .map(|d| d.kind())
            .collect::<Vec<_>>(),
        vec!["NoPrologue"]
    );
}

#[test]
fn const_push_width() {
    let session = analyzed("string_literal");
    let f = &session.functions[&0x1000];
    assert!(f.body.iter().any(|n| n.op
        == PseudoOp::ConstPush {
            width: Width::Word,
            value: 3
        }));
}

#[cfg(test)]
fn ops_of(session: &Session<Listing>, f: u64) -> Vec<PseudoOp> {
    session.functions[&f].body.iter().map(|n| n.op.clone()).collect()
}

#[test]
fn check_popping_its_operand_keeps_level() {
    let session = analyzed("popped_check");
    let f = &session.functions[&0x1000];
    assert_tiled(&session);
    assert!(!ops_of(&session, 0x1000).contains(&PseudoOp::LimitCheck));

    let epilogue = f.body.last().unwrap();
    assert_eq!(epilogue.op, PseudoOp::Epilogue);
    assert_eq!(epilogue.stack_level, Resolution::Known(-2));
    let kinds: Vec<_> = session.diagnostics.iter().map(|(_, d)| d.kind()).collect();
    assert_eq!(kinds, vec!["UnrecognizedIdiom"]);
    assert_eq!(session.diagnostics.iter().next().unwrap().1.addr(), 0x1016);
}

#[test]
fn oversized_loop_stays_raw() {
    let session = analyzed("huge_loop");
    let f = &session.functions[&0x1000];
    assert!(f.discovered);
    assert_tiled(&session);
    assert!(f
        .body
        .iter()
        .all(|n| !matches!(n.op, PseudoOp::Blob { .. })));
    assert!(session
        .diagnostics
        .for_function(0x1000)
        .any(|d| d.kind() == "UnrecognizedIdiom" && d.addr() == 0x1018));
}

#[test]
fn bailout_is_a_sink() {
    let session = analyzed("bailout");
    let f = &session.functions[&0x1000];
    assert_tiled(&session);
    let bailout = f
        .body
        .iter()
        .find(|n| matches!(n.op, PseudoOp::Bailout { .. }))
        .unwrap();
    assert_eq!(bailout.op, PseudoOp::Bailout { slot: -2 });
    assert_eq!((bailout.lo, bailout.hi), (0x1012, 0x101a));
    assert!(bailout.flow_out.is_empty());
    assert!(f.cfg.blocks[&0x1012].succs.is_empty());
    assert_eq!(f.cfg.blocks[&0x101a].level, Resolution::Known(-2));
    // The jump target is not followed, nor reported
    assert_eq!(session.functions.len(), 1);
    assert!(session.diagnostics.is_empty());
}

#[test]
fn case_table_does_not_end_body() {
    let session = analyzed("case_dispatch");
    assert_eq!(
        session.functions.keys().copied().collect::<Vec<_>>(),
        vec![0x1000, 0x1100]
    );
    assert!(session.functions.values().all(|f| f.discovered));
    assert_tiled(&session);

    let f = &session.functions[&0x1000];
    assert_eq!((f.lo, f.hi), (0x1000, 0x101e));
    assert_eq!(
        f.cfg.blocks.keys().copied().collect::<Vec<_>>(),
        vec![0x1000, 0x1014, 0x1018]
    );
    assert_eq!(f.cfg.blocks[&0x1018].level, Resolution::Known(-2));
    assert!(f.cfg.skewed_edges.is_empty());
    assert_eq!(session.called[&0x1100].sites[0].addr, 0x1014);
    assert!(session.diagnostics.is_empty());
}

#[test]
fn stack_adjust_encodings() {
    let session = analyzed("stack_adjust");
    assert_eq!(
        ops_of(&session, 0x1000),
        vec![
            PseudoOp::Prologue { frame_size: 0 },
            PseudoOp::StackAdjust { delta: -6 },
            PseudoOp::StackAdjust { delta: 2 },
            PseudoOp::StackAdjust { delta: 4 },
            PseudoOp::Epilogue,
        ]
    );
    let f = &session.functions[&0x1000];
    let levels: Vec<_> = f.body.iter().map(|n| n.stack_level.clone()).collect();
    assert_eq!(
        levels,
        [0, -2, -8, -6, -2]
            .iter()
            .map(|&l| Resolution::Known(l))
            .collect::<Vec<_>>()
    );
    assert!(session.diagnostics.is_empty());
}

#[test]
fn untrackable_code_is_reported() {
    let session = analyzed("untrackable");
    let f = &session.functions[&0x1000];
    assert!(f.discovered);
    assert_tiled(&session);
    assert_eq!(f.tracking_lost_at, Some(0x100e));
    assert_eq!(session.unresolved_calls.len(), 1);
    assert_eq!(session.unresolved_calls[0].addr, 0x1014);

    let mut found: Vec<_> = session
        .diagnostics
        .for_function(0x1000)
        .map(|d| (d.kind(), d.addr()))
        .collect();
    found.sort_unstable();
    assert_eq!(
        found,
        vec![
            ("MissingFlowTarget", 0x1018),
            ("StackTrackingLost", 0x100e),
            ("UnrecognizedStackEffect", 0x1016),
            ("UnresolvedCall", 0x1014),
        ]
    );
}

#[test]
fn string_literal_into_stack_temporary() {
    let session = analyzed("string_temporary");
    let f = &session.functions[&0x1000];
    assert!(f.discovered);
    assert_eq!(f.tracking_lost_at, None);
    assert!(f.locals.values().all(|v| v.text.is_none()));

    let cleanup = f.body.iter().find(|n| n.lo == 0x1022).unwrap();
    assert_eq!(cleanup.op, PseudoOp::StackAdjust { delta: 6 });
    assert_eq!(cleanup.stack_after.as_deref(), Some("{\"HI!\"|?3}"));
    assert_eq!(session.provider.comment_at(0x101e), Some("\"HI!\""));
    assert_eq!(session.provider.label_at(0x2000), Some("str_2000"));
    assert!(session.diagnostics.is_empty());
}
