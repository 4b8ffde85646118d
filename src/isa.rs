//! Decoded instructions of the OMSI target machine.
//!
//! This is the typed view handed out by an
//! [`InstructionProvider`](crate::provider::InstructionProvider). Everything downstream (idiom
//! matching, stack effects, local variable collection) inspects these values structurally; the
//! rendered text is only ever produced for output.

/// Size of the 16-bit address space. No stack adjustment or block copy can exceed it.
pub const ADDRESS_SPACE: u64 = 1 << 16;

/// A machine register. `r0`..`r4` are general purpose, `r5` doubles as the frame pointer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register(pub u8);

impl Register {
    /// Frame pointer; locals live at negative offsets, arguments at positive ones
    pub const FP: Register = Register(5);
    /// Stack pointer, grows downwards
    pub const SP: Register = Register(6);
    /// Program counter, also the linkage register of `jsr`/`rts`
    pub const PC: Register = Register(7);

    /// Whether the compiler may use this register for scratch values or cached constants
    pub fn is_general(self) -> bool {
        self.0 < 5
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "fp" => Self::FP,
            "sp" => Self::SP,
            "pc" => Self::PC,
            _ => {
                let n: u8 = name.strip_prefix('r')?.parse().ok()?;
                if n > 7 {
                    return None;
                }
                Register(n)
            }
        })
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Self::FP => write!(f, "fp"),
            Self::SP => write!(f, "sp"),
            Self::PC => write!(f, "pc"),
            Register(n) => write!(f, "r{}", n),
        }
    }
}

impl std::fmt::Debug for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self)
    }
}

/// Operand size of an instruction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Width {
    Byte,
    Word,
    Long,
}

impl Width {
    pub fn bytes(self) -> u64 {
        match self {
            Width::Byte => 1,
            Width::Word => 2,
            Width::Long => 4,
        }
    }

    fn suffix(self) -> &'static str {
        match self {
            Width::Byte => "b",
            Width::Word => "",
            Width::Long => "l",
        }
    }
}

/// Branch conditions, named after the condition-code tests they perform
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum Condition {
    Ne,
    Eq,
    /// Unsigned higher
    Hi,
    /// Unsigned lower or same
    Los,
    /// Unsigned higher or same
    His,
    /// Unsigned lower
    Lo,
    Ge,
    Lt,
    Gt,
    Le,
    Pl,
    Mi,
    Vc,
    Vs,
}

impl Condition {
    const ALL: [(Condition, &'static str); 14] = [
        (Condition::Ne, "bne"),
        (Condition::Eq, "beq"),
        (Condition::Hi, "bhi"),
        (Condition::Los, "blos"),
        (Condition::His, "bhis"),
        (Condition::Lo, "blo"),
        (Condition::Ge, "bge"),
        (Condition::Lt, "blt"),
        (Condition::Gt, "bgt"),
        (Condition::Le, "ble"),
        (Condition::Pl, "bpl"),
        (Condition::Mi, "bmi"),
        (Condition::Vc, "bvc"),
        (Condition::Vs, "bvs"),
    ];

    fn branch_name(self) -> &'static str {
        Self::ALL
            .iter()
            .find(|(c, _)| *c == self)
            .map_or("b", |(_, n)| *n)
    }
}

/// The operation an instruction performs.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Mnemonic {
    Mov,
    Add,
    Sub,
    Cmp,
    Inc,
    Dec,
    Clr,
    Tst,
    /// Load the effective address of the source operand into the destination
    Lea,
    /// Bounds check; traps by itself when the operand is outside the bounds descriptor
    Chk,
    /// Subtract one from the register and branch back if the result is non-zero
    Sob,
    /// Unconditional branch
    Br,
    /// Conditional branch
    Bcc(Condition),
    Jsr,
    Rts,
    Jmp,
    /// Software interrupt, used by the runtime to report check failures
    Trap,
    /// Set the overflow (trap request) flag
    Sev,
    /// Multi-way dispatch through the inline table that follows the instruction
    Case,
    /// Anything the analysis has no special knowledge of
    Other(String),
}

impl Mnemonic {
    /// Does the mnemonic take a `b`/`l` width suffix
    fn is_sized(&self) -> bool {
        matches!(
            self,
            Mnemonic::Mov
                | Mnemonic::Add
                | Mnemonic::Sub
                | Mnemonic::Cmp
                | Mnemonic::Inc
                | Mnemonic::Dec
                | Mnemonic::Clr
                | Mnemonic::Tst
        )
    }

    fn exact_from_name(name: &str) -> Option<Self> {
        Some(match name {
            "mov" => Mnemonic::Mov,
            "add" => Mnemonic::Add,
            "sub" => Mnemonic::Sub,
            "cmp" => Mnemonic::Cmp,
            "inc" => Mnemonic::Inc,
            "dec" => Mnemonic::Dec,
            "clr" => Mnemonic::Clr,
            "tst" => Mnemonic::Tst,
            "lea" => Mnemonic::Lea,
            "chk" => Mnemonic::Chk,
            "sob" => Mnemonic::Sob,
            "br" => Mnemonic::Br,
            "jsr" => Mnemonic::Jsr,
            "rts" => Mnemonic::Rts,
            "jmp" => Mnemonic::Jmp,
            "trap" => Mnemonic::Trap,
            "sev" => Mnemonic::Sev,
            "case" => Mnemonic::Case,
            _ => {
                let (cond, _) = Condition::ALL.iter().find(|(_, n)| *n == name)?;
                Mnemonic::Bcc(*cond)
            }
        })
    }

    /// Parse a mnemonic together with its width suffix. Unknown names become
    /// [`Mnemonic::Other`] of word width.
    pub fn from_name(name: &str) -> (Self, Width) {
        if let Some(m) = Self::exact_from_name(name) {
            return (m, Width::Word);
        }
        for (suffix, width) in [('b', Width::Byte), ('l', Width::Long)] {
            if let Some(m) = name
                .strip_suffix(suffix)
                .and_then(Self::exact_from_name)
                .filter(Mnemonic::is_sized)
            {
                return (m, width);
            }
        }
        (Mnemonic::Other(name.to_owned()), Width::Word)
    }

    pub fn name(&self) -> &str {
        match self {
            Mnemonic::Mov => "mov",
            Mnemonic::Add => "add",
            Mnemonic::Sub => "sub",
            Mnemonic::Cmp => "cmp",
            Mnemonic::Inc => "inc",
            Mnemonic::Dec => "dec",
            Mnemonic::Clr => "clr",
            Mnemonic::Tst => "tst",
            Mnemonic::Lea => "lea",
            Mnemonic::Chk => "chk",
            Mnemonic::Sob => "sob",
            Mnemonic::Br => "br",
            Mnemonic::Bcc(c) => c.branch_name(),
            Mnemonic::Jsr => "jsr",
            Mnemonic::Rts => "rts",
            Mnemonic::Jmp => "jmp",
            Mnemonic::Trap => "trap",
            Mnemonic::Sev => "sev",
            Mnemonic::Case => "case",
            Mnemonic::Other(n) => n,
        }
    }
}

/// A typed operand, one per addressing mode.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum Operand {
    /// `rN`
    Reg(Register),
    /// `(rN)`
    Deferred(Register),
    /// `(rN)+`
    AutoInc(Register),
    /// `-(rN)`
    AutoDec(Register),
    /// `d(rN)`
    Indexed(i64, Register),
    /// `@d(rN)`
    IndexedDeferred(i64, Register),
    /// `#n`
    Immediate(i64),
    /// `@#addr`
    Absolute(u64),
    /// A resolved branch, jump or call destination
    Target(u64),
}

impl Operand {
    /// The register the operand addresses through, if any
    pub fn register(&self) -> Option<Register> {
        match self {
            Operand::Reg(r)
            | Operand::Deferred(r)
            | Operand::AutoInc(r)
            | Operand::AutoDec(r)
            | Operand::Indexed(_, r)
            | Operand::IndexedDeferred(_, r) => Some(*r),
            Operand::Immediate(_) | Operand::Absolute(_) | Operand::Target(_) => None,
        }
    }

    /// The register modified as a side effect of evaluating the operand
    pub fn side_effect_register(&self) -> Option<Register> {
        match self {
            Operand::AutoInc(r) | Operand::AutoDec(r) => Some(*r),
            _ => None,
        }
    }

    /// A literal address the operand refers to, for jumps and calls
    pub fn static_address(&self) -> Option<u64> {
        match self {
            Operand::Target(a) | Operand::Absolute(a) => Some(*a),
            _ => None,
        }
    }

    fn extension_words(&self, mnemonic: &Mnemonic) -> u64 {
        match self {
            Operand::Immediate(_)
            | Operand::Indexed(..)
            | Operand::IndexedDeferred(..)
            | Operand::Absolute(_) => 1,
            Operand::Target(_) => match mnemonic {
                Mnemonic::Jsr | Mnemonic::Jmp | Mnemonic::Case => 1,
                _ => 0,
            },
            Operand::Reg(_) | Operand::Deferred(_) | Operand::AutoInc(_) | Operand::AutoDec(_) => {
                0
            }
        }
    }
}

impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "{}", r),
            Operand::Deferred(r) => write!(f, "({})", r),
            Operand::AutoInc(r) => write!(f, "({})+", r),
            Operand::AutoDec(r) => write!(f, "-({})", r),
            Operand::Indexed(d, r) => write!(f, "{}({})", d, r),
            Operand::IndexedDeferred(d, r) => write!(f, "@{}({})", d, r),
            Operand::Immediate(v) => write!(f, "#{}", v),
            Operand::Absolute(a) => write!(f, "@#{:#06x}", a),
            Operand::Target(a) => write!(f, "{:#06x}", a),
        }
    }
}

/// The kind of a control-flow edge leaving an instruction
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, PartialOrd, Ord)]
pub enum FlowKind {
    /// Fall-through into the next instruction
    Normal,
    /// Subroutine call; never leaves the calling function
    Call,
    Conditional,
    Unconditional,
}

/// A control-flow edge. `to` is `None` when the destination is not statically known.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Flow {
    pub kind: FlowKind,
    pub to: Option<u64>,
}

impl Flow {
    pub fn normal(to: u64) -> Self {
        Flow {
            kind: FlowKind::Normal,
            to: Some(to),
        }
    }
}

/// Structural problem with an instruction
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid `{mnemonic}` at {addr:#x}: {reason}")]
pub struct InvalidInstruction {
    pub addr: u64,
    pub mnemonic: String,
    pub reason: String,
}

/// A single decoded machine instruction.
#[derive(Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Address of the first byte
    pub lo: u64,
    /// Address one past the last byte, including any inline dispatch table
    pub hi: u64,
    pub mnemonic: Mnemonic,
    pub width: Width,
    pub operands: Vec<Operand>,
    /// Control-flow edges leaving the instruction
    pub flow_out: Vec<Flow>,
}

impl std::fmt::Debug for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Instruction {{ lo: {:#x}, hi: {:#x}, text: {:?}, flow: {:?} }}",
            self.lo,
            self.hi,
            self.to_string(),
            self.flow_out
        )
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}{}", self.mnemonic.name(), self.width.suffix())?;
        for (i, op) in self.operands.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { " " } else { "," }, op)?;
        }
        Ok(())
    }
}

impl Instruction {
    /// Build an instruction at `lo`, computing its extent and control flow from its encoding.
    pub fn new(lo: u64, mnemonic: Mnemonic, width: Width, operands: Vec<Operand>) -> Self {
        let words = 1 + operands
            .iter()
            .map(|op| op.extension_words(&mnemonic))
            .sum::<u64>();
        let mut ins = Instruction {
            lo,
            hi: lo + 2 * words,
            mnemonic,
            width,
            operands,
            flow_out: vec![],
        };
        ins.flow_out = ins.derive_flow_out();
        ins
    }

    /// The same instruction with substituted operands. Extent is kept (the encoding has not
    /// changed, only what we know about it); control flow is re-derived.
    pub fn with_operands(&self, operands: Vec<Operand>) -> Self {
        let mut ins = Instruction {
            operands,
            flow_out: vec![],
            ..self.clone()
        };
        ins.flow_out = ins.derive_flow_out();
        ins
    }

    fn derive_flow_out(&self) -> Vec<Flow> {
        let next = Flow::normal(self.hi);
        let target = |i: usize| self.operands.get(i).and_then(Operand::static_address);
        match &self.mnemonic {
            Mnemonic::Bcc(_) | Mnemonic::Sob => vec![
                next,
                Flow {
                    kind: FlowKind::Conditional,
                    to: target(self.operands.len().saturating_sub(1)),
                },
            ],
            Mnemonic::Br => vec![Flow {
                kind: FlowKind::Unconditional,
                to: target(0),
            }],
            Mnemonic::Jmp => vec![Flow {
                kind: FlowKind::Unconditional,
                to: target(0),
            }],
            Mnemonic::Jsr => vec![
                Flow {
                    kind: FlowKind::Call,
                    to: target(1),
                },
                next,
            ],
            Mnemonic::Rts | Mnemonic::Trap => vec![],
            Mnemonic::Case => self
                .operands
                .iter()
                .skip(1)
                .map(|op| Flow {
                    kind: FlowKind::Unconditional,
                    to: op.static_address(),
                })
                .collect(),
            _ => vec![next],
        }
    }

    /// Position of the operand written by the instruction, if any
    pub fn destination_index(&self) -> Option<usize> {
        match self.mnemonic {
            Mnemonic::Mov | Mnemonic::Add | Mnemonic::Sub | Mnemonic::Lea => Some(1),
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Clr => Some(0),
            _ => None,
        }
        .filter(|&i| i < self.operands.len())
    }

    /// The operand written by the instruction, if any
    pub fn destination(&self) -> Option<&Operand> {
        self.operands.get(self.destination_index()?)
    }

    /// Number of times the instruction modifies register `r`, either as its destination or
    /// through an auto-increment/decrement side effect.
    pub fn register_writes(&self, r: Register) -> usize {
        let direct = match (&self.mnemonic, self.destination()) {
            (_, Some(Operand::Reg(d))) if *d == r => 1,
            (Mnemonic::Sob, _) if self.operands.first() == Some(&Operand::Reg(r)) => 1,
            _ => 0,
        };
        direct
            + self
                .operands
                .iter()
                .filter(|op| op.side_effect_register() == Some(r))
                .count()
    }

    /// Does any operand address through register `r`
    pub fn mentions(&self, r: Register) -> bool {
        self.operands.iter().any(|op| op.register() == Some(r))
    }

    pub fn is_return(&self) -> bool {
        self.mnemonic == Mnemonic::Rts
    }

    /// Confirms the instruction is structurally sensible for its mnemonic.
    pub fn try_confirm_valid(&self) -> Result<(), InvalidInstruction> {
        let fail = |reason: &str| {
            Err(InvalidInstruction {
                addr: self.lo,
                mnemonic: self.mnemonic.name().to_owned(),
                reason: reason.to_owned(),
            })
        };
        let ops = &self.operands;
        let writable = |op: &Operand| !matches!(op, Operand::Immediate(_) | Operand::Target(_));
        let is_target = |op: &Operand| matches!(op, Operand::Target(_));
        let callable = |op: &Operand| !matches!(op, Operand::Reg(_) | Operand::Immediate(_));
        match &self.mnemonic {
            Mnemonic::Mov | Mnemonic::Add | Mnemonic::Sub => {
                if ops.len() != 2 {
                    return fail("expected two operands");
                }
                if is_target(&ops[0]) {
                    return fail("source must be a data operand");
                }
                if !writable(&ops[1]) {
                    return fail("destination must be writable");
                }
            }
            Mnemonic::Cmp | Mnemonic::Chk => {
                if ops.len() != 2 || ops.iter().any(is_target) {
                    return fail("expected two data operands");
                }
            }
            Mnemonic::Lea => {
                if ops.len() != 2 {
                    return fail("expected two operands");
                }
                if matches!(ops[0], Operand::Reg(_) | Operand::Immediate(_) | Operand::Target(_))
                {
                    return fail("source must be a memory reference");
                }
                if !writable(&ops[1]) {
                    return fail("destination must be writable");
                }
            }
            Mnemonic::Inc | Mnemonic::Dec | Mnemonic::Clr | Mnemonic::Tst => {
                if ops.len() != 1 || is_target(&ops[0]) {
                    return fail("expected one data operand");
                }
                if self.mnemonic != Mnemonic::Tst && !writable(&ops[0]) {
                    return fail("operand must be writable");
                }
            }
            Mnemonic::Sob => {
                if !matches!(&ops[..], [Operand::Reg(_), Operand::Target(_)]) {
                    return fail("expected register and loop target");
                }
            }
            Mnemonic::Br | Mnemonic::Bcc(_) => {
                if !matches!(&ops[..], [Operand::Target(_)]) {
                    return fail("expected a branch target");
                }
            }
            Mnemonic::Jsr => {
                if !matches!(&ops[..], [Operand::Reg(_), op] if callable(op)) {
                    return fail("expected linkage register and call destination");
                }
            }
            Mnemonic::Jmp => {
                if !matches!(&ops[..], [op] if callable(op)) {
                    return fail("expected a jump destination");
                }
            }
            Mnemonic::Rts => {
                if !matches!(&ops[..], [Operand::Reg(_)]) {
                    return fail("expected linkage register");
                }
            }
            Mnemonic::Trap => {
                if !matches!(&ops[..], [] | [Operand::Immediate(_)]) {
                    return fail("expected optional trap code");
                }
            }
            Mnemonic::Sev => {
                if !ops.is_empty() {
                    return fail("takes no operands");
                }
            }
            Mnemonic::Case => {
                if ops.len() < 2 || is_target(&ops[0]) || !ops[1..].iter().all(is_target) {
                    return fail("expected selector and dispatch targets");
                }
            }
            Mnemonic::Other(_) => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_flow() {
        let ins = Instruction::new(
            0x100,
            Mnemonic::Mov,
            Width::Word,
            vec![Operand::Immediate(3), Operand::Indexed(-4, Register::FP)],
        );
        assert_eq!(ins.hi, 0x106);
        assert_eq!(ins.flow_out, vec![Flow::normal(0x106)]);
        assert_eq!(ins.to_string(), "mov #3,-4(fp)");

        let sob = Instruction::new(
            0x200,
            Mnemonic::Sob,
            Width::Word,
            vec![Operand::Reg(Register(2)), Operand::Target(0x1fc)],
        );
        assert_eq!(sob.hi, 0x202);
        assert_eq!(sob.flow_out[1].kind, FlowKind::Conditional);
        assert_eq!(sob.flow_out[1].to, Some(0x1fc));
        assert_eq!(sob.register_writes(Register(2)), 1);

        let case = Instruction::new(
            0x300,
            Mnemonic::Case,
            Width::Word,
            vec![
                Operand::Reg(Register(0)),
                Operand::Target(0x310),
                Operand::Target(0x320),
            ],
        );
        assert_eq!(case.hi, 0x306);
        assert_eq!(case.flow_out.len(), 2);
        assert!(case.flow_out.iter().all(|f| f.kind == FlowKind::Unconditional));
    }

    #[test]
    fn mnemonic_suffixes() {
        assert_eq!(Mnemonic::from_name("movb"), (Mnemonic::Mov, Width::Byte));
        assert_eq!(Mnemonic::from_name("sub"), (Mnemonic::Sub, Width::Word));
        assert_eq!(Mnemonic::from_name("clrl"), (Mnemonic::Clr, Width::Long));
        assert_eq!(
            Mnemonic::from_name("blos"),
            (Mnemonic::Bcc(Condition::Los), Width::Word)
        );
        assert_eq!(
            Mnemonic::from_name("halt"),
            (Mnemonic::Other("halt".into()), Width::Word)
        );
    }

    #[test]
    fn validity() {
        let bad = Instruction::new(0, Mnemonic::Mov, Width::Word, vec![Operand::Immediate(1)]);
        assert!(bad.try_confirm_valid().is_err());
        let jsr = Instruction::new(
            0,
            Mnemonic::Jsr,
            Width::Word,
            vec![Operand::Reg(Register::PC), Operand::Deferred(Register(3))],
        );
        assert!(jsr.try_confirm_valid().is_ok());
        assert_eq!(jsr.flow_out[0].to, None);
        let resolved =
            jsr.with_operands(vec![Operand::Reg(Register::PC), Operand::Absolute(0x4000)]);
        assert_eq!(resolved.flow_out[0].to, Some(0x4000));
        assert_eq!(resolved.hi, jsr.hi);
    }

    #[test]
    fn validity_reasons() {
        let reason = |ops| {
            Instruction::new(0, Mnemonic::Mov, Width::Word, ops)
                .try_confirm_valid()
                .unwrap_err()
                .reason
        };
        assert_eq!(
            reason(vec![Operand::Target(0x1000), Operand::Reg(Register(0))]),
            "source must be a data operand"
        );
        assert_eq!(
            reason(vec![Operand::Reg(Register(0)), Operand::Immediate(1)]),
            "destination must be writable"
        );
    }
}
