//! A lifter from exported textual disassembly listings.
//!
//! A listing consists of sections separated by blank lines:
//!
//! ```text
//! LISTING <name>
//!
//! MEMORY
//! <hexaddr>: <hex bytes ...>
//!
//! RUNTIME
//! <hexaddr> <routine-name>
//!
//! LABELS
//! <hexaddr> <label>
//!
//! ENTRY <hexaddr> [<hexaddr> ...]
//!
//! CODE
//! <hexaddr> <mnemonic> <operands>   ; optional comment
//! ```
//!
//! Only `LISTING` and `CODE` are mandatory. Operand numbers are decimal unless prefixed by
//! `0x`. Code is added to the image undecoded; only the `ENTRY` addresses are decoded at load.

use itertools::Itertools;

use crate::isa::{Instruction, InvalidInstruction, Mnemonic, Operand, Register};
use crate::log::*;
use crate::provider::{InstructionProvider, Listing};

#[derive(Debug, thiserror::Error)]
pub enum LiftError {
    #[error("listing must start with a `LISTING <name>` header")]
    MissingHeader,
    #[error("listing has no CODE section")]
    MissingCode,
    #[error("line {line}: unknown section `{text}`")]
    UnknownSection { line: usize, text: String },
    #[error("line {line}: bad number `{text}`")]
    BadNumber { line: usize, text: String },
    #[error("line {line}: unknown register `{text}`")]
    UnknownRegister { line: usize, text: String },
    #[error("line {line}: malformed operand `{text}`")]
    MalformedOperand { line: usize, text: String },
    #[error("line {line}: malformed line `{text}`")]
    MalformedLine { line: usize, text: String },
    #[error("line {line}: {source}")]
    InvalidInstruction {
        line: usize,
        #[source]
        source: InvalidInstruction,
    },
    #[error("line {line}: instruction at {addr:#06x} overlaps the one at {other:#06x}")]
    Overlap { line: usize, addr: u64, other: u64 },
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Section {
    Header,
    Memory,
    Runtime,
    Labels,
    Entry,
    Code,
}

/// Lift a textual listing into an in-memory image.
pub fn lift_from(text: &str) -> Result<Listing, LiftError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim_end()))
        .skip_while(|(_, l)| l.trim().is_empty());

    let name = match lines.next() {
        Some((_, l)) => l
            .strip_prefix("LISTING")
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .ok_or(LiftError::MissingHeader)?,
        None => return Err(LiftError::MissingHeader),
    };
    let mut listing = Listing::new(name);
    let mut entries: Vec<u64> = vec![];
    let mut seen_code = false;

    let mut section = Section::Header;
    for (line, l) in lines {
        let l = l.trim();
        if l.is_empty() {
            section = Section::Header;
            continue;
        }
        let malformed = || LiftError::MalformedLine {
            line,
            text: l.to_owned(),
        };
        match section {
            Section::Header => {
                let (header, rest) = l.split_once(' ').unwrap_or((l, ""));
                section = match header {
                    "MEMORY" => Section::Memory,
                    "RUNTIME" => Section::Runtime,
                    "LABELS" => Section::Labels,
                    "ENTRY" => Section::Entry,
                    "CODE" => {
                        seen_code = true;
                        Section::Code
                    }
                    _ => {
                        return Err(LiftError::UnknownSection {
                            line,
                            text: l.to_owned(),
                        })
                    }
                };
                if section == Section::Entry {
                    for a in rest.split_whitespace() {
                        entries.push(parse_address(line, a)?);
                    }
                } else if !rest.trim().is_empty() {
                    return Err(malformed());
                }
            }
            Section::Memory => {
                let (addr, bytes) = l.split_once(':').ok_or_else(malformed)?;
                let addr = parse_address(line, addr.trim())?;
                let bytes = bytes
                    .split_whitespace()
                    .map(|b| {
                        u8::from_str_radix(b, 16).map_err(|_| LiftError::BadNumber {
                            line,
                            text: b.to_owned(),
                        })
                    })
                    .collect::<Result<Vec<u8>, _>>()?;
                listing.add_memory(addr, bytes);
            }
            Section::Runtime | Section::Labels => {
                let (addr, name) = l.split_whitespace().collect_tuple().ok_or_else(malformed)?;
                let addr = parse_address(line, addr)?;
                if section == Section::Runtime {
                    listing.add_runtime_routine(addr, name.to_owned());
                } else {
                    listing.set_label(addr, name.to_owned());
                }
            }
            Section::Entry => {
                for a in l.split_whitespace() {
                    entries.push(parse_address(line, a)?);
                }
            }
            Section::Code => {
                let (code, comment) = match l.split_once(';') {
                    Some((c, comment)) => (c.trim(), Some(comment.trim())),
                    None => (l, None),
                };
                let ins = parse_instruction(line, code)?;
                ins.try_confirm_valid()
                    .map_err(|source| LiftError::InvalidInstruction { line, source })?;
                let addr = ins.lo;
                listing
                    .add_code(ins)
                    .map_err(|other| LiftError::Overlap { line, addr, other })?;
                if let Some(c) = comment.filter(|c| !c.is_empty()) {
                    listing.set_comment(addr, c.to_owned());
                }
            }
        }
    }

    if !seen_code {
        return Err(LiftError::MissingCode);
    }
    for e in entries {
        if !listing.request_decode(e) {
            warn!("Entry point has no code"; "addr" => Addr(e));
        }
    }
    info!("Lifted listing"; "name" => &listing.name, "instructions" => listing.code_len());
    Ok(listing)
}

fn parse_address(line: usize, s: &str) -> Result<u64, LiftError> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|_| LiftError::BadNumber {
        line,
        text: s.to_owned(),
    })
}

/// Decimal, or hex with a `0x` prefix; either may be negated
fn parse_number(line: usize, s: &str) -> Result<i64, LiftError> {
    let (neg, digits) = match s.strip_prefix('-') {
        Some(d) => (true, d),
        None => (false, s),
    };
    let v = match digits.strip_prefix("0x") {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|_| LiftError::BadNumber {
        line,
        text: s.to_owned(),
    })?;
    Ok(if neg { -v } else { v })
}

fn parse_register(line: usize, s: &str) -> Result<Register, LiftError> {
    Register::from_name(s).ok_or_else(|| LiftError::UnknownRegister {
        line,
        text: s.to_owned(),
    })
}

fn parse_operand(line: usize, s: &str) -> Result<Operand, LiftError> {
    let malformed = || LiftError::MalformedOperand {
        line,
        text: s.to_owned(),
    };
    if let Some(addr) = s.strip_prefix("@#") {
        let a = parse_number(line, addr)?;
        return u64::try_from(a).map(Operand::Absolute).map_err(|_| malformed());
    }
    if let Some(imm) = s.strip_prefix('#') {
        return Ok(Operand::Immediate(parse_number(line, imm)?));
    }
    if let Some(r) = s.strip_prefix("-(").and_then(|r| r.strip_suffix(')')) {
        return Ok(Operand::AutoDec(parse_register(line, r)?));
    }
    if let Some(r) = s.strip_prefix('(').and_then(|r| r.strip_suffix(")+")) {
        return Ok(Operand::AutoInc(parse_register(line, r)?));
    }
    if let Some(r) = s.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        return Ok(Operand::Deferred(parse_register(line, r)?));
    }
    if let Some((disp, r)) = s.strip_suffix(')').and_then(|x| x.split_once('(')) {
        let reg = parse_register(line, r)?;
        return Ok(match disp.strip_prefix('@') {
            Some(d) => Operand::IndexedDeferred(parse_number(line, d)?, reg),
            None => Operand::Indexed(parse_number(line, disp)?, reg),
        });
    }
    if let Some(r) = Register::from_name(s) {
        return Ok(Operand::Reg(r));
    }
    let a = parse_number(line, s)?;
    u64::try_from(a).map(Operand::Target).map_err(|_| malformed())
}

fn parse_instruction(line: usize, s: &str) -> Result<Instruction, LiftError> {
    let mut parts = s.split_whitespace();
    let (addr, mnemonic) = match (parts.next(), parts.next()) {
        (Some(a), Some(m)) => (parse_address(line, a)?, m),
        _ => {
            return Err(LiftError::MalformedLine {
                line,
                text: s.to_owned(),
            })
        }
    };
    let operands: String = parts.collect();
    let operands = if operands.is_empty() {
        vec![]
    } else {
        operands
            .split(',')
            .map(|o| parse_operand(line, o))
            .collect::<Result<Vec<_>, _>>()?
    };
    let (mnemonic, width) = Mnemonic::from_name(mnemonic);
    Ok(Instruction::new(addr, mnemonic, width, operands))
}
