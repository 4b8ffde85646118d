//! The seam between the analysis and whatever decodes the firmware image.
//!
//! The analysis only ever talks to an [`InstructionProvider`]. The crate ships one
//! implementation, the in-memory [`Listing`], which is fed from a textual listing (see
//! [`crate::listing_lifter`]) and simulates an on-demand decoder.

use std::collections::{BTreeMap, BTreeSet};

use crate::isa::Instruction;
use crate::log::*;

/// A raw memory read fell outside of the mapped image
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("memory unavailable at {addr:#06x} (+{len})")]
pub struct MemoryUnavailable {
    pub addr: u64,
    pub len: usize,
}

/// Source of decoded instructions and raw image bytes, as well as a sink for recovered labels
/// and comments.
pub trait InstructionProvider {
    /// The decoded instruction starting at `addr`, if `addr` has been decoded
    fn instruction_at(&self, addr: u64) -> Option<&Instruction>;

    /// Start addresses of all decoded instructions, ascending
    fn decoded_addresses(&self) -> Vec<u64>;

    /// Raw image bytes `[addr, addr+len)`
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryUnavailable>;

    fn label_at(&self, addr: u64) -> Option<&str>;

    fn set_label(&mut self, addr: u64, label: String);

    fn comment_at(&self, addr: u64) -> Option<&str>;

    fn set_comment(&mut self, addr: u64, comment: String);

    /// Ask for `addr` to be decoded. Returns `true` if `addr` holds a decoded instruction
    /// afterwards.
    fn request_decode(&mut self, addr: u64) -> bool;

    /// Name of the well-known runtime routine at `addr`, if any
    fn runtime_routine(&self, addr: u64) -> Option<&str>;
}

/// An in-memory image: every instruction the listing knows about, the subset that has been
/// decoded so far, mapped memory and the label/comment tables.
#[derive(Debug, Default)]
pub struct Listing {
    pub name: String,
    code: BTreeMap<u64, Instruction>,
    decoded: BTreeSet<u64>,
    memory: BTreeMap<u64, Vec<u8>>,
    labels: BTreeMap<u64, String>,
    comments: BTreeMap<u64, String>,
    runtime: BTreeMap<u64, String>,
}

impl Listing {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add an instruction to the image, undecoded. Fails with the address of the instruction it
    /// overlaps with, if any, in which case nothing is added.
    pub fn add_code(&mut self, ins: Instruction) -> Result<(), u64> {
        let prev = self
            .code
            .range(..=ins.lo)
            .next_back()
            .filter(|(_, p)| p.hi > ins.lo);
        let next = self
            .code
            .range(ins.lo..)
            .next()
            .filter(|(_, n)| n.lo < ins.hi);
        if let Some((&clash, _)) = prev.or(next) {
            return Err(clash);
        }
        self.code.insert(ins.lo, ins);
        Ok(())
    }

    /// Map `bytes` at `addr`. Later segments take precedence over earlier ones they overlap.
    pub fn add_memory(&mut self, addr: u64, bytes: Vec<u8>) {
        self.memory.insert(addr, bytes);
    }

    pub fn add_runtime_routine(&mut self, addr: u64, name: String) {
        self.runtime.insert(addr, name);
    }

    /// Labels and comments given in the listing and set by the analysis, ascending by address
    pub fn annotations(&self) -> impl Iterator<Item = (u64, Option<&str>, Option<&str>)> + '_ {
        let addrs: BTreeSet<u64> = self
            .labels
            .keys()
            .chain(self.comments.keys())
            .copied()
            .collect();
        addrs.into_iter().map(move |a| {
            (
                a,
                self.labels.get(&a).map(String::as_str),
                self.comments.get(&a).map(String::as_str),
            )
        })
    }

    /// Number of instructions known to the image, decoded or not
    pub fn code_len(&self) -> usize {
        self.code.len()
    }
}

impl InstructionProvider for Listing {
    fn instruction_at(&self, addr: u64) -> Option<&Instruction> {
        if self.decoded.contains(&addr) {
            self.code.get(&addr)
        } else {
            None
        }
    }

    fn decoded_addresses(&self) -> Vec<u64> {
        self.decoded.iter().copied().collect()
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, MemoryUnavailable> {
        let err = MemoryUnavailable { addr, len };
        let (base, seg) = self.memory.range(..=addr).next_back().ok_or(err.clone())?;
        let start = usize::try_from(addr - base).map_err(|_| err.clone())?;
        let end = start.checked_add(len).ok_or(err.clone())?;
        seg.get(start..end).map(<[u8]>::to_vec).ok_or(err)
    }

    fn label_at(&self, addr: u64) -> Option<&str> {
        self.labels.get(&addr).map(String::as_str)
    }

    fn set_label(&mut self, addr: u64, label: String) {
        self.labels.insert(addr, label);
    }

    fn comment_at(&self, addr: u64) -> Option<&str> {
        self.comments.get(&addr).map(String::as_str)
    }

    fn set_comment(&mut self, addr: u64, comment: String) {
        self.comments.insert(addr, comment);
    }

    /// Sweeps linearly from `addr` up to and including the next return, the way a recursive
    /// descent decoder would when pointed at a fresh procedure.
    fn request_decode(&mut self, addr: u64) -> bool {
        if !self.code.contains_key(&addr) {
            debug!("Nothing to decode"; "addr" => Addr(addr));
            return false;
        }
        let mut a = addr;
        while let Some(ins) = self.code.get(&a) {
            if !self.decoded.insert(a) {
                break;
            }
            if ins.is_return() {
                break;
            }
            a = ins.hi;
        }
        trace!("Decoded"; "from" => Addr(addr), "to" => Addr(a));
        true
    }

    fn runtime_routine(&self, addr: u64) -> Option<&str> {
        self.runtime.get(&addr).map(String::as_str)
    }
}
