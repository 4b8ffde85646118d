//! Function discovery and the outer analysis fixpoint.
//!
//! A [`Session`] owns everything that accumulates over an analysis run: the provider, the
//! function table, the call graph and the diagnostics. It is only ever appended to.

use std::collections::BTreeMap;

use crate::analysis_config::CONFIG;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::function::{CallSite, Function};
use crate::idioms::is_frame_setup;
use crate::isa::Instruction;
use crate::log::*;
use crate::provider::InstructionProvider;
use crate::pseudo_ops::Resolution;

/// All calls sharing a destination
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CalledFunction {
    pub destination: u64,
    pub label: Option<String>,
    pub sites: Vec<CallSite>,
}

pub struct Session<P: InstructionProvider> {
    pub provider: P,
    /// Functions keyed by entry address
    pub functions: BTreeMap<u64, Function>,
    /// Call graph, keyed by destination
    pub called: BTreeMap<u64, CalledFunction>,
    /// Calls whose destination could not be determined
    pub unresolved_calls: Vec<CallSite>,
    pub diagnostics: Diagnostics,
    pub passes: usize,
}

impl<P: InstructionProvider> Session<P> {
    pub fn new(provider: P) -> Self {
        Session {
            provider,
            functions: BTreeMap::new(),
            called: BTreeMap::new(),
            unresolved_calls: vec![],
            diagnostics: Diagnostics::new(),
            passes: 0,
        }
    }

    /// The function whose range contains `addr`
    pub fn function_containing(&self, addr: u64) -> Option<&Function> {
        self.functions
            .range(..=addr)
            .next_back()
            .map(|(_, f)| f)
            .filter(|f| f.contains(addr))
    }

    /// Collect the body of a function starting at `entry`: contiguous instructions up to and
    /// including the first return, decoding on demand whenever a gap is hit.
    fn collect_body(&mut self, entry: u64) -> Vec<Instruction> {
        let mut insns: Vec<Instruction> = vec![];
        let mut addr = entry;
        loop {
            if self.provider.instruction_at(addr).is_none() && !self.provider.request_decode(addr)
            {
                debug!("Function body ends at undecodable address";
                       "entry" => Addr(entry), "addr" => Addr(addr));
                break;
            }
            let ins = match self.provider.instruction_at(addr) {
                Some(ins) => ins.clone(),
                None => break,
            };
            addr = ins.hi;
            let done = ins.is_return();
            insns.push(ins);
            if done {
                break;
            }
        }
        insns
    }

    /// Scan decoded code for frame setups not yet claimed by a function. Returns the number of
    /// new functions.
    pub fn scan(&mut self) -> usize {
        let mut found = 0;
        for addr in self.provider.decoded_addresses() {
            if self.function_containing(addr).is_some() {
                continue;
            }
            let is_entry = match self.provider.instruction_at(addr) {
                Some(save) => self
                    .provider
                    .instruction_at(save.hi)
                    .map_or(false, |set| is_frame_setup(save, set)),
                None => false,
            };
            if !is_entry {
                continue;
            }
            let f = Function::new(self.collect_body(addr));
            let name = self.provider.label_at(addr).map(str::to_owned);
            debug!("Discovered function";
                   "entry" => Addr(addr),
                   "end" => Addr(f.hi),
                   OptionalKV("name", name));
            assert!(!self.functions.contains_key(&addr));
            self.functions.insert(addr, f);
            found += 1;
        }
        found
    }

    /// Analyze every function not yet analyzed and register its calls. Returns the number of
    /// call destinations seen for the first time.
    pub fn analyze_pending(&mut self) -> usize {
        let mut sites = vec![];
        for f in self.functions.values_mut() {
            if f.discovered || f.failed {
                continue;
            }
            f.analyze(&mut self.provider, &mut self.diagnostics);
            sites.extend(f.calls.iter().cloned());
        }
        sites
            .into_iter()
            .filter(|site| self.register_call(site.clone()))
            .count()
    }

    /// Record `site` in the call graph and make sure its destination gets decoded. Returns
    /// whether the destination is new.
    fn register_call(&mut self, site: CallSite) -> bool {
        let dest = match site.destination {
            Resolution::Known(d) => d,
            _ => {
                self.diagnostics
                    .report(site.caller, Diagnostic::UnresolvedCall { addr: site.addr });
                self.unresolved_calls.push(site);
                return false;
            }
        };
        let new = !self.called.contains_key(&dest);
        let entry = self.called.entry(dest).or_insert_with(|| CalledFunction {
            destination: dest,
            label: site.label.clone(),
            sites: vec![],
        });
        entry.sites.push(site.clone());
        if new
            && self.provider.runtime_routine(dest).is_none()
            && self.provider.instruction_at(dest).is_none()
            && !self.provider.request_decode(dest)
        {
            self.diagnostics.report(
                site.caller,
                Diagnostic::UndecodableTarget {
                    addr: site.addr,
                    target: dest,
                },
            );
        }
        new
    }

    /// Alternate scanning and analysis until a pass finds neither new functions nor new call
    /// targets.
    pub fn run(&mut self) {
        loop {
            if self.passes >= CONFIG.max_discovery_passes {
                warn!("Discovery did not converge"; "passes" => self.passes);
                break;
            }
            self.passes += 1;
            let new_functions = self.scan();
            let new_targets = self.analyze_pending();
            info!("Discovery pass";
                  "pass" => self.passes,
                  "new_functions" => new_functions,
                  "new_targets" => new_targets);
            if new_functions == 0 && new_targets == 0 {
                break;
            }
        }
    }
}
