//! In-memory loop-avoidance chain.

use crate::address::Subnet;
use crate::firewall::{
    Allow, CatchAll, ChainRule, Firewall, FirewallError, Result, RuleMatch, RuleOp,
};
use smoltcp::wire::EthernetAddress;
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Default)]
struct FirewallState {
    catch_all: Option<CatchAll>,
    rules: Vec<ChainRule>,
    next_handle: u64,
    commits: usize,
    uninstalls: usize,
}

impl FirewallState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// Fake firewall. Clones share the same chain.
#[derive(Debug, Clone, Default)]
pub struct FakeFirewall {
    state: Rc<RefCell<FirewallState>>,
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installed catch-all, `None` when the chain is not installed.
    pub fn catch_all(&self) -> Option<CatchAll> {
        self.state.borrow().catch_all
    }

    pub fn rules_snapshot(&self) -> Vec<ChainRule> {
        self.state.borrow().rules.clone()
    }

    pub fn allows_link(&self, link: EthernetAddress) -> bool {
        self.state.borrow().rules.iter().any(|rule| rule.accepts_from(link))
    }

    pub fn allows_destination(&self, destination: Subnet) -> bool {
        self.state
            .borrow()
            .rules
            .iter()
            .any(|rule| rule.accepts_towards(destination))
    }

    /// Number of transactions committed through `commit`.
    pub fn commits(&self) -> usize {
        self.state.borrow().commits
    }

    pub fn uninstalls(&self) -> usize {
        self.state.borrow().uninstalls
    }
}

impl Firewall for FakeFirewall {
    fn install(&mut self, catch_all: CatchAll) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let handle = state.handle();
        state.rules = vec![ChainRule {
            handle,
            matcher: RuleMatch::Divert,
            comment: None,
        }];
        state.catch_all = Some(catch_all);
        Ok(())
    }

    fn uninstall(&mut self) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.rules.clear();
        state.catch_all = None;
        state.uninstalls += 1;
        Ok(())
    }

    fn rules(&mut self) -> Result<Vec<ChainRule>> {
        Ok(self.rules_snapshot())
    }

    fn commit(&mut self, ops: &[RuleOp]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        // Validate first: a transaction applies entirely or not at all
        for op in ops {
            if let RuleOp::Delete(handle) = op
                && !state.rules.iter().any(|rule| rule.handle == *handle)
            {
                return Err(FirewallError::NftFailed(format!("no rule with handle {handle}")));
            }
        }
        for op in ops {
            match op {
                RuleOp::Insert(allow) => {
                    let handle = state.handle();
                    let matcher = match allow {
                        Allow::FromPredecessor { link, .. } => RuleMatch::FromLink(*link),
                        Allow::Towards(destination) => RuleMatch::Towards(*destination),
                    };
                    state.rules.insert(
                        0,
                        ChainRule {
                            handle,
                            matcher,
                            comment: Some(allow.comment()),
                        },
                    );
                }
                RuleOp::Delete(handle) => state.rules.retain(|rule| rule.handle != *handle),
            }
        }
        state.commits += 1;
        Ok(())
    }
}
