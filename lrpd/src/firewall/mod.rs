//! Loop-avoidance firewall chain.
//!
//! Forwarded traffic is redirected into a dedicated chain holding accept
//! rules for legitimate predecessors (by source MAC) and destinations (by
//! subnet), followed by a catch-all diverting everything else to NFQUEUE.

pub mod nft;

pub use nft::NftFirewall;

use crate::address::{self, Address, Subnet};
use smoltcp::wire::EthernetAddress;
use std::io;
use thiserror::Error;

/// Firewall errors.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("Failed to execute nft command: {0}")]
    Command(io::Error),

    #[error("nft command failed: {0}")]
    NftFailed(String),

    #[error("unreadable nft listing: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FirewallError>;

/// What the trailing catch-all rule diverts to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchAll {
    /// Every forwarded packet not accepted earlier in the chain.
    Everything,
    /// Only packets destined to the given network. Used by the sink, which
    /// forwards anything else along an external default route.
    Towards(Subnet),
}

/// The match part of a rule of the dedicated chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleMatch {
    /// Accept traffic sent by this link-layer address.
    FromLink(EthernetAddress),
    /// Accept traffic destined to this subnet.
    Towards(Subnet),
    /// Divert to the queue.
    Divert,
    Other,
}

/// A rule currently present in the dedicated chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRule {
    /// nft rule handle, used for deletion.
    pub handle: u64,
    pub matcher: RuleMatch,
    pub comment: Option<String>,
}

impl ChainRule {
    pub fn accepts_from(&self, link: EthernetAddress) -> bool {
        self.matcher == RuleMatch::FromLink(link)
    }

    pub fn accepts_towards(&self, destination: Subnet) -> bool {
        self.matcher == RuleMatch::Towards(destination)
    }

    pub fn has_comment(&self, comment: &str) -> bool {
        self.comment.as_deref() == Some(comment)
    }
}

/// An accept rule to insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allow {
    /// Traffic forwarded on behalf of `predecessor`, identified by its MAC.
    FromPredecessor {
        link: EthernetAddress,
        predecessor: Address,
    },
    /// Traffic towards a known destination.
    Towards(Subnet),
}

impl Allow {
    /// Comment naming the allowed address, carried by the inserted rule.
    pub fn comment(&self) -> String {
        match self {
            Allow::FromPredecessor { predecessor, .. } => predecessor_comment(*predecessor),
            Allow::Towards(destination) => {
                format!("allow towards destination {}", address::display(destination))
            }
        }
    }
}

/// Comment of the rule allowing `predecessor`.
pub fn predecessor_comment(predecessor: Address) -> String {
    format!("allow from predecessor {predecessor}")
}

/// One step of a chain transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOp {
    /// Insert at the head of the chain, ahead of the catch-all.
    Insert(Allow),
    /// Delete the rule with this handle.
    Delete(u64),
}

/// The dedicated chain and its redirect from the host forward chain.
pub trait Firewall {
    /// Create (or reuse and flush) the chain, replace any stale redirect,
    /// and append the catch-all. One transaction.
    fn install(&mut self, catch_all: CatchAll) -> Result<()>;

    /// Remove the redirect, then flush and delete the chain. One transaction.
    fn uninstall(&mut self) -> Result<()>;

    /// Current rules of the dedicated chain, head first.
    fn rules(&mut self) -> Result<Vec<ChainRule>>;

    /// Apply `ops` atomically.
    fn commit(&mut self, ops: &[RuleOp]) -> Result<()>;
}
