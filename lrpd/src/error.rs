//! Error types for lrpd.

use crate::firewall::FirewallError;
use crate::kernel::KernelError;
use std::io;
use thiserror::Error;

/// Main error type for a node session.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}: unknown interface")]
    UnknownInterface(String),

    #[error("{0}: interface has no IPv4 address")]
    NoAddress(String),

    #[error("unable to find a usable interface")]
    NoUsableInterface,

    #[error("unable to auto-detect the interface among {0:?}, please provide one")]
    AmbiguousInterface(Vec<String>),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    #[error("firewall error: {0}")]
    Firewall(#[from] FirewallError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("system error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("protocol handler failed: {0}")]
    Protocol(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap a failure raised by the protocol collaborator.
    pub fn protocol<E>(error: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Protocol(error.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
