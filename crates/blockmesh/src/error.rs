//! Crate-wide error type.
//!
//! One variant per contract violation, resource-exhaustion, or substrate
//! failure the core distinguishes (spec §7). A library cannot unilaterally
//! abort its host process, so the "fatal, abort with diagnostic" behavior of
//! the original implementation is realized here as a `Result::Err` the
//! caller is expected to propagate; call sites that treat one of these as
//! effectively fatal (e.g. a link naming an unresolvable rank) log it with
//! `tracing::error!` before returning it, rather than this type logging on
//! construction.

use crate::block::Gid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("gid {0} is not owned by this rank")]
    UnknownGid(Gid),

    #[error("lid {0} is out of range")]
    UnknownLid(usize),

    #[error("dequeue on empty queue from {from} to {to}")]
    EmptyQueue { from: Gid, to: Gid },

    #[error("in-memory limit ({limit}) still exceeded after forced unload ({resident} resident)")]
    ResourceExhausted { limit: usize, resident: usize },

    #[error("block serialization failed: {0}")]
    Serialization(String),

    #[error("block deserialization failed: {0}")]
    Deserialization(String),

    #[error("external storage failure: {0}")]
    Storage(#[from] std::io::Error),

    #[error("substrate failure: {0}")]
    Substrate(String),

    #[error("iexchange protocol violation: {0}")]
    IexchangeProtocol(String),

    #[error("load-balance move of gid {0} referenced an unknown source or destination rank")]
    InvalidMove(Gid),
}

pub type Result<T> = std::result::Result<T, Error>;
