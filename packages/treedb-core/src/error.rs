use thiserror::Error;

use crate::ids::{NodeId, SessionId};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("moving {node} under {parent} would create a cycle")]
    Cycle { node: NodeId, parent: NodeId },
    #[error("resource is held by session {held_by}")]
    Conflict { held_by: SessionId },
    #[error("session expired: {0}")]
    Expired(String),
    #[error("storage error: {0}")]
    Store(String),
    #[error("renumber of children of {parent} aborted in phase {phase}: {reason}")]
    RenumberAborted {
        parent: String,
        phase: u8,
        reason: String,
    },
}

impl Error {
    pub(crate) fn node_not_found(id: NodeId) -> Self {
        Error::NotFound(format!("node {id}"))
    }
}
