//! Control-plane errors.
//!
//! Only `start`/`stop`/`execute`/`dump` return errors. The sampling path
//! never propagates one: it drops the sample and bumps a counter instead.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProfilerError {
    /// Bad or conflicting command tokens. Exit code 100.
    #[error("{0}")]
    InvalidArgument(String),

    /// The engine cannot run in this environment: a required runtime symbol,
    /// timer API or privilege is missing.
    #[error("{0}")]
    Feasibility(String),

    /// Hook or breakpoint installation failed after feasibility passed.
    #[error("{0}")]
    Install(String),

    /// The command is valid but cannot be executed in the current state.
    /// Exit code 200.
    #[error("{0}")]
    CommandFailed(String),

    #[error("output error: {0}")]
    Output(#[from] io::Error),
}

impl ProfilerError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ProfilerError::InvalidArgument(msg.into())
    }

    pub fn feasibility(msg: impl Into<String>) -> Self {
        ProfilerError::Feasibility(msg.into())
    }

    pub fn install(msg: impl Into<String>) -> Self {
        ProfilerError::Install(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        ProfilerError::CommandFailed(msg.into())
    }

    /// Process exit code for launchers: 0 success, 100 bad arguments,
    /// 200 command failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProfilerError::InvalidArgument(_) => 100,
            _ => 200,
        }
    }
}

pub type Result<T> = std::result::Result<T, ProfilerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes() {
        assert_eq!(ProfilerError::invalid("x").exit_code(), 100);
        assert_eq!(ProfilerError::failed("x").exit_code(), 200);
        assert_eq!(ProfilerError::feasibility("x").exit_code(), 200);
    }
}
