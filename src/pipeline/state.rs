use serde::Serialize;
use std::fmt;

use crate::error::{EtlError, Result};

/// Lifecycle of one run. `Loading` is re-entered for every block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum PipelineState {
    Pending,
    PragmaConfigured,
    Loading,
    Indexing,
    Done,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Failed)
    }

    pub fn can_advance_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Pending, PragmaConfigured) => true,
            (PragmaConfigured, Loading) | (Loading, Loading) => true,
            // Every input can be empty or already loaded.
            (PragmaConfigured, Indexing) | (Loading, Indexing) => true,
            (Indexing, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if !self.can_advance_to(next) {
            return Err(EtlError::State(format!("illegal transition {self} -> {next}")));
        }
        *self = next;
        Ok(())
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::PipelineState::*;
    use super::*;

    #[test]
    fn happy_path() {
        let mut s = Pending;
        for next in [PragmaConfigured, Loading, Loading, Loading, Indexing, Done] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn no_blocks_goes_straight_to_indexing() {
        let mut s = PragmaConfigured;
        s.advance(Indexing).unwrap();
    }

    #[test]
    fn illegal_transitions_are_errors() {
        let mut s = Pending;
        let err = s.advance(Loading).unwrap_err();
        assert!(err.to_string().contains("Pending -> Loading"));
        assert_eq!(s, Pending);

        let mut done = Done;
        assert!(done.advance(Failed).is_err());
        assert!(done.advance(Loading).is_err());

        let mut indexing = Indexing;
        assert!(indexing.advance(Loading).is_err());
    }

    #[test]
    fn any_live_state_can_fail() {
        for from in [Pending, PragmaConfigured, Loading, Indexing] {
            let mut s = from;
            s.advance(Failed).unwrap();
            assert!(Failed.is_terminal());
        }
    }
}
