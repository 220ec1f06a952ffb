// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{AgentError, Result};
use std::fmt;
use tokio::sync::watch;
use tracing::info;

/// Process-level agent state.
///
/// `Failed` and `Stopped` are terminal. `Failed` is reachable from `Starting`
/// and `Running` only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
	Idle,
	Starting,
	Running,
	ShuttingDown,
	Stopped,
	Failed,
}

impl AgentState {
	pub fn can_transition_to(self, next: AgentState) -> bool {
		use AgentState::*;
		matches!(
			(self, next),
			(Idle, Starting)
				| (Starting, Running)
				| (Starting, Failed)
				| (Running, ShuttingDown)
				| (Running, Failed)
				| (ShuttingDown, Stopped)
		)
	}

	pub fn is_terminal(self) -> bool {
		matches!(self, AgentState::Stopped | AgentState::Failed)
	}

	/// States in which the agent counts as the live instance for its identity.
	pub fn is_live(self) -> bool {
		matches!(self, AgentState::Starting | AgentState::Running)
	}
}

impl fmt::Display for AgentState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			AgentState::Idle => "idle",
			AgentState::Starting => "starting",
			AgentState::Running => "running",
			AgentState::ShuttingDown => "shutting_down",
			AgentState::Stopped => "stopped",
			AgentState::Failed => "failed",
		};
		f.write_str(name)
	}
}

/// Owns the current state and publishes every accepted transition.
#[derive(Debug)]
pub struct StateMachine {
	tx: watch::Sender<AgentState>,
}

impl StateMachine {
	pub fn new() -> Self {
		let (tx, _rx) = watch::channel(AgentState::Idle);
		Self { tx }
	}

	pub fn current(&self) -> AgentState {
		*self.tx.borrow()
	}

	pub fn subscribe(&self) -> watch::Receiver<AgentState> {
		self.tx.subscribe()
	}

	pub fn transition(&self, next: AgentState) -> Result<()> {
		let from = self.current();
		if !from.can_transition_to(next) {
			return Err(AgentError::InvalidTransition { from, to: next });
		}
		self.tx.send_replace(next);
		info!(%from, to = %next, "agent state changed");
		Ok(())
	}
}

impl Default for StateMachine {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn happy_path_transitions() {
		let machine = StateMachine::new();
		for next in [
			AgentState::Starting,
			AgentState::Running,
			AgentState::ShuttingDown,
			AgentState::Stopped,
		] {
			machine.transition(next).unwrap();
		}
		assert_eq!(machine.current(), AgentState::Stopped);
		assert!(machine.current().is_terminal());
	}

	#[test]
	fn failed_reachable_from_starting_and_running_only() {
		assert!(AgentState::Starting.can_transition_to(AgentState::Failed));
		assert!(AgentState::Running.can_transition_to(AgentState::Failed));
		assert!(!AgentState::Idle.can_transition_to(AgentState::Failed));
		assert!(!AgentState::ShuttingDown.can_transition_to(AgentState::Failed));
		assert!(!AgentState::Stopped.can_transition_to(AgentState::Failed));
	}

	#[test]
	fn failed_is_absorbing() {
		for next in [
			AgentState::Idle,
			AgentState::Starting,
			AgentState::Running,
			AgentState::ShuttingDown,
			AgentState::Stopped,
		] {
			assert!(!AgentState::Failed.can_transition_to(next));
		}
	}

	#[test]
	fn illegal_transition_is_rejected() {
		let machine = StateMachine::new();
		let err = machine.transition(AgentState::Running).unwrap_err();
		assert!(matches!(
			err,
			AgentError::InvalidTransition {
				from: AgentState::Idle,
				to: AgentState::Running
			}
		));
		assert_eq!(machine.current(), AgentState::Idle);
	}

	#[test]
	fn subscribers_observe_transitions() {
		let machine = StateMachine::new();
		let rx = machine.subscribe();
		machine.transition(AgentState::Starting).unwrap();
		assert_eq!(*rx.borrow(), AgentState::Starting);
	}

	#[test]
	fn rejected_transition_does_not_notify() {
		let machine = StateMachine::new();
		let mut rx = machine.subscribe();
		assert!(machine.transition(AgentState::Stopped).is_err());
		assert!(!rx.has_changed().unwrap());

		machine.transition(AgentState::Starting).unwrap();
		tokio_test::block_on(rx.changed()).unwrap();
		assert_eq!(*rx.borrow_and_update(), AgentState::Starting);
	}
}
