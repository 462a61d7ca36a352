/*
[INPUT]:  TaskState of one (user, task) worker, TaskAction enum
[OUTPUT]: Validated lifecycle transitions
[POS]:    Task domain logic - state machine for worker lifecycle
[UPDATE]: When lifecycle states or allowed transitions change
*/

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// Actions that can trigger lifecycle transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskAction {
    Start,
    Started,
    Stop,
    Stopped,
    Fail(String),
}

/// Errors occurring during state transitions
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("Invalid transition: {from:?} -> {action:?}")]
    InvalidTransition { from: TaskState, action: TaskAction },
}

/// Lifecycle of one scheduled worker.
#[derive(Debug, Clone)]
pub struct TaskStateMachine {
    current_state: TaskState,
    last_error: Option<String>,
}

impl Default for TaskStateMachine {
    fn default() -> Self {
        Self::new(TaskState::Stopped)
    }
}

impl TaskStateMachine {
    pub fn new(initial: TaskState) -> Self {
        Self {
            current_state: initial,
            last_error: None,
        }
    }

    pub fn can_transition(&self, action: &TaskAction) -> bool {
        self.next_state(action).is_some()
    }

    fn next_state(&self, action: &TaskAction) -> Option<TaskState> {
        match (self.current_state, action) {
            (TaskState::Stopped | TaskState::Failed, TaskAction::Start) => Some(TaskState::Starting),
            (TaskState::Starting, TaskAction::Started) => Some(TaskState::Running),
            (TaskState::Starting | TaskState::Running, TaskAction::Stop) => Some(TaskState::Stopping),
            (TaskState::Stopping, TaskAction::Stopped) => Some(TaskState::Stopped),
            (
                TaskState::Starting | TaskState::Running | TaskState::Stopping,
                TaskAction::Fail(_),
            ) => Some(TaskState::Failed),
            _ => None,
        }
    }

    pub fn transition(&mut self, action: TaskAction) -> Result<TaskState, StateError> {
        let Some(next_state) = self.next_state(&action) else {
            return Err(StateError::InvalidTransition {
                from: self.current_state,
                action,
            });
        };

        match action {
            TaskAction::Fail(reason) => self.last_error = Some(reason),
            TaskAction::Start => self.last_error = None,
            _ => {}
        }
        self.current_state = next_state;
        Ok(next_state)
    }

    pub fn state(&self) -> TaskState {
        self.current_state
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let machine = TaskStateMachine::default();
        assert_eq!(machine.state(), TaskState::Stopped);
    }

    #[test]
    fn test_full_lifecycle() {
        let mut machine = TaskStateMachine::default();
        assert_eq!(machine.transition(TaskAction::Start).unwrap(), TaskState::Starting);
        assert_eq!(machine.transition(TaskAction::Started).unwrap(), TaskState::Running);
        assert_eq!(machine.transition(TaskAction::Stop).unwrap(), TaskState::Stopping);
        assert_eq!(machine.transition(TaskAction::Stopped).unwrap(), TaskState::Stopped);
    }

    #[test]
    fn test_failure_and_restart() {
        let mut machine = TaskStateMachine::new(TaskState::Running);
        machine
            .transition(TaskAction::Fail("broker session refused".to_string()))
            .unwrap();
        assert_eq!(machine.state(), TaskState::Failed);
        assert_eq!(machine.last_error(), Some("broker session refused"));

        assert_eq!(machine.transition(TaskAction::Start).unwrap(), TaskState::Starting);
        assert!(machine.last_error().is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut machine = TaskStateMachine::default();
        assert!(!machine.can_transition(&TaskAction::Stop));
        let err = machine.transition(TaskAction::Started).unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: TaskState::Stopped,
                ..
            }
        ));

        let mut running = TaskStateMachine::new(TaskState::Running);
        assert!(running.transition(TaskAction::Start).is_err());
        assert_eq!(running.state(), TaskState::Running);
    }
}
