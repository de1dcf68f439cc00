use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

/// Edge leaving a state. `name` labels the processing step in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub name: String,
    pub destination: String,
}

impl Transition {
    pub fn new(name: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub name: String,
    pub transition: Option<Transition>,
    #[serde(default)]
    pub initial: bool,
}

impl State {
    pub fn new(name: impl Into<String>, transition: Option<Transition>) -> Self {
        Self {
            name: name.into(),
            transition,
            initial: false,
        }
    }

    pub fn initial(name: impl Into<String>, transition: Option<Transition>) -> Self {
        Self {
            name: name.into(),
            transition,
            initial: true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.transition.is_none()
    }
}

/// Declarative chain of named states linked by single-successor transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    name: String,
    states: Vec<State>,
}

impl Pipeline {
    /// Validates the chain: one initial state, unique names, transitions that
    /// point at registered states and never loop back.
    pub fn new(name: impl Into<String>, states: Vec<State>) -> Result<Self, SyncError> {
        let pipeline = Self {
            name: name.into(),
            states,
        };
        pipeline.validate()?;
        Ok(pipeline)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn states(&self) -> &[State] {
        &self.states
    }

    pub fn initial_state(&self) -> Result<&State, SyncError> {
        self.states
            .iter()
            .find(|state| state.initial)
            .ok_or_else(|| {
                SyncError::Configuration(format!("pipeline {} has no initial state", self.name))
            })
    }

    pub fn state(&self, name: &str) -> Result<&State, SyncError> {
        self.states
            .iter()
            .find(|state| state.name == name)
            .ok_or_else(|| {
                SyncError::NotFound(format!("state {name} in pipeline {}", self.name))
            })
    }

    /// Successor of `state`, or `None` when it is terminal.
    pub fn next_state(&self, state: &State) -> Result<Option<&State>, SyncError> {
        match &state.transition {
            Some(transition) => self.state(&transition.destination).map(Some),
            None => Ok(None),
        }
    }

    fn validate(&self) -> Result<(), SyncError> {
        let initial_count = self.states.iter().filter(|state| state.initial).count();
        if initial_count != 1 {
            return Err(SyncError::Configuration(format!(
                "pipeline {} must have exactly one initial state (found {initial_count})",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for state in &self.states {
            if !names.insert(state.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "duplicate state {} in pipeline {}",
                    state.name, self.name
                )));
            }
        }

        for state in &self.states {
            if let Some(transition) = &state.transition {
                if !names.contains(transition.destination.as_str()) {
                    return Err(SyncError::Configuration(format!(
                        "transition {} targets unknown state {}",
                        transition.name, transition.destination
                    )));
                }
            }
        }

        let mut visited = HashSet::new();
        let mut current = Some(self.initial_state()?);
        while let Some(state) = current {
            if !visited.insert(state.name.as_str()) {
                return Err(SyncError::Configuration(format!(
                    "pipeline {} loops back to state {}",
                    self.name, state.name
                )));
            }
            current = self.next_state(state)?;
        }
        Ok(())
    }
}
