//! Strict finite-state machines described as data.
//!
//! A [`MachineConfig`] lists transitions `(from, event) -> to` with an optional named guard and
//! named actions. [`Machine::new`] resolves every name against a [`Behaviors`] registry up front,
//! so a typo in the table fails at construction instead of at the first transition. The
//! [`Interpreter`] is strict: an event with no matching transition, or whose guard rejects, is an
//! error and leaves the state untouched.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

type Guard<C> = Box<dyn Fn(&C) -> bool + Send + Sync>;
type Action<C, S> = Box<dyn Fn(&mut C, S) + Send + Sync>;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum FsmError {
    #[error("machine `{machine}` references unknown action `{name}`")]
    UnknownAction { machine: String, name: String },
    #[error("machine `{machine}` references unknown guard `{name}`")]
    UnknownGuard { machine: String, name: String },
    #[error("machine `{machine}` declares `{state}` --{event}--> twice")]
    DuplicateTransition {
        machine: String,
        state: String,
        event: String,
    },
    #[error("machine `{machine}`: no transition for event `{event}` from state `{state}`")]
    NoTransition {
        machine: String,
        state: String,
        event: String,
    },
    #[error("machine `{machine}`: guard `{guard}` rejected `{event}` from state `{state}`")]
    GuardRejected {
        machine: String,
        state: String,
        event: String,
        guard: String,
    },
}

#[derive(Debug, Clone)]
pub struct Transition<S, E> {
    pub from: S,
    pub event: E,
    pub to: S,
    pub guard: Option<&'static str>,
    pub actions: Vec<&'static str>,
}

impl<S, E> Transition<S, E> {
    pub fn new(from: S, event: E, to: S) -> Self {
        Self {
            from,
            event,
            to,
            guard: None,
            actions: Vec::new(),
        }
    }

    pub fn guarded(mut self, guard: &'static str) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn action(mut self, action: &'static str) -> Self {
        self.actions.push(action);
        self
    }
}

#[derive(Debug, Clone)]
pub struct MachineConfig<S, E> {
    pub id: String,
    pub initial: S,
    pub transitions: Vec<Transition<S, E>>,
}

/// Named guard predicates and actions a machine may reference.
pub struct Behaviors<C, S> {
    guards: HashMap<&'static str, Guard<C>>,
    actions: HashMap<&'static str, Action<C, S>>,
}

impl<C, S> Default for Behaviors<C, S> {
    fn default() -> Self {
        Self {
            guards: HashMap::new(),
            actions: HashMap::new(),
        }
    }
}

impl<C, S> Behaviors<C, S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn guard<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&C) -> bool + Send + Sync + 'static,
    {
        self.guards.insert(name, Box::new(f));
        self
    }

    /// Actions receive the context and the state being entered.
    pub fn action<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: Fn(&mut C, S) + Send + Sync + 'static,
    {
        self.actions.insert(name, Box::new(f));
        self
    }
}

pub struct Machine<S, E, C> {
    id: String,
    initial: S,
    table: HashMap<(S, E), Transition<S, E>>,
    behaviors: Behaviors<C, S>,
}

impl<S, E, C> Machine<S, E, C>
where
    S: Copy + Eq + Hash + fmt::Display,
    E: Copy + Eq + Hash + fmt::Display,
{
    pub fn new(config: MachineConfig<S, E>, behaviors: Behaviors<C, S>) -> Result<Self, FsmError> {
        let mut table = HashMap::with_capacity(config.transitions.len());
        let mut seen = HashSet::new();
        for transition in config.transitions {
            if let Some(guard) = transition.guard {
                if !behaviors.guards.contains_key(guard) {
                    return Err(FsmError::UnknownGuard {
                        machine: config.id.clone(),
                        name: guard.to_string(),
                    });
                }
            }
            for action in &transition.actions {
                if !behaviors.actions.contains_key(action) {
                    return Err(FsmError::UnknownAction {
                        machine: config.id.clone(),
                        name: action.to_string(),
                    });
                }
            }
            let key = (transition.from, transition.event);
            if !seen.insert(key) {
                return Err(FsmError::DuplicateTransition {
                    machine: config.id.clone(),
                    state: transition.from.to_string(),
                    event: transition.event.to_string(),
                });
            }
            table.insert(key, transition);
        }
        Ok(Self {
            id: config.id,
            initial: config.initial,
            table,
            behaviors,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn initial(&self) -> S {
        self.initial
    }

    /// Whether `event` is accepted from `state`, ignoring guards.
    pub fn can(&self, state: S, event: E) -> bool {
        self.table.contains_key(&(state, event))
    }

    fn step(&self, state: S, event: E, ctx: &mut C) -> Result<S, FsmError> {
        let transition = self
            .table
            .get(&(state, event))
            .ok_or_else(|| FsmError::NoTransition {
                machine: self.id.clone(),
                state: state.to_string(),
                event: event.to_string(),
            })?;
        if let Some(name) = transition.guard {
            let allowed = self
                .behaviors
                .guards
                .get(name)
                .map(|guard| guard(ctx))
                .unwrap_or(false);
            if !allowed {
                return Err(FsmError::GuardRejected {
                    machine: self.id.clone(),
                    state: state.to_string(),
                    event: event.to_string(),
                    guard: name.to_string(),
                });
            }
        }
        for name in &transition.actions {
            if let Some(action) = self.behaviors.actions.get(name) {
                action(ctx, transition.to);
            }
        }
        Ok(transition.to)
    }
}

/// One running instance of a [`Machine`]; cheap to create, shares the validated table.
pub struct Interpreter<S, E, C> {
    machine: Arc<Machine<S, E, C>>,
    state: S,
}

impl<S, E, C> Interpreter<S, E, C>
where
    S: Copy + Eq + Hash + fmt::Display,
    E: Copy + Eq + Hash + fmt::Display,
{
    pub fn new(machine: Arc<Machine<S, E, C>>) -> Self {
        let state = machine.initial();
        Self { machine, state }
    }

    /// Start from an explicit state, e.g. when restoring persisted records.
    pub fn resume_at(machine: Arc<Machine<S, E, C>>, state: S) -> Self {
        Self { machine, state }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn send(&mut self, event: E, ctx: &mut C) -> Result<S, FsmError> {
        let next = self.machine.step(self.state, event, ctx)?;
        self.state = next;
        Ok(next)
    }

    /// Move to `state` without consulting the table or running actions.
    pub fn force(&mut self, state: S) {
        self.state = state;
    }
}
