//! Saga definitions and their compiled state machine.

use crate::config::SagaEngineConfig;
use crate::error::{Error, Result};
use crate::retry::RetryPolicy;
use crate::step::SagaStep;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

/// Name of the state before the first step.
pub const INITIAL_STATE: &str = "initial";

/// Finite state machine compiled from the step list.
///
/// States are `initial` plus `step_<name>` for every step; the only event
/// accepted in a state is `execute_<next step>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine {
    states: Vec<String>,
    transitions: HashMap<(String, String), String>,
}

impl StateMachine {
    pub fn compile<'a>(step_names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut states = vec![INITIAL_STATE.to_string()];
        let mut transitions = HashMap::new();
        let mut previous = INITIAL_STATE.to_string();

        for name in step_names {
            let state = Self::state_for(name);
            transitions.insert((previous, Self::event_for(name)), state.clone());
            states.push(state.clone());
            previous = state;
        }

        Self {
            states,
            transitions,
        }
    }

    pub fn state_for(step_name: &str) -> String {
        format!("step_{}", step_name)
    }

    pub fn event_for(step_name: &str) -> String {
        format!("execute_{}", step_name)
    }

    pub fn initial_state(&self) -> &str {
        INITIAL_STATE
    }

    pub fn states(&self) -> &[String] {
        &self.states
    }

    pub fn can_fire(&self, state: &str, event: &str) -> bool {
        self.transitions
            .contains_key(&(state.to_string(), event.to_string()))
    }

    /// Target state of `event` in `state`.
    pub fn fire(&self, state: &str, event: &str) -> Result<&str> {
        self.transitions
            .get(&(state.to_string(), event.to_string()))
            .map(String::as_str)
            .ok_or_else(|| {
                Error::invalid_state(format!(
                    "event '{}' is not allowed in state '{}'",
                    event, state
                ))
                .with_context("state", state)
                .with_context("event", event)
            })
    }
}

/// Immutable, reusable description of a saga: an ordered list of steps.
///
/// Step order is execution order; compensation runs in reverse.
pub struct SagaDefinition {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
    retry_policy: Option<RetryPolicy>,
    default_step_timeout: Option<Duration>,
    state_machine: StateMachine,
}

impl std::fmt::Debug for SagaDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SagaDefinition")
            .field("name", &self.name)
            .field("steps", &self.step_names())
            .field("retry_policy", &self.retry_policy)
            .field("default_step_timeout", &self.default_step_timeout)
            .finish()
    }
}

impl SagaDefinition {
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            name: name.into(),
            steps: Vec::new(),
            retry_policy: None,
            default_step_timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Arc<dyn SagaStep>] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&Arc<dyn SagaStep>> {
        self.steps.get(index)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Policy for steps that carry none of their own.
    pub fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry_policy.as_ref()
    }

    pub fn default_step_timeout(&self) -> Option<Duration> {
        self.default_step_timeout
    }

    pub fn state_machine(&self) -> &StateMachine {
        &self.state_machine
    }
}

pub struct SagaDefinitionBuilder {
    name: String,
    steps: Vec<Arc<dyn SagaStep>>,
    retry_policy: Option<RetryPolicy>,
    default_step_timeout: Option<Duration>,
}

impl SagaDefinitionBuilder {
    pub fn step<S: SagaStep + 'static>(mut self, step: S) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn step_arc(mut self, step: Arc<dyn SagaStep>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = Some(timeout);
        self
    }

    /// Fill unset defaults from the engine configuration.
    pub fn with_engine_defaults(mut self, config: &SagaEngineConfig) -> Self {
        if self.retry_policy.is_none() {
            self.retry_policy = config.default_retry_policy.clone();
        }
        if self.default_step_timeout.is_none() {
            self.default_step_timeout = config.default_step_timeout;
        }
        self
    }

    pub fn build(self) -> Result<SagaDefinition> {
        if self.name.trim().is_empty() {
            return Err(Error::validation("name", "saga name must not be empty"));
        }
        if self.steps.is_empty() {
            return Err(
                Error::validation("steps", "saga must have at least one step")
                    .with_context("saga", self.name),
            );
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            let name = step.name();
            if name.trim().is_empty() {
                return Err(Error::validation("steps", "step name must not be empty")
                    .with_context("saga", self.name));
            }
            if !seen.insert(name) {
                return Err(Error::validation(
                    "steps",
                    &format!("duplicate step name '{}'", name),
                )
                .with_context("saga", self.name.clone()));
            }
        }

        let state_machine = StateMachine::compile(self.steps.iter().map(|s| s.name()));

        Ok(SagaDefinition {
            name: self.name,
            steps: self.steps,
            retry_policy: self.retry_policy,
            default_step_timeout: self.default_step_timeout,
            state_machine,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::SequentialStep;

    fn noop(name: &str) -> SequentialStep {
        SequentialStep::builder(name)
            .execute(|_| async { Ok(()) })
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_keeps_step_order() {
        let definition = SagaDefinition::builder("order")
            .step(noop("reserve_inventory"))
            .step(noop("charge_payment"))
            .step(noop("ship"))
            .build()
            .unwrap();

        assert_eq!(definition.name(), "order");
        assert_eq!(
            definition.step_names(),
            vec!["reserve_inventory", "charge_payment", "ship"]
        );
        assert_eq!(definition.len(), 3);
    }

    #[test]
    fn test_builder_validation() {
        assert!(SagaDefinition::builder("").step(noop("a")).build().is_err());
        assert!(SagaDefinition::builder("empty").build().is_err());

        let err = SagaDefinition::builder("dup")
            .step(noop("a"))
            .step(noop("a"))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("duplicate step name 'a'"));
    }

    #[test]
    fn test_state_machine_is_linear() {
        let definition = SagaDefinition::builder("order")
            .step(noop("reserve"))
            .step(noop("charge"))
            .build()
            .unwrap();
        let fsm = definition.state_machine();

        assert_eq!(fsm.states(), &["initial", "step_reserve", "step_charge"]);
        assert_eq!(fsm.fire("initial", "execute_reserve").unwrap(), "step_reserve");
        assert_eq!(fsm.fire("step_reserve", "execute_charge").unwrap(), "step_charge");

        assert!(!fsm.can_fire("initial", "execute_charge"));
        assert!(fsm.fire("step_charge", "execute_reserve").is_err());
    }

    #[test]
    fn test_engine_defaults_do_not_override() {
        let config = SagaEngineConfig::default()
            .with_default_retry_policy(RetryPolicy::new(4, Duration::from_millis(5), 1.0))
            .with_default_step_timeout(Duration::from_secs(3));

        let definition = SagaDefinition::builder("order")
            .step(noop("a"))
            .default_step_timeout(Duration::from_secs(1))
            .with_engine_defaults(&config)
            .build()
            .unwrap();

        assert_eq!(definition.retry_policy().map(|p| p.max_attempts), Some(4));
        assert_eq!(definition.default_step_timeout(), Some(Duration::from_secs(1)));
    }
}
