//! Action type to factory table
//!
//! The registry is built once at startup and shared read-only afterwards.
//! Building it is the only place where a duplicate registration can be
//! detected, so [`ActionRegistryBuilder::build`] fails instead of silently
//! keeping one of the factories.

use std::collections::HashMap;
use std::time::Duration;

use arango_common::crd::{ActionType, PlanAction};
use arango_common::{Error, Result};

use super::decorators::{StartFailureGracePeriod, TimeoutOverride};
use super::Action;

/// Builds an action from its persisted entry
pub type ActionFactory = fn(PlanAction) -> Result<Box<dyn Action>>;

#[derive(Clone, Copy)]
struct Registration {
    factory: ActionFactory,
    timeout: Option<Duration>,
    grace: Option<Duration>,
}

/// Immutable table of runnable action types
pub struct ActionRegistry {
    factories: HashMap<ActionType, Registration>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("types", &self.factories.len())
            .finish()
    }
}

impl ActionRegistry {
    /// Start an empty registry
    pub fn builder() -> ActionRegistryBuilder {
        ActionRegistryBuilder::default()
    }

    /// Registry holding the full action catalogue
    ///
    /// `grace` is the start failure grace period of every action that was
    /// not registered with one of its own.
    pub fn standard(grace: Duration) -> Result<Self> {
        let mut builder = Self::builder();
        builder.default_grace(grace);
        super::member::register(&mut builder, grace);
        super::cleanout::register(&mut builder, grace);
        super::rotate::register(&mut builder, grace);
        super::storage::register(&mut builder, grace);
        super::security::register(&mut builder, grace);
        super::cluster::register(&mut builder, grace);
        builder.build()
    }

    /// Returns true if the type can be executed
    pub fn is_registered(&self, type_: &ActionType) -> bool {
        self.factories.contains_key(type_)
    }

    /// Number of registered types
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Returns true if nothing is registered
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Build the action for a plan entry
    ///
    /// Unknown types are a skew between plan and registry and surface as
    /// [`Error::UnknownAction`].
    pub fn create(&self, entry: &PlanAction) -> Result<Box<dyn Action>> {
        let registration = self
            .factories
            .get(&entry.type_)
            .ok_or_else(|| Error::unknown_action(entry.type_.as_str()))?;

        let mut action = (registration.factory)(entry.clone())?;
        if let Some(grace) = registration.grace {
            action = Box::new(StartFailureGracePeriod::new(action, grace));
        }
        if let Some(timeout) = registration.timeout {
            action = Box::new(TimeoutOverride::new(action, timeout));
        }
        Ok(action)
    }
}

/// Collects registrations for an [`ActionRegistry`]
#[derive(Default)]
pub struct ActionRegistryBuilder {
    registrations: Vec<(ActionType, Registration)>,
    default_grace: Option<Duration>,
}

impl ActionRegistryBuilder {
    /// Start failure grace period of registrations that do not set one
    pub fn default_grace(&mut self, grace: Duration) -> &mut Self {
        self.default_grace = Some(grace);
        self
    }

    /// Register a factory
    pub fn register(&mut self, type_: ActionType, factory: ActionFactory) -> &mut Self {
        self.push(type_, factory, None, None)
    }

    /// Register a factory with a fixed deadline instead of the spec lookup
    pub fn register_with_timeout(
        &mut self,
        type_: ActionType,
        factory: ActionFactory,
        timeout: Duration,
    ) -> &mut Self {
        self.push(type_, factory, Some(timeout), None)
    }

    /// Register a factory whose start failures are retried within `grace`
    pub fn register_with_grace(
        &mut self,
        type_: ActionType,
        factory: ActionFactory,
        grace: Duration,
    ) -> &mut Self {
        self.push(type_, factory, None, Some(grace))
    }

    fn push(
        &mut self,
        type_: ActionType,
        factory: ActionFactory,
        timeout: Option<Duration>,
        grace: Option<Duration>,
    ) -> &mut Self {
        self.registrations.push((
            type_,
            Registration {
                factory,
                timeout,
                grace,
            },
        ));
        self
    }

    /// Freeze the registrations
    pub fn build(self) -> Result<ActionRegistry> {
        let mut factories = HashMap::with_capacity(self.registrations.len());
        for (type_, mut registration) in self.registrations {
            registration.grace = registration.grace.or(self.default_grace);
            if let ActionType::Unknown(name) = &type_ {
                return Err(Error::unknown_action(name.clone()));
            }
            if factories.insert(type_.clone(), registration).is_some() {
                return Err(Error::duplicate_action(type_.as_str()));
            }
        }
        Ok(ActionRegistry { factories })
    }
}
