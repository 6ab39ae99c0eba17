//! Scheduler registry: name → factory lookup.
//!
//! The process-wide registry is built once, on first use, and is read-only
//! afterwards. Embedders and tests that need extra scheduler types build
//! their own registry before dispatch begins and hand it to the workers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use keelson_state::StateSnapshot;
use tracing::debug;

use crate::error::{SchedulerError, SchedulerResult};
use crate::generic::GenericScheduler;
use crate::scheduler::{Factory, Planner, Scheduler};
use crate::system::SystemScheduler;

/// Scheduler type for long-running services.
pub const SERVICE: &str = "service";
/// Scheduler type for run-to-completion batch work.
pub const BATCH: &str = "batch";
/// Scheduler type for one-per-node system work.
pub const SYSTEM: &str = "system";

static BUILTIN: OnceLock<SchedulerRegistry> = OnceLock::new();

/// Maps scheduler type names to their factories.
#[derive(Clone, Default)]
pub struct SchedulerRegistry {
    factories: BTreeMap<String, Factory>,
}

impl SchedulerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the builtin `service`, `batch` and `system` schedulers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, Factory); 3] = [
            (SERVICE, GenericScheduler::service),
            (BATCH, GenericScheduler::batch),
            (SYSTEM, SystemScheduler::factory),
        ];
        for (name, factory) in builtins {
            registry.factories.insert(name.to_string(), factory);
        }
        registry
    }

    /// The process-wide builtin registry.
    pub fn builtin() -> &'static SchedulerRegistry {
        BUILTIN.get_or_init(Self::with_builtins)
    }

    /// Register a factory under `name`. Names are unique.
    pub fn register(&mut self, name: impl Into<String>, factory: Factory) -> SchedulerResult<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(SchedulerError::DuplicateScheduler(name));
        }
        debug!(scheduler = %name, "scheduler registered");
        self.factories.insert(name, factory);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Build a scheduler of type `name`. Fails without side effects if the
    /// name is unknown.
    pub fn instantiate(
        &self,
        name: &str,
        state: StateSnapshot,
        planner: Arc<dyn Planner>,
    ) -> SchedulerResult<Box<dyn Scheduler>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| SchedulerError::UnknownScheduler(name.to_string()))?;
        Ok(factory(state, planner))
    }
}

impl fmt::Debug for SchedulerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerRegistry")
            .field("names", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
