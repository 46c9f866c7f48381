//! Name → agent lookup.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cognition::Cognition;
use crate::parrot::Parrot;

/// The expert registry used by the router, the orchestrator, and the turn
/// service.
#[derive(Default)]
pub struct ExpertRegistry {
    experts: RwLock<HashMap<String, Arc<dyn Parrot>>>,
}

impl ExpertRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent under its own name. Re-registering replaces the
    /// previous instance.
    pub fn register(&self, parrot: Arc<dyn Parrot>) {
        let name = parrot.name().to_string();
        tracing::debug!(agent = %name, "expert registered");
        self.experts.write().insert(name, parrot);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Parrot>> {
        self.experts.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.experts.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn cognitions(&self) -> Vec<Cognition> {
        let mut cognitions: Vec<Cognition> = self
            .experts
            .read()
            .values()
            .map(|p| p.self_describe())
            .collect();
        cognitions.sort_by(|a, b| a.name.cmp(&b.name));
        cognitions
    }

    pub fn len(&self) -> usize {
        self.experts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.experts.read().is_empty()
    }
}
