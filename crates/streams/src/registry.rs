use {
    super::plugin::StreamRunner,
    std::{collections::HashMap, sync::Arc},
};

/// Stream runners keyed by plugin id.
#[derive(Clone, Default)]
pub struct RunnerRegistry {
    runners: HashMap<String, Arc<dyn StreamRunner>>,
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the runner for a plugin, replacing any previous one.
    pub fn register(&mut self, plugin_id: impl Into<String>, runner: Arc<dyn StreamRunner>) {
        self.runners.insert(plugin_id.into(), runner);
    }

    #[must_use]
    pub fn with_runner(mut self, plugin_id: impl Into<String>, runner: Arc<dyn StreamRunner>) -> Self {
        self.register(plugin_id, runner);
        self
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<dyn StreamRunner>> {
        self.runners.get(plugin_id).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.runners.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
