use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::database::lock::LockMeta;
use crate::error::Result;
use crate::scheduler::SchedulerState;

/// The shared configuration/state document.
///
/// `config` is free-form. `scheduler` is owned by the scheduler actor.
/// `meta` is the database's own lock bookkeeping and is never taken from a
/// client write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    scheduler: SchedulerState,
    #[serde(default)]
    meta: LockMeta,
}

impl Document {
    /// Build a document from stored JSON, merged over the default so that
    /// missing sections and fields are filled in.
    pub fn from_stored(stored: Value) -> Result<Self> {
        let mut merged = serde_json::to_value(Document::default())?;
        merge(&mut merged, stored);
        Ok(serde_json::from_value(merged)?)
    }

    pub fn config(&self) -> &Map<String, Value> {
        &self.config
    }

    pub fn config_value(&self, key: &str) -> Option<&Value> {
        self.config.get(key)
    }

    pub fn with_config_value(mut self, key: impl Into<String>, value: Value) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    pub fn scheduler(&self) -> &SchedulerState {
        &self.scheduler
    }

    pub(crate) fn scheduler_mut(&mut self) -> &mut SchedulerState {
        &mut self.scheduler
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerState) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn meta(&self) -> &LockMeta {
        &self.meta
    }

    pub(crate) fn meta_mut(&mut self) -> &mut LockMeta {
        &mut self.meta
    }

    /// Take the client-owned sections of `incoming`, keeping lock state.
    pub(crate) fn replace_content(&mut self, incoming: Document) {
        self.config = incoming.config;
        self.scheduler = incoming.scheduler;
    }
}

/// Recursively overlay `overlay` onto `base`. Objects merge key by key;
/// anything else replaces.
fn merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(slot) => merge(slot, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_store_gives_default() {
        let doc = Document::from_stored(json!({})).unwrap();
        assert_eq!(doc, Document::default());
    }

    #[test]
    fn missing_sections_are_filled() {
        let doc = Document::from_stored(json!({"config": {"theme": "dark"}})).unwrap();
        assert_eq!(doc.config_value("theme"), Some(&json!("dark")));
        assert!(doc.scheduler().jobs().is_empty());
        assert!(!doc.meta().is_locked());
    }

    #[test]
    fn merge_is_recursive() {
        let mut base = json!({"a": {"x": 1, "y": 2}, "b": 3});
        merge(&mut base, json!({"a": {"y": 20, "z": 30}}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 20, "z": 30}, "b": 3}));
    }

    #[test]
    fn replace_content_keeps_lock_state() {
        let mut stored = Document::default();
        stored.meta_mut().acquire(crate::database::LockData {
            hostname: "home".into(),
            executable: "a".into(),
            args: vec![],
            pid: 1,
            response_channel: 100,
        });

        let incoming = Document::default().with_config_value("k", json!(1));
        stored.replace_content(incoming);

        assert_eq!(stored.config_value("k"), Some(&json!(1)));
        assert!(stored.meta().is_locked());
    }
}
