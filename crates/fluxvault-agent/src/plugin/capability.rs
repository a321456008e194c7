//! The seam every plugin command runs behind

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::AgentResult;
use crate::plugin::storage::PluginStorage;

/// Per-session key/value state the keeper populates with `set_context`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionContext {
    values: BTreeMap<String, Value>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `values`, replacing existing keys
    pub fn merge(&mut self, values: BTreeMap<String, Value>) {
        self.values.extend(values);
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Context as a JSON object
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone().into_iter().collect())
    }
}

/// One call of a plugin command
pub struct Invocation<'a> {
    pub command: &'a str,
    pub args: Value,
    pub context: &'a SessionContext,
    /// The owning plugin's persistent storage
    pub storage: &'a PluginStorage,
}

/// Something that can execute plugin commands
#[async_trait]
pub trait Capability: Send + Sync {
    /// Run `invocation.command`, returning its JSON output
    async fn invoke(&self, invocation: Invocation<'_>) -> AgentResult<Value>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_merge_replaces_keys() {
        let mut context = SessionContext::new();
        context.merge(BTreeMap::from([
            ("region".to_string(), json!("eu")),
            ("replicas".to_string(), json!(2)),
        ]));
        context.merge(BTreeMap::from([("replicas".to_string(), json!(3))]));

        assert_eq!(context.len(), 2);
        assert_eq!(context.get("replicas"), Some(&json!(3)));
        assert_eq!(context.to_value(), json!({"region": "eu", "replicas": 3}));
    }
}
