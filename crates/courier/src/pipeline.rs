//! Named pipeline configuration
//!
//! A pipeline is a read-only bag of options keyed by string. Backends pull the
//! keys they understand through the typed accessors and fall back to defaults
//! for anything missing or mistyped.
//!
//! ```
//! use courier::Pipeline;
//!
//! let pipe: Pipeline = serde_json::from_str(
//!     r#"{"name": "emails", "queue": "emails", "prefetch": 8}"#,
//! ).unwrap();
//!
//! assert_eq!(pipe.name(), "emails");
//! assert_eq!(pipe.integer("prefetch", 4), 8);
//! assert_eq!(pipe.string("exchange", "amqp.direct"), "amqp.direct");
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pipeline {
    name: String,
    #[serde(flatten)]
    options: Map<String, Value>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            options: Map::new(),
        }
    }

    /// Set an option, consuming the pipeline
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn has(&self, key: &str) -> bool {
        self.options.contains_key(key)
    }

    /// String option, or `default` when absent or not a non-empty string
    pub fn string(&self, key: &str, default: &str) -> String {
        match self.options.get(key) {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            _ => default.to_string(),
        }
    }

    /// Integer option. Numeric strings are accepted.
    pub fn integer(&self, key: &str, default: i64) -> i64 {
        match self.options.get(key) {
            Some(Value::Number(n)) => n.as_i64().unwrap_or(default),
            Some(Value::String(s)) => s.trim().parse().unwrap_or(default),
            _ => default,
        }
    }
}
