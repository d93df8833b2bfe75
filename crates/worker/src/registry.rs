//! Name → handler routing.

use std::collections::HashMap;
use std::sync::Arc;

use crate::handler::JobHandler;

/// Handlers keyed by job name.
///
/// Resolution order: exact name, then the longest matching `prefix.*`
/// pattern, then the `*` catch-all.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    exact: HashMap<String, Arc<dyn JobHandler>>,
    prefixes: Vec<(String, Arc<dyn JobHandler>)>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut names: Vec<&str> = self.exact.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("exact", &names)
            .field(
                "prefixes",
                &self.prefixes.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            )
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`: an exact name, `prefix.*` or `*`.
    /// A later registration for the same pattern replaces the earlier one.
    pub fn register(mut self, pattern: &str, handler: impl JobHandler + 'static) -> Self {
        self.insert(pattern, Arc::new(handler));
        self
    }

    pub fn insert(&mut self, pattern: &str, handler: Arc<dyn JobHandler>) {
        if pattern == "*" {
            self.fallback = Some(handler);
        } else if let Some(prefix) = pattern.strip_suffix('*') {
            let prefix = prefix.to_string();
            self.prefixes.retain(|(p, _)| *p != prefix);
            self.prefixes.push((prefix, handler));
            // Longest prefix first.
            self.prefixes.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        } else {
            self.exact.insert(pattern.to_string(), handler);
        }
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        if let Some(handler) = self.exact.get(name) {
            return Some(handler.clone());
        }
        self.prefixes
            .iter()
            .find(|(prefix, _)| name.starts_with(prefix.as_str()))
            .map(|(_, handler)| handler.clone())
            .or_else(|| self.fallback.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty() && self.fallback.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{HandlerError, JobContext, handler_fn};
    use serde_json::{Value, json};

    fn tagged(tag: &'static str) -> impl JobHandler {
        handler_fn(move |_ctx: JobContext| async move { Ok::<Value, HandlerError>(json!(tag)) })
    }

    async fn run(registry: &HandlerRegistry, name: &str) -> Option<Value> {
        let handler = registry.resolve(name)?;
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let job = jobforge_protocol::ExecuteJob {
            job_id: jobforge_core::JobId::new(),
            queue: "q".into(),
            name: name.into(),
            payload: Value::Null,
            attempt: 1,
            max_attempts: 1,
        };
        handler.handle(JobContext::new(job, tx)).await.ok()
    }

    #[tokio::test]
    async fn exact_then_prefix_then_fallback() {
        let registry = HandlerRegistry::new()
            .register("email.send", tagged("exact"))
            .register("email.*", tagged("email"))
            .register("email.bulk.*", tagged("bulk"))
            .register("*", tagged("any"));

        assert_eq!(run(&registry, "email.send").await, Some(json!("exact")));
        assert_eq!(run(&registry, "email.digest").await, Some(json!("email")));
        assert_eq!(run(&registry, "email.bulk.weekly").await, Some(json!("bulk")));
        assert_eq!(run(&registry, "report").await, Some(json!("any")));
    }

    #[tokio::test]
    async fn unknown_name_without_fallback() {
        let registry = HandlerRegistry::new().register("a", tagged("a"));
        assert!(registry.resolve("b").is_none());
        assert!(!registry.is_empty());
        assert!(HandlerRegistry::new().is_empty());
    }
}
