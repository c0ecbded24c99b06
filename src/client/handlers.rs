//! Script-keyed response hooks.
//!
//! A hook runs when a terminal response arrives for a task whose request
//! named the hook's script. Hooks are resolved by one map lookup at
//! dispatch time; the registry is populated at startup and may be extended
//! at runtime. Hook failures are logged and never reach the submitter's
//! future.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::types::TaskResponse;

/// A hook invoked on terminal responses for one script key.
///
/// The response carries typed-view helpers
/// ([`output_json`](TaskResponse::output_json),
/// [`properties_as`](TaskResponse::properties_as)) for working with the
/// opaque payloads, e.g. writing extracted results onto a persisted asset.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    /// Called with each matching terminal response.
    async fn on_response(&self, response: &TaskResponse) -> anyhow::Result<()>;
}

/// Script key → handler lookup.
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ResponseHandler>>>,
}

impl HandlerRegistry {
    pub(crate) fn register(&self, script: impl Into<String>, handler: Arc<dyn ResponseHandler>) {
        self.handlers.write().insert(script.into(), handler);
    }

    pub(crate) fn get(&self, script: &str) -> Option<Arc<dyn ResponseHandler>> {
        self.handlers.read().get(script).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskRequest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl ResponseHandler for Counting {
        async fn on_response(&self, _response: &TaskResponse) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_script_key() {
        let registry = HandlerRegistry::default();
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        registry.register("extract-equations", handler.clone());

        assert!(registry.get("extract-equations").is_some());
        assert!(registry.get("other").is_none());

        let request = TaskRequest::new("eq", "extract-equations", vec![]);
        let response = TaskResponse::success(&request, vec![]);
        registry
            .get("extract-equations")
            .unwrap()
            .on_response(&response)
            .await
            .unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn re_registration_replaces() {
        let registry = HandlerRegistry::default();
        registry.register("s", Arc::new(Counting(AtomicUsize::new(0))));
        registry.register("s", Arc::new(Counting(AtomicUsize::new(0))));
        assert!(registry.get("s").is_some());
    }
}
