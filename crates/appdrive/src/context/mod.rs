//! Execution contexts: the native app UI plus any embedded web views.
//!
//! The [`ContextEngine`] owns the [`ContextRegistry`]. It refreshes the
//! registry with a discovery probe sent through the dispatch queue, selects
//! contexts by name or by title, and runs the bounded web view navigation.

pub mod debugger;
pub mod navigation;
pub mod registry;

pub use debugger::{NoopRemoteDebugger, RemoteDebugger};
pub use navigation::{
    EntryStrategy, NAVIGATION_TICK, NAVIGATION_TIMEOUT, NavigationBudget, NavigationTarget,
};
pub use registry::{BlankPagePolicy, ContextRegistry};

use crate::dispatch::{CommandQueue, GateCondition, GateFlags};
use crate::{DriverError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

pub const NATIVE_CONTEXT: &str = "NATIVE_APP";
pub const WEBVIEW_PREFIX: &str = "WEBVIEW_";

/// Probe that enumerates the web views the engine can see.
pub const DISCOVERY_PROBE: &str = "au.getWebviews()";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebContext {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
}

impl WebContext {
    pub fn is_blank(&self) -> bool {
        self.url.is_empty() || self.url == "about:blank"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionContext {
    Native,
    WebView(WebContext),
}

impl ExecutionContext {
    pub fn name(&self) -> String {
        match self {
            ExecutionContext::Native => NATIVE_CONTEXT.to_string(),
            ExecutionContext::WebView(web) => format!("{}{}", WEBVIEW_PREFIX, web.id),
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, ExecutionContext::Native)
    }
}

/// Parses the discovery probe's value into web contexts.
///
/// Ids may arrive as numbers or strings; entries without an id are dropped.
pub fn parse_webviews(value: &serde_json::Value) -> Vec<WebContext> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let id = match item.get("id")? {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => return None,
            };
            let text = |key: &str| {
                item.get(key)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string()
            };
            Some(WebContext {
                id,
                title: text("title"),
                url: text("url"),
            })
        })
        .collect()
}

pub struct ContextEngine {
    queue: CommandQueue,
    gates: Arc<GateFlags>,
    debugger: Arc<dyn RemoteDebugger>,
    registry: RwLock<ContextRegistry>,
    current: RwLock<ExecutionContext>,
    budget: NavigationBudget,
}

impl ContextEngine {
    pub fn new(queue: CommandQueue, gates: Arc<GateFlags>, debugger: Arc<dyn RemoteDebugger>) -> Self {
        Self {
            queue,
            gates,
            debugger,
            registry: RwLock::new(ContextRegistry::new()),
            current: RwLock::new(ExecutionContext::Native),
            budget: NavigationBudget::default(),
        }
    }

    pub fn with_budget(mut self, budget: NavigationBudget) -> Self {
        self.budget = budget;
        self
    }

    /// Rebuilds the registry from a fresh discovery probe.
    pub async fn refresh(&self) -> Result<Vec<ExecutionContext>> {
        let webviews = match self.queue.execute_attached(DISCOVERY_PROBE).await? {
            Some(response) if response.is_success() => parse_webviews(&response.value),
            Some(response) => {
                return Err(DriverError::CommandProxy(format!(
                    "Web view discovery failed ({}): {}",
                    response.status,
                    response.value_str().unwrap_or_default()
                )));
            }
            None => Vec::new(),
        };

        let mut registry = self.registry.write().await;
        registry.replace(webviews);
        debug!(count = registry.len(), "Context registry refreshed");
        Ok(registry.contexts().to_vec())
    }

    /// Names of every known context, native first.
    pub async fn contexts(&self) -> Result<Vec<String>> {
        let contexts = self.refresh().await?;
        Ok(contexts.iter().map(ExecutionContext::name).collect())
    }

    pub async fn current(&self) -> ExecutionContext {
        self.current.read().await.clone()
    }

    pub async fn current_context(&self) -> String {
        self.current.read().await.name()
    }

    /// Snapshot of the registry as of the last refresh.
    pub async fn registry(&self) -> ContextRegistry {
        self.registry.read().await.clone()
    }

    pub async fn set_context(&self, name: &str) -> Result<()> {
        if name == NATIVE_CONTEXT {
            *self.current.write().await = ExecutionContext::Native;
            info!("Switched to native context");
            return Ok(());
        }

        self.refresh().await?;
        let web = self
            .registry
            .read()
            .await
            .find(name)
            .and_then(|context| match context {
                ExecutionContext::WebView(web) => Some(web.clone()),
                ExecutionContext::Native => None,
            })
            .ok_or_else(|| {
                DriverError::CommandProxy(format!("No such window: context '{}' does not exist", name))
            })?;

        self.select(web).await
    }

    /// Makes `web` the current context through the remote debugger.
    ///
    /// Queued commands are held back for as long as the page switch runs.
    pub(crate) async fn select(&self, web: WebContext) -> Result<()> {
        {
            let _selecting = self.gates.hold(GateCondition::SelectingNewPage);
            let _remote = self.gates.hold(GateCondition::RemoteCommandInProgress);
            self.debugger.select_page(&web).await?;
        }
        info!(id = %web.id, title = %web.title, "Switched to web context");
        *self.current.write().await = ExecutionContext::WebView(web);
        Ok(())
    }

    pub(crate) async fn cancel_page_load(&self) {
        let _remote = self.gates.hold(GateCondition::RemoteCommandInProgress);
        self.debugger.cancel_page_load().await;
    }

    /// Forgets the selected context and the last registry snapshot.
    pub async fn reset(&self) {
        *self.current.write().await = ExecutionContext::Native;
        *self.registry.write().await = ContextRegistry::new();
        self.gates.reset();
        self.debugger.disconnect().await;
    }

    pub(crate) fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub(crate) fn budget(&self) -> NavigationBudget {
        self.budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_context_names() {
        assert_eq!(ExecutionContext::Native.name(), "NATIVE_APP");
        let web = ExecutionContext::WebView(WebContext {
            id: "3".into(),
            title: "Home".into(),
            url: "http://x".into(),
        });
        assert_eq!(web.name(), "WEBVIEW_3");
        assert!(!web.is_native());
    }

    #[test]
    fn test_parse_webviews_accepts_numeric_ids() {
        let value = json!([
            {"id": 1, "title": "One", "url": "http://one"},
            {"id": "2", "title": "Two"},
            {"title": "no id"}
        ]);
        let parsed = parse_webviews(&value);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, "1");
        assert_eq!(parsed[1].url, "");
        assert!(parsed[1].is_blank());
        assert!(parse_webviews(&json!("nope")).is_empty());
    }
}
