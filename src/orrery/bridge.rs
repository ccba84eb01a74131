//! Tool / resource bridge: a thin namespaced registry and invocation
//! trampoline.
//!
//! Agents expose tools under `"<agent>.<tool>"` names; invocation routes
//! to the registered handler and folds any error into a structured
//! [`InvocationResult`] rather than propagating it. Resources are a
//! plain uri-keyed store, prompts are `{{var}}`-substituted templates.
//!
//! ```rust,no_run
//! use orrery::bridge::{ToolBridge, ToolHandler};
//! use orrery::observability::ObservabilitySink;
//! use std::sync::Arc;
//!
//! # async {
//! let bridge = ToolBridge::new(Arc::new(ObservabilitySink::new()));
//! let survey: ToolHandler = Arc::new(|args: serde_json::Value| {
//!     Box::pin(async move {
//!         Ok(serde_json::json!({ "site": args["site"], "craters": 12 }))
//!     })
//! });
//! bridge
//!     .register_agent_tools("mars", vec![("survey".to_string(), survey)])
//!     .await
//!     .unwrap();
//!
//! let result = bridge
//!     .invoke_tool("mars.survey", serde_json::json!({"site": "olympus"}))
//!     .await;
//! assert!(result.success);
//! # };
//! ```

use crate::orrery::observability::{FabricEvent, ObservabilitySink};
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Async tool handler. Errors it returns become structured failures, not
/// panics.
pub type ToolHandler = Arc<
    dyn Fn(serde_json::Value) -> BoxFuture<'static, Result<serde_json::Value, Box<dyn Error + Send + Sync>>>
        + Send
        + Sync,
>;

/// Structured outcome of a tool invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    pub success: bool,
    pub output: serde_json::Value,
    pub error: Option<String>,
}

impl InvocationResult {
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Errors raised by bridge registration and lookup.
#[derive(Debug, Clone)]
pub enum BridgeError {
    /// A namespaced tool name is already taken.
    DuplicateTool(String),
    ResourceNotFound(String),
    PromptNotFound(String),
}

impl BridgeError {
    /// Stable machine-readable error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeError::DuplicateTool(_) => "duplicate-registration",
            BridgeError::ResourceNotFound(_) | BridgeError::PromptNotFound(_) => "not-found",
        }
    }
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::DuplicateTool(name) => write!(f, "Tool already registered: {}", name),
            BridgeError::ResourceNotFound(uri) => write!(f, "RESOURCE_NOT_FOUND: {}", uri),
            BridgeError::PromptNotFound(name) => write!(f, "Prompt not found: {}", name),
        }
    }
}

impl Error for BridgeError {}

/// Namespaced tool registry plus resource and prompt stores.
pub struct ToolBridge {
    tools: RwLock<HashMap<String, ToolHandler>>,
    resources: RwLock<HashMap<String, serde_json::Value>>,
    prompts: RwLock<HashMap<String, String>>,
    sink: Arc<ObservabilitySink>,
}

impl ToolBridge {
    pub fn new(sink: Arc<ObservabilitySink>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            resources: RwLock::new(HashMap::new()),
            prompts: RwLock::new(HashMap::new()),
            sink,
        }
    }

    /// Install an agent's tools under `"<agent>.<tool>"`. A duplicate
    /// namespaced name fails the whole batch; nothing is installed
    /// partially.
    pub async fn register_agent_tools(
        &self,
        agent: &str,
        tools: Vec<(String, ToolHandler)>,
    ) -> Result<(), BridgeError> {
        let mut table = self.tools.write().await;
        let named: Vec<(String, ToolHandler)> = tools
            .into_iter()
            .map(|(name, handler)| (format!("{}.{}", agent, name), handler))
            .collect();
        for (name, _) in &named {
            if table.contains_key(name) {
                return Err(BridgeError::DuplicateTool(name.clone()));
            }
        }
        for (name, handler) in named {
            table.insert(name, handler);
        }
        Ok(())
    }

    /// Invoke a namespaced tool. Failures, whether an unknown tool or a
    /// handler error, come back as `{success: false, error}`, never as a panic
    /// or propagated `Err`.
    pub async fn invoke_tool(
        &self,
        namespaced_name: &str,
        args: serde_json::Value,
    ) -> InvocationResult {
        let handler = self.tools.read().await.get(namespaced_name).cloned();
        let start = Instant::now();
        let result = match handler {
            Some(handler) => match handler(args).await {
                Ok(output) => InvocationResult::success(output),
                Err(e) => InvocationResult::failure(e.to_string()),
            },
            None => InvocationResult::failure(format!("Tool not found: {}", namespaced_name)),
        };
        self.sink
            .emit(FabricEvent::ToolInvoked {
                tool_name: namespaced_name.to_string(),
                duration_ms: start.elapsed().as_millis() as u64,
                success: result.success,
            })
            .await;
        result
    }

    /// Registered namespaced tool names, sorted.
    pub async fn list_tools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Store a value under a resource uri, replacing any previous value.
    pub async fn register_resource(&self, uri: impl Into<String>, value: serde_json::Value) {
        self.resources.write().await.insert(uri.into(), value);
    }

    pub async fn read_resource(&self, uri: &str) -> Result<serde_json::Value, BridgeError> {
        self.resources
            .read()
            .await
            .get(uri)
            .cloned()
            .ok_or_else(|| BridgeError::ResourceNotFound(uri.to_string()))
    }

    /// Registered resource uris, sorted.
    pub async fn list_resources(&self) -> Vec<String> {
        let mut uris: Vec<String> = self.resources.read().await.keys().cloned().collect();
        uris.sort();
        uris
    }

    /// Store a prompt template. Placeholders use `{{var}}` syntax.
    pub async fn register_prompt(&self, name: impl Into<String>, template: impl Into<String>) {
        self.prompts.write().await.insert(name.into(), template.into());
    }

    /// Render a prompt with `{{var}}` substitution. Placeholders without
    /// a matching argument are left intact.
    pub async fn get_prompt(
        &self,
        name: &str,
        args: &HashMap<String, String>,
    ) -> Result<String, BridgeError> {
        let template = self
            .prompts
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BridgeError::PromptNotFound(name.to_string()))?;
        let mut rendered = template;
        for (key, value) in args {
            rendered = rendered.replace(&format!("{{{{{}}}}}", key), value);
        }
        Ok(rendered)
    }

    /// Registered prompt names, sorted.
    pub async fn list_prompts(&self) -> Vec<String> {
        let mut names: Vec<String> = self.prompts.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}
