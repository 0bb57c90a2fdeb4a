//! Capabilities exposed to the planning layer.
//!
//! Tools are registered once, by name, and the registry refuses
//! duplicates. Local rejections (policy, validation, rate limit) come back
//! as `Ok` text naming the rule so the caller can rephrase; only device
//! failures are returned as `Err`.

use anyhow::{Result, anyhow, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::gatekeeper::Gatekeeper;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> ToolSchema;
    async fn execute(&self, arguments: &str) -> Result<String>;
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<()> {
        let name = tool.name().to_string();
        if self.by_name.contains_key(&name) {
            bail!("Tool already registered: {}", name);
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.by_name.get(name).map(|&i| self.tools[i].as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn schemas(&self) -> Vec<ToolSchema> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub async fn execute(&self, name: &str, arguments: &str) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow!("Unknown tool: {}", name))?;
        debug!("Executing tool {}", name);
        tool.execute(arguments).await
    }
}

pub fn create_default_tools(gatekeeper: Arc<Gatekeeper>) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(ExecuteShowTool::new(Arc::clone(&gatekeeper))))?;
    registry.register(Box::new(ValidateQueryTool::new(Arc::clone(&gatekeeper))))?;
    registry.register(Box::new(SessionStatusTool::new(gatekeeper)))?;
    Ok(registry)
}

fn string_arg(arguments: &str, key: &str) -> Result<String> {
    let args: Value = serde_json::from_str(arguments)?;
    args[key]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Missing {}", key))
}

// Execute Show Tool
pub struct ExecuteShowTool {
    gatekeeper: Arc<Gatekeeper>,
}

impl ExecuteShowTool {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }
}

#[async_trait]
impl Tool for ExecuteShowTool {
    fn name(&self) -> &str {
        "execute_show"
    }

    fn schema(&self) -> ToolSchema {
        let allowed = self.gatekeeper.policy().rules().allowed_prefixes().join(", ");
        ToolSchema {
            name: "execute_show".to_string(),
            description: format!(
                "Run one read-only command on the connected device. Commands must start \
                 with one of: {}. No ';' chaining; pipes only into include, begin, \
                 section or exclude.",
                allowed
            ),
            parameters: json!({
                "type": "object",
                "properties": {
                    "command": {
                        "type": "string",
                        "description": "A single read-only command, e.g. 'show ip interface brief'"
                    }
                },
                "required": ["command"]
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> Result<String> {
        let command = string_arg(arguments, "command")?;
        match self.gatekeeper.execute(&command).await {
            Ok(output) => Ok(output),
            Err(e) if e.is_fatal() => Err(e.into()),
            Err(e) => Ok(format!("Rejected ({}): {}", e.category(), e)),
        }
    }
}

// Validate Query Tool
pub struct ValidateQueryTool {
    gatekeeper: Arc<Gatekeeper>,
}

impl ValidateQueryTool {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }
}

#[async_trait]
impl Tool for ValidateQueryTool {
    fn name(&self) -> &str {
        "validate_query"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "validate_query".to_string(),
            description: "Screen a free-text request before acting on it. Returns the \
                          sanitized query, or the rule it broke."
                .to_string(),
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The user's request, verbatim"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, arguments: &str) -> Result<String> {
        let query = string_arg(arguments, "query")?;
        let verdict = match self.gatekeeper.validate_query(&query) {
            Ok(sanitized) => json!({ "valid": true, "sanitized": sanitized }),
            Err(e) => json!({ "valid": false, "rule": e.category(), "reason": e.to_string() }),
        };
        Ok(verdict.to_string())
    }
}

// Session Status Tool
pub struct SessionStatusTool {
    gatekeeper: Arc<Gatekeeper>,
}

impl SessionStatusTool {
    pub fn new(gatekeeper: Arc<Gatekeeper>) -> Self {
        Self { gatekeeper }
    }
}

#[async_trait]
impl Tool for SessionStatusTool {
    fn name(&self) -> &str {
        "session_status"
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "session_status".to_string(),
            description: "Report the device session state, target, last error and \
                          reconnect attempts."
                .to_string(),
            parameters: json!({ "type": "object", "properties": {} }),
        }
    }

    async fn execute(&self, _arguments: &str) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.gatekeeper.status())?)
    }
}
