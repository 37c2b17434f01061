use std::collections::HashSet;
use std::sync::{Arc, Weak};

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::debug;

use tandem_core::error::{Result, TandemError};
use tandem_pipeline::Step;

use crate::manager::SessionManager;
use crate::session::TransportSession;
use crate::transport::{ToolInfo, ToolOutput};

/// Selects which of a provider's tools are exposed.
#[derive(Clone, Default)]
pub enum ToolFilter {
    #[default]
    All,
    Names(Vec<String>),
    Predicate(Arc<dyn Fn(&ToolInfo) -> bool + Send + Sync>),
}

impl std::fmt::Debug for ToolFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::All => f.write_str("All"),
            Self::Names(names) => f.debug_tuple("Names").field(names).finish(),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl ToolFilter {
    /// `Names` for a non-empty list, `All` otherwise.
    pub fn from_names(names: &[String]) -> Self {
        if names.is_empty() {
            Self::All
        } else {
            Self::Names(names.to_vec())
        }
    }

    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(&ToolInfo) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    pub fn allows(&self, tool: &ToolInfo) -> bool {
        match self {
            Self::All => true,
            Self::Names(names) => names.iter().any(|n| *n == tool.name),
            Self::Predicate(p) => p(tool),
        }
    }
}

/// Names that passed a predicate filter, valid for one session.
#[derive(Default)]
struct VisibleNames {
    session: Weak<TransportSession>,
    names: HashSet<String>,
}

/// The tools of one provider, as seen through a filter.
///
/// Wraps a shared [`SessionManager`]; sessions are acquired lazily on first
/// use and stay open until [`McpToolset::close`]. With a predicate filter the
/// visible names are remembered per session, so only the first call on a
/// session lists the provider's tools.
#[derive(Clone)]
pub struct McpToolset {
    manager: Arc<SessionManager>,
    filter: ToolFilter,
    visible: Arc<Mutex<VisibleNames>>,
}

impl std::fmt::Debug for McpToolset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpToolset")
            .field("server", &self.server())
            .field("filter", &self.filter)
            .finish()
    }
}

impl McpToolset {
    pub fn new(manager: Arc<SessionManager>, filter: ToolFilter) -> Self {
        Self {
            manager,
            filter,
            visible: Arc::new(Mutex::new(VisibleNames::default())),
        }
    }

    /// Toolset filtered by the server's configured tool list.
    pub fn from_manager(manager: Arc<SessionManager>) -> Self {
        let filter = ToolFilter::from_names(&manager.config().tools);
        Self::new(manager, filter)
    }

    pub fn manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    pub fn server(&self) -> &str {
        self.manager.server()
    }

    /// List the tools that pass the filter.
    pub async fn tools(&self) -> Result<Vec<ToolInfo>> {
        let session = self.manager.acquire().await?;
        self.list_visible(&session).await
    }

    async fn list_visible(&self, session: &Arc<TransportSession>) -> Result<Vec<ToolInfo>> {
        let tools: Vec<ToolInfo> = session
            .list_tools()
            .await?
            .into_iter()
            .filter(|t| self.filter.allows(t))
            .collect();

        *self.visible.lock().await = VisibleNames {
            session: Arc::downgrade(session),
            names: tools.iter().map(|t| t.name.clone()).collect(),
        };
        debug!(server = %self.server(), count = tools.len(), "Filtered toolset");
        Ok(tools)
    }

    async fn passes_predicate(&self, session: &Arc<TransportSession>, tool: &str) -> Result<bool> {
        {
            let visible = self.visible.lock().await;
            let cached = visible
                .session
                .upgrade()
                .is_some_and(|s| Arc::ptr_eq(&s, session));
            if cached {
                return Ok(visible.names.contains(tool));
            }
        }
        Ok(self.list_visible(session).await?.iter().any(|t| t.name == tool))
    }

    /// Invoke a tool. Tools hidden by the filter are reported as not found.
    pub async fn call(
        &self,
        tool: &str,
        arguments: Option<Map<String, Value>>,
    ) -> Result<ToolOutput> {
        let hidden = || TandemError::ToolNotFound(format!("{}.{}", self.server(), tool));
        if let ToolFilter::Names(names) = &self.filter {
            if !names.iter().any(|n| n == tool) {
                return Err(hidden());
            }
        }

        let session = self.manager.acquire().await?;
        if let ToolFilter::Predicate(_) = &self.filter {
            if !self.passes_predicate(&session, tool).await? {
                return Err(hidden());
            }
        }
        session.call_tool(tool, arguments).await
    }

    /// Close the underlying session.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    /// A pipeline step that calls `tool` with the object stored under `args_key`.
    ///
    /// An absent or null argument value calls the tool without arguments.
    /// The step completes with the tool's text output; a provider-reported
    /// error fails the step.
    pub fn step(
        &self,
        id: impl Into<String>,
        tool: impl Into<String>,
        args_key: impl Into<String>,
    ) -> Step {
        let toolset = self.clone();
        let tool = tool.into();
        let args_key = args_key.into();
        let input = args_key.clone();

        Step::new(id, move |ctx| {
            let toolset = toolset.clone();
            let tool = tool.clone();
            let args_key = args_key.clone();
            async move {
                let arguments = match ctx.get(&args_key) {
                    None | Some(Value::Null) => None,
                    Some(Value::Object(map)) => Some(map.clone()),
                    Some(other) => {
                        return Err(TandemError::step(
                            ctx.step_id(),
                            format!("arguments under '{}' must be an object, got {}", args_key, other),
                        ))
                    }
                };

                let output = toolset.call(&tool, arguments).await?;
                if output.is_error {
                    return Err(TandemError::step(ctx.step_id(), output.content));
                }
                Ok(Value::String(output.content))
            }
        })
        .with_inputs([input])
    }
}
