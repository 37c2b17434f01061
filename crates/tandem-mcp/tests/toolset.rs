use std::sync::Arc;

use serde_json::json;

use tandem_core::config::AppConfig;
use tandem_core::error::TandemError;
use tandem_core::event::EventBus;
use tandem_mcp::{McpRegistry, McpToolset, SessionManager, ToolFilter, ToolInfo, ToolOutput};
use tandem_pipeline::{Orchestrator, Outcome, SharedState, StepGroup};
use tandem_test_utils::{stdio_server, MockConnector};

fn connector() -> Arc<MockConnector> {
    Arc::new(
        MockConnector::new()
            .with_tools(vec![
                ToolInfo::new("read_file", "Read a file"),
                ToolInfo::new("write_file", "Write a file"),
                ToolInfo::new("broken", "Always errors"),
            ])
            .with_response("read_file", ToolOutput::success("hello"))
            .with_response("broken", ToolOutput::error("disk on fire")),
    )
}

fn toolset(connector: &Arc<MockConnector>, filter: ToolFilter) -> McpToolset {
    let manager = SessionManager::new("fs", stdio_server(), connector.clone()).unwrap();
    McpToolset::new(Arc::new(manager), filter)
}

#[tokio::test]
async fn test_names_filter_hides_tools() {
    let connector = connector();
    let tools = toolset(&connector, ToolFilter::Names(vec!["read_file".into()]));

    let listed: Vec<String> = tools.tools().await.unwrap().into_iter().map(|t| t.name).collect();
    assert_eq!(listed, vec!["read_file"]);

    let err = tools.call("write_file", None).await.unwrap_err();
    assert!(matches!(err, TandemError::ToolNotFound(ref t) if t == "fs.write_file"));
    assert_eq!(tools.call("read_file", None).await.unwrap().content, "hello");
}

#[tokio::test]
async fn test_predicate_filter() {
    let connector = connector();
    let tools = toolset(&connector, ToolFilter::predicate(|t| t.name.starts_with("write")));

    assert!(tools.call("read_file", None).await.is_err());
    let args = json!({"path": "a.txt"}).as_object().cloned();
    let out = tools.call("write_file", args).await.unwrap();
    assert_eq!(out.content, r#"{"path":"a.txt"}"#);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_predicate_filter_lists_once_per_session() {
    let connector = connector();
    let tools = toolset(&connector, ToolFilter::predicate(|t| t.name != "broken"));

    tools.call("read_file", None).await.unwrap();
    tools.call("write_file", None).await.unwrap();
    assert!(tools.call("broken", None).await.is_err());
    assert_eq!(connector.last_client().unwrap().listings(), 1);

    // A replacement session is listed afresh.
    connector.last_client().unwrap().kill();
    tools.call("read_file", None).await.unwrap();
    assert_eq!(connector.attempts(), 2);
    assert_eq!(connector.last_client().unwrap().listings(), 1);
}

#[tokio::test]
async fn test_tool_step_in_pipeline() {
    let connector = connector();
    let tools = toolset(&connector, ToolFilter::All);
    let root = StepGroup::sequential(
        "root",
        vec![
            tools.step("read", "read_file", "read_args").with_output("contents").into(),
            tools.step("break", "broken", "missing").into(),
        ],
    )
    .unwrap();
    let state: SharedState = [("read_args", json!({"path": "notes.txt"}))].into_iter().collect();

    let report = Orchestrator::new().execute(root, state).await.unwrap();

    assert_eq!(report.state.get("contents"), Some(&json!("hello")));
    assert!(matches!(
        report.outcome_of("break"),
        Some(Outcome::Failed { cause }) if cause.contains("disk on fire")
    ));
    // Steps never close the session they used.
    let session = tools.manager().current().await.unwrap();
    assert!(session.is_ready());
    assert!(connector.released().is_empty());

    let calls = connector.last_client().unwrap().calls();
    assert_eq!(calls[0].1, json!({"path": "notes.txt"}).as_object().cloned());
    assert_eq!(calls[1].1, None);
}

#[tokio::test]
async fn test_registry_shutdown_all() {
    let config = AppConfig::parse(
        r#"
[mcp.servers.fs]
tools = ["read_file"]

[mcp.servers.fs.transport]
type = "stdio"
command = "mock-fs"

[mcp.servers.search.transport]
type = "streamable_http"
url = "http://localhost:8931/mcp"
"#,
    )
    .unwrap();
    let connector = connector();
    let registry = McpRegistry::from_config(&config, connector.clone(), EventBus::default()).unwrap();
    assert_eq!(registry.servers(), vec!["fs", "search"]);

    let fs = registry.toolset("fs").unwrap();
    assert!(fs.call("write_file", None).await.is_err());
    fs.call("read_file", None).await.unwrap();
    registry.toolset("search").unwrap().tools().await.unwrap();
    assert_eq!(connector.attempts(), 2);

    registry.shutdown_all().await;
    registry.shutdown_all().await;
    assert_eq!(connector.released().len(), 6);
    assert!(registry.manager("nope").is_err());
}
