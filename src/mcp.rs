//! MCP protocol surface.
//!
//! Bridges the database façade into an MCP server that Claude and other MCP
//! clients can connect to over two HTTP transports on one listener: SSE
//! (`/sse` + `/message`) and streamable HTTP (`/stream`).
//!
//! * **Tools** expose the query surface with per-tool gating (`read_query`
//!   accepts only SELECT, `write_query` everything but SELECT,
//!   `create_datasource` only CREATE TABLE, plus listing/describe helpers).
//! * **Resource** `memo://insights` is the append-only insights memo;
//!   `append_insight` grows it and notifies subscribed clients.
//! * **Prompt** `a10e-demo` walks a client through a demo scenario seeded
//!   with a topic.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use rmcp::model::*;
use rmcp::transport::sse_server::{SseServer, SseServerConfig};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::Database;

const MEMO_URI: &str = "memo://insights";

/// MCP server bridging tools, the memo resource, and the demo prompt to the
/// shared database handle. Every session gets a clone; the memo is shared.
#[derive(Clone)]
pub struct McpBridge {
    db: Arc<Database>,
    insights: Arc<Mutex<Vec<String>>>,
}

impl McpBridge {
    pub fn new(db: Arc<Database>) -> Self {
        McpBridge {
            db,
            insights: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Compose the plain-text memo from all appended insights.
    fn synthesize_memo(&self) -> String {
        let insights = self.insights.lock().expect("memo lock poisoned");
        compose_memo(&insights)
    }

    /// Run a query for a tool, handling the datasource meta-commands.
    async fn run_tool_query(&self, query: &str) -> Result<String, String> {
        let query = query.trim();
        let upper = query.to_uppercase();

        if upper == "LS" {
            return self.list_tables_text().await;
        }
        if let Some(rest) = strip_keyword(query, &upper, "LOAD ") {
            // Loading is a no-op: every table is always available.
            return Ok(format!("Table '{rest}' loaded successfully"));
        }
        if let Some(rest) = strip_keyword(query, &upper, "DESCRIBE ") {
            return self.describe_table_text(&rest).await;
        }

        if upper.starts_with("SELECT") {
            let result = self
                .db
                .execute_query(query)
                .await
                .map_err(|e| format!("error executing SELECT query: {e}"))?;
            return Ok(render_select_table(&result.columns, &result.results));
        }

        self.db
            .execute_query(query)
            .await
            .map_err(|e| format!("query execution error: {e}"))?;
        Ok("Query executed successfully.".to_string())
    }

    async fn list_tables_text(&self) -> Result<String, String> {
        let result = self
            .db
            .execute_query("SHOW TABLES")
            .await
            .map_err(|e| format!("error listing tables: {e}"))?;

        let mut tables = Vec::new();
        for row in &result.results {
            let name = row
                .get("name")
                .or_else(|| row.get("table_name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            if !name.is_empty() {
                tables.push(name.to_string());
            }
        }

        if tables.is_empty() {
            return Ok("No tables found.".to_string());
        }
        let mut text = String::from("Tables:\n");
        for table in tables {
            text.push_str(&format!("- {table}\n"));
        }
        Ok(text)
    }

    async fn describe_table_text(&self, table: &str) -> Result<String, String> {
        let sanitized = crate::db::sanitize_table_name(table);
        let result = self
            .db
            .execute_query(&format!("PRAGMA table_info({sanitized})"))
            .await
            .map_err(|e| format!("error describing table {table}: {e}"))?;

        if result.results.is_empty() {
            return Ok(format!("Table '{table}' not found or has no columns."));
        }

        let mut text = String::from("Column Name, Data Type, Nullable\n");
        for row in &result.results {
            let name = row.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            let column_type = row.get("type").and_then(|v| v.as_str()).unwrap_or_default();
            let not_null = match row.get("notnull") {
                Some(serde_json::Value::Bool(b)) => *b,
                Some(v) => v.as_i64().unwrap_or(0) != 0,
                None => false,
            };
            let nullable = if not_null { "NO" } else { "YES" };
            text.push_str(&format!("{name}, {column_type}, {nullable}\n"));
        }
        Ok(text)
    }
}

fn compose_memo(insights: &[String]) -> String {
    if insights.is_empty() {
        return "No business insights have been discovered yet.".to_string();
    }

    let mut memo = String::from("Business Intelligence Memo\n\nKey Insights Discovered:\n\n");
    for insight in insights {
        memo.push_str(&format!("- {insight}\n"));
    }
    if insights.len() > 1 {
        memo.push_str(&format!(
            "\nSummary:\nAnalysis has revealed {} key business insights that suggest \
             opportunities for strategic optimization and growth.",
            insights.len()
        ));
    }
    memo
}

fn strip_keyword(original: &str, upper: &str, keyword: &str) -> Option<String> {
    if upper.starts_with(keyword) {
        Some(original[keyword.len()..].trim().to_string())
    } else {
        None
    }
}

/// Render a SELECT result as an ASCII table, capped at 10 columns and 100
/// rows for display.
fn render_select_table(
    columns: &[String],
    rows: &[serde_json::Map<String, serde_json::Value>],
) -> String {
    if rows.is_empty() {
        return "Query executed successfully, but no rows were returned.".to_string();
    }
    if columns.is_empty() {
        return "Query executed successfully, but no columns were returned.".to_string();
    }

    let mut header = String::new();
    let mut separator = String::new();
    for col in columns.iter().take(10) {
        header.push_str(&format!("| {col:<15} "));
        separator.push_str("+------------------");
    }
    header.push_str("|\n");
    separator.push_str("+\n");

    let mut text = String::new();
    text.push_str(&separator);
    text.push_str(&header);
    text.push_str(&separator);

    let mut row_count = 0usize;
    for row in rows {
        row_count += 1;
        for (i, col) in columns.iter().enumerate() {
            if i >= 10 {
                if columns.len() > 10 {
                    text.push_str(&format!("| ({} more) ", columns.len() - 10));
                }
                break;
            }
            let value = match row.get(col) {
                None | Some(serde_json::Value::Null) => "NULL".to_string(),
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(v) => v.to_string(),
            };
            let value = if value.chars().count() > 15 {
                let truncated: String = value.chars().take(12).collect();
                format!("{truncated}...")
            } else {
                value
            };
            text.push_str(&format!("| {value:<15} "));
        }
        text.push_str("|\n");

        if row_count >= 100 {
            text.push_str("... (more rows)\n");
            break;
        }
    }
    text.push_str(&separator);

    match row_count {
        1 => text.push_str("1 row returned.\n"),
        n => text.push_str(&format!("{n} rows returned.\n")),
    }
    text
}

// ---------------------------------------------------------------------------
// Tool/prompt/resource descriptors
// ---------------------------------------------------------------------------

fn tool(name: &'static str, description: &'static str, schema: serde_json::Value) -> Tool {
    let input_schema = match schema {
        serde_json::Value::Object(map) => Arc::new(map),
        _ => Arc::new(serde_json::Map::new()),
    };
    Tool {
        name: Cow::Borrowed(name),
        title: None,
        description: Some(Cow::Borrowed(description)),
        input_schema,
        output_schema: None,
        annotations: None,
        icons: None,
    }
}

fn query_schema(description: &'static str) -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "query": { "type": "string", "description": description }
        },
        "required": ["query"]
    })
}

fn datasource_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "datasource_name": { "type": "string", "description": "Name of the datasource" }
        },
        "required": ["datasource_name"]
    })
}

fn all_tools() -> Vec<Tool> {
    vec![
        tool(
            "read_query",
            "Execute a SELECT query on the database. Make sure the datasource is loaded first.",
            query_schema("SELECT SQL query to execute"),
        ),
        tool(
            "write_query",
            "Execute an INSERT, UPDATE, or DELETE query on the database. Make sure the datasource is loaded first.",
            query_schema("SQL query to execute"),
        ),
        tool(
            "create_datasource",
            "Create a new datasource in the database",
            query_schema("CREATE TABLE SQL statement"),
        ),
        tool(
            "list_datasources",
            "List all data sources in the database",
            json!({ "type": "object", "properties": {} }),
        ),
        tool(
            "load_datasource",
            "Load a datasource into the database",
            datasource_schema(),
        ),
        tool(
            "describe_datasource",
            "Get the schema information for a specific datasource. Make sure the datasource is loaded first.",
            datasource_schema(),
        ),
        tool(
            "append_insight",
            "Add a business insight to the memo",
            json!({
                "type": "object",
                "properties": {
                    "insight": { "type": "string", "description": "Business insight discovered from data analysis" }
                },
                "required": ["insight"]
            }),
        ),
    ]
}

const DEMO_PROMPT_TEMPLATE: &str = "\
The assistant's goal is to walk through an informative demo of this MCP server. \
The user has installed the server and selected the prompt titled 'a10e-demo', \
seeding it with the topic: {topic}.

<mcp>
Prompts: this server provides the 'a10e-demo' prompt, which accepts a 'topic' \
argument and guides the user through creating datasources, analyzing data, and \
generating insights.
Resources: the server exposes 'memo://insights', a business insights memo that \
updates in real time as analysis progresses.
Tools: 'read_query' runs SELECT queries; 'write_query' runs INSERT, UPDATE, or \
DELETE; 'create_datasource' creates datasources; 'list_datasources' shows all \
existing datasources; 'describe_datasource' shows a datasource's schema; \
'append_insight' adds a business insight to the memo resource.
</mcp>

<demo-instructions>
You are an AI assistant generating a comprehensive business scenario around the \
topic: {topic}.

1. Create a business problem narrative with the user as protagonist who needs \
to collect and analyze data available through this server.
2. Check which datasources are loaded, design schemas for the data the problem \
needs, and use the tools to create and populate them.
3. Pause for user input: summarize the data created and present multiple-choice \
next steps; generate and run the matching query for the user's choice.
4. After each query, opine on the results and capture discovered insights with \
the append_insight tool, informing the user that the memo resource has updated.
5. Wrap up with a dashboard artifact and a final solution message built from \
the memo://insights resource.
</demo-instructions>

Keep every element tied to the original business problem and topic. Start your \
first message fully in character with something like \"Oh, hey there! I see \
you've chosen the topic {topic}. Let's get started!\"";

// ---------------------------------------------------------------------------
// ServerHandler
// ---------------------------------------------------------------------------

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .enable_resources()
                .build(),
            server_info: Implementation {
                name: "spotdb".to_string(),
                title: Some("SpotDB MCP Server".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "SpotDB — an ephemeral SQL sandbox. Upload CSV data over the HTTP API, \
                 then use read_query to analyze it, write_query and create_datasource to \
                 shape it, and append_insight to build up the memo://insights resource."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(all_tools())))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));

        let text_arg = |key: &str| -> Option<String> {
            args.get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };

        match request.name.as_ref() {
            "read_query" => {
                let Some(query) = text_arg("query") else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Missing or invalid query parameter",
                    )]));
                };
                if !query.trim().to_uppercase().starts_with("SELECT") {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Only SELECT queries are allowed for read_query",
                    )]));
                }
                info!(query = %query, "executing read_query");
                self.tool_result(self.run_tool_query(&query).await)
            }
            "write_query" => {
                let Some(query) = text_arg("query") else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Missing or invalid query parameter",
                    )]));
                };
                if query.trim().to_uppercase().starts_with("SELECT") {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "SELECT queries are not allowed for write_query",
                    )]));
                }
                info!(query = %query, "executing write_query");
                self.tool_result(self.run_tool_query(&query).await)
            }
            "create_datasource" => {
                let Some(query) = text_arg("query") else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Missing or invalid query parameter",
                    )]));
                };
                if !query.trim().to_uppercase().starts_with("CREATE TABLE") {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Only CREATE TABLE statements are allowed",
                    )]));
                }
                info!(query = %query, "executing create_datasource");
                self.tool_result(self.run_tool_query(&query).await)
            }
            "list_datasources" => self.tool_result(self.run_tool_query("LS").await),
            "load_datasource" => {
                let Some(name) = text_arg("datasource_name") else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Missing or invalid datasource_name parameter",
                    )]));
                };
                self.tool_result(self.run_tool_query(&format!("LOAD {name}")).await)
            }
            "describe_datasource" => {
                let Some(name) = text_arg("datasource_name") else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Missing or invalid datasource_name parameter",
                    )]));
                };
                self.tool_result(self.run_tool_query(&format!("DESCRIBE {name}")).await)
            }
            "append_insight" => {
                let Some(insight) = text_arg("insight") else {
                    return Ok(CallToolResult::error(vec![Content::text(
                        "Missing or invalid insight parameter",
                    )]));
                };
                info!(insight = %insight, "adding business insight");
                self.insights
                    .lock()
                    .expect("memo lock poisoned")
                    .push(insight);

                if let Err(e) = context
                    .peer
                    .notify_resource_updated(ResourceUpdatedNotificationParam {
                        uri: MEMO_URI.to_string(),
                    })
                    .await
                {
                    warn!(error = %e, "failed to send resource updated notification");
                }
                Ok(CallToolResult::success(vec![Content::text(
                    "Insight added to memo",
                )]))
            }
            other => Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {other}"),
                None,
            )),
        }
    }

    fn list_resources(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListResourcesResult, McpError>> + Send + '_ {
        let mut raw = RawResource::new(MEMO_URI, "Business Insights Memo");
        raw.description = Some("A living document of discovered business insights".to_string());
        raw.mime_type = Some("text/plain".to_string());
        std::future::ready(Ok(ListResourcesResult::with_all_items(vec![
            raw.no_annotation()
        ])))
    }

    async fn read_resource(
        &self,
        request: ReadResourceRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<ReadResourceResult, McpError> {
        if request.uri != MEMO_URI {
            return Err(McpError::new(
                ErrorCode::RESOURCE_NOT_FOUND,
                format!("unknown resource: {}", request.uri),
                None,
            ));
        }
        Ok(ReadResourceResult {
            contents: vec![ResourceContents::text(self.synthesize_memo(), MEMO_URI)],
        })
    }

    fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListPromptsResult, McpError>> + Send + '_ {
        let prompt = Prompt {
            name: "a10e-demo".to_string(),
            title: None,
            description: Some(
                "A prompt to demonstrate what you can do with this MCP server + Claude".to_string(),
            ),
            arguments: Some(vec![PromptArgument {
                name: "topic".to_string(),
                title: None,
                description: Some("Topic to seed the database with initial data".to_string()),
                required: Some(true),
            }]),
            icons: None,
        };
        std::future::ready(Ok(ListPromptsResult::with_all_items(vec![prompt])))
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<GetPromptResult, McpError> {
        if request.name != "a10e-demo" {
            return Err(McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("unknown prompt: {}", request.name),
                None,
            ));
        }

        let topic = request
            .arguments
            .as_ref()
            .and_then(|args| args.get("topic"))
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                McpError::new(
                    ErrorCode::INVALID_PARAMS,
                    "missing required argument: topic".to_string(),
                    None,
                )
            })?;

        info!(topic, "processing demo prompt");
        let text = DEMO_PROMPT_TEMPLATE.replace("{topic}", topic);

        Ok(GetPromptResult {
            description: Some(format!("Demo template for {topic}")),
            messages: vec![PromptMessage::new_text(PromptMessageRole::User, text)],
        })
    }
}

impl McpBridge {
    fn get_tool(&self, name: &str) -> Option<Tool> {
        all_tools().into_iter().find(|t| t.name == name)
    }

    fn tool_result(&self, result: Result<String, String>) -> Result<CallToolResult, McpError> {
        match result {
            Ok(text) => Ok(CallToolResult::success(vec![Content::text(text)])),
            Err(e) => Ok(CallToolResult::error(vec![Content::text(format!(
                "Query error: {e}"
            ))])),
        }
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

async fn handle_health() -> Response {
    Json(json!({ "status": "healthy" })).into_response()
}

/// Tags the request span with the transport inferred from the path.
async fn transport_logger(req: Request<axum::body::Body>, next: Next) -> Response {
    let path = req.uri().path().to_string();
    let transport = if path.contains("/stream") {
        "stream"
    } else if path.contains("/message") || path.contains("/sse") {
        "sse"
    } else {
        "http"
    };
    let start = std::time::Instant::now();
    let response = next.run(req).await;
    info!(
        transport,
        path = %path,
        status = response.status().as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        "MCP request completed"
    );
    response
}

async fn api_key_middleware(
    axum::extract::State(api_key): axum::extract::State<Option<String>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let Some(expected) = api_key.as_deref() else {
        return next.run(req).await;
    };
    let provided = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if provided != expected {
        info!("unauthorized MCP access attempt");
        return (StatusCode::UNAUTHORIZED, "Unauthorized: invalid API key").into_response();
    }
    next.run(req).await
}

/// Serve the MCP listener (SSE + streamable HTTP + health) until cancelled.
pub async fn run_mcp_server(
    db: Arc<Database>,
    config: Arc<Config>,
    addr: SocketAddr,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let bridge = McpBridge::new(db);

    let (sse_server, sse_router) = SseServer::new(SseServerConfig {
        bind: addr,
        sse_path: "/sse".to_string(),
        post_path: "/message".to_string(),
        ct: cancel.child_token(),
        sse_keep_alive: None,
    });
    let sse_bridge = bridge.clone();
    let sse_ct = sse_server.with_service(move || sse_bridge.clone());

    let stream_bridge = bridge.clone();
    let streamable = StreamableHttpService::new(
        move || Ok(stream_bridge.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );

    let app = Router::new()
        .route("/health", get(handle_health))
        .nest_service("/stream", streamable)
        .merge(sse_router)
        .layer(middleware::from_fn_with_state(
            config.api_key.clone(),
            api_key_middleware,
        ))
        .layer(middleware::from_fn(transport_logger));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "starting MCP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    sse_ct.cancel();
    info!(addr = %addr, "MCP server stopped");
    Ok(())
}
