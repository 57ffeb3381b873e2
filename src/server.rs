use std::sync::Arc;
use std::time::Duration;

use rmcp::handler::server::tool::ToolRouter;
use rmcp::handler::server::wrapper::{Json, Parameters};
use rmcp::model::{
    CallToolResult, ErrorData as McpError, ProtocolVersion, ServerCapabilities, ServerInfo,
};
use rmcp::{ServerHandler, tool, tool_handler, tool_router};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

mod response;
#[cfg(test)]
mod tests;
mod usecases;

use self::response::{RichContent, rich_content_result};
use self::usecases::{DEFAULT_EVAL_TIMEOUT, ToolError};

use crate::app_dir::ApplicationDirectory;
use crate::config::Config;
use crate::engine::{EngineManager, EvalRequest};
use crate::global_engine::GlobalEngineSession;
use crate::lifecycle::LifecycleSignaler;
use crate::logger::Logger;
use crate::watchdog_process::Watchdog;

#[derive(Clone)]
struct SharedEngine {
    global: Arc<GlobalEngineSession>,
}

impl SharedEngine {
    /// Engine work is blocking (process I/O behind mutexes), so every tool
    /// call hops onto the blocking pool.
    async fn run_engine<T, F>(&self, f: F) -> Result<T, McpError>
    where
        F: FnOnce(&GlobalEngineSession) -> T + Send + 'static,
        T: Send + 'static,
    {
        let global = self.global.clone();
        tokio::task::spawn_blocking(move || f(&global))
            .await
            .map_err(|err| McpError::internal_error(err.to_string(), None))
    }
}

#[derive(Clone)]
pub struct EngineToolServer {
    shared: SharedEngine,
    tool_router: ToolRouter<Self>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct EvaluateArgs {
    /// Source code to evaluate in the shared engine session.
    code: String,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct CheckCodeArgs {
    /// Path to the script file to analyze.
    script_path: String,
}

#[derive(Serialize, JsonSchema)]
struct CheckCodeOutput {
    issues: Vec<String>,
}

#[derive(Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
struct RunTestFileArgs {
    /// Path to the test file to run.
    test_file_path: String,
}

#[derive(Serialize, JsonSchema)]
struct RunTestFileOutput {
    test_output: String,
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct StartEngineSessionArgs {}

#[derive(Serialize, JsonSchema)]
struct StartEngineSessionOutput {
    engine_version: String,
}

#[derive(Deserialize, JsonSchema, Default)]
#[serde(deny_unknown_fields)]
struct ListEngineEnvironmentsArgs {}

#[derive(Serialize, JsonSchema)]
struct EngineEnvironment {
    engine_root: String,
    version: String,
}

#[derive(Serialize, JsonSchema)]
struct ListEngineEnvironmentsOutput {
    environments: Vec<EngineEnvironment>,
}

fn server_info() -> ServerInfo {
    ServerInfo {
        protocol_version: ProtocolVersion::V_2025_06_18,
        capabilities: ServerCapabilities::builder().enable_tools().build(),
        ..ServerInfo::default()
    }
}

fn tool_logger(tool: &str) -> Logger {
    Logger::global().with("tool", tool.to_string())
}

fn tool_error(tool: &'static str, err: ToolError) -> McpError {
    crate::event_log::log_lazy("tool_call_error", || {
        json!({
            "tool": tool,
            "error": err.to_string(),
        })
    });
    match err {
        ToolError::InvalidPath(message) => McpError::invalid_params(message, None),
        other => McpError::internal_error(other.to_string(), None),
    }
}

fn resolve_timeout_ms(timeout_ms: Option<u64>) -> Result<Duration, McpError> {
    match timeout_ms {
        None => Ok(DEFAULT_EVAL_TIMEOUT),
        Some(0) => Err(McpError::invalid_params(
            "timeout_ms must be greater than zero",
            None,
        )),
        Some(value) => Ok(Duration::from_millis(value)),
    }
}

#[tool_router]
impl EngineToolServer {
    pub fn new(global: Arc<GlobalEngineSession>) -> Self {
        Self {
            shared: SharedEngine { global },
            tool_router: Self::tool_router(),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/evaluate.md")]
    #[tool(name = "evaluate")]
    async fn evaluate(&self, params: Parameters<EvaluateArgs>) -> Result<CallToolResult, McpError> {
        let EvaluateArgs { code, timeout_ms } = params.0;
        let timeout = resolve_timeout_ms(timeout_ms)?;
        crate::event_log::log_lazy("tool_call_begin", || {
            json!({
                "tool": "evaluate",
                "bytes": code.len(),
                "timeout_ms": timeout.as_millis(),
            })
        });

        let logger = tool_logger("evaluate");
        let result = self
            .shared
            .run_engine(move |global| -> Result<_, ToolError> {
                let client = global.client(&logger)?;
                Ok(client.eval_with_capture(&logger, EvalRequest { code }, timeout)?)
            })
            .await?;

        match result {
            Ok(response) => Ok(rich_content_result(RichContent {
                texts: vec![response.console_output],
                images: response.images,
            })),
            Err(err) => Err(tool_error("evaluate", err)),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/check_code.md")]
    #[tool(name = "check_code")]
    async fn check_code(
        &self,
        params: Parameters<CheckCodeArgs>,
    ) -> Result<Json<CheckCodeOutput>, McpError> {
        let CheckCodeArgs { script_path } = params.0;
        let logger = tool_logger("check_code");
        let result = self
            .shared
            .run_engine(move |global| -> Result<_, ToolError> {
                let client = global.client(&logger)?;
                usecases::check_code(&logger, &client, &script_path)
            })
            .await?;

        match result {
            Ok(issues) => Ok(Json(CheckCodeOutput { issues })),
            Err(err) => Err(tool_error("check_code", err)),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/run_test_file.md")]
    #[tool(name = "run_test_file")]
    async fn run_test_file(
        &self,
        params: Parameters<RunTestFileArgs>,
    ) -> Result<Json<RunTestFileOutput>, McpError> {
        let RunTestFileArgs { test_file_path } = params.0;
        let logger = tool_logger("run_test_file");
        let result = self
            .shared
            .run_engine(move |global| -> Result<_, ToolError> {
                let client = global.client(&logger)?;
                usecases::run_test_file(&logger, &client, &test_file_path)
            })
            .await?;

        match result {
            Ok(test_output) => Ok(Json(RunTestFileOutput { test_output })),
            Err(err) => Err(tool_error("run_test_file", err)),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/start_engine_session.md")]
    #[tool(name = "start_engine_session")]
    async fn start_engine_session(
        &self,
        _params: Parameters<StartEngineSessionArgs>,
    ) -> Result<Json<StartEngineSessionOutput>, McpError> {
        let logger = tool_logger("start_engine_session");
        let result = self
            .shared
            .run_engine(move |global| -> Result<_, ToolError> {
                let client = global.client(&logger)?;
                usecases::engine_version(&logger, &client)
            })
            .await?;

        match result {
            Ok(engine_version) => Ok(Json(StartEngineSessionOutput { engine_version })),
            Err(err) => Err(tool_error("start_engine_session", err)),
        }
    }

    #[doc = include_str!("../docs/tool-descriptions/list_engine_environments.md")]
    #[tool(name = "list_engine_environments")]
    async fn list_engine_environments(
        &self,
        _params: Parameters<ListEngineEnvironmentsArgs>,
    ) -> Result<Json<ListEngineEnvironmentsOutput>, McpError> {
        let logger = tool_logger("list_engine_environments");
        let environments = self
            .shared
            .run_engine(move |global| {
                global
                    .manager()
                    .list_environments(&logger)
                    .into_iter()
                    .map(|environment| EngineEnvironment {
                        engine_root: environment.engine_root.to_string_lossy().to_string(),
                        version: environment.version,
                    })
                    .collect::<Vec<_>>()
            })
            .await?;

        Ok(Json(ListEngineEnvironmentsOutput { environments }))
    }
}

#[tool_handler]
impl ServerHandler for EngineToolServer {
    fn get_info(&self) -> ServerInfo {
        server_info()
    }
}

/// Boots the full server: application directory, watchdog, engine manager,
/// shutdown orchestration, then MCP serving over stdio until the client
/// disconnects, a ctrl-c arrives, or a shutdown is requested.
pub async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let logger = Logger::global();

    let app_dir = Arc::new(ApplicationDirectory::new(&config)?);
    app_dir.record_to_logger(&logger);

    let signaler = LifecycleSignaler::new();
    signaler.set_shutdown_timeout(config.shutdown_timeout());

    let watchdog = Arc::new(Watchdog::new(&app_dir, logger.clone()));
    watchdog.start()?;

    let manager = Arc::new(EngineManager::new(config, app_dir, watchdog.clone()));
    let global = Arc::new(GlobalEngineSession::new(manager.clone()));

    // Teardown order: stop serving, stop the engine session, then ask the
    // watchdog to wind down.
    let (rpc_stop_tx, rpc_stop_rx) = tokio::sync::oneshot::channel::<()>();
    signaler.add_shutdown_function(Box::new(move || {
        let _ = rpc_stop_tx.send(());
        Ok(())
    }));
    {
        let manager = manager.clone();
        let logger = logger.clone();
        signaler.add_shutdown_function(Box::new(move || {
            manager.stop(&logger);
            Ok(())
        }));
    }
    {
        let watchdog = watchdog.clone();
        signaler.add_shutdown_function(Box::new(move || watchdog.stop().map_err(Into::into)));
    }

    let service = EngineToolServer::new(global);
    crate::event_log::log("server_listen_begin", json!({}));
    let running = rmcp::serve_server(service, rmcp::transport::stdio()).await?;

    let serve_result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        result = running.waiting() => result.map(|_| ()).map_err(Into::into),
        _ = tokio::signal::ctrl_c() => Ok(()),
        _ = rpc_stop_rx => Ok(()),
    };

    signaler.request_shutdown();
    let signaler_for_wait = signaler.clone();
    let shutdown_result =
        tokio::task::spawn_blocking(move || signaler_for_wait.wait_for_shutdown_to_complete())
            .await?;

    match &shutdown_result {
        Ok(()) => crate::event_log::log("server_listen_end", json!({"status": "ok"})),
        Err(err) => {
            logger.with_error(err).error("Shutdown finished with an error");
            crate::event_log::log(
                "server_listen_end",
                json!({
                    "status": "error",
                    "error": err.to_string(),
                }),
            );
        }
    }

    serve_result?;
    shutdown_result?;
    Ok(())
}
