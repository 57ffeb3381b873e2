//! The per-tool pipelines: validate input, run one engine evaluation,
//! shape the output.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::engine::{EngineError, EvalRequest, LocalEngineSession};
use crate::logger::Logger;

pub const SCRIPT_EXTENSION: &str = "m";

/// Substituted when the analyzer produces no output at all, so the caller
/// can tell a clean script from a failed analysis.
pub(crate) const NO_ISSUES_MESSAGE: &str = "No issues found by checkcode";

pub(crate) const DEFAULT_EVAL_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const ANALYSIS_TIMEOUT: Duration = Duration::from_secs(120);
pub(crate) const TEST_RUN_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const VERSION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub enum ToolError {
    InvalidPath(String),
    Io(io::Error),
    Engine(EngineError),
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ToolError::InvalidPath(message) => write!(f, "{message}"),
            ToolError::Io(err) => write!(f, "{err}"),
            ToolError::Engine(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ToolError {}

impl From<io::Error> for ToolError {
    fn from(err: io::Error) -> Self {
        ToolError::Io(err)
    }
}

impl From<EngineError> for ToolError {
    fn from(err: EngineError) -> Self {
        ToolError::Engine(err)
    }
}

pub(crate) fn check_code(
    logger: &Logger,
    client: &LocalEngineSession,
    script_path: &str,
) -> Result<Vec<String>, ToolError> {
    let validated = validate_script_path(script_path)?;
    let code = format!(
        "engine_pkg.check_code('{}')",
        escape_single_quotes(&validated.to_string_lossy())
    );
    let response = client.eval_with_capture(logger, EvalRequest { code }, ANALYSIS_TIMEOUT)?;
    Ok(check_code_issues(&response.console_output))
}

pub(crate) fn check_code_issues(output: &str) -> Vec<String> {
    let issues = clean_output_lines(output);
    if issues.is_empty() {
        return vec![NO_ISSUES_MESSAGE.to_string()];
    }
    issues
}

pub(crate) fn run_test_file(
    logger: &Logger,
    client: &LocalEngineSession,
    test_file_path: &str,
) -> Result<String, ToolError> {
    let validated = validate_script_path(test_file_path)?;
    let code = format!(
        "engine_pkg.run_tests('{}')",
        escape_single_quotes(&validated.to_string_lossy())
    );
    let response = client.eval_with_capture(logger, EvalRequest { code }, TEST_RUN_TIMEOUT)?;
    Ok(response.console_output)
}

pub(crate) fn engine_version(
    logger: &Logger,
    client: &LocalEngineSession,
) -> Result<String, ToolError> {
    let response = client.eval_with_capture(
        logger,
        EvalRequest {
            code: "version".to_string(),
        },
        VERSION_TIMEOUT,
    )?;
    Ok(response.console_output.trim().to_string())
}

/// Rejects anything that is not an existing engine script and absolutises
/// the path so the engine resolves it independently of its own working
/// directory.
pub(crate) fn validate_script_path(path: &str) -> Result<PathBuf, ToolError> {
    if path.trim().is_empty() {
        return Err(ToolError::InvalidPath("script path must not be empty".to_string()));
    }
    let path = PathBuf::from(path);
    if !path
        .extension()
        .is_some_and(|extension| extension == SCRIPT_EXTENSION)
    {
        return Err(ToolError::InvalidPath(format!(
            "script path must end in .{SCRIPT_EXTENSION}: {}",
            path.display()
        )));
    }
    let metadata = std::fs::metadata(&path)?;
    if !metadata.is_file() {
        return Err(ToolError::InvalidPath(format!(
            "script path is not a file: {}",
            path.display()
        )));
    }
    Ok(std::path::absolute(&path)?)
}

/// Doubles single quotes so the path can be spliced into an engine string
/// literal.
pub(crate) fn escape_single_quotes(text: &str) -> String {
    text.replace('\'', "''")
}

pub(crate) fn clean_output_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
