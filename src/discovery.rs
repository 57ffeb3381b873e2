use std::io;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::logger::Logger;

#[cfg(not(windows))]
pub const ENGINE_EXECUTABLE_NAME: &str = "engine";
#[cfg(windows)]
pub const ENGINE_EXECUTABLE_NAME: &str = "engine.exe";

const VERSION_INFO_FILE: &str = "VersionInfo.xml";

/// One discovered engine installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentInfo {
    pub engine_root: PathBuf,
    pub version: String,
}

#[derive(Debug)]
pub enum DiscoveryError {
    NoEngineFound,
    MissingVersionMetadata(PathBuf),
    Io(io::Error),
}

impl std::fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscoveryError::NoEngineFound => {
                write!(f, "no engine installation found on this host")
            }
            DiscoveryError::MissingVersionMetadata(root) => {
                write!(f, "no version metadata in {}", root.display())
            }
            DiscoveryError::Io(err) => write!(f, "discovery io error: {err}"),
        }
    }
}

impl std::error::Error for DiscoveryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DiscoveryError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for DiscoveryError {
    fn from(err: io::Error) -> Self {
        DiscoveryError::Io(err)
    }
}

/// Enumerates installed engine roots and probes each for version metadata.
/// Roots whose probe fails are logged at warn level and dropped; this call
/// never errors.
pub fn list_environments(logger: &Logger) -> Vec<EnvironmentInfo> {
    let mut environments = Vec::new();
    for root in discover_engine_roots() {
        match probe_version(&root) {
            Ok(version) => environments.push(EnvironmentInfo {
                engine_root: root,
                version,
            }),
            Err(err) => {
                logger
                    .with("root", root.to_string_lossy().to_string())
                    .with_error(&err)
                    .warn("Dropping engine root with unreadable version metadata");
            }
        }
    }
    environments
}

/// Picks the engine root to launch: the configured preference verbatim when
/// set (no existence check; a bad path surfaces later as a launch error),
/// otherwise the first discovered installation.
pub fn select_first_engine_root(config: &Config, logger: &Logger) -> Result<PathBuf, DiscoveryError> {
    if !config.preferred_engine_root.is_empty() {
        return Ok(PathBuf::from(&config.preferred_engine_root));
    }
    select_first_from(&list_environments(logger))
}

fn select_first_from(environments: &[EnvironmentInfo]) -> Result<PathBuf, DiscoveryError> {
    environments
        .first()
        .map(|environment| environment.engine_root.clone())
        .ok_or(DiscoveryError::NoEngineFound)
}

/// Picks the working directory the engine starts in. The configured
/// preference is stat'ed and any error propagates; the fallback is the user
/// home (with `Documents` appended on windows and macos), also stat'ed.
pub fn select_starting_dir(config: &Config) -> io::Result<PathBuf> {
    if !config.preferred_starting_directory.is_empty() {
        let preferred = PathBuf::from(&config.preferred_starting_directory);
        std::fs::metadata(&preferred)?;
        return Ok(preferred);
    }

    let home = user_home().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "user home directory is not set")
    })?;
    let chosen = starting_dir_under_home(&home);
    std::fs::metadata(&chosen)?;
    Ok(chosen)
}

fn starting_dir_under_home(home: &Path) -> PathBuf {
    if cfg!(any(windows, target_os = "macos")) {
        home.join("Documents")
    } else {
        home.to_path_buf()
    }
}

fn user_home() -> Option<PathBuf> {
    #[cfg(windows)]
    let key = "USERPROFILE";
    #[cfg(not(windows))]
    let key = "HOME";
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

fn discover_engine_roots() -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();
    let mut push_unique = |root: PathBuf| {
        if !roots.contains(&root) {
            roots.push(root);
        }
    };

    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(ENGINE_EXECUTABLE_NAME);
            if !candidate.is_file() {
                continue;
            }
            let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate);
            if let Some(root) = root_from_executable(&resolved) {
                push_unique(root);
            }
        }
    }

    for install_dir in conventional_install_dirs() {
        let Ok(entries) = std::fs::read_dir(&install_dir) else {
            continue;
        };
        for entry in entries.filter_map(|entry| entry.ok()) {
            let root = entry.path();
            if root.join("bin").join(ENGINE_EXECUTABLE_NAME).is_file() {
                push_unique(root);
            }
        }
    }

    roots
}

fn root_from_executable(executable: &Path) -> Option<PathBuf> {
    let parent = executable.parent()?;
    if parent.file_name().is_some_and(|name| name == "bin") {
        parent.parent().map(Path::to_path_buf)
    } else {
        Some(parent.to_path_buf())
    }
}

fn conventional_install_dirs() -> Vec<PathBuf> {
    #[cfg(windows)]
    {
        let program_files =
            std::env::var_os("ProgramFiles").unwrap_or_else(|| "C:\\Program Files".into());
        vec![PathBuf::from(program_files).join("Engine")]
    }
    #[cfg(not(windows))]
    {
        vec![PathBuf::from("/usr/local/engine"), PathBuf::from("/opt/engine")]
    }
}

fn probe_version(root: &Path) -> Result<String, DiscoveryError> {
    let text = std::fs::read_to_string(root.join(VERSION_INFO_FILE))?;
    extract_tag(&text, "release")
        .or_else(|| extract_tag(&text, "version"))
        .ok_or_else(|| DiscoveryError::MissingVersionMetadata(root.to_path_buf()))
}

fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    let value = text[start..end].trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
