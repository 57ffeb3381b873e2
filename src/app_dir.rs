use std::io;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::logger::Logger;

pub const MARKER_FILE_NAME: &str = ".application-marker";
pub const DEFAULT_BASE_DIR_PATTERN: &str = "mcp-engine-server-";

/// Per-server-instance working directory plus a stable instance id.
///
/// The directory is never deleted by the server; when it lives under the
/// system temp dir, cleanup is the OS tmp reaper's job. Every sub-directory
/// created through [`ApplicationDirectory::create_sub_dir`] embeds the
/// instance id so directories from different server runs stay attributable.
#[derive(Debug)]
pub struct ApplicationDirectory {
    base_dir: PathBuf,
    id: String,
}

impl ApplicationDirectory {
    pub fn new(config: &Config) -> io::Result<Self> {
        let base_dir = if config.base_dir.is_empty() {
            tempfile::Builder::new()
                .prefix(DEFAULT_BASE_DIR_PATTERN)
                .tempdir()?
                .keep()
        } else {
            let base = PathBuf::from(&config.base_dir);
            create_private_dir_all(&base)?;
            base
        };

        let id = if config.server_instance_id.is_empty() {
            let (_path, suffix) =
                create_file_with_unique_suffix(&base_dir.join(MARKER_FILE_NAME), "")?;
            suffix
        } else {
            config.server_instance_id.clone()
        };

        Ok(Self { base_dir, id })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creates a fresh sub-directory whose name starts with
    /// `<pattern>-<id>-`. A missing trailing dash on the pattern is added.
    pub fn create_sub_dir(&self, pattern: &str) -> io::Result<PathBuf> {
        let mut prefix = pattern.to_string();
        if !prefix.ends_with('-') {
            prefix.push('-');
        }
        prefix.push_str(&self.id);
        prefix.push('-');

        let dir = tempfile::Builder::new()
            .prefix(&prefix)
            .tempdir_in(&self.base_dir)?;
        Ok(dir.keep())
    }

    pub fn record_to_logger(&self, logger: &Logger) {
        logger
            .with("log-dir", self.base_dir.to_string_lossy().to_string())
            .with("id", self.id.clone())
            .info("Application directory state");
    }
}

/// Creates `<base>-<suffix><extension>` with a suffix unique within the
/// parent directory and returns the full path together with the bare
/// suffix. The file is created 0o600 and left in place.
pub fn create_file_with_unique_suffix(
    base: &Path,
    extension: &str,
) -> io::Result<(PathBuf, String)> {
    let parent = base.parent().unwrap_or_else(|| Path::new("."));
    let name = base
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::other("unique-suffix base has no file name"))?;

    let prefix = format!("{name}-");
    let file = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(extension)
        .tempfile_in(parent)?;
    let (_file, path) = file.keep().map_err(|err| err.error)?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| io::Error::other("unique-suffix file has no file name"))?;
    let suffix = file_name
        .strip_prefix(&prefix)
        .and_then(|rest| rest.strip_suffix(extension))
        .ok_or_else(|| io::Error::other("unique-suffix file does not match its pattern"))?
        .to_string();

    Ok((path, suffix))
}

fn create_private_dir_all(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(base_dir: &str, id: &str) -> Config {
        Config {
            base_dir: base_dir.to_string(),
            server_instance_id: id.to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn auto_allocated_base_dir_and_id() {
        let app_dir = ApplicationDirectory::new(&config_with("", "")).expect("new");
        assert!(app_dir.base_dir().exists());
        assert!(!app_dir.id().is_empty());

        let marker_prefix = format!("{MARKER_FILE_NAME}-{}", app_dir.id());
        let has_marker = std::fs::read_dir(app_dir.base_dir())
            .expect("read base dir")
            .filter_map(|entry| entry.ok())
            .any(|entry| entry.file_name().to_string_lossy() == marker_prefix);
        assert!(has_marker, "marker file carrying the id should exist");

        std::fs::remove_dir_all(app_dir.base_dir()).expect("cleanup");
    }

    #[test]
    fn supplied_base_dir_and_id_skip_marker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("logs");
        let config = config_with(base.to_str().expect("utf8 path"), "77");

        let app_dir = ApplicationDirectory::new(&config).expect("new");
        assert_eq!(app_dir.base_dir(), base.as_path());
        assert_eq!(app_dir.id(), "77");

        let marker_count = std::fs::read_dir(&base)
            .expect("read base dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(MARKER_FILE_NAME)
            })
            .count();
        assert_eq!(marker_count, 0, "no marker file when the id is supplied");
    }

    #[test]
    fn create_sub_dir_embeds_id_and_enforces_dash() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = config_with(temp.path().to_str().expect("utf8 path"), "abc");
        let app_dir = ApplicationDirectory::new(&config).expect("new");

        for pattern in ["sub", "sub-"] {
            let created = app_dir.create_sub_dir(pattern).expect("create sub dir");
            assert!(created.is_dir());
            let name = created
                .file_name()
                .and_then(|name| name.to_str())
                .expect("dir name");
            assert!(
                name.starts_with("sub-abc-"),
                "sub dir name {name:?} should start with sub-abc-"
            );
        }
    }

    #[test]
    fn unique_suffix_round_trips_extension() {
        let temp = tempfile::tempdir().expect("tempdir");
        let base = temp.path().join("report");
        let (path, suffix) = create_file_with_unique_suffix(&base, ".log").expect("create");
        assert!(path.exists());
        assert!(!suffix.is_empty());
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .expect("file name");
        assert_eq!(name, format!("report-{suffix}.log"));
    }
}
