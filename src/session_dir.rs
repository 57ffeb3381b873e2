use std::io;
use std::path::{Path, PathBuf};

use crate::app_dir::ApplicationDirectory;
use crate::engine_files;
use crate::logger::Logger;

pub const SESSION_DIR_PATTERN: &str = "engine-session";
pub const PACKAGE_DIR_NAME: &str = "+engine_pkg";
pub const CERTIFICATE_FILE_NAME: &str = "cert.pem";
pub const CERTIFICATE_KEY_FILE_NAME: &str = "cert.key";

/// Per-session directory under the application directory, holding the
/// engine package folder and the computed certificate pair paths. The
/// certificate files themselves are written by the launcher's TLS setup.
#[derive(Debug, Clone)]
pub struct SessionDirectory {
    path: PathBuf,
}

impl SessionDirectory {
    pub fn create(app_dir: &ApplicationDirectory, logger: &Logger) -> io::Result<Self> {
        let path = app_dir.create_sub_dir(SESSION_DIR_PATTERN)?;
        let session = Self { path };

        create_private_dir(&session.package_dir())?;
        for (name, bytes) in engine_files::get_all() {
            write_private_file(&session.package_dir().join(name), bytes)?;
        }

        logger
            .with("path", session.path.to_string_lossy().to_string())
            .debug("Created session directory");
        Ok(session)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn package_dir(&self) -> PathBuf {
        self.path.join(PACKAGE_DIR_NAME)
    }

    pub fn certificate_file(&self) -> PathBuf {
        self.path.join(CERTIFICATE_FILE_NAME)
    }

    pub fn certificate_key_file(&self) -> PathBuf {
        self.path.join(CERTIFICATE_KEY_FILE_NAME)
    }
}

fn create_private_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new().mode(0o700).create(path)
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir(path)
    }
}

fn write_private_file(path: &Path, bytes: &[u8]) -> io::Result<()> {
    use std::io::Write;

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    file.write_all(bytes)
}
