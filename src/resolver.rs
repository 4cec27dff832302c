//! Backend resolution
//! Maps a backend name (first Host label) to the socket or directory serving it

use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::RouteError;

/// Resolves backend names to addresses
///
/// The returned path is probed by the proxy: a directory is served as static
/// files, anything else is treated as a Unix socket speaking HTTP/1.1.
#[async_trait]
pub trait BackendResolver: Send + Sync {
    async fn resolve(&self, name: &str) -> Result<PathBuf, RouteError>;

    /// Short human description used in startup announcements
    fn describe(&self) -> String {
        "resolver(*)".to_string()
    }
}

/// Default resolver: `<base_dir>/<name>`
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    base_dir: PathBuf,
}

impl DirectoryResolver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }
}

#[async_trait]
impl BackendResolver for DirectoryResolver {
    async fn resolve(&self, name: &str) -> Result<PathBuf, RouteError> {
        Ok(self.base_dir.join(name))
    }

    fn describe(&self) -> String {
        self.base_dir.join("*").display().to_string()
    }
}
