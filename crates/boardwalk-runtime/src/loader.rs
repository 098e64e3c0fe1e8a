use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use boardwalk_core::error::{BoardwalkError, Result};
use boardwalk_core::traits::GraphLoader;
use boardwalk_core::types::GraphDescriptor;

/// Loads boards from the local filesystem.
///
/// Relative locations resolve against the `base` passed to `load` (a board
/// file, recognized by existing as a file or ending in `.json`, or a
/// directory), else against the loader's own root.
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    root: Option<PathBuf>,
}

impl FileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, location: &str, base: Option<&str>) -> PathBuf {
        let location = location.strip_prefix("file://").unwrap_or(location);
        let path = Path::new(location);
        if path.is_absolute() {
            return path.to_path_buf();
        }
        let dir = match base {
            Some(base) => {
                let base = Path::new(base.strip_prefix("file://").unwrap_or(base));
                if base.is_file() || base.extension().is_some_and(|e| e == "json") {
                    base.parent().map(Path::to_path_buf).unwrap_or_default()
                } else {
                    base.to_path_buf()
                }
            }
            None => self.root.clone().unwrap_or_default(),
        };
        dir.join(path)
    }
}

impl GraphLoader for FileLoader {
    fn load<'a>(
        &'a self,
        location: &'a str,
        base: Option<&'a str>,
    ) -> BoxFuture<'a, Result<GraphDescriptor>> {
        Box::pin(async move {
            if location.starts_with("http://") || location.starts_with("https://") {
                return Err(BoardwalkError::GraphLoad {
                    url: location.to_string(),
                    message: "remote boards are not supported by the file loader".into(),
                });
            }
            let path = self.resolve(location, base);
            debug!(path = %path.display(), "Loading board");
            let load_error = |message: String| BoardwalkError::GraphLoad {
                url: path.display().to_string(),
                message,
            };
            let text = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| load_error(e.to_string()))?;
            let mut graph = GraphDescriptor::from_json(&text).map_err(|e| load_error(e.to_string()))?;
            if graph.url.is_none() {
                graph.url = Some(path.display().to_string());
            }
            Ok(graph)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOARD: &str = r#"{"title":"child","nodes":[{"id":"x","type":"input"}],"edges":[]}"#;

    #[tokio::test]
    async fn test_load_relative_to_base_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("child.json"), BOARD).unwrap();
        let base = dir.path().join("parent.json");

        let loader = FileLoader::new();
        let graph = loader
            .load("child.json", Some(base.to_str().unwrap()))
            .await
            .unwrap();
        assert_eq!(graph.title.as_deref(), Some("child"));
        assert!(graph.url.unwrap().ends_with("child.json"));
    }

    #[tokio::test]
    async fn test_dotted_directory_base_is_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let boards = dir.path().join("boards.v2");
        std::fs::create_dir(&boards).unwrap();
        std::fs::write(boards.join("child.json"), BOARD).unwrap();

        let loader = FileLoader::new();
        let graph = loader
            .load("child.json", Some(boards.to_str().unwrap()))
            .await
            .unwrap();
        assert!(graph.url.unwrap().contains("boards.v2"));
    }

    #[tokio::test]
    async fn test_load_relative_to_root() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("child.json"), BOARD).unwrap();
        let loader = FileLoader::with_root(dir.path());
        assert!(loader.load("child.json", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_and_invalid_boards() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{\"nodes\": 5}").unwrap();
        let loader = FileLoader::with_root(dir.path());

        let err = loader.load("nope.json", None).await.unwrap_err();
        assert_eq!(err.kind(), "GraphLoad");
        let err = loader.load("bad.json", None).await.unwrap_err();
        assert!(matches!(err, BoardwalkError::GraphLoad { .. }));
        let err = loader.load("https://example.com/b.json", None).await.unwrap_err();
        assert!(err.to_string().contains("remote"));
    }
}
