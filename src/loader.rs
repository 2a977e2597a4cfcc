//! Source loaders.
//!
//! A [`Loader`] turns an external source into [`LoadedItem`]s that the
//! engine ingests under one `(source_type, source_path)`. Loaders may return
//! a single item holding the whole document or several pre-split items; the
//! engine re-chunks either way so that size limits and metadata stay uniform.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::path::Path;

/// One unit of loaded content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedItem {
    pub content: String,
    pub title: Option<String>,
    /// Loader-specific extras (URL, page number, ...).
    pub metadata: Value,
}

impl LoadedItem {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            title: None,
            metadata: Value::Null,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[async_trait]
pub trait Loader: Send + Sync {
    fn name(&self) -> &str;

    /// Load `source` as content of kind `kind` (`markdown`, `text`, ...).
    async fn load(&self, source: &str, kind: &str, options: &Value) -> Result<Vec<LoadedItem>>;
}

/// Reads a local UTF-8 file as a single item titled after its file stem.
pub struct FileLoader;

#[async_trait]
impl Loader for FileLoader {
    fn name(&self) -> &str {
        "file"
    }

    async fn load(&self, source: &str, _kind: &str, _options: &Value) -> Result<Vec<LoadedItem>> {
        let path = Path::new(source);
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let content = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(_) => bail!("{} is not valid UTF-8", path.display()),
        };

        let mut item = LoadedItem::new(content);
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            item = item.with_title(stem);
        }
        item.metadata = serde_json::json!({ "path": path.display().to_string() });
        Ok(vec![item])
    }
}

/// Guess a source kind from a file extension.
pub fn kind_for_path(path: &str) -> &'static str {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "md" | "markdown" | "mdx" => "markdown",
        "html" | "htm" => "web",
        "rs" | "py" | "js" | "ts" | "go" | "java" | "c" | "h" | "cpp" | "sh" | "rb" | "kt" => {
            "code"
        }
        _ => "text",
    }
}
