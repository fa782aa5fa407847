//! Desired-state sources.

use std::path::{Path, PathBuf};

use ferry_core::{Application, DesiredManifest};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("no manifests for {0}")]
    NotFound(String),
    #[error("reading {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("parsing {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Renders an application's source into concrete resource documents.
#[async_trait::async_trait]
pub trait ManifestGenerator: Send + Sync {
    async fn generate(&self, app: &Application) -> Result<Vec<DesiredManifest>, ManifestError>;
}

/// Split a multi-document YAML stream. Empty documents are skipped and
/// `kind: List` documents are flattened into their items.
pub fn parse_manifests(text: &str) -> Result<Vec<DesiredManifest>, String> {
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let v = Value::deserialize(doc).map_err(|e| e.to_string())?;
        match v {
            Value::Null => {}
            Value::Object(ref m) if m.get("kind").and_then(|k| k.as_str()) == Some("List") => {
                let items = m.get("items").and_then(|i| i.as_array()).cloned().unwrap_or_default();
                out.extend(items.into_iter().filter(|i| !i.is_null()).map(DesiredManifest::new));
            }
            Value::Object(_) => out.push(DesiredManifest::new(v)),
            other => return Err(format!("expected a mapping, found {}", type_name(&other))),
        }
    }
    Ok(out)
}

fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a sequence",
        Value::Object(_) => "a mapping",
    }
}

/// Reads `<root>/<dir>/*.yaml` (and `.yml`, `.json`) in file-name order, where
/// `<dir>` is the application's `source.path` or, failing that, its name.
#[derive(Debug, Clone)]
pub struct DirManifestGenerator {
    root: PathBuf,
}

impl DirManifestGenerator {
    pub fn new(root: impl Into<PathBuf>) -> Self { Self { root: root.into() } }

    pub fn root(&self) -> &Path { &self.root }

    fn dir_for(&self, app: &Application) -> PathBuf {
        let rel = app.source.path.as_deref().filter(|p| !p.is_empty()).unwrap_or(&app.name);
        self.root.join(rel)
    }
}

#[async_trait::async_trait]
impl ManifestGenerator for DirManifestGenerator {
    async fn generate(&self, app: &Application) -> Result<Vec<DesiredManifest>, ManifestError> {
        let dir = self.dir_for(app);
        let io = |path: &Path| { let path = path.to_path_buf(); move |source| ManifestError::Io { path, source } };
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ManifestError::NotFound(dir.display().to_string())),
            Err(e) => return Err(io(&dir)(e)),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(io(&dir))? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") { files.push(path); }
        }
        files.sort();
        let mut out = Vec::new();
        for path in files {
            let text = tokio::fs::read_to_string(&path).await.map_err(io(&path))?;
            let docs = parse_manifests(&text).map_err(|message| ManifestError::Parse { path: path.clone(), message })?;
            debug!(app = %app.name, file = %path.display(), docs = docs.len(), "manifests: file loaded");
            out.extend(docs);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_doc_and_lists_are_flattened() {
        let text = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
---
---
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: Secret
  metadata:
    name: b
- apiVersion: v1
  kind: Service
  metadata:
    name: c
";
        let docs = parse_manifests(text).unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.raw["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(parse_manifests("- just\n- a list\n").unwrap_err().contains("sequence"));
    }

    #[tokio::test]
    async fn directory_generator_reads_sorted_files() {
        let root = std::env::temp_dir().join(format!("ferry-manifests-{}", uuid::Uuid::new_v4()));
        let dir = root.join("guestbook");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("b.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: second\n").await.unwrap();
        tokio::fs::write(dir.join("a.yaml"), "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: first\n").await.unwrap();
        tokio::fs::write(dir.join("notes.txt"), "ignored").await.unwrap();

        let gen = DirManifestGenerator::new(&root);
        let app = Application { name: "guestbook".into(), ..Default::default() };
        let docs = gen.generate(&app).await.unwrap();
        let names: Vec<&str> = docs.iter().map(|d| d.raw["metadata"]["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["first", "second"]);

        let missing = Application { name: "nope".into(), ..Default::default() };
        assert!(matches!(gen.generate(&missing).await, Err(ManifestError::NotFound(_))));
        tokio::fs::remove_dir_all(&root).await.unwrap();
    }
}
