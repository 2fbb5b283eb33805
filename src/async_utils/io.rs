//! I/O utilities.
//!
//! This module is responsible for reading JSON and TOML config files,
//! opening output writers, and writing files atomically. Output documents and
//! checkpoints must never be observed half-written, so everything we persist
//! goes through [`write_file_atomic`].

use std::io::Write as _;

use tempfile::NamedTempFile;
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _},
};

use crate::prelude::*;

use super::spawn_blocking_propagating_panics;

/// Read TOML or JSON from a file. Files ending in `.json` are parsed as JSON,
/// and everything else as TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: serde::de::DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        serde_json::from_str(&data).with_context(|| {
            format!("Failed to parse JSON from file at path: {:?}", path)
        })
    } else {
        toml::from_str(&data).with_context(|| {
            format!("Failed to parse TOML from file at path: {:?}", path)
        })
    }
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a string to either standard output or a file, followed by a newline.
pub async fn write_output(path: Option<&Path>, text: &str) -> Result<()> {
    let mut wtr = create_writer(path).await?;
    wtr.write_all(text.as_bytes())
        .await
        .context("Failed to write output")?;
    wtr.write_all(b"\n")
        .await
        .context("Failed to write newline to output")?;
    wtr.flush().await.context("Failed to flush output")?;
    Ok(())
}

/// Write `data` to `path` by way of a temporary file in the same directory,
/// which is then renamed over `path`. Readers see either the old contents or
/// the new contents, never a partial file.
pub fn write_file_atomic_blocking(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temporary file in {:?}", dir))?;
    tmp.write_all(data)
        .with_context(|| format!("Failed to write temporary file for {:?}", path))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("Failed to sync temporary file for {:?}", path))?;
    tmp.persist(path)
        .with_context(|| format!("Failed to move temporary file to {:?}", path))?;
    Ok(())
}

/// Async version of [`write_file_atomic_blocking`].
pub async fn write_file_atomic(path: PathBuf, data: Vec<u8>) -> Result<()> {
    spawn_blocking_propagating_panics(move || write_file_atomic_blocking(&path, &data))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_file_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_file_atomic(path.clone(), b"first".to_vec()).await.unwrap();
        write_file_atomic(path.clone(), b"second".to_vec()).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        // Only the target file remains; no temporary files are left behind.
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_read_json_or_toml_by_extension() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Example {
            name: String,
        }

        let dir = tempfile::tempdir().unwrap();
        let json = dir.path().join("a.json");
        let toml = dir.path().join("a.toml");
        std::fs::write(&json, r#"{"name": "json"}"#).unwrap();
        std::fs::write(&toml, r#"name = "toml""#).unwrap();

        let from_json: Example = read_json_or_toml(&json).await.unwrap();
        let from_toml: Example = read_json_or_toml(&toml).await.unwrap();
        assert_eq!(from_json.name, "json");
        assert_eq!(from_toml.name, "toml");
    }
}
