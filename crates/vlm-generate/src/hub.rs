use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::Api;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::VlmError;
use crate::model::ensure_supported;

const CONFIG_FILE: &str = "config.json";
const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

// files fetched when a model is pulled from the hub
const SNAPSHOT_SUFFIXES: [&str; 5] = [".json", ".safetensors", ".py", ".txt", ".tiktoken"];
const SNAPSHOT_FILES: [&str; 1] = ["tokenizer.model"];

/// Options forwarded to the model loader.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Accept models whose config maps to custom modelling code (`auto_map`).
    pub trust_remote_code: bool,
}

/// The `config.json` of a model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Architecture family, e.g. `paligemma` or `llava`.
    pub model_type: String,
    raw: Value,
}

impl ModelConfig {
    pub fn from_value(raw: Value) -> Result<Self, VlmError> {
        let model_type = raw["model_type"]
            .as_str()
            .ok_or_else(|| VlmError::MissingConfigField {
                field: "model_type".to_string(),
                file: CONFIG_FILE.to_string(),
            })?
            .to_string();
        Ok(Self { model_type, raw })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.raw.get(key)
    }

    /// Deserialize the whole config into a backend specific type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, VlmError> {
        Ok(serde_json::from_value(self.raw.clone())?)
    }

    /// Whether the model needs code that is not part of the upstream libraries.
    pub fn requires_remote_code(&self) -> bool {
        self.raw.get("auto_map").is_some()
    }
}

/// Resolve a model location to a local directory.
///
/// An existing path is returned as is. Anything else is treated as a HuggingFace Hub
/// repository id: `config.json` is fetched first and checked with
/// [`ensure_supported`], then the tokenizer, processor and weight files are downloaded
/// into the hub cache and the snapshot directory holding them is returned.
pub fn get_model_path(path_or_repo: &str) -> Result<PathBuf, VlmError> {
    let local = Path::new(path_or_repo);
    if local.exists() {
        debug!("Using local model directory: {}", local.display());
        return Ok(local.to_path_buf());
    }

    info!("Loading model from HuggingFace Hub: {path_or_repo}");

    let api = Api::new()?;
    let repo = api.model(path_or_repo.to_string());

    let config = ModelConfig::from_value(read_json(&repo.get(CONFIG_FILE)?)?)?;
    ensure_supported(&config)?;

    let mut snapshot_dir = None;
    for sibling in repo.info()?.siblings {
        if !is_snapshot_file(&sibling.rfilename) {
            continue;
        }
        let file = repo.get(&sibling.rfilename)?;
        debug!("Fetched {} -> {}", sibling.rfilename, file.display());

        if snapshot_dir.is_none() {
            // walk up as many levels as the repo-relative name has components
            let depth = Path::new(&sibling.rfilename).components().count();
            snapshot_dir = file.ancestors().nth(depth).map(Path::to_path_buf);
        }
    }

    snapshot_dir.ok_or_else(|| VlmError::EmptyRepository(path_or_repo.to_string()))
}

fn is_snapshot_file(name: &str) -> bool {
    SNAPSHOT_SUFFIXES.iter().any(|suffix| name.ends_with(suffix))
        || SNAPSHOT_FILES
            .iter()
            .any(|file| Path::new(name).file_name() == Some(OsStr::new(file)))
}

/// Read `config.json` from a model directory.
pub fn load_config(model_path: &Path) -> Result<ModelConfig, VlmError> {
    let raw: Value = read_json(&model_path.join(CONFIG_FILE))?;
    ModelConfig::from_value(raw)
}

/// Read a JSON file from a model directory, `None` when the file does not exist.
pub(crate) fn read_optional_json(path: &Path) -> Result<Option<Value>, VlmError> {
    if !path.is_file() {
        return Ok(None);
    }
    read_json(path).map(Some)
}

/// Read a JSON file of a model directory into `T`.
pub(crate) fn read_model_file<T: DeserializeOwned>(
    model_path: &Path,
    file: &str,
) -> Result<T, VlmError> {
    let data = fs::read_to_string(model_path.join(file))?;
    Ok(serde_json::from_str(&data)?)
}

pub(crate) fn read_json(path: &Path) -> Result<Value, VlmError> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// List the safetensors files holding the model weights.
///
/// Sharded checkpoints are resolved through `model.safetensors.index.json`, otherwise
/// every `*.safetensors` file of the directory is used.
pub fn weight_files(model_path: &Path) -> Result<Vec<PathBuf>, VlmError> {
    let files: BTreeSet<PathBuf> =
        if let Some(index) = read_optional_json(&model_path.join(WEIGHTS_INDEX_FILE))? {
            let weight_map = index["weight_map"].as_object().ok_or_else(|| {
                VlmError::MissingConfigField {
                    field: "weight_map".to_string(),
                    file: WEIGHTS_INDEX_FILE.to_string(),
                }
            })?;
            weight_map
                .values()
                .filter_map(Value::as_str)
                .map(|file| model_path.join(file))
                .collect()
        } else {
            fs::read_dir(model_path)?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "safetensors"))
                .collect()
        };

    if files.is_empty() {
        return Err(VlmError::MissingWeights(model_path.display().to_string()));
    }

    Ok(files.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join("config.json"),
            r#"{"model_type": "paligemma", "projection_dim": 2048}"#,
        )?;

        let config = load_config(dir.path())?;
        assert_eq!(config.model_type, "paligemma");
        assert_eq!(config.get("projection_dim"), Some(&Value::from(2048)));
        assert!(!config.requires_remote_code());
        Ok(())
    }

    #[test]
    fn test_load_config_without_model_type() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("config.json"), r#"{"auto_map": {}}"#)?;

        assert!(matches!(
            load_config(dir.path()),
            Err(VlmError::MissingConfigField { field, .. }) if field == "model_type"
        ));
        Ok(())
    }

    #[test]
    fn test_load_config_missing_file() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(load_config(dir.path()), Err(VlmError::IoError(_))));
        Ok(())
    }

    #[test]
    fn test_local_model_path() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().to_str().ok_or("non utf-8 temp dir")?;
        assert_eq!(get_model_path(path)?, dir.path());
        Ok(())
    }

    #[test]
    fn test_snapshot_patterns() {
        assert!(is_snapshot_file("config.json"));
        assert!(is_snapshot_file("model-00001-of-00002.safetensors"));
        assert!(is_snapshot_file("tokenizer.model"));
        assert!(is_snapshot_file("sub/tokenizer.model"));
        assert!(!is_snapshot_file("README.md"));
        assert!(!is_snapshot_file("pytorch_model.bin"));
    }

    #[test]
    fn test_weight_files_from_index() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join(WEIGHTS_INDEX_FILE),
            r#"{"weight_map": {
                "a": "model-00002-of-00002.safetensors",
                "b": "model-00001-of-00002.safetensors",
                "c": "model-00001-of-00002.safetensors"
            }}"#,
        )?;

        assert_eq!(
            weight_files(dir.path())?,
            vec![
                dir.path().join("model-00001-of-00002.safetensors"),
                dir.path().join("model-00002-of-00002.safetensors"),
            ]
        );
        Ok(())
    }

    #[test]
    fn test_weight_files_from_directory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        assert!(matches!(
            weight_files(dir.path()),
            Err(VlmError::MissingWeights(_))
        ));

        fs::write(dir.path().join("model.safetensors"), b"")?;
        fs::write(dir.path().join("config.json"), b"{}")?;
        assert_eq!(
            weight_files(dir.path())?,
            vec![dir.path().join("model.safetensors")]
        );
        Ok(())
    }

    // cargo test -p vlm-generate test_hub_model_path -- --ignored
    #[test]
    #[ignore = "Requires network access"]
    fn test_hub_model_path() -> Result<(), Box<dyn std::error::Error>> {
        let path = get_model_path("google/paligemma-3b-mix-224")?;
        assert!(path.join("config.json").is_file());
        Ok(())
    }
}
