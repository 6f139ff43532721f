//! Locating model files on disk
//!
//! A model id is either a local directory or a repository id already present
//! in the Hugging Face cache, looked up through `hf_hub`. Nothing is
//! downloaded.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hf_hub::{Cache, Repo, RepoType};
use serde::Deserialize;
use tracing::debug;

use crate::{Error, Result};

const DEFAULT_REVISION: &str = "main";
const CONFIG_FILE: &str = "config.json";
const SAFETENSORS_INDEX: &str = "model.safetensors.index.json";

/// Resolve `model_id` at `revision` to a directory containing its files.
///
/// # Errors
/// Returns [`Error::ModelNotFound`] if neither a local directory nor a cached
/// snapshot matches.
pub fn resolve_model_dir(model_id: &str, revision: Option<&str>) -> Result<PathBuf> {
    let local = Path::new(model_id);
    if local.is_dir() {
        return Ok(local.to_path_buf());
    }
    resolve_in_cache(&hub_cache(), model_id, revision)
}

/// Resolve `model_id` inside an explicit Hugging Face cache.
///
/// The revision is a branch, tag or commit the cache has a ref for; the
/// result is the snapshot directory holding that commit's `config.json`.
///
/// # Errors
/// Returns [`Error::ModelNotFound`] if no cached snapshot has a config.
pub fn resolve_in_cache(cache: &Cache, model_id: &str, revision: Option<&str>) -> Result<PathBuf> {
    let revision = revision.unwrap_or(DEFAULT_REVISION);
    let repo = cache.repo(Repo::with_revision(
        model_id.to_string(),
        RepoType::Model,
        revision.to_string(),
    ));
    let config = repo.get(CONFIG_FILE).ok_or_else(|| {
        Error::ModelNotFound(format!(
            "{model_id}@{revision} (no cached {CONFIG_FILE} under {})",
            cache.path().display()
        ))
    })?;
    // Every file of a snapshot sits next to its config.
    let snapshot = config
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| Error::ModelNotFound(format!("{model_id}@{revision}")))?;
    debug!(model_id, revision, snapshot = %snapshot.display(), "Resolved cached snapshot");
    Ok(snapshot)
}

/// `HF_HUB_CACHE` if set, otherwise the cache under `HF_HOME` or the home
/// directory.
fn hub_cache() -> Cache {
    match std::env::var("HF_HUB_CACHE") {
        Ok(dir) => Cache::new(PathBuf::from(dir)),
        Err(_) => Cache::from_env(),
    }
}

#[derive(Deserialize)]
struct SafeTensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// List the weight files with `extension` in `dir`, in a deterministic order.
///
/// When a `model.safetensors.index.json` is present, its `weight_map` decides
/// which files belong to the checkpoint.
///
/// # Errors
/// Returns [`Error::WeightFilesNotFound`] if no file matches.
pub fn weight_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let index_path = dir.join(SAFETENSORS_INDEX);
    let mut paths: Vec<PathBuf> = if extension == ".safetensors" && index_path.is_file() {
        let index: SafeTensorsIndex =
            serde_json::from_str(&std::fs::read_to_string(&index_path)?)?;
        index
            .weight_map
            .into_values()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .map(|file| dir.join(file))
            .collect()
    } else {
        std::fs::read_dir(dir)?
            .filter_map(std::result::Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.is_file()
                    && p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.ends_with(extension))
            })
            .collect()
    };

    if paths.is_empty() {
        return Err(Error::WeightFilesNotFound {
            dir: dir.display().to_string(),
            extension: extension.to_string(),
        });
    }
    // Sort for deterministic loading order
    paths.sort();
    Ok(paths)
}
