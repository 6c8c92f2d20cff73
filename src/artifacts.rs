use std::path::{Path, PathBuf};

use tracing::info;

use crate::constants::artifacts::{
    DEMO_FILE_EXTENSION, DEMO_FILE_PREFIX, DEMO_SET_VERSION, FILE_FINGERPRINT_LEN,
};
use crate::data::DemoSet;
use crate::errors::PipelineError;
use crate::transport::fs::{list_files, write_atomic};

/// File name for `demo_set` (`demos_<fingerprint prefix>.json`).
pub fn demo_set_file_name(demo_set: &DemoSet) -> String {
    let prefix_len = FILE_FINGERPRINT_LEN.min(demo_set.fingerprint.len());
    format!(
        "{DEMO_FILE_PREFIX}{}.{DEMO_FILE_EXTENSION}",
        &demo_set.fingerprint[..prefix_len]
    )
}

/// Write `demo_set` into `dir`, replacing any artifact with the same address atomically.
pub fn persist_demo_set(dir: &Path, demo_set: &DemoSet) -> Result<PathBuf, PipelineError> {
    let path = dir.join(demo_set_file_name(demo_set));
    let raw = serde_json::to_vec_pretty(demo_set)?;
    write_atomic(&path, &raw).map_err(|err| {
        PipelineError::Artifact(format!("failed writing {}: {err}", path.display()))
    })?;
    info!(
        "[counterfactuals:artifacts] wrote {} demonstrations to {}",
        demo_set.len(),
        path.display()
    );
    Ok(path)
}

/// Load a persisted DemoSet.
pub fn load_demo_set(path: &Path) -> Result<DemoSet, PipelineError> {
    let bytes = std::fs::read(path)?;
    let demo_set: DemoSet = serde_json::from_slice(&bytes)
        .map_err(|err| PipelineError::Artifact(format!("corrupt {}: {err}", path.display())))?;
    if demo_set.version != DEMO_SET_VERSION {
        return Err(PipelineError::Artifact(format!(
            "{} has version {}, expected {DEMO_SET_VERSION}",
            path.display(),
            demo_set.version
        )));
    }
    Ok(demo_set)
}

/// Persisted DemoSet files in `dir`, sorted by name.
pub fn list_demo_sets(dir: &Path) -> Vec<PathBuf> {
    list_files(dir, DEMO_FILE_PREFIX, DEMO_FILE_EXTENSION)
}
