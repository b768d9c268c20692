//! Model file discovery
//!
//! Workers load their model from the models directory, which is bind-mounted
//! into every container. Setup requests name models by file name relative to
//! that directory.

use sdk::errors::EngineError;
use std::path::Path;
use tracing::debug;

/// File names of the models available in `dir`, sorted
///
/// Only regular files are listed; dotfiles and subdirectories are skipped.
pub async fn list_models(dir: &Path) -> Result<Vec<String>, EngineError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut models = Vec::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            debug!("Skipping model file with a non UTF-8 name: {:?}", entry.path());
            continue;
        };

        if name.starts_with('.') {
            continue;
        }

        models.push(name);
    }

    models.sort();
    Ok(models)
}
