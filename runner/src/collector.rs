use crate::config::{ConfigErrors, PromptConfig};
use globset::GlobBuilder;
use ignore::{DirEntry, WalkBuilder};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

/// A prompt file handed to the assistants
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PromptRef {
    pub name: String,
    pub path: PathBuf,
}

impl PromptRef {
    /// name the prompt after its file stem
    pub fn from_path(path: PathBuf) -> Self {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());

        Self { name, path }
    }
}

/// walk all prompt paths and return the matching files sorted by path
pub fn collect_prompts(config: &PromptConfig) -> Result<Vec<PromptRef>, ConfigErrors> {
    let glob = GlobBuilder::new(&config.glob).build()?.compile_matcher();
    let roots = config
        .paths
        .iter()
        .chain(config.path.iter())
        .unique()
        .collect_vec();

    let Some((first, others)) = roots.split_first() else {
        warn!("No prompt paths configured");
        return Ok(Vec::new());
    };

    debug!("Filtering prompts with glob: {glob:?}");

    let mut builder = WalkBuilder::new(first.as_str());
    // add other paths
    others.iter().for_each(|path| {
        builder.add(path.as_str());
    });

    let prompts = builder
        .build()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("Failed to search for prompts: {e}");
                None
            }
        })
        .filter(|entry| entry.file_type().is_some_and(|kind| kind.is_file()))
        .filter(|entry| glob.is_match(entry.path()))
        .map(DirEntry::into_path)
        .sorted()
        .dedup()
        .map(PromptRef::from_path)
        .collect_vec();

    if prompts.is_empty() {
        warn!(
            "No prompt matched '{}' in {}",
            config.glob,
            roots.iter().join(", ")
        );
    }

    Ok(prompts)
}
