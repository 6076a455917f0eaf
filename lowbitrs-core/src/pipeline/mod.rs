use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::streamer::TokenStreamer;

mod echo;
pub use echo::{EchoLoader, EchoPipeline};

#[derive(Debug, Error)]
pub enum LowBitError {
    #[error("no low-bit checkpoint at `{0}`")]
    NotFound(PathBuf),
    #[error("malformed low-bit checkpoint: {0}")]
    Malformed(String),
}

/// Options handed to a loader. Round-trips through the low-bit checkpoint
/// metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadOptions {
    pub max_context_len: usize,
    pub max_prompt_len: usize,
    pub quantization_group_size: usize,
    pub transpose_value_cache: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            max_context_len: 1024,
            max_prompt_len: 512,
            quantization_group_size: 0,
            transpose_value_cache: true,
        }
    }
}

/// Where the model weights come from: a local checkpoint folder or a hub
/// model id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ModelSource {
    Local(PathBuf),
    HubRepo(String),
}

impl ModelSource {
    /// An existing filesystem path wins; anything else is treated as a hub id.
    pub fn parse(s: &str) -> Self {
        let path = PathBuf::from(s);
        if path.exists() {
            Self::Local(path)
        } else {
            Self::HubRepo(s.to_string())
        }
    }
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local(path) => write!(f, "{}", path.display()),
            Self::HubRepo(id) => write!(f, "{id}"),
        }
    }
}

/// A loaded model able to generate token sequences.
///
/// `generate` returns the full sequence: prompt ids followed by generated ids.
/// When a streamer is passed, the pipeline feeds it each newly produced id and
/// calls `end()` before returning.
pub trait Pipeline {
    fn name(&self) -> String;
    fn generate(
        &mut self,
        input_ids: &[u32],
        max_new_tokens: usize,
        streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Vec<u32>>;
    /// Persist a low-bit checkpoint directory. Its format is owned by the
    /// pipeline and opaque to the harness.
    fn save_low_bit(&self, dir: &Path) -> Result<()>;
}

pub trait PipelineLoader {
    fn load(&self, source: &ModelSource, opts: &LoadOptions) -> Result<Box<dyn Pipeline>>;
    fn load_low_bit(&self, dir: &Path, opts: &LoadOptions) -> Result<Box<dyn Pipeline>>;
}

/// Maps a model source to a concrete loader. This is the seam where engine
/// backends register; in-tree it resolves to the echo loader.
pub struct LoaderBuilder {
    source: ModelSource,
}

impl LoaderBuilder {
    pub fn new(source: ModelSource) -> Self {
        Self { source }
    }

    pub fn build(self) -> Result<Box<dyn PipelineLoader>> {
        info!("Using echo pipeline loader for `{}`", self.source);
        Ok(Box::new(EchoLoader))
    }
}

/// Load-if-exists/save-if-absent orchestration over a low-bit checkpoint
/// directory.
///
/// If `lowbit_dir` is set and exists, the checkpoint is loaded directly and
/// the source is never touched. Otherwise the model is loaded from `source`,
/// and if `lowbit_dir` is set the freshly loaded pipeline is saved there so
/// the next run takes the fast path.
pub fn load_auto(
    loader: &dyn PipelineLoader,
    source: &ModelSource,
    lowbit_dir: Option<&Path>,
    opts: &LoadOptions,
) -> Result<Box<dyn Pipeline>> {
    if let Some(dir) = lowbit_dir {
        if dir.exists() {
            info!("Loading low-bit checkpoint from `{}`", dir.display());
            return loader.load_low_bit(dir, opts);
        }
    }
    let pipeline = loader.load(source, opts)?;
    if let Some(dir) = lowbit_dir {
        info!("Saving low-bit checkpoint to `{}`", dir.display());
        pipeline.save_low_bit(dir)?;
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_prefers_existing_paths() {
        let dir = tempfile::tempdir().unwrap();
        let local = ModelSource::parse(dir.path().to_str().unwrap());
        assert!(matches!(local, ModelSource::Local(_)));

        let hub = ModelSource::parse("meta-llama/Meta-Llama-3-8B-Instruct");
        assert_eq!(
            hub,
            ModelSource::HubRepo("meta-llama/Meta-Llama-3-8B-Instruct".to_string())
        );
    }

    #[test]
    fn load_auto_saves_fresh_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let lowbit = dir.path().join("lowbit");
        let source = ModelSource::HubRepo("some/model".to_string());
        let opts = LoadOptions::default();

        let pipeline = load_auto(&EchoLoader, &source, Some(&lowbit), &opts).unwrap();
        assert_eq!(pipeline.name(), "echo(some/model)");
        assert!(lowbit.join("lowbit_config.json").exists());
    }

    #[test]
    fn load_auto_takes_checkpoint_path_on_second_run() {
        let dir = tempfile::tempdir().unwrap();
        let lowbit = dir.path().join("lowbit");
        let opts = LoadOptions::default();

        let first = ModelSource::HubRepo("first/model".to_string());
        load_auto(&EchoLoader, &first, Some(&lowbit), &opts).unwrap();

        // A different source string must be ignored: the checkpoint wins.
        let second = ModelSource::HubRepo("second/model".to_string());
        let pipeline = load_auto(&EchoLoader, &second, Some(&lowbit), &opts).unwrap();
        assert_eq!(pipeline.name(), "echo(first/model)");
    }

    #[test]
    fn load_auto_without_lowbit_dir_never_saves() {
        let source = ModelSource::HubRepo("some/model".to_string());
        let pipeline = load_auto(&EchoLoader, &source, None, &LoadOptions::default()).unwrap();
        assert_eq!(pipeline.name(), "echo(some/model)");
    }
}
