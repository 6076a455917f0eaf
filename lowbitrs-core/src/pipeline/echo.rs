//! Deterministic loopback pipeline for exercising the harness without a
//! real engine behind it.

use std::fs;
use std::path::Path;
use std::sync::atomic::Ordering;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{LoadOptions, LowBitError, ModelSource, Pipeline, PipelineLoader};
use crate::streamer::TokenStreamer;
use crate::DEBUG;

const LOWBIT_CONFIG: &str = "lowbit_config.json";
const LOWBIT_FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct LowBitConfig {
    format_version: u32,
    source: String,
    options: LoadOptions,
}

pub struct EchoPipeline {
    source: String,
    opts: LoadOptions,
}

impl Pipeline for EchoPipeline {
    fn name(&self) -> String {
        format!("echo({})", self.source)
    }

    /// Echoes the prompt: the output is the input ids followed by the input
    /// ids repeated cyclically until `max_new_tokens` have been appended.
    /// An empty input produces no new ids.
    fn generate(
        &mut self,
        input_ids: &[u32],
        max_new_tokens: usize,
        mut streamer: Option<&mut dyn TokenStreamer>,
    ) -> Result<Vec<u32>> {
        let mut output = input_ids.to_vec();
        if !input_ids.is_empty() {
            for i in 0..max_new_tokens {
                let id = input_ids[i % input_ids.len()];
                output.push(id);
                if let Some(s) = streamer.as_deref_mut() {
                    s.put(&[id])?;
                }
            }
        }
        if let Some(s) = streamer {
            s.end()?;
        }
        Ok(output)
    }

    fn save_low_bit(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let config = LowBitConfig {
            format_version: LOWBIT_FORMAT_VERSION,
            source: self.source.clone(),
            options: self.opts.clone(),
        };
        fs::write(dir.join(LOWBIT_CONFIG), serde_json::to_vec_pretty(&config)?)?;
        Ok(())
    }
}

pub struct EchoLoader;

impl PipelineLoader for EchoLoader {
    fn load(&self, source: &ModelSource, opts: &LoadOptions) -> Result<Box<dyn Pipeline>> {
        Ok(Box::new(EchoPipeline {
            source: source.to_string(),
            opts: opts.clone(),
        }))
    }

    fn load_low_bit(&self, dir: &Path, opts: &LoadOptions) -> Result<Box<dyn Pipeline>> {
        let config_path = dir.join(LOWBIT_CONFIG);
        if !config_path.exists() {
            return Err(LowBitError::NotFound(dir.to_path_buf()).into());
        }
        let raw = fs::read(&config_path)?;
        let config: LowBitConfig =
            serde_json::from_slice(&raw).map_err(|e| LowBitError::Malformed(e.to_string()))?;
        if config.format_version != LOWBIT_FORMAT_VERSION {
            return Err(LowBitError::Malformed(format!(
                "unsupported format version {}",
                config.format_version
            ))
            .into());
        }
        if DEBUG.load(Ordering::Relaxed) && config.options != *opts {
            debug!(
                "Checkpoint options {:?} differ from requested {:?}; checkpoint wins.",
                config.options, opts
            );
        }
        Ok(Box::new(EchoPipeline {
            source: config.source,
            opts: config.options,
        }))
    }
}
