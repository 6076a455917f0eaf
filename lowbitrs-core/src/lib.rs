#![deny(clippy::cast_possible_truncation, clippy::cast_precision_loss)]

use std::sync::atomic::AtomicBool;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

pub mod chat_template;
mod harness;
pub mod pipeline;
mod streamer;
mod tokenizer;

pub use chat_template::{build_prompt, ChatTurn};
pub use harness::{GenerationHarness, GenerationRecord, HarnessOptions};
pub use pipeline::{
    load_auto, EchoLoader, EchoPipeline, LoadOptions, LoaderBuilder, LowBitError, ModelSource,
    Pipeline, PipelineLoader,
};
pub use streamer::{TextStreamer, TokenStreamer};
pub use tokenizer::{ByteTokenizer, HuggingFaceTokenizer, Tokenizer};

/// `true` if `LOWBIT_DEBUG=1`
pub(crate) static DEBUG: AtomicBool = AtomicBool::new(false);

/// This should be called at the start of any binary using this crate.
pub fn initialize_logging() {
    let is_debug = std::env::var("LOWBIT_DEBUG")
        .unwrap_or_default()
        .contains('1');
    DEBUG.store(is_debug, std::sync::atomic::Ordering::Relaxed);

    let filter = EnvFilter::builder()
        .with_default_directive(if is_debug {
            LevelFilter::DEBUG.into()
        } else {
            LevelFilter::INFO.into()
        })
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
