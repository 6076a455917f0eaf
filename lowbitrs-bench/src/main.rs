use std::fmt::Display;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use cli_table::{format::Justify, print_stdout, Cell, CellStruct, Style, Table};
use lowbitrs_core::{
    initialize_logging, load_auto, ByteTokenizer, GenerationHarness, GenerationRecord,
    HarnessOptions, HuggingFaceTokenizer, LoadOptions, LoaderBuilder, ModelSource, Tokenizer,
};
use tracing::info;

#[derive(Parser)]
#[command(version, about = "Timed generation passes against a low-bit pipeline")]
struct Args {
    /// Hugging Face model id, or the path to a local checkpoint folder.
    #[arg(long, default_value = "meta-llama/Meta-Llama-3-8B-Instruct")]
    repo_id_or_model_path: String,

    /// Low-bit checkpoint directory: loaded if it exists, otherwise the
    /// freshly loaded model is saved there for the next run.
    #[arg(long)]
    lowbit_path: Option<PathBuf>,

    /// Prompt to infer.
    #[arg(long, default_value = "What is AI?")]
    prompt: String,

    /// System prompt prepended to the chat template; empty emits no system block.
    #[arg(long, default_value = "")]
    system_prompt: String,

    /// Max tokens to predict.
    #[arg(long, default_value_t = 32)]
    n_predict: usize,

    #[arg(long, default_value_t = 1024)]
    max_context_len: usize,

    #[arg(long, default_value_t = 512)]
    max_prompt_len: usize,

    #[arg(long, default_value_t = 0)]
    quantization_group_size: usize,

    /// Keep the value cache in its untransposed layout.
    #[arg(long)]
    disable_transpose_value_cache: bool,

    /// Print the full decoded output after each pass instead of streaming it.
    #[arg(long)]
    disable_streaming: bool,

    /// Number of timed generation passes.
    #[arg(long, default_value_t = 3)]
    repetitions: usize,

    /// Path to a tokenizer.json, or a hub model id to fetch one from.
    /// Defaults to the bundled byte-level tokenizer.
    #[arg(long)]
    tokenizer: Option<String>,

    /// Append a JSON line per pass to this file.
    #[arg(long)]
    log: Option<PathBuf>,
}

struct UncertainTokSec {
    mean: f32,
    std_dev: f32,
}

impl Display for UncertainTokSec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:.3}±{:.3}", self.mean, self.std_dev)
    }
}

fn uncertain(measurements: &[f32]) -> UncertainTokSec {
    let mean = measurements.iter().sum::<f32>() / measurements.len() as f32;
    let variance = measurements
        .iter()
        .map(|e| (mean - e).powf(2.))
        .sum::<f32>()
        / measurements.len() as f32;
    UncertainTokSec {
        mean,
        std_dev: variance.sqrt(),
    }
}

fn get_tok_s(records: &[GenerationRecord]) -> UncertainTokSec {
    let measurements = records
        .iter()
        .map(|r| r.generated_tokens() as f32 / r.elapsed_secs() as f32)
        .collect::<Vec<_>>();
    uncertain(&measurements)
}

fn get_ms_tok(records: &[GenerationRecord]) -> UncertainTokSec {
    let measurements = records
        .iter()
        .map(|r| 1000. * r.elapsed_secs() as f32 / r.generated_tokens() as f32)
        .collect::<Vec<_>>();
    uncertain(&measurements)
}

fn print_timings(model: &str, test_name: &str, records: &[GenerationRecord]) {
    let rows: Vec<Vec<CellStruct>> = vec![vec![
        model.cell(),
        test_name.cell(),
        get_tok_s(records).cell().justify(Justify::Right),
        get_ms_tok(records).cell().justify(Justify::Right),
        records.len().cell().justify(Justify::Right),
    ]];

    let table = rows
        .table()
        .title(vec![
            "model".cell().bold(true),
            "test".cell().bold(true),
            "t/s".cell().bold(true),
            "ms/t".cell().bold(true),
            "runs".cell().bold(true),
        ])
        .bold(true);
    print_stdout(table).expect("print table");
}

fn resolve_tokenizer(spec: Option<&str>) -> anyhow::Result<Box<dyn Tokenizer>> {
    match spec {
        Some(t) if Path::new(t).exists() => Ok(Box::new(
            HuggingFaceTokenizer::from_file(t)
                .with_context(|| format!("failed to load tokenizer from `{t}`"))?,
        )),
        Some(t) => Ok(Box::new(
            HuggingFaceTokenizer::from_pretrained(t)
                .with_context(|| format!("failed to fetch tokenizer for `{t}`"))?,
        )),
        None => Ok(Box::new(ByteTokenizer)),
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    initialize_logging();

    let opts = LoadOptions {
        max_context_len: args.max_context_len,
        max_prompt_len: args.max_prompt_len,
        quantization_group_size: args.quantization_group_size,
        transpose_value_cache: !args.disable_transpose_value_cache,
    };
    let source = ModelSource::parse(&args.repo_id_or_model_path);
    let loader = LoaderBuilder::new(source.clone()).build()?;
    let pipeline = load_auto(loader.as_ref(), &source, args.lowbit_path.as_deref(), &opts)
        .context("failed to load model")?;
    let model_name = pipeline.name();
    info!("Model loaded: {model_name}");

    let tokenizer = resolve_tokenizer(args.tokenizer.as_deref())?;

    let mut harness = GenerationHarness::new(pipeline, tokenizer);
    if let Some(log) = args.log {
        harness = harness.with_log(log);
    }

    let harness_opts = HarnessOptions {
        prompt: args.prompt,
        system_prompt: args.system_prompt,
        history: Vec::new(),
        max_new_tokens: args.n_predict,
        repetitions: args.repetitions,
        streaming: !args.disable_streaming,
    };
    let records = harness.run(&harness_opts)?;

    print_timings(&model_name, &format!("tg {}", args.n_predict), &records);
    println!("{}", "-".repeat(80));
    println!("done");
    println!("success shut down");
    Ok(())
}
