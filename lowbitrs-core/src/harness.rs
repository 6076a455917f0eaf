use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use tracing::info;

use crate::chat_template::{build_prompt, ChatTurn};
use crate::pipeline::Pipeline;
use crate::streamer::TextStreamer;
use crate::tokenizer::Tokenizer;

/// What to generate and how often.
#[derive(Clone, Debug)]
pub struct HarnessOptions {
    pub prompt: String,
    pub system_prompt: String,
    pub history: Vec<ChatTurn>,
    pub max_new_tokens: usize,
    pub repetitions: usize,
    pub streaming: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            prompt: "What is AI?".to_string(),
            system_prompt: String::new(),
            history: Vec::new(),
            max_new_tokens: 32,
            repetitions: 3,
            streaming: true,
        }
    }
}

/// One timed generation pass.
#[derive(Clone, Debug, Serialize)]
pub struct GenerationRecord {
    pub output_ids: Vec<u32>,
    pub prompt_tokens: usize,
    pub elapsed: Duration,
}

impl GenerationRecord {
    pub fn generated_tokens(&self) -> usize {
        self.output_ids.len().saturating_sub(self.prompt_tokens)
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.elapsed.as_secs_f64()
    }
}

/// Drives repeated, timed generation passes over a pipeline.
///
/// All human-facing output goes to the harness-owned sink (stdout unless
/// overridden); diagnostics go through `tracing`. Each pass is independent:
/// the rendered prompt is identical every iteration and no state is carried
/// between passes.
pub struct GenerationHarness {
    pipeline: Box<dyn Pipeline>,
    tokenizer: Box<dyn Tokenizer>,
    output: Box<dyn Write + Send>,
    log: Option<PathBuf>,
}

impl GenerationHarness {
    pub fn new(pipeline: Box<dyn Pipeline>, tokenizer: Box<dyn Tokenizer>) -> Self {
        Self {
            pipeline,
            tokenizer,
            output: Box::new(io::stdout()),
            log: None,
        }
    }

    pub fn with_output(mut self, output: Box<dyn Write + Send>) -> Self {
        self.output = output;
        self
    }

    /// Append one JSON line per pass to this file.
    pub fn with_log(mut self, log: PathBuf) -> Self {
        self.log = Some(log);
        self
    }

    pub fn pipeline_name(&self) -> String {
        self.pipeline.name()
    }

    /// Run `opts.repetitions` generation passes and return one record each.
    ///
    /// Any failure in encode, generate, or decode propagates immediately and
    /// aborts the remaining passes; there are no retries and no partial
    /// results.
    pub fn run(&mut self, opts: &HarnessOptions) -> Result<Vec<GenerationRecord>> {
        let mut records = Vec::with_capacity(opts.repetitions);
        for pass in 0..opts.repetitions {
            let prompt = build_prompt(&opts.prompt, &opts.history, &opts.system_prompt);
            // The template embeds its own markers, so no specials are added.
            let input_ids = self.tokenizer.encode(&prompt, false)?;

            writeln!(self.output, "{} Input {}", "-".repeat(20), "-".repeat(20))?;
            writeln!(self.output, "input length: {}", input_ids.len())?;
            writeln!(self.output, "{prompt}")?;
            writeln!(self.output, "{} Output {}", "-".repeat(20), "-".repeat(20))?;

            let start = Instant::now();
            let output_ids = if opts.streaming {
                let mut streamer =
                    TextStreamer::new(self.tokenizer.as_ref(), &mut *self.output, true);
                self.pipeline
                    .generate(&input_ids, opts.max_new_tokens, Some(&mut streamer))?
            } else {
                self.pipeline.generate(&input_ids, opts.max_new_tokens, None)?
            };
            let elapsed = start.elapsed();

            if !opts.streaming {
                let text = self.tokenizer.decode(&output_ids, false)?;
                writeln!(self.output, "{text}")?;
            }
            writeln!(self.output, "Inference time: {} s", elapsed.as_secs_f64())?;
            self.output.flush()?;

            let record = GenerationRecord {
                output_ids,
                prompt_tokens: input_ids.len(),
                elapsed,
            };
            self.maybe_log_record(pass, &record)?;
            info!(
                "pass {}/{}: {} new tokens in {:.3}s",
                pass + 1,
                opts.repetitions,
                record.generated_tokens(),
                record.elapsed_secs()
            );
            records.push(record);
        }
        Ok(records)
    }

    fn maybe_log_record(&self, pass: usize, record: &GenerationRecord) -> Result<()> {
        let Some(file) = &self.log else {
            return Ok(());
        };
        let mut f = OpenOptions::new().append(true).create(true).open(file)?;
        let line = serde_json::json!({
            "time": chrono::offset::Local::now().to_rfc3339(),
            "pass": pass,
            "prompt_tokens": record.prompt_tokens,
            "generated_tokens": record.generated_tokens(),
            "elapsed_s": record.elapsed_secs(),
        });
        writeln!(f, "{line}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::pipeline::{EchoLoader, LoadOptions, ModelSource, PipelineLoader};
    use crate::tokenizer::ByteTokenizer;

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn echo_harness(sink: SharedBuf) -> GenerationHarness {
        let pipeline = EchoLoader
            .load(
                &ModelSource::HubRepo("test/echo".to_string()),
                &LoadOptions::default(),
            )
            .unwrap();
        GenerationHarness::new(pipeline, Box::new(ByteTokenizer)).with_output(Box::new(sink))
    }

    #[test]
    fn three_passes_without_streaming() {
        let sink = SharedBuf::default();
        let mut harness = echo_harness(sink.clone());
        let opts = HarnessOptions {
            streaming: false,
            max_new_tokens: 8,
            ..Default::default()
        };

        let records = harness.run(&opts).unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            assert!(record.elapsed_secs() >= 0.0);
            assert_eq!(record.generated_tokens(), 8);
        }

        let out = sink.contents();
        assert_eq!(out.matches("Inference time:").count(), 3);
        assert_eq!(out.matches("-------------------- Input --------------------").count(), 3);
    }

    #[test]
    fn passes_are_independent() {
        let sink = SharedBuf::default();
        let mut harness = echo_harness(sink.clone());
        let opts = HarnessOptions {
            streaming: false,
            ..Default::default()
        };

        let records = harness.run(&opts).unwrap();
        assert_eq!(records[0].output_ids, records[1].output_ids);
        assert_eq!(records[1].output_ids, records[2].output_ids);
        assert_eq!(records[0].prompt_tokens, records[2].prompt_tokens);
    }

    #[test]
    fn streaming_writes_generated_text_to_sink() {
        let sink = SharedBuf::default();
        let mut harness = echo_harness(sink.clone());
        let opts = HarnessOptions {
            prompt: "abc".to_string(),
            max_new_tokens: 4,
            repetitions: 1,
            ..Default::default()
        };

        let records = harness.run(&opts).unwrap();
        assert_eq!(records.len(), 1);
        // The echo pipeline restarts from the beginning of the prompt, so the
        // streamed text opens with the start of the begin-of-text marker.
        let out = sink.contents();
        assert!(out.contains(" Output --------------------\n<|be\n"));
    }

    #[test]
    fn repetitions_are_configurable() {
        let sink = SharedBuf::default();
        let mut harness = echo_harness(sink.clone());
        let opts = HarnessOptions {
            repetitions: 5,
            streaming: false,
            ..Default::default()
        };
        assert_eq!(harness.run(&opts).unwrap().len(), 5);
    }

    #[test]
    fn log_file_gets_one_line_per_pass() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.jsonl");
        let sink = SharedBuf::default();
        let mut harness = echo_harness(sink).with_log(log.clone());

        harness
            .run(&HarnessOptions {
                streaming: false,
                ..Default::default()
            })
            .unwrap();

        let lines: Vec<String> = std::fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let v: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert!(v["elapsed_s"].as_f64().unwrap() >= 0.0);
            assert!(v["prompt_tokens"].as_u64().unwrap() > 0);
        }
    }

    #[test]
    fn history_renders_into_every_pass() {
        let sink = SharedBuf::default();
        let mut harness = echo_harness(sink.clone());
        let opts = HarnessOptions {
            history: vec![ChatTurn::new("Hello", "Hi there")],
            system_prompt: "Be nice".to_string(),
            repetitions: 2,
            streaming: false,
            ..Default::default()
        };

        harness.run(&opts).unwrap();
        // Each pass prints the system and history text twice: once in the
        // prompt banner echo, once in the full-sequence decode.
        let out = sink.contents();
        assert_eq!(out.matches("Be nice").count(), 4);
        assert_eq!(out.matches("Hi there").count(), 4);
    }
}
