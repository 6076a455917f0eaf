use std::io::Write;

use anyhow::Result;

use crate::tokenizer::Tokenizer;

/// Streaming hook a pipeline pushes newly produced token ids into.
pub trait TokenStreamer {
    fn put(&mut self, ids: &[u32]) -> Result<()>;
    fn end(&mut self) -> Result<()>;
}

/// Decodes accumulated ids and writes the newly stable text to a sink as
/// generation proceeds.
///
/// Text ending in U+FFFD is held back until more ids arrive, so a multi-byte
/// character split across tokens is never emitted torn. Each emitted piece is
/// flushed immediately.
pub struct TextStreamer<'a> {
    tokenizer: &'a dyn Tokenizer,
    sink: &'a mut dyn Write,
    skip_special_tokens: bool,
    ids: Vec<u32>,
    printed_len: usize,
}

impl<'a> TextStreamer<'a> {
    pub fn new(
        tokenizer: &'a dyn Tokenizer,
        sink: &'a mut dyn Write,
        skip_special_tokens: bool,
    ) -> Self {
        Self {
            tokenizer,
            sink,
            skip_special_tokens,
            ids: Vec::new(),
            printed_len: 0,
        }
    }
}

impl TokenStreamer for TextStreamer<'_> {
    fn put(&mut self, ids: &[u32]) -> Result<()> {
        self.ids.extend_from_slice(ids);
        let text = self.tokenizer.decode(&self.ids, self.skip_special_tokens)?;
        let mut stable = text.len();
        if text.ends_with('\u{FFFD}') {
            stable -= '\u{FFFD}'.len_utf8();
        }
        if stable > self.printed_len {
            self.sink
                .write_all(text[self.printed_len..stable].as_bytes())?;
            self.sink.flush()?;
            self.printed_len = stable;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        let text = self.tokenizer.decode(&self.ids, self.skip_special_tokens)?;
        if text.len() > self.printed_len {
            self.sink.write_all(text[self.printed_len..].as_bytes())?;
        }
        self.sink.write_all(b"\n")?;
        self.sink.flush()?;
        Ok(())
    }
}
