use std::path::Path;

use anyhow::Result;
use hf_hub::{api::sync::ApiBuilder, Repo, RepoType};

/// The encode/decode capability the harness needs from a tokenizer.
pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>>;
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;
}

/// Wraps a `tokenizers::Tokenizer` loaded from a `tokenizer.json`, either a
/// local file or fetched from the Hugging Face hub.
pub struct HuggingFaceTokenizer {
    tokenizer: tokenizers::Tokenizer,
}

impl HuggingFaceTokenizer {
    pub fn from_file<P: AsRef<Path>>(p: P) -> Result<Self> {
        let tokenizer = tokenizers::Tokenizer::from_file(p).map_err(anyhow::Error::msg)?;
        Ok(Self { tokenizer })
    }

    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let token = std::env::var("HF_TOKEN").ok();
        let api = ApiBuilder::new()
            .with_progress(true)
            .with_token(token)
            .build()?;
        let api = api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            "main".to_string(),
        ));
        let tokenizer_filename = api.get("tokenizer.json")?;
        Self::from_file(tokenizer_filename)
    }
}

impl Tokenizer for HuggingFaceTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, add_special_tokens)
            .map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.tokenizer
            .decode(ids, skip_special_tokens)
            .map_err(anyhow::Error::msg)
    }
}

/// Byte-level fallback tokenizer: ids are the UTF-8 bytes of the text.
///
/// It defines no special tokens, so both flags are inert. Keeps the harness
/// runnable with no model assets on disk.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, _add_special_tokens: bool) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn decode(&self, ids: &[u32], _skip_special_tokens: bool) -> Result<String> {
        let bytes = ids
            .iter()
            .map(|&id| {
                u8::try_from(id).map_err(|_| anyhow::anyhow!("id {id} out of byte range"))
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
