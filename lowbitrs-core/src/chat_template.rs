//! Llama 3 style chat template rendering.
//!
//! The template is fixed: role blocks are delimited by the Llama 3 special
//! tokens, and the rendered prompt ends with an empty assistant header so the
//! model continues from there. Marker strings occurring inside user-supplied
//! text pass through verbatim.

use serde::{Deserialize, Serialize};

pub const BEGIN_OF_TEXT: &str = "<|begin_of_text|>";
pub const START_HEADER_ID: &str = "<|start_header_id|>";
pub const END_HEADER_ID: &str = "<|end_header_id|>";
pub const EOT_ID: &str = "<|eot_id|>";

/// One completed exchange: what the user said and what the assistant replied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user: String,
    pub assistant: String,
}

impl ChatTurn {
    pub fn new(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            assistant: assistant.into(),
        }
    }
}

/// Render a conversation into a single prompt string.
///
/// Pure function of its arguments: identical inputs always produce identical
/// output. History and user texts are inserted with leading/trailing
/// whitespace stripped; the system prompt is inserted as-is. An empty system
/// prompt emits no system block at all.
pub fn build_prompt(user_input: &str, history: &[ChatTurn], system_prompt: &str) -> String {
    let mut pieces = vec![BEGIN_OF_TEXT.to_string()];

    if !system_prompt.is_empty() {
        pieces.push(format!(
            "{START_HEADER_ID}system{END_HEADER_ID}\n\n{system_prompt}{EOT_ID}"
        ));
    }

    for turn in history {
        pieces.push(format!(
            "{START_HEADER_ID}user{END_HEADER_ID}\n\n{}{EOT_ID}",
            turn.user.trim()
        ));
        pieces.push(format!(
            "{START_HEADER_ID}assistant{END_HEADER_ID}\n\n{}{EOT_ID}",
            turn.assistant.trim()
        ));
    }

    pieces.push(format!(
        "{START_HEADER_ID}user{END_HEADER_ID}\n\n{}{EOT_ID}{START_HEADER_ID}assistant{END_HEADER_ID}\n\n",
        user_input.trim()
    ));

    pieces.concat()
}
