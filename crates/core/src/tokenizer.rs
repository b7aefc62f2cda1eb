//! Tokenizer adapter.
//!
//! Counts tokens with the BPE encoding that belongs to the target model
//! (cl100k for gpt-4 / gpt-3.5, o200k for gpt-4o, ...). Encoders are costly to
//! build, so each one is built on first use and shared afterwards.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use tiktoken_rs::CoreBPE;

use crate::error::{Error, Result};

/// Anything that can turn text into a token count.
pub trait Tokenizer: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

static ENCODERS: OnceLock<Mutex<HashMap<String, Arc<CoreBPE>>>> = OnceLock::new();

fn encoder_for(model_id: &str) -> Result<Arc<CoreBPE>> {
    let cache = ENCODERS.get_or_init(|| Mutex::new(HashMap::new()));

    if let Some(bpe) = cache.lock().unwrap_or_else(|e| e.into_inner()).get(model_id) {
        return Ok(bpe.clone());
    }

    // Built unlocked; a racing build for the same id loses to the first insert.
    let bpe = tiktoken_rs::get_bpe_from_model(model_id)
        .map_err(|e| Error::Internal(format!("no tokenizer for model '{model_id}': {e}")))?;

    let mut encoders = cache.lock().unwrap_or_else(|e| e.into_inner());
    Ok(encoders
        .entry(model_id.to_string())
        .or_insert_with(|| Arc::new(bpe))
        .clone())
}

/// Tiktoken-backed tokenizer bound to one model id.
#[derive(Clone)]
pub struct BpeTokenizer {
    model_id: String,
    bpe: Arc<CoreBPE>,
}

impl std::fmt::Debug for BpeTokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenizer")
            .field("model_id", &self.model_id)
            .field("bpe", &"<CoreBPE>")
            .finish()
    }
}

impl BpeTokenizer {
    /// Look up the encoding for `model_id`. Unknown ids fail with `Internal`.
    pub fn for_model(model_id: &str) -> Result<Self> {
        Ok(Self {
            model_id: model_id.to_string(),
            bpe: encoder_for(model_id)?,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

impl Tokenizer for BpeTokenizer {
    fn count(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_ordinary(text).len()
    }
}

/// Count the tokens of `text` as seen by `model_id`.
pub fn count(text: &str, model_id: &str) -> Result<usize> {
    Ok(BpeTokenizer::for_model(model_id)?.count(text))
}
