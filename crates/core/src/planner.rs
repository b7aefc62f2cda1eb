//! Token budget planning.
//!
//! Packs the system prompt, the injected context and as many trailing
//! conversation turns as fit the model's context window, leaving
//! `reserved_tokens` free for the completion. Pure and synchronous.

use serde::Serialize;
use tracing::debug;

use crate::context::ContextFact;
use crate::error::{Error, Result};
use crate::message::{Message, ModelSpec, Role};
use crate::tokenizer::Tokenizer;

/// Default headroom reserved for the model's own completion.
pub const DEFAULT_RESERVED_TOKENS: usize = 768;

/// The prompt sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Plan {
    pub system_prompt: String,

    /// A contiguous suffix of the conversation, oldest first.
    pub included_messages: Vec<Message>,

    /// System prompt tokens plus included message tokens.
    pub prompt_tokens: usize,
}

/// Fits conversations into a model's token budget.
pub struct BudgetPlanner<'a> {
    tokenizer: &'a dyn Tokenizer,
    reserved_tokens: usize,
}

impl<'a> BudgetPlanner<'a> {
    pub fn new(tokenizer: &'a dyn Tokenizer) -> Self {
        Self {
            tokenizer,
            reserved_tokens: DEFAULT_RESERVED_TOKENS,
        }
    }

    pub fn with_reserved_tokens(mut self, reserved_tokens: usize) -> Self {
        self.reserved_tokens = reserved_tokens;
        self
    }

    /// Build the plan for one request.
    ///
    /// Fails with `Internal` only when the system prompt plus the reserved
    /// headroom already exceed the model's limit. A newest message that does
    /// not fit on its own yields an empty plan, not an error.
    pub fn plan(
        &self,
        model: &ModelSpec,
        system_prompt: &str,
        context: &ContextFact,
        conversation: &[Message],
    ) -> Result<Plan> {
        let prompt_tokens = self.tokenizer.count(system_prompt);
        if prompt_tokens + self.reserved_tokens > model.token_limit {
            return Err(Error::Internal(format!(
                "system prompt ({prompt_tokens} tokens) plus {} reserved exceeds the {} token limit of {}",
                self.reserved_tokens, model.token_limit, model.id
            )));
        }

        let rendered = render_context(context, conversation);

        let mut running = prompt_tokens;
        let mut included = Vec::new();
        for message in rendered.into_iter().rev() {
            let tokens = self.tokenizer.count(&message.content);
            if running + tokens + self.reserved_tokens > model.token_limit {
                break;
            }
            running += tokens;
            included.push(message);
        }
        included.reverse();

        debug!(
            model = %model.id,
            included = included.len(),
            dropped = conversation.len() - included.len(),
            prompt_tokens = running,
            "Planned prompt"
        );

        Ok(Plan {
            system_prompt: system_prompt.to_string(),
            included_messages: included,
            prompt_tokens: running,
        })
    }
}

/// Copy the conversation with the context appended to the final user turn.
fn render_context(context: &ContextFact, conversation: &[Message]) -> Vec<Message> {
    let mut rendered = conversation.to_vec();
    if let Some(last) = rendered.last_mut().filter(|m| m.role == Role::User) {
        last.content = context.render_onto(&last.content);
    }
    rendered
}
