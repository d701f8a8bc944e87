//! # skiff-condenser: history summarization
//!
//! Folds the oldest condensable part of an agent's history into one
//! [`AgentSummarizeAction`] so the controller can drop those events from its
//! working window and keep the summary instead.

mod prompts;

use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use skiff_protocol::{AgentSummarizeAction, ChatMessage, CompletionOptions, LlmPort};
use thiserror::Error;
use tracing::{debug, info, instrument};

pub use prompts::{
    SUMMARY_PROMPT_SYSTEM, WORD_LIMIT, format_history, parse_summary_response, summary_message,
};

#[derive(Debug, Error)]
pub enum CondenseError {
    #[error("not enough condensable messages to summarize ({available} available, need 2)")]
    NotEnoughMessages { available: usize },
    #[error("invalid summary response: {0}")]
    InvalidSummaryResponse(String),
    #[error("summarization model call failed: {0}")]
    Llm(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CondenserConfig {
    /// Share of condensable tokens folded into the summary.
    pub trunc_frac: f64,
    /// Share of the context window the summarization prompt may use before
    /// it is split.
    pub warning_frac: f64,
}

impl Default for CondenserConfig {
    fn default() -> Self {
        Self {
            trunc_frac: 0.75,
            warning_frac: 0.75,
        }
    }
}

/// Summary plus what producing it cost.
#[derive(Debug, Clone, PartialEq)]
pub struct Condensation {
    pub summary: AgentSummarizeAction,
    pub cost_usd: f64,
}

pub struct Condenser {
    llm: Arc<dyn LlmPort>,
    config: CondenserConfig,
}

impl Condenser {
    pub fn new(llm: Arc<dyn LlmPort>, config: CondenserConfig) -> Self {
        Self { llm, config }
    }

    pub fn config(&self) -> &CondenserConfig {
        &self.config
    }

    pub fn count_tokens(&self, messages: &[ChatMessage]) -> usize {
        self.llm.count_tokens(messages)
    }

    fn tokens(&self, message: &ChatMessage) -> usize {
        self.llm.count_tokens(std::slice::from_ref(message))
    }

    /// Summarizes the oldest condensable messages until their tokens exceed
    /// `trunc_frac` of all condensable tokens. The summary's
    /// `last_summarized_event_id` is the event of the last message folded in.
    #[instrument(skip_all, fields(messages = messages.len()))]
    pub async fn condense(&self, messages: &[ChatMessage]) -> Result<Condensation, CondenseError> {
        let condensable: Vec<&ChatMessage> =
            messages.iter().filter(|message| message.condensable).collect();
        let total: usize = condensable.iter().map(|message| self.tokens(message)).sum();
        let desired = (total as f64 * self.config.trunc_frac) as usize;

        let mut candidates = Vec::new();
        let mut so_far = 0;
        let mut cutoff = None;
        for message in condensable {
            candidates.push(message.clone());
            so_far += self.tokens(message);
            cutoff = message.event_id;
            if so_far > desired {
                break;
            }
        }
        debug!(
            total_tokens = total,
            desired_tokens = desired,
            candidates = candidates.len(),
            ?cutoff,
            "condensation candidates selected"
        );
        if candidates.len() < 2 {
            return Err(CondenseError::NotEnoughMessages {
                available: candidates.len(),
            });
        }

        let depth = max_depth(candidates.len());
        let (mut summary, cost_usd) = self.summarize(candidates, depth).await?;
        summary.last_summarized_event_id = cutoff;
        info!(?cutoff, cost_usd, "history condensed");
        Ok(Condensation { summary, cost_usd })
    }

    fn summarize(
        &self,
        messages: Vec<ChatMessage>,
        depth: usize,
    ) -> BoxFuture<'_, Result<(AgentSummarizeAction, f64), CondenseError>> {
        async move {
            let mut input = format_history(&messages);
            let mut cost = 0.0;
            let limit = self.config.warning_frac * self.llm.context_window() as f64;
            let input_tokens = self.llm.count_tokens(&[ChatMessage::user(input.as_str())]);

            if input_tokens as f64 > limit && messages.len() > 1 && depth > 1 {
                let cutoff = (messages.len() / 2).max(1);
                debug!(input_tokens, limit, cutoff, depth, "summary prompt too large, splitting");
                let (partial, partial_cost) =
                    self.summarize(messages[..cutoff].to_vec(), depth - 1).await?;
                cost += partial_cost;
                let mut reduced = vec![summary_message(&partial)];
                reduced.extend_from_slice(&messages[cutoff..]);
                input = format_history(&reduced);
            }

            let request = [
                ChatMessage::system(SUMMARY_PROMPT_SYSTEM),
                ChatMessage::user(input),
            ];
            let response = self
                .llm
                .complete(&request, &CompletionOptions::default())
                .await
                .map_err(|err| CondenseError::Llm(err.to_string()))?;
            cost += response.cost_usd;
            let summary = parse_summary_response(&response.content)?;
            Ok((summary, cost))
        }
        .boxed()
    }
}

/// `ceil(log2(n)) + 1`: enough levels to halve `n` messages down to one.
fn max_depth(n: usize) -> usize {
    let ceil_log2 = if n <= 1 {
        0
    } else {
        (usize::BITS - (n - 1).leading_zeros()) as usize
    };
    ceil_log2 + 1
}
