//! Stream normalizer.
//!
//! Folds the canonical event stream from a provider adapter into
//! OpenAI-shape chunks for the client, in arrival order, with no
//! coalescing. Along the way it accumulates per-choice content and
//! reasoning and captures the usage block when the provider sends one;
//! when it does not, tokens are estimated from character counts at
//! end-of-stream.

use std::collections::BTreeMap;
use tracing::{debug, warn};

use relay_core::{ChatChunk, ChunkChoice, ChunkDelta, ChunkEvent, FinishReason, Usage};

/// Chars-per-token heuristic used when the provider reports no usage
const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Default)]
struct ChoiceAccumulator {
    content: String,
    reasoning: String,
    finish_reason: Option<FinishReason>,
}

/// End-of-stream summary handed to post-flight accounting
#[derive(Debug, Clone)]
pub struct StreamSummary {
    /// Accumulated content of choice 0
    pub content: String,
    /// Accumulated reasoning of choice 0
    pub reasoning: String,
    /// Reported or estimated usage
    pub usage: Usage,
    /// Whether usage was reported by the provider (vs estimated)
    pub usage_reported: bool,
    /// Finish reason of choice 0
    pub finish_reason: Option<FinishReason>,
    /// Number of provider chunks observed
    pub chunk_count: u64,
}

impl StreamSummary {
    /// An upstream that opened a stream and sent nothing
    #[must_use]
    pub fn is_empty_stream(&self) -> bool {
        self.chunk_count == 0
    }
}

/// Normalizer for one stream
pub struct StreamNormalizer {
    provider: String,
    model: String,
    id: String,
    created: i64,
    choices: BTreeMap<u32, ChoiceAccumulator>,
    usage: Option<Usage>,
    chunk_count: u64,
}

impl StreamNormalizer {
    /// Create a normalizer for one upstream stream
    #[must_use]
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            choices: BTreeMap::new(),
            usage: None,
            chunk_count: 0,
        }
    }

    /// Stream id shared by all emitted chunks
    #[must_use]
    pub fn stream_id(&self) -> &str {
        &self.id
    }

    /// Fold one event. Returns the chunk to emit to the client, when the
    /// event produces one. Events are emitted in the order received.
    pub fn on_event(&mut self, event: ChunkEvent) -> Option<ChatChunk> {
        self.chunk_count += 1;
        match event {
            ChunkEvent::Role { index, role } => Some(self.chunk(
                index,
                ChunkDelta {
                    role: Some(role),
                    ..ChunkDelta::default()
                },
                None,
            )),
            ChunkEvent::Content { index, text } => {
                if text.is_empty() {
                    return None;
                }
                self.choices.entry(index).or_default().content.push_str(&text);
                Some(self.chunk(
                    index,
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                ))
            }
            ChunkEvent::Reasoning { index, text } => {
                if text.is_empty() {
                    return None;
                }
                self.choices
                    .entry(index)
                    .or_default()
                    .reasoning
                    .push_str(&text);
                Some(self.chunk(
                    index,
                    ChunkDelta {
                        reasoning_content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                ))
            }
            ChunkEvent::Finish { index, reason } => {
                self.choices.entry(index).or_default().finish_reason = Some(reason);
                Some(self.chunk(index, ChunkDelta::default(), Some(reason)))
            }
            ChunkEvent::Usage(usage) => {
                self.usage = Some(usage);
                let mut chunk = ChatChunk::shell(self.id.clone(), self.created, self.model.clone());
                chunk.usage = Some(usage);
                Some(chunk)
            }
            ChunkEvent::Error { message } => {
                // The event itself was observed, but an error is not a
                // provider content chunk
                self.chunk_count -= 1;
                warn!(
                    provider = %self.provider,
                    model = %self.model,
                    error = %message,
                    "Upstream stream error"
                );
                None
            }
        }
    }

    fn chunk(&self, index: u32, delta: ChunkDelta, finish: Option<FinishReason>) -> ChatChunk {
        let mut chunk = ChatChunk::shell(self.id.clone(), self.created, self.model.clone());
        chunk.choices.push(ChunkChoice {
            index,
            delta,
            finish_reason: finish,
        });
        chunk
    }

    /// Accumulated content of choice 0 so far
    #[must_use]
    pub fn accumulated_content(&self) -> &str {
        self.choices
            .get(&0)
            .map_or("", |choice| choice.content.as_str())
    }

    /// Number of provider chunks observed so far
    #[must_use]
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Usage as known right now: the reported block when one has arrived,
    /// otherwise the character-count estimate. Non-consuming; used for the
    /// pre-`[DONE]` plan re-check.
    #[must_use]
    pub fn current_usage(&self, prompt_chars: usize) -> Usage {
        if let Some(usage) = self.usage.filter(|u| u.total_tokens > 0) {
            return usage;
        }
        let content_len = self.choices.get(&0).map_or(0, |c| c.content.len());
        Usage::new(
            prompt_chars.div_ceil(CHARS_PER_TOKEN).max(1) as u32,
            content_len.div_ceil(CHARS_PER_TOKEN).max(1) as u32,
        )
    }

    /// Finish the stream and produce the accounting summary.
    ///
    /// `prompt_chars` is the character count of the request messages, used
    /// for the prompt-token estimate when the provider reported no usage.
    /// Estimates floor at 1 token per axis.
    #[must_use]
    pub fn finalize(self, prompt_chars: usize) -> StreamSummary {
        let first = self.choices.get(&0);
        let content = first.map(|c| c.content.clone()).unwrap_or_default();
        let reasoning = first.map(|c| c.reasoning.clone()).unwrap_or_default();
        let finish_reason = first.and_then(|c| c.finish_reason);

        let (usage, usage_reported) = match self.usage.filter(|u| u.total_tokens > 0) {
            Some(usage) => (usage, true),
            None => {
                let completion = content.len().div_ceil(CHARS_PER_TOKEN).max(1) as u32;
                let prompt = prompt_chars.div_ceil(CHARS_PER_TOKEN).max(1) as u32;
                debug!(
                    provider = %self.provider,
                    model = %self.model,
                    prompt_tokens = prompt,
                    completion_tokens = completion,
                    "No usage reported, estimated from character counts"
                );
                (Usage::new(prompt, completion), false)
            }
        };

        if self.chunk_count == 0 {
            warn!(
                provider = %self.provider,
                model = %self.model,
                "Provider returned an empty stream"
            );
        }

        StreamSummary {
            content,
            reasoning,
            usage,
            usage_reported,
            finish_reason,
            chunk_count: self.chunk_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::MessageRole;

    #[test]
    fn content_events_become_delta_chunks_in_order() {
        let mut normalizer = StreamNormalizer::new("openrouter", "gpt-4");

        let first = normalizer
            .on_event(ChunkEvent::Content {
                index: 0,
                text: "Hello".to_string(),
            })
            .expect("chunk");
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hello"));

        let second = normalizer
            .on_event(ChunkEvent::Content {
                index: 0,
                text: ", world".to_string(),
            })
            .expect("chunk");
        assert_eq!(second.choices[0].delta.content.as_deref(), Some(", world"));

        // Same stream id on every chunk
        assert_eq!(first.id, second.id);
        assert_eq!(normalizer.accumulated_content(), "Hello, world");
    }

    #[test]
    fn reasoning_kept_separate_from_content() {
        let mut normalizer = StreamNormalizer::new("deepseek", "deepseek-r1");

        let chunk = normalizer
            .on_event(ChunkEvent::Reasoning {
                index: 0,
                text: "thinking...".to_string(),
            })
            .expect("chunk");
        assert_eq!(
            chunk.choices[0].delta.reasoning_content.as_deref(),
            Some("thinking...")
        );
        assert!(chunk.choices[0].delta.content.is_none());

        normalizer.on_event(ChunkEvent::Content {
            index: 0,
            text: "Answer".to_string(),
        });

        let summary = normalizer.finalize(0);
        assert_eq!(summary.content, "Answer");
        assert_eq!(summary.reasoning, "thinking...");
    }

    #[test]
    fn n_best_choices_tracked_by_index() {
        let mut normalizer = StreamNormalizer::new("openrouter", "gpt-4");
        normalizer.on_event(ChunkEvent::Content {
            index: 0,
            text: "first".to_string(),
        });
        normalizer.on_event(ChunkEvent::Content {
            index: 1,
            text: "second".to_string(),
        });

        assert_eq!(normalizer.accumulated_content(), "first");
        let chunk = normalizer
            .on_event(ChunkEvent::Content {
                index: 1,
                text: "!".to_string(),
            })
            .expect("chunk");
        assert_eq!(chunk.choices[0].index, 1);
    }

    #[test]
    fn reported_usage_wins_over_estimate() {
        let mut normalizer = StreamNormalizer::new("openrouter", "gpt-4");
        normalizer.on_event(ChunkEvent::Content {
            index: 0,
            text: "x".repeat(400),
        });
        normalizer.on_event(ChunkEvent::Usage(Usage::new(17, 23)));

        let summary = normalizer.finalize(1_000);
        assert!(summary.usage_reported);
        assert_eq!(summary.usage.prompt_tokens, 17);
        assert_eq!(summary.usage.completion_tokens, 23);
    }

    #[test]
    fn estimation_uses_four_chars_per_token_with_floor() {
        let mut normalizer = StreamNormalizer::new("openrouter", "gpt-4");
        normalizer.on_event(ChunkEvent::Content {
            index: 0,
            text: "x".repeat(100),
        });

        let summary = normalizer.finalize(200);
        assert!(!summary.usage_reported);
        assert_eq!(summary.usage.completion_tokens, 25);
        assert_eq!(summary.usage.prompt_tokens, 50);

        // Floor of 1 on each axis
        let empty = StreamNormalizer::new("openrouter", "gpt-4").finalize(0);
        assert_eq!(empty.usage.prompt_tokens, 1);
        assert_eq!(empty.usage.completion_tokens, 1);
    }

    #[test]
    fn empty_stream_detected() {
        let normalizer = StreamNormalizer::new("openrouter", "m-empty");
        let summary = normalizer.finalize(40);
        assert!(summary.is_empty_stream());

        let mut with_chunks = StreamNormalizer::new("openrouter", "gpt-4");
        with_chunks.on_event(ChunkEvent::Role {
            index: 0,
            role: MessageRole::Assistant,
        });
        assert!(!with_chunks.finalize(40).is_empty_stream());
    }

    #[test]
    fn finish_reason_carried() {
        let mut normalizer = StreamNormalizer::new("openrouter", "gpt-4");
        normalizer.on_event(ChunkEvent::Content {
            index: 0,
            text: "done".to_string(),
        });
        let chunk = normalizer
            .on_event(ChunkEvent::Finish {
                index: 0,
                reason: FinishReason::Length,
            })
            .expect("chunk");
        assert_eq!(chunk.choices[0].finish_reason, Some(FinishReason::Length));

        let summary = normalizer.finalize(0);
        assert_eq!(summary.finish_reason, Some(FinishReason::Length));
    }
}
