//! Prompt assembly shared by the status, summarization and retrieval paths.
//!
//! Configured segments are resolved against a [`SegmentContext`], empty
//! segments are dropped, and adjacent messages sharing a role are merged
//! with a blank line before dispatch.

use anyhow::{Context, Result};
use regex_lite::Regex;

use crate::config::{PromptSegment, TranscriptRules};
use crate::host::{ChatMessage, LlmMessage};
use crate::snapshot::StatusSnapshot;

pub const CHAT_CONTEXT_PLACEHOLDER: &str = "{{chat_context}}";

/// Everything a segment list may refer to.
#[derive(Default)]
pub struct SegmentContext<'a> {
    pub char_persona: &'a str,
    pub user_persona: &'a str,
    pub prior_snapshot: Option<&'a StatusSnapshot>,
    /// Prior summary slice contents, oldest first.
    pub prior_summaries: &'a [String],
    /// Pre-rendered recent turns for `{{chat_context}}`.
    pub chat_context: &'a str,
    /// Assembled transcript of the batch being summarized.
    pub transcript: &'a str,
    /// Chat log for `Context` segments.
    pub messages: &'a [ChatMessage],
    pub context_rules: Option<&'a CompiledRules>,
}

/// Resolve segments into outbound messages.
pub fn assemble(segments: &[PromptSegment], ctx: &SegmentContext) -> Vec<LlmMessage> {
    let mut out: Vec<LlmMessage> = Vec::new();

    for segment in segments {
        let (role, content) = match segment {
            PromptSegment::CharPersona { role } => (*role, ctx.char_persona.to_string()),
            PromptSegment::UserPersona { role } => (*role, ctx.user_persona.to_string()),
            PromptSegment::PriorSnapshot { role } => {
                let rendered = ctx
                    .prior_snapshot
                    .and_then(|s| serde_json::to_string_pretty(s).ok())
                    .unwrap_or_default();
                (*role, rendered)
            }
            PromptSegment::PriorSummaries { role, count } => {
                let skip = ctx.prior_summaries.len().saturating_sub(*count);
                (*role, ctx.prior_summaries[skip..].join("\n\n"))
            }
            PromptSegment::Context {
                role,
                max_messages,
                include_first,
            } => {
                let rendered = render_context(
                    ctx.messages,
                    *max_messages,
                    *include_first,
                    ctx.context_rules,
                );
                (*role, rendered)
            }
            PromptSegment::Transcript { role } => (*role, ctx.transcript.to_string()),
            PromptSegment::Text { role, content } => (
                *role,
                content.replace(CHAT_CONTEXT_PLACEHOLDER, ctx.chat_context),
            ),
        };

        if content.trim().is_empty() {
            continue;
        }

        match out.last_mut() {
            Some(last) if last.role == role => {
                last.content.push_str("\n\n");
                last.content.push_str(&content);
            }
            _ => out.push(LlmMessage { role, content }),
        }
    }

    out
}

/// Compiled form of [`TranscriptRules`]; compile once per task, not per
/// message.
pub struct CompiledRules {
    extract: Option<Regex>,
    strip: Option<Regex>,
    exempt_layer_zero: bool,
    exempt_user: bool,
    drop_user: bool,
}

impl CompiledRules {
    pub fn compile(rules: &TranscriptRules) -> Result<Self> {
        let extract = rules
            .extract_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid extraction pattern")?;
        let strip = rules
            .strip_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("invalid strip pattern")?;
        Ok(Self {
            extract,
            strip,
            exempt_layer_zero: rules.exempt_layer_zero,
            exempt_user: rules.exempt_user,
            drop_user: rules.drop_user,
        })
    }

    /// Apply the rules to one message. `None` means the message is excluded
    /// (dropped by the stronger switch, or emptied by filtering).
    pub fn apply(&self, message: &ChatMessage) -> Option<String> {
        if self.drop_user && message.is_user() {
            return None;
        }

        let exempt = (self.exempt_layer_zero && message.message_id == 0)
            || (self.exempt_user && message.is_user());

        let mut content = message.content.clone();
        if !exempt {
            if let Some(extract) = &self.extract {
                let kept: Vec<&str> = extract
                    .find_iter(&content)
                    .map(|m| m.as_str())
                    .collect();
                content = kept.join("\n");
            }
        }
        if let Some(strip) = &self.strip {
            content = strip.replace_all(&content, "").into_owned();
        }

        let trimmed = content.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }
}

/// Format a message range as a transcript, one `Name: content` line block per
/// surviving message.
pub fn format_transcript(messages: &[ChatMessage], rules: &CompiledRules) -> String {
    messages
        .iter()
        .filter_map(|m| rules.apply(m).map(|content| format!("{}: {}", m.name, content)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Format the trailing turns of the log as `role: content` lines, filtering
/// system messages and optionally the very first message.
pub fn render_context(
    messages: &[ChatMessage],
    max_messages: usize,
    include_first: bool,
    rules: Option<&CompiledRules>,
) -> String {
    let eligible: Vec<&ChatMessage> = messages
        .iter()
        .filter(|m| m.author != crate::host::Author::System)
        .filter(|m| include_first || m.message_id != 0)
        .collect();
    let skip = eligible.len().saturating_sub(max_messages);

    eligible[skip..]
        .iter()
        .filter_map(|m| {
            let content = match rules {
                Some(rules) => rules.apply(m)?,
                None => {
                    let trimmed = m.content.trim();
                    if trimmed.is_empty() {
                        return None;
                    }
                    trimmed.to_string()
                }
            };
            Some(format!("{}: {}", m.role_label(), content))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PromptSegment;
    use crate::host::mock::message;
    use crate::host::{Author, Role};

    fn no_rules() -> CompiledRules {
        CompiledRules::compile(&TranscriptRules::default()).unwrap()
    }

    #[test]
    fn adjacent_same_role_segments_merge_with_blank_line() {
        let segments = vec![
            PromptSegment::Text {
                role: Role::System,
                content: "first".to_string(),
            },
            PromptSegment::Text {
                role: Role::System,
                content: "second".to_string(),
            },
            PromptSegment::Text {
                role: Role::User,
                content: "third".to_string(),
            },
        ];
        let out = assemble(&segments, &SegmentContext::default());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].content, "first\n\nsecond");
        assert_eq!(out[1].role, Role::User);
    }

    #[test]
    fn empty_segments_are_dropped() {
        let segments = vec![
            PromptSegment::CharPersona { role: Role::System },
            PromptSegment::Text {
                role: Role::User,
                content: "hello".to_string(),
            },
        ];
        // char_persona empty in default context.
        let out = assemble(&segments, &SegmentContext::default());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "hello");
    }

    #[test]
    fn chat_context_placeholder_resolves() {
        let segments = vec![PromptSegment::Text {
            role: Role::User,
            content: "Recent:\n{{chat_context}}".to_string(),
        }];
        let ctx = SegmentContext {
            chat_context: "user: hi",
            ..SegmentContext::default()
        };
        let out = assemble(&segments, &ctx);
        assert_eq!(out[0].content, "Recent:\nuser: hi");
    }

    #[test]
    fn prior_summaries_takes_most_recent() {
        let summaries = vec!["one".to_string(), "two".to_string(), "three".to_string()];
        let segments = vec![PromptSegment::PriorSummaries {
            role: Role::System,
            count: 2,
        }];
        let ctx = SegmentContext {
            prior_summaries: &summaries,
            ..SegmentContext::default()
        };
        let out = assemble(&segments, &ctx);
        assert_eq!(out[0].content, "two\n\nthree");
    }

    #[test]
    fn extraction_keeps_only_matches_and_drops_emptied_messages() {
        let rules = CompiledRules::compile(&TranscriptRules {
            extract_pattern: Some(r"「[^」]*」".to_string()),
            ..TranscriptRules::default()
        })
        .unwrap();
        let spoken = message(3, Author::Assistant, "He nods. 「Follow me.」");
        assert_eq!(rules.apply(&spoken).unwrap(), "「Follow me.」");
        let silent = message(4, Author::Assistant, "He only nods.");
        assert!(rules.apply(&silent).is_none());
    }

    #[test]
    fn layer_zero_and_user_exemptions_skip_extraction() {
        let rules = CompiledRules::compile(&TranscriptRules {
            extract_pattern: Some(r"「[^」]*」".to_string()),
            exempt_layer_zero: true,
            exempt_user: true,
            ..TranscriptRules::default()
        })
        .unwrap();
        let opening = message(0, Author::Assistant, "The tavern is crowded.");
        assert_eq!(rules.apply(&opening).unwrap(), "The tavern is crowded.");
        let user = message(5, Author::User, "I look around.");
        assert_eq!(rules.apply(&user).unwrap(), "I look around.");
    }

    #[test]
    fn drop_user_switch_beats_exemption() {
        let rules = CompiledRules::compile(&TranscriptRules {
            exempt_user: true,
            drop_user: true,
            ..TranscriptRules::default()
        })
        .unwrap();
        let user = message(5, Author::User, "I look around.");
        assert!(rules.apply(&user).is_none());
    }

    #[test]
    fn context_rendering_filters_system_and_first_message() {
        let messages = vec![
            message(0, Author::Assistant, "opening scene"),
            message(1, Author::System, "host notice"),
            message(2, Author::User, "hi"),
            message(3, Author::Assistant, "hello"),
        ];
        let rendered = render_context(&messages, 10, false, Some(&no_rules()));
        assert_eq!(rendered, "user: hi\nassistant: hello");
        let with_first = render_context(&messages, 10, true, Some(&no_rules()));
        assert!(with_first.starts_with("assistant: opening scene"));
    }

    #[test]
    fn transcript_uses_speaker_names() {
        let messages = vec![
            message(1, Author::User, "hi"),
            message(2, Author::Assistant, "hello"),
        ];
        let transcript = format_transcript(&messages, &no_rules());
        assert_eq!(transcript, "Alice: hi\nHero: hello");
    }
}
