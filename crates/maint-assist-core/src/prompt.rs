//! Prompt composition and reply shaping.
//!
//! The worker turns retrieved neighbors and a user's history into a
//! bounded list of [`ChatMessage`]s with [`PromptBuilder`], and turns the
//! same neighbors into the client-facing citation list with
//! [`context_items`].
//!
//! Message layout:
//!
//! 1. system instruction
//! 2. user message rendered from the template (`{context}`, `{query}`)
//! 3. the last `history_window` history turns, oldest first

use crate::llm::ChatMessage;
use crate::models::{ContextItem, Metadata, Neighbor, Turn};

pub const DEFAULT_SYSTEM_INSTRUCTION: &str =
    "You are a helpful assistant that gives concise answers based on the provided context.";

pub const DEFAULT_USER_TEMPLATE: &str = "You are an assistant specialized in industrial maintenance and technical troubleshooting.

AVAILABLE CONTEXT:
{context}

USER REQUEST:
{query}

INSTRUCTIONS:
1. Analyze the request:
   - If the user describes a specific problem, first look for similar interventions in the historical data
   - If the user asks for the history of a machine or piece of equipment, list past interventions chronologically
2. Structure the answer:
   - For a new problem, give recommendations based on the similar cases found
   - For a history request, present past interventions with dates, intervention types and outcomes
   - If no similar data exists, rely on general technical knowledge
3. Format:
   - Start with a short summary of your analysis
   - List recommendations or history in a structured way
   - Reference past interventions when relevant
   - Rank recommendations by likelihood of success based on history
   - End with clarifying questions if needed
4. Quality:
   - Concise but complete answers (300 words at most)
   - Prefer proven solutions
   - Mention risk levels where applicable

If the request is not about maintenance or technical equipment, answer briefly and steer back to your area of expertise.

ANSWER:";

pub const DEFAULT_FALLBACK_CONTEXT: &str = "No specific document found in the knowledge base.";

/// Citation label used when a neighbor carries no `source` metadata.
pub const UNKNOWN_SOURCE: &str = "Unknown document";

/// Number of history turns sent to the model.
pub const DEFAULT_HISTORY_WINDOW: usize = 10;

/// Builds the message list sent to the language model.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    pub system_instruction: String,
    pub user_template: String,
    pub fallback_context: String,
    pub history_window: usize,
    /// Upper bound on the joined context, in characters.
    pub max_context_chars: usize,
}

impl Default for PromptBuilder {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            user_template: DEFAULT_USER_TEMPLATE.to_string(),
            fallback_context: DEFAULT_FALLBACK_CONTEXT.to_string(),
            history_window: DEFAULT_HISTORY_WINDOW,
            max_context_chars: 12_000,
        }
    }
}

impl PromptBuilder {
    /// Join neighbor texts with blank lines, truncated to
    /// `max_context_chars`. Falls back to the static context when there
    /// is nothing to join.
    pub fn context_text(&self, neighbors: &[Neighbor]) -> String {
        if neighbors.is_empty() {
            return self.fallback_context.clone();
        }
        let joined = neighbors
            .iter()
            .map(|n| n.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        truncate_chars(&joined, self.max_context_chars)
    }

    /// Compose the prompt for `query`.
    ///
    /// `history` is the user's full stored history (already including the
    /// current user turn); only the most recent `history_window` turns are
    /// kept.
    pub fn build(&self, query: &str, neighbors: &[Neighbor], history: &[Turn]) -> Vec<ChatMessage> {
        let context = self.context_text(neighbors);
        let rendered = render_template(&self.user_template, &context, query);

        let mut messages = Vec::with_capacity(2 + self.history_window);
        messages.push(ChatMessage::system(&self.system_instruction));
        messages.push(ChatMessage::user(rendered));
        messages.extend(recent_turns(history, self.history_window).iter().map(ChatMessage::from));
        messages
    }
}

/// Substitute `{context}` and `{query}` in one pass over `template`.
/// Substituted text is never scanned again, so placeholders inside
/// retrieved documents or the query stay literal.
fn render_template(template: &str, context: &str, query: &str) -> String {
    let mut out = String::with_capacity(template.len() + context.len() + query.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{context}") {
            out.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{query}") {
            out.push_str(query);
            rest = after;
        } else {
            out.push('{');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

/// The last `window` turns, oldest first.
pub fn recent_turns(history: &[Turn], window: usize) -> &[Turn] {
    let start = history.len().saturating_sub(window);
    &history[start..]
}

/// Shape retrieved neighbors into the reply's citation list.
pub fn context_items(neighbors: &[Neighbor]) -> Vec<ContextItem> {
    neighbors
        .iter()
        .map(|n| ContextItem {
            source: n
                .metadata
                .get("source")
                .and_then(|v| v.as_str())
                .unwrap_or(UNKNOWN_SOURCE)
                .to_string(),
            page: int_field(&n.metadata, "page"),
            year: int_field(&n.metadata, "year"),
            similarity: round3(n.distance as f64),
        })
        .collect()
}

fn int_field(metadata: &Metadata, key: &str) -> Option<i64> {
    match metadata.get(key)? {
        serde_json::Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn round3(x: f64) -> f64 {
    (x * 1000.0).round() / 1000.0
}

fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use serde_json::json;

    fn neighbor(text: &str, meta: serde_json::Value, distance: f32) -> Neighbor {
        Neighbor {
            id: text.to_string(),
            text: text.to_string(),
            metadata: meta.as_object().cloned().unwrap_or_default(),
            distance,
        }
    }

    #[test]
    fn test_context_item_example() {
        let items = context_items(&[neighbor("t", json!({"source": "INT-ABC123"}), 0.12)]);
        assert_eq!(
            items,
            vec![ContextItem {
                source: "INT-ABC123".into(),
                page: None,
                year: None,
                similarity: 0.12,
            }]
        );
    }

    #[test]
    fn test_context_item_defaults_and_numeric_fields() {
        let items = context_items(&[
            neighbor("a", json!({}), 0.33333),
            neighbor("b", json!({"source": "manual.pdf", "page": 4, "year": "2021"}), 0.5),
        ]);
        assert_eq!(items[0].source, UNKNOWN_SOURCE);
        assert_eq!(items[0].similarity, 0.333);
        assert_eq!(items[1].page, Some(4));
        assert_eq!(items[1].year, Some(2021));
    }

    #[test]
    fn test_build_layout() {
        let builder = PromptBuilder::default();
        let history = vec![Turn::user("pump leaking")];
        let msgs = builder.build(
            "pump leaking",
            &[neighbor("doc one", json!({}), 0.1), neighbor("doc two", json!({}), 0.2)],
            &history,
        );

        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, Role::System);
        assert!(msgs[1].content.contains("doc one\n\ndoc two"));
        assert!(msgs[1].content.contains("USER REQUEST:\npump leaking"));
        assert_eq!(msgs[2], ChatMessage::user("pump leaking"));
    }

    #[test]
    fn test_placeholders_in_retrieved_text_stay_literal() {
        let builder = PromptBuilder {
            user_template: "CONTEXT: {context}\nQUERY: {query}".into(),
            ..Default::default()
        };
        let msgs = builder.build(
            "why {context}?",
            &[neighbor("set {query} on the panel", json!({}), 0.1)],
            &[],
        );
        assert_eq!(
            msgs[1].content,
            "CONTEXT: set {query} on the panel\nQUERY: why {context}?"
        );
    }

    #[test]
    fn test_template_without_placeholders_or_with_stray_braces() {
        assert_eq!(render_template("plain", "c", "q"), "plain");
        assert_eq!(render_template("{x} {query} {", "c", "q"), "{x} q {");
    }

    #[test]
    fn test_empty_neighbors_use_fallback_context() {
        let builder = PromptBuilder::default();
        let msgs = builder.build("q", &[], &[]);
        assert!(msgs[1].content.contains(DEFAULT_FALLBACK_CONTEXT));
    }

    #[test]
    fn test_history_window_keeps_most_recent_oldest_first() {
        let builder = PromptBuilder::default();
        let history: Vec<Turn> = (1..=11).map(|i| Turn::user(format!("turn {}", i))).collect();
        let msgs = builder.build("turn 11", &[], &history);

        let carried: Vec<&str> = msgs[2..].iter().map(|m| m.content.as_str()).collect();
        assert_eq!(carried.len(), 10);
        assert_eq!(carried.first(), Some(&"turn 2"));
        assert_eq!(carried.last(), Some(&"turn 11"));
    }

    #[test]
    fn test_context_truncated_on_char_boundary() {
        let builder = PromptBuilder {
            max_context_chars: 3,
            ..Default::default()
        };
        assert_eq!(builder.context_text(&[neighbor("éèêë", json!({}), 0.0)]), "éèê");
    }
}
