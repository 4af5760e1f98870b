//! Prompt assembly under a hard token budget.
//!
//! [`PromptComposer::compose`] renders system instructions, retrieved
//! passages, session history and the current question into one prompt.
//! When the rendered prompt exceeds the budget, material is dropped in
//! this order until it fits:
//!
//! 1. the oldest history turn,
//! 2. then the lowest-scoring passage.
//!
//! The system instructions and the question are always kept verbatim. If
//! those two alone do not fit, composition fails with
//! [`RagError::PromptTooLong`]. Token counts are measured on the fully
//! rendered text, template markup included.

use crate::error::RagError;
use crate::models::{Passage, Role, Turn};
use crate::tokenize::count_tokens;

/// Chat markup used to render the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PromptTemplate {
    /// `<|im_start|>role\n...<|im_end|>`, as Qwen instruct models expect.
    #[default]
    ChatMl,
    /// `System:` / `User:` / `Assistant:` prefixes.
    Plain,
}

impl PromptTemplate {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "chatml" | "chat-ml" => Some(Self::ChatMl),
            "plain" => Some(Self::Plain),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ChatMl => "chatml",
            Self::Plain => "plain",
        }
    }
}

/// The prompt handed to the generator, with what was kept and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct ComposedPrompt {
    pub text: String,
    pub token_count: usize,
    /// Passages included, highest score first.
    pub passages: Vec<Passage>,
    pub history_turns: usize,
    pub dropped_history: usize,
    pub dropped_passages: usize,
}

#[derive(Debug, Clone)]
pub struct PromptComposer {
    template: PromptTemplate,
    budget_tokens: usize,
    system_instructions: String,
}

impl PromptComposer {
    pub fn new(
        template: PromptTemplate,
        budget_tokens: usize,
        system_instructions: impl Into<String>,
    ) -> Self {
        Self {
            template,
            budget_tokens,
            system_instructions: system_instructions.into(),
        }
    }

    pub fn budget_tokens(&self) -> usize {
        self.budget_tokens
    }

    pub fn template(&self) -> PromptTemplate {
        self.template
    }

    /// Build the prompt for `question`.
    ///
    /// `history` is oldest first. `passages` may come in any order; they
    /// are rendered highest score first.
    pub fn compose(
        &self,
        passages: &[Passage],
        history: &[Turn],
        question: &str,
    ) -> Result<ComposedPrompt, RagError> {
        let minimal = self.render(&[], &[], question);
        let required = count_tokens(&minimal);
        if required > self.budget_tokens {
            return Err(RagError::PromptTooLong {
                required,
                budget: self.budget_tokens,
            });
        }

        let mut ranked: Vec<&Passage> = passages.iter().collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut history_start = 0usize;
        let mut kept = ranked.len();

        loop {
            let text = self.render(&ranked[..kept], &history[history_start..], question);
            let token_count = count_tokens(&text);
            if token_count <= self.budget_tokens {
                return Ok(ComposedPrompt {
                    text,
                    token_count,
                    passages: ranked[..kept].iter().map(|p| (*p).clone()).collect(),
                    history_turns: history.len() - history_start,
                    dropped_history: history_start,
                    dropped_passages: ranked.len() - kept,
                });
            }
            if history_start < history.len() {
                history_start += 1;
            } else if kept > 0 {
                kept -= 1;
            } else {
                // Unreachable: the minimal prompt was checked above.
                return Err(RagError::PromptTooLong {
                    required: token_count,
                    budget: self.budget_tokens,
                });
            }
        }
    }

    fn render(&self, passages: &[&Passage], history: &[Turn], question: &str) -> String {
        let system = self.system_block(passages);
        let mut out = String::new();
        match self.template {
            PromptTemplate::ChatMl => {
                out.push_str(&format!("<|im_start|>system\n{}<|im_end|>\n", system));
                for turn in history {
                    out.push_str(&format!(
                        "<|im_start|>{}\n{}<|im_end|>\n",
                        turn.role.as_str(),
                        turn.text
                    ));
                }
                out.push_str(&format!("<|im_start|>user\n{}<|im_end|>\n", question));
                out.push_str("<|im_start|>assistant\n");
            }
            PromptTemplate::Plain => {
                out.push_str(&format!("System: {}\n\n", system));
                for turn in history {
                    let speaker = match turn.role {
                        Role::User => "User",
                        Role::Assistant => "Assistant",
                    };
                    out.push_str(&format!("{}: {}\n", speaker, turn.text));
                }
                out.push_str(&format!("User: {}\n", question));
                out.push_str("Assistant:");
            }
        }
        out
    }

    fn system_block(&self, passages: &[&Passage]) -> String {
        let mut block = self.system_instructions.clone();
        if passages.is_empty() {
            return block;
        }
        block.push_str("\n\nContext:\n");
        for (i, passage) in passages.iter().enumerate() {
            if i > 0 {
                block.push_str("\n\n");
            }
            block.push_str(&format!("[{}] {}", i + 1, passage.text.trim()));
        }
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, score: f32, words: usize) -> Passage {
        Passage {
            chunk_id: id.to_string(),
            document_id: "doc".to_string(),
            text: (0..words)
                .map(|i| format!("{}w{}", id, i))
                .collect::<Vec<_>>()
                .join(" "),
            score,
            page_start: 1,
            page_end: 1,
        }
    }

    fn history(turns: usize, words: usize) -> Vec<Turn> {
        (0..turns)
            .map(|t| {
                let text = (0..words)
                    .map(|i| format!("t{}x{}", t, i))
                    .collect::<Vec<_>>()
                    .join(" ");
                if t % 2 == 0 {
                    Turn::user(text)
                } else {
                    Turn::assistant(text)
                }
            })
            .collect()
    }

    const SYSTEM: &str = "Answer using only the provided context.";

    #[test]
    fn test_fits_without_dropping() {
        let composer = PromptComposer::new(PromptTemplate::ChatMl, 2048, SYSTEM);
        let passages = vec![passage("p", 0.9, 10)];
        let turns = history(2, 5);
        let prompt = composer.compose(&passages, &turns, "What is it?").unwrap();
        assert_eq!(prompt.dropped_history, 0);
        assert_eq!(prompt.dropped_passages, 0);
        assert_eq!(prompt.history_turns, 2);
        assert!(prompt.text.starts_with("<|im_start|>system\n"));
        assert!(prompt.text.ends_with("<|im_start|>assistant\n"));
        assert!(prompt.text.contains("[1] pw0"));
    }

    #[test]
    fn test_oversized_prompt_truncated_to_budget() {
        let composer = PromptComposer::new(PromptTemplate::ChatMl, 512, SYSTEM);
        let passages = vec![
            passage("a", 0.91, 150),
            passage("b", 0.42, 150),
            passage("c", 0.77, 150),
            passage("d", 0.13, 150),
            passage("e", 0.66, 150),
        ];
        let turns = history(10, 120);
        let question = "Which passage mentions the eruption of 1883, exactly?";

        let untruncated = composer.render(
            &passages.iter().collect::<Vec<_>>(),
            &turns,
            question,
        );
        assert!(count_tokens(&untruncated) >= 2000);

        let prompt = composer.compose(&passages, &turns, question).unwrap();
        assert!(prompt.token_count <= 512);
        assert_eq!(count_tokens(&prompt.text), prompt.token_count);
        assert!(prompt.text.contains(question));
        assert!(prompt.text.contains(SYSTEM));

        // History goes first: passages were dropped, so no history survives.
        assert!(prompt.dropped_passages > 0);
        assert_eq!(prompt.history_turns, 0);
        assert_eq!(prompt.dropped_history, 10);

        // Every kept passage outscores every dropped one.
        let min_kept = prompt
            .passages
            .iter()
            .map(|p| p.score)
            .fold(f32::INFINITY, f32::min);
        let kept_ids: Vec<&str> = prompt.passages.iter().map(|p| p.chunk_id.as_str()).collect();
        for p in &passages {
            if !kept_ids.contains(&p.chunk_id.as_str()) {
                assert!(p.score < min_kept);
            }
        }
    }

    #[test]
    fn test_drops_oldest_history_first() {
        let composer = PromptComposer::new(PromptTemplate::Plain, 200, SYSTEM);
        let passages = vec![passage("p", 0.5, 20)];
        let turns = history(6, 30);
        let prompt = composer.compose(&passages, &turns, "Why?").unwrap();

        assert_eq!(prompt.dropped_passages, 0);
        assert!(prompt.dropped_history > 0);
        assert!(prompt.history_turns > 0);
        // The newest turn survives, the oldest does not.
        assert!(prompt.text.contains("t5x0"));
        assert!(!prompt.text.contains("t0x0 "));
    }

    #[test]
    fn test_prompt_too_long() {
        let composer = PromptComposer::new(PromptTemplate::ChatMl, 10, SYSTEM);
        let err = composer
            .compose(&[], &[], "a question that is far too long for this budget")
            .unwrap_err();
        match err {
            RagError::PromptTooLong { required, budget } => {
                assert_eq!(budget, 10);
                assert!(required > 10);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_no_passages_still_composes() {
        let composer = PromptComposer::new(PromptTemplate::Plain, 512, SYSTEM);
        let prompt = composer.compose(&[], &history(2, 3), "Hello?").unwrap();
        assert!(!prompt.text.contains("Context:"));
        assert!(prompt.text.ends_with("Assistant:"));
        assert_eq!(prompt.history_turns, 2);
    }

    #[test]
    fn test_template_parse() {
        assert_eq!(PromptTemplate::parse("ChatML"), Some(PromptTemplate::ChatMl));
        assert_eq!(PromptTemplate::parse("plain"), Some(PromptTemplate::Plain));
        assert_eq!(PromptTemplate::parse("llama2"), None);
    }
}
