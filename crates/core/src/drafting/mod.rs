mod extract;

pub use extract::{parse_extraction, Extraction, FactExtractor};

use std::fmt;

use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;

use crate::bible::{Character, StoryBible};
use crate::gateway::{ModelError, ModelGateway, ModelParameters};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::outline::OutlineNode;
use crate::prompts::{keys, PromptError, PromptRegistry};
use crate::review::{QualityReviewer, Review};
use crate::stage::Stage;
use crate::text::strip_fences;
use crate::tracker::{ConsistencyFact, ConsistencyTracker, FactConflict, ObservedFact};

/// One generated version of a chapter.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ChapterDraft {
    pub outline_index: usize,
    pub attempt_number: u32,
    pub text: String,
    pub score: f64,
    pub issues: Vec<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Accepted,
    Abandoned,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => f.write_str("accepted"),
            Self::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// Per-chapter states. `Accepted` and `Abandoned` are terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DraftState {
    Drafting { attempt: u32 },
    Reviewing { attempt: u32 },
    Accepted,
    Abandoned,
}

impl fmt::Display for DraftState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drafting { attempt } => write!(f, "drafting (attempt {attempt})"),
            Self::Reviewing { attempt } => write!(f, "reviewing (attempt {attempt})"),
            Self::Accepted => f.write_str("accepted"),
            Self::Abandoned => f.write_str("abandoned"),
        }
    }
}

/// Outcome of a chapter: the kept draft plus what its extraction found.
/// Facts have been checked against the tracker but not recorded yet.
#[derive(Clone, Debug)]
pub struct ChapterResult {
    pub draft: ChapterDraft,
    pub disposition: Disposition,
    pub facts: Vec<ObservedFact>,
    pub characters: Vec<Character>,
    pub conflicts: Vec<FactConflict>,
    /// Why the kept draft's extraction came back empty, if it failed.
    pub extraction_warning: Option<String>,
}

#[derive(Debug, Error)]
pub enum DraftingError {
    #[error("failed to render the drafting prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("all {attempts} drafting attempts for chapter {chapter} failed at the model gateway: {source}")]
    DraftingFailed {
        chapter: usize,
        attempts: u32,
        #[source]
        source: ModelError,
    },
}

/// Everything a chapter needs from the run, borrowed for one node.
pub struct ChapterContext<'c> {
    pub bible: &'c StoryBible,
    pub node: &'c OutlineNode,
    pub chapter_count: usize,
    pub tracker: &'c ConsistencyTracker,
    /// Tail of the previous accepted chapter; empty for the first one.
    pub previous_excerpt: &'c str,
}

#[derive(Clone, Copy, Debug)]
pub struct DraftingModels<'m> {
    pub drafter: &'m ModelParameters,
    pub extractor: &'m ModelParameters,
}

struct Candidate {
    draft: ChapterDraft,
    review: Review,
    extraction: Extraction,
    conflicts: Vec<FactConflict>,
}

impl Candidate {
    fn into_result(self, disposition: Disposition) -> ChapterResult {
        ChapterResult {
            draft: self.draft,
            disposition,
            facts: self.extraction.facts,
            characters: self.extraction.characters,
            conflicts: self.conflicts,
            extraction_warning: self.extraction.warning,
        }
    }
}

/// Bounded draft → review → revise loop for one outline node.
pub struct DraftingEngine<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    reviewer: QualityReviewer,
    max_attempts: u32,
    candidates: usize,
}

impl<'a> DraftingEngine<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self {
            prompts,
            sink,
            reviewer: QualityReviewer::default(),
            max_attempts: 3,
            candidates: 1,
        }
    }

    pub fn with_reviewer(mut self, reviewer: QualityReviewer) -> Self {
        self.reviewer = reviewer;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Drafts per attempt, generated concurrently; the best one is reviewed.
    pub fn with_candidates(mut self, candidates: usize) -> Self {
        self.candidates = candidates.max(1);
        self
    }

    pub async fn draft_chapter(
        &self,
        gateway: &ModelGateway,
        models: DraftingModels<'_>,
        ctx: &ChapterContext<'_>,
    ) -> Result<ChapterResult, DraftingError> {
        let chapter = ctx.node.number();
        let facts = ctx.tracker.context_for(ctx.node);
        let mut corrections: Vec<String> = Vec::new();
        let mut texts: Vec<String> = Vec::new();
        let mut best: Option<Candidate> = None;
        let mut last_failure: Option<ModelError> = None;
        let mut state = DraftState::Drafting { attempt: 1 };

        loop {
            self.log(LogLevel::Debug, format!("chapter {chapter}: {state}"));
            state = match state {
                DraftState::Drafting { attempt } => {
                    self.log(
                        LogLevel::Info,
                        format!("chapter {chapter}: drafting attempt {attempt}/{}", self.max_attempts),
                    );
                    let prompt = self.render_prompt(ctx, &facts, &corrections)?;
                    self.log(LogLevel::Debug, format!("chapter {chapter} prompt:\n{prompt}"));

                    let replies = join_all(
                        (0..self.candidates).map(|_| gateway.complete_as(Stage::Drafting, &prompt, models.drafter)),
                    )
                    .await;
                    texts.clear();
                    for reply in replies {
                        match reply {
                            Ok(text) => {
                                let text = strip_fences(&text);
                                if text.is_empty() {
                                    self.log(
                                        LogLevel::Warn,
                                        format!("chapter {chapter}: attempt {attempt} returned an empty draft"),
                                    );
                                    last_failure = Some(ModelError::Refusal("the model returned an empty draft".to_string()));
                                } else {
                                    texts.push(text);
                                }
                            }
                            Err(err) => {
                                self.log(
                                    LogLevel::Warn,
                                    format!("chapter {chapter}: attempt {attempt} failed at the gateway: {err}"),
                                );
                                last_failure = Some(err);
                            }
                        }
                    }

                    if !texts.is_empty() {
                        DraftState::Reviewing { attempt }
                    } else if attempt < self.max_attempts {
                        DraftState::Drafting { attempt: attempt + 1 }
                    } else {
                        DraftState::Abandoned
                    }
                }
                DraftState::Reviewing { attempt } => {
                    let reviewed = self
                        .review_candidates(gateway, models, ctx, attempt, std::mem::take(&mut texts))
                        .await;
                    let Some(candidate) = reviewed else {
                        state = if attempt < self.max_attempts {
                            DraftState::Drafting { attempt: attempt + 1 }
                        } else {
                            DraftState::Abandoned
                        };
                        continue;
                    };
                    if candidate.review.accepted() {
                        self.log(
                            LogLevel::Info,
                            format!(
                                "chapter {chapter}: accepted on attempt {attempt} (score {:.2})",
                                candidate.review.score
                            ),
                        );
                        best = Some(candidate);
                        DraftState::Accepted
                    } else {
                        self.log(
                            LogLevel::Warn,
                            format!(
                                "chapter {chapter}: attempt {attempt} needs revision: {}",
                                candidate.review.issues.join("; ")
                            ),
                        );
                        corrections = candidate.review.issues.clone();
                        if best
                            .as_ref()
                            .map_or(true, |current| candidate.review.score > current.review.score)
                        {
                            best = Some(candidate);
                        }

                        if attempt < self.max_attempts {
                            DraftState::Drafting { attempt: attempt + 1 }
                        } else {
                            DraftState::Abandoned
                        }
                    }
                }
                DraftState::Accepted => {
                    return best
                        .take()
                        .map(|candidate| candidate.into_result(Disposition::Accepted))
                        .ok_or(DraftingError::DraftingFailed {
                            chapter,
                            attempts: self.max_attempts,
                            source: ModelError::Refusal("no draft was produced".to_string()),
                        });
                }
                DraftState::Abandoned => {
                    return match best.take() {
                        Some(candidate) => {
                            self.log(
                                LogLevel::Warn,
                                format!(
                                    "chapter {chapter}: abandoned after {} attempts; keeping attempt {} (score {:.2})",
                                    self.max_attempts, candidate.draft.attempt_number, candidate.review.score
                                ),
                            );
                            Ok(candidate.into_result(Disposition::Abandoned))
                        }
                        None => Err(DraftingError::DraftingFailed {
                            chapter,
                            attempts: self.max_attempts,
                            source: last_failure
                                .take()
                                .unwrap_or_else(|| ModelError::Refusal("no draft was produced".to_string())),
                        }),
                    };
                }
            };
        }
    }

    /// Extracts facts from every draft, reviews them and keeps the best:
    /// accepted drafts first, then the highest score, then the earliest.
    /// Callers only review non-empty drafts.
    async fn review_candidates(
        &self,
        gateway: &ModelGateway,
        models: DraftingModels<'_>,
        ctx: &ChapterContext<'_>,
        attempt: u32,
        texts: Vec<String>,
    ) -> Option<Candidate> {
        let extractor = FactExtractor::new(self.prompts, self.sink);
        let known: Vec<&str> = ctx.bible.character_names().collect();
        let extractions = join_all(
            texts
                .iter()
                .map(|text| extractor.extract(gateway, models.extractor, ctx.node, text, &known)),
        )
        .await;

        let mut best: Option<Candidate> = None;
        for (text, extraction) in texts.into_iter().zip(extractions) {
            let conflicts = ctx.tracker.check(ctx.node.index, &extraction.facts);
            let review = self.reviewer.review(&text, ctx.node, &conflicts);
            let candidate = Candidate {
                draft: ChapterDraft {
                    outline_index: ctx.node.index,
                    attempt_number: attempt,
                    text,
                    score: review.score,
                    issues: review.issues.clone(),
                },
                review,
                extraction,
                conflicts,
            };
            let better = match &best {
                None => true,
                Some(current) => {
                    (candidate.review.accepted(), candidate.review.score)
                        > (current.review.accepted(), current.review.score)
                }
            };
            if better {
                best = Some(candidate);
            }
        }

        best
    }

    fn render_prompt(
        &self,
        ctx: &ChapterContext<'_>,
        facts: &[ConsistencyFact],
        corrections: &[String],
    ) -> Result<String, PromptError> {
        let node = ctx.node;
        let goals = if node.goals.is_empty() {
            "- (no explicit goals)".to_string()
        } else {
            bullet_list(&node.goals)
        };
        let facts = if facts.is_empty() {
            "- (nothing established yet)".to_string()
        } else {
            facts
                .iter()
                .map(|fact| {
                    format!(
                        "- {} / {}: {} (chapter {})",
                        fact.key,
                        fact.attribute,
                        fact.value,
                        fact.established_at + 1
                    )
                })
                .collect::<Vec<_>>()
                .join("\n")
        };
        let previous_excerpt = if ctx.previous_excerpt.trim().is_empty() {
            "(this is the opening chapter)".to_string()
        } else {
            format!("...{}", ctx.previous_excerpt.trim())
        };
        let corrections = if corrections.is_empty() {
            String::new()
        } else {
            format!(
                "\nYour previous attempt was sent back. Fix these problems:\n{}\n",
                bullet_list(corrections)
            )
        };

        self.prompts.format_with(
            keys::CHAPTER_DRAFT,
            [
                ("bible", ctx.bible.render_for_prompt()),
                ("chapter_number", node.number().to_string()),
                ("chapter_count", ctx.chapter_count.to_string()),
                ("title", node.title.clone()),
                ("summary", node.summary.clone()),
                ("goals", goals),
                ("target_words", node.target_length.to_string()),
                ("facts", facts),
                ("previous_excerpt", previous_excerpt),
                ("corrections", corrections),
            ],
        )
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bible::Character;
    use crate::logging::VecLogSink;
    use crate::test_support::{gateway, ScriptedModel};
    use crate::text::word_count;

    const GOOD: &str = "Lucien kneels at the grate and inspects the chimney flue with a borrowed lamp.\n\nSoot has been disturbed in a neat square, as if something heavy rested there.\n\nHe pockets a brass pin and says nothing to the widow waiting in the hall.";

    fn bible() -> StoryBible {
        StoryBible::new("Paris, 1890s", "brooding")
            .with_genre("mystery")
            .with_character(Character::new("Lucien", "detective"))
    }

    fn node(target_length: u32) -> OutlineNode {
        OutlineNode {
            index: 1,
            title: "The Flue".into(),
            summary: "Lucien examines the fireplace.".into(),
            goals: vec!["inspect the chimney flue".into()],
            target_length,
        }
    }

    fn params() -> (ModelParameters, ModelParameters) {
        (
            ModelParameters::new("drafter", 4096, 0.8),
            ModelParameters::new("extractor", 1024, 0.2),
        )
    }

    #[tokio::test]
    async fn accepts_a_clean_first_draft() {
        let model = ScriptedModel::new([Ok(GOOD), Ok(r#"{"facts": [{"key": "Lucien", "attribute": "found", "value": "brass pin"}]}"#)]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let tracker = ConsistencyTracker::default();
        let bible = bible();
        let node = node(word_count(GOOD) as u32);
        let ctx = ChapterContext {
            bible: &bible,
            node: &node,
            chapter_count: 3,
            tracker: &tracker,
            previous_excerpt: "The porter locked the gate behind them.",
        };
        let (drafter, extractor) = params();

        let result = DraftingEngine::new(&prompts, &sink)
            .draft_chapter(
                &gateway(model.clone()),
                DraftingModels {
                    drafter: &drafter,
                    extractor: &extractor,
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.disposition, Disposition::Accepted);
        assert_eq!(result.draft.attempt_number, 1);
        assert_eq!(result.facts, vec![ObservedFact::new("Lucien", "found", "brass pin")]);
        let prompt = &model.prompts()[0];
        assert!(prompt.contains("Chapter 2 of 3: The Flue"));
        assert!(prompt.contains("- inspect the chimney flue"));
        assert!(prompt.contains("...The porter locked the gate behind them."));
    }

    #[tokio::test]
    async fn feeds_issues_back_and_abandons_the_best() {
        let short = "Lucien inspects the chimney flue.";
        let shorter = "Lucien waits.";
        let model = ScriptedModel::new([Ok(short), Ok("{}"), Ok(shorter), Ok("{}")]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let tracker = ConsistencyTracker::default();
        let bible = bible();
        let node = node(400);
        let ctx = ChapterContext {
            bible: &bible,
            node: &node,
            chapter_count: 3,
            tracker: &tracker,
            previous_excerpt: "",
        };
        let (drafter, extractor) = params();

        let result = DraftingEngine::new(&prompts, &sink)
            .with_max_attempts(2)
            .draft_chapter(
                &gateway(model.clone()),
                DraftingModels {
                    drafter: &drafter,
                    extractor: &extractor,
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.disposition, Disposition::Abandoned);
        assert_eq!(result.draft.text, short);
        assert_eq!(result.draft.attempt_number, 1);
        let prompts_sent = model.prompts();
        assert!(prompts_sent[0].contains("(this is the opening chapter)"));
        assert!(prompts_sent[2].contains("Fix these problems:\n- the draft is too short"));
        assert!(sink
            .messages_at(LogLevel::Warn)
            .iter()
            .any(|message| message.contains("abandoned after 2 attempts")));
    }

    #[tokio::test]
    async fn conflicting_facts_force_revision() {
        let mut tracker = ConsistencyTracker::default();
        tracker
            .record(0, vec![ObservedFact::new("Lucien", "eye colour", "grey")])
            .unwrap();
        let model = ScriptedModel::new([
            Ok(GOOD),
            Ok(r#"{"facts": [{"key": "Lucien", "attribute": "eye colour", "value": "blue"}]}"#),
            Ok(GOOD),
            Ok(r#"{"facts": []}"#),
        ]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let bible = bible();
        let node = node(word_count(GOOD) as u32);
        let ctx = ChapterContext {
            bible: &bible,
            node: &node,
            chapter_count: 3,
            tracker: &tracker,
            previous_excerpt: "",
        };
        let (drafter, extractor) = params();

        let result = DraftingEngine::new(&prompts, &sink)
            .draft_chapter(
                &gateway(model.clone()),
                DraftingModels {
                    drafter: &drafter,
                    extractor: &extractor,
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.disposition, Disposition::Accepted);
        assert_eq!(result.draft.attempt_number, 2);
        assert!(result.conflicts.is_empty());
        let prompts_sent = model.prompts();
        assert!(prompts_sent[0].contains("- Lucien / eye colour: grey (chapter 1)"));
        assert!(prompts_sent[2].contains("contradicts an established fact"));
    }

    #[tokio::test]
    async fn gateway_failure_on_every_attempt_is_fatal() {
        let model = ScriptedModel::new([
            Err::<&str, _>(ModelError::Unavailable("down".into())),
            Err(ModelError::Timeout(std::time::Duration::from_secs(1))),
        ]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let tracker = ConsistencyTracker::default();
        let bible = bible();
        let node = node(400);
        let ctx = ChapterContext {
            bible: &bible,
            node: &node,
            chapter_count: 3,
            tracker: &tracker,
            previous_excerpt: "",
        };
        let (drafter, extractor) = params();

        let err = DraftingEngine::new(&prompts, &sink)
            .with_max_attempts(2)
            .draft_chapter(
                &gateway(model),
                DraftingModels {
                    drafter: &drafter,
                    extractor: &extractor,
                },
                &ctx,
            )
            .await
            .unwrap_err();

        match err {
            DraftingError::DraftingFailed {
                chapter,
                attempts,
                source,
            } => {
                assert_eq!(chapter, 2);
                assert_eq!(attempts, 2);
                assert!(matches!(source, ModelError::Timeout(_)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn fence_only_replies_never_become_a_draft() {
        let model = ScriptedModel::new([Ok("```\n```"), Ok("  ```\n\n```  ")]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let tracker = ConsistencyTracker::default();
        let bible = bible();
        let node = node(400);
        let ctx = ChapterContext {
            bible: &bible,
            node: &node,
            chapter_count: 3,
            tracker: &tracker,
            previous_excerpt: "",
        };
        let (drafter, extractor) = params();

        let err = DraftingEngine::new(&prompts, &sink)
            .with_max_attempts(2)
            .draft_chapter(
                &gateway(model.clone()),
                DraftingModels {
                    drafter: &drafter,
                    extractor: &extractor,
                },
                &ctx,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DraftingError::DraftingFailed {
                attempts: 2,
                source: ModelError::Refusal(_),
                ..
            }
        ));
        // no extraction call is spent on an empty draft
        assert_eq!(model.prompts().len(), 2);
        assert_eq!(
            sink.messages_at(LogLevel::Warn)
                .iter()
                .filter(|message| message.contains("returned an empty draft"))
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn candidates_are_drafted_concurrently_and_best_kept() {
        let short = "Lucien inspects the chimney flue.";
        let model = ScriptedModel::new([Ok(short), Ok(GOOD), Ok("{}"), Ok("{}")]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();
        let tracker = ConsistencyTracker::default();
        let bible = bible();
        let node = node(word_count(GOOD) as u32);
        let ctx = ChapterContext {
            bible: &bible,
            node: &node,
            chapter_count: 3,
            tracker: &tracker,
            previous_excerpt: "",
        };
        let (drafter, extractor) = params();

        let result = DraftingEngine::new(&prompts, &sink)
            .with_candidates(2)
            .draft_chapter(
                &gateway(model.clone()),
                DraftingModels {
                    drafter: &drafter,
                    extractor: &extractor,
                },
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.disposition, Disposition::Accepted);
        assert_eq!(result.draft.text, GOOD);
        assert_eq!(model.prompts().len(), 4);
    }
}
