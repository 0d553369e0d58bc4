use std::collections::HashSet;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::outline::OutlineNode;
use crate::text::{normalize, word_count};
use crate::tracker::FactConflict;

const STEM_CHARS: usize = 5;
const MIN_KEYWORD_CHARS: usize = 4;
const STOPWORDS: [&str; 24] = [
    "about", "after", "again", "against", "before", "being", "between", "chapter", "could",
    "during", "first", "from", "have", "into", "more", "other", "should", "that", "their",
    "them", "then", "there", "this", "with",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewDecision {
    Accept,
    Revise,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accept => f.write_str("accept"),
            Self::Revise => f.write_str("revise"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Review {
    pub decision: ReviewDecision,
    /// Mean of the per-heuristic scores, in `[0, 1]`.
    pub score: f64,
    pub issues: Vec<String>,
}

impl Review {
    pub fn accepted(&self) -> bool {
        self.decision == ReviewDecision::Accept
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReviewPolicy {
    pub min_length_ratio: f64,
    pub max_length_ratio: f64,
    /// Sørensen-Dice similarity at which two paragraphs count as repeats.
    pub repetition_threshold: f64,
    /// Paragraphs shorter than this are ignored by the repetition check.
    pub min_paragraph_chars: usize,
}

impl Default for ReviewPolicy {
    fn default() -> Self {
        Self {
            min_length_ratio: 0.5,
            max_length_ratio: 1.6,
            repetition_threshold: 0.9,
            min_paragraph_chars: 40,
        }
    }
}

/// Deterministic acceptance check for chapter drafts. Any triggered
/// heuristic forces a revision.
#[derive(Clone, Debug, Default)]
pub struct QualityReviewer {
    policy: ReviewPolicy,
}

impl QualityReviewer {
    pub fn new(policy: ReviewPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ReviewPolicy {
        &self.policy
    }

    pub fn review(&self, text: &str, node: &OutlineNode, conflicts: &[FactConflict]) -> Review {
        let mut issues = Vec::new();
        let text = text.trim();
        if text.is_empty() {
            return Review {
                decision: ReviewDecision::Revise,
                score: 0.0,
                issues: vec!["the draft is empty".to_string()],
            };
        }

        let scores = [
            self.check_length(text, node, &mut issues),
            self.check_goals(text, node, &mut issues),
            check_conflicts(conflicts, &mut issues),
            self.check_repetition(text, &mut issues),
        ];
        let score = (scores.iter().sum::<f64>() / scores.len() as f64).clamp(0.0, 1.0);

        Review {
            decision: if issues.is_empty() {
                ReviewDecision::Accept
            } else {
                ReviewDecision::Revise
            },
            score,
            issues,
        }
    }

    fn check_length(&self, text: &str, node: &OutlineNode, issues: &mut Vec<String>) -> f64 {
        if node.target_length == 0 {
            return 1.0;
        }
        let words = word_count(text) as f64;
        let target = f64::from(node.target_length);
        let minimum = target * self.policy.min_length_ratio;
        let maximum = target * self.policy.max_length_ratio;

        if words < minimum {
            issues.push(format!(
                "the draft is too short: {} words against a target of {} (at least {:.0} needed)",
                words, node.target_length, minimum
            ));
            words / minimum
        } else if words > maximum {
            issues.push(format!(
                "the draft is too long: {} words against a target of {} (at most {:.0} allowed)",
                words, node.target_length, maximum
            ));
            maximum / words
        } else {
            1.0
        }
    }

    fn check_goals(&self, text: &str, node: &OutlineNode, issues: &mut Vec<String>) -> f64 {
        if node.goals.is_empty() {
            return 1.0;
        }
        let stems: HashSet<String> = normalize(text).split_whitespace().map(stem).collect();

        let mut covered = 0;
        for goal in &node.goals {
            if goal_covered(goal, &stems) {
                covered += 1;
            } else {
                issues.push(format!("goal not addressed: {goal}"));
            }
        }
        covered as f64 / node.goals.len() as f64
    }

    fn check_repetition(&self, text: &str, issues: &mut Vec<String>) -> f64 {
        let paragraphs: Vec<(usize, String)> = paragraph_regex()
            .split(text)
            .map(str::trim)
            .enumerate()
            .filter(|(_, p)| p.chars().count() >= self.policy.min_paragraph_chars)
            .map(|(i, p)| (i + 1, normalize(p)))
            .collect();

        let mut repeated = 0;
        for (pos, (number, paragraph)) in paragraphs.iter().enumerate() {
            let original = paragraphs[..pos].iter().find(|(_, earlier)| {
                strsim::sorensen_dice(earlier, paragraph) >= self.policy.repetition_threshold
            });
            if let Some((earlier_number, _)) = original {
                repeated += 1;
                issues.push(format!(
                    "paragraph {number} nearly repeats paragraph {earlier_number}"
                ));
            }
        }

        if paragraphs.is_empty() {
            1.0
        } else {
            1.0 - repeated as f64 / paragraphs.len() as f64
        }
    }
}

fn check_conflicts(conflicts: &[FactConflict], issues: &mut Vec<String>) -> f64 {
    for conflict in conflicts {
        issues.push(format!("contradicts an established fact: {conflict}"));
    }
    if conflicts.is_empty() {
        1.0
    } else {
        0.0
    }
}

fn stem(word: &str) -> String {
    word.chars().take(STEM_CHARS).collect()
}

/// A goal is covered when at least half of its content words (by stem)
/// appear in the draft.
fn goal_covered(goal: &str, stems: &HashSet<String>) -> bool {
    let keywords: Vec<String> = normalize(goal)
        .split_whitespace()
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS && !STOPWORDS.contains(word))
        .map(stem)
        .collect();
    if keywords.is_empty() {
        return true;
    }
    let needed = keywords.len().div_ceil(2);
    keywords.iter().filter(|keyword| stems.contains(*keyword)).count() >= needed
}

fn paragraph_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\n\s*\n").expect("invalid paragraph splitter"))
}
