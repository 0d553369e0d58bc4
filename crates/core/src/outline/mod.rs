use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bible::StoryBible;
use crate::gateway::{ModelError, ModelGateway, ModelParameters};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{keys, PromptError, PromptRegistry};
use crate::stage::Stage;
use crate::text::normalize;

/// Adjacent summaries at or above this normalized Levenshtein similarity are
/// treated as the same chapter.
pub const SIMILARITY_THRESHOLD: f64 = 0.85;
/// Allowed relative deviation of the summed target lengths from the request.
pub const LENGTH_TOLERANCE: f64 = 0.2;

/// One planned chapter.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutlineNode {
    pub index: usize,
    pub title: String,
    pub summary: String,
    pub goals: Vec<String>,
    pub target_length: u32,
}

impl OutlineNode {
    pub fn number(&self) -> usize {
        self.index + 1
    }
}

/// Ordered chapter plan. Indices are contiguous from 0 and the plan does
/// not change once built.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Outline {
    nodes: Vec<OutlineNode>,
}

impl Outline {
    /// Takes nodes in reading order and assigns indices `0..n`.
    pub fn from_nodes(nodes: Vec<OutlineNode>) -> Self {
        let nodes = nodes
            .into_iter()
            .enumerate()
            .map(|(index, node)| OutlineNode { index, ..node })
            .collect();
        Self { nodes }
    }

    pub fn nodes(&self) -> &[OutlineNode] {
        &self.nodes
    }

    pub fn get(&self, index: usize) -> Option<&OutlineNode> {
        self.nodes.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &OutlineNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn total_length(&self) -> u64 {
        self.nodes.iter().map(|node| u64::from(node.target_length)).sum()
    }

    pub fn within_tolerance(&self, requested_words: u32) -> bool {
        let requested = f64::from(requested_words);
        (self.total_length() as f64 - requested).abs() <= requested * LENGTH_TOLERANCE
    }

    /// Index of the first node whose summary nearly repeats its predecessor.
    pub fn first_adjacent_duplicate(&self) -> Option<usize> {
        (1..self.nodes.len())
            .find(|&i| summaries_similar(&self.nodes[i - 1].summary, &self.nodes[i].summary))
    }
}

impl<'a> IntoIterator for &'a Outline {
    type Item = &'a OutlineNode;
    type IntoIter = std::slice::Iter<'a, OutlineNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.nodes.iter()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutlineRequest {
    pub chapters: usize,
    pub total_words: u32,
}

impl OutlineRequest {
    pub fn words_per_chapter(&self) -> u32 {
        let chapters = u32::try_from(self.chapters.max(1)).unwrap_or(u32::MAX);
        (self.total_words / chapters).max(1)
    }
}

pub fn summaries_similar(left: &str, right: &str) -> bool {
    strsim::normalized_levenshtein(&normalize(left), &normalize(right)) >= SIMILARITY_THRESHOLD
}

#[derive(Debug, Error)]
pub enum OutlineError {
    #[error("failed to render the outline prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("model call failed while outlining: {0}")]
    Model(#[source] ModelError),
    #[error("no valid outline after {attempts} attempts: {last_issue}")]
    Exhausted { attempts: usize, last_issue: String },
}

/// Plans the novel: one outline call per attempt, a single-node repair call
/// for a near-duplicate chapter, full regeneration otherwise.
pub struct OutlineGenerator<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_attempts: usize,
}

impl<'a> OutlineGenerator<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self {
            prompts,
            sink,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn generate(
        &self,
        gateway: &ModelGateway,
        params: &ModelParameters,
        bible: &StoryBible,
        request: &OutlineRequest,
    ) -> Result<Outline, OutlineError> {
        let bible_block = bible.render_for_prompt();
        let mut retry_note = String::new();
        let mut last_issue = String::new();

        for attempt in 1..=self.max_attempts {
            self.log(
                LogLevel::Info,
                format!("outline attempt {attempt}/{}", self.max_attempts),
            );
            let prompt = self.prompts.format_with(
                keys::OUTLINE,
                [
                    ("bible", bible_block.clone()),
                    ("chapter_count", request.chapters.to_string()),
                    ("total_words", request.total_words.to_string()),
                    ("words_per_chapter", request.words_per_chapter().to_string()),
                    ("retry_note", retry_note.clone()),
                ],
            )?;

            let issue = match self.call(gateway, params, &prompt).await? {
                Some(reply) => match self.build(gateway, params, &bible_block, request, &reply).await? {
                    Ok(outline) => {
                        self.log(
                            LogLevel::Info,
                            format!(
                                "outline ready: {} chapters, {} words planned",
                                outline.len(),
                                outline.total_length()
                            ),
                        );
                        return Ok(outline);
                    }
                    Err(issue) => issue,
                },
                None => "the model refused to outline".to_string(),
            };

            self.log(
                LogLevel::Warn,
                format!("outline attempt {attempt}/{} rejected: {issue}", self.max_attempts),
            );
            retry_note = format!("\nThe previous outline was rejected because {issue}. Follow the format exactly.");
            last_issue = issue;
        }

        Err(OutlineError::Exhausted {
            attempts: self.max_attempts,
            last_issue,
        })
    }

    /// Parses and validates one outline reply. The inner `Err` carries the
    /// reason a full regeneration is needed.
    async fn build(
        &self,
        gateway: &ModelGateway,
        params: &ModelParameters,
        bible_block: &str,
        request: &OutlineRequest,
        reply: &str,
    ) -> Result<Result<Outline, String>, OutlineError> {
        let mut nodes = parse_outline(reply);
        if nodes.len() != request.chapters {
            return Ok(Err(format!(
                "it had {} chapters instead of {}",
                nodes.len(),
                request.chapters
            )));
        }
        if let Some(node) = nodes.iter().find(|node| node.summary.trim().is_empty()) {
            return Ok(Err(format!("chapter {} has no summary", node.number())));
        }
        rebalance(&mut nodes, request.total_words);
        let mut outline = Outline::from_nodes(nodes);
        if !outline.within_tolerance(request.total_words) {
            return Ok(Err(format!(
                "it planned {} words, more than {:.0}% away from {}",
                outline.total_length(),
                LENGTH_TOLERANCE * 100.0,
                request.total_words
            )));
        }

        // repairs move strictly forward: earlier pairs are already distinct
        while let Some(index) = outline.first_adjacent_duplicate() {
            self.log(
                LogLevel::Warn,
                format!("chapter {} repeats chapter {}; regenerating it", index + 1, index),
            );
            let replacement = self
                .regenerate_node(gateway, params, bible_block, request, outline.nodes(), index)
                .await?;
            match replacement {
                Some(node) if !summaries_similar(&outline.nodes[index - 1].summary, &node.summary) => {
                    outline.nodes[index] = OutlineNode {
                        index,
                        target_length: outline.nodes[index].target_length,
                        ..node
                    };
                }
                _ => {
                    return Ok(Err(format!(
                        "chapter {} kept repeating chapter {}",
                        index + 1,
                        index
                    )))
                }
            }
        }

        Ok(Ok(outline))
    }

    async fn regenerate_node(
        &self,
        gateway: &ModelGateway,
        params: &ModelParameters,
        bible_block: &str,
        request: &OutlineRequest,
        nodes: &[OutlineNode],
        index: usize,
    ) -> Result<Option<OutlineNode>, OutlineError> {
        let next_summary = nodes
            .get(index + 1)
            .map(|node| node.summary.clone())
            .unwrap_or_else(|| "(this is the final chapter)".to_string());
        let prompt = self.prompts.format_with(
            keys::OUTLINE_NODE,
            [
                ("bible", bible_block.to_string()),
                ("chapter_number", (index + 1).to_string()),
                ("chapter_count", request.chapters.to_string()),
                ("previous_summary", nodes[index - 1].summary.clone()),
                ("next_summary", next_summary),
                ("rejected_summary", nodes[index].summary.clone()),
                ("words", nodes[index].target_length.to_string()),
            ],
        )?;

        Ok(self
            .call(gateway, params, &prompt)
            .await?
            .and_then(|reply| parse_outline(&reply).into_iter().next())
            .filter(|node| !node.summary.trim().is_empty()))
    }

    /// `Ok(None)` when the backend refused; transient exhaustion is fatal.
    async fn call(
        &self,
        gateway: &ModelGateway,
        params: &ModelParameters,
        prompt: &str,
    ) -> Result<Option<String>, OutlineError> {
        self.log(LogLevel::Debug, format!("outline prompt:\n{prompt}"));
        match gateway.complete_as(Stage::Outline, prompt, params).await {
            Ok(reply) => {
                self.log(LogLevel::Debug, format!("outline reply:\n{reply}"));
                Ok(Some(reply))
            }
            Err(err) if err.is_transient() => Err(OutlineError::Model(err)),
            Err(err) => {
                self.log(LogLevel::Warn, format!("outline call refused: {err}"));
                Ok(None)
            }
        }
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Field {
    None,
    Summary,
    Goals,
}

/// Parses `Chapter N: Title` blocks with `Summary:`, `Goals:` and `Length:`
/// lines. Nodes come back ordered by chapter number with indices assigned
/// in that order; a missing length is left at 0.
pub fn parse_outline(text: &str) -> Vec<OutlineNode> {
    let mut parsed: Vec<(u32, OutlineNode)> = Vec::new();
    let mut field = Field::None;

    for line in text.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        let line = line.trim_matches('*').trim();

        if let Some(caps) = header_regex().captures(line) {
            let number: u32 = caps
                .get(1)
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            let title = caps
                .get(2)
                .map(|m| m.as_str().trim().trim_matches(|c: char| c == '[' || c == ']').trim().to_string())
                .filter(|title| !title.is_empty())
                .unwrap_or_else(|| format!("Chapter {number}"));
            parsed.push((
                number,
                OutlineNode {
                    index: 0,
                    title,
                    summary: String::new(),
                    goals: Vec::new(),
                    target_length: 0,
                },
            ));
            field = Field::None;
            continue;
        }

        let Some((_, node)) = parsed.last_mut() else {
            continue;
        };

        if let Some(caps) = field_regex().captures(line) {
            let name = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
            let value = caps.get(2).map_or("", |m| m.as_str()).trim();
            if name.starts_with("summary") {
                node.summary = value.to_string();
                field = Field::Summary;
            } else if name.starts_with("goal") {
                node.goals.extend(split_goals(value));
                field = Field::Goals;
            } else {
                node.target_length = parse_length(value).unwrap_or(0);
                field = Field::None;
            }
            continue;
        }

        match field {
            Field::Goals => {
                if let Some(goal) = bullet_regex().captures(line).and_then(|caps| caps.get(1)) {
                    node.goals.extend(split_goals(goal.as_str()));
                }
            }
            Field::Summary => {
                if !node.summary.is_empty() {
                    node.summary.push(' ');
                }
                node.summary.push_str(line);
            }
            Field::None => {}
        }
    }

    parsed.sort_by_key(|(number, _)| *number);
    parsed
        .into_iter()
        .enumerate()
        .map(|(index, (_, node))| OutlineNode { index, ..node })
        .collect()
}

fn split_goals(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(|c: char| c == ';' || c == '|')
        .map(|goal| goal.trim().trim_end_matches('.').trim().to_string())
        .filter(|goal| !goal.is_empty())
}

fn parse_length(value: &str) -> Option<u32> {
    length_regex()
        .find(value)
        .and_then(|m| m.as_str().replace(',', "").parse().ok())
}

/// Fills missing lengths with an even share, then scales every length so
/// the sum equals `total_words` exactly. The last node absorbs rounding.
pub fn rebalance(nodes: &mut [OutlineNode], total_words: u32) {
    if nodes.is_empty() {
        return;
    }
    let count = u32::try_from(nodes.len()).unwrap_or(u32::MAX);
    let share = (total_words / count).max(1);
    for node in nodes.iter_mut() {
        if node.target_length == 0 {
            node.target_length = share;
        }
    }

    let planned: u64 = nodes.iter().map(|node| u64::from(node.target_length)).sum();
    let scale = f64::from(total_words) / planned as f64;
    let mut assigned: u64 = 0;
    let last = nodes.len() - 1;
    for node in &mut nodes[..last] {
        let scaled = (f64::from(node.target_length) * scale).round().max(1.0) as u32;
        node.target_length = scaled;
        assigned += u64::from(scaled);
    }
    let remainder = u64::from(total_words).saturating_sub(assigned).max(1);
    nodes[last].target_length = u32::try_from(remainder).unwrap_or(u32::MAX);
}

fn header_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^(?:#+\s*)?(?:chapter|ch\.)\s*(\d+)\s*(?:[:.\-–—]\s*(.*))?$")
            .expect("invalid outline header regex")
    })
}

fn field_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?i)^[-*]?\s*(summary|goals?|length|target length|word count)\s*:\s*(.*)$")
            .expect("invalid outline field regex")
    })
}

fn bullet_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s+(.*)$").expect("invalid bullet regex"))
}

fn length_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"\d[\d,]*").expect("invalid length regex"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bible::Character;
    use crate::logging::NullLogSink;
    use crate::test_support::{gateway, ScriptedModel};

    fn bible() -> StoryBible {
        StoryBible::new("Paris, 1890s", "brooding")
            .with_genre("mystery")
            .with_character(Character::new("Lucien Marchand", "detective"))
    }

    fn params() -> ModelParameters {
        ModelParameters::new("outliner", 2048, 0.7)
    }

    fn outline_text(summaries: &[&str]) -> String {
        summaries
            .iter()
            .enumerate()
            .map(|(i, summary)| {
                format!(
                    "Chapter {}: Part {}\nSummary: {}\nGoals: reveal clue {}; raise the stakes\nLength: 1000\n",
                    i + 1,
                    i + 1,
                    summary,
                    i + 1
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    const DISTINCT: [&str; 3] = [
        "Lucien is summoned to a sealed salon where a banker lies dead.",
        "A seamstress admits she heard two voices behind the locked door.",
        "The chimney flue hides the mechanism that bolted the room from outside.",
    ];

    #[test]
    fn parses_blocks_in_chapter_order() {
        let text = "Here is the plan.\n\n**Chapter 2 - The Witness**\nSummary: The maid talks.\nGoals:\n- find the key\n- doubt the butler\nLength: 2,500 words\n\n### Chapter 1: [Arrival]\nSummary: Lucien arrives\nat the salon.\nGoals: inspect the door | meet the widow\n";
        let nodes = parse_outline(text);

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].index, 0);
        assert_eq!(nodes[0].title, "Arrival");
        assert_eq!(nodes[0].summary, "Lucien arrives at the salon.");
        assert_eq!(nodes[0].goals, vec!["inspect the door", "meet the widow"]);
        assert_eq!(nodes[0].target_length, 0);
        assert_eq!(nodes[1].title, "The Witness");
        assert_eq!(nodes[1].goals, vec!["find the key", "doubt the butler"]);
        assert_eq!(nodes[1].target_length, 2500);
    }

    #[test]
    fn rebalance_hits_the_requested_total() {
        let mut nodes = parse_outline(&outline_text(&DISTINCT));
        nodes[1].target_length = 0;
        rebalance(&mut nodes, 9000);

        let total: u32 = nodes.iter().map(|node| node.target_length).sum();
        assert_eq!(total, 9000);
        assert!(nodes.iter().all(|node| node.target_length > 0));
        assert!(Outline::from_nodes(nodes).within_tolerance(9000));
    }

    #[test]
    fn similarity_ignores_case_and_punctuation() {
        assert!(summaries_similar(
            "Lucien searches the salon.",
            "lucien searches the salon!"
        ));
        assert!(!summaries_similar(DISTINCT[0], DISTINCT[1]));
    }

    #[tokio::test]
    async fn produces_contiguous_outline() {
        let model = ScriptedModel::new([Ok(outline_text(&DISTINCT))]);
        let prompts = PromptRegistry::new().unwrap();
        let request = OutlineRequest {
            chapters: 3,
            total_words: 6000,
        };

        let outline = OutlineGenerator::new(&prompts, &NullLogSink)
            .generate(&gateway(model.clone()), &params(), &bible(), &request)
            .await
            .unwrap();

        assert_eq!(outline.len(), 3);
        let indices: Vec<usize> = outline.iter().map(|node| node.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(outline.total_length(), 6000);
        assert!(outline.first_adjacent_duplicate().is_none());
        assert!(model.prompts()[0].contains("exactly 3 chapters"));
    }

    #[tokio::test]
    async fn repairs_a_repeated_node_alone() {
        let repeated = [DISTINCT[0], DISTINCT[0], DISTINCT[2]];
        let repair = "Chapter 2: The Seamstress\nSummary: A seamstress admits she heard two voices.\nGoals: hear the voices\nLength: 900";
        let model = ScriptedModel::new([Ok(outline_text(&repeated)), Ok(repair.to_string())]);
        let prompts = PromptRegistry::new().unwrap();
        let request = OutlineRequest {
            chapters: 3,
            total_words: 3000,
        };

        let outline = OutlineGenerator::new(&prompts, &NullLogSink)
            .generate(&gateway(model.clone()), &params(), &bible(), &request)
            .await
            .unwrap();

        assert_eq!(outline.get(1).unwrap().title, "The Seamstress");
        assert_eq!(outline.get(1).unwrap().index, 1);
        assert_eq!(outline.total_length(), 3000);
        assert_eq!(model.prompts().len(), 2);
        assert!(model.prompts()[1].contains("Rejected summary"));
    }

    #[tokio::test]
    async fn wrong_count_triggers_full_regeneration() {
        let model = ScriptedModel::new([
            Ok(outline_text(&DISTINCT[..2])),
            Ok(outline_text(&DISTINCT)),
        ]);
        let prompts = PromptRegistry::new().unwrap();
        let request = OutlineRequest {
            chapters: 3,
            total_words: 3000,
        };

        let outline = OutlineGenerator::new(&prompts, &NullLogSink)
            .generate(&gateway(model.clone()), &params(), &bible(), &request)
            .await
            .unwrap();

        assert_eq!(outline.len(), 3);
        assert!(model.prompts()[1].contains("it had 2 chapters instead of 3"));
    }

    #[tokio::test]
    async fn persistent_failure_is_bounded() {
        let repeated = outline_text(&[DISTINCT[0], DISTINCT[0]]);
        let model = ScriptedModel::new([
            Ok(repeated.clone()),
            Ok(repeated.clone()),
            Ok(repeated.clone()),
            Ok(repeated),
        ]);
        let prompts = PromptRegistry::new().unwrap();
        let request = OutlineRequest {
            chapters: 2,
            total_words: 2000,
        };

        let err = OutlineGenerator::new(&prompts, &NullLogSink)
            .with_max_attempts(2)
            .generate(&gateway(model.clone()), &params(), &bible(), &request)
            .await
            .unwrap_err();

        assert!(matches!(err, OutlineError::Exhausted { attempts: 2, .. }));
        assert_eq!(model.prompts().len(), 4);
    }

    #[tokio::test]
    async fn plan_outside_the_length_tolerance_is_rejected() {
        // three chapters cannot share two words without overshooting
        let model = ScriptedModel::new([Ok(outline_text(&DISTINCT)), Ok(outline_text(&DISTINCT))]);
        let prompts = PromptRegistry::new().unwrap();
        let request = OutlineRequest {
            chapters: 3,
            total_words: 2,
        };

        let err = OutlineGenerator::new(&prompts, &NullLogSink)
            .with_max_attempts(2)
            .generate(&gateway(model), &params(), &bible(), &request)
            .await
            .unwrap_err();

        match err {
            OutlineError::Exhausted { attempts, last_issue } => {
                assert_eq!(attempts, 2);
                assert_eq!(last_issue, "it planned 3 words, more than 20% away from 2");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
