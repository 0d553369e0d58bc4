use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::gateway::{ModelError, ModelGateway, ModelParameters};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::prompts::{keys, PromptError, PromptRegistry};
use crate::stage::Stage;
use crate::text::extract_json;

pub const MAX_PROMPT_CHARS: usize = 5000;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PromptValidation {
    #[error("prompt is empty")]
    Empty,
    #[error("prompt is {length} characters long (limit {MAX_PROMPT_CHARS})")]
    TooLong { length: usize },
}

/// The user's premise. Trimmed on construction and immutable afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Prompt(String);

impl Prompt {
    pub fn new(text: impl AsRef<str>) -> Result<Self, PromptValidation> {
        let text = text.as_ref().trim();
        if text.is_empty() {
            return Err(PromptValidation::Empty);
        }
        let length = text.chars().count();
        if length > MAX_PROMPT_CHARS {
            return Err(PromptValidation::TooLong { length });
        }
        Ok(Self(text.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Character {
    pub name: String,
    #[serde(default)]
    pub traits: Vec<String>,
    #[serde(default)]
    pub role: String,
}

impl Character {
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            traits: Vec::new(),
            role: role.into(),
        }
    }

    pub fn with_trait(mut self, value: impl Into<String>) -> Self {
        self.traits.push(value.into());
        self
    }
}

/// Canonical description of the story. Characters can be added or
/// enriched through [`StoryBible::amend`] but never renamed or removed.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StoryBible {
    title: Option<String>,
    genre: BTreeSet<String>,
    characters: Vec<Character>,
    setting: String,
    tone: String,
    themes: BTreeSet<String>,
}

impl StoryBible {
    pub fn new(setting: impl Into<String>, tone: impl Into<String>) -> Self {
        Self {
            setting: setting.into().trim().to_string(),
            tone: tone.into().trim().to_string(),
            ..Self::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        let title = title.into().trim().to_string();
        self.title = (!title.is_empty()).then_some(title);
        self
    }

    pub fn with_genre(mut self, tag: impl AsRef<str>) -> Self {
        self.insert_genre(tag.as_ref());
        self
    }

    pub fn with_character(mut self, character: Character) -> Self {
        self.amend([character]);
        self
    }

    pub fn with_theme(mut self, theme: impl AsRef<str>) -> Self {
        let theme = theme.as_ref().trim();
        if !theme.is_empty() {
            self.themes.insert(theme.to_string());
        }
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn genre(&self) -> &BTreeSet<String> {
        &self.genre
    }

    pub fn characters(&self) -> &[Character] {
        &self.characters
    }

    pub fn character_names(&self) -> impl Iterator<Item = &str> {
        self.characters.iter().map(|character| character.name.as_str())
    }

    pub fn setting(&self) -> &str {
        &self.setting
    }

    pub fn tone(&self) -> &str {
        &self.tone
    }

    pub fn themes(&self) -> &BTreeSet<String> {
        &self.themes
    }

    /// Problems that make the bible unusable for planning. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.genre.is_empty() {
            issues.push("genre is empty".to_string());
        }
        if self.characters.is_empty() {
            issues.push("no characters were named".to_string());
        }
        if self.setting.is_empty() {
            issues.push("setting is empty".to_string());
        }
        issues
    }

    /// Adds characters that are not yet known and merges new traits into
    /// known ones (names compare case-insensitively). Returns the names of
    /// the characters that were appended.
    pub fn amend<I>(&mut self, candidates: I) -> Vec<String>
    where
        I: IntoIterator<Item = Character>,
    {
        let mut added = Vec::new();
        for candidate in candidates {
            let name = candidate.name.trim();
            if name.is_empty() {
                continue;
            }

            match self
                .characters
                .iter_mut()
                .find(|known| known.name.eq_ignore_ascii_case(name))
            {
                Some(known) => {
                    for value in candidate.traits {
                        let value = value.trim();
                        if !value.is_empty()
                            && !known.traits.iter().any(|t| t.eq_ignore_ascii_case(value))
                        {
                            known.traits.push(value.to_string());
                        }
                    }
                    if known.role.is_empty() {
                        known.role = candidate.role.trim().to_string();
                    }
                }
                None => {
                    added.push(name.to_string());
                    self.characters.push(Character {
                        name: name.to_string(),
                        traits: candidate
                            .traits
                            .into_iter()
                            .map(|t| t.trim().to_string())
                            .filter(|t| !t.is_empty())
                            .collect(),
                        role: candidate.role.trim().to_string(),
                    });
                }
            }
        }
        added
    }

    /// Plain-text block embedded in outline and drafting prompts.
    pub fn render_for_prompt(&self) -> String {
        let mut out = String::from("Story bible\n");
        if let Some(title) = &self.title {
            out.push_str(&format!("Title: {title}\n"));
        }
        out.push_str(&format!("Genre: {}\n", join(&self.genre)));
        out.push_str(&format!("Setting: {}\n", self.setting));
        if !self.tone.is_empty() {
            out.push_str(&format!("Tone: {}\n", self.tone));
        }
        if !self.themes.is_empty() {
            out.push_str(&format!("Themes: {}\n", join(&self.themes)));
        }
        out.push_str("Characters:\n");
        for character in &self.characters {
            out.push_str(&format!("- {}", character.name));
            if !character.role.is_empty() {
                out.push_str(&format!(" ({})", character.role));
            }
            if !character.traits.is_empty() {
                out.push_str(&format!(": {}", character.traits.join(", ")));
            }
            out.push('\n');
        }
        out
    }

    fn insert_genre(&mut self, raw: &str) {
        for tag in raw.split(|c: char| c == ',' || c == '/') {
            let tag = tag.trim().to_lowercase();
            if !tag.is_empty() {
                self.genre.insert(tag);
            }
        }
    }

    /// Parses the analyzer's JSON reply.
    pub fn from_model_reply(reply: &str) -> Result<Self, serde_json::Error> {
        let raw: RawBible = serde_json::from_str(extract_json(reply))?;
        let mut bible = StoryBible::new(raw.setting, raw.tone);
        if let Some(title) = raw.title {
            bible = bible.with_title(title);
        }
        for tag in raw.genre.into_vec() {
            bible.insert_genre(&tag);
        }
        for theme in raw.themes.into_vec() {
            bible = bible.with_theme(theme);
        }
        bible.amend(raw.characters.into_iter().map(RawCharacter::into_character));
        Ok(bible)
    }
}

fn join(values: &BTreeSet<String>) -> String {
    values.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[derive(Deserialize)]
struct RawBible {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    genre: OneOrMany,
    #[serde(default)]
    characters: Vec<RawCharacter>,
    #[serde(default)]
    setting: String,
    #[serde(default)]
    tone: String,
    #[serde(default)]
    themes: OneOrMany,
}

/// Models answer `"genre": "mystery"` as often as `"genre": ["mystery"]`.
#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl Default for OneOrMany {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl OneOrMany {
    pub(crate) fn into_vec(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
pub(crate) enum RawCharacter {
    Named(String),
    Full {
        name: String,
        #[serde(default)]
        role: Option<String>,
        #[serde(default)]
        traits: OneOrMany,
    },
}

impl RawCharacter {
    pub(crate) fn into_character(self) -> Character {
        match self {
            Self::Named(name) => Character::new(name, ""),
            Self::Full { name, role, traits } => Character {
                name,
                traits: traits
                    .into_vec()
                    .iter()
                    .flat_map(|t| t.split(','))
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect(),
                role: role.unwrap_or_default(),
            },
        }
    }
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to render the analysis prompt: {0}")]
    Prompt(#[from] PromptError),
    #[error("model call failed during story analysis: {0}")]
    Model(#[source] ModelError),
    #[error("no valid story bible after {attempts} attempts: {last_issue}")]
    Exhausted { attempts: usize, last_issue: String },
}

/// Turns a [`Prompt`] into a validated [`StoryBible`], re-asking the model
/// with the rejection reasons when a reply does not validate.
pub struct StoryAnalyzer<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
    max_attempts: usize,
}

impl<'a> StoryAnalyzer<'a> {
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

    pub async fn analyze(
        &self,
        gateway: &ModelGateway,
        params: &ModelParameters,
        prompt: &Prompt,
    ) -> Result<StoryBible, AnalysisError> {
        let mut retry_note = String::new();
        let mut last_issue = String::new();

        for attempt in 1..=self.max_attempts {
            let request = self.prompts.format_with(
                keys::STORY_BIBLE,
                [
                    ("prompt", prompt.as_str().to_string()),
                    ("retry_note", retry_note.clone()),
                ],
            )?;
            self.log(
                LogLevel::Debug,
                format!("story analysis prompt (attempt {attempt}):\n{request}"),
            );

            let reply = match gateway.complete_as(Stage::Analysis, &request, params).await {
                Ok(reply) => reply,
                Err(err) if err.is_transient() => return Err(AnalysisError::Model(err)),
                Err(err) => {
                    last_issue = err.to_string();
                    self.log(
                        LogLevel::Warn,
                        format!("story analysis attempt {attempt}/{} refused: {err}", self.max_attempts),
                    );
                    continue;
                }
            };
            self.log(
                LogLevel::Debug,
                format!("story analysis reply (attempt {attempt}):\n{reply}"),
            );

            let issues = match StoryBible::from_model_reply(&reply) {
                Ok(bible) => {
                    let issues = bible.validate();
                    if issues.is_empty() {
                        self.log(
                            LogLevel::Info,
                            format!(
                                "story bible ready: {} character(s), genre {}",
                                bible.characters().len(),
                                join(bible.genre())
                            ),
                        );
                        return Ok(bible);
                    }
                    issues
                }
                Err(err) => vec![format!("reply was not valid JSON ({err})")],
            };

            last_issue = issues.join("; ");
            self.log(
                LogLevel::Warn,
                format!(
                    "story analysis attempt {attempt}/{} rejected: {last_issue}",
                    self.max_attempts
                ),
            );
            retry_note = format!(
                "\nYour previous reply was rejected because: {last_issue}. Reply again with the complete JSON object."
            );
        }

        Err(AnalysisError::Exhausted {
            attempts: self.max_attempts,
            last_issue,
        })
    }

    fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.sink.log(LogRecord::new(level, message.into()));
    }
}
