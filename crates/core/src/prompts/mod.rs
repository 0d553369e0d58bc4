use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::PromptConfig;

const BUILT_IN_PROMPTS: &str = include_str!("../../prompts/default.toml");

pub type PromptArguments = HashMap<String, String>;

/// Keys of the templates every run renders.
pub mod keys {
    pub const STORY_BIBLE: &str = "story_bible";
    pub const OUTLINE: &str = "outline";
    pub const OUTLINE_NODE: &str = "outline_node";
    pub const CHAPTER_DRAFT: &str = "chapter_draft";
    pub const FACT_EXTRACTION: &str = "fact_extraction";
    pub const CONNECTION_PROBE: &str = "connection_probe";
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

impl PromptSource {
    pub fn is_builtin(&self) -> bool {
        matches!(self, Self::BuiltIn)
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            Self::BuiltIn => None,
            Self::File(path) => Some(path.as_path()),
        }
    }
}

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("prompt `{0}` not found")]
    NotFound(String),
    #[error("missing argument `{argument}` when rendering prompt `{key}`")]
    MissingArgument { key: String, argument: String },
    #[error("failed to read prompt file `{path}`: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse built-in prompt definitions: {0}")]
    ParseBuiltIn(toml::de::Error),
    #[error("failed to parse prompt file `{path}` as TOML: {source}")]
    ParseToml {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to parse prompt file `{path}` as YAML: {source}")]
    ParseYaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("prompt `{key}` declares required argument `{argument}` that never appears in its template")]
    InvalidRequired { key: String, argument: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Piece {
    Text(String),
    Slot(String),
}

/// A parsed template. `{name}` marks a slot, `{{` and `}}` are literal braces.
#[derive(Clone, Debug)]
pub struct PromptTemplate {
    key: String,
    template: String,
    pieces: Vec<Piece>,
    required: BTreeSet<String>,
    description: Option<String>,
    source: PromptSource,
}

impl PromptTemplate {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn source(&self) -> &PromptSource {
        &self.source
    }

    pub fn placeholders(&self) -> BTreeSet<&str> {
        self.pieces
            .iter()
            .filter_map(|piece| match piece {
                Piece::Slot(name) => Some(name.as_str()),
                Piece::Text(_) => None,
            })
            .collect()
    }

    pub fn required_arguments(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn render(&self, arguments: &PromptArguments) -> Result<String, PromptError> {
        if let Some(missing) = self.required.iter().find(|name| !arguments.contains_key(*name)) {
            return Err(PromptError::MissingArgument {
                key: self.key.clone(),
                argument: missing.clone(),
            });
        }

        Ok(self
            .pieces
            .iter()
            .map(|piece| match piece {
                Piece::Text(text) => text.as_str(),
                Piece::Slot(name) => arguments.get(name).map_or("", String::as_str),
            })
            .collect())
    }

    pub fn render_with<I, K, V>(&self, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: PromptArguments = arguments
            .into_iter()
            .map(|(key, value)| (key.into(), value.into()))
            .collect();
        self.render(&map)
    }

    fn compile(key: String, raw: RawPrompt, source: PromptSource) -> Result<Self, PromptError> {
        let pieces = split_template(&raw.template);
        let slots: BTreeSet<String> = pieces
            .iter()
            .filter_map(|piece| match piece {
                Piece::Slot(name) => Some(name.clone()),
                Piece::Text(_) => None,
            })
            .collect();

        let required = if raw.required.is_empty() {
            slots
        } else {
            let mut declared = BTreeSet::new();
            for argument in raw.required {
                let argument = argument.trim().to_string();
                if !slots.contains(&argument) {
                    return Err(PromptError::InvalidRequired { key, argument });
                }
                declared.insert(argument);
            }
            declared
        };

        Ok(Self {
            key,
            template: raw.template,
            pieces,
            required,
            description: raw.description,
            source,
        })
    }
}

fn split_template(template: &str) -> Vec<Piece> {
    let mut pieces = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(pos) = rest.find(|c: char| c == '{' || c == '}') {
        text.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        if tail.starts_with("{{") || tail.starts_with("}}") {
            text.push_str(&tail[..1]);
            rest = &tail[2..];
            continue;
        }
        if tail.starts_with('}') {
            text.push('}');
            rest = &tail[1..];
            continue;
        }

        match tail[1..].find('}') {
            Some(close) => {
                let name = tail[1..1 + close].trim();
                if name.is_empty() {
                    text.push_str("{}");
                } else {
                    if !text.is_empty() {
                        pieces.push(Piece::Text(std::mem::take(&mut text)));
                    }
                    pieces.push(Piece::Slot(name.to_string()));
                }
                rest = &tail[close + 2..];
            }
            None => {
                text.push_str(tail);
                rest = "";
            }
        }
    }

    text.push_str(rest);
    if !text.is_empty() {
        pieces.push(Piece::Text(text));
    }
    pieces
}

#[derive(Debug, Deserialize)]
struct PromptDocument {
    #[serde(default)]
    prompts: BTreeMap<String, RawPrompt>,
}

#[derive(Debug, Deserialize)]
struct RawPrompt {
    #[serde(alias = "text")]
    template: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    required: Vec<String>,
}

/// Built-in templates, overridden key by key by files found in the
/// configured directories (`*.toml`, `*.yaml`, `*.yml`, in name order).
#[derive(Debug)]
pub struct PromptRegistry {
    prompts: BTreeMap<String, PromptTemplate>,
    directories: Vec<PathBuf>,
}

impl PromptRegistry {
    pub fn new() -> Result<Self, PromptError> {
        Self::with_custom_directories::<PathBuf>(&[])
    }

    pub fn from_prompt_config(config: &PromptConfig) -> Result<Self, PromptError> {
        Self::with_custom_directories(&config.custom_directories)
    }

    pub fn with_custom_directories<P: AsRef<Path>>(directories: &[P]) -> Result<Self, PromptError> {
        let mut registry = Self {
            prompts: BTreeMap::new(),
            directories: directories
                .iter()
                .map(|dir| dir.as_ref().to_path_buf())
                .collect(),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn custom_directories(&self) -> &[PathBuf] {
        &self.directories
    }

    pub fn reload(&mut self) -> Result<(), PromptError> {
        let mut prompts = BTreeMap::new();
        let document: PromptDocument =
            toml::from_str(BUILT_IN_PROMPTS).map_err(PromptError::ParseBuiltIn)?;
        insert_document(&mut prompts, document, PromptSource::BuiltIn)?;

        for dir in &self.directories {
            for path in prompt_files(dir)? {
                let document = read_document(&path)?;
                insert_document(&mut prompts, document, PromptSource::File(path))?;
            }
        }

        self.prompts = prompts;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&PromptTemplate> {
        self.prompts.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.prompts.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn format(&self, key: &str, args: &PromptArguments) -> Result<String, PromptError> {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render(args)
    }

    pub fn format_with<I, K, V>(&self, key: &str, arguments: I) -> Result<String, PromptError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.get(key)
            .ok_or_else(|| PromptError::NotFound(key.to_string()))?
            .render_with(arguments)
    }
}

fn insert_document(
    prompts: &mut BTreeMap<String, PromptTemplate>,
    document: PromptDocument,
    source: PromptSource,
) -> Result<(), PromptError> {
    for (key, raw) in document.prompts {
        let template = PromptTemplate::compile(key.clone(), raw, source.clone())?;
        prompts.insert(key, template);
    }
    Ok(())
}

fn prompt_files(dir: &Path) -> Result<Vec<PathBuf>, PromptError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let io_error = |source| PromptError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        let supported = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| matches!(ext.to_ascii_lowercase().as_str(), "toml" | "yaml" | "yml"))
            .unwrap_or(false);
        if supported && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_document(path: &Path) -> Result<PromptDocument, PromptError> {
    let contents = fs::read_to_string(path).map_err(|source| PromptError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    if is_toml {
        toml::from_str(&contents).map_err(|source| PromptError::ParseToml {
            path: path.to_path_buf(),
            source,
        })
    } else {
        serde_yaml::from_str(&contents).map_err(|source| PromptError::ParseYaml {
            path: path.to_path_buf(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn built_in_templates_cover_every_stage() {
        let registry = PromptRegistry::new().expect("registry");
        for key in [
            keys::STORY_BIBLE,
            keys::OUTLINE,
            keys::OUTLINE_NODE,
            keys::CHAPTER_DRAFT,
            keys::FACT_EXTRACTION,
            keys::CONNECTION_PROBE,
        ] {
            let template = registry.get(key).unwrap_or_else(|| panic!("{key} missing"));
            assert!(template.source().is_builtin());
        }
    }

    #[test]
    fn renders_story_bible_prompt() {
        let registry = PromptRegistry::new().unwrap();
        let output = registry
            .format_with(
                keys::STORY_BIBLE,
                [
                    ("prompt", "A detective in 1890s Paris"),
                    ("retry_note", ""),
                ],
            )
            .unwrap();
        assert!(output.contains("A detective in 1890s Paris"));
        assert!(!output.contains("{prompt}"));
    }

    #[test]
    fn missing_argument_fails() {
        let registry = PromptRegistry::new().unwrap();
        let error = registry
            .format_with(keys::STORY_BIBLE, [("retry_note", "")])
            .expect_err("prompt argument missing");
        match error {
            PromptError::MissingArgument { argument, .. } => assert_eq!(argument, "prompt"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn escaped_braces_stay_literal() {
        let pieces = split_template("JSON {{\"a\": {value}}} done {}");
        assert_eq!(
            pieces,
            vec![
                Piece::Text("JSON {\"a\": ".into()),
                Piece::Slot("value".into()),
                Piece::Text("} done {}".into()),
            ]
        );
    }

    #[test]
    fn custom_directories_override_by_key() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("a.toml"),
            "[prompts.story_bible]\ntemplate = \"Custom {prompt}\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.yaml"),
            "prompts:\n  connection_probe:\n    template: \"ping from yaml\"\n",
        )
        .unwrap();

        let registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        let bible = registry
            .format_with(keys::STORY_BIBLE, [("prompt", "noir")])
            .unwrap();
        assert_eq!(bible, "Custom noir");
        let probe = registry.get(keys::CONNECTION_PROBE).unwrap();
        assert_eq!(probe.template(), "ping from yaml");
        assert!(!probe.source().is_builtin());
    }

    #[test]
    fn reload_picks_up_edits() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(&path, "[prompts.extra]\ntemplate = \"first {x}\"\n").unwrap();

        let mut registry = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap();
        assert_eq!(registry.format_with("extra", [("x", "1")]).unwrap(), "first 1");

        fs::write(&path, "[prompts.extra]\ntemplate = \"second {x}\"\n").unwrap();
        registry.reload().unwrap();
        assert_eq!(registry.format_with("extra", [("x", "2")]).unwrap(), "second 2");
    }

    #[test]
    fn declared_required_must_exist() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("bad.toml"),
            "[prompts.bad]\ntemplate = \"{a}\"\nrequired = [\"b\"]\n",
        )
        .unwrap();
        let error = PromptRegistry::with_custom_directories(&[dir.path()]).unwrap_err();
        assert!(matches!(error, PromptError::InvalidRequired { .. }));
    }
}
