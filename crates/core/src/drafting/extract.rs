use serde::Deserialize;

use crate::bible::{Character, RawCharacter};
use crate::gateway::{ModelGateway, ModelParameters};
use crate::logging::{LogLevel, LogRecord, LogSink};
use crate::outline::OutlineNode;
use crate::prompts::{keys, PromptRegistry};
use crate::stage::Stage;
use crate::text::extract_json;
use crate::tracker::ObservedFact;

/// Facts and newly introduced characters pulled out of one draft.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Extraction {
    pub facts: Vec<ObservedFact>,
    pub characters: Vec<Character>,
    /// Set when extraction failed; the run reports it alongside its other warnings.
    pub warning: Option<String>,
}

impl Extraction {
    fn failed(warning: String) -> Self {
        Self {
            warning: Some(warning),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct RawExtraction {
    #[serde(default)]
    facts: Vec<RawFact>,
    #[serde(default)]
    characters: Vec<RawCharacter>,
}

#[derive(Deserialize)]
struct RawFact {
    #[serde(default, alias = "entity", alias = "name")]
    key: String,
    #[serde(default)]
    attribute: String,
    #[serde(default)]
    value: serde_json::Value,
}

impl RawFact {
    fn into_fact(self) -> ObservedFact {
        let value = match self.value {
            serde_json::Value::String(text) => text,
            serde_json::Value::Null => String::new(),
            other => other.to_string(),
        };
        ObservedFact::new(self.key, self.attribute, value)
    }
}

pub fn parse_extraction(reply: &str) -> Result<Extraction, serde_json::Error> {
    let raw: RawExtraction = serde_json::from_str(extract_json(reply))?;
    Ok(Extraction {
        facts: raw.facts.into_iter().map(RawFact::into_fact).collect(),
        characters: raw
            .characters
            .into_iter()
            .map(RawCharacter::into_character)
            .filter(|character| !character.name.trim().is_empty())
            .collect(),
        warning: None,
    })
}

/// One extraction call per draft. Any failure degrades to an empty
/// extraction carrying a warning; it never fails the chapter.
pub struct FactExtractor<'a> {
    prompts: &'a PromptRegistry,
    sink: &'a dyn LogSink,
}

impl<'a> FactExtractor<'a> {
    pub fn new(prompts: &'a PromptRegistry, sink: &'a dyn LogSink) -> Self {
        Self { prompts, sink }
    }

    pub async fn extract(
        &self,
        gateway: &ModelGateway,
        params: &ModelParameters,
        node: &OutlineNode,
        text: &str,
        known_characters: &[&str],
    ) -> Extraction {
        let known = if known_characters.is_empty() {
            "(none)".to_string()
        } else {
            known_characters.join(", ")
        };
        let prompt = match self.prompts.format_with(
            keys::FACT_EXTRACTION,
            [
                ("chapter_number", node.number().to_string()),
                ("known_characters", known),
                ("chapter_text", text.to_string()),
            ],
        ) {
            Ok(prompt) => prompt,
            Err(err) => {
                return self.warn(node, format!("could not render the extraction prompt: {err}"));
            }
        };

        let reply = match gateway.complete_as(Stage::Extraction, &prompt, params).await {
            Ok(reply) => reply,
            Err(err) => {
                return self.warn(node, format!("fact extraction call failed: {err}"));
            }
        };
        self.sink.log(LogRecord::new(
            LogLevel::Debug,
            format!("fact extraction reply (chapter {}):\n{reply}", node.number()),
        ));

        match parse_extraction(&reply) {
            Ok(extraction) => extraction,
            Err(err) => self.warn(node, format!("fact extraction reply was not valid JSON: {err}")),
        }
    }

    fn warn(&self, node: &OutlineNode, message: String) -> Extraction {
        let warning = format!("chapter {}: {message}; continuing without new facts", node.number());
        self.sink.log(LogRecord::new(LogLevel::Warn, warning.clone()));
        Extraction::failed(warning)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::ModelError;
    use crate::logging::VecLogSink;
    use crate::test_support::{gateway, ScriptedModel};

    fn node() -> OutlineNode {
        OutlineNode {
            index: 1,
            title: "The Witness".into(),
            summary: "Odile talks.".into(),
            goals: vec!["hear the voices".into()],
            target_length: 1200,
        }
    }

    #[test]
    fn parses_facts_and_characters() {
        let reply = r#"```json
{"facts": [{"key": "Odile", "attribute": "age", "value": 23},
           {"entity": "Salon", "attribute": "door", "value": "bolted"}],
 "characters": [{"name": "Odile Ferrand", "role": "witness", "traits": "nervous, observant"}, {"name": " "}]}
```"#;
        let extraction = parse_extraction(reply).unwrap();

        assert_eq!(
            extraction.facts,
            vec![
                ObservedFact::new("Odile", "age", "23"),
                ObservedFact::new("Salon", "door", "bolted"),
            ]
        );
        assert_eq!(extraction.characters.len(), 1);
        assert_eq!(extraction.characters[0].traits, vec!["nervous", "observant"]);
        assert!(extraction.warning.is_none());
    }

    #[tokio::test]
    async fn malformed_output_yields_nothing_and_warns() {
        let model = ScriptedModel::new([Ok("The chapter mentions a door.")]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();

        let extraction = FactExtractor::new(&prompts, &sink)
            .extract(
                &gateway(model.clone()),
                &ModelParameters::new("extractor", 512, 0.2),
                &node(),
                "Odile heard two voices.",
                &["Lucien"],
            )
            .await;

        assert!(extraction.facts.is_empty());
        assert!(extraction.characters.is_empty());
        let warning = extraction.warning.unwrap();
        assert!(warning.starts_with("chapter 2: fact extraction reply was not valid JSON"));
        assert_eq!(sink.messages_at(LogLevel::Warn), vec![warning]);
        let prompt = &model.prompts()[0];
        assert!(prompt.contains("Characters already known: Lucien"));
        assert!(prompt.contains("Odile heard two voices."));
    }

    #[tokio::test]
    async fn failed_call_is_not_fatal() {
        let model = ScriptedModel::new([Err::<&str, _>(ModelError::Unavailable("down".into()))]);
        let prompts = PromptRegistry::new().unwrap();
        let sink = VecLogSink::new();

        let extraction = FactExtractor::new(&prompts, &sink)
            .extract(
                &gateway(model),
                &ModelParameters::new("extractor", 512, 0.2),
                &node(),
                "text",
                &[],
            )
            .await;

        assert!(extraction.facts.is_empty());
        assert!(sink.messages_at(LogLevel::Warn)[0].contains("fact extraction call failed"));
        assert!(extraction.warning.unwrap().contains("fact extraction call failed"));
    }
}
