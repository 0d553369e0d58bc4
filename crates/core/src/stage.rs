use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stages. Each stage may run on its own model.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Analysis,
    Outline,
    Drafting,
    Extraction,
    Assembly,
}

impl Stage {
    pub const MODEL_STAGES: [Stage; 4] = [
        Stage::Analysis,
        Stage::Outline,
        Stage::Drafting,
        Stage::Extraction,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Self::Analysis => "story analysis",
            Self::Outline => "outline",
            Self::Drafting => "chapter drafting",
            Self::Extraction => "fact extraction",
            Self::Assembly => "manuscript assembly",
        }
    }

    /// Key used for this stage in the `stages` section of the config file.
    pub fn config_key(&self) -> &'static str {
        match self {
            Self::Analysis => "analyzer",
            Self::Outline => "outliner",
            Self::Drafting => "drafter",
            Self::Extraction => "extractor",
            Self::Assembly => "assembler",
        }
    }

    pub fn default_temperature(&self) -> f32 {
        match self {
            Self::Analysis => 0.3,
            Self::Outline => 0.7,
            Self::Drafting => 0.8,
            Self::Extraction | Self::Assembly => 0.2,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}
