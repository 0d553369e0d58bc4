use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// A chapter as the run hands it to assembly, in any order.
#[derive(Clone, Debug, PartialEq)]
pub struct AcceptedChapter {
    pub index: usize,
    pub title: String,
    pub text: String,
    /// Kept as the best attempt after the revision budget ran out.
    pub abandoned: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExportMetadata {
    pub id: Uuid,
    pub title: String,
    pub prompt: String,
    pub generated_at: DateTime<Utc>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ManuscriptChapter {
    /// 1-based chapter number, taken from the outline index.
    pub number: usize,
    pub title: String,
    pub text: String,
}

/// Ordered `{title, text}` pair handed to external formatters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ExportRecord<'m> {
    pub title: &'m str,
    pub text: &'m str,
}

/// The terminal artifact of a run. Immutable once assembled.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Manuscript {
    metadata: ExportMetadata,
    chapters: Vec<ManuscriptChapter>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    #[error("no chapters were accepted; nothing to assemble")]
    EmptyManuscript,
}

/// Run-level data the assembler stamps onto the manuscript.
#[derive(Clone, Debug)]
pub struct ManuscriptHeader {
    pub id: Uuid,
    pub title: String,
    pub prompt: String,
    pub generated_at: DateTime<Utc>,
}

impl ManuscriptHeader {
    pub fn new(title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            prompt: prompt.into(),
            generated_at: Utc::now(),
        }
    }
}

/// Orders chapters by outline index, numbers and titles them. Pure: the same
/// header and chapters always give the same manuscript.
pub fn assemble(
    header: ManuscriptHeader,
    chapters: &[AcceptedChapter],
    warnings: &[String],
) -> Result<Manuscript, AssemblyError> {
    if chapters.is_empty() {
        return Err(AssemblyError::EmptyManuscript);
    }

    let mut ordered: Vec<&AcceptedChapter> = chapters.iter().collect();
    ordered.sort_by_key(|chapter| chapter.index);
    ordered.dedup_by_key(|chapter| chapter.index);

    let chapters = ordered
        .into_iter()
        .map(|chapter| {
            let number = chapter.index + 1;
            let title = match chapter.title.trim() {
                "" => format!("Chapter {number}"),
                title => title.to_string(),
            };
            ManuscriptChapter {
                number,
                title,
                text: chapter.text.trim().to_string(),
            }
        })
        .collect();

    Ok(Manuscript {
        metadata: ExportMetadata {
            id: header.id,
            title: header.title.trim().to_string(),
            prompt: header.prompt,
            generated_at: header.generated_at,
            warnings: warnings.to_vec(),
        },
        chapters,
    })
}

impl Manuscript {
    pub fn metadata(&self) -> &ExportMetadata {
        &self.metadata
    }

    pub fn id(&self) -> Uuid {
        self.metadata.id
    }

    pub fn title(&self) -> &str {
        &self.metadata.title
    }

    pub fn warnings(&self) -> &[String] {
        &self.metadata.warnings
    }

    pub fn chapters(&self) -> &[ManuscriptChapter] {
        &self.chapters
    }

    pub fn len(&self) -> usize {
        self.chapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }

    pub fn export_records(&self) -> Vec<ExportRecord<'_>> {
        self.chapters
            .iter()
            .map(|chapter| ExportRecord {
                title: &chapter.title,
                text: &chapter.text,
            })
            .collect()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let title = if self.metadata.title.is_empty() {
            "Untitled"
        } else {
            &self.metadata.title
        };
        out.push_str(&format!("# {title}\n\n"));
        out.push_str(&format!(
            "> Generated: {}\n>\n",
            self.metadata
                .generated_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        for line in self.metadata.prompt.trim().lines() {
            if line.trim().is_empty() {
                out.push_str(">\n");
            } else {
                out.push_str(&format!("> Prompt: {}\n", line.trim()));
            }
        }
        out.push('\n');

        if !self.metadata.warnings.is_empty() {
            out.push_str("## Warnings\n\n");
            for warning in &self.metadata.warnings {
                out.push_str(&format!("- {warning}\n"));
            }
            out.push('\n');
        }

        for chapter in &self.chapters {
            out.push_str(&format!("## Chapter {}: {}\n\n", chapter.number, chapter.title));
            out.push_str(&chapter.text);
            out.push_str("\n\n");
        }

        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        out.push('\n');
        out
    }
}
