//! Survey question catalogs
//!
//! Phase-1 payloads are checked against the questions a survey defines.
//! Without a catalog file every survey is accepted as long as question ids
//! are present and unique.

use async_trait::async_trait;
use fsr_common::{Answer, Error, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// File name of the optional catalog inside the root folder
pub const CATALOG_FILE: &str = "surveys.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuestionSpec {
    pub id: String,
    #[serde(default)]
    pub required: bool,
}

#[async_trait]
pub trait SurveyCatalog: Send + Sync {
    /// Questions for a survey; `None` means "accept any question ids"
    async fn questions(&self, survey_id: &str) -> Result<Option<Vec<QuestionSpec>>>;
}

/// Accepts every survey
pub struct PermissiveCatalog;

#[async_trait]
impl SurveyCatalog for PermissiveCatalog {
    async fn questions(&self, _survey_id: &str) -> Result<Option<Vec<QuestionSpec>>> {
        Ok(None)
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default, rename = "survey")]
    surveys: Vec<SurveyEntry>,
}

#[derive(Debug, Deserialize)]
struct SurveyEntry {
    id: String,
    #[serde(default, rename = "question")]
    questions: Vec<QuestionSpec>,
}

/// Fixed set of known surveys; unknown surveys are rejected
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    surveys: HashMap<String, Vec<QuestionSpec>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_survey(mut self, survey_id: &str, questions: Vec<QuestionSpec>) -> Self {
        self.surveys.insert(survey_id.to_string(), questions);
        self
    }

    /// Parse a catalog file of `[[survey]]` tables, each with `[[survey.question]]` entries
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| Error::Config(format!("Invalid survey catalog: {}", e)))?;
        Ok(Self {
            surveys: file
                .surveys
                .into_iter()
                .map(|s| (s.id, s.questions))
                .collect(),
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn survey_count(&self) -> usize {
        self.surveys.len()
    }
}

#[async_trait]
impl SurveyCatalog for StaticCatalog {
    async fn questions(&self, survey_id: &str) -> Result<Option<Vec<QuestionSpec>>> {
        match self.surveys.get(survey_id) {
            Some(questions) => Ok(Some(questions.clone())),
            None => Err(Error::Validation(format!("Unknown survey: {}", survey_id))),
        }
    }
}

/// Check answers against a survey's questions
///
/// Ids must be non-empty and unique. With a question list, unknown ids are
/// rejected and required questions must be answered (not skipped) unless
/// the interview was abandoned.
pub fn validate_answers(
    questions: Option<&[QuestionSpec]>,
    answers: &[Answer],
    abandoned: bool,
) -> Result<()> {
    let mut seen = HashSet::new();
    for answer in answers {
        if answer.question_id.trim().is_empty() {
            return Err(Error::Validation("Answer with empty question id".into()));
        }
        if !seen.insert(answer.question_id.as_str()) {
            return Err(Error::Validation(format!(
                "Duplicate answer for question {}",
                answer.question_id
            )));
        }
    }

    let Some(questions) = questions else {
        return Ok(());
    };

    let known: HashSet<&str> = questions.iter().map(|q| q.id.as_str()).collect();
    if let Some(unknown) = answers.iter().find(|a| !known.contains(a.question_id.as_str())) {
        return Err(Error::Validation(format!(
            "Unknown question {}",
            unknown.question_id
        )));
    }

    if !abandoned {
        for question in questions.iter().filter(|q| q.required) {
            let answered = answers
                .iter()
                .any(|a| a.question_id == question.id && !a.skipped && !a.value.is_null());
            if !answered {
                return Err(Error::Validation(format!(
                    "Required question {} not answered",
                    question.id
                )));
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answer(id: &str, value: serde_json::Value) -> Answer {
        Answer {
            question_id: id.into(),
            value,
            skipped: false,
        }
    }

    fn questions() -> Vec<QuestionSpec> {
        vec![
            QuestionSpec {
                id: "q1".into(),
                required: true,
            },
            QuestionSpec {
                id: "q2".into(),
                required: false,
            },
        ]
    }

    #[test]
    fn test_duplicate_ids_rejected_even_without_catalog() {
        let answers = vec![answer("q1", json!(1)), answer("q1", json!(2))];
        assert!(validate_answers(None, &answers, false).is_err());
    }

    #[test]
    fn test_unknown_question_rejected() {
        let qs = questions();
        let answers = vec![answer("q1", json!(1)), answer("q9", json!(2))];
        assert!(validate_answers(Some(&qs), &answers, false).is_err());
    }

    #[test]
    fn test_required_question_waived_for_abandoned() {
        let qs = questions();
        let answers = vec![answer("q2", json!("maybe"))];
        assert!(validate_answers(Some(&qs), &answers, false).is_err());
        assert!(validate_answers(Some(&qs), &answers, true).is_ok());
    }

    #[test]
    fn test_catalog_file_parses() {
        let catalog = StaticCatalog::from_toml_str(
            r#"
            [[survey]]
            id = "household-2026"

            [[survey.question]]
            id = "q1"
            required = true

            [[survey.question]]
            id = "q2"
            "#,
        )
        .unwrap();
        assert_eq!(catalog.survey_count(), 1);
    }

    #[tokio::test]
    async fn test_static_catalog_rejects_unknown_survey() {
        let catalog = StaticCatalog::new().with_survey("s1", questions());
        assert!(catalog.questions("s1").await.unwrap().is_some());
        assert!(matches!(
            catalog.questions("s2").await,
            Err(Error::Validation(_))
        ));
        assert!(PermissiveCatalog.questions("s2").await.unwrap().is_none());
    }
}
