//! crates/cv_pipeline_core/src/extractor.rs
//!
//! The analysis stage: sends the aggregated multi-page text to the language
//! model and parses its reply into one deduplicated `StructuredData` record.

use crate::config::AnalysisConfig;
use crate::domain::StructuredData;
use crate::error::PipelineError;
use crate::ports::{CompletionRequest, LanguageModelService};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEM_INSTRUCTIONS: &str = r#"You are an expert CV analyst. Extract the candidate's information from a CV that may span several pages.

IMPORTANT:
- The text may contain page-boundary markers such as "--- PAGE 2 ---" separating the pages of the scan.
- The same content is often repeated across pages (headers, contact details, a job continued on the next page).
- Merge duplicates: when the same employment or education episode appears on more than one page, emit it ONCE, combining the details from every page.
- Combine related information from different pages into a single record.
- Leave a field out when the CV does not state it. Never write "null" or placeholder text as a value.

Return ONLY one valid JSON object, with no surrounding prose and no code fences, using exactly this structure:
{
  "personalInfo": {"name": "", "email": "", "phone": "", "location": "", "linkedIn": "", "website": ""},
  "summary": "",
  "experience": [{"company": "", "position": "", "startDate": "", "endDate": "", "description": "", "highlights": []}],
  "education": [{"institution": "", "degree": "", "field": "", "startDate": "", "endDate": ""}],
  "skills": [],
  "languages": [{"name": "", "level": ""}]
}"#;

const USER_INPUT_TEMPLATE: &str = r#"Analyze the following CV and extract the structured information. Remember to merge duplicates when the same content appears on several pages.

{text}"#;

static RE_CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*\n(.*?)\n?```$").unwrap());

/// Parses a raw model reply into `StructuredData`.
///
/// The reply must be exactly one JSON object (an outer code fence is
/// tolerated) and must carry a `personalInfo` object.
pub fn parse_reply(raw: &str) -> Result<StructuredData, PipelineError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PipelineError::EmptyReply);
    }

    let body = RE_CODE_FENCE
        .captures(trimmed)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .unwrap_or(trimmed);

    let value: serde_json::Value =
        serde_json::from_str(body).map_err(|e| PipelineError::MalformedReply {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?;

    let Some(object) = value.as_object() else {
        return Err(PipelineError::MalformedReply {
            reason: "reply is JSON but not an object".to_string(),
            raw: raw.to_string(),
        });
    };

    if !object.get("personalInfo").is_some_and(|v| v.is_object()) {
        return Err(PipelineError::MissingPersonalInfo {
            raw: raw.to_string(),
        });
    }

    let data: StructuredData =
        serde_json::from_value(value).map_err(|e| PipelineError::MalformedReply {
            reason: e.to_string(),
            raw: raw.to_string(),
        })?;

    Ok(data.deduplicated())
}

pub struct StructuredDataExtractor {
    model: Arc<dyn LanguageModelService>,
    config: AnalysisConfig,
}

impl StructuredDataExtractor {
    pub fn new(model: Arc<dyn LanguageModelService>, config: AnalysisConfig) -> Self {
        Self { model, config }
    }

    pub fn build_request(&self, aggregated_text: &str) -> CompletionRequest {
        CompletionRequest {
            system: SYSTEM_INSTRUCTIONS.to_string(),
            user: USER_INPUT_TEMPLATE.replace("{text}", aggregated_text),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Runs one completion over `aggregated_text` and parses the reply.
    pub async fn extract(&self, aggregated_text: &str) -> Result<StructuredData, PipelineError> {
        let request = self.build_request(aggregated_text);
        info!(
            chars = aggregated_text.chars().count(),
            max_tokens = request.max_tokens,
            "Requesting structured extraction."
        );

        let raw = self
            .model
            .complete(&request)
            .await
            .map_err(PipelineError::ModelInvocation)?;

        match parse_reply(&raw) {
            Ok(data) => {
                info!(
                    experience = data.experience.len(),
                    education = data.education.len(),
                    skills = data.skills.len(),
                    "Structured extraction parsed."
                );
                Ok(data)
            }
            Err(e) => {
                warn!(error = %e, reply_chars = raw.len(), "Model reply rejected.");
                if let Some(reply) = e.raw_reply() {
                    debug!(reply = %reply, "Rejected model reply.");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortError, PortResult};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct CannedModel {
        reply: PortResult<String>,
        seen: Mutex<Option<CompletionRequest>>,
    }

    #[async_trait]
    impl LanguageModelService for CannedModel {
        async fn complete(&self, request: &CompletionRequest) -> PortResult<String> {
            *self.seen.lock().unwrap() = Some(request.clone());
            self.reply.clone()
        }
    }

    fn extractor(reply: PortResult<String>) -> (StructuredDataExtractor, Arc<CannedModel>) {
        let model = Arc::new(CannedModel {
            reply,
            seen: Mutex::new(None),
        });
        (
            StructuredDataExtractor::new(model.clone(), AnalysisConfig::default()),
            model,
        )
    }

    #[test]
    fn instructions_cover_markers_merging_and_json_only() {
        let (extractor, _) = extractor(Ok(String::new()));
        let request = extractor.build_request("CV TEXT");
        assert!(request.system.contains("--- PAGE 2 ---"));
        assert!(request.system.contains("emit it ONCE"));
        assert!(request.system.contains("ONLY one valid JSON object"));
        assert!(request.user.ends_with("CV TEXT"));
        assert_eq!(request.temperature, 0.0);
    }

    #[test]
    fn fenced_json_is_accepted() {
        let raw = "```json\n{\"personalInfo\": {\"name\": \"Ana\"}, \"skills\": [\"SQL\"]}\n```";
        let data = parse_reply(raw).unwrap();
        assert_eq!(data.personal_info.name.as_deref(), Some("Ana"));
        assert_eq!(data.skills, vec!["SQL"]);
    }

    #[test]
    fn prose_reply_is_malformed() {
        let err = parse_reply("I could not find a CV in this text, sorry.").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedReply { .. }));
        assert!(err.raw_reply().unwrap().contains("sorry"));
    }

    #[test]
    fn missing_personal_info_is_rejected() {
        let err = parse_reply(r#"{"summary": "x", "skills": []}"#).unwrap_err();
        assert!(matches!(err, PipelineError::MissingPersonalInfo { .. }));

        let err = parse_reply(r#"{"personalInfo": null}"#).unwrap_err();
        assert!(matches!(err, PipelineError::MissingPersonalInfo { .. }));
    }

    #[test]
    fn json_array_is_not_an_object() {
        let err = parse_reply("[1, 2]").unwrap_err();
        assert!(matches!(err, PipelineError::MalformedReply { .. }));
    }

    #[tokio::test]
    async fn model_failure_is_surfaced_as_invocation_error() {
        let (extractor, _) = extractor(Err(PortError::Unauthorized));
        let err = extractor.extract("text").await.unwrap_err();
        assert!(matches!(err, PipelineError::ModelInvocation(PortError::Unauthorized)));
    }

    #[tokio::test]
    async fn empty_reply_is_rejected() {
        let (extractor, _) = extractor(Ok("   ".into()));
        assert!(matches!(
            extractor.extract("text").await,
            Err(PipelineError::EmptyReply)
        ));
    }

    #[tokio::test]
    async fn repeated_extraction_gives_the_same_deduplicated_record() {
        let reply = r#"{
          "personalInfo": {"name": "Ana"},
          "experience": [
            {"company": "Initech", "position": "Analyst", "startDate": "2017", "endDate": "2019"},
            {"company": "INITECH", "position": "Analyst ", "startDate": "2017", "endDate": "2019"}
          ],
          "education": [
            {"institution": "UNAM", "degree": "BSc", "startDate": "2012", "endDate": "2016"},
            {"institution": "unam", "degree": "BSc", "startDate": "2012", "endDate": "2016"}
          ]
        }"#;
        let (extractor, _) = extractor(Ok(reply.into()));
        let text = "Initech Analyst 2017-2019\n\n--- PAGE 2 ---\n\nInitech Analyst 2017-2019 UNAM BSc";

        let first = extractor.extract(text).await.unwrap();
        let second = extractor.extract(text).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.experience.len(), 1);
        assert_eq!(first.education.len(), 1);
        let undeduplicated: StructuredData = serde_json::from_str(reply).unwrap();
        assert_eq!(undeduplicated.experience.len(), 2);
        assert_eq!(first, undeduplicated.deduplicated());
        assert_eq!(first.clone().deduplicated(), first);
    }

    #[tokio::test]
    async fn request_carries_the_configured_budget() {
        let (extractor, model) = extractor(Ok(r#"{"personalInfo": {}}"#.into()));
        extractor.extract("some text").await.unwrap();
        let seen = model.seen.lock().unwrap().clone().unwrap();
        assert_eq!(seen.max_tokens, 4096);
    }
}
