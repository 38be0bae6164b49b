//! Task prompts and structured output parsing.
//!
//! Each [`Task`] has a fixed system prompt and a builder for its user prompt.
//! Replies to structured tasks are parsed leniently: a missing or wrong-typed
//! field falls back to an empty or default value, while text that is not a
//! JSON object at all is a non-retryable [`ErrorKind::Parse`] failure.

use super::Task;
use crate::{Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Confidence assumed when a reply omits it.
pub const DEFAULT_CONFIDENCE: f64 = 0.5;

const SUMMARIZE_SYSTEM_PROMPT: &str = "You are a learning analytics assistant.
Summarize educational events concisely, extracting topics, skills, key points, and open questions.
Output JSON only.";

const CLASSIFY_SYSTEM_PROMPT: &str = "You are a topic classification assistant.
Analyze text and classify it into educational topics and skills.
Output JSON only.";

const UPDATE_SKILL_SYSTEM_PROMPT: &str = "You are a skill assessment assistant.
Evaluate evidence and update skill mastery estimates.
Output JSON only.";

const CHAT_SYSTEM_PROMPT: &str = "You are an AI tutor helping a student learn.
Provide clear, helpful explanations adapted to the student's level.
Reference past learning when relevant.";

/// Returns the system prompt for `task`.
#[must_use]
pub const fn system_prompt(task: Task) -> &'static str {
    match task {
        Task::Summarize => SUMMARIZE_SYSTEM_PROMPT,
        Task::Classify => CLASSIFY_SYSTEM_PROMPT,
        Task::UpdateSkill => UPDATE_SKILL_SYSTEM_PROMPT,
        Task::Chat => CHAT_SYSTEM_PROMPT,
    }
}

/// Builds the user prompt for summarizing `content`.
#[must_use]
pub fn build_summarize_prompt(content: &str, context: Option<&str>) -> String {
    let mut prompt = format!("Summarize the following educational event:\n\n{content}");
    if let Some(context) = context.filter(|c| !c.trim().is_empty()) {
        prompt.push_str("\n\nContext from previous sessions:\n");
        prompt.push_str(context);
    }
    prompt.push_str(
        "\n\nProvide a JSON response with: summary (string), topics (list), skills (list), \
         key_points (list), open_questions (list).",
    );
    prompt
}

/// Builds the user prompt for classifying `text`.
#[must_use]
pub fn build_classify_prompt(text: &str) -> String {
    format!(
        "Classify the following text into educational topics and skills:\n\n{text}\n\n\
         Provide a JSON response with: topics (list of strings), skills (list of strings), \
         confidence (float 0-1)."
    )
}

/// Builds the user prompt for assessing one skill.
#[must_use]
pub fn build_skill_update_prompt(skill_id: &str, current_mastery: f64, evidence: &str) -> String {
    format!(
        "Evaluate evidence for skill: {skill_id}\n\nCurrent mastery: {current_mastery:.2}\n\n\
         Evidence:\n{evidence}\n\n\
         Provide a JSON response with: mastery_delta (float), evidence_summary (string), \
         confidence (float 0-1)."
    )
}

/// Builds the user prompt for a chat turn.
#[must_use]
pub fn build_chat_prompt(message: &str, context: Option<&str>) -> String {
    match context.filter(|c| !c.trim().is_empty()) {
        Some(context) => {
            format!("Context from past learning:\n{context}\n\nStudent: {message}\n\nTutor:")
        },
        None => format!("Student: {message}\n\nTutor:"),
    }
}

/// Parsed reply to a summarize call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryOutput {
    /// Summary text.
    pub summary: String,
    /// Topics mentioned.
    pub topics: Vec<String>,
    /// Skills exercised.
    pub skills: Vec<String>,
    /// Key points.
    pub key_points: Vec<String>,
    /// Questions left open.
    pub open_questions: Vec<String>,
}

/// Parsed reply to a classify call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationOutput {
    /// Topics detected.
    pub topics: Vec<String>,
    /// Skills detected.
    pub skills: Vec<String>,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

/// Parsed reply to an update-skill call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillUpdateOutput {
    /// Signed change to mastery.
    pub mastery_delta: f64,
    /// Short justification.
    pub evidence_summary: String,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
}

impl SummaryOutput {
    /// Parses a model reply.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Parse`] error when no JSON object can be read.
    pub fn parse(response: &str) -> Result<Self> {
        let object = parse_object(response)?;
        Ok(Self {
            summary: string_field(&object, &["summary"]),
            topics: list_field(&object, "topics"),
            skills: list_field(&object, "skills"),
            key_points: list_field(&object, "key_points"),
            open_questions: list_field(&object, "open_questions"),
        })
    }
}

impl ClassificationOutput {
    /// Parses a model reply.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Parse`] error when no JSON object can be read.
    pub fn parse(response: &str) -> Result<Self> {
        let object = parse_object(response)?;
        Ok(Self {
            topics: list_field(&object, "topics"),
            skills: list_field(&object, "skills"),
            confidence: confidence_field(&object),
        })
    }
}

impl SkillUpdateOutput {
    /// Parses a model reply. Accepts `mastery_delta` or `p_mastery_delta`.
    ///
    /// # Errors
    ///
    /// Returns an [`ErrorKind::Parse`] error when no JSON object can be read.
    pub fn parse(response: &str) -> Result<Self> {
        let object = parse_object(response)?;
        Ok(Self {
            mastery_delta: number_field(&object, &["mastery_delta", "p_mastery_delta"])
                .unwrap_or(0.0),
            evidence_summary: string_field(&object, &["evidence_summary"]),
            confidence: confidence_field(&object),
        })
    }
}

/// Extracts the JSON payload from a reply, handling markdown code fences.
///
/// Looks for a fenced block first, then the outermost brace-delimited span.
#[must_use]
pub fn extract_json_from_response(response: &str) -> &str {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json") {
        let json_start = start + 7;
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if let Some(start) = trimmed.find("```") {
        let content_start = start + 3;
        let json_start = trimmed[content_start..]
            .find('{')
            .map_or(content_start, |pos| content_start + pos);
        if let Some(end) = trimmed[json_start..].find("```") {
            return trimmed[json_start..json_start + end].trim();
        }
    }

    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && start < end
    {
        return &trimmed[start..=end];
    }

    trimmed
}

fn parse_object(response: &str) -> Result<Map<String, Value>> {
    let json = extract_json_from_response(response);
    match serde_json::from_str::<Value>(json) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(Error::ai(
            ErrorKind::Parse,
            format!("expected a JSON object, got {}", value_kind(&other)),
        )),
        Err(e) => Err(Error::ai(
            ErrorKind::Parse,
            format!("invalid JSON in model reply: {e}"),
        )),
    }
}

const fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn string_field(object: &Map<String, Value>, keys: &[&str]) -> String {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_str))
        .unwrap_or_default()
        .to_string()
}

fn list_field(object: &Map<String, Value>, key: &str) -> Vec<String> {
    object
        .get(key)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn number_field(object: &Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter()
        .find_map(|key| object.get(*key).and_then(Value::as_f64))
        .filter(|n| n.is_finite())
}

fn confidence_field(object: &Map<String, Value>) -> f64 {
    number_field(object, &["confidence"])
        .unwrap_or(DEFAULT_CONFIDENCE)
        .clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompts_cover_every_task() {
        for task in Task::ALL {
            assert!(!system_prompt(task).is_empty());
        }
        assert!(system_prompt(Task::Summarize).contains("JSON"));
        assert!(!system_prompt(Task::Chat).contains("JSON"));
    }

    #[test]
    fn test_summarize_prompt_includes_context_only_when_present() {
        let with = build_summarize_prompt("limits", Some("earlier: slopes"));
        assert!(with.contains("Context from previous sessions:\nearlier: slopes"));

        let without = build_summarize_prompt("limits", Some("   "));
        assert!(!without.contains("Context from previous sessions"));
        assert!(without.ends_with("open_questions (list)."));
    }

    #[test]
    fn test_skill_prompt_formats_mastery() {
        let prompt = build_skill_update_prompt("chain_rule", 0.456, "solved 3 problems");
        assert!(prompt.contains("Current mastery: 0.46"));
        assert!(prompt.contains("Evidence:\nsolved 3 problems"));
    }

    #[test]
    fn test_chat_prompt_shapes() {
        assert_eq!(build_chat_prompt("hi", None), "Student: hi\n\nTutor:");
        assert_eq!(
            build_chat_prompt("hi", Some("ctx")),
            "Context from past learning:\nctx\n\nStudent: hi\n\nTutor:"
        );
    }

    #[test]
    fn test_extract_json_from_fences_and_prose() {
        assert_eq!(
            extract_json_from_response("```json\n{\"a\": 1}\n```"),
            "{\"a\": 1}"
        );
        assert_eq!(extract_json_from_response("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(
            extract_json_from_response("Sure! {\"a\": {\"b\": 2}} hope that helps"),
            "{\"a\": {\"b\": 2}}"
        );
        assert_eq!(extract_json_from_response("  plain  "), "plain");
    }

    #[test]
    fn test_summary_parse_defaults_missing_fields() {
        let output = SummaryOutput::parse(r#"{"summary": "Derivatives measure change"}"#).unwrap();
        assert_eq!(output.summary, "Derivatives measure change");
        assert!(output.topics.is_empty());
        assert!(output.open_questions.is_empty());
    }

    #[test]
    fn test_summary_parse_ignores_wrong_types() {
        let output = SummaryOutput::parse(
            r#"{"summary": 42, "topics": "calculus", "skills": ["limits", 7, " "]}"#,
        )
        .unwrap();
        assert_eq!(output.summary, "");
        assert!(output.topics.is_empty());
        assert_eq!(output.skills, vec!["limits".to_string()]);
    }

    #[test]
    fn test_classification_confidence_default_and_clamp() {
        let output = ClassificationOutput::parse(r#"{"topics": ["algebra"]}"#).unwrap();
        assert!((output.confidence - DEFAULT_CONFIDENCE).abs() < f64::EPSILON);

        let output = ClassificationOutput::parse(r#"{"confidence": 3.5}"#).unwrap();
        assert!((output.confidence - 1.0).abs() < f64::EPSILON);

        let output = ClassificationOutput::parse(r#"{"confidence": -1}"#).unwrap();
        assert!(output.confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_skill_update_accepts_both_delta_names() {
        let a = SkillUpdateOutput::parse(r#"{"mastery_delta": 0.2}"#).unwrap();
        let b = SkillUpdateOutput::parse(r#"{"p_mastery_delta": -0.1}"#).unwrap();
        assert!((a.mastery_delta - 0.2).abs() < f64::EPSILON);
        assert!((b.mastery_delta + 0.1).abs() < f64::EPSILON);

        let missing = SkillUpdateOutput::parse("{}").unwrap();
        assert!(missing.mastery_delta.abs() < f64::EPSILON);
    }

    #[test]
    fn test_malformed_payload_is_parse_error() {
        let err = SummaryOutput::parse("{not json").unwrap_err();
        assert_eq!(err.ai_kind(), Some(ErrorKind::Parse));
        assert!(!err.is_retryable());

        let err = SummaryOutput::parse("no braces at all").unwrap_err();
        assert_eq!(err.ai_kind(), Some(ErrorKind::Parse));

        let err = ClassificationOutput::parse("[1, 2]").unwrap_err();
        assert_eq!(err.ai_kind(), Some(ErrorKind::Parse));
    }
}
