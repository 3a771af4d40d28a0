//! Turns (instruction, image, history) into a validated object/action list by querying a
//! multimodal language model.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::actions::ActionVocabulary;
use crate::error::{GuideError, Result};
use crate::util::truncate_text;

/// Image detail hint forwarded to the language model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageDetail {
    Low,
    High,
}

impl ImageDetail {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

#[derive(Deserialize)]
struct RawParseResult {
    objects: Vec<String>,
    actions: Vec<String>,
}

/// Two equal-length, non-empty sequences: `objects[i]` is acted on with `actions[i]`.
///
/// The shape is enforced on every construction path, including deserialization, so a
/// value of this type never needs re-checking downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawParseResult")]
pub struct ParseResult {
    objects: Vec<String>,
    actions: Vec<String>,
}

impl TryFrom<RawParseResult> for ParseResult {
    type Error = String;

    fn try_from(raw: RawParseResult) -> std::result::Result<Self, Self::Error> {
        Self::new(raw.objects, raw.actions)
    }
}

impl ParseResult {
    pub fn new(objects: Vec<String>, actions: Vec<String>) -> std::result::Result<Self, String> {
        if objects.is_empty() {
            return Err("objects list is empty".to_string());
        }
        if objects.len() != actions.len() {
            return Err(format!(
                "objects ({}) and actions ({}) differ in length",
                objects.len(),
                actions.len()
            ));
        }
        let objects: Vec<String> = objects.into_iter().map(|o| o.trim().to_string()).collect();
        if objects.iter().any(String::is_empty) {
            return Err("object phrase is empty".to_string());
        }
        Ok(Self { objects, actions })
    }

    pub fn single(object: &str, action: &str) -> std::result::Result<Self, String> {
        Self::new(vec![object.to_string()], vec![action.to_string()])
    }

    pub fn objects(&self) -> &[String] {
        &self.objects
    }

    pub fn actions(&self) -> &[String] {
        &self.actions
    }

    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.objects
            .iter()
            .map(String::as_str)
            .zip(self.actions.iter().map(String::as_str))
    }

    pub fn first_object(&self) -> &str {
        &self.objects[0]
    }

    pub fn first_action(&self) -> &str {
        &self.actions[0]
    }

    pub fn last_pair(&self) -> (&str, &str) {
        let last = self.objects.len() - 1;
        (self.objects[last].as_str(), self.actions[last].as_str())
    }

    pub(crate) fn push(&mut self, object: String, action: String) {
        self.objects.push(object);
        self.actions.push(action);
    }

    /// Compact JSON, as replayed to the model for earlier instructions.
    pub fn to_json(&self) -> String {
        serde_json::json!({ "objects": self.objects, "actions": self.actions }).to_string()
    }
}

/// One earlier instruction and what it resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryTurn {
    pub instruction: String,
    pub result: ParseResult,
}

/// Everything a backend needs to issue one query.
#[derive(Debug, Clone)]
pub struct ParseRequest {
    pub system_text: String,
    pub example_text: String,
    pub history: Vec<HistoryTurn>,
    pub instruction: String,
    pub image: PathBuf,
    pub detail: ImageDetail,
}

impl ParseRequest {
    pub fn build(
        vocabulary: &ActionVocabulary,
        instruction: &str,
        image: &Path,
        history: Vec<HistoryTurn>,
        detail: ImageDetail,
    ) -> Self {
        Self {
            system_text: system_text(vocabulary),
            example_text: example_text(vocabulary),
            history,
            instruction: instruction.to_string(),
            image: image.to_path_buf(),
            detail,
        }
    }

    pub fn user_text(instruction: &str) -> String {
        format!("Instruction: {instruction}")
    }

    /// Single-document rendering for backends without a turn structure.
    pub fn flatten(&self) -> String {
        let mut lines = vec![self.system_text.clone(), String::new(), self.example_text.clone()];
        if !self.history.is_empty() {
            lines.push(String::new());
            lines.push("Earlier instructions and their answers:".to_string());
            for turn in &self.history {
                lines.push(Self::user_text(&turn.instruction));
                lines.push(format!("JSON:\n{}", turn.result.to_json()));
            }
        }
        lines.push(String::new());
        lines.push(format!(
            "The attached image shows the user's surroundings ({} detail).",
            self.detail.as_str()
        ));
        lines.push(Self::user_text(&self.instruction));
        lines.join("\n")
    }
}

fn system_text(vocabulary: &ActionVocabulary) -> String {
    let raw = format!(
        "You will be given an instruction that a user has to perform and an image of their surroundings. \
         Your output should be in JSON format with exactly two fields. \
         The field 'objects' is a list of objects (strings) that exist in the provided image and that the user \
         has to interact with to complete the instruction, in the order they are used. \
         Each object string is structured as '<object position> <object name>' and uses as few words as possible. \
         <object position> lets the user find the object without ambiguity: if there are several similar objects, \
         give its position relative to the others, and include its color if that helps. \
         The field 'actions' is a list with the same length as 'objects'; entry i is the action the user performs \
         on object i and must be exactly one of: {}. \
         Do not include any other JSON fields other than 'objects' and 'actions'.",
        vocabulary.prompt_list()
    );
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn example_text(vocabulary: &ActionVocabulary) -> String {
    let action = vocabulary
        .tokens()
        .first()
        .map(String::as_str)
        .unwrap_or("press");
    format!(
        "JSON:\n{{\n\"objects\": [\n\"top left blue switch\"\n],\n\"actions\": [\n\"{action}\"\n]\n}}"
    )
}

/// Substring from the first `{` to the last `}` inclusive.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(ParseResult),
    /// `output` is the raw reply, kept for error reporting.
    Malformed { reason: String, output: String },
}

pub fn parse_response(text: &str) -> ParseOutcome {
    let Some(json) = extract_json_object(text) else {
        return ParseOutcome::Malformed {
            reason: "response contains no JSON object".to_string(),
            output: text.to_string(),
        };
    };
    match serde_json::from_str::<ParseResult>(json) {
        Ok(result) => ParseOutcome::Parsed(result),
        Err(err) => ParseOutcome::Malformed {
            reason: err.to_string(),
            output: text.to_string(),
        },
    }
}

/// A multimodal model that answers a [`ParseRequest`] with free text.
pub trait VisionLanguageModel {
    fn complete(&self, request: &ParseRequest) -> Result<String>;
}

impl<M: VisionLanguageModel + ?Sized> VisionLanguageModel for Box<M> {
    fn complete(&self, request: &ParseRequest) -> Result<String> {
        (**self).complete(request)
    }
}

pub struct InstructionParser<M> {
    model: M,
    vocabulary: ActionVocabulary,
    max_attempts: u32,
}

impl<M: VisionLanguageModel> InstructionParser<M> {
    pub fn new(model: M, vocabulary: ActionVocabulary, max_attempts: u32) -> Self {
        Self {
            model,
            vocabulary,
            max_attempts: max_attempts.max(1),
        }
    }

    /// One query. Backend failures are errors; unusable replies are `Malformed`.
    pub fn parse(
        &self,
        instruction: &str,
        image: &Path,
        history: &[HistoryTurn],
        detail: ImageDetail,
    ) -> Result<ParseOutcome> {
        let request =
            ParseRequest::build(&self.vocabulary, instruction, image, history.to_vec(), detail);
        let raw = self.model.complete(&request)?;
        debug!(response = %truncate_text(&raw, 600), "language model response");
        Ok(parse_response(&raw))
    }

    /// Re-queries on `Malformed` up to the attempt budget.
    pub fn parse_with_retry(
        &self,
        instruction: &str,
        image: &Path,
        history: &[HistoryTurn],
        detail: ImageDetail,
    ) -> Result<ParseResult> {
        let mut last_output = String::new();
        for attempt in 1..=self.max_attempts {
            match self.parse(instruction, image, history, detail)? {
                ParseOutcome::Parsed(result) => {
                    info!(
                        attempt,
                        detail = detail.as_str(),
                        objects = ?result.objects(),
                        actions = ?result.actions(),
                        "parsed instruction"
                    );
                    return Ok(result);
                }
                ParseOutcome::Malformed { reason, output } => {
                    warn!(attempt, %reason, "malformed parser output");
                    last_output = output;
                }
            }
        }
        Err(GuideError::ParseFailure {
            attempts: self.max_attempts,
            last_output: truncate_text(&last_output, 2400),
        })
    }
}
