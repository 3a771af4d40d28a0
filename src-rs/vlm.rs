//! Concrete multimodal backends for the instruction parser.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{ChatSettings, CodexSettings, ParserBackendKind, ParserSettings};
use crate::error::{GuideError, Result};
use crate::parser::{ParseRequest, VisionLanguageModel};
use crate::process::run_with_timeout;
use crate::util::truncate_text;

pub fn backend_from_settings(settings: &ParserSettings) -> Result<Box<dyn VisionLanguageModel>> {
    match settings.backend {
        ParserBackendKind::Chat => Ok(Box::new(ChatCompletionsBackend::new(&settings.chat)?)),
        ParserBackendKind::Codex => Ok(Box::new(CodexExecBackend::new(&settings.codex)?)),
    }
}

/// OpenAI-compatible `chat/completions` endpoint over blocking HTTPS.
pub struct ChatCompletionsBackend {
    agent: ureq::Agent,
    endpoint: String,
    model: String,
    api_key: String,
    max_tokens: u32,
}

impl ChatCompletionsBackend {
    pub fn new(settings: &ChatSettings) -> Result<Self> {
        let api_key = env::var(&settings.api_key_env)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                GuideError::config(format!(
                    "environment variable {} with the API key is not set",
                    settings.api_key_env
                ))
            })?;
        if settings.timeout_ms == 0 {
            return Err(GuideError::config("parser timeout must be > 0"));
        }
        let timeout = Duration::from_millis(settings.timeout_ms.max(100));
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .timeout_write(timeout)
            .user_agent(concat!("task-guide/", env!("CARGO_PKG_VERSION")))
            .build();
        Ok(Self {
            agent,
            endpoint: settings.endpoint.clone(),
            model: settings.model.clone(),
            api_key,
            max_tokens: settings.max_tokens,
        })
    }

    fn payload(&self, request: &ParseRequest) -> Result<Value> {
        Ok(json!({
            "model": self.model,
            "messages": chat_messages(request)?,
            "max_tokens": self.max_tokens,
        }))
    }
}

impl VisionLanguageModel for ChatCompletionsBackend {
    fn complete(&self, request: &ParseRequest) -> Result<String> {
        let payload = self.payload(request)?;
        debug!(endpoint = %self.endpoint, history = request.history.len(), "chat completion request");
        let response = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "application/json")
            .set("Authorization", &format!("Bearer {}", self.api_key))
            .set("Accept", "application/json")
            .send_json(payload)
            .map_err(backend_error_from_ureq)?;
        let body: Value = serde_json::from_reader(response.into_reader())?;
        body.pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| {
                GuideError::Backend(format!(
                    "response has no message content: {}",
                    truncate_text(&body.to_string(), 400)
                ))
            })
    }
}

/// System text, worked example, one user/assistant pair per history turn, then the
/// current instruction with the image attached at the requested detail.
pub fn chat_messages(request: &ParseRequest) -> Result<Vec<Value>> {
    let mut messages = vec![
        json!({
            "role": "system",
            "content": [{"type": "text", "text": request.system_text}],
        }),
        json!({
            "role": "assistant",
            "content": [{"type": "text", "text": request.example_text}],
        }),
    ];
    for turn in &request.history {
        messages.push(json!({
            "role": "user",
            "content": [{"type": "text", "text": ParseRequest::user_text(&turn.instruction)}],
        }));
        messages.push(json!({
            "role": "assistant",
            "content": [{"type": "text", "text": format!("JSON:\n{}", turn.result.to_json())}],
        }));
    }
    messages.push(json!({
        "role": "user",
        "content": [
            {"type": "text", "text": ParseRequest::user_text(&request.instruction)},
            {
                "type": "image_url",
                "image_url": {
                    "url": image_data_url(&request.image)?,
                    "detail": request.detail.as_str(),
                },
            },
        ],
    }));
    Ok(messages)
}

fn image_data_url(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|err| {
        GuideError::Backend(format!("failed to read image {}: {err}", path.display()))
    })?;
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    };
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

fn backend_error_from_ureq(err: ureq::Error) -> GuideError {
    match err {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            GuideError::Backend(format!(
                "http status {status}: {}",
                truncate_text(&body, 400)
            ))
        }
        ureq::Error::Transport(transport) => {
            GuideError::Backend(format!("transport error: {transport}"))
        }
    }
}

/// Runs `codex exec --image <frame> -` with the flattened prompt on stdin and reads the
/// final message back from `--output-last-message`.
pub struct CodexExecBackend {
    bin: String,
    model: Option<String>,
    timeout: Duration,
    scratch_dir: PathBuf,
}

impl CodexExecBackend {
    pub fn new(settings: &CodexSettings) -> Result<Self> {
        let bin = resolve_codex_executable(settings.bin.as_deref())
            .ok_or_else(|| GuideError::config("codex executable not found on PATH"))?;
        fs::create_dir_all(&settings.scratch_dir)?;
        Ok(Self {
            bin,
            model: settings.model.clone(),
            timeout: Duration::from_secs(settings.timeout_sec.max(10)),
            scratch_dir: settings.scratch_dir.clone(),
        })
    }
}

impl VisionLanguageModel for CodexExecBackend {
    fn complete(&self, request: &ParseRequest) -> Result<String> {
        let last_message = tempfile::Builder::new()
            .prefix("codex-last-")
            .suffix(".txt")
            .tempfile_in(&self.scratch_dir)?;

        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec")
            .arg("--output-last-message")
            .arg(last_message.path())
            .arg("--image")
            .arg(&request.image);
        if let Some(model) = &self.model {
            cmd.arg("--model").arg(model);
        }
        cmd.arg("-");

        let prompt = request.flatten();
        let output = run_with_timeout(&mut cmd, Some(prompt.as_bytes()), self.timeout)
            .map_err(|err| GuideError::Backend(err.to_string()))?;
        if !output.status.success() {
            return Err(GuideError::Backend(format!(
                "{} exec exited with {}: {}",
                self.bin,
                output.code(),
                truncate_text(&output.stderr, 2400)
            )));
        }

        let report = fs::read_to_string(last_message.path()).unwrap_or_default();
        info!(bin = %self.bin, bytes = report.len(), "codex exec finished");
        if report.trim().is_empty() {
            Ok(output.stdout)
        } else {
            Ok(report)
        }
    }
}

fn resolve_codex_executable(override_bin: Option<&str>) -> Option<String> {
    if let Some(bin) = override_bin {
        let trimmed = bin.trim();
        if !trimmed.is_empty() {
            return Some(trimmed.to_string());
        }
    }
    if command_exists("codex") {
        return Some("codex".to_string());
    }
    None
}

fn command_exists(name: &str) -> bool {
    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| dir.join(name).is_file()))
        .unwrap_or(false)
}
