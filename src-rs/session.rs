use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{GuideError, Result};

/// Per-session state handed to every store and resolver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    instructions: Vec<String>,
    pub update_mode: bool,
}

impl SessionContext {
    pub fn new(instructions: Vec<String>, update_mode: bool) -> Result<Self> {
        if instructions.iter().all(|i| i.trim().is_empty()) {
            return Err(GuideError::config("at least one instruction is required"));
        }
        Ok(Self {
            instructions,
            update_mode,
        })
    }

    pub fn load(path: &Path, update_mode: bool) -> Result<Self> {
        Self::new(load_instructions(path)?, update_mode)
    }

    pub fn instructions(&self) -> &[String] {
        &self.instructions
    }

    pub fn instruction(&self, ordinal: usize) -> Option<&str> {
        self.instructions.get(ordinal).map(String::as_str)
    }

    /// The instruction text for `ordinal`; blank lines cannot be resolved.
    pub fn require_instruction(&self, ordinal: usize) -> Result<&str> {
        let text = self.instruction(ordinal).ok_or(GuideError::UnknownOrdinal {
            ordinal,
            count: self.instructions.len(),
        })?;
        if text.trim().is_empty() {
            return Err(GuideError::config(format!(
                "instruction {ordinal} is a blank line"
            )));
        }
        Ok(text)
    }
}

/// One instruction per line, trimmed; the line index is the ordinal. Blank lines keep
/// their slot so ordinals always match line numbers.
pub fn load_instructions(path: &Path) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).map_err(|err| {
        GuideError::config(format!(
            "instruction file not readable: {}: {err}",
            path.display()
        ))
    })?;
    let instructions: Vec<String> = raw.lines().map(|l| l.trim().to_string()).collect();
    if instructions.iter().all(String::is_empty) {
        return Err(GuideError::config(format!(
            "need at least one instruction in {}",
            path.display()
        )));
    }
    info!(path = %path.display(), count = instructions.len(), "instructions loaded");
    Ok(instructions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_trimmed_lines_by_ordinal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instructions.txt");
        fs::write(&path, "  Pick up the cup \n\nPress the blue switch\n").unwrap();
        let ctx = SessionContext::load(&path, false).unwrap();
        assert_eq!(ctx.instructions().len(), 3);
        assert_eq!(ctx.instruction(0), Some("Pick up the cup"));
        assert_eq!(ctx.instruction(1), Some(""));
        assert_eq!(ctx.instruction(2), Some("Press the blue switch"));
        assert_eq!(ctx.require_instruction(2).unwrap(), "Press the blue switch");
        assert!(matches!(
            ctx.require_instruction(1),
            Err(GuideError::Configuration(_))
        ));
        assert!(matches!(
            ctx.require_instruction(3),
            Err(GuideError::UnknownOrdinal { ordinal: 3, count: 3 })
        ));
    }

    #[test]
    fn empty_or_missing_file_is_configuration_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("instructions.txt");
        fs::write(&path, "\n  \n").unwrap();
        assert!(matches!(
            load_instructions(&path),
            Err(GuideError::Configuration(_))
        ));
        assert!(matches!(
            load_instructions(&dir.path().join("missing.txt")),
            Err(GuideError::Configuration(_))
        ));
    }
}
