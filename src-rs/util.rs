use chrono::Utc;
use rand::Rng;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

pub fn abs_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(path)
}

pub fn truncate_text(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect::<String>() + "\n...<truncated>..."
}

pub fn timestamp_compact() -> String {
    Utc::now().format("%Y%m%d-%H%M%S").to_string()
}

pub fn timestamp_iso() -> String {
    Utc::now().to_rfc3339()
}

/// `<dir>/<label>-<timestamp>-<pid>-<rand>.<ext>`; unique enough for per-request
/// artifacts written within the same second.
pub fn artifact_path(dir: &Path, label: &str, ext: &str) -> PathBuf {
    let rand = rand::thread_rng().gen_range(1000..9999);
    dir.join(format!(
        "{}-{}-{}-{rand}.{ext}",
        slugify(label),
        timestamp_compact(),
        std::process::id()
    ))
}

pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() || matches!(lower, '.' | '_' | '-') {
            out.push(lower);
        } else if lower.is_ascii_whitespace() {
            out.push('-');
        }
    }
    if out.is_empty() {
        "artifact".to_string()
    } else {
        out
    }
}

pub fn round_to(v: f64, digits: u32) -> f64 {
    let factor = 10f64.powi(digits as i32);
    (v * factor).round() / factor
}
