//! Persistent instruction store: instruction ordinal -> resolved objects/actions.
//!
//! The whole document is rewritten on every successful commit. The persistence
//! medium sits behind [`EntryBackend`] so the commit rules can run against memory.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::actions::ActionVocabulary;
use crate::error::{GuideError, Result};
use crate::parser::{HistoryTurn, ParseResult};
use crate::session::SessionContext;
use crate::util::ensure_parent_dir;

pub type Entries = BTreeMap<usize, ParseResult>;

pub trait EntryBackend {
    fn load(&self) -> Result<Entries>;
    fn persist(&mut self, entries: &Entries) -> Result<()>;
}

/// JSON document keyed by the ordinal as a string:
/// `{"0": {"objects": [...], "actions": [...]}}`.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EntryBackend for JsonFileBackend {
    fn load(&self) -> Result<Entries> {
        if !self.path.exists() {
            return Ok(Entries::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(Entries::new());
        }
        let document: BTreeMap<String, ParseResult> = serde_json::from_str(&raw).map_err(|err| {
            GuideError::Store(format!("invalid store document {}: {err}", self.path.display()))
        })?;
        document
            .into_iter()
            .map(|(key, entry)| {
                key.trim()
                    .parse::<usize>()
                    .map(|ordinal| (ordinal, entry))
                    .map_err(|_| GuideError::Store(format!("non-numeric store key {key:?}")))
            })
            .collect()
    }

    /// Writes to a sibling temp file and renames it over the target, so readers never
    /// observe a half-written document.
    fn persist(&mut self, entries: &Entries) -> Result<()> {
        ensure_parent_dir(&self.path)?;
        let document: BTreeMap<String, &ParseResult> = entries
            .iter()
            .map(|(ordinal, entry)| (ordinal.to_string(), entry))
            .collect();
        let raw = serde_json::to_string_pretty(&document)?;
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(raw.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&self.path)
            .map_err(|err| GuideError::Store(format!("failed to replace store: {err}")))?;
        debug!(path = %self.path.display(), entries = entries.len(), "store persisted");
        Ok(())
    }
}

/// In-memory backend; counts persists so callers can assert on write behavior.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    entries: Entries,
    persist_count: usize,
}

impl MemoryBackend {
    pub fn with_entries(entries: Entries) -> Self {
        Self {
            entries,
            persist_count: 0,
        }
    }

    pub fn persisted(&self) -> &Entries {
        &self.entries
    }

    pub fn persist_count(&self) -> usize {
        self.persist_count
    }
}

impl EntryBackend for MemoryBackend {
    fn load(&self) -> Result<Entries> {
        Ok(self.entries.clone())
    }

    fn persist(&mut self, entries: &Entries) -> Result<()> {
        self.entries = entries.clone();
        self.persist_count += 1;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CommitOutcome {
    /// The last object/action written for the ordinal, ready for localization.
    Accepted { object: String, action: String },
    Rejected { token: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommitMode {
    Create,
    Replace,
    Append,
}

pub struct InstructionStore<B> {
    backend: B,
    entries: Entries,
    updated: BTreeSet<usize>,
    vocabulary: ActionVocabulary,
}

impl<B: EntryBackend> InstructionStore<B> {
    pub fn open(backend: B, vocabulary: ActionVocabulary) -> Result<Self> {
        let entries = backend.load()?;
        info!(entries = entries.len(), "instruction store opened");
        Ok(Self {
            backend,
            entries,
            updated: BTreeSet::new(),
            vocabulary,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn entry(&self, ordinal: usize) -> Option<&ParseResult> {
        self.entries.get(&ordinal)
    }

    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn is_updated(&self, ordinal: usize) -> bool {
        self.updated.contains(&ordinal)
    }

    /// Whether a commit for `ordinal` would overwrite the existing entry wholesale.
    pub fn pending_replace(&self, ordinal: usize, session: &SessionContext) -> bool {
        session.update_mode
            && self.entries.contains_key(&ordinal)
            && !self.updated.contains(&ordinal)
    }

    /// Validates `result` and writes it for `ordinal`.
    ///
    /// New ordinals are created, a first commit under update mode replaces the entry
    /// (once per ordinal per session), anything else is appended with the
    /// pick-up/place alternation applied. A rejected commit leaves memory and the
    /// backend untouched.
    pub fn commit(
        &mut self,
        result: &ParseResult,
        ordinal: usize,
        session: &SessionContext,
    ) -> Result<CommitOutcome> {
        if let Some(token) = self.vocabulary.first_invalid(result.actions()) {
            warn!(ordinal, token, "rejecting commit with unknown action");
            return Ok(CommitOutcome::Rejected {
                token: token.to_string(),
            });
        }

        let mode = if !self.entries.contains_key(&ordinal) {
            CommitMode::Create
        } else if self.pending_replace(ordinal, session) {
            CommitMode::Replace
        } else {
            CommitMode::Append
        };

        let mut next = self.entries.clone();
        let (object, action) = match mode {
            CommitMode::Create | CommitMode::Replace => {
                next.insert(ordinal, result.clone());
                let (object, action) = result.last_pair();
                (object.to_string(), action.to_string())
            }
            CommitMode::Append => {
                let entry = next
                    .get_mut(&ordinal)
                    .ok_or_else(|| GuideError::Store(format!("entry {ordinal} vanished")))?;
                let first_action = entry.first_action().to_string();
                let mut last = None;
                for (object, action) in result.pairs() {
                    let action = self.alternate(&first_action, action);
                    entry.push(object.to_string(), action.clone());
                    last = Some((object.to_string(), action));
                }
                last.ok_or_else(|| GuideError::Store("empty parse result".to_string()))?
            }
        };

        self.backend.persist(&next)?;
        self.entries = next;
        if mode == CommitMode::Replace {
            self.updated.insert(ordinal);
        }
        info!(ordinal, ?mode, %object, %action, "commit accepted");
        Ok(CommitOutcome::Accepted { object, action })
    }

    /// Two identical pick-up (or place) actions in one entry become pick-up then place.
    fn alternate(&self, first_action: &str, action: &str) -> String {
        if action == first_action && self.vocabulary.is_pickup_or_place(action) {
            if let Some(flipped) = self.vocabulary.flip(action) {
                return flipped.to_string();
            }
        }
        action.to_string()
    }

    /// Earlier instructions (and their entries) replayed as parser context.
    ///
    /// Ordinals before `ordinal` are included in order. The current ordinal's own
    /// entry is included when the commit would append to it, so the model sees what
    /// was already decided for this step; it is left out when it is about to be
    /// replaced.
    pub fn history(&self, session: &SessionContext, ordinal: usize) -> Vec<HistoryTurn> {
        let include_current = !self.pending_replace(ordinal, session);
        self.entries
            .range(..=ordinal)
            .filter(|(o, _)| **o < ordinal || include_current)
            .filter_map(|(o, entry)| {
                session.instruction(*o).map(|text| HistoryTurn {
                    instruction: text.to_string(),
                    result: entry.clone(),
                })
            })
            .collect()
    }

    /// Clears every entry and the update tracking, persisting the empty document.
    pub fn reset(&mut self) -> Result<()> {
        let empty = Entries::new();
        self.backend.persist(&empty)?;
        self.entries = empty;
        self.updated.clear();
        info!("instruction store reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn session(update_mode: bool) -> SessionContext {
        SessionContext::new(
            vec![
                "Pick up the cup".to_string(),
                "Press the blue switch".to_string(),
                "Twist the dial".to_string(),
            ],
            update_mode,
        )
        .unwrap()
    }

    fn memory_store() -> InstructionStore<MemoryBackend> {
        InstructionStore::open(MemoryBackend::default(), ActionVocabulary::default()).unwrap()
    }

    fn result(object: &str, action: &str) -> ParseResult {
        ParseResult::single(object, action).unwrap()
    }

    #[test]
    fn invalid_action_on_new_ordinal_is_rejected_without_writes() {
        let mut store = memory_store();
        let outcome = store
            .commit(&result("green lever", "grab"), 0, &session(false))
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Rejected {
                token: "grab".to_string()
            }
        );
        assert!(store.entry(0).is_none());
        assert_eq!(store.backend().persist_count(), 0);
    }

    #[test]
    fn create_then_append_flips_repeated_pickup() {
        let mut store = memory_store();
        let ctx = session(false);
        store.commit(&result("red cup", "pick-up"), 0, &ctx).unwrap();
        let outcome = store
            .commit(&result("red cup", "pick-up"), 0, &ctx)
            .unwrap();
        assert_eq!(
            outcome,
            CommitOutcome::Accepted {
                object: "red cup".to_string(),
                action: "place".to_string()
            }
        );
        let entry = store.entry(0).unwrap();
        assert_eq!(entry.actions(), &["pick-up".to_string(), "place".to_string()]);
        assert_eq!(store.backend().persisted(), store.entries());
        assert_eq!(store.backend().persist_count(), 2);
    }

    #[test]
    fn append_keeps_non_pair_actions() {
        let mut store = memory_store();
        let ctx = session(false);
        store.commit(&result("red cup", "pick-up"), 0, &ctx).unwrap();
        store.commit(&result("top shelf", "place"), 0, &ctx).unwrap();
        store.commit(&result("lid", "press"), 0, &ctx).unwrap();
        let entry = store.entry(0).unwrap();
        assert_eq!(entry.actions(), &["pick-up", "place", "press"].map(String::from));
        assert_eq!(entry.objects().len(), 3);
    }

    #[test]
    fn append_rejects_whole_commit_on_invalid_token() {
        let mut store = memory_store();
        let ctx = session(false);
        store.commit(&result("knob", "twist"), 2, &ctx).unwrap();
        let mixed = ParseResult::new(
            vec!["knob".to_string(), "door".to_string()],
            vec!["twist".to_string(), "slam".to_string()],
        )
        .unwrap();
        let outcome = store.commit(&mixed, 2, &ctx).unwrap();
        assert!(matches!(outcome, CommitOutcome::Rejected { ref token } if token == "slam"));
        assert_eq!(store.entry(2).unwrap().objects().len(), 1);
        assert_eq!(store.backend().persist_count(), 1);
    }

    #[test]
    fn update_mode_replaces_only_once() {
        let mut store = memory_store();
        let ctx = session(true);
        store.commit(&result("left switch", "press"), 1, &ctx).unwrap();
        assert!(!store.is_updated(1));

        store.commit(&result("right switch", "press"), 1, &ctx).unwrap();
        assert!(store.is_updated(1));
        assert_eq!(store.entry(1).unwrap().objects(), &["right switch".to_string()]);

        store.commit(&result("middle switch", "press"), 1, &ctx).unwrap();
        assert_eq!(
            store.entry(1).unwrap().objects(),
            &["right switch".to_string(), "middle switch".to_string()]
        );
    }

    #[test]
    fn history_excludes_entry_about_to_be_replaced() {
        let mut store = memory_store();
        let plain = session(false);
        store.commit(&result("red cup", "pick-up"), 0, &plain).unwrap();
        store.commit(&result("blue switch", "press"), 1, &plain).unwrap();

        let turns = store.history(&plain, 1);
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].instruction, "Pick up the cup");
        assert_eq!(turns[1].result.first_object(), "blue switch");

        let updating = session(true);
        let turns = store.history(&updating, 1);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].instruction, "Pick up the cup");

        assert_eq!(store.history(&plain, 0).len(), 1);
        assert!(store.history(&updating, 0).is_empty());
    }

    #[test]
    fn reset_clears_entries_and_update_tracking() {
        let mut store = memory_store();
        let ctx = session(true);
        store.commit(&result("knob", "twist"), 2, &ctx).unwrap();
        store.commit(&result("knob", "twist"), 2, &ctx).unwrap();
        assert!(store.is_updated(2));
        store.reset().unwrap();
        assert!(store.entries().is_empty());
        assert!(!store.is_updated(2));
        assert!(store.backend().persisted().is_empty());
    }

    #[test]
    fn json_file_round_trips_with_string_keys() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("store.json");
        let ctx = session(false);
        {
            let mut store =
                InstructionStore::open(JsonFileBackend::new(&path), ActionVocabulary::default())
                    .unwrap();
            store.commit(&result("blue switch", "press"), 1, &ctx).unwrap();
        }
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["1"]["objects"][0], "blue switch");
        assert_eq!(raw["1"]["actions"][0], "press");

        let reopened =
            InstructionStore::open(JsonFileBackend::new(&path), ActionVocabulary::default())
                .unwrap();
        assert_eq!(reopened.entry(1).unwrap().first_action(), "press");
    }

    #[test]
    fn empty_file_is_an_empty_store() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "").unwrap();
        assert!(JsonFileBackend::new(&path).load().unwrap().is_empty());
        fs::write(&path, "{}").unwrap();
        assert!(JsonFileBackend::new(&path).load().unwrap().is_empty());
    }

    #[test]
    fn malformed_file_entries_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, r#"{"0": {"objects": ["a", "b"], "actions": ["press"]}}"#).unwrap();
        assert!(matches!(
            JsonFileBackend::new(&path).load(),
            Err(GuideError::Store(_))
        ));
        fs::write(&path, r#"{"first": {"objects": ["a"], "actions": ["press"]}}"#).unwrap();
        assert!(matches!(
            JsonFileBackend::new(&path).load(),
            Err(GuideError::Store(_))
        ));
    }
}
