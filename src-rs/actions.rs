//! Closed set of interaction verbs a resolved instruction may carry.

use serde::Serialize;

use crate::error::{GuideError, Result};

pub const DEFAULT_ACTIONS: [&str; 5] = ["press", "twist", "pull", "pick-up", "place"];
pub const DEFAULT_PICKUP: &str = "pick-up";
pub const DEFAULT_PLACE: &str = "place";

/// The permitted action tokens plus the pick-up/place pair whose members alternate
/// within one instruction entry.
///
/// Tokens are matched literally (no case folding or trimming) so that the parser output
/// has to use exactly the words offered in the system text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionVocabulary {
    tokens: Vec<String>,
    pickup_pair: Option<(String, String)>,
}

impl Default for ActionVocabulary {
    fn default() -> Self {
        Self {
            tokens: DEFAULT_ACTIONS.iter().map(ToString::to_string).collect(),
            pickup_pair: Some((DEFAULT_PICKUP.to_string(), DEFAULT_PLACE.to_string())),
        }
    }
}

impl ActionVocabulary {
    pub fn new(tokens: Vec<String>, pickup_pair: Option<(String, String)>) -> Result<Self> {
        let mut deduped: Vec<String> = Vec::with_capacity(tokens.len());
        for token in tokens {
            if token.trim().is_empty() {
                return Err(GuideError::config("action vocabulary contains an empty token"));
            }
            if !deduped.contains(&token) {
                deduped.push(token);
            }
        }
        if deduped.is_empty() {
            return Err(GuideError::config("action vocabulary must not be empty"));
        }
        if let Some((pick, place)) = &pickup_pair {
            if pick == place {
                return Err(GuideError::config(
                    "pick-up/place pair must name two different actions",
                ));
            }
            for member in [pick, place] {
                if !deduped.contains(member) {
                    return Err(GuideError::config(format!(
                        "pick-up/place pair member {member:?} is not in the action vocabulary"
                    )));
                }
            }
        }
        Ok(Self {
            tokens: deduped,
            pickup_pair,
        })
    }

    /// Parses a comma list such as `press, twist, pull`. Whitespace around items is
    /// dropped; the pair is kept only if both members survive.
    pub fn from_comma_list(raw: &str, pickup_pair: Option<(String, String)>) -> Result<Self> {
        let tokens: Vec<String> = raw
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
        let pair = pickup_pair.filter(|(a, b)| tokens.contains(a) && tokens.contains(b));
        Self::new(tokens, pair)
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn pickup_pair(&self) -> Option<(&str, &str)> {
        self.pickup_pair
            .as_ref()
            .map(|(a, b)| (a.as_str(), b.as_str()))
    }

    pub fn contains(&self, token: &str) -> bool {
        self.tokens.iter().any(|t| t == token)
    }

    /// First token of `actions` that falls outside the vocabulary.
    pub fn first_invalid<'a>(&self, actions: &'a [String]) -> Option<&'a str> {
        actions
            .iter()
            .map(String::as_str)
            .find(|a| !self.contains(a))
    }

    pub fn is_pickup_or_place(&self, token: &str) -> bool {
        match &self.pickup_pair {
            Some((pick, place)) => token == pick.as_str() || token == place.as_str(),
            None => false,
        }
    }

    /// The other member of the pick-up/place pair, if `token` is one of them.
    pub fn flip(&self, token: &str) -> Option<&str> {
        let (pick, place) = self.pickup_pair.as_ref()?;
        if token == pick.as_str() {
            Some(place.as_str())
        } else if token == place.as_str() {
            Some(pick.as_str())
        } else {
            None
        }
    }

    pub fn prompt_list(&self) -> String {
        self.tokens.join(", ")
    }
}
