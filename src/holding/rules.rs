//! Holding Rules
//!
//! Ordered rule slots pairing a hold trigger with a release trigger, plus the
//! flat keyword list whose matches are only ever released by a manual flush.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use super::decode_permissive;
use crate::error::{HolderError, HolderResult};

/// Upper bound on indexed rule slots
pub const MAX_RULES: usize = 64;

/// Which traffic direction may release packets held under a rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    /// Held packets wait for a manual flush
    #[default]
    None,
    /// Released by a matching server-to-client packet
    FromServer,
    /// Released by a matching client-to-server packet
    FromClient,
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseType::None => write!(f, "none"),
            ReleaseType::FromServer => write!(f, "from_server"),
            ReleaseType::FromClient => write!(f, "from_client"),
        }
    }
}

impl std::str::FromStr for ReleaseType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(ReleaseType::None),
            "from_server" | "server" => Ok(ReleaseType::FromServer),
            "from_client" | "client" => Ok(ReleaseType::FromClient),
            other => Err(format!(
                "unknown release type '{}' (expected none, from_server or from_client)",
                other
            )),
        }
    }
}

/// Direction a packet travels through the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    ClientToServer,
    ServerToClient,
}

impl Direction {
    /// Release type that a packet observed in this direction can trigger
    pub fn release_type(self) -> ReleaseType {
        match self {
            Direction::ClientToServer => ReleaseType::FromClient,
            Direction::ServerToClient => ReleaseType::FromServer,
        }
    }

    /// Short label used in packet log lines
    pub fn label(self) -> &'static str {
        match self {
            Direction::ClientToServer => "ToSVR",
            Direction::ServerToClient => "FromSVR",
        }
    }
}

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOrigin {
    /// One of the fixed, index-addressed slots
    Indexed,
    /// Appended through the keyword list
    Keyword,
}

/// A compiled holding rule
///
/// Rules are immutable once built. Reconfiguring a slot replaces the whole
/// `Arc`, so packets already queued keep the rule they were held under.
#[derive(Debug, Clone)]
pub struct HoldingRule {
    pub index: usize,
    pub origin: RuleOrigin,
    pub hold_keyword: String,
    pub release_type: ReleaseType,
    pub release_keyword: String,
    pub enabled: bool,
    hold_pattern: Option<Regex>,
    release_pattern: Option<Regex>,
}

impl HoldingRule {
    /// Compile a rule, rejecting invalid patterns
    pub fn new(
        index: usize,
        origin: RuleOrigin,
        hold_keyword: &str,
        release_type: ReleaseType,
        release_keyword: &str,
        enabled: bool,
    ) -> HolderResult<Self> {
        Ok(Self {
            index,
            origin,
            hold_keyword: hold_keyword.to_string(),
            release_type,
            release_keyword: release_keyword.to_string(),
            enabled,
            hold_pattern: Some(compile_pattern(hold_keyword)?),
            release_pattern: Some(compile_pattern(release_keyword)?),
        })
    }

    /// An empty, disabled slot that matches nothing
    pub fn disabled(index: usize) -> Self {
        Self {
            index,
            origin: RuleOrigin::Indexed,
            hold_keyword: String::new(),
            release_type: ReleaseType::None,
            release_keyword: String::new(),
            enabled: false,
            hold_pattern: None,
            release_pattern: None,
        }
    }

    /// Whether the decoded text contains a hold match
    pub fn matches_hold(&self, text: &str) -> bool {
        self.hold_pattern
            .as_ref()
            .is_some_and(|pattern| pattern.is_match(text))
    }

    /// Whether a packet seen in `direction` with this text releases the rule's packets
    pub fn matches_release(&self, direction: Direction, text: &str) -> bool {
        self.release_type != ReleaseType::None
            && self.release_type == direction.release_type()
            && self
                .release_pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(text))
    }

    /// Serializable view of this rule
    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            index: self.index,
            origin: self.origin,
            hold_keyword: self.hold_keyword.clone(),
            release_type: self.release_type,
            release_keyword: self.release_keyword.clone(),
            enabled: self.enabled,
        }
    }
}

impl fmt::Display for HoldingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rule#{} hold='{}' release={} release_keyword='{}' enabled={}",
            self.index, self.hold_keyword, self.release_type, self.release_keyword, self.enabled
        )
    }
}

fn compile_pattern(pattern: &str) -> HolderResult<Regex> {
    Regex::new(pattern).map_err(|source| HolderError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Rule view returned to operators
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RuleInfo {
    pub index: usize,
    pub origin: RuleOrigin,
    pub hold_keyword: String,
    pub release_type: ReleaseType,
    pub release_keyword: String,
    pub enabled: bool,
}

/// Outcome of evaluating one packet against the rule set
#[derive(Debug, Clone)]
pub enum RuleEvaluation {
    /// The packet must be withheld under this rule
    Hold(Arc<HoldingRule>),
    /// The packet satisfies this rule's release trigger
    ReleaseMatch(Arc<HoldingRule>),
    NoMatch,
}

/// Ordered collection of holding rules
#[derive(Debug, Clone)]
pub struct HoldingRuleSet {
    slots: Vec<Arc<HoldingRule>>,
    keywords: Vec<Arc<HoldingRule>>,
    keyword_holding: bool,
}

impl Default for HoldingRuleSet {
    fn default() -> Self {
        Self::with_slots(1)
    }
}

impl HoldingRuleSet {
    /// Create a rule set with `slots` disabled indexed rules
    pub fn with_slots(slots: usize) -> Self {
        let slots = slots.clamp(1, MAX_RULES);
        Self {
            slots: (0..slots).map(|i| Arc::new(HoldingRule::disabled(i))).collect(),
            keywords: Vec::new(),
            keyword_holding: true,
        }
    }

    /// Number of indexed slots
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Replace the rule in slot `index`
    pub fn configure_rule(
        &mut self,
        index: usize,
        hold_keyword: &str,
        release_type: ReleaseType,
        release_keyword: &str,
        enabled: bool,
    ) -> HolderResult<()> {
        if index >= self.slots.len() {
            warn!("Invalid rule index: {}", index);
            return Err(HolderError::InvalidRuleIndex {
                index,
                slots: self.slots.len(),
            });
        }

        let rule = HoldingRule::new(
            index,
            RuleOrigin::Indexed,
            hold_keyword,
            release_type,
            release_keyword,
            enabled,
        )?;
        debug!("Configured {}", rule);
        self.slots[index] = Arc::new(rule);
        Ok(())
    }

    /// Append a keyword whose matches are held until a manual flush
    pub fn register_keyword(&mut self, keyword: &str) -> HolderResult<()> {
        let index = self.slots.len() + self.keywords.len();
        let rule = HoldingRule::new(
            index,
            RuleOrigin::Keyword,
            keyword,
            ReleaseType::None,
            "",
            true,
        )?;
        debug!("Registered keyword {}", rule);
        self.keywords.push(Arc::new(rule));
        Ok(())
    }

    /// Forget every registered keyword
    pub fn clear_keywords(&mut self) {
        self.keywords.clear();
    }

    /// Global switch for the keyword list
    pub fn set_keyword_holding(&mut self, enabled: bool) {
        self.keyword_holding = enabled;
    }

    pub fn keyword_holding(&self) -> bool {
        self.keyword_holding
    }

    /// Rules in evaluation order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<HoldingRule>> {
        let keywords: &[Arc<HoldingRule>] = if self.keyword_holding {
            &self.keywords
        } else {
            &[]
        };
        self.slots.iter().chain(keywords.iter())
    }

    /// Serializable snapshot of every rule, including inactive keywords
    pub fn infos(&self) -> Vec<RuleInfo> {
        self.slots
            .iter()
            .chain(self.keywords.iter())
            .map(|rule| rule.info())
            .collect()
    }

    /// First enabled rule whose hold pattern matches the text
    pub fn hold_rule_for(&self, text: &str) -> Option<Arc<HoldingRule>> {
        self.iter()
            .filter(|rule| rule.enabled)
            .find(|rule| rule.matches_hold(text))
            .cloned()
    }

    /// Evaluate a packet travelling in `direction`
    ///
    /// Client packets are checked for a hold match first; server packets are
    /// never held. Otherwise the first enabled rule whose release trigger
    /// matches is reported.
    pub fn evaluate(&self, direction: Direction, payload: &[u8]) -> RuleEvaluation {
        let text = decode_permissive(payload);

        if direction == Direction::ClientToServer {
            if let Some(rule) = self.hold_rule_for(&text) {
                return RuleEvaluation::Hold(rule);
            }
        }

        match self
            .iter()
            .filter(|rule| rule.enabled)
            .find(|rule| rule.matches_release(direction, &text))
        {
            Some(rule) => RuleEvaluation::ReleaseMatch(Arc::clone(rule)),
            None => RuleEvaluation::NoMatch,
        }
    }
}
