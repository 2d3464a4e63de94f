//! Packet Holding Module
//!
//! Rule evaluation and the queue of withheld client packets.

pub mod queue;
pub mod rules;

pub use queue::{PendingPacket, PendingQueue};
pub use rules::{
    Direction, HoldingRule, HoldingRuleSet, ReleaseType, RuleEvaluation, RuleInfo, RuleOrigin,
    MAX_RULES,
};

use std::borrow::Cow;

/// Decode a payload as UTF-8, dropping invalid byte sequences
pub fn decode_permissive(payload: &[u8]) -> Cow<'_, str> {
    match std::str::from_utf8(payload) {
        Ok(text) => Cow::Borrowed(text),
        Err(_) => {
            let mut text = String::with_capacity(payload.len());
            for chunk in payload.utf8_chunks() {
                text.push_str(chunk.valid());
            }
            Cow::Owned(text)
        }
    }
}
