//! Conversation Context
//!
//! Bounded per-channel conversation history behind an LRU channel map.
//! Touching a channel promotes it; exceeding the channel cap evicts the
//! least-recently-used channel's entire log. Own replies are truncated
//! before storage so long generations cannot bloat the context.

use std::collections::{HashMap, VecDeque};

/// Channels tracked at once; the least-recently-used one is evicted.
pub const MAX_CHANNELS: usize = 20;
/// Turns kept per channel (ten exchanges).
pub const MAX_TURNS: usize = 20;
/// Own replies are clipped to this many chars before storage.
pub const SELF_TURN_MAX_CHARS: usize = 200;

#[derive(Clone, Debug)]
pub struct Turn {
    pub speaker: String,
    pub text: String,
}

#[derive(Default)]
pub struct ChannelHistory {
    channels: HashMap<u64, Vec<Turn>>,
    order: VecDeque<u64>,
}

impl ChannelHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a turn to a channel's log, promoting it in the LRU.
    /// `from_self` marks the agent's own replies, which get truncated.
    pub fn record(&mut self, channel_id: u64, speaker: &str, text: &str, from_self: bool) {
        let text = if from_self && text.chars().count() > SELF_TURN_MAX_CHARS {
            let clipped: String = text.chars().take(SELF_TURN_MAX_CHARS).collect();
            format!("{clipped}...")
        } else {
            text.to_string()
        };

        self.touch(channel_id);
        let log = self.channels.entry(channel_id).or_default();
        log.push(Turn {
            speaker: speaker.to_string(),
            text,
        });
        if log.len() > MAX_TURNS {
            let excess = log.len() - MAX_TURNS;
            log.drain(..excess);
        }
    }

    /// Recent turns for a channel, oldest first. Promotes the channel.
    pub fn recent(&mut self, channel_id: u64) -> Vec<Turn> {
        self.touch(channel_id);
        self.channels.get(&channel_id).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self, channel_id: u64) {
        self.channels.remove(&channel_id);
        self.order.retain(|id| *id != channel_id);
    }

    pub fn clear_all(&mut self) -> usize {
        let count = self.channels.len();
        self.channels.clear();
        self.order.clear();
        count
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    fn touch(&mut self, channel_id: u64) {
        self.order.retain(|id| *id != channel_id);
        self.order.push_back(channel_id);
        while self.order.len() > MAX_CHANNELS {
            if let Some(evicted) = self.order.pop_front() {
                self.channels.remove(&evicted);
            }
        }
    }
}

/// Assemble the prompt for one reasoning cycle: persona, an optional
/// one-time reactivation notice, the channel's recent turns as
/// role-prefixed lines, and a continuation instruction.
pub fn build_context(persona: &str, reactivation_notice: bool, turns: &[Turn]) -> String {
    let mut out = String::new();
    out.push_str(persona.trim());
    out.push('\n');

    if reactivation_notice {
        out.push_str(
            "\nNote: you were just reactivated after a period offline. \
             Briefly acknowledge you are back before continuing.\n",
        );
    }

    if !turns.is_empty() {
        out.push_str("\nPrevious conversation:\n");
        for turn in turns {
            out.push_str(&format!("{}: {}\n", turn.speaker, turn.text));
        }
    }

    out.push_str("\nContinue the conversation naturally.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_cap_evicts_least_recently_used() {
        let mut history = ChannelHistory::new();
        for ch in 0..(MAX_CHANNELS as u64 + 5) {
            history.record(ch, "alice", "hi", false);
        }
        assert_eq!(history.channel_count(), MAX_CHANNELS);
        // The first five channels were the oldest.
        assert!(history.recent(0).is_empty());
        assert!(!history.recent(MAX_CHANNELS as u64 + 4).is_empty());
    }

    #[test]
    fn test_touch_promotes_channel_past_eviction() {
        let mut history = ChannelHistory::new();
        for ch in 0..MAX_CHANNELS as u64 {
            history.record(ch, "alice", "hi", false);
        }
        // Re-touch channel 0, then push one more channel: 1 gets evicted.
        history.record(0, "alice", "again", false);
        history.record(999, "alice", "new", false);
        assert_eq!(history.recent(0).len(), 2);
        assert!(history.recent(1).is_empty());
    }

    #[test]
    fn test_turn_cap_drops_oldest() {
        let mut history = ChannelHistory::new();
        for i in 0..(MAX_TURNS + 3) {
            history.record(7, "alice", &format!("msg {i}"), false);
        }
        let turns = history.recent(7);
        assert_eq!(turns.len(), MAX_TURNS);
        assert_eq!(turns[0].text, "msg 3");
    }

    #[test]
    fn test_self_turns_truncated() {
        let mut history = ChannelHistory::new();
        let long = "x".repeat(500);
        history.record(1, "bot", &long, true);
        history.record(1, "alice", &long, false);
        let turns = history.recent(1);
        assert_eq!(turns[0].text.chars().count(), SELF_TURN_MAX_CHARS + 3);
        assert_eq!(turns[1].text.chars().count(), 500);
    }

    #[test]
    fn test_build_context_shape() {
        let mut history = ChannelHistory::new();
        history.record(1, "alice", "hello there", false);
        history.record(1, "bot", "hi alice", true);
        let ctx = build_context("You are a helpful bot.", false, &history.recent(1));
        assert!(ctx.starts_with("You are a helpful bot."));
        assert!(ctx.contains("alice: hello there"));
        assert!(ctx.contains("bot: hi alice"));
        assert!(ctx.ends_with("Continue the conversation naturally."));
        assert!(!ctx.contains("reactivated"));
    }

    #[test]
    fn test_reactivation_notice_included_when_set() {
        let ctx = build_context("persona", true, &[]);
        assert!(ctx.contains("reactivated"));
    }

    #[test]
    fn test_clear_and_clear_all() {
        let mut history = ChannelHistory::new();
        history.record(1, "a", "x", false);
        history.record(2, "a", "y", false);
        history.clear(1);
        assert!(history.recent(1).is_empty());
        assert_eq!(history.clear_all(), 1);
        assert_eq!(history.channel_count(), 0);
    }
}
