//! Action Block Grammar
//!
//! Recognizes `[ACTION:TYPE] body [/ACTION]` spans embedded in free-form
//! reasoning output and parses their `key: value` bodies. The same grammar
//! is used to sanitize inbound user text and alarm prompts, so injected
//! action blocks never reach execution.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

/// Maximum actions executed from a single reply (spam prevention).
pub const MAX_ACTIONS_PER_REPLY: usize = 2;

fn action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)\[ACTION:(\w+)\]\s*(.*?)\s*\[/ACTION\]").expect("action regex is valid")
    })
}

fn mention_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@(\w+)").expect("mention regex is valid"))
}

// ─── Action Types ────────────────────────────────────────────────

/// What an action does once its platform is resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    Post,
    Search,
    SetAlarm,
    CancelAlarm,
}

/// The fixed set of action codes the grammar accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionType {
    PostThreads,
    PostLinkedin,
    PostInstagram,
    PostX,
    SearchNews,
    SetAlarm,
    CancelAlarm,
}

impl ActionType {
    /// Resolve an action code (e.g. `POST_THREADS`) into its typed form.
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "POST_THREADS" => Some(Self::PostThreads),
            "POST_LINKEDIN" => Some(Self::PostLinkedin),
            "POST_INSTAGRAM" => Some(Self::PostInstagram),
            "POST_X" => Some(Self::PostX),
            "SEARCH_NEWS" => Some(Self::SearchNews),
            "SET_ALARM" => Some(Self::SetAlarm),
            "CANCEL_ALARM" => Some(Self::CancelAlarm),
            _ => None,
        }
    }

    pub fn platform(&self) -> &'static str {
        match self {
            Self::PostThreads => "threads",
            Self::PostLinkedin => "linkedin",
            Self::PostInstagram => "instagram",
            Self::PostX => "x",
            Self::SearchNews => "news",
            Self::SetAlarm | Self::CancelAlarm => "alarm",
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::PostThreads | Self::PostLinkedin | Self::PostInstagram | Self::PostX => {
                ActionKind::Post
            }
            Self::SearchNews => ActionKind::Search,
            Self::SetAlarm => ActionKind::SetAlarm,
            Self::CancelAlarm => ActionKind::CancelAlarm,
        }
    }

    /// Alarm actions are handled inline by the brain and carry their own
    /// body validation.
    pub fn is_alarm(&self) -> bool {
        matches!(self, Self::SetAlarm | Self::CancelAlarm)
    }
}

/// One extracted action block: the raw type code plus its body text.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionBlock {
    pub code: String,
    pub body: String,
}

// ─── Grammar Operations ──────────────────────────────────────────

/// Extract all action blocks from reasoning output, in order.
pub fn parse_actions(text: &str) -> Vec<ActionBlock> {
    action_re()
        .captures_iter(text)
        .map(|cap| ActionBlock {
            code: cap[1].to_string(),
            body: cap[2].trim().to_string(),
        })
        .collect()
}

/// Remove all action blocks from text, leaving the plain reply.
pub fn strip_actions(text: &str) -> String {
    action_re().replace_all(text, "").trim().to_string()
}

/// Parse `key: value` lines from an action body. Keys are lowercased;
/// lines without a colon are appended to the previous key's value, which
/// lets prompt fields span multiple lines.
pub fn parse_body(body: &str) -> HashMap<String, String> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut last_key: Option<String> = None;
    for line in body.trim().lines() {
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim().to_lowercase();
            fields.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        } else if let Some(ref key) = last_key {
            if let Some(existing) = fields.get_mut(key) {
                existing.push('\n');
                existing.push_str(line);
            }
        }
    }
    fields
}

/// Split an `image_url:` line out of a post body, returning
/// `(caption, image_url)`. Every other line belongs to the caption.
pub fn parse_image_body(body: &str) -> (String, String) {
    let mut image_url = String::new();
    let mut caption_lines: Vec<&str> = Vec::new();
    for line in body.trim().lines() {
        if line.trim().to_lowercase().starts_with("image_url:") {
            image_url = line
                .splitn(2, ':')
                .nth(1)
                .unwrap_or("")
                .trim()
                .to_string();
        } else {
            caption_lines.push(line);
        }
    }
    (caption_lines.join("\n").trim().to_string(), image_url)
}

/// Escape `@mentions` in echoed text so it cannot re-trigger other agents.
pub fn escape_mentions(text: &str) -> String {
    mention_re().replace_all(text, "`@$1`").to_string()
}
