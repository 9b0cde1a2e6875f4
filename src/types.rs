//! Claw - Type Definitions
//!
//! Shared types and port traits for the agent runtime core. The traits at
//! the bottom are the seams to external collaborators: the reasoning
//! capability, per-platform executors, and the notification transport.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

// ─── Inbound Messages ────────────────────────────────────────────

/// Transport-agnostic representation of an inbound message. The transport
/// adapter resolves mention detection and channel classification before
/// handing the message to the brain.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    pub content: String,
    pub channel_id: u64,
    pub author_name: String,
    pub author_id: u64,
    pub is_bot: bool,
    pub is_mention: bool,
    pub is_team_channel: bool,
    pub is_own_channel: bool,
}

// ─── Configuration ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    pub name: String,
    pub persona: String,
    pub aliases: Vec<String>,
    pub own_channel_id: u64,
    pub team_channel_ids: Vec<u64>,
    pub primary_team_channel_id: u64,
    pub model: String,
    pub require_manual_approval: bool,
    pub storage_dir: String,
    pub default_timezone: String,
    pub alarm_tick_secs: u64,
    pub reasoning_command: String,
    pub reasoning_timeout_secs: u64,
    pub usage_limits: UsageLimits,
    pub log_level: LogLevel,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Returns a default `AgentConfig`. Fields with no sensible default are
/// left empty so callers can override them.
pub fn default_config() -> AgentConfig {
    AgentConfig {
        name: String::new(),
        persona: String::new(),
        aliases: Vec::new(),
        own_channel_id: 0,
        team_channel_ids: Vec::new(),
        primary_team_channel_id: 0,
        model: "claude-sonnet-4-5".to_string(),
        require_manual_approval: true,
        storage_dir: "~/.claw".to_string(),
        default_timezone: "Asia/Seoul".to_string(),
        alarm_tick_secs: 60,
        reasoning_command: "claude".to_string(),
        reasoning_timeout_secs: 1200,
        usage_limits: UsageLimits::default(),
        log_level: LogLevel::Info,
        version: "0.1.0".to_string(),
    }
}

// ─── Rate Limiting ───────────────────────────────────────────────

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimits {
    pub max_calls_per_minute: u32,
    pub max_calls_per_hour: u32,
    pub max_calls_per_day: u32,
    pub min_call_interval_secs: u64,
    pub warning_threshold_pct: u32,
    pub paused: bool,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            max_calls_per_minute: 5,
            max_calls_per_hour: 20,
            max_calls_per_day: 500,
            min_call_interval_secs: 5,
            warning_threshold_pct: 80,
            paused: false,
        }
    }
}

/// Snapshot of current usage, for the status command.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStatus {
    pub calls_this_minute: u32,
    pub calls_this_hour: u32,
    pub calls_today: u32,
    pub limits: UsageLimits,
    pub total_calls_all_time: u64,
}

// ─── Schedules ───────────────────────────────────────────────────

/// Typed schedule variant. Tagged so a persisted entry round-trips without
/// loose optional fields: the kind determines exactly which fields exist.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ScheduleSpec {
    Daily { hour: u32, minute: u32 },
    Weekday { hour: u32, minute: u32 },
    Interval { interval_minutes: u32 },
    Once { interval_minutes: u32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleEntry {
    pub id: String,
    #[serde(flatten)]
    pub spec: ScheduleSpec,
    /// IANA time zone name, validated at creation.
    pub tz: String,
    pub prompt: String,
    pub channel_id: u64,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// Absolute fire instant, only for `Once`. Anchored at creation time
    /// and never re-anchored on load: a restart fires late rather than
    /// re-aligning to the clock.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fire_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

// ─── Approval Queue ──────────────────────────────────────────────

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Posted,
    Failed,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Post,
    Reply,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    pub platform: String,
    pub action: ApprovalAction,
    pub text: String,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub status: ApprovalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of `approve_and_execute` / `reject`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Executor Results ────────────────────────────────────────────

/// Unified result of a platform post/reply operation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchItem {
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub success: bool,
    pub items: Vec<SearchItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ─── Port Traits ─────────────────────────────────────────────────

/// The reasoning capability. Consumed, not implemented, by the core;
/// `CommandReasoning` in `crate::reasoning` provides a CLI-backed default.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn execute(
        &self,
        message: &str,
        system_prompt: Option<&str>,
        session_id: Option<&str>,
        model: Option<&str>,
    ) -> Result<String, AgentError>;
}

/// One external platform executor (a social network, a search backend).
#[async_trait]
pub trait PlatformClient: Send + Sync {
    fn is_configured(&self) -> bool {
        true
    }

    async fn post(
        &self,
        text: &str,
        meta: &HashMap<String, String>,
    ) -> Result<PostResult, AgentError>;

    async fn reply(&self, text: &str, target_id: &str) -> Result<PostResult, AgentError> {
        let _ = (text, target_id);
        Err(AgentError::external("reply not supported on this platform"))
    }

    async fn search(&self, query: &str) -> Result<SearchResult, AgentError> {
        let _ = query;
        Err(AgentError::external("search not supported on this platform"))
    }
}

/// Outbound message delivery to a channel.
#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn send(&self, channel_id: u64, text: &str) -> anyhow::Result<()>;

    async fn send_typing(&self, _channel_id: u64) -> anyhow::Result<()> {
        Ok(())
    }
}
