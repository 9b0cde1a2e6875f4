//! Local Commands
//!
//! Bang-prefixed commands recognized in raw message text. All of them are
//! handled locally and synchronously; none touch the approval queue.

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// Cancel the in-flight reasoning task for this channel.
    Cancel,
    /// Clear this channel's conversation history, or all channels.
    Clear { all: bool },
    ListAlarms,
    CancelAlarm { id: String },
    CancelAllAlarms,
    Help,
}

/// Parse a command from raw message text. Returns `None` for anything
/// that is not a recognized command, including unknown `!` prefixes.
pub fn parse_command(text: &str) -> Option<Command> {
    let text = text.trim();
    if !text.starts_with('!') {
        return None;
    }
    let mut words = text.split_whitespace();
    let head = words.next()?.to_lowercase();
    match head.as_str() {
        "!cancel" => Some(Command::Cancel),
        "!clear" => Some(Command::Clear {
            all: words.next().is_some_and(|w| w.eq_ignore_ascii_case("all")),
        }),
        "!help" => Some(Command::Help),
        "!alarms" => match words.next() {
            None => Some(Command::ListAlarms),
            Some(sub) if sub.eq_ignore_ascii_case("cancel") => match words.next() {
                Some(id) if id.eq_ignore_ascii_case("all") => Some(Command::CancelAllAlarms),
                Some(id) => Some(Command::CancelAlarm { id: id.to_string() }),
                None => None,
            },
            Some(_) => None,
        },
        _ => None,
    }
}

pub const HELP_TEXT: &str = "\
Commands:
  !cancel              cancel the in-flight task in this channel
  !clear [all]         clear conversation history (this channel, or all)
  !alarms              list scheduled alarms
  !alarms cancel <id>  cancel one alarm
  !alarms cancel all   cancel every alarm
  !help                show this message";
