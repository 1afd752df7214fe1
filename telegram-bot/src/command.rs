//! Command parsing for messages sent to the bot.
//!
//! Commands are single-line slash commands, optionally with a `@botname`
//! suffix (Telegram appends it in group chats) and whitespace-separated
//! arguments. Unknown commands are reported back to the sender rather than
//! silently ignored, so typos are discoverable.

use std::fmt;

/// A parsed bot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BotCommand {
    /// `/start`: greet a verified user in private chat.
    Start,
    /// `/help`: list available commands.
    Help,
    /// `/register <email>`: link the sender's chat to a staff account.
    Register { email: Option<String> },
    /// `/tasks`: list all assigned requests.
    Tasks,
    /// `/pending`, `/in_progress`, `/completed`: list by status.
    TasksWithStatus(TaskFilter),
    /// `/begin <id>`: move a request to in-progress.
    Begin { request_id: Option<i64> },
    /// `/done <id>`: mark a request completed.
    Done { request_id: Option<i64> },
    /// `/reopen <id>`: move an in-progress request back to pending.
    Reopen { request_id: Option<i64> },
    /// `/drop <id>`: cancel a request.
    Drop { request_id: Option<i64> },
}

/// Status filter for task listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFilter {
    Pending,
    InProgress,
    Completed,
}

/// Result of parsing a message for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseResult {
    /// The message is not a slash command (ordinary chatter).
    NoCommand,
    /// A slash command we don't recognise.
    Unrecognized { attempted: String },
    /// A valid command.
    Command(BotCommand),
}

impl fmt::Display for BotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotCommand::Start => write!(f, "start"),
            BotCommand::Help => write!(f, "help"),
            BotCommand::Register { .. } => write!(f, "register"),
            BotCommand::Tasks => write!(f, "tasks"),
            BotCommand::TasksWithStatus(TaskFilter::Pending) => write!(f, "pending"),
            BotCommand::TasksWithStatus(TaskFilter::InProgress) => write!(f, "in_progress"),
            BotCommand::TasksWithStatus(TaskFilter::Completed) => write!(f, "completed"),
            BotCommand::Begin { .. } => write!(f, "begin"),
            BotCommand::Done { .. } => write!(f, "done"),
            BotCommand::Reopen { .. } => write!(f, "reopen"),
            BotCommand::Drop { .. } => write!(f, "drop"),
        }
    }
}

/// Parse a message body for a bot command.
///
/// Only the first line is considered. A leading `/` marks a command; the
/// command name may carry a `@botname` suffix which is stripped before
/// matching. Extra arguments beyond those a command consumes are ignored for
/// forward compatibility.
pub fn parse_message(text: &str) -> ParseResult {
    let first_line = text.lines().next().unwrap_or("").trim();

    let Some(rest) = first_line.strip_prefix('/') else {
        return ParseResult::NoCommand;
    };

    let mut parts = rest.split_whitespace();
    let Some(raw_name) = parts.next() else {
        return ParseResult::NoCommand;
    };

    // In group chats Telegram sends "/tasks@labreq_bot".
    let name = raw_name
        .split_once('@')
        .map(|(name, _)| name)
        .unwrap_or(raw_name)
        .to_lowercase();

    let command = match name.as_str() {
        "start" => BotCommand::Start,
        "help" => BotCommand::Help,
        "register" => BotCommand::Register {
            email: parts.next().map(|s| s.to_string()),
        },
        "tasks" => BotCommand::Tasks,
        "pending" => BotCommand::TasksWithStatus(TaskFilter::Pending),
        "in_progress" => BotCommand::TasksWithStatus(TaskFilter::InProgress),
        "completed" => BotCommand::TasksWithStatus(TaskFilter::Completed),
        "begin" => BotCommand::Begin {
            request_id: parse_id_argument(parts.next()),
        },
        "done" => BotCommand::Done {
            request_id: parse_id_argument(parts.next()),
        },
        "reopen" => BotCommand::Reopen {
            request_id: parse_id_argument(parts.next()),
        },
        "drop" => BotCommand::Drop {
            request_id: parse_id_argument(parts.next()),
        },
        _ => {
            return ParseResult::Unrecognized {
                attempted: name.to_string(),
            }
        }
    };

    ParseResult::Command(command)
}

/// Parse a numeric request-id argument, accepting a leading '#'.
fn parse_id_argument(argument: Option<&str>) -> Option<i64> {
    let argument = argument?;
    argument.trim_start_matches('#').parse::<i64>().ok()
}
