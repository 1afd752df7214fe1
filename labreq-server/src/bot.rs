//! The bot command surface: a long-poll dispatcher that lets staff link their
//! chat account, list their assignments, and update task status.
//!
//! Every status mutation routes through the lifecycle manager with the actor
//! resolved from the sender's chat id, so the bot obeys exactly the same
//! transition rules as the admin surface. Replies reuse the lifecycle error
//! vocabulary rendered as short human-readable text.

use std::sync::Arc;
use std::time::Duration;

use telegram_bot::command::{parse_message, BotCommand, ParseResult, TaskFilter};
use telegram_bot::update::Message;
use telegram_bot::TelegramClient;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::catalog::categorize_selected_tests;
use crate::lifecycle::error::LifecycleError;
use crate::lifecycle::manager::Actor;
use crate::lifecycle::state::RequestStatus;
use crate::model::{ChatId, Request, RequestId, TestCategory, User};
use crate::relay::Backoff;
use crate::store::LinkOutcome;
use crate::AppState;

const HELP_TEXT: &str = "Lab Request Assistant\n\n\
Available commands:\n\
/start - begin interacting with the bot\n\
/help - show this message\n\
/tasks - list all your assigned requests\n\
/pending - list your pending requests\n\
/in_progress - list your in-progress requests\n\
/completed - list your completed requests\n\
/begin <id> - start working on a request\n\
/done <id> - mark a request completed\n\
/reopen <id> - move a request back to pending\n\
/drop <id> - cancel a request\n\n\
If something doesn't work, contact the admin.";

/// Run the long-poll dispatcher until shutdown is signalled.
pub async fn dispatch_loop(
    state: Arc<AppState>,
    client: Arc<TelegramClient>,
    group_id: Option<i64>,
    poll_timeout_secs: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("Bot dispatcher polling for updates");
    let mut offset = 0i64;
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

    loop {
        let updates = tokio::select! {
            result = client.get_updates(offset, poll_timeout_secs) => result,
            _ = shutdown.changed() => {
                info!("Bot dispatcher shutting down");
                return;
            }
        };

        let updates = match updates {
            Ok(updates) => {
                backoff.reset();
                updates
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!("getUpdates failed: {}; retrying in {:?}", e, delay);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = shutdown.changed() => {
                        info!("Bot dispatcher shutting down");
                        return;
                    }
                }
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);

            let Some(message) = update.message else {
                continue;
            };
            let chat_id = message.chat.id;

            if let Some(reply) = handle_message(&state, group_id, &message).await {
                if let Err(e) = client.send_message(chat_id, &reply).await {
                    error!("Failed to reply to chat {}: {}", chat_id, e);
                }
            }
        }
    }
}

/// Handle one incoming message, returning the reply text if one is due.
///
/// Group chats only react to /register; private chats carry the rest. A
/// malformed or irrelevant message yields no reply at all.
pub async fn handle_message(
    state: &AppState,
    group_id: Option<i64>,
    message: &Message,
) -> Option<String> {
    let text = message.text.as_deref()?;

    let command = match parse_message(text) {
        ParseResult::NoCommand => return None,
        ParseResult::Unrecognized { attempted } => {
            if !message.chat.is_private() {
                return None;
            }
            return Some(format!(
                "Unknown command /{}. Type /help for the list of commands.",
                attempted
            ));
        }
        ParseResult::Command(command) => command,
    };

    if let BotCommand::Register { email } = &command {
        return Some(handle_register(state, group_id, message, email.as_deref()).await);
    }

    // Everything else is private-chat only; group noise is ignored.
    if !message.chat.is_private() {
        return None;
    }

    let sender = ChatId(message.chat.id);
    match command {
        BotCommand::Start => Some(handle_start(state, message, sender).await),
        BotCommand::Help => Some(HELP_TEXT.to_string()),
        BotCommand::Tasks => Some(handle_task_list(state, sender, None).await),
        BotCommand::TasksWithStatus(filter) => {
            Some(handle_task_list(state, sender, Some(filter_status(filter))).await)
        }
        BotCommand::Begin { request_id } => {
            Some(handle_transition(state, sender, request_id, RequestStatus::InProgress, "begin").await)
        }
        BotCommand::Done { request_id } => {
            Some(handle_transition(state, sender, request_id, RequestStatus::Completed, "done").await)
        }
        BotCommand::Reopen { request_id } => {
            Some(handle_transition(state, sender, request_id, RequestStatus::Pending, "reopen").await)
        }
        BotCommand::Drop { request_id } => {
            Some(handle_transition(state, sender, request_id, RequestStatus::Cancelled, "drop").await)
        }
        BotCommand::Register { .. } => unreachable!("handled above"),
    }
}

fn filter_status(filter: TaskFilter) -> RequestStatus {
    match filter {
        TaskFilter::Pending => RequestStatus::Pending,
        TaskFilter::InProgress => RequestStatus::InProgress,
        TaskFilter::Completed => RequestStatus::Completed,
    }
}

/// Link the sender's chat id to the staff account with the given email.
///
/// The exclusivity cases mirror real account-takeover attempts: an email
/// already bound to a different chat is refused, and a chat already bound to
/// a different account is refused.
async fn handle_register(
    state: &AppState,
    group_id: Option<i64>,
    message: &Message,
    email: Option<&str>,
) -> String {
    if !message.chat.is_group() {
        return "Registration is only available from the staff group chat.".to_string();
    }
    if let Some(expected) = group_id {
        if message.chat.id != expected {
            return "Unauthorized! This is a private bot.".to_string();
        }
    }

    let Some(sender) = message.from.as_ref() else {
        return "Could not identify the sender of this message.".to_string();
    };
    let sender_chat = ChatId(sender.id);
    let sender_name = sender.first_name.as_str();

    let Some(email) = email else {
        return format!(
            "Hello {}, please provide your email to register: /register <email>",
            sender_name
        );
    };

    let user = match state.manager.repository().find_user_by_email(email).await {
        Ok(user) => user,
        Err(e) => {
            error!("Registration lookup failed for {}: {}", email, e);
            return "We experienced an error while registering your account. \
                    Please try again later or contact the admin."
                .to_string();
        }
    };

    let Some(user) = user else {
        return format!(
            "Hello {}, the email you entered does not exist in our system. \
             Please provide the correct email as follows: /register <email>",
            sender_name
        );
    };

    match user.chat_id {
        // Same user, possibly from a new device with the same account.
        Some(existing) if existing == sender_chat => format!(
            "Hello {}, you are already registered. \
             You can continue using the bot privately.",
            sender_name
        ),
        // A different chat owns this email: refuse the takeover.
        Some(_) => format!(
            "Hello {}, this email is already linked to another chat account. \
             If this wasn't you, contact the admin.",
            sender_name
        ),
        None => match state
            .manager
            .repository()
            .link_chat_id(&user.code, sender_chat)
            .await
        {
            Ok(LinkOutcome::Linked(_)) => format!(
                "Hello {}, your registration was successful. You can now message \
                 the bot privately to view and update your assignments.",
                sender_name
            ),
            Ok(LinkOutcome::ChatAlreadyClaimed) => format!(
                "Hello {}, you already have a registered account. \
                 If this wasn't you, contact the admin.",
                sender_name
            ),
            Ok(LinkOutcome::NotFound) => format!(
                "Hello {}, the email you entered does not exist in our system.",
                sender_name
            ),
            Err(e) => {
                error!("Registration failed for {}: {}", email, e);
                "We experienced an error while registering your account. \
                 Please try again later or contact the admin."
                    .to_string()
            }
        },
    }
}

async fn handle_start(state: &AppState, message: &Message, sender: ChatId) -> String {
    let Some(user) = resolve_sender(state, sender).await else {
        return "Unauthorized! You must be registered in our system. \
                Use /register <email> in the staff group chat."
            .to_string();
    };

    let name = message
        .from
        .as_ref()
        .map(|u| u.first_name.as_str())
        .unwrap_or(user.name.as_str());

    format!(
        "Hello {}!\n\nYour account is verified.\n\n\
         I can help you view your current assignments, submit status updates, \
         and receive notifications for new tasks.\n\n\
         Type /help for the full list of commands.",
        name
    )
}

async fn handle_task_list(
    state: &AppState,
    sender: ChatId,
    status: Option<RequestStatus>,
) -> String {
    let Some(user) = resolve_sender(state, sender).await else {
        return "Unauthorized! You must be registered in our system.".to_string();
    };

    let requests = match state.manager.list_assigned(&user.code, status).await {
        Ok(requests) => requests,
        Err(e) => {
            error!("Task listing failed for {}: {}", user.code, e);
            return "Error fetching your assigned tasks. \
                    Please try again later or contact the admin."
                .to_string();
        }
    };

    if requests.is_empty() {
        return "You don't have any tasks.".to_string();
    }

    let catalog = state
        .manager
        .repository()
        .list_test_catalog()
        .await
        .unwrap_or_default();

    let mut reply = String::new();
    for (i, request) in requests.iter().enumerate() {
        if i > 0 {
            reply.push_str("\n\n");
        }
        reply.push_str(&render_task(request, &catalog));
    }
    reply
}

/// One task entry: summary lines plus selected tests grouped by category.
fn render_task(request: &Request, catalog: &[TestCategory]) -> String {
    let mut text = format!(
        "Task #{}\n\
         Patient: {}\n\
         Location: {}\n\
         Priority: {}\n\
         Collection: {} at {}\n\
         Status: {}",
        request.id,
        request.patient_name(),
        request.location,
        request.priority,
        request.collection_date.format("%b %d, %Y"),
        request.collection_time.format("%I:%M %p"),
        request.status,
    );

    let grouped = categorize_selected_tests(&request.selected_tests, catalog);
    if !grouped.is_empty() {
        text.push_str("\nTests:");
        for (category, tests) in grouped {
            text.push_str(&format!("\n  {}:", category));
            for test in tests {
                text.push_str(&format!("\n    - {}", test));
            }
        }
    }

    text
}

async fn handle_transition(
    state: &AppState,
    sender: ChatId,
    request_id: Option<i64>,
    target: RequestStatus,
    command_name: &str,
) -> String {
    let Some(user) = resolve_sender(state, sender).await else {
        return "Unauthorized! You must be registered in our system.".to_string();
    };

    let Some(request_id) = request_id else {
        return format!("Usage: /{} <task id>", command_name);
    };
    let request_id = RequestId(request_id);

    let actor = Actor::from_user(&user);
    match state
        .manager
        .transition_status(request_id, &actor, target)
        .await
    {
        Ok(request) => format!("Task {} status updated to {}.", request.id, request.status),
        Err(e) => render_lifecycle_error(request_id, &e),
    }
}

/// Render a lifecycle refusal as a short reply, reusing the error vocabulary.
fn render_lifecycle_error(request_id: RequestId, error: &LifecycleError) -> String {
    match error {
        LifecycleError::NotFound => format!("Task {} not found.", request_id),
        LifecycleError::Unauthorized => {
            "You can only update tasks assigned to you.".to_string()
        }
        LifecycleError::InvalidTransition { from, to } => {
            format!("Task {} cannot move from {} to {}.", request_id, from, to)
        }
        LifecycleError::Immutable => {
            format!("Task {} is closed and can no longer change.", request_id)
        }
        LifecycleError::ValidationFailed(_)
        | LifecycleError::InvalidAssignee
        | LifecycleError::Store(_) => {
            "Something went wrong. Please try again later or contact the admin.".to_string()
        }
    }
}

/// Resolve the sender to a live staff account.
async fn resolve_sender(state: &AppState, sender: ChatId) -> Option<User> {
    match state.manager.repository().find_user_by_chat(sender).await {
        Ok(Some(user)) if user.can_receive_assignments() => Some(user),
        Ok(_) => None,
        Err(e) => {
            error!("Sender lookup failed for chat {}: {}", sender, e);
            None
        }
    }
}
