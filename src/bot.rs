// Telegram bot webhook: parses commands and button callbacks, runs the same
// lifecycle operations as the HTTP API, and answers with a Bot API method
// call in the webhook response body.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::api::{ApiJson, AppState};
use crate::challenge::{self, ChallengeStatus, SelfReport, Submission};
use crate::db::{Database, Profile, User};
use crate::error::{AppError, Result};
use crate::identity;
use crate::metrics;

pub const SECRET_TOKEN_HEADER: &str = "X-Telegram-Bot-Api-Secret-Token";

/// How many challenges `/challenges` shows.
const RECENT_CHALLENGES: i64 = 5;

// ── Incoming updates ─────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub from: Option<TelegramUser>,
    pub chat: Chat,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub username: Option<String>,
}

impl TelegramUser {
    fn profile(&self) -> Profile {
        Profile {
            username: self.username.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            avatar_url: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: TelegramUser,
    pub message: Option<Message>,
    pub data: Option<String>,
}

// ── Outgoing method calls ────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub callback_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

impl InlineKeyboardMarkup {
    fn row(buttons: &[(&str, String)]) -> Self {
        Self {
            inline_keyboard: vec![buttons
                .iter()
                .map(|(text, data)| InlineKeyboardButton {
                    text: text.to_string(),
                    callback_data: data.clone(),
                })
                .collect()],
        }
    }
}

/// A Bot API method call returned as the webhook response.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "method")]
pub enum BotReply {
    #[serde(rename = "sendMessage")]
    SendMessage {
        chat_id: i64,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_markup: Option<InlineKeyboardMarkup>,
    },
    #[serde(rename = "answerCallbackQuery")]
    AnswerCallbackQuery {
        callback_query_id: String,
        text: String,
    },
    #[serde(rename = "editMessageText")]
    EditMessageText {
        chat_id: i64,
        message_id: i64,
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reply_markup: Option<InlineKeyboardMarkup>,
    },
}

impl BotReply {
    pub fn text(&self) -> &str {
        match self {
            BotReply::SendMessage { text, .. }
            | BotReply::AnswerCallbackQuery { text, .. }
            | BotReply::EditMessageText { text, .. } => text,
        }
    }
}

// ── Parsing ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    /// Target username, if a mention was given.
    Challenge(Option<String>),
    Challenges,
    AddAdmin(Option<String>),
    RemoveAdmin(Option<String>),
}

/// First `@mention` after the command, without the `@`.
pub fn mention_arg(text: &str) -> Option<String> {
    text.split_whitespace()
        .skip(1)
        .find_map(|token| token.strip_prefix('@'))
        .map(|name| name.trim_end_matches(|c: char| !(c.is_alphanumeric() || c == '_')))
        .filter(|name| !name.is_empty())
        .map(str::to_string)
}

pub fn parse_command(text: &str) -> Option<Command> {
    let head = text.split_whitespace().next()?.strip_prefix('/')?;
    // "/challenge@PingPongBot" in group chats
    let name = head.split('@').next().unwrap_or(head);

    match name {
        "start" | "help" => Some(Command::Start),
        "challenge" | "вызов" => Some(Command::Challenge(mention_arg(text))),
        "challenges" => Some(Command::Challenges),
        "addadmin" => Some(Command::AddAdmin(mention_arg(text))),
        "removeadmin" => Some(Command::RemoveAdmin(mention_arg(text))),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Accept(i64),
    Decline(i64),
    Result(i64, SelfReport),
}

/// Parse `accept_{id}`, `decline_{id}` and `result_{id}_{won|lost}`.
pub fn parse_callback(data: &str) -> Option<CallbackAction> {
    let mut parts = data.split('_');
    let action = parts.next()?;
    let id: i64 = parts.next()?.parse().ok()?;

    let parsed = match action {
        "accept" => CallbackAction::Accept(id),
        "decline" => CallbackAction::Decline(id),
        "result" => CallbackAction::Result(id, SelfReport::from_str_name(parts.next()?)?),
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(parsed)
}

// ── Rendering ────────────────────────────────────────────────────────

fn at_name(user: &User) -> String {
    match &user.username {
        Some(name) => format!("@{name}"),
        None => user.display_name(),
    }
}

fn status_marker(status: ChallengeStatus) -> &'static str {
    match status {
        ChallengeStatus::Pending => "⏳",
        ChallengeStatus::Accepted => "✅",
        ChallengeStatus::Declined => "❌",
        ChallengeStatus::Completed => "🏆",
    }
}

/// Lifecycle errors are shown to the user; storage errors are not.
fn error_text(err: &AppError) -> String {
    match err {
        AppError::Database(_) | AppError::Internal(_) => {
            tracing::error!("Bot command failed: {err}");
            "Something went wrong, please try again later.".to_string()
        }
        other => {
            tracing::debug!("Bot command rejected ({}): {other}", other.kind());
            other.to_string()
        }
    }
}

fn help_text(user: &User) -> String {
    let name = user
        .first_name
        .clone()
        .or_else(|| user.username.clone())
        .unwrap_or_else(|| "player".to_string());
    let mut text = format!(
        "Hi, {name}! I keep score for table tennis challenges.\n\n\
         Commands:\n\
         /challenge @username - challenge a player\n\
         /challenges - your recent challenges"
    );
    if user.is_admin {
        text.push_str(
            "\n\nAdmin commands:\n\
             /addadmin @username - grant admin rights\n\
             /removeadmin @username - revoke admin rights",
        );
    }
    text
}

// ── Dispatch ─────────────────────────────────────────────────────────

/// Handle one update. `None` means there is nothing to answer.
pub async fn handle_update(db: &Database, update: Update, now: NaiveDateTime) -> Option<BotReply> {
    if let Some(query) = update.callback_query {
        metrics::BOT_UPDATES_TOTAL.with_label_values(&["callback"]).inc();
        return Some(handle_callback(db, query, now).await);
    }

    let message = update.message?;
    let command = message.text.as_deref().and_then(parse_command);
    let (Some(command), Some(from)) = (command, message.from.as_ref()) else {
        metrics::BOT_UPDATES_TOTAL.with_label_values(&["ignored"]).inc();
        return None;
    };
    metrics::BOT_UPDATES_TOTAL.with_label_values(&["message"]).inc();

    let (text, reply_markup) = match run_command(db, from, command, now).await {
        Ok(reply) => reply,
        Err(e) => (error_text(&e), None),
    };
    Some(BotReply::SendMessage {
        chat_id: message.chat.id,
        text,
        reply_markup,
    })
}

async fn run_command(
    db: &Database,
    from: &TelegramUser,
    command: Command,
    now: NaiveDateTime,
) -> Result<(String, Option<InlineKeyboardMarkup>)> {
    let actor = identity::resolve(db, from.id, &from.profile()).await?;

    match command {
        Command::Start => Ok((help_text(&actor), None)),

        Command::Challenge(None) => Ok(("Usage: /challenge @username".to_string(), None)),
        Command::Challenge(Some(username)) => {
            let created = challenge::create(db, actor.id, &username, now).await?;
            let challenged = identity::get(db, created.challenged_id).await?;
            let buttons = InlineKeyboardMarkup::row(&[
                ("✅ Accept", format!("accept_{}", created.id)),
                ("❌ Decline", format!("decline_{}", created.id)),
            ]);
            Ok((
                format!(
                    "🏓 {} challenges {}!\n\nAccept or decline the challenge:",
                    at_name(&actor),
                    at_name(&challenged)
                ),
                Some(buttons),
            ))
        }

        Command::Challenges => {
            let recent = challenge::list_for_user(db, actor.id, Some(RECENT_CHALLENGES)).await?;
            if recent.is_empty() {
                return Ok(("You have no challenges yet.".to_string(), None));
            }
            let mut text = String::from("Your recent challenges:\n\n");
            for c in &recent {
                text.push_str(&format!(
                    "{} @{} vs @{} - {}\n",
                    status_marker(c.status),
                    c.challenger_username.as_deref().unwrap_or("unknown"),
                    c.challenged_username.as_deref().unwrap_or("unknown"),
                    c.status.as_str()
                ));
            }
            Ok((text, None))
        }

        Command::AddAdmin(None) => Ok(("Usage: /addadmin @username".to_string(), None)),
        Command::AddAdmin(Some(username)) => {
            let target = identity::set_admin(db, actor.id, &username, true).await?;
            Ok((format!("✅ {} is now an admin.", at_name(&target)), None))
        }

        Command::RemoveAdmin(None) => Ok(("Usage: /removeadmin @username".to_string(), None)),
        Command::RemoveAdmin(Some(username)) => {
            let target = identity::set_admin(db, actor.id, &username, false).await?;
            Ok((format!("✅ {} is no longer an admin.", at_name(&target)), None))
        }
    }
}

/// Outcome of a button press: replace the message, or just answer.
enum CallbackOutcome {
    Edit(String, Option<InlineKeyboardMarkup>),
    Answer(String),
}

async fn handle_callback(db: &Database, query: CallbackQuery, now: NaiveDateTime) -> BotReply {
    let outcome = match query.data.as_deref().and_then(parse_callback) {
        Some(action) => match run_callback(db, &query.from, action, now).await {
            Ok(outcome) => outcome,
            Err(e) => CallbackOutcome::Answer(error_text(&e)),
        },
        None => CallbackOutcome::Answer("Unknown action".to_string()),
    };

    match (outcome, &query.message) {
        (CallbackOutcome::Edit(text, reply_markup), Some(message)) => BotReply::EditMessageText {
            chat_id: message.chat.id,
            message_id: message.message_id,
            text,
            reply_markup,
        },
        (CallbackOutcome::Edit(text, _), None) | (CallbackOutcome::Answer(text), _) => {
            BotReply::AnswerCallbackQuery {
                callback_query_id: query.id.clone(),
                text,
            }
        }
    }
}

async fn run_callback(
    db: &Database,
    from: &TelegramUser,
    action: CallbackAction,
    now: NaiveDateTime,
) -> Result<CallbackOutcome> {
    let actor = identity::resolve(db, from.id, &from.profile()).await?;

    match action {
        CallbackAction::Accept(id) => {
            challenge::accept(db, id, actor.id, now).await?;
            let buttons = InlineKeyboardMarkup::row(&[
                ("🏆 I won", format!("result_{id}_won")),
                ("💀 I lost", format!("result_{id}_lost")),
            ]);
            Ok(CallbackOutcome::Edit(
                "✅ Challenge accepted!\n\nAfter the match both players press their result:"
                    .to_string(),
                Some(buttons),
            ))
        }
        CallbackAction::Decline(id) => {
            challenge::decline(db, id, actor.id, now).await?;
            Ok(CallbackOutcome::Edit("❌ Challenge declined".to_string(), None))
        }
        CallbackAction::Result(id, result) => {
            match challenge::submit_result(db, id, actor.id, result, now).await? {
                Submission::Recorded { .. } => Ok(CallbackOutcome::Answer(format!(
                    "Result recorded: {}",
                    result.as_str()
                ))),
                Submission::Completed(done) => Ok(CallbackOutcome::Edit(
                    format!(
                        "🏆 Match finished!\n\nWinner: {} ({}, {:+})\nLoser: {} ({}, {:+})",
                        at_name(&done.winner),
                        done.rating.winner.after,
                        done.rating.winner.change,
                        at_name(&done.loser),
                        done.rating.loser.after,
                        done.rating.loser.change
                    ),
                    None,
                )),
            }
        }
    }
}

/// POST /api/bot/webhook
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    ApiJson(update): ApiJson<Update>,
) -> Result<Response> {
    if let Some(expected) = state.config.webhook_secret.as_deref() {
        let given = headers
            .get(SECRET_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok());
        if given != Some(expected) {
            tracing::warn!("Rejected webhook update {} with bad secret", update.update_id);
            return Err(AppError::unauthorized("Invalid webhook secret"));
        }
    }

    let now = chrono::Local::now().naive_local();
    Ok(match handle_update(&state.db, update, now).await {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::OK.into_response(),
    })
}
