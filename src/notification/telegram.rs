//! Telegram Bot API transport.
//!
//! Challenges are posted with a one-row inline keyboard whose callback data
//! is the reply label. Replies come back through `getUpdates` either as
//! callback queries (button taps) or as text messages replying to the
//! challenge.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use zeroize::Zeroizing;

use super::{MessageId, Notifier, NotifyError, PollBatch, PollCursor, Reply};

pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

/// Replies kept in memory after `getUpdates` confirms them.
const RECENT_REPLY_LIMIT: usize = 256;

#[derive(Clone)]
pub struct TelegramNotifier {
    client: Client,
    token: Zeroizing<String>,
    chat_id: String,
    base_url: String,
    parse_mode: Option<String>,
    /// `getUpdates` with an offset confirms every earlier update for all
    /// callers. Gates sharing this notifier read from here so one poller
    /// cannot swallow another's replies.
    recent: Arc<Mutex<BTreeMap<i64, Reply>>>,
}

impl std::fmt::Debug for TelegramNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramNotifier")
            .field("chat_id", &self.chat_id)
            .field("base_url", &self.base_url)
            .field("parse_mode", &self.parse_mode)
            .finish_non_exhaustive()
    }
}

impl TelegramNotifier {
    pub fn new(token: impl Into<String>, chat_id: &str) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("loginguard/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            token: Zeroizing::new(token.into()),
            chat_id: normalize_chat_id(chat_id)?,
            base_url: DEFAULT_API_BASE_URL.to_string(),
            parse_mode: None,
            recent: Arc::new(Mutex::new(BTreeMap::new())),
        })
    }

    #[must_use]
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    #[must_use]
    pub fn with_parse_mode(mut self, parse_mode: Option<String>) -> Self {
        self.parse_mode = parse_mode;
        self
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token.as_str(), method)
    }

    async fn call<B, T>(&self, method: &str, body: &B) -> Result<T, NotifyError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self.client.post(self.api_url(method)).json(body).send().await?;
        let status = resp.status();
        let text = resp.text().await?;

        let envelope: ApiResponse<T> = serde_json::from_str(&text).map_err(|e| {
            NotifyError::Malformed(format!("{method}: status={status}: {e}"))
        })?;

        if envelope.ok {
            envelope
                .result
                .ok_or_else(|| NotifyError::Malformed(format!("{method}: ok without result")))
        } else {
            Err(NotifyError::Api {
                code: envelope
                    .error_code
                    .unwrap_or_else(|| i32::from(status.as_u16())),
                description: envelope.description.unwrap_or_default(),
            })
        }
    }

    /// `getMe`, used to validate the token.
    #[instrument(skip(self))]
    pub async fn identity(&self) -> Result<BotIdentity, NotifyError> {
        self.call("getMe", &serde_json::json!({})).await
    }

    async fn answer_callback(&self, callback_query_id: &str) {
        let body = serde_json::json!({ "callback_query_id": callback_query_id });
        if let Err(e) = self.call::<_, bool>("answerCallbackQuery", &body).await {
            debug!(error = %e, "failed to acknowledge callback query");
        }
    }

    fn keyboard(options: &[String]) -> Option<InlineKeyboardMarkup> {
        if options.is_empty() {
            return None;
        }
        let row = options
            .iter()
            .map(|label| InlineKeyboardButton {
                text: label.clone(),
                callback_data: label.clone(),
            })
            .collect();
        Some(InlineKeyboardMarkup {
            inline_keyboard: vec![row],
        })
    }

    fn is_own_chat(&self, chat: &Chat) -> bool {
        let id = chat.id.to_string();
        if id == self.chat_id {
            return true;
        }
        match (&chat.username, self.chat_id.strip_prefix('@')) {
            (Some(username), Some(configured)) => username.eq_ignore_ascii_case(configured),
            _ => false,
        }
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    #[instrument(skip_all, fields(options = options.len()))]
    async fn send(&self, text: &str, options: &[String]) -> Result<MessageId, NotifyError> {
        let mut request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: self.parse_mode.as_deref(),
            reply_markup: Self::keyboard(options),
        };

        let sent: Result<SentMessage, _> = self.call("sendMessage", &request).await;
        let sent = match sent {
            Err(NotifyError::Api { description, .. })
                if request.parse_mode.is_some() && is_parse_error(&description) =>
            {
                warn!("parse mode rejected, resending as plain text");
                request.parse_mode = None;
                self.call("sendMessage", &request).await?
            }
            other => other?,
        };

        Ok(MessageId(sent.message_id))
    }

    #[instrument(skip(self, text))]
    async fn edit(&self, message: MessageId, text: &str) -> Result<(), NotifyError> {
        let request = EditMessageTextRequest {
            chat_id: &self.chat_id,
            message_id: message.0,
            text,
        };

        match self.call::<_, serde_json::Value>("editMessageText", &request).await {
            Ok(_) => Ok(()),
            Err(NotifyError::Api { description, .. }) if is_not_modified(&description) => Ok(()),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn poll_since(&self, cursor: PollCursor) -> Result<PollBatch, NotifyError> {
        let request = GetUpdatesRequest {
            offset: cursor.0,
            allowed_updates: &["message", "callback_query"],
        };
        let updates: Vec<Update> = self.call("getUpdates", &request).await?;

        let mut next = cursor;
        let mut fetched = Vec::new();
        for update in updates {
            next = next.max(PollCursor(update.update_id.saturating_add(1)));

            if let Some(query) = update.callback_query {
                let Some(message) = query.message else { continue };
                if !self.is_own_chat(&message.chat) {
                    debug!(update_id = update.update_id, "ignoring callback from foreign chat");
                    continue;
                }
                self.answer_callback(&query.id).await;
                if let Some(data) = query.data {
                    fetched.push((
                        update.update_id,
                        Reply {
                            target: MessageId(message.message_id),
                            payload: data,
                        },
                    ));
                }
            } else if let Some(message) = update.message {
                if !self.is_own_chat(&message.chat) {
                    continue;
                }
                if let (Some(original), Some(text)) = (message.reply_to_message, message.text) {
                    fetched.push((
                        update.update_id,
                        Reply {
                            target: MessageId(original.message_id),
                            payload: text.trim().to_string(),
                        },
                    ));
                }
            }
        }

        let replies = {
            let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
            recent.extend(fetched);
            while recent.len() > RECENT_REPLY_LIMIT {
                recent.pop_first();
            }
            let replies: Vec<Reply> = recent
                .range(cursor.0..)
                .map(|(update_id, reply)| {
                    next = next.max(PollCursor(update_id.saturating_add(1)));
                    reply.clone()
                })
                .collect();
            replies
        };

        Ok(PollBatch {
            cursor: next,
            replies,
        })
    }
}

// ── Wire types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i32>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotIdentity {
    pub id: i64,
    pub is_bot: bool,
    pub first_name: String,
    pub username: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup>,
}

#[derive(Debug, Serialize)]
struct EditMessageTextRequest<'a> {
    chat_id: &'a str,
    message_id: i64,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct GetUpdatesRequest<'a> {
    offset: i64,
    allowed_updates: &'a [&'a str],
}

#[derive(Debug, Serialize)]
struct InlineKeyboardMarkup {
    inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Serialize)]
struct InlineKeyboardButton {
    text: String,
    callback_data: String,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    message_id: i64,
    chat: Chat,
    text: Option<String>,
    reply_to_message: Option<Box<IncomingMessage>>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    message: Option<IncomingMessage>,
    data: Option<String>,
}

/// Accepts numeric ids (negative for groups), `@username`, `t.me/` links
/// and `telegram:`/`tg:` prefixes.
pub fn normalize_chat_id(id: &str) -> Result<String, NotifyError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(NotifyError::InvalidChatId("empty chat id".into()));
    }

    let normalized = trimmed
        .strip_prefix("telegram:")
        .or_else(|| trimmed.strip_prefix("tg:"))
        .unwrap_or(trimmed);

    if let Some(username) = normalized
        .strip_prefix("https://t.me/")
        .or_else(|| normalized.strip_prefix("t.me/"))
    {
        if username.is_empty() || username.starts_with('+') {
            return Err(NotifyError::InvalidChatId(trimmed.to_string()));
        }
        return Ok(format!("@{username}"));
    }

    if normalized.len() > 1 && normalized.starts_with('@') {
        return Ok(normalized.to_string());
    }

    let digits = normalized.strip_prefix('-').unwrap_or(normalized);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        return Ok(normalized.to_string());
    }

    Err(NotifyError::InvalidChatId(trimmed.to_string()))
}

fn is_parse_error(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("can't parse entities") || lower.contains("find end of the entity")
}

fn is_not_modified(description: &str) -> bool {
    description.to_lowercase().contains("message is not modified")
}
