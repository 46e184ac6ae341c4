use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::json;
use tokio_util::io::ReaderStream;
use tracing::debug;

use crate::{
    ChatId, UserId,
    error::TransportError,
    transport::{FileKind, MessageRef, Transport, Upload},
};

const PARSE_MODE: &str = "Markdown";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
    pub callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: ChatId,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackQuery {
    pub id: String,
    pub from: User,
    pub message: Option<Message>,
    pub data: Option<String>,
}

impl Message {
    pub fn to_ref(&self) -> MessageRef {
        MessageRef {
            chat_id: self.chat.id,
            message_id: self.message_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineButton {
    pub text: String,
    pub callback_data: String,
}

/// Thin Bot API client: JSON calls for text, multipart for uploads.
#[derive(Debug, Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(http: reqwest::Client, api_url: &str, token: &str) -> Self {
        Self {
            http,
            base_url: format!("{api_url}/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &'static str,
        payload: &serde_json::Value,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let response = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .timeout(timeout)
            .json(payload)
            .send()
            .await?;

        unwrap_response(method, response.json::<ApiResponse<T>>().await?)
    }

    pub async fn get_updates(&self, offset: Option<i64>, poll_timeout: Duration) -> Result<Vec<Update>, TransportError> {
        let mut payload = json!({
            "timeout": poll_timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = offset {
            payload["offset"] = json!(offset);
        }

        self.call("getUpdates", &payload, poll_timeout + REQUEST_TIMEOUT)
            .await
    }

    pub async fn drop_pending_updates(&self) -> Result<(), TransportError> {
        self.call::<bool>(
            "deleteWebhook",
            &json!({ "drop_pending_updates": true }),
            REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn answer_callback_query(&self, callback_query_id: &str) -> Result<(), TransportError> {
        self.call::<bool>(
            "answerCallbackQuery",
            &json!({ "callback_query_id": callback_query_id }),
            REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    pub async fn edit_with_keyboard(
        &self,
        message: MessageRef,
        text: &str,
        keyboard: Vec<Vec<InlineButton>>,
    ) -> Result<(), TransportError> {
        self.edit(
            json!({
                "chat_id": message.chat_id,
                "message_id": message.message_id,
                "text": text,
                "parse_mode": PARSE_MODE,
                "reply_markup": { "inline_keyboard": keyboard },
            }),
        )
        .await
    }

    async fn edit(&self, payload: serde_json::Value) -> Result<(), TransportError> {
        match self
            .call::<serde_json::Value>("editMessageText", &payload, REQUEST_TIMEOUT)
            .await
        {
            Err(TransportError::Api { description, .. }) if description.contains("message is not modified") => {
                Ok(())
            }
            other => other.map(|_| ()),
        }
    }
}

fn unwrap_response<T>(method: &'static str, response: ApiResponse<T>) -> Result<T, TransportError> {
    match response {
        ApiResponse {
            ok: true,
            result: Some(result),
            ..
        } => Ok(result),
        ApiResponse { description, .. } => Err(TransportError::Api {
            method,
            description: description.unwrap_or_else(|| "no description".to_string()),
        }),
    }
}

fn upload_method(kind: FileKind) -> (&'static str, &'static str) {
    match kind {
        FileKind::Video => ("sendVideo", "video"),
        FileKind::Audio => ("sendAudio", "audio"),
        FileKind::Document => ("sendDocument", "document"),
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send_text(&self, chat_id: ChatId, text: &str) -> Result<MessageRef, TransportError> {
        let message: Message = self
            .call(
                "sendMessage",
                &json!({ "chat_id": chat_id, "text": text, "parse_mode": PARSE_MODE }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(message.to_ref())
    }

    async fn edit_text(&self, message: MessageRef, text: &str) -> Result<(), TransportError> {
        self.edit(json!({
            "chat_id": message.chat_id,
            "message_id": message.message_id,
            "text": text,
            "parse_mode": PARSE_MODE,
        }))
        .await
    }

    async fn delete_message(&self, message: MessageRef) -> Result<(), TransportError> {
        self.call::<bool>(
            "deleteMessage",
            &json!({ "chat_id": message.chat_id, "message_id": message.message_id }),
            REQUEST_TIMEOUT,
        )
        .await
        .map(|_| ())
    }

    async fn send_file(&self, chat_id: ChatId, upload: Upload<'_>) -> Result<(), TransportError> {
        let (method, field) = upload_method(upload.kind);
        let filename = upload
            .path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("download.bin")
            .to_string();

        let file = tokio::fs::File::open(upload.path).await?;
        let length = file.metadata().await?.len();
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));
        let part = Part::stream_with_length(body, length).file_name(filename);

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .text("caption", upload.caption)
            .text("parse_mode", PARSE_MODE)
            .part(field, part);
        form = match upload.kind {
            FileKind::Video => form.text("supports_streaming", "true"),
            FileKind::Audio => form
                .text("title", upload.title.chars().take(100).collect::<String>())
                .text("performer", upload.performer.to_string()),
            FileKind::Document => form,
        };

        debug!("Uploading {} bytes via {method}", length);
        let response = self
            .http
            .post(format!("{}/{method}", self.base_url))
            .timeout(UPLOAD_TIMEOUT)
            .multipart(form)
            .send()
            .await?;

        unwrap_response(method, response.json::<ApiResponse<serde_json::Value>>().await?).map(|_| ())
    }
}
