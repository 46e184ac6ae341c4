//! Long-polling front end: turns Bot API updates into controller calls and
//! controller outcomes into chat messages.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    ChatId, UserId,
    config::Config,
    controller::{DownloadController, FormatChoice, FormatChoices, Outcome, RequestContext},
    error::DownloadError,
    extractor::FormatOption,
    messages,
    stats::UserStats,
    telegram::{CallbackQuery, InlineButton, Message, TelegramClient, Update},
    transport::{MessageRef, Transport},
};

const POLL_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CHOICE_PREFIX: &str = "quality_";
const BEST_CHOICE: &str = "best";
/// Bot API limit on `callback_data`, in bytes.
const CALLBACK_DATA_LIMIT: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Start,
    Help,
    Stats,
    Unknown,
}

fn parse_command(text: &str) -> Option<Command> {
    let word = text.split_whitespace().next()?.strip_prefix('/')?;
    let name = word.split('@').next().unwrap_or(word);

    Some(match name.to_ascii_lowercase().as_str() {
        "start" => Command::Start,
        "help" => Command::Help,
        "stats" => Command::Stats,
        _ => Command::Unknown,
    })
}

/// `quality_{user}_{offer token}_{option index | best}`. Only numbers go
/// in, so the payload stays within [`CALLBACK_DATA_LIMIT`] whatever the
/// extractor's format ids look like.
fn choice_data(user_id: UserId, token: u64, choice: FormatChoice) -> String {
    let data = match choice {
        FormatChoice::Best => format!("{CHOICE_PREFIX}{user_id}_{token}_{BEST_CHOICE}"),
        FormatChoice::Option(index) => format!("{CHOICE_PREFIX}{user_id}_{token}_{index}"),
    };
    debug_assert!(data.len() <= CALLBACK_DATA_LIMIT);
    data
}

fn parse_choice(data: &str) -> Option<(UserId, u64, FormatChoice)> {
    let mut parts = data.strip_prefix(CHOICE_PREFIX)?.split('_');
    let user_id = parts.next()?.parse().ok()?;
    let token = parts.next()?.parse().ok()?;
    let choice = match parts.next()? {
        BEST_CHOICE => FormatChoice::Best,
        index => FormatChoice::Option(index.parse().ok()?),
    };

    parts.next().is_none().then_some((user_id, token, choice))
}

fn format_keyboard(user_id: UserId, choices: &FormatChoices) -> Vec<Vec<InlineButton>> {
    choices
        .options
        .iter()
        .enumerate()
        .map(|(index, option)| InlineButton {
            text: messages::format_button_label(option),
            callback_data: choice_data(user_id, choices.token, FormatChoice::Option(index)),
        })
        .chain(std::iter::once(InlineButton {
            text: messages::BEST_QUALITY_LABEL.to_string(),
            callback_data: choice_data(user_id, choices.token, FormatChoice::Best),
        }))
        .map(|button| vec![button])
        .collect()
}

/// Who an update came from, kept for reporting a crashed handler.
#[derive(Debug, Clone)]
struct UpdateOrigin {
    chat_id: Option<ChatId>,
    user_id: Option<UserId>,
    input: String,
}

impl UpdateOrigin {
    fn of(update: &Update) -> Self {
        if let Some(message) = &update.message {
            return Self {
                chat_id: Some(message.chat.id),
                user_id: message.from.as_ref().map(|user| user.id),
                input: message.text.clone().unwrap_or_default(),
            };
        }
        if let Some(callback) = &update.callback_query {
            return Self {
                chat_id: callback.message.as_ref().map(|message| message.chat.id),
                user_id: Some(callback.from.id),
                input: callback.data.clone().unwrap_or_default(),
            };
        }
        Self {
            chat_id: None,
            user_id: None,
            input: String::new(),
        }
    }
}

pub struct Bot {
    config: Arc<Config>,
    client: Arc<TelegramClient>,
    controller: Arc<DownloadController>,
    stats: Arc<UserStats>,
}

impl Bot {
    pub fn new(
        config: Arc<Config>,
        client: Arc<TelegramClient>,
        controller: Arc<DownloadController>,
        stats: Arc<UserStats>,
    ) -> Self {
        Self {
            config,
            client,
            controller,
            stats,
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut offset = None;
        let mut backoff = INITIAL_BACKOFF;
        info!("Bot is polling for updates");

        loop {
            let updates = tokio::select! {
                _ = shutdown.cancelled() => break,
                updates = self.client.get_updates(offset, POLL_TIMEOUT) => updates,
            };

            match updates {
                Ok(updates) => {
                    backoff = INITIAL_BACKOFF;
                    for update in updates {
                        offset = Some(update.update_id + 1);
                        self.spawn_update(update);
                    }
                }
                Err(error) => {
                    warn!("Polling failed, retrying in {}s: {error}", backoff.as_secs());
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }

        info!("Bot stopped polling");
    }

    /// Each update runs on its own task; a panic there is logged with the
    /// update's origin and the user gets a generic failure message.
    fn spawn_update(self: &Arc<Self>, update: Update) {
        let origin = UpdateOrigin::of(&update);
        let bot = Arc::clone(self);
        let task = tokio::spawn(async move { bot.dispatch(update).await });

        let bot = Arc::clone(self);
        tokio::spawn(async move {
            let Err(join_error) = task.await else {
                return;
            };
            if !join_error.is_panic() {
                return;
            }

            error!(
                user_id = ?origin.user_id,
                chat_id = ?origin.chat_id,
                input = %origin.input,
                "Update handler panicked: {join_error}"
            );
            if let Some(chat_id) = origin.chat_id
                && let Err(error) = bot.client.send_text(chat_id, messages::unexpected_failure()).await
            {
                warn!("Could not report failure to chat {chat_id}: {error}");
            }
        });
    }

    async fn dispatch(&self, update: Update) {
        if let Some(message) = update.message {
            self.on_message(message).await;
        } else if let Some(callback) = update.callback_query {
            self.on_callback(callback).await;
        }
    }

    async fn on_message(&self, message: Message) {
        let (Some(text), Some(user)) = (message.text.as_deref(), message.from.as_ref()) else {
            return;
        };
        let chat_id = message.chat.id;

        let reply = match parse_command(text) {
            Some(Command::Start) => messages::welcome(),
            Some(Command::Help) => messages::help(&self.config),
            Some(Command::Stats) => messages::stats(self.stats.snapshot(user.id).as_ref()),
            Some(Command::Unknown) => return,
            None => {
                self.on_link(chat_id, user.id, text).await;
                return;
            }
        };

        if let Err(error) = self.client.send_text(chat_id, &reply).await {
            warn!("Could not answer command in chat {chat_id}: {error}");
        }
    }

    async fn on_link(&self, chat_id: ChatId, user_id: UserId, text: &str) {
        let status = match self.client.send_text(chat_id, messages::PROCESSING).await {
            Ok(status) => status,
            Err(error) => {
                warn!("Could not acknowledge link from user {user_id}: {error}");
                return;
            }
        };

        let context = RequestContext {
            user_id,
            chat_id,
            status,
        };
        let result = self.controller.handle(context, text).await;
        self.report(context, result).await;
    }

    async fn on_callback(&self, callback: CallbackQuery) {
        if let Err(error) = self.client.answer_callback_query(&callback.id).await {
            warn!("Could not answer callback query: {error}");
        }

        let Some(message) = callback.message.as_ref() else {
            return;
        };
        let status = message.to_ref();

        let choice = callback
            .data
            .as_deref()
            .and_then(parse_choice)
            .filter(|(owner, _, _)| *owner == callback.from.id);
        let Some((user_id, token, choice)) = choice else {
            self.edit_or_send(status, messages::INVALID_SELECTION).await;
            return;
        };

        let context = RequestContext {
            user_id,
            chat_id: status.chat_id,
            status,
        };
        let result = self.controller.select_format(context, token, choice).await;
        self.report(context, result).await;
    }

    async fn report(&self, context: RequestContext, result: Result<Outcome, DownloadError>) {
        match result {
            Ok(Outcome::Delivered { .. }) => {
                if let Err(error) = self.client.delete_message(context.status).await {
                    warn!("Could not delete status message: {error}");
                }
            }
            Ok(Outcome::NeedsFormatChoice(choices)) => self.offer_formats(context, &choices).await,
            Err(error) => {
                let text = error.user_message(self.config.rate_limit_requests, self.config.rate_limit_window);
                self.edit_or_send(context.status, &text).await;
            }
        }
    }

    /// Shows the quality keyboard. If Telegram refuses it the offer is
    /// withdrawn and the user is told to resend the link.
    async fn offer_formats(&self, context: RequestContext, choices: &FormatChoices) {
        let text = messages::choose_format(&choices.info, choices.platform);
        let keyboard = format_keyboard(context.user_id, choices);

        if let Err(error) = self
            .client
            .edit_with_keyboard(context.status, &text, keyboard)
            .await
        {
            warn!("Could not show format choices to user {}: {error}", context.user_id);
            self.controller.cancel_choice(context.user_id);
            self.edit_or_send(context.status, messages::FORMAT_MENU_FAILED)
                .await;
        }
    }

    async fn edit_or_send(&self, status: MessageRef, text: &str) {
        if self.client.edit_text(status, text).await.is_ok() {
            return;
        }
        if let Err(error) = self.client.send_text(status.chat_id, text).await {
            warn!("Could not notify chat {}: {error}", status.chat_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::{Path, PathBuf},
        sync::Mutex,
    };

    use async_trait::async_trait;
    use axum::{
        Json,
        extract::{Path as ApiPath, State},
    };
    use serde_json::{Value, json};

    use super::*;
    use crate::{
        controller::ControllerSettings,
        error::ExtractorError,
        extractor::{Extractor, FormatSelector, MediaInfo},
        files::FileManager,
        progress::ProgressSender,
    };

    type ApiCalls = Arc<Mutex<Vec<(String, Value)>>>;

    /// Probes as a two-quality video; never gets as far as fetching.
    struct TwoQualities;

    #[async_trait]
    impl Extractor for TwoQualities {
        async fn probe(&self, _url: &str) -> Result<MediaInfo, ExtractorError> {
            Ok(offer(0, vec![option("137", 1080), option("22", 720)]).info)
        }

        async fn fetch(
            &self,
            _url: &str,
            _selector: &FormatSelector,
            _output_base: &Path,
            _progress: ProgressSender,
        ) -> Result<PathBuf, ExtractorError> {
            Err(ExtractorError::MissingOutput)
        }
    }

    /// Bot API stand-in that refuses every inline keyboard.
    async fn keyboard_refusing_api(
        State(calls): State<ApiCalls>,
        ApiPath((_, method)): ApiPath<(String, String)>,
        Json(body): Json<Value>,
    ) -> Json<Value> {
        calls.lock().unwrap().push((method.clone(), body.clone()));
        let result = match method.as_str() {
            "editMessageText" if body.get("reply_markup").is_some() => {
                return Json(json!({"ok": false, "description": "Bad Request: BUTTON_DATA_INVALID"}));
            }
            "sendMessage" => json!({"message_id": 5, "chat": {"id": body["chat_id"]}}),
            _ => json!(true),
        };
        Json(json!({"ok": true, "result": result}))
    }

    fn option(id: &str, height: u32) -> FormatOption {
        FormatOption {
            format_id: id.to_string(),
            height,
            filesize: None,
        }
    }

    #[test]
    fn commands_ignore_bot_suffix_and_arguments() {
        assert_eq!(parse_command("/start"), Some(Command::Start));
        assert_eq!(parse_command("/help@media_relay_bot"), Some(Command::Help));
        assert_eq!(parse_command("/STATS now"), Some(Command::Stats));
        assert_eq!(parse_command("/unknown"), Some(Command::Unknown));
        assert_eq!(parse_command("https://youtu.be/x"), None);
        assert_eq!(parse_command("   "), None);
    }

    fn offer(token: u64, options: Vec<FormatOption>) -> FormatChoices {
        FormatChoices {
            info: MediaInfo {
                title: "clip".to_string(),
                uploader: "someone".to_string(),
                duration_secs: 10,
                filesize: None,
                formats: options.clone(),
            },
            platform: "YouTube",
            options,
            token,
        }
    }

    #[test]
    fn choice_data_round_trips() {
        let data = choice_data(42, 7, FormatChoice::Option(3));

        assert_eq!(data, "quality_42_7_3");
        assert_eq!(parse_choice(&data), Some((42, 7, FormatChoice::Option(3))));
        assert_eq!(
            parse_choice(&choice_data(-5, 1, FormatChoice::Best)),
            Some((-5, 1, FormatChoice::Best))
        );
    }

    #[test]
    fn malformed_choice_data_is_rejected() {
        assert_eq!(parse_choice("quality_abc_1_0"), None);
        assert_eq!(parse_choice("quality_42_1_"), None);
        assert_eq!(parse_choice("quality_42_1"), None);
        assert_eq!(parse_choice("quality_42_x_0"), None);
        assert_eq!(parse_choice("quality_42_1_137_extra"), None);
        assert_eq!(parse_choice("other_42_1_0"), None);
    }

    #[test]
    fn callback_data_fits_the_bot_api_limit() {
        let long_id = "hls-akfire_interconnect_quic_sep-1080p-with-a-much-longer-suffix";
        let choices = offer(u64::MAX, vec![option(long_id, 1080); 6]);

        for row in format_keyboard(i64::MIN, &choices) {
            assert!(row[0].callback_data.len() <= CALLBACK_DATA_LIMIT, "{}", row[0].callback_data);
        }
    }

    #[test]
    fn keyboard_lists_options_then_best() {
        let keyboard = format_keyboard(7, &offer(3, vec![option("137", 1080), option("22", 720)]));

        assert_eq!(keyboard.len(), 3);
        assert!(keyboard.iter().all(|row| row.len() == 1));
        assert_eq!(keyboard[0][0].text, "1080p");
        assert_eq!(keyboard[0][0].callback_data, "quality_7_3_0");
        assert_eq!(keyboard[1][0].callback_data, "quality_7_3_1");
        assert_eq!(keyboard[2][0].text, messages::BEST_QUALITY_LABEL);
        assert_eq!(keyboard[2][0].callback_data, "quality_7_3_best");
    }

    #[tokio::test]
    async fn refused_keyboard_withdraws_the_offer_and_tells_the_user() {
        let calls = ApiCalls::default();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let api = axum::Router::new()
            .route("/{bot}/{method}", axum::routing::post(keyboard_refusing_api))
            .with_state(Arc::clone(&calls));
        tokio::spawn(async move { axum::serve(listener, api).await.unwrap() });

        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(
            Config::from_lookup(|name| (name == "BOT_TOKEN").then(|| "123:abc".to_string())).unwrap(),
        );
        let client = Arc::new(TelegramClient::new(
            reqwest::Client::new(),
            &format!("http://{addr}"),
            &config.bot_token,
        ));
        let stats = Arc::new(UserStats::new());
        let controller = Arc::new(DownloadController::new(
            ControllerSettings::from_config(&config),
            Arc::new(FileManager::new(dir.path())),
            Arc::clone(&stats),
            Arc::new(TwoQualities),
            None,
            client.clone(),
        ));
        let bot = Bot::new(config, client, Arc::clone(&controller), stats);

        bot.on_link(77, 42, "https://www.youtube.com/watch?v=abc").await;

        let calls = calls.lock().unwrap().clone();
        assert!(
            calls
                .iter()
                .any(|(method, body)| method == "editMessageText" && body.get("reply_markup").is_some())
        );
        let (method, body) = calls.last().unwrap();
        assert_eq!(method, "editMessageText");
        assert!(body.get("reply_markup").is_none());
        assert_eq!(body["text"], messages::FORMAT_MENU_FAILED);

        let context = RequestContext {
            user_id: 42,
            chat_id: 77,
            status: MessageRef {
                chat_id: 77,
                message_id: 5,
            },
        };
        assert!(matches!(
            controller.select_format(context, 1, FormatChoice::Best).await,
            Err(DownloadError::SessionExpired)
        ));
    }

    #[test]
    fn origin_is_taken_from_message_or_callback() {
        let update: Update = serde_json::from_str(
            r#"{"update_id": 3, "callback_query": {"id": "c", "from": {"id": 9, "is_bot": false, "first_name": "B"},
                "message": {"message_id": 4, "chat": {"id": 90, "type": "private"}}, "data": "quality_9_1_best"}}"#,
        )
        .unwrap();

        let origin = UpdateOrigin::of(&update);

        assert_eq!(origin.user_id, Some(9));
        assert_eq!(origin.chat_id, Some(90));
        assert_eq!(origin.input, "quality_9_1_best");
    }
}
