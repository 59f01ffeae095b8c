//! Delivery actuator contract + the Telegram Bot API implementation.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::debug;
use yahnc_core::{
    news_url, telegram_api_url, DeliveryRecord, IneligibleReason, ItemId, MessageId,
    StorySnapshot, NUM_COMMENTS_THRESHOLD, SCORE_THRESHOLD,
};
use yahnc_storage::{FetchError, HackerNewsFeed, HnItem, HttpFetcher};

pub const CRATE_NAME: &str = "yahnc-actuator";

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{method} rejected ({code:?}): {description}")]
    Api {
        method: String,
        code: Option<i64>,
        description: String,
    },
    #[error("unexpected {method} response: {reason}")]
    Decode { method: String, reason: String },
    #[error("item {0} has no message to act on")]
    NoMessage(ItemId),
}

/// Result of one send/edit/delete against the chat backend.
#[derive(Debug)]
pub enum Actuation {
    Delivered(MessageId),
    /// The item is not eligible; nothing must be recorded.
    Ineligible(IneligibleReason),
    Failed(ActuatorError),
}

impl Actuation {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered(_))
    }
}

#[async_trait]
pub trait DeliveryActuator: Send + Sync {
    /// Post a new message. On success `record.message_id` holds the new id.
    async fn send(&self, record: &mut DeliveryRecord) -> Actuation;

    /// Rewrite the existing message with current item details.
    async fn edit(&self, record: &mut DeliveryRecord) -> Actuation;

    async fn delete(&self, record: &DeliveryRecord) -> Actuation;
}

/// Decide whether an item may be posted, capturing the fields the message shows.
pub fn check_eligibility(item: Option<&HnItem>) -> Result<StorySnapshot, IneligibleReason> {
    let item = item.ok_or(IneligibleReason::Missing)?;
    if item.deleted {
        return Err(IneligibleReason::Deleted);
    }
    if item.dead {
        return Err(IneligibleReason::Dead);
    }
    let score = item.score.unwrap_or(0);
    if score < SCORE_THRESHOLD {
        return Err(IneligibleReason::LowScore { score });
    }
    let descendants = item.descendants.unwrap_or(0);
    if descendants < NUM_COMMENTS_THRESHOLD {
        return Err(IneligibleReason::FewComments { descendants });
    }
    Ok(StorySnapshot {
        title: item.title.clone().unwrap_or_default(),
        url: item.url.clone(),
        score,
        descendants,
        by: item.by.clone(),
        time: item.time,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutgoingMessage {
    pub text: String,
    pub reply_markup: JsonValue,
}

pub fn render_message(item_id: ItemId, story: &StorySnapshot) -> OutgoingMessage {
    let discussion = news_url(item_id);
    let link = story.url.clone().unwrap_or_else(|| discussion.clone());
    let text = format!(
        "{}\n\nScore: {}+ | Comments: {}+\n{}",
        story.title, story.score, story.descendants, link
    );
    let reply_markup = json!({
        "inline_keyboard": [[
            { "text": "Read", "url": link },
            { "text": "Comments", "url": discussion },
        ]]
    });
    OutgoingMessage { text, reply_markup }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    /// `bot<token>` path segment.
    pub bot_key: String,
    pub chat_id: String,
}

#[derive(Debug, Deserialize)]
struct TelegramResponse {
    ok: bool,
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
}

const NOT_MODIFIED: &str = "message is not modified";
const DELETE_NOT_FOUND: &str = "message to delete not found";

pub struct TelegramActuator {
    feed: HackerNewsFeed,
    http: Arc<HttpFetcher>,
    config: TelegramConfig,
}

impl TelegramActuator {
    pub fn new(feed: HackerNewsFeed, http: Arc<HttpFetcher>, config: TelegramConfig) -> Self {
        Self { feed, http, config }
    }

    async fn eligible_story(
        &self,
        item_id: ItemId,
    ) -> Result<Result<StorySnapshot, IneligibleReason>, ActuatorError> {
        let item = self.feed.item(item_id).await?;
        Ok(check_eligibility(item.as_ref()))
    }

    async fn call(&self, method: &str, body: &JsonValue) -> Result<JsonValue, ActuatorError> {
        let url = telegram_api_url(&self.config.api_base, &self.config.bot_key, method);
        let resp = self.http.post_json(&url, body).await?;
        let parsed: TelegramResponse =
            serde_json::from_slice(&resp.body).map_err(|err| ActuatorError::Decode {
                method: method.to_string(),
                reason: format!("status {}: {err}", resp.status),
            })?;
        if parsed.ok {
            Ok(parsed.result.unwrap_or(JsonValue::Bool(true)))
        } else {
            Err(ActuatorError::Api {
                method: method.to_string(),
                code: parsed.error_code,
                description: parsed.description.unwrap_or_default(),
            })
        }
    }
}

fn description_contains(err: &ActuatorError, needle: &str) -> bool {
    matches!(err, ActuatorError::Api { description, .. } if description.contains(needle))
}

#[async_trait]
impl DeliveryActuator for TelegramActuator {
    async fn send(&self, record: &mut DeliveryRecord) -> Actuation {
        let story = match self.eligible_story(record.item_id).await {
            Ok(Ok(story)) => story,
            Ok(Err(reason)) => return Actuation::Ineligible(reason),
            Err(err) => return Actuation::Failed(err),
        };
        let message = render_message(record.item_id, &story);
        let body = json!({
            "chat_id": self.config.chat_id,
            "text": message.text,
            "disable_web_page_preview": false,
            "reply_markup": message.reply_markup,
        });
        let result = match self.call("sendMessage", &body).await {
            Ok(result) => result,
            Err(err) => return Actuation::Failed(err),
        };
        match result.get("message_id").and_then(JsonValue::as_i64) {
            Some(id) => {
                record.message_id = MessageId(id);
                record.story = Some(story);
                Actuation::Delivered(record.message_id)
            }
            None => Actuation::Failed(ActuatorError::Decode {
                method: "sendMessage".into(),
                reason: "missing result.message_id".into(),
            }),
        }
    }

    async fn edit(&self, record: &mut DeliveryRecord) -> Actuation {
        if record.message_id.is_unsent() {
            return Actuation::Failed(ActuatorError::NoMessage(record.item_id));
        }
        let story = match self.eligible_story(record.item_id).await {
            Ok(Ok(story)) => story,
            Ok(Err(reason)) => return Actuation::Ineligible(reason),
            Err(err) => return Actuation::Failed(err),
        };
        let message = render_message(record.item_id, &story);
        let body = json!({
            "chat_id": self.config.chat_id,
            "message_id": record.message_id.get(),
            "text": message.text,
            "reply_markup": message.reply_markup,
        });
        match self.call("editMessageText", &body).await {
            Ok(_) => {}
            Err(err) if description_contains(&err, NOT_MODIFIED) => {
                debug!(item_id = %record.item_id, "message unchanged");
            }
            Err(err) => return Actuation::Failed(err),
        }
        record.story = Some(story);
        Actuation::Delivered(record.message_id)
    }

    async fn delete(&self, record: &DeliveryRecord) -> Actuation {
        if record.message_id.is_unsent() {
            return Actuation::Failed(ActuatorError::NoMessage(record.item_id));
        }
        let body = json!({
            "chat_id": self.config.chat_id,
            "message_id": record.message_id.get(),
        });
        match self.call("deleteMessage", &body).await {
            Ok(_) => Actuation::Delivered(record.message_id),
            Err(err) if description_contains(&err, DELETE_NOT_FOUND) => {
                debug!(item_id = %record.item_id, "message already gone");
                Actuation::Delivered(record.message_id)
            }
            Err(err) => Actuation::Failed(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use std::time::Duration;
    use yahnc_storage::{HttpClientConfig, RetryPolicy};

    fn item(score: i64, descendants: i64) -> HnItem {
        HnItem {
            id: 8863,
            title: Some("My YC app: Dropbox".into()),
            url: Some("http://www.getdropbox.com/u/2/screencast.html".into()),
            score: Some(score),
            descendants: Some(descendants),
            by: Some("dhouston".into()),
            kind: Some("story".into()),
            ..Default::default()
        }
    }

    fn actuator(server: &ServerGuard) -> TelegramActuator {
        actuator_at(server.url(), Duration::from_secs(5))
    }

    fn actuator_at(base: String, timeout: Duration) -> TelegramActuator {
        let http = Arc::new(
            HttpFetcher::new(HttpClientConfig {
                timeout,
                retry: RetryPolicy::retrying(0),
                ..Default::default()
            })
            .unwrap(),
        );
        let feed = HackerNewsFeed::new(Arc::clone(&http), format!("{base}/v0/"));
        TelegramActuator::new(
            feed,
            http,
            TelegramConfig {
                api_base: format!("{base}/"),
                bot_key: "bot1:test".into(),
                chat_id: "@yahnc".into(),
            },
        )
    }

    async fn serve_item(server: &mut ServerGuard, body: &str) {
        server
            .mock("GET", "/v0/item/8863.json")
            .with_body(body)
            .create_async()
            .await;
    }

    #[test]
    fn thresholds_gate_eligibility() {
        assert!(check_eligibility(Some(&item(50, 5))).is_ok());
        assert_eq!(
            check_eligibility(Some(&item(49, 100))),
            Err(IneligibleReason::LowScore { score: 49 })
        );
        assert_eq!(
            check_eligibility(Some(&item(500, 4))),
            Err(IneligibleReason::FewComments { descendants: 4 })
        );
        assert_eq!(check_eligibility(None), Err(IneligibleReason::Missing));

        let mut dead = item(500, 50);
        dead.dead = true;
        assert_eq!(check_eligibility(Some(&dead)), Err(IneligibleReason::Dead));
    }

    #[test]
    fn self_posts_link_to_discussion() {
        let story = StorySnapshot {
            title: "Ask HN: Anything".into(),
            url: None,
            score: 120,
            descendants: 40,
            ..Default::default()
        };
        let message = render_message(ItemId(42), &story);
        assert!(message.text.starts_with("Ask HN: Anything\n\nScore: 120+ | Comments: 40+"));
        assert!(message.text.ends_with("https://news.ycombinator.com/item?id=42"));
        assert_eq!(
            message.reply_markup["inline_keyboard"][0][1]["url"],
            "https://news.ycombinator.com/item?id=42"
        );
    }

    #[tokio::test]
    async fn send_fills_message_id() {
        let mut server = Server::new_async().await;
        serve_item(
            &mut server,
            r#"{"id":8863,"score":111,"descendants":71,"title":"My YC app: Dropbox","type":"story"}"#,
        )
        .await;
        let send = server
            .mock("POST", "/bot1:test/sendMessage")
            .match_body(Matcher::PartialJson(json!({"chat_id": "@yahnc"})))
            .with_body(r#"{"ok":true,"result":{"message_id":555}}"#)
            .create_async()
            .await;

        let mut record = DeliveryRecord::unsent(ItemId(8863));
        let outcome = actuator(&server).send(&mut record).await;

        assert!(matches!(outcome, Actuation::Delivered(MessageId(555))));
        assert_eq!(record.message_id, MessageId(555));
        assert_eq!(record.story.as_ref().unwrap().score, 111);
        send.assert_async().await;
    }

    #[tokio::test]
    async fn low_score_is_ineligible_without_posting() {
        let mut server = Server::new_async().await;
        serve_item(&mut server, r#"{"id":8863,"score":3,"descendants":71}"#).await;
        let send = server
            .mock("POST", "/bot1:test/sendMessage")
            .expect(0)
            .create_async()
            .await;

        let mut record = DeliveryRecord::unsent(ItemId(8863));
        let outcome = actuator(&server).send(&mut record).await;

        assert!(matches!(
            outcome,
            Actuation::Ineligible(IneligibleReason::LowScore { score: 3 })
        ));
        assert!(record.message_id.is_unsent());
        send.assert_async().await;
    }

    #[tokio::test]
    async fn unmodified_edit_counts_as_delivered() {
        let mut server = Server::new_async().await;
        serve_item(&mut server, r#"{"id":8863,"score":111,"descendants":71}"#).await;
        server
            .mock("POST", "/bot1:test/editMessageText")
            .with_status(400)
            .with_body(
                r#"{"ok":false,"error_code":400,"description":"Bad Request: message is not modified: specified new message content and reply markup are exactly the same"}"#,
            )
            .create_async()
            .await;

        let mut record = DeliveryRecord::with_message(ItemId(8863), MessageId(77));
        let outcome = actuator(&server).edit(&mut record).await;
        assert!(matches!(outcome, Actuation::Delivered(MessageId(77))));
    }

    #[tokio::test]
    async fn api_rejection_is_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/bot1:test/deleteMessage")
            .with_status(403)
            .with_body(r#"{"ok":false,"error_code":403,"description":"Forbidden: bot was kicked"}"#)
            .create_async()
            .await;

        let record = DeliveryRecord::with_message(ItemId(8863), MessageId(77));
        let outcome = actuator(&server).delete(&record).await;
        assert!(matches!(
            outcome,
            Actuation::Failed(ActuatorError::Api { code: Some(403), .. })
        ));
    }

    #[tokio::test]
    async fn deleting_a_gone_message_succeeds() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/bot1:test/deleteMessage")
            .with_status(400)
            .with_body(r#"{"ok":false,"error_code":400,"description":"Bad Request: message to delete not found"}"#)
            .create_async()
            .await;

        let record = DeliveryRecord::with_message(ItemId(8863), MessageId(77));
        assert!(actuator(&server).delete(&record).await.is_delivered());
    }

    #[tokio::test]
    async fn edit_without_message_fails_fast() {
        let server = Server::new_async().await;
        let mut record = DeliveryRecord::unsent(ItemId(8863));
        assert!(matches!(
            actuator(&server).edit(&mut record).await,
            Actuation::Failed(ActuatorError::NoMessage(ItemId(8863)))
        ));
    }

    #[tokio::test]
    async fn stalled_item_read_fails_send() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut record = DeliveryRecord::unsent(ItemId(8863));
        let outcome = actuator_at(base, Duration::from_millis(100))
            .send(&mut record)
            .await;

        assert!(matches!(
            outcome,
            Actuation::Failed(ActuatorError::Fetch(ref err)) if err.is_timeout()
        ));
        assert!(record.message_id.is_unsent());
    }
}
