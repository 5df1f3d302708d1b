use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::{Captures, Regex};
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

use crate::database::email_events::EventData;
use crate::database::tracking_links::{self, Entity as TrackingLinks};
use crate::database::{apps, emails, queues};
use crate::error::{MailroomError, Result};
use crate::state::EmailStateStore;
use crate::utils::redact::anonymize_ip;

static HREF_RE: OnceLock<Regex> = OnceLock::new();

fn href_re() -> &'static Regex {
    HREF_RE.get_or_init(|| Regex::new(r#"href="(https?://[^"]+)""#).expect("href regex"))
}

const SHORT_CODE_LEN: usize = 10;

/// Open/click tracking support. The pixel and redirect HTTP endpoints live
/// outside this system; this service owns their write contract — link
/// rewriting at send time and the event writes they trigger.
pub struct TrackingService {
    db: Arc<DatabaseConnection>,
    state: Arc<EmailStateStore>,
    base_url: String,
    anonymize_ips: bool,
}

impl TrackingService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        state: Arc<EmailStateStore>,
        base_url: String,
        anonymize_ips: bool,
    ) -> Self {
        Self {
            db,
            state,
            base_url: base_url.trim_end_matches('/').to_string(),
            anonymize_ips,
        }
    }

    /// Replaces every absolute http(s) link with a short-code redirect and
    /// persists the mapping. Runs after personalization so substituted URLs
    /// are tracked too.
    pub async fn rewrite_links(&self, email_id: Uuid, html: &str) -> Result<String> {
        // Collect first: the regex pass is sync, the inserts are not.
        let originals: Vec<String> = href_re()
            .captures_iter(html)
            .map(|c| c[1].to_string())
            .collect();
        if originals.is_empty() {
            return Ok(html.to_string());
        }

        let mut codes = Vec::with_capacity(originals.len());
        for url in &originals {
            let code = generate_short_code();
            tracking_links::ActiveModel {
                id: Set(Uuid::now_v7()),
                email_id: Set(email_id),
                short_code: Set(code.clone()),
                original_url: Set(url.clone()),
                click_count: Set(0),
                created_at: Set(chrono::Utc::now()),
            }
            .insert(&*self.db)
            .await?;
            codes.push(code);
        }

        let mut index = 0;
        let rewritten = href_re().replace_all(html, |_caps: &Captures| {
            let replacement = format!(r#"href="{}/t/c/{}""#, self.base_url, codes[index]);
            index += 1;
            replacement
        });
        Ok(rewritten.into_owned())
    }

    /// Appends the 1x1 open pixel, keyed by email id.
    pub fn append_open_pixel(&self, email_id: Uuid, html: &str) -> String {
        let pixel = format!(
            r#"<img src="{}/t/o/{}.png" width="1" height="1" alt="" style="display:none">"#,
            self.base_url, email_id
        );
        match html.rfind("</body>") {
            Some(pos) => {
                let mut out = String::with_capacity(html.len() + pixel.len());
                out.push_str(&html[..pos]);
                out.push_str(&pixel);
                out.push_str(&html[pos..]);
                out
            }
            None => format!("{html}{pixel}"),
        }
    }

    /// Write contract of the pixel endpoint: append an `opened` event and
    /// fan out.
    pub async fn record_open(
        &self,
        email_id: Uuid,
        ip: Option<String>,
        user_agent: Option<String>,
    ) -> Result<()> {
        let (app, queue, email) = self.load_context(email_id).await?;
        let event = EventData::Opened {
            ip: ip.map(|ip| self.maybe_anonymize(&ip)),
            user_agent,
        };
        self.state
            .record_engagement(&app, Some(&queue.name), &email, event)
            .await
    }

    /// Write contract of the redirect endpoint: bump the counter, append a
    /// `clicked` event, and hand back the original URL for the redirect.
    pub async fn record_click(&self, short_code: &str, ip: Option<String>) -> Result<String> {
        let link = TrackingLinks::find()
            .filter(tracking_links::Column::ShortCode.eq(short_code))
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                MailroomError::EmailNotFound(format!("tracking link {short_code}"))
            })?;

        let original_url = link.original_url.clone();
        let email_id = link.email_id;
        let clicks = link.click_count + 1;
        let mut active: tracking_links::ActiveModel = link.into();
        active.click_count = Set(clicks);
        active.update(&*self.db).await?;

        let (app, queue, email) = self.load_context(email_id).await?;
        let event = EventData::Clicked {
            url: original_url.clone(),
            ip: ip.map(|ip| self.maybe_anonymize(&ip)),
        };
        self.state
            .record_engagement(&app, Some(&queue.name), &email, event)
            .await?;

        Ok(original_url)
    }

    async fn load_context(
        &self,
        email_id: Uuid,
    ) -> Result<(apps::Model, queues::Model, emails::Model)> {
        let email = emails::Entity::find_by_id(email_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailroomError::EmailNotFound(email_id.to_string()))?;
        let app = apps::Entity::find_by_id(email.app_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailroomError::AppNotFound(email.app_id.to_string()))?;
        let queue = queues::Entity::find_by_id(email.queue_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| MailroomError::QueueNotFound(email.queue_id.to_string()))?;
        Ok((app, queue, email))
    }

    fn maybe_anonymize(&self, ip: &str) -> String {
        if self.anonymize_ips {
            anonymize_ip(ip)
        } else {
            ip.to_string()
        }
    }
}

fn generate_short_code() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SHORT_CODE_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueBroker;
    use crate::crypto::EncryptionService;
    use crate::database::establish_connection;
    use crate::metrics::Metrics;
    use crate::webhook::WebhookDispatcher;
    use sea_orm::ActiveModelBehavior;

    async fn service() -> (TrackingService, apps::Model, queues::Model, emails::Model) {
        let db = Arc::new(establish_connection("sqlite::memory:").await.unwrap());
        let metrics = Arc::new(Metrics::new());
        let broker = Arc::new(QueueBroker::new(db.clone()));
        let dispatcher = Arc::new(WebhookDispatcher::new(
            db.clone(),
            broker,
            EncryptionService::new(&[0u8; 32]),
            metrics.clone(),
        ));
        let state = Arc::new(EmailStateStore::new(db.clone(), dispatcher, metrics));

        let app = apps::ActiveModel {
            name: Set("acme".to_string()),
            ..apps::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();
        let queue = queues::ActiveModel {
            app_id: Set(app.id),
            name: Set("transactional".to_string()),
            ..queues::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();
        let email = emails::ActiveModel {
            app_id: Set(app.id),
            queue_id: Set(queue.id),
            from_email: Set("a@x.io".to_string()),
            to: Set(serde_json::json!([{"email": "b@y.io"}])),
            subject: Set("hi".to_string()),
            html_body: Set(Some("<p>hi</p>".to_string())),
            ..emails::ActiveModel::new()
        }
        .insert(&*db)
        .await
        .unwrap();

        let service = TrackingService::new(
            db,
            state,
            "https://t.example.com/".to_string(),
            false,
        );
        (service, app, queue, email)
    }

    #[tokio::test]
    async fn test_rewrite_links_creates_rows_and_short_urls() {
        let (service, _, _, email) = service().await;
        let html = r#"<a href="https://shop.example.com/a">A</a> <a href="http://x.io/b">B</a> <a href="mailto:me@x.io">m</a>"#;
        let rewritten = service.rewrite_links(email.id, html).await.unwrap();

        assert!(!rewritten.contains("shop.example.com"));
        assert!(rewritten.contains("https://t.example.com/t/c/"));
        // mailto survives untouched
        assert!(rewritten.contains("mailto:me@x.io"));

        let links = TrackingLinks::find().all(&*service.db).await.unwrap();
        assert_eq!(links.len(), 2);
    }

    #[tokio::test]
    async fn test_click_bumps_counter_and_returns_target() {
        let (service, _, _, email) = service().await;
        let html = r#"<a href="https://shop.example.com/a">A</a>"#;
        service.rewrite_links(email.id, html).await.unwrap();

        let link = TrackingLinks::find().one(&*service.db).await.unwrap().unwrap();
        let target = service
            .record_click(&link.short_code, Some("203.0.113.9".to_string()))
            .await
            .unwrap();
        assert_eq!(target, "https://shop.example.com/a");

        let link = TrackingLinks::find_by_id(link.id)
            .one(&*service.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.click_count, 1);

        let events = service.state.list_events(email.id).await.unwrap();
        assert_eq!(events[0].event_type, "clicked");
    }

    #[tokio::test]
    async fn test_open_pixel_lands_before_body_close() {
        let (service, _, _, email) = service().await;
        let html = "<html><body><p>hi</p></body></html>";
        let with_pixel = service.append_open_pixel(email.id, html);
        let pixel_pos = with_pixel.find("/t/o/").unwrap();
        let body_pos = with_pixel.find("</body>").unwrap();
        assert!(pixel_pos < body_pos);
    }

    #[tokio::test]
    async fn test_record_open_appends_event() {
        let (service, _, _, email) = service().await;
        service
            .record_open(email.id, Some("198.51.100.7".to_string()), None)
            .await
            .unwrap();
        let events = service.state.list_events(email.id).await.unwrap();
        assert_eq!(events[0].event_type, "opened");
    }
}
