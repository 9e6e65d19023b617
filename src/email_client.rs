use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, Secret};
use std::collections::HashMap;
use std::time;

use crate::domain::subscriber_email::SubscriberEmail;

const REQUEST_TIMEOUT: time::Duration = time::Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum EmailError {
    #[error("Failed to build the HTTP client.")]
    Client(#[source] reqwest::Error),
    #[error("Email provider rejected the request.")]
    Delivery(#[from] reqwest::Error),
}

/// One rendered email.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailPayload {
    pub to: String,
    /// Either a bare address or `Display Name <address>`. The client's default
    /// sender is used when empty.
    pub from: String,
    pub subject: String,
    pub html_body: String,
    pub text_body: String,
}

/// Where a marketing recipient can opt out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    /// Mailbox for `mailto:` unsubscribe requests.
    pub email: String,
    pub link: String,
}

impl Unsubscribe {
    fn headers(&self) -> HashMap<String, String> {
        HashMap::from([
            (
                String::from("List-Unsubscribe"),
                format!("<{}>, <mailto:{}>", self.link, self.email),
            ),
            (
                String::from("List-Unsubscribe-Post"),
                String::from("List-Unsubscribe=One-Click"),
            ),
        ])
    }
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send_transactional(&self, payload: &EmailPayload) -> Result<(), EmailError>;

    /// Bulk email: adds the one-click unsubscribe headers.
    async fn send_marketing(
        &self,
        payload: &EmailPayload,
        unsubscribe: &Unsubscribe,
    ) -> Result<(), EmailError>;
}

pub struct EmailClient {
    http_client: Client,
    base_url: String,
    sender: SubscriberEmail,
    api_key: Secret<String>,
}

#[derive(serde::Serialize)]
pub struct SendEmailBody {
    personalizations: Vec<SengridPersonalization>,
    from: SengridEmail,
    subject: String,
    content: Vec<SengridContent>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    headers: HashMap<String, String>,
}

#[derive(serde::Serialize)]
struct SengridEmail {
    email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(serde::Serialize)]
struct SengridPersonalization {
    to: Vec<SengridEmail>,
}

#[derive(serde::Serialize)]
struct SengridContent {
    #[serde(rename = "type")]
    content_type: String,
    value: String,
}

impl SengridEmail {
    fn parse(mailbox: &str) -> SengridEmail {
        let mailbox = mailbox.trim();

        match (mailbox.rfind('<'), mailbox.ends_with('>')) {
            (Some(start), true) => {
                let name = mailbox[..start].trim().trim_matches('"');
                SengridEmail {
                    email: String::from(&mailbox[start + 1..mailbox.len() - 1]),
                    name: (!name.is_empty()).then(|| String::from(name)),
                }
            }
            _ => SengridEmail {
                email: String::from(mailbox),
                name: None,
            },
        }
    }
}

impl EmailClient {
    pub fn new(
        base_url: String,
        sender: SubscriberEmail,
        api_key: Secret<String>,
        timeout: Option<time::Duration>,
    ) -> Result<EmailClient, EmailError> {
        let http_client = Client::builder()
            .timeout(timeout.unwrap_or(REQUEST_TIMEOUT))
            .build()
            .map_err(EmailError::Client)?;

        Ok(EmailClient {
            http_client,
            base_url,
            sender,
            api_key,
        })
    }

    async fn send(
        &self,
        payload: &EmailPayload,
        headers: HashMap<String, String>,
    ) -> Result<(), EmailError> {
        let url = format!("{}/mail/send", self.base_url);
        let from = if payload.from.trim().is_empty() {
            self.sender.as_ref()
        } else {
            payload.from.as_str()
        };
        // text/plain has to come before text/html.
        let body = SendEmailBody {
            from: SengridEmail::parse(from),
            personalizations: vec![SengridPersonalization {
                to: vec![SengridEmail::parse(&payload.to)],
            }],
            subject: payload.subject.clone(),
            content: vec![
                SengridContent {
                    content_type: String::from("text/plain"),
                    value: payload.text_body.clone(),
                },
                SengridContent {
                    content_type: String::from("text/html"),
                    value: payload.html_body.clone(),
                },
            ],
            headers,
        };

        self.http_client
            .post(&url)
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&body)
            .send()
            .await?
            .error_for_status()?; // return an error when server response status code is 4xx or 5xx

        Ok(())
    }
}

#[async_trait]
impl EmailTransport for EmailClient {
    #[tracing::instrument(name = "Sending a transactional email", skip(self, payload))]
    async fn send_transactional(&self, payload: &EmailPayload) -> Result<(), EmailError> {
        self.send(payload, HashMap::new()).await
    }

    #[tracing::instrument(name = "Sending a marketing email", skip(self, payload, unsubscribe))]
    async fn send_marketing(
        &self,
        payload: &EmailPayload,
        unsubscribe: &Unsubscribe,
    ) -> Result<(), EmailError> {
        self.send(payload, unsubscribe.headers()).await
    }
}
