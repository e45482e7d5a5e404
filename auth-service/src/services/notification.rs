//! Outbound email/SMS delivery through a bounded queue and a background dispatcher.

use async_trait::async_trait;
use backoff::future::retry;
use backoff::ExponentialBackoff;
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{SmsConfig, SmtpConfig};

#[derive(Debug, Clone, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
    pub html: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmsMessage {
    pub to: String,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Email(EmailMessage),
    Sms(SmsMessage),
}

impl OutboundMessage {
    fn kind(&self) -> &'static str {
        match self {
            OutboundMessage::Email(_) => "email",
            OutboundMessage::Sms(_) => "sms",
        }
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: &EmailMessage) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait SmsSender: Send + Sync {
    async fn send(&self, sms: &SmsMessage) -> Result<(), anyhow::Error>;
}

/// SMTP mailer (STARTTLS) on top of lettre's blocking transport.
#[derive(Clone)]
pub struct SmtpMailer {
    transport: SmtpTransport,
    from: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> Result<Self, anyhow::Error> {
        let creds = Credentials::new(config.user.clone(), config.password.clone());

        let transport = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| anyhow::anyhow!("Invalid SMTP relay {}: {}", config.host, e))?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, port = config.port, "SMTP mailer initialized");

        Ok(Self {
            transport,
            from: config.from.clone(),
        })
    }

    fn build(&self, email: &EmailMessage) -> Result<Message, anyhow::Error> {
        let builder = Message::builder()
            .from(self.from.parse()?)
            .to(email.to.parse()?)
            .subject(email.subject.clone());

        let message = match &email.html {
            Some(html) => builder.multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(email.text.clone()),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html.clone()),
                    ),
            )?,
            None => builder
                .header(ContentType::TEXT_PLAIN)
                .body(email.text.clone())?,
        };
        Ok(message)
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), anyhow::Error> {
        let message = self.build(email)?;

        // lettre's SmtpTransport blocks; keep it off the async workers.
        let transport = self.transport.clone();
        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| anyhow::anyhow!("Mail task failed: {}", e))?
            .map_err(|e| anyhow::anyhow!("SMTP send failed: {}", e))?;

        tracing::info!(to = %email.to, subject = %email.subject, "Email sent");
        Ok(())
    }
}

/// Used when no SMTP relay is configured.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), anyhow::Error> {
        tracing::info!(
            to = %email.to,
            subject = %email.subject,
            "SMTP not configured, email not sent"
        );
        tracing::debug!(to = %email.to, body = %email.text, "Unsent email body");
        Ok(())
    }
}

/// Posts `{to, text, from}` as JSON to an HTTP SMS gateway.
pub struct HttpSmsGateway {
    client: reqwest::Client,
    url: String,
}

impl HttpSmsGateway {
    pub fn new(url: &str) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl SmsSender for HttpSmsGateway {
    async fn send(&self, sms: &SmsMessage) -> Result<(), anyhow::Error> {
        self.client
            .post(&self.url)
            .json(sms)
            .send()
            .await?
            .error_for_status()?;
        tracing::info!(to = %sms.to, "SMS sent");
        Ok(())
    }
}

/// Used when no SMS gateway is configured.
pub struct LogSmsSender;

#[async_trait]
impl SmsSender for LogSmsSender {
    async fn send(&self, sms: &SmsMessage) -> Result<(), anyhow::Error> {
        tracing::info!(to = %sms.to, "SMS gateway not configured, SMS not sent");
        tracing::debug!(to = %sms.to, text = %sms.text, "Unsent SMS body");
        Ok(())
    }
}

/// Pick the SMS transport for the configuration.
pub fn sms_sender(config: &SmsConfig) -> Result<Arc<dyn SmsSender>, anyhow::Error> {
    Ok(match &config.gateway_url {
        Some(url) => Arc::new(HttpSmsGateway::new(url)?),
        None => Arc::new(LogSmsSender),
    })
}

/// Pick the mail transport for the configuration.
pub fn mailer(config: Option<&SmtpConfig>) -> Result<Arc<dyn Mailer>, anyhow::Error> {
    Ok(match config {
        Some(smtp) => Arc::new(SmtpMailer::new(smtp)?),
        None => Arc::new(LogMailer),
    })
}

/// Records everything it is asked to send. Can be told to fail the first N attempts.
#[derive(Default)]
pub struct MockMailer {
    pub sent: Mutex<Vec<EmailMessage>>,
    pub failures_remaining: AtomicUsize,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(times),
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: &EmailMessage) -> Result<(), anyhow::Error> {
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(anyhow::anyhow!("Mock mailer transient failure"));
        }
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock mailer mutex poisoned: {}", e))?
            .push(email.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MockSmsSender {
    pub sent: Mutex<Vec<SmsMessage>>,
}

impl MockSmsSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SmsMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl SmsSender for MockSmsSender {
    async fn send(&self, sms: &SmsMessage) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Mock SMS mutex poisoned: {}", e))?
            .push(sms.clone());
        Ok(())
    }
}

/// Producer side of the outbound queue.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<OutboundMessage>,
}

impl NotificationQueue {
    /// Queue a message without waiting. Fails when the queue is full or the dispatcher is gone.
    pub fn enqueue(&self, message: OutboundMessage) -> Result<(), anyhow::Error> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) => {
                anyhow::anyhow!("Notification queue full, dropping {}", m.kind())
            }
            mpsc::error::TrySendError::Closed(m) => {
                anyhow::anyhow!("Notification dispatcher stopped, dropping {}", m.kind())
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_elapsed: Duration::from_secs(60),
        }
    }
}

/// Consumer side: delivers each queued message, retrying with exponential backoff.
pub struct NotificationDispatcher {
    rx: mpsc::Receiver<OutboundMessage>,
    mailer: Arc<dyn Mailer>,
    sms: Arc<dyn SmsSender>,
    retry: RetryPolicy,
    shutdown_token: CancellationToken,
}

/// Create a connected queue/dispatcher pair.
pub fn notification_channel(
    queue_size: usize,
    mailer: Arc<dyn Mailer>,
    sms: Arc<dyn SmsSender>,
) -> (NotificationQueue, NotificationDispatcher) {
    let (tx, rx) = mpsc::channel(queue_size.max(1));
    (
        NotificationQueue { tx },
        NotificationDispatcher {
            rx,
            mailer,
            sms,
            retry: RetryPolicy::default(),
            shutdown_token: CancellationToken::new(),
        },
    )
}

impl NotificationDispatcher {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        tracing::info!("Notification dispatcher started");
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Notification dispatcher shutting down");
                    break;
                }
                message = self.rx.recv() => {
                    match message {
                        Some(message) => {
                            let mailer = self.mailer.clone();
                            let sms = self.sms.clone();
                            let policy = self.retry;
                            tokio::spawn(async move {
                                deliver(message, mailer, sms, policy).await;
                            });
                        }
                        None => {
                            tracing::info!("Notification queue closed, dispatcher exiting");
                            break;
                        }
                    }
                }
            }
        }
    }
}

async fn deliver(
    message: OutboundMessage,
    mailer: Arc<dyn Mailer>,
    sms: Arc<dyn SmsSender>,
    policy: RetryPolicy,
) {
    let backoff = ExponentialBackoff {
        initial_interval: policy.initial_interval,
        max_elapsed_time: Some(policy.max_elapsed),
        ..Default::default()
    };

    let result = retry(backoff, || async {
        let attempt = match &message {
            OutboundMessage::Email(email) => mailer.send(email).await,
            OutboundMessage::Sms(text) => sms.send(text).await,
        };
        attempt.map_err(|e| {
            tracing::warn!(kind = message.kind(), error = %e, "Delivery attempt failed");
            backoff::Error::transient(e)
        })
    })
    .await;

    if let Err(e) = result {
        tracing::error!(kind = message.kind(), error = %e, "Giving up on outbound message");
    }
}
