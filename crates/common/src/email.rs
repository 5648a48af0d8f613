//! Email dispatcher (C4). Grounded in the `lettre` usage seen across the
//! wider example pack (flowcatalyst, GeneralBots) rather than the teacher,
//! which has no outbound-mail concern at all.

use anyhow::{Context, Result};
use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Thin wrapper around an `AsyncSmtpTransport`; kept concrete (not a
/// trait) for the same reason `mq::Queue` is concrete — this workspace
/// selects backends at compile/construction time, not via `dyn Trait`.
#[derive(Clone)]
pub struct EmailDispatcher {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl EmailDispatcher {
    pub fn new(smtp_host: &str, username: &str, password: &str, from: &str) -> Result<Self> {
        let creds = Credentials::new(username.to_string(), password.to_string());
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)
            .with_context(|| format!("invalid smtp relay host: {smtp_host}"))?
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            from: from.to_string(),
        })
    }

    pub async fn send(&self, msg: EmailMessage) -> Result<()> {
        let email = Message::builder()
            .from(self.from.parse().context("invalid from address")?)
            .to(msg.to.parse().context("invalid to address")?)
            .subject(msg.subject)
            .header(ContentType::TEXT_PLAIN)
            .body(msg.body)
            .context("failed to build email")?;

        self.transport
            .send(email)
            .await
            .context("smtp send failed")?;
        Ok(())
    }
}
