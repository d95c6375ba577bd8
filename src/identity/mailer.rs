use async_trait::async_trait;

use super::AuthError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MailKind {
    EmailVerification,
    PasswordReset,
}

#[derive(Clone)]
pub struct OutgoingMail {
    pub to: String,
    pub kind: MailKind,
    pub link: String,
    /// Raw one-time token embedded in `link`.
    pub token: String,
}

impl OutgoingMail {
    /// `link` with the one-time token masked, safe for logs.
    pub fn redacted_link(&self) -> String {
        if self.token.is_empty() {
            return self.link.clone();
        }
        self.link.replace(&self.token, "[redacted]")
    }
}

impl std::fmt::Debug for OutgoingMail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMail")
            .field("to", &self.to)
            .field("kind", &self.kind)
            .field("link", &self.redacted_link())
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: OutgoingMail) -> Result<(), AuthError>;
}

/// Writes outgoing mail to the log instead of an SMTP relay.
///
/// The usable link is a bearer credential and only appears at debug level.
#[derive(Debug, Default, Clone)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: OutgoingMail) -> Result<(), AuthError> {
        tracing::info!(to = %mail.to, kind = ?mail.kind, link = %mail.redacted_link(), "outgoing mail");
        tracing::debug!(to = %mail.to, link = %mail.link, "outgoing mail link");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_mail() -> OutgoingMail {
        OutgoingMail {
            to: "ops@example.com".into(),
            kind: MailKind::PasswordReset,
            link: "https://shop.example/reset-password?token=s3cr3tT0ken".into(),
            token: "s3cr3tT0ken".into(),
        }
    }

    #[test]
    fn redacted_link_masks_the_token() {
        let mail = reset_mail();
        assert_eq!(mail.redacted_link(), "https://shop.example/reset-password?token=[redacted]");
        assert!(!format!("{:?}", mail).contains("s3cr3tT0ken"));
    }

    #[tokio::test]
    async fn log_mailer_accepts_mail() {
        assert!(LogMailer.send(reset_mail()).await.is_ok());
    }
}
