//! SMTP email notifier via `lettre` with TLS support.

use crate::traits::{Notification, Notifier, NotifyError};
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};

/// Sends notifications as emails via SMTP.
#[derive(Debug)]
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    /// Build an `EmailNotifier` from SMTP configuration.
    ///
    /// - `smtp_port`: defaults to 587.
    /// - `tls`: `None` or `Some(true)` enables STARTTLS; port 465 always uses
    ///   implicit TLS regardless of this flag.
    /// - `from`: sender, e.g. `"BilboMD <noreply@example.com>"`.
    ///
    /// SMTP credentials are resolved from the `SMTP_USERNAME` and `SMTP_PASSWORD`
    /// environment variables. If both are set, they are passed to the transport;
    /// otherwise the connection is unauthenticated.
    pub fn from_config(
        smtp_host: &str,
        smtp_port: Option<u16>,
        tls: Option<bool>,
        from: &str,
    ) -> Result<Self, NotifyError> {
        let from: Mailbox = parse_mailbox(from)?;
        let port = smtp_port.unwrap_or(587);

        let mut builder = if port == 465 {
            AsyncSmtpTransport::<Tokio1Executor>::relay(smtp_host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(port)
        } else if tls.unwrap_or(true) {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(smtp_host)
                .map_err(|e| NotifyError::Config(e.to_string()))?
                .port(port)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(smtp_host).port(port)
        };

        if let (Ok(username), Ok(password)) =
            (std::env::var("SMTP_USERNAME"), std::env::var("SMTP_PASSWORD"))
        {
            builder = builder.credentials(Credentials::new(username, password));
        }

        Ok(Self { transport: builder.build(), from })
    }
}

fn parse_mailbox(addr: &str) -> Result<Mailbox, NotifyError> {
    addr.parse()
        .map_err(|e: lettre::address::AddressError| NotifyError::Config(format!("{addr}: {e}")))
}

#[async_trait::async_trait]
impl Notifier for EmailNotifier {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let to = parse_mailbox(&notification.recipient)?;
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(&notification.subject)
            .body(notification.body.clone())
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map_err(|e| NotifyError::Smtp(e.to_string()))?;

        tracing::info!(
            channel = "email",
            subject = %notification.subject,
            "notification delivered"
        );
        Ok(())
    }

    fn channel_name(&self) -> &str {
        "email"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_valid() {
        let notifier = EmailNotifier::from_config("smtp.example.com", Some(587), Some(true), "bilbomd@example.com");
        assert!(notifier.is_ok());
    }

    #[test]
    fn from_config_accepts_display_name() {
        let notifier = EmailNotifier::from_config("smtp.example.com", None, None, "BilboMD <bilbomd@example.com>");
        assert!(notifier.is_ok());
    }

    #[test]
    fn from_config_invalid_from_address() {
        let err = EmailNotifier::from_config("smtp.example.com", None, None, "bad-address").unwrap_err();
        assert!(err.to_string().contains("Configuration error"), "got: {err}");
    }

    #[test]
    fn implicit_tls_and_plain_ports_build() {
        assert!(EmailNotifier::from_config("smtp.example.com", Some(465), None, "a@example.com").is_ok());
        assert!(EmailNotifier::from_config("localhost", Some(25), Some(false), "a@example.com").is_ok());
    }

    #[tokio::test]
    async fn invalid_recipient_fails_before_connecting() {
        let notifier = EmailNotifier::from_config("localhost", Some(25), Some(false), "a@example.com").unwrap();
        let result = notifier
            .send(&Notification {
                recipient: "not-an-email".into(),
                subject: "s".into(),
                body: "b".into(),
            })
            .await;
        assert!(matches!(result, Err(NotifyError::Config(_))));
    }

    #[test]
    fn channel_name_is_email() {
        let notifier = EmailNotifier::from_config("smtp.example.com", None, None, "a@example.com").unwrap();
        assert_eq!(notifier.channel_name(), "email");
    }
}
