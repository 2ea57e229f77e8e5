use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

use crate::config::MailConfig;
use crate::metrics::EMAILS_SENT_TOTAL;

/// Transactional mail over SMTP. All sends honor the EMAIL_SEND_DISABLED
/// kill switch and report per-kind success/error/skipped metrics.
pub struct EmailService {
    config: MailConfig,
}

impl EmailService {
    pub fn new(config: MailConfig) -> Self {
        Self { config }
    }

    pub fn sending_disabled() -> bool {
        std::env::var("EMAIL_SEND_DISABLED")
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
    }

    /// The initial "you have a new assignment" email carrying the play link.
    pub async fn send_assignment_invitation(
        &self,
        recipient_email: &str,
        recipient_name: &str,
        game_title: &str,
        deadline: DateTime<Utc>,
        play_link: &str,
    ) -> Result<()> {
        let subject = format!("New assignment: {}", game_title);
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your teacher assigned you <strong>{}</strong>.</p>\
             <p>Please complete it by <strong>{}</strong>.</p>\
             <p><a href=\"{}\">Start playing</a></p>\
             <p>If the button does not work, copy this link into your browser:<br>{}</p>",
            recipient_name,
            game_title,
            deadline.format("%Y-%m-%d %H:%M UTC"),
            play_link,
            play_link
        );

        self.send_html("assignment", recipient_email, recipient_name, &subject, &html)
            .await
    }

    /// Reminder for an assignment whose deadline falls within the next day.
    pub async fn send_deadline_reminder(
        &self,
        recipient_email: &str,
        recipient_name: &str,
        game_title: &str,
        deadline: DateTime<Utc>,
        remaining: i32,
        play_link: &str,
    ) -> Result<()> {
        let subject = format!("Reminder: {} is due soon", game_title);
        let remaining_line = if remaining > 0 {
            format!("You still have {} play-through(s) to finish.", remaining)
        } else {
            "You are almost there.".to_string()
        };
        let html = format!(
            "<p>Hi {},</p>\
             <p>Your assignment <strong>{}</strong> is due {}.</p>\
             <p>{}</p>\
             <p><a href=\"{}\">Continue playing</a></p>",
            recipient_name,
            game_title,
            deadline.format("%Y-%m-%d %H:%M UTC"),
            remaining_line,
            play_link
        );

        self.send_html("reminder", recipient_email, recipient_name, &subject, &html)
            .await
    }

    /// One-time sign-in link for the re-authentication challenge.
    pub async fn send_signin_link(
        &self,
        recipient_email: &str,
        recipient_name: &str,
        signin_link: &str,
    ) -> Result<()> {
        let subject = "Your sign-in link for Verse Learning";
        let html = format!(
            "<p>Hi {},</p>\
             <p>Use this link to confirm it is you and return to your assignment:</p>\
             <p><a href=\"{}\">Sign in and play</a></p>\
             <p>The link works once and expires shortly. If you did not request it,\
             you can ignore this email.</p>",
            recipient_name, signin_link
        );

        self.send_html("signin", recipient_email, recipient_name, subject, &html)
            .await
    }

    async fn send_html(
        &self,
        kind: &str,
        recipient_email: &str,
        recipient_name: &str,
        subject: &str,
        html: &str,
    ) -> Result<()> {
        if Self::sending_disabled() {
            tracing::info!(
                "EMAIL_SEND_DISABLED is set, skipping {} email to {}",
                kind,
                recipient_email
            );
            EMAILS_SENT_TOTAL
                .with_label_values(&[kind, "skipped"])
                .inc();
            return Ok(());
        }

        let result = self
            .deliver(recipient_email, recipient_name, subject, html)
            .await;

        let status = if result.is_ok() { "success" } else { "error" };
        EMAILS_SENT_TOTAL.with_label_values(&[kind, status]).inc();

        result
    }

    async fn deliver(
        &self,
        recipient_email: &str,
        recipient_name: &str,
        subject: &str,
        html: &str,
    ) -> Result<()> {
        let email = build_message(
            &self.config.from_name,
            &self.config.from_email,
            recipient_name,
            recipient_email,
            subject,
            html,
        )?;

        let mailer = self.build_mailer()?;
        mailer.send(email).await.context("Failed to send email")?;

        Ok(())
    }

    fn build_mailer(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>> {
        let creds = Credentials::new(
            self.config.smtp_username.clone(),
            self.config.smtp_password.clone(),
        );

        let builder = if self.config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&self.config.smtp_host)
                .context("Invalid SMTP server for TLS")?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.config.smtp_host)
        }
        .port(self.config.smtp_port)
        .credentials(creds);

        Ok(builder.build())
    }
}

fn build_message(
    from_name: &str,
    from_email: &str,
    to_name: &str,
    to_email: &str,
    subject: &str,
    html: &str,
) -> Result<Message> {
    let from_address: Mailbox = format!("{} <{}>", from_name, from_email)
        .parse()
        .context("Invalid from email address")?;
    let to_address: Mailbox = format!("{} <{}>", to_name, to_email)
        .parse()
        .context("Invalid recipient email address")?;

    Message::builder()
        .from(from_address)
        .to(to_address)
        .subject(subject)
        .header(ContentType::TEXT_HTML)
        .body(html.to_string())
        .context("Failed to build email message")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn build_message_accepts_plain_addresses() {
        let msg = build_message(
            "Verse Learning",
            "noreply@verselearning.local",
            "Student",
            "student@example.com",
            "Subject",
            "<p>Body</p>",
        );
        assert!(msg.is_ok());
    }

    #[test]
    fn build_message_rejects_garbage_recipient() {
        let msg = build_message(
            "Verse Learning",
            "noreply@verselearning.local",
            "Student",
            "not an address",
            "Subject",
            "<p>Body</p>",
        );
        assert!(msg.is_err());
    }

    #[test]
    #[serial]
    fn sending_enabled_by_default() {
        std::env::remove_var("EMAIL_SEND_DISABLED");
        assert!(!EmailService::sending_disabled());
    }

    #[test]
    #[serial]
    fn kill_switch_accepts_one_and_true() {
        std::env::set_var("EMAIL_SEND_DISABLED", "1");
        assert!(EmailService::sending_disabled());
        std::env::set_var("EMAIL_SEND_DISABLED", "TRUE");
        assert!(EmailService::sending_disabled());
        std::env::set_var("EMAIL_SEND_DISABLED", "0");
        assert!(!EmailService::sending_disabled());
        std::env::remove_var("EMAIL_SEND_DISABLED");
    }
}
