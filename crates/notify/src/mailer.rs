//! The completion-email contract used by the pipeline and the monitor.

use async_trait::async_trait;

use crate::templating::{CompletionContext, TemplateRenderer};
use crate::traits::{Notification, Notifier, NotifyError};

#[async_trait]
pub trait CompletionNotifier: Send + Sync {
    async fn send_completion_email(
        &self,
        recipient: &str,
        base_url: &str,
        job_id: &str,
        title: &str,
        is_failure: bool,
    ) -> Result<(), NotifyError>;

    /// Failure email naming the step the run stopped in. Implementations
    /// that cannot use the step send the plain failure message.
    async fn send_failure_email(
        &self,
        recipient: &str,
        base_url: &str,
        job_id: &str,
        title: &str,
        step: Option<&str>,
    ) -> Result<(), NotifyError> {
        let _ = step;
        self.send_completion_email(recipient, base_url, job_id, title, true).await
    }
}

/// Renders the bundled templates and hands the message to a [`Notifier`].
pub struct CompletionMailer<N> {
    channel: N,
    renderer: TemplateRenderer,
}

impl<N: Notifier> CompletionMailer<N> {
    pub fn new(channel: N) -> Self {
        Self { channel, renderer: TemplateRenderer::new() }
    }

    pub fn render(
        &self,
        recipient: &str,
        ctx: &CompletionContext,
    ) -> Result<Notification, NotifyError> {
        let (subject, body) = self.renderer.completion(ctx)?;
        Ok(Notification { recipient: recipient.to_string(), subject, body })
    }
}

#[async_trait]
impl<N: Notifier> CompletionNotifier for CompletionMailer<N> {
    async fn send_completion_email(
        &self,
        recipient: &str,
        base_url: &str,
        job_id: &str,
        title: &str,
        is_failure: bool,
    ) -> Result<(), NotifyError> {
        let ctx = CompletionContext::new(base_url, job_id, title, is_failure);
        self.deliver(recipient, &ctx).await
    }

    async fn send_failure_email(
        &self,
        recipient: &str,
        base_url: &str,
        job_id: &str,
        title: &str,
        step: Option<&str>,
    ) -> Result<(), NotifyError> {
        let mut ctx = CompletionContext::new(base_url, job_id, title, true);
        ctx.step = step.map(str::to_string);
        self.deliver(recipient, &ctx).await
    }
}

impl<N: Notifier> CompletionMailer<N> {
    async fn deliver(&self, recipient: &str, ctx: &CompletionContext) -> Result<(), NotifyError> {
        let notification = self.render(recipient, ctx)?;
        self.channel.send(&notification).await?;
        tracing::info!(
            job_id = %ctx.job_id,
            channel = self.channel.channel_name(),
            is_failure = ctx.is_failure,
            "completion email sent"
        );
        Ok(())
    }
}

/// Used when email is switched off; logs what would have been sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledNotifier;

#[async_trait]
impl CompletionNotifier for DisabledNotifier {
    async fn send_completion_email(
        &self,
        _recipient: &str,
        _base_url: &str,
        job_id: &str,
        _title: &str,
        is_failure: bool,
    ) -> Result<(), NotifyError> {
        tracing::info!(job_id, is_failure, "email notifications disabled, skipping");
        Ok(())
    }
}
