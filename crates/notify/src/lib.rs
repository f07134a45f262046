//! Job completion notifications.
//!
//! This crate provides:
//! - `Notifier` trait for pluggable delivery channels
//! - SMTP email delivery via lettre
//! - Minijinja templates for completion and failure messages
//! - `CompletionNotifier`, the `send_completion_email` contract used by the pipeline

pub mod email;
pub mod mailer;
pub mod templating;
pub mod traits;

pub use email::EmailNotifier;
pub use mailer::{CompletionMailer, CompletionNotifier, DisabledNotifier};
pub use traits::{Notification, Notifier, NotifyError};
