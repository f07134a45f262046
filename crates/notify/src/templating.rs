//! Minijinja rendering of completion and failure messages.
//!
//! Templates are plain strings, so a fresh [`minijinja::Environment`] is
//! created per render call.

use crate::traits::NotifyError;

pub const SUCCESS_SUBJECT: &str = "BilboMD Job Complete: {{ title }}";

pub const SUCCESS_BODY: &str = "\
Your BilboMD job \"{{ title }}\" has finished.

Results: {{ base_url }}/results/{{ job_id }}

The results archive contains the best-fitting ensembles for each ensemble size,
the minimized starting structure and a summary of the run.
";

pub const FAILURE_SUBJECT: &str = "BilboMD Job Failed: {{ title }}";

pub const FAILURE_BODY: &str = "\
Your BilboMD job \"{{ title }}\" did not complete.

Job details: {{ base_url }}/jobs/{{ job_id }}
{% if step %}
The run stopped during the {{ step }} step.{% endif %}
Please check the job page for the error message, or reply to this email
with the job id {{ job_id }} for help.
";

/// Values exposed to message templates.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CompletionContext {
    pub job_id: String,
    pub title: String,
    /// Base URL without trailing slash.
    pub base_url: String,
    pub is_failure: bool,
    /// Failing step, when known.
    pub step: Option<String>,
}

impl CompletionContext {
    pub fn new(base_url: &str, job_id: &str, title: &str, is_failure: bool) -> Self {
        Self {
            job_id: job_id.to_string(),
            title: title.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            is_failure,
            step: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct TemplateRenderer {
    _private: (),
}

impl TemplateRenderer {
    pub fn new() -> Self {
        Self { _private: () }
    }

    fn build_env() -> minijinja::Environment<'static> {
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env
    }

    /// Render a template string with the given context.
    ///
    /// # Errors
    ///
    /// Returns [`NotifyError::Template`] if the template is invalid or
    /// references an undefined value.
    pub fn render<S: serde::Serialize>(&self, template_str: &str, ctx: &S) -> Result<String, NotifyError> {
        Self::build_env()
            .render_str(template_str, ctx)
            .map_err(|e| NotifyError::Template(e.to_string()))
    }

    /// Check that a template parses, without evaluating it.
    pub fn validate(&self, template_str: &str) -> Result<(), NotifyError> {
        let env = Self::build_env();
        env.template_from_str(template_str)
            .map_err(|e| NotifyError::Template(e.to_string()))?;
        Ok(())
    }

    /// Subject and body for a completion or failure message.
    pub fn completion(&self, ctx: &CompletionContext) -> Result<(String, String), NotifyError> {
        let (subject, body) = if ctx.is_failure {
            (FAILURE_SUBJECT, FAILURE_BODY)
        } else {
            (SUCCESS_SUBJECT, SUCCESS_BODY)
        };
        Ok((self.render(subject, ctx)?, self.render(body, ctx)?))
    }
}
