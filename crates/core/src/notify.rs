//! Fire-and-forget notification boundary: chatter messages, reminders and template emails.
//!
//! Delivery failures are returned as [`NotificationError`] values so the caller can log them;
//! they never abort a workflow transition.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tera::{Context, Tera};
use thiserror::Error;
use tracing::info;

use crate::domain::identity::UserId;
use crate::domain::request::RequestId;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("template `{template}` failed to render: {message}")]
    Template { template: String, message: String },
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// Persistent message on the request trail, optionally addressed to users.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub request_id: RequestId,
    pub recipients: Vec<UserId>,
    pub subject: Option<String>,
    pub body: String,
}

/// One to-do style reminder for a single approver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reminder {
    pub request_id: RequestId,
    pub user_id: UserId,
    pub summary: String,
    pub note: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmailTemplate {
    Submitted,
    Approved,
    Refused,
}

impl EmailTemplate {
    pub fn key(&self) -> &'static str {
        match self {
            Self::Submitted => "approval_request_submitted",
            Self::Approved => "approval_request_approved",
            Self::Refused => "approval_request_refused",
        }
    }

    fn subject_key(&self) -> String {
        format!("{}.subject", self.key())
    }

    fn body_key(&self) -> String {
        format!("{}.body", self.key())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateEmail {
    pub template: EmailTemplate,
    pub request_id: RequestId,
    pub to: Vec<String>,
    pub from: Option<String>,
    pub subject: String,
    pub body: String,
}

/// Values exposed to email templates.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailContext {
    pub request_name: String,
    pub category_name: String,
    pub owner_name: String,
    pub date: Option<String>,
    pub amount: Option<String>,
    pub reason: Option<String>,
    pub link: Option<String>,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, message: NotificationMessage) -> Result<(), NotificationError>;
    fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotificationError>;
    fn send_template_email(&self, email: TemplateEmail) -> Result<(), NotificationError>;
}

impl<N> Notifier for Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, message: NotificationMessage) -> Result<(), NotificationError> {
        (**self).notify(message)
    }

    fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotificationError> {
        (**self).schedule_reminder(reminder)
    }

    fn send_template_email(&self, email: TemplateEmail) -> Result<(), NotificationError> {
        (**self).send_template_email(email)
    }
}

const SUBMITTED_SUBJECT: &str = "Approval Request: {{ request_name }}";
const SUBMITTED_BODY: &str = "A new approval request {{ request_name }} has been submitted and requires your approval.\n\
Category: {{ category_name }}\n\
Request Owner: {{ owner_name }}\n\
Date: {{ date | default(value=\"\") }}\n\
{% if amount %}Amount: {{ amount }}\n{% endif %}\
{% if link %}Review it at {{ link }}\n{% endif %}";
const APPROVED_SUBJECT: &str = "Approved: {{ request_name }}";
const APPROVED_BODY: &str = "Hello {{ owner_name }},\n\
Your request {{ request_name }} ({{ category_name }}) has been approved.\n\
{% if link %}{{ link }}\n{% endif %}";
const REFUSED_SUBJECT: &str = "Refused: {{ request_name }}";
const REFUSED_BODY: &str = "Hello {{ owner_name }},\n\
Your request {{ request_name }} ({{ category_name }}) has been refused.\n\
{% if reason %}Reason: {{ reason }}\n{% endif %}\
{% if link %}{{ link }}\n{% endif %}";

/// Renders the three request emails from embedded tera templates.
#[derive(Clone, Debug)]
pub struct MailTemplates {
    tera: Tera,
}

impl MailTemplates {
    pub fn embedded() -> Result<Self, NotificationError> {
        let mut tera = Tera::default();
        tera.autoescape_on(Vec::new());
        let templates = [
            (EmailTemplate::Submitted, SUBMITTED_SUBJECT, SUBMITTED_BODY),
            (EmailTemplate::Approved, APPROVED_SUBJECT, APPROVED_BODY),
            (EmailTemplate::Refused, REFUSED_SUBJECT, REFUSED_BODY),
        ];
        for (template, subject, body) in templates {
            tera.add_raw_template(&template.subject_key(), subject)
                .map_err(|error| template_error(template, error))?;
            tera.add_raw_template(&template.body_key(), body)
                .map_err(|error| template_error(template, error))?;
        }
        Ok(Self { tera })
    }

    /// Returns the rendered `(subject, body)` pair.
    pub fn render(
        &self,
        template: EmailTemplate,
        context: &EmailContext,
    ) -> Result<(String, String), NotificationError> {
        let context =
            Context::from_serialize(context).map_err(|error| template_error(template, error))?;
        let subject = self
            .tera
            .render(&template.subject_key(), &context)
            .map_err(|error| template_error(template, error))?;
        let body = self
            .tera
            .render(&template.body_key(), &context)
            .map_err(|error| template_error(template, error))?;
        Ok((subject.trim().to_owned(), body))
    }
}

fn template_error(template: EmailTemplate, error: tera::Error) -> NotificationError {
    NotificationError::Template { template: template.key().to_owned(), message: error.to_string() }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Outbox {
    pub messages: Vec<NotificationMessage>,
    pub reminders: Vec<Reminder>,
    pub emails: Vec<TemplateEmail>,
}

impl Outbox {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.reminders.is_empty() && self.emails.is_empty()
    }

    /// Hands every item to `target`, returning the failures instead of stopping at the first.
    pub fn dispatch<N>(self, target: &N) -> Vec<NotificationError>
    where
        N: Notifier + ?Sized,
    {
        let mut failures = Vec::new();
        for message in self.messages {
            if let Err(error) = target.notify(message) {
                failures.push(error);
            }
        }
        for reminder in self.reminders {
            if let Err(error) = target.schedule_reminder(reminder) {
                failures.push(error);
            }
        }
        for email in self.emails {
            if let Err(error) = target.send_template_email(email) {
                failures.push(error);
            }
        }
        failures
    }
}

fn lock_outbox(outbox: &Mutex<Outbox>) -> std::sync::MutexGuard<'_, Outbox> {
    match outbox.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Records everything it is given; delivery happens once the surrounding unit commits.
#[derive(Clone, Default)]
pub struct OutboxNotifier {
    outbox: Arc<Mutex<Outbox>>,
}

impl OutboxNotifier {
    pub fn take(&self) -> Outbox {
        std::mem::take(&mut *lock_outbox(&self.outbox))
    }
}

impl Notifier for OutboxNotifier {
    fn notify(&self, message: NotificationMessage) -> Result<(), NotificationError> {
        lock_outbox(&self.outbox).messages.push(message);
        Ok(())
    }

    fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotificationError> {
        lock_outbox(&self.outbox).reminders.push(reminder);
        Ok(())
    }

    fn send_template_email(&self, email: TemplateEmail) -> Result<(), NotificationError> {
        lock_outbox(&self.outbox).emails.push(email);
        Ok(())
    }
}

/// Test double; `failing_emails` makes every email delivery fail.
#[derive(Clone, Default)]
pub struct InMemoryNotifier {
    outbox: Arc<Mutex<Outbox>>,
    fail_emails: bool,
    fail_messages: bool,
}

impl InMemoryNotifier {
    pub fn failing_emails() -> Self {
        Self { fail_emails: true, ..Self::default() }
    }

    pub fn failing_everything() -> Self {
        Self { fail_emails: true, fail_messages: true, ..Self::default() }
    }

    pub fn messages(&self) -> Vec<NotificationMessage> {
        lock_outbox(&self.outbox).messages.clone()
    }

    pub fn reminders(&self) -> Vec<Reminder> {
        lock_outbox(&self.outbox).reminders.clone()
    }

    pub fn emails(&self) -> Vec<TemplateEmail> {
        lock_outbox(&self.outbox).emails.clone()
    }
}

impl Notifier for InMemoryNotifier {
    fn notify(&self, message: NotificationMessage) -> Result<(), NotificationError> {
        if self.fail_messages {
            return Err(NotificationError::Delivery("message bus unavailable".to_owned()));
        }
        lock_outbox(&self.outbox).messages.push(message);
        Ok(())
    }

    fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotificationError> {
        if self.fail_messages {
            return Err(NotificationError::Delivery("activity queue unavailable".to_owned()));
        }
        lock_outbox(&self.outbox).reminders.push(reminder);
        Ok(())
    }

    fn send_template_email(&self, email: TemplateEmail) -> Result<(), NotificationError> {
        if self.fail_emails {
            return Err(NotificationError::Delivery(format!(
                "smtp relay refused {}",
                email.template.key()
            )));
        }
        lock_outbox(&self.outbox).emails.push(email);
        Ok(())
    }
}

/// Default delivery: everything becomes a structured log record.
#[derive(Clone, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, message: NotificationMessage) -> Result<(), NotificationError> {
        info!(
            event_name = "notify.message.posted",
            request_id = %message.request_id.0,
            recipients = message.recipients.len(),
            subject = message.subject.as_deref().unwrap_or(""),
            "{}",
            message.body
        );
        Ok(())
    }

    fn schedule_reminder(&self, reminder: Reminder) -> Result<(), NotificationError> {
        info!(
            event_name = "notify.reminder.scheduled",
            request_id = %reminder.request_id.0,
            user_id = %reminder.user_id.0,
            summary = %reminder.summary,
            "reminder scheduled"
        );
        Ok(())
    }

    fn send_template_email(&self, email: TemplateEmail) -> Result<(), NotificationError> {
        info!(
            event_name = "notify.email.sent",
            request_id = %email.request_id.0,
            template = email.template.key(),
            to = %email.to.join(","),
            from = email.from.as_deref().unwrap_or(""),
            subject = %email.subject,
            "template email handed to transport"
        );
        Ok(())
    }
}
