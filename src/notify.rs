//! Late / recovery notifications.
//!
//! The lifecycle layer and the deadline engine hand finished canary records
//! to a [`Notifier`]; the SMTP implementation formats a message and queues
//! it on a dedicated worker thread so a slow relay never blocks a trigger
//! or the engine. Transport failures are logged and swallowed — a lost
//! email must not roll back the state change that prompted it.

use std::sync::mpsc;
use std::thread;

use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::{error, info, warn};

use crate::store::Canary;

/// How many history entries a notification message includes.
const HISTORY_IN_BODY: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyKind {
    /// The canary missed its deadline.
    Late,
    /// A previously late canary triggered again.
    Recovered,
}

pub trait Notifier: Send + Sync {
    /// Fire-and-forget: implementations must never propagate errors.
    fn notify(&self, canary: &Canary, kind: NotifyKind);
}

pub fn subject(canary: &Canary, kind: NotifyKind) -> String {
    match kind {
        NotifyKind::Late => format!("[LATE] {} has not reported", canary.name),
        NotifyKind::Recovered => format!("[RESUMED] {} is reporting again", canary.name),
    }
}

pub fn body(canary: &Canary, kind: NotifyKind) -> String {
    let mut body = String::new();

    match kind {
        NotifyKind::Late => {
            if let Some(deadline) = canary.deadline {
                body.push_str(&format!(
                    "The canary {} ({}) was expected to report before {}.\n",
                    canary.name, canary.id, deadline
                ));
            } else {
                body.push_str(&format!(
                    "The canary {} ({}) has missed its deadline.\n",
                    canary.name, canary.id
                ));
            }
        }
        NotifyKind::Recovered => {
            if let Some(event) = canary.history.first() {
                body.push_str(&format!(
                    "The canary {} ({}) is reporting again as of {}.\n",
                    canary.name, canary.id, event.at
                ));
            }
            if let Some(deadline) = canary.deadline {
                body.push_str(&format!(
                    "\nThe next trigger for this canary is due before {}.\n",
                    deadline
                ));
            }
        }
    }

    body.push_str("\nRecent events for this canary:\n\n");
    for event in canary.history.iter().take(HISTORY_IN_BODY) {
        body.push_str(&format!("{:<30} {}\n", event.at.to_string(), event.note));
    }
    body
}

// ── SMTP notifier ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub sender: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

struct EmailJob {
    recipients: Vec<String>,
    subject: String,
    body: String,
    canary_label: String,
}

/// Sends notifications over SMTP from a background worker thread.
pub struct EmailNotifier {
    sender: String,
    jobs: mpsc::Sender<EmailJob>,
}

impl EmailNotifier {
    /// Start the worker thread. The transport is built lazily inside the
    /// worker so a down relay at startup only costs failed sends, not boot.
    pub fn start(settings: SmtpSettings) -> Self {
        let (tx, rx) = mpsc::channel::<EmailJob>();
        let sender = settings.sender.clone();
        thread::Builder::new()
            .name("smtp-notifier".into())
            .spawn(move || worker(settings, rx))
            .map_err(|e| error!(error = %e, "failed to spawn smtp worker"))
            .ok();
        Self { sender, jobs: tx }
    }
}

impl Notifier for EmailNotifier {
    fn notify(&self, canary: &Canary, kind: NotifyKind) {
        let subject = subject(canary, kind);

        if canary.emails.is_empty() {
            info!(canary = %canary.id, name = %canary.name, %subject, "no notification emails configured");
            return;
        }

        let job = EmailJob {
            recipients: canary.emails.clone(),
            subject,
            body: body(canary, kind),
            canary_label: format!("{} ({})", canary.name, canary.id),
        };
        if self.jobs.send(job).is_err() {
            warn!(sender = %self.sender, "smtp worker is gone, dropping notification");
        }
    }
}

fn worker(settings: SmtpSettings, rx: mpsc::Receiver<EmailJob>) {
    let mut transport = match build_transport(&settings) {
        Ok(t) => Some(t),
        Err(e) => {
            error!(error = %e, "cannot build smtp transport, notifications disabled");
            None
        }
    };

    while let Ok(job) = rx.recv() {
        let Some(transport) = transport.as_mut() else {
            warn!(canary = %job.canary_label, "smtp transport unavailable, notification dropped");
            continue;
        };
        match build_message(&settings.sender, &job) {
            Ok(message) => match transport.send(&message) {
                Ok(_) => {
                    info!(canary = %job.canary_label, subject = %job.subject, "notified");
                }
                Err(e) => {
                    error!(canary = %job.canary_label, error = %e, "notify failed");
                }
            },
            Err(e) => {
                error!(canary = %job.canary_label, error = %e, "cannot build notification message");
            }
        }
    }
}

fn build_transport(settings: &SmtpSettings) -> Result<SmtpTransport, String> {
    let mut builder = SmtpTransport::builder_dangerous(&settings.host).port(settings.port);
    if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
        builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
    }
    Ok(builder.build())
}

fn build_message(sender: &str, job: &EmailJob) -> Result<Message, String> {
    let mut builder = Message::builder()
        .from(sender.parse().map_err(|e| format!("bad sender address: {e}"))?)
        .subject(job.subject.clone());
    for recipient in &job.recipients {
        builder = builder.to(recipient
            .parse()
            .map_err(|e| format!("bad recipient {recipient}: {e}"))?);
    }
    builder
        .body(job.body.clone())
        .map_err(|e| format!("cannot build message: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests_support::{canary, dt};
    use crate::store::HistoryEntry;

    #[test]
    fn late_subject_and_body() {
        let mut c = canary("abcdefgh", "web-backup", dt(1, 0));
        c.late = true;
        assert_eq!(subject(&c, NotifyKind::Late), "[LATE] web-backup has not reported");
        let body = body(&c, NotifyKind::Late);
        assert!(body.contains("abcdefgh"));
        assert!(body.contains("expected to report before 2016-06-30 01:00:00"));
        assert!(body.contains("Canary created"));
    }

    #[test]
    fn recovered_body_mentions_next_deadline() {
        let mut c = canary("abcdefgh", "web-backup", dt(1, 0));
        c.history.insert(0, HistoryEntry { at: dt(0, 30), note: "Triggered".into() });
        let body = body(&c, NotifyKind::Recovered);
        assert!(body.contains("reporting again as of 2016-06-30 00:30:00"));
        assert!(body.contains("due before 2016-06-30 01:00:00"));
    }

    #[test]
    fn body_caps_history() {
        let mut c = canary("abcdefgh", "web-backup", dt(1, 0));
        for i in 0..40 {
            c.history.push(HistoryEntry { at: dt(0, 0), note: format!("event {i}") });
        }
        let body = body(&c, NotifyKind::Late);
        assert_eq!(body.matches("event ").count(), HISTORY_IN_BODY - 1);
    }
}
