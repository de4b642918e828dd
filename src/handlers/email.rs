//! # Email output handler.
//!
//! Turns a delivery into a [`Mail`] and hands it to a [`Mailer`]:
//! - recipients come from the `to` header (a string or an array of strings);
//! - the subject comes from the `subject` header;
//! - the body, content type and encoding are taken from the message.
//!
//! A message without usable `to`/`subject` headers can never succeed and is
//! reported as `Rejected`, as is a mail the service refuses. An unavailable
//! service is a `HandlerFailure`, so the failure policy decides whether it is
//! retried.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::broker::FieldValue;
use crate::dispatch::{DispatchOutcome, ExecutionContext};
use crate::error::MailError;

use super::Handler;

/// Header naming the recipients.
pub const TO_HEADER: &str = "to";
/// Header carrying the subject.
pub const SUBJECT_HEADER: &str = "subject";

/// An outgoing mail.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mail {
    pub to: Vec<String>,
    pub subject: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl Mail {
    /// Builds a mail from the message headers.
    pub fn from_message(ctx: &ExecutionContext, body: &[u8]) -> Result<Self, MailError> {
        let to = match ctx.header(TO_HEADER) {
            None => return Err(MailError::MissingHeader(TO_HEADER)),
            Some(FieldValue::String(s)) => vec![s.clone()],
            Some(FieldValue::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(str::to_owned).ok_or_else(|| MailError::InvalidHeader {
                        header: TO_HEADER,
                        reason: "entries must be strings".into(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            Some(other) => {
                return Err(MailError::InvalidHeader {
                    header: TO_HEADER,
                    reason: format!("must be a string or array, got {other}"),
                })
            }
        };
        let to: Vec<String> = to
            .into_iter()
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect();
        if to.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let subject = ctx
            .header(SUBJECT_HEADER)
            .and_then(FieldValue::as_str)
            .ok_or(MailError::MissingHeader(SUBJECT_HEADER))?
            .to_owned();

        Ok(Self {
            to,
            subject,
            body: body.to_vec(),
            content_type: ctx.properties.content_type.clone(),
            content_encoding: ctx.properties.content_encoding.clone(),
        })
    }
}

/// Delivers mail. Implementations wrap an SMTP client, an API, or a test recorder.
#[async_trait]
pub trait Mailer: Send + Sync + 'static {
    async fn send(&self, mail: &Mail) -> Result<(), MailError>;
}

/// Sends each delivery as an email.
pub struct EmailHandler {
    mailer: Arc<dyn Mailer>,
}

impl EmailHandler {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Handler for EmailHandler {
    fn name(&self) -> &str {
        "email"
    }

    async fn invoke(&self, ctx: &ExecutionContext, body: &[u8]) -> DispatchOutcome {
        let mail = match Mail::from_message(ctx, body) {
            Ok(mail) => mail,
            Err(e) => return DispatchOutcome::rejected(e.to_string()),
        };
        match self.mailer.send(&mail).await {
            Ok(()) => {
                debug!(to = ?mail.to, subject = %mail.subject, "mail sent");
                DispatchOutcome::Success(Vec::new())
            }
            Err(e) if e.is_permanent() => DispatchOutcome::rejected(e.to_string()),
            Err(e) => DispatchOutcome::failure(e.to_string(), Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Properties;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Mail>>,
        fail: Option<MailError>,
    }

    #[async_trait]
    impl Mailer for Recorder {
        async fn send(&self, mail: &Mail) -> Result<(), MailError> {
            if let Some(e) = &self.fail {
                return Err(e.clone());
            }
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    fn ctx(properties: Properties) -> ExecutionContext {
        ExecutionContext {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "mail".into(),
            redelivered: false,
            properties,
        }
    }

    #[tokio::test]
    async fn test_sends_to_all_recipients() {
        let recorder = Arc::new(Recorder::default());
        let handler = EmailHandler::new(recorder.clone());

        let mut props = Properties::default().with_header(SUBJECT_HEADER, "hi");
        props.content_type = Some("text/plain".into());
        props.headers.insert(
            TO_HEADER.into(),
            FieldValue::Array(vec!["a@x.io".into(), " b@x.io ".into()]),
        );

        let out = handler.invoke(&ctx(props), b"body").await;
        assert!(out.is_success());

        let sent = recorder.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, vec!["a@x.io", "b@x.io"]);
        assert_eq!(sent[0].subject, "hi");
        assert_eq!(sent[0].content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn test_missing_headers_are_rejected() {
        let recorder = Arc::new(Recorder::default());
        let handler = EmailHandler::new(recorder.clone());

        let no_to = handler
            .invoke(&ctx(Properties::default().with_header(SUBJECT_HEADER, "s")), b"")
            .await;
        assert!(matches!(no_to, DispatchOutcome::Rejected { .. }));

        let no_subject = handler
            .invoke(&ctx(Properties::default().with_header(TO_HEADER, "a@x.io")), b"")
            .await;
        assert!(matches!(no_subject, DispatchOutcome::Rejected { .. }));

        let wrong_type = handler
            .invoke(
                &ctx(
                    Properties::default()
                        .with_header(TO_HEADER, 5i64)
                        .with_header(SUBJECT_HEADER, "s"),
                ),
                b"",
            )
            .await;
        assert!(matches!(wrong_type, DispatchOutcome::Rejected { .. }));

        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_mail_errors_name_the_header() {
        let props = Properties::default().with_header(TO_HEADER, " ");
        assert_eq!(Mail::from_message(&ctx(props), b""), Err(MailError::NoRecipients));

        let props = Properties::default().with_header(TO_HEADER, "a@x.io");
        let err = Mail::from_message(&ctx(props), b"").unwrap_err();
        assert_eq!(err, MailError::MissingHeader(SUBJECT_HEADER));
        assert_eq!(err.as_label(), "mail_missing_header");
    }

    #[tokio::test]
    async fn test_unavailable_mailer_is_handler_failure() {
        let handler = EmailHandler::new(Arc::new(Recorder {
            fail: Some(MailError::Unavailable("451 try later".into())),
            ..Recorder::default()
        }));
        let props = Properties::default()
            .with_header(TO_HEADER, "a@x.io")
            .with_header(SUBJECT_HEADER, "s");
        let out = handler.invoke(&ctx(props), b"").await;
        assert!(matches!(out, DispatchOutcome::HandlerFailure { .. }));
    }

    #[tokio::test]
    async fn test_refused_mail_is_rejected() {
        let handler = EmailHandler::new(Arc::new(Recorder {
            fail: Some(MailError::Refused("550 no such user".into())),
            ..Recorder::default()
        }));
        let props = Properties::default()
            .with_header(TO_HEADER, "nobody@x.io")
            .with_header(SUBJECT_HEADER, "s");
        let out = handler.invoke(&ctx(props), b"").await;
        assert!(matches!(out, DispatchOutcome::Rejected { .. }));
    }
}
