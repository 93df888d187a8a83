use std::sync::Arc;

use async_trait::async_trait;

use super::{HandlerContext, HandlerError, TaskHandler};
use crate::types::TaskParams;

pub const TEST_EMAIL_CONFIG: &str = "TEST_EMAIL_CONFIG";

/// Checks that the configured mail relay would accept mail for a recipient.
///
/// Returns the relay's own description of the exchange on success.
#[async_trait]
pub trait MailProbe: Send + Sync {
    async fn probe(&self, recipient: &str) -> Result<String, HandlerError>;
}

pub struct TestEmailConfig {
    mail: Arc<dyn MailProbe>,
}

impl TestEmailConfig {
    pub fn new(mail: Arc<dyn MailProbe>) -> Self {
        Self { mail }
    }
}

#[async_trait]
impl TaskHandler for TestEmailConfig {
    async fn run(&self, _ctx: &HandlerContext, params: &TaskParams) -> Result<String, HandlerError> {
        let recipient = params.require_str("recipient")?.trim();
        if !is_plausible_address(recipient) {
            return Err(HandlerError::InvalidParameter {
                key: "recipient".to_string(),
                reason: format!("not an email address: {recipient:?}"),
            });
        }
        let answer = self.mail.probe(recipient).await?;
        Ok(format!("mail relay accepted test recipient {recipient}: {answer}"))
    }
}

fn is_plausible_address(s: &str) -> bool {
    match s.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && !domain.is_empty()
                && !domain.contains('@')
                && !s.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingProbe {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailProbe for RecordingProbe {
        async fn probe(&self, recipient: &str) -> Result<String, HandlerError> {
            self.seen.lock().unwrap().push(recipient.to_string());
            Ok("250 OK".to_string())
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            task_id: "t".into(),
            task_type: TEST_EMAIL_CONFIG.into(),
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn probes_recipient() {
        let probe = Arc::new(RecordingProbe::default());
        let handler = TestEmailConfig::new(probe.clone());
        let params = TaskParams::new().with("recipient", " ops@example.org ");
        let summary = handler.run(&ctx(), &params).await.unwrap();
        assert!(summary.contains("ops@example.org"));
        assert!(summary.contains("250 OK"));
        assert_eq!(*probe.seen.lock().unwrap(), vec!["ops@example.org"]);
    }

    #[tokio::test]
    async fn rejects_missing_or_bad_recipient() {
        let probe = Arc::new(RecordingProbe::default());
        let handler = TestEmailConfig::new(probe.clone());

        let err = handler.run(&ctx(), &TaskParams::new()).await.unwrap_err();
        assert!(matches!(err, HandlerError::MissingParameter { .. }));

        let bad = TaskParams::new().with("recipient", "not-an-address");
        let err = handler.run(&ctx(), &bad).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidParameter { .. }));
        assert!(probe.seen.lock().unwrap().is_empty());
    }

    #[test]
    fn address_plausibility() {
        assert!(is_plausible_address("a@b"));
        assert!(!is_plausible_address("@b"));
        assert!(!is_plausible_address("a@"));
        assert!(!is_plausible_address("a@b@c"));
        assert!(!is_plausible_address("a b@c"));
    }
}
