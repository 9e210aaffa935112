//! Email notification handlers.
//!
//! One handler per event that results in a message to a person. Each parses
//! its payload, builds a templated [`OutboundEmail`] and hands it to the
//! [`EmailSender`] port. Provider failures map to transient or permanent
//! handler errors through [`EmailError`](crate::clients::EmailError).

use crate::clients::{EmailSender, OutboundEmail};
use crate::config::WorkerConfig;
use async_trait::async_trait;
use docflow_events::types::{
    TeamCreated, TeamMemberInvited, TeamMemberRemoved, TrialExpiring, UserRegistered,
};
use docflow_events::{Envelope, EventHandler, HandlerOutcome};
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Template ids understood by the email provider.
pub mod templates {
    /// Address verification after sign-up.
    pub const VERIFY_EMAIL: &str = "verify-email";
    /// Trial ending soon.
    pub const TRIAL_EXPIRING: &str = "trial-expiring";
    /// New team owner welcome.
    pub const TEAM_WELCOME: &str = "team-welcome";
    /// Invitation to join a team.
    pub const TEAM_INVITATION: &str = "team-invitation";
    /// Removal from a team.
    pub const TEAM_REMOVAL: &str = "team-removal";
}

/// Sends the address verification email for `user.registered`.
pub struct VerificationEmailHandler {
    sender: Arc<dyn EmailSender>,
    config: Arc<WorkerConfig>,
}

impl VerificationEmailHandler {
    /// Create the handler.
    pub fn new(sender: Arc<dyn EmailSender>, config: Arc<WorkerConfig>) -> Self {
        Self { sender, config }
    }
}

#[async_trait]
impl EventHandler for VerificationEmailHandler {
    fn event_type(&self) -> &str {
        UserRegistered::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: UserRegistered = envelope.parse_payload()?;
        let verification_url = self.config.verification_url(&event.verification_token)?;

        let email = OutboundEmail {
            to: event.email.clone(),
            subject: "Verify your email address".to_string(),
            template: templates::VERIFY_EMAIL.to_string(),
            variables: json!({
                "firstName": event.first_name,
                "lastName": event.last_name,
                "verificationUrl": verification_url,
                "expiresAt": event.expiration,
            }),
        };
        self.sender.send(&email).await?;

        info!(
            correlation_id = %envelope.correlation_id(),
            "Verification email sent"
        );
        Ok(())
    }
}

/// Warns a user that their trial ends soon, for `user.trial_expiring`.
pub struct TrialExpiryEmailHandler {
    sender: Arc<dyn EmailSender>,
    config: Arc<WorkerConfig>,
}

impl TrialExpiryEmailHandler {
    /// Create the handler.
    pub fn new(sender: Arc<dyn EmailSender>, config: Arc<WorkerConfig>) -> Self {
        Self { sender, config }
    }
}

#[async_trait]
impl EventHandler for TrialExpiryEmailHandler {
    fn event_type(&self) -> &str {
        TrialExpiring::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: TrialExpiring = envelope.parse_payload()?;

        let subject = match event.days_remaining {
            0 => "Your trial ends today".to_string(),
            1 => "Your trial ends tomorrow".to_string(),
            n => format!("Your trial ends in {} days", n),
        };
        let email = OutboundEmail {
            to: event.email.clone(),
            subject,
            template: templates::TRIAL_EXPIRING.to_string(),
            variables: json!({
                "firstName": event.first_name,
                "trialEndsAt": event.trial_ends_at,
                "daysRemaining": event.days_remaining,
                "billingUrl": format!("{}/settings/billing", self.config.app_base_url.trim_end_matches('/')),
            }),
        };
        self.sender.send(&email).await?;

        info!(days_remaining = event.days_remaining, "Trial expiry email sent");
        Ok(())
    }
}

/// Welcomes the owner of a new team, for `team.created`.
pub struct TeamWelcomeEmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl TeamWelcomeEmailHandler {
    /// Create the handler.
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventHandler for TeamWelcomeEmailHandler {
    fn event_type(&self) -> &str {
        TeamCreated::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: TeamCreated = envelope.parse_payload()?;

        let email = OutboundEmail {
            to: event.owner_email.clone(),
            subject: format!("Welcome to {}", event.team_name),
            template: templates::TEAM_WELCOME.to_string(),
            variables: json!({
                "ownerName": event.owner_name,
                "teamName": event.team_name,
                "teamId": event.team_id,
            }),
        };
        self.sender.send(&email).await?;

        info!(team_id = %event.team_id, "Team welcome email sent");
        Ok(())
    }
}

/// Invites someone to a team, for `team.member_invited`.
pub struct TeamInvitationEmailHandler {
    sender: Arc<dyn EmailSender>,
    config: Arc<WorkerConfig>,
}

impl TeamInvitationEmailHandler {
    /// Create the handler.
    pub fn new(sender: Arc<dyn EmailSender>, config: Arc<WorkerConfig>) -> Self {
        Self { sender, config }
    }
}

#[async_trait]
impl EventHandler for TeamInvitationEmailHandler {
    fn event_type(&self) -> &str {
        TeamMemberInvited::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: TeamMemberInvited = envelope.parse_payload()?;
        let invitation_url = self.config.invitation_url(&event.invitation_token)?;

        let email = OutboundEmail {
            to: event.email.clone(),
            subject: format!("{} invited you to {}", event.invited_by, event.team_name),
            template: templates::TEAM_INVITATION.to_string(),
            variables: json!({
                "teamName": event.team_name,
                "invitedBy": event.invited_by,
                "invitationUrl": invitation_url,
                "expiresAt": event.expiration,
            }),
        };
        self.sender.send(&email).await?;

        info!(team_id = %event.team_id, "Team invitation email sent");
        Ok(())
    }
}

/// Tells a member they were removed from a team, for `team.member_removed`.
pub struct TeamRemovalEmailHandler {
    sender: Arc<dyn EmailSender>,
}

impl TeamRemovalEmailHandler {
    /// Create the handler.
    pub fn new(sender: Arc<dyn EmailSender>) -> Self {
        Self { sender }
    }
}

#[async_trait]
impl EventHandler for TeamRemovalEmailHandler {
    fn event_type(&self) -> &str {
        TeamMemberRemoved::EVENT_TYPE
    }

    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let event: TeamMemberRemoved = envelope.parse_payload()?;

        let email = OutboundEmail {
            to: event.email.clone(),
            subject: format!("You were removed from {}", event.team_name),
            template: templates::TEAM_REMOVAL.to_string(),
            variables: json!({
                "teamName": event.team_name,
                "teamId": event.team_id,
            }),
        };
        self.sender.send(&email).await?;

        info!(team_id = %event.team_id, "Team removal email sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::EmailError;
    use docflow_events::{DomainEvent, HandlerError};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<OutboundEmail>>,
        fail_with: Option<u16>,
    }

    #[async_trait]
    impl EmailSender for Outbox {
        async fn send(&self, email: &OutboundEmail) -> Result<(), EmailError> {
            if let Some(status) = self.fail_with {
                return Err(EmailError::ApiError {
                    status,
                    message: "rejected".to_string(),
                });
            }
            self.sent.lock().unwrap().push(email.clone());
            Ok(())
        }
    }

    fn config() -> Arc<WorkerConfig> {
        let mut config = WorkerConfig::default();
        config.app_base_url = "https://app.docflow.dev".to_string();
        Arc::new(config)
    }

    fn registered() -> UserRegistered {
        UserRegistered {
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            last_name: "Lovelace".to_string(),
            verification_token: "tok123".to_string(),
            expiration: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_verification_email_contains_token_link() {
        let outbox = Arc::new(Outbox::default());
        let handler = VerificationEmailHandler::new(outbox.clone(), config());

        handler
            .handle(&registered().to_envelope().unwrap())
            .await
            .unwrap();

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "ada@example.com");
        assert_eq!(sent[0].template, templates::VERIFY_EMAIL);
        assert_eq!(
            sent[0].variables["verificationUrl"],
            "https://app.docflow.dev/auth/verify-email?token=tok123"
        );
    }

    #[tokio::test]
    async fn test_verification_token_is_escaped_in_link() {
        let outbox = Arc::new(Outbox::default());
        let handler = VerificationEmailHandler::new(outbox.clone(), config());
        let mut event = registered();
        event.verification_token = "x&admin=1#top".to_string();

        handler.handle(&event.to_envelope().unwrap()).await.unwrap();

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(
            sent[0].variables["verificationUrl"],
            "https://app.docflow.dev/auth/verify-email?token=x%26admin%3D1%23top"
        );
    }

    #[tokio::test]
    async fn test_unusable_app_url_is_permanent() {
        let outbox = Arc::new(Outbox::default());
        let mut config = WorkerConfig::default();
        config.app_base_url = "not a url".to_string();
        let handler = VerificationEmailHandler::new(outbox.clone(), Arc::new(config));

        let result = handler.handle(&registered().to_envelope().unwrap()).await;

        assert!(matches!(result, Err(HandlerError::Permanent(_))));
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_invalid() {
        let outbox = Arc::new(Outbox::default());
        let handler = VerificationEmailHandler::new(outbox.clone(), config());

        let result = handler
            .handle(&Envelope::new("user.registered", json!({"email": 42})))
            .await;

        assert!(matches!(result, Err(HandlerError::InvalidPayload(_))));
        assert!(outbox.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_provider_outage_is_transient() {
        let outbox = Arc::new(Outbox {
            fail_with: Some(502),
            ..Outbox::default()
        });
        let handler = VerificationEmailHandler::new(outbox, config());

        let result = handler.handle(&registered().to_envelope().unwrap()).await;
        assert!(matches!(result, Err(HandlerError::Transient(_))));
    }

    #[tokio::test]
    async fn test_trial_expiry_subject() {
        let outbox = Arc::new(Outbox::default());
        let handler = TrialExpiryEmailHandler::new(outbox.clone(), config());
        let event = TrialExpiring {
            email: "ada@example.com".to_string(),
            first_name: "Ada".to_string(),
            trial_ends_at: chrono::Utc::now(),
            days_remaining: 3,
        };

        handler.handle(&event.to_envelope().unwrap()).await.unwrap();

        let sent = outbox.sent.lock().unwrap();
        assert_eq!(sent[0].subject, "Your trial ends in 3 days");
        assert_eq!(sent[0].variables["billingUrl"], "https://app.docflow.dev/settings/billing");
    }

    #[tokio::test]
    async fn test_team_emails_reach_the_right_person() {
        let outbox = Arc::new(Outbox::default());
        let team_id = Uuid::now_v7();

        TeamWelcomeEmailHandler::new(outbox.clone())
            .handle(
                &TeamCreated {
                    team_id,
                    team_name: "Finance".to_string(),
                    owner_email: "owner@example.com".to_string(),
                    owner_name: "Grace".to_string(),
                }
                .to_envelope()
                .unwrap(),
            )
            .await
            .unwrap();

        TeamInvitationEmailHandler::new(outbox.clone(), config())
            .handle(
                &TeamMemberInvited {
                    team_id,
                    team_name: "Finance".to_string(),
                    email: "new@example.com".to_string(),
                    invited_by: "Grace".to_string(),
                    invitation_token: "inv-9".to_string(),
                    expiration: chrono::Utc::now(),
                }
                .to_envelope()
                .unwrap(),
            )
            .await
            .unwrap();

        TeamRemovalEmailHandler::new(outbox.clone())
            .handle(
                &TeamMemberRemoved {
                    team_id,
                    team_name: "Finance".to_string(),
                    email: "old@example.com".to_string(),
                }
                .to_envelope()
                .unwrap(),
            )
            .await
            .unwrap();

        let sent = outbox.sent.lock().unwrap();
        let recipients: Vec<&str> = sent.iter().map(|e| e.to.as_str()).collect();
        assert_eq!(
            recipients,
            vec!["owner@example.com", "new@example.com", "old@example.com"]
        );
        assert_eq!(
            sent[1].variables["invitationUrl"],
            "https://app.docflow.dev/teams/join?token=inv-9"
        );
    }
}
