//! Inbound provider lifecycle notifications.
//!
//! Events arrive in no particular order and may be duplicated or late. Each
//! kind has an explicit [`MergePolicy`]; `killed` always wins, everything
//! else is rejected when older than what the record already knows.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use super::manager::{SandboxManager, SandboxResult};
use super::models::{SandboxRecord, SandboxStatus};
use crate::errors::WebhookError;

pub const SIGNATURE_HEADER: &str = "x-sandbox-signature";

const TYPE_PREFIX: &str = "sandbox.lifecycle.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleKind {
    Created,
    Paused,
    Resumed,
    Killed,
    Updated,
}

impl LifecycleKind {
    /// Accepts both `sandbox.lifecycle.paused` and bare `paused`.
    pub fn from_type(raw: &str) -> Option<Self> {
        match raw.strip_prefix(TYPE_PREFIX).unwrap_or(raw) {
            "created" => Some(Self::Created),
            "paused" => Some(Self::Paused),
            "resumed" => Some(Self::Resumed),
            "killed" => Some(Self::Killed),
            "updated" => Some(Self::Updated),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawWebhook {
    #[serde(rename = "type")]
    event_type: String,
    sandbox_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    event_data: Option<RawEventData>,
}

#[derive(Debug, Default, Deserialize)]
struct RawEventData {
    #[serde(default)]
    sandbox_metadata: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleEvent {
    pub kind: LifecycleKind,
    pub sandbox_id: String,
    pub timestamp: DateTime<Utc>,
    /// Owning project claimed by the sandbox metadata, if present.
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedWebhook {
    Event(LifecycleEvent),
    /// Well-formed payload with a type we do not handle.
    Ignored { event_type: String },
}

pub fn parse_webhook(body: &[u8]) -> Result<ParsedWebhook, WebhookError> {
    let raw: RawWebhook =
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;
    if raw.sandbox_id.trim().is_empty() {
        return Err(WebhookError::Malformed("empty sandbox_id".into()));
    }
    let Some(kind) = LifecycleKind::from_type(&raw.event_type) else {
        return Ok(ParsedWebhook::Ignored {
            event_type: raw.event_type,
        });
    };
    let project_id = raw
        .event_data
        .and_then(|d| d.sandbox_metadata)
        .and_then(|m| m.get("projectId").cloned())
        .and_then(|v| match v {
            serde_json::Value::String(s) if !s.is_empty() => Some(s),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    Ok(ParsedWebhook::Event(LifecycleEvent {
        kind,
        sandbox_id: raw.sandbox_id,
        timestamp: raw.timestamp,
        project_id,
    }))
}

/// Lowercase hex SHA-256 of `secret ‖ body`.
pub fn sign(secret: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(body);
    hex::encode(hasher.finalize())
}

/// Check the signature header. Without a configured secret, verification is
/// disabled and every payload passes.
pub fn verify_signature(
    secret: Option<&str>,
    header: Option<&str>,
    body: &[u8],
) -> Result<(), WebhookError> {
    let Some(secret) = secret else {
        debug!("webhook secret not configured, skipping signature check");
        return Ok(());
    };
    let provided = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or(WebhookError::MissingSignature)?;
    let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
    let provided = provided.to_ascii_lowercase();
    let expected = sign(secret, body);
    if bool::from(expected.as_bytes().ct_eq(provided.as_bytes())) {
        Ok(())
    } else {
        Err(WebhookError::InvalidSignature)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllowedFrom {
    /// No record, a terminal one, or Unknown.
    Vacant,
    Only(&'static [SandboxStatus]),
    NonTerminal,
    Any,
}

/// Per-kind merge rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergePolicy {
    allowed_from: AllowedFrom,
    /// `None` keeps the current status (except Unknown, which resolves to
    /// Running).
    result: Option<SandboxStatus>,
    pub stale_check: bool,
}

impl MergePolicy {
    pub const fn for_kind(kind: LifecycleKind) -> Self {
        match kind {
            LifecycleKind::Created => Self {
                allowed_from: AllowedFrom::Vacant,
                result: Some(SandboxStatus::Starting),
                stale_check: true,
            },
            LifecycleKind::Paused => Self {
                allowed_from: AllowedFrom::Only(&[SandboxStatus::Running, SandboxStatus::Starting]),
                result: Some(SandboxStatus::Paused),
                stale_check: true,
            },
            LifecycleKind::Resumed => Self {
                allowed_from: AllowedFrom::Only(&[SandboxStatus::Paused, SandboxStatus::Unknown]),
                result: Some(SandboxStatus::Running),
                stale_check: true,
            },
            LifecycleKind::Updated => Self {
                allowed_from: AllowedFrom::NonTerminal,
                result: None,
                stale_check: true,
            },
            LifecycleKind::Killed => Self {
                allowed_from: AllowedFrom::Any,
                result: Some(SandboxStatus::Killed),
                stale_check: false,
            },
        }
    }

    /// Whether the event may be applied on top of `current` (`None` when the
    /// project has no record).
    pub fn permits(&self, current: Option<SandboxStatus>) -> bool {
        match (self.allowed_from, current) {
            (AllowedFrom::Vacant, None) => true,
            (AllowedFrom::Vacant, Some(s)) => s.is_terminal() || s == SandboxStatus::Unknown,
            (AllowedFrom::Only(set), Some(s)) => set.contains(&s),
            (AllowedFrom::NonTerminal, Some(s)) => !s.is_terminal(),
            (AllowedFrom::Any, Some(_)) => true,
            (_, None) => false,
        }
    }

    pub fn target(&self, current: SandboxStatus) -> SandboxStatus {
        match self.result {
            Some(status) => status,
            None if current == SandboxStatus::Unknown => SandboxStatus::Running,
            None => current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Applied {
        project_id: String,
        status: SandboxStatus,
    },
    /// Older than what the record already reflects.
    Stale { project_id: String },
    /// Policy does not allow this transition, or the id was superseded.
    Ignored { reason: String },
    /// No project could be resolved for the sandbox.
    Untracked { sandbox_id: String },
    /// Metadata names a different project than the one owning the sandbox.
    /// Not applied.
    OwnershipConflict {
        sandbox_id: String,
        claimed_project: String,
        owning_project: String,
    },
}

impl SandboxManager {
    pub async fn apply_webhook(&self, event: &LifecycleEvent) -> SandboxResult<WebhookOutcome> {
        let sid = event.sandbox_id.clone();
        let owner = self.db(move |db| db.find_sandbox_by_id(&sid)).await?;

        let project_id = match (&event.project_id, &owner) {
            (Some(claimed), Some(rec)) if *claimed != rec.project_id => {
                warn!(
                    sandbox_id = %event.sandbox_id,
                    claimed = %claimed,
                    owner = %rec.project_id,
                    "webhook ownership conflict, not applied"
                );
                return Ok(WebhookOutcome::OwnershipConflict {
                    sandbox_id: event.sandbox_id.clone(),
                    claimed_project: claimed.clone(),
                    owning_project: rec.project_id.clone(),
                });
            }
            (Some(claimed), _) => claimed.clone(),
            (None, Some(rec)) => rec.project_id.clone(),
            (None, None) => {
                debug!(sandbox_id = %event.sandbox_id, kind = ?event.kind, "webhook for untracked sandbox");
                return Ok(WebhookOutcome::Untracked {
                    sandbox_id: event.sandbox_id.clone(),
                });
            }
        };

        let current = self.status(&project_id).await?;
        let outcome = match event.kind {
            LifecycleKind::Created => self.apply_created(&project_id, current, event).await?,
            _ => self.apply_transition(&project_id, current, event).await?,
        };
        if let WebhookOutcome::Applied { status, .. } = &outcome {
            info!(project_id = %project_id, sandbox_id = %event.sandbox_id, kind = ?event.kind, %status, "webhook applied");
            self.publish(&project_id).await;
        }
        Ok(outcome)
    }

    async fn apply_created(
        &self,
        project_id: &str,
        current: Option<SandboxRecord>,
        event: &LifecycleEvent,
    ) -> SandboxResult<WebhookOutcome> {
        let policy = MergePolicy::for_kind(LifecycleKind::Created);

        if let Some(rec) = &current
            && rec.sandbox_id == event.sandbox_id
        {
            if rec.status != SandboxStatus::Unknown {
                return Ok(WebhookOutcome::Ignored {
                    reason: format!("sandbox already tracked as {}", rec.status),
                });
            }
            return self.transition(project_id, rec, event, policy).await;
        }

        if !policy.permits(current.as_ref().map(|r| r.status)) {
            return Ok(WebhookOutcome::Ignored {
                reason: "project already has a live sandbox".into(),
            });
        }
        if let Some(rec) = &current
            && event.timestamp < rec.freshness()
        {
            return Ok(WebhookOutcome::Stale {
                project_id: project_id.to_string(),
            });
        }

        let observed = current.as_ref().map(|r| r.generation);
        let record = SandboxRecord {
            project_id: project_id.to_string(),
            sandbox_id: event.sandbox_id.clone(),
            url: self.preview_url(&event.sandbox_id),
            status: SandboxStatus::Starting,
            generation: observed.unwrap_or(0) + 1,
            last_active_at: event.timestamp,
            status_changed_at: event.timestamp,
            expires_at: self.expiry_from(event.timestamp),
            last_synced_fragment_id: None,
            created_at: event.timestamp,
            updated_at: event.timestamp,
        };
        let installed = self
            .db(move |db| db.install_sandbox(&record, observed))
            .await?;
        if installed {
            Ok(WebhookOutcome::Applied {
                project_id: project_id.to_string(),
                status: SandboxStatus::Starting,
            })
        } else {
            Ok(WebhookOutcome::Ignored {
                reason: "record replaced concurrently".into(),
            })
        }
    }

    async fn apply_transition(
        &self,
        project_id: &str,
        current: Option<SandboxRecord>,
        event: &LifecycleEvent,
    ) -> SandboxResult<WebhookOutcome> {
        let Some(rec) = current else {
            return Ok(WebhookOutcome::Untracked {
                sandbox_id: event.sandbox_id.clone(),
            });
        };
        if rec.sandbox_id != event.sandbox_id {
            return Ok(WebhookOutcome::Ignored {
                reason: format!("sandbox {} superseded by {}", event.sandbox_id, rec.sandbox_id),
            });
        }
        let policy = MergePolicy::for_kind(event.kind);
        if !policy.permits(Some(rec.status)) {
            return Ok(WebhookOutcome::Ignored {
                reason: format!("{:?} not allowed from {}", event.kind, rec.status),
            });
        }
        self.transition(project_id, &rec, event, policy).await
    }

    async fn transition(
        &self,
        project_id: &str,
        rec: &SandboxRecord,
        event: &LifecycleEvent,
        policy: MergePolicy,
    ) -> SandboxResult<WebhookOutcome> {
        if policy.stale_check && event.timestamp < rec.freshness() {
            debug!(project_id, sandbox_id = %rec.sandbox_id, kind = ?event.kind, "stale webhook rejected");
            return Ok(WebhookOutcome::Stale {
                project_id: project_id.to_string(),
            });
        }
        let to = policy.target(rec.status);
        if to == rec.status {
            return Ok(WebhookOutcome::Applied {
                project_id: project_id.to_string(),
                status: to,
            });
        }

        let (pid, sid, from, at) = (
            project_id.to_string(),
            rec.sandbox_id.clone(),
            rec.status,
            event.timestamp,
        );
        let stale_check = policy.stale_check;
        let changed = self
            .db(move |db| {
                let from_set = [from];
                let allowed: &[SandboxStatus] = if stale_check { &from_set } else { &[] };
                let guard = stale_check.then_some(at);
                db.transition_sandbox(&pid, &sid, allowed, to, &at, guard.as_ref())
            })
            .await?;
        if changed {
            Ok(WebhookOutcome::Applied {
                project_id: project_id.to_string(),
                status: to,
            })
        } else {
            Ok(WebhookOutcome::Stale {
                project_id: project_id.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::test_support::harness;
    use super::*;
    use chrono::Duration;
    use crate::sandbox::provider::Clock;

    fn event(kind: LifecycleKind, sandbox_id: &str, ts: DateTime<Utc>, project: Option<&str>) -> LifecycleEvent {
        LifecycleEvent {
            kind,
            sandbox_id: sandbox_id.into(),
            timestamp: ts,
            project_id: project.map(str::to_string),
        }
    }

    #[test]
    fn test_parse_webhook_with_metadata() {
        let body = br#"{"type":"sandbox.lifecycle.paused","sandbox_id":"sbx-1","timestamp":"2026-03-01T12:00:00Z","event_data":{"sandbox_metadata":{"projectId":"p1"}}}"#;
        match parse_webhook(body).unwrap() {
            ParsedWebhook::Event(e) => {
                assert_eq!(e.kind, LifecycleKind::Paused);
                assert_eq!(e.sandbox_id, "sbx-1");
                assert_eq!(e.project_id.as_deref(), Some("p1"));
            }
            other => panic!("Expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_webhook_unknown_type_is_ignored() {
        let body = br#"{"type":"sandbox.lifecycle.snapshotted","sandbox_id":"s","timestamp":"2026-03-01T12:00:00Z"}"#;
        assert_eq!(
            parse_webhook(body).unwrap(),
            ParsedWebhook::Ignored {
                event_type: "sandbox.lifecycle.snapshotted".into()
            }
        );
    }

    #[test]
    fn test_parse_webhook_malformed() {
        assert!(matches!(parse_webhook(b"not json"), Err(WebhookError::Malformed(_))));
        assert!(matches!(
            parse_webhook(br#"{"type":"killed","sandbox_id":"","timestamp":"2026-03-01T12:00:00Z"}"#),
            Err(WebhookError::Malformed(_))
        ));
    }

    #[test]
    fn test_signature_accept_and_reject() {
        let body = b"{\"a\":1}";
        let sig = sign("s3cret", body);
        assert!(verify_signature(Some("s3cret"), Some(&sig), body).is_ok());
        assert!(verify_signature(Some("s3cret"), Some(&sig.to_uppercase()), body).is_ok());
        assert!(verify_signature(Some("s3cret"), Some(&format!("sha256={sig}")), body).is_ok());
        assert!(matches!(
            verify_signature(Some("s3cret"), Some("deadbeef"), body),
            Err(WebhookError::InvalidSignature)
        ));
        assert!(matches!(
            verify_signature(Some("s3cret"), None, body),
            Err(WebhookError::MissingSignature)
        ));
        assert!(matches!(
            verify_signature(Some("other"), Some(&sig), body),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn test_no_secret_disables_verification() {
        assert!(verify_signature(None, None, b"anything").is_ok());
    }

    #[test]
    fn test_merge_policy_table() {
        use SandboxStatus::*;
        let created = MergePolicy::for_kind(LifecycleKind::Created);
        assert!(created.permits(None));
        assert!(created.permits(Some(Killed)));
        assert!(created.permits(Some(Unknown)));
        assert!(!created.permits(Some(Running)));

        let paused = MergePolicy::for_kind(LifecycleKind::Paused);
        assert!(paused.permits(Some(Running)));
        assert!(paused.permits(Some(Starting)));
        assert!(!paused.permits(Some(Killed)));
        assert!(!paused.permits(None));

        let resumed = MergePolicy::for_kind(LifecycleKind::Resumed);
        assert!(resumed.permits(Some(Paused)));
        assert!(!resumed.permits(Some(Running)));

        let updated = MergePolicy::for_kind(LifecycleKind::Updated);
        assert_eq!(updated.target(Unknown), Running);
        assert_eq!(updated.target(Paused), Paused);
        assert!(!updated.permits(Some(Expired)));

        let killed = MergePolicy::for_kind(LifecycleKind::Killed);
        assert!(killed.permits(Some(Terminated)));
        assert!(!killed.stale_check);
    }

    #[tokio::test]
    async fn test_killed_wins_regardless_of_order() {
        // paused at T+0, killed at T+5; deliver killed first.
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let t0 = h.clock.now() + Duration::seconds(1);

        let killed = event(LifecycleKind::Killed, &lease.sandbox_id, t0 + Duration::seconds(5), Some("p1"));
        let paused = event(LifecycleKind::Paused, &lease.sandbox_id, t0, Some("p1"));

        assert!(matches!(
            h.manager.apply_webhook(&killed).await.unwrap(),
            WebhookOutcome::Applied { status: SandboxStatus::Killed, .. }
        ));
        assert!(matches!(
            h.manager.apply_webhook(&paused).await.unwrap(),
            WebhookOutcome::Ignored { .. }
        ));
        let rec = h.manager.status("p1").await.unwrap().unwrap();
        assert_eq!(rec.status, SandboxStatus::Killed);
    }

    #[tokio::test]
    async fn test_killed_wins_in_natural_order_too() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let t0 = h.clock.now() + Duration::seconds(1);
        h.manager
            .apply_webhook(&event(LifecycleKind::Paused, &lease.sandbox_id, t0, None))
            .await
            .unwrap();
        h.manager
            .apply_webhook(&event(LifecycleKind::Killed, &lease.sandbox_id, t0 + Duration::seconds(5), None))
            .await
            .unwrap();
        assert_eq!(
            h.manager.status("p1").await.unwrap().unwrap().status,
            SandboxStatus::Killed
        );
    }

    #[tokio::test]
    async fn test_stale_paused_does_not_override_recent_activity() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let early = h.clock.now();
        h.clock.advance(Duration::seconds(30));
        h.manager.touch("p1", &lease.sandbox_id).await.unwrap();

        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Paused, &lease.sandbox_id, early - Duration::seconds(1), None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Stale { .. }));
        assert_eq!(
            h.manager.status("p1").await.unwrap().unwrap().status,
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn test_killed_ignores_staleness() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        h.clock.advance(Duration::seconds(60));
        h.manager.touch("p1", &lease.sandbox_id).await.unwrap();
        let old = h.clock.now() - Duration::seconds(600);
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Killed, &lease.sandbox_id, old, None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied { status: SandboxStatus::Killed, .. }));
    }

    #[tokio::test]
    async fn test_resumed_after_pause() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let t = h.clock.now();
        h.manager
            .apply_webhook(&event(LifecycleKind::Paused, &lease.sandbox_id, t + Duration::seconds(1), None))
            .await
            .unwrap();
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Resumed, &lease.sandbox_id, t + Duration::seconds(2), None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied { status: SandboxStatus::Running, .. }));
    }

    #[tokio::test]
    async fn test_created_for_unknown_project_upserts_starting() {
        let h = harness();
        let t = h.clock.now();
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Created, "sbx-ext", t, Some("p9")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied { status: SandboxStatus::Starting, .. }));
        let rec = h.manager.status("p9").await.unwrap().unwrap();
        assert_eq!(rec.sandbox_id, "sbx-ext");
        assert_eq!(rec.generation, 1);
    }

    #[tokio::test]
    async fn test_created_does_not_replace_live_sandbox() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Created, "sbx-other", h.clock.now(), Some("p1")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(
            h.manager.status("p1").await.unwrap().unwrap().sandbox_id,
            lease.sandbox_id
        );
    }

    #[tokio::test]
    async fn test_superseded_sandbox_events_are_ignored() {
        let h = harness();
        let first = h.manager.ensure("p1", None).await.unwrap();
        h.provider.forget(&first.sandbox_id);
        let second = h.manager.ensure("p1", None).await.unwrap();
        assert_ne!(first.sandbox_id, second.sandbox_id);

        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Killed, &first.sandbox_id, h.clock.now(), Some("p1")))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Ignored { .. }));
        assert_eq!(
            h.manager.status("p1").await.unwrap().unwrap().status,
            SandboxStatus::Running
        );
    }

    #[tokio::test]
    async fn test_reverse_lookup_without_metadata() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Paused, &lease.sandbox_id, h.clock.now(), None))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::Applied {
                project_id: "p1".into(),
                status: SandboxStatus::Paused
            }
        );
    }

    #[tokio::test]
    async fn test_untracked_sandbox_without_metadata() {
        let h = harness();
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Paused, "ghost", h.clock.now(), None))
            .await
            .unwrap();
        assert!(matches!(outcome, WebhookOutcome::Untracked { .. }));
    }

    #[tokio::test]
    async fn test_ownership_conflict_is_flagged_not_applied() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let outcome = h
            .manager
            .apply_webhook(&event(LifecycleKind::Killed, &lease.sandbox_id, h.clock.now(), Some("p2")))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            WebhookOutcome::OwnershipConflict {
                sandbox_id: lease.sandbox_id.clone(),
                claimed_project: "p2".into(),
                owning_project: "p1".into(),
            }
        );
        assert_eq!(
            h.manager.status("p1").await.unwrap().unwrap().status,
            SandboxStatus::Running
        );
        assert!(h.manager.status("p2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_harmless() {
        let h = harness();
        let lease = h.manager.ensure("p1", None).await.unwrap();
        let paused = event(LifecycleKind::Paused, &lease.sandbox_id, h.clock.now(), None);
        h.manager.apply_webhook(&paused).await.unwrap();
        let again = h.manager.apply_webhook(&paused).await.unwrap();
        assert!(matches!(again, WebhookOutcome::Ignored { .. }));
        assert_eq!(
            h.manager.status("p1").await.unwrap().unwrap().status,
            SandboxStatus::Paused
        );
    }
}
