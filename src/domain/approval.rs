use crate::error::{PaymentError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Delegated,
}

/// One rung of the chain. `delegated_to` replaces the role check for this
/// level only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalLevel {
    pub level: u32,
    pub role: String,
    pub delegated_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalStep {
    pub level: u32,
    pub approver_id: String,
    pub decision: ApprovalDecision,
    pub comments: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// The acting user, as resolved by the identity collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approver {
    pub id: String,
    pub roles: Vec<String>,
}

impl Approver {
    pub fn new(id: impl Into<String>, roles: &[&str]) -> Self {
        Self {
            id: id.into(),
            roles: roles.iter().map(|r| r.to_string()).collect(),
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Multi-level sign-off for a high-value transaction.
///
/// The chain is fixed at construction. Levels are approved strictly in order
/// and a single rejection ends the whole request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub transaction_id: Uuid,
    pub amount: Decimal,
    pub requester: String,
    /// 1-based index into `chain`.
    pub current_level: u32,
    pub chain: Vec<ApprovalLevel>,
    pub steps: Vec<ApprovalStep>,
    pub status: ApprovalStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ApprovalRequest {
    pub fn new(
        transaction_id: Uuid,
        amount: Decimal,
        requester: impl Into<String>,
        roles: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if roles.is_empty() {
            return Err(PaymentError::ValidationError(
                "Approval chain cannot be empty".to_string(),
            ));
        }
        let chain = roles
            .into_iter()
            .enumerate()
            .map(|(i, role)| ApprovalLevel {
                level: i as u32 + 1,
                role,
                delegated_to: None,
            })
            .collect();
        Ok(Self {
            id: Uuid::new_v4(),
            transaction_id,
            amount,
            requester: requester.into(),
            current_level: 1,
            chain,
            steps: Vec::new(),
            status: ApprovalStatus::Pending,
            version: 0,
            created_at: now,
            completed_at: None,
        })
    }

    pub fn current(&self) -> Option<&ApprovalLevel> {
        self.chain.get(self.current_level.saturating_sub(1) as usize)
    }

    fn ensure_pending(&self) -> Result<()> {
        match self.status {
            ApprovalStatus::Pending => Ok(()),
            ApprovalStatus::Rejected => Err(PaymentError::ApprovalRejected(format!(
                "Approval request {} was rejected",
                self.id
            ))),
            other => Err(PaymentError::ValidationError(format!(
                "Approval request {} is already {:?}",
                self.id, other
            ))),
        }
    }

    /// Checks that `approver` may act on the current level, and only that one.
    pub fn authorize(&self, approver: &Approver) -> Result<()> {
        self.ensure_pending()?;
        let level = self.current().ok_or_else(|| {
            PaymentError::InternalError(
                format!("Approval request {} has no current level", self.id).into(),
            )
        })?;

        if approver.id == self.requester {
            return Err(PaymentError::Unauthorized(
                "The requester cannot sign off their own payment".to_string(),
            ));
        }
        let allowed = match &level.delegated_to {
            Some(delegate) => delegate == &approver.id,
            None => approver.has_role(&level.role),
        };
        if !allowed {
            return Err(PaymentError::Unauthorized(format!(
                "{} is not authorized for approval level {} ({})",
                approver.id, level.level, level.role
            )));
        }
        if self
            .steps
            .iter()
            .any(|s| s.decision == ApprovalDecision::Approved && s.approver_id == approver.id)
        {
            return Err(PaymentError::Unauthorized(format!(
                "{} already approved an earlier level",
                approver.id
            )));
        }
        Ok(())
    }

    /// Records an approval. Returns `true` when the last level was signed.
    pub fn approve(
        &mut self,
        approver: &Approver,
        comments: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.authorize(approver)?;
        self.steps.push(ApprovalStep {
            level: self.current_level,
            approver_id: approver.id.clone(),
            decision: ApprovalDecision::Approved,
            comments,
            decided_at: now,
        });
        if self.current_level as usize >= self.chain.len() {
            self.status = ApprovalStatus::Approved;
            self.completed_at = Some(now);
            Ok(true)
        } else {
            self.current_level += 1;
            Ok(false)
        }
    }

    pub fn reject(&mut self, approver: &Approver, reason: String, now: DateTime<Utc>) -> Result<()> {
        self.authorize(approver)?;
        self.steps.push(ApprovalStep {
            level: self.current_level,
            approver_id: approver.id.clone(),
            decision: ApprovalDecision::Rejected,
            comments: Some(reason),
            decided_at: now,
        });
        self.status = ApprovalStatus::Rejected;
        self.completed_at = Some(now);
        Ok(())
    }

    /// Hands the current level to another user. Levels and roles are untouched.
    pub fn delegate(
        &mut self,
        from: &Approver,
        to_user: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.authorize(from)?;
        if to_user == self.requester || to_user == from.id {
            return Err(PaymentError::ValidationError(format!(
                "Cannot delegate approval level {} to {}",
                self.current_level, to_user
            )));
        }
        let index = self.current_level.saturating_sub(1) as usize;
        if let Some(level) = self.chain.get_mut(index) {
            level.delegated_to = Some(to_user.to_string());
        }
        self.steps.push(ApprovalStep {
            level: self.current_level,
            approver_id: from.id.clone(),
            decision: ApprovalDecision::Delegated,
            comments: reason,
            decided_at: now,
        });
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) {
        if self.status == ApprovalStatus::Pending {
            self.status = ApprovalStatus::Cancelled;
            self.completed_at = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn two_level() -> ApprovalRequest {
        ApprovalRequest::new(
            Uuid::new_v4(),
            dec!(1000000),
            "cashier-1",
            vec!["supervisor".to_string(), "finance_manager".to_string()],
            Utc::now(),
        )
        .unwrap()
    }

    #[test]
    fn test_sequential_approval() {
        let mut request = two_level();
        let supervisor = Approver::new("sup-1", &["supervisor"]);
        let manager = Approver::new("fm-1", &["finance_manager"]);

        // Level 2 approver cannot jump the queue.
        assert!(matches!(
            request.approve(&manager, None, Utc::now()),
            Err(PaymentError::Unauthorized(_))
        ));

        assert!(!request.approve(&supervisor, None, Utc::now()).unwrap());
        assert_eq!(request.current_level, 2);
        assert!(request.approve(&manager, Some("ok".into()), Utc::now()).unwrap());
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert_eq!(request.steps.len(), 2);
    }

    #[test]
    fn test_rejection_at_first_level_is_terminal() {
        let mut request = two_level();
        let supervisor = Approver::new("sup-1", &["supervisor"]);
        let manager = Approver::new("fm-1", &["finance_manager"]);

        request
            .reject(&supervisor, "missing assessment".into(), Utc::now())
            .unwrap();
        assert_eq!(request.status, ApprovalStatus::Rejected);
        assert_eq!(request.current_level, 1);
        assert!(matches!(
            request.approve(&manager, None, Utc::now()),
            Err(PaymentError::ApprovalRejected(_))
        ));
    }

    #[test]
    fn test_rejection_at_second_level() {
        let mut request = two_level();
        let supervisor = Approver::new("sup-1", &["supervisor"]);
        let manager = Approver::new("fm-1", &["finance_manager"]);

        request.approve(&supervisor, None, Utc::now()).unwrap();
        request.reject(&manager, "duplicate".into(), Utc::now()).unwrap();
        assert_eq!(request.status, ApprovalStatus::Rejected);
    }

    #[test]
    fn test_requester_cannot_approve() {
        let mut request = two_level();
        let requester = Approver::new("cashier-1", &["supervisor"]);
        assert!(matches!(
            request.approve(&requester, None, Utc::now()),
            Err(PaymentError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_same_person_cannot_sign_two_levels() {
        let mut request = two_level();
        let both = Approver::new("boss", &["supervisor", "finance_manager"]);
        request.approve(&both, None, Utc::now()).unwrap();
        assert!(matches!(
            request.approve(&both, None, Utc::now()),
            Err(PaymentError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_delegation_only_affects_current_level() {
        let mut request = two_level();
        let supervisor = Approver::new("sup-1", &["supervisor"]);
        let deputy = Approver::new("deputy", &[]);

        request
            .delegate(&supervisor, "deputy", Some("on leave".into()), Utc::now())
            .unwrap();
        assert_eq!(request.chain[0].delegated_to.as_deref(), Some("deputy"));
        assert_eq!(request.chain[1].delegated_to, None);
        assert_eq!(request.chain.len(), 2);

        // The original role holder no longer owns the step.
        assert!(request.approve(&supervisor, None, Utc::now()).is_err());
        assert!(!request.approve(&deputy, None, Utc::now()).unwrap());
        assert_eq!(request.current_level, 2);
    }

    #[test]
    fn test_empty_chain_rejected() {
        assert!(ApprovalRequest::new(Uuid::new_v4(), dec!(1), "a", vec![], Utc::now()).is_err());
    }
}
