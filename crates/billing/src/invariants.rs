//! Consistency checks between tenants and billing records

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use tenantops_shared::{SubscriptionStatus, Tenant, TenantStatus};

use crate::config::DunningConfig;
use crate::record::BillingRecord;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// Tenant ACTIVE but the subscription is not, or the reverse
    StatusMismatch {
        tenant_status: TenantStatus,
        subscription_status: SubscriptionStatus,
    },
    /// Retries counted without an open failure episode
    RetriesWithoutEpisode { retry_count: i32 },
    /// Warning flagged before the threshold was reached
    PrematureWarning { retry_count: i32, threshold: i32 },
    /// Billing record without a tenant row
    OrphanRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvariantViolation {
    pub tenant_id: Uuid,
    #[serde(flatten)]
    pub violation: Violation,
}

/// Report every violated invariant, ordered by tenant id
pub fn check_invariants(
    records: &[BillingRecord],
    tenants: &[Tenant],
    config: &DunningConfig,
) -> Vec<InvariantViolation> {
    let tenants: HashMap<Uuid, &Tenant> = tenants.iter().map(|t| (t.id, t)).collect();
    let mut violations = Vec::new();

    for record in records {
        let mut push = |violation| {
            violations.push(InvariantViolation {
                tenant_id: record.tenant_id,
                violation,
            })
        };

        match tenants.get(&record.tenant_id) {
            None => push(Violation::OrphanRecord),
            Some(tenant) => {
                let tenant_active = tenant.status == TenantStatus::Active;
                let record_active = record.subscription_status == SubscriptionStatus::Active;
                if tenant_active != record_active {
                    push(Violation::StatusMismatch {
                        tenant_status: tenant.status,
                        subscription_status: record.subscription_status,
                    });
                }
            }
        }

        if record.retry_count > 0 && record.first_failure_at.is_none() {
            push(Violation::RetriesWithoutEpisode {
                retry_count: record.retry_count,
            });
        }

        if record.warning_sent && record.retry_count < config.warning_threshold {
            push(Violation::PrematureWarning {
                retry_count: record.retry_count,
                threshold: config.warning_threshold,
            });
        }
    }

    violations.sort_by_key(|v| v.tenant_id);
    violations
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantops_shared::TenantId;
    use time::OffsetDateTime;

    fn pair() -> (BillingRecord, Tenant) {
        let tenant = Tenant::new("Bayview Karate", None, OffsetDateTime::UNIX_EPOCH);
        let record = BillingRecord::new(
            TenantId(tenant.id),
            "cus_1",
            "sub_1",
            Some("pm_1".to_string()),
            OffsetDateTime::UNIX_EPOCH,
        );
        (record, tenant)
    }

    #[test]
    fn test_consistent_pair_has_no_violations() {
        let (record, tenant) = pair();
        assert!(check_invariants(&[record], &[tenant], &DunningConfig::default()).is_empty());
    }

    #[test]
    fn test_status_mismatch_both_directions() {
        let config = DunningConfig::default();

        let (mut record, tenant) = pair();
        record.subscription_status = SubscriptionStatus::PastDue;
        record.first_failure_at = Some(OffsetDateTime::UNIX_EPOCH);
        let found = check_invariants(&[record], &[tenant], &config);
        assert_eq!(found.len(), 1);
        assert!(matches!(found[0].violation, Violation::StatusMismatch { .. }));

        let (record, mut tenant) = pair();
        tenant.status = TenantStatus::Suspended;
        let found = check_invariants(&[record], &[tenant], &config);
        assert!(matches!(found[0].violation, Violation::StatusMismatch { .. }));
    }

    #[test]
    fn test_counter_violations() {
        let (mut record, tenant) = pair();
        record.retry_count = 1;
        record.warning_sent = true;

        let found = check_invariants(&[record], &[tenant], &DunningConfig::default());
        assert_eq!(found.len(), 2);
        assert!(found
            .iter()
            .any(|v| v.violation == Violation::RetriesWithoutEpisode { retry_count: 1 }));
        assert!(found.iter().any(|v| v.violation
            == Violation::PrematureWarning {
                retry_count: 1,
                threshold: 3
            }));
    }

    #[test]
    fn test_orphan_record() {
        let (record, _) = pair();
        let found = check_invariants(&[record], &[], &DunningConfig::default());
        assert_eq!(found[0].violation, Violation::OrphanRecord);
    }

    #[test]
    fn test_serializes_flat() {
        let (record, _) = pair();
        let found = check_invariants(&[record], &[], &DunningConfig::default());
        let json = serde_json::to_value(&found[0]).unwrap();
        assert_eq!(json["kind"], "orphan_record");
        assert!(json["tenant_id"].is_string());
    }
}
