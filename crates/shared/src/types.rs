//! Common types used across TenantOps

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::SharedError;

// =============================================================================
// ID Wrappers
// =============================================================================

/// Tenant ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TenantId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Tenant access status
///
/// - Active: full access
/// - PastDue: a charge failed, dunning in progress
/// - Suspended / Paused / Deactivated: restricted by the external grace-period policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TenantStatus {
    Active,
    PastDue,
    Suspended,
    Paused,
    Deactivated,
}

impl Default for TenantStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl TenantStatus {
    /// Check if the tenant has full access
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Any status other than Active restricts mutating operations
    pub fn is_restricted(&self) -> bool {
        !self.is_active()
    }

    /// Statuses only an external grace-period policy may assign
    pub fn is_policy_restriction(&self) -> bool {
        matches!(self, Self::Suspended | Self::Paused | Self::Deactivated)
    }

    /// Validate a status requested by the grace-period policy
    pub fn require_policy_restriction(self) -> Result<Self, SharedError> {
        if self.is_policy_restriction() {
            Ok(self)
        } else {
            Err(SharedError::InvalidTransition(format!(
                "{} is not a policy restriction",
                self
            )))
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::PastDue => "PAST_DUE",
            Self::Suspended => "SUSPENDED",
            Self::Paused => "PAUSED",
            Self::Deactivated => "DEACTIVATED",
        }
    }
}

impl std::fmt::Display for TenantStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TenantStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "ACTIVE" => Ok(Self::Active),
            "PAST_DUE" => Ok(Self::PastDue),
            "SUSPENDED" => Ok(Self::Suspended),
            "PAUSED" => Ok(Self::Paused),
            "DEACTIVATED" => Ok(Self::Deactivated),
            _ => Err(format!("Invalid tenant status: {}", s)),
        }
    }
}

/// Subscription status mirrored from the payment gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Map a raw gateway subscription status onto the mirrored set.
    /// Unpaid and incomplete subscriptions are treated as past due.
    pub fn from_gateway(raw: &str) -> Option<Self> {
        match raw {
            "active" | "trialing" => Some(Self::Active),
            "past_due" | "unpaid" | "incomplete" => Some(Self::PastDue),
            "canceled" | "incomplete_expired" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "canceled" => Ok(Self::Canceled),
            _ => Err(format!("Invalid subscription status: {}", s)),
        }
    }
}

/// User role within a tenant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::Member
    }
}

impl UserRole {
    /// Get the permission level for this role (higher = more permissions)
    /// Owner: 3, Admin: 2, Member: 1, Viewer: 0
    pub fn level(&self) -> u8 {
        match self {
            Self::Owner => 3,
            Self::Admin => 2,
            Self::Member => 1,
            Self::Viewer => 0,
        }
    }

    /// Only Owner and Admin can administer the tenant (including paying overdue balances)
    pub fn can_administer(&self) -> bool {
        self.level() >= 2
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Admin => "admin",
            Self::Member => "member",
            Self::Viewer => "viewer",
        }
    }

    /// Parse a role from string (case insensitive)
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "owner" => Self::Owner,
            "admin" => Self::Admin,
            "member" => Self::Member,
            "viewer" => Self::Viewer,
            _ => Self::Member, // Default to member for unknown roles
        }
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// Tenant model
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub owner_email: Option<String>,
    pub status: TenantStatus,
    /// Why the tenant is restricted (set by the grace-period policy)
    pub status_reason: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_date: Option<OffsetDateTime>,
    pub payment_failure_count: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Tenant {
    /// Create a new active tenant
    pub fn new(name: impl Into<String>, owner_email: Option<String>, now: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            owner_email,
            status: TenantStatus::Active,
            status_reason: None,
            last_payment_date: None,
            payment_failure_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        TenantId(self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_status_round_trip_strings() {
        for status in [
            TenantStatus::Active,
            TenantStatus::PastDue,
            TenantStatus::Suspended,
            TenantStatus::Paused,
            TenantStatus::Deactivated,
        ] {
            assert_eq!(status.to_string().parse::<TenantStatus>(), Ok(status));
        }
        assert!("frozen".parse::<TenantStatus>().is_err());
    }

    #[test]
    fn test_tenant_status_restriction() {
        assert!(!TenantStatus::Active.is_restricted());
        assert!(TenantStatus::PastDue.is_restricted());
        assert!(!TenantStatus::PastDue.is_policy_restriction());
        assert!(TenantStatus::Suspended.is_policy_restriction());
        assert!(TenantStatus::Deactivated.require_policy_restriction().is_ok());
        assert!(TenantStatus::Active.require_policy_restriction().is_err());
    }

    #[test]
    fn test_tenant_status_serde() {
        let json = serde_json::to_string(&TenantStatus::PastDue).unwrap();
        assert_eq!(json, "\"PAST_DUE\"");
    }

    #[test]
    fn test_subscription_status_from_gateway() {
        assert_eq!(SubscriptionStatus::from_gateway("active"), Some(SubscriptionStatus::Active));
        assert_eq!(SubscriptionStatus::from_gateway("unpaid"), Some(SubscriptionStatus::PastDue));
        assert_eq!(SubscriptionStatus::from_gateway("canceled"), Some(SubscriptionStatus::Canceled));
        assert_eq!(SubscriptionStatus::from_gateway("paused_forever"), None);
    }

    #[test]
    fn test_user_role_administer() {
        assert!(UserRole::Owner.can_administer());
        assert!(UserRole::Admin.can_administer());
        assert!(!UserRole::Member.can_administer());
        assert_eq!(UserRole::from_str_lossy("ADMIN"), UserRole::Admin);
        assert_eq!(UserRole::from_str_lossy("unknown"), UserRole::Member);
    }

    #[test]
    fn test_new_tenant_is_active() {
        let tenant = Tenant::new("Acme School", None, OffsetDateTime::UNIX_EPOCH);
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(tenant.payment_failure_count, 0);
    }
}
