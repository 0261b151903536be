//! Pending Transfer Core Types
//!
//! Record model shared by the store, the workers and the HTTP surface.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::state::TransferStatus;

/// Opaque caller correlation bag, never interpreted by the pool except for
/// the reserved keys in [`meta_keys`].
pub type Metadata = BTreeMap<String, String>;

/// Metadata keys written by the pool itself.
pub mod meta_keys {
    pub const REJECT_REASON: &str = "reject_reason";
    pub const REJECT_DETAIL: &str = "reject_detail";
    pub const FAILED_PREDICATE: &str = "failed_predicate";
    pub const EXECUTION_ERROR: &str = "execution_error";
    pub const EXECUTION_ERROR_KIND: &str = "execution_error_kind";
}

/// Current wall clock in epoch milliseconds
#[inline]
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Pending transfer ID - UUID v4, assigned at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(uuid::Uuid);

impl TransferId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(uuid::Uuid::parse_str(s)?))
    }
}

/// The closed set of validation predicates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    Balance,
    Cooldown,
    DailyLimit,
}

impl Predicate {
    pub const ALL: [Predicate; 3] = [Predicate::Balance, Predicate::Cooldown, Predicate::DailyLimit];

    #[inline]
    fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::Balance => "balance",
            Predicate::Cooldown => "cooldown",
            Predicate::DailyLimit => "daily_limit",
        }
    }

    /// Reason code used when this predicate fails definitively
    pub fn failure_reason(&self) -> RejectReason {
        match self {
            Predicate::Balance => RejectReason::InsufficientFunds,
            Predicate::Cooldown => RejectReason::CooldownActive,
            Predicate::DailyLimit => RejectReason::DailyLimitExceeded,
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Predicate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Predicate::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| format!("unknown predicate: {}", s))
    }
}

/// Tri-state predicate result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    #[default]
    Unknown,
    Pass,
    Fail,
}

impl CheckOutcome {
    /// Join of two reports for the same predicate within one round.
    ///
    /// `Unknown` is the identity and `Fail` absorbs `Pass`, so merging is
    /// commutative, associative and idempotent.
    #[inline]
    pub fn merge(self, other: CheckOutcome) -> CheckOutcome {
        match (self, other) {
            (CheckOutcome::Fail, _) | (_, CheckOutcome::Fail) => CheckOutcome::Fail,
            (CheckOutcome::Pass, _) | (_, CheckOutcome::Pass) => CheckOutcome::Pass,
            _ => CheckOutcome::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CheckOutcome::Unknown => "unknown",
            CheckOutcome::Pass => "pass",
            CheckOutcome::Fail => "fail",
        }
    }
}

impl fmt::Display for CheckOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-predicate results, one slot per [`Predicate`].
///
/// Keys are fixed by construction; serialized as a JSON object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "ChecksRepr", into = "ChecksRepr")]
pub struct Checks([CheckOutcome; 3]);

impl Checks {
    pub fn get(&self, predicate: Predicate) -> CheckOutcome {
        self.0[predicate.index()]
    }

    /// Merge a report into the slot; returns true if the slot changed
    pub fn merge(&mut self, predicate: Predicate, outcome: CheckOutcome) -> bool {
        let slot = &mut self.0[predicate.index()];
        let merged = slot.merge(outcome);
        let changed = merged != *slot;
        *slot = merged;
        changed
    }

    /// Clear slots back to `Unknown` for a new retry round
    pub fn reset(&mut self, predicates: &[Predicate]) {
        for p in predicates {
            self.0[p.index()] = CheckOutcome::Unknown;
        }
    }

    pub fn all_passed(&self) -> bool {
        self.0.iter().all(|o| *o == CheckOutcome::Pass)
    }

    pub fn failed(&self) -> Vec<Predicate> {
        self.matching(|o| o == CheckOutcome::Fail)
    }

    /// Predicates that still need a result (`Unknown` or `Fail`)
    pub fn outstanding(&self) -> Vec<Predicate> {
        self.matching(|o| o != CheckOutcome::Pass)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Predicate, CheckOutcome)> + '_ {
        Predicate::ALL.into_iter().map(|p| (p, self.get(p)))
    }

    fn matching(&self, f: impl Fn(CheckOutcome) -> bool) -> Vec<Predicate> {
        Predicate::ALL
            .into_iter()
            .filter(|p| f(self.get(*p)))
            .collect()
    }
}

#[derive(Clone, Serialize, Deserialize)]
struct ChecksRepr {
    #[serde(default)]
    balance: CheckOutcome,
    #[serde(default)]
    cooldown: CheckOutcome,
    #[serde(default)]
    daily_limit: CheckOutcome,
}

impl From<ChecksRepr> for Checks {
    fn from(r: ChecksRepr) -> Self {
        Checks([r.balance, r.cooldown, r.daily_limit])
    }
}

impl From<Checks> for ChecksRepr {
    fn from(c: Checks) -> Self {
        ChecksRepr {
            balance: c.get(Predicate::Balance),
            cooldown: c.get(Predicate::Cooldown),
            daily_limit: c.get(Predicate::DailyLimit),
        }
    }
}

/// Which predicates a retry round evaluates again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecheckPolicy {
    /// Never re-check a predicate that already passed
    #[default]
    FailedOnly,
    /// Every round starts from scratch
    All,
}

impl RecheckPolicy {
    /// Slots cleared when a new round starts
    pub fn reset_set(&self, checks: &Checks) -> Vec<Predicate> {
        match self {
            RecheckPolicy::FailedOnly => checks.failed(),
            RecheckPolicy::All => Predicate::ALL.to_vec(),
        }
    }
}

/// Machine-readable reason carried by every rejected record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InsufficientFunds,
    CooldownActive,
    DailyLimitExceeded,
    RetryExhausted,
    Expired,
    ExecutionFailed,
}

impl RejectReason {
    pub const ALL: [RejectReason; 6] = [
        RejectReason::InsufficientFunds,
        RejectReason::CooldownActive,
        RejectReason::DailyLimitExceeded,
        RejectReason::RetryExhausted,
        RejectReason::Expired,
        RejectReason::ExecutionFailed,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::InsufficientFunds => "insufficient_funds",
            RejectReason::CooldownActive => "cooldown_active",
            RejectReason::DailyLimitExceeded => "daily_limit_exceeded",
            RejectReason::RetryExhausted => "retry_exhausted",
            RejectReason::Expired => "expired",
            RejectReason::ExecutionFailed => "execution_failed",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for RejectReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RejectReason::ALL
            .into_iter()
            .find(|r| r.code() == s)
            .ok_or_else(|| format!("unknown reject reason: {}", s))
    }
}

/// Creation request from the caller-facing entry point
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewTransfer {
    /// Tenant (community/guild) identifier
    pub scope: String,
    pub initiator: String,
    pub target: String,
    pub amount: i64,
    /// Lifetime before the reaper rejects the record
    #[serde(with = "ttl_secs")]
    pub ttl: Duration,
    #[serde(default)]
    pub metadata: Metadata,
}

impl NewTransfer {
    pub fn new(
        scope: impl Into<String>,
        initiator: impl Into<String>,
        target: impl Into<String>,
        amount: i64,
        ttl: Duration,
    ) -> Self {
        Self {
            scope: scope.into(),
            initiator: initiator.into(),
            target: target.into(),
            amount,
            ttl,
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

mod ttl_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(ttl: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(ttl.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// The persisted pending transfer record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingTransfer {
    pub id: TransferId,
    pub scope: String,
    pub initiator: String,
    pub target: String,
    pub amount: i64,
    pub status: TransferStatus,
    pub checks: Checks,
    /// Also the current check round; results from other rounds are stale
    pub retry_count: u32,
    /// Set once the record is rejected
    pub reason: Option<RejectReason>,
    pub metadata: Metadata,
    /// Epoch millis
    pub expires_at: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl PendingTransfer {
    /// Build a fresh record in PENDING with all checks unknown
    pub fn new(req: NewTransfer) -> Self {
        let now = now_ms();
        let ttl_ms = i64::try_from(req.ttl.as_millis()).unwrap_or(i64::MAX);

        Self {
            id: TransferId::new(),
            scope: req.scope,
            initiator: req.initiator,
            target: req.target,
            amount: req.amount,
            status: TransferStatus::Pending,
            checks: Checks::default(),
            retry_count: 0,
            reason: None,
            metadata: req.metadata,
            expires_at: now.saturating_add(ttl_ms),
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn status_view(&self) -> TransferStatusView {
        TransferStatusView {
            id: self.id,
            status: self.status,
            checks: self.checks,
            retry_count: self.retry_count,
            reason: self.reason,
            expires_at: self.expires_at,
            updated_at: self.updated_at,
        }
    }
}

impl fmt::Display for PendingTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transfer[{}] scope={} {} -> {} amount={} status={} retry={}",
            self.id,
            self.scope,
            self.initiator,
            self.target,
            self.amount,
            self.status,
            self.retry_count
        )
    }
}

/// `GetStatus` projection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferStatusView {
    pub id: TransferId,
    pub status: TransferStatus,
    pub checks: Checks,
    pub retry_count: u32,
    pub reason: Option<RejectReason>,
    pub expires_at: i64,
    pub updated_at: i64,
}

/// Result of `set_check_result`
#[derive(Debug, Clone)]
pub struct CheckMerge {
    /// Record after the merge (unchanged if the report was stale or redundant)
    pub record: PendingTransfer,
    /// Whether the stored checks changed
    pub changed: bool,
}

/// Arguments passed to the `ExecuteTransfer` collaborator
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub id: TransferId,
    pub scope: String,
    pub initiator: String,
    pub target: String,
    pub amount: i64,
    pub metadata: Metadata,
}

impl From<&PendingTransfer> for ExecutionRequest {
    fn from(r: &PendingTransfer) -> Self {
        Self {
            id: r.id,
            scope: r.scope.clone(),
            initiator: r.initiator.clone(),
            target: r.target.clone(),
            amount: r.amount,
            metadata: r.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_merge_is_a_join() {
        use CheckOutcome::*;
        let all = [Unknown, Pass, Fail];
        for a in all {
            assert_eq!(a.merge(a), a);
            assert_eq!(Unknown.merge(a), a);
            for b in all {
                assert_eq!(a.merge(b), b.merge(a));
                for c in all {
                    assert_eq!(a.merge(b).merge(c), a.merge(b.merge(c)));
                }
            }
        }
        assert_eq!(Pass.merge(Fail), Fail);
    }

    #[test]
    fn test_checks_merge_reports_change() {
        let mut checks = Checks::default();
        assert!(checks.merge(Predicate::Balance, CheckOutcome::Pass));
        assert!(!checks.merge(Predicate::Balance, CheckOutcome::Pass));
        assert!(!checks.merge(Predicate::Cooldown, CheckOutcome::Unknown));
        assert!(checks.merge(Predicate::Balance, CheckOutcome::Fail));
        assert_eq!(checks.failed(), vec![Predicate::Balance]);
        assert_eq!(checks.outstanding(), Predicate::ALL.to_vec());
    }

    #[test]
    fn test_checks_all_passed_and_reset() {
        let mut checks = Checks::default();
        for p in Predicate::ALL {
            checks.merge(p, CheckOutcome::Pass);
        }
        assert!(checks.all_passed());

        checks.reset(&[Predicate::Cooldown]);
        assert!(!checks.all_passed());
        assert_eq!(checks.outstanding(), vec![Predicate::Cooldown]);
    }

    #[test]
    fn test_checks_json_shape() {
        let mut checks = Checks::default();
        checks.merge(Predicate::DailyLimit, CheckOutcome::Fail);

        let json = serde_json::to_value(checks).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"balance": "unknown", "cooldown": "unknown", "daily_limit": "fail"})
        );

        let partial: Checks = serde_json::from_str(r#"{"balance":"pass"}"#).unwrap();
        assert_eq!(partial.get(Predicate::Balance), CheckOutcome::Pass);
        assert_eq!(partial.get(Predicate::Cooldown), CheckOutcome::Unknown);
    }

    #[test]
    fn test_recheck_policy_reset_set() {
        let mut checks = Checks::default();
        checks.merge(Predicate::Balance, CheckOutcome::Pass);
        checks.merge(Predicate::Cooldown, CheckOutcome::Fail);

        assert_eq!(RecheckPolicy::FailedOnly.reset_set(&checks), vec![Predicate::Cooldown]);
        assert_eq!(RecheckPolicy::All.reset_set(&checks), Predicate::ALL.to_vec());
    }

    #[test]
    fn test_predicate_reason_codes() {
        assert_eq!(Predicate::Balance.failure_reason().code(), "insufficient_funds");
        assert_eq!(Predicate::Cooldown.failure_reason().code(), "cooldown_active");
        assert_eq!(Predicate::DailyLimit.failure_reason().code(), "daily_limit_exceeded");
        assert_eq!("daily_limit".parse::<Predicate>(), Ok(Predicate::DailyLimit));
        assert_eq!("expired".parse::<RejectReason>(), Ok(RejectReason::Expired));
    }

    #[test]
    fn test_new_record_defaults() {
        let req = NewTransfer::new("g1", "u1", "u2", 100, Duration::from_secs(3600))
            .with_metadata("callback", "tok-1");
        let record = PendingTransfer::new(req);

        assert_eq!(record.status, TransferStatus::Pending);
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.checks, Checks::default());
        assert!(record.reason.is_none());
        assert_eq!(record.expires_at - record.created_at, 3_600_000);
        assert_eq!(record.metadata.get("callback").map(String::as_str), Some("tok-1"));
        assert!(!record.is_expired_at(record.created_at));
    }
}
