use poml_config::QuotaSettings;
use poml_core::{CounterStore, Identity, PomlError, QuotaDenial, Result, Tier};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::debug;

pub mod store;

pub use store::{FileCounterStore, MemoryCounterStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QuotaDecision {
    Allowed,
    Denied(QuotaDenial),
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }
}

/// Proof of a single commit, used to undo it if the caller cannot finish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReceipt {
    pub partition: String,
    pub previous: u32,
    pub current: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub tier: Tier,
    pub used: u32,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
}

/// Tracks consumed conversions per identity partition against tier limits.
///
/// Checking never mutates. Only `commit` moves a counter, one step at a time.
pub struct QuotaLedger {
    store: Arc<dyn CounterStore>,
    trial_limit: u32,
    bonus_limit: u32,
    write_lock: Mutex<()>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn CounterStore>, settings: &QuotaSettings) -> Self {
        Self::with_limits(store, settings.trial_limit, settings.bonus_limit())
    }

    pub fn with_limits(store: Arc<dyn CounterStore>, trial_limit: u32, bonus_limit: u32) -> Self {
        Self {
            store,
            trial_limit,
            bonus_limit,
            write_lock: Mutex::new(()),
        }
    }

    /// `None` means unlimited.
    pub fn limit_for(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Trial => Some(self.trial_limit),
            Tier::Bonus => Some(self.bonus_limit),
            Tier::Pro => None,
        }
    }

    pub fn used(&self, identity: &Identity) -> Result<u32> {
        self.store.get(&identity.partition_key())
    }

    pub fn check_and_reserve(&self, identity: &Identity, tier: Tier) -> Result<QuotaDecision> {
        let Some(limit) = self.limit_for(tier) else {
            return Ok(QuotaDecision::Allowed);
        };

        let used = self.used(identity)?;
        if used < limit {
            return Ok(QuotaDecision::Allowed);
        }

        let reason = match tier {
            Tier::Trial => QuotaDenial::TrialExhausted,
            _ => QuotaDenial::BonusExhausted,
        };
        debug!(partition = %identity.partition_key(), %tier, used, limit, "Quota denied");
        Ok(QuotaDecision::Denied(reason))
    }

    /// Charge one conversion. Not idempotent: every call counts.
    pub fn commit(&self, identity: &Identity) -> Result<CommitReceipt> {
        let _guard = self.lock()?;
        let partition = identity.partition_key();

        let previous = self.store.get(&partition)?;
        let current = previous.saturating_add(1);
        self.store.set(&partition, current)?;

        debug!(partition = %partition, used = current, "Quota committed");
        Ok(CommitReceipt {
            partition,
            previous,
            current,
        })
    }

    /// Undo a commit, only if nothing was committed on the partition since.
    pub fn revert(&self, receipt: &CommitReceipt) -> Result<bool> {
        let _guard = self.lock()?;

        if self.store.get(&receipt.partition)? != receipt.current {
            return Ok(false);
        }
        self.store.set(&receipt.partition, receipt.previous)?;

        debug!(partition = %receipt.partition, used = receipt.previous, "Quota commit reverted");
        Ok(true)
    }

    pub fn remaining(&self, identity: &Identity, tier: Tier) -> Result<Option<u32>> {
        Ok(self.usage(identity, tier)?.remaining)
    }

    pub fn usage(&self, identity: &Identity, tier: Tier) -> Result<QuotaUsage> {
        let used = self.used(identity)?;
        let limit = self.limit_for(tier);

        Ok(QuotaUsage {
            tier,
            used,
            limit,
            remaining: limit.map(|l| l.saturating_sub(used)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| PomlError::StorageError("quota ledger lock poisoned".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> QuotaLedger {
        QuotaLedger::new(Arc::new(MemoryCounterStore::new()), &QuotaSettings::default())
    }

    #[test]
    fn test_limits() {
        let ledger = ledger();
        assert_eq!(ledger.limit_for(Tier::Trial), Some(2));
        assert_eq!(ledger.limit_for(Tier::Bonus), Some(22));
        assert_eq!(ledger.limit_for(Tier::Pro), None);
    }

    #[test]
    fn test_check_has_no_side_effect() {
        let ledger = ledger();
        let guest = Identity::Anonymous;

        let first = ledger.check_and_reserve(&guest, Tier::Trial).unwrap();
        let second = ledger.check_and_reserve(&guest, Tier::Trial).unwrap();

        assert_eq!(first, second);
        assert_eq!(ledger.used(&guest).unwrap(), 0);
    }

    #[test]
    fn test_trial_exhaustion() {
        let ledger = ledger();
        let guest = Identity::Anonymous;

        ledger.commit(&guest).unwrap();
        assert!(ledger.check_and_reserve(&guest, Tier::Trial).unwrap().is_allowed());

        ledger.commit(&guest).unwrap();
        assert_eq!(
            ledger.check_and_reserve(&guest, Tier::Trial).unwrap(),
            QuotaDecision::Denied(QuotaDenial::TrialExhausted)
        );
        assert_eq!(ledger.remaining(&guest, Tier::Trial).unwrap(), Some(0));
    }

    #[test]
    fn test_bonus_partition_starts_fresh() {
        let ledger = ledger();
        let guest = Identity::Anonymous;
        let user = Identity::authenticated("u1", "u1@example.com");

        ledger.commit(&guest).unwrap();
        ledger.commit(&guest).unwrap();

        assert_eq!(ledger.used(&user).unwrap(), 0);
        assert!(ledger.check_and_reserve(&user, Tier::Bonus).unwrap().is_allowed());

        for _ in 0..22 {
            ledger.commit(&user).unwrap();
        }
        assert_eq!(
            ledger.check_and_reserve(&user, Tier::Bonus).unwrap(),
            QuotaDecision::Denied(QuotaDenial::BonusExhausted)
        );
    }

    #[test]
    fn test_pro_is_unlimited() {
        let ledger = ledger();
        let user = Identity::authenticated("pro", "pro@example.com");

        for _ in 0..50 {
            ledger.commit(&user).unwrap();
        }
        assert!(ledger.check_and_reserve(&user, Tier::Pro).unwrap().is_allowed());

        let usage = ledger.usage(&user, Tier::Pro).unwrap();
        assert_eq!(usage.used, 50);
        assert_eq!(usage.remaining, None);
    }

    #[test]
    fn test_commit_double_counts() {
        let ledger = ledger();
        let guest = Identity::Anonymous;

        let first = ledger.commit(&guest).unwrap();
        let second = ledger.commit(&guest).unwrap();

        assert_eq!(first.current, 1);
        assert_eq!(second.previous, 1);
        assert_eq!(ledger.used(&guest).unwrap(), 2);
    }

    #[test]
    fn test_revert_only_latest_commit() {
        let ledger = ledger();
        let guest = Identity::Anonymous;

        let stale = ledger.commit(&guest).unwrap();
        let latest = ledger.commit(&guest).unwrap();

        assert!(!ledger.revert(&stale).unwrap());
        assert_eq!(ledger.used(&guest).unwrap(), 2);

        assert!(ledger.revert(&latest).unwrap());
        assert_eq!(ledger.used(&guest).unwrap(), 1);
    }
}
