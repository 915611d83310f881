use poml_client::{ConversionClient, Converter};
use poml_config::ConverterConfig;
use poml_core::{
    ConversionRecord, ConversionRequest, ConversionResult, FailureKind, Identity, PomlError,
    QuotaDenial, Result, Tier,
};
use poml_history::{FileHistoryBackend, HistoryStore};
use poml_quota::{CommitReceipt, FileCounterStore, QuotaDecision, QuotaLedger, QuotaUsage};
use poml_session::SessionManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub mod billing;

pub use billing::{BillingStatus, StaticBilling};

const TRIGGER_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrchestratorResult {
    Converted(String),
    QuotaDenied(QuotaDenial),
    RemoteFailed(FailureKind),
    Cancelled,
    StorageFailed(String),
    /// No identity chosen yet.
    SessionRequired,
    /// The requested tier does not match what the identity is entitled to.
    TierMismatch { requested: Tier, entitled: Tier },
}

impl OrchestratorResult {
    pub fn is_converted(&self) -> bool {
        matches!(self, OrchestratorResult::Converted(_))
    }

    pub fn document(&self) -> Option<&str> {
        match self {
            OrchestratorResult::Converted(document) => Some(document),
            _ => None,
        }
    }
}

/// Tier changes the UI should offer to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TierTrigger {
    /// The anonymous trial is used up.
    SignUpSuggested,
    /// A signed-in identity used its bonus allowance.
    UpgradeSuggested { identity: Identity },
}

pub struct ConversionOrchestrator {
    ledger: Arc<QuotaLedger>,
    history: Arc<HistoryStore>,
    converter: Arc<dyn Converter>,
    billing: Arc<dyn BillingStatus>,
    in_flight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    triggers: broadcast::Sender<TierTrigger>,
}

impl ConversionOrchestrator {
    pub fn new(
        ledger: Arc<QuotaLedger>,
        history: Arc<HistoryStore>,
        converter: Arc<dyn Converter>,
        billing: Arc<dyn BillingStatus>,
    ) -> Self {
        let (triggers, _) = broadcast::channel(TRIGGER_CHANNEL_CAPACITY);
        Self {
            ledger,
            history,
            converter,
            billing,
            in_flight: Mutex::new(HashMap::new()),
            triggers,
        }
    }

    /// Wire file-backed storage under the data dir and the HTTP client.
    pub fn from_config(config: &ConverterConfig) -> Result<Self> {
        let data_dir = &config.paths.data_dir;
        info!("Using data directory {:?}", data_dir);

        let counters = FileCounterStore::in_dir(data_dir)?;
        let records = FileHistoryBackend::in_dir(data_dir)?;

        let ledger = QuotaLedger::new(Arc::new(counters), &config.quota);
        let history = HistoryStore::new(Arc::new(records), &config.history);
        let client = ConversionClient::new(config)?;
        let billing = StaticBilling::from_settings(&config.billing);

        Ok(Self::new(
            Arc::new(ledger),
            Arc::new(history),
            Arc::new(client),
            Arc::new(billing),
        ))
    }

    pub fn ledger(&self) -> Arc<QuotaLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn history(&self) -> Arc<HistoryStore> {
        Arc::clone(&self.history)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TierTrigger> {
        self.triggers.subscribe()
    }

    pub fn tier_for(&self, identity: &Identity) -> Tier {
        match identity {
            Identity::Anonymous => Tier::Trial,
            Identity::Authenticated { .. } if self.billing.is_pro(identity) => Tier::Pro,
            Identity::Authenticated { .. } => Tier::Bonus,
        }
    }

    pub fn usage(&self, identity: &Identity) -> Result<QuotaUsage> {
        self.ledger.usage(identity, self.tier_for(identity))
    }

    /// Submit on behalf of whoever the session currently holds.
    pub async fn submit_in_session(
        &self,
        session: &SessionManager,
        input_text: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult {
        let Some(identity) = session.identity() else {
            warn!("Conversion submitted before choosing sign-in or guest");
            return OrchestratorResult::SessionRequired;
        };
        let tier = self.tier_for(&identity);
        self.submit(&identity, tier, input_text, cancel).await
    }

    pub async fn submit_request(
        &self,
        request: &ConversionRequest,
        cancel: &CancellationToken,
    ) -> OrchestratorResult {
        self.submit(&request.identity, request.tier, &request.input_text, cancel)
            .await
    }

    /// Check quota, convert, then commit and record, in that order.
    ///
    /// Submissions for the same partition run one at a time; a second call
    /// waits for the first to finish and then sees its committed count.
    /// The tier must be the one `tier_for` derives for the identity.
    #[instrument(skip(self, identity, input_text, cancel), fields(partition = %identity.partition_key(), tier = %tier))]
    pub async fn submit(
        &self,
        identity: &Identity,
        tier: Tier,
        input_text: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult {
        let entitled = self.tier_for(identity);
        if tier != entitled {
            warn!(%entitled, "Rejecting submit with a tier the identity does not hold");
            return OrchestratorResult::TierMismatch {
                requested: tier,
                entitled,
            };
        }

        let key = identity.partition_key();
        let partition_lock = match self.partition_lock(&key) {
            Ok(lock) => lock,
            Err(e) => return storage_failure(e),
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Conversion cancelled while queued");
                OrchestratorResult::Cancelled
            }
            guard = Arc::clone(&partition_lock).lock_owned() => {
                let outcome = self.submit_locked(identity, tier, input_text, cancel).await;
                drop(guard);
                outcome
            }
        };

        self.release_partition(&key, partition_lock);
        outcome
    }

    async fn submit_locked(
        &self,
        identity: &Identity,
        tier: Tier,
        input_text: &str,
        cancel: &CancellationToken,
    ) -> OrchestratorResult {
        match self.ledger.check_and_reserve(identity, tier) {
            Ok(QuotaDecision::Allowed) => {}
            Ok(QuotaDecision::Denied(reason)) => {
                info!("Conversion denied: {}", reason);
                self.notify_exhausted(identity, tier);
                return OrchestratorResult::QuotaDenied(reason);
            }
            Err(e) => return storage_failure(e),
        }

        match self.converter.convert(input_text, cancel).await {
            ConversionResult::Success(document) => {
                self.record_success(identity, tier, input_text, document)
            }
            ConversionResult::Failure(FailureKind::Cancelled) => {
                info!("Conversion cancelled; nothing charged");
                OrchestratorResult::Cancelled
            }
            ConversionResult::Failure(kind) => {
                warn!("Conversion failed: {}", kind);
                OrchestratorResult::RemoteFailed(kind)
            }
        }
    }

    fn record_success(
        &self,
        identity: &Identity,
        tier: Tier,
        input_text: &str,
        document: String,
    ) -> OrchestratorResult {
        let receipt = match self.ledger.commit(identity) {
            Ok(receipt) => receipt,
            Err(e) => return storage_failure(e),
        };

        if self.history.retains(identity) {
            let record = ConversionRecord::new(identity.clone(), input_text, document.clone());
            if let Err(e) = self.history.append(record) {
                self.undo_commit(&receipt);
                return storage_failure(e);
            }
        }

        if self
            .ledger
            .limit_for(tier)
            .is_some_and(|limit| receipt.current >= limit)
        {
            self.notify_exhausted(identity, tier);
        }

        info!(used = receipt.current, "Conversion successful");
        OrchestratorResult::Converted(document)
    }

    fn undo_commit(&self, receipt: &CommitReceipt) {
        match self.ledger.revert(receipt) {
            Ok(true) => debug!("Quota commit rolled back"),
            Ok(false) => warn!("Quota changed concurrently; commit left in place"),
            Err(e) => error!("Failed to roll back quota commit: {}", e),
        }
    }

    fn notify_exhausted(&self, identity: &Identity, tier: Tier) {
        let trigger = match tier {
            Tier::Trial => TierTrigger::SignUpSuggested,
            Tier::Bonus => TierTrigger::UpgradeSuggested {
                identity: identity.clone(),
            },
            Tier::Pro => return,
        };

        if self.triggers.send(trigger).is_err() {
            debug!("No listeners for tier triggers");
        }
    }

    fn partition_lock(&self, key: &str) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .in_flight
            .lock()
            .map_err(|_| PomlError::StorageError("in-flight table poisoned".into()))?;
        Ok(Arc::clone(locks.entry(key.to_string()).or_default()))
    }

    /// Drop the table entry once the caller holds the last outside handle.
    fn release_partition(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let Ok(mut locks) = self.in_flight.lock() else {
            warn!("In-flight table poisoned; partition lock kept");
            return;
        };
        // One handle in the table, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }
}

fn storage_failure(e: PomlError) -> OrchestratorResult {
    error!("Conversion aborted by storage failure: {}", e);
    OrchestratorResult::StorageFailed(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use poml_config::{HistorySettings, QuotaSettings};
    use poml_history::MemoryHistoryBackend;
    use poml_quota::MemoryCounterStore;

    struct EchoConverter;

    #[async_trait]
    impl Converter for EchoConverter {
        async fn convert(&self, input_text: &str, _cancel: &CancellationToken) -> ConversionResult {
            ConversionResult::Success(format!("<prompt><task>{input_text}</task></prompt>"))
        }
    }

    fn orchestrator(pro_users: &[&str]) -> ConversionOrchestrator {
        ConversionOrchestrator::new(
            Arc::new(QuotaLedger::new(
                Arc::new(MemoryCounterStore::new()),
                &QuotaSettings::default(),
            )),
            Arc::new(HistoryStore::new(
                Arc::new(MemoryHistoryBackend::new()),
                &HistorySettings::default(),
            )),
            Arc::new(EchoConverter),
            Arc::new(StaticBilling::new(pro_users.iter().copied())),
        )
    }

    #[test]
    fn test_tier_derivation() {
        let orchestrator = orchestrator(&["paid"]);

        assert_eq!(orchestrator.tier_for(&Identity::Anonymous), Tier::Trial);
        assert_eq!(
            orchestrator.tier_for(&Identity::authenticated("free", "f@example.com")),
            Tier::Bonus
        );
        assert_eq!(
            orchestrator.tier_for(&Identity::authenticated("paid", "p@example.com")),
            Tier::Pro
        );
    }

    #[tokio::test]
    async fn test_submit_request_converts() {
        let orchestrator = orchestrator(&[]);
        let request = ConversionRequest::new(Identity::Anonymous, Tier::Trial, "hello");

        let result = orchestrator
            .submit_request(&request, &CancellationToken::new())
            .await;

        assert_eq!(result.document(), Some("<prompt><task>hello</task></prompt>"));
        assert_eq!(orchestrator.usage(&Identity::Anonymous).unwrap().used, 1);
    }

    #[tokio::test]
    async fn test_same_partition_shares_lock() {
        let orchestrator = orchestrator(&[]);
        let a = orchestrator.partition_lock("anonymous").unwrap();
        let b = orchestrator.partition_lock("anonymous").unwrap();
        let c = orchestrator.partition_lock("user:u1").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    fn in_flight_len(orchestrator: &ConversionOrchestrator) -> usize {
        orchestrator.in_flight.lock().unwrap().len()
    }

    #[tokio::test]
    async fn test_finished_submits_release_partition_locks() {
        let orchestrator = orchestrator(&[]);
        let cancel = CancellationToken::new();
        let user = Identity::authenticated("u1", "u1@example.com");

        orchestrator
            .submit(&Identity::Anonymous, Tier::Trial, "a", &cancel)
            .await;
        orchestrator.submit(&user, Tier::Bonus, "b", &cancel).await;
        assert_eq!(in_flight_len(&orchestrator), 0);

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let result = orchestrator
            .submit(&user, Tier::Bonus, "c", &cancelled)
            .await;
        assert_eq!(result, OrchestratorResult::Cancelled);
        assert_eq!(in_flight_len(&orchestrator), 0);
    }

    #[tokio::test]
    async fn test_shared_partition_lock_survives_release() {
        let orchestrator = orchestrator(&[]);
        let held = orchestrator.partition_lock("anonymous").unwrap();

        orchestrator
            .submit(&Identity::Anonymous, Tier::Trial, "a", &CancellationToken::new())
            .await;

        let again = orchestrator.partition_lock("anonymous").unwrap();
        assert!(Arc::ptr_eq(&held, &again));
        assert_eq!(in_flight_len(&orchestrator), 1);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_submit_span_omits_email() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();
        let _default = tracing::subscriber::set_default(subscriber);

        let user = Identity::authenticated("u1", "secret@example.com");
        orchestrator(&[])
            .submit(&user, Tier::Bonus, "a", &CancellationToken::new())
            .await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("partition=user:u1"));
        assert!(!output.contains("secret@example.com"));
    }

    #[tokio::test]
    async fn test_mismatched_tier_is_rejected_before_quota() {
        let orchestrator = orchestrator(&[]);

        let result = orchestrator
            .submit(&Identity::Anonymous, Tier::Pro, "a", &CancellationToken::new())
            .await;

        assert_eq!(
            result,
            OrchestratorResult::TierMismatch {
                requested: Tier::Pro,
                entitled: Tier::Trial,
            }
        );
        assert_eq!(orchestrator.usage(&Identity::Anonymous).unwrap().used, 0);
    }
}
