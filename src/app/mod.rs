//! Block cycle controller
//!
//! [`Application`] is the context object every protocol handler runs
//! against. It serves three logical connections:
//! - consensus: `init_chain`, `begin_block`, `deliver_tx`, `end_block`,
//!   `commit`, serialized by one mutex that also owns the block in progress;
//! - mempool: `check_tx`, serialized by its own mutex and read-only;
//! - query: `query`, unsynchronized and read-only.
//!
//! ## Structure
//! - `cycle.rs` - phase machine and block-in-progress bookkeeping
//! - `tests.rs` - end-to-end protocol scenarios

use crate::backend::{Backend, BlockHash};
use crate::codec;
use crate::config::{AppConfig, CommitFailurePolicy};
use crate::error::{AbciError, AppResult, FatalCondition};
use crate::query::QueryForwarder;
use crate::types::{
    AbciResult, Code, Header, ResponseEndBlock, ResponseInfo, ResponseQuery, Validator, INFO_DATA,
};
use crate::validators::{Strategy, ValidatorManager};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

mod cycle;

pub use cycle::CycleState;
use cycle::ConsensusCycle;


/// Backend attached by [`Application::init`] and the handles derived from it
struct Attached {
    backend: Arc<dyn Backend>,
    forwarder: QueryForwarder,
}

pub struct Application {
    attached: Option<Attached>,
    core_url: String,
    commit_failure_policy: CommitFailurePolicy,
    validators: ValidatorManager,
    consensus: Mutex<ConsensusCycle>,
    mempool: Mutex<()>,
}

impl Application {
    pub fn new(strategy: Arc<dyn Strategy>, config: &AppConfig) -> Self {
        Application {
            attached: None,
            core_url: config.core_url.clone(),
            commit_failure_policy: config.commit_failure_policy,
            validators: ValidatorManager::new(strategy),
            consensus: Mutex::new(ConsensusCycle::new()),
            mempool: Mutex::new(()),
        }
    }

    /// Attach the backend and reload the validator set it committed.
    /// Runs once, before the application is shared.
    pub fn init(&mut self, backend: Arc<dyn Backend>) -> AppResult<()> {
        self.consensus.get_mut().attach()?;
        if let Err(condition) = self.validators.restore(&backend.validators()) {
            error!(error = %condition, "Init: halting block production");
            self.consensus.get_mut().halt();
            return Err(condition.into());
        }
        let forwarder = QueryForwarder::new(&self.core_url, backend.http_client());
        self.attached = Some(Attached { backend, forwarder });
        info!(
            core_url = %self.core_url,
            strategy = self.validators.strategy_name(),
            commit_failure_policy = ?self.commit_failure_policy,
            "Application initialized"
        );
        Ok(())
    }

    fn backend(&self) -> AppResult<&Arc<dyn Backend>> {
        self.attached
            .as_ref()
            .map(|a| &a.backend)
            .ok_or(AbciError::NotInitialized)
    }

    async fn committed_height(&self, backend: &Arc<dyn Backend>) -> u64 {
        backend
            .current_state()
            .await
            .map(|(block, _)| block.height)
            .unwrap_or(0)
    }

    pub async fn state(&self) -> CycleState {
        self.consensus.lock().await.state()
    }

    pub fn validators(&self) -> Vec<Validator> {
        self.validators.validators()
    }

    /// Latest committed height and hash; height 0 with an empty hash until the first commit
    pub async fn info(&self) -> AppResult<ResponseInfo> {
        let backend = self.backend()?;
        debug!("Info");
        match backend.current_state().await {
            Some((block, _)) if block.height > 0 => Ok(ResponseInfo {
                data: INFO_DATA.to_string(),
                last_block_height: block.height,
                last_block_app_hash: block.hash.to_vec(),
            }),
            _ => Ok(ResponseInfo::genesis()),
        }
    }

    pub fn set_option(&self, key: &str, value: &str) -> String {
        debug!(key, value, "SetOption ignored");
        String::new()
    }

    pub async fn init_chain(&self, validators: &[Validator]) -> AppResult<()> {
        let backend = self.backend()?;
        let mut cycle = self.consensus.lock().await;
        cycle.ensure(CycleState::Ready, "InitChain").map_err(log_rejection)?;

        let height = self.committed_height(backend).await;
        if height != 0 {
            return Err(log_rejection(
                FatalCondition::ProtocolViolation(format!(
                    "InitChain received at height {}",
                    height
                ))
                .into(),
            ));
        }

        info!(validators = validators.len(), "InitChain");
        if let Err(condition) = self.validators.set_validators(validators) {
            error!(error = %condition, "InitChain: halting block production");
            cycle.halt();
            return Err(condition.into());
        }
        Ok(())
    }

    /// Mempool connection: decode and validate against committed state only
    pub async fn check_tx(&self, tx_bytes: &[u8]) -> AbciResult {
        let _mempool = self.mempool.lock().await;
        match self.validate(tx_bytes).await {
            Ok(()) => AbciResult::ok(),
            Err(e) => {
                debug!(error = %e, "CheckTx rejected");
                e.into_result()
            }
        }
    }

    async fn validate(&self, tx_bytes: &[u8]) -> AppResult<()> {
        let backend = self.backend()?;
        let tx = codec::decode(tx_bytes)?;
        debug!(tx = %tx.hash, sender = tx.sender(), nonce = tx.nonce(), "Received CheckTx");
        backend.validate_tx(&tx).await?;
        Ok(())
    }

    pub async fn begin_block(&self, hash: &[u8], header: &Header) -> AppResult<()> {
        let backend = self.backend()?;
        let mut cycle = self.consensus.lock().await;
        cycle.ensure(CycleState::Ready, "BeginBlock").map_err(log_rejection)?;

        if i64::try_from(header.time).is_err() {
            return Err(log_rejection(
                FatalCondition::ProtocolViolation(format!(
                    "BeginBlock time {} out of range",
                    header.time
                ))
                .into(),
            ));
        }

        let expected = self.committed_height(backend).await + 1;
        if header.height != expected {
            return Err(log_rejection(
                FatalCondition::ProtocolViolation(format!(
                    "BeginBlock for height {}, expected {}",
                    header.height, expected
                ))
                .into(),
            ));
        }

        info!(
            height = header.height,
            time = %format_block_time(header.time),
            proposer = header.proposer.as_deref().unwrap_or("-"),
            "BeginBlock"
        );
        cycle.begin(hash, header);
        Ok(())
    }

    /// Consensus connection: queue a transaction for the block in progress
    pub async fn deliver_tx(&self, tx_bytes: &[u8]) -> AbciResult {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(e) => return e.into_result(),
        };
        let mut cycle = self.consensus.lock().await;
        if let Err(e) = cycle.ensure(CycleState::InBlock, "DeliverTx") {
            return log_rejection(e).into_result();
        }

        let tx = match codec::decode(tx_bytes) {
            Ok(tx) => tx,
            Err(e) => return AbciError::from(e).into_result(),
        };
        debug!(tx = %tx.hash, sender = tx.sender(), nonce = tx.nonce(), "Got DeliverTx");

        let hash = tx.hash;
        if let Err(e) = backend.submit(tx).await {
            let e = AbciError::from(e);
            debug!(tx = %hash, error = %e, "DeliverTx rejected");
            return e.into_result();
        }
        cycle.collect(hash);
        AbciResult::ok()
    }

    pub async fn end_block(&self, height: u64) -> AppResult<ResponseEndBlock> {
        let backend = self.backend()?;
        let mut cycle = self.consensus.lock().await;
        cycle.ensure(CycleState::InBlock, "EndBlock").map_err(log_rejection)?;

        let summary = match cycle.summary() {
            Some(summary) if summary.height == height => summary,
            _ => {
                return Err(log_rejection(
                    FatalCondition::ProtocolViolation(format!(
                        "EndBlock for height {}, block in progress is {:?}",
                        height,
                        cycle.height()
                    ))
                    .into(),
                ))
            }
        };

        info!(height, txs = cycle.collected(), "EndBlock");
        match self.validators.compute_updates(&summary) {
            Ok(transition) => {
                cycle.end(transition.next);
                Ok(ResponseEndBlock {
                    validator_updates: transition.updates,
                })
            }
            Err(condition) => {
                error!(height, error = %condition, "EndBlock: halting block production");
                backend.discard_pending().await;
                cycle.halt();
                Err(condition.into())
            }
        }
    }

    /// Consensus connection: have the backend make the block stamped with BlockTime.
    ///
    /// A failed block is never retried: queued transactions are discarded and
    /// block production halts. The policy only decides what the engine is told.
    pub async fn commit(&self) -> AbciResult {
        let backend = match self.backend() {
            Ok(backend) => backend,
            Err(e) => return e.into_result(),
        };
        let mut cycle = self.consensus.lock().await;
        if let Err(e) = cycle.ensure(CycleState::BlockEnded, "Commit") {
            return log_rejection(e).into_result();
        }

        let block_time = cycle.block_time().unwrap_or_default();
        let roster = cycle.staged().map(|set| set.validators()).unwrap_or_default();
        let expected = self.committed_height(backend).await + 1;
        let outcome = match backend.make_block(block_time, &roster).await {
            Ok(hash) => {
                let height = self.committed_height(backend).await;
                if height == expected {
                    Ok(hash)
                } else {
                    Err(format!(
                        "backend reports height {} after commit, expected {}",
                        height, expected
                    ))
                }
            }
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(hash) => {
                let consensus_hash: String = cycle
                    .block_hash()
                    .unwrap_or_default()
                    .iter()
                    .take(8)
                    .map(|b| format!("{:02x}", b))
                    .collect();
                if let Some(next) = cycle.finish() {
                    self.validators.apply(next);
                }
                info!(
                    height = expected,
                    hash = %hash,
                    consensus_hash = %consensus_hash,
                    session_blocks = cycle.blocks_committed(),
                    "Commit"
                );
                AbciResult::ok_with_data(hash.to_vec(), "")
            }
            Err(detail) => {
                error!(
                    height = expected,
                    error = %detail,
                    "Commit: block assembly failed, halting block production"
                );
                backend.discard_pending().await;
                cycle.halt();
                match self.commit_failure_policy {
                    CommitFailurePolicy::Report => {
                        AbciError::from(FatalCondition::CommitFailed(detail)).into_result()
                    }
                    CommitFailurePolicy::Mask => {
                        warn!(height = expected, "Commit: failure masked, reporting zero hash");
                        AbciResult::ok_with_data(BlockHash::zero().to_vec(), "")
                            .append_log(&format!("block assembly failed: {}", detail))
                    }
                }
            }
        }
    }

    /// Query connection: forward to the external RPC endpoint
    pub async fn query(&self, path: &str, data: &[u8]) -> ResponseQuery {
        match &self.attached {
            Some(attached) => attached.forwarder.query(path, data).await,
            None => ResponseQuery::error(Code::NotInitialized, AbciError::NotInitialized.to_string()),
        }
    }
}

fn log_rejection(e: AbciError) -> AbciError {
    if e.is_fatal() {
        error!(error = %e, "Consensus call rejected");
    } else {
        warn!(error = %e, "Consensus call rejected");
    }
    e
}

fn format_block_time(time: u64) -> String {
    i64::try_from(time)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| time.to_string())
}
