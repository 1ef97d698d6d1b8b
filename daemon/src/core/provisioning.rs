// Wallet provisioning worker.
//
// A job covers one user across several chains. Chains settle
// independently: a 4xx from custody fails that chain and the rest carry
// on, a 5xx/timeout reschedules the whole job with backoff. A (user,
// chain) that already has a wallet is skipped without a provider call.

use std::sync::Arc;

use stack_common::{
    ids::{ProvisioningJobId, TraceId, UserId, WalletId},
    time,
    wallet::{
        ChainProvisioningOutcome, ManagedWallet, ProvisioningJobStatus, WalletAccountType,
        WalletProvisioningJob, WalletStatus,
    },
};

use crate::adapters::{guarded, AdapterError, Adapters};
use crate::config::{CLAIM_VISIBILITY_TIMEOUT, DEFAULT_MAX_ATTEMPTS};
use crate::core::{
    audit::Audit,
    backoff,
    error::CoreError,
    storage::{SharedStorage, Storage},
};

// Wallet set the custody provider scopes our wallets to
const WALLET_SET_ID: &str = "stack-custodial";

pub struct ProvisioningWorker<S: Storage> {
    storage: SharedStorage<S>,
    audit: Audit<S>,
    adapters: Arc<Adapters>,
}

impl<S: Storage> Clone for ProvisioningWorker<S> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            audit: self.audit.clone(),
            adapters: self.adapters.clone(),
        }
    }
}

impl<S: Storage> ProvisioningWorker<S> {
    pub fn new(storage: SharedStorage<S>, audit: Audit<S>, adapters: Arc<Adapters>) -> Self {
        Self {
            storage,
            audit,
            adapters,
        }
    }

    /// Queue wallet creation for a user across the given chains.
    pub async fn enqueue(
        &self,
        user_id: UserId,
        chains: Vec<String>,
    ) -> Result<WalletProvisioningJob, CoreError> {
        if chains.is_empty() {
            return Err(CoreError::Validation(
                "at least one chain is required".to_string(),
            ));
        }
        let now = time::now();
        let job = WalletProvisioningJob {
            id: ProvisioningJobId::generate(),
            user_id,
            outcomes: vec![ChainProvisioningOutcome::Pending; chains.len()],
            chains,
            status: ProvisioningJobStatus::Queued,
            attempt_count: 0,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            next_retry_at: None,
            error_message: None,
            trace_id: TraceId::generate(),
            created_at: now,
            updated_at: now,
        };
        self.storage
            .write()
            .await
            .insert_provisioning_job(&job)
            .await?;
        metrics::counter!("provisioning_jobs_enqueued").increment(1);
        info!(
            "queued wallet provisioning {} for user {} on {:?} [{}]",
            job.id, job.user_id, job.chains, job.trace_id
        );
        Ok(job)
    }

    pub async fn get_job(
        &self,
        id: &ProvisioningJobId,
    ) -> Result<WalletProvisioningJob, CoreError> {
        self.storage
            .read()
            .await
            .get_provisioning_job(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("provisioning job {id}")))
    }

    /// Claim and run one due job. Returns whether a job was processed.
    pub async fn poll_once(&self) -> Result<bool, CoreError> {
        let now = time::now();
        let stale_before = now
            - chrono::Duration::from_std(CLAIM_VISIBILITY_TIMEOUT)
                .unwrap_or_else(|_| chrono::Duration::seconds(600));
        let claimed = {
            let mut storage = self.storage.write().await;
            storage.claim_due_provisioning_job(now, stale_before).await?
        };
        let Some(job) = claimed else {
            return Ok(false);
        };
        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, mut job: WalletProvisioningJob) -> Result<(), CoreError> {
        let chains = job.chains.clone();
        for (index, chain) in chains.iter().enumerate() {
            if !matches!(job.outcomes[index], ChainProvisioningOutcome::Pending) {
                continue;
            }

            // idempotency: an existing wallet for (user, chain) settles
            // the chain without touching the provider
            let existing = {
                let storage = self.storage.read().await;
                storage.get_wallet_by_user_chain(&job.user_id, chain).await?
            };
            if let Some(wallet) = existing {
                debug!(
                    "user {} already has a wallet on {}, skipping",
                    job.user_id, chain
                );
                job.outcomes[index] = ChainProvisioningOutcome::Live {
                    wallet_id: wallet.id,
                };
                continue;
            }

            let created = guarded(
                &self.adapters.custody_breaker,
                self.adapters.custody.create_wallet(
                    WALLET_SET_ID,
                    chain,
                    WalletAccountType::Eoa,
                ),
            )
            .await;

            match created {
                Ok(provisioned) => {
                    let now = time::now();
                    let wallet = ManagedWallet {
                        id: WalletId::generate(),
                        user_id: job.user_id,
                        chain: chain.clone(),
                        address: provisioned.address.clone(),
                        provider_wallet_id: provisioned.provider_wallet_id,
                        account_type: provisioned.account_type,
                        status: WalletStatus::Live,
                        created_at: now,
                        updated_at: now,
                    };
                    self.storage.write().await.insert_wallet(&wallet).await?;
                    job.outcomes[index] = ChainProvisioningOutcome::Live {
                        wallet_id: wallet.id,
                    };
                    metrics::counter!("wallets_provisioned", "chain" => chain.clone())
                        .increment(1);
                    info!(
                        "wallet {} live for user {} on {} [{}]",
                        wallet.address, job.user_id, chain, job.trace_id
                    );

                    // watch registration is best effort; a miss is caught
                    // when the first deposit webhook fails to resolve
                    if let Err(err) = guarded(
                        &self.adapters.chain_breaker,
                        self.adapters.chain_watcher.watch(&provisioned.address, chain),
                    )
                    .await
                    {
                        warn!("could not register watch for {}: {err}", provisioned.address);
                    }
                }
                // provider rejected this chain; the rest continue
                Err(AdapterError::Permanent { message, .. }) => {
                    warn!(
                        "custody rejected wallet for user {} on {chain}: {message}",
                        job.user_id
                    );
                    job.outcomes[index] = ChainProvisioningOutcome::Failed {
                        reason: message.clone(),
                    };
                    metrics::counter!("wallet_provisioning_chain_failures").increment(1);
                }
                // transient: reschedule the whole job
                Err(err) => {
                    job.attempt_count += 1;
                    job.error_message = Some(err.to_string());
                    if job.attempt_count < job.max_attempts {
                        job.status = ProvisioningJobStatus::Retry;
                        job.next_retry_at = Some(backoff::next_retry_at(job.attempt_count));
                        warn!(
                            "provisioning {} rescheduled (attempt {}/{}): {err}",
                            job.id, job.attempt_count, job.max_attempts
                        );
                    } else {
                        for outcome in job.outcomes.iter_mut() {
                            if matches!(outcome, ChainProvisioningOutcome::Pending) {
                                *outcome = ChainProvisioningOutcome::Failed {
                                    reason: "retries exhausted".to_string(),
                                };
                            }
                        }
                        job.status = ProvisioningJobStatus::Failed;
                        error!(
                            "provisioning {} failed after {} attempts: {err}",
                            job.id, job.attempt_count
                        );
                    }
                    job.updated_at = time::now();
                    self.storage
                        .write()
                        .await
                        .update_provisioning_job(&job)
                        .await?;
                    self.audit
                        .record_failure(
                            Some(job.user_id),
                            "provisioning.rescheduled",
                            "wallet_provisioning_job",
                            &job.id.to_string(),
                            &err.into(),
                            &job.trace_id,
                        )
                        .await;
                    return Ok(());
                }
            }
        }

        // every chain is live or terminally failed; partial success still
        // completes the job with per-chain outcomes visible to callers
        if job.all_chains_settled() {
            job.status = ProvisioningJobStatus::Completed;
        }
        job.updated_at = time::now();
        self.storage
            .write()
            .await
            .update_provisioning_job(&job)
            .await?;
        self.audit
            .record(
                Some(job.user_id),
                "provisioning.completed",
                "wallet_provisioning_job",
                &job.id.to_string(),
                stack_common::audit::AuditChanges {
                    before: None,
                    after: Some(serde_json::to_value(&job.outcomes)?),
                },
                &job.trace_id,
            )
            .await;
        metrics::counter!("provisioning_jobs_completed").increment(1);
        Ok(())
    }
}
