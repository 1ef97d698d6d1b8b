// Conversion job, provider registry and threshold storage provider trait

use async_trait::async_trait;
use stack_common::{
    conversion::{BufferThreshold, ConversionJob, ConversionProvider},
    ids::{AccountId, ConversionJobId, ProviderId},
    ledger::AccountType,
};

use crate::core::error::CoreError;

#[async_trait]
pub trait ConversionStoreProvider {
    async fn get_conversion_job(
        &self,
        id: &ConversionJobId,
    ) -> Result<Option<ConversionJob>, CoreError>;

    async fn get_conversion_job_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ConversionJob>, CoreError>;

    /// Resolve a provider webhook to its job.
    async fn get_conversion_job_by_provider_tx(
        &self,
        provider_tx_id: &str,
    ) -> Result<Option<ConversionJob>, CoreError>;

    /// Insert a job; fails with `conflict` on idempotency key reuse.
    async fn insert_conversion_job(&mut self, job: &ConversionJob) -> Result<(), CoreError>;

    async fn update_conversion_job(&mut self, job: &ConversionJob) -> Result<(), CoreError>;

    async fn list_conversion_jobs(&self) -> Result<Vec<ConversionJob>, CoreError>;

    /// Live (non-terminal) jobs whose source or destination is the given
    /// account; the treasury uses this to avoid piling up duplicate jobs
    /// for the same buffer.
    async fn list_active_conversion_jobs_for_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<ConversionJob>, CoreError>;

    // Provider registry

    async fn get_provider(&self, id: &ProviderId) -> Result<Option<ConversionProvider>, CoreError>;

    async fn list_providers(&self) -> Result<Vec<ConversionProvider>, CoreError>;

    async fn upsert_provider(&mut self, provider: &ConversionProvider) -> Result<(), CoreError>;

    // Buffer thresholds

    async fn get_threshold(
        &self,
        account_type: AccountType,
    ) -> Result<Option<BufferThreshold>, CoreError>;

    async fn list_thresholds(&self) -> Result<Vec<BufferThreshold>, CoreError>;

    async fn upsert_threshold(&mut self, threshold: &BufferThreshold) -> Result<(), CoreError>;
}
