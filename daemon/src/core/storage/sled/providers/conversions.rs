use async_trait::async_trait;
use stack_common::{
    conversion::{BufferThreshold, ConversionJob, ConversionProvider},
    ids::{AccountId, ConversionJobId, ProviderId},
    ledger::AccountType,
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, ConversionStoreProvider},
};

const JOB_PREFIX: &[u8] = b"cj:";
const IDEM_PREFIX: &[u8] = b"cji:";
const PROVIDER_TX_PREFIX: &[u8] = b"cjp:";
const PROVIDER_PREFIX: &[u8] = b"pr:";
const THRESHOLD_PREFIX: &[u8] = b"th:";

fn job_key(id: &ConversionJobId) -> Vec<u8> {
    SledStorage::concat_key(JOB_PREFIX, id.as_bytes())
}

fn provider_key(id: &ProviderId) -> Vec<u8> {
    SledStorage::concat_key(PROVIDER_PREFIX, id.as_bytes())
}

fn threshold_key(account_type: AccountType) -> Vec<u8> {
    SledStorage::concat_key(THRESHOLD_PREFIX, account_type.to_string().as_bytes())
}

#[async_trait]
impl ConversionStoreProvider for SledStorage {
    async fn get_conversion_job(
        &self,
        id: &ConversionJobId,
    ) -> Result<Option<ConversionJob>, CoreError> {
        Self::load(&self.conversions, &job_key(id))
    }

    async fn get_conversion_job_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<ConversionJob>, CoreError> {
        let index = SledStorage::concat_key(IDEM_PREFIX, key.as_bytes());
        Self::load_via_index(&self.conversions, &index)
    }

    async fn get_conversion_job_by_provider_tx(
        &self,
        provider_tx_id: &str,
    ) -> Result<Option<ConversionJob>, CoreError> {
        let index = SledStorage::concat_key(PROVIDER_TX_PREFIX, provider_tx_id.as_bytes());
        Self::load_via_index(&self.conversions, &index)
    }

    async fn insert_conversion_job(&mut self, job: &ConversionJob) -> Result<(), CoreError> {
        let index = SledStorage::concat_key(IDEM_PREFIX, job.idempotency_key.as_bytes());
        if self.conversions.contains_key(&index)? {
            return Err(CoreError::Conflict(format!(
                "conversion job with key {} already exists",
                job.idempotency_key
            )));
        }
        let key = job_key(&job.id);
        Self::save(&self.conversions, &key, job)?;
        self.conversions.insert(index, key)?;
        Ok(())
    }

    async fn update_conversion_job(&mut self, job: &ConversionJob) -> Result<(), CoreError> {
        let key = job_key(&job.id);
        if !self.conversions.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("conversion job {}", job.id)));
        }
        Self::save(&self.conversions, &key, job)?;
        if let Some(provider_tx_id) = &job.provider_tx_id {
            let index = SledStorage::concat_key(PROVIDER_TX_PREFIX, provider_tx_id.as_bytes());
            self.conversions.insert(index, key.clone())?;
        }
        Ok(())
    }

    async fn list_conversion_jobs(&self) -> Result<Vec<ConversionJob>, CoreError> {
        Self::scan_prefix(&self.conversions, JOB_PREFIX)
    }

    async fn list_active_conversion_jobs_for_account(
        &self,
        account_id: &AccountId,
    ) -> Result<Vec<ConversionJob>, CoreError> {
        let all = self.list_conversion_jobs().await?;
        Ok(all
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .filter(|job| {
                job.source_account_id == *account_id
                    || job.destination_account_id == *account_id
            })
            .collect())
    }

    async fn get_provider(
        &self,
        id: &ProviderId,
    ) -> Result<Option<ConversionProvider>, CoreError> {
        Self::load(&self.conversions, &provider_key(id))
    }

    async fn list_providers(&self) -> Result<Vec<ConversionProvider>, CoreError> {
        Self::scan_prefix(&self.conversions, PROVIDER_PREFIX)
    }

    async fn upsert_provider(&mut self, provider: &ConversionProvider) -> Result<(), CoreError> {
        Self::save(&self.conversions, &provider_key(&provider.id), provider)
    }

    async fn get_threshold(
        &self,
        account_type: AccountType,
    ) -> Result<Option<BufferThreshold>, CoreError> {
        Self::load(&self.conversions, &threshold_key(account_type))
    }

    async fn list_thresholds(&self) -> Result<Vec<BufferThreshold>, CoreError> {
        Self::scan_prefix(&self.conversions, THRESHOLD_PREFIX)
    }

    async fn upsert_threshold(&mut self, threshold: &BufferThreshold) -> Result<(), CoreError> {
        Self::save(
            &self.conversions,
            &threshold_key(threshold.account_type),
            threshold,
        )
    }
}
