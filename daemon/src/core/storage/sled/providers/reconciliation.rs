use async_trait::async_trait;
use stack_common::{
    ids::{ExceptionId, ReportId},
    reconciliation::{ReconciliationException, ReconciliationReport},
};

use crate::core::{
    error::CoreError,
    storage::{sled::SledStorage, ReconciliationProvider},
};

const REPORT_PREFIX: &[u8] = b"rep:";
const EXCEPTION_PREFIX: &[u8] = b"exc:";

fn report_key(id: &ReportId) -> Vec<u8> {
    SledStorage::concat_key(REPORT_PREFIX, id.as_bytes())
}

fn exception_key(id: &ExceptionId) -> Vec<u8> {
    SledStorage::concat_key(EXCEPTION_PREFIX, id.as_bytes())
}

#[async_trait]
impl ReconciliationProvider for SledStorage {
    async fn insert_report(&mut self, report: &ReconciliationReport) -> Result<(), CoreError> {
        Self::save(&self.reconciliation, &report_key(&report.id), report)
    }

    async fn get_report(
        &self,
        id: &ReportId,
    ) -> Result<Option<ReconciliationReport>, CoreError> {
        Self::load(&self.reconciliation, &report_key(id))
    }

    async fn list_reports(&self) -> Result<Vec<ReconciliationReport>, CoreError> {
        Self::scan_prefix(&self.reconciliation, REPORT_PREFIX)
    }

    async fn insert_exception(
        &mut self,
        exception: &ReconciliationException,
    ) -> Result<(), CoreError> {
        Self::save(&self.reconciliation, &exception_key(&exception.id), exception)
    }

    async fn get_exception(
        &self,
        id: &ExceptionId,
    ) -> Result<Option<ReconciliationException>, CoreError> {
        Self::load(&self.reconciliation, &exception_key(id))
    }

    async fn update_exception(
        &mut self,
        exception: &ReconciliationException,
    ) -> Result<(), CoreError> {
        let key = exception_key(&exception.id);
        if !self.reconciliation.contains_key(&key)? {
            return Err(CoreError::NotFound(format!("exception {}", exception.id)));
        }
        Self::save(&self.reconciliation, &key, exception)
    }

    async fn list_exceptions(&self) -> Result<Vec<ReconciliationException>, CoreError> {
        Self::scan_prefix(&self.reconciliation, EXCEPTION_PREFIX)
    }
}
