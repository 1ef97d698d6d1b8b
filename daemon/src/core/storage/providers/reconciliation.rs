// Reconciliation report and exception storage provider trait

use async_trait::async_trait;
use stack_common::{
    ids::{ExceptionId, ReportId},
    reconciliation::{ReconciliationException, ReconciliationReport},
};

use crate::core::error::CoreError;

#[async_trait]
pub trait ReconciliationProvider {
    async fn insert_report(&mut self, report: &ReconciliationReport) -> Result<(), CoreError>;

    async fn get_report(&self, id: &ReportId) -> Result<Option<ReconciliationReport>, CoreError>;

    async fn list_reports(&self) -> Result<Vec<ReconciliationReport>, CoreError>;

    async fn insert_exception(
        &mut self,
        exception: &ReconciliationException,
    ) -> Result<(), CoreError>;

    async fn get_exception(
        &self,
        id: &ExceptionId,
    ) -> Result<Option<ReconciliationException>, CoreError>;

    async fn update_exception(
        &mut self,
        exception: &ReconciliationException,
    ) -> Result<(), CoreError>;

    async fn list_exceptions(&self) -> Result<Vec<ReconciliationException>, CoreError>;
}
