// Deterministic partner doubles for devnet runs and tests.
//
// Each mock keeps its own book of what it has seen so flows can be driven
// end to end without a vendor, and accepts scripted failures so retry and
// compensation paths can be exercised deliberately.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use stack_common::{
    amount::Amount,
    conversion::ConversionDirection,
    currency::Currency,
    wallet::WalletAccountType,
};

use super::{
    AdapterError, BrokerageProvider, ChainWatcher, ConversionProviderClient,
    ConversionSubmission, CustodyProvider, JournalStatus, ProviderConversionStatus,
    ProvisionedWallet,
};

/// Failures queued ahead of real behavior; each call consumes one.
#[derive(Default)]
struct FailureScript {
    queued: Mutex<Vec<AdapterError>>,
}

impl FailureScript {
    fn push(&self, err: AdapterError) {
        self.queued.lock().unwrap_or_else(|e| e.into_inner()).push(err);
    }

    fn next(&self) -> Option<AdapterError> {
        let mut queued = self.queued.lock().unwrap_or_else(|e| e.into_inner());
        if queued.is_empty() {
            None
        } else {
            Some(queued.remove(0))
        }
    }
}

#[derive(Default)]
struct CustodyBook {
    wallet_counter: u64,
    treasury_balance: Option<Amount>,
    sends: Vec<(String, String, Amount)>,
    sent_keys: HashMap<String, String>,
}

/// Custody double. Wallet addresses are derived from a counter so repeated
/// runs are reproducible; the treasury balance is adjustable from tests.
#[derive(Default)]
pub struct MockCustody {
    book: Mutex<CustodyBook>,
    failures: FailureScript,
}

impl MockCustody {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: AdapterError) {
        self.failures.push(err);
    }

    pub fn set_treasury_balance(&self, balance: Amount) {
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .treasury_balance = Some(balance);
    }

    pub fn adjust_treasury(&self, delta: &Amount, add: bool) {
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        let current = book
            .treasury_balance
            .unwrap_or_else(|| Amount::zero(delta.currency()));
        book.treasury_balance = Some(if add {
            current.checked_add(delta).unwrap_or(current)
        } else {
            current.checked_sub(delta).unwrap_or(current)
        });
    }

    pub fn sends(&self) -> Vec<(String, String, Amount)> {
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sends
            .clone()
    }

    /// How many wallets were actually created at the provider.
    pub fn created_count(&self) -> u64 {
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .wallet_counter
    }
}

#[async_trait]
impl CustodyProvider for MockCustody {
    async fn create_wallet(
        &self,
        wallet_set_id: &str,
        chain: &str,
        account_type: WalletAccountType,
    ) -> Result<ProvisionedWallet, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        book.wallet_counter += 1;
        let n = book.wallet_counter;
        Ok(ProvisionedWallet {
            provider_wallet_id: format!("{wallet_set_id}-w{n}"),
            address: format!("{}addr{n:08}", chain.to_lowercase().replace('-', "")),
            chain: chain.to_string(),
            account_type,
        })
    }

    async fn get_treasury_balance(&self, _token: &str) -> Result<Amount, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        Ok(book
            .treasury_balance
            .unwrap_or_else(|| Amount::zero(Currency::Usdc)))
    }

    async fn send_tokens(
        &self,
        amount: &Amount,
        to_address: &str,
        chain: &str,
        idempotency_key: &str,
    ) -> Result<String, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx_hash) = book.sent_keys.get(idempotency_key) {
            return Ok(tx_hash.clone());
        }
        let n = book.sends.len() as u64 + 1;
        let tx_hash = format!("0xsend{n:08}");
        book.sends
            .push((chain.to_string(), to_address.to_string(), *amount));
        book.sent_keys
            .insert(idempotency_key.to_string(), tx_hash.clone());
        if let Some(balance) = book.treasury_balance {
            book.treasury_balance = Some(balance.checked_sub(amount).unwrap_or(balance));
        }
        Ok(tx_hash)
    }
}

#[derive(Clone, Debug)]
pub struct RecordedConversion {
    pub provider_tx_id: String,
    pub direction: ConversionDirection,
    pub amount: Amount,
    pub idempotency_key: String,
}

#[derive(Default)]
struct ConversionBook {
    counter: u64,
    submissions: Vec<RecordedConversion>,
    by_key: HashMap<String, String>,
    statuses: HashMap<String, ProviderConversionStatus>,
}

/// Conversion provider double. Submissions settle only when the test (or
/// the devnet loop) delivers the corresponding webhook, mirroring the real
/// asynchronous contract.
#[derive(Default)]
pub struct MockConversionProvider {
    book: Mutex<ConversionBook>,
    failures: FailureScript,
}

impl MockConversionProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: AdapterError) {
        self.failures.push(err);
    }

    pub fn submissions(&self) -> Vec<RecordedConversion> {
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .submissions
            .clone()
    }

    pub fn last_submission(&self) -> Option<RecordedConversion> {
        self.submissions().last().cloned()
    }

    pub fn set_status(&self, provider_tx_id: &str, status: ProviderConversionStatus) {
        self.book
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .statuses
            .insert(provider_tx_id.to_string(), status);
    }
}

#[async_trait]
impl ConversionProviderClient for MockConversionProvider {
    async fn submit_conversion(
        &self,
        _provider_name: &str,
        direction: ConversionDirection,
        amount: &Amount,
        idempotency_key: &str,
    ) -> Result<ConversionSubmission, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = book.by_key.get(idempotency_key) {
            return Ok(ConversionSubmission {
                provider_tx_id: existing.clone(),
                status: ProviderConversionStatus::Submitted,
            });
        }
        book.counter += 1;
        let provider_tx_id = format!("conv-{:06}", book.counter);
        book.submissions.push(RecordedConversion {
            provider_tx_id: provider_tx_id.clone(),
            direction,
            amount: *amount,
            idempotency_key: idempotency_key.to_string(),
        });
        book.by_key
            .insert(idempotency_key.to_string(), provider_tx_id.clone());
        book.statuses
            .insert(provider_tx_id.clone(), ProviderConversionStatus::Submitted);
        Ok(ConversionSubmission {
            provider_tx_id,
            status: ProviderConversionStatus::Submitted,
        })
    }

    async fn get_conversion_status(
        &self,
        provider_tx_id: &str,
    ) -> Result<ProviderConversionStatus, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        book.statuses
            .get(provider_tx_id)
            .copied()
            .ok_or_else(|| AdapterError::permanent("conversion", "unknown provider tx"))
    }
}

#[derive(Default)]
struct BrokerBook {
    counter: u64,
    cash: Option<Amount>,
    journals: HashMap<String, (JournalStatus, Amount)>,
    by_key: HashMap<String, String>,
}

/// Brokerage double. Journals settle immediately; cash moves with them so
/// reconciliation has something truthful to compare against.
#[derive(Default)]
pub struct MockBrokerage {
    book: Mutex<BrokerBook>,
    failures: FailureScript,
}

impl MockBrokerage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, err: AdapterError) {
        self.failures.push(err);
    }

    pub fn set_cash_balance(&self, balance: Amount) {
        self.book.lock().unwrap_or_else(|e| e.into_inner()).cash = Some(balance);
    }

    fn apply(&self, amount: &Amount, add: bool, key: &str) -> String {
        let mut book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(journal_ref) = book.by_key.get(key) {
            return journal_ref.clone();
        }
        book.counter += 1;
        let journal_ref = format!("journal-{:06}", book.counter);
        let cash = book.cash.unwrap_or_else(|| Amount::zero(Currency::Usd));
        book.cash = Some(if add {
            cash.checked_add(amount).unwrap_or(cash)
        } else {
            cash.checked_sub(amount).unwrap_or(cash)
        });
        book.journals
            .insert(journal_ref.clone(), (JournalStatus::Settled, *amount));
        book.by_key.insert(key.to_string(), journal_ref.clone());
        journal_ref
    }
}

#[async_trait]
impl BrokerageProvider for MockBrokerage {
    async fn get_cash_balance(&self) -> Result<Amount, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        let book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        Ok(book.cash.unwrap_or_else(|| Amount::zero(Currency::Usd)))
    }

    async fn fund_account(
        &self,
        amount: &Amount,
        idempotency_key: &str,
    ) -> Result<String, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        Ok(self.apply(amount, true, idempotency_key))
    }

    async fn withdraw(
        &self,
        amount: &Amount,
        idempotency_key: &str,
    ) -> Result<String, AdapterError> {
        if let Some(err) = self.failures.next() {
            return Err(err);
        }
        Ok(self.apply(amount, false, idempotency_key))
    }

    async fn get_journal_status(&self, journal_ref: &str) -> Result<JournalStatus, AdapterError> {
        let book = self.book.lock().unwrap_or_else(|e| e.into_inner());
        book.journals
            .get(journal_ref)
            .map(|(status, _)| *status)
            .ok_or_else(|| AdapterError::permanent("brokerage", "unknown journal"))
    }
}

/// Chain watcher double: remembers registrations so tests can assert a
/// freshly provisioned wallet is being watched.
#[derive(Default)]
pub struct MockChainWatcher {
    watched: Mutex<Vec<(String, String)>>,
}

impl MockChainWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn watched(&self) -> Vec<(String, String)> {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ChainWatcher for MockChainWatcher {
    async fn watch(&self, address: &str, chain: &str) -> Result<(), AdapterError> {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((address.to_string(), chain.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn custody_wallets_are_deterministic_and_keyless() {
        let custody = MockCustody::new();
        let wallet = custody
            .create_wallet("devnet-set", "SOL-DEVNET", WalletAccountType::Eoa)
            .await
            .unwrap();
        assert!(wallet.address.starts_with("soldevnetaddr"));
        assert_eq!(wallet.chain, "SOL-DEVNET");
    }

    #[tokio::test]
    async fn broker_journal_is_idempotent() {
        let broker = MockBrokerage::new();
        broker.set_cash_balance(Amount::from_units(1_000, Currency::Usd));
        let amount = Amount::from_units(100, Currency::Usd);
        let first = broker.fund_account(&amount, "key-1").await.unwrap();
        let second = broker.fund_account(&amount, "key-1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            broker.get_cash_balance().await.unwrap(),
            Amount::from_units(1_100, Currency::Usd)
        );
    }

    #[tokio::test]
    async fn conversion_submission_collapses_on_key() {
        let provider = MockConversionProvider::new();
        let amount = Amount::from_units(100, Currency::Usdc);
        let a = provider
            .submit_conversion("mock", ConversionDirection::UsdcToUsd, &amount, "k")
            .await
            .unwrap();
        let b = provider
            .submit_conversion("mock", ConversionDirection::UsdcToUsd, &amount, "k")
            .await
            .unwrap();
        assert_eq!(a.provider_tx_id, b.provider_tx_id);
        assert_eq!(provider.submissions().len(), 1);
    }

    #[tokio::test]
    async fn scripted_failures_are_consumed_in_order() {
        let broker = MockBrokerage::new();
        broker.fail_next(AdapterError::transient("brokerage", "503"));
        let amount = Amount::from_units(10, Currency::Usd);
        assert!(broker.fund_account(&amount, "k").await.is_err());
        assert!(broker.fund_account(&amount, "k").await.is_ok());
    }
}
