mod audit;
mod conversions;
mod deposits;
mod events;
mod idempotency;
mod ledger;
mod provisioning;
mod reconciliation;
mod steps;
mod wallets;
mod withdrawals;
