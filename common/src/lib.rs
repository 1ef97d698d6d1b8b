#![allow(clippy::module_inception)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::type_complexity)]

pub mod amount;
pub mod api;
pub mod audit;
pub mod config;
pub mod conversion;
pub mod currency;
pub mod deposit;
pub mod events;
pub mod ids;
pub mod idempotency;
pub mod ledger;
pub mod reconciliation;
pub mod saga;
pub mod time;
pub mod wallet;
pub mod withdrawal;

pub mod tokio;
