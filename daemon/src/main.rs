use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use log::{error, info};
use metrics_exporter_prometheus::PrometheusBuilder;
use stack_common::tokio::spawn_task;
use stack_daemon::{
    adapters::{
        mock::{MockBrokerage, MockChainWatcher, MockConversionProvider, MockCustody},
        Adapters,
    },
    config::{
        Config, WebhookSecrets, EVENT_WORKER_POLL_INTERVAL, IDEMPOTENCY_PURGE_INTERVAL,
        PROVISIONING_POLL_INTERVAL, RECONCILIATION_FULL_RUN_HOUR, STEP_WORKER_POLL_INTERVAL,
    },
    core::{
        reconciliation::ReconciliationConfig,
        storage::SledStorage,
        Core,
    },
    rpc::{self, AppContext},
};

#[actix_web::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log_level),
    )
    .init();
    info!(
        "stack daemon {} starting (db: {})",
        stack_common::config::VERSION,
        config.db_path
    );

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .context("installing the metrics recorder")?;

    let storage = SledStorage::open(&config.db_path).context("opening the database")?;

    // devnet partner doubles; production deployments wire real vendor
    // adapters behind the same capability traits. The doubles start out
    // holding what the ledger seeds say they hold, so reconciliation is
    // truthful from the first tick.
    let custody = Arc::new(MockCustody::new());
    let brokerage = Arc::new(MockBrokerage::new());
    custody.set_treasury_balance(stack_daemon::config::default_buffer_seed(
        stack_common::ledger::AccountType::SystemBufferUsdc,
    ));
    brokerage.set_cash_balance(stack_daemon::config::default_buffer_seed(
        stack_common::ledger::AccountType::BrokerOperational,
    ));
    let adapters = Arc::new(Adapters::new(
        custody,
        Arc::new(MockConversionProvider::new()),
        brokerage,
        Arc::new(MockChainWatcher::new()),
    ));

    let core = Core::new(
        storage,
        adapters,
        ReconciliationConfig {
            auto_correct_low_severity: !config.no_auto_correct,
            ..Default::default()
        },
    );
    core.bootstrap().await.context("bootstrapping the core")?;

    spawn_workers(&config, core.clone());

    let context = AppContext {
        core,
        secrets: WebhookSecrets::default(),
        metrics: metrics_handle,
    };
    rpc::start(context, &config.bind_address)
        .await
        .context("running the HTTP server")?;
    Ok(())
}

fn spawn_workers(config: &Config, core: Arc<Core<SledStorage>>) {
    {
        let core = core.clone();
        spawn_task("event-worker", async move {
            let mut ticker = tokio::time::interval(EVENT_WORKER_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                loop {
                    match core.events.poll_once().await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(err) => {
                            error!("event worker: {err}");
                            break;
                        }
                    }
                }
            }
        });
    }
    {
        let core = core.clone();
        spawn_task("step-worker", async move {
            let mut ticker = tokio::time::interval(STEP_WORKER_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                loop {
                    match core.steps.poll_once().await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(err) => {
                            error!("step worker: {err}");
                            break;
                        }
                    }
                }
            }
        });
    }
    {
        let core = core.clone();
        spawn_task("provisioning-worker", async move {
            let mut ticker = tokio::time::interval(PROVISIONING_POLL_INTERVAL);
            loop {
                ticker.tick().await;
                loop {
                    match core.provisioning.poll_once().await {
                        Ok(true) => continue,
                        Ok(false) => break,
                        Err(err) => {
                            error!("provisioning worker: {err}");
                            break;
                        }
                    }
                }
            }
        });
    }
    {
        let core = core.clone();
        let interval = config.treasury_interval;
        spawn_task("treasury-scheduler", async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if let Err(err) = core.treasury.tick().await {
                    error!("treasury tick: {err}");
                }
            }
        });
    }
    {
        let core = core.clone();
        spawn_task("idempotency-purge", async move {
            let mut ticker = tokio::time::interval(IDEMPOTENCY_PURGE_INTERVAL);
            loop {
                ticker.tick().await;
                if let Err(err) = core.idempotency.purge_expired().await {
                    error!("idempotency purge: {err}");
                }
            }
        });
    }
    if !config.disable_reconciliation {
        let core = core.clone();
        let quick_interval = config.reconciliation_interval;
        spawn_task("reconciliation-scheduler", async move {
            use stack_common::reconciliation::RunKind;
            let mut last_quick = stack_common::time::now();
            let mut last_full_day = None;
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let now = stack_common::time::now();
                let today = now.date_naive();
                let full_due = chrono::Timelike::hour(&now) == RECONCILIATION_FULL_RUN_HOUR
                    && last_full_day != Some(today);
                if full_due {
                    if let Err(err) = core.reconciliation.run(RunKind::Full).await {
                        error!("full reconciliation: {err}");
                    }
                    last_full_day = Some(today);
                    last_quick = now;
                } else if now - last_quick
                    >= chrono::Duration::from_std(quick_interval)
                        .unwrap_or_else(|_| chrono::Duration::hours(1))
                {
                    if let Err(err) = core.reconciliation.run(RunKind::Quick).await {
                        error!("quick reconciliation: {err}");
                    }
                    last_quick = now;
                }
            }
        });
    }
}
