// HTTP surface: partner webhooks, the core API consumed by the gateway,
// health and metrics. Handlers translate taxonomy codes to status codes;
// no internals leak past the error body.

mod api;
mod webhooks;

use actix_web::{
    http::StatusCode,
    web::{self, Data},
    App, HttpResponse, HttpServer,
};
use metrics_exporter_prometheus::PrometheusHandle;
use stack_common::api::ErrorBody;

use crate::config::WebhookSecrets;
use crate::core::{error::CoreError, storage::Storage, Core};

pub struct AppContext<S: Storage> {
    pub core: std::sync::Arc<Core<S>>,
    pub secrets: WebhookSecrets,
    pub metrics: PrometheusHandle,
}

impl<S: Storage> Clone for AppContext<S> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
            secrets: self.secrets.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

/// Run the HTTP server until shutdown.
pub async fn start<S: Storage>(
    context: AppContext<S>,
    bind_address: &str,
) -> std::io::Result<()> {
    info!("HTTP surface listening on {bind_address}");
    let data = Data::new(context);
    HttpServer::new(move || App::new().app_data(data.clone()).configure(configure::<S>))
        .bind(bind_address)?
        .run()
        .await
}

pub fn configure<S: Storage>(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(api::health::<S>))
        .route("/metrics", web::get().to(api::metrics::<S>))
        .route("/withdrawals", web::post().to(api::post_withdrawal::<S>))
        .route(
            "/withdrawals/{id}",
            web::get().to(api::get_withdrawal::<S>),
        )
        .route(
            "/withdrawals/{id}/approve",
            web::post().to(api::approve_withdrawal::<S>),
        )
        .route("/deposits/{id}", web::get().to(api::get_deposit::<S>))
        .route(
            "/conversions/{id}",
            web::get().to(api::get_conversion::<S>),
        )
        .route(
            "/users/{id}/balances",
            web::get().to(api::get_balances::<S>),
        )
        .route(
            "/users/{id}/deposit-address/{chain}",
            web::get().to(api::get_deposit_address::<S>),
        )
        .route("/provisioning", web::post().to(api::post_provisioning::<S>))
        .route(
            "/provisioning/{id}",
            web::get().to(api::get_provisioning::<S>),
        )
        .route(
            "/treasury/conversions",
            web::post().to(api::post_manual_conversion::<S>),
        )
        .route(
            "/users/{id}/withdrawal-limits",
            web::put().to(api::put_withdrawal_limits::<S>),
        )
        .route(
            "/exceptions/{id}/resolve",
            web::post().to(api::resolve_exception::<S>),
        )
        .route("/audit", web::get().to(api::get_audit::<S>))
        .route(
            "/webhooks/chain",
            web::post().to(webhooks::chain_webhook::<S>),
        )
        .route(
            "/webhooks/conversion",
            web::post().to(webhooks::conversion_webhook::<S>),
        )
        .route(
            "/webhooks/broker",
            web::post().to(webhooks::broker_webhook::<S>),
        );
}

/// Taxonomy code to HTTP status.
pub(crate) fn status_for(err: &CoreError) -> StatusCode {
    match err.code() {
        "validation" => StatusCode::BAD_REQUEST,
        "unauthorized" => StatusCode::UNAUTHORIZED,
        "forbidden" => StatusCode::FORBIDDEN,
        "not_found" => StatusCode::NOT_FOUND,
        "conflict" => StatusCode::CONFLICT,
        "insufficient_funds" | "limit_exceeded" => StatusCode::UNPROCESSABLE_ENTITY,
        "external_transient" => StatusCode::SERVICE_UNAVAILABLE,
        "external_permanent" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn error_body(err: &CoreError) -> ErrorBody {
    ErrorBody {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}

pub(crate) fn error_response(err: &CoreError) -> HttpResponse {
    let status = status_for(err);
    if status.is_server_error() {
        error!("request failed: {err}");
    }
    HttpResponse::build(status).json(error_body(err))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{test, App};
    use hmac::Mac;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use stack_common::{
        amount::Amount,
        currency::Currency,
        ids::UserId,
        ledger::{AccountType, EntrySpec, TransactionType},
    };

    use crate::adapters::{
        mock::{MockBrokerage, MockChainWatcher, MockConversionProvider, MockCustody},
        Adapters,
    };
    use crate::core::{
        ledger::Posting, reconciliation::ReconciliationConfig, storage::SledStorage, Core,
    };

    use super::*;

    fn test_context() -> AppContext<SledStorage> {
        let adapters = Arc::new(Adapters::new(
            Arc::new(MockCustody::new()),
            Arc::new(MockConversionProvider::new()),
            Arc::new(MockBrokerage::new()),
            Arc::new(MockChainWatcher::new()),
        ));
        let core = Core::new(
            SledStorage::open_temporary().unwrap(),
            adapters,
            ReconciliationConfig::default(),
        );
        AppContext {
            core,
            secrets: WebhookSecrets::default(),
            metrics: PrometheusBuilder::new().build_recorder().handle(),
        }
    }

    async fn seed_buying_power(context: &AppContext<SledStorage>, user: UserId, units: u64) {
        context.core.bootstrap().await.unwrap();
        let fiat = context
            .core
            .ledger
            .get_or_create_account(Some(user), AccountType::FiatExposure)
            .await
            .unwrap();
        let buffer = context
            .core
            .ledger
            .system_account(AccountType::SystemBufferFiat)
            .await
            .unwrap();
        context
            .core
            .ledger
            .post_transaction(Posting::new(
                "http-test-seed",
                TransactionType::InternalTransfer,
                "seed",
                vec![
                    EntrySpec::debit(buffer.id, Amount::from_units(units, Currency::Usd)),
                    EntrySpec::credit(fiat.id, Amount::from_units(units, Currency::Usd)),
                ],
            ))
            .await
            .unwrap();
    }

    #[actix_web::test]
    async fn withdrawal_replay_is_byte_equal_and_key_reuse_conflicts() {
        let context = test_context();
        let user = UserId::generate();
        seed_buying_power(&context, user, 1_000).await;

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(context.clone()))
                .configure(configure::<SledStorage>),
        )
        .await;

        let body = serde_json::json!({
            "user_id": user,
            "amount_usd": "100.00",
            "target_chain": "SOL-DEVNET",
            "target_address": "SoTarget1111",
        });

        // missing key is rejected before the handler runs
        let no_key = test::TestRequest::post()
            .uri("/withdrawals")
            .set_json(&body)
            .send_request(&app)
            .await;
        assert_eq!(no_key.status(), StatusCode::BAD_REQUEST);

        let first = test::TestRequest::post()
            .uri("/withdrawals")
            .insert_header(("idempotency-key", "http-key-1"))
            .set_json(&body)
            .send_request(&app)
            .await;
        assert_eq!(first.status(), StatusCode::OK);
        let first_body = test::read_body(first).await;

        // same key, same payload: byte-equal response, one saga
        let replay = test::TestRequest::post()
            .uri("/withdrawals")
            .insert_header(("idempotency-key", "http-key-1"))
            .set_json(&body)
            .send_request(&app)
            .await;
        assert_eq!(replay.status(), StatusCode::OK);
        assert_eq!(test::read_body(replay).await, first_body);

        // same key, different payload: conflict
        let tampered = serde_json::json!({
            "user_id": user,
            "amount_usd": "999.00",
            "target_chain": "SOL-DEVNET",
            "target_address": "SoTarget1111",
        });
        let conflict = test::TestRequest::post()
            .uri("/withdrawals")
            .insert_header(("idempotency-key", "http-key-1"))
            .set_json(&tampered)
            .send_request(&app)
            .await;
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[actix_web::test]
    async fn chain_webhook_requires_a_valid_signature() {
        let context = test_context();
        context.core.bootstrap().await.unwrap();
        let secret = context.secrets.chain.clone();
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(context))
                .configure(configure::<SledStorage>),
        )
        .await;

        let body = serde_json::to_vec(&serde_json::json!({
            "chain": "SOL-DEVNET",
            "tx_hash": "0xhttp",
            "token": "USDC",
            "amount": "10.000000",
            "to_address": "SomeAddr1111",
            "confirmations": 32,
        }))
        .unwrap();

        let unsigned = test::TestRequest::post()
            .uri("/webhooks/chain")
            .insert_header(("content-type", "application/json"))
            .set_payload(body.clone())
            .send_request(&app)
            .await;
        assert_eq!(unsigned.status(), StatusCode::UNAUTHORIZED);

        let mut mac = hmac::Hmac::<sha2::Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(&body);
        let signature = hex::encode(mac.finalize().into_bytes());
        let signed = test::TestRequest::post()
            .uri("/webhooks/chain")
            .insert_header(("content-type", "application/json"))
            .insert_header(("x-webhook-signature", signature))
            .set_payload(body)
            .send_request(&app)
            .await;
        assert_eq!(signed.status(), StatusCode::OK);
    }
}
