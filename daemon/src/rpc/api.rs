// Core API consumed by the HTTP gateway.

use actix_web::{
    http::StatusCode,
    web::{self, Bytes, Path, Query},
    HttpRequest, HttpResponse,
};
use stack_common::{
    amount::Amount,
    api::{
        BalancesResponse, DepositAddressResponse, HealthResponse,
        InitiateWithdrawalRequest, InitiateWithdrawalResponse, ManualConversionRequest,
        ProvisioningRequest, ResolveExceptionRequest, WithdrawalLimitsRequest, WorkerHealth,
    },
    audit::AuditQuery,
    conversion::ConversionDirection,
    currency::Currency,
    ids::{ConversionJobId, DepositId, ExceptionId, ProvisioningJobId, UserId, WithdrawalId},
    reconciliation::ResolutionState,
    withdrawal::WithdrawalLimits,
};

use crate::core::{error::CoreError, idempotency::IdempotencyCheck, storage::Storage};

use super::{error_body, error_response, status_for, AppContext};

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn idempotency_key(req: &HttpRequest) -> Option<String> {
    req.headers()
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn missing_key() -> HttpResponse {
    HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
        code: "validation".to_string(),
        message: format!("the {IDEMPOTENCY_HEADER} header is required"),
    })
}

fn parse_path_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, HttpResponse> {
    raw.parse().map_err(|_| {
        HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
            code: "validation".to_string(),
            message: format!("malformed {what} id"),
        })
    })
}

/// `POST /withdrawals` behind the idempotency layer: a replayed key with
/// the same payload returns the byte-identical cached response.
pub async fn post_withdrawal<S: Storage>(
    context: web::Data<AppContext<S>>,
    req: HttpRequest,
    body: Bytes,
) -> HttpResponse {
    let Some(key) = idempotency_key(&req) else {
        return missing_key();
    };
    let check = match context
        .core
        .idempotency
        .check(&key, "/withdrawals", "POST", &body)
        .await
    {
        Ok(check) => check,
        Err(err) => return error_response(&err),
    };
    let request_hash = match check {
        IdempotencyCheck::Replay(record) => {
            return HttpResponse::build(
                StatusCode::from_u16(record.response_status)
                    .unwrap_or(StatusCode::OK),
            )
            .content_type("application/json")
            .body(record.response_body)
        }
        IdempotencyCheck::Fresh { request_hash } => request_hash,
    };

    let payload: InitiateWithdrawalRequest = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: format!("malformed withdrawal request: {err}"),
            })
        }
    };
    let result = match Amount::parse(&payload.amount_usd, Currency::Usd) {
        Ok(amount) => {
            context
                .core
                .withdrawals
                .initiate(
                    payload.user_id,
                    amount,
                    &payload.target_chain,
                    &payload.target_address,
                    &key,
                )
                .await
        }
        Err(err) => Err(CoreError::Validation(err.to_string())),
    };

    let (status, response_body) = match &result {
        Ok(withdrawal) => (
            StatusCode::OK,
            serde_json::to_string(&InitiateWithdrawalResponse {
                withdrawal_id: withdrawal.id,
            })
            .unwrap_or_else(|_| "{}".to_string()),
        ),
        Err(err) => (
            status_for(err),
            serde_json::to_string(&error_body(err)).unwrap_or_else(|_| "{}".to_string()),
        ),
    };
    // cache the final response so a replay is byte-equal
    if let Err(err) = context
        .core
        .idempotency
        .store_response(
            &key,
            "/withdrawals",
            "POST",
            request_hash,
            Some(payload.user_id),
            status.as_u16(),
            response_body.clone(),
        )
        .await
    {
        error!("failed to store idempotency record for {key}: {err}");
    }
    HttpResponse::build(status)
        .content_type("application/json")
        .body(response_body)
}

pub async fn get_withdrawal<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
) -> HttpResponse {
    let id: WithdrawalId = match parse_path_id(&path, "withdrawal") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.withdrawals.get_withdrawal(&id).await {
        Ok(withdrawal) => HttpResponse::Ok().json(withdrawal),
        Err(err) => error_response(&err),
    }
}

pub async fn approve_withdrawal<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
) -> HttpResponse {
    let id: WithdrawalId = match parse_path_id(&path, "withdrawal") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.withdrawals.approve_dual_auth(&id).await {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({ "approved": true })),
        Err(err) => error_response(&err),
    }
}

pub async fn get_deposit<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
) -> HttpResponse {
    let id: DepositId = match parse_path_id(&path, "deposit") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.funding.get_deposit(&id).await {
        Ok(deposit) => HttpResponse::Ok().json(deposit),
        Err(err) => error_response(&err),
    }
}

pub async fn get_conversion<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
) -> HttpResponse {
    let id: ConversionJobId = match parse_path_id(&path, "conversion") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.treasury.get_job(&id).await {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(err) => error_response(&err),
    }
}

pub async fn get_balances<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
) -> HttpResponse {
    let user_id: UserId = match parse_path_id(&path, "user") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.get_balances(&user_id).await {
        Ok(balances) => HttpResponse::Ok().json(BalancesResponse {
            buying_power_usd: balances.buying_power_usd.to_string(),
            pending_deposits_usd: balances.pending_deposits_usd.to_string(),
            usdc_on_chain: balances.usdc_on_chain.to_string(),
        }),
        Err(err) => error_response(&err),
    }
}

pub async fn get_deposit_address<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<(String, String)>,
) -> HttpResponse {
    let (raw_user, chain) = path.into_inner();
    let user_id: UserId = match parse_path_id(&raw_user, "user") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.get_deposit_address(&user_id, &chain).await {
        Ok(address) => HttpResponse::Ok().json(DepositAddressResponse {
            user_id,
            chain,
            address,
        }),
        Err(err) => error_response(&err),
    }
}

pub async fn post_provisioning<S: Storage>(
    context: web::Data<AppContext<S>>,
    payload: web::Json<ProvisioningRequest>,
) -> HttpResponse {
    let payload = payload.into_inner();
    match context
        .core
        .provisioning
        .enqueue(payload.user_id, payload.chains)
        .await
    {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(err) => error_response(&err),
    }
}

pub async fn get_provisioning<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
) -> HttpResponse {
    let id: ProvisioningJobId = match parse_path_id(&path, "provisioning job") {
        Ok(id) => id,
        Err(response) => return response,
    };
    match context.core.provisioning.get_job(&id).await {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(err) => error_response(&err),
    }
}

/// Operator entry point for manual and emergency conversions.
pub async fn post_manual_conversion<S: Storage>(
    context: web::Data<AppContext<S>>,
    req: HttpRequest,
    payload: web::Json<ManualConversionRequest>,
) -> HttpResponse {
    let Some(key) = idempotency_key(&req) else {
        return missing_key();
    };
    let payload = payload.into_inner();
    let direction: ConversionDirection = match payload.direction.parse() {
        Ok(direction) => direction,
        Err(_) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: "direction must be usdc_to_usd or usd_to_usdc".to_string(),
            })
        }
    };
    let amount = match Amount::parse(&payload.amount, direction.source_currency()) {
        Ok(amount) => amount,
        Err(err) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: err.to_string(),
            })
        }
    };
    match context
        .core
        .treasury
        .trigger_manual(direction, amount, payload.emergency, key)
        .await
    {
        Ok(job) => HttpResponse::Ok().json(job),
        Err(err) => error_response(&err),
    }
}

/// Operator override for a user's withdrawal caps.
pub async fn put_withdrawal_limits<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
    payload: web::Json<WithdrawalLimitsRequest>,
) -> HttpResponse {
    let user_id: UserId = match parse_path_id(&path, "user") {
        Ok(id) => id,
        Err(response) => return response,
    };
    let payload = payload.into_inner();
    let parse = |raw: &str| Amount::parse(raw, Currency::Usd);
    let limits = match (
        parse(&payload.daily),
        parse(&payload.weekly),
        parse(&payload.monthly),
        parse(&payload.dual_auth_threshold),
    ) {
        (Ok(daily), Ok(weekly), Ok(monthly), Ok(dual_auth_threshold)) => WithdrawalLimits {
            daily,
            weekly,
            monthly,
            dual_auth_threshold,
        },
        _ => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: "limits must be decimal USD amounts".to_string(),
            })
        }
    };
    let mut storage = context.core.storage.write().await;
    match crate::core::storage::WithdrawalProvider::set_withdrawal_limits(
        &mut *storage,
        &user_id,
        &limits,
    )
    .await
    {
        Ok(()) => HttpResponse::Ok().json(limits),
        Err(err) => error_response(&err),
    }
}

/// Human resolution workflow on a reconciliation exception.
pub async fn resolve_exception<S: Storage>(
    context: web::Data<AppContext<S>>,
    path: Path<String>,
    payload: web::Json<ResolveExceptionRequest>,
) -> HttpResponse {
    let id: ExceptionId = match parse_path_id(&path, "exception") {
        Ok(id) => id,
        Err(response) => return response,
    };
    let state: ResolutionState = match payload.state.parse() {
        Ok(state) => state,
        Err(_) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: "state must be investigating, resolved or wont_fix".to_string(),
            })
        }
    };
    match context.core.reconciliation.resolve_exception(&id, state).await {
        Ok(exception) => HttpResponse::Ok().json(exception),
        Err(err) => error_response(&err),
    }
}

pub async fn get_audit<S: Storage>(
    context: web::Data<AppContext<S>>,
    query: Query<AuditQuery>,
) -> HttpResponse {
    match context.core.audit.query(&query).await {
        Ok(entries) => HttpResponse::Ok().json(entries),
        Err(err) => error_response(&err),
    }
}

pub async fn health<S: Storage>(context: web::Data<AppContext<S>>) -> HttpResponse {
    let storage = context.core.storage_healthy().await;
    let dlq_depth = context.core.events.dlq_depth().await.unwrap_or(0);
    let workers = vec![WorkerHealth {
        name: "event_worker_dlq_depth".to_string(),
        healthy: dlq_depth == 0,
        last_tick_ms: Some(dlq_depth as u64),
    }];
    let healthy = storage;
    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        version: stack_common::config::VERSION.to_string(),
        storage,
        workers,
    };
    if healthy {
        HttpResponse::Ok().json(response)
    } else {
        HttpResponse::ServiceUnavailable().json(response)
    }
}

pub async fn metrics<S: Storage>(context: web::Data<AppContext<S>>) -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(context.metrics.render())
}
