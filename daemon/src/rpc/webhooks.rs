// Partner webhook endpoints.
//
// Thin by design: verify the partner signature over the raw body, capture
// or dispatch, return 200. Everything heavier happens in the workers.

use actix_web::{web, HttpRequest, HttpResponse};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use stack_common::api::{
    BrokerEventKind, BrokerWebhookPayload, ChainWebhookPayload, ConversionWebhookPayload,
    WebhookAck,
};

use crate::core::{storage::Storage, treasury::ProviderSettlement};

use super::{error_response, AppContext};

const SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

/// HMAC-SHA256 over the raw body, hex encoded in the signature header.
fn verify_signature(secret: &str, body: &[u8], req: &HttpRequest) -> bool {
    let Some(signature) = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return false;
    };
    let Ok(decoded) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&decoded).is_ok()
}

fn unauthorized() -> HttpResponse {
    metrics::counter!("webhook_signature_failures").increment(1);
    HttpResponse::Unauthorized().json(stack_common::api::ErrorBody {
        code: "unauthorized".to_string(),
        message: "webhook signature verification failed".to_string(),
    })
}

/// `POST /webhooks/chain`: a partner reporting on-chain finality.
pub async fn chain_webhook<S: Storage>(
    context: web::Data<AppContext<S>>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if !verify_signature(&context.secrets.chain, &body, &req) {
        return unauthorized();
    }
    let payload: ChainWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: format!("malformed chain webhook: {err}"),
            })
        }
    };
    match context.core.events.capture(&payload).await {
        Ok(_) => HttpResponse::Ok().json(WebhookAck {
            accepted: true,
            deposit_id: None,
        }),
        Err(err) => error_response(&err),
    }
}

/// `POST /webhooks/conversion`: provider status callback.
pub async fn conversion_webhook<S: Storage>(
    context: web::Data<AppContext<S>>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if !verify_signature(&context.secrets.conversion, &body, &req) {
        return unauthorized();
    }
    let payload: ConversionWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: format!("malformed conversion webhook: {err}"),
            })
        }
    };
    let settlement = ProviderSettlement {
        applied_rate_ppm: payload.applied_rate_ppm,
        destination_amount: payload.destination_amount.clone(),
        fees: payload.fees.clone(),
    };
    match context
        .core
        .treasury
        .on_provider_event(
            &payload.provider_tx_id,
            payload.status,
            settlement,
            payload.reason.clone(),
        )
        .await
    {
        Ok(_) => HttpResponse::Ok().json(WebhookAck {
            accepted: true,
            deposit_id: None,
        }),
        Err(err) => error_response(&err),
    }
}

/// `POST /webhooks/broker`: journal status callback.
pub async fn broker_webhook<S: Storage>(
    context: web::Data<AppContext<S>>,
    req: HttpRequest,
    body: web::Bytes,
) -> HttpResponse {
    if !verify_signature(&context.secrets.broker, &body, &req) {
        return unauthorized();
    }
    let payload: BrokerWebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            return HttpResponse::BadRequest().json(stack_common::api::ErrorBody {
                code: "validation".to_string(),
                message: format!("malformed broker webhook: {err}"),
            })
        }
    };
    let result = match payload.event {
        BrokerEventKind::WithdrawalSettled => {
            context
                .core
                .withdrawals
                .on_broker_settled(&payload.journal_ref)
                .await
        }
        // funding journals settle inside the broker-fund step; the
        // callback is advisory
        BrokerEventKind::FundingSettled => Ok(()),
        BrokerEventKind::JournalFailed => {
            context
                .core
                .withdrawals
                .on_broker_failed(&payload.journal_ref)
                .await
        }
    };
    match result {
        Ok(()) => HttpResponse::Ok().json(WebhookAck {
            accepted: true,
            deposit_id: None,
        }),
        Err(err) => error_response(&err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn signature_verification_roundtrip() {
        let body = br#"{"chain":"SOL-DEVNET"}"#;
        let signature = sign("secret", body);
        let req = TestRequest::default()
            .insert_header((SIGNATURE_HEADER, signature))
            .to_http_request();
        assert!(verify_signature("secret", body, &req));
        assert!(!verify_signature("other-secret", body, &req));
        assert!(!verify_signature("secret", b"tampered", &req));
    }

    #[test]
    fn missing_or_malformed_signature_fails() {
        let req = TestRequest::default().to_http_request();
        assert!(!verify_signature("secret", b"body", &req));

        let req = TestRequest::default()
            .insert_header((SIGNATURE_HEADER, "not-hex!"))
            .to_http_request();
        assert!(!verify_signature("secret", b"body", &req));
    }
}
