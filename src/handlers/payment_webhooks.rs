use crate::{errors::ServiceError, handlers::AppState, services::webhooks::GatewayEvent};
use axum::{
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use bytes::Bytes;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use tracing::{info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Payment gateway webhook receiver.
///
/// Verifies the request signature against the shared webhook secret, then
/// hands the event to the reconciler. Always responds 200 once the event is
/// accepted so the gateway stops redelivering.
async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ServiceError> {
    if let Some(secret) = &state.config.payment_webhook_secret {
        let tolerance = state.config.payment_webhook_tolerance_secs;
        if !verify_signature(&headers, &body, secret, tolerance) {
            warn!("Rejected webhook with missing or invalid signature");
            return Err(ServiceError::Unauthorized(
                "Invalid webhook signature".to_string(),
            ));
        }
    } else {
        warn!("Webhook secret not configured; accepting unsigned event");
    }

    let event: GatewayEvent = serde_json::from_slice(&body)
        .map_err(|e| ServiceError::BadRequest(format!("Malformed webhook payload: {}", e)))?;

    info!(event_type = %event.event_type, "Received payment gateway event");
    state.services.webhooks.handle_event(event).await?;

    Ok(Json(json!({ "received": true })))
}

/// Checks either a Stripe-style `Stripe-Signature` header (`t=`, `v1=`) or
/// the generic `x-timestamp` / `x-signature` pair. Both schemes sign
/// `"{timestamp}.{body}"` with HMAC-SHA256 and hex-encode the digest.
fn verify_signature(
    headers: &HeaderMap,
    payload: &Bytes,
    secret: &str,
    tolerance_secs: u64,
) -> bool {
    if let Some(sig) = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
    {
        let mut ts = "";
        let mut v1 = "";
        for part in sig.split(',') {
            let mut it = part.trim().split('=');
            match (it.next(), it.next()) {
                (Some("t"), Some(val)) => ts = val,
                (Some("v1"), Some(val)) => v1 = val,
                _ => {}
            }
        }
        if ts.is_empty() || v1.is_empty() {
            return false;
        }
        if !timestamp_in_tolerance(ts, tolerance_secs) {
            return false;
        }
        return signature_matches(ts, payload, secret, v1);
    }

    if let (Some(ts), Some(sig)) = (headers.get("x-timestamp"), headers.get("x-signature")) {
        if let (Ok(ts), Ok(sig)) = (ts.to_str(), sig.to_str()) {
            if !timestamp_in_tolerance(ts, tolerance_secs) {
                return false;
            }
            return signature_matches(ts, payload, secret, sig);
        }
    }

    false
}

fn timestamp_in_tolerance(ts: &str, tolerance_secs: u64) -> bool {
    match ts.parse::<i64>() {
        Ok(ts) => {
            let now = chrono::Utc::now().timestamp();
            (now - ts).unsigned_abs() <= tolerance_secs
        }
        Err(_) => false,
    }
}

fn signature_matches(ts: &str, payload: &Bytes, secret: &str, provided: &str) -> bool {
    let signed = format!("{}.{}", ts, std::str::from_utf8(payload).unwrap_or(""));
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(signed.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(&expected, provided)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/webhooks/payments", post(receive_webhook))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(ts: i64, body: &str, secret: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{}.{}", ts, body).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn accepts_valid_stripe_signature() {
        let body = r#"{"type":"checkout.session.completed"}"#;
        let ts = chrono::Utc::now().timestamp();
        let sig = sign(ts, body, "whsec_test");

        let mut headers = HeaderMap::new();
        headers.insert(
            "Stripe-Signature",
            format!("t={},v1={}", ts, sig).parse().unwrap(),
        );

        assert!(verify_signature(
            &headers,
            &Bytes::from(body),
            "whsec_test",
            300
        ));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = r#"{"type":"checkout.session.completed"}"#;
        let ts = chrono::Utc::now().timestamp();
        let sig = sign(ts, body, "whsec_other");

        let mut headers = HeaderMap::new();
        headers.insert(
            "Stripe-Signature",
            format!("t={},v1={}", ts, sig).parse().unwrap(),
        );

        assert!(!verify_signature(
            &headers,
            &Bytes::from(body),
            "whsec_test",
            300
        ));
    }

    #[test]
    fn rejects_stale_timestamp() {
        let body = "{}";
        let ts = chrono::Utc::now().timestamp() - 3600;
        let sig = sign(ts, body, "whsec_test");

        let mut headers = HeaderMap::new();
        headers.insert(
            "Stripe-Signature",
            format!("t={},v1={}", ts, sig).parse().unwrap(),
        );

        assert!(!verify_signature(
            &headers,
            &Bytes::from(body),
            "whsec_test",
            300
        ));
    }

    #[test]
    fn rejects_tampered_body() {
        let ts = chrono::Utc::now().timestamp();
        let sig = sign(ts, r#"{"amount":10}"#, "whsec_test");

        let mut headers = HeaderMap::new();
        headers.insert(
            "Stripe-Signature",
            format!("t={},v1={}", ts, sig).parse().unwrap(),
        );

        assert!(!verify_signature(
            &headers,
            &Bytes::from(r#"{"amount":9999}"#),
            "whsec_test",
            300
        ));
    }

    #[test]
    fn accepts_generic_header_pair() {
        let body = r#"{"type":"charge.refunded"}"#;
        let ts = chrono::Utc::now().timestamp();
        let sig = sign(ts, body, "whsec_test");

        let mut headers = HeaderMap::new();
        headers.insert("x-timestamp", ts.to_string().parse().unwrap());
        headers.insert("x-signature", sig.parse().unwrap());

        assert!(verify_signature(
            &headers,
            &Bytes::from(body),
            "whsec_test",
            300
        ));
    }

    #[test]
    fn rejects_when_no_signature_headers() {
        assert!(!verify_signature(
            &HeaderMap::new(),
            &Bytes::from("{}"),
            "whsec_test",
            300
        ));
    }
}
