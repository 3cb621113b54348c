//! services/api/src/adapters/payu.rs
//!
//! This module contains the adapter for the PayU hosted checkout.
//! It implements the `PaymentGateway` port from the `booking_core` crate: signing the
//! checkout form, verifying the callback hash and querying the verify-payment API.

use async_trait::async_trait;
use booking_core::ports::{
    CheckoutForm, CheckoutRequest, GatewayCallback, GatewayPayment, GatewayPaymentState,
    PaymentGateway, PortError, PortResult,
};
use serde_json::Value;
use sha2::{Digest, Sha512};
use std::time::Duration;
use tracing::warn;

use crate::config::GatewayConfig;

//=========================================================================================
// Hash Helpers
//=========================================================================================

fn sha512_hex(input: &str) -> String {
    let mut hasher = Sha512::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// `key|txnid|amount|productinfo|firstname|email|udf1..udf5||||||salt`
pub fn request_hash(key: &str, salt: &str, request: &CheckoutRequest, amount: &str) -> String {
    let mut fields: Vec<&str> = vec![
        key,
        request.transaction_id.as_str(),
        amount,
        request.product_info.as_str(),
        request.first_name.as_str(),
        request.email.as_str(),
    ];
    fields.extend(request.udf.iter().map(String::as_str));
    fields.extend(["", "", "", "", ""]);
    fields.push(salt);
    sha512_hex(&fields.join("|"))
}

/// `[additionalCharges|]salt|status||||||udf5..udf1|email|firstname|productinfo|amount|txnid|key`
pub fn response_hash(key: &str, salt: &str, callback: &GatewayCallback) -> String {
    let mut fields: Vec<&str> = Vec::with_capacity(19);
    if let Some(charges) = callback.additional_charges.as_deref().filter(|c| !c.is_empty()) {
        fields.push(charges);
    }
    fields.push(salt);
    fields.push(callback.status.as_str());
    fields.extend(["", "", "", "", ""]);
    fields.extend(callback.udf.iter().rev().map(String::as_str));
    fields.extend([
        callback.email.as_str(),
        callback.first_name.as_str(),
        callback.product_info.as_str(),
        callback.amount.as_str(),
        callback.transaction_id.as_str(),
        key,
    ]);
    sha512_hex(&fields.join("|"))
}

/// Minor units to the gateway's decimal string, e.g. `50000` -> `"500.00"`.
pub fn format_amount(minor: i64) -> String {
    let sign = if minor < 0 { "-" } else { "" };
    let abs = minor.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// The gateway's decimal string back to minor units.
pub fn parse_amount(value: &str) -> Option<i64> {
    let value = value.trim();
    let (whole, fraction) = match value.split_once('.') {
        Some((w, f)) => (w, f),
        None => (value, ""),
    };
    if fraction.len() > 2 || !fraction.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let whole: i64 = whole.parse().ok()?;
    let cents: i64 = match fraction.len() {
        0 => 0,
        1 => fraction.parse::<i64>().ok()? * 10,
        _ => fraction.parse().ok()?,
    };
    whole.checked_mul(100)?.checked_add(cents)
}

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// An adapter that implements the `PaymentGateway` port against PayU.
#[derive(Clone)]
pub struct PayuGateway {
    client: reqwest::Client,
    config: GatewayConfig,
    success_url: String,
    failure_url: String,
}

impl PayuGateway {
    /// Creates a new `PayuGateway`. Callback URLs are derived from `public_base_url`.
    pub fn new(config: GatewayConfig, public_base_url: &str, timeout: Duration) -> PortResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PortError::Unexpected(format!("HTTP client: {}", e)))?;
        let base = public_base_url.trim_end_matches('/');
        Ok(Self {
            client,
            config,
            success_url: format!("{}/payment/success", base),
            failure_url: format!("{}/payment/failure", base),
        })
    }

    fn verify_hash(&self, transaction_id: &str) -> String {
        sha512_hex(&format!(
            "{}|verify_payment|{}|{}",
            self.config.key, transaction_id, self.config.salt
        ))
    }
}

fn state_from(status: &str) -> GatewayPaymentState {
    match status.to_ascii_lowercase().as_str() {
        "success" | "captured" => GatewayPaymentState::Captured,
        "failure" | "failed" | "usercancelled" | "dropped" | "bounced" => {
            GatewayPaymentState::Failed
        }
        "pending" | "in progress" | "initiated" => GatewayPaymentState::Pending,
        _ => GatewayPaymentState::Unknown,
    }
}

/// Reads one transaction out of a verify-payment response body.
fn parse_verify_response(transaction_id: &str, body: &Value) -> GatewayPayment {
    let details = &body["transaction_details"][transaction_id];
    let text = |field: &str| details[field].as_str().map(str::to_string);
    GatewayPayment {
        transaction_id: transaction_id.to_string(),
        gateway_payment_id: text("mihpayid").filter(|id| !id.is_empty()),
        state: text("status")
            .map(|s| state_from(&s))
            .unwrap_or(GatewayPaymentState::Unknown),
        amount: text("amt")
            .or_else(|| text("transaction_amount"))
            .and_then(|a| parse_amount(&a)),
    }
}

//=========================================================================================
// `PaymentGateway` Trait Implementation
//=========================================================================================

#[async_trait]
impl PaymentGateway for PayuGateway {
    fn create_order(&self, request: &CheckoutRequest) -> PortResult<CheckoutForm> {
        if request.amount <= 0 {
            return Err(PortError::Unexpected(format!(
                "Refusing to create order {} for a non-positive amount",
                request.transaction_id
            )));
        }
        let amount = format_amount(request.amount);
        let hash = request_hash(&self.config.key, &self.config.salt, request, &amount);

        let mut params = vec![
            ("key".to_string(), self.config.key.clone()),
            ("txnid".to_string(), request.transaction_id.clone()),
            ("amount".to_string(), amount),
            ("productinfo".to_string(), request.product_info.clone()),
            ("firstname".to_string(), request.first_name.clone()),
            ("email".to_string(), request.email.clone()),
            ("phone".to_string(), request.phone.clone()),
            ("surl".to_string(), self.success_url.clone()),
            ("furl".to_string(), self.failure_url.clone()),
        ];
        for (i, udf) in request.udf.iter().enumerate() {
            params.push((format!("udf{}", i + 1), udf.clone()));
        }
        params.push(("hash".to_string(), hash));

        Ok(CheckoutForm {
            action: format!("{}/_payment", self.config.base_url.trim_end_matches('/')),
            params,
        })
    }

    fn verify_callback(&self, callback: &GatewayCallback) -> bool {
        let expected = response_hash(&self.config.key, &self.config.salt, callback);
        let received = callback.hash.trim().to_ascii_lowercase();
        constant_time_eq::constant_time_eq(expected.as_bytes(), received.as_bytes())
    }

    async fn fetch_payment(&self, transaction_id: &str) -> PortResult<GatewayPayment> {
        let hash = self.verify_hash(transaction_id);
        let form = [
            ("key", self.config.key.as_str()),
            ("command", "verify_payment"),
            ("var1", transaction_id),
            ("hash", hash.as_str()),
        ];
        let response = self
            .client
            .post(&self.config.verify_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(format!("Gateway request failed: {}", e)))?;

        if !response.status().is_success() {
            warn!(
                "Gateway verify for {} returned HTTP {}",
                transaction_id,
                response.status()
            );
            return Err(PortError::Unexpected(format!(
                "Gateway verify returned {}",
                response.status()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PortError::Unexpected(format!("Gateway response unreadable: {}", e)))?;
        Ok(parse_verify_response(transaction_id, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    fn gateway() -> PayuGateway {
        PayuGateway::new(
            GatewayConfig {
                key: "merchant".into(),
                salt: "s3cr3t".into(),
                base_url: "https://test.payu.in/".into(),
                verify_url: "https://test.payu.in/verify".into(),
            },
            "https://api.example.com/",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn callback() -> GatewayCallback {
        GatewayCallback {
            transaction_id: "txn_1".into(),
            gateway_payment_id: Some("403993715".into()),
            status: "success".into(),
            amount: "500.00".into(),
            product_info: "Therapy Session".into(),
            first_name: "Asha".into(),
            email: "asha@example.com".into(),
            udf: ["p".into(), "c".into(), "2026-01-10".into(), "10:00".into(), String::new()],
            additional_charges: None,
            hash: String::new(),
        }
    }

    #[rstest]
    #[case(50000, "500.00")]
    #[case(1999, "19.99")]
    #[case(5, "0.05")]
    fn amounts_format_with_two_decimals(#[case] minor: i64, #[case] expected: &str) {
        assert_eq!(format_amount(minor), expected);
        assert_eq!(parse_amount(expected), Some(minor));
    }

    #[rstest]
    #[case("500", Some(50000))]
    #[case("500.5", Some(50050))]
    #[case("5.001", None)]
    #[case("abc", None)]
    #[case("92233720368547758.07", None)]
    #[case("9223372036854775807", None)]
    fn amounts_parse_leniently(#[case] input: &str, #[case] expected: Option<i64>) {
        assert_eq!(parse_amount(input), expected);
    }

    #[test]
    fn response_hash_uses_reverse_field_order() {
        let mut cb = callback();
        cb.udf[4] = "e".into();
        let expected = sha512_hex(
            "s3cr3t|success||||||e|10:00|2026-01-10|c|p|asha@example.com|Asha|Therapy Session|500.00|txn_1|merchant",
        );
        assert_eq!(response_hash("merchant", "s3cr3t", &cb), expected);
    }

    #[test]
    fn signed_callback_verifies_and_tampering_is_detected() {
        let gw = gateway();
        let mut cb = callback();
        cb.hash = response_hash("merchant", "s3cr3t", &cb).to_uppercase();
        assert!(gw.verify_callback(&cb));

        cb.amount = "1.00".into();
        assert!(!gw.verify_callback(&cb));
    }

    #[test]
    fn additional_charges_are_prefixed() {
        let mut cb = callback();
        let plain = response_hash("merchant", "s3cr3t", &cb);
        cb.additional_charges = Some("12.00".into());
        assert_ne!(response_hash("merchant", "s3cr3t", &cb), plain);
    }

    #[test]
    fn checkout_form_is_signed_and_points_at_callbacks() {
        let request = CheckoutRequest {
            transaction_id: "txn_1".into(),
            amount: 50000,
            product_info: "Therapy Session".into(),
            first_name: "Asha".into(),
            email: "asha@example.com".into(),
            phone: "9999999999".into(),
            udf: Default::default(),
        };
        let form = gateway().create_order(&request).unwrap();
        assert_eq!(form.action, "https://test.payu.in/_payment");

        let get = |name: &str| {
            form.params
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(get("amount"), "500.00");
        assert_eq!(get("surl"), "https://api.example.com/payment/success");
        assert_eq!(get("furl"), "https://api.example.com/payment/failure");
        assert_eq!(
            get("hash"),
            sha512_hex(&format!(
                "merchant|txn_1|500.00|Therapy Session|Asha|asha@example.com{}s3cr3t",
                "|".repeat(11)
            ))
        );
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let request = CheckoutRequest {
            transaction_id: "txn_0".into(),
            amount: 0,
            product_info: String::new(),
            first_name: String::new(),
            email: String::new(),
            phone: String::new(),
            udf: Default::default(),
        };
        assert!(gateway().create_order(&request).is_err());
    }

    #[test]
    fn verify_response_is_read_per_transaction() {
        let body = json!({
            "status": 1,
            "transaction_details": {
                "txn_1": { "mihpayid": "403993715", "status": "success", "amt": "500.00" }
            }
        });
        let payment = parse_verify_response("txn_1", &body);
        assert_eq!(payment.state, GatewayPaymentState::Captured);
        assert_eq!(payment.amount, Some(50000));
        assert_eq!(payment.gateway_payment_id.as_deref(), Some("403993715"));

        let missing = parse_verify_response("txn_2", &body);
        assert_eq!(missing.state, GatewayPaymentState::Unknown);
    }
}
