use chrono::{DateTime, FixedOffset, Utc};
use hmac::{Hmac, Mac};
use seatline_shared::Masked;
use sha2::Sha512;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

type HmacSha512 = Hmac<Sha512>;

pub const SECURE_HASH_FIELD: &str = "vnp_SecureHash";
pub const SECURE_HASH_TYPE_FIELD: &str = "vnp_SecureHashType";
const SUCCESS_CODE: &str = "00";
const GATEWAY_UTC_OFFSET_SECS: i32 = 7 * 3600;
const DATE_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone)]
pub struct VnPayConfig {
    pub tmn_code: String,
    pub hash_secret: Masked<String>,
    pub pay_url: String,
    pub return_url: String,
    pub version: String,
    pub currency: String,
    pub order_type: String,
    pub payment_window: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Missing hash")]
    MissingHash,

    #[error("Hash mismatch")]
    HashMismatch,

    #[error("Invalid signing key")]
    InvalidKey,

    #[error("Invalid payment amount: {0}")]
    InvalidAmount(i64),

    #[error("Invalid gateway configuration: {0}")]
    InvalidConfig(String),
}

/// Callback fields whose signature has been checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedCallback {
    pub fields: BTreeMap<String, String>,
}

impl VerifiedCallback {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn txn_ref(&self) -> Option<&str> {
        self.field("vnp_TxnRef")
    }

    pub fn response_code(&self) -> Option<&str> {
        self.field("vnp_ResponseCode")
    }

    pub fn transaction_status(&self) -> Option<&str> {
        self.field("vnp_TransactionStatus")
    }

    pub fn is_success(&self) -> bool {
        self.response_code() == Some(SUCCESS_CODE) && self.transaction_status() == Some(SUCCESS_CODE)
    }
}

/// Builds signed redirect URLs and checks signed callbacks for VNPay.
#[derive(Debug, Clone)]
pub struct VnPayGateway {
    config: VnPayConfig,
}

impl VnPayGateway {
    pub fn new(config: VnPayConfig) -> Self {
        Self { config }
    }

    pub fn create_payment_url(
        &self,
        amount: i64,
        bank_code: Option<&str>,
        client_ip: &str,
        locale: &str,
        order_reference: &str,
    ) -> Result<String, GatewayError> {
        self.create_payment_url_at(amount, bank_code, client_ip, locale, order_reference, Utc::now())
    }

    pub fn create_payment_url_at(
        &self,
        amount: i64,
        bank_code: Option<&str>,
        client_ip: &str,
        locale: &str,
        order_reference: &str,
        now: DateTime<Utc>,
    ) -> Result<String, GatewayError> {
        if amount <= 0 {
            return Err(GatewayError::InvalidAmount(amount));
        }
        // Gateway amounts are expressed in hundredths.
        let minor_units = amount
            .checked_mul(100)
            .ok_or(GatewayError::InvalidAmount(amount))?;

        let offset = FixedOffset::east_opt(GATEWAY_UTC_OFFSET_SECS)
            .ok_or_else(|| GatewayError::InvalidConfig("gateway time zone".to_string()))?;
        let window = chrono::Duration::from_std(self.config.payment_window)
            .map_err(|e| GatewayError::InvalidConfig(e.to_string()))?;
        let created = now.with_timezone(&offset);
        let expires = created + window;

        let locale = if locale.trim().is_empty() { "vn" } else { locale };

        let mut fields = BTreeMap::new();
        fields.insert("vnp_Version".to_string(), self.config.version.clone());
        fields.insert("vnp_Command".to_string(), "pay".to_string());
        fields.insert("vnp_TmnCode".to_string(), self.config.tmn_code.clone());
        fields.insert("vnp_Amount".to_string(), minor_units.to_string());
        fields.insert("vnp_CurrCode".to_string(), self.config.currency.clone());
        fields.insert("vnp_BankCode".to_string(), bank_code.unwrap_or_default().to_string());
        fields.insert("vnp_TxnRef".to_string(), order_reference.to_string());
        fields.insert("vnp_OrderInfo".to_string(), format!("Payment for booking {}", order_reference));
        fields.insert("vnp_OrderType".to_string(), self.config.order_type.clone());
        fields.insert("vnp_Locale".to_string(), locale.to_string());
        fields.insert("vnp_ReturnUrl".to_string(), self.config.return_url.clone());
        fields.insert("vnp_IpAddr".to_string(), client_ip.to_string());
        fields.insert("vnp_CreateDate".to_string(), created.format(DATE_FORMAT).to_string());
        fields.insert("vnp_ExpireDate".to_string(), expires.format(DATE_FORMAT).to_string());

        let signature = self.sign_fields(&fields)?;

        let query = fields
            .iter()
            .filter(|(_, value)| !value.is_empty())
            .map(|(key, value)| format!("{}={}", urlencoding::encode(key), urlencoding::encode(value)))
            .collect::<Vec<_>>()
            .join("&");

        Ok(format!(
            "{}?{}&{}={}",
            self.config.pay_url, query, SECURE_HASH_FIELD, signature
        ))
    }

    /// Lowercase hex HMAC-SHA512 over the sorted, unescaped `key=value` pairs
    /// (empty values dropped).
    pub fn sign_fields(&self, fields: &BTreeMap<String, String>) -> Result<String, GatewayError> {
        let mut mac = self.mac()?;
        mac.update(signing_input(fields).as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verifies a return or IPN payload. Nothing about the booking may change
    /// unless this succeeds.
    pub fn verify_callback(&self, params: &HashMap<String, String>) -> Result<VerifiedCallback, GatewayError> {
        let received = params
            .get(SECURE_HASH_FIELD)
            .filter(|hash| !hash.is_empty())
            .ok_or(GatewayError::MissingHash)?;

        let fields: BTreeMap<String, String> = params
            .iter()
            .filter(|(key, _)| key.as_str() != SECURE_HASH_FIELD && key.as_str() != SECURE_HASH_TYPE_FIELD)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let received_bytes = hex::decode(received).map_err(|_| GatewayError::HashMismatch)?;
        let mut mac = self.mac()?;
        mac.update(signing_input(&fields).as_bytes());
        mac.verify_slice(&received_bytes)
            .map_err(|_| GatewayError::HashMismatch)?;

        Ok(VerifiedCallback { fields })
    }

    fn mac(&self) -> Result<HmacSha512, GatewayError> {
        HmacSha512::new_from_slice(self.config.hash_secret.expose().as_bytes())
            .map_err(|_| GatewayError::InvalidKey)
    }
}

fn signing_input(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(key, value)| format!("{}={}", key, value))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn gateway() -> VnPayGateway {
        VnPayGateway::new(VnPayConfig {
            tmn_code: "TESTCODE".to_string(),
            hash_secret: Masked("SECRETSECRETSECRET".to_string()),
            pay_url: "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html".to_string(),
            return_url: "http://localhost:9503/api/payment/return".to_string(),
            version: "2.1.0".to_string(),
            currency: "VND".to_string(),
            order_type: "other".to_string(),
            payment_window: Duration::from_secs(15 * 60),
        })
    }

    fn signed_callback(gateway: &VnPayGateway, response: &str, status: &str) -> HashMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("vnp_TxnRef".to_string(), "Ab12Cd".to_string());
        fields.insert("vnp_Amount".to_string(), "12000000".to_string());
        fields.insert("vnp_ResponseCode".to_string(), response.to_string());
        fields.insert("vnp_TransactionStatus".to_string(), status.to_string());
        fields.insert("vnp_OrderInfo".to_string(), "Payment for booking Ab12Cd".to_string());
        let hash = gateway.sign_fields(&fields).unwrap();

        let mut params: HashMap<String, String> = fields.into_iter().collect();
        params.insert(SECURE_HASH_FIELD.to_string(), hash);
        params.insert(SECURE_HASH_TYPE_FIELD.to_string(), "HmacSHA512".to_string());
        params
    }

    #[test]
    fn test_signing_input_sorts_and_skips_empty_values() {
        let mut fields = BTreeMap::new();
        fields.insert("vnp_b".to_string(), "2".to_string());
        fields.insert("vnp_a".to_string(), "x y".to_string());
        fields.insert("vnp_c".to_string(), String::new());
        assert_eq!(signing_input(&fields), "vnp_a=x y&vnp_b=2");
    }

    #[test]
    fn test_payment_url_signature_covers_unescaped_fields() {
        let gateway = gateway();
        let now = Utc.with_ymd_and_hms(2025, 5, 1, 3, 0, 0).unwrap();
        let url = gateway
            .create_payment_url_at(120_000, None, "127.0.0.1", "", "Ab12Cd", now)
            .unwrap();

        let (base, query) = url.split_once('?').unwrap();
        assert_eq!(base, "https://sandbox.vnpayment.vn/paymentv2/vpcpay.html");

        let mut fields = BTreeMap::new();
        let mut hash = None;
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap();
            let value = urlencoding::decode(value).unwrap().into_owned();
            if key == SECURE_HASH_FIELD {
                hash = Some(value);
            } else {
                fields.insert(key.to_string(), value);
            }
        }

        assert!(!fields.contains_key("vnp_BankCode"));
        assert_eq!(fields["vnp_Amount"], "12000000");
        assert_eq!(fields["vnp_Locale"], "vn");
        assert_eq!(fields["vnp_CreateDate"], "20250501100000");
        assert_eq!(fields["vnp_ExpireDate"], "20250501101500");
        assert!(query.contains("vnp_ReturnUrl=http%3A%2F%2Flocalhost%3A9503%2Fapi%2Fpayment%2Freturn"));
        assert_eq!(hash.unwrap(), gateway.sign_fields(&fields).unwrap());
    }

    #[test]
    fn test_rejects_non_positive_amount() {
        let err = gateway()
            .create_payment_url(0, Some("NCB"), "127.0.0.1", "vn", "Ab12Cd")
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidAmount(0)));
    }

    #[test]
    fn test_verify_accepts_correct_signature() {
        let gateway = gateway();
        let verified = gateway
            .verify_callback(&signed_callback(&gateway, "00", "00"))
            .unwrap();
        assert!(verified.is_success());
        assert_eq!(verified.txn_ref(), Some("Ab12Cd"));
        assert!(!verified.fields.contains_key(SECURE_HASH_TYPE_FIELD));
    }

    #[test]
    fn test_verify_rejects_tampered_field() {
        let gateway = gateway();
        let mut params = signed_callback(&gateway, "24", "02");
        params.insert("vnp_ResponseCode".to_string(), "00".to_string());
        params.insert("vnp_TransactionStatus".to_string(), "00".to_string());
        assert!(matches!(gateway.verify_callback(&params), Err(GatewayError::HashMismatch)));
    }

    #[test]
    fn test_verify_requires_hash() {
        let gateway = gateway();
        let mut params = signed_callback(&gateway, "00", "00");
        params.remove(SECURE_HASH_FIELD);
        assert!(matches!(gateway.verify_callback(&params), Err(GatewayError::MissingHash)));

        params.insert(SECURE_HASH_FIELD.to_string(), "not-hex".to_string());
        assert!(matches!(gateway.verify_callback(&params), Err(GatewayError::HashMismatch)));
    }

    #[test]
    fn test_verify_accepts_uppercase_hash() {
        let gateway = gateway();
        let mut params = signed_callback(&gateway, "00", "00");
        let upper = params[SECURE_HASH_FIELD].to_uppercase();
        params.insert(SECURE_HASH_FIELD.to_string(), upper);
        assert!(gateway.verify_callback(&params).is_ok());
    }
}
