use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::models::{Gateway, Tier};

/// Daily validation quota per tier. `-1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaConfig {
    pub free: i64,
    pub registered: i64,
    pub pro: i64,
}

impl QuotaConfig {
    pub fn limit_for(&self, tier: Tier) -> i64 {
        match tier {
            Tier::Free => self.free,
            Tier::Registered => self.registered,
            Tier::Pro => self.pro,
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            free: 3,
            registered: 10,
            pro: -1,
        }
    }
}

/// Requests per minute per client IP. `0` disables the layer.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub strict_rpm: u32,
    pub standard_rpm: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strict_rpm: 10,
            standard_rpm: 60,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RazorpayConfig {
    pub webhook_secret: String,
    /// API credentials; without them checkout and live status queries are unavailable
    pub key_id: Option<String>,
    pub key_secret: Option<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct PayuConfig {
    pub merchant_key: String,
    pub salt: String,
    /// Source addresses (CIDR or bare IP) allowed to post notifications.
    /// Empty rejects everything.
    pub allowed_ips: Vec<String>,
    pub verify_url: String,
    pub payment_url: String,
}

#[derive(Debug, Clone)]
pub struct PhonePeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub client_version: String,
    pub webhook_username: String,
    pub webhook_password: String,
    pub api_base: String,
    pub auth_url: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub database_path: String,
    pub base_url: String,
    pub dev_mode: bool,
    /// Bearer key for the internal payment and token API
    pub internal_api_key: Option<String>,
    /// Bearer key for reconciliation endpoints
    pub operator_api_key: Option<String>,
    /// Honor `X-Forwarded-For` when resolving a webhook's source address
    pub trust_forwarded_for: bool,
    pub subscription_period_days: i64,
    /// Tax rate in basis points (1800 = 18%)
    pub tax_rate_bps: i64,
    pub default_currency: String,
    pub default_gateway: Gateway,
    pub quotas: QuotaConfig,
    /// Where a freshly issued token is sent. `{solution_id}` is substituted.
    pub solution_url_template: String,
    /// Where the gateway returns the buyer. `{transaction_id}` is substituted.
    pub checkout_return_url: String,
    pub gateway_timeout: Duration,
    pub reconcile_concurrency: usize,
    /// `0` disables the background expiry sweep
    pub expiry_sweep_interval_secs: u64,
    pub email_webhook_url: Option<String>,
    pub invoice_webhook_url: Option<String>,
    pub rate_limit: RateLimitConfig,
    pub razorpay: Option<RazorpayConfig>,
    pub payu: Option<PayuConfig>,
    pub phonepe: Option<PhonePeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let base_url = "http://127.0.0.1:3000".to_string();
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            database_path: "entitlements.db".to_string(),
            solution_url_template: format!("{}/solutions/{{solution_id}}", base_url),
            checkout_return_url: format!("{}/payments/return/{{transaction_id}}", base_url),
            base_url,
            dev_mode: false,
            internal_api_key: None,
            operator_api_key: None,
            trust_forwarded_for: false,
            subscription_period_days: 30,
            tax_rate_bps: 1800,
            default_currency: "inr".to_string(),
            default_gateway: Gateway::Razorpay,
            quotas: QuotaConfig::default(),
            gateway_timeout: Duration::from_secs(10),
            reconcile_concurrency: 4,
            expiry_sweep_interval_secs: 0,
            email_webhook_url: None,
            invoice_webhook_url: None,
            rate_limit: RateLimitConfig::default(),
            razorpay: None,
            payu: None,
            phonepe: None,
        }
    }
}

fn var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_or<T: FromStr>(key: &str, default: T) -> T {
    match var(key) {
        Some(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring unparseable {}={:?}", key, raw);
            default
        }),
        None => default,
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let defaults = Config::default();

        let dev_mode = env::var("APP_ENV")
            .map(|v| v == "dev" || v == "development")
            .unwrap_or(false);

        let host = var("HOST").unwrap_or(defaults.host);
        let port: u16 = parse_or("PORT", defaults.port);
        let base_url = var("BASE_URL").unwrap_or_else(|| format!("http://{}:{}", host, port));

        let razorpay = var("RAZORPAY_WEBHOOK_SECRET").map(|webhook_secret| RazorpayConfig {
            webhook_secret,
            key_id: var("RAZORPAY_KEY_ID"),
            key_secret: var("RAZORPAY_KEY_SECRET"),
            api_base: var("RAZORPAY_API_BASE")
                .unwrap_or_else(|| "https://api.razorpay.com".to_string()),
        });

        let payu = match (var("PAYU_MERCHANT_KEY"), var("PAYU_SALT")) {
            (Some(merchant_key), Some(salt)) => Some(PayuConfig {
                merchant_key,
                salt,
                allowed_ips: var("PAYU_ALLOWED_IPS")
                    .map(|v| {
                        v.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                verify_url: var("PAYU_VERIFY_URL").unwrap_or_else(|| {
                    "https://info.payu.in/merchant/postservice.php?form=2".to_string()
                }),
                payment_url: var("PAYU_PAYMENT_URL")
                    .unwrap_or_else(|| "https://secure.payu.in/_payment".to_string()),
            }),
            _ => None,
        };

        let phonepe = match (
            var("PHONEPE_CLIENT_ID"),
            var("PHONEPE_CLIENT_SECRET"),
            var("PHONEPE_WEBHOOK_USERNAME"),
            var("PHONEPE_WEBHOOK_PASSWORD"),
        ) {
            (Some(client_id), Some(client_secret), Some(webhook_username), Some(webhook_password)) => {
                Some(PhonePeConfig {
                    client_id,
                    client_secret,
                    client_version: var("PHONEPE_CLIENT_VERSION").unwrap_or_else(|| "1".to_string()),
                    webhook_username,
                    webhook_password,
                    api_base: var("PHONEPE_API_BASE")
                        .unwrap_or_else(|| "https://api.phonepe.com/apis/pg".to_string()),
                    auth_url: var("PHONEPE_AUTH_URL").unwrap_or_else(|| {
                        "https://api.phonepe.com/apis/identity-manager/v1/oauth/token".to_string()
                    }),
                })
            }
            _ => None,
        };

        Self {
            database_path: var("DATABASE_PATH").unwrap_or(defaults.database_path),
            solution_url_template: var("SOLUTION_URL_TEMPLATE")
                .unwrap_or_else(|| format!("{}/solutions/{{solution_id}}", base_url)),
            checkout_return_url: var("CHECKOUT_RETURN_URL")
                .unwrap_or_else(|| format!("{}/payments/return/{{transaction_id}}", base_url)),
            host,
            port,
            base_url,
            dev_mode,
            internal_api_key: var("INTERNAL_API_KEY"),
            operator_api_key: var("OPERATOR_API_KEY"),
            trust_forwarded_for: parse_or("TRUST_FORWARDED_FOR", false),
            subscription_period_days: parse_or(
                "SUBSCRIPTION_PERIOD_DAYS",
                defaults.subscription_period_days,
            ),
            tax_rate_bps: parse_or("TAX_RATE_BPS", defaults.tax_rate_bps),
            default_currency: var("DEFAULT_CURRENCY")
                .map(|c| c.to_lowercase())
                .unwrap_or(defaults.default_currency),
            default_gateway: parse_or("DEFAULT_GATEWAY", defaults.default_gateway),
            quotas: QuotaConfig {
                free: parse_or("QUOTA_FREE_DAILY", defaults.quotas.free),
                registered: parse_or("QUOTA_REGISTERED_DAILY", defaults.quotas.registered),
                pro: parse_or("QUOTA_PRO_DAILY", defaults.quotas.pro),
            },
            gateway_timeout: Duration::from_secs(parse_or("GATEWAY_TIMEOUT_SECS", 10)),
            reconcile_concurrency: parse_or("RECONCILE_CONCURRENCY", defaults.reconcile_concurrency)
                .max(1),
            expiry_sweep_interval_secs: parse_or("EXPIRY_SWEEP_INTERVAL_SECS", 0),
            email_webhook_url: var("EMAIL_WEBHOOK_URL"),
            invoice_webhook_url: var("INVOICE_WEBHOOK_URL"),
            rate_limit: RateLimitConfig {
                strict_rpm: parse_or("RATE_LIMIT_STRICT_RPM", defaults.rate_limit.strict_rpm),
                standard_rpm: parse_or("RATE_LIMIT_STANDARD_RPM", defaults.rate_limit.standard_rpm),
            },
            razorpay,
            payu,
            phonepe,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn subscription_period_secs(&self) -> i64 {
        self.subscription_period_days * 86_400
    }
}
