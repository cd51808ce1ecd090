use crate::error::AppError;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

pub const SANDBOX_BASE_URL: &str = "https://sandbox.safaricom.co.ke";
pub const PRODUCTION_BASE_URL: &str = "https://api.safaricom.co.ke";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const MIN_TIMEOUT_SECS: u64 = 10;
const MAX_TIMEOUT_SECS: u64 = 60;
const DEFAULT_TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;
/// Half the lifetime of a Daraja access token
pub const MAX_TOKEN_EXPIRY_MARGIN_SECS: u64 = 1800;
const DEFAULT_ACCOUNT_REFERENCE: &str = "CHURCH";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpesaEnvironment {
    Sandbox,
    Production,
}

impl MpesaEnvironment {
    pub fn base_url(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => SANDBOX_BASE_URL,
            MpesaEnvironment::Production => PRODUCTION_BASE_URL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MpesaEnvironment::Sandbox => "sandbox",
            MpesaEnvironment::Production => "production",
        }
    }
}

impl FromStr for MpesaEnvironment {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sandbox" => Ok(MpesaEnvironment::Sandbox),
            "production" | "live" => Ok(MpesaEnvironment::Production),
            other => Err(AppError::configuration(format!(
                "MPESA_ENVIRONMENT must be 'sandbox' or 'production', got '{}'",
                other
            ))),
        }
    }
}

/// M-Pesa (Daraja) provider configuration
#[derive(Clone)]
pub struct MpesaConfig {
    pub environment: MpesaEnvironment,
    /// Overrides the environment's base URL when set (used by tests and proxies)
    pub base_url: String,
    pub consumer_key: String,
    pub consumer_secret: String,
    /// Paybill number, also the receiving party
    pub shortcode: String,
    pub passkey: String,
    pub callback_url: String,
    /// Secret path segment expected on inbound callbacks
    pub callback_secret: Option<String>,
    pub callback_allowed_ips: Vec<IpAddr>,
    pub timeout_secs: u64,
    pub token_expiry_margin_secs: u64,
    /// Used when the payment purpose has no usable characters
    pub account_reference: String,
}

impl fmt::Debug for MpesaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MpesaConfig")
            .field("environment", &self.environment)
            .field("base_url", &self.base_url)
            .field("consumer_key", &self.consumer_key)
            .field("consumer_secret", &"<redacted>")
            .field("shortcode", &self.shortcode)
            .field("passkey", &"<redacted>")
            .field("callback_url", &self.callback_url)
            .field(
                "callback_secret",
                &self.callback_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("callback_allowed_ips", &self.callback_allowed_ips)
            .field("timeout_secs", &self.timeout_secs)
            .field("token_expiry_margin_secs", &self.token_expiry_margin_secs)
            .field("account_reference", &self.account_reference)
            .finish()
    }
}

impl Default for MpesaConfig {
    fn default() -> Self {
        Self {
            environment: MpesaEnvironment::Sandbox,
            base_url: SANDBOX_BASE_URL.to_string(),
            consumer_key: String::new(),
            consumer_secret: String::new(),
            shortcode: String::new(),
            passkey: String::new(),
            callback_url: String::new(),
            callback_secret: None,
            callback_allowed_ips: Vec::new(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            token_expiry_margin_secs: DEFAULT_TOKEN_EXPIRY_MARGIN_SECS,
            account_reference: DEFAULT_ACCOUNT_REFERENCE.to_string(),
        }
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match optional_var(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| AppError::configuration(format!("{} has an invalid value '{}'", name, raw))),
        None => Ok(default),
    }
}

pub(crate) fn parse_ip_list(raw: &str) -> Result<Vec<IpAddr>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>().map_err(|_| {
                AppError::configuration(format!(
                    "MPESA_CALLBACK_ALLOWED_IPS contains an invalid address '{}'",
                    s
                ))
            })
        })
        .collect()
}

impl MpesaConfig {
    /// Create config from environment variables
    pub fn from_env() -> Result<Self, AppError> {
        let environment = match optional_var("MPESA_ENVIRONMENT") {
            Some(raw) => raw.parse()?,
            None => MpesaEnvironment::Sandbox,
        };

        let base_url = optional_var("MPESA_BASE_URL")
            .unwrap_or_else(|| environment.base_url().to_string());

        let callback_allowed_ips = match optional_var("MPESA_CALLBACK_ALLOWED_IPS") {
            Some(raw) => parse_ip_list(&raw)?,
            None => Vec::new(),
        };

        let timeout_secs = parse_var("MPESA_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?
            .clamp(MIN_TIMEOUT_SECS, MAX_TIMEOUT_SECS);

        let config = Self {
            environment,
            base_url,
            consumer_key: optional_var("MPESA_CONSUMER_KEY").unwrap_or_default(),
            consumer_secret: optional_var("MPESA_CONSUMER_SECRET").unwrap_or_default(),
            shortcode: optional_var("MPESA_SHORTCODE").unwrap_or_default(),
            passkey: optional_var("MPESA_PASSKEY").unwrap_or_default(),
            callback_url: optional_var("MPESA_CALLBACK_URL").unwrap_or_default(),
            callback_secret: optional_var("MPESA_CALLBACK_SECRET"),
            callback_allowed_ips,
            timeout_secs,
            token_expiry_margin_secs: parse_var(
                "MPESA_TOKEN_EXPIRY_MARGIN_SECS",
                DEFAULT_TOKEN_EXPIRY_MARGIN_SECS,
            )?,
            account_reference: optional_var("MPESA_ACCOUNT_REFERENCE")
                .unwrap_or_else(|| DEFAULT_ACCOUNT_REFERENCE.to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject missing or placeholder values before anything reaches the provider.
    pub fn validate(&self) -> Result<(), AppError> {
        let required = [
            ("MPESA_BASE_URL", &self.base_url),
            ("MPESA_CONSUMER_KEY", &self.consumer_key),
            ("MPESA_CONSUMER_SECRET", &self.consumer_secret),
            ("MPESA_SHORTCODE", &self.shortcode),
            ("MPESA_PASSKEY", &self.passkey),
            ("MPESA_CALLBACK_URL", &self.callback_url),
        ];

        let missing: Vec<&str> = required
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();

        if !missing.is_empty() {
            return Err(AppError::configuration(format!(
                "Missing M-Pesa configuration: {}",
                missing.join(", ")
            )));
        }

        if self.token_expiry_margin_secs > MAX_TOKEN_EXPIRY_MARGIN_SECS {
            return Err(AppError::configuration(format!(
                "MPESA_TOKEN_EXPIRY_MARGIN_SECS must be at most {}, got {}",
                MAX_TOKEN_EXPIRY_MARGIN_SECS, self.token_expiry_margin_secs
            )));
        }

        if !self.shortcode.chars().all(|c| c.is_ascii_digit()) {
            return Err(AppError::configuration("MPESA_SHORTCODE must be numeric"));
        }

        let callback_ok = match self.environment {
            MpesaEnvironment::Production => self.callback_url.starts_with("https://"),
            MpesaEnvironment::Sandbox => {
                self.callback_url.starts_with("https://")
                    || self.callback_url.starts_with("http://")
            }
        };
        if !callback_ok {
            return Err(AppError::configuration(format!(
                "MPESA_CALLBACK_URL must be an absolute {} URL",
                match self.environment {
                    MpesaEnvironment::Production => "https",
                    MpesaEnvironment::Sandbox => "http(s)",
                }
            )));
        }

        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.validate().is_ok()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}
