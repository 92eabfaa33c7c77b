use crate::error::{Error, Result};
use dotenvy::dotenv;
use std::env;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_address: String,
    pub database_url: String,
    pub sms_webhook_secret: String,
    pub twilio_account_sid: String,
    pub twilio_auth_token: String,
    pub whatsapp_access_token: String,
    pub whatsapp_phone_number_id: String,
    pub whatsapp_verify_token: String,
    pub whatsapp_app_secret: String,
    pub platform_webhook_secret: String,
    pub openai_api_key: String,
    pub openai_model: String,
    pub merchant_tools_url: String,
    pub webhook_rps: u32,
    pub integration_rps: u32,
    pub model_timeout_secs: u64,
    pub tool_timeout_secs: u64,
    pub send_retry_backoff_ms: u64,
}

pub static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_address: get_env("SERVER_ADDRESS")?,
            database_url: get_env("DATABASE_URL")?,
            sms_webhook_secret: get_env("SMS_WEBHOOK_SECRET")?,
            twilio_account_sid: get_env("TWILIO_ACCOUNT_SID")?,
            twilio_auth_token: get_env("TWILIO_AUTH_TOKEN")?,
            whatsapp_access_token: get_env("WHATSAPP_ACCESS_TOKEN")?,
            whatsapp_phone_number_id: get_env("WHATSAPP_PHONE_NUMBER_ID")?,
            whatsapp_verify_token: get_env("WHATSAPP_VERIFY_TOKEN")?,
            whatsapp_app_secret: get_env("WHATSAPP_APP_SECRET")?,
            platform_webhook_secret: get_env("PLATFORM_WEBHOOK_SECRET")?,
            openai_api_key: get_env("OPENAI_API_KEY")?,
            openai_model: get_env_or("OPENAI_MODEL", "gpt-4o"),
            merchant_tools_url: get_env("MERCHANT_TOOLS_URL")?,
            webhook_rps: get_env_parse("WEBHOOK_RPS")?,
            integration_rps: get_env_parse("INTEGRATION_RPS")?,
            model_timeout_secs: get_env_parse_or("MODEL_TIMEOUT_SECS", 20),
            tool_timeout_secs: get_env_parse_or("TOOL_TIMEOUT_SECS", 10),
            send_retry_backoff_ms: get_env_parse_or("SEND_RETRY_BACKOFF_MS", 500),
        })
    }
}

fn get_env(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::Config(format!("Missing environment variable: {}", name)))
}

fn get_env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn get_env_parse<T>(name: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = get_env(name)?;
    raw.parse()
        .map_err(|e| Error::Config(format!("Invalid value for {}: {}", name, e)))
}

fn get_env_parse_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

pub fn init_config() -> Result<()> {
    let config = Config::from_env()?;
    CONFIG
        .set(config)
        .map_err(|_| Error::Config("Configuration has already been initialized".to_string()))?;
    Ok(())
}

pub fn get_config() -> &'static Config {
    CONFIG
        .get()
        .expect("Configuration has not been initialized")
}
