use std::{env, fs, path::Path, path::PathBuf, time::Duration};

use crate::{errors::Error, Result};

pub const DEFAULT_API_URL: &str = "https://api.deepseek.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Telegram rejects messages longer than this.
pub const TELEGRAM_MESSAGE_LIMIT: usize = 4096;

/// Typed configuration for the relay.
#[derive(Clone, Debug)]
pub struct Config {
    // Credentials
    pub telegram_bot_token: String,
    pub deepseek_api_key: String,

    // Completion backend
    pub deepseek_api_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,

    // Rate limiting
    pub rate_limit_enabled: bool,
    pub rate_limit_requests: u32,
    pub rate_limit_window: Duration,

    // Conversation + message limits
    pub max_history: usize,
    pub max_message_length: usize,
    pub max_input_length: usize,
    pub context_char_budget: usize,

    // Access
    pub allowed_users: Vec<i64>,
    pub access_passcode: Option<String>,

    // Audit
    pub audit_log_path: PathBuf,
    pub audit_log_json: bool,
}

impl Config {
    /// Load from `.env` (if present) and the process environment.
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).and_then(non_empty);

        // Required credentials: refuse to start degraded.
        let telegram_bot_token = get("TELEGRAM_BOT_TOKEN").ok_or_else(|| {
            Error::Config("TELEGRAM_BOT_TOKEN environment variable is required".to_string())
        })?;
        let deepseek_api_key = get("DEEPSEEK_API_KEY").ok_or_else(|| {
            Error::Config("DEEPSEEK_API_KEY environment variable is required".to_string())
        })?;

        let deepseek_api_url =
            get("DEEPSEEK_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let model = get("DEEPSEEK_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let temperature = parse::<f32>(get("TEMPERATURE"))
            .filter(|t| (0.0..=2.0).contains(t))
            .unwrap_or(0.3);
        let max_tokens = parse::<u32>(get("MAX_TOKENS")).unwrap_or(1200);

        let request_timeout = Duration::from_secs(parse(get("REQUEST_TIMEOUT")).unwrap_or(30));
        let max_retries = parse::<u32>(get("MAX_RETRIES")).unwrap_or(3);
        let retry_base_delay =
            Duration::from_millis(parse(get("RETRY_BASE_DELAY_MS")).unwrap_or(500));
        let retry_max_delay =
            Duration::from_millis(parse(get("RETRY_MAX_DELAY_MS")).unwrap_or(8000));

        let rate_limit_enabled = parse_bool(get("RATE_LIMIT_ENABLED")).unwrap_or(true);
        let rate_limit_requests = parse::<u32>(get("RATE_LIMIT_REQUESTS")).unwrap_or(20);
        let rate_limit_window = Duration::from_secs(parse(get("RATE_LIMIT_WINDOW")).unwrap_or(60));

        let max_history = parse::<usize>(get("MAX_CONVERSATION_HISTORY"))
            .unwrap_or(16)
            .max(1);
        let max_message_length = parse::<usize>(get("MAX_MESSAGE_LENGTH"))
            .unwrap_or(4000)
            .clamp(1, TELEGRAM_MESSAGE_LIMIT);
        let max_input_length = parse::<usize>(get("MAX_INPUT_LENGTH"))
            .unwrap_or(4000)
            .max(1);
        let context_char_budget = parse::<usize>(get("CONTEXT_CHAR_BUDGET")).unwrap_or(24_000);

        let allowed_users = parse_csv_i64(get("TELEGRAM_ALLOWED_USERS"));
        let access_passcode = get("ACCESS_PASSCODE").map(|s| s.trim().to_string());

        let audit_log_path = PathBuf::from(
            get("AUDIT_LOG_PATH").unwrap_or_else(|| "/tmp/relay-audit.log".to_string()),
        );
        let audit_log_json = parse_bool(get("AUDIT_LOG_JSON")).unwrap_or(false);

        Ok(Self {
            telegram_bot_token,
            deepseek_api_key,
            deepseek_api_url,
            model,
            temperature,
            max_tokens,
            request_timeout,
            max_retries,
            retry_base_delay,
            retry_max_delay,
            rate_limit_enabled,
            rate_limit_requests,
            rate_limit_window,
            max_history,
            max_message_length,
            max_input_length,
            context_char_budget,
            allowed_users,
            access_passcode,
            audit_log_path,
            audit_log_json,
        })
    }
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };
        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }
        out.push((key.to_string(), val));
    }
    out
}

fn parse<T: std::str::FromStr>(v: Option<String>) -> Option<T> {
    v.and_then(|s| s.trim().parse::<T>().ok())
}

fn parse_bool(v: Option<String>) -> Option<bool> {
    v.map(|s| {
        matches!(
            s.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
