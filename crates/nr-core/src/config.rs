//! Configuration management
//!
//! 設定は以下の優先順位で読み込まれます:
//! 1. 環境変数
//! 2. notify-relay.toml 設定ファイル (`NOTIFY_RELAY_CONFIG` でパス指定可)
//! 3. デフォルト値
//!
//! 設定ファイル内では `${VAR_NAME}` 形式で環境変数を展開できます。

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::Error;

/// Main configuration for notify-relay
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP relay configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Messaging session configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Recipient policy
    #[serde(default)]
    pub recipients: RecipientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address the relay binds to
    #[serde(default = "default_api_host")]
    pub host: String,

    /// Port for the relay HTTP server
    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer key required on dispatch requests (disabled when unset)
    pub key: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base URL of the session bridge daemon
    #[serde(default = "default_bridge_url")]
    pub bridge_url: String,

    /// Bearer token presented to the bridge
    pub bridge_token: Option<String>,

    /// Domain suffix of the transport's canonical recipient form
    #[serde(default = "default_recipient_suffix")]
    pub recipient_suffix: String,

    /// Upper bound for a single send
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,

    /// How many times to try starting the handshake
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,

    /// Delay between handshake start attempts
    #[serde(default = "default_init_retry_delay_secs")]
    pub init_retry_delay_secs: u64,

    /// Exit the process once every initialization attempt has failed
    #[serde(default = "default_exit_on_init_failure")]
    pub exit_on_init_failure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            bridge_url: default_bridge_url(),
            bridge_token: None,
            recipient_suffix: default_recipient_suffix(),
            send_timeout_secs: default_send_timeout_secs(),
            init_attempts: default_init_attempts(),
            init_retry_delay_secs: default_init_retry_delay_secs(),
            exit_on_init_failure: default_exit_on_init_failure(),
        }
    }
}

impl SessionConfig {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_secs)
    }

    pub fn init_retry_delay(&self) -> Duration {
        Duration::from_secs(self.init_retry_delay_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipientConfig {
    /// Allowed recipients; empty means any recipient is accepted
    #[serde(default)]
    pub allowed: Vec<String>,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    3000
}

fn default_bridge_url() -> String {
    "http://127.0.0.1:3100".to_string()
}

fn default_recipient_suffix() -> String {
    "@c.us".to_string()
}

fn default_send_timeout_secs() -> u64 {
    30
}

fn default_init_attempts() -> u32 {
    3
}

fn default_init_retry_delay_secs() -> u64 {
    5
}

fn default_exit_on_init_failure() -> bool {
    true
}

/// カンマ区切りの文字列をリストに変換
fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    /// 設定ファイルから環境変数を展開する
    ///
    /// `${VAR_NAME}` 形式の文字列を環境変数の値に置換します。
    /// 環境変数が存在しない場合は空文字列になります。
    fn expand_env_vars(value: &str) -> String {
        let mut result = String::new();
        let mut chars = value.chars().peekable();

        while let Some(c) = chars.next() {
            if c == '$' && chars.peek() == Some(&'{') {
                chars.next(); // '{' を消費

                let mut var_name = String::new();
                for c in chars.by_ref() {
                    if c == '}' {
                        break;
                    }
                    var_name.push(c);
                }

                if let Ok(env_value) = std::env::var(&var_name) {
                    result.push_str(&env_value);
                }
            } else {
                result.push(c);
            }
        }

        result
    }

    /// TOML 設定ファイルから設定を読み込む
    ///
    /// 設定ファイル内の `${VAR_NAME}` は環境変数の値に置換され、
    /// その後で環境変数による上書きが適用されます。
    /// 検証は上書き後の値に対して行います。
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        Self::from_toml_file_with(path, |key| std::env::var(key).ok())
    }

    /// 上書き値の取得元を指定して設定ファイルを読み込む
    fn from_toml_file_with<P, F>(path: P, lookup: F) -> crate::Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();

        let toml_content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let mut cfg = Self::parse_toml(&toml_content)?;
        cfg.apply_overrides(lookup);
        cfg.validate()?;

        Ok(cfg)
    }

    /// TOML 文字列をパースして検証する
    fn from_toml_str(content: &str) -> crate::Result<Self> {
        let config = Self::parse_toml(content)?;
        config.validate()?;
        Ok(config)
    }

    /// TOML 文字列をパース (環境変数の展開込み、検証なし)
    fn parse_toml(content: &str) -> crate::Result<Self> {
        let expanded_content = Self::expand_env_vars(content);

        toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// 以下の順序で設定ファイルを探します:
    /// 1. `NOTIFY_RELAY_CONFIG` が指すファイル
    /// 2. `./notify-relay.toml`
    /// 3. 見つからない場合は環境変数のみ
    pub fn load() -> crate::Result<Self> {
        if let Ok(path) = std::env::var("NOTIFY_RELAY_CONFIG") {
            if !path.is_empty() {
                return Self::from_toml_file(path);
            }
        }

        if Path::new("notify-relay.toml").exists() {
            return Self::from_toml_file("notify-relay.toml");
        }

        Self::from_env()
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> crate::Result<Self> {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// 環境変数で設定を上書きする
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// `lookup` が返す値で設定を上書きする
    fn apply_overrides<F: Fn(&str) -> Option<String>>(&mut self, lookup: F) {
        // API 設定の上書き
        if let Some(host) = lookup("API_HOST") {
            if !host.is_empty() {
                self.api.host = host;
            }
        }
        if let Some(port) = lookup("API_PORT") {
            if let Ok(p) = port.parse() {
                self.api.port = p;
            }
        }
        if let Some(key) = lookup("API_KEY") {
            if !key.is_empty() {
                self.api.key = Some(key);
            }
        }

        // セッション設定の上書き
        if let Some(url) = lookup("BRIDGE_URL") {
            if !url.is_empty() {
                self.session.bridge_url = url;
            }
        }
        if let Some(token) = lookup("BRIDGE_TOKEN") {
            if !token.is_empty() {
                self.session.bridge_token = Some(token);
            }
        }
        if let Some(suffix) = lookup("RECIPIENT_SUFFIX") {
            if !suffix.is_empty() {
                self.session.recipient_suffix = suffix;
            }
        }
        if let Some(secs) = lookup("SEND_TIMEOUT_SECS") {
            if let Ok(s) = secs.parse() {
                self.session.send_timeout_secs = s;
            }
        }
        if let Some(attempts) = lookup("INIT_ATTEMPTS") {
            if let Ok(n) = attempts.parse() {
                self.session.init_attempts = n;
            }
        }
        if let Some(secs) = lookup("INIT_RETRY_DELAY_SECS") {
            if let Ok(s) = secs.parse() {
                self.session.init_retry_delay_secs = s;
            }
        }
        if let Some(exit) = lookup("EXIT_ON_INIT_FAILURE") {
            self.session.exit_on_init_failure = exit.to_lowercase() != "false";
        }

        // 宛先制限の上書き
        if let Some(allowed) = lookup("ALLOWED_RECIPIENTS") {
            self.recipients.allowed = split_list(&allowed);
        }
    }

    /// 値の整合性チェック
    fn validate(&self) -> crate::Result<()> {
        if !self.session.recipient_suffix.starts_with('@') {
            return Err(Error::Config(format!(
                "recipient_suffix must start with '@': {}",
                self.session.recipient_suffix
            )));
        }
        if self.session.send_timeout_secs == 0 {
            return Err(Error::Config("send_timeout_secs must be positive".to_string()));
        }
        if self.session.init_attempts == 0 {
            return Err(Error::Config("init_attempts must be at least 1".to_string()));
        }
        Ok(())
    }
}
