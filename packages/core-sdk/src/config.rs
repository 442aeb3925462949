use std::collections::HashMap;

use crate::llm::adapter_default_base;
use crate::providers::ProviderId;

/**
 * \brief 日志输出格式。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

/**
 * \brief 上游地址表：配置覆盖优先，其次注册表，最后适配器默认值。
 */
#[derive(Debug, Clone, Default)]
pub struct UpstreamUrls {
    overrides: HashMap<ProviderId, String>,
}

impl UpstreamUrls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_override(mut self, provider: ProviderId, base_url: impl Into<String>) -> Self {
        self.overrides.insert(provider, base_url.into());
        self
    }

    pub fn base_url(&self, provider: ProviderId) -> String {
        if let Some(url) = self.overrides.get(&provider) {
            return url.clone();
        }
        provider
            .config()
            .base_url
            .unwrap_or_else(|| adapter_default_base(provider.adapter_kind()))
            .to_string()
    }

    /**
     * \brief 读取 `CHATHUB_<PROVIDER>_BASE_URL`。
     */
    pub fn from_env() -> Self {
        let mut urls = Self::new();
        for provider in ProviderId::ALL {
            let key = format!("CHATHUB_{}_BASE_URL", provider.as_str().to_ascii_uppercase());
            if let Ok(value) = std::env::var(&key) {
                if !value.trim().is_empty() {
                    urls = urls.with_override(provider, value.trim());
                }
            }
        }
        urls
    }
}

/**
 * \brief 服务端配置；`.env` 中的值会先被加载到进程环境。
 */
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /** \brief 监听地址，如 "127.0.0.1:3000" */
    pub addr: String,
    /** \brief 静态前端目录 */
    pub ui_dir: String,
    pub log: LogConfig,
    pub upstreams: UpstreamUrls,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
            ui_dir: "web".to_string(),
            log: LogConfig::default(),
            upstreams: UpstreamUrls::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        load_dotenv();
        let defaults = Self::default();
        Self {
            addr: std::env::var("CHATHUB_ADDR").unwrap_or(defaults.addr),
            ui_dir: std::env::var("CHATHUB_UI_DIR").unwrap_or(defaults.ui_dir),
            log: LogConfig {
                level: std::env::var("CHATHUB_LOG_LEVEL").unwrap_or(defaults.log.level),
                format: std::env::var("CHATHUB_LOG_FORMAT")
                    .map(|v| LogFormat::parse(&v))
                    .unwrap_or_default(),
            },
            upstreams: UpstreamUrls::from_env(),
        }
    }
}

/**
 * \brief 加载当前目录的 `.env`，文件不存在时忽略。
 */
pub fn load_dotenv() {
    if let Err(err) = dotenvy::dotenv() {
        if !err.not_found() {
            eprintln!("failed to load .env: {}", err);
        }
    }
}
