use std::{collections::HashMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/**
 * \brief 支持的 Provider 闭集；新增成员时所有 match 必须补全。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Gemini,
    DeepSeek,
    Groq,
}

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [ProviderId::Gemini, ProviderId::DeepSeek, ProviderId::Groq];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderId::Gemini => "gemini",
            ProviderId::DeepSeek => "deepseek",
            ProviderId::Groq => "groq",
        }
    }

    /**
     * \brief 查询静态配置表。
     */
    pub fn config(&self) -> &'static ProviderConfig {
        match self {
            ProviderId::Gemini => &GEMINI,
            ProviderId::DeepSeek => &DEEPSEEK,
            ProviderId::Groq => &GROQ,
        }
    }

    /**
     * \brief 选择上游适配器；同一 Provider 永远得到同一变体。
     */
    pub fn adapter_kind(&self) -> AdapterKind {
        match self {
            ProviderId::Gemini => AdapterKind::TurnBased,
            ProviderId::DeepSeek | ProviderId::Groq => AdapterKind::DeltaStreaming,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownProvider(pub String);

impl fmt::Display for UnknownProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown provider: {}", self.0)
    }
}

impl std::error::Error for UnknownProvider {}

impl FromStr for ProviderId {
    type Err = UnknownProvider;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gemini" => Ok(ProviderId::Gemini),
            "deepseek" => Ok(ProviderId::DeepSeek),
            "groq" => Ok(ProviderId::Groq),
            other => Err(UnknownProvider(other.to_string())),
        }
    }
}

/**
 * \brief 上游会话模型：有状态多轮会话 vs 无状态全量历史。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    TurnBased,
    DeltaStreaming,
}

/**
 * \brief Provider 静态配置，进程内只读。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    pub id: ProviderId,
    pub default_model: &'static str,
    /** \brief 回退密钥所在的环境变量名 */
    pub credential_env: &'static str,
    /** \brief 上游基地址；None 表示使用适配器内置默认值 */
    pub base_url: Option<&'static str>,
}

static GEMINI: ProviderConfig = ProviderConfig {
    id: ProviderId::Gemini,
    default_model: "gemini-1.5-flash",
    credential_env: "GEMINI_API_KEY",
    base_url: None,
};

static DEEPSEEK: ProviderConfig = ProviderConfig {
    id: ProviderId::DeepSeek,
    default_model: "deepseek-chat",
    credential_env: "DEEPSEEK_API_KEY",
    base_url: Some("https://api.deepseek.com"),
};

static GROQ: ProviderConfig = ProviderConfig {
    id: ProviderId::Groq,
    default_model: "llama-3.3-70b-versatile",
    credential_env: "GROQ_API_KEY",
    base_url: Some("https://api.groq.com/openai/v1"),
};

/**
 * \brief 服务端密钥来源；生产读取环境变量，测试可注入固定表。
 */
pub trait CredentialSource: Send + Sync {
    fn lookup(&self, env_name: &str) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialSource for EnvCredentials {
    fn lookup(&self, env_name: &str) -> Option<String> {
        std::env::var(env_name).ok().filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Default, Clone)]
pub struct StaticCredentials {
    values: HashMap<String, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, env_name: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(env_name.into(), value.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn lookup(&self, env_name: &str) -> Option<String> {
        self.values.get(env_name).cloned()
    }
}

/**
 * \brief 密钥来自何处，仅用于日志，不携带密钥本身。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialOrigin {
    Request,
    Environment,
}

impl CredentialOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialOrigin::Request => "request",
            CredentialOrigin::Environment => "environment",
        }
    }
}

/**
 * \brief 解析密钥：请求显式提供的非空值优先，否则读取服务端环境。
 */
pub fn resolve_credential(
    provider: ProviderId,
    explicit: Option<&str>,
    source: &dyn CredentialSource,
) -> Option<(String, CredentialOrigin)> {
    if let Some(key) = explicit.filter(|k| !k.is_empty()) {
        return Some((key.to_string(), CredentialOrigin::Request));
    }
    source
        .lookup(provider.config().credential_env)
        .map(|key| (key, CredentialOrigin::Environment))
}
