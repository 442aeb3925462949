use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogConfig, LogFormat};

static INITIALIZED: OnceCell<()> = OnceCell::new();

/**
 * \brief 安装全局 tracing 订阅者；重复调用无副作用。
 * \details `RUST_LOG` 优先于配置中的日志级别；输出到 stderr，stdout 留给对话内容。
 */
pub fn init(config: &LogConfig) {
    INITIALIZED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
        let registry = tracing_subscriber::registry().with(filter);
        let result = match config.format {
            LogFormat::Json => registry
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .try_init(),
            LogFormat::Pretty => registry
                .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
                .try_init(),
        };
        if let Err(err) = result {
            eprintln!("telemetry init failed: {}", err);
        }
    });
}

/**
 * \brief 记录常规事件。
 */
pub fn log_event(category: &str, message: &str) {
    tracing::info!(category, "{}", message);
}

/**
 * \brief 记录错误事件。
 */
pub fn log_error(category: &str, message: &str) {
    tracing::error!(category, "{}", message);
}
