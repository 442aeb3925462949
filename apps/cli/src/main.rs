use std::io::Write;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use chathub_core_sdk::{
    config::{self, LogConfig, ServerConfig},
    consumer::{run_turn, ChatClient, TurnOptions},
    providers::ProviderId,
    server, store, telemetry,
};

/**
 * \brief CLI 程序入口：启动中继、终端对话与本地会话管理。
 */
#[derive(Parser, Debug)]
#[command(name = "chathub", version, about = "Multi-provider chat relay")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /**
     * \brief 启动本地中继服务并提供前端页面。
     */
    Serve {
        #[arg(long)]
        addr: Option<String>,
        #[arg(long)]
        ui_dir: Option<String>,
    },

    /**
     * \brief 通过中继发送一条消息并流式显示回复。
     */
    Chat {
        #[arg(long)]
        provider: ProviderId,
        #[arg(long)]
        prompt: String,
        #[arg(long)]
        model: Option<String>,
        /** \brief 继续已有会话；缺省时新建 */
        #[arg(long)]
        chat_id: Option<String>,
        #[arg(long, env = "CHATHUB_SERVER", default_value = "http://127.0.0.1:3000")]
        server: String,
        /** \brief 覆盖本地保存的密钥 */
        #[arg(long)]
        api_key: Option<String>,
    },

    /**
     * \brief 管理本地会话记录。
     */
    Chats {
        #[command(subcommand)]
        action: ChatsAction,
    },

    /**
     * \brief 管理本地保存的 Provider 密钥。
     */
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /** \brief 列出支持的 Provider。 */
    Providers,
}

#[derive(Subcommand, Debug)]
enum ChatsAction {
    List,
    Export { id: String },
    Delete { id: String },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /** \brief 保存密钥；空串表示清除 */
    Set { provider: ProviderId, key: String },
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { addr, ui_dir } => {
            let mut config = ServerConfig::from_env();
            if let Some(addr) = addr {
                config.addr = addr;
            }
            if let Some(ui_dir) = ui_dir {
                config.ui_dir = ui_dir;
            }
            telemetry::init(&config.log);
            server::run(config).await
        }
        command => {
            config::load_dotenv();
            telemetry::init(&LogConfig::default());
            run_local(command).await
        }
    }
}

/**
 * \brief 本地命令：读写 chathub.db，按需经中继对话。
 */
async fn run_local(command: Commands) -> Result<()> {
    let conn = store::open_default_db().context("open database failed")?;
    store::migrate(&conn).context("apply migrations failed")?;

    match command {
        Commands::Serve { .. } => bail!("serve is not a local command"),
        Commands::Chat {
            provider,
            prompt,
            model,
            chat_id,
            server,
            api_key,
        } => {
            let chat = match chat_id {
                Some(id) => store::get_chat(&conn, &id)
                    .context("load chat failed")?
                    .with_context(|| format!("chat not found: {}", id))?,
                None => {
                    let model = model
                        .as_deref()
                        .unwrap_or(provider.config().default_model);
                    let chat =
                        store::create_chat(&conn, provider, model).context("create chat failed")?;
                    eprintln!("Created chat id={} (provider={})", chat.id, provider);
                    chat
                }
            };
            let model = model.unwrap_or_else(|| chat.model.clone());
            let api_key = match api_key {
                Some(key) => Some(key),
                None => store::get_api_key(&conn, provider).context("load api key failed")?,
            };

            telemetry::log_event(
                "cli.chat",
                &format!(
                    "provider={} chat_id={} prompt_len={}",
                    provider,
                    chat.id,
                    prompt.len()
                ),
            );

            let client = ChatClient::new(server);
            let options = TurnOptions {
                model: Some(model.clone()),
                api_key,
            };
            let mut printed = 0;
            let outcome = run_turn(
                &client,
                provider,
                chat.conversation(),
                &prompt,
                &options,
                |state| {
                    let text = state.in_progress_text();
                    if text.len() > printed {
                        print!("{}", &text[printed..]);
                        std::io::stdout().flush().ok();
                        printed = text.len();
                    }
                },
            )
            .await;
            println!();

            match outcome {
                Ok(conversation) => {
                    store::update_messages(&conn, &chat.id, provider, &model, &conversation)
                        .context("save chat failed")?;
                }
                Err(err) => {
                    if err.source.needs_key() {
                        eprintln!(
                            "No API key for {}. Run: chathub keys set {} <key>",
                            provider, provider
                        );
                    }
                    return Err(err).context("chat turn failed");
                }
            }
        }
        Commands::Chats { action } => match action {
            ChatsAction::List => {
                for chat in store::load_chats(&conn).context("load chats failed")? {
                    let title = if chat.title.is_empty() {
                        "New Chat"
                    } else {
                        chat.title.as_str()
                    };
                    println!(
                        "{}\t{}\t{}\t{} messages\t{}",
                        chat.id,
                        chat.provider,
                        chat.model,
                        chat.messages.len(),
                        title
                    );
                }
            }
            ChatsAction::Export { id } => {
                let json = store::export_chat(&conn, &id)
                    .context("export chat failed")?
                    .with_context(|| format!("chat not found: {}", id))?;
                println!("{}", json);
            }
            ChatsAction::Delete { id } => {
                if !store::delete_chat(&conn, &id).context("delete chat failed")? {
                    bail!("chat not found: {}", id);
                }
                println!("Deleted chat id={}", id);
            }
        },
        Commands::Keys { action } => match action {
            KeysAction::Set { provider, key } => {
                store::set_api_key(&conn, provider, &key).context("save api key failed")?;
                if key.is_empty() {
                    println!("Cleared key for {}", provider);
                } else {
                    println!("Saved key for {}", provider);
                }
            }
            KeysAction::List => {
                let keys = store::load_api_keys(&conn).context("load api keys failed")?;
                for provider in ProviderId::ALL {
                    let status = if keys.contains_key(provider.as_str()) {
                        "saved"
                    } else {
                        "-"
                    };
                    println!("{}\t{}", provider, status);
                }
            }
        },
        Commands::Providers => {
            for provider in ProviderId::ALL {
                let config = provider.config();
                println!(
                    "{}\t{}\t{}",
                    provider, config.default_model, config.credential_env
                );
            }
        }
    }

    Ok(())
}
