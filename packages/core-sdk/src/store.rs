use std::{collections::BTreeMap, path::Path, thread, time::Duration};

use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::models::{Message, Role};
use crate::providers::ProviderId;

/** \brief 会话列表所在键，与浏览器端 localStorage 一致。 */
pub const CHATS_KEY: &str = "chats";
/** \brief 各 Provider 密钥表所在键。 */
pub const API_KEYS_KEY: &str = "apiKeys";

const TITLE_CHARS: usize = 30;

/**
 * \brief 带时间戳的已存消息。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub role: Role,
    pub content: String,
    /** \brief Unix 毫秒 */
    pub timestamp: i64,
}

/**
 * \brief 会话记录。
 */
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRecord {
    pub id: String,
    /** \brief 空串表示尚未命名，首轮后取首条消息前 30 字符 */
    pub title: String,
    pub messages: Vec<StoredMessage>,
    pub provider: ProviderId,
    pub model: String,
    pub created_at: i64,
}

impl ChatRecord {
    /**
     * \brief 转换为中继所需的对话。
     */
    pub fn conversation(&self) -> Vec<Message> {
        self.messages
            .iter()
            .map(|m| Message::new(m.role, m.content.clone()))
            .collect()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatExport<'a> {
    title: &'a str,
    provider: ProviderId,
    model: &'a str,
    messages: &'a [StoredMessage],
    exported_at: String,
}

/**
 * \brief 打开默认数据库文件（本地目录下的 chathub.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    open_db("chathub.db")
}

pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

/**
 * \brief 创建键值表。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        CREATE TABLE IF NOT EXISTS local_storage (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
        )
    })
}

fn get_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    retry_on_locked(|| {
        conn.query_row(
            "SELECT value FROM local_storage WHERE key = ?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()
    })
}

fn set_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO local_storage (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

/**
 * \brief 读取全部会话，最新的在前。
 */
pub fn load_chats(conn: &Connection) -> Result<Vec<ChatRecord>> {
    match get_value(conn, CHATS_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(Vec::new()),
    }
}

pub fn save_chats(conn: &Connection, chats: &[ChatRecord]) -> Result<()> {
    set_value(conn, CHATS_KEY, &serde_json::to_string(chats)?)
}

pub fn get_chat(conn: &Connection, id: &str) -> Result<Option<ChatRecord>> {
    Ok(load_chats(conn)?.into_iter().find(|c| c.id == id))
}

/**
 * \brief 新建空会话并置于列表首位。
 */
pub fn create_chat(conn: &Connection, provider: ProviderId, model: &str) -> Result<ChatRecord> {
    let mut chats = load_chats(conn)?;
    let now = now_millis();
    let mut id = now;
    while chats.iter().any(|c| c.id == id.to_string()) {
        id += 1;
    }
    let chat = ChatRecord {
        id: id.to_string(),
        title: String::new(),
        messages: Vec::new(),
        provider,
        model: model.to_string(),
        created_at: now,
    };
    chats.insert(0, chat.clone());
    save_chats(conn, &chats)?;
    Ok(chat)
}

/**
 * \brief 删除会话，返回是否存在。
 */
pub fn delete_chat(conn: &Connection, id: &str) -> Result<bool> {
    let mut chats = load_chats(conn)?;
    let before = chats.len();
    chats.retain(|c| c.id != id);
    if chats.len() == before {
        return Ok(false);
    }
    save_chats(conn, &chats)?;
    Ok(true)
}

/**
 * \brief 以完整对话替换会话消息；已有前缀保留原时间戳，空标题按首条消息生成。
 */
pub fn update_messages(
    conn: &Connection,
    id: &str,
    provider: ProviderId,
    model: &str,
    messages: &[Message],
) -> Result<ChatRecord> {
    let mut chats = load_chats(conn)?;
    let chat = chats
        .iter_mut()
        .find(|c| c.id == id)
        .ok_or_else(|| anyhow!("chat not found: {}", id))?;

    let now = now_millis();
    let stored = messages
        .iter()
        .enumerate()
        .map(|(i, msg)| {
            let timestamp = chat
                .messages
                .get(i)
                .filter(|old| old.role == msg.role && old.content == msg.content)
                .map(|old| old.timestamp)
                .unwrap_or(now);
            StoredMessage {
                role: msg.role,
                content: msg.content.clone(),
                timestamp,
            }
        })
        .collect();
    chat.messages = stored;
    chat.provider = provider;
    chat.model = model.to_string();
    if chat.title.is_empty() {
        chat.title = derive_title(messages);
    }
    let updated = chat.clone();
    save_chats(conn, &chats)?;
    Ok(updated)
}

/**
 * \brief 取首条消息的前 30 个字符作为标题。
 */
pub fn derive_title(messages: &[Message]) -> String {
    messages
        .first()
        .map(|m| m.content.chars().take(TITLE_CHARS).collect())
        .unwrap_or_default()
}

/**
 * \brief 导出单个会话为格式化 JSON。
 */
pub fn export_chat(conn: &Connection, id: &str) -> Result<Option<String>> {
    let Some(chat) = get_chat(conn, id)? else {
        return Ok(None);
    };
    let export = ChatExport {
        title: if chat.title.is_empty() {
            "Chat Export"
        } else {
            &chat.title
        },
        provider: chat.provider,
        model: &chat.model,
        messages: &chat.messages,
        exported_at: OffsetDateTime::now_utc().format(&Rfc3339)?,
    };
    Ok(Some(serde_json::to_string_pretty(&export)?))
}

/**
 * \brief 读取本地保存的密钥表。
 */
pub fn load_api_keys(conn: &Connection) -> Result<BTreeMap<String, String>> {
    match get_value(conn, API_KEYS_KEY)? {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => Ok(BTreeMap::new()),
    }
}

pub fn get_api_key(conn: &Connection, provider: ProviderId) -> Result<Option<String>> {
    Ok(load_api_keys(conn)?
        .remove(provider.as_str())
        .filter(|k| !k.is_empty()))
}

/**
 * \brief 保存或清除（空串）某个 Provider 的密钥。
 */
pub fn set_api_key(conn: &Connection, provider: ProviderId, key: &str) -> Result<()> {
    let mut keys = load_api_keys(conn)?;
    if key.is_empty() {
        keys.remove(provider.as_str());
    } else {
        keys.insert(provider.as_str().to_string(), key.to_string());
    }
    set_value(conn, API_KEYS_KEY, &serde_json::to_string(&keys)?)
}

fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手，线性退避，最多重试 5 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}
