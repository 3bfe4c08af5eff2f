use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Mutex,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    domain::ChatId,
    ports::{ChatRecord, ChatRegistry},
    Result,
};

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFileData {
    chats: Vec<ChatRecord>,
}

/// [`ChatRegistry`] kept in memory and mirrored to a JSON file on every change.
///
/// The file is a convenience for restarts, not a durable store: a failed or
/// torn write loses at most the latest changes.
pub struct JsonChatRegistry {
    path: Option<PathBuf>,
    chats: Mutex<BTreeMap<ChatId, ChatRecord>>,
}

impl JsonChatRegistry {
    /// Load from `path`; a missing or empty file starts an empty registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let chats = load_registry_file(&path)?
            .map(|data| data.chats.into_iter().map(|r| (r.id, r)).collect())
            .unwrap_or_default();
        let registry = Self {
            path: Some(path),
            chats: Mutex::new(chats),
        };
        tracing::info!(chats = registry.len(), "chat registry loaded");
        Ok(registry)
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            chats: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<ChatId, ChatRecord>> {
        self.chats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, chats: &BTreeMap<ChatId, ChatRecord>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = RegistryFileData {
            chats: chats.values().cloned().collect(),
        };
        save_registry_file(path, &data)
    }
}

#[async_trait]
impl ChatRegistry for JsonChatRegistry {
    async fn all(&self) -> Result<Vec<ChatRecord>> {
        Ok(self.lock().values().cloned().collect())
    }

    async fn get(&self, chat: ChatId) -> Result<Option<ChatRecord>> {
        Ok(self.lock().get(&chat).cloned())
    }

    async fn upsert(&self, mut record: ChatRecord) -> Result<()> {
        let mut chats = self.lock();
        if let Some(existing) = chats.get(&record.id) {
            record.registered_at = existing.registered_at;
        }
        chats.insert(record.id, record);
        self.persist(&chats)
    }

    async fn remove(&self, chat: ChatId) -> Result<bool> {
        let mut chats = self.lock();
        if chats.remove(&chat).is_none() {
            return Ok(false);
        }
        self.persist(&chats)?;
        Ok(true)
    }
}

fn load_registry_file(path: &Path) -> Result<Option<RegistryFileData>> {
    if !path.exists() {
        return Ok(None);
    }
    let txt = std::fs::read_to_string(path)?;
    if txt.trim().is_empty() {
        return Ok(None);
    }
    let data: RegistryFileData = serde_json::from_str(&txt)?;
    Ok(Some(data))
}

fn save_registry_file(path: &Path, data: &RegistryFileData) -> Result<()> {
    let txt = serde_json::to_string_pretty(data)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, txt)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
