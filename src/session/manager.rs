use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use tokio::fs;
use tokio::sync::Mutex;

use super::types::{Session, TurnRecord};

const MAX_CACHED_SESSIONS: usize = 64;

fn safe_filename(owner_key: &str) -> String {
    owner_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

/// Append-only JSONL per ownerKey. A write lock per key enforces the
/// single-writer-per-file discipline (§5); reads take a cached
/// snapshot rather than re-parsing the file on every call.
pub struct SessionManager {
    sessions_dir: PathBuf,
    cache: Mutex<LruCache<String, Session>>,
    write_locks: Mutex<std::collections::HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(sessions_dir: PathBuf) -> Self {
        Self {
            sessions_dir,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(MAX_CACHED_SESSIONS).expect("nonzero"),
            )),
            write_locks: Mutex::new(std::collections::HashMap::new()),
        }
    }

    fn path_for(&self, owner_key: &str) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", safe_filename(owner_key)))
    }

    async fn lock_for(&self, owner_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(owner_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn load(&self, owner_key: &str) -> crate::errors::Result<Session> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(session) = cache.get(owner_key) {
                return Ok(session.clone());
            }
        }

        let path = self.path_for(owner_key);
        let session = if path.exists() {
            let content = fs::read_to_string(&path)
                .await
                .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;
            let mut records = Vec::new();
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let record: TurnRecord = serde_json::from_str(line)
                    .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;
                records.push(record);
            }
            Session { owner_key: owner_key.to_string(), records }
        } else {
            Session::new(owner_key)
        };

        let mut cache = self.cache.lock().await;
        cache.put(owner_key.to_string(), session.clone());
        Ok(session)
    }

    /// Appends one record to the file and to the cached snapshot.
    pub async fn append(&self, owner_key: &str, record: TurnRecord) -> crate::errors::Result<()> {
        let lock = self.lock_for(owner_key).await;
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.sessions_dir)
            .await
            .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;

        let record = record.for_persistence();
        let line = serde_json::to_string(&record).map_err(|e| crate::errors::ConductorError::Other(e.into()))?;

        let path = self.path_for(owner_key);
        use tokio::io::AsyncWriteExt;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;

        let mut cache = self.cache.lock().await;
        if let Some(session) = cache.get_mut(owner_key) {
            session.records.push(record);
        } else {
            let mut session = Session::new(owner_key);
            session.records.push(record);
            cache.put(owner_key.to_string(), session);
        }
        Ok(())
    }

    /// The one exception to append-only: memory consolidation rewrites
    /// the file keeping only the most recent `records`.
    pub async fn rewrite_keeping_recent(&self, owner_key: &str, records: Vec<TurnRecord>) -> crate::errors::Result<()> {
        let lock = self.lock_for(owner_key).await;
        let _guard = lock.lock().await;

        fs::create_dir_all(&self.sessions_dir)
            .await
            .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;

        let mut content = String::new();
        for record in &records {
            let line = serde_json::to_string(record).map_err(|e| crate::errors::ConductorError::Other(e.into()))?;
            content.push_str(&line);
            content.push('\n');
        }

        let path = self.path_for(owner_key);
        atomic_write(&path, &content)
            .await
            .map_err(|e| crate::errors::ConductorError::Other(e.into()))?;

        let mut cache = self.cache.lock().await;
        cache.put(owner_key.to_string(), Session { owner_key: owner_key.to_string(), records });
        Ok(())
    }
}

/// Writes via a temp file + rename so a crash mid-write never leaves a
/// half-written session file.
async fn atomic_write(path: &Path, content: &str) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).await?;
    fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_record(content: &str, at_ms: i64) -> TurnRecord {
        TurnRecord::User {
            content: content.to_string(),
            media_attachments: vec![],
            at_ms,
        }
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        manager.append("cli:u1", user_record("hi", 1)).await.unwrap();
        manager.append("cli:u1", user_record("again", 2)).await.unwrap();

        let session = manager.load("cli:u1").await.unwrap();
        assert_eq!(session.records.len(), 2);
    }

    #[tokio::test]
    async fn cache_is_used_on_second_load() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        manager.append("cli:u1", user_record("hi", 1)).await.unwrap();
        let first = manager.load("cli:u1").await.unwrap();
        let second = manager.load("cli:u1").await.unwrap();
        assert_eq!(first.records.len(), second.records.len());
    }

    #[tokio::test]
    async fn rewrite_keeping_recent_truncates_history() {
        let dir = tempfile::tempdir().unwrap();
        let manager = SessionManager::new(dir.path().to_path_buf());
        for i in 0..5 {
            manager.append("cli:u1", user_record(&format!("msg{i}"), i)).await.unwrap();
        }
        manager
            .rewrite_keeping_recent("cli:u1", vec![user_record("summary", 99)])
            .await
            .unwrap();
        let session = manager.load("cli:u1").await.unwrap();
        assert_eq!(session.records.len(), 1);
    }

    #[test]
    fn safe_filename_escapes_colon() {
        assert_eq!(safe_filename("cli:u1"), "cli_u1");
    }
}
