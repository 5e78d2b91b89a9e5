pub mod expr;
pub mod types;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::{InboundMessage, MessageBus};
use crate::errors::{ConductorError, Result};
use crate::tools::CronBackend;
use types::{CronJob, CronSchedule};

const TICK_INTERVAL_MS: u64 = 1000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// On-disk shape at the path in `SchedulerConfig::store_path` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CronStoreFile {
    jobs: Vec<CronJob>,
}

fn compute_next_fire(schedule: &CronSchedule, now_ms: i64) -> Option<i64> {
    match schedule {
        CronSchedule::Every { ms } => (*ms > 0).then(|| now_ms + ms),
        CronSchedule::At { ms } => (*ms > now_ms).then_some(*ms),
        CronSchedule::Cron { expr } => expr::next_fire_after(expr, now_ms),
    }
}

/// All `CronJob`s held in memory, persisted to a single JSON file on
/// every mutation (§4.10), driving a ≤1s-resolution tick loop that
/// publishes synthetic `InboundMessage`s onto the bus.
pub struct Scheduler {
    store_path: PathBuf,
    jobs: Mutex<Vec<CronJob>>,
    bus: Arc<MessageBus>,
    running: AtomicBool,
}

impl Scheduler {
    /// Loads jobs from `store_path` (if present), recomputes stale
    /// `next_fire_at_ms` values, and persists the result. Does not
    /// start the tick loop — call [`Scheduler::start`] for that.
    pub async fn load(store_path: PathBuf, bus: Arc<MessageBus>) -> Result<Arc<Self>> {
        let jobs = if store_path.exists() {
            let content = tokio::fs::read_to_string(&store_path)
                .await
                .map_err(|e| ConductorError::Other(e.into()))?;
            let file: CronStoreFile =
                serde_json::from_str(&content).map_err(|e| ConductorError::Other(e.into()))?;
            file.jobs
        } else {
            Vec::new()
        };

        let scheduler = Arc::new(Self {
            store_path,
            jobs: Mutex::new(jobs),
            bus,
            running: AtomicBool::new(false),
        });

        {
            let now = now_ms();
            let mut jobs = scheduler.jobs.lock().await;
            for job in jobs.iter_mut() {
                if job.enabled && job.next_fire_at_ms < now {
                    job.next_fire_at_ms = compute_next_fire(&job.schedule, now).unwrap_or(now);
                }
            }
        }
        scheduler.persist().await?;
        Ok(scheduler)
    }

    async fn persist(&self) -> Result<()> {
        let serialized = {
            let jobs = self.jobs.lock().await;
            let file = CronStoreFile { jobs: jobs.clone() };
            serde_json::to_string_pretty(&file).map_err(|e| ConductorError::Other(e.into()))?
        };
        atomic_write_locked_down(&self.store_path, &serialized).await
    }

    /// Spawns the tick loop as a background task. Returns immediately.
    pub fn start(self: &Arc<Self>) {
        self.running.store(true, Ordering::SeqCst);
        let scheduler = self.clone();
        tokio::spawn(async move {
            info!("scheduler tick loop started");
            while scheduler.running.load(Ordering::SeqCst) {
                if let Err(e) = scheduler.tick().await {
                    error!("scheduler tick failed: {}", e);
                }
                tokio::time::sleep(Duration::from_millis(TICK_INTERVAL_MS)).await;
            }
            info!("scheduler tick loop stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn tick(&self) -> Result<()> {
        let now = now_ms();
        let mut to_fire = Vec::new();
        let mut dirty = false;

        {
            let mut jobs = self.jobs.lock().await;
            let mut fired_ids = Vec::new();
            for job in jobs.iter_mut() {
                if !job.enabled || job.next_fire_at_ms > now {
                    continue;
                }
                to_fire.push(job.clone());
                fired_ids.push(job.id.clone());
                job.last_fire_at_ms = Some(now);
                dirty = true;

                if job.delete_after_run {
                    continue; // removed below; no need to advance
                }
                match compute_next_fire(&job.schedule, now) {
                    Some(next) => job.next_fire_at_ms = next,
                    None => job.enabled = false,
                }
            }
            if !fired_ids.is_empty() {
                jobs.retain(|j| !(fired_ids.contains(&j.id) && j.delete_after_run));
            }
        }

        if dirty {
            self.persist().await?;
        }

        for job in to_fire {
            self.publish_job(&job);
        }
        Ok(())
    }

    fn publish_job(&self, job: &CronJob) {
        let chat_id = job
            .owner
            .as_deref()
            .and_then(|o| o.split_once(':'))
            .map(|(_, chat)| chat.to_string())
            .unwrap_or_else(|| job.id.clone());

        if let CronSchedule::Every { ms } = &job.schedule {
            debug!(
                "cron job '{}' fired; repeats every {}",
                job.name,
                humantime::format_duration(Duration::from_millis((*ms).max(0) as u64))
            );
        } else {
            info!("cron job '{}' ({}) fired", job.name, job.id);
        }

        self.bus.publish_inbound(InboundMessage {
            channel: "system".to_string(),
            chat_id,
            sender_id: format!("cron:{}", job.id),
            content: job.payload.prompt.clone(),
            media_attachments: vec![],
            received_at_ms: now_ms(),
        });
    }

    /// Fires `id` immediately regardless of its schedule. `force`
    /// bypasses the enabled check; without it a disabled job errors.
    pub async fn run_now(&self, id: &str, force: bool) -> Result<()> {
        let job = {
            let jobs = self.jobs.lock().await;
            jobs.iter().find(|j| j.id == id).cloned()
        };
        let Some(job) = job else {
            return Err(ConductorError::validation(format!("no such job: {id}")));
        };
        if !job.enabled && !force {
            return Err(ConductorError::validation(
                "job is disabled; pass --force to run it anyway",
            ));
        }
        self.publish_job(&job);
        Ok(())
    }

    // --- Unrestricted CLI-side operations (§4.10: "CLI-side operations
    // have no owner restriction"). ---

    pub async fn list_all(&self) -> Vec<CronJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn show_any(&self, id: &str) -> Option<CronJob> {
        self.jobs.lock().await.iter().find(|j| j.id == id).cloned()
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let Some(job) = jobs.iter_mut().find(|j| j.id == id) else {
            return Err(ConductorError::validation(format!("no such job: {id}")));
        };
        job.enabled = enabled;
        drop(jobs);
        self.persist().await
    }

    pub async fn remove_any(&self, id: &str) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| j.id != id);
        if jobs.len() == before {
            return Err(ConductorError::validation(format!("no such job: {id}")));
        }
        drop(jobs);
        self.persist().await
    }

    pub async fn clear_all(&self) -> Result<()> {
        self.jobs.lock().await.clear();
        self.persist().await
    }
}

#[async_trait]
impl CronBackend for Scheduler {
    async fn add(&self, owner: Option<String>, mut job: CronJob) -> std::result::Result<CronJob, String> {
        job.owner = owner;
        job.next_fire_at_ms = compute_next_fire(&job.schedule, now_ms()).unwrap_or(job.next_fire_at_ms);
        {
            let mut jobs = self.jobs.lock().await;
            jobs.push(job.clone());
        }
        self.persist().await.map_err(|e| e.to_string())?;
        Ok(job)
    }

    async fn list(&self, owner: Option<&str>) -> Vec<CronJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.owner.as_deref() == owner)
            .cloned()
            .collect()
    }

    async fn show(&self, owner: Option<&str>, id: &str) -> Option<CronJob> {
        self.jobs
            .lock()
            .await
            .iter()
            .find(|j| j.id == id && j.owner.as_deref() == owner)
            .cloned()
    }

    async fn update(
        &self,
        owner: Option<&str>,
        id: &str,
        mut job: CronJob,
    ) -> std::result::Result<CronJob, String> {
        let mut jobs = self.jobs.lock().await;
        let Some(existing) = jobs.iter_mut().find(|j| j.id == id && j.owner.as_deref() == owner)
        else {
            return Err(format!("No such job: {id}"));
        };
        job.owner = owner.map(String::from);
        job.next_fire_at_ms = compute_next_fire(&job.schedule, now_ms()).unwrap_or(existing.next_fire_at_ms);
        *existing = job.clone();
        drop(jobs);
        self.persist().await.map_err(|e| e.to_string())?;
        Ok(job)
    }

    async fn remove(&self, owner: Option<&str>, id: &str) -> std::result::Result<(), String> {
        let mut jobs = self.jobs.lock().await;
        let before = jobs.len();
        jobs.retain(|j| !(j.id == id && j.owner.as_deref() == owner));
        if jobs.len() == before {
            return Err(format!("No such job: {id}"));
        }
        drop(jobs);
        self.persist().await.map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Writes via temp file + rename, then locks permissions down to
/// `0600` on the file and `0700` on its parent directory (§6).
async fn atomic_write_locked_down(path: &Path, content: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ConductorError::Other(e.into()))?;
        if let Err(e) = set_mode(parent, 0o700).await {
            warn!("failed to set scheduler directory permissions: {}", e);
        }
    }
    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, content)
        .await
        .map_err(|e| ConductorError::Other(e.into()))?;
    if let Err(e) = set_mode(&tmp_path, 0o600).await {
        warn!("failed to set scheduler file permissions: {}", e);
    }
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| ConductorError::Other(e.into()))?;
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::types::CronPayload;

    fn job(id: &str, owner: Option<&str>, schedule: CronSchedule) -> CronJob {
        let delete_after_run = matches!(schedule, CronSchedule::At { .. });
        CronJob {
            id: id.to_string(),
            name: id.to_string(),
            owner: owner.map(String::from),
            schedule,
            payload: CronPayload {
                prompt: "ping".to_string(),
                deliver: false,
                target_channel: None,
                target_chat_id: None,
            },
            enabled: true,
            created_at_ms: now_ms(),
            next_fire_at_ms: now_ms(),
            last_fire_at_ms: None,
            delete_after_run,
        }
    }

    async fn scheduler_in(dir: &tempfile::TempDir) -> Arc<Scheduler> {
        let bus = Arc::new(MessageBus::new());
        Scheduler::load(dir.path().join("cron.json"), bus).await.unwrap()
    }

    #[tokio::test]
    async fn one_shot_job_fires_once_then_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(&dir).await;
        let at_job = job(
            "j1",
            Some("cli:u1"),
            CronSchedule::At { ms: now_ms() - 10 },
        );
        CronBackend::add(&*scheduler, Some("cli:u1".to_string()), at_job).await.unwrap();

        scheduler.tick().await.unwrap();

        let remaining = CronBackend::list(&*scheduler, Some("cli:u1")).await;
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn owner_isolation_blocks_cross_owner_access() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(&dir).await;
        let j = job("j1", None, CronSchedule::Every { ms: 60_000 });
        CronBackend::add(&*scheduler, Some("cli:a".to_string()), j).await.unwrap();

        assert!(CronBackend::show(&*scheduler, Some("cli:b"), "j1").await.is_none());
        assert!(CronBackend::show(&*scheduler, Some("cli:a"), "j1").await.is_some());
        assert!(CronBackend::remove(&*scheduler, Some("cli:b"), "j1").await.is_err());
    }

    #[tokio::test]
    async fn recurring_job_reschedules_instead_of_being_removed() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(&dir).await;
        let mut every = job("j1", Some("cli:u1"), CronSchedule::Every { ms: 50 });
        every.next_fire_at_ms = now_ms() - 1;
        CronBackend::add(&*scheduler, Some("cli:u1".to_string()), every).await.unwrap();

        scheduler.tick().await.unwrap();

        let remaining = CronBackend::list(&*scheduler, Some("cli:u1")).await;
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].next_fire_at_ms > now_ms());
    }

    #[tokio::test]
    async fn persists_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = scheduler_in(&dir).await;
        let j = job("j1", Some("cli:u1"), CronSchedule::Every { ms: 60_000 });
        CronBackend::add(&*scheduler, Some("cli:u1".to_string()), j).await.unwrap();

        let bus = Arc::new(MessageBus::new());
        let reloaded = Scheduler::load(dir.path().join("cron.json"), bus).await.unwrap();
        let jobs = reloaded.list_all().await;
        assert_eq!(jobs.len(), 1);
    }

    #[tokio::test]
    async fn fired_job_publishes_background_inbound_message() {
        let dir = tempfile::tempdir().unwrap();
        let bus = Arc::new(MessageBus::new());
        let scheduler = Scheduler::load(dir.path().join("cron.json"), bus.clone()).await.unwrap();
        let mut j = job("j1", Some("cli:u1"), CronSchedule::Every { ms: 60_000 });
        j.next_fire_at_ms = now_ms() - 1;
        CronBackend::add(&*scheduler, Some("cli:u1".to_string()), j).await.unwrap();

        scheduler.tick().await.unwrap();

        let msg = bus.recv_inbound().await;
        assert_eq!(msg.channel, "system");
        assert_eq!(msg.sender_id, "cron:j1");
        assert_eq!(msg.chat_id, "u1");
        assert!(msg.is_background());
    }
}
