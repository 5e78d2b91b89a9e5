use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::scheduler::types::{CronJob, CronPayload, CronSchedule};

use super::base::{Tool, ToolResult};

/// Storage and job-id allocation live in the scheduler; this tool only
/// validates input and translates it into backend calls, keeping
/// per-owner isolation at the call site (every operation is scoped to
/// the caller's `ownerKey`).
#[async_trait]
pub trait CronBackend: Send + Sync {
    async fn add(&self, owner: Option<String>, job: CronJob) -> Result<CronJob, String>;
    async fn list(&self, owner: Option<&str>) -> Vec<CronJob>;
    async fn show(&self, owner: Option<&str>, id: &str) -> Option<CronJob>;
    async fn update(&self, owner: Option<&str>, id: &str, job: CronJob) -> Result<CronJob, String>;
    async fn remove(&self, owner: Option<&str>, id: &str) -> Result<(), String>;
}

pub struct CronTool {
    backend: Arc<dyn CronBackend>,
}

impl CronTool {
    pub fn new(backend: Arc<dyn CronBackend>) -> Self {
        Self { backend }
    }
}

fn parse_schedule(value: &Value) -> Result<CronSchedule, String> {
    let obj = value.as_object().ok_or("schedule must be an object")?;
    let present: Vec<&str> = ["every", "cron", "at"]
        .iter()
        .copied()
        .filter(|k| obj.contains_key(*k))
        .collect();
    if present.len() != 1 {
        return Err("schedule must specify exactly one of every/cron/at".to_string());
    }
    match present[0] {
        "every" => {
            let ms = obj["every"]
                .as_i64()
                .ok_or("schedule.every must be an integer number of milliseconds")?;
            if ms < 1000 {
                return Err("schedule.every must be at least 1000 ms".to_string());
            }
            Ok(CronSchedule::Every { ms })
        }
        "cron" => {
            let expr = obj["cron"].as_str().ok_or("schedule.cron must be a string")?;
            validate_cron_expr(expr)?;
            Ok(CronSchedule::Cron { expr: expr.to_string() })
        }
        "at" => {
            let ms = obj["at"]
                .as_i64()
                .ok_or("schedule.at must be an integer epoch millisecond timestamp")?;
            let now = chrono::Utc::now().timestamp_millis();
            if ms <= now {
                return Err("schedule.at must be strictly in the future".to_string());
            }
            Ok(CronSchedule::At { ms })
        }
        _ => unreachable!(),
    }
}

/// Accepts a 5-field cron expression or one of the named shortcuts;
/// anything else fails with a descriptive error before it ever reaches
/// the scheduler.
fn validate_cron_expr(expr: &str) -> Result<(), String> {
    crate::scheduler::expr::normalize(expr).map(|_| ())
}

fn build_job(id: String, params: &Value, owner: Option<String>, now_ms: i64) -> Result<CronJob, String> {
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or("unnamed")
        .to_string();
    let schedule_value = params.get("schedule").ok_or("Missing required parameter: schedule")?;
    let schedule = parse_schedule(schedule_value)?;
    let delete_after_run = matches!(schedule, CronSchedule::At { .. });

    let payload_value = params.get("payload").ok_or("Missing required parameter: payload")?;
    let prompt = payload_value
        .get("prompt")
        .and_then(Value::as_str)
        .ok_or("payload.prompt is required")?
        .to_string();
    let payload = CronPayload {
        prompt,
        deliver: payload_value.get("deliver").and_then(Value::as_bool).unwrap_or(false),
        target_channel: payload_value
            .get("targetChannel")
            .and_then(Value::as_str)
            .map(String::from),
        target_chat_id: payload_value
            .get("targetChatId")
            .and_then(Value::as_str)
            .map(String::from),
    };

    Ok(CronJob {
        id,
        name,
        owner,
        schedule,
        payload,
        enabled: true,
        created_at_ms: now_ms,
        next_fire_at_ms: now_ms,
        last_fire_at_ms: None,
        delete_after_run,
    })
}

fn job_to_json(job: &CronJob) -> Value {
    serde_json::to_value(job).unwrap_or(Value::Null)
}

#[async_trait]
impl Tool for CronTool {
    fn name(&self) -> &str {
        "cron"
    }
    fn description(&self) -> &str {
        "Manages scheduled background turns: add, list, show, update, remove."
    }
    fn parameters(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["add", "list", "show", "update", "remove"]},
                "ownerKey": {"type": "string"},
                "id": {"type": "string"},
                "name": {"type": "string"},
                "schedule": {"type": "object"},
                "payload": {"type": "object"}
            },
            "required": ["action"]
        })
    }
    async fn execute(&self, params: Value) -> ToolResult {
        let Some(action) = params.get("action").and_then(Value::as_str) else {
            return ToolResult::error("Missing required parameter: action");
        };
        let owner = params.get("ownerKey").and_then(Value::as_str).map(String::from);

        match action {
            "add" => {
                let now_ms = chrono::Utc::now().timestamp_millis();
                let id = uuid::Uuid::new_v4().to_string();
                let job = match build_job(id, &params, owner.clone(), now_ms) {
                    Ok(job) => job,
                    Err(e) => return ToolResult::error(e),
                };
                match self.backend.add(owner, job).await {
                    Ok(job) => ToolResult::success(job_to_json(&job).to_string()),
                    Err(e) => ToolResult::error(e),
                }
            }
            "list" => {
                let jobs = self.backend.list(owner.as_deref()).await;
                let json: Vec<Value> = jobs.iter().map(job_to_json).collect();
                ToolResult::success(Value::Array(json).to_string())
            }
            "show" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return ToolResult::error("Missing required parameter: id");
                };
                match self.backend.show(owner.as_deref(), id).await {
                    Some(job) => ToolResult::success(job_to_json(&job).to_string()),
                    None => ToolResult::error(format!("No such job: {id}")),
                }
            }
            "update" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return ToolResult::error("Missing required parameter: id");
                };
                let Some(existing) = self.backend.show(owner.as_deref(), id).await else {
                    return ToolResult::error(format!("No such job: {id}"));
                };
                let now_ms = existing.created_at_ms;
                let mut updated = match build_job(id.to_string(), &params, owner.clone(), now_ms) {
                    Ok(job) => job,
                    Err(e) => return ToolResult::error(e),
                };
                updated.last_fire_at_ms = existing.last_fire_at_ms;
                match self.backend.update(owner.as_deref(), id, updated).await {
                    Ok(job) => ToolResult::success(job_to_json(&job).to_string()),
                    Err(e) => ToolResult::error(e),
                }
            }
            "remove" => {
                let Some(id) = params.get("id").and_then(Value::as_str) else {
                    return ToolResult::error("Missing required parameter: id");
                };
                match self.backend.remove(owner.as_deref(), id).await {
                    Ok(()) => ToolResult::success(format!("Removed {id}")),
                    Err(e) => ToolResult::error(e),
                }
            }
            other => ToolResult::error(format!("Unknown action: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct InMemoryBackend {
        jobs: Mutex<Vec<CronJob>>,
    }

    #[async_trait]
    impl CronBackend for InMemoryBackend {
        async fn add(&self, _owner: Option<String>, job: CronJob) -> Result<CronJob, String> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(job)
        }
        async fn list(&self, owner: Option<&str>) -> Vec<CronJob> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .filter(|j| j.owner.as_deref() == owner)
                .cloned()
                .collect()
        }
        async fn show(&self, owner: Option<&str>, id: &str) -> Option<CronJob> {
            self.jobs
                .lock()
                .unwrap()
                .iter()
                .find(|j| j.id == id && j.owner.as_deref() == owner)
                .cloned()
        }
        async fn update(&self, owner: Option<&str>, id: &str, job: CronJob) -> Result<CronJob, String> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(existing) = jobs.iter_mut().find(|j| j.id == id && j.owner.as_deref() == owner) {
                *existing = job.clone();
                Ok(job)
            } else {
                Err("not found".to_string())
            }
        }
        async fn remove(&self, owner: Option<&str>, id: &str) -> Result<(), String> {
            let mut jobs = self.jobs.lock().unwrap();
            let before = jobs.len();
            jobs.retain(|j| !(j.id == id && j.owner.as_deref() == owner));
            if jobs.len() == before {
                Err("not found".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn validate_cron_expr_accepts_shortcuts_and_five_fields() {
        assert!(validate_cron_expr("@daily").is_ok());
        assert!(validate_cron_expr("0 9 * * MON").is_ok());
        assert!(validate_cron_expr("not a cron").is_err());
    }

    #[test]
    fn parse_schedule_requires_exactly_one_kind() {
        let both = serde_json::json!({"every": 5000, "cron": "0 9 * * *"});
        assert!(parse_schedule(&both).is_err());
        let none = serde_json::json!({});
        assert!(parse_schedule(&none).is_err());
    }

    #[test]
    fn parse_schedule_rejects_past_at() {
        let past = serde_json::json!({"at": 1});
        assert!(parse_schedule(&past).is_err());
    }

    #[test]
    fn parse_schedule_rejects_sub_second_every() {
        let too_fast = serde_json::json!({"every": 10});
        assert!(parse_schedule(&too_fast).is_err());
    }

    #[tokio::test]
    async fn add_then_list_is_scoped_to_owner() {
        let backend = Arc::new(InMemoryBackend::default());
        let tool = CronTool::new(backend);
        tool.execute(serde_json::json!({
            "action": "add",
            "ownerKey": "cli:u1",
            "name": "ping",
            "schedule": {"every": 60000},
            "payload": {"prompt": "ping"}
        }))
        .await;
        let result = tool
            .execute(serde_json::json!({"action": "list", "ownerKey": "cli:u1"}))
            .await;
        match result {
            ToolResult::Success(body) => assert!(body.contains("ping")),
            other => panic!("expected success, got {other:?}"),
        }
        let other_owner = tool
            .execute(serde_json::json!({"action": "list", "ownerKey": "cli:u2"}))
            .await;
        assert_eq!(other_owner, ToolResult::success("[]".to_string()));
    }

    #[tokio::test]
    async fn remove_unknown_job_errors() {
        let backend = Arc::new(InMemoryBackend::default());
        let tool = CronTool::new(backend);
        let result = tool
            .execute(serde_json::json!({"action": "remove", "id": "nope"}))
            .await;
        assert!(result.is_error());
    }
}
