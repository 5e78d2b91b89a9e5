use serde::{Deserialize, Serialize};

/// Exactly one schedule kind per job (§3 invariant). `At` jobs always
/// carry `delete_after_run = true` on `CronJob`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CronSchedule {
    Every { ms: i64 },
    Cron { expr: String },
    At { ms: i64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CronPayload {
    pub prompt: String,
    #[serde(default)]
    pub deliver: bool,
    #[serde(default)]
    pub target_channel: Option<String>,
    #[serde(default)]
    pub target_chat_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner: Option<String>,
    pub schedule: CronSchedule,
    pub payload: CronPayload,
    pub enabled: bool,
    pub created_at_ms: i64,
    pub next_fire_at_ms: i64,
    #[serde(default)]
    pub last_fire_at_ms: Option<i64>,
    pub delete_after_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_serializes_with_tag() {
        let s = CronSchedule::Every { ms: 1000 };
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["kind"], "every");
        assert_eq!(json["ms"], 1000);
    }
}
