// 用量台账：按月滚动的消息/搜索计数，只有走内置密钥的调用才计数。
use crate::storage::{StorageBackend, UsageRecord};
use crate::user_store::now_ts;
use anyhow::{anyhow, Result};
use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy)]
pub struct PlanLimits {
    pub plan: &'static str,
    pub messages_per_month: i64,
    pub searches_per_month: i64,
}

pub const PLAN_LIMITS: [PlanLimits; 3] = [
    PlanLimits {
        plan: "free",
        messages_per_month: 50,
        searches_per_month: 10,
    },
    PlanLimits {
        plan: "pro",
        messages_per_month: 500,
        searches_per_month: 200,
    },
    PlanLimits {
        plan: "ultra",
        messages_per_month: 2500,
        searches_per_month: 1000,
    },
];

pub fn limits_for_plan(plan: &str) -> PlanLimits {
    PLAN_LIMITS
        .iter()
        .find(|limits| limits.plan == plan)
        .copied()
        .unwrap_or(PLAN_LIMITS[0])
}

/// GET /usage 的响应体。
#[derive(Debug, Clone, Serialize)]
pub struct UsageSummary {
    pub plan: String,
    pub messages_used: i64,
    pub messages_limit: i64,
    pub searches_used: i64,
    pub searches_limit: i64,
    pub reset_date: f64,
}

pub struct UsageLedger {
    storage: Arc<dyn StorageBackend>,
}

/// 下一个月第一天的零点（UTC），Unix 秒。
fn first_of_next_month(now: f64) -> f64 {
    let current = Utc
        .timestamp_opt(now as i64, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let (year, month) = if current.month() == 12 {
        (current.year() + 1, 1)
    } else {
        (current.year(), current.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|boundary| boundary.timestamp() as f64)
        // 理论上不可达，保底给 30 天。
        .unwrap_or(now + 30.0 * 24.0 * 3600.0)
}

impl UsageLedger {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self { storage }
    }

    /// 取或建台账记录；跨过 reset_date 时清零计数并推进到下一个月初。
    pub fn ensure_record(&self, user_id: &str) -> Result<UsageRecord> {
        let now = now_ts();
        let mut record = match self.storage.get_usage(user_id)? {
            Some(record) => record,
            None => {
                let record = UsageRecord {
                    user_id: user_id.to_string(),
                    plan: "free".to_string(),
                    messages_used: 0,
                    searches_used: 0,
                    reset_date: first_of_next_month(now),
                };
                self.storage.upsert_usage(&record)?;
                return Ok(record);
            }
        };
        if now >= record.reset_date {
            record.messages_used = 0;
            record.searches_used = 0;
            record.reset_date = first_of_next_month(now);
            self.storage.upsert_usage(&record)?;
        }
        Ok(record)
    }

    pub fn summary(&self, user_id: &str) -> Result<UsageSummary> {
        let record = self.ensure_record(user_id)?;
        let limits = limits_for_plan(&record.plan);
        Ok(UsageSummary {
            plan: record.plan,
            messages_used: record.messages_used,
            messages_limit: limits.messages_per_month,
            searches_used: record.searches_used,
            searches_limit: limits.searches_per_month,
            reset_date: record.reset_date,
        })
    }

    /// 消息计数，按 amount 原样累加。达到上限时返回 Err 且不改动计数。
    pub fn increment_messages(&self, user_id: &str, amount: i64) -> Result<()> {
        let mut record = self.ensure_record(user_id)?;
        let limits = limits_for_plan(&record.plan);
        if record.messages_used >= limits.messages_per_month {
            return Err(anyhow!("message limit reached"));
        }
        record.messages_used += amount;
        self.storage.upsert_usage(&record)?;
        Ok(())
    }

    /// 搜索计数。达到上限时返回 Err 且不改动计数。
    pub fn increment_searches(&self, user_id: &str) -> Result<()> {
        let mut record = self.ensure_record(user_id)?;
        let limits = limits_for_plan(&record.plan);
        if record.searches_used >= limits.searches_per_month {
            return Err(anyhow!("search limit reached"));
        }
        record.searches_used += 1;
        self.storage.upsert_usage(&record)?;
        Ok(())
    }

    pub fn has_search_budget(&self, user_id: &str) -> Result<bool> {
        let record = self.ensure_record(user_id)?;
        let limits = limits_for_plan(&record.plan);
        Ok(record.searches_used < limits.searches_per_month)
    }

    pub fn has_message_budget(&self, user_id: &str) -> Result<bool> {
        let record = self.ensure_record(user_id)?;
        let limits = limits_for_plan(&record.plan);
        Ok(record.messages_used < limits.messages_per_month)
    }

    pub fn upgrade_plan(&self, user_id: &str, plan: &str) -> Result<UsageRecord> {
        let plan = plan.trim().to_lowercase();
        if !PLAN_LIMITS.iter().any(|limits| limits.plan == plan) {
            return Err(anyhow!("unknown plan: {plan}"));
        }
        let mut record = self.ensure_record(user_id)?;
        record.plan = plan;
        self.storage.upsert_usage(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;

    fn temp_ledger() -> (tempfile::TempDir, UsageLedger, Arc<SqliteStorage>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("usage.db");
        let storage = Arc::new(SqliteStorage::new(path.to_string_lossy().to_string()));
        storage.ensure_initialized().expect("init storage");
        (dir, UsageLedger::new(storage.clone()), storage)
    }

    #[test]
    fn new_record_starts_on_free_plan() {
        let (_dir, ledger, _storage) = temp_ledger();
        let record = ledger.ensure_record("alice").expect("ensure");
        assert_eq!(record.plan, "free");
        assert_eq!(record.messages_used, 0);
        assert!(record.reset_date > now_ts());
    }

    #[test]
    fn rollover_resets_counters_and_advances_boundary() {
        let (_dir, ledger, storage) = temp_ledger();
        let stale = UsageRecord {
            user_id: "alice".to_string(),
            plan: "free".to_string(),
            messages_used: 42,
            searches_used: 7,
            // 边界已过，下一次访问应滚动。
            reset_date: now_ts() - 3600.0,
        };
        storage.upsert_usage(&stale).expect("seed");
        let record = ledger.ensure_record("alice").expect("ensure");
        assert_eq!(record.messages_used, 0);
        assert_eq!(record.searches_used, 0);
        assert!(record.reset_date > now_ts());
    }

    #[test]
    fn search_limit_rejects_without_incrementing() {
        let (_dir, ledger, storage) = temp_ledger();
        let record = ledger.ensure_record("alice").expect("ensure");
        let limits = limits_for_plan(&record.plan);
        storage
            .upsert_usage(&UsageRecord {
                searches_used: limits.searches_per_month,
                ..record
            })
            .expect("seed at limit");
        assert!(ledger.increment_searches("alice").is_err());
        let after = ledger.ensure_record("alice").expect("ensure");
        assert_eq!(after.searches_used, limits.searches_per_month);
    }

    #[test]
    fn increment_applies_exact_amount() {
        let (_dir, ledger, _storage) = temp_ledger();
        // 深搜一次补计 2 条消息。
        ledger.increment_messages("alice", 2).expect("increment");
        ledger.increment_messages("alice", 1).expect("increment");
        let record = ledger.ensure_record("alice").expect("ensure");
        assert_eq!(record.messages_used, 3);
    }

    #[test]
    fn upgrade_changes_limits_but_keeps_counters() {
        let (_dir, ledger, _storage) = temp_ledger();
        ledger.increment_messages("alice", 1).expect("increment");
        let record = ledger.upgrade_plan("alice", "pro").expect("upgrade");
        assert_eq!(record.plan, "pro");
        assert_eq!(record.messages_used, 1);
        assert!(ledger.upgrade_plan("alice", "platinum").is_err());
    }

    #[test]
    fn boundary_is_first_of_next_month() {
        // 2026-08-23 12:00:00 UTC -> 2026-09-01 00:00:00 UTC
        let now = Utc
            .with_ymd_and_hms(2026, 8, 23, 12, 0, 0)
            .single()
            .expect("timestamp")
            .timestamp() as f64;
        let boundary = first_of_next_month(now);
        let expected = Utc
            .with_ymd_and_hms(2026, 9, 1, 0, 0, 0)
            .single()
            .expect("timestamp")
            .timestamp() as f64;
        assert_eq!(boundary, expected);

        // 12 月滚动到次年 1 月。
        let december = Utc
            .with_ymd_and_hms(2026, 12, 31, 23, 0, 0)
            .single()
            .expect("timestamp")
            .timestamp() as f64;
        let next = first_of_next_month(december);
        let january = Utc
            .with_ymd_and_hms(2027, 1, 1, 0, 0, 0)
            .single()
            .expect("timestamp")
            .timestamp() as f64;
        assert_eq!(next, january);
    }
}
