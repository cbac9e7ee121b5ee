//! Cost ledger, budget alerts and spend statistics.
//!
//! Every backend response is turned into an append-only [`CostRecord`].
//! After each append the tracker evaluates per-request and
//! daily/weekly/monthly thresholds; crossings become [`CostAlert`]s, which
//! are stored, logged and forwarded to the [`AuditSink`] but never fail
//! the caller.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock as StdRwLock};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use td_core::config::BudgetConfig;
use td_core::{ProviderKind, TaskCategory};
use td_telemetry::metrics::{global_metrics, COST_ALERTS_TOTAL};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::llm::LlmResponse;

/// Alerts kept in memory for [`CostTracker::get_recent_alerts`].
const MAX_STORED_ALERTS: usize = 1000;

/// Aggregate-cost ratio against the cheapest backend that triggers a
/// downgrade recommendation.
pub const DOWNGRADE_COST_RATIO: f64 = 5.0;
pub const DOWNGRADE_SAVING: f64 = 0.30;
/// Minimum ledger size before caching is considered.
pub const CACHING_MIN_RECORDS: usize = 100;
/// Unique (user, task type) share below which caching is recommended.
pub const CACHING_UNIQUE_RATIO: f64 = 0.30;
pub const CACHING_SAVING: f64 = 0.20;
pub const PROMPT_TOKENS_THRESHOLD: f64 = 5000.0;
pub const PROMPT_REDUCTION_SAVING: f64 = 0.15;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Optional attribution attached to every record of one orchestration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostTags {
    pub task_type: Option<TaskCategory>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: Uuid,
    pub backend: String,
    pub provider: ProviderKind,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    /// USD, never negative.
    pub cost: f64,
    pub latency_ms: u64,
    pub task_type: Option<TaskCategory>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl CostRecord {
    pub fn from_response(response: &LlmResponse, tags: &CostTags) -> Self {
        Self {
            id: Uuid::new_v4(),
            backend: response.backend.clone(),
            provider: response.provider,
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            total_tokens: response.total_tokens,
            cost: response.cost.max(0.0),
            latency_ms: response.latency_ms,
            task_type: tags.task_type,
            user_id: tags.user_id.clone(),
            session_id: tags.session_id.clone(),
            timestamp: response.timestamp,
        }
    }
}

// ---------------------------------------------------------------------------
// Alerts and budget checks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PerRequest,
    Daily,
    Weekly,
    Monthly,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PerRequest => "per_request",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostAlert {
    pub kind: AlertKind,
    pub current: f64,
    pub limit: f64,
    /// `current / limit × 100`.
    pub percentage: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl CostAlert {
    fn new(kind: AlertKind, current: f64, limit: f64) -> Self {
        let percentage = if limit > 0.0 {
            current / limit * 100.0
        } else {
            100.0
        };
        let message = match kind {
            AlertKind::PerRequest => format!(
                "request cost ${current:.4} exceeds per-request limit ${limit:.4}"
            ),
            _ => format!(
                "{kind} spend ${current:.4} is {percentage:.1}% of the ${limit:.2} budget"
            ),
        };
        Self {
            kind,
            current,
            limit,
            percentage,
            message,
            timestamp: Utc::now(),
        }
    }
}

/// Result of a budget check.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetCheck {
    Allowed,
    Warning { window: AlertKind, percentage: f64 },
    Denied { reason: String },
}

impl BudgetCheck {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, BudgetCheck::Denied { .. })
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendUsage {
    pub requests: u64,
    pub cost: f64,
    pub tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostStats {
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub avg_cost_per_request: f64,
    pub avg_tokens_per_request: f64,
    pub avg_latency_ms: f64,
    pub by_backend: BTreeMap<String, BackendUsage>,
    /// Cost per task type; untagged records fall under `"untagged"`.
    pub by_task_type: BTreeMap<String, f64>,
    /// Cost per user; records without a user are omitted.
    pub by_user: BTreeMap<String, f64>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl CostStats {
    fn from_records(
        records: &[CostRecord],
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Self {
        let mut stats = CostStats {
            start,
            end,
            ..Default::default()
        };
        let mut latency_total = 0u64;
        for r in records {
            stats.total_cost += r.cost;
            stats.total_requests += 1;
            stats.total_tokens += r.total_tokens;
            latency_total += r.latency_ms;

            let usage = stats.by_backend.entry(r.backend.clone()).or_default();
            usage.requests += 1;
            usage.cost += r.cost;
            usage.tokens += r.total_tokens;

            let task = r
                .task_type
                .map(|t| t.to_string())
                .unwrap_or_else(|| "untagged".to_string());
            *stats.by_task_type.entry(task).or_insert(0.0) += r.cost;
            if let Some(user) = &r.user_id {
                *stats.by_user.entry(user.clone()).or_insert(0.0) += r.cost;
            }
        }
        if stats.total_requests > 0 {
            let n = stats.total_requests as f64;
            stats.avg_cost_per_request = stats.total_cost / n;
            stats.avg_tokens_per_request = stats.total_tokens as f64 / n;
            stats.avg_latency_ms = latency_total as f64 / n;
        }
        stats
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationKind {
    ModelDowngrade,
    ResponseCaching,
    PromptReduction,
}

/// Advisory saving estimate; nothing acts on it automatically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationRecommendation {
    pub kind: RecommendationKind,
    pub description: String,
    /// Estimated USD saved over the same period.
    pub potential_saving: f64,
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Storage behind the tracker. Append-only apart from `reset`.
pub trait CostLedger: Send + Sync {
    fn append(&self, record: CostRecord);
    /// Records with `start <= timestamp < end`, in append order.
    fn query(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Vec<CostRecord>;
    /// Total cost of records at or after each of `starts`, index for index.
    fn totals_since(&self, starts: &[DateTime<Utc>]) -> Vec<f64> {
        let mut totals = vec![0.0; starts.len()];
        for r in self.query(starts.iter().min().copied(), None) {
            accumulate(&mut totals, starts, &r);
        }
        totals
    }
    /// Clears everything. Tests only.
    fn reset(&self);
}

fn accumulate(totals: &mut [f64], starts: &[DateTime<Utc>], record: &CostRecord) {
    for (total, start) in totals.iter_mut().zip(starts) {
        if record.timestamp >= *start {
            *total += record.cost;
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryLedger {
    records: StdRwLock<Vec<CostRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CostLedger for InMemoryLedger {
    fn append(&self, record: CostRecord) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
    }

    fn query(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Vec<CostRecord> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| start.map_or(true, |s| r.timestamp >= s))
            .filter(|r| end.map_or(true, |e| r.timestamp < e))
            .cloned()
            .collect()
    }

    fn totals_since(&self, starts: &[DateTime<Utc>]) -> Vec<f64> {
        let mut totals = vec![0.0; starts.len()];
        for r in self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
        {
            accumulate(&mut totals, starts, r);
        }
        totals
    }

    fn reset(&self) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Receives every record and alert, e.g. for persistence.
pub trait AuditSink: Send + Sync {
    fn record(&self, record: &CostRecord);
    fn alert(&self, alert: &CostAlert);
}

/// Writes records at debug level and alerts at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, record: &CostRecord) {
        debug!(
            id = %record.id,
            backend = %record.backend,
            tokens = record.total_tokens,
            cost = record.cost,
            "cost recorded"
        );
    }

    fn alert(&self, alert: &CostAlert) {
        info!(kind = %alert.kind, current = alert.current, limit = alert.limit, "cost alert audited");
    }
}

// ---------------------------------------------------------------------------
// CostTracker
// ---------------------------------------------------------------------------

#[derive(Default)]
struct AlertState {
    /// Window total at the last alert per window kind.
    last_alerted: HashMap<AlertKind, f64>,
    alerts: VecDeque<CostAlert>,
}

/// Spend ledger with budget enforcement. Cheap to clone.
#[derive(Clone)]
pub struct CostTracker {
    ledger: Arc<dyn CostLedger>,
    sink: Arc<dyn AuditSink>,
    budget: Arc<RwLock<BudgetConfig>>,
    /// Serializes append and threshold evaluation.
    state: Arc<Mutex<AlertState>>,
}

impl CostTracker {
    pub fn new(budget: BudgetConfig) -> Self {
        Self {
            ledger: Arc::new(InMemoryLedger::new()),
            sink: Arc::new(TracingAuditSink),
            budget: Arc::new(RwLock::new(budget)),
            state: Arc::new(Mutex::new(AlertState::default())),
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn CostLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = sink;
        self
    }

    pub async fn budget(&self) -> BudgetConfig {
        self.budget.read().await.clone()
    }

    /// Replace the budget. Alert history is kept.
    pub async fn reload(&self, budget: BudgetConfig) {
        *self.budget.write().await = budget;
        info!("budget reloaded");
    }

    /// Append one record and evaluate thresholds.
    pub async fn track(&self, response: &LlmResponse, tags: &CostTags) -> CostRecord {
        let record = CostRecord::from_response(response, tags);
        let budget = self.budget.read().await.clone();

        let mut state = self.state.lock().await;
        self.ledger.append(record.clone());
        self.sink.record(&record);
        let alerts = self.evaluate(&budget, &record, &mut state.last_alerted);
        for alert in alerts {
            warn!(kind = %alert.kind, current = alert.current, limit = alert.limit, "{}", alert.message);
            global_metrics().increment_counter(COST_ALERTS_TOTAL, &[("kind", alert.kind.as_str())]);
            self.sink.alert(&alert);
            if state.alerts.len() == MAX_STORED_ALERTS {
                state.alerts.pop_front();
            }
            state.alerts.push_back(alert);
        }
        record
    }

    pub async fn track_many(&self, responses: &[LlmResponse], tags: &CostTags) -> Vec<CostRecord> {
        let mut records = Vec::with_capacity(responses.len());
        for response in responses {
            records.push(self.track(response, tags).await);
        }
        records
    }

    fn evaluate(
        &self,
        budget: &BudgetConfig,
        record: &CostRecord,
        last_alerted: &mut HashMap<AlertKind, f64>,
    ) -> Vec<CostAlert> {
        let mut alerts = Vec::new();
        if let Some(limit) = budget.per_request_limit {
            if record.cost > limit {
                alerts.push(CostAlert::new(AlertKind::PerRequest, record.cost, limit));
            }
        }

        for (kind, limit, total) in self.windows(budget) {
            let Some(limit) = limit else { continue };
            if total < limit * budget.alert_threshold {
                // below the line: re-arm for the next crossing
                last_alerted.remove(&kind);
                continue;
            }
            let already = last_alerted.get(&kind).is_some_and(|prev| total <= *prev);
            if !already {
                last_alerted.insert(kind, total);
                alerts.push(CostAlert::new(kind, total, limit));
            }
        }
        alerts
    }

    fn window_start(kind: AlertKind, now: DateTime<Utc>) -> DateTime<Utc> {
        match kind {
            AlertKind::PerRequest => now,
            AlertKind::Daily => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc())
                .unwrap_or(now),
            AlertKind::Weekly => now - Duration::days(7),
            AlertKind::Monthly => now - Duration::days(30),
        }
    }

    fn window_total(&self, kind: AlertKind, now: DateTime<Utc>) -> f64 {
        self.ledger
            .totals_since(&[Self::window_start(kind, now)])
            .first()
            .copied()
            .unwrap_or(0.0)
    }

    /// Daily, weekly and monthly limits paired with their current totals,
    /// from a single ledger pass. Skips the pass when no window is limited.
    fn windows(&self, budget: &BudgetConfig) -> [(AlertKind, Option<f64>, f64); 3] {
        let kinds = [
            (AlertKind::Daily, budget.daily_limit),
            (AlertKind::Weekly, budget.weekly_limit),
            (AlertKind::Monthly, budget.monthly_limit),
        ];
        let mut totals = [0.0; 3];
        if kinds.iter().any(|(_, limit)| limit.is_some()) {
            let now = Utc::now();
            let starts = kinds.map(|(kind, _)| Self::window_start(kind, now));
            for (slot, total) in totals.iter_mut().zip(self.ledger.totals_since(&starts)) {
                *slot = total;
            }
        }
        let [(d, dl), (w, wl), (m, ml)] = kinds;
        [(d, dl, totals[0]), (w, wl, totals[1]), (m, ml, totals[2])]
    }

    /// Spend since UTC midnight.
    pub async fn get_today_cost(&self) -> f64 {
        self.window_total(AlertKind::Daily, Utc::now())
    }

    /// Spend over the last 7 days.
    pub async fn get_weekly_cost(&self) -> f64 {
        self.window_total(AlertKind::Weekly, Utc::now())
    }

    /// Spend over the last 30 days.
    pub async fn get_monthly_cost(&self) -> f64 {
        self.window_total(AlertKind::Monthly, Utc::now())
    }

    pub async fn get_stats(
        &self,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> CostStats {
        CostStats::from_records(&self.ledger.query(start, end), start, end)
    }

    /// The last `limit` alerts, oldest first.
    pub async fn get_recent_alerts(&self, limit: usize) -> Vec<CostAlert> {
        let state = self.state.lock().await;
        let skip = state.alerts.len().saturating_sub(limit);
        state.alerts.iter().skip(skip).cloned().collect()
    }

    /// Would a request costing `estimated` fit the budget right now?
    pub async fn check_budget(&self, estimated: f64) -> BudgetCheck {
        let budget = self.budget.read().await.clone();
        self.check_against(&budget, estimated)
    }

    /// Like [`check_budget`](Self::check_budget), but always `Allowed`
    /// unless `hard_stop` is set. Both read the same budget snapshot.
    pub async fn enforce_budget(&self, estimated: f64) -> BudgetCheck {
        let budget = self.budget.read().await.clone();
        if !budget.hard_stop {
            return BudgetCheck::Allowed;
        }
        self.check_against(&budget, estimated)
    }

    fn check_against(&self, budget: &BudgetConfig, estimated: f64) -> BudgetCheck {
        if let Some(limit) = budget.per_request_limit {
            if estimated > limit {
                return BudgetCheck::Denied {
                    reason: format!(
                        "estimated cost ${estimated:.4} exceeds per-request limit ${limit:.4}"
                    ),
                };
            }
        }

        let mut warning: Option<BudgetCheck> = None;
        for (kind, limit, total) in self.windows(budget) {
            let Some(limit) = limit else { continue };
            let projected = total + estimated;
            if projected > limit {
                return BudgetCheck::Denied {
                    reason: format!(
                        "{kind} budget exhausted (${projected:.4} projected > ${limit:.2})"
                    ),
                };
            }
            if warning.is_none() && projected >= limit * budget.alert_threshold {
                warning = Some(BudgetCheck::Warning {
                    window: kind,
                    percentage: if limit > 0.0 { projected / limit * 100.0 } else { 100.0 },
                });
            }
        }
        warning.unwrap_or(BudgetCheck::Allowed)
    }

    pub async fn get_optimization_recommendations(&self) -> Vec<OptimizationRecommendation> {
        let records = self.ledger.query(None, None);
        let stats = CostStats::from_records(&records, None, None);
        let mut recs = Vec::new();

        let cheapest = stats
            .by_backend
            .iter()
            .filter(|(_, u)| u.cost > 0.0)
            .min_by(|a, b| a.1.cost.total_cmp(&b.1.cost));
        if let Some((cheap_id, cheap)) = cheapest {
            for (id, usage) in &stats.by_backend {
                if id != cheap_id && usage.cost > cheap.cost * DOWNGRADE_COST_RATIO {
                    recs.push(OptimizationRecommendation {
                        kind: RecommendationKind::ModelDowngrade,
                        description: format!(
                            "{id} costs {:.1}x more than {cheap_id}; route simple tasks to {cheap_id}",
                            usage.cost / cheap.cost
                        ),
                        potential_saving: usage.cost * DOWNGRADE_SAVING,
                    });
                }
            }
        }

        if records.len() >= CACHING_MIN_RECORDS {
            let unique: HashSet<(Option<&str>, Option<TaskCategory>)> = records
                .iter()
                .map(|r| (r.user_id.as_deref(), r.task_type))
                .collect();
            let ratio = unique.len() as f64 / records.len() as f64;
            if ratio < CACHING_UNIQUE_RATIO {
                recs.push(OptimizationRecommendation {
                    kind: RecommendationKind::ResponseCaching,
                    description: format!(
                        "only {:.0}% of requests are unique by user and task type; cache responses",
                        ratio * 100.0
                    ),
                    potential_saving: stats.total_cost * CACHING_SAVING,
                });
            }
        }

        if stats.total_requests > 0 && stats.avg_tokens_per_request > PROMPT_TOKENS_THRESHOLD {
            recs.push(OptimizationRecommendation {
                kind: RecommendationKind::PromptReduction,
                description: format!(
                    "average request uses {:.0} tokens; trim prompts and context",
                    stats.avg_tokens_per_request
                ),
                potential_saving: stats.total_cost * PROMPT_REDUCTION_SAVING,
            });
        }

        recs
    }

    /// Clear the ledger and alert history. Tests only.
    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        self.ledger.reset();
        *state = AlertState::default();
    }
}
