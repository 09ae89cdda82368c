// =============================================================================
// Outcome Tracker — durable forward-return follow-ups
// =============================================================================
//
// Every non-ignore decision seeds a follow-up that samples the spot price at
// each configured offset (default 15m / 1h / 4h / 1d), then classifies
// profitability, scores the agent, recomputes pattern quality exactly, and
// feeds the causal learner.
//
// Follow-ups are NOT in-process sleeps: each one is a `pending_outcomes` job
// row with a `fire_at` watermark, driven by a polling scheduler. A process
// restart loses nothing — due jobs resume on the next poll, and a recovery
// scan re-enqueues anomalies whose job row was never written. An interval
// whose scheduled time is long past when the scheduler reaches it records
// null rather than sampling a price from the wrong time.
//
// Visibility: the outcome row is written only after every interval has been
// attempted, so a reader never observes a partial outcome.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::Decision;
use crate::config::EngineConfig;
use crate::detect::Anomaly;
use crate::learning::causal::CausalObservation;
use crate::learning::CausalLearner;
use crate::market::MarketDataService;
use crate::regime::{Horizon, MarketRegime, RegimeContext, TimeOfDay};
use crate::services::Clock;
use crate::store::{Database, OutcomeRow, PendingOutcomeJob};
use crate::types::{DecisionState, UserActionKind};

/// Max jobs pulled per scheduler poll.
const DUE_BATCH: usize = 64;

// =============================================================================
// Agent scoring
// =============================================================================

/// Was the agent's call right, given what the user did and how the signal
/// resolved?
///
/// - `ignore`: correct iff the signal was not profitable.
/// - otherwise: correct iff the user engaged and it paid, or the user
///   ignored it and it did not.
pub fn evaluate_agent(
    agent_state: DecisionState,
    user_action: UserActionKind,
    was_profitable: bool,
) -> bool {
    match agent_state {
        DecisionState::Ignore => !was_profitable,
        DecisionState::Monitor | DecisionState::Review | DecisionState::Execute => {
            if user_action.engaged() {
                was_profitable
            } else {
                !was_profitable
            }
        }
    }
}

// =============================================================================
// OutcomeTracker
// =============================================================================

pub struct OutcomeTracker {
    config: Arc<RwLock<EngineConfig>>,
    store: Arc<Database>,
    market: Arc<MarketDataService>,
    learner: Arc<CausalLearner>,
    clock: Arc<dyn Clock>,
}

impl OutcomeTracker {
    pub fn new(
        config: Arc<RwLock<EngineConfig>>,
        store: Arc<Database>,
        market: Arc<MarketDataService>,
        learner: Arc<CausalLearner>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            store,
            market,
            learner,
            clock,
        }
    }

    /// Seed the durable follow-up for a non-ignore decision. Returns whether
    /// a job was enqueued. Must be called only after `save_anomaly`.
    pub fn enqueue(
        &self,
        anomaly: &Anomaly,
        decision: &Decision,
        context: &RegimeContext,
    ) -> Result<bool> {
        if decision.state == DecisionState::Ignore {
            return Ok(false);
        }

        let (user_id, intervals) = {
            let config = self.config.read();
            (config.user_id.clone(), config.outcome_intervals.clone())
        };
        let Some(first) = intervals.first() else {
            warn!("no outcome intervals configured — follow-up skipped");
            return Ok(false);
        };

        let job = PendingOutcomeJob {
            anomaly_id: anomaly.id.clone(),
            user_id,
            symbol: anomaly.symbol.clone(),
            pattern_type: anomaly.pattern_type,
            entry_price: anomaly.price,
            agent_decision: decision.state,
            agent_confidence: decision.confidence.composite,
            detected_at: anomaly.detected_at,
            regime: context.regime,
            horizon: context.horizon,
            time_of_day: context.time_of_day,
            day_of_week: context.day_of_week,
            next_interval_index: 0,
            fire_at: anomaly.detected_at + Duration::seconds(first.seconds as i64),
            returns: Default::default(),
        };
        self.store.enqueue_pending_outcome(&job)?;

        debug!(
            anomaly_id = %anomaly.id,
            symbol = %anomaly.symbol,
            fire_at = %job.fire_at,
            "outcome tracking started"
        );
        Ok(true)
    }

    /// Re-enqueue non-ignored anomalies that lost their follow-up job (e.g.
    /// a crash between `save_anomaly` and the job write). The regime context
    /// is gone, so neutral values are substituted; long-past intervals will
    /// resolve to null through the staleness rule.
    pub fn recover(&self) -> Result<usize> {
        let (user_id, intervals, bar_interval, market_offset) = {
            let config = self.config.read();
            (
                config.user_id.clone(),
                config.outcome_intervals.clone(),
                config.bar_interval,
                config.market_offset(),
            )
        };
        let Some(first) = intervals.first() else {
            return Ok(0);
        };

        let candidates = self.store.recovery_candidates()?;
        let count = candidates.len();

        for candidate in candidates {
            // Session phase and weekday on the market's local clock, like
            // the classifier.
            let local = candidate.detected_at.with_timezone(&market_offset);
            let job = PendingOutcomeJob {
                anomaly_id: candidate.id.clone(),
                user_id: user_id.clone(),
                symbol: candidate.symbol.clone(),
                pattern_type: candidate.pattern_type,
                entry_price: candidate.price,
                agent_decision: candidate.agent_decision,
                agent_confidence: candidate.agent_confidence,
                detected_at: candidate.detected_at,
                regime: MarketRegime::Unknown,
                horizon: Horizon::from_interval(bar_interval),
                time_of_day: TimeOfDay::from_hour(local.hour()),
                day_of_week: local.weekday().num_days_from_monday() as u8,
                next_interval_index: 0,
                fire_at: candidate.detected_at + Duration::seconds(first.seconds as i64),
                returns: Default::default(),
            };
            self.store.enqueue_pending_outcome(&job)?;
            info!(anomaly_id = %candidate.id, "orphaned follow-up recovered");
        }

        Ok(count)
    }

    /// One scheduler pass: sample (or null out) every due interval, finalize
    /// jobs that have exhausted their intervals. Returns the number of jobs
    /// touched.
    pub async fn process_due(&self) -> Result<usize> {
        let now = self.clock.now();
        let due = self.store.due_pending_outcomes(now, DUE_BATCH)?;
        let touched = due.len();

        for job in due {
            if let Err(e) = self.process_job(job, now).await {
                warn!(error = %e, "pending outcome processing failed — will retry");
            }
        }

        Ok(touched)
    }

    async fn process_job(&self, mut job: PendingOutcomeJob, now: DateTime<Utc>) -> Result<()> {
        let (intervals, stale_after) = {
            let config = self.config.read();
            (
                config.outcome_intervals.clone(),
                Duration::seconds(config.outcome_stale_after_secs as i64),
            )
        };

        // Intervals may have been reconfigured under the job; anything past
        // the end finalizes with what it has.
        if job.next_interval_index >= intervals.len() {
            return self.finalize(job, now).await;
        }

        let interval = &intervals[job.next_interval_index];
        let scheduled = job.detected_at + Duration::seconds(interval.seconds as i64);

        let sampled = if now - scheduled > stale_after {
            // The scheduler was down when this interval was due; a price
            // sampled now would belong to the wrong instant.
            debug!(
                anomaly_id = %job.anomaly_id,
                interval = %interval.label,
                "interval missed while offline — recording null"
            );
            None
        } else {
            match self.market.spot_price(&job.symbol).await {
                Ok(price) => {
                    let forward = (price - job.entry_price) / job.entry_price;
                    debug!(
                        anomaly_id = %job.anomaly_id,
                        interval = %interval.label,
                        price,
                        forward = format!("{:+.4}", forward),
                        "forward return sampled"
                    );
                    Some(forward)
                }
                Err(e) => {
                    warn!(
                        anomaly_id = %job.anomaly_id,
                        symbol = %job.symbol,
                        interval = %interval.label,
                        error = %e,
                        "spot price unavailable — recording null"
                    );
                    None
                }
            }
        };

        job.returns.insert(interval.label.clone(), sampled);
        job.next_interval_index += 1;

        if job.next_interval_index < intervals.len() {
            let next = &intervals[job.next_interval_index];
            job.fire_at = job.detected_at + Duration::seconds(next.seconds as i64);
            self.store.enqueue_pending_outcome(&job)?;
            Ok(())
        } else {
            self.finalize(job, now).await
        }
    }

    /// Close the follow-up: read the user action (timeout sentinel
    /// "ignored"), classify profitability, score the agent, persist the
    /// outcome, recompute quality, and feed the causal learner.
    async fn finalize(&self, job: PendingOutcomeJob, now: DateTime<Utc>) -> Result<()> {
        let user_action = self
            .store
            .read_user_action(&job.anomaly_id, &job.user_id)?
            .unwrap_or(UserActionKind::Ignored);

        let profit_threshold = self.config.read().profit_threshold;

        let best_return = job
            .returns
            .values()
            .filter_map(|v| *v)
            .fold(f64::NEG_INFINITY, f64::max);
        let was_profitable = best_return.is_finite() && best_return >= profit_threshold;

        let agent_correct = evaluate_agent(job.agent_decision, user_action, was_profitable);

        let by_label = |label: &str| job.returns.get(label).copied().flatten();
        let outcome = OutcomeRow {
            anomaly_id: job.anomaly_id.clone(),
            user_id: job.user_id.clone(),
            agent_decision: job.agent_decision,
            agent_confidence: job.agent_confidence,
            user_action,
            return_15m: by_label("15m"),
            return_1h: by_label("1h"),
            return_4h: by_label("4h"),
            return_1d: by_label("1d"),
            was_profitable,
            agent_correct,
            created_at: now,
        };

        // Outcome first, then quality, then the job delete: a crash between
        // steps re-runs an idempotent tail, never loses the row.
        self.store.save_outcome(&outcome)?;
        self.store
            .recompute_pattern_quality(&job.user_id, job.pattern_type, &job.symbol, now)
            .context("quality recompute failed")?;

        let observation = CausalObservation {
            pattern_type: job.pattern_type,
            regime: job.regime,
            horizon: job.horizon,
            time_of_day: job.time_of_day,
            day_of_week: job.day_of_week,
            success: was_profitable,
            observed_at: now,
        };
        self.store.append_causal_observation(&observation)?;
        self.learner.record(&observation);

        self.store.delete_pending_outcome(&job.anomaly_id)?;

        info!(
            anomaly_id = %job.anomaly_id,
            symbol = %job.symbol,
            user_action = %user_action,
            best_return = format!("{:+.4}", if best_return.is_finite() { best_return } else { 0.0 }),
            was_profitable,
            agent_correct,
            "outcome finalized"
        );
        Ok(())
    }
}

// =============================================================================
// Scheduler loop
// =============================================================================

/// Drive the tracker until cancelled. On shutdown a final best-effort pass
/// flushes anything already due.
pub async fn run_outcome_scheduler(tracker: Arc<OutcomeTracker>, cancel: CancellationToken) {
    let poll_secs = tracker.config.read().outcome_poll_secs.max(1);
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_secs(poll_secs));
    info!(poll_secs, "outcome scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = tracker.process_due().await {
                    warn!(error = %e, "final outcome pass failed during shutdown");
                }
                info!("outcome scheduler stopped");
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = tracker.process_due().await {
                    warn!(error = %e, "outcome poll failed");
                }
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::confidence::CompositeConfidence;
    use crate::agent::SignalStory;
    use crate::config::OutcomeInterval;
    use crate::market::{
        BarInterval, FetchError, FetchPeriod, MarketDataProvider, MarketDataService,
    };
    use crate::regime::SignalSource;
    use crate::services::ManualClock;
    use crate::types::{Bar, PatternType, Severity};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// Spot-price mock: pops one scripted result per call.
    struct SpotScript {
        spots: Mutex<VecDeque<Result<f64, FetchError>>>,
    }

    impl SpotScript {
        fn new(spots: Vec<Result<f64, FetchError>>) -> Arc<Self> {
            Arc::new(Self {
                spots: Mutex::new(spots.into()),
            })
        }
    }

    #[async_trait]
    impl MarketDataProvider for SpotScript {
        fn name(&self) -> &'static str {
            "spot_script"
        }

        async fn fetch_bars(
            &self,
            _symbol: &str,
            _period: FetchPeriod,
            _interval: BarInterval,
        ) -> Result<Vec<Bar>, FetchError> {
            Err(FetchError::NoData)
        }

        async fn spot_price(&self, _symbol: &str) -> Result<f64, FetchError> {
            self.spots
                .lock()
                .pop_front()
                .unwrap_or(Err(FetchError::NoData))
        }
    }

    struct Harness {
        tracker: OutcomeTracker,
        store: Arc<Database>,
        learner: Arc<CausalLearner>,
        clock: Arc<ManualClock>,
        config: Arc<RwLock<EngineConfig>>,
    }

    fn detection_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 11, 0, 0).unwrap()
    }

    fn harness(spots: Vec<Result<f64, FetchError>>) -> Harness {
        let mut config = EngineConfig::default();
        config.outcome_intervals = vec![
            OutcomeInterval::new("15m", 900),
            OutcomeInterval::new("1h", 3_600),
            OutcomeInterval::new("4h", 14_400),
            OutcomeInterval::new("1d", 86_400),
        ];
        let config = Arc::new(RwLock::new(config));

        let store = Arc::new(Database::open_in_memory().unwrap());
        let market = Arc::new(MarketDataService::new(
            vec![SpotScript::new(spots) as Arc<dyn MarketDataProvider>],
            std::time::Duration::from_secs(60),
            std::time::Duration::from_secs(5),
        ));
        let learner = Arc::new(CausalLearner::new(30.0, 3));
        let clock = Arc::new(ManualClock::new(detection_time()));

        let tracker = OutcomeTracker::new(
            config.clone(),
            store.clone(),
            market,
            learner.clone(),
            clock.clone() as Arc<dyn Clock>,
        );

        Harness {
            tracker,
            store,
            learner,
            clock,
            config,
        }
    }

    fn anomaly(id: &str, price: f64) -> Anomaly {
        Anomaly {
            id: id.into(),
            symbol: "AAPL".into(),
            pattern_type: PatternType::VolumeSpike,
            severity: Severity::Critical,
            z_score: 6.0,
            price,
            volume: 1_600_000,
            detected_at: detection_time(),
            description: "test".into(),
            context: "ctx".into(),
            sources: "src".into(),
            thought_process: "tp".into(),
        }
    }

    fn decision(anomaly_id: &str, state: DecisionState) -> Decision {
        Decision {
            anomaly_id: anomaly_id.into(),
            state,
            confidence: CompositeConfidence {
                statistical: 1.0,
                behavioral: 0.68,
                regime: 1.0,
                data_quality: 1.0,
                uncertainty: 0.0,
                composite: 0.90,
            },
            reason: "r".into(),
            risk_assessment: "risk".into(),
            rejected: false,
            rejection_reason: None,
            escalated: false,
            escalation_reason: None,
            requested_more_data: false,
            invalidation: "inv".into(),
            story: SignalStory {
                context: "c".into(),
                trigger: "t".into(),
                risk: "r".into(),
                invalidation: "i".into(),
            },
            decided_at: detection_time(),
        }
    }

    fn context() -> RegimeContext {
        RegimeContext {
            regime: MarketRegime::Ranging,
            horizon: Horizon::Intraday,
            source: SignalSource::Composite,
            volatility_percentile: 40.0,
            trend_strength: 0.0,
            volume_regime: crate::regime::VolumeRegime::Normal,
            time_of_day: TimeOfDay::Mid,
            day_of_week: 1,
        }
    }

    /// Walk the clock through every configured interval, polling after each.
    async fn drive_all_intervals(h: &Harness) {
        let intervals = h.config.read().outcome_intervals.clone();
        for interval in intervals {
            h.clock
                .set(detection_time() + Duration::seconds(interval.seconds as i64 + 1));
            h.tracker.process_due().await.unwrap();
        }
    }

    #[tokio::test]
    async fn ignore_decisions_are_not_tracked() {
        let h = harness(vec![]);
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Ignore);
        h.store.save_anomaly(&a, &d).unwrap();

        let enqueued = h.tracker.enqueue(&a, &d, &context()).unwrap();
        assert!(!enqueued);
        assert!(h
            .store
            .due_pending_outcomes(detection_time() + Duration::days(2), 10)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn profitable_outcome_with_traded_action() {
        // Execute at 100; spots 100.2 / 101.0 / 100.5 / 99.8; user traded.
        let h = harness(vec![Ok(100.2), Ok(101.0), Ok(100.5), Ok(99.8)]);
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Execute);
        h.store.save_anomaly(&a, &d).unwrap();
        assert!(h.tracker.enqueue(&a, &d, &context()).unwrap());

        h.store
            .save_user_action(
                "sig-1",
                "default",
                UserActionKind::Traded,
                None,
                detection_time() + Duration::minutes(10),
            )
            .unwrap();

        drive_all_intervals(&h).await;

        let outcomes = h
            .store
            .recent_outcomes("default", 30, h.clock.now())
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        let o = &outcomes[0];
        assert!((o.return_15m.unwrap() - 0.002).abs() < 1e-9);
        assert!((o.return_1h.unwrap() - 0.010).abs() < 1e-9);
        assert!((o.return_4h.unwrap() - 0.005).abs() < 1e-9);
        assert!((o.return_1d.unwrap() + 0.002).abs() < 1e-9);
        assert!(o.was_profitable); // max return 1.0% >= 0.5%
        assert_eq!(o.user_action, UserActionKind::Traded);
        assert!(o.agent_correct);

        // Pending job is gone.
        assert!(h
            .store
            .due_pending_outcomes(h.clock.now() + Duration::days(2), 10)
            .unwrap()
            .is_empty());

        // Quality row exists for the triple.
        let quality = h
            .store
            .read_pattern_quality("default", PatternType::VolumeSpike, "AAPL")
            .unwrap()
            .unwrap();
        assert_eq!(quality.sample_size, 1);
        assert!((quality.accuracy - 1.0).abs() < 1e-9);

        // The causal learner saw the context -> outcome tuple.
        let assessment =
            h.learner
                .assess(PatternType::VolumeSpike, &context(), h.clock.now());
        assert!(assessment.has_regime_record);

        // And it was persisted for warm-up after a restart.
        let persisted = h
            .store
            .load_causal_observations(30, h.clock.now())
            .unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(persisted[0].success);
    }

    #[tokio::test]
    async fn timeout_becomes_ignored_and_agent_is_correct() {
        // Review decision, no user action ever, best return -1%.
        let h = harness(vec![Ok(99.5), Ok(99.2), Ok(99.0), Ok(99.0)]);
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Review);
        h.store.save_anomaly(&a, &d).unwrap();
        h.tracker.enqueue(&a, &d, &context()).unwrap();

        drive_all_intervals(&h).await;

        let outcomes = h
            .store
            .recent_outcomes("default", 30, h.clock.now())
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        let o = &outcomes[0];
        assert_eq!(o.user_action, UserActionKind::Ignored);
        assert!(!o.was_profitable);
        // Non-ignore decision + user ignored + not profitable => correct.
        assert!(o.agent_correct);

        // The failure reached the learner.
        let persisted = h
            .store
            .load_causal_observations(30, h.clock.now())
            .unwrap();
        assert_eq!(persisted.len(), 1);
        assert!(!persisted[0].success);
    }

    #[tokio::test]
    async fn failed_spot_fetches_record_null_not_abort() {
        let h = harness(vec![
            Err(FetchError::NoData),
            Ok(101.0),
            Err(FetchError::NoData),
            Err(FetchError::NoData),
        ]);
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Execute);
        h.store.save_anomaly(&a, &d).unwrap();
        h.tracker.enqueue(&a, &d, &context()).unwrap();

        drive_all_intervals(&h).await;

        let outcomes = h
            .store
            .recent_outcomes("default", 30, h.clock.now())
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        let o = &outcomes[0];
        assert!(o.return_15m.is_none());
        assert!((o.return_1h.unwrap() - 0.010).abs() < 1e-9);
        assert!(o.return_4h.is_none());
        assert!(o.return_1d.is_none());
        // The one good sample carries the classification.
        assert!(o.was_profitable);
    }

    #[tokio::test]
    async fn all_null_returns_are_not_profitable() {
        let h = harness(vec![]); // every spot fetch fails
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Execute);
        h.store.save_anomaly(&a, &d).unwrap();
        h.tracker.enqueue(&a, &d, &context()).unwrap();

        drive_all_intervals(&h).await;

        let outcomes = h
            .store
            .recent_outcomes("default", 30, h.clock.now())
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].was_profitable);
        // Execute + ignored + not profitable => agent scored wrong.
        assert!(!outcomes[0].agent_correct);
    }

    #[tokio::test]
    async fn stale_intervals_resolve_to_null_after_downtime() {
        // Scheduler comes back two days late: every interval is stale, the
        // outcome closes with all nulls and no spot fetches.
        let h = harness(vec![Ok(123.0)]); // would be consumed if sampled
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Execute);
        h.store.save_anomaly(&a, &d).unwrap();
        h.tracker.enqueue(&a, &d, &context()).unwrap();

        h.clock.set(detection_time() + Duration::days(2));
        // Four passes walk the job through all four stale intervals.
        for _ in 0..4 {
            h.tracker.process_due().await.unwrap();
        }

        let outcomes = h
            .store
            .recent_outcomes("default", 30, h.clock.now())
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        let o = &outcomes[0];
        assert!(o.return_15m.is_none());
        assert!(o.return_1d.is_none());
        assert!(!o.was_profitable);
    }

    #[tokio::test]
    async fn recovery_reenqueues_orphaned_anomalies() {
        let h = harness(vec![]);
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Execute);
        // Crash happened after save_anomaly but before the job write.
        h.store.save_anomaly(&a, &d).unwrap();

        let recovered = h.tracker.recover().unwrap();
        assert_eq!(recovered, 1);

        let due = h
            .store
            .due_pending_outcomes(detection_time() + Duration::hours(1), 10)
            .unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].anomaly_id, "sig-1");
        assert_eq!(due[0].regime, MarketRegime::Unknown);
        // 11:00 UTC is 06:00 on the default US Eastern session clock.
        assert_eq!(due[0].time_of_day, TimeOfDay::Open);

        // Second recovery is a no-op.
        assert_eq!(h.tracker.recover().unwrap(), 0);
    }

    #[test]
    fn agent_evaluation_truth_table() {
        use DecisionState::*;
        use UserActionKind::*;

        // Ignore decisions: correct iff not profitable, whatever the user did.
        assert!(evaluate_agent(Ignore, Ignored, false));
        assert!(!evaluate_agent(Ignore, Ignored, true));
        assert!(!evaluate_agent(Ignore, Traded, true));

        // Active decisions: engagement must line up with profitability.
        for state in [Monitor, Review, Execute] {
            assert!(evaluate_agent(state, Traded, true));
            assert!(evaluate_agent(state, Reviewed, true));
            assert!(!evaluate_agent(state, Traded, false));
            assert!(!evaluate_agent(state, Reviewed, false));
            assert!(evaluate_agent(state, Ignored, false));
            assert!(!evaluate_agent(state, Ignored, true));
        }
    }

    #[tokio::test]
    async fn exactly_one_outcome_per_anomaly() {
        // Extra polls after finalization must change nothing.
        let h = harness(vec![Ok(100.2), Ok(101.0), Ok(100.5), Ok(99.8), Ok(50.0)]);
        let a = anomaly("sig-1", 100.0);
        let d = decision("sig-1", DecisionState::Execute);
        h.store.save_anomaly(&a, &d).unwrap();
        h.tracker.enqueue(&a, &d, &context()).unwrap();

        drive_all_intervals(&h).await;
        h.tracker.process_due().await.unwrap();
        h.tracker.process_due().await.unwrap();

        let outcomes = h
            .store
            .recent_outcomes("default", 30, h.clock.now())
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        // The extra scripted spot was never consumed.
        assert!((outcomes[0].return_1d.unwrap() + 0.002).abs() < 1e-9);
    }
}
