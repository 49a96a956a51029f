// =============================================================================
// Risk Evaluator — layered policy checks for one user
// =============================================================================
//
// Check order:
//   1. feature toggles            5. per-symbol exposure headroom
//   2. daily counters             6. total exposure
//   3. order notional bounds      7. soft thresholds (warn / caution shrink)
//   4. position-size cap          8. stop-loss / take-profit attachment
//
// An evaluator-internal error (store read failure) resolves through the
// configured failure mode: FAIL_CLOSE rejects, FAIL_LIMIT allows capped at
// the fallback size.
// =============================================================================

use std::sync::Arc;

use chrono::Local;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::errors::CoreError;
use crate::store::Store;
use crate::types::{AccountSnapshot, SignalAction};

use super::metrics::DailyMetrics;
use super::{
    FailureMode, LimitLevel, PositionExposure, RiskConfig, RiskDecision, RiskOverride, SignalInput,
};

/// Per-user risk evaluator. Owned by the [`super::RiskManagerRegistry`].
pub struct RiskEvaluator {
    user_id: String,
    config: Arc<RwLock<RiskConfig>>,
    store: Arc<Store>,
    metrics: RwLock<DailyMetrics>,
}

impl RiskEvaluator {
    pub fn new(user_id: impl Into<String>, config: Arc<RwLock<RiskConfig>>, store: Arc<Store>) -> Self {
        let user_id = user_id.into();
        let metrics = store
            .load_daily_metrics(&user_id, Local::now().date_naive())
            .unwrap_or_else(|e| {
                warn!(user_id = %user_id, error = %e, "failed to load daily metrics — starting fresh");
                None
            })
            .unwrap_or_else(DailyMetrics::today);
        Self {
            user_id,
            config,
            store,
            metrics: RwLock::new(metrics),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    // -------------------------------------------------------------------------
    // Evaluation
    // -------------------------------------------------------------------------

    /// Evaluate a signal. Never returns an error: internal failures resolve
    /// through the configured failure mode.
    pub fn evaluate(&self, input: &SignalInput, account: &AccountSnapshot) -> RiskDecision {
        self.maybe_reset_daily();
        {
            let mut m = self.metrics.write();
            m.evaluations += 1;
        }

        let decision = match self.gather_and_check(input, account) {
            Ok(decision) => decision,
            Err(e) => {
                let config = self.config.read();
                warn!(
                    user_id = %self.user_id,
                    symbol = %input.symbol,
                    error = %e,
                    failure_mode = ?config.failure_mode,
                    "risk evaluation failed — applying failure mode"
                );
                match config.failure_mode {
                    FailureMode::FailClose => {
                        RiskDecision::reject(format!("evaluator error ({})", e.code()))
                    }
                    FailureMode::FailLimit => {
                        let mut d = RiskDecision::allow(input.size.min(config.fallback_size));
                        d.warning =
                            Some(format!("evaluator error ({}) — size capped", e.code()));
                        d
                    }
                }
            }
        };

        if !decision.allowed {
            self.metrics.write().rejections += 1;
        }
        decision
    }

    fn gather_and_check(
        &self,
        input: &SignalInput,
        account: &AccountSnapshot,
    ) -> Result<RiskDecision, CoreError> {
        let config = self.config.read().clone();
        let override_ = match &input.strategy_id {
            Some(id) => self.store.load_risk_override(id)?,
            None => None,
        };
        let position = self
            .store
            .position_exposure(&self.user_id, &input.symbol)?
            .map(|qty| PositionExposure {
                qty,
                current_price: input.price,
            });
        let metrics = self.metrics.read().clone();
        Ok(check_signal(
            &config,
            override_.as_ref(),
            input,
            position,
            account,
            &metrics,
        ))
    }

    // -------------------------------------------------------------------------
    // Metrics update path (separate from evaluation)
    // -------------------------------------------------------------------------

    /// Fold one realised trade into the daily counters and persist the
    /// incremented aggregates.
    pub fn update_metrics(&self, trade: &crate::types::TradeResult) {
        self.maybe_reset_daily();
        let snapshot = {
            let mut m = self.metrics.write();
            m.record_trade(trade);
            m.clone()
        };
        if let Err(e) = self
            .store
            .record_trade_metrics(&self.user_id, snapshot.date, trade)
        {
            warn!(user_id = %self.user_id, error = %e, "failed to persist daily risk metrics");
        }
        debug!(
            user_id = %self.user_id,
            pnl = trade.pnl,
            daily_pnl = snapshot.daily_pnl,
            daily_trades = snapshot.daily_trades,
            daily_losses = snapshot.daily_losses,
            "trade result recorded"
        );
    }

    /// Snapshot of the current daily metrics.
    pub fn metrics(&self) -> DailyMetrics {
        self.maybe_reset_daily();
        self.metrics.read().clone()
    }

    /// If the civil date has changed, reset the daily counters.
    fn maybe_reset_daily(&self) {
        let today = Local::now().date_naive();
        {
            let m = self.metrics.read();
            if m.date == today {
                return;
            }
        }
        let mut m = self.metrics.write();
        // Double-check after acquiring the write lock.
        if m.date != today {
            debug!(user_id = %self.user_id, old = %m.date, new = %today, "daily risk counters reset");
            m.roll_to(today);
        }
    }
}

// ---------------------------------------------------------------------------
// The pure check pipeline
// ---------------------------------------------------------------------------

/// Run the ordered checks against fully gathered inputs.
pub fn check_signal(
    config: &RiskConfig,
    override_: Option<&RiskOverride>,
    input: &SignalInput,
    position: Option<PositionExposure>,
    account: &AccountSnapshot,
    metrics: &DailyMetrics,
) -> RiskDecision {
    // ── 1. Feature toggles ───────────────────────────────────────────────
    if !config.enabled || override_.map_or(false, |o| o.disable_risk) {
        return RiskDecision::allow(input.size);
    }

    // ── 2. Daily counters ────────────────────────────────────────────────
    if config.use_daily_trade_limit && metrics.daily_trades >= config.max_daily_trades {
        return RiskDecision::reject(format!(
            "daily trade limit reached: {} of {}",
            metrics.daily_trades, config.max_daily_trades
        ));
    }
    if config.use_daily_loss_limit && metrics.daily_losses >= config.max_daily_loss {
        return RiskDecision::reject(format!(
            "daily loss limit reached: {:.2} of {:.2}",
            metrics.daily_losses, config.max_daily_loss
        ));
    }

    let max_position_size = override_
        .and_then(|o| o.max_position_size)
        .unwrap_or(config.max_position_size);

    let mut adjusted_size = input.size;
    let mut warning: Option<String> = None;
    let mut limit_level = LimitLevel::Normal;

    // ── 3. Order notional bounds ─────────────────────────────────────────
    let notional = input.size * input.price;
    if notional < config.min_order_notional {
        return RiskDecision::reject(format!(
            "order notional {notional:.2} below minimum {:.2}",
            config.min_order_notional
        ));
    }
    if notional > config.max_order_notional {
        return RiskDecision::reject(format!(
            "order notional {notional:.2} above maximum {:.2}",
            config.max_order_notional
        ));
    }

    // ── 4. Position-size cap ─────────────────────────────────────────────
    if notional > max_position_size && input.price > 0.0 {
        adjusted_size = max_position_size / input.price;
        warning = Some(format!(
            "size clipped to position cap {max_position_size:.2}"
        ));
        limit_level = LimitLevel::Warning;
    }

    // ── 5. Per-symbol exposure headroom ──────────────────────────────────
    if let Some(pos) = position {
        let current_notional = pos.qty.abs() * pos.current_price;
        if current_notional + adjusted_size * input.price > max_position_size {
            let headroom = max_position_size - current_notional;
            if headroom <= 0.0 {
                return RiskDecision::reject(format!(
                    "symbol exposure {current_notional:.2} already at cap {max_position_size:.2}"
                ));
            }
            adjusted_size = headroom / input.price;
            warning = Some(format!(
                "size clipped to remaining symbol headroom {headroom:.2}"
            ));
            limit_level = LimitLevel::Warning;
        }
    }

    // ── 6. Total exposure ────────────────────────────────────────────────
    if account.total_exposure + adjusted_size * input.price > config.max_total_exposure {
        return RiskDecision::reject(format!(
            "total exposure {:.2} + order would exceed cap {:.2}",
            account.total_exposure, config.max_total_exposure
        ));
    }

    // ── 7. Soft thresholds ───────────────────────────────────────────────
    let usage = metrics.loss_usage(config.max_daily_loss);
    if usage >= config.caution_threshold {
        adjusted_size *= config.caution_size_ratio;
        limit_level = LimitLevel::Caution;
        warning = Some(format!(
            "daily loss usage {:.0}% — size shrunk by {:.0}%",
            usage * 100.0,
            (1.0 - config.caution_size_ratio) * 100.0
        ));
    } else if usage >= config.warning_threshold {
        if limit_level == LimitLevel::Normal {
            limit_level = LimitLevel::Warning;
        }
        warning
            .get_or_insert_with(|| format!("daily loss usage {:.0}%", usage * 100.0));
    }

    // ── 8. Stop-loss / take-profit attachment ────────────────────────────
    let sl_ratio = override_
        .and_then(|o| o.stop_loss_ratio)
        .unwrap_or(config.stop_loss_ratio);
    let tp_ratio = override_
        .and_then(|o| o.take_profit_ratio)
        .unwrap_or(config.take_profit_ratio);
    let (stop_loss, take_profit) = match input.action {
        SignalAction::Buy => (
            Some(input.price * (1.0 - sl_ratio)),
            Some(input.price * (1.0 + tp_ratio)),
        ),
        SignalAction::Sell | SignalAction::PanicSell => (
            Some(input.price * (1.0 + sl_ratio)),
            Some(input.price * (1.0 - tp_ratio)),
        ),
        SignalAction::Hold => (None, None),
    };

    RiskDecision {
        allowed: true,
        reason: None,
        warning,
        limit_level,
        adjusted_size,
        stop_loss,
        take_profit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn input(action: SignalAction, size: f64, price: f64) -> SignalInput {
        SignalInput {
            symbol: "BTCUSDT".into(),
            action,
            size,
            price,
            strategy_id: None,
            user_id: "u1".into(),
        }
    }

    fn metrics() -> DailyMetrics {
        DailyMetrics::new_for(NaiveDate::from_ymd_opt(2026, 1, 5).unwrap())
    }

    fn account() -> AccountSnapshot {
        AccountSnapshot {
            equity: 100_000.0,
            total_exposure: 0.0,
        }
    }

    #[test]
    fn disabled_risk_passes_through() {
        let mut cfg = RiskConfig::default();
        cfg.enabled = false;
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 3.0, 100.0),
            None,
            &account(),
            &metrics(),
        );
        assert!(d.allowed);
        assert_eq!(d.limit_level, LimitLevel::Normal);
        assert_eq!(d.adjusted_size, 3.0);
        assert!(d.stop_loss.is_none());
    }

    #[test]
    fn daily_trade_limit_rejects() {
        let cfg = RiskConfig::default();
        let mut m = metrics();
        m.daily_trades = cfg.max_daily_trades;
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 1.0, 100.0),
            None,
            &account(),
            &m,
        );
        assert!(!d.allowed);
        assert_eq!(d.limit_level, LimitLevel::Limit);
    }

    #[test]
    fn notional_bounds_reject_not_clip() {
        let cfg = RiskConfig::default();
        let low = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 0.01, 100.0),
            None,
            &account(),
            &metrics(),
        );
        assert!(!low.allowed);
        let high = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 2_000.0, 100.0),
            None,
            &account(),
            &metrics(),
        );
        assert!(!high.allowed);
    }

    #[test]
    fn position_cap_clips_size() {
        let mut cfg = RiskConfig::default();
        cfg.max_position_size = 1_000.0;
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 20.0, 100.0),
            None,
            &account(),
            &metrics(),
        );
        assert!(d.allowed);
        assert!((d.adjusted_size - 10.0).abs() < 1e-12);
        assert_eq!(d.limit_level, LimitLevel::Warning);
        assert!(d.warning.is_some());
    }

    #[test]
    fn symbol_headroom_clips_or_rejects() {
        let mut cfg = RiskConfig::default();
        cfg.max_position_size = 1_000.0;
        let pos = PositionExposure {
            qty: 6.0,
            current_price: 100.0,
        };
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 8.0, 100.0),
            Some(pos),
            &account(),
            &metrics(),
        );
        assert!(d.allowed);
        assert!((d.adjusted_size - 4.0).abs() < 1e-12);

        let full = PositionExposure {
            qty: 10.0,
            current_price: 100.0,
        };
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 1.0, 100.0),
            Some(full),
            &account(),
            &metrics(),
        );
        assert!(!d.allowed);
    }

    #[test]
    fn total_exposure_rejects() {
        let mut cfg = RiskConfig::default();
        cfg.max_total_exposure = 5_000.0;
        let acct = AccountSnapshot {
            equity: 100_000.0,
            total_exposure: 4_950.0,
        };
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 1.0, 100.0),
            None,
            &acct,
            &metrics(),
        );
        assert!(!d.allowed);
    }

    #[test]
    fn soft_limit_caution_shrinks_size() {
        // max_daily_loss=500, losses=460 => usage 92% => CAUTION, size halved.
        let mut cfg = RiskConfig::default();
        cfg.max_daily_loss = 500.0;
        let mut m = metrics();
        m.daily_losses = 460.0;
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 1.0, 100.0),
            None,
            &account(),
            &m,
        );
        assert!(d.allowed);
        assert!((d.adjusted_size - 0.5).abs() < 1e-12);
        assert_eq!(d.limit_level, LimitLevel::Caution);
    }

    #[test]
    fn soft_limit_warning_keeps_size() {
        let mut cfg = RiskConfig::default();
        cfg.max_daily_loss = 500.0;
        let mut m = metrics();
        m.daily_losses = 410.0; // 82%
        let d = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 1.0, 100.0),
            None,
            &account(),
            &m,
        );
        assert!(d.allowed);
        assert!((d.adjusted_size - 1.0).abs() < 1e-12);
        assert_eq!(d.limit_level, LimitLevel::Warning);
    }

    #[test]
    fn stop_loss_take_profit_attachment() {
        let cfg = RiskConfig::default();
        let buy = check_signal(
            &cfg,
            None,
            &input(SignalAction::Buy, 1.0, 100.0),
            None,
            &account(),
            &metrics(),
        );
        assert!((buy.stop_loss.unwrap() - 98.0).abs() < 1e-9);
        assert!((buy.take_profit.unwrap() - 104.0).abs() < 1e-9);

        let sell = check_signal(
            &cfg,
            None,
            &input(SignalAction::Sell, 1.0, 100.0),
            None,
            &account(),
            &metrics(),
        );
        assert!((sell.stop_loss.unwrap() - 102.0).abs() < 1e-9);
        assert!((sell.take_profit.unwrap() - 96.0).abs() < 1e-9);
    }

    #[test]
    fn override_disable_skips_all_checks() {
        let cfg = RiskConfig::default();
        let ov = RiskOverride {
            disable_risk: true,
            ..Default::default()
        };
        let mut m = metrics();
        m.daily_trades = 1_000;
        let d = check_signal(
            &cfg,
            Some(&ov),
            &input(SignalAction::Buy, 1.0, 100.0),
            None,
            &account(),
            &m,
        );
        assert!(d.allowed);
        assert_eq!(d.adjusted_size, 1.0);
    }

    #[test]
    fn reducing_position_cap_never_increases_size() {
        // Monotonicity: shrinking max_position_size can only shrink output.
        let m = metrics();
        let sig = input(SignalAction::Buy, 50.0, 100.0);
        let mut prev = f64::INFINITY;
        for cap in [100_000.0, 10_000.0, 4_000.0, 1_000.0, 100.0] {
            let mut cfg = RiskConfig::default();
            cfg.max_position_size = cap;
            let d = check_signal(&cfg, None, &sig, None, &account(), &m);
            let size = if d.allowed { d.adjusted_size } else { 0.0 };
            assert!(
                size <= prev + 1e-12,
                "cap {cap}: size {size} grew past {prev}"
            );
            prev = size;
        }
    }
}
