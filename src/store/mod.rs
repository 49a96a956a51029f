// =============================================================================
// Persistence Store — SQLite backing for strategies, orders, positions,
// credentials, and daily risk aggregates
// =============================================================================
//
// One connection behind a Mutex: the store is an external serialisable
// database from the core's point of view, one statement per logical
// operation. Migrations are idempotent and run at open.
//
// The canonical position representation is the per-(user, strategy, symbol)
// row; the global per-symbol view is derived by aggregation in the query
// layer. Manual and reconciliation-owned quantities live under an empty
// strategy id.
// =============================================================================

use std::path::Path;

use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use tracing::{debug, info};

use crate::errors::CoreError;
use crate::position::{apply_fill, FillOutcome, PositionState};
use crate::risk::{DailyMetrics, RiskOverride};
use crate::types::{
    ConnectionRecord, Order, OrderSide, OrderStatus, OrderType, StrategyDefinition, StrategyStatus,
    TradeResult,
};

/// A derived per-symbol position view (aggregated over strategies).
#[derive(Debug, Clone, Serialize)]
pub struct SymbolPosition {
    pub symbol: String,
    pub qty: f64,
    pub avg_price: f64,
    pub synthetic_price: bool,
}

/// One row of the daily performance aggregation.
#[derive(Debug, Clone, Serialize)]
pub struct DailyPerformance {
    pub date: String,
    pub pnl: f64,
    pub trades: u32,
    pub volume: f64,
}

/// A reconciliation audit entry.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileAudit {
    pub user_id: String,
    pub symbol: String,
    pub local_qty: f64,
    pub venue_qty: f64,
    pub difference: f64,
    pub synced: bool,
    pub synthetic_price: bool,
    pub at: String,
}

/// SQLite-backed persistence store.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) the database at `path` and run migrations.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| CoreError::Persistence(format!("open failed: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        info!(path = %path.as_ref().display(), "store opened");
        Ok(store)
    }

    /// In-memory store for tests and dry-run mode.
    pub fn open_in_memory() -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::Persistence(format!("open failed: {e}")))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS strategies (
                id            TEXT PRIMARY KEY,
                strategy_type TEXT NOT NULL,
                symbol        TEXT NOT NULL,
                interval      TEXT NOT NULL,
                params        TEXT NOT NULL,
                user_id       TEXT,
                connection_id TEXT,
                status        TEXT NOT NULL,
                updated_at    TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS strategy_state (
                strategy_id TEXT PRIMARY KEY,
                state       TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS orders (
                id             TEXT PRIMARY KEY,
                strategy_id    TEXT,
                user_id        TEXT NOT NULL,
                connection_id  TEXT NOT NULL,
                symbol         TEXT NOT NULL,
                side           TEXT NOT NULL,
                order_type     TEXT NOT NULL,
                price          REAL NOT NULL,
                qty            REAL NOT NULL,
                filled_qty     REAL NOT NULL DEFAULT 0,
                status         TEXT NOT NULL,
                venue_order_id TEXT,
                created_at     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_orders_user   ON orders(user_id);
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
            CREATE TABLE IF NOT EXISTS positions (
                user_id         TEXT NOT NULL,
                strategy_id     TEXT NOT NULL DEFAULT '',
                symbol          TEXT NOT NULL,
                qty             REAL NOT NULL DEFAULT 0,
                avg_price       REAL NOT NULL DEFAULT 0,
                realized_pnl    REAL NOT NULL DEFAULT 0,
                synthetic_price INTEGER NOT NULL DEFAULT 0,
                updated_at      TEXT NOT NULL,
                PRIMARY KEY (user_id, strategy_id, symbol)
            );
            CREATE TABLE IF NOT EXISTS risk_overrides (
                strategy_id TEXT PRIMARY KEY,
                config      TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS risk_metrics_daily (
                user_id            TEXT NOT NULL,
                date               TEXT NOT NULL,
                daily_pnl          REAL NOT NULL DEFAULT 0,
                daily_trades       INTEGER NOT NULL DEFAULT 0,
                daily_losses       REAL NOT NULL DEFAULT 0,
                total_realized_pnl REAL NOT NULL DEFAULT 0,
                max_drawdown       REAL NOT NULL DEFAULT 0,
                max_profit         REAL NOT NULL DEFAULT 0,
                PRIMARY KEY (user_id, date)
            );
            CREATE TABLE IF NOT EXISTS connections (
                id                   TEXT PRIMARY KEY,
                user_id              TEXT NOT NULL,
                exchange_type        TEXT NOT NULL,
                name                 TEXT NOT NULL,
                encrypted_api_key    TEXT NOT NULL,
                encrypted_api_secret TEXT NOT NULL,
                key_version          INTEGER NOT NULL,
                active               INTEGER NOT NULL DEFAULT 1,
                created_at           TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_connections_user ON connections(user_id);
            CREATE TABLE IF NOT EXISTS fills (
                id       INTEGER PRIMARY KEY AUTOINCREMENT,
                order_id TEXT NOT NULL,
                user_id  TEXT NOT NULL,
                symbol   TEXT NOT NULL,
                side     TEXT NOT NULL,
                qty      REAL NOT NULL,
                price    REAL NOT NULL,
                fee      REAL NOT NULL DEFAULT 0,
                pnl      REAL NOT NULL DEFAULT 0,
                ts       TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_fills_user ON fills(user_id);
            CREATE TABLE IF NOT EXISTS reconcile_audit (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id         TEXT NOT NULL,
                symbol          TEXT NOT NULL,
                local_qty       REAL NOT NULL,
                venue_qty       REAL NOT NULL,
                difference      REAL NOT NULL,
                synced          INTEGER NOT NULL,
                synthetic_price INTEGER NOT NULL,
                at              TEXT NOT NULL
            );",
        )?;
        debug!("store migrations applied");
        Ok(())
    }

    fn require_user(user_id: &str) -> Result<(), CoreError> {
        if user_id.is_empty() {
            return Err(CoreError::UserIdRequired);
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Strategies
    // -------------------------------------------------------------------------

    pub fn upsert_strategy(&self, def: &StrategyDefinition) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategies
                (id, strategy_type, symbol, interval, params, user_id, connection_id, status, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                strategy_type = excluded.strategy_type,
                symbol        = excluded.symbol,
                interval      = excluded.interval,
                params        = excluded.params,
                user_id       = excluded.user_id,
                connection_id = excluded.connection_id,
                status        = excluded.status,
                updated_at    = excluded.updated_at",
            params![
                def.id,
                def.strategy_type,
                def.symbol,
                def.interval,
                def.params.to_string(),
                def.user_id,
                def.connection_id,
                def.status.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_strategy(&self, id: &str) -> Result<Option<StrategyDefinition>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_type, symbol, interval, params, user_id, connection_id, status
             FROM strategies WHERE id = ?1",
        )?;
        let def = stmt
            .query_row(params![id], Self::row_to_strategy)
            .optional()?;
        def.transpose().map_err(Into::into)
    }

    /// Load every instance whose status is in `statuses`.
    pub fn load_strategies(
        &self,
        statuses: &[StrategyStatus],
    ) -> Result<Vec<StrategyDefinition>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_type, symbol, interval, params, user_id, connection_id, status
             FROM strategies",
        )?;
        let rows = stmt.query_map([], Self::row_to_strategy)?;
        let mut out = Vec::new();
        for row in rows {
            let def = row??;
            if statuses.contains(&def.status) {
                out.push(def);
            }
        }
        Ok(out)
    }

    pub fn strategies_for_user(&self, user_id: &str) -> Result<Vec<StrategyDefinition>, CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_type, symbol, interval, params, user_id, connection_id, status
             FROM strategies WHERE user_id = ?1",
        )?;
        let rows = stmt.query_map(params![user_id], Self::row_to_strategy)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    pub fn set_strategy_status(&self, id: &str, status: StrategyStatus) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE strategies SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("strategy {id}")));
        }
        Ok(())
    }

    pub fn update_strategy_params(
        &self,
        id: &str,
        params_json: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE strategies SET params = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, params_json.to_string(), Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(CoreError::NotFound(format!("strategy {id}")));
        }
        Ok(())
    }

    fn row_to_strategy(
        row: &rusqlite::Row<'_>,
    ) -> rusqlite::Result<Result<StrategyDefinition, CoreError>> {
        let params_raw: String = row.get(4)?;
        let status_raw: String = row.get(7)?;
        Ok((|| {
            let params: serde_json::Value = serde_json::from_str(&params_raw)?;
            let status = match status_raw.as_str() {
                "ACTIVE" => StrategyStatus::Active,
                "PAUSED" => StrategyStatus::Paused,
                "STOPPED" => StrategyStatus::Stopped,
                other => {
                    return Err(CoreError::Persistence(format!(
                        "unknown strategy status '{other}'"
                    )))
                }
            };
            Ok(StrategyDefinition {
                id: row.get(0)?,
                strategy_type: row.get(1)?,
                symbol: row.get(2)?,
                interval: row.get(3)?,
                params,
                user_id: row.get(5)?,
                connection_id: row.get(6)?,
                status,
            })
        })())
    }

    // -------------------------------------------------------------------------
    // Strategy state blobs
    // -------------------------------------------------------------------------

    pub fn save_strategy_state(
        &self,
        strategy_id: &str,
        state: &serde_json::Value,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO strategy_state (strategy_id, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(strategy_id) DO UPDATE SET
                state = excluded.state, updated_at = excluded.updated_at",
            params![strategy_id, state.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn load_strategy_state(
        &self,
        strategy_id: &str,
    ) -> Result<Option<serde_json::Value>, CoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT state FROM strategy_state WHERE strategy_id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    pub fn insert_order(&self, order: &Order) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO orders
                (id, strategy_id, user_id, connection_id, symbol, side, order_type,
                 price, qty, filled_qty, status, venue_order_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                order.id,
                order.strategy_id,
                order.user_id,
                order.connection_id,
                order.symbol,
                order.side.to_string(),
                order.order_type.to_string(),
                order.price,
                order.qty,
                order.filled_qty,
                order.status.to_string(),
                order.venue_order_id,
                order.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Update order fill progress. Terminal statuses are monotone: a row
    /// already terminal is never mutated; returns whether a change applied.
    pub fn update_order_fill(
        &self,
        order_id: &str,
        status: OrderStatus,
        filled_qty: f64,
        venue_order_id: Option<&str>,
    ) -> Result<bool, CoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE orders
             SET status = ?2,
                 filled_qty = MIN(MAX(filled_qty, ?3), qty),
                 venue_order_id = COALESCE(?4, venue_order_id)
             WHERE id = ?1
               AND status NOT IN ('FILLED', 'CANCELED', 'REJECTED', 'EXPIRED')",
            params![order_id, status.to_string(), filled_qty, venue_order_id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_order(&self, id: &str) -> Result<Option<Order>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, user_id, connection_id, symbol, side, order_type,
                    price, qty, filled_qty, status, venue_order_id, created_at
             FROM orders WHERE id = ?1",
        )?;
        let order = stmt.query_row(params![id], Self::row_to_order).optional()?;
        order.transpose().map_err(Into::into)
    }

    pub fn open_orders(&self, user_id: Option<&str>) -> Result<Vec<Order>, CoreError> {
        let conn = self.conn.lock();
        let mut out = Vec::new();
        match user_id {
            Some(uid) => {
                Self::require_user(uid)?;
                let mut stmt = conn.prepare(
                    "SELECT id, strategy_id, user_id, connection_id, symbol, side, order_type,
                            price, qty, filled_qty, status, venue_order_id, created_at
                     FROM orders WHERE status IN ('NEW', 'PARTIAL', 'UNKNOWN') AND user_id = ?1",
                )?;
                let rows = stmt.query_map(params![uid], Self::row_to_order)?;
                for row in rows {
                    out.push(row??);
                }
            }
            None => {
                let mut stmt = conn.prepare(
                    "SELECT id, strategy_id, user_id, connection_id, symbol, side, order_type,
                            price, qty, filled_qty, status, venue_order_id, created_at
                     FROM orders WHERE status IN ('NEW', 'PARTIAL', 'UNKNOWN')",
                )?;
                let rows = stmt.query_map([], Self::row_to_order)?;
                for row in rows {
                    out.push(row??);
                }
            }
        }
        Ok(out)
    }

    pub fn orders_for_strategy(&self, strategy_id: &str) -> Result<Vec<Order>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, strategy_id, user_id, connection_id, symbol, side, order_type,
                    price, qty, filled_qty, status, venue_order_id, created_at
             FROM orders WHERE strategy_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![strategy_id], Self::row_to_order)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }

    fn row_to_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Order, CoreError>> {
        let side_raw: String = row.get(5)?;
        let type_raw: String = row.get(6)?;
        let status_raw: String = row.get(10)?;
        let created_raw: String = row.get(12)?;
        Ok((|| {
            let side = match side_raw.as_str() {
                "BUY" => OrderSide::Buy,
                "SELL" => OrderSide::Sell,
                other => {
                    return Err(CoreError::Persistence(format!("unknown side '{other}'")))
                }
            };
            let order_type = match type_raw.as_str() {
                "MARKET" => OrderType::Market,
                "LIMIT" => OrderType::Limit,
                "STOP_LOSS" => OrderType::StopLoss,
                "STOP_LOSS_LIMIT" => OrderType::StopLossLimit,
                "TAKE_PROFIT" => OrderType::TakeProfit,
                "TAKE_PROFIT_LIMIT" => OrderType::TakeProfitLimit,
                "LIMIT_MAKER" => OrderType::LimitMaker,
                "TRAILING_STOP" => OrderType::TrailingStop,
                other => {
                    return Err(CoreError::Persistence(format!(
                        "unknown order type '{other}'"
                    )))
                }
            };
            let created_at = DateTime::parse_from_rfc3339(&created_raw)
                .map_err(|e| CoreError::Persistence(format!("bad created_at: {e}")))?
                .with_timezone(&Utc);
            Ok(Order {
                id: row.get(0)?,
                strategy_id: row.get(1)?,
                user_id: row.get(2)?,
                connection_id: row.get(3)?,
                symbol: row.get(4)?,
                side,
                order_type,
                price: row.get(7)?,
                qty: row.get(8)?,
                filled_qty: row.get(9)?,
                status: OrderStatus::from_venue(&status_raw),
                venue_order_id: row.get(11)?,
                created_at,
            })
        })())
    }

    // -------------------------------------------------------------------------
    // Positions (canonical per-strategy rows; global view derived)
    // -------------------------------------------------------------------------

    /// Apply a fill to the canonical position row inside one transaction.
    /// Writes for the same (user, symbol) are serialised by the connection
    /// mutex.
    pub fn apply_position_fill(
        &self,
        user_id: &str,
        strategy_id: Option<&str>,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        price: f64,
    ) -> Result<FillOutcome, CoreError> {
        Self::require_user(user_id)?;
        let sid = strategy_id.unwrap_or("");
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let existing: Option<(f64, f64, f64)> = tx
            .query_row(
                "SELECT qty, avg_price, realized_pnl FROM positions
                 WHERE user_id = ?1 AND strategy_id = ?2 AND symbol = ?3",
                params![user_id, sid, symbol],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;
        let state = existing
            .map(|(qty, avg_price, realized_pnl)| PositionState {
                qty,
                avg_price,
                realized_pnl,
            })
            .unwrap_or_default();
        let outcome = apply_fill(state, side, qty, price);
        tx.execute(
            "INSERT INTO positions
                (user_id, strategy_id, symbol, qty, avg_price, realized_pnl, synthetic_price, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT(user_id, strategy_id, symbol) DO UPDATE SET
                qty = excluded.qty,
                avg_price = excluded.avg_price,
                realized_pnl = excluded.realized_pnl,
                synthetic_price = 0,
                updated_at = excluded.updated_at",
            params![
                user_id,
                sid,
                symbol,
                outcome.state.qty,
                outcome.state.avg_price,
                outcome.state.realized_pnl,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(outcome)
    }

    pub fn position_for(
        &self,
        user_id: &str,
        strategy_id: Option<&str>,
        symbol: &str,
    ) -> Result<Option<PositionState>, CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT qty, avg_price, realized_pnl FROM positions
                 WHERE user_id = ?1 AND strategy_id = ?2 AND symbol = ?3",
                params![user_id, strategy_id.unwrap_or(""), symbol],
                |row| {
                    Ok(PositionState {
                        qty: row.get(0)?,
                        avg_price: row.get(1)?,
                        realized_pnl: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Per-strategy position qty + symbol lookup (panic path).
    pub fn position_for_strategy(
        &self,
        strategy_id: &str,
    ) -> Result<Option<(String, PositionState)>, CoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT symbol, qty, avg_price, realized_pnl FROM positions
                 WHERE strategy_id = ?1 AND ABS(qty) > 0",
                params![strategy_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        PositionState {
                            qty: row.get(1)?,
                            avg_price: row.get(2)?,
                            realized_pnl: row.get(3)?,
                        },
                    ))
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Cumulative realised PnL over a strategy's position rows.
    pub fn realized_pnl_for_strategy(&self, strategy_id: &str) -> Result<f64, CoreError> {
        let conn = self.conn.lock();
        let pnl: Option<f64> = conn
            .query_row(
                "SELECT SUM(realized_pnl) FROM positions WHERE strategy_id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(pnl.unwrap_or(0.0))
    }

    /// Net exposure qty for (user, symbol), aggregated across strategies.
    pub fn position_exposure(&self, user_id: &str, symbol: &str) -> Result<Option<f64>, CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        let qty: Option<f64> = conn
            .query_row(
                "SELECT SUM(qty) FROM positions WHERE user_id = ?1 AND symbol = ?2",
                params![user_id, symbol],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        Ok(qty.filter(|q| q.abs() > 0.0))
    }

    /// Derived global per-symbol view for one user.
    pub fn global_positions(&self, user_id: &str) -> Result<Vec<SymbolPosition>, CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT symbol,
                    SUM(qty),
                    SUM(avg_price * ABS(qty)),
                    SUM(ABS(qty)),
                    MAX(synthetic_price)
             FROM positions WHERE user_id = ?1 GROUP BY symbol",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            let symbol: String = row.get(0)?;
            let qty: f64 = row.get::<_, Option<f64>>(1)?.unwrap_or(0.0);
            let weighted: f64 = row.get::<_, Option<f64>>(2)?.unwrap_or(0.0);
            let abs_qty: f64 = row.get::<_, Option<f64>>(3)?.unwrap_or(0.0);
            let synthetic: i64 = row.get::<_, Option<i64>>(4)?.unwrap_or(0);
            Ok(SymbolPosition {
                symbol,
                qty,
                avg_price: if abs_qty > 0.0 { weighted / abs_qty } else { 0.0 },
                synthetic_price: synthetic != 0,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Overwrite the user's net qty for `symbol` to `venue_qty` by adjusting
    /// the unattributed row. Used by reconciliation auto-sync.
    pub fn sync_position_qty(
        &self,
        user_id: &str,
        symbol: &str,
        venue_qty: f64,
        avg_price: f64,
        synthetic_price: bool,
    ) -> Result<(), CoreError> {
        Self::require_user(user_id)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let attributed: f64 = tx
            .query_row(
                "SELECT SUM(qty) FROM positions
                 WHERE user_id = ?1 AND symbol = ?2 AND strategy_id != ''",
                params![user_id, symbol],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?
            .flatten()
            .unwrap_or(0.0);
        let unattributed = venue_qty - attributed;
        tx.execute(
            "INSERT INTO positions
                (user_id, strategy_id, symbol, qty, avg_price, realized_pnl, synthetic_price, updated_at)
             VALUES (?1, '', ?2, ?3, ?4, 0, ?5, ?6)
             ON CONFLICT(user_id, strategy_id, symbol) DO UPDATE SET
                qty = excluded.qty,
                avg_price = excluded.avg_price,
                synthetic_price = excluded.synthetic_price,
                updated_at = excluded.updated_at",
            params![
                user_id,
                symbol,
                unattributed,
                avg_price,
                synthetic_price as i64,
                Utc::now().to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Risk overrides and daily metrics
    // -------------------------------------------------------------------------

    pub fn save_risk_override(
        &self,
        strategy_id: &str,
        override_: &RiskOverride,
    ) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO risk_overrides (strategy_id, config) VALUES (?1, ?2)
             ON CONFLICT(strategy_id) DO UPDATE SET config = excluded.config",
            params![strategy_id, serde_json::to_string(override_)?],
        )?;
        Ok(())
    }

    pub fn load_risk_override(&self, strategy_id: &str) -> Result<Option<RiskOverride>, CoreError> {
        let conn = self.conn.lock();
        let raw: Option<String> = conn
            .query_row(
                "SELECT config FROM risk_overrides WHERE strategy_id = ?1",
                params![strategy_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    /// Fold one realised trade into the daily aggregates row. The upsert
    /// increments counters so concurrent writers cannot lose updates.
    pub fn record_trade_metrics(
        &self,
        user_id: &str,
        date: NaiveDate,
        trade: &TradeResult,
    ) -> Result<(), CoreError> {
        Self::require_user(user_id)?;
        let loss = if trade.pnl < 0.0 { -trade.pnl } else { 0.0 };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO risk_metrics_daily
                (user_id, date, daily_pnl, daily_trades, daily_losses,
                 total_realized_pnl, max_drawdown, max_profit)
             VALUES (?1, ?2, ?3, 1, ?4, ?3, MAX(0.0, -?3), MAX(0.0, ?3))
             ON CONFLICT(user_id, date) DO UPDATE SET
                daily_pnl          = daily_pnl + excluded.daily_pnl,
                daily_trades       = daily_trades + 1,
                daily_losses       = daily_losses + excluded.daily_losses,
                total_realized_pnl = total_realized_pnl + excluded.daily_pnl,
                max_profit         = MAX(max_profit, total_realized_pnl + excluded.daily_pnl),
                max_drawdown       = MAX(max_drawdown,
                                         MAX(max_profit, total_realized_pnl + excluded.daily_pnl)
                                         - (total_realized_pnl + excluded.daily_pnl))",
            params![user_id, date.to_string(), trade.pnl, loss],
        )?;
        Ok(())
    }

    pub fn load_daily_metrics(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Option<DailyMetrics>, CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT daily_pnl, daily_trades, daily_losses,
                        total_realized_pnl, max_drawdown, max_profit
                 FROM risk_metrics_daily WHERE user_id = ?1 AND date = ?2",
                params![user_id, date.to_string()],
                |row| {
                    let mut m = DailyMetrics::new_for(date);
                    m.daily_pnl = row.get(0)?;
                    m.daily_trades = row.get(1)?;
                    m.daily_losses = row.get(2)?;
                    m.total_realized_pnl = row.get(3)?;
                    m.max_drawdown = row.get(4)?;
                    m.max_profit = row.get(5)?;
                    Ok(m)
                },
            )
            .optional()?;
        Ok(row)
    }

    // -------------------------------------------------------------------------
    // Connections
    // -------------------------------------------------------------------------

    pub fn upsert_connection(&self, rec: &ConnectionRecord) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO connections
                (id, user_id, exchange_type, name, encrypted_api_key,
                 encrypted_api_secret, key_version, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                exchange_type        = excluded.exchange_type,
                name                 = excluded.name,
                encrypted_api_key    = excluded.encrypted_api_key,
                encrypted_api_secret = excluded.encrypted_api_secret,
                key_version          = excluded.key_version,
                active               = excluded.active",
            params![
                rec.id,
                rec.user_id,
                rec.exchange_type,
                rec.name,
                rec.encrypted_api_key,
                rec.encrypted_api_secret,
                rec.key_version,
                rec.active as i64,
                rec.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_connection(&self, id: &str) -> Result<Option<ConnectionRecord>, CoreError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT id, user_id, exchange_type, name, encrypted_api_key,
                        encrypted_api_secret, key_version, active, created_at
                 FROM connections WHERE id = ?1",
                params![id],
                |row| {
                    let created_raw: String = row.get(8)?;
                    Ok((
                        ConnectionRecord {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            exchange_type: row.get(2)?,
                            name: row.get(3)?,
                            encrypted_api_key: row.get(4)?,
                            encrypted_api_secret: row.get(5)?,
                            key_version: row.get(6)?,
                            active: row.get::<_, i64>(7)? != 0,
                            created_at: Utc::now(),
                        },
                        created_raw,
                    ))
                },
            )
            .optional()?;
        match row {
            Some((mut rec, created_raw)) => {
                rec.created_at = DateTime::parse_from_rfc3339(&created_raw)
                    .map_err(|e| CoreError::Persistence(format!("bad created_at: {e}")))?
                    .with_timezone(&Utc);
                Ok(Some(rec))
            }
            None => Ok(None),
        }
    }

    /// Every active connection, for the reconciliation and balance-sync
    /// loops.
    pub fn list_active_connections(&self) -> Result<Vec<ConnectionRecord>, CoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, exchange_type, name, encrypted_api_key,
                    encrypted_api_secret, key_version, active, created_at
             FROM connections WHERE active = 1",
        )?;
        let rows = stmt.query_map([], |row| {
            let created_raw: String = row.get(8)?;
            Ok((
                ConnectionRecord {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    exchange_type: row.get(2)?,
                    name: row.get(3)?,
                    encrypted_api_key: row.get(4)?,
                    encrypted_api_secret: row.get(5)?,
                    key_version: row.get(6)?,
                    active: row.get::<_, i64>(7)? != 0,
                    created_at: Utc::now(),
                },
                created_raw,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (mut rec, created_raw) = row?;
            rec.created_at = DateTime::parse_from_rfc3339(&created_raw)
                .map_err(|e| CoreError::Persistence(format!("bad created_at: {e}")))?
                .with_timezone(&Utc);
            out.push(rec);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Fills and performance
    // -------------------------------------------------------------------------

    pub fn record_fill(
        &self,
        order_id: &str,
        user_id: &str,
        trade: &TradeResult,
    ) -> Result<(), CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fills (order_id, user_id, symbol, side, qty, price, fee, pnl, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                order_id,
                user_id,
                trade.symbol,
                trade.side.to_string(),
                trade.size,
                trade.price,
                trade.fee,
                trade.pnl,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Daily P/L aggregation: fills joined with orders, grouped by civil day.
    pub fn daily_performance(
        &self,
        user_id: &str,
        days: u32,
    ) -> Result<Vec<DailyPerformance>, CoreError> {
        Self::require_user(user_id)?;
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DATE(f.ts), SUM(f.pnl), COUNT(*), SUM(f.qty * f.price)
             FROM fills f JOIN orders o ON o.id = f.order_id
             WHERE o.user_id = ?1
             GROUP BY DATE(f.ts)
             ORDER BY DATE(f.ts) DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![user_id, days], |row| {
            Ok(DailyPerformance {
                date: row.get(0)?,
                pnl: row.get(1)?,
                trades: row.get(2)?,
                volume: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -------------------------------------------------------------------------
    // Reconciliation audit
    // -------------------------------------------------------------------------

    pub fn record_reconcile_audit(&self, entry: &ReconcileAudit) -> Result<(), CoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO reconcile_audit
                (user_id, symbol, local_qty, venue_qty, difference, synced, synthetic_price, at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                entry.user_id,
                entry.symbol,
                entry.local_qty,
                entry.venue_qty,
                entry.difference,
                entry.synced as i64,
                entry.synthetic_price as i64,
                entry.at,
            ],
        )?;
        Ok(())
    }
}
