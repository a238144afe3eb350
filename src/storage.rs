//! Persistence collaborator and its SQLite implementation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};

use crate::error::StoreError;
use crate::logging::{log, obj, v_num, v_str, Domain, Level};
use crate::types::{
    AccountState, DetectedBy, PortfolioAllocation, Position, RebalanceAction, RebalanceEvent, Regime,
    RegimeSnapshot, RegimeState,
};

pub type StoreResult<T> = Result<T, StoreError>;

/// Everything one evaluate() writes. Applied all-or-nothing.
#[derive(Debug, Clone)]
pub struct CycleCommit {
    /// Version the account had when the cycle read it.
    pub expected_version: u64,
    pub account: AccountState,
    pub regime: RegimeState,
    pub allocation: PortfolioAllocation,
    pub event: RebalanceEvent,
}

pub trait Persistence: Send {
    fn load_account_state(&self, account_id: &str) -> StoreResult<Option<AccountState>>;
    fn save_account_state(&mut self, account: &AccountState) -> StoreResult<()>;
    fn load_regime_state(&self, account_id: &str) -> StoreResult<Option<RegimeState>>;
    /// Overwrite the current state and append it to the detection history.
    fn save_regime_state(&mut self, account_id: &str, state: &RegimeState) -> StoreResult<()>;
    fn load_allocation(&self, account_id: &str) -> StoreResult<Option<PortfolioAllocation>>;
    fn append_rebalance_event(&mut self, account_id: &str, event: &RebalanceEvent) -> StoreResult<()>;
    /// Oldest first.
    fn list_rebalance_events(&self, account_id: &str) -> StoreResult<Vec<RebalanceEvent>>;
    fn last_rebalance_event(&self, account_id: &str) -> StoreResult<Option<RebalanceEvent>>;
    /// Newest first, at most `limit` rows.
    fn list_regime_history(&self, account_id: &str, limit: usize) -> StoreResult<Vec<RegimeSnapshot>>;
    /// Apply a whole cycle atomically; fails with `VersionConflict` if the
    /// account moved since it was read.
    fn commit(&mut self, account_id: &str, commit: &CycleCommit) -> StoreResult<()>;
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(path: &str) -> StoreResult<Self> {
        Ok(Self { conn: Connection::open(path)? })
    }

    pub fn in_memory() -> StoreResult<Self> {
        Ok(Self { conn: Connection::open_in_memory()? })
    }

    pub fn init(&mut self) -> StoreResult<()> {
        self.conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS accounts (
                account_id TEXT PRIMARY KEY,
                deployed INTEGER NOT NULL,
                starting_capital REAL NOT NULL,
                portfolio_value REAL NOT NULL,
                last_level INTEGER,
                version INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS regime_state (
                account_id TEXT PRIMARY KEY,
                level INTEGER NOT NULL,
                regime TEXT NOT NULL,
                z_score REAL NOT NULL,
                current_vol REAL NOT NULL,
                baseline_mean REAL NOT NULL,
                baseline_std REAL NOT NULL,
                detected_by TEXT NOT NULL,
                as_of TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS regime_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                level INTEGER NOT NULL,
                z_score REAL NOT NULL,
                current_vol REAL NOT NULL,
                detected_by TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS allocations (
                account_id TEXT PRIMARY KEY,
                portfolio_value REAL NOT NULL,
                positions TEXT NOT NULL,
                as_of TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS rebalance_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                ts TEXT NOT NULL,
                action TEXT NOT NULL,
                previous_level INTEGER,
                new_level INTEGER NOT NULL,
                z_score REAL NOT NULL,
                allocation TEXT NOT NULL,
                value_before REAL NOT NULL,
                value_after REAL NOT NULL,
                reasoning TEXT NOT NULL,
                digest TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_events_account ON rebalance_events(account_id, id);
            CREATE INDEX IF NOT EXISTS idx_history_account ON regime_history(account_id, id);
            COMMIT;",
        )?;
        Ok(())
    }
}

fn ts_text(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}

fn level_to_regime(level: i64) -> Option<Regime> {
    u8::try_from(level).ok().and_then(Regime::from_level)
}

fn upsert_account(tx: &Transaction<'_>, a: &AccountState) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO accounts (account_id, deployed, starting_capital, portfolio_value, last_level, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(account_id) DO UPDATE SET
            deployed = excluded.deployed,
            starting_capital = excluded.starting_capital,
            portfolio_value = excluded.portfolio_value,
            last_level = excluded.last_level,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![
            a.account_id,
            a.deployed,
            a.starting_capital,
            a.portfolio_value,
            a.last_regime.map(|r| r.level() as i64),
            a.version as i64,
            ts_text(&a.updated_at),
        ],
    )?;
    Ok(())
}

fn write_regime(tx: &Transaction<'_>, account_id: &str, s: &RegimeState) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO regime_state (account_id, level, regime, z_score, current_vol, baseline_mean, baseline_std, detected_by, as_of)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(account_id) DO UPDATE SET
            level = excluded.level,
            regime = excluded.regime,
            z_score = excluded.z_score,
            current_vol = excluded.current_vol,
            baseline_mean = excluded.baseline_mean,
            baseline_std = excluded.baseline_std,
            detected_by = excluded.detected_by,
            as_of = excluded.as_of",
        params![
            account_id,
            s.level() as i64,
            s.regime_name(),
            s.z_score,
            s.current_vol,
            s.baseline_mean,
            s.baseline_std,
            s.detected_by.as_str(),
            ts_text(&s.as_of),
        ],
    )?;
    tx.execute(
        "INSERT INTO regime_history (account_id, ts, level, z_score, current_vol, detected_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            account_id,
            ts_text(&s.as_of),
            s.level() as i64,
            s.z_score,
            s.current_vol,
            s.detected_by.as_str(),
        ],
    )?;
    Ok(())
}

fn write_allocation(tx: &Transaction<'_>, account_id: &str, a: &PortfolioAllocation) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO allocations (account_id, portfolio_value, positions, as_of)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(account_id) DO UPDATE SET
            portfolio_value = excluded.portfolio_value,
            positions = excluded.positions,
            as_of = excluded.as_of",
        params![
            account_id,
            a.portfolio_value,
            serde_json::to_string(&a.allocation)?,
            ts_text(&a.as_of),
        ],
    )?;
    Ok(())
}

fn write_event(tx: &Transaction<'_>, account_id: &str, e: &RebalanceEvent) -> StoreResult<()> {
    tx.execute(
        "INSERT INTO rebalance_events
            (account_id, ts, action, previous_level, new_level, z_score, allocation, value_before, value_after, reasoning, digest)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            account_id,
            ts_text(&e.timestamp),
            e.action.as_str(),
            e.previous_regime.map(|r| r.level() as i64),
            e.new_regime.level() as i64,
            e.z_score,
            serde_json::to_string(&e.allocation_snapshot)?,
            e.portfolio_value_before,
            e.portfolio_value_after,
            e.reasoning,
            e.digest,
        ],
    )?;
    Ok(())
}

struct RawAccount {
    account_id: String,
    deployed: bool,
    starting_capital: f64,
    portfolio_value: f64,
    last_level: Option<i64>,
    version: i64,
    updated_at: String,
}

impl RawAccount {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            account_id: row.get(0)?,
            deployed: row.get(1)?,
            starting_capital: row.get(2)?,
            portfolio_value: row.get(3)?,
            last_level: row.get(4)?,
            version: row.get(5)?,
            updated_at: row.get(6)?,
        })
    }

    fn into_account(self) -> StoreResult<AccountState> {
        Ok(AccountState {
            account_id: self.account_id,
            deployed: self.deployed,
            starting_capital: self.starting_capital,
            portfolio_value: self.portfolio_value,
            last_regime: self.last_level.and_then(level_to_regime),
            version: self.version.max(0) as u64,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

struct RawEvent {
    ts: String,
    action: String,
    previous_level: Option<i64>,
    new_level: i64,
    z_score: f64,
    allocation: String,
    value_before: f64,
    value_after: f64,
    reasoning: String,
    digest: String,
}

impl RawEvent {
    const COLUMNS: &'static str =
        "ts, action, previous_level, new_level, z_score, allocation, value_before, value_after, reasoning, digest";

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            ts: row.get(0)?,
            action: row.get(1)?,
            previous_level: row.get(2)?,
            new_level: row.get(3)?,
            z_score: row.get(4)?,
            allocation: row.get(5)?,
            value_before: row.get(6)?,
            value_after: row.get(7)?,
            reasoning: row.get(8)?,
            digest: row.get(9)?,
        })
    }

    fn into_event(self) -> StoreResult<RebalanceEvent> {
        let allocation_snapshot: BTreeMap<String, f64> = serde_json::from_str(&self.allocation)?;
        Ok(RebalanceEvent {
            timestamp: parse_ts(&self.ts)?,
            action: RebalanceAction::parse(&self.action),
            previous_regime: self.previous_level.and_then(level_to_regime),
            new_regime: level_to_regime(self.new_level).unwrap_or(Regime::Calm),
            z_score: self.z_score,
            allocation_snapshot,
            portfolio_value_before: self.value_before,
            portfolio_value_after: self.value_after,
            reasoning: self.reasoning,
            digest: self.digest,
        })
    }
}

impl Persistence for SqliteStore {
    fn load_account_state(&self, account_id: &str) -> StoreResult<Option<AccountState>> {
        let raw = self
            .conn
            .query_row(
                "SELECT account_id, deployed, starting_capital, portfolio_value, last_level, version, updated_at
                 FROM accounts WHERE account_id = ?1",
                params![account_id],
                RawAccount::from_row,
            )
            .optional()?;
        raw.map(RawAccount::into_account).transpose()
    }

    fn save_account_state(&mut self, account: &AccountState) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        upsert_account(&tx, account)?;
        tx.commit()?;
        Ok(())
    }

    fn load_regime_state(&self, account_id: &str) -> StoreResult<Option<RegimeState>> {
        let raw = self
            .conn
            .query_row(
                "SELECT level, z_score, current_vol, baseline_mean, baseline_std, detected_by, as_of
                 FROM regime_state WHERE account_id = ?1",
                params![account_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let Some((level, z_score, current_vol, baseline_mean, baseline_std, detected_by, as_of)) = raw else {
            return Ok(None);
        };
        Ok(Some(RegimeState {
            regime: level_to_regime(level).unwrap_or(Regime::Calm),
            z_score,
            current_vol,
            baseline_mean,
            baseline_std,
            detected_by: DetectedBy::parse(&detected_by),
            as_of: parse_ts(&as_of)?,
        }))
    }

    fn save_regime_state(&mut self, account_id: &str, state: &RegimeState) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        write_regime(&tx, account_id, state)?;
        tx.commit()?;
        Ok(())
    }

    fn load_allocation(&self, account_id: &str) -> StoreResult<Option<PortfolioAllocation>> {
        let raw = self
            .conn
            .query_row(
                "SELECT portfolio_value, positions, as_of FROM allocations WHERE account_id = ?1",
                params![account_id],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?)),
            )
            .optional()?;
        let Some((portfolio_value, positions, as_of)) = raw else {
            return Ok(None);
        };
        let allocation: BTreeMap<String, Position> = serde_json::from_str(&positions)?;
        Ok(Some(PortfolioAllocation { portfolio_value, allocation, as_of: parse_ts(&as_of)? }))
    }

    fn append_rebalance_event(&mut self, account_id: &str, event: &RebalanceEvent) -> StoreResult<()> {
        let tx = self.conn.transaction()?;
        write_event(&tx, account_id, event)?;
        tx.commit()?;
        Ok(())
    }

    fn list_rebalance_events(&self, account_id: &str) -> StoreResult<Vec<RebalanceEvent>> {
        let sql = format!(
            "SELECT {} FROM rebalance_events WHERE account_id = ?1 ORDER BY id ASC",
            RawEvent::COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![account_id], RawEvent::from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_event()?);
        }
        Ok(out)
    }

    fn last_rebalance_event(&self, account_id: &str) -> StoreResult<Option<RebalanceEvent>> {
        let sql = format!(
            "SELECT {} FROM rebalance_events WHERE account_id = ?1 ORDER BY id DESC LIMIT 1",
            RawEvent::COLUMNS
        );
        let raw = self
            .conn
            .query_row(&sql, params![account_id], RawEvent::from_row)
            .optional()?;
        raw.map(RawEvent::into_event).transpose()
    }

    fn list_regime_history(&self, account_id: &str, limit: usize) -> StoreResult<Vec<RegimeSnapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT ts, level, z_score, current_vol, detected_by FROM regime_history
             WHERE account_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![account_id, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (ts, level, z_score, current_vol, detected_by) = row?;
            out.push(RegimeSnapshot {
                timestamp: parse_ts(&ts)?,
                regime: level_to_regime(level).unwrap_or(Regime::Calm),
                z_score,
                current_vol,
                detected_by: DetectedBy::parse(&detected_by),
            });
        }
        Ok(out)
    }

    fn commit(&mut self, account_id: &str, commit: &CycleCommit) -> StoreResult<()> {
        let tx = self.conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM accounts WHERE account_id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current.map(|v| v.max(0) as u64).unwrap_or(0);
        if current != commit.expected_version {
            return Err(StoreError::VersionConflict {
                account_id: account_id.to_string(),
                expected: commit.expected_version,
            });
        }

        upsert_account(&tx, &commit.account)?;
        write_regime(&tx, account_id, &commit.regime)?;
        write_allocation(&tx, account_id, &commit.allocation)?;
        write_event(&tx, account_id, &commit.event)?;
        tx.commit()?;

        log(
            Level::Debug,
            Domain::Storage,
            "commit",
            obj(&[
                ("account_id", v_str(account_id)),
                ("version", v_num(commit.account.version as f64)),
            ]),
        );
        Ok(())
    }
}
