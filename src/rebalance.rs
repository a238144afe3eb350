//! Regime transition → target allocation → audit entry.
//!
//! Only a level change moves money. The comparator is the regime of the last
//! allocation stored on the account, not the last detection, so repeated
//! polls at one level never produce a second event.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use sha2::{Digest, Sha256};

use crate::error::{CycleError, CycleResult, FetchError};
use crate::logging::log_rebalance;
use crate::storage::{CycleCommit, Persistence};
use crate::types::{
    AccountState, PortfolioAllocation, Position, RebalanceAction, RebalanceEvent, Regime, RegimeState,
    Universe,
};

fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

/// Stored timestamps keep microseconds; hash exactly what will be read back.
fn to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_nanosecond(ts.nanosecond() / 1_000 * 1_000).unwrap_or(ts)
}

/// Fixed regime → weights lookup applied to the four-symbol universe.
#[derive(Debug, Clone)]
pub struct AllocationPolicy {
    universe: Universe,
    /// Share of the risky sleeve for `universe.risky[0]`.
    risky_split: f64,
}

impl AllocationPolicy {
    pub fn new(universe: Universe, risky_split: f64) -> Self {
        Self { universe, risky_split: risky_split.clamp(0.0, 1.0) }
    }

    /// Dollar targets for `portfolio_value`, rounded to cents. Cash absorbs
    /// the rounding remainder so the lines add up to the rounded value.
    pub fn target(
        &self,
        regime: Regime,
        portfolio_value: f64,
        marks: &BTreeMap<String, f64>,
    ) -> CycleResult<PortfolioAllocation> {
        let w = regime.target_weights();
        let total = round_cents(portfolio_value.max(0.0));
        let risky_value = total * w.risky;

        let r0 = round_cents(risky_value * self.risky_split);
        let r1 = round_cents(risky_value * (1.0 - self.risky_split));
        let safe = round_cents(total * w.safe);
        let cash = round_cents(total - r0 - r1 - safe);

        let lines = [
            (&self.universe.risky[0].symbol, r0),
            (&self.universe.risky[1].symbol, r1),
            (&self.universe.safe.symbol, safe),
            (&self.universe.cash.symbol, cash),
        ];

        let mut missing = BTreeMap::new();
        let mut allocation = BTreeMap::new();
        for (symbol, dollars) in lines {
            match marks.get(symbol.as_str()).copied().filter(|p| p.is_finite() && *p > 0.0) {
                Some(price) => {
                    allocation.insert(symbol.clone(), Position { dollars, units: dollars / price, price });
                }
                None => {
                    missing.insert(
                        symbol.clone(),
                        FetchError::Exhausted { asset: symbol.clone(), attempts: vec!["no mark".to_string()] },
                    );
                }
            }
        }
        if !missing.is_empty() {
            return Err(CycleError::IncompleteUniverse { missing });
        }

        Ok(PortfolioAllocation { portfolio_value: total, allocation, as_of: Utc::now() })
    }
}

/// What a triggered evaluation will write.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub account: AccountState,
    pub allocation: PortfolioAllocation,
    pub event: RebalanceEvent,
}

pub struct RebalancingEngine {
    policy: AllocationPolicy,
}

impl RebalancingEngine {
    pub fn new(policy: AllocationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Pure decision. `None` means no transition; `account.portfolio_value`
    /// must already be marked to market at `marks`.
    pub fn plan(
        &self,
        regime: &RegimeState,
        account: &AccountState,
        marks: &BTreeMap<String, f64>,
        previous_event: Option<&RebalanceEvent>,
    ) -> CycleResult<Option<RebalancePlan>> {
        let action = if account.deployed {
            if account.last_regime == Some(regime.regime) {
                return Ok(None);
            }
            RebalanceAction::Rebalance
        } else {
            if account.starting_capital <= 0.0 {
                return Err(CycleError::NoCapital(account.account_id.clone()));
            }
            RebalanceAction::CapitalDeployment
        };

        let value_before = if account.deployed { account.portfolio_value } else { account.starting_capital };
        let allocation = self.policy.target(regime.regime, value_before, marks)?;
        let previous_regime = if account.deployed { account.last_regime } else { None };

        let now = to_micros(Utc::now());
        // audit order must never go backwards, even if the clock does
        let timestamp = previous_event.map(|e| e.timestamp.max(now)).unwrap_or(now);

        let mut event = RebalanceEvent {
            timestamp,
            action,
            previous_regime,
            new_regime: regime.regime,
            z_score: regime.z_score,
            allocation_snapshot: allocation.allocation.iter().map(|(s, p)| (s.clone(), p.dollars)).collect(),
            portfolio_value_before: value_before,
            portfolio_value_after: allocation.total(),
            reasoning: reasoning(action, previous_regime, regime),
            digest: String::new(),
        };
        event.digest = chain_digest(previous_event.map(|e| e.digest.as_str()), &event);

        let next = AccountState {
            account_id: account.account_id.clone(),
            deployed: true,
            starting_capital: account.starting_capital,
            portfolio_value: allocation.total(),
            last_regime: Some(regime.regime),
            version: account.version + 1,
            updated_at: now,
        };

        Ok(Some(RebalancePlan { account: next, allocation, event }))
    }

    /// Decide and, on a transition, persist allocation, regime, account and
    /// event in one commit. No transition means no writes.
    pub fn evaluate(
        &self,
        store: &mut dyn Persistence,
        regime: &RegimeState,
        account: &AccountState,
        marks: &BTreeMap<String, f64>,
    ) -> CycleResult<Option<RebalanceEvent>> {
        let previous = store.last_rebalance_event(&account.account_id)?;
        let Some(plan) = self.plan(regime, account, marks, previous.as_ref())? else {
            return Ok(None);
        };

        let commit = CycleCommit {
            expected_version: account.version,
            account: plan.account,
            regime: regime.clone(),
            allocation: plan.allocation,
            event: plan.event,
        };
        store.commit(&account.account_id, &commit)?;
        log_rebalance(&account.account_id, &commit.event);
        Ok(Some(commit.event))
    }
}

fn reasoning(action: RebalanceAction, previous: Option<Regime>, state: &RegimeState) -> String {
    let trigger = format!(
        "Volatility Z-score: {:.2} → Level {} triggered",
        state.z_score,
        state.level()
    );
    let target = state.regime.target_weights();
    let head = match (action, previous) {
        (RebalanceAction::CapitalDeployment, _) => format!("Deployed capital in {} regime.", state.regime),
        (RebalanceAction::Rebalance, Some(prev)) => format!("Regime change {} → {}.", prev, state.regime),
        (RebalanceAction::Rebalance, None) => format!("Rebalanced into {} regime.", state.regime),
    };
    let origin = match state.detected_by {
        crate::types::DetectedBy::StressTest => " (stress test)",
        _ => "",
    };
    format!("{} {}{}. Target: {}", head, trigger, origin, target)
}

/// sha256(previous digest || entry content), hex encoded.
fn chain_digest(previous: Option<&str>, event: &RebalanceEvent) -> String {
    let mut hasher = Sha256::new();
    hasher.update(previous.unwrap_or("").as_bytes());
    hasher.update(event.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true).as_bytes());
    hasher.update(event.action.as_str().as_bytes());
    hasher.update([event.previous_regime.map(|r| r.level()).unwrap_or(0), event.new_regime.level()]);
    hasher.update(event.z_score.to_le_bytes());
    hasher.update(event.portfolio_value_before.to_le_bytes());
    hasher.update(event.portfolio_value_after.to_le_bytes());
    for (sym, dollars) in &event.allocation_snapshot {
        hasher.update(sym.as_bytes());
        hasher.update(dollars.to_le_bytes());
    }
    hasher.update(event.reasoning.as_bytes());
    hex::encode(hasher.finalize())
}

/// Recompute the digest chain; `false` if any entry was altered.
pub fn verify_chain(events: &[RebalanceEvent]) -> bool {
    let mut prev: Option<&str> = None;
    for e in events {
        if chain_digest(prev, e) != e.digest {
            return false;
        }
        prev = Some(e.digest.as_str());
    }
    true
}
