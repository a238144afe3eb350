//! End-to-end decision cycles against scripted sources and an on-disk store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kavach::config::Config;
use kavach::error::{CycleError, FetchError, StoreError};
use kavach::guardian::Guardian;
use kavach::rebalance::verify_chain;
use kavach::regime::Baseline;
use kavach::source::fixed::Fixed;
use kavach::source::provider::MarketDataProvider;
use kavach::source::retry::RetryPolicy;
use kavach::source::scripted::Scripted;
use kavach::source::PriceSource;
use kavach::storage::{CycleCommit, Persistence, SqliteStore, StoreResult};
use kavach::types::{
    AccountState, DetectedBy, PortfolioAllocation, RebalanceAction, RebalanceEvent, Regime, RegimeSnapshot,
    RegimeState, Universe,
};
use tempfile::TempDir;

const BTC: f64 = 50_000.0;
const ETH: f64 = 2_500.0;
const GLD: f64 = 200.0;

/// Turbulent against the test baseline: z = (0.0325 - 0.02) / 0.005 = 2.5.
const TURBULENT_MOVE: f64 = 0.0325;

fn sqlite(dir: &TempDir) -> SqliteStore {
    let path = dir.path().join("guardian.sqlite");
    let mut store = SqliteStore::new(path.to_str().unwrap()).unwrap();
    store.init().unwrap();
    store
}

fn rig<S: Persistence>(store: S) -> (Guardian<S>, Arc<Scripted>) {
    let market = Arc::new(
        Scripted::new("primary")
            .with_price("BTC-USD", BTC)
            .with_price("ETH-USD", ETH)
            .with_price("GLD", GLD),
    );
    let backup = Arc::new(Scripted::new("backup"));
    let cash: Arc<dyn PriceSource> = Arc::new(Fixed::unit());

    let universe = Universe::default();
    let provider = universe
        .assets()
        .into_iter()
        .fold(MarketDataProvider::new(RetryPolicy::no_retry()), |p, a| {
            let sources: Vec<Arc<dyn PriceSource>> = if a.symbol == "USD" {
                vec![cash.clone()]
            } else {
                vec![market.clone(), backup.clone()]
            };
            p.route(a.clone(), sources)
        });

    let cfg = Config { vol_window: 2, ..Config::default() };
    let mut guardian = Guardian::new(cfg, universe, provider, store);
    guardian.set_baseline(Baseline::new(0.02, 0.005));
    (guardian, market)
}

/// Scale both risky prices by a cumulative factor.
fn set_risky(market: &Scripted, factor: f64) {
    market.set_price("BTC-USD", BTC * factor);
    market.set_price("ETH-USD", ETH * factor);
}

fn events<S: Persistence>(g: &Guardian<S>, id: &str) -> Vec<RebalanceEvent> {
    g.with_store(|s| s.list_rebalance_events(id).unwrap()).unwrap()
}

#[tokio::test]
async fn deploy_then_poll_allocates_calm_targets_once() {
    let dir = TempDir::new().unwrap();
    let (g, _market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();

    let out = g.deploy("acct").await.unwrap();
    assert_eq!(out.regime.regime, Regime::Calm);
    let ev = out.event.unwrap();
    assert_eq!(ev.action, RebalanceAction::CapitalDeployment);
    assert_eq!(ev.previous_regime, None);
    assert_eq!(ev.allocation_snapshot["BTC-USD"] + ev.allocation_snapshot["ETH-USD"], 80_000.0);
    assert_eq!(ev.allocation_snapshot["GLD"], 15_000.0);
    assert_eq!(ev.allocation_snapshot["USD"], 5_000.0);
    assert!(ev.reasoning.starts_with("Deployed capital in calm regime."));

    let polled = g.check_regime("acct").await.unwrap();
    assert_eq!(polled.regime.regime, Regime::Calm);
    assert!(polled.event.is_none());

    let again = g.deploy("acct").await.unwrap();
    assert!(again.event.is_none());
    assert_eq!(events(&g, "acct").len(), 1);

    let view = g.status("acct").unwrap().unwrap();
    assert!(view.account.deployed);
    assert_eq!(view.allocation.unwrap().dollars("GLD"), 15_000.0);
}

#[tokio::test]
async fn volatility_spike_rebalances_at_marked_value() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();
    g.deploy("acct").await.unwrap();

    let up = 1.0 + TURBULENT_MOVE;
    set_risky(&market, up);
    let first = g.check_regime("acct").await.unwrap();
    assert_eq!(first.regime.regime, Regime::Calm);
    assert!(first.event.is_none());

    set_risky(&market, up * (1.0 - TURBULENT_MOVE));
    let out = g.check_regime("acct").await.unwrap();
    assert_eq!(out.regime.regime, Regime::Turbulent);
    assert_eq!(out.regime.detected_by, DetectedBy::ZScore);
    assert!((out.regime.z_score - 2.5).abs() < 1e-6);

    let ev = out.event.unwrap();
    assert_eq!(ev.previous_regime, Some(Regime::Calm));
    assert_eq!(ev.new_regime, Regime::Turbulent);

    // risky sleeve lost r^2 over the round trip
    let expected = 80_000.0 * (1.0 - TURBULENT_MOVE * TURBULENT_MOVE) + 20_000.0;
    assert!((ev.portfolio_value_before - expected).abs() < 0.01);
    let total: f64 = ev.allocation_snapshot.values().sum();
    assert!((total - expected).abs() <= 1.0);
    assert!((ev.allocation_snapshot["GLD"] - expected * 0.5).abs() < 0.01);
    assert!((ev.allocation_snapshot["USD"] - expected * 0.1).abs() < 0.02);
}

#[tokio::test]
async fn stress_from_any_regime_ends_in_cash() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));

    let err = g.stress_test("acct").await.unwrap_err();
    assert!(matches!(err, CycleError::NotDeployed(_)));

    g.open_account("acct", 100_000.0).unwrap();
    g.deploy("acct").await.unwrap();
    set_risky(&market, 1.0 + TURBULENT_MOVE);
    g.check_regime("acct").await.unwrap();
    set_risky(&market, (1.0 + TURBULENT_MOVE) * (1.0 - TURBULENT_MOVE));
    assert_eq!(g.check_regime("acct").await.unwrap().regime.regime, Regime::Turbulent);

    let out = g.stress_test("acct").await.unwrap();
    assert_eq!(out.regime.regime, Regime::Crash);
    assert_eq!(out.regime.detected_by, DetectedBy::StressTest);
    let ev = out.event.unwrap();
    assert_eq!(ev.previous_regime, Some(Regime::Turbulent));
    assert_eq!(ev.allocation_snapshot["BTC-USD"], 0.0);
    assert_eq!(ev.allocation_snapshot["ETH-USD"], 0.0);
    assert_eq!(ev.allocation_snapshot["GLD"], 0.0);
    assert!((ev.allocation_snapshot["USD"] - ev.portfolio_value_before).abs() <= 0.01);

    let repeat = g.stress_test("acct").await.unwrap();
    assert_eq!(repeat.regime.regime, Regime::Crash);
    assert!(repeat.event.is_none());
    assert_eq!(events(&g, "acct").len(), 3);
}

type Snapshot = (
    Option<AccountState>,
    Option<RegimeState>,
    Option<PortfolioAllocation>,
    Vec<RebalanceEvent>,
    Vec<RegimeSnapshot>,
);

fn snapshot<S: Persistence>(g: &Guardian<S>, id: &str) -> Snapshot {
    g.with_store(|s| {
        (
            s.load_account_state(id).unwrap(),
            s.load_regime_state(id).unwrap(),
            s.load_allocation(id).unwrap(),
            s.list_rebalance_events(id).unwrap(),
            s.list_regime_history(id, 100).unwrap(),
        )
    })
    .unwrap()
}

#[tokio::test]
async fn missing_asset_leaves_state_untouched() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();
    g.deploy("acct").await.unwrap();
    let before = snapshot(&g, "acct");

    market.push("GLD", Err(FetchError::unavailable("primary", "GLD", "timeout")));
    set_risky(&market, 1.5);
    let err = g.check_regime("acct").await.unwrap_err();
    assert!(err.to_string().starts_with("failed to fetch regime data"));
    match err {
        CycleError::IncompleteUniverse { missing } => {
            assert_eq!(missing.keys().collect::<Vec<_>>(), vec!["GLD"]);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(snapshot(&g, "acct"), before);
}

#[tokio::test]
async fn permanent_miss_is_not_retried() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));
    market.push("GLD", Err(FetchError::not_found("primary", "GLD", "delisted")));

    let report = g.quote(&["GLD".to_string()]).await;
    assert!(report.failures.contains_key("GLD"));
    assert_eq!(market.calls("GLD"), 1);

    let report = g.quote(&["GLD".to_string(), "USD".to_string(), "NOPE".to_string()]).await;
    assert_eq!(report.failures.keys().collect::<Vec<_>>(), vec!["NOPE"]);
    assert_eq!(report.observations["USD"].source_id, "fixed");
}

#[tokio::test]
async fn concurrent_deploys_produce_one_event() {
    let dir = TempDir::new().unwrap();
    let (g, _market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();

    let (a, b) = tokio::join!(g.deploy("acct"), g.deploy("acct"));
    let fired = [a.unwrap(), b.unwrap()].iter().filter(|o| o.event.is_some()).count();
    assert_eq!(fired, 1);
    assert_eq!(events(&g, "acct").len(), 1);
}

#[tokio::test]
async fn concurrent_polls_on_a_transition_write_one_event() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();
    g.deploy("acct").await.unwrap();
    assert!(g.check_regime("acct").await.unwrap().event.is_none());

    // next poll sees a 20% risky jump, far past the crash tier
    set_risky(&market, 1.2);
    let (a, b) = tokio::join!(g.check_regime("acct"), g.check_regime("acct"));
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.regime.regime, Regime::Crash);
    assert_eq!(b.regime.regime, Regime::Crash);
    assert_eq!([&a, &b].iter().filter(|o| o.event.is_some()).count(), 1);

    let trail = events(&g, "acct");
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[1].previous_regime, Some(Regime::Calm));
    assert!(verify_chain(&trail));
}

#[tokio::test]
async fn stress_values_the_account_at_the_last_poll() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();
    g.deploy("acct").await.unwrap();

    set_risky(&market, 1.5);
    let polled = g.check_regime("acct").await.unwrap();
    assert_eq!(polled.regime.regime, Regime::Calm);
    assert!(polled.event.is_none());

    let ev = g.stress_test("acct").await.unwrap().event.unwrap();
    assert!((ev.portfolio_value_before - 140_000.0).abs() < 0.01);
    assert!((ev.allocation_snapshot["USD"] - 140_000.0).abs() < 0.01);
}

#[tokio::test]
async fn accounts_do_not_share_state() {
    let dir = TempDir::new().unwrap();
    let (g, _market) = rig(sqlite(&dir));
    g.open_account("a", 100_000.0).unwrap();
    g.open_account("b", 50_000.0).unwrap();

    let (a, b) = tokio::join!(g.deploy("a"), g.deploy("b"));
    assert_eq!(a.unwrap().event.unwrap().allocation_snapshot["GLD"], 15_000.0);
    assert_eq!(b.unwrap().event.unwrap().allocation_snapshot["GLD"], 7_500.0);
    assert_eq!(events(&g, "a").len(), 1);
    assert_eq!(events(&g, "b").len(), 1);
}

#[tokio::test]
async fn audit_trail_only_grows() {
    let dir = TempDir::new().unwrap();
    let (g, market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();

    let mut lengths = vec![events(&g, "acct").len()];
    g.check_regime("acct").await.unwrap();
    lengths.push(events(&g, "acct").len());
    g.deploy("acct").await.unwrap();
    lengths.push(events(&g, "acct").len());

    let mut factor = 1.0;
    for step in 0..6 {
        factor *= if step % 2 == 0 { 1.05 } else { 0.95 };
        set_risky(&market, factor);
        g.check_regime("acct").await.unwrap();
        lengths.push(events(&g, "acct").len());
    }
    g.stress_test("acct").await.unwrap();
    lengths.push(events(&g, "acct").len());

    assert!(lengths.windows(2).all(|w| w[0] <= w[1]));
    let trail = events(&g, "acct");
    assert!(trail.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert!(verify_chain(&trail));

    let history = g.history("acct", 3).unwrap();
    assert_eq!(history.events.len(), trail.len());
    assert_eq!(history.regimes.len(), 3);
}

#[tokio::test]
async fn undeployed_poll_records_regime_only() {
    let dir = TempDir::new().unwrap();
    let (g, _market) = rig(sqlite(&dir));
    g.open_account("acct", 100_000.0).unwrap();

    let out = g.check_regime("acct").await.unwrap();
    assert!(out.event.is_none());
    let (account, regime, allocation, trail, _) = snapshot(&g, "acct");
    assert!(!account.unwrap().deployed);
    assert_eq!(regime.unwrap().regime, Regime::Calm);
    assert!(allocation.is_none());
    assert!(trail.is_empty());
}

#[tokio::test]
async fn zero_capital_cannot_deploy() {
    let dir = TempDir::new().unwrap();
    let (g, _market) = rig(sqlite(&dir));
    g.open_account("broke", 0.0).unwrap();
    let err = g.deploy("broke").await.unwrap_err();
    assert!(matches!(err, CycleError::NoCapital(_)));
    assert!(events(&g, "broke").is_empty());
}

#[tokio::test]
async fn bootstrap_seeds_baseline_from_history() {
    let closes = |start: f64| -> Vec<f64> {
        let mut p = start;
        let mut out = vec![p];
        for i in 0..200 {
            let amp = 0.01 * (1 + i % 3) as f64;
            p *= if i % 2 == 0 { 1.0 + amp } else { 1.0 - amp };
            out.push(p);
        }
        out
    };
    let market = Arc::new(
        Scripted::new("primary")
            .with_price("BTC-USD", BTC)
            .with_price("ETH-USD", ETH)
            .with_price("GLD", GLD)
            .with_history("BTC-USD", closes(BTC))
            .with_history("ETH-USD", closes(ETH))
            .with_history("GLD", closes(GLD)),
    );
    let cash: Arc<dyn PriceSource> = Arc::new(Fixed::unit());
    let universe = Universe::default();
    let provider = universe
        .assets()
        .into_iter()
        .fold(MarketDataProvider::new(RetryPolicy::no_retry()), |p, a| {
            let sources: Vec<Arc<dyn PriceSource>> =
                if a.symbol == "USD" { vec![cash.clone()] } else { vec![market.clone()] };
            p.route(a.clone(), sources)
        });

    let mut store = SqliteStore::in_memory().unwrap();
    store.init().unwrap();
    let mut g = Guardian::new(Config { vol_window: 10, ..Config::default() }, universe, provider, store);

    let baseline = g.bootstrap().await.unwrap();
    assert!(!baseline.is_degenerate());

    let out = g.check_regime("acct").await.unwrap();
    assert_eq!(out.regime.detected_by, DetectedBy::ZScore);
    assert_eq!(out.regime.baseline_mean, baseline.mean);
}

/// SQLite store whose writes can be switched off.
struct FlakyStore {
    inner: SqliteStore,
    broken: Arc<AtomicBool>,
}

impl FlakyStore {
    fn check(&self) -> StoreResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(StoreError::Sqlite(rusqlite::Error::InvalidQuery));
        }
        Ok(())
    }
}

impl Persistence for FlakyStore {
    fn load_account_state(&self, id: &str) -> StoreResult<Option<AccountState>> {
        self.inner.load_account_state(id)
    }
    fn save_account_state(&mut self, account: &AccountState) -> StoreResult<()> {
        self.check()?;
        self.inner.save_account_state(account)
    }
    fn load_regime_state(&self, id: &str) -> StoreResult<Option<RegimeState>> {
        self.inner.load_regime_state(id)
    }
    fn save_regime_state(&mut self, id: &str, state: &RegimeState) -> StoreResult<()> {
        self.check()?;
        self.inner.save_regime_state(id, state)
    }
    fn load_allocation(&self, id: &str) -> StoreResult<Option<PortfolioAllocation>> {
        self.inner.load_allocation(id)
    }
    fn append_rebalance_event(&mut self, id: &str, event: &RebalanceEvent) -> StoreResult<()> {
        self.check()?;
        self.inner.append_rebalance_event(id, event)
    }
    fn list_rebalance_events(&self, id: &str) -> StoreResult<Vec<RebalanceEvent>> {
        self.inner.list_rebalance_events(id)
    }
    fn last_rebalance_event(&self, id: &str) -> StoreResult<Option<RebalanceEvent>> {
        self.inner.last_rebalance_event(id)
    }
    fn list_regime_history(&self, id: &str, limit: usize) -> StoreResult<Vec<RegimeSnapshot>> {
        self.inner.list_regime_history(id, limit)
    }
    fn commit(&mut self, id: &str, commit: &CycleCommit) -> StoreResult<()> {
        self.check()?;
        self.inner.commit(id, commit)
    }
}

#[tokio::test]
async fn failed_commit_is_as_if_nothing_happened() {
    let dir = TempDir::new().unwrap();
    let broken = Arc::new(AtomicBool::new(false));
    let (g, _market) = rig(FlakyStore { inner: sqlite(&dir), broken: broken.clone() });
    g.open_account("acct", 100_000.0).unwrap();
    let before = snapshot(&g, "acct");

    broken.store(true, Ordering::SeqCst);
    let err = g.deploy("acct").await.unwrap_err();
    assert!(matches!(err, CycleError::PersistenceFailure(_)));
    assert_eq!(snapshot(&g, "acct"), before);

    broken.store(false, Ordering::SeqCst);
    let out = g.deploy("acct").await.unwrap();
    assert!(out.event.is_some());
    assert_eq!(events(&g, "acct").len(), 1);
}
