use anyhow::{bail, Result};
use serde_json::json;

use kavach::config::Config;
use kavach::guardian::Guardian;
use kavach::logging::{log, obj, v_str, Domain, Level};
use kavach::source::provider::MarketDataProvider;
use kavach::storage::SqliteStore;
use kavach::types::Universe;

const USAGE: &str = "usage: kavach <check|deploy|stress|prices|history|open> [account_id] [args]";

fn print(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Config::from_env();
    let mut args = std::env::args().skip(1);
    let Some(command) = args.next() else {
        bail!(USAGE);
    };
    let account_id = args.next().unwrap_or_else(|| cfg.account_id.clone());
    let rest: Vec<String> = args.collect();

    let mut store = SqliteStore::new(&cfg.sqlite_path)?;
    store.init()?;
    let universe = Universe::default();
    let provider = MarketDataProvider::from_config(&cfg, &universe)?;
    let mut guardian = Guardian::new(cfg.clone(), universe, provider, store);

    log(
        Level::Info,
        Domain::System,
        "start",
        obj(&[("account_id", v_str(&account_id)), ("command", v_str(&command))]),
    );

    match command.as_str() {
        "check" => {
            guardian.bootstrap().await;
            print(&guardian.check_regime(&account_id).await?)?;
        }
        "deploy" => {
            guardian.bootstrap().await;
            guardian.open_account(&account_id, cfg.starting_capital)?;
            print(&guardian.deploy(&account_id).await?)?;
        }
        "stress" => {
            guardian.bootstrap().await;
            print(&guardian.stress_test(&account_id).await?)?;
        }
        "prices" => {
            let symbols = if rest.is_empty() { guardian.universe().symbols() } else { rest };
            let report = guardian.quote(&symbols).await;
            let errors: serde_json::Map<String, serde_json::Value> = report
                .failures
                .iter()
                .map(|(s, e)| (s.clone(), json!(e.to_string())))
                .collect();
            print(&json!({ "prices": report.observations, "errors": errors }))?;
        }
        "history" => {
            let limit = rest.first().and_then(|v| v.parse().ok()).unwrap_or(50);
            print(&json!({
                "status": guardian.status(&account_id)?,
                "audit": guardian.history(&account_id, limit)?,
            }))?;
        }
        "open" => {
            let capital = rest.first().and_then(|v| v.parse().ok()).unwrap_or(cfg.starting_capital);
            print(&guardian.open_account(&account_id, capital)?)?;
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }
    Ok(())
}
