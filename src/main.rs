//! bank-ledger - command line entry point
//!
//! ```text
//! bank-ledger [--env <name>] init-schema
//! bank-ledger [--env <name>] transfer <from_account_id> <to_account_id> <amount>
//! bank-ledger [--env <name>] demo
//! ```
//!
//! With `database.url` unset (and no `DATABASE_URL`) the in-memory store is
//! used, which only makes sense for `demo`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};

use bank_ledger::config::AppConfig;
use bank_ledger::db::Database;
use bank_ledger::store::{CreateAccountParams, CreateUserParams, MemoryStore, PgStore, Store};
use bank_ledger::{LedgerError, TransferCoordinator, TxExecutor};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

/// Positional arguments with `--env <name>` stripped
fn get_command() -> Vec<String> {
    let mut rest = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--env" || arg == "-e" {
            args.next();
        } else {
            rest.push(arg);
        }
    }
    rest
}

fn parse_id(value: &str, name: &str) -> anyhow::Result<i64> {
    value
        .parse()
        .with_context(|| format!("{name} must be an integer, got {value:?}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env)?;
    let _log_guard = bank_ledger::logging::init_logging(&app_config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        "Starting bank-ledger in {} mode",
        env
    );

    let database = match app_config.database.url {
        Some(_) => Some(Database::connect(&app_config.database).await?),
        None => None,
    };
    let store: Arc<dyn Store> = match &database {
        Some(db) => Arc::new(PgStore::from_database(db)),
        None => {
            tracing::warn!("No database.url configured, using in-memory store");
            Arc::new(MemoryStore::new(Duration::from_millis(
                app_config.transfer.lock_timeout_ms,
            )))
        }
    };

    let executor = TxExecutor::new(
        store,
        Duration::from_millis(app_config.transfer.tx_timeout_ms),
    );
    let coordinator = TransferCoordinator::new(executor);

    let command = get_command();
    let parts: Vec<&str> = command.iter().map(String::as_str).collect();
    let outcome = match parts.as_slice() {
        ["init-schema"] => match &database {
            Some(db) => db.init_schema().await.map_err(anyhow::Error::from),
            None => Err(anyhow::anyhow!("init-schema needs database.url")),
        },
        ["transfer", from, to, amount] => {
            let from = parse_id(from, "from_account_id")?;
            let to = parse_id(to, "to_account_id")?;
            let amount = parse_id(amount, "amount")?;
            run_transfer(&coordinator, from, to, amount, app_config.transfer.max_retries).await
        }
        ["demo"] => run_demo(&coordinator, app_config.transfer.max_retries).await,
        _ => Err(anyhow::anyhow!(
            "usage: bank-ledger [--env <name>] (init-schema | transfer <from> <to> <amount> | demo)"
        )),
    };

    if let Some(db) = &database {
        db.close().await;
    }
    outcome
}

async fn run_transfer(
    coordinator: &TransferCoordinator,
    from: i64,
    to: i64,
    amount: i64,
    max_retries: u32,
) -> anyhow::Result<()> {
    match coordinator
        .transfer_with_retry(from, to, amount, max_retries)
        .await
    {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(e) => {
            println!(
                "{}",
                serde_json::json!({ "error": e.code(), "message": e.to_string() })
            );
            bail!("transfer failed: {e}")
        }
    }
}

/// Two fresh USD accounts at 100 and 50, one transfer of 30 that succeeds and
/// one of 1000 that must fail without touching either balance.
async fn run_demo(coordinator: &TransferCoordinator, max_retries: u32) -> anyhow::Result<()> {
    let suffix = chrono::Utc::now().timestamp_micros();
    let (a, b) = coordinator
        .executor()
        .exec_tx(move |q| {
            Box::pin(async move {
                let mut ids = Vec::with_capacity(2);
                for (name, balance) in [("alice", 100), ("bob", 50)] {
                    let username = format!("{name}_{suffix}");
                    q.create_user(CreateUserParams {
                        username: username.clone(),
                        hashed_password: "demo".to_string(),
                        full_name: name.to_string(),
                        email: format!("{username}@example.com"),
                    })
                    .await?;
                    let account = q
                        .create_account(CreateAccountParams {
                            owner: username,
                            balance,
                            currency: "USD".to_string(),
                        })
                        .await?;
                    ids.push(account.id);
                }
                Ok((ids[0], ids[1]))
            })
        })
        .await?;

    let result = coordinator.transfer_with_retry(a, b, 30, max_retries).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);

    match coordinator.transfer_with_retry(a, b, 1000, max_retries).await {
        Err(LedgerError::InsufficientFunds {
            account_id,
            balance,
            amount,
        }) => {
            println!(
                "{}",
                serde_json::json!({
                    "error": "INSUFFICIENT_FUNDS",
                    "account_id": account_id,
                    "balance": balance,
                    "amount": amount,
                })
            );
            Ok(())
        }
        Ok(_) => bail!("overdraft transfer unexpectedly succeeded"),
        Err(e) => Err(e.into()),
    }
}
