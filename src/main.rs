//! Account Ledger CLI
//!
//! Runs a CSV batch of account commands and prints the final state of every
//! account the batch touched.
//!
//! # Usage
//!
//! ```bash
//! cargo run -- commands.csv > accounts.csv
//! cargo run -- commands.csv journal.csv > accounts.csv
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: Set to `debug` or `warn` to control logging verbosity
//! - `LEDGER_STORE`: `memory` (default) or `postgres`, see [`account_ledger::config`]

use account_ledger::{Config, EngineError, Ledger, LedgerEngine, Result};
use std::env;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::process;

#[tokio::main]
async fn main() {
    env_logger::init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

async fn run() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        return Err(EngineError::MissingArgument);
    }

    let input_path = &args[1];
    let file = File::open(input_path)?;
    let reader = BufReader::new(file);

    let config = Config::from_env()?;
    let ledger = Ledger::from_config(&config).await?;

    let mut engine = LedgerEngine::new(ledger);
    engine.process_csv(reader).await?;

    let stdout = io::stdout();
    let handle = stdout.lock();
    engine.write_output(handle).await?;

    if let Some(journal_path) = args.get(2) {
        let journal = BufWriter::new(File::create(journal_path)?);
        engine.write_journal(journal).await?;
    }

    Ok(())
}
