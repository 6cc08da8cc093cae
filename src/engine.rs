//! Batch engine: runs CSV commands against a [`Ledger`] and reports the result.
//!
//! Commands run in file order, one at a time. A row that cannot be parsed, or
//! that the ledger rejects (insufficient funds, unknown account, ...), is logged
//! and skipped. A storage failure aborts the whole batch.

use crate::account::AccountId;
use crate::command::{Command, CommandRecord};
use crate::error::{LedgerError, Result};
use crate::ledger::Ledger;
use crate::transaction::Transaction;
use csv::{ReaderBuilder, Trim};
use log::{debug, warn};
use std::collections::BTreeSet;
use std::io::{Read, Write};

/// Processes command batches against one ledger.
///
/// # Output Ordering
///
/// Accounts are written ascending by id, journal entries ascending by
/// transaction id.
pub struct LedgerEngine {
    ledger: Ledger,

    /// Accounts opened or referenced by a command.
    touched: BTreeSet<AccountId>,
}

impl LedgerEngine {
    pub fn new(ledger: Ledger) -> Self {
        LedgerEngine {
            ledger,
            touched: BTreeSet::new(),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Runs every command of a CSV reader in order.
    pub async fn process_csv<R: Read>(&mut self, reader: R) -> Result<()> {
        let mut csv_reader = ReaderBuilder::new()
            .trim(Trim::All)
            .flexible(true)
            .from_reader(reader);

        for (row_idx, result) in csv_reader.deserialize::<CommandRecord>().enumerate() {
            let row_num = row_idx + 2; // 1-indexed, accounting for header row

            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!("Row {}: CSV parse error: {}", row_num, e);
                    continue;
                }
            };
            let command = match record.parse() {
                Ok(command) => command,
                Err(e) => {
                    warn!("Row {}: {}", row_num, e);
                    continue;
                }
            };

            match self.execute(command, row_num).await {
                Ok(()) => {}
                Err(e @ LedgerError::Persistence(_)) => return Err(e.into()),
                Err(e) => warn!("Row {}: {}", row_num, e),
            }
        }

        Ok(())
    }

    async fn execute(&mut self, command: Command, row: usize) -> std::result::Result<(), LedgerError> {
        self.touched.extend(command.accounts());

        match command {
            Command::Open { owner, currency } => {
                let account = self.ledger.create_account(owner, currency).await?;
                self.touched.insert(account.id);
                debug!("Row {}: Opened account {}", row, account.id);
            }
            Command::Deposit { account, amount } => {
                let balance = self.ledger.deposit(account, amount).await?;
                debug!("Row {}: Deposited {} to {}, balance {}", row, amount, account, balance);
            }
            Command::Withdraw { account, amount } => {
                let balance = self.ledger.withdraw(account, amount).await?;
                debug!("Row {}: Withdrew {} from {}, balance {}", row, amount, account, balance);
            }
            Command::Adjust { account, delta } => {
                let balance = self.ledger.adjust_balance(account, delta).await?;
                debug!("Row {}: Adjusted {} by {}, balance {}", row, account, delta, balance);
            }
            Command::Transfer { from, to, amount } => {
                let (from_balance, to_balance) = self.ledger.transfer(from, to, amount).await?;
                debug!(
                    "Row {}: Moved {} from {} ({}) to {} ({})",
                    row, amount, from, from_balance, to, to_balance
                );
            }
        }

        Ok(())
    }

    /// Writes `account,owner,currency,balance` for every account the batch touched.
    ///
    /// Referenced ids that never existed are left out.
    pub async fn write_output<W: Write>(&self, writer: W) -> Result<()> {
        let mut csv_writer = csv::Writer::from_writer(writer);

        csv_writer.write_record(["account", "owner", "currency", "balance"])?;

        for &id in &self.touched {
            let account = match self.ledger.get_account(id).await {
                Ok(account) => account,
                Err(LedgerError::AccountNotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            };
            csv_writer.write_record([
                account.id.to_string(),
                account.owner.to_string(),
                account.currency.to_string(),
                account.balance.to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(())
    }

    /// Writes every log entry of the touched accounts as
    /// `id,account,counterparty,type,amount,status`.
    pub async fn write_journal<W: Write>(&self, writer: W) -> Result<()> {
        let mut entries: Vec<Transaction> = Vec::new();
        for &id in &self.touched {
            match self.ledger.list_transactions(id).await {
                Ok(listed) => entries.extend(listed),
                Err(LedgerError::AccountNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        entries.sort_by_key(|e| e.id);

        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(["id", "account", "counterparty", "type", "amount", "status"])?;
        for entry in entries {
            csv_writer.write_record([
                entry.id.to_string(),
                entry.account_id.to_string(),
                entry.counterparty.map(|c| c.to_string()).unwrap_or_default(),
                entry.kind.to_string(),
                entry.amount.to_string(),
                entry.status.to_string(),
            ])?;
        }

        csv_writer.flush()?;
        Ok(())
    }
}
