// SPDX-License-Identifier: MIT OR Apache-2.0
//! Durable monetary balance governing how much audio may be admitted.
//!
//! The [`Broker`] capability owns a single account, mutated only through
//! atomic read-modify-write transactions. Conversions between money and
//! audio duration are linear at the recognizer's published rate of $0.006
//! per 15 seconds, i.e. 2.4 cents per minute.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use amphi_datastore::{DatastoreClient, DatastoreError, Entity, Key, Mutation, Value};
use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tracing::info;

/// Seconds of audio one cent buys: 15 s / 0.6 cents.
const SECONDS_PER_CENT: u64 = 25;

/// Entity kind of the account object.
const ACCOUNT_KIND: &str = "Account";
/// Key name of the single account.
const ACCOUNT_NAME: &str = "acc_usd";
/// Balance property, integer cents.
const BALANCE_PROPERTY: &str = "BalanceInUsdCents";

/// Price of `duration` of audio, in cents, rounded down.
pub fn duration_to_cents(duration: Duration) -> i64 {
    (duration.as_secs() / SECONDS_PER_CENT) as i64
}

/// Longest audio duration `cents` can pay for. Negative balances buy
/// nothing.
pub fn cents_to_duration(cents: i64) -> Duration {
    Duration::from_secs(cents.max(0) as u64 * SECONDS_PER_CENT)
}

/// Errors surfaced by broker backends.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// The durable store failed; the caller retries at the next iteration.
    #[error("budget store: {0}")]
    Store(#[from] DatastoreError),
    /// The account object vanished after initialization.
    #[error("account {ACCOUNT_NAME} does not exist")]
    MissingAccount,
}

/// Capability contract for the durable balance.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Current balance in cents. May be negative after conservative debits.
    async fn get_balance(&self) -> Result<i64, BrokerError>;
    /// Atomically apply `delta_cents` (negative to debit).
    async fn change_balance(&self, delta_cents: i64) -> Result<(), BrokerError>;
}

// ── In-memory backend ───────────────────────────────────────────────

/// Process-local broker used by tests and the end-to-end scenarios.
#[derive(Debug, Default)]
pub struct MemoryBroker {
    balance: Mutex<i64>,
}

impl MemoryBroker {
    /// Broker starting at the given balance.
    pub fn with_balance(cents: i64) -> Self {
        Self {
            balance: Mutex::new(cents),
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn get_balance(&self) -> Result<i64, BrokerError> {
        Ok(*self.balance.lock().expect("balance lock poisoned"))
    }

    async fn change_balance(&self, delta_cents: i64) -> Result<(), BrokerError> {
        *self.balance.lock().expect("balance lock poisoned") += delta_cents;
        Ok(())
    }
}

// ── Datastore backend ───────────────────────────────────────────────

/// Broker persisting the account as a Datastore entity.
#[derive(Clone, Debug)]
pub struct DatastoreBroker {
    client: DatastoreClient,
    key: Key,
}

impl DatastoreBroker {
    /// Bind to the account entity, creating it with a zero balance on first
    /// start-up.
    pub async fn connect(client: DatastoreClient) -> Result<Self, BrokerError> {
        let key = Key::named(ACCOUNT_KIND, ACCOUNT_NAME);
        if client.lookup(&key, None).await?.is_none() {
            let mut account = Entity::new(key.clone());
            account.set(BALANCE_PROPERTY, Value::integer(0));
            client
                .commit_non_transactional(vec![Mutation::Upsert(account)])
                .await?;
            info!(target: "amphi.budget", "created account {ACCOUNT_NAME} with zero balance");
        }
        Ok(Self { client, key })
    }
}

#[async_trait]
impl Broker for DatastoreBroker {
    async fn get_balance(&self) -> Result<i64, BrokerError> {
        let entity = self
            .client
            .lookup(&self.key, None)
            .await?
            .ok_or(BrokerError::MissingAccount)?;
        Ok(entity.get_i64(BALANCE_PROPERTY)?)
    }

    async fn change_balance(&self, delta_cents: i64) -> Result<(), BrokerError> {
        let tx = self.client.begin_transaction().await?;
        let entity = self
            .client
            .lookup(&self.key, Some(&tx))
            .await?
            .ok_or(BrokerError::MissingAccount)?;
        let balance = entity.get_i64(BALANCE_PROPERTY)?;
        let mut updated = Entity::new(self.key.clone());
        updated.set(BALANCE_PROPERTY, Value::integer(balance + delta_cents));
        self.client
            .commit(tx, vec![Mutation::Update(updated)])
            .await?;
        Ok(())
    }
}
