//! The per-record unit of work.
//!
//! A user and its addresses are written inside one transaction. How an
//! address failure is settled depends on [`AddressFailurePolicy`]:
//!
//! - `Rollback` discards the whole record. This is also the only outcome
//!   PostgreSQL allows once a statement inside a transaction has failed.
//! - `CommitPartial` wraps each address in a savepoint so a failing address
//!   can be undone on its own; the user and the addresses before it commit.
//!
//! No error here ever escapes to the caller: every path ends in a
//! [`RecordOutcome`] and a log line carrying the user id.

use super::database_operations;
use crate::config::AddressFailurePolicy;
use crate::models::{Address, User};
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use std::future::Future;

/// How a single record was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// User and all of its addresses were committed.
    Committed { addresses: usize },
    /// The user row (or the transaction itself) could not be created.
    UserRejected,
    /// An address insert failed. With `rolled_back` nothing was kept;
    /// otherwise the user and `committed_addresses` addresses were.
    AddressRejected {
        committed_addresses: usize,
        rolled_back: bool,
    },
    /// Everything was staged but the commit failed.
    CommitFailed,
}

/// Destination for decoded users.
///
/// Implementations must be safe to call from many workers at once and must
/// settle each record on their own, never returning an error to the pool.
pub trait RecordSink: Send + Sync + 'static {
    fn persist(&self, user: User) -> impl Future<Output = RecordOutcome> + Send;
}

/// Writes users to PostgreSQL, one transaction per user.
#[derive(Debug, Clone)]
pub struct PgRecordSink {
    pool: PgPool,
    policy: AddressFailurePolicy,
}

impl PgRecordSink {
    pub fn new(pool: PgPool, policy: AddressFailurePolicy) -> Self {
        Self { pool, policy }
    }

    pub fn policy(&self) -> AddressFailurePolicy {
        self.policy
    }

    async fn insert_address(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        address: &Address,
    ) -> Result<(), sqlx::Error> {
        match self.policy {
            AddressFailurePolicy::Rollback => {
                database_operations::insert_address(&mut *tx, address).await
            }
            AddressFailurePolicy::CommitPartial => {
                let mut savepoint = tx.begin().await?;
                match database_operations::insert_address(&mut *savepoint, address).await {
                    Ok(()) => savepoint.commit().await,
                    Err(err) => {
                        if let Err(rollback_err) = savepoint.rollback().await {
                            log::warn!(
                                "failed to roll back savepoint for user {}: {}",
                                address.user_id,
                                rollback_err
                            );
                        }
                        Err(err)
                    }
                }
            }
        }
    }
}

impl RecordSink for PgRecordSink {
    async fn persist(&self, mut user: User) -> RecordOutcome {
        let mut tx = match self.pool.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                log::error!("failed to begin transaction for user id {}: {}", user.id, err);
                return RecordOutcome::UserRejected;
            }
        };

        if let Err(err) = database_operations::insert_user(&mut *tx, &user).await {
            log::error!("error creating user id {}: {}", user.id, err);
            rollback(tx, &user.id).await;
            return RecordOutcome::UserRejected;
        }

        user.claim_addresses();

        let mut inserted = 0;
        let mut address_failed = false;
        for address in &user.addresses {
            if let Err(err) = self.insert_address(&mut tx, address).await {
                log::error!(
                    "error creating address {} for user {}: {}",
                    inserted + 1,
                    user.id,
                    err
                );
                address_failed = true;
                break;
            }
            inserted += 1;
        }

        if address_failed && self.policy == AddressFailurePolicy::Rollback {
            rollback(tx, &user.id).await;
            return RecordOutcome::AddressRejected {
                committed_addresses: 0,
                rolled_back: true,
            };
        }

        if let Err(err) = tx.commit().await {
            log::error!("error committing user id {}: {}", user.id, err);
            return RecordOutcome::CommitFailed;
        }

        if address_failed {
            log::warn!(
                "user {} committed with {} of {} addresses",
                user.id,
                inserted,
                user.addresses.len()
            );
            RecordOutcome::AddressRejected {
                committed_addresses: inserted,
                rolled_back: false,
            }
        } else {
            log::trace!("committed user {} with {} addresses", user.id, inserted);
            RecordOutcome::Committed {
                addresses: inserted,
            }
        }
    }
}

async fn rollback(tx: Transaction<'static, Postgres>, user_id: &str) {
    if let Err(err) = tx.rollback().await {
        log::warn!("failed to roll back transaction for user id {}: {}", user_id, err);
    }
}
