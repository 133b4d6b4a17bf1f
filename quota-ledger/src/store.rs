//! Balance storage
//!
//! [`BalanceStore`] is the seam to the persistent account database.
//! [`MemoryBalanceStore`] keeps everything in `DashMap`s and records every
//! balance mutation in a journal so conservation can be checked in tests.

use crate::error::{Error, Result};
use crate::types::{Quota, TokenId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Account balances and usage counters
#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Current user balance
    async fn user_quota(&self, user: UserId) -> Result<Quota>;

    /// Debit the user only if the balance covers `amount`; returns the new balance
    async fn try_debit_user(&self, user: UserId, amount: Quota) -> Result<Quota>;

    /// Apply a signed adjustment to the user balance; returns the new balance
    async fn adjust_user(&self, user: UserId, delta: Quota) -> Result<Quota>;

    /// Current token allotment
    async fn token_quota(&self, token: TokenId) -> Result<Quota>;

    /// Debit the token only if the allotment covers `amount`
    async fn try_debit_token(&self, token: TokenId, amount: Quota) -> Result<Quota>;

    /// Apply a signed adjustment to the token allotment
    async fn adjust_token(&self, token: TokenId, delta: Quota) -> Result<Quota>;

    /// Add to the user's used quota and request count
    async fn record_user_usage(&self, user: UserId, quota: Quota) -> Result<()>;

    /// Add to the channel's used quota
    async fn record_channel_usage(&self, channel_id: i64, quota: Quota) -> Result<()>;
}

/// Account a journal entry refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Account {
    /// User balance
    User(UserId),
    /// Token allotment
    Token(TokenId),
}

/// One balance mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceMutation {
    /// Mutated account
    pub account: Account,
    /// Signed change
    pub delta: Quota,
    /// Balance after the change
    pub balance_after: Quota,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// User account row
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    /// Remaining balance
    pub quota: Quota,
    /// Lifetime consumption
    pub used_quota: Quota,
    /// Settled requests
    pub request_count: u64,
}

/// In-memory balance store
#[derive(Debug, Default)]
pub struct MemoryBalanceStore {
    users: DashMap<UserId, UserAccount>,
    tokens: DashMap<TokenId, Quota>,
    channels: DashMap<i64, Quota>,
    journal: Mutex<Vec<BalanceMutation>>,
}

impl MemoryBalanceStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user balance
    pub fn with_user(self, user: UserId, quota: Quota) -> Self {
        self.users.insert(
            user,
            UserAccount {
                quota,
                ..Default::default()
            },
        );
        self
    }

    /// Seed a token allotment
    pub fn with_token(self, token: TokenId, quota: Quota) -> Self {
        self.tokens.insert(token, quota);
        self
    }

    /// Snapshot of a user row
    pub fn user(&self, user: UserId) -> Option<UserAccount> {
        self.users.get(&user).map(|row| *row)
    }

    /// Used quota recorded against a channel
    pub fn channel_used_quota(&self, channel_id: i64) -> Quota {
        self.channels.get(&channel_id).map(|q| *q).unwrap_or(0)
    }

    /// All mutations so far, in order
    pub fn journal(&self) -> Vec<BalanceMutation> {
        self.journal.lock().clone()
    }

    /// Net change applied to one account
    pub fn net_change(&self, account: Account) -> Quota {
        self.journal
            .lock()
            .iter()
            .filter(|m| m.account == account)
            .map(|m| m.delta)
            .sum()
    }

    fn log(&self, account: Account, delta: Quota, balance_after: Quota) {
        self.journal.lock().push(BalanceMutation {
            account,
            delta,
            balance_after,
            at: Utc::now(),
        });
    }
}

#[async_trait]
impl BalanceStore for MemoryBalanceStore {
    async fn user_quota(&self, user: UserId) -> Result<Quota> {
        self.users
            .get(&user)
            .map(|row| row.quota)
            .ok_or(Error::UserNotFound(user.0))
    }

    async fn try_debit_user(&self, user: UserId, amount: Quota) -> Result<Quota> {
        let mut row = self.users.get_mut(&user).ok_or(Error::UserNotFound(user.0))?;
        if row.quota < amount {
            return Err(Error::InsufficientUserQuota {
                available: row.quota,
                required: amount,
            });
        }
        row.quota -= amount;
        self.log(Account::User(user), -amount, row.quota);
        Ok(row.quota)
    }

    async fn adjust_user(&self, user: UserId, delta: Quota) -> Result<Quota> {
        let mut row = self.users.get_mut(&user).ok_or(Error::UserNotFound(user.0))?;
        row.quota += delta;
        self.log(Account::User(user), delta, row.quota);
        Ok(row.quota)
    }

    async fn token_quota(&self, token: TokenId) -> Result<Quota> {
        self.tokens
            .get(&token)
            .map(|q| *q)
            .ok_or(Error::TokenNotFound(token.0))
    }

    async fn try_debit_token(&self, token: TokenId, amount: Quota) -> Result<Quota> {
        let mut quota = self
            .tokens
            .get_mut(&token)
            .ok_or(Error::TokenNotFound(token.0))?;
        if *quota < amount {
            return Err(Error::InsufficientTokenQuota {
                available: *quota,
                required: amount,
            });
        }
        *quota -= amount;
        self.log(Account::Token(token), -amount, *quota);
        Ok(*quota)
    }

    async fn adjust_token(&self, token: TokenId, delta: Quota) -> Result<Quota> {
        let mut quota = self
            .tokens
            .get_mut(&token)
            .ok_or(Error::TokenNotFound(token.0))?;
        *quota += delta;
        self.log(Account::Token(token), delta, *quota);
        Ok(*quota)
    }

    async fn record_user_usage(&self, user: UserId, quota: Quota) -> Result<()> {
        let mut row = self.users.get_mut(&user).ok_or(Error::UserNotFound(user.0))?;
        row.used_quota += quota;
        row.request_count += 1;
        Ok(())
    }

    async fn record_channel_usage(&self, channel_id: i64, quota: Quota) -> Result<()> {
        *self.channels.entry(channel_id).or_insert(0) += quota;
        Ok(())
    }
}
