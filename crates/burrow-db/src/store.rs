//! The storage interface the broker core consumes.

use crate::entities::{auth_token, domain, user, user_bandwidth};
use crate::migrator::Migrator;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sea_orm::{
    ActiveModelTrait, ActiveValue::Set, ColumnTrait, Database, DatabaseConnection, EntityTrait,
    QueryFilter,
};
use sea_orm_migration::MigratorTrait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("{0}")]
    Other(String),
}

/// Core-facing view of a user row.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub email: String,
    pub bandwidth_exempt: bool,
    pub terms_accepted: bool,
}

impl From<user::Model> for User {
    fn from(m: user::Model) -> Self {
        Self {
            id: m.id,
            email: m.email,
            bandwidth_exempt: m.bandwidth_exempt,
            terms_accepted: m.terms_accepted,
        }
    }
}

/// SHA-256 hex digest of a plaintext token, the only form ever persisted.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Everything the broker core asks of persistent storage.
#[async_trait]
pub trait Store: Send + Sync {
    /// Resolve a plaintext token to its owning user, or `None`.
    async fn validate_token(&self, token: &str) -> Result<Option<User>, StoreError>;

    /// Bare domain labels the user owns.
    async fn user_domains(&self, user_id: i64) -> Result<Vec<String>, StoreError>;

    /// Whether `name` is owned by `user_id`.
    async fn domain_owned_by(&self, name: &str, user_id: i64) -> Result<bool, StoreError>;

    /// Accumulate bytes onto the user's counter for `date`.
    async fn add_bandwidth(&self, user_id: i64, date: NaiveDate, bytes: u64)
        -> Result<(), StoreError>;

    /// Persisted counter value for `(user, date)`; 0 when absent.
    async fn bandwidth_used(&self, user_id: i64, date: NaiveDate) -> Result<u64, StoreError>;
}

/// Sqlite-backed store.
pub struct SqlStore {
    db: DatabaseConnection,
}

impl SqlStore {
    /// Connect and bring the schema up to date.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let db = Database::connect(url).await?;
        Migrator::up(&db, None).await?;
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn create_user(
        &self,
        email: &str,
        bandwidth_exempt: bool,
        terms_accepted: bool,
    ) -> Result<User, StoreError> {
        let model = user::ActiveModel {
            email: Set(email.to_string()),
            bandwidth_exempt: Set(bandwidth_exempt),
            terms_accepted: Set(terms_accepted),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(model.into())
    }

    /// Store the hash of `token` for `user_id`. The caller shows the
    /// plaintext to the user once; it is not recoverable afterwards.
    pub async fn create_token(&self, user_id: i64, token: &str) -> Result<(), StoreError> {
        auth_token::ActiveModel {
            user_id: Set(user_id),
            token_hash: Set(hash_token(token)),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn create_domain(&self, user_id: i64, name: &str) -> Result<(), StoreError> {
        domain::ActiveModel {
            name: Set(name.to_string()),
            user_id: Set(user_id),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    /// Seed a test account when the database is empty. Local dev only.
    pub async fn seed_dev_data(&self) -> Result<(), StoreError> {
        if user::Entity::find().one(&self.db).await?.is_some() {
            return Ok(());
        }

        info!("seeding dev data");
        let user = self.create_user("test@example.com", false, true).await?;
        self.create_token(user.id, "sk_live_12345").await?;
        for name in ["misty-river", "silent-star", "bold-eagle"] {
            self.create_domain(user.id, name).await?;
        }
        info!(user_id = user.id, "dev seed complete, token sk_live_12345");
        Ok(())
    }
}

#[async_trait]
impl Store for SqlStore {
    async fn validate_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let hash = hash_token(token);
        let row = auth_token::Entity::find()
            .filter(auth_token::Column::TokenHash.eq(hash))
            .find_also_related(user::Entity)
            .one(&self.db)
            .await?;

        Ok(row.and_then(|(_, u)| u).map(User::from))
    }

    async fn user_domains(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let rows = domain::Entity::find()
            .filter(domain::Column::UserId.eq(user_id))
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|d| d.name).collect())
    }

    async fn domain_owned_by(&self, name: &str, user_id: i64) -> Result<bool, StoreError> {
        let row = domain::Entity::find()
            .filter(domain::Column::Name.eq(name))
            .filter(domain::Column::UserId.eq(user_id))
            .one(&self.db)
            .await?;
        Ok(row.is_some())
    }

    async fn add_bandwidth(
        &self,
        user_id: i64,
        date: NaiveDate,
        bytes: u64,
    ) -> Result<(), StoreError> {
        let existing = user_bandwidth::Entity::find_by_id((user_id, date))
            .one(&self.db)
            .await?;

        match existing {
            Some(row) => {
                let total = row.bytes_used.saturating_add(bytes as i64);
                let mut active: user_bandwidth::ActiveModel = row.into();
                active.bytes_used = Set(total);
                active.update(&self.db).await?;
            }
            None => {
                user_bandwidth::ActiveModel {
                    user_id: Set(user_id),
                    date: Set(date),
                    bytes_used: Set(bytes as i64),
                }
                .insert(&self.db)
                .await?;
            }
        }
        Ok(())
    }

    async fn bandwidth_used(&self, user_id: i64, date: NaiveDate) -> Result<u64, StoreError> {
        let row = user_bandwidth::Entity::find_by_id((user_id, date))
            .one(&self.db)
            .await?;
        Ok(row.map(|r| r.bytes_used.max(0) as u64).unwrap_or(0))
    }
}

/// In-memory store for tests and throwaway dev setups.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    users: Vec<User>,
    /// token hash -> user id
    tokens: HashMap<String, i64>,
    /// domain name -> user id
    domains: HashMap<String, i64>,
    bandwidth: HashMap<(i64, NaiveDate), u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a user with a plaintext token and owned domains; returns the id.
    pub fn add_user(&self, email: &str, token: &str, domains: &[&str]) -> i64 {
        self.add_user_full(email, token, domains, false, true)
    }

    pub fn add_user_full(
        &self,
        email: &str,
        token: &str,
        domains: &[&str],
        bandwidth_exempt: bool,
        terms_accepted: bool,
    ) -> i64 {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let id = inner.users.len() as i64 + 1;
        inner.users.push(User {
            id,
            email: email.to_string(),
            bandwidth_exempt,
            terms_accepted,
        });
        inner.tokens.insert(hash_token(token), id);
        for d in domains {
            inner.domains.insert(d.to_string(), id);
        }
        id
    }

    /// Seed the same fixture account the sqlite store seeds in dev.
    pub fn with_dev_seed() -> Self {
        let store = Self::new();
        store.add_user(
            "test@example.com",
            "sk_live_12345",
            &["misty-river", "silent-star", "bold-eagle"],
        );
        store
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn validate_token(&self, token: &str) -> Result<Option<User>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let user = inner
            .tokens
            .get(&hash_token(token))
            .and_then(|id| inner.users.iter().find(|u| u.id == *id))
            .cloned();
        Ok(user)
    }

    async fn user_domains(&self, user_id: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut names: Vec<String> = inner
            .domains
            .iter()
            .filter(|(_, uid)| **uid == user_id)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    async fn domain_owned_by(&self, name: &str, user_id: i64) -> Result<bool, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.domains.get(name) == Some(&user_id))
    }

    async fn add_bandwidth(
        &self,
        user_id: i64,
        date: NaiveDate,
        bytes: u64,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        *inner.bandwidth.entry((user_id, date)).or_insert(0) += bytes;
        Ok(())
    }

    async fn bandwidth_used(&self, user_id: i64, date: NaiveDate) -> Result<u64, StoreError> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(inner.bandwidth.get(&(user_id, date)).copied().unwrap_or(0))
    }
}
