//! Entry repository.
//!
//! # Purpose
//! The repository owns every structural change to the directory tree. It
//! coordinates two stores: the authoritative `entry` table in Postgres
//! (transactional, row-locked) and an in-memory index holding a normalized
//! projection of every entry. Mutations run against Postgres first and are
//! projected into the cache on commit; other nodes learn about them through
//! the `entry_update` notification channel and converge via [`Repository::on_update`].
//!
//! # Consistency model
//! - Every mutation bumps the entry's `rev`; updates carry the pre-image
//!   `rev` in their WHERE clause, so a concurrent writer surfaces as a
//!   zero-row update and is retried.
//! - The cache applies a change only when the incoming `rev` exceeds the
//!   cached one, so replayed or reordered notifications cannot regress it.
//! - When both stores are written, Postgres commits first. A cache commit
//!   failure leaves Postgres authoritative; the cache heals on the next
//!   notification for the same entry.
mod bind;
mod cache;
mod changelog;
mod delete;
mod filter;
mod insert;
mod listener;
mod postgres;
mod search;
mod session;
mod update;
mod update_dn;

#[cfg(all(test, feature = "pg-tests"))]
mod pg_tests;

pub use cache::{CacheEntry, EntryCache, IndexValue};
pub use changelog::{Changelog, ModOperation};
pub use filter::Filter;
pub use session::SimplePagedResultsCache;

use crate::config::RepositoryConfig;
use canopy_common::LdapError;
use canopy_schema::{Dn, PPolicy, SchemaRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Attribute name to original (user-typed) values, the shape stored in the
/// `attrs_orig` JSONB column.
pub type AttrsOrig = HashMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyOp {
    Add,
    Mod,
    ModRdn,
    Del,
}

/// Compact change record published on the `entry_update` channel and
/// applied to the cache, locally at commit time and remotely through the
/// listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyMessage {
    /// Server id of the originating node.
    #[serde(rename = "iss")]
    pub issuer: String,
    pub id: i64,
    pub op: NotifyOp,
    /// Post-mutation revision; for deletes, the deleted revision.
    pub rev: i64,
    /// Membership attributes changed; peers need re-projection.
    #[serde(rename = "asc")]
    pub association: bool,
    /// Entries whose container flag flipped as a side effect.
    #[serde(rename = "dep", default)]
    pub dependant: Vec<i64>,
    /// A subtree move happened; descendant containers need re-projection.
    #[serde(default)]
    pub sub: bool,
}

impl NotifyMessage {
    pub fn is_add(&self) -> bool {
        self.op == NotifyOp::Add
    }

    pub fn is_mod(&self) -> bool {
        self.op == NotifyOp::Mod || self.op == NotifyOp::ModRdn
    }

    pub fn is_del(&self) -> bool {
        self.op == NotifyOp::Del
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    One,
    Sub,
    Children,
}

impl SearchScope {
    pub fn from_i32(scope: i32) -> Option<Self> {
        match scope {
            0 => Some(SearchScope::Base),
            1 => Some(SearchScope::One),
            2 => Some(SearchScope::Sub),
            3 => Some(SearchScope::Children),
            _ => None,
        }
    }
}

pub struct SearchOption {
    pub scope: SearchScope,
    pub filter: Filter,
    pub page_size: i32,
    pub offset: i32,
    /// Association attributes whose id values the caller wants rendered as
    /// DNs in the response.
    pub requested_association: Vec<String>,
    pub member_of_requested: bool,
    pub has_subordinates_requested: bool,
}

/// One search hit: the reconstructed original DN plus the entry's original
/// attribute values.
pub struct SearchEntry {
    schema: Arc<SchemaRegistry>,
    dn_orig: String,
    attrs_orig: AttrsOrig,
}

impl SearchEntry {
    pub fn new(schema: Arc<SchemaRegistry>, dn_orig: String, attrs_orig: AttrsOrig) -> Self {
        SearchEntry {
            schema,
            dn_orig,
            attrs_orig,
        }
    }

    pub fn dn_orig(&self) -> &str {
        &self.dn_orig
    }

    pub fn attrs_orig(&self) -> &AttrsOrig {
        &self.attrs_orig
    }

    pub(crate) fn attrs_orig_mut(&mut self) -> &mut AttrsOrig {
        &mut self.attrs_orig
    }

    /// Values for one attribute, resolved case-insensitively through the
    /// schema. Returns the canonical name alongside the values.
    pub fn attr_orig(&self, attr_name: &str) -> Option<(String, Vec<String>)> {
        let at = self.schema.attribute_type(attr_name)?;
        let values = self.attrs_orig.get(&at.name)?;
        Some((at.name.clone(), values.clone()))
    }

    pub fn attrs_orig_without_operational_attrs(&self) -> AttrsOrig {
        self.filtered_attrs(false)
    }

    pub fn operational_attrs_orig(&self) -> AttrsOrig {
        self.filtered_attrs(true)
    }

    fn filtered_attrs(&self, operational: bool) -> AttrsOrig {
        self.attrs_orig
            .iter()
            .filter(|(name, _)| {
                self.schema
                    .attribute_type(name)
                    .map(|at| at.is_operational() == operational)
                    .unwrap_or(false)
            })
            .map(|(name, values)| (name.clone(), values.clone()))
            .collect()
    }
}

/// Everything the bind handler needs to verify a credential and evaluate
/// the lockout policy, fetched from the cache in one shot.
pub struct FetchedCredential {
    pub id: i64,
    /// `userPassword` values.
    pub credential: Vec<String>,
    /// DNs of the groups the entry belongs to.
    pub member_of: Vec<Dn>,
    pub ppolicy: PPolicy,
    pub pwd_account_locked_time: Option<DateTime<Utc>>,
    pub last_pwd_failure_time: Option<DateTime<Utc>>,
    pub pwd_failure_count: usize,
}

/// The repository facade. Shared process-wide; all operations are safe
/// under concurrent invocation.
pub struct Repository {
    db: PgPool,
    cache: EntryCache,
    schema: Arc<SchemaRegistry>,
    config: RepositoryConfig,
}

impl Repository {
    /// Connect to Postgres, ensure the schema objects exist, warm the cache
    /// from the full table, and start the notification listener.
    pub async fn connect(
        config: RepositoryConfig,
        schema: Arc<SchemaRegistry>,
    ) -> anyhow::Result<Arc<Repository>> {
        let options = PgConnectOptions::new()
            .host(&config.db_host)
            .port(config.db_port)
            .username(&config.db_user)
            .password(&config.db_password)
            .database(&config.db_name)
            .options([("search_path", config.db_schema.as_str())]);
        // Bounded pool with a bounded acquire so an unhealthy database
        // fails requests fast instead of hanging them.
        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_open_conns)
            .min_connections(config.db_max_idle_conns)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        Self::with_pool(pool, config, schema).await
    }

    /// Build the repository on an existing pool. Used by `connect` and by
    /// the integration tests.
    pub async fn with_pool(
        pool: PgPool,
        config: RepositoryConfig,
        schema: Arc<SchemaRegistry>,
    ) -> anyhow::Result<Arc<Repository>> {
        let repo = Arc::new(Repository {
            db: pool,
            cache: EntryCache::new(schema.clone()),
            schema,
            config,
        });
        repo.init().await?;
        repo.cache_all().await?;
        listener::spawn(repo.clone());
        Ok(repo)
    }

    pub fn schema(&self) -> &Arc<SchemaRegistry> {
        &self.schema
    }

    pub fn server_id(&self) -> &str {
        &self.config.server_id
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.db
    }

    pub(crate) fn cache(&self) -> &EntryCache {
        &self.cache
    }

    /// Run one attempt of a mutating operation, retrying on transient
    /// conflicts (optimistic `rev` mismatch, deadlock, racing foreign key)
    /// up to the configured bound. Retries are immediate.
    pub(crate) fn should_retry(&self, err: &LdapError, attempt: u32) -> bool {
        if !err.is_retryable() {
            return false;
        }
        if attempt >= self.config.max_retry {
            tracing::warn!(attempt, error = %err, "giving up after max retries");
            return false;
        }
        metrics::counter!("canopy_repo_retries_total").increment(1);
        true
    }
}
