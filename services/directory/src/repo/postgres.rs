//! Durable store glue: the `entry` table, its statement set, and the
//! DB-to-cache projection paths.
//!
//! # Transactionality
//! Every mutating statement runs inside a read-committed transaction with
//! explicit `FOR UPDATE` row locks, and carries the pre-image `rev` in its
//! WHERE clause. The change notification (`pg_notify`) is emitted inside
//! the same transaction, so data and notification commit together.
//!
//! # Error mapping
//! SQLSTATE `23505` (duplicate key) surfaces as `AlreadyExists` at the call
//! sites that can race on names, `23503` (foreign key) as a transient retry
//! or `NotAllowedOnNonLeaf` on delete, `40P01` (deadlock) always as a
//! retry.
use super::changelog::ModOperation;
use super::cache::{should_version_update, CacheTx};
use super::{NotifyMessage, Repository};
use canopy_common::{LdapError, LdapResult};
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::time::Instant;

/// Row shape of the `entry` table. Kept separate from the cached form so
/// schema details stay local to this module.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct DbEntry {
    pub id: i64,
    pub rev: i64,
    pub parent_id: i64,
    pub path: Option<Vec<i64>>,
    pub is_container: bool,
    #[allow(dead_code)]
    pub rdn_norm: String,
    pub rdn_orig: String,
    pub attrs_orig: serde_json::Value,
}

/// Row shape for lock statements that also fetch the parent's path through
/// a correlated, locking subselect.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct LockedEntry {
    pub id: i64,
    pub rev: i64,
    pub path: Option<Vec<i64>>,
    pub is_container: bool,
    pub parent_path: Option<Vec<i64>>,
}

/// Row shape for subtree locks taken during a move.
#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct TreeEntry {
    pub id: i64,
    pub rev: i64,
    pub path: Option<Vec<i64>>,
    pub is_container: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub(crate) struct IdRev {
    pub id: i64,
    pub rev: i64,
}

const ENTRY_COLUMNS: &str =
    "e.id, e.rev, e.parent_id, e.path, e.is_container, e.rdn_norm, e.rdn_orig, e.attrs_orig";

pub(crate) const FIND_ENTRY_BY_ID: &str =
    "SELECT e.id, e.rev, e.parent_id, e.path, e.is_container, e.rdn_norm, e.rdn_orig, e.attrs_orig
     FROM entry e WHERE e.id = $1";

pub(crate) const FIND_SUB_CONTAINERS_BY_PATH: &str =
    "SELECT e.id, e.rev, e.parent_id, e.path, e.is_container, e.rdn_norm, e.rdn_orig, e.attrs_orig
     FROM entry e WHERE e.path @> $1 AND e.id != $2";

/// Lock the parent for an insert, and the grandparent's path row through
/// the correlated subselect.
pub(crate) const LOCK_ENTRY_FOR_INSERT: &str =
    "SELECT e.id, e.rev, e.path, e.is_container,
        (SELECT path FROM entry WHERE id = e.parent_id FOR UPDATE) AS parent_path
     FROM entry e WHERE e.id = $1 FOR UPDATE";

pub(crate) const LOCK_ENTRY_FOR_UPDATE: &str =
    "SELECT e.id, e.rev, e.parent_id, e.path, e.is_container, e.rdn_norm, e.rdn_orig, e.attrs_orig
     FROM entry e WHERE e.id = $1 FOR UPDATE";

/// One statement locks the old parent, the entry and every sub-container
/// below it; lock order is parent, then self, then descendants.
pub(crate) const LOCK_TREE_FOR_MOVE: &str =
    "SELECT e.id, e.rev, e.path, e.is_container
     FROM entry e WHERE e.id = $1 OR e.path @> $2 FOR UPDATE";

pub(crate) const LOCK_ENTRY_FOR_DELETE: &str =
    "SELECT e.id, e.rev FROM entry e WHERE e.id = $1 FOR UPDATE";

pub(crate) const FIND_CHILD_BY_PARENT_ID: &str =
    "SELECT e.id, e.rev FROM entry e WHERE e.parent_id = $1 LIMIT 1";

pub(crate) const INSERT_ROOT_ENTRY: &str =
    "INSERT INTO entry (uuid, rev, parent_id, is_container, rdn_norm, rdn_orig, attrs_orig)
     VALUES ($1, 1, 0, FALSE, $2, $3, $4) RETURNING id";

pub(crate) const INSERT_ENTRY: &str =
    "INSERT INTO entry (uuid, rev, parent_id, is_container, rdn_norm, rdn_orig, attrs_orig)
     VALUES ($1, 1, $2, FALSE, $3, $4, $5) RETURNING id";

/// Promote or demote a container. The `is_container != $4` guard makes the
/// statement a no-op when another writer already flipped it.
pub(crate) const UPDATE_CONTAINER: &str =
    "UPDATE entry SET rev = rev + 1, path = $3, is_container = $4
     WHERE id = $1 AND rev = $2 AND is_container != $4";

pub(crate) const UPDATE_PARENT: &str =
    "UPDATE entry SET parent_id = $3 WHERE id = $1 AND rev = $2";

pub(crate) const UPDATE_PARENT_WITH_PATH: &str =
    "UPDATE entry SET parent_id = $3, path = $4 WHERE id = $1 AND rev = $2";

pub(crate) const UPDATE_PATH: &str =
    "UPDATE entry SET rev = rev + 1, path = $3 WHERE id = $1 AND rev = $2";

pub(crate) const DELETE_BY_ID: &str = "DELETE FROM entry WHERE id = $1";

/// Append this entry's id to the `memberOf` array of every target entry.
pub(crate) const ADD_MEMBER_OF: &str =
    "UPDATE entry
     SET attrs_orig = JSONB_SET(attrs_orig, ARRAY['memberOf'],
            COALESCE(attrs_orig->'memberOf', '[]'::jsonb) || ($1)::jsonb),
         rev = rev + 1
     WHERE id = ANY($2)";

/// Remove this entry's id from the `memberOf` array of every target entry.
pub(crate) const DELETE_MEMBER_OF: &str =
    "UPDATE entry
     SET attrs_orig = JSONB_SET(attrs_orig, ARRAY['memberOf'],
            COALESCE(attrs_orig->'memberOf', '[]'::jsonb) - ($1)::text),
         rev = rev + 1
     WHERE id = ANY($2)";

/// Scrub a deleted entry's id out of `member`/`uniqueMember` of the groups
/// that referenced it.
pub(crate) const SCRUB_MEMBER: &str =
    "UPDATE entry
     SET attrs_orig = JSONB_SET(
            JSONB_SET(attrs_orig, ARRAY['member'],
                COALESCE(attrs_orig->'member', '[]'::jsonb) - ($1)::text),
            ARRAY['uniqueMember'],
            COALESCE(attrs_orig->'uniqueMember', '[]'::jsonb) - ($1)::text),
         rev = rev + 1
     WHERE id = ANY($2)";

pub(crate) const NOTIFY: &str = "SELECT pg_notify('entry_update', $1)";

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    sqlstate(err) == Some("23505".to_string())
}

pub(crate) fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    sqlstate(err) == Some("23503".to_string())
}

pub(crate) fn is_deadlock(err: &sqlx::Error) -> bool {
    sqlstate(err) == Some("40P01".to_string())
}

fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().map(|code| code.to_string()),
        _ => None,
    }
}

/// Map a statement failure: deadlocks and racing foreign keys are
/// transient, everything else is infrastructure.
pub(crate) fn map_exec_err(err: sqlx::Error) -> LdapError {
    if is_deadlock(&err) || is_foreign_key_violation(&err) {
        return LdapError::retry(err);
    }
    LdapError::unavailable(err)
}

/// Bind value for one dynamically composed patch fragment.
pub(crate) enum PatchBind {
    Json(serde_json::Value),
    TextArray(Vec<String>),
}

pub(crate) fn bind_patch<'q>(
    query: Query<'q, Postgres, PgArguments>,
    bind: PatchBind,
) -> Query<'q, Postgres, PgArguments> {
    match bind {
        PatchBind::Json(value) => query.bind(value),
        PatchBind::TextArray(values) => query.bind(values),
    }
}

pub(crate) struct AttrsPatch {
    /// `JSONB_BUILD_OBJECT` fragments, each starting with a comma.
    pub fragments: String,
    pub binds: Vec<PatchBind>,
}

/// Compose the per-attribute JSONB expressions for a single UPDATE:
/// replace sets the array, add appends, delete subtracts, add+delete
/// appends then subtracts, clear stores the empty array. `$n` numbering
/// starts at `first_param`.
pub(crate) fn build_attrs_patch(
    ops: &HashMap<String, ModOperation>,
    first_param: usize,
) -> AttrsPatch {
    let mut fragments = String::new();
    let mut binds = Vec::new();
    let mut param = first_param;
    // Deterministic statement text for identical diffs.
    let mut names: Vec<&String> = ops.keys().collect();
    names.sort();
    for name in names {
        let op = &ops[name];
        if op.is_replace() {
            fragments.push_str(&format!(", '{name}', (${param})::jsonb"));
            binds.push(PatchBind::Json(serde_json::json!(op.replace)));
            param += 1;
        } else if op.is_add() && !op.is_delete() {
            fragments.push_str(&format!(
                ", '{name}', COALESCE(attrs_orig->'{name}', '[]'::jsonb) || (${param})::jsonb"
            ));
            binds.push(PatchBind::Json(serde_json::json!(op.add)));
            param += 1;
        } else if !op.is_add() && op.is_delete() {
            fragments.push_str(&format!(
                ", '{name}', COALESCE(attrs_orig->'{name}', '[]'::jsonb) - (${param})::text[]"
            ));
            binds.push(PatchBind::TextArray(op.delete.clone()));
            param += 1;
        } else if op.is_add() && op.is_delete() {
            fragments.push_str(&format!(
                ", '{name}', (COALESCE(attrs_orig->'{name}', '[]'::jsonb) || (${param})::jsonb) - (${})::text[]",
                param + 1
            ));
            binds.push(PatchBind::Json(serde_json::json!(op.add)));
            binds.push(PatchBind::TextArray(op.delete.clone()));
            param += 2;
        } else {
            fragments.push_str(&format!(", '{name}', '[]'::jsonb"));
        }
    }
    AttrsPatch { fragments, binds }
}

impl Repository {
    /// Create the schema objects and seed the super-root sentinel.
    pub(crate) async fn init(&self) -> anyhow::Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS pgcrypto")
            .execute(self.pool())
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entry (
                id BIGSERIAL PRIMARY KEY,
                uuid UUID NOT NULL,
                rev BIGINT NOT NULL,
                parent_id BIGINT NOT NULL,
                path BIGINT[],
                is_container BOOLEAN NOT NULL,
                rdn_norm TEXT NOT NULL,
                rdn_orig TEXT NOT NULL,
                attrs_orig JSONB NOT NULL,
                CONSTRAINT uniq_entry UNIQUE (parent_id, rdn_norm),
                CONSTRAINT uniq_uuid UNIQUE (uuid),
                CONSTRAINT fk_id FOREIGN KEY (parent_id) REFERENCES entry (id)
                    ON DELETE RESTRICT ON UPDATE RESTRICT
            )",
        )
        .execute(self.pool())
        .await?;
        // The implicit super-root all naming-context roots hang off.
        sqlx::query(
            "INSERT INTO entry VALUES
                (0, gen_random_uuid(), 1, 0, ARRAY[]::BIGINT[], TRUE, 'dc=0', 'dc=0',
                 '{\"dc\": [\"0\"], \"objectClass\": [\"dcObject\"]}')
             ON CONFLICT DO NOTHING",
        )
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Load every entry from the durable store into the cache. Runs at
    /// startup and on operator-requested refresh.
    pub(crate) async fn cache_all(&self) -> anyhow::Result<()> {
        tracing::info!("caching all entries");
        let started = Instant::now();

        let mut cache_tx = self.cache().begin();
        let rows = sqlx::query_as::<_, DbEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entry e WHERE e.id != 0"
        ))
        .fetch_all(self.pool())
        .await?;
        let count = rows.len();
        for row in rows {
            let entry = self.cache().project(&row)?;
            cache_tx.upsert(entry);
        }
        self.cache().commit(cache_tx).await?;

        tracing::info!(count, elapsed = ?started.elapsed(), "cached all entries");
        Ok(())
    }

    /// Drop the cache and rebuild it from the durable store.
    pub async fn refresh_cache(&self) -> anyhow::Result<()> {
        tracing::info!("clearing all cache entries");
        self.cache().truncate().await;
        self.cache_all().await
    }

    /// Fetch the latest row for `id` and stage its projection; with
    /// `assoc`, also re-project the membership targets it references.
    pub(crate) async fn cache_entry_by_id(
        &self,
        cache_tx: &mut CacheTx<'_>,
        db_tx: &mut Transaction<'_, Postgres>,
        id: i64,
        assoc: bool,
    ) -> LdapResult<()> {
        let row = sqlx::query_as::<_, DbEntry>(FIND_ENTRY_BY_ID)
            .bind(id)
            .fetch_one(&mut **db_tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => LdapError::NoSuchObject,
                other => map_exec_err(other),
            })?;

        let entry = self.cache().project(&row)?;
        let attrs_orig = entry.attrs_orig.clone();
        cache_tx.upsert(entry);

        if assoc {
            let mut targets = Vec::new();
            for name in ["member", "uniqueMember"] {
                for value in attrs_orig.get(name).map(Vec::as_slice).unwrap_or_default() {
                    match value.parse::<i64>() {
                        Ok(target) if !targets.contains(&target) => targets.push(target),
                        Ok(_) => {}
                        Err(_) => {
                            tracing::warn!(value, "association value is not an entry id, ignored");
                        }
                    }
                }
            }
            self.cache_association(cache_tx, db_tx, &targets).await?;
        }
        Ok(())
    }

    /// Re-project every sub-container below `id` (after a subtree move).
    pub(crate) async fn cache_entry_by_subtree(
        &self,
        cache_tx: &mut CacheTx<'_>,
        db_tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> LdapResult<()> {
        let rows = sqlx::query_as::<_, DbEntry>(FIND_SUB_CONTAINERS_BY_PATH)
            .bind(vec![id])
            .bind(id)
            .fetch_all(&mut **db_tx)
            .await
            .map_err(map_exec_err)?;
        for row in rows {
            let entry = self.cache().project(&row)?;
            cache_tx.upsert(entry);
        }
        Ok(())
    }

    /// Refresh the cached projection of membership peers, guarded by `rev`
    /// so an already-newer cache entry is left alone.
    pub(crate) async fn cache_association(
        &self,
        cache_tx: &mut CacheTx<'_>,
        db_tx: &mut Transaction<'_, Postgres>,
        targets: &[i64],
    ) -> LdapResult<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let rows = sqlx::query_as::<_, DbEntry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entry e WHERE e.id = ANY($1)"
        ))
        .bind(targets.to_vec())
        .fetch_all(&mut **db_tx)
        .await
        .map_err(map_exec_err)?;

        for row in rows {
            if let Some(cached) = cache_tx.get(row.id).await {
                if !should_version_update(row.rev, cached.rev) {
                    tracing::info!(
                        id = row.id,
                        cache_rev = cached.rev,
                        db_rev = row.rev,
                        "association target already cached with a newer revision, ignored"
                    );
                    continue;
                }
            }
            let entry = self.cache().project(&row)?;
            cache_tx.upsert(entry);
        }
        Ok(())
    }

    /// Remove an entry from the cache; with `assoc`, re-project every peer
    /// reachable through its membership attributes.
    pub(crate) async fn delete_cache_entry(
        &self,
        cache_tx: &mut CacheTx<'_>,
        db_tx: &mut Transaction<'_, Postgres>,
        id: i64,
        assoc: bool,
    ) -> LdapResult<()> {
        let cached = self.cache().get(id).await;
        cache_tx.delete(id);

        if assoc {
            if let Some(cached) = cached {
                let mut targets = Vec::new();
                for name in ["member", "uniqueMember", "memberOf"] {
                    for target in cached.norm_ints(name) {
                        if !targets.contains(&target) {
                            targets.push(target);
                        }
                    }
                }
                self.cache_association(cache_tx, db_tx, &targets).await?;
            }
        }
        Ok(())
    }

    /// Publish the change record on the notification channel, inside the
    /// caller's transaction.
    pub(crate) async fn notify(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        m: &NotifyMessage,
    ) -> LdapResult<()> {
        let payload = serde_json::to_string(m).map_err(LdapError::unavailable)?;
        sqlx::query(NOTIFY)
            .bind(payload)
            .execute(&mut **db_tx)
            .await
            .map_err(map_exec_err)?;
        Ok(())
    }

    /// Apply a change record to the cache: invoked synchronously for this
    /// node's own commits and by the channel listener for remote ones.
    /// Upserts are gated on `rev` strictly increasing per id.
    pub async fn on_update(&self, m: &NotifyMessage) -> LdapResult<()> {
        let mut cache_tx = self.cache().begin();
        let mut db_tx = self.pool().begin().await.map_err(LdapError::unavailable)?;

        let do_update = self.cache().should_apply(m.id, m.rev).await;
        if !do_update && m.is_mod() {
            tracing::warn!(
                id = m.id,
                rev = m.rev,
                "already cached with a newer revision, ignored"
            );
        }

        if (m.is_add() || m.is_mod()) && do_update {
            self.cache_entry_by_id(&mut cache_tx, &mut db_tx, m.id, m.association)
                .await?;
            tracing::debug!(id = m.id, rev = m.rev, "upserting cache entry");
            for id in &m.dependant {
                self.cache_entry_by_id(&mut cache_tx, &mut db_tx, *id, false)
                    .await?;
            }
            if m.sub {
                self.cache_entry_by_subtree(&mut cache_tx, &mut db_tx, m.id)
                    .await?;
            }
        } else if m.is_del() {
            self.delete_cache_entry(&mut cache_tx, &mut db_tx, m.id, true)
                .await?;
            tracing::debug!(id = m.id, rev = m.rev, "deleting cache entry");
            for id in &m.dependant {
                self.cache_entry_by_id(&mut cache_tx, &mut db_tx, *id, false)
                    .await?;
            }
        } else {
            // Nothing to apply.
            return Ok(());
        }

        // The DB transaction was read-only; dropping it rolls it back.
        drop(db_tx);
        self.cache().commit(cache_tx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(add: &[&str], replace: &[&str], delete: &[&str]) -> ModOperation {
        ModOperation {
            add: add.iter().map(|v| v.to_string()).collect(),
            replace: replace.iter().map(|v| v.to_string()).collect(),
            delete: delete.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn patch_fragments_per_operation_kind() {
        let mut ops = HashMap::new();
        ops.insert("sn".to_string(), op(&[], &["Roe"], &[]));
        let patch = build_attrs_patch(&ops, 5);
        assert_eq!(patch.fragments, ", 'sn', ($5)::jsonb");
        assert_eq!(patch.binds.len(), 1);

        let mut ops = HashMap::new();
        ops.insert("telephoneNumber".to_string(), op(&["333"], &[], &["111"]));
        let patch = build_attrs_patch(&ops, 5);
        assert_eq!(
            patch.fragments,
            ", 'telephoneNumber', (COALESCE(attrs_orig->'telephoneNumber', '[]'::jsonb) || ($5)::jsonb) - ($6)::text[]"
        );
        assert_eq!(patch.binds.len(), 2);

        let mut ops = HashMap::new();
        ops.insert("description".to_string(), ModOperation::default());
        let patch = build_attrs_patch(&ops, 5);
        assert_eq!(patch.fragments, ", 'description', '[]'::jsonb");
        assert!(patch.binds.is_empty());
    }

    #[test]
    fn patch_orders_attributes_deterministically() {
        let mut ops = HashMap::new();
        ops.insert("b".to_string(), op(&["1"], &[], &[]));
        ops.insert("a".to_string(), op(&[], &["2"], &[]));
        let patch = build_attrs_patch(&ops, 3);
        let a_pos = patch.fragments.find("'a'").expect("a");
        let b_pos = patch.fragments.find("'b'").expect("b");
        assert!(a_pos < b_pos);
        // Parameters number left to right.
        assert!(patch.fragments.contains("($3)::jsonb"));
        assert!(patch.fragments.contains("($4)::jsonb"));
    }

    #[test]
    fn sqlstate_helpers_only_match_database_errors() {
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
        assert!(!is_foreign_key_violation(&sqlx::Error::RowNotFound));
        assert!(!is_deadlock(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn exec_errors_map_to_unavailable_by_default() {
        let err = map_exec_err(sqlx::Error::PoolTimedOut);
        assert!(!err.is_retryable());
        assert_eq!(err.result_code(), 52);
    }
}
