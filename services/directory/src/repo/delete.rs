//! Delete operation.
use super::postgres::{
    is_foreign_key_violation, map_exec_err, DbEntry, IdRev, DELETE_BY_ID, FIND_CHILD_BY_PARENT_ID,
    FIND_ENTRY_BY_ID, LOCK_ENTRY_FOR_DELETE, SCRUB_MEMBER, UPDATE_CONTAINER,
};
use super::{AttrsOrig, NotifyMessage, NotifyOp, Repository};
use canopy_common::{LdapError, LdapResult};
use canopy_schema::Dn;
use sqlx::{Postgres, Transaction};

impl Repository {
    /// Delete the entry at `dn`. Fails with `NotAllowedOnNonLeaf` while
    /// children exist; otherwise removes the row, scrubs both directions of
    /// its membership, and demotes a parent left childless.
    pub async fn delete_by_dn(&self, dn: &Dn) -> LdapResult<()> {
        let mut attempt = 0;
        loop {
            match self.delete_once(dn).await {
                Err(err) if self.should_retry(&err, attempt) => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn delete_once(&self, dn: &Dn) -> LdapResult<()> {
        let mut db_tx = self.pool().begin().await.map_err(LdapError::unavailable)?;
        let m = self.delete_internal(&mut db_tx, dn).await?;
        db_tx.commit().await.map_err(map_exec_err)?;

        self.on_update(&m).await.map_err(|err| {
            tracing::error!(id = m.id, dn_norm = %dn.dn_norm_str(), error = %err,
                "failed to remove deleted entry from the cache");
            err
        })?;

        metrics::counter!("canopy_entry_changes_total", "op" => "del").increment(1);
        tracing::info!(id = m.id, dn_norm = %dn.dn_norm_str(), "deleted");
        Ok(())
    }

    async fn delete_internal(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        dn: &Dn,
    ) -> LdapResult<NotifyMessage> {
        // Step 1: resolve the id chain through the cache.
        let path = self.cache().find_entry_path(dn).await?;
        let is_root = path.len() == 1;
        let id = *path.last().ok_or(LdapError::NoSuchObject)?;

        // Step 2: lock the parent (non-root only).
        let mut parent: Option<IdRev> = None;
        if !is_root {
            let locked = sqlx::query_as::<_, IdRev>(LOCK_ENTRY_FOR_DELETE)
                .bind(path[path.len() - 2])
                .fetch_one(&mut **db_tx)
                .await
                .map_err(|err| match err {
                    sqlx::Error::RowNotFound => LdapError::NoSuchObject,
                    other => map_exec_err(other),
                })?;
            parent = Some(locked);
        }

        // Step 3: fetch the entry; its attributes drive membership cleanup
        // and its revision goes out with the delete notification.
        let row = sqlx::query_as::<_, DbEntry>(FIND_ENTRY_BY_ID)
            .bind(id)
            .fetch_one(&mut **db_tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => LdapError::NoSuchObject,
                other => map_exec_err(other),
            })?;

        // Step 4: delete. The self-referential foreign key rejects deleting
        // an entry that still has children.
        let deleted = sqlx::query(DELETE_BY_ID)
            .bind(id)
            .execute(&mut **db_tx)
            .await
            .map_err(|err| {
                if is_foreign_key_violation(&err) {
                    return LdapError::NotAllowedOnNonLeaf;
                }
                map_exec_err(err)
            })?
            .rows_affected();
        if deleted != 1 {
            return Err(LdapError::NoSuchObject);
        }

        // Step 5: membership cleanup, both directions.
        let attrs_orig: AttrsOrig =
            serde_json::from_value(row.attrs_orig.clone()).map_err(|err| {
                tracing::error!(id, error = %err, "malformed attrs_orig payload");
                LdapError::OperationsError
            })?;

        let mut member_targets = Vec::new();
        for name in ["member", "uniqueMember"] {
            for value in attrs_orig.get(name).map(Vec::as_slice).unwrap_or_default() {
                if !member_targets.contains(value) {
                    member_targets.push(value.clone());
                }
            }
        }
        self.delete_member_of(db_tx, &member_targets, id).await?;

        let group_ids: Vec<i64> = attrs_orig
            .get("memberOf")
            .map(Vec::as_slice)
            .unwrap_or_default()
            .iter()
            .filter_map(|v| v.parse().ok())
            .collect();
        if !group_ids.is_empty() {
            let updated = sqlx::query(SCRUB_MEMBER)
                .bind(id.to_string())
                .bind(group_ids.clone())
                .execute(&mut **db_tx)
                .await
                .map_err(map_exec_err)?
                .rows_affected();
            if updated != group_ids.len() as u64 {
                tracing::warn!(dn_norm = %dn.dn_norm_str(),
                    "inconsistency while removing member references");
                return Err(LdapError::retry(anyhow::anyhow!(
                    "member scrub affected {updated} of {} rows",
                    group_ids.len()
                )));
            }
        }

        // Step 6: demote the parent when this was its last child.
        let mut dependant = Vec::new();
        if let Some(parent) = parent {
            let remaining = sqlx::query_as::<_, IdRev>(FIND_CHILD_BY_PARENT_ID)
                .bind(parent.id)
                .fetch_optional(&mut **db_tx)
                .await
                .map_err(map_exec_err)?;
            if remaining.is_none() {
                let updated = sqlx::query(UPDATE_CONTAINER)
                    .bind(parent.id)
                    .bind(parent.rev)
                    .bind(None::<Vec<i64>>)
                    .bind(false)
                    .execute(&mut **db_tx)
                    .await
                    .map_err(map_exec_err)?
                    .rows_affected();
                if updated != 1 {
                    tracing::warn!(parent_id = parent.id,
                        "inconsistency while demoting the parent");
                    return Err(LdapError::retry(anyhow::anyhow!(
                        "parent demotion affected {updated} rows"
                    )));
                }
                dependant.push(parent.id);
            }
        }

        let m = NotifyMessage {
            issuer: self.server_id().to_string(),
            id: row.id,
            op: NotifyOp::Del,
            // The revision the entry died at.
            rev: row.rev,
            association: true,
            dependant,
            sub: false,
        };
        self.notify(db_tx, &m).await?;
        Ok(m)
    }
}
