//! Modify-DN operation: rename in place, or move a subtree.
use super::postgres::{
    map_exec_err, bind_patch, build_attrs_patch, DbEntry, IdRev, LockedEntry, TreeEntry,
    FIND_CHILD_BY_PARENT_ID, LOCK_ENTRY_FOR_INSERT, LOCK_ENTRY_FOR_UPDATE, LOCK_TREE_FOR_MOVE,
    UPDATE_CONTAINER, UPDATE_PARENT, UPDATE_PARENT_WITH_PATH, UPDATE_PATH,
};
use super::{AttrsOrig, Changelog, NotifyMessage, NotifyOp, Repository};
use canopy_common::{LdapError, LdapResult};
use canopy_schema::{Dn, DnCache, RelativeDn};
use sqlx::{Postgres, Transaction};

impl Repository {
    /// Rewrite the entry's DN. When the new parent differs the move
    /// protocol runs first (path rewrite for every descendant container,
    /// promotion/demotion of the parents); the attribute patch phase then
    /// rewrites `rdn_norm`/`rdn_orig` unconditionally. `old_rdn` carries
    /// the displaced RDN when the caller asked to retain it.
    pub async fn update_dn<F>(
        &self,
        old_dn: &Dn,
        new_dn: &Dn,
        old_rdn: Option<&RelativeDn>,
        callback: F,
    ) -> LdapResult<()>
    where
        F: Fn(&AttrsOrig) -> LdapResult<Changelog>,
    {
        let mut attempt = 0;
        loop {
            match self.update_dn_once(old_dn, new_dn, old_rdn, &callback).await {
                Err(err) if self.should_retry(&err, attempt) => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn update_dn_once<F>(
        &self,
        old_dn: &Dn,
        new_dn: &Dn,
        old_rdn: Option<&RelativeDn>,
        callback: &F,
    ) -> LdapResult<()>
    where
        F: Fn(&AttrsOrig) -> LdapResult<Changelog>,
    {
        let mut dn_cache = DnCache::new();
        let cache_tx = self.cache().begin();
        let mut db_tx = self.pool().begin().await.map_err(LdapError::unavailable)?;

        let id = cache_tx.find_entry_id(old_dn, &mut dn_cache).await?;

        let row = sqlx::query_as::<_, DbEntry>(LOCK_ENTRY_FOR_UPDATE)
            .bind(id)
            .fetch_one(&mut *db_tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => LdapError::NoSuchObject,
                other => map_exec_err(other),
            })?;

        let attrs_orig: AttrsOrig =
            serde_json::from_value(row.attrs_orig.clone()).map_err(|err| {
                tracing::error!(id, error = %err, "malformed attrs_orig payload");
                LdapError::OperationsError
            })?;

        let mut changelog = callback(&attrs_orig)?;
        changelog.update_dn(new_dn.clone());

        // Align the RDN attribute values with the new name: the new RDN's
        // values join the entry, and the displaced values leave unless the
        // caller retained them (`old_rdn` carries the kept RDN when
        // deleteoldrdn was false).
        if changelog.dn().rdn_norm_str() != new_dn.rdn_norm_str() {
            let old_rdn_map = changelog.dn().rdn();
            for (type_norm, value) in new_dn.rdn() {
                let nsv = self
                    .schema()
                    .new_value(&type_norm, vec![value.orig.clone()])?;
                if let Some(old_value) = old_rdn_map.get(&type_norm) {
                    if old_rdn.is_none() {
                        let osv = self
                            .schema()
                            .new_value(&type_norm, vec![old_value.orig.clone()])?;
                        changelog.delete(osv)?;
                    }
                }
                match changelog.add(nsv) {
                    // The new value may already exist as a non-RDN value.
                    Err(LdapError::TypeOrValueExists { .. }) => {}
                    other => other?,
                }
            }
        }

        let m = self
            .internal_update_dn(&mut db_tx, id, row.rev, &changelog)
            .await?;

        db_tx.commit().await.map_err(map_exec_err)?;
        drop(cache_tx);

        self.on_update(&m).await.map_err(|err| {
            tracing::error!(id = m.id, error = %err,
                "failed to project renamed entry into the cache");
            err
        })?;

        metrics::counter!("canopy_entry_changes_total", "op" => "modrdn").increment(1);
        tracing::info!(
            old_dn_norm = %old_dn.dn_norm_str(),
            new_dn_norm = %new_dn.dn_norm_str(),
            "modified DN"
        );
        Ok(())
    }

    async fn internal_update_dn(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        id: i64,
        rev: i64,
        changelog: &Changelog,
    ) -> LdapResult<NotifyMessage> {
        let new_dn = changelog.new_dn().ok_or(LdapError::OperationsError)?;
        let moved = changelog.dn().parent_dn() != new_dn.parent_dn();

        let mut dependant = Vec::new();
        let mut update_sub_tree = false;
        let mut entry_state = TreeEntry {
            id,
            rev,
            path: None,
            is_container: false,
        };

        if moved {
            let mut dn_cache = DnCache::new();

            // Step 1: old parent id from the cache.
            let old_parent_dn = changelog.dn().parent_dn().ok_or(LdapError::NoSuchObject)?;
            let old_pid = self
                .cache()
                .find_entry_id(&old_parent_dn, &mut dn_cache)
                .await?;

            // Step 2: one statement locks the old parent, the entry and
            // its sub-containers.
            let rows = sqlx::query_as::<_, TreeEntry>(LOCK_TREE_FOR_MOVE)
                .bind(old_pid)
                .bind(vec![id])
                .fetch_all(&mut **db_tx)
                .await
                .map_err(map_exec_err)?;
            let mut old_parent: Option<TreeEntry> = None;
            let mut sub_tree = Vec::new();
            for row in rows {
                if row.id == old_pid {
                    old_parent = Some(row);
                } else if row.id == id {
                    entry_state = row;
                } else {
                    sub_tree.push(row);
                }
            }
            let old_parent = old_parent.ok_or(LdapError::NoSuchObject)?;

            // Step 3: new parent id from the cache.
            let new_parent_dn = new_dn.parent_dn().ok_or(LdapError::NoSuchObject)?;
            let new_pid = self
                .cache()
                .find_entry_id(&new_parent_dn, &mut dn_cache)
                .await?;

            // Step 4: lock the new parent, fetching its parent's path.
            let new_parent = sqlx::query_as::<_, LockedEntry>(LOCK_ENTRY_FOR_INSERT)
                .bind(new_pid)
                .fetch_one(&mut **db_tx)
                .await
                .map_err(|err| match err {
                    sqlx::Error::RowNotFound => LdapError::NoSuchObject,
                    other => map_exec_err(other),
                })?;

            // Ancestor chain the moved subtree hangs off, whether or not
            // the new parent is a container yet.
            let mut new_parent_chain = if new_parent.is_container {
                new_parent.path.clone().unwrap_or_default()
            } else {
                let mut chain = new_parent.parent_path.clone().unwrap_or_default();
                chain.push(new_parent.id);
                chain
            };

            // Step 5: rewrite the path of every sub-container, replacing
            // the ancestors above the moved entry with the new chain.
            for container in &sub_tree {
                let old_path = container.path.clone().unwrap_or_default();
                let from = old_path.iter().position(|v| *v == id).unwrap_or(0);
                let mut new_path = new_parent_chain.clone();
                new_path.extend_from_slice(&old_path[from..]);
                let updated = sqlx::query(UPDATE_PATH)
                    .bind(container.id)
                    .bind(container.rev)
                    .bind(Some(new_path))
                    .execute(&mut **db_tx)
                    .await
                    .map_err(map_exec_err)?
                    .rows_affected();
                if updated != 1 {
                    return Err(LdapError::retry(anyhow::anyhow!(
                        "stale revision while rewriting path of {}",
                        container.id
                    )));
                }
            }
            update_sub_tree = !sub_tree.is_empty();

            // Step 6: promote the new parent when it was a leaf.
            if !new_parent.is_container {
                let updated = sqlx::query(UPDATE_CONTAINER)
                    .bind(new_parent.id)
                    .bind(new_parent.rev)
                    .bind(Some(new_parent_chain.clone()))
                    .bind(true)
                    .execute(&mut **db_tx)
                    .await
                    .map_err(map_exec_err)?
                    .rows_affected();
                if updated != 1 {
                    return Err(LdapError::retry(anyhow::anyhow!(
                        "lost the race promoting the new parent"
                    )));
                }
                dependant.push(new_parent.id);
            }

            // Step 7: move the entry; a container also gets its own path
            // rewritten.
            let updated = if entry_state.is_container {
                new_parent_chain.push(id);
                sqlx::query(UPDATE_PARENT_WITH_PATH)
                    .bind(id)
                    .bind(entry_state.rev)
                    .bind(new_parent.id)
                    .bind(Some(new_parent_chain))
                    .execute(&mut **db_tx)
                    .await
                    .map_err(map_exec_err)?
                    .rows_affected()
            } else {
                sqlx::query(UPDATE_PARENT)
                    .bind(id)
                    .bind(entry_state.rev)
                    .bind(new_parent.id)
                    .execute(&mut **db_tx)
                    .await
                    .map_err(map_exec_err)?
                    .rows_affected()
            };
            if updated != 1 {
                return Err(LdapError::retry(anyhow::anyhow!(
                    "stale revision while moving entry {id}"
                )));
            }

            // Step 8: demote the old parent when it ran out of children.
            let remaining = sqlx::query_as::<_, IdRev>(FIND_CHILD_BY_PARENT_ID)
                .bind(old_parent.id)
                .fetch_optional(&mut **db_tx)
                .await
                .map_err(map_exec_err)?;
            if remaining.is_none() {
                let updated = sqlx::query(UPDATE_CONTAINER)
                    .bind(old_parent.id)
                    .bind(old_parent.rev)
                    .bind(None::<Vec<i64>>)
                    .bind(false)
                    .execute(&mut **db_tx)
                    .await
                    .map_err(map_exec_err)?
                    .rows_affected();
                if updated != 1 {
                    return Err(LdapError::retry(anyhow::anyhow!(
                        "lost the race demoting the old parent"
                    )));
                }
                dependant.push(old_parent.id);
            }
        }

        // Step 9: the attribute patch, which also rewrites the RDN columns.
        let modifiers_name = changelog
            .requester()
            .dn_orig_str_without_suffix(&self.schema().suffix_dn);
        let ops = changelog.to_diff();
        let patch = build_attrs_patch(&ops, 7);
        let sql = format!(
            "UPDATE entry
             SET rdn_norm = $5,
                 rdn_orig = $6,
                 attrs_orig = attrs_orig || JSONB_BUILD_OBJECT(
                    'modifiersName', ($3)::jsonb,
                    'modifyTimestamp', ($4)::jsonb{}),
                 rev = rev + 1
             WHERE id = $1 AND rev = $2",
            patch.fragments
        );
        let mut query = sqlx::query(&sql)
            .bind(id)
            .bind(rev)
            .bind(serde_json::json!([modifiers_name]))
            .bind(serde_json::json!([changelog.timestamp()]))
            .bind(new_dn.rdn_norm_str())
            .bind(new_dn.rdn_orig_encoded_str());
        for bind in patch.binds {
            query = bind_patch(query, bind);
        }
        let updated = query
            .execute(&mut **db_tx)
            .await
            .map_err(map_exec_err)?
            .rows_affected();
        if updated != 1 {
            return Err(LdapError::retry(anyhow::anyhow!(
                "stale revision while renaming entry {id}"
            )));
        }

        let m = NotifyMessage {
            issuer: self.server_id().to_string(),
            id,
            op: NotifyOp::ModRdn,
            rev: rev + 1,
            association: false,
            dependant,
            sub: update_sub_tree,
        };
        self.notify(db_tx, &m).await?;
        Ok(m)
    }
}
