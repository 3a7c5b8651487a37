//! Insert operation.
use super::postgres::{
    is_unique_violation, map_exec_err, LockedEntry, INSERT_ENTRY, INSERT_ROOT_ENTRY,
    LOCK_ENTRY_FOR_INSERT, UPDATE_CONTAINER,
};
use super::{Changelog, NotifyMessage, NotifyOp, Repository};
use canopy_common::{LdapError, LdapResult};
use canopy_schema::DnCache;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

impl Repository {
    /// Create the entry described by the changelog. The new DN equal to the
    /// configured suffix takes the root-insert path; everything else
    /// resolves and, if needed, promotes its parent. Returns the new id.
    pub async fn insert(&self, changelog: &Changelog) -> LdapResult<i64> {
        let mut attempt = 0;
        loop {
            match self.insert_once(changelog).await {
                Err(err) if self.should_retry(&err, attempt) => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn insert_once(&self, changelog: &Changelog) -> LdapResult<i64> {
        let mut db_tx = self.pool().begin().await.map_err(LdapError::unavailable)?;

        let m = if changelog.dn().is_suffix(&self.schema().suffix_dn) {
            self.insert_root_internal(&mut db_tx, changelog).await?
        } else {
            self.insert_internal(&mut db_tx, changelog).await?
        };

        db_tx.commit().await.map_err(map_exec_err)?;

        // The node's own change message is applied synchronously; the
        // listener skips it by issuer.
        self.on_update(&m).await.map_err(|err| {
            tracing::error!(id = m.id, dn_norm = %changelog.dn_norm(), error = %err,
                "failed to project added entry into the cache");
            err
        })?;

        metrics::counter!("canopy_entry_changes_total", "op" => "add").increment(1);
        tracing::info!(id = m.id, dn_norm = %changelog.dn_norm(), "added");
        Ok(m.id)
    }

    /// The naming-context root hangs off the sentinel row; no parent
    /// resolution, no association handling.
    async fn insert_root_internal(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        changelog: &Changelog,
    ) -> LdapResult<NotifyMessage> {
        let attrs_orig = changelog.to_new_attrs_orig();
        let uuid = entry_uuid(&attrs_orig)?;
        let payload = serde_json::to_value(&attrs_orig).map_err(LdapError::unavailable)?;

        let new_id = sqlx::query_scalar::<_, i64>(INSERT_ROOT_ENTRY)
            .bind(uuid)
            .bind(changelog.dn().rdn_norm_str())
            .bind(changelog.dn().rdn_orig_encoded_str())
            .bind(payload)
            .fetch_one(&mut **db_tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    tracing::warn!(dn_norm = %changelog.dn_norm(), "the new root entry already exists");
                    return LdapError::AlreadyExists;
                }
                map_exec_err(err)
            })?;

        let m = NotifyMessage {
            issuer: self.server_id().to_string(),
            id: new_id,
            op: NotifyOp::Add,
            rev: 1,
            association: false,
            dependant: Vec::new(),
            sub: false,
        };
        self.notify(db_tx, &m).await?;
        Ok(m)
    }

    async fn insert_internal(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        changelog: &Changelog,
    ) -> LdapResult<NotifyMessage> {
        let mut dn_cache = DnCache::new();

        // Step 1: resolve the parent id through the cache.
        let parent_dn = changelog.dn().parent_dn().ok_or(LdapError::NoSuchObject)?;
        let pid = self
            .cache()
            .find_entry_id(&parent_dn, &mut dn_cache)
            .await
            .map_err(|err| {
                tracing::warn!(dn_norm = %changelog.dn_norm(),
                    "no parent entry in the cache for the new entry");
                err
            })?;

        // Step 2: lock the parent row (and its parent's path row).
        let parent = sqlx::query_as::<_, LockedEntry>(LOCK_ENTRY_FOR_INSERT)
            .bind(pid)
            .fetch_one(&mut **db_tx)
            .await
            .map_err(|err| match err {
                sqlx::Error::RowNotFound => {
                    tracing::warn!(dn_norm = %changelog.dn_norm(),
                        "parent entry vanished before the insert");
                    LdapError::retry(anyhow::anyhow!("parent entry vanished"))
                }
                other => map_exec_err(other),
            })?;

        // Step 3: promote the parent when this is its first child.
        let mut dependant = Vec::new();
        if !parent.is_container {
            let mut path = parent.parent_path.clone().unwrap_or_default();
            path.push(parent.id);
            let updated = sqlx::query(UPDATE_CONTAINER)
                .bind(parent.id)
                .bind(parent.rev)
                .bind(Some(path))
                .bind(true)
                .execute(&mut **db_tx)
                .await
                .map_err(map_exec_err)?
                .rows_affected();
            if updated != 1 {
                tracing::warn!(parent_id = parent.id, "lost the race promoting the parent");
                return Err(LdapError::retry(anyhow::anyhow!(
                    "parent promotion affected {updated} rows"
                )));
            }
            dependant.push(parent.id);
        }

        // Step 4: translate DN-valued membership into entry ids.
        let mut attrs_orig = changelog.to_new_attrs_orig();
        let mut target_ids = Vec::new();
        for name in ["member", "uniqueMember"] {
            let Some(values) = attrs_orig.get(name) else {
                continue;
            };
            let ids = self
                .dns_to_id_strings(values, &mut dn_cache)
                .await
                .map_err(|(index, err)| match err {
                    LdapError::NoSuchObject => LdapError::InvalidPerSyntax {
                        attr: name.to_string(),
                        index,
                    },
                    other => other,
                })?;
            for id in &ids {
                if !target_ids.contains(id) {
                    target_ids.push(id.clone());
                }
            }
            attrs_orig.insert(name.to_string(), ids);
        }

        // Step 5: insert the entry.
        let uuid = entry_uuid(&attrs_orig)?;
        let payload = serde_json::to_value(&attrs_orig).map_err(LdapError::unavailable)?;
        let new_id = sqlx::query_scalar::<_, i64>(INSERT_ENTRY)
            .bind(uuid)
            .bind(pid)
            .bind(changelog.dn().rdn_norm_str())
            .bind(changelog.dn().rdn_orig_encoded_str())
            .bind(payload)
            .fetch_one(&mut **db_tx)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    tracing::warn!(parent_id = pid, dn_norm = %changelog.dn_norm(),
                        "the new entry already exists");
                    return LdapError::AlreadyExists;
                }
                map_exec_err(err)
            })?;

        // Step 6: record the reverse membership on every target.
        self.add_member_of(db_tx, &target_ids, new_id).await?;

        let m = NotifyMessage {
            issuer: self.server_id().to_string(),
            id: new_id,
            op: NotifyOp::Add,
            rev: 1,
            association: !target_ids.is_empty(),
            dependant,
            sub: false,
        };
        self.notify(db_tx, &m).await?;
        Ok(m)
    }

    /// Resolve a list of DN strings to entry-id strings. On failure the
    /// offending index is reported so callers can name the bad value.
    pub(crate) async fn dns_to_id_strings(
        &self,
        dns: &[String],
        dn_cache: &mut DnCache,
    ) -> Result<Vec<String>, (usize, LdapError)> {
        let mut ids = Vec::with_capacity(dns.len());
        for (i, value) in dns.iter().enumerate() {
            // Values already translated to ids pass through.
            if value.parse::<i64>().is_ok() {
                ids.push(value.clone());
                continue;
            }
            let dn = self
                .schema()
                .normalize_dn(value)
                .map_err(|err| (i, err))?;
            let id = self
                .cache()
                .find_entry_id(&dn, dn_cache)
                .await
                .map_err(|err| (i, err))?;
            ids.push(id.to_string());
        }
        Ok(ids)
    }

    /// Append `id` to the `memberOf` of every target entry.
    pub(crate) async fn add_member_of(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        target_ids: &[String],
        id: i64,
    ) -> LdapResult<()> {
        if target_ids.is_empty() {
            return Ok(());
        }
        let targets = parse_ids(target_ids)?;
        let member = serde_json::json!([id.to_string()]);
        let updated = sqlx::query(super::postgres::ADD_MEMBER_OF)
            .bind(member)
            .bind(targets.clone())
            .execute(&mut **db_tx)
            .await
            .map_err(map_exec_err)?
            .rows_affected();
        if updated != targets.len() as u64 {
            tracing::warn!(id, ?targets, "inconsistency while adding memberOf");
            return Err(LdapError::retry(anyhow::anyhow!(
                "memberOf add affected {updated} of {} rows",
                targets.len()
            )));
        }
        Ok(())
    }

    /// Remove `id` from the `memberOf` of every target entry.
    pub(crate) async fn delete_member_of(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        target_ids: &[String],
        id: i64,
    ) -> LdapResult<()> {
        if target_ids.is_empty() {
            return Ok(());
        }
        let targets = parse_ids(target_ids)?;
        let updated = sqlx::query(super::postgres::DELETE_MEMBER_OF)
            .bind(id.to_string())
            .bind(targets.clone())
            .execute(&mut **db_tx)
            .await
            .map_err(map_exec_err)?
            .rows_affected();
        if updated != targets.len() as u64 {
            tracing::warn!(id, ?targets, "inconsistency while removing memberOf");
            return Err(LdapError::retry(anyhow::anyhow!(
                "memberOf delete affected {updated} of {} rows",
                targets.len()
            )));
        }
        Ok(())
    }
}

fn entry_uuid(attrs_orig: &super::AttrsOrig) -> LdapResult<Uuid> {
    let value = attrs_orig
        .get("entryUUID")
        .and_then(|v| v.first())
        .ok_or(LdapError::OperationsError)?;
    Uuid::parse_str(value).map_err(|_| LdapError::InvalidPerSyntax {
        attr: "entryUUID".to_string(),
        index: 0,
    })
}

fn parse_ids(values: &[String]) -> LdapResult<Vec<i64>> {
    values
        .iter()
        .map(|v| {
            v.parse::<i64>().map_err(|_| {
                tracing::warn!(value = %v, "association value is not an entry id");
                LdapError::OperationsError
            })
        })
        .collect()
}
