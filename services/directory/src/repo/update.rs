//! Modify operation.
use super::postgres::{build_attrs_patch, bind_patch, map_exec_err, DbEntry, LOCK_ENTRY_FOR_UPDATE};
use super::{AttrsOrig, Changelog, NotifyMessage, NotifyOp, Repository};
use canopy_common::{LdapError, LdapResult};
use canopy_schema::{Dn, DnCache, SchemaValue};
use sqlx::{Postgres, Transaction};

impl Repository {
    /// Modify the entry at `dn`. The callback receives the current
    /// `attrs_orig` under the row lock and returns the changelog to apply;
    /// it may run more than once when the attempt is retried.
    pub async fn update<F>(&self, dn: &Dn, callback: F) -> LdapResult<()>
    where
        F: Fn(&AttrsOrig) -> LdapResult<Changelog>,
    {
        let mut attempt = 0;
        loop {
            match self.update_once(dn, &callback).await {
                Err(err) if self.should_retry(&err, attempt) => {
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn update_once<F>(&self, dn: &Dn, callback: &F) -> LdapResult<()>
    where
        F: Fn(&AttrsOrig) -> LdapResult<Changelog>,
    {
        let mut dn_cache = DnCache::new();
        // Cache transaction first, durable store second; the cache side is
        // read-only here, projection happens through the change message.
        let cache_tx = self.cache().begin();
        let mut db_tx = self.pool().begin().await.map_err(LdapError::unavailable)?;

        let id = cache_tx.find_entry_id(dn, &mut dn_cache).await?;

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

        let changelog = callback(&attrs_orig)?;

        let Some(m) = self
            .internal_update(&mut db_tx, id, row.rev, &changelog)
            .await?
        else {
            // Nothing changed; drop both transactions.
            return Ok(());
        };

        db_tx.commit().await.map_err(map_exec_err)?;
        drop(cache_tx);

        self.on_update(&m).await.map_err(|err| {
            tracing::error!(id = m.id, dn_norm = %dn.dn_norm_str(), error = %err,
                "failed to project modified entry into the cache");
            err
        })?;

        metrics::counter!("canopy_entry_changes_total", "op" => "mod").increment(1);
        tracing::info!(dn_norm = %dn.dn_norm_str(), "modified");
        Ok(())
    }

    /// Apply the minimal attribute patch as one UPDATE guarded by the
    /// pre-image `rev`, then propagate the membership delta. Returns `None`
    /// when the diff is empty.
    pub(crate) async fn internal_update(
        &self,
        db_tx: &mut Transaction<'_, Postgres>,
        id: i64,
        rev: i64,
        changelog: &Changelog,
    ) -> LdapResult<Option<NotifyMessage>> {
        let ops = changelog.to_diff();
        if ops.is_empty() {
            return Ok(None);
        }

        let modifiers_name = changelog
            .requester()
            .dn_orig_str_without_suffix(&self.schema().suffix_dn);
        let patch = build_attrs_patch(&ops, 5);
        let sql = format!(
            "UPDATE entry
             SET attrs_orig = attrs_orig || JSONB_BUILD_OBJECT(
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
            .bind(serde_json::json!([changelog.timestamp()]));
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
                "stale revision while updating entry {id}"
            )));
        }

        let (add, del) = changelog.to_member_of_diff();
        let association_changed = !add.is_empty() || !del.is_empty();
        if association_changed {
            self.add_member_of(db_tx, &add, id).await?;
            self.delete_member_of(db_tx, &del, id).await?;
        }

        let m = NotifyMessage {
            issuer: self.server_id().to_string(),
            id,
            op: NotifyOp::Mod,
            rev: rev + 1,
            association: association_changed,
            dependant: Vec::new(),
            sub: false,
        };
        self.notify(db_tx, &m).await?;
        Ok(Some(m))
    }

    /// Translate DN-valued membership values into id-valued ones, before
    /// the changelog diffs them.
    pub async fn association(&self, sv: SchemaValue) -> LdapResult<SchemaValue> {
        let mut dn_cache = DnCache::new();
        let ids = self
            .dns_to_id_strings(sv.orig(), &mut dn_cache)
            .await
            .map_err(|(index, err)| match err {
                LdapError::NoSuchObject => LdapError::InvalidPerSyntax {
                    attr: sv.name().to_string(),
                    index,
                },
                other => other,
            })?;
        self.schema().new_value(sv.name(), ids)
    }
}
