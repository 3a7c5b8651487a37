//! Search operation.
use super::filter::FilterTranslator;
use super::{Repository, SearchEntry, SearchOption};
use canopy_common::{LdapError, LdapResult};
use canopy_schema::{Dn, DnCache};

impl Repository {
    /// Run a search against the cache: resolve the base, translate the
    /// filter, expand the scope, page, and stream each enriched hit to the
    /// handler. Returns `(total matches, returned this page)`.
    pub async fn search<F>(
        &self,
        base_dn: &Dn,
        option: &SearchOption,
        mut handler: F,
    ) -> LdapResult<(i32, i32)>
    where
        F: FnMut(SearchEntry) -> LdapResult<()>,
    {
        let mut dn_cache = DnCache::new();

        // A missing base DN is a plain NoSuchObject to the client.
        let path = self.cache().find_entry_path(base_dn).await?;
        let base_id = *path.last().ok_or(LdapError::NoSuchObject)?;

        let translator = FilterTranslator {
            schema: self.schema(),
            cache: self.cache(),
        };
        let predicate = translator.translate(&option.filter, &mut dn_cache).await;
        let hint = predicate.index_hint();

        let candidates = self.cache().scope_candidates(option.scope, base_id).await;
        let limit = if option.page_size > 0 {
            option.page_size as usize
        } else {
            usize::MAX
        };
        let offset = option.offset.max(0) as usize;
        let (total, page) = self
            .cache()
            .select(&candidates, &predicate, hint, limit, offset)
            .await;
        let returned = page.len();

        for entry in page {
            let dn_orig = self.cache().to_dn_orig(entry.id, &mut dn_cache).await?;
            let mut hit = SearchEntry::new(self.schema().clone(), dn_orig, entry.attrs_orig.clone());

            if option.has_subordinates_requested {
                let flag = if entry.is_container { "TRUE" } else { "FALSE" };
                hit.attrs_orig_mut()
                    .insert("hasSubordinates".to_string(), vec![flag.to_string()]);
            }
            if option.member_of_requested {
                let values = hit.attrs_orig().get("memberOf").cloned().unwrap_or_default();
                let dns = self.render_member_dns(&values, &mut dn_cache).await?;
                hit.attrs_orig_mut().insert("memberOf".to_string(), dns);
            }
            for name in &option.requested_association {
                let Some(at) = self.schema().attribute_type(name) else {
                    continue;
                };
                let canonical = at.name.clone();
                let Some(values) = hit.attrs_orig().get(&canonical).cloned() else {
                    continue;
                };
                let dns = self.render_member_dns(&values, &mut dn_cache).await?;
                hit.attrs_orig_mut().insert(canonical, dns);
            }

            handler(hit)?;
        }

        metrics::counter!("canopy_searches_total").increment(1);
        Ok((total as i32, returned as i32))
    }

    /// Render id-valued membership values back into original DN strings.
    /// Ids that no longer resolve are dropped from the result.
    async fn render_member_dns(
        &self,
        values: &[String],
        dn_cache: &mut DnCache,
    ) -> LdapResult<Vec<String>> {
        let mut out = Vec::with_capacity(values.len());
        for value in values {
            let Ok(id) = value.parse::<i64>() else {
                tracing::warn!(value, "membership value is not an entry id, dropped");
                continue;
            };
            match self.cache().to_dn_orig(id, dn_cache).await {
                Ok(dn) => out.push(dn),
                Err(LdapError::NoSuchObject) => {
                    tracing::warn!(id, "membership target vanished, dropped");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(out)
    }
}
