//! In-memory entry index.
//!
//! # Purpose
//! Holds a normalized projection of every entry for reads: DN resolution,
//! filter evaluation, scope expansion and DN reconstruction all run here
//! without touching Postgres. The cache is a plain document store keyed by
//! entry id with a handful of secondary indexes, guarded by one
//! `tokio::sync::RwLock` so reads proceed concurrently and writes are
//! serialized.
//!
//! # Staged transactions
//! Writers stage upserts/deletes in a [`CacheTx`] and apply them in one
//! write-lock critical section at commit time, after the corresponding
//! Postgres transaction committed. Reads through a `CacheTx` see the staged
//! state first.
use super::postgres::DbEntry;
use super::AttrsOrig;
use canopy_common::{LdapError, LdapResult};
use canopy_schema::{Dn, DnCache, SchemaRegistry};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Normalized value as held by the cache indexes: association attributes
/// and number-like matching rules index as integers, everything else as
/// strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IndexValue {
    Str(String),
    Int(i64),
}

impl IndexValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            IndexValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            IndexValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// Cached projection of one entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: i64,
    pub rev: i64,
    pub parent_id: i64,
    /// Root-to-self ancestor chain; empty unless the entry is a container.
    pub path: Vec<i64>,
    pub is_container: bool,
    pub rdn_norm: String,
    pub rdn_orig: String,
    pub attrs_orig: AttrsOrig,
    pub attrs_norm: HashMap<String, Vec<IndexValue>>,
}

impl CacheEntry {
    pub fn norm_values(&self, attr_name: &str) -> &[IndexValue] {
        self.attrs_norm
            .get(attr_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn norm_ints(&self, attr_name: &str) -> Vec<i64> {
        self.norm_values(attr_name)
            .iter()
            .filter_map(IndexValue::as_int)
            .collect()
    }
}

/// Attributes carrying a string equality index.
fn is_indexed_attribute(name: &str) -> bool {
    matches!(name, "cn" | "uid" | "sn" | "givenName" | "ou")
}

/// Attributes carrying an integer equality index (entry-id valued).
fn is_num_indexed_attribute(name: &str) -> bool {
    matches!(name, "member" | "uniqueMember" | "memberOf")
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<i64, Arc<CacheEntry>>,
    /// `(parent_id, rdn_norm)` to id; backs DN-to-id resolution.
    by_rdn: HashMap<(i64, String), i64>,
    /// Parent id to child ids.
    children: HashMap<i64, HashSet<i64>>,
    /// Ancestor id to ids of containers whose `path` contains it. A
    /// container's own id is in its `path`, so `tree[x]` includes `x`.
    tree: HashMap<i64, HashSet<i64>>,
    /// Typed equality indexes for the attribute allow-list.
    attrs: HashMap<String, HashMap<IndexValue, HashSet<i64>>>,
}

impl CacheState {
    fn index(&mut self, entry: Arc<CacheEntry>) {
        self.unindex(entry.id);
        self.by_rdn
            .insert((entry.parent_id, entry.rdn_norm.clone()), entry.id);
        self.children
            .entry(entry.parent_id)
            .or_default()
            .insert(entry.id);
        if entry.is_container {
            for ancestor in &entry.path {
                self.tree.entry(*ancestor).or_default().insert(entry.id);
            }
        }
        for (name, values) in &entry.attrs_norm {
            if !is_indexed_attribute(name) && !is_num_indexed_attribute(name) {
                continue;
            }
            let index = self.attrs.entry(name.clone()).or_default();
            for value in values {
                index.entry(value.clone()).or_default().insert(entry.id);
            }
        }
        self.entries.insert(entry.id, entry);
    }

    fn unindex(&mut self, id: i64) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.remove(&id)?;
        self.by_rdn.remove(&(entry.parent_id, entry.rdn_norm.clone()));
        if let Some(siblings) = self.children.get_mut(&entry.parent_id) {
            siblings.remove(&id);
            if siblings.is_empty() {
                self.children.remove(&entry.parent_id);
            }
        }
        for ancestor in &entry.path {
            if let Some(set) = self.tree.get_mut(ancestor) {
                set.remove(&id);
                if set.is_empty() {
                    self.tree.remove(ancestor);
                }
            }
        }
        for (name, values) in &entry.attrs_norm {
            let Some(index) = self.attrs.get_mut(name) else {
                continue;
            };
            for value in values {
                if let Some(set) = index.get_mut(value) {
                    set.remove(&id);
                    if set.is_empty() {
                        index.remove(value);
                    }
                }
            }
        }
        Some(entry)
    }

    fn has_children(&self, id: i64) -> bool {
        self.children.get(&id).map(|s| !s.is_empty()).unwrap_or(false)
    }

    /// Flip a parent back to leaf when its last child went away. The parent
    /// keeps its revision; the durable store bumps it and the next
    /// notification re-projects.
    fn demote_if_childless(&mut self, parent_id: i64) {
        if parent_id == 0 || self.has_children(parent_id) {
            return;
        }
        let parent = self.entries.get(&parent_id).cloned();
        if let Some(parent) = parent {
            if parent.is_container {
                let mut updated = (*parent).clone();
                updated.is_container = false;
                updated.path = Vec::new();
                self.index(Arc::new(updated));
            }
        }
    }
}

/// Staged cache mutation, applied atomically on commit.
pub struct CacheTx<'a> {
    cache: &'a EntryCache,
    upserts: HashMap<i64, CacheEntry>,
    deletes: HashSet<i64>,
}

impl CacheTx<'_> {
    pub fn upsert(&mut self, entry: CacheEntry) {
        self.deletes.remove(&entry.id);
        self.upserts.insert(entry.id, entry);
    }

    pub fn delete(&mut self, id: i64) {
        self.upserts.remove(&id);
        self.deletes.insert(id);
    }

    /// Read through the staged overlay.
    pub async fn get(&self, id: i64) -> Option<Arc<CacheEntry>> {
        if self.deletes.contains(&id) {
            return None;
        }
        if let Some(entry) = self.upserts.get(&id) {
            return Some(Arc::new(entry.clone()));
        }
        self.cache.get(id).await
    }

    pub async fn find_id_by_parent_rdn(&self, parent_id: i64, rdn_norm: &str) -> Option<i64> {
        for entry in self.upserts.values() {
            if entry.parent_id == parent_id && entry.rdn_norm == rdn_norm {
                return Some(entry.id);
            }
        }
        let id = self.cache.find_id_by_parent_rdn(parent_id, rdn_norm).await?;
        if self.deletes.contains(&id) {
            return None;
        }
        Some(id)
    }

    /// Resolve a DN to its entry id through the staged overlay.
    pub async fn find_entry_id(&self, dn: &Dn, dn_cache: &mut DnCache) -> LdapResult<i64> {
        self.cache.find_entry_id_inner(Some(self), dn, dn_cache).await
    }
}

/// The process-wide in-memory index.
pub struct EntryCache {
    schema: Arc<SchemaRegistry>,
    state: RwLock<CacheState>,
}

impl EntryCache {
    pub fn new(schema: Arc<SchemaRegistry>) -> Self {
        EntryCache {
            schema,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn begin(&self) -> CacheTx<'_> {
        CacheTx {
            cache: self,
            upserts: HashMap::new(),
            deletes: HashSet::new(),
        }
    }

    /// Apply a staged transaction under one write lock.
    pub async fn commit(&self, tx: CacheTx<'_>) -> LdapResult<()> {
        let mut state = self.state.write().await;
        for id in tx.deletes {
            if let Some(old) = state.unindex(id) {
                state.demote_if_childless(old.parent_id);
            }
        }
        for (_, entry) in tx.upserts {
            state.index(Arc::new(entry));
        }
        metrics::gauge!("canopy_cache_entries").set(state.entries.len() as f64);
        Ok(())
    }

    /// Drop every cached entry. Used before a full re-warm.
    pub async fn truncate(&self) {
        let mut state = self.state.write().await;
        *state = CacheState::default();
        metrics::gauge!("canopy_cache_entries").set(0.0);
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.entries.is_empty()
    }

    pub async fn get(&self, id: i64) -> Option<Arc<CacheEntry>> {
        self.state.read().await.entries.get(&id).cloned()
    }

    pub async fn find_id_by_parent_rdn(&self, parent_id: i64, rdn_norm: &str) -> Option<i64> {
        self.state
            .read()
            .await
            .by_rdn
            .get(&(parent_id, rdn_norm.to_string()))
            .copied()
    }

    pub async fn children_of(&self, id: i64) -> Vec<i64> {
        self.state
            .read()
            .await
            .children
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Ids of containers at or below `id`, via the `path` tree index.
    pub async fn descendant_containers(&self, id: i64) -> Vec<i64> {
        self.state
            .read()
            .await
            .tree
            .get(&id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Project a durable row into its cached form: normalize every
    /// attribute through the registry (integer-typed where the index wants
    /// integers) and recompute the normalized RDN.
    pub(crate) fn project(&self, row: &DbEntry) -> LdapResult<CacheEntry> {
        let attrs_orig: AttrsOrig = serde_json::from_value(row.attrs_orig.clone())
            .map_err(|err| {
                tracing::error!(id = row.id, error = %err, "malformed attrs_orig payload");
                LdapError::OperationsError
            })?;

        let mut attrs_norm = HashMap::with_capacity(attrs_orig.len());
        for (name, values) in &attrs_orig {
            let sv = self.schema.new_value(name, values.clone())?;
            let values = if is_num_indexed_attribute(sv.name()) {
                sv.norm()
                    .iter()
                    .map(|v| match v.as_int() {
                        Some(i) => IndexValue::Int(i),
                        None => IndexValue::Str(v.to_norm_str()),
                    })
                    .collect()
            } else {
                sv.norm_str()
                    .iter()
                    .map(|v| IndexValue::Str(v.clone()))
                    .collect()
            };
            attrs_norm.insert(sv.name().to_string(), values);
        }

        let rdn = self.schema.normalize_dn(&row.rdn_orig)?;
        Ok(CacheEntry {
            id: row.id,
            rev: row.rev,
            parent_id: row.parent_id,
            path: row.path.clone().unwrap_or_default(),
            is_container: row.is_container,
            rdn_norm: rdn.rdn_norm_str(),
            rdn_orig: row.rdn_orig.clone(),
            attrs_orig,
            attrs_norm,
        })
    }

    /// Resolve a DN to its entry id by walking `(parent_id, rdn_norm)` from
    /// the root. Container lookups memoize in the request's [`DnCache`].
    pub async fn find_entry_id(&self, dn: &Dn, dn_cache: &mut DnCache) -> LdapResult<i64> {
        self.find_entry_id_inner(None, dn, dn_cache).await
    }

    pub(super) async fn find_entry_id_inner(
        &self,
        tx: Option<&CacheTx<'_>>,
        dn: &Dn,
        dn_cache: &mut DnCache,
    ) -> LdapResult<i64> {
        let rdn_norms = self.suffix_relative_rdns(dn);
        let mut id: i64 = 0;
        let mut dn_norm = String::new();
        for i in (0..rdn_norms.len()).rev() {
            if dn_norm.is_empty() {
                dn_norm = rdn_norms[i].clone();
            } else {
                dn_norm = format!("{},{}", rdn_norms[i], dn_norm);
            }
            if let Some(&cached) = dn_cache.atoi.get(&dn_norm) {
                id = cached;
                continue;
            }
            let found = match tx {
                Some(tx) => tx.find_id_by_parent_rdn(id, &rdn_norms[i]).await,
                None => self.find_id_by_parent_rdn(id, &rdn_norms[i]).await,
            };
            let Some(found) = found else {
                return Err(LdapError::NoSuchObject);
            };
            id = found;
            // Only containers are worth memoizing.
            if i > 0 {
                dn_cache.atoi.insert(dn_norm.clone(), id);
            }
        }
        Ok(id)
    }

    /// Ids of the entries along the DN, root first, leaf last.
    pub async fn find_entry_path(&self, dn: &Dn) -> LdapResult<Vec<i64>> {
        let rdn_norms = self.suffix_relative_rdns(dn);
        let mut id: i64 = 0;
        let mut ids = Vec::with_capacity(rdn_norms.len());
        for i in (0..rdn_norms.len()).rev() {
            let Some(found) = self.find_id_by_parent_rdn(id, &rdn_norms[i]).await else {
                return Err(LdapError::NoSuchObject);
            };
            id = found;
            ids.push(id);
        }
        Ok(ids)
    }

    /// Leaf-first RDN chain relative to the configured suffix. The suffix
    /// entry itself is stored under the super-root with its leading RDN
    /// only; the remaining suffix RDNs are implicit.
    fn suffix_relative_rdns(&self, dn: &Dn) -> Vec<String> {
        let suffix = &self.schema.suffix_dn;
        if dn.is_suffix(suffix) {
            return vec![dn.rdn_norm_str()];
        }
        let size = dn.level_without_suffix(suffix) + 1;
        let mut rdn_norms = Vec::with_capacity(size);
        let mut cur = dn.clone();
        for _ in 0..size {
            rdn_norms.push(cur.rdn_norm_str());
            cur = cur.parent_dn().unwrap_or_else(Dn::anonymous);
        }
        rdn_norms
    }

    /// Reconstruct the original DN string for an id by walking parent
    /// links. The configured suffix substitutes for the root entry's RDN.
    pub async fn to_dn_orig(&self, id: i64, dn_cache: &mut DnCache) -> LdapResult<String> {
        if let Some(cached) = dn_cache.itoao.get(&id) {
            return Ok(cached.clone());
        }
        let mut rdns: Vec<String> = Vec::new();
        let mut parent_ids: Vec<i64> = Vec::new();
        let mut cur = id;
        loop {
            let Some(entry) = self.get(cur).await else {
                return Err(LdapError::NoSuchObject);
            };
            if entry.parent_id == 0 {
                rdns.push(self.schema.config.suffix.clone());
                break;
            }
            rdns.push(entry.rdn_orig.clone());
            if let Some(parent_dn) = dn_cache.itoao.get(&entry.parent_id) {
                return Ok(format!("{},{}", rdns.join(","), parent_dn));
            }
            cur = entry.parent_id;
            parent_ids.push(cur);
        }
        let dn = rdns.join(",");
        if let Some(&parent_id) = parent_ids.first() {
            dn_cache.itoao.insert(parent_id, rdns[1..].join(","));
        }
        Ok(dn)
    }

    /// Reconstruct the normalized DN object for an id.
    pub async fn to_dn(&self, id: i64, dn_cache: &mut DnCache) -> LdapResult<Dn> {
        if let Some(cached) = dn_cache.itoa.get(&id) {
            return Ok(cached.clone());
        }
        let orig = self.to_dn_orig(id, dn_cache).await?;
        let dn = self.schema.normalize_dn(&orig)?;
        dn_cache.itoa.insert(id, dn.clone());
        Ok(dn)
    }

    /// Whether a change message should overwrite the cached entry: either
    /// the entry is unknown, or the incoming revision is strictly newer.
    pub async fn should_apply(&self, id: i64, rev: i64) -> bool {
        match self.get(id).await {
            Some(entry) => should_version_update(rev, entry.rev),
            None => true,
        }
    }

    /// Candidate ids for a search scope, sorted ascending.
    pub async fn scope_candidates(&self, scope: super::SearchScope, base_id: i64) -> Vec<i64> {
        use super::SearchScope;
        let state = self.state.read().await;
        let mut out: BTreeSet<i64> = BTreeSet::new();
        match scope {
            SearchScope::Base => {
                out.insert(base_id);
            }
            SearchScope::One => {
                if let Some(children) = state.children.get(&base_id) {
                    out.extend(children.iter().copied());
                }
            }
            SearchScope::Sub | SearchScope::Children => {
                if scope == SearchScope::Sub {
                    out.insert(base_id);
                }
                if let Some(containers) = state.tree.get(&base_id) {
                    for container in containers {
                        if let Some(children) = state.children.get(container) {
                            out.extend(children.iter().copied());
                        }
                    }
                }
            }
        }
        out.into_iter().collect()
    }

    /// Evaluate a predicate over candidate ids. Returns the total match
    /// count and the `limit`/`offset` page, ordered by id. An equality hint
    /// narrows the candidates through the typed attribute indexes first.
    pub(crate) async fn select(
        &self,
        candidates: &[i64],
        predicate: &super::filter::Predicate,
        hint: Option<(String, IndexValue)>,
        limit: usize,
        offset: usize,
    ) -> (usize, Vec<Arc<CacheEntry>>) {
        let state = self.state.read().await;
        let indexed: Option<&HashSet<i64>> = hint
            .as_ref()
            .and_then(|(name, value)| state.attrs.get(name)?.get(value));
        let mut total = 0usize;
        let mut page = Vec::new();
        for id in candidates {
            if let Some(indexed) = indexed {
                if !indexed.contains(id) {
                    continue;
                }
            }
            let Some(entry) = state.entries.get(id) else {
                continue;
            };
            if !predicate.matches(entry) {
                continue;
            }
            if total >= offset && page.len() < limit {
                page.push(entry.clone());
            }
            total += 1;
        }
        (total, page)
    }
}

pub(super) fn should_version_update(incoming_rev: i64, cached_rev: i64) -> bool {
    incoming_rev < 0 && cached_rev > 0 || incoming_rev > cached_rev
}
