//! LDAP filter translation.
//!
//! # Purpose
//! Maps an LDAP search filter tree onto a [`Predicate`] evaluated against
//! cached entries. Unknown attributes, values that fail their syntax, and
//! operators an attribute cannot support all degrade to the
//! guaranteed-empty predicate rather than erroring, mirroring how LDAP
//! servers treat undefined filter components.
use super::cache::{CacheEntry, EntryCache, IndexValue};
use canopy_schema::{AttributeType, DnCache, SchemaRegistry};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// LDAP search filter, as decoded by the protocol layer.
#[derive(Debug, Clone)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equality {
        attr: String,
        value: String,
    },
    Substring {
        attr: String,
        initial: Option<String>,
        any: Vec<String>,
        final_: Option<String>,
    },
    GreaterOrEqual {
        attr: String,
        value: String,
    },
    LessOrEqual {
        attr: String,
        value: String,
    },
    Present(String),
    Approx {
        attr: String,
        value: String,
    },
}

/// Predicate tree over cached entries. `Nothing` never matches; an empty
/// `And` always does.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    StrEq { attr: String, value: String },
    IntEq { attr: String, value: i64 },
    /// Every asserted value present; used for objectClass so a superclass
    /// assertion matches entries of any derived class.
    ContainsAll { attr: String, values: Vec<String> },
    Prefix { attr: String, value: String },
    Suffix { attr: String, value: String },
    Contains { attr: String, value: String },
    IntGe { attr: String, value: i64 },
    IntLe { attr: String, value: i64 },
    StrGe { attr: String, value: String },
    StrLe { attr: String, value: String },
    Present { attr: String },
    Nothing,
}

fn int_of(value: &IndexValue) -> Option<i64> {
    match value {
        IndexValue::Int(i) => Some(*i),
        IndexValue::Str(s) => s.parse().ok(),
    }
}

impl Predicate {
    pub(crate) fn matches(&self, entry: &CacheEntry) -> bool {
        match self {
            Predicate::And(children) => children.iter().all(|p| p.matches(entry)),
            Predicate::Or(children) => children.iter().any(|p| p.matches(entry)),
            Predicate::Not(inner) => !inner.matches(entry),
            Predicate::StrEq { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| v.as_str() == Some(value)),
            Predicate::IntEq { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| int_of(v) == Some(*value)),
            Predicate::ContainsAll { attr, values } => {
                let held = entry.norm_values(attr);
                values
                    .iter()
                    .all(|v| held.iter().any(|h| h.as_str() == Some(v)))
            }
            Predicate::Prefix { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| v.as_str().is_some_and(|s| s.starts_with(value))),
            Predicate::Suffix { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| v.as_str().is_some_and(|s| s.ends_with(value))),
            Predicate::Contains { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| v.as_str().is_some_and(|s| s.contains(value))),
            Predicate::IntGe { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| int_of(v).is_some_and(|i| i >= *value)),
            Predicate::IntLe { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| int_of(v).is_some_and(|i| i <= *value)),
            Predicate::StrGe { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| v.as_str().is_some_and(|s| s >= value.as_str())),
            Predicate::StrLe { attr, value } => entry
                .norm_values(attr)
                .iter()
                .any(|v| v.as_str().is_some_and(|s| s <= value.as_str())),
            Predicate::Present { attr } => !entry.norm_values(attr).is_empty(),
            Predicate::Nothing => false,
        }
    }

    /// An equality that can seed candidate selection from the typed
    /// attribute indexes. Only conjunctive positions qualify.
    pub(crate) fn index_hint(&self) -> Option<(String, IndexValue)> {
        match self {
            Predicate::And(children) => children.iter().find_map(Predicate::index_hint),
            Predicate::StrEq { attr, value } => {
                Some((attr.clone(), IndexValue::Str(value.clone())))
            }
            Predicate::IntEq { attr, value } => Some((attr.clone(), IndexValue::Int(*value))),
            _ => None,
        }
    }
}

pub(crate) struct FilterTranslator<'a> {
    pub schema: &'a Arc<SchemaRegistry>,
    pub cache: &'a EntryCache,
}

impl FilterTranslator<'_> {
    pub(crate) async fn translate(&self, filter: &Filter, dn_cache: &mut DnCache) -> Predicate {
        self.translate_boxed(filter, dn_cache).await
    }

    fn translate_boxed<'a>(
        &'a self,
        filter: &'a Filter,
        dn_cache: &'a mut DnCache,
    ) -> Pin<Box<dyn Future<Output = Predicate> + Send + 'a>> {
        Box::pin(async move {
            match filter {
                Filter::And(children) => {
                    let mut out = Vec::with_capacity(children.len());
                    for child in children {
                        out.push(self.translate_boxed(child, &mut *dn_cache).await);
                    }
                    Predicate::And(out)
                }
                Filter::Or(children) => {
                    let mut out = Vec::with_capacity(children.len());
                    for child in children {
                        out.push(self.translate_boxed(child, &mut *dn_cache).await);
                    }
                    Predicate::Or(out)
                }
                Filter::Not(inner) => {
                    Predicate::Not(Box::new(self.translate_boxed(inner, dn_cache).await))
                }
                Filter::Equality { attr, value } => self.equality(attr, value, dn_cache).await,
                Filter::Substring {
                    attr,
                    initial,
                    any,
                    final_,
                } => self.substring(attr, initial.as_deref(), any, final_.as_deref()),
                Filter::GreaterOrEqual { attr, value } => self.ordering(attr, value, true),
                Filter::LessOrEqual { attr, value } => self.ordering(attr, value, false),
                Filter::Present(attr) => match self.schema.attribute_type(attr) {
                    Some(at) => Predicate::Present {
                        attr: at.name.clone(),
                    },
                    None => Predicate::Nothing,
                },
                Filter::Approx { attr, value } => self.approx(attr, value),
            }
        })
    }

    async fn equality(&self, attr: &str, value: &str, dn_cache: &mut DnCache) -> Predicate {
        let Some(at) = self.schema.attribute_type(attr).cloned() else {
            tracing::warn!(attr, "unsupported filter attribute");
            return Predicate::Nothing;
        };
        if at.is_association() || at.is_reverse_association() {
            // Association values are entry ids; resolve the asserted DN
            // first. A DN that does not resolve can match nothing.
            let Ok(dn) = self.schema.normalize_dn(value) else {
                tracing::warn!(attr = %at.name, value, "ignoring association filter with invalid DN");
                return Predicate::Nothing;
            };
            let Ok(id) = self.cache.find_entry_id(&dn, dn_cache).await else {
                return Predicate::Nothing;
            };
            return Predicate::IntEq {
                attr: at.name.clone(),
                value: id,
            };
        }
        let Ok(sv) = self.schema.new_value(&at.name, vec![value.to_string()]) else {
            tracing::warn!(attr = %at.name, value, "ignoring filter with invalid syntax");
            return Predicate::Nothing;
        };
        if at.is_object_class() {
            return Predicate::ContainsAll {
                attr: at.name.clone(),
                values: sv.norm_str().to_vec(),
            };
        }
        match sv.norm().first() {
            Some(norm) => match norm.as_int() {
                Some(i) => Predicate::IntEq {
                    attr: at.name.clone(),
                    value: i,
                },
                None => Predicate::StrEq {
                    attr: at.name.clone(),
                    value: norm.to_norm_str(),
                },
            },
            None => Predicate::Nothing,
        }
    }

    fn substring(
        &self,
        attr: &str,
        initial: Option<&str>,
        any: &[String],
        final_: Option<&str>,
    ) -> Predicate {
        let Some(at) = self.schema.attribute_type(attr).cloned() else {
            return Predicate::Nothing;
        };
        if at.is_association() || at.is_reverse_association() {
            tracing::warn!(attr = %at.name, "association filters do not support substrings");
            return Predicate::Nothing;
        }
        let mut parts = Vec::new();
        if let Some(value) = initial {
            if let Some(norm) = self.norm_fragment(&at, value) {
                parts.push(Predicate::Prefix {
                    attr: at.name.clone(),
                    value: norm,
                });
            }
        }
        for value in any {
            if let Some(norm) = self.norm_fragment(&at, value) {
                parts.push(Predicate::Suffix {
                    attr: at.name.clone(),
                    value: norm,
                });
            }
        }
        if let Some(value) = final_ {
            if let Some(norm) = self.norm_fragment(&at, value) {
                parts.push(Predicate::Contains {
                    attr: at.name.clone(),
                    value: norm,
                });
            }
        }
        Predicate::And(parts)
    }

    fn ordering(&self, attr: &str, value: &str, greater: bool) -> Predicate {
        let Some(at) = self.schema.attribute_type(attr).cloned() else {
            return Predicate::Nothing;
        };
        if at.is_association() || at.is_reverse_association() || !at.is_number_ordering() {
            tracing::warn!(attr = %at.name, "attribute does not support ordering filters");
            return Predicate::Nothing;
        }
        let Ok(sv) = self.schema.new_value(&at.name, vec![value.to_string()]) else {
            tracing::warn!(attr = %at.name, value, "ignoring filter with invalid syntax");
            return Predicate::And(Vec::new());
        };
        match sv.norm().first() {
            Some(norm) => match (norm.as_int(), greater) {
                (Some(i), true) => Predicate::IntGe {
                    attr: at.name.clone(),
                    value: i,
                },
                (Some(i), false) => Predicate::IntLe {
                    attr: at.name.clone(),
                    value: i,
                },
                (None, true) => Predicate::StrGe {
                    attr: at.name.clone(),
                    value: norm.to_norm_str(),
                },
                (None, false) => Predicate::StrLe {
                    attr: at.name.clone(),
                    value: norm.to_norm_str(),
                },
            },
            None => Predicate::Nothing,
        }
    }

    fn approx(&self, attr: &str, value: &str) -> Predicate {
        let Some(at) = self.schema.attribute_type(attr).cloned() else {
            return Predicate::Nothing;
        };
        if at.is_association() || at.is_reverse_association() {
            return Predicate::Nothing;
        }
        match self.norm_fragment(&at, value) {
            Some(norm) => Predicate::Contains {
                attr: at.name.clone(),
                value: norm,
            },
            None => Predicate::Nothing,
        }
    }

    fn norm_fragment(&self, at: &Arc<AttributeType>, value: &str) -> Option<String> {
        match self.schema.new_value(&at.name, vec![value.to_string()]) {
            Ok(sv) => sv.norm_str().first().cloned(),
            Err(err) => {
                tracing::warn!(attr = %at.name, value, error = %err, "ignoring filter fragment");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::postgres::DbEntry;
    use canopy_schema::SchemaConfig;
    use serde_json::json;

    fn schema() -> Arc<SchemaRegistry> {
        Arc::new(
            SchemaRegistry::new(SchemaConfig {
                suffix: "dc=example,dc=com".to_string(),
                ..SchemaConfig::default()
            })
            .expect("schema registry"),
        )
    }

    fn row(id: i64, parent_id: i64, rdn_orig: &str, attrs: serde_json::Value) -> DbEntry {
        DbEntry {
            id,
            rev: 1,
            parent_id,
            path: None,
            is_container: false,
            rdn_norm: rdn_orig.to_lowercase(),
            rdn_orig: rdn_orig.to_string(),
            attrs_orig: attrs,
        }
    }

    async fn seeded() -> (Arc<SchemaRegistry>, EntryCache) {
        let sr = schema();
        let cache = EntryCache::new(sr.clone());
        let mut tx = cache.begin();
        let mut root = row(
            1,
            0,
            "dc=Example",
            json!({"dc": ["Example"], "objectClass": ["domain"]}),
        );
        root.path = Some(vec![1]);
        root.is_container = true;
        tx.upsert(cache.project(&root).expect("project"));
        tx.upsert(
            cache
                .project(&row(
                    2,
                    1,
                    "cn=Alice",
                    json!({
                        "cn": ["Alice"], "sn": ["Smith"],
                        "objectClass": ["inetOrgPerson"],
                        "uidNumber": ["1000"],
                        "memberOf": ["4"]
                    }),
                ))
                .expect("project"),
        );
        tx.upsert(
            cache
                .project(&row(
                    3,
                    1,
                    "cn=Bob",
                    json!({
                        "cn": ["Bob"], "sn": ["Jones"],
                        "objectClass": ["person"],
                        "uidNumber": ["2000"]
                    }),
                ))
                .expect("project"),
        );
        tx.upsert(
            cache
                .project(&row(
                    4,
                    1,
                    "cn=Admins",
                    json!({"cn": ["Admins"], "objectClass": ["groupOfNames"], "member": ["2"]}),
                ))
                .expect("project"),
        );
        cache.commit(tx).await.expect("commit");
        (sr, cache)
    }

    async fn matching_ids(sr: &Arc<SchemaRegistry>, cache: &EntryCache, filter: Filter) -> Vec<i64> {
        let translator = FilterTranslator { schema: sr, cache };
        let mut dn_cache = DnCache::new();
        let predicate = translator.translate(&filter, &mut dn_cache).await;
        let candidates = [1, 2, 3, 4];
        let (_, page) = cache.select(&candidates, &predicate, None, 100, 0).await;
        page.iter().map(|e| e.id).collect()
    }

    #[tokio::test]
    async fn equality_on_object_class_matches_superclasses() {
        let (sr, cache) = seeded().await;
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "objectClass".to_string(),
                value: "person".to_string(),
            },
        )
        .await;
        // Alice (inetOrgPerson) matches a person assertion; Bob does too.
        assert_eq!(ids, vec![2, 3]);

        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "objectClass".to_string(),
                value: "inetOrgPerson".to_string(),
            },
        )
        .await;
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn equality_normalizes_the_asserted_value() {
        let (sr, cache) = seeded().await;
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "CN".to_string(),
                value: "  ALICE ".to_string(),
            },
        )
        .await;
        assert_eq!(ids, vec![2]);
    }

    #[tokio::test]
    async fn association_equality_resolves_the_dn() {
        let (sr, cache) = seeded().await;
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "member".to_string(),
                value: "cn=alice,dc=example,dc=com".to_string(),
            },
        )
        .await;
        assert_eq!(ids, vec![4]);

        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "memberOf".to_string(),
                value: "cn=admins,dc=example,dc=com".to_string(),
            },
        )
        .await;
        assert_eq!(ids, vec![2]);

        // Unresolvable DN: guaranteed-empty.
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "member".to_string(),
                value: "cn=ghost,dc=example,dc=com".to_string(),
            },
        )
        .await;
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn substring_and_present_and_ordering() {
        let (sr, cache) = seeded().await;

        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Substring {
                attr: "cn".to_string(),
                initial: Some("al".to_string()),
                any: Vec::new(),
                final_: None,
            },
        )
        .await;
        assert_eq!(ids, vec![2]);

        let ids = matching_ids(&sr, &cache, Filter::Present("member".to_string())).await;
        assert_eq!(ids, vec![4]);

        let ids = matching_ids(
            &sr,
            &cache,
            Filter::GreaterOrEqual {
                attr: "uidNumber".to_string(),
                value: "1500".to_string(),
            },
        )
        .await;
        assert_eq!(ids, vec![3]);

        // Ordering on a non-number-ordered attribute degrades to empty.
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::GreaterOrEqual {
                attr: "cn".to_string(),
                value: "a".to_string(),
            },
        )
        .await;
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn boolean_composition() {
        let (sr, cache) = seeded().await;
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::And(vec![
                Filter::Equality {
                    attr: "objectClass".to_string(),
                    value: "person".to_string(),
                },
                Filter::Not(Box::new(Filter::Equality {
                    attr: "cn".to_string(),
                    value: "bob".to_string(),
                })),
            ]),
        )
        .await;
        assert_eq!(ids, vec![2]);

        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Or(vec![
                Filter::Equality {
                    attr: "cn".to_string(),
                    value: "bob".to_string(),
                },
                Filter::Equality {
                    attr: "cn".to_string(),
                    value: "admins".to_string(),
                },
            ]),
        )
        .await;
        assert_eq!(ids, vec![3, 4]);
    }

    #[tokio::test]
    async fn unknown_attribute_degrades_to_empty() {
        let (sr, cache) = seeded().await;
        let ids = matching_ids(
            &sr,
            &cache,
            Filter::Equality {
                attr: "nosuchattr".to_string(),
                value: "x".to_string(),
            },
        )
        .await;
        assert!(ids.is_empty());
    }

    #[tokio::test]
    async fn index_hint_comes_from_conjunctive_equalities() {
        let (sr, cache) = seeded().await;
        let translator = FilterTranslator {
            schema: &sr,
            cache: &cache,
        };
        let mut dn_cache = DnCache::new();
        let predicate = translator
            .translate(
                &Filter::And(vec![
                    Filter::Present("sn".to_string()),
                    Filter::Equality {
                        attr: "cn".to_string(),
                        value: "Alice".to_string(),
                    },
                ]),
                &mut dn_cache,
            )
            .await;
        assert_eq!(
            predicate.index_hint(),
            Some(("cn".to_string(), IndexValue::Str("alice".to_string())))
        );

        let predicate = translator
            .translate(&Filter::Present("sn".to_string()), &mut dn_cache)
            .await;
        assert!(predicate.index_hint().is_none());
    }
}
