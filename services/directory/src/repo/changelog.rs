//! Schema-aware change delta.
//!
//! # Purpose
//! A `Changelog` is built from an entry's current `attrs_orig` snapshot,
//! mutated through LDAP modify semantics (`add`/`replace`/`delete`), and
//! finally turned into the minimal set of per-attribute store operations
//! plus the membership delta for `member`/`uniqueMember`. Schema
//! validation runs against the projected new state, never the raw input.
use super::AttrsOrig;
use canopy_common::{LdapError, LdapResult};
use canopy_schema::{Dn, SchemaRegistry, SchemaValue, TIMESTAMP_FORMAT};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

/// Store-level operation for one attribute. All lists empty means clear.
#[derive(Debug, Clone, Default)]
pub struct ModOperation {
    pub add: Vec<String>,
    pub replace: Vec<String>,
    pub delete: Vec<String>,
}

impl ModOperation {
    pub fn is_add(&self) -> bool {
        !self.add.is_empty()
    }

    pub fn is_replace(&self) -> bool {
        !self.replace.is_empty()
    }

    pub fn is_delete(&self) -> bool {
        !self.delete.is_empty()
    }

    pub fn is_clear(&self) -> bool {
        !self.is_add() && !self.is_replace() && !self.is_delete()
    }
}

pub struct Changelog {
    schema: Arc<SchemaRegistry>,
    dn: Dn,
    new_dn: Option<Dn>,
    new_entry: HashMap<String, SchemaValue>,
    old_entry: HashMap<String, SchemaValue>,
    changed: HashSet<String>,
    requester: Dn,
    timestamp: String,
}

impl Changelog {
    /// Snapshot the current attributes of `dn` and prepare for mutation on
    /// behalf of `requester`. The operation timestamp is captured once.
    pub fn new(
        schema: Arc<SchemaRegistry>,
        dn: Dn,
        attrs_orig: &AttrsOrig,
        requester: Dn,
    ) -> LdapResult<Changelog> {
        let mut changelog = Changelog {
            schema,
            dn,
            new_dn: None,
            new_entry: HashMap::new(),
            old_entry: HashMap::new(),
            changed: HashSet::new(),
            requester,
            timestamp: Utc::now().format(TIMESTAMP_FORMAT).to_string(),
        };
        for (name, values) in attrs_orig {
            let sv = changelog.apply(name, values.clone())?;
            // Keep the pre-image for diffing.
            changelog.old_entry.insert(sv.name().to_string(), sv);
        }
        Ok(changelog)
    }

    pub fn dn(&self) -> &Dn {
        &self.dn
    }

    pub fn dn_norm(&self) -> String {
        self.dn.dn_norm_str()
    }

    pub fn new_dn(&self) -> Option<&Dn> {
        self.new_dn.as_ref()
    }

    pub fn update_dn(&mut self, new_dn: Dn) {
        self.new_dn = Some(new_dn);
    }

    pub fn requester(&self) -> &Dn {
        &self.requester
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn new_entry(&self) -> &HashMap<String, SchemaValue> {
        &self.new_entry
    }

    fn apply(&mut self, attr_name: &str, values: Vec<String>) -> LdapResult<SchemaValue> {
        let sv = self.schema.new_value(attr_name, values)?;
        self.apply_value(sv.clone())?;
        Ok(sv)
    }

    fn apply_value(&mut self, sv: SchemaValue) -> LdapResult<()> {
        match self.new_entry.get_mut(sv.name()) {
            Some(current) => current.add(sv),
            None => {
                self.new_entry.insert(sv.name().to_string(), sv);
                Ok(())
            }
        }
    }

    fn record(&mut self, name: &str) {
        self.changed.insert(name.to_string());
    }

    pub fn has_attr(&self, attr_name: &str) -> bool {
        let Some(at) = self.schema.attribute_type(attr_name) else {
            return false;
        };
        self.new_entry
            .get(&at.name)
            .map(|sv| !sv.is_empty())
            .unwrap_or(false)
    }

    /// Normalized objectClass values of the projected entry, chain-sorted.
    pub fn object_classes_norm(&self) -> Option<Vec<String>> {
        let sv = self.new_entry.get("objectClass")?;
        if sv.is_empty() {
            return None;
        }
        Some(sv.norm_str().to_vec())
    }

    /// modify/add semantics.
    pub fn add(&mut self, sv: SchemaValue) -> LdapResult<()> {
        if sv.is_no_user_modification_with_migration_disabled() {
            return Err(LdapError::NoUserModificationAllowedConstraintViolation {
                op: "modify/add".to_string(),
                attr: sv.name().to_string(),
            });
        }
        let name = sv.name().to_string();
        self.apply_value(sv)?;
        self.record(&name);
        Ok(())
    }

    /// Apply without the NO-USER-MODIFICATION gate. Used where the author
    /// is trusted, e.g. bulk imports carrying operational attributes.
    pub fn add_without_check(&mut self, sv: SchemaValue) -> LdapResult<()> {
        let name = sv.name().to_string();
        self.apply_value(sv)?;
        self.record(&name);
        Ok(())
    }

    /// modify/replace semantics; an empty value set removes the attribute.
    pub fn replace(&mut self, sv: SchemaValue) -> LdapResult<()> {
        if sv.is_no_user_modification_with_migration_disabled() {
            return Err(LdapError::NoUserModificationAllowedConstraintViolation {
                op: "modify/replace".to_string(),
                attr: sv.name().to_string(),
            });
        }
        if sv.name() == "objectClass" {
            let Some(current) = self.object_classes_norm() else {
                tracing::error!(
                    dn_norm = %self.dn_norm(),
                    "entry without objectClass, cancelling the operation"
                );
                return Err(LdapError::OperationsError);
            };
            for (i, v) in sv.orig().iter().enumerate() {
                let oc = self
                    .schema
                    .object_class(v)
                    .ok_or_else(|| LdapError::InvalidPerSyntax {
                        attr: "objectClass".to_string(),
                        index: i,
                    })?;
                if oc.structural {
                    return Err(LdapError::ObjectClassModsProhibited {
                        from: current[0].clone(),
                        to: oc.name.clone(),
                    });
                }
            }
        }
        let name = sv.name().to_string();
        if sv.is_empty() {
            self.new_entry.remove(&name);
        } else {
            self.new_entry.insert(name.clone(), sv);
        }
        self.record(&name);
        Ok(())
    }

    /// modify/delete semantics; an empty value set clears the attribute.
    pub fn delete(&mut self, sv: SchemaValue) -> LdapResult<()> {
        if sv.is_no_user_modification_with_migration_disabled() {
            return Err(LdapError::NoUserModificationAllowedConstraintViolation {
                op: "modify/delete".to_string(),
                attr: sv.name().to_string(),
            });
        }
        if sv.name() == "objectClass" {
            let Some(current) = self.object_classes_norm() else {
                tracing::error!(
                    dn_norm = %self.dn_norm(),
                    "entry without objectClass, cancelling the operation"
                );
                return Err(LdapError::OperationsError);
            };
            for (i, v) in sv.orig().iter().enumerate() {
                let oc = self
                    .schema
                    .object_class(v)
                    .ok_or_else(|| LdapError::InvalidPerSyntax {
                        attr: "objectClass".to_string(),
                        index: i,
                    })?;
                // Removing the entry's structural class is not allowed.
                if oc.structural && current[0] == oc.name.to_lowercase() {
                    return Err(LdapError::ObjectClassViolation);
                }
            }
        }
        let name = sv.name().to_string();
        if sv.is_empty() {
            if !self.has_attr(&name) {
                tracing::warn!(dn_norm = %self.dn_norm(), attr = %name, "modify/delete on absent attribute");
                return Err(LdapError::NoSuchAttribute {
                    op: "modify/delete".to_string(),
                    attr: name,
                });
            }
            if let Some(current) = self.new_entry.get_mut(&name) {
                current.clear();
            }
        } else {
            let Some(current) = self.new_entry.get_mut(&name) else {
                tracing::warn!(dn_norm = %self.dn_norm(), attr = %name, "modify/delete on absent attribute");
                return Err(LdapError::NoSuchAttribute {
                    op: "modify/delete".to_string(),
                    attr: name,
                });
            };
            current.delete(&sv)?;
        }
        self.record(&name);
        Ok(())
    }

    /// Validate the projected entry: objectClass presence, RDN attribute
    /// consistency, and the registry's object-class contract. For a fresh
    /// Add (empty pre-image) missing RDN attributes are synthesized instead
    /// of rejected.
    pub fn validate(&mut self) -> LdapResult<()> {
        if !self.has_attr("objectClass") {
            return Err(LdapError::ObjectClassViolation);
        }

        let is_add = self.old_entry.is_empty();
        for (type_norm, value) in self.dn.rdn() {
            let key = self
                .schema
                .attribute_type(&type_norm)
                .map(|at| at.name.clone())
                .unwrap_or_else(|| type_norm.clone());
            let missing = self
                .new_entry
                .get(&key)
                .map(|sv| sv.is_empty())
                .unwrap_or(true);
            if missing {
                if is_add {
                    self.apply(&key, vec![value.orig.clone()])?;
                    continue;
                }
                return Err(LdapError::NamingViolation { attr: key });
            }
            let has_value = self
                .new_entry
                .get(&key)
                .map(|sv| sv.contains(&value.norm))
                .unwrap_or(false);
            if !has_value {
                if is_add {
                    self.apply(&key, vec![value.orig.clone()])?;
                    continue;
                }
                return Err(LdapError::NamingViolationForValue { attr: key });
            }
        }

        let ocs = self
            .object_classes_norm()
            .ok_or(LdapError::ObjectClassViolation)?;
        self.schema.validate_object_classes(&ocs, &self.new_entry)
    }

    pub fn to_attrs_orig(&self) -> AttrsOrig {
        self.new_entry
            .iter()
            .map(|(name, sv)| (name.clone(), sv.orig().to_vec()))
            .collect()
    }

    /// Attributes for a fresh insert, with the operational attributes
    /// stamped. Migration mode preserves supplied values (re-encoding
    /// DN-valued names suffix-relative); otherwise the requester and the
    /// captured timestamp are used and an `entryUUID` is generated.
    pub fn to_new_attrs_orig(&self) -> AttrsOrig {
        let mut orig = self.to_attrs_orig();
        let suffix = &self.schema.suffix_dn;

        let creators = match orig.get("creatorsName").and_then(|v| v.first()) {
            Some(value) => match self.schema.normalize_dn(value) {
                Ok(dn) => dn.dn_orig_str_without_suffix(suffix),
                Err(_) => value.clone(),
            },
            None => self.requester.dn_orig_str_without_suffix(suffix),
        };
        let modifiers = match orig.get("modifiersName").and_then(|v| v.first()) {
            Some(value) => match self.schema.normalize_dn(value) {
                Ok(dn) => dn.dn_orig_str_without_suffix(suffix),
                Err(_) => value.clone(),
            },
            None => creators.clone(),
        };
        orig.insert("creatorsName".to_string(), vec![creators]);
        orig.insert("modifiersName".to_string(), vec![modifiers]);

        orig.entry("createTimestamp".to_string())
            .or_insert_with(|| vec![self.timestamp.clone()]);
        orig.entry("modifyTimestamp".to_string())
            .or_insert_with(|| vec![self.timestamp.clone()]);
        orig.entry("entryUUID".to_string())
            .or_insert_with(|| vec![Uuid::new_v4().to_string()]);

        orig
    }

    /// Minimal per-attribute operations for every touched attribute. An
    /// attribute whose projected state equals its pre-image emits nothing.
    pub fn to_diff(&self) -> HashMap<String, ModOperation> {
        let mut diff = HashMap::new();
        for name in &self.changed {
            let new = self.new_entry.get(name).filter(|sv| !sv.is_empty());
            let Some(new) = new else {
                diff.insert(name.clone(), ModOperation::default());
                continue;
            };
            let old = self.old_entry.get(name).filter(|sv| !sv.is_empty());
            let Some(old) = old else {
                diff.insert(
                    name.clone(),
                    ModOperation {
                        replace: new.orig().to_vec(),
                        ..ModOperation::default()
                    },
                );
                continue;
            };
            let (add, replace, delete) = new.diff(old);
            if !replace.is_empty() {
                diff.insert(
                    name.clone(),
                    ModOperation {
                        replace,
                        ..ModOperation::default()
                    },
                );
            } else if !add.is_empty() || !delete.is_empty() {
                diff.insert(
                    name.clone(),
                    ModOperation {
                        add,
                        delete,
                        ..ModOperation::default()
                    },
                );
            }
        }
        diff
    }

    /// Membership delta across `member` and `uniqueMember`: the union of
    /// added target ids and the union of removed target ids.
    pub fn to_member_of_diff(&self) -> (Vec<String>, Vec<String>) {
        let mut add = Vec::new();
        let mut add_seen = HashSet::new();
        let mut del = Vec::new();
        let mut del_seen = HashSet::new();

        for name in &self.changed {
            let Some(at) = self.schema.attribute_type(name) else {
                continue;
            };
            if !at.is_association() {
                continue;
            }
            let new = self.new_entry.get(name).filter(|sv| !sv.is_empty());
            let old = self.old_entry.get(name).filter(|sv| !sv.is_empty());
            match (new, old) {
                (None, None) => {}
                (None, Some(old)) => {
                    for v in old.orig() {
                        if del_seen.insert(v.clone()) {
                            del.push(v.clone());
                        }
                    }
                }
                (Some(new), None) => {
                    for v in new.orig() {
                        if add_seen.insert(v.clone()) {
                            add.push(v.clone());
                        }
                    }
                }
                (Some(new), Some(old)) => {
                    for (i, v) in new.orig().iter().enumerate() {
                        if !old.contains(&new.norm_str()[i]) && add_seen.insert(v.clone()) {
                            add.push(v.clone());
                        }
                    }
                    for (i, v) in old.orig().iter().enumerate() {
                        if !new.contains(&old.norm_str()[i]) && del_seen.insert(v.clone()) {
                            del.push(v.clone());
                        }
                    }
                }
            }
        }
        (add, del)
    }
}
