//! Schema-typed attribute values and matching-rule normalization.
use crate::dn::Dn;
use crate::registry::{AttributeType, SchemaRegistry};
use canopy_common::{LdapError, LdapResult};
use chrono::NaiveDateTime;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

static SPACE_PATTERN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").expect("space regex"));

/// Normalized form of a single value. The element type follows the matching
/// rule: integers for `integerMatch` and generalized time, DNs for
/// DN-syntax rules, strings for everything else.
#[derive(Debug, Clone, PartialEq)]
pub enum NormValue {
    Str(String),
    Int(i64),
    Dn(Box<Dn>),
}

impl NormValue {
    pub fn to_norm_str(&self) -> String {
        match self {
            NormValue::Str(s) => s.clone(),
            NormValue::Int(i) => i.to_string(),
            NormValue::Dn(dn) => dn.dn_norm_str(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            NormValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

/// An attribute's values in both original and normalized form, with a
/// norm-string index for O(1) membership checks.
#[derive(Debug, Clone)]
pub struct SchemaValue {
    attr: Arc<AttributeType>,
    migration_enabled: bool,
    orig: Vec<String>,
    norm: Vec<NormValue>,
    norm_str: Vec<String>,
    norm_index: HashSet<String>,
}

impl SchemaRegistry {
    /// Build a normalized value for `attr_name`. Fails when the type is
    /// unknown, a single-valued type receives multiple values, a value
    /// fails its matching rule, or the same value appears twice.
    pub fn new_value(&self, attr_name: &str, values: Vec<String>) -> LdapResult<SchemaValue> {
        let attr = self
            .attribute_type(attr_name)
            .ok_or_else(|| LdapError::UndefinedType {
                attr: attr_name.to_string(),
            })?
            .clone();
        if attr.single_value && values.len() > 1 {
            return Err(LdapError::MultipleValuesProvided {
                attr: attr.name.clone(),
            });
        }

        let (norm, norm_str, norm_index) = if attr.is_object_class() {
            self.normalize_object_classes(&attr, &values)?
        } else if attr.is_association() || attr.is_reverse_association() {
            self.normalize_association(&attr, &values)?
        } else {
            self.normalize_plain(&attr, &values)?
        };

        Ok(SchemaValue {
            attr,
            migration_enabled: self.config.migration_enabled,
            orig: values,
            norm,
            norm_str,
            norm_index,
        })
    }

    /// `objectClass` values are expanded with the full SUP chain of every
    /// structural/abstract class and emitted chain-sorted, so one equality
    /// query matches a class and all of its ancestors.
    fn normalize_object_classes(
        &self,
        attr: &AttributeType,
        values: &[String],
    ) -> LdapResult<(Vec<NormValue>, Vec<String>, HashSet<String>)> {
        let mut chained = Vec::new();
        let mut auxiliary = Vec::new();
        let mut seen = HashSet::new();
        let mut resolved = HashSet::new();
        for (i, v) in values.iter().enumerate() {
            let oc = self
                .object_class(v)
                .ok_or_else(|| LdapError::InvalidPerSyntax {
                    attr: attr.name.clone(),
                    index: i,
                })?;
            if !seen.insert(oc.name.clone()) {
                return Err(LdapError::MoreThanOnce {
                    attr: attr.name.clone(),
                    index: i,
                });
            }
            if oc.structural || oc.is_abstract {
                if !resolved.insert(oc.name.clone()) {
                    continue;
                }
                chained.push(oc.clone());
                // Walk the SUP chain upward, recording each ancestor once.
                let mut sup = oc.sup.clone();
                while !sup.is_empty() {
                    match self.object_class(&sup) {
                        Some(parent) => {
                            if !resolved.insert(parent.name.clone()) {
                                break;
                            }
                            sup = parent.sup.clone();
                            chained.push(parent.clone());
                        }
                        None => {
                            tracing::warn!(
                                object_class = %sup,
                                "cannot resolve superior objectClass during normalization"
                            );
                            break;
                        }
                    }
                }
            } else {
                auxiliary.push(oc.clone());
            }
        }

        self.sort_object_classes(&mut chained);
        self.verify_chained_object_classes(&chained)?;

        let mut norm = Vec::with_capacity(chained.len() + auxiliary.len());
        let mut norm_str = Vec::with_capacity(norm.capacity());
        let mut norm_index = HashSet::with_capacity(norm.capacity());
        for (i, oc) in chained.iter().chain(auxiliary.iter()).enumerate() {
            let value = normalize(self, attr, &oc.name, i)?;
            let s = value.to_norm_str();
            norm.push(value);
            norm_index.insert(s.clone());
            norm_str.push(s);
        }
        Ok((norm, norm_str, norm_index))
    }

    /// `member`/`uniqueMember`/`memberOf` hold entry ids once the repository
    /// has resolved them; values that already parse as integers are kept as
    /// integers, everything else normalizes as a DN.
    fn normalize_association(
        &self,
        attr: &AttributeType,
        values: &[String],
    ) -> LdapResult<(Vec<NormValue>, Vec<String>, HashSet<String>)> {
        let mut norm = Vec::with_capacity(values.len());
        let mut norm_str = Vec::with_capacity(values.len());
        let mut norm_index = HashSet::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            let value = match v.parse::<i64>() {
                Ok(id) => NormValue::Int(id),
                Err(_) => normalize(self, attr, v, i)?,
            };
            let s = value.to_norm_str();
            if !norm_index.insert(s.clone()) {
                return Err(LdapError::MoreThanOnce {
                    attr: attr.name.clone(),
                    index: i,
                });
            }
            norm.push(value);
            norm_str.push(s);
        }
        Ok((norm, norm_str, norm_index))
    }

    fn normalize_plain(
        &self,
        attr: &AttributeType,
        values: &[String],
    ) -> LdapResult<(Vec<NormValue>, Vec<String>, HashSet<String>)> {
        let mut norm = Vec::with_capacity(values.len());
        let mut norm_str = Vec::with_capacity(values.len());
        let mut norm_index = HashSet::with_capacity(values.len());
        for (i, v) in values.iter().enumerate() {
            let value = normalize(self, attr, v, i)?;
            let s = value.to_norm_str();
            if !norm_index.insert(s.clone()) {
                return Err(LdapError::MoreThanOnce {
                    attr: attr.name.clone(),
                    index: i,
                });
            }
            norm.push(value);
            norm_str.push(s);
        }
        Ok((norm, norm_str, norm_index))
    }
}

impl SchemaValue {
    pub fn name(&self) -> &str {
        &self.attr.name
    }

    pub fn attribute(&self) -> &Arc<AttributeType> {
        &self.attr
    }

    pub fn orig(&self) -> &[String] {
        &self.orig
    }

    pub fn norm(&self) -> &[NormValue] {
        &self.norm
    }

    pub fn norm_str(&self) -> &[String] {
        &self.norm_str
    }

    pub fn is_empty(&self) -> bool {
        self.orig.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.attr.single_value
    }

    pub fn is_no_user_modification(&self) -> bool {
        self.attr.no_user_modification
    }

    /// NO-USER-MODIFICATION is enforced unless migration mode lets bulk
    /// imports carry operational attributes through.
    pub fn is_no_user_modification_with_migration_disabled(&self) -> bool {
        !self.migration_enabled && self.attr.no_user_modification
    }

    pub fn is_association(&self) -> bool {
        self.attr.is_association()
    }

    pub fn is_reverse_association(&self) -> bool {
        self.attr.is_reverse_association()
    }

    pub fn contains(&self, value_norm: &str) -> bool {
        self.norm_index.contains(value_norm)
    }

    /// Index of the first value in `other` already present here.
    pub fn has_duplicate(&self, other: &SchemaValue) -> Option<usize> {
        other
            .norm_str
            .iter()
            .position(|v| self.norm_index.contains(v))
    }

    pub fn equal(&self, other: &SchemaValue) -> bool {
        if self.is_single() != other.is_single() {
            return false;
        }
        if self.norm_str.len() != other.norm_str.len() {
            return false;
        }
        other.norm_str.iter().all(|v| self.norm_index.contains(v))
    }

    /// Merge another value set into this one (modify/add semantics).
    pub fn add(&mut self, other: SchemaValue) -> LdapResult<()> {
        if self.is_single() {
            return Err(LdapError::MultipleValuesConstraintViolation {
                attr: other.name().to_string(),
            });
        }
        if let Some(i) = self.has_duplicate(&other) {
            return Err(LdapError::TypeOrValueExists {
                op: "modify/add".to_string(),
                attr: other.name().to_string(),
                index: i,
            });
        }
        self.orig.extend(other.orig);
        self.norm.extend(other.norm);
        self.norm_index.extend(other.norm_str.iter().cloned());
        self.norm_str.extend(other.norm_str);
        Ok(())
    }

    /// Remove the given values (modify/delete semantics). Every value must
    /// currently be present.
    pub fn delete(&mut self, other: &SchemaValue) -> LdapResult<()> {
        for v in &other.norm_str {
            if !self.norm_index.contains(v) {
                return Err(LdapError::NoSuchAttribute {
                    op: "modify/delete".to_string(),
                    attr: other.name().to_string(),
                });
            }
        }
        let mut orig = Vec::with_capacity(self.orig.len() - other.orig.len());
        let mut norm = Vec::with_capacity(orig.capacity());
        let mut norm_str = Vec::with_capacity(orig.capacity());
        let mut norm_index = HashSet::with_capacity(orig.capacity());
        for (j, v) in self.norm_str.iter().enumerate() {
            if !other.norm_index.contains(v) {
                orig.push(self.orig[j].clone());
                norm.push(self.norm[j].clone());
                norm_str.push(v.clone());
                norm_index.insert(v.clone());
            }
        }
        self.orig = orig;
        self.norm = norm;
        self.norm_str = norm_str;
        self.norm_index = norm_index;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.orig.clear();
        self.norm.clear();
        self.norm_str.clear();
        self.norm_index.clear();
    }

    /// Minimal diff against `base`: returns `(added, replace, deleted)`
    /// original values. When every base value disappears the whole set is a
    /// replace; an unchanged set returns three empty lists.
    pub fn diff(&self, base: &SchemaValue) -> (Vec<String>, Vec<String>, Vec<String>) {
        if self.is_single()
            && !self.norm_str.is_empty()
            && !base.norm_str.is_empty()
            && self.norm_str[0] == base.norm_str[0]
        {
            return (Vec::new(), Vec::new(), Vec::new());
        }

        let mut add = Vec::new();
        let mut del = Vec::new();
        for (i, v) in self.orig.iter().enumerate() {
            if !base.norm_index.contains(&self.norm_str[i]) {
                add.push(v.clone());
            }
        }
        for (i, v) in base.orig.iter().enumerate() {
            if !self.norm_index.contains(&base.norm_str[i]) {
                del.push(v.clone());
            }
        }
        if !base.norm_str.is_empty() && del.len() == base.norm_str.len() {
            return (Vec::new(), self.orig.clone(), Vec::new());
        }
        (add, Vec::new(), del)
    }
}

/// Map `(attribute type, raw value)` to its canonical form according to the
/// equality rule, with the substring rule as fallback. Idempotent.
pub(crate) fn normalize(
    registry: &SchemaRegistry,
    attr: &AttributeType,
    value: &str,
    index: usize,
) -> LdapResult<NormValue> {
    let invalid = || LdapError::InvalidPerSyntax {
        attr: attr.name.clone(),
        index,
    };
    match attr.equality.as_str() {
        "caseExactMatch" | "caseExactIA5Match" => Ok(NormValue::Str(normalize_space(value))),
        "caseIgnoreMatch" | "caseIgnoreIA5Match" => {
            Ok(NormValue::Str(normalize_space(value).to_lowercase()))
        }
        "distinguishedNameMatch" => {
            let dn = registry.normalize_dn(value).map_err(|_| invalid())?;
            Ok(NormValue::Dn(Box::new(dn)))
        }
        "uniqueMemberMatch" => match registry.normalize_dn(value) {
            Ok(dn) => Ok(NormValue::Dn(Box::new(dn))),
            // NameAndOptionalUID values that are not DNs fall back to
            // caseIgnore semantics.
            Err(_) => Ok(NormValue::Str(normalize_space(value).to_lowercase())),
        },
        "generalizedTimeMatch" => {
            if attr.is_nano_format() {
                let t = NaiveDateTime::parse_from_str(value, crate::TIMESTAMP_NANO_FORMAT)
                    .map_err(|_| invalid())?;
                let nanos = t.and_utc().timestamp_nanos_opt().ok_or_else(invalid)?;
                Ok(NormValue::Int(nanos))
            } else {
                let t = NaiveDateTime::parse_from_str(value, crate::TIMESTAMP_FORMAT)
                    .map_err(|_| invalid())?;
                Ok(NormValue::Int(t.and_utc().timestamp()))
            }
        }
        "objectIdentifierMatch" => Ok(NormValue::Str(value.to_lowercase())),
        "numericStringMatch" => Ok(NormValue::Str(remove_all_space(value))),
        "integerMatch" => {
            let i = value.parse::<i64>().map_err(|_| invalid())?;
            Ok(NormValue::Int(i))
        }
        "booleanMatch" => {
            // RFC 4517 §3.3.3: Boolean is exactly "TRUE" / "FALSE".
            if value != "TRUE" && value != "FALSE" {
                return Err(invalid());
            }
            Ok(NormValue::Str(value.to_string()))
        }
        "UUIDMatch" => {
            let u = uuid::Uuid::parse_str(value).map_err(|_| invalid())?;
            Ok(NormValue::Str(u.to_string()))
        }
        _ => match attr.substr.as_str() {
            "caseExactSubstringsMatch" | "caseExactIA5SubstringsMatch" => {
                Ok(NormValue::Str(normalize_space(value)))
            }
            "caseIgnoreSubstringsMatch" | "caseIgnoreIA5SubstringsMatch" => {
                Ok(NormValue::Str(normalize_space(value).to_lowercase()))
            }
            _ => Ok(NormValue::Str(value.to_string())),
        },
    }
}

fn normalize_space(value: &str) -> String {
    SPACE_PATTERN.replace_all(value, " ").trim().to_string()
}

fn remove_all_space(value: &str) -> String {
    SPACE_PATTERN.replace_all(value, "").to_string()
}
