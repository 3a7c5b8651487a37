//! Schema registry: attribute types, object classes, entry validation.
//!
//! # Purpose
//! Built once at startup from the bundled OpenLDAP 2.4 core definitions
//! merged with operator-supplied overrides and additions. Override lines
//! replace a bundled definition when kind and OID match; everything else is
//! appended. After parsing, missing matching rules are inherited down each
//! attribute's SUP chain.
use crate::builtin::CORE_SCHEMA;
use crate::dn::Dn;
use crate::value::SchemaValue;
use canopy_common::{LdapError, LdapResult};
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock};

static OID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?): \( (.*?) ").expect("oid regex"));
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*?: \( .*? NAME '(.*?)' ").expect("name regex"));
static NAMES_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^.*?: \( .*? NAME \( (.*?) \) ").expect("names regex"));
static EQUALITY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" EQUALITY (.*?) ").expect("equality regex"));
static SYNTAX_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" SYNTAX (.*?) ").expect("syntax regex"));
static SUBSTR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" SUBSTR (.*?) ").expect("substr regex"));
static ORDERING_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" ORDERING (.*?) ").expect("ordering regex"));
static SUP_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" SUP (.*?) ").expect("sup regex"));
static USAGE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" USAGE (.*?) ").expect("usage regex"));
static MUST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" MUST (.*?) ").expect("must regex"));
static MULTI_MUST_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" MUST \( (.*?) \) ").expect("multi must regex"));
static MAY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" MAY (.*?) ").expect("may regex"));
static MULTI_MAY_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r" MAY \( (.*?) \) ").expect("multi may regex"));

/// Operator-facing schema options.
#[derive(Debug, Clone, Default)]
pub struct SchemaConfig {
    pub suffix: String,
    pub root_dn: String,
    pub default_ppolicy_dn: String,
    /// Extra schema lines in the same `attributetypes: ( ... )` /
    /// `objectclasses: ( ... )` form as the bundled definitions.
    pub custom_schema: Vec<String>,
    pub migration_enabled: bool,
}

#[derive(Debug, Clone, Default)]
pub struct AttributeType {
    pub name: String,
    pub aliases: Vec<String>,
    pub oid: String,
    pub equality: String,
    pub ordering: String,
    pub substr: String,
    pub syntax: String,
    pub sup: String,
    pub usage: String,
    pub single_value: bool,
    pub no_user_modification: bool,
}

impl AttributeType {
    pub fn is_object_class(&self) -> bool {
        self.name == "objectClass"
    }

    pub fn is_case_ignore(&self) -> bool {
        self.equality.starts_with("caseIgnore") || self.equality == "objectIdentifierMatch"
    }

    pub fn is_case_ignore_substr(&self) -> bool {
        self.substr.starts_with("caseIgnore") || self.substr == "numericStringSubstringsMatch"
    }

    pub fn is_operational(&self) -> bool {
        matches!(
            self.usage.as_str(),
            "directoryOperation" | "dSAOperation" | "distributedOperation"
        )
    }

    pub fn is_association(&self) -> bool {
        self.name == "member" || self.name == "uniqueMember"
    }

    pub fn is_reverse_association(&self) -> bool {
        self.name == "memberOf"
    }

    pub fn is_number_ordering(&self) -> bool {
        matches!(
            self.ordering.as_str(),
            "generalizedTimeOrderingMatch"
                | "integerOrderingMatch"
                | "numericStringOrderingMatch"
                | "UUIDOrderingMatch"
        )
    }

    pub fn is_nano_format(&self) -> bool {
        self.name == "pwdFailureTime"
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectClass {
    pub name: String,
    pub oid: String,
    pub sup: String,
    pub structural: bool,
    pub is_abstract: bool,
    pub auxiliary: bool,
    pub(crate) must: Vec<String>,
    pub(crate) may: Vec<String>,
}

pub struct SchemaRegistry {
    pub config: SchemaConfig,
    attribute_types: HashMap<String, Arc<AttributeType>>,
    object_classes: HashMap<String, Arc<ObjectClass>>,
    pub suffix_dn: Dn,
    pub root_dn: Dn,
    pub default_ppolicy_dn: Dn,
    merged_schema: String,
}

impl SchemaRegistry {
    pub fn new(config: SchemaConfig) -> LdapResult<Self> {
        let merged = merge_schema(CORE_SCHEMA, &config.custom_schema);

        let mut defs = Vec::new();
        let mut classes = Vec::new();
        for line in merged.lines() {
            if line.is_empty() {
                continue;
            }
            let Some((kind, oid)) = parse_oid(line) else {
                tracing::warn!(line, "unsupported schema line");
                continue;
            };
            match kind.to_lowercase().as_str() {
                "attributetypes" => {
                    if let Some(def) = parse_attribute_type(line, oid) {
                        defs.push(def);
                    } else {
                        tracing::warn!(line, "unsupported attribute type definition");
                    }
                }
                "objectclasses" => {
                    if let Some(class) = parse_object_class(line, oid) {
                        classes.push(class);
                    } else {
                        tracing::warn!(line, "unsupported objectClass definition");
                    }
                }
                _ => {}
            }
        }

        resolve_matching_rules(&mut defs);

        let mut attribute_types = HashMap::new();
        for def in defs {
            let def = Arc::new(def);
            attribute_types.insert(def.name.to_lowercase(), def.clone());
            for alias in &def.aliases {
                attribute_types.insert(alias.to_lowercase(), def.clone());
            }
        }
        let mut object_classes = HashMap::new();
        for class in classes {
            let class = Arc::new(class);
            object_classes.insert(class.name.to_lowercase(), class);
        }

        let mut registry = SchemaRegistry {
            config,
            attribute_types,
            object_classes,
            suffix_dn: Dn::anonymous(),
            root_dn: Dn::anonymous(),
            default_ppolicy_dn: Dn::anonymous(),
            merged_schema: merged,
        };
        registry.suffix_dn = registry.normalize_dn(&registry.config.suffix.clone())?;
        registry.root_dn = registry.normalize_dn(&registry.config.root_dn.clone())?;
        registry.default_ppolicy_dn =
            registry.normalize_dn(&registry.config.default_ppolicy_dn.clone())?;
        Ok(registry)
    }

    /// The merged schema text, served verbatim on subschema reads.
    pub fn dump(&self) -> &str {
        &self.merged_schema
    }

    /// Case-insensitive attribute type lookup, aliases included.
    pub fn attribute_type(&self, name: &str) -> Option<&Arc<AttributeType>> {
        self.attribute_types.get(&name.to_lowercase())
    }

    /// Case-insensitive objectClass lookup.
    pub fn object_class(&self, name: &str) -> Option<&Arc<ObjectClass>> {
        self.object_classes.get(&name.to_lowercase())
    }

    /// Parse a DN; the empty string is the anonymous DN.
    pub fn normalize_dn(&self, dn: &str) -> LdapResult<Dn> {
        if dn.is_empty() {
            return Ok(Dn::anonymous());
        }
        Dn::parse(self, dn)
    }

    /// MUST attributes of a class, SUP chain included.
    pub fn must_of(&self, class: &ObjectClass) -> Vec<String> {
        let mut out = class.must.clone();
        let mut sup = class.sup.clone();
        let mut visited = HashSet::new();
        while !sup.is_empty() && visited.insert(sup.to_lowercase()) {
            match self.object_class(&sup) {
                Some(parent) => {
                    out.extend(parent.must.iter().cloned());
                    sup = parent.sup.clone();
                }
                None => break,
            }
        }
        out
    }

    /// MAY attributes of a class, SUP chain included.
    pub fn may_of(&self, class: &ObjectClass) -> Vec<String> {
        let mut out = class.may.clone();
        let mut sup = class.sup.clone();
        let mut visited = HashSet::new();
        while !sup.is_empty() && visited.insert(sup.to_lowercase()) {
            match self.object_class(&sup) {
                Some(parent) => {
                    out.extend(parent.may.iter().cloned());
                    sup = parent.sup.clone();
                }
                None => break,
            }
        }
        out
    }

    /// Whether the class (or any superior) allows the attribute.
    pub fn class_contains(&self, class: &ObjectClass, attr: &str) -> bool {
        self.must_of(class)
            .iter()
            .chain(self.may_of(class).iter())
            .any(|v| v.eq_ignore_ascii_case(attr))
    }

    /// Validate an entry's attributes against its object classes:
    /// every class resolves, at least one structural class exists, every
    /// MUST is satisfied, every user attribute is allowed by some class,
    /// and the structural classes form a strict SUP chain.
    pub fn validate_object_classes(
        &self,
        ocs: &[String],
        attrs: &HashMap<String, SchemaValue>,
    ) -> LdapResult<()> {
        let mut structural = Vec::new();
        for (i, v) in ocs.iter().enumerate() {
            let oc = self
                .object_class(v)
                .ok_or_else(|| LdapError::InvalidPerSyntax {
                    attr: "objectClass".to_string(),
                    index: i,
                })?
                .clone();
            for must in self.must_of(&oc) {
                let canonical = self
                    .attribute_type(&must)
                    .map(|at| at.name.clone())
                    .unwrap_or_else(|| must.clone());
                if !attrs.contains_key(&canonical) {
                    return Err(LdapError::ObjectClassViolationRequiresAttribute {
                        class: oc.name.clone(),
                        attr: must,
                    });
                }
            }
            if oc.structural {
                structural.push(oc);
            }
        }
        if structural.is_empty() {
            return Err(LdapError::ObjectClassViolationNoStructural);
        }

        self.sort_object_classes(&mut structural);
        self.verify_chained_object_classes(&structural)?;

        for (name, sv) in attrs {
            if name == "objectClass" || sv.is_no_user_modification() {
                continue;
            }
            // memberOf is maintained by the repository and is always
            // allowed, with or without a class that lists it.
            if sv.is_reverse_association() {
                continue;
            }
            let allowed = ocs.iter().any(|v| {
                self.object_class(v)
                    .map(|oc| self.class_contains(oc, name))
                    .unwrap_or(false)
            });
            if !allowed {
                return Err(LdapError::ObjectClassViolationNotAllowed {
                    attr: name.clone(),
                });
            }
        }
        Ok(())
    }

    fn sup_depth(&self, class: &ObjectClass) -> usize {
        let mut depth = 0;
        let mut sup = class.sup.clone();
        let mut visited = HashSet::new();
        while !sup.is_empty() && visited.insert(sup.to_lowercase()) {
            match self.object_class(&sup) {
                Some(parent) => {
                    depth += 1;
                    sup = parent.sup.clone();
                }
                None => break,
            }
        }
        depth
    }

    /// Order classes most-derived first. Depth under the SUP relation with a
    /// name tiebreak is a total order that agrees with the ancestor partial
    /// order, so derived classes always precede their superiors.
    pub(crate) fn sort_object_classes(&self, classes: &mut [Arc<ObjectClass>]) {
        classes.sort_by(|a, b| {
            self.sup_depth(b)
                .cmp(&self.sup_depth(a))
                .then_with(|| a.name.cmp(&b.name))
        });
    }

    /// After sorting, each class must be a SUP ancestor of none other than
    /// the next element; two independent structural chains are rejected.
    pub(crate) fn verify_chained_object_classes(
        &self,
        classes: &[Arc<ObjectClass>],
    ) -> LdapResult<()> {
        for i in 1..classes.len() {
            let prev = &classes[i - 1];
            let cur = &classes[i];
            let mut sup = prev.sup.clone();
            loop {
                if sup.is_empty() {
                    return Err(LdapError::ObjectClassViolationInvalidStructuralChain {
                        first: classes[0].name.clone(),
                        second: classes[i].name.clone(),
                    });
                }
                let Some(parent) = self.object_class(&sup) else {
                    return Err(LdapError::ObjectClassViolationInvalidStructuralChain {
                        first: classes[0].name.clone(),
                        second: classes[i].name.clone(),
                    });
                };
                if parent.name == cur.name {
                    break;
                }
                sup = parent.sup.clone();
            }
        }
        Ok(())
    }
}

fn parse_oid(line: &str) -> Option<(String, String)> {
    let caps = OID_PATTERN.captures(line)?;
    Some((caps[1].to_string(), caps[2].to_string()))
}

fn parse_names(line: &str) -> Option<Vec<String>> {
    if let Some(caps) = NAME_PATTERN.captures(line) {
        return Some(vec![caps[1].to_string()]);
    }
    let caps = NAMES_PATTERN.captures(line)?;
    Some(
        caps[1]
            .replace('\'', "")
            .split_whitespace()
            .map(str::to_string)
            .collect(),
    )
}

fn capture(pattern: &Regex, line: &str) -> String {
    pattern
        .captures(line)
        .map(|caps| caps[1].to_string())
        .unwrap_or_default()
}

fn parse_attribute_type(line: &str, oid: String) -> Option<AttributeType> {
    let names = parse_names(line)?;
    let (name, aliases) = names.split_first()?;
    Some(AttributeType {
        name: name.clone(),
        aliases: aliases.to_vec(),
        oid,
        equality: capture(&EQUALITY_PATTERN, line),
        ordering: capture(&ORDERING_PATTERN, line),
        substr: capture(&SUBSTR_PATTERN, line),
        syntax: capture(&SYNTAX_PATTERN, line),
        sup: capture(&SUP_PATTERN, line),
        usage: capture(&USAGE_PATTERN, line),
        single_value: line.contains("SINGLE-VALUE"),
        no_user_modification: line.contains("NO-USER-MODIFICATION"),
    })
}

fn parse_attr_list(multi: &Regex, single: &Regex, line: &str) -> Vec<String> {
    if let Some(caps) = multi.captures(line) {
        return caps[1]
            .split('$')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
    }
    if let Some(caps) = single.captures(line) {
        return vec![caps[1].to_string()];
    }
    Vec::new()
}

fn parse_object_class(line: &str, oid: String) -> Option<ObjectClass> {
    let names = parse_names(line)?;
    Some(ObjectClass {
        name: names.first()?.clone(),
        oid,
        sup: capture(&SUP_PATTERN, line),
        structural: line.contains(" STRUCTURAL "),
        is_abstract: line.contains(" ABSTRACT "),
        auxiliary: line.contains(" AUXILIARY "),
        must: parse_attr_list(&MULTI_MUST_PATTERN, &MUST_PATTERN, line),
        may: parse_attr_list(&MULTI_MAY_PATTERN, &MAY_PATTERN, line),
    })
}

/// Inherit missing equality/ordering/substr rules down the SUP chain.
fn resolve_matching_rules(defs: &mut [AttributeType]) {
    let index: HashMap<String, usize> = defs
        .iter()
        .enumerate()
        .map(|(i, def)| (def.name.to_lowercase(), i))
        .collect();

    fn inherit(
        defs: &mut [AttributeType],
        index: &HashMap<String, usize>,
        get: fn(&AttributeType) -> &str,
        set: fn(&mut AttributeType, String),
    ) {
        for i in 0..defs.len() {
            if !get(&defs[i]).is_empty() {
                continue;
            }
            let mut cur = i;
            let mut visited = HashSet::new();
            loop {
                let sup = defs[cur].sup.to_lowercase();
                if sup.is_empty() || !visited.insert(sup.clone()) {
                    break;
                }
                let Some(&parent) = index.get(&sup) else {
                    tracing::warn!(
                        attr = %defs[i].name,
                        sup = %defs[cur].sup,
                        "superior attribute type not found in schema"
                    );
                    break;
                };
                if !get(&defs[parent]).is_empty() {
                    let value = get(&defs[parent]).to_string();
                    set(&mut defs[i], value);
                    break;
                }
                cur = parent;
            }
        }
    }

    inherit(defs, &index, |d| &d.equality, |d, v| d.equality = v);
    inherit(defs, &index, |d| &d.ordering, |d, v| d.ordering = v);
    inherit(defs, &index, |d| &d.substr, |d, v| d.substr = v);
}

/// Merge the bundled schema with custom lines: a custom line replaces a
/// bundled definition when kind and OID match, otherwise it is appended.
/// Output keeps definitions grouped by kind so dependent kinds come last.
fn merge_schema(base: &str, custom: &[String]) -> String {
    let mut groups: HashMap<&str, Vec<String>> = HashMap::new();
    let mut used = HashSet::new();

    let push = |groups: &mut HashMap<&str, Vec<String>>, kind: String, line: String| {
        let slot = match kind.to_lowercase().as_str() {
            "ldapsyntaxes" => "ldapsyntaxes",
            "matchingrules" => "matchingrules",
            "matchingruleuse" => "matchingruleuse",
            "attributetypes" => "attributetypes",
            "objectclasses" => "objectclasses",
            _ => return,
        };
        groups.entry(slot).or_default().push(line);
    };

    for line in base.lines() {
        if line.is_empty() {
            continue;
        }
        let Some((kind, oid)) = parse_oid(line) else {
            continue;
        };
        let mut replaced = None;
        for custom_line in custom {
            if custom_line.is_empty() {
                continue;
            }
            if let Some((custom_kind, custom_oid)) = parse_oid(custom_line) {
                if custom_kind == kind && custom_oid == oid {
                    tracing::info!(line = %custom_line, "overwriting schema");
                    used.insert(format!("{custom_kind}/{custom_oid}"));
                    replaced = Some(custom_line.clone());
                    break;
                }
            }
        }
        push(&mut groups, kind, replaced.unwrap_or_else(|| line.to_string()));
    }

    for custom_line in custom {
        if custom_line.is_empty() {
            continue;
        }
        let Some((kind, oid)) = parse_oid(custom_line) else {
            tracing::warn!(line = %custom_line, "unsupported custom schema line");
            continue;
        };
        if !used.contains(&format!("{kind}/{oid}")) {
            tracing::info!(line = %custom_line, "adding schema");
            push(&mut groups, kind, custom_line.clone());
        }
    }

    let mut all = Vec::new();
    for kind in [
        "ldapsyntaxes",
        "matchingrules",
        "matchingruleuse",
        "attributetypes",
        "objectclasses",
    ] {
        if let Some(lines) = groups.remove(kind) {
            all.extend(lines);
        }
    }
    all.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(SchemaConfig {
            suffix: "dc=example,dc=com".to_string(),
            ..SchemaConfig::default()
        })
        .expect("schema registry")
    }

    fn classes(sr: &SchemaRegistry, names: &[&str]) -> Vec<Arc<ObjectClass>> {
        names
            .iter()
            .map(|v| sr.object_class(v).expect("objectClass").clone())
            .collect()
    }

    #[test]
    fn lookup_is_case_insensitive_and_alias_aware() {
        let sr = registry();
        assert_eq!(sr.attribute_type("CN").expect("cn").name, "cn");
        assert_eq!(sr.attribute_type("commonName").expect("alias").name, "cn");
        assert_eq!(
            sr.object_class("INETORGPERSON").expect("class").name,
            "inetOrgPerson"
        );
    }

    #[test]
    fn matching_rules_inherit_from_sup() {
        let sr = registry();
        // cn has no EQUALITY of its own; it inherits from `name`.
        let cn = sr.attribute_type("cn").expect("cn");
        assert_eq!(cn.equality, "caseIgnoreMatch");
        assert_eq!(cn.substr, "caseIgnoreSubstringsMatch");
    }

    #[test]
    fn classification_helpers() {
        let sr = registry();
        assert!(sr.attribute_type("member").expect("attr").is_association());
        assert!(
            sr.attribute_type("memberOf")
                .expect("attr")
                .is_reverse_association()
        );
        assert!(
            sr.attribute_type("modifyTimestamp")
                .expect("attr")
                .is_operational()
        );
        assert!(!sr.attribute_type("cn").expect("attr").is_operational());
        assert!(
            sr.attribute_type("createTimestamp")
                .expect("attr")
                .is_number_ordering()
        );
        assert!(sr.attribute_type("pwdFailureTime").expect("attr").is_nano_format());
        assert!(sr.attribute_type("objectClass").expect("attr").is_object_class());
    }

    #[test]
    fn sort_orders_most_derived_first() {
        let sr = registry();
        let mut ocs = classes(
            &sr,
            &["person", "top", "inetOrgPerson", "organizationalPerson"],
        );
        sr.sort_object_classes(&mut ocs);
        let names: Vec<&str> = ocs.iter().map(|oc| oc.name.as_str()).collect();
        assert_eq!(
            names,
            ["inetOrgPerson", "organizationalPerson", "person", "top"]
        );
        assert!(sr.verify_chained_object_classes(&ocs).is_ok());
    }

    #[test]
    fn verify_rejects_parallel_structural_chains() {
        let sr = registry();
        for input in [
            vec!["groupOfUniqueNames", "inetOrgPerson"],
            vec!["groupOfUniqueNames", "person", "inetOrgPerson"],
            vec!["person", "inetOrgPerson", "groupOfUniqueNames"],
        ] {
            let mut ocs = classes(&sr, &input);
            sr.sort_object_classes(&mut ocs);
            let err = sr
                .verify_chained_object_classes(&ocs)
                .expect_err("parallel chains");
            assert!(matches!(
                err,
                LdapError::ObjectClassViolationInvalidStructuralChain { .. }
            ));
        }
    }

    #[test]
    fn validate_requires_structural_class_and_musts() {
        let sr = registry();

        let mut attrs = HashMap::new();
        attrs.insert(
            "cn".to_string(),
            sr.new_value("cn", vec!["abc".to_string()]).expect("cn"),
        );

        // dcObject alone is auxiliary only.
        let err = sr
            .validate_object_classes(&["dcObject".to_string()], &attrs)
            .expect_err("no structural");
        assert!(matches!(
            err,
            LdapError::ObjectClassViolationRequiresAttribute { .. }
                | LdapError::ObjectClassViolationNoStructural
        ));

        // person requires sn.
        let err = sr
            .validate_object_classes(&["person".to_string()], &attrs)
            .expect_err("missing sn");
        assert_eq!(
            err.to_string(),
            "object class 'person' requires attribute 'sn'"
        );

        attrs.insert(
            "sn".to_string(),
            sr.new_value("sn", vec!["efg".to_string()]).expect("sn"),
        );
        sr.validate_object_classes(&["person".to_string()], &attrs)
            .expect("valid person");
    }

    #[test]
    fn validate_rejects_attributes_no_class_allows() {
        let sr = registry();
        let mut attrs = HashMap::new();
        attrs.insert(
            "cn".to_string(),
            sr.new_value("cn", vec!["abc".to_string()]).expect("cn"),
        );
        attrs.insert(
            "sn".to_string(),
            sr.new_value("sn", vec!["efg".to_string()]).expect("sn"),
        );
        attrs.insert(
            "displayName".to_string(),
            sr.new_value("displayName", vec!["hij".to_string()])
                .expect("displayName"),
        );

        // person does not allow displayName, inetOrgPerson does.
        let err = sr
            .validate_object_classes(&["person".to_string()], &attrs)
            .expect_err("not allowed");
        assert_eq!(err.to_string(), "attribute 'displayName' not allowed");

        sr.validate_object_classes(&["inetOrgPerson".to_string()], &attrs)
            .expect("inetOrgPerson allows displayName");
    }

    #[test]
    fn validate_always_allows_member_of() {
        let sr = registry();
        let mut attrs = HashMap::new();
        attrs.insert(
            "cn".to_string(),
            sr.new_value("cn", vec!["abc".to_string()]).expect("cn"),
        );
        attrs.insert(
            "sn".to_string(),
            sr.new_value("sn", vec!["efg".to_string()]).expect("sn"),
        );
        attrs.insert(
            "memberOf".to_string(),
            sr.new_value("memberOf", vec!["42".to_string()])
                .expect("memberOf"),
        );
        sr.validate_object_classes(&["person".to_string()], &attrs)
            .expect("memberOf tolerated");
    }

    #[test]
    fn custom_schema_overrides_and_adds() {
        let sr = SchemaRegistry::new(SchemaConfig {
            suffix: "dc=example,dc=com".to_string(),
            custom_schema: vec![
                // Same kind+OID as the bundled displayName: override.
                "attributetypes: ( 2.16.840.1.113730.3.1.241 NAME 'displayName' EQUALITY caseExactMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 SINGLE-VALUE )"
                    .to_string(),
                // New definition: appended.
                "attributetypes: ( 1.3.6.1.4.1.99999.1.1 NAME 'canopyTag' EQUALITY caseIgnoreMatch SYNTAX 1.3.6.1.4.1.1466.115.121.1.15 )"
                    .to_string(),
            ],
            ..SchemaConfig::default()
        })
        .expect("schema registry");

        assert_eq!(
            sr.attribute_type("displayName").expect("override").equality,
            "caseExactMatch"
        );
        assert!(sr.attribute_type("canopyTag").is_some());
    }

    #[test]
    fn suffix_and_root_dns_parse_at_construction() {
        let sr = SchemaRegistry::new(SchemaConfig {
            suffix: "dc=example,dc=com".to_string(),
            root_dn: "cn=Manager,dc=example,dc=com".to_string(),
            ..SchemaConfig::default()
        })
        .expect("schema registry");
        assert_eq!(sr.suffix_dn.dn_norm_str(), "dc=example,dc=com");
        assert_eq!(sr.root_dn.dn_norm_str(), "cn=manager,dc=example,dc=com");
        assert!(sr.default_ppolicy_dn.is_anonymous());
    }
}
