//! Distinguished-name model.
//!
//! # Purpose
//! Parses RFC 4514 DNs against the schema registry and keeps two canonical
//! forms side by side: the original form with the user's casing and escaping
//! preserved, and a normalized form derived from each attribute's matching
//! rule. Equality, suffix tests and the structural operations (parent, move,
//! modify-RDN) are all defined on the normalized form.
use crate::registry::SchemaRegistry;
use canopy_common::{LdapError, LdapResult};
use std::collections::HashMap;

/// One attribute type and value pair inside an RDN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrTypeAndValue {
    /// Attribute type as the user wrote it.
    pub type_orig: String,
    /// Lowercased attribute type.
    pub type_norm: String,
    /// Attribute value as the user wrote it, unescaped.
    pub value_orig: String,
    /// Original value re-escaped for response encoding.
    pub value_orig_encoded: String,
    /// Value normalized per the attribute's matching rule.
    pub value_norm: String,
}

/// A relative DN: one or more AVAs joined by `+`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelativeDn {
    pub attrs: Vec<AttrTypeAndValue>,
}

impl RelativeDn {
    pub fn orig_encoded_str(&self) -> String {
        let mut out = String::with_capacity(64);
        for (i, attr) in self.attrs.iter().enumerate() {
            if i > 0 {
                out.push('+');
            }
            out.push_str(&attr.type_orig);
            out.push('=');
            out.push_str(&attr.value_orig_encoded);
        }
        out
    }

    pub fn norm_str(&self) -> String {
        let mut out = String::with_capacity(64);
        for (i, attr) in self.attrs.iter().enumerate() {
            if i > 0 {
                out.push('+');
            }
            out.push_str(&attr.type_norm);
            out.push('=');
            out.push_str(&attr.value_norm);
        }
        out
    }
}

/// Original and normalized form of a single RDN value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormString {
    pub orig: String,
    pub norm: String,
}

/// A distinguished name: RDNs ordered leaf first, root last. The empty RDN
/// list is the anonymous DN.
#[derive(Debug, Clone)]
pub struct Dn {
    rdns: Vec<RelativeDn>,
}

impl PartialEq for Dn {
    fn eq(&self, other: &Self) -> bool {
        self.rdns.len() == other.rdns.len() && self.dn_norm_str() == other.dn_norm_str()
    }
}

impl Eq for Dn {}

impl Dn {
    pub fn anonymous() -> Self {
        Dn { rdns: Vec::new() }
    }

    pub(crate) fn from_rdns(rdns: Vec<RelativeDn>) -> Self {
        Dn { rdns }
    }

    /// Parse a DN string against the registry, per RFC 4514.
    ///
    /// Every value is normalized through its attribute type's matching rule;
    /// an unknown attribute type, a malformed escape or an unterminated
    /// token fails with `InvalidDnSyntax`.
    pub fn parse(registry: &SchemaRegistry, s: &str) -> LdapResult<Dn> {
        let bytes = s.as_bytes();
        let mut rdns: Vec<RelativeDn> = Vec::new();
        let mut attrs: Vec<AttrTypeAndValue> = Vec::new();
        let mut buffer: Vec<u8> = Vec::new();
        let mut type_orig = String::new();
        let mut type_norm = String::new();
        let mut escaping = false;
        // Unescaped trailing spaces are tracked so they can be dropped when
        // the token ends; escaped spaces reset the counter and survive.
        let mut trailing_spaces = 0usize;

        fn take_token(buffer: &mut Vec<u8>, trailing_spaces: &mut usize) -> LdapResult<String> {
            let end = buffer.len() - *trailing_spaces;
            let token = String::from_utf8(buffer[..end].to_vec())
                .map_err(|_| LdapError::InvalidDnSyntax)?;
            buffer.clear();
            *trailing_spaces = 0;
            Ok(token)
        }

        fn finish_value(
            registry: &SchemaRegistry,
            type_orig: &str,
            type_norm: &str,
            orig: String,
        ) -> LdapResult<AttrTypeAndValue> {
            let sv = registry
                .new_value(type_norm, vec![orig.clone()])
                .map_err(|err| {
                    tracing::warn!(dn_type = type_orig, error = %err, "invalid DN value");
                    LdapError::InvalidDnSyntax
                })?;
            let value_norm = sv.norm_str()[0].clone();
            Ok(AttrTypeAndValue {
                type_orig: type_orig.to_string(),
                type_norm: type_norm.to_string(),
                value_orig_encoded: encode_dn_value(&orig),
                value_orig: orig,
                value_norm,
            })
        }

        let mut i = 0;
        while i < bytes.len() {
            let ch = bytes[i];
            if escaping {
                trailing_spaces = 0;
                escaping = false;
                match ch {
                    b' ' | b'"' | b'#' | b'+' | b',' | b';' | b'<' | b'=' | b'>' | b'\\' => {
                        buffer.push(ch);
                        i += 1;
                        continue;
                    }
                    _ => {}
                }
                // Not a special character: a hex encoded octet follows.
                if i + 1 >= bytes.len() {
                    return Err(LdapError::InvalidDnSyntax);
                }
                let octet =
                    decode_hex_pair(bytes[i], bytes[i + 1]).ok_or(LdapError::InvalidDnSyntax)?;
                buffer.push(octet);
                i += 2;
                continue;
            }
            match ch {
                b'\\' => {
                    trailing_spaces = 0;
                    escaping = true;
                }
                b'=' => {
                    type_orig = take_token(&mut buffer, &mut trailing_spaces)?;
                    type_norm = type_orig.to_lowercase();
                    // A value starting with `#` carries hex encoded BER data.
                    if i + 1 < bytes.len() && bytes[i + 1] == b'#' {
                        i += 2;
                        let rest = &bytes[i..];
                        let end = rest
                            .iter()
                            .position(|b| *b == b',' || *b == b'+')
                            .unwrap_or(rest.len());
                        let data = &rest[..end];
                        let raw = decode_hex(data).ok_or(LdapError::InvalidDnSyntax)?;
                        let decoded = ber_octet_string(&raw)?;
                        buffer.extend_from_slice(decoded.as_bytes());
                        i += data.len() - 1;
                    }
                }
                b',' | b'+' => {
                    if type_orig.is_empty() {
                        // Incomplete type, value pair.
                        return Err(LdapError::InvalidDnSyntax);
                    }
                    let orig = take_token(&mut buffer, &mut trailing_spaces)?;
                    attrs.push(finish_value(registry, &type_orig, &type_norm, orig)?);
                    type_orig.clear();
                    type_norm.clear();
                    if ch == b',' {
                        rdns.push(RelativeDn {
                            attrs: std::mem::take(&mut attrs),
                        });
                    }
                }
                b' ' if buffer.is_empty() => {
                    // Unescaped leading spaces are ignored.
                }
                _ => {
                    if ch == b' ' {
                        trailing_spaces += 1;
                    } else {
                        trailing_spaces = 0;
                    }
                    buffer.push(ch);
                }
            }
            i += 1;
        }
        if escaping {
            return Err(LdapError::InvalidDnSyntax);
        }
        if !buffer.is_empty() {
            if type_orig.is_empty() {
                // DN ended with an incomplete type, value pair.
                return Err(LdapError::InvalidDnSyntax);
            }
            let orig = take_token(&mut buffer, &mut trailing_spaces)?;
            attrs.push(finish_value(registry, &type_orig, &type_norm, orig)?);
            rdns.push(RelativeDn { attrs });
        }
        Ok(Dn { rdns })
    }

    pub fn rdns(&self) -> &[RelativeDn] {
        &self.rdns
    }

    pub fn dn_norm_str(&self) -> String {
        let mut out = String::with_capacity(128);
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&rdn.norm_str());
        }
        out
    }

    pub fn dn_orig_str(&self) -> String {
        let mut out = String::with_capacity(128);
        for (i, rdn) in self.rdns.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&rdn.orig_encoded_str());
        }
        out
    }

    /// Normalized form with the configured suffix RDNs stripped.
    pub fn dn_norm_str_without_suffix(&self, suffix: &Dn) -> String {
        self.join_without_suffix(suffix, RelativeDn::norm_str)
    }

    /// Original (re-escaped) form with the configured suffix RDNs stripped.
    pub fn dn_orig_str_without_suffix(&self, suffix: &Dn) -> String {
        self.join_without_suffix(suffix, RelativeDn::orig_encoded_str)
    }

    fn join_without_suffix(&self, suffix: &Dn, render: fn(&RelativeDn) -> String) -> String {
        let keep = self.rdns.len().saturating_sub(suffix.rdns.len());
        let mut out = String::with_capacity(128);
        for (i, rdn) in self.rdns.iter().take(keep).enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&render(rdn));
        }
        out
    }

    pub fn rdn_norm_str(&self) -> String {
        match self.rdns.first() {
            Some(rdn) => rdn.norm_str(),
            None => String::new(),
        }
    }

    pub fn rdn_orig_encoded_str(&self) -> String {
        match self.rdns.first() {
            Some(rdn) => rdn.orig_encoded_str(),
            None => String::new(),
        }
    }

    /// Leaf RDN as a map from normalized type to its value forms.
    pub fn rdn(&self) -> HashMap<String, NormString> {
        let Some(first) = self.rdns.first() else {
            return HashMap::new();
        };
        let mut map = HashMap::with_capacity(first.attrs.len());
        for attr in &first.attrs {
            map.insert(
                attr.type_norm.clone(),
                NormString {
                    orig: attr.value_orig.clone(),
                    norm: attr.value_norm.clone(),
                },
            );
        }
        map
    }

    pub fn parent_dn(&self) -> Option<Dn> {
        if self.rdns.len() <= 1 {
            return None;
        }
        Some(Dn {
            rdns: self.rdns[1..].to_vec(),
        })
    }

    pub fn is_root(&self) -> bool {
        self.rdns.len() == 1
    }

    pub fn is_anonymous(&self) -> bool {
        self.rdns.is_empty()
    }

    pub fn is_suffix(&self, suffix: &Dn) -> bool {
        self == suffix
    }

    /// True iff `self` sits strictly below `other` in the tree.
    pub fn is_sub_of(&self, other: &Dn) -> bool {
        self.rdns.len() > other.rdns.len() && self.dn_norm_str().ends_with(&other.dn_norm_str())
    }

    pub fn level(&self) -> usize {
        self.rdns.len()
    }

    pub fn level_without_suffix(&self, suffix: &Dn) -> usize {
        self.rdns.len().saturating_sub(suffix.rdns.len())
    }

    /// Rewrite the leaf RDN. Returns the new DN, the displaced leaf RDN when
    /// it changed and is to be retained, and whether anything changed at all.
    pub fn modify_rdn(
        &self,
        registry: &SchemaRegistry,
        new_rdn: &str,
        delete_old: bool,
    ) -> LdapResult<(Dn, Option<RelativeDn>, bool)> {
        let parsed = Dn::parse(registry, new_rdn)?;
        let Some(new_leaf) = parsed.rdns.first() else {
            return Err(LdapError::InvalidDnSyntax);
        };
        let mut rdns = self.rdns.clone();
        let mut old_rdn = None;
        let mut changed = false;
        if let Some(leaf) = rdns.first_mut() {
            if leaf.norm_str() != new_leaf.norm_str() {
                changed = true;
                if !delete_old {
                    old_rdn = Some(leaf.clone());
                }
            }
            *leaf = new_leaf.clone();
        }
        Ok((Dn { rdns }, old_rdn, changed))
    }

    /// New DN consisting of this entry's leaf RDN under `new_parent`.
    pub fn move_to(&self, new_parent: &Dn) -> Dn {
        let mut rdns = Vec::with_capacity(new_parent.rdns.len() + 1);
        if let Some(leaf) = self.rdns.first() {
            rdns.push(leaf.clone());
        }
        rdns.extend(new_parent.rdns.iter().cloned());
        Dn { rdns }
    }
}

/// Per-request DN memoization: id to DN, id to original DN string, and
/// normalized DN string to id. Lives for one request so repeated lookups of
/// the same container are O(1) after the first.
#[derive(Debug, Default)]
pub struct DnCache {
    pub itoa: HashMap<i64, Dn>,
    pub itoao: HashMap<i64, String>,
    pub atoi: HashMap<String, i64>,
}

impl DnCache {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Escape the response form of a DN value: `" + , ; < > = \`, leading `#`,
/// and leading or trailing spaces become `\HH` hex escapes.
fn encode_dn_value(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len() + 8);
    let last = bytes.len().wrapping_sub(1);
    for (i, &ch) in bytes.iter().enumerate() {
        match ch {
            b' ' if i == 0 || i == last => out.push_str("\\20"),
            b'"' => out.push_str("\\22"),
            b'#' if i == 0 => out.push_str("\\23"),
            b'+' => out.push_str("\\2B"),
            b',' => out.push_str("\\2C"),
            b';' => out.push_str("\\3B"),
            b'<' => out.push_str("\\3C"),
            b'=' => out.push_str("\\3D"),
            b'>' => out.push_str("\\3E"),
            b'\\' => out.push_str("\\5C"),
            _ => out.push(ch as char),
        }
    }
    out
}

fn decode_hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_hex_pair(hi: u8, lo: u8) -> Option<u8> {
    Some(decode_hex_digit(hi)? << 4 | decode_hex_digit(lo)?)
}

fn decode_hex(data: &[u8]) -> Option<Vec<u8>> {
    if data.len() % 2 != 0 {
        return None;
    }
    data.chunks(2)
        .map(|pair| decode_hex_pair(pair[0], pair[1]))
        .collect()
}

/// Extract the payload of a single BER TLV (short or long definite length)
/// as a UTF-8 string.
fn ber_octet_string(raw: &[u8]) -> LdapResult<String> {
    if raw.len() < 2 {
        return Err(LdapError::InvalidDnSyntax);
    }
    let (len, start) = if raw[1] & 0x80 == 0 {
        (raw[1] as usize, 2)
    } else {
        let n = (raw[1] & 0x7f) as usize;
        if n == 0 || n > 8 || raw.len() < 2 + n {
            return Err(LdapError::InvalidDnSyntax);
        }
        let mut len = 0usize;
        for &b in &raw[2..2 + n] {
            len = len << 8 | b as usize;
        }
        (len, 2 + n)
    };
    if raw.len() < start + len {
        return Err(LdapError::InvalidDnSyntax);
    }
    String::from_utf8(raw[start..start + len].to_vec()).map_err(|_| LdapError::InvalidDnSyntax)
}
