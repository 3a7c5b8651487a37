//! Shared LDAP result taxonomy.
//!
//! # Purpose
//! Every repository operation returns either success or one of the
//! conditions below. User-facing variants carry the numeric LDAP result
//! code they map to on the wire; `Retry` is internal-only and is consumed
//! by the facade's retry loop before it can reach a client.
use thiserror::Error;

pub type LdapResult<T> = Result<T, LdapError>;

/// LDAP result conditions raised by the repository and schema layers.
///
/// Diagnostics follow the `additional info` strings OpenLDAP emits for the
/// same conditions, so client-side tooling that pattern-matches on them
/// keeps working.
#[derive(Debug, Error)]
pub enum LdapError {
    #[error("No such object")]
    NoSuchObject,

    #[error("Already exists")]
    AlreadyExists,

    #[error("invalid DN")]
    InvalidDnSyntax,

    #[error("{attr}: value #{index} invalid per syntax")]
    InvalidPerSyntax { attr: String, index: usize },

    #[error("{attr}: value #{index} provided more than once")]
    MoreThanOnce { attr: String, index: usize },

    #[error("{attr}: attribute type undefined")]
    UndefinedType { attr: String },

    #[error("no objectClass attribute")]
    ObjectClassViolation,

    #[error("no structural object class provided")]
    ObjectClassViolationNoStructural,

    #[error("object class '{class}' requires attribute '{attr}'")]
    ObjectClassViolationRequiresAttribute { class: String, attr: String },

    #[error("attribute '{attr}' not allowed")]
    ObjectClassViolationNotAllowed { attr: String },

    #[error("invalid structural object class chain ({first}/{second})")]
    ObjectClassViolationInvalidStructuralChain { first: String, second: String },

    #[error("structural object class modification from '{from}' to '{to}' not allowed")]
    ObjectClassModsProhibited { from: String, to: String },

    #[error("{attr}: multiple values provided")]
    MultipleValuesProvided { attr: String },

    #[error("attribute '{attr}' cannot have multiple values")]
    MultipleValuesConstraintViolation { attr: String },

    #[error("{op}: {attr}: no user modification allowed")]
    NoUserModificationAllowedConstraintViolation { op: String, attr: String },

    #[error("{op}: {attr}: value #{index} already exists")]
    TypeOrValueExists { op: String, attr: String, index: usize },

    #[error("{op}: {attr}: no such attribute")]
    NoSuchAttribute { op: String, attr: String },

    #[error("naming attribute '{attr}' is not present in entry")]
    NamingViolation { attr: String },

    #[error("value of naming attribute '{attr}' is not present in entry")]
    NamingViolationForValue { attr: String },

    #[error("Not allowed on non-leaf")]
    NotAllowedOnNonLeaf,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Account locked")]
    AccountLocked,

    #[error("Account locking")]
    AccountLocking,

    #[error("Insufficient access")]
    InsufficientAccess,

    #[error("Unwilling to perform")]
    UnwillingToPerform,

    #[error("Operations error")]
    OperationsError,

    #[error("Unavailable")]
    Unavailable(#[source] anyhow::Error),

    /// Transient condition (optimistic-version mismatch, deadlock, racing
    /// foreign key). Retried by the facade up to its bound, never surfaced
    /// to clients as-is.
    #[error("retryable: {0}")]
    Retry(#[source] anyhow::Error),
}

impl LdapError {
    pub fn retry(err: impl Into<anyhow::Error>) -> Self {
        LdapError::Retry(err.into())
    }

    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        LdapError::Unavailable(err.into())
    }

    /// Numeric result code per RFC 4511 appendix A. `Retry` has no wire
    /// representation; it maps to `operationsError` if it ever escapes the
    /// retry loop.
    pub fn result_code(&self) -> u16 {
        use LdapError::*;
        match self {
            NoSuchObject => 32,
            AlreadyExists => 68,
            InvalidDnSyntax => 34,
            InvalidPerSyntax { .. } => 21,
            MoreThanOnce { .. } | TypeOrValueExists { .. } => 20,
            UndefinedType { .. } => 17,
            ObjectClassViolation
            | ObjectClassViolationNoStructural
            | ObjectClassViolationRequiresAttribute { .. }
            | ObjectClassViolationNotAllowed { .. }
            | ObjectClassViolationInvalidStructuralChain { .. } => 65,
            ObjectClassModsProhibited { .. } => 69,
            MultipleValuesProvided { .. }
            | MultipleValuesConstraintViolation { .. }
            | NoUserModificationAllowedConstraintViolation { .. }
            | AccountLocking => 19,
            NoSuchAttribute { .. } => 16,
            NamingViolation { .. } | NamingViolationForValue { .. } => 64,
            NotAllowedOnNonLeaf => 66,
            InvalidCredentials | AccountLocked => 49,
            InsufficientAccess => 50,
            UnwillingToPerform => 53,
            Unavailable(_) => 52,
            OperationsError | Retry(_) => 1,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, LdapError::Retry(_))
    }

    pub fn is_no_such_object(&self) -> bool {
        matches!(self, LdapError::NoSuchObject)
    }

    pub fn is_invalid_credentials(&self) -> bool {
        matches!(
            self,
            LdapError::InvalidCredentials | LdapError::AccountLocked | LdapError::AccountLocking
        )
    }

    pub fn is_account_locked(&self) -> bool {
        matches!(self, LdapError::AccountLocked)
    }

    pub fn is_account_locking(&self) -> bool {
        matches!(self, LdapError::AccountLocking)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_match_rfc4511() {
        assert_eq!(LdapError::NoSuchObject.result_code(), 32);
        assert_eq!(LdapError::AlreadyExists.result_code(), 68);
        assert_eq!(LdapError::InvalidDnSyntax.result_code(), 34);
        assert_eq!(
            LdapError::InvalidPerSyntax {
                attr: "objectClass".to_string(),
                index: 0
            }
            .result_code(),
            21
        );
        assert_eq!(LdapError::ObjectClassViolation.result_code(), 65);
        assert_eq!(
            LdapError::ObjectClassModsProhibited {
                from: "inetOrgPerson".to_string(),
                to: "person".to_string()
            }
            .result_code(),
            69
        );
        assert_eq!(LdapError::NotAllowedOnNonLeaf.result_code(), 66);
        assert_eq!(LdapError::InvalidCredentials.result_code(), 49);
        assert_eq!(LdapError::UnwillingToPerform.result_code(), 53);
    }

    #[test]
    fn retry_is_the_only_retryable_condition() {
        assert!(LdapError::retry(anyhow::anyhow!("deadlock")).is_retryable());
        assert!(!LdapError::NoSuchObject.is_retryable());
        assert!(!LdapError::unavailable(anyhow::anyhow!("down")).is_retryable());
    }

    #[test]
    fn diagnostics_follow_openldap_strings() {
        let err = LdapError::ObjectClassViolationRequiresAttribute {
            class: "inetOrgPerson".to_string(),
            attr: "sn".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "object class 'inetOrgPerson' requires attribute 'sn'"
        );

        let err = LdapError::InvalidPerSyntax {
            attr: "objectClass".to_string(),
            index: 1,
        };
        assert_eq!(err.to_string(), "objectClass: value #1 invalid per syntax");
    }

    #[test]
    fn bind_side_classification() {
        assert!(LdapError::InvalidCredentials.is_invalid_credentials());
        assert!(LdapError::AccountLocked.is_invalid_credentials());
        assert!(LdapError::AccountLocked.is_account_locked());
        assert!(!LdapError::AccountLocked.is_account_locking());
        assert!(!LdapError::NoSuchObject.is_invalid_credentials());
    }
}
