//! Bind support: credential fetch and password-policy lookup.
//!
//! Bind reads from the cache only. Credential verification itself belongs
//! to the caller; the repository hands it everything it needs in one
//! [`FetchedCredential`].
use super::{FetchedCredential, Repository};
use canopy_common::{LdapError, LdapResult};
use canopy_schema::{Dn, DnCache, PPolicy, TIMESTAMP_FORMAT, TIMESTAMP_NANO_FORMAT};
use chrono::{DateTime, NaiveDateTime, Utc};

impl Repository {
    /// Fetch the bind entry for `dn` and run the caller's credential check
    /// against it. Resolution failures surface as `InvalidCredentials`, so
    /// an unknown DN is indistinguishable from a wrong password.
    pub async fn bind<F>(&self, dn: &Dn, callback: F) -> LdapResult<()>
    where
        F: FnOnce(&FetchedCredential) -> LdapResult<()>,
    {
        let mut dn_cache = DnCache::new();
        let id = self
            .cache()
            .find_entry_id(dn, &mut dn_cache)
            .await
            .map_err(|_| LdapError::InvalidCredentials)?;
        let entry = self
            .cache()
            .get(id)
            .await
            .ok_or(LdapError::InvalidCredentials)?;

        let pwd_account_locked_time = entry
            .attrs_orig
            .get("pwdAccountLockedTime")
            .and_then(|v| v.first())
            .map(|v| parse_generalized_time(v, TIMESTAMP_FORMAT))
            .transpose()
            .map_err(|err| {
                tracing::error!(dn_orig = %dn.dn_orig_str(), error = %err,
                    "failed to parse pwdAccountLockedTime");
                LdapError::OperationsError
            })?;

        let failure_times = entry
            .attrs_orig
            .get("pwdFailureTime")
            .map(Vec::as_slice)
            .unwrap_or_default();
        let mut last_pwd_failure_time: Option<DateTime<Utc>> = None;
        for value in failure_times {
            let t = parse_generalized_time(value, TIMESTAMP_NANO_FORMAT).map_err(|err| {
                tracing::error!(dn_orig = %dn.dn_orig_str(), error = %err,
                    "failed to parse pwdFailureTime");
                LdapError::OperationsError
            })?;
            if last_pwd_failure_time.map(|last| t > last).unwrap_or(true) {
                last_pwd_failure_time = Some(t);
            }
        }

        let ppolicy = self.find_ppolicy_by_dn(dn).await?;

        let mut member_of = Vec::new();
        for target in entry.norm_ints("memberOf") {
            match self.cache().to_dn(target, &mut dn_cache).await {
                Ok(dn) => member_of.push(dn),
                Err(LdapError::NoSuchObject) => {
                    tracing::warn!(id = target, "memberOf target vanished, dropped");
                }
                Err(err) => return Err(err),
            }
        }

        let fetched = FetchedCredential {
            id,
            credential: entry
                .attrs_orig
                .get("userPassword")
                .cloned()
                .unwrap_or_default(),
            member_of,
            ppolicy,
            pwd_account_locked_time,
            last_pwd_failure_time,
            pwd_failure_count: failure_times.len(),
        };

        let result = callback(&fetched);
        let Err(err) = result else {
            // Successful bind. Recording authTimestamp and clearing the
            // failure attributes is an extension point of this operation;
            // the durable store is not touched here.
            return Ok(());
        };

        if !err.is_invalid_credentials() {
            return Err(err);
        }
        if err.is_account_locked() {
            tracing::info!(dn_norm = %dn.dn_norm_str(), "account is locked");
            return Err(err);
        }
        if fetched.ppolicy.is_lockout_enabled() {
            // Extension point: recording pwdFailureTime and setting
            // pwdAccountLockedTime on lockout happens here once failure
            // accounting is wired to the durable store.
            tracing::debug!(dn_norm = %dn.dn_norm_str(),
                failure_count = fetched.pwd_failure_count,
                "bind failure with lockout enabled");
        } else {
            tracing::debug!(dn_norm = %dn.dn_norm_str(),
                "lockout is disabled, not recording the failure");
        }
        Err(err)
    }

    /// The password policy applying to `dn`: the configured default policy
    /// entry, or the zero-valued default when none is configured or the
    /// entry is missing.
    pub async fn find_ppolicy_by_dn(&self, dn: &Dn) -> LdapResult<PPolicy> {
        if self.schema().default_ppolicy_dn.is_anonymous() {
            return Ok(PPolicy::default());
        }
        let mut dn_cache = DnCache::new();
        let ppolicy_dn = self.schema().default_ppolicy_dn.clone();
        let id = match self.cache().find_entry_id(&ppolicy_dn, &mut dn_cache).await {
            Ok(id) => id,
            Err(LdapError::NoSuchObject) => return Ok(PPolicy::default()),
            Err(err) => {
                tracing::error!(dn_norm = %dn.dn_norm_str(), error = %err,
                    "failed to fetch the password policy");
                return Err(err);
            }
        };
        let Some(entry) = self.cache().get(id).await else {
            return Ok(PPolicy::default());
        };

        let values = |name: &str| {
            entry
                .attrs_orig
                .get(name)
                .cloned()
                .unwrap_or_default()
        };
        Ok(PPolicy {
            pwd_attribute: values("pwdAttribute"),
            pwd_lockout: values("pwdLockout"),
            pwd_lockout_duration: values("pwdLockoutDuration"),
            pwd_max_failure: values("pwdMaxFailure"),
        })
    }
}

fn parse_generalized_time(value: &str, format: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(value, format).map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generalized_time_parses_both_resolutions() {
        let t = parse_generalized_time("20240102030405Z", TIMESTAMP_FORMAT).expect("seconds");
        assert_eq!(t.timestamp(), 1704164645);

        let t = parse_generalized_time("20240102030405.123456Z", TIMESTAMP_NANO_FORMAT)
            .expect("nanos");
        assert_eq!(t.timestamp_subsec_micros(), 123456);

        assert!(parse_generalized_time("not-a-time", TIMESTAMP_FORMAT).is_err());
    }
}
