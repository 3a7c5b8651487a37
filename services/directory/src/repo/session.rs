//! Simple-paged-results cookie table.
//!
//! Owned by one connection's session; not shared across connections. The
//! handler stores the next offset under a fresh opaque cookie after each
//! page and consumes it on the follow-up request.
use canopy_common::{LdapError, LdapResult};
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Default)]
pub struct SimplePagedResultsCache {
    offsets: HashMap<String, i32>,
}

impl SimplePagedResultsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the next offset and hand back the cookie for the response.
    pub fn register(&mut self, next_offset: i32) -> String {
        let cookie = Uuid::new_v4().to_string();
        self.offsets.insert(cookie.clone(), next_offset);
        cookie
    }

    /// Redeem a cookie for its offset. Cookies are single-use; an unknown
    /// one is refused.
    pub fn take(&mut self, cookie: &str) -> LdapResult<i32> {
        self.offsets
            .remove(cookie)
            .ok_or(LdapError::UnwillingToPerform)
    }

    /// Drop state for an abandoned paged search.
    pub fn clear(&mut self) {
        self.offsets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookies_are_single_use() {
        let mut cache = SimplePagedResultsCache::new();
        let cookie = cache.register(20);
        assert_eq!(cache.take(&cookie).expect("offset"), 20);
        assert!(matches!(
            cache.take(&cookie),
            Err(LdapError::UnwillingToPerform)
        ));
    }

    #[test]
    fn unknown_cookie_is_refused() {
        let mut cache = SimplePagedResultsCache::new();
        assert!(matches!(
            cache.take("bogus"),
            Err(LdapError::UnwillingToPerform)
        ));
    }

    #[test]
    fn cookies_are_unique_per_page() {
        let mut cache = SimplePagedResultsCache::new();
        let first = cache.register(10);
        let second = cache.register(20);
        assert_ne!(first, second);
        assert_eq!(cache.take(&second).expect("offset"), 20);
        assert_eq!(cache.take(&first).expect("offset"), 10);
    }
}
