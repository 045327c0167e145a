//! Store key and channel naming.
//!
//! All records and channels live under a deployment prefix:
//!
//! | Purpose | Name |
//! |---------|------|
//! | Authoritative key set | `<prefix>:key-provider:connector-keys` |
//! | Rotation broadcasts | `<prefix>:key-provider:listening-channel` |
//! | Cached value / its broadcast channel | `<prefix>:cluster-cache:<title>:<item>` |
//! | Computation lock | `<prefix>:cluster-cache:update-data:<title>` |
//! | Key-provider request replies | `<prefix>:key-provider:reply:<request>` |
//!
//! The key provider takes its rotation lock from the computation-lock family
//! under the title `key-provider`.

/// Title under which the key provider takes its rotation lock.
pub const KEY_PROVIDER_TITLE: &str = "key-provider";

/// Builds namespaced store keys and channel names for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    /// Creates a namespace rooted at `prefix`. A trailing `:` is trimmed.
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with(':') {
            prefix.pop();
        }
        Self { prefix }
    }

    /// The deployment prefix.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Pattern matching every channel under this prefix.
    #[must_use]
    pub fn channel_pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }

    /// Store key of the authoritative key set.
    #[must_use]
    pub fn key_set(&self) -> String {
        format!("{}:key-provider:connector-keys", self.prefix)
    }

    /// Channel carrying key rotation broadcasts.
    #[must_use]
    pub fn rotation_channel(&self) -> String {
        format!("{}:key-provider:listening-channel", self.prefix)
    }

    /// Reply channel for one key-provider request (job progress, active key
    /// reports).
    #[must_use]
    pub fn key_provider_reply(&self, request_id: &str) -> String {
        format!("{}:key-provider:reply:{request_id}", self.prefix)
    }

    /// Lock key guarding key rotation.
    ///
    /// Equal to [`cache_lock`](Self::cache_lock) of [`KEY_PROVIDER_TITLE`]; a
    /// cache with that title would contend with rotation, so cache
    /// configuration rejects it.
    #[must_use]
    pub fn rotation_lock(&self) -> String {
        self.cache_lock(KEY_PROVIDER_TITLE)
    }

    /// Store key (and broadcast channel) of one cached item.
    #[must_use]
    pub fn cache_item(&self, title: &str, item: &str) -> String {
        format!("{}:cluster-cache:{title}:{item}", self.prefix)
    }

    /// Lock key serializing computations for a whole cache.
    #[must_use]
    pub fn cache_lock(&self, title: &str) -> String {
        format!("{}:cluster-cache:update-data:{title}", self.prefix)
    }

    /// Lock key serializing computations for a single item.
    #[must_use]
    pub fn cache_item_lock(&self, title: &str, item: &str) -> String {
        format!("{}:cluster-cache:update-data:{title}:{item}", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_provider_names() {
        let ns = Namespace::new("oidc");
        assert_eq!(ns.key_set(), "oidc:key-provider:connector-keys");
        assert_eq!(ns.rotation_channel(), "oidc:key-provider:listening-channel");
        assert_eq!(ns.rotation_lock(), "oidc:cluster-cache:update-data:key-provider");
        assert_eq!(ns.key_provider_reply("job-1"), "oidc:key-provider:reply:job-1");
    }

    #[test]
    fn test_cache_names() {
        let ns = Namespace::new("oidc:");
        assert_eq!(ns.cache_item("refresh", "abc"), "oidc:cluster-cache:refresh:abc");
        assert_eq!(ns.cache_lock("refresh"), "oidc:cluster-cache:update-data:refresh");
        assert_eq!(
            ns.cache_item_lock("refresh", "abc"),
            "oidc:cluster-cache:update-data:refresh:abc"
        );
        assert_eq!(ns.channel_pattern(), "oidc:*");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn derived_names_stay_under_prefix(
                prefix in "[a-z][a-z0-9-]{0,12}:{0,2}",
                title in "[a-z-]{1,12}",
                item in "[A-Za-z0-9:_-]{0,24}",
            ) {
                let ns = Namespace::new(prefix);
                let root = format!("{}:", ns.prefix());
                for name in [
                    ns.key_set(),
                    ns.rotation_channel(),
                    ns.rotation_lock(),
                    ns.key_provider_reply(&item),
                    ns.cache_item(&title, &item),
                    ns.cache_lock(&title),
                    ns.cache_item_lock(&title, &item),
                ] {
                    prop_assert!(name.starts_with(&root), "{name} escapes {root}");
                    let doubled = format!("{}:", root);
                    prop_assert!(!name.starts_with(&doubled));
                }
            }
        }
    }
}
