//! Server-side scripts for owner-checked operations.
//!
//! Each check-and-mutate runs as one Lua script so no other client can
//! interleave between reading the lock owner and acting on it.

use redis::Script;

/// Owner-checked unlock.
///
/// KEYS[1] = lock key.
/// ARGV[1] = owner token, ARGV[2] = `"1"` to delete regardless of owner.
/// Returns: 1 if a lock record was deleted, 0 otherwise.
const LUA_UNLOCK: &str = r#"
if ARGV[2] == '1' or redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Store guarded by lock ownership.
///
/// KEYS[1] = guard lock key, KEYS[2] = record key.
/// ARGV[1] = owner token, ARGV[2] = value, ARGV[3] = TTL in milliseconds
/// (or `""` for no expiry).
/// Returns: 1 if written, 0 if the caller does not own the lock.
const LUA_GUARDED_STORE: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
if ARGV[3] ~= '' then
    redis.call('SET', KEYS[2], ARGV[2], 'PX', tonumber(ARGV[3]))
else
    redis.call('SET', KEYS[2], ARGV[2])
end
return 1
"#;

/// Removal guarded by lock ownership.
///
/// KEYS[1] = guard lock key, KEYS[2] = record key.
/// ARGV[1] = owner token.
/// Returns: 1 if the caller owns the lock (the record is gone), 0 otherwise.
const LUA_GUARDED_REMOVE: &str = r#"
if redis.call('GET', KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call('DEL', KEYS[2])
return 1
"#;

/// Prepared scripts, hashed once per transport.
pub(crate) struct Scripts {
    pub(crate) unlock: Script,
    pub(crate) guarded_store: Script,
    pub(crate) guarded_remove: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            unlock: Script::new(LUA_UNLOCK),
            guarded_store: Script::new(LUA_GUARDED_STORE),
            guarded_remove: Script::new(LUA_GUARDED_REMOVE),
        }
    }
}

impl std::fmt::Debug for Scripts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scripts")
            .field("unlock", &self.unlock.get_hash())
            .field("guarded_store", &self.guarded_store.get_hash())
            .field("guarded_remove", &self.guarded_remove.get_hash())
            .finish()
    }
}

/// Encodes an optional TTL as the script's millisecond argument.
pub(crate) fn ttl_arg(ttl: Option<std::time::Duration>) -> String {
    ttl.map(|ttl| ttl.as_millis().max(1).to_string()).unwrap_or_default()
}
