//! Lua scripts for atomic multi-step state operations.
//!
//! Versioned records are hashes with `data` and `version` fields so the
//! compare step never parses the payload. Lock scripts follow the
//! SET NX PX + owner-token pattern: only the holder of the token may
//! release or extend.

/// KEYS[1] = record key, ARGV[1] = data, ARGV[2] = version, ARGV[3] = ttl ms.
/// Returns 1 if written, 0 if a live record already exists.
pub const PUT_NEW: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
  return 0
end
redis.call('HSET', KEYS[1], 'data', ARGV[1], 'version', ARGV[2])
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return 1
"#;

/// KEYS[1] = record key, ARGV[1] = expected version, ARGV[2] = data,
/// ARGV[3] = ttl ms.
/// Returns {-1, 0} if missing, {0, actual} on version mismatch,
/// {1, new_version} on success.
pub const COMPARE_AND_SWAP: &str = r#"
local current = redis.call('HGET', KEYS[1], 'version')
if not current then
  return {-1, 0}
end
if tonumber(current) ~= tonumber(ARGV[1]) then
  return {0, tonumber(current)}
end
local next_version = tonumber(ARGV[1]) + 1
redis.call('HSET', KEYS[1], 'data', ARGV[2], 'version', next_version)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return {1, next_version}
"#;

/// KEYS[1] = lock key, ARGV[1] = owner token, ARGV[2] = ttl ms.
/// Returns 1 if acquired, 0 if held by someone else.
pub const LOCK_ACQUIRE: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX', 'PX', ARGV[2]) then
  return 1
end
return 0
"#;

/// KEYS[1] = lock key, ARGV[1] = owner token.
/// Returns 1 if released, 0 if not held by this owner.
pub const LOCK_RELEASE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// KEYS[1] = lock key, ARGV[1] = owner token, ARGV[2] = ttl ms.
/// Returns 1 if extended, 0 if not held by this owner.
pub const LOCK_EXTEND: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;
