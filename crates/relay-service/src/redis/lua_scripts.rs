//! Lua scripts for the Redis session registry.
//!
//! Each registry operation is a single script so that the participant record
//! and both membership sets change together. Records are keyed per
//! participant, never as one serialized blob per room.
//!
//! # Key Patterns
//!
//! - `participant:{room}:{user}` - participant record (JSON, `EX ttl`)
//! - `room:{room}` - set of user IDs with a record in the room
//! - `user-rooms:{user}` - set of rooms the user has a record in
//!
//! `LIST` and `ROOMS_FOR_USER` derive record keys inside the script, so the
//! registry requires a non-cluster Redis deployment.

/// Insert or replace a participant record and refresh all TTLs.
///
/// Arguments:
/// - KEYS[1]: Participant key
/// - KEYS[2]: Room set key
/// - KEYS[3]: User rooms set key
/// - ARGV[1]: Record (JSON string)
/// - ARGV[2]: TTL in seconds
/// - ARGV[3]: User ID
/// - ARGV[4]: Room slug
///
/// Returns:
/// - 1: Always
pub const UPSERT: &str = r"
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
redis.call('SADD', KEYS[2], ARGV[3])
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[4])
redis.call('EXPIRE', KEYS[3], ARGV[2])
return 1
";

/// Merge a JSON patch into an existing record.
///
/// Arguments:
/// - KEYS[1]: Participant key
/// - KEYS[2]: Room set key
/// - KEYS[3]: User rooms set key
/// - ARGV[1]: Patch (JSON object, only present fields)
/// - ARGV[2]: TTL in seconds
///
/// Returns:
/// - The merged record (JSON string) on success
/// - nil if the record does not exist (nothing is written)
pub const UPDATE_IF_PRESENT: &str = r"
local current = redis.call('GET', KEYS[1])
if not current then
    return false
end

local record = cjson.decode(current)
local patch = cjson.decode(ARGV[1])
for field, value in pairs(patch) do
    record[field] = value
end

local merged = cjson.encode(record)
redis.call('SET', KEYS[1], merged, 'EX', ARGV[2])
redis.call('EXPIRE', KEYS[2], ARGV[2])
redis.call('EXPIRE', KEYS[3], ARGV[2])
return merged
";

/// Extend the TTL of an existing record.
///
/// Arguments:
/// - KEYS[1]: Participant key
/// - KEYS[2]: Room set key
/// - KEYS[3]: User rooms set key
/// - ARGV[1]: TTL in seconds
///
/// Returns:
/// - 1: Refreshed
/// - 0: Record does not exist
pub const REFRESH: &str = r"
if redis.call('EXPIRE', KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call('EXPIRE', KEYS[2], ARGV[1])
redis.call('EXPIRE', KEYS[3], ARGV[1])
return 1
";

/// Remove a participant and drop the room set once it is empty.
///
/// Arguments:
/// - KEYS[1]: Participant key
/// - KEYS[2]: Room set key
/// - KEYS[3]: User rooms set key
/// - ARGV[1]: User ID
/// - ARGV[2]: Room slug
///
/// Returns:
/// - 1: A record was removed
/// - 0: No record existed
pub const REMOVE: &str = r"
local existed = redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
redis.call('SREM', KEYS[3], ARGV[2])
if redis.call('SCARD', KEYS[2]) == 0 then
    redis.call('DEL', KEYS[2])
end
return existed
";

/// Read every live record of a room, pruning members whose record expired.
///
/// Arguments:
/// - KEYS[1]: Room set key
/// - ARGV[1]: Participant key prefix (`participant:{room}:`)
///
/// Returns:
/// - Array of records (JSON strings)
pub const LIST: &str = r"
local members = redis.call('SMEMBERS', KEYS[1])
local records = {}
for _, user_id in ipairs(members) do
    local record = redis.call('GET', ARGV[1] .. user_id)
    if record then
        table.insert(records, record)
    else
        redis.call('SREM', KEYS[1], user_id)
    end
end
if #records == 0 then
    redis.call('DEL', KEYS[1])
end
return records
";

/// Rooms a user has a live record in, pruning stale entries.
///
/// Arguments:
/// - KEYS[1]: User rooms set key
/// - ARGV[1]: User ID
///
/// Returns:
/// - Array of room slugs
pub const ROOMS_FOR_USER: &str = r"
local rooms = redis.call('SMEMBERS', KEYS[1])
local live = {}
for _, room in ipairs(rooms) do
    if redis.call('EXISTS', 'participant:' .. room .. ':' .. ARGV[1]) == 1 then
        table.insert(live, room)
    else
        redis.call('SREM', KEYS[1], room)
    end
end
return live
";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_never_creates_records() {
        // The early return must come before any write.
        let guard = UPDATE_IF_PRESENT.find("return false").unwrap_or(usize::MAX);
        let first_write = UPDATE_IF_PRESENT.find("'SET'").unwrap_or(0);
        assert!(guard < first_write);
    }

    #[test]
    fn test_list_uses_participant_prefix() {
        assert!(LIST.contains("ARGV[1] .. user_id"));
        assert!(ROOMS_FOR_USER.contains("'participant:' .. room .. ':'"));
    }

    #[test]
    fn test_remove_drops_empty_room() {
        assert!(REMOVE.contains("SCARD"));
        assert!(REMOVE.contains("redis.call('DEL', KEYS[2])"));
    }
}
