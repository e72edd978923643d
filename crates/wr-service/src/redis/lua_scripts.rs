//! Lua scripts for atomic queue operations.
//!
//! Redis executes a script without interleaving other commands, so a promotion
//! can never leave a user popped from the wait set but missing from the
//! proceed set.

/// Lua script moving the earliest arrivals from the wait set to the proceed set.
///
/// Arguments:
/// - KEYS[1]: Wait set (e.g., `users:queue:{name}:wait`)
/// - KEYS[2]: Proceed set (e.g., `users:queue:{name}:proceed`)
/// - ARGV[1]: Maximum number of members to move
/// - ARGV[2]: Proceed score (admission Unix timestamp)
///
/// Returns:
/// - Array of moved members, earliest arrival first (empty if none waiting)
/// - Error reply if the arguments are not numbers
pub const PROMOTE: &str = r#"
local count = tonumber(ARGV[1])
local admitted_at = tonumber(ARGV[2])

if count == nil or admitted_at == nil then
    return redis.error_reply('invalid promotion arguments')
end

if count <= 0 then
    return {}
end

-- ZPOPMIN replies with flat member/score pairs
local popped = redis.call('ZPOPMIN', KEYS[1], count)
local moved = {}

for i = 1, #popped, 2 do
    redis.call('ZADD', KEYS[2], admitted_at, popped[i])
    moved[#moved + 1] = popped[i]
end

return moved
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promote_pops_and_inserts() {
        assert!(PROMOTE.contains("redis.call('ZPOPMIN', KEYS[1], count)"));
        assert!(PROMOTE.contains("redis.call('ZADD', KEYS[2], admitted_at, popped[i])"));
    }

    #[test]
    fn test_promote_skips_scores_in_pop_reply() {
        // Members sit at odd indexes of the flat reply
        assert!(PROMOTE.contains("for i = 1, #popped, 2 do"));
    }

    #[test]
    fn test_promote_validates_arguments() {
        assert!(PROMOTE.contains("if count == nil or admitted_at == nil then"));
        assert!(PROMOTE.contains("redis.error_reply"));
    }

    #[test]
    fn test_promote_non_positive_count_is_noop() {
        assert!(PROMOTE.contains("if count <= 0 then\n    return {}"));
    }

    #[test]
    fn test_script_length() {
        assert!(PROMOTE.len() > 100);
        assert!(PROMOTE.len() < 2000);
    }
}
