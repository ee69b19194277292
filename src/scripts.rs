//! Lua scripts executed atomically by Redis.
//!
//! Every shared-state mutation is a single script execution: the store
//! applies it in one step and no other caller observes a partial state.
//! All keys are derived inside the script from the namespace argument, and
//! all accounting time comes from the server's `TIME` so every process
//! shares one clock. The bucket layout mirrors [`crate::window`].

use redis::Script;

/// Issue the next arrival ticket and register it with a liveness lease.
///
/// ARGV: namespace, lease duration (ms). Returns the ticket number.
const ENQUEUE: &str = r#"
local ns = ARGV[1]
local time = redis.call('TIME')
local now_ms = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local ticket = redis.call('INCR', ns .. ':seq')
redis.call('ZADD', ns .. ':waiters', ticket, ticket)
redis.call('HSET', ns .. ':leases', ticket, now_ms + tonumber(ARGV[2]))
return ticket
"#;

/// Head-of-queue admission: prune dead waiters ahead of the caller, then
/// check every budget dimension and charge all of them only if all fit.
///
/// ARGV: namespace, ticket, lease duration (ms), record id ('' for none),
/// record ttl (s), reserved output tokens, dimension count, then per
/// dimension: tag, ceiling, cost.
///
/// Replies: {'OK'} admitted; {'WAIT_TURN'} an earlier live ticket is still
/// waiting; {'WAIT_CAPACITY', tag} head of queue but the window is full on
/// that dimension; {'EXPIRED'} the caller's own lease lapsed and its ticket
/// was pruned.
const TRY_ADMIT: &str = r#"
local ns = ARGV[1]
local ticket = ARGV[2]
local waiters = ns .. ':waiters'
local leases = ns .. ':leases'
local time = redis.call('TIME')
local now = tonumber(time[1])
local now_ms = now * 1000 + math.floor(tonumber(time[2]) / 1000)

if redis.call('ZSCORE', waiters, ticket) == false then
  return {'EXPIRED'}
end

while true do
  local head = redis.call('ZRANGE', waiters, 0, 0)[1]
  if not head then
    return {'EXPIRED'}
  end
  if head == ticket then
    break
  end
  local lease = tonumber(redis.call('HGET', leases, head) or '0')
  if lease >= now_ms then
    return {'WAIT_TURN'}
  end
  redis.call('ZREM', waiters, head)
  redis.call('HDEL', leases, head)
end

redis.call('HSET', leases, ticket, now_ms + tonumber(ARGV[3]))

local n = tonumber(ARGV[7])
for i = 0, n - 1 do
  local tag = ARGV[8 + i * 3]
  local ceiling = tonumber(ARGV[9 + i * 3])
  local cost = tonumber(ARGV[10 + i * 3])
  if cost > 0 then
    local used = 0
    for sec = now - 59, now do
      local v = redis.call('GET', ns .. ':' .. tag .. ':' .. sec)
      if v then
        used = used + tonumber(v)
      end
    end
    if used + cost > ceiling then
      return {'WAIT_CAPACITY', tag}
    end
  end
end

for i = 0, n - 1 do
  local tag = ARGV[8 + i * 3]
  local cost = tonumber(ARGV[10 + i * 3])
  if cost > 0 then
    local key = ns .. ':' .. tag .. ':' .. now
    redis.call('INCRBY', key, cost)
    redis.call('EXPIRE', key, 120)
  end
end

redis.call('ZREM', waiters, ticket)
redis.call('HDEL', leases, ticket)

if ARGV[4] ~= '' then
  local rec = ns .. ':rec:' .. ARGV[4]
  redis.call('HSET', rec, 'reserved', ARGV[6], 'bucket', now)
  redis.call('EXPIRE', rec, tonumber(ARGV[5]))
end

return {'OK'}
"#;

/// Remove a ticket from the queue without touching window state.
///
/// ARGV: namespace, ticket. Returns the number of tickets removed.
const WITHDRAW: &str = r#"
local ns = ARGV[1]
redis.call('HDEL', ns .. ':leases', ARGV[2])
return redis.call('ZREM', ns .. ':waiters', ARGV[2])
"#;

/// Reconcile a reservation with the actual output cost, applying the delta
/// to the bucket the reservation originally charged. The record is deleted
/// so a second adjustment finds nothing.
///
/// ARGV: namespace, record id, actual output tokens, output dimension tag.
/// Replies: {'OK', delta} or {'NOT_FOUND'}.
const ADJUST: &str = r#"
local ns = ARGV[1]
local rec = ns .. ':rec:' .. ARGV[2]
local fields = redis.call('HMGET', rec, 'reserved', 'bucket')
if fields[1] == false then
  return {'NOT_FOUND'}
end
local reserved = tonumber(fields[1])
local bucket = fields[2]
local delta = tonumber(ARGV[3]) - reserved
if delta ~= 0 then
  local key = ns .. ':' .. ARGV[4] .. ':' .. bucket
  redis.call('INCRBY', key, delta)
  redis.call('EXPIRE', key, 120)
end
redis.call('DEL', rec)
return {'OK', tostring(delta)}
"#;

/// Read-only remaining-capacity snapshot.
///
/// ARGV: namespace, dimension count, then per dimension: tag, ceiling.
/// Replies with a flat list of tag, remaining pairs.
const STATUS: &str = r#"
local ns = ARGV[1]
local time = redis.call('TIME')
local now = tonumber(time[1])
local n = tonumber(ARGV[2])
local reply = {}
for i = 0, n - 1 do
  local tag = ARGV[3 + i * 2]
  local ceiling = tonumber(ARGV[4 + i * 2])
  local used = 0
  for sec = now - 59, now do
    local v = redis.call('GET', ns .. ':' .. tag .. ':' .. sec)
    if v then
      used = used + tonumber(v)
    end
  end
  local remaining = ceiling - used
  if remaining < 0 then
    remaining = 0
  end
  reply[#reply + 1] = tag
  reply[#reply + 1] = tostring(remaining)
end
return reply
"#;

/// Compiled script handles, one set per store instance.
pub(crate) struct Scripts {
    pub enqueue: Script,
    pub try_admit: Script,
    pub withdraw: Script,
    pub adjust: Script,
    pub status: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE),
            try_admit: Script::new(TRY_ADMIT),
            withdraw: Script::new(WITHDRAW),
            adjust: Script::new(ADJUST),
            status: Script::new(STATUS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripts_have_distinct_hashes() {
        let scripts = Scripts::new();
        let hashes = [
            scripts.enqueue.get_hash().to_string(),
            scripts.try_admit.get_hash().to_string(),
            scripts.withdraw.get_hash().to_string(),
            scripts.adjust.get_hash().to_string(),
            scripts.status.get_hash().to_string(),
        ];
        for (i, a) in hashes.iter().enumerate() {
            for b in hashes.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }
}
