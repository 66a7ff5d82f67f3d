//! Lua sources, one per multi-step store operation. Redis runs each script without
//! interleaving other commands, which is what makes every operation atomic across processes.

use redis::Script;

pub(crate) const TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local cost = tonumber(ARGV[2])
local now = tonumber(ARGV[3])
local ttl = tonumber(ARGV[4])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  tokens = capacity
  last = now
end
local elapsed = math.max(0, now - last) / 1000
tokens = math.min(capacity, math.max(0, tokens + elapsed / 60 * capacity))
local allowed = 0
if tokens >= cost then
  tokens = tokens - cost
  allowed = 1
end
redis.call('HSET', KEYS[1], 'tokens', string.format('%.17g', tokens), 'last', string.format('%d', math.max(last, now)))
redis.call('PEXPIRE', KEYS[1], ttl)
return {allowed, string.format('%.17g', tokens)}
"#;

pub(crate) const PEEK_TOKEN_BUCKET: &str = r#"
local capacity = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local state = redis.call('HMGET', KEYS[1], 'tokens', 'last')
local tokens = tonumber(state[1])
local last = tonumber(state[2])
if tokens == nil or last == nil then
  return string.format('%.17g', capacity)
end
local elapsed = math.max(0, now - last) / 1000
tokens = math.min(capacity, math.max(0, tokens + elapsed / 60 * capacity))
return string.format('%.17g', tokens)
"#;

pub(crate) const SLIDING_WINDOW: &str = r#"
local limit = tonumber(ARGV[1])
local burst = tonumber(ARGV[2])
local window = tonumber(ARGV[3])
local burst_window = tonumber(ARGV[4])
local now = tonumber(ARGV[5])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', string.format('%d', now - window))
local count = redis.call('ZCARD', KEYS[1])
local burst_count = redis.call('ZCOUNT', KEYS[1], string.format('(%d', now - burst_window), '+inf')
local allowed = 0
if count < limit and burst_count < burst then
  redis.call('ZADD', KEYS[1], string.format('%d', now), ARGV[6])
  count = count + 1
  burst_count = burst_count + 1
  allowed = 1
end
redis.call('PEXPIRE', KEYS[1], window)
local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
return {allowed, count, burst_count, oldest[2] or ''}
"#;

pub(crate) const INCR: &str = r#"
local value = redis.call('INCR', KEYS[1])
if value == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return value
"#;

pub(crate) const COUNT_EVENTS: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local record = ARGV[3] == '1'
if not record and redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', string.format('%d', now - window))
if record then
  redis.call('ZADD', KEYS[1], string.format('%d', now), ARGV[4])
  redis.call('PEXPIRE', KEYS[1], window)
end
return redis.call('ZCARD', KEYS[1])
"#;

pub(crate) const PUSH_RECENT: &str = r#"
redis.call('RPUSH', KEYS[1], ARGV[1])
redis.call('LTRIM', KEYS[1], -tonumber(ARGV[2]), -1)
redis.call('PEXPIRE', KEYS[1], ARGV[3])
return redis.call('LRANGE', KEYS[1], 0, -1)
"#;

pub(crate) const STAT_ADD: &str = r#"
local value = tonumber(ARGV[1])
redis.call('HINCRBY', KEYS[1], 'count', 1)
redis.call('HINCRBYFLOAT', KEYS[1], 'sum', ARGV[1])
redis.call('HINCRBYFLOAT', KEYS[1], 'sum_of_squares', string.format('%.17g', value * value))
redis.call('PEXPIRE', KEYS[1], ARGV[2])
return 1
"#;

// Queue layout, all sharing one hash tag:
//   KEYS[1] pending   zset  member -> score
//   KEYS[2] due       hash  member -> not_before_ms
//   KEYS[3] inflight  hash  member -> "score|not_before_ms"
//   KEYS[4] leases    zset  member -> lease_until_ms
// Scripts that touch the queue registry take it as KEYS[5].

// ARGV[6] is the occupancy limit, negative for none. Replies {1, position} or {0, occupancy}.
pub(crate) const QUEUE_PUSH: &str = r#"
local limit = tonumber(ARGV[6])
if limit >= 0 then
  local occupancy = redis.call('ZCARD', KEYS[1]) + redis.call('HLEN', KEYS[3])
  if occupancy >= limit then
    return {0, occupancy}
  end
end
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[2], ARGV[1], ARGV[3])
for i = 1, 4 do
  redis.call('PEXPIRE', KEYS[i], ARGV[4])
end
redis.call('SADD', KEYS[5], ARGV[5])
return {1, redis.call('ZRANK', KEYS[1], ARGV[1]) + 1}
"#;

pub(crate) const QUEUE_PRUNE: &str = r#"
if redis.call('ZCARD', KEYS[1]) + redis.call('HLEN', KEYS[3]) > 0 then
  return 1
end
redis.call('SREM', KEYS[5], ARGV[1])
return 0
"#;

pub(crate) const QUEUE_LEN: &str = r#"
return redis.call('ZCARD', KEYS[1]) + redis.call('HLEN', KEYS[3])
"#;

pub(crate) const QUEUE_CLAIM: &str = r#"
local max = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local lease = tonumber(ARGV[3])
local pending = redis.call('ZRANGE', KEYS[1], 0, -1, 'WITHSCORES')
local claimed = {}
local taken = 0
for i = 1, #pending, 2 do
  if taken >= max then
    break
  end
  local member = pending[i]
  local score = pending[i + 1]
  local not_before = redis.call('HGET', KEYS[2], member) or '0'
  if tonumber(not_before) <= now then
    redis.call('ZREM', KEYS[1], member)
    redis.call('HDEL', KEYS[2], member)
    redis.call('HSET', KEYS[3], member, score .. '|' .. not_before)
    redis.call('ZADD', KEYS[4], string.format('%d', now + lease), member)
    claimed[#claimed + 1] = member
    claimed[#claimed + 1] = score
    taken = taken + 1
  end
end
return claimed
"#;

pub(crate) const QUEUE_ACK: &str = r#"
redis.call('ZREM', KEYS[4], ARGV[1])
return redis.call('HDEL', KEYS[3], ARGV[1])
"#;

pub(crate) const QUEUE_REMOVE: &str = r#"
redis.call('HDEL', KEYS[2], ARGV[1])
return redis.call('ZREM', KEYS[1], ARGV[1])
"#;

pub(crate) const QUEUE_RECOVER: &str = r#"
local stale = redis.call('ZRANGEBYSCORE', KEYS[4], '-inf', string.format('(%d', tonumber(ARGV[1])))
for _, member in ipairs(stale) do
  local held = redis.call('HGET', KEYS[3], member)
  redis.call('HDEL', KEYS[3], member)
  redis.call('ZREM', KEYS[4], member)
  if held then
    local sep = string.find(held, '|', 1, true)
    redis.call('ZADD', KEYS[1], string.sub(held, 1, sep - 1), member)
    redis.call('HSET', KEYS[2], member, string.sub(held, sep + 1))
  end
end
return #stale
"#;

/// Compiled scripts; each is sent by SHA and loaded on first miss.
pub(crate) struct Scripts {
    pub token_bucket: Script,
    pub peek_token_bucket: Script,
    pub sliding_window: Script,
    pub incr: Script,
    pub count_events: Script,
    pub push_recent: Script,
    pub stat_add: Script,
    pub queue_push: Script,
    pub queue_prune: Script,
    pub queue_len: Script,
    pub queue_claim: Script,
    pub queue_ack: Script,
    pub queue_remove: Script,
    pub queue_recover: Script,
}

impl Scripts {
    pub(crate) fn new() -> Self {
        Self {
            token_bucket: Script::new(TOKEN_BUCKET),
            peek_token_bucket: Script::new(PEEK_TOKEN_BUCKET),
            sliding_window: Script::new(SLIDING_WINDOW),
            incr: Script::new(INCR),
            count_events: Script::new(COUNT_EVENTS),
            push_recent: Script::new(PUSH_RECENT),
            stat_add: Script::new(STAT_ADD),
            queue_push: Script::new(QUEUE_PUSH),
            queue_prune: Script::new(QUEUE_PRUNE),
            queue_len: Script::new(QUEUE_LEN),
            queue_claim: Script::new(QUEUE_CLAIM),
            queue_ack: Script::new(QUEUE_ACK),
            queue_remove: Script::new(QUEUE_REMOVE),
            queue_recover: Script::new(QUEUE_RECOVER),
        }
    }
}
