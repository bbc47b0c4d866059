/// Returns the part of `key` that is hashed for routing.
///
/// A key containing `{tag}` with a non-empty tag routes by the tag alone, so
/// `{user:1}:profile` and `{user:1}:sessions` land on the same shard.
pub fn key(key: &str) -> &str {
    if let Some(start) = key.find('{') {
        let rest = &key[start + 1..];
        if let Some(end) = rest.find('}') {
            if end > 0 {
                return &rest[..end];
            }
        }
    }
    key
}
