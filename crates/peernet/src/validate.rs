//! Pure predicates over untrusted wire values. Every function here raises
//! `PeerError::RequestCorrupted` rather than panicking: a violated predicate
//! always means the server misbehaved, never that our own code is wrong.

use super::*;

pub fn is_integer(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| PeerError::corrupted(format!("expected integer, got {value}")))
}

pub fn is_non_negative_integer(value: &Value) -> Result<u64> {
    let n = is_integer(value)?;
    u64::try_from(n).map_err(|_| PeerError::corrupted(format!("expected non-negative integer, got {n}")))
}

pub fn is_int_or_float(value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| PeerError::corrupted(format!("expected number, got {value}")))
}

pub fn is_non_negative_int_or_float(value: &Value) -> Result<f64> {
    let n = is_int_or_float(value)?;
    if n < 0.0 {
        return Err(PeerError::corrupted(format!("expected non-negative number, got {n}")));
    }
    Ok(n)
}

pub fn is_hex_string(s: &str) -> Result<()> {
    if s.len() % 2 != 0 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(PeerError::corrupted(format!("not a hex string: {s:?}")));
    }
    Ok(())
}

pub fn is_hash256_hex(s: &str) -> Result<()> {
    is_hex_string(s)?;
    if s.len() != 64 {
        return Err(PeerError::corrupted(format!(
            "expected 32-byte hash256 hex (64 chars), got {} chars",
            s.len()
        )));
    }
    Ok(())
}

pub fn dict_contains_field<'a>(value: &'a Value, field: &str) -> Result<&'a Value> {
    value
        .get(field)
        .ok_or_else(|| PeerError::corrupted(format!("missing required field {field:?}")))
}

pub fn list_or_tuple(value: &Value) -> Result<&Vec<Value>> {
    value
        .as_array()
        .ok_or_else(|| PeerError::corrupted(format!("expected list, got {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn integers() {
        assert_eq!(is_integer(&json!(42)).unwrap(), 42);
        assert!(is_integer(&json!("42")).is_err());
        assert!(is_integer(&json!(1.5)).is_err());
    }

    #[test]
    fn non_negative_integers() {
        assert_eq!(is_non_negative_integer(&json!(7)).unwrap(), 7);
        assert!(is_non_negative_integer(&json!(-1)).is_err());
    }

    #[test]
    fn hex_strings() {
        assert!(is_hex_string("abcd").is_ok());
        assert!(is_hex_string("abc").is_err());
        assert!(is_hex_string("zzzz").is_err());
    }

    #[test]
    fn hash256_hex_requires_64_chars() {
        let hash = "a".repeat(64);
        assert!(is_hash256_hex(&hash).is_ok());
        assert!(is_hash256_hex("abcd").is_err());
    }

    #[test]
    fn dict_field_missing() {
        let v = json!({"a": 1});
        assert!(dict_contains_field(&v, "a").is_ok());
        assert!(dict_contains_field(&v, "b").is_err());
    }

    #[test]
    fn list_or_tuple_rejects_objects() {
        assert!(list_or_tuple(&json!([1, 2])).is_ok());
        assert!(list_or_tuple(&json!({"a": 1})).is_err());
    }
}
