use serde::Deserialize;

/// First frame of every connection: `{"hello": "<token>"}`.
#[derive(Debug, Deserialize)]
pub struct Hello {
    pub hello: String,
}

/// Validate the hello frame against the shared service token. The
/// comparison does not short-circuit on the first differing byte.
pub fn check_hello(line: &str, token: &str) -> bool {
    match serde_json::from_str::<Hello>(line) {
        Ok(h) => constant_time_eq(h.hello.as_bytes(), token.as_bytes()),
        Err(_) => false,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_matching_token() {
        assert!(check_hello(r#"{"hello":"sekrit"}"#, "sekrit"));
    }

    #[test]
    fn rejects_wrong_token() {
        assert!(!check_hello(r#"{"hello":"guess"}"#, "sekrit"));
        assert!(!check_hello(r#"{"hello":"sekri"}"#, "sekrit"));
    }

    #[test]
    fn rejects_malformed_hello() {
        assert!(!check_hello("not json", "sekrit"));
        assert!(!check_hello(r#"{"op":"book"}"#, "sekrit"));
        assert!(!check_hello("", "sekrit"));
    }
}
