//! RFC 6901 JSON Pointer parsing, used by the JSON-patch applier (§4.3).

/// Split a JSON Pointer into its reference tokens, unescaping `~1` -> `/`
/// and `~0` -> `~` per RFC 6901. The root pointer `""` yields no tokens.
pub fn split_pointer(pointer: &str) -> anyhow::Result<Vec<String>> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    anyhow::ensure!(
        pointer.starts_with('/'),
        "JSON Pointer must be empty or start with '/': {pointer:?}"
    );
    Ok(pointer[1..].split('/').map(unescape_token).collect())
}

/// Join reference tokens back into a JSON Pointer string, escaping `~` and
/// `/` per RFC 6901.
pub fn join_pointer(tokens: &[String]) -> String {
    let mut out = String::new();
    for token in tokens {
        out.push('/');
        out.push_str(&escape_token(token));
    }
    out
}

pub fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

pub fn unescape_token(token: &str) -> String {
    // Order matters: ~1 must be decoded after ~0 would be wrong if reversed,
    // since `~01` should decode to `~1`, not `/`.
    token.replace("~1", "/").replace("~0", "~")
}

/// Parse a trailing array index token. `"-"` (RFC 6902 "append" token) maps
/// to `None`, meaning "one past the end".
pub fn parse_array_index(token: &str, len: usize) -> anyhow::Result<Option<usize>> {
    if token == "-" {
        return Ok(None);
    }
    let idx: usize = token
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid array index in JSON Pointer: {token:?}"))?;
    anyhow::ensure!(
        idx <= len,
        "array index {idx} out of bounds (len {len}) in JSON Pointer"
    );
    Ok(Some(idx))
}
