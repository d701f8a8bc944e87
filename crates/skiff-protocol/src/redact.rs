//! Masking of secrets and inline data URIs before text reaches a log.

pub const MASK: &str = "******";

/// Key names whose values never appear in logs.
pub const SENSITIVE_KEYS: &[&str] = &[
    "api_key",
    "aws_access_key_id",
    "aws_secret_access_key",
    "e2b_api_key",
    "github_token",
    "jwt_secret",
    "modal_api_token_id",
    "modal_api_token_secret",
    "llm_api_key",
    "sandbox_env_github_token",
];

/// True for sensitive keys in any case, including prefixed forms like
/// `LLM_API_KEY` or `SANDBOX_ENV_GITHUB_TOKEN`.
pub fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|sensitive| {
        lower == *sensitive
            || lower
                .strip_suffix(sensitive)
                .is_some_and(|prefix| prefix.ends_with('_'))
    })
}

/// Applies every redaction.
pub fn redact(text: &str) -> String {
    redact_data_uris(&redact_sensitive(text))
}

/// Replaces the value in `key=value`, `key: value`, `key='value'` and
/// `"key": "value"` forms when `key` is sensitive.
pub fn redact_sensitive(text: &str) -> String {
    let bytes = text.as_bytes();
    let mut out = String::with_capacity(text.len());
    let mut copied = 0;
    let mut i = 0;
    while i < bytes.len() {
        if !is_ident_byte(bytes[i]) || (i > 0 && is_ident_byte(bytes[i - 1])) {
            i += 1;
            continue;
        }
        let start = i;
        while i < bytes.len() && is_ident_byte(bytes[i]) {
            i += 1;
        }
        if !is_sensitive_key(&text[start..i]) {
            continue;
        }
        if let Some((value_start, value_end)) = value_span(bytes, i) {
            out.push_str(&text[copied..value_start]);
            out.push_str(MASK);
            copied = value_end;
            i = value_end;
        }
    }
    out.push_str(&text[copied..]);
    out
}

/// Replaces base64 payloads of `data:` URIs.
pub fn redact_data_uris(text: &str) -> String {
    const MARKER: &str = ";base64,";
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("data:") {
        let candidate = &rest[pos..];
        let header_len = candidate
            .find(MARKER)
            .filter(|&at| !candidate[..at].contains(char::is_whitespace));
        let Some(header_len) = header_len else {
            out.push_str(&rest[..pos + 5]);
            rest = &rest[pos + 5..];
            continue;
        };
        let payload_start = pos + header_len + MARKER.len();
        let payload_len = rest[payload_start..]
            .find(|c: char| !(c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=')))
            .unwrap_or(rest.len() - payload_start);
        out.push_str(&rest[..payload_start]);
        out.push_str("<redacted>");
        rest = &rest[payload_start + payload_len..];
    }
    out.push_str(rest);
    out
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_'
}

fn value_span(bytes: &[u8], mut i: usize) -> Option<(usize, usize)> {
    if matches!(bytes.get(i), Some(b'"' | b'\'')) {
        i += 1;
    }
    while matches!(bytes.get(i), Some(b' ')) {
        i += 1;
    }
    if !matches!(bytes.get(i), Some(b'=' | b':')) {
        return None;
    }
    i += 1;
    while matches!(bytes.get(i), Some(b' ')) {
        i += 1;
    }
    match bytes.get(i) {
        Some(&quote @ (b'"' | b'\'')) => {
            let start = i + 1;
            let end = bytes[start..].iter().position(|&b| b == quote)? + start;
            Some((start, end))
        }
        Some(_) => {
            let end = bytes[i..]
                .iter()
                .position(|b| b.is_ascii_whitespace() || matches!(b, b',' | b'}' | b')' | b']'))
                .map_or(bytes.len(), |p| p + i);
            (end > i).then_some((i, end))
        }
        None => None,
    }
}
