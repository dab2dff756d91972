use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::types::ChatRequest;

pub fn now_epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

pub fn now_epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

pub fn now_epoch_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0)
}

/// UTC day key for the daily-usage roll-up, `YYYY-MM-DD`.
pub fn day_key(epoch_secs: u64) -> String {
    let timestamp = time::OffsetDateTime::from_unix_timestamp(epoch_secs as i64)
        .unwrap_or(time::OffsetDateTime::UNIX_EPOCH);
    let date = timestamp.date();
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}

pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn normalize_spaces(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// SHA-256 over the whitespace-normalized prompt text. Image parts contribute
/// an `[image]` marker so vision prompts with identical text still differ.
pub fn prompt_fingerprint(request: &ChatRequest) -> String {
    let mut buf = String::new();
    for message in &request.messages {
        let text = message.content_text();
        if !text.is_empty() {
            buf.push_str(&text);
            buf.push(' ');
        }
        if message
            .content
            .as_ref()
            .is_some_and(|content| content.has_image())
        {
            buf.push_str("[image] ");
        }
    }
    sha256_hex(&normalize_spaces(&buf))
}

/// Integration tests binding mock upstreams call this first; some sandboxes
/// forbid binding localhost entirely.
pub fn should_skip_httpmock() -> bool {
    match std::net::TcpListener::bind(("127.0.0.1", 0)) {
        Ok(listener) => {
            drop(listener);
            false
        }
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            eprintln!("skipping httpmock test: sandbox forbids binding to localhost");
            true
        }
        Err(_) => false,
    }
}

static REQUEST_ID_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn request_id() -> String {
    let seq = REQUEST_ID_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req_{}_{seq}", now_epoch_millis())
}
