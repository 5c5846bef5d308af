//! Object-key naming for uploaded story videos.
//!
//! Keys follow `videos/{reader}/{year-month}/{slug}-{shortid}.{ext}` so that a
//! bucket listing groups by narrator and month and stays readable to a human
//! operator. The short id keeps two same-titled stories from colliding.

use chrono::{DateTime, Utc};
use hearth_db::Reader;
use rand::Rng;

const SHORT_ID_LEN: usize = 6;
const SHORT_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Derives a fresh object key for a new upload. Every call yields a distinct
/// key even for identical inputs.
pub fn object_key(reader: Reader, title: &str, content_type: &str) -> String {
    object_key_at(reader, title, content_type, Utc::now())
}

fn object_key_at(
    reader: Reader,
    title: &str,
    content_type: &str,
    now: DateTime<Utc>,
) -> String {
    format!(
        "videos/{}/{}/{}-{}.{}",
        reader.as_str(),
        now.format("%Y-%m"),
        slugify(title),
        short_id(),
        extension_for(content_type),
    )
}

/// Lowercases the title, maps whitespace runs to single hyphens and drops
/// everything outside `[a-z0-9-]`. A title with no usable characters slugs
/// to `story`.
fn slugify(title: &str) -> String {
    let mut slug = String::with_capacity(title.len());
    let mut pending_hyphen = false;
    for ch in title.to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        } else if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_hyphen = true;
        }
    }

    if slug.is_empty() {
        "story".to_owned()
    } else {
        slug
    }
}

/// File extension taken from the MIME subtype, e.g. `video/webm` -> `webm`.
/// Falls back to `mp4` when the subtype carries nothing usable.
fn extension_for(content_type: &str) -> String {
    let subtype = content_type
        .split('/')
        .nth(1)
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim();

    let ext: String = subtype
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_lowercase())
        .collect();

    if ext.is_empty() {
        "mp4".to_owned()
    } else {
        ext
    }
}

fn short_id() -> String {
    let mut rng = rand::thread_rng();
    (0..SHORT_ID_LEN)
        .map(|_| SHORT_ID_CHARSET[rng.gen_range(0..SHORT_ID_CHARSET.len())] as char)
        .collect()
}
