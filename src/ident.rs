//! Identifier derivation for generated platform resources.
//!
//! These helpers are total and pure: every resource name maps to a legal
//! identifier, and the same input always yields the same output. They are
//! injected into the template environment as filters rather than living in
//! ambient global state.

use sha2::{Digest, Sha256};

/// Maximum length of a platform resource name.
pub const PLATFORM_NAME_MAX_LEN: usize = 32;

/// Length of the resource token appended to globally unique names.
pub const RESOURCE_TOKEN_LEN: usize = 13;

const SUFFIX_LEN: usize = 8;
const EMPTY_NAME_FALLBACK: &str = "resource";

/// Maps a raw resource name to a platform-legal identifier.
///
/// The result is lowercase ASCII alphanumerics and single hyphens, starts
/// with a letter, never ends with a hyphen, and is at most
/// [`PLATFORM_NAME_MAX_LEN`] characters. Names that must be truncated carry a
/// hash suffix derived from the full raw name so truncated siblings stay
/// distinct.
#[must_use]
pub fn platform_name(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut last_dash = true;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    let trimmed = slug.trim_end_matches('-');

    let mut name = if trimmed.is_empty() {
        String::from(EMPTY_NAME_FALLBACK)
    } else if trimmed.starts_with(|ch: char| ch.is_ascii_digit()) {
        format!("r-{trimmed}")
    } else {
        trimmed.to_owned()
    };

    if name.len() > PLATFORM_NAME_MAX_LEN {
        let keep = PLATFORM_NAME_MAX_LEN - SUFFIX_LEN - 1;
        let head: String = name.chars().take(keep).collect();
        let suffix: String = hex_digest(raw).chars().take(SUFFIX_LEN).collect();
        name = format!("{}-{suffix}", head.trim_end_matches('-'));
    }
    name
}

/// Maps a raw name to an environment-variable style identifier.
///
/// ASCII letters are uppercased, every run of other characters becomes a
/// single underscore, and a leading digit is prefixed with an underscore.
#[must_use]
pub fn screaming_snake_case(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 1);
    let mut in_run = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    if out.starts_with(|ch: char| ch.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Derives the stable short token used to make generated names globally
/// unique within a deployment scope.
#[must_use]
pub fn resource_token<S: AsRef<str>>(seed: &[S]) -> String {
    let joined = seed
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join("\n");
    hex_digest(&joined)
        .chars()
        .take(RESOURCE_TOKEN_LEN)
        .collect()
}

/// Combines a platform name with the resource token into a name that is
/// unique across deployment scopes and at most `max_len` characters.
///
/// The token is always kept whole; the platform name is shortened to make
/// room. With `hyphens` unset the result is purely alphanumeric, as storage
/// account names require.
#[must_use]
pub fn scoped_name(platform: &str, token: &str, max_len: usize, hyphens: bool) -> String {
    let separator = if hyphens { "-" } else { "" };
    let base: String = platform
        .chars()
        .filter(|ch| hyphens || ch.is_ascii_alphanumeric())
        .collect();
    let room = max_len.saturating_sub(token.len() + separator.len());
    let head: String = base.chars().take(room).collect();
    let trimmed = head.trim_end_matches('-');
    if trimmed.is_empty() {
        token.to_owned()
    } else {
        format!("{trimmed}{separator}{token}")
    }
}

fn hex_digest(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}
