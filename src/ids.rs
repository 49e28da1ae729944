//! Identifier generation and validation
//!
//! Ids end up inside file names, so anything addressed by id is validated
//! before a path is built from it.

use crate::error::{Error, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use std::sync::OnceLock;

/// Length of the random part of generated ids
pub const TOKEN_LEN: usize = 8;

fn id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_-]{0,63}$").expect("id pattern is a valid regex")
    })
}

/// Short random lowercase token
pub fn token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

/// New memory id (bare token)
pub fn memory_id() -> String {
    token()
}

/// New task id
pub fn task_id() -> String {
    format!("task-{}", token())
}

/// New inbox message id
pub fn message_id() -> String {
    format!("msg-{}", token())
}

/// New instance id
pub fn instance_id() -> String {
    format!("inst-{}", token())
}

/// Whether `id` is safe to embed in a file name
pub fn is_valid(id: &str) -> bool {
    id_pattern().is_match(id)
}

/// Reject ids that could escape their directory or break file-name parsing.
pub fn validate(id: &str) -> Result<()> {
    if is_valid(id) {
        Ok(())
    } else {
        Err(Error::InvalidId(id.to_string()))
    }
}
