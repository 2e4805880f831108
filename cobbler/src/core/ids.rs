//! Identifier rules shared by trail names and task ids.

use anyhow::{Result, anyhow};

/// Validate a trail name or task id.
///
/// Ids become branch names and directory names, so they are restricted to
/// `[A-Za-z0-9._-]`, must not start with `-` or `.`, and must not be empty.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    if id.starts_with('-') || id.starts_with('.') {
        return Err(anyhow!("id must not start with '-' or '.' (got '{id}')"));
    }
    Ok(())
}

/// Derive an id from free text (used when the agent omits task ids).
///
/// Returns `None` if the text has no usable characters.
pub fn slugify(text: &str, max_len: usize) -> Option<String> {
    let mut slug = String::new();
    let mut pending_dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
            if slug.len() >= max_len {
                break;
            }
        } else {
            pending_dash = true;
        }
    }
    let slug = slug.trim_end_matches('-').to_string();
    if slug.is_empty() { None } else { Some(slug) }
}
