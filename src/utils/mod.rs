//! Shared helpers: slug generation, atomic JSON persistence, and
//! retry-tolerant sentinel reads.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Maximum length of a generated slug, in bytes.
const MAX_SLUG_LEN: usize = 30;

/// Turns an arbitrary task description into a branch-safe slug.
///
/// Lowercases, maps whitespace runs to a single dash, drops everything that
/// is not alphanumeric or a dash, truncates to 30 bytes, and trims trailing
/// dashes so truncation never leaves a dangling separator.
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len().min(MAX_SLUG_LEN));

    for ch in input.trim().to_lowercase().chars() {
        if ch.is_whitespace() {
            if !slug.is_empty() && !slug.ends_with('-') {
                slug.push('-');
            }
        } else if ch.is_ascii_alphanumeric() || ch == '-' {
            slug.push(ch);
        }
    }

    slug.truncate(MAX_SLUG_LEN);
    while slug.ends_with('-') {
        slug.pop();
    }

    slug
}

/// Writes `value` as pretty JSON via a temp file and rename, so readers
/// never observe a partially written document.
pub async fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }

    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, &data)
        .await
        .with_context(|| format!("Failed to write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;

    Ok(())
}

/// Reads and parses a JSON file, retrying on missing files and parse
/// failures.
///
/// Sentinel files are written by external workers with write-then-rename,
/// but network filesystems and editors can still surface truncated reads;
/// a parse failure here is treated as transient until `attempts` runs out.
pub async fn read_json_retry<T: DeserializeOwned>(
    path: &Path,
    attempts: u32,
    backoff: Duration,
) -> Result<T> {
    let mut last_err = None;

    for attempt in 0..attempts {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => return Ok(value),
                Err(e) => last_err = Some(anyhow::Error::new(e)),
            },
            Err(e) => last_err = Some(anyhow::Error::new(e)),
        }

        if attempt + 1 < attempts {
            tokio::time::sleep(backoff).await;
        }
    }

    Err(last_err
        .unwrap_or_else(|| anyhow::anyhow!("no attempts made"))
        .context(format!("Failed to read {}", path.display())))
}

/// Installs the env-filtered tracing subscriber. Safe to call repeatedly;
/// later calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Parses a human-formatted count like `1,234`, `12.5k`, or `3.2M`.
pub fn parse_count(raw: &str) -> Option<u64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }

    let (digits, multiplier) = match cleaned.chars().last()? {
        'k' | 'K' => (&cleaned[..cleaned.len() - 1], 1_000.0),
        'm' | 'M' => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };

    digits.parse::<f64>().ok().map(|n| (n * multiplier) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slugify_basic() {
        assert_eq!(slugify("  Hello, World!!  "), "hello-world");
        assert_eq!(slugify("Fix the API bug"), "fix-the-api-bug");
        assert_eq!(slugify("already-a-slug"), "already-a-slug");
    }

    #[test]
    fn test_slugify_truncates_without_trailing_dash() {
        let long = "a".repeat(40);
        let slug = slugify(&long);
        assert_eq!(slug.len(), 30);
        assert!(!slug.ends_with('-'));

        // A dash landing exactly on the boundary gets trimmed
        let boundary = format!("{} {}", "b".repeat(29), "c".repeat(10));
        let slug = slugify(&boundary);
        assert_eq!(slug, "b".repeat(29));
    }

    #[test]
    fn test_slugify_empty_and_symbols() {
        assert_eq!(slugify(""), "");
        assert_eq!(slugify("!!!"), "");
        assert_eq!(slugify("über tâche"), "ber-tche");
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("1234"), Some(1234));
        assert_eq!(parse_count("1,234"), Some(1234));
        assert_eq!(parse_count("12.5k"), Some(12_500));
        assert_eq!(parse_count("3.2M"), Some(3_200_000));
        assert_eq!(parse_count(""), None);
        assert_eq!(parse_count("abc"), None);
    }

    #[tokio::test]
    async fn test_atomic_write_and_retry_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let value = serde_json::json!({"id": "abc", "count": 3});
        atomic_write_json(&path, &value).await.unwrap();

        let read: serde_json::Value = read_json_retry(&path, 3, Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(read, value);

        // No leftover temp file
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_read_retry_recovers_from_partial_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sentinel.json");

        // Truncated document, as a reader racing a writer would see
        tokio::fs::write(&path, "{\"task_id\": \"a\"").await.unwrap();

        let fixer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                tokio::fs::write(&path, "{\"task_id\": \"a\"}").await.unwrap();
            })
        };

        let read: serde_json::Value = read_json_retry(&path, 10, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(read["task_id"], "a");
        fixer.await.unwrap();
    }
}
