use std::fs;
use std::io;
use std::path::Path;

/// Name of the credential file kept next to the executable.
pub const API_KEY_FILE: &str = "api_key.txt";

/// Read the stored API key, if any.
///
/// Surrounding whitespace is trimmed; a missing or empty file counts as no
/// key.
pub fn load_api_key(path: &Path) -> io::Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)?;
    let key = raw.trim();
    Ok(if key.is_empty() {
        None
    } else {
        Some(key.to_string())
    })
}

/// Store an API key, replacing any previous one.
pub fn save_api_key(path: &Path, key: &str) -> io::Result<()> {
    fs::write(path, key.trim())
}
