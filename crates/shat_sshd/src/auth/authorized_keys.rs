//! OpenSSH `authorized_keys` parsing.
//!
//! Used to load operator keys. Each line has the form
//! `[options] key-type base64-data [comment]`; blank lines and `#` comments
//! are skipped.

use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::{Error, PublicKey, Result};

/// A key parsed from an `authorized_keys` file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// The decoded key.
    pub key: PublicKey,
    /// Optional comment (usually email or identifier).
    pub comment: Option<String>,
    /// Optional key options (e.g., "command=", "no-pty").
    pub options: Vec<String>,
}

/// Parses the contents of an `authorized_keys` file.
///
/// Lines that do not parse are skipped and logged at debug level.
///
/// ```text
/// ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAA... user@example.com
/// no-pty,command="/usr/bin/git-shell" ssh-rsa AAAAB3... git@server
/// ```
pub fn parse_authorized_keys(content: &str) -> Vec<AuthorizedKey> {
    let mut keys = Vec::new();

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line) {
            Ok(key) => keys.push(key),
            Err(e) => debug!(line = number + 1, error = %e, "Skipping authorized_keys line"),
        }
    }

    keys
}

/// Reads and parses an `authorized_keys` file. A leading `~/` expands to
/// the home directory.
pub fn load_authorized_keys(path: impl AsRef<Path>) -> Result<Vec<AuthorizedKey>> {
    let path = expand_tilde(path.as_ref());
    let content = std::fs::read_to_string(&path)?;
    let keys = parse_authorized_keys(&content);
    info!(path = %path.display(), count = keys.len(), "Loaded authorized keys");
    Ok(keys)
}

/// Expands a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    expand_tilde_with_home(path, home.as_deref())
}

fn expand_tilde_with_home(path: &Path, home: Option<&Path>) -> PathBuf {
    let path_str = path.to_string_lossy();
    if let Some(stripped) = path_str.strip_prefix("~/")
        && let Some(home_dir) = home
    {
        return home_dir.join(stripped);
    }
    path.to_path_buf()
}

const KEY_TYPES: &[&str] = &[
    "ssh-ed25519",
    "ssh-rsa",
    "ecdsa-sha2-nistp256",
    "ecdsa-sha2-nistp384",
    "ecdsa-sha2-nistp521",
    "ssh-dss",
    "sk-ssh-ed25519@openssh.com",
    "sk-ecdsa-sha2-nistp256@openssh.com",
];

fn parse_line(line: &str) -> Result<AuthorizedKey> {
    let (first, rest) = split_field(line);

    let (options, key_type, rest) = if KEY_TYPES.contains(&first) {
        (Vec::new(), first, rest)
    } else {
        let (key_type, rest) = split_field(rest);
        if !KEY_TYPES.contains(&key_type) {
            return Err(Error::Key(format!("unknown key type {key_type:?}")));
        }
        (split_options(first), key_type, rest)
    };

    let (data, comment) = split_field(rest);
    if data.is_empty() {
        return Err(Error::Key("missing key data".to_string()));
    }

    let key = PublicKey::parse_openssh(data)?;
    if key.algorithm() != key_type {
        return Err(Error::Key(format!(
            "key data is {} but line says {key_type}",
            key.algorithm()
        )));
    }

    Ok(AuthorizedKey {
        key,
        comment: (!comment.is_empty()).then(|| comment.to_string()),
        options,
    })
}

/// Splits off the first whitespace-delimited field. Double quotes protect
/// whitespace, as in `command="a b"`.
fn split_field(s: &str) -> (&str, &str) {
    let s = s.trim_start();
    let mut quoted = false;
    for (i, c) in s.char_indices() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => return (&s[..i], s[i..].trim()),
            _ => {}
        }
    }
    (s, "")
}

/// Splits an options field on commas outside double quotes.
fn split_options(field: &str) -> Vec<String> {
    let mut options = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in field.chars() {
        match c {
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            ',' if !quoted => options.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        options.push(current);
    }
    options
}
