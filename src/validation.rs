//! # Input Validation
//!
//! Validation for user-controlled inputs that end up in SSH targets, git
//! URLs and command arguments. Every value crossing into a subprocess
//! invocation passes through here first; a rejected value is a permanent
//! failure and is never retried.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Characters that terminate, chain or substitute commands in a shell.
/// Arguments are passed as vectors, but these have no business in a
/// hostname or path either.
const INJECTION_CHARS: &[char] = &[
    ';', '$', '`', '|', '&', '>', '<', '(', ')', '{', '}', '\n', '\r',
];

static HOSTNAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    // Hostnames, IPv4, and bracketed IPv6 literals.
    Regex::new(r"^[\[a-zA-Z0-9]([a-zA-Z0-9\-\.:\[\]])*[a-zA-Z0-9\]]?$")
        .expect("hostname regex is valid")
});

static USERNAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_\-]+$").expect("username regex is valid"));

fn find_injection_char(value: &str) -> Option<char> {
    value.chars().find(|c| INJECTION_CHARS.contains(c))
}

/// Validate a hostname or IP address before it is used as an SSH target.
pub fn validate_hostname(hostname: &str) -> Result<&str> {
    if hostname.is_empty() {
        return Err(Error::validation("hostname", "cannot be empty"));
    }
    if hostname.len() > 253 {
        return Err(Error::validation(
            "hostname",
            format!("too long: {} > 253 characters", hostname.len()),
        ));
    }
    if let Some(c) = find_injection_char(hostname) {
        return Err(Error::validation(
            "hostname",
            format!("contains dangerous character {c:?}"),
        ));
    }
    if !HOSTNAME_PATTERN.is_match(hostname) {
        return Err(Error::validation(
            "hostname",
            "only alphanumerics, hyphens, dots, colons and brackets allowed",
        ));
    }
    debug!(hostname, "validated hostname");
    Ok(hostname)
}

/// Validate a Git repository URL.
pub fn validate_git_url(git_url: &str) -> Result<&str> {
    if git_url.is_empty() {
        return Err(Error::validation("gitRepo", "cannot be empty"));
    }
    if git_url.len() > 2048 {
        return Err(Error::validation(
            "gitRepo",
            format!("too long: {} > 2048 characters", git_url.len()),
        ));
    }

    if let Some((scheme, _rest)) = git_url.split_once("://") {
        const ALLOWED: &[&str] = &["https", "http", "git", "ssh"];
        if !ALLOWED.contains(&scheme) {
            return Err(Error::validation(
                "gitRepo",
                format!("disallowed URL scheme {scheme:?}, allowed: https, http, git, ssh"),
            ));
        }
    }

    if let Some(c) = find_injection_char(git_url) {
        return Err(Error::validation(
            "gitRepo",
            format!("contains dangerous character {c:?}"),
        ));
    }
    // Redundant with the character scan for `$`, kept to mirror the
    // documented injection set exactly.
    if git_url.contains("$(") || git_url.contains("${") {
        return Err(Error::validation("gitRepo", "contains command substitution"));
    }

    debug!(git_url, "validated git URL");
    Ok(git_url)
}

/// Validate an SSH username.
pub fn validate_ssh_username(username: &str) -> Result<&str> {
    if username.is_empty() {
        return Err(Error::validation("sshUser", "cannot be empty"));
    }
    if username.len() > 32 {
        return Err(Error::validation(
            "sshUser",
            format!("too long: {} > 32 characters", username.len()),
        ));
    }
    if !USERNAME_PATTERN.is_match(username) {
        return Err(Error::validation(
            "sshUser",
            "only alphanumerics, underscore and hyphen allowed",
        ));
    }
    debug!(username, "validated ssh username");
    Ok(username)
}

/// Validate a file path used inside a checkout or on a remote host.
///
/// `..` segments are permitted (some flake layouts reference parents) but
/// logged so operators can audit them.
pub fn validate_path(path: &str, max_length: usize) -> Result<&str> {
    if path.is_empty() {
        return Err(Error::validation("path", "cannot be empty"));
    }
    if path.len() > max_length {
        return Err(Error::validation(
            "path",
            format!("too long: {} > {max_length} characters", path.len()),
        ));
    }
    if path.contains('\0') {
        return Err(Error::validation("path", "contains null byte"));
    }
    if path.contains("..") {
        warn!(path, "path contains parent directory reference");
    }
    // `>` and `<` are legal in filenames; the shell metacharacters that
    // matter for paths are the separators and substitution characters.
    for c in [';', '$', '`', '|', '&', '\n', '\r'] {
        if path.contains(c) {
            return Err(Error::validation(
                "path",
                format!("contains dangerous character {c:?}"),
            ));
        }
    }
    debug!(path, "validated path");
    Ok(path)
}

/// Default maximum length for [`validate_path`].
pub const DEFAULT_MAX_PATH_LENGTH: usize = 4096;
