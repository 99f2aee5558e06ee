//! Input validation and sanitization functions for hostwall
//!
//! This module provides centralized validation for every string that ends up
//! inside a native firewall document or on a privileged command line.

/// Maximum length of rule, service and group names.
pub const MAX_NAME_LEN: usize = 64;

/// Sanitizes a label for safe use in rule comments.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// SECURITY: Uses `is_ascii_alphanumeric()` to prevent Unicode-based bypasses
/// and keep comments inside the limits of every backend (nft allows 128 bytes,
/// iptables 256).
///
/// # Examples
///
/// ```
/// use hostwall::validators::sanitize_label;
///
/// let safe = sanitize_label("Normal Label");
/// assert_eq!(safe, "Normal Label");
///
/// let unsafe_label = "Test\nNewline\"Quote";
/// let safe = sanitize_label(unsafe_label);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: Use ASCII-only to prevent Unicode bypasses and multi-byte issues
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':')
        })
        .take(64)
        .collect()
}

/// Validates an entity name (rule, service, address group, port group).
///
/// Names appear in comments, generated rule names and file names, so they are
/// restricted to ASCII alphanumerics plus `-`, `_` and `.`.
///
/// # Errors
///
/// Returns `Err` if the name is empty, too long, or contains other characters.
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Name cannot be empty".to_string());
    }

    if name.len() > MAX_NAME_LEN {
        return Err(format!("Name too long (max {MAX_NAME_LEN} characters)"));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!(
            "Name '{name}' contains invalid characters (allowed: A-Z a-z 0-9 - _ .)"
        ));
    }

    Ok(())
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Parses a port or port range: `22`, `8000-8100` or `8000:8100`.
///
/// # Errors
///
/// Returns `Err` if the text is not a number or range within 1-65535.
pub fn parse_port_spec(input: &str) -> Result<(u16, u16), String> {
    let input = input.trim();
    if input.is_empty() {
        return Err("Port cannot be empty".to_string());
    }

    let parse = |s: &str| -> Result<u16, String> {
        s.trim()
            .parse::<u16>()
            .map_err(|_| format!("Invalid port '{s}' (must be 1-65535)"))
    };

    match input.split_once(['-', ':']) {
        Some((start, end)) => validate_port_range(parse(start)?, parse(end)?),
        None => {
            let port = validate_port(parse(input)?)?;
            Ok((port, port))
        }
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<String, String> {
    if name.is_empty() {
        return Err("Interface name cannot be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name.to_string())
}

/// Validates an identifier that becomes part of a filesystem path or a
/// native object name (snapshot ids, firewalld zone, nftables table).
///
/// # Errors
///
/// Returns `Err` for empty, overlong, dot-only or non `[A-Za-z0-9_-]` input.
pub fn validate_identifier(input: &str) -> Result<(), String> {
    if input.is_empty() {
        return Err("Identifier cannot be empty".to_string());
    }

    if input.len() > 96 {
        return Err("Identifier too long (max 96 characters)".to_string());
    }

    if !input
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(format!("Identifier '{input}' contains invalid characters"));
    }

    Ok(())
}
