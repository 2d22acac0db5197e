//! Shell quoting and path-namespace translation for the secondary shell.
//!
//! Every string interpolated into a secondary-shell script goes through
//! [`shell_quote`]. Nothing else in the crate builds quoted shell text.

/// Host name of the secondary shell's network share (`\\wsl.localhost\<distro>\...`).
const SHARE_HOSTS: [&str; 2] = ["wsl.localhost", "wsl$"];

/// Quote `value` for a POSIX shell.
///
/// The value is wrapped in single quotes; each embedded single quote becomes
/// `'"'"'` (close, double-quoted quote, reopen).
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Quote and join a program and its arguments into one command line.
pub fn quote_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    std::iter::once(shell_quote(program))
        .chain(args.iter().map(|a| shell_quote(a.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Translate a host path into the secondary shell's namespace.
///
/// - `C:\a\b` becomes `/mnt/c/a/b`
/// - `\\wsl.localhost\<distro>\home\me` becomes `/home/me`
/// - POSIX paths pass through (idempotent)
pub fn to_secondary_path(input: &str) -> String {
    let normalized = input.trim().replace('\\', "/");

    if let Some(rest) = normalized.strip_prefix("//") {
        let mut parts = rest.splitn(3, '/');
        let host = parts.next().unwrap_or_default();
        if SHARE_HOSTS.iter().any(|h| h.eq_ignore_ascii_case(host)) {
            let _distro = parts.next();
            return format!("/{}", parts.next().unwrap_or_default());
        }
        return normalized;
    }

    let bytes = normalized.as_bytes();
    if bytes.len() >= 3 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' && bytes[2] == b'/'
    {
        let letter = (bytes[0] as char).to_ascii_lowercase();
        let rest = collapse_slashes(&normalized[3..]);
        return format!("/mnt/{letter}/{rest}");
    }

    normalized
}

fn collapse_slashes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous_slash = false;
    for ch in input.chars() {
        if ch == '/' {
            if !previous_slash {
                out.push(ch);
            }
            previous_slash = true;
        } else {
            out.push(ch);
            previous_slash = false;
        }
    }
    out
}

/// Expand `~` and `~/...` against the secondary shell's home directory.
pub fn expand_home(input: &str, home: &str) -> String {
    if home.is_empty() {
        return input.to_string();
    }
    if input == "~" {
        return home.to_string();
    }
    match input.strip_prefix("~/") {
        Some(rest) => format!("{}/{}", home.trim_end_matches('/'), rest),
        None => input.to_string(),
    }
}

/// Parse the distro listing printed by the secondary shell binary.
///
/// The listing is UTF-16 on some hosts, so NUL bytes are stripped.
pub fn parse_distro_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| line.replace('\0', "").trim().to_string())
        .filter(|line| !line.is_empty())
        .collect()
}
