//! Executable lookup and platform command wrapping.
//!
//! The CLI is usually installed somewhere only the user's login shell knows
//! about (nvm, volta, `~/.local/bin`), so the configured name is resolved to
//! an absolute path through that shell before each launch.
//!
//! # Example
//!
//! ```ignore
//! use deckhand_core::shell::resolve_executable;
//!
//! let program = resolve_executable("claude", Duration::from_secs(3)).await;
//! // "/Users/me/.local/bin/claude", or "claude" if the lookup failed
//! ```

use std::process::Command;
use std::time::Duration;

/// Strip one layer of surrounding quotes (`"..."` or `'...'`).
pub fn trim_quotes(s: &str) -> &str {
    let s = s.trim();
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|r| r.strip_suffix(quote)) {
            return inner.trim();
        }
    }
    s
}

/// Whether the value already names a file rather than a command to look up.
pub fn looks_like_path(s: &str) -> bool {
    s.contains('/') || s.contains('\\')
}

/// Resolve the CLI executable to an absolute path when possible.
///
/// Quotes are trimmed; values that already look like paths are returned
/// as-is. Otherwise the login shell is asked (bounded by `timeout`); on any
/// failure the trimmed name is returned unchanged and left to the OS lookup.
pub async fn resolve_executable(cli_path: &str, timeout: Duration) -> String {
    let name = trim_quotes(cli_path);
    if name.is_empty() || looks_like_path(name) {
        return name.to_string();
    }

    let mut cmd = match lookup_command(name) {
        Some(cmd) => cmd,
        None => return name.to_string(),
    };
    cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            match first_path_line(&stdout) {
                Some(path) => {
                    log::debug!("Resolved {} to {}", name, path);
                    path
                }
                None => name.to_string(),
            }
        }
        Ok(Ok(_)) => {
            log::debug!("Lookup of {} found nothing, using it as-is", name);
            name.to_string()
        }
        Ok(Err(e)) => {
            log::warn!("Lookup of {} failed: {}", name, e);
            name.to_string()
        }
        Err(_) => {
            log::warn!("Lookup of {} timed out after {:?}", name, timeout);
            name.to_string()
        }
    }
}

/// First output line that is an actual path (`command -v` prints alias
/// definitions for aliases, which we cannot exec).
fn first_path_line(output: &str) -> Option<String> {
    output
        .lines()
        .map(trim_quotes)
        .find(|l| !l.is_empty() && looks_like_path(l))
        .map(str::to_string)
}

#[cfg(unix)]
fn lookup_command(name: &str) -> Option<tokio::process::Command> {
    let quoted = shlex::try_quote(name).ok()?;
    let shell = login_shell(std::env::var("SHELL").ok().as_deref());

    let mut cmd = tokio::process::Command::new(shell);
    cmd.args(["-l", "-c"]).arg(format!("command -v {quoted}"));
    Some(cmd)
}

#[cfg(windows)]
fn lookup_command(name: &str) -> Option<tokio::process::Command> {
    let mut cmd = tokio::process::Command::new("where");
    cmd.arg(name);
    Some(cmd)
}

/// Shells that do not accept `-l -c`.
#[cfg(unix)]
const NON_POSIX_SHELLS: [&str; 6] = ["fish", "nu", "nushell", "elvish", "xonsh", "ion"];

/// Shell to run the lookup in, given the value of `$SHELL`.
#[cfg(unix)]
fn login_shell(shell_env: Option<&str>) -> String {
    let shell = shell_env.filter(|s| !s.trim().is_empty()).unwrap_or("/bin/sh");
    let name = std::path::Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");

    if !NON_POSIX_SHELLS.contains(&name) {
        return shell.to_string();
    }
    if std::path::Path::new("/bin/bash").exists() {
        "/bin/bash".to_string()
    } else {
        "/bin/sh".to_string()
    }
}

/// Prepend the binary's parent directory to PATH so node/etc. are found.
pub fn prepare_path_env(cmd: &mut Command, binary_path: &str) {
    if looks_like_path(binary_path) {
        if let Some(dir) = std::path::Path::new(binary_path).parent() {
            if let Some(dir_str) = dir.to_str() {
                let existing = std::env::var("PATH").unwrap_or_default();
                let sep = if cfg!(windows) { ";" } else { ":" };
                let combined = if existing.is_empty() {
                    dir_str.to_string()
                } else {
                    format!("{}{}{}", dir_str, sep, existing)
                };
                cmd.env("PATH", combined);
            }
        }
    }
}

/// Command for the piped launch.
///
/// On Windows the CLI is usually an npm `.cmd` shim that `CreateProcess`
/// cannot run directly, so it goes through `cmd /C`. Elsewhere the binary
/// is executed directly.
pub fn child_command(program: &str, args: &[String]) -> Command {
    #[cfg(windows)]
    let mut cmd = {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(program);
        cmd
    };
    #[cfg(not(windows))]
    let mut cmd = Command::new(program);

    cmd.args(args);
    prepare_path_env(&mut cmd, program);
    cmd
}

// ============================================================================
// TESTS
// ============================================================================
