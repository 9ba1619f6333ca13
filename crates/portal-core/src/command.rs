//! Command normalization.
//!
//! Translates a declared `{command, args, env}` into the platform-native
//! spawn tuple. No shell is involved; the child is spawned argv-style with
//! the declared environment merged over the inherited one.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::discovery::ServerDecl;
use crate::{PortalError, PortalResult};

/// Commands that must resolve on `PATH` before spawn.
const PATH_RESOLVED: &[&str] = &["node", "python", "python3"];

/// A ready-to-spawn invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct SpawnSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Declared variables, merged over the inherited environment at spawn.
    pub env: HashMap<String, String>,
}

/// Normalize a stdio declaration into a spawn spec.
pub fn normalize(decl: &ServerDecl, home: &Path) -> PortalResult<SpawnSpec> {
    let command = decl.command.as_deref().ok_or_else(|| {
        PortalError::ConfigInvalid(format!("server '{}' has no command", decl.name))
    })?;

    let command = expand_tilde(command, home);

    let program = if command == "npx" {
        if cfg!(windows) {
            PathBuf::from("npx.cmd")
        } else {
            PathBuf::from("npx")
        }
    } else if PATH_RESOLVED.contains(&command.as_str()) {
        let path_var = std::env::var_os("PATH").unwrap_or_default();
        find_in_path(&command, &path_var).ok_or_else(|| {
            PortalError::ConfigInvalid(format!(
                "command '{command}' for server '{}' not found in PATH",
                decl.name
            ))
        })?
    } else {
        PathBuf::from(command)
    };

    let args = decl
        .args
        .iter()
        .map(|a| expand_tilde(a, home))
        .collect();

    Ok(SpawnSpec {
        program,
        args,
        env: decl.env.clone(),
    })
}

/// Expand a leading `~` or `~/` against the gateway's home directory.
fn expand_tilde(value: &str, home: &Path) -> String {
    if value == "~" {
        return home.to_string_lossy().into_owned();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest).to_string_lossy().into_owned();
    }
    value.to_string()
}

/// Walk a PATH-style variable looking for an executable file.
fn find_in_path(name: &str, path_var: &std::ffi::OsStr) -> Option<PathBuf> {
    for dir in std::env::split_paths(path_var) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
        if cfg!(windows) {
            for ext in ["exe", "cmd", "bat"] {
                let candidate = dir.join(format!("{name}.{ext}"));
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::{ServerSource, TransportHint};
    use tempfile::TempDir;

    fn decl(command: &str, args: &[&str]) -> ServerDecl {
        ServerDecl {
            name: "test".into(),
            source: ServerSource::Manual,
            transport: TransportHint::Stdio,
            command: Some(command.into()),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: HashMap::new(),
            url: None,
            timeout_seconds: 30,
            max_retries: 3,
            enabled: true,
        }
    }

    #[test]
    fn test_plain_command_passes_through() {
        let home = TempDir::new().unwrap();
        let spec = normalize(&decl("mcp-files", &["--root", "/srv"]), home.path()).unwrap();
        assert_eq!(spec.program, PathBuf::from("mcp-files"));
        assert_eq!(spec.args, vec!["--root", "/srv"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_npx_unchanged_on_posix() {
        let home = TempDir::new().unwrap();
        let spec = normalize(&decl("npx", &["-y", "pkg"]), home.path()).unwrap();
        assert_eq!(spec.program, PathBuf::from("npx"));
    }

    #[test]
    fn test_tilde_expansion_in_command_and_args() {
        let home = TempDir::new().unwrap();
        let spec = normalize(&decl("~/bin/server", &["~/data"]), home.path()).unwrap();
        assert_eq!(spec.program, home.path().join("bin/server"));
        assert_eq!(spec.args[0], home.path().join("data").to_string_lossy());
    }

    #[test]
    fn test_missing_command_is_config_invalid() {
        let home = TempDir::new().unwrap();
        let mut d = decl("x", &[]);
        d.command = None;
        let err = normalize(&d, home.path()).unwrap_err();
        assert_eq!(err.kind(), "config_invalid");
    }

    #[cfg(unix)]
    #[test]
    fn test_find_in_path_requires_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let plain = dir.path().join("node");
        std::fs::write(&plain, "#!/bin/sh\n").unwrap();
        // Not executable yet
        assert!(find_in_path("node", dir.path().as_os_str()).is_none());

        let mut perms = std::fs::metadata(&plain).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&plain, perms).unwrap();
        assert_eq!(
            find_in_path("node", dir.path().as_os_str()),
            Some(plain)
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_path_resolved_command_missing_fails() {
        let home = TempDir::new().unwrap();
        let empty = TempDir::new().unwrap();
        let saved = std::env::var_os("PATH");
        std::env::set_var("PATH", empty.path());

        let err = normalize(&decl("python3", &[]), home.path()).unwrap_err();

        match saved {
            Some(path) => std::env::set_var("PATH", path),
            None => std::env::remove_var("PATH"),
        }
        assert_eq!(err.kind(), "config_invalid");
    }
}
