/// Target process lookup: run the process-listing command and read back a pid.
use crate::config::LookupConfig;
use std::process::Stdio;
use tokio::process::Command;

/// Name matched against the process table. Fixed at build time.
pub const TARGET_PROCESS: &str = "p4";

/// Errors that can occur while resolving the target pid. All of them are
/// treated as transient by the tailer.
#[derive(Debug)]
pub enum LookupError {
    /// The listing command ran but matched nothing.
    NotFound { name: String },
    /// Failed to spawn the listing command.
    Query {
        command: String,
        source: std::io::Error,
    },
    /// The listing command failed for a reason other than "no match".
    Status { command: String, code: Option<i32> },
    /// Output wasn't a pid.
    Parse { output: String },
}

impl std::fmt::Display for LookupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LookupError::NotFound { name } => write!(f, "no process matching '{name}'"),
            LookupError::Query { command, source } => {
                write!(f, "failed to run {command}: {source}")
            }
            LookupError::Status { command, code } => match code {
                Some(code) => write!(f, "{command} exited with status {code}"),
                None => write!(f, "{command} was killed by a signal"),
            },
            LookupError::Parse { output } => {
                write!(f, "unexpected process listing output: {output:?}")
            }
        }
    }
}

impl std::error::Error for LookupError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LookupError::Query { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Build the command arguments, replacing `{name}` placeholders with the target name.
fn build_args(config: &LookupConfig, name: &str) -> Vec<String> {
    config
        .args
        .iter()
        .map(|arg| arg.replace("{name}", name))
        .collect()
}

/// Resolve the pid of the process called `name`.
///
/// pgrep exits 1 when nothing matches; that maps to `NotFound`. When several
/// processes match, the first listed pid wins.
pub async fn find_pid(config: &LookupConfig, name: &str) -> Result<u32, LookupError> {
    let args = build_args(config, name);
    let output = Command::new(&config.command)
        .args(&args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .await
        .map_err(|e| LookupError::Query {
            command: config.command.clone(),
            source: e,
        })?;

    match output.status.code() {
        Some(0) => {}
        Some(1) => {
            return Err(LookupError::NotFound {
                name: name.to_string(),
            })
        }
        code => {
            return Err(LookupError::Status {
                command: config.command.clone(),
                code,
            })
        }
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_pid_listing(&stdout, name)
}

fn parse_pid_listing(stdout: &str, name: &str) -> Result<u32, LookupError> {
    let mut lines = stdout.lines().map(str::trim).filter(|l| !l.is_empty());
    let first = lines.next().ok_or_else(|| LookupError::NotFound {
        name: name.to_string(),
    })?;

    let pid = match first.parse::<u32>() {
        Ok(pid) if pid > 0 => pid,
        _ => {
            return Err(LookupError::Parse {
                output: first.to_string(),
            })
        }
    };

    let others: Vec<&str> = lines.collect();
    if !others.is_empty() {
        tracing::debug!(pid, ignored = ?others, "several processes matched, using the first");
    }
    Ok(pid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(command: &str, args: &[&str]) -> LookupConfig {
        LookupConfig {
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_build_args_replaces_name_placeholder() {
        let config = LookupConfig::default();
        assert_eq!(build_args(&config, TARGET_PROCESS), vec!["p4"]);
    }

    #[test]
    fn test_build_args_no_placeholder() {
        let config = lookup("pgrep", &["-n", "-x", "fixed"]);
        assert_eq!(build_args(&config, "p4"), vec!["-n", "-x", "fixed"]);
    }

    #[test]
    fn test_parse_single_pid() {
        assert_eq!(parse_pid_listing("4242\n", "p4").unwrap(), 4242);
    }

    #[test]
    fn test_parse_several_pids_takes_first() {
        assert_eq!(parse_pid_listing("4242\n4300\n", "p4").unwrap(), 4242);
    }

    #[test]
    fn test_parse_empty_is_not_found() {
        assert!(matches!(
            parse_pid_listing("\n", "p4"),
            Err(LookupError::NotFound { .. })
        ));
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_pid_listing("p4: no such thing\n", "p4").unwrap_err();
        assert!(matches!(err, LookupError::Parse { .. }));
    }

    #[test]
    fn test_parse_zero_pid_rejected() {
        assert!(matches!(
            parse_pid_listing("0\n", "p4"),
            Err(LookupError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_find_pid_from_command_output() {
        let config = lookup("echo", &["4242"]);
        assert_eq!(find_pid(&config, "p4").await.unwrap(), 4242);
    }

    #[tokio::test]
    async fn test_find_pid_substitutes_name() {
        let config = lookup("sh", &["-c", "test \"$0\" = p4 && echo 77", "{name}"]);
        assert_eq!(find_pid(&config, "p4").await.unwrap(), 77);
    }

    #[tokio::test]
    async fn test_exit_one_is_not_found() {
        let config = lookup("false", &[]);
        let err = find_pid(&config, "p4").await.unwrap_err();
        assert!(matches!(err, LookupError::NotFound { .. }));
        assert_eq!(err.to_string(), "no process matching 'p4'");
    }

    #[tokio::test]
    async fn test_other_status_is_status_error() {
        let config = lookup("sh", &["-c", "exit 3"]);
        let err = find_pid(&config, "p4").await.unwrap_err();
        assert!(matches!(err, LookupError::Status { code: Some(3), .. }));
    }

    #[tokio::test]
    async fn test_missing_command_is_query_error() {
        let config = lookup("nonexistent-binary-xyz", &[]);
        let err = find_pid(&config, "p4").await.unwrap_err();
        assert!(matches!(err, LookupError::Query { .. }));
        assert!(err.to_string().contains("failed to run"));
    }

    #[tokio::test]
    async fn test_finds_own_process_with_pgrep_style_listing() {
        let own = std::process::id();
        let config = lookup("sh", &["-c", &format!("echo {own}")]);
        assert_eq!(find_pid(&config, TARGET_PROCESS).await.unwrap(), own);
    }
}
