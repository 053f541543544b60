//! Terminal session multiplexer: one tmux session per worktree.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CommandError;
use crate::process::{execute, run_checked};

/// Joins project and feature in worktree session names. Neither part can
/// contain it: both are single path components.
pub const SESSION_SEPARATOR: char = '/';

#[async_trait]
pub trait SessionMultiplexer: Send + Sync {
    async fn list_sessions(&self) -> Result<Vec<String>, CommandError>;

    fn session_name(&self, project: &str, feature: &str) -> String {
        session_name(project, feature)
    }

    fn workspace_session_name(&self, feature: &str) -> String {
        workspace_session_name(feature)
    }

    async fn capture_pane(&self, name: &str) -> Result<String, CommandError>;

    /// Command lines of the processes attached to each session's panes,
    /// keyed by session name. One batched lookup for all sessions.
    async fn pane_commands(&self) -> Result<HashMap<String, String>, CommandError>;

    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), CommandError>;

    async fn kill_session(&self, name: &str) -> Result<(), CommandError>;
}

/// Deterministic session name for a worktree: `<project>/<feature>`.
pub fn session_name(project: &str, feature: &str) -> String {
    format!("{}{SESSION_SEPARATOR}{}", tmux_safe(project), tmux_safe(feature))
}

/// Umbrella workspace sessions are the bare feature name, so they never
/// contain [`SESSION_SEPARATOR`] and cannot meet a worktree session.
pub fn workspace_session_name(feature: &str) -> String {
    tmux_safe(feature)
}

/// tmux reserves `.` and `:` in target syntax, so both become `_`.
fn tmux_safe(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '.' | ':' | SESSION_SEPARATOR => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}

pub struct TmuxMultiplexer {
    timeout: Duration,
    capture_lines: u32,
}

impl TmuxMultiplexer {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            capture_lines: 60,
        }
    }
}

fn is_no_server(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no server running") || lower.contains("error connecting to")
}

#[async_trait]
impl SessionMultiplexer for TmuxMultiplexer {
    async fn list_sessions(&self) -> Result<Vec<String>, CommandError> {
        let output = execute(
            "tmux",
            &["list-sessions", "-F", "#{session_name}"],
            None,
            self.timeout,
        )
        .await?;
        if !output.success() {
            if is_no_server(&output.stderr) {
                return Ok(Vec::new());
            }
            return Err(CommandError::Failed {
                program: "tmux".into(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn capture_pane(&self, name: &str) -> Result<String, CommandError> {
        let target = format!("={name}:");
        let start = format!("-{}", self.capture_lines);
        run_checked(
            "tmux",
            &["capture-pane", "-p", "-J", "-t", &target, "-S", &start],
            None,
            self.timeout,
        )
        .await
    }

    async fn pane_commands(&self) -> Result<HashMap<String, String>, CommandError> {
        let output = execute(
            "tmux",
            &[
                "list-panes",
                "-a",
                "-F",
                "#{session_name}\t#{pane_pid}\t#{pane_current_command}",
            ],
            None,
            self.timeout,
        )
        .await?;
        if !output.success() {
            if is_no_server(&output.stderr) {
                return Ok(HashMap::new());
            }
            return Err(CommandError::Failed {
                program: "tmux".into(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        // A failed ps still leaves pane_current_command to match against.
        let processes = run_checked("ps", &["-A", "-o", "pid=,ppid=,args="], None, self.timeout)
            .await
            .unwrap_or_default();

        Ok(merge_pane_commands(&output.stdout, &processes))
    }

    async fn create_session(&self, name: &str, cwd: &Path) -> Result<(), CommandError> {
        let cwd_arg = cwd.to_string_lossy();
        run_checked(
            "tmux",
            &["new-session", "-d", "-s", name, "-c", &cwd_arg],
            None,
            self.timeout,
        )
        .await
        .map(|_| ())
    }

    async fn kill_session(&self, name: &str) -> Result<(), CommandError> {
        let target = format!("={name}");
        let output = execute("tmux", &["kill-session", "-t", &target], None, self.timeout).await?;
        if output.success() {
            return Ok(());
        }
        let stderr = output.stderr.to_ascii_lowercase();
        if stderr.contains("can't find session") || is_no_server(&stderr) {
            return Ok(());
        }
        Err(CommandError::Failed {
            program: "tmux".into(),
            code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}

/// Join `list-panes` rows with a `ps` process table: each session maps to
/// the command lines of its pane processes and their descendants.
pub(crate) fn merge_pane_commands(panes: &str, processes: &str) -> HashMap<String, String> {
    let mut args_by_pid: HashMap<u32, String> = HashMap::new();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for line in processes.lines() {
        let mut parts = line.split_whitespace();
        let (Some(pid), Some(ppid)) = (parts.next(), parts.next()) else {
            continue;
        };
        let (Ok(pid), Ok(ppid)) = (pid.parse::<u32>(), ppid.parse::<u32>()) else {
            continue;
        };
        let args = parts.collect::<Vec<_>>().join(" ");
        args_by_pid.insert(pid, args);
        children.entry(ppid).or_default().push(pid);
    }

    let mut result: HashMap<String, String> = HashMap::new();
    for line in panes.lines() {
        let mut parts = line.splitn(3, '\t');
        let (Some(session), Some(pid), current) = (parts.next(), parts.next(), parts.next())
        else {
            continue;
        };
        let mut commands = Vec::new();
        if let Some(current) = current.map(str::trim).filter(|c| !c.is_empty()) {
            commands.push(current.to_string());
        }
        if let Ok(pid) = pid.trim().parse::<u32>() {
            // Depth-limited walk: shell -> tool -> helper is as deep as it gets.
            let mut frontier = vec![(pid, 0u8)];
            while let Some((pid, depth)) = frontier.pop() {
                if let Some(args) = args_by_pid.get(&pid) {
                    commands.push(args.clone());
                }
                if depth < 3 {
                    if let Some(kids) = children.get(&pid) {
                        frontier.extend(kids.iter().map(|kid| (*kid, depth + 1)));
                    }
                }
            }
        }
        let entry = result.entry(session.to_string()).or_default();
        for command in commands {
            if !entry.is_empty() {
                entry.push('\n');
            }
            entry.push_str(&command);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_deterministic_and_tmux_safe() {
        assert_eq!(session_name("app", "login"), "app/login");
        assert_eq!(session_name("my.app", "fix:1"), "my_app/fix_1");
        assert_eq!(session_name("app", "login"), session_name("app", "login"));
        assert_eq!(workspace_session_name("auth"), "auth");
    }

    #[test]
    fn hyphenated_names_do_not_collide() {
        assert_ne!(session_name("a-b", "c"), session_name("a", "b-c"));
        assert_ne!(session_name("ws", "auth"), workspace_session_name("auth"));
        assert_ne!(workspace_session_name("a-b"), session_name("a", "b"));
    }

    #[test]
    fn merges_pane_processes_with_descendants() {
        let panes = "app/login\t100\tzsh\napp/docs\t200\tvim\n";
        let ps = "\
  100     1 -zsh
  101   100 node /usr/local/bin/claude --resume
  102   101 node helper.js
  200     1 vim README.md
  300     1 unrelated
";
        let merged = merge_pane_commands(panes, ps);
        let login = merged.get("app/login").expect("login session");
        assert!(login.contains("claude --resume"));
        assert!(login.contains("helper.js"));
        assert!(!login.contains("unrelated"));
        let docs = merged.get("app/docs").expect("docs session");
        assert!(docs.contains("vim README.md"));
    }

    #[test]
    fn merge_survives_missing_process_table() {
        let merged = merge_pane_commands("app/login\t100\tcodex\n", "");
        assert_eq!(merged.get("app/login").map(String::as_str), Some("codex"));
    }

    #[test]
    fn recognises_no_server_errors() {
        assert!(is_no_server("no server running on /tmp/tmux-501/default"));
        assert!(is_no_server("error connecting to /tmp/tmux-0/default (No such file)"));
        assert!(!is_no_server("unknown option"));
    }
}
