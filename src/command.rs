//! Shell-command remediation actions and health criteria.
//!
//! Each action or criterion id maps to a `sh -c` command. The command runs in
//! its own process group so a timeout can kill it along with its children.
//! Exit 0 means success (action) or pass (criterion).

use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::clock;
use crate::error::{ActionError, CriterionError};
use crate::healing::{HealthCriteria, RemediationActions};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default = "default_timeout", with = "crate::config::duration")]
    pub timeout: Duration,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecResult {
    pub exit_code: i32,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == 0
    }
}

/// Run `command` under `sh -c`, killing its process group after `timeout`.
pub fn execute(command: &str, env: &[(&str, &str)], timeout: Duration) -> std::io::Result<ExecResult> {
    let start = Instant::now();
    let mut child = Command::new("/bin/sh")
        .args(["-c", command])
        .envs(env.iter().copied())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .spawn()?;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(ExecResult {
                exit_code: status.code().unwrap_or(-1),
                elapsed_ms: clock::millis(start.elapsed()),
                timed_out: false,
            });
        }
        if start.elapsed() >= timeout {
            let pgid = Pid::from_raw(child.id() as i32);
            if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                tracing::warn!(command, error = %e, "failed to kill timed-out command");
            }
            if let Err(e) = child.wait() {
                tracing::warn!(command, error = %e, "failed to reap timed-out command");
            }
            return Ok(ExecResult {
                exit_code: -1,
                elapsed_ms: clock::millis(start.elapsed()),
                timed_out: true,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Remediation actions and health criteria declared as shell commands.
///
/// Commands see `FAULT_SERVICE` plus `FAULT_ACTION` or `FAULT_CRITERION`.
#[derive(Debug, Clone, Default)]
pub struct CommandCollaborators {
    actions: BTreeMap<String, CommandSpec>,
    criteria: BTreeMap<String, CommandSpec>,
}

impl CommandCollaborators {
    pub fn new(
        actions: BTreeMap<String, CommandSpec>,
        criteria: BTreeMap<String, CommandSpec>,
    ) -> Self {
        Self { actions, criteria }
    }
}

impl RemediationActions for CommandCollaborators {
    fn execute(&self, action: &str, service: &str) -> Result<bool, ActionError> {
        let spec = self
            .actions
            .get(action)
            .ok_or_else(|| ActionError::Unknown(action.to_string()))?;
        let env = [("FAULT_SERVICE", service), ("FAULT_ACTION", action)];
        let result = execute(&spec.command, &env, spec.timeout).map_err(|e| ActionError::Spawn {
            action: action.to_string(),
            reason: e.to_string(),
        })?;
        tracing::debug!(action, service, exit_code = result.exit_code, elapsed_ms = result.elapsed_ms, "action command finished");
        if result.timed_out {
            return Err(ActionError::TimedOut {
                action: action.to_string(),
                timeout_ms: clock::millis(spec.timeout),
            });
        }
        Ok(result.success())
    }
}

impl HealthCriteria for CommandCollaborators {
    fn evaluate(&self, criterion: &str, service: &str) -> Result<bool, CriterionError> {
        let spec = self
            .criteria
            .get(criterion)
            .ok_or_else(|| CriterionError::Unknown(criterion.to_string()))?;
        let env = [("FAULT_SERVICE", service), ("FAULT_CRITERION", criterion)];
        let result =
            execute(&spec.command, &env, spec.timeout).map_err(|e| CriterionError::Evaluation {
                criterion: criterion.to_string(),
                reason: e.to_string(),
            })?;
        if result.timed_out {
            return Err(CriterionError::TimedOut {
                criterion: criterion.to_string(),
                timeout_ms: clock::millis(spec.timeout),
            });
        }
        Ok(result.success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(command: &str, timeout: Duration) -> CommandSpec {
        CommandSpec {
            command: command.to_string(),
            timeout,
        }
    }

    fn collaborators() -> CommandCollaborators {
        let mut actions = BTreeMap::new();
        actions.insert("ok".to_string(), spec("true", Duration::from_secs(5)));
        actions.insert("fails".to_string(), spec("exit 3", Duration::from_secs(5)));
        actions.insert("hangs".to_string(), spec("sleep 30", Duration::from_millis(300)));
        let mut criteria = BTreeMap::new();
        criteria.insert(
            "is-db".to_string(),
            spec("test \"$FAULT_SERVICE\" = db", Duration::from_secs(5)),
        );
        criteria.insert("hangs".to_string(), spec("sleep 30", Duration::from_millis(300)));
        CommandCollaborators::new(actions, criteria)
    }

    #[test]
    fn exit_code_maps_to_action_result() {
        let c = collaborators();
        assert!(RemediationActions::execute(&c, "ok", "db").unwrap());
        assert!(!RemediationActions::execute(&c, "fails", "db").unwrap());
    }

    #[test]
    fn unknown_action_is_an_error() {
        let c = collaborators();
        assert!(matches!(
            RemediationActions::execute(&c, "nope", "db"),
            Err(ActionError::Unknown(_))
        ));
    }

    #[test]
    fn timeout_kills_action() {
        let c = collaborators();
        let start = Instant::now();
        let result = RemediationActions::execute(&c, "hangs", "db");
        assert!(matches!(result, Err(ActionError::TimedOut { .. })));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn criterion_sees_service_env() {
        let c = collaborators();
        assert!(c.evaluate("is-db", "db").unwrap());
        assert!(!c.evaluate("is-db", "cache").unwrap());
        assert!(matches!(
            c.evaluate("hangs", "db"),
            Err(CriterionError::TimedOut { .. })
        ));
    }

    #[test]
    fn execute_reports_exit_code() {
        let result = execute("exit 7", &[], Duration::from_secs(5)).unwrap();
        assert_eq!(result.exit_code, 7);
        assert!(!result.timed_out);
        assert!(!result.success());
    }
}
