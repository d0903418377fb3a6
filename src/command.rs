use crate::error::{AwsError, CommandError, Result};
use async_trait::async_trait;
use aws_sdk_ssm::types::CommandInvocationStatus;
use aws_sdk_ssm::Client as SsmClient;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Status of one command invocation on one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Pending,
    InProgress,
    Delayed,
    Success,
    Cancelled,
    Cancelling,
    TimedOut,
    Failed,
    Other,
}

impl InvocationState {
    fn from_sdk(status: Option<&CommandInvocationStatus>) -> Self {
        match status {
            Some(CommandInvocationStatus::Pending) => InvocationState::Pending,
            Some(CommandInvocationStatus::InProgress) => InvocationState::InProgress,
            Some(CommandInvocationStatus::Delayed) => InvocationState::Delayed,
            Some(CommandInvocationStatus::Success) => InvocationState::Success,
            Some(CommandInvocationStatus::Cancelled) => InvocationState::Cancelled,
            Some(CommandInvocationStatus::Cancelling) => InvocationState::Cancelling,
            Some(CommandInvocationStatus::TimedOut) => InvocationState::TimedOut,
            Some(CommandInvocationStatus::Failed) => InvocationState::Failed,
            _ => InvocationState::Other,
        }
    }

    /// Terminal for the poll loop. Only an explicit Success or Failed stops
    /// polling; anything else keeps waiting under the poll policy.
    pub fn is_settled(&self) -> bool {
        matches!(self, InvocationState::Success | InvocationState::Failed)
    }
}

/// One invocation record as reported by list-command-invocations.
#[derive(Debug, Clone)]
pub struct InvocationRecord {
    pub instance_id: String,
    pub status: InvocationState,
    /// Output text of each command plugin, in plugin order.
    pub outputs: Vec<String>,
}

/// Outcome of waiting on a single command invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandOutcome {
    Succeeded,
    Failed,
    TimedOut,
}

/// Bounded polling policy for command completion.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    /// Fixed interval between polls
    pub interval: Duration,
    /// Maximum total time to wait before giving up
    pub max_wait: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_wait: Duration::from_secs(300),
        }
    }
}

/// The slice of the SSM command API the toolkit uses, behind a trait so the
/// poll loops are testable with a scripted fake.
#[async_trait]
pub trait CommandApi: Send + Sync {
    /// Submit a command; returns the command ID.
    async fn send_command(
        &self,
        instance_ids: &[String],
        document_name: &str,
        parameters: HashMap<String, Vec<String>>,
    ) -> Result<String>;

    /// Fetch invocation records for a command, optionally scoped to one
    /// instance. An empty list right after submission is normal; the
    /// service has not propagated state yet.
    async fn list_invocations(
        &self,
        command_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<InvocationRecord>>;

    /// Best-effort cancellation of an in-flight command.
    async fn cancel_command(&self, command_id: &str) -> Result<()>;
}

/// Real implementation backed by the SSM client.
#[derive(Debug, Clone)]
pub struct SsmCommandApi {
    ssm: SsmClient,
}

impl SsmCommandApi {
    pub fn new(ssm: SsmClient) -> Self {
        Self { ssm }
    }
}

#[async_trait]
impl CommandApi for SsmCommandApi {
    async fn send_command(
        &self,
        instance_ids: &[String],
        document_name: &str,
        parameters: HashMap<String, Vec<String>>,
    ) -> Result<String> {
        let response = self
            .ssm
            .send_command()
            .set_instance_ids(Some(instance_ids.to_vec()))
            .document_name(document_name)
            .set_parameters(Some(parameters))
            .send()
            .await
            .map_err(|e| AwsError::service("send-command", e))?;

        let command_id = response
            .command()
            .and_then(|c| c.command_id())
            .ok_or(AwsError::MissingCommandId)?
            .to_string();

        debug!(
            "sent {} to {} instance(s): command {}",
            document_name,
            instance_ids.len(),
            command_id
        );
        Ok(command_id)
    }

    async fn list_invocations(
        &self,
        command_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<InvocationRecord>> {
        let mut request = self
            .ssm
            .list_command_invocations()
            .command_id(command_id)
            .details(true);

        if let Some(id) = instance_id {
            request = request.instance_id(id);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AwsError::service("list-command-invocations", e))?;

        let records = response
            .command_invocations()
            .iter()
            .map(|invocation| InvocationRecord {
                instance_id: invocation.instance_id().unwrap_or_default().to_string(),
                status: InvocationState::from_sdk(invocation.status()),
                outputs: invocation
                    .command_plugins()
                    .iter()
                    .filter_map(|plugin| plugin.output())
                    .map(str::to_string)
                    .collect(),
            })
            .collect();

        Ok(records)
    }

    async fn cancel_command(&self, command_id: &str) -> Result<()> {
        self.ssm
            .cancel_command()
            .command_id(command_id)
            .send()
            .await
            .map_err(|e| AwsError::service("cancel-command", e))?;
        Ok(())
    }
}

/// Submit shell commands to a set of instances via AWS-RunShellScript.
pub async fn run_shell_script(
    api: &dyn CommandApi,
    instance_ids: &[String],
    commands: Vec<String>,
) -> Result<String> {
    let mut parameters = HashMap::new();
    parameters.insert("commands".to_string(), commands);
    api.send_command(instance_ids, "AWS-RunShellScript", parameters)
        .await
}

/// Poll a single invocation until it settles or the policy's maximum wait
/// elapses. An empty invocation list keeps polling: it is the normal state
/// immediately after submission.
pub async fn wait_for_command(
    api: &dyn CommandApi,
    command_id: &str,
    instance_id: &str,
    policy: &PollPolicy,
) -> Result<CommandOutcome> {
    let started = Instant::now();

    loop {
        let invocations = api.list_invocations(command_id, Some(instance_id)).await?;

        match invocations.first().map(|invocation| invocation.status) {
            Some(InvocationState::Success) => return Ok(CommandOutcome::Succeeded),
            Some(InvocationState::Failed) => return Ok(CommandOutcome::Failed),
            other => {
                debug!(
                    "command {} on {} not settled yet (status {:?})",
                    command_id, instance_id, other
                );
            }
        }

        if started.elapsed() >= policy.max_wait {
            warn!(
                "command {} on {} still running after {:?}, giving up",
                command_id, instance_id, policy.max_wait
            );
            return Ok(CommandOutcome::TimedOut);
        }

        sleep(policy.interval).await;
    }
}

/// Poll a fleet command until every reported invocation has settled.
/// Returns the final invocation set, with per-plugin output text.
pub async fn wait_for_fleet(
    api: &dyn CommandApi,
    command_id: &str,
    policy: &PollPolicy,
) -> Result<Vec<InvocationRecord>> {
    let started = Instant::now();

    loop {
        let invocations = api.list_invocations(command_id, None).await?;

        let all_settled = !invocations.is_empty()
            && invocations
                .iter()
                .all(|invocation| invocation.status.is_settled());

        if all_settled {
            return Ok(invocations);
        }

        if started.elapsed() >= policy.max_wait {
            return Err(CommandError::TimedOut {
                command_id: command_id.to_string(),
                waited_secs: policy.max_wait.as_secs(),
            }
            .into());
        }

        sleep(policy.interval).await;
    }
}

/// Output text of the first plugin of a settled invocation.
pub async fn command_output(
    api: &dyn CommandApi,
    command_id: &str,
    instance_id: &str,
) -> Result<String> {
    let invocations = api.list_invocations(command_id, Some(instance_id)).await?;

    invocations
        .first()
        .and_then(|invocation| invocation.outputs.first())
        .map(|output| output.to_string())
        .ok_or_else(|| {
            CommandError::MissingOutput {
                command_id: command_id.to_string(),
                instance_id: instance_id.to_string(),
            }
            .into()
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolkitError;
    use std::sync::Mutex;

    /// Scripted CommandApi: each call to list_invocations pops the next
    /// canned response; the last one repeats.
    struct ScriptedApi {
        responses: Mutex<Vec<Vec<InvocationRecord>>>,
    }

    impl ScriptedApi {
        fn new(mut responses: Vec<Vec<InvocationRecord>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl CommandApi for ScriptedApi {
        async fn send_command(
            &self,
            _instance_ids: &[String],
            _document_name: &str,
            _parameters: HashMap<String, Vec<String>>,
        ) -> Result<String> {
            Ok("cmd-1".to_string())
        }

        async fn list_invocations(
            &self,
            _command_id: &str,
            _instance_id: Option<&str>,
        ) -> Result<Vec<InvocationRecord>> {
            let mut responses = self.responses.lock().unwrap();
            if responses.len() > 1 {
                Ok(responses.pop().unwrap())
            } else {
                Ok(responses.last().cloned().unwrap_or_default())
            }
        }

        async fn cancel_command(&self, _command_id: &str) -> Result<()> {
            Ok(())
        }
    }

    fn record(instance_id: &str, status: InvocationState) -> InvocationRecord {
        InvocationRecord {
            instance_id: instance_id.to_string(),
            status,
            outputs: vec!["output".to_string()],
        }
    }

    fn quick_policy() -> PollPolicy {
        PollPolicy {
            interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(60),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_only_on_exact_success_status() {
        let api = ScriptedApi::new(vec![
            vec![],
            vec![record("i-aaa", InvocationState::Pending)],
            vec![record("i-aaa", InvocationState::InProgress)],
            vec![record("i-aaa", InvocationState::Success)],
        ]);

        let outcome = wait_for_command(&api, "cmd-1", "i-aaa", &quick_policy())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn fails_only_on_exact_failed_status() {
        let api = ScriptedApi::new(vec![
            vec![record("i-aaa", InvocationState::InProgress)],
            vec![record("i-aaa", InvocationState::Failed)],
        ]);

        let outcome = wait_for_command(&api, "cmd-1", "i-aaa", &quick_policy())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_polling_through_empty_invocation_lists() {
        // Empty list right after submission must not be treated as terminal.
        let api = ScriptedApi::new(vec![
            vec![],
            vec![],
            vec![record("i-aaa", InvocationState::Success)],
        ]);

        let outcome = wait_for_command(&api, "cmd-1", "i-aaa", &quick_policy())
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn non_terminal_statuses_time_out_under_the_policy() {
        // Cancelled is not Success/Failed, so the bounded policy kicks in.
        let api = ScriptedApi::new(vec![vec![record("i-aaa", InvocationState::Cancelled)]]);

        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(100),
        };
        let outcome = wait_for_command(&api, "cmd-1", "i-aaa", &policy)
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_wait_returns_when_all_invocations_settle() {
        let api = ScriptedApi::new(vec![
            vec![
                record("i-aaa", InvocationState::Success),
                record("i-bbb", InvocationState::InProgress),
            ],
            vec![
                record("i-aaa", InvocationState::Success),
                record("i-bbb", InvocationState::Failed),
            ],
        ]);

        let invocations = wait_for_fleet(&api, "cmd-1", &quick_policy())
            .await
            .unwrap();
        assert_eq!(invocations.len(), 2);
        assert_eq!(invocations[0].status, InvocationState::Success);
        assert_eq!(invocations[1].status, InvocationState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn fleet_wait_times_out_as_an_error() {
        let api = ScriptedApi::new(vec![vec![record("i-aaa", InvocationState::InProgress)]]);

        let policy = PollPolicy {
            interval: Duration::from_millis(10),
            max_wait: Duration::from_millis(50),
        };
        let err = wait_for_fleet(&api, "cmd-1", &policy).await.unwrap_err();
        assert!(matches!(
            err,
            ToolkitError::Command(CommandError::TimedOut { .. })
        ));
    }

    #[tokio::test]
    async fn command_output_returns_first_plugin_output() {
        let api = ScriptedApi::new(vec![vec![record("i-aaa", InvocationState::Success)]]);

        let output = command_output(&api, "cmd-1", "i-aaa").await.unwrap();
        assert_eq!(output, "output");
    }

    #[tokio::test]
    async fn command_output_without_invocations_is_an_error() {
        let api = ScriptedApi::new(vec![vec![]]);

        let err = command_output(&api, "cmd-1", "i-aaa").await.unwrap_err();
        assert!(matches!(
            err,
            ToolkitError::Command(CommandError::MissingOutput { .. })
        ));
    }
}
