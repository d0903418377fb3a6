use crate::aws::AwsContext;
use crate::command::{wait_for_command, CommandApi, CommandOutcome, PollPolicy, SsmCommandApi};
use crate::error::{CommandError, Result, SessionError};
use crate::resolve::resolve_instance;
use std::collections::HashMap;
use tokio::process::Command;
use tracing::{info, warn};

const RUN_AS_DOCUMENT: &str = "CreateRunAsUser";
const INTERACTIVE_DOCUMENT: &str = "AWS-StartInteractiveCommand";

/// Build an `aws` CLI invocation carrying the context's profile and region.
pub(crate) fn aws_cli(ctx: &AwsContext) -> Command {
    let mut command = Command::new("aws");
    command.args(ctx.cli_args());
    command
}

/// Run a child with inherited stdio, surfacing a non-zero exit as an error.
pub(crate) async fn run_foreground(mut command: Command, program: &str) -> Result<()> {
    let status = command.status().await.map_err(|e| SessionError::SpawnFailed {
        program: program.to_string(),
        reason: e.to_string(),
    })?;

    if status.success() {
        Ok(())
    } else {
        Err(SessionError::SessionExited {
            code: status.code().unwrap_or(-1),
        }
        .into())
    }
}

/// Provision a login user on the instance via the CreateRunAsUser document,
/// so the interactive session lands in a personal account instead of
/// ssm-user. An account without the document still gets a session; the
/// submission failure only costs the personalized user.
pub async fn ensure_run_as_user(
    api: &dyn CommandApi,
    instance_id: &str,
    user: &str,
    policy: &PollPolicy,
) -> Result<()> {
    let mut parameters = HashMap::new();
    parameters.insert("user".to_string(), vec![user.to_string()]);

    let command_id = match api
        .send_command(&[instance_id.to_string()], RUN_AS_DOCUMENT, parameters)
        .await
    {
        Ok(command_id) => command_id,
        Err(err) => {
            warn!(
                "could not submit {} ({}); connecting as the default session user",
                RUN_AS_DOCUMENT, err
            );
            return Ok(());
        }
    };

    match wait_for_command(api, &command_id, instance_id, policy).await? {
        CommandOutcome::Succeeded => Ok(()),
        CommandOutcome::Failed => Err(SessionError::RunAsUserFailed {
            user: user.to_string(),
            instance_id: instance_id.to_string(),
        }
        .into()),
        CommandOutcome::TimedOut => Err(CommandError::TimedOut {
            command_id,
            waited_secs: policy.max_wait.as_secs(),
        }
        .into()),
    }
}

/// The `connect` subcommand: resolve the target, provision a run-as user
/// named after the caller identity, then hand the terminal to an
/// interactive SSM session that switches to that user.
pub async fn cmd_connect(ctx: &AwsContext, target: &str, policy: &PollPolicy) -> Result<()> {
    let instance_id = resolve_instance(ctx, target).await?;
    let user = ctx.caller_user().await?;

    let api = SsmCommandApi::new(ctx.ssm.clone());
    ensure_run_as_user(&api, &instance_id, &user, policy).await?;

    info!("starting interactive session on {} as {}", instance_id, user);
    let mut command = aws_cli(ctx);
    command
        .arg("ssm")
        .arg("start-session")
        .arg("--target")
        .arg(&instance_id)
        .arg("--document-name")
        .arg(INTERACTIVE_DOCUMENT)
        .arg("--parameters")
        .arg(format!("command=sudo su - {user}"));

    run_foreground(command, "aws").await
}
