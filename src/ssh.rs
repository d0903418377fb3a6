use crate::aws::AwsContext;
use crate::error::{Result, SessionError, ToolkitError};
use crate::resolve::resolve_instance;
use crate::session::run_foreground;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

/// ssh options that take a value, so the scan for the destination knows to
/// skip the token after them. Mirrors the option list of OpenSSH's client.
const VALUE_OPTIONS: &str = "BbcDEeFIiJLlmOopQRSWw";

fn config_path() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssm_ssh_conf"))
        .ok_or_else(|| SessionError::HomeDirUnavailable.into())
}

/// Render the ssh config that routes instance-ID hosts through an SSM
/// ProxyCommand, using the context's profile and region flags.
pub(crate) fn render_config(cli_args: &[String]) -> String {
    let mut aws = String::from("aws");
    for arg in cli_args {
        aws.push(' ');
        aws.push_str(arg);
    }
    format!(
        "# SSH over Session Manager\n\
         host i-* mi-*\n\
         \tProxyCommand sh -c \"{aws} ssm start-session --target %h --document-name AWS-StartSSHSession --parameters 'portNumber=%p'\"\n"
    )
}

/// Find the destination token among ssh arguments: the first bare word that
/// is neither a flag nor the value of a value-taking option. Returns its
/// index alongside the token.
pub(crate) fn find_destination(args: &[String]) -> Result<(usize, String)> {
    let mut skip_next = false;
    for (index, arg) in args.iter().enumerate() {
        if skip_next {
            skip_next = false;
            continue;
        }
        if let Some(rest) = arg.strip_prefix('-') {
            // A lone value-taking flag consumes the next token; a flag with
            // its value attached (-p2222) does not.
            if rest.len() == 1 && rest.chars().all(|c| VALUE_OPTIONS.contains(c)) {
                skip_next = true;
            }
            continue;
        }
        return Ok((index, arg.clone()));
    }
    Err(ToolkitError::Usage(
        "no ssh destination found in the arguments".to_string(),
    ))
}

/// Split `user@host` into its parts; a bare host has no user.
pub(crate) fn split_destination(destination: &str) -> (Option<&str>, &str) {
    match destination.split_once('@') {
        Some((user, host)) => (Some(user), host),
        None => (None, destination),
    }
}

/// The `ssh` subcommand: write the ProxyCommand config, resolve whatever
/// host the user named into an instance ID and exec ssh with the remaining
/// arguments untouched.
pub async fn cmd_ssh(ctx: &AwsContext, args: &[String]) -> Result<()> {
    let config = config_path()?;
    tokio::fs::write(&config, render_config(&ctx.cli_args())).await?;
    debug!("wrote ssh config to {:?}", config);

    let (index, destination) = find_destination(args)?;
    let (user, host) = split_destination(&destination);
    let instance_id = resolve_instance(ctx, host).await?;

    let mut rewritten = args.to_vec();
    rewritten[index] = match user {
        Some(user) => format!("{user}@{instance_id}"),
        None => instance_id.clone(),
    };

    info!("ssh to {} ({})", host, instance_id);
    let mut command = Command::new("ssh");
    command.arg("-F").arg(&config).args(&rewritten);
    run_foreground(command, "ssh").await
}
