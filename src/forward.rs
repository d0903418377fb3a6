use crate::aws::AwsContext;
use crate::command::{
    command_output, run_shell_script, wait_for_command, CommandApi, CommandOutcome, PollPolicy,
    SsmCommandApi,
};
use crate::error::{CommandError, Result, SessionError, ToolkitError};
use crate::resolve::resolve_instance;
use crate::session::{aws_cli, run_foreground};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::Child;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const PORT_FORWARD_DOCUMENT: &str = "AWS-StartPortForwardingSession";

/// Time allowed for the SSM session plugin to start listening locally
/// before the chained ssh tunnel is abandoned.
const SESSION_LISTEN_WAIT: Duration = Duration::from_secs(60);
const LISTEN_PROBE_INTERVAL: Duration = Duration::from_millis(150);

/// A port-forward request as it arrives from the command line.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    /// `host:port` for a direct forward, or a bare host when `remote` is set
    pub target: String,
    /// Local port the forwarded service appears on
    pub local_port: u16,
    /// Onward `host:port` reachable from the target instance
    pub remote: Option<String>,
}

/// Split a `host:port` endpoint.
pub(crate) fn parse_endpoint(endpoint: &str) -> Result<(String, u16)> {
    let (host, port) = endpoint.rsplit_once(':').ok_or_else(|| {
        ToolkitError::Usage(format!("'{endpoint}' is not of the form host:port"))
    })?;

    if host.is_empty() {
        return Err(ToolkitError::Usage(format!(
            "'{endpoint}' is not of the form host:port"
        )));
    }

    let port: u16 = port.parse().map_err(|_| {
        ToolkitError::Usage(format!("'{port}' is not a valid port number"))
    })?;
    Ok((host.to_string(), port))
}

/// Reject privileged and already-bound local ports before any AWS call.
pub(crate) fn check_local_port(port: u16) -> Result<()> {
    if port < 1024 {
        return Err(SessionError::PrivilegedPort { port }.into());
    }
    match std::net::TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => Ok(()),
        Err(_) => Err(SessionError::PortUnavailable { port }.into()),
    }
}

/// Pick a free local port for the intermediate SSM session.
fn ephemeral_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// A throwaway login account provisioned on the target instance so the
/// chained ssh tunnel has something to authenticate as. Held as a guard:
/// `release` tears down the remote account and the local key, and dropping
/// an unreleased guard still removes the key.
#[derive(Debug)]
struct TunnelUser {
    name: String,
    instance_id: String,
    key_path: PathBuf,
    released: bool,
}

impl TunnelUser {
    async fn provision(
        api: &dyn CommandApi,
        instance_id: &str,
        policy: &PollPolicy,
        key_dir: &Path,
    ) -> Result<TunnelUser> {
        let name = format!("tunneluser_{}", &Uuid::new_v4().to_string()[..18]);
        info!("provisioning tunnel user {} on {}", name, instance_id);

        let script = vec![
            format!("useradd {name}"),
            format!("su {name} -c 'mkdir -p ~/.ssh'"),
            format!("su {name} -c \"ssh-keygen -t rsa -b 1024 -q -N '' -f ~/.ssh/id_rsa\""),
            format!("su {name} -c 'cp ~/.ssh/id_rsa.pub ~/.ssh/authorized_keys'"),
            format!("cat /home/{name}/.ssh/id_rsa"),
        ];
        let command_id = run_shell_script(api, &[instance_id.to_string()], script).await?;

        match wait_for_command(api, &command_id, instance_id, policy).await? {
            CommandOutcome::Succeeded => {}
            CommandOutcome::Failed => {
                return Err(SessionError::TunnelUserFailed {
                    user: name,
                    instance_id: instance_id.to_string(),
                }
                .into());
            }
            CommandOutcome::TimedOut => {
                if let Err(err) = api.cancel_command(&command_id).await {
                    warn!("could not cancel command {}: {}", command_id, err);
                }
                return Err(CommandError::TimedOut {
                    command_id,
                    waited_secs: policy.max_wait.as_secs(),
                }
                .into());
            }
        }

        let private_key = command_output(api, &command_id, instance_id).await?;
        let key_path = key_dir.join(format!("{name}.pem"));
        tokio::fs::write(&key_path, private_key).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&key_path, std::fs::Permissions::from_mode(0o600)).await?;
        }

        Ok(TunnelUser {
            name,
            instance_id: instance_id.to_string(),
            key_path,
            released: false,
        })
    }

    /// Best-effort teardown. Every failure is logged rather than raised:
    /// the forward itself already ended and a leftover throwaway account
    /// must not mask its outcome.
    async fn release(mut self, api: &dyn CommandApi, policy: &PollPolicy) {
        let script = vec![
            format!("userdel {}", self.name),
            format!("rm -rf /home/{}/", self.name),
        ];
        match run_shell_script(api, &[self.instance_id.clone()], script).await {
            Ok(command_id) => {
                match wait_for_command(api, &command_id, &self.instance_id, policy).await {
                    Ok(CommandOutcome::Succeeded) => {
                        debug!("tunnel user {} removed from {}", self.name, self.instance_id)
                    }
                    Ok(outcome) => warn!(
                        "removal of tunnel user {} on {} ended as {:?}; remove it manually",
                        self.name, self.instance_id, outcome
                    ),
                    Err(err) => warn!(
                        "could not confirm removal of tunnel user {} on {}: {}",
                        self.name, self.instance_id, err
                    ),
                }
            }
            Err(err) => warn!(
                "could not remove tunnel user {} on {}: {}",
                self.name, self.instance_id, err
            ),
        }

        if let Err(err) = std::fs::remove_file(&self.key_path) {
            warn!("could not remove key file {:?}: {}", self.key_path, err);
        }
        self.released = true;
    }
}

impl Drop for TunnelUser {
    fn drop(&mut self) {
        // Last resort for early-error paths; release() is the real cleanup.
        if !self.released {
            let _ = std::fs::remove_file(&self.key_path);
        }
    }
}

/// Probe until something listens on the local port, up to `cap`.
async fn wait_for_listen(port: u16, cap: Duration) -> bool {
    let started = tokio::time::Instant::now();
    loop {
        if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return true;
        }
        if started.elapsed() >= cap {
            return false;
        }
        tokio::time::sleep(LISTEN_PROBE_INTERVAL).await;
    }
}

/// The `forward` subcommand.
pub async fn cmd_forward(ctx: &AwsContext, request: ForwardRequest, policy: &PollPolicy) -> Result<()> {
    check_local_port(request.local_port)?;

    match &request.remote {
        None => direct_forward(ctx, &request).await,
        Some(remote) => {
            let (remote_host, remote_port) = parse_endpoint(remote)?;
            remote_forward(ctx, &request, &remote_host, remote_port, policy).await
        }
    }
}

/// Forward a port of the target instance itself through a single SSM
/// session in the foreground.
async fn direct_forward(ctx: &AwsContext, request: &ForwardRequest) -> Result<()> {
    let (host, remote_port) = parse_endpoint(&request.target)?;
    let instance_id = resolve_instance(ctx, &host).await?;

    info!(
        "forwarding localhost:{} to {}:{} ({})",
        request.local_port, host, remote_port, instance_id
    );
    let mut command = aws_cli(ctx);
    command
        .arg("ssm")
        .arg("start-session")
        .arg("--target")
        .arg(&instance_id)
        .arg("--document-name")
        .arg(PORT_FORWARD_DOCUMENT)
        .arg("--parameters")
        .arg(format!(
            "portNumber={},localPortNumber={}",
            remote_port, request.local_port
        ));
    run_foreground(command, "aws").await
}

/// Forward to a host reachable only from the target instance: provision a
/// tunnel user, open an SSM session to the instance's sshd on an ephemeral
/// local port, and chain `ssh -L` through it.
async fn remote_forward(
    ctx: &AwsContext,
    request: &ForwardRequest,
    remote_host: &str,
    remote_port: u16,
    policy: &PollPolicy,
) -> Result<()> {
    let instance_id = resolve_instance(ctx, &request.target).await?;
    let api = SsmCommandApi::new(ctx.ssm.clone());
    let key_dir = dirs::home_dir().ok_or(SessionError::HomeDirUnavailable)?;

    let user = TunnelUser::provision(&api, &instance_id, policy, &key_dir).await?;
    let session_port = match ephemeral_port() {
        Ok(port) => port,
        Err(err) => {
            user.release(&api, policy).await;
            return Err(err);
        }
    };

    let ssh_child: Arc<Mutex<Option<Child>>> = Arc::new(Mutex::new(None));
    let tunnel_task = {
        let ssh_child = Arc::clone(&ssh_child);
        let forward_spec = format!("{}:{}:{}", request.local_port, remote_host, remote_port);
        let key_path = user.key_path.clone();
        let login = format!("{}@localhost", user.name);
        tokio::spawn(async move {
            if !wait_for_listen(session_port, SESSION_LISTEN_WAIT).await {
                warn!("session never started listening on port {}", session_port);
                return;
            }
            let mut command = tokio::process::Command::new("ssh");
            command
                .arg("-N")
                .arg("-L")
                .arg(&forward_spec)
                .arg("-i")
                .arg(&key_path)
                .arg(&login)
                .arg("-p")
                .arg(session_port.to_string())
                .arg("-o")
                .arg("StrictHostKeyChecking=no")
                .arg("-o")
                .arg("UserKnownHostsFile=/dev/null")
                .arg("-o")
                .arg("LogLevel=error");
            match command.spawn() {
                Ok(child) => {
                    debug!("ssh tunnel up: -L {}", forward_spec);
                    *ssh_child.lock().await = Some(child);
                }
                Err(err) => warn!("could not start ssh tunnel: {}", err),
            }
        })
    };

    info!(
        "forwarding localhost:{} to {}:{} via {}",
        request.local_port, remote_host, remote_port, instance_id
    );
    let result = run_session(ctx, &instance_id, session_port).await;

    tunnel_task.abort();
    if let Some(mut child) = ssh_child.lock().await.take() {
        if let Err(err) = child.kill().await {
            warn!("could not stop ssh tunnel: {}", err);
        }
    }
    user.release(&api, policy).await;
    result
}

/// Foreground SSM session to the instance's sshd, interruptible by Ctrl-C.
async fn run_session(ctx: &AwsContext, instance_id: &str, session_port: u16) -> Result<()> {
    let mut command = aws_cli(ctx);
    command
        .arg("ssm")
        .arg("start-session")
        .arg("--target")
        .arg(instance_id)
        .arg("--document-name")
        .arg(PORT_FORWARD_DOCUMENT)
        .arg("--parameters")
        .arg(format!("portNumber=22,localPortNumber={session_port}"));

    let mut child = command.spawn().map_err(|e| SessionError::SpawnFailed {
        program: "aws".to_string(),
        reason: e.to_string(),
    })?;

    tokio::select! {
        status = child.wait() => {
            let status = status.map_err(|e| SessionError::SpawnFailed {
                program: "aws".to_string(),
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
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting the session down");
            if let Err(err) = child.kill().await {
                warn!("could not stop session process: {}", err);
            }
            Ok(())
        }
    }
}
