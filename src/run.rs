use crate::aws::AwsContext;
use crate::command::{run_shell_script, wait_for_fleet, InvocationRecord, PollPolicy, SsmCommandApi};
use crate::error::{ResolveError, Result};
use crate::resolve::resolve_fleet;
use std::collections::HashMap;
use tracing::info;

/// Render fleet output the way the CLI prints it: a header, then one block
/// per invocation labelled with the target the user typed and the instance
/// it resolved to.
pub(crate) fn render_output(
    resolved: &[(String, String)],
    invocations: &[InvocationRecord],
) -> String {
    let targets: HashMap<&str, &str> = resolved
        .iter()
        .map(|(instance_id, target)| (instance_id.as_str(), target.as_str()))
        .collect();

    let mut out = String::from("\n Output\n--------\n");
    for invocation in invocations {
        let target = targets
            .get(invocation.instance_id.as_str())
            .copied()
            .unwrap_or(invocation.instance_id.as_str());
        out.push_str(&format!("{} | {}\n", target, invocation.instance_id));
        for plugin_output in &invocation.outputs {
            out.push_str(plugin_output);
            if !plugin_output.ends_with('\n') {
                out.push('\n');
            }
        }
    }
    out
}

/// The `run` subcommand: resolve every target, fan a shell script out via
/// AWS-RunShellScript, wait for the fleet to settle and print each
/// instance's output. Per-instance failures show up in the output rather
/// than aborting the run.
pub async fn cmd_run(
    ctx: &AwsContext,
    targets: &[String],
    commands: Vec<String>,
    policy: &PollPolicy,
) -> Result<()> {
    let resolved = resolve_fleet(ctx, targets).await?;
    if resolved.is_empty() {
        return Err(ResolveError::NotFound {
            target: targets.join(", "),
        }
        .into());
    }

    let instance_ids: Vec<String> = resolved.iter().map(|(id, _)| id.clone()).collect();
    info!(
        "running {} command(s) on {} instance(s)",
        commands.len(),
        instance_ids.len()
    );

    let api = SsmCommandApi::new(ctx.ssm.clone());
    let command_id = run_shell_script(&api, &instance_ids, commands).await?;
    let invocations = wait_for_fleet(&api, &command_id, policy).await?;

    print!("{}", render_output(&resolved, &invocations));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::InvocationState;

    fn invocation(instance_id: &str, status: InvocationState, outputs: &[&str]) -> InvocationRecord {
        InvocationRecord {
            instance_id: instance_id.to_string(),
            status,
            outputs: outputs.iter().map(|o| o.to_string()).collect(),
        }
    }

    #[test]
    fn output_blocks_are_labelled_with_the_original_target() {
        let resolved = vec![
            ("i-aaa".to_string(), "web-1".to_string()),
            ("i-bbb".to_string(), "10.0.0.2".to_string()),
        ];
        let invocations = vec![
            invocation("i-aaa", InvocationState::Success, &["hello\n"]),
            invocation("i-bbb", InvocationState::Failed, &["oops"]),
        ];

        let out = render_output(&resolved, &invocations);
        assert!(out.starts_with("\n Output\n--------\n"));
        assert!(out.contains("web-1 | i-aaa\nhello\n"));
        assert!(out.contains("10.0.0.2 | i-bbb\noops\n"));
    }

    #[test]
    fn unknown_instance_falls_back_to_its_id() {
        let out = render_output(
            &[],
            &[invocation("i-ccc", InvocationState::Success, &["x\n"])],
        );
        assert!(out.contains("i-ccc | i-ccc\n"));
    }

    #[test]
    fn multiple_plugin_outputs_are_printed_in_order() {
        let out = render_output(
            &[("i-aaa".to_string(), "db".to_string())],
            &[invocation("i-aaa", InvocationState::Success, &["first\n", "second\n"])],
        );
        let first = out.find("first").unwrap();
        let second = out.find("second").unwrap();
        assert!(first < second);
    }
}
