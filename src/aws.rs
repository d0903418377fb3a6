use crate::error::{AwsError, Result};
use aws_config::{BehaviorVersion, Region};
use aws_sdk_ec2::Client as Ec2Client;
use aws_sdk_ssm::Client as SsmClient;
use aws_sdk_sts::Client as StsClient;
use tracing::{debug, info};

/// AWS clients and resolved settings for one CLI invocation.
///
/// Built once at process start and passed explicitly to everything that
/// talks to AWS, so there is no process-wide client state.
#[derive(Debug, Clone)]
pub struct AwsContext {
    pub ssm: SsmClient,
    pub ec2: Ec2Client,
    pub sts: StsClient,
    region: String,
    profile: Option<String>,
}

impl AwsContext {
    /// Create a context from the default AWS configuration chain, with
    /// optional profile and region overrides.
    pub async fn new(profile: Option<String>, region: Option<String>) -> Result<Self> {
        info!(
            "Initializing AWS context with region: {:?}, profile: {:?}",
            region, profile
        );

        let mut config_loader = aws_config::defaults(BehaviorVersion::latest());

        if let Some(ref region_name) = region {
            config_loader = config_loader.region(Region::new(region_name.clone()));
        }

        if let Some(ref profile_name) = profile {
            config_loader = config_loader.profile_name(profile_name);
        }

        let config = config_loader.load().await;

        let ssm = SsmClient::new(&config);
        let ec2 = Ec2Client::new(&config);
        let sts = StsClient::new(&config);

        let region_name = config
            .region()
            .map(|r| r.as_ref().to_string())
            .unwrap_or_else(|| "us-east-1".to_string());

        debug!("AWS clients initialized for region {}", region_name);

        Ok(Self {
            ssm,
            ec2,
            sts,
            region: region_name,
            profile,
        })
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn profile(&self) -> Option<&str> {
        self.profile.as_deref()
    }

    /// Arguments identifying this context when shelling out to the `aws` CLI.
    pub fn cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(profile) = &self.profile {
            args.push("--profile".to_string());
            args.push(profile.clone());
        }
        args.push("--region".to_string());
        args.push(self.region.clone());
        args
    }

    /// Session user derived from the STS caller identity ARN.
    pub async fn caller_user(&self) -> Result<String> {
        let identity = self
            .sts
            .get_caller_identity()
            .send()
            .await
            .map_err(|e| AwsError::service("get-caller-identity", e))?;

        let arn = identity.arn().ok_or(AwsError::MissingIdentity)?;
        let user = user_from_arn(arn);
        debug!("caller identity user: {}", user);
        Ok(user.to_string())
    }
}

/// Last path segment of an STS caller identity ARN, e.g. the session name of
/// an assumed role or the user name of an IAM user.
pub(crate) fn user_from_arn(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assumed_role_arn_yields_session_name() {
        let arn = "arn:aws:sts::123456789012:assumed-role/SREAccess/chris";
        assert_eq!(user_from_arn(arn), "chris");
    }

    #[test]
    fn iam_user_arn_yields_user_name() {
        let arn = "arn:aws:iam::123456789012:user/justin";
        assert_eq!(user_from_arn(arn), "justin");
    }

    #[test]
    fn arn_without_slash_is_returned_whole() {
        assert_eq!(user_from_arn("root"), "root");
    }
}
