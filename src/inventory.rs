use crate::aws::AwsContext;
use crate::config::CacheConfig;
use crate::error::{AwsError, Result, SessionError, ToolkitError};
use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::Filter;
use aws_sdk_ssm::types::{InstanceInformationStringFilter, ResourceType};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// One SSM-managed instance with its EC2 details merged in.
/// Assembled fresh on every invocation; nothing is read back from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRecord {
    pub instance_id: String,
    pub host_name: String,
    pub instance_name: String,
    pub addresses: Vec<String>,
}

fn stale_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"The instance ID '(.*?)' does not exist").expect("hard-coded pattern")
    })
}

/// Pull the offending instance ID out of an InvalidInstanceID.NotFound
/// error message.
pub(crate) fn stale_instance_id(message: &str) -> Option<String> {
    stale_id_re()
        .captures(message)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_string())
}

/// Parse an awscli-style filter argument: Name=key,Values=v1,v2
pub(crate) fn parse_filter(arg: &str) -> Result<Filter> {
    let rest = arg
        .strip_prefix("Name=")
        .ok_or_else(|| ToolkitError::Usage(format!("invalid filter '{arg}': expected Name=key,Values=v1,v2")))?;

    let (name, values) = rest
        .split_once(",Values=")
        .ok_or_else(|| ToolkitError::Usage(format!("invalid filter '{arg}': missing Values=")))?;

    if name.is_empty() || values.is_empty() {
        return Err(ToolkitError::Usage(format!(
            "invalid filter '{arg}': empty key or values"
        )));
    }

    Ok(Filter::builder()
        .name(name)
        .set_values(Some(values.split(',').map(str::to_string).collect()))
        .build())
}

/// List instances registered in SSM with their EC2 details.
pub async fn collect(ctx: &AwsContext, filters: Vec<Filter>) -> Result<Vec<InstanceRecord>> {
    let mut instances = ssm_inventory(ctx).await?;
    if instances.is_empty() {
        return Ok(Vec::new());
    }

    merge_ec2_details(ctx, &mut instances, &filters).await?;

    // Instances the detail merge could not describe carry no addresses and
    // are dropped from the listing.
    let mut records: Vec<InstanceRecord> = instances
        .into_values()
        .filter(|record| !record.addresses.is_empty())
        .collect();

    records.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
    Ok(records)
}

fn sort_key(record: &InstanceRecord) -> String {
    if record.instance_name.is_empty() {
        record.host_name.clone()
    } else {
        record.instance_name.clone()
    }
}

/// Online EC2 instances from the SSM inventory, keyed by instance ID.
async fn ssm_inventory(ctx: &AwsContext) -> Result<BTreeMap<String, InstanceRecord>> {
    let ping_filter = InstanceInformationStringFilter::builder()
        .key("PingStatus")
        .values("Online")
        .build()
        .map_err(|e| AwsError::service("describe-instance-information", e))?;

    let mut instances = BTreeMap::new();
    let mut pages = ctx
        .ssm
        .describe_instance_information()
        .filters(ping_filter)
        .into_paginator()
        .send();

    while let Some(page) = pages.next().await {
        let page = page.map_err(|e| AwsError::service("describe-instance-information", e))?;
        for info in page.instance_information_list() {
            if info.resource_type() != Some(&ResourceType::Ec2Instance) {
                debug!("skipping non-EC2 inventory entity: {:?}", info.instance_id());
                continue;
            }
            let Some(instance_id) = info.instance_id() else {
                continue;
            };

            instances.insert(
                instance_id.to_string(),
                InstanceRecord {
                    instance_id: instance_id.to_string(),
                    host_name: info.computer_name().unwrap_or_default().to_string(),
                    instance_name: String::new(),
                    addresses: Vec::new(),
                },
            );
        }
    }

    debug!("SSM inventory holds {} online instance(s)", instances.len());
    Ok(instances)
}

enum DetailFetch {
    Done(Vec<InstanceDetail>),
    Stale(String),
}

struct InstanceDetail {
    instance_id: String,
    private_ip: Option<String>,
    public_ip: Option<String>,
    name_tag: Option<String>,
}

/// Merge addresses and Name tags from describe-instances into the SSM
/// inventory. When EC2 reports a stale instance ID that vanished since the
/// inventory call, the ID is dropped and the remaining set is retried; this
/// is the only retried failure in the toolkit.
async fn merge_ec2_details(
    ctx: &AwsContext,
    instances: &mut BTreeMap<String, InstanceRecord>,
    filters: &[Filter],
) -> Result<()> {
    loop {
        if instances.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = instances.keys().cloned().collect();

        match fetch_details(ctx, ids, filters).await? {
            DetailFetch::Done(details) => {
                for detail in details {
                    let Some(record) = instances.get_mut(&detail.instance_id) else {
                        continue;
                    };
                    if let Some(ip) = detail.private_ip {
                        record.addresses.push(ip);
                    }
                    if let Some(ip) = detail.public_ip {
                        record.addresses.push(ip);
                    }
                    if let Some(name) = detail.name_tag {
                        record.instance_name = name;
                    }
                    debug!("updated instance {}: {:?}", record.instance_id, record);
                }
                return Ok(());
            }
            DetailFetch::Stale(stale_id) => {
                if instances.remove(&stale_id).is_some() {
                    warn!("instance {} disappeared, retrying without it", stale_id);
                } else {
                    // The reported ID is not one we asked about; re-raising
                    // avoids a retry loop that can never converge.
                    return Err(AwsError::ServiceError {
                        operation: "describe-instances".to_string(),
                        message: format!("unexpected stale instance ID {stale_id}"),
                    }
                    .into());
                }
            }
        }
    }
}

async fn fetch_details(
    ctx: &AwsContext,
    ids: Vec<String>,
    filters: &[Filter],
) -> Result<DetailFetch> {
    let mut details = Vec::new();
    let mut pages = ctx
        .ec2
        .describe_instances()
        .set_instance_ids(Some(ids))
        .set_filters(if filters.is_empty() {
            None
        } else {
            Some(filters.to_vec())
        })
        .into_paginator()
        .send();

    while let Some(page) = pages.next().await {
        let page = match page {
            Ok(page) => page,
            Err(err) => {
                if err.code() == Some("InvalidInstanceID.NotFound") {
                    if let Some(stale) = stale_instance_id(err.message().unwrap_or_default()) {
                        return Ok(DetailFetch::Stale(stale));
                    }
                }
                return Err(AwsError::service("describe-instances", err).into());
            }
        };

        for reservation in page.reservations() {
            for instance in reservation.instances() {
                let Some(instance_id) = instance.instance_id() else {
                    continue;
                };
                details.push(InstanceDetail {
                    instance_id: instance_id.to_string(),
                    private_ip: instance.private_ip_address().map(str::to_string),
                    public_ip: instance.public_ip_address().map(str::to_string),
                    name_tag: instance
                        .tags()
                        .iter()
                        .find(|tag| tag.key() == Some("Name"))
                        .and_then(|tag| tag.value())
                        .map(str::to_string),
                });
            }
        }
    }

    Ok(DetailFetch::Done(details))
}

/// Render the listing as aligned columns:
/// instance ID, host name, Name tag, addresses.
pub fn render_table(records: &[InstanceRecord]) -> String {
    let host_width = records
        .iter()
        .map(|r| r.host_name.len())
        .max()
        .unwrap_or(1)
        .max(1);
    let name_width = records
        .iter()
        .map(|r| r.instance_name.len())
        .max()
        .unwrap_or(1)
        .max(1);

    let mut table = String::new();
    for record in records {
        table.push_str(&format!(
            "{}   {:<host_width$}   {:<name_width$}   {}\n",
            record.instance_id,
            record.host_name,
            record.instance_name,
            record.addresses.join(" "),
        ));
    }
    table
}

fn cache_path(cache: &CacheConfig) -> Result<PathBuf> {
    match &cache.path {
        Some(path) => Ok(path.clone()),
        None => dirs::home_dir()
            .map(|home| home.join(".ssm_inventory_cache"))
            .ok_or_else(|| SessionError::HomeDirUnavailable.into()),
    }
}

/// Best-effort cache of the last listing. Failures are logged, never fatal;
/// the file is advisory and never read back.
async fn write_cache(cache: &CacheConfig, table: &str) {
    if !cache.enabled {
        return;
    }
    let path = match cache_path(cache) {
        Ok(path) => path,
        Err(err) => {
            warn!("not caching inventory: {}", err);
            return;
        }
    };

    let contents = format!("# cached by ssm-toolkit at {}\n{}", chrono::Local::now().to_rfc3339(), table);
    if let Err(err) = tokio::fs::write(&path, contents).await {
        warn!("cache file {:?} not accessible: {}", path, err);
    }
}

/// The `list` subcommand.
pub async fn cmd_list(ctx: &AwsContext, filter_args: &[String], cache: &CacheConfig) -> Result<()> {
    let filters = filter_args
        .iter()
        .map(|arg| parse_filter(arg))
        .collect::<Result<Vec<Filter>>>()?;

    let records = collect(ctx, filters).await?;
    if records.is_empty() {
        warn!("no instances registered in SSM");
        return Ok(());
    }

    let table = render_table(&records);
    print!("{table}");
    write_cache(cache, &table).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, host: &str, name: &str, addresses: &[&str]) -> InstanceRecord {
        InstanceRecord {
            instance_id: id.to_string(),
            host_name: host.to_string(),
            instance_name: name.to_string(),
            addresses: addresses.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[test]
    fn stale_id_is_parsed_from_error_message() {
        let message = "The instance ID 'i-0abc123' does not exist";
        assert_eq!(stale_instance_id(message), Some("i-0abc123".to_string()));
    }

    #[test]
    fn unrelated_message_yields_no_stale_id() {
        assert_eq!(stale_instance_id("Request limit exceeded"), None);
    }

    #[test]
    fn filter_argument_parses_name_and_values() {
        let filter = parse_filter("Name=tag:Name,Values=web,db").unwrap();
        assert_eq!(filter.name(), Some("tag:Name"));
        assert_eq!(filter.values(), ["web", "db"]);
    }

    #[test]
    fn filter_argument_without_values_is_rejected() {
        assert!(parse_filter("Name=tag:Name").is_err());
        assert!(parse_filter("tag:Name,Values=web").is_err());
        assert!(parse_filter("Name=,Values=web").is_err());
    }

    #[test]
    fn table_columns_align_on_widest_entry() {
        let records = vec![
            record("i-aaa", "host-1", "alpha", &["10.0.0.1", "54.1.2.3"]),
            record("i-bbb", "longer-host-name", "b", &["10.0.0.2"]),
        ];
        let table = render_table(&records);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("i-aaa   host-1             alpha"));
        assert!(lines[1].contains("i-bbb   longer-host-name   b    "));
        assert!(lines[0].ends_with("10.0.0.1 54.1.2.3"));
    }

    #[test]
    fn records_sort_by_name_tag_then_host_name() {
        let mut records = vec![
            record("i-ccc", "zeta-host", "", &["10.0.0.3"]),
            record("i-aaa", "host-1", "web", &["10.0.0.1"]),
            record("i-bbb", "host-2", "db", &["10.0.0.2"]),
        ];
        records.sort_by(|a, b| sort_key(a).cmp(&sort_key(b)));
        let order: Vec<&str> = records.iter().map(|r| r.instance_id.as_str()).collect();
        assert_eq!(order, ["i-bbb", "i-aaa", "i-ccc"]);
    }

    #[tokio::test]
    async fn cache_write_is_best_effort() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("inventory_cache");
        let cache = CacheConfig {
            enabled: true,
            path: Some(path.clone()),
        };

        write_cache(&cache, "i-aaa   host   web   10.0.0.1\n").await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.starts_with("# cached by ssm-toolkit at "));
        assert!(contents.ends_with("i-aaa   host   web   10.0.0.1\n"));

        // An unwritable path must not error out.
        let broken = CacheConfig {
            enabled: true,
            path: Some(tmp.path().join("missing-dir").join("cache")),
        };
        write_cache(&broken, "x\n").await;
    }

    #[tokio::test]
    async fn disabled_cache_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("inventory_cache");
        let cache = CacheConfig {
            enabled: false,
            path: Some(path.clone()),
        };
        write_cache(&cache, "x\n").await;
        assert!(!path.exists());
    }
}
