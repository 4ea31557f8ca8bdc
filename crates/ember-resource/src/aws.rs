//! AWS adapters backed by the `aws` CLI.
//!
//! Each verb runs one CLI command with `--output json` and parses the
//! parts of the response the lifecycle needs. Failures are classified
//! from the error code the CLI prints on stderr.

use std::process::Stdio;

use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use ember_core::{AwsConfig, ResourceError, ResourceResult};

use crate::client::{ComputeScaler, ResourceClients, ResourceFuture, RouteController, ServiceController};

const DEFAULT_ROUTE_CIDR: &str = "0.0.0.0/0";

/// Error codes that will not go away by retrying.
const PERMANENT_CODES: &[&str] = &[
    "AccessDenied",
    "UnauthorizedOperation",
    "UnrecognizedClientException",
    "InvalidClientTokenId",
    "ValidationError",
    "InvalidParameter",
    "NotFound",
    "ServiceNotFoundException",
    "ServiceNotActiveException",
    "ClusterNotFoundException",
];

/// Runs `aws` CLI commands.
#[derive(Debug, Clone)]
pub struct AwsCli {
    program: String,
    region: Option<String>,
}

impl AwsCli {
    pub fn new(program: impl Into<String>, region: Option<String>) -> Self {
        Self {
            program: program.into(),
            region,
        }
    }

    /// Run a command and parse its JSON stdout. Empty output parses as `Null`.
    pub async fn run(&self, args: &[&str]) -> ResourceResult<Value> {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg("--output").arg("json");
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.program, ?args, "running aws cli");

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ResourceError::permanent(format!("aws cli '{}' not found", self.program))
            } else {
                ResourceError::transient(format!("failed to spawn aws cli: {e}"))
            }
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_cli_failure(&stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&stdout)
            .map_err(|e| ResourceError::transient(format!("unparsable aws cli output: {e}")))
    }
}

/// Map CLI stderr to a transient or permanent error.
pub fn classify_cli_failure(stderr: &str) -> ResourceError {
    let msg = stderr.trim().to_string();
    if PERMANENT_CODES.iter().any(|code| msg.contains(code)) {
        ResourceError::Permanent(msg)
    } else {
        ResourceError::Transient(msg)
    }
}

/// Build AWS-backed clients for every control plane named in `config`.
pub fn clients(config: &AwsConfig) -> ResourceClients {
    let cli = AwsCli::new(config.cli.clone(), config.region.clone());
    ResourceClients::new(
        std::sync::Arc::new(AsgScaler::new(cli.clone(), &config.autoscaling_group)),
        std::sync::Arc::new(EcsService::new(cli.clone(), &config.cluster, &config.service)),
        std::sync::Arc::new(NatRoute::new(
            cli,
            &config.route_table_id,
            &config.nat_gateway_id,
            config.restore_gateway_id.clone(),
        )),
    )
}

// ── Auto Scaling group ─────────────────────────────────────────────

/// Compute scaler over an EC2 Auto Scaling group.
pub struct AsgScaler {
    cli: AwsCli,
    group: String,
}

impl AsgScaler {
    pub fn new(cli: AwsCli, group: &str) -> Self {
        Self {
            cli,
            group: group.to_string(),
        }
    }
}

impl ComputeScaler for AsgScaler {
    fn set_capacity(&self, n: u32) -> ResourceFuture<'_, ()> {
        Box::pin(async move {
            let n = n.to_string();
            self.cli
                .run(&[
                    "autoscaling",
                    "update-auto-scaling-group",
                    "--auto-scaling-group-name",
                    &self.group,
                    "--desired-capacity",
                    &n,
                    "--min-size",
                    "0",
                ])
                .await?;
            info!(group = %self.group, desired = %n, "set autoscaling group capacity");
            Ok(())
        })
    }

    fn current_capacity(&self) -> ResourceFuture<'_, u32> {
        Box::pin(async move {
            let out = self
                .cli
                .run(&[
                    "autoscaling",
                    "describe-auto-scaling-groups",
                    "--auto-scaling-group-names",
                    &self.group,
                ])
                .await?;
            in_service_count(&out, &self.group)
        })
    }
}

/// Count `InService` instances in a `describe-auto-scaling-groups` response.
pub fn in_service_count(out: &Value, group: &str) -> ResourceResult<u32> {
    let group_json = out
        .get("AutoScalingGroups")
        .and_then(Value::as_array)
        .and_then(|groups| groups.first())
        .ok_or_else(|| ResourceError::permanent(format!("autoscaling group {group} NotFound")))?;

    let count = group_json
        .get("Instances")
        .and_then(Value::as_array)
        .map(|instances| {
            instances
                .iter()
                .filter(|i| i.get("LifecycleState").and_then(Value::as_str) == Some("InService"))
                .count()
        })
        .unwrap_or(0);

    Ok(count as u32)
}

// ── ECS service ────────────────────────────────────────────────────

/// Service controller over an ECS service.
pub struct EcsService {
    cli: AwsCli,
    cluster: String,
    service: String,
}

impl EcsService {
    pub fn new(cli: AwsCli, cluster: &str, service: &str) -> Self {
        Self {
            cli,
            cluster: cluster.to_string(),
            service: service.to_string(),
        }
    }

    /// Stop tasks that linger after the desired count drops to zero.
    async fn stop_remaining_tasks(&self) -> ResourceResult<()> {
        let out = self
            .cli
            .run(&[
                "ecs",
                "list-tasks",
                "--cluster",
                &self.cluster,
                "--service-name",
                &self.service,
            ])
            .await?;

        let tasks: Vec<String> = out
            .get("taskArns")
            .and_then(Value::as_array)
            .map(|arns| {
                arns.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        for task in &tasks {
            // A task that already exited is not worth failing the step over.
            if let Err(e) = self
                .cli
                .run(&["ecs", "stop-task", "--cluster", &self.cluster, "--task", task])
                .await
            {
                warn!(%task, error = %e, "failed to stop ecs task");
            } else {
                info!(%task, service = %self.service, "stopped ecs task");
            }
        }
        Ok(())
    }
}

impl ServiceController for EcsService {
    fn set_desired_tasks(&self, n: u32) -> ResourceFuture<'_, ()> {
        Box::pin(async move {
            let count = n.to_string();
            self.cli
                .run(&[
                    "ecs",
                    "update-service",
                    "--cluster",
                    &self.cluster,
                    "--service",
                    &self.service,
                    "--desired-count",
                    &count,
                    "--force-new-deployment",
                ])
                .await?;
            info!(service = %self.service, desired = n, "set ecs desired count");

            if n == 0 {
                self.stop_remaining_tasks().await?;
            }
            Ok(())
        })
    }

    fn running_tasks(&self) -> ResourceFuture<'_, u32> {
        Box::pin(async move {
            let out = self
                .cli
                .run(&[
                    "ecs",
                    "describe-services",
                    "--cluster",
                    &self.cluster,
                    "--services",
                    &self.service,
                ])
                .await?;
            running_count(&out, &self.service)
        })
    }
}

/// Read `runningCount` from a `describe-services` response.
pub fn running_count(out: &Value, service: &str) -> ResourceResult<u32> {
    if let Some(failure) = out
        .get("failures")
        .and_then(Value::as_array)
        .and_then(|f| f.first())
    {
        let reason = failure
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        return Err(ResourceError::permanent(format!(
            "ecs service {service} NotFound: {reason}"
        )));
    }

    out.get("services")
        .and_then(Value::as_array)
        .and_then(|s| s.first())
        .and_then(|s| s.get("runningCount"))
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .ok_or_else(|| ResourceError::transient(format!("no runningCount for ecs service {service}")))
}

// ── Route table ────────────────────────────────────────────────────

/// Route controller that points a route table's default route at a NAT
/// gateway while attached, and restores the original target on detach.
pub struct NatRoute {
    cli: AwsCli,
    route_table: String,
    nat_gateway: String,
    restore_gateway: Option<String>,
}

impl NatRoute {
    pub fn new(
        cli: AwsCli,
        route_table: &str,
        nat_gateway: &str,
        restore_gateway: Option<String>,
    ) -> Self {
        Self {
            cli,
            route_table: route_table.to_string(),
            nat_gateway: nat_gateway.to_string(),
            restore_gateway,
        }
    }

    async fn point_default_route(&self, verb: &str, target_flag: &str, target: &str) -> ResourceResult<Value> {
        self.cli
            .run(&[
                "ec2",
                verb,
                "--route-table-id",
                &self.route_table,
                "--destination-cidr-block",
                DEFAULT_ROUTE_CIDR,
                target_flag,
                target,
            ])
            .await
    }
}

impl RouteController for NatRoute {
    fn attach(&self) -> ResourceFuture<'_, ()> {
        Box::pin(async move {
            match self
                .point_default_route("replace-route", "--nat-gateway-id", &self.nat_gateway)
                .await
            {
                Ok(_) => {}
                // No default route yet: create one instead of replacing.
                Err(e) if e.message().contains("InvalidRoute.NotFound") => {
                    self.point_default_route("create-route", "--nat-gateway-id", &self.nat_gateway)
                        .await?;
                }
                Err(e) => return Err(e),
            }
            info!(route_table = %self.route_table, nat = %self.nat_gateway, "attached default route");
            Ok(())
        })
    }

    fn detach(&self) -> ResourceFuture<'_, ()> {
        Box::pin(async move {
            let result = match &self.restore_gateway {
                Some(gateway) => {
                    self.point_default_route("replace-route", "--gateway-id", gateway)
                        .await
                }
                None => {
                    self.cli
                        .run(&[
                            "ec2",
                            "delete-route",
                            "--route-table-id",
                            &self.route_table,
                            "--destination-cidr-block",
                            DEFAULT_ROUTE_CIDR,
                        ])
                        .await
                }
            };

            match result {
                Ok(_) => {}
                // Already gone is what we wanted.
                Err(e) if e.message().contains("InvalidRoute.NotFound") => {}
                Err(e) => return Err(e),
            }
            info!(route_table = %self.route_table, "detached default route");
            Ok(())
        })
    }

    fn is_attached(&self) -> ResourceFuture<'_, bool> {
        Box::pin(async move {
            let out = self
                .cli
                .run(&[
                    "ec2",
                    "describe-route-tables",
                    "--route-table-ids",
                    &self.route_table,
                ])
                .await?;
            default_route_uses(&out, &self.nat_gateway)
        })
    }
}

/// Whether the default route in a `describe-route-tables` response targets `nat_gateway`.
pub fn default_route_uses(out: &Value, nat_gateway: &str) -> ResourceResult<bool> {
    let routes = out
        .get("RouteTables")
        .and_then(Value::as_array)
        .and_then(|t| t.first())
        .and_then(|t| t.get("Routes"))
        .and_then(Value::as_array)
        .ok_or_else(|| ResourceError::permanent("route table NotFound"))?;

    Ok(routes.iter().any(|route| {
        route.get("DestinationCidrBlock").and_then(Value::as_str) == Some(DEFAULT_ROUTE_CIDR)
            && route.get("NatGatewayId").and_then(Value::as_str) == Some(nat_gateway)
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classify_permanent_codes() {
        let err = classify_cli_failure(
            "An error occurred (AccessDenied) when calling the UpdateAutoScalingGroup operation",
        );
        assert!(matches!(err, ResourceError::Permanent(_)));

        let err = classify_cli_failure(
            "An error occurred (ClusterNotFoundException) when calling the UpdateService operation: Cluster not found.",
        );
        assert!(matches!(err, ResourceError::Permanent(_)));
    }

    #[test]
    fn classify_throttling_as_transient() {
        let err = classify_cli_failure(
            "An error occurred (Throttling) when calling the DescribeAutoScalingGroups operation: Rate exceeded",
        );
        assert!(err.is_transient());

        let err = classify_cli_failure("Could not connect to the endpoint URL");
        assert!(err.is_transient());
    }

    #[test]
    fn counts_in_service_instances_only() {
        let out = json!({
            "AutoScalingGroups": [{
                "AutoScalingGroupName": "gpu",
                "Instances": [
                    {"InstanceId": "i-1", "LifecycleState": "InService"},
                    {"InstanceId": "i-2", "LifecycleState": "Pending"},
                ]
            }]
        });
        assert_eq!(in_service_count(&out, "gpu").unwrap(), 1);
    }

    #[test]
    fn missing_group_is_permanent() {
        let out = json!({"AutoScalingGroups": []});
        let err = in_service_count(&out, "gpu").unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn group_without_instances_counts_zero() {
        let out = json!({"AutoScalingGroups": [{"AutoScalingGroupName": "gpu"}]});
        assert_eq!(in_service_count(&out, "gpu").unwrap(), 0);
    }

    #[test]
    fn reads_running_count() {
        let out = json!({
            "services": [{"serviceName": "ollama", "runningCount": 1, "desiredCount": 1}],
            "failures": []
        });
        assert_eq!(running_count(&out, "ollama").unwrap(), 1);
    }

    #[test]
    fn missing_service_is_permanent() {
        let out = json!({
            "services": [],
            "failures": [{"arn": "arn:aws:ecs:...", "reason": "MISSING"}]
        });
        let err = running_count(&out, "ollama").unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message().contains("MISSING"));
    }

    #[test]
    fn detects_default_route_target() {
        let out = json!({
            "RouteTables": [{
                "Routes": [
                    {"DestinationCidrBlock": "10.0.0.0/16", "GatewayId": "local"},
                    {"DestinationCidrBlock": "0.0.0.0/0", "NatGatewayId": "nat-1"}
                ]
            }]
        });
        assert!(default_route_uses(&out, "nat-1").unwrap());
        assert!(!default_route_uses(&out, "nat-2").unwrap());
    }

    #[test]
    fn default_route_via_internet_gateway_is_not_attached() {
        let out = json!({
            "RouteTables": [{
                "Routes": [{"DestinationCidrBlock": "0.0.0.0/0", "GatewayId": "igw-1"}]
            }]
        });
        assert!(!default_route_uses(&out, "nat-1").unwrap());
    }

    #[tokio::test]
    async fn missing_cli_binary_is_permanent() {
        let cli = AwsCli::new("/nonexistent/ember-test-aws", None);
        let err = cli.run(&["sts", "get-caller-identity"]).await.unwrap_err();
        assert!(!err.is_transient());
    }
}
