//! `aws` CLI implementations of the cloud and object-store contracts.

use std::path::Path;
use std::process::Command;

use serde_json::{json, Value};
use surge_core::config::AwsConfig;
use surge_core::{OrchestrationError, Result};

use crate::cloud::{
    ClusterApi, ContainerInstance, ContainerState, InstanceApi, LogApi, LogPage,
    TaskDescription, TaskLaunch,
};
use crate::process::{run_capture, run_capture_labeled, shell_join};
use crate::store::{split_bucket_uri, ObjectStore};

const LIVE_INSTANCE_STATES: &str = "pending,running,stopping,stopped";
const LOG_PAGE_ITEMS: &str = "1000";

#[derive(Debug, Clone, Default)]
pub struct AwsCli {
    profile: Option<String>,
    region: Option<String>,
}

impl AwsCli {
    pub fn new(profile: Option<String>, region: Option<String>) -> Self {
        Self { profile, region }
    }

    pub fn from_config(config: &AwsConfig) -> Self {
        Self::new(config.profile.clone(), config.region.clone())
    }

    fn command(&self, service: &str, operation: &str) -> Command {
        let mut cmd = Command::new("aws");
        if let Some(profile) = &self.profile {
            cmd.args(["--profile", profile]);
        }
        if let Some(region) = &self.region {
            cmd.args(["--region", region]);
        }
        cmd.args(["--output", "json", service, operation]);
        cmd
    }

    fn call(&self, cmd: Command) -> Result<Value> {
        let label = shell_join(&cmd);
        let stdout = run_capture(cmd)?;
        parse_json(&label, &stdout)
    }
}

fn parse_json(label: &str, stdout: &str) -> Result<Value> {
    if stdout.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(stdout)
        .map_err(|e| OrchestrationError::backend(label, format!("unparseable output: {}", e)))
}

fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(|v| v.as_str())
}

fn array_at<'a>(value: &'a Value, pointer: &str) -> &'a [Value] {
    value
        .pointer(pointer)
        .and_then(|v| v.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn launched_instance_ids(value: &Value) -> Vec<String> {
    array_at(value, "/Instances")
        .iter()
        .filter_map(|i| str_at(i, "/InstanceId").map(str::to_string))
        .collect()
}

fn reservation_instance_ids(value: &Value) -> Vec<String> {
    array_at(value, "/Reservations")
        .iter()
        .flat_map(|r| array_at(r, "/Instances"))
        .filter_map(|i| str_at(i, "/InstanceId").map(str::to_string))
        .collect()
}

fn container_instances(value: &Value) -> Vec<ContainerInstance> {
    array_at(value, "/containerInstances")
        .iter()
        .filter_map(|ci| {
            Some(ContainerInstance {
                arn: str_at(ci, "/containerInstanceArn")?.to_string(),
                ec2_instance_id: str_at(ci, "/ec2InstanceId")?.to_string(),
            })
        })
        .collect()
}

fn task_description(value: &Value) -> Option<TaskDescription> {
    let task = value.pointer("/tasks/0")?;
    let containers = array_at(task, "/containers")
        .iter()
        .map(|c| ContainerState {
            name: str_at(c, "/name").unwrap_or_default().to_string(),
            exit_code: c
                .pointer("/exitCode")
                .and_then(|v| v.as_i64())
                .and_then(|v| i32::try_from(v).ok()),
            reason: str_at(c, "/reason").map(str::to_string),
        })
        .collect();
    Some(TaskDescription {
        last_status: str_at(task, "/lastStatus").unwrap_or("UNKNOWN").to_string(),
        stopped_reason: str_at(task, "/stoppedReason").map(str::to_string),
        containers,
    })
}

fn task_failures(value: &Value) -> Vec<String> {
    array_at(value, "/failures")
        .iter()
        .map(|f| {
            format!(
                "{}: {}",
                str_at(f, "/arn").unwrap_or("?"),
                str_at(f, "/reason").unwrap_or("unknown reason")
            )
        })
        .collect()
}

fn task_overrides(launch: &TaskLaunch) -> Value {
    let environment: Vec<Value> = launch
        .env
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();
    json!({
        "containerOverrides": [{
            "name": launch.container,
            "command": launch.command,
            "environment": environment,
        }]
    })
}

fn log_page(value: &Value) -> LogPage {
    LogPage {
        messages: array_at(value, "/events")
            .iter()
            .filter_map(|e| str_at(e, "/message").map(str::to_string))
            .collect(),
        next_token: str_at(value, "/NextToken").map(str::to_string),
    }
}

fn common_prefixes(value: &Value, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = array_at(value, "/CommonPrefixes")
        .iter()
        .filter_map(|p| str_at(p, "/Prefix"))
        .map(|p| p.strip_prefix(prefix).unwrap_or(p).trim_end_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect();
    names.sort();
    names
}

impl InstanceApi for AwsCli {
    fn run_instances(&self, template_id: &str) -> Result<Vec<String>> {
        let mut cmd = self.command("ec2", "run-instances");
        cmd.args([
            "--launch-template",
            &format!("LaunchTemplateId={}", template_id),
        ]);
        let ids = launched_instance_ids(&self.call(cmd)?);
        if ids.is_empty() {
            return Err(OrchestrationError::backend(
                "ec2 run-instances",
                format!("template {} launched no instances", template_id),
            ));
        }
        Ok(ids)
    }

    fn wait_instances_exist(&self, instance_ids: &[String]) -> Result<()> {
        let mut cmd = self.command("ec2", "wait");
        cmd.args(["instance-exists", "--instance-ids"]).args(instance_ids);
        run_capture(cmd).map(drop)
    }

    fn tag_instances(&self, instance_ids: &[String], key: &str, value: &str) -> Result<()> {
        let mut cmd = self.command("ec2", "create-tags");
        cmd.arg("--resources")
            .args(instance_ids)
            .args(["--tags", &format!("Key={},Value={}", key, value)]);
        run_capture(cmd).map(drop)
    }

    fn wait_instances_healthy(&self, instance_ids: &[String]) -> Result<()> {
        let mut cmd = self.command("ec2", "wait");
        cmd.args(["instance-status-ok", "--instance-ids"]).args(instance_ids);
        run_capture(cmd).map(drop)
    }

    fn find_instances_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let mut cmd = self.command("ec2", "describe-instances");
        cmd.args([
            "--filters",
            &format!("Name=tag:{},Values={}", key, value),
            &format!("Name=instance-state-name,Values={}", LIVE_INSTANCE_STATES),
        ]);
        Ok(reservation_instance_ids(&self.call(cmd)?))
    }

    fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let mut cmd = self.command("ec2", "terminate-instances");
        cmd.arg("--instance-ids").args(instance_ids);
        run_capture(cmd).map(drop)
    }
}

impl ClusterApi for AwsCli {
    fn container_instances(&self, cluster: &str) -> Result<Vec<ContainerInstance>> {
        let mut list = self.command("ecs", "list-container-instances");
        list.args(["--cluster", cluster]);
        let arns: Vec<String> = array_at(&self.call(list)?, "/containerInstanceArns")
            .iter()
            .filter_map(|a| a.as_str().map(str::to_string))
            .collect();
        if arns.is_empty() {
            return Ok(Vec::new());
        }
        let mut describe = self.command("ecs", "describe-container-instances");
        describe
            .args(["--cluster", cluster, "--container-instances"])
            .args(&arns);
        Ok(container_instances(&self.call(describe)?))
    }

    fn put_attribute(
        &self,
        cluster: &str,
        container_instance_arn: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        let mut cmd = self.command("ecs", "put-attributes");
        cmd.args([
            "--cluster",
            cluster,
            "--attributes",
            &format!(
                "name={},value={},targetId={}",
                name, value, container_instance_arn
            ),
        ]);
        run_capture(cmd).map(drop)
    }

    fn start_task(&self, launch: &TaskLaunch) -> Result<String> {
        let overrides = task_overrides(launch);
        let mut cmd = self.command("ecs", "start-task");
        cmd.args([
            "--cluster",
            &launch.cluster,
            "--task-definition",
            &launch.task_definition,
            "--container-instances",
        ])
        .args(&launch.container_instances);
        // The label stands in for the overrides, which may carry secret values.
        let label = format!(
            "{} --overrides <{} args, {} env>",
            shell_join(&cmd),
            launch.command.len(),
            launch.env.len()
        );
        cmd.args(["--overrides", &overrides.to_string()]);
        let value = parse_json(&label, &run_capture_labeled(cmd, label.clone())?)?;
        let failures = task_failures(&value);
        if !failures.is_empty() {
            return Err(OrchestrationError::backend(label, failures.join("; ")));
        }
        str_at(&value, "/tasks/0/taskArn")
            .map(str::to_string)
            .ok_or_else(|| OrchestrationError::backend(label, "no task was started"))
    }

    fn describe_task(&self, cluster: &str, task_arn: &str) -> Result<TaskDescription> {
        let mut cmd = self.command("ecs", "describe-tasks");
        cmd.args(["--cluster", cluster, "--tasks", task_arn]);
        let value = self.call(cmd)?;
        task_description(&value).ok_or_else(|| {
            OrchestrationError::backend(
                "ecs describe-tasks",
                format!("task {} not found: {}", task_arn, task_failures(&value).join("; ")),
            )
        })
    }

    fn stop_task(&self, cluster: &str, task_arn: &str, reason: &str) -> Result<()> {
        let mut cmd = self.command("ecs", "stop-task");
        cmd.args(["--cluster", cluster, "--task", task_arn, "--reason", reason]);
        run_capture(cmd).map(drop)
    }
}

impl LogApi for AwsCli {
    fn fetch_log_page(
        &self,
        group: &str,
        stream: &str,
        next_token: Option<&str>,
    ) -> Result<LogPage> {
        let mut cmd = self.command("logs", "get-log-events");
        cmd.args([
            "--log-group-name",
            group,
            "--log-stream-name",
            stream,
            "--start-from-head",
            "--max-items",
            LOG_PAGE_ITEMS,
        ]);
        if let Some(token) = next_token {
            cmd.args(["--starting-token", token]);
        }
        Ok(log_page(&self.call(cmd)?))
    }
}

/// S3 through `aws s3`. Transfer failures surface as sync errors.
#[derive(Debug, Clone, Default)]
pub struct AwsS3Store {
    cli: AwsCli,
}

impl AwsS3Store {
    pub fn new(cli: AwsCli) -> Self {
        Self { cli }
    }

    fn run(&self, cmd: Command) -> Result<String> {
        run_capture(cmd).map_err(|e| OrchestrationError::Sync(e.to_string()))
    }
}

impl ObjectStore for AwsS3Store {
    fn sync_up(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = self.cli.command("s3", "sync");
        cmd.arg(local)
            .arg(remote)
            .args(["--no-follow-symlinks", "--no-progress"]);
        self.run(cmd).map(drop)
    }

    fn sync_down(&self, remote: &str, local: &Path) -> Result<()> {
        let mut cmd = self.cli.command("s3", "sync");
        cmd.arg(remote).arg(local).arg("--no-progress");
        self.run(cmd).map(drop)
    }

    fn remove_prefix(&self, remote: &str) -> Result<()> {
        match split_bucket_uri(remote) {
            Some((_, key)) if !key.trim_matches('/').is_empty() => {}
            _ => {
                return Err(OrchestrationError::Sync(format!(
                    "refusing to remove bucket root {}",
                    remote
                )))
            }
        }
        let mut cmd = self.cli.command("s3", "rm");
        cmd.args([remote, "--recursive"]);
        self.run(cmd).map(drop)
    }

    fn put_file(&self, local: &Path, remote: &str) -> Result<()> {
        let mut cmd = self.cli.command("s3", "cp");
        cmd.arg(local).arg(remote).arg("--no-progress");
        self.run(cmd).map(drop)
    }

    fn list_prefixes(&self, remote: &str) -> Result<Vec<String>> {
        let (bucket, key) = split_bucket_uri(remote)
            .ok_or_else(|| OrchestrationError::Sync(format!("not a bucket URI: {}", remote)))?;
        let prefix = match key.trim_matches('/') {
            "" => String::new(),
            k => format!("{}/", k),
        };
        let mut cmd = self.cli.command("s3api", "list-objects-v2");
        cmd.args(["--bucket", bucket, "--delimiter", "/"]);
        if !prefix.is_empty() {
            cmd.args(["--prefix", &prefix]);
        }
        let label = shell_join(&cmd);
        let stdout = self.run(cmd)?;
        let value =
            parse_json(&label, &stdout).map_err(|e| OrchestrationError::Sync(e.to_string()))?;
        Ok(common_prefixes(&value, &prefix))
    }
}
