use std::sync::Arc;

use surge_core::{Backend, JobRequest, OrchestrationError, Result, RunTag};
use tracing::{debug, warn};

use super::{Classification, JobDispatcher, JobExecution, JobPhase, JobStatus, LogStream};
use crate::cloud::{ClusterApi, InstanceApi, LogApi, TaskLaunch};

const MAX_LOG_PAGES: usize = 10_000;

/// Container-task backend: one container's command and environment are
/// overridden inside a task definition and the task is pinned to the
/// instances carrying the run tag.
pub struct ContainerDispatcher {
    instances: Arc<dyn InstanceApi>,
    cluster: Arc<dyn ClusterApi>,
    logs: Arc<dyn LogApi>,
    tag_key: String,
    log_group: String,
}

impl ContainerDispatcher {
    pub fn new(
        instances: Arc<dyn InstanceApi>,
        cluster: Arc<dyn ClusterApi>,
        logs: Arc<dyn LogApi>,
        tag_key: impl Into<String>,
        log_group: impl Into<String>,
    ) -> Self {
        Self {
            instances,
            cluster,
            logs,
            tag_key: tag_key.into(),
            log_group: log_group.into(),
        }
    }

    /// Container instances of the request's cluster that back EC2 instances
    /// tagged with `tag`.
    fn tagged_container_instances(&self, tag: &RunTag, cluster: &str) -> Result<Vec<String>> {
        let tagged = self
            .instances
            .find_instances_by_tag(&self.tag_key, &tag.to_string())?;
        if tagged.is_empty() {
            return Err(OrchestrationError::Dispatch(format!(
                "no instance carries {}={}",
                self.tag_key, tag
            )));
        }
        let members = self.cluster.container_instances(cluster)?;
        if members.is_empty() {
            return Err(OrchestrationError::Dispatch(format!(
                "cluster {} has no container instances",
                cluster
            )));
        }
        let arns: Vec<String> = members
            .into_iter()
            .filter(|m| tagged.contains(&m.ec2_instance_id))
            .map(|m| m.arn)
            .collect();
        if arns.is_empty() {
            return Err(OrchestrationError::Dispatch(format!(
                "no container instance of cluster {} is tagged for {}",
                cluster, tag
            )));
        }
        Ok(arns)
    }
}

/// `awslogs` stream name: `<task family>/<container>/<task id>`.
pub fn log_stream_name(task_definition: &str, container: &str, task_arn: &str) -> String {
    let family = task_definition.split(':').next().unwrap_or(task_definition);
    let task_id = task_arn.rsplit('/').next().unwrap_or(task_arn);
    format!("{}/{}/{}", family, container, task_id)
}

impl JobDispatcher for ContainerDispatcher {
    fn backend(&self) -> Backend {
        Backend::Container
    }

    fn submit(&self, tag: &RunTag, request: &JobRequest) -> Result<JobExecution> {
        let mut execution = JobExecution::new(tag, request);
        execution.advance(JobPhase::Submitting);
        if request.backend() != Backend::Container {
            return Err(OrchestrationError::Dispatch(format!(
                "job {} targets the {} backend",
                request.name(),
                request.backend()
            )));
        }
        let resolved = request.resolve(tag)?;
        let container_instances = self.tagged_container_instances(tag, request.cluster_ref())?;
        let launch = TaskLaunch {
            cluster: request.cluster_ref().to_string(),
            task_definition: request.resource_ref().to_string(),
            container: request.program().to_string(),
            command: resolved.argv,
            env: resolved.env,
            container_instances,
        };
        let task_arn = self.cluster.start_task(&launch)?;
        execution.remote_job_id = Some(task_arn);
        execution.advance(JobPhase::Dispatched);
        Ok(execution)
    }

    fn query(&self, execution: &JobExecution) -> Result<JobStatus> {
        let task = self
            .cluster
            .describe_task(execution.request.cluster_ref(), execution.remote_id()?)?;
        if task.is_stopped() {
            Ok(JobStatus::Stopped)
        } else {
            Ok(JobStatus::Running(task.last_status))
        }
    }

    /// Every container must report exit code 0. A missing exit code means the
    /// container never ran to completion and counts as failure.
    fn classify(&self, execution: &JobExecution) -> Result<Classification> {
        let task = self
            .cluster
            .describe_task(execution.request.cluster_ref(), execution.remote_id()?)?;
        if task.containers.is_empty() {
            return Ok(Classification::failed(format!(
                "task description lists no containers ({})",
                task.stopped_reason.as_deref().unwrap_or("no reason given")
            )));
        }
        let mut problems = Vec::new();
        for container in &task.containers {
            match container.exit_code {
                Some(0) => {}
                Some(code) => problems.push(format!("{} exited with {}", container.name, code)),
                None => problems.push(format!(
                    "{} has no exit code: {}",
                    container.name,
                    container
                        .reason
                        .as_deref()
                        .or(task.stopped_reason.as_deref())
                        .unwrap_or("no reason given")
                )),
            }
        }
        if problems.is_empty() {
            Ok(Classification::succeeded())
        } else {
            Ok(Classification::failed(problems.join("; ")))
        }
    }

    fn fetch_logs(&self, execution: &JobExecution) -> Result<LogStream> {
        let stream = log_stream_name(
            execution.request.resource_ref(),
            execution.request.program(),
            execution.remote_id()?,
        );
        debug!(group = %self.log_group, stream = %stream, "fetching container logs");
        let mut logs = LogStream::default();
        let mut token: Option<String> = None;
        for page_no in 0..MAX_LOG_PAGES {
            let page = match self.logs.fetch_log_page(&self.log_group, &stream, token.as_deref()) {
                Ok(page) => page,
                Err(e) if page_no == 0 => return Err(e),
                Err(e) => {
                    warn!(stream = %stream, page = page_no, error = %e, "log page fetch failed");
                    return Ok(logs);
                }
            };
            let empty = page.messages.is_empty();
            logs.lines.extend(page.messages);
            match page.next_token {
                Some(next) if !empty && token.as_deref() != Some(next.as_str()) => {
                    token = Some(next)
                }
                _ => {
                    logs.complete = true;
                    return Ok(logs);
                }
            }
        }
        warn!(stream = %stream, "log pagination did not finish");
        Ok(logs)
    }

    fn kill(&self, execution: &JobExecution) -> Result<()> {
        self.cluster.stop_task(
            execution.request.cluster_ref(),
            execution.remote_id()?,
            "Timed out",
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{run_job, Cancellation};
    use crate::fakes::FakeCloud;
    use surge_core::{Arg, Outcome};

    fn setup() -> (Arc<FakeCloud>, ContainerDispatcher, RunTag, JobRequest) {
        let cloud = Arc::new(FakeCloud::new());
        let dispatcher = ContainerDispatcher::new(
            cloud.clone(),
            cloud.clone(),
            cloud.clone(),
            "Workflow Tag",
            "odssm_ecs_task_docker_logs",
        );
        let tag = RunTag::new("IAN", 2022, "7").expect("tag");
        let request = JobRequest::container("solve", "odssm-cluster", "odssm-solve:4", "solve")
            .arg(Arg::tmpl("hurricanes/{tag}/setup/schism.dir/"))
            .arg("pschism_PAHM_TVD-VL")
            .wait(0, 5);
        (cloud, dispatcher, tag, request)
    }

    #[test]
    fn exit_code_137_is_failed_and_0_is_succeeded() {
        for (code, expected) in [(137, Outcome::Failed), (0, Outcome::Succeeded)] {
            let (cloud, dispatcher, tag, request) = setup();
            let instance = cloud.launch_tagged("Workflow Tag", &tag.to_string());
            cloud.register_member(&instance);
            cloud.script_task(&["PENDING", "RUNNING"], vec![("solve", Some(code))]);
            let execution =
                run_job(&dispatcher, &tag, &request, &Cancellation::new()).expect("dispatch");
            assert_eq!(execution.outcome, Some(expected), "exit code {}", code);
            assert_eq!(execution.status_queries, 3);
            let launch = cloud.last_launch().expect("task started");
            assert_eq!(
                launch.command,
                vec!["hurricanes/IAN_2022_7/setup/schism.dir/", "pschism_PAHM_TVD-VL"]
            );
            assert_eq!(launch.container_instances.len(), 1);
        }
    }

    #[test]
    fn missing_exit_code_is_failed() {
        let (cloud, dispatcher, tag, request) = setup();
        let instance = cloud.launch_tagged("Workflow Tag", &tag.to_string());
        cloud.register_member(&instance);
        cloud.script_task(&[], vec![("solve", None)]);
        let execution = run_job(&dispatcher, &tag, &request, &Cancellation::new()).expect("run");
        assert_eq!(execution.outcome, Some(Outcome::Failed));
        assert!(execution
            .detail
            .as_deref()
            .unwrap_or_default()
            .contains("no exit code"));
    }

    #[test]
    fn untagged_cluster_is_a_dispatch_error() {
        let (cloud, dispatcher, tag, request) = setup();
        let other = cloud.launch_tagged("Workflow Tag", "IAN_2022_8");
        cloud.register_member(&other);
        let err = run_job(&dispatcher, &tag, &request, &Cancellation::new())
            .expect_err("nothing tagged for this run");
        assert!(matches!(err, OrchestrationError::Dispatch(_)));
        assert!(cloud.last_launch().is_none());
    }

    #[test]
    fn logs_are_read_across_pages_from_the_task_stream() {
        let (cloud, dispatcher, tag, request) = setup();
        let instance = cloud.launch_tagged("Workflow Tag", &tag.to_string());
        cloud.register_member(&instance);
        cloud.script_task(&[], vec![("solve", Some(0))]);
        cloud.push_log_pages(vec![vec!["step 1", "step 2"], vec!["done"]]);
        let execution = run_job(&dispatcher, &tag, &request, &Cancellation::new()).expect("run");
        assert_eq!(execution.logs.lines, vec!["step 1", "step 2", "done"]);
        assert!(execution.logs.complete);
        let stream = cloud.last_log_stream().expect("stream");
        assert!(stream.starts_with("odssm-solve/solve/"), "{}", stream);
    }

    #[test]
    fn stream_name_uses_family_and_task_id() {
        assert_eq!(
            log_stream_name(
                "odssm-info:3",
                "info",
                "arn:aws:ecs:us-east-1:1:task/odssm-cluster/abc123"
            ),
            "odssm-info/info/abc123"
        );
    }
}
