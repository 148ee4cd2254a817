//! Collaborator contracts of the container-task backend. [`crate::aws::AwsCli`]
//! implements all three against the `aws` CLI; tests use in-memory fakes.

use surge_core::Result;

/// Virtual-machine lifecycle and tagging.
pub trait InstanceApi: Send + Sync {
    /// Launch the instances described by a launch template; returns their ids.
    fn run_instances(&self, template_id: &str) -> Result<Vec<String>>;
    fn wait_instances_exist(&self, instance_ids: &[String]) -> Result<()>;
    fn tag_instances(&self, instance_ids: &[String], key: &str, value: &str) -> Result<()>;
    /// Blocks until status checks pass; the backend's own waiter bounds it.
    fn wait_instances_healthy(&self, instance_ids: &[String]) -> Result<()>;
    /// Live (not terminated) instances carrying `key = value`.
    fn find_instances_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>>;
    fn terminate_instances(&self, instance_ids: &[String]) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInstance {
    pub arn: String,
    pub ec2_instance_id: String,
}

/// Container override for one task launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLaunch {
    pub cluster: String,
    pub task_definition: String,
    pub container: String,
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub container_instances: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub name: String,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDescription {
    pub last_status: String,
    pub stopped_reason: Option<String>,
    pub containers: Vec<ContainerState>,
}

impl TaskDescription {
    pub fn is_stopped(&self) -> bool {
        self.last_status.eq_ignore_ascii_case("STOPPED")
    }
}

/// Container cluster membership and task control.
pub trait ClusterApi: Send + Sync {
    fn container_instances(&self, cluster: &str) -> Result<Vec<ContainerInstance>>;
    fn put_attribute(
        &self,
        cluster: &str,
        container_instance_arn: &str,
        name: &str,
        value: &str,
    ) -> Result<()>;
    /// Start one task; returns the task ARN.
    fn start_task(&self, launch: &TaskLaunch) -> Result<String>;
    fn describe_task(&self, cluster: &str, task_arn: &str) -> Result<TaskDescription>;
    fn stop_task(&self, cluster: &str, task_arn: &str, reason: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    pub messages: Vec<String>,
    pub next_token: Option<String>,
}

/// Paginated access to container log streams.
pub trait LogApi: Send + Sync {
    fn fetch_log_page(
        &self,
        group: &str,
        stream: &str,
        next_token: Option<&str>,
    ) -> Result<LogPage>;
}
