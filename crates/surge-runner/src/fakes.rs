//! In-memory collaborators for unit tests.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use surge_core::{OrchestrationError, Result};

use crate::cloud::{
    ClusterApi, ContainerInstance, ContainerState, InstanceApi, LogApi, LogPage, TaskDescription,
    TaskLaunch,
};
use crate::dispatch::BatchScheduler;

pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "surge_{}_{}_{}",
        label,
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ))
}

#[derive(Default)]
struct Instance {
    tags: BTreeMap<String, String>,
    live: bool,
}

struct TaskScript {
    statuses: VecDeque<String>,
    containers: Vec<(String, Option<i32>)>,
}

#[derive(Default)]
struct CloudState {
    next_instance: u32,
    instances: BTreeMap<String, Instance>,
    members: Vec<ContainerInstance>,
    manual_registration: bool,
    fail_health: bool,
    attributes: BTreeMap<(String, String), String>,
    calls: Vec<String>,
    scripts: VecDeque<TaskScript>,
    tasks: BTreeMap<String, TaskScript>,
    launches: Vec<TaskLaunch>,
    stopped: Vec<String>,
    log_pages: VecDeque<Vec<String>>,
    last_stream: Option<String>,
}

/// Fake EC2 + ECS + CloudWatch Logs.
#[derive(Default)]
pub(crate) struct FakeCloud {
    state: Mutex<CloudState>,
}

impl FakeCloud {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut CloudState) -> T) -> T {
        let mut state = self.state.lock().expect("fake cloud lock");
        f(&mut state)
    }

    /// When false, healthy instances do not join the cluster on their own.
    pub(crate) fn auto_register(&self, on: bool) {
        self.with(|s| s.manual_registration = !on);
    }

    pub(crate) fn fail_health_checks(&self) {
        self.with(|s| s.fail_health = true);
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub(crate) fn live_instances(&self) -> Vec<String> {
        self.with(|s| {
            s.instances
                .iter()
                .filter(|(_, i)| i.live)
                .map(|(id, _)| id.clone())
                .collect()
        })
    }

    pub(crate) fn launch_tagged(&self, key: &str, value: &str) -> String {
        self.with(|s| {
            s.next_instance += 1;
            let id = format!("i-{:04}", s.next_instance);
            let mut instance = Instance {
                live: true,
                ..Default::default()
            };
            instance.tags.insert(key.to_string(), value.to_string());
            s.instances.insert(id.clone(), instance);
            id
        })
    }

    pub(crate) fn register_member(&self, ec2_instance_id: &str) {
        self.with(|s| register(s, ec2_instance_id));
    }

    pub(crate) fn register_foreign_member(&self, ec2_instance_id: &str) {
        self.register_member(ec2_instance_id);
    }

    pub(crate) fn attribute(&self, arn: &str, name: &str) -> Option<String> {
        self.with(|s| s.attributes.get(&(arn.to_string(), name.to_string())).cloned())
    }

    /// Next started task reports `statuses` on successive describes, then
    /// `STOPPED` with the given container exit codes.
    pub(crate) fn script_task(&self, statuses: &[&str], containers: Vec<(&str, Option<i32>)>) {
        self.with(|s| {
            s.scripts.push_back(TaskScript {
                statuses: statuses.iter().map(|v| v.to_string()).collect(),
                containers: containers
                    .into_iter()
                    .map(|(n, c)| (n.to_string(), c))
                    .collect(),
            })
        });
    }

    pub(crate) fn last_launch(&self) -> Option<TaskLaunch> {
        self.with(|s| s.launches.last().cloned())
    }

    pub(crate) fn stopped_tasks(&self) -> Vec<String> {
        self.with(|s| s.stopped.clone())
    }

    pub(crate) fn push_log_pages(&self, pages: Vec<Vec<&str>>) {
        self.with(|s| {
            for page in pages {
                s.log_pages
                    .push_back(page.into_iter().map(|l| l.to_string()).collect());
            }
        });
    }

    pub(crate) fn last_log_stream(&self) -> Option<String> {
        self.with(|s| s.last_stream.clone())
    }
}

fn register(s: &mut CloudState, ec2_instance_id: &str) {
    s.members.push(ContainerInstance {
        arn: format!("arn:aws:ecs:us-east-1:1:container-instance/{}", ec2_instance_id),
        ec2_instance_id: ec2_instance_id.to_string(),
    });
}

impl InstanceApi for FakeCloud {
    fn run_instances(&self, template_id: &str) -> Result<Vec<String>> {
        self.with(|s| {
            s.calls.push(format!("run_instances {}", template_id));
            s.next_instance += 1;
            let id = format!("i-{:04}", s.next_instance);
            s.instances.insert(
                id.clone(),
                Instance {
                    live: true,
                    ..Default::default()
                },
            );
            Ok(vec![id])
        })
    }

    fn wait_instances_exist(&self, instance_ids: &[String]) -> Result<()> {
        self.with(|s| s.calls.push(format!("wait_exist {}", instance_ids.join(","))));
        Ok(())
    }

    fn tag_instances(&self, instance_ids: &[String], key: &str, value: &str) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(format!("tag {} {}={}", instance_ids.join(","), key, value));
            for id in instance_ids {
                if let Some(instance) = s.instances.get_mut(id) {
                    instance.tags.insert(key.to_string(), value.to_string());
                }
            }
            Ok(())
        })
    }

    fn wait_instances_healthy(&self, instance_ids: &[String]) -> Result<()> {
        self.with(|s| {
            s.calls
                .push(format!("wait_healthy {}", instance_ids.join(",")));
            if s.fail_health {
                return Err(OrchestrationError::backend(
                    "aws ec2 wait instance-status-ok",
                    "Waiter InstanceStatusOk failed: Max attempts exceeded",
                ));
            }
            if !s.manual_registration {
                for id in instance_ids {
                    register(s, id);
                }
            }
            Ok(())
        })
    }

    fn find_instances_by_tag(&self, key: &str, value: &str) -> Result<Vec<String>> {
        self.with(|s| {
            Ok(s.instances
                .iter()
                .filter(|(_, i)| i.live && i.tags.get(key).map(String::as_str) == Some(value))
                .map(|(id, _)| id.clone())
                .collect())
        })
    }

    fn terminate_instances(&self, instance_ids: &[String]) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("terminate {}", instance_ids.join(",")));
            for id in instance_ids {
                if let Some(instance) = s.instances.get_mut(id) {
                    instance.live = false;
                }
                s.members.retain(|m| &m.ec2_instance_id != id);
            }
            Ok(())
        })
    }
}

impl ClusterApi for FakeCloud {
    fn container_instances(&self, _cluster: &str) -> Result<Vec<ContainerInstance>> {
        self.with(|s| Ok(s.members.clone()))
    }

    fn put_attribute(
        &self,
        _cluster: &str,
        container_instance_arn: &str,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.with(|s| {
            s.attributes.insert(
                (container_instance_arn.to_string(), name.to_string()),
                value.to_string(),
            );
            Ok(())
        })
    }

    fn start_task(&self, launch: &TaskLaunch) -> Result<String> {
        self.with(|s| {
            let arn = format!(
                "arn:aws:ecs:us-east-1:1:task/{}/task{:03}",
                launch.cluster,
                s.launches.len() + 1
            );
            let script = s.scripts.pop_front().unwrap_or_else(|| TaskScript {
                statuses: VecDeque::new(),
                containers: vec![(launch.container.clone(), Some(0))],
            });
            s.tasks.insert(arn.clone(), script);
            s.launches.push(launch.clone());
            Ok(arn)
        })
    }

    fn describe_task(&self, _cluster: &str, task_arn: &str) -> Result<TaskDescription> {
        self.with(|s| {
            let script = s.tasks.get_mut(task_arn).ok_or_else(|| {
                OrchestrationError::backend("aws ecs describe-tasks", "MISSING")
            })?;
            if let Some(status) = script.statuses.pop_front() {
                return Ok(TaskDescription {
                    last_status: status,
                    stopped_reason: None,
                    containers: Vec::new(),
                });
            }
            Ok(TaskDescription {
                last_status: "STOPPED".to_string(),
                stopped_reason: Some("Essential container in task exited".to_string()),
                containers: script
                    .containers
                    .iter()
                    .map(|(name, code)| ContainerState {
                        name: name.clone(),
                        exit_code: *code,
                        reason: code.is_none().then(|| "CannotPullContainerError".to_string()),
                    })
                    .collect(),
            })
        })
    }

    fn stop_task(&self, _cluster: &str, task_arn: &str, _reason: &str) -> Result<()> {
        self.with(|s| {
            s.stopped.push(task_arn.to_string());
            Ok(())
        })
    }
}

impl LogApi for FakeCloud {
    fn fetch_log_page(
        &self,
        _group: &str,
        stream: &str,
        _next_token: Option<&str>,
    ) -> Result<LogPage> {
        self.with(|s| {
            s.last_stream = Some(stream.to_string());
            let messages = s.log_pages.pop_front().unwrap_or_default();
            let next_token = (!s.log_pages.is_empty()).then(|| format!("t{}", s.log_pages.len()));
            Ok(LogPage {
                messages,
                next_token,
            })
        })
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Submission {
    pub script: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub workdir: Option<String>,
}

#[derive(Default)]
struct SchedulerState {
    active: VecDeque<Vec<String>>,
    final_states: Vec<String>,
    submissions: Vec<Submission>,
    log: Vec<String>,
    cancellations: usize,
}

/// Fake Slurm: every job walks the scripted active states, then reports the
/// final states forever.
#[derive(Default)]
pub(crate) struct FakeScheduler {
    state: Mutex<SchedulerState>,
}

impl FakeScheduler {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script(&self, active: Vec<Vec<String>>, final_states: Vec<String>) {
        let mut s = self.state.lock().expect("lock");
        s.active = active.into();
        s.final_states = final_states;
    }

    pub(crate) fn set_log(&self, lines: Vec<String>) {
        self.state.lock().expect("lock").log = lines;
    }

    pub(crate) fn last_submission(&self) -> Option<Submission> {
        self.state.lock().expect("lock").submissions.last().cloned()
    }

    pub(crate) fn submissions(&self) -> Vec<Submission> {
        self.state.lock().expect("lock").submissions.clone()
    }

    pub(crate) fn cancellations(&self) -> usize {
        self.state.lock().expect("lock").cancellations
    }
}

impl BatchScheduler for FakeScheduler {
    fn submit(
        &self,
        script: &str,
        args: &[String],
        env: &[(String, String)],
        workdir: Option<&str>,
    ) -> Result<String> {
        let mut s = self.state.lock().expect("lock");
        s.submissions.push(Submission {
            script: script.to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
            workdir: workdir.map(str::to_string),
        });
        Ok(format!("{}", 1000 + s.submissions.len()))
    }

    fn job_states(&self, _job_id: &str) -> Result<Vec<String>> {
        let mut s = self.state.lock().expect("lock");
        match s.active.pop_front() {
            Some(states) => Ok(states),
            None => Ok(s.final_states.clone()),
        }
    }

    fn cancel(&self, _job_id: &str) -> Result<()> {
        self.state.lock().expect("lock").cancellations += 1;
        Ok(())
    }

    fn completion_log(&self, _job_id: &str, _workdir: Option<&str>) -> Result<Vec<String>> {
        Ok(self.state.lock().expect("lock").log.clone())
    }
}
