use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use surge_core::{OrchestrationError, Result, RunTag};
use tracing::{debug, info, warn};

use crate::cloud::{ClusterApi, InstanceApi};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    Requesting,
    Tagged,
    HealthChecking,
    Ready,
    Released,
    ReleaseFailed,
}

/// Exclusively leased compute instances backing one stage of one run.
#[derive(Debug, Clone, Serialize)]
pub struct ComputeClaim {
    pub run_tag: String,
    pub template_id: String,
    pub instance_ids: Vec<String>,
    pub status: ClaimStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "instance_ids", rename_all = "snake_case")]
pub enum ReleaseOutcome {
    Terminated(Vec<String>),
    /// Nothing carried the tag any more. Recoverable, not an error.
    AlreadyReleased,
}

/// Leases instances from launch templates and tags them with the run tag.
///
/// The tag is the only record of ownership: release looks instances up by
/// tag, so a claim can be torn down by a different process than the one that
/// created it.
pub struct ComputeClaimManager {
    instances: Arc<dyn InstanceApi>,
    tag_key: String,
    bind_delay: Duration,
    bind_attempts: u32,
}

impl ComputeClaimManager {
    pub fn new(instances: Arc<dyn InstanceApi>, tag_key: impl Into<String>) -> Self {
        Self {
            instances,
            tag_key: tag_key.into(),
            bind_delay: Duration::from_secs(10),
            bind_attempts: 30,
        }
    }

    /// How long to wait for claimed instances to register with a cluster.
    pub fn with_bind_wait(mut self, delay: Duration, attempts: u32) -> Self {
        self.bind_delay = delay;
        self.bind_attempts = attempts.max(1);
        self
    }

    pub fn tag_key(&self) -> &str {
        &self.tag_key
    }

    /// Create, tag, then health-check. Tagging happens as soon as the
    /// instances exist so no healthy-but-untagged window is visible to a
    /// concurrent run.
    pub fn claim(&self, tag: &RunTag, template_id: &str) -> Result<ComputeClaim> {
        let mut claim = ComputeClaim {
            run_tag: tag.to_string(),
            template_id: template_id.to_string(),
            instance_ids: Vec::new(),
            status: ClaimStatus::Requesting,
        };
        info!(run_tag = %tag, template_id, "requesting compute claim");
        claim.instance_ids = self
            .instances
            .run_instances(template_id)
            .map_err(|e| OrchestrationError::claim(tag, e.to_string()))?;
        if claim.instance_ids.is_empty() {
            return Err(OrchestrationError::claim(
                tag,
                format!("launch template {} produced no instances", template_id),
            ));
        }
        if let Err(e) = self.tag_and_check(tag, &mut claim) {
            self.abandon(&claim);
            return Err(OrchestrationError::claim(tag, e.to_string()));
        }
        claim.status = ClaimStatus::Ready;
        info!(run_tag = %tag, instances = ?claim.instance_ids, "compute claim ready");
        Ok(claim)
    }

    fn tag_and_check(&self, tag: &RunTag, claim: &mut ComputeClaim) -> Result<()> {
        self.instances.wait_instances_exist(&claim.instance_ids)?;
        self.instances
            .tag_instances(&claim.instance_ids, &self.tag_key, &tag.to_string())?;
        claim.status = ClaimStatus::Tagged;
        debug!(run_tag = %tag, instances = ?claim.instance_ids, "instances tagged");
        claim.status = ClaimStatus::HealthChecking;
        self.instances.wait_instances_healthy(&claim.instance_ids)
    }

    /// Best-effort termination of instances from a claim that never became
    /// ready. They may be untagged, so this goes by id.
    fn abandon(&self, claim: &ComputeClaim) {
        if let Err(e) = self.instances.terminate_instances(&claim.instance_ids) {
            warn!(
                run_tag = %claim.run_tag,
                instances = ?claim.instance_ids,
                error = %e,
                "failed to terminate instances of an incomplete claim"
            );
        }
    }

    pub fn release(&self, tag: &RunTag) -> Result<ReleaseOutcome> {
        let ids = self
            .instances
            .find_instances_by_tag(&self.tag_key, &tag.to_string())?;
        if ids.is_empty() {
            info!(run_tag = %tag, "no instances carry the run tag; already released");
            return Ok(ReleaseOutcome::AlreadyReleased);
        }
        self.instances.terminate_instances(&ids)?;
        info!(run_tag = %tag, instances = ?ids, "compute claim released");
        Ok(ReleaseOutcome::Terminated(ids))
    }

    /// Run `body` against a fresh claim; release runs on every exit path.
    pub fn with_claim<T, F>(&self, tag: &RunTag, template_id: &str, body: F) -> Result<T>
    where
        F: FnOnce(&ComputeClaim) -> Result<T>,
    {
        let claim = self.claim(tag, template_id)?;
        let guard = ClaimGuard {
            manager: self,
            tag,
            claim,
        };
        body(&guard.claim)
    }

    /// Mark the claimed instances' cluster membership with the placement
    /// attribute so tasks can be pinned to them. Returns the container
    /// instance ARNs.
    pub fn bind_to_cluster(
        &self,
        claim: &ComputeClaim,
        cluster_api: &dyn ClusterApi,
        cluster: &str,
        attribute: &str,
    ) -> Result<Vec<String>> {
        let mut members = Vec::new();
        for attempt in 1..=self.bind_attempts {
            members = cluster_api.container_instances(cluster)?;
            let bound: Vec<String> = members
                .iter()
                .filter(|m| claim.instance_ids.contains(&m.ec2_instance_id))
                .map(|m| m.arn.clone())
                .collect();
            if !bound.is_empty() {
                for arn in &bound {
                    cluster_api.put_attribute(cluster, arn, attribute, &claim.run_tag)?;
                }
                info!(run_tag = %claim.run_tag, cluster, container_instances = ?bound, "claim bound to cluster");
                return Ok(bound);
            }
            if attempt < self.bind_attempts {
                thread::sleep(self.bind_delay);
            }
        }
        if members.is_empty() {
            return Err(OrchestrationError::Config(format!(
                "cluster {} has no container instances; check the launch template's cluster association",
                cluster
            )));
        }
        Err(OrchestrationError::claim(
            &claim.run_tag,
            format!(
                "none of the claimed instances {:?} registered with cluster {}",
                claim.instance_ids, cluster
            ),
        ))
    }
}

struct ClaimGuard<'a> {
    manager: &'a ComputeClaimManager,
    tag: &'a RunTag,
    claim: ComputeClaim,
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        match self.manager.release(self.tag) {
            Ok(_) => self.claim.status = ClaimStatus::Released,
            Err(e) => {
                self.claim.status = ClaimStatus::ReleaseFailed;
                warn!(
                    run_tag = %self.tag,
                    instances = ?self.claim.instance_ids,
                    error = %e,
                    "claim release failed; instances must be terminated by tag manually"
                );
            }
        }
        debug!(run_tag = %self.tag, status = ?self.claim.status, "claim scope closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeCloud;

    fn manager(cloud: &Arc<FakeCloud>) -> ComputeClaimManager {
        ComputeClaimManager::new(cloud.clone(), "Workflow Tag")
            .with_bind_wait(Duration::ZERO, 2)
    }

    #[test]
    fn claim_tags_then_checks_health_and_release_finds_by_tag() {
        let cloud = Arc::new(FakeCloud::new());
        let tag = RunTag::new("IAN", 2022, "7").expect("tag");
        let claims = manager(&cloud);

        let claim = claims.claim(&tag, "tmpl-A").expect("claim");
        assert_eq!(claim.status, ClaimStatus::Ready);
        assert_eq!(claim.instance_ids.len(), 1);
        let id = claim.instance_ids[0].clone();
        assert_eq!(
            cloud.calls(),
            vec![
                "run_instances tmpl-A".to_string(),
                format!("wait_exist {}", id),
                format!("tag {} Workflow Tag=IAN_2022_7", id),
                format!("wait_healthy {}", id),
            ]
        );

        let released = claims.release(&tag).expect("release");
        assert_eq!(released, ReleaseOutcome::Terminated(vec![id.clone()]));
        assert_eq!(cloud.calls().last(), Some(&format!("terminate {}", id)));
        assert_eq!(claims.release(&tag).expect("again"), ReleaseOutcome::AlreadyReleased);
    }

    #[test]
    fn with_claim_releases_when_the_body_fails() {
        let cloud = Arc::new(FakeCloud::new());
        let tag = RunTag::new("IAN", 2022, "7").expect("tag");
        let claims = manager(&cloud);
        let err = claims
            .with_claim(&tag, "tmpl-A", |_| {
                Err::<(), _>(OrchestrationError::Dispatch("boom".to_string()))
            })
            .expect_err("body error");
        assert!(matches!(err, OrchestrationError::Dispatch(_)));
        assert!(cloud.live_instances().is_empty());
    }

    #[test]
    fn failed_health_check_terminates_by_id_and_is_a_claim_error() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.fail_health_checks();
        let tag = RunTag::new("IAN", 2022, "7").expect("tag");
        let err = manager(&cloud).claim(&tag, "tmpl-A").expect_err("unhealthy");
        assert!(matches!(err, OrchestrationError::Claim { .. }));
        assert!(cloud.live_instances().is_empty());
    }

    #[test]
    fn binding_distinguishes_empty_cluster_from_unregistered_claim() {
        let cloud = Arc::new(FakeCloud::new());
        cloud.auto_register(false);
        let tag = RunTag::new("IAN", 2022, "7").expect("tag");
        let claims = manager(&cloud);
        let claim = claims.claim(&tag, "tmpl-A").expect("claim");

        let err = claims
            .bind_to_cluster(&claim, cloud.as_ref(), "odssm-cluster", "run-tag")
            .expect_err("empty cluster");
        assert!(matches!(err, OrchestrationError::Config(_)), "{}", err);

        cloud.register_foreign_member("i-other");
        let err = claims
            .bind_to_cluster(&claim, cloud.as_ref(), "odssm-cluster", "run-tag")
            .expect_err("not registered");
        assert!(matches!(err, OrchestrationError::Claim { .. }), "{}", err);

        cloud.register_member(&claim.instance_ids[0]);
        let arns = claims
            .bind_to_cluster(&claim, cloud.as_ref(), "odssm-cluster", "run-tag")
            .expect("bound");
        assert_eq!(arns.len(), 1);
        assert_eq!(
            cloud.attribute(&arns[0], "run-tag"),
            Some("IAN_2022_7".to_string())
        );
    }
}
