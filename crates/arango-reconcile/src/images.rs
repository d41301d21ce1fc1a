//! Image discovery
//!
//! Upgrade and rotation decisions compare members by ArangoDB version and
//! edition, which the builders read from `status.images`. An image
//! reference is recorded there the first time it shows up, either in the
//! spec or on a running member pod. Members that run a known image without
//! having it recorded get it assigned, and the deployment's current image
//! is seeded from what the members run.

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, info, instrument, warn};

use arango_common::crd::{ImageInfo, ServerGroup, Version};
use arango_common::Result;

use crate::context::ActionContext;

/// Name of the arangod container in member pods
pub const SERVER_CONTAINER: &str = "server";

/// Version and edition derived from an image reference
///
/// The tag must carry the version (`arangodb/enterprise:3.11.4`). Images
/// from an `enterprise` repository are enterprise builds.
pub fn image_info_from_reference(image: &str, image_id: &str) -> Option<ImageInfo> {
    let reference = image.split('@').next().unwrap_or(image);
    let last_segment = reference.rsplit('/').next().unwrap_or(reference);
    let (repository, tag) = last_segment.split_once(':')?;
    if !tag.starts_with(|c: char| c.is_ascii_digit()) {
        return None;
    }
    let version = tag.parse::<Version>().ok()?;
    Some(ImageInfo {
        image: image.to_string(),
        image_id: image_id.to_string(),
        arangodb_version: version.to_string(),
        enterprise: repository.contains("enterprise"),
    })
}

/// Image and resolved digest of the server container of a pod
fn server_image(pod: &Pod) -> Option<(String, String)> {
    let image = pod
        .spec
        .as_ref()?
        .containers
        .iter()
        .find(|c| c.name == SERVER_CONTAINER)?
        .image
        .clone()?;
    let image_id = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.name == SERVER_CONTAINER))
        .map(|c| c.image_id.clone())
        .unwrap_or_default();
    Some((image, image_id))
}

/// Record unknown images and seed member and current images
///
/// Returns whether the status was written.
#[instrument(skip(ctx), fields(deployment = %ctx.deployment_name()))]
pub async fn inspect_images(ctx: &dyn ActionContext) -> Result<bool> {
    let status = ctx.status().await?;
    let inspector = ctx.inspector();
    let spec_image = ctx.spec().image.clone();

    let mut discovered: Vec<ImageInfo> = Vec::new();
    let mut running: Vec<(ServerGroup, String, String)> = Vec::new();
    let is_known = |image: &str, discovered: &[ImageInfo]| {
        status.image_info(image).is_some() || discovered.iter().any(|i| i.image == image)
    };

    for (group, member) in status.members.iter() {
        let Some((image, image_id)) = inspector.pod(&member.pod_name).as_ref().and_then(server_image)
        else {
            continue;
        };
        if !is_known(&image, &discovered) {
            match image_info_from_reference(&image, &image_id) {
                Some(found) => discovered.push(found),
                None => debug!(member_id = %member.id, image = %image, "no version in image tag"),
            }
        }
        running.push((group, member.id.clone(), image));
    }

    if !is_known(&spec_image, &discovered) {
        match image_info_from_reference(&spec_image, "") {
            Some(found) => discovered.push(found),
            None => warn!(image = %spec_image, "cannot derive version from image tag, upgrades are held"),
        }
    }

    for found in &discovered {
        info!(image = %found.image, version = %found.arangodb_version, enterprise = found.enterprise, "discovered image");
    }

    ctx.mutate_status(Box::new(move |s| {
        let mut changed = false;
        for found in &discovered {
            if s.image_info(&found.image).is_none() {
                s.images.push(found.clone());
                changed = true;
            }
        }
        for (group, id, image) in &running {
            let Some(found) = s.image_info(image).cloned() else {
                continue;
            };
            if let Some(member) = s.members.group_mut(*group).iter_mut().find(|m| &m.id == id) {
                if member.image.is_none() {
                    member.image = Some(found);
                    changed = true;
                }
            }
        }
        if s.current_image.is_none() {
            let current = running
                .first()
                .map(|(_, _, image)| image.as_str())
                .unwrap_or(spec_image.as_str());
            if let Some(found) = s.image_info(current).cloned() {
                s.current_image = Some(found);
                changed = true;
            }
        }
        changed
    }))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::create_plan;
    use crate::plan::tests::{healthy_cluster, pods_for};
    use crate::testing::FakeContext;
    use crate::plan::Preconditions;
    use arango_common::crd::{ActionType, ConditionType, DeploymentStatus};
    use rstest::rstest;

    #[rstest]
    #[case("arangodb/enterprise:3.11.4", Some(("3.11.4", true)))]
    #[case("arangodb/arangodb:3.10.2-1", Some(("3.10.2", false)))]
    #[case("registry.local:5000/arangodb/enterprise:3.12", Some(("3.12.0", true)))]
    #[case("arangodb/arangodb:latest", None)]
    #[case("arangodb/arangodb", None)]
    fn version_comes_from_the_tag(#[case] image: &str, #[case] expected: Option<(&str, bool)>) {
        let found = image_info_from_reference(image, "");
        assert_eq!(
            found.as_ref().map(|i| (i.arangodb_version.as_str(), i.enterprise)),
            expected
        );
    }

    /// Status as a freshly created deployment has it: members exist, but
    /// nothing about their images has been recorded yet
    fn without_images() -> (arango_common::crd::DeploymentSpec, DeploymentStatus) {
        let (spec, mut status) = healthy_cluster();
        status.images.clear();
        status.current_image = None;
        for group in ServerGroup::ALL {
            for m in status.members.group_mut(group) {
                m.image = None;
            }
        }
        (spec, status)
    }

    #[tokio::test]
    async fn running_images_are_recorded_and_assigned() {
        let (spec, status) = without_images();
        let snapshot = pods_for(&status, &spec.image);
        let ctx = FakeContext::new()
            .with_spec(spec.clone())
            .with_status(status)
            .with_snapshot(snapshot);

        assert!(inspect_images(&ctx).await.expect("inspect"));
        let status = ctx.current();
        assert_eq!(status.images.len(), 1);
        assert_eq!(
            status.current_image.as_ref().map(|i| i.image.as_str()),
            Some(spec.image.as_str())
        );
        assert!(status.members.iter().all(|(_, m)| m.image.is_some()));

        let mut encrypted = spec.clone();
        encrypted.encryption.key_secret_name = Some("enc".to_string());
        assert!(Preconditions::evaluate(&encrypted, &status).encryption);

        assert!(!inspect_images(&ctx).await.expect("second pass"), "nothing left to record");
    }

    /// Story: a coordinator asks for a restart on a deployment whose images
    /// were never recorded. After discovery the rotation builder is no
    /// longer held and the restart is planned.
    #[tokio::test]
    async fn restart_is_planned_once_images_are_known() {
        let (spec, mut status) = without_images();
        status.members.group_mut(ServerGroup::Coordinators)[1]
            .conditions
            .update(ConditionType::Restart, true, "", "", "");
        let snapshot = pods_for(&status, &spec.image);
        let ctx = FakeContext::new()
            .with_spec(spec)
            .with_status(status)
            .with_snapshot(snapshot);

        inspect_images(&ctx).await.expect("inspect");
        create_plan(&ctx).await.expect("plan");

        let plan = ctx.current().plan;
        assert!(
            plan.contains_type(&ActionType::RotateMember),
            "expected a rotation, got {:?}",
            plan.iter().map(|a| a.type_.as_str()).collect::<Vec<_>>()
        );
    }

    #[tokio::test]
    async fn new_spec_image_is_recorded_before_pods_run_it() {
        let (mut spec, status) = healthy_cluster();
        let snapshot = pods_for(&status, &spec.image);
        spec.image = "arangodb/enterprise:3.12.1".to_string();
        let ctx = FakeContext::new()
            .with_spec(spec)
            .with_status(status)
            .with_snapshot(snapshot);

        assert!(inspect_images(&ctx).await.expect("inspect"));
        let status = ctx.current();
        let recorded = status
            .image_info("arangodb/enterprise:3.12.1")
            .expect("new image recorded");
        assert_eq!(recorded.arangodb_version, "3.12.1");
        // The deployment still runs the old image.
        assert_eq!(
            status.current_image.map(|i| i.arangodb_version),
            Some("3.11.4".to_string())
        );
    }
}
