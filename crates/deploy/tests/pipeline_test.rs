//! End-to-end pipeline runs against the in-memory cloud.
//!
//! Run with: cargo test --test pipeline_test

use std::{path::Path, time::Duration};

use stackdrop_deploy::{
    AssetTarget, Cancellation, DeployError, DeployTarget, DeploymentPipeline, InvalidationOutcome,
    OutputsStore, PipelineSettings, Poller, RecordingReporter, TargetState,
    descriptor_fingerprint,
    fake::{FakeCloud, FakeStackBehavior},
    types::{StackDescriptor, TemplateSource},
};
use tempdir::TempDir;

fn settings() -> PipelineSettings {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let mut settings = PipelineSettings::new("dev");
    settings.stack_poller = Poller::new(Duration::from_millis(1), 20);
    settings.invalidation_poller = Poller::new(Duration::from_millis(1), 3);
    settings
}

fn write_build(root: &Path, files: &[&str]) {
    for file in files {
        let path = root.join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, format!("contents of {file}")).unwrap();
    }
}

/// A unit with a static site under `<workdir>/<name>/dist`.
fn site_target(workdir: &Path, name: &str) -> DeployTarget {
    let build_dir = workdir.join(name).join("dist");
    write_build(&build_dir, &["index.html", "assets/app.js"]);

    DeployTarget {
        name: name.to_string(),
        stack: StackDescriptor::new(
            format!("{name}-dev"),
            TemplateSource::File("infra/site.yaml".into()),
        )
        .parameter("Stage", "dev"),
        outputs: OutputsStore::new(workdir.join(".stackdrop").join(format!("{name}.outputs.json"))),
        assets: Some(AssetTarget::new(build_dir)),
    }
}

fn backend_target(workdir: &Path, name: &str) -> DeployTarget {
    DeployTarget {
        assets: None,
        ..site_target(workdir, name)
    }
}

#[tokio::test]
async fn test_full_deploy_walks_every_state() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    let reporter = RecordingReporter::new();
    let target = site_target(workdir.path(), "site");

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(std::slice::from_ref(&target))
        .await;

    assert!(report.is_success());
    assert_eq!(
        reporter.states("site"),
        vec![
            TargetState::StackApplying,
            TargetState::StackApplied,
            TargetState::CredentialsAcquired,
            TargetState::AssetsSyncing,
            TargetState::AssetsSynced,
            TargetState::CacheInvalidating,
            TargetState::Done,
        ]
    );

    let site = report.get("site").unwrap();
    assert!(matches!(
        site.invalidation,
        Some(InvalidationOutcome::Completed { .. })
    ));
    assert!(site.warnings.is_empty());
    assert_eq!(site.sync.as_ref().unwrap().uploaded.len(), 2);

    // Assets were mirrored with the scoped role, into the stack's bucket.
    assert_eq!(cloud.object_keys("site-dev-assets").len(), 2);
    let object = cloud.object("site-dev-assets", "index.html").unwrap();
    assert_eq!(object.content_type, "text/html; charset=utf-8");
    let sessions = cloud.assumed_sessions();
    assert_eq!(sessions[0].role, "role/site-dev-deployer");
    assert_eq!(cloud.invalidation_requests()[0].distribution_id, "dist-site-dev");

    // Outputs are persisted with the fingerprint of the applied descriptor.
    let record = target.outputs.get("dev").unwrap();
    assert_eq!(record.outputs.require("BucketName").unwrap(), "site-dev-assets");
    assert_eq!(
        record.fingerprint,
        Some(descriptor_fingerprint(&target.stack))
    );
}

#[tokio::test]
async fn test_failed_target_does_not_stop_batch() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.set_behavior(
        "b-dev",
        FakeStackBehavior::Fail {
            reason: "Resource limit exceeded".to_string(),
        },
    );
    let reporter = RecordingReporter::new();
    let targets = vec![
        site_target(workdir.path(), "a"),
        site_target(workdir.path(), "b"),
        site_target(workdir.path(), "c"),
    ];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(&targets)
        .await;

    let states: Vec<_> = report.targets.iter().map(|t| (t.name.as_str(), t.state)).collect();
    assert_eq!(
        states,
        vec![
            ("a", TargetState::Done),
            ("b", TargetState::Failed),
            ("c", TargetState::Done),
        ]
    );
    assert!(!report.is_success());
    assert_eq!(reporter.start_order(), vec!["a", "b", "c"]);

    let failed = report.get("b").unwrap();
    assert_eq!(failed.failed_at, Some(TargetState::StackApplying));
    match &failed.error {
        Some(DeployError::ControlPlane { stack, reason }) => {
            assert_eq!(stack, "b-dev");
            assert_eq!(reason, "Resource limit exceeded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(cloud.object_keys("b-dev-assets").is_empty());
    assert_eq!(cloud.object_keys("c-dev-assets").len(), 2);
}

#[tokio::test]
async fn test_parallel_batch_keeps_report_order() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.set_behavior(
        "b-dev",
        FakeStackBehavior::Fail {
            reason: "boom".to_string(),
        },
    );
    let reporter = RecordingReporter::new();
    let targets = vec![
        site_target(workdir.path(), "a"),
        site_target(workdir.path(), "b"),
        site_target(workdir.path(), "c"),
    ];
    let mut settings = settings();
    settings.concurrency = 3;

    let report = DeploymentPipeline::new(&cloud, settings, &reporter, Cancellation::new())
        .run(&targets)
        .await;

    let names: Vec<_> = report.targets.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);
    assert_eq!(report.failed().count(), 1);
    assert_eq!(report.get("b").unwrap().state, TargetState::Failed);
}

#[tokio::test]
async fn test_stalled_invalidation_is_a_warning() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.stall_invalidations();
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(&targets)
        .await;

    assert!(report.is_success());
    let site = report.get("site").unwrap();
    assert!(matches!(
        site.invalidation,
        Some(InvalidationOutcome::Unconfirmed { attempts: 3, .. })
    ));
    assert_eq!(site.warnings.len(), 1);
    assert_eq!(reporter.warnings().len(), 1);
}

#[tokio::test]
async fn test_stuck_stack_times_out() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.set_behavior("site-dev", FakeStackBehavior::Stuck);
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];
    let mut settings = settings();
    settings.stack_poller = Poller::new(Duration::from_millis(1), 4);

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        DeploymentPipeline::new(&cloud, settings, &reporter, Cancellation::new()).run(&targets),
    )
    .await
    .expect("pipeline must not hang on a stuck stack");

    let site = report.get("site").unwrap();
    assert_eq!(site.state, TargetState::Failed);
    assert!(site.error.as_ref().unwrap().is_poll_timeout());
    assert_eq!(site.error.as_ref().unwrap().kind(), "TransientPollTimeout");
}

#[tokio::test]
async fn test_missing_role_output_stops_before_assets() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.set_template_outputs(
        "site-dev",
        [("BucketName", "site-dev-assets"), ("DistributionId", "dist-1")],
    );
    let reporter = RecordingReporter::new();
    let target = site_target(workdir.path(), "site");

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(std::slice::from_ref(&target))
        .await;

    let site = report.get("site").unwrap();
    assert_eq!(site.state, TargetState::Failed);
    assert_eq!(site.failed_at, Some(TargetState::StackApplied));
    assert!(matches!(site.error, Some(DeployError::Configuration(_))));
    assert!(cloud.assumed_sessions().is_empty());
    assert_eq!(cloud.calls_named("put_object"), 0);

    // The stack itself was applied, so its outputs are still recorded.
    assert!(target.outputs.get("dev").is_some());
}

#[tokio::test]
async fn test_untrusted_role_is_authorization_failure() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.untrust_role("role/site-dev-deployer");
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(&targets)
        .await;

    let site = report.get("site").unwrap();
    assert!(matches!(site.error, Some(DeployError::Authorization(_))));
    assert_eq!(cloud.calls_named("assume_role"), 1);
}

#[tokio::test]
async fn test_unit_without_assets_ends_after_stack() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    let reporter = RecordingReporter::new();
    let targets = vec![backend_target(workdir.path(), "api")];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(&targets)
        .await;

    assert!(report.is_success());
    assert_eq!(
        reporter.states("api"),
        vec![
            TargetState::StackApplying,
            TargetState::StackApplied,
            TargetState::Done
        ]
    );
    assert_eq!(cloud.calls_named("assume_role"), 0);
    assert!(report.get("api").unwrap().sync.is_none());
}

#[tokio::test]
async fn test_disabled_distribution_skips_invalidation() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    let reporter = RecordingReporter::new();
    let mut target = site_target(workdir.path(), "site");
    if let Some(assets) = target.assets.as_mut() {
        assets.distribution_output = None;
    }

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .run(&[target])
        .await;

    assert!(report.is_success());
    assert!(cloud.invalidation_requests().is_empty());
    assert!(!reporter.states("site").contains(&TargetState::CacheInvalidating));
}

#[tokio::test]
async fn test_cancelled_run_starts_nothing() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    let reporter = RecordingReporter::new();
    let targets = vec![
        site_target(workdir.path(), "a"),
        site_target(workdir.path(), "b"),
    ];
    let cancel = Cancellation::new();
    cancel.cancel();

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, cancel)
        .run(&targets)
        .await;

    assert_eq!(report.failed().count(), 2);
    assert!(report
        .targets
        .iter()
        .all(|t| matches!(t.error, Some(DeployError::Cancelled))));
    assert!(cloud.calls().is_empty());
}

#[tokio::test]
async fn test_cancel_interrupts_stack_wait() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.set_behavior("site-dev", FakeStackBehavior::Stuck);
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];
    let mut settings = settings();
    settings.stack_poller = Poller::new(Duration::from_millis(50), 10_000);

    let cancel = Cancellation::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(120)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(
        Duration::from_secs(5),
        DeploymentPipeline::new(&cloud, settings, &reporter, cancel).run(&targets),
    )
    .await
    .expect("cancellation must end the wait");

    let site = report.get("site").unwrap();
    assert!(matches!(site.error, Some(DeployError::Cancelled)));
    assert_eq!(site.failed_at, Some(TargetState::StackApplying));
}

#[tokio::test]
async fn test_cancel_during_upload_keeps_stale_objects() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.seed_objects("site-dev-assets", ["old.css"]);
    let cancel = Cancellation::new();
    cloud.cancel_on_upload("index.html", cancel.clone());
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, cancel)
        .run(&targets)
        .await;

    let site = report.get("site").unwrap();
    assert!(matches!(site.error, Some(DeployError::Cancelled)));
    assert_eq!(site.failed_at, Some(TargetState::AssetsSyncing));
    assert_eq!(cloud.calls_named("delete_object"), 0);
    assert!(cloud.object_keys("site-dev-assets").contains("old.css"));
    assert!(cloud.invalidation_requests().is_empty());
}

#[tokio::test]
async fn test_remove_purges_bucket_and_forgets_outputs() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    let target = site_target(workdir.path(), "site");
    let targets = std::slice::from_ref(&target);

    let deploy_reporter = RecordingReporter::new();
    let deployed =
        DeploymentPipeline::new(&cloud, settings(), &deploy_reporter, Cancellation::new())
            .run(targets)
            .await;
    assert!(deployed.is_success());
    assert!(!cloud.object_keys("site-dev-assets").is_empty());

    let reporter = RecordingReporter::new();
    let removed = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .remove(targets)
        .await;

    assert!(removed.is_success());
    assert_eq!(
        reporter.states("site"),
        vec![
            TargetState::CredentialsAcquired,
            TargetState::AssetsSyncing,
            TargetState::AssetsSynced,
            TargetState::StackDestroying,
            TargetState::Done,
        ]
    );
    assert!(cloud.object_keys("site-dev-assets").is_empty());
    assert_eq!(cloud.stack_status("site-dev"), None);
    assert!(target.outputs.get("dev").is_none());
}

#[tokio::test]
async fn test_remove_missing_stack_is_noop() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .remove(&targets)
        .await;

    assert!(report.is_success());
    assert_eq!(cloud.calls_named("delete_stack"), 0);
    assert_eq!(cloud.calls_named("assume_role"), 0);
}

#[tokio::test]
async fn test_remove_rolled_back_stack_warns_and_deletes() {
    let workdir = TempDir::new("stackdrop-pipeline").unwrap();
    let cloud = FakeCloud::new();
    cloud.insert_stack("site-dev", "UPDATE_ROLLBACK_COMPLETE");
    let reporter = RecordingReporter::new();
    let targets = vec![site_target(workdir.path(), "site")];

    let report = DeploymentPipeline::new(&cloud, settings(), &reporter, Cancellation::new())
        .remove(&targets)
        .await;

    let site = report.get("site").unwrap();
    assert_eq!(site.state, TargetState::Done);
    assert_eq!(site.warnings.len(), 1);
    assert_eq!(cloud.calls_named("assume_role"), 0);
    assert_eq!(cloud.stack_status("site-dev"), None);
}
