//! End-to-end deploy/rollback behavior over in-memory collaborators.

mod support;

use std::time::Duration;

use shipyard_core::cancel::CancelToken;
use shipyard_core::error::{DeployError, Step};
use shipyard_core::ledger::{DeploymentKind, ReleaseStatus, StepStatus};
use shipyard_core::orchestration::DeployRequest;
use shipyard_core::registry::Color;

use support::Harness;

fn request(environment: &str, revision: &str) -> DeployRequest {
    DeployRequest::new("checkout", environment)
        .with_revision(revision)
        .with_initiator("ci")
}

#[tokio::test]
async fn first_deploy_goes_live_on_blue_ports() {
    let h = Harness::new();

    let record = h
        .orchestrator
        .deploy(request("qa", "abc123"), &CancelToken::new())
        .await
        .unwrap();

    assert!(record.is_live(), "{:?}", record);
    assert_eq!(record.kind, DeploymentKind::Deploy);
    assert_eq!(record.initiator, "ci");

    let current = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();
    assert_eq!(record.release_id.as_deref(), Some(current.id.as_str()));
    assert!(current.revision.commit.starts_with("abc123"));
    assert_eq!(current.color, Color::Blue);
    assert_eq!(current.ports["web"], 8100);
    assert_eq!(current.deployed_by, "ci");
    assert!(current.promoted_at.is_some());

    assert!(h.site("qa").unwrap().contains("127.0.0.1:8100"));
    assert_eq!(
        h.supervisor.running(),
        current.programs.iter().cloned().collect()
    );
    let link = h.orchestrator.current_link("checkout", "qa");
    assert_eq!(std::fs::read_link(link).unwrap(), current.path);
    assert_eq!(*h.installer.installs.lock().unwrap(), 1);
}

#[tokio::test]
async fn unhealthy_release_is_torn_down_and_live_release_untouched() {
    let h = Harness::new();
    let cancel = CancelToken::new();
    h.orchestrator
        .deploy(request("qa", "abc123"), &cancel)
        .await
        .unwrap();
    let live = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();
    let site_before = h.site("qa").unwrap();

    // The next release lands on green.
    h.probe.respond(8110, 500);
    let record = h
        .orchestrator
        .deploy(request("qa", "def456"), &cancel)
        .await
        .unwrap();

    assert_eq!(record.status, ReleaseStatus::Failed);
    assert_eq!(record.reason.as_deref(), Some("HealthCheckFailed"));
    assert_eq!(record.failed_step().unwrap().step, Step::HealthGate);
    assert!(
        record
            .steps
            .iter()
            .any(|s| s.step == Step::Teardown && s.status == StepStatus::Ok)
    );

    let doc = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    assert_eq!(doc.current().unwrap().id, live.id);
    assert!(doc.in_flight.is_none());
    let failed = doc.release(record.release_id.as_deref().unwrap()).unwrap();
    assert_eq!(failed.status, ReleaseStatus::Failed);
    assert_eq!(failed.color, Color::Green);

    assert_eq!(h.site("qa").unwrap(), site_before);
    assert_eq!(
        h.supervisor.running(),
        live.programs.iter().cloned().collect()
    );
}

#[tokio::test]
async fn rollback_after_failed_deploy_keeps_current_release() {
    let h = Harness::new();
    let cancel = CancelToken::new();
    h.orchestrator
        .deploy(request("qa", "abc123"), &cancel)
        .await
        .unwrap();
    h.probe.respond(8110, 500);
    h.orchestrator
        .deploy(request("qa", "def456"), &cancel)
        .await
        .unwrap();
    let live = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();

    let record = h
        .orchestrator
        .rollback("checkout", "qa", "ops", &cancel)
        .await
        .unwrap();

    assert!(record.is_live());
    assert_eq!(record.kind, DeploymentKind::Rollback);
    assert_eq!(record.release_id.as_deref(), Some(live.id.as_str()));
    let current = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();
    assert_eq!(current.id, live.id);
    assert!(current.revision.commit.starts_with("abc123"));
}

#[tokio::test]
async fn rollback_repromotes_previous_release_once() {
    let h = Harness::new();
    let cancel = CancelToken::new();
    h.orchestrator
        .deploy(request("qa", "abc123"), &cancel)
        .await
        .unwrap();
    let first = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();
    h.orchestrator
        .deploy(request("qa", "def456"), &cancel)
        .await
        .unwrap();
    let second = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();
    assert_eq!(second.color, Color::Green);
    assert!(h.site("qa").unwrap().contains("127.0.0.1:8110"));
    // Grace period is zero in tests, so blue is already stopped.
    for program in &first.programs {
        assert!(!h.supervisor.running().contains(program));
    }

    let record = h
        .orchestrator
        .rollback("checkout", "qa", "ops", &cancel)
        .await
        .unwrap();
    assert!(record.is_live());

    let doc = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    let current = doc.current().unwrap();
    assert_eq!(current.rollback_of.as_deref(), Some(first.id.as_str()));
    assert_eq!(current.path, first.path);
    assert_eq!(current.color, Color::Blue);
    assert_eq!(current.ports["web"], 8100);
    assert_eq!(doc.release(&first.id).unwrap().status, ReleaseStatus::Retired);
    assert_eq!(doc.release(&second.id).unwrap().status, ReleaseStatus::Retired);
    assert!(h.site("qa").unwrap().contains("127.0.0.1:8100"));
    for program in &second.programs {
        assert!(!h.supervisor.running().contains(program));
    }
    let link = h.orchestrator.current_link("checkout", "qa");
    assert_eq!(std::fs::read_link(link).unwrap(), first.path);

    let err = h
        .orchestrator
        .rollback("checkout", "qa", "ops", &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::NoRollbackTarget { .. }));

    let after = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    assert_eq!(after, doc);
    after.check_invariants().unwrap();
}

#[tokio::test]
async fn unknown_revision_fails_before_touching_anything() {
    let h = Harness::new();

    let record = h
        .orchestrator
        .deploy(request("qa", "nope999"), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(record.reason.as_deref(), Some("FetchError"));
    assert!(record.release_id.is_none());
    assert!(h.supervisor.running().is_empty());
    assert!(h.site("qa").is_none());
    let doc = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    assert!(doc.releases.is_empty());
    assert!(doc.in_flight.is_none());
}

#[tokio::test]
async fn failing_pre_deploy_hook_starts_no_processes() {
    let h = Harness::new();
    h.publish_with("hooked", "[hooks]\npre_deploy = [\"exit 3\"]\n");

    let record = h
        .orchestrator
        .deploy(request("qa", "hooked"), &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(record.status, ReleaseStatus::Failed);
    assert_eq!(record.reason.as_deref(), Some("ReconcileError"));
    assert_eq!(record.failed_step().unwrap().step, Step::PreDeployHooks);
    assert!(h.supervisor.running().is_empty());
    assert!(h.supervisor.removed().is_empty());
    let doc = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    assert_eq!(doc.releases[0].status, ReleaseStatus::Failed);
    assert!(doc.current().is_none());
}

#[tokio::test]
async fn failing_post_deploy_hook_is_advisory() {
    let h = Harness::new();
    h.publish_with("post", "[hooks]\npost_deploy = [\"exit 1\"]\n");

    let record = h
        .orchestrator
        .deploy(request("qa", "post"), &CancelToken::new())
        .await
        .unwrap();

    assert!(record.is_live());
    assert!(
        record
            .steps
            .iter()
            .any(|s| s.step == Step::PostDeployHooks && s.status == StepStatus::Warning)
    );
}

#[tokio::test]
async fn rejected_proxy_config_aborts_before_traffic_moves() {
    let h = Harness::new();
    let cancel = CancelToken::new();
    h.orchestrator
        .deploy(request("qa", "abc123"), &cancel)
        .await
        .unwrap();
    let site_before = h.site("qa").unwrap();

    h.proxy.reject_next();
    let record = h
        .orchestrator
        .deploy(request("qa", "def456"), &cancel)
        .await
        .unwrap();

    assert_eq!(record.reason.as_deref(), Some("ReconcileError"));
    assert_eq!(record.failed_step().unwrap().step, Step::Promote);
    assert_eq!(h.site("qa").unwrap(), site_before);
    let current = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();
    assert!(current.revision.commit.starts_with("abc123"));
    assert_eq!(
        h.supervisor.running(),
        current.programs.iter().cloned().collect()
    );
}

#[tokio::test]
async fn cancellation_during_health_gate_takes_abort_path() {
    let h = Harness::with_settings(|s| {
        s.health.failure_threshold = None;
        s.health.timeout = Duration::from_secs(30);
    });
    let cancel = CancelToken::new();
    h.orchestrator
        .deploy(request("qa", "abc123"), &cancel)
        .await
        .unwrap();
    let live = h
        .orchestrator
        .ledger()
        .current("checkout", "qa")
        .unwrap()
        .unwrap();

    h.probe.respond(8110, 503);
    let cancel = CancelToken::new();
    cancel.cancel_after(Duration::from_millis(500));
    let record = h
        .orchestrator
        .deploy(request("qa", "def456"), &cancel)
        .await
        .unwrap();

    assert_eq!(record.reason.as_deref(), Some("Cancelled"));
    assert_eq!(record.failed_step().unwrap().step, Step::HealthGate);
    assert_eq!(
        h.supervisor.running(),
        live.programs.iter().cloned().collect()
    );
    let doc = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    assert!(doc.in_flight.is_none());
    assert_eq!(doc.current().unwrap().id, live.id);
}

#[tokio::test]
async fn redeploying_same_requirements_skips_install() {
    let h = Harness::new();
    let cancel = CancelToken::new();
    h.orchestrator
        .deploy(request("qa", "abc123"), &cancel)
        .await
        .unwrap();
    h.orchestrator
        .deploy(request("qa", "def456"), &cancel)
        .await
        .unwrap();

    assert_eq!(*h.installer.installs.lock().unwrap(), 1);
}

#[tokio::test]
async fn old_releases_are_pruned_beyond_retention() {
    let h = Harness::with_settings(|s| s.keep_releases = 2);
    let cancel = CancelToken::new();
    for revision in ["abc123", "def456", "abc123", "def456"] {
        let record = h
            .orchestrator
            .deploy(request("qa", revision), &cancel)
            .await
            .unwrap();
        assert!(record.is_live());
    }

    let doc = h.orchestrator.ledger().load("checkout", "qa").unwrap();
    let statuses: Vec<ReleaseStatus> = doc.releases.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            ReleaseStatus::Retired,
            ReleaseStatus::Retired,
            ReleaseStatus::Superseded,
            ReleaseStatus::Live,
        ]
    );
    assert!(!doc.releases[0].path.exists());
    assert!(!doc.releases[1].path.exists());
    assert!(doc.releases[2].path.exists());
    assert!(doc.releases[3].path.exists());
}
