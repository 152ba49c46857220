use std::{path::Path, sync::Arc, time::Duration};

use tempfile::TempDir;
use tokio::sync::oneshot;
use virtscope::{
    config::{ManagerConfig, OnTimeout, ReadinessPolicy, StopPolicy},
    hypervisor::{HypervisorEvent, MemoryHypervisor, Operation},
    lifecycle::{Readiness, ScopeKind, ScopeOptions},
    manager::VmManager,
    VirtscopeError,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const DOMAIN_TEMPLATE: &str = r#"<domain type="kvm">
  <name>$NAME</name>
  <uuid>$UUID</uuid>
  <devices>
    <disk type="file" device="disk">
      <source file="$IMAGE_PATH"/>
    </disk>
  </devices>
</domain>
"#;

const SNAPSHOT_TEMPLATE: &str = r#"<domainsnapshot>
  <name>$SNAPSHOT_NAME</name>
  <creationTime>$CREATION_TIME</creationTime>
  <domain><name>$DOMAIN_NAME</name></domain>
</domainsnapshot>
"#;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_temp_domain_is_removed_on_close() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;

    let scope = manager.temp_domain(named("vm1")).await?;
    assert_eq!(scope.readiness(), Readiness::Active);
    assert!(scope.domain().is_active()?);
    assert!(scope
        .domain()
        .xml_desc()?
        .contains("/images/Linux Lite 5.8 (64bit).qcow2"));

    scope.close().await?;

    assert!(hv.domain_names().is_empty());
    assert_eq!(
        hv.events(),
        vec![
            HypervisorEvent::Created("vm1".into()),
            HypervisorEvent::Destroyed("vm1".into()),
        ]
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_body_error_is_returned_after_cleanup() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;

    let result: Result<(), VirtscopeError> = manager
        .with_scope(ScopeKind::Define, named("vm1"), |domain| async move {
            assert!(!domain.is_active()?);
            Err(VirtscopeError::custom(anyhow::anyhow!("test body failed")))
        })
        .await;

    assert!(matches!(result, Err(VirtscopeError::Custom(_))));
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_with_scope_returns_body_value() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;

    let name = manager
        .with_scope(ScopeKind::Create, ScopeOptions::default(), |domain| async move {
            Ok(domain.name().to_string())
        })
        .await?;

    assert!(uuid::Uuid::parse_str(&name).is_ok());
    assert!(!hv.contains(&name));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_scope_reverts_before_delete() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|config| {
        config.set_start_defined(true);
    })?;

    let scope = manager.temp_domain_snapshot(named("vm1")).await?;
    assert_eq!(scope.snapshot(), Some("main"));
    assert_eq!(scope.readiness(), Readiness::Active);

    hv.set_disk_state("vm1", "written by guest");
    scope.close().await?;

    let events = hv.events();
    let reverted = events
        .iter()
        .position(|e| matches!(e, HypervisorEvent::Reverted { .. }))
        .expect("revert issued");
    let undefined = events
        .iter()
        .position(|e| *e == HypervisorEvent::Undefined("vm1".into()))
        .expect("undefine issued");
    assert!(reverted < undefined);
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_snapshot_still_removes_domain() -> anyhow::Result<()> {
    let (dir, hv, manager) = setup(|_| {})?;
    std::fs::remove_file(dir.path().join("temp-snapshot-template.xml"))?;

    let err = manager
        .temp_domain_snapshot(named("vm1"))
        .await
        .unwrap_err();

    assert!(matches!(err, VirtscopeError::TemplateLoad { .. }));
    assert_eq!(
        hv.events(),
        vec![
            HypervisorEvent::Defined("vm1".into()),
            HypervisorEvent::Undefined("vm1".into()),
        ]
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_create_runs_no_cleanup() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;
    hv.fail_on(Operation::Create);

    assert!(manager.temp_domain(named("vm1")).await.is_err());
    assert!(hv.events().is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_stuck_existing_domain_is_left_alone() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;
    hv.insert_domain("vm1", true, true);
    hv.set_stop_resistant("vm1", true);

    let err = manager.temp_domain(named("vm1")).await.unwrap_err();

    assert!(matches!(err, VirtscopeError::StopTimeout { .. }));
    assert!(hv.contains("vm1"));
    assert!(hv
        .events()
        .iter()
        .all(|e| *e == HypervisorEvent::Destroyed("vm1".into())));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_existing_domain_is_replaced() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;
    hv.insert_domain("vm1", true, false);

    let scope = manager.temp_domain(named("vm1")).await?;
    assert_eq!(hv.domain_names(), vec!["vm1".to_string()]);
    assert!(!scope.domain().is_persistent());

    scope.close().await?;
    assert!(hv.domain_names().is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_readiness_timeout_proceeds() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;
    hv.set_activation_delay(u32::MAX);

    let options = ScopeOptions::builder()
        .name("vm1")
        .timeout(Duration::from_millis(30))
        .build();
    let scope = manager.temp_domain(options).await?;

    assert_eq!(scope.readiness(), Readiness::TimedOut);
    assert!(hv.contains("vm1"));

    scope.close().await?;
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_readiness_timeout_fails_when_configured() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|config| {
        config.set_readiness(
            ReadinessPolicy::builder()
                .timeout_secs(0)
                .interval_ms(1)
                .on_timeout(OnTimeout::Fail)
                .build(),
        );
    })?;
    hv.set_activation_delay(u32::MAX);

    let err = manager.temp_domain(named("vm1")).await.unwrap_err();

    assert!(matches!(err, VirtscopeError::NotReady { .. }));
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_unbounded_timeout_waits_for_activation() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|config| {
        config.set_readiness(
            ReadinessPolicy::builder()
                .timeout_secs(u64::MAX)
                .interval_ms(1)
                .build(),
        );
        config.set_stop(StopPolicy::builder().timeout_secs(u64::MAX).interval_ms(5).build());
    })?;
    hv.set_activation_delay(3);

    let scope = manager.temp_domain(named("vm1")).await?;
    assert_eq!(scope.readiness(), Readiness::Active);

    scope.close().await?;
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_template_with_fixed_name_is_rejected() -> anyhow::Result<()> {
    let (dir, hv, manager) = setup(|_| {})?;
    write(
        dir.path(),
        "temp-template.xml",
        "<domain><name>fixed-vm</name><uuid>$UUID</uuid></domain>",
    )?;

    for kind in [ScopeKind::Create, ScopeKind::Define, ScopeKind::Snapshot] {
        let err = manager.enter_kind(kind, named("vm1")).await.unwrap_err();
        assert!(matches!(err, VirtscopeError::DomainNameMismatch { .. }));
    }

    assert!(hv.domain_names().is_empty());
    assert!(hv.events().is_empty());

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_close_waits_for_open_scopes() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;

    let scope = manager.temp_domain_defined(named("vm1")).await?;
    assert_eq!(manager.open_scopes(), 1);

    let err = manager.close().unwrap_err();
    assert!(matches!(err, VirtscopeError::ScopesStillOpen(1)));
    assert!(!hv.is_closed());

    scope.close().await?;
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_cancelled_task_cleans_up() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;
    let manager = Arc::new(manager);
    let (entered_tx, entered_rx) = oneshot::channel();

    let task = tokio::spawn({
        let manager = manager.clone();
        async move {
            let _scope = manager.temp_domain(named("vm1")).await?;
            let _ = entered_tx.send(());
            std::future::pending::<()>().await;
            Ok::<_, VirtscopeError>(())
        }
    });

    entered_rx.await?;
    assert!(hv.contains("vm1"));

    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_panicking_task_cleans_up() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;
    let manager = Arc::new(manager);

    let task = tokio::spawn({
        let manager = manager.clone();
        async move {
            let scope = manager.temp_domain_defined(named("vm1")).await?;
            if scope.domain().name() == "vm1" {
                panic!("guest exploded");
            }
            scope.close().await
        }
    });

    assert!(task.await.unwrap_err().is_panic());
    assert!(!hv.contains("vm1"));

    Ok(())
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn test_concurrent_scopes_on_one_session() -> anyhow::Result<()> {
    let (_dir, hv, manager) = setup(|_| {})?;

    let (a, b) = tokio::join!(
        manager.with_scope(ScopeKind::Create, named("vm-a"), |domain| async move {
            Ok::<_, VirtscopeError>(domain.is_active()?)
        }),
        manager.with_scope(ScopeKind::Define, named("vm-b"), |domain| async move {
            Ok::<_, VirtscopeError>(domain.is_active()?)
        }),
    );

    assert!(a?);
    assert!(!b?);
    assert!(hv.domain_names().is_empty());

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn setup(
    configure: impl FnOnce(&mut ManagerConfig),
) -> anyhow::Result<(TempDir, Arc<MemoryHypervisor>, VmManager)> {
    let dir = tempfile::tempdir()?;
    write(dir.path(), "temp-template.xml", DOMAIN_TEMPLATE)?;
    write(dir.path(), "temp-snapshot-template.xml", SNAPSHOT_TEMPLATE)?;

    let mut config = ManagerConfig::builder()
        .connection_uri("memory:///")
        .image_path("/images/Linux Lite 5.8 (64bit).qcow2")
        .template_path(dir.path().join("temp-template.xml"))
        .snapshot_template_path(dir.path().join("temp-snapshot-template.xml"))
        .artifact_dir(dir.path())
        .stop(StopPolicy::builder().timeout_secs(0).interval_ms(5).build())
        .build();
    configure(&mut config);

    let hv = Arc::new(MemoryHypervisor::new());
    let manager = VmManager::with_session(hv.clone(), config);

    Ok((dir, hv, manager))
}

fn write(dir: &Path, name: &str, contents: &str) -> anyhow::Result<()> {
    std::fs::write(dir.join(name), contents)?;
    Ok(())
}

fn named(name: &str) -> ScopeOptions {
    ScopeOptions::builder().name(name).build()
}
