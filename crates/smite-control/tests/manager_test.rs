//! Tunnel lifecycle tests against the built-in adapters

use serde_json::json;
use smite_control::{
    AdapterManager, AdapterSet, AdapterSettings, TunnelError, TunnelRegistry, UsageCollector,
    UsageUnavailableReason, WireguardAdapter,
};
use smite_proto::{TunnelSpec, TunnelState};
use tempfile::TempDir;

fn spec(value: serde_json::Value) -> TunnelSpec {
    TunnelSpec::try_from(value).unwrap()
}

struct Node {
    dir: TempDir,
    manager: AdapterManager,
}

impl Node {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let settings = AdapterSettings {
            state_dir: dir.path().join("state"),
            sysfs_net_root: dir.path().join("sys-class-net"),
        };
        let registry = TunnelRegistry::with_snapshot(&settings.state_dir).unwrap();
        let manager = AdapterManager::new(registry, AdapterSet::standard(&settings));
        Self { dir, manager }
    }

    fn wireguard_config(&self, tunnel_id: &str) -> std::path::PathBuf {
        self.dir
            .path()
            .join("state")
            .join("wireguard")
            .join(format!("{}.conf", WireguardAdapter::interface_name(tunnel_id, &TunnelSpec::default())))
    }
}

#[tokio::test]
async fn test_apply_then_status_is_active_with_spec() {
    let node = Node::new();
    let submitted = spec(json!({"endpoint": "1.2.3.4:51820"}));

    let record = node
        .manager
        .apply_tunnel("t1", "wireguard", submitted.clone())
        .await
        .unwrap();
    assert_eq!(record.current_state, TunnelState::Active);

    let status = node.manager.get_tunnel_status("t1").unwrap();
    assert_eq!(status.current_state, TunnelState::Active);
    assert_eq!(status.applied_spec, Some(submitted));
    assert_eq!(status.last_error, None);
    assert!(node.wireguard_config("t1").exists());
}

#[tokio::test]
async fn test_reapply_replaces_spec_without_merging() {
    let node = Node::new();
    node.manager
        .apply_tunnel(
            "t1",
            "wireguard",
            spec(json!({"endpoint": "1.2.3.4:51820", "persistent_keepalive": 25})),
        )
        .await
        .unwrap();

    let second = spec(json!({"endpoint": "5.6.7.8:51820"}));
    node.manager
        .apply_tunnel("t1", "wireguard", second.clone())
        .await
        .unwrap();

    let status = node.manager.get_tunnel_status("t1").unwrap();
    assert_eq!(status.applied_spec, Some(second.clone()));
    assert_eq!(status.desired_spec, second);
    assert_eq!(status.generation, 2);

    let config = std::fs::read_to_string(node.wireguard_config("t1")).unwrap();
    assert!(config.contains("Endpoint = 5.6.7.8:51820"));
    assert!(!config.contains("PersistentKeepalive"));
}

#[tokio::test]
async fn test_unknown_type_rejected_before_any_record() {
    let node = Node::new();

    let err = node
        .manager
        .apply_tunnel("unknown-type", "bogus", spec(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::UnsupportedTunnelType(ref t) if t == "bogus"));
    assert_eq!(err.code(), "UNSUPPORTED_TUNNEL_TYPE");
    assert!(matches!(
        node.manager.get_tunnel_status("unknown-type"),
        Err(TunnelError::NotFound(_))
    ));
    assert!(node.manager.list_tunnels().is_empty());
}

#[tokio::test]
async fn test_remove_not_found_then_idempotent() {
    let node = Node::new();
    assert!(matches!(
        node.manager.remove_tunnel("t1").await,
        Err(TunnelError::NotFound(_))
    ));

    node.manager
        .apply_tunnel("t1", "wireguard", spec(json!({"endpoint": "1.2.3.4:51820"})))
        .await
        .unwrap();

    let first = node.manager.remove_tunnel("t1").await.unwrap();
    assert_eq!(first.record.current_state, TunnelState::Removed);
    assert!(first.teardown_error.is_none());
    assert!(!node.wireguard_config("t1").exists());

    let second = node.manager.remove_tunnel("t1").await.unwrap();
    assert_eq!(second.record.current_state, TunnelState::Removed);
}

#[tokio::test]
async fn test_wireguard_tunnels_with_shared_id_prefix_stay_independent() {
    let node = Node::new();
    node.manager
        .apply_tunnel("customer-alpha-1", "wireguard", spec(json!({"endpoint": "1.1.1.1:51820"})))
        .await
        .unwrap();
    node.manager
        .apply_tunnel("customer-alpha-2", "wireguard", spec(json!({"endpoint": "2.2.2.2:51820"})))
        .await
        .unwrap();

    let configs = std::fs::read_dir(node.dir.path().join("state").join("wireguard"))
        .unwrap()
        .count();
    assert_eq!(configs, 2);

    node.manager.remove_tunnel("customer-alpha-2").await.unwrap();

    let survivor = node.manager.get_tunnel_status("customer-alpha-1").unwrap();
    assert_eq!(survivor.current_state, TunnelState::Active);
    let config = std::fs::read_to_string(node.wireguard_config("customer-alpha-1")).unwrap();
    assert!(config.contains("Endpoint = 1.1.1.1:51820"));
    assert!(!node.wireguard_config("customer-alpha-2").exists());
}

#[tokio::test]
async fn test_interface_owned_by_active_tunnel_is_refused() {
    let node = Node::new();
    let pinned = spec(json!({"endpoint": "1.1.1.1:51820", "interface": "wg0"}));
    node.manager
        .apply_tunnel("office", "wireguard", pinned.clone())
        .await
        .unwrap();

    let err = node
        .manager
        .apply_tunnel("branch", "wireguard", spec(json!({"endpoint": "2.2.2.2:51820", "interface": "wg0"})))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        TunnelError::BackendConflict { ref resource, ref owner, .. } if resource == "wg0" && owner == "office"
    ));
    assert_eq!(err.code(), "BACKEND_CONFLICT");
    assert!(matches!(
        node.manager.get_tunnel_status("branch"),
        Err(TunnelError::NotFound(_))
    ));

    // A tunnel whose default name matches the pinned one is refused too
    node.manager
        .apply_tunnel("x", "wireguard", spec(json!({"endpoint": "3.3.3.3:51820", "interface": "wg-y"})))
        .await
        .unwrap();
    assert!(matches!(
        node.manager
            .apply_tunnel("y", "wireguard", spec(json!({"endpoint": "4.4.4.4:51820"})))
            .await,
        Err(TunnelError::BackendConflict { .. })
    ));

    // The owner can re-apply, and once removed the interface is free again
    node.manager.apply_tunnel("office", "wireguard", pinned).await.unwrap();
    node.manager.remove_tunnel("office").await.unwrap();
    node.manager
        .apply_tunnel("branch", "wireguard", spec(json!({"endpoint": "2.2.2.2:51820", "interface": "wg0"})))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_usage_on_non_active_tunnel_is_unavailable() {
    let node = Node::new();
    let collector = UsageCollector::new(node.manager.clone());

    node.manager
        .apply_tunnel("t1", "wireguard", spec(json!({"endpoint": "1.2.3.4:51820"})))
        .await
        .unwrap();
    node.manager.remove_tunnel("t1").await.unwrap();

    match collector.sample("t1").await {
        Err(TunnelError::UsageUnavailable { reason, .. }) => {
            assert_eq!(reason, UsageUnavailableReason::NotActive(TunnelState::Removed))
        }
        other => panic!("expected UsageUnavailable, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_apply_and_remove_end_consistent() {
    let node = Node::new();
    node.manager
        .apply_tunnel("t1", "wireguard", spec(json!({"endpoint": "1.2.3.4:51820"})))
        .await
        .unwrap();

    for round in 0..20 {
        let apply = {
            let manager = node.manager.clone();
            tokio::spawn(async move {
                manager
                    .apply_tunnel(
                        "t1",
                        "wireguard",
                        spec(json!({"endpoint": format!("10.0.0.{}:51820", round + 1)})),
                    )
                    .await
            })
        };
        let remove = {
            let manager = node.manager.clone();
            tokio::spawn(async move { manager.remove_tunnel("t1").await })
        };

        let applied = apply.await.unwrap();
        let removed = remove.await.unwrap();
        assert!(applied.is_ok());
        assert!(removed.is_ok());

        let record = node.manager.get_tunnel_status("t1").unwrap();
        match record.current_state {
            TunnelState::Active => {
                assert!(record.applied_spec.is_some());
                assert!(node.wireguard_config("t1").exists());
            }
            TunnelState::Removed => {
                assert!(record.applied_spec.is_none());
                assert!(!node.wireguard_config("t1").exists());
            }
            other => panic!("round {}: tunnel left in {:?}", round, other),
        }
    }
}

#[tokio::test]
async fn test_registry_survives_restart_and_restores() {
    let dir = TempDir::new().unwrap();
    let settings = AdapterSettings {
        state_dir: dir.path().to_path_buf(),
        sysfs_net_root: dir.path().join("net"),
    };

    {
        let manager = AdapterManager::new(
            TunnelRegistry::with_snapshot(&settings.state_dir).unwrap(),
            AdapterSet::standard(&settings),
        );
        manager
            .apply_tunnel(
                "h1",
                "hysteria2",
                spec(json!({"server": "hy.example.com:443", "auth": "secret"})),
            )
            .await
            .unwrap();
    }

    let manager = AdapterManager::new(
        TunnelRegistry::with_snapshot(&settings.state_dir).unwrap(),
        AdapterSet::standard(&settings),
    );
    let report = manager.restore().await;
    assert_eq!(report.reapplied, vec!["h1".to_string()]);

    let record = manager.get_tunnel_status("h1").unwrap();
    assert_eq!(record.current_state, TunnelState::Active);
    assert_eq!(record.generation, 2);
    assert!(dir.path().join("hysteria2").join("h1.yaml").exists());
}
