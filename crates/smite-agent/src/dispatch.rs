//! Panel request handling

use smite_control::{AdapterManager, TunnelError};
use smite_proto::ChannelMessage;
use smite_transport_quic::ChannelStream;
use tracing::{debug, warn};

/// Answer one panel request against the node's tunnels
///
/// Tunnel errors become `OperationFailed` replies; nothing here fails the
/// channel itself.
pub async fn dispatch(manager: &AdapterManager, request: ChannelMessage) -> ChannelMessage {
    match request {
        ChannelMessage::ApplyTunnel {
            tunnel_id,
            tunnel_type,
            spec,
        } => match manager.apply_tunnel(&tunnel_id, &tunnel_type, spec).await {
            Ok(record) => ChannelMessage::TunnelResult {
                record,
                warning: None,
            },
            Err(e) => failure(&tunnel_id, &e),
        },
        ChannelMessage::RemoveTunnel { tunnel_id } => match manager.remove_tunnel(&tunnel_id).await {
            Ok(outcome) => ChannelMessage::TunnelResult {
                record: outcome.record,
                warning: outcome.teardown_error.map(|e| e.to_string()),
            },
            Err(e) => failure(&tunnel_id, &e),
        },
        ChannelMessage::GetTunnelStatus { tunnel_id } => match manager.get_tunnel_status(&tunnel_id) {
            Ok(record) => ChannelMessage::TunnelResult {
                record,
                warning: None,
            },
            Err(e) => failure(&tunnel_id, &e),
        },
        ChannelMessage::Ping { timestamp } => ChannelMessage::Pong { timestamp },
        other => ChannelMessage::OperationFailed {
            tunnel_id: String::new(),
            code: "UNEXPECTED_MESSAGE".to_string(),
            message: format!("{} is not a panel request", other.kind()),
            retryable: false,
        },
    }
}

fn failure(tunnel_id: &str, error: &TunnelError) -> ChannelMessage {
    ChannelMessage::OperationFailed {
        tunnel_id: tunnel_id.to_string(),
        code: error.code().to_string(),
        message: error.to_string(),
        retryable: error.is_retryable(),
    }
}

/// Serve the single request on a panel-opened stream
pub async fn handle_stream(mut stream: ChannelStream, manager: AdapterManager) {
    let request = match stream.recv_message().await {
        Ok(Some(request)) => request,
        Ok(None) => return,
        Err(e) => {
            warn!(stream_id = stream.stream_id(), error = %e, "Failed to read panel request");
            return;
        }
    };

    let kind = request.kind();
    let reply = dispatch(&manager, request).await;
    debug!(
        stream_id = stream.stream_id(),
        request = kind,
        reply = reply.kind(),
        "Panel request handled"
    );

    if let Err(e) = stream.send_message(&reply).await {
        warn!(stream_id = stream.stream_id(), error = %e, "Failed to send reply");
        return;
    }
    if let Err(e) = stream.finish() {
        debug!(stream_id = stream.stream_id(), error = %e, "Failed to finish reply stream");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use smite_control::{AdapterSet, AdapterSettings, TunnelRegistry};
    use smite_proto::{TunnelSpec, TunnelState};
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> AdapterManager {
        let settings = AdapterSettings {
            state_dir: dir.path().to_path_buf(),
            sysfs_net_root: dir.path().join("net"),
        };
        AdapterManager::new(TunnelRegistry::new(), AdapterSet::standard(&settings))
    }

    #[tokio::test]
    async fn test_apply_and_status() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);
        let spec = TunnelSpec::try_from(json!({"endpoint": "1.2.3.4:51820"})).unwrap();

        let reply = dispatch(
            &manager,
            ChannelMessage::ApplyTunnel {
                tunnel_id: "t1".into(),
                tunnel_type: "wireguard".into(),
                spec: spec.clone(),
            },
        )
        .await;
        match reply {
            ChannelMessage::TunnelResult { record, warning } => {
                assert_eq!(record.current_state, TunnelState::Active);
                assert_eq!(record.applied_spec, Some(spec));
                assert!(warning.is_none());
            }
            other => panic!("unexpected reply {:?}", other),
        }

        let reply = dispatch(&manager, ChannelMessage::GetTunnelStatus { tunnel_id: "t1".into() }).await;
        assert!(matches!(reply, ChannelMessage::TunnelResult { record, .. } if record.is_active()));
    }

    #[tokio::test]
    async fn test_errors_become_operation_failed() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        let reply = dispatch(
            &manager,
            ChannelMessage::ApplyTunnel {
                tunnel_id: "unknown-type".into(),
                tunnel_type: "bogus".into(),
                spec: TunnelSpec::default(),
            },
        )
        .await;
        assert!(matches!(
            reply,
            ChannelMessage::OperationFailed { ref code, retryable: false, .. } if code == "UNSUPPORTED_TUNNEL_TYPE"
        ));

        let reply = dispatch(&manager, ChannelMessage::RemoveTunnel { tunnel_id: "nope".into() }).await;
        assert!(matches!(
            reply,
            ChannelMessage::OperationFailed { ref code, .. } if code == "TUNNEL_NOT_FOUND"
        ));
    }

    #[tokio::test]
    async fn test_ping_and_unexpected() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir);

        assert_eq!(
            dispatch(&manager, ChannelMessage::Ping { timestamp: 42 }).await,
            ChannelMessage::Pong { timestamp: 42 }
        );
        assert!(matches!(
            dispatch(&manager, ChannelMessage::UsageAck { accepted: 1 }).await,
            ChannelMessage::OperationFailed { ref code, .. } if code == "UNEXPECTED_MESSAGE"
        ));
    }
}
