use std::sync::Arc;
use std::time::Duration;

use gpuwatch_api::app;
use gpuwatch_api::types::WatchRequest;
use gpuwatch_backend::mock::MockTelemetry;
use gpuwatch_cli::client::Client;
use gpuwatch_common::config::GpuWatchConfig;
use gpuwatch_common::{FieldId, GpuWatchError, LocalCode, StatusCode, TransportCode};
use gpuwatch_core::{Daemon, GroupId, GroupKind, Handle};

async fn serve() -> String {
    let daemon = Daemon::start(GpuWatchConfig::default(), Arc::new(MockTelemetry::new(2))).unwrap();
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app(daemon)).await.unwrap(); });
    format!("http://{}:{}", addr.ip(), addr.port())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn daemon_errors_come_back_as_local_codes() {
    let client = Client::new(serve().await, Duration::from_secs(5)).unwrap();
    let h = client.connect().await.unwrap();

    let err = client.group_info(h, GroupId(7)).await.unwrap_err();
    assert!(matches!(err, GpuWatchError::NotFound(_)));
    assert_eq!(err.code(), StatusCode::from(LocalCode::NotFound));

    assert_eq!(client.list_groups(Handle(0)).await.unwrap_err(), GpuWatchError::InvalidHandle);

    let g = client.create_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = client.create_field_group(h, &[FieldId::GpuTemp], "temp").await.unwrap();
    client
        .watch(h, WatchRequest { group_id: g, field_group_id: fg, update_interval_ms: 50, max_keep_age_ms: 5000, max_keep_samples: 0 })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(client.latest_value(h, 1, FieldId::GpuTemp).await.is_ok());
    assert_eq!(client.list_watches(h).await.unwrap().len(), 1);
    assert!(matches!(client.destroy_group(h, g).await, Err(GpuWatchError::Conflict(_))));

    client.disconnect(h).await.unwrap();
    assert_eq!(client.stats().await.unwrap().sessions, 0);
}

#[tokio::test]
async fn unreachable_daemon_maps_to_transport_unavailable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(format!("http://{addr}"), Duration::from_secs(2)).unwrap();
    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, GpuWatchError::Transport { code: TransportCode::Unavailable, .. }));
    assert!(err.code().is_transport());
    assert_eq!(err.code(), StatusCode::from(TransportCode::Unavailable));
}
