use gpuwatch_backend::mock::MockTelemetry;
use gpuwatch_common::config::{GpuWatchConfig, Limits};
use gpuwatch_common::{FieldId, GpuWatchError};
use gpuwatch_core::{Daemon, FieldGroupId, GroupId, GroupKind, WatchParams};
use std::sync::Arc;
use std::time::Duration;

fn daemon_with(limits: Limits) -> Daemon {
    let config = GpuWatchConfig { limits, ..GpuWatchConfig::default() };
    Daemon::start(config, Arc::new(MockTelemetry::new(4))).unwrap()
}

fn daemon() -> Daemon {
    daemon_with(Limits::default())
}

#[tokio::test]
async fn default_groups_hold_every_device_and_empty_groups_none() {
    let d = daemon();
    let h = d.connect().await;
    let all = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let none = d.create_gpu_group(h, GroupKind::Empty, "none").await.unwrap();
    assert_eq!(d.group_info(h, all).await.unwrap().devices, vec![0, 1, 2, 3]);
    let info = d.group_info(h, none).await.unwrap();
    assert!(info.devices.is_empty());
    assert_eq!(info.name, "none");
    assert_eq!(d.list_gpu_groups(h).await.unwrap(), vec![all, none]);
}

#[tokio::test]
async fn adding_devices_is_a_set_operation() {
    let d = daemon();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Empty, "pair").await.unwrap();
    d.add_device(h, g, 2).await.unwrap();
    d.add_device(h, g, 0).await.unwrap();
    d.add_device(h, g, 2).await.unwrap();
    assert_eq!(d.group_info(h, g).await.unwrap().devices, vec![2, 0]);

    assert!(matches!(d.add_device(h, g, 7).await, Err(GpuWatchError::NotFound(_))));
    assert!(matches!(d.add_device(h, GroupId(42), 0).await, Err(GpuWatchError::NotFound(_))));
}

#[tokio::test]
async fn group_entities_are_capped() {
    let d = daemon_with(Limits { max_group_entities: 2, ..Limits::default() });
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Empty, "small").await.unwrap();
    d.add_device(h, g, 0).await.unwrap();
    d.add_device(h, g, 1).await.unwrap();
    assert!(matches!(d.add_device(h, g, 2).await, Err(GpuWatchError::ResourceExhausted(_))));
    d.add_device(h, g, 1).await.unwrap();
}

#[tokio::test]
async fn names_are_validated() {
    let d = daemon();
    let h = d.connect().await;
    assert!(matches!(d.create_gpu_group(h, GroupKind::Empty, "").await, Err(GpuWatchError::BadParameter(_))));
    assert!(matches!(d.create_gpu_group(h, GroupKind::Empty, "   ").await, Err(GpuWatchError::BadParameter(_))));
    let long = "x".repeat(257);
    assert!(matches!(d.create_gpu_group(h, GroupKind::Empty, &long).await, Err(GpuWatchError::BadParameter(_))));
    assert!(matches!(d.create_field_group(h, &[201], "").await, Err(GpuWatchError::BadParameter(_))));
    assert!(d.list_gpu_groups(h).await.unwrap().is_empty());
}

#[tokio::test]
async fn group_count_is_limited_and_ids_are_never_reused() {
    let d = daemon_with(Limits { max_groups: 2, ..Limits::default() });
    let h = d.connect().await;
    let a = d.create_gpu_group(h, GroupKind::Empty, "a").await.unwrap();
    let b = d.create_gpu_group(h, GroupKind::Empty, "b").await.unwrap();
    assert!(matches!(d.create_gpu_group(h, GroupKind::Empty, "c").await, Err(GpuWatchError::ResourceExhausted(_))));
    d.destroy_gpu_group(h, a).await.unwrap();
    let c = d.create_gpu_group(h, GroupKind::Empty, "c").await.unwrap();
    assert!(c.0 > b.0);
    assert!(matches!(d.group_info(h, a).await, Err(GpuWatchError::NotFound(_))));
    assert!(matches!(d.destroy_gpu_group(h, a).await, Err(GpuWatchError::NotFound(_))));
}

#[tokio::test]
async fn groups_are_private_to_their_session() {
    let d = daemon();
    let h1 = d.connect().await;
    let h2 = d.connect().await;
    let g = d.create_gpu_group(h1, GroupKind::Default, "mine").await.unwrap();
    let fg = d.create_field_group(h1, &[201], "mine").await.unwrap();
    assert!(d.list_gpu_groups(h2).await.unwrap().is_empty());
    assert!(d.list_field_groups(h2).await.unwrap().is_empty());
    assert!(matches!(d.group_info(h2, g).await, Err(GpuWatchError::NotFound(_))));
    assert!(matches!(d.add_device(h2, g, 0).await, Err(GpuWatchError::NotFound(_))));
    assert!(matches!(d.destroy_field_group(h2, fg).await, Err(GpuWatchError::NotFound(_))));
    assert!(matches!(d.watch(h2, g, fg, WatchParams::new(Duration::from_secs(1), Duration::ZERO)).await, Err(GpuWatchError::NotFound(_))));
}

#[tokio::test]
async fn field_groups_keep_order_and_reject_bad_lists_atomically() {
    let d = daemon();
    let h = d.connect().await;

    assert!(matches!(d.create_field_group(h, &[201, 42, 300], "bad").await, Err(GpuWatchError::BadParameter(_))));
    assert!(matches!(d.create_field_group(h, &[], "empty").await, Err(GpuWatchError::BadParameter(_))));
    assert!(matches!(d.create_field_group(h, &[201, 300, 201], "dup").await, Err(GpuWatchError::BadParameter(_))));
    assert!(d.list_field_groups(h).await.unwrap().is_empty());

    let fg = d.create_field_group(h, &[300, 201], "ok").await.unwrap();
    assert_eq!(fg, FieldGroupId(1));
    let info = d.field_group_info(h, fg).await.unwrap();
    assert_eq!(info.fields, vec![FieldId::PowerUsage, FieldId::GpuTemp]);
    assert_eq!(info.name, "ok");
}

#[tokio::test]
async fn field_group_limits() {
    let d = daemon_with(Limits { max_field_groups: 1, max_fields_per_group: 2, ..Limits::default() });
    let h = d.connect().await;
    assert!(matches!(d.create_field_group(h, &[1, 2, 100], "wide").await, Err(GpuWatchError::ResourceExhausted(_))));
    d.create_field_group(h, &[1, 2], "first").await.unwrap();
    assert!(matches!(d.create_field_group(h, &[100], "second").await, Err(GpuWatchError::ResourceExhausted(_))));
}

#[tokio::test]
async fn device_queries() {
    let d = daemon();
    let h = d.connect().await;
    assert_eq!(d.list_devices(h).await.unwrap(), vec![0, 1, 2, 3]);
    let dev = d.device_attributes(h, 3).await.unwrap();
    assert_eq!(dev.index, 3);
    assert_eq!(dev.name, "Mock Accelerator 3");
    assert!(matches!(d.device_attributes(h, 4).await, Err(GpuWatchError::NotFound(_))));
}
