use gpuwatch_backend::mock::{CountingCapabilities, MockTelemetry};
use gpuwatch_common::config::{GpuWatchConfig, OperationMode};
use gpuwatch_common::{FieldId, GpuWatchError, LocalCode, StatusCode};
use gpuwatch_core::{Daemon, GroupKind, WatchParams};
use std::sync::Arc;
use std::time::Duration;

const TEMP: u32 = FieldId::GpuTemp as u32;
const POWER: u32 = FieldId::PowerUsage as u32;

fn config() -> GpuWatchConfig {
    GpuWatchConfig { read_timeout_ms: 200, janitor_interval_ms: 50, ..GpuWatchConfig::default() }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watched_pairs_accumulate_samples() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(2))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP, POWER], "thermals").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(100), Duration::from_secs(60))).await.unwrap();

    tokio::time::sleep(ms(350)).await;

    for device in 0..2 {
        for field in [FieldId::GpuTemp, FieldId::PowerUsage] {
            let samples = d.samples(h, device, field).await.unwrap();
            assert!(samples.len() >= 3, "device {device} {field}: {} samples", samples.len());
            assert!(samples.windows(2).all(|w| w[0].ts <= w[1].ts));
        }
    }
    let latest = d.latest_value(h, 0, FieldId::GpuTemp).await.unwrap();
    assert!(latest.value.as_f64().is_some());

    let first = d.samples(h, 0, FieldId::PowerUsage).await.unwrap()[0].clone();
    let (sample, next) = d.value_since(h, 0, FieldId::PowerUsage, 0).await.unwrap();
    assert_eq!(sample, first);
    assert!(next > sample.ts);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pairs_outside_every_watch_stay_empty() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(2))).unwrap();
    let h = d.connect().await;
    let first = d.create_gpu_group(h, GroupKind::Empty, "first").await.unwrap();
    d.add_device(h, first, 0).await.unwrap();
    let both = d.create_gpu_group(h, GroupKind::Default, "both").await.unwrap();
    let temp = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    let power = d.create_field_group(h, &[POWER], "power").await.unwrap();

    d.watch(h, first, temp, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    d.watch(h, both, power, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(250)).await;

    assert!(!d.samples(h, 0, FieldId::GpuTemp).await.unwrap().is_empty());
    assert!(!d.samples(h, 0, FieldId::PowerUsage).await.unwrap().is_empty());
    assert!(!d.samples(h, 1, FieldId::PowerUsage).await.unwrap().is_empty());
    assert!(d.samples(h, 1, FieldId::GpuTemp).await.unwrap().is_empty());
    assert!(matches!(d.latest_value(h, 1, FieldId::GpuTemp).await, Err(GpuWatchError::NotFound(_))));
}

#[tokio::test]
async fn watched_groups_cannot_be_destroyed() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(2))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(100), Duration::from_secs(1))).await.unwrap();

    let busy = d.destroy_gpu_group(h, g).await.unwrap_err();
    assert!(matches!(busy, GpuWatchError::Conflict(_)));
    assert_eq!(busy.code(), StatusCode::from(LocalCode::Conflict));
    assert!(matches!(d.destroy_field_group(h, fg).await, Err(GpuWatchError::Conflict(_))));

    d.unwatch(h, g, fg).await.unwrap();
    assert!(matches!(d.unwatch(h, g, fg).await, Err(GpuWatchError::NotFound(_))));
    d.destroy_field_group(h, fg).await.unwrap();
    d.destroy_gpu_group(h, g).await.unwrap();
}

#[tokio::test]
async fn watch_parameters_are_validated() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(1))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    let zero = WatchParams::new(Duration::ZERO, Duration::from_secs(1));
    assert!(matches!(d.watch(h, g, fg, zero).await, Err(GpuWatchError::BadParameter(_))));
    assert!(d.list_watches(h).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failing_pair_does_not_spoil_the_tick() {
    let mock = MockTelemetry::new(2).with_failure(1, FieldId::GpuTemp);
    let d = Daemon::start(config(), Arc::new(mock)).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP, POWER], "thermals").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(250)).await;

    assert!(!d.samples(h, 0, FieldId::GpuTemp).await.unwrap().is_empty());
    assert!(!d.samples(h, 1, FieldId::PowerUsage).await.unwrap().is_empty());
    assert!(d.samples(h, 1, FieldId::GpuTemp).await.unwrap().is_empty());

    let err = d.last_error(h, 1, FieldId::GpuTemp).await.unwrap().expect("failure recorded");
    assert_eq!(err.status, StatusCode::from(LocalCode::TelemetryError));
    assert!(err.count >= 1);
    assert!(d.last_error(h, 0, FieldId::GpuTemp).await.unwrap().is_none());
    assert!(d.stats().await.sample_failures >= 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_devices_time_out_per_sample() {
    let mock = MockTelemetry::new(2).with_delay(1, ms(400));
    let config = GpuWatchConfig { read_timeout_ms: 30, ..config() };
    let d = Daemon::start(config, Arc::new(mock)).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(100), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(350)).await;

    assert!(d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len() >= 3);
    assert!(d.samples(h, 1, FieldId::GpuTemp).await.unwrap().is_empty());
    let err = d.last_error(h, 1, FieldId::GpuTemp).await.unwrap().expect("timeout recorded");
    assert_eq!(err.status, StatusCode::from(LocalCode::Timeout));
    d.shutdown().await;
}

#[test]
fn a_hung_device_does_not_starve_healthy_reads() {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .max_blocking_threads(4)
        .enable_all()
        .build()
        .unwrap();
    rt.block_on(async {
        let mock = MockTelemetry::new(2).with_delay(1, Duration::from_secs(5));
        let config = GpuWatchConfig { read_timeout_ms: 30, ..config() };
        let d = Daemon::start(config, Arc::new(mock)).unwrap();
        let h = d.connect().await;
        let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
        let fg = d.create_field_group(h, &[TEMP, POWER], "thermals").await.unwrap();
        d.watch(h, g, fg, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
        tokio::time::sleep(ms(600)).await;

        for field in [FieldId::GpuTemp, FieldId::PowerUsage] {
            let healthy = d.last_error(h, 0, field).await.unwrap();
            assert!(healthy.is_none(), "device 0 {field}: {healthy:?}");
            assert!(d.samples(h, 0, field).await.unwrap().len() >= 5);

            let stalled = d.last_error(h, 1, field).await.unwrap().expect("stall recorded");
            assert_eq!(stalled.status, StatusCode::from(LocalCode::Timeout));
            assert!(stalled.count >= 5, "device 1 {field}: {} failures", stalled.count);
        }
        d.shutdown().await;
    });
    rt.shutdown_timeout(ms(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn huge_retention_does_not_wrap() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(1))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(20), ms(18_446_744_073_709_552))).await.unwrap();
    tokio::time::sleep(ms(300)).await;

    let kept = d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len();
    assert!(kept >= 5, "{kept} samples kept");
    assert_eq!(d.list_watches(h).await.unwrap()[0].max_keep_age_ms, 18_446_744_073_709_552);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_fields_fail_without_a_read() {
    let mock = Arc::new(MockTelemetry::new(1).without_field(FieldId::MemoryTemp));
    let d = Daemon::start(config(), mock.clone()).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP, FieldId::MemoryTemp as u32], "temps").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(220)).await;
    d.shutdown().await;
    tokio::time::sleep(ms(20)).await;

    assert!(d.samples(h, 0, FieldId::MemoryTemp).await.unwrap().is_empty());
    let err = d.last_error(h, 0, FieldId::MemoryTemp).await.unwrap().expect("failure recorded");
    assert_eq!(err.status, StatusCode::from(LocalCode::NotSupported));
    assert!(err.count >= 2);

    // only the supported field ever reached the source
    let temps = d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len() as u64;
    assert!(temps >= 2);
    assert!(mock.reads() <= temps + 1, "{} reads for {temps} samples", mock.reads());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rearming_refreshes_parameters_and_keeps_buffers() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(1))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(200)).await;
    let before = d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len();
    assert!(before >= 2);

    d.watch(h, g, fg, WatchParams::new(ms(500), Duration::from_secs(60))).await.unwrap();
    let watches = d.list_watches(h).await.unwrap();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].update_interval_ms, 500);
    assert!(d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len() >= before);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unwatched_buffers_age_out() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(1))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(20), ms(100))).await.unwrap();
    tokio::time::sleep(ms(120)).await;
    d.unwatch(h, g, fg).await.unwrap();
    assert!(!d.samples(h, 0, FieldId::GpuTemp).await.unwrap().is_empty());

    tokio::time::sleep(ms(400)).await;
    assert!(d.samples(h, 0, FieldId::GpuTemp).await.unwrap().is_empty());
    assert_eq!(d.stats().await.buffers, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sample_count_cap_bounds_buffers() {
    let d = Daemon::start(config(), Arc::new(MockTelemetry::new(1))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    let params = WatchParams { max_keep_samples: 2, ..WatchParams::new(ms(20), Duration::from_secs(60)) };
    d.watch(h, g, fg, params).await.unwrap();
    tokio::time::sleep(ms(250)).await;
    let n = d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len();
    assert!((1..=2).contains(&n), "{n} samples kept");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn privileged_fields_hold_a_capability_only_while_reading() {
    let caps = Arc::new(CountingCapabilities::default());
    let d = Daemon::start_with(config(), Arc::new(MockTelemetry::new(1)), caps.clone()).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[FieldId::EccCorrectTotal as u32, TEMP], "ecc").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(200)).await;
    d.shutdown().await;
    tokio::time::sleep(ms(20)).await;

    assert!(caps.raised() >= 2);
    assert_eq!(caps.held(), 0);
    assert!(!d.samples(h, 0, FieldId::EccCorrectTotal).await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn denied_capability_fails_only_privileged_samples() {
    let caps = Arc::new(CountingCapabilities::denying());
    let d = Daemon::start_with(config(), Arc::new(MockTelemetry::new(1)), caps).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[FieldId::EccUncorrectTotal as u32, TEMP], "ecc").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(ms(50), Duration::from_secs(60))).await.unwrap();
    tokio::time::sleep(ms(200)).await;

    let err = d.last_error(h, 0, FieldId::EccUncorrectTotal).await.unwrap().expect("denied");
    assert_eq!(err.status, StatusCode::from(LocalCode::PermissionDenied));
    assert!(!d.samples(h, 0, FieldId::GpuTemp).await.unwrap().is_empty());
}

#[tokio::test]
async fn manual_mode_samples_only_on_request() {
    let config = GpuWatchConfig { mode: OperationMode::Manual, ..config() };
    let d = Daemon::start(config, Arc::new(MockTelemetry::new(2))).unwrap();
    let h = d.connect().await;
    let g = d.create_gpu_group(h, GroupKind::Default, "all").await.unwrap();
    let fg = d.create_field_group(h, &[TEMP], "temp").await.unwrap();
    d.watch(h, g, fg, WatchParams::new(Duration::from_secs(60), Duration::from_secs(600))).await.unwrap();

    tokio::time::sleep(ms(100)).await;
    assert!(d.samples(h, 0, FieldId::GpuTemp).await.unwrap().is_empty());

    assert_eq!(d.update_all_fields(h).await.unwrap(), 1);
    assert_eq!(d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len(), 1);
    assert_eq!(d.samples(h, 1, FieldId::GpuTemp).await.unwrap().len(), 1);

    // interval has not elapsed yet
    assert_eq!(d.update_all_fields(h).await.unwrap(), 0);
    assert_eq!(d.samples(h, 0, FieldId::GpuTemp).await.unwrap().len(), 1);
}
