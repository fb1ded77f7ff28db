// Integration tests for the worker runtime: monitor, drain and service wired together

use std::future::pending;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vigil::ipc::{AlarmChannel, AlarmMessage};
use vigil::worker::{
    run_worker, MemorySample, MemorySampler, ReliefFn, ServiceContext, TerminationKind,
    WorkerMonitor,
};
use vigil::{ClusterConfig, Result, ThresholdConfig, VigilError};

const PID: u32 = 77;

/// Always reports the same resident size
struct FixedSampler(u64);

impl MemorySampler for FixedSampler {
    fn sample(&mut self) -> Result<MemorySample> {
        Ok(MemorySample {
            resident_mb: self.0,
            virtual_mb: self.0 * 2,
        })
    }
}

fn config() -> ClusterConfig {
    ClusterConfig {
        name: "runtime-test".to_string(),
        thresholds: ThresholdConfig::default()
            .with_check_interval_ms(1000)
            .with_shutdown_grace_ms(500),
        ..ClusterConfig::default()
    }
}

fn monitor(config: &ClusterConfig, resident_mb: u64) -> WorkerMonitor {
    WorkerMonitor::new(
        PID,
        config.thresholds.clone(),
        FixedSampler(resident_mb),
        ReliefFn::new(|| Ok(())),
    )
}

async fn wait_for_shutdown(mut ctx: ServiceContext) -> Result<()> {
    ctx.shutdown().await;
    Ok(())
}

async fn count_shutdown(mut ctx: ServiceContext, stops: Arc<AtomicUsize>) -> Result<()> {
    ctx.shutdown().await;
    stops.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

/// Holds its connections forever
async fn ignore_shutdown(ctx: ServiceContext) -> Result<()> {
    let _ctx = ctx;
    pending().await
}

async fn report_then_wait(mut ctx: ServiceContext) -> Result<()> {
    assert_eq!(ctx.pid(), PID);
    assert_eq!(ctx.name(), "runtime-test");
    ctx.report_exception("database connection lost");
    ctx.shutdown().await;
    Ok(())
}

async fn exit_immediately(_ctx: ServiceContext) -> Result<()> {
    Ok(())
}

async fn panic_on_start(_ctx: ServiceContext) -> Result<()> {
    panic!("handler bug")
}

#[tokio::test]
async fn test_terminate_drains_cleanly() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();

    master
        .send(AlarmMessage::Terminate { process_id: PID })
        .await
        .unwrap();

    let kind = run_worker(&config, monitor(&config, 100), worker, pending::<()>(), wait_for_shutdown)
        .await
        .unwrap();

    assert_eq!(kind, TerminationKind::Clean);
    // No alarms were raised, and the worker disconnected
    assert_eq!(master.recv().await.unwrap(), None);
}

#[tokio::test]
async fn test_duplicate_and_foreign_terminates_are_absorbed() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();
    let stops = Arc::new(AtomicUsize::new(0));

    for process_id in [PID + 1, PID, PID, PID] {
        master
            .send(AlarmMessage::Terminate { process_id })
            .await
            .unwrap();
    }

    let counter = stops.clone();
    let kind = run_worker(
        &config,
        monitor(&config, 100),
        worker,
        pending::<()>(),
        move |ctx| count_shutdown(ctx, counter),
    )
    .await
    .unwrap();

    assert_eq!(kind, TerminationKind::Clean);
    assert_eq!(stops.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_forces_termination() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();

    master
        .send(AlarmMessage::Terminate { process_id: PID })
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let kind = run_worker(
        &config,
        monitor(&config, 100),
        worker,
        pending::<()>(),
        ignore_shutdown,
    )
    .await
    .unwrap();

    assert_eq!(kind, TerminationKind::Forced);
    assert_eq!(started.elapsed(), Duration::from_millis(500));
}

#[tokio::test]
async fn test_memory_alarm_leads_to_drain() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();

    let master_side = async move {
        let alarm = master.recv().await.unwrap().unwrap();
        assert_eq!(alarm, AlarmMessage::MemoryAlarm { process_id: PID });

        master
            .send(AlarmMessage::Terminate {
                process_id: alarm.process_id(),
            })
            .await
            .unwrap();
        master
    };

    let (result, _master) = tokio::join!(
        run_worker(&config, monitor(&config, 1800), worker, pending::<()>(), wait_for_shutdown),
        master_side
    );

    assert_eq!(result.unwrap(), TerminationKind::Clean);
}

#[tokio::test]
async fn test_master_disconnect_drains_worker() {
    let config = config();
    let (master, worker) = AlarmChannel::pair();
    drop(master);

    let kind = run_worker(&config, monitor(&config, 100), worker, pending::<()>(), wait_for_shutdown)
        .await
        .unwrap();

    assert_eq!(kind, TerminationKind::Clean);
}

#[tokio::test]
async fn test_stop_signal_drains_worker() {
    let config = config();
    let (_master, worker) = AlarmChannel::pair();

    let kind = run_worker(&config, monitor(&config, 100), worker, async {}, wait_for_shutdown)
        .await
        .unwrap();

    assert_eq!(kind, TerminationKind::Clean);
}

#[tokio::test]
async fn test_reported_exception_raises_alarm() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();

    let master_side = async move {
        let alarm = master.recv().await.unwrap().unwrap();
        assert_eq!(alarm, AlarmMessage::ExceptionAlarm { process_id: PID });

        master
            .send(AlarmMessage::Terminate { process_id: PID })
            .await
            .unwrap();
        master
    };

    let (result, _master) = tokio::join!(
        run_worker(&config, monitor(&config, 100), worker, pending::<()>(), report_then_wait),
        master_side
    );

    assert_eq!(result.unwrap(), TerminationKind::Clean);
}

#[tokio::test]
async fn test_service_exiting_early_raises_alarm() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();

    let master_side = async move {
        let alarm = master.recv().await.unwrap().unwrap();
        assert_eq!(alarm, AlarmMessage::ExceptionAlarm { process_id: PID });

        master
            .send(AlarmMessage::Terminate { process_id: PID })
            .await
            .unwrap();
        master
    };

    let (result, _master) = tokio::join!(
        run_worker(
            &config,
            monitor(&config, 100),
            worker,
            pending::<()>(),
            exit_immediately
        ),
        master_side
    );

    // Nothing left to drain once terminated
    assert_eq!(result.unwrap(), TerminationKind::Clean);
}

#[tokio::test]
async fn test_panicking_service_raises_alarm() {
    let config = config();
    let (mut master, worker) = AlarmChannel::pair();

    let master_side = async move {
        let alarm = master.recv().await.unwrap().unwrap();
        assert_eq!(alarm, AlarmMessage::ExceptionAlarm { process_id: PID });
        drop(master);
    };

    let (result, _) = tokio::join!(
        run_worker(
            &config,
            monitor(&config, 100),
            worker,
            pending::<()>(),
            panic_on_start
        ),
        master_side
    );

    assert_eq!(result.unwrap(), TerminationKind::Clean);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_start() {
    let config = ClusterConfig {
        thresholds: ThresholdConfig::default()
            .with_check_interval_ms(0)
            .with_gc_trigger_fraction(2.0),
        ..config()
    };
    let (_master, worker) = AlarmChannel::pair();
    let started = Arc::new(AtomicUsize::new(0));

    let counter = started.clone();
    let result = run_worker(
        &config,
        monitor(&config, 100),
        worker,
        pending::<()>(),
        move |ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            wait_for_shutdown(ctx)
        },
    )
    .await;

    assert!(matches!(result, Err(VigilError::ConfigValidationError(_))));
    assert_eq!(started.load(Ordering::SeqCst), 0);
}
