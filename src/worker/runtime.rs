use crate::config::ClusterConfig;
use crate::error::{Result, VigilError};
use crate::ipc::{AlarmChannel, AlarmMessage, AlarmReceiver, AlarmSender};
use crate::worker::drain::{DrainController, HostedService, TerminationKind};
use crate::worker::monitor::WorkerMonitor;
use std::fmt::Display;
use std::future::{pending, Future};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use tracing::{debug, error, info, warn};

/// Resolves once the hosted service must stop accepting new work
#[derive(Debug, Clone)]
pub struct ShutdownSignal(watch::Receiver<bool>);

impl ShutdownSignal {
    /// Wait for the signal; returns at once if it already fired
    pub async fn recv(&mut self) {
        // A dropped sender means the runtime is gone, which is a stop too
        let _ = self.0.wait_for(|stop| *stop).await;
    }

    pub fn is_triggered(&self) -> bool {
        *self.0.borrow()
    }
}

/// Lets the hosted service report failures it cannot recover from
#[derive(Debug, Clone)]
pub struct ExceptionReporter(mpsc::UnboundedSender<String>);

impl ExceptionReporter {
    /// Raise an exception alarm for this worker
    pub fn report(&self, error: impl Display) {
        if self.0.send(error.to_string()).is_err() {
            debug!("Exception reported after the worker runtime stopped: {}", error);
        }
    }
}

/// Handed to the application's service-start callback
#[derive(Debug)]
pub struct ServiceContext {
    pid: u32,
    name: String,
    shutdown: ShutdownSignal,
    exceptions: ExceptionReporter,
}

impl ServiceContext {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves when the service must stop accepting new work
    pub async fn shutdown(&mut self) {
        self.shutdown.recv().await
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn exceptions(&self) -> ExceptionReporter {
        self.exceptions.clone()
    }

    pub fn report_exception(&self, error: impl Display) {
        self.exceptions.report(error)
    }
}

/// Flips the service's shutdown signal
struct ServiceStopper(watch::Sender<bool>);

impl HostedService for ServiceStopper {
    fn stop_accepting(&mut self) {
        self.0.send_replace(true);
    }
}

/// Run the worker side of the cluster until the drain completes
///
/// The service started by `start` runs on its own task; its future
/// completing is the drained signal. Memory checks, master commands,
/// reported exceptions and the local `stop` future are multiplexed here
/// until a drain begins, then the service is raced against the grace
/// period. An invalid `config` is rejected before the service starts.
pub async fn run_worker<Stop, Start, Fut>(
    config: &ClusterConfig,
    mut monitor: WorkerMonitor,
    channel: AlarmChannel,
    stop: Stop,
    start: Start,
) -> Result<TerminationKind>
where
    Stop: Future<Output = ()>,
    Start: FnOnce(ServiceContext) -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    config.validate()?;

    let pid = monitor.pid();
    let (stop_tx, stop_rx) = watch::channel(false);
    let (exceptions_tx, mut exceptions_rx) = mpsc::unbounded_channel();

    let context = ServiceContext {
        pid,
        name: config.name.clone(),
        shutdown: ShutdownSignal(stop_rx),
        exceptions: ExceptionReporter(exceptions_tx),
    };
    let mut service = tokio::spawn(start(context));

    let mut drain = DrainController::new(
        pid,
        config.thresholds.shutdown_grace(),
        ServiceStopper(stop_tx),
    );
    let (mut sender, mut receiver) = channel.into_split();
    let mut ticker = monitor.ticker();

    let mut service_finished = false;
    let mut stop_fired = false;
    tokio::pin!(stop);

    info!("Worker {} of service {} started", pid, config.name);

    while !drain.is_draining() {
        tokio::select! {
            _ = ticker.tick() => {
                let outcome = monitor.check();
                if let Some(alarm) = outcome.alarm(pid) {
                    raise(&mut sender, alarm).await;
                }
            }
            message = receiver.recv() => match message {
                Ok(Some(message)) => {
                    drain.on_command(&message);
                }
                Ok(None) => {
                    drain.begin("master channel closed");
                }
                Err(VigilError::ProtocolError(e)) => {
                    debug!("Worker {} dropping malformed command: {}", pid, e);
                }
                Err(e) => {
                    drain.begin(&format!("master channel failed: {}", e));
                }
            },
            Some(reason) = exceptions_rx.recv() => {
                error!("Worker {} service raised an exception: {}", pid, reason);
                raise(&mut sender, AlarmMessage::ExceptionAlarm { process_id: pid }).await;
            }
            result = &mut service, if !service_finished => {
                service_finished = true;
                log_service_exit(pid, result, false);
                raise(&mut sender, AlarmMessage::ExceptionAlarm { process_id: pid }).await;
            }
            _ = &mut stop, if !stop_fired => {
                stop_fired = true;
                drain.begin("stop signal received");
            }
        }
    }

    let drained = async {
        if service_finished {
            return;
        }
        tokio::select! {
            result = &mut service => log_service_exit(pid, result, true),
            _ = absorb_commands(&mut receiver, pid) => {}
        }
    };

    let kind = drain.await_termination(drained).await?;
    if kind == TerminationKind::Forced {
        service.abort();
    }

    // Dropping the channel disconnects from the master
    drop(sender);
    drop(receiver);

    Ok(kind)
}

async fn raise(sender: &mut AlarmSender, alarm: AlarmMessage) {
    info!("Raising {}", alarm);
    if let Err(e) = sender.send(alarm).await {
        warn!("Failed to send {}: {}", alarm, e);
    }
}

/// Read and drop commands while draining; never completes
async fn absorb_commands(receiver: &mut AlarmReceiver, pid: u32) {
    loop {
        match receiver.recv().await {
            Ok(Some(message)) => debug!("Worker {} draining, ignoring {}", pid, message),
            Err(VigilError::ProtocolError(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }
    pending::<()>().await
}

fn log_service_exit(pid: u32, result: std::result::Result<Result<()>, JoinError>, draining: bool) {
    match result {
        Ok(Ok(())) if draining => debug!("Worker {} service drained", pid),
        Ok(Ok(())) => warn!("Worker {} service stopped on its own", pid),
        Ok(Err(e)) => error!("Worker {} service failed: {}", pid, e),
        Err(e) if e.is_panic() => error!("Worker {} service panicked", pid),
        Err(e) => error!("Worker {} service task failed: {}", pid, e),
    }
}
