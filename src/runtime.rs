// Zenoh wiring and supervision for the AMC driver
//
// The control loop is blocking by nature (fixed settle delays, no flow
// control), so it runs on a blocking task and talks to Zenoh through the
// synchronous API. A restart request from the driver is honored here.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use zenoh::handlers::FifoChannelHandler;
use zenoh::pubsub::{Publisher, Subscriber};
use zenoh::sample::Sample;
use zenoh::Wait;

// local imports
use crate::amc::protocol::{AmcError, Crc8, Result};
use crate::amc::{AmcDriver, AmcParser, Bus, DriverOutcome, SerialTransport};
use crate::config::{DriverConfig, TOPIC_ACTUATION, TOPIC_HEALTH, TOPIC_RESTART, TOPIC_RPM};
use crate::messages::{ActuationRequest, HealthReport, RestartRequest, RpmSample};

/// Bus backed by a Zenoh session, JSON payloads
pub struct ZenohBus {
    subscriber: Subscriber<FifoChannelHandler<Sample>>,
    pub_rpm: Publisher<'static>,
    pub_health: Publisher<'static>,
    pub_restart: Publisher<'static>,
}

impl ZenohBus {
    pub async fn declare(session: &zenoh::Session) -> zenoh::Result<Self> {
        Ok(Self {
            subscriber: session.declare_subscriber(TOPIC_ACTUATION).await?,
            pub_rpm: session.declare_publisher(TOPIC_RPM).await?,
            pub_health: session.declare_publisher(TOPIC_HEALTH).await?,
            pub_restart: session.declare_publisher(TOPIC_RESTART).await?,
        })
    }

    fn put<M: serde::Serialize>(publisher: &Publisher<'static>, msg: &M) -> Result<()> {
        let json = serde_json::to_string(msg).map_err(|e| AmcError::Bus(e.to_string()))?;
        publisher
            .put(json)
            .wait()
            .map_err(|e| AmcError::Bus(e.to_string()))
    }
}

impl Bus for ZenohBus {
    fn publish_rpm(&mut self, sample: &RpmSample) -> Result<()> {
        Self::put(&self.pub_rpm, sample)
    }

    fn report_health(&mut self, report: &HealthReport) -> Result<()> {
        info!("Health: {:?} ({})", report.state, report.message);
        Self::put(&self.pub_health, report)
    }

    fn request_restart(&mut self, request: &RestartRequest) -> Result<()> {
        Self::put(&self.pub_restart, request)
    }

    fn next_actuation(&mut self, timeout: Duration) -> Option<ActuationRequest> {
        loop {
            let sample = match self.subscriber.recv_timeout(timeout) {
                Ok(Some(sample)) => sample,
                Ok(None) => return None,
                Err(e) => {
                    warn!("Actuation subscriber closed: {}", e);
                    return None;
                }
            };

            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<ActuationRequest>(&payload) {
                Ok(request) => return Some(request),
                Err(e) => warn!("Failed to parse actuation request: {}", e),
            }
        }
    }
}

/// Open the transport, retrying every `backoff` until it succeeds.
/// Returns None if `stop` is set while waiting.
pub async fn open_with_retry<T, B: Bus>(
    mut open: impl FnMut() -> Result<T>,
    bus: &mut B,
    backoff: Duration,
    stop: &AtomicBool,
) -> Option<T> {
    loop {
        if stop.load(Ordering::Relaxed) {
            return None;
        }
        match open() {
            Ok(transport) => return Some(transport),
            Err(e) => {
                warn!("Failed to open serial port, retrying in {:?}: {}", backoff, e);
                let report = HealthReport::error(format!("serial port unavailable: {}", e));
                if let Err(e) = bus.report_health(&report) {
                    warn!("Failed to report health {:?}: {}", report, e);
                }
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

pub async fn run(config: DriverConfig) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let mut bus = ZenohBus::declare(&session).await?;
    info!("Subscribed to: {}", TOPIC_ACTUATION);
    info!("Publishing to: {}, {}, {}", TOPIC_RPM, TOPIC_HEALTH, TOPIC_RESTART);

    // Stop is observed by the control loop at tick boundaries
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping driver");
                stop.store(true, Ordering::Relaxed);
            }
        });
    }

    loop {
        let open = || SerialTransport::open(&config.device, config.baud);
        let Some(transport) =
            open_with_retry(open, &mut bus, config.timing.restart_backoff, &stop).await
        else {
            info!("Stopped before the serial port could be opened");
            return Ok(());
        };
        let decoder = AmcParser::new(Crc8::new(config.crc_poly));
        let mut driver = AmcDriver::new(transport, decoder, bus, &config);

        let stop_flag = stop.clone();
        let (outcome, returned_bus) = tokio::task::spawn_blocking(move || {
            let outcome = driver.run(&stop_flag);
            (outcome, driver.into_bus())
        })
        .await?;
        bus = returned_bus;

        match outcome {
            DriverOutcome::Stopped => {
                info!("Driver stopped");
                return Ok(());
            }
            DriverOutcome::Restart(request) if !request.permanent => {
                warn!(
                    "Restarting driver in {:.1}s: {}",
                    request.backoff_secs, request.reason
                );
                tokio::time::sleep(Duration::from_secs_f64(request.backoff_secs)).await;
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
            }
            DriverOutcome::Restart(request) => {
                error!("Driver failed permanently: {}", request.reason);
                return Err(request.reason.into());
            }
        }
    }
}
