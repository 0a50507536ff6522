//! Connection manager with bounded retry and a single observable link state

use crate::command::CommandChannel;
use crate::transport::discovery::{DiscoveredDevice, DiscoveredDevices, ScanConfig};
use crate::transport::session::{
    default_strategies, resolve_characteristics, ResolutionStrategy, ResolvedCharacteristics,
    TransportSession,
};
use crate::transport::traits::{Availability, BlePlatform, HardwareEvent, HardwareEventReceiver};
use obd_ble_shared::{
    codec, elm, timing, BackoffSchedule, ConnectionState, LinkError, LinkEvent, LinkStateMachine,
    TransitionResult,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Retry delays for `connect_with_retry`
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay
    pub initial: Duration,
    /// Largest delay
    pub max: Duration,
    /// Number of connect attempts
    pub attempts: usize,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(timing::BACKOFF_INITIAL_MS),
            max: Duration::from_millis(timing::BACKOFF_MAX_MS),
            attempts: timing::CONNECT_ATTEMPTS,
        }
    }
}

impl BackoffConfig {
    pub fn schedule(&self) -> BackoffSchedule {
        BackoffSchedule::exponential(self.initial, self.max, self.attempts)
    }
}

/// Configuration for connection manager
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Discovery configuration
    pub scan: ScanConfig,
    /// Retry schedule for connect attempts
    pub backoff: BackoffConfig,
    /// Upper bound on one attempt, from connect request to resolved characteristics
    pub connect_timeout: Duration,
    /// How long a command waits for its response
    pub command_timeout: Duration,
    /// Response frames buffered before the oldest is dropped
    pub response_capacity: usize,
    /// Commands issued after every successful connection
    pub init_commands: Vec<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            scan: ScanConfig::default(),
            backoff: BackoffConfig::default(),
            connect_timeout: Duration::from_millis(timing::CONNECT_TIMEOUT_MS),
            command_timeout: Duration::from_millis(timing::COMMAND_TIMEOUT_MS),
            response_capacity: timing::RESPONSE_CAPACITY,
            init_commands: elm::INIT_SEQUENCE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// One observed state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Outcome of characteristic resolution for one connect attempt
struct Resolution {
    attempt: u64,
    outcome: Result<(&'static str, ResolvedCharacteristics), LinkError>,
}

/// Everything guarded by the manager lock
struct LinkInner {
    fsm: LinkStateMachine,
    session: Option<TransportSession>,
    /// Completed once the attempt in progress reaches Connected or fails
    pending_connect: Option<oneshot::Sender<Result<(), LinkError>>>,
    /// Incremented for every connect attempt
    attempt: u64,
    devices: DiscoveredDevices,
    scan_timer: Option<JoinHandle<()>>,
    scan_generation: u64,
    /// A hardware scan was requested and not yet stopped
    hardware_scanning: bool,
    /// Incremented by every `disconnect`; retry loops stop when it moves
    disconnect_generation: u64,
}

impl LinkInner {
    fn state(&self) -> &ConnectionState {
        self.fsm.state()
    }

    fn session_address_is(&self, address: &str) -> bool {
        self.session
            .as_ref()
            .is_some_and(|s| s.address().eq_ignore_ascii_case(address))
    }

    fn stop_scan_timer(&mut self) {
        if let Some(timer) = self.scan_timer.take() {
            timer.abort();
        }
        self.scan_generation += 1;
    }

    /// Clear the session locally, returning the address whose handle needs releasing
    fn take_session(&mut self) -> Option<String> {
        self.session.take().map(|mut session| {
            session.teardown();
            session.address().to_string()
        })
    }
}

struct Shared {
    config: ConnectionConfig,
    platform: Arc<dyn BlePlatform>,
    strategies: Vec<Box<dyn ResolutionStrategy>>,
    inner: Mutex<LinkInner>,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<DiscoveredDevice>>,
    transitions_tx: broadcast::Sender<StateTransition>,
    resolved_tx: mpsc::UnboundedSender<Resolution>,
    commands: CommandChannel,
    /// Serializes `connect_with_retry` callers
    connect_turn: Mutex<()>,
    closed: AtomicBool,
}

/// Owns the BLE link to one OBD-II adapter
///
/// Construct one instance and share it (`Arc<ConnectionManager>`) with every
/// consumer. `initialize` and `cleanup` bracket its useful life.
pub struct ConnectionManager {
    shared: Arc<Shared>,
    event_loop: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Create a new connection manager and start its event loop
    pub fn new(
        config: ConnectionConfig,
        platform: Arc<dyn BlePlatform>,
        events: HardwareEventReceiver,
    ) -> Self {
        Self::with_strategies(config, platform, events, default_strategies())
    }

    /// Like `new`, with a custom characteristic resolution order
    pub fn with_strategies(
        config: ConnectionConfig,
        platform: Arc<dyn BlePlatform>,
        events: HardwareEventReceiver,
        strategies: Vec<Box<dyn ResolutionStrategy>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (devices_tx, _) = watch::channel(Vec::new());
        let (transitions_tx, _) = broadcast::channel(64);
        let (resolved_tx, resolved_rx) = mpsc::unbounded_channel();

        info!("[LINK] Using {} backend", platform.name());

        let shared = Arc::new(Shared {
            inner: Mutex::new(LinkInner {
                fsm: LinkStateMachine::new(),
                session: None,
                pending_connect: None,
                attempt: 0,
                devices: DiscoveredDevices::new(&config.scan),
                scan_timer: None,
                scan_generation: 0,
                hardware_scanning: false,
                disconnect_generation: 0,
            }),
            commands: CommandChannel::new(config.response_capacity, config.command_timeout),
            config,
            platform,
            strategies,
            state_tx,
            devices_tx,
            transitions_tx,
            resolved_tx,
            connect_turn: Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        // Spawn the event loop
        let shared_clone = shared.clone();
        let handle = tokio::spawn(async move {
            event_loop(shared_clone, events, resolved_rx).await;
        });

        Self {
            shared,
            event_loop: std::sync::Mutex::new(Some(handle)),
        }
    }

    /// Check permission and adapter state; failures land in the Error state
    pub async fn initialize(&self) -> Result<(), LinkError> {
        self.ensure_open()?;

        let error = match self.shared.platform.availability().await {
            Availability::Ready => {
                debug!("[LINK] Bluetooth adapter ready");
                return Ok(());
            }
            Availability::PermissionDenied => LinkError::PermissionDenied,
            Availability::AdapterMissing => {
                LinkError::AdapterUnavailable("no adapter present".into())
            }
            Availability::AdapterDisabled => {
                LinkError::AdapterUnavailable("adapter is disabled".into())
            }
        };

        error!("[LINK] {}", error);
        let release = {
            let mut inner = self.shared.inner.lock().await;
            self.shared.set_unavailable(&mut inner, error)
        };
        self.shared.release_in_background(release);
        Ok(())
    }

    /// Start a timed discovery pass, clearing the previous results
    pub async fn start_scanning(&self) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.shared.start_scan().await;
        Ok(())
    }

    /// Stop the discovery pass; a no-op when none was started
    pub async fn stop_scanning(&self) {
        self.shared.stop_scan().await;
    }

    /// Connect to `address`, retrying over the backoff schedule
    ///
    /// Returns `Ok(false)` once every attempt has failed.
    pub async fn connect_with_retry(&self, address: &str) -> Result<bool, LinkError> {
        self.ensure_open()?;
        let _turn = self.shared.connect_turn.lock().await;

        let (connected, same_address) = {
            let inner = self.shared.inner.lock().await;
            (inner.state().is_connected(), inner.session_address_is(address))
        };
        if connected {
            if same_address {
                debug!("[LINK] Already connected to {}", address);
                return Ok(true);
            }
            info!("[LINK] Dropping current link before connecting to {}", address);
            self.shared.disconnect().await;
        }
        let generation = self.shared.inner.lock().await.disconnect_generation;

        let schedule = self.shared.config.backoff.schedule();
        for attempt in 0..schedule.attempts() {
            self.ensure_open()?;
            info!(
                "[LINK] Connecting to {} (attempt {}/{})",
                address,
                attempt + 1,
                schedule.attempts()
            );

            match self.shared.connect_once(address).await {
                Ok(()) => {
                    info!("[LINK] Connected to {}", address);
                    self.shared.initialize_adapter().await;
                    return Ok(!self.shared.disconnected_since(generation).await);
                }
                Err(e) => warn!("[LINK] Attempt {} failed: {}", attempt + 1, e),
            }

            if self.shared.disconnected_since(generation).await {
                info!("[LINK] Connect to {} cancelled by disconnect", address);
                return Ok(false);
            }

            if let Some(delay) = schedule.delay_after(attempt) {
                debug!("[LINK] Retrying in {:?}", delay);
                tokio::time::sleep(delay).await;

                if self.shared.disconnected_since(generation).await {
                    info!("[LINK] Connect to {} cancelled by disconnect", address);
                    return Ok(false);
                }
            }
        }

        error!(
            "[LINK] Giving up on {} after {} attempts",
            address,
            schedule.attempts()
        );
        Ok(false)
    }

    /// Send one command and wait for its response
    ///
    /// `Ok(None)` means nothing usable came back: no link, a rejected write,
    /// or a timeout.
    pub async fn send_command(&self, command: &str) -> Result<Option<String>, LinkError> {
        self.ensure_open()?;
        Ok(self.shared.send_command(command).await)
    }

    /// Drop the link; always ends Disconnected
    pub async fn disconnect(&self) {
        self.shared.disconnect().await;
    }

    /// Disconnect and permanently stop background work
    pub async fn cleanup(&self) {
        self.shared.disconnect().await;

        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.commands.close();

        if let Ok(mut handle) = self.event_loop.lock() {
            if let Some(handle) = handle.take() {
                handle.abort();
            }
        }
        self.shared.inner.lock().await.stop_scan_timer();
        info!("[LINK] Connection manager shut down");
    }

    pub fn is_connected(&self) -> bool {
        self.shared.state_tx.borrow().is_connected()
    }

    /// Current link state
    pub fn current_state(&self) -> ConnectionState {
        self.shared.state_tx.borrow().clone()
    }

    /// Latest-value stream of the link state
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Every transition, including short-lived Error states
    pub fn transitions(&self) -> broadcast::Receiver<StateTransition> {
        self.shared.transitions_tx.subscribe()
    }

    /// Latest-value stream of the devices found by the current scan
    pub fn devices(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        self.shared.devices_tx.subscribe()
    }

    pub fn discovered_devices(&self) -> Vec<DiscoveredDevice> {
        self.shared.devices_tx.borrow().clone()
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(LinkError::ShutDown);
        }
        Ok(())
    }
}

impl Shared {
    /// Feed an event to the state machine and publish the result
    ///
    /// Called with the lock held so publication order matches transition order.
    fn apply(&self, inner: &mut LinkInner, event: LinkEvent) -> TransitionResult {
        let result = inner.fsm.process_event(event);
        match &result {
            TransitionResult::Changed { from, to } => {
                info!("[LINK] {} -> {}", from, to);
                self.state_tx.send_replace(to.clone());
                let _ = self.transitions_tx.send(StateTransition {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            TransitionResult::Unchanged(_) => {}
            TransitionResult::Invalid { from, event } => {
                debug!("[LINK] Ignoring {:?} in state {}", event, from);
            }
        }
        result
    }

    /// Fail the attempt in progress: Error, then local teardown, then Disconnected
    ///
    /// Returns the address whose hardware handle should be released.
    fn fail_attempt(&self, inner: &mut LinkInner, error: LinkError) -> Option<String> {
        self.apply(inner, LinkEvent::ConnectFailed(error.clone()));
        if let Some(pending) = inner.pending_connect.take() {
            let _ = pending.send(Err(error));
        }
        let address = inner.take_session();
        self.apply(inner, LinkEvent::TornDown);
        address
    }

    /// Adapter or permission loss: Error, dropping any session and pending attempt
    ///
    /// Returns the address whose hardware handle should be released.
    fn set_unavailable(&self, inner: &mut LinkInner, error: LinkError) -> Option<String> {
        inner.stop_scan_timer();
        self.apply(inner, LinkEvent::Unavailable(error.clone()));
        if let Some(pending) = inner.pending_connect.take() {
            let _ = pending.send(Err(error));
        }
        inner.take_session()
    }

    async fn disconnected_since(&self, generation: u64) -> bool {
        self.inner.lock().await.disconnect_generation != generation
    }

    /// Best-effort hardware release off the caller's path
    fn release_in_background(self: &Arc<Self>, address: Option<String>) {
        let Some(address) = address else {
            return;
        };
        let shared = self.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.platform.disconnect(&address).await {
                warn!("[BLE] Error releasing {}: {}", address, e);
            }
        });
    }

    async fn start_scan(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state(),
                ConnectionState::Connecting | ConnectionState::Connected
            ) {
                warn!("[SCAN] Ignoring scan request while {}", inner.state());
                return;
            }

            inner.stop_scan_timer();
            inner.devices.clear();
            self.devices_tx.send_replace(Vec::new());
            self.apply(&mut inner, LinkEvent::ScanStarted);
            inner.hardware_scanning = true;
            inner.scan_generation
        };

        if let Err(e) = self.platform.start_scan().await {
            error!("[SCAN] Failed to start scan: {}", e);
            let release = {
                let mut inner = self.inner.lock().await;
                inner.hardware_scanning = false;
                let error = LinkError::AdapterUnavailable(format!("scan could not start: {}", e));
                self.set_unavailable(&mut inner, error)
            };
            self.release_in_background(release);
            return;
        }

        let duration = self.config.scan.scan_duration;
        info!("[SCAN] Scanning for adapters ({:?})", duration);

        let shared = self.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            shared.finish_scan(generation).await;
        });

        let mut inner = self.inner.lock().await;
        if inner.scan_generation == generation && *inner.state() == ConnectionState::Scanning {
            inner.scan_timer = Some(timer);
        } else {
            timer.abort();
        }
    }

    /// Scan window elapsed
    async fn finish_scan(&self, generation: u64) {
        {
            let mut inner = self.inner.lock().await;
            if inner.scan_generation != generation {
                return;
            }
            // Our own handle; dropping it does not cancel this task
            inner.scan_timer = None;
        }
        info!("[SCAN] Discovery scan completed");
        self.stop_scan().await;
    }

    async fn stop_scan(&self) {
        let (hardware_scanning, was_scanning) = {
            let mut inner = self.inner.lock().await;
            inner.stop_scan_timer();
            (
                std::mem::take(&mut inner.hardware_scanning),
                *inner.state() == ConnectionState::Scanning,
            )
        };

        if hardware_scanning {
            if let Err(e) = self.platform.stop_scan().await {
                warn!("[SCAN] Failed to stop scan: {}", e);
            }
        }

        if !was_scanning {
            return;
        }

        let mut inner = self.inner.lock().await;
        if *inner.state() == ConnectionState::Scanning {
            self.apply(&mut inner, LinkEvent::ScanStopped);
            info!("[SCAN] Found {} adapter(s)", inner.devices.len());
        }
    }

    /// One connect attempt, bounded by the connect timeout
    async fn connect_once(self: &Arc<Self>, address: &str) -> Result<(), LinkError> {
        self.stop_scan().await;

        let (pending_tx, pending_rx) = oneshot::channel();
        let (attempt, stale) = {
            let mut inner = self.inner.lock().await;
            let stale = inner.take_session();
            inner.attempt += 1;
            inner.session = Some(TransportSession::new(address));
            inner.pending_connect = Some(pending_tx);

            if let TransitionResult::Invalid { from, .. } =
                self.apply(&mut inner, LinkEvent::ConnectRequested)
            {
                inner.pending_connect = None;
                inner.session = None;
                return Err(LinkError::ConnectFailed(format!("link busy ({})", from)));
            }
            (inner.attempt, stale)
        };
        self.release_in_background(stale);

        if let Err(e) = self.platform.connect(address).await {
            let error = LinkError::ConnectFailed(e.to_string());
            let release = {
                let mut inner = self.inner.lock().await;
                if inner.attempt == attempt && *inner.state() == ConnectionState::Connecting {
                    self.fail_attempt(&mut inner, error.clone())
                } else {
                    None
                }
            };
            self.release_in_background(release);
            return Err(error);
        }

        match timeout(self.config.connect_timeout, pending_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(LinkError::ConnectFailed("connect attempt abandoned".into())),
            Err(_) => {
                // Nobody completed the attempt; fail it ourselves
                let release = {
                    let mut inner = self.inner.lock().await;
                    if inner.attempt == attempt && *inner.state() == ConnectionState::Connecting {
                        self.fail_attempt(&mut inner, LinkError::ConnectTimeout)
                    } else {
                        None
                    }
                };
                self.release_in_background(release);
                Err(LinkError::ConnectTimeout)
            }
        }
    }

    /// Issue the adapter setup sequence, logging each reply
    async fn initialize_adapter(&self) {
        for command in &self.config.init_commands {
            match self.send_command(command).await {
                Some(response) => info!("[LINK] {} -> {}", command, response),
                None => warn!("[LINK] {} got no response", command),
            }
        }
    }

    async fn send_command(&self, command: &str) -> Option<String> {
        let target = {
            let inner = self.inner.lock().await;
            inner.session.as_ref().and_then(|s| {
                s.write_characteristic()
                    .map(|c| (s.address().to_string(), c))
            })
        };

        let Some((address, characteristic)) = target else {
            debug!("[CMD] {} dropped: no writable characteristic", command);
            return None;
        };

        let payload = codec::encode_command(command);
        let platform = self.platform.clone();
        debug!("[CMD] TX {}", command);

        let response = self
            .commands
            .exchange(command, async move {
                match platform.write(&address, &characteristic, payload).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("[CMD] Write to {} failed: {}", address, e);
                        false
                    }
                }
            })
            .await;

        if let Some(ref text) = response {
            debug!("[CMD] RX {}", text);
        }
        response
    }

    async fn disconnect(&self) {
        let (address, was_scanning) = {
            let mut inner = self.inner.lock().await;
            let was_scanning = std::mem::take(&mut inner.hardware_scanning);
            inner.disconnect_generation += 1;
            inner.stop_scan_timer();
            if let Some(pending) = inner.pending_connect.take() {
                let _ = pending.send(Err(LinkError::ConnectFailed(
                    "disconnect requested".into(),
                )));
            }
            (inner.take_session(), was_scanning)
        };

        if was_scanning {
            if let Err(e) = self.platform.stop_scan().await {
                warn!("[SCAN] Failed to stop scan: {}", e);
            }
        }

        if let Some(ref address) = address {
            info!("[LINK] Disconnecting from {}", address);
            if let Err(e) = self.platform.disconnect(address).await {
                warn!("[BLE] Error releasing {}: {}", address, e);
            }
        }

        let stale = self.commands.drain().await;
        if !stale.is_empty() {
            debug!("[CMD] Dropped {} unread frame(s)", stale.len());
        }

        let mut inner = self.inner.lock().await;
        self.apply(&mut inner, LinkEvent::DisconnectRequested);
    }

    async fn handle_hardware_event(self: &Arc<Self>, event: HardwareEvent) {
        match event {
            HardwareEvent::Advertisement { name, address, rssi } => {
                let mut inner = self.inner.lock().await;
                if *inner.state() != ConnectionState::Scanning {
                    return;
                }
                if inner.devices.record(name.clone(), address.clone(), rssi) {
                    debug!("[SCAN] {} {:?} ({} dBm)", address, name, rssi);
                    self.devices_tx.send_replace(inner.devices.snapshot());
                }
            }
            HardwareEvent::ScanFailed { code } => {
                error!("[SCAN] Scan failed with code {}", code);
                let hardware_scanning = {
                    let mut inner = self.inner.lock().await;
                    inner.stop_scan_timer();
                    std::mem::take(&mut inner.hardware_scanning)
                };
                if hardware_scanning {
                    if let Err(e) = self.platform.stop_scan().await {
                        warn!("[SCAN] Failed to stop scan: {}", e);
                    }
                }
                let mut inner = self.inner.lock().await;
                self.apply(&mut inner, LinkEvent::ScanFailed { code });
            }
            HardwareEvent::Connected { address } => {
                let attempt = {
                    let mut inner = self.inner.lock().await;
                    if !inner.session_address_is(&address)
                        || *inner.state() != ConnectionState::Connecting
                    {
                        debug!("[BLE] Ignoring connect callback for {}", address);
                        return;
                    }
                    self.apply(&mut inner, LinkEvent::HardwareConnected);
                    inner.attempt
                };
                info!("[BLE] Link up to {}, resolving services", address);
                self.spawn_resolution(address, attempt);
            }
            HardwareEvent::Disconnected { address, reason } => {
                let release = {
                    let mut inner = self.inner.lock().await;
                    if !inner.session_address_is(&address) {
                        debug!("[BLE] Ignoring disconnect callback for {}", address);
                        return;
                    }
                    match inner.state().clone() {
                        ConnectionState::Connecting => {
                            warn!("[BLE] {} dropped while connecting: {}", address, reason);
                            self.fail_attempt(&mut inner, LinkError::ConnectFailed(reason))
                        }
                        ConnectionState::Connected => {
                            warn!("[BLE] Lost link to {}: {}", address, reason);
                            self.apply(&mut inner, LinkEvent::HardwareDisconnected { reason });
                            inner.take_session()
                        }
                        _ => inner.take_session(),
                    }
                };
                self.release_in_background(release);
            }
            HardwareEvent::Notification {
                characteristic,
                value,
            } => {
                let frame = {
                    let mut inner = self.inner.lock().await;
                    inner
                        .session
                        .as_mut()
                        .and_then(|s| s.on_notification(&characteristic, &value))
                };
                if let Some(frame) = frame {
                    self.commands.push_frame(frame).await;
                }
            }
        }
    }

    fn spawn_resolution(self: &Arc<Self>, address: String, attempt: u64) {
        let shared = self.clone();
        tokio::spawn(async move {
            let outcome = shared.resolve(&address).await;
            let _ = shared.resolved_tx.send(Resolution { attempt, outcome });
        });
    }

    /// Discover services, pick characteristics and enable notifications
    async fn resolve(
        &self,
        address: &str,
    ) -> Result<(&'static str, ResolvedCharacteristics), LinkError> {
        let services = self
            .platform
            .discover_services(address)
            .await
            .map_err(|e| LinkError::ConnectFailed(format!("service discovery failed: {}", e)))?;

        let (strategy, resolved) = resolve_characteristics(&self.strategies, &services)
            .ok_or(LinkError::NoCompatibleService)?;

        match resolved.notify {
            Some(notify) => self.platform.subscribe(address, &notify).await.map_err(|e| {
                LinkError::ConnectFailed(format!("enabling notifications failed: {}", e))
            })?,
            None => warn!(
                "[BLE] {} has no notifiable characteristic; responses will not arrive",
                address
            ),
        }

        Ok((strategy, resolved))
    }

    async fn handle_resolution(self: &Arc<Self>, resolution: Resolution) {
        let release = {
            let mut inner = self.inner.lock().await;
            if inner.attempt != resolution.attempt
                || *inner.state() != ConnectionState::Connecting
            {
                debug!("[BLE] Dropping stale service resolution");
                return;
            }

            match resolution.outcome {
                Ok((strategy, resolved)) => {
                    info!("[BLE] Using {} characteristics", strategy);
                    if let Some(session) = inner.session.as_mut() {
                        session.attach(resolved);
                    }
                    self.apply(&mut inner, LinkEvent::ServicesResolved);
                    if let Some(pending) = inner.pending_connect.take() {
                        let _ = pending.send(Ok(()));
                    }
                    None
                }
                Err(e) => {
                    warn!("[BLE] Service resolution failed: {}", e);
                    self.fail_attempt(&mut inner, e)
                }
            }
        };
        self.release_in_background(release);
    }
}

/// Funnel hardware callbacks and resolution results into the state machine
async fn event_loop(
    shared: Arc<Shared>,
    mut hardware_rx: HardwareEventReceiver,
    mut resolved_rx: mpsc::UnboundedReceiver<Resolution>,
) {
    loop {
        tokio::select! {
            Some(event) = hardware_rx.recv() => shared.handle_hardware_event(event).await,
            Some(resolution) = resolved_rx.recv() => shared.handle_resolution(resolution).await,
            else => break,
        }
    }
    debug!("[LINK] Event loop stopped");
}
