//! Service Class Provider (SCP) implementation for inbound DIMSE operations

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dicom_ul::pdu::Pdu;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::association::Association;
use crate::config::DimseConfig;
use crate::dispatch::DispatchLoop;
use crate::negotiator::{AssociationNegotiator, NegotiationOutcome, RejectReason};
use crate::registry::{ServiceContext, ServiceRegistry};
use crate::transport::TcpChannel;
use crate::wire;
use crate::{DimseError, Result};

/// Pause after a failed accept, e.g. when the process is out of file descriptors
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// State shared between the listener handle, its accept loop and the workers
struct Shared {
    config: DimseConfig,
    negotiator: AssociationNegotiator,
    registry: Arc<ServiceRegistry>,
    slots: Arc<Semaphore>,
    stop: CancellationToken,
    shutdown_requested: AtomicBool,
}

/// Accepts associations and runs one dispatch worker per association
pub struct AssociationListener {
    shared: Arc<Shared>,
    started: AtomicBool,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl AssociationListener {
    /// Create a listener; nothing is bound until [`start`](Self::start)
    pub fn new(config: DimseConfig, registry: ServiceRegistry) -> Result<Self> {
        config.validate()?;
        let negotiator = AssociationNegotiator::new(&config);
        let slots = Arc::new(Semaphore::new(config.max_associations as usize));
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                negotiator,
                registry: Arc::new(registry),
                slots,
                stop: CancellationToken::new(),
                shutdown_requested: AtomicBool::new(false),
            }),
            started: AtomicBool::new(false),
            accept_task: Mutex::new(None),
        })
    }

    /// Bind and start accepting; returns the bound address.
    ///
    /// A listener can be started only once.
    pub async fn start(&self) -> Result<SocketAddr> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(DimseError::AlreadyStarted);
        }

        let addr = SocketAddr::new(self.shared.config.bind_addr, self.shared.config.port);
        let listener = bind(addr)?;
        let local_addr = listener.local_addr()?;

        info!(
            "Starting DIMSE SCP on {} (AET: {})",
            local_addr, self.shared.config.ae_title
        );
        debug!("Registered services: {:?}", self.shared.registry.commands());

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(accept_loop(listener, shared));
        *self.accept_task.lock().await = Some(task);
        Ok(local_addr)
    }

    /// Stop accepting new associations.
    ///
    /// In-flight associations run to completion. Calling this again does nothing.
    pub fn stop(&self) {
        if !self.shared.stop.is_cancelled() {
            info!("Stopping DIMSE SCP ({})", self.shared.config.ae_title);
            self.shared.stop.cancel();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Resolves once the listener has been stopped, locally or by a peer shutdown request
    pub async fn stopped(&self) {
        self.shared.stop.cancelled().await
    }

    /// Whether a peer asked this node to shut down
    pub fn shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Wait for the accept loop to exit after a stop
    pub async fn join(&self) {
        let task = self.accept_task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Accept loop ended abnormally: {}", e);
            }
        }
    }

    /// Number of associations currently being served
    pub fn active_associations(&self) -> usize {
        self.shared.config.max_associations as usize - self.shared.slots.available_permits()
    }
}

impl Drop for AssociationListener {
    fn drop(&mut self) {
        self.shared.stop.cancel();
    }
}

fn bind(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    let listener: std::net::TcpListener = socket.into();
    Ok(TcpListener::from_std(listener)?)
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    let poll = shared.config.accept_poll_interval();
    loop {
        tokio::select! {
            _ = shared.stop.cancelled() => break,
            accepted = tokio::time::timeout(poll, listener.accept()) => match accepted {
                // poll interval elapsed; check for stop again
                Err(_) => continue,
                Ok(Ok((stream, peer_addr))) => {
                    debug!("Accepted connection from {}", peer_addr);
                    let permit = Arc::clone(&shared.slots).try_acquire_owned().ok();
                    let shared = Arc::clone(&shared);
                    tokio::spawn(
                        handle_connection(stream, peer_addr, permit, shared)
                            .instrument(info_span!("connection", peer = %peer_addr)),
                    );
                }
                Ok(Err(e)) => {
                    error!("Error accepting connection: {}", e);
                    if !backoff_after_accept_error(&shared.stop).await {
                        break;
                    }
                }
            },
        }
    }
    info!("DIMSE SCP on port {} no longer accepting", shared.config.port);
}

/// Wait before accepting again; false when stop was requested meanwhile
async fn backoff_after_accept_error(stop: &CancellationToken) -> bool {
    tokio::select! {
        _ = stop.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => true,
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<Shared>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Could not disable Nagle on {}: {}", peer_addr, e);
    }
    let config = &shared.config;

    let pdu = tokio::time::timeout(config.acse_timeout(), wire::read_pdu(&mut stream, config.max_pdu)).await;
    let rq = match pdu {
        Ok(Ok(Pdu::AssociationRQ(rq))) => rq,
        Ok(Ok(other)) => {
            warn!("Expected A-ASSOCIATE-RQ, got {}", other.short_description());
            if let Err(e) = wire::write_pdu(&mut stream, &wire::abort()).await {
                debug!("Failed to send A-ABORT to {}: {}", peer_addr, e);
            }
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read association request: {}", e);
            return;
        }
        Err(_) => {
            warn!("No association request within the ACSE timeout");
            return;
        }
    };

    if permit.is_none() {
        warn!(
            "Maximum associations reached, rejecting connection from {}",
            peer_addr
        );
        reject(&mut stream, RejectReason::TooManyAssociations).await;
        return;
    }

    let request = wire::association_request(&rq);
    let contexts = match shared.negotiator.negotiate(&request) {
        Ok(NegotiationOutcome::Accepted(contexts)) => contexts,
        Ok(NegotiationOutcome::ShutdownRequested(_)) => {
            warn!("Shutdown requested by '{}'", request.calling_ae_title);
            reject(&mut stream, RejectReason::ShutdownRequested).await;
            shared.shutdown_requested.store(true, Ordering::SeqCst);
            shared.stop.cancel();
            return;
        }
        Err(reason) => {
            info!(
                "Rejecting association from '{}': {}",
                request.calling_ae_title, reason
            );
            reject(&mut stream, reason).await;
            return;
        }
    };

    let ac = wire::association_ac(&rq, &contexts, config.max_pdu);
    if let Err(e) = wire::write_pdu(&mut stream, &ac).await {
        warn!("Failed to send A-ASSOCIATE-AC: {}", e);
        return;
    }

    let association = Association::new(
        peer_addr,
        request.calling_ae_title.clone(),
        request.called_ae_title.clone(),
        contexts,
        config.max_pdu,
        request.max_pdu_length,
        config.acse_timeout(),
    );
    info!(
        "Association {} accepted from '{}' ({} contexts)",
        association.id(),
        association.calling_ae_title(),
        association.accepted_contexts().count()
    );

    let channel = TcpChannel::new(stream, &association);
    let context = ServiceContext::new(association, config.ae_title.clone());
    let (report, _) = DispatchLoop::new(Arc::clone(&shared.registry), context, channel)
        .run()
        .await;
    debug!("Association finished: {:?}", report);

    drop(permit);
}

async fn reject(stream: &mut TcpStream, reason: RejectReason) {
    if let Err(e) = wire::write_pdu(stream, &wire::association_rj(reason)).await {
        debug!("Failed to send A-ASSOCIATE-RJ: {}", e);
    }
    if let Err(e) = stream.shutdown().await {
        debug!("Failed to shut down rejected connection: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    use crate::services::EchoHandler;

    fn local_config() -> DimseConfig {
        DimseConfig {
            ae_title: "TEST_SCP".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0, // Use any available port
            accept_poll_ms: 50,
            ..Default::default()
        }
    }

    fn registry() -> ServiceRegistry {
        ServiceRegistry::builder()
            .register(EchoHandler)
            .unwrap()
            .build()
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let listener = AssociationListener::new(local_config(), registry()).unwrap();
        let addr = listener.start().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert!(matches!(listener.start().await, Err(DimseError::AlreadyStarted)));
        listener.stop();
        listener.join().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let listener = AssociationListener::new(local_config(), registry()).unwrap();
        listener.start().await.unwrap();

        listener.stop();
        listener.stop();
        assert!(listener.is_stopped());
        tokio::time::timeout(Duration::from_secs(2), listener.join())
            .await
            .expect("accept loop exits promptly");
        listener.stop();
        assert!(!listener.shutdown_requested());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let config = DimseConfig {
            ae_title: String::new(),
            ..local_config()
        };
        assert!(AssociationListener::new(config, registry()).is_err());
    }

    #[tokio::test]
    async fn test_accept_error_backs_off_until_stopped() {
        let stop = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(backoff_after_accept_error(&stop).await);
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);

        stop.cancel();
        let started = std::time::Instant::now();
        assert!(!backoff_after_accept_error(&stop).await);
        assert!(started.elapsed() < ACCEPT_ERROR_BACKOFF);
    }
}
