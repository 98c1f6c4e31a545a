//! iSCSI target server implementation
//!
//! This module provides the main server structure and builder pattern.

use crate::auth::{Authenticator, NoAuthentication};
use crate::connection::{Connection, TargetContext};
use crate::error::{IscsiError, ScsiResult};
use crate::logical_unit::LogicalUnit;
use crate::login::LoginSettings;
use crate::scsi::ScsiBlockDevice;
use crate::session::{SessionManager, SessionParams};
use crate::task_manager::DEFAULT_WORKERS;
use crate::task_set::DEFAULT_TASK_SET_CAPACITY;
use crate::tsih::TsihAllocator;
use std::collections::BTreeMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Default iSCSI port
pub const DEFAULT_PORT: u16 = 3260;

/// How often the accept loop looks at the shutdown flag
const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Longest name RFC 3720 allows
const MAX_NAME_LENGTH: usize = 223;

/// iSCSI target server
pub struct IscsiTarget {
    bind_addr: String,
    context: Arc<TargetContext>,
    tsih: Arc<TsihAllocator>,
    running: AtomicBool,
    local_addr: Mutex<Option<SocketAddr>>,
    connections: Mutex<Vec<JoinHandle<()>>>,
}

impl IscsiTarget {
    /// Create a new builder for configuring the target
    pub fn builder() -> IscsiTargetBuilder {
        IscsiTargetBuilder::new()
    }

    pub fn target_name(&self) -> &str {
        &self.context.settings.target_name
    }

    /// Address the listener is bound to, once `listen` has run
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_count(&self) -> usize {
        self.context.sessions.session_count()
    }

    /// TSIH values currently handed out
    pub fn tsih_in_use(&self) -> usize {
        self.tsih.in_use()
    }

    pub fn luns(&self) -> Vec<u64> {
        self.context.lun_list()
    }

    /// Bind the listening socket and start the logical units
    pub fn listen(&self) -> ScsiResult<TcpListener> {
        let listener = TcpListener::bind(&self.bind_addr)?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(addr);

        let luns = self.context.lun_list();
        for lu in self.context.luns.values() {
            lu.start(luns.clone())?;
        }
        self.running.store(true, Ordering::SeqCst);
        log::info!("iSCSI target {} listening on {}", self.target_name(), addr);
        Ok(listener)
    }

    /// Accept connections until `shutdown` is called
    pub fn serve(&self, listener: TcpListener) -> ScsiResult<()> {
        listener.set_nonblocking(true)?;
        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = self.accept(stream, peer) {
                        log::warn!("Dropping connection from {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("Accept failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        log::info!("iSCSI target {} stopped accepting", self.target_name());
        Ok(())
    }

    /// Run the iSCSI target server
    ///
    /// This blocks the current thread and processes incoming connections.
    pub fn run(&self) -> ScsiResult<()> {
        log::info!("iSCSI target starting on {}", self.bind_addr);
        log::info!("Target name: {}", self.target_name());
        let listener = self.listen()?;
        self.serve(listener)
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) -> ScsiResult<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let connection = Connection::new(Arc::clone(&self.context), Box::new(stream))?;
        let handle = thread::Builder::new()
            .name(format!("iscsi-{}", peer))
            .spawn(move || connection.run())?;

        let mut connections = self.connections.lock().unwrap_or_else(|e| e.into_inner());
        connections.retain(|h| !h.is_finished());
        connections.push(handle);
        Ok(())
    }

    /// Stop accepting, close every connection, and stop the logical units
    pub fn shutdown(&self) {
        log::info!("Shutting down iSCSI target {}", self.target_name());
        self.running.store(false, Ordering::SeqCst);
        self.context.stop_accepting();
        self.context.close_all();

        let handles: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Connection thread panicked");
            }
        }
        for lu in self.context.luns.values() {
            lu.stop();
        }
    }

    /// Refuse new logins and wait up to `timeout` for sessions to log out,
    /// then shut down. Returns true when every session ended on its own.
    pub fn shutdown_gracefully(&self, timeout: Duration) -> bool {
        self.context.stop_accepting();
        let deadline = Instant::now() + timeout;
        while self.session_count() > 0 && Instant::now() < deadline {
            thread::sleep(ACCEPT_POLL);
        }
        let drained = self.session_count() == 0;
        if !drained {
            log::warn!("{} sessions still open at shutdown", self.session_count());
        }
        self.shutdown();
        drained
    }
}

impl Drop for IscsiTarget {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.shutdown();
        }
    }
}

/// Builder for configuring an iSCSI target
pub struct IscsiTargetBuilder {
    bind_addr: Option<String>,
    target_name: Option<String>,
    target_alias: Option<String>,
    portal: Option<String>,
    params: SessionParams,
    task_set_capacity: usize,
    workers: usize,
    authenticator: Arc<dyn Authenticator>,
    devices: Vec<Box<dyn ScsiBlockDevice>>,
}

impl IscsiTargetBuilder {
    fn new() -> Self {
        Self {
            bind_addr: None,
            target_name: None,
            target_alias: None,
            portal: None,
            params: SessionParams::default(),
            task_set_capacity: DEFAULT_TASK_SET_CAPACITY,
            workers: DEFAULT_WORKERS,
            authenticator: Arc::new(NoAuthentication),
            devices: Vec::new(),
        }
    }

    /// Set the bind address (default: 0.0.0.0:3260)
    pub fn bind_addr(mut self, addr: &str) -> Self {
        self.bind_addr = Some(addr.to_string());
        self
    }

    /// Set the iSCSI target name (IQN format)
    ///
    /// Example: iqn.2025-12.local:storage.disk1
    pub fn target_name(mut self, name: &str) -> Self {
        self.target_name = Some(name.to_string());
        self
    }

    pub fn target_alias(mut self, alias: &str) -> Self {
        self.target_alias = Some(alias.to_string());
        self
    }

    /// Address advertised to SendTargets, `host:port` (default: the bind address)
    pub fn portal(mut self, portal: &str) -> Self {
        self.portal = Some(portal.to_string());
        self
    }

    /// Starting values for parameter negotiation
    pub fn session_params(mut self, params: SessionParams) -> Self {
        self.params = params;
        self
    }

    pub fn max_connections(mut self, max: u16) -> Self {
        self.params.max_connections = max;
        self
    }

    /// Tasks each logical unit holds before answering TASK SET FULL
    pub fn task_set_capacity(mut self, capacity: usize) -> Self {
        self.task_set_capacity = capacity;
        self
    }

    /// Worker threads per logical unit
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// Add a logical unit; LUNs are numbered from 0 in the order added
    pub fn lun<D: ScsiBlockDevice + 'static>(mut self, device: D) -> Self {
        self.devices.push(Box::new(device));
        self
    }

    /// Build the target
    pub fn build(self) -> ScsiResult<IscsiTarget> {
        let bind_addr = self
            .bind_addr
            .unwrap_or_else(|| format!("0.0.0.0:{}", DEFAULT_PORT));
        let target_name = self.target_name.unwrap_or_else(|| {
            "iqn.2025-12.local:storage.default".to_string()
        });
        validate_name(&target_name)?;

        if self.devices.is_empty() {
            return Err(IscsiError::Config("at least one LUN is required".to_string()));
        }
        if self.task_set_capacity == 0 {
            return Err(IscsiError::Config("task set capacity must be at least 1".to_string()));
        }
        if self.params.max_connections == 0 {
            return Err(IscsiError::Config("MaxConnections must be at least 1".to_string()));
        }

        let luns: BTreeMap<u64, Arc<LogicalUnit>> = self
            .devices
            .into_iter()
            .enumerate()
            .map(|(lun, device)| {
                let lun = lun as u64;
                (
                    lun,
                    Arc::new(LogicalUnit::with_capacity(
                        lun,
                        device,
                        self.task_set_capacity,
                        self.workers,
                    )),
                )
            })
            .collect();

        let portal = format!("{},1", self.portal.as_deref().unwrap_or(&bind_addr));
        let settings = LoginSettings {
            target_name: target_name.clone(),
            target_alias: self.target_alias.unwrap_or_default(),
            portal,
            params: self.params,
            authenticator: self.authenticator,
        };
        let tsih = Arc::new(TsihAllocator::new());
        let sessions = SessionManager::new(Arc::clone(&tsih));

        Ok(IscsiTarget {
            bind_addr,
            context: Arc::new(TargetContext::new(settings, sessions, luns)),
            tsih,
            running: AtomicBool::new(false),
            local_addr: Mutex::new(None),
            connections: Mutex::new(Vec::new()),
        })
    }
}

/// Check an iSCSI qualified name (RFC 3720 Section 3.2.6.3.1)
fn validate_name(name: &str) -> ScsiResult<()> {
    if !name.starts_with("iqn.") {
        return Err(IscsiError::Config(
            "target_name must be in IQN format (e.g., iqn.2025-12.local:storage.disk1)".to_string()
        ));
    }
    if name.len() > MAX_NAME_LENGTH {
        return Err(IscsiError::Config(format!(
            "target_name is {} bytes, the limit is {}",
            name.len(),
            MAX_NAME_LENGTH
        )));
    }
    let valid = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | ':');
    if let Some(bad) = name.chars().find(|c| !valid(*c)) {
        return Err(IscsiError::Config(format!(
            "target_name contains '{}'; only lowercase letters, digits, '.', '-' and ':' are allowed",
            bad
        )));
    }
    Ok(())
}
