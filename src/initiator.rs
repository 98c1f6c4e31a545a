//! Multi-connection initiator sessions
//!
//! An [`InitiatorSession`] logs in one leading connection, then joins further
//! connections to the same session by TSIH. All of them draw CmdSN from one
//! [`SessionCounters`]; a [`TaskBalancer`] decides which connection carries
//! each operation, so independent threads can drive the session at once.

use crate::balancer::{RoundRobinBalancer, TaskBalancer};
use crate::client::{IscsiClient, SessionCounters};
use crate::error::{IscsiError, ScsiResult};
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex, MutexGuard};

/// A logged-in session spread over one or more connections
pub struct InitiatorSession {
    target_name: String,
    tsih: u16,
    counters: Arc<SessionCounters>,
    connections: BTreeMap<u16, Mutex<IscsiClient>>,
    balancer: Box<dyn TaskBalancer>,
    capacity: (u64, u32),
}

impl InitiatorSession {
    /// Open a session with `connections` connections balanced round robin
    pub fn connect<A: ToSocketAddrs>(addr: A, initiator: &str, target: &str, connections: u16) -> ScsiResult<Self> {
        Self::open(addr, initiator, target, connections, Box::new(RoundRobinBalancer::new()))
    }

    /// Open a session, logging in every connection and reading the capacity
    /// of LUN 0 on each
    ///
    /// The target may negotiate MaxConnections below `connections`; the
    /// session then opens as many as it allows.
    pub fn open<A: ToSocketAddrs>(
        addr: A,
        initiator: &str,
        target: &str,
        connections: u16,
        balancer: Box<dyn TaskBalancer>,
    ) -> ScsiResult<Self> {
        if connections == 0 {
            return Err(IscsiError::Config("a session needs at least one connection".to_string()));
        }
        let addr: SocketAddr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| IscsiError::Config("address resolved to nothing".to_string()))?;

        let mut leading = IscsiClient::connect(addr)?;
        leading.params_mut().max_connections = connections;
        leading.login(initiator, target)?;
        let capacity = leading.read_capacity()?;

        let tsih = leading.tsih();
        let isid = leading.isid();
        let counters = leading.counters();
        let allowed = leading.params().max_connections.min(connections);
        if allowed < connections {
            log::warn!(
                "Target allows {} connections per session, {} requested",
                allowed,
                connections
            );
        }

        let mut clients = BTreeMap::new();
        balancer.add_connection(leading.cid());
        clients.insert(leading.cid(), Mutex::new(leading));

        for cid in 1..allowed {
            let mut client = IscsiClient::join(addr, isid, tsih, cid, Arc::clone(&counters))?;
            client.login(initiator, target)?;
            client.read_capacity()?;
            balancer.add_connection(cid);
            clients.insert(cid, Mutex::new(client));
        }
        log::info!(
            "Session TSIH {} to {} open with {} connection(s)",
            tsih,
            target,
            clients.len()
        );

        Ok(InitiatorSession {
            target_name: target.to_string(),
            tsih,
            counters,
            connections: clients,
            balancer,
            capacity,
        })
    }

    pub fn tsih(&self) -> u16 {
        self.tsih
    }

    pub fn target_name(&self) -> &str {
        &self.target_name
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// CmdSN the next command of this session will carry
    pub fn cmd_sn(&self) -> u32 {
        self.counters.cmd_sn()
    }

    /// Capacity read at login: (number of blocks, block size)
    pub fn capacity(&self) -> (u64, u32) {
        self.capacity
    }

    /// Connection id chosen by the balancer for the next task
    pub fn get_connection(&self) -> ScsiResult<u16> {
        self.balancer.get_connection()
    }

    /// Give back a connection taken with `get_connection`
    pub fn release_connection(&self, cid: u16) -> ScsiResult<()> {
        self.balancer.release_connection(cid)
    }

    fn client(&self, cid: u16) -> ScsiResult<MutexGuard<'_, IscsiClient>> {
        let client = self
            .connections
            .get(&cid)
            .ok_or_else(|| IscsiError::NoSuchConnection(format!("CID {}", cid)))?;
        Ok(match client.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        })
    }

    /// Run `f` on a balanced connection, releasing it afterwards
    fn with_connection<T>(&self, f: impl FnOnce(&mut IscsiClient) -> ScsiResult<T>) -> ScsiResult<T> {
        let cid = self.get_connection()?;
        let result = self.client(cid).and_then(|mut client| f(&mut client));
        self.release_connection(cid)?;
        result
    }

    /// Re-read the capacity through any connection
    pub fn read_capacity(&self) -> ScsiResult<(u64, u32)> {
        self.with_connection(|client| client.read_capacity())
    }

    pub fn read(&self, lba: u64, blocks: u32) -> ScsiResult<Vec<u8>> {
        self.with_connection(|client| client.read(lba, blocks))
    }

    pub fn write(&self, lba: u64, data: &[u8]) -> ScsiResult<()> {
        self.with_connection(|client| client.write(lba, data))
    }

    /// Log the session out and drop every connection
    ///
    /// The logout travels on the first connection; the target then closes
    /// the others itself.
    pub fn close(mut self) -> ScsiResult<()> {
        let mut result = Ok(());
        let mut first = true;
        for (cid, client) in std::mem::take(&mut self.connections) {
            let mut client = match client.into_inner() {
                Ok(client) => client,
                Err(poisoned) => poisoned.into_inner(),
            };
            if first {
                first = false;
                result = client.logout();
            } else {
                client.close();
            }
            if let Err(e) = self.balancer.remove_connection(cid) {
                log::debug!("Balancer had no CID {}: {}", cid, e);
            }
        }
        log::info!("Session TSIH {} closed", self.tsih);
        result
    }
}

impl std::fmt::Debug for InitiatorSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitiatorSession")
            .field("target", &self.target_name)
            .field("tsih", &self.tsih)
            .field("connections", &self.connections.keys().collect::<Vec<_>>())
            .finish()
    }
}
