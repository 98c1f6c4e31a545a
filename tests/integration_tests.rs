//! Integration tests for the iSCSI target and initiator
//!
//! Each test starts its own target on an ephemeral loopback port and drives
//! it with the crate's initiator. They cover:
//! - Discovery and login
//! - SCSI commands and I/O, including R2T-solicited writes
//! - Parameter negotiation (digests, MaxConnections)
//! - Error handling and arbitrary PDU transmission

use iscsi_target::client::IscsiClient;
use iscsi_target::parser::{lun, DataOutParser, Parser, RejectReason, ScsiCommandParser, TaskAttribute};
use iscsi_target::pdu::{login_status, Opcode};
use iscsi_target::scsi::scsi_status;
use iscsi_target::{
    DigestType, InitiatorSession, IscsiError, IscsiTarget, MemoryDevice, ProtocolDataUnit, ProtocolError,
    SingleConnectionBalancer,
};
use once_cell::sync::Lazy;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

// ============================================================================
// Test Configuration
// ============================================================================

#[derive(Debug)]
struct TestConfig {
    target_iqn: String,
    initiator_iqn: String,
    lun: u64,
    block_count: u64,
    block_size: u32,
}

static TEST_CONFIG: Lazy<TestConfig> = Lazy::new(|| {
    let contents = std::fs::read_to_string(concat!(env!("CARGO_MANIFEST_DIR"), "/test-config.toml"))
        .expect("Failed to read test-config.toml - config file required");

    let config = contents
        .parse::<toml::Value>()
        .expect("Failed to parse test-config.toml - invalid TOML syntax");

    let target = config
        .get("target")
        .expect("Missing [target] section in test-config.toml");

    let text = |key: &str| {
        target
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [target] section", key))
            .to_string()
    };
    let number = |key: &str| {
        target
            .get(key)
            .and_then(|v| v.as_integer())
            .unwrap_or_else(|| panic!("Missing or invalid '{}' in [target] section", key))
    };

    TestConfig {
        target_iqn: text("iqn"),
        initiator_iqn: text("initiator_iqn"),
        lun: number("lun") as u64,
        block_count: number("block_count") as u64,
        block_size: number("block_size") as u32,
    }
});

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn target_iqn() -> &'static str {
    &TEST_CONFIG.target_iqn
}

fn initiator_iqn() -> &'static str {
    &TEST_CONFIG.initiator_iqn
}

/// A target serving on 127.0.0.1, shut down when dropped
struct TestTarget {
    target: Arc<IscsiTarget>,
    addr: SocketAddr,
    server: Option<JoinHandle<()>>,
}

impl TestTarget {
    fn start() -> Self {
        Self::start_with(|builder| builder)
    }

    fn start_with(
        configure: impl FnOnce(iscsi_target::IscsiTargetBuilder) -> iscsi_target::IscsiTargetBuilder,
    ) -> Self {
        init_logging();
        let mut builder = IscsiTarget::builder()
            .bind_addr("127.0.0.1:0")
            .target_name(target_iqn());
        // LUNs are numbered in the order added; the ones below the
        // configured LUN share its geometry
        for _ in 0..=TEST_CONFIG.lun {
            builder = builder.lun(MemoryDevice::new(TEST_CONFIG.block_count, TEST_CONFIG.block_size));
        }
        let target = Arc::new(configure(builder).build().expect("target builds"));
        let listener = target.listen().expect("target listens");
        let addr = target.local_addr().expect("bound address");

        let server = {
            let target = Arc::clone(&target);
            thread::spawn(move || {
                if let Err(e) = target.serve(listener) {
                    eprintln!("target stopped with error: {}", e);
                }
            })
        };
        TestTarget {
            target,
            addr,
            server: Some(server),
        }
    }

    fn client(&self) -> IscsiClient {
        IscsiClient::connect(self.addr).expect("connects to target")
    }

    fn logged_in(&self) -> IscsiClient {
        let mut client = self.client();
        client.login(initiator_iqn(), target_iqn()).expect("login succeeds");
        client.set_lun(TEST_CONFIG.lun);
        client
    }
}

impl Drop for TestTarget {
    fn drop(&mut self) {
        self.target.shutdown();
        if let Some(server) = self.server.take() {
            let _ = server.join();
        }
    }
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

// ============================================================================
// Login and discovery
// ============================================================================

#[test]
fn test_login_and_logout() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    assert!(client.is_logged_in());
    assert_eq!(client.login_status(), login_status::SUCCESS_ACCEPT);
    assert_ne!(client.tsih(), 0);
    assert_eq!(target.target.tsih_in_use(), 1);

    client.logout().unwrap();
    assert!(!client.is_logged_in());
}

#[test]
fn test_wrong_target_name() {
    let target = TestTarget::start();
    let mut client = target.client();
    let result = client.login(initiator_iqn(), "iqn.2025-12.local:storage.missing");
    assert!(result.is_err());
    assert_eq!(client.login_status(), login_status::TARGET_NOT_FOUND);
    assert!(!client.is_logged_in());
}

#[test]
fn test_discovery() {
    let target = TestTarget::start();
    let mut client = target.client();
    let targets = client.discover(initiator_iqn()).unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].0, target_iqn());
}

#[test]
fn test_digests_negotiated() {
    let target = TestTarget::start();
    let mut client = target.client();
    client.params_mut().header_digest = DigestType::CRC32C;
    client.params_mut().data_digest = DigestType::CRC32C;
    client.login(initiator_iqn(), target_iqn()).unwrap();
    assert_eq!(client.params().header_digest, DigestType::CRC32C);
    assert_eq!(client.params().data_digest, DigestType::CRC32C);

    // every PDU from here on carries both digests
    client.read_capacity().unwrap();
    let data = pattern(4096, 9);
    client.write(8, &data).unwrap();
    assert_eq!(client.read(8, 8).unwrap(), data);
    client.logout().unwrap();
}

// ============================================================================
// SCSI commands and I/O
// ============================================================================

#[test]
fn test_read_capacity() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    let (blocks, block_size) = client.read_capacity().unwrap();
    assert_eq!(blocks, TEST_CONFIG.block_count);
    assert_eq!(block_size, TEST_CONFIG.block_size);
    client.logout().unwrap();
}

#[test]
fn test_write_read_roundtrip() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    client.read_capacity().unwrap();

    let data = pattern(TEST_CONFIG.block_size as usize * 4, 1);
    client.write(100, &data).unwrap();
    assert_eq!(client.read(100, 4).unwrap(), data);

    // untouched blocks still read back as zeros
    let zeros = client.read(0, 1).unwrap();
    assert!(zeros.iter().all(|&b| b == 0));
    client.logout().unwrap();
}

#[test]
fn test_large_write_uses_r2t() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    client.read_capacity().unwrap();

    // twice FirstBurstLength, so the tail is solicited with R2T
    let first_burst = client.params().first_burst_length as usize;
    let data = pattern(first_burst * 2, 7);
    let blocks = (data.len() / TEST_CONFIG.block_size as usize) as u32;
    client.write(512, &data).unwrap();
    assert_eq!(client.read(512, blocks).unwrap(), data);
    client.logout().unwrap();
}

#[test]
fn test_write_with_initial_r2t() {
    let target = TestTarget::start();
    let mut client = target.client();
    client.params_mut().initial_r2t = true;
    client.params_mut().immediate_data = false;
    client.login(initiator_iqn(), target_iqn()).unwrap();
    assert!(client.params().initial_r2t);
    client.read_capacity().unwrap();

    let data = pattern(16384, 3);
    client.write(32, &data).unwrap();
    assert_eq!(client.read(32, 32).unwrap(), data);
    client.logout().unwrap();
}

#[test]
fn test_read_past_end_is_check_condition() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    let (blocks, _) = client.read_capacity().unwrap();
    assert!(client.read(blocks, 1).is_err());

    // the connection stays usable
    assert_eq!(client.read(0, 1).unwrap().len(), TEST_CONFIG.block_size as usize);
    client.logout().unwrap();
}

#[test]
fn test_unknown_lun() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    client.read_capacity().unwrap();

    client.set_lun(5);
    let test_unit_ready = [0u8; 6];
    let outcome = client.send_scsi_command(&test_unit_ready, 0).unwrap();
    assert_eq!(outcome.status, scsi_status::CHECK_CONDITION);
    assert_eq!(outcome.sense_key(), Some(0x05));
    client.logout().unwrap();
}

/// SCSI Command PDU with a chosen ITT and CmdSN, bypassing the client's bookkeeping
fn raw_command(itt: u32, cmd_sn: u32, cdb: &[u8], write: bool, length: u32) -> ProtocolDataUnit {
    let mut padded = [0u8; 16];
    padded[..cdb.len()].copy_from_slice(cdb);
    let command = ScsiCommandParser {
        read: false,
        write,
        task_attribute: TaskAttribute::Simple,
        lun: lun::encode(TEST_CONFIG.lun),
        expected_data_transfer_length: length,
        cmd_sn,
        exp_stat_sn: 0,
        cdb: padded,
    };
    ProtocolDataUnit::new(Parser::ScsiCommand(command))
        .with_itt(itt)
        .with_final(true)
}

#[test]
fn test_reused_itt_does_not_disturb_outstanding_write() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    let itt = 0x70;
    let block = TEST_CONFIG.block_size;
    let cmd_sn = client.cmd_sn();

    // WRITE(10) of one block at LBA 0, data only after an R2T
    let mut write_10 = [0u8; 10];
    write_10[0] = 0x2A;
    write_10[8] = 1;
    client.send_pdu(raw_command(itt, cmd_sn, &write_10, true, block)).unwrap();
    client.send_pdu(raw_command(itt, cmd_sn.wrapping_add(1), &[0u8; 6], false, 0)).unwrap();

    let mut ttt = None;
    let mut refusal = None;
    while ttt.is_none() || refusal.is_none() {
        let pdu = client.recv_pdu().unwrap();
        assert_eq!(pdu.itt(), itt);
        match pdu.parser() {
            Parser::Ready2Transfer(r2t) => {
                assert_eq!(r2t.desired_data_transfer_length, block);
                ttt = Some(r2t.target_transfer_tag);
            }
            Parser::ScsiResponse(response) => refusal = Some((response.status, pdu.data.clone())),
            other => panic!("unexpected {:?}", other),
        }
    }
    let (status, sense) = refusal.unwrap();
    assert_eq!(status, scsi_status::CHECK_CONDITION);
    // two byte length, then fixed format sense with the ASC at byte 12
    assert_eq!(sense[2 + 12], 0x4E);

    let data_out = DataOutParser {
        lun: lun::encode(TEST_CONFIG.lun),
        target_transfer_tag: ttt.unwrap(),
        exp_stat_sn: 0,
        data_sn: 0,
        buffer_offset: 0,
    };
    client
        .send_pdu(
            ProtocolDataUnit::new(Parser::DataOut(data_out))
                .with_itt(itt)
                .with_final(true)
                .with_data(pattern(block as usize, 3)),
        )
        .unwrap();

    let pdu = client.recv_pdu().unwrap();
    assert_eq!(pdu.itt(), itt);
    match pdu.parser() {
        Parser::ScsiResponse(response) => assert_eq!(response.status, scsi_status::GOOD),
        other => panic!("expected SCSI Response, got {:?}", other),
    }
    client.close();
}

#[test]
fn test_luns_are_independent() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    client.read_capacity().unwrap();
    let data = pattern(TEST_CONFIG.block_size as usize, 11);
    client.write(3, &data).unwrap();

    client.set_lun(0);
    client.read_capacity().unwrap();
    assert!(client.read(3, 1).unwrap().iter().all(|&b| b == 0));

    client.set_lun(TEST_CONFIG.lun);
    client.read_capacity().unwrap();
    assert_eq!(client.read(3, 1).unwrap(), data);
    client.logout().unwrap();
}

#[test]
fn test_nop_echo() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    let payload = b"ping".to_vec();
    assert_eq!(client.nop(&payload).unwrap(), payload);
    client.logout().unwrap();
}

// ============================================================================
// Error handling
// ============================================================================

#[test]
fn test_command_before_capacity_is_out_of_sequence() {
    let target = TestTarget::start();
    let mut client = target.logged_in();

    assert!(client.read(0, 1).is_err());
    let err = client.send_scsi_command(&[0u8; 6], 0).unwrap_err();
    assert!(matches!(
        err,
        IscsiError::Protocol(ProtocolError::SequenceViolation { .. })
    ));
    client.logout().unwrap();
}

#[test]
fn test_operations_need_login() {
    let target = TestTarget::start();
    let mut client = target.client();
    assert!(client.nop(b"x").is_err());
    assert!(client.logout().is_err());
}

#[test]
fn test_unknown_opcode_is_rejected() {
    let target = TestTarget::start();
    let mut client = target.logged_in();

    let mut header = [0u8; 48];
    header[0] = 0x1c;
    header[1] = 0x80;
    client.send_raw(&header).unwrap();

    let reply = client.recv_pdu().unwrap();
    assert_eq!(reply.opcode(), Opcode::Reject);
    match reply.parser() {
        Parser::Reject(reject) => assert_eq!(reject.reason, RejectReason::CommandNotSupported),
        other => panic!("expected Reject, got {:?}", other),
    }
    // the rejected header comes back as data
    assert_eq!(&reply.data[..48], &header[..]);

    // and the connection is still in full feature phase
    assert_eq!(client.nop(b"still here").unwrap(), b"still here".to_vec());
    client.logout().unwrap();
}

// ============================================================================
// Multi-connection sessions
// ============================================================================

#[test]
fn test_multi_connection_session() {
    let target = TestTarget::start_with(|builder| builder.max_connections(2));
    let session = Arc::new(InitiatorSession::connect(target.addr, initiator_iqn(), target_iqn(), 2).unwrap());
    assert_eq!(session.connection_count(), 2);
    assert_eq!(session.capacity(), (TEST_CONFIG.block_count, TEST_CONFIG.block_size));
    assert_eq!(target.target.session_count(), 1);

    let block_size = TEST_CONFIG.block_size as usize;
    let workers: Vec<_> = (0..4u8)
        .map(|n| {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                let lba = 1000 + n as u64 * 16;
                let data = pattern(block_size * 16, n);
                for _ in 0..5 {
                    session.write(lba, &data).unwrap();
                    assert_eq!(session.read(lba, 16).unwrap(), data);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let session = Arc::try_unwrap(session).expect("workers are done");
    session.close().unwrap();
}

#[test]
fn test_connection_logout_keeps_session() {
    let target = TestTarget::start_with(|builder| builder.max_connections(2));
    let mut leading = target.client();
    leading.params_mut().max_connections = 2;
    leading.login(initiator_iqn(), target_iqn()).unwrap();

    let mut second = IscsiClient::join(target.addr, leading.isid(), leading.tsih(), 1, leading.counters()).unwrap();
    second.login(initiator_iqn(), target_iqn()).unwrap();
    assert_eq!(second.tsih(), leading.tsih());
    assert_eq!(target.target.session_count(), 1);

    second.logout_connection().unwrap();
    assert_eq!(leading.nop(b"alive").unwrap(), b"alive".to_vec());
    leading.logout().unwrap();
}

#[test]
fn test_connections_limited_by_target() {
    let target = TestTarget::start();
    let session = InitiatorSession::open(
        target.addr,
        initiator_iqn(),
        target_iqn(),
        3,
        Box::new(SingleConnectionBalancer::new()),
    )
    .unwrap();
    // the target keeps MaxConnections at its default of 1
    assert_eq!(session.connection_count(), 1);
    session.write(0, &pattern(TEST_CONFIG.block_size as usize, 5)).unwrap();
    session.close().unwrap();
}

#[test]
fn test_graceful_shutdown_waits_for_logout() {
    let target = TestTarget::start();
    let mut client = target.logged_in();
    client.logout().unwrap();

    // give the connection thread a moment to drop the session
    thread::sleep(Duration::from_millis(100));
    assert!(target.target.shutdown_gracefully(Duration::from_secs(2)));
}
