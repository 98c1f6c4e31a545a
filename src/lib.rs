//! A pure Rust iSCSI target implementation
//!
//! This library provides a reusable iSCSI target server that can be integrated
//! into storage applications, plus a small initiator used to drive it. Users
//! implement the `ScsiBlockDevice` trait to provide the actual storage backend
//! for each logical unit.
//!
//! The layers, bottom up:
//! - [`pdu`] and [`parser`]: the wire codec, one parser per opcode
//! - [`digest`], [`serial`], [`tsih`]: CRC32C, sequence number arithmetic and
//!   session handle allocation
//! - [`session`] and [`login`]: negotiation, connection phases and CmdSN ordering
//! - [`task`], [`task_set`], [`task_manager`], [`logical_unit`]: SAM task
//!   lifecycle and ordering per logical unit
//! - [`connection`] and [`target`]: the server
//! - [`client`], [`initiator`], [`sequence`], [`balancer`]: the initiator side
//!
//! # Example
//!
//! ```no_run
//! use iscsi_target::{IscsiTarget, ScsiBlockDevice, ScsiResult};
//!
//! struct MyStorage {
//!     data: Vec<u8>,
//! }
//!
//! impl ScsiBlockDevice for MyStorage {
//!     fn read(&self, lba: u64, buf: &mut [u8]) -> ScsiResult<()> {
//!         let offset = (lba * 512) as usize;
//!         buf.copy_from_slice(&self.data[offset..offset + buf.len()]);
//!         Ok(())
//!     }
//!
//!     fn write(&mut self, lba: u64, buf: &[u8]) -> ScsiResult<()> {
//!         let offset = (lba * 512) as usize;
//!         self.data[offset..offset + buf.len()].copy_from_slice(buf);
//!         Ok(())
//!     }
//!
//!     fn block_count(&self) -> u64 {
//!         (self.data.len() / 512) as u64
//!     }
//!
//!     fn block_size(&self) -> u32 {
//!         512
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = MyStorage { data: vec![0u8; 1024 * 1024] };
//! let target = IscsiTarget::builder()
//!     .bind_addr("0.0.0.0:3260")
//!     .target_name("iqn.2025-12.local:storage.disk1")
//!     .lun(storage)
//!     .build()?;
//! target.run()?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod balancer;
pub mod client;
pub mod connection;
pub mod digest;
pub mod error;
pub mod initiator;
pub mod logical_unit;
pub mod login;
pub mod parser;
pub mod pdu;
pub mod scsi;
pub mod sequence;
pub mod serial;
pub mod session;
pub mod storage;
pub mod target;
pub mod task;
pub mod task_manager;
pub mod task_set;
pub mod transport;
pub mod tsih;

pub use auth::{AuthStep, Authenticator, NoAuthentication};
pub use balancer::{RoundRobinBalancer, SingleConnectionBalancer, TaskBalancer};
pub use client::IscsiClient;
pub use digest::DigestType;
pub use error::{IscsiError, ProtocolError, ScsiResult};
pub use initiator::InitiatorSession;
pub use logical_unit::LogicalUnit;
pub use pdu::ProtocolDataUnit;
pub use scsi::ScsiBlockDevice;
pub use session::SessionParams;
pub use storage::MemoryDevice;
pub use target::{IscsiTarget, IscsiTargetBuilder};

/// Version of this library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
