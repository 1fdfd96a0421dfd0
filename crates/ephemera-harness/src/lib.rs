//! Deterministic simulation harness for ephemeral key lifecycle testing.
//!
//! In-memory implementations of every collaborator the core needs, backed by
//! one shared [`SimServer`], so whole multi-device scenarios run inside a
//! single test process with a virtual clock and seeded randomness.
//!
//! # Components
//!
//! - [`SimEnv`]: Virtual clock and seeded RNG
//! - [`SimServer`]: Merkle clock, identity keys, statement and box storage
//! - [`SimDevice`]: Session, keyring, API, directory and merkle client for one
//!   device, plus its key stores
//! - [`ChaoticApi`]: Fault injection around any [`EkApi`](ephemera_core::EkApi)
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//!
//! use ephemera_core::{DeviceId, EkConfig, EkLib, StalenessPolicy, Uid};
//! use ephemera_harness::{SimEnv, SimServer};
//!
//! let policy = StalenessPolicy::new(Duration::from_secs(7 * 24 * 60 * 60));
//! let server = SimServer::new(policy);
//! let device = server.add_device(&Uid::new("alice"), &DeviceId::new("laptop"));
//! let lib = EkLib::new(device.context(), SimEnv::with_seed(1), EkConfig::new(policy));
//! # let _ = lib;
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod chaotic;
pub mod sim_device;
pub mod sim_env;
pub mod sim_server;
pub mod stores;

pub use chaotic::ChaoticApi;
pub use sim_device::SimDevice;
pub use sim_env::{SimEnv, SimInstant};
pub use sim_server::{SIM_EPOCH, ServerCounters, SimServer};
pub use stores::{MemoryDeviceEkStorage, MemoryTeamEkBoxStorage, MemoryUserEkBoxStorage};
