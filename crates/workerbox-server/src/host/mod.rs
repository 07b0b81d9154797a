// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker host strategies.
//!
//! - [`ProcessHost`]: one child process per unit, reached over loopback HTTP
//! - [`EmbeddedHost`]: units as tasks inside this process, no network hop
//! - [`MockHost`]: counters and simulated crashes for tests
//!
//! [`PersistenceStorage`] gives in-process units a storage area in the
//! server database.

pub mod embedded;
pub mod mock;
pub mod process;
pub mod storage;
pub mod traits;

pub use embedded::EmbeddedHost;
pub use mock::MockHost;
pub use process::{ProcessHost, ProcessHostConfig};
pub use storage::PersistenceStorage;
pub use traits::*;
