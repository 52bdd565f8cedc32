// Copyright (c) 2025 Warelay Contributors
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # warelay
//!
//! The outbound message relay core of a WhatsApp-compatible multi-device
//! client. Given a logical message addressed to a user or group, the relay
//! produces the per-device ciphertexts, sender-key distribution messages,
//! and device identity attestations that must go over the wire, while
//! keeping the Signal-style ratchet state in persistent storage correct.
//!
//! Transport framing, pairing, and the Signal curve math live outside this
//! crate; they are consumed through the [`transport::StanzaTransport`] and
//! [`signal::SignalRepository`] capabilities.

pub mod binary;
pub mod config;
pub mod error;
pub mod media;
pub mod proto;
pub mod relay;
pub mod session;
pub mod signal;
pub mod store;
pub mod transport;
pub mod types;
pub mod usync;
pub mod util;

pub use config::{RelayCollaborators, RelayConfig};
pub use error::{Error, Result};
pub use relay::RelayEngine;
pub use types::*;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
