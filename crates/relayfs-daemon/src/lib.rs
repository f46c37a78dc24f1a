// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! RelayFS client-core daemon
//!
//! The user-space half of the RelayFS protocol: a pump that attaches to the
//! request device, runs the control-plane handshake, and services upcalls
//! against a pluggable handler. The built-in [`MemServicer`] answers the
//! full operation set from an in-memory tree.

pub mod logging;
pub mod pump;
pub mod servicer;

pub use pump::{ClientCore, PumpError};
pub use servicer::{Downcall, MemServicer, UpcallHandler, SUPPORTED_FEATURES};
