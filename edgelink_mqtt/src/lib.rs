// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![warn(missing_docs)]

//! MQTT v5 session client providing a managed work queue, transparent
//! reconnection, and ordered acknowledgement over a pluggable transport.

pub use crate::connection_settings::{
    ConnectionSettings, ConnectionSettingsBuilder, ConnectionSettingsBuilderError,
};

mod connection_settings;
pub mod control_packet;
pub mod error;
pub mod interface;
pub mod mock;
pub mod session;
pub mod topic;

#[macro_use]
extern crate derive_builder;
