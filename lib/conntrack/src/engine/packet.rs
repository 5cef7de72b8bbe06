// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Packets as they travel through the hooks.

use super::conn::Conn;
use super::conn::CtInfo;
use crate::api::Direction;
use std::sync::Arc;

/// The connection a packet has been tied to.
#[derive(Clone, Debug)]
pub struct CtAttach {
    pub conn: Arc<Conn>,
    pub info: CtInfo,
    /// Which of the connection's tuples the packet matched.
    pub dir: Direction,
}

/// An IPv4 packet, plus whatever the engine has learned about it.
///
/// The attachment lives as long as the packet does, so a connection
/// referenced by an in-flight packet can't be freed under it even if
/// the table lets go.
#[derive(Debug, Default)]
pub struct Packet {
    data: Vec<u8>,
    ct: Option<CtAttach>,
    gso: bool,
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data, ct: None, gso: false }
    }

    /// Mark the packet as one the stack will segment itself, so it is
    /// never refragmented.
    pub fn with_gso(mut self) -> Self {
        self.gso = true;
        self
    }

    pub fn is_gso(&self) -> bool {
        self.gso
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn ct(&self) -> Option<&CtAttach> {
        self.ct.as_ref()
    }

    pub fn attach(&mut self, conn: Arc<Conn>, info: CtInfo, dir: Direction) {
        self.ct = Some(CtAttach { conn, info, dir });
    }

    pub fn detach(&mut self) -> Option<CtAttach> {
        self.ct.take()
    }
}
