//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use fabric_utils::{SwitchId, UnboundedSender};

use crate::error::SouthboundError;
use crate::packet::Payload;
use crate::policy::{Action, Policy};
use crate::tasks::messages::output::SouthboundMsg;

// Primitives provided by the controller runtime that talks to the switches.
pub trait Southbound: Send {
    // Emits a single packet from `switch`, applying `actions` to it.
    fn send_packet(
        &mut self,
        switch: SwitchId,
        payload: Payload,
        actions: Vec<Action>,
    ) -> Result<(), SouthboundError>;

    // Replaces the forwarding policy of every switch.
    fn install_policy(&mut self, policy: &Policy)
    -> Result<(), SouthboundError>;
}

// Southbound that forwards every request to a channel, typically drained by
// a writer task.
#[derive(Debug)]
pub struct ChannelSouthbound {
    tx: UnboundedSender<SouthboundMsg>,
}

// ===== impl ChannelSouthbound =====

impl ChannelSouthbound {
    pub fn new(tx: UnboundedSender<SouthboundMsg>) -> ChannelSouthbound {
        ChannelSouthbound { tx }
    }

    fn send(&self, msg: SouthboundMsg) -> Result<(), SouthboundError> {
        self.tx
            .send(msg)
            .map_err(|_| SouthboundError::ChannelClosed)
    }
}

impl Southbound for ChannelSouthbound {
    fn send_packet(
        &mut self,
        switch: SwitchId,
        payload: Payload,
        actions: Vec<Action>,
    ) -> Result<(), SouthboundError> {
        self.send(SouthboundMsg::PacketOut {
            switch,
            payload,
            actions,
        })
    }

    fn install_policy(
        &mut self,
        policy: &Policy,
    ) -> Result<(), SouthboundError> {
        self.send(SouthboundMsg::InstallPolicy {
            policy: policy.clone(),
        })
    }
}

// ===== global functions =====

// Sends a packet, logging any failure. Packet-outs are best-effort.
pub(crate) fn send_packet(
    southbound: &mut impl Southbound,
    switch: SwitchId,
    payload: Payload,
    actions: Vec<Action>,
) {
    if let Err(error) = southbound.send_packet(switch, payload, actions) {
        crate::error::Error::from(error).log();
    }
}
