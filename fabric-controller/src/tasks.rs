//
// Copyright (c) The Fabric Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv4Addr;
use std::time::Duration;

use fabric_utils::UnboundedSender;
use fabric_utils::task::TimeoutTask;

//
// Controller tasks diagram:
//
//                           +--------------+
//                           |  southbound  |
//                           +--------------+
//                                 | ^
//                 event_rx (1x)   | |   (1x) southbound
//                                 V |
//                           +--------------+
//      update_timeout (1x) ->|              |
//  resolution_timeout (Nx) ->|    master    |
//                           |              |
//                           +--------------+
//

// Controller inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Input messages (child task -> main task).
    pub mod input {
        use std::collections::BTreeSet;
        use std::net::Ipv4Addr;

        use bytes::Bytes;
        use fabric_utils::{PortId, SwitchId};

        use super::*;
        use crate::packet::FrameMeta;

        // Events reported by the southbound runtime.
        #[derive(Clone, Debug, Deserialize, Serialize)]
        #[serde(tag = "type", rename_all = "kebab-case")]
        pub enum SouthboundEvent {
            SwitchUp {
                switch: SwitchId,
                ports: BTreeSet<PortId>,
            },
            SwitchDown {
                switch: SwitchId,
            },
            PortUp {
                switch: SwitchId,
                port: PortId,
            },
            PortDown {
                switch: SwitchId,
                port: PortId,
            },
            PacketIn {
                frame: FrameMeta,
                #[serde(default)]
                payload: Bytes,
            },
        }

        #[derive(Clone, Debug, Deserialize, Serialize)]
        pub enum TimerMsg {
            UpdateTimeout,
            ResolutionTimeout { target: Ipv4Addr, generation: u64 },
        }
    }

    // Output messages (main task -> southbound runtime).
    pub mod output {
        use fabric_utils::SwitchId;

        use super::*;
        use crate::packet::Payload;
        use crate::policy::{Action, Policy};

        #[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
        #[serde(tag = "type", rename_all = "kebab-case")]
        pub enum SouthboundMsg {
            PacketOut {
                switch: SwitchId,
                payload: Payload,
                actions: Vec<Action>,
            },
            InstallPolicy {
                policy: Policy,
            },
        }
    }
}

// ===== global functions =====

// Debounce timer of the policy update scheduler.
pub(crate) fn update_timeout(
    delay: Duration,
    timer_tx: &UnboundedSender<messages::input::TimerMsg>,
) -> TimeoutTask {
    let timer_tx = timer_tx.clone();
    TimeoutTask::new(delay, move || async move {
        let _ = timer_tx.send(messages::input::TimerMsg::UpdateTimeout);
    })
}

// Expiry of an outstanding address resolution.
pub(crate) fn resolution_timeout(
    target: Ipv4Addr,
    generation: u64,
    timeout: Duration,
    timer_tx: &UnboundedSender<messages::input::TimerMsg>,
) -> TimeoutTask {
    let timer_tx = timer_tx.clone();
    TimeoutTask::new(timeout, move || async move {
        let msg = messages::input::TimerMsg::ResolutionTimeout {
            target,
            generation,
        };
        let _ = timer_tx.send(msg);
    })
}
