// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The Reno control engine: a pure state-transition function over
//! congestion-control events and the per-phase window arithmetic.

use std::fmt;

use strum_macros::EnumIter;

use crate::cocoa::flow::FlowState;

/// Congestion-control phase of a flow.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumIter)]
pub enum CcPhase {
    /// Fresh flow, or any flow knocked back by a retransmission timeout.
    Start,

    /// Exponential window growth below the slow-start threshold.
    SlowStart,

    /// Additive increase above the slow-start threshold.
    AdditiveIncrease,

    /// Multiplicative decrease on a fresh triple duplicate ACK.
    MultiplicativeDecrease,

    /// Fast recovery while duplicates keep arriving.
    FastRecovery,

    /// Duplicate ACKs for an already-recovered loss; hold the window.
    Idle,
}

impl fmt::Display for CcPhase {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            CcPhase::Start => "START",
            CcPhase::SlowStart => "SLOW_START",
            CcPhase::AdditiveIncrease => "AI",
            CcPhase::MultiplicativeDecrease => "MD",
            CcPhase::FastRecovery => "FR",
            CcPhase::Idle => "IDLE",
        };
        write!(f, "{}", name)
    }
}

/// Apply the window arithmetic for entering (or re-entering) a phase.
///
/// Re-entry is how slow start and additive increase accumulate: each new ACK
/// lands in the same phase and runs the step again.
pub(crate) fn reno_control(st: &mut FlowState, phase: CcPhase) {
    match phase {
        CcPhase::Start => {
            st.cc_tmp_win = 1.0;
            st.cm_window = 1.0;
            st.cc_recovery_seq = st.max_sent;
            st.cc_ss_threshold /= 2.0;
        }
        CcPhase::SlowStart => {
            st.cc_tmp_win += 1.0;
            st.cm_window += 1.0;
        }
        CcPhase::AdditiveIncrease => {
            st.cm_window = st.cc_tmp_win;
            st.cm_window += 1.0 / st.cm_window;
            st.cc_tmp_win += 1.0 / st.cc_tmp_win;
        }
        CcPhase::MultiplicativeDecrease => {
            st.cc_recovery_seq = st.max_sent;
            st.cc_tmp_win = st.cm_window / 2.0;
            st.cc_ss_threshold = st.cc_tmp_win;
            st.cm_window = st.cc_tmp_win + st.dup_acks_val as f64;
        }
        CcPhase::FastRecovery => {
            st.cm_window = st.cc_tmp_win + st.dup_acks_val as f64;
        }
        CcPhase::Idle => {}
    }
}

/// Decide the phase transition for the acknowledgment just folded into the
/// flow counters. `None` means the counters matched no edge and the engine
/// is not invoked.
pub(crate) fn reno_transition(st: &FlowState) -> Option<CcPhase> {
    let new_ack = st.new_ack_val;
    let triple_dup = st.dup_acks_val == 3;
    let fresh_loss = st.max_ack > st.cc_recovery_seq;

    match st.cc_phase {
        CcPhase::Start => {
            if new_ack {
                return Some(CcPhase::SlowStart);
            }
            None
        }
        CcPhase::SlowStart | CcPhase::Idle => {
            if new_ack {
                if st.cm_window < st.cc_ss_threshold {
                    return Some(CcPhase::SlowStart);
                }
                return Some(CcPhase::AdditiveIncrease);
            }
            if st.cc_phase == CcPhase::SlowStart && triple_dup {
                if fresh_loss {
                    return Some(CcPhase::MultiplicativeDecrease);
                }
                return Some(CcPhase::Idle);
            }
            None
        }
        CcPhase::AdditiveIncrease => {
            if new_ack {
                return Some(CcPhase::AdditiveIncrease);
            }
            if triple_dup {
                if fresh_loss {
                    return Some(CcPhase::MultiplicativeDecrease);
                }
                return Some(CcPhase::Idle);
            }
            None
        }
        CcPhase::MultiplicativeDecrease | CcPhase::FastRecovery => {
            if new_ack {
                return Some(CcPhase::AdditiveIncrease);
            }
            if st.dup_acks_val > 0 {
                return Some(CcPhase::FastRecovery);
            }
            None
        }
    }
}
