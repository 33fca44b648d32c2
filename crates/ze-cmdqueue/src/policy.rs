//! State-transition policy.
//!
//! Pure decision logic: given what the queue has already programmed and the preemption mode
//! the next list needs, decide which setup commands go in front of that list's jump. Nothing
//! here touches a command buffer; the queue encodes [`TransitionDecision::commands`].

use ze_gpu_cmd::{
    CmdOpcode, DeviceCaps, GpuCommand, PipeControl, Pipeline, PreemptionMode, StateBaseAddress,
};

use crate::list::EngineGroup;

/// Hardware state a queue has programmed, as of the end of its last submission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueState {
    pub last_preemption_mode: PreemptionMode,
    pub state_base_address_programmed: bool,
    pub pipeline_selected: bool,
    pub mid_thread_setup_sent: bool,
}

impl QueueState {
    /// A fresh context runs in `initial_mode` with nothing else programmed.
    pub fn new(initial_mode: PreemptionMode) -> Self {
        Self {
            last_preemption_mode: initial_mode,
            state_base_address_programmed: false,
            pipeline_selected: false,
            mid_thread_setup_sent: false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreemptionSwitch {
    pub from: PreemptionMode,
    pub to: PreemptionMode,
    pub register_offset: u32,
    pub register_value: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MidThreadSetup {
    pub csr_base_address: u64,
    pub sip_address: u64,
}

/// Setup to emit before one list's jump.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransitionDecision {
    pub pipeline_select: bool,
    pub state_base_address: Option<StateBaseAddress>,
    pub mid_thread_setup: Option<MidThreadSetup>,
    pub preemption_switch: Option<PreemptionSwitch>,
}

impl TransitionDecision {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Commands in emission order.
    pub fn commands(&self, caps: &DeviceCaps) -> Vec<GpuCommand> {
        let mut cmds = Vec::new();
        if self.pipeline_select {
            if caps.barrier_before_pipeline_select {
                cmds.push(GpuCommand::PipeControl(PipeControl::stall()));
            }
            cmds.push(GpuCommand::PipelineSelect {
                pipeline: Pipeline::Gpgpu,
            });
        }
        if let Some(sba) = self.state_base_address {
            cmds.push(GpuCommand::StateBaseAddress(sba));
        }
        if let Some(setup) = self.mid_thread_setup {
            cmds.push(GpuCommand::GpgpuCsrBaseAddress {
                address: setup.csr_base_address,
            });
            cmds.push(GpuCommand::StateSip {
                sip_address: setup.sip_address,
            });
        }
        if let Some(switch) = self.preemption_switch {
            cmds.push(GpuCommand::PipeControl(PipeControl::stall()));
            cmds.push(GpuCommand::LoadRegisterImm {
                register_offset: switch.register_offset,
                data: switch.register_value,
            });
        }
        cmds
    }

    pub fn size_bytes(&self, caps: &DeviceCaps) -> usize {
        self.commands(caps).iter().map(GpuCommand::size_bytes).sum()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PolicyOptions {
    pub force_mid_thread_setup_each_switch: bool,
}

/// Everything the policy needs to know about one queue's environment.
#[derive(Clone, Copy, Debug)]
pub struct TransitionPolicy<'a> {
    pub caps: &'a DeviceCaps,
    pub engine: EngineGroup,
    pub options: PolicyOptions,
    pub state_base_address: StateBaseAddress,
    /// Context save area; `None` when the queue cannot run mid-thread preemption.
    pub csr_base_address: Option<u64>,
    pub sip_address: u64,
}

impl TransitionPolicy<'_> {
    pub fn decide(&self, state: &QueueState, next_mode: PreemptionMode) -> TransitionDecision {
        let mut decision = TransitionDecision::default();
        if self.engine == EngineGroup::Copy {
            return decision;
        }

        decision.pipeline_select = !state.pipeline_selected;
        if !state.state_base_address_programmed {
            decision.state_base_address = Some(self.state_base_address);
        }

        let switching = next_mode != state.last_preemption_mode;
        if next_mode == PreemptionMode::MidThread {
            let repeat = switching && self.options.force_mid_thread_setup_each_switch;
            if !state.mid_thread_setup_sent || repeat {
                decision.mid_thread_setup = self.csr_base_address.map(|csr_base_address| {
                    MidThreadSetup {
                        csr_base_address,
                        sip_address: self.sip_address,
                    }
                });
            }
        }
        if switching {
            let register = &self.caps.preemption_register;
            decision.preemption_switch = Some(PreemptionSwitch {
                from: state.last_preemption_mode,
                to: next_mode,
                register_offset: register.mmio_offset,
                register_value: register.value_for(next_mode),
            });
        }
        decision
    }

    /// Fold `decision` into `state`.
    pub fn apply(&self, state: &mut QueueState, decision: &TransitionDecision) {
        state.pipeline_selected |= decision.pipeline_select;
        state.state_base_address_programmed |= decision.state_base_address.is_some();
        state.mid_thread_setup_sent |= decision.mid_thread_setup.is_some();
        if let Some(switch) = decision.preemption_switch {
            state.last_preemption_mode = switch.to;
        }
    }

    /// Decide transitions for a whole batch, each list compared against the one before it.
    /// Returns the decisions and the state the batch leaves behind; `state` is not modified.
    pub fn plan(
        &self,
        state: &QueueState,
        modes: impl IntoIterator<Item = PreemptionMode>,
    ) -> (Vec<TransitionDecision>, QueueState) {
        let mut next = *state;
        let decisions = modes
            .into_iter()
            .map(|mode| {
                let decision = self.decide(&next, mode);
                self.apply(&mut next, &decision);
                decision
            })
            .collect();
        (decisions, next)
    }

    /// Largest setup any single list can need beyond the batch-wide one-time states.
    pub fn worst_case_per_list_size(&self) -> usize {
        if self.engine == EngineGroup::Copy {
            return 0;
        }
        CmdOpcode::GpgpuCsrBaseAddress.packet_size_bytes()
            + CmdOpcode::StateSip.packet_size_bytes()
            + CmdOpcode::PipeControl.packet_size_bytes()
            + CmdOpcode::LoadRegisterImm.packet_size_bytes()
    }

    /// Largest one-time setup (pipeline select and state base address) a batch can need.
    pub fn worst_case_prologue_size(&self) -> usize {
        if self.engine == EngineGroup::Copy {
            return 0;
        }
        let barrier = if self.caps.barrier_before_pipeline_select {
            CmdOpcode::PipeControl.packet_size_bytes()
        } else {
            0
        };
        barrier
            + CmdOpcode::PipelineSelect.packet_size_bytes()
            + CmdOpcode::StateBaseAddress.packet_size_bytes()
    }
}
