//! Per-generation device capability descriptors.
//!
//! The encoder and the queue-side state policy never branch on a hardware generation directly;
//! everything generation specific is read from a [`DeviceCaps`] injected at construction time.
//! [`CapsRegistry`] maps generation names to descriptors and is populated by explicit
//! [`CapsRegistry::register`] calls.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::{EncodeError, GpuCommand};

/// Granularity at which in-flight work may be interrupted.
///
/// Variants are ordered from least to most fine-grained, so `min` picks the more restrictive mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PreemptionMode {
    Disabled,
    MidBatch,
    ThreadGroup,
    MidThread,
}

/// Layout of the preemption-control register written with LOAD_REGISTER_IMM.
///
/// The upper 16 bits are a write mask for the mode-select bits in the lower half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PreemptionRegister {
    pub mmio_offset: u32,
    pub mask: u32,
    pub mid_thread_value: u32,
    pub thread_group_value: u32,
    pub mid_batch_value: u32,
}

impl PreemptionRegister {
    pub const fn standard() -> Self {
        Self {
            mmio_offset: 0x2580,
            mask: ((1 << 1) | (1 << 2)) << 16,
            mid_thread_value: 0,
            thread_group_value: 1 << 1,
            mid_batch_value: 1 << 2,
        }
    }

    /// Register value selecting `mode`. `Disabled` shares the command-level (MidBatch) encoding.
    pub fn value_for(&self, mode: PreemptionMode) -> u32 {
        let select = match mode {
            PreemptionMode::MidThread => self.mid_thread_value,
            PreemptionMode::ThreadGroup => self.thread_group_value,
            PreemptionMode::MidBatch | PreemptionMode::Disabled => self.mid_batch_value,
        };
        self.mask | select
    }

    pub fn load_register_imm(&self, mode: PreemptionMode) -> GpuCommand {
        GpuCommand::LoadRegisterImm {
            register_offset: self.mmio_offset,
            data: self.value_for(mode),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapSizes {
    pub general_state: u32,
    pub instruction: u32,
    pub surface_state: u32,
    pub dynamic_state: u32,
}

impl Default for HeapSizes {
    fn default() -> Self {
        Self {
            general_state: 64 * 1024,
            instruction: 64 * 1024,
            surface_state: 64 * 1024,
            dynamic_state: 64 * 1024,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCaps {
    pub name: String,
    /// Width of GPU virtual addresses accepted by the command streamer.
    pub address_bits: u8,
    pub default_preemption_mode: PreemptionMode,
    pub supports_mid_thread: bool,
    pub preemption_register: PreemptionRegister,
    pub heap_sizes: HeapSizes,
    /// Size of the per-engine context save area used by MidThread preemption.
    pub csr_save_area_size: usize,
    /// The generation requires a stalling barrier before PIPELINE_SELECT.
    pub barrier_before_pipeline_select: bool,
    pub state_mocs: u32,
}

impl DeviceCaps {
    pub fn gen9() -> Self {
        Self {
            name: "gen9".to_owned(),
            address_bits: 48,
            default_preemption_mode: PreemptionMode::MidThread,
            supports_mid_thread: true,
            preemption_register: PreemptionRegister::standard(),
            heap_sizes: HeapSizes::default(),
            csr_save_area_size: 0x10_0000,
            barrier_before_pipeline_select: true,
            state_mocs: 2,
        }
    }

    pub fn gen12lp() -> Self {
        Self {
            name: "gen12lp".to_owned(),
            address_bits: 48,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            supports_mid_thread: true,
            preemption_register: PreemptionRegister::standard(),
            heap_sizes: HeapSizes::default(),
            csr_save_area_size: 0x20_0000,
            barrier_before_pipeline_select: false,
            state_mocs: 4,
        }
    }

    pub fn xe_hpg() -> Self {
        Self {
            name: "xe-hpg".to_owned(),
            address_bits: 48,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            supports_mid_thread: false,
            preemption_register: PreemptionRegister::standard(),
            heap_sizes: HeapSizes {
                surface_state: 128 * 1024,
                ..HeapSizes::default()
            },
            csr_save_area_size: 0,
            barrier_before_pipeline_select: false,
            state_mocs: 4,
        }
    }

    pub fn xe_hpc() -> Self {
        Self {
            name: "xe-hpc".to_owned(),
            address_bits: 57,
            default_preemption_mode: PreemptionMode::ThreadGroup,
            supports_mid_thread: true,
            preemption_register: PreemptionRegister::standard(),
            heap_sizes: HeapSizes {
                surface_state: 128 * 1024,
                dynamic_state: 128 * 1024,
                ..HeapSizes::default()
            },
            csr_save_area_size: 0x40_0000,
            barrier_before_pipeline_select: false,
            state_mocs: 6,
        }
    }

    /// Highest GPU address the command streamer can reach.
    pub fn max_address(&self) -> u64 {
        if self.address_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.address_bits) - 1
        }
    }

    pub fn check_address(&self, address: u64) -> Result<(), EncodeError> {
        if address > self.max_address() {
            return Err(EncodeError::UnsupportedAddressRange {
                address,
                address_bits: self.address_bits,
            });
        }
        Ok(())
    }

    /// Mode the hardware will actually run for a `requested` mode.
    pub fn clamp_preemption_mode(&self, requested: PreemptionMode) -> PreemptionMode {
        if requested == PreemptionMode::MidThread && !self.supports_mid_thread {
            PreemptionMode::ThreadGroup
        } else {
            requested
        }
    }
}

/// Generation name → descriptor map, built once at driver initialization.
#[derive(Clone, Debug, Default)]
pub struct CapsRegistry {
    entries: BTreeMap<String, DeviceCaps>,
}

impl CapsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every generation this crate ships descriptors for.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(DeviceCaps::gen9());
        registry.register(DeviceCaps::gen12lp());
        registry.register(DeviceCaps::xe_hpg());
        registry.register(DeviceCaps::xe_hpc());
        registry
    }

    /// Insert `caps` under its name, returning any descriptor it replaced.
    pub fn register(&mut self, caps: DeviceCaps) -> Option<DeviceCaps> {
        self.entries.insert(caps.name.clone(), caps)
    }

    pub fn get(&self, name: &str) -> Option<&DeviceCaps> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
