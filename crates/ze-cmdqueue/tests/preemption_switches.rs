use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use ze_cmdqueue::{
    CommandList, CommandQueue, Device, DriverConfig, EngineGroup, ImmediateBackend,
    LinearAllocator, Operation, QueueDesc, SharedBackend,
};
use ze_gpu_cmd::{decode_all, DeviceCaps, GpuCommand, PreemptionMode};

const MODES: [PreemptionMode; 4] = [
    PreemptionMode::Disabled,
    PreemptionMode::MidBatch,
    PreemptionMode::ThreadGroup,
    PreemptionMode::MidThread,
];

fn mode() -> impl Strategy<Value = PreemptionMode> {
    prop::sample::select(MODES.to_vec())
}

struct Harness {
    device: Arc<Device>,
    backend: Arc<Mutex<ImmediateBackend>>,
    queue: CommandQueue,
}

impl Harness {
    fn new(config: DriverConfig) -> Self {
        let linear = Arc::new(LinearAllocator::new(0x1_0000_0000, 256 << 20));
        let device = Device::new(DeviceCaps::gen12lp(), config, linear).unwrap();
        let backend = Arc::new(Mutex::new(ImmediateBackend::new()));
        let shared: SharedBackend = backend.clone();
        let queue =
            CommandQueue::create(&device, EngineGroup::Compute, Some(shared), QueueDesc::default())
                .unwrap();
        Self {
            device,
            backend,
            queue,
        }
    }

    fn list(&self, mode: PreemptionMode) -> CommandList {
        let mut list = CommandList::create(&self.device, EngineGroup::Compute, Some(mode)).unwrap();
        list.append(Operation::Barrier { timestamp: None }).unwrap();
        list.close().unwrap();
        list
    }

    /// Every command the queue has submitted, in execution order.
    fn ring_trace(&self) -> Vec<GpuCommand> {
        let backend = self.backend.lock().unwrap();
        backend
            .submissions()
            .iter()
            .flat_map(|s| decode_all(&s.commands).unwrap())
            .collect()
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn only_differing_neighbours_switch_modes(
        batches in prop::collection::vec(prop::collection::vec(mode(), 1..5), 1..5)
    ) {
        let mut h = Harness::new(DriverConfig::default());
        let lists: Vec<CommandList> = MODES.iter().map(|&m| h.list(m)).collect();

        for batch in &batches {
            let refs: Vec<&CommandList> = batch.iter().map(|&m| &lists[m as usize]).collect();
            h.queue.execute_command_lists(&refs, None, &[]).unwrap();
        }

        let modes: Vec<PreemptionMode> = batches.concat();
        let register = h.device.caps().preemption_register;
        let mut current = h.device.caps().default_preemption_mode;
        let mut executed = 0usize;
        let mut switches_since_jump = 0usize;
        let mut switch_data = None;
        let (mut selects, mut sbas, mut sips) = (0, 0, 0);
        let mut previous: Option<GpuCommand> = None;

        for cmd in h.ring_trace() {
            match cmd {
                GpuCommand::PipelineSelect { .. } => selects += 1,
                GpuCommand::StateBaseAddress(_) => sbas += 1,
                GpuCommand::StateSip { .. } => sips += 1,
                GpuCommand::LoadRegisterImm { register_offset, data } => {
                    prop_assert_eq!(register_offset, register.mmio_offset);
                    prop_assert!(matches!(previous, Some(GpuCommand::PipeControl(_))));
                    switches_since_jump += 1;
                    switch_data = Some(data);
                }
                GpuCommand::BatchBufferStart { second_level: true, .. } => {
                    let next = modes[executed];
                    if next != current {
                        prop_assert_eq!(switches_since_jump, 1);
                        prop_assert_eq!(switch_data, Some(register.value_for(next)));
                    } else {
                        prop_assert_eq!(switches_since_jump, 0);
                    }
                    current = next;
                    executed += 1;
                    switches_since_jump = 0;
                    switch_data = None;
                }
                _ => {}
            }
            previous = Some(cmd);
        }

        prop_assert_eq!(executed, modes.len());
        prop_assert_eq!(selects, 1);
        prop_assert_eq!(sbas, 1);
        prop_assert_eq!(sips, usize::from(modes.contains(&PreemptionMode::MidThread)));
        prop_assert_eq!(h.queue.state().last_preemption_mode, current);
    }
}

#[test]
fn resubmitting_a_list_jumps_into_the_same_bytes() {
    let mut h = Harness::new(DriverConfig::default());
    let list = h.list(PreemptionMode::MidThread);
    let bytes = list.buffer().current().bytes().to_vec();

    h.queue.execute_command_lists(&[&list], None, &[]).unwrap();
    h.queue.execute_command_lists(&[&list], None, &[]).unwrap();

    let trace = h.ring_trace();
    let jumps = trace
        .iter()
        .filter(|cmd| {
            **cmd
                == GpuCommand::BatchBufferStart {
                    address: list.gpu_address(),
                    second_level: true,
                }
        })
        .count();
    assert_eq!(jumps, 2);
    assert_eq!(
        trace
            .iter()
            .filter(|cmd| matches!(cmd, GpuCommand::StateSip { .. }))
            .count(),
        1
    );
    assert_eq!(list.buffer().current().bytes(), &bytes[..]);
}

#[test]
fn forced_setup_repeats_across_batches() {
    let mut h = Harness::new(DriverConfig {
        force_mid_thread_setup_each_switch: true,
        ..DriverConfig::default()
    });
    let mid_thread = h.list(PreemptionMode::MidThread);
    let thread_group = h.list(PreemptionMode::ThreadGroup);

    h.queue
        .execute_command_lists(&[&mid_thread, &thread_group], None, &[])
        .unwrap();
    h.queue.execute_command_lists(&[&mid_thread], None, &[]).unwrap();

    let sips = h
        .ring_trace()
        .iter()
        .filter(|cmd| matches!(cmd, GpuCommand::StateSip { .. }))
        .count();
    assert_eq!(sips, 2);
}

#[test]
fn forced_mode_suppresses_switches() {
    let mut h = Harness::new(DriverConfig {
        force_preemption_mode: Some(PreemptionMode::ThreadGroup),
        ..DriverConfig::default()
    });
    let a = h.list(PreemptionMode::MidThread);
    let b = h.list(PreemptionMode::Disabled);
    h.queue.execute_command_lists(&[&a, &b, &a], None, &[]).unwrap();

    assert!(!h
        .ring_trace()
        .iter()
        .any(|cmd| matches!(cmd, GpuCommand::LoadRegisterImm { .. })));
}
