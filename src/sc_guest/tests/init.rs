/*
Copyright 2025  The Hyperlight Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use log::Level;
use sc_common::addr::{Pfn, PhysAddr, VirtAddr};
use sc_common::call::ScCall;
use sc_common::descriptor::{LayoutDescriptor, MAX_CPU, WireDescriptor};
use sc_guest::{InitState, PartialTransfer, ScError, ScGuestConfig};
use sc_testing::mock_kernel::{
    MODULES_END, MODULES_VADDR, PHYS_BASE, START_KERNEL_MAP, TASK_LAYOUT, USER_VRANGE_MAX,
};
use sc_testing::simplelogger::{LOGGER, SimpleLogger};
use sc_testing::{Decoded, MockKernel, new_guest, new_guest_with};

fn sent_layout(guest: &sc_testing::MockGuest) -> LayoutDescriptor {
    let calls = guest.hypervisor().calls_of(ScCall::InitLayout);
    assert_eq!(calls.len(), 1);
    match &calls[0].decoded {
        Decoded::Layout(d) => *d,
        other => panic!("expected a layout descriptor, got {other:?}"),
    }
}

#[test]
fn init_sends_layout_once() {
    let guest = new_guest();
    assert_eq!(guest.state(), InitState::Uninitialized);
    assert!(guest.layout_descriptor().is_none());

    guest.init().unwrap();
    assert_eq!(guest.state(), InitState::Ready);

    let calls = guest.hypervisor().calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].call, ScCall::InitLayout);
    assert_eq!(calls[0].len, LayoutDescriptor::WIRE_SIZE as u64);

    let d = sent_layout(&guest);
    assert_eq!(Some(&d), guest.layout_descriptor());
    assert_eq!(d.is_x32, 0);
    assert_eq!(d.total_npages, 0x2_0000);
    assert_eq!(d.kernel_text_start, PHYS_BASE);
    assert_eq!(d.vdso_start, 0x1c0_0000);
    assert_eq!(d.vdso_end, 0x1c0_2000);
    assert_eq!(d.zero_end - d.zero_start, 0x1000);
    assert_eq!(d.user_vrange_max, USER_VRANGE_MAX);
    assert_eq!(d.kernel_vrange_start, START_KERNEL_MAP);
    assert_eq!(d.kernel_vrange_end, MODULES_VADDR);
    assert_eq!(d.module_vrange_start, MODULES_VADDR);
    assert_eq!(d.module_vrange_end, MODULES_END);
    assert_eq!(d.pv.phys_base, PHYS_BASE);
    assert_eq!(d.pv.start_kernel_map, START_KERNEL_MAP);
    assert_eq!(d.pv.page_offset, guest.kernel().memory().page_offset());
    assert_eq!(d.erase_freed_page, 0);
}

#[test]
fn task_table_follows_possible_cpus() {
    let guest = new_guest();
    guest.init().unwrap();
    let d = sent_layout(&guest);

    assert_eq!(d.task.smp_cpu, 2);
    assert_eq!(d.task.percpu_tasks(), &[0x0200_0000, 0x0201_0000]);
    assert!(d.task.percpu_task[2..].iter().all(|&slot| slot == 0));
    assert_eq!(d.task.task_size, TASK_LAYOUT.task_size);
    assert_eq!(d.task.task2pid_off, TASK_LAYOUT.pid_offset);
    assert_eq!(d.task.task2viewid_off, TASK_LAYOUT.view_id_offset);
    assert_eq!(d.task.task2comm_off, TASK_LAYOUT.comm_offset);
    assert_eq!(d.task.task2thread_off, TASK_LAYOUT.thread_offset);
}

#[test]
fn sparse_cpu_ids_leave_holes() {
    let kernel = MockKernel::new();
    kernel.set_possible_cpus([0, 3]);
    let guest = new_guest_with(kernel, ScGuestConfig::default());
    guest.init().unwrap();
    let d = sent_layout(&guest);

    assert_eq!(d.task.smp_cpu, 4);
    assert_eq!(d.task.percpu_task[0], 0x0200_0000);
    assert_eq!(d.task.percpu_task[1], 0);
    assert_eq!(d.task.percpu_task[2], 0);
    assert_eq!(d.task.percpu_task[3], 0x0203_0000);
}

#[test]
fn full_task_table_is_accepted() {
    let kernel = MockKernel::new();
    kernel.set_possible_cpus(0..MAX_CPU);
    let guest = new_guest_with(kernel, ScGuestConfig::default());
    guest.init().unwrap();
    let d = sent_layout(&guest);

    assert_eq!(d.task.smp_cpu as usize, MAX_CPU);
    assert_eq!(d.task.percpu_task[MAX_CPU - 1], 0x0200_0000 + 31 * 0x1_0000);
}

#[test]
fn too_many_cpus_fails_without_a_call() {
    let kernel = MockKernel::new();
    kernel.set_possible_cpus(0..MAX_CPU + 1);
    let guest = new_guest_with(kernel, ScGuestConfig::default());

    let err = guest.init().unwrap_err();
    assert_eq!(
        err,
        ScError::TooManyCpus {
            cpu: MAX_CPU,
            max: MAX_CPU
        }
    );
    assert_eq!(guest.state(), InitState::Failed);
    assert_eq!(guest.hypervisor().num_calls(), 0);
    assert!(guest.layout_descriptor().is_none());
}

#[test]
fn no_possible_cpus_is_invalid() {
    let kernel = MockKernel::new();
    kernel.set_possible_cpus(std::iter::empty());
    let guest = new_guest_with(kernel, ScGuestConfig::default());

    assert!(matches!(guest.init(), Err(ScError::InvalidLayout(_))));
    assert_eq!(guest.hypervisor().num_calls(), 0);
}

#[test]
fn partial_vdso_page_is_invalid() {
    let mut kernel = MockKernel::new();
    kernel.layout_mut().vdso = PhysAddr::new(0x1c0_0000)..PhysAddr::new(0x1c0_0800);
    let guest = new_guest_with(kernel, ScGuestConfig::default());

    assert_eq!(
        guest.init(),
        Err(ScError::InvalidLayout(
            "vdso size is not a whole number of pages"
        ))
    );
    assert_eq!(guest.state(), InitState::Failed);
    assert_eq!(guest.hypervisor().num_calls(), 0);
}

#[test]
fn inverted_range_is_invalid() {
    let mut kernel = MockKernel::new();
    kernel.layout_mut().module_vrange = VirtAddr::new(MODULES_END)..VirtAddr::new(MODULES_VADDR);
    let guest = new_guest_with(kernel, ScGuestConfig::default());

    assert!(matches!(guest.init(), Err(ScError::InvalidLayout(_))));
}

#[test]
fn erase_flag_comes_from_config() {
    let mut config = ScGuestConfig::default();
    config.set_erase_freed_pages(true);
    let guest = new_guest_with(MockKernel::new(), config);
    guest.init().unwrap();

    assert_eq!(sent_layout(&guest).erase_freed_page, 1);
}

#[test]
fn init_runs_only_once() {
    let guest = new_guest();
    guest.init().unwrap();

    assert_eq!(
        guest.init(),
        Err(ScError::AlreadyInitialized(InitState::Ready))
    );
    assert_eq!(guest.hypervisor().num_calls(), 1);
    assert_eq!(guest.state(), InitState::Ready);
}

#[test]
fn uninitialized_guest_fails_closed() {
    let guest = new_guest();
    let not_ready = ScError::NotReady(InitState::Uninitialized);

    assert_eq!(guest.create_view(0), Err(not_ready.clone()));
    assert_eq!(guest.free_pages(Pfn::new(0x10), 1), Err(not_ready.clone()));
    assert_eq!(guest.set_shared_page(Pfn::new(0x10)), Err(not_ready.clone()));
    assert_eq!(
        guest.data_set(VirtAddr::new(0x10_0000), 0, 8),
        Err(not_ready.clone())
    );
    assert_eq!(
        guest.clear_user(VirtAddr::new(0x10_0000), 0x10),
        Err(PartialTransfer {
            remaining: 0x10,
            cause: not_ready
        })
    );
    assert_eq!(guest.hypervisor().num_calls(), 0);
}

#[test]
fn failed_init_disables_the_subsystem() {
    let guest = new_guest();
    guest.hypervisor().fail_nth(ScCall::InitLayout, 0, -1000);

    let err = guest.init().unwrap_err();
    assert_eq!(
        err,
        ScError::Hypercall {
            call: ScCall::InitLayout,
            status: -1000
        }
    );
    assert_eq!(err.status(), Some(-1000));
    assert_eq!(guest.state(), InitState::Failed);

    let not_ready = ScError::NotReady(InitState::Failed);
    assert_eq!(guest.create_view(3), Err(not_ready.clone()));
    assert_eq!(
        guest.data_move(VirtAddr::new(0x10_0000), VirtAddr::new(0x20_0000), 4),
        Err(not_ready.clone())
    );
    assert_eq!(
        guest.data_add(VirtAddr::new(0x10_0000), 1),
        Err(not_ready.clone())
    );
    assert_eq!(
        guest.data_copy(VirtAddr::new(0x10_0000), VirtAddr::new(0x20_0000), 10),
        Err(PartialTransfer {
            remaining: 10,
            cause: not_ready
        })
    );
    assert_eq!(
        guest.init(),
        Err(ScError::AlreadyInitialized(InitState::Failed))
    );
    // only the failed init reached the hypervisor
    assert_eq!(guest.hypervisor().num_calls(), 1);
}

#[test]
fn init_logs_outcome() {
    SimpleLogger::initialize_test_logger();

    let guest = new_guest();
    guest.init().unwrap();
    let calls = LOGGER.calls_for_current_thread();
    assert!(calls
        .iter()
        .any(|c| c.level == Level::Debug && c.args.starts_with("layout descriptor:")));
    assert!(calls
        .iter()
        .any(|c| c.level == Level::Info && c.args == "secure container support enabled"));

    let failing = new_guest();
    failing.hypervisor().fail_nth(ScCall::InitLayout, 0, -5);
    failing.init().unwrap_err();
    let calls = LOGGER.calls_for_current_thread();
    let errors: Vec<_> = calls.iter().filter(|c| c.level == Level::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(
        errors[0].args,
        "secure container init failed: InitLayout hypercall failed with status -5"
    );
    assert!(errors[0].target.starts_with("sc_guest"));
}

#[test]
fn layout_dump_can_be_turned_off() {
    SimpleLogger::initialize_test_logger();

    let mut config = ScGuestConfig::default();
    config.set_dump_layout(false);
    let guest = new_guest_with(MockKernel::new(), config);
    guest.init().unwrap();

    LOGGER.test_log_records(|calls| {
        assert!(!calls.iter().any(|c| c.args.starts_with("layout descriptor:")));
    });
}
