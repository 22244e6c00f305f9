//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use demand_vm::config::{VmConfig, PAGE_SIZE};
use demand_vm::machine::device::{BlockDevice, DeviceError, MemDevice};
use demand_vm::machine::PhysicalMemory;
use demand_vm::vm::{AddressSpace, Permissions, VmSystem};
use demand_vm::Vaddr;

/// 1MB of RAM, kernel image in the first 64KB
pub const RAM_SIZE: u32 = 1024 * 1024;
pub const KERNEL_END: u32 = 0x1_0000;

/// Base of the test program's text segment
pub const TEXT: Vaddr = 0x40_0000;
/// Base of the test program's data segment
pub const DATA: Vaddr = 0x50_0000;

pub fn mem_swap(_name: &str) -> Result<Arc<dyn BlockDevice>, DeviceError> {
    Ok(Arc::new(MemDevice::new()))
}

/// A bootstrapped system with an in-memory swap file
pub fn boot(config: VmConfig) -> VmSystem {
    let vm = VmSystem::new(config, PhysicalMemory::new(RAM_SIZE, KERNEL_END));
    vm.vm_bootstrap(mem_swap).expect("bootstrap failed");
    vm
}

/// Image whose page `i` is filled with byte `i + 1`
pub fn paged_image(npages: usize) -> Arc<MemDevice> {
    let bytes = (0..npages * PAGE_SIZE)
        .map(|i| (i / PAGE_SIZE + 1) as u8)
        .collect();
    Arc::new(MemDevice::from_bytes(bytes))
}

/// Address space with `text_pages` read-only text pages and `data_pages`
/// writable data pages, both backed by a paged image, plus a stack
pub fn program(vm: &VmSystem, text_pages: usize, data_pages: usize) -> AddressSpace {
    let aspace = vm.as_create();
    vm.as_define_region(
        &aspace,
        TEXT,
        0,
        text_pages * PAGE_SIZE,
        Permissions::READ | Permissions::EXECUTE,
    )
    .expect("text region");
    if data_pages > 0 {
        vm.as_define_region(
            &aspace,
            DATA,
            0,
            data_pages * PAGE_SIZE,
            Permissions::READ | Permissions::WRITE,
        )
        .expect("data region");
    }
    vm.as_prepare_load(&aspace).expect("prepare_load");
    vm.as_complete_load(&aspace, paged_image(text_pages.max(data_pages)))
        .expect("complete_load");
    vm.as_define_stack(&aspace).expect("define_stack");
    aspace
}

/// Physical page currently mapped for `vaddr` by the TLB
pub fn mapped_frame(vm: &VmSystem, vaddr: Vaddr) -> Option<u32> {
    vm.tlb().translate(vaddr).map(|(paddr, _)| paddr & !(PAGE_SIZE as u32 - 1))
}
