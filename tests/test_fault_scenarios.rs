//! End-to-end fault scenarios
//!
//! Drive the fault handler the way the trap path does and check frames,
//! swap, TLB and counters afterwards.

mod common;

use std::sync::Arc;

use common::*;
use demand_vm::config::{VmConfig, NUM_FREEFRAMES_TEST, PAGE_SIZE, USERSTACK};
use demand_vm::kern::error::{KernelPanic, VmError};
use demand_vm::machine::MemDevice;
use demand_vm::vm::pt::Residency;
use demand_vm::vm::vm_fault::{VM_FAULT_READ, VM_FAULT_WRITE};
use demand_vm::vm::{FrameState, Permissions, VmStat};

// ════════════════════════════════════════════════════════════
// Demand Loading
// ════════════════════════════════════════════════════════════

#[test]
fn test_first_touch_loads_from_image() {
    let vm = boot(VmConfig::new().with_swap_pages(16));
    let aspace = program(&vm, 3, 0);
    let free_before = vm.coremap().free_count();

    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT + 0x10).unwrap();

    let stats = vm.stats().snapshot();
    assert_eq!(stats.get(VmStat::PageFaultElf), 1);
    assert_eq!(stats.get(VmStat::PageFaultDisk), 1);
    assert_eq!(stats.get(VmStat::PageFaultSwap), 0);
    assert_eq!(stats.get(VmStat::SwapFileWrite), 0);
    assert_eq!(vm.coremap().free_count(), free_before - 1);

    // the page is now resident: a refault only reloads the TLB
    vm.as_activate(Some(&aspace));
    let before = vm.stats().snapshot();
    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT + 0x20).unwrap();
    let delta = vm.stats().snapshot().since(&before);
    assert_eq!(delta.get(VmStat::TlbReload), 1);
    assert_eq!(delta.get(VmStat::PageFaultDisk), 0);
    assert_eq!(vm.coremap().free_count(), free_before - 1);

    assert!(vm.stats().snapshot().is_consistent());
}

#[test]
fn test_partial_pages_at_segment_edges() {
    let vm = boot(VmConfig::new().with_swap_pages(16));
    let aspace = vm.as_create();
    // 10000 bytes at image offset 100, mapped at a matching misalignment
    vm.as_define_region(&aspace, TEXT + 100, 100, 10000, Permissions::READ)
        .unwrap();
    let image: Vec<u8> = (0..20000).map(|i| (i % 256) as u8).collect();
    vm.as_complete_load(&aspace, Arc::new(MemDevice::from_bytes(image)))
        .unwrap();

    let mut page = [0u8; PAGE_SIZE];

    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT).unwrap();
    vm.ram().read_page(mapped_frame(&vm, TEXT).unwrap(), &mut page);
    assert!(page[..100].iter().all(|&b| b == 0));
    assert_eq!(page[100], 100);
    assert_eq!(page[PAGE_SIZE - 1], ((PAGE_SIZE - 1) % 256) as u8);

    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT + 0x2000).unwrap();
    vm.ram().read_page(mapped_frame(&vm, TEXT + 0x2000).unwrap(), &mut page);
    // 1908 bytes from offset 8192, the rest of the frame is zero
    assert_eq!(page[0], (8192 % 256) as u8);
    assert_eq!(page[1907], ((8192 + 1907) % 256) as u8);
    assert!(page[1908..].iter().all(|&b| b == 0));
}

#[test]
fn test_stack_pages_are_zero_filled() {
    let vm = boot(VmConfig::new().with_swap_pages(16));
    let aspace = program(&vm, 1, 0);

    vm.vm_fault(Some(&aspace), VM_FAULT_WRITE, USERSTACK - 1).unwrap();
    let paddr = mapped_frame(&vm, USERSTACK - 1).unwrap();
    let mut page = [0xaau8; PAGE_SIZE];
    vm.ram().read_page(paddr, &mut page);
    assert!(page.iter().all(|&b| b == 0));
    assert!(vm.coremap().check_state(paddr, FrameState::Clean));
    assert_eq!(vm.stats().get(VmStat::PageFaultZero), 1);

    // below the stack and above the text: not mapped
    assert_eq!(
        vm.vm_fault(Some(&aspace), VM_FAULT_READ, USERSTACK - 19 * PAGE_SIZE as u32),
        Err(VmError::Fault)
    );
}

#[test]
fn test_write_permission_follows_segment() {
    let vm = boot(VmConfig::new().with_swap_pages(16));
    let aspace = program(&vm, 1, 1);

    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT).unwrap();
    vm.vm_fault(Some(&aspace), VM_FAULT_WRITE, DATA).unwrap();
    assert_eq!(vm.tlb().translate(TEXT).map(|(_, w)| w), Some(false));
    assert_eq!(vm.tlb().translate(DATA).map(|(_, w)| w), Some(true));
}

// ════════════════════════════════════════════════════════════
// Memory Pressure
// ════════════════════════════════════════════════════════════

#[test]
fn test_single_frame_eviction() {
    let vm = boot(VmConfig::new().with_swap_pages(16).with_free_frame_limit(1));
    let aspace = program(&vm, 2, 0);

    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT).unwrap();
    let old = mapped_frame(&vm, TEXT).unwrap();
    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT + 0x1000).unwrap();

    assert_eq!(vm.stats().get(VmStat::SwapFileWrite), 1);
    assert_eq!(vm.swap().used(), 1);
    assert_eq!(vm.swap().slot_of(aspace.id(), TEXT), Some(0));
    assert_eq!(aspace.residency(TEXT), Some(Residency::Swapped));
    assert_ne!(mapped_frame(&vm, TEXT), Some(old));
    // the frame was reused for the new page
    assert_eq!(mapped_frame(&vm, TEXT + 0x1000), Some(old));
    assert!(vm.stats().snapshot().is_consistent());
}

#[test]
fn test_dirty_data_survives_swap() {
    let vm = boot(
        VmConfig::new()
            .with_swap_pages(64)
            .with_free_frame_limit(NUM_FREEFRAMES_TEST),
    );
    let pages = 40;
    let aspace = program(&vm, 1, pages);

    // stamp every data page with its own number
    for i in 0..pages as u32 {
        let vaddr = DATA + i * PAGE_SIZE as u32;
        vm.vm_fault(Some(&aspace), VM_FAULT_WRITE, vaddr).unwrap();
        let paddr = mapped_frame(&vm, vaddr).unwrap();
        vm.ram().write_bytes(paddr + 8, &i.to_le_bytes());
    }
    assert!(vm.stats().get(VmStat::SwapFileWrite) >= (pages - NUM_FREEFRAMES_TEST) as u64);

    // read them all back, in reverse to force more traffic
    vm.as_activate(Some(&aspace));
    for i in (0..pages as u32).rev() {
        let vaddr = DATA + i * PAGE_SIZE as u32;
        vm.vm_fault(Some(&aspace), VM_FAULT_READ, vaddr).unwrap();
        let paddr = mapped_frame(&vm, vaddr).unwrap();
        let mut stamp = [0u8; 4];
        vm.ram().read_bytes(paddr + 8, &mut stamp);
        assert_eq!(u32::from_le_bytes(stamp), i, "page {} corrupted", i);
    }

    assert!(vm.stats().get(VmStat::PageFaultSwap) > 0);
    assert!(vm.stats().snapshot().is_consistent());
    assert!(aspace.resident_pages() <= NUM_FREEFRAMES_TEST);
}

#[test]
fn test_no_victim_is_fatal() {
    let vm = boot(VmConfig::new().with_swap_pages(16).with_free_frame_limit(1));
    let first = program(&vm, 1, 0);
    let second = program(&vm, 1, 0);

    vm.vm_fault(Some(&first), VM_FAULT_READ, TEXT).unwrap();
    // memory is full and the second process owns nothing it could give up
    assert_eq!(
        vm.vm_fault(Some(&second), VM_FAULT_READ, TEXT),
        Err(VmError::Panic(KernelPanic::NoVictim {
            owner: second.id().0
        }))
    );
}

#[test]
fn test_destroy_returns_frames_and_slots() {
    let vm = boot(VmConfig::new().with_swap_pages(16).with_free_frame_limit(2));
    let aspace = program(&vm, 4, 0);
    for i in 0..4 {
        vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT + i * 0x1000).unwrap();
    }
    assert_eq!(vm.swap().used(), 2);
    assert_eq!(vm.coremap().free_count(), 0);

    vm.as_destroy(aspace);
    assert_eq!(vm.swap().used(), 0);
    assert_eq!(vm.coremap().free_count(), 2);
}

#[test]
fn test_shutdown_report() {
    let vm = boot(VmConfig::new().with_swap_pages(16).with_free_frame_limit(1));
    let aspace = program(&vm, 2, 0);
    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT).unwrap();
    vm.vm_fault(Some(&aspace), VM_FAULT_READ, TEXT + 0x1000).unwrap();
    vm.as_destroy(aspace);

    let report = vm.vm_shutdown();
    assert_eq!(report.get(VmStat::TlbFault), 2);
    assert!(report.is_consistent());
    assert!(report.to_string().contains("OK! TLB Faults with Free + TLB Faults with Replace (2)"));
}
