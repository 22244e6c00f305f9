//! Trap entry for TLB faults
//!
//! The boundary between the fault handler and the rest of the kernel.
//! Process-visible errors come back as errno values. A fatal error means
//! the shared VM tables can no longer be trusted, so the kernel halts
//! here with a diagnostic instead of returning to the process.

use crate::kern::error::VmError;
use crate::vm::{AddressSpace, VmSystem};
use crate::Vaddr;

/// Run the fault handler for a TLB exception
///
/// Returns the errno to deliver to the faulting process on failure.
pub fn vm_fault_trap(
    vm: &VmSystem,
    aspace: Option<&AddressSpace>,
    faulttype: i32,
    faultaddress: Vaddr,
) -> Result<(), i32> {
    match vm.vm_fault(aspace, faulttype, faultaddress) {
        Ok(()) => Ok(()),
        Err(VmError::Panic(fatal)) => kernel_panic(&fatal),
        Err(err) => {
            crate::vm_trace!("vm_fault: 0x{:08x}: {}", faultaddress, err);
            // every non-fatal VmError carries an errno
            Err(err.errno().unwrap_or(crate::kern::error::EFAULT))
        }
    }
}

/// Halt on a fatal VM error
pub fn kernel_panic(reason: &dyn core::fmt::Display) -> ! {
    crate::kprintln!("panic: {}", reason);
    panic!("{}", reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VmConfig;
    use crate::kern::error::{EFAULT, EINVAL};
    use crate::vm::tests::system;
    use crate::vm::vm_fault::{VM_FAULT_READ, VM_FAULT_READONLY};

    #[test]
    fn test_errno_delivery() {
        let vm = system(VmConfig::new().with_swap_pages(4));
        let aspace = vm.as_create();
        assert_eq!(vm_fault_trap(&vm, Some(&aspace), 42, 0x40_0000), Err(EINVAL));
        assert_eq!(
            vm_fault_trap(&vm, Some(&aspace), VM_FAULT_READ, 0x40_0000),
            Err(EFAULT)
        );
        assert_eq!(vm_fault_trap(&vm, None, VM_FAULT_READ, 0x40_0000), Err(EFAULT));
    }

    #[test]
    fn test_stack_fault_succeeds() {
        let vm = system(VmConfig::new().with_swap_pages(4));
        let aspace = vm.as_create();
        let sp = vm.as_define_stack(&aspace).unwrap();
        assert_eq!(vm_fault_trap(&vm, Some(&aspace), VM_FAULT_READ, sp - 4), Ok(()));
    }

    #[test]
    #[should_panic(expected = "VM_FAULT_READONLY")]
    fn test_readonly_fault_halts() {
        let vm = system(VmConfig::new().with_swap_pages(4));
        let aspace = vm.as_create();
        let _ = vm_fault_trap(&vm, Some(&aspace), VM_FAULT_READONLY, 0x40_0000);
    }
}
