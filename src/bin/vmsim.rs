use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use demand_vm::config::{VmConfig, PAGE_SIZE, STACK_PAGES, USERSTACK};
use demand_vm::kern::trap::vm_fault_trap;
use demand_vm::machine::device::{BlockDevice, DeviceError, FileDevice, MemDevice};
use demand_vm::machine::PhysicalMemory;
use demand_vm::vm::vm_fault::{VM_FAULT_READ, VM_FAULT_WRITE};
use demand_vm::vm::{AddressSpace, Permissions, VmSystem};
use demand_vm::Vaddr;

const TEXT_BASE: Vaddr = 0x40_0000;
const DATA_BASE: Vaddr = 0x1000_0000;

#[derive(Parser)]
#[command(name = "vmsim")]
#[command(about = "Run a synthetic paging workload against the VM subsystem", long_about = None)]
struct Cli {
    /// Physical memory size in KB
    #[arg(long, default_value_t = 1024)]
    ram_kb: u32,

    /// Memory taken by the kernel image, in KB
    #[arg(long, default_value_t = 64)]
    kernel_kb: u32,

    /// Leave only this many frames free (swap stress mode)
    #[arg(long)]
    free_frames: Option<usize>,

    /// Swap capacity in pages
    #[arg(long, default_value_t = 256)]
    swap_pages: usize,

    /// Swap file on the host; swap lives in memory if omitted
    #[arg(long)]
    swap_file: Option<PathBuf>,

    /// Executable image to page text and data from; a synthetic image is
    /// generated if omitted
    #[arg(long)]
    image: Option<PathBuf>,

    /// Load every page at exec time instead of on first touch
    #[arg(long)]
    no_demand_paging: bool,

    /// Number of processes, run round-robin
    #[arg(short, long, default_value_t = 2)]
    processes: usize,

    /// Text pages per process
    #[arg(long, default_value_t = 8)]
    text_pages: usize,

    /// Data pages per process
    #[arg(long, default_value_t = 24)]
    data_pages: usize,

    /// Passes over each process's pages
    #[arg(long, default_value_t = 3)]
    passes: usize,

    /// Dump the coremap and page tables before shutdown
    #[arg(short, long)]
    verbose: bool,
}

/// One simulated process
struct Process {
    aspace: AddressSpace,
    text_pages: usize,
    data_pages: usize,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    demand_vm::console::set_sink(|s| print!("{}", s));

    let mut config = VmConfig::new()
        .with_swap_pages(cli.swap_pages)
        .with_demand_paging(!cli.no_demand_paging);
    if let Some(frames) = cli.free_frames {
        config = config.with_free_frame_limit(frames);
    }

    let ram = PhysicalMemory::new(cli.ram_kb * 1024, cli.kernel_kb * 1024);
    let vm = VmSystem::new(config, ram);

    let swap_file = cli.swap_file.clone();
    vm.vm_bootstrap(|_name| match swap_file {
        Some(path) => Ok(Arc::new(FileDevice::open_or_create(path)?) as Arc<dyn BlockDevice>),
        None => Ok(Arc::new(MemDevice::new()) as Arc<dyn BlockDevice>),
    })?;

    let image = load_image(&cli)?;
    let mut procs = Vec::with_capacity(cli.processes);
    for _ in 0..cli.processes {
        procs.push(exec(&vm, &cli, Arc::clone(&image))?);
    }

    let mut current: Option<usize> = None;
    for pass in 0..cli.passes {
        for (pid, proc) in procs.iter().enumerate() {
            if current != Some(pid) {
                vm.as_activate(Some(&proc.aspace));
                current = Some(pid);
            }
            run_quantum(&vm, proc, pid, pass)?;
        }
    }

    if cli.verbose {
        vm.coremap().dump("vmsim", usize::MAX);
        for proc in &procs {
            proc.aspace.dump_page_table();
        }
        vm.swap().dump("Swap slots in use");
    }

    for proc in procs {
        vm.as_destroy(proc.aspace);
    }
    let report = vm.vm_shutdown();
    if !report.is_consistent() {
        return Err("statistics identities do not hold".into());
    }
    Ok(())
}

fn load_image(cli: &Cli) -> Result<Arc<dyn BlockDevice>, DeviceError> {
    if let Some(path) = &cli.image {
        return Ok(Arc::new(FileDevice::open_read_only(path)?));
    }
    let pages = cli.text_pages + cli.data_pages;
    let bytes = (0..pages * PAGE_SIZE)
        .map(|i| (i / PAGE_SIZE) as u8 ^ 0x5a)
        .collect();
    Ok(Arc::new(MemDevice::from_bytes(bytes)))
}

/// Build a process image: text, data right after it in the image, and a stack
fn exec(
    vm: &VmSystem,
    cli: &Cli,
    image: Arc<dyn BlockDevice>,
) -> Result<Process, Box<dyn std::error::Error>> {
    let aspace = vm.as_create();
    let text_size = cli.text_pages * PAGE_SIZE;
    vm.as_define_region(
        &aspace,
        TEXT_BASE,
        0,
        text_size,
        Permissions::READ | Permissions::EXECUTE,
    )?;
    vm.as_define_region(
        &aspace,
        DATA_BASE,
        text_size as u64,
        cli.data_pages * PAGE_SIZE,
        Permissions::READ | Permissions::WRITE,
    )?;
    vm.as_prepare_load(&aspace)?;
    vm.as_complete_load(&aspace, image)?;
    vm.as_define_stack(&aspace)?;
    Ok(Process {
        aspace,
        text_pages: cli.text_pages,
        data_pages: cli.data_pages,
    })
}

/// Touch `vaddr` the way the CPU would: fault only on a TLB miss
fn touch(vm: &VmSystem, aspace: &AddressSpace, vaddr: Vaddr, write: bool) -> Result<(), String> {
    match vm.tlb().translate(vaddr) {
        Some((_, writable)) if writable || !write => return Ok(()),
        _ => {}
    }
    let faulttype = if write { VM_FAULT_WRITE } else { VM_FAULT_READ };
    vm_fault_trap(vm, Some(aspace), faulttype, vaddr)
        .map_err(|errno| format!("fault at 0x{:08x}: errno {}", vaddr, errno))
}

/// One scheduling quantum: run through the text, stamp or check every
/// data page, and use a few stack pages
fn run_quantum(vm: &VmSystem, proc: &Process, pid: usize, pass: usize) -> Result<(), String> {
    for i in 0..proc.text_pages {
        touch(vm, &proc.aspace, TEXT_BASE + (i * PAGE_SIZE) as Vaddr, false)?;
    }

    // alternate direction so LRU-ish eviction keeps swapping
    let order: Vec<usize> = if pass % 2 == 0 {
        (0..proc.data_pages).collect()
    } else {
        (0..proc.data_pages).rev().collect()
    };
    for i in order {
        let vaddr = DATA_BASE + (i * PAGE_SIZE) as Vaddr;
        touch(vm, &proc.aspace, vaddr, true)?;
        let (paddr, _) = vm
            .tlb()
            .translate(vaddr)
            .ok_or_else(|| format!("0x{:08x} not mapped after fault", vaddr))?;
        let stamp = ((pid << 16) | i) as u32;
        if pass == 0 {
            vm.ram().write_bytes(paddr, &stamp.to_le_bytes());
        } else {
            let mut word = [0u8; 4];
            vm.ram().read_bytes(paddr, &mut word);
            if u32::from_le_bytes(word) != stamp {
                return Err(format!("process {} data page {} corrupted", pid, i));
            }
        }
    }

    for i in 0..STACK_PAGES.min(4) {
        touch(vm, &proc.aspace, USERSTACK - ((i + 1) * PAGE_SIZE) as Vaddr, true)?;
    }
    Ok(())
}
