#![doc = include_str!("../README.md")]
#![no_main]
#![no_std]
#![feature(core_intrinsics)]
#![feature(new_uninit)]
#![feature(panic_info_message)]
#![warn(
    // groups: https://doc.rust-lang.org/rustc/lints/groups.html
    future_incompatible,
    let_underscore,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2018_idioms,
    rust_2021_compatibility,
    unused,

    // warnings that are not enabled by default or covered by groups
    // https://doc.rust-lang.org/rustc/lints/listing/allowed-by-default.html
    macro_use_extern_crate,
    meta_variable_misuse,
    missing_abi,
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    non_ascii_idents,
    noop_method_call,
    single_use_lifetimes,
    trivial_numeric_casts,
    unreachable_pub,
    unsafe_op_in_unsafe_fn,
    unused_crate_dependencies,
    unused_import_braces,
    unused_lifetimes,
    unused_qualifications,
    unused_results,

    // https://github.com/rust-lang/rust-clippy/blob/master/README.md
    clippy::pedantic,
    clippy::cargo,

    // https://doc.rust-lang.org/rustdoc/lints.html
    rustdoc::missing_crate_level_docs,
    rustdoc::private_doc_tests,
    rustdoc::invalid_html_tags,
)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::multiple_crate_versions)]

#[cfg(not(target_pointer_width = "64"))]
compile_error!("This project must target the 64bit-width pointer environment.");

extern crate alloc;

mod allocator;
mod bugcheck;
mod config;
mod ept;
mod global_state;
mod guest_memory;
mod hook;
mod host_page_table;
mod hypercall;
mod idt;
mod instruction_error;
mod interrupt;
mod logger;
mod panic;
mod per_cpu;
mod spinlock;
mod system_table;
mod vcpu;
mod vmexit;
mod win_driver;
mod x86_instructions;

use crate::{
    ept::Ept,
    global_state::GlobalState,
    logger::init_uart_logger,
    per_cpu::PerCpuData,
    system_table::{init_system_table, system_table},
    vcpu::Vcpu,
};
use alloc::boxed::Box;
use core::ffi::c_void;
use log::info;
use system_table::system_table_unsafe;
use uefi::{
    prelude::*,
    proto::{loaded_image::LoadedImage, pi::mp::MpServices},
    table::boot::{OpenProtocolAttributes, OpenProtocolParams},
};
use x86::current::paging::{BASE_PAGE_SHIFT, BASE_PAGE_SIZE};

/// The entry point of the program: a UEFI driver that virtualizes the
/// machine it loads on in place and never returns.
#[no_mangle]
extern "efiapi" fn efi_main(image: Handle, system_table: SystemTable<Boot>) -> Status {
    init_uart_logger();
    info!("shv loaded🔥");

    init_system_table(system_table, image);
    print_image_info();

    // The heap must exist before any core builds a `Vcpu` (every VMX
    // region, the MSR bitmap, and the VMM stack are heap-allocated), and
    // boot services must still be callable to carve it out.
    allocator::init_heap();

    let ept = Ept::new();
    let global: &'static GlobalState = Box::leak(Box::new(GlobalState::new(ept)));

    start_on_all_processors(global)
}

/// Starts [`boot_core`] on every logical processor: this one directly, and
/// every application processor through `MpServices::startup_all_aps`.
fn start_on_all_processors(global: &'static GlobalState) -> ! {
    // Safety: code is single threaded up to this point.
    let st = unsafe { system_table_unsafe() };
    let bs = st.boot_services();
    let mp = unsafe {
        bs.open_protocol::<MpServices>(
            OpenProtocolParams { handle: bs.get_handle_for_protocol::<MpServices>().unwrap(), agent: bs.image_handle(), controller: None },
            OpenProtocolAttributes::GetProtocol,
        )
    };

    let multiple_cores = mp.as_ref().is_ok_and(|mp| mp.get_number_of_processors().map(|info| info.enabled) != Ok(1));
    if !multiple_cores {
        return boot_core(global);
    }

    let procedure_argument = (global as *const GlobalState).cast_mut().cast::<c_void>();
    // NOTE: this never returns. `EFI_MP_SERVICES_STARTUP_ALL_APS` cannot be
    // used in non-blocking mode at this stage, and `boot_core` never returns
    // either, so the calling (bootstrap) processor is stuck inside this call
    // forever, running as a guest once `boot_core` virtualizes it too.
    mp.unwrap().startup_all_aps(false, start_on_ap, procedure_argument, None).unwrap();
    panic!("startup_all_aps() should not return")
}

/// The trampoline `MpServices::startup_all_aps` calls on every application
/// processor.
extern "efiapi" fn start_on_ap(context: *mut c_void) {
    // Safety: `context` is the `&'static GlobalState` leaked in `efi_main`,
    // valid for the life of the machine.
    let global = unsafe { &*context.cast::<GlobalState>() };
    boot_core(global);
}

/// Brings up VMX on the calling core, virtualizes it in place, and enters
/// the VM-exit dispatch loop forever.
fn boot_core(global: &'static GlobalState) -> ! {
    let vcpu: &'static mut Vcpu = Box::leak(Box::new(Vcpu::new()));
    vcpu.enable();
    vcpu.initialize(global.ept().eptp());

    let core_id = apic_id();
    let per_cpu: &'static PerCpuData = Box::leak(PerCpuData::install(core_id, vcpu));
    global.register_core(per_cpu);

    vcpu.virtualize_current_context();
    info!("core {core_id} is now running virtualized");

    loop {
        let reason = vcpu.run();
        vmexit::handle_exit(vcpu, reason, global, per_cpu);
    }
}

/// This core's APIC id, used only to tag [`PerCpuData`] and log lines.
fn apic_id() -> u32 {
    x86::cpuid::cpuid!(0x1).ebx >> 24
}

/// Debug prints the address of this module.
fn print_image_info() {
    let st = system_table();
    let bs = st.boot_services();
    // Safety: The protocol and handle remain valid indefinitely.
    let loaded_image = unsafe {
        bs.open_protocol::<LoadedImage>(
            OpenProtocolParams { handle: bs.image_handle(), agent: bs.image_handle(), controller: None },
            OpenProtocolAttributes::GetProtocol,
        )
        .unwrap()
    };
    let (image_base, image_size) = loaded_image.info();
    info!("shv image range {:#x} - {:#x}", image_base as u64, image_base as u64 + image_size);
}

/// The structure representing a single memory page (4KB).
//
// This does not _always_ have to be allocated at the page aligned address, but
// very often it is, so let us specify the alignment.
#[derive(Debug, Clone, Copy)]
#[repr(C, align(4096))]
pub(crate) struct Page([u8; BASE_PAGE_SIZE]);
const _: () = assert!(core::mem::size_of::<Page>() == 0x1000);

impl Page {
    pub(crate) fn new() -> Self {
        Self([0; BASE_PAGE_SIZE])
    }
}

/// Computes how many pages are needed for the given bytes.
pub(crate) fn size_to_pages(size: usize) -> usize {
    const PAGE_MASK: usize = 0xfff;

    (size >> BASE_PAGE_SHIFT) + usize::from((size & PAGE_MASK) != 0)
}
