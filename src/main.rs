// CLASSIFICATION: COMMUNITY
// Filename: main.rs v1.1
// Date Modified: 2026-10-19
// Author: Lukas Bower

//! Boots core on the host-mode kernel and pages one thread.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use sel4_core::boot_modules::CoreImage;
use sel4_core::pager::{Dispatch, PagerEntrypoint, PagerObject, Region, RegionMap};
use sel4_core::pd::Pd;
use sel4_core::sel4::host::{HostBootConfig, HostKernel};
use sel4_core::sel4::{CapSel, UntypedDesc, PAGE_SIZE};
use sel4_core::thread::PlatformThread;
use sel4_core::{Platform, PlatformConfig};

const PROG_IMG_BEG: usize = 0x0040_0000;
const IMAGE_PHYS: usize = 0x0010_0000;
const RAM_BASE: usize = 0x8000_0000;
const DEVICE_BASE: usize = 0x4800_0000;
const REGION_BASE: usize = 0x1000_0000;

#[derive(Parser)]
#[command(name = "sel4-core-host", about = "Boot core on the host-mode kernel", version = "0.1")]
struct Cli {
    /// JSON platform configuration overriding the defaults
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Size of the demo boot module in pages
    #[arg(long, default_value_t = 2)]
    module_pages: usize,
    /// RAM size as a power of two
    #[arg(long, default_value_t = 26)]
    ram_size_bits: u8,
}

fn demo_module(pages: usize) -> Vec<u8> {
    (0..pages * PAGE_SIZE).map(|i| (i % 251) as u8).collect()
}

/// Completes the pending reply and returns once no fault is queued.
fn wait_until_idle(entrypoint: &mut PagerEntrypoint) {
    if let Err(err) = entrypoint.serve_one() {
        log::debug!("entrypoint idle: {err}");
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => PlatformConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PlatformConfig::default(),
    };

    let module = demo_module(cli.module_pages.max(1));
    let (image, image_bytes) = CoreImage::assemble(PROG_IMG_BEG, 3 * PAGE_SIZE, &[("init", module.as_slice())]);
    let (kernel, boot_info) = HostKernel::boot(&HostBootConfig {
        init_cnode_size_bits: 12,
        untyped: vec![
            UntypedDesc {
                paddr: DEVICE_BASE,
                size_bits: 16,
                is_device: true,
            },
            UntypedDesc {
                paddr: RAM_BASE,
                size_bits: cli.ram_size_bits,
                is_device: false,
            },
        ],
        prog_img_beg: PROG_IMG_BEG,
        image: image_bytes,
        image_phys: IMAGE_PHYS,
        extra_len: 0,
    });
    let kernel = Arc::new(kernel);
    let platform = Platform::bootstrap(kernel.clone(), boot_info, image, config)
        .context("bootstrapping core")?;
    let env = platform.core_env();

    let rom = platform
        .rom_fs()
        .lookup("init")
        .cloned()
        .context("boot module 'init' missing")?;
    let content = platform.read_rom_module("init")?;
    anyhow::ensure!(content == module, "ROM module 'init' does not read back");

    let pd = Arc::new(Pd::new(env, "init")?);
    let mut entrypoint = PagerEntrypoint::new(env)?;
    let mut thread = PlatformThread::new(env, "init-main", env.config().thread_priority, 0)?;

    let mut regions = RegionMap::new();
    regions.attach(Region {
        virt: REGION_BASE,
        size: rom.size(),
        phys: rom.base(),
        writeable: false,
    });
    let badge = thread.pager_object_badge();
    let pager = PagerObject::new(
        env,
        CapSel::NULL,
        thread.tcb_sel(),
        badge,
        pd.label(),
        thread.name(),
        Box::new(regions),
    )?;
    entrypoint.manage(pager)?;
    if let Some(obj) = entrypoint.lookup(badge) {
        thread.set_pager(obj)?;
    }
    thread.bind_to_pd(&pd)?;
    thread.start(REGION_BASE, REGION_BASE + rom.size())?;

    kernel.raise_page_fault(thread.tcb_sel(), REGION_BASE, REGION_BASE + 0x10, false)?;
    let first = entrypoint.serve_one()?;
    wait_until_idle(&mut entrypoint);
    anyhow::ensure!(
        kernel.page_mapped(pd.page_directory_sel(), REGION_BASE),
        "resolved fault left no mapping"
    );

    kernel.raise_page_fault(thread.tcb_sel(), REGION_BASE + 4, REGION_BASE + 0x10_0000, true)?;
    let second = entrypoint.serve_one()?;
    wait_until_idle(&mut entrypoint);
    log::info!("dispatched {first:?} then {second:?}");
    anyhow::ensure!(
        matches!((first, second), (Dispatch::Resolved(_), Dispatch::Unresolved(_))),
        "unexpected dispatch sequence"
    );

    if let Some(obj) = entrypoint.lookup(badge) {
        obj.wake_up();
    }
    log::info!(
        "thread '{}' is {:?} with {} page(s) mapped",
        thread.name(),
        kernel.thread_status(thread.tcb_sel())?,
        pd.num_mappings()
    );

    println!("ROM file system:");
    for module in platform.rom_fs().iter() {
        println!("  {module}");
    }

    drop(thread);
    drop(entrypoint);
    drop(pd);
    Ok(())
}
