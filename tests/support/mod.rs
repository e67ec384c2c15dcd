// CLASSIFICATION: COMMUNITY
// Filename: mod.rs v0.1
// Author: Lukas Bower
// Date Modified: 2026-10-19

//! Host-mode boot fixture shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use sel4_core::boot_modules::CoreImage;
use sel4_core::pager::{PagerEntrypoint, PagerObject, Region, RegionMap};
use sel4_core::pd::Pd;
use sel4_core::sel4::host::{HostBootConfig, HostKernel};
use sel4_core::sel4::{Badge, CapSel, UntypedDesc, PAGE_SIZE};
use sel4_core::thread::PlatformThread;
use sel4_core::{BootstrapError, Platform, PlatformConfig};

pub const PROG_IMG_BEG: usize = 0x0040_0000;
pub const IMAGE_PHYS: usize = 0x0010_0000;
pub const RAM_BASE: usize = 0x8000_0000;
pub const RAM_SIZE_BITS: u8 = 26;
pub const DEVICE_BASE: usize = 0x4800_0000;
pub const DEVICE_SIZE_BITS: u8 = 16;
pub const CODE_LEN: usize = 3 * PAGE_SIZE;
pub const REGION_BASE: usize = 0x1000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic module content of `len` bytes.
pub fn module_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i % 251) as u8 ^ seed)
        .collect()
}

/// Modules linked into the default image: "init" spans three pages, "config" one.
pub fn default_modules() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        ("init", module_bytes(2 * PAGE_SIZE + 100, 0x5a)),
        ("config", module_bytes(600, 0x11)),
    ]
}

pub fn quiet_config() -> PlatformConfig {
    PlatformConfig {
        verbose_boot_info: false,
        ..PlatformConfig::default()
    }
}

pub fn host_boot_config(image: Vec<u8>, init_cnode_size_bits: u8) -> HostBootConfig {
    HostBootConfig {
        init_cnode_size_bits,
        untyped: vec![
            UntypedDesc {
                paddr: DEVICE_BASE,
                size_bits: DEVICE_SIZE_BITS,
                is_device: true,
            },
            UntypedDesc {
                paddr: RAM_BASE,
                size_bits: RAM_SIZE_BITS,
                is_device: false,
            },
        ],
        prog_img_beg: PROG_IMG_BEG,
        image,
        image_phys: IMAGE_PHYS,
        extra_len: 0,
    }
}

pub fn try_boot_with(
    modules: &[(&str, Vec<u8>)],
    config: PlatformConfig,
    init_cnode_size_bits: u8,
) -> (Arc<HostKernel>, Result<Platform, BootstrapError>) {
    init_logging();
    let borrowed: Vec<(&str, &[u8])> = modules
        .iter()
        .map(|(name, bytes)| (*name, bytes.as_slice()))
        .collect();
    let (image, bytes) = CoreImage::assemble(PROG_IMG_BEG, CODE_LEN, &borrowed);
    let (kernel, boot_info) = HostKernel::boot(&host_boot_config(bytes, init_cnode_size_bits));
    let kernel = Arc::new(kernel);
    let platform = Platform::bootstrap(kernel.clone(), boot_info, image, config);
    (kernel, platform)
}

/// Boots core with the default modules.
pub fn boot() -> (Arc<HostKernel>, Platform) {
    let (kernel, platform) = try_boot_with(&default_modules(), quiet_config(), 12);
    (kernel, platform.expect("bootstrap"))
}

/// A started thread whose faults are served by `entrypoint`. Fields drop in
/// declaration order: thread, then pager, then PD.
pub struct Paged {
    pub thread: PlatformThread,
    pub entrypoint: PagerEntrypoint,
    pub pd: Arc<Pd>,
    pub badge: Badge,
}

/// Region map with the ROM module `rom` attached read-only at [`REGION_BASE`].
pub fn rom_regions(platform: &Platform, rom: &str) -> RegionMap {
    let module = platform.rom_fs().lookup(rom).cloned().expect("rom module");
    let mut regions = RegionMap::new();
    assert!(regions.attach(Region {
        virt: REGION_BASE,
        size: module.size(),
        phys: module.base(),
        writeable: false,
    }));
    regions
}

/// Creates a thread named `name` in `pd`, managed by `entrypoint`, and starts it.
pub fn start_thread(
    platform: &Platform,
    entrypoint: &mut PagerEntrypoint,
    pd: &Arc<Pd>,
    name: &str,
    regions: RegionMap,
) -> PlatformThread {
    let env = platform.core_env();
    let mut thread =
        PlatformThread::new(env, name, env.config().thread_priority, 0).expect("thread");
    let badge = thread.pager_object_badge();
    let pager = PagerObject::new(
        env,
        CapSel::NULL,
        thread.tcb_sel(),
        badge,
        pd.label(),
        thread.name(),
        Box::new(regions),
    )
    .expect("pager object");
    entrypoint.manage(pager).expect("manage");
    thread
        .set_pager(entrypoint.lookup(badge).expect("managed"))
        .expect("set pager");
    thread.bind_to_pd(pd).expect("bind");
    thread.start(REGION_BASE, REGION_BASE + 0x8000).expect("start");
    thread
}

/// One PD with one started thread paged from the "init" module.
pub fn paged(platform: &Platform) -> Paged {
    let env = platform.core_env();
    let pd = Arc::new(Pd::new(env, "init").expect("pd"));
    let mut entrypoint = PagerEntrypoint::new(env).expect("entrypoint");
    let regions = rom_regions(platform, "init");
    let thread = start_thread(platform, &mut entrypoint, &pd, "init-main", regions);
    let badge = thread.pager_object_badge();
    Paged {
        thread,
        entrypoint,
        pd,
        badge,
    }
}
