//! The boot sequence, reset to jump.
//!
//! Phase order: platform probe, storage mount, optional configuration
//! file, optional delay, image selection (with one fallback recovery and
//! the retry counter), load, post-load validation, handoff build, jump.
//! Any hard failure lands in [`fail`], which blinks its class on the LED.
//!
//! [`prepare`] is the testable boundary — it does everything except the
//! jump. [`run`] is the thin diverging wrapper around it.

use crate::config::{Config, CONFIG_PATH};
use crate::elf::loader::{
    self, DirectMemory, LoadResult, LoaderConfig, MemFlags, MemRegion, Memory,
};
use crate::error::BootError;
use crate::fat::{FileCursor, FileIo, Volume};
use crate::handoff::{self, BootReason, BootSource, Handoff};
use crate::jump;
use crate::storage::BlockDevice;
use crate::util;

use heapless::String;

/// What the HAL knows about the machine. Filled in once, early.
#[derive(Debug, Clone, Copy)]
pub struct PlatformInfo {
    pub ram_base: u32,
    pub ram_size: u32,
    pub loader_base: u32,
    pub loader_size: u32,
    pub sys_clock_hz: u32,
    pub reset_reason: BootReason,
    pub boot_source: BootSource,
}

/// The hardware surface the orchestrator needs. Implemented by the HAL;
/// everything else in the crate is hardware-free.
pub trait Platform {
    fn info(&self) -> PlatformInfo;

    /// Monotonic microseconds since some point before `prepare` began.
    fn time_us(&mut self) -> u32;

    fn delay_ms(&mut self, ms: u32);

    fn led_set(&mut self, on: bool);

    /// One group of `pulses` on/off cycles.
    fn led_blink(&mut self, pulses: u8, on_ms: u32, off_ms: u32);

    /// Drain any buffered console output.
    fn console_flush(&mut self);

    fn reset(&mut self) -> !;
}

/// Everything `prepare` produced; all that is left is to park the handoff
/// somewhere safe and branch.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub handoff: Handoff,
    pub entry: u32,
    pub load: LoadResult,
}

fn load_config<D: BlockDevice>(
    volume: &mut Volume<D>,
    config: &mut Config,
) -> Result<(), BootError> {
    let mut file = volume.open(CONFIG_PATH)?;

    let mut buf = [0u8; 2048];
    let n = volume.read(&mut file, &mut buf)?;

    let text = core::str::from_utf8(&buf[..n]).map_err(|_| BootError::Invalid)?;
    config.parse(text);
    Ok(())
}

fn open_image<D: BlockDevice>(
    volume: &mut Volume<D>,
    config: &Config,
    path: &mut String<64>,
) -> Result<FileCursor, BootError> {
    match volume.open(path.as_str()) {
        Ok(file) => Ok(file),
        Err(e @ BootError::NotFound) | Err(e @ BootError::NotDir) => {
            // The one recovery step: a missing primary gets the fallback.
            if config.has_fallback
                && !config.fallback_path.is_empty()
                && config.fallback_path.as_str() != path.as_str()
            {
                log::warn!("primary image not found, trying fallback");
                path.clear();
                let _ = path.push_str(config.fallback_path.as_str());
                volume.open(path.as_str())
            } else {
                Err(e)
            }
        }
        Err(e) => Err(e),
    }
}

/// Runs every phase short of the jump.
///
/// `mem` is where segments land — [`DirectMemory`] on hardware, a checked
/// buffer in tests. On success the returned handoff still needs a home
/// that no loaded segment overlaps; that placement is the caller's call.
pub fn prepare<P: Platform, D: BlockDevice, M: Memory>(
    platform: &mut P,
    device: D,
    mem: &mut M,
    config: &mut Config,
) -> Result<Prepared, BootError> {
    let boot_start = platform.time_us();
    let info = platform.info();

    log::info!("mboot {}", env!("CARGO_PKG_VERSION"));
    log::debug!(
        "ram {:#010x}+{:#x}, clock {} MHz, reset {:#x}",
        info.ram_base,
        info.ram_size,
        info.sys_clock_hz / 1_000_000,
        info.reset_reason.bits(),
    );

    log::info!("mounting filesystem");
    let mut volume = Volume::mount(device)?;
    log::debug!("cluster size: {} bytes", volume.cluster_size());

    match load_config(&mut volume, config) {
        Ok(()) => log::debug!("configuration loaded"),
        Err(_) => log::debug!("no {}, using defaults", CONFIG_PATH),
    }
    log::set_max_level(config.log_level());
    if config.timeout_ms > 0 {
        log::debug!("menu timeout {} ms configured (no menu present)", config.timeout_ms);
    }

    if config.boot_delay_ms > 0 {
        log::info!("waiting {} ms", config.boot_delay_ms);
        platform.delay_ms(config.boot_delay_ms);
    }

    config.boot_attempt();

    let mut image_path: String<64> = String::new();
    let selected = config.select_image().ok_or(BootError::NotFound)?;
    let _ = image_path.push_str(selected);

    log::info!("loading {}", image_path.as_str());
    let file = open_image(&mut volume, config, &mut image_path)?;
    log::debug!("file size: {} bytes", file.size());

    let regions = [MemRegion {
        base: info.ram_base,
        size: info.ram_size,
        flags: MemFlags::READ | MemFlags::WRITE | MemFlags::EXEC | MemFlags::RAM,
    }];
    let mut loader_config = LoaderConfig::new(&regions);
    loader_config.verify = config.verify;

    let load_start = platform.time_us();
    let result = {
        let mut io = FileIo::new(&mut volume, file);
        loader::load(&loader_config, &mut io, mem)?
    };
    let loader_time_us = platform.time_us().wrapping_sub(load_start);

    loader::validate_loaded(&result)?;

    log::info!("loaded: entry {:#010x}", result.entry);
    log::debug!(
        "  region {:#010x}..{:#010x}, {} segment(s), {} B copied, {} B zeroed, {} us",
        result.load_base,
        result.load_end,
        result.segments.len(),
        result.bytes_copied,
        result.bytes_zeroed,
        loader_time_us,
    );

    let boot_time_us = platform.time_us().wrapping_sub(boot_start);
    let built = handoff::build(
        &result,
        &info,
        util::basename(image_path.as_str()),
        config.boot_count,
        boot_time_us,
        loader_time_us,
    );

    // Control will not come back after the jump; the counter reset only
    // matters to embeddings that persist it themselves before jumping.
    config.boot_success();

    Ok(Prepared {
        handoff: built,
        entry: result.entry,
        load: result,
    })
}

/// Boots, or dies blinking. Never returns either way.
///
/// `handoff_slot` is where the descriptor lives for the payload to read;
/// the caller (HAL/startup) must place it so it overlaps no loaded
/// segment.
pub fn run<P: Platform, D: BlockDevice>(
    mut platform: P,
    device: D,
    handoff_slot: &'static mut Handoff,
) -> ! {
    let mut config = Config::default();

    // Real hardware: segments go straight to physical RAM. The region
    // list built in `prepare` keeps every write inside the platform's RAM.
    let mut mem = unsafe { DirectMemory::new() };

    match prepare(&mut platform, device, &mut mem, &mut config) {
        Ok(prepared) => {
            *handoff_slot = prepared.handoff;

            log::info!(">>> jumping to payload at {:#010x}", prepared.entry);
            platform.console_flush();
            platform.delay_ms(10);
            platform.led_set(false);

            unsafe { jump::transfer(handoff_slot, prepared.entry, None) }
        }
        Err(err) => fail(&mut platform, err, config.reset_on_fail),
    }
}

/// Terminal failure: blink the class, then reset or halt.
pub fn fail<P: Platform>(platform: &mut P, err: BootError, reset_on_fail: bool) -> ! {
    let code = err.blink_code();
    log::error!("[FAIL] {} (code {})", err, err.code());
    log::error!("blink code: {}", code);
    platform.console_flush();

    if reset_on_fail {
        for _ in 0..3 {
            platform.led_blink(code, 200, 200);
            platform.delay_ms(1000);
        }
        platform.reset()
    }

    loop {
        platform.led_blink(code, 200, 200);
        platform.delay_ms(1000);
    }
}
