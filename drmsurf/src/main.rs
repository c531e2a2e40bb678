// SPDX-FileCopyrightText: 2025 drmsurf contributors
// SPDX-License-Identifier: GPL-3.0-or-later

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::path::PathBuf;
use std::sync::Arc;

use drmsurf_common::Format;
use drmsurf_gpu::chip::VENDOR_INTEL;
use drmsurf_gpu::glyph_cache::{GlyphKey, GlyphStatus};
use drmsurf_gpu::gradient_cache::{Extend, GradientGeometry, GradientPattern, GradientStop};
use drmsurf_gpu::{DeviceDescriptor, DeviceRef, DeviceRegistry, DrmSurface, ImageSurface};
use drmsurf_kernel::{GemDriver, SoftGem};

/// drmsurf - GEM buffer-object and batch smoke tool
#[derive(Parser, Debug)]
#[command(name = "drmsurf", version, about = "Exercise GEM-backed 2D surfaces on a DRM device")]
struct Args {
    /// DRM device node to open, or "soft" for the in-process driver
    #[arg(short, long, default_value = "soft")]
    device: String,

    /// PCI vendor id override (e.g. 0x8086)
    #[arg(long, value_parser = parse_hex)]
    vendor: Option<u32>,

    /// Path to config file (default: $XDG_CONFIG_HOME/drmsurf/drmsurf.ini)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Surface width and height
    #[arg(long, default_value_t = 256)]
    size: u32,

    /// Rectangles drawn per pass
    #[arg(long, default_value_t = 1000)]
    rects: u32,

    /// Decode and log every submitted batch
    #[arg(long)]
    dump_batches: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_hex(s: &str) -> std::result::Result<u32, String> {
    let digits = s.trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(digits, 16).map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_millis()
        .init();

    info!("drmsurf - GEM surface smoke test");

    let mut settings = config::load_config(args.config.as_ref());
    if args.dump_batches {
        settings.dump_batches = true;
    }

    let desc = open_device(&args)?;
    let registry = DeviceRegistry::new(settings);
    let device = registry.get(desc).context("Failed to create device")?;
    info!(
        "Device: {} backend, chip {}, fd {}",
        device.backend().name(),
        device.chip().name(),
        device.fd()
    );

    run_workload(&device, &args)?;

    let stats = device.bo_cache_stats();
    info!(
        "BO cache: {} hits, {} misses, {} purged, {} cached",
        stats.hits, stats.misses, stats.purged, stats.cached
    );
    let glyphs = device.glyph_stats();
    info!(
        "Glyph cache: {} hits, {} misses, {} evictions, {} fallbacks",
        glyphs.hits, glyphs.misses, glyphs.evictions, glyphs.fallbacks
    );

    device.finish().context("Device teardown failed")?;
    drop(device);
    registry.reset();
    info!("Done");
    Ok(())
}

/// Build the device descriptor for `args.device`.
fn open_device(args: &Args) -> Result<DeviceDescriptor> {
    if args.device == "soft" {
        let driver: Arc<dyn GemDriver> = Arc::new(SoftGem::new());
        return Ok(DeviceDescriptor {
            driver,
            device_id: 0,
            vendor_id: args.vendor.unwrap_or(VENDOR_INTEL),
            chip_id: 0,
        });
    }
    open_drm_node(args)
}

#[cfg(target_os = "linux")]
fn open_drm_node(args: &Args) -> Result<DeviceDescriptor> {
    use drmsurf_kernel::I915Gem;
    use std::os::unix::fs::MetadataExt;

    let path = PathBuf::from(&args.device);
    let rdev = std::fs::metadata(&path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .rdev();
    let vendor_id = match args.vendor {
        Some(v) => v,
        None => read_vendor(rdev).with_context(|| format!("Unknown PCI vendor for {}", path.display()))?,
    };
    let driver = I915Gem::open(&path).with_context(|| format!("Failed to open {}", path.display()))?;
    Ok(DeviceDescriptor {
        driver: Arc::new(driver),
        device_id: rdev,
        vendor_id,
        chip_id: 0,
    })
}

#[cfg(not(target_os = "linux"))]
fn open_drm_node(args: &Args) -> Result<DeviceDescriptor> {
    anyhow::bail!("DRM nodes are only supported on Linux (got {})", args.device)
}

/// PCI vendor of a DRM character device, from sysfs.
#[cfg(target_os = "linux")]
fn read_vendor(rdev: u64) -> Result<u32> {
    let major = ((rdev >> 8) & 0xfff) | ((rdev >> 32) & !0xfff);
    let minor = (rdev & 0xff) | ((rdev >> 12) & !0xff);
    let path = format!("/sys/dev/char/{}:{}/device/vendor", major, minor);
    let text = std::fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path))?;
    parse_hex(text.trim()).map_err(|e| anyhow::anyhow!("Bad vendor id in {}: {}", path, e))
}

fn run_workload(device: &DeviceRef, args: &Args) -> Result<()> {
    let size = args.size;
    let mut surface = DrmSurface::create(device, Format::Argb32, size, size).context("Failed to create surface")?;
    info!("Surface: {}x{} stride {}", size, size, surface.stride());

    // CPU fill through the mapping.
    {
        let view = surface.map_to_image()?;
        view.fill_u32(0xFF20_4080)?;
    }
    surface.flush(0)?;

    // GPU rectangles.
    let target = surface.bo().context("Surface has no buffer object")?.clone();
    let step = (size / 32).max(1) as f32;
    let mut vertices = Vec::with_capacity(args.rects as usize * 6);
    for i in 0..args.rects {
        let x = (i % 32) as f32 * step;
        let y = ((i / 32) % 32) as f32 * step;
        vertices.extend_from_slice(&[x + step, y + step, x, y + step, x, y]);
    }
    device.draw_rectangles(&target, 2, &vertices)?;
    device.flush()?;
    device.throttle()?;

    let image = surface.get_image()?;
    info!(
        "Read back {}x{} (stride {}), pixel(0,0) = {:#010x}",
        image.width(),
        image.height(),
        image.stride(),
        image.pixel_u32(0, 0).unwrap_or(0)
    );

    // Share the surface under a global name and open it again.
    let name = surface.flink()?;
    let alias = DrmSurface::create_for_name(device, name, Format::Argb32, size, size, surface.stride())?;
    info!("Flinked as name {} (handle {:?})", name, alias.bo().map(|bo| bo.handle()));

    // Glyphs.
    let mut fallbacks = 0;
    for glyph in 0..256u32 {
        let key = GlyphKey { font: 1, glyph };
        let extent = 8 + glyph % 24;
        let status = device.get_glyph(key, || {
            let mut mask = ImageSurface::new(Format::A8, extent, extent)?;
            mask.data_mut().fill(0xFF);
            Ok(mask)
        })?;
        if status == GlyphStatus::Fallback {
            fallbacks += 1;
        }
    }
    info!("Glyphs: 256 requested, {} fell back", fallbacks);

    // Gradient ramp.
    let pattern = GradientPattern {
        geometry: GradientGeometry::Linear {
            p0: (0.0, 0.0),
            p1: (size as f64, 0.0),
        },
        extend: Extend::Pad,
        stops: vec![
            GradientStop {
                offset: 0.0,
                color: [1.0, 0.0, 0.0, 1.0],
            },
            GradientStop {
                offset: 1.0,
                color: [0.0, 0.0, 1.0, 1.0],
            },
        ],
    };
    let ramp = device.gradient(&pattern)?;
    info!("Gradient ramp: {} texels on handle {}", ramp.width, ramp.bo.handle());

    let snapshot = surface.snapshot()?;
    info!("Snapshot: {:?}", snapshot.map(|bo| bo.handle()));

    device.flush()?;
    Ok(())
}
