//! svox-render - render an N3-tree to a PNG from an orbit camera.
//!
//! Usage: cargo run --release -p svox-cli -- [OPTIONS]
//!
//! Options:
//!   --config <FILE>     JSON render config (default: built-in defaults)
//!   --tree <FILE>       Tree file to render (default: demo sphere from the config)
//!   --out <FILE>        Output PNG (default: render.png)
//!   --save-tree <FILE>  Also write the rendered tree to disk
//!   --print-config      Print the effective config as JSON and exit

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Instant;

use image::ImageEncoder;

use svox::config::RenderConfig;
use svox::io;
use svox::render::RayBatch;
use svox::{Error, N3Tree, Result};

fn main() {
    svox::core::logging::init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

fn run(args: &[String]) -> Result<()> {
    let config = match parse_path_arg(args, "--config") {
        Some(path) => RenderConfig::load(&path)?,
        None => RenderConfig::default(),
    };
    if args.iter().any(|a| a == "--print-config") {
        println!("{}", config.to_json()?);
        return Ok(());
    }
    let out = parse_path_arg(args, "--out").unwrap_or_else(|| PathBuf::from("render.png"));

    let tree = match parse_path_arg(args, "--tree") {
        Some(path) => io::load_tree(&path)?,
        None => {
            log::info!(
                "no tree given, building demo sphere (n = {}, depth {})",
                config.sphere.n, config.sphere.max_depth
            );
            config.sphere.build()?
        }
    };
    if let Some(path) = parse_path_arg(args, "--save-tree") {
        io::save_tree(&path, &tree)?;
    }

    let start = Instant::now();
    let rgba = render(&tree, &config)?;
    log::info!(
        "rendered {}x{} ({} tiles, {} leaves, {:.1} MiB) in {:.2?}",
        config.width,
        config.height,
        tree.tile_count(),
        tree.leaf_count(),
        tree.memory_usage() as f64 / (1024.0 * 1024.0),
        start.elapsed()
    );

    write_png(&out, &rgba, config.width, config.height)?;
    log::info!("wrote {}", out.display());
    Ok(())
}

/// Render to 8-bit RGBA, gamma corrected
fn render(tree: &N3Tree, config: &RenderConfig) -> Result<Vec<u8>> {
    let (origins, dirs) = config.camera().generate_rays(config.width, config.height);
    let rays = RayBatch::primary(&origins, &dirs)?;
    let pixels = tree.render(&rays, &config.render)?;

    let channels = config.render.output_channels();
    let mut rgba = Vec::with_capacity(rays.len() * 4);
    for px in pixels.chunks_exact(channels) {
        for &c in &px[..3] {
            // Simple tone mapping: clamp and gamma correct
            rgba.push((c.clamp(0.0, 1.0).powf(1.0 / 2.2) * 255.0) as u8);
        }
        let alpha = if channels == 4 { px[3] } else { 1.0 };
        rgba.push((alpha.clamp(0.0, 1.0) * 255.0) as u8);
    }
    Ok(rgba)
}

fn write_png(path: &Path, rgba: &[u8], width: u32, height: u32) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    image::codecs::png::PngEncoder::new(writer)
        .write_image(rgba, width, height, image::ExtendedColorType::Rgba8)
        .map_err(|e| Error::Io(std::io::Error::other(e)))
}

fn parse_path_arg(args: &[String], flag: &str) -> Option<PathBuf> {
    args.iter().position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}
