use std::fs::File;
use std::path::Path;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vhd::{Detection, FooterOptions, PartitionTableAnalyzer, VhdFooter};
use wimextract::config::ARCHIVER_ENV;
use wimextract::{Config, Extractor};

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("vhd=info,wimextract=info"));

    let subscriber = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).compact());

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn usage(program: &str) -> ! {
    eprintln!("Usage:");
    eprintln!("  {program} append <image>");
    eprintln!("  {program} inspect <image>");
    eprintln!("  {program} extract <wim> <index> <src> <dst>");
    std::process::exit(1);
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("vhd");

    match (args.get(1).map(String::as_str), &args[args.len().min(2)..]) {
        (Some("append"), [image]) => {
            let footer = vhd::append_footer(Path::new(image), &FooterOptions::default())?;
            println!("VHD footer: {footer:X?}");
        }
        (Some("inspect"), [image]) => inspect(Path::new(image))?,
        (Some("extract"), [wim, index, src, dst]) => {
            let index: u32 = index
                .parse()
                .with_context(|| format!("Invalid image index '{index}'"))?;
            let mut extractor =
                Extractor::with_config(&Config::from_env()).on_complete(|| info!("Extraction complete"));
            if !extractor.capabilities().is_available("7z") {
                info!("7-Zip not found, set {ARCHIVER_ENV} to use a specific executable");
            }
            extractor.extract(Path::new(wim), index, src, Path::new(dst))?;
        }
        _ => usage(program),
    }

    Ok(())
}

fn inspect(path: &Path) -> anyhow::Result<()> {
    let report = vhd::classify_image(path, &PartitionTableAnalyzer);
    println!("{report:#?}");
    if let Some(extension) = report.compression_type.extension() {
        println!("Compressed image ({extension}), footer not checked");
    }

    if report.is_vhd {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        if let Detection::Fixed(vhd) = vhd::detect(&file, size)? {
            println!("VHD footer: {:X?}", vhd.footer);
            println!(
                "Disk type: {}",
                VhdFooter::disk_type_name(vhd.footer.disk_type.get())
            );
            println!("Geometry: {:?}", vhd.footer.geometry());
        }
    }

    anyhow::ensure!(report.is_bootable_img, "{} is not a bootable image", path.display());
    Ok(())
}
