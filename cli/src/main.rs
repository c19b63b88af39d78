use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{debug, info};
use ntfsrw::directory;
use ntfsrw::structures::*;
use ntfsrw::timestamps::filetime_to_datetime;
use ntfsrw::{format, FileDevice, FormatOptions, NtfsFile, Volume, VolumeConfig};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "ntfsrw")]
#[command(about = "Create and inspect NTFS volume images", long_about = None)]
struct Cli {
    /// JSON file with volume settings (caches, read-only, mirror repair)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Raise log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fresh NTFS volume to an image file
    Format {
        image: PathBuf,
        /// Create the image with this size (e.g. 64M); otherwise the existing file is used
        #[arg(short, long)]
        size: Option<String>,
        #[arg(short, long)]
        label: Option<String>,
        #[arg(short, long, default_value_t = 4096)]
        cluster_size: u32,
        #[arg(long, default_value_t = 1024)]
        record_size: u32,
        #[arg(long)]
        serial: Option<u64>,
    },
    /// Show boot sector geometry and space usage
    Info { image: PathBuf },
    /// Dump one MFT record and its attributes
    Record { image: PathBuf, number: u64 },
    /// List a directory by path from the root
    Ls {
        image: PathBuf,
        #[arg(default_value = "/")]
        path: String,
    },
    /// Map every stored cluster to its owner and compare with $Bitmap
    Clusters {
        image: PathBuf,
        /// Print each owned range, not only the summary
        #[arg(short, long)]
        list: bool,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config = match &cli.config {
        Some(path) => VolumeConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => VolumeConfig::default(),
    };

    match cli.command {
        Commands::Format { image, size, label, cluster_size, record_size, serial } => {
            let options = FormatOptions { label, cluster_size, record_size, serial, ..FormatOptions::default() };
            format_image(&image, size.as_deref(), &options, config)
        }
        Commands::Info { image } => {
            let mut volume = open_volume(&image, config)?;
            show_info(&mut volume)
        }
        Commands::Record { image, number } => {
            let mut volume = open_volume(&image, config)?;
            show_record(&mut volume, number)
        }
        Commands::Ls { image, path } => {
            let mut volume = open_volume(&image, config)?;
            list_directory(&mut volume, &path)
        }
        Commands::Clusters { image, list } => {
            let mut volume = open_volume(&image, config)?;
            cluster_map(&mut volume, list)
        }
    }
}

fn parse_size(text: &str) -> anyhow::Result<u64> {
    let text = text.trim();
    let (digits, multiplier) = match text.char_indices().last() {
        Some((i, 'K' | 'k')) => (&text[..i], 1u64 << 10),
        Some((i, 'M' | 'm')) => (&text[..i], 1 << 20),
        Some((i, 'G' | 'g')) => (&text[..i], 1 << 30),
        _ => (text, 1),
    };
    let value: u64 = digits.parse().with_context(|| format!("Invalid size '{}'", text))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size '{}' is too large", text))
}

fn open_volume(image: &Path, config: VolumeConfig) -> anyhow::Result<Volume> {
    let device = FileDevice::open(image, !config.read_only)
        .with_context(|| format!("Failed to open {}", image.display()))?;
    let volume = Volume::open(Box::new(device), config)
        .with_context(|| format!("{} is not a usable NTFS volume", image.display()))?;
    Ok(volume)
}

fn format_image(image: &Path, size: Option<&str>, options: &FormatOptions, config: VolumeConfig) -> anyhow::Result<()> {
    let device = match size {
        Some(size) => {
            let bytes = parse_size(size)?;
            FileDevice::create(image, bytes).with_context(|| format!("Failed to create {}", image.display()))?
        }
        None => FileDevice::open(image, true).with_context(|| format!("Failed to open {}", image.display()))?,
    };
    let mut volume = format(Box::new(device), options, config)?;
    volume.sync()?;
    info!("Formatted {}", image.display());
    println!("Formatted {}", image.display());
    println!("  Clusters: {} of {} bytes", volume.total_clusters(), volume.cluster_size());
    println!("  Free: {} clusters", volume.free_clusters());
    println!("  Serial: {:016X}", volume.boot_sector().volume_serial);
    Ok(())
}

fn show_info(volume: &mut Volume) -> anyhow::Result<()> {
    let geometry = *volume.geometry();
    let boot = volume.boot_sector().clone();
    println!("NTFS volume");
    println!("  Serial: {:016X}", boot.volume_serial);
    println!("  Sector size: {}", geometry.sector_size);
    println!("  Cluster size: {}", geometry.cluster_size);
    println!("  Record size: {}", geometry.record_size);
    println!("  Index block size: {}", geometry.index_block_size);
    println!("  $MFT at LCN {}, $MFTMirr at LCN {}", geometry.mft_lcn, geometry.mftmirr_lcn);
    let total = volume.total_clusters();
    let free = volume.free_clusters();
    println!(
        "  Clusters: {} total, {} free ({:.1}% used)",
        total,
        free,
        (total - free) as f64 * 100.0 / total.max(1) as f64
    );
    let in_use = (0..volume.record_count()).filter(|&n| volume.is_record_allocated(n)).count();
    println!("  MFT records: {} of {} in use", in_use, volume.record_count());

    let volume_file = NtfsFile::open(volume, MFT_RECORD_VOLUME)?;
    let name_key = ntfsrw::AttrKey::unnamed(ATTR_TYPE_VOLUME_NAME);
    if volume_file.has_attribute(&name_key) {
        let raw = volume_file.resident_value(&name_key)?;
        let units = read_utf16(raw, raw.len() / 2)?;
        println!("  Label: {}", from_utf16(&units));
    }
    Ok(())
}

fn format_time(filetime: u64) -> String {
    filetime_to_datetime(filetime)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn show_record(volume: &mut Volume, number: u64) -> anyhow::Result<()> {
    let record = volume.read_record(number)?;
    println!("Record {}", record.reference());
    println!("  Flags: {:#06x}{}", record.header.flags, if record.header.in_use() { " (in use)" } else { "" });
    println!("  Links: {}", record.header.link_count);
    if !record.is_base() {
        println!("  Extension of {}", record.header.base_reference);
        return Ok(());
    }
    if !record.header.in_use() {
        return Ok(());
    }

    let file = NtfsFile::open(volume, number)?;
    println!("  Records: {:?}", file.record_numbers());
    if let Ok(si) = file.standard_information() {
        println!("  Created: {}", format_time(si.creation_time));
        println!("  Modified: {}", format_time(si.modification_time));
        println!("  Attributes: {:#010x}", si.file_attributes);
    }
    for name in file.file_names()? {
        println!("  Name: {} (parent {})", name.name_string(), name.parent);
    }
    println!("  Attributes:");
    for attr in file.attributes() {
        let storage = if attr.resident { "resident".to_string() } else { format!("{} allocated", attr.allocated) };
        println!(
            "    {:<28} {:>12} bytes  {}  flags {:#06x}  records {:?}",
            attr.key.to_string(),
            attr.length,
            storage,
            attr.flags,
            attr.records
        );
        if !attr.resident {
            for (lcn, length) in file.cluster_ranges(&attr.key)? {
                println!("      LCN {}..{}", lcn, lcn + length);
            }
        }
    }
    Ok(())
}

fn list_directory(volume: &mut Volume, path: &str) -> anyhow::Result<()> {
    let mut current = NtfsFile::open(volume, MFT_RECORD_ROOT)?;
    for part in path.split('/').filter(|p| !p.is_empty()) {
        let entry = directory::find_entry(volume, &mut current, part)?
            .ok_or_else(|| anyhow::anyhow!("{} not found in {}", part, path))?;
        if !entry.is_directory() {
            bail!("{} is not a directory", part);
        }
        current = NtfsFile::open_reference(volume, entry.reference)?;
    }
    debug!("Listing directory record {}", current.number());
    for entry in directory::list(volume, &mut current)? {
        let kind = if entry.is_directory() { "<DIR>" } else { "" };
        println!(
            "{:>10} {:>6} {:>14}  {}",
            entry.reference.to_string(),
            kind,
            entry.name.data_size,
            entry.name.name_string()
        );
    }
    Ok(())
}

#[derive(Debug, Default)]
struct ClusterReport {
    owned: u64,
    shared: Vec<(u64, u64, u64)>,
    unmarked: Vec<u64>,
    leaked: Vec<u64>,
}

fn cluster_map(volume: &mut Volume, list: bool) -> anyhow::Result<()> {
    let total = volume.total_clusters();
    let mut owners: Vec<Option<u64>> = vec![None; total as usize];
    let mut report = ClusterReport::default();

    // The boot sectors belong to $Boot, which maps them through its $DATA
    for number in 0..volume.record_count() {
        if !volume.is_record_allocated(number) {
            continue;
        }
        let record = volume.read_record(number)?;
        if !record.is_base() || !record.header.in_use() {
            continue;
        }
        let file = NtfsFile::open(volume, number)?;
        for (key, ranges) in file.all_cluster_ranges()? {
            for (lcn, length) in ranges {
                if list {
                    println!("{:>8} {:<28} LCN {}..{}", number, key.to_string(), lcn, lcn + length);
                }
                for cluster in lcn..lcn + length {
                    let slot = owners
                        .get_mut(cluster as usize)
                        .ok_or_else(|| anyhow::anyhow!("record {} maps LCN {} past the volume", number, cluster))?;
                    match slot {
                        Some(owner) => report.shared.push((cluster, *owner, number)),
                        None => {
                            *slot = Some(number);
                            report.owned += 1;
                        }
                    }
                }
            }
        }
    }

    for (lcn, owner) in owners.iter().enumerate() {
        let lcn = lcn as u64;
        match (owner.is_some(), volume.is_cluster_allocated(lcn)) {
            (true, false) => report.unmarked.push(lcn),
            (false, true) => report.leaked.push(lcn),
            _ => {}
        }
    }

    println!("Clusters: {} total, {} owned, {} free in $Bitmap", total, report.owned, volume.free_clusters());
    for (lcn, first, second) in report.shared.iter().take(20) {
        println!("  LCN {} claimed by records {} and {}", lcn, first, second);
    }
    if !report.unmarked.is_empty() {
        println!("  {} owned clusters are free in $Bitmap (first: {})", report.unmarked.len(), report.unmarked[0]);
    }
    if !report.leaked.is_empty() {
        println!("  {} allocated clusters have no owner (first: {})", report.leaked.len(), report.leaked[0]);
    }
    if report.shared.is_empty() && report.unmarked.is_empty() && report.leaked.is_empty() {
        println!("  Cluster map matches $Bitmap");
        Ok(())
    } else {
        bail!("cluster map disagrees with $Bitmap")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("64M").unwrap(), 64 << 20);
        assert_eq!(parse_size("1g").unwrap(), 1 << 30);
        assert!(parse_size("lots").is_err());
    }

    #[test]
    fn test_fresh_image_has_consistent_cluster_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.img");
        format_image(&path, Some("16M"), &FormatOptions::default(), VolumeConfig::default()).unwrap();
        let mut volume = open_volume(&path, VolumeConfig::default()).unwrap();
        cluster_map(&mut volume, false).unwrap();
        list_directory(&mut volume, "/$Extend").unwrap();
        assert!(list_directory(&mut volume, "/missing").is_err());
    }
}
