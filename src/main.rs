use anyhow::Result;
use clap::Parser;
use env_logger::Env;
use log::{debug, info};
use std::path::PathBuf;

use oci_inventory::dockerfile::DockerFileAnalysis;
use oci_inventory::notifier::VerbosityLevel;
use oci_inventory::{Notifier, ScanOptions, Scanner};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(help = "Image to scan: registry identifier, docker-archive:<path>, oci-archive:<path> or fs:<root>")]
    target: String,

    #[arg(long, help = "Dockerfile analysis JSON to attach to the results")]
    file: Option<PathBuf>,

    #[arg(long, help = "Registry username (falls back to OCI_INVENTORY_REGISTRY_USERNAME)")]
    username: Option<String>,

    #[arg(long, help = "Registry password (falls back to OCI_INVENTORY_REGISTRY_PASSWORD)")]
    password: Option<String>,

    #[arg(long, help = "Platform to pull, e.g. linux/arm64")]
    platform: Option<String>,

    #[arg(long, help = "Directory where fetched image archives are saved")]
    image_save_path: Option<PathBuf>,

    #[arg(long, help = "Identifier reported for a local archive instead of its file name")]
    image_name_and_tag: Option<String>,

    #[arg(long, help = "Fingerprint jars bundled inside fat jars instead of the outer jar")]
    shaded_jars: bool,

    #[arg(long, help = "Skip application (jar) fingerprinting")]
    no_app_vulns: bool,

    #[arg(long = "include", value_name = "GLOB", help = "Capture files matching this glob as manifest files")]
    include: Vec<String>,

    #[arg(long = "exclude", value_name = "GLOB", help = "Ignore in-image paths matching this glob")]
    exclude: Vec<String>,

    #[arg(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Verbose mode (-v for info, -vv for debug, -vvv for trace). Also switches to text-based progress"
    )]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(Env::default())
        .filter_level(VerbosityLevel::from(cli.verbose).to_log_level())
        .init();

    info!("Starting oci-inventory with target: {}", cli.target);
    debug!("Shaded jars: {}, app scanning: {}", cli.shaded_jars, !cli.no_app_vulns);

    let dockerfile_analysis = cli
        .file
        .as_deref()
        .map(DockerFileAnalysis::from_json_file)
        .transpose()?;

    let options = ScanOptions {
        path: cli.target,
        image_name_and_tag: cli.image_name_and_tag,
        username: cli.username,
        password: cli.password,
        platform: cli.platform,
        image_save_path: cli.image_save_path,
        shaded_jars: cli.shaded_jars,
        app_vulns: !cli.no_app_vulns,
        include_globs: cli.include,
        exclude_globs: cli.exclude,
        dockerfile_analysis,
    };

    let scanner = Scanner::with_docker(Notifier::new(cli.verbose));
    let response = scanner.scan(&options)?;

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
