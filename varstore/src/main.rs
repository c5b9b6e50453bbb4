//! Generates an encrypted, authenticated variable store image from a layout
//! descriptor, optionally alongside a C source rendering of it.

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use varstore::crypto::integrity::sha256_hex;
use varstore::export::to_c_source;
use varstore::{load_descriptor, seal, LayoutTree};

#[derive(Parser, Debug)]
#[command(name = "genvarstore", version, about = "Generate variable store FV.")]
struct Cli {
    /// Variable store description file in JSON format.
    #[arg(short = 'd', long = "desc-file")]
    desc_file: PathBuf,

    /// Firmware volume file to output.
    #[arg(short = 'o', long = "fv", default_value = "var_store_enc.fv")]
    fv: PathBuf,

    /// C array file to output.
    #[arg(short = 'c', long = "c-file")]
    c_file: Option<PathBuf>,

    /// Test case name used to prefix the C symbols.
    #[arg(short = 'n', long = "tc", default_value = "tc")]
    tc: String,

    /// Byte used for padding and unset fields.
    #[arg(long, default_value = "0xff", value_parser = parse_byte)]
    filler: u8,
}

fn parse_byte(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    };
    parsed.map_err(|e| format!("`{text}` is not a byte: {e}"))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let descriptor = load_descriptor(&cli.desc_file)
        .with_context(|| format!("load descriptor '{}'", cli.desc_file.display()))?;
    let mut tree = LayoutTree::build(&descriptor, cli.filler).context("build layout")?;
    let sealed = seal(&mut tree).context("seal variable store")?;

    sealed
        .write_image(&cli.fv)
        .with_context(|| format!("write image '{}'", cli.fv.display()))?;
    info!(path = %cli.fv.display(), bytes = sealed.image.len(), sha256 = %sha256_hex(&sealed.image), "wrote image");

    if let Some(c_file) = &cli.c_file {
        std::fs::write(c_file, to_c_source(&sealed, &cli.tc))
            .with_context(|| format!("write C source '{}'", c_file.display()))?;
        info!(path = %c_file.display(), "wrote C source");
    }
    Ok(())
}
