//! sonda - Query protobuf payloads with path expressions
//!
//! This tool loads compiled `FileDescriptorSet` blobs into a descriptor
//! catalog, compiles a path-expression query against it, runs the query
//! over a serialized payload and prints one result row per line.

use anyhow::{bail, Context, Result};
use clap::Parser;
use sonda_core::{Catalog, Query};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// File extensions treated as serialized descriptor sets when loading a
/// directory
const DESCRIPTOR_EXTENSIONS: &[&str] = &["pb", "binpb", "desc"];

/// Query protobuf payloads with path expressions
#[derive(Parser, Debug)]
#[command(name = "sonda")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Descriptor set to load, as [NAME=]PATH (default name: "default").
    /// PATH may be a file or a directory of descriptor files.
    #[arg(short = 's', long = "descriptor-set", required = true)]
    descriptor_sets: Vec<String>,

    /// Query, e.g. 'pkg.Message:field.sub[*]' (empty path renders JSON)
    query: String,

    /// Payload file ('-' reads standard input)
    #[arg(default_value = "-")]
    payload: PathBuf,

    /// Interpret the payload as hex text instead of raw bytes
    #[arg(long)]
    hex: bool,

    /// Maximum number of result rows
    #[arg(short, long)]
    limit: Option<u64>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let catalog = build_catalog(&cli.descriptor_sets)?;

    let mut query = Query::new(&catalog, &cli.query, cli.limit)
        .with_context(|| format!("failed to compile query: {}", cli.query))?;
    debug!("query compiled");

    let payload = read_payload(&cli.payload, cli.hex)?;
    trace!("payload: {} bytes", payload.len());

    let rows = query
        .run(&payload)
        .context("failed to run query over payload")?;
    info!("query ran, {} row(s)", rows.len());

    for row in rows {
        println!("{row}");
    }
    Ok(())
}

/// Loads every requested descriptor set into a fresh catalog
fn build_catalog(specs: &[String]) -> Result<Catalog> {
    let mut catalog = Catalog::new();
    for spec in specs {
        let (name, path) = parse_set_spec(spec);
        let path = Path::new(path);
        if path.is_dir() {
            load_descriptor_dir(&mut catalog, name, path)?;
        } else {
            load_descriptor_file(&mut catalog, name, path)?;
        }
    }
    if catalog.is_empty() {
        bail!("no descriptor sets were loaded");
    }
    Ok(catalog)
}

/// Splits a [NAME=]PATH descriptor-set argument
fn parse_set_spec(spec: &str) -> (&str, &str) {
    match spec.split_once('=') {
        Some((name, path)) if !name.is_empty() => (name, path),
        _ => ("default", spec),
    }
}

fn load_descriptor_file(catalog: &mut Catalog, name: &str, path: &Path) -> Result<()> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read descriptor set: {}", path.display()))?;
    catalog
        .add_set_bytes(name, &bytes)
        .with_context(|| format!("failed to load descriptor set: {}", path.display()))?;
    debug!("loaded {} into set '{}'", path.display(), name);
    Ok(())
}

/// Walks a directory and merges every descriptor file into one set
fn load_descriptor_dir(catalog: &mut Catalog, name: &str, dir: &Path) -> Result<()> {
    info!("scanning directory: {}", dir.display());
    let mut loaded = 0usize;

    for entry in WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() || !is_descriptor_file(path) {
            trace!("skipping {}", path.display());
            continue;
        }
        if let Err(e) = load_descriptor_file(catalog, name, path) {
            // Keep going: directories may mix descriptor blobs with noise
            warn!("{e:#}");
            continue;
        }
        loaded += 1;
    }

    if loaded == 0 {
        bail!("no descriptor files found under {}", dir.display());
    }
    info!("loaded {} descriptor file(s) into set '{}'", loaded, name);
    Ok(())
}

fn is_descriptor_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| DESCRIPTOR_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reads the payload from a file or stdin, optionally decoding hex text
fn read_payload(path: &Path, hex: bool) -> Result<Vec<u8>> {
    let raw = if path == Path::new("-") {
        let mut buf = Vec::new();
        std::io::stdin()
            .read_to_end(&mut buf)
            .context("failed to read payload from stdin")?;
        buf
    } else {
        fs::read(path).with_context(|| format!("failed to read payload: {}", path.display()))?
    };

    if hex {
        let text = String::from_utf8(raw).context("hex payload is not valid UTF-8")?;
        decode_hex(&text)
    } else {
        Ok(raw)
    }
}

/// Decodes hex text, ignoring whitespace and an optional \x or 0x prefix
fn decode_hex(text: &str) -> Result<Vec<u8>> {
    let text = text.trim();
    let text = text
        .strip_prefix("\\x")
        .or_else(|| text.strip_prefix("0x"))
        .unwrap_or(text);

    let digits: Vec<u8> = text
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .map(|b| match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => bail!("invalid hex digit: {}", b as char),
        })
        .collect::<Result<_>>()?;

    if digits.len() % 2 != 0 {
        bail!("hex payload has an odd number of digits");
    }
    Ok(digits
        .chunks_exact(2)
        .map(|pair| (pair[0] << 4) | pair[1])
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_set_spec() {
        assert_eq!(parse_set_spec("schema.binpb"), ("default", "schema.binpb"));
        assert_eq!(parse_set_spec("mine=a/b.pb"), ("mine", "a/b.pb"));
        assert_eq!(parse_set_spec("=weird"), ("default", "=weird"));
    }

    #[test]
    fn test_is_descriptor_file() {
        assert!(is_descriptor_file(Path::new("a/schema.binpb")));
        assert!(is_descriptor_file(Path::new("schema.PB")));
        assert!(!is_descriptor_file(Path::new("readme.md")));
        assert!(!is_descriptor_file(Path::new("no_extension")));
    }

    #[test]
    fn test_decode_hex() {
        assert_eq!(decode_hex("0A02 6869").unwrap(), vec![0x0A, 0x02, 0x68, 0x69]);
        assert_eq!(decode_hex("\\xDEAD").unwrap(), vec![0xDE, 0xAD]);
        assert_eq!(decode_hex("0xff").unwrap(), vec![0xFF]);
        assert!(decode_hex("abc").is_err());
        assert!(decode_hex("zz").is_err());
        assert!(decode_hex("").unwrap().is_empty());
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
