#![forbid(unsafe_code)]

mod raw;

use anyhow::{Context, Result, bail};
use efs_types::{BlockIndex, Geometry, MetadataPair};
use emberfs::{WalkOptions, load_image, walk_tree};
use std::env;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let Some(first) = args.first() else {
        print_usage();
        return Ok(());
    };

    match first.as_str() {
        "analyze" => analyze_cmd(&args[1..]),
        "dump" => dump_cmd(&args[1..]),
        "search" => search_cmd(&args[1..]),
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        // Bare image path: the classic one-shot surface.
        _ => legacy_cmd(&args),
    }
}

fn print_usage() {
    println!("efs-cli — forensic reader for LittleFS flash images\n");
    println!("USAGE:");
    println!("  efs-cli analyze <image> [--block-size N] [--block-count N] [--root A,B] [--json]");
    println!("  efs-cli dump <image> [--mode file|terminal] [--out PATH]");
    println!("  efs-cli search <image> <TERM>");
    println!("  efs-cli <image> [--dump-raw] [--dump-mode file|terminal] [--search TERM]");
    println!("          [--block-size N] [--block-count N]");
    println!();
    println!("Geometry is probed from the image's superblock when not supplied.");
    println!("Exit status is 0 whenever analysis completes, even with corruption");
    println!("reported; non-zero only for unreadable images or unusable geometry.");
}

// ── Flag parsing ────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Flags {
    positional: Vec<String>,
    block_size: Option<u32>,
    block_count: Option<u32>,
    root: Option<MetadataPair>,
    json: bool,
    dump_raw: bool,
    dump_mode: Option<String>,
    search: Option<String>,
    out: Option<PathBuf>,
}

fn parse_flags(args: &[String]) -> Result<Flags> {
    let mut flags = Flags::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--block-size" => {
                let value = iter.next().context("--block-size requires a value")?;
                flags.block_size = Some(value.parse().context("invalid --block-size")?);
            }
            "--block-count" => {
                let value = iter.next().context("--block-count requires a value")?;
                flags.block_count = Some(value.parse().context("invalid --block-count")?);
            }
            "--root" => {
                let value = iter.next().context("--root requires a value like 0,1")?;
                let Some((a, b)) = value.split_once(',') else {
                    bail!("--root expects two block indices separated by a comma");
                };
                let a: u32 = a.trim().parse().context("invalid --root block")?;
                let b: u32 = b.trim().parse().context("invalid --root block")?;
                flags.root = Some(MetadataPair::new(BlockIndex(a), BlockIndex(b)));
            }
            "--json" => flags.json = true,
            "--dump-raw" => flags.dump_raw = true,
            "--dump-mode" | "--mode" => {
                let value = iter.next().context("--dump-mode requires file|terminal")?;
                if value != "file" && value != "terminal" {
                    bail!("--dump-mode must be 'file' or 'terminal', got {value:?}");
                }
                flags.dump_mode = Some(value.clone());
            }
            "--search" => {
                let value = iter.next().context("--search requires a term")?;
                flags.search = Some(value.clone());
            }
            "--out" => {
                let value = iter.next().context("--out requires a path")?;
                flags.out = Some(PathBuf::from(value));
            }
            other if other.starts_with("--") => bail!("unknown flag: {other}"),
            other => flags.positional.push(other.to_owned()),
        }
    }
    Ok(flags)
}

fn geometry_from_flags(flags: &Flags) -> Result<Option<Geometry>> {
    match (flags.block_size, flags.block_count) {
        (Some(size), Some(count)) => {
            let geometry = Geometry::new(size, count)
                .map_err(|err| anyhow::anyhow!("invalid geometry: {err}"))?;
            Ok(Some(geometry))
        }
        (None, None) => Ok(None),
        _ => bail!("--block-size and --block-count must be supplied together"),
    }
}

// ── Commands ────────────────────────────────────────────────────────────────

fn analyze_cmd(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let [image_path] = flags.positional.as_slice() else {
        bail!("analyze requires exactly one image path");
    };
    analyze_image(Path::new(image_path), &flags)
}

fn analyze_image(path: &Path, flags: &Flags) -> Result<()> {
    let geometry = geometry_from_flags(flags)?;
    let image = load_image(path, geometry)
        .with_context(|| format!("failed to open image {}", path.display()))?;

    let mut options = WalkOptions::default();
    if let Some(root) = flags.root {
        options.root = root;
    }
    let report = walk_tree(&image, &options);

    if flags.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report).context("serialize report")?
        );
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

fn dump_cmd(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let [image_path] = flags.positional.as_slice() else {
        bail!("dump requires exactly one image path");
    };
    let bytes = fs::read(image_path).with_context(|| format!("failed to read {image_path}"))?;
    dump_raw(&bytes, flags.dump_mode.as_deref().unwrap_or("file"), flags.out.as_deref())
}

fn dump_raw(bytes: &[u8], mode: &str, out: Option<&Path>) -> Result<()> {
    if mode == "terminal" {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        raw::write_hex_dump(&mut lock, bytes).context("write dump to terminal")?;
    } else {
        let path = out.unwrap_or_else(|| Path::new("raw_dump.hex"));
        let file = fs::File::create(path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = std::io::BufWriter::new(file);
        raw::write_hex_dump(&mut writer, bytes).context("write dump file")?;
        writer.flush().context("flush dump file")?;
        println!("Raw image data dumped to {}", path.display());
    }
    Ok(())
}

fn search_cmd(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let [image_path, term] = flags.positional.as_slice() else {
        bail!("search requires an image path and a term");
    };
    let bytes = fs::read(image_path).with_context(|| format!("failed to read {image_path}"))?;
    search_raw(&bytes, term);
    Ok(())
}

fn search_raw(bytes: &[u8], term: &str) {
    let offsets = raw::search_offsets(bytes, term.as_bytes());
    if offsets.is_empty() {
        println!("Keyword {term:?} not found.");
        return;
    }
    println!("Found keyword {term:?} at {} offset(s):", offsets.len());
    for offset in offsets.iter().take(64) {
        println!("  {offset:#010x}");
    }
    if offsets.len() > 64 {
        println!("  ... {} more", offsets.len() - 64);
    }
}

/// The classic surface: `efs-cli <image> [--dump-raw] [--search TERM] ...`
/// runs the dump/search collaborators and then the full analysis.
fn legacy_cmd(args: &[String]) -> Result<()> {
    let flags = parse_flags(args)?;
    let [image_path] = flags.positional.as_slice() else {
        bail!("expected exactly one image path (or see --help)");
    };
    let path = Path::new(image_path);

    if flags.dump_raw {
        let bytes = fs::read(path).with_context(|| format!("failed to read {image_path}"))?;
        dump_raw(
            &bytes,
            flags.dump_mode.as_deref().unwrap_or("file"),
            flags.out.as_deref(),
        )?;
    }
    if let Some(term) = &flags.search {
        let bytes = fs::read(path).with_context(|| format!("failed to read {image_path}"))?;
        search_raw(&bytes, term);
    }

    analyze_image(path, &flags)
}
