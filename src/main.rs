use clap::{Parser, Subcommand};
use sfv6::assets::{pack, unpack, PackOptions, UnpackOptions};
use sfv6::header::ContainerHeader;
use sfv6::recovery::{recover, scan_report, ScanConfig};
use sfv6::typetree::TypeTree;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sfv6", about = "Unpack and rebuild version-6 SerializedFile asset containers")]
struct Cli {
    /// More log output (-v info, -vv debug, -vvv trace); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Split a container into objects/, metadata.bin and manifest.json
    Unpack {
        input: PathBuf,
        #[arg(short = 'C', long, default_value = ".")]
        output_dir: PathBuf,
        /// Do not recover m_Name for object file names
        #[arg(long)]
        no_names: bool,
    },
    /// Rebuild a container from an unpacked directory
    Pack {
        input_dir: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Original container, used for payload files that are missing
        #[arg(short, long)]
        source: Option<PathBuf>,
    },
    /// Show header fields and the recovered object table
    Info {
        input: PathBuf,
    },
    /// List every object-table candidate the scanner considered
    Scan {
        input: PathBuf,
    },
    /// Dump the embedded type trees
    Types {
        input: PathBuf,
        /// Only this class id
        #[arg(long)]
        class: Option<i32>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {

        // ── Unpack ───────────────────────────────────────────────────────────
        Commands::Unpack { input, output_dir, no_names } => {
            let opts = UnpackOptions { extract_names: !no_names, ..UnpackOptions::default() };
            let s = unpack(&input, &output_dir, &opts)?;
            println!("Unpacked {} object(s) ({} named, {} B) to: {}",
                     s.objects, s.named, s.payload_bytes, output_dir.display());
            println!("  table at metadata +{} ({})", s.table_offset, s.layout);
        }

        // ── Pack ─────────────────────────────────────────────────────────────
        Commands::Pack { input_dir, output, source } => {
            let opts = PackOptions { source, ..PackOptions::default() };
            let s = pack(&input_dir, &output, &opts)?;
            println!("Created: {} ({} B, {} object(s))", output.display(), s.file_size, s.objects);
            if s.from_source > 0 {
                println!("  {} payload(s) copied from source", s.from_source);
            }
            if s.relocated {
                println!("  object table found at metadata +{} (moved)", s.table_offset);
            }
        }

        // ── Info ─────────────────────────────────────────────────────────────
        Commands::Info { input } => {
            let bytes = std::fs::read(&input)?;
            let hdr = ContainerHeader::parse(&bytes)?;
            let meta = &bytes[hdr.meta_start() as usize..hdr.file_size as usize];
            let (types, types_end) = TypeTree::parse(meta)?;

            println!("── SerializedFile ───────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Version        {}", hdr.version);
            println!("  File size      {} B", hdr.file_size);
            println!("  Metadata       {} B at {}", hdr.meta_size, hdr.meta_start());
            println!("  Data region    {} B at {}", hdr.data_len(), hdr.data_base());
            println!("  Endian         {:?}", types.endian);
            println!("  Types          {} ({} nodes)", types.len(), types.node_count());

            match recover(meta, types.endian, types_end, hdr.data_len(), &ScanConfig::default()) {
                Ok(t) => {
                    println!("  Table offset   {}", t.table_offset);
                    println!("  Record layout  {} ({} B)", t.layout.name(), t.layout.width());
                    println!("  Objects        {}", t.count);
                    println!("  Valid / mono   {:.4} / {:.4}", t.valid_ratio, t.mono_ratio);
                }
                Err(e) => println!("  Table          {e}"),
            }
        }

        // ── Scan ─────────────────────────────────────────────────────────────
        Commands::Scan { input } => {
            let bytes = std::fs::read(&input)?;
            let hdr = ContainerHeader::parse(&bytes)?;
            let meta = &bytes[hdr.meta_start() as usize..hdr.file_size as usize];
            let (types, types_end) = TypeTree::parse(meta)?;
            let report = scan_report(meta, types.endian, types_end, hdr.data_len(), &ScanConfig::default());

            println!("{:>10} {:<12} {:>8} {:>8} {:>8}", "Offset", "Layout", "Count", "Valid", "Mono");
            for c in &report.candidates {
                println!("{:>10} {:<12} {:>8} {:>8.4} {:>8.4}",
                         c.table_offset, c.layout.name(), c.count, c.valid_ratio(), c.mono_ratio());
            }
            println!("{}", report.summary());
        }

        // ── Types ────────────────────────────────────────────────────────────
        Commands::Types { input, class } => {
            let bytes = std::fs::read(&input)?;
            let hdr = ContainerHeader::parse(&bytes)?;
            let (types, _) = TypeTree::parse(&bytes[hdr.meta_start() as usize..hdr.file_size as usize])?;
            let classes: Vec<i32> = match class {
                Some(id) => vec![id],
                None     => types.classes().collect(),
            };
            for id in classes {
                match types.dump(id) {
                    Some(text) => println!("── class {id} ──\n{text}"),
                    None       => eprintln!("No type tree for class {id}"),
                }
            }
        }
    }

    Ok(())
}

// ── helpers ──────────────────────────────────────────────────────────────────

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
