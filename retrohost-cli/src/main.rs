//! retrohost CLI - Create and drive libretro editing projects.
//!
//! Usage:
//!   retrohost [--option key=value ...] <command> <project> ...
//!
//! Examples:
//!   retrohost import Sonic --system megadrive sonic.zip --core genesis.so
//!   retrohost import Willy --system zx jsw.tap --autoload-md5 0x5C00:256:3F2A...
//!   retrohost peek Sonic ram 0xFF0000 16
//!   retrohost poke Sonic rom 0x0200 4E71
//!   retrohost run Sonic --frames 600 --hold start --screenshot title.ppm

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use retrohost_core::input::JoypadButton;
use retrohost_core::{
    ram_fingerprint, AutoLoadLimits, CoreMemory, HostConfig, LibretroCore, MemoryAccess, Project,
    ReadKind, Session, SystemProfile, WriteKind,
};

type CliResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// libretro core host
#[derive(Parser, Debug)]
#[command(name = "retrohost")]
#[command(about = "Host libretro cores and patch their memory")]
struct Args {
    /// Enable debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    trace: bool,

    /// Directory handed to cores as their system directory
    #[arg(long, global = true)]
    system_dir: Option<PathBuf>,

    /// Open this core library instead of the project's own
    #[arg(long = "core-override", global = true)]
    core_override: Option<PathBuf>,

    /// Force a core option, as key=value (repeatable)
    #[arg(long = "option", global = true, value_parser = parse_option)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a project from a game image and take its first snapshot
    Import {
        /// Project directory to create
        project: PathBuf,
        /// Target system (nes, snes, megadrive, mastersystem, zx)
        #[arg(long)]
        system: SystemProfile,
        /// Game image, optionally inside a .zip
        rom: PathBuf,
        /// Project name (defaults to the directory name)
        #[arg(long)]
        name: Option<String>,
        /// Core library to copy into the project
        #[arg(long)]
        core: Option<PathBuf>,
        /// Run until MD5 of RAM matches, as ADDR:LEN:HEX
        #[arg(long)]
        autoload_md5: Option<String>,
        /// Give up auto-loading after this many frames
        #[arg(long)]
        max_frames: Option<u64>,
    },
    /// Show what the project's core reports about itself
    Info { project: PathBuf },
    /// Print memory as hex
    Peek {
        project: PathBuf,
        #[arg(value_enum)]
        space: Space,
        #[arg(value_parser = parse_number)]
        address: u32,
        #[arg(value_parser = parse_number)]
        length: u32,
    },
    /// Write a persisted patch and save it with the project
    Poke {
        project: PathBuf,
        #[arg(value_enum)]
        space: Space,
        #[arg(value_parser = parse_number)]
        address: u32,
        /// Bytes as hex, e.g. 4E71
        bytes: String,
    },
    /// Run frames from the project's snapshot
    Run {
        project: PathBuf,
        #[arg(long, default_value_t = 60)]
        frames: u64,
        /// Joypad button held on port 0 (repeatable)
        #[arg(long)]
        hold: Vec<String>,
        /// Temporary patch applied before running, as ram:ADDR:HEX (repeatable)
        #[arg(long)]
        patch: Vec<String>,
        /// Write the last frame here as a PPM image
        #[arg(long)]
        screenshot: Option<PathBuf>,
    },
    /// Save one of the core's fixed memory regions to a file
    DumpRegion {
        project: PathBuf,
        #[arg(value_enum)]
        region: Region,
        output: PathBuf,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Space {
    Ram,
    Rom,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Region {
    SaveRam,
    Rtc,
    SystemRam,
    VideoRam,
}

impl From<Region> for CoreMemory {
    fn from(region: Region) -> Self {
        match region {
            Region::SaveRam => CoreMemory::SaveRam,
            Region::Rtc => CoreMemory::Rtc,
            Region::SystemRam => CoreMemory::SystemRam,
            Region::VideoRam => CoreMemory::VideoRam,
        }
    }
}

fn parse_option(text: &str) -> Result<(String, String), String> {
    HostConfig::parse_option(text).ok_or_else(|| format!("expected key=value, got {:?}", text))
}

/// Decimal, or hex with a 0x prefix.
fn parse_number(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("bad number {:?}: {}", text, e))
}

fn parse_hex_bytes(text: &str) -> Result<Vec<u8>, String> {
    let digits: Vec<char> = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(format!("odd number of hex digits in {:?}", text));
    }
    digits
        .chunks(2)
        .map(|pair| {
            let byte: String = pair.iter().collect();
            u8::from_str_radix(&byte, 16).map_err(|e| format!("bad hex {:?}: {}", byte, e))
        })
        .collect()
}

fn format_hex(address: u32, bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("{:08X}:", address as usize + row * 16));
        for b in chunk {
            out.push_str(&format!(" {:02X}", b));
        }
        out.push('\n');
    }
    out
}

fn write_kind(space: Space, persisted: bool) -> WriteKind {
    match (space, persisted) {
        (Space::Ram, false) => WriteKind::TemporaryRam,
        (Space::Rom, false) => WriteKind::TemporaryRom,
        (Space::Ram, true) => WriteKind::PersistedRam,
        (Space::Rom, true) => WriteKind::PersistedRom,
    }
}

/// `space:ADDR:HEX`
fn parse_patch(text: &str) -> Result<(Space, u32, Vec<u8>), String> {
    let mut parts = text.splitn(3, ':');
    let (Some(space), Some(address), Some(bytes)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected space:ADDR:HEX, got {:?}", text));
    };
    let space = Space::from_str(space, true)?;
    Ok((space, parse_number(address)?, parse_hex_bytes(bytes)?))
}

/// `ADDR:LEN:HEX`
fn parse_fingerprint(text: &str) -> Result<(u32, usize, String), String> {
    let mut parts = text.splitn(3, ':');
    let (Some(address), Some(length), Some(md5)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(format!("expected ADDR:LEN:HEX, got {:?}", text));
    };
    Ok((parse_number(address)?, parse_number(length)? as usize, md5.to_string()))
}

fn open_core(project: &Project, config: &HostConfig) -> CliResult<LibretroCore> {
    Ok(LibretroCore::open(&project.core_library_path(), config)?)
}

/// Open a project and rebuild its machine from the saved snapshot.
fn reopen(root: &Path, config: &HostConfig) -> CliResult<(Project, Session<LibretroCore>)> {
    let project = Project::open(root)?;
    let core = open_core(&project, config)?;
    let mut session = Session::new(core, project.system());
    session.reopen(&project)?;
    Ok((project, session))
}

fn run_command(command: Command, config: HostConfig, cancel: Arc<AtomicBool>) -> CliResult<()> {
    match command {
        Command::Import {
            project: root,
            system,
            rom,
            name,
            core,
            autoload_md5,
            max_frames,
        } => {
            let name = match name {
                Some(name) => name,
                None => root
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or("project directory has no usable name")?
                    .to_string(),
            };
            let project = Project::create(&root, &name, system, &rom)?;
            eprintln!(
                "Created project: {} ({}, id {})",
                project.name(),
                system,
                project.settings().core_id
            );
            if let Some(library) = core {
                let installed = project.install_core(&library)?;
                eprintln!("Installed core: {}", installed.display());
            }

            let mut session = Session::new(open_core(&project, &config)?, system);
            match autoload_md5 {
                Some(fingerprint) => {
                    let (address, length, md5) = parse_fingerprint(&fingerprint)?;
                    let mut limits = AutoLoadLimits::default().with_cancel(cancel);
                    if let Some(max) = max_frames {
                        limits = limits.with_max_frames(max);
                    }
                    session.setup_with_autoload(
                        &project,
                        ram_fingerprint(address, length, &md5),
                        limits,
                    )?;
                }
                None => {
                    if system.requires_autoload() {
                        warn!(%system, "this system normally needs --autoload-md5");
                    }
                    session.setup(&project)?;
                }
            }
            eprintln!("Snapshot saved: {} bytes", session.state().len());
        }
        Command::Info { project: root } => {
            // Geometry is only reported once a game is loaded.
            let (project, session) = reopen(&root, &config)?;
            let core = session.core();
            let system = core.system_info();
            println!("Project:    {} ({})", project.name(), project.system());
            println!("Core:       {} {}", system.library_name, system.library_version);
            println!("Extensions: {}", system.valid_extensions.join(", "));
            println!("Fullpath:   {}", system.need_fullpath);
            let av = core.av_info();
            println!(
                "Geometry:   {}x{} (max {}x{}) @ {:.2} fps",
                av.geometry.base_width,
                av.geometry.base_height,
                av.geometry.max_width,
                av.geometry.max_height,
                av.timing.fps
            );
            for (key, option) in core.options() {
                println!(
                    "  {} = {}  ({}; {})",
                    key,
                    core.option_value(key).unwrap_or("?"),
                    option.description,
                    option.values.join("|")
                );
            }
        }
        Command::Peek {
            project: root,
            space,
            address,
            length,
        } => {
            let (_project, session) = reopen(&root, &config)?;
            let kind = match space {
                Space::Ram => ReadKind::Ram,
                Space::Rom => ReadKind::Rom,
            };
            let bytes = session.read_bytes(kind, address, length as usize)?;
            print!("{}", format_hex(address, &bytes));
        }
        Command::Poke {
            project: root,
            space,
            address,
            bytes,
        } => {
            let bytes = parse_hex_bytes(&bytes)?;
            let (project, mut session) = reopen(&root, &config)?;
            session.write_bytes(write_kind(space, true), address, &bytes)?;
            session.persist(&project)?;
            eprintln!("Wrote {} bytes at 0x{:X}", bytes.len(), address);
        }
        Command::Run {
            project: root,
            frames,
            hold,
            patch,
            screenshot,
        } => {
            let (_project, mut session) = reopen(&root, &config)?;
            if !patch.is_empty() {
                for text in &patch {
                    let (space, address, bytes) = parse_patch(text)?;
                    session.write_bytes(write_kind(space, false), address, &bytes)?;
                }
                session.reset(true)?;
            }
            for name in &hold {
                let button =
                    JoypadButton::from_name(name).ok_or_else(|| format!("unknown button {:?}", name))?;
                session.core_mut().input_mut().set_button(0, button, true);
            }

            let mut ran = 0;
            while ran < frames && !cancel.load(Ordering::Relaxed) {
                session.run_frame()?;
                ran += 1;
            }
            let (video, audio) = session.core().counters();
            info!(frames = ran, video, audio, "run finished");
            eprintln!("Ran {} frames", ran);

            if let Some(path) = screenshot {
                let frame = session.core().frame();
                if frame.pixels.is_empty() {
                    return Err("the core produced no frame".into());
                }
                std::fs::write(&path, frame.to_ppm())?;
                eprintln!("Screenshot: {} ({}x{})", path.display(), frame.width, frame.height);
            }
        }
        Command::DumpRegion {
            project: root,
            region,
            output,
        } => {
            let (_project, mut session) = reopen(&root, &config)?;
            let data = session
                .core_mut()
                .memory_region(region.into())
                .ok_or_else(|| format!("core exposes no {:?} region", region))?;
            std::fs::write(&output, &data)?;
            eprintln!("Dumped {} bytes to {}", data.len(), output.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let default_level = if args.trace { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut config = HostConfig::from_env();
    if let Some(dir) = args.system_dir {
        config = config.with_system_directory(dir);
    }
    if let Some(path) = args.core_override {
        config = config.with_core_override(path);
    }
    for (key, value) in args.options {
        config = config.with_option(key, value);
    }

    // Ctrl-C stops auto-loading and frame runs between frames.
    let cancel = Arc::new(AtomicBool::new(false));
    let signal_flag = Arc::clone(&cancel);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_flag.store(true, Ordering::Relaxed);
        }
    });

    // Cores are not thread-safe; everything runs on one blocking thread.
    let command = args.command;
    let result = tokio::task::spawn_blocking(move || run_command(command, config, cancel)).await?;

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number_accepts_hex_and_decimal() {
        assert_eq!(parse_number("0x5C00"), Ok(0x5C00));
        assert_eq!(parse_number("256"), Ok(256));
        assert!(parse_number("0xZZ").is_err());
    }

    #[test]
    fn test_parse_hex_bytes() {
        assert_eq!(parse_hex_bytes("4E 71"), Ok(vec![0x4E, 0x71]));
        assert!(parse_hex_bytes("4E7").is_err());
    }

    #[test]
    fn test_parse_patch() {
        let (space, address, bytes) = parse_patch("rom:0x200:00FF").unwrap();
        assert!(matches!(space, Space::Rom));
        assert_eq!(address, 0x200);
        assert_eq!(bytes, vec![0x00, 0xFF]);
        assert!(parse_patch("ram:10").is_err());
    }

    #[test]
    fn test_parse_fingerprint_keeps_digest_text() {
        let (address, length, md5) = parse_fingerprint("0x4000:6912:abc123").unwrap();
        assert_eq!((address, length), (0x4000, 6912));
        assert_eq!(md5, "abc123");
    }

    #[test]
    fn test_format_hex_rows() {
        let text = format_hex(0x10, &[0xAB; 18]);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("00000020: AB AB"));
    }
}
