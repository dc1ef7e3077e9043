mod disassemble;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use fixkit_image::{file::ImageFile, scanner::Pattern};
use hundredline_fix::signatures::{self, FixKind};
use itertools::Itertools;

#[derive(Parser)]
#[command(version, about = "Check fix signatures against a game executable")]
enum Commands {
    Scan(CommandScan),
    Info(CommandInfo),
}

#[derive(Parser)]
struct CommandScan {
    /// Game executable to scan
    exe: PathBuf,

    /// An additional pattern to scan for (can be specified multiple times)
    #[arg(short, long, value_parser(|s: &_| Pattern::new(s)))]
    pattern: Vec<Pattern>,

    /// Show disassembly for each match
    #[arg(short, long)]
    disassemble: bool,
}

#[derive(Parser)]
struct CommandInfo {
    /// Game executable to inspect
    exe: PathBuf,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Commands::parse() {
        Commands::Scan(command) => scan(command),
        Commands::Info(command) => info(command),
    }
}

fn exe_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct NamedPattern {
    name: String,
    kind: FixKind,
    pattern: Pattern,
}

fn scan(command: CommandScan) -> Result<()> {
    use colored::Colorize;
    use prettytable::{row, Table};

    let data = fs::read(&command.exe)
        .with_context(|| format!("could not read {}", command.exe.display()))?;
    let file = ImageFile::parse(&data)?;
    let name = exe_name(&command.exe);

    println!(
        "{name}: timestamp {} ({:#x}), image base {:#x}",
        file.timestamp(),
        file.timestamp(),
        file.image_base()
    );

    let patterns = signatures::ALL
        .iter()
        .map(|s| {
            Ok(NamedPattern {
                name: s.name.to_string(),
                kind: s.kind,
                pattern: s.pattern()?,
            })
        })
        .chain(command.pattern.into_iter().enumerate().map(|(i, pattern)| {
            Ok(NamedPattern {
                name: format!("pattern {i}"),
                kind: FixKind::Hook,
                pattern,
            })
        }))
        .collect::<Result<Vec<_>>>()?;

    tracing::debug!(
        "scanning {} executable sections for {} patterns",
        file.executable_sections().count(),
        patterns.len()
    );
    let results = file.scan_all(&patterns.iter().map(|p| &p.pattern).collect_vec());

    let mut table = Table::new();
    table.set_titles(row!["fix", "status", "match", "target", "boundary"]);

    for (named, matches) in patterns.iter().zip(&results) {
        let status = match matches.len() {
            0 => "NOT FOUND".red(),
            1 => "OK".green(),
            n => format!("AMBIGUOUS ({n})").yellow(),
        };

        let first = matches.first().copied();
        let rva = |address: usize| rva_string(&file, &name, address);
        let boundary = match (named.kind, first) {
            (FixKind::Patch, Some(_)) => "patch".normal(),
            (FixKind::Hook, Some(address)) => {
                let on_boundary = file.section_containing(address).is_some_and(|section| {
                    disassemble::on_instruction_boundary(
                        &section.data[address - section.address..],
                        address,
                        named.pattern.custom_offset,
                    )
                });
                if on_boundary {
                    "yes".green()
                } else {
                    "NO".red()
                }
            }
            (_, None) => "".normal(),
        };

        table.add_row(row![
            named.name,
            status,
            first.map(rva).unwrap_or_default(),
            first
                .map(|a| rva(named.pattern.hook_address(a)))
                .unwrap_or_default(),
            boundary
        ]);
    }
    table.printstd();

    if command.disassemble {
        for (named, matches) in patterns.iter().zip(&results) {
            for &address in matches {
                println!("{} {}", named.name.bold(), rva_string(&file, &name, address));
                println!(
                    "{}",
                    disassemble::disassemble(&file, address, &named.pattern)
                );
            }
        }
    }

    Ok(())
}

fn rva_string(file: &ImageFile, name: &str, address: usize) -> String {
    format!("{name}+{:x}", file.rva(address))
}

fn info(command: CommandInfo) -> Result<()> {
    use prettytable::{row, Table};

    let data = fs::read(&command.exe)
        .with_context(|| format!("could not read {}", command.exe.display()))?;
    let file = ImageFile::parse(&data)?;

    println!("{}", exe_name(&command.exe));
    println!("timestamp:     {} ({:#x})", file.timestamp(), file.timestamp());
    println!("image base:    {:#x}", file.image_base());
    println!("size of image: {:#x}", file.headers.size_of_image);

    let mut table = Table::new();
    table.set_titles(row!["section", "address", "size", "kind"]);
    for section in &file.sections {
        table.add_row(row![
            section.name,
            format!("{:#x}", section.address),
            format!("{:#x}", section.data.len()),
            format!("{:?}", section.kind),
        ]);
    }
    table.printstd();

    Ok(())
}
