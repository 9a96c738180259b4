use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use cs2bin::{decode_script, FormatFlags, ScrambleMap};
use scribe_core::{Diagnostic, Session, SignatureDb};

#[derive(Parser)]
#[command(name = "scribe", about = "CS2 script decompiler and compiler")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Format/session options shared by every command.
#[derive(Args)]
struct SessionArgs {
    /// Signature database file (export format); the bundled table is used
    /// as the base either way.
    #[arg(long)]
    sigs: Option<PathBuf>,
    /// Opcode scramble map file: one `canonical disk` pair per line.
    #[arg(long)]
    scramble: Option<PathBuf>,
    /// Target build has no switch opcode.
    #[arg(long)]
    disable_switches: bool,
    /// Target build has no 64-bit immediates.
    #[arg(long)]
    disable_longs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Decompile a compiled script buffer to source text.
    Decompile {
        /// Path to the `.dat` buffer.
        input: PathBuf,
        /// Script id; defaults to the numeric part of the file stem.
        #[arg(long)]
        id: Option<u32>,
        /// Write the source here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Compile a source file to a script buffer.
    Compile {
        /// Path to the `.cs2` source.
        input: PathBuf,
        /// Output buffer path; defaults to the input with a `.dat` extension.
        #[arg(long)]
        out: Option<PathBuf>,
        /// Print a disassembly listing to stderr (also on failure).
        #[arg(long)]
        disasm: bool,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Regenerate inferred signatures from a directory of `<id>.dat` files.
    Sigs {
        /// Directory holding the corpus.
        corpus: PathBuf,
        /// Fixed-point iteration cap.
        #[arg(long, default_value_t = 8)]
        iterations: usize,
        /// Write the exported table here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Parse a source file and dump its AST as JSON.
    DumpAst {
        /// Path to the `.cs2` source.
        input: PathBuf,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Show header information for a compiled script buffer.
    Info {
        /// Path to the `.dat` buffer.
        input: PathBuf,
        /// Script id; defaults to the numeric part of the file stem.
        #[arg(long)]
        id: Option<u32>,
        #[command(flatten)]
        session: SessionArgs,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Decompile {
            input,
            id,
            out,
            session,
        } => decompile(&input, id, out.as_deref(), &session),
        Command::Compile {
            input,
            out,
            disasm,
            session,
        } => compile(&input, out.as_deref(), disasm, &session),
        Command::Sigs {
            corpus,
            iterations,
            out,
            session,
        } => sigs(&corpus, iterations, out.as_deref(), &session),
        Command::DumpAst { input, session } => dump_ast(&input, &session),
        Command::Info { input, id, session } => info(&input, id, &session),
    }
}

fn build_session(args: &SessionArgs) -> Result<Session> {
    let mut db = SignatureDb::with_canonical_table();
    if let Some(path) = &args.sigs {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read signature table: {}", path.display()))?;
        db.import(&text)
            .with_context(|| format!("failed to parse signature table: {}", path.display()))?;
    }

    let scramble = match &args.scramble {
        None => ScrambleMap::identity(),
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read scramble map: {}", path.display()))?;
            let mut pairs = Vec::new();
            for (lineno, line) in text.lines().enumerate() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let mut parts = line.split_whitespace();
                let (Some(canonical), Some(disk), None) =
                    (parts.next(), parts.next(), parts.next())
                else {
                    bail!(
                        "{}:{}: expected `canonical disk`",
                        path.display(),
                        lineno + 1
                    );
                };
                pairs.push((canonical.parse()?, disk.parse()?));
            }
            ScrambleMap::from_pairs(&pairs)
                .with_context(|| format!("invalid scramble map: {}", path.display()))?
        }
    };

    Ok(Session::new(
        db,
        scramble,
        FormatFlags {
            disable_switches: args.disable_switches,
            disable_longs: args.disable_longs,
        },
    ))
}

/// Script id from `--id` or the numeric part of the file stem.
fn script_id(path: &Path, id: Option<u32>) -> Result<u32> {
    if let Some(id) = id {
        return Ok(id);
    }
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let digits: String = stem.chars().filter(|c| c.is_ascii_digit()).collect();
    digits
        .parse()
        .with_context(|| format!("cannot derive a script id from {stem:?}; pass --id"))
}

fn report_diagnostics(tag: &str, diags: &[Diagnostic]) {
    for d in diags {
        eprintln!("[{tag}] warning: {d:?}");
    }
}

fn decompile(input: &Path, id: Option<u32>, out: Option<&Path>, args: &SessionArgs) -> Result<()> {
    let session = build_session(args)?;
    let id = script_id(input, id)?;
    let bytes =
        fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let (func, diags) = session
        .decompile(&bytes, id)
        .with_context(|| format!("failed to decompile script {id}"))?;
    report_diagnostics("decompile", &diags);

    let text = session.print(&func);
    match out {
        Some(path) => {
            fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("[decompile] wrote {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn compile(input: &Path, out: Option<&Path>, disasm: bool, args: &SessionArgs) -> Result<()> {
    let session = build_session(args)?;
    let src = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let (func, diags) = session.parse(&src)?;
    report_diagnostics("compile", &diags);

    let mut listing = String::new();
    let result = session.compile(&func, disasm.then_some(&mut listing));
    if disasm && !listing.is_empty() {
        eprint!("{listing}");
    }
    let bytes = result?;

    let out = out
        .map(Path::to_path_buf)
        .unwrap_or_else(|| input.with_extension("dat"));
    fs::write(&out, bytes).with_context(|| format!("failed to write {}", out.display()))?;
    eprintln!("[compile] wrote {}", out.display());
    Ok(())
}

fn sigs(corpus_dir: &Path, iterations: usize, out: Option<&Path>, args: &SessionArgs) -> Result<()> {
    let mut session = build_session(args)?;

    let mut corpus = BTreeMap::new();
    for entry in fs::read_dir(corpus_dir)
        .with_context(|| format!("failed to read {}", corpus_dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("dat") {
            continue;
        }
        let Ok(id) = script_id(&path, None) else {
            eprintln!("[sigs] skipping {} (no script id)", path.display());
            continue;
        };
        corpus.insert(id, fs::read(&path)?);
    }
    if corpus.is_empty() {
        bail!("no .dat files found in {}", corpus_dir.display());
    }
    eprintln!("[sigs] corpus: {} scripts", corpus.len());

    let report = session.generate_signatures(&corpus, iterations);
    eprintln!(
        "[sigs] {} passes, {} inferred entries, {} scripts skipped",
        report.passes,
        report.inferred,
        report.skipped.len()
    );
    for id in &report.skipped {
        eprintln!("[sigs] skipped script {id}: failed to decode");
    }

    let text = session.db.export();
    match out {
        Some(path) => {
            fs::write(path, text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("[sigs] wrote {}", path.display());
        }
        None => print!("{text}"),
    }
    Ok(())
}

fn dump_ast(input: &Path, args: &SessionArgs) -> Result<()> {
    let session = build_session(args)?;
    let src = fs::read_to_string(input)
        .with_context(|| format!("failed to read {}", input.display()))?;
    let (func, diags) = session.parse(&src)?;
    report_diagnostics("dump-ast", &diags);
    println!("{}", serde_json::to_string_pretty(&func)?);
    Ok(())
}

fn info(input: &Path, id: Option<u32>, args: &SessionArgs) -> Result<()> {
    let session = build_session(args)?;
    let id = script_id(input, id)?;
    let bytes =
        fs::read(input).with_context(|| format!("failed to read {}", input.display()))?;
    let script = decode_script(&bytes, id, &session.scramble, session.flags)?;

    println!("script {id}");
    println!("  parameters:   {}", script.param_codes.len());
    println!(
        "  locals:       {} int, {} string, {} long",
        script.int_locals, script.string_locals, script.long_locals
    );
    println!("  instructions: {}", script.instructions.len());
    let unknown: Vec<u16> = script
        .instructions
        .iter()
        .filter(|i| {
            i.core().is_none()
                && session
                    .db
                    .resolve(scribe_core::SigKey::Opcode(i.opcode))
                    .is_none()
        })
        .map(|i| i.opcode)
        .collect();
    if !unknown.is_empty() {
        println!("  unknown opcodes: {unknown:?}");
    }
    Ok(())
}
