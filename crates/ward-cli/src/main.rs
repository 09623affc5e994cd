use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;
use ward_core::config::{parse_seed, ProjectConfig};
use ward_core::module::{read_module, write_module, MethodBody, MethodFlags, Module, ModuleId};
use ward_core::pipeline::{Driver, ModuleSettings, ProtectionSettings};
use ward_core::protections::anti_tamper::meta::{JitTable, NormalTable, JIT_SECTION, NORMAL_SECTION};
use ward_core::protections::anti_tamper::TamperReport;
use ward_core::protections::junk::JUNK_ID;
use ward_core::protections::{
    AntiTamperProtection, IntrospectionProtection, JunkProtection, Protection, ANTI_TAMPER_SERVICE_ID,
};
use ward_core::vm::{assemble, decode};

#[derive(Parser, Debug)]
#[command(name = "ward", version, about = "Ward bytecode module post-processor")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Assemble a .ward source file into a WMOD module
    Assemble {
        /// Input source path
        input: PathBuf,
        /// Output module path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Apply anti-tamper protection to a module
    Protect {
        /// Input module (.wmod, or .ward source)
        input: PathBuf,
        /// Output module path
        #[arg(short, long)]
        output: PathBuf,
        /// Run seed (hex, random if not specified)
        #[arg(short, long)]
        seed: Option<String>,
        /// Anti-tamper mode: normal or jit
        #[arg(short, long, default_value = "normal")]
        mode: String,
        /// Response to a detected modification: reject, corrupt or abort
        #[arg(long, default_value = "reject")]
        on_tamper: String,
        /// Junk instructions per real instruction (junk pass disabled if not set)
        #[arg(long)]
        junk_ratio: Option<u8>,
        /// Leave a method unprotected (repeatable)
        #[arg(long = "exclude", value_name = "NAME")]
        exclude: Vec<String>,
    },
    /// Protect every module listed in a project file
    Project {
        /// Project file (TOML)
        config: PathBuf,
    },
    /// Load a module and invoke one of its methods
    Run {
        /// Module path
        input: PathBuf,
        /// Method name
        method: String,
        /// Integer arguments
        #[arg(allow_negative_numbers = true)]
        args: Vec<i64>,
    },
    /// Show module layout and anti-tamper metadata
    Info {
        /// Module path
        input: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Assemble { input, output } => cmd_assemble(&input, &output),
        Command::Protect {
            input,
            output,
            seed,
            mode,
            on_tamper,
            junk_ratio,
            exclude,
        } => cmd_protect(ProtectArgs {
            input,
            output,
            seed,
            mode,
            on_tamper,
            junk_ratio,
            exclude,
        }),
        Command::Project { config } => cmd_project(&config),
        Command::Run { input, method, args } => cmd_run(&input, &method, &args),
        Command::Info { input } => cmd_info(&input),
    }
}

// ─── helpers ────────────────────────────────────────────────

fn header() {
    println!("WARD CLI v{}", env!("CARGO_PKG_VERSION"));
    println!("────────────────────────────────────────");
}

fn resolve_seed(seed: Option<&str>) -> Result<u64> {
    match seed {
        Some(s) => Ok(parse_seed(s)?),
        None => Ok(rand::random()),
    }
}

/// Read a module from disk. `.ward` files are assembled first.
fn read_input(path: &Path) -> Result<Module> {
    if path.extension().is_some_and(|e| e == "ward") {
        let source = fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return assemble(&source).with_context(|| format!("assembling {}", path.display()));
    }
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    read_module(&bytes).with_context(|| format!("parsing {}", path.display()))
}

fn write_output(path: &Path, module: &Module) -> Result<usize> {
    let bytes = write_module(module)?;
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    fs::write(path, &bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(bytes.len())
}

/// The builtin protections, keeping a typed handle on anti-tamper for its
/// reports.
fn protections() -> (Arc<AntiTamperProtection>, Vec<Arc<dyn Protection>>) {
    let anti_tamper = Arc::new(AntiTamperProtection::new());
    let introspection = Arc::new(IntrospectionProtection::new(anti_tamper.service()));
    let all: Vec<Arc<dyn Protection>> = vec![
        anti_tamper.clone(),
        Arc::new(JunkProtection::new()),
        introspection,
    ];
    (anti_tamper, all)
}

fn print_report(report: Option<TamperReport>) {
    match report {
        Some(r) => {
            println!("[*] Anti-tamper: mode={}, on_tamper={}", r.mode, r.policy);
            println!(
                "[*] Sealed {} method(s), {} body bytes",
                r.methods.len(),
                r.body_bytes
            );
        }
        None => println!("[*] Anti-tamper: no methods selected, module unchanged"),
    }
}

// ─── assemble ───────────────────────────────────────────────

fn cmd_assemble(input: &Path, output: &Path) -> Result<()> {
    let source =
        fs::read_to_string(input).with_context(|| format!("reading {}", input.display()))?;
    let module = assemble(&source).with_context(|| format!("assembling {}", input.display()))?;
    let size = write_output(output, &module)?;
    println!(
        "[*] Assembled '{}': {} method(s), {} bytes → {}",
        module.name,
        module.methods.len(),
        size,
        output.display()
    );
    Ok(())
}

// ─── protect ────────────────────────────────────────────────

struct ProtectArgs {
    input: PathBuf,
    output: PathBuf,
    seed: Option<String>,
    mode: String,
    on_tamper: String,
    junk_ratio: Option<u8>,
    exclude: Vec<String>,
}

fn cmd_protect(args: ProtectArgs) -> Result<()> {
    let seed = resolve_seed(args.seed.as_deref())?;
    header();
    println!("Input:  {}", args.input.display());
    println!("Output: {}", args.output.display());
    println!("Seed:   0x{:016X}", seed);
    println!();

    let module = read_input(&args.input)?;
    println!(
        "[*] Module parsed: '{}', {} method(s), {} section(s)",
        module.name,
        module.methods.len(),
        module.sections.len()
    );

    for name in &args.exclude {
        if module.method_by_name(name).is_none() {
            bail!("--exclude: module '{}' has no method '{}'", module.name, name);
        }
    }
    let targets: Vec<String> = module
        .methods
        .iter()
        .map(|m| m.name.clone())
        .filter(|n| !args.exclude.contains(n))
        .collect();
    if !args.exclude.is_empty() {
        println!("[*] Excluded: {}", args.exclude.join(", "));
    }

    let mut anti_tamper = ProtectionSettings::default()
        .with("mode", &args.mode)
        .with("on_tamper", &args.on_tamper);
    anti_tamper.methods = Some(targets);
    let mut settings = ModuleSettings::new().enable(ANTI_TAMPER_SERVICE_ID, anti_tamper);
    if let Some(ratio) = args.junk_ratio {
        settings = settings.enable(
            JUNK_ID,
            ProtectionSettings::default().with("ratio", &ratio.to_string()),
        );
        println!("[*] Junk code: enabled (ratio={})", ratio);
    }

    let (at, all) = protections();
    let driver = Driver::new(all)?.with_seed(seed);
    let id = ModuleId(0);
    let protected = driver
        .protect(id, module, &settings)
        .with_context(|| format!("protecting {}", args.input.display()))?;
    print_report(at.report(id));

    let size = write_output(&args.output, &protected)?;
    println!("[*] Wrote {} bytes → {}", size, args.output.display());
    Ok(())
}

// ─── project ────────────────────────────────────────────────

fn cmd_project(path: &Path) -> Result<()> {
    let config =
        ProjectConfig::load(path).with_context(|| format!("loading {}", path.display()))?;
    let seed = resolve_seed(config.seed.as_deref())?;
    header();
    println!("Project: {}", path.display());
    println!("Seed:    0x{:016X}", seed);
    println!();

    let (at, all) = protections();
    let driver = Driver::new(all)?.with_seed(seed);

    for (index, entry) in config.modules.iter().enumerate() {
        let id = ModuleId(index as u32);
        let settings = entry.settings(driver.protections())?;
        let module = read_input(&entry.input)?;
        let enabled: Vec<&str> = settings.protections.keys().map(String::as_str).collect();
        println!(
            "[*] {} ('{}'): preset={}, protections=[{}]",
            entry.input.display(),
            module.name,
            entry.preset,
            enabled.join(", ")
        );

        let protected = driver
            .protect(id, module, &settings)
            .with_context(|| format!("protecting {}", entry.input.display()))?;
        if settings.is_enabled(ANTI_TAMPER_SERVICE_ID) {
            print_report(at.report(id));
        }

        let output = entry.output_path();
        let size = write_output(&output, &protected)?;
        println!("[*] Wrote {} bytes → {}", size, output.display());
    }
    Ok(())
}

// ─── run ────────────────────────────────────────────────────

fn cmd_run(input: &Path, method: &str, args: &[i64]) -> Result<()> {
    let bytes = fs::read(input).with_context(|| format!("reading {}", input.display()))?;
    let loaded =
        ward_runtime::load(&bytes).with_context(|| format!("loading {}", input.display()))?;
    let result = loaded
        .invoke(method, args)
        .with_context(|| format!("invoking {}", method))?;
    println!("{}", result);
    Ok(())
}

// ─── info ───────────────────────────────────────────────────

fn cmd_info(input: &Path) -> Result<()> {
    let module = read_input(input)?;
    header();
    println!("Module: {}", module.name);
    println!();

    println!("Methods ({}):", module.methods.len());
    for m in &module.methods {
        let body = match &m.body {
            MethodBody::Code(code) => match decode(code) {
                Ok(instrs) => format!("{} bytes, {} instructions", code.len(), instrs.len()),
                Err(e) => format!("{} bytes, undecodable ({})", code.len(), e),
            },
            MethodBody::Sealed => "sealed".to_string(),
        };
        let flags = if m.flags.contains(MethodFlags::INTROSPECTABLE) {
            " [introspectable]"
        } else {
            ""
        };
        println!("  {} {:<20} params={} {}{}", m.token, m.name, m.params, body, flags);
    }

    println!("Sections ({}):", module.sections.len());
    for s in &module.sections {
        println!("  {:<10} {} bytes", s.name, s.data.len());
    }
    println!("Initializers: {:?}", module.initializers);
    println!("Invoke hooks: {:?}", module.invoke_hooks);

    if let Some(s) = module.find_section(NORMAL_SECTION) {
        let table = NormalTable::decode(&s.data)
            .with_context(|| format!("decoding {}", NORMAL_SECTION))?;
        println!();
        println!("[*] Normal mode: on_tamper={}, chain of {}", table.policy, table.entries.len());
        for e in &table.entries {
            println!("  {} offset=0x{:06X} len={}", e.token, e.offset, e.len);
        }
    }
    if let Some(s) = module.find_section(JIT_SECTION) {
        let table =
            JitTable::decode(&s.data).with_context(|| format!("decoding {}", JIT_SECTION))?;
        println!();
        println!("[*] JIT mode: on_tamper={}, {} method(s)", table.policy, table.entries.len());
        for e in &table.entries {
            println!(
                "  {} offset=0x{:06X} len={} nonce=0x{:016X}",
                e.token, e.offset, e.len, e.nonce
            );
        }
    }
    Ok(())
}
