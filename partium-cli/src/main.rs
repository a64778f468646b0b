#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # Partium CLI
//!
//! A command-line interface for the partium C preprocessor library.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use partium::{
    DiagnosticListener, Feature, PreprocessError, Preprocessor, PreprocessorConfig, TokenKind,
    Warning,
};
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Exit codes for different error conditions
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const IO_ERROR: i32 = 2;
    pub const PREPROCESS_ERROR: i32 = 3;
}

/// Command-line interface for the partium C preprocessor
#[derive(Parser)]
#[command(
    name = "partium",
    version,
    author,
    about = "A C preprocessor with a control plane for partial preprocessing",
    long_about = "partium preprocesses C/C++/Objective-C sources: macro expansion, \
conditional compilation, includes, stringification and token pasting, with optional \
GCC-style linemarkers.",
    after_help = "EXAMPLES:
  # Preprocess a single file
  $ partium input.c -o output.i

  # Preprocess with include directories and command-line macros
  $ partium input.c -I include -I /usr/include -D NDEBUG -D VERSION=3

  # Read from stdin and write to stdout
  $ cat input.c | partium - | gcc -x c -

  # Keep line information for downstream consumers
  $ partium input.c --linemarkers -o output.i

  # Warnings as errors
  $ partium input.c -W undef -W error"
)]
#[command(arg_required_else_help = true)]
struct Cli {
    /// Input file to preprocess (use '-' for stdin)
    #[arg(help = "Input C/C++ file to preprocess (use '-' for stdin)")]
    input: PathBuf,

    /// Output file (use '-' for stdout, default: stdout)
    #[arg(
        short = 'o',
        long,
        help = "Output file (use '-' for stdout, default: stdout)"
    )]
    output: Option<PathBuf>,

    /// Add directory to the system include search path
    #[arg(
        short = 'I',
        long = "include",
        value_name = "DIR",
        help = "Add directory to the system include search path"
    )]
    include_dirs: Vec<PathBuf>,

    /// Add directory to the quoted include search path
    #[arg(
        long = "iquote",
        value_name = "DIR",
        help = "Add directory to the quoted include search path"
    )]
    quote_dirs: Vec<PathBuf>,

    /// Add directory to the frameworks search path
    #[arg(
        short = 'F',
        long = "framework",
        value_name = "DIR",
        help = "Add directory to the frameworks search path"
    )]
    framework_dirs: Vec<PathBuf>,

    /// Define a macro, NAME or NAME=VALUE
    #[arg(
        short = 'D',
        long = "define",
        value_name = "NAME[=VALUE]",
        help = "Define a macro before processing"
    )]
    defines: Vec<String>,

    /// Undefine a macro
    #[arg(short = 'U', long = "undef", value_name = "NAME", help = "Undefine a macro")]
    undefs: Vec<String>,

    /// Emit GCC-style linemarkers at source transitions
    #[arg(long, help = "Emit #line markers at source transitions")]
    linemarkers: bool,

    /// Keep comments in the output
    #[arg(short = 'C', long, help = "Keep comments in active code")]
    keep_comments: bool,

    /// Keep comments everywhere, inactive branches included
    #[arg(long, help = "Keep comments everywhere, even in inactive branches")]
    keep_all_comments: bool,

    /// Disable #pragma once handling
    #[arg(long, help = "Disable #pragma once handling")]
    no_pragma_once: bool,

    /// Enable the #include_next directive
    #[arg(long, help = "Enable the #include_next directive")]
    include_next: bool,

    /// Treat stray characters as errors
    #[arg(long, help = "Treat characters invalid in C as errors")]
    csyntax: bool,

    /// Enable a warning class
    #[arg(
        short = 'W',
        long = "warn",
        value_enum,
        value_name = "WARNING",
        help = "Enable a warning class"
    )]
    warnings: Vec<WarningValue>,

    /// Enable verbose output
    #[arg(
        short = 'v',
        long,
        help = "Enable verbose output with diagnostic information"
    )]
    verbose: bool,

    /// Suppress non-error output
    #[arg(short = 'q', long, help = "Suppress non-error output (quiet mode)")]
    quiet: bool,

    /// Show what would happen without preprocessing
    #[arg(
        short = 'n',
        long,
        help = "Show what would happen without actually preprocessing"
    )]
    dry_run: bool,

    /// Output in JSON format
    #[cfg(feature = "json")]
    #[arg(long, help = "Output preprocessing result in JSON format")]
    json: bool,
}

/// Warning classes selectable from the command line
#[derive(Clone, Debug, ValueEnum)]
enum WarningValue {
    /// Escalate all warnings to errors
    Error,
    /// Warn about undefined identifiers in conditionals
    Undef,
    /// Warn about stray text after #else/#endif
    EndifLabels,
}

impl From<WarningValue> for Warning {
    fn from(value: WarningValue) -> Self {
        match value {
            WarningValue::Error => Warning::Error,
            WarningValue::Undef => Warning::Undef,
            WarningValue::EndifLabels => Warning::EndifLabels,
        }
    }
}

/// Global flag to track if any warnings occurred
static WARNINGS_OCCURRED: AtomicBool = AtomicBool::new(false);

/// Reports diagnostics on stderr and lets preprocessing continue.
struct StderrReporter {
    quiet: bool,
    errors: std::cell::Cell<usize>,
}

impl StderrReporter {
    fn location(source: Option<&str>, line: u32, column: u32) -> String {
        format!("{}:{}:{}", source.unwrap_or("<no file>"), line, column)
    }
}

impl DiagnosticListener for StderrReporter {
    fn handle_error(&self, source: Option<&str>, line: u32, column: u32, msg: &str) {
        self.errors.set(self.errors.get() + 1);
        eprintln!("{}: error: {}", Self::location(source, line, column), msg);
    }

    fn handle_warning(&self, source: Option<&str>, line: u32, column: u32, msg: &str) {
        WARNINGS_OCCURRED.store(true, Ordering::Relaxed);
        if !self.quiet {
            eprintln!("{}: warning: {}", Self::location(source, line, column), msg);
        }
    }
}

/// Main application entry point
fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(had_errors) => {
            if had_errors {
                exit_code::PREPROCESS_ERROR
            } else if WARNINGS_OCCURRED.load(Ordering::Relaxed) {
                exit_code::GENERAL_ERROR
            } else {
                exit_code::SUCCESS
            }
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            determine_exit_code(&e)
        }
    });
}

/// Determine the appropriate exit code based on the error
fn determine_exit_code(error: &anyhow::Error) -> i32 {
    if error.downcast_ref::<std::io::Error>().is_some() {
        exit_code::IO_ERROR
    } else if error.downcast_ref::<PreprocessError>().is_some() {
        exit_code::PREPROCESS_ERROR
    } else {
        exit_code::GENERAL_ERROR
    }
}

/// Run the main application logic; Ok(true) means diagnostics were reported.
fn run() -> Result<bool> {
    let cli = Cli::parse();

    validate_args(&cli)?;

    if cli.dry_run {
        show_dry_run_info(&cli);
        return Ok(false);
    }

    log::info!("preprocessing {}", format_input(&cli.input));

    let config = create_config(&cli);
    let reporter = Rc::new(StderrReporter {
        quiet: cli.quiet,
        errors: std::cell::Cell::new(0),
    });

    let mut pp = Preprocessor::with_config(&config);
    pp.set_listener(reporter.clone());

    let start_time = std::time::Instant::now();
    if cli.input == PathBuf::from("-") {
        use std::io::Read;
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        pp.add_input_str(&buffer);
    } else {
        let path = cli.input.to_string_lossy();
        pp.add_input_file(&path)
            .with_context(|| format!("Failed to read input file: {}", cli.input.display()))?;
    }

    let mut output = String::new();
    loop {
        let tok = pp
            .token()
            .with_context(|| "Failed to preprocess input".to_string())?;
        if tok.kind == TokenKind::Eof {
            break;
        }
        output.push_str(&tok.text);
    }
    if pp.conditional_depth() > 0 {
        reporter.handle_error(None, 0, 0, "unterminated #if/#ifdef/#ifndef");
    }
    let processing_time = start_time.elapsed();

    write_output(&cli, &output)?;

    if cli.verbose && !cli.quiet {
        show_verbose_info(&cli, &pp, processing_time);
        eprintln!(
            "Preprocessed {} -> {}",
            format_input(&cli.input),
            cli.output.as_ref().map_or("stdout".to_string(), format_output)
        );
    }

    Ok(reporter.errors.get() > 0)
}

/// Validate command-line arguments
fn validate_args(cli: &Cli) -> Result<()> {
    if let Some(output) = &cli.output
        && output != &PathBuf::from("-")
        && std::fs::canonicalize(output).ok() == std::fs::canonicalize(&cli.input).ok()
        && std::fs::canonicalize(output).is_ok()
    {
        return Err(anyhow::anyhow!(
            "Input and output files cannot be the same: {}",
            output.display()
        ));
    }
    Ok(())
}

/// Show dry run information
fn show_dry_run_info(cli: &Cli) {
    eprintln!(
        "Dry run: would preprocess {} -> {}",
        format_input(&cli.input),
        cli.output.as_ref().map_or("stdout".to_string(), format_output)
    );
    if !cli.include_dirs.is_empty() {
        eprintln!("Include directories:");
        for dir in &cli.include_dirs {
            eprintln!("  {}", dir.display());
        }
    }
    if !cli.defines.is_empty() {
        eprintln!("Defines:");
        for define in &cli.defines {
            eprintln!("  {define}");
        }
    }
}

/// Create preprocessor configuration from CLI arguments
fn create_config(cli: &Cli) -> PreprocessorConfig {
    let mut config = PreprocessorConfig::new();

    if cli.linemarkers {
        config = config.with_feature(Feature::Linemarkers);
    }
    if cli.keep_comments {
        config = config.with_feature(Feature::KeepComments);
    }
    if cli.keep_all_comments {
        config = config.with_feature(Feature::KeepAllComments);
    }
    if !cli.no_pragma_once {
        config = config.with_feature(Feature::PragmaOnce);
    }
    if cli.include_next {
        config = config.with_feature(Feature::IncludeNext);
    }
    if cli.csyntax {
        config = config.with_feature(Feature::CSyntax);
    }
    for warning in &cli.warnings {
        config = config.with_warning(warning.clone().into());
    }

    for dir in &cli.include_dirs {
        config = config.with_system_include_dir(dir.to_string_lossy());
    }
    for dir in &cli.quote_dirs {
        config = config.with_quote_include_dir(dir.to_string_lossy());
    }
    for dir in &cli.framework_dirs {
        config = config.with_frameworks_dir(dir.to_string_lossy());
    }

    for define in &cli.defines {
        match define.split_once('=') {
            Some((name, value)) => config = config.with_define(name, value),
            None => config = config.with_define(define, "1"),
        }
    }
    config.undefs = cli.undefs.clone();

    config
}

/// Write output to file or stdout
fn write_output(cli: &Cli, content: &str) -> Result<()> {
    #[cfg(feature = "json")]
    if cli.json {
        return write_json_output(cli, content);
    }

    match &cli.output {
        Some(output_path) if output_path != &PathBuf::from("-") => {
            std::fs::write(output_path, content).with_context(|| {
                format!("Failed to write to output file: {}", output_path.display())
            })?;
        }
        _ => {
            print!("{content}");
        }
    }

    Ok(())
}

/// Write JSON output
#[cfg(feature = "json")]
fn write_json_output(cli: &Cli, content: &str) -> Result<()> {
    use serde_json::json;

    let result = json!({
        "success": true,
        "output": content,
        "input_file": format_input(&cli.input),
        "output_file": cli.output.as_ref().map(format_output),
        "include_dirs": cli.include_dirs.iter().map(|p| p.to_string_lossy().to_string()).collect::<Vec<_>>(),
        "warnings_occurred": WARNINGS_OCCURRED.load(Ordering::Relaxed),
    });

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Show verbose information
fn show_verbose_info(cli: &Cli, pp: &Preprocessor, processing_time: std::time::Duration) {
    eprintln!("Processing time: {processing_time:?}");
    if !cli.include_dirs.is_empty() {
        eprintln!("Include directories ({}):", cli.include_dirs.len());
        for dir in &cli.include_dirs {
            eprintln!("  {}", dir.display());
        }
    }
    if !pp.includes().is_empty() {
        eprintln!("Included files ({}):", pp.includes().len());
        for path in pp.includes() {
            eprintln!("  {path}");
        }
    }
}

/// Format input path for display
fn format_input(path: &PathBuf) -> String {
    if path == &PathBuf::from("-") {
        "stdin".to_string()
    } else {
        path.display().to_string()
    }
}

/// Format output path for display
fn format_output(path: &PathBuf) -> String {
    if path == &PathBuf::from("-") {
        "stdout".to_string()
    } else {
        path.display().to_string()
    }
}
