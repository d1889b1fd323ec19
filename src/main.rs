use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process;

use anyhow::{Context, Result};
use clap::Parser;

use helpcache::config::{self, Config};
use helpcache::exec;
use helpcache::fingerprint;
use helpcache::store::CacheStore;
use helpcache::trace;

/// Cache and replay the help text of slow commands.
///
/// Runs COMMAND once under a tracer, remembers the text it printed
/// together with every file it read while printing it, and replays the
/// text on later invocations for as long as none of those files changed.
#[derive(Parser)]
#[command(name = "helpcache", version)]
struct Cli {
    /// Log cache hits, misses, and recorded dependencies to stderr
    #[arg(short, long)]
    verbose: bool,

    /// Fingerprint only the first NUM arguments of COMMAND
    #[arg(short = 'n', long = "num", value_name = "NUM", allow_negative_numbers = true)]
    num: Option<i64>,

    /// Path to the cache database; a leading $ORIGIN0 or $ORIGIN1 expands
    /// to the directory of the command or of its first argument
    #[arg(short = 'p', long = "path", value_name = "CACHE")]
    path: Option<String>,

    /// Command to run, and arguments to pass to it
    #[arg(
        value_name = "COMMAND",
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse_from(normalize_args(std::env::args().collect()));
    let config = Config::load();

    let mut cmd = cli.command;
    cmd[0] = exec::find_in_path(&cmd[0])?.to_string_lossy().into_owned();

    // Caching only applies to invocations that ask for help text.
    // Anything else is handed over to the child untouched.
    if !fingerprint::has_help_flag(&cmd) {
        return Err(exec::exec_child(&cmd));
    }

    let db_path = config.resolve_db_path(cli.path.as_deref(), &cmd);
    let stable_paths = config.stable_paths();
    let verbose = cli.verbose;

    let mut store = CacheStore::open(Path::new(&db_path), verbose)
        .with_context(|| format!("can't access cache '{db_path}'"))?;

    let prefix_len = cli.num.and_then(|n| usize::try_from(n).ok());
    let cmd_fingerprint = fingerprint::command_fingerprint(prefix_len, &cmd);

    if let Some(hit) = store.lookup(&cmd_fingerprint)? {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&hit.help_text)?;
        stdout.flush()?;
        if verbose {
            eprintln!("helpcache: read from cache '{db_path}'");
        }
        process::exit(hit.exit_status);
    }

    if store.is_read_only() {
        // Nothing to gain from tracing when the result can't be stored.
        return Err(exec::exec_child(&cmd));
    }

    let mut deps: Vec<PathBuf> = Vec::new();
    let executable = PathBuf::from(&cmd[0]);
    if !config::is_stable(&executable, &stable_paths) {
        deps.push(executable);
    }

    let output = trace::run(&cmd, |path| {
        if config::is_stable(path, &stable_paths) {
            return;
        }
        if verbose {
            eprintln!("helpcache: loaded file: {}", path.display());
        }
        deps.push(path.to_path_buf());
    })?;

    {
        let mut stdout = io::stdout().lock();
        stdout.write_all(&output.stdout)?;
        stdout.flush()?;
    }

    store.insert(&cmd, &cmd_fingerprint, &output.stdout, output.exit_status, &deps)?;
    if verbose {
        eprintln!("helpcache: saved to cache '{db_path}'");
    }
    process::exit(output.exit_status);
}

/// Split a whitespace-containing first argument into separate arguments,
/// so shebang lines like `#!/usr/bin/env helpcache -v` work: the kernel
/// passes everything after the interpreter name as a single argument.
fn normalize_args(mut args: Vec<String>) -> Vec<String> {
    if args.len() > 1 && args[1].contains(char::is_whitespace) {
        let split: Vec<String> = args[1].split_whitespace().map(str::to_owned).collect();
        args.splice(1..2, split);
    }
    args
}
