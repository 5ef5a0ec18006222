//! Sandbox Authz - Entry Point
//!
//! Operator front end for checking what the authorization pipeline decides.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, miette};
use tracing::{Level, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use sandbox_authz::config::SafeBinConfigLayer;
use sandbox_authz::exec::{
    SafeBinVerdict, TrustedDirCache, evaluate_safe_bin, is_trusted_path, resolve_policy,
    scaffold_missing_profiles,
};
use sandbox_authz::fs::{VerifiedOpenOptions, open_verified};
use sandbox_authz::paths::{PathResolutionOutcome, PathResolver};
use sandbox_authz::sandbox::BindMount;

/// Sandbox Authz - inspect path containment and exec trust decisions.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a path or URL against a sandbox root
    Resolve {
        /// Host sandbox root
        #[arg(long)]
        root: PathBuf,

        /// Extra bind mount (hostPath:containerPath[:ro|rw]); repeatable
        #[arg(long = "mount")]
        mounts: Vec<String>,

        /// Disable the temp directory allowance
        #[arg(long, default_value = "false")]
        no_tmp: bool,

        /// Raw path or URL
        input: String,
    },

    /// Open a file with symlink-race checks and print its size
    Open {
        /// File to open
        path: PathBuf,

        /// Require the real path to be inside this directory
        #[arg(long)]
        root: Option<PathBuf>,

        /// Maximum accepted size in bytes
        #[arg(long)]
        max_bytes: Option<u64>,

        /// Refuse when the path itself is a symlink
        #[arg(long, default_value = "false")]
        no_symlink: bool,
    },

    /// Print the resolved safe-bin policy and doctor warnings
    SafeBins {
        /// Global config layer (JSON)
        #[arg(long)]
        global: Option<PathBuf>,

        /// Per-agent config layer (JSON)
        #[arg(long)]
        local: Option<PathBuf>,

        /// Print empty profiles for unprofiled, non-interpreter safe bins
        #[arg(long, default_value = "false")]
        scaffold: bool,
    },

    /// Check whether an executable may run as a safe bin
    CheckBin {
        /// Global config layer (JSON)
        #[arg(long)]
        global: Option<PathBuf>,

        /// Per-agent config layer (JSON)
        #[arg(long)]
        local: Option<PathBuf>,

        /// Executable path
        executable: PathBuf,

        /// Arguments the executable would receive
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Logs go to stderr; stdout carries command output
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Sandbox Authz v{}", env!("CARGO_PKG_VERSION"));

    match args.command {
        Command::Resolve {
            root,
            mounts,
            no_tmp,
            input,
        } => {
            let mut resolver = PathResolver::new(root);
            if no_tmp {
                resolver = resolver.without_tmp_root();
            }
            for spec in &mounts {
                resolver = resolver.with_bind_mount(BindMount::parse_verified(spec)?);
            }
            match resolver.resolve(&input) {
                PathResolutionOutcome::Contained(path) => println!("contained {}", path.display()),
                PathResolutionOutcome::Passthrough(url) => println!("passthrough {url}"),
                PathResolutionOutcome::Rejected(reason) => {
                    return Err(miette!("rejected: {reason}"));
                }
            }
        }
        Command::Open {
            path,
            root,
            max_bytes,
            no_symlink,
        } => {
            let mut options = VerifiedOpenOptions::new();
            if let Some(root) = root {
                options = options.within_root(root);
            }
            if let Some(max_bytes) = max_bytes {
                options = options.with_max_bytes(max_bytes);
            }
            if no_symlink {
                options = options.reject_path_symlink();
            }
            let file = open_verified(&path, &options)?;
            println!("{} {} bytes", file.path.display(), file.metadata.len());
        }
        Command::SafeBins { global, local, scaffold } => {
            let (global, local) = load_layers(global, local)?;
            let policy = resolve_policy(global.as_ref(), local.as_ref(), &TrustedDirCache::new());

            println!("safe bins:");
            for bin in &policy.trusted_bins {
                match policy.profiles.get(bin) {
                    Some(profile) if profile.is_unrestricted() => {
                        println!("  {bin} (unrestricted profile)");
                    }
                    Some(profile) => println!(
                        "  {bin} denied={:?} max_positional={:?}",
                        profile.denied_flags, profile.max_positional
                    ),
                    None => println!("  {bin} (no profile)"),
                }
            }
            println!("trusted dirs:");
            for dir in policy.trusted_dirs.iter() {
                println!("  {}", dir.display());
            }
            for bin in &policy.unprofiled_interpreter_bins {
                warn!("{bin} is an interpreter without a profile and will always need approval");
            }

            if scaffold {
                let profiles = scaffold_missing_profiles(&policy);
                let layer = SafeBinConfigLayer {
                    safe_bin_profiles: Some(profiles),
                    ..SafeBinConfigLayer::default()
                };
                println!("{}", serde_json::to_string_pretty(&layer).into_diagnostic()?);
            }
        }
        Command::CheckBin {
            global,
            local,
            executable,
            args,
        } => {
            let (global, local) = load_layers(global, local)?;
            let policy = resolve_policy(global.as_ref(), local.as_ref(), &TrustedDirCache::new());
            let verdict = evaluate_safe_bin(&policy, &executable, &args);
            println!(
                "{verdict} (trusted dir: {})",
                is_trusted_path(&executable, &policy.trusted_dirs)
            );
            if verdict != SafeBinVerdict::Allowed {
                return Err(miette!("{} needs approval", executable.display()));
            }
        }
    }

    Ok(())
}

fn load_layers(
    global: Option<PathBuf>,
    local: Option<PathBuf>,
) -> Result<(Option<SafeBinConfigLayer>, Option<SafeBinConfigLayer>)> {
    let global = global.map(|p| SafeBinConfigLayer::load(&p)).transpose()?;
    let local = local.map(|p| SafeBinConfigLayer::load(&p)).transpose()?;
    Ok((global, local))
}
