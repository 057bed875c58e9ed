use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use mboci::dist::{Auth, AuthMap, Client};
use mboci::repo::BundleRepo;
use mbsync::working::{ScanOptions, humanize_size, scan_with_digest_cache};
use mbsync::{
    BundleConfig, Error, ProjectContext, TrackedFiles, apply_pull, apply_push, plan_pull,
    plan_push,
};

#[derive(Deserialize)]
struct AuthEntry {
    username: String,
    password: String,
}

// MB_AUTH points at a json file of {"registry": {"username": .., "password": ..}}
fn load_stored_auth(path: impl AsRef<Path>) -> anyhow::Result<AuthMap> {
    let stored: BTreeMap<String, AuthEntry> =
        serde_json::from_str(&std::fs::read_to_string(path.as_ref())?)
            .with_context(|| format!("parsing auth file {:?}", path.as_ref()))?;
    Ok(stored
        .into_iter()
        .map(|(k, v)| (k, Auth::UserPass(v.username, v.password)))
        .collect())
}

fn default_cache_dir() -> anyhow::Result<PathBuf> {
    if let Ok(dir) = std::env::var("MB_CACHE") {
        return Ok(PathBuf::from(dir));
    }
    let home = std::env::var("HOME").context("HOME not set and --cache-dir not given")?;
    Ok(Path::new(&home).join(".cache").join("modelops-bundle"))
}

#[derive(Parser, Debug)]
#[command(version, about = "content-addressed bundle sync over an OCI registry")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize a project in the current directory.
    Init {
        /// Registry and repository, e.g. ghcr.io/org/models
        registry_ref: String,
        #[arg(long, default_value = "latest")]
        tag: String,
        /// Plain http (local registries)
        #[arg(long)]
        insecure: bool,
    },
    /// Track files.
    Add {
        paths: Vec<PathBuf>,
        #[arg(short, long)]
        recursive: bool,
    },
    /// Stop tracking files.
    Remove { paths: Vec<String> },
    /// Compare local, remote, and last-synced state.
    Status { reference: Option<String> },
    /// Push the tracked set as a bundle.
    Push {
        tag: Option<String>,
        /// Push even if the tag moved since planning
        #[arg(long)]
        force: bool,
        /// Lift the large-file guard
        #[arg(long)]
        allow_large: bool,
    },
    /// Pull a bundle into the project.
    Pull {
        reference: Option<String>,
        /// Overwrite local changes and untracked collisions
        #[arg(long)]
        overwrite: bool,
        /// Re-download files deleted locally
        #[arg(long)]
        restore_deleted: bool,
        #[arg(long)]
        allow_large: bool,
    },
    /// List tags on the configured repository.
    Tags,
    /// Materialize a bundle into the worker cache and print its directory.
    Ensure {
        /// sha256:<hex> or repository@sha256:<hex>
        bundle_ref: String,
        /// Registry to pull from (defaults to the project's registry_ref)
        #[arg(long)]
        registry: Option<String>,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        #[arg(long)]
        insecure: bool,
    },
    /// Delete cache objects unused for longer than --keep-hours.
    Gc {
        #[arg(long, default_value_t = 168)]
        keep_hours: u64,
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

fn make_client(insecure: bool) -> anyhow::Result<Client> {
    let mut builder = Client::builder().insecure(insecure);
    if let Ok(path) = std::env::var("MB_AUTH") {
        builder = builder.auth(load_stored_auth(path)?);
    }
    Ok(builder.build()?)
}

fn scan_options(allow_large: bool) -> ScanOptions {
    ScanOptions {
        max_auto_hash_bytes: if allow_large {
            None
        } else {
            ScanOptions::default().max_auto_hash_bytes
        },
        ..Default::default()
    }
}

// the library reports structured errors; turn the actionable ones into
// actionable messages
fn render(e: Error) -> anyhow::Error {
    match e {
        Error::TagMoved {
            tag,
            expected,
            actual,
        } => {
            let actual = actual
                .map(|d| d.to_string())
                .unwrap_or_else(|| "(tag deleted)".to_string());
            anyhow::anyhow!(
                "tag '{tag}' moved during the operation: expected {expected}, found {actual}; \
                 re-plan, or pass --force to overwrite"
            )
        }
        Error::PullBlocked {
            conflicts,
            deleted_remote,
        } => anyhow::anyhow!(
            "pull blocked: conflicts {conflicts:?}, deleted on remote {deleted_remote:?}; \
             pass --overwrite to take the remote version"
        ),
        Error::UntrackedCollision(paths) => anyhow::anyhow!(
            "pull would overwrite untracked local files {paths:?}; \
             pass --overwrite to replace them"
        ),
        Error::BlobStorageRequired(paths) => anyhow::anyhow!(
            "these files need external blob storage but no provider is configured: {paths:?}; \
             set storage.provider in config.yaml"
        ),
        Error::NothingToPush => anyhow::anyhow!("no tracked files exist on disk; nothing to push"),
        other => anyhow::anyhow!(other),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    match args.command {
        Command::Init {
            registry_ref,
            tag,
            insecure,
        } => {
            let cwd = std::env::current_dir()?;
            if ProjectContext::is_initialized(&cwd) {
                bail!("already initialized");
            }
            let ctx = ProjectContext::init(&cwd)?;
            let mut config = BundleConfig::new(&registry_ref);
            config.default_tag = tag;
            config.insecure = insecure;
            config.save(&ctx).map_err(render)?;
            println!("initialized project for {registry_ref}");
        }

        Command::Add { paths, recursive } => {
            let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
            let mut tracked = TrackedFiles::load(&ctx).map_err(render)?;
            let mut added = 0usize;
            let mut ignored = 0usize;
            for path in paths {
                let full = if path.is_absolute() {
                    path.clone()
                } else {
                    std::env::current_dir()?.join(&path)
                };
                if full.is_dir() {
                    if !recursive {
                        bail!("{} is a directory; pass --recursive to add its files", path.display());
                    }
                    for entry in walkdir::WalkDir::new(&full) {
                        let entry = entry?;
                        if !entry.file_type().is_file() {
                            continue;
                        }
                        let rel = ctx.to_project_relative(entry.path()).map_err(render)?;
                        if ctx.should_ignore(&rel) {
                            ignored += 1;
                            continue;
                        }
                        if tracked.add(&rel).map_err(render)? {
                            added += 1;
                        }
                    }
                } else if full.is_file() {
                    let rel = ctx.to_project_relative(&full).map_err(render)?;
                    if ctx.should_ignore(&rel) {
                        ignored += 1;
                    } else if tracked.add(&rel).map_err(render)? {
                        added += 1;
                    }
                } else {
                    bail!("{} does not exist", path.display());
                }
            }
            tracked.save(&ctx).map_err(render)?;
            println!("added {added} files ({ignored} ignored), {} tracked", tracked.len());
        }

        Command::Remove { paths } => {
            let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
            let mut tracked = TrackedFiles::load(&ctx).map_err(render)?;
            let mut removed = 0usize;
            for path in &paths {
                if tracked.remove(path) {
                    removed += 1;
                } else {
                    eprintln!("not tracked: {path}");
                }
            }
            tracked.save(&ctx).map_err(render)?;
            println!("removed {removed} files, {} tracked", tracked.len());
        }

        Command::Status { reference } => {
            let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
            let config = BundleConfig::load(&ctx).map_err(render)?;
            let client = make_client(config.insecure)?;
            let tracked = TrackedFiles::load(&ctx).map_err(render)?;
            let working = scan_with_digest_cache(&tracked, &ctx, &ScanOptions::default())
                .map_err(render)?;
            let state = mbsync::SyncState::load(&ctx).map_err(render)?;

            let reference = reference.as_deref().unwrap_or(&config.default_tag);
            let remote = match mbsync::push::fetch_remote_state(&client, &config, reference).await
            {
                Ok((_, remote)) => Some(remote),
                Err(e) => {
                    log::debug!("no remote state for {reference}: {e}");
                    None
                }
            };

            let summary = working.status_summary(remote.as_ref(), &state);
            println!(
                "{} tracked, {} on disk",
                summary.total_tracked,
                humanize_size(summary.total_size)
            );
            println!(
                "local:  +{} ~{} -{}",
                summary.added_local, summary.modified_local, summary.deleted_local
            );
            println!(
                "remote: +{} ~{} -{}",
                summary.added_remote, summary.modified_remote, summary.deleted_remote
            );
            if summary.has_conflicts() {
                println!("conflicts: {}", summary.conflicts);
            }
            if summary.is_synced() && remote.is_some() {
                println!("up to date");
            }
        }

        Command::Push {
            tag,
            force,
            allow_large,
        } => {
            let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
            let config = BundleConfig::load(&ctx).map_err(render)?;
            let client = make_client(config.insecure)?;
            let plan = plan_push(
                &client,
                &config,
                &ctx,
                tag.as_deref(),
                &scan_options(allow_large),
            )
            .await
            .map_err(render)?;
            let outcome = apply_push(&client, &config, &ctx, &plan, force)
                .await
                .map_err(render)?;
            if outcome.skipped {
                println!("up to date at {}", outcome.manifest_digest);
            } else {
                println!(
                    "pushed {} files ({} uploaded, {}) to {}:{}",
                    outcome.files_pushed,
                    outcome.files_uploaded,
                    humanize_size(outcome.bytes_uploaded),
                    config.registry_ref,
                    outcome.tag
                );
                println!("{}", outcome.manifest_digest);
            }
        }

        Command::Pull {
            reference,
            overwrite,
            restore_deleted,
            allow_large,
        } => {
            let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
            let config = BundleConfig::load(&ctx).map_err(render)?;
            let client = make_client(config.insecure)?;
            let preview = plan_pull(
                &client,
                &config,
                &ctx,
                reference.as_deref(),
                overwrite,
                restore_deleted,
                &scan_options(allow_large),
            )
            .await
            .map_err(render)?;
            let outcome = apply_pull(&client, &config, &ctx, &preview, None, Default::default())
                .await
                .map_err(render)?;
            println!(
                "pulled {} files ({}), deleted {}, at {}",
                outcome.files_downloaded,
                humanize_size(outcome.bytes_downloaded),
                outcome.files_deleted,
                outcome.resolved_digest
            );
        }

        Command::Tags => {
            let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
            let config = BundleConfig::load(&ctx).map_err(render)?;
            let client = make_client(config.insecure)?;
            let reference = config.reference_for_tag(&config.default_tag).map_err(render)?;
            for tag in client.list_tags(&reference).await.map_err(|e| render(e.into()))? {
                println!("{tag}");
            }
        }

        Command::Ensure {
            bundle_ref,
            registry,
            cache_dir,
            insecure,
        } => {
            let registry = match registry {
                Some(registry) => registry,
                None => {
                    let ctx = ProjectContext::discover(&std::env::current_dir()?)?;
                    BundleConfig::load(&ctx).map_err(render)?.registry_ref
                }
            };
            let cache_dir = match cache_dir {
                Some(dir) => dir,
                None => default_cache_dir()?,
            };
            let client = make_client(insecure)?;
            let repo = BundleRepo::new(&registry, &cache_dir, client)?;
            let (digest, dir) = repo.ensure_local(&bundle_ref).await?;
            println!("{digest}");
            println!("{}", dir.display());
        }

        Command::Gc {
            keep_hours,
            cache_dir,
        } => {
            let cache_dir = match cache_dir {
                Some(dir) => dir,
                None => default_cache_dir()?,
            };
            let cas = mbcas::Cas::open(&cache_dir)?;
            let removed = cas.cleanup_old_objects(keep_hours)?;
            println!("removed {removed} cache objects");
        }
    }
    Ok(())
}
