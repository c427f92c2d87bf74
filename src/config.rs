//! Run configuration
//!
//! `RunConfig` is built once from the CLI and never mutated afterwards. The
//! orchestrator re-checks the invariants in [`RunConfig::validate`] before it
//! touches any process.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use nix::unistd::Pid;
use regex::Regex;

use crate::cli::Cli;
use crate::error::{BenchError, ConfigError};
use crate::privilege::{run_unprivileged, Credentials, Identity, ProcessCredentials};

/// Checkpoint interval used when none is given
pub const DEFAULT_CHECKPOINT: Duration = Duration::from_secs(30 * 60);

/// File name prefix for numbered snapshots written to an output directory
pub const FILE_PREFIX: &str = "callbench.";

/// What is being measured
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// The whole machine
    System,
    /// An already running process
    Pid(Pid),
    /// A program we launch ourselves
    Spawn { program: String, args: Vec<String> },
}

impl Target {
    pub fn is_process(&self) -> bool {
        !matches!(self, Target::System)
    }
}

/// Ordering of records in a snapshot table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortKey {
    /// Call name, ascending
    Name,
    /// Call identifier, descending
    Id,
    /// Total count, descending
    Count,
    /// Total overhead, descending
    Overhead,
    /// Average overhead per call, descending
    #[default]
    AvgOverhead,
}

impl FromStr for SortKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "name" | "sysname" => Ok(SortKey::Name),
            "id" | "sysnum" => Ok(SortKey::Id),
            "count" => Ok(SortKey::Count),
            "overhead" => Ok(SortKey::Overhead),
            "avg-overhead" | "avg_overhead" | "average-overhead" | "average" => {
                Ok(SortKey::AvgOverhead)
            }
            _ => Err(ConfigError::UnknownSortKey(s.to_string())),
        }
    }
}

/// Where snapshots go
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Destination {
    /// Standard output, one table per checkpoint
    #[default]
    Stdout,
    /// A single file rewritten at every checkpoint
    File(PathBuf),
    /// A directory receiving `callbench.<index>` per checkpoint
    Numbered(PathBuf),
}

impl Destination {
    pub fn is_filesystem(&self) -> bool {
        !matches!(self, Destination::Stdout)
    }

    /// Path written for the snapshot with `index`, `None` for stdout
    pub fn path_for(&self, index: u64) -> Option<PathBuf> {
        match self {
            Destination::Stdout => None,
            Destination::File(path) => Some(path.clone()),
            Destination::Numbered(dir) => Some(dir.join(format!("{}{}", FILE_PREFIX, index))),
        }
    }
}

/// Whether snapshots carry totals since start or since the last checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Accumulation {
    #[default]
    Cumulative,
    Interval,
}

/// Immutable configuration of one benchmark run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub target: Target,
    pub follow_children: bool,
    /// `None` runs until an external termination request
    pub duration: Option<Duration>,
    pub checkpoint: Duration,
    pub sort: SortKey,
    pub destination: Destination,
    pub overwrite: bool,
    pub tee: bool,
    pub show_id: bool,
    pub show_average: bool,
    pub accumulation: Accumulation,
    /// Explicit identity for file writes; falls back to `SUDO_UID`/`SUDO_GID`
    pub identity: Option<Identity>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            target: Target::System,
            follow_children: false,
            duration: None,
            checkpoint: DEFAULT_CHECKPOINT,
            sort: SortKey::default(),
            destination: Destination::default(),
            overwrite: false,
            tee: false,
            show_id: false,
            show_average: true,
            accumulation: Accumulation::default(),
            identity: None,
        }
    }
}

impl RunConfig {
    /// Build a configuration from parsed CLI arguments
    pub fn from_cli(cli: &Cli) -> Result<Self, ConfigError> {
        let target = match (cli.pid, &cli.command) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "Cannot specify both -p PID and command. Choose one.".to_string(),
                ))
            }
            (Some(pid), None) => Target::Pid(Pid::from_raw(pid)),
            (None, Some(command)) => match command.split_first() {
                Some((program, args)) => Target::Spawn {
                    program: program.clone(),
                    args: args.to_vec(),
                },
                None => return Err(ConfigError::Conflict("Command is empty".to_string())),
            },
            (None, None) => Target::System,
        };

        let destination = match (&cli.output, &cli.outdir) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "--output and --outdir are mutually exclusive".to_string(),
                ))
            }
            (Some(file), None) => Destination::File(file.clone()),
            (None, Some(dir)) => Destination::Numbered(dir.clone()),
            (None, None) => Destination::Stdout,
        };

        let duration = if cli.duration.is_empty() {
            None
        } else {
            Some(parse_durations(&cli.duration)?)
        };
        let checkpoint = if cli.checkpoint.is_empty() {
            DEFAULT_CHECKPOINT
        } else {
            parse_durations(&cli.checkpoint)?
        };

        let config = Self {
            target,
            follow_children: cli.follow,
            duration,
            checkpoint,
            sort: cli.sort.parse()?,
            destination,
            overwrite: cli.overwrite,
            tee: cli.tee,
            show_id: cli.sysnum,
            show_average: !cli.no_average,
            accumulation: if cli.interval {
                Accumulation::Interval
            } else {
                Accumulation::Cumulative
            },
            identity: cli.user,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the orchestrator relies on
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.checkpoint.is_zero() {
            return Err(ConfigError::ZeroInterval {
                what: "checkpoint interval",
            });
        }
        if self.duration.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::ZeroInterval { what: "duration" });
        }
        if self.follow_children && !self.target.is_process() {
            return Err(ConfigError::Conflict(
                "Setting follow mode only makes sense when running with --pid or a command"
                    .to_string(),
            ));
        }
        if self.tee && !self.destination.is_filesystem() {
            return Err(ConfigError::Conflict(
                "--tee does not make sense without --output or --outdir".to_string(),
            ));
        }
        if self.overwrite && !self.destination.is_filesystem() {
            return Err(ConfigError::Conflict(
                "--overwrite does not make sense without --output or --outdir".to_string(),
            ));
        }
        if !self.show_average && self.sort == SortKey::AvgOverhead {
            return Err(ConfigError::Conflict(
                "Sorting by average overhead requires the average column (drop --no-average or pick another --sort)"
                    .to_string(),
            ));
        }
        Ok(())
    }

    /// Check the output location before anything is measured
    ///
    /// Refuses to clobber earlier results unless `--overwrite` was given, and
    /// makes sure the location exists and accepts writes from the identity
    /// snapshots will be written as.
    pub fn check_destination(&self) -> Result<(), ConfigError> {
        self.check_destination_with(&ProcessCredentials)
    }

    pub fn check_destination_with<C: Credentials + ?Sized>(
        &self,
        creds: &C,
    ) -> Result<(), ConfigError> {
        let invalid = |path: &Path, reason: &str| ConfigError::Destination {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        match &self.destination {
            Destination::Stdout => Ok(()),
            Destination::File(path) => {
                if path.is_dir() {
                    return Err(invalid(path.as_path(), "is a directory"));
                }
                if path.exists() && !self.overwrite {
                    return Err(ConfigError::WouldOverwrite(path.clone()));
                }
                let parent = match path.parent() {
                    Some(dir) if dir.as_os_str().is_empty() => Path::new("."),
                    Some(dir) => dir,
                    None => return Err(invalid(path.as_path(), "has no parent directory")),
                };
                if !parent.is_dir() {
                    return Err(invalid(path.as_path(), "parent directory does not exist"));
                }
                self.check_writable(creds, path, || {
                    if path.exists() {
                        OpenOptions::new().write(true).open(path).map(drop)
                    } else {
                        OpenOptions::new().write(true).create_new(true).open(path)?;
                        std::fs::remove_file(path)
                    }
                })
            }
            Destination::Numbered(dir) => {
                if !dir.is_dir() {
                    return Err(invalid(dir.as_path(), "not an existing directory"));
                }
                if !self.overwrite && has_numbered_files(dir) {
                    return Err(ConfigError::WouldOverwrite(dir.clone()));
                }
                let probe = dir.join(format!(".{}write-check.{}", FILE_PREFIX, std::process::id()));
                self.check_writable(creds, dir, || {
                    OpenOptions::new().write(true).create_new(true).open(&probe)?;
                    std::fs::remove_file(&probe)
                })
            }
        }
    }

    /// Run `attempt` as the write identity (no identity: file writes are skipped)
    fn check_writable<C, F>(&self, creds: &C, path: &Path, attempt: F) -> Result<(), ConfigError>
    where
        C: Credentials + ?Sized,
        F: FnOnce() -> std::io::Result<()>,
    {
        let Some(identity) = Identity::resolve(self.identity, creds.effective()) else {
            return Ok(());
        };
        run_unprivileged(creds, Some(identity), path, attempt).map_err(|e| {
            ConfigError::Destination {
                path: path.to_path_buf(),
                reason: match e {
                    BenchError::Write { source, .. } => {
                        format!("no permission to write as uid {}: {}", identity.uid, source)
                    }
                    other => other.to_string(),
                },
            }
        })
    }
}

fn has_numbered_files(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .any(|e| e.file_name().to_string_lossy().starts_with(FILE_PREFIX))
        })
        .unwrap_or(false)
}

fn spec_regex() -> &'static Regex {
    static SPEC: OnceLock<Regex> = OnceLock::new();
    SPEC.get_or_init(|| Regex::new(r"^(?:\d+[sSmMhHdDwW]?)+$").expect("static regex"))
}

fn part_regex() -> &'static Regex {
    static PART: OnceLock<Regex> = OnceLock::new();
    PART.get_or_init(|| Regex::new(r"(\d+)([sSmMhHdDwW]?)").expect("static regex"))
}

/// Parse a time specification like `90`, `30s`, `5m`, `1h`, `2d`, `1w` or `1m30s`
///
/// Works like the arguments to timeout(1); a bare number is seconds.
pub fn parse_duration(spec: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(spec.to_string());
    let spec_trimmed = spec.trim();
    if !spec_regex().is_match(spec_trimmed) {
        return Err(invalid());
    }

    let mut total: u64 = 0;
    for caps in part_regex().captures_iter(spec_trimmed) {
        let value: u64 = caps[1].parse().map_err(|_| invalid())?;
        let unit = match caps[2].to_ascii_lowercase().as_str() {
            "" | "s" => 1,
            "m" => 60,
            "h" => 60 * 60,
            "d" => 24 * 60 * 60,
            "w" => 7 * 24 * 60 * 60,
            _ => return Err(invalid()),
        };
        total = value
            .checked_mul(unit)
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(invalid)?;
    }
    Ok(Duration::from_secs(total))
}

/// Sum several time specifications (`-d 1m 30s`)
pub fn parse_durations<S: AsRef<str>>(specs: &[S]) -> Result<Duration, ConfigError> {
    specs.iter().try_fold(Duration::ZERO, |acc, spec| {
        let part = parse_duration(spec.as_ref())?;
        acc.checked_add(part)
            .ok_or_else(|| ConfigError::InvalidDuration(spec.as_ref().to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("45S").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
    }

    #[test]
    fn test_parse_duration_composed() {
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("1h1m1s").unwrap(), Duration::from_secs(3661));
        assert_eq!(parse_duration("1m30").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_durations_sums_values() {
        let specs = ["1m", "30s"];
        assert_eq!(parse_durations(&specs).unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        for bad in ["", "m", "1x", "-5s", "1.5m", "1 m", "ten"] {
            assert!(
                matches!(parse_duration(bad), Err(ConfigError::InvalidDuration(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_parse_duration_overflow() {
        assert!(parse_duration("99999999999999999999w").is_err());
        assert!(parse_duration("18446744073709551615w").is_err());
    }

    #[test]
    fn test_sort_key_aliases() {
        assert_eq!("name".parse::<SortKey>().unwrap(), SortKey::Name);
        assert_eq!("sysname".parse::<SortKey>().unwrap(), SortKey::Name);
        assert_eq!("sysnum".parse::<SortKey>().unwrap(), SortKey::Id);
        assert_eq!("count".parse::<SortKey>().unwrap(), SortKey::Count);
        assert_eq!("overhead".parse::<SortKey>().unwrap(), SortKey::Overhead);
        assert_eq!("avg_overhead".parse::<SortKey>().unwrap(), SortKey::AvgOverhead);
        assert_eq!("average-overhead".parse::<SortKey>().unwrap(), SortKey::AvgOverhead);
    }

    #[test]
    fn test_unknown_sort_key() {
        let err = "latency".parse::<SortKey>().unwrap_err();
        assert_eq!(err, ConfigError::UnknownSortKey("latency".to_string()));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = RunConfig::default();
        assert_eq!(config.checkpoint, DEFAULT_CHECKPOINT);
        assert!(config.duration.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_checkpoint_rejected() {
        let config = RunConfig {
            checkpoint: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroInterval { .. })
        ));
    }

    #[test]
    fn test_duration_shorter_than_checkpoint_allowed() {
        let config = RunConfig {
            checkpoint: Duration::from_secs(60),
            duration: Some(Duration::from_secs(5)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_follow_requires_process_target() {
        let config = RunConfig {
            follow_children: true,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Conflict(_))));

        let config = RunConfig {
            follow_children: true,
            target: Target::Pid(Pid::from_raw(1)),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tee_requires_file_destination() {
        let config = RunConfig {
            tee: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            tee: true,
            destination: Destination::File(PathBuf::from("/tmp/out")),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_average_sort_requires_average_column() {
        let config = RunConfig {
            show_average: false,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RunConfig {
            show_average: false,
            sort: SortKey::Count,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_destination_paths() {
        assert_eq!(Destination::Stdout.path_for(3), None);
        let file = Destination::File(PathBuf::from("/tmp/out.txt"));
        assert_eq!(file.path_for(0), Some(PathBuf::from("/tmp/out.txt")));
        assert_eq!(file.path_for(7), Some(PathBuf::from("/tmp/out.txt")));
        let dir = Destination::Numbered(PathBuf::from("/tmp/runs"));
        assert_eq!(dir.path_for(0), Some(PathBuf::from("/tmp/runs/callbench.0")));
        assert_eq!(dir.path_for(12), Some(PathBuf::from("/tmp/runs/callbench.12")));
    }

    #[test]
    fn test_check_destination_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, "old").unwrap();

        let config = RunConfig {
            destination: Destination::File(path.clone()),
            ..Default::default()
        };
        assert_eq!(
            config.check_destination(),
            Err(ConfigError::WouldOverwrite(path.clone()))
        );

        let config = RunConfig {
            destination: Destination::File(path),
            overwrite: true,
            ..Default::default()
        };
        assert!(config.check_destination().is_ok());
    }

    #[test]
    fn test_check_destination_refuses_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            destination: Destination::Numbered(dir.path().to_path_buf()),
            ..Default::default()
        };
        assert!(config.check_destination().is_ok());

        std::fs::write(dir.path().join("unrelated.txt"), "x").unwrap();
        assert!(config.check_destination().is_ok());

        std::fs::write(dir.path().join("callbench.0"), "x").unwrap();
        assert!(config.check_destination().is_err());
    }

    #[test]
    fn test_check_destination_requires_existing_outdir() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nonexistent").join("xyz");
        let config = RunConfig {
            destination: Destination::Numbered(missing.clone()),
            ..Default::default()
        };
        assert!(matches!(
            config.check_destination(),
            Err(ConfigError::Destination { path, .. }) if path == missing
        ));

        let file = dir.path().join("plain.txt");
        std::fs::write(&file, "x").unwrap();
        let config = RunConfig {
            destination: Destination::Numbered(file),
            ..Default::default()
        };
        assert!(matches!(
            config.check_destination(),
            Err(ConfigError::Destination { .. })
        ));
    }

    #[test]
    fn test_check_destination_requires_output_parent() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig {
            destination: Destination::File(dir.path().join("missing").join("out.txt")),
            ..Default::default()
        };
        let err = config.check_destination().unwrap_err();
        assert!(err.to_string().contains("parent directory does not exist"));
    }

    #[test]
    fn test_check_destination_rejects_directory_as_file() {
        let dir = tempfile::tempdir().unwrap();
        for overwrite in [false, true] {
            let config = RunConfig {
                destination: Destination::File(dir.path().to_path_buf()),
                overwrite,
                ..Default::default()
            };
            let err = config.check_destination().unwrap_err();
            assert!(err.to_string().contains("is a directory"), "{}", err);
        }
    }

    #[test]
    fn test_check_destination_leaves_no_trace() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        for destination in [
            Destination::File(out.clone()),
            Destination::Numbered(dir.path().to_path_buf()),
        ] {
            let config = RunConfig {
                destination,
                ..Default::default()
            };
            assert!(config.check_destination().is_ok());
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        assert!(!out.exists());
    }

    #[test]
    fn test_check_destination_refuses_read_only_dir() {
        use std::os::unix::fs::PermissionsExt;

        // Root bypasses permission bits
        if nix::unistd::geteuid().is_root() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        let numbered = RunConfig {
            destination: Destination::Numbered(locked.clone()),
            ..Default::default()
        };
        let file = RunConfig {
            destination: Destination::File(locked.join("out.txt")),
            ..Default::default()
        };
        let results = [numbered.check_destination(), file.check_destination()];

        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();
        for result in results {
            assert!(
                matches!(&result, Err(ConfigError::Destination { reason, .. }) if reason.contains("no permission")),
                "{:?}",
                result
            );
        }
    }
}
