//! Command-line arguments and how they layer over the config file.
//!
//! Settings resolve in order: built-in defaults, then the TOML file
//! given with `--config`, then environment variables, then flags. clap
//! handles the last two (a flag wins over its `RIPTIDE_*` variable), so
//! [`Cli::apply`] only has to copy whatever was set over the file.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use riptide_core::{AckPolicy, ConnectionConfig, DataType, ReadMode, ReplicationMode, RiptideConfig};

/// Replicate, compare and consume Redis-compatible stores.
#[derive(Parser, Debug)]
#[command(name = "riptide", version, about)]
pub struct Cli {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "RIPTIDE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    pub config_template: bool,

    /// port for the prometheus metrics endpoint. disabled when unset
    #[arg(long, env = "RIPTIDE_METRICS_PORT", global = true)]
    pub metrics_port: Option<u16>,

    #[command(flatten)]
    pub source: SourceArgs,

    #[command(flatten)]
    pub target: TargetArgs,

    #[command(flatten)]
    pub reader: ReaderArgs,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Args, Debug, Default)]
pub struct SourceArgs {
    /// source hostname
    #[arg(long, env = "RIPTIDE_SOURCE_HOST", global = true)]
    pub source_host: Option<String>,

    /// source port
    #[arg(long, env = "RIPTIDE_SOURCE_PORT", global = true)]
    pub source_port: Option<u16>,

    /// password for AUTH on the source
    #[arg(long, env = "RIPTIDE_SOURCE_PASSWORD", global = true, hide_env_values = true)]
    pub source_password: Option<String>,

    /// source database index
    #[arg(long, env = "RIPTIDE_SOURCE_DB", global = true)]
    pub source_db: Option<u32>,
}

#[derive(Args, Debug, Default)]
pub struct TargetArgs {
    /// target hostname
    #[arg(long, env = "RIPTIDE_TARGET_HOST", global = true)]
    pub target_host: Option<String>,

    /// target port
    #[arg(long, env = "RIPTIDE_TARGET_PORT", global = true)]
    pub target_port: Option<u16>,

    /// password for AUTH on the target
    #[arg(long, env = "RIPTIDE_TARGET_PASSWORD", global = true, hide_env_values = true)]
    pub target_password: Option<String>,

    /// target database index
    #[arg(long, env = "RIPTIDE_TARGET_DB", global = true)]
    pub target_db: Option<u32>,
}

#[derive(Args, Debug, Default)]
pub struct ReaderArgs {
    /// only read keys matching this glob pattern
    #[arg(long, env = "RIPTIDE_KEY_PATTERN", global = true)]
    pub key_pattern: Option<String>,

    /// only read keys of this type (string, list, set, zset, hash, stream)
    #[arg(long, env = "RIPTIDE_KEY_TYPE", global = true)]
    pub key_type: Option<DataType>,

    /// keys per batch
    #[arg(long, env = "RIPTIDE_CHUNK_SIZE", global = true)]
    pub chunk_size: Option<usize>,

    /// number of concurrent chunk workers
    #[arg(long, env = "RIPTIDE_THREADS", global = true)]
    pub threads: Option<usize>,

    /// how values are read: typed structures or DUMP payloads
    #[arg(long, value_enum, env = "RIPTIDE_READ_MODE", global = true)]
    pub read_mode: Option<ReadModeArg>,

    /// stop live reading after this many milliseconds without a change
    #[arg(long, env = "RIPTIDE_IDLE_TIMEOUT_MS", global = true)]
    pub idle_timeout_ms: Option<u64>,

    /// read keys larger than this many bytes without their value
    #[arg(long, env = "RIPTIDE_MEM_LIMIT", global = true)]
    pub mem_limit: Option<u64>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Copy keys from the source to the target.
    Replicate {
        /// scan once, scan then follow changes, or only follow changes
        #[arg(long, value_enum, default_value_t = ModeArg::Scan)]
        mode: ModeArg,

        /// add collection members to existing target keys instead of
        /// replacing them
        #[arg(long)]
        merge: bool,

        /// extra attempts for batches that fail with a transient error
        #[arg(long)]
        retry_limit: Option<u32>,
    },

    /// Compare every source key with the same key on the target.
    Compare {
        /// tolerated expiry difference in milliseconds
        #[arg(long)]
        ttl_tolerance_ms: Option<u64>,

        /// compare mismatching keys a second time before reporting them
        #[arg(long)]
        recheck: bool,

        /// how many mismatching keys to list
        #[arg(long, default_value_t = 20)]
        show: usize,
    },

    /// Read a stream from the source as a consumer-group member.
    Stream {
        /// stream key
        #[arg(long)]
        key: Option<String>,

        /// consumer group, created when missing
        #[arg(long)]
        group: Option<String>,

        /// consumer name within the group
        #[arg(long)]
        consumer: Option<String>,

        /// acknowledge on read (auto) or after printing (manual)
        #[arg(long, value_enum)]
        ack: Option<AckArg>,

        /// resume pending-entry recovery after this id
        #[arg(long)]
        offset: Option<String>,

        /// exit after this many entries
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Fill the source with random keys.
    Generate {
        /// key name prefix
        #[arg(long, default_value = "gen")]
        prefix: String,

        /// number of keys
        #[arg(long, default_value_t = 100)]
        count: usize,

        /// comma-separated data types to generate. default: all
        #[arg(long, value_delimiter = ',')]
        types: Vec<DataType>,

        /// elements per collection
        #[arg(long, default_value_t = 10)]
        collection_size: usize,

        /// bytes per string value
        #[arg(long, default_value_t = 100)]
        string_size: usize,

        /// minimum expiry in milliseconds. keys don't expire when unset
        #[arg(long)]
        ttl_min_ms: Option<u64>,

        /// maximum expiry in milliseconds. defaults to the minimum
        #[arg(long, requires = "ttl_min_ms")]
        ttl_max_ms: Option<u64>,

        /// seed for reproducible data
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Scan,
    Live,
    LiveOnly,
}

impl From<ModeArg> for ReplicationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Scan => ReplicationMode::Scan,
            ModeArg::Live => ReplicationMode::Live,
            ModeArg::LiveOnly => ReplicationMode::LiveOnly,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadModeArg {
    Struct,
    Dump,
}

impl From<ReadModeArg> for ReadMode {
    fn from(mode: ReadModeArg) -> Self {
        match mode {
            ReadModeArg::Struct => ReadMode::Struct,
            ReadModeArg::Dump => ReadMode::Dump,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum AckArg {
    Auto,
    Manual,
}

impl From<AckArg> for AckPolicy {
    fn from(ack: AckArg) -> Self {
        match ack {
            AckArg::Auto => AckPolicy::Auto,
            AckArg::Manual => AckPolicy::Manual,
        }
    }
}

fn apply_connection(
    cfg: &mut ConnectionConfig,
    host: &Option<String>,
    port: Option<u16>,
    password: &Option<String>,
    db: Option<u32>,
) {
    if let Some(host) = host {
        cfg.host = host.clone();
    }
    if let Some(port) = port {
        cfg.port = port;
    }
    if let Some(password) = password {
        cfg.password = Some(password.clone());
    }
    if let Some(db) = db {
        cfg.database = db;
    }
}

impl Cli {
    /// Overrides `cfg` with every setting given on the command line or
    /// in the environment.
    pub fn apply(&self, cfg: &mut RiptideConfig) {
        let s = &self.source;
        apply_connection(&mut cfg.source, &s.source_host, s.source_port, &s.source_password, s.source_db);
        let t = &self.target;
        apply_connection(&mut cfg.target, &t.target_host, t.target_port, &t.target_password, t.target_db);

        let r = &self.reader;
        if let Some(ref pattern) = r.key_pattern {
            cfg.reader.key_pattern = Some(pattern.clone());
        }
        if let Some(key_type) = r.key_type {
            cfg.reader.key_type = Some(key_type);
        }
        if let Some(n) = r.chunk_size {
            cfg.reader.chunk_size = n;
        }
        if let Some(n) = r.threads {
            cfg.reader.threads = n;
        }
        if let Some(mode) = r.read_mode {
            cfg.reader.mode = mode.into();
        }
        if let Some(ms) = r.idle_timeout_ms {
            cfg.reader.idle_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(limit) = r.mem_limit {
            cfg.reader.mem_usage_limit = Some(limit);
        }

        match &self.command {
            Some(Command::Replicate {
                merge, retry_limit, ..
            }) => {
                if *merge {
                    cfg.writer.merge = true;
                }
                if let Some(n) = retry_limit {
                    cfg.writer.retry_limit = *n;
                }
            }
            Some(Command::Compare {
                ttl_tolerance_ms,
                recheck,
                ..
            }) => {
                if let Some(ms) = ttl_tolerance_ms {
                    cfg.compare.ttl_tolerance = Duration::from_millis(*ms);
                }
                if *recheck {
                    cfg.compare.recheck = true;
                }
            }
            Some(Command::Stream {
                key,
                group,
                consumer,
                ack,
                offset,
                ..
            }) => {
                if let Some(key) = key {
                    cfg.stream.key = key.clone();
                }
                if let Some(group) = group {
                    cfg.stream.group = group.clone();
                }
                if let Some(consumer) = consumer {
                    cfg.stream.consumer = consumer.clone();
                }
                if let Some(ack) = ack {
                    cfg.stream.ack_policy = (*ack).into();
                }
                if let Some(offset) = offset {
                    cfg.stream.offset = Some(offset.clone());
                }
            }
            Some(Command::Generate { .. }) | None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("riptide").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn flags_override_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[source]\nhost = \"10.0.0.5\"\nport = 7000\n\n[reader]\nchunk_size = 500\nthreads = 4"
        )
        .unwrap();

        let cli = parse(&["replicate", "--source-port", "7001", "--chunk-size", "25", "--merge"]);
        let mut cfg = RiptideConfig::from_file(file.path()).unwrap();
        cli.apply(&mut cfg);

        // from the file
        assert_eq!(cfg.source.host, "10.0.0.5");
        assert_eq!(cfg.reader.threads, 4);
        // from flags
        assert_eq!(cfg.source.port, 7001);
        assert_eq!(cfg.reader.chunk_size, 25);
        assert!(cfg.writer.merge);
        // untouched defaults
        assert_eq!(cfg.target.port, 6379);
    }

    #[test]
    fn stream_settings() {
        let cli = parse(&[
            "stream", "--key", "orders", "--group", "billing", "--consumer", "c1", "--ack",
            "manual", "--offset", "5-0",
        ]);
        let mut cfg = RiptideConfig::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.stream.key, "orders");
        assert_eq!(cfg.stream.group, "billing");
        assert_eq!(cfg.stream.ack_policy, AckPolicy::Manual);
        assert_eq!(cfg.stream.offset.as_deref(), Some("5-0"));
        assert!(cfg.stream.validate().is_ok());
    }

    #[test]
    fn reader_flags() {
        let cli = parse(&[
            "compare",
            "--key-type",
            "hash",
            "--read-mode",
            "dump",
            "--idle-timeout-ms",
            "1500",
            "--ttl-tolerance-ms",
            "250",
        ]);
        let mut cfg = RiptideConfig::default();
        cli.apply(&mut cfg);
        assert_eq!(cfg.reader.key_type, Some(DataType::Hash));
        assert_eq!(cfg.reader.mode, ReadMode::Dump);
        assert_eq!(cfg.reader.idle_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(cfg.compare.ttl_tolerance, Duration::from_millis(250));
    }

    #[test]
    fn generate_types() {
        let cli = parse(&["generate", "--types", "hash,zset", "--count", "5"]);
        match cli.command {
            Some(Command::Generate { types, count, .. }) => {
                assert_eq!(types, [DataType::Hash, DataType::ZSet]);
                assert_eq!(count, 5);
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(Cli::try_parse_from(["riptide", "generate", "--types", "nope"]).is_err());
    }

    #[test]
    fn replication_modes() {
        let cli = parse(&["replicate", "--mode", "live-only"]);
        assert!(matches!(
            cli.command,
            Some(Command::Replicate {
                mode: ModeArg::LiveOnly,
                ..
            })
        ));
    }
}
