use anyhow::Context as _;
use nix::sys::signal::Signal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

const DEV_NULL: &str = "/dev/null";

/// Validated supervisor configuration. Everything the daemon needs after
/// load time; path fields are already `$VAR`-expanded and resolved.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub working_dir: PathBuf,
    pub control_dir: PathBuf,
    pub log_file: Option<PathBuf>,
    pub log_level: tracing::Level,
    /// Jobs indexed by name. A BTreeMap keeps `list-jobs` output stable.
    pub jobs: BTreeMap<String, JobConfig>,
}

/// Per-job configuration, immutable after load.
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub name: String,
    /// Command line, interpreted by `/bin/sh -c`.
    pub command: String,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    /// Environment overlay applied on top of the daemon's own environment.
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
    /// Signal delivered on stop requests.
    pub stop_signal: Signal,
    pub autostart: bool,
    pub restart: bool,
}

// -------- YAML file schema (strict) --------

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    supervisor: Option<SupervisorSection>,
    jobs: BTreeMap<String, JobSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SupervisorSection {
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    control_dir: Option<String>,
    #[serde(default)]
    log_file: Option<String>,
    #[serde(default)]
    log_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct JobSection {
    command: String,
    #[serde(default)]
    stdin: Option<String>,
    #[serde(default)]
    stdout: Option<String>,
    #[serde(default)]
    stderr: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    signal: Option<String>,
    #[serde(default)]
    autostart: bool,
    #[serde(default)]
    restart: bool,
}

/// Expands `$NAME` / `${NAME}` references against the daemon's environment.
///
/// Unknown variables are left intact and `$$` yields a literal `$`, so paths
/// containing stray dollar signs survive a round trip through the config.
pub fn expand_path_vars(path: &str) -> String {
    let mut out = String::with_capacity(path.len());
    let mut chars = path.char_indices().peekable();

    while let Some((_, ch)) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some((_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some((start, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                if closed && !name.is_empty() {
                    match std::env::var(&name) {
                        Ok(v) => out.push_str(&v),
                        Err(_) => {
                            out.push_str("${");
                            out.push_str(&name);
                            out.push('}');
                        }
                    }
                } else {
                    // Unterminated brace: reproduce the input verbatim.
                    out.push_str(&path[start - 1..]);
                    break;
                }
            }
            Some((_, c)) if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some((_, c)) = chars.peek().copied() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match std::env::var(&name) {
                    Ok(v) => out.push_str(&v),
                    Err(_) => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push('$'),
        }
    }

    out
}

/// Parses a signal name, with or without the `SIG` prefix, case-insensitive.
pub fn parse_signal(name: &str) -> anyhow::Result<Signal> {
    let t = name.trim().to_ascii_uppercase();
    let full = if t.starts_with("SIG") {
        t
    } else {
        format!("SIG{t}")
    };
    Signal::from_str(&full).map_err(|_| anyhow::anyhow!("unknown signal name: {name:?}"))
}

fn parse_log_level(name: &str) -> anyhow::Result<tracing::Level> {
    match name.trim().to_ascii_lowercase().as_str() {
        "error" | "critical" => Ok(tracing::Level::ERROR),
        "warn" | "warning" => Ok(tracing::Level::WARN),
        "info" => Ok(tracing::Level::INFO),
        "debug" => Ok(tracing::Level::DEBUG),
        "trace" => Ok(tracing::Level::TRACE),
        _ => anyhow::bail!("unknown log level: {name:?} (use error/warn/info/debug/trace)"),
    }
}

fn expanded_path(raw: &str) -> PathBuf {
    PathBuf::from(expand_path_vars(raw))
}

pub fn load_config(config_path: &Path) -> anyhow::Result<SupervisorConfig> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read config {}", config_path.display()))?;
    let file_cfg: ConfigFile = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config {}", config_path.display()))?;
    build_config(file_cfg)
}

fn build_config(file_cfg: ConfigFile) -> anyhow::Result<SupervisorConfig> {
    let sup = file_cfg.supervisor.unwrap_or_default();

    let working_dir = sup
        .working_dir
        .as_deref()
        .map(expanded_path)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut control_dir = sup
        .control_dir
        .as_deref()
        .map(expanded_path)
        .unwrap_or_else(|| PathBuf::from("."));
    if control_dir.is_relative() {
        control_dir = working_dir.join(control_dir);
    }
    let log_file = sup.log_file.as_deref().map(expanded_path).map(|p| {
        if p.is_relative() {
            working_dir.join(p)
        } else {
            p
        }
    });
    let log_level = match sup.log_level.as_deref() {
        Some(l) => parse_log_level(l)?,
        None => tracing::Level::WARN,
    };

    anyhow::ensure!(!file_cfg.jobs.is_empty(), "no jobs are configured");

    let mut jobs = BTreeMap::new();
    for (name, job) in file_cfg.jobs {
        anyhow::ensure!(!name.trim().is_empty(), "job names must not be empty");
        anyhow::ensure!(
            name.trim() == name,
            "job name must not have leading/trailing whitespace: {name:?}"
        );
        anyhow::ensure!(
            !job.command.trim().is_empty(),
            "job {name}: command must not be empty"
        );

        let stop_signal = match job.signal.as_deref() {
            Some(s) => parse_signal(s).with_context(|| format!("job {name}"))?,
            None => Signal::SIGTERM,
        };

        jobs.insert(
            name.clone(),
            JobConfig {
                name: name.clone(),
                command: job.command,
                stdin: job
                    .stdin
                    .as_deref()
                    .map(expanded_path)
                    .unwrap_or_else(|| PathBuf::from(DEV_NULL)),
                stdout: job
                    .stdout
                    .as_deref()
                    .map(expanded_path)
                    .unwrap_or_else(|| PathBuf::from(DEV_NULL)),
                stderr: job
                    .stderr
                    .as_deref()
                    .map(expanded_path)
                    .unwrap_or_else(|| PathBuf::from(DEV_NULL)),
                env: job.env,
                working_dir: job.working_dir.as_deref().map(expanded_path),
                stop_signal,
                autostart: job.autostart,
                restart: job.restart,
            },
        );
    }

    Ok(SupervisorConfig {
        working_dir,
        control_dir,
        log_file,
        log_level,
        jobs,
    })
}
