use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the bridge.
///
/// Loaded from the environment once at startup, validated, then immutable.
/// A bad configuration refuses to start rather than run half-configured.
#[derive(Clone, Debug)]
pub struct Config {
    // Agent service
    pub agent_url: String,
    pub completion_timeout: Duration,

    // Triggers
    pub ai_prefix: String,

    // signal-cli
    pub signal_cli_path: PathBuf,
    pub signal_account: Option<String>,
    pub signal_timeout: Duration,

    // Dispatch cadence
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub pending_ttl: Duration,
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        let agent_url = env_str("AGENT_URL").and_then(non_empty).ok_or_else(|| {
            Error::Config("AGENT_URL environment variable is required".to_string())
        })?;
        validate_agent_url(&agent_url)?;

        let ai_prefix = env_str("AI_PREFIX")
            .and_then(non_empty)
            .unwrap_or_else(|| "!ai".to_string());

        let signal_cli_path = env_path("SIGNAL_CLI_PATH")
            .or_else(|| which_in_path("signal-cli"))
            .unwrap_or_else(|| PathBuf::from("/usr/local/bin/signal-cli"));
        let signal_account = env_str("SIGNAL_ACCOUNT").and_then(non_empty);

        let poll_interval = Duration::from_secs(env_u64("POLL_INTERVAL_SECS").unwrap_or(5));
        let sweep_interval = Duration::from_secs(env_u64("SWEEP_INTERVAL_SECS").unwrap_or(60));
        let pending_ttl = Duration::from_secs(env_u64("PENDING_TTL_SECS").unwrap_or(300));
        let completion_timeout =
            Duration::from_secs(env_u64("COMPLETION_TIMEOUT_SECS").unwrap_or(30));
        let signal_timeout = Duration::from_secs(env_u64("SIGNAL_TIMEOUT_SECS").unwrap_or(60));

        Ok(Self {
            agent_url,
            completion_timeout,
            ai_prefix,
            signal_cli_path,
            signal_account,
            signal_timeout,
            poll_interval,
            sweep_interval,
            pending_ttl,
        })
    }
}

fn validate_agent_url(url: &str) -> Result<()> {
    if url.starts_with("http://") || url.starts_with("https://") {
        return Ok(());
    }
    Err(Error::Config(format!(
        "invalid AGENT_URL {url}: must start with http:// or https://"
    )))
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }
        if env::var_os(key).is_some() {
            continue; // do not override existing env
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        env::set_var(key, val);
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn which_in_path(binary: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(binary);
        if is_executable_file(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable_file(p: &Path) -> bool {
    if !p.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(md) = fs::metadata(p) {
            return (md.permissions().mode() & 0o111) != 0;
        }
    }
    true
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
