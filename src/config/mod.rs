// src/config/mod.rs
// Environment-based configuration - single source of truth for all env vars

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Fixed language-override prefixes injected as the leading system message
/// of every emitted part when `MEMU_OUTPUT_LANG` is set.
const LANG_PREFIX_ZH: &str = "\
## Language Override (CRITICAL - MUST FOLLOW)
- ALL output MUST be in Chinese (中文), regardless of example language.
- Use \"用户\" instead of \"the user\" or \"User\".
- You MUST write all memory content in Chinese.";

const LANG_PREFIX_EN: &str = "\
## Language Override
- ALL output MUST be in English.
- Use \"the user\" to refer to the user.";

const LANG_PREFIX_JA: &str = "\
## Language Override (重要)
- ALL output MUST be in Japanese (日本語).
- Use \"ユーザー\" instead of \"the user\".";

/// One LLM profile for the memory service (chat extraction or embedding).
#[derive(Debug, Clone, Default)]
pub struct LlmProfile {
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

impl LlmProfile {
    fn from_env(prefix: &str) -> Self {
        Self {
            provider: read_env(&format!("{prefix}_PROVIDER")),
            base_url: read_env(&format!("{prefix}_BASE_URL")),
            api_key: read_env(&format!("{prefix}_API_KEY")),
            model: read_env(&format!("{prefix}_MODEL")),
        }
    }
}

/// Connection settings for the external memory service.
#[derive(Debug, Clone)]
pub struct ServiceProfiles {
    /// Base URL of the memory service HTTP endpoint (MEMU_SERVER_BASE_URL).
    pub server_base_url: String,
    /// Chat/extraction profile (MEMU_CHAT_*).
    pub chat: LlmProfile,
    /// Embedding profile (MEMU_EMBED_*).
    pub embed: LlmProfile,
}

impl Default for ServiceProfiles {
    fn default() -> Self {
        Self {
            server_base_url: "http://127.0.0.1:8600".to_string(),
            chat: LlmProfile::default(),
            embed: LlmProfile::default(),
        }
    }
}

impl ServiceProfiles {
    pub fn from_env() -> Self {
        Self {
            server_base_url: read_env("MEMU_SERVER_BASE_URL")
                .unwrap_or_else(|| "http://127.0.0.1:8600".to_string()),
            chat: LlmProfile::from_env("MEMU_CHAT"),
            embed: LlmProfile::from_env("MEMU_EMBED"),
        }
    }
}

/// Immutable per-invocation configuration, resolved once from the
/// environment and passed to each component. No shared mutable singletons.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Directory of session JSONL files (OPENCLAW_SESSIONS_DIR).
    pub sessions_dir: PathBuf,
    /// Root for state, conversations, logs (MEMU_DATA_DIR).
    pub data_dir: PathBuf,
    /// Root for workspace path resolution (MEMU_WORKSPACE_DIR).
    pub workspace_dir: PathBuf,
    /// Extra doc files/dirs to ingest (MEMU_EXTRA_PATHS, JSON array).
    pub extra_paths: Vec<PathBuf>,
    /// User scope for all memory operations (MEMU_USER_ID).
    pub user_id: String,
    /// Output language for memory content (MEMU_OUTPUT_LANG).
    pub output_lang: Option<String>,
    /// Messages per immutable part; `<= 0` selects single-file overwrite
    /// mode (MEMU_MAX_MESSAGES_PER_SESSION).
    pub max_messages: i64,
    /// Per-item memorize timeout (MEMU_MEMORIZE_TIMEOUT_SECONDS).
    pub memorize_timeout: Duration,
    /// Rate-limit backoff base (MEMU_RATE_LIMIT_BACKOFF_SECONDS).
    pub backoff_base: Duration,
    /// Rate-limit backoff cap (MEMU_RATE_LIMIT_BACKOFF_MAX_SECONDS).
    pub backoff_max: Duration,
    /// Tail idle-finalization window (MEMU_FLUSH_IDLE_SECONDS).
    pub flush_idle: Duration,
    /// Idle poll period for the watcher (MEMU_FLUSH_POLL_SECONDS).
    pub flush_poll: Duration,
    /// Finalize the tail regardless of the idle window (MEMU_FORCE_FLUSH).
    pub force_flush: bool,
    /// Incremental docs ingest target set by the watcher (MEMU_CHANGED_PATH).
    pub changed_path: Option<PathBuf>,
    /// Memory service connection settings.
    pub service: ServiceProfiles,
}

impl SyncConfig {
    /// Load all environment configuration (call once at worker startup).
    pub fn from_env() -> Self {
        let sessions_dir = read_env("OPENCLAW_SESSIONS_DIR")
            .map(PathBuf::from)
            .unwrap_or_default();
        let data_dir = read_env("MEMU_DATA_DIR").map(PathBuf::from).unwrap_or_default();
        let workspace_dir = read_env("MEMU_WORKSPACE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::home_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join(".openclaw/workspace")
            });

        Self {
            sessions_dir,
            data_dir,
            workspace_dir,
            extra_paths: parse_extra_paths(read_env("MEMU_EXTRA_PATHS").as_deref()),
            user_id: read_env("MEMU_USER_ID").unwrap_or_else(|| "default".to_string()),
            output_lang: read_env("MEMU_OUTPUT_LANG"),
            max_messages: parse_i64_env("MEMU_MAX_MESSAGES_PER_SESSION", 60),
            memorize_timeout: Duration::from_secs(parse_u64_env(
                "MEMU_MEMORIZE_TIMEOUT_SECONDS",
                600,
            )),
            backoff_base: Duration::from_secs(parse_u64_env("MEMU_RATE_LIMIT_BACKOFF_SECONDS", 60)),
            backoff_max: Duration::from_secs(parse_u64_env(
                "MEMU_RATE_LIMIT_BACKOFF_MAX_SECONDS",
                900,
            )),
            flush_idle: Duration::from_secs(parse_u64_env("MEMU_FLUSH_IDLE_SECONDS", 1800)),
            flush_poll: Duration::from_secs(parse_u64_env("MEMU_FLUSH_POLL_SECONDS", 60)),
            force_flush: parse_bool_env("MEMU_FORCE_FLUSH").unwrap_or(false),
            changed_path: read_env("MEMU_CHANGED_PATH").map(PathBuf::from),
            service: ServiceProfiles::from_env(),
        }
    }

    /// Directory holding part files, tail files, and `state.json`.
    pub fn conversations_dir(&self) -> PathBuf {
        self.data_dir.join("conversations")
    }

    pub fn state_path(&self) -> PathBuf {
        self.conversations_dir().join("state.json")
    }

    pub fn pending_path(&self) -> PathBuf {
        self.data_dir.join("pending_ingest.json")
    }

    pub fn backoff_path(&self) -> PathBuf {
        self.data_dir.join("pending_backoff.json")
    }

    pub fn last_sync_path(&self) -> PathBuf {
        self.data_dir.join("last_sync_ts")
    }

    pub fn full_scan_marker_path(&self) -> PathBuf {
        self.data_dir.join("docs_full_scan.marker")
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir.join("memu.db")
    }

    /// Resolved language-instruction prefix, if any.
    ///
    /// `zh`/`en`/`ja` map to the fixed override blocks; any other non-empty
    /// value is used verbatim.
    pub fn lang_prefix(&self) -> Option<String> {
        let lang = self.output_lang.as_deref()?.trim();
        if lang.is_empty() {
            return None;
        }
        Some(match lang {
            "zh" => LANG_PREFIX_ZH.to_string(),
            "en" => LANG_PREFIX_EN.to_string(),
            "ja" => LANG_PREFIX_JA.to_string(),
            other => other.to_string(),
        })
    }

    /// Validate the configuration for a worker run. Errors block the run,
    /// warnings are logged and the run proceeds.
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if self.sessions_dir.as_os_str().is_empty() {
            validation.add_error("OPENCLAW_SESSIONS_DIR is not set");
        } else if !self.sessions_dir.exists() {
            validation.add_warning(format!(
                "session dir {} does not exist",
                self.sessions_dir.display()
            ));
        }

        if self.data_dir.as_os_str().is_empty() {
            validation.add_error("MEMU_DATA_DIR is not set");
        }

        if self.backoff_base > self.backoff_max {
            validation.add_warning("MEMU_RATE_LIMIT_BACKOFF_SECONDS exceeds the configured cap");
        }

        for p in &self.extra_paths {
            if !p.exists() {
                validation.add_warning(format!("extra path {} not found", p.display()));
            }
        }

        validation
    }
}

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Log warnings; format errors as a single report line.
    pub fn report(&self) -> String {
        for w in &self.warnings {
            warn!("{}", w);
        }
        self.errors.join("; ")
    }
}

/// Read a single env var, filtering empty values.
fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn parse_u64_env(name: &str, default: u64) -> u64 {
    match read_env(name) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!(value = %v, "invalid {}, using default {}", name, default);
            default
        }),
        None => default,
    }
}

fn parse_i64_env(name: &str, default: i64) -> i64 {
    match read_env(name) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!(value = %v, "invalid {}, using default {}", name, default);
            default
        }),
        None => default,
    }
}

/// MEMU_EXTRA_PATHS is a JSON array of strings; anything else degrades to
/// an empty list.
fn parse_extra_paths(raw: Option<&str>) -> Vec<PathBuf> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => items
            .into_iter()
            .filter_map(|v| v.as_str().map(PathBuf::from))
            .collect(),
        _ => {
            debug!("MEMU_EXTRA_PATHS is not a JSON array of strings; ignoring");
            Vec::new()
        }
    }
}

/// Test-friendly constructor: defaults with explicit directories.
impl SyncConfig {
    pub fn for_dirs(sessions_dir: &Path, data_dir: &Path) -> Self {
        Self {
            sessions_dir: sessions_dir.to_path_buf(),
            data_dir: data_dir.to_path_buf(),
            workspace_dir: data_dir.to_path_buf(),
            extra_paths: Vec::new(),
            user_id: "default".to_string(),
            output_lang: None,
            max_messages: 60,
            memorize_timeout: Duration::from_secs(600),
            backoff_base: Duration::from_secs(60),
            backoff_max: Duration::from_secs(900),
            flush_idle: Duration::from_secs(1800),
            flush_poll: Duration::from_secs(60),
            force_flush: false,
            changed_path: None,
            service: ServiceProfiles::default(),
        }
    }
}
