use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Key lookup with profile fallback: `{PROFILE}_{KEY}` first, then `{KEY}`.
struct Source<'a> {
    profile: &'a str,
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Source<'_> {
    fn opt(&self, key: &str) -> Option<String> {
        let get = |k: &str| (self.lookup)(k).filter(|s| !s.trim().is_empty());
        if !self.profile.is_empty() {
            if let Some(v) = get(&format!("{}_{}", self.profile, key)) {
                return Some(v);
            }
        }
        get(key)
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.opt(key).unwrap_or_else(|| default.to_string())
    }

    fn path(&self, key: &str, default: &str) -> PathBuf {
        PathBuf::from(self.or(key, default))
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.opt(key) {
            Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                tracing::warn!(key, value = %raw, "unparseable config value, using default");
                default
            }),
            None => default,
        }
    }

    fn flag(&self, key: &str, default: bool) -> bool {
        match self.opt(key) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
            None => default,
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.opt(key)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub worker: WorkerConfig,
    pub tools: ToolsConfig,
    pub compute: ComputeConfig,
    pub notify: NotifyConfig,
    pub remote: RemoteConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `REFINERY_PROFILE`. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let lookup = |k: &str| env::var(k).ok();
        let profile = lookup("REFINERY_PROFILE").unwrap_or_default();
        Self::from_lookup(&profile, &lookup)
    }

    /// Build config from an arbitrary key source.
    pub fn from_lookup(profile: &str, lookup: &dyn Fn(&str) -> Option<String>) -> Self {
        let p = profile.to_uppercase();
        let src = Source { profile: &p, lookup };
        Self {
            profile: p.clone(),
            worker: WorkerConfig::from_source(&src),
            tools: ToolsConfig::from_source(&src),
            compute: ComputeConfig::from_source(&src),
            notify: NotifyConfig::from_source(&src),
            remote: RemoteConfig::from_source(&src),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  worker:   upload_dir={}, store={}, max_attempts={}",
            self.worker.upload_dir.display(), self.worker.job_store_dir.display(), self.worker.max_attempts);
        tracing::info!("  tools:    charmm={}, foxs={}, multifoxs={}",
            self.tools.charmm_bin.display(), self.tools.foxs_bin.display(), self.tools.multifoxs_bin.display());
        tracing::info!("  compute:  gpus=[{}], cpu_slots={}, md_failure_threshold={}",
            self.compute.gpu_devices.join(","), self.compute.cpu_slots(), self.compute.md_failure_threshold);
        tracing::info!("  notify:   enabled={}, smtp={}",
            self.notify.send_email_notifications, self.notify.smtp_host.as_deref().unwrap_or("(none)"));
        tracing::info!("  remote:   api={}, machine={}, poll={}s",
            self.remote.api_url, self.remote.machine, self.remote.poll_interval_secs);
    }
}

// ── Worker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Root of per-job working directories.
    pub upload_dir: PathBuf,
    pub job_store_dir: PathBuf,
    /// Attempts the outer retry harness makes before giving up.
    pub max_attempts: u32,
}

impl WorkerConfig {
    fn from_source(s: &Source<'_>) -> Self {
        Self {
            upload_dir: s.path("UPLOAD_DIR", "/bilbomd/uploads"),
            job_store_dir: s.path("JOB_STORE_DIR", "/bilbomd/jobs"),
            max_attempts: s.parse("MAX_ATTEMPTS", 3),
        }
    }
}

// ── External tools ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    pub python_bin: PathBuf,
    /// Directory holding the helper scripts (`pdb2crd.py`, `autorg.py`, ...).
    pub scripts_dir: PathBuf,
    pub charmm_bin: PathBuf,
    pub charmm_templates: PathBuf,
    pub charmm_topology: PathBuf,
    pub foxs_bin: PathBuf,
    pub multifoxs_bin: PathBuf,
    pub tar_bin: PathBuf,
    /// Python environment with PyMOL, used for trajectory movies.
    pub pymol_python: PathBuf,
}

impl ToolsConfig {
    fn from_source(s: &Source<'_>) -> Self {
        Self {
            python_bin: s.path("PYTHON_BIN", "/opt/envs/base/bin/python"),
            scripts_dir: s.path("SCRIPTS_DIR", "/app/scripts"),
            charmm_bin: s.path("CHARMM_BIN", "charmm"),
            charmm_templates: s.path("CHARMM_TEMPLATES", "/app/templates/bilbomd"),
            charmm_topology: s.path("CHARMM_TOPOLOGY", "/app/scripts/bilbomd_top_par_files.str"),
            foxs_bin: s.path("FOXS_BIN", "foxs"),
            multifoxs_bin: s.path("MULTIFOXS_BIN", "multi_foxs"),
            tar_bin: s.path("TAR_BIN", "tar"),
            pymol_python: s.path("PYMOL_PYTHON", "/opt/envs/openmm/bin/python"),
        }
    }

    pub fn script(&self, name: &str) -> PathBuf {
        self.scripts_dir.join(name)
    }
}

// ── Compute resources ─────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeConfig {
    /// Device ids handed out round-robin to GPU stages. Empty = CPU only.
    pub gpu_devices: Vec<String>,
    /// Share of logical cores used by CPU fan-out stages.
    pub cpu_fraction: f64,
    pub max_cpus: Option<usize>,
    /// Fraction of MD windows allowed to fail without failing the stage.
    pub md_failure_threshold: f64,
    pub scoring_progress_every: usize,
    pub md_timeout_secs: u64,
    pub step_timeout_secs: u64,
    pub script_timeout_secs: u64,
    pub heartbeat_secs: u64,
    pub scoring_heartbeat_secs: u64,
    pub movies: MovieConfig,
}

/// Rendering of MD trajectories to MP4 after OpenMM sampling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MovieConfig {
    pub enabled: bool,
    pub stride: u32,
    pub width: u32,
    pub height: u32,
    pub crf: u32,
    pub ray: bool,
    pub timeout_secs: u64,
}

impl MovieConfig {
    fn from_source(s: &Source<'_>) -> Self {
        Self {
            enabled: s.flag("RENDER_MOVIES", true),
            stride: s.parse("MOVIE_STRIDE", 10_u32).max(1),
            width: s.parse("MOVIE_WIDTH", 1280),
            height: s.parse("MOVIE_HEIGHT", 720),
            crf: s.parse("MOVIE_CRF", 22),
            ray: s.flag("MOVIE_RAY", true),
            timeout_secs: s.parse("MOVIE_TIMEOUT_SECS", 30 * 60),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ComputeConfig {
    fn from_source(s: &Source<'_>) -> Self {
        Self {
            gpu_devices: s.list("GPU_DEVICES"),
            cpu_fraction: s.parse("CPU_FRACTION", 0.8),
            max_cpus: s.opt("MAX_CPUS").and_then(|v| v.trim().parse().ok()),
            md_failure_threshold: s.parse("MD_FAILURE_THRESHOLD", 0.0_f64).clamp(0.0, 1.0),
            scoring_progress_every: s.parse("SCORING_PROGRESS_EVERY", 50_usize).max(1),
            md_timeout_secs: s.parse("MD_TIMEOUT_SECS", 2 * 60 * 60),
            step_timeout_secs: s.parse("STEP_TIMEOUT_SECS", 60 * 60),
            script_timeout_secs: s.parse("SCRIPT_TIMEOUT_SECS", 5 * 60),
            heartbeat_secs: s.parse("HEARTBEAT_SECS", 10),
            scoring_heartbeat_secs: s.parse("SCORING_HEARTBEAT_SECS", 30),
            movies: MovieConfig::from_source(s),
        }
    }

    /// Permits for CPU-bound fan-out: `cpu_fraction` of the logical cores,
    /// at least one, capped by `max_cpus`.
    pub fn cpu_slots(&self) -> usize {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let slots = ((cores as f64) * self.cpu_fraction).floor() as usize;
        let slots = slots.max(1);
        match self.max_cpus {
            Some(cap) => slots.min(cap.max(1)),
            None => slots,
        }
    }

    pub fn md_timeout(&self) -> Duration {
        Duration::from_secs(self.md_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn script_timeout(&self) -> Duration {
        Duration::from_secs(self.script_timeout_secs)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }

    pub fn scoring_heartbeat(&self) -> Duration {
        Duration::from_secs(self.scoring_heartbeat_secs.max(1))
    }
}

// ── Notifications ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub send_email_notifications: bool,
    pub smtp_host: Option<String>,
    pub smtp_port: Option<u16>,
    pub smtp_tls: Option<bool>,
    pub email_from: String,
    /// Public URL used to build links back to a job.
    pub base_url: String,
}

impl NotifyConfig {
    fn from_source(s: &Source<'_>) -> Self {
        Self {
            send_email_notifications: s.flag("SEND_EMAIL_NOTIFICATIONS", false),
            smtp_host: s.opt("SMTP_HOST"),
            smtp_port: s.opt("SMTP_PORT").and_then(|v| v.trim().parse().ok()),
            smtp_tls: s.opt("SMTP_TLS").map(|v| v.trim().eq_ignore_ascii_case("true")),
            email_from: s.or("EMAIL_FROM", "BilboMD <bilbomd-noreply@lbl.gov>"),
            base_url: s.or("BILBOMD_URL", "https://bilbomd.bl1231.als.lbl.gov"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.send_email_notifications && self.smtp_host.is_some()
    }
}

// ── Remote batch scheduler ────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub api_url: String,
    pub machine: String,
    /// File kept fresh by the external token refresher.
    pub token_file: Option<PathBuf>,
    pub poll_interval_secs: u64,
    /// Root of job directories on the remote host.
    pub scratch_dir: String,
    /// Script that copies a finished job back to shared storage.
    pub copy_script: String,
}

impl RemoteConfig {
    fn from_source(s: &Source<'_>) -> Self {
        Self {
            api_url: s.or("SFAPI_URL", "https://api.nersc.gov/api/v1.2"),
            machine: s.or("NERSC_MACHINE", "perlmutter"),
            token_file: s.opt("SFAPI_TOKEN_FILE").map(PathBuf::from),
            poll_interval_secs: s.parse("REMOTE_POLL_SECS", 60),
            scratch_dir: s.or("REMOTE_SCRATCH_DIR", "/pscratch/sd/s/sclassen/bilbmod"),
            copy_script: s.or("REMOTE_COPY_SCRIPT", "/global/cfs/cdirs/m4659/bilbomd-scripts/copy-back-to-cfs.sh"),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)], profile: &str) -> Config {
        let map: HashMap<String, String> =
            pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(profile, &move |k| map.get(k).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config_from(&[], "");
        assert_eq!(cfg.profile_label(), "default");
        assert_eq!(cfg.worker.max_attempts, 3);
        assert!(cfg.compute.gpu_devices.is_empty());
        assert_eq!(cfg.compute.md_failure_threshold, 0.0);
        assert_eq!(cfg.compute.scoring_progress_every, 50);
        assert_eq!(cfg.compute.md_timeout(), Duration::from_secs(7200));
        assert_eq!(cfg.compute.script_timeout(), Duration::from_secs(300));
        assert!(!cfg.notify.is_configured());
    }

    #[test]
    fn profile_keys_take_precedence() {
        let cfg = config_from(
            &[("UPLOAD_DIR", "/base"), ("PROD_UPLOAD_DIR", "/prod"), ("MAX_ATTEMPTS", "5")],
            "prod",
        );
        assert_eq!(cfg.profile, "PROD");
        assert_eq!(cfg.worker.upload_dir, PathBuf::from("/prod"));
        assert_eq!(cfg.worker.max_attempts, 5);
    }

    #[test]
    fn gpu_list_is_parsed_and_trimmed() {
        let cfg = config_from(&[("GPU_DEVICES", "0, 1,,3 ")], "");
        assert_eq!(cfg.compute.gpu_devices, vec!["0", "1", "3"]);
    }

    #[test]
    fn bad_numbers_fall_back_to_defaults() {
        let cfg = config_from(&[("MAX_ATTEMPTS", "three"), ("MD_FAILURE_THRESHOLD", "7")], "");
        assert_eq!(cfg.worker.max_attempts, 3);
        assert_eq!(cfg.compute.md_failure_threshold, 1.0);
    }

    #[test]
    fn movie_rendering_is_tunable() {
        let cfg = config_from(&[], "");
        assert!(cfg.compute.movies.enabled);
        assert_eq!((cfg.compute.movies.width, cfg.compute.movies.height), (1280, 720));

        let cfg = config_from(&[("RENDER_MOVIES", "false"), ("MOVIE_STRIDE", "0")], "");
        assert!(!cfg.compute.movies.enabled);
        assert_eq!(cfg.compute.movies.stride, 1);
    }

    #[test]
    fn cpu_slots_respect_cap() {
        let cfg = config_from(&[("MAX_CPUS", "1")], "");
        assert_eq!(cfg.compute.cpu_slots(), 1);
    }

    #[test]
    fn email_flag_accepts_truthy_values() {
        let cfg = config_from(&[("SEND_EMAIL_NOTIFICATIONS", "TRUE"), ("SMTP_HOST", "smtp.lbl.gov")], "");
        assert!(cfg.notify.is_configured());
    }
}
