use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen address (default: 0.0.0.0:8000).
    pub bind: SocketAddr,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the reference database file.
    pub db_path: PathBuf,
    /// Directory where enrollment photos are archived.
    pub refs_dir: PathBuf,
    /// A probe unlocks only if its best similarity is strictly above this.
    pub similarity_threshold: f32,
    /// Upper bound on a multipart request body.
    pub max_upload_bytes: usize,
    /// Lifetime of an enrollment token; `None` keeps tokens until used.
    pub token_ttl: Option<Duration>,
    /// Allowed CORS origins; empty allows any origin.
    pub cors_origins: Vec<String>,
    /// Optional directory of static frontend files served at `/`.
    pub static_dir: Option<PathBuf>,
    /// Timeout for a single engine request.
    pub request_timeout: Duration,
}

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_THRESHOLD: f32 = 0.65;

impl Config {
    /// Load configuration from `FACEUNLOCK_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = faceunlock_core::default_data_dir();

        let bind = std::env::var("FACEUNLOCK_BIND")
            .ok()
            .and_then(|v| match v.parse::<SocketAddr>() {
                Ok(addr) => Some(addr),
                Err(e) => {
                    tracing::warn!(value = %v, error = %e, "invalid FACEUNLOCK_BIND, using default");
                    None
                }
            })
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)));

        let token_ttl_secs = env_u64("FACEUNLOCK_TOKEN_TTL_SECS", 0);

        Self {
            bind,
            model_dir: env_path("FACEUNLOCK_MODEL_DIR")
                .unwrap_or_else(faceunlock_core::default_model_dir),
            db_path: env_path("FACEUNLOCK_DB_PATH").unwrap_or_else(|| data_dir.join("ref_db.json")),
            refs_dir: env_path("FACEUNLOCK_REFS_DIR").unwrap_or_else(|| data_dir.join("refs")),
            similarity_threshold: checked_threshold(env_f32(
                "FACEUNLOCK_SIMILARITY_THRESHOLD",
                DEFAULT_THRESHOLD,
            )),
            max_upload_bytes: env_usize("FACEUNLOCK_MAX_UPLOAD_BYTES", 10 * 1024 * 1024),
            token_ttl: (token_ttl_secs > 0).then(|| Duration::from_secs(token_ttl_secs)),
            cors_origins: std::env::var("FACEUNLOCK_CORS_ORIGINS")
                .map(|v| parse_list(&v))
                .unwrap_or_default(),
            static_dir: env_path("FACEUNLOCK_STATIC_DIR"),
            request_timeout: Duration::from_secs(env_u64("FACEUNLOCK_REQUEST_TIMEOUT_SECS", 30)),
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(faceunlock_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(faceunlock_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Configuration rooted at `dir`, for tests.
    #[cfg(test)]
    pub fn for_dir(dir: &std::path::Path) -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            model_dir: dir.join("models"),
            db_path: dir.join("ref_db.json"),
            refs_dir: dir.join("refs"),
            similarity_threshold: DEFAULT_THRESHOLD,
            max_upload_bytes: 1024 * 1024,
            token_ttl: None,
            cors_origins: Vec::new(),
            static_dir: None,
            request_timeout: Duration::from_secs(5),
        }
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn env_f32(key: &str, default: f32) -> f32 {
    parse_or(key, std::env::var(key).ok(), default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    parse_or(key, std::env::var(key).ok(), default)
}

fn env_usize(key: &str, default: usize) -> usize {
    parse_or(key, std::env::var(key).ok(), default)
}

/// Parse `raw` if set, warning and falling back to `default` when it does not parse.
fn parse_or<T>(key: &str, raw: Option<String>, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(key, value = %raw, error = %e, %default, "invalid value, using default");
            default
        }
    }
}

/// Similarity threshold; NaN or infinite values fall back to the default.
fn checked_threshold(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        tracing::warn!(value = %value, default = DEFAULT_THRESHOLD, "non-finite similarity threshold, using default");
        DEFAULT_THRESHOLD
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(
            parse_list(" http://a.test , ,http://b.test"),
            vec!["http://a.test".to_string(), "http://b.test".to_string()]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_model_paths() {
        let config = Config::for_dir(std::path::Path::new("/srv/fu"));
        assert_eq!(config.scrfd_model_path(), "/srv/fu/models/det_10g.onnx");
        assert_eq!(config.arcface_model_path(), "/srv/fu/models/w600k_r50.onnx");
    }

    #[test]
    fn test_parse_or_falls_back_on_garbage() {
        assert_eq!(parse_or("K", Some("12".into()), 30u64), 12);
        assert_eq!(parse_or("K", Some(" 7 ".into()), 30u64), 7);
        assert_eq!(parse_or("K", Some("soon".into()), 30u64), 30);
        assert_eq!(parse_or("K", Some("-1".into()), 10usize), 10);
        assert_eq!(parse_or("K", None, 0.65f32), 0.65);
    }

    #[test]
    fn test_non_finite_threshold_rejected() {
        let nan = parse_or("FACEUNLOCK_SIMILARITY_THRESHOLD", Some("NaN".into()), DEFAULT_THRESHOLD);
        assert!(nan.is_nan());
        assert_eq!(checked_threshold(nan), DEFAULT_THRESHOLD);
        assert_eq!(checked_threshold(f32::INFINITY), DEFAULT_THRESHOLD);
        assert_eq!(checked_threshold(0.4), 0.4);
    }
}
