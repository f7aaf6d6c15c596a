use hadir_core::DEFAULT_MATCH_THRESHOLD;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server listens on (default: 127.0.0.1:8080).
    pub bind_addr: SocketAddr,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Directory enrollment photos are written to.
    pub upload_dir: PathBuf,
    /// Largest Euclidean distance accepted as a match.
    pub match_threshold: f32,
    /// Enrollment samples kept per student; extra samples are dropped.
    pub max_samples: usize,
    /// Largest decoded enrollment photo in bytes.
    pub max_image_bytes: usize,
    /// Largest accepted request body in bytes.
    pub max_body_bytes: usize,
    /// Optional TOML roster imported at startup.
    pub roster_path: Option<PathBuf>,
    /// Store photos as data URLs in the database instead of files.
    pub inline_photos: bool,
}

impl Config {
    /// Load configuration from `HADIR_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("hadir");

        let db_path = std::env::var("HADIR_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("attendance.db"));

        let upload_dir = std::env::var("HADIR_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("uploads"));

        let bind_addr = std::env::var("HADIR_BIND")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 8080)));

        Self {
            bind_addr,
            db_path,
            upload_dir,
            match_threshold: env_f32("HADIR_MATCH_THRESHOLD", DEFAULT_MATCH_THRESHOLD),
            max_samples: env_usize("HADIR_MAX_SAMPLES", 15),
            max_image_bytes: env_usize("HADIR_MAX_IMAGE_BYTES", 2 * 1024 * 1024),
            max_body_bytes: env_usize("HADIR_MAX_BODY_BYTES", 6 * 1024 * 1024),
            roster_path: std::env::var("HADIR_ROSTER_PATH").ok().map(PathBuf::from),
            inline_photos: std::env::var("HADIR_INLINE_PHOTOS")
                .map(|v| v != "0")
                .unwrap_or(false),
        }
    }
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
