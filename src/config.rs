use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct Config {
    pub api_base_url: String,
    pub realtime_url: String,
    pub secrets_path: PathBuf,
    pub log_file: PathBuf,
    pub log_filter: String,
}

impl Config {
    /// Reads `CHATWATCH_*` variables, after loading `.env` from the working
    /// directory if there is one.
    pub fn load() -> Self {
        dotenvy::dotenv().ok();
        let debug = cfg!(debug_assertions);

        let api_base_url = env::var("CHATWATCH_API_BASE_URL").unwrap_or_else(|_| {
            if debug {
                "http://localhost:8081/v1".to_string()
            } else {
                format!("https://{DEFAULT_GATEWAY_HOST}/v1")
            }
        });
        let api_base_url = api_base_url.trim_end_matches('/').to_string();

        let realtime_url = env::var("CHATWATCH_REALTIME_URL").unwrap_or_else(|_| {
            if debug {
                "ws://localhost:8081/updates".to_string()
            } else {
                format!("wss://{DEFAULT_GATEWAY_HOST}/updates")
            }
        });
        let realtime_url = realtime_url.trim_end_matches('/').to_string();

        let data_dir = env::var("CHATWATCH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_data_dir(debug));
        let secrets_path = env::var("CHATWATCH_SECRETS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("secrets.json"));
        let log_file = env::var("CHATWATCH_LOG_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_LOG_FILE));
        let log_filter = env::var("CHATWATCH_LOG")
            .ok()
            .filter(|filter| !filter.trim().is_empty())
            .unwrap_or_else(|| "info".to_string());

        Self {
            api_base_url,
            realtime_url,
            secrets_path,
            log_file,
            log_filter,
        }
    }
}

const DEFAULT_GATEWAY_HOST: &str = "gateway.chatwatch.dev";
const DEFAULT_LOG_FILE: &str = "application.log";

fn default_data_dir(debug: bool) -> PathBuf {
    let base = env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."));
    let dir_name = if debug { "chatwatch-dev" } else { "chatwatch" };
    base.join(".local").join("share").join(dir_name)
}
