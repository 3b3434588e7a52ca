mod resolve;
pub mod wsl;


pub use resolve::{
    ENV_CONNECTION_FILE, ENV_INSTANCE_ID, ENV_PROCESS_ID, ENV_PROJECT_DIR, ENV_PROJECT_ROOT,
    ENV_WS_URL, EndpointCandidate, EndpointResolution, EndpointSelector, list_endpoint_candidates,
    normalize_fs_path, normalize_ws_url, os_env, resolve_ws_endpoint,
};
