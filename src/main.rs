pub mod models {
    pub mod honeywell;
}

pub mod auth;
pub mod client;
pub mod config;
pub mod utils;
pub mod services {
    pub mod controller;
    pub mod scheduler;
    pub mod session;
}

use crate::auth::flow::AuthorizationFlow;
use crate::auth::{FileTokenStore, TokenSet, TokenStore};
use crate::client::HoneywellClient;
use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::services::controller::{Controller, EXIT_LOCAL_STATE};
use crate::services::scheduler::SetpointScheduler;
use crate::services::session::AuthenticatedSession;
use crate::utils::{Clock, SystemClock};
use log::{debug, error, info, warn};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    Authorize,
    Init,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    config_path: PathBuf,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = OsString>) -> Result<Cli, String> {
    let mut args = args.into_iter();
    let mut config_path: Option<PathBuf> = None;
    let mut command: Option<Command> = None;

    while let Some(arg) = args.next() {
        match arg.to_str() {
            Some("--config") => {
                if config_path.is_some() {
                    return Err("`--config` provided more than once".to_string());
                }
                let value = args
                    .next()
                    .ok_or_else(|| "`--config` requires a path argument".to_string())?;
                config_path = Some(PathBuf::from(value));
            }
            Some(s) if s.starts_with("--config=") => {
                if config_path.is_some() {
                    return Err("`--config` provided more than once".to_string());
                }
                let path_str = &s["--config=".len()..];
                if path_str.is_empty() {
                    return Err("`--config` requires a path argument".to_string());
                }
                config_path = Some(PathBuf::from(path_str));
            }
            Some(name @ ("run" | "authorize" | "init")) => {
                if command.is_some() {
                    return Err(format!("unexpected extra command: {}", name));
                }
                command = Some(match name {
                    "run" => Command::Run,
                    "authorize" => Command::Authorize,
                    _ => Command::Init,
                });
            }
            Some(other) => return Err(format!("unrecognised argument: {}", other)),
            None => return Err("argument contains invalid UTF-8".to_string()),
        }
    }

    Ok(Cli {
        config_path: config_path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        command: command.unwrap_or(Command::Run),
    })
}

/// One polling pass. Returns the process exit code.
fn run(cfg: &Config) -> Result<i32, String> {
    let store = FileTokenStore::new(&cfg.credentials_fpath);
    let tokens = store
        .load()
        .map_err(|e| format!("Failed to load credentials: {}", e))?;
    if tokens.is_empty() {
        return Err(format!(
            "No access token in {}; run `authorize` first",
            store.path().display()
        ));
    }

    let clock = SystemClock;
    let now = clock.now();
    if tokens.is_expired(now) {
        info!("Stored access token has expired; it will be refreshed on first use");
    } else if let Some(s) = tokens.seconds_until_expiration(now) {
        debug!("Stored access token expires in {}s", s);
    }

    let client = HoneywellClient::new(cfg);
    let session = AuthenticatedSession::new(&client, &client, &store, tokens);
    let controller = Controller::new(cfg, &session, SetpointScheduler::new(&clock));
    let report = controller.run();

    info!(
        "Run finished: status={:?}, devices={}, token_refreshes={}",
        report.status,
        report.devices.len(),
        session.refresh_count()
    );
    Ok(report.exit_code())
}

fn authorize(cfg: &Config) -> Result<(), String> {
    let client = Arc::new(HoneywellClient::new(cfg));
    let flow = AuthorizationFlow::new(&cfg.client_id, &cfg.auth_url, cfg.redirect_port).with_timeout(cfg.auth_timeout);
    let tokens = flow
        .run(client, |url| {
            println!("Open this URL in a browser to grant access:\n\n    {}\n", url);
            open_browser(url);
        })
        .map_err(|e| format!("Authorization failed: {}", e))?;

    let store = FileTokenStore::new(&cfg.credentials_fpath);
    store
        .save(&tokens)
        .map_err(|e| format!("Failed to store credentials: {}", e))?;
    info!("Credentials saved to {}", store.path().display());
    Ok(())
}

fn init(config_path: &Path) -> Result<(), String> {
    if !config_path.exists() {
        config::write_template(config_path).map_err(|e| format!("Failed to write config template: {}", e))?;
        info!(
            "Wrote config template to {}; fill it in and run `init` again",
            config_path.display()
        );
        return Ok(());
    }

    let cfg = Config::load(config_path).map_err(|e| format!("Config load failed: {}", e))?;
    let store = FileTokenStore::new(&cfg.credentials_fpath);
    if store.path().exists() {
        info!("Credentials file {} already exists", store.path().display());
    } else {
        store
            .save(&TokenSet::empty())
            .map_err(|e| format!("Failed to write credentials file: {}", e))?;
        info!("Wrote empty credentials file to {}", store.path().display());
    }
    Ok(())
}

/// Best effort; the URL has already been printed.
fn open_browser(url: &str) {
    let mut cmd = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut c = std::process::Command::new("cmd");
        c.args(["/C", "start", ""]);
        c
    } else {
        std::process::Command::new("xdg-open")
    };
    if let Err(e) = cmd.arg(url).spawn() {
        debug!("Could not open a browser: {}", e);
    }
}

fn main() {
    let default_filter = env_logger::Env::default().default_filter_or("info");
    env_logger::Builder::from_env(default_filter)
        .format_timestamp_secs()
        .init();

    let cli = match parse_args(std::env::args_os().skip(1)) {
        Ok(cli) => cli,
        Err(err) => {
            error!("fatal: {}", err);
            eprintln!("usage: honeywell-hold [--config <path>] [run|authorize|init]");
            std::process::exit(EXIT_LOCAL_STATE);
        }
    };

    info!(
        "honeywell-hold {} (git {}) starting",
        env!("CARGO_PKG_VERSION"),
        env!("BUILD_TIME_GIT_HASH")
    );

    let result = match cli.command {
        Command::Init => init(&cli.config_path).map(|_| 0),
        command => match Config::load(&cli.config_path) {
            Err(e) => Err(format!("Config load failed: {}", e)),
            Ok(cfg) => {
                info!(
                    "Config loaded from {} ({} location(s), credentials at {})",
                    cli.config_path.display(),
                    cfg.location_prefs.len(),
                    cfg.credentials_fpath.display()
                );
                if command == Command::Authorize {
                    authorize(&cfg).map(|_| 0)
                } else {
                    run(&cfg)
                }
            }
        },
    };

    match result {
        Ok(0) => {}
        Ok(code) => {
            warn!("Exiting with code {}", code);
            std::process::exit(code);
        }
        Err(e) => {
            error!("fatal: {}", e);
            std::process::exit(EXIT_LOCAL_STATE);
        }
    }
}
