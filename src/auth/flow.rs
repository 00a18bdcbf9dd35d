//! Interactive OAuth2 authorization-code flow.
//!
//! A one-route HTTP listener is bound on localhost and served from its own
//! thread; the caller blocks until the listener hands over a token set, the
//! optional timeout elapses, or the flow is cancelled. The listener is always
//! shut down and joined before `run` returns.
//!
//! Callback handling
//! - wrong `state` or missing `code`: 400, keep waiting
//! - token exchange fails: 500, keep waiting (the user retries from the browser)
//! - token exchange succeeds: 200, deliver and stop

use super::{AuthError, TokenEndpoint, TokenSet};
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::{error, info, warn};
use rand::RngCore;
use serde::Deserialize;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use url::Url;

const BODY_OK: &str = "You can close this window now.";
const BODY_INVALID: &str = "Invalid request.";
const BODY_FAILED: &str = "Failed to get token.";

#[derive(Debug)]
enum Handoff {
    Delivered(TokenSet),
    Cancelled,
    ListenerFailed(String),
}

/// Stops a pending [`AuthorizationFlow::run`] from another thread.
#[derive(Debug, Clone)]
pub struct FlowCancel {
    tx: SyncSender<Handoff>,
}

impl FlowCancel {
    pub fn cancel(&self) {
        // a full slot means a result is already waiting for the caller
        let _ = self.tx.try_send(Handoff::Cancelled);
    }
}

pub struct AuthorizationFlow {
    client_id: String,
    auth_base_url: String,
    local_port: u16,
    state: Option<String>,
    timeout: Option<Duration>,
    tx: SyncSender<Handoff>,
    rx: Receiver<Handoff>,
}

impl AuthorizationFlow {
    pub fn new(client_id: impl Into<String>, auth_base_url: impl Into<String>, local_port: u16) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        AuthorizationFlow {
            client_id: client_id.into(),
            auth_base_url: auth_base_url.into(),
            local_port,
            state: None,
            timeout: None,
            tx,
            rx,
        }
    }

    /// Use a caller-chosen CSRF state instead of a random one.
    pub fn with_state(mut self, state: impl Into<String>) -> Self {
        self.state = Some(state.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cancel_handle(&self) -> FlowCancel {
        FlowCancel { tx: self.tx.clone() }
    }

    /// Run the flow. `present_url` receives the authorization URL once the
    /// listener is bound; showing it to the user is up to the caller.
    pub fn run(self, endpoint: Arc<dyn TokenEndpoint>, present_url: impl FnOnce(&str)) -> Result<TokenSet, AuthError> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.local_port)).map_err(AuthError::Listener)?;
        listener.set_nonblocking(true).map_err(AuthError::Listener)?;
        let port = listener.local_addr().map_err(AuthError::Listener)?.port();

        let redirect_uri = format!("http://localhost:{port}");
        let state = self.state.unwrap_or_else(generate_state);
        let auth_url = authorization_url(&self.auth_base_url, &self.client_id, &redirect_uri, &state)?;

        let callback = CallbackState {
            expected_state: state.into(),
            redirect_uri: redirect_uri.as_str().into(),
            endpoint,
            slot: Arc::new(Mutex::new(Slot::Open(self.tx.clone()))),
        };
        let app = Router::new().route("/", get(handle_callback)).with_state(callback);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let failure_tx = self.tx.clone();
        let server = thread::Builder::new()
            .name("oauth-redirect".into())
            .spawn(move || {
                if let Err(e) = serve(listener, app, shutdown_rx) {
                    error!("Redirect listener stopped: {}", e);
                    let _ = failure_tx.try_send(Handoff::ListenerFailed(e.to_string()));
                }
            })
            .map_err(AuthError::Listener)?;

        info!("Waiting for authorization callback on {}", redirect_uri);
        present_url(auth_url.as_str());

        let outcome = match self.timeout {
            Some(t) => self.rx.recv_timeout(t).map_err(|e| match e {
                RecvTimeoutError::Timeout => AuthError::TimedOut,
                RecvTimeoutError::Disconnected => AuthError::Cancelled,
            }),
            None => self.rx.recv().map_err(|_| AuthError::Cancelled),
        };

        let _ = shutdown_tx.send(());
        if server.join().is_err() {
            error!("Redirect listener thread panicked");
        }

        match outcome? {
            Handoff::Delivered(tokens) => {
                info!("Authorization complete");
                Ok(tokens)
            }
            Handoff::Cancelled => Err(AuthError::Cancelled),
            Handoff::ListenerFailed(msg) => Err(AuthError::Listener(io::Error::other(msg))),
        }
    }
}

/// 16 random bytes, URL-safe base64.
pub fn generate_state() -> String {
    let mut buf = [0u8; 16];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

pub fn authorization_url(base: &str, client_id: &str, redirect_uri: &str, state: &str) -> Result<Url, AuthError> {
    let url = Url::parse_with_params(
        base,
        &[
            ("response_type", "code"),
            ("client_id", client_id),
            ("redirect_uri", redirect_uri),
            ("state", state),
        ],
    )?;
    Ok(url)
}

/// Progress of the single successful callback.
#[derive(Debug)]
enum Slot {
    Open(SyncSender<Handoff>),
    /// A code exchange is in flight; other callbacks are turned away.
    Exchanging,
    Done,
}

#[derive(Clone)]
struct CallbackState {
    expected_state: Arc<str>,
    redirect_uri: Arc<str>,
    endpoint: Arc<dyn TokenEndpoint>,
    slot: Arc<Mutex<Slot>>,
}

impl CallbackState {
    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        match self.slot.lock() {
            Ok(mut slot) => f(&mut slot),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    /// Take the sender for one exchange, leaving the slot `Exchanging`.
    fn claim(&self) -> Option<SyncSender<Handoff>> {
        self.with_slot(|slot| match std::mem::replace(slot, Slot::Exchanging) {
            Slot::Open(tx) => Some(tx),
            other => {
                *slot = other;
                None
            }
        })
    }

    /// Reopen after a failed exchange.
    fn release(&self, tx: SyncSender<Handoff>) {
        self.with_slot(|slot| *slot = Slot::Open(tx));
    }

    fn finish(&self) {
        self.with_slot(|slot| *slot = Slot::Done);
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

async fn handle_callback(
    State(cb): State<CallbackState>,
    Query(params): Query<CallbackParams>,
) -> (StatusCode, &'static str) {
    if let Some(err) = params.error.as_deref() {
        warn!("Authorization callback reported error: {}", err);
    }
    if params.state.as_deref() != Some(&*cb.expected_state) {
        warn!("Authorization callback with mismatched state; ignoring");
        return (StatusCode::BAD_REQUEST, BODY_INVALID);
    }
    let code = match params.code {
        Some(c) if !c.is_empty() => c,
        _ => {
            warn!("Authorization callback without code; ignoring");
            return (StatusCode::BAD_REQUEST, BODY_INVALID);
        }
    };
    let Some(tx) = cb.claim() else {
        warn!("Authorization callback while another is handled or after completion; ignoring");
        return (StatusCode::BAD_REQUEST, BODY_INVALID);
    };

    let endpoint = cb.endpoint.clone();
    let redirect_uri = cb.redirect_uri.clone();
    let exchanged = tokio::task::spawn_blocking(move || endpoint.exchange_code(&code, &redirect_uri)).await;

    match exchanged {
        Ok(Ok(tokens)) => {
            cb.finish();
            let _ = tx.try_send(Handoff::Delivered(tokens));
            (StatusCode::OK, BODY_OK)
        }
        Ok(Err(e)) => {
            cb.release(tx);
            error!("Exchanging authorization code failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, BODY_FAILED)
        }
        Err(e) => {
            cb.release(tx);
            error!("Token exchange task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, BODY_FAILED)
        }
    }
}

/// Serve `app` on a current-thread runtime until `shutdown` fires.
pub(crate) fn serve(listener: TcpListener, app: Router, shutdown: oneshot::Receiver<()>) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.await;
            })
            .await
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::thread::JoinHandle;

    /// Returns queued exchange results in order and records every call.
    struct ScriptedEndpoint {
        results: Mutex<VecDeque<Result<TokenSet, AuthError>>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedEndpoint {
        fn new(results: Vec<Result<TokenSet, AuthError>>) -> Arc<Self> {
            Arc::new(ScriptedEndpoint {
                results: Mutex::new(results.into()),
                calls: Mutex::new(Vec::new()),
            })
        }
    }

    impl TokenEndpoint for ScriptedEndpoint {
        fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<TokenSet, AuthError> {
            self.calls.lock().unwrap().push((code.to_string(), redirect_uri.to_string()));
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AuthError::Exchange { status: 400, body: "exhausted".into() }))
        }

        fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, AuthError> {
            unreachable!("the flow never refreshes")
        }
    }

    fn tokens() -> TokenSet {
        TokenSet {
            access_token: "access".into(),
            refresh_token: "refresh".into(),
            expiration_time: None,
        }
    }

    /// Start the flow on an ephemeral port; returns the handle and the port.
    fn start(flow: AuthorizationFlow, endpoint: Arc<dyn TokenEndpoint>) -> (JoinHandle<Result<TokenSet, AuthError>>, u16) {
        let (url_tx, url_rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            flow.run(endpoint, |url| {
                url_tx.send(url.to_string()).unwrap();
            })
        });
        let url = Url::parse(&url_rx.recv().expect("authorization url")).unwrap();
        let redirect = url
            .query_pairs()
            .find(|(k, _)| k == "redirect_uri")
            .map(|(_, v)| v.into_owned())
            .expect("redirect_uri param");
        let port = Url::parse(&redirect).unwrap().port().expect("explicit port");
        (handle, port)
    }

    fn get(port: u16, query: &str) -> (u16, String) {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .proxy(None)
            .timeout_global(Some(Duration::from_secs(10)))
            .build()
            .into();
        let mut resp = agent
            .get(format!("http://127.0.0.1:{port}/{query}").as_str())
            .call()
            .expect("callback request");
        let status = resp.status().as_u16();
        let body = resp.body_mut().read_to_string().unwrap_or_default();
        (status, body)
    }

    #[test]
    fn authorization_url_carries_all_params() {
        let url = authorization_url("https://auth.example/authorize", "cid", "http://localhost:8080", "s t").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().map(|(k, v)| (k.into_owned(), v.into_owned())).collect();
        assert_eq!(
            pairs,
            vec![
                ("response_type".to_string(), "code".to_string()),
                ("client_id".to_string(), "cid".to_string()),
                ("redirect_uri".to_string(), "http://localhost:8080".to_string()),
                ("state".to_string(), "s t".to_string()),
            ]
        );
    }

    #[test]
    fn generated_state_is_url_safe_and_fresh() {
        let a = generate_state();
        let b = generate_state();
        assert_eq!(a.len(), 22);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(a, b);
    }

    #[test]
    fn invalid_callbacks_keep_waiting_until_a_good_exchange() {
        let endpoint = ScriptedEndpoint::new(vec![
            Err(AuthError::Exchange { status: 401, body: "bad code".into() }),
            Ok(tokens()),
        ]);
        let flow = AuthorizationFlow::new("cid", "https://auth.example/authorize", 0)
            .with_state("expected")
            .with_timeout(Some(Duration::from_secs(30)));
        let (handle, port) = start(flow, endpoint.clone());

        assert_eq!(get(port, "?code=abc&state=forged").0, 400);
        assert_eq!(get(port, "?state=expected").0, 400);
        assert_eq!(get(port, "").0, 400);
        assert_eq!(get(port, "?code=first&state=expected"), (500, BODY_FAILED.to_string()));
        assert_eq!(get(port, "?code=second&state=expected"), (200, BODY_OK.to_string()));

        let result = handle.join().unwrap().expect("tokens delivered");
        assert_eq!(result, tokens());

        let calls = endpoint.calls.lock().unwrap().clone();
        let redirect = format!("http://localhost:{port}");
        assert_eq!(calls, vec![("first".to_string(), redirect.clone()), ("second".to_string(), redirect)]);
    }

    /// Blocks each exchange until the test lets it go.
    struct GatedEndpoint {
        entered: Mutex<mpsc::Sender<String>>,
        release: Mutex<Receiver<()>>,
    }

    impl TokenEndpoint for GatedEndpoint {
        fn exchange_code(&self, code: &str, _redirect_uri: &str) -> Result<TokenSet, AuthError> {
            self.entered.lock().unwrap().send(code.to_string()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            Ok(tokens())
        }

        fn refresh(&self, _refresh_token: &str) -> Result<TokenSet, AuthError> {
            unreachable!("the flow never refreshes")
        }
    }

    #[test]
    fn second_callback_during_exchange_spends_no_code() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let endpoint = Arc::new(GatedEndpoint {
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let flow = AuthorizationFlow::new("cid", "https://auth.example/authorize", 0)
            .with_state("expected")
            .with_timeout(Some(Duration::from_secs(30)));
        let (handle, port) = start(flow, endpoint);

        let first = thread::spawn(move || get(port, "?code=first&state=expected"));
        assert_eq!(entered_rx.recv_timeout(Duration::from_secs(10)).unwrap(), "first");

        assert_eq!(get(port, "?code=second&state=expected"), (400, BODY_INVALID.to_string()));
        release_tx.send(()).unwrap();
        assert_eq!(first.join().unwrap(), (200, BODY_OK.to_string()));

        assert_eq!(handle.join().unwrap().expect("tokens delivered"), tokens());
        // only the first code reached the token endpoint
        assert!(entered_rx.try_recv().is_err());
    }

    #[test]
    fn times_out_without_callback() {
        let endpoint = ScriptedEndpoint::new(vec![]);
        let flow = AuthorizationFlow::new("cid", "https://auth.example/authorize", 0)
            .with_timeout(Some(Duration::from_millis(200)));
        let (handle, _port) = start(flow, endpoint.clone());
        assert!(matches!(handle.join().unwrap(), Err(AuthError::TimedOut)));
        assert!(endpoint.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn cancel_unblocks_the_caller() {
        let endpoint = ScriptedEndpoint::new(vec![]);
        let flow = AuthorizationFlow::new("cid", "https://auth.example/authorize", 0);
        let cancel = flow.cancel_handle();
        let (handle, _port) = start(flow, endpoint);
        cancel.cancel();
        assert!(matches!(handle.join().unwrap(), Err(AuthError::Cancelled)));
    }

    #[test]
    fn busy_port_is_a_listener_error() {
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let flow = AuthorizationFlow::new("cid", "https://auth.example/authorize", port);
        let result = flow.run(ScriptedEndpoint::new(vec![]), |_| panic!("url must not be presented"));
        assert!(matches!(result, Err(AuthError::Listener(_))));
    }
}
