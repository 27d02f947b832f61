//! Frontend Adapter (`spec.md` §4.7): `/login`, `/gce-xfstests`, `/status`.
//! Grounded on `ltm/src/healthcheck.rs`'s raw hyper `http1::Builder` +
//! `service_fn` server loop, generalized here into a small router.
use std::convert::Infallible;
use std::net::SocketAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use aws_lc_rs::{hmac, pbkdf2, rand::SecureRandom, rand::SystemRandom};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use ltm_config::{Catalog, Invocation, InvocationOptions};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::cloud::compute::ComputeClient;
use crate::cloud::storage::StorageClient;
use crate::run::mailer::ReportMailer;
use crate::run::{RunManager, RunManagerConfig};
use crate::unique_id::UniqueIdAllocator;

const PBKDF2_ITERATIONS: u32 = 234_567;
const SESSION_TTL_SECS: u64 = 3600;

pub struct FrontendState {
    pub password_hash: Vec<u8>,
    pub password_salt: Vec<u8>,
    pub session_key: hmac::Key,
    pub catalog: Catalog,
    pub allocator: Arc<UniqueIdAllocator>,
    pub compute: Arc<dyn ComputeClient>,
    pub storage: Arc<dyn StorageClient>,
    pub mailer: Option<Arc<dyn ReportMailer>>,
    pub run_manager_config: RunManagerConfig,
    /// In-flight runs, keyed by run id, per `SPEC_FULL.md` §4.4/§5 — lets a
    /// future shutdown or `/runs/{id}/cancel` path signal a run's shard
    /// tasks without tracking their `JoinHandle`s here.
    pub runs: Arc<DashMap<String, CancellationToken>>,
}

impl FrontendState {
    pub fn new(
        password_hash: Vec<u8>,
        password_salt: Vec<u8>,
        catalog: Catalog,
        allocator: Arc<UniqueIdAllocator>,
        compute: Arc<dyn ComputeClient>,
        storage: Arc<dyn StorageClient>,
        mailer: Option<Arc<dyn ReportMailer>>,
        run_manager_config: RunManagerConfig,
    ) -> Self {
        let rng = SystemRandom::new();
        let mut key_bytes = [0u8; 32];
        rng.fill(&mut key_bytes).expect("system RNG failure");
        let session_key = hmac::Key::new(hmac::HMAC_SHA256, &key_bytes);
        Self {
            password_hash,
            password_salt,
            session_key,
            catalog,
            allocator,
            compute,
            storage,
            mailer,
            run_manager_config,
            runs: Arc::new(DashMap::new()),
        }
    }

    fn verify_password(&self, attempt: &str) -> bool {
        pbkdf2::verify(
            pbkdf2::PBKDF2_HMAC_SHA512,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            &self.password_salt,
            attempt.as_bytes(),
            &self.password_hash,
        )
        .is_ok()
    }

    fn sign_session(&self) -> String {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let expiry = now + SESSION_TTL_SECS;
        let payload = expiry.to_string();
        let tag = hmac::sign(&self.session_key, payload.as_bytes());
        format!("{payload}.{}", BASE64.encode(tag.as_ref()))
    }

    fn verify_session(&self, cookie_value: &str) -> bool {
        let Some((payload, sig)) = cookie_value.split_once('.') else {
            return false;
        };
        let Ok(sig_bytes) = BASE64.decode(sig) else {
            return false;
        };
        if hmac::verify(&self.session_key, payload.as_bytes(), &sig_bytes).is_err() {
            return false;
        }
        let Ok(expiry) = payload.parse::<u64>() else {
            return false;
        };
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        now < expiry
    }
}

fn authenticated(req: &Request<Incoming>, state: &FrontendState) -> bool {
    req.headers()
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| cookies.split(';').map(str::trim).find_map(|kv| kv.strip_prefix("ltm_session=")))
        .is_some_and(|value| state.verify_session(value))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    password: String,
}

#[derive(Debug, Deserialize)]
struct GceXfstestsRequest {
    orig_cmdline: String,
    #[serde(default)]
    options: InvocationOptions,
}

#[derive(Debug, Serialize)]
struct GceXfstestsResponse {
    status: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    info: Option<crate::run::RunInfo>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    authenticated: bool,
}

fn json_response(status: StatusCode, body: &impl Serialize) -> Response<Full<Bytes>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(bytes)))
        .unwrap_or_else(|_| Response::new(Full::new(Bytes::new())))
}

async fn read_body(req: Request<Incoming>) -> Result<Bytes, Infallible> {
    Ok(req.into_body().collect().await.map(|b| b.to_bytes()).unwrap_or_default())
}

async fn handle(req: Request<Incoming>, state: Arc<FrontendState>) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method().clone(), req.uri().path().to_string()) {
        (Method::POST, path) if path == "/login" => {
            let body = read_body(req).await?;
            let Ok(login) = serde_json::from_slice::<LoginRequest>(&body) else {
                return Ok(json_response(StatusCode::BAD_REQUEST, &StatusResponse { authenticated: false }));
            };
            if !state.verify_password(&login.password) {
                return Ok(json_response(StatusCode::UNAUTHORIZED, &StatusResponse { authenticated: false }));
            }
            let cookie = format!("ltm_session={}; HttpOnly; Path=/", state.sign_session());
            let mut response = json_response(StatusCode::OK, &StatusResponse { authenticated: true });
            response.headers_mut().insert(SET_COOKIE, cookie.parse().unwrap());
            Ok(response)
        }

        (Method::GET, path) if path == "/status" => Ok(json_response(
            StatusCode::OK,
            &StatusResponse {
                authenticated: authenticated(&req, &state),
            },
        )),

        (Method::POST, path) if path == "/gce-xfstests" => {
            if !authenticated(&req, &state) {
                return Ok(json_response(StatusCode::UNAUTHORIZED, &GceXfstestsResponse { status: false, info: None }));
            }
            let body = read_body(req).await?;
            let Ok(parsed) = serde_json::from_slice::<GceXfstestsRequest>(&body) else {
                return Ok(json_response(StatusCode::BAD_REQUEST, &GceXfstestsResponse { status: false, info: None }));
            };
            let invocation = Invocation::new(parsed.orig_cmdline, parsed.options);

            match RunManager::construct(
                &invocation,
                &state.catalog,
                &state.allocator,
                state.run_manager_config.clone(),
                state.compute.clone(),
                state.storage.clone(),
                state.mailer.clone(),
                state.runs.clone(),
            )
            .await
            {
                Ok(manager) => {
                    let manager = Arc::new(manager);
                    let info = manager.get_info();
                    manager.run();
                    Ok(json_response(StatusCode::OK, &GceXfstestsResponse { status: true, info: Some(info) }))
                }
                Err(e) => {
                    error!(error = %e, "run manager construction failed");
                    Ok(json_response(StatusCode::OK, &GceXfstestsResponse { status: false, info: None }))
                }
            }
        }

        _ => Ok(json_response(StatusCode::NOT_FOUND, &StatusResponse { authenticated: false })),
    }
}

pub async fn server(port: u16, state: Arc<FrontendState>) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!("frontend adapter http://0.0.0.0:{port}");

    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(io, service_fn(move |req| handle(req, state.clone())))
                .await
            {
                warn!("frontend connection error: {err:?}");
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hash_password(password: &str, salt: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 64];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA512,
            NonZeroU32::new(PBKDF2_ITERATIONS).unwrap(),
            salt,
            password.as_bytes(),
            &mut out,
        );
        out
    }

    fn dummy_state() -> FrontendState {
        let salt = b"some-salt".to_vec();
        let hash = hash_password("correct horse", &salt);
        FrontendState::new(
            hash,
            salt,
            Catalog::new(std::env::temp_dir(), "ext4").unwrap_or_else(|_| {
                std::fs::create_dir_all(std::env::temp_dir().join("fs/ext4")).unwrap();
                Catalog::new(std::env::temp_dir(), "ext4").unwrap()
            }),
            Arc::new(futures::executor::block_on(UniqueIdAllocator::load(std::env::temp_dir().join("ltm-test-id"))).unwrap()),
            Arc::new(crate::cloud::compute::tests_support::FakeComputeClient::default()),
            Arc::new(crate::cloud::storage::tests_support::FakeStorageClient::default()),
            None,
            RunManagerConfig {
                user: "alice".into(),
                log_root: std::env::temp_dir(),
                gce_project: "proj".into(),
                gce_region: "us-central1".into(),
                gce_zone_default: None,
                gs_bucket: "bucket".into(),
                bucket_subdir: "results".into(),
                image_project: "proj".into(),
                keep_dead_vm: false,
                region_shard: false,
                max_shards: 1,
                gs_kernel: None,
                upload_summary: false,
                report_email: None,
            },
        )
    }

    #[test]
    fn verifies_correct_password_only() {
        let state = dummy_state();
        assert!(state.verify_password("correct horse"));
        assert!(!state.verify_password("wrong"));
    }

    #[test]
    fn session_round_trips() {
        let state = dummy_state();
        let cookie = state.sign_session();
        assert!(state.verify_session(&cookie));
        assert!(!state.verify_session("garbage"));
    }
}
