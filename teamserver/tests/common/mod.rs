use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tower::ServiceExt;

use teamserver::{
    api::create_api_server,
    auth::AdminAuth,
    config::TeamServerConfig,
    server::TeamServer,
    storage::Store,
    sync::{RemoteExecutor, RemoteOutput, RemoteTarget},
};
use teamserver_core::{MasterKey, Result, Sealer, TeamError};

/// In-memory stand-in for remote hosts: one `authorized_keys` per host.
#[derive(Default)]
pub struct MockHosts {
    files: Mutex<HashMap<String, String>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockHosts {
    pub fn set_file(&self, host: &str, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(host.to_string(), contents.to_string());
    }

    pub fn file(&self, host: &str) -> Option<String> {
        self.files.lock().unwrap().get(host).cloned()
    }

    pub fn make_unreachable(&self, host: &str) {
        self.unreachable.lock().unwrap().insert(host.to_string());
    }
}

#[async_trait]
impl RemoteExecutor for MockHosts {
    async fn exec(&self, target: &RemoteTarget, command: &str) -> Result<RemoteOutput> {
        if self.unreachable.lock().unwrap().contains(&target.host) {
            return Err(TeamError::Remote(format!(
                "ssh: connect to host {} port {}: Connection refused",
                target.host, target.port
            )));
        }
        assert!(target.private_key.contains("OPENSSH PRIVATE KEY"));

        if command.starts_with("cat ") {
            return Ok(RemoteOutput {
                status: 0,
                stdout: self.file(&target.host).unwrap_or_default(),
                stderr: String::new(),
            });
        }

        let start = command
            .find("printf '%s' '")
            .map(|i| i + "printf '%s' '".len())
            .expect("write command carries a payload");
        let end = start + command[start..].find('\'').expect("payload is quoted");
        let decoded = BASE64.decode(&command[start..end]).expect("payload is base64");
        self.set_file(&target.host, &String::from_utf8(decoded).unwrap());

        Ok(RemoteOutput {
            status: 0,
            stdout: String::new(),
            stderr: String::new(),
        })
    }
}

pub struct Harness {
    pub router: Router,
    pub server: Arc<TeamServer>,
    pub hosts: Arc<MockHosts>,
    pub admin_token: String,
    _dir: TempDir,
}

pub async fn harness_with(configure: impl FnOnce(&mut TeamServerConfig)) -> Harness {
    let dir = TempDir::new().unwrap();
    let master_key = MasterKey::generate();
    let (admin_token, admin) = AdminAuth::generate();

    let mut config = TeamServerConfig::default();
    config.security.master_key = master_key.to_hex();
    config.auth.admin_token_hash = admin.token_hash().to_string();
    config.rate_limit.per_minute = 0;
    configure(&mut config);
    config.validate().unwrap();

    let store = Arc::new(
        Store::open(&dir.path().join("teamserver.db"), Sealer::new(master_key))
            .await
            .unwrap(),
    );
    let hosts = Arc::new(MockHosts::default());
    let server = Arc::new(TeamServer::assemble(store, &config, hosts.clone()));
    if config.ca.enabled {
        server.ca.generate_ca_keypair("admin").await.unwrap();
    }

    Harness {
        router: create_api_server(server.clone()),
        server,
        hosts,
        admin_token,
        _dir: dir,
    }
}

pub async fn harness() -> Harness {
    harness_with(|_| {}).await
}

impl Harness {
    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        match body {
            Some(body) => {
                self.send_raw(method, uri, token, Some("application/json"), &body.to_string())
                    .await
            }
            None => self.send_raw(method, uri, token, None, "").await,
        }
    }

    /// Sends `body` verbatim, with an optional content type.
    pub async fn send_raw(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        content_type: Option<&str>,
        body: &str,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(content_type) = content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        let request = builder.body(Body::from(body.to_string())).unwrap();

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    pub async fn admin(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let token = self.admin_token.clone();
        self.send(method, uri, Some(&token), body).await
    }

    /// Invites and joins a user; returns the join response.
    pub async fn onboard(&self, name: &str, role: &str) -> Value {
        let (status, invite) = self
            .admin(
                Method::POST,
                "/api/admin/users",
                Some(serde_json::json!({
                    "name": name,
                    "email": format!("{}@example.com", name),
                    "role": role,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", invite);

        let (status, joined) = self
            .send(
                Method::POST,
                "/api/join",
                None,
                Some(serde_json::json!({ "token": invite["invite_token"] })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", joined);
        joined
    }

    pub async fn add_environment(&self, project: &str, name: &str, host: &str, deploy_user: &str) {
        let deploy_key = teamserver::ca::generate_user_keypair("deploy").unwrap();
        let (status, body) = self
            .admin(
                Method::POST,
                "/api/admin/environments",
                Some(serde_json::json!({
                    "project": project,
                    "name": name,
                    "host": host,
                    "deploy_user": deploy_user,
                    "deploy_key": deploy_key.private_key.as_str(),
                })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
    }
}
