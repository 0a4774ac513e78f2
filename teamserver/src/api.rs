use axum::{
    body::Bytes,
    extract::{
        rejection::QueryRejection, ConnectInfo, FromRequest, FromRequestParts, Path, Query,
        Request, State,
    },
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use validator::Validate;
use zeroize::Zeroizing;

use teamserver_core::{
    models::CertificateRecord, ChainReport, Environment, Project, Role, TeamError, User,
};

use crate::audit::AuditFilter;
use crate::ca::CertInfo;
use crate::ratelimit::rate_limit_middleware;
use crate::server::{EnvironmentDefinition, TeamServer, ADMIN_ACTOR};
use crate::session::InviteRequest;
use crate::sync::SyncReport;

pub struct ApiState {
    pub server: Arc<TeamServer>,
}

/// Error body returned by every endpoint: `{"error": "<message>"}`.
///
/// Messages are fixed per error class; internal detail goes to the log only.
#[derive(Debug, Serialize)]
pub struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, error: impl Into<String>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized")
    }

    fn bad_request(error: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, error)
    }
}

impl From<TeamError> for ApiError {
    fn from(err: TeamError) -> Self {
        match &err {
            TeamError::Validation(msg) => Self::bad_request(msg.clone()),
            TeamError::Unauthorized => Self::unauthorized(),
            TeamError::NotFound { .. } => Self::new(StatusCode::NOT_FOUND, err.to_string()),
            TeamError::Conflict { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            TeamError::AlreadyConsumed => {
                Self::new(StatusCode::CONFLICT, "invite token already used")
            }
            TeamError::RateLimited => Self::new(StatusCode::TOO_MANY_REQUESTS, "too many requests"),
            _ => {
                error!(error = %err, "request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal server error")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn create_api_server(server: Arc<TeamServer>) -> Router {
    let limiter = server.rate_limiter.clone();
    let state = Arc::new(ApiState { server });

    // Limited ahead of authentication; every rejected token on these routes is audited
    let limited = Router::new()
        .route("/api/join", post(join))
        .route("/api/me", get(me))
        .route("/api/environments", get(my_environments))
        .route("/api/cert/renew", post(renew_certificate))
        .route("/api/cert/info", get(certificate_info))
        .route_layer(middleware::from_fn_with_state(limiter, rate_limit_middleware));

    Router::new()
        .merge(limited)
        .route("/api/admin/users", get(list_users).post(create_user))
        .route(
            "/api/admin/users/:name",
            get(show_user).put(renew_user).delete(remove_user),
        )
        .route(
            "/api/admin/users/:name/access",
            post(grant_access).delete(revoke_access),
        )
        .route("/api/admin/projects", get(list_projects).post(create_project))
        .route(
            "/api/admin/projects/:name",
            get(show_project).delete(delete_project),
        )
        .route(
            "/api/admin/environments",
            get(list_environments).post(create_environment),
        )
        .route(
            "/api/admin/environments/:project/:name",
            get(show_environment).delete(delete_environment),
        )
        .route("/api/admin/sync", post(sync))
        .route("/api/admin/audit", get(query_audit))
        .route("/api/admin/audit/verify", get(verify_audit))
        .route("/api/admin/ca", get(ca_public_key))
        .route("/health", get(health_check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

// ---- extractors ------------------------------------------------------------

/// Caller address as recorded in the audit log.
pub struct ClientIp(pub Option<String>);

#[axum::async_trait]
impl FromRequestParts<Arc<ApiState>> for ClientIp {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let ip = state.server.rate_limiter.client_ip(&parts.headers, peer);
        Ok(ClientIp(ip.map(|ip| ip.to_string())))
    }
}

async fn bearer_token(parts: &mut Parts, state: &Arc<ApiState>) -> Result<String, ApiError> {
    let TypedHeader(Authorization(bearer)) =
        TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
            .await
            .map_err(|_| ApiError::unauthorized())?;
    Ok(bearer.token().to_string())
}

/// A user authenticated by session token.
pub struct AuthedUser {
    pub user: User,
    pub source_ip: Option<String>,
}

#[axum::async_trait]
impl FromRequestParts<Arc<ApiState>> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let ClientIp(source_ip) = ClientIp::from_request_parts(parts, state).await?;
        let token = bearer_token(parts, state).await?;

        let user = state
            .server
            .sessions
            .authenticate(&token, source_ip.clone())
            .await?;
        Ok(AuthedUser { user, source_ip })
    }
}

/// A caller holding the admin token.
pub struct AdminCaller {
    pub source_ip: Option<String>,
}

#[axum::async_trait]
impl FromRequestParts<Arc<ApiState>> for AdminCaller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ApiState>,
    ) -> Result<Self, Self::Rejection> {
        let ClientIp(source_ip) = ClientIp::from_request_parts(parts, state).await?;
        let token = bearer_token(parts, state).await?;

        if !state.server.admin.verify(&token) {
            warn!(source_ip = ?source_ip, path = %parts.uri.path(), "admin authentication failed");
            return Err(ApiError::unauthorized());
        }
        Ok(AdminCaller { source_ip })
    }
}

/// JSON body checked with `validator` before any handler logic runs.
pub struct ValidJson<T>(pub T);

#[axum::async_trait]
impl<T, S> FromRequest<S> for ValidJson<T>
where
    T: DeserializeOwned + Validate + 'static,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|e| {
                ApiError::bad_request(format!("invalid request body: {}", e.body_text()))
            })?;

        value
            .validate()
            .map_err(|e| ApiError::bad_request(format!("validation failed: {}", e)))?;
        Ok(ValidJson(value))
    }
}

// ---- views -----------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct UserView {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub public_key: String,
    pub mfa_enabled: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_access: Option<DateTime<Utc>>,
}

impl From<User> for UserView {
    fn from(user: User) -> Self {
        Self {
            name: user.name,
            email: user.email,
            role: user.role,
            public_key: user.public_key,
            mfa_enabled: user.mfa_enabled,
            expires_at: user.expires_at,
            created_by: user.created_by,
            created_at: user.created_at,
            last_access: user.last_access,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CertificateView {
    pub certificate: String,
    pub serial: u64,
    pub principals: Vec<String>,
    pub valid_after: DateTime<Utc>,
    pub valid_before: DateTime<Utc>,
}

impl From<CertificateRecord> for CertificateView {
    fn from(record: CertificateRecord) -> Self {
        Self {
            certificate: record.certificate,
            serial: record.serial,
            principals: record.principals,
            valid_after: record.valid_after,
            valid_before: record.valid_before,
        }
    }
}

// ---- public & session endpoints ---------------------------------------------

#[derive(Debug, Deserialize, Validate)]
struct JoinRequest {
    #[validate(length(min = 1, max = 256, message = "token is required"))]
    token: String,
}

#[derive(Serialize)]
struct JoinResponse {
    user: UserView,
    session_token: String,
    session_expires_at: DateTime<Utc>,
    private_key: String,
    certificate: Option<CertificateView>,
}

async fn join(
    State(state): State<Arc<ApiState>>,
    ClientIp(source_ip): ClientIp,
    ValidJson(req): ValidJson<JoinRequest>,
) -> ApiResult<Json<JoinResponse>> {
    let outcome = state.server.sessions.join(&req.token, source_ip).await?;

    Ok(Json(JoinResponse {
        user: outcome.user.into(),
        session_token: outcome.session_token,
        session_expires_at: outcome.session_expires_at,
        private_key: outcome.private_key.to_string(),
        certificate: outcome.certificate.map(CertificateView::from),
    }))
}

#[derive(Debug, Serialize)]
struct MeResponse {
    user: UserView,
    projects: Vec<String>,
}

async fn me(State(state): State<Arc<ApiState>>, caller: AuthedUser) -> ApiResult<Json<MeResponse>> {
    let projects = state
        .server
        .access
        .projects_for(&caller.user)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();

    Ok(Json(MeResponse {
        user: caller.user.into(),
        projects,
    }))
}

#[derive(Debug, Serialize)]
struct EnvironmentView {
    project: String,
    name: String,
    host: String,
    port: u16,
    deploy_user: String,
}

async fn my_environments(
    State(state): State<Arc<ApiState>>,
    caller: AuthedUser,
) -> ApiResult<Json<Vec<EnvironmentView>>> {
    let environments = state
        .server
        .access
        .environments_for(&caller.user)
        .await?
        .into_iter()
        .map(|env| EnvironmentView {
            project: env.project,
            name: env.name,
            host: env.host,
            port: env.port,
            deploy_user: env.deploy_user,
        })
        .collect();
    Ok(Json(environments))
}

async fn renew_certificate(
    State(state): State<Arc<ApiState>>,
    caller: AuthedUser,
) -> ApiResult<Json<CertificateView>> {
    if !state.server.ca_enabled {
        return Err(ApiError::bad_request("certificate authority is disabled"));
    }

    let record = state
        .server
        .ca
        .renew(&caller.user, &state.server.access, caller.source_ip)
        .await?;
    Ok(Json(record.into()))
}

async fn certificate_info(
    State(state): State<Arc<ApiState>>,
    caller: AuthedUser,
) -> ApiResult<Json<CertInfo>> {
    Ok(Json(state.server.ca.certificate_info(&caller.user).await?))
}

// ---- admin: users ------------------------------------------------------------

async fn list_users(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
) -> ApiResult<Json<Vec<UserView>>> {
    let users = state.server.store.list_users().await?;
    Ok(Json(users.into_iter().map(UserView::from).collect()))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateUserRequest {
    #[validate(length(min = 1, max = 64, message = "name is required"))]
    name: String,
    #[validate(email(message = "invalid email address"))]
    email: String,
    role: Role,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateUserResponse {
    name: String,
    role: Role,
    invite_token: String,
    invite_expires_at: DateTime<Utc>,
}

async fn create_user(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    ValidJson(req): ValidJson<CreateUserRequest>,
) -> ApiResult<(StatusCode, Json<CreateUserResponse>)> {
    let issued = state
        .server
        .sessions
        .create_invite(
            InviteRequest {
                name: req.name,
                email: req.email,
                role: req.role,
                expires_at: req.expires_at,
            },
            ADMIN_ACTOR,
            admin.source_ip,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateUserResponse {
            name: issued.invite.user_name,
            role: issued.invite.role,
            invite_token: issued.token,
            invite_expires_at: issued.invite.expires_at,
        }),
    ))
}

#[derive(Debug, Serialize)]
struct UserDetail {
    user: UserView,
    projects: Vec<String>,
    certificate: Option<CertInfo>,
}

async fn show_user(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
    Path(name): Path<String>,
) -> ApiResult<Json<UserDetail>> {
    let user = state.server.store.get_user(&name).await?;
    let projects = state
        .server
        .access
        .projects_for(&user)
        .await?
        .into_iter()
        .map(|p| p.name)
        .collect();
    let certificate = match state.server.ca.certificate_info(&user).await {
        Ok(info) => Some(info),
        Err(TeamError::NotFound { .. }) => None,
        Err(e) => return Err(e.into()),
    };

    Ok(Json(UserDetail {
        user: user.into(),
        projects,
        certificate,
    }))
}

#[derive(Debug, Deserialize, Validate)]
struct RenewUserRequest {
    /// `null` clears the expiry.
    expires_at: Option<DateTime<Utc>>,
}

async fn renew_user(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    Path(name): Path<String>,
    ValidJson(req): ValidJson<RenewUserRequest>,
) -> ApiResult<Json<UserView>> {
    let user = state
        .server
        .sessions
        .renew_user(&name, req.expires_at, ADMIN_ACTOR, admin.source_ip)
        .await?;
    Ok(Json(user.into()))
}

async fn remove_user(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .server
        .sessions
        .remove_user(&name, ADMIN_ACTOR, admin.source_ip)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize, Validate)]
struct AccessRequest {
    #[validate(length(min = 1, max = 64, message = "project is required"))]
    project: String,
}

async fn grant_access(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    Path(name): Path<String>,
    ValidJson(req): ValidJson<AccessRequest>,
) -> ApiResult<StatusCode> {
    state
        .server
        .access
        .grant(&name, &req.project, ADMIN_ACTOR, admin.source_ip)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_access(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    Path(name): Path<String>,
    ValidJson(req): ValidJson<AccessRequest>,
) -> ApiResult<StatusCode> {
    state
        .server
        .access
        .revoke(&name, &req.project, ADMIN_ACTOR, admin.source_ip)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- admin: projects & environments -----------------------------------------

async fn list_projects(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
) -> ApiResult<Json<Vec<Project>>> {
    Ok(Json(state.server.store.list_projects().await?))
}

#[derive(Debug, Deserialize, Validate)]
struct CreateProjectRequest {
    #[validate(length(min = 1, max = 64, message = "name is required"))]
    name: String,
    #[serde(default)]
    #[validate(length(max = 1024, message = "description is too long"))]
    description: String,
}

async fn create_project(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    ValidJson(req): ValidJson<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let project = state
        .server
        .create_project(&req.name, &req.description, admin.source_ip)
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

#[derive(Debug, Serialize)]
struct ProjectDetail {
    project: Project,
    environments: Vec<Environment>,
    users: Vec<String>,
}

async fn show_project(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
    Path(name): Path<String>,
) -> ApiResult<Json<ProjectDetail>> {
    let project = state.server.store.get_project(&name).await?;
    let environments = state.server.store.list_environments(Some(&name)).await?;
    let users = state
        .server
        .store
        .users_with_access(&name)
        .await?
        .into_iter()
        .map(|u| u.name)
        .collect();

    Ok(Json(ProjectDetail {
        project,
        environments,
        users,
    }))
}

async fn delete_project(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.server.delete_project(&name, admin.source_ip).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct EnvironmentListQuery {
    project: Option<String>,
}

async fn list_environments(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
    query: Result<Query<EnvironmentListQuery>, QueryRejection>,
) -> ApiResult<Json<Vec<Environment>>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(
        state
            .server
            .store
            .list_environments(query.project.as_deref())
            .await?,
    ))
}

fn default_ssh_port() -> u16 {
    22
}

#[derive(Deserialize, Validate)]
struct CreateEnvironmentRequest {
    #[validate(length(min = 1, max = 64, message = "project is required"))]
    project: String,
    #[validate(length(min = 1, max = 64, message = "name is required"))]
    name: String,
    #[validate(length(min = 1, max = 253, message = "host is required"))]
    host: String,
    #[serde(default = "default_ssh_port")]
    #[validate(range(min = 1, message = "port must be non-zero"))]
    port: u16,
    #[validate(length(min = 1, max = 64, message = "deploy_user is required"))]
    deploy_user: String,
    #[validate(length(min = 1, message = "deploy_key is required"))]
    deploy_key: String,
    allowed_roles: Option<Vec<Role>>,
}

async fn create_environment(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    ValidJson(req): ValidJson<CreateEnvironmentRequest>,
) -> ApiResult<(StatusCode, Json<Environment>)> {
    let env = state
        .server
        .create_environment(
            EnvironmentDefinition {
                project: req.project,
                name: req.name,
                host: req.host,
                port: req.port,
                deploy_user: req.deploy_user,
                deploy_key: Zeroizing::new(req.deploy_key),
                allowed_roles: req.allowed_roles,
            },
            admin.source_ip,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(env)))
}

async fn show_environment(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
    Path((project, name)): Path<(String, String)>,
) -> ApiResult<Json<Environment>> {
    Ok(Json(state.server.store.get_environment(&project, &name).await?))
}

async fn delete_environment(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    Path((project, name)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .server
        .delete_environment(&project, &name, admin.source_ip)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- admin: sync, audit, CA ----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SyncRequest {
    environment: Option<String>,
}

impl SyncRequest {
    /// An empty body targets every environment; anything else must be a
    /// well-formed JSON request.
    fn from_body(headers: &HeaderMap, body: &[u8]) -> Result<Self, ApiError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let is_json = headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.trim_start().starts_with("application/json"))
            .unwrap_or(false);
        if !is_json {
            return Err(ApiError::bad_request(
                "expected request with `Content-Type: application/json`",
            ));
        }

        let Json(req) = Json::<SyncRequest>::from_bytes(body).map_err(|e| {
            ApiError::bad_request(format!("invalid request body: {}", e.body_text()))
        })?;
        Ok(req)
    }
}

/// 200 when every environment synced, 207 with the same body when some failed.
async fn sync(
    State(state): State<Arc<ApiState>>,
    admin: AdminCaller,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<SyncReport>)> {
    let req = SyncRequest::from_body(&headers, &body)?;
    let report = state
        .server
        .sync
        .sync(req.environment.as_deref(), ADMIN_ACTOR, admin.source_ip)
        .await?;

    let status = if report.is_complete() {
        StatusCode::OK
    } else {
        StatusCode::MULTI_STATUS
    };
    Ok((status, Json(report)))
}

async fn query_audit(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
    filter: Result<Query<AuditFilter>, QueryRejection>,
) -> ApiResult<Json<Vec<teamserver_core::AuditEntry>>> {
    let Query(filter) = filter.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(Json(state.server.audit.query(&filter).await?))
}

async fn verify_audit(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
) -> ApiResult<Json<ChainReport>> {
    let report = state.server.audit.verify().await?;
    if !report.valid {
        warn!(first_mismatch = ?report.first_mismatch, "audit chain verification failed");
    }
    Ok(Json(report))
}

#[derive(Debug, Serialize)]
struct CaPublicKey {
    public_key: String,
}

async fn ca_public_key(
    State(state): State<Arc<ApiState>>,
    _admin: AdminCaller,
) -> ApiResult<Json<CaPublicKey>> {
    let public_key = state
        .server
        .ca
        .public_key()
        .await?
        .ok_or_else(|| TeamError::not_found("ca key", "ca"))?;
    Ok(Json(CaPublicKey { public_key }))
}

async fn health_check() -> StatusCode {
    StatusCode::OK
}
