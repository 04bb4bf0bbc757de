use std::collections::BTreeSet;

use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info, instrument, warn};

use crate::{
    accounts::{
        dto::{
            AuthResponse, LoginRequest, PublicUser, RegisterRequest, ResetPasswordRequest,
            ResetPasswordResponse, SaveStampsRequest, StampsResponse,
        },
        password,
        services::{self, CredentialError},
        session::{SessionKeys, SessionUser},
    },
    state::AppState,
    store::{Account, Identifier, NewAccount, StoreError},
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/reset-password", post(reset_password))
}

pub fn account_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me)).route(
        "/stamps",
        get(load_stamps).put(save_stamps).delete(clear_stamps),
    )
}

fn public(account: Account) -> PublicUser {
    PublicUser {
        id: account.id,
        name: account.name,
        email: account.email,
    }
}

fn internal<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    error!(error = %err, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Internal server error".into(),
    )
}

fn store_unavailable(err: StoreError) -> (StatusCode, String) {
    error!(error = %err, "account store unavailable");
    (
        StatusCode::SERVICE_UNAVAILABLE,
        "Service temporarily unavailable".into(),
    )
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(mut payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    payload.name = payload.name.trim().to_string();
    payload.email = payload.email.trim().to_lowercase();
    payload.phone = payload.phone.trim().to_string();
    let password_plain = payload.password.trim();

    if payload.name.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Name is required".into()));
    }
    if payload.name.contains('@') {
        warn!(name = %payload.name, "rejected name containing '@'");
        return Err((StatusCode::BAD_REQUEST, "Name may not contain '@'".into()));
    }
    if !services::is_valid_email(&payload.email) {
        warn!(email = %payload.email, "invalid email");
        return Err((StatusCode::BAD_REQUEST, "Invalid email".into()));
    }
    if password_plain.len() < 8 {
        warn!("password too short");
        return Err((StatusCode::BAD_REQUEST, "Password too short".into()));
    }

    let hash = password::hash_password(password_plain).map_err(internal)?;
    let new = NewAccount {
        name: payload.name,
        email: payload.email,
        phone: payload.phone,
        password_hash: hash,
    };

    let account = match state.store.create(&new).await {
        Ok(account) => account,
        Err(StoreError::DuplicateName) => {
            warn!(name = %new.name, "name already registered");
            return Err((
                StatusCode::CONFLICT,
                "This name is already registered".into(),
            ));
        }
        Err(StoreError::DuplicateEmail) => {
            warn!(email = %new.email, "email already registered");
            return Err((
                StatusCode::CONFLICT,
                "This email is already registered".into(),
            ));
        }
        Err(e) => return Err(store_unavailable(e)),
    };

    let keys = SessionKeys::from_ref(&state);
    let token = keys.sign(&account.name).map_err(internal)?;

    info!(user_id = account.id, name = %account.name, "account registered");
    Ok(Json(AuthResponse {
        token,
        user: public(account),
    }))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, (StatusCode, String)> {
    let account_field = payload.account.trim();
    let password_plain = payload.password.trim();
    if account_field.is_empty() || password_plain.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Account and password are required".into(),
        ));
    }

    let identifier = Identifier::parse(account_field);
    let account =
        match services::verify_credentials(state.store.as_ref(), &identifier, password_plain).await
        {
            Ok(account) => account,
            Err(CredentialError::AccountNotFound) => {
                warn!(%identifier, "login for unknown account");
                return Err((StatusCode::UNAUTHORIZED, "Account not found".into()));
            }
            Err(CredentialError::WrongPassword) => {
                warn!(%identifier, "login with wrong password");
                return Err((StatusCode::UNAUTHORIZED, "Incorrect password".into()));
            }
            Err(CredentialError::Store(e)) => return Err(store_unavailable(e)),
            Err(CredentialError::Hash(e)) => return Err(internal(e)),
        };

    let keys = SessionKeys::from_ref(&state);
    let token = keys.sign(&account.name).map_err(internal)?;

    info!(user_id = account.id, name = %account.name, "signed in");
    Ok(Json(AuthResponse {
        token,
        user: public(account),
    }))
}

#[instrument(skip(state, payload))]
pub async fn reset_password(
    State(state): State<AppState>,
    Json(payload): Json<ResetPasswordRequest>,
) -> Result<Json<ResetPasswordResponse>, (StatusCode, String)> {
    let account_field = payload.account.trim();
    let new_password = payload.new_password.trim();
    if account_field.is_empty() || new_password.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "Account and new password are required".into(),
        ));
    }
    if new_password.len() < 8 {
        return Err((StatusCode::BAD_REQUEST, "Password too short".into()));
    }

    let identifier = Identifier::parse(account_field);
    let hash = password::hash_password(new_password).map_err(internal)?;
    let updated = state
        .store
        .reset_password(&identifier, &hash)
        .await
        .map_err(store_unavailable)?;

    if updated == 0 {
        warn!(%identifier, "password reset for unknown account");
    } else {
        info!(%identifier, updated, "password reset");
    }
    Ok(Json(ResetPasswordResponse { updated }))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    SessionUser(name): SessionUser,
) -> Result<Json<PublicUser>, (StatusCode, String)> {
    let account = state
        .store
        .find(&Identifier::Name(name.clone()))
        .await
        .map_err(store_unavailable)?
        .ok_or_else(|| {
            warn!(name = %name, "session for a missing account");
            (
                StatusCode::UNAUTHORIZED,
                "Account no longer exists".to_string(),
            )
        })?;
    Ok(Json(public(account)))
}

#[instrument(skip(state))]
pub async fn load_stamps(
    State(state): State<AppState>,
    SessionUser(name): SessionUser,
) -> Result<Json<StampsResponse>, (StatusCode, String)> {
    match state.store.load_stamps(&name).await {
        Ok(set) => Ok(Json(StampsResponse {
            stamps: set.into_iter().collect(),
        })),
        Err(StoreError::NotFound) => Err((
            StatusCode::UNAUTHORIZED,
            "Account no longer exists".into(),
        )),
        Err(e) => Err(store_unavailable(e)),
    }
}

#[instrument(skip(state, payload))]
pub async fn save_stamps(
    State(state): State<AppState>,
    SessionUser(name): SessionUser,
    Json(payload): Json<SaveStampsRequest>,
) -> Result<Json<StampsResponse>, (StatusCode, String)> {
    let set: BTreeSet<u32> = payload.stamps.into_iter().collect();
    match state.store.save_stamps(&name, &set).await {
        Ok(()) => {
            info!(name = %name, count = set.len(), "stamps saved");
            Ok(Json(StampsResponse {
                stamps: set.into_iter().collect(),
            }))
        }
        Err(StoreError::NotFound) => Err((
            StatusCode::UNAUTHORIZED,
            "Account no longer exists".into(),
        )),
        Err(e) => Err(store_unavailable(e)),
    }
}

#[instrument(skip(state))]
pub async fn clear_stamps(
    State(state): State<AppState>,
    SessionUser(name): SessionUser,
) -> Result<Json<StampsResponse>, (StatusCode, String)> {
    match state.store.save_stamps(&name, &BTreeSet::new()).await {
        Ok(()) => {
            info!(name = %name, "stamps cleared");
            Ok(Json(StampsResponse { stamps: Vec::new() }))
        }
        Err(StoreError::NotFound) => Err((
            StatusCode::UNAUTHORIZED,
            "Account no longer exists".into(),
        )),
        Err(e) => Err(store_unavailable(e)),
    }
}
