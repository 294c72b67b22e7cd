use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    codes::{CodeRequest, Ledger, RecordError, allocate},
    error::AppError,
    state::AppState,
};

#[derive(Deserialize)]
pub struct RegisterVehicle {
    pub year: i32,
    pub plate: String,
}

#[derive(Serialize)]
pub struct RegisteredVehicle {
    pub code: String,
}

#[derive(Serialize)]
pub struct Verification {
    pub code: String,
    pub registered: bool,
}

pub async fn register_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RegisterVehicle>,
) -> Result<impl IntoResponse, AppError> {
    let request = CodeRequest {
        year: payload.year,
        plate: payload.plate,
    };

    let allocated = allocate(&state.ledger, state.config.scan_timeout(), &request).await?;

    match state.ledger.record_code(&allocated.code, request.year).await {
        Ok(()) => {
            info!("Registered vehicle {}", allocated.code);

            Ok((
                StatusCode::CREATED,
                Json(RegisteredVehicle {
                    code: allocated.code,
                }),
            ))
        }
        Err(RecordError::Duplicate) => Err(AppError::CodeConflict(allocated.code)),
        Err(RecordError::Ledger(ledger_error)) => {
            Err(AppError::InternalError(Box::new(ledger_error)))
        }
    }
}

pub async fn verify_handler(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let registered = state
        .ledger
        .exists(&code)
        .await
        .map_err(|ledger_error| AppError::InternalError(Box::new(ledger_error)))?;

    Ok(Json(Verification { code, registered }))
}
