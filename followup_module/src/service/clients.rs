use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::engine::types::{Client, ClientStatus};

use super::error::{blocking, ApiError};
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub(super) struct ClientIdParams {
    id: Option<Uuid>,
}

pub(super) async fn list(State(state): State<AppState>) -> Result<Json<Vec<Client>>, ApiError> {
    let clients = blocking(move || {
        state
            .store
            .list_clients()
            .map_err(|err| ApiError::from_store("list clients", err))
    })
    .await?;
    Ok(Json(clients))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct CreateClientRequest {
    company_name: String,
    lead_name: String,
    email: String,
    status: Option<ClientStatus>,
    last_contact_date: Option<DateTime<Utc>>,
    next_follow_up: Option<DateTime<Utc>>,
    pipedrive_org_id: Option<i64>,
    pipedrive_person_id: Option<i64>,
    pipedrive_deal_id: Option<i64>,
}

pub(super) async fn create(
    State(state): State<AppState>,
    Json(request): Json<CreateClientRequest>,
) -> Result<Json<Client>, ApiError> {
    if request.company_name.trim().is_empty() || request.lead_name.trim().is_empty() {
        return Err(ApiError::BadRequest(
            "companyName and leadName are required".to_string(),
        ));
    }
    if !request.email.contains('@') {
        return Err(ApiError::BadRequest(
            "email must be an email address".to_string(),
        ));
    }

    let now = Utc::now();
    let client = Client {
        id: Uuid::new_v4(),
        company_name: request.company_name.trim().to_string(),
        lead_name: request.lead_name.trim().to_string(),
        email: request.email.trim().to_string(),
        status: request.status.unwrap_or(ClientStatus::New),
        last_contact_date: request.last_contact_date.unwrap_or(now),
        next_follow_up: request.next_follow_up,
        pipedrive_org_id: request.pipedrive_org_id,
        pipedrive_person_id: request.pipedrive_person_id,
        pipedrive_deal_id: request.pipedrive_deal_id,
        created_at: now,
        updated_at: now,
    };
    validate_follow_up_dates(&client)?;

    let client = blocking(move || {
        state
            .store
            .insert_client(&client)
            .map_err(|err| ApiError::from_store("create client", err))?;
        Ok(client)
    })
    .await?;
    Ok(Json(client))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpdateClientRequest {
    company_name: Option<String>,
    lead_name: Option<String>,
    email: Option<String>,
    status: Option<ClientStatus>,
    last_contact_date: Option<DateTime<Utc>>,
    next_follow_up: Option<DateTime<Utc>>,
    pipedrive_org_id: Option<i64>,
    pipedrive_person_id: Option<i64>,
    pipedrive_deal_id: Option<i64>,
}

pub(super) async fn update(
    State(state): State<AppState>,
    Query(params): Query<ClientIdParams>,
    Json(request): Json<UpdateClientRequest>,
) -> Result<Json<Client>, ApiError> {
    let id = params
        .id
        .ok_or_else(|| ApiError::BadRequest("client id is required".to_string()))?;

    let client = blocking(move || {
        let mut client = state
            .store
            .get_client(id)
            .map_err(|err| ApiError::from_store("load client", err))?
            .ok_or(ApiError::NotFound("client not found"))?;

        if let Some(company_name) = request.company_name {
            client.company_name = company_name;
        }
        if let Some(lead_name) = request.lead_name {
            client.lead_name = lead_name;
        }
        if let Some(email) = request.email {
            if !email.contains('@') {
                return Err(ApiError::BadRequest(
                    "email must be an email address".to_string(),
                ));
            }
            client.email = email;
        }
        if let Some(status) = request.status {
            client.status = status;
        }
        if let Some(last_contact_date) = request.last_contact_date {
            client.last_contact_date = last_contact_date;
        }
        if let Some(next_follow_up) = request.next_follow_up {
            client.next_follow_up = Some(next_follow_up);
        }
        if request.pipedrive_org_id.is_some() {
            client.pipedrive_org_id = request.pipedrive_org_id;
        }
        if request.pipedrive_person_id.is_some() {
            client.pipedrive_person_id = request.pipedrive_person_id;
        }
        if request.pipedrive_deal_id.is_some() {
            client.pipedrive_deal_id = request.pipedrive_deal_id;
        }
        client.updated_at = Utc::now();
        validate_follow_up_dates(&client)?;

        if !state
            .store
            .update_client(&client)
            .map_err(|err| ApiError::from_store("update client", err))?
        {
            return Err(ApiError::NotFound("client not found"));
        }
        Ok(client)
    })
    .await?;
    Ok(Json(client))
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Query(params): Query<ClientIdParams>,
) -> Result<Json<Value>, ApiError> {
    let id = params
        .id
        .ok_or_else(|| ApiError::BadRequest("client id is required".to_string()))?;

    blocking(move || {
        if !state
            .store
            .delete_client(id)
            .map_err(|err| ApiError::from_store("delete client", err))?
        {
            return Err(ApiError::NotFound("client not found"));
        }
        Ok(())
    })
    .await?;
    Ok(Json(json!({ "success": true })))
}

fn validate_follow_up_dates(client: &Client) -> Result<(), ApiError> {
    if let Some(next_follow_up) = client.next_follow_up {
        if next_follow_up < client.last_contact_date {
            return Err(ApiError::BadRequest(
                "nextFollowUp must not be before lastContactDate".to_string(),
            ));
        }
    }
    Ok(())
}
