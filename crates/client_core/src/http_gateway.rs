use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, CONTENT_TYPE},
    Client, RequestBuilder, StatusCode,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{Todo, TodoId},
    error::{ApiErrorBody, ApiException},
    protocol::{CreateTodoRequest, OperationAck, UpdateTodoRequest},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::ClientSettings,
    gateway::{GatewayError, TodoGateway},
    session::AuthSession,
};

/// [`TodoGateway`] over the backend's JSON HTTP API.
pub struct HttpGateway {
    http: Client,
    base_url: Url,
    session: Arc<AuthSession>,
}

impl HttpGateway {
    pub fn new(base_url: Url, timeout: Duration, session: Arc<AuthSession>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let http = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            http,
            base_url,
            session,
        })
    }

    pub fn from_settings(settings: &ClientSettings, session: Arc<AuthSession>) -> Result<Self> {
        Self::new(settings.api_base_url()?, settings.request_timeout(), session)
    }

    fn todos_url(&self, id: Option<&TodoId>) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                GatewayError::from(ApiException::request_setup())
            })?;
            segments.pop_if_empty().push("todos");
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        Ok(url)
    }

    async fn execute<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        let request = match self.session.token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        };

        let response = request.send().await.map_err(|err| {
            if err.is_builder() {
                warn!(%err, "todos: request setup failed");
                ApiException::request_setup()
            } else {
                warn!(%err, "todos: no response from server");
                ApiException::no_response()
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<T>()
                .await
                .map_err(|err| GatewayError::InvalidResponse(err.to_string()));
        }

        let body = response
            .text()
            .await
            .ok()
            .and_then(|raw| serde_json::from_str::<ApiErrorBody>(&raw).ok());
        let error = ApiException::from_response(status.as_u16(), body);
        debug!(status = status.as_u16(), message = %error.message, "todos: error response");

        if status == StatusCode::UNAUTHORIZED {
            self.session.invalidate().await;
        }

        Err(error.into())
    }
}

fn ensure_canonical(id: &TodoId) -> Result<(), GatewayError> {
    if id.is_placeholder() {
        return Err(GatewayError::InvalidResponse(format!(
            "backend issued id '{id}' inside the placeholder id space"
        )));
    }
    Ok(())
}

#[async_trait]
impl TodoGateway for HttpGateway {
    async fn list(&self) -> Result<Vec<Todo>, GatewayError> {
        let todos: Vec<Todo> = self.execute(self.http.get(self.todos_url(None)?)).await?;
        for todo in &todos {
            ensure_canonical(&todo.id)?;
        }
        debug!(count = todos.len(), "todos: fetched list");
        Ok(todos)
    }

    async fn get(&self, id: &TodoId) -> Result<Todo, GatewayError> {
        let todo: Todo = self.execute(self.http.get(self.todos_url(Some(id))?)).await?;
        ensure_canonical(&todo.id)?;
        Ok(todo)
    }

    async fn create(&self, input: &CreateTodoRequest) -> Result<OperationAck, GatewayError> {
        let ack: OperationAck = self
            .execute(self.http.post(self.todos_url(None)?).json(input))
            .await?;
        ensure_canonical(&ack.todo_id)?;
        info!(todo_id = %ack.todo_id, message = %ack.message, "todos: create queued");
        Ok(ack)
    }

    async fn update(
        &self,
        id: &TodoId,
        patch: &UpdateTodoRequest,
    ) -> Result<OperationAck, GatewayError> {
        let ack: OperationAck = self
            .execute(self.http.put(self.todos_url(Some(id))?).json(patch))
            .await?;
        ensure_canonical(&ack.todo_id)?;
        info!(todo_id = %ack.todo_id, message = %ack.message, "todos: update queued");
        Ok(ack)
    }

    async fn delete(&self, id: &TodoId) -> Result<OperationAck, GatewayError> {
        let ack: OperationAck = self
            .execute(self.http.delete(self.todos_url(Some(id))?))
            .await?;
        ensure_canonical(&ack.todo_id)?;
        info!(todo_id = %ack.todo_id, message = %ack.message, "todos: delete queued");
        Ok(ack)
    }
}
