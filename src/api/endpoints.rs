//! Typed surface over the DonePin REST API.
//!
//! Reads go straight through the transport and seed the cache with the
//! authoritative response. Mutations go through the sync coordinator,
//! which owns the optimistic-update/queue/rollback protocol.

use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::api::transport::{ApiRequest, Method, Transport};
use crate::api::types::{
  Analytics, AuthResponse, CreateNoteRequest, CreatePersonRequest, CreateTagRequest,
  CreateTaskRequest, LoginRequest, Note, Person, RegisterRequest, SearchRequest, SearchResponse,
  Tag, Task, TasksBoardResponse, UpdateTaskRequest, User,
};
use crate::store::AuthStore;
use crate::sync::{MutationOutcome, SyncCoordinator};

pub struct Api {
  transport: Arc<dyn Transport>,
  coordinator: SyncCoordinator,
  auth: AuthStore,
}

impl Api {
  pub fn new(transport: Arc<dyn Transport>, coordinator: SyncCoordinator, auth: AuthStore) -> Self {
    Self {
      transport,
      coordinator,
      auth,
    }
  }

  pub fn coordinator(&self) -> &SyncCoordinator {
    &self.coordinator
  }

  // Auth. Credentials are never queued; logging in while offline is an
  // immediate failure.

  pub async fn login(&self, email: &str, password: &str) -> Result<User> {
    let body = serde_json::to_value(LoginRequest {
      email: email.to_string(),
      password: password.to_string(),
    })?;
    let response = self
      .transport
      .send(&ApiRequest::new(Method::Post, "/auth/login", Some(body)))
      .await?;
    let auth: AuthResponse = parse(response)?;
    self.auth.set_token(&auth.access_token)?;
    Ok(auth.user)
  }

  pub async fn register(&self, email: &str, password: &str, name: Option<String>) -> Result<User> {
    let body = serde_json::to_value(RegisterRequest {
      email: email.to_string(),
      password: password.to_string(),
      name,
    })?;
    let response = self
      .transport
      .send(&ApiRequest::new(Method::Post, "/auth/register", Some(body)))
      .await?;
    let auth: AuthResponse = parse(response)?;
    self.auth.set_token(&auth.access_token)?;
    Ok(auth.user)
  }

  pub fn logout(&self) -> Result<()> {
    self.auth.clear_token()
  }

  // Notes

  pub async fn get_notes(&self) -> Result<Vec<Note>> {
    self.fetch_list("/notes").await
  }

  pub async fn create_note(&self, content: &str) -> Result<MutationOutcome> {
    let body = serde_json::to_value(CreateNoteRequest {
      content: content.to_string(),
    })?;
    self.coordinator.submit(Method::Post, "/notes", Some(body)).await
  }

  pub async fn delete_note(&self, id: &str) -> Result<MutationOutcome> {
    self
      .coordinator
      .submit(Method::Delete, &format!("/notes/{id}"), None)
      .await
  }

  /// Turn a captured note into a task.
  pub async fn convert_note(&self, id: &str) -> Result<MutationOutcome> {
    self
      .coordinator
      .submit(Method::Post, &format!("/notes/{id}/convert"), None)
      .await
  }

  // Tasks

  pub async fn get_tasks(&self) -> Result<Vec<Task>> {
    self.fetch_list("/tasks").await
  }

  pub async fn get_task(&self, id: &str) -> Result<Task> {
    let endpoint = format!("/tasks/{id}");
    let response = self.transport.send(&ApiRequest::get(&endpoint)).await?;
    self.coordinator.refresh(&endpoint, response.clone());
    parse(response)
  }

  pub async fn create_task(&self, request: &CreateTaskRequest) -> Result<MutationOutcome> {
    let body = serde_json::to_value(request)?;
    self.coordinator.submit(Method::Post, "/tasks", Some(body)).await
  }

  pub async fn update_task(&self, id: &str, request: &UpdateTaskRequest) -> Result<MutationOutcome> {
    let body = serde_json::to_value(request)?;
    self
      .coordinator
      .submit(Method::Patch, &format!("/tasks/{id}"), Some(body))
      .await
  }

  pub async fn delete_task(&self, id: &str) -> Result<MutationOutcome> {
    self
      .coordinator
      .submit(Method::Delete, &format!("/tasks/{id}"), None)
      .await
  }

  /// Tasks grouped by board column.
  pub async fn get_board(&self) -> Result<TasksBoardResponse> {
    let response = self.transport.send(&ApiRequest::get("/tasks/board")).await?;
    parse(response)
  }

  // Tags

  pub async fn get_tags(&self) -> Result<Vec<Tag>> {
    self.fetch_list("/tags").await
  }

  pub async fn create_tag(&self, name: &str, color: &str) -> Result<MutationOutcome> {
    let body = serde_json::to_value(CreateTagRequest {
      name: name.to_string(),
      color: color.to_string(),
    })?;
    self.coordinator.submit(Method::Post, "/tags", Some(body)).await
  }

  pub async fn delete_tag(&self, id: &str) -> Result<MutationOutcome> {
    self
      .coordinator
      .submit(Method::Delete, &format!("/tags/{id}"), None)
      .await
  }

  // People

  pub async fn get_people(&self) -> Result<Vec<Person>> {
    self.fetch_list("/people").await
  }

  pub async fn create_person(&self, name: &str, email: Option<String>) -> Result<MutationOutcome> {
    let body = serde_json::to_value(CreatePersonRequest {
      name: name.to_string(),
      email,
    })?;
    self.coordinator.submit(Method::Post, "/people", Some(body)).await
  }

  // Search & analytics

  /// POST by shape, but a read by nature: goes straight to the transport.
  pub async fn search(&self, query: &str) -> Result<SearchResponse> {
    let body = serde_json::to_value(SearchRequest {
      query: query.to_string(),
    })?;
    let response = self
      .transport
      .send(&ApiRequest::new(Method::Post, "/search", Some(body)))
      .await?;
    parse(response)
  }

  pub async fn get_analytics(&self) -> Result<Analytics> {
    let response = self.transport.send(&ApiRequest::get("/analytics")).await?;
    parse(response)
  }

  /// Fetch a collection and seed the cache entry for each element.
  async fn fetch_list<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Vec<T>> {
    let response = self.transport.send(&ApiRequest::get(endpoint)).await?;
    if let Some(items) = response.as_array() {
      for item in items {
        if let Some(id) = item.get("id").and_then(Value::as_str) {
          self
            .coordinator
            .refresh(&format!("{endpoint}/{id}"), item.clone());
        }
      }
    }
    parse(response)
  }
}

fn parse<T: DeserializeOwned>(value: Value) -> Result<T> {
  serde_json::from_value(value).map_err(|e| eyre!("Unexpected response shape: {}", e))
}
