//! Domain types and request/response DTOs for the DonePin API.
//!
//! Field names follow the server's camelCase JSON convention.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Task pipeline state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
  Inbox,
  Todo,
  InProgress,
  Blocked,
  Done,
}

impl TaskStatus {
  pub fn label(&self) -> &'static str {
    match self {
      TaskStatus::Inbox => "Inbox",
      TaskStatus::Todo => "Todo",
      TaskStatus::InProgress => "In Progress",
      TaskStatus::Blocked => "Blocked",
      TaskStatus::Done => "Done",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskPriority {
  Low,
  Medium,
  High,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
  pub id: String,
  pub name: String,
  pub color: String,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
  pub id: String,
  pub name: String,
  pub email: Option<String>,
  pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Note {
  pub id: String,
  pub content: String,
  pub created_at: DateTime<Utc>,
  /// Set once the note has been converted into a task.
  pub converted_at: Option<DateTime<Utc>>,
  pub task_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
  pub id: String,
  pub title: String,
  pub description: Option<String>,
  pub status: TaskStatus,
  pub priority: TaskPriority,
  #[serde(default)]
  pub tags: Vec<Tag>,
  #[serde(default)]
  pub assignees: Vec<Person>,
  pub due_date: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
  pub note_id: Option<String>,
}

// Auth

#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
  pub email: String,
  pub password: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
  pub email: String,
  pub password: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
  pub id: String,
  pub email: String,
  pub name: Option<String>,
  #[serde(default)]
  pub roles: Vec<String>,
  pub org_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
  pub access_token: String,
  pub user: User,
}

// Notes

#[derive(Debug, Clone, Serialize)]
pub struct CreateNoteRequest {
  pub content: String,
}

// Tasks

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskRequest {
  pub title: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<TaskPriority>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub note_id: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<TaskStatus>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub priority: Option<TaskPriority>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag_ids: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub assignee_ids: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub due_date: Option<DateTime<Utc>>,
}

// Board

/// Status vocabulary of the board endpoint. The board view has no inbox
/// column, and the server spells these differently from [`TaskStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BoardStatus {
  Todo,
  InProgress,
  Blocked,
  Done,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoardTask {
  pub id: String,
  pub title: String,
  pub description: Option<String>,
  pub status: BoardStatus,
  pub priority: Option<TaskPriority>,
  pub due_date: Option<DateTime<Utc>>,
  pub blocker_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksBoardResponse {
  #[serde(rename = "TODO", default)]
  pub todo: Vec<BoardTask>,
  #[serde(rename = "IN_PROGRESS", default)]
  pub in_progress: Vec<BoardTask>,
  #[serde(rename = "BLOCKED", default)]
  pub blocked: Vec<BoardTask>,
  #[serde(rename = "DONE", default)]
  pub done: Vec<BoardTask>,
}

// Tags & people

#[derive(Debug, Clone, Serialize)]
pub struct CreateTagRequest {
  pub name: String,
  pub color: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreatePersonRequest {
  pub name: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub email: Option<String>,
}

// Search

#[derive(Debug, Clone, Serialize)]
pub struct SearchRequest {
  pub query: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchResponse {
  #[serde(default)]
  pub tasks: Vec<Task>,
  #[serde(default)]
  pub notes: Vec<Note>,
}

// Analytics

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analytics {
  pub total_tasks: u64,
  pub completed_tasks: u64,
  pub in_progress_tasks: u64,
  pub tasks_completed_today: u64,
  /// Average time from creation to done, in minutes.
  pub average_completion_time: f64,
}
